//! Page information for paginated results

use serde::Serialize;

use crate::plan::{FinalizeResults, Row};

use super::errors::ExecutorResult;

/// Connection-style page flags and boundary cursors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    /// Cursor of the first returned row, when cursor columns were selected
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

impl PageInfo {
    /// Trims the lookahead row fetched by `fetch_one_extra` and reports
    /// whether it was there.
    ///
    /// `rows` must be one key's rows in presentation order. With `last`
    /// the lookahead row is the first one, otherwise the last.
    pub fn from_rows(results: &FinalizeResults, rows: &mut Vec<Row>) -> ExecutorResult<Self> {
        let mut info = PageInfo::default();
        if let Some(page_size) = results.page_size {
            let page_size = usize::try_from(page_size).unwrap_or(usize::MAX);
            if rows.len() > page_size {
                let extra = rows.len() - page_size;
                if results.backward {
                    rows.drain(..extra);
                    info.has_previous_page = true;
                } else {
                    rows.truncate(page_size);
                    info.has_next_page = true;
                }
            }
        }

        if results.order_digest.is_some() {
            if let Some(first) = rows.first() {
                info.start_cursor = Some(results.cursor_for_row(first)?);
            }
            if let Some(last) = rows.last() {
                info.end_cursor = Some(results.cursor_for_row(last)?);
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::CompiledQuery;
    use serde_json::json;

    fn results(page_size: Option<u64>, backward: bool) -> FinalizeResults {
        FinalizeResults {
            query: CompiledQuery::empty(),
            identifier_index: None,
            query_values: Vec::new(),
            key_dependencies: Vec::new(),
            reverse: backward,
            column_count: 1,
            stream: None,
            cursor_columns: Vec::new(),
            order_digest: None,
            page_size,
            backward,
        }
    }

    fn rows(n: i64) -> Vec<Row> {
        (1..=n).map(|i| vec![json!(i)]).collect()
    }

    #[test]
    fn test_forward_page_trims_tail() {
        let mut fetched = rows(3);
        let info = PageInfo::from_rows(&results(Some(2), false), &mut fetched).unwrap();
        assert!(info.has_next_page);
        assert!(!info.has_previous_page);
        assert_eq!(fetched, rows(2));
    }

    #[test]
    fn test_backward_page_trims_head() {
        let mut fetched = rows(3);
        let info = PageInfo::from_rows(&results(Some(2), true), &mut fetched).unwrap();
        assert!(info.has_previous_page);
        assert_eq!(fetched, vec![vec![json!(2)], vec![json!(3)]]);
    }

    #[test]
    fn test_short_page_has_no_more() {
        let mut fetched = rows(2);
        let info = PageInfo::from_rows(&results(Some(2), false), &mut fetched).unwrap();
        assert_eq!(info, PageInfo::default());
        assert_eq!(fetched.len(), 2);
    }

    #[test]
    fn test_boundary_cursors() {
        let mut results = results(None, false);
        results.cursor_columns = vec![0];
        results.order_digest = Some("abcdef0123".into());
        let mut fetched = rows(3);
        let info = PageInfo::from_rows(&results, &mut fetched).unwrap();
        assert_eq!(
            info.start_cursor,
            Some(crate::plan::encode_cursor("abcdef0123", &[json!(1)]))
        );
        assert_eq!(
            info.end_cursor,
            Some(crate::plan::encode_cursor("abcdef0123", &[json!(3)]))
        );
    }
}
