//! Scripted executor shared by the integration tests
//!
//! Replies are chosen by the first route whose needle occurs in the SQL
//! text. Batched replies decode the bound key array from the request
//! values and append the key index to every row, the way the compiled
//! queries do.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};

use selectplan::executor::{ExecutorError, ExecutorResult, RowStream, SqlExecutor, SqlRequest};
use selectplan::plan::Row;

pub type Responder = Box<dyn Fn(&SqlRequest) -> Vec<Row> + Send + Sync>;

pub struct ScriptedExecutor {
    routes: Vec<(String, Responder)>,
    streams: Vec<(String, Responder)>,
    requests: Mutex<Vec<(&'static str, SqlRequest)>>,
    stream_rows_read: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            streams: Vec::new(),
            requests: Mutex::new(Vec::new()),
            stream_rows_read: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reply for cached and uncached statements containing `needle`
    pub fn route<F>(mut self, needle: &str, responder: F) -> Self
    where
        F: Fn(&SqlRequest) -> Vec<Row> + Send + Sync + 'static,
    {
        self.routes.push((needle.to_string(), Box::new(responder)));
        self
    }

    /// Reply for cursors opened over statements containing `needle`
    pub fn stream_route<F>(mut self, needle: &str, responder: F) -> Self
    where
        F: Fn(&SqlRequest) -> Vec<Row> + Send + Sync + 'static,
    {
        self.streams.push((needle.to_string(), Box::new(responder)));
        self
    }

    /// Requests received so far, tagged `cached`, `uncached` or `stream`
    pub fn requests(&self) -> Vec<(&'static str, SqlRequest)> {
        self.requests.lock().unwrap().clone()
    }

    /// Rows pulled out of opened cursors
    pub fn stream_rows_read(&self) -> usize {
        self.stream_rows_read.load(Ordering::SeqCst)
    }

    fn reply(
        &self,
        kind: &'static str,
        routes: &[(String, Responder)],
        request: SqlRequest,
    ) -> ExecutorResult<Vec<Row>> {
        let rows = routes
            .iter()
            .find(|(needle, _)| request.text.contains(needle.as_str()))
            .map(|(_, responder)| responder(&request));
        self.requests.lock().unwrap().push((kind, request.clone()));
        rows.ok_or_else(|| ExecutorError::database(format!("no scripted reply for:\n{}", request.text)))
    }
}

impl SqlExecutor for ScriptedExecutor {
    fn execute_with_cache<'a>(&'a self, request: SqlRequest) -> BoxFuture<'a, ExecutorResult<Vec<Row>>> {
        Box::pin(async move { self.reply("cached", &self.routes, request) })
    }

    fn execute_without_cache<'a>(&'a self, request: SqlRequest) -> BoxFuture<'a, ExecutorResult<Vec<Row>>> {
        Box::pin(async move { self.reply("uncached", &self.routes, request) })
    }

    fn execute_stream<'a>(&'a self, request: SqlRequest) -> BoxFuture<'a, ExecutorResult<RowStream>> {
        Box::pin(async move {
            let rows = self.reply("stream", &self.streams, request)?;
            let read = Arc::clone(&self.stream_rows_read);
            let stream = stream::iter(rows.into_iter().map(Ok)).inspect(move |_| {
                read.fetch_add(1, Ordering::SeqCst);
            });
            Ok(stream.boxed())
        })
    }
}

/// The JSON key array bound into a batched request
pub fn bound_keys(request: &SqlRequest) -> Vec<Row> {
    request
        .values
        .iter()
        .find_map(|value| match value {
            Value::Array(keys) if keys.iter().all(Value::is_array) => Some(
                keys.iter()
                    .map(|key| key.as_array().cloned().unwrap_or_default())
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_default()
}

/// Rows per key, keyed by the first key component
pub fn table(rows: &[(i64, Vec<Row>)]) -> HashMap<i64, Vec<Row>> {
    rows.iter().cloned().collect()
}

/// Replies with `table[key]` for every bound key, skipping `skip` rows and
/// keeping at most `take`, with the key index appended
pub fn per_key(
    table: HashMap<i64, Vec<Row>>,
    skip: usize,
    take: Option<usize>,
) -> impl Fn(&SqlRequest) -> Vec<Row> + Send + Sync + 'static {
    move |request| {
        let mut out = Vec::new();
        for (idx, key) in bound_keys(request).iter().enumerate() {
            let id = key.first().and_then(Value::as_i64).unwrap_or_default();
            let rows = table.get(&id).cloned().unwrap_or_default();
            for mut row in rows.into_iter().skip(skip).take(take.unwrap_or(usize::MAX)) {
                row.push(json!(idx));
                out.push(row);
            }
        }
        out
    }
}

/// Single-column rows from strings
pub fn titles(titles: &[&str]) -> Vec<Row> {
    titles.iter().map(|t| vec![json!(t)]).collect()
}
