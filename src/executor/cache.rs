//! Per-request memoization of cacheable statements

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use serde_json::json;

use crate::plan::Row;

use super::errors::ExecutorResult;
use super::executor::{RowStream, SqlExecutor, SqlRequest};

/// Wraps an executor and answers repeated `execute_with_cache` calls with
/// the same context, text and values from memory.
///
/// Uncached and streaming calls always reach the inner executor.
pub struct CachingExecutor<E> {
    inner: E,
    entries: Mutex<HashMap<String, Vec<Row>>>,
    hits: AtomicU64,
}

impl<E: SqlExecutor> CachingExecutor<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Calls answered from memory
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn cache_key(request: &SqlRequest) -> String {
        json!([request.context, request.text, request.values]).to_string()
    }

    fn lookup(&self, key: &str) -> Option<Vec<Row>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    fn store(&self, key: String, rows: Vec<Row>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, rows);
    }
}

impl<E: SqlExecutor> SqlExecutor for CachingExecutor<E> {
    fn execute_with_cache<'a>(&'a self, request: SqlRequest) -> BoxFuture<'a, ExecutorResult<Vec<Row>>> {
        Box::pin(async move {
            let key = Self::cache_key(&request);
            if let Some(rows) = self.lookup(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(rows);
            }
            let rows = self.inner.execute_with_cache(request).await?;
            self.store(key, rows.clone());
            Ok(rows)
        })
    }

    fn execute_without_cache<'a>(&'a self, request: SqlRequest) -> BoxFuture<'a, ExecutorResult<Vec<Row>>> {
        self.inner.execute_without_cache(request)
    }

    fn execute_stream<'a>(&'a self, request: SqlRequest) -> BoxFuture<'a, ExecutorResult<RowStream>> {
        self.inner.execute_stream(request)
    }
}
