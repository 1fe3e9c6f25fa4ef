//! Batch execution of finalized plans
//!
//! One compiled query serves every entry of a batch. Execution flow:
//!
//! 1. Group entries by request context
//! 2. Deduplicate key tuples within each group
//! 3. Bind the key array and run the query once per group
//! 4. Route rows back by the identifier-index column, then strip it
//! 5. Flip each entry's rows when the plan paginated from the end

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::observability::{log_event_with_fields, Event, PhaseScope, PlannerMetrics, Severity};
use crate::plan::{CompiledQuery, FinalizeResults, PlanArena, PlanId, Row};

use super::errors::{ExecutorError, ExecutorResult};

/// Rows produced incrementally by a database cursor
pub type RowStream = BoxStream<'static, ExecutorResult<Row>>;

/// One statement handed to the database layer
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRequest {
    /// Request context the statement runs under (role, claims)
    pub context: Value,
    pub text: String,
    pub values: Vec<Value>,
    /// Column holding the key index, for batched statements
    pub identifier_index: Option<usize>,
    /// Keys bound into the statement; zero when unbatched
    pub key_count: usize,
}

/// Database access used by the batch executor
pub trait SqlExecutor: Send + Sync {
    /// Run a statement whose result may be shared within the request
    fn execute_with_cache<'a>(&'a self, request: SqlRequest) -> BoxFuture<'a, ExecutorResult<Vec<Row>>>;

    /// Run a statement that must hit the database
    fn execute_without_cache<'a>(&'a self, request: SqlRequest) -> BoxFuture<'a, ExecutorResult<Vec<Row>>>;

    /// Open a cursor over a statement
    fn execute_stream<'a>(&'a self, request: SqlRequest) -> BoxFuture<'a, ExecutorResult<RowStream>>;
}

/// One caller of a batched plan
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub context: Value,
    /// Key tuple laid out as `FinalizeResults::query_values`
    pub key: Row,
}

impl BatchEntry {
    pub fn new(context: Value, key: Row) -> Self {
        Self { context, key }
    }

    /// Entry for a plan with no key dependencies
    pub fn unkeyed(context: Value) -> Self {
        Self {
            context,
            key: Vec::new(),
        }
    }

    /// Builds the key by looking up each key dependency's value.
    ///
    /// Looked-up values are normalized through the position's codec, so a
    /// parent row read over a text protocol keys the same as a typed one.
    pub fn resolve<F>(results: &FinalizeResults, context: Value, mut lookup: F) -> Self
    where
        F: FnMut(PlanId) -> Value,
    {
        let key = results
            .key_dependencies
            .iter()
            .zip(&results.query_values)
            .map(|(id, value)| value.codec.from_wire(lookup(*id)))
            .collect();
        Self { context, key }
    }
}

/// Entries sharing one context
struct ContextGroup<'e> {
    context: &'e Value,
    members: Vec<usize>,
}

fn group_by_context(entries: &[BatchEntry]) -> Vec<ContextGroup<'_>> {
    let mut groups: Vec<ContextGroup<'_>> = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        match groups.iter_mut().find(|g| *g.context == entry.context) {
            Some(group) => group.members.push(index),
            None => groups.push(ContextGroup {
                context: &entry.context,
                members: vec![index],
            }),
        }
    }
    groups
}

/// Distinct key tuples of a group and, per member, the slot of its key
fn distinct_keys(entries: &[BatchEntry], members: &[usize]) -> (Vec<Row>, Vec<usize>) {
    let mut keys: Vec<Row> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut slots = Vec::with_capacity(members.len());
    for member in members {
        let key = &entries[*member].key;
        let fingerprint = Value::Array(key.clone()).to_string();
        let slot = *seen.entry(fingerprint).or_insert_with(|| {
            keys.push(key.clone());
            keys.len() - 1
        });
        slots.push(slot);
    }
    (keys, slots)
}

/// Key index as returned by the driver; text drivers send it as a string
fn key_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Buckets rows by key index and strips the index column
fn route_rows(results: &FinalizeResults, rows: Vec<Row>, buckets: usize) -> ExecutorResult<Vec<Vec<Row>>> {
    let mut per_key: Vec<Vec<Row>> = vec![Vec::new(); buckets.max(1)];
    for mut row in rows {
        let slot = match results.identifier_index {
            Some(index) => {
                let value = row.get(index).ok_or_else(|| {
                    ExecutorError::Routing(format!("row has no identifier column {}", index))
                })?;
                key_index(value).filter(|slot| *slot < buckets).ok_or_else(|| {
                    ExecutorError::Routing(format!("identifier index {} is out of range", value))
                })?
            }
            None => 0,
        };
        row.truncate(results.column_count);
        per_key[slot].push(row);
    }
    Ok(per_key)
}

/// Runs finalized plans for a batch of entries
pub struct BatchExecutor<'a, E: SqlExecutor> {
    executor: &'a E,
    metrics: Option<Arc<PlannerMetrics>>,
}

impl<'a, E: SqlExecutor> BatchExecutor<'a, E> {
    pub fn new(executor: &'a E) -> Self {
        Self {
            executor,
            metrics: None,
        }
    }

    /// Records batches, rows and streams in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<PlannerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs the plan at `id`, which must already be finalized
    pub async fn execute_plan(
        &self,
        arena: &PlanArena,
        id: PlanId,
        entries: &[BatchEntry],
    ) -> ExecutorResult<Vec<Vec<Row>>> {
        let results = arena
            .finalize_results(id)
            .map_err(|_| ExecutorError::NotFinalized(id))?;
        self.execute(results, entries).await
    }

    /// Rows per entry, in entry order
    pub async fn execute(
        &self,
        results: &FinalizeResults,
        entries: &[BatchEntry],
    ) -> ExecutorResult<Vec<Vec<Row>>> {
        let count = entries.len().to_string();
        let scope = PhaseScope::with_fields("BATCH_EXECUTE", Severity::Trace, &[("entries", &count)]);

        let mut output: Vec<Vec<Row>> = vec![Vec::new(); entries.len()];
        for group in group_by_context(entries) {
            let rows = self
                .run_group(results, &results.query, entries, &group, true)
                .await?;
            for (member, rows) in group.members.iter().zip(rows) {
                output[*member] = rows;
            }
        }
        if results.reverse {
            for rows in &mut output {
                rows.reverse();
            }
        }

        let fetched: usize = output.iter().map(Vec::len).sum();
        let fetched = fetched.to_string();
        log_event_with_fields(
            Event::BatchExecuted,
            &[("entries", &count), ("rows", &fetched)],
        );
        scope.complete(&[("rows", &fetched)]);
        Ok(output)
    }

    /// One stream per entry: the eagerly fetched initial rows followed by
    /// an incremental source over the rest.
    ///
    /// A source whose entry already has its declared row count is dropped
    /// without being read.
    pub async fn stream(
        &self,
        results: &FinalizeResults,
        entries: &[BatchEntry],
    ) -> ExecutorResult<Vec<RowStream>> {
        let queries = results.stream.as_ref().ok_or(ExecutorError::NotStreamable)?;

        let mut initial: Vec<Vec<Row>> = vec![Vec::new(); entries.len()];
        if !queries.initial.is_empty() {
            for group in group_by_context(entries) {
                let rows = self
                    .run_group(results, &queries.initial, entries, &group, false)
                    .await?;
                for (member, rows) in group.members.iter().zip(rows) {
                    initial[*member] = rows;
                }
            }
        }

        let mut streams: Vec<RowStream> = Vec::with_capacity(entries.len());
        for (index, (entry, rows)) in entries.iter().zip(initial).enumerate() {
            let keys = if results.is_batched() {
                vec![entry.key.clone()]
            } else {
                Vec::new()
            };
            let request = SqlRequest {
                context: entry.context.clone(),
                text: queries.cursor.text.clone(),
                values: queries.cursor.bind(&keys),
                identifier_index: results.identifier_index,
                key_count: keys.len(),
            };
            let source = self.executor.execute_stream(request).await?;
            let entry_index = index.to_string();
            if let Some(metrics) = &self.metrics {
                metrics.increment_streams_opened();
            }
            log_event_with_fields(Event::StreamOpened, &[("entry", &entry_index)]);

            let satisfied = queries
                .declared_count
                .map_or(false, |count| rows.len() as u64 >= count);
            let head = stream::iter(rows.into_iter().map(Ok));
            if satisfied {
                drop(source);
                if let Some(metrics) = &self.metrics {
                    metrics.increment_sources_released();
                }
                log_event_with_fields(Event::StreamSourceReleased, &[("entry", &entry_index)]);
                streams.push(head.boxed());
            } else {
                let column_count = results.column_count;
                let tail = source.map(move |row| {
                    row.map(|mut row| {
                        row.truncate(column_count);
                        row
                    })
                });
                streams.push(head.chain(tail).boxed());
            }
        }
        Ok(streams)
    }

    /// Runs `query` once for a context group; rows per member
    async fn run_group(
        &self,
        results: &FinalizeResults,
        query: &CompiledQuery,
        entries: &[BatchEntry],
        group: &ContextGroup<'_>,
        cached: bool,
    ) -> ExecutorResult<Vec<Vec<Row>>> {
        let (keys, slots) = if results.is_batched() {
            distinct_keys(entries, &group.members)
        } else {
            (Vec::new(), vec![0; group.members.len()])
        };
        let request = SqlRequest {
            context: group.context.clone(),
            text: query.text.clone(),
            values: query.bind(&keys),
            identifier_index: results.identifier_index,
            key_count: keys.len(),
        };
        let rows = if cached {
            self.executor.execute_with_cache(request).await?
        } else {
            self.executor.execute_without_cache(request).await?
        };
        if let Some(metrics) = &self.metrics {
            metrics.increment_batches_executed();
            metrics.add_rows_fetched(rows.len() as u64);
        }

        let per_key = route_rows(results, rows, keys.len())?;
        Ok(slots.iter().map(|slot| per_key[*slot].clone()).collect())
    }
}
