//! Cursor encoding and tie-break predicates
//!
//! A cursor is `base64(json([digest, v0, .., vn-1]))` where `digest` is a
//! truncated SHA-256 of the compiled ORDER BY text. The digest ties a
//! cursor to the ordering that produced it.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::errors::{PlanError, PlanResult};
use super::select::{Direction, NullsOrder, OrderSpec, PlaceholderSpec};
use crate::observability::{log_event_with_fields, Event};
use crate::sql::{self, compile, CompileContext, SqlFragment, Symbol};

/// Side of the cursor that rows are taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    After,
    Before,
}

/// Renders one ORDER BY term
pub(crate) fn order_term(order: &OrderSpec) -> SqlFragment {
    let direction = match order.direction {
        Direction::Asc => " asc",
        Direction::Desc => " desc",
    };
    let mut parts = vec![order.fragment.clone(), sql::raw(direction)];
    match order.nulls {
        Some(NullsOrder::First) => parts.push(sql::raw(" nulls first")),
        Some(NullsOrder::Last) => parts.push(sql::raw(" nulls last")),
        None => {}
    }
    sql::concat(parts)
}

/// Fingerprint of an ordering.
///
/// Placeholders render as their name so the digest does not change when
/// they are later resolved.
pub fn order_digest(
    orders: &[OrderSpec],
    placeholders: &[PlaceholderSpec],
    values: &HashMap<Symbol, SqlFragment>,
    length: usize,
) -> PlanResult<String> {
    let mut names: HashMap<Symbol, SqlFragment> = HashMap::new();
    let symbols = placeholders.iter().map(|p| &p.symbol).chain(values.keys());
    for symbol in symbols {
        names.insert(symbol.clone(), sql::raw(format!("${}", symbol.name())));
    }
    let text = compile(
        &sql::join(orders.iter().map(order_term), ", "),
        &CompileContext::empty().with_placeholders(&names),
    )?
    .text;

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hex: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    Ok(hex.chars().take(length).collect())
}

/// Encodes a cursor for `values` under `digest`
pub fn encode_cursor(digest: &str, values: &[Value]) -> String {
    let mut payload = Vec::with_capacity(values.len() + 1);
    payload.push(Value::String(digest.to_string()));
    payload.extend(values.iter().cloned());
    STANDARD.encode(Value::Array(payload).to_string())
}

/// Decodes a cursor, checking digest and arity.
///
/// Every failure maps to the same user-facing error.
pub fn decode_cursor(cursor: &str, digest: &str, arity: usize) -> PlanResult<Vec<Value>> {
    match try_decode(cursor, digest, arity) {
        Ok(values) => Ok(values),
        Err(reason) => {
            log_event_with_fields(
                Event::CursorRejected,
                &[("reason", reason), ("expected_digest", digest)],
            );
            Err(PlanError::invalid_cursor())
        }
    }
}

fn try_decode(cursor: &str, digest: &str, arity: usize) -> Result<Vec<Value>, &'static str> {
    let bytes = STANDARD.decode(cursor.trim()).map_err(|_| "base64")?;
    let payload: Value = serde_json::from_slice(&bytes).map_err(|_| "json")?;
    let mut items = match payload {
        Value::Array(items) => items,
        _ => return Err("not_array"),
    };
    if items.is_empty() {
        return Err("arity");
    }
    match items.remove(0) {
        Value::String(found) if found == digest => {}
        _ => return Err("digest"),
    }
    if items.len() != arity {
        return Err("arity");
    }
    Ok(items)
}

/// Tie-break predicate selecting rows strictly past the cursor:
/// `cmp_0 or (col_0 = v_0 and (cmp_1 or (...)))`
///
/// `orders` is non-empty and `values` holds one entry per order, as
/// `decode_cursor` guarantees.
pub(crate) fn cursor_condition(orders: &[OrderSpec], values: &[Value], kind: CursorKind) -> SqlFragment {
    build_condition(orders, values, kind, 0)
}

fn build_condition(
    orders: &[OrderSpec],
    values: &[Value],
    kind: CursorKind,
    index: usize,
) -> SqlFragment {
    let order = &orders[index];
    let greater = matches!(
        (order.direction, kind),
        (Direction::Asc, CursorKind::After) | (Direction::Desc, CursorKind::Before)
    );
    let comparison = sql::concat(vec![
        order.fragment.clone(),
        sql::raw(if greater { " > " } else { " < " }),
        sql::value(values[index].clone()),
    ]);
    if index + 1 == orders.len() {
        return comparison;
    }
    sql::parens(sql::concat(vec![
        comparison,
        sql::raw(" or ("),
        order.fragment.clone(),
        sql::raw(" = "),
        sql::value(values[index].clone()),
        sql::raw(" and "),
        build_condition(orders, values, kind, index + 1),
        sql::raw(")"),
    ]))
}
