//! The refresh decision engine: should a change re-run a subscription's
//! query?
//!
//! Every decision starts with the tracked-column gate — at least one
//! changed column must be one the query reads. Past the gate the
//! subscription's [`RefreshPolicy`] decides: the default says yes, a
//! [`FilterMap`](RefreshPolicy::FilterMap) narrows by per-table column
//! matchers, and a [`Predicate`](RefreshPolicy::Predicate) delegates to
//! caller code.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use sqlx::PgPool;

use crate::decode::RowChange;
use crate::error::Result;
use crate::result::ResultRows;
use crate::table::QualifiedTable;

/// A filter-map matcher for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
   /// Matches when the column's notification values contain this literal
   /// (which may be null).
   Literal(JsonValue),
   /// Matches when the column's notification values intersect the values
   /// the named column takes in the current result. An empty result never
   /// matches.
   ResultColumn(String),
}

/// Verdict returned by a refresh predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateVerdict {
   /// Re-run the query.
   Refresh,
   /// Ignore this change.
   Skip,
   /// Defer to the tracked-column gate — which already passed, so the
   /// query is re-run.
   TrackedColumns,
}

/// Caller-supplied refresh predicate.
///
/// Invoked inline on the dispatcher task with the subscription's
/// connection, the current result (if any has been published), and the
/// decoded change. It may issue lookup queries on the connection but must
/// not block indefinitely; it is not throttled. An error counts as a
/// "don't refresh" and is reported to the system error handler.
pub type RefreshPredicate = Arc<
   dyn Fn(PgPool, Option<ResultRows>, RowChange) -> BoxFuture<'static, Result<PredicateVerdict>>
      + Send
      + Sync,
>;

/// Per-table column matchers: table → (column → matcher).
pub type FilterMap = HashMap<QualifiedTable, HashMap<String, Matcher>>;

/// When to re-run a subscription's query for a decoded change.
#[derive(Clone, Default)]
pub enum RefreshPolicy {
   /// Refresh whenever a tracked column changed (the gate alone decides).
   #[default]
   TrackedColumns,
   /// Refresh when any per-column matcher for the changed table passes;
   /// tables absent from the map behave like [`TrackedColumns`](Self::TrackedColumns).
   FilterMap(FilterMap),
   /// Refresh when the caller's predicate says so.
   Predicate(RefreshPredicate),
}

impl std::fmt::Debug for RefreshPolicy {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      match self {
         RefreshPolicy::TrackedColumns => write!(f, "TrackedColumns"),
         RefreshPolicy::FilterMap(map) => f.debug_tuple("FilterMap").field(map).finish(),
         RefreshPolicy::Predicate(_) => write!(f, "Predicate(..)"),
      }
   }
}

/// Decides whether a change must re-run the query.
pub(crate) async fn should_refresh(
   pool: &PgPool,
   current: Option<ResultRows>,
   watched: Option<&HashSet<String>>,
   policy: &RefreshPolicy,
   change: &RowChange,
) -> Result<bool> {
   // Tracked-column gate, applied before any policy. For INSERT/DELETE the
   // change set covers every column of the row, so the gate reduces to
   // "does the subscription watch any column of this table".
   let gate_passed = match watched {
      Some(watched) => change.changes.keys().any(|col| watched.contains(col)),
      None => false,
   };
   if !gate_passed {
      return Ok(false);
   }

   match policy {
      RefreshPolicy::TrackedColumns => Ok(true),
      RefreshPolicy::FilterMap(map) => Ok(filter_map_passes(map, current.as_deref(), change)),
      RefreshPolicy::Predicate(predicate) => {
         let verdict = predicate(pool.clone(), current, change.clone()).await?;
         Ok(match verdict {
            PredicateVerdict::Refresh | PredicateVerdict::TrackedColumns => true,
            PredicateVerdict::Skip => false,
         })
      }
   }
}

fn filter_map_passes(
   map: &FilterMap,
   current: Option<&Vec<crate::result::Row>>,
   change: &RowChange,
) -> bool {
   let Some(matchers) = map.get(&change.table) else {
      // no entry for this table: behave like the default policy
      return true;
   };

   matchers.iter().any(|(column, matcher)| {
      let candidates = notification_values(change, column);
      if candidates.is_empty() {
         return false;
      }
      match matcher {
         Matcher::Literal(value) => candidates.iter().any(|c| *c == value),
         Matcher::ResultColumn(result_column) => {
            let Some(rows) = current else {
               return false;
            };
            rows
               .iter()
               .filter_map(|row| row.get(result_column))
               .any(|value| candidates.contains(&value))
         }
      }
   })
}

/// Every value associated with a column in a change: the row image plus
/// both sides of the old/new pair.
fn notification_values<'c>(change: &'c RowChange, column: &str) -> Vec<&'c JsonValue> {
   let mut values = Vec::with_capacity(3);
   if let Some(value) = change.row.get(column) {
      values.push(value);
   }
   if let Some((old, new)) = change.changes.get(column) {
      values.push(old);
      values.push(new);
   }
   values
}
