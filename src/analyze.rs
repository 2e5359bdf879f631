//! Query analysis: deriving which tables and columns a query reads.
//!
//! Analysis piggy-backs on the server: the query is compiled into a
//! temporary view by `_pg_realtime_parse_query` (see [`crate::sql`]) and the
//! view's catalog dependencies are read back. Positional parameter markers
//! are stripped to literal NULLs first so the view compiles without bound
//! parameters; parameter types are irrelevant to dependency analysis.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use sqlx::PgPool;
use tracing::debug;

use crate::error::{Error, Result};
use crate::table::QualifiedTable;

/// The tables and columns a subscription's query reads.
///
/// Derived once at subscribe time and immutable for the life of the
/// subscription.
#[derive(Debug, Clone, Default)]
pub struct WatchSpec {
   /// Tables the query reads.
   pub tables: HashSet<QualifiedTable>,
   /// Columns the query reads, grouped by table.
   pub columns: HashMap<QualifiedTable, HashSet<String>>,
}

impl WatchSpec {
   /// Columns watched on a table (empty set if the table is not watched).
   pub fn columns_for(&self, table: &QualifiedTable) -> Option<&HashSet<String>> {
      self.columns.get(table)
   }
}

static PARAM_MARKER: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"\$\d+").expect("valid parameter-marker pattern"));

/// Replaces every positional parameter marker (`$1`, `$2`, …) with the
/// literal `NULL`.
pub(crate) fn strip_params(sql: &str) -> String {
   PARAM_MARKER.replace_all(sql, "NULL").into_owned()
}

/// Analyzes a query on the given connection and returns its [`WatchSpec`].
///
/// Invalid SQL or unknown relations surface as [`Error::Analysis`]; the
/// caller (subscribe) fails without registering any state.
pub(crate) async fn analyze_query(pool: &PgPool, sql: &str) -> Result<WatchSpec> {
   let stripped = strip_params(sql);

   let rows: Vec<(String, String, Option<String>)> =
      sqlx::query_as("SELECT object_type, tname, cname FROM _pg_realtime_parse_query($1)")
         .bind(&stripped)
         .fetch_all(pool)
         .await
         .map_err(|e| Error::analysis(e.to_string()))?;

   let mut spec = WatchSpec::default();
   for (object_type, tname, cname) in rows {
      let table = QualifiedTable::parse(&tname);
      match (object_type.as_str(), cname) {
         ("table", _) => {
            spec.columns.entry(table.clone()).or_default();
            spec.tables.insert(table);
         }
         ("column", Some(column)) => {
            spec.columns.entry(table.clone()).or_default().insert(column);
            spec.tables.insert(table);
         }
         (other, cname) => {
            return Err(Error::analysis(format!(
               "unexpected parse_query row ('{other}', '{tname}', {cname:?})"
            )));
         }
      }
   }

   debug!(tables = spec.tables.len(), "analyzed query dependencies");
   Ok(spec)
}
