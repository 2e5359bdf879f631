//! Trigger installation and removal.
//!
//! Installation renders the notify template for each watched table and
//! executes it with `CREATE OR REPLACE` semantics, so installing twice (or
//! concurrently from two subscribes) is a no-op beyond the DDL re-emission.
//! Triggers are never removed by unsubscribe; they survive until
//! [`destroy_objects`] drops everything carrying the reserved prefix.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::sql;
use crate::table::QualifiedTable;

/// Installs (or re-installs) the notify function and trigger for each table.
///
/// Failure part-way leaves earlier tables installed; a retry is safe.
pub(crate) async fn install_for_tables<'a, I>(pool: &PgPool, tables: I) -> Result<()>
where
   I: IntoIterator<Item = &'a QualifiedTable>,
{
   for table in tables {
      let install = async {
         sqlx::raw_sql(&sql::render_notify_function(table)).execute(pool).await?;
         sqlx::raw_sql(&sql::render_notify_trigger(table)).execute(pool).await?;
         Ok::<_, sqlx::Error>(())
      };

      install.await.map_err(|source| Error::TriggerInstall {
         table: table.to_string(),
         source,
      })?;

      debug!(table = %table, trigger = %sql::trigger_name(table), "notify trigger installed");
   }

   Ok(())
}

/// Drops every trigger and function whose name carries the reserved
/// `_pg_realtime_` prefix. Returns `(triggers, functions)` dropped.
///
/// Admin operation: run it only while no live-query system is started
/// against the database, since it removes the change-capture machinery out
/// from under any active subscription.
pub(crate) async fn destroy_objects(pool: &PgPool) -> Result<(u64, u64)> {
   let triggers: Vec<(String, String, String)> =
      sqlx::query_as(sql::LIST_OWNED_TRIGGERS).fetch_all(pool).await?;

   let mut dropped_triggers = 0;
   for (tgname, schema, table) in triggers {
      let ddl = format!(
         "DROP TRIGGER IF EXISTS \"{}\" ON \"{}\".\"{}\"",
         escape(&tgname),
         escape(&schema),
         escape(&table),
      );
      sqlx::raw_sql(&ddl).execute(pool).await?;
      dropped_triggers += 1;
   }

   let functions: Vec<(String,)> =
      sqlx::query_as(sql::LIST_OWNED_FUNCTIONS).fetch_all(pool).await?;

   let mut dropped_functions = 0;
   for (signature,) in functions {
      // signature is a regprocedure rendering, e.g. `_pg_realtime_parse_query(text)`
      let ddl = format!("DROP FUNCTION IF EXISTS {signature}");
      sqlx::raw_sql(&ddl).execute(pool).await?;
      dropped_functions += 1;
   }

   info!(
      triggers = dropped_triggers,
      functions = dropped_functions,
      "dropped live-query database objects"
   );
   Ok((dropped_triggers, dropped_functions))
}

fn escape(ident: &str) -> String {
   ident.replace('"', "\"\"")
}
