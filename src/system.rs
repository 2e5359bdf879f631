//! The live-query system: lifecycle, subscription registry, and change
//! dispatch.
//!
//! One started system per process is the expected deployment; the caller
//! owns its lifetime. [`PgRealtime::start`] bootstraps the database-side
//! assets and the listener/dispatcher tasks; [`PgRealtime::shutdown`]
//! tears them down again, leaving the installed triggers in place for the
//! next start.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::analyze::analyze_query;
use crate::config::{ParamValue, RealtimeConfig, SubscribeOptions};
use crate::decode::decode_payload;
use crate::error::{default_error_handler, ErrorHandler, QueryErrorHandler, Result};
use crate::listener::run_listener;
use crate::refresh::should_refresh;
use crate::result::execute_query;
use crate::sql;
use crate::subscription::{QueryHandle, SubscriptionEntry, SubscriptionShared};
use crate::throttle::{Throttle, ThrottleTarget};
use crate::triggers;

/// Counters exposed by [`PgRealtime::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeStats {
   /// Notifications dropped on internal queue overflow since start.
   pub dropped_notifications: u64,
   /// Currently registered subscriptions.
   pub subscriptions: usize,
}

struct SystemInner {
   registry: RwLock<HashMap<String, Arc<SubscriptionEntry>>>,
   error_handler: ErrorHandler,
   dropped: Arc<AtomicU64>,
   shutdown_tx: watch::Sender<bool>,
   tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Live queries over PostgreSQL, driven by LISTEN/NOTIFY and system-owned
/// AFTER triggers.
///
/// Cloning shares the same running system.
#[derive(Clone)]
pub struct PgRealtime {
   inner: Arc<SystemInner>,
}

impl PgRealtime {
   /// Starts the system against the given pool.
   ///
   /// Opens the dedicated listener connection, bootstraps the database-side
   /// assets (`pgcrypto` and the parse-query routine), LISTENs on the
   /// shared channel, and spawns the listener and dispatcher tasks.
   pub async fn start(pool: PgPool, config: RealtimeConfig) -> Result<Self> {
      let mut listener = PgListener::connect_with(&pool).await?;

      // pgcrypto provides digest() for the triggers' value hashing
      sqlx::raw_sql("CREATE EXTENSION IF NOT EXISTS pgcrypto").execute(&pool).await?;
      sqlx::raw_sql(sql::PARSE_QUERY_DDL).execute(&pool).await?;

      listener.listen(sql::CHANNEL).await?;

      let error_handler = config.error_handler.clone().unwrap_or_else(default_error_handler);
      let dropped = Arc::new(AtomicU64::new(0));
      let (shutdown_tx, shutdown_rx) = watch::channel(false);
      let (queue_tx, queue_rx) = mpsc::channel(config.notification_buffer.max(1));

      let inner = Arc::new(SystemInner {
         registry: RwLock::new(HashMap::new()),
         error_handler: error_handler.clone(),
         dropped: dropped.clone(),
         shutdown_tx,
         tasks: Mutex::new(Vec::new()),
      });

      let listener_task = tokio::spawn(run_listener(
         listener,
         config.poll_interval,
         queue_tx,
         shutdown_rx,
         dropped,
         error_handler,
      ));
      let dispatcher_task = tokio::spawn(run_dispatcher(inner.clone(), queue_rx));
      inner.tasks.lock().extend([listener_task, dispatcher_task]);

      info!(channel = sql::CHANNEL, "live-query system started");
      Ok(Self { inner })
   }

   /// Registers (or replaces) a live query under `id` and returns its
   /// handle.
   ///
   /// The query is analyzed, notify triggers are installed for every table
   /// it reads, and the query is executed once before the subscription is
   /// registered, so the returned handle already carries a result.
   ///
   /// Re-subscribing with an existing id supersedes the previous
   /// subscription atomically from the observer's point of view: the
   /// result holder and watcher registrations are preserved, and watchers
   /// fire only if the new query's result actually differs. If analysis,
   /// trigger installation, or the initial execution fails, the previous
   /// subscription is left running untouched.
   pub async fn subscribe(
      &self,
      id: impl Into<String>,
      pool: PgPool,
      query: impl Into<String>,
      opts: SubscribeOptions,
   ) -> Result<QueryHandle> {
      let id = id.into();
      let query = query.into();

      let watch_spec = analyze_query(&pool, &query).await?;
      triggers::install_for_tables(&pool, &watch_spec.tables).await?;

      // reuse the result cell of a superseded subscription; watchers and
      // the current value carry over
      let previous = self.inner.registry.read().get(&id).cloned();
      let shared = match &previous {
         Some(entry) => entry.shared.clone(),
         None => SubscriptionShared::new(),
      };

      let target = execute_target(
         pool.clone(),
         query.clone(),
         opts.params.clone(),
         shared.clone(),
         opts.error_handler.clone(),
      );

      // initial synchronous execution. The previous subscription keeps
      // running until this succeeds, so a failed re-subscribe does not
      // tear down a live one.
      let rows = execute_query(&pool, &query, &opts.params).await?;

      // supersede: stop the previous publisher before publishing the new
      // query's result
      if let Some(entry) = &previous {
         entry.throttle.close().await;
      }
      shared.publish(rows);

      let entry = Arc::new(SubscriptionEntry {
         pool,
         watch_spec,
         policy: opts.refresh.clone(),
         shared: shared.clone(),
         throttle: Throttle::spawn(opts.throttle_interval(), target),
      });

      debug!(
         id = %id,
         tables = entry.watch_spec.tables.len(),
         "subscription registered"
      );
      self.inner.registry.write().insert(id.clone(), entry);

      Ok(QueryHandle::new(id, shared))
   }

   /// Returns the handle of an existing subscription, or `None`.
   pub fn handle(&self, id: &str) -> Option<QueryHandle> {
      let entry = self.inner.registry.read().get(id).cloned()?;
      Some(QueryHandle::new(id.to_string(), entry.shared.clone()))
   }

   /// Removes a subscription and closes its throttle. Installed triggers
   /// stay in place. Returns whether the id was registered.
   pub async fn unsubscribe(&self, id: &str) -> bool {
      let entry = self.inner.registry.write().remove(id);
      match entry {
         Some(entry) => {
            entry.throttle.close().await;
            debug!(id = %id, "subscription removed");
            true
         }
         None => false,
      }
   }

   /// Stops the system: closes every throttle, stops the listener and
   /// dispatcher, and clears the registry. Triggers are not uninstalled.
   pub async fn shutdown(&self) {
      let entries: Vec<Arc<SubscriptionEntry>> =
         self.inner.registry.read().values().cloned().collect();
      for entry in entries {
         entry.throttle.close().await;
      }

      let _ = self.inner.shutdown_tx.send(true);
      let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
      for task in tasks {
         let _ = task.await;
      }

      self.inner.registry.write().clear();
      info!("live-query system stopped");
   }

   /// Current system counters.
   pub fn stats(&self) -> RealtimeStats {
      RealtimeStats {
         dropped_notifications: self.inner.dropped.load(Ordering::Relaxed),
         subscriptions: self.inner.registry.read().len(),
      }
   }

   /// Admin: drops every trigger and function owned by this system (names
   /// carrying the `_pg_realtime_` prefix). Returns `(triggers,
   /// functions)` dropped.
   ///
   /// Run only while no live-query system is started against the database.
   pub async fn destroy_objects(pool: &PgPool) -> Result<(u64, u64)> {
      triggers::destroy_objects(pool).await
   }
}

async fn run_dispatcher(inner: Arc<SystemInner>, mut queue_rx: mpsc::Receiver<String>) {
   while let Some(payload) = queue_rx.recv().await {
      let change = match decode_payload(&payload) {
         Ok(change) => change,
         Err(e) => {
            (inner.error_handler)(&e);
            continue;
         }
      };

      let entries: Vec<(String, Arc<SubscriptionEntry>)> = inner
         .registry
         .read()
         .iter()
         .map(|(id, entry)| (id.clone(), entry.clone()))
         .collect();

      for (id, entry) in entries {
         if !entry.watch_spec.tables.contains(&change.table) {
            continue;
         }

         let current = entry.shared.current();
         let decision = should_refresh(
            &entry.pool,
            current,
            entry.watch_spec.columns_for(&change.table),
            &entry.policy,
            &change,
         )
         .await;

         match decision {
            Ok(true) => {
               trace!(id = %id, table = %change.table, op = change.operation.as_str(), "refresh signalled");
               entry.throttle.offer();
            }
            Ok(false) => {}
            Err(e) => (inner.error_handler)(&e),
         }
      }
   }

   debug!("dispatcher task stopped");
}

/// Builds the throttle target: execute the query, publish on change,
/// route failures to the subscription's error handler.
fn execute_target(
   pool: PgPool,
   query: String,
   params: Vec<ParamValue>,
   shared: Arc<SubscriptionShared>,
   error_handler: Option<QueryErrorHandler>,
) -> ThrottleTarget {
   Arc::new(move || {
      let pool = pool.clone();
      let query = query.clone();
      let params = params.clone();
      let shared = shared.clone();
      let error_handler = error_handler.clone();

      Box::pin(async move {
         match execute_query(&pool, &query, &params).await {
            Ok(rows) => {
               shared.publish(rows);
            }
            Err(e) => match &error_handler {
               Some(handler) => handler(&e, &query),
               None => error!(error = %e, query = %query, "refresh query failed"),
            },
         }
      })
   })
}
