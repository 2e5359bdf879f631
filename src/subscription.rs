//! Subscription state and the caller-facing query handle.
//!
//! Each subscription owns a shared cell holding the latest published result
//! plus its digest, and a keyed registry of observer callbacks. The cell is
//! deliberately separate from the rest of the subscription record: a
//! same-id re-subscribe replaces the query, policy, and throttle but keeps
//! the cell, so existing handles and watchers carry over without a spurious
//! transient.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::trace;

use crate::analyze::WatchSpec;
use crate::refresh::RefreshPolicy;
use crate::result::{digest_rows, ResultDigest, ResultRows, Row};
use crate::stream::ResultStream;
use crate::throttle::Throttle;

/// Observer callback, invoked with the previous and new result whenever a
/// changed result is published. The previous result is `None` until the
/// first publish.
pub type WatchCallback = Arc<dyn Fn(Option<&[Row]>, &[Row]) + Send + Sync>;

/// State preserved across same-id re-subscribes.
pub(crate) struct SubscriptionShared {
   holder: watch::Sender<Option<ResultRows>>,
   digest: Mutex<Option<ResultDigest>>,
   watchers: Mutex<HashMap<String, WatchCallback>>,
}

impl SubscriptionShared {
   pub(crate) fn new() -> Arc<Self> {
      let (holder, _) = watch::channel(None);
      Arc::new(Self {
         holder,
         digest: Mutex::new(None),
         watchers: Mutex::new(HashMap::new()),
      })
   }

   /// Publishes a freshly executed result, suppressing duplicates.
   ///
   /// The result is installed and watchers run only when its digest
   /// differs from the last published one, so observers never see
   /// `old == new`. Returns whether a publish happened.
   ///
   /// Only one publisher is ever active per subscription (the throttle
   /// task, or the subscribe path while no throttle is armed).
   pub(crate) fn publish(&self, rows: Vec<Row>) -> bool {
      let digest = digest_rows(&rows);
      {
         let mut last = self.digest.lock();
         if last.as_ref() == Some(&digest) {
            trace!("result unchanged, publish suppressed");
            return false;
         }
         *last = Some(digest);
      }

      let new = Arc::new(rows);
      let old = self.holder.send_replace(Some(new.clone()));

      let watchers: Vec<WatchCallback> = self.watchers.lock().values().cloned().collect();
      for watcher in watchers {
         watcher(old.as_deref().map(Vec::as_slice), &new);
      }
      true
   }

   pub(crate) fn current(&self) -> Option<ResultRows> {
      self.holder.borrow().clone()
   }

   pub(crate) fn subscribe_updates(&self) -> watch::Receiver<Option<ResultRows>> {
      self.holder.subscribe()
   }

   fn add_watcher(&self, key: String, callback: WatchCallback) {
      self.watchers.lock().insert(key, callback);
   }

   fn remove_watcher(&self, key: &str) -> bool {
      self.watchers.lock().remove(key).is_some()
   }
}

/// A live subscription record held in the system registry.
///
/// The query text, parameters, and error handler live inside the
/// throttle's target closure; the entry keeps only what the dispatcher
/// needs to route and decide.
pub(crate) struct SubscriptionEntry {
   pub(crate) pool: PgPool,
   pub(crate) watch_spec: WatchSpec,
   pub(crate) policy: RefreshPolicy,
   pub(crate) shared: Arc<SubscriptionShared>,
   pub(crate) throttle: Throttle,
}

/// Handle to a live query.
///
/// The handle stays valid across a same-id re-subscribe (it observes the
/// new query's results through the same cell) and after unsubscribe (the
/// value freezes at the last published result).
#[derive(Clone)]
pub struct QueryHandle {
   id: String,
   shared: Arc<SubscriptionShared>,
}

impl QueryHandle {
   pub(crate) fn new(id: String, shared: Arc<SubscriptionShared>) -> Self {
      Self { id, shared }
   }

   /// The subscription id this handle was created for.
   pub fn id(&self) -> &str {
      &self.id
   }

   /// The current query result, or `None` before the first execution
   /// completes.
   pub fn current(&self) -> Option<ResultRows> {
      self.shared.current()
   }

   /// Registers an observer callback under a key, replacing any previous
   /// callback with the same key.
   pub fn watch(&self, key: impl Into<String>, callback: WatchCallback) {
      self.shared.add_watcher(key.into(), callback);
   }

   /// Removes the observer registered under a key. Returns whether one was
   /// registered.
   pub fn unwatch(&self, key: &str) -> bool {
      self.shared.remove_watcher(key)
   }

   /// A stream of published results, starting with the next publish.
   pub fn updates(&self) -> ResultStream {
      ResultStream::new(self.shared.subscribe_updates())
   }
}

impl std::fmt::Debug for QueryHandle {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("QueryHandle")
         .field("id", &self.id)
         .field("has_result", &self.shared.current().is_some())
         .finish()
   }
}
