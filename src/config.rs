//! Configuration for the live-query system and for individual
//! subscriptions.

use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::error::{ErrorHandler, QueryErrorHandler};
use crate::refresh::RefreshPolicy;

/// Configuration for [`PgRealtime::start`](crate::PgRealtime::start).
#[derive(Clone)]
pub struct RealtimeConfig {
   /// Interval at which the listener task polls for notifications.
   ///
   /// Default: 200 ms.
   pub poll_interval: Duration,

   /// Capacity of the internal notification queue between the listener and
   /// the dispatcher.
   ///
   /// On overflow the newest notification is dropped. This is acceptable
   /// for live queries (the next surviving notification refreshes the
   /// query), but a subscription can observe a stale result until the next
   /// mutation if every notification for a table is dropped. Drops are
   /// counted in [`stats`](crate::PgRealtime::stats).
   ///
   /// Default: 100.
   pub notification_buffer: usize,

   /// Handler for errors raised on the system's background tasks
   /// (decode failures, trigger-reported errors, listener loss).
   ///
   /// Default: log at error severity.
   pub error_handler: Option<ErrorHandler>,
}

impl Default for RealtimeConfig {
   fn default() -> Self {
      Self {
         poll_interval: Duration::from_millis(200),
         notification_buffer: 100,
         error_handler: None,
      }
   }
}

impl RealtimeConfig {
   /// Creates a configuration with default settings.
   pub fn new() -> Self {
      Self::default()
   }

   /// Sets the listener poll interval.
   pub fn with_poll_interval(mut self, interval: Duration) -> Self {
      self.poll_interval = interval;
      self
   }

   /// Sets the notification queue capacity.
   pub fn with_notification_buffer(mut self, capacity: usize) -> Self {
      self.notification_buffer = capacity;
      self
   }

   /// Sets the system-wide error handler.
   pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
      self.error_handler = Some(handler);
      self
   }
}

impl std::fmt::Debug for RealtimeConfig {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("RealtimeConfig")
         .field("poll_interval", &self.poll_interval)
         .field("notification_buffer", &self.notification_buffer)
         .field("error_handler", &self.error_handler.is_some())
         .finish()
   }
}

/// Per-subscription options for [`subscribe`](crate::PgRealtime::subscribe).
#[derive(Clone, Default)]
pub struct SubscribeOptions {
   /// Positional parameters bound to `$1`, `$2`, … when the query runs.
   pub params: Vec<ParamValue>,

   /// Throttle interval for re-execution. Within one interval a burst of
   /// qualifying notifications runs the query at most twice (leading and
   /// trailing edge).
   ///
   /// Default: 500 ms.
   pub throttle: Option<Duration>,

   /// When to re-run the query for a decoded change. See [`RefreshPolicy`].
   pub refresh: RefreshPolicy,

   /// Handler for query-execution failures of this subscription.
   ///
   /// Default: log at error severity.
   pub error_handler: Option<QueryErrorHandler>,
}

impl SubscribeOptions {
   /// Default throttle interval.
   pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(500);

   /// Creates options with default settings.
   pub fn new() -> Self {
      Self::default()
   }

   /// Sets the positional query parameters.
   pub fn with_params<I>(mut self, params: I) -> Self
   where
      I: IntoIterator<Item = ParamValue>,
   {
      self.params = params.into_iter().collect();
      self
   }

   /// Sets the throttle interval.
   pub fn with_throttle(mut self, throttle: Duration) -> Self {
      self.throttle = Some(throttle);
      self
   }

   /// Sets the refresh policy.
   pub fn with_refresh(mut self, refresh: RefreshPolicy) -> Self {
      self.refresh = refresh;
      self
   }

   /// Sets the query-execution error handler.
   pub fn with_error_handler(mut self, handler: QueryErrorHandler) -> Self {
      self.error_handler = Some(handler);
      self
   }

   pub(crate) fn throttle_interval(&self) -> Duration {
      self.throttle.unwrap_or(Self::DEFAULT_THROTTLE)
   }
}

impl std::fmt::Debug for SubscribeOptions {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("SubscribeOptions")
         .field("params", &self.params.len())
         .field("throttle", &self.throttle_interval())
         .field("refresh", &self.refresh)
         .field("error_handler", &self.error_handler.is_some())
         .finish()
   }
}

/// A typed positional query parameter.
///
/// Queries are dynamic SQL, so parameters are bound through this tagged
/// representation rather than through compile-time-typed `bind` calls.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
   /// SQL NULL.
   ///
   /// The wire protocol has no untyped parameter, so this binds as a
   /// `text` NULL. Against a non-text column Postgres may reject the
   /// comparison instead of inferring the type from context; cast the
   /// placeholder in the query (`$1::bigint`) where that matters.
   Null,
   Bool(bool),
   Int(i64),
   Float(f64),
   Text(String),
   Json(JsonValue),
   Uuid(sqlx::types::Uuid),
}

impl ParamValue {
   /// Binds this parameter onto a query.
   pub(crate) fn bind<'q>(
      &self,
      query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
   ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
      match self {
         ParamValue::Null => query.bind(Option::<String>::None),
         ParamValue::Bool(v) => query.bind(*v),
         ParamValue::Int(v) => query.bind(*v),
         ParamValue::Float(v) => query.bind(*v),
         ParamValue::Text(v) => query.bind(v.clone()),
         ParamValue::Json(v) => query.bind(v.clone()),
         ParamValue::Uuid(v) => query.bind(*v),
      }
   }
}

impl From<&str> for ParamValue {
   fn from(v: &str) -> Self {
      ParamValue::Text(v.to_string())
   }
}

impl From<String> for ParamValue {
   fn from(v: String) -> Self {
      ParamValue::Text(v)
   }
}

impl From<i64> for ParamValue {
   fn from(v: i64) -> Self {
      ParamValue::Int(v)
   }
}

impl From<i32> for ParamValue {
   fn from(v: i32) -> Self {
      ParamValue::Int(v.into())
   }
}

impl From<bool> for ParamValue {
   fn from(v: bool) -> Self {
      ParamValue::Bool(v)
   }
}

impl From<f64> for ParamValue {
   fn from(v: f64) -> Self {
      ParamValue::Float(v)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults() {
      let config = RealtimeConfig::default();
      assert_eq!(config.poll_interval, Duration::from_millis(200));
      assert_eq!(config.notification_buffer, 100);
      assert!(config.error_handler.is_none());

      let opts = SubscribeOptions::default();
      assert_eq!(opts.throttle_interval(), Duration::from_millis(500));
      assert!(opts.params.is_empty());
   }

   #[test]
   fn test_builder_chain() {
      let config = RealtimeConfig::new()
         .with_poll_interval(Duration::from_millis(50))
         .with_notification_buffer(8);
      assert_eq!(config.poll_interval, Duration::from_millis(50));
      assert_eq!(config.notification_buffer, 8);

      let opts = SubscribeOptions::new()
         .with_throttle(Duration::from_millis(100))
         .with_params([ParamValue::from(42i64), ParamValue::from("pending")]);
      assert_eq!(opts.throttle_interval(), Duration::from_millis(100));
      assert_eq!(opts.params.len(), 2);
   }
}
