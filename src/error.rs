//! Error types for the sqlx-pg-realtime crate.

use std::sync::Arc;

/// Result type alias for live-query operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Handler for errors raised on the system's background tasks.
///
/// Invoked from the listener and dispatcher tasks; implementations must not
/// panic and must return promptly.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Per-subscription handler for query-execution failures.
///
/// Called with the error and the SQL text of the failed query. The result
/// holder is not updated on failure and the throttler stays armed.
pub type QueryErrorHandler = Arc<dyn Fn(&Error, &str) + Send + Sync>;

/// Errors that can occur in live-query operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// SQLx database error.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// The query could not be analyzed for table/column dependencies.
   ///
   /// Raised at subscribe time; no subscription state is registered.
   #[error("query analysis failed: {message}")]
   Analysis { message: String },

   /// Trigger or trigger-function DDL failed for a table.
   ///
   /// Triggers installed earlier in the same subscribe call are left in
   /// place (installation is idempotent).
   #[error("trigger installation failed for table '{table}': {source}")]
   TriggerInstall {
      table: String,
      #[source]
      source: sqlx::Error,
   },

   /// The trigger body itself failed and reported an `{error}` envelope.
   #[error("trigger failed on {operation} for table '{table}': {message}")]
   TriggerRuntime {
      table: String,
      operation: String,
      message: String,
   },

   /// A notification payload could not be decoded.
   #[error("malformed notification payload: {message}")]
   Decode { message: String },

   /// A subscription's refresh query failed to execute.
   #[error("query execution failed: {source}")]
   QueryExecution {
      #[source]
      source: sqlx::Error,
   },

   /// The listener connection was lost; subscriptions go quiescent until
   /// the system is restarted.
   #[error("listener connection lost: {message}")]
   ListenerLost { message: String },
}

impl Error {
   pub(crate) fn analysis(message: impl Into<String>) -> Self {
      Error::Analysis {
         message: message.into(),
      }
   }

   pub(crate) fn decode(message: impl Into<String>) -> Self {
      Error::Decode {
         message: message.into(),
      }
   }
}

/// Default system error handler: logs at error severity.
pub(crate) fn default_error_handler() -> ErrorHandler {
   Arc::new(|error| {
      tracing::error!(error = %error, "live-query system error");
   })
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_analysis_error_message() {
      let err = Error::analysis("relation \"nope\" does not exist");
      assert!(err.to_string().contains("query analysis failed"));
      assert!(err.to_string().contains("nope"));
   }

   #[test]
   fn test_trigger_runtime_error_message() {
      let err = Error::TriggerRuntime {
         table: "audit.events".into(),
         operation: "UPDATE".into(),
         message: "division by zero".into(),
      };
      let text = err.to_string();
      assert!(text.contains("audit.events"));
      assert!(text.contains("UPDATE"));
      assert!(text.contains("division by zero"));
   }
}
