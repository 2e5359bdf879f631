//! The notification listener task.
//!
//! One dedicated connection LISTENs on the shared channel. The poll task
//! wakes at least every poll interval, forwards raw payloads into the
//! bounded internal queue, and terminates on shutdown or on connection
//! loss. Reconnection is deliberately out of scope: on loss the system's
//! error handler fires once and subscriptions go quiescent until the
//! system is restarted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::error::{Error, ErrorHandler};

pub(crate) async fn run_listener(
   mut listener: PgListener,
   poll_interval: Duration,
   queue: mpsc::Sender<String>,
   mut shutdown: watch::Receiver<bool>,
   dropped: Arc<AtomicU64>,
   error_handler: ErrorHandler,
) {
   loop {
      tokio::select! {
         _ = shutdown.changed() => break,
         polled = tokio::time::timeout(poll_interval, listener.recv()) => {
            match polled {
               // poll tick with nothing pending
               Err(_elapsed) => continue,
               Ok(Ok(notification)) => {
                  match queue.try_send(notification.payload().to_string()) {
                     Ok(()) => {}
                     Err(mpsc::error::TrySendError::Full(_)) => {
                        // drop-newest; a surviving notification per table is
                        // enough for the subscription to catch up
                        dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("notification queue full, dropping newest notification");
                     }
                     Err(mpsc::error::TrySendError::Closed(_)) => break,
                  }
               }
               Ok(Err(e)) => {
                  let lost = Error::ListenerLost {
                     message: e.to_string(),
                  };
                  error!(error = %lost, "listener connection lost, subscriptions go quiescent");
                  error_handler(&lost);
                  break;
               }
            }
         }
      }
   }

   debug!("listener poll task stopped");
}
