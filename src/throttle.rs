//! Per-subscription throttling of query re-execution.
//!
//! The throttle is a leading-plus-trailing coalescer: the first signal
//! while idle runs the target immediately, signals arriving during the
//! cooldown collapse into at most one trailing run, and the target never
//! overlaps itself because a single task performs every run.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// The work a throttle runs: the subscription's "execute query and publish"
/// closure.
pub(crate) type ThrottleTarget = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A leading+trailing edge coalescer bound to one target function.
pub(crate) struct Throttle {
   signal_tx: mpsc::Sender<()>,
   shutdown_tx: watch::Sender<bool>,
   task: Mutex<Option<JoinHandle<()>>>,
}

impl Throttle {
   /// Spawns the throttle task for the given cooldown interval and target.
   pub(crate) fn spawn(interval: Duration, target: ThrottleTarget) -> Self {
      // capacity 1: the one-slot buffer deliberately drops intermediate
      // signals while a run or cooldown is in progress
      let (signal_tx, signal_rx) = mpsc::channel(1);
      let (shutdown_tx, shutdown_rx) = watch::channel(false);
      let task = tokio::spawn(run(interval, target, signal_rx, shutdown_rx));

      Self {
         signal_tx,
         shutdown_tx,
         task: Mutex::new(Some(task)),
      }
   }

   /// Offers a signal without blocking. Losing a signal to coalescing is
   /// intentional; a signal to an already-closed throttle (a superseded
   /// registry entry still visible in a dispatcher snapshot) is a no-op.
   pub(crate) fn offer(&self) {
      match self.signal_tx.try_send(()) {
         Ok(()) => {}
         Err(mpsc::error::TrySendError::Full(())) => trace!("throttle signal coalesced"),
         Err(mpsc::error::TrySendError::Closed(())) => {
            debug!("signal offered to a closed throttle");
         }
      }
   }

   /// Closes the throttle cooperatively: an in-flight run completes, any
   /// pending trailing run is abandoned, and the task is awaited.
   pub(crate) async fn close(&self) {
      let _ = self.shutdown_tx.send(true);
      let task = self.task.lock().take();
      if let Some(task) = task {
         let _ = task.await;
      }
   }
}

async fn run(
   interval: Duration,
   target: ThrottleTarget,
   mut signal_rx: mpsc::Receiver<()>,
   mut shutdown_rx: watch::Receiver<bool>,
) {
   loop {
      tokio::select! {
         _ = shutdown_rx.changed() => return,
         signal = signal_rx.recv() => {
            if signal.is_none() {
               return;
            }

            // leading edge
            target().await;

            // cooldown: coalesce further signals into one trailing run
            let cooldown = tokio::time::sleep(interval);
            tokio::pin!(cooldown);
            let mut pending = false;
            loop {
               tokio::select! {
                  _ = &mut cooldown => break,
                  _ = shutdown_rx.changed() => return,
                  signal = signal_rx.recv() => {
                     if signal.is_none() {
                        return;
                     }
                     pending = true;
                  }
               }
            }

            if pending {
               // trailing edge
               target().await;
            }
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

   fn counting_target(counter: Arc<AtomicUsize>) -> ThrottleTarget {
      Arc::new(move || {
         let counter = counter.clone();
         Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
         })
      })
   }

   async fn settle() {
      // with a paused clock this yields to the throttle task and advances
      // time by a hair
      tokio::time::sleep(Duration::from_millis(1)).await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_leading_edge_runs_immediately() {
      let runs = Arc::new(AtomicUsize::new(0));
      let throttle = Throttle::spawn(Duration::from_millis(500), counting_target(runs.clone()));

      throttle.offer();
      settle().await;
      assert_eq!(runs.load(Ordering::SeqCst), 1);

      throttle.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_burst_coalesces_to_two_runs() {
      let runs = Arc::new(AtomicUsize::new(0));
      let throttle = Throttle::spawn(Duration::from_millis(500), counting_target(runs.clone()));

      for _ in 0..10 {
         throttle.offer();
         settle().await;
      }
      assert_eq!(runs.load(Ordering::SeqCst), 1, "only the leading run inside the window");

      tokio::time::sleep(Duration::from_millis(600)).await;
      assert_eq!(runs.load(Ordering::SeqCst), 2, "one trailing run after cooldown");

      throttle.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_single_signal_has_no_trailing_run() {
      let runs = Arc::new(AtomicUsize::new(0));
      let throttle = Throttle::spawn(Duration::from_millis(500), counting_target(runs.clone()));

      throttle.offer();
      tokio::time::sleep(Duration::from_millis(700)).await;
      assert_eq!(runs.load(Ordering::SeqCst), 1);

      throttle.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_signals_in_separate_windows_each_run() {
      let runs = Arc::new(AtomicUsize::new(0));
      let throttle = Throttle::spawn(Duration::from_millis(100), counting_target(runs.clone()));

      throttle.offer();
      tokio::time::sleep(Duration::from_millis(200)).await;
      throttle.offer();
      tokio::time::sleep(Duration::from_millis(200)).await;
      assert_eq!(runs.load(Ordering::SeqCst), 2);

      throttle.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_close_abandons_trailing_run() {
      let runs = Arc::new(AtomicUsize::new(0));
      let throttle = Throttle::spawn(Duration::from_millis(500), counting_target(runs.clone()));

      throttle.offer();
      settle().await;
      throttle.offer(); // coalesced, would become the trailing run
      settle().await;

      throttle.close().await;
      tokio::time::sleep(Duration::from_millis(600)).await;
      assert_eq!(runs.load(Ordering::SeqCst), 1, "trailing run must not fire after close");
   }

   #[tokio::test(start_paused = true)]
   async fn test_runs_never_overlap() {
      let in_flight = Arc::new(AtomicBool::new(false));
      let overlapped = Arc::new(AtomicBool::new(false));
      let runs = Arc::new(AtomicUsize::new(0));

      let target: ThrottleTarget = {
         let in_flight = in_flight.clone();
         let overlapped = overlapped.clone();
         let runs = runs.clone();
         Arc::new(move || {
            let in_flight = in_flight.clone();
            let overlapped = overlapped.clone();
            let runs = runs.clone();
            Box::pin(async move {
               if in_flight.swap(true, Ordering::SeqCst) {
                  overlapped.store(true, Ordering::SeqCst);
               }
               tokio::time::sleep(Duration::from_millis(50)).await;
               in_flight.store(false, Ordering::SeqCst);
               runs.fetch_add(1, Ordering::SeqCst);
            })
         })
      };

      let throttle = Throttle::spawn(Duration::from_millis(20), target);
      for _ in 0..5 {
         throttle.offer();
         settle().await;
      }
      tokio::time::sleep(Duration::from_millis(500)).await;

      assert!(!overlapped.load(Ordering::SeqCst));
      assert!(runs.load(Ordering::SeqCst) >= 1);
      throttle.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_close_waits_for_in_flight_run() {
      let finished = Arc::new(AtomicBool::new(false));
      let target: ThrottleTarget = {
         let finished = finished.clone();
         Arc::new(move || {
            let finished = finished.clone();
            Box::pin(async move {
               tokio::time::sleep(Duration::from_millis(100)).await;
               finished.store(true, Ordering::SeqCst);
            })
         })
      };

      let throttle = Throttle::spawn(Duration::from_millis(10), target);
      throttle.offer();
      settle().await;

      throttle.close().await;
      assert!(finished.load(Ordering::SeqCst), "close must wait out the in-flight run");
   }
}
