//! Live query subscriptions for PostgreSQL using sqlx.
//!
//! Register a SQL query and get a [`QueryHandle`] whose observable value is
//! the current result of that query, re-executed automatically whenever the
//! underlying data changes. Change detection is built entirely on
//! PostgreSQL's own LISTEN/NOTIFY plus per-table AFTER triggers that this
//! crate installs and owns — no WAL decoding, no external infrastructure.
//!
//! # How it works
//!
//! 1. At subscribe time the query is analyzed server-side (compiled into a
//!    temporary view, dependencies read from the catalog) to learn which
//!    tables and columns it reads.
//! 2. A notify trigger is installed on each of those tables. On every row
//!    mutation the trigger emits a size-bounded, type-annotated JSON delta
//!    on one shared notification channel, degrading oversized values to
//!    SHA-256 digests.
//! 3. A dedicated listener connection receives the notifications; each is
//!    decoded and fanned out to the subscriptions watching that table.
//! 4. A per-subscription refresh policy (tracked columns, a declarative
//!    filter map, or a caller predicate) decides whether the query must be
//!    re-run.
//! 5. Re-execution is throttled per subscription (leading plus trailing
//!    edge) and the result is only published when its hash changes, so
//!    observers never see duplicate values.
//!
//! # Example
//!
//! ```no_run
//! use sqlx::PgPool;
//! use sqlx_pg_realtime::{PgRealtime, RealtimeConfig, SubscribeOptions};
//!
//! # async fn demo() -> sqlx_pg_realtime::Result<()> {
//! let pool = PgPool::connect("postgres://localhost/app").await?;
//! let realtime = PgRealtime::start(pool.clone(), RealtimeConfig::default()).await?;
//!
//! let handle = realtime
//!    .subscribe("open-orders", pool, "SELECT id, status FROM orders WHERE status = 'open'",
//!       SubscribeOptions::default())
//!    .await?;
//!
//! handle.watch("logger", std::sync::Arc::new(|_old, new| {
//!    println!("open orders: {}", new.len());
//! }));
//! # Ok(())
//! # }
//! ```
//!
//! # Caveats
//!
//! - Notifications ride on `pg_notify`, so a delta is capped below 8 kB;
//!   oversized column values arrive as SHA-256 digests (listed in the
//!   change's `hashed` set) and the query re-execution fetches real data.
//! - The trigger reports values with its own row visibility. If the
//!   subscribing connection runs under row-level security, decoded changes
//!   may mention rows the subscriber cannot read.
//! - The listener does not reconnect. If its connection is lost the system
//!   error handler fires and subscriptions go quiescent until restart.

pub mod analyze;
pub mod config;
pub mod decode;
pub mod error;
pub mod refresh;
pub mod result;
pub mod sql;
pub mod stream;
pub mod subscription;
pub mod system;
pub mod table;

mod listener;
mod throttle;
mod triggers;

pub use analyze::WatchSpec;
pub use config::{ParamValue, RealtimeConfig, SubscribeOptions};
pub use decode::{ChangeOperation, RowChange, decode_payload};
pub use error::{Error, ErrorHandler, QueryErrorHandler, Result};
pub use refresh::{FilterMap, Matcher, PredicateVerdict, RefreshPolicy, RefreshPredicate};
pub use result::{ResultRows, Row};
pub use stream::ResultStream;
pub use subscription::{QueryHandle, WatchCallback};
pub use system::{PgRealtime, RealtimeStats};
pub use table::QualifiedTable;
