//! SQLite connection lifecycle with a per-process handle ceiling.
//!
//! Each worker context owns at most one connection, opened lazily on first
//! use and kept until the context is released or dropped. A process-wide
//! counter tracks live handles; a new context that finds the ceiling reached
//! backs off a bounded number of times before the [`SlotPolicy`] decides
//! whether to open anyway or refuse.

use rand::Rng;
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::metrics::ConnectionGauge;

static NEXT_GOVERNOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_WORKER: RefCell<WorkerContext> = RefCell::new(WorkerContext::new());
}

/// What to do when the ceiling is still reached after backing off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// Open the connection anyway and log a warning.
    #[default]
    BestEffort,
    /// Refuse with [`Error::ResourceExhausted`].
    Strict,
}

impl FromStr for SlotPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best_effort" | "best-effort" => Ok(SlotPolicy::BestEffort),
            "strict" => Ok(SlotPolicy::Strict),
            other => Err(format!("unknown slot policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: usize,
    pub busy_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub slot_policy: SlotPolicy,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "users.db".to_string(),
            max_connections: 10,
            busy_timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            slot_policy: SlotPolicy::BestEffort,
        }
    }
}

/// Holds a logical worker's database handle between units of work
#[derive(Default)]
pub struct WorkerContext {
    slot: Option<Slot>,
}

impl WorkerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_some()
    }
}

struct Slot {
    governor_id: u64,
    // declared first so the handle closes before the slot is given back
    connection: Connection,
    reservation: SlotReservation,
}

/// One unit of the live-handle count, returned on drop
struct SlotReservation {
    live: Arc<AtomicUsize>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

struct GovernorInner {
    id: u64,
    config: DatabaseConfig,
    live: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct ConnectionGovernor {
    inner: Arc<GovernorInner>,
}

impl ConnectionGovernor {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            inner: Arc::new(GovernorInner {
                id: NEXT_GOVERNOR_ID.fetch_add(1, Ordering::Relaxed),
                config,
                live: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn active_connections(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn gauge(&self) -> ConnectionGauge {
        ConnectionGauge::new(self.inner.live.clone())
    }

    /// Get the context's connection, opening one if it has none yet
    pub fn acquire<'a>(&self, ctx: &'a mut WorkerContext) -> Result<&'a mut Connection> {
        let foreign = ctx
            .slot
            .as_ref()
            .is_some_and(|slot| slot.governor_id != self.inner.id);
        if foreign {
            ctx.slot = None;
        }

        if ctx.slot.is_none() {
            let reservation = self.reserve_slot()?;
            let connection = self.open_connection()?;
            debug!(
                live = self.active_connections(),
                max = self.inner.config.max_connections,
                "Opened database connection for worker"
            );
            ctx.slot = Some(Slot {
                governor_id: self.inner.id,
                connection,
                reservation,
            });
        }

        ctx.slot
            .as_mut()
            .map(|slot| &mut slot.connection)
            .ok_or_else(|| Error::Internal("worker context has no connection".to_string()))
    }

    /// Close the context's connection and give its slot back
    pub fn release(&self, ctx: &mut WorkerContext) -> bool {
        let Some(slot) = ctx.slot.take() else {
            return false;
        };

        let Slot {
            connection,
            reservation,
            ..
        } = slot;
        if let Err((_, err)) = connection.close() {
            warn!(error = %err, "Error closing database connection");
        }
        drop(reservation);
        debug!(live = self.active_connections(), "Released database connection");
        true
    }

    /// Run `f` inside a transaction on the context's connection.
    ///
    /// Commits when `f` succeeds and rolls back when it fails. Statements
    /// prepared inside `f` are finalized before this returns on every path.
    pub fn with_connection<T, F>(&self, ctx: &mut WorkerContext, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let outcome = {
            let connection = self.acquire(ctx)?;
            run_in_transaction(connection, f)
        };

        // a connection that cannot begin or commit is not worth keeping
        if matches!(outcome, Err(Error::Transaction(_))) {
            self.release(ctx);
        }
        outcome
    }

    /// [`with_connection`](Self::with_connection) using the calling thread's
    /// worker context
    pub fn with_thread_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        THREAD_WORKER.with(|worker| {
            let mut worker = worker.try_borrow_mut().map_err(|_| {
                Error::Internal("worker connection already in use on this thread".to_string())
            })?;
            self.with_connection(&mut worker, f)
        })
    }

    /// Run a unit of work on the blocking pool.
    ///
    /// Blocking threads keep their connection between units of work and give
    /// the slot back when the runtime retires the thread.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let governor = self.clone();
        tokio::task::spawn_blocking(move || governor.with_thread_connection(f))
            .await
            .map_err(|e| Error::Internal(format!("database task failed: {}", e)))?
    }

    fn reserve_slot(&self) -> Result<SlotReservation> {
        let config = &self.inner.config;
        let live = &self.inner.live;
        let mut attempt = 0;

        loop {
            let current = live.load(Ordering::Acquire);
            if current < config.max_connections {
                if live
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(SlotReservation { live: live.clone() });
                }
                continue;
            }

            if attempt >= config.max_retries {
                break;
            }
            attempt += 1;
            let delay = calculate_backoff(attempt, config.backoff_base, config.backoff_max);
            warn!(
                live = current,
                max = config.max_connections,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Connection ceiling reached, backing off"
            );
            std::thread::sleep(delay);
        }

        match config.slot_policy {
            SlotPolicy::BestEffort => {
                let now_live = live.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    live = now_live,
                    max = config.max_connections,
                    "Connection ceiling still reached after backoff, opening anyway"
                );
                Ok(SlotReservation { live: live.clone() })
            }
            SlotPolicy::Strict => {
                warn!(
                    max = config.max_connections,
                    "Connection ceiling still reached after backoff, refusing"
                );
                Err(Error::ResourceExhausted(config.max_connections))
            }
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let config = &self.inner.config;
        let connection = Connection::open(&config.path)?;
        connection.busy_timeout(config.busy_timeout)?;
        let mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %config.path, journal_mode = %mode, "Database connection configured");
        Ok(connection)
    }
}

fn run_in_transaction<T, F>(connection: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = connection.transaction().map_err(|e| {
        error!(error = %e, "Failed to begin transaction");
        Error::Transaction(e.to_string())
    })?;

    match f(&tx) {
        Ok(value) => {
            tx.commit().map_err(|e| {
                error!(error = %e, "Failed to commit transaction");
                Error::Transaction(e.to_string())
            })?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback() {
                error!(error = %rollback, "Failed to roll back transaction");
            }
            debug!(error = %err, "Unit of work rolled back");
            Err(err)
        }
    }
}

/// Exponential backoff with up to 10% jitter
fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt - 1))
        .min(max_ms);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms + jitter)
}
