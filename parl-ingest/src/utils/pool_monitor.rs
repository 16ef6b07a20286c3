//! Connection pool monitoring utilities
//!
//! Instrumented transactions that log how long a connection waited in the
//! pool and how long it was held, for diagnosing writer contention between
//! concurrent batches.

use parl_common::Result;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::time::Instant;
use tracing::Level;

/// Logs hold time when a transaction ends, however it ends
struct HoldTimer {
    caller: &'static str,
    acquired_at: Instant,
    released: bool,
}

/// Log level for a connection held for `held_ms`
fn hold_level(held_ms: u128) -> Level {
    if held_ms > 2000 {
        Level::WARN
    } else if held_ms > 1000 {
        Level::INFO
    } else {
        Level::DEBUG
    }
}

impl HoldTimer {
    fn release(&mut self, how: &'static str) {
        self.released = true;
        let held_ms = self.acquired_at.elapsed().as_millis();
        let level = hold_level(held_ms);
        if level == Level::WARN {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                how,
                "Long transaction, writers in other batches were blocked"
            );
        } else if level == Level::INFO {
            tracing::info!(caller = self.caller, held_ms, how, "Transaction held longer than expected (>1s)");
        } else {
            tracing::debug!(caller = self.caller, held_ms, how, "Connection released");
        }
    }
}

impl Drop for HoldTimer {
    fn drop(&mut self) {
        if !self.released {
            let held_ms = self.acquired_at.elapsed().as_millis();
            tracing::debug!(caller = self.caller, held_ms, "Connection released (drop, rolled back)");
        }
    }
}

/// Transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction<'c> {
    tx: Transaction<'c, Sqlite>,
    timer: HoldTimer,
}

impl<'c> MonitoredTransaction<'c> {
    /// Commit the transaction and log release timing
    pub async fn commit(self) -> Result<()> {
        let MonitoredTransaction { tx, mut timer } = self;
        tx.commit().await?;
        timer.release("commit");
        Ok(())
    }

    /// Roll back the transaction and log release timing
    pub async fn rollback(self) -> Result<()> {
        let MonitoredTransaction { tx, mut timer } = self;
        tx.rollback().await?;
        timer.release("rollback");
        Ok(())
    }

    /// Connection to run statements on
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

/// Begin a monitored transaction
///
/// # Example
/// ```ignore
/// let mut tx = begin_monitored(&pool, "upsert::write_chunk").await?;
/// sqlx::query("...").execute(tx.conn()).await?;
/// tx.commit().await?;
/// ```
pub async fn begin_monitored<'c>(
    pool: &'c sqlx::SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction<'c>> {
    let start = Instant::now();

    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 1000 {
        tracing::warn!(caller, wait_ms, "Slow connection acquisition, pool may be saturated");
    } else {
        tracing::trace!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction {
        tx,
        timer: HoldTimer {
            caller,
            acquired_at: Instant::now(),
            released: false,
        },
    })
}
