//! Per-shard sequence counters.
//!
//! A counter row holds the *next* sequence for a shard pair. Allocation reads
//! it, bumps it and commits in one transaction, returning the pre-increment
//! value. Numbers are never handed out twice; numbers whose write later fails
//! are skipped for good.

use crate::config::AllocationConfig;
use crate::error::{Result, VaultError};
use crate::storage::metadata_store::{is_contention, open_connection};
use crate::storage::shard::ShardKey;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Atomic counter backend.
///
/// `try_allocate` performs one attempt. Transient contention must surface as
/// `VaultError::SequenceConflict` so `SequenceAllocator` can retry it.
pub trait CounterStore: Send + Sync {
    fn try_allocate(&self, shard: &ShardKey) -> Result<u64>;

    /// The value the next allocation would return, if the shard was seen.
    fn next_sequence(&self, shard: &ShardKey) -> Result<Option<u64>>;
}

pub struct SqliteCounterStore {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteCounterStore {
    pub fn new(db_path: PathBuf, busy_timeout: Duration) -> Result<Self> {
        let store = Self {
            db_path,
            busy_timeout,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        Ok(open_connection(&self.db_path, self.busy_timeout)?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS shard_counters (
                shard1 TEXT NOT NULL,
                shard2 TEXT NOT NULL,
                next_sequence INTEGER NOT NULL,
                UNIQUE (shard1, shard2)
            )",
            [],
        )?;
        Ok(())
    }

    fn allocate_in_transaction(&self, shard: &ShardKey) -> rusqlite::Result<u64> {
        let mut conn = open_connection(&self.db_path, self.busy_timeout)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT next_sequence FROM shard_counters WHERE shard1 = ?1 AND shard2 = ?2",
                params![shard.shard1, shard.shard2],
                |row| row.get(0),
            )
            .optional()?;

        let sequence = match current {
            Some(next) => {
                tx.execute(
                    "UPDATE shard_counters SET next_sequence = next_sequence + 1
                     WHERE shard1 = ?1 AND shard2 = ?2",
                    params![shard.shard1, shard.shard2],
                )?;
                next
            }
            None => {
                tx.execute(
                    "INSERT INTO shard_counters (shard1, shard2, next_sequence) VALUES (?1, ?2, 2)",
                    params![shard.shard1, shard.shard2],
                )?;
                1
            }
        };

        tx.commit()?;
        Ok(sequence as u64)
    }
}

impl CounterStore for SqliteCounterStore {
    fn try_allocate(&self, shard: &ShardKey) -> Result<u64> {
        self.allocate_in_transaction(shard).map_err(|error| {
            if is_contention(&error) {
                VaultError::SequenceConflict {
                    shard: shard.to_string(),
                }
            } else {
                VaultError::Sqlite(error)
            }
        })
    }

    fn next_sequence(&self, shard: &ShardKey) -> Result<Option<u64>> {
        let conn = self.get_conn()?;
        let next: Option<i64> = conn
            .query_row(
                "SELECT next_sequence FROM shard_counters WHERE shard1 = ?1 AND shard2 = ?2",
                params![shard.shard1, shard.shard2],
                |row| row.get(0),
            )
            .optional()?;
        Ok(next.map(|n| n as u64))
    }
}

/// Mutex-guarded counters for tests and embedded single-process use.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<ShardKey, u64>>,
    injected_conflicts: AtomicU32,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` allocation attempts fail with `SequenceConflict`.
    pub fn with_injected_conflicts(count: u32) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            injected_conflicts: AtomicU32::new(count),
        }
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CounterStore for MemoryCounterStore {
    fn try_allocate(&self, shard: &ShardKey) -> Result<u64> {
        if self.take_injected_conflict() {
            return Err(VaultError::SequenceConflict {
                shard: shard.to_string(),
            });
        }

        let mut counters = self
            .counters
            .lock()
            .map_err(|_| VaultError::Internal("counter mutex poisoned".to_string()))?;
        let next = counters.entry(shard.clone()).or_insert(1);
        let sequence = *next;
        *next += 1;
        Ok(sequence)
    }

    fn next_sequence(&self, shard: &ShardKey) -> Result<Option<u64>> {
        let counters = self
            .counters
            .lock()
            .map_err(|_| VaultError::Internal("counter mutex poisoned".to_string()))?;
        Ok(counters.get(shard).copied())
    }
}

/// Retries transient counter contention with bounded exponential backoff.
#[derive(Clone)]
pub struct SequenceAllocator {
    store: Arc<dyn CounterStore>,
    policy: AllocationConfig,
}

impl SequenceAllocator {
    pub fn new(store: Arc<dyn CounterStore>, policy: AllocationConfig) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn allocate_next(&self, shard: &ShardKey) -> Result<u64> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.store.try_allocate(shard) {
                Ok(sequence) => {
                    tracing::debug!(
                        "allocated sequence {} for shard {} (attempt {})",
                        sequence,
                        shard,
                        attempt
                    );
                    return Ok(sequence);
                }
                Err(VaultError::SequenceConflict { .. }) if attempt < max_attempts => {
                    let delay = self.policy.backoff_for(attempt);
                    tracing::warn!(
                        "sequence conflict on shard {}, retrying in {:?} (attempt {}/{})",
                        shard,
                        delay,
                        attempt,
                        max_attempts
                    );
                    std::thread::sleep(delay);
                }
                Err(VaultError::SequenceConflict { .. }) => {
                    return Err(VaultError::AllocationFailed {
                        shard: shard.to_string(),
                        attempts: attempt,
                    });
                }
                Err(error) => return Err(error),
            }
        }
    }
}
