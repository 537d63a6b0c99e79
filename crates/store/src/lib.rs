//! Durable key-value substrate for pulses.
//!
//! No SQL engine is pulled in for this: concurrency is low (a single-writer
//! daemon, a handful of ingress callers), so an in-memory map guarded by a
//! lock and persisted to a single JSON file is sufficient, matching how the
//! rest of this codebase's state stores work. The two covering indexes the
//! design calls for (`(status, scheduled_at, priority)` and `(scheduled_at,
//! status)`) are realized as iterator filter+sort over the map rather than
//! physical indexes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pulse_domain::{Error, Pulse, PulseStatus, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Schema version this build knows how to read. Startup refuses to serve a
/// store written by a version it doesn't recognize.
const SCHEMA_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct PersistedStore {
    schema_version: u32,
    next_id: u64,
    pulses: Vec<Pulse>,
}

pub struct Inner {
    pulses: HashMap<u64, Pulse>,
    next_id: u64,
}

pub struct Store {
    inner: parking_lot::RwLock<Inner>,
    persist_path: PathBuf,
}

impl Store {
    /// Load (or create) the store at `db_path`. Refuses to start if the
    /// on-disk schema version is newer/different from what this build
    /// understands. A corrupt (unparseable) file is treated as empty —
    /// matching the rest of this codebase's best-effort load philosophy —
    /// but an unrecognized schema version is a hard error, never silently
    /// downgraded or ignored.
    pub fn open(db_path: &Path) -> Result<Self> {
        let (pulses, next_id) = match std::fs::read_to_string(db_path) {
            Ok(raw) => match serde_json::from_str::<PersistedStore>(&raw) {
                Ok(persisted) => {
                    if persisted.schema_version != SCHEMA_VERSION {
                        return Err(Error::Config(format!(
                            "pulse store at {:?} has schema_version {}, this build only understands {}",
                            db_path, persisted.schema_version, SCHEMA_VERSION
                        )));
                    }
                    let map = persisted
                        .pulses
                        .into_iter()
                        .map(|p| (p.id, p))
                        .collect::<HashMap<_, _>>();
                    (map, persisted.next_id)
                }
                Err(e) => {
                    warn!(error = %e, path = ?db_path, "pulse store file unreadable, starting empty");
                    (HashMap::new(), 1)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?db_path, "no existing pulse store, starting empty");
                (HashMap::new(), 1)
            }
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            inner: parking_lot::RwLock::new(Inner { pulses, next_id }),
            persist_path: db_path.to_path_buf(),
        })
    }

    /// Run `f` against the locked in-memory state, then persist the result
    /// to disk. `f` itself is synchronous and must not block.
    pub async fn mutate<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Inner) -> T,
    {
        let result = {
            let mut guard = self.inner.write();
            f(&mut guard)
        };
        self.persist().await?;
        Ok(result)
    }

    pub fn get(&self, id: u64) -> Option<Pulse> {
        self.inner.read().pulses.get(&id).cloned()
    }

    /// Claimable pulses ordered by priority rank (critical first), then
    /// `scheduled_at` ascending within a priority class (FIFO).
    pub fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Pulse> {
        let guard = self.inner.read();
        let mut due: Vec<Pulse> = guard
            .pulses
            .values()
            .filter(|p| p.is_claimable(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });
        due.truncate(limit);
        due
    }

    /// Pulses in any of `statuses`, ordered by `scheduled_at` ascending.
    pub fn list_upcoming(&self, limit: usize, statuses: &[PulseStatus]) -> Vec<Pulse> {
        let guard = self.inner.read();
        let mut list: Vec<Pulse> = guard
            .pulses
            .values()
            .filter(|p| statuses.iter().any(|s| *s == p.status))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        list.truncate(limit);
        list
    }

    /// Counts of pulses by status, for `/api/status`.
    pub fn counts_by_status(&self) -> HashMap<PulseStatus, usize> {
        let guard = self.inner.read();
        let mut counts = HashMap::new();
        for p in guard.pulses.values() {
            *counts.entry(p.status).or_insert(0) += 1;
        }
        counts
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let guard = self.inner.read();
            PersistedStore {
                schema_version: SCHEMA_VERSION,
                next_id: guard.next_id,
                pulses: guard.pulses.values().cloned().collect(),
            }
        };
        let path = self.persist_path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &snapshot))
            .await
            .map_err(|e| Error::Other(format!("persist task panicked: {e}")))??;
        Ok(())
    }
}

fn write_atomically(path: &Path, snapshot: &PersistedStore) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

impl Inner {
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, pulse: Pulse) {
        self.pulses.insert(pulse.id, pulse);
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Pulse> {
        self.pulses.get_mut(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Pulse> {
        self.pulses.get(&id)
    }

    pub fn get_all_ids_with_status(&self, status: PulseStatus) -> Vec<u64> {
        self.pulses
            .values()
            .filter(|p| p.status == status)
            .map(|p| p.id)
            .collect()
    }
}
