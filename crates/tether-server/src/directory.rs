//! Read-only view of every account's sessions.
//!
//! Registry actors publish a full snapshot after each change and on every
//! heartbeat interval. Readers never touch an actor; they see the last
//! snapshot, or nothing if it is older than the configured maximum age.
//!
//! Each actor publishes under a generation drawn from
//! [`SessionDirectory::next_generation`]. A newer generation's snapshot is
//! never overwritten or removed by an older actor still draining its queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tether_core::{AccountId, ConnectionId};
use tokio::time::Instant;

use crate::websocket::connection::{Connection, ConnectionState, DeviceMetadata};

/// One connection as reported by `status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Device metadata.
    pub device_metadata: DeviceMetadata,
    /// Advertised capabilities, lifted out of the metadata.
    pub capabilities: Vec<String>,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Last heartbeat, or admission time.
    pub last_seen: DateTime<Utc>,
    /// Admission time.
    pub created_at: DateTime<Utc>,
}

impl From<&Connection> for SessionStatus {
    fn from(conn: &Connection) -> Self {
        Self {
            connection_id: conn.id().clone(),
            device_metadata: conn.metadata().clone(),
            capabilities: conn.metadata().capabilities.clone(),
            state: conn.state(),
            last_seen: conn.last_heartbeat_at().unwrap_or_else(|| conn.created_at()),
            created_at: conn.created_at(),
        }
    }
}

/// Result of a directory read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirectoryLookup {
    /// A snapshot within the maximum age.
    Fresh(Vec<SessionStatus>),
    /// A snapshot exists but is too old to trust.
    Stale {
        /// Snapshot age.
        age: Duration,
    },
    /// No snapshot for this account.
    Absent,
}

struct Snapshot {
    generation: u64,
    sessions: Vec<SessionStatus>,
    published_at: Instant,
}

/// Shared directory of per-account snapshots.
pub struct SessionDirectory {
    snapshots: RwLock<HashMap<AccountId, Snapshot>>,
    generations: AtomicU64,
    max_age: Duration,
}

impl SessionDirectory {
    /// Directory treating snapshots older than `max_age` as stale.
    pub fn new(max_age: Duration) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(1),
            max_age,
        }
    }

    /// A generation no earlier caller has received.
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Replace the snapshot for `account` unless a newer generation owns it.
    pub fn publish(&self, account: &AccountId, generation: u64, sessions: Vec<SessionStatus>) {
        let mut snapshots = self.snapshots.write();
        if snapshots
            .get(account)
            .is_some_and(|snap| snap.generation > generation)
        {
            return;
        }
        let _ = snapshots.insert(
            account.clone(),
            Snapshot {
                generation,
                sessions,
                published_at: Instant::now(),
            },
        );
    }

    /// Drop the snapshot for `account` if `generation` published it.
    pub fn remove(&self, account: &AccountId, generation: u64) {
        let mut snapshots = self.snapshots.write();
        if snapshots
            .get(account)
            .is_some_and(|snap| snap.generation == generation)
        {
            let _ = snapshots.remove(account);
        }
    }

    /// Read the snapshot for `account`.
    pub fn lookup(&self, account: &AccountId) -> DirectoryLookup {
        let snapshots = self.snapshots.read();
        match snapshots.get(account) {
            None => DirectoryLookup::Absent,
            Some(snap) => {
                let age = snap.published_at.elapsed();
                if age > self.max_age {
                    DirectoryLookup::Stale { age }
                } else {
                    DirectoryLookup::Fresh(snap.sessions.clone())
                }
            }
        }
    }

    /// Connections across all fresh snapshots.
    pub fn connection_count(&self) -> usize {
        self.snapshots
            .read()
            .values()
            .filter(|s| s.published_at.elapsed() <= self.max_age)
            .map(|s| s.sessions.len())
            .sum()
    }

    /// Accounts with a snapshot.
    pub fn account_count(&self) -> usize {
        self.snapshots.read().len()
    }
}
