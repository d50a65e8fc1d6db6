//! Durable per-node state store.
//!
//! Backed by SQLite with a single key-value table. Keys are namespaced:
//! `instance/<id>`, `event/<id>/<seq>`, `reservation/<machine_id>`, `node`.
//! Event sequence numbers are zero-padded in the key so lexicographic order
//! equals numeric order. Values are JSON.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::cluster::Node;
use crate::instance::{Instance, InstanceEvent};
use crate::reservations::Reservation;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed; no further operations are possible.
    #[error("store is closed")]
    Closed,

    #[error("not found: {0}")]
    NotFound(String),

    /// An event append that would break the contiguous sequence.
    #[error("invalid event sequence for {instance_id}: expected {expected}, got {got}")]
    InvalidSequence {
        instance_id: String,
        expected: u64,
        got: u64,
    },

    /// Persisted data failed to decode.
    #[error("store corruption: {0}")]
    Corruption(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corruption(err.to_string())
    }
}

fn instance_key(id: &str) -> String {
    format!("instance/{id}")
}

fn event_key(instance_id: &str, sequence: u64) -> String {
    format!("event/{instance_id}/{sequence:020}")
}

fn event_prefix(instance_id: &str) -> String {
    format!("event/{instance_id}/")
}

fn reservation_key(machine_id: &str) -> String {
    format!("reservation/{machine_id}")
}

const NODE_KEY: &str = "node";

/// LIKE pattern matching every key under `prefix`, with SQL wildcards in the
/// prefix escaped.
fn like_prefix(prefix: &str) -> String {
    format!(
        "{}%",
        prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_")
    )
}

/// Durable key-value store for instances, events, reservations and the node
/// record.
pub struct Store {
    conn: Mutex<Option<Connection>>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corruption(format!("create data dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        // Writes must be durable before returning.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        Self::init_schema(&conn)?;
        debug!("store opened");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Close the store. Idempotent; all later operations fail with
    /// [`StoreError::Closed`].
    pub fn close(&self) {
        let mut guard = self.conn.lock().unwrap();
        if guard.take().is_some() {
            debug!("store closed");
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().unwrap();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn put_raw<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, bytes],
        )?;
        Ok(())
    }

    fn get_raw<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>, StoreError> {
        let bytes: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_raw(conn: &Connection, key: &str) -> Result<(), StoreError> {
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn list_prefix<T: DeserializeOwned>(
        conn: &Connection,
        prefix: &str,
    ) -> Result<Vec<T>, StoreError> {
        let pattern = like_prefix(prefix);
        let mut stmt =
            conn.prepare("SELECT value FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")?;
        let rows = stmt.query_map(params![pattern], |row| row.get::<_, Vec<u8>>(0))?;

        let mut out = Vec::new();
        for bytes in rows {
            out.push(serde_json::from_slice(&bytes?)?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Instances
    // -------------------------------------------------------------------------

    pub fn put_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.with_conn(|conn| Self::put_raw(conn, &instance_key(&instance.id), instance))
    }

    pub fn get_instance(&self, id: &str) -> Result<Instance, StoreError> {
        self.with_conn(|conn| {
            Self::get_raw(conn, &instance_key(id))?
                .ok_or_else(|| StoreError::NotFound(format!("instance {id}")))
        })
    }

    /// Delete an instance row and its entire event log.
    pub fn delete_instance(&self, id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM kv WHERE key = ?1", params![instance_key(id)])?;
            let pattern = like_prefix(&event_prefix(id));
            tx.execute(
                "DELETE FROM kv WHERE key LIKE ?1 ESCAPE '\\'",
                params![pattern],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        self.with_conn(|conn| Self::list_prefix(conn, "instance/"))
    }

    /// Atomically write the instance row (at its first status) and its
    /// sequence-0 event.
    pub fn create_instance(
        &self,
        instance: &Instance,
        event: &InstanceEvent,
    ) -> Result<(), StoreError> {
        self.put_instance_with_event(instance, event)
    }

    /// Atomically write an updated instance row and the event recording the
    /// transition. Fails if the event's sequence is not exactly one past the
    /// last stored event (0 for the first).
    pub fn put_instance_with_event(
        &self,
        instance: &Instance,
        event: &InstanceEvent,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let expected = match Self::last_event_in(&tx, &instance.id)? {
                Some(last) => last.sequence + 1,
                None => 0,
            };
            if event.sequence != expected {
                return Err(StoreError::InvalidSequence {
                    instance_id: instance.id.clone(),
                    expected,
                    got: event.sequence,
                });
            }

            Self::put_raw(&tx, &instance_key(&instance.id), instance)?;
            Self::put_raw(&tx, &event_key(&event.instance_id, event.sequence), event)?;
            tx.commit()?;
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    fn last_event_in(
        conn: &Connection,
        instance_id: &str,
    ) -> Result<Option<InstanceEvent>, StoreError> {
        let pattern = like_prefix(&event_prefix(instance_id));
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key DESC LIMIT 1",
                params![pattern],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Append a single event without touching the instance row. Fails unless
    /// `event.sequence` is exactly `last + 1` (0 for the first event).
    pub fn append_event(&self, event: &InstanceEvent) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let expected = match Self::last_event_in(&tx, &event.instance_id)? {
                Some(last) => last.sequence + 1,
                None => 0,
            };
            if event.sequence != expected {
                return Err(StoreError::InvalidSequence {
                    instance_id: event.instance_id.clone(),
                    expected,
                    got: event.sequence,
                });
            }
            Self::put_raw(&tx, &event_key(&event.instance_id, event.sequence), event)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Highest-sequence event, or `None` when the instance has no events.
    pub fn get_last_instance_event(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceEvent>, StoreError> {
        self.with_conn(|conn| Self::last_event_in(conn, instance_id))
    }

    /// Full event log in sequence order.
    pub fn list_instance_events(
        &self,
        instance_id: &str,
    ) -> Result<Vec<InstanceEvent>, StoreError> {
        self.with_conn(|conn| Self::list_prefix(conn, &event_prefix(instance_id)))
    }

    // -------------------------------------------------------------------------
    // Reservations
    // -------------------------------------------------------------------------

    pub fn put_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            Self::put_raw(conn, &reservation_key(&reservation.machine_id), reservation)
        })
    }

    pub fn get_reservation(&self, machine_id: &str) -> Result<Reservation, StoreError> {
        self.with_conn(|conn| {
            Self::get_raw(conn, &reservation_key(machine_id))?
                .ok_or_else(|| StoreError::NotFound(format!("reservation {machine_id}")))
        })
    }

    pub fn delete_reservation(&self, machine_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| Self::delete_raw(conn, &reservation_key(machine_id)))
    }

    pub fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        self.with_conn(|conn| Self::list_prefix(conn, "reservation/"))
    }

    // -------------------------------------------------------------------------
    // Node record
    // -------------------------------------------------------------------------

    pub fn put_node(&self, node: &Node) -> Result<(), StoreError> {
        self.with_conn(|conn| Self::put_raw(conn, NODE_KEY, node))
    }

    pub fn get_node(&self) -> Result<Option<Node>, StoreError> {
        self.with_conn(|conn| Self::get_raw(conn, NODE_KEY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceConfig, InstanceNetwork, InstanceStatus, Resources};
    use chrono::Utc;

    fn test_instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            machine_id: format!("machine-{id}"),
            config: InstanceConfig {
                image: "busybox:latest".to_string(),
                entrypoint: None,
                cmd: None,
                user: None,
                env: vec![],
                resources: Resources {
                    cpus: 1,
                    memory_bytes: 256 * 1024 * 1024,
                },
            },
            network: InstanceNetwork {
                ip: "10.0.0.2".parse().unwrap(),
                subnet: "10.0.0.0".parse().unwrap(),
                prefix_len: 30,
                gateway: "10.0.0.1".parse().unwrap(),
                broadcast: "10.0.0.3".parse().unwrap(),
            },
            image_config: None,
            status: InstanceStatus::Creating,
            created_at: Utc::now(),
        }
    }

    fn test_event(id: &str, sequence: u64, new_status: InstanceStatus) -> InstanceEvent {
        InstanceEvent {
            instance_id: id.to_string(),
            sequence,
            timestamp: Utc::now(),
            prior_status: InstanceStatus::Creating,
            new_status,
            error: None,
            payload: None,
        }
    }

    #[test]
    fn instance_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let instance = test_instance("inst-1");

        store.put_instance(&instance).unwrap();
        let fetched = store.get_instance("inst-1").unwrap();
        assert_eq!(fetched, instance);

        assert_eq!(store.list_instances().unwrap().len(), 1);

        store.delete_instance("inst-1").unwrap();
        assert!(matches!(
            store.get_instance("inst-1"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn event_sequences_are_contiguous() {
        let store = Store::open_in_memory().unwrap();

        assert!(store.get_last_instance_event("inst-1").unwrap().is_none());

        store
            .append_event(&test_event("inst-1", 0, InstanceStatus::Creating))
            .unwrap();
        store
            .append_event(&test_event("inst-1", 1, InstanceStatus::Preparing))
            .unwrap();

        // A gap is rejected.
        let err = store
            .append_event(&test_event("inst-1", 3, InstanceStatus::Starting))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidSequence {
                expected: 2,
                got: 3,
                ..
            }
        ));

        // A replayed sequence is rejected too.
        assert!(store
            .append_event(&test_event("inst-1", 1, InstanceStatus::Starting))
            .is_err());

        let last = store.get_last_instance_event("inst-1").unwrap().unwrap();
        assert_eq!(last.sequence, 1);
        assert_eq!(last.new_status, InstanceStatus::Preparing);
    }

    #[test]
    fn event_order_survives_many_sequences() {
        let store = Store::open_in_memory().unwrap();
        for sequence in 0..25 {
            store
                .append_event(&test_event("inst-1", sequence, InstanceStatus::Running))
                .unwrap();
        }
        let events = store.list_instance_events("inst-1").unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn events_are_isolated_per_instance() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_event(&test_event("inst-1", 0, InstanceStatus::Creating))
            .unwrap();
        store
            .append_event(&test_event("inst-2", 0, InstanceStatus::Creating))
            .unwrap();

        assert_eq!(store.list_instance_events("inst-1").unwrap().len(), 1);
        assert_eq!(store.list_instance_events("inst-2").unwrap().len(), 1);
    }

    #[test]
    fn put_instance_with_event_is_sequence_checked() {
        let store = Store::open_in_memory().unwrap();
        let mut instance = test_instance("inst-1");

        store
            .create_instance(&instance, &test_event("inst-1", 0, InstanceStatus::Creating))
            .unwrap();

        instance.status = InstanceStatus::Preparing;
        let err = store
            .put_instance_with_event(
                &instance,
                &test_event("inst-1", 2, InstanceStatus::Preparing),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidSequence { .. }));

        // The failed write must not have touched the instance row.
        assert_eq!(
            store.get_instance("inst-1").unwrap().status,
            InstanceStatus::Creating
        );
    }

    #[test]
    fn delete_instance_removes_event_log() {
        let store = Store::open_in_memory().unwrap();
        let instance = test_instance("inst-1");
        store
            .create_instance(&instance, &test_event("inst-1", 0, InstanceStatus::Creating))
            .unwrap();

        store.delete_instance("inst-1").unwrap();
        assert!(store.get_last_instance_event("inst-1").unwrap().is_none());
        // A fresh event log starts at 0 again.
        store
            .append_event(&test_event("inst-1", 0, InstanceStatus::Creating))
            .unwrap();
    }

    #[test]
    fn close_is_idempotent_and_fails_later_operations() {
        let store = Store::open_in_memory().unwrap();
        store.close();
        store.close();

        assert!(matches!(store.list_instances(), Err(StoreError::Closed)));
        assert!(matches!(
            store.put_instance(&test_instance("inst-1")),
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn node_record_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_node().unwrap().is_none());

        let node = Node {
            id: "node-1".to_string(),
            address: "10.1.1.1:8080".to_string(),
            region: "local".to_string(),
            heartbeated_at: Utc::now(),
        };
        store.put_node(&node).unwrap();
        assert_eq!(store.get_node().unwrap().unwrap().id, "node-1");
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = Store::open(&path).unwrap();
            store.put_instance(&test_instance("inst-1")).unwrap();
            store.close();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.list_instances().unwrap().len(), 1);
    }
}
