//! Per-process map from session id to the live socket this process holds.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::protocol::Frame;

/// The sending half of an accepted client socket.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    async fn send_frame(&self, frame: &Frame) -> Result<(), String>;

    async fn close(&self, code: u16, reason: &str);
}

#[derive(Clone)]
pub struct RegistryEntry {
    /// Distinguishes sockets that registered under the same session id.
    pub conn_id: Uuid,
    pub conn: Arc<dyn ClientConnection>,
}

/// One lock guards the whole map; every operation is a short critical
/// section and never awaits while holding it.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a socket to a session, returning the entry it displaced.
    pub fn insert(
        &self,
        session_id: &str,
        conn_id: Uuid,
        conn: Arc<dyn ClientConnection>,
    ) -> Option<RegistryEntry> {
        self.entries
            .lock()
            .insert(session_id.to_string(), RegistryEntry { conn_id, conn })
    }

    pub fn get(&self, session_id: &str) -> Option<RegistryEntry> {
        self.entries.lock().get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.lock().contains_key(session_id)
    }

    pub fn remove(&self, session_id: &str) -> Option<RegistryEntry> {
        self.entries.lock().remove(session_id)
    }

    /// Remove the entry only if it still belongs to `conn_id`. Returns
    /// whether an entry was removed.
    pub fn remove_connection(&self, session_id: &str, conn_id: Uuid) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(session_id) {
            Some(entry) if entry.conn_id == conn_id => {
                entries.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Whether `conn_id` currently owns the entry for `session_id`.
    pub fn is_owned_by(&self, session_id: &str, conn_id: Uuid) -> bool {
        self.entries
            .lock()
            .get(session_id)
            .is_some_and(|entry| entry.conn_id == conn_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::{ClientConnection, ConnectionRegistry};
    use crate::protocol::Frame;

    /// Records frames instead of writing to a socket.
    #[derive(Default)]
    pub(crate) struct RecordingConnection {
        pub(crate) frames: Mutex<Vec<Frame>>,
        pub(crate) closed: Mutex<Option<(u16, String)>>,
        pub(crate) fail_sends: bool,
    }

    impl RecordingConnection {
        pub(crate) fn failing() -> Self {
            Self {
                fail_sends: true,
                ..Self::default()
            }
        }

        pub(crate) fn events(&self) -> Vec<String> {
            self.frames.lock().iter().map(|f| f.event.clone()).collect()
        }
    }

    #[async_trait]
    impl ClientConnection for RecordingConnection {
        async fn send_frame(&self, frame: &Frame) -> Result<(), String> {
            if self.fail_sends {
                return Err("socket closed".into());
            }
            self.frames.lock().push(frame.clone());
            Ok(())
        }

        async fn close(&self, code: u16, reason: &str) {
            *self.closed.lock() = Some((code, reason.to_string()));
        }
    }

    #[test]
    fn insert_returns_displaced_entry() {
        let registry = ConnectionRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert!(registry
            .insert("s1", first, Arc::new(RecordingConnection::default()))
            .is_none());
        let displaced = registry
            .insert("s1", second, Arc::new(RecordingConnection::default()))
            .unwrap();
        assert_eq!(displaced.conn_id, first);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_connection_cannot_remove_newer_entry() {
        let registry = ConnectionRegistry::new();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        registry.insert("s1", new, Arc::new(RecordingConnection::default()));

        assert!(!registry.remove_connection("s1", old));
        assert!(registry.is_owned_by("s1", new));
        assert!(registry.remove_connection("s1", new));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_insert_and_remove_leave_consistent_map() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let id = format!("s{}", n % 10);
                        let conn_id = Uuid::new_v4();
                        registry.insert(&id, conn_id, Arc::new(RecordingConnection::default()));
                        if (n + i) % 2 == 0 {
                            registry.remove_connection(&id, conn_id);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.len() <= 10);
        assert_eq!(registry.session_ids().len(), registry.len());
    }
}
