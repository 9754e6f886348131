//! Session registry for live connections.
//!
//! Process-wide table mapping a recipient identity to its currently open
//! connection. At most one entry per identity; a second registration for an
//! already-registered identity keeps the existing handle
//! (first-registration-wins). No persistence; lifetime = process uptime.

pub mod handlers;
pub mod messages;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Close code sent to every session on server shutdown (1012 = service restart).
pub const SHUTDOWN_CLOSE_CODE: u16 = 1012;
pub const SHUTDOWN_CLOSE_REASON: &str = "server_shutdown";

/// The transport refused a frame; the connection is gone.
#[derive(Debug, thiserror::Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Seam between the registry and the underlying transport. Only a confirmed
/// transport-level send counts as success.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), ConnectionClosed>;
    async fn close(&self, code: u16, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// This connection now owns the identity's entry.
    Registered,
    /// Another connection already owns the entry; it was kept.
    AlreadyConnected,
    /// The registry is shutting down; no new sessions.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Expected outcome for offline recipients, not an error.
    NotConnected,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Arc<dyn ConnectionHandle>>>>,
    shutting_down: Arc<AtomicBool>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First-registration-wins: an existing entry is never replaced.
    pub async fn register(
        &self,
        recipient_id: Uuid,
        handle: Arc<dyn ConnectionHandle>,
    ) -> RegisterOutcome {
        let mut guard = self.inner.write().await;
        // Checked under the write lock: shutdown sets the flag before it
        // takes the lock to drain, so an insert can never land in a map
        // that has already been drained.
        if self.shutting_down.load(Ordering::SeqCst) {
            return RegisterOutcome::Rejected;
        }
        if guard.contains_key(&recipient_id) {
            RegisterOutcome::AlreadyConnected
        } else {
            guard.insert(recipient_id, handle);
            RegisterOutcome::Registered
        }
    }

    /// Remove the entry only if `handle` still owns it, so a connection that
    /// lost the registration race cannot evict the live one on disconnect.
    pub async fn deregister(
        &self,
        recipient_id: Uuid,
        handle: &Arc<dyn ConnectionHandle>,
    ) -> bool {
        let mut guard = self.inner.write().await;
        match guard.get(&recipient_id) {
            Some(existing) if Arc::ptr_eq(existing, handle) => {
                guard.remove(&recipient_id);
                true
            }
            _ => false,
        }
    }

    /// Push one frame to a recipient's live connection. A missing entry is an
    /// expected miss; a closed transport removes the stale entry and reports
    /// the same miss.
    pub async fn send(&self, recipient_id: Uuid, text: &str) -> SendOutcome {
        let handle = { self.inner.read().await.get(&recipient_id).cloned() };
        let Some(handle) = handle else {
            return SendOutcome::NotConnected;
        };
        match handle.send_text(text.to_string()).await {
            Ok(()) => SendOutcome::Delivered,
            Err(ConnectionClosed) => {
                if self.deregister(recipient_id, &handle).await {
                    tracing::debug!(recipient=%recipient_id, "removed stale session entry");
                }
                SendOutcome::NotConnected
            }
        }
    }

    /// Close every open session with the shutdown reason code and clear the
    /// table. Registrations arriving afterwards are rejected; no further
    /// sends reach a drained handle.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let drained: Vec<(Uuid, Arc<dyn ConnectionHandle>)> = {
            let mut guard = self.inner.write().await;
            guard.drain().collect()
        };
        for (recipient_id, handle) in drained {
            handle
                .close(SHUTDOWN_CLOSE_CODE, SHUTDOWN_CLOSE_REASON)
                .await;
            tracing::debug!(recipient=%recipient_id, "session closed for shutdown");
        }
    }

    pub async fn is_connected(&self, recipient_id: Uuid) -> bool {
        self.inner.read().await.contains_key(&recipient_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// In-memory connection recording every frame; can be told to start
    /// failing after N successful sends.
    #[derive(Default)]
    pub struct FakeConnection {
        pub sent: Mutex<Vec<String>>,
        pub closed: Mutex<Option<(u16, String)>>,
        fail_after: AtomicUsize,
    }

    impl FakeConnection {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                closed: Mutex::new(None),
                fail_after: AtomicUsize::new(usize::MAX),
            })
        }

        pub fn failing_after(n: usize) -> Arc<Self> {
            let conn = Self::new();
            conn.fail_after.store(n, Ordering::SeqCst);
            conn
        }

        pub fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnectionHandle for FakeConnection {
        async fn send_text(&self, text: String) -> Result<(), ConnectionClosed> {
            let mut sent = self.sent.lock().unwrap();
            if sent.len() >= self.fail_after.load(Ordering::SeqCst) {
                return Err(ConnectionClosed);
            }
            sent.push(text);
            Ok(())
        }

        async fn close(&self, code: u16, reason: &str) {
            *self.closed.lock().unwrap() = Some((code, reason.to_string()));
        }
    }
}
