//! Worker session hub
//!
//! One logical channel per connected worker session. The scheduler pushes
//! [`ServerFrame`]s into the session's queue; the SSE handler drains it to
//! the worker. Sessions are keyed by the worker-generated `session_id`
//! (fresh per connect); the stable worker name is bound once the `Register`
//! frame arrives.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use flux_core::ServerFrame;

const SESSION_QUEUE_CAPACITY: usize = 64;

struct Session {
    tx: mpsc::Sender<ServerFrame>,
    worker_name: name_slot::NameSlot,
}

// A session's name is written once (at Register) and only read after
mod name_slot {
    use std::sync::OnceLock;

    #[derive(Default)]
    pub struct NameSlot(OnceLock<String>);

    impl NameSlot {
        pub fn set(&self, name: String) {
            let _ = self.0.set(name);
        }

        pub fn get(&self) -> Option<&str> {
            self.0.get().map(|s| s.as_str())
        }
    }
}

/// Registry of live worker sessions
#[derive(Default)]
pub struct WorkerHub {
    sessions: DashMap<Uuid, Session>,
}

impl WorkerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session channel; the receiver feeds the worker's SSE stream
    pub fn connect(&self, session_id: Uuid) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        self.sessions.insert(
            session_id,
            Session {
                tx,
                worker_name: Default::default(),
            },
        );
        debug!(%session_id, "worker session connected");
        rx
    }

    /// Bind the stable worker name once registration arrives
    pub fn bind_name(&self, session_id: Uuid, name: &str) {
        if let Some(session) = self.sessions.get(&session_id) {
            session.worker_name.set(name.to_string());
        }
    }

    pub fn worker_name(&self, session_id: Uuid) -> Option<String> {
        self.sessions
            .get(&session_id)
            .and_then(|s| s.worker_name.get().map(|n| n.to_string()))
    }

    pub fn disconnect(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
        debug!(%session_id, "worker session disconnected");
    }

    pub fn is_connected(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queue a frame for a session; false when the session is gone or its
    /// queue is full (both mean the worker is effectively unreachable)
    pub async fn send(&self, session_id: Uuid, frame: ServerFrame) -> bool {
        let tx = match self.sessions.get(&session_id) {
            Some(session) => session.tx.clone(),
            None => return false,
        };
        tx.send(frame).await.is_ok()
    }

    /// Broadcast a frame to every connected session (shutdown)
    pub async fn broadcast(&self, frame: ServerFrame) {
        let txs: Vec<mpsc::Sender<ServerFrame>> =
            self.sessions.iter().map(|s| s.tx.clone()).collect();
        for tx in txs {
            let _ = tx.send(frame.clone()).await;
        }
    }
}
