use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Clone, Debug)]
pub struct Session {
    pub session_id: String,
    pub user_urn: String,
    pub authenticated: bool,
    pub last_activity: DateTime<Utc>,
}

/// Process-wide table of authenticated sessions. Ids are opaque to clients:
/// handed out as "token" in the auth response and echoed back as
/// "session_id" in later requests.
#[derive(Default)]
pub struct SessionRegistry {
    records: Mutex<HashMap<String, Session>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, user_urn: &str) -> String {
        let session_id = format!("session_{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let session = Session {
            session_id: session_id.clone(),
            user_urn: user_urn.to_owned(),
            authenticated: true,
            last_activity: Utc::now(),
        };

        self.records
            .lock()
            .expect("session registry lock poisoned")
            .insert(session_id.clone(), session);

        session_id
    }

    /// Refreshes last_activity and returns the bound urn, iff the session
    /// exists.
    pub fn touch(&self, session_id: &str) -> Option<String> {
        let mut records = self.records.lock().expect("session registry lock poisoned");
        let session = records.get_mut(session_id)?;
        session.last_activity = Utc::now();
        Some(session.user_urn.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.records
            .lock()
            .expect("session registry lock poisoned")
            .remove(session_id);
    }

    /// Drops sessions idle past the timeout, and any not flagged
    /// authenticated. Returns how many were removed.
    pub fn purge_expired(&self, timeout: Duration) -> usize {
        let now = Utc::now();
        let mut records = self.records.lock().expect("session registry lock poisoned");
        let before = records.len();
        records.retain(|_, session| {
            session.authenticated
                && (now - session.last_activity).num_seconds() <= timeout.as_secs() as i64
        });
        before - records.len()
    }

    pub fn count(&self) -> usize {
        self.records
            .lock()
            .expect("session registry lock poisoned")
            .len()
    }

    pub fn snapshot(&self, session_id: &str) -> Option<Session> {
        self.records
            .lock()
            .expect("session registry lock poisoned")
            .get(session_id)
            .cloned()
    }
}
