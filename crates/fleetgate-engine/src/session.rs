//! Session store
//!
//! In-memory map of active sessions with write-through to the sessions
//! table. Session ids are random 32-bit values, collision-checked
//! against the live map; opening a session evicts any prior session the
//! same device holds, so at most one session per device is active.
//! Pending device commands ride along here because they are delivered
//! through whichever session the device contacts us on next.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use fleetgate_core::config::SessionConfig;
use fleetgate_core::{Command, Imei, Protocol, Result};
use fleetgate_database::{Gateway, SessionRecord};
use std::sync::Arc;
use tracing::debug;

/// One active session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    /// Session id issued at login
    pub session_id: u32,
    /// Owning device IMEI
    pub imei: Imei,
    /// Protocol the session belongs to
    pub protocol: Protocol,
    /// Remote endpoint of the last valid packet
    pub endpoint: String,
    /// When the session was opened
    pub opened_at: DateTime<Utc>,
    /// When the session expires unless refreshed
    pub expires_at: DateTime<Utc>,
}

impl SessionEntry {
    fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id,
            imei: self.imei,
            protocol: self.protocol,
            endpoint: self.endpoint.clone(),
            opened_at: self.opened_at,
            expires_at: self.expires_at,
        }
    }
}

/// In-memory session store with database write-through
pub struct SessionStore {
    gateway: Arc<dyn Gateway>,
    config: SessionConfig,
    sessions: DashMap<u32, SessionEntry>,
    by_device: DashMap<u64, u32>,
    pending: DashMap<u64, Command>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new(gateway: Arc<dyn Gateway>, config: SessionConfig) -> Self {
        Self {
            gateway,
            config,
            sessions: DashMap::new(),
            by_device: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    fn ttl(&self, protocol: Protocol) -> Duration {
        let secs = match protocol {
            Protocol::Avl => self.config.avl_ttl_secs,
            _ => self.config.stream_ttl_secs,
        };
        Duration::seconds(secs as i64)
    }

    /// Open a session for a device, evicting any session it already
    /// holds. Returns the new session id.
    pub async fn open(
        &self,
        imei: Imei,
        protocol: Protocol,
        endpoint: &str,
    ) -> Result<u32> {
        if let Some((_, old_id)) = self.by_device.remove(&imei.as_u64()) {
            self.sessions.remove(&old_id);
            self.gateway.delete_session(old_id).await?;
            debug!(imei = %imei, session_id = old_id, "evicted prior session");
        }

        let session_id = loop {
            let candidate = rand::random::<u32>();
            if candidate != 0 && !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let now = Utc::now();
        let entry = SessionEntry {
            session_id,
            imei,
            protocol,
            endpoint: endpoint.to_string(),
            opened_at: now,
            expires_at: now + self.ttl(protocol),
        };
        self.gateway.upsert_session(&entry.to_record()).await?;
        self.sessions.insert(session_id, entry);
        self.by_device.insert(imei.as_u64(), session_id);
        metrics::counter!("fleetgate_sessions_opened_total").increment(1);
        Ok(session_id)
    }

    /// Look up a live session; expired entries count as misses.
    #[must_use]
    pub fn lookup(&self, session_id: u32) -> Option<SessionEntry> {
        let entry = self.sessions.get(&session_id)?;
        if entry.expires_at < Utc::now() {
            return None;
        }
        Some(entry.clone())
    }

    /// Refresh a session's endpoint and TTL; called on every valid
    /// packet that carries the session id.
    pub async fn refresh(&self, session_id: u32, endpoint: &str) -> Result<()> {
        let record = {
            let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                return Ok(());
            };
            entry.endpoint = endpoint.to_string();
            entry.expires_at = Utc::now() + self.ttl(entry.protocol);
            entry.to_record()
        };
        self.gateway.upsert_session(&record).await
    }

    /// Close one session.
    pub async fn close(&self, session_id: u32) -> Result<()> {
        if let Some((_, entry)) = self.sessions.remove(&session_id) {
            self.by_device.remove(&entry.imei.as_u64());
        }
        self.gateway.delete_session(session_id).await
    }

    /// Drop expired sessions from the map and the table; returns how
    /// many in-memory entries went.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<u32> = self
            .sessions
            .iter()
            .filter(|entry| entry.expires_at < now)
            .map(|entry| entry.session_id)
            .collect();
        for session_id in &expired {
            if let Some((_, entry)) = self.sessions.remove(session_id) {
                self.by_device.remove(&entry.imei.as_u64());
            }
        }
        self.gateway.delete_expired_sessions(now).await?;
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired sessions");
        }
        Ok(expired.len())
    }

    /// Queue a command for a device; replaces any queued one.
    pub fn set_pending_command(&self, imei: Imei, command: Command) {
        self.pending.insert(imei.as_u64(), command);
    }

    /// Take the queued command for a device, if any. Consume-once: a
    /// command is handed out exactly one time.
    #[must_use]
    pub fn take_pending_command(&self, imei: Imei) -> Option<Command> {
        self.pending.remove(&imei.as_u64()).map(|(_, cmd)| cmd)
    }

    /// Number of live in-memory sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
