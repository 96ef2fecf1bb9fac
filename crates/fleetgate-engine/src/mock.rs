//! In-memory persistence gateway for tests
//!
//! Mirrors the duplicate-suppression contract of the real store so the
//! engines can be exercised without Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetgate_core::{Device, Error, Event, FirmwareState, Imei, PositionFix, Result, StatusDelta};
use fleetgate_database::{Gateway, SessionRecord};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A stored event row
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Owning device IMEI
    pub imei: u64,
    /// Event timestamp
    pub ts: DateTime<Utc>,
    /// Position at the time of the event
    pub position: Option<(f64, f64)>,
    /// The event itself
    pub event: Event,
}

/// In-memory gateway
#[derive(Default)]
pub struct MemoryGateway {
    devices: Mutex<HashMap<u64, Device>>,
    deltas: Mutex<Vec<(u64, StatusDelta)>>,
    positions: Mutex<HashMap<(u64, DateTime<Utc>), PositionFix>>,
    events: Mutex<Vec<StoredEvent>>,
    people: Mutex<HashMap<(String, DateTime<Utc>), (u64, u32, u32)>>,
    accel: Mutex<Vec<(u64, DateTime<Utc>, [f64; 3])>>,
    sessions: Mutex<HashMap<u32, SessionRecord>>,
    fail_database: Mutex<bool>,
}

impl MemoryGateway {
    /// Create an empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, for error-path tests.
    pub fn fail_from_now_on(&self) {
        *self.fail_database.lock() = true;
    }

    fn check(&self) -> Result<()> {
        if *self.fail_database.lock() {
            return Err(Error::Database("injected failure".to_string()));
        }
        Ok(())
    }

    /// Number of stored devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Fetch a device copy for assertions.
    #[must_use]
    pub fn device(&self, imei: u64) -> Option<Device> {
        self.devices.lock().get(&imei).cloned()
    }

    /// Number of stored positions.
    #[must_use]
    pub fn position_count(&self) -> usize {
        self.positions.lock().len()
    }

    /// All positions of a device, oldest first.
    #[must_use]
    pub fn positions_of(&self, imei: u64) -> Vec<PositionFix> {
        let mut fixes: Vec<PositionFix> = self
            .positions
            .lock()
            .iter()
            .filter(|((i, _), _)| *i == imei)
            .map(|(_, fix)| fix.clone())
            .collect();
        fixes.sort_by_key(|fix| fix.timestamp);
        fixes
    }

    /// Stored events with the given kind tag.
    #[must_use]
    pub fn events_of_kind(&self, kind: &str) -> Vec<StoredEvent> {
        self.events
            .lock()
            .iter()
            .filter(|stored| stored.event.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of stored people-counter rows.
    #[must_use]
    pub fn people_count_rows(&self) -> usize {
        self.people.lock().len()
    }

    /// Number of stored session rows.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Status deltas applied to a device, in order.
    #[must_use]
    pub fn deltas_of(&self, imei: u64) -> Vec<StatusDelta> {
        self.deltas
            .lock()
            .iter()
            .filter(|(i, _)| *i == imei)
            .map(|(_, delta)| delta.clone())
            .collect()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn find_device(&self, imei: Imei) -> Result<Option<Device>> {
        self.check()?;
        Ok(self.devices.lock().get(&imei.as_u64()).cloned())
    }

    async fn create_device(&self, device: &Device) -> Result<()> {
        self.check()?;
        self.devices
            .lock()
            .insert(device.imei.as_u64(), device.clone());
        Ok(())
    }

    async fn update_status(&self, imei: Imei, delta: &StatusDelta) -> Result<()> {
        self.check()?;
        let mut devices = self.devices.lock();
        if let Some(device) = devices.get_mut(&imei.as_u64()) {
            if let Some(comments) = &delta.comments {
                device.comments.clone_from(comments);
            }
            if let Some(state) = &delta.firmware_state {
                device.firmware_state = state.clone();
            }
        }
        drop(devices);
        self.deltas.lock().push((imei.as_u64(), delta.clone()));
        Ok(())
    }

    async fn set_firmware_state(&self, imei: Imei, state: &FirmwareState) -> Result<()> {
        self.check()?;
        if let Some(device) = self.devices.lock().get_mut(&imei.as_u64()) {
            device.firmware_state = state.clone();
        }
        Ok(())
    }

    async fn insert_position(&self, imei: Imei, fix: &PositionFix) -> Result<bool> {
        self.check()?;
        let mut positions = self.positions.lock();
        let key = (imei.as_u64(), fix.timestamp);
        if positions.contains_key(&key) {
            return Ok(false);
        }
        positions.insert(key, fix.clone());
        Ok(true)
    }

    async fn insert_event(
        &self,
        imei: Imei,
        ts: DateTime<Utc>,
        position: Option<(f64, f64)>,
        event: &Event,
    ) -> Result<()> {
        self.check()?;
        self.events.lock().push(StoredEvent {
            imei: imei.as_u64(),
            ts,
            position,
            event: event.clone(),
        });
        Ok(())
    }

    async fn insert_people_count(
        &self,
        imei: Imei,
        sensor_id: &str,
        ts: DateTime<Utc>,
        entered: u32,
        exited: u32,
    ) -> Result<bool> {
        self.check()?;
        let mut people = self.people.lock();
        let key = (sensor_id.to_string(), ts);
        if people.contains_key(&key) {
            return Ok(false);
        }
        people.insert(key, (imei.as_u64(), entered, exited));
        Ok(true)
    }

    async fn insert_accel_event(
        &self,
        imei: Imei,
        ts: DateTime<Utc>,
        _duration: f64,
        _err_duration: f64,
        entry_mag: f64,
        peak_mag: f64,
        exit_mag: f64,
    ) -> Result<bool> {
        self.check()?;
        let mut accel = self.accel.lock();
        let triple = [entry_mag, peak_mag, exit_mag];
        let duplicate = accel
            .iter()
            .any(|(i, t, m)| *i == imei.as_u64() && *t == ts && *m == triple);
        if duplicate {
            return Ok(false);
        }
        accel.push((imei.as_u64(), ts, triple));
        Ok(true)
    }

    async fn upsert_session(&self, session: &SessionRecord) -> Result<()> {
        self.check()?;
        self.sessions
            .lock()
            .insert(session.session_id, session.clone());
        Ok(())
    }

    async fn delete_session(&self, session_id: u32) -> Result<()> {
        self.check()?;
        self.sessions.lock().remove(&session_id);
        Ok(())
    }

    async fn delete_device_sessions(&self, imei: Imei) -> Result<u64> {
        self.check()?;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, record| record.imei != imei);
        Ok((before - sessions.len()) as u64)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, record| record.expires_at >= now);
        Ok((before - sessions.len()) as u64)
    }
}
