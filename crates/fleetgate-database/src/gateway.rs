//! Persistence gateway trait and its Postgres implementation
//!
//! The protocol engines talk to storage through [`Gateway`] only; the
//! in-memory implementation used by the engine tests lives next to the
//! engines. `PgGateway` is a thin layer over the query modules.

use crate::models::SessionRecord;
use crate::queries::{DeviceQueries, EventQueries, PositionQueries, SessionQueries};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetgate_core::{Device, Event, FirmwareState, Imei, PositionFix, Result, StatusDelta};
use sqlx::PgPool;

/// Storage operations the protocol engines depend on
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Look up a device by IMEI.
    async fn find_device(&self, imei: Imei) -> Result<Option<Device>>;

    /// Create a freshly provisioned device.
    async fn create_device(&self, device: &Device) -> Result<()>;

    /// Apply a partial status update; `last_contact_ts` never moves
    /// backwards, and input and output bitmaps are written separately.
    async fn update_status(&self, imei: Imei, delta: &StatusDelta) -> Result<()>;

    /// Replace the firmware-state tag.
    async fn set_firmware_state(&self, imei: Imei, state: &FirmwareState) -> Result<()>;

    /// Insert one fix; `false` means a fix for the same
    /// `(device, timestamp)` already existed.
    async fn insert_position(&self, imei: Imei, fix: &PositionFix) -> Result<bool>;

    /// Append an event row.
    async fn insert_event(
        &self,
        imei: Imei,
        ts: DateTime<Utc>,
        position: Option<(f64, f64)>,
        event: &Event,
    ) -> Result<()>;

    /// Insert a people-counter delta, suppressed on a duplicate
    /// `(sensor, timestamp)`.
    async fn insert_people_count(
        &self,
        imei: Imei,
        sensor_id: &str,
        ts: DateTime<Utc>,
        entered: u32,
        exited: u32,
    ) -> Result<bool>;

    /// Insert an impact window, suppressed when the same device,
    /// timestamp and magnitude triple is already stored.
    #[allow(clippy::too_many_arguments)]
    async fn insert_accel_event(
        &self,
        imei: Imei,
        ts: DateTime<Utc>,
        duration: f64,
        err_duration: f64,
        entry_mag: f64,
        peak_mag: f64,
        exit_mag: f64,
    ) -> Result<bool>;

    /// Insert or refresh a session row.
    async fn upsert_session(&self, session: &SessionRecord) -> Result<()>;

    /// Delete one session row.
    async fn delete_session(&self, session_id: u32) -> Result<()>;

    /// Delete every session row a device holds.
    async fn delete_device_sessions(&self, imei: Imei) -> Result<u64>;

    /// Delete session rows past their expiry.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Postgres-backed gateway
#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    /// Wrap a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Gateway for PgGateway {
    async fn find_device(&self, imei: Imei) -> Result<Option<Device>> {
        DeviceQueries::find_by_imei(&self.pool, imei).await
    }

    async fn create_device(&self, device: &Device) -> Result<()> {
        DeviceQueries::insert(&self.pool, device).await
    }

    async fn update_status(&self, imei: Imei, delta: &StatusDelta) -> Result<()> {
        DeviceQueries::update_status(&self.pool, imei, delta).await
    }

    async fn set_firmware_state(&self, imei: Imei, state: &FirmwareState) -> Result<()> {
        DeviceQueries::set_firmware_state(&self.pool, imei, state).await
    }

    async fn insert_position(&self, imei: Imei, fix: &PositionFix) -> Result<bool> {
        PositionQueries::insert(&self.pool, imei, fix).await
    }

    async fn insert_event(
        &self,
        imei: Imei,
        ts: DateTime<Utc>,
        position: Option<(f64, f64)>,
        event: &Event,
    ) -> Result<()> {
        EventQueries::insert(&self.pool, imei, ts, position, event).await
    }

    async fn insert_people_count(
        &self,
        imei: Imei,
        sensor_id: &str,
        ts: DateTime<Utc>,
        entered: u32,
        exited: u32,
    ) -> Result<bool> {
        EventQueries::insert_people_count(&self.pool, imei, sensor_id, ts, entered, exited).await
    }

    async fn insert_accel_event(
        &self,
        imei: Imei,
        ts: DateTime<Utc>,
        duration: f64,
        err_duration: f64,
        entry_mag: f64,
        peak_mag: f64,
        exit_mag: f64,
    ) -> Result<bool> {
        EventQueries::insert_accel_event(
            &self.pool,
            imei,
            ts,
            duration,
            err_duration,
            entry_mag,
            peak_mag,
            exit_mag,
        )
        .await
    }

    async fn upsert_session(&self, session: &SessionRecord) -> Result<()> {
        SessionQueries::upsert(&self.pool, session).await
    }

    async fn delete_session(&self, session_id: u32) -> Result<()> {
        SessionQueries::delete(&self.pool, session_id).await
    }

    async fn delete_device_sessions(&self, imei: Imei) -> Result<u64> {
        SessionQueries::delete_for_device(&self.pool, imei).await
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        SessionQueries::delete_expired(&self.pool, now).await
    }
}

/// Retry-once decorator over another gateway.
///
/// A failed write leaves the frame un-acked and the device retransmits
/// after its own timeout; retrying the call inline first spares that
/// round trip when the failure was a blip.
#[derive(Debug, Clone)]
pub struct RetryGateway<G> {
    inner: G,
}

impl<G> RetryGateway<G> {
    /// Wrap a gateway.
    pub const fn new(inner: G) -> Self {
        Self { inner }
    }
}

macro_rules! retry_once {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {
        match $self.inner.$method($($arg),*).await {
            Ok(value) => Ok(value),
            Err(first) => {
                tracing::warn!(
                    call = stringify!($method),
                    error = %first,
                    "gateway call failed, retrying once"
                );
                $self.inner.$method($($arg),*).await
            }
        }
    };
}

#[async_trait]
impl<G: Gateway> Gateway for RetryGateway<G> {
    async fn find_device(&self, imei: Imei) -> Result<Option<Device>> {
        retry_once!(self.find_device(imei))
    }

    async fn create_device(&self, device: &Device) -> Result<()> {
        retry_once!(self.create_device(device))
    }

    async fn update_status(&self, imei: Imei, delta: &StatusDelta) -> Result<()> {
        retry_once!(self.update_status(imei, delta))
    }

    async fn set_firmware_state(&self, imei: Imei, state: &FirmwareState) -> Result<()> {
        retry_once!(self.set_firmware_state(imei, state))
    }

    async fn insert_position(&self, imei: Imei, fix: &PositionFix) -> Result<bool> {
        retry_once!(self.insert_position(imei, fix))
    }

    async fn insert_event(
        &self,
        imei: Imei,
        ts: DateTime<Utc>,
        position: Option<(f64, f64)>,
        event: &Event,
    ) -> Result<()> {
        retry_once!(self.insert_event(imei, ts, position, event))
    }

    async fn insert_people_count(
        &self,
        imei: Imei,
        sensor_id: &str,
        ts: DateTime<Utc>,
        entered: u32,
        exited: u32,
    ) -> Result<bool> {
        retry_once!(self.insert_people_count(imei, sensor_id, ts, entered, exited))
    }

    async fn insert_accel_event(
        &self,
        imei: Imei,
        ts: DateTime<Utc>,
        duration: f64,
        err_duration: f64,
        entry_mag: f64,
        peak_mag: f64,
        exit_mag: f64,
    ) -> Result<bool> {
        retry_once!(self.insert_accel_event(
            imei,
            ts,
            duration,
            err_duration,
            entry_mag,
            peak_mag,
            exit_mag
        ))
    }

    async fn upsert_session(&self, session: &SessionRecord) -> Result<()> {
        retry_once!(self.upsert_session(session))
    }

    async fn delete_session(&self, session_id: u32) -> Result<()> {
        retry_once!(self.delete_session(session_id))
    }

    async fn delete_device_sessions(&self, imei: Imei) -> Result<u64> {
        retry_once!(self.delete_device_sessions(imei))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        retry_once!(self.delete_expired_sessions(now))
    }
}
