//! Database query operations for the fleetgate ingestion backend

use crate::models::{DeviceDb, SessionDb, SessionRecord};
use chrono::{DateTime, Utc};
use fleetgate_core::{Device, Error, Event, FirmwareState, Imei, PositionFix, Result, StatusDelta};
use sqlx::{PgPool, Row};

/// Device table operations
pub struct DeviceQueries;

impl DeviceQueries {
    /// Insert a freshly provisioned device.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn insert(pool: &PgPool, device: &Device) -> Result<()> {
        let query = r"
            INSERT INTO devices (
                imei, name, owner, harness, notify_address,
                firmware_state, comments, icon, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";

        sqlx::query(query)
            .bind(device.imei.as_u64() as i64)
            .bind(&device.name)
            .bind(&device.owner)
            .bind(&device.harness)
            .bind(&device.notify_address)
            .bind(device.firmware_state.to_string())
            .bind(&device.comments)
            .bind(&device.icon)
            .bind(Utc::now())
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Find a device by IMEI.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_by_imei(pool: &PgPool, imei: Imei) -> Result<Option<Device>> {
        let query = "SELECT * FROM devices WHERE imei = $1";

        let row = sqlx::query_as::<_, DeviceDb>(query)
            .bind(imei.as_u64() as i64)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        row.map(DeviceDb::into_domain).transpose()
    }

    /// Apply a partial status update.
    ///
    /// `last_contact_ts` never moves backwards; a delayed packet with
    /// an older timestamp cannot mask a newer contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_status(pool: &PgPool, imei: Imei, delta: &StatusDelta) -> Result<()> {
        let query = r"
            UPDATE devices SET
                latitude = COALESCE($2, latitude),
                longitude = COALESCE($3, longitude),
                speed = COALESCE($4, speed),
                course = COALESCE($5, course),
                altitude = COALESCE($6, altitude),
                inputs = COALESCE($7, inputs),
                outputs = COALESCE($8, outputs),
                alarms = COALESCE($9, alarms),
                last_fix_ts = GREATEST(last_fix_ts, $10),
                last_contact_ts = GREATEST(last_contact_ts, $11),
                comments = COALESCE($12, comments),
                firmware_state = COALESCE($13, firmware_state)
            WHERE imei = $1
        ";

        let (latitude, longitude) = match delta.position {
            Some((lat, lon)) => (Some(lat), Some(lon)),
            None => (None, None),
        };

        sqlx::query(query)
            .bind(imei.as_u64() as i64)
            .bind(latitude)
            .bind(longitude)
            .bind(delta.speed)
            .bind(delta.course)
            .bind(delta.altitude)
            .bind(delta.inputs)
            .bind(delta.outputs)
            .bind(delta.alarms)
            .bind(delta.last_fix)
            .bind(delta.last_contact)
            .bind(&delta.comments)
            .bind(delta.firmware_state.as_ref().map(ToString::to_string))
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Replace the firmware-state tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_firmware_state(
        pool: &PgPool,
        imei: Imei,
        state: &FirmwareState,
    ) -> Result<()> {
        sqlx::query("UPDATE devices SET firmware_state = $2 WHERE imei = $1")
            .bind(imei.as_u64() as i64)
            .bind(state.to_string())
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

/// Position table operations
pub struct PositionQueries;

impl PositionQueries {
    /// Insert one fix; returns `false` when a fix for the same
    /// `(device, timestamp)` already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn insert(pool: &PgPool, imei: Imei, fix: &PositionFix) -> Result<bool> {
        let query = r"
            INSERT INTO positions (
                id, imei, ts, latitude, longitude, speed, course,
                altitude, satellites, inputs, source, stale_clock, created_at
            ) VALUES (
                gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            )
            ON CONFLICT (imei, ts) DO NOTHING
        ";

        let result = sqlx::query(query)
            .bind(imei.as_u64() as i64)
            .bind(fix.timestamp)
            .bind(fix.latitude)
            .bind(fix.longitude)
            .bind(fix.speed)
            .bind(fix.course)
            .bind(fix.altitude)
            .bind(fix.satellites)
            .bind(i16::from(fix.inputs))
            .bind(fix.source.as_str())
            .bind(fix.stale_clock)
            .bind(Utc::now())
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Count fixes stored for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count_for_device(pool: &PgPool, imei: Imei) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM positions WHERE imei = $1")
            .bind(imei.as_u64() as i64)
            .fetch_one(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get("count"))
    }
}

/// Event table operations
pub struct EventQueries;

impl EventQueries {
    /// Append one event row.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn insert(
        pool: &PgPool,
        imei: Imei,
        ts: DateTime<Utc>,
        position: Option<(f64, f64)>,
        event: &Event,
    ) -> Result<()> {
        let query = r"
            INSERT INTO events (id, imei, ts, kind, latitude, longitude, payload, created_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7)
        ";

        let (latitude, longitude) = match position {
            Some((lat, lon)) => (Some(lat), Some(lon)),
            None => (None, None),
        };

        sqlx::query(query)
            .bind(imei.as_u64() as i64)
            .bind(ts)
            .bind(event.kind())
            .bind(latitude)
            .bind(longitude)
            .bind(event.payload()?)
            .bind(Utc::now())
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Insert a people-counter delta; returns `false` when a count for
    /// the same `(sensor, timestamp)` already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn insert_people_count(
        pool: &PgPool,
        imei: Imei,
        sensor_id: &str,
        ts: DateTime<Utc>,
        entered: u32,
        exited: u32,
    ) -> Result<bool> {
        let query = r"
            INSERT INTO people_counts (id, sensor_id, ts, imei, entered, exited)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5)
            ON CONFLICT (sensor_id, ts) DO NOTHING
        ";

        let result = sqlx::query(query)
            .bind(sensor_id)
            .bind(ts)
            .bind(imei.as_u64() as i64)
            .bind(entered as i32)
            .bind(exited as i32)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Insert an impact window; returns `false` when an identical
    /// window (same device, timestamp and magnitude triple) exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_accel_event(
        pool: &PgPool,
        imei: Imei,
        ts: DateTime<Utc>,
        duration: f64,
        err_duration: f64,
        entry_mag: f64,
        peak_mag: f64,
        exit_mag: f64,
    ) -> Result<bool> {
        let query = r"
            INSERT INTO accel_events (
                id, imei, ts, duration, err_duration, entry_mag, peak_mag, exit_mag
            ) VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (imei, ts, entry_mag, peak_mag, exit_mag) DO NOTHING
        ";

        let result = sqlx::query(query)
            .bind(imei.as_u64() as i64)
            .bind(ts)
            .bind(duration)
            .bind(err_duration)
            .bind(entry_mag)
            .bind(peak_mag)
            .bind(exit_mag)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

/// Session table operations
pub struct SessionQueries;

impl SessionQueries {
    /// Insert or refresh a session row.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn upsert(pool: &PgPool, session: &SessionRecord) -> Result<()> {
        let query = r"
            INSERT INTO sessions (session_id, imei, protocol, endpoint, opened_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (session_id) DO UPDATE SET
                endpoint = EXCLUDED.endpoint,
                expires_at = EXCLUDED.expires_at
        ";

        sqlx::query(query)
            .bind(i64::from(session.session_id))
            .bind(session.imei.as_u64() as i64)
            .bind(session.protocol.as_str())
            .bind(&session.endpoint)
            .bind(session.opened_at)
            .bind(session.expires_at)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Delete one session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(pool: &PgPool, session_id: u32) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(i64::from(session_id))
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Delete every session a device holds; at most one should exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_for_device(pool: &PgPool, imei: Imei) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE imei = $1")
            .bind(imei.as_u64() as i64)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Delete sessions past their expiry; returns how many went.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_expired(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(now)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// List active sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_active(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<SessionDb>> {
        sqlx::query_as::<_, SessionDb>(
            "SELECT * FROM sessions WHERE expires_at >= $1 ORDER BY opened_at DESC",
        )
        .bind(now)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
