//! Database models for the fleetgate ingestion backend

use chrono::{DateTime, Utc};
use fleetgate_core::{Device, FirmwareState, Imei, Protocol, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Database model for devices
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeviceDb {
    /// IMEI, the primary key
    pub imei: i64,

    /// Display name
    pub name: String,

    /// Owner reference
    pub owner: Option<String>,

    /// Harness profile name
    pub harness: String,

    /// Address the notification gateway delivers alarms to
    pub notify_address: Option<String>,

    /// Last contact timestamp
    pub last_contact_ts: Option<DateTime<Utc>>,

    /// Last position-fix timestamp
    pub last_fix_ts: Option<DateTime<Utc>>,

    /// Last known latitude
    pub latitude: Option<f64>,

    /// Last known longitude
    pub longitude: Option<f64>,

    /// Last reported speed
    pub speed: Option<f64>,

    /// Last reported course
    pub course: Option<f64>,

    /// Last reported altitude
    pub altitude: Option<f64>,

    /// Odometer reading
    pub odometer: Option<f64>,

    /// Input bitmap snapshot
    pub inputs: i32,

    /// Output bitmap snapshot
    pub outputs: i32,

    /// Active alarm bitmap
    pub alarms: i32,

    /// Firmware bootloader state tag
    pub firmware_state: String,

    /// Device self-description blob
    pub comments: String,

    /// Map icon name
    pub icon: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl DeviceDb {
    /// Convert the row into the domain type.
    pub fn into_domain(self) -> Result<Device> {
        Ok(Device {
            imei: Imei::new(self.imei as u64)?,
            name: self.name,
            harness: self.harness,
            owner: self.owner,
            notify_address: self.notify_address,
            comments: self.comments,
            icon: self.icon,
            firmware_state: FirmwareState::parse(&self.firmware_state),
        })
    }
}

/// Database model for position fixes
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionDb {
    /// Unique identifier
    pub id: Uuid,

    /// Owning device IMEI
    pub imei: i64,

    /// Fix timestamp
    pub ts: DateTime<Utc>,

    /// Latitude in decimal degrees
    pub latitude: f64,

    /// Longitude in decimal degrees
    pub longitude: f64,

    /// Speed as received from the device
    pub speed: f64,

    /// Course in degrees
    pub course: f64,

    /// Altitude in metres
    pub altitude: f64,

    /// Satellites used for the fix
    pub satellites: i16,

    /// Input bitmap snapshot
    pub inputs: i16,

    /// Source protocol tag
    pub source: String,

    /// Device clock was more than the skew window from wall clock
    pub stale_clock: bool,

    /// Insertion timestamp
    pub created_at: DateTime<Utc>,
}

/// Database model for events
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventDb {
    /// Unique identifier
    pub id: Uuid,

    /// Owning device IMEI
    pub imei: i64,

    /// Event timestamp
    pub ts: DateTime<Utc>,

    /// Event kind tag (`TRACK`, `IO_FIX`, `ALARM`, ...)
    pub kind: String,

    /// Latitude at the time of the event, when known
    pub latitude: Option<f64>,

    /// Longitude at the time of the event, when known
    pub longitude: Option<f64>,

    /// Variant-specific payload
    pub payload: serde_json::Value,

    /// Insertion timestamp
    pub created_at: DateTime<Utc>,
}

/// Database model for sessions
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionDb {
    /// Session id issued at login
    pub session_id: i64,

    /// Owning device IMEI
    pub imei: i64,

    /// Protocol the session belongs to
    pub protocol: String,

    /// Remote endpoint the last valid packet came from
    pub endpoint: String,

    /// When the session was opened
    pub opened_at: DateTime<Utc>,

    /// When the session expires unless refreshed
    pub expires_at: DateTime<Utc>,
}

/// Database model for people-counter rows
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PeopleCountDb {
    /// Unique identifier
    pub id: Uuid,

    /// Sensor MAC, formatted `aa:bb:cc:dd:ee:ff`
    pub sensor_id: String,

    /// Count timestamp
    pub ts: DateTime<Utc>,

    /// Device that relayed the count
    pub imei: i64,

    /// Entries counted
    pub entered: i32,

    /// Exits counted
    pub exited: i32,
}

/// Database model for accelerometer impact windows
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccelEventDb {
    /// Unique identifier
    pub id: Uuid,

    /// Owning device IMEI
    pub imei: i64,

    /// Window start timestamp
    pub ts: DateTime<Utc>,

    /// Window duration, seconds
    pub duration: f64,

    /// Error-band duration, seconds
    pub err_duration: f64,

    /// Entry magnitude (g)
    pub entry_mag: f64,

    /// Peak magnitude (g)
    pub peak_mag: f64,

    /// Exit magnitude (g)
    pub exit_mag: f64,
}

/// A session row in domain terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
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
