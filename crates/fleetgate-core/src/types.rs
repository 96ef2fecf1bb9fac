//! Domain types shared across the fleetgate crates

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire protocol a frame arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// In-house Bluetooth-gateway UDP protocol
    Avl,
    /// Concox/GT06 family, TCP
    Concox,
    /// Meiligao, UDP
    Meiligao,
    /// Wialon-style ASCII text protocol, TCP
    Wialon,
    /// Satellite uplink, TCP
    Satellite,
}

impl Protocol {
    /// Stable lower-case name, used for logging and the `positions.source` column
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Avl => "avl",
            Self::Concox => "concox",
            Self::Meiligao => "meiligao",
            Self::Wialon => "wialon",
            Self::Satellite => "satellite",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowest valid IMEI (inclusive): smallest 14-digit number
pub const IMEI_MIN: u64 = 10_000_000_000_000;

/// Highest valid IMEI (exclusive)
pub const IMEI_MAX: u64 = 900_000_000_000_000;

/// A validated 14/15-digit device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Imei(u64);

impl Imei {
    /// Validate an IMEI: numeric range first, then the Luhn check digit.
    pub fn new(raw: u64) -> Result<Self> {
        if !Self::in_range(raw) {
            return Err(Error::InvalidImei {
                imei: raw,
                reason: "outside the 14/15-digit range".to_string(),
            });
        }
        if !luhn_valid(raw) {
            return Err(Error::InvalidImei {
                imei: raw,
                reason: "Luhn check failed".to_string(),
            });
        }
        Ok(Self(raw))
    }

    /// Range check only, without the Luhn digit
    #[must_use]
    pub const fn in_range(raw: u64) -> bool {
        raw >= IMEI_MIN && raw < IMEI_MAX
    }

    /// Parse from a decimal string (as sent by ASCII protocols)
    pub fn parse(s: &str) -> Result<Self> {
        let raw = s.trim().parse::<u64>().map_err(|_| Error::InvalidImei {
            imei: 0,
            reason: format!("not a decimal number: {s:?}"),
        })?;
        Self::new(raw)
    }

    /// Raw numeric value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Imei {
    /// Zero-padded to 15 digits; also the default device name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}", self.0)
    }
}

/// Luhn check over the decimal digits, rightmost digit being the check digit
fn luhn_valid(mut n: u64) -> bool {
    let mut sum = 0u32;
    let mut double = false;
    while n > 0 {
        let mut digit = (n % 10) as u32;
        if double {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
        double = !double;
        n /= 10;
    }
    sum % 10 == 0
}

/// Input-bitmap layout shared by the AVL wiring harness
pub mod input_bits {
    /// Ignition sense
    pub const IGNITION: u8 = 0x01;
    /// Motor relay feedback
    pub const MOTOR: u8 = 0x02;
    /// Panic button
    pub const PANIC: u8 = 0x04;
    /// Charger connected
    pub const CHARGER: u8 = 0x08;
    /// External power present
    pub const EXTERNAL_POWER: u8 = 0x10;
    /// Marks an I/O-change fix rather than a periodic track
    pub const DELTA: u8 = 0x80;

    /// Human-readable tag for a single-input change mask
    #[must_use]
    pub const fn tag(mask: u8) -> Option<&'static str> {
        match mask {
            IGNITION => Some("ignition"),
            MOTOR => Some("motor"),
            PANIC => Some("panic"),
            CHARGER => Some("charger"),
            EXTERNAL_POWER => Some("external_power"),
            _ => None,
        }
    }
}

/// A single GPS position sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    /// Fix timestamp (UTC, device clock after staleness substitution)
    pub timestamp: DateTime<Utc>,
    /// Latitude in decimal degrees, south negative
    pub latitude: f64,
    /// Longitude in decimal degrees, west negative
    pub longitude: f64,
    /// Speed in the unit the protocol delivers (km/h for Concox/Wialon)
    pub speed: f64,
    /// Course over ground in degrees
    pub course: f64,
    /// Altitude in metres
    pub altitude: f64,
    /// Number of satellites in the fix
    pub satellites: i16,
    /// Input-bitmap snapshot at fix time
    pub inputs: u8,
    /// Protocol that delivered the fix
    pub source: Protocol,
    /// True when the device clock was >20 days off and "now" was substituted
    pub stale_clock: bool,
}

impl PositionFix {
    /// A zeroed fix at `timestamp` for protocols without speed/course
    #[must_use]
    pub fn bare(timestamp: DateTime<Utc>, latitude: f64, longitude: f64, source: Protocol) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            speed: 0.0,
            course: 0.0,
            altitude: 0.0,
            satellites: 0,
            inputs: 0,
            source,
            stale_clock: false,
        }
    }
}

/// Variant-tagged device event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A position fix mirrored into the event stream for querying
    Track,
    /// Input change with a human-readable tag and the new level
    IoFix {
        /// Which input changed (ignition, motor, panic, ...)
        tag: String,
        /// New level of that input
        level: bool,
    },
    /// Device alarm (panic, power cut, ...)
    Alarm {
        /// Vendor alarm code
        code: u8,
        /// Decoded alarm name
        name: String,
    },
    /// Keep-alive carrying battery/GSM state but no position
    Heartbeat {
        /// Battery voltage in centivolts
        battery_centivolts: u16,
        /// GSM signal level (vendor scale)
        gsm_signal: u8,
    },
    /// Counter delta from an external people-counting sensor
    PeopleCount {
        /// Sensor MAC, formatted `aa:bb:cc:dd:ee:ff`
        sensor_id: String,
        /// Entries counted
        entered: u32,
        /// Exits counted
        exited: u32,
    },
    /// Impact window from the accelerometer
    AccelEvent {
        /// Window duration in seconds
        duration: f64,
        /// Error-band duration in seconds
        err_duration: f64,
        /// Entry magnitude (g)
        entry: f64,
        /// Entry error magnitude (g)
        err_entry: f64,
        /// Peak magnitude (g)
        peak: f64,
        /// Exit error magnitude (g)
        err_exit: f64,
        /// Exit magnitude (g)
        exit: f64,
    },
}

impl Event {
    /// Stable tag stored in the `events.type` column
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Track => "TRACK",
            Self::IoFix { .. } => "IO_FIX",
            Self::Alarm { .. } => "ALARM",
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::PeopleCount { .. } => "PEOPLE_COUNT",
            Self::AccelEvent { .. } => "ACCEL_EVENT",
        }
    }

    /// Variant payload as JSON for the `events.payload_json` column
    pub fn payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Outbound device command, delivered on the device's next contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Ask the device to re-send its self-description
    Info,
    /// Ask the device to flush queued data
    Data,
    /// Engage the motor cut-off relay
    MotorOn,
    /// Release the motor cut-off relay
    MotorOff,
    /// Reboot the device
    Reset,
    /// Enrol the device for a firmware push
    StartBootloader,
}

impl Command {
    /// Command code used by the AVL `0x13` command frame, if deliverable that way
    #[must_use]
    pub const fn avl_code(self) -> Option<u8> {
        match self {
            Self::MotorOn => Some(0x30),
            Self::MotorOff => Some(0x31),
            Self::Reset => Some(0x32),
            // Info/Data ride in the session sub-command; StartBootloader is a tag rewrite.
            Self::Info | Self::Data | Self::StartBootloader => None,
        }
    }

    /// ASCII command body for the Concox `0x80` server frame, if supported
    #[must_use]
    pub const fn concox_text(self) -> Option<&'static str> {
        match self {
            Self::MotorOn => Some("RELAY,1#"),
            Self::MotorOff => Some("RELAY,0#"),
            Self::Reset => Some("RESET#"),
            Self::Info | Self::Data | Self::StartBootloader => None,
        }
    }
}

/// Bootloader progress tag persisted on the device row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareState {
    /// No firmware push pending
    Idle,
    /// Enrolled, waiting to enter the bootloader
    Start,
    /// Next row to send
    Row(u32),
    /// Flash finished with the device-reported result code
    Done(u16),
    /// Push aborted
    Error(String),
}

impl FirmwareState {
    /// Parse the short device-row tag
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        let tag = tag.trim();
        if tag.is_empty() {
            return Self::Idle;
        }
        if tag == "-" {
            return Self::Start;
        }
        if let Ok(row) = tag.parse::<u32>() {
            return Self::Row(row);
        }
        if let Some(rest) = tag.strip_prefix("OK ")
            && let Ok(code) = rest.trim().parse::<u16>()
        {
            return Self::Done(code);
        }
        if let Some(rest) = tag.strip_prefix("ERROR") {
            return Self::Error(rest.trim().to_string());
        }
        Self::Error(format!("unrecognized tag {tag:?}"))
    }
}

impl fmt::Display for FirmwareState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => Ok(()),
            Self::Start => f.write_str("-"),
            Self::Row(n) => write!(f, "{n}"),
            Self::Done(code) => write!(f, "OK {code}"),
            Self::Error(reason) => write!(f, "ERROR {reason}"),
        }
    }
}

/// Long-lived device record as the engines see it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Validated IMEI, the primary key
    pub imei: Imei,
    /// Display name; defaults to the zero-padded IMEI
    pub name: String,
    /// Wiring-harness profile name
    pub harness: String,
    /// Owner reference, if assigned
    pub owner: Option<String>,
    /// Where to send panic notifications, if configured
    pub notify_address: Option<String>,
    /// Device self-description blob (empty until DEVINFO arrives)
    pub comments: String,
    /// Map icon name
    pub icon: String,
    /// Bootloader progress tag
    pub firmware_state: FirmwareState,
}

impl Device {
    /// Fresh auto-provisioned device
    #[must_use]
    pub fn provisioned(imei: Imei, harness: &str) -> Self {
        Self {
            imei,
            name: imei.to_string(),
            harness: harness.to_string(),
            owner: None,
            notify_address: None,
            comments: String::new(),
            icon: "default".to_string(),
            firmware_state: FirmwareState::Idle,
        }
    }
}

/// Partial "current state" update applied to a device row.
///
/// Fields left `None` are untouched. Input and output bitmaps are
/// deliberately separate fields and are never derived from one another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusDelta {
    /// New position as (latitude, longitude)
    pub position: Option<(f64, f64)>,
    /// Speed as received
    pub speed: Option<f64>,
    /// Course over ground
    pub course: Option<f64>,
    /// Altitude in metres
    pub altitude: Option<f64>,
    /// Input bitmap snapshot
    pub inputs: Option<i32>,
    /// Output bitmap snapshot
    pub outputs: Option<i32>,
    /// Alarm bitmap snapshot
    pub alarms: Option<i32>,
    /// Time of the latest fix
    pub last_fix: Option<DateTime<Utc>>,
    /// Time of the latest successfully handled packet
    pub last_contact: Option<DateTime<Utc>>,
    /// Device self-description blob
    pub comments: Option<String>,
    /// Bootloader progress tag
    pub firmware_state: Option<FirmwareState>,
}

impl StatusDelta {
    /// Delta that only bumps `last_contact`
    #[must_use]
    pub fn contact(now: DateTime<Utc>) -> Self {
        Self {
            last_contact: Some(now),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn imei_rejects_below_range() {
        assert!(Imei::new(IMEI_MIN - 1).is_err());
        assert!(!Imei::in_range(IMEI_MIN - 1));
    }

    #[test]
    fn imei_range_boundaries() {
        assert!(Imei::in_range(IMEI_MIN));
        assert!(Imei::in_range(IMEI_MAX - 1));
        assert!(!Imei::in_range(IMEI_MAX));
    }

    #[test]
    fn imei_luhn_at_range_edges() {
        // Luhn-valid values just inside both range boundaries
        assert!(Imei::new(10_000_000_000_008).is_ok());
        assert!(Imei::new(899_999_999_999_995).is_ok());

        // In range but with a wrong check digit
        assert!(matches!(
            Imei::new(10_000_000_000_001),
            Err(crate::Error::InvalidImei { .. })
        ));
    }

    #[test]
    fn imei_display_zero_pads_to_15() {
        let imei = Imei::new(10_000_000_000_008).unwrap();
        assert_eq!(imei.to_string(), "010000000000008");
        assert_eq!(imei.to_string().len(), 15);
    }

    #[test]
    fn imei_parse_ascii() {
        // Wialon scenario IMEI
        let imei = Imei::parse("352749380148144").unwrap();
        assert_eq!(imei.as_u64(), 352_749_380_148_144);
        assert!(Imei::parse("not-a-number").is_err());
    }

    #[test]
    fn input_tags_cover_the_five_delta_masks() {
        assert_eq!(input_bits::tag(input_bits::IGNITION), Some("ignition"));
        assert_eq!(input_bits::tag(input_bits::MOTOR), Some("motor"));
        assert_eq!(input_bits::tag(input_bits::PANIC), Some("panic"));
        assert_eq!(input_bits::tag(input_bits::CHARGER), Some("charger"));
        assert_eq!(
            input_bits::tag(input_bits::EXTERNAL_POWER),
            Some("external_power")
        );
        assert_eq!(input_bits::tag(0x40), None);
    }

    #[test]
    fn event_kind_tags() {
        assert_eq!(Event::Track.kind(), "TRACK");
        assert_eq!(
            Event::IoFix {
                tag: "panic".into(),
                level: true
            }
            .kind(),
            "IO_FIX"
        );
        assert_eq!(
            Event::PeopleCount {
                sensor_id: "aa:bb:cc:dd:ee:ff".into(),
                entered: 3,
                exited: 1
            }
            .kind(),
            "PEOPLE_COUNT"
        );
    }

    #[test]
    fn event_payload_is_tagged_json() {
        let event = Event::Alarm {
            code: 1,
            name: "panic".into(),
        };
        let payload = event.payload().unwrap();
        assert_eq!(payload["event"], "alarm");
        assert_eq!(payload["code"], 1);
    }

    #[test]
    fn firmware_state_round_trips_through_tags() {
        let cases = [
            (FirmwareState::Idle, ""),
            (FirmwareState::Start, "-"),
            (FirmwareState::Row(17), "17"),
            (FirmwareState::Done(0), "OK 0"),
            (FirmwareState::Error("row mismatch".into()), "ERROR row mismatch"),
        ];
        for (state, tag) in cases {
            assert_eq!(state.to_string(), tag);
            assert_eq!(FirmwareState::parse(tag), state);
        }
    }

    #[test]
    fn firmware_state_parse_tolerates_garbage() {
        assert!(matches!(
            FirmwareState::parse("???"),
            FirmwareState::Error(_)
        ));
    }

    #[test]
    fn command_delivery_mappings() {
        assert_eq!(Command::MotorOn.avl_code(), Some(0x30));
        assert_eq!(Command::Reset.concox_text(), Some("RESET#"));
        assert_eq!(Command::StartBootloader.avl_code(), None);
        assert_eq!(Command::Info.concox_text(), None);
    }

    #[test]
    fn provisioned_device_uses_padded_name() {
        let imei = Imei::new(352_749_380_148_144).unwrap();
        let device = Device::provisioned(imei, "default");
        assert_eq!(device.name, "352749380148144");
        assert_eq!(device.firmware_state, FirmwareState::Idle);
        assert!(device.comments.is_empty());
    }
}
