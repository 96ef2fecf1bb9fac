//! Concox/GT06 TCP codec (big-endian)
//!
//! Two frame shapes share one layout: short frames open with `0x78 0x78`
//! and a one-byte length, long frames with `0x79 0x79` and a two-byte
//! length. The length counts protocol byte through CRC; the CRC-16/X-25
//! runs from the length field through the serial. Frames end in `\r\n`.

use crate::cursor::Cursor;
use crate::{DecodeError, FrameOutcome, crc, decode_bcd};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

/// Protocol numbers
pub mod proto {
    /// Login with BCD IMEI
    pub const LOGIN: u8 = 0x01;
    /// GPS location
    pub const GPS: u8 = 0x22;
    /// GPS location (alternate firmware)
    pub const GPS_ALT: u8 = 0x2D;
    /// GPS location, 4G variant with a 12-byte cell id
    pub const GPS_4G: u8 = 0xA0;
    /// Heartbeat / status
    pub const HEARTBEAT: u8 = 0x23;
    /// Alarm
    pub const ALARM: u8 = 0x19;
    /// Alarm, 4G variant
    pub const ALARM_4G: u8 = 0xA5;
    /// Ack the device expects after a 4G alarm
    pub const ALARM_4G_ACK: u8 = 0x26;
    /// WiFi scan info
    pub const WIFI: u8 = 0x2C;
    /// WiFi scan info, 4G variant
    pub const WIFI_4G: u8 = 0xA2;
    /// Time calibration request
    pub const TIME_CALIBRATION: u8 = 0x8A;
    /// General info with sub-records
    pub const INFO: u8 = 0x94;
    /// Server → device ASCII command
    pub const COMMAND: u8 = 0x80;
}

/// Info sub-record types inside a `0x94` frame
pub mod info_sub {
    /// External supply voltage, centivolts
    pub const EXTERNAL_VOLTAGE: u8 = 0x00;
    /// ASCII self-description
    pub const SELF_DESCRIPTION: u8 = 0x04;
    /// IMEI / IMSI / ICCID triple, BCD
    pub const IDENTITY: u8 = 0x05;
}

const SHORT_MAGIC: [u8; 2] = [0x78, 0x78];
const LONG_MAGIC: [u8; 2] = [0x79, 0x79];
const TERMINATOR: [u8; 2] = [0x0D, 0x0A];

/// Latitude/longitude wire unit: 1/1,800,000 of a degree
const COORD_SCALE: f64 = 1_800_000.0;

const COURSE_MASK: u16 = 0x03FF;
const WEST_BIT: u16 = 0x0400;
const SOUTH_BIT: u16 = 0x0800;
const FIXED_BIT: u16 = 0x1000;

/// A raw frame with the envelope stripped and CRC verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcoxFrame {
    /// Protocol number
    pub proto: u8,
    /// Payload between the protocol byte and the serial
    pub payload: Vec<u8>,
    /// Frame serial, echoed in responses
    pub serial: u16,
}

/// Pull one frame off the front of a TCP read buffer.
#[must_use]
pub fn read_frame(buf: &[u8]) -> FrameOutcome<ConcoxFrame> {
    if buf.len() < 2 {
        return FrameOutcome::NeedMore;
    }
    let magic = [buf[0], buf[1]];
    let (header_len, body_len) = if magic == SHORT_MAGIC {
        if buf.len() < 3 {
            return FrameOutcome::NeedMore;
        }
        (3, usize::from(buf[2]))
    } else if magic == LONG_MAGIC {
        if buf.len() < 4 {
            return FrameOutcome::NeedMore;
        }
        (4, usize::from(u16::from_be_bytes([buf[2], buf[3]])))
    } else {
        return FrameOutcome::Invalid(DecodeError::BadMagic);
    };

    // proto + serial + crc is the smallest possible body
    if body_len < 5 {
        return FrameOutcome::Invalid(DecodeError::BadLength { length: body_len });
    }
    let total = header_len + body_len + TERMINATOR.len();
    if buf.len() < total {
        return FrameOutcome::NeedMore;
    }
    if buf[total - 2..total] != TERMINATOR {
        return FrameOutcome::Invalid(DecodeError::Field(
            "missing frame terminator".to_string(),
        ));
    }

    let crc_offset = header_len + body_len - 2;
    let actual = u16::from_be_bytes([buf[crc_offset], buf[crc_offset + 1]]);
    let expected = crc::crc16_x25(&buf[2..crc_offset]);
    if expected != actual {
        return FrameOutcome::Invalid(DecodeError::BadChecksum { expected, actual });
    }

    let serial_offset = crc_offset - 2;
    let frame = ConcoxFrame {
        proto: buf[header_len],
        payload: buf[header_len + 1..serial_offset].to_vec(),
        serial: u16::from_be_bytes([buf[serial_offset], buf[serial_offset + 1]]),
    };
    FrameOutcome::Frame {
        frame,
        consumed: total,
    }
}

/// GPS record carried by `0x22`/`0x2D`/`0xA0`
#[derive(Debug, Clone, PartialEq)]
pub struct GpsRecord {
    /// Fix timestamp from the device clock
    pub timestamp: DateTime<Utc>,
    /// Satellites used for the fix
    pub satellites: u8,
    /// GPS quality nibble
    pub quality: u8,
    /// Latitude in decimal degrees, clamped to [-90, 90]
    pub latitude: f64,
    /// Longitude in decimal degrees, clamped to [-180, 180]
    pub longitude: f64,
    /// Speed in km/h
    pub speed: u8,
    /// Course in degrees, 0..360
    pub course: u16,
    /// GPS-fixed status bit; unfixed records are dropped by the engine
    pub fixed: bool,
    /// ACC/ignition line where the frame carries it
    pub acc_on: Option<bool>,
}

/// Identity triple from a `0x94`/`0x05` sub-record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityInfo {
    /// IMEI digits
    pub imei: u64,
    /// IMSI digits
    pub imsi: u64,
    /// ICCID digits; 20 digits do not fit a u64
    pub iccid: String,
}

/// Info sub-record of a `0x94` frame
#[derive(Debug, Clone, PartialEq)]
pub enum InfoRecord {
    /// External supply voltage, centivolts
    ExternalVoltage(u16),
    /// ASCII self-description
    SelfDescription(String),
    /// IMEI / IMSI / ICCID triple
    Identity(IdentityInfo),
    /// Sub-type the codec does not interpret
    Unknown {
        /// Sub-record type byte
        sub: u8,
    },
}

/// A decoded device → server message
#[derive(Debug, Clone, PartialEq)]
pub enum ConcoxMessage {
    /// Login with the device IMEI
    Login {
        /// IMEI decoded from 8 BCD bytes
        imei: u64,
        /// Terminal type id, when present
        type_id: Option<u16>,
        /// Timezone/language word, when present
        timezone: Option<u16>,
    },
    /// Position fix
    Gps(GpsRecord),
    /// Heartbeat / status
    Heartbeat {
        /// Terminal info bitmap
        terminal_info: u8,
        /// Battery voltage, centivolts
        voltage_centivolts: u16,
        /// GSM signal strength, 0..=4 typically
        gsm_signal: u8,
        /// Alarm/language extension word
        extra: u16,
    },
    /// Alarm
    Alarm {
        /// Terminal info bitmap
        terminal_info: u8,
        /// Battery voltage level, 0..=6
        voltage_level: u8,
        /// GSM signal strength
        gsm_signal: u8,
        /// Vendor alarm code
        code: u8,
        /// Language byte
        language: u8,
    },
    /// WiFi scan; decoded for diagnostics only
    Wifi {
        /// Raw payload
        payload: Vec<u8>,
    },
    /// Device asks for the current UTC time
    TimeCalibration,
    /// General info sub-record
    Info(InfoRecord),
}

/// Decode the payload of a frame into a message.
pub fn decode_message(frame: &ConcoxFrame) -> Result<ConcoxMessage, DecodeError> {
    let mut cur = Cursor::new(&frame.payload);
    match frame.proto {
        proto::LOGIN => {
            let imei = decode_bcd(cur.take(8)?)?;
            let type_id = (cur.remaining() >= 2).then(|| cur.u16_be()).transpose()?;
            let timezone = (cur.remaining() >= 2).then(|| cur.u16_be()).transpose()?;
            Ok(ConcoxMessage::Login {
                imei,
                type_id,
                timezone,
            })
        }
        proto::GPS | proto::GPS_ALT | proto::GPS_4G => {
            let cell_len = if frame.proto == proto::GPS_4G { 12 } else { 5 };
            decode_gps(&mut cur, cell_len).map(ConcoxMessage::Gps)
        }
        proto::HEARTBEAT => Ok(ConcoxMessage::Heartbeat {
            terminal_info: cur.u8()?,
            voltage_centivolts: cur.u16_be()?,
            gsm_signal: cur.u8()?,
            extra: cur.u16_be()?,
        }),
        proto::ALARM | proto::ALARM_4G => {
            cur.take(4)?; // cell shorthand, unused
            Ok(ConcoxMessage::Alarm {
                terminal_info: cur.u8()?,
                voltage_level: cur.u8()?,
                gsm_signal: cur.u8()?,
                code: cur.u8()?,
                language: cur.u8()?,
            })
        }
        proto::WIFI | proto::WIFI_4G => Ok(ConcoxMessage::Wifi {
            payload: frame.payload.clone(),
        }),
        proto::TIME_CALIBRATION => Ok(ConcoxMessage::TimeCalibration),
        proto::INFO => decode_info(&mut cur).map(ConcoxMessage::Info),
        other => Err(DecodeError::UnknownTag { tag: other }),
    }
}

fn decode_gps(cur: &mut Cursor<'_>, cell_len: usize) -> Result<GpsRecord, DecodeError> {
    let timestamp = decode_utc6(cur.take(6)?)?;
    let sat_quality = cur.u8()?;
    let lat_raw = cur.u32_be()?;
    let lon_raw = cur.u32_be()?;
    let speed = cur.u8()?;
    let course_status = cur.u16_be()?;

    // MCC + MNC + cell id, then an optional ACC byte
    let mut acc_on = None;
    if cur.remaining() >= 3 + cell_len {
        cur.take(3 + cell_len)?;
        if cur.remaining() >= 1 {
            acc_on = Some(cur.u8()? != 0);
        }
    }

    let mut latitude = f64::from(lat_raw) / COORD_SCALE;
    let mut longitude = f64::from(lon_raw) / COORD_SCALE;
    if course_status & SOUTH_BIT != 0 {
        latitude = -latitude;
    }
    if course_status & WEST_BIT != 0 {
        longitude = -longitude;
    }

    Ok(GpsRecord {
        timestamp,
        satellites: sat_quality & 0x0F,
        quality: sat_quality >> 4,
        latitude: latitude.clamp(-90.0, 90.0),
        longitude: longitude.clamp(-180.0, 180.0),
        speed,
        course: course_status & COURSE_MASK,
        fixed: course_status & FIXED_BIT != 0,
        acc_on,
    })
}

fn decode_info(cur: &mut Cursor<'_>) -> Result<InfoRecord, DecodeError> {
    let sub = cur.u8()?;
    match sub {
        info_sub::EXTERNAL_VOLTAGE => Ok(InfoRecord::ExternalVoltage(cur.u16_be()?)),
        info_sub::SELF_DESCRIPTION => {
            let text = String::from_utf8_lossy(cur.take(cur.remaining())?)
                .trim_end_matches('\0')
                .to_string();
            Ok(InfoRecord::SelfDescription(text))
        }
        info_sub::IDENTITY => {
            let imei = decode_bcd(cur.take(8)?)?;
            let imsi = decode_bcd(cur.take(8)?)?;
            let iccid = bcd_digits(cur.take(10)?)?;
            Ok(InfoRecord::Identity(IdentityInfo { imei, imsi, iccid }))
        }
        other => Ok(InfoRecord::Unknown { sub: other }),
    }
}

/// ICCIDs run to 20 digits, past what a u64 holds.
fn bcd_digits(bytes: &[u8]) -> Result<String, DecodeError> {
    let mut digits = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        for nibble in [byte >> 4, byte & 0x0F] {
            match nibble {
                0..=9 => digits.push(char::from(b'0' + nibble)),
                0xF => {}
                _ => {
                    return Err(DecodeError::Field(format!(
                        "non-decimal BCD nibble {nibble:#x}"
                    )));
                }
            }
        }
    }
    Ok(digits)
}

/// 6-byte UTC: year-2000, month, day, hour, minute, second
fn decode_utc6(bytes: &[u8]) -> Result<DateTime<Utc>, DecodeError> {
    let date = NaiveDate::from_ymd_opt(
        2000 + i32::from(bytes[0]),
        u32::from(bytes[1]),
        u32::from(bytes[2]),
    )
    .and_then(|d| {
        d.and_hms_opt(
            u32::from(bytes[3]),
            u32::from(bytes[4]),
            u32::from(bytes[5]),
        )
    })
    .ok_or_else(|| DecodeError::Field(format!("invalid UTC bytes {bytes:02x?}")))?;
    Ok(Utc.from_utc_datetime(&date))
}

fn encode_utc6(ts: DateTime<Utc>) -> [u8; 6] {
    use chrono::{Datelike, Timelike};
    [
        (ts.year() - 2000) as u8,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
    ]
}

/// Build a short response frame echoing the request serial.
#[must_use]
pub fn encode_response(proto: u8, payload: &[u8], serial: u16) -> Vec<u8> {
    let body_len = 1 + payload.len() + 2 + 2;
    let mut out = Vec::with_capacity(2 + 1 + body_len + 2);
    out.extend_from_slice(&SHORT_MAGIC);
    out.push(body_len as u8);
    out.push(proto);
    out.extend_from_slice(payload);
    out.extend_from_slice(&serial.to_be_bytes());
    let crc = crc::crc16_x25(&out[2..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&TERMINATOR);
    out
}

/// Empty-payload ack for a given protocol number.
#[must_use]
pub fn encode_ack(proto: u8, serial: u16) -> Vec<u8> {
    encode_response(proto, &[], serial)
}

/// Time-calibration response carrying the current UTC.
#[must_use]
pub fn encode_time_response(serial: u16, now: DateTime<Utc>) -> Vec<u8> {
    encode_response(proto::TIME_CALIBRATION, &encode_utc6(now), serial)
}

/// Outbound ASCII command frame (`0x80`): `len:u8 flag:u32 text`.
#[must_use]
pub fn encode_command(text: &str, serial: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5 + text.len());
    payload.push((4 + text.len()) as u8);
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(text.as_bytes());
    encode_response(proto::COMMAND, &payload, serial)
}

/// Human-readable alarm name for an alarm code.
#[must_use]
pub fn alarm_name(code: u8) -> &'static str {
    match code {
        0x01 => "panic",
        0x02 => "power_cut",
        0x03 => "vibration",
        0x04 => "fence_enter",
        0x05 => "fence_exit",
        0x06 => "overspeed",
        0x09 => "displacement",
        _ => "unknown",
    }
}
