//! Meiligao UDP codec
//!
//! One datagram per frame: `$$ len:u16 id:[u8;7] cmd:u16 payload crc:u16
//! \r\n`, big-endian, `len` counting the whole frame. The CRC is
//! CRC-16/CCITT-FALSE over everything before it. The only command the
//! backend consumes is `0x9955`, a pipe-separated payload whose first
//! field is the body of an NMEA GPRMC sentence.

use crate::{DecodeError, crc, decode_bcd};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

/// Command numbers
pub mod command {
    /// Position report with a GPRMC body
    pub const TRACK: u16 = 0x9955;
}

const MAGIC: [u8; 2] = [b'$', b'$'];
const TERMINATOR: [u8; 2] = [0x0D, 0x0A];
const KNOTS_TO_KMH: f64 = 1.852;

/// Envelope overhead: magic, length, id, command, CRC, terminator
const OVERHEAD: usize = 2 + 2 + 7 + 2 + 2 + 2;

/// A frame with the envelope stripped and CRC verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeiligaoFrame {
    /// Device id from the 7 BCD bytes
    pub device_id: u64,
    /// Command number
    pub command: u16,
    /// Payload between the command and the CRC
    pub payload: Vec<u8>,
}

/// Position parsed from a `0x9955` payload
#[derive(Debug, Clone, PartialEq)]
pub struct TrackReport {
    /// Fix timestamp from the GPRMC time and date fields
    pub timestamp: DateTime<Utc>,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Speed converted from knots to km/h
    pub speed_kmh: f64,
    /// Course in degrees, zero when the sentence omits it
    pub course: f64,
}

/// Decode one UDP datagram into a frame.
pub fn decode(buf: &[u8]) -> Result<MeiligaoFrame, DecodeError> {
    if buf.len() < OVERHEAD {
        return Err(DecodeError::Truncated);
    }
    if buf[0..2] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let declared = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    if declared != buf.len() {
        return Err(DecodeError::BadLength { length: declared });
    }
    if buf[buf.len() - 2..] != TERMINATOR {
        return Err(DecodeError::Field("missing frame terminator".to_string()));
    }

    let crc_offset = buf.len() - 4;
    let actual = u16::from_be_bytes([buf[crc_offset], buf[crc_offset + 1]]);
    let expected = crc::crc16_ccitt_false(&buf[..crc_offset]);
    if expected != actual {
        return Err(DecodeError::BadChecksum { expected, actual });
    }

    Ok(MeiligaoFrame {
        device_id: decode_bcd(&buf[4..11])?,
        command: u16::from_be_bytes([buf[11], buf[12]]),
        payload: buf[13..crc_offset].to_vec(),
    })
}

/// Parse a `0x9955` payload into a position.
pub fn parse_track(payload: &[u8]) -> Result<TrackReport, DecodeError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DecodeError::Field("non-ASCII track payload".to_string()))?;
    let gprmc = text.split('|').next().unwrap_or_default();
    let fields: Vec<&str> = gprmc.split(',').collect();
    if fields.len() < 9 {
        return Err(DecodeError::Field(format!(
            "GPRMC body has {} fields, expected at least 9",
            fields.len()
        )));
    }

    if fields[1] != "A" {
        return Err(DecodeError::Field("GPRMC status is void".to_string()));
    }

    let latitude = parse_coord(fields[2], 2)? * hemisphere_sign(fields[3], 'S')?;
    let longitude = parse_coord(fields[4], 3)? * hemisphere_sign(fields[5], 'W')?;
    let speed_knots = parse_float(fields[6], "speed")?;
    let course = if fields[7].is_empty() {
        0.0
    } else {
        parse_float(fields[7], "course")?
    };
    let timestamp = parse_timestamp(fields[0], fields[8])?;

    Ok(TrackReport {
        timestamp,
        latitude,
        longitude,
        speed_kmh: speed_knots * KNOTS_TO_KMH,
        course,
    })
}

/// `ddmm.mmmm` (or `dddmm.mmmm`) to decimal degrees.
fn parse_coord(raw: &str, deg_digits: usize) -> Result<f64, DecodeError> {
    if raw.len() <= deg_digits {
        return Err(DecodeError::Field(format!("coordinate '{raw}' too short")));
    }
    let degrees: f64 = raw[..deg_digits]
        .parse()
        .map_err(|_| DecodeError::Field(format!("bad degrees in '{raw}'")))?;
    let minutes: f64 = raw[deg_digits..]
        .parse()
        .map_err(|_| DecodeError::Field(format!("bad minutes in '{raw}'")))?;
    Ok(degrees + minutes / 60.0)
}

fn hemisphere_sign(raw: &str, negative: char) -> Result<f64, DecodeError> {
    match raw.chars().next() {
        Some(c) if c == negative => Ok(-1.0),
        Some('N' | 'E') => Ok(1.0),
        _ => Err(DecodeError::Field(format!("bad hemisphere '{raw}'"))),
    }
}

fn parse_float(raw: &str, what: &str) -> Result<f64, DecodeError> {
    raw.parse()
        .map_err(|_| DecodeError::Field(format!("bad {what} '{raw}'")))
}

/// `hhmmss[.sss]` + `ddmmyy` to UTC.
fn parse_timestamp(time: &str, date: &str) -> Result<DateTime<Utc>, DecodeError> {
    let time = time.split('.').next().unwrap_or_default();
    if time.len() != 6 || date.len() != 6 {
        return Err(DecodeError::Field(format!(
            "bad time/date '{time}'/'{date}'"
        )));
    }
    let field = |s: &str, range: std::ops::Range<usize>| -> Result<u32, DecodeError> {
        s[range]
            .parse()
            .map_err(|_| DecodeError::Field(format!("non-digit in time/date '{s}'")))
    };
    let (hh, mm, ss) = (field(time, 0..2)?, field(time, 2..4)?, field(time, 4..6)?);
    let naive = NaiveDate::from_ymd_opt(
        2000 + field(date, 4..6)? as i32,
        field(date, 2..4)?,
        field(date, 0..2)?,
    )
    .and_then(|d| d.and_hms_opt(hh, mm, ss))
    .ok_or_else(|| DecodeError::Field(format!("invalid time/date '{time}'/'{date}'")))?;
    Ok(Utc.from_utc_datetime(&naive))
}
