//! Wialon-style text codec (TCP, ASCII)
//!
//! Line-oriented, `\r\n`-terminated. Three message kinds: login
//! `#L#imei;password`, data `#D#` with sixteen `;`-separated fields, and
//! ping `#P#`. `NA` or an empty field stands for "not available".

use crate::{DecodeError, FrameOutcome};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

const TERMINATOR: &[u8] = b"\r\n";

/// Lines longer than this without a terminator mean a confused peer
const MAX_LINE: usize = 4096;

/// A parsed `#D#` record
#[derive(Debug, Clone, PartialEq)]
pub struct WialonData {
    /// Fix timestamp from the date and time fields
    pub timestamp: DateTime<Utc>,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Speed in km/h
    pub speed: f64,
    /// Course in degrees
    pub course: f64,
    /// Altitude in metres
    pub altitude: f64,
    /// Satellites used for the fix
    pub satellites: i16,
    /// Horizontal dilution of precision, when reported
    pub hdop: Option<f64>,
    /// Input bitmap
    pub inputs: u32,
    /// Output bitmap
    pub outputs: u32,
    /// Raw ADC field
    pub adc: Option<String>,
    /// iButton driver id
    pub ibutton: Option<String>,
    /// Raw params field
    pub params: Option<String>,
}

/// A decoded device → server line
#[derive(Debug, Clone, PartialEq)]
pub enum WialonMessage {
    /// Login line
    Login {
        /// IMEI digits
        imei: u64,
        /// Password field; checked against the shared token when one
        /// is configured
        password: String,
    },
    /// Position report
    Data(WialonData),
    /// Keep-alive
    Ping,
}

/// Pull one line off the front of a TCP read buffer.
#[must_use]
pub fn read_line(buf: &[u8]) -> FrameOutcome<WialonMessage> {
    let Some(end) = buf.windows(2).position(|w| w == TERMINATOR) else {
        if buf.len() > MAX_LINE {
            return FrameOutcome::Invalid(DecodeError::BadLength { length: buf.len() });
        }
        return FrameOutcome::NeedMore;
    };
    let Ok(line) = std::str::from_utf8(&buf[..end]) else {
        return FrameOutcome::Invalid(DecodeError::Field(
            "non-ASCII bytes in text line".to_string(),
        ));
    };
    match parse_line(line) {
        Ok(frame) => FrameOutcome::Frame {
            frame,
            consumed: end + TERMINATOR.len(),
        },
        Err(e) => FrameOutcome::Invalid(e),
    }
}

fn parse_line(line: &str) -> Result<WialonMessage, DecodeError> {
    if let Some(rest) = line.strip_prefix("#L#") {
        let (imei, password) = rest
            .split_once(';')
            .ok_or_else(|| DecodeError::Field("login without password field".to_string()))?;
        let imei = imei
            .parse()
            .map_err(|_| DecodeError::Field(format!("non-numeric IMEI '{imei}'")))?;
        return Ok(WialonMessage::Login {
            imei,
            password: password.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("#D#") {
        return parse_data(rest).map(WialonMessage::Data);
    }
    if line.starts_with("#P#") {
        return Ok(WialonMessage::Ping);
    }
    Err(DecodeError::Field(format!(
        "unrecognized line prefix '{}'",
        line.chars().take(4).collect::<String>()
    )))
}

fn parse_data(body: &str) -> Result<WialonData, DecodeError> {
    let fields: Vec<&str> = body.split(';').collect();
    if fields.len() < 14 {
        return Err(DecodeError::Field(format!(
            "data line has {} fields, expected at least 14",
            fields.len()
        )));
    }

    let timestamp = parse_timestamp(fields[0], fields[1])?;
    let latitude = signed_coord(fields[2], fields[3], "latitude")?;
    let longitude = signed_coord(fields[4], fields[5], "longitude")?;

    Ok(WialonData {
        timestamp,
        latitude,
        longitude,
        speed: opt_float(fields[6], "speed")?.unwrap_or(0.0),
        course: opt_float(fields[7], "course")?.unwrap_or(0.0),
        altitude: opt_float(fields[8], "altitude")?.unwrap_or(0.0),
        satellites: opt_float(fields[9], "satellites")?.unwrap_or(0.0) as i16,
        hdop: opt_float(fields[10], "hdop")?,
        inputs: opt_float(fields[11], "inputs")?.unwrap_or(0.0) as u32,
        outputs: opt_float(fields[12], "outputs")?.unwrap_or(0.0) as u32,
        adc: opt_text(fields[13]),
        ibutton: fields.get(14).copied().and_then(opt_text),
        params: fields.get(15).copied().and_then(opt_text),
    })
}

/// `deg + min/60`, the sign of the degrees deciding the sign of the
/// result. Negative degrees force a negative coordinate even when the
/// minutes are positive.
fn signed_coord(deg: &str, minutes: &str, what: &str) -> Result<f64, DecodeError> {
    let deg: f64 = deg
        .parse()
        .map_err(|_| DecodeError::Field(format!("bad {what} degrees '{deg}'")))?;
    let minutes: f64 = minutes
        .parse()
        .map_err(|_| DecodeError::Field(format!("bad {what} minutes '{minutes}'")))?;
    let magnitude = deg.abs() + minutes.abs() / 60.0;
    Ok(if deg.is_sign_negative() {
        -magnitude
    } else {
        magnitude
    })
}

fn opt_float(raw: &str, what: &str) -> Result<Option<f64>, DecodeError> {
    if raw.is_empty() || raw == "NA" {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| DecodeError::Field(format!("bad {what} '{raw}'")))
}

fn opt_text(raw: &str) -> Option<String> {
    if raw.is_empty() || raw == "NA" {
        None
    } else {
        Some(raw.to_string())
    }
}

/// `ddmmyy` + `hhmmss` to UTC.
fn parse_timestamp(date: &str, time: &str) -> Result<DateTime<Utc>, DecodeError> {
    if date.len() != 6 || time.len() != 6 {
        return Err(DecodeError::Field(format!(
            "bad date/time '{date}'/'{time}'"
        )));
    }
    let field = |s: &str, range: std::ops::Range<usize>| -> Result<u32, DecodeError> {
        s[range]
            .parse()
            .map_err(|_| DecodeError::Field(format!("non-digit in date/time '{s}'")))
    };
    let (hh, mm, ss) = (field(time, 0..2)?, field(time, 2..4)?, field(time, 4..6)?);
    let naive = NaiveDate::from_ymd_opt(
        2000 + field(date, 4..6)? as i32,
        field(date, 2..4)?,
        field(date, 0..2)?,
    )
    .and_then(|d| d.and_hms_opt(hh, mm, ss))
    .ok_or_else(|| DecodeError::Field(format!("invalid date/time '{date}'/'{time}'")))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// `#AL#1` on accept, `#AL#0` on reject.
#[must_use]
pub fn encode_login_ack(accepted: bool) -> Vec<u8> {
    if accepted {
        b"#AL#1\r\n".to_vec()
    } else {
        b"#AL#0\r\n".to_vec()
    }
}

/// Data ack `#AD#1`.
#[must_use]
pub fn encode_data_ack() -> Vec<u8> {
    b"#AD#1\r\n".to_vec()
}

/// Ping ack `#AP#`.
#[must_use]
pub fn encode_ping_ack() -> Vec<u8> {
    b"#AP#\r\n".to_vec()
}
