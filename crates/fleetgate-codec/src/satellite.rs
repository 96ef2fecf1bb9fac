//! Satellite uplink codec (TCP)
//!
//! One burst per connection: a 38-byte header (10 bytes padding, 15
//! ASCII IMEI digits, 1 byte padding, `seq:u16` little-endian, 10 bytes
//! padding) followed by 12-byte position records. Each record is the
//! C layout `ym:u8 _pad:u8 tm:u16 lat:f32 lon:f32`, little-endian:
//! `ym` packs year−2007 in the high nibble and month in the low one,
//! `tm` packs day in bits 11–15, hour in 6–10 and minute in 0–5.
//! Minute-resolution fixes, no speed or course, and no response.

use crate::cursor::Cursor;
use crate::{DecodeError, FrameOutcome};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

const HEADER_LEN: usize = 38;
const RECORD_LEN: usize = 12;
const EPOCH_YEAR: i32 = 2007;

/// One minute-resolution fix
#[derive(Debug, Clone, PartialEq)]
pub struct SatelliteFix {
    /// Fix timestamp, minute resolution
    pub timestamp: DateTime<Utc>,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
}

/// A decoded burst
#[derive(Debug, Clone, PartialEq)]
pub struct SatelliteBurst {
    /// IMEI from the 15 ASCII digits
    pub imei: u64,
    /// Burst sequence number
    pub seq: u16,
    /// Fixes in wire order
    pub fixes: Vec<SatelliteFix>,
}

/// Decode a read buffer into a burst.
///
/// The protocol has no length prefix, so the burst is complete only
/// when the buffer holds the header plus a whole number of records;
/// a trailing partial record keeps the outcome at `NeedMore` until the
/// rest arrives (or the idle timeout closes the connection).
#[must_use]
pub fn read_burst(buf: &[u8]) -> FrameOutcome<SatelliteBurst> {
    if buf.len() < HEADER_LEN + RECORD_LEN {
        return FrameOutcome::NeedMore;
    }
    if (buf.len() - HEADER_LEN) % RECORD_LEN != 0 {
        return FrameOutcome::NeedMore;
    }

    let imei_text = &buf[10..25];
    let Some(imei) = std::str::from_utf8(imei_text)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
    else {
        return FrameOutcome::Invalid(DecodeError::Field(format!(
            "non-numeric IMEI field {imei_text:02x?}"
        )));
    };
    let seq = u16::from_le_bytes([buf[26], buf[27]]);

    let mut cur = Cursor::new(&buf[HEADER_LEN..]);
    let mut fixes = Vec::with_capacity((buf.len() - HEADER_LEN) / RECORD_LEN);
    while cur.remaining() > 0 {
        match parse_record(&mut cur) {
            Ok(fix) => fixes.push(fix),
            Err(e) => return FrameOutcome::Invalid(e),
        }
    }

    FrameOutcome::Frame {
        frame: SatelliteBurst { imei, seq, fixes },
        consumed: buf.len(),
    }
}

fn parse_record(cur: &mut Cursor<'_>) -> Result<SatelliteFix, DecodeError> {
    let ym = cur.u8()?;
    cur.u8()?; // alignment padding
    let tm = cur.u16_le()?;
    let latitude = f64::from(cur.f32_le()?);
    let longitude = f64::from(cur.f32_le()?);

    let year = EPOCH_YEAR + i32::from(ym >> 4);
    let month = u32::from(ym & 0x0F);
    let day = u32::from(tm >> 11);
    let hour = u32::from((tm >> 6) & 0x1F);
    let minute = u32::from(tm & 0x3F);

    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .ok_or_else(|| {
            DecodeError::Field(format!("invalid packed date ym={ym:#04x} tm={tm:#06x}"))
        })?;

    Ok(SatelliteFix {
        timestamp: Utc.from_utc_datetime(&naive),
        latitude,
        longitude,
    })
}
