//! AVL/Bluetooth-gateway UDP codec
//!
//! One datagram per packet, all multibyte fields little-endian. The first
//! byte selects the packet type; data packets carry a CRC-16/AUG-CCITT
//! trailer over everything before it. Responses are built with
//! [`encode_response`]; bootloader responses get the same CRC trailer.

use crate::cursor::Cursor;
use crate::firmware::FirmwareRow;
use crate::{DecodeError, crc};
use chrono::{DateTime, Utc};
use fleetgate_core::input_bits;
use fleetgate_core::utils::unix_to_utc;

/// Packet type tags (device → server and server → device)
pub mod tag {
    /// Device login (IMEI + MAC)
    pub const LOGIN: u8 = 0x01;
    /// Keep-alive with one position record
    pub const PING: u8 = 0x02;
    /// Device self-description blob
    pub const DEVINFO: u8 = 0x03;
    /// Bulk record upload
    pub const DATA: u8 = 0x04;
    /// Session grant (server → device)
    pub const SESSION: u8 = 0x10;
    /// Ask the device to log in again (server → device)
    pub const LOGIN_REQUEST: u8 = 0x11;
    /// Acknowledgement (server → device)
    pub const ACK: u8 = 0x12;
    /// Outbound command (server → device)
    pub const COMMAND: u8 = 0x13;
    /// Bootloader enter (both directions)
    pub const BTL_ENTER: u8 = 0x28;
    /// Bootloader row data / row ack (both directions)
    pub const BTL_DATA: u8 = 0x29;
    /// Bootloader exit / result (both directions)
    pub const BTL_EXIT: u8 = 0x2A;
}

/// Session sub-command carried by the session grant
pub mod subcmd {
    /// Ask the device to send its self-description
    pub const SEND_INFO: u8 = 0x20;
    /// Ask the device to send queued data
    pub const SEND_DATA: u8 = 0x21;
}

/// Record types inside a `DATA` packet
pub mod record_type {
    /// Array of 14-byte position records
    pub const TRACKS: u8 = 0x30;
    /// Array of 18-byte people-counter records
    pub const PEOPLE: u8 = 0x31;
    /// One accelerometer impact window
    pub const LIS: u8 = 0x32;
}

/// Largest record body a `DATA` packet may declare
pub const MAX_RECORD_SIZE: u32 = 248;

/// Target size for an outgoing bootloader row batch
pub const BOOT_BATCH_BYTES: usize = 1024;

/// Accelerometer sample tick rate
pub const LIS_TICK_HZ: f64 = 25.0;

/// Accelerometer magnitude scale divisor
pub const LIS_MAGNITUDE_SCALE: f64 = 16000.0;

const POSITION_RECORD_LEN: usize = 14;
const PEOPLE_RECORD_LEN: usize = 18;
const LIS_RECORD_LEN: usize = 36;

/// 14-byte position record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRecord {
    /// Unix seconds from the device clock
    pub ct: u32,
    /// Latitude in 1e-7 degrees, south negative
    pub lat_e7: i32,
    /// Longitude in 1e-7 degrees, west negative
    pub lon_e7: i32,
    /// Speed (device-defined unit); the changed-input mask on a delta fix
    pub speed: u8,
    /// Input bitmap; bit 7 marks a delta fix
    pub inputs: u8,
}

impl PositionRecord {
    /// Fix timestamp as reported by the device
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        unix_to_utc(i64::from(self.ct))
    }

    /// Latitude in decimal degrees
    #[must_use]
    pub fn latitude(&self) -> f64 {
        f64::from(self.lat_e7) * 1e-7
    }

    /// Longitude in decimal degrees
    #[must_use]
    pub fn longitude(&self) -> f64 {
        f64::from(self.lon_e7) * 1e-7
    }

    /// True for an I/O-change fix (inputs bit 7 set)
    #[must_use]
    pub const fn is_delta(&self) -> bool {
        self.inputs & input_bits::DELTA != 0
    }

    /// On a delta fix, the mask naming the changed input
    #[must_use]
    pub const fn delta_mask(&self) -> Option<u8> {
        if self.is_delta() { Some(self.speed) } else { None }
    }

    /// Input bitmap without the delta marker
    #[must_use]
    pub const fn input_bits(&self) -> u8 {
        self.inputs & !input_bits::DELTA
    }

    fn parse(cur: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            ct: cur.u32_le()?,
            lat_e7: cur.i32_le()?,
            lon_e7: cur.i32_le()?,
            speed: cur.u8()?,
            inputs: cur.u8()?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ct.to_le_bytes());
        out.extend_from_slice(&self.lat_e7.to_le_bytes());
        out.extend_from_slice(&self.lon_e7.to_le_bytes());
        out.push(self.speed);
        out.push(self.inputs);
    }
}

/// 18-byte people-counter record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeopleRecord {
    /// Unix seconds from the device clock
    pub ct: u32,
    /// Entries counted by the sensor
    pub entered: u32,
    /// Exits counted by the sensor
    pub exited: u32,
    /// Sensor MAC (little-endian on the wire)
    pub mac: [u8; 6],
}

impl PeopleRecord {
    /// Count timestamp as reported by the device
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        unix_to_utc(i64::from(self.ct))
    }

    fn parse(cur: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let ct = cur.u32_le()?;
        let entered = cur.u32_le()?;
        let exited = cur.u32_le()?;
        let raw = cur.take(6)?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(raw);
        mac.reverse(); // wire order is little-endian
        Ok(Self {
            ct,
            entered,
            exited,
            mac,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ct.to_le_bytes());
        out.extend_from_slice(&self.entered.to_le_bytes());
        out.extend_from_slice(&self.exited.to_le_bytes());
        let mut mac = self.mac;
        mac.reverse();
        out.extend_from_slice(&mac);
    }
}

/// Accelerometer impact window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LisRecord {
    /// Position at the time of the impact
    pub position: PositionRecord,
    /// Unix seconds of the window start
    pub ct_start: u32,
    /// Window duration in 25 Hz ticks
    pub duration_ticks: i32,
    /// Error-band duration in 25 Hz ticks
    pub err_duration_ticks: i32,
    /// Raw magnitudes: entry, err_entry, peak, err_exit, exit
    pub magnitudes: [u16; 5],
}

impl LisRecord {
    /// Window duration in seconds
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        f64::from(self.duration_ticks) / LIS_TICK_HZ
    }

    /// Error-band duration in seconds
    #[must_use]
    pub fn err_duration_secs(&self) -> f64 {
        f64::from(self.err_duration_ticks) / LIS_TICK_HZ
    }

    /// Magnitudes scaled to g: entry, err_entry, peak, err_exit, exit
    #[must_use]
    pub fn scaled_magnitudes(&self) -> [f64; 5] {
        self.magnitudes
            .map(|m| f64::from(m) / LIS_MAGNITUDE_SCALE)
    }

    fn parse(cur: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let position = PositionRecord::parse(cur)?;
        let ct_start = cur.u32_le()?;
        let duration_ticks = cur.i32_le()?;
        let err_duration_ticks = cur.i32_le()?;
        let mut magnitudes = [0u16; 5];
        for slot in &mut magnitudes {
            *slot = cur.u16_le()?;
        }
        Ok(Self {
            position,
            ct_start,
            duration_ticks,
            err_duration_ticks,
            magnitudes,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        self.position.write(out);
        out.extend_from_slice(&self.ct_start.to_le_bytes());
        out.extend_from_slice(&self.duration_ticks.to_le_bytes());
        out.extend_from_slice(&self.err_duration_ticks.to_le_bytes());
        for m in self.magnitudes {
            out.extend_from_slice(&m.to_le_bytes());
        }
    }
}

/// Body of one record inside a `DATA` packet
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    /// Periodic and delta position fixes
    Tracks(Vec<PositionRecord>),
    /// People-counter deltas
    People(Vec<PeopleRecord>),
    /// One impact window
    Lis(LisRecord),
    /// Record the decoder refused; the id still counts towards the ack range
    Skipped {
        /// Declared record type
        rtype: u8,
        /// Why the record was skipped
        reason: String,
    },
}

/// One record of a `DATA` packet
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    /// Monotonic record id assigned by the device
    pub id: u32,
    /// Decoded body
    pub body: RecordBody,
}

/// A decoded device → server packet
#[derive(Debug, Clone, PartialEq)]
pub enum AvlPacket {
    /// Login with raw IMEI and gateway MAC
    Login {
        /// IMEI as a little-endian u64
        imei: u64,
        /// Bluetooth gateway MAC
        mac: [u8; 6],
    },
    /// Keep-alive with the current position
    Ping {
        /// Session id issued at login
        session_id: u32,
        /// Current position
        position: PositionRecord,
    },
    /// Self-description blob
    DevInfo {
        /// Session id issued at login
        session_id: u32,
        /// ASCII description
        info: String,
    },
    /// Bulk upload
    Data {
        /// Session id issued at login
        session_id: u32,
        /// Records in frame order
        records: Vec<DataRecord>,
    },
    /// Device entered the bootloader
    BootEnter {
        /// Session id issued at login
        session_id: u32,
    },
    /// Device acknowledges rows below `next_row`
    BootData {
        /// Session id issued at login
        session_id: u32,
        /// Next row the device expects
        next_row: u16,
    },
    /// Device finished flashing
    BootExit {
        /// Session id issued at login
        session_id: u32,
        /// Device-reported result code
        result: u16,
    },
}

/// A server → device response
#[derive(Debug, Clone, PartialEq)]
pub enum AvlResponse {
    /// Session grant: `10 sid:u32 subcmd:u8`
    Session {
        /// Newly issued session id
        session_id: u32,
        /// [`subcmd::SEND_INFO`] or [`subcmd::SEND_DATA`]
        subcmd: u8,
    },
    /// Ask the device to log in again
    LoginRequest,
    /// Acknowledgement with the accepted record count and declared id range
    Ack {
        /// Records accepted from the packet
        count: u8,
        /// First declared record id
        first: u32,
        /// Last declared record id
        last: u32,
    },
    /// Outbound command frame
    Command {
        /// Code from [`fleetgate_core::Command::avl_code`]
        code: u8,
    },
    /// Enter the bootloader at the given flash array/row
    BootEnter {
        /// Flash array id
        array_id: u8,
        /// First row of the image
        first_row: u16,
    },
    /// A batch of firmware rows
    BootData {
        /// Rows in send order
        rows: Vec<FirmwareRow>,
    },
    /// Leave the bootloader; checksum covers the whole image
    BootExit {
        /// Total rows in the image
        row_count: u16,
        /// 16-bit sum of every payload byte of the image
        image_checksum: u16,
    },
}

/// Decode one UDP datagram into a packet.
pub fn decode(buf: &[u8]) -> Result<AvlPacket, DecodeError> {
    let mut cur = Cursor::new(buf);
    let tag = cur.u8()?;
    match tag {
        tag::LOGIN => {
            let imei = cur.u64_le()?;
            let raw = cur.take(6)?;
            let mut mac = [0u8; 6];
            mac.copy_from_slice(raw);
            mac.reverse();
            Ok(AvlPacket::Login { imei, mac })
        }
        tag::PING => {
            let session_id = cur.u32_le()?;
            let position = PositionRecord::parse(&mut cur)?;
            Ok(AvlPacket::Ping {
                session_id,
                position,
            })
        }
        tag::DEVINFO => {
            let session_id = cur.u32_le()?;
            let info = String::from_utf8_lossy(cur.take(cur.remaining())?)
                .trim_end_matches('\0')
                .to_string();
            Ok(AvlPacket::DevInfo { session_id, info })
        }
        tag::DATA => decode_data(buf),
        tag::BTL_ENTER => Ok(AvlPacket::BootEnter {
            session_id: cur.u32_le()?,
        }),
        tag::BTL_DATA => Ok(AvlPacket::BootData {
            session_id: cur.u32_le()?,
            next_row: cur.u16_le()?,
        }),
        tag::BTL_EXIT => Ok(AvlPacket::BootExit {
            session_id: cur.u32_le()?,
            result: cur.u16_le()?,
        }),
        other => Err(DecodeError::UnknownTag { tag: other }),
    }
}

/// `DATA` packets carry a CRC trailer over everything before it.
fn decode_data(buf: &[u8]) -> Result<AvlPacket, DecodeError> {
    if buf.len() < 1 + 4 + 2 {
        return Err(DecodeError::Truncated);
    }
    let crc_offset = buf.len() - 2;
    let actual = u16::from_le_bytes([buf[crc_offset], buf[crc_offset + 1]]);
    let expected = crc::crc16_aug_ccitt(&buf[..crc_offset]);
    if expected != actual {
        return Err(DecodeError::BadChecksum { expected, actual });
    }

    let mut cur = Cursor::new(&buf[1..crc_offset]);
    let session_id = cur.u32_le()?;
    let mut records = Vec::new();
    while cur.remaining() > 0 {
        let id = cur.u32_le()?;
        let size = cur.u32_le()?;
        if size == 0 {
            return Err(DecodeError::Field("record with zero size".to_string()));
        }
        let rtype = cur.u8()?;
        let body_len = (size - 1) as usize;
        let body = cur.take(body_len)?;
        records.push(DataRecord {
            id,
            body: parse_record_body(rtype, size, body),
        });
    }
    Ok(AvlPacket::Data {
        session_id,
        records,
    })
}

fn parse_record_body(rtype: u8, declared_size: u32, body: &[u8]) -> RecordBody {
    if declared_size > MAX_RECORD_SIZE {
        return RecordBody::Skipped {
            rtype,
            reason: format!("declared size {declared_size} exceeds {MAX_RECORD_SIZE}"),
        };
    }
    match rtype {
        record_type::TRACKS => {
            if body.len() % POSITION_RECORD_LEN != 0 {
                return RecordBody::Skipped {
                    rtype,
                    reason: format!("track body length {} not a multiple of 14", body.len()),
                };
            }
            let mut cur = Cursor::new(body);
            let mut tracks = Vec::with_capacity(body.len() / POSITION_RECORD_LEN);
            while cur.remaining() > 0 {
                match PositionRecord::parse(&mut cur) {
                    Ok(record) => tracks.push(record),
                    Err(e) => {
                        return RecordBody::Skipped {
                            rtype,
                            reason: e.to_string(),
                        };
                    }
                }
            }
            RecordBody::Tracks(tracks)
        }
        record_type::PEOPLE => {
            if body.len() % PEOPLE_RECORD_LEN != 0 {
                return RecordBody::Skipped {
                    rtype,
                    reason: format!("people body length {} not a multiple of 18", body.len()),
                };
            }
            let mut cur = Cursor::new(body);
            let mut counts = Vec::with_capacity(body.len() / PEOPLE_RECORD_LEN);
            while cur.remaining() > 0 {
                match PeopleRecord::parse(&mut cur) {
                    Ok(record) => counts.push(record),
                    Err(e) => {
                        return RecordBody::Skipped {
                            rtype,
                            reason: e.to_string(),
                        };
                    }
                }
            }
            RecordBody::People(counts)
        }
        record_type::LIS => {
            if body.len() != LIS_RECORD_LEN {
                return RecordBody::Skipped {
                    rtype,
                    reason: format!("LIS body length {} != 36", body.len()),
                };
            }
            let mut cur = Cursor::new(body);
            match LisRecord::parse(&mut cur) {
                Ok(record) => RecordBody::Lis(record),
                Err(e) => RecordBody::Skipped {
                    rtype,
                    reason: e.to_string(),
                },
            }
        }
        other => RecordBody::Skipped {
            rtype: other,
            reason: format!("unknown record type {other:#04x}"),
        },
    }
}

/// Encode a server → device response.
#[must_use]
pub fn encode_response(response: &AvlResponse) -> Vec<u8> {
    let mut out = Vec::new();
    match response {
        AvlResponse::Session {
            session_id,
            subcmd,
        } => {
            out.push(tag::SESSION);
            out.extend_from_slice(&session_id.to_le_bytes());
            out.push(*subcmd);
        }
        AvlResponse::LoginRequest => out.push(tag::LOGIN_REQUEST),
        AvlResponse::Ack { count, first, last } => {
            out.push(tag::ACK);
            out.push(*count);
            out.extend_from_slice(&first.to_le_bytes());
            out.extend_from_slice(&last.to_le_bytes());
        }
        AvlResponse::Command { code } => {
            out.push(tag::COMMAND);
            out.push(*code);
        }
        AvlResponse::BootEnter {
            array_id,
            first_row,
        } => {
            out.push(tag::BTL_ENTER);
            out.push(*array_id);
            out.extend_from_slice(&first_row.to_le_bytes());
            append_crc(&mut out);
        }
        AvlResponse::BootData { rows } => {
            out.push(tag::BTL_DATA);
            for row in rows {
                out.push(row.array_id);
                out.extend_from_slice(&row.row_number.to_le_bytes());
                out.extend_from_slice(&(row.data.len() as u16).to_le_bytes());
                out.extend_from_slice(&row.data);
            }
            append_crc(&mut out);
        }
        AvlResponse::BootExit {
            row_count,
            image_checksum,
        } => {
            out.push(tag::BTL_EXIT);
            out.extend_from_slice(&row_count.to_le_bytes());
            out.extend_from_slice(&image_checksum.to_le_bytes());
            append_crc(&mut out);
        }
    }
    out
}

fn append_crc(out: &mut Vec<u8>) {
    let crc = crc::crc16_aug_ccitt(out);
    out.extend_from_slice(&crc.to_le_bytes());
}

/// Decode a server → device response; exercised by the round-trip tests
/// and by protocol simulators.
pub fn decode_response(buf: &[u8]) -> Result<AvlResponse, DecodeError> {
    let mut cur = Cursor::new(buf);
    let tag = cur.u8()?;
    match tag {
        tag::SESSION => Ok(AvlResponse::Session {
            session_id: cur.u32_le()?,
            subcmd: cur.u8()?,
        }),
        tag::LOGIN_REQUEST => Ok(AvlResponse::LoginRequest),
        tag::ACK => Ok(AvlResponse::Ack {
            count: cur.u8()?,
            first: cur.u32_le()?,
            last: cur.u32_le()?,
        }),
        tag::COMMAND => Ok(AvlResponse::Command { code: cur.u8()? }),
        tag::BTL_ENTER | tag::BTL_DATA | tag::BTL_EXIT => {
            let crc_offset = buf.len().checked_sub(2).ok_or(DecodeError::Truncated)?;
            let actual = u16::from_le_bytes([buf[crc_offset], buf[crc_offset + 1]]);
            let expected = crc::crc16_aug_ccitt(&buf[..crc_offset]);
            if expected != actual {
                return Err(DecodeError::BadChecksum { expected, actual });
            }
            let mut cur = Cursor::new(&buf[1..crc_offset]);
            match tag {
                tag::BTL_ENTER => Ok(AvlResponse::BootEnter {
                    array_id: cur.u8()?,
                    first_row: cur.u16_le()?,
                }),
                tag::BTL_DATA => {
                    let mut rows = Vec::new();
                    while cur.remaining() > 0 {
                        let array_id = cur.u8()?;
                        let row_number = cur.u16_le()?;
                        let len = cur.u16_le()? as usize;
                        let data = cur.take(len)?.to_vec();
                        let checksum = crc::firmware_row_checksum(&data);
                        rows.push(FirmwareRow {
                            array_id,
                            row_number,
                            data,
                            checksum,
                        });
                    }
                    Ok(AvlResponse::BootData { rows })
                }
                _ => Ok(AvlResponse::BootExit {
                    row_count: cur.u16_le()?,
                    image_checksum: cur.u16_le()?,
                }),
            }
        }
        other => Err(DecodeError::UnknownTag { tag: other }),
    }
}

/// Encode a device → server packet; used by tests and simulators.
#[must_use]
pub fn encode_packet(packet: &AvlPacket) -> Vec<u8> {
    let mut out = Vec::new();
    match packet {
        AvlPacket::Login { imei, mac } => {
            out.push(tag::LOGIN);
            out.extend_from_slice(&imei.to_le_bytes());
            let mut wire_mac = *mac;
            wire_mac.reverse();
            out.extend_from_slice(&wire_mac);
        }
        AvlPacket::Ping {
            session_id,
            position,
        } => {
            out.push(tag::PING);
            out.extend_from_slice(&session_id.to_le_bytes());
            position.write(&mut out);
        }
        AvlPacket::DevInfo { session_id, info } => {
            out.push(tag::DEVINFO);
            out.extend_from_slice(&session_id.to_le_bytes());
            out.extend_from_slice(info.as_bytes());
        }
        AvlPacket::Data {
            session_id,
            records,
        } => {
            out.push(tag::DATA);
            out.extend_from_slice(&session_id.to_le_bytes());
            for record in records {
                let mut body = Vec::new();
                let rtype = match &record.body {
                    RecordBody::Tracks(tracks) => {
                        for track in tracks {
                            track.write(&mut body);
                        }
                        record_type::TRACKS
                    }
                    RecordBody::People(counts) => {
                        for count in counts {
                            count.write(&mut body);
                        }
                        record_type::PEOPLE
                    }
                    RecordBody::Lis(lis) => {
                        lis.write(&mut body);
                        record_type::LIS
                    }
                    RecordBody::Skipped { rtype, .. } => *rtype,
                };
                out.extend_from_slice(&record.id.to_le_bytes());
                out.extend_from_slice(&(body.len() as u32 + 1).to_le_bytes());
                out.push(rtype);
                out.extend_from_slice(&body);
            }
            append_crc(&mut out);
        }
        AvlPacket::BootEnter { session_id } => {
            out.push(tag::BTL_ENTER);
            out.extend_from_slice(&session_id.to_le_bytes());
        }
        AvlPacket::BootData {
            session_id,
            next_row,
        } => {
            out.push(tag::BTL_DATA);
            out.extend_from_slice(&session_id.to_le_bytes());
            out.extend_from_slice(&next_row.to_le_bytes());
        }
        AvlPacket::BootExit { session_id, result } => {
            out.push(tag::BTL_EXIT);
            out.extend_from_slice(&session_id.to_le_bytes());
            out.extend_from_slice(&result.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn track(ct: u32, lat_e7: i32, lon_e7: i32, speed: u8, inputs: u8) -> PositionRecord {
        PositionRecord {
            ct,
            lat_e7,
            lon_e7,
            speed,
            inputs,
        }
    }

    #[test]
    fn login_decodes_imei_and_mac() {
        let mut buf = vec![tag::LOGIN];
        buf.extend_from_slice(&352_749_380_148_144u64.to_le_bytes());
        buf.extend_from_slice(&[0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);

        let packet = decode(&buf).unwrap();
        assert_eq!(
            packet,
            AvlPacket::Login {
                imei: 352_749_380_148_144,
                mac: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            }
        );
    }

    #[test]
    fn ping_carries_a_position() {
        let record = track(1_735_732_245, 194_326_000, -991_332_000, 45, 0x01);
        let buf = encode_packet(&AvlPacket::Ping {
            session_id: 0xCAFE_F00D,
            position: record,
        });

        match decode(&buf).unwrap() {
            AvlPacket::Ping {
                session_id,
                position,
            } => {
                assert_eq!(session_id, 0xCAFE_F00D);
                assert_eq!(position, record);
                assert!((position.latitude() - 19.4326).abs() < 1e-6);
                assert!((position.longitude() + 99.1332).abs() < 1e-6);
                assert!(!position.is_delta());
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn delta_fix_reuses_speed_as_mask() {
        let record = track(1_735_732_245, 0, 0, input_bits::PANIC, input_bits::DELTA | input_bits::PANIC);
        assert!(record.is_delta());
        assert_eq!(record.delta_mask(), Some(input_bits::PANIC));
        assert_eq!(record.input_bits(), input_bits::PANIC);
    }

    #[test]
    fn data_round_trip_with_all_record_types() {
        let packet = AvlPacket::Data {
            session_id: 42,
            records: vec![
                DataRecord {
                    id: 100,
                    body: RecordBody::Tracks(vec![
                        track(1_700_000_000, 1, 2, 3, 0),
                        track(1_700_000_060, 4, 5, 6, 0x11),
                    ]),
                },
                DataRecord {
                    id: 101,
                    body: RecordBody::People(vec![PeopleRecord {
                        ct: 1_700_000_000,
                        entered: 3,
                        exited: 1,
                        mac: [1, 2, 3, 4, 5, 6],
                    }]),
                },
                DataRecord {
                    id: 102,
                    body: RecordBody::Lis(LisRecord {
                        position: track(1_700_000_000, 7, 8, 9, 0),
                        ct_start: 1_700_000_000,
                        duration_ticks: 50,
                        err_duration_ticks: 5,
                        magnitudes: [16000, 100, 32000, 200, 8000],
                    }),
                },
            ],
        };

        let buf = encode_packet(&packet);
        assert_eq!(decode(&buf).unwrap(), packet);
    }

    #[test]
    fn data_with_bad_crc_is_rejected_whole() {
        let packet = AvlPacket::Data {
            session_id: 42,
            records: vec![DataRecord {
                id: 1,
                body: RecordBody::Tracks(vec![track(1_700_000_000, 1, 2, 3, 0)]),
            }],
        };
        let mut buf = encode_packet(&packet);
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        assert!(matches!(
            decode(&buf),
            Err(DecodeError::BadChecksum { .. })
        ));
    }

    #[test]
    fn oversize_record_is_skipped_but_rest_of_packet_survives() {
        // Hand-build a DATA packet: record 5 declares size 300 (> 248),
        // record 6 is a valid single track.
        let mut body = vec![tag::DATA];
        body.extend_from_slice(&7u32.to_le_bytes()); // session

        body.extend_from_slice(&5u32.to_le_bytes()); // id
        body.extend_from_slice(&300u32.to_le_bytes()); // size
        body.push(record_type::TRACKS);
        body.extend_from_slice(&vec![0u8; 299]); // declared body

        body.extend_from_slice(&6u32.to_le_bytes());
        body.extend_from_slice(&15u32.to_le_bytes()); // 1 + 14
        body.push(record_type::TRACKS);
        let mut track_bytes = Vec::new();
        track(1_700_000_000, 10, 20, 0, 0).write(&mut track_bytes);
        body.extend_from_slice(&track_bytes);

        let crc = crc::crc16_aug_ccitt(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        match decode(&body).unwrap() {
            AvlPacket::Data { records, .. } => {
                assert_eq!(records.len(), 2);
                assert!(matches!(records[0].body, RecordBody::Skipped { .. }));
                assert!(matches!(records[1].body, RecordBody::Tracks(ref t) if t.len() == 1));
                assert_eq!(records[0].id, 5);
                assert_eq!(records[1].id, 6);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn unknown_record_type_is_skipped_not_fatal() {
        let mut body = vec![tag::DATA];
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&9u32.to_le_bytes()); // id
        body.extend_from_slice(&3u32.to_le_bytes()); // size
        body.push(0x77); // unknown type
        body.extend_from_slice(&[0xAB, 0xCD]);
        let crc = crc::crc16_aug_ccitt(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        match decode(&body).unwrap() {
            AvlPacket::Data { records, .. } => {
                assert!(matches!(
                    records[0].body,
                    RecordBody::Skipped { rtype: 0x77, .. }
                ));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn session_response_layout_matches_wire_contract() {
        let buf = encode_response(&AvlResponse::Session {
            session_id: 0x0403_0201,
            subcmd: subcmd::SEND_INFO,
        });
        assert_eq!(buf, vec![0x10, 0x01, 0x02, 0x03, 0x04, 0x20]);
    }

    #[test]
    fn login_request_is_a_bare_byte() {
        assert_eq!(encode_response(&AvlResponse::LoginRequest), vec![0x11]);
    }

    #[test]
    fn response_round_trip() {
        let responses = [
            AvlResponse::Session {
                session_id: 7,
                subcmd: subcmd::SEND_DATA,
            },
            AvlResponse::LoginRequest,
            AvlResponse::Ack {
                count: 3,
                first: 100,
                last: 102,
            },
            AvlResponse::Command { code: 0x30 },
            AvlResponse::BootEnter {
                array_id: 1,
                first_row: 0x20,
            },
            AvlResponse::BootData {
                rows: vec![FirmwareRow {
                    array_id: 1,
                    row_number: 0x20,
                    data: vec![0xDE, 0xAD, 0xBE, 0xEF],
                    checksum: crc::firmware_row_checksum(&[0xDE, 0xAD, 0xBE, 0xEF]),
                }],
            },
            AvlResponse::BootExit {
                row_count: 3,
                image_checksum: 0x1234,
            },
        ];
        for response in responses {
            let buf = encode_response(&response);
            assert_eq!(decode_response(&buf).unwrap(), response, "{response:?}");
        }
    }

    #[test]
    fn bootloader_responses_carry_valid_crc_trailer() {
        let mut buf = encode_response(&AvlResponse::BootExit {
            row_count: 3,
            image_checksum: 0xBEEF,
        });
        let crc_offset = buf.len() - 2;
        let carried = u16::from_le_bytes([buf[crc_offset], buf[crc_offset + 1]]);
        assert_eq!(carried, crc::crc16_aug_ccitt(&buf[..crc_offset]));

        buf[0] ^= 0x01;
        buf[0] ^= 0x01; // unchanged; now corrupt a payload byte instead
        buf[1] ^= 0x40;
        assert!(decode_response(&buf).is_err());
    }

    #[test]
    fn empty_and_unknown_tags() {
        assert!(matches!(decode(&[]), Err(DecodeError::Truncated)));
        assert!(matches!(
            decode(&[0x99]),
            Err(DecodeError::UnknownTag { tag: 0x99 })
        ));
    }

    proptest! {
        #[test]
        fn track_packets_round_trip(
            session_id in any::<u32>(),
            id in any::<u32>(),
            ct in any::<u32>(),
            lat in -900_000_000i32..900_000_000,
            lon in -1_800_000_000i32..1_800_000_000,
            speed in any::<u8>(),
            inputs in any::<u8>(),
        ) {
            let packet = AvlPacket::Data {
                session_id,
                records: vec![DataRecord {
                    id,
                    body: RecordBody::Tracks(vec![track(ct, lat, lon, speed, inputs)]),
                }],
            };
            let buf = encode_packet(&packet);
            prop_assert_eq!(decode(&buf).unwrap(), packet);
        }
    }
}
