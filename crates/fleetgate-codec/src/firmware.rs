//! Vendor hex-row firmware image parser
//!
//! The image file is ASCII: one header line, then one line per flash row,
//! each starting with `:` followed by the hex encoding of
//! `array_id:u8 row:u16 len:u16 data[len] checksum:u8` (multibyte fields
//! big-endian, as in the vendor's flashing tool). The image is parsed once
//! at startup; a malformed row is fatal there, never at ingest time.

use crate::DecodeError;
use crate::crc::firmware_row_checksum;

/// One addressable flash row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRow {
    /// Flash array the row belongs to
    pub array_id: u8,
    /// Row number within the array
    pub row_number: u16,
    /// Row payload, 16 to 256 bytes in practice
    pub data: Vec<u8>,
    /// Two's-complement checksum of the payload bytes
    pub checksum: u8,
}

impl FirmwareRow {
    /// Bytes this row occupies inside a `BTL_DATA` frame
    /// (`array_id:u8 row:u16 len:u16 data[len]`)
    #[must_use]
    pub const fn wire_len(&self) -> usize {
        1 + 2 + 2 + self.data.len()
    }
}

/// A parsed firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Target silicon id from the header
    pub silicon_id: u32,
    /// Target silicon revision from the header
    pub silicon_rev: u8,
    /// Checksum algorithm tag from the header
    pub checksum_type: u8,
    /// Rows in file order
    pub rows: Vec<FirmwareRow>,
}

impl FirmwareImage {
    /// Number of rows in the image
    #[must_use]
    pub fn total_rows(&self) -> u16 {
        self.rows.len() as u16
    }

    /// 16-bit sum of every payload byte of the whole image.
    ///
    /// Sent in `BTL_EXIT` so the device can verify the flash it wrote;
    /// it always covers the full image, not just the rows of the last
    /// batch.
    #[must_use]
    pub fn image_checksum(&self) -> u16 {
        self.rows
            .iter()
            .flat_map(|row| row.data.iter())
            .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
    }

    /// First row of the image; the bootloader names it in `BTL_ENTER`
    #[must_use]
    pub fn first_row(&self) -> Option<&FirmwareRow> {
        self.rows.first()
    }
}

/// Parse a firmware image from its ASCII file contents.
pub fn parse_image(text: &str) -> Result<FirmwareImage, DecodeError> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    let header = lines.next().ok_or(DecodeError::Truncated)?;
    let header_bytes = decode_hex(header.trim_start_matches(':'))?;
    if header_bytes.len() != 6 {
        return Err(DecodeError::Field(format!(
            "header is {} bytes, expected 6",
            header_bytes.len()
        )));
    }
    let silicon_id = u32::from_be_bytes([
        header_bytes[0],
        header_bytes[1],
        header_bytes[2],
        header_bytes[3],
    ]);
    let silicon_rev = header_bytes[4];
    let checksum_type = header_bytes[5];

    let mut rows = Vec::new();
    for (index, line) in lines.enumerate() {
        let Some(hex) = line.strip_prefix(':') else {
            return Err(DecodeError::Field(format!(
                "row {index} does not start with ':'"
            )));
        };
        rows.push(parse_row(index, &decode_hex(hex)?)?);
    }
    if rows.is_empty() {
        return Err(DecodeError::Field("image has no rows".to_string()));
    }

    Ok(FirmwareImage {
        silicon_id,
        silicon_rev,
        checksum_type,
        rows,
    })
}

fn parse_row(index: usize, bytes: &[u8]) -> Result<FirmwareRow, DecodeError> {
    if bytes.len() < 6 {
        return Err(DecodeError::Field(format!("row {index} is too short")));
    }
    let array_id = bytes[0];
    let row_number = u16::from_be_bytes([bytes[1], bytes[2]]);
    let len = usize::from(u16::from_be_bytes([bytes[3], bytes[4]]));
    if bytes.len() != 5 + len + 1 {
        return Err(DecodeError::Field(format!(
            "row {index} declares {len} data bytes but carries {}",
            bytes.len() - 6
        )));
    }
    let data = bytes[5..5 + len].to_vec();
    let checksum = bytes[5 + len];
    let expected = firmware_row_checksum(&data);
    if checksum != expected {
        return Err(DecodeError::BadChecksum {
            expected: u16::from(expected),
            actual: u16::from(checksum),
        });
    }
    Ok(FirmwareRow {
        array_id,
        row_number,
        data,
        checksum,
    })
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, DecodeError> {
    if hex.len() % 2 != 0 {
        return Err(DecodeError::Field("odd-length hex line".to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| DecodeError::Field(format!("non-hex byte at offset {i}")))
        })
        .collect()
}
