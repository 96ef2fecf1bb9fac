//! Firmware bootloader engine
//!
//! Holds the parsed firmware image and builds the server side of the
//! row-by-row flashing conversation. Per-device progress lives in the
//! device's firmware-state tag; this type is stateless beyond the image
//! and can serve any number of devices, one bootloader session each.

use fleetgate_codec::avl::{AvlResponse, BOOT_BATCH_BYTES};
use fleetgate_codec::firmware::{self, FirmwareImage};
use fleetgate_core::{Error, FirmwareState, Result};
use std::path::Path;

/// Firmware image holder
pub struct Bootloader {
    image: FirmwareImage,
}

impl Bootloader {
    /// Wrap an already parsed image.
    #[must_use]
    pub const fn new(image: FirmwareImage) -> Self {
        Self { image }
    }

    /// Load and verify an image file. Failure here is fatal at startup:
    /// a server with a broken image must not enrol devices.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let image = firmware::parse_image(&text).map_err(|e| Error::Firmware {
            message: format!("{}: {e}", path.display()),
        })?;
        Ok(Self::new(image))
    }

    /// Rows in the image.
    #[must_use]
    pub fn total_rows(&self) -> u16 {
        self.image.total_rows()
    }

    /// 16-bit sum of every payload byte of the whole image.
    #[must_use]
    pub fn image_checksum(&self) -> u16 {
        self.image.image_checksum()
    }

    /// Frame that tells a device to enter the bootloader.
    #[must_use]
    pub fn enter_response(&self) -> AvlResponse {
        let first = self.image.first_row();
        AvlResponse::BootEnter {
            array_id: first.map_or(0, |row| row.array_id),
            first_row: first.map_or(0, |row| row.row_number),
        }
    }

    /// Next frame for a device that expects row `next_row`: a batch of
    /// rows up to the batch budget, or the exit frame once every row is
    /// acknowledged. The exit checksum always covers the whole image,
    /// not the last batch.
    #[must_use]
    pub fn batch_from(&self, next_row: u16) -> AvlResponse {
        let total = self.total_rows();
        if next_row >= total {
            return AvlResponse::BootExit {
                row_count: total,
                image_checksum: self.image_checksum(),
            };
        }

        let mut rows = Vec::new();
        let mut bytes = 0;
        for row in &self.image.rows[usize::from(next_row)..] {
            if !rows.is_empty() && bytes + row.wire_len() > BOOT_BATCH_BYTES {
                break;
            }
            bytes += row.wire_len();
            rows.push(row.clone());
        }
        AvlResponse::BootData { rows }
    }

    /// Rows the batch built by [`Self::batch_from`] carries for
    /// `next_row`; zero once the image is exhausted.
    #[must_use]
    pub fn batch_len(&self, next_row: u16) -> u16 {
        if next_row >= self.total_rows() {
            return 0;
        }
        let mut count: u16 = 0;
        let mut bytes = 0;
        for row in &self.image.rows[usize::from(next_row)..] {
            if count > 0 && bytes + row.wire_len() > BOOT_BATCH_BYTES {
                break;
            }
            bytes += row.wire_len();
            count += 1;
        }
        count
    }

    /// Whether an ack naming `ack` is a legal successor to the batch
    /// served from `served`: strictly forward, no further than that
    /// batch reached.
    #[must_use]
    pub fn ack_advances(&self, served: u16, ack: u16) -> bool {
        ack > served && ack <= served.saturating_add(self.batch_len(served))
    }

    /// The state a device lands in after the server response built by
    /// [`Self::batch_from`] for `next_row`.
    #[must_use]
    pub fn state_after_ack(&self, next_row: u16) -> FirmwareState {
        FirmwareState::Row(u32::from(next_row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgate_codec::crc::firmware_row_checksum;
    use fleetgate_codec::firmware::FirmwareRow;
    use pretty_assertions::assert_eq;

    fn row(row_number: u16, data: Vec<u8>) -> FirmwareRow {
        let checksum = firmware_row_checksum(&data);
        FirmwareRow {
            array_id: 1,
            row_number,
            data,
            checksum,
        }
    }

    fn three_row_loader() -> Bootloader {
        Bootloader::new(FirmwareImage {
            silicon_id: 0x1234_5678,
            silicon_rev: 1,
            checksum_type: 0,
            rows: vec![
                row(0x20, vec![0xDE, 0xAD]),
                row(0x21, vec![0xBE, 0xEF]),
                row(0x22, vec![0x01]),
            ],
        })
    }

    #[test]
    fn enter_names_the_first_row() {
        let loader = three_row_loader();
        assert_eq!(
            loader.enter_response(),
            AvlResponse::BootEnter {
                array_id: 1,
                first_row: 0x20
            }
        );
    }

    #[test]
    fn small_rows_batch_together() {
        let loader = three_row_loader();
        let AvlResponse::BootData { rows } = loader.batch_from(0) else {
            panic!("data frame expected");
        };
        // all three rows fit well under the batch budget
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].row_number, 0x20);
    }

    #[test]
    fn batch_respects_the_size_budget() {
        let big = vec![0u8; 400];
        let loader = Bootloader::new(FirmwareImage {
            silicon_id: 0,
            silicon_rev: 0,
            checksum_type: 0,
            rows: (0..5).map(|i| row(i, big.clone())).collect(),
        });

        let AvlResponse::BootData { rows } = loader.batch_from(0) else {
            panic!("data frame expected");
        };
        // 405 wire bytes per row; two fit, the third would cross 1 KiB
        assert_eq!(rows.len(), 2);

        let AvlResponse::BootData { rows } = loader.batch_from(2) else {
            panic!("data frame expected");
        };
        assert_eq!(rows[0].row_number, 2);
    }

    #[test]
    fn exit_checksum_covers_the_whole_image() {
        let loader = three_row_loader();
        let expected: u16 = [0xDEu16, 0xAD, 0xBE, 0xEF, 0x01]
            .iter()
            .fold(0, |acc, &b| acc.wrapping_add(b));

        assert_eq!(
            loader.batch_from(3),
            AvlResponse::BootExit {
                row_count: 3,
                image_checksum: expected
            }
        );
    }

    #[test]
    fn ack_must_land_inside_the_served_batch() {
        let loader = three_row_loader();
        assert_eq!(loader.batch_len(0), 3);
        assert_eq!(loader.batch_len(3), 0);

        assert!(loader.ack_advances(0, 1));
        assert!(loader.ack_advances(0, 3));
        // same row is a retransmit, not progress
        assert!(!loader.ack_advances(0, 0));
        // past the end of the batch
        assert!(!loader.ack_advances(0, 4));
        // backwards
        assert!(!loader.ack_advances(2, 1));
    }

    #[test]
    fn batch_len_follows_the_size_budget() {
        let big = vec![0u8; 400];
        let loader = Bootloader::new(FirmwareImage {
            silicon_id: 0,
            silicon_rev: 0,
            checksum_type: 0,
            rows: (0..5).map(|i| row(i, big.clone())).collect(),
        });
        assert_eq!(loader.batch_len(0), 2);
        assert_eq!(loader.batch_len(4), 1);
    }

    #[test]
    fn oversize_single_row_still_ships() {
        let loader = Bootloader::new(FirmwareImage {
            silicon_id: 0,
            silicon_rev: 0,
            checksum_type: 0,
            rows: vec![row(0, vec![0u8; 2000])],
        });
        let AvlResponse::BootData { rows } = loader.batch_from(0) else {
            panic!("data frame expected");
        };
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn load_rejects_missing_file() {
        assert!(Bootloader::load(Path::new("/nonexistent/image.fw")).is_err());
    }
}
