//! Meiligao UDP engine
//!
//! Stateless: every datagram carries the device id, so there is no
//! session. The protocol expects no response; anything wrong with a
//! datagram is logged and the datagram dropped.

use super::EngineCore;
use crate::EngineOutcome;
use fleetgate_codec::meiligao::{self, command};
use fleetgate_core::utils::clamp_stale_timestamp;
use fleetgate_core::{Event, PositionFix, Protocol, Result, StatusDelta};
use chrono::Utc;
use tracing::{debug, warn};

/// Meiligao protocol engine
pub struct MeiligaoEngine {
    core: EngineCore,
}

impl MeiligaoEngine {
    /// Create the engine.
    #[must_use]
    pub const fn new(core: EngineCore) -> Self {
        Self { core }
    }

    /// Handle one datagram.
    pub async fn handle_datagram(&self, buf: &[u8], endpoint: &str) -> EngineOutcome {
        metrics::counter!("fleetgate_frames_total", "protocol" => "meiligao").increment(1);
        let frame = match meiligao::decode(buf) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(endpoint, error = %e, "undecodable datagram");
                metrics::counter!("fleetgate_frames_invalid_total", "protocol" => "meiligao")
                    .increment(1);
                return EngineOutcome::Silent;
            }
        };

        if frame.command != command::TRACK {
            debug!(
                endpoint,
                device_id = frame.device_id,
                command = format_args!("{:#06x}", frame.command),
                "unhandled command"
            );
            return EngineOutcome::Silent;
        }

        if let Err(e) = self.handle_track(&frame).await {
            warn!(endpoint, device_id = frame.device_id, error = %e, "dropped datagram after internal error");
        }
        EngineOutcome::Silent
    }

    async fn handle_track(&self, frame: &meiligao::MeiligaoFrame) -> Result<()> {
        let report = match meiligao::parse_track(&frame.payload) {
            Ok(report) => report,
            Err(e) => {
                // Void GPRMC fixes land here too.
                debug!(device_id = frame.device_id, error = %e, "track payload dropped");
                return Ok(());
            }
        };

        let Some(device) = self.core.registry.resolve_or_create(frame.device_id).await? else {
            return Ok(());
        };
        let imei = device.imei;

        let now = Utc::now();
        let (ts, stale_clock) = clamp_stale_timestamp(report.timestamp, now);
        let fix = PositionFix {
            timestamp: ts,
            latitude: report.latitude,
            longitude: report.longitude,
            speed: report.speed_kmh,
            course: report.course,
            altitude: 0.0,
            satellites: 0,
            inputs: 0,
            source: Protocol::Meiligao,
            stale_clock,
        };

        let inserted = self.core.gateway.insert_position(imei, &fix).await?;
        if inserted {
            metrics::counter!("fleetgate_positions_total", "protocol" => "meiligao").increment(1);
            self.core
                .gateway
                .insert_event(imei, ts, Some((fix.latitude, fix.longitude)), &Event::Track)
                .await?;
        }

        let delta = StatusDelta {
            position: Some((fix.latitude, fix.longitude)),
            speed: Some(fix.speed),
            course: Some(fix.course),
            last_fix: Some(ts),
            last_contact: Some(now),
            ..StatusDelta::default()
        };
        self.core.registry.update_status(imei, &delta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryGateway;
    use crate::notify::NoopNotifier;
    use crate::registry::Registry;
    use crate::session::SessionStore;
    use fleetgate_codec::crc;
    use fleetgate_core::config::{ProvisioningConfig, SessionConfig};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    // 14-digit Luhn-valid device id packed into 7 BCD bytes
    const ID_BCD: [u8; 7] = [0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08];
    const ID: u64 = 10_000_000_000_008;

    fn engine() -> (Arc<MemoryGateway>, MeiligaoEngine) {
        let gateway = Arc::new(MemoryGateway::new());
        let dyn_gateway: Arc<dyn fleetgate_database::Gateway> = gateway.clone();
        let registry = Arc::new(Registry::new(
            dyn_gateway.clone(),
            ProvisioningConfig {
                auto_provision: true,
                default_harness: "default".to_string(),
                shared_token: None,
            },
        ));
        let sessions = Arc::new(SessionStore::new(
            dyn_gateway.clone(),
            SessionConfig {
                avl_ttl_secs: 36_000,
                stream_ttl_secs: 3_600,
                sweep_interval_secs: 60,
            },
        ));
        let core = EngineCore::new(registry, sessions, dyn_gateway, Arc::new(NoopNotifier));
        (gateway, MeiligaoEngine::new(core))
    }

    fn datagram(cmd: u16, payload: &[u8]) -> Vec<u8> {
        let total = 17 + payload.len();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(b"$$");
        buf.extend_from_slice(&(total as u16).to_be_bytes());
        buf.extend_from_slice(&ID_BCD);
        buf.extend_from_slice(&cmd.to_be_bytes());
        buf.extend_from_slice(payload);
        let crc = crc::crc16_ccitt_false(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// GPRMC payload dated today so the fix survives the staleness clamp.
    fn track_payload() -> Vec<u8> {
        format!(
            "123045.000,A,1925.9560,N,09907.9920,W,24.3,180.0,{},,|11.5|194|0000|0000,0000",
            Utc::now().format("%d%m%y")
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn track_provisions_and_stores_the_fix() {
        let (gateway, engine) = engine();
        let outcome = engine
            .handle_datagram(&datagram(command::TRACK, &track_payload()), "10.0.0.3:62000")
            .await;

        assert_eq!(outcome, EngineOutcome::Silent);
        assert_eq!(gateway.device_count(), 1);
        let fixes = gateway.positions_of(ID);
        assert_eq!(fixes.len(), 1);
        assert!((fixes[0].latitude - 19.4326).abs() < 1e-4);
        assert!((fixes[0].longitude + 99.1332).abs() < 1e-4);
        assert!((fixes[0].speed - 24.3 * 1.852).abs() < 1e-9);
        assert_eq!(gateway.events_of_kind("TRACK").len(), 1);
    }

    #[tokio::test]
    async fn void_fix_is_dropped_without_a_device_write() {
        let (gateway, engine) = engine();
        let payload = b"123045.000,V,1925.9560,N,09907.9920,W,0.0,,010125,,";
        engine
            .handle_datagram(&datagram(command::TRACK, payload), "e")
            .await;
        assert_eq!(gateway.position_count(), 0);
        // the payload never parsed, so the device was never resolved
        assert_eq!(gateway.device_count(), 0);
    }

    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let (gateway, engine) = engine();
        engine.handle_datagram(&datagram(0x5000, b"x"), "e").await;
        assert_eq!(gateway.device_count(), 0);
    }

    #[tokio::test]
    async fn corrupt_datagram_is_ignored() {
        let (gateway, engine) = engine();
        let mut buf = datagram(command::TRACK, &track_payload());
        buf[20] ^= 0xFF;
        engine.handle_datagram(&buf, "e").await;
        assert_eq!(gateway.position_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_tracks_store_once() {
        let (gateway, engine) = engine();
        let buf = datagram(command::TRACK, &track_payload());
        engine.handle_datagram(&buf, "e").await;
        engine.handle_datagram(&buf, "e").await;
        assert_eq!(gateway.position_count(), 1);
        assert_eq!(gateway.events_of_kind("TRACK").len(), 1);
    }
}
