//! Wialon-text TCP engine
//!
//! Per-connection state machine over the ASCII line protocol. Login is
//! mandatory before data; the password field is only checked when a
//! shared token is configured. Every accepted line is answered with the
//! matching ack.

use super::EngineCore;
use crate::EngineOutcome;
use fleetgate_codec::wialon::{
    self, WialonData, WialonMessage,
};
use fleetgate_core::utils::clamp_stale_timestamp;
use fleetgate_core::{Event, Imei, PositionFix, Protocol, Result, StatusDelta};
use chrono::Utc;
use tracing::{debug, info, warn};

/// State of one Wialon TCP connection
pub struct WialonConnection {
    core: EngineCore,
    endpoint: String,
    imei: Option<Imei>,
    session_id: Option<u32>,
}

impl WialonConnection {
    /// Fresh unauthenticated connection.
    #[must_use]
    pub fn new(core: EngineCore, endpoint: String) -> Self {
        Self {
            core,
            endpoint,
            imei: None,
            session_id: None,
        }
    }

    /// IMEI of the logged-in device, if any.
    #[must_use]
    pub const fn imei(&self) -> Option<Imei> {
        self.imei
    }

    /// Handle one parsed line.
    pub async fn handle_message(&mut self, message: WialonMessage) -> EngineOutcome {
        metrics::counter!("fleetgate_frames_total", "protocol" => "wialon").increment(1);

        if let WialonMessage::Login { imei, password } = message {
            return match self.handle_login(imei, &password).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "login failed");
                    EngineOutcome::Close
                }
            };
        }

        let Some(imei) = self.imei else {
            debug!(endpoint = %self.endpoint, "data before login");
            return EngineOutcome::Close;
        };
        if let Some(session_id) = self.session_id {
            if let Err(e) = self.core.sessions.refresh(session_id, &self.endpoint).await {
                warn!(imei = %imei, error = %e, "session refresh failed");
            }
        }

        match message {
            WialonMessage::Data(data) => match self.handle_data(imei, &data).await {
                Ok(()) => EngineOutcome::Respond(wialon::encode_data_ack()),
                Err(e) => {
                    warn!(imei = %imei, error = %e, "dropped data line after internal error");
                    EngineOutcome::Silent
                }
            },
            WialonMessage::Ping => {
                if let Err(e) = self
                    .core
                    .registry
                    .update_status(imei, &StatusDelta::contact(Utc::now()))
                    .await
                {
                    warn!(imei = %imei, error = %e, "contact update failed");
                }
                EngineOutcome::Respond(wialon::encode_ping_ack())
            }
            WialonMessage::Login { .. } => unreachable!(),
        }
    }

    async fn handle_login(&mut self, raw_imei: u64, password: &str) -> Result<EngineOutcome> {
        if let Some(token) = self.core.registry.shared_token() {
            if password != token {
                info!(endpoint = %self.endpoint, imei = raw_imei, "wrong password");
                return Ok(EngineOutcome::Respond(wialon::encode_login_ack(false)));
            }
        }

        let Some(device) = self.core.registry.resolve_or_create(raw_imei).await? else {
            return Ok(EngineOutcome::Respond(wialon::encode_login_ack(false)));
        };
        let imei = device.imei;
        let session_id = self
            .core
            .sessions
            .open(imei, Protocol::Wialon, &self.endpoint)
            .await?;
        self.core
            .registry
            .update_status(imei, &StatusDelta::contact(Utc::now()))
            .await?;
        self.imei = Some(imei);
        self.session_id = Some(session_id);
        info!(imei = %imei, endpoint = %self.endpoint, "wialon login");
        Ok(EngineOutcome::Respond(wialon::encode_login_ack(true)))
    }

    async fn handle_data(&self, imei: Imei, data: &WialonData) -> Result<()> {
        let now = Utc::now();
        let (ts, stale_clock) = clamp_stale_timestamp(data.timestamp, now);
        let fix = PositionFix {
            timestamp: ts,
            latitude: data.latitude,
            longitude: data.longitude,
            speed: data.speed,
            course: data.course,
            altitude: data.altitude,
            satellites: data.satellites,
            inputs: data.inputs as u8,
            source: Protocol::Wialon,
            stale_clock,
        };

        let inserted = self.core.gateway.insert_position(imei, &fix).await?;
        if inserted {
            metrics::counter!("fleetgate_positions_total", "protocol" => "wialon").increment(1);
            self.core
                .gateway
                .insert_event(imei, ts, Some((fix.latitude, fix.longitude)), &Event::Track)
                .await?;
        }

        let delta = StatusDelta {
            position: Some((fix.latitude, fix.longitude)),
            speed: Some(fix.speed),
            course: Some(fix.course),
            altitude: Some(fix.altitude),
            inputs: Some(data.inputs as i32),
            outputs: Some(data.outputs as i32),
            last_fix: Some(ts),
            last_contact: Some(now),
            ..StatusDelta::default()
        };
        self.core.registry.update_status(imei, &delta).await
    }

    /// Called by the listener when the socket goes away.
    pub async fn on_disconnect(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            if let Err(e) = self.core.sessions.close(session_id).await {
                warn!(session_id, error = %e, "session close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryGateway;
    use crate::notify::NoopNotifier;
    use crate::registry::Registry;
    use crate::session::SessionStore;
    use fleetgate_codec::FrameOutcome;
    use fleetgate_codec::wialon::read_line;
    use fleetgate_core::config::{ProvisioningConfig, SessionConfig};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const IMEI: u64 = 352_749_380_148_144;

    fn connection(shared_token: Option<&str>) -> (Arc<MemoryGateway>, WialonConnection) {
        let gateway = Arc::new(MemoryGateway::new());
        let dyn_gateway: Arc<dyn fleetgate_database::Gateway> = gateway.clone();
        let registry = Arc::new(Registry::new(
            dyn_gateway.clone(),
            ProvisioningConfig {
                auto_provision: true,
                default_harness: "default".to_string(),
                shared_token: shared_token.map(String::from),
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
        (
            gateway,
            WialonConnection::new(core, "10.0.0.7:20332".to_string()),
        )
    }

    fn line(text: &[u8]) -> WialonMessage {
        let FrameOutcome::Frame { frame, .. } = read_line(text) else {
            panic!("line expected");
        };
        frame
    }

    /// Data line dated today so the fix survives the staleness clamp.
    fn data_line() -> Vec<u8> {
        format!(
            "#D#{};123045;19;25.956;-99;7.992;45;180;2240;8;1.0;0;0;0;;NA\r\n",
            Utc::now().format("%d%m%y")
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn login_without_token_accepts_any_password() {
        let (gateway, mut conn) = connection(None);
        let outcome = conn
            .handle_message(line(b"#L#352749380148144;whatever\r\n"))
            .await;
        assert_eq!(outcome, EngineOutcome::Respond(b"#AL#1\r\n".to_vec()));
        assert_eq!(gateway.device_count(), 1);
        assert_eq!(gateway.session_count(), 1);
    }

    #[tokio::test]
    async fn login_with_token_checks_the_password() {
        let (gateway, mut conn) = connection(Some("secret"));
        let outcome = conn
            .handle_message(line(b"#L#352749380148144;wrong\r\n"))
            .await;
        assert_eq!(outcome, EngineOutcome::Respond(b"#AL#0\r\n".to_vec()));
        assert_eq!(gateway.device_count(), 0);
        assert!(conn.imei().is_none());

        let outcome = conn
            .handle_message(line(b"#L#352749380148144;secret\r\n"))
            .await;
        assert_eq!(outcome, EngineOutcome::Respond(b"#AL#1\r\n".to_vec()));
        assert_eq!(conn.imei().unwrap().as_u64(), IMEI);
    }

    #[tokio::test]
    async fn invalid_imei_login_is_refused() {
        let (gateway, mut conn) = connection(None);
        let outcome = conn.handle_message(line(b"#L#12345;x\r\n")).await;
        assert_eq!(outcome, EngineOutcome::Respond(b"#AL#0\r\n".to_vec()));
        assert_eq!(gateway.device_count(), 0);
    }

    #[tokio::test]
    async fn data_before_login_closes() {
        let (_, mut conn) = connection(None);
        let outcome = conn.handle_message(line(&data_line())).await;
        assert_eq!(outcome, EngineOutcome::Close);
    }

    #[tokio::test]
    async fn data_is_stored_and_acked() {
        let (gateway, mut conn) = connection(None);
        conn.handle_message(line(b"#L#352749380148144;x\r\n")).await;

        let outcome = conn.handle_message(line(&data_line())).await;
        assert_eq!(outcome, EngineOutcome::Respond(b"#AD#1\r\n".to_vec()));

        let fixes = gateway.positions_of(IMEI);
        assert_eq!(fixes.len(), 1);
        assert!((fixes[0].latitude - 19.4326).abs() < 1e-4);
        assert!((fixes[0].longitude + 99.1332).abs() < 1e-4);
        assert!(!fixes[0].stale_clock);
        assert_eq!(fixes[0].timestamp.format("%H%M%S").to_string(), "123045");
        assert_eq!(gateway.events_of_kind("TRACK").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_data_lines_store_once_but_still_ack() {
        let (gateway, mut conn) = connection(None);
        conn.handle_message(line(b"#L#352749380148144;x\r\n")).await;

        let data = data_line();
        conn.handle_message(line(&data)).await;
        let outcome = conn.handle_message(line(&data)).await;

        assert_eq!(outcome, EngineOutcome::Respond(b"#AD#1\r\n".to_vec()));
        assert_eq!(gateway.position_count(), 1);
        assert_eq!(gateway.events_of_kind("TRACK").len(), 1);
    }

    #[tokio::test]
    async fn ping_is_acked_and_bumps_contact() {
        let (gateway, mut conn) = connection(None);
        conn.handle_message(line(b"#L#352749380148144;x\r\n")).await;

        let outcome = conn.handle_message(line(b"#P#\r\n")).await;
        assert_eq!(outcome, EngineOutcome::Respond(b"#AP#\r\n".to_vec()));
        assert!(
            gateway
                .deltas_of(IMEI)
                .iter()
                .any(|d| d.last_contact.is_some())
        );
    }

    #[tokio::test]
    async fn disconnect_closes_the_session() {
        let (gateway, mut conn) = connection(None);
        conn.handle_message(line(b"#L#352749380148144;x\r\n")).await;
        assert_eq!(gateway.session_count(), 1);

        conn.on_disconnect().await;
        assert_eq!(gateway.session_count(), 0);
    }
}
