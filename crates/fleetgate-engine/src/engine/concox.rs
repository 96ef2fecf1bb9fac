//! Concox/GT06 TCP engine
//!
//! Per-connection state machine. The first frame must be a login; the
//! connection is dropped otherwise. After login every frame refreshes
//! the session, and pending device commands are piggybacked onto
//! whatever response the frame earns.

use super::EngineCore;
use crate::EngineOutcome;
use fleetgate_codec::concox::{
    self, ConcoxFrame, ConcoxMessage, GpsRecord, InfoRecord, proto,
};
use fleetgate_core::{Event, Imei, PositionFix, Protocol, Result, StatusDelta};
use fleetgate_core::utils::clamp_stale_timestamp;
use chrono::Utc;
use tracing::{debug, info, warn};

/// State of one Concox TCP connection
pub struct ConcoxConnection {
    core: EngineCore,
    endpoint: String,
    imei: Option<Imei>,
    session_id: Option<u32>,
}

impl ConcoxConnection {
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

    /// Session id of the logged-in device, if any.
    #[must_use]
    pub const fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    /// Handle one verified frame.
    pub async fn handle_frame(&mut self, frame: &ConcoxFrame) -> EngineOutcome {
        metrics::counter!("fleetgate_frames_total", "protocol" => "concox").increment(1);
        let message = match concox::decode_message(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(endpoint = %self.endpoint, proto = frame.proto, error = %e, "undecodable frame");
                metrics::counter!("fleetgate_frames_invalid_total", "protocol" => "concox")
                    .increment(1);
                return EngineOutcome::Silent;
            }
        };

        if let ConcoxMessage::Login { imei, .. } = message {
            return match self.handle_login(imei, frame.serial).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "login failed");
                    EngineOutcome::Close
                }
            };
        }

        let Some(imei) = self.imei else {
            debug!(endpoint = %self.endpoint, proto = frame.proto, "frame before login");
            return EngineOutcome::Close;
        };
        if let Some(session_id) = self.session_id {
            if let Err(e) = self.core.sessions.refresh(session_id, &self.endpoint).await {
                warn!(imei = %imei, error = %e, "session refresh failed");
            }
        }

        let outcome = match self.dispatch(imei, frame, message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(imei = %imei, proto = frame.proto, error = %e, "dropped frame after internal error");
                EngineOutcome::Silent
            }
        };
        self.piggyback_command(imei, frame.serial, outcome)
    }

    async fn handle_login(&mut self, raw_imei: u64, serial: u16) -> Result<EngineOutcome> {
        let Some(device) = self.core.registry.resolve_or_create(raw_imei).await? else {
            return Ok(EngineOutcome::Close);
        };
        let imei = device.imei;
        let session_id = self
            .core
            .sessions
            .open(imei, Protocol::Concox, &self.endpoint)
            .await?;
        self.core
            .registry
            .update_status(imei, &StatusDelta::contact(Utc::now()))
            .await?;
        self.imei = Some(imei);
        self.session_id = Some(session_id);
        info!(imei = %imei, endpoint = %self.endpoint, "concox login");
        Ok(EngineOutcome::Respond(concox::encode_ack(
            proto::LOGIN,
            serial,
        )))
    }

    async fn dispatch(
        &self,
        imei: Imei,
        frame: &ConcoxFrame,
        message: ConcoxMessage,
    ) -> Result<EngineOutcome> {
        match message {
            ConcoxMessage::Gps(gps) => self.handle_gps(imei, &gps).await,
            ConcoxMessage::Heartbeat {
                voltage_centivolts,
                gsm_signal,
                ..
            } => {
                let event = Event::Heartbeat {
                    battery_centivolts: voltage_centivolts,
                    gsm_signal,
                };
                self.core
                    .gateway
                    .insert_event(imei, Utc::now(), None, &event)
                    .await?;
                self.core
                    .registry
                    .update_status(imei, &StatusDelta::contact(Utc::now()))
                    .await?;
                Ok(EngineOutcome::Respond(concox::encode_ack(
                    proto::HEARTBEAT,
                    frame.serial,
                )))
            }
            ConcoxMessage::Alarm { code, .. } => {
                self.handle_alarm(imei, code, frame).await
            }
            ConcoxMessage::TimeCalibration => Ok(EngineOutcome::Respond(
                concox::encode_time_response(frame.serial, Utc::now()),
            )),
            ConcoxMessage::Wifi { payload } => {
                debug!(imei = %imei, len = payload.len(), "wifi scan ignored");
                Ok(EngineOutcome::Respond(concox::encode_ack(
                    frame.proto,
                    frame.serial,
                )))
            }
            ConcoxMessage::Info(record) => self.handle_info(imei, record).await,
            ConcoxMessage::Login { .. } => unreachable!(),
        }
    }

    async fn handle_gps(&self, imei: Imei, gps: &GpsRecord) -> Result<EngineOutcome> {
        if !gps.fixed {
            debug!(imei = %imei, "unfixed gps record dropped");
            self.core
                .registry
                .update_status(imei, &StatusDelta::contact(Utc::now()))
                .await?;
            return Ok(EngineOutcome::Silent);
        }

        let now = Utc::now();
        let (ts, stale_clock) = clamp_stale_timestamp(gps.timestamp, now);
        let fix = PositionFix {
            timestamp: ts,
            latitude: gps.latitude,
            longitude: gps.longitude,
            speed: f64::from(gps.speed),
            course: f64::from(gps.course),
            altitude: 0.0,
            satellites: i16::from(gps.satellites),
            inputs: u8::from(gps.acc_on == Some(true)),
            source: Protocol::Concox,
            stale_clock,
        };

        let inserted = self.core.gateway.insert_position(imei, &fix).await?;
        if inserted {
            metrics::counter!("fleetgate_positions_total", "protocol" => "concox").increment(1);
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
        self.core.registry.update_status(imei, &delta).await?;

        // 0x22 location frames are not acknowledged
        Ok(EngineOutcome::Silent)
    }

    async fn handle_alarm(
        &self,
        imei: Imei,
        code: u8,
        frame: &ConcoxFrame,
    ) -> Result<EngineOutcome> {
        let name = concox::alarm_name(code);
        info!(imei = %imei, code, name, "device alarm");
        metrics::counter!("fleetgate_alarms_total", "name" => name).increment(1);

        let event = Event::Alarm {
            code,
            name: name.to_string(),
        };
        self.core
            .gateway
            .insert_event(imei, Utc::now(), None, &event)
            .await?;
        self.core
            .registry
            .update_status(imei, &StatusDelta::contact(Utc::now()))
            .await?;

        if name == "panic" {
            self.notify_panic(imei).await;
        }

        // The 4G variant expects its ack under a different protocol number.
        let ack_proto = if frame.proto == proto::ALARM_4G {
            proto::ALARM_4G_ACK
        } else {
            frame.proto
        };
        Ok(EngineOutcome::Respond(concox::encode_ack(
            ack_proto,
            frame.serial,
        )))
    }

    async fn handle_info(&self, imei: Imei, record: InfoRecord) -> Result<EngineOutcome> {
        match record {
            InfoRecord::SelfDescription(text) => {
                let delta = StatusDelta {
                    comments: Some(text),
                    ..StatusDelta::contact(Utc::now())
                };
                self.core.registry.update_status(imei, &delta).await?;
            }
            InfoRecord::ExternalVoltage(centivolts) => {
                debug!(imei = %imei, centivolts, "external supply voltage");
            }
            InfoRecord::Identity(identity) => {
                if identity.imei != imei.as_u64() {
                    warn!(imei = %imei, reported = identity.imei, "identity mismatch");
                }
                debug!(imei = %imei, iccid = %identity.iccid, "identity report");
            }
            InfoRecord::Unknown { sub } => {
                debug!(imei = %imei, sub, "uninterpreted info sub-record");
            }
        }
        Ok(EngineOutcome::Silent)
    }

    /// Append a queued command frame to whatever the handler produced.
    fn piggyback_command(
        &self,
        imei: Imei,
        serial: u16,
        outcome: EngineOutcome,
    ) -> EngineOutcome {
        if matches!(outcome, EngineOutcome::Close) {
            return outcome;
        }
        let Some(command) = self.core.sessions.take_pending_command(imei) else {
            return outcome;
        };
        let Some(text) = command.concox_text() else {
            warn!(imei = %imei, ?command, "command has no wire encoding here, dropping");
            return outcome;
        };
        info!(imei = %imei, ?command, "delivering pending command");
        outcome.and_frame(concox::encode_command(text, serial))
    }

    async fn notify_panic(&self, imei: Imei) {
        let device = match self.core.gateway.find_device(imei).await {
            Ok(Some(device)) => device,
            _ => return,
        };
        if let Some(address) = &device.notify_address {
            let message = format!("panic alarm from {}", device.name);
            if let Err(e) = self.core.notifier.notify(address, &message).await {
                warn!(imei = %imei, error = %e, "panic notification failed");
            }
        }
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
    use fleetgate_codec::concox::{encode_response, read_frame};
    use fleetgate_core::Command;
    use fleetgate_core::config::{ProvisioningConfig, SessionConfig};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const IMEI_BCD: [u8; 8] = [0xF3, 0x52, 0x74, 0x93, 0x80, 0x14, 0x81, 0x44];
    const IMEI: u64 = 352_749_380_148_144;

    fn connection() -> (Arc<MemoryGateway>, ConcoxConnection) {
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
        (
            gateway,
            ConcoxConnection::new(core, "10.0.0.9:5023".to_string()),
        )
    }

    fn frame_of(proto: u8, payload: &[u8], serial: u16) -> ConcoxFrame {
        let buf = encode_response(proto, payload, serial);
        let FrameOutcome::Frame { frame, .. } = read_frame(&buf) else {
            panic!("frame expected");
        };
        frame
    }

    async fn login(conn: &mut ConcoxConnection) {
        let outcome = conn.handle_frame(&frame_of(proto::LOGIN, &IMEI_BCD, 1)).await;
        assert!(matches!(outcome, EngineOutcome::Respond(_)));
    }

    #[tokio::test]
    async fn login_provisions_and_acks() {
        let (gateway, mut conn) = connection();
        let outcome = conn.handle_frame(&frame_of(proto::LOGIN, &IMEI_BCD, 1)).await;

        assert_eq!(
            outcome,
            EngineOutcome::Respond(concox::encode_ack(proto::LOGIN, 1))
        );
        assert_eq!(gateway.device_count(), 1);
        assert_eq!(conn.imei().unwrap().as_u64(), IMEI);
        assert_eq!(gateway.session_count(), 1);
    }

    #[tokio::test]
    async fn frame_before_login_closes_the_connection() {
        let (_, mut conn) = connection();
        let heartbeat = frame_of(proto::HEARTBEAT, &[0x01, 0x01, 0x26, 0x05, 0x00, 0x00], 2);
        assert_eq!(conn.handle_frame(&heartbeat).await, EngineOutcome::Close);
    }

    #[tokio::test]
    async fn heartbeat_is_echoed_and_bumps_contact() {
        let (gateway, mut conn) = connection();
        login(&mut conn).await;

        let heartbeat = frame_of(proto::HEARTBEAT, &[0x01, 0x01, 0x26, 0x05, 0x00, 0x00], 3);
        let outcome = conn.handle_frame(&heartbeat).await;
        assert_eq!(
            outcome,
            EngineOutcome::Respond(concox::encode_ack(proto::HEARTBEAT, 3))
        );

        let events = gateway.events_of_kind("HEARTBEAT");
        assert_eq!(events.len(), 1);
        let Event::Heartbeat {
            battery_centivolts, ..
        } = events[0].event
        else {
            panic!("heartbeat event expected");
        };
        assert_eq!(battery_centivolts, 294);
        assert_eq!(gateway.position_count(), 0);
        assert!(
            gateway
                .deltas_of(IMEI)
                .iter()
                .any(|d| d.last_contact.is_some())
        );
    }

    fn gps_payload(fixed: bool) -> Vec<u8> {
        let mut payload = vec![25, 1, 1, 12, 30, 45, 0xA9];
        payload.extend_from_slice(&((19.4326f64 * 1_800_000.0) as u32).to_be_bytes());
        payload.extend_from_slice(&((99.1332f64 * 1_800_000.0) as u32).to_be_bytes());
        payload.push(45);
        let status: u16 = if fixed { 0x1000 | 180 } else { 180 };
        payload.extend_from_slice(&status.to_be_bytes());
        payload
    }

    #[tokio::test]
    async fn fixed_gps_is_stored_without_ack() {
        let (gateway, mut conn) = connection();
        login(&mut conn).await;

        let outcome = conn
            .handle_frame(&frame_of(proto::GPS, &gps_payload(true), 4))
            .await;
        assert_eq!(outcome, EngineOutcome::Silent);
        assert_eq!(gateway.position_count(), 1);
        assert_eq!(gateway.events_of_kind("TRACK").len(), 1);
    }

    #[tokio::test]
    async fn unfixed_gps_is_dropped() {
        let (gateway, mut conn) = connection();
        login(&mut conn).await;

        let outcome = conn
            .handle_frame(&frame_of(proto::GPS, &gps_payload(false), 5))
            .await;
        assert_eq!(outcome, EngineOutcome::Silent);
        assert_eq!(gateway.position_count(), 0);
    }

    #[tokio::test]
    async fn panic_alarm_records_event_and_acks() {
        let (gateway, mut conn) = connection();
        login(&mut conn).await;

        let payload = [0, 0, 0, 0, 0x45, 0x04, 0x03, 0x01, 0x02];
        let outcome = conn.handle_frame(&frame_of(proto::ALARM, &payload, 6)).await;
        assert_eq!(
            outcome,
            EngineOutcome::Respond(concox::encode_ack(proto::ALARM, 6))
        );

        let alarms = gateway.events_of_kind("ALARM");
        assert_eq!(alarms.len(), 1);
        let Event::Alarm { code, ref name } = alarms[0].event else {
            panic!("alarm event expected");
        };
        assert_eq!(code, 0x01);
        assert_eq!(name, "panic");
    }

    #[tokio::test]
    async fn alarm_4g_acks_under_0x26() {
        let (_, mut conn) = connection();
        login(&mut conn).await;

        let payload = [0, 0, 0, 0, 0x45, 0x04, 0x03, 0x02, 0x02];
        let outcome = conn
            .handle_frame(&frame_of(proto::ALARM_4G, &payload, 7))
            .await;
        assert_eq!(
            outcome,
            EngineOutcome::Respond(concox::encode_ack(proto::ALARM_4G_ACK, 7))
        );
    }

    #[tokio::test]
    async fn time_calibration_returns_current_utc() {
        let (_, mut conn) = connection();
        login(&mut conn).await;

        let outcome = conn
            .handle_frame(&frame_of(proto::TIME_CALIBRATION, &[], 8))
            .await;
        let EngineOutcome::Respond(bytes) = outcome else {
            panic!("time response expected");
        };
        let FrameOutcome::Frame { frame, .. } = read_frame(&bytes) else {
            panic!("frame expected");
        };
        assert_eq!(frame.proto, proto::TIME_CALIBRATION);
        assert_eq!(frame.payload.len(), 6);
    }

    #[tokio::test]
    async fn self_description_lands_in_comments() {
        let (gateway, mut conn) = connection();
        login(&mut conn).await;

        let mut payload = vec![0x04];
        payload.extend_from_slice(b"GT06 v1.2");
        conn.handle_frame(&frame_of(proto::INFO, &payload, 9)).await;
        assert_eq!(gateway.device(IMEI).unwrap().comments, "GT06 v1.2");
    }

    #[tokio::test]
    async fn pending_command_is_piggybacked_on_the_ack() {
        let (_, mut conn) = connection();
        login(&mut conn).await;
        conn.core
            .sessions
            .set_pending_command(Imei::new(IMEI).unwrap(), Command::MotorOff);

        let heartbeat = frame_of(proto::HEARTBEAT, &[0x01, 0x01, 0x26, 0x05, 0x00, 0x00], 10);
        let EngineOutcome::Respond(bytes) = conn.handle_frame(&heartbeat).await else {
            panic!("response expected");
        };

        // ack first, then the 0x80 command frame
        let FrameOutcome::Frame { frame, consumed } = read_frame(&bytes) else {
            panic!("ack frame expected");
        };
        assert_eq!(frame.proto, proto::HEARTBEAT);
        let FrameOutcome::Frame { frame, .. } = read_frame(&bytes[consumed..]) else {
            panic!("command frame expected");
        };
        assert_eq!(frame.proto, proto::COMMAND);
        assert_eq!(&frame.payload[5..], b"RELAY,0#");
    }

    #[tokio::test]
    async fn disconnect_closes_the_session() {
        let (gateway, mut conn) = connection();
        login(&mut conn).await;
        assert_eq!(gateway.session_count(), 1);

        conn.on_disconnect().await;
        assert_eq!(gateway.session_count(), 0);
        assert!(conn.session_id().is_none());
    }
}
