//! AVL/Bluetooth UDP engine
//!
//! Handles login, keep-alive, device info, bulk record upload and the
//! bootloader conversation. One datagram in, at most one datagram out;
//! anything undecodable or failing mid-frame is logged and dropped
//! without an answer.

use super::EngineCore;
use crate::EngineOutcome;
use crate::bootloader::Bootloader;
use fleetgate_codec::avl::{
    self, AvlPacket, AvlResponse, DataRecord, LisRecord, PeopleRecord, PositionRecord,
    RecordBody, subcmd,
};
use fleetgate_core::utils::{clamp_stale_timestamp, format_mac};
use fleetgate_core::{Device, Event, FirmwareState, Imei, PositionFix, Protocol, Result, StatusDelta, input_bits};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// AVL protocol engine; shared across both UDP sockets
pub struct AvlEngine {
    core: EngineCore,
    bootloader: Option<Arc<Bootloader>>,
}

impl AvlEngine {
    /// Create the engine; the bootloader is optional and absent when no
    /// firmware image is configured.
    #[must_use]
    pub fn new(core: EngineCore, bootloader: Option<Arc<Bootloader>>) -> Self {
        Self { core, bootloader }
    }

    /// Handle one datagram.
    pub async fn handle_datagram(&self, buf: &[u8], endpoint: &str) -> EngineOutcome {
        metrics::counter!("fleetgate_frames_total", "protocol" => "avl").increment(1);
        let packet = match avl::decode(buf) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(endpoint, error = %e, "undecodable datagram");
                metrics::counter!("fleetgate_frames_invalid_total", "protocol" => "avl")
                    .increment(1);
                return EngineOutcome::Silent;
            }
        };

        match self.dispatch(packet, endpoint).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(endpoint, error = %e, "dropped datagram after internal error");
                EngineOutcome::Silent
            }
        }
    }

    async fn dispatch(&self, packet: AvlPacket, endpoint: &str) -> Result<EngineOutcome> {
        if let AvlPacket::Login { imei, mac } = packet {
            return self.handle_login(imei, mac, endpoint).await;
        }

        let session_id = match packet {
            AvlPacket::Ping { session_id, .. }
            | AvlPacket::DevInfo { session_id, .. }
            | AvlPacket::Data { session_id, .. }
            | AvlPacket::BootEnter { session_id }
            | AvlPacket::BootData { session_id, .. }
            | AvlPacket::BootExit { session_id, .. } => session_id,
            AvlPacket::Login { .. } => unreachable!(),
        };

        let Some(entry) = self.core.sessions.lookup(session_id) else {
            debug!(endpoint, session_id, "unknown session, requesting login");
            return Ok(respond(&AvlResponse::LoginRequest));
        };
        self.core.sessions.refresh(session_id, endpoint).await?;
        let imei = entry.imei;
        let Some(device) = self.core.gateway.find_device(imei).await? else {
            return Ok(respond(&AvlResponse::LoginRequest));
        };

        match packet {
            AvlPacket::Ping { position, .. } => {
                self.store_track(imei, &position).await?;
                self.core
                    .registry
                    .update_status(imei, &StatusDelta::contact(Utc::now()))
                    .await?;
                self.after_packet(imei, &device, AvlResponse::Ack {
                    count: 0,
                    first: 0,
                    last: 0,
                })
                .await
            }
            AvlPacket::DevInfo { info, .. } => {
                let delta = StatusDelta {
                    comments: Some(info),
                    ..StatusDelta::contact(Utc::now())
                };
                self.core.registry.update_status(imei, &delta).await?;
                self.after_packet(imei, &device, AvlResponse::Ack {
                    count: 0,
                    first: 0,
                    last: 0,
                })
                .await
            }
            AvlPacket::Data { records, .. } => {
                let ack = self.store_records(imei, &records).await?;
                self.after_packet(imei, &device, ack).await
            }
            AvlPacket::BootEnter { .. } => self.boot_advance(imei, &device, 0).await,
            AvlPacket::BootData { next_row, .. } => {
                self.boot_advance(imei, &device, next_row).await
            }
            AvlPacket::BootExit { result, .. } => {
                info!(imei = %imei, result, "device left the bootloader");
                self.core
                    .gateway
                    .set_firmware_state(imei, &FirmwareState::Done(result))
                    .await?;
                Ok(EngineOutcome::Silent)
            }
            AvlPacket::Login { .. } => unreachable!(),
        }
    }

    async fn handle_login(&self, imei: u64, mac: [u8; 6], endpoint: &str) -> Result<EngineOutcome> {
        let Some(device) = self.core.registry.resolve_or_create(imei).await? else {
            return Ok(EngineOutcome::Silent);
        };
        let imei = device.imei;
        let session_id = self
            .core
            .sessions
            .open(imei, Protocol::Avl, endpoint)
            .await?;
        self.core
            .registry
            .update_status(imei, &StatusDelta::contact(Utc::now()))
            .await?;
        info!(imei = %imei, mac = %format_mac(&mac), session_id, "device logged in");

        // Ask for the self-description until the device has supplied one.
        let subcmd = if device.comments.is_empty() {
            subcmd::SEND_INFO
        } else {
            subcmd::SEND_DATA
        };
        Ok(respond(&AvlResponse::Session {
            session_id,
            subcmd,
        }))
    }

    /// Response to an authenticated non-bootloader packet: the
    /// bootloader takes precedence, then a pending command, then the
    /// plain ack.
    async fn after_packet(
        &self,
        imei: Imei,
        device: &Device,
        ack: AvlResponse,
    ) -> Result<EngineOutcome> {
        if let Some(loader) = &self.bootloader {
            match device.firmware_state {
                FirmwareState::Start => {
                    // The device re-reports its info after flashing.
                    let delta = StatusDelta {
                        comments: Some(String::new()),
                        ..StatusDelta::default()
                    };
                    self.core.registry.update_status(imei, &delta).await?;
                    info!(imei = %imei, rows = loader.total_rows(), "enrolling device for firmware");
                    return Ok(respond(&loader.enter_response()));
                }
                FirmwareState::Row(next_row) => {
                    return Ok(respond(&loader.batch_from(next_row as u16)));
                }
                _ => {}
            }
        }

        if let Some(command) = self.core.sessions.take_pending_command(imei) {
            if let Some(code) = command.avl_code() {
                info!(imei = %imei, ?command, "delivering pending command");
                return Ok(respond(&AvlResponse::Command { code }));
            }
            warn!(imei = %imei, ?command, "command has no wire encoding here, dropping");
        }

        Ok(respond(&ack))
    }

    /// The device expects rows from `next_row`; check the ack against
    /// the recorded progress, then answer with the next batch or the
    /// exit frame.
    async fn boot_advance(
        &self,
        imei: Imei,
        device: &Device,
        next_row: u16,
    ) -> Result<EngineOutcome> {
        let Some(loader) = &self.bootloader else {
            warn!(imei = %imei, "bootloader frame but no image configured");
            return Ok(EngineOutcome::Silent);
        };
        match device.firmware_state {
            FirmwareState::Start => {
                if next_row != 0 {
                    let reason = format!("first ack names row {next_row}, expected 0");
                    return self.boot_fail(imei, reason).await;
                }
            }
            FirmwareState::Row(served) => {
                let served = served as u16;
                // Same row again is a retransmit; the batch is re-served.
                if next_row != served && !loader.ack_advances(served, next_row) {
                    let reason =
                        format!("ack for row {next_row} after a batch served from {served}");
                    return self.boot_fail(imei, reason).await;
                }
            }
            FirmwareState::Idle | FirmwareState::Done(_) | FirmwareState::Error(_) => {
                warn!(
                    imei = %imei,
                    state = %device.firmware_state,
                    "bootloader frame from a device that is not enrolled"
                );
                return Ok(EngineOutcome::Silent);
            }
        }
        self.core
            .gateway
            .set_firmware_state(imei, &loader.state_after_ack(next_row))
            .await?;
        debug!(imei = %imei, next_row, total = loader.total_rows(), "bootloader progress");
        Ok(respond(&loader.batch_from(next_row)))
    }

    /// Abort the push and record why; the device gets no answer.
    async fn boot_fail(&self, imei: Imei, reason: String) -> Result<EngineOutcome> {
        warn!(imei = %imei, %reason, "bootloader row mismatch, aborting the push");
        self.core
            .gateway
            .set_firmware_state(imei, &FirmwareState::Error(reason))
            .await?;
        Ok(EngineOutcome::Silent)
    }

    /// Persist one position record with its track/IO events; returns
    /// whether the fix was new.
    async fn store_track(&self, imei: Imei, record: &PositionRecord) -> Result<bool> {
        let now = Utc::now();
        let (ts, stale_clock) = clamp_stale_timestamp(record.timestamp(), now);
        let inputs = record.input_bits();

        let fix = PositionFix {
            timestamp: ts,
            latitude: record.latitude(),
            longitude: record.longitude(),
            speed: if record.is_delta() {
                0.0
            } else {
                f64::from(record.speed)
            },
            course: 0.0,
            altitude: 0.0,
            satellites: 0,
            inputs,
            source: Protocol::Avl,
            stale_clock,
        };

        let inserted = self.core.gateway.insert_position(imei, &fix).await?;
        if inserted {
            metrics::counter!("fleetgate_positions_total", "protocol" => "avl").increment(1);
            self.core
                .gateway
                .insert_event(imei, ts, Some((fix.latitude, fix.longitude)), &Event::Track)
                .await?;
        }

        if let Some(mask) = record.delta_mask() {
            if let Some(tag) = input_bits::tag(mask) {
                let level = inputs & mask != 0;
                let event = Event::IoFix {
                    tag: tag.to_string(),
                    level,
                };
                self.core
                    .gateway
                    .insert_event(imei, ts, Some((fix.latitude, fix.longitude)), &event)
                    .await?;
                if mask == input_bits::PANIC && level {
                    self.notify_panic(imei).await;
                }
            } else {
                debug!(imei = %imei, mask, "delta fix with unknown input mask");
            }
        }

        let delta = StatusDelta {
            position: Some((fix.latitude, fix.longitude)),
            speed: Some(fix.speed),
            inputs: Some(i32::from(inputs)),
            last_fix: Some(ts),
            last_contact: Some(now),
            ..StatusDelta::default()
        };
        self.core.registry.update_status(imei, &delta).await?;

        Ok(inserted)
    }

    async fn store_people(&self, imei: Imei, record: &PeopleRecord) -> Result<bool> {
        let now = Utc::now();
        let (ts, _) = clamp_stale_timestamp(record.timestamp(), now);
        let sensor_id = format_mac(&record.mac);

        let inserted = self
            .core
            .gateway
            .insert_people_count(imei, &sensor_id, ts, record.entered, record.exited)
            .await?;
        if inserted {
            let event = Event::PeopleCount {
                sensor_id,
                entered: record.entered,
                exited: record.exited,
            };
            self.core.gateway.insert_event(imei, ts, None, &event).await?;
        }
        Ok(inserted)
    }

    async fn store_lis(&self, imei: Imei, record: &LisRecord) -> Result<bool> {
        let now = Utc::now();
        let (ts, _) =
            clamp_stale_timestamp(fleetgate_core::utils::unix_to_utc(i64::from(record.ct_start)), now);
        let [entry, err_entry, peak, err_exit, exit] = record.scaled_magnitudes();

        let inserted = self
            .core
            .gateway
            .insert_accel_event(
                imei,
                ts,
                record.duration_secs(),
                record.err_duration_secs(),
                entry,
                peak,
                exit,
            )
            .await?;
        if inserted {
            let event = Event::AccelEvent {
                duration: record.duration_secs(),
                err_duration: record.err_duration_secs(),
                entry,
                err_entry,
                peak,
                err_exit,
                exit,
            };
            let position = Some((record.position.latitude(), record.position.longitude()));
            self.core.gateway.insert_event(imei, ts, position, &event).await?;
        }
        Ok(inserted)
    }

    /// Iterate the records of a `DATA` packet and build the ack. The
    /// id range always spans every record the packet declared, skipped
    /// ones included; the count reflects what was actually new.
    async fn store_records(&self, imei: Imei, records: &[DataRecord]) -> Result<AvlResponse> {
        let mut accepted: u64 = 0;
        for record in records {
            match &record.body {
                RecordBody::Tracks(tracks) => {
                    for track in tracks {
                        if self.store_track(imei, track).await? {
                            accepted += 1;
                        }
                    }
                }
                RecordBody::People(counts) => {
                    for count in counts {
                        if self.store_people(imei, count).await? {
                            accepted += 1;
                        }
                    }
                }
                RecordBody::Lis(lis) => {
                    if self.store_lis(imei, lis).await? {
                        accepted += 1;
                    }
                }
                RecordBody::Skipped { rtype, reason } => {
                    warn!(imei = %imei, id = record.id, rtype, reason, "skipped record");
                }
            }
        }

        self.core
            .registry
            .update_status(imei, &StatusDelta::contact(Utc::now()))
            .await?;

        Ok(AvlResponse::Ack {
            count: accepted.min(u64::from(u8::MAX)) as u8,
            first: records.first().map_or(0, |r| r.id),
            last: records.last().map_or(0, |r| r.id),
        })
    }

    async fn notify_panic(&self, imei: Imei) {
        let device = match self.core.gateway.find_device(imei).await {
            Ok(Some(device)) => device,
            _ => return,
        };
        if let Some(address) = &device.notify_address {
            let message = format!("panic button pressed on {}", device.name);
            if let Err(e) = self.core.notifier.notify(address, &message).await {
                warn!(imei = %imei, error = %e, "panic notification failed");
            }
        }
    }
}

fn respond(response: &AvlResponse) -> EngineOutcome {
    EngineOutcome::Respond(avl::encode_response(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryGateway;
    use crate::notify::NoopNotifier;
    use crate::registry::Registry;
    use crate::session::SessionStore;
    use fleetgate_codec::avl::{encode_packet, tag};
    use fleetgate_codec::crc::firmware_row_checksum;
    use fleetgate_codec::firmware::{FirmwareImage, FirmwareRow};
    use fleetgate_core::config::{ProvisioningConfig, SessionConfig};
    use fleetgate_database::Gateway;
    use pretty_assertions::assert_eq;

    const IMEI: u64 = 352_749_380_148_144;

    fn engine() -> (Arc<MemoryGateway>, AvlEngine) {
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
        (gateway, AvlEngine::new(core, None))
    }

    fn engine_with_loader() -> (Arc<MemoryGateway>, AvlEngine) {
        let (gateway, engine) = engine();
        let rows = (0u16..3)
            .map(|i| {
                let data = vec![i as u8; 4];
                let checksum = firmware_row_checksum(&data);
                FirmwareRow {
                    array_id: 1,
                    row_number: 0x40 + i,
                    data,
                    checksum,
                }
            })
            .collect();
        let loader = Bootloader::new(FirmwareImage {
            silicon_id: 0x1234_5678,
            silicon_rev: 1,
            checksum_type: 0,
            rows,
        });
        let engine = AvlEngine::new(engine.core, Some(Arc::new(loader)));
        (gateway, engine)
    }

    async fn login(engine: &AvlEngine) -> u32 {
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::Login {
                    imei: IMEI,
                    mac: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
                }),
                "10.0.0.1:60000",
            )
            .await;
        let EngineOutcome::Respond(bytes) = outcome else {
            panic!("login should be answered");
        };
        assert_eq!(bytes[0], tag::SESSION);
        u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]])
    }

    fn recent_track(offset: u32) -> PositionRecord {
        PositionRecord {
            ct: Utc::now().timestamp() as u32 - offset,
            lat_e7: 194_326_000,
            lon_e7: -991_332_000,
            speed: 45,
            inputs: 0x01,
        }
    }

    #[tokio::test]
    async fn login_provisions_and_requests_info() {
        let (gateway, engine) = engine();
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::Login {
                    imei: IMEI,
                    mac: [0; 6],
                }),
                "e",
            )
            .await;

        let EngineOutcome::Respond(bytes) = outcome else {
            panic!("response expected");
        };
        // fresh device has no comments yet: ask for info (0x20)
        assert_eq!(bytes[5], subcmd::SEND_INFO);
        assert_eq!(gateway.device_count(), 1);
        assert_eq!(gateway.device(IMEI).unwrap().name, "352749380148144");
    }

    #[tokio::test]
    async fn invalid_imei_login_is_silent() {
        let (gateway, engine) = engine();
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::Login {
                    imei: 42,
                    mac: [0; 6],
                }),
                "e",
            )
            .await;
        assert_eq!(outcome, EngineOutcome::Silent);
        assert_eq!(gateway.device_count(), 0);
    }

    #[tokio::test]
    async fn unknown_session_gets_login_request() {
        let (_, engine) = engine();
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::Ping {
                    session_id: 0xBAD,
                    position: recent_track(0),
                }),
                "e",
            )
            .await;
        assert_eq!(
            outcome,
            EngineOutcome::Respond(vec![tag::LOGIN_REQUEST])
        );
    }

    #[tokio::test]
    async fn ping_stores_fix_and_track_event() {
        let (gateway, engine) = engine();
        let sid = login(&engine).await;

        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::Ping {
                    session_id: sid,
                    position: recent_track(0),
                }),
                "e",
            )
            .await;

        assert!(matches!(outcome, EngineOutcome::Respond(ref b) if b[0] == tag::ACK));
        assert_eq!(gateway.position_count(), 1);
        assert_eq!(gateway.events_of_kind("TRACK").len(), 1);
        let fix = &gateway.positions_of(IMEI)[0];
        assert!((fix.latitude - 19.4326).abs() < 1e-6);
        assert!(!fix.stale_clock);
    }

    #[tokio::test]
    async fn stale_device_clock_is_clamped_and_flagged() {
        let (gateway, engine) = engine();
        let sid = login(&engine).await;

        // 30 days behind the wall clock
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::Ping {
                    session_id: sid,
                    position: recent_track(30 * 24 * 3600),
                }),
                "e",
            )
            .await;
        assert!(matches!(outcome, EngineOutcome::Respond(_)));

        let fix = &gateway.positions_of(IMEI)[0];
        assert!(fix.stale_clock);
        assert!((Utc::now() - fix.timestamp).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn data_with_duplicates_acks_full_declared_range() {
        let (gateway, engine) = engine();
        let sid = login(&engine).await;

        let track = recent_track(60);
        let packet = AvlPacket::Data {
            session_id: sid,
            records: vec![
                DataRecord {
                    id: 100,
                    // two identical timestamps: one insert, one duplicate
                    body: RecordBody::Tracks(vec![track, track]),
                },
                DataRecord {
                    id: 101,
                    body: RecordBody::People(vec![PeopleRecord {
                        ct: track.ct,
                        entered: 3,
                        exited: 1,
                        mac: [1, 2, 3, 4, 5, 6],
                    }]),
                },
            ],
        };

        // feed twice: second pass is all duplicates
        let first = engine.handle_datagram(&encode_packet(&packet), "e").await;
        let EngineOutcome::Respond(bytes) = first else {
            panic!("ack expected");
        };
        assert_eq!(bytes[0], tag::ACK);
        assert_eq!(bytes[1], 2); // one track + one people count
        assert_eq!(u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]), 100);
        assert_eq!(u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]), 101);

        let second = engine.handle_datagram(&encode_packet(&packet), "e").await;
        let EngineOutcome::Respond(bytes) = second else {
            panic!("ack expected");
        };
        assert_eq!(bytes[1], 0); // nothing new
        // the range still covers every declared record
        assert_eq!(u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]), 100);

        assert_eq!(gateway.position_count(), 1);
        assert_eq!(gateway.people_count_rows(), 1);
    }

    #[tokio::test]
    async fn delta_fix_emits_io_event_with_tag() {
        let (gateway, engine) = engine();
        let sid = login(&engine).await;

        let mut track = recent_track(0);
        track.inputs = input_bits::DELTA | input_bits::IGNITION;
        track.speed = input_bits::IGNITION; // delta mask rides in the speed byte

        engine
            .handle_datagram(
                &encode_packet(&AvlPacket::Ping {
                    session_id: sid,
                    position: track,
                }),
                "e",
            )
            .await;

        let io_events = gateway.events_of_kind("IO_FIX");
        assert_eq!(io_events.len(), 1);
        let Event::IoFix { ref tag, level } = io_events[0].event else {
            panic!("io fix expected");
        };
        assert_eq!(tag, "ignition");
        assert!(level);
    }

    #[tokio::test]
    async fn pending_command_replaces_the_ack() {
        let (_, engine) = engine();
        let sid = login(&engine).await;
        let imei = Imei::new(IMEI).unwrap();
        engine
            .core
            .sessions
            .set_pending_command(imei, fleetgate_core::Command::MotorOff);

        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::Ping {
                    session_id: sid,
                    position: recent_track(0),
                }),
                "e",
            )
            .await;
        assert_eq!(outcome, EngineOutcome::Respond(vec![tag::COMMAND, 0x31]));

        // consume-once: the next ping gets a plain ack
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::Ping {
                    session_id: sid,
                    position: recent_track(0),
                }),
                "e",
            )
            .await;
        assert!(matches!(outcome, EngineOutcome::Respond(ref b) if b[0] == tag::ACK));
    }

    #[tokio::test]
    async fn regressing_boot_ack_aborts_the_push() {
        let (gateway, engine) = engine_with_loader();
        let sid = login(&engine).await;
        let imei = Imei::new(IMEI).unwrap();
        gateway
            .set_firmware_state(imei, &FirmwareState::Row(2))
            .await
            .unwrap();

        // the device asks for rows it already acknowledged
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::BootData {
                    session_id: sid,
                    next_row: 0,
                }),
                "e",
            )
            .await;

        assert_eq!(outcome, EngineOutcome::Silent);
        assert!(matches!(
            gateway.device(IMEI).unwrap().firmware_state,
            FirmwareState::Error(_)
        ));
    }

    #[tokio::test]
    async fn boot_ack_past_the_served_batch_aborts_the_push() {
        let (gateway, engine) = engine_with_loader();
        let sid = login(&engine).await;
        let imei = Imei::new(IMEI).unwrap();
        gateway
            .set_firmware_state(imei, &FirmwareState::Row(0))
            .await
            .unwrap();

        // only three rows exist; an ack for row 7 was never served
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::BootData {
                    session_id: sid,
                    next_row: 7,
                }),
                "e",
            )
            .await;

        assert_eq!(outcome, EngineOutcome::Silent);
        assert!(matches!(
            gateway.device(IMEI).unwrap().firmware_state,
            FirmwareState::Error(_)
        ));
    }

    #[tokio::test]
    async fn retransmitted_boot_ack_reserves_the_batch() {
        let (gateway, engine) = engine_with_loader();
        let sid = login(&engine).await;
        let imei = Imei::new(IMEI).unwrap();
        gateway
            .set_firmware_state(imei, &FirmwareState::Row(0))
            .await
            .unwrap();

        // the previous batch was lost; the same ack earns it again
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::BootData {
                    session_id: sid,
                    next_row: 0,
                }),
                "e",
            )
            .await;

        assert!(matches!(outcome, EngineOutcome::Respond(ref b) if b[0] == tag::BTL_DATA));
        assert_eq!(
            gateway.device(IMEI).unwrap().firmware_state,
            FirmwareState::Row(0)
        );
    }

    #[tokio::test]
    async fn boot_frames_from_an_unenrolled_device_are_ignored() {
        let (gateway, engine) = engine_with_loader();
        let sid = login(&engine).await;

        // firmware state is still Idle: nobody enrolled this device
        let outcome = engine
            .handle_datagram(
                &encode_packet(&AvlPacket::BootEnter { session_id: sid }),
                "e",
            )
            .await;

        assert_eq!(outcome, EngineOutcome::Silent);
        assert_eq!(
            gateway.device(IMEI).unwrap().firmware_state,
            FirmwareState::Idle
        );
    }
}
