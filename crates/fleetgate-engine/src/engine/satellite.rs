//! Satellite uplink engine (TCP)
//!
//! A connection delivers one burst and is closed. The uplink is
//! one-way, so there is never a response; fixes are minute-resolution
//! and carry no speed or course.

use super::EngineCore;
use crate::EngineOutcome;
use fleetgate_codec::satellite::SatelliteBurst;
use fleetgate_core::utils::clamp_stale_timestamp;
use fleetgate_core::{Event, PositionFix, Protocol, Result, StatusDelta};
use chrono::Utc;
use tracing::{info, warn};

/// State of one satellite uplink connection
pub struct SatelliteConnection {
    core: EngineCore,
    endpoint: String,
}

impl SatelliteConnection {
    /// Fresh connection.
    #[must_use]
    pub fn new(core: EngineCore, endpoint: String) -> Self {
        Self { core, endpoint }
    }

    /// Handle the burst; the connection is done either way.
    pub async fn handle_burst(&self, burst: &SatelliteBurst) -> EngineOutcome {
        metrics::counter!("fleetgate_frames_total", "protocol" => "satellite").increment(1);
        if let Err(e) = self.store_burst(burst).await {
            warn!(endpoint = %self.endpoint, imei = burst.imei, error = %e, "burst dropped after internal error");
        }
        EngineOutcome::Close
    }

    async fn store_burst(&self, burst: &SatelliteBurst) -> Result<()> {
        let Some(device) = self.core.registry.resolve_or_create(burst.imei).await? else {
            return Ok(());
        };
        let imei = device.imei;

        let now = Utc::now();
        let mut inserted = 0u64;
        let mut last_fix: Option<&PositionFix> = None;
        let mut fixes = Vec::with_capacity(burst.fixes.len());
        for raw in &burst.fixes {
            let (ts, stale_clock) = clamp_stale_timestamp(raw.timestamp, now);
            let mut fix = PositionFix::bare(ts, raw.latitude, raw.longitude, Protocol::Satellite);
            fix.stale_clock = stale_clock;
            fixes.push(fix);
        }

        for fix in &fixes {
            if self.core.gateway.insert_position(imei, fix).await? {
                inserted += 1;
                self.core
                    .gateway
                    .insert_event(imei, fix.timestamp, Some((fix.latitude, fix.longitude)), &Event::Track)
                    .await?;
            }
            if last_fix.is_none_or(|prior| fix.timestamp >= prior.timestamp) {
                last_fix = Some(fix);
            }
        }
        metrics::counter!("fleetgate_positions_total", "protocol" => "satellite")
            .increment(inserted);
        info!(imei = %imei, seq = burst.seq, fixes = fixes.len(), inserted, "satellite burst");

        let mut delta = StatusDelta::contact(now);
        if let Some(fix) = last_fix {
            delta.position = Some((fix.latitude, fix.longitude));
            delta.last_fix = Some(fix.timestamp);
        }
        self.core.registry.update_status(imei, &delta).await
    }
}
