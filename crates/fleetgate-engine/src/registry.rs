//! Device registry
//!
//! Resolves raw IMEIs from login frames to device records. Unknown IMEIs
//! inside the valid range are provisioned on first contact when the
//! policy allows it; out-of-range or Luhn-invalid IMEIs are rejected
//! before any storage call. The ingestion path never deletes a device.

use fleetgate_core::config::ProvisioningConfig;
use fleetgate_core::{Device, Imei, Result, StatusDelta};
use fleetgate_database::Gateway;
use std::sync::Arc;
use tracing::{info, warn};

/// Device registry over the persistence gateway
pub struct Registry {
    gateway: Arc<dyn Gateway>,
    policy: ProvisioningConfig,
}

impl Registry {
    /// Create a registry with the given provisioning policy.
    pub fn new(gateway: Arc<dyn Gateway>, policy: ProvisioningConfig) -> Self {
        Self { gateway, policy }
    }

    /// Resolve a raw IMEI to a device, provisioning one when the IMEI
    /// is valid, unknown and auto-provisioning is on. `None` means the
    /// login is rejected.
    pub async fn resolve_or_create(&self, raw_imei: u64) -> Result<Option<Device>> {
        let imei = match Imei::new(raw_imei) {
            Ok(imei) => imei,
            Err(e) => {
                warn!(imei = raw_imei, error = %e, "rejected login");
                metrics::counter!("fleetgate_logins_rejected_total").increment(1);
                return Ok(None);
            }
        };

        if let Some(device) = self.gateway.find_device(imei).await? {
            return Ok(Some(device));
        }

        if !self.policy.auto_provision {
            warn!(imei = %imei, "unknown device and auto-provisioning is off");
            return Ok(None);
        }

        let device = Device::provisioned(imei, &self.policy.default_harness);
        self.gateway.create_device(&device).await?;
        info!(imei = %imei, name = %device.name, "provisioned new device");
        metrics::counter!("fleetgate_devices_provisioned_total").increment(1);
        Ok(Some(device))
    }

    /// Apply a partial status update to a device.
    pub async fn update_status(&self, imei: Imei, delta: &StatusDelta) -> Result<()> {
        self.gateway.update_status(imei, delta).await
    }

    /// Shared login token for text protocols, when one is configured.
    #[must_use]
    pub fn shared_token(&self) -> Option<&str> {
        self.policy.shared_token.as_deref()
    }
}
