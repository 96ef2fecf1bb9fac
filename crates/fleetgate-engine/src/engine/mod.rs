//! Per-protocol engines
//!
//! Every engine borrows the same [`EngineCore`]: registry, session
//! store, persistence gateway and notifier. TCP engines are built as
//! per-connection types holding their own login state; the UDP engines
//! are shared and stateless between datagrams.

pub mod avl;
pub mod concox;
pub mod meiligao;
pub mod satellite;
pub mod wialon;

use crate::notify::Notifier;
use crate::registry::Registry;
use crate::session::SessionStore;
use fleetgate_database::Gateway;
use std::sync::Arc;

/// Shared parts every engine depends on
#[derive(Clone)]
pub struct EngineCore {
    /// Device registry
    pub registry: Arc<Registry>,
    /// Session store
    pub sessions: Arc<SessionStore>,
    /// Persistence gateway
    pub gateway: Arc<dyn Gateway>,
    /// Panic-notification gateway
    pub notifier: Arc<dyn Notifier>,
}

impl EngineCore {
    /// Bundle the shared parts.
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<SessionStore>,
        gateway: Arc<dyn Gateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            sessions,
            gateway,
            notifier,
        }
    }
}
