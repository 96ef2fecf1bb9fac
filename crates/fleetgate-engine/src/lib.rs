//! Protocol engines for the fleetgate ingestion backend
//!
//! One engine per wire protocol, all built on the same parts: the device
//! registry resolves IMEIs to devices, the session store hands out and
//! checks session ids, the persistence gateway writes positions and
//! events, and the bootloader serves firmware rows to AVL devices.
//! Engines are pure with respect to I/O: they take decoded frames plus a
//! connection context and return an [`EngineOutcome`] the listeners act
//! on.

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

pub mod bootloader;
pub mod engine;
pub mod mock;
pub mod notify;
pub mod registry;
pub mod session;

pub use bootloader::Bootloader;
pub use engine::avl::AvlEngine;
pub use engine::concox::ConcoxConnection;
pub use engine::meiligao::MeiligaoEngine;
pub use engine::satellite::SatelliteConnection;
pub use engine::wialon::WialonConnection;
pub use notify::{Notifier, NoopNotifier, WebhookNotifier};
pub use registry::Registry;
pub use session::SessionStore;

/// What a listener should do after an engine handled a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Write these bytes back on the same socket; on TCP the buffer may
    /// hold several concatenated frames
    Respond(Vec<u8>),
    /// Nothing to send
    Silent,
    /// Drop the connection (meaningless for UDP engines)
    Close,
}

impl EngineOutcome {
    /// Chain a second frame onto a response; TCP engines use this to
    /// piggyback a pending command on an ack.
    #[must_use]
    pub fn and_frame(self, frame: Vec<u8>) -> Self {
        match self {
            Self::Respond(mut bytes) => {
                bytes.extend_from_slice(&frame);
                Self::Respond(bytes)
            }
            Self::Silent => Self::Respond(frame),
            Self::Close => Self::Close,
        }
    }
}
