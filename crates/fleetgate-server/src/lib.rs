//! Listener daemon for the fleetgate ingestion backend
//!
//! Binds one socket per protocol and forwards frames to the engines in
//! `fleetgate-engine`. All listener loops stop on the shared
//! cancellation token; TCP connections additionally die after a
//! configurable stretch of silence.

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
    clippy::cast_possible_truncation
)]

pub mod listeners;

pub use listeners::TcpOptions;
