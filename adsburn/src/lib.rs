//! # adsburn
//!
//! Production-line flashing for BLE audio devices, driven through USB-serial
//! BLE dongles speaking a framed binary protocol.
//!
//! This crate provides the core machinery:
//!
//! - ADS image parsing and the transmit encoding
//! - The framed dongle wire protocol (build, checksum, response scanning)
//! - The serial dongle transport with its hardware-reset connect handshake
//! - Write- and verify-side device protocol drivers
//! - The factory scheduler: BLE sighting source, dongle pool, per-device
//!   checkpoints, and the SUCCESS / REBURN / RELEASE outcome machine
//!
//! ## Architecture
//!
//! ```text
//! control channel ──> Factory ──> job queue ──> worker (one per dongle)
//!                        ^                          │
//!                        │                          v
//!                  BLE sightings              Burner / Verifier
//!                                                   │
//!                                                   v
//!                                             Link (serial)
//! ```
//!
//! Progress and log events flow back up the same chain as [`event::Event`]
//! values on the [`event::Reporter`] stream; the embedding front-end
//! decides how to render them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use adsburn::{Factory, FactoryConfig, Reporter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (reporter, mut events) = Reporter::channel();
//!     let config = FactoryConfig {
//!         file: "voice.ads".into(),
//!         target_ids: vec!["AB-01".into()],
//!         ports: adsburn::find_dongle_ports()?,
//!     };
//!
//!     let adapter = adsburn::default_adapter().await?;
//!     let handle = Factory::new(config, reporter)?.start(adapter);
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{}", event.to_plain_line());
//!     }
//!     handle.stop();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod burner;
pub mod error;
pub mod event;
pub mod factory;
pub mod frame;
pub mod host;
pub mod image;
pub mod scan;
pub mod transport;
pub mod verifier;

// Re-exports for convenience
pub use {
    error::{Error, Result},
    event::{Command, Event, Reporter, SYSTEM_PORT},
    factory::{Checkpoint, Factory, FactoryConfig, FactoryHandle, Job, Outcome},
    host::find_dongle_ports,
    image::{AdsImage, Track, TrackTable},
    scan::{Sighting, default_adapter},
    transport::{DongleLink, Link},
    verifier::VerifyOutcome,
};
