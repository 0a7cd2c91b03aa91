#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Deskbike 🚲
//!
//! A Rust library for reading live workout data from under-desk exercise
//! bikes over Bluetooth Low Energy.
//!
//! The bike speaks a small binary request/response protocol over a Nordic
//! UART style GATT service. Every request is written to one characteristic
//! and answered by one or more 20-byte notifications on another; this crate
//! turns that stream into timeout-bounded transactions and drives a polling
//! loop that publishes decoded telemetry.
//!
//! ## Protocol
//!
//! - **Framing**: every packet starts with `0xF9`, followed by an op-code,
//!   a body length, the body and an additive checksum
//! - **Requests**: connect (`D0`), hold (`D1`), info (`D3`/`D4`), workout (`D5`)
//! - **Responses**: 20-byte packets carrying a 16-byte payload at offset 4
//! - **Workout record**: three responses (`E5`, `E6`, `E7`) concatenated into 48 bytes
//!
//! ## Quick Start
//!
//! ```no_run
//! use deskbike::{Bike, BikeEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bike = Bike::new();
//!     let mut events = bike.subscribe();
//!
//!     // Scan, connect and enable notifications
//!     bike.wait_for_connection().await?;
//!
//!     // Poll the bike every 500 ms
//!     bike.start_workout().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             BikeEvent::WorkoutUpdate(sample) => {
//!                 println!("{:.2} km, {} rpm", sample.distance_km(), sample.rpm);
//!             }
//!             BikeEvent::WorkoutEnded => break,
//!             _ => {}
//!         }
//!     }
//!
//!     bike.stop_listening().await;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy connection management
pub mod ble;
/// Main bike interface
pub mod device;
/// Error types and handling
pub mod error;
/// Packet framing and command definitions
pub mod protocol;
/// Workout polling loop
pub mod session;
/// Single-slot request/response engine
pub mod transaction;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use device::Bike;
pub use error::{BikeError, Result};
pub use types::{
    BikeConfig, BikeEvent, ConnectionState, SessionState, WorkoutSummary, WorkoutTelemetry,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GATT service exposing the bike's command channel
pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Characteristic requests are written to
pub const WRITE_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Characteristic the bike notifies responses on
pub const READ_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Advertised name the bike is discovered by
pub const DEVICE_NAME: &str = "MCF-0000000000";

/// Notification the bike emits when it drops the link; never routed to a command
pub const DISCONNECT_SENTINEL: [u8; 9] = *b"AT:999999";

/// How long one command may take before it fails
pub const COMMAND_TIMEOUT_MS: u64 = 2_000;

/// Default delay between workout polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Consecutive data errors after which a running workout is abandoned
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;
