#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # sem6000
//!
//! A Rust library for controlling Voltcraft SEM6000 smart plugs via Bluetooth Low Energy.
//!
//! The plug speaks a small framed command/notification protocol over one GATT
//! characteristic. This crate provides:
//!
//! - **Frame codec**: header, length, checksum and terminator handling ([`frame`])
//! - **Payload catalog**: typed [`Command`]s and a table-driven [`Notification`] decoder
//! - **Reassembly**: joining notification fragments into one reply ([`Reassembler`])
//! - **Session engine**: [`Sem6000`], with PIN authorization, one implicit
//!   reconnect per command and paged scheduler listing
//!
//! The engine is generic over a [`Transport`]; [`BleTransport`] implements it
//! with `btleplug`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sem6000::{ConnectionParams, Sem6000};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = ConnectionParams::new("AA:BB:CC:DD:EE:FF");
//!     let mut plug = Sem6000::connect_ble(params, Some("0000".parse()?)).await?;
//!
//!     plug.power_on().await?;
//!
//!     let settings = plug.request_settings().await?;
//!     println!("Power limit: {} W", settings.power_limit_in_watt);
//!
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
pub mod command;
/// Session engine and high-level plug operations
pub mod device;
/// Error types and handling
pub mod error;
pub mod frame;
pub mod notification;
pub mod reassembler;
/// Transport abstraction
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::BleTransport;
pub use command::{Command, CommandKind};
pub use device::Sem6000;
pub use error::{DecodeError, FrameError, PayloadError, Result, Sem6000Error};
pub use notification::{Notification, NotificationKind};
pub use reassembler::Reassembler;
pub use transport::{FragmentReceiver, Transport};
pub use types::{
    AddressType, ConnectionParams, ConsumptionPeriod, ConsumptionSeries, DeviceInfo, Measurement,
    Pin, RandomMode, Scheduler, SchedulerEntry, SchedulerList, SessionState, Settings,
    TimeoutConfig, TimerAction, TimerStatus, Weekdays,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service advertised by SEM6000 plugs, used as the discovery filter
pub const SEM6000_SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";

/// Read-only characteristic holding the plain-text device name
pub const NAME_CHAR_UUID: &str = "00002a00-0000-1000-8000-00805f9b34fb";

/// Control characteristic: commands are written to it and replies arrive as notifications
pub const CONTROL_CHAR_UUID: &str = "0000fff3-0000-1000-8000-00805f9b34fb";
