//! # serlink Core Library
//!
//! Point-to-point, half-duplex balanced data-link protocol over a
//! character-oriented serial transport.
//!
//! This library provides:
//! - Byte-level frame synchronization and parsing (I/U/A frames)
//! - Acknowledged, ordered delivery with a single in-flight frame
//! - Connection lifecycle control (start/stop/reset) and heartbeat probing
//! - Fragmentation of oversized messages and transparent reassembly
//!
//! ## Example
//!
//! ```rust,ignore
//! use serlink_core::{Master, SerialConfig, SerialTransport};
//!
//! let transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 9600));
//! let mut master = Master::new(Box::new(transport), Default::default());
//! master.set_receive_handler(Box::new(|msg| {
//!     println!("received {} bytes", msg.len());
//!     true
//! }));
//! master.start();
//! master.begin_transfer();
//! master.send(b"hello over the wire");
//! ```

pub mod checksum;
pub mod engine;
pub mod error;
pub mod frame;
pub mod master;
pub mod sync;
pub mod transport;

pub use engine::{ApciParameters, Engine, LinkState, MessageQueue};
pub use error::LinkError;
pub use frame::ControlFrame;
pub use master::{ConnectionEvent, Master};
pub use sync::{SyncTimeouts, Synchronizer};
pub use transport::{available_ports, SerialConfig, SerialTransport, Transport};

/// Default baud rate for the serial link
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
