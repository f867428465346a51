//! # icp-bridge
//!
//! Bridge between a cockpit control-panel host and the driver process that
//! owns the ICP (integrated control panel) display.
//!
//! The host computes five 25-column rows of text and hands them to
//! [`IcpBridge::draw_icp`]. The driver, a separate long-lived process, owns
//! the device and renders frames it receives over a local pipe. The driver
//! may crash, start slowly, or already be running from an earlier session;
//! the bridge copes with all three.
//!
//! ## Architecture
//!
//! ```text
//! host ─► IcpBridge ─► Correlator (gate) ─► PipeConnection ══ pipe ══► DriverServer
//!              │                                                          │
//!              └─► Supervisor (launch / restart / fatal)      CommandDispatcher ─► IcpDevice
//! ```
//!
//! - **protocol**: newline-delimited JSON requests, responses and notifications
//! - **client**: call gate; one call in flight, replies matched by id
//! - **transport**: Unix socket or Windows named pipe, line framing
//! - **supervisor**: connect-or-launch, exit watching, restart budget
//! - **shutdown**: blank the display, close the driver, reap it
//! - **server**: driver-side dispatcher and accept loop
//! - **frame**: 5×25 frames, inversion markers, glyph placement

pub mod bridge;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod frame;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod supervisor;
pub mod transport;

pub use bridge::IcpBridge;
pub use config::{BridgeConfig, DriverConfig, IcpConfig};
pub use device::{IcpDevice, VirtualDevice};
pub use error::{BridgeError, Result};
pub use events::{FatalLatch, Subscribers, SubscriptionId, Unavailable};
pub use frame::DisplayFrame;
pub use server::{CommandDispatcher, DriverServer};
pub use supervisor::{exit_codes, LinkState};
pub use transport::{ListenError, PipeAddress, PipeListener};
