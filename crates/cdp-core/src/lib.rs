//! CDP session core: state machines and registries that take two devices
//! from an open byte transport to a mutually authenticated, end-to-end
//! encrypted session multiplexing logical application channels.
//!
//! This crate implements:
//! - Session registry and lookup
//! - Handshake state machine and cryptor lifecycle
//! - Control plane (channel open)
//! - Session-plane fragment reassembly and dispatch
//! - Channel registry
//! - Transport-upgrade handshake
//!
//! Discovery, concrete socket I/O and the application channel handlers are
//! external collaborators reached through the [`transport::FrameSink`],
//! [`platform::PlatformHandler`] and [`apps::AppHandler`] capabilities.

#![forbid(unsafe_code)]

// Core state machines
pub mod registry;
pub mod session;

// Per-session services
pub mod channel;
pub mod reassembly;

// Capabilities and collaborators
pub mod apps;
pub mod platform;
pub mod transport;

// Supporting modules
pub mod errors;
pub mod harness;

pub use apps::{AppFactory, AppHandler, AppRegistry};
pub use channel::{Channel, ChannelRegistry};
pub use errors::SessionError;
pub use platform::{LogLevel, LoopbackPlatform, PlatformHandler};
pub use reassembly::ReassemblyTable;
pub use registry::{SessionRegistry, FIRST_SESSION_ID};
pub use session::{RemoteDevice, Session, SessionPhase, DEFAULT_MESSAGE_FRAGMENT_SIZE};
pub use transport::{FrameSink, TransportError, TransportKind, UPGRADE_TCP_PORT};
