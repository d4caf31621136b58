//! Course Lens bridge: the privileged background side of the inspection overlay.

pub mod bridge;
pub mod config;
pub mod protocol;
pub mod services;
pub mod transport;
pub mod types;

pub use bridge::HttpBridge;
pub use config::{BridgeConfig, BridgeOverrides};
pub use protocol::ProtocolHandler;
pub use transport::StdioTransport;
