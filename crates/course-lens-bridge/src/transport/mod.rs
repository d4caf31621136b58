//! Transport layer for page communication.

pub mod codec;
pub mod stdio;

pub use stdio::StdioTransport;
