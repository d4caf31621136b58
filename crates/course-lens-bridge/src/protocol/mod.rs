//! Request dispatch.

pub mod handler;

pub use handler::ProtocolHandler;
