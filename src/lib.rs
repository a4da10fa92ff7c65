pub mod cache;
pub mod error;
pub mod stream;
pub mod traccar;

/// Default user agent for HTTP and WebSocket handshakes - automatically uses the package version
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
