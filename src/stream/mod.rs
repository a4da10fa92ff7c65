pub mod config;
pub mod policy;
pub mod status;
pub mod supervisor;
pub mod transport;
pub mod websocket;

pub use config::SupervisorConfig;
pub use policy::{Backoff, ReconnectPolicy};
pub use status::{ConnectionStatus, HandlerId};
pub use supervisor::ConnectionSupervisor;
pub use transport::{Connection, Frame, Transport};
pub use websocket::WebSocketTransport;
