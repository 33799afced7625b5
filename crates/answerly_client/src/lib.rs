//! Streaming query session client for the Answerly answer service.
//! Keeps one WebSocket channel open, submits queries, and assembles the
//! citation list and streamed answer text as frames arrive.

pub mod accumulator;
pub mod config;
pub mod connection;
pub mod messages;
pub mod render;
pub mod router;
pub mod session;

pub use accumulator::ResponseAccumulator;
pub use config::{default_config_path, Config, ConfigError, ServerSection};
pub use connection::{ClientError, ConnectionState, Connector, WsConnector};
pub use messages::{Citation, ProtocolError, QueryMessage, ServerMessage};
pub use session::{QueryState, SessionHandle, SessionSnapshot, SubmitError};
