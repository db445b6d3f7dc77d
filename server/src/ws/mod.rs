pub mod actor;
pub mod dispatch;
pub mod handler;
pub mod protocol;
pub mod registry;

pub use protocol::{ClientEvent, ServerEvent};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, ConnectionSender};

/// WebSocket close codes:
/// 4000 = username missing or invalid
/// 4001 = account deleted
pub const CLOSE_INVALID_USERNAME: u16 = 4000;
pub const CLOSE_ACCOUNT_DELETED: u16 = 4001;
