mod handler;
mod message;

pub(crate) use handler::announce_status;
pub use handler::{ws_handler, WsQuery};
pub use message::{ClientMessage, ServerMessage, UserStatus};
