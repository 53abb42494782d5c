mod handler;
mod protocol;

pub use handler::ws_handler;
pub use protocol::derive_ws_url;
