pub mod api;
pub mod transport;

pub use api::{ChatMessage, PortalClient, PortalError, ToolInvocation};
pub use transport::Transport;
