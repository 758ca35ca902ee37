pub mod channel;
pub mod server;
pub mod tcp;

pub use channel::{ChannelConfig, TcpChannel};
pub use server::{Accepted, TcpServer};
pub use tcp::TokioConnection;
