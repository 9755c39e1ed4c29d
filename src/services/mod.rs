pub mod connection;
pub mod logger;
pub mod metadata;
pub mod remote_session;
pub mod session_pool;
pub mod ssh_transport;
pub mod tool_executor;
pub mod transport;
pub mod validation;
