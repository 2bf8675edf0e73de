pub mod error;
pub mod config;
pub mod codec;
pub mod token;
pub mod db;
pub mod session;

pub use error::{Result, SessionError};
pub use session::{Session, SessionId, SessionStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
