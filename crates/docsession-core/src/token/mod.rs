//! Moving the opaque session token between HTTP messages and the store.

pub mod cookie;
pub mod header;

use http::HeaderMap;

use crate::config::SessionOptions;

pub use self::cookie::CookieToken;
pub use self::header::HeaderToken;

/// Reads a named token from request headers and writes it to response headers.
pub trait TokenTransport: Send + Sync {
    fn get_token(&self, headers: &HeaderMap, name: &str) -> Option<String>;

    /// Write `value` for `name`. An empty value with a negative
    /// `options.max_age` clears the token on the client.
    fn set_token(&self, headers: &mut HeaderMap, name: &str, value: &str, options: &SessionOptions);
}
