use http::header::HeaderName;
use http::{HeaderMap, HeaderValue};
use tracing::warn;

use super::TokenTransport;
use crate::config::SessionOptions;

const DEFAULT_HEADER: &str = "x-session-token";

/// Carries the token in a plain header, for clients that do not keep cookies.
///
/// One header holds one token, so the session name only takes part in the
/// codec binding. Clearing writes an empty value.
#[derive(Debug, Clone)]
pub struct HeaderToken {
    header: HeaderName,
}

impl HeaderToken {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }
}

impl Default for HeaderToken {
    fn default() -> Self {
        Self::new(HeaderName::from_static(DEFAULT_HEADER))
    }
}

impl TokenTransport for HeaderToken {
    fn get_token(&self, headers: &HeaderMap, _name: &str) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn set_token(&self, headers: &mut HeaderMap, name: &str, value: &str, options: &SessionOptions) {
        let value = if options.max_age < 0 { "" } else { value };
        match HeaderValue::from_str(value) {
            Ok(header) => {
                headers.insert(self.header.clone(), header);
            }
            Err(e) => warn!("Dropping unrepresentable token for {}: {}", name, e),
        }
    }
}
