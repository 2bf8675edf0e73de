use cookie::time::{Duration, OffsetDateTime};
use cookie::Cookie;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};
use tracing::warn;

use super::TokenTransport;
use crate::config::{SameSite, SessionOptions};

/// Carries the token in a cookie named after the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct CookieToken;

impl CookieToken {
    fn build(name: &str, value: &str, options: &SessionOptions) -> Cookie<'static> {
        let mut builder = Cookie::build((name.to_string(), value.to_string()))
            .path(options.path.clone())
            .secure(options.secure)
            .http_only(options.http_only);
        if let Some(domain) = &options.domain {
            builder = builder.domain(domain.clone());
        }
        if let Some(same_site) = options.same_site {
            builder = builder.same_site(match same_site {
                SameSite::Strict => cookie::SameSite::Strict,
                SameSite::Lax => cookie::SameSite::Lax,
                SameSite::None => cookie::SameSite::None,
            });
        }

        let mut cookie = builder.build();
        if options.max_age < 0 {
            cookie.make_removal();
        } else if options.max_age > 0 {
            let max_age = Duration::seconds(options.max_age);
            cookie.set_max_age(max_age);
            cookie.set_expires(OffsetDateTime::now_utc() + max_age);
        }
        cookie
    }
}

impl TokenTransport for CookieToken {
    fn get_token(&self, headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(Result::ok)
            .find(|cookie| cookie.name() == name)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty())
    }

    fn set_token(&self, headers: &mut HeaderMap, name: &str, value: &str, options: &SessionOptions) {
        let cookie = Self::build(name, value, options);
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(header) => {
                headers.append(SET_COOKIE, header);
            }
            Err(e) => warn!("Dropping unrepresentable cookie {}: {}", name, e),
        }
    }
}
