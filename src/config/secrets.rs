//! Secret handling utilities.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a connection URL with its password masked, for logs.
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return raw.to_string();
    };
    let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
    format!("{scheme}://{user}:***@{host}")
}
