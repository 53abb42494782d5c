//! Wire shapes for the subscriber protocol (spec.md §6) and the client-side
//! WebSocket URL derivation rule.

use serde::Deserialize;

use crate::core::errors::ApiError;

#[derive(Debug, Deserialize)]
pub struct WsIncomingMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Derives the subscriber WebSocket URL from an HTTP(S) API base URL:
/// `https:` substitutes to `wss:`, anything else to `ws:`, host and port
/// are preserved, and `/ws` is appended. Default ports (`:443` for https,
/// `:80` for http) must not appear in the result, matching whatever the
/// `url` crate itself omits for a default port.
pub fn derive_ws_url(api_base_url: &str) -> Result<String, ApiError> {
    let parsed = url::Url::parse(api_base_url)
        .map_err(|e| ApiError::validation("api_base_url", format!("invalid URL: {}", e)))?;

    let ws_scheme = if parsed.scheme() == "https" { "wss" } else { "ws" };

    let host = parsed
        .host_str()
        .ok_or_else(|| ApiError::validation("api_base_url", "URL has no host"))?;

    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let path = parsed.path().trim_end_matches('/');
    Ok(format!("{ws_scheme}://{authority}{path}/ws"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_becomes_wss_and_preserves_host_and_port() {
        assert_eq!(
            derive_ws_url("https://api.host:3000").unwrap(),
            "wss://api.host:3000/ws"
        );
    }

    #[test]
    fn http_becomes_ws_without_a_default_port() {
        assert_eq!(derive_ws_url("http://example.com").unwrap(), "ws://example.com/ws");
    }

    #[test]
    fn an_unparsable_url_is_rejected() {
        assert!(derive_ws_url("not a url").is_err());
    }
}
