//! ICE server lists and relay credentials
//!
//! Servers come either from the static configuration list or, when a
//! relay-credentials endpoint is configured, from an authenticated GET that
//! returns `{"iceServers": ...}`. The fetched value is used verbatim.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One STUN/TURN server entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Accepts a single URL string or a list.
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Where a negotiation gets its server list from.
#[derive(Debug, Clone, Default)]
pub struct IceServerSource {
    pub static_servers: Vec<IceServer>,
    pub relay_credentials_url: Option<String>,
    pub token: Option<String>,
}

impl IceServerSource {
    /// Resolve the server list for one negotiation. A failed fetch falls
    /// back to the static list.
    pub async fn resolve(&self) -> Vec<IceServer> {
        let Some(url) = self.relay_credentials_url.as_deref() else {
            return self.static_servers.clone();
        };
        match fetch_ice_servers(url, self.token.as_deref()).await {
            Ok(servers) => {
                debug!("Fetched {} relay server entries from {}", servers.len(), url);
                servers
            }
            Err(e) => {
                warn!("Relay credential fetch failed, using static ICE servers: {}", e);
                self.static_servers.clone()
            }
        }
    }
}

/// GET the relay-credentials endpoint.
pub async fn fetch_ice_servers(url: &str, token: Option<&str>) -> Result<Vec<IceServer>, String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| format!("http client: {}", e))?;

    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| format!("GET {}: {}", url, e))?;
    if !response.status().is_success() {
        return Err(format!("GET {}: HTTP {}", url, response.status()));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| format!("GET {}: invalid JSON: {}", url, e))?;
    parse_relay_response(&body)
}

/// Extract the server list from a relay-credentials response body.
pub fn parse_relay_response(body: &Value) -> Result<Vec<IceServer>, String> {
    let servers = body
        .get("iceServers")
        .ok_or_else(|| "response has no iceServers".to_string())?;
    let parsed = match servers {
        Value::Array(_) => serde_json::from_value(servers.clone()),
        Value::Object(_) => serde_json::from_value(servers.clone()).map(|server| vec![server]),
        _ => return Err("iceServers is neither an object nor an array".to_string()),
    };
    parsed.map_err(|e| format!("invalid iceServers: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_object_becomes_one_entry() {
        let body = json!({
            "iceServers": {
                "urls": ["turn:relay.example.com:3478"],
                "username": "1700000000:u1",
                "credential": "secret"
            }
        });
        let servers = parse_relay_response(&body).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username.as_deref(), Some("1700000000:u1"));
    }

    #[test]
    fn array_and_single_url_string_are_accepted() {
        let body = json!({
            "iceServers": [
                {"urls": "stun:stun.example.com:3478"},
                {"urls": ["turn:a:3478", "turns:a:5349"], "username": "u", "credential": "p"}
            ]
        });
        let servers = parse_relay_response(&body).unwrap();
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(servers[1].urls.len(), 2);
    }

    #[test]
    fn missing_servers_is_an_error() {
        assert!(parse_relay_response(&json!({"ok": true})).is_err());
        assert!(parse_relay_response(&json!({"iceServers": 5})).is_err());
    }

    #[tokio::test]
    async fn static_list_is_used_without_endpoint() {
        let source = IceServerSource {
            static_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                ..Default::default()
            }],
            relay_credentials_url: None,
            token: None,
        };
        assert_eq!(source.resolve().await, source.static_servers);
    }
}
