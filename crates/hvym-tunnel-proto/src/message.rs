//! Typed wire messages exchanged between the tunnel client and the relay.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn default_path() -> String {
    "/".to_string()
}

/// A single protocol message. Serialized as a JSON object with a `type`
/// tag in `snake_case`; optional fields are omitted entirely when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Relay → client, sent immediately after the connection opens.
    /// The nonce is single-use and must be signed exactly as issued.
    Challenge { nonce: String },

    /// Client → relay: proof of possession of the keypair behind `address`.
    /// `signature` is base64 of `sign(base64-decode(nonce))`.
    Auth {
        address: String,
        nonce: String,
        signature: String,
    },

    /// Relay → client on successful authentication.
    AuthOk { token: String, endpoint: String },

    /// Relay → client on rejected authentication; the relay closes the
    /// transport afterwards.
    AuthError { reason: String },

    /// Client → relay: the full service-name → local-port map for this
    /// session. Sent once after `auth_ok`; re-sends are idempotent
    /// (last bind wins on the relay side).
    Bind { services: BTreeMap<String, u16> },

    /// Relay → client: bindings accepted.
    BindOk,

    /// Relay → client: a public HTTP request to forward to a bound
    /// local service. Correlated with its eventual `response`/`error`
    /// by `id`; `body` is base64 when present.
    Request {
        id: String,
        service: String,
        method: String,
        #[serde(default = "default_path")]
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    /// Client → relay: the local service's answer for `id`.
    Response {
        id: String,
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    /// Either direction. `id` is present for request-scoped failures
    /// (unknown service, local timeout) and absent for session-level ones.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        reason: String,
    },

    /// Keepalive probe; either side may initiate.
    Ping,

    /// Keepalive answer.
    Pong,
}

impl Message {
    /// Request-scoped error helper.
    pub fn request_error(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Error {
            id: Some(id.into()),
            reason: reason.into(),
        }
    }

    /// The wire `type` tag for this message, for logs and error text.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Challenge { .. } => "challenge",
            Self::Auth { .. } => "auth",
            Self::AuthOk { .. } => "auth_ok",
            Self::AuthError { .. } => "auth_error",
            Self::Bind { .. } => "bind",
            Self::BindOk => "bind_ok",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_carry_snake_case_type_tag() {
        let msg = Message::Challenge {
            nonce: "bm9uY2U=".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "challenge", "nonce": "bm9uY2U="}));
    }

    #[test]
    fn ping_and_pong_are_bare_objects() {
        assert_eq!(
            serde_json::to_value(Message::Ping).unwrap(),
            json!({"type": "ping"})
        );
        assert_eq!(
            serde_json::from_value::<Message>(json!({"type": "pong"})).unwrap(),
            Message::Pong
        );
    }

    #[test]
    fn bind_carries_full_service_map() {
        let msg = Message::Bind {
            services: [("pintheon".to_string(), 9998)].into_iter().collect(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "bind", "services": {"pintheon": 9998}})
        );
    }

    #[test]
    fn absent_body_is_omitted_not_null() {
        let msg = Message::Response {
            id: "r1".into(),
            status: 204,
            headers: BTreeMap::new(),
            body: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("body").is_none());
        assert_eq!(value["status"], 204);
    }

    #[test]
    fn request_defaults_path_and_headers() {
        let msg: Message = serde_json::from_value(json!({
            "type": "request",
            "id": "r1",
            "service": "pintheon",
            "method": "GET",
        }))
        .unwrap();
        match msg {
            Message::Request {
                path,
                query,
                headers,
                body,
                ..
            } => {
                assert_eq!(path, "/");
                assert!(query.is_none());
                assert!(headers.is_empty());
                assert!(body.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn session_level_error_omits_id() {
        let msg = Message::Error {
            id: None,
            reason: "relay shutting down".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("id").is_none());

        let scoped = Message::request_error("r9", "unknown service");
        let value = serde_json::to_value(&scoped).unwrap();
        assert_eq!(value["id"], "r9");
    }

    #[test]
    fn auth_round_trips() {
        let msg = Message::Auth {
            address: "GA7QYNF7SOWQ3GLR2BGMZEHXAVIRZA4KVWLTJJFC7MGXUA74P7UJVSGZ".into(),
            nonce: "bm9uY2U=".into(),
            signature: "c2ln".into(),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }
}
