//! Host-supplied authentication seam

use crate::error::PbxResult;
use crate::message::Message;
use async_trait::async_trait;

/// Digest material extracted from a `user.auth` request.
///
/// `address` is the bare IP of the requesting endpoint: the head of the
/// message's `address` parameter (which may carry `ip:port`), falling back
/// to `ip_host`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    pub uri: String,
    pub realm: String,
    pub nonce: String,
    pub method: String,
    /// Digest algorithm; the engine omits it for plain MD5.
    pub algorithm: String,
    pub response: String,
    pub address: String,
}

impl AuthRequest {
    pub(crate) fn from_message(msg: &Message) -> Self {
        let address = msg
            .param("address")
            .map(|a| a.split(':').next().unwrap_or(a))
            .or_else(|| msg.param("ip_host"))
            .unwrap_or("")
            .to_string();
        AuthRequest {
            username: msg.param("username").unwrap_or("").to_string(),
            password: msg.param("password").unwrap_or("").to_string(),
            uri: msg.param("uri").unwrap_or("").to_string(),
            realm: msg.param("realm").unwrap_or("").to_string(),
            nonce: msg.param("nonce").unwrap_or("").to_string(),
            method: msg.param("method").unwrap_or("").to_string(),
            algorithm: msg.param("algorithm").unwrap_or("md5").to_string(),
            response: msg.param("response").unwrap_or("").to_string(),
            address,
        }
    }
}

/// The host's authentication policy.
///
/// The session calls this off its own task with the configured
/// `authenticate_timeout` attached; a timeout or an `Err` denies the request
/// and surfaces an error event. Returning `Ok(true)` accepts the digest,
/// `Ok(false)` rejects it.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: AuthRequest) -> PbxResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::collections::HashMap;

    fn auth_msg(params: &[(&str, &str)]) -> Message {
        let params: HashMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Message::from_parts("user.auth", "a1", MessageKind::Request { time: 1 }, "", params)
    }

    #[test]
    fn test_digest_extraction() {
        let msg = auth_msg(&[
            ("username", "alice"),
            ("uri", "sip:pbx.example"),
            ("realm", "pbx.example"),
            ("nonce", "abc123"),
            ("method", "REGISTER"),
            ("response", "deadbeef"),
            ("address", "10.1.2.3:5060"),
        ]);
        let req = AuthRequest::from_message(&msg);
        assert_eq!(req.username, "alice");
        assert_eq!(req.realm, "pbx.example");
        assert_eq!(req.nonce, "abc123");
        assert_eq!(req.method, "REGISTER");
        assert_eq!(req.response, "deadbeef");
        assert_eq!(req.algorithm, "md5");
        assert_eq!(req.address, "10.1.2.3");
    }

    #[test]
    fn test_address_falls_back_to_ip_host() {
        let msg = auth_msg(&[("username", "bob"), ("ip_host", "192.0.2.8")]);
        let req = AuthRequest::from_message(&msg);
        assert_eq!(req.address, "192.0.2.8");
    }

    #[test]
    fn test_explicit_algorithm_kept() {
        let msg = auth_msg(&[("algorithm", "sha-256")]);
        let req = AuthRequest::from_message(&msg);
        assert_eq!(req.algorithm, "sha-256");
    }
}
