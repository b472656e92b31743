use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::UpstreamError;

type HmacSha256 = Hmac<Sha256>;

/// Bearer tokens are short-lived; never sign one for longer than this.
const TOKEN_MAX_LIFETIME_SECS: i64 = 300;

const TOKEN_ISSUER: &str = "chatgate";
const TOKEN_AUDIENCE: &str = "upstream-assist";

/// Raw material fetched from the upstream's token endpoint.
#[derive(Debug, Clone)]
pub(crate) struct ServerToken {
    /// base64url-encoded signing key.
    pub token: String,
    pub key_id: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub(crate) struct BearerToken {
    pub value: String,
    pub expires_at: OffsetDateTime,
}

impl BearerToken {
    /// Usable unless absent or within the refresh skew of expiry.
    pub fn is_fresh(&self, now: OffsetDateTime, skew: std::time::Duration) -> bool {
        self.expires_at - skew > now
    }
}

/// Derive the signed bearer token from a fetched server token.
///
/// HS256 over `base64url(header).base64url(payload)`, key = base64url
/// decode of the server token; `exp` is clamped to the server expiry.
pub(crate) fn derive_bearer(
    csesidx: &str,
    server: &ServerToken,
    now: OffsetDateTime,
) -> Result<BearerToken, UpstreamError> {
    let expires_at = server
        .expires_at
        .min(now + std::time::Duration::from_secs(TOKEN_MAX_LIFETIME_SECS as u64));

    let header = serde_json::json!({
        "alg": "HS256",
        "typ": "JWT",
        "kid": server.key_id,
    });
    let payload = serde_json::json!({
        "iss": TOKEN_ISSUER,
        "aud": TOKEN_AUDIENCE,
        "sub": format!("csesidx/{csesidx}"),
        "iat": now.unix_timestamp(),
        "nbf": now.unix_timestamp(),
        "exp": expires_at.unix_timestamp(),
    });

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    );

    let key = URL_SAFE_NO_PAD
        .decode(&server.token)
        .map_err(|_| UpstreamError::Auth("server token is not base64url".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|_| UpstreamError::Auth("server token key rejected".to_string()))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(BearerToken {
        value: format!("{signing_input}.{signature}"),
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server_token(expires_in: Duration) -> ServerToken {
        ServerToken {
            token: URL_SAFE_NO_PAD.encode(b"0123456789abcdef0123456789abcdef"),
            key_id: "key-7".to_string(),
            expires_at: OffsetDateTime::now_utc() + expires_in,
        }
    }

    fn decode_segment(segment: &str) -> serde_json::Value {
        let raw = URL_SAFE_NO_PAD.decode(segment).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    #[test]
    fn bearer_has_expected_header_and_claims() {
        let now = OffsetDateTime::now_utc();
        let server = server_token(Duration::from_secs(600));
        let bearer = derive_bearer("idx-1", &server, now).unwrap();

        let segments: Vec<&str> = bearer.value.split('.').collect();
        assert_eq!(segments.len(), 3);

        let header = decode_segment(segments[0]);
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["typ"], "JWT");
        assert_eq!(header["kid"], "key-7");

        let payload = decode_segment(segments[1]);
        assert_eq!(payload["sub"], "csesidx/idx-1");
        assert_eq!(payload["iat"], payload["nbf"]);
        // Server expiry is 600s away; the 300s cap wins.
        assert_eq!(
            payload["exp"].as_i64().unwrap(),
            now.unix_timestamp() + TOKEN_MAX_LIFETIME_SECS
        );
    }

    #[test]
    fn nearer_server_expiry_wins_over_cap() {
        let now = OffsetDateTime::now_utc();
        let server = server_token(Duration::from_secs(120));
        let bearer = derive_bearer("idx-1", &server, now).unwrap();
        assert_eq!(bearer.expires_at, server.expires_at);
    }

    #[test]
    fn signature_verifies_with_server_key() {
        let now = OffsetDateTime::now_utc();
        let server = server_token(Duration::from_secs(600));
        let bearer = derive_bearer("idx-1", &server, now).unwrap();

        let (input, signature) = bearer.value.rsplit_once('.').unwrap();
        let key = URL_SAFE_NO_PAD.decode(&server.token).unwrap();
        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(input.as_bytes());
        let expected = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        assert_eq!(signature, expected);
    }

    #[test]
    fn freshness_respects_skew() {
        let now = OffsetDateTime::now_utc();
        let bearer = BearerToken {
            value: String::new(),
            expires_at: now + Duration::from_secs(20),
        };
        assert!(bearer.is_fresh(now, Duration::from_secs(10)));
        assert!(!bearer.is_fresh(now, Duration::from_secs(30)));
    }

    #[test]
    fn invalid_server_token_is_auth_error() {
        let now = OffsetDateTime::now_utc();
        let server = ServerToken {
            token: "not base64url!!!".to_string(),
            key_id: "k".to_string(),
            expires_at: now + Duration::from_secs(60),
        };
        assert!(matches!(
            derive_bearer("idx", &server, now),
            Err(UpstreamError::Auth(_))
        ));
    }
}
