//! Unverified JWT payload decoding.
//!
//! Access and id tokens are consumed only as bearer strings forwarded
//! upstream; their payloads are treated as untrusted but self-describing.
//! Fields drive display and scheduling metadata, nothing security-sensitive,
//! so no signature verification happens here. Authorization stays with the
//! upstream.

use crate::models::Plan;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::Value;

const AUTH_CLAIM: &str = "https://api.openai.com/auth";
const PROFILE_CLAIM: &str = "https://api.openai.com/profile";

/// Decode the payload segment of a JWT into a JSON object.
///
/// Anything malformed (wrong segment count, bad base64, bad JSON) yields an
/// empty object; callers then fall back to field defaults.
pub fn decode_jwt_payload(token: &str) -> Value {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_), Some(payload)) => payload,
        _ => return Value::Object(Default::default()),
    };
    URL_SAFE_NO_PAD
        .decode(payload)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| Value::Object(Default::default()))
}

/// Claim-derived account fields. Missing claims degrade to defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenClaims {
    pub email: String,
    pub plan: Plan,
    pub user_id: String,
    /// `exp` in milliseconds since epoch; 0 when absent.
    pub expires_at_ms: i64,
}

/// Derive account fields from an id token and access token pair.
///
/// The id token is preferred for identity fields, the access token for
/// expiry, matching what the upstream CLI itself persists.
pub fn derive_claims(id_token: &str, access_token: &str) -> TokenClaims {
    let id_payload = decode_jwt_payload(id_token);
    let at_payload = decode_jwt_payload(access_token);
    let empty = Value::Object(Default::default());

    let auth_claims = id_payload
        .get(AUTH_CLAIM)
        .or_else(|| at_payload.get(AUTH_CLAIM))
        .unwrap_or(&empty);
    let profile_claims = at_payload.get(PROFILE_CLAIM).unwrap_or(&empty);

    let email = id_payload
        .get("email")
        .or_else(|| profile_claims.get("email"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let plan = auth_claims
        .get("chatgpt_plan_type")
        .and_then(|v| v.as_str())
        .map(Plan::from_claim)
        .unwrap_or_default();

    let user_id = auth_claims
        .get("chatgpt_user_id")
        .or_else(|| id_payload.get("sub"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let exp = at_payload
        .get("exp")
        .or_else(|| id_payload.get("exp"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    TokenClaims {
        email,
        plan,
        user_id,
        expires_at_ms: exp * 1000,
    }
}

#[cfg(test)]
pub(crate) fn encode_test_jwt(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).expect("payload json"));
    format!("{header}.{body}.sig")
}
