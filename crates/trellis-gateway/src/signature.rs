use hmac::{Hmac, Mac};
use sha2::Sha256;

use trellis_core::error::{Result, TrellisError};

type HmacSha256 = Hmac<Sha256>;

/// Canonical serialization of a trigger payload.
///
/// serde_json's object map is ordered by key, so `to_string` yields the same
/// bytes for the same payload regardless of how the sender ordered its
/// fields. Signatures are computed over exactly these bytes.
pub fn canonical_body(payload: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

fn mac_for(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TrellisError::Config(format!("hmac key: {}", e)))
}

/// Hex-encoded HMAC-SHA256 of the canonical payload. What a sender must put
/// in `X-Webhook-Signature`.
pub fn sign(secret: &str, payload: &serde_json::Value) -> Result<String> {
    let body = canonical_body(payload)?;
    let mut mac = mac_for(secret)?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time signature check (`Mac::verify_slice`). Malformed hex is
/// simply a failed verification, never an error to the caller.
pub fn verify(secret: &str, payload: &serde_json::Value, signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(body) = canonical_body(payload) else {
        return false;
    };
    let Ok(mut mac) = mac_for(secret) else {
        return false;
    };
    mac.update(body.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sign_and_verify_round_trip() {
        let payload = json!({"order": 42, "customer": "acme"});
        let sig = sign("topsecret", &payload).unwrap();
        assert_eq!(sig.len(), 64); // sha256 hex
        assert!(verify("topsecret", &payload, &sig));
    }

    #[test]
    fn key_order_does_not_matter() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(
            sign("k", &a).unwrap(),
            sign("k", &b).unwrap(),
            "canonical form must be order-insensitive"
        );
    }

    #[test]
    fn any_tamper_fails() {
        let payload = json!({"amount": 100});
        let sig = sign("k", &payload).unwrap();

        // Tampered payload
        assert!(!verify("k", &json!({"amount": 101}), &sig));

        // Every single-character corruption of the signature fails
        for i in 0..sig.len() {
            let mut bytes = sig.clone().into_bytes();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            let Ok(tampered) = String::from_utf8(bytes) else {
                continue;
            };
            if tampered != sig {
                assert!(!verify("k", &payload, &tampered));
            }
        }

        // Wrong secret
        assert!(!verify("other", &payload, &sig));
    }

    #[test]
    fn malformed_signature_is_rejected_not_an_error() {
        let payload = json!({});
        assert!(!verify("k", &payload, "not-hex"));
        assert!(!verify("k", &payload, ""));
        assert!(!verify("k", &payload, "abcd")); // wrong length
    }
}
