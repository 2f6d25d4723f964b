//! HMAC-SHA256 signing of webhook bodies.
//!
//! The signature is computed over the exact request body with the webhook secret as key,
//! and sent as `BTCPay-Sig: sha256=<lowercase hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "BTCPay-Sig";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign a webhook body.
///
/// Returns `None` for an empty secret: such webhooks are sent unsigned.
pub fn sign_payload(body: &[u8], secret: &str) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes())))
}

/// Verify a `BTCPay-Sig` header value against a body, in constant time.
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Some(expected) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(expected) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_payload_format() {
        let signature = sign_payload(br#"{"type":"InvoiceCreated"}"#, "secret").unwrap();
        let hex_part = signature.strip_prefix("sha256=").unwrap();
        assert_eq!(hex_part.len(), 64);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let signature = sign_payload(b"what do ya want for nothing?", "Jefe").unwrap();
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"deliveryId":"abc"}"#;
        let signature = sign_payload(body, "s3cret").unwrap();

        assert!(verify_signature(body, &signature, "s3cret"));
        assert!(!verify_signature(body, &signature, "other"));
        assert!(!verify_signature(br#"{"deliveryId":"abd"}"#, &signature, "s3cret"));
    }

    #[test]
    fn test_verify_rejects_malformed() {
        let body = b"{}";
        assert!(!verify_signature(body, "md5=abcd", "secret"));
        assert!(!verify_signature(body, "sha256=not-hex", "secret"));
        assert!(!verify_signature(body, "sha256=abcd", "secret"));
    }

    #[test]
    fn test_empty_secret_is_unsigned() {
        assert_eq!(sign_payload(b"{}", ""), None);
    }
}
