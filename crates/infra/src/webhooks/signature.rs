//! HMAC-SHA256 webhook authentication.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC of the raw body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("signature is not valid hex")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies webhook bodies against a shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts any key length"),
        }
    }

    /// Lowercase hex signature of `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check `header` (bare hex or `sha256=<hex>`) against the HMAC of `body`.
    ///
    /// The digest comparison is constant-time.
    pub fn verify(&self, body: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
        let header = header.map(str::trim).filter(|h| !h.is_empty());
        let Some(header) = header else {
            return Err(SignatureError::Missing);
        };
        let hex_sig = header.strip_prefix("sha256=").unwrap_or(header);
        let expected = hex::decode(hex_sig).map_err(|_| SignatureError::Malformed)?;

        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"phone_number_id":"pn-1"}"#;

    #[test]
    fn accepts_bare_and_prefixed_hex() {
        let verifier = SignatureVerifier::new("secret");
        let sig = verifier.sign(BODY);

        assert_eq!(verifier.verify(BODY, Some(&sig)), Ok(()));
        assert_eq!(verifier.verify(BODY, Some(&format!("sha256={sig}"))), Ok(()));
        assert_eq!(verifier.verify(BODY, Some(&sig.to_uppercase())), Ok(()));
    }

    #[test]
    fn rejects_missing_malformed_and_wrong_signatures() {
        let verifier = SignatureVerifier::new("secret");

        assert_eq!(verifier.verify(BODY, None), Err(SignatureError::Missing));
        assert_eq!(verifier.verify(BODY, Some("  ")), Err(SignatureError::Missing));
        assert_eq!(verifier.verify(BODY, Some("zz")), Err(SignatureError::Malformed));

        let other = SignatureVerifier::new("other-secret").sign(BODY);
        assert_eq!(verifier.verify(BODY, Some(&other)), Err(SignatureError::Mismatch));

        let sig = verifier.sign(BODY);
        assert_eq!(
            verifier.verify(b"tampered", Some(&sig)),
            Err(SignatureError::Mismatch)
        );
        // Truncated digests never match.
        assert_eq!(
            verifier.verify(BODY, Some(&sig[..32])),
            Err(SignatureError::Mismatch)
        );
    }
}
