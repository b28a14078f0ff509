//! Webhook delivery authentication.
//!
//! The forge signs every delivery with HMAC-SHA256 over the raw request body
//! and announces the digest in the `X-Hub-Signature-256` header. The secret
//! is wrapped in [`WebhookSecret`] so handlers can only check deliveries
//! against it, never read it back out; checking happens before any payload
//! parsing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header prefix announcing the digest algorithm.
const DIGEST_PREFIX: &str = "sha256=";

/// The shared webhook secret, exposing only signing and verification.
pub struct WebhookSecret {
    key: Vec<u8>,
}

impl WebhookSecret {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        WebhookSecret { key: key.into() }
    }

    /// Checks a delivery against its `X-Hub-Signature-256` header.
    ///
    /// Malformed headers (wrong algorithm prefix, bad hex) fail verification
    /// rather than erroring; the digest comparison itself is constant-time.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> bool {
        let Some(hex_digest) = signature_header.strip_prefix(DIGEST_PREFIX) else {
            return false;
        };
        let Ok(claimed) = hex::decode(hex_digest) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&claimed).is_ok()
    }

    /// Produces the header value the forge would send for `payload`.
    ///
    /// This is the test double for the forge's side of the handshake; the
    /// bot itself only ever verifies.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(payload);
        format!("{}{}", DIGEST_PREFIX, hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSecret").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secret() -> WebhookSecret {
        WebhookSecret::new(*b"a shared secret")
    }

    #[test]
    fn own_signatures_verify() {
        let body = br#"{"action":"created"}"#;
        let header = secret().sign(body);
        assert!(secret().verify(body, &header));
    }

    #[test]
    fn header_must_carry_the_algorithm_prefix() {
        let body = b"payload";
        let header = secret().sign(body);
        let bare_digest = header.strip_prefix(DIGEST_PREFIX).unwrap();

        assert!(!secret().verify(body, bare_digest));
        assert!(!secret().verify(body, &format!("sha1={}", bare_digest)));
    }

    #[test]
    fn garbage_headers_fail_without_panicking() {
        let body = b"payload";
        for header in ["", "sha256=", "sha256=zz", "sha256=abc", "=", "sha256"] {
            assert!(!secret().verify(body, header), "accepted {:?}", header);
        }
    }

    #[test]
    fn different_secrets_disagree() {
        let body = b"payload";
        let header = WebhookSecret::new(*b"one secret").sign(body);
        assert!(!WebhookSecret::new(*b"another secret").verify(body, &header));
    }

    proptest! {
        /// Whatever the body and key, a signature made with the key verifies.
        #[test]
        fn signing_and_verifying_agree(body: Vec<u8>, key: Vec<u8>) {
            let secret = WebhookSecret::new(key);
            let header = secret.sign(&body);
            prop_assert!(secret.verify(&body, &header));
        }

        /// Flipping any single bit of the body breaks verification.
        #[test]
        fn any_bitflip_is_detected(body: Vec<u8>, key: Vec<u8>, pos: usize, bit: u8) {
            prop_assume!(!body.is_empty());
            let secret = WebhookSecret::new(key);
            let header = secret.sign(&body);

            let mut tampered = body.clone();
            let idx = pos % tampered.len();
            tampered[idx] ^= 1 << (bit % 8);

            prop_assert!(!secret.verify(&tampered, &header));
        }

        /// Arbitrary header strings never panic the checker.
        #[test]
        fn arbitrary_headers_are_handled(body: Vec<u8>, key: Vec<u8>, header: String) {
            let _ = WebhookSecret::new(key).verify(&body, &header);
        }
    }
}
