//! Purchase signature verification.
//!
//! The reconciler never advances a product to `Purchased` without a positive
//! answer from a [`SignatureVerifier`].

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Capability: check that `signature` was produced over `payload` by the
/// holder of `public_key`.
pub trait SignatureVerifier: Send {
    fn verify(&self, public_key: &str, payload: &str, signature: &str) -> bool;
}

/// Ed25519 verification with hex-encoded key (32 bytes) and signature (64 bytes).
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &str, payload: &str, signature: &str) -> bool {
        let key = match decode_fixed::<32>(public_key) {
            Some(bytes) => bytes,
            None => {
                log::error!("[VERIFIER] malformed public key");
                return false;
            }
        };
        let key = match VerifyingKey::from_bytes(&key) {
            Ok(key) => key,
            Err(e) => {
                log::error!("[VERIFIER] rejected public key: {}", e);
                return false;
            }
        };
        let sig = match decode_fixed::<64>(signature) {
            Some(bytes) => Signature::from_bytes(&bytes),
            None => {
                log::warn!("[VERIFIER] malformed signature");
                return false;
            }
        };

        key.verify(payload.as_bytes(), &sig).is_ok()
    }
}

fn decode_fixed<const N: usize>(s: &str) -> Option<[u8; N]> {
    let bytes = hex::decode(s.trim()).ok()?;
    bytes.try_into().ok()
}
