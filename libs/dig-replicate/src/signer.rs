//! Ownership signing boundary (§6).
//!
//! The wallet/keystore that actually holds the synthetic secret key is
//! an external collaborator (§1 Non-goals); this crate only defines the
//! message format and the trait a caller's signer must satisfy.

/// Implemented by the caller's wallet/keystore integration.
pub trait KeySigner: Send + Sync {
    fn public_key_hex(&self) -> String;
    /// Hex-encoded signature over `message`.
    fn sign_hex(&self, message: &str) -> String;
}

/// `"Signing this message to prove ownership of key.\n\nNonce: {nonce}"` (§6).
pub fn ownership_message(nonce: &str) -> String {
    format!("Signing this message to prove ownership of key.\n\nNonce: {nonce}")
}
