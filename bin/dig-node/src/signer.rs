//! Local stand-in for the wallet/keystore collaborator (§1 Non-goals).
//!
//! The real synthetic-key wallet is out of scope; this binary only
//! needs something that satisfies [`dig_replicate::KeySigner`] to drive
//! `push`, so it keeps an ed25519 keypair under the same config
//! directory the transport caches its mTLS identity in.

use dig_errors::{DigError, DigResult};
use dig_replicate::KeySigner;
use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::PathBuf;

pub struct LocalSigner {
    signing_key: SigningKey,
}

impl LocalSigner {
    pub fn load_or_generate() -> DigResult<Self> {
        let path = key_path()?;
        if let Ok(raw) = fs::read(&path) {
            if raw.len() == 32 {
                let bytes: [u8; 32] = raw.try_into().unwrap();
                return Ok(LocalSigner { signing_key: SigningKey::from_bytes(&bytes) });
            }
        }
        let signing_key = SigningKey::generate(&mut OsRng);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, signing_key.to_bytes())?;
        Ok(LocalSigner { signing_key })
    }
}

impl KeySigner for LocalSigner {
    fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    fn sign_hex(&self, message: &str) -> String {
        let signature: Signature = self.signing_key.sign(message.as_bytes());
        hex::encode(signature.to_bytes())
    }
}

fn key_path() -> DigResult<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("dig").join("identity").join("ownership.key"))
        .ok_or_else(|| DigError::resource("could not resolve user config directory".to_string()))
}
