//! Ephemeral client identity for the mTLS transport (§4.6 supplement).
//!
//! Generated once per process install and cached under the user config
//! directory; certificate issuance itself is the only piece of this
//! that is an external collaborator (full CA-grade issuance), so this
//! module only produces a self-signed leaf via a general-purpose crate.

use dig_errors::{DigError, DigResult};
use std::fs;
use std::path::PathBuf;

pub struct IdentityMaterial {
    cert_pem: String,
    key_pem: String,
}

impl IdentityMaterial {
    /// Load the cached identity if present, otherwise generate and
    /// persist a fresh one.
    pub fn load_or_generate() -> DigResult<Self> {
        let dir = identity_dir()?;
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        if cert_path.is_file() && key_path.is_file() {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = fs::read_to_string(&key_path)?;
            return Ok(IdentityMaterial { cert_pem, key_pem });
        }

        let generated = Self::generate()?;
        fs::create_dir_all(&dir)?;
        fs::write(&cert_path, &generated.cert_pem)?;
        fs::write(&key_path, &generated.key_pem)?;
        Ok(generated)
    }

    fn generate() -> DigResult<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["dig-peer".to_string()])
            .map_err(|e| DigError::resource(format!("failed to generate identity: {e}")))?;
        let cert_pem = cert.cert.pem();
        let key_pem = cert.key_pair.serialize_pem();
        Ok(IdentityMaterial { cert_pem, key_pem })
    }

    /// Combine the leaf certificate and its private key into the PEM
    /// bundle `reqwest::Identity` expects for a client certificate.
    pub fn to_reqwest_identity(&self) -> DigResult<reqwest::Identity> {
        let combined = format!("{}{}", self.cert_pem, self.key_pem);
        reqwest::Identity::from_pem(combined.as_bytes())
            .map_err(|e| DigError::resource(format!("failed to load identity into client: {e}")))
    }

    /// The same self-signed leaf, as PEM bytes, for presenting server-side
    /// (content/propagation servers terminate TLS with this identity too).
    pub fn cert_pem_bytes(&self) -> &[u8] {
        self.cert_pem.as_bytes()
    }

    pub fn key_pem_bytes(&self) -> &[u8] {
        self.key_pem.as_bytes()
    }
}

pub fn identity_dir() -> DigResult<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("dig").join("identity"))
        .ok_or_else(|| DigError::resource("could not resolve user config directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_converts_to_reqwest_identity() {
        let identity = IdentityMaterial::generate().unwrap();
        assert!(identity.to_reqwest_identity().is_ok());
    }
}
