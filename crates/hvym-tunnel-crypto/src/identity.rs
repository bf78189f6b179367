//! Signing identity trait and the Ed25519 keypair implementation.
//!
//! The tunnel engine receives a [`SigningIdentity`] (a public address plus
//! a sign capability) and nothing else. [`StellarKeyPair`] is the concrete
//! on-disk implementation used by the headless runner; callers with their
//! own wallet stack can supply any other implementation.

use std::path::Path;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::strkey;

/// A public address plus the capability to sign bytes with the matching
/// secret key. Immutable for the life of a session; safe to call from
/// concurrent tasks.
pub trait SigningIdentity: Send + Sync {
    /// The strkey-encoded public address (`G...`).
    fn address(&self) -> String;

    /// Sign a message, returning the raw 64-byte Ed25519 signature.
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// An Ed25519 keypair whose public half is a Stellar-style `G...` address.
pub struct StellarKeyPair {
    signing: SigningKey,
    address: String,
}

impl std::fmt::Debug for StellarKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StellarKeyPair")
            .field("address", &self.address)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl StellarKeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let signing = SigningKey::from_bytes(&arr);
        arr.zeroize();
        Ok(Self::from_signing_key(signing))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let address = strkey::encode_ed25519_public(signing.verifying_key().as_bytes());
        Self { signing, address }
    }

    /// Raw public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.signing.verifying_key().as_bytes()
    }

    /// Raw secret key bytes. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Save the secret key to a file with restrictive permissions.
    pub fn save_to_file(&self, path: &Path) -> Result<(), CryptoError> {
        let dir = path.parent().ok_or_else(|| {
            CryptoError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path has no parent directory",
            ))
        })?;
        std::fs::create_dir_all(dir)?;

        let mut bytes = self.secret_bytes();
        std::fs::write(path, bytes)?;
        bytes.zeroize();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load a keypair from a file containing the 32-byte secret key.
    ///
    /// Reads into a fixed-size array so no heap allocation ever holds key
    /// material. On Unix, refuses key files readable by anyone but the owner.
    pub fn load_from_file(path: &Path) -> Result<Self, CryptoError> {
        use std::io::Read;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = std::fs::metadata(path)?;
            let mode = metadata.permissions().mode() & 0o777;
            if mode != 0o600 {
                return Err(CryptoError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("Identity key file has insecure permissions: {mode:o} (expected 600)"),
                )));
            }
        }

        let mut file = std::fs::File::open(path)?;
        let mut buf = [0u8; 32];
        file.read_exact(&mut buf)?;
        let result = Self::from_secret_bytes(&buf);
        buf.zeroize();
        result
    }

    /// Load from file, or generate a new keypair and save it.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            let kp = Self::generate();
            kp.save_to_file(path)?;
            Ok(kp)
        }
    }
}

impl SigningIdentity for StellarKeyPair {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

/// Verify a signature against a strkey address. Used by the relay side of
/// the handshake; the client only ever signs.
pub fn verify_signature(address: &str, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = strkey::decode_ed25519_public(address) else {
        return false;
    };
    let Ok(verifying) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    verifying.verify(message, &sig).is_ok()
}
