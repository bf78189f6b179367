//! Signing identity for the HVYM tunnel client.
//!
//! The tunnel authenticates by proving possession of an Ed25519 keypair:
//! the relay issues a nonce and the client returns a signature over it.
//! Addresses use Stellar strkey encoding (`G...`), so a tunnel identity is
//! interchangeable with a Stellar account address.
//!
//! The engine itself only ever sees the [`SigningIdentity`] trait; key
//! custody stays with whoever constructs the concrete keypair.

pub mod error;
pub mod identity;
pub mod strkey;

pub use error::CryptoError;
pub use identity::{SigningIdentity, StellarKeyPair, verify_signature};
pub use strkey::{decode_ed25519_public, encode_ed25519_public};
