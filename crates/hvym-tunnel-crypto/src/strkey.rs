//! Stellar strkey encoding for Ed25519 public keys.
//!
//! An address is `base32(version_byte || key || crc16)` where the version
//! byte for Ed25519 public keys is `0x30` (which makes every address start
//! with `G`) and the checksum is CRC16-XMODEM over `version_byte || key`,
//! appended little-endian. 35 payload bytes encode to exactly 56 base32
//! characters, so no padding is involved.

use crate::error::CryptoError;

const VERSION_ED25519_PUBLIC: u8 = 6 << 3; // 0x30, 'G'
const ADDRESS_LEN: usize = 56;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Encode a raw Ed25519 public key as a `G...` address.
pub fn encode_ed25519_public(key: &[u8; 32]) -> String {
    let mut payload = [0u8; 35];
    payload[0] = VERSION_ED25519_PUBLIC;
    payload[1..33].copy_from_slice(key);
    let crc = crc16_xmodem(&payload[..33]);
    payload[33..35].copy_from_slice(&crc.to_le_bytes());
    base32_encode(&payload)
}

/// Decode a `G...` address back into the raw Ed25519 public key,
/// verifying version byte and checksum.
pub fn decode_ed25519_public(address: &str) -> Result<[u8; 32], CryptoError> {
    if address.len() != ADDRESS_LEN {
        return Err(CryptoError::InvalidAddress(format!(
            "wrong length {} (expected {ADDRESS_LEN})",
            address.len()
        )));
    }
    let payload = base32_decode(address)?;
    if payload[0] != VERSION_ED25519_PUBLIC {
        return Err(CryptoError::InvalidAddress(format!(
            "wrong version byte {:#04x}",
            payload[0]
        )));
    }
    let expected = crc16_xmodem(&payload[..33]);
    let actual = u16::from_le_bytes([payload[33], payload[34]]);
    if expected != actual {
        return Err(CryptoError::InvalidAddress("checksum mismatch".into()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&payload[1..33]);
    Ok(key)
}

/// CRC16-XMODEM: polynomial 0x1021, initial value 0.
fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn base32_encode(data: &[u8; 35]) -> String {
    let mut out = String::with_capacity(ADDRESS_LEN);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = ((buffer >> bits) & 0x1f) as usize;
            out.push(BASE32_ALPHABET[index] as char);
        }
    }
    // 35 bytes = 280 bits = 56 groups of 5, nothing left over
    out
}

fn base32_decode(text: &str) -> Result<[u8; 35], CryptoError> {
    let mut out = [0u8; 35];
    let mut written = 0;
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for ch in text.bytes() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a == ch)
            .ok_or_else(|| {
                CryptoError::InvalidAddress(format!("invalid character {:?}", ch as char))
            })?;
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out[written] = ((buffer >> bits) & 0xff) as u8;
            written += 1;
        }
    }
    debug_assert_eq!(written, 35);
    Ok(out)
}
