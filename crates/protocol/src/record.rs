//! Post-handshake record layer.
//!
//! Every record on the wire is `[MAC:16][encrypted length:2][ciphertext]`.
//! The length field and the payload are encrypted with the sender's
//! continuous counter-mode keystream, then authenticated: the MAC covers an
//! implicit per-direction record counter, the encrypted length, and the
//! ciphertext, and is truncated to 16 bytes. The counter never crosses the
//! wire, so replayed or reordered records fail authentication.
//!
//! A MAC mismatch drops the record but keeps the session alive; the
//! receiver's keystream is advanced over the rejected ciphertext so both
//! ends stay aligned.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ctr::CtrCipher;
use crate::error::{ProtocolError, Result};
use crate::frames::NONCE_LENGTH;
use crate::hkdf;

/// Size of the truncated record MAC.
pub const MAC_SIZE: usize = 16;

/// Size of the record prefix: MAC plus encrypted length.
pub const RECORD_PREFIX_SIZE: usize = MAC_SIZE + 2;

/// Largest payload one record can carry.
pub const MAX_RECORD_PAYLOAD: usize = u16::MAX as usize;

/// Cipher IV size in bytes.
pub const IV_SIZE: usize = 16;

/// Cipher key size in bytes.
pub const KEY_SIZE: usize = 16;

/// MAC key size in bytes.
pub const MAC_KEY_SIZE: usize = 64;

type HmacSha256 = Hmac<Sha256>;

/// Key material for one direction of traffic.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    /// Counter-mode IV.
    pub iv: [u8; IV_SIZE],
    /// Cipher key.
    pub key: [u8; KEY_SIZE],
    /// Record MAC key.
    pub mac_key: [u8; MAC_KEY_SIZE],
}

/// Both directions' key material, as derived from the handshake.
pub struct SessionKeys {
    /// Keys the server sends with and the client receives with.
    pub server: DirectionKeys,
    /// Keys the client sends with and the server receives with.
    pub client: DirectionKeys,
}

impl SessionKeys {
    /// Derives both directions from the key-agreement secret and the
    /// handshake nonces.
    ///
    /// The salt is server nonce followed by client nonce, so both ends must
    /// agree on nonce ordering, not just values. Server keys occupy the
    /// first half of the output.
    pub fn derive(
        shared_secret: &[u8],
        server_nonce: &[u8; NONCE_LENGTH],
        client_nonce: &[u8; NONCE_LENGTH],
    ) -> Result<Self> {
        let mut salt = [0u8; NONCE_LENGTH * 2];
        salt[..NONCE_LENGTH].copy_from_slice(server_nonce);
        salt[NONCE_LENGTH..].copy_from_slice(client_nonce);

        const DIRECTION_SIZE: usize = IV_SIZE + KEY_SIZE + MAC_KEY_SIZE;
        let mut okm = hkdf::derive(&salt, shared_secret, &[], DIRECTION_SIZE * 2)?;

        let server = split_direction(&okm[..DIRECTION_SIZE]);
        let client = split_direction(&okm[DIRECTION_SIZE..]);
        okm.zeroize();

        Ok(Self { server, client })
    }
}

fn split_direction(okm: &[u8]) -> DirectionKeys {
    let mut keys = DirectionKeys {
        iv: [0u8; IV_SIZE],
        key: [0u8; KEY_SIZE],
        mac_key: [0u8; MAC_KEY_SIZE],
    };
    keys.iv.copy_from_slice(&okm[..IV_SIZE]);
    keys.key.copy_from_slice(&okm[IV_SIZE..IV_SIZE + KEY_SIZE]);
    keys.mac_key.copy_from_slice(&okm[IV_SIZE + KEY_SIZE..]);
    keys
}

/// Stateful sealer and opener for one session's records.
pub struct RecordCrypto {
    out_cipher: CtrCipher,
    in_cipher: CtrCipher,
    out_mac_key: [u8; MAC_KEY_SIZE],
    in_mac_key: [u8; MAC_KEY_SIZE],
    out_counter: u32,
    in_counter: u32,
}

impl RecordCrypto {
    /// Builds record state from directional keys. `outbound` is the set this
    /// party sends with.
    pub fn new(outbound: &DirectionKeys, inbound: &DirectionKeys) -> Self {
        Self {
            out_cipher: CtrCipher::new(&outbound.key, &outbound.iv),
            in_cipher: CtrCipher::new(&inbound.key, &inbound.iv),
            out_mac_key: outbound.mac_key,
            in_mac_key: inbound.mac_key,
            out_counter: 0,
            in_counter: 0,
        }
    }

    /// Seals a payload, returning the 18-byte record header and the
    /// ciphertext.
    pub fn seal(&mut self, payload: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        if payload.len() > MAX_RECORD_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_RECORD_PAYLOAD,
            });
        }

        // Length and payload share one keystream; the length's two bytes
        // come first.
        let mut enc_len = (payload.len() as u16).to_le_bytes();
        self.out_cipher.apply(&mut enc_len)?;

        let mut ciphertext = payload.to_vec();
        self.out_cipher.apply(&mut ciphertext)?;

        self.out_counter = self.out_counter.wrapping_add(1);
        let mac = record_mac(&self.out_mac_key, self.out_counter, &enc_len, &ciphertext);

        let mut header = Vec::with_capacity(RECORD_PREFIX_SIZE);
        header.extend_from_slice(&mac);
        header.extend_from_slice(&enc_len);
        Ok((header, ciphertext))
    }

    /// Decrypts a record's length field, returning the payload size.
    ///
    /// Consumes two keystream bytes; the caller must follow up with exactly
    /// one [`open`](Self::open) for this record.
    pub fn open_length(&mut self, enc_len: &[u8; 2]) -> Result<usize> {
        let mut plain = *enc_len;
        self.in_cipher.apply(&mut plain)?;
        Ok(u16::from_le_bytes(plain) as usize)
    }

    /// Authenticates and decrypts a complete record in place.
    ///
    /// `mac` and `enc_len` are the record header exactly as received. On a
    /// MAC mismatch the ciphertext is discarded, the keystream is advanced
    /// past it, and [`ProtocolError::RecordIntegrity`] is returned; the
    /// session remains usable.
    pub fn open(
        &mut self,
        mac: &[u8; MAC_SIZE],
        enc_len: &[u8; 2],
        ciphertext: &mut [u8],
    ) -> Result<()> {
        self.in_counter = self.in_counter.wrapping_add(1);
        let expected = record_mac(&self.in_mac_key, self.in_counter, enc_len, ciphertext);

        if expected.ct_eq(mac).into() {
            self.in_cipher.apply(ciphertext)?;
            Ok(())
        } else {
            self.in_cipher.advance(ciphertext.len())?;
            Err(ProtocolError::RecordIntegrity)
        }
    }
}

impl Drop for RecordCrypto {
    fn drop(&mut self) {
        self.out_mac_key.zeroize();
        self.in_mac_key.zeroize();
    }
}

fn record_mac(
    key: &[u8; MAC_KEY_SIZE],
    counter: u32,
    enc_len: &[u8; 2],
    ciphertext: &[u8],
) -> [u8; MAC_SIZE] {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key length"),
    };
    mac.update(&counter.to_le_bytes());
    mac.update(enc_len);
    mac.update(ciphertext);

    let mut out = [0u8; MAC_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes()[..MAC_SIZE]);
    out
}

impl std::fmt::Debug for RecordCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCrypto")
            .field("out_counter", &self.out_counter)
            .field("in_counter", &self.in_counter)
            .finish()
    }
}
