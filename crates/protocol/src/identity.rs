//! Identity and certificate ("tag") support for Shackle endpoints.
//!
//! This module provides Ed25519 key management, tag issuance and
//! verification, and the trust set consulted during the handshake. The
//! handshake core consumes these types read-only through a narrow surface:
//! a tag's raw encoded bytes, its holder key, `verify` against a trust set,
//! and multi-part sign/verify on an [`Entity`]. Any certificate scheme
//! exposing the same surface could be swapped in.

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Tag format version emitted by [`Tag::issue`].
pub const TAG_VERSION: u8 = 1;

/// Size of an encoded tag: version + validity window + both keys + signature.
pub const TAG_ENCODED_LENGTH: usize = 1 + 8 + 8 + PUBLIC_KEY_LENGTH * 2 + SIGNATURE_LENGTH;

/// Portion of the encoding covered by the issuer signature.
const TAG_BODY_LENGTH: usize = TAG_ENCODED_LENGTH - SIGNATURE_LENGTH;

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Creates a new Signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses a signature from a variable-length slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SIGNATURE_LENGTH] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidSignature)?;
        Ok(Self(arr))
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    fn as_ed25519(&self) -> Ed25519Signature {
        Ed25519Signature::from_bytes(&self.0)
    }
}

/// An identity with an Ed25519 keypair, or the public half only.
///
/// Entities sign and verify over a sequence of message parts; every part is
/// fed into a single signature computation in order.
#[derive(Clone)]
pub struct Entity {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
}

impl Entity {
    /// Generates a new identity with a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key: Some(signing_key),
            verifying_key,
        }
    }

    /// Creates a public-only identity from raw public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|_| ProtocolError::InvalidTag("malformed public key".into()))?;

        Ok(Self {
            signing_key: None,
            verifying_key,
        })
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns whether this entity holds the private half of the keypair.
    pub fn has_private_key(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Signs the concatenation of `parts` with this entity's private key.
    pub fn sign(&self, parts: &[&[u8]]) -> Result<Signature> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| ProtocolError::Config("entity has no private key".into()))?;

        let sig = signing_key.sign(&concat(parts));
        Ok(Signature(sig.to_bytes()))
    }

    /// Verifies a signature over the concatenation of `parts`.
    pub fn verify(&self, parts: &[&[u8]], signature: &Signature) -> bool {
        self.verifying_key
            .verify(&concat(parts), &signature.as_ed25519())
            .is_ok()
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("public_key", &hex_prefix(&self.verifying_key.to_bytes()))
            .field("has_private_key", &self.signing_key.is_some())
            .finish()
    }
}

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len()).sum();
    let mut buffer = Vec::with_capacity(len);
    for part in parts {
        buffer.extend_from_slice(part);
    }
    buffer
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// A signed binding of a holder key to an issuer key with a validity window.
///
/// The wire encoding is fixed-width:
/// version(1) ‖ not_before(8 LE) ‖ not_after(8 LE) ‖ holder(32) ‖
/// issuer(32) ‖ signature(64). The issuer signature covers everything before
/// it. `raw` keeps the canonical bytes so handshake signatures can bind the
/// exact tag that crossed the wire.
#[derive(Debug, Clone)]
pub struct Tag {
    version: u8,
    not_before: u64,
    not_after: u64,
    holder: Entity,
    issuer: Entity,
    raw: Vec<u8>,
}

impl Tag {
    /// Issues a new tag binding `holder` to `issuer`, valid over the given
    /// unix-seconds window.
    pub fn issue(issuer: &Entity, holder: &Entity, not_before: u64, not_after: u64) -> Result<Self> {
        let mut raw = Vec::with_capacity(TAG_ENCODED_LENGTH);
        raw.push(TAG_VERSION);
        raw.extend_from_slice(&not_before.to_le_bytes());
        raw.extend_from_slice(&not_after.to_le_bytes());
        raw.extend_from_slice(&holder.public_key_bytes());
        raw.extend_from_slice(&issuer.public_key_bytes());

        let signature = issuer.sign(&[&raw])?;
        raw.extend_from_slice(signature.as_bytes());

        Ok(Self {
            version: TAG_VERSION,
            not_before,
            not_after,
            holder: Entity {
                signing_key: None,
                verifying_key: holder.verifying_key,
            },
            issuer: Entity {
                signing_key: None,
                verifying_key: issuer.verifying_key,
            },
            raw,
        })
    }

    /// Parses a tag from its wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != TAG_ENCODED_LENGTH {
            return Err(ProtocolError::InvalidTag(format!(
                "encoded tag must be {} bytes, got {}",
                TAG_ENCODED_LENGTH,
                bytes.len()
            )));
        }

        let version = bytes[0];
        if version != TAG_VERSION {
            return Err(ProtocolError::InvalidTag(format!(
                "unsupported tag version {}",
                version
            )));
        }

        let not_before = u64::from_le_bytes(read_array(&bytes[1..9]));
        let not_after = u64::from_le_bytes(read_array(&bytes[9..17]));
        let holder = Entity::from_public_key_bytes(&read_array(&bytes[17..49]))?;
        let issuer = Entity::from_public_key_bytes(&read_array(&bytes[49..81]))?;

        Ok(Self {
            version,
            not_before,
            not_after,
            holder,
            issuer,
            raw: bytes.to_vec(),
        })
    }

    /// Returns the canonical encoded bytes of this tag.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Returns the tag format version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the holder identity (public half only).
    pub fn holder(&self) -> &Entity {
        &self.holder
    }

    /// Returns the issuer identity (public half only).
    pub fn issuer(&self) -> &Entity {
        &self.issuer
    }

    /// Start of the validity window, unix seconds.
    pub fn not_before(&self) -> u64 {
        self.not_before
    }

    /// End of the validity window, unix seconds.
    pub fn not_after(&self) -> u64 {
        self.not_after
    }

    /// Verifies this tag against a trust set at the current time.
    pub fn verify(&self, trusted_issuers: &TrustSet) -> bool {
        self.verify_at(trusted_issuers, unix_now())
    }

    /// Verifies this tag against a trust set at an explicit unix timestamp.
    ///
    /// The issuer must be trusted, the issuer signature over the tag body
    /// must check out, and `now` must fall within the validity window.
    pub fn verify_at(&self, trusted_issuers: &TrustSet, now: u64) -> bool {
        if !trusted_issuers.contains(&self.issuer.public_key_bytes()) {
            return false;
        }

        if now < self.not_before || now > self.not_after {
            return false;
        }

        let signature = match Signature::from_slice(&self.raw[TAG_BODY_LENGTH..]) {
            Ok(sig) => sig,
            Err(_) => return false,
        };

        self.issuer.verify(&[&self.raw[..TAG_BODY_LENGTH]], &signature)
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A party's own keypair together with the tag vouching for it.
pub struct LocalCredentials {
    /// The identity, private key included.
    pub entity: Entity,
    /// Tag whose holder key is `entity`'s public key.
    pub tag: Tag,
}

impl LocalCredentials {
    /// Pairs an entity with its tag, checking the two actually belong
    /// together.
    pub fn new(entity: Entity, tag: Tag) -> Result<Self> {
        if !entity.has_private_key() {
            return Err(ProtocolError::Config(
                "credentials need the private half of the keypair".into(),
            ));
        }
        if tag.holder().public_key_bytes() != entity.public_key_bytes() {
            return Err(ProtocolError::Config(
                "tag holder key does not match the entity".into(),
            ));
        }
        Ok(Self { entity, tag })
    }
}

/// The set of issuer identities a party accepts when verifying tags.
#[derive(Debug, Clone, Default)]
pub struct TrustSet {
    issuers: Vec<[u8; PUBLIC_KEY_LENGTH]>,
}

impl TrustSet {
    /// Creates an empty trust set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an issuer's public key to the trust set.
    pub fn add(&mut self, issuer: &Entity) {
        let key = issuer.public_key_bytes();
        if !self.issuers.contains(&key) {
            self.issuers.push(key);
        }
    }

    /// Returns whether the given public key belongs to a trusted issuer.
    pub fn contains(&self, public_key: &[u8; PUBLIC_KEY_LENGTH]) -> bool {
        self.issuers.contains(public_key)
    }

    /// Returns the number of trusted issuers.
    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    /// Returns whether the trust set is empty.
    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }
}
