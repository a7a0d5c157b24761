//! Handshake frame codec.
//!
//! Frames are named after the state that *consumes* them: a
//! [`ClientNegotiateFrame`] is built by the server and parsed by the client
//! in its negotiate state, and so on. All multi-byte integers are
//! little-endian.
//!
//! Parsing is two-phase to cope with partial delivery from a byte stream.
//! The receiver first collects [`Frame::INITIAL_SIZE`] bytes and calls
//! [`deserialize`](Frame::deserialize); for variable-length frames that
//! pass reads the length fields and answers [`FrameStep::NeedMore`] with the
//! exact body size, after which a second call with the body bytes finishes
//! the frame. Fixed-size frames complete on the first call.

use crate::error::{ProtocolError, Result};

/// Lowest protocol version this implementation speaks.
pub const MIN_VERSION: u8 = 1;

/// Highest protocol version this implementation speaks.
pub const MAX_VERSION: u8 = 1;

/// Size of every handshake nonce.
pub const NONCE_LENGTH: usize = 16;

/// Size of a proof-of-work solution carried on the wire.
pub const SOLUTION_LENGTH: usize = 4;

/// Largest tag the length fields can describe and a peer will accept.
pub const MAX_TAG_LENGTH: usize = 1024;

/// Progress report from a [`Frame::deserialize`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    /// The frame needs exactly this many more bytes before the next pass.
    NeedMore(usize),
    /// The frame is fully parsed.
    Complete,
}

/// A handshake frame with a fixed-size prefix and an optional body.
pub trait Frame: Default {
    /// Bytes that must be collected before the first `deserialize` pass.
    const INITIAL_SIZE: usize;

    /// Encodes the frame for the wire.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Consumes one phase of input.
    ///
    /// The first call receives exactly [`INITIAL_SIZE`](Frame::INITIAL_SIZE)
    /// bytes; if it answers [`FrameStep::NeedMore`], the second call
    /// receives exactly that many body bytes.
    fn deserialize(&mut self, bytes: &[u8]) -> Result<FrameStep>;
}

fn check_tag_length(len: usize) -> Result<()> {
    if len > MAX_TAG_LENGTH {
        return Err(ProtocolError::TagTooLong {
            len,
            max: MAX_TAG_LENGTH,
        });
    }
    Ok(())
}

fn expect_len(bytes: &[u8], expected: usize, frame: &str) -> Result<()> {
    if bytes.len() != expected {
        return Err(ProtocolError::Frame(format!(
            "{}: expected {} bytes, got {}",
            frame,
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

fn read_nonce(bytes: &[u8]) -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    nonce.copy_from_slice(bytes);
    nonce
}

/// Version advertisement, client to server. Opens the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerNegotiateFrame {
    /// Lowest version the client speaks.
    pub min_version: u8,
    /// Highest version the client speaks.
    pub max_version: u8,
}

impl Frame for ServerNegotiateFrame {
    const INITIAL_SIZE: usize = 2;

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(vec![self.min_version, self.max_version])
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<FrameStep> {
        expect_len(bytes, Self::INITIAL_SIZE, "negotiate")?;
        self.min_version = bytes[0];
        self.max_version = bytes[1];
        Ok(FrameStep::Complete)
    }
}

/// Version selection plus challenge parameters, server to client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientNegotiateFrame {
    /// Lowest version the server speaks.
    pub min_version: u8,
    /// Highest version the server speaks.
    pub max_version: u8,
    /// Whether the server will demand a client tag.
    pub is_mutual: bool,
    /// Proof-of-work difficulty in bits.
    pub difficulty: u8,
    /// Challenge nonce, also salts key derivation.
    pub nonce: [u8; NONCE_LENGTH],
}

impl Frame for ClientNegotiateFrame {
    const INITIAL_SIZE: usize = 4 + NONCE_LENGTH;

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::INITIAL_SIZE);
        out.push(self.min_version);
        out.push(self.max_version);
        out.push(self.is_mutual as u8);
        out.push(self.difficulty);
        out.extend_from_slice(&self.nonce);
        Ok(out)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<FrameStep> {
        expect_len(bytes, Self::INITIAL_SIZE, "challenge")?;
        self.min_version = bytes[0];
        self.max_version = bytes[1];
        self.is_mutual = bytes[2] != 0;
        self.difficulty = bytes[3];
        self.nonce = read_nonce(&bytes[4..]);
        Ok(FrameStep::Complete)
    }
}

/// Challenge response, client to server.
///
/// Carries the puzzle outcome, the client's key-derivation nonce, and the
/// client's tag when it has one. An empty tag means no credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerExchangeFrame {
    /// Whether the client claims to have solved the puzzle.
    pub success: bool,
    /// Claimed puzzle solution; meaningful only when `success` is set.
    pub solution: [u8; SOLUTION_LENGTH],
    /// Client nonce, salts key derivation.
    pub nonce: [u8; NONCE_LENGTH],
    /// Encoded client tag, possibly empty.
    pub tag: Vec<u8>,
    pub(crate) tag_len: usize,
    pub(crate) header_parsed: bool,
}

impl Frame for ServerExchangeFrame {
    const INITIAL_SIZE: usize = 2 + 1 + SOLUTION_LENGTH + NONCE_LENGTH;

    fn serialize(&self) -> Result<Vec<u8>> {
        check_tag_length(self.tag.len())?;

        let mut out = Vec::with_capacity(Self::INITIAL_SIZE + self.tag.len());
        out.extend_from_slice(&(self.tag.len() as u16).to_le_bytes());
        out.push(self.success as u8);
        out.extend_from_slice(&self.solution);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        Ok(out)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<FrameStep> {
        if !self.header_parsed {
            expect_len(bytes, Self::INITIAL_SIZE, "challenge response")?;
            self.tag_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
            check_tag_length(self.tag_len)?;
            self.success = bytes[2] != 0;
            self.solution.copy_from_slice(&bytes[3..3 + SOLUTION_LENGTH]);
            self.nonce = read_nonce(&bytes[3 + SOLUTION_LENGTH..]);
            self.header_parsed = true;

            if self.tag_len > 0 {
                return Ok(FrameStep::NeedMore(self.tag_len));
            }
            return Ok(FrameStep::Complete);
        }

        expect_len(bytes, self.tag_len, "challenge response tag")?;
        self.tag = bytes.to_vec();
        Ok(FrameStep::Complete)
    }
}

/// Server credential presentation, server to client.
///
/// The signature binds the server's ephemeral public key, the client nonce,
/// the mutual flag, and (when mutual) the client's tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientExchangeFrame {
    /// Whether the server accepted the client's tag.
    pub is_mutual: bool,
    /// Encoded server tag.
    pub tag: Vec<u8>,
    /// Server's ephemeral key-agreement public key.
    pub public_key: Vec<u8>,
    /// Handshake binding signature by the server tag's holder key.
    pub signature: Vec<u8>,
    pub(crate) pk_len: usize,
    pub(crate) sig_len: usize,
    pub(crate) tag_len: usize,
    pub(crate) header_parsed: bool,
}

impl Frame for ClientExchangeFrame {
    const INITIAL_SIZE: usize = 5;

    fn serialize(&self) -> Result<Vec<u8>> {
        check_tag_length(self.tag.len())?;
        check_field_length(self.public_key.len(), "public key")?;
        check_field_length(self.signature.len(), "signature")?;

        let mut out = Vec::with_capacity(
            Self::INITIAL_SIZE + self.tag.len() + self.public_key.len() + self.signature.len(),
        );
        out.push(self.public_key.len() as u8);
        out.push(self.signature.len() as u8);
        out.extend_from_slice(&(self.tag.len() as u16).to_le_bytes());
        out.push(self.is_mutual as u8);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<FrameStep> {
        if !self.header_parsed {
            expect_len(bytes, Self::INITIAL_SIZE, "credential")?;
            self.pk_len = bytes[0] as usize;
            self.sig_len = bytes[1] as usize;
            self.tag_len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
            check_tag_length(self.tag_len)?;
            self.is_mutual = bytes[4] != 0;
            self.header_parsed = true;

            let body = self.tag_len + self.pk_len + self.sig_len;
            if body > 0 {
                return Ok(FrameStep::NeedMore(body));
            }
            return Ok(FrameStep::Complete);
        }

        expect_len(
            bytes,
            self.tag_len + self.pk_len + self.sig_len,
            "credential body",
        )?;
        self.tag = bytes[..self.tag_len].to_vec();
        self.public_key = bytes[self.tag_len..self.tag_len + self.pk_len].to_vec();
        self.signature = bytes[self.tag_len + self.pk_len..].to_vec();
        Ok(FrameStep::Complete)
    }
}

fn check_field_length(len: usize, what: &str) -> Result<()> {
    if len > u8::MAX as usize {
        return Err(ProtocolError::Frame(format!(
            "{} too long for one-byte length field: {}",
            what, len
        )));
    }
    Ok(())
}

/// Client key confirmation, client to server.
///
/// Always carries the client's ephemeral public key; the signature is
/// present only under mutual authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerValidateFrame {
    /// Client's ephemeral key-agreement public key.
    pub public_key: Vec<u8>,
    /// Binding signature by the client tag's holder key; empty when the
    /// session is not mutually authenticated.
    pub signature: Vec<u8>,
    pub(crate) pk_len: usize,
    pub(crate) sig_len: usize,
    pub(crate) header_parsed: bool,
}

impl Frame for ServerValidateFrame {
    const INITIAL_SIZE: usize = 2;

    fn serialize(&self) -> Result<Vec<u8>> {
        check_field_length(self.public_key.len(), "public key")?;
        check_field_length(self.signature.len(), "signature")?;

        let mut out =
            Vec::with_capacity(Self::INITIAL_SIZE + self.public_key.len() + self.signature.len());
        out.push(self.public_key.len() as u8);
        out.push(self.signature.len() as u8);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<FrameStep> {
        if !self.header_parsed {
            expect_len(bytes, Self::INITIAL_SIZE, "confirmation")?;
            self.pk_len = bytes[0] as usize;
            self.sig_len = bytes[1] as usize;
            self.header_parsed = true;

            let body = self.pk_len + self.sig_len;
            if body > 0 {
                return Ok(FrameStep::NeedMore(body));
            }
            return Ok(FrameStep::Complete);
        }

        expect_len(bytes, self.pk_len + self.sig_len, "confirmation body")?;
        self.public_key = bytes[..self.pk_len].to_vec();
        self.signature = bytes[self.pk_len..].to_vec();
        Ok(FrameStep::Complete)
    }
}

/// First encrypted frame, server to client. Echoes the client's liveness
/// nonce and supplies the server's own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientEchoFrame {
    /// Client nonce being echoed back.
    pub client_nonce: [u8; NONCE_LENGTH],
    /// Server nonce awaiting its own echo.
    pub server_nonce: [u8; NONCE_LENGTH],
}

impl Frame for ClientEchoFrame {
    const INITIAL_SIZE: usize = NONCE_LENGTH * 2;

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::INITIAL_SIZE);
        out.extend_from_slice(&self.client_nonce);
        out.extend_from_slice(&self.server_nonce);
        Ok(out)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<FrameStep> {
        expect_len(bytes, Self::INITIAL_SIZE, "echo")?;
        self.client_nonce = read_nonce(&bytes[..NONCE_LENGTH]);
        self.server_nonce = read_nonce(&bytes[NONCE_LENGTH..]);
        Ok(FrameStep::Complete)
    }
}

/// Encrypted liveness probe, client to server. Carries a single nonce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEchoFrame {
    /// Nonce being carried or echoed.
    pub nonce: [u8; NONCE_LENGTH],
}

impl Frame for ServerEchoFrame {
    const INITIAL_SIZE: usize = NONCE_LENGTH;

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.nonce.to_vec())
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<FrameStep> {
        expect_len(bytes, Self::INITIAL_SIZE, "echo probe")?;
        self.nonce = read_nonce(bytes);
        Ok(FrameStep::Complete)
    }
}
