//! Session state machine.
//!
//! A [`Session`] is transport-agnostic: the caller pumps received bytes in
//! through [`decode`](Session::decode), hands application payloads to
//! [`encode`](Session::encode), and drains [`SessionEvent`]s to learn what
//! to write to the wire and what arrived. Byte boundaries never matter;
//! input may be split or coalesced arbitrarily.
//!
//! The handshake drives itself: constructing a session and calling
//! [`initialize`](Session::initialize) is enough, every subsequent
//! transition happens inside `decode`. Fatal errors latch the session into
//! a failed state where every call answers
//! [`ProtocolError::SessionFailed`].

use std::collections::VecDeque;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{ProtocolError, Result};
use crate::frames::{
    ClientEchoFrame, ClientExchangeFrame, ClientNegotiateFrame, Frame, FrameStep,
    ServerEchoFrame, ServerExchangeFrame, ServerNegotiateFrame, ServerValidateFrame,
    MAX_VERSION, MIN_VERSION, NONCE_LENGTH,
};
use crate::identity::{LocalCredentials, Signature, Tag, TrustSet};
use crate::puzzle::HashPuzzle;
use crate::record::{RecordCrypto, SessionKeys, MAC_SIZE, MAX_RECORD_PAYLOAD, RECORD_PREFIX_SIZE};

/// Highest proof-of-work difficulty a client will accept from a server.
pub const MAX_DIFFICULTY: u8 = 24;

/// Receive buffer capacity: one maximum record plus its prefix. The
/// reassembly loop drains the buffer as soon as the armed size is met, so
/// steady-state traffic never grows past this.
pub const RECEIVE_BUFFER_SIZE: usize = MAX_RECORD_PAYLOAD + RECORD_PREFIX_SIZE;

/// Failed challenge responses a server tolerates before giving up.
const RENEGOTIATE_LIMIT: u32 = 3;

/// Key-agreement public key size on the wire.
const KEY_AGREEMENT_KEY_SIZE: usize = 32;

/// Something the caller must act on, drained via
/// [`next_event`](Session::next_event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The handshake completed; `encode` is now available.
    Established,
    /// Bytes ready for the transport: write `header` then `payload`.
    /// Handshake frames before the record layer starts carry an empty
    /// header.
    DataEncoded {
        /// Record prefix, or empty for plaintext handshake frames.
        header: Vec<u8>,
        /// Frame or ciphertext bytes.
        payload: Vec<u8>,
    },
    /// A complete application payload arrived and decrypted cleanly.
    DataDecoded(Vec<u8>),
    /// A proof-of-work round failed and the challenge was reissued.
    ChallengeFailed,
}

/// Client-side session configuration.
pub struct ClientConfig {
    /// Credential presented when the server asks for mutual authentication.
    pub credentials: Option<LocalCredentials>,
    /// Issuers whose server tags are accepted.
    pub trusted_issuers: TrustSet,
    /// Abort unless the server accepts our tag.
    pub require_mutual: bool,
}

/// Server-side session configuration.
pub struct ServerConfig {
    /// Credential presented to every client.
    pub credentials: LocalCredentials,
    /// Issuers whose client tags are accepted.
    pub trusted_issuers: TrustSet,
    /// Reject clients that present no acceptable tag.
    pub require_mutual: bool,
    /// Proof-of-work difficulty in bits demanded of clients.
    pub difficulty: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// The handshake frame the session expects next, holding partial parse
/// state between phases.
enum PendingFrame {
    ServerNegotiate(ServerNegotiateFrame),
    ClientNegotiate(ClientNegotiateFrame),
    ServerExchange(ServerExchangeFrame),
    ClientExchange(ClientExchangeFrame),
    ServerValidate(ServerValidateFrame),
    ClientEcho(ClientEchoFrame),
    ServerEcho(ServerEchoFrame),
}

impl PendingFrame {
    fn initial_size(&self) -> usize {
        match self {
            PendingFrame::ServerNegotiate(_) => ServerNegotiateFrame::INITIAL_SIZE,
            PendingFrame::ClientNegotiate(_) => ClientNegotiateFrame::INITIAL_SIZE,
            PendingFrame::ServerExchange(_) => ServerExchangeFrame::INITIAL_SIZE,
            PendingFrame::ClientExchange(_) => ClientExchangeFrame::INITIAL_SIZE,
            PendingFrame::ServerValidate(_) => ServerValidateFrame::INITIAL_SIZE,
            PendingFrame::ClientEcho(_) => ClientEchoFrame::INITIAL_SIZE,
            PendingFrame::ServerEcho(_) => ServerEchoFrame::INITIAL_SIZE,
        }
    }
}

/// Position within the current inbound record once the record layer is up.
enum RecordStage {
    Header,
    Body {
        mac: [u8; MAC_SIZE],
        enc_len: [u8; 2],
    },
}

/// One endpoint of an encrypted channel.
pub struct Session {
    role: Role,
    credentials: Option<LocalCredentials>,
    trusted_issuers: TrustSet,
    require_mutual: bool,
    difficulty: u8,

    // Inbound reassembly
    buffer: Vec<u8>,
    needed: usize,
    pending: Option<PendingFrame>,
    record_stage: RecordStage,

    // Handshake material
    version: u8,
    server_nonce: [u8; NONCE_LENGTH],
    client_nonce: [u8; NONCE_LENGTH],
    echo_nonce: [u8; NONCE_LENGTH],
    validate_echo: bool,
    renegotiations: u32,
    key_agreement: Option<EphemeralSecret>,
    peer_tag: Option<Tag>,
    is_mutual: bool,

    crypto: Option<RecordCrypto>,
    encrypted: bool,
    established: bool,
    failed: bool,

    events: VecDeque<SessionEvent>,
}

impl Session {
    /// Creates a client session.
    pub fn client(config: ClientConfig) -> Result<Self> {
        if config.trusted_issuers.is_empty() {
            return Err(ProtocolError::Config(
                "client needs at least one trusted issuer".into(),
            ));
        }
        if config.require_mutual && config.credentials.is_none() {
            return Err(ProtocolError::Config(
                "mutual authentication requires credentials".into(),
            ));
        }

        Ok(Self::new(
            Role::Client,
            config.credentials,
            config.trusted_issuers,
            config.require_mutual,
            0,
        ))
    }

    /// Creates a server session.
    pub fn server(config: ServerConfig) -> Result<Self> {
        if config.difficulty > MAX_DIFFICULTY {
            return Err(ProtocolError::Config(format!(
                "difficulty {} exceeds protocol maximum {}",
                config.difficulty, MAX_DIFFICULTY
            )));
        }
        if config.require_mutual && config.trusted_issuers.is_empty() {
            return Err(ProtocolError::Config(
                "mutual authentication requires trusted issuers".into(),
            ));
        }

        Ok(Self::new(
            Role::Server,
            Some(config.credentials),
            config.trusted_issuers,
            config.require_mutual,
            config.difficulty,
        ))
    }

    fn new(
        role: Role,
        credentials: Option<LocalCredentials>,
        trusted_issuers: TrustSet,
        require_mutual: bool,
        difficulty: u8,
    ) -> Self {
        Self {
            role,
            credentials,
            trusted_issuers,
            require_mutual,
            difficulty,
            buffer: Vec::with_capacity(RECEIVE_BUFFER_SIZE),
            needed: 0,
            pending: None,
            record_stage: RecordStage::Header,
            version: 0,
            server_nonce: [0u8; NONCE_LENGTH],
            client_nonce: [0u8; NONCE_LENGTH],
            echo_nonce: [0u8; NONCE_LENGTH],
            validate_echo: false,
            renegotiations: 0,
            key_agreement: None,
            peer_tag: None,
            is_mutual: false,
            crypto: None,
            encrypted: false,
            established: false,
            failed: false,
            events: VecDeque::new(),
        }
    }

    /// Starts the handshake.
    ///
    /// The client emits its version advertisement; the server just arms
    /// itself to receive one.
    pub fn initialize(&mut self) -> Result<()> {
        self.guard()?;

        match self.role {
            Role::Client => {
                let hello = ServerNegotiateFrame {
                    min_version: MIN_VERSION,
                    max_version: MAX_VERSION,
                };
                self.send_frame(&hello)?;
                self.arm(PendingFrame::ClientNegotiate(ClientNegotiateFrame::default()));
            }
            Role::Server => {
                self.arm(PendingFrame::ServerNegotiate(ServerNegotiateFrame::default()));
            }
        }
        Ok(())
    }

    /// Feeds bytes received from the transport.
    ///
    /// Any amount at a time is fine. Completed handshake steps, decrypted
    /// payloads, and outbound responses all surface as events. A
    /// [`ProtocolError::RecordIntegrity`] return drops one record but
    /// leaves the session usable; every other error is fatal.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<()> {
        self.guard()?;
        self.buffer.extend_from_slice(bytes);

        let mut dropped_record = false;
        while self.needed > 0 && self.buffer.len() >= self.needed {
            let chunk: Vec<u8> = self.buffer.drain(..self.needed).collect();
            match self.process(&chunk) {
                Ok(()) => {}
                Err(ProtocolError::RecordIntegrity) => {
                    warn!("dropping record with bad MAC");
                    dropped_record = true;
                }
                Err(err) => {
                    self.fail();
                    return Err(err);
                }
            }
        }

        if dropped_record {
            return Err(ProtocolError::RecordIntegrity);
        }
        Ok(())
    }

    /// Encrypts an application payload into one or more records, emitted as
    /// [`SessionEvent::DataEncoded`] events.
    pub fn encode(&mut self, payload: &[u8]) -> Result<()> {
        self.guard()?;
        if !self.established {
            return Err(ProtocolError::NotEstablished);
        }

        if payload.is_empty() {
            return self.send_sealed(payload);
        }
        for chunk in payload.chunks(MAX_RECORD_PAYLOAD) {
            self.send_sealed(chunk)?;
        }
        Ok(())
    }

    /// Takes the next queued event, if any.
    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Returns whether the handshake has completed.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Returns whether both parties authenticated each other. Meaningful
    /// once established.
    pub fn is_mutual(&self) -> bool {
        self.is_mutual
    }

    /// Returns the protocol version settled during negotiation: the highest
    /// version both windows share. Zero until negotiation completes.
    pub fn version(&self) -> u8 {
        self.version
    }

    fn guard(&self) -> Result<()> {
        if self.failed {
            return Err(ProtocolError::SessionFailed);
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.failed = true;
        self.needed = 0;
        self.pending = None;
        self.buffer.clear();
    }

    fn arm(&mut self, frame: PendingFrame) {
        if !self.encrypted {
            self.needed = frame.initial_size();
        }
        self.pending = Some(frame);
    }

    // ---- inbound plumbing ----

    fn process(&mut self, chunk: &[u8]) -> Result<()> {
        if !self.encrypted {
            return self.feed_pending(chunk);
        }

        match self.record_stage {
            RecordStage::Header => {
                let mut mac = [0u8; MAC_SIZE];
                mac.copy_from_slice(&chunk[..MAC_SIZE]);
                let mut enc_len = [0u8; 2];
                enc_len.copy_from_slice(&chunk[MAC_SIZE..]);

                let len = self.crypto_mut()?.open_length(&enc_len)?;
                if len == 0 {
                    // Zero-length records carry no body phase; handle them
                    // here or the stream stalls.
                    self.needed = RECORD_PREFIX_SIZE;
                    self.open_record(&mac, &enc_len, Vec::new())
                } else {
                    self.record_stage = RecordStage::Body { mac, enc_len };
                    self.needed = len;
                    Ok(())
                }
            }
            RecordStage::Body { mac, enc_len } => {
                self.record_stage = RecordStage::Header;
                self.needed = RECORD_PREFIX_SIZE;
                self.open_record(&mac, &enc_len, chunk.to_vec())
            }
        }
    }

    fn open_record(
        &mut self,
        mac: &[u8; MAC_SIZE],
        enc_len: &[u8; 2],
        mut ciphertext: Vec<u8>,
    ) -> Result<()> {
        self.crypto_mut()?.open(mac, enc_len, &mut ciphertext)?;

        if self.established {
            self.events.push_back(SessionEvent::DataDecoded(ciphertext));
            Ok(())
        } else {
            self.feed_pending(&ciphertext)
        }
    }

    fn feed_pending(&mut self, chunk: &[u8]) -> Result<()> {
        let mut pending = self
            .pending
            .take()
            .ok_or_else(|| ProtocolError::Frame("unexpected handshake data".into()))?;

        let step = match &mut pending {
            PendingFrame::ServerNegotiate(f) => f.deserialize(chunk)?,
            PendingFrame::ClientNegotiate(f) => f.deserialize(chunk)?,
            PendingFrame::ServerExchange(f) => f.deserialize(chunk)?,
            PendingFrame::ClientExchange(f) => f.deserialize(chunk)?,
            PendingFrame::ServerValidate(f) => f.deserialize(chunk)?,
            PendingFrame::ClientEcho(f) => f.deserialize(chunk)?,
            PendingFrame::ServerEcho(f) => f.deserialize(chunk)?,
        };

        match step {
            FrameStep::NeedMore(n) => {
                self.needed = n;
                self.pending = Some(pending);
                Ok(())
            }
            FrameStep::Complete => self.handle_frame(pending),
        }
    }

    fn handle_frame(&mut self, frame: PendingFrame) -> Result<()> {
        match (self.role, frame) {
            (Role::Server, PendingFrame::ServerNegotiate(f)) => self.on_negotiate(f),
            (Role::Client, PendingFrame::ClientNegotiate(f)) => self.on_challenge(f),
            (Role::Server, PendingFrame::ServerExchange(f)) => self.on_challenge_response(f),
            (Role::Client, PendingFrame::ClientExchange(f)) => self.on_credential(f),
            (Role::Server, PendingFrame::ServerValidate(f)) => self.on_confirmation(f),
            (Role::Client, PendingFrame::ClientEcho(f)) => self.on_echo(f),
            (Role::Server, PendingFrame::ServerEcho(f)) => self.on_echo_probe(f),
            _ => Err(ProtocolError::Frame("frame does not match role".into())),
        }
    }

    // ---- outbound plumbing ----

    fn send_frame<F: Frame>(&mut self, frame: &F) -> Result<()> {
        let bytes = frame.serialize()?;
        if self.encrypted {
            self.send_sealed(&bytes)
        } else {
            self.events.push_back(SessionEvent::DataEncoded {
                header: Vec::new(),
                payload: bytes,
            });
            Ok(())
        }
    }

    fn send_sealed(&mut self, payload: &[u8]) -> Result<()> {
        let (header, ciphertext) = self.crypto_mut()?.seal(payload)?;
        self.events.push_back(SessionEvent::DataEncoded {
            header,
            payload: ciphertext,
        });
        Ok(())
    }

    fn crypto_mut(&mut self) -> Result<&mut RecordCrypto> {
        self.crypto
            .as_mut()
            .ok_or_else(|| ProtocolError::Config("record layer not initialized".into()))
    }

    fn credentials(&self) -> Result<&LocalCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| ProtocolError::Config("no local credentials".into()))
    }

    // ---- server handshake states ----

    /// Server: client version advertisement arrived.
    fn on_negotiate(&mut self, frame: ServerNegotiateFrame) -> Result<()> {
        if frame.min_version > MAX_VERSION || frame.max_version < MIN_VERSION {
            return Err(ProtocolError::VersionMismatch {
                peer_min: frame.min_version,
                peer_max: frame.max_version,
            });
        }
        self.version = frame.max_version.min(MAX_VERSION);
        debug!(
            peer_min = frame.min_version,
            peer_max = frame.max_version,
            version = self.version,
            "client versions accepted"
        );
        self.send_challenge()
    }

    fn send_challenge(&mut self) -> Result<()> {
        self.server_nonce = fresh_nonce();
        let challenge = ClientNegotiateFrame {
            min_version: MIN_VERSION,
            max_version: MAX_VERSION,
            is_mutual: self.require_mutual,
            difficulty: self.difficulty,
            nonce: self.server_nonce,
        };
        self.send_frame(&challenge)?;
        self.arm(PendingFrame::ServerExchange(ServerExchangeFrame::default()));
        Ok(())
    }

    /// Server: challenge response arrived. Verify the puzzle, settle the
    /// mutual-authentication question, and present our credential.
    fn on_challenge_response(&mut self, frame: ServerExchangeFrame) -> Result<()> {
        let puzzle = HashPuzzle::new(self.difficulty, &self.server_nonce)?;

        if !frame.success {
            // The client gave up on this challenge; reissue under a fresh
            // nonce, up to a budget.
            self.renegotiations += 1;
            if self.renegotiations >= RENEGOTIATE_LIMIT {
                return Err(ProtocolError::ChallengeFailed);
            }
            warn!(round = self.renegotiations, "challenge declined, reissuing");
            self.events.push_back(SessionEvent::ChallengeFailed);
            return self.send_challenge();
        }
        if !puzzle.verify(&frame.solution) {
            // A claimed solution that does not verify is an attack, not bad
            // luck.
            return Err(ProtocolError::ChallengeFailed);
        }

        self.client_nonce = frame.nonce;

        if frame.tag.is_empty() {
            if self.require_mutual {
                return Err(ProtocolError::MutualAuthRequired);
            }
            self.is_mutual = false;
        } else {
            let tag = Tag::from_bytes(&frame.tag)?;
            if tag.verify(&self.trusted_issuers) {
                self.is_mutual = true;
                self.peer_tag = Some(tag);
            } else if self.require_mutual {
                return Err(ProtocolError::InvalidTag(
                    "client tag failed verification".into(),
                ));
            } else {
                warn!("ignoring unverifiable client tag, continuing one-sided");
                self.is_mutual = false;
            }
        }

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret).to_bytes();
        self.key_agreement = Some(secret);

        let creds = self.credentials()?;
        let mutual_byte = [self.is_mutual as u8];
        let mut parts: Vec<&[u8]> = vec![&public_key, &self.client_nonce, &mutual_byte];
        let peer_tag_raw = self.peer_tag.as_ref().map(|t| t.raw().to_vec());
        if let Some(raw) = &peer_tag_raw {
            parts.push(raw);
        }
        let signature = creds.entity.sign(&parts)?;

        let credential = ClientExchangeFrame {
            is_mutual: self.is_mutual,
            tag: creds.tag.raw().to_vec(),
            public_key: public_key.to_vec(),
            signature: signature.as_bytes().to_vec(),
            ..Default::default()
        };
        self.send_frame(&credential)?;
        self.arm(PendingFrame::ServerValidate(ServerValidateFrame::default()));
        Ok(())
    }

    /// Server: client key confirmation arrived. Verify its binding when
    /// mutual, run key agreement, and switch to records.
    fn on_confirmation(&mut self, frame: ServerValidateFrame) -> Result<()> {
        let peer_public = parse_key_agreement_key(&frame.public_key)?;

        if self.is_mutual {
            let client_tag = self
                .peer_tag
                .as_ref()
                .ok_or(ProtocolError::InvalidSignature)?;
            let own_tag_raw = self.credentials()?.tag.raw().to_vec();
            let signature = Signature::from_slice(&frame.signature)?;
            let parts: [&[u8]; 3] = [&frame.public_key, &self.server_nonce, &own_tag_raw];
            if !client_tag.holder().verify(&parts, &signature) {
                return Err(ProtocolError::InvalidSignature);
            }
        }

        let secret = self
            .key_agreement
            .take()
            .ok_or_else(|| ProtocolError::Config("key agreement already consumed".into()))?;
        let shared = secret.diffie_hellman(&peer_public);

        self.start_record_layer(shared.as_bytes())?;
        self.validate_echo = false;
        self.arm(PendingFrame::ServerEcho(ServerEchoFrame::default()));
        debug!("record layer up, awaiting echo");
        Ok(())
    }

    /// Server: an encrypted echo probe arrived. The first carries the
    /// client's liveness nonce; the second must echo ours back.
    fn on_echo_probe(&mut self, frame: ServerEchoFrame) -> Result<()> {
        if !self.validate_echo {
            self.echo_nonce = fresh_nonce();
            let echo = ClientEchoFrame {
                client_nonce: frame.nonce,
                server_nonce: self.echo_nonce,
            };
            self.send_frame(&echo)?;
            self.validate_echo = true;
            self.arm(PendingFrame::ServerEcho(ServerEchoFrame::default()));
            Ok(())
        } else {
            if frame.nonce != self.echo_nonce {
                return Err(ProtocolError::NonceEchoFailed);
            }
            self.establish()
        }
    }

    // ---- client handshake states ----

    /// Client: the server's challenge arrived. Vet its parameters, work the
    /// puzzle, and answer.
    fn on_challenge(&mut self, frame: ClientNegotiateFrame) -> Result<()> {
        if frame.min_version > MAX_VERSION || frame.max_version < MIN_VERSION {
            return Err(ProtocolError::VersionMismatch {
                peer_min: frame.min_version,
                peer_max: frame.max_version,
            });
        }
        if frame.difficulty > MAX_DIFFICULTY {
            return Err(ProtocolError::DifficultyTooHigh {
                difficulty: frame.difficulty,
                max: MAX_DIFFICULTY,
            });
        }
        if frame.is_mutual && self.credentials.is_none() {
            return Err(ProtocolError::MutualAuthRequired);
        }

        self.version = frame.max_version.min(MAX_VERSION);
        self.server_nonce = frame.nonce;

        let puzzle = HashPuzzle::new(frame.difficulty, &self.server_nonce)?;
        let (success, solution) = match puzzle.solve() {
            Ok(solution) => (true, solution),
            Err(ProtocolError::ChallengeFailed) => (false, [0u8; 4]),
            Err(err) => return Err(err),
        };

        self.client_nonce = fresh_nonce();
        let tag = match &self.credentials {
            Some(creds) => creds.tag.raw().to_vec(),
            None => Vec::new(),
        };

        let response = ServerExchangeFrame {
            success,
            solution,
            nonce: self.client_nonce,
            tag,
            ..Default::default()
        };
        self.send_frame(&response)?;

        if success {
            self.arm(PendingFrame::ClientExchange(ClientExchangeFrame::default()));
        } else {
            // Expect a reissued challenge.
            self.events.push_back(SessionEvent::ChallengeFailed);
            self.arm(PendingFrame::ClientNegotiate(ClientNegotiateFrame::default()));
        }
        Ok(())
    }

    /// Client: the server's credential arrived. Authenticate the server,
    /// confirm our key, and switch to records.
    fn on_credential(&mut self, frame: ClientExchangeFrame) -> Result<()> {
        if self.require_mutual && !frame.is_mutual {
            return Err(ProtocolError::MutualAuthRequired);
        }

        let server_tag = Tag::from_bytes(&frame.tag)?;
        if !server_tag.verify(&self.trusted_issuers) {
            return Err(ProtocolError::InvalidTag(
                "server tag failed verification".into(),
            ));
        }

        let signature = Signature::from_slice(&frame.signature)?;
        let mutual_byte = [frame.is_mutual as u8];
        let mut parts: Vec<&[u8]> = vec![&frame.public_key, &self.client_nonce, &mutual_byte];
        let own_tag_raw = self.credentials.as_ref().map(|c| c.tag.raw().to_vec());
        if frame.is_mutual {
            match &own_tag_raw {
                Some(raw) => parts.push(raw),
                None => return Err(ProtocolError::MutualAuthRequired),
            }
        }
        if !server_tag.holder().verify(&parts, &signature) {
            return Err(ProtocolError::InvalidSignature);
        }

        self.is_mutual = frame.is_mutual;

        let peer_public = parse_key_agreement_key(&frame.public_key)?;
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret).to_bytes();

        // Under mutual authentication our confirmation binds our key to the
        // server's nonce and credential.
        let confirmation_signature = if self.is_mutual {
            let parts: [&[u8]; 3] = [&public_key, &self.server_nonce, frame.tag.as_slice()];
            self.credentials()?
                .entity
                .sign(&parts)?
                .as_bytes()
                .to_vec()
        } else {
            Vec::new()
        };

        let confirmation = ServerValidateFrame {
            public_key: public_key.to_vec(),
            signature: confirmation_signature,
            ..Default::default()
        };
        // The confirmation travels in the clear; everything after it is
        // sealed.
        self.send_frame(&confirmation)?;

        let shared = secret.diffie_hellman(&peer_public);
        self.start_record_layer(shared.as_bytes())?;

        self.echo_nonce = fresh_nonce();
        self.arm(PendingFrame::ClientEcho(ClientEchoFrame::default()));
        let probe = ServerEchoFrame {
            nonce: self.echo_nonce,
        };
        self.send_frame(&probe)?;
        debug!("record layer up, echo probe sent");
        Ok(())
    }

    /// Client: the server echoed our liveness nonce and sent its own.
    fn on_echo(&mut self, frame: ClientEchoFrame) -> Result<()> {
        if frame.client_nonce != self.echo_nonce {
            return Err(ProtocolError::NonceEchoFailed);
        }
        let probe = ServerEchoFrame {
            nonce: frame.server_nonce,
        };
        self.send_frame(&probe)?;
        self.establish()
    }

    // ---- shared transitions ----

    fn start_record_layer(&mut self, shared_secret: &[u8]) -> Result<()> {
        let keys = SessionKeys::derive(shared_secret, &self.server_nonce, &self.client_nonce)?;
        self.crypto = Some(match self.role {
            Role::Server => RecordCrypto::new(&keys.server, &keys.client),
            Role::Client => RecordCrypto::new(&keys.client, &keys.server),
        });
        self.encrypted = true;
        self.record_stage = RecordStage::Header;
        self.needed = RECORD_PREFIX_SIZE;
        Ok(())
    }

    fn establish(&mut self) -> Result<()> {
        self.established = true;
        self.pending = None;
        self.events.push_back(SessionEvent::Established);
        debug!(mutual = self.is_mutual, "session established");
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("established", &self.established)
            .field("failed", &self.failed)
            .field("mutual", &self.is_mutual)
            .finish()
    }
}

fn fresh_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn parse_key_agreement_key(bytes: &[u8]) -> Result<PublicKey> {
    let arr: [u8; KEY_AGREEMENT_KEY_SIZE] = bytes.try_into().map_err(|_| {
        ProtocolError::Frame(format!(
            "key agreement key must be {} bytes, got {}",
            KEY_AGREEMENT_KEY_SIZE,
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Entity;

    fn credentials() -> (LocalCredentials, TrustSet) {
        let issuer = Entity::generate();
        let holder = Entity::generate();
        let tag = Tag::issue(&issuer, &holder, 0, u64::MAX).unwrap();
        let mut trust = TrustSet::new();
        trust.add(&issuer);
        (LocalCredentials::new(holder, tag).unwrap(), trust)
    }

    fn client_session() -> Session {
        let (_, trust) = credentials();
        Session::client(ClientConfig {
            credentials: None,
            trusted_issuers: trust,
            require_mutual: false,
        })
        .unwrap()
    }

    fn server_session(difficulty: u8) -> Session {
        let (creds, trust) = credentials();
        Session::server(ServerConfig {
            credentials: creds,
            trusted_issuers: trust,
            require_mutual: false,
            difficulty,
        })
        .unwrap()
    }

    #[test]
    fn test_client_initialize_emits_version_advertisement() {
        let mut session = client_session();
        session.initialize().unwrap();

        match session.next_event() {
            Some(SessionEvent::DataEncoded { header, payload }) => {
                assert!(header.is_empty());
                assert_eq!(payload, vec![MIN_VERSION, MAX_VERSION]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(session.next_event().is_none());
    }

    #[test]
    fn test_server_initialize_emits_nothing() {
        let mut session = server_session(0);
        session.initialize().unwrap();
        assert!(session.next_event().is_none());
    }

    #[test]
    fn test_encode_before_establishment_rejected() {
        let mut session = client_session();
        session.initialize().unwrap();
        assert!(matches!(
            session.encode(b"too early"),
            Err(ProtocolError::NotEstablished)
        ));
    }

    #[test]
    fn test_server_rejects_nonoverlapping_versions() {
        let mut session = server_session(0);
        session.initialize().unwrap();

        let err = session.decode(&[MAX_VERSION + 1, MAX_VERSION + 5]).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));

        // Fatal: the session is now unusable.
        assert!(matches!(
            session.decode(&[1, 1]),
            Err(ProtocolError::SessionFailed)
        ));
    }

    #[test]
    fn test_client_rejects_excessive_difficulty() {
        let mut session = client_session();
        session.initialize().unwrap();
        session.next_event();

        let challenge = ClientNegotiateFrame {
            min_version: MIN_VERSION,
            max_version: MAX_VERSION,
            is_mutual: false,
            difficulty: MAX_DIFFICULTY + 1,
            nonce: [0; NONCE_LENGTH],
        };
        let err = session
            .decode(&challenge.serialize().unwrap())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DifficultyTooHigh { .. }));
    }

    #[test]
    fn test_client_without_credentials_rejects_mutual_demand() {
        let mut session = client_session();
        session.initialize().unwrap();
        session.next_event();

        let challenge = ClientNegotiateFrame {
            min_version: MIN_VERSION,
            max_version: MAX_VERSION,
            is_mutual: true,
            difficulty: 0,
            nonce: [0; NONCE_LENGTH],
        };
        let err = session
            .decode(&challenge.serialize().unwrap())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MutualAuthRequired));
    }

    #[test]
    fn test_server_config_difficulty_cap() {
        let (creds, trust) = credentials();
        let result = Session::server(ServerConfig {
            credentials: creds,
            trusted_issuers: trust,
            require_mutual: false,
            difficulty: MAX_DIFFICULTY + 1,
        });
        assert!(matches!(result, Err(ProtocolError::Config(_))));
    }

    #[test]
    fn test_client_config_mutual_needs_credentials() {
        let (_, trust) = credentials();
        let result = Session::client(ClientConfig {
            credentials: None,
            trusted_issuers: trust,
            require_mutual: true,
        });
        assert!(matches!(result, Err(ProtocolError::Config(_))));
    }

    #[test]
    fn test_client_config_needs_trusted_issuers() {
        let result = Session::client(ClientConfig {
            credentials: None,
            trusted_issuers: TrustSet::new(),
            require_mutual: false,
        });
        assert!(matches!(result, Err(ProtocolError::Config(_))));
    }

    #[test]
    fn test_version_settles_on_highest_shared() {
        let mut session = server_session(0);
        session.initialize().unwrap();
        assert_eq!(session.version(), 0);

        // Peer window reaches past ours; we settle on our own maximum.
        session.decode(&[MIN_VERSION, MAX_VERSION + 3]).unwrap();
        assert_eq!(session.version(), MAX_VERSION);
    }

    #[test]
    fn test_receive_buffer_sized_for_one_record() {
        assert_eq!(RECEIVE_BUFFER_SIZE, MAX_RECORD_PAYLOAD + RECORD_PREFIX_SIZE);

        let session = client_session();
        assert!(session.buffer.capacity() >= RECEIVE_BUFFER_SIZE);
    }

    #[test]
    fn test_byte_at_a_time_negotiate() {
        let mut session = server_session(0);
        session.initialize().unwrap();

        // Feeding one byte completes nothing.
        session.decode(&[MIN_VERSION]).unwrap();
        assert!(session.next_event().is_none());

        // The second byte completes the advertisement and triggers the
        // challenge.
        session.decode(&[MAX_VERSION]).unwrap();
        match session.next_event() {
            Some(SessionEvent::DataEncoded { header, payload }) => {
                assert!(header.is_empty());
                assert_eq!(payload.len(), ClientNegotiateFrame::INITIAL_SIZE);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
