//! Shackle protocol: a mutually-authenticated encrypted channel over any
//! ordered byte stream.
//!
//! The crate is transport-agnostic. A [`Session`] never touches a socket;
//! the caller feeds it received bytes and ships out whatever it emits, so
//! the same state machine runs over TCP, a pipe, or an in-memory test
//! harness.
//!
//! # Handshake
//!
//! 1. **Negotiate** — the client advertises its version window; the server
//!    answers with its own window, a proof-of-work difficulty, a random
//!    nonce, and whether it demands mutual authentication.
//! 2. **Exchange** — the client solves the hashcash puzzle over the
//!    server's nonce and responds with the solution, its own nonce, and
//!    optionally its tag. The server checks the solution, settles the
//!    mutual-authentication question, and presents its tag plus an
//!    ephemeral X25519 key under a binding signature.
//! 3. **Validate** — the client authenticates the server, confirms its own
//!    ephemeral key (signed, when mutual), and both sides derive
//!    directional keys via HKDF-SHA-256 salted with both nonces.
//! 4. **Echo** — each side proves liveness under the new keys by having a
//!    random nonce echoed back, then the session is established.
//!
//! # Record layer
//!
//! Established traffic travels in records of
//! `[MAC:16][encrypted length:2][ciphertext]`, encrypted with a continuous
//! AES-128-CTR keystream per direction and authenticated with truncated
//! HMAC-SHA-256 over an implicit record counter. Replay, reordering, and
//! tampering all surface as integrity failures; a failed record is dropped
//! without killing the session.
//!
//! # Example
//!
//! ```no_run
//! use protocol::{ClientConfig, Session, SessionEvent, TrustSet};
//!
//! # fn main() -> protocol::Result<()> {
//! let mut session = Session::client(ClientConfig {
//!     credentials: None,
//!     trusted_issuers: load_trusted_issuers(),
//!     require_mutual: false,
//! })?;
//! session.initialize()?;
//!
//! loop {
//!     while let Some(event) = session.next_event() {
//!         match event {
//!             SessionEvent::DataEncoded { header, payload } => {
//!                 // write header then payload to the transport
//!             }
//!             SessionEvent::DataDecoded(data) => { /* application bytes */ }
//!             SessionEvent::Established => break,
//!             SessionEvent::ChallengeFailed => { /* retrying */ }
//!         }
//!     }
//!     // session.decode(&received_bytes)?;
//!     # break;
//! }
//! # Ok(())
//! # }
//! # fn load_trusted_issuers() -> TrustSet { TrustSet::new() }
//! ```

pub mod ctr;
pub mod error;
pub mod frames;
pub mod hkdf;
pub mod identity;
pub mod puzzle;
pub mod record;
pub mod session;

pub use error::{ProtocolError, Result};
pub use identity::{Entity, LocalCredentials, Signature, Tag, TrustSet};
pub use puzzle::HashPuzzle;
pub use session::{ClientConfig, ServerConfig, Session, SessionEvent, MAX_DIFFICULTY};
