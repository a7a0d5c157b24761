//! Full-session tests driving both endpoints through an in-memory pipe.

use protocol::{
    ClientConfig, Entity, LocalCredentials, ProtocolError, ServerConfig, Session, SessionEvent,
    Tag, TrustSet,
};

fn issue_credentials(issuer: &Entity) -> LocalCredentials {
    let holder = Entity::generate();
    let tag = Tag::issue(issuer, &holder, 0, u64::MAX).unwrap();
    LocalCredentials::new(holder, tag).unwrap()
}

fn trust(issuer: &Entity) -> TrustSet {
    let mut set = TrustSet::new();
    set.add(issuer);
    set
}

/// Everything one endpoint produced while being driven.
#[derive(Debug, Default)]
struct Outcome {
    decoded: Vec<Vec<u8>>,
    challenge_failures: usize,
}

/// Shuttles bytes between the two sessions in `chunk`-sized pieces until
/// both go quiet. Propagates the first decode error.
fn drive(
    client: &mut Session,
    server: &mut Session,
    chunk: usize,
) -> Result<(Outcome, Outcome), ProtocolError> {
    let mut client_out = Outcome::default();
    let mut server_out = Outcome::default();
    let mut to_server: Vec<u8> = Vec::new();
    let mut to_client: Vec<u8> = Vec::new();

    for _ in 0..10_000 {
        let mut progressed = false;

        while let Some(event) = client.next_event() {
            progressed = true;
            match event {
                SessionEvent::DataEncoded { header, payload } => {
                    to_server.extend_from_slice(&header);
                    to_server.extend_from_slice(&payload);
                }
                SessionEvent::DataDecoded(data) => client_out.decoded.push(data),
                SessionEvent::ChallengeFailed => client_out.challenge_failures += 1,
                SessionEvent::Established => {}
            }
        }
        while let Some(event) = server.next_event() {
            progressed = true;
            match event {
                SessionEvent::DataEncoded { header, payload } => {
                    to_client.extend_from_slice(&header);
                    to_client.extend_from_slice(&payload);
                }
                SessionEvent::DataDecoded(data) => server_out.decoded.push(data),
                SessionEvent::ChallengeFailed => server_out.challenge_failures += 1,
                SessionEvent::Established => {}
            }
        }

        if !to_server.is_empty() {
            progressed = true;
            let take = chunk.min(to_server.len());
            let piece: Vec<u8> = to_server.drain(..take).collect();
            server.decode(&piece)?;
        }
        if !to_client.is_empty() {
            progressed = true;
            let take = chunk.min(to_client.len());
            let piece: Vec<u8> = to_client.drain(..take).collect();
            client.decode(&piece)?;
        }

        if !progressed {
            return Ok((client_out, server_out));
        }
    }
    panic!("sessions never went quiet");
}

fn one_sided_pair(difficulty: u8) -> (Session, Session) {
    let issuer = Entity::generate();
    let client = Session::client(ClientConfig {
        credentials: None,
        trusted_issuers: trust(&issuer),
        require_mutual: false,
    })
    .unwrap();
    let server = Session::server(ServerConfig {
        credentials: issue_credentials(&issuer),
        trusted_issuers: trust(&issuer),
        require_mutual: false,
        difficulty,
    })
    .unwrap();
    (client, server)
}

fn mutual_pair(difficulty: u8) -> (Session, Session) {
    let issuer = Entity::generate();
    let client = Session::client(ClientConfig {
        credentials: Some(issue_credentials(&issuer)),
        trusted_issuers: trust(&issuer),
        require_mutual: true,
    })
    .unwrap();
    let server = Session::server(ServerConfig {
        credentials: issue_credentials(&issuer),
        trusted_issuers: trust(&issuer),
        require_mutual: true,
        difficulty,
    })
    .unwrap();
    (client, server)
}

fn establish(client: &mut Session, server: &mut Session, chunk: usize) {
    client.initialize().unwrap();
    server.initialize().unwrap();
    drive(client, server, chunk).unwrap();
    assert!(client.is_established());
    assert!(server.is_established());
}

#[test]
fn one_sided_handshake_completes() {
    let (mut client, mut server) = one_sided_pair(0);
    establish(&mut client, &mut server, usize::MAX);
    assert!(!client.is_mutual());
    assert!(!server.is_mutual());
    assert_eq!(client.version(), 1);
    assert_eq!(server.version(), 1);
}

#[test]
fn mutual_handshake_completes() {
    let (mut client, mut server) = mutual_pair(0);
    establish(&mut client, &mut server, usize::MAX);
    assert!(client.is_mutual());
    assert!(server.is_mutual());
}

#[test]
fn handshake_completes_under_real_difficulty() {
    let (mut client, mut server) = one_sided_pair(8);
    establish(&mut client, &mut server, usize::MAX);
}

#[test]
fn handshake_survives_byte_at_a_time_delivery() {
    let (mut client, mut server) = mutual_pair(0);
    establish(&mut client, &mut server, 1);
}

#[test]
fn handshake_survives_odd_chunking() {
    let (mut client, mut server) = one_sided_pair(4);
    establish(&mut client, &mut server, 7);
}

#[test]
fn unsolicited_client_tag_upgrades_to_mutual() {
    // The server does not demand a tag but trusts the client's issuer, so a
    // volunteered tag still authenticates the client.
    let issuer = Entity::generate();
    let mut client = Session::client(ClientConfig {
        credentials: Some(issue_credentials(&issuer)),
        trusted_issuers: trust(&issuer),
        require_mutual: false,
    })
    .unwrap();
    let mut server = Session::server(ServerConfig {
        credentials: issue_credentials(&issuer),
        trusted_issuers: trust(&issuer),
        require_mutual: false,
        difficulty: 0,
    })
    .unwrap();

    establish(&mut client, &mut server, usize::MAX);
    assert!(client.is_mutual());
    assert!(server.is_mutual());
}

#[test]
fn untrusted_client_tag_downgrades_when_not_required() {
    let server_issuer = Entity::generate();
    let rogue_issuer = Entity::generate();

    let mut client = Session::client(ClientConfig {
        credentials: Some(issue_credentials(&rogue_issuer)),
        trusted_issuers: trust(&server_issuer),
        require_mutual: false,
    })
    .unwrap();
    let mut server = Session::server(ServerConfig {
        credentials: issue_credentials(&server_issuer),
        trusted_issuers: trust(&server_issuer),
        require_mutual: false,
        difficulty: 0,
    })
    .unwrap();

    establish(&mut client, &mut server, usize::MAX);
    assert!(!client.is_mutual());
    assert!(!server.is_mutual());
}

#[test]
fn untrusted_client_tag_fatal_when_required() {
    let server_issuer = Entity::generate();
    let rogue_issuer = Entity::generate();

    let mut client = Session::client(ClientConfig {
        credentials: Some(issue_credentials(&rogue_issuer)),
        trusted_issuers: trust(&server_issuer),
        require_mutual: false,
    })
    .unwrap();
    let mut server = Session::server(ServerConfig {
        credentials: issue_credentials(&server_issuer),
        trusted_issuers: trust(&server_issuer),
        require_mutual: true,
        difficulty: 0,
    })
    .unwrap();

    client.initialize().unwrap();
    server.initialize().unwrap();
    let err = drive(&mut client, &mut server, usize::MAX).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidTag(_)));
}

#[test]
fn client_requiring_mutual_rejects_downgrade() {
    // The server never learns to trust the client's issuer, answers with
    // mutual off, and the client refuses to continue one-sided.
    let server_issuer = Entity::generate();
    let client_issuer = Entity::generate();

    let mut client = Session::client(ClientConfig {
        credentials: Some(issue_credentials(&client_issuer)),
        trusted_issuers: trust(&server_issuer),
        require_mutual: true,
    })
    .unwrap();
    let mut server = Session::server(ServerConfig {
        credentials: issue_credentials(&server_issuer),
        trusted_issuers: trust(&server_issuer),
        require_mutual: false,
        difficulty: 0,
    })
    .unwrap();

    client.initialize().unwrap();
    server.initialize().unwrap();
    let err = drive(&mut client, &mut server, usize::MAX).unwrap_err();
    assert!(matches!(err, ProtocolError::MutualAuthRequired));
}

#[test]
fn client_rejects_untrusted_server() {
    let client_trusted = Entity::generate();
    let server_issuer = Entity::generate();

    let mut client = Session::client(ClientConfig {
        credentials: None,
        trusted_issuers: trust(&client_trusted),
        require_mutual: false,
    })
    .unwrap();
    let mut server = Session::server(ServerConfig {
        credentials: issue_credentials(&server_issuer),
        trusted_issuers: trust(&server_issuer),
        require_mutual: false,
        difficulty: 0,
    })
    .unwrap();

    client.initialize().unwrap();
    server.initialize().unwrap();
    let err = drive(&mut client, &mut server, usize::MAX).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidTag(_)));
}

#[test]
fn data_roundtrips_after_establishment() {
    let (mut client, mut server) = one_sided_pair(0);
    establish(&mut client, &mut server, usize::MAX);

    client.encode(b"hello from the client").unwrap();
    server.encode(b"hello from the server").unwrap();

    let (client_out, server_out) = drive(&mut client, &mut server, usize::MAX).unwrap();
    assert_eq!(server_out.decoded, vec![b"hello from the client".to_vec()]);
    assert_eq!(client_out.decoded, vec![b"hello from the server".to_vec()]);
}

#[test]
fn data_survives_byte_at_a_time_delivery() {
    let (mut client, mut server) = one_sided_pair(0);
    establish(&mut client, &mut server, usize::MAX);

    client.encode(b"dripped").unwrap();
    let (_, server_out) = drive(&mut client, &mut server, 1).unwrap();
    assert_eq!(server_out.decoded, vec![b"dripped".to_vec()]);
}

#[test]
fn zero_length_payload_roundtrips() {
    let (mut client, mut server) = one_sided_pair(0);
    establish(&mut client, &mut server, usize::MAX);

    client.encode(b"").unwrap();
    client.encode(b"after the empty one").unwrap();

    let (_, server_out) = drive(&mut client, &mut server, usize::MAX).unwrap();
    assert_eq!(
        server_out.decoded,
        vec![Vec::new(), b"after the empty one".to_vec()]
    );
}

#[test]
fn maximum_record_payload_roundtrips() {
    let (mut client, mut server) = one_sided_pair(0);
    establish(&mut client, &mut server, usize::MAX);

    let payload = vec![0xA7u8; 65535];
    client.encode(&payload).unwrap();

    let (_, server_out) = drive(&mut client, &mut server, usize::MAX).unwrap();
    assert_eq!(server_out.decoded, vec![payload]);
}

#[test]
fn oversized_payload_splits_into_records() {
    let (mut client, mut server) = one_sided_pair(0);
    establish(&mut client, &mut server, usize::MAX);

    let payload = vec![0x3Cu8; 70_000];
    client.encode(&payload).unwrap();

    let (_, server_out) = drive(&mut client, &mut server, usize::MAX).unwrap();
    assert_eq!(server_out.decoded.len(), 2);
    assert_eq!(server_out.decoded[0].len(), 65535);
    assert_eq!(server_out.decoded[1].len(), 70_000 - 65535);

    let mut joined = server_out.decoded[0].clone();
    joined.extend_from_slice(&server_out.decoded[1]);
    assert_eq!(joined, payload);
}

#[test]
fn payloads_arrive_in_order() {
    let (mut client, mut server) = one_sided_pair(0);
    establish(&mut client, &mut server, usize::MAX);

    for i in 0u8..20 {
        client.encode(&[i; 5]).unwrap();
    }

    let (_, server_out) = drive(&mut client, &mut server, 3).unwrap();
    let expected: Vec<Vec<u8>> = (0u8..20).map(|i| vec![i; 5]).collect();
    assert_eq!(server_out.decoded, expected);
}

#[test]
fn tampered_record_dropped_session_survives() {
    let (mut client, mut server) = one_sided_pair(0);
    establish(&mut client, &mut server, usize::MAX);

    client.encode(b"will be mangled").unwrap();
    let mut wire = Vec::new();
    while let Some(event) = client.next_event() {
        if let SessionEvent::DataEncoded { header, payload } = event {
            wire.extend_from_slice(&header);
            wire.extend_from_slice(&payload);
        }
    }

    // Flip one ciphertext bit; the length stays honest so framing holds.
    let last = wire.len() - 1;
    wire[last] ^= 0x01;
    let err = server.decode(&wire).unwrap_err();
    assert!(matches!(err, ProtocolError::RecordIntegrity));
    assert!(server.next_event().is_none());

    // Both keystreams are still aligned; traffic keeps flowing.
    client.encode(b"and this one is clean").unwrap();
    let (_, server_out) = drive(&mut client, &mut server, usize::MAX).unwrap();
    assert_eq!(server_out.decoded, vec![b"and this one is clean".to_vec()]);
}

#[test]
fn both_directions_interleave() {
    let (mut client, mut server) = mutual_pair(4);
    establish(&mut client, &mut server, usize::MAX);

    client.encode(b"ping").unwrap();
    server.encode(b"pong").unwrap();
    client.encode(b"ping again").unwrap();

    let (client_out, server_out) = drive(&mut client, &mut server, 11).unwrap();
    assert_eq!(
        server_out.decoded,
        vec![b"ping".to_vec(), b"ping again".to_vec()]
    );
    assert_eq!(client_out.decoded, vec![b"pong".to_vec()]);
}
