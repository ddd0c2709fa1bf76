//! Session key derivation and the per-peer WHOAREYOU handshake state machine.
//!
//! Key derivation, challenge-data construction, and id-signature
//! sign/verify are ported near-verbatim from `discv5/session.rs` (down to
//! the HKDF info string and digest construction, since these are protocol
//! constants rather than implementation choices) and re-expressed against
//! [`CryptoProvider`] instead of calling `secp256k1`/`sha2` directly. The
//! state machine itself is new: the teacher file only has the crypto
//! primitives, not a handshake FSM.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use rustc_hash::FxHashMap;
use secp256k1::{PublicKey, SecretKey};

use crate::crypto::CryptoProvider;
use crate::error::SessionError;
use crate::node::{Enr, NodeId};

pub type NodeAddress = (NodeId, SocketAddr);

/// A derived pair of direction keys for one established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub outbound_key: [u8; 16],
    pub inbound_key: [u8; 16],
}

/// `masking-iv || static-header || authdata` of a WHOAREYOU packet: the HKDF
/// salt and the id-signature's AAD commitment.
pub fn build_challenge_data(masking_iv: &[u8], static_header: &[u8], authdata: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(masking_iv.len() + static_header.len() + authdata.len());
    data.extend_from_slice(masking_iv);
    data.extend_from_slice(static_header);
    data.extend_from_slice(authdata);
    data
}

/// Derives `(outbound_key, inbound_key)` from a handshake's ECDH secret.
///
/// `secret_key`/`public_key` are the two sides of the ECDH exchange
/// (ephemeral key + dest static pubkey for the initiator; static key +
/// ephemeral pubkey for the recipient). `node_id_a` is always the
/// initiator's NodeId, `node_id_b` the recipient's, regardless of which
/// side is deriving.
pub fn derive_session_keys(
    crypto: &impl CryptoProvider,
    secret_key: &SecretKey,
    public_key: &PublicKey,
    node_id_a: &NodeId,
    node_id_b: &NodeId,
    challenge_data: &[u8],
    is_initiator: bool,
) -> Result<Session, SessionError> {
    let shared_secret = crypto.ecdh_compressed(secret_key, public_key);

    let mut info = b"discovery v5 key agreement".to_vec();
    info.extend_from_slice(node_id_a.as_bytes());
    info.extend_from_slice(node_id_b.as_bytes());

    let key_data = crypto
        .hkdf_derive(challenge_data, &shared_secret, &info, 32)
        .map_err(|_| SessionError::HandshakeTimeout)?;

    let mut initiator_key = [0u8; 16];
    let mut recipient_key = [0u8; 16];
    initiator_key.copy_from_slice(&key_data[..16]);
    recipient_key.copy_from_slice(&key_data[16..]);

    Ok(if is_initiator {
        Session { outbound_key: initiator_key, inbound_key: recipient_key }
    } else {
        Session { outbound_key: recipient_key, inbound_key: initiator_key }
    })
}

fn id_signature_input(challenge_data: &[u8], ephemeral_pubkey: &[u8], node_id_b: &NodeId) -> Vec<u8> {
    let mut input = b"discovery v5 identity proof".to_vec();
    input.extend_from_slice(challenge_data);
    input.extend_from_slice(ephemeral_pubkey);
    input.extend_from_slice(node_id_b.as_bytes());
    input
}

pub fn create_id_signature(
    crypto: &impl CryptoProvider,
    static_key: &SecretKey,
    challenge_data: &[u8],
    ephemeral_pubkey: &[u8],
    node_id_b: &NodeId,
) -> Result<secp256k1::ecdsa::Signature, SessionError> {
    let digest = crypto.sha256(&id_signature_input(challenge_data, ephemeral_pubkey, node_id_b));
    crypto.sign(static_key, &digest).map_err(|_| SessionError::HandshakeTimeout)
}

pub fn verify_id_signature(
    crypto: &impl CryptoProvider,
    src_pubkey: &PublicKey,
    challenge_data: &[u8],
    ephemeral_pubkey: &[u8],
    node_id_b: &NodeId,
    signature: &secp256k1::ecdsa::Signature,
) -> bool {
    let digest = crypto.sha256(&id_signature_input(challenge_data, ephemeral_pubkey, node_id_b));
    crypto.verify(src_pubkey, &digest, signature)
}

/// State of a per-[`NodeAddress`] handshake, per SPEC_FULL §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    RandomSent,
    WhoAreYouSent,
    AwaitingSession,
    Established,
    /// An `Established` session whose inbound decrypt failed: the old keys
    /// are kept as a fallback (the peer may retry with them) while a fresh
    /// WHOAREYOU is outstanding, rather than discarding state immediately
    /// the way a first-time `WhoAreYouSent` does.
    EstablishedAwaitingResponse,
}

#[derive(Debug)]
struct Challenge {
    challenge_data: Vec<u8>,
    remote_enr_seq: u64,
    sent_at: Instant,
}

#[derive(Debug)]
struct PeerSession {
    addr: NodeAddress,
    state: SessionState,
    keys: Option<Session>,
    challenge: Option<Challenge>,
    buffered: VecDeque<Vec<u8>>,
    last_seen: Instant,
}

impl PeerSession {
    fn new(addr: NodeAddress) -> Self {
        PeerSession {
            addr,
            state: SessionState::RandomSent,
            keys: None,
            challenge: None,
            buffered: VecDeque::new(),
            last_seen: Instant::now(),
        }
    }
}

/// Handshake material the caller needs to assemble and send a Handshake
/// packet after a WHOAREYOU reply arrives.
pub struct HandshakeToSend {
    pub ephemeral_pubkey: [u8; 33],
    pub id_signature: Vec<u8>,
    pub session: Session,
    pub buffered_plaintext: Vec<Vec<u8>>,
}

/// Owns every peer's handshake state. Driven entirely by the service task;
/// holds no socket or timer of its own (SPEC_FULL §5: one logical task, no
/// locking).
#[derive(Debug)]
pub struct SessionManager<C: CryptoProvider> {
    crypto: C,
    local_node_id: NodeId,
    sessions: FxHashMap<NodeAddress, PeerSession>,
    /// Our outbound packet nonce -> the address it was sent to, so an
    /// inbound WHOAREYOU (addressed only by socket, not NodeAddress) can be
    /// matched back to the request that provoked it. Mirrors the teacher's
    /// `pending_by_nonce` map in `server.rs`.
    pending_by_nonce: FxHashMap<[u8; 12], NodeAddress>,
    pub handshake_timeout: Duration,
    pub session_timeout: Duration,
}

impl<C: CryptoProvider> SessionManager<C> {
    pub fn new(local_node_id: NodeId, crypto: C, handshake_timeout: Duration, session_timeout: Duration) -> Self {
        SessionManager {
            crypto,
            local_node_id,
            sessions: FxHashMap::default(),
            pending_by_nonce: FxHashMap::default(),
            handshake_timeout,
            session_timeout,
        }
    }

    pub fn state(&self, addr: &NodeAddress) -> Option<SessionState> {
        self.sessions.get(addr).map(|s| s.state)
    }

    /// The destination a pending nonce was sent to, so a caller can look up
    /// its static pubkey before calling [`Self::handle_whoareyou`].
    pub fn addr_for_nonce(&self, nonce: &[u8; 12]) -> Option<NodeAddress> {
        self.pending_by_nonce.get(nonce).copied()
    }

    pub fn established_keys(&self, addr: &NodeAddress) -> Option<&Session> {
        self.sessions.get(addr).filter(|s| {
            matches!(s.state, SessionState::Established | SessionState::EstablishedAwaitingResponse)
        }).and_then(|s| s.keys.as_ref())
    }

    pub fn remove(&mut self, addr: &NodeAddress) {
        self.sessions.remove(addr);
        self.pending_by_nonce.retain(|_, a| a != addr);
    }

    /// No session exists yet (or the previous one timed out): send a Random
    /// packet and buffer `plaintext` until the handshake completes.
    pub fn begin_random(&mut self, addr: NodeAddress, nonce: [u8; 12], plaintext: Vec<u8>) {
        let mut session = PeerSession::new(addr);
        session.buffered.push_back(plaintext);
        self.sessions.insert(addr, session);
        self.pending_by_nonce.insert(nonce, addr);
    }

    /// Queues an additional message on a handshake already in flight.
    /// Returns `false` (and does nothing) if the session is already
    /// established, since the caller should send directly in that case.
    pub fn buffer_if_pending(&mut self, addr: &NodeAddress, plaintext: Vec<u8>) -> bool {
        match self.sessions.get_mut(addr) {
            Some(session) if !matches!(session.state, SessionState::Established) => {
                session.buffered.push_back(plaintext);
                true
            }
            _ => false,
        }
    }

    /// We failed to decrypt an inbound Ordinary packet (or have no session
    /// at all): build a fresh WHOAREYOU challenge and remember it for when
    /// the Handshake reply arrives. The caller records the challenge-data
    /// and the remote's last-known ENR seq afterwards via
    /// `remember_challenge`.
    pub fn handle_decrypt_failure(&mut self, addr: NodeAddress) -> [u8; 16] {
        let mut id_nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_nonce);

        let entry = self.sessions.entry(addr).or_insert_with(|| PeerSession::new(addr));
        entry.state = match entry.state {
            SessionState::Established | SessionState::EstablishedAwaitingResponse => {
                SessionState::EstablishedAwaitingResponse
            }
            _ => SessionState::WhoAreYouSent,
        };
        entry.last_seen = Instant::now();
        id_nonce
    }

    /// Records the full challenge-data of a WHOAREYOU we just sent, so a
    /// later Handshake reply's id-signature can be verified against it.
    pub fn remember_challenge(&mut self, addr: &NodeAddress, challenge_data: Vec<u8>, remote_enr_seq: u64) {
        if let Some(session) = self.sessions.get_mut(addr) {
            session.challenge = Some(Challenge { challenge_data, remote_enr_seq, sent_at: Instant::now() });
        }
    }

    /// The remote ENR-seq last advertised to us before the current
    /// handshake began, if any. Lets the caller decide whether the ENR
    /// carried in a completed Handshake is newer than what's already known.
    pub fn remembered_remote_enr_seq(&self, addr: &NodeAddress) -> Option<u64> {
        self.sessions.get(addr).and_then(|s| s.challenge.as_ref()).map(|c| c.remote_enr_seq)
    }

    /// An inbound WHOAREYOU matched one of our pending nonces: we are the
    /// initiator. Generates an ephemeral keypair, derives session keys,
    /// signs the challenge, and returns everything needed to build and send
    /// a Handshake packet. Drains and returns any buffered plaintext.
    pub fn handle_whoareyou(
        &mut self,
        nonce: &[u8; 12],
        challenge_data: &[u8],
        dest_static_pubkey: &PublicKey,
        local_static_key: &SecretKey,
        remote_node_id: &NodeId,
    ) -> Result<HandshakeToSend, SessionError> {
        let addr = *self.pending_by_nonce.get(nonce).ok_or(SessionError::NoSession)?;
        let session_entry = self.sessions.get_mut(&addr).ok_or(SessionError::NoSession)?;

        let mut ephemeral_secret_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ephemeral_secret_bytes);
        let ephemeral_secret = SecretKey::from_slice(&ephemeral_secret_bytes).map_err(|_| SessionError::NoSession)?;
        let ephemeral_pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, &ephemeral_secret);

        let session = derive_session_keys(
            &self.crypto,
            &ephemeral_secret,
            dest_static_pubkey,
            &self.local_node_id,
            remote_node_id,
            challenge_data,
            true,
        )?;

        let eph_pubkey_compressed = ephemeral_pubkey.serialize();
        let id_signature =
            create_id_signature(&self.crypto, local_static_key, challenge_data, &eph_pubkey_compressed, remote_node_id)?;

        session_entry.state = SessionState::AwaitingSession;
        session_entry.keys = Some(session.clone());
        let buffered_plaintext: Vec<Vec<u8>> = session_entry.buffered.drain(..).collect();

        Ok(HandshakeToSend {
            ephemeral_pubkey: eph_pubkey_compressed,
            id_signature: id_signature.serialize_compact().to_vec(),
            session,
            buffered_plaintext,
        })
    }

    /// An inbound Handshake packet arrived: we are the recipient. Verifies
    /// the id-signature against the challenge-data we remembered when we
    /// sent the WHOAREYOU, derives session keys via ECDH against the
    /// ephemeral pubkey, and installs the session as `Established`.
    pub fn handle_handshake(
        &mut self,
        addr: NodeAddress,
        src_node_id: &NodeId,
        src_static_pubkey: &PublicKey,
        ephemeral_pubkey: &PublicKey,
        id_signature: &secp256k1::ecdsa::Signature,
        local_static_key: &SecretKey,
    ) -> Result<Session, SessionError> {
        let session_entry = self.sessions.get_mut(&addr).ok_or(SessionError::NoSession)?;
        let challenge = session_entry.challenge.take().ok_or(SessionError::NoSession)?;

        let eph_pubkey_compressed = ephemeral_pubkey.serialize();
        if !verify_id_signature(
            &self.crypto,
            src_static_pubkey,
            &challenge.challenge_data,
            &eph_pubkey_compressed,
            &self.local_node_id,
            id_signature,
        ) {
            return Err(SessionError::HandshakeTimeout);
        }

        let session = derive_session_keys(
            &self.crypto,
            local_static_key,
            ephemeral_pubkey,
            src_node_id,
            &self.local_node_id,
            &challenge.challenge_data,
            false,
        )?;

        session_entry.state = SessionState::Established;
        session_entry.keys = Some(session.clone());
        session_entry.last_seen = Instant::now();
        Ok(session)
    }

    /// A message decrypted successfully under an already-established
    /// session: clears any stale "awaiting response" half-handshake.
    pub fn mark_ordinary_success(&mut self, addr: &NodeAddress) {
        if let Some(session) = self.sessions.get_mut(addr) {
            session.state = SessionState::Established;
            session.challenge = None;
            session.last_seen = Instant::now();
        }
    }

    /// Drops handshakes that have been outstanding longer than
    /// `handshake_timeout` and established sessions idle longer than
    /// `session_timeout`. Returns the addresses dropped so the caller can
    /// fail their buffered requests with `Shutdown`/`Timeout`.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<NodeAddress> {
        let mut dropped = Vec::new();
        self.sessions.retain(|&addr, session| {
            let expired = match session.state {
                SessionState::Established => now.duration_since(session.last_seen) > self.session_timeout,
                _ => now.duration_since(session.last_seen) > self.handshake_timeout,
            };
            if expired {
                dropped.push(addr);
            }
            !expired
        });
        self.pending_by_nonce.retain(|_, a| !dropped.contains(a));
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptoProvider;
    use ethereum_types::H256;
    use hex_literal::hex;

    #[test]
    fn derivation_matches_vector() {
        let crypto = DefaultCryptoProvider;
        let ephemeral_key = SecretKey::from_slice(&hex!(
            "fb757dc581730490a1d7a00deea65e9b1936924caaea8f44d476014856b68736"
        ))
        .unwrap();
        let dest_pubkey = PublicKey::from_slice(&hex!(
            "0317931e6e0840220642f230037d285d122bc59063221ef3226b1f403ddc69ca91"
        ))
        .unwrap();
        let node_id_a = H256::from_slice(&hex!(
            "aaaa8419e9f49d0083561b48287df592939a8d19947d8c0ef88f2a4856a69fbb"
        ));
        let node_id_b = H256::from_slice(&hex!(
            "bbbb9d047f0488c0b5a93c1c3f2d8bafc7c8ff337024a55434a0d0555de64db9"
        ));
        let challenge_data = hex!(
            "000000000000000000000000000000006469736376350001010102030405060708090a0b0c00180102030405060708090a0b0c0d0e0f100000000000000000"
        );

        let session = derive_session_keys(
            &crypto,
            &ephemeral_key,
            &dest_pubkey,
            &node_id_a,
            &node_id_b,
            &challenge_data,
            true,
        )
        .unwrap();
        assert_eq!(session.outbound_key, hex!("dccc82d81bd610f4f76d3ebe97a40571"));
        assert_eq!(session.inbound_key, hex!("ac74bb8773749920b0d3a8881c173ec5"));
    }

    #[test]
    fn id_signature_matches_vector() {
        let crypto = DefaultCryptoProvider;
        let static_key = SecretKey::from_slice(&hex!(
            "fb757dc581730490a1d7a00deea65e9b1936924caaea8f44d476014856b68736"
        ))
        .unwrap();
        let challenge_data = hex!(
            "000000000000000000000000000000006469736376350001010102030405060708090a0b0c00180102030405060708090a0b0c0d0e0f100000000000000000"
        );
        let ephemeral_pubkey =
            hex!("039961e4c2356d61bedb83052c115d311acb3a96f5777296dcf297351130266231");
        let node_id_b = H256::from_slice(&hex!(
            "bbbb9d047f0488c0b5a93c1c3f2d8bafc7c8ff337024a55434a0d0555de64db9"
        ));

        let signature =
            create_id_signature(&crypto, &static_key, &challenge_data, &ephemeral_pubkey, &node_id_b).unwrap();
        assert_eq!(
            signature.serialize_compact().as_slice(),
            hex!(
                "94852a1e2318c4e5e9d422c98eaf19d1d90d876b29cd06ca7cb7546d0fff7b484fe86c09a064fe72bdbef73ba8e9c34df0cd2b53e9d65528c2c7f336d5dfc6e6"
            )
        );

        let src_pubkey = static_key.public_key(secp256k1::SECP256K1);
        assert!(verify_id_signature(
            &crypto,
            &src_pubkey,
            &challenge_data,
            &ephemeral_pubkey,
            &node_id_b,
            &signature
        ));
    }

    fn addr(port: u16) -> NodeAddress {
        (NodeId::from_low_u64_be(port as u64), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn random_sent_buffers_and_times_out() {
        let local_id = NodeId::from_low_u64_be(1);
        let mut manager = SessionManager::new(
            local_id,
            DefaultCryptoProvider,
            Duration::from_millis(1),
            Duration::from_secs(60),
        );
        let peer = addr(9000);
        manager.begin_random(peer, [1u8; 12], b"ping".to_vec());
        assert_eq!(manager.state(&peer), Some(SessionState::RandomSent));

        std::thread::sleep(Duration::from_millis(5));
        let dropped = manager.sweep_timeouts(Instant::now());
        assert_eq!(dropped, vec![peer]);
        assert_eq!(manager.state(&peer), None);
    }

    #[test]
    fn full_handshake_round_trip_establishes_matching_keys() {
        let initiator_id = NodeId::from_low_u64_be(0xa11ce);
        let recipient_id = NodeId::from_low_u64_be(0xb0b);
        let recipient_static_key = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let recipient_static_pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, &recipient_static_key);
        let initiator_static_key = SecretKey::from_slice(&[0x24u8; 32]).unwrap();
        let initiator_static_pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, &initiator_static_key);

        let mut initiator = SessionManager::new(
            initiator_id,
            DefaultCryptoProvider,
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        let mut recipient = SessionManager::new(
            recipient_id,
            DefaultCryptoProvider,
            Duration::from_secs(5),
            Duration::from_secs(60),
        );

        let peer_addr_at_initiator = (recipient_id, SocketAddr::from(([127, 0, 0, 1], 9001)));
        let peer_addr_at_recipient = (initiator_id, SocketAddr::from(([127, 0, 0, 1], 9000)));
        let nonce = [7u8; 12];
        initiator.begin_random(peer_addr_at_initiator, nonce, b"ping".to_vec());

        let challenge_data = build_challenge_data(&[1u8; 16], &[2u8; 23], &[3u8; 24]);
        recipient.sessions.insert(peer_addr_at_recipient, {
            let mut s = PeerSession::new(peer_addr_at_recipient);
            s.state = SessionState::WhoAreYouSent;
            s
        });
        recipient.remember_challenge(&peer_addr_at_recipient, challenge_data.clone(), 0);

        let handshake = initiator
            .handle_whoareyou(&nonce, &challenge_data, &recipient_static_pubkey, &initiator_static_key, &recipient_id)
            .unwrap();
        assert_eq!(handshake.buffered_plaintext, vec![b"ping".to_vec()]);
        assert_eq!(initiator.state(&peer_addr_at_initiator), Some(SessionState::AwaitingSession));

        let ephemeral_pubkey = PublicKey::from_slice(&handshake.ephemeral_pubkey).unwrap();
        let signature = secp256k1::ecdsa::Signature::from_compact(&handshake.id_signature).unwrap();

        let recipient_session = recipient
            .handle_handshake(
                peer_addr_at_recipient,
                &initiator_id,
                &initiator_static_pubkey,
                &ephemeral_pubkey,
                &signature,
                &recipient_static_key,
            )
            .unwrap();

        assert_eq!(recipient.state(&peer_addr_at_recipient), Some(SessionState::Established));
        assert_eq!(recipient_session.outbound_key, handshake.session.inbound_key);
        assert_eq!(recipient_session.inbound_key, handshake.session.outbound_key);
    }
}
