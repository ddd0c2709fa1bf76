//! The orchestrator tying the session/routing/request/lookup layers to a
//! real UDP socket behind a single `GenServer` actor task.
//!
//! Grounded on `discv5/server.rs`'s `DiscoveryServer` (actor shape, the
//! `UdpFramed`+`spawn_listener` inbound path, `send_interval`-driven
//! timers, `pending_by_nonce`/challenge bookkeeping) and `discv5/peer_table.rs`'s
//! `PeerTable` (the public `Clone`-able wrapper over a `GenServerHandle`,
//! with private `Call`/`Cast`/`Reply` enums). Request/response methods
//! (`find_node`, `send_ping`, `send_talk_req`) can't block the actor for a
//! whole round trip the way the teacher's fire-and-forget casts do, since
//! that would stall every other peer's traffic on the same task: instead
//! `handle_call` registers the request with [`crate::requests::RequestEngine`]
//! and replies immediately with a oneshot receiver, which the public method
//! awaits outside the actor.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use rustc_hash::FxHashMap;
use secp256k1::{PublicKey, ecdsa::Signature};
use spawned_concurrency::tasks::{
    CallResponse, CastResponse, GenServer, GenServerHandle, InitResult, send_interval, send_message_on,
    spawn_listener,
};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tokio_util::udp::UdpFramed;
use tracing::{debug, trace, warn};

use crate::config::Discv5Config;
use crate::crypto::{CryptoProvider, DefaultCryptoProvider};
use crate::error::{Discv5Error, RequestError};
use crate::lookup::run_lookup;
use crate::message::{Message, RequestId};
use crate::node::{Enr, LocalEnr, NodeError, NodeId};
use crate::packet::{Authdata, Discv5Codec, FLAG_HANDSHAKE, FLAG_ORDINARY, FLAG_WHOAREYOU, Packet};
use crate::requests::{RequestEngine, RequestKind, RequestOutcome, ResponseEffect};
use crate::routing_table::{InsertOutcome, RoutingTable};
use crate::session::{NodeAddress, Session, SessionManager, SessionState};

/// How often outstanding requests and handshakes are swept for timeouts.
/// Finer-grained than [`Discv5Config::request_timeout`] so a request times
/// out close to its declared budget rather than up to a whole extra sweep
/// period late.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// UDP packet-size bound on a single NODES reply, per the discv5 wire spec.
/// Mirrors `discv5/server.rs`'s `MAX_ENRS_PER_MESSAGE`.
const MAX_ENRS_PER_MESSAGE: usize = 3;

/// Notifications a caller can subscribe to instead of polling the service.
#[derive(Debug, Clone)]
pub enum Discv5Event {
    /// An inbound TALKREQ. The caller answers it with
    /// [`Discv5Service::send_talk_resp`] using the same `request_id`.
    TalkRequest { from: NodeAddress, enr: Option<Enr>, request_id: RequestId, protocol: Bytes, request: Bytes },
    /// `add_enr` was called (directly, or via the CLI/config bootstrap set).
    EnrAdded(Enr),
    /// A new ENR was learned through a FINDNODE/NODES exchange.
    Discovered(Enr),
    /// A WHOAREYOU handshake with this peer completed.
    SessionEstablished(Enr),
}

/// `masking-iv || static-header || authdata` of a packet about to be sent,
/// computed before the ciphertext exists: [`Packet::encode`] takes an
/// already-encrypted `ciphertext`, so the AAD for that encryption has to be
/// assembled independently first, using the same static-header/authdata
/// layout `encode` will reconstruct.
fn packet_aad(nonce: [u8; 12], masking_iv: [u8; 16], authdata: &Authdata) -> Vec<u8> {
    let authdata_raw = authdata.encode();
    let static_header = Packet::build_static_header(authdata.flag(), &nonce, authdata_raw.len() as u16);
    crate::session::build_challenge_data(&masking_iv, &static_header, &authdata_raw)
}

fn random_masking_iv() -> [u8; 16] {
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

#[derive(Clone, Debug)]
enum Call {
    SendFindNode { enr: Enr, distances: Vec<u64> },
    SendPing { enr: Enr },
    SendTalkReq { enr: Enr, protocol: Bytes, request: Bytes },
    LookupSeed { target: NodeId },
    AddEnr(Enr),
    LocalEnr,
    GetKadValues,
}

#[derive(Clone, Debug)]
enum Cast {
    Inbound(Box<Packet>, SocketAddr),
    SweepTimeouts,
    PingSweep,
    RemoveEnr(NodeId),
    SendTalkResp { dest: NodeAddress, request_id: RequestId, response: Bytes },
    IngestNodes(Vec<Enr>),
    Shutdown,
}

#[derive(Debug)]
enum Reply {
    /// The send was accepted and registered; await this to get the eventual
    /// response (or timeout/shutdown failure).
    Pending(oneshot::Receiver<Result<RequestOutcome, RequestError>>),
    Seed { seed: Vec<Enr>, k: usize, timeout: Duration },
    Enr(Enr),
    Enrs(Vec<Enr>),
    Inserted(InsertOutcome),
}

fn resolved_pending(err: RequestError) -> Reply {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Err(err));
    Reply::Pending(rx)
}

/// Cheap, `Clone`-able handle to a running discv5 actor.
#[derive(Clone)]
pub struct Discv5Service {
    handle: GenServerHandle<ServiceActor>,
}

impl Discv5Service {
    /// Binds every address in `config.listen_addrs`... actually binds the
    /// first one (multi-socket listening is future work — see DESIGN.md),
    /// seeds the routing table with `config.bootstrap_enrs`, and spawns the
    /// actor task.
    pub async fn start(
        config: Discv5Config,
        local_enr: LocalEnr,
    ) -> Result<(Discv5Service, broadcast::Receiver<Discv5Event>), Discv5Error> {
        let bind_addr = *config.listen_addrs.first().ok_or(Discv5Error::Shutdown)?;
        let socket = UdpSocket::bind(bind_addr).await.map_err(Discv5Error::Bind)?;
        let (events_tx, events_rx) = broadcast::channel(256);

        let actor = ServiceActor::new(config, local_enr, socket, events_tx);
        let handle = actor.start();
        Ok((Discv5Service { handle }, events_rx))
    }

    pub fn local_enr(&self) -> Enr {
        // Cloning the handle is cheap (it's just a mailbox sender); the only
        // synchronous way to read actor state is a call, so this blocks on
        // one rather than caching a copy that could go stale.
        futures::executor::block_on(self.local_enr_async())
    }

    async fn local_enr_async(&self) -> Enr {
        let mut handle = self.handle.clone();
        match handle.call(Call::LocalEnr).await {
            Ok(Reply::Enr(enr)) => enr,
            _ => unreachable!("LocalEnr always replies with Reply::Enr"),
        }
    }

    pub async fn add_enr(&self, enr: Enr) -> Result<InsertOutcome, Discv5Error> {
        let mut handle = self.handle.clone();
        match handle.call(Call::AddEnr(enr)).await? {
            Reply::Inserted(outcome) => Ok(outcome),
            _ => unreachable!("AddEnr always replies with Reply::Inserted"),
        }
    }

    pub async fn remove_enr(&self, node_id: NodeId) -> Result<(), Discv5Error> {
        let mut handle = self.handle.clone();
        handle.cast(Cast::RemoveEnr(node_id)).await?;
        Ok(())
    }

    pub async fn get_kad_values(&self) -> Result<Vec<Enr>, Discv5Error> {
        let mut handle = self.handle.clone();
        match handle.call(Call::GetKadValues).await? {
            Reply::Enrs(enrs) => Ok(enrs),
            _ => unreachable!("GetKadValues always replies with Reply::Enrs"),
        }
    }

    /// Drives an iterative FINDNODE lookup to convergence (or timeout) and
    /// feeds every discovered ENR back into the routing table.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Enr>, Discv5Error> {
        let mut seed_handle = self.handle.clone();
        let (seed, k, timeout) = match seed_handle.call(Call::LookupSeed { target }).await? {
            Reply::Seed { seed, k, timeout } => (seed, k, timeout),
            _ => unreachable!("LookupSeed always replies with Reply::Seed"),
        };

        let handle = self.handle.clone();
        let results = run_lookup(target, seed, k, timeout, move |enr, distances| {
            let mut handle = handle.clone();
            async move {
                let rx = match handle.call(Call::SendFindNode { enr, distances }).await {
                    Ok(Reply::Pending(rx)) => rx,
                    _ => return None,
                };
                match rx.await {
                    Ok(Ok(RequestOutcome::Nodes(enrs))) => Some(enrs),
                    _ => None,
                }
            }
        })
        .await;

        let mut ingest_handle = self.handle.clone();
        let _ = ingest_handle.cast(Cast::IngestNodes(results.clone())).await;
        Ok(results)
    }

    pub async fn send_ping(&self, enr: Enr) -> Result<RequestOutcome, Discv5Error> {
        let mut handle = self.handle.clone();
        let rx = match handle.call(Call::SendPing { enr }).await? {
            Reply::Pending(rx) => rx,
            _ => unreachable!("SendPing always replies with Reply::Pending"),
        };
        Ok(rx.await.map_err(|_| Discv5Error::Shutdown)??)
    }

    pub async fn send_talk_req(&self, enr: Enr, protocol: Bytes, request: Bytes) -> Result<Bytes, Discv5Error> {
        let mut handle = self.handle.clone();
        let rx = match handle.call(Call::SendTalkReq { enr, protocol, request }).await? {
            Reply::Pending(rx) => rx,
            _ => unreachable!("SendTalkReq always replies with Reply::Pending"),
        };
        match rx.await.map_err(|_| Discv5Error::Shutdown)?? {
            RequestOutcome::TalkResp(payload) => Ok(payload),
            _ => unreachable!("a TalkReq request can only resolve with TalkResp"),
        }
    }

    pub async fn send_talk_resp(&self, dest: NodeAddress, request_id: RequestId, response: Bytes) -> Result<(), Discv5Error> {
        let mut handle = self.handle.clone();
        handle.cast(Cast::SendTalkResp { dest, request_id, response }).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), Discv5Error> {
        let mut handle = self.handle.clone();
        handle.cast(Cast::Shutdown).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct ServiceActor {
    config: Discv5Config,
    local_enr: LocalEnr,
    socket: Arc<UdpSocket>,
    crypto: DefaultCryptoProvider,
    sessions: SessionManager<DefaultCryptoProvider>,
    table: RoutingTable,
    requests: RequestEngine,
    /// Every ENR we've sent to, received a handshake ENR from, or learned
    /// through a lookup, regardless of whether it made it into the routing
    /// table. Lets the WHOAREYOU-reply and PONG-refresh paths look up a
    /// peer's static pubkey / advertised seq without depending on table
    /// occupancy.
    known_enrs: FxHashMap<NodeId, Enr>,
    /// Last time we sent a WHOAREYOU to a given source IP, to avoid being
    /// turned into a reflection amplifier by an attacker spoofing many
    /// source addresses at one victim IP. Mirrors the teacher's
    /// `whoareyou_rate_limit` map and `WHOAREYOU_RATE_LIMIT` constant.
    whoareyou_rate_limit: FxHashMap<std::net::IpAddr, Instant>,
    nonce_counter: u32,
    events_tx: broadcast::Sender<Discv5Event>,
    /// A handle to ourselves, for background work spawned outside
    /// `handle_call`/`handle_cast` (see `spawn_enr_refresh`). Populated once
    /// `init` runs; `GenServer::new` doesn't have it yet.
    own_handle: Option<GenServerHandle<ServiceActor>>,
}

const WHOAREYOU_RATE_LIMIT: Duration = Duration::from_secs(1);

impl ServiceActor {
    fn new(config: Discv5Config, local_enr: LocalEnr, socket: UdpSocket, events_tx: broadcast::Sender<Discv5Event>) -> Self {
        let local_node_id = local_enr.node_id();
        let mut table = RoutingTable::new(local_node_id);
        let mut known_enrs = FxHashMap::default();
        for enr in &config.bootstrap_enrs {
            let _ = table.insert_or_update(enr.clone());
            if let Ok(node_id) = enr.node_id() {
                known_enrs.insert(node_id, enr.clone());
            }
        }

        let sessions = SessionManager::new(
            local_node_id,
            DefaultCryptoProvider,
            config.session_establish_timeout(),
            config.session_timeout(),
        );
        let requests = RequestEngine::new(config.request_timeout(), config.request_retries.min(u8::MAX as u32) as u8);

        ServiceActor {
            config,
            local_enr,
            socket: Arc::new(socket),
            crypto: DefaultCryptoProvider,
            sessions,
            table,
            requests,
            known_enrs,
            whoareyou_rate_limit: FxHashMap::default(),
            nonce_counter: 0,
            events_tx,
            own_handle: None,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.nonce_counter.to_be_bytes());
        self.nonce_counter = self.nonce_counter.wrapping_add(1);
        rand::thread_rng().fill_bytes(&mut nonce[4..]);
        nonce
    }

    async fn send_wire(&self, wire: &[u8], dest: SocketAddr) {
        if let Err(error) = self.socket.send_to(wire, dest).await {
            debug!(%dest, %error, "failed to send discv5 datagram");
        }
    }

    /// Encrypts `plaintext` under `session` and sends it as an Ordinary
    /// packet.
    async fn send_ordinary(&mut self, addr: NodeAddress, session: &Session, plaintext: Vec<u8>) {
        let nonce = self.next_nonce();
        let masking_iv = random_masking_iv();
        let authdata = Authdata::Ordinary { src_id: self.local_enr.node_id() };
        let aad = packet_aad(nonce, masking_iv, &authdata);

        let ciphertext = match self.crypto.aes_gcm_encrypt(&session.outbound_key, &nonce, &aad, &plaintext) {
            Ok(ciphertext) => ciphertext,
            Err(_) => {
                crate::metrics::METRICS.record_drop("ordinary_encrypt_failed");
                return;
            }
        };

        let (_packet, wire) = Packet::encode(&self.crypto, &addr.0, nonce, masking_iv, authdata, ciphertext);
        self.send_wire(&wire, addr.1).await;
    }

    /// No established session exists yet: starts (or continues) a handshake,
    /// sending a Random packet the first time and buffering otherwise.
    async fn dispatch_plaintext(&mut self, addr: NodeAddress, plaintext: Vec<u8>) {
        if let Some(session) = self.sessions.established_keys(&addr).cloned() {
            self.send_ordinary(addr, &session, plaintext).await;
            return;
        }

        if self.sessions.state(&addr).is_some() {
            self.sessions.buffer_if_pending(&addr, plaintext);
            return;
        }

        let nonce = self.next_nonce();
        let masking_iv = random_masking_iv();
        let authdata = Authdata::Ordinary { src_id: self.local_enr.node_id() };
        let mut random_body = vec![0u8; plaintext.len().max(16)];
        rand::thread_rng().fill_bytes(&mut random_body);
        self.sessions.begin_random(addr, nonce, plaintext);

        let (_packet, wire) = Packet::encode(&self.crypto, &addr.0, nonce, masking_iv, authdata, random_body);
        self.send_wire(&wire, addr.1).await;
    }

    async fn send_request(
        &mut self,
        enr: Enr,
        message: Message,
        kind: RequestKind,
    ) -> Result<oneshot::Receiver<Result<RequestOutcome, RequestError>>, Discv5Error> {
        let node_id = enr.node_id()?;
        let udp_addr = enr.udp_socket().ok_or(Discv5Error::Node(NodeError::MissingField("udp_socket")))?;
        self.known_enrs.insert(node_id, enr);
        let addr: NodeAddress = (node_id, udp_addr);

        let (tx, rx) = oneshot::channel();
        self.requests.register(addr, kind, message.clone(), tx);
        self.dispatch_plaintext(addr, message.encode_to_bytes()).await;
        Ok(rx)
    }

    fn ingest_enr(&mut self, enr: Enr) {
        let Ok(node_id) = enr.node_id() else { return };
        if node_id == self.local_enr.node_id() {
            return;
        }
        self.known_enrs.insert(node_id, enr.clone());
        if let Ok(outcome) = self.table.insert_or_update(enr.clone()) {
            if matches!(outcome, InsertOutcome::Inserted) {
                let _ = self.events_tx.send(Discv5Event::Discovered(enr));
            }
            crate::metrics::METRICS.table_occupancy.set(self.table.len() as i64);
        }
    }

    /// Background refresh triggered when a PONG advertises a newer ENR seq
    /// than we have on file: fires a one-off FINDNODE(0) at the peer itself,
    /// which (per the wire spec) answers with its own current record.
    fn spawn_enr_refresh(&self, node_id: NodeId) {
        let (Some(handle), Some(enr)) = (self.own_handle.clone(), self.known_enrs.get(&node_id).cloned()) else {
            return;
        };
        let mut handle = handle;
        tokio::spawn(async move {
            let Ok(Reply::Pending(rx)) = handle.call(Call::SendFindNode { enr, distances: vec![0] }).await else {
                return;
            };
            if let Ok(Ok(RequestOutcome::Nodes(enrs))) = rx.await {
                let _ = handle.cast(Cast::IngestNodes(enrs)).await;
            }
        });
    }

    async fn send_whoareyou(&mut self, addr: NodeAddress) {
        let now = Instant::now();
        if let Some(last) = self.whoareyou_rate_limit.get(&addr.1.ip()) {
            if now.duration_since(*last) < WHOAREYOU_RATE_LIMIT {
                return;
            }
        }
        self.whoareyou_rate_limit.insert(addr.1.ip(), now);

        let id_nonce = self.sessions.handle_decrypt_failure(addr);
        let remote_enr_seq = self.known_enrs.get(&addr.0).map(|enr| enr.seq()).unwrap_or(0);

        let nonce = self.next_nonce();
        let masking_iv = random_masking_iv();
        let authdata = Authdata::Whoareyou { id_nonce, enr_seq: remote_enr_seq };
        let (packet, wire) = Packet::encode(&self.crypto, &addr.0, nonce, masking_iv, authdata, vec![]);
        self.sessions.remember_challenge(&addr, packet.associated_data(), remote_enr_seq);
        self.send_wire(&wire, addr.1).await;
        crate::metrics::METRICS.whoareyou_sent.inc();
    }

    /// We are the initiator: an inbound WHOAREYOU matched one of our pending
    /// nonces. Completes the handshake and sends the Handshake packet back,
    /// piggy-backing the first buffered plaintext (if any); any further
    /// buffered messages go out as ordinary traffic once the session exists.
    async fn handle_whoareyou_packet(&mut self, packet: Packet, _from: SocketAddr) {
        if !matches!(packet.authdata, Authdata::Whoareyou { .. }) {
            return;
        }
        let Some(addr) = self.sessions.addr_for_nonce(&packet.nonce) else {
            trace!("WHOAREYOU for an unknown nonce, dropping");
            return;
        };
        let remote_node_id = addr.0;
        let Some(dest_pubkey) = self.known_enrs.get(&remote_node_id).and_then(|enr| enr.public_key().ok()) else {
            warn!(?remote_node_id, "received WHOAREYOU for a peer with no known ENR, dropping");
            self.sessions.remove(&addr);
            return;
        };

        let challenge_data = packet.associated_data();
        let handshake = match self.sessions.handle_whoareyou(
            &packet.nonce,
            &challenge_data,
            &dest_pubkey,
            self.local_enr.signer(),
            &remote_node_id,
        ) {
            Ok(handshake) => handshake,
            Err(error) => {
                debug!(%error, "failed to process WHOAREYOU");
                crate::metrics::METRICS.record_drop("whoareyou_handshake_failed");
                return;
            }
        };

        let mut buffered = handshake.buffered_plaintext.into_iter();
        let first_plaintext = buffered.next();

        let nonce = self.next_nonce();
        let masking_iv = random_masking_iv();
        let authdata = Authdata::Handshake {
            src_id: self.local_enr.node_id(),
            id_signature: handshake.id_signature,
            ephemeral_pubkey: handshake.ephemeral_pubkey.to_vec(),
            enr: Some(self.local_enr.enr().clone()),
        };

        let ciphertext = match &first_plaintext {
            Some(plaintext) => {
                let aad = packet_aad(nonce, masking_iv, &authdata);
                match self.crypto.aes_gcm_encrypt(&handshake.session.outbound_key, &nonce, &aad, plaintext) {
                    Ok(ciphertext) => ciphertext,
                    Err(_) => {
                        crate::metrics::METRICS.record_drop("handshake_encrypt_failed");
                        return;
                    }
                }
            }
            None => Vec::new(),
        };

        let (_packet, wire) = Packet::encode(&self.crypto, &remote_node_id, nonce, masking_iv, authdata, ciphertext);
        self.send_wire(&wire, addr.1).await;
        crate::metrics::METRICS.sessions_established.inc();

        for plaintext in buffered {
            self.send_ordinary(addr, &handshake.session, plaintext).await;
        }
    }

    /// We are the recipient: an inbound Handshake packet answering a
    /// WHOAREYOU we sent earlier. Verifies the id-signature, derives the
    /// session, and dispatches any piggy-backed message.
    async fn handle_handshake_packet(&mut self, packet: Packet, from: SocketAddr) {
        let Authdata::Handshake { src_id, id_signature, ephemeral_pubkey, enr } = packet.authdata.clone() else {
            return;
        };
        let addr: NodeAddress = (src_id, from);

        let Ok(signature) = Signature::from_compact(&id_signature) else {
            crate::metrics::METRICS.record_drop("handshake_bad_signature_bytes");
            return;
        };
        let Ok(ephemeral_pk) = PublicKey::from_slice(&ephemeral_pubkey) else {
            crate::metrics::METRICS.record_drop("handshake_bad_ephemeral_key");
            return;
        };

        let src_pubkey = match &enr {
            Some(enr) => {
                if !enr.verify_signature() || enr.node_id().map(|id| id != src_id).unwrap_or(true) {
                    crate::metrics::METRICS.record_drop("handshake_enr_invalid");
                    return;
                }
                match enr.public_key() {
                    Ok(pubkey) => pubkey,
                    Err(_) => {
                        crate::metrics::METRICS.record_drop("handshake_enr_invalid");
                        return;
                    }
                }
            }
            None => match self.known_enrs.get(&src_id).and_then(|enr| enr.public_key().ok()) {
                Some(pubkey) => pubkey,
                None => {
                    crate::metrics::METRICS.record_drop("handshake_no_known_enr");
                    return;
                }
            },
        };

        let session = match self.sessions.handle_handshake(addr, &src_id, &src_pubkey, &ephemeral_pk, &signature, self.local_enr.signer()) {
            Ok(session) => session,
            Err(error) => {
                debug!(%error, "handshake verification failed");
                crate::metrics::METRICS.record_drop("handshake_failed");
                return;
            }
        };
        crate::metrics::METRICS.sessions_established.inc();

        let announced_enr = if let Some(enr) = enr {
            self.ingest_enr(enr.clone());
            Some(enr)
        } else {
            self.known_enrs.get(&src_id).cloned()
        };
        if let Some(enr) = announced_enr {
            let _ = self.events_tx.send(Discv5Event::SessionEstablished(enr));
        }

        if !packet.ciphertext.is_empty() {
            let aad = packet.associated_data();
            match self.crypto.aes_gcm_decrypt(&session.inbound_key, &packet.nonce, &aad, &packet.ciphertext) {
                Ok(plaintext) => self.handle_plaintext_message(addr, &plaintext).await,
                Err(_) => crate::metrics::METRICS.record_drop("handshake_piggyback_decrypt_failed"),
            }
        }
    }

    async fn handle_ordinary_packet(&mut self, packet: Packet, from: SocketAddr) {
        let Authdata::Ordinary { src_id } = packet.authdata else { return };
        let addr: NodeAddress = (src_id, from);

        if let Some(session) = self.sessions.established_keys(&addr).cloned() {
            let aad = packet.associated_data();
            match self.crypto.aes_gcm_decrypt(&session.inbound_key, &packet.nonce, &aad, &packet.ciphertext) {
                Ok(plaintext) => {
                    self.sessions.mark_ordinary_success(&addr);
                    self.handle_plaintext_message(addr, &plaintext).await;
                    return;
                }
                Err(_) => crate::metrics::METRICS.record_drop("ordinary_decrypt_failed"),
            }
        } else {
            crate::metrics::METRICS.record_drop("ordinary_no_session");
        }
        self.send_whoareyou(addr).await;
    }

    async fn reply_find_node(&mut self, addr: NodeAddress, request_id: RequestId, distances: Vec<u64>) {
        let local_node_id = self.local_enr.node_id();
        let wanted: std::collections::HashSet<u64> = distances.into_iter().collect();
        let mut matches: Vec<Enr> = self
            .table
            .iter()
            .filter(|enr| {
                enr.node_id()
                    .map(|id| wanted.contains(&(crate::node::distance(&local_node_id, &id) as u64)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        matches.truncate(crate::message::MAX_NODES_TOTAL as usize);

        if matches.is_empty() {
            let nodes = Message::Nodes { request_id, total: 1, enrs: Vec::new() };
            self.dispatch_plaintext(addr, nodes.encode_to_bytes()).await;
            return;
        }

        let chunks: Vec<Vec<Enr>> = matches.chunks(MAX_ENRS_PER_MESSAGE).map(|c| c.to_vec()).collect();
        let total = chunks.len() as u64;
        for chunk in chunks {
            let nodes = Message::Nodes { request_id: request_id.clone(), total, enrs: chunk };
            self.dispatch_plaintext(addr, nodes.encode_to_bytes()).await;
        }
    }

    async fn handle_plaintext_message(&mut self, addr: NodeAddress, plaintext: &[u8]) {
        let message = match Message::decode(plaintext) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, "dropping malformed message body");
                crate::metrics::METRICS.record_drop("bad_message");
                return;
            }
        };

        match message {
            Message::Ping { request_id, .. } => {
                self.table.mark_connected(&addr.0);
                let pong = Message::Pong {
                    request_id,
                    enr_seq: self.local_enr.enr().seq(),
                    recipient_ip: addr.1.ip(),
                    recipient_port: addr.1.port(),
                };
                self.dispatch_plaintext(addr, pong.encode_to_bytes()).await;
            }
            Message::FindNode { request_id, distances } => {
                self.reply_find_node(addr, request_id, distances).await;
            }
            Message::TalkReq { request_id, protocol, request } => {
                let enr = self.known_enrs.get(&addr.0).cloned();
                let _ = self.events_tx.send(Discv5Event::TalkRequest { from: addr, enr, request_id, protocol, request });
            }
            other => {
                if let Some(ResponseEffect::PongObserved { node_id, addr: observed, remote_enr_seq }) =
                    self.requests.handle_response(addr, other)
                {
                    self.table.mark_connected(&node_id);
                    if self.config.enr_update && self.local_enr.set_udp_socket(observed) {
                        debug!(%observed, "local ENR address updated from an observed PONG");
                    }
                    let is_stale = self.known_enrs.get(&node_id).map(|enr| enr.seq() < remote_enr_seq).unwrap_or(true);
                    if is_stale {
                        self.spawn_enr_refresh(node_id);
                    }
                }
            }
        }
    }
}

impl GenServer for ServiceActor {
    type CallMsg = Call;
    type CastMsg = Cast;
    type OutMsg = Reply;
    type Error = Discv5Error;

    async fn init(self, handle: &GenServerHandle<Self>) -> Result<InitResult<Self>, Self::Error> {
        let local_node_id = self.local_enr.node_id();
        let stream = UdpFramed::new(self.socket.clone(), Discv5Codec::new(local_node_id));

        spawn_listener(
            handle.clone(),
            stream.filter_map(|result| async move {
                match result {
                    Ok((packet, addr)) => Some(Cast::Inbound(Box::new(packet), addr)),
                    Err(error) => {
                        debug!(%error, "dropping undecodable discv5 datagram");
                        crate::metrics::METRICS.record_drop("codec_error");
                        None
                    }
                }
            }),
        );

        send_interval(self.config.ping_interval(), handle.clone(), Cast::PingSweep);
        send_interval(SWEEP_INTERVAL, handle.clone(), Cast::SweepTimeouts);
        send_message_on(handle.clone(), tokio::signal::ctrl_c(), Cast::Shutdown);

        let mut this = self;
        this.own_handle = Some(handle.clone());
        Ok(InitResult::Success(this))
    }

    async fn handle_call(&mut self, message: Self::CallMsg, _handle: &GenServerHandle<Self>) -> CallResponse<Self> {
        match message {
            Call::SendFindNode { enr, distances } => {
                let request_id = crate::requests::generate_request_id();
                let findnode = Message::FindNode { request_id, distances };
                let reply = match self.send_request(enr, findnode, RequestKind::FindNode).await {
                    Ok(rx) => Reply::Pending(rx),
                    Err(_) => resolved_pending(RequestError::Timeout),
                };
                CallResponse::Reply(reply)
            }
            Call::SendPing { enr } => {
                let request_id = crate::requests::generate_request_id();
                let ping = Message::Ping { request_id, enr_seq: self.local_enr.enr().seq() };
                let reply = match self.send_request(enr, ping, RequestKind::Ping).await {
                    Ok(rx) => Reply::Pending(rx),
                    Err(_) => resolved_pending(RequestError::Timeout),
                };
                CallResponse::Reply(reply)
            }
            Call::SendTalkReq { enr, protocol, request } => {
                let request_id = crate::requests::generate_request_id();
                let talk_req = Message::TalkReq { request_id, protocol, request };
                let reply = match self.send_request(enr, talk_req, RequestKind::TalkReq).await {
                    Ok(rx) => Reply::Pending(rx),
                    Err(_) => resolved_pending(RequestError::Timeout),
                };
                CallResponse::Reply(reply)
            }
            Call::LookupSeed { target } => {
                let seed = self.table.nearest(&target, self.config.lookup_num_results);
                CallResponse::Reply(Reply::Seed { seed, k: self.config.lookup_num_results, timeout: self.config.lookup_timeout() })
            }
            Call::AddEnr(enr) => {
                if let Ok(node_id) = enr.node_id() {
                    self.known_enrs.insert(node_id, enr.clone());
                }
                let outcome = self.table.insert_or_update(enr.clone()).unwrap_or(InsertOutcome::RejectedSelf);
                crate::metrics::METRICS.table_occupancy.set(self.table.len() as i64);
                let _ = self.events_tx.send(Discv5Event::EnrAdded(enr));
                CallResponse::Reply(Reply::Inserted(outcome))
            }
            Call::LocalEnr => CallResponse::Reply(Reply::Enr(self.local_enr.enr().clone())),
            Call::GetKadValues => CallResponse::Reply(Reply::Enrs(self.table.iter().cloned().collect())),
        }
    }

    async fn handle_cast(&mut self, message: Self::CastMsg, _handle: &GenServerHandle<Self>) -> CastResponse {
        match message {
            Cast::Inbound(packet, from) => {
                match packet.flag() {
                    FLAG_ORDINARY => self.handle_ordinary_packet(*packet, from).await,
                    FLAG_WHOAREYOU => self.handle_whoareyou_packet(*packet, from).await,
                    FLAG_HANDSHAKE => self.handle_handshake_packet(*packet, from).await,
                    _ => crate::metrics::METRICS.record_drop("unknown_flag"),
                }
            }
            Cast::SweepTimeouts => {
                let now = Instant::now();
                for (addr, message) in self.requests.sweep_timeouts(now) {
                    self.dispatch_plaintext(addr, message.encode_to_bytes()).await;
                }
                for addr in self.sessions.sweep_timeouts(now) {
                    trace!(?addr, "session/handshake expired");
                }
            }
            Cast::PingSweep => {
                let targets: Vec<Enr> = self.table.iter().cloned().collect();
                for enr in targets {
                    let request_id = crate::requests::generate_request_id();
                    let ping = Message::Ping { request_id, enr_seq: self.local_enr.enr().seq() };
                    // Fire-and-forget: the oneshot is dropped, but the PONG (or
                    // timeout) still runs through `handle_response`/`sweep_timeouts`
                    // and updates the routing table as a side effect.
                    let _ = self.send_request(enr, ping, RequestKind::Ping).await;
                }
            }
            Cast::RemoveEnr(node_id) => {
                self.table.remove(&node_id);
                self.known_enrs.remove(&node_id);
                crate::metrics::METRICS.table_occupancy.set(self.table.len() as i64);
            }
            Cast::SendTalkResp { dest, request_id, response } => {
                let talk_resp = Message::TalkResp { request_id, response };
                self.dispatch_plaintext(dest, talk_resp.encode_to_bytes()).await;
            }
            Cast::IngestNodes(enrs) => {
                for enr in enrs {
                    self.ingest_enr(enr);
                }
            }
            Cast::Shutdown => {
                self.requests.cancel_all();
                return CastResponse::Stop;
            }
        }
        CastResponse::NoReply
    }
}
