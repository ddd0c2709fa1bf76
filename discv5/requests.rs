//! Request/response bookkeeping: per-request-id timeout/retry state and
//! FINDNODE -> NODES multi-packet aggregation.
//!
//! Grounded on `discv5/server.rs`'s `pending_by_nonce` accumulator pattern
//! (keyed there by nonce, keyed here by the message's own request-id, since
//! this crate's sessions already key on `NodeAddress` rather than nonce) and
//! its `cleanup_stale_entries`/`MESSAGE_CACHE_TIMEOUT` sweep. The teacher
//! never actually resends on timeout, just drops; this module adds the
//! retry-then-fail behavior.
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::RngCore;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use crate::error::RequestError;
use crate::message::{Message, RequestId, MAX_NODES_TOTAL};
use crate::node::{Enr, NodeId};
use crate::session::NodeAddress;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    FindNode,
    Ping,
    TalkReq,
}

#[derive(Debug)]
pub enum RequestOutcome {
    Nodes(Vec<Enr>),
    Pong { enr_seq: u64, recipient_ip: std::net::IpAddr, recipient_port: u16 },
    TalkResp(Bytes),
}

/// Side-effect a completed response can have beyond resolving its own
/// request, surfaced to the caller (`service.rs`) so it can update the
/// routing table / local ENR without this module depending on either.
#[derive(Debug, Clone, Copy)]
pub enum ResponseEffect {
    PongObserved { node_id: NodeId, addr: SocketAddr, remote_enr_seq: u64 },
}

#[derive(Debug)]
struct PendingRequest {
    dest: NodeAddress,
    kind: RequestKind,
    send_time: Instant,
    retries: u8,
    message: Message,
    nodes_total: Option<u64>,
    nodes_received: u64,
    nodes_acc: Vec<Enr>,
    responder: oneshot::Sender<Result<RequestOutcome, RequestError>>,
}

pub fn generate_request_id() -> RequestId {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    Bytes::copy_from_slice(&bytes)
}

#[derive(Debug)]
pub struct RequestEngine {
    pending: FxHashMap<RequestId, PendingRequest>,
    timeout: Duration,
    max_retries: u8,
}

impl RequestEngine {
    pub fn new(timeout: Duration, max_retries: u8) -> Self {
        RequestEngine { pending: FxHashMap::default(), timeout, max_retries }
    }

    /// Records an in-flight request. `message` must already carry the
    /// request-id it was encoded with, so a retry can re-send the identical
    /// bytes.
    pub fn register(
        &mut self,
        dest: NodeAddress,
        kind: RequestKind,
        message: Message,
        responder: oneshot::Sender<Result<RequestOutcome, RequestError>>,
    ) {
        let request_id = message.request_id().clone();
        self.pending.insert(
            request_id,
            PendingRequest {
                dest,
                kind,
                send_time: Instant::now(),
                retries: 0,
                message,
                nodes_total: None,
                nodes_received: 0,
                nodes_acc: Vec::new(),
                responder,
            },
        );
    }

    pub fn kind_of(&self, request_id: &RequestId) -> Option<RequestKind> {
        self.pending.get(request_id).map(|p| p.kind)
    }

    /// Feeds an inbound response message to the matching pending request, if
    /// any. Unknown request-ids and responses from an address that doesn't
    /// match the original destination are silently dropped, per spec.
    pub fn handle_response(&mut self, from: NodeAddress, message: Message) -> Option<ResponseEffect> {
        let request_id = message.request_id().clone();
        match self.pending.get(&request_id) {
            Some(pending) if pending.dest == from => {}
            _ => return None,
        }

        match message {
            Message::Nodes { total, enrs, .. } => {
                if total == 0 {
                    let pending = self.pending.remove(&request_id).expect("checked above");
                    let _ = pending.responder.send(Err(RequestError::EmptyNodesTotal));
                    return None;
                }
                let total = total.clamp(1, MAX_NODES_TOTAL);

                let pending = self.pending.get_mut(&request_id).expect("checked above");
                if pending.nodes_total.is_none() {
                    pending.nodes_total = Some(total);
                }
                let expected_total = pending.nodes_total.unwrap_or(total);
                let remaining_capacity = (MAX_NODES_TOTAL as usize).saturating_sub(pending.nodes_acc.len());
                pending.nodes_acc.extend(enrs.into_iter().take(remaining_capacity));
                pending.nodes_received += 1;

                if pending.nodes_received >= expected_total {
                    let pending = self.pending.remove(&request_id).expect("checked above");
                    let _ = pending.responder.send(Ok(RequestOutcome::Nodes(pending.nodes_acc)));
                }
                None
            }
            Message::Pong { enr_seq, recipient_ip, recipient_port, .. } => {
                let pending = self.pending.remove(&request_id).expect("checked above");
                let (node_id, _) = pending.dest;
                let effect =
                    ResponseEffect::PongObserved { node_id, addr: SocketAddr::new(recipient_ip, recipient_port), remote_enr_seq: enr_seq };
                let _ = pending.responder.send(Ok(RequestOutcome::Pong { enr_seq, recipient_ip, recipient_port }));
                Some(effect)
            }
            Message::TalkResp { response, .. } => {
                let pending = self.pending.remove(&request_id).expect("checked above");
                let _ = pending.responder.send(Ok(RequestOutcome::TalkResp(response)));
                None
            }
            // Ping/FindNode/TalkReq are request shapes, never valid responses.
            _ => None,
        }
    }

    /// Called periodically. Returns `(dest, message)` pairs that should be
    /// re-sent on the wire; requests that have exhausted their retries are
    /// failed with `RequestError::Timeout` here, not returned.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<(NodeAddress, Message)> {
        let mut resends = Vec::new();
        let mut expired = Vec::new();

        for (request_id, pending) in self.pending.iter_mut() {
            if now.duration_since(pending.send_time) < self.timeout {
                continue;
            }
            if pending.retries < self.max_retries {
                pending.retries += 1;
                pending.send_time = now;
                resends.push((pending.dest, pending.message.clone()));
            } else {
                expired.push(request_id.clone());
            }
        }

        for request_id in expired {
            if let Some(pending) = self.pending.remove(&request_id) {
                let _ = pending.responder.send(Err(RequestError::Timeout));
            }
        }

        resends
    }

    /// Fails every outstanding request with `Shutdown`, e.g. on service stop.
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.responder.send(Err(RequestError::Shutdown));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn addr(byte: u8) -> NodeAddress {
        (NodeId::from_low_u64_be(byte as u64), SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 9000 + byte as u16))
    }

    #[tokio::test]
    async fn findnode_aggregates_until_total_reached() {
        let mut engine = RequestEngine::new(DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES);
        let dest = addr(1);
        let request_id = generate_request_id();
        let (tx, rx) = oneshot::channel();
        engine.register(
            dest,
            RequestKind::FindNode,
            Message::FindNode { request_id: request_id.clone(), distances: vec![10] },
            tx,
        );

        let first = Message::Nodes { request_id: request_id.clone(), total: 2, enrs: vec![] };
        assert!(engine.handle_response(dest, first).is_none());
        assert_eq!(engine.len(), 1);

        let second = Message::Nodes { request_id, total: 2, enrs: vec![] };
        assert!(engine.handle_response(dest, second).is_none());
        assert_eq!(engine.len(), 0);

        let outcome = rx.await.unwrap().unwrap();
        assert!(matches!(outcome, RequestOutcome::Nodes(enrs) if enrs.is_empty()));
    }

    #[tokio::test]
    async fn nodes_with_zero_total_is_rejected() {
        let mut engine = RequestEngine::new(DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES);
        let dest = addr(1);
        let request_id = generate_request_id();
        let (tx, rx) = oneshot::channel();
        engine.register(dest, RequestKind::FindNode, Message::FindNode { request_id: request_id.clone(), distances: vec![10] }, tx);

        let zero_total = Message::Nodes { request_id, total: 0, enrs: vec![] };
        assert!(engine.handle_response(dest, zero_total).is_none());
        assert_eq!(engine.len(), 0);
        assert!(matches!(rx.await.unwrap(), Err(RequestError::EmptyNodesTotal)));
    }

    #[tokio::test]
    async fn unknown_request_id_is_dropped() {
        let mut engine = RequestEngine::new(DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES);
        let bogus = Message::Pong {
            request_id: generate_request_id(),
            enr_seq: 1,
            recipient_ip: IpAddr::from([127, 0, 0, 1]),
            recipient_port: 9000,
        };
        assert!(engine.handle_response(addr(1), bogus).is_none());
    }

    #[tokio::test]
    async fn response_from_wrong_address_is_ignored() {
        let mut engine = RequestEngine::new(DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES);
        let dest = addr(1);
        let request_id = generate_request_id();
        let (tx, mut rx) = oneshot::channel();
        engine.register(dest, RequestKind::Ping, Message::Ping { request_id: request_id.clone(), enr_seq: 1 }, tx);

        let pong = Message::Pong { request_id, enr_seq: 2, recipient_ip: IpAddr::from([127, 0, 0, 1]), recipient_port: 9000 };
        assert!(engine.handle_response(addr(2), pong).is_none());
        assert_eq!(engine.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_retries_once_then_times_out() {
        let mut engine = RequestEngine::new(Duration::from_millis(0), 1);
        let dest = addr(1);
        let (tx, rx) = oneshot::channel();
        engine.register(dest, RequestKind::Ping, Message::Ping { request_id: generate_request_id(), enr_seq: 1 }, tx);

        let later = Instant::now() + Duration::from_millis(1);
        let resends = engine.sweep_timeouts(later);
        assert_eq!(resends.len(), 1);
        assert_eq!(engine.len(), 1);

        let even_later = later + Duration::from_millis(1);
        let resends = engine.sweep_timeouts(even_later);
        assert!(resends.is_empty());
        assert_eq!(engine.len(), 0);
        assert!(matches!(rx.await.unwrap(), Err(RequestError::Timeout)));
    }

    #[tokio::test]
    async fn cancel_all_fails_every_pending_request() {
        let mut engine = RequestEngine::new(DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES);
        let (tx, rx) = oneshot::channel();
        engine.register(addr(1), RequestKind::Ping, Message::Ping { request_id: generate_request_id(), enr_seq: 1 }, tx);
        engine.cancel_all();
        assert!(engine.is_empty());
        assert!(matches!(rx.await.unwrap(), Err(RequestError::Shutdown)));
    }
}
