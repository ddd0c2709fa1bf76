use thiserror::Error;

use crate::node::NodeError;

/// Failures decoding or encoding a wire packet (masking, GCM, authdata layout).
///
/// Decode errors other than [`PacketCodecError::Io`] are never turned into a
/// reply: responding to malformed or foreign traffic is an amplification
/// vector, so callers must drop the packet and only bump a metric.
#[derive(Debug, Error)]
pub enum PacketCodecError {
    #[error("packet shorter than the 63-byte minimum")]
    TooSmall,
    #[error("unrecognized protocol id in static header")]
    WrongProtocol,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("AES-GCM decryption failed")]
    DecryptionFailed,
    #[error("authdata malformed for the declared flag")]
    InvalidAuthdata,
    #[error("id-signature verification failed")]
    InvalidSignature,
    #[error("handshake referenced a challenge we never sent")]
    UnknownChallenge,
    #[error("embedded ENR failed verification or NodeId binding")]
    InvalidEnr(#[from] NodeError),
    #[error("RLP error: {0}")]
    Rlp(#[from] discv5_rlp::error::RLPDecodeError),
}

/// Failures in session key derivation or the handshake state machine.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session exists for this node address")]
    NoSession,
    #[error("session handshake timed out")]
    HandshakeTimeout,
    #[error("session is established but cannot decrypt: a fresh challenge is required")]
    Stale,
    #[error("underlying packet codec error: {0}")]
    Codec(#[from] PacketCodecError),
}

/// Failures raised by the outstanding request/response engine.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out after exhausting retries")]
    Timeout,
    #[error("service is shutting down")]
    Shutdown,
    #[error("NODES response declared total=0")]
    EmptyNodesTotal,
    #[error("no session available to send the request")]
    Session(#[from] SessionError),
}

/// Top-level error returned from the public `Discv5Service` API.
#[derive(Debug, Error)]
pub enum Discv5Error {
    #[error("request failed: {0}")]
    Request(#[from] RequestError),
    #[error("codec error: {0}")]
    Codec(#[from] PacketCodecError),
    #[error("node/ENR error: {0}")]
    Node(#[from] NodeError),
    #[error("service is shutting down")]
    Shutdown,
    #[error("socket bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("service actor error: {0}")]
    Actor(#[from] spawned_concurrency::error::GenServerError),
}
