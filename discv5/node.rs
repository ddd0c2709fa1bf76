//! NodeId, ENR (signed and local/signable), and XOR-distance helpers.
//!
//! Grounded on `types.rs`'s `Node`/`NodeRecord`/`NodeRecordPairs` split and
//! `utils.rs`'s `node_id`/`distance` functions, adapted to discv5: the ENR's
//! optional key/value pairs drop the Ethereum-specific `eth`/`snap` entries
//! in favor of an open, forward-compatible `extra` bag, and `Node` becomes
//! two distinct types (`Enr`, read-only and verified; `LocalEnr`, mutable and
//! resignable) instead of one struct used for both purposes.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes};
use discv5_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use ethereum_types::{H256, H264, H512, U256};
use secp256k1::{PublicKey, SecretKey, ecdsa::Signature};
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("RLP decode error: {0}")]
    RLPDecodeError(#[from] RLPDecodeError),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("record's 'id' field is not the v4 identity scheme")]
    UnsupportedIdentityScheme,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] secp256k1::Error),
}

pub type NodeId = H256;

/// `NodeId = keccak256(uncompressed_pubkey without the leading 0x04 byte)`.
pub fn node_id(uncompressed_pubkey: &H512) -> NodeId {
    let mut hasher = Keccak256::new();
    hasher.update(uncompressed_pubkey.as_bytes());
    H256::from_slice(&hasher.finalize())
}

/// Bucket index = `255 - leading_zero_bits(xor(a, b))`, i.e. `floor(log2(xor))`.
/// Used for Kademlia bucket placement only; two peers in the same bucket are
/// indistinguishable under this metric, so sorting/ranking by true closeness
/// must use [`xor_distance`] instead.
pub fn distance(a: &NodeId, b: &NodeId) -> usize {
    xor_distance(a, b).bits().saturating_sub(1)
}

/// The full 256-bit XOR distance between two node ids, for sorting peers by
/// true closeness to a target (`nearest`, lookup candidate ordering). Unlike
/// [`distance`], this never collapses two different peers in the same bucket
/// to the same value.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> U256 {
    let mut xor = [0u8; 32];
    for i in 0..32 {
        xor[i] = a[i] ^ b[i];
    }
    U256::from_big_endian(&xor)
}

const MAX_ENR_ENCODED_SIZE: usize = 300;

/// The record's non-signature, non-seq fields: a sorted bag of key/value
/// pairs per the ENR spec. Known keys get typed accessors; anything else is
/// preserved verbatim in `extra` so a record round-trips even if it carries
/// keys this node doesn't interpret.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnrPairs {
    pub id: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub secp256k1: Option<H264>,
    pub extra: Vec<(Bytes, Bytes)>,
}

impl EnrPairs {
    fn try_from_raw_pairs(pairs: Vec<(Bytes, Bytes)>) -> Result<Self, RLPDecodeError> {
        let mut out = EnrPairs::default();
        for (key, value) in pairs {
            match key.as_ref() {
                b"id" => out.id = Some(String::decode(&value)?),
                b"ip" => out.ip = Some(Ipv4Addr::decode(&value)?),
                b"ip6" => out.ip6 = Some(Ipv6Addr::decode(&value)?),
                b"udp" => out.udp_port = Some(u16::decode(&value)?),
                b"tcp" => out.tcp_port = Some(u16::decode(&value)?),
                b"secp256k1" => out.secp256k1 = Some(H264(<[u8; 33]>::decode(&value)?)),
                _ => out.extra.push((key, value)),
            }
        }
        Ok(out)
    }

    /// Writes `key.encode() || value.encode()` for each pair, sorted
    /// ascending by key, flattened directly into `buf` (no list wrapper of
    /// its own — the caller's list is the record's outer list). Matches the
    /// ENR spec's canonical encoding and makes signature verification
    /// independent of field insertion order.
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut pairs: Vec<(Bytes, Bytes)> = Vec::new();
        let mut push = |key: &'static str, value: Vec<u8>| {
            pairs.push((Bytes::from(key), Bytes::from(value)));
        };
        if let Some(id) = &self.id {
            let mut v = vec![];
            id.encode(&mut v);
            push("id", v);
        }
        if let Some(ip) = &self.ip {
            let mut v = vec![];
            ip.encode(&mut v);
            push("ip", v);
        }
        if let Some(ip6) = &self.ip6 {
            let mut v = vec![];
            ip6.encode(&mut v);
            push("ip6", v);
        }
        if let Some(secp256k1) = &self.secp256k1 {
            let mut v = vec![];
            secp256k1.encode(&mut v);
            push("secp256k1", v);
        }
        if let Some(tcp) = self.tcp_port {
            let mut v = vec![];
            tcp.encode(&mut v);
            push("tcp", v);
        }
        if let Some(udp) = self.udp_port {
            let mut v = vec![];
            udp.encode(&mut v);
            push("udp", v);
        }
        for (k, v) in &self.extra {
            pairs.push((k.clone(), v.clone()));
        }
        pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (key, value) in pairs {
            key.encode(buf);
            buf.put_slice(&value);
        }
    }
}

/// A received, verified, immutable Ethereum Node Record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enr {
    signature: H512,
    seq: u64,
    pairs: EnrPairs,
}

impl Enr {
    pub fn node_id(&self) -> Result<NodeId, NodeError> {
        Ok(node_id(&self.uncompressed_public_key()?))
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn public_key(&self) -> Result<PublicKey, NodeError> {
        let bytes = self.pairs.secp256k1.ok_or(NodeError::MissingField("secp256k1"))?;
        Ok(PublicKey::from_slice(bytes.as_bytes())?)
    }

    fn uncompressed_public_key(&self) -> Result<H512, NodeError> {
        let encoded = self.public_key()?.serialize_uncompressed();
        Ok(H512::from_slice(&encoded[1..]))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match (self.pairs.ip, self.pairs.ip6) {
            (Some(v4), _) => Some(IpAddr::V4(v4)),
            (None, Some(v6)) => Some(IpAddr::V6(v6)),
            (None, None) => None,
        }
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.pairs.udp_port.or(self.pairs.tcp_port)
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.pairs.tcp_port.or(self.pairs.udp_port)
    }

    pub fn udp_socket(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip()?, self.udp_port()?))
    }

    pub fn extra(&self, key: &[u8]) -> Option<&Bytes> {
        self.pairs.extra.iter().find(|(k, _)| k.as_ref() == key).map(|(_, v)| v)
    }

    fn flattened_signature_digest(&self) -> [u8; 32] {
        let mut rlp = vec![];
        Encoder::new(&mut rlp)
            .encode_field(&self.seq)
            .encode_with(|buf| self.pairs.encode(buf))
            .finish();
        let mut hasher = Keccak256::new();
        hasher.update(&rlp);
        hasher.finalize().into()
    }

    pub fn verify_signature(&self) -> bool {
        let Ok(pubkey) = self.public_key() else {
            return false;
        };
        let digest = self.flattened_signature_digest();
        let Ok(message) = secp256k1::Message::from_digest_slice(&digest) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(self.signature.as_bytes()) else {
            return false;
        };
        secp256k1::SECP256K1.verify_ecdsa(&message, &signature, &pubkey).is_ok()
    }
}

impl RLPEncode for Enr {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.signature)
            .encode_field(&self.seq)
            .encode_with(|buf| self.pairs.encode(buf))
            .finish();
    }
}

impl RLPDecode for Enr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        if decoder.is_done() {
            return Err(RLPDecodeError::malformed_data());
        }
        let (signature, decoder) = decoder.decode_field("signature")?;
        let (seq, decoder) = decoder.decode_field("seq")?;
        let (raw_pairs, decoder) = decode_flat_pairs(vec![], decoder)?;
        let remaining = decoder.finish()?;

        let pairs = EnrPairs::try_from_raw_pairs(raw_pairs)?;
        if pairs.id.as_deref() != Some("v4") {
            return Err(RLPDecodeError::Custom(
                "record missing or unsupported 'id' field".into(),
            ));
        }
        let enr = Enr { signature, seq, pairs };
        Ok((enr, remaining))
    }
}

fn decode_flat_pairs(
    mut pairs: Vec<(Bytes, Bytes)>,
    decoder: Decoder,
) -> Result<(Vec<(Bytes, Bytes)>, Decoder), RLPDecodeError> {
    let (key, decoder): (Option<Bytes>, Decoder) = decoder.decode_optional_field();
    match key {
        Some(k) => {
            let (value, decoder) = decoder.get_encoded_item()?;
            pairs.push((k, Bytes::from(value)));
            decode_flat_pairs(pairs, decoder)
        }
        None => Ok((pairs, decoder)),
    }
}

impl Enr {
    pub fn from_rlp(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() > MAX_ENR_ENCODED_SIZE {
            return Err(RLPDecodeError::invalid_length().into());
        }
        Ok(Enr::decode(bytes)?)
    }
}

/// A local, mutable, re-signable ENR: owns the node's secret key and its
/// currently-signed `Enr` snapshot. Every mutator bumps `seq` and re-signs.
#[derive(Debug, Clone)]
pub struct LocalEnr {
    signer: SecretKey,
    enr: Enr,
}

impl LocalEnr {
    pub fn new(signer: SecretKey, ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        let mut pairs = EnrPairs {
            id: Some("v4".to_string()),
            secp256k1: Some(H264::from_slice(
                &PublicKey::from_secret_key(secp256k1::SECP256K1, &signer).serialize(),
            )),
            udp_port: Some(udp_port),
            tcp_port: Some(tcp_port),
            ..Default::default()
        };
        match ip {
            IpAddr::V4(v4) => pairs.ip = Some(v4),
            IpAddr::V6(v6) => pairs.ip6 = Some(v6),
        }
        let mut enr = Enr { signature: H512::zero(), seq: 1, pairs };
        enr.signature = Self::sign(&signer, &enr);
        LocalEnr { signer, enr }
    }

    fn sign(signer: &SecretKey, enr: &Enr) -> H512 {
        let digest = enr.flattened_signature_digest();
        let message =
            secp256k1::Message::from_digest_slice(&digest).expect("32-byte digest is a valid message");
        let (_recovery_id, signature) =
            secp256k1::SECP256K1.sign_ecdsa_recoverable(&message, signer).serialize_compact();
        H512::from_slice(&signature)
    }

    pub fn enr(&self) -> &Enr {
        &self.enr
    }

    /// The static key backing this ENR, needed by the session layer to
    /// perform ECDH and produce id-signatures. Mirrors the teacher's
    /// `DiscoveryServer`, which likewise keeps `signer: SecretKey` alongside
    /// the node/record it signs.
    pub fn signer(&self) -> &SecretKey {
        &self.signer
    }

    pub fn node_id(&self) -> NodeId {
        self.enr.node_id().expect("local ENR always carries our own valid pubkey")
    }

    fn resign(&mut self) {
        self.enr.seq += 1;
        self.enr.signature = Self::sign(&self.signer, &self.enr);
    }

    /// Updates the advertised UDP socket, e.g. from a PONG-observed address.
    /// Returns `true` if anything actually changed (and thus `seq` advanced).
    pub fn set_udp_socket(&mut self, addr: SocketAddr) -> bool {
        let changed = self.enr.ip() != Some(addr.ip()) || self.enr.udp_port() != Some(addr.port());
        if !changed {
            return false;
        }
        match addr.ip() {
            IpAddr::V4(v4) => {
                self.enr.pairs.ip = Some(v4);
                self.enr.pairs.ip6 = None;
            }
            IpAddr::V6(v6) => {
                self.enr.pairs.ip6 = Some(v6);
                self.enr.pairs.ip = None;
            }
        }
        self.enr.pairs.udp_port = Some(addr.port());
        self.resign();
        true
    }

    pub fn set_tcp_port(&mut self, port: u16) {
        if self.enr.pairs.tcp_port == Some(port) {
            return;
        }
        self.enr.pairs.tcp_port = Some(port);
        self.resign();
    }

    pub fn set_extra(&mut self, key: Bytes, value: Bytes) {
        self.enr.pairs.extra.retain(|(k, _)| *k != key);
        self.enr.pairs.extra.push((key, value));
        self.resign();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn test_signer() -> SecretKey {
        SecretKey::from_slice(&hex!(
            "107db1eea7d4a8d7efa54de0c78f37cd09c2578b5c2e1ebf4a2544f226e168f6"
        ))
        .unwrap()
    }

    #[test]
    fn local_enr_round_trips_through_rlp() {
        let signer = test_signer();
        let local = LocalEnr::new(signer, IpAddr::from([127, 0, 0, 1]), 9000, 9000);
        let encoded = local.enr().encode_to_vec();
        let decoded = Enr::decode(&encoded).unwrap();
        assert_eq!(decoded, local.enr().clone());
        assert!(decoded.verify_signature());
    }

    #[test]
    fn node_id_matches_keccak_of_uncompressed_pubkey() {
        let signer = test_signer();
        let pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, &signer);
        let uncompressed = pubkey.serialize_uncompressed();
        let expected = node_id(&H512::from_slice(&uncompressed[1..]));

        let local = LocalEnr::new(signer, IpAddr::from([127, 0, 0, 1]), 9000, 9000);
        assert_eq!(local.node_id(), expected);
    }

    #[test]
    fn set_udp_socket_bumps_seq_and_resigns() {
        let signer = test_signer();
        let mut local = LocalEnr::new(signer, IpAddr::from([127, 0, 0, 1]), 9000, 9000);
        let seq_before = local.enr().seq();
        let changed = local.set_udp_socket("203.0.113.9:30303".parse().unwrap());
        assert!(changed);
        assert_eq!(local.enr().seq(), seq_before + 1);
        assert!(local.enr().verify_signature());
        assert_eq!(local.enr().udp_port(), Some(30303));
    }

    #[test]
    fn set_udp_socket_is_a_noop_when_unchanged() {
        let signer = test_signer();
        let mut local = LocalEnr::new(signer, IpAddr::from([127, 0, 0, 1]), 9000, 9000);
        let seq_before = local.enr().seq();
        let changed = local.set_udp_socket("127.0.0.1:9000".parse().unwrap());
        assert!(!changed);
        assert_eq!(local.enr().seq(), seq_before);
    }

    #[test]
    fn distance_is_symmetric_and_self_distance_is_zero() {
        let a = H256::from_low_u64_be(1);
        let b = H256::from_low_u64_be(0b1000);
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert_eq!(distance(&a, &a), 0);
    }

    #[test]
    fn xor_distance_distinguishes_peers_sharing_a_bucket() {
        let target = H256::from_low_u64_be(0);
        let a = H256::from_low_u64_be(0b1001);
        let b = H256::from_low_u64_be(0b1010);
        // Same leading bit (bucket index), different true distance.
        assert_eq!(distance(&target, &a), distance(&target, &b));
        assert_ne!(xor_distance(&target, &a), xor_distance(&target, &b));
        assert_eq!(xor_distance(&target, &target), U256::zero());
    }

    #[test]
    fn unknown_keys_round_trip_in_extra() {
        let signer = test_signer();
        let mut local = LocalEnr::new(signer, IpAddr::from([127, 0, 0, 1]), 9000, 9000);
        local.set_extra(Bytes::from_static(b"custom"), Bytes::from_static(&[1, 2, 3]));
        let encoded = local.enr().encode_to_vec();
        let decoded = Enr::decode(&encoded).unwrap();
        assert_eq!(
            decoded.extra(b"custom").cloned(),
            Some(Bytes::from_static(&[1, 2, 3]))
        );
    }
}
