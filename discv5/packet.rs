//! Wire packet framing: header masking, authdata layout, and AES-128-GCM
//! message encryption/decryption.
//!
//! Grounded on `discv5/server.rs`'s packet send/receive paths
//! (`send_packet`/`handle_packet`/`send_who_are_you`/`send_handshake`) for
//! the overall flow, and `discv5/codec.rs`'s `Discv5Codec` for the
//! `tokio_util` decode-only listener wrapper. The actual authdata byte
//! layout and challenge-data/AAD formula come straight from the wire
//! specification in `SPEC_FULL.md` §4.2/§6, since the teacher's own
//! `messages.rs` only stubs this out (hardcodes a fixed PING return and a
//! no-op encode).
use bytes::{BufMut, BytesMut};
use tokio_util::codec::Decoder;

use crate::crypto::CryptoProvider;
use crate::error::PacketCodecError;
use crate::node::{Enr, NodeId};

pub const PROTOCOL_ID: &[u8; 6] = b"discv5";
pub const VERSION: u16 = 0x0001;
pub const STATIC_HEADER_LEN: usize = 23;
pub const MASKING_IV_LEN: usize = 16;
pub const MIN_PACKET_LEN: usize = 63;

pub const FLAG_ORDINARY: u8 = 0x00;
pub const FLAG_WHOAREYOU: u8 = 0x01;
pub const FLAG_HANDSHAKE: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authdata {
    Ordinary { src_id: NodeId },
    Whoareyou { id_nonce: [u8; 16], enr_seq: u64 },
    Handshake { src_id: NodeId, id_signature: Vec<u8>, ephemeral_pubkey: Vec<u8>, enr: Option<Enr> },
}

impl Authdata {
    pub(crate) fn flag(&self) -> u8 {
        match self {
            Authdata::Ordinary { .. } => FLAG_ORDINARY,
            Authdata::Whoareyou { .. } => FLAG_WHOAREYOU,
            Authdata::Handshake { .. } => FLAG_HANDSHAKE,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Authdata::Ordinary { src_id } => buf.put_slice(src_id.as_bytes()),
            Authdata::Whoareyou { id_nonce, enr_seq } => {
                buf.put_slice(id_nonce);
                buf.put_slice(&enr_seq.to_be_bytes());
            }
            Authdata::Handshake { src_id, id_signature, ephemeral_pubkey, enr } => {
                buf.put_slice(src_id.as_bytes());
                buf.put_u8(id_signature.len() as u8);
                buf.put_u8(ephemeral_pubkey.len() as u8);
                buf.put_slice(id_signature);
                buf.put_slice(ephemeral_pubkey);
                if let Some(enr) = enr {
                    use discv5_rlp::encode::RLPEncode;
                    enr.encode(&mut buf);
                }
            }
        }
        buf
    }

    fn decode(flag: u8, raw: &[u8]) -> Result<Self, PacketCodecError> {
        match flag {
            FLAG_ORDINARY => {
                if raw.len() != 32 {
                    return Err(PacketCodecError::InvalidAuthdata);
                }
                Ok(Authdata::Ordinary { src_id: NodeId::from_slice(raw) })
            }
            FLAG_WHOAREYOU => {
                if raw.len() != 24 {
                    return Err(PacketCodecError::InvalidAuthdata);
                }
                let mut id_nonce = [0u8; 16];
                id_nonce.copy_from_slice(&raw[..16]);
                let enr_seq = u64::from_be_bytes(raw[16..24].try_into().expect("8 bytes"));
                Ok(Authdata::Whoareyou { id_nonce, enr_seq })
            }
            FLAG_HANDSHAKE => {
                if raw.len() < 34 {
                    return Err(PacketCodecError::InvalidAuthdata);
                }
                let src_id = NodeId::from_slice(&raw[..32]);
                let sig_size = raw[32] as usize;
                let eph_key_size = raw[33] as usize;
                let mut offset = 34;
                let Some(id_signature) = raw.get(offset..offset + sig_size) else {
                    return Err(PacketCodecError::InvalidAuthdata);
                };
                offset += sig_size;
                let Some(ephemeral_pubkey) = raw.get(offset..offset + eph_key_size) else {
                    return Err(PacketCodecError::InvalidAuthdata);
                };
                offset += eph_key_size;
                let enr = if offset < raw.len() {
                    use discv5_rlp::decode::RLPDecode;
                    Some(Enr::decode(&raw[offset..])?)
                } else {
                    None
                };
                Ok(Authdata::Handshake {
                    src_id,
                    id_signature: id_signature.to_vec(),
                    ephemeral_pubkey: ephemeral_pubkey.to_vec(),
                    enr,
                })
            }
            _ => Err(PacketCodecError::InvalidAuthdata),
        }
    }
}

/// A framed discv5 packet. `ciphertext` is the AES-128-GCM message body
/// (empty for WHOAREYOU, which carries no message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub masking_iv: [u8; 16],
    pub static_header_raw: [u8; STATIC_HEADER_LEN],
    pub nonce: [u8; 12],
    pub authdata_raw: Vec<u8>,
    pub authdata: Authdata,
    pub ciphertext: Vec<u8>,
}

impl Packet {
    pub fn flag(&self) -> u8 {
        self.authdata.flag()
    }

    /// Builds the 23-byte static header for a packet about to be sent, given
    /// its already-encoded authdata length. Shared by [`Self::encode`] and by
    /// callers that need to compute the packet's AAD (for GCM encryption)
    /// before the ciphertext exists, since [`Self::encode`] takes ciphertext
    /// as an already-encrypted input rather than performing encryption
    /// itself.
    pub(crate) fn build_static_header(flag: u8, nonce: &[u8; 12], authdata_len: u16) -> [u8; STATIC_HEADER_LEN] {
        let mut header = [0u8; STATIC_HEADER_LEN];
        header[0..6].copy_from_slice(PROTOCOL_ID);
        header[6..8].copy_from_slice(&VERSION.to_be_bytes());
        header[8] = flag;
        header[9..21].copy_from_slice(nonce);
        header[21..23].copy_from_slice(&authdata_len.to_be_bytes());
        header
    }

    /// `masking-iv || static-header || authdata`, the commitment both the
    /// GCM AAD and the WHOAREYOU challenge-data are built from.
    pub fn associated_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(MASKING_IV_LEN + STATIC_HEADER_LEN + self.authdata_raw.len());
        data.extend_from_slice(&self.masking_iv);
        data.extend_from_slice(&self.static_header_raw);
        data.extend_from_slice(&self.authdata_raw);
        data
    }

    /// Builds and masks a packet. `mask_node_id` is the destination's NodeId
    /// (the mask key is always keyed to the packet's addressee).
    pub fn encode(
        crypto: &impl CryptoProvider,
        mask_node_id: &NodeId,
        nonce: [u8; 12],
        masking_iv: [u8; 16],
        authdata: Authdata,
        ciphertext: Vec<u8>,
    ) -> (Self, Vec<u8>) {
        let authdata_raw = authdata.encode();
        let static_header_raw = Self::build_static_header(authdata.flag(), &nonce, authdata_raw.len() as u16);

        let mask_key = mask_key_from(mask_node_id);
        let mut masked = Vec::with_capacity(STATIC_HEADER_LEN + authdata_raw.len());
        masked.extend_from_slice(&static_header_raw);
        masked.extend_from_slice(&authdata_raw);
        crypto.aes_ctr_apply(&mask_key, &masking_iv, &mut masked);

        let mut wire = Vec::with_capacity(MASKING_IV_LEN + masked.len() + ciphertext.len());
        wire.extend_from_slice(&masking_iv);
        wire.extend_from_slice(&masked);
        wire.extend_from_slice(&ciphertext);

        let packet = Packet { masking_iv, static_header_raw, nonce, authdata_raw, authdata, ciphertext };
        (packet, wire)
    }

    /// Parses and unmasks a packet addressed to `local_node_id`. Does not
    /// attempt GCM decryption of `ciphertext` — that requires a session key
    /// and is done by the caller once it has looked one up.
    pub fn decode(local_node_id: &NodeId, raw: &[u8]) -> Result<Self, PacketCodecError> {
        if raw.len() < MIN_PACKET_LEN {
            return Err(PacketCodecError::TooSmall);
        }
        let mut masking_iv = [0u8; MASKING_IV_LEN];
        masking_iv.copy_from_slice(&raw[..MASKING_IV_LEN]);

        let mask_key = mask_key_from(local_node_id);
        // CTR keystream bytes are positionally independent, so it's safe to
        // unmask more than the true header+authdata length in one pass and
        // only keep the prefix the declared authdata-size says is real; the
        // rest of the tail is genuine GCM ciphertext and is sliced from the
        // original (still-masked) buffer, never from this decrypted copy.
        let masked_region = &raw[MASKING_IV_LEN..];
        let mut unmasked = masked_region.to_vec();
        CryptoProviderDefault::aes_ctr_apply_static(&mask_key, &masking_iv, &mut unmasked);

        if unmasked.len() < STATIC_HEADER_LEN {
            return Err(PacketCodecError::TooSmall);
        }
        let mut static_header_raw = [0u8; STATIC_HEADER_LEN];
        static_header_raw.copy_from_slice(&unmasked[..STATIC_HEADER_LEN]);

        if &static_header_raw[0..6] != PROTOCOL_ID {
            return Err(PacketCodecError::WrongProtocol);
        }
        let version = u16::from_be_bytes(static_header_raw[6..8].try_into().expect("2 bytes"));
        if version != VERSION {
            return Err(PacketCodecError::UnsupportedVersion);
        }
        let flag = static_header_raw[8];
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&static_header_raw[9..21]);
        let authdata_size = u16::from_be_bytes(static_header_raw[21..23].try_into().expect("2 bytes")) as usize;

        let authdata_raw = unmasked
            .get(STATIC_HEADER_LEN..STATIC_HEADER_LEN + authdata_size)
            .ok_or(PacketCodecError::InvalidAuthdata)?
            .to_vec();
        let authdata = Authdata::decode(flag, &authdata_raw)?;

        let ciphertext_start = MASKING_IV_LEN + STATIC_HEADER_LEN + authdata_size;
        let ciphertext = raw.get(ciphertext_start..).ok_or(PacketCodecError::InvalidAuthdata)?.to_vec();

        Ok(Packet { masking_iv, static_header_raw, nonce, authdata_raw, authdata, ciphertext })
    }
}

fn mask_key_from(node_id: &NodeId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key.copy_from_slice(&node_id.as_bytes()[..16]);
    key
}

/// Header masking doesn't depend on session state, so `Packet::decode` can't
/// take a `&impl CryptoProvider` without becoming generic over a type the
/// `tokio_util` `Decoder` impl below has no way to supply. It always uses the
/// default provider; callers that need a fake for deterministic tests should
/// exercise `Authdata`/`Packet::encode` directly instead.
struct CryptoProviderDefault;

impl CryptoProviderDefault {
    fn aes_ctr_apply_static(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
        crate::crypto::DefaultCryptoProvider.aes_ctr_apply(key, iv, data);
    }
}

/// Decode-only `tokio_util` wrapper for a `UdpFramed` listener. Encoding goes
/// through `Packet::encode` directly from the service, which already has the
/// session/crypto context it needs — mirrors the teacher's `Discv5Codec`,
/// which is likewise receive-only.
#[derive(Debug)]
pub struct Discv5Codec {
    local_node_id: NodeId,
}

impl Discv5Codec {
    pub fn new(local_node_id: NodeId) -> Self {
        Self { local_node_id }
    }
}

impl Decoder for Discv5Codec {
    type Item = Packet;
    type Error = PacketCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let datagram = buf.split_to(buf.len());
        Ok(Some(Packet::decode(&self.local_node_id, &datagram)?))
    }
}

impl tokio_util::codec::Encoder<Packet> for Discv5Codec {
    type Error = PacketCodecError;

    fn encode(&mut self, _packet: Packet, _buf: &mut BytesMut) -> Result<(), Self::Error> {
        Err(PacketCodecError::InvalidAuthdata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptoProvider;
    use ethereum_types::H256;

    #[test]
    fn ordinary_packet_round_trips_header() {
        let local_id = H256::from_low_u64_be(0xaaaa);
        let src_id = H256::from_low_u64_be(0xbbbb);
        let crypto = DefaultCryptoProvider;

        let (built, wire) = Packet::encode(
            &crypto,
            &local_id,
            [7u8; 12],
            [9u8; 16],
            Authdata::Ordinary { src_id },
            b"ciphertext-placeholder".to_vec(),
        );

        let decoded = Packet::decode(&local_id, &wire).unwrap();
        assert_eq!(decoded.flag(), FLAG_ORDINARY);
        assert_eq!(decoded.nonce, built.nonce);
        assert_eq!(decoded.authdata, Authdata::Ordinary { src_id });
        assert_eq!(decoded.ciphertext, b"ciphertext-placeholder".to_vec());
        assert_eq!(decoded.associated_data(), built.associated_data());
    }

    #[test]
    fn whoareyou_packet_has_no_ciphertext() {
        let local_id = H256::from_low_u64_be(1);
        let crypto = DefaultCryptoProvider;
        let (_, wire) = Packet::encode(
            &crypto,
            &local_id,
            [1u8; 12],
            [2u8; 16],
            Authdata::Whoareyou { id_nonce: [3u8; 16], enr_seq: 42 },
            vec![],
        );
        let decoded = Packet::decode(&local_id, &wire).unwrap();
        assert!(decoded.ciphertext.is_empty());
        assert_eq!(decoded.authdata, Authdata::Whoareyou { id_nonce: [3u8; 16], enr_seq: 42 });
    }

    /// The official discv5 "Ping Handshake Message" test vector (also the
    /// one genuine, non-stubbed test case in the pack's `messages.rs`,
    /// which otherwise only hardcodes a fixed return value). Confirms this
    /// module's unmask-then-slice decode strategy against real wire bytes,
    /// and that the resulting plaintext is a valid `Message::Ping` once
    /// GCM-decrypted under the published all-zero read-key.
    #[test]
    fn decodes_and_decrypts_the_official_ping_vector() {
        use hex_literal::hex;

        let dest_node_id = H256::from_slice(&hex!(
            "bbbb9d047f0488c0b5a93c1c3f2d8bafc7c8ff337024a55434a0d0555de64db9"
        ));
        let src_node_id = H256::from_slice(&hex!(
            "aaaa8419e9f49d0083561b48287df592939a8d19947d8c0ef88f2a4856a69fbb"
        ));
        let encoded = hex!(
            "00000000000000000000000000000000088b3d4342774649325f313964a39e55ea96c005ad52be8c7560413a7008f16c9e6d2f43bbea8814a546b7409ce783d34c4f53245d08dab84102ed931f66d1492acb308fa1c6715b9d139b81acbdcc"
        );

        let packet = Packet::decode(&dest_node_id, &encoded).unwrap();
        assert_eq!(packet.flag(), FLAG_ORDINARY);
        assert_eq!(packet.authdata, Authdata::Ordinary { src_id: src_node_id });
        assert_eq!(packet.nonce, [0xffu8; 12]);
        assert_eq!(packet.ciphertext.len(), 24);

        let read_key = [0u8; 16];
        let plaintext = DefaultCryptoProvider
            .aes_gcm_decrypt(&read_key, &packet.nonce, &packet.associated_data(), &packet.ciphertext)
            .unwrap();

        let message = crate::message::Message::decode(&plaintext).unwrap();
        assert_eq!(
            message,
            crate::message::Message::Ping { request_id: bytes::Bytes::from_static(&[0, 0, 0, 1]), enr_seq: 2 }
        );
    }

    #[test]
    fn decode_rejects_too_small_packets() {
        let local_id = H256::zero();
        assert!(matches!(Packet::decode(&local_id, &[0u8; 10]), Err(PacketCodecError::TooSmall)));
    }

    #[test]
    fn decode_rejects_wrong_protocol_id() {
        let local_id = H256::from_low_u64_be(5);
        let crypto = DefaultCryptoProvider;
        let (_, mut wire) = Packet::encode(
            &crypto,
            &local_id,
            [0u8; 12],
            [0u8; 16],
            Authdata::Ordinary { src_id: H256::from_low_u64_be(6) },
            vec![1, 2, 3],
        );
        // Corrupt the masking IV so the unmasked protocol-id no longer matches.
        wire[0] ^= 0xff;
        assert!(matches!(
            Packet::decode(&local_id, &wire),
            Err(PacketCodecError::WrongProtocol) | Err(PacketCodecError::InvalidAuthdata)
        ));
    }
}
