//! The BitTorrent peer wire protocol (BEP 3) framing, plus the handful of
//! extension messages (BEP 10) this crate understands: `ut_metadata` (BEP 9)
//! and `ut_pex` (BEP 11).
//!
//! Two codecs are used in sequence on the same connection, matching the
//! teacher's approach in [`super::PeerSession::start`]: [`HandshakeCodec`]
//! for the fixed-size handshake, then [`PeerCodec`] for every subsequent
//! length-prefixed message.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed-size handshake that precedes all other messages on a
/// connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            // bit 20 (0x10) from the right of the last reserved byte
            // advertises support for the extension protocol (BEP 10).
            reserved: [0, 0, 0, 0, 0, 0x10, 0, 0],
            info_hash,
            peer_id,
        }
    }

    /// Whether the peer's reserved bytes advertise BEP 10 extension
    /// protocol support.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }
}

pub(crate) struct HandshakeCodec;

pub(crate) const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        if prot_len != 19 {
            return Err(Error::InvalidMessage);
        }
        let mut buf = buf.split_to(HANDSHAKE_LEN);
        buf.advance(1);

        let mut prot = [0; 19];
        prot.copy_from_slice(&buf[0..19]);
        buf.advance(19);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidMessage);
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[0..8]);
        buf.advance(8);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[0..20]);
        buf.advance(20);

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[0..20]);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message type tag, sent as the first byte of a message's payload
/// (after the 4 byte length prefix).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Extended = 20,
}

impl MessageId {
    fn from_u8(id: u8) -> Result<Self, Error> {
        Ok(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            20 => Self::Extended,
            _ => return Err(Error::InvalidMessage),
        })
    }
}

/// A decoded peer wire protocol message.
#[derive(Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// A BEP 10 extension message: `ut_metadata` or `ut_pex`, identified by
    /// the extended message id the peer negotiated. Payload is the raw
    /// bencoded dictionary (plus any trailing binary piece for
    /// `ut_metadata`); higher level handling lives in [`super`].
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    pub fn id(&self) -> &'static str {
        match self {
            Self::KeepAlive => "keep-alive",
            Self::Choke => "choke",
            Self::Unchoke => "unchoke",
            Self::Interested => "interested",
            Self::NotInterested => "not-interested",
            Self::Have { .. } => "have",
            Self::Bitfield(_) => "bitfield",
            Self::Request(_) => "request",
            Self::Block { .. } => "block",
            Self::Cancel(_) => "cancel",
            Self::Extended { .. } => "extended",
        }
    }
}

pub(crate) struct PeerCodec;

fn encode_block_info(buf: &mut BytesMut, info: &BlockInfo) {
    buf.put_u32(info.piece_index as u32);
    buf.put_u32(info.offset);
    buf.put_u32(info.len);
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                encode_block_info(buf, &info);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                encode_block_info(buf, &info);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.put_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            // not enough data yet for the full message; reserve the
            // remainder so the next read fills it in one go
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::from_u8(buf[0])?;
        let mut payload = buf.split_to(len);
        payload.advance(1);

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(Error::InvalidMessage);
                }
                let piece_index = payload.get_u32() as PieceIndex;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                // trailing spare bits in the last byte are not meaningful;
                // callers resize this down to the torrent's piece count.
                Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }
            MessageId::Request => {
                if payload.len() != 12 {
                    return Err(Error::InvalidMessage);
                }
                Message::Request(decode_block_info(&mut payload))
            }
            MessageId::Block => {
                if payload.len() < 8 {
                    return Err(Error::InvalidMessage);
                }
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: payload.to_vec(),
                }
            }
            MessageId::Cancel => {
                if payload.len() != 12 {
                    return Err(Error::InvalidMessage);
                }
                Message::Cancel(decode_block_info(&mut payload))
            }
            MessageId::Extended => {
                if payload.is_empty() {
                    return Err(Error::InvalidMessage);
                }
                let ext_id = payload.get_u8();
                Message::Extended {
                    id: ext_id,
                    payload: payload.to_vec(),
                }
            }
        };

        Ok(Some(msg))
    }
}

fn decode_block_info(payload: &mut BytesMut) -> BlockInfo {
    let piece_index = payload.get_u32() as PieceIndex;
    let offset = payload.get_u32();
    let len = payload.get_u32();
    BlockInfo {
        piece_index,
        offset,
        len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_request_message() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let info = BlockInfo {
            piece_index: 3,
            offset: 16 * 1024,
            len: 16 * 1024,
        };
        codec.encode(Message::Request(info), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Request(got) => assert_eq!(got, info),
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[test]
    fn keep_alive_has_zero_length_prefix() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn decode_waits_for_full_message() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        // missing the 4-byte piece index
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([1; 20], [2; 20]);
        codec.encode(handshake.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, handshake.info_hash);
        assert_eq!(decoded.peer_id, handshake.peer_id);
        assert!(decoded.supports_extensions());
    }
}
