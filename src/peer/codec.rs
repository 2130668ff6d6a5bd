//! The peer wire protocol codec: the fixed 68 byte handshake record and the
//! length-prefixed message frames that follow it.
//!
//! Every frame is `length: u32 big endian | id: u8 | payload`; a length of
//! zero is a keepalive and carries neither id nor payload. The handshake is
//! exchanged exactly once per connection with [`HandshakeCodec`], after
//! which the session swaps the transport over to [`PeerCodec`], keeping any
//! already buffered bytes.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PieceIndex,
};

/// The protocol string of the standard BitTorrent handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake length: 1 + 19 + 8 + 20 + 20 bytes.
const HANDSHAKE_LEN: usize = 68;

/// Frames above this are rejected outright. Generous enough for a 16 KiB
/// block message or the bitfield of a very large torrent, small enough that
/// a bogus length prefix can't make us balloon the read buffer.
const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// The fixed record exchanged once at the start of every peer connection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Handshake {
    /// The protocol string, always "BitTorrent protocol".
    pub prot: [u8; 19],
    /// Extension bits. We set none and ignore the peer's.
    pub reserved: [u8; 8],
    /// The torrent's info hash. A mismatch aborts the session.
    pub info_hash: [u8; 20],
    /// The remote's arbitrary 20 byte peer id.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.prot.len() as u8);
        buf.extend_from_slice(&handshake.prot);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash);
        buf.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string length is checked before waiting for the rest
        // of the record so that a bogus peer is rejected on its first byte
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(Error::Handshake("invalid protocol string length"));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != *PROTOCOL_STRING.as_bytes() {
            return Err(Error::Handshake("invalid protocol string"));
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message ids of the standard wire protocol.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            _ => Err(Error::Protocol("unknown message id")),
        }
    }
}

/// A decoded peer message. The session dispatches on this with an exhaustive
/// match.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    /// The raw availability bits as sent by the peer. The length is a
    /// multiple of 8; validation against the torrent's piece count is the
    /// session's job.
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// The message's wire id, or `None` for a keepalive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("flag message has an id") as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let data = bitfield.into_vec();
                buf.put_u32(1 + data.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&data);
            }
            Message::Request(block) => {
                encode_block_info(MessageId::Request, block, buf);
            }
            Message::Cancel(block) => {
                encode_block_info(MessageId::Cancel, block, buf);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

fn encode_block_info(id: MessageId, block: BlockInfo, buf: &mut BytesMut) {
    buf.put_u32(13);
    buf.put_u8(id as u8);
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming it, in case the rest
        // of the frame hasn't arrived yet
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(prefix);

        if frame_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if frame_len > MAX_FRAME_LEN {
            return Err(Error::Protocol("frame length above cap"));
        }
        if (buf.len() as u32) < 4 + frame_len {
            buf.reserve(4 + frame_len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let mut payload = buf.split_to(frame_len as usize);
        let id = MessageId::try_from(payload.get_u8())?;

        let msg = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => {
                if payload.has_remaining() {
                    return Err(Error::Protocol("unexpected message payload"));
                }
                match id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    MessageId::NotInterested => Message::NotInterested,
                    _ => unreachable!(),
                }
            }
            MessageId::Have => {
                if payload.remaining() != 4 {
                    return Err(Error::Protocol("invalid have payload"));
                }
                Message::Have {
                    piece_index: payload.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(payload.as_ref().to_vec()))
            }
            MessageId::Request => {
                Message::Request(decode_block_info(&mut payload)?)
            }
            MessageId::Cancel => {
                Message::Cancel(decode_block_info(&mut payload)?)
            }
            MessageId::Piece => {
                if payload.remaining() < 8 {
                    return Err(Error::Protocol("invalid piece payload"));
                }
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: payload.as_ref().to_vec(),
                }
            }
        };

        Ok(Some(msg))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::Protocol("connection closed mid frame")),
        }
    }
}

fn decode_block_info(payload: &mut BytesMut) -> Result<BlockInfo> {
    if payload.remaining() != 12 {
        return Err(Error::Protocol("invalid block info payload"));
    }
    Ok(BlockInfo {
        piece_index: payload.get_u32() as PieceIndex,
        offset: payload.get_u32(),
        len: payload.get_u32(),
    })
}
