use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    block::{Block, BlockData, BlockInfo},
    mse::Crypto,
    Bitfield,
};
use super::PeerError;

// Upper bound on a frame's declared length. Limits the ability of hostile
// peers to DOS us with ridiculous buffer sizes; large enough for the
// bitfield of a 262144-piece torrent.
pub const MSG_SIZE_LIMIT: usize = 32_769;

// BitTorrent protocol v1.0.
const MSG_ID_CHOKE: u8 = 0;
const MSG_ID_UNCHOKE: u8 = 1;
const MSG_ID_INTERESTED: u8 = 2;
const MSG_ID_NOTINTERESTED: u8 = 3;
const MSG_ID_HAVE: u8 = 4;
const MSG_ID_BITFIELD: u8 = 5;
const MSG_ID_REQUEST: u8 = 6;
const MSG_ID_PIECE: u8 = 7;
const MSG_ID_CANCEL: u8 = 8;

// Fast Extension, see <http://www.bittorrent.org/beps/bep_0006.html>.
const MSG_ID_SUGGEST_PIECE: u8 = 13;
const MSG_ID_HAVE_ALL: u8 = 14;
const MSG_ID_HAVE_NONE: u8 = 15;
const MSG_ID_REJECT_REQUEST: u8 = 16;
const MSG_ID_ALLOWED_FAST: u8 = 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // Advises the peer the connection is alive even without traffic.
    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests will be served again.
    Unchoke,

    // We (they) want to request blocks.
    Interested,

    NotInterested,

    // The sender acquired the piece with this index.
    Have { idx: u32 },

    // Full piece map, legal only as the first data message.
    Bitfield(Bitfield),

    // Ask for one block of a piece.
    Request(BlockInfo),

    // A block of piece data.
    Block(Block),

    // Withdraw an earlier request.
    Cancel(BlockInfo),

    // Fast Extension: advisory hint to fetch this piece.
    SuggestPiece { idx: u32 },

    // Fast Extension: stand-ins for an all-ones / all-zeroes bitfield.
    HaveAll,
    HaveNone,

    // Fast Extension: explicit refusal of a request.
    RejectRequest(BlockInfo),

    // Fast Extension: piece that may be requested even while choked.
    AllowedFast { idx: u32 },

}

impl Message {
    // Encoded size on the wire, length prefix included.
    pub fn wire_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 1,
            Message::Have { .. }
            | Message::SuggestPiece { .. }
            | Message::AllowedFast { .. } => 5,
            Message::Bitfield(bf) => 1 + bf.as_raw_slice().len(),
            Message::Request(_) | Message::Cancel(_) | Message::RejectRequest(_) => 13,
            Message::Block(block) => 9 + block.data.len(),
        }
    }
}

// Length-prefixed BT framing, optionally under a negotiated stream cipher:
// big-endian u32 length, one id byte, payload. A zero length is a
// keepalive. Frames are en/decrypted in place at the buffer edge so the
// framing logic itself never sees ciphertext.
pub struct MessageCodec {
    pub crypto: Crypto,
}

impl MessageCodec {

    pub fn plaintext() -> Self {
        Self { crypto: Crypto::plaintext() }
    }

    pub fn with_crypto(crypto: Crypto) -> Self {
        Self { crypto }
    }
}

fn put_header(dst: &mut BytesMut, msg_len: u32, id: u8) {
    dst.put_u32(msg_len);
    dst.put_u8(id);
}

fn put_block_info(dst: &mut BytesMut, id: u8, block: &BlockInfo) {
    put_header(dst, 13, id);
    dst.put_u32(block.piece_idx as u32);
    dst.put_u32(block.offset as u32);
    dst.put_u32(block.len as u32);
}

fn get_block_info(src: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_idx: src.get_u32() as usize,
        offset: src.get_u32() as usize,
        len: src.get_u32() as usize,
    }
}

// Fixed-size messages carry exactly their declared payload or the frame is
// rejected outright.
fn expect_payload(got: usize, wanted: usize) -> Result<(), PeerError> {
    if got != wanted {
        tracing::warn!("payload of {} bytes where {} were expected", got, wanted);
        return Err(PeerError::InvalidMessage);
    }
    Ok(())
}

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        match msg {

            Message::KeepAlive => dst.put_u32(0),

            Message::Choke => put_header(dst, 1, MSG_ID_CHOKE),
            Message::Unchoke => put_header(dst, 1, MSG_ID_UNCHOKE),
            Message::Interested => put_header(dst, 1, MSG_ID_INTERESTED),
            Message::NotInterested => put_header(dst, 1, MSG_ID_NOTINTERESTED),
            Message::HaveAll => put_header(dst, 1, MSG_ID_HAVE_ALL),
            Message::HaveNone => put_header(dst, 1, MSG_ID_HAVE_NONE),

            Message::Have { idx } => {
                put_header(dst, 5, MSG_ID_HAVE);
                dst.put_u32(idx);
            },
            Message::SuggestPiece { idx } => {
                put_header(dst, 5, MSG_ID_SUGGEST_PIECE);
                dst.put_u32(idx);
            },
            Message::AllowedFast { idx } => {
                put_header(dst, 5, MSG_ID_ALLOWED_FAST);
                dst.put_u32(idx);
            },

            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                put_header(dst, 1 + raw.len() as u32, MSG_ID_BITFIELD);
                dst.extend_from_slice(raw);
            },

            Message::Request(block) => put_block_info(dst, MSG_ID_REQUEST, &block),
            Message::Cancel(block) => put_block_info(dst, MSG_ID_CANCEL, &block),
            Message::RejectRequest(block) => put_block_info(dst, MSG_ID_REJECT_REQUEST, &block),

            Message::Block(block) => {
                let data = block.data.as_slice();
                put_header(dst, 9 + data.len() as u32, MSG_ID_PIECE);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(data);
            },
        }

        self.crypto.encrypt_in_place(&mut dst[start..]);
        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        self.crypto.decrypt_buffered(src);

        if src.len() < 4 {
            return Ok(None);
        }
        // Peek the length prefix without committing to the frame. Unwrap
        // safe, four bytes are present.
        let msg_len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;

        if msg_len > MSG_SIZE_LIMIT {
            return Err(PeerError::MessageTooLarge(msg_len));
        }
        if src.len() < 4 + msg_len {
            return Ok(None);
        }

        src.advance(4);
        if msg_len == 0 {
            self.crypto.consumed(4);
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let payload_len = msg_len - 1;
        let msg = match id {
            MSG_ID_CHOKE => {
                expect_payload(payload_len, 0)?;
                Message::Choke
            },
            MSG_ID_UNCHOKE => {
                expect_payload(payload_len, 0)?;
                Message::Unchoke
            },
            MSG_ID_INTERESTED => {
                expect_payload(payload_len, 0)?;
                Message::Interested
            },
            MSG_ID_NOTINTERESTED => {
                expect_payload(payload_len, 0)?;
                Message::NotInterested
            },
            MSG_ID_HAVE => {
                expect_payload(payload_len, 4)?;
                Message::Have { idx: src.get_u32() }
            },
            MSG_ID_BITFIELD => {
                let raw = src.split_to(payload_len);
                Message::Bitfield(Bitfield::from_slice(&raw))
            },
            MSG_ID_REQUEST => {
                expect_payload(payload_len, 12)?;
                Message::Request(get_block_info(src))
            },
            MSG_ID_PIECE => {
                if payload_len < 8 {
                    tracing::warn!("piece frame with {}-byte payload", payload_len);
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let data = src.split_to(payload_len - 8).to_vec();
                Message::Block(Block { piece_idx, offset, data: BlockData::Owned(data) })
            },
            MSG_ID_CANCEL => {
                expect_payload(payload_len, 12)?;
                Message::Cancel(get_block_info(src))
            },
            MSG_ID_SUGGEST_PIECE => {
                expect_payload(payload_len, 4)?;
                Message::SuggestPiece { idx: src.get_u32() }
            },
            MSG_ID_HAVE_ALL => {
                expect_payload(payload_len, 0)?;
                Message::HaveAll
            },
            MSG_ID_HAVE_NONE => {
                expect_payload(payload_len, 0)?;
                Message::HaveNone
            },
            MSG_ID_REJECT_REQUEST => {
                expect_payload(payload_len, 12)?;
                Message::RejectRequest(get_block_info(src))
            },
            MSG_ID_ALLOWED_FAST => {
                expect_payload(payload_len, 4)?;
                Message::AllowedFast { idx: src.get_u32() }
            },
            id => {
                tracing::warn!("unlisted message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };

        self.crypto.consumed(4 + msg_len);
        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request {{ piece: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block {{ piece: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel {{ piece: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::SuggestPiece { idx } => write!(f, "suggest piece {}", idx),
            Message::HaveAll => write!(f, "have all"),
            Message::HaveNone => write!(f, "have none"),
            Message::RejectRequest(block) => write!(f, "reject request {{ piece: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::AllowedFast { idx } => write!(f, "allowed fast {}", idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> Vec<(Message, Vec<u8>)> {
        let block = BlockInfo { piece_idx: 2, offset: 0x4000, len: 0x4000 };
        let block_wire = |id: u8| -> Vec<u8> {
            vec![0, 0, 0, 13, id, 0, 0, 0, 2, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        };

        vec![
            (Message::KeepAlive, vec![0, 0, 0, 0]),
            (Message::Choke, vec![0, 0, 0, 1, 0]),
            (Message::Unchoke, vec![0, 0, 0, 1, 1]),
            (Message::Interested, vec![0, 0, 0, 1, 2]),
            (Message::NotInterested, vec![0, 0, 0, 1, 3]),
            (Message::Have { idx: 0x1234 }, vec![0, 0, 0, 5, 4, 0, 0, 0x12, 0x34]),
            (
                Message::Bitfield(Bitfield::from_slice(&[0xf0, 0x0f])),
                vec![0, 0, 0, 3, 5, 0xf0, 0x0f],
            ),
            (Message::Request(block), block_wire(6)),
            (
                Message::Block(Block {
                    piece_idx: 2,
                    offset: 0x4000,
                    data: BlockData::Owned(vec![0xaa; 4]),
                }),
                vec![0, 0, 0, 13, 7, 0, 0, 0, 2, 0, 0, 0x40, 0, 0xaa, 0xaa, 0xaa, 0xaa],
            ),
            (Message::Cancel(block), block_wire(8)),
            (Message::SuggestPiece { idx: 3 }, vec![0, 0, 0, 5, 13, 0, 0, 0, 3]),
            (Message::HaveAll, vec![0, 0, 0, 1, 14]),
            (Message::HaveNone, vec![0, 0, 0, 1, 15]),
            (Message::RejectRequest(block), block_wire(16)),
            (Message::AllowedFast { idx: 9 }, vec![0, 0, 0, 5, 17, 0, 0, 0, 9]),
        ]
    }

    // Every message, v1.0 and Fast alike, against its exact wire bytes in
    // both directions.
    #[test]
    fn test_wire_round_trip() {
        let mut codec = MessageCodec::plaintext();
        for (msg, raw) in fixtures() {
            assert_eq!(msg.wire_len(), raw.len(), "wire_len mismatch for {}", msg);

            let mut encoded = BytesMut::new();
            codec.encode(msg.clone(), &mut encoded).unwrap();
            assert_eq!(&encoded[..], &raw[..], "encoding mismatch for {}", msg);

            let mut incoming = BytesMut::from(&raw[..]);
            let decoded = codec.decode(&mut incoming).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoding mismatch");
            assert!(incoming.is_empty(), "decoder left bytes behind for {}", msg);
        }
    }

    // Frames arriving in arbitrary chunks decode once complete, and never
    // before.
    #[test]
    fn test_split_frame_reassembly() {
        let reject = Message::RejectRequest(BlockInfo { piece_idx: 1, offset: 0, len: 0x2000 });
        let piece = Message::Block(Block {
            piece_idx: 1,
            offset: 0x2000,
            data: BlockData::Owned((0..64).collect()),
        });

        let mut codec = MessageCodec::plaintext();
        let mut wire = BytesMut::new();
        codec.encode(reject.clone(), &mut wire).unwrap();
        codec.encode(piece.clone(), &mut wire).unwrap();

        // Cut mid-prefix, mid-payload and across the frame boundary.
        let cuts = [3usize, 9, 20, wire.len()];
        let mut incoming = BytesMut::new();
        let mut decoded = Vec::new();
        let mut fed = 0;
        for cut in cuts {
            incoming.extend_from_slice(&wire[fed..cut]);
            fed = cut;
            while let Some(msg) = codec.decode(&mut incoming).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, vec![reject, piece]);
    }

    // A declared length past the frame cap fails fast, before the payload
    // is ever buffered.
    #[test]
    fn test_frame_cap_enforced() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MSG_SIZE_LIMIT as u32 + 1).to_be_bytes());
        buf.extend_from_slice(&[5; 8]);
        match MessageCodec::plaintext().decode(&mut buf) {
            Err(PeerError::MessageTooLarge(len)) => assert_eq!(len, MSG_SIZE_LIMIT + 1),
            other => panic!("expected MessageTooLarge, got {:?}", other.is_ok()),
        }
    }

    // Ids we don't implement (PORT, extension protocol, garbage) close the
    // connection rather than being skipped.
    #[test]
    fn test_unlisted_ids_rejected() {
        for id in [9u8, 11, 20, 255] {
            let mut buf = BytesMut::from(&[0u8, 0, 0, 1, id][..]);
            match MessageCodec::plaintext().decode(&mut buf) {
                Err(PeerError::InvalidMessageId(got)) => assert_eq!(got, id),
                other => panic!("id {} should be rejected, got {:?}", id, other.is_ok()),
            }
        }
    }

    // Known ids with the wrong payload size are malformed frames, not
    // best-effort parses.
    #[test]
    fn test_bad_payload_length_rejected() {
        let frames: Vec<Vec<u8>> = vec![
            // CHOKE with a stray payload byte.
            vec![0, 0, 0, 2, 0, 0xff],
            // HAVE with a truncated index.
            vec![0, 0, 0, 3, 4, 0, 0],
            // REQUEST missing its length field.
            vec![0, 0, 0, 9, 6, 0, 0, 0, 1, 0, 0, 0, 0],
            // PIECE too short to carry its own header.
            vec![0, 0, 0, 5, 7, 0, 0, 0, 1],
        ];
        for frame in frames {
            let mut buf = BytesMut::from(&frame[..]);
            match MessageCodec::plaintext().decode(&mut buf) {
                Err(PeerError::InvalidMessage) => {}
                other => panic!("frame {:?} should be rejected, got {:?}", frame, other.is_ok()),
            }
        }
    }

    // The same stream through paired RC4 codecs, delivered byte by byte to
    // exercise the decrypt watermark across partial frames.
    #[test]
    fn test_encrypted_stream_round_trip() {
        use crate::mse::{Arc4, Cipher, CipherPair, Crypto};

        let key = b"stream key";
        let mut tx = MessageCodec::with_crypto(Crypto::new(
            CipherPair { encrypt: Cipher::Rc4(Arc4::new(key)), decrypt: Cipher::Plain },
            0,
        ));
        let mut rx = MessageCodec::with_crypto(Crypto::new(
            CipherPair { encrypt: Cipher::Plain, decrypt: Cipher::Rc4(Arc4::new(key)) },
            0,
        ));

        let messages = vec![
            Message::Interested,
            Message::Have { idx: 7 },
            Message::Block(Block { piece_idx: 1, offset: 0, data: BlockData::Owned(vec![9; 64]) }),
            Message::KeepAlive,
        ];

        let mut wire = BytesMut::new();
        for msg in &messages {
            tx.encode(msg.clone(), &mut wire).unwrap();
        }

        let mut incoming = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire {
            incoming.extend_from_slice(&[byte]);
            if let Some(msg) = rx.decode(&mut incoming).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, messages);
    }
}
