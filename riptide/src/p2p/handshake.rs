use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{mse::Crypto, ID};
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// Reserved-bit feature mask from the handshake, big-endian over the eight
// reserved bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reserved(u64);

impl Reserved {

    // Fast Extension, bit 0x04 of the final byte.
    pub const FAST: Reserved = Reserved(1 << 2);

    // Advertised DHT support; informational only.
    pub const DHT: Reserved = Reserved(1 << 0);

    // Azureus Extended Messaging; informational only.
    pub const AZUREUS_EM: Reserved = Reserved(1 << 63);

    pub const NONE: Reserved = Reserved(0);

    pub fn contains(&self, feature: Reserved) -> bool {
        self.0 & feature.0 == feature.0
    }

    pub fn from_bytes(raw: [u8; 8]) -> Self {
        Reserved(u64::from_be_bytes(raw))
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl std::ops::BitAnd for Reserved {
    type Output = Reserved;
    fn bitand(self, rhs: Reserved) -> Reserved {
        Reserved(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for Reserved {
    type Output = Reserved;
    fn bitor(self, rhs: Reserved) -> Reserved {
        Reserved(self.0 | rhs.0)
    }
}

pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   Reserved,
    pub info_hash:  ID,
    pub peer_id:    ID,
}

impl Handshake {
    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        Self {
            protocol: PROTOCOL,
            reserved: Reserved::FAST,
            info_hash,
            peer_id,
        }
    }
}

// 68-byte BT handshake frames, optionally under a negotiated stream cipher.
pub struct HandshakeCodec {
    pub crypto: Crypto,
}

impl HandshakeCodec {

    pub fn plaintext() -> Self {
        Self { crypto: Crypto::plaintext() }
    }

    pub fn with_crypto(crypto: Crypto) -> Self {
        Self { crypto }
    }
}

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved.to_bytes());
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        debug_assert_eq!(dst.len() - start, 68, "encoded handshake length is not 68 bytes");
        self.crypto.encrypt_in_place(&mut dst[start..]);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        self.crypto.decrypt_buffered(src);
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != 19 {
            return Err(PeerError::IncorrectProtocol);
        }
        if src.remaining() < 68 {
            // Handshake not fully received.
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        self.crypto.consumed(68);
        Ok(Some(Handshake {
            protocol,
            reserved: Reserved::from_bytes(reserved),
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mse::{Cipher, CipherPair, Crypto};

    #[test]
    fn test_handshake_round_trip() {
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([0xab; 20], [0xcd; 20]);
        HandshakeCodec::plaintext().encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec::plaintext().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.protocol, PROTOCOL);
        assert!(decoded.reserved.contains(Reserved::FAST));
        assert_eq!(decoded.info_hash, [0xab; 20]);
        assert_eq!(decoded.peer_id, [0xcd; 20]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_decoding_with_incomplete_data() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        let mut decoder = HandshakeCodec::plaintext();
        assert!(decoder.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_handshake_decoding_with_invalid_protocol() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(b"Invalid protocol stri");
        src.extend_from_slice(&[0; 48]);
        let mut decoder = HandshakeCodec::plaintext();
        assert!(decoder.decode(&mut src).is_err());
    }

    #[test]
    fn test_reserved_bits() {
        let reserved = Reserved::from_bytes([0, 0, 0, 0, 0, 0, 0, 0x05]);
        assert!(reserved.contains(Reserved::FAST));
        assert!(reserved.contains(Reserved::DHT));
        assert!(!reserved.contains(Reserved::AZUREUS_EM));

        let ours = Reserved::FAST;
        assert!((reserved & ours).contains(Reserved::FAST));
        assert_eq!(Reserved::FAST.to_bytes(), [0, 0, 0, 0, 0, 0, 0, 0x04]);
    }

    #[test]
    fn test_handshake_under_cipher() {
        let key = b"handshake key";
        let enc = Crypto::new(
            CipherPair {
                encrypt: Cipher::Rc4(crate::mse::Arc4::with_skip(key, 1024)),
                decrypt: Cipher::Plain,
            },
            0,
        );
        let dec = Crypto::new(
            CipherPair {
                encrypt: Cipher::Plain,
                decrypt: Cipher::Rc4(crate::mse::Arc4::with_skip(key, 1024)),
            },
            0,
        );

        let mut buf = BytesMut::new();
        HandshakeCodec::with_crypto(enc)
            .encode(Handshake::new([1; 20], [2; 20]), &mut buf)
            .unwrap();
        // Ciphertext on the wire.
        assert_ne!(buf[0], 19);

        let decoded = HandshakeCodec::with_crypto(dec).decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [1; 20]);
    }
}
