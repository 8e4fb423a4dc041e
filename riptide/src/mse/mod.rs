use bytes::{Buf, BytesMut};
use num_bigint::BigUint;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::ID;

mod arc4;
pub use arc4::Arc4;

// Message Stream Encryption v1.0. The handshake runs over the raw stream
// before any BitTorrent framing; it either resolves to a known torrent and a
// negotiated cipher, or the connection dies. See spec at
// <https://wiki.vuze.com/w/Message_Stream_Encryption>.

// 768-bit prime used for the Diffie-Hellman exchange, generator 2.
const DH_P_HEX: &[u8] =
    b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
      020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
      4FE1356D6D51C245E485B576625E7EC6F44C42E9A63A36210000000000090563";
const DH_G: u32 = 2;

// Verification constant: eight zero bytes.
const VC: [u8; 8] = [0u8; 8];

pub const CRYPTO_PLAIN: u32 = 0x01;
pub const CRYPTO_RC4: u32 = 0x02;
const CRYPTO_PROVIDE: u32 = CRYPTO_PLAIN | CRYPTO_RC4;

const PUBKEY_LEN: usize = 96;
const PAD_MAX: usize = 512;
// How far into the stream the req1 hash (and the returning VC) may start:
// a full pubkey exchange plus maximum padding.
const SYNC_SCAN_LIMIT: usize = 628;
// ARC4 output discarded after keying, per the MSE spec.
const RC4_SKIP: usize = 1024;
// VC + crypto_provide + padC length.
const CRYPT_CHUNK1_LEN: usize = 14;

#[derive(Debug, thiserror::Error)]
pub enum MseError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the stream mid-handshake")]
    Eof,

    #[error("mse protocol error: {0}")]
    Protocol(&'static str),

    #[error("no mutually supported crypto method")]
    NoMethod,

    #[error("handshake does not match any managed torrent")]
    UnknownTorrent,

}

pub type Result<T> = std::result::Result<T, MseError>;

// One direction of the negotiated stream transform.
#[derive(Debug, Clone)]
pub enum Cipher {
    Plain,
    Rc4(Arc4),
}

impl Cipher {
    #[inline]
    pub fn apply(&mut self, buf: &mut [u8]) {
        if let Cipher::Rc4(rc4) = self {
            rc4.apply(buf);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CipherPair {

    pub encrypt: Cipher,

    pub decrypt: Cipher,

}

impl CipherPair {
    pub fn plaintext() -> Self {
        Self { encrypt: Cipher::Plain, decrypt: Cipher::Plain }
    }
}

// Stream-layer crypto state carried by the peer codecs. Tracks how much of
// the front of the read buffer is already plaintext so bytes are only ever
// run through the keystream once.
#[derive(Debug)]
pub struct Crypto {

    pair: CipherPair,

    plain: usize,

}

impl Crypto {

    pub fn plaintext() -> Self {
        Self::new(CipherPair::plaintext(), 0)
    }

    pub fn new(pair: CipherPair, plain: usize) -> Self {
        Self { pair, plain }
    }

    // Decrypts any not-yet-decrypted tail of the read buffer in place.
    pub fn decrypt_buffered(&mut self, src: &mut BytesMut) {
        let plain = self.plain.min(src.len());
        self.pair.decrypt.apply(&mut src[plain..]);
        self.plain = src.len();
    }

    // The decoder consumed n plaintext bytes from the buffer front.
    pub fn consumed(&mut self, n: usize) {
        self.plain = self.plain.saturating_sub(n);
    }

    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) {
        self.pair.encrypt.apply(buf);
    }
}

// Outcome of an accepted MSE handshake: the torrent it resolved to, the
// stream crypto to install, and buffered bytes (decrypted initial payload
// followed by any raw remainder) to splice back into the read stream.
#[derive(Debug)]
pub struct MseOutcome {

    pub info_hash: ID,

    pub crypto: Crypto,

    pub read_buf: BytesMut,

}

pub fn sha1_cat(parts: &[&[u8]]) -> ID {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

// HASH("req2" | info_hash), precomputed per managed torrent by the client so
// that SKEY resolution is a XOR plus a table scan.
pub fn req2_hash(info_hash: &ID) -> ID {
    sha1_cat(&[b"req2", info_hash])
}

fn xor20(a: &ID, b: &ID) -> ID {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

struct DhKeys {
    private: BigUint,
    public: [u8; PUBKEY_LEN],
}

impl DhKeys {

    fn generate() -> Self {
        // Private key in [2^159, 2^160): 20 random bytes with the top bit set.
        let mut raw = [0u8; 20];
        rand::thread_rng().fill(&mut raw);
        raw[0] |= 0x80;
        let private = BigUint::from_bytes_be(&raw);

        let p = dh_prime();
        let public = to_fixed_be(&BigUint::from(DH_G).modpow(&private, &p));
        Self { private, public }
    }

    // The 96-byte big-endian shared secret S.
    fn shared_secret(&self, peer_public: &[u8]) -> [u8; PUBKEY_LEN] {
        let peer = BigUint::from_bytes_be(peer_public);
        to_fixed_be(&peer.modpow(&self.private, &dh_prime()))
    }
}

fn dh_prime() -> BigUint {
    // The literal is compile-time constant hex; parsing cannot fail.
    BigUint::parse_bytes(DH_P_HEX, 16).unwrap()
}

fn to_fixed_be(value: &BigUint) -> [u8; PUBKEY_LEN] {
    let raw = value.to_bytes_be();
    debug_assert!(raw.len() <= PUBKEY_LEN);
    let mut out = [0u8; PUBKEY_LEN];
    out[PUBKEY_LEN - raw.len()..].copy_from_slice(&raw);
    out
}

// Random padding of 0 to 512 bytes.
fn pad() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=PAD_MAX);
    let mut out = vec![0u8; len];
    rng.fill(&mut out[..]);
    out
}

// Reads until the buffer holds at least n bytes.
async fn fill_to<S>(stream: &mut S, buf: &mut BytesMut, n: usize) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < n {
        if stream.read_buf(buf).await? == 0 {
            return Err(MseError::Eof);
        }
    }
    Ok(())
}

// Scans the incoming stream for a needle, discarding everything up to and
// including it. The needle must start within `limit` bytes.
async fn scan_for<S>(stream: &mut S, buf: &mut BytesMut, needle: &[u8], limit: usize) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find(buf, needle) {
            if pos > limit {
                return Err(MseError::Protocol("sync pattern past scan limit"));
            }
            buf.advance(pos + needle.len());
            return Ok(());
        }
        if buf.len() > limit + needle.len() {
            return Err(MseError::Protocol("sync pattern not found"));
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(MseError::Eof);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// Responder side of the MSE handshake. Entered once the first inbound byte
// turned out not to be a BT protocol prefix; `buf` carries whatever has been
// read so far. `skeys` maps HASH("req2"|info_hash) to info_hash for every
// locally managed torrent.
pub async fn accept<S>(
    stream: &mut S,
    mut buf: BytesMut,
    skeys: &[(ID, ID)],
) -> Result<MseOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Peer public key, then ours plus padding.
    fill_to(stream, &mut buf, PUBKEY_LEN).await?;
    let keys = DhKeys::generate();
    let secret = keys.shared_secret(&buf[..PUBKEY_LEN]);
    buf.advance(PUBKEY_LEN);

    let mut reply = Vec::with_capacity(PUBKEY_LEN + PAD_MAX);
    reply.extend_from_slice(&keys.public);
    reply.extend_from_slice(&pad());
    stream.write_all(&reply).await?;

    // Resynchronize on HASH("req1" | S).
    let req1 = sha1_cat(&[b"req1", &secret]);
    scan_for(stream, &mut buf, &req1, SYNC_SCAN_LIMIT).await?;

    // 20 bytes: HASH("req2" | SKEY) xor HASH("req3" | S). Resolving SKEY is
    // an exhaustive walk over managed torrents; there is no better option.
    fill_to(stream, &mut buf, 20).await?;
    let mut hash2 = [0u8; 20];
    hash2.copy_from_slice(&buf[..20]);
    buf.advance(20);

    let req3 = sha1_cat(&[b"req3", &secret]);
    let info_hash = skeys
        .iter()
        .find(|(req2, _)| xor20(req2, &req3) == hash2)
        .map(|(_, info_hash)| *info_hash)
        .ok_or(MseError::UnknownTorrent)?;

    let mut decrypt = Arc4::with_skip(&sha1_cat(&[b"keyA", &secret, &info_hash]), RC4_SKIP);
    let mut encrypt = Arc4::with_skip(&sha1_cat(&[b"keyB", &secret, &info_hash]), RC4_SKIP);

    // VC, crypto_provide, padC length.
    fill_to(stream, &mut buf, CRYPT_CHUNK1_LEN).await?;
    let mut chunk = [0u8; CRYPT_CHUNK1_LEN];
    chunk.copy_from_slice(&buf[..CRYPT_CHUNK1_LEN]);
    buf.advance(CRYPT_CHUNK1_LEN);
    decrypt.apply(&mut chunk);

    if chunk[..8] != VC {
        return Err(MseError::Protocol("bad VC from peer"));
    }
    let crypto_provide = u32::from_be_bytes(chunk[8..12].try_into().unwrap());
    let pad_c_len = u16::from_be_bytes(chunk[12..14].try_into().unwrap()) as usize;
    if pad_c_len > PAD_MAX {
        return Err(MseError::Protocol("padC too long"));
    }

    // padC and the initial-payload length.
    fill_to(stream, &mut buf, pad_c_len + 2).await?;
    let mut tail = vec![0u8; pad_c_len + 2];
    tail.copy_from_slice(&buf[..pad_c_len + 2]);
    buf.advance(pad_c_len + 2);
    decrypt.apply(&mut tail);
    let ia_len = u16::from_be_bytes(tail[pad_c_len..].try_into().unwrap()) as usize;

    // The initial payload itself.
    fill_to(stream, &mut buf, ia_len).await?;
    let mut payload = BytesMut::with_capacity(ia_len + buf.len());
    payload.extend_from_slice(&buf[..ia_len]);
    buf.advance(ia_len);
    decrypt.apply(&mut payload[..]);

    // Pick a method, preferring plaintext, and answer with our selection.
    let selected = if crypto_provide & CRYPTO_PLAIN != 0 {
        CRYPTO_PLAIN
    } else if crypto_provide & CRYPTO_RC4 != 0 {
        CRYPTO_RC4
    } else {
        return Err(MseError::NoMethod);
    };

    let pad_d = pad();
    let mut reply = Vec::with_capacity(CRYPT_CHUNK1_LEN + pad_d.len());
    reply.extend_from_slice(&VC);
    reply.extend_from_slice(&selected.to_be_bytes());
    reply.extend_from_slice(&(pad_d.len() as u16).to_be_bytes());
    reply.extend_from_slice(&pad_d);
    encrypt.apply(&mut reply);
    stream.write_all(&reply).await?;

    // The pair is built after the reply so the RC4 keystreams stay
    // continuous across it.
    let pair = if selected == CRYPTO_PLAIN {
        CipherPair::plaintext()
    } else {
        CipherPair {
            encrypt: Cipher::Rc4(encrypt),
            decrypt: Cipher::Rc4(decrypt),
        }
    };

    tracing::debug!(
        "mse accept complete, method {}",
        if selected == CRYPTO_PLAIN { "plain" } else { "rc4" }
    );

    // Splice the decrypted initial payload back in front of whatever raw
    // bytes are already buffered.
    let plain = payload.len();
    payload.extend_from_slice(&buf);
    Ok(MseOutcome {
        info_hash,
        crypto: Crypto::new(pair, plain),
        read_buf: payload,
    })
}

// Initiator side. `ia` is the initial payload to tunnel through the
// handshake (may be empty). Returns the stream crypto and any raw bytes
// read past the handshake.
pub async fn initiate<S>(
    stream: &mut S,
    info_hash: &ID,
    ia: &[u8],
) -> Result<(Crypto, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let keys = DhKeys::generate();
    let mut hello = Vec::with_capacity(PUBKEY_LEN + PAD_MAX);
    hello.extend_from_slice(&keys.public);
    hello.extend_from_slice(&pad());
    stream.write_all(&hello).await?;

    let mut buf = BytesMut::with_capacity(1024);
    fill_to(stream, &mut buf, PUBKEY_LEN).await?;
    let secret = keys.shared_secret(&buf[..PUBKEY_LEN]);
    buf.advance(PUBKEY_LEN);

    // Initiator encrypts with keyA and decrypts with keyB.
    let mut encrypt = Arc4::with_skip(&sha1_cat(&[b"keyA", &secret, info_hash]), RC4_SKIP);
    let mut decrypt = Arc4::with_skip(&sha1_cat(&[b"keyB", &secret, info_hash]), RC4_SKIP);

    let hash2 = xor20(&req2_hash(info_hash), &sha1_cat(&[b"req3", &secret]));

    let mut msg = Vec::with_capacity(40 + CRYPT_CHUNK1_LEN + ia.len());
    msg.extend_from_slice(&sha1_cat(&[b"req1", &secret]));
    msg.extend_from_slice(&hash2);
    let crypt_start = msg.len();
    msg.extend_from_slice(&VC);
    msg.extend_from_slice(&CRYPTO_PROVIDE.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes()); // no padC
    msg.extend_from_slice(&(ia.len() as u16).to_be_bytes());
    msg.extend_from_slice(ia);
    encrypt.apply(&mut msg[crypt_start..]);
    stream.write_all(&msg).await?;

    // The peer's VC comes back encrypted after its padding; the ciphertext
    // of eight zero bytes is the head of the keystream, which makes a
    // scannable sync pattern.
    let mut vc_ct = VC;
    decrypt.clone().apply(&mut vc_ct);
    scan_for(stream, &mut buf, &vc_ct, SYNC_SCAN_LIMIT).await?;
    // Advance the live keystream over the VC we just consumed.
    let mut scratch = [0u8; 8];
    decrypt.apply(&mut scratch);

    fill_to(stream, &mut buf, 6).await?;
    let mut tail = [0u8; 6];
    tail.copy_from_slice(&buf[..6]);
    buf.advance(6);
    decrypt.apply(&mut tail);
    let crypto_select = u32::from_be_bytes(tail[..4].try_into().unwrap());
    let pad_d_len = u16::from_be_bytes(tail[4..].try_into().unwrap()) as usize;
    if pad_d_len > PAD_MAX {
        return Err(MseError::Protocol("padD too long"));
    }

    fill_to(stream, &mut buf, pad_d_len).await?;
    let mut pad_d = vec![0u8; pad_d_len];
    pad_d.copy_from_slice(&buf[..pad_d_len]);
    buf.advance(pad_d_len);
    decrypt.apply(&mut pad_d);

    let pair = match crypto_select {
        CRYPTO_PLAIN => CipherPair::plaintext(),
        CRYPTO_RC4 => CipherPair {
            encrypt: Cipher::Rc4(encrypt),
            decrypt: Cipher::Rc4(decrypt),
        },
        _ => return Err(MseError::Protocol("peer selected unknown method")),
    };

    Ok((Crypto::new(pair, 0), buf))
}
