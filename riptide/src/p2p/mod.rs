use std::{net::SocketAddr, sync::Arc};
use bytes::BytesMut;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{
    bandwidth::BandwidthError,
    block::Block,
    mse::{Crypto, MseError},
    torrent::TorrentContext,
    ID,
};

mod session;
mod message;
mod handshake;
pub mod state;

pub use handshake::{Handshake, HandshakeCodec, Reserved, PROTOCOL};
pub use message::{Message, MessageCodec, MSG_SIZE_LIMIT};
pub use session::PeerSession;
use state::SessionState;

pub type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("peer uses our own peer id")]
    SelfConnect,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("message of {0} bytes exceeds frame cap")]
    MessageTooLarge(usize),

    #[error("bitfield sent after first data message")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("peer overran its request queue quota")]
    RequestQueueLimit,

    #[error("connection timeout")]
    Timeout,

    #[error("disk read failed")]
    DiskFailure,

    #[error("mse error: {0}")]
    Mse(#[from] MseError),

    #[error("bandwidth error: {0}")]
    Bandwidth(#[from] BandwidthError),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands that can be sent to a peer session.
pub enum PeerCommand {

    // Tell the peer we completed a piece.
    PieceWritten(usize),

    // Batch of blocks read from disk for serving.
    BlocksRead {
        blocks: Vec<Block>,
        failed: bool,
    },

    // Choke algorithm verdicts from the coordinator.
    Choke,
    Unchoke,

    Shutdown,

}

// An inbound connection whose torrent has been identified by the client,
// ready to be adopted by a coordinator.
#[derive(Debug)]
pub struct IncomingConn {

    pub stream: TcpStream,

    pub address: SocketAddr,

    // Stream crypto negotiated by MSE, or plaintext.
    pub crypto: Crypto,

    // Bytes already read past the handshake.
    pub read_buf: BytesMut,

    pub handshake: Handshake,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Sends commands to the session.
    pub peer_tx: PeerTx,

    // Handle to the peer session task.
    pub session_handle: Option<JoinHandle<()>>,

    // Last state reported by the session.
    pub state: SessionState,

    // Peer id from the handshake, once known.
    pub id: Option<ID>,

}

impl PeerHandle {

    // Spawn a session for an outgoing connection.
    pub fn start_outbound(address: SocketAddr, ctx: Arc<TorrentContext>) -> Self {
        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            let result = session.start_outbound().await;
            if let Err(e) = &result {
                tracing::warn!("session error: {}", e);
            }
            session.disconnect(result.is_err()).await;
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            session_handle: Some(session_handle),
            state: SessionState::default(),
            id: None,
        }
    }

    // Spawn a session for a connection accepted and identified by the client.
    pub fn start_inbound(conn: IncomingConn, ctx: Arc<TorrentContext>) -> Self {
        let address = conn.address;
        let peer_id = conn.handshake.peer_id;
        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            let result = session.start_inbound(conn).await;
            if let Err(e) = &result {
                tracing::warn!("session error: {}", e);
            }
            session.disconnect(result.is_err()).await;
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            session_handle: Some(session_handle),
            state: SessionState::default(),
            id: Some(peer_id),
        }
    }
}
