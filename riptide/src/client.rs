use std::{collections::HashMap, net::SocketAddr};
use bytes::BytesMut;
use futures::StreamExt;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::Instrument;
use crate::{
    config::Config,
    metainfo::MetaInfo,
    mse::{self, Crypto},
    p2p::{Handshake, HandshakeCodec, IncomingConn, PeerError},
    torrent::{self, CommandToTorrent, ResumeState, TorrentHandle, TorrentParams},
    ID,
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {

    #[error("client has been unexpectedly dropped")]
    ClientDropped(#[from] mpsc::error::SendError<ClientCommand>),

    #[error("torrent error: {0}")]
    Torrent(#[from] torrent::TorrentError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

}

pub type Result<T> = std::result::Result<T, ClientError>;
pub type ClientRx = mpsc::UnboundedReceiver<ClientCommand>;
pub type ClientTx = mpsc::UnboundedSender<ClientCommand>;

pub enum ClientCommand {

    NewTorrent {
        metainfo: MetaInfo,
        resume: Option<ResumeState>,
    },

    RemoveTorrent(ID),

    Shutdown,

}

// Owns the listening socket and the torrent table. Accepted connections are
// identified by their first byte (BT handshake or MSE) and routed to the
// torrent coordinator owning the info-hash.
pub struct Client {

    client_rx: ClientRx,

    // Loops back identified connections from the per-socket tasks.
    incoming_tx: mpsc::UnboundedSender<IncomingConn>,
    incoming_rx: mpsc::UnboundedReceiver<IncomingConn>,

    torrents: HashMap<ID, TorrentHandle>,

    // (HASH("req2" | info_hash), info_hash) for every managed torrent,
    // handed to the MSE acceptor for SKEY resolution.
    skeys: Vec<(ID, ID)>,

    listener: Option<TcpListener>,

    config: Config,

}

impl Client {

    pub fn new(config: Config) -> (Self, ClientTx) {

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        (
            Client {
                client_rx,
                incoming_tx,
                incoming_rx,
                torrents: HashMap::new(),
                skeys: Vec::new(),
                listener: None,
                config,
            },
            client_tx,
        )
    }

    // Bind the listening socket ahead of run(); returns the bound address.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.listen_address).await?;
        let address = listener.local_addr()?;
        tracing::info!("listening on {}", address);
        self.listener = Some(listener);
        Ok(address)
    }

    #[tracing::instrument(skip_all, name = "client")]
    pub async fn run(&mut self) -> Result<()> {

        if self.listener.is_none() {
            self.bind().await?;
        }
        // Unwrap safe, bound above.
        let listener = self.listener.take().unwrap();

        loop { tokio::select! {

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, address)) => self.handle_accept(stream, address),
                    Err(e) => tracing::warn!("inbound connection error: {}", e),
                }
            }

            Some(conn) = self.incoming_rx.recv() => self.route_incoming(conn),

            Some(cmd) = self.client_rx.recv() => {
                match cmd {

                    ClientCommand::NewTorrent { metainfo, resume } => {
                        if let Err(e) = self.new_torrent(metainfo, resume) {
                            tracing::error!("failed to start torrent: {}", e);
                        }
                    }

                    ClientCommand::RemoveTorrent(id) => self.remove_torrent(id),

                    ClientCommand::Shutdown => return Ok(self.shutdown().await),

                }
            }
        }}
    }

    // Kick off identification on its own task; the result loops back as a
    // command.
    fn handle_accept(&self, stream: TcpStream, address: SocketAddr) {
        tracing::debug!("accepted connection from {}", address);
        let skeys = self.skeys.clone();
        let incoming_tx = self.incoming_tx.clone();

        tokio::spawn(async move {
            match identify(stream, address, skeys).await {
                Ok(conn) => {
                    incoming_tx.send(conn).ok();
                }
                Err(e) => {
                    // The socket drops and closes here; nothing to clean up.
                    tracing::debug!("inbound identification failed: {}", e);
                }
            }
        }.instrument(tracing::info_span!("incoming", addr = %address)));
    }

    fn new_torrent(&mut self, metainfo: MetaInfo, resume: Option<ResumeState>) -> Result<()> {
        let info_hash = metainfo.info_hash();
        if self.torrents.contains_key(&info_hash) {
            tracing::warn!("already managing torrent {}", hex::encode(info_hash));
            return Ok(());
        }

        let handle = TorrentHandle::start_torrent(TorrentParams {
            metainfo,
            config: self.config.clone(),
            resume,
        })?;
        self.skeys.push((mse::req2_hash(&info_hash), info_hash));
        self.torrents.insert(info_hash, handle);
        tracing::info!("started torrent {}", hex::encode(info_hash));
        Ok(())
    }

    fn remove_torrent(&mut self, id: ID) {
        if let Some(torrent) = self.torrents.remove(&id) {
            torrent.torrent_tx.send(CommandToTorrent::Shutdown).ok();
            self.skeys.retain(|(_, info_hash)| *info_hash != id);
        } else {
            tracing::warn!("attempted to remove non-existent torrent: {}", hex::encode(id));
        }
    }

    // Hand an identified connection to the owning coordinator. An unmanaged
    // info-hash closes the socket by dropping it.
    fn route_incoming(&mut self, conn: IncomingConn) {
        match self.torrents.get(&conn.handshake.info_hash) {
            Some(torrent) => {
                torrent.torrent_tx.send(CommandToTorrent::IncomingPeer { conn }).ok();
            }
            None => {
                tracing::info!(
                    "no torrent with info-hash {} for peer {}",
                    hex::encode(conn.handshake.info_hash),
                    conn.address,
                );
            }
        }
    }

    async fn shutdown(&mut self) {

        for torrent in self.torrents.values_mut() {
            // Some torrents may have already been shut down, don't error.
            torrent.torrent_tx.send(CommandToTorrent::Shutdown).ok();
        }

        for (id, torrent) in self.torrents.drain() {
            match torrent.handle.await {
                Ok(Err(e)) => tracing::error!("torrent {} error: {}", hex::encode(id), e),
                Err(e) => tracing::error!("torrent {} panicked: {}", hex::encode(id), e),
                _ => {}
            }
        }
    }
}

// First-byte dispatch for accepted sockets: a BT protocol prefix goes
// straight to the handshake, anything else is treated as an MSE candidate.
// Either way the BT handshake is read here so the connection can be routed
// by info-hash.
async fn identify(
    mut stream: TcpStream,
    address: SocketAddr,
    skeys: Vec<(ID, ID)>,
) -> std::result::Result<IncomingConn, PeerError> {

    let mut buf = BytesMut::with_capacity(1024);
    while buf.is_empty() {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(PeerError::NoHandshake);
        }
    }

    // An MSE public key may open with 0x13 by chance, so the whole protocol
    // prefix decides the dispatch.
    let mut is_bt = buf[0] == 0x13;
    while is_bt && buf.len() < 20 {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(PeerError::NoHandshake);
        }
    }
    is_bt = is_bt && buf[1..20] == crate::p2p::PROTOCOL;

    let (crypto, read_buf) = if is_bt {
        (Crypto::plaintext(), buf)
    } else {
        // MSE candidate. If the handshake resolves but the payload still
        // doesn't open with the BT prefix, the codec below rejects it.
        let outcome = mse::accept(&mut stream, buf, &skeys).await?;
        (outcome.crypto, outcome.read_buf)
    };

    let mut parts = FramedParts::new::<Handshake>(stream, HandshakeCodec::with_crypto(crypto));
    parts.read_buf = read_buf;
    let mut socket = Framed::from_parts(parts);

    let handshake = time::timeout(time::Duration::from_secs(30), socket.next())
        .await
        .map_err(|_| PeerError::Timeout)?
        .ok_or(PeerError::NoHandshake)??;

    let parts = socket.into_parts();
    Ok(IncomingConn {
        stream: parts.io,
        address,
        crypto: parts.codec.crypto,
        read_buf: parts.read_buf,
        handshake,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use crate::metainfo::Info;

    fn test_metainfo(dir: &std::path::Path) -> (MetaInfo, Config) {
        let info = Info {
            files: None,
            length: Some(2048),
            md5sum: None,
            name: "client-test.bin".to_string(),
            piece_length: 1024,
            pieces: vec![0x5a; 40],
            private: None,
        };
        let info_hash = info.info_hash().unwrap();
        let metainfo = MetaInfo {
            // A dead port so announce attempts fail fast.
            announce: url::Url::parse("http://127.0.0.1:9/announce").unwrap(),
            info,
            info_hash,
            encoding: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        };

        let config = Config {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            output_dir: dir.to_path_buf(),
            block_length: 512,
            ..Config::default()
        };
        (metainfo, config)
    }

    async fn started_client(dir: &std::path::Path) -> (SocketAddr, ClientTx, ID) {
        let (metainfo, config) = test_metainfo(dir);
        let info_hash = metainfo.info_hash();

        let (mut client, client_tx) = Client::new(config);
        let address = client.bind().await.unwrap();
        client_tx
            .send(ClientCommand::NewTorrent { metainfo, resume: None })
            .unwrap();
        tokio::spawn(async move { client.run().await });

        // Let the torrent registration drain.
        time::sleep(time::Duration::from_millis(50)).await;
        (address, client_tx, info_hash)
    }

    #[tokio::test]
    async fn test_inbound_plain_connection_is_routed() {
        let dir = tempfile::TempDir::new().unwrap();
        let (address, _client_tx, info_hash) = started_client(dir.path()).await;

        let stream = TcpStream::connect(address).await.unwrap();
        let mut socket = Framed::new(stream, HandshakeCodec::plaintext());
        socket.send(Handshake::new(info_hash, [0x77; 20])).await.unwrap();

        // The session adopted by the torrent answers with our handshake.
        let reply = time::timeout(time::Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for handshake")
            .unwrap()
            .unwrap();
        assert_eq!(reply.info_hash, info_hash);
        assert_eq!(&reply.peer_id[..8], b"-RT0001-");
    }

    #[tokio::test]
    async fn test_inbound_unknown_info_hash_is_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let (address, _client_tx, _info_hash) = started_client(dir.path()).await;

        let stream = TcpStream::connect(address).await.unwrap();
        let mut socket = Framed::new(stream, HandshakeCodec::plaintext());
        socket.send(Handshake::new([0xfe; 20], [0x77; 20])).await.unwrap();

        // No managed torrent matches; the client closes the socket.
        let got = time::timeout(time::Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for close");
        assert!(got.is_none() || got.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_inbound_mse_connection_is_routed() {
        let dir = tempfile::TempDir::new().unwrap();
        let (address, _client_tx, info_hash) = started_client(dir.path()).await;

        let mut stream = TcpStream::connect(address).await.unwrap();
        let (crypto, leftover) = mse::initiate(&mut stream, &info_hash, &[])
            .await
            .expect("mse handshake failed");

        let mut parts = FramedParts::new::<Handshake>(stream, HandshakeCodec::with_crypto(crypto));
        parts.read_buf = leftover;
        let mut socket = Framed::from_parts(parts);
        socket.send(Handshake::new(info_hash, [0x78; 20])).await.unwrap();

        let reply = time::timeout(time::Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for handshake")
            .unwrap()
            .unwrap();
        assert_eq!(reply.info_hash, info_hash);
    }
}
