use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};
use rand::{seq::SliceRandom, Rng};
use serde_derive::{Deserialize, Serialize};
use tokio::{sync::{mpsc, RwLock}, task::JoinHandle, time::{self, Instant}};
use crate::{
    bandwidth::{self, RateTx},
    block::BlockInfo,
    config::Config,
    fs::{self, CommandToDisk, DiskTx},
    masks::{BitMask, BlockMask},
    metainfo::MetaInfo,
    p2p::{state::SessionState, IncomingConn, PeerCommand, PeerHandle},
    picker::Picker,
    store::StoreInfo,
    tracker::{self, Announce, AnnounceParams, Event, TierCursor},
    ID,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("disk error: {0}")]
    Disk(#[from] crate::fs::DiskError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Commands sent to a torrent from peers, the disk task and the client.
pub enum CommandToTorrent {

    // Sent by a session once the peer handshake checks out.
    PeerConnected { address: SocketAddr, id: ID },

    // Periodic session state report; feeds the choke pass.
    PeerState { address: SocketAddr, state: SessionState },

    // Session ended; `error` marks peers to forget entirely.
    PeerDisconnected {
        address: SocketAddr,
        bytes_in: u64,
        bytes_out: u64,
        error: bool,
    },

    // Disk finished writing a block.
    BlockWritten { block: BlockInfo, failed: bool },

    // Disk finished the read-back hash of a freshly completed piece.
    PieceVerified { idx: usize, valid: bool, failed: bool },

    // Startup validation scan finished.
    ValidationDone { piecemask: BitMask, failed: bool },

    // A connection accepted and identified by the client.
    IncomingPeer { conn: IncomingConn },

    Shutdown,

}

impl CommandToTorrent {
    pub fn name(&self) -> &'static str {
        match self {
            CommandToTorrent::PeerConnected { .. } => "PeerConnected",
            CommandToTorrent::PeerState { .. } => "PeerState",
            CommandToTorrent::PeerDisconnected { .. } => "PeerDisconnected",
            CommandToTorrent::BlockWritten { .. } => "BlockWritten",
            CommandToTorrent::PieceVerified { .. } => "PieceVerified",
            CommandToTorrent::ValidationDone { .. } => "ValidationDone",
            CommandToTorrent::IncomingPeer { .. } => "IncomingPeer",
            CommandToTorrent::Shutdown => "Shutdown",
        }
    }
}

// Read-mostly state shared with the peer sessions.
#[derive(Debug)]
pub struct TorrentContext {

    // The info hash identifying this torrent.
    pub id: ID,

    // Piece/block bookkeeping shared with sessions.
    pub picker: RwLock<Picker>,

    pub torrent_tx: TorrentTx,

    pub disk_tx: DiskTx,

    pub rate_tx: RateTx,

    pub info: StoreInfo,

    pub config: Config,

}

pub struct TorrentParams {

    pub metainfo: MetaInfo,

    pub config: Config,

    // Snapshot from a previous run; skips validation.
    pub resume: Option<ResumeState>,

}

// Snapshot of coordinator state that outlives the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {

    #[serde(with = "serde_bytes")]
    pub piecemask: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub blockmask: Vec<u8>,

    pub piece_count: usize,
    pub piece_length: usize,
    pub piece_length_last: usize,
    pub block_length: usize,

    pub content_bytes_in: u64,
    pub content_bytes_out: u64,

    pub trackerid: Option<String>,
    pub tier: usize,
    pub tier_index: usize,

    #[serde(with = "serde_bytes")]
    pub announce_key: Vec<u8>,

}

impl ResumeState {

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(raw)?)
    }
}

pub struct TorrentHandle {

    pub torrent_tx: TorrentTx,

    pub info_hash: ID,

    pub handle: JoinHandle<Result<()>>,

}

impl TorrentHandle {
    pub fn start_torrent(params: TorrentParams) -> Result<TorrentHandle> {
        let info_hash = params.metainfo.info_hash();
        let mut torrent = Torrent::new(params)?;
        let torrent_tx = torrent.torrent_tx.clone();
        let handle = tokio::spawn(async move { torrent.run().await });
        Ok(TorrentHandle { torrent_tx, info_hash, handle })
    }
}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Peers we know about but have no session with.
    peers_known: HashSet<SocketAddr>,

    // Announce targets grouped by tier, plus the walk state.
    trackers: Vec<Vec<Box<dyn Announce>>>,
    cursor: TierCursor,
    trackerid: Option<String>,
    announce_key: ID,
    next_announce: Instant,
    announced_started: bool,

    // Most recent unchoke selection. The optimistic slots sit at the tail
    // of `downloaders`.
    downloaders: Vec<SocketAddr>,
    senders: Vec<SocketAddr>,

    bytes_left: u64,
    content_bytes_in: u64,
    content_bytes_out: u64,

    download_complete: bool,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,

    // Cleared while waiting for startup validation.
    initialized: bool,

    // Set on an unrecoverable disk failure; data transfer stops.
    io_failed: bool,

    torrent_rx: TorrentRx,
    torrent_tx: TorrentTx,

    disk_handle: Option<JoinHandle<fs::Result<()>>>,
    rate_handle: Option<JoinHandle<()>>,

}

impl Torrent {

    pub fn new(params: TorrentParams) -> Result<Self> {

        let TorrentParams { metainfo, config, resume } = params;
        let info = StoreInfo::new(&metainfo, config.output_dir.clone(), config.block_length)?;
        let piece_hashes = metainfo.piece_hashes();
        let info_hash = metainfo.info_hash();

        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (disk_handle, disk_tx) = fs::spawn(info.clone(), piece_hashes, torrent_tx.clone())?;
        let (rate_handle, rate_tx) = bandwidth::spawn(config.byte_slice, config.cycle_length);

        let mut trackers = Vec::new();
        for tier in metainfo.trackers() {
            let mut clients: Vec<Box<dyn Announce>> = Vec::new();
            for url in tier {
                match tracker::from_url(url.clone()) {
                    Ok(client) => clients.push(client),
                    Err(e) => tracing::warn!("skipping tracker {}: {}", url, e),
                }
            }
            if !clients.is_empty() {
                trackers.push(clients);
            }
        }

        let mut picker = Picker::new(&info);
        let mut cursor = TierCursor::default();
        let mut trackerid = None;
        let mut content_bytes_in = 0;
        let mut content_bytes_out = 0;
        let mut announce_key = generate_announce_key();
        let mut validate = config.validate_on_startup;

        if let Some(resume) = resume {
            picker.set_piecemask(BitMask::from_bytes(&resume.piecemask, info.num_pieces));
            picker.restore_blockmask(BlockMask::from_bytes(
                &resume.blockmask,
                resume.piece_count,
                resume.piece_length,
                resume.piece_length_last,
                resume.block_length,
            ));
            cursor.tier = resume.tier;
            cursor.index = resume.tier_index;
            trackerid = resume.trackerid;
            content_bytes_in = resume.content_bytes_in;
            content_bytes_out = resume.content_bytes_out;
            if resume.announce_key.len() == 20 {
                announce_key.copy_from_slice(&resume.announce_key);
            }
            // The snapshot's masks are trusted as-is.
            validate = false;
        }

        let bytes_left = bytes_left_of(&info, &picker);
        let download_complete = picker.is_complete();

        Ok(Self {
            ctx: Arc::new(TorrentContext {
                id: info_hash,
                picker: RwLock::new(picker),
                torrent_tx: torrent_tx.clone(),
                disk_tx,
                rate_tx,
                info,
                config,
            }),
            peers: HashMap::new(),
            peers_known: HashSet::new(),
            trackers,
            cursor,
            trackerid,
            announce_key,
            next_announce: Instant::now(),
            announced_started: false,
            downloaders: Vec::new(),
            senders: Vec::new(),
            bytes_left,
            content_bytes_in,
            content_bytes_out,
            download_complete,
            finished_at: None,
            initialized: !validate,
            io_failed: false,
            torrent_rx,
            torrent_tx,
            disk_handle: Some(disk_handle),
            rate_handle: Some(rate_handle),
        })
    }

    pub fn context(&self) -> Arc<TorrentContext> {
        Arc::clone(&self.ctx)
    }

    #[tracing::instrument(skip_all, name = "torrent", fields(id = %hex::encode(&self.ctx.id[..4])))]
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("starting torrent, {} bytes left", self.bytes_left);

        if !self.initialized {
            tracing::info!("validating previously downloaded data");
            self.ctx.disk_tx.send(CommandToDisk::Validate)?;
        } else if !self.trackers.is_empty() {
            self.announce().await;
        }

        let mut maintenance = time::interval(self.ctx.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        maintenance.tick().await;
        let mut discovery = time::interval(self.ctx.config.peer_connections_start_delay);
        discovery.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        discovery.tick().await;

        loop { tokio::select! {

            Some(cmd) = self.torrent_rx.recv() => {
                match cmd {

                    CommandToTorrent::PeerConnected { address, id } => {
                        if let Some(peer) = self.peers.get_mut(&address) {
                            peer.id = Some(id);
                        }
                    }

                    CommandToTorrent::PeerState { address, state } => {
                        self.handle_peer_state(address, state).await;
                    }

                    CommandToTorrent::PeerDisconnected { address, bytes_in, bytes_out, error } => {
                        self.handle_peer_disconnected(address, bytes_in, bytes_out, error);
                    }

                    CommandToTorrent::BlockWritten { block, failed } => {
                        self.handle_block_written(block, failed).await?;
                    }

                    CommandToTorrent::PieceVerified { idx, valid, failed } => {
                        self.handle_piece_verified(idx, valid, failed).await?;
                    }

                    CommandToTorrent::ValidationDone { piecemask, failed } => {
                        self.handle_validation_done(piecemask, failed).await?;
                    }

                    CommandToTorrent::IncomingPeer { conn } => {
                        self.handle_incoming_peer(conn);
                    }

                    CommandToTorrent::Shutdown => {
                        self.shutdown().await?;
                        break;
                    }

                }
            }

            _ = time::sleep_until(self.next_announce), if self.initialized && !self.trackers.is_empty() => {
                self.announce().await;
            }

            _ = maintenance.tick() => self.maintenance().await,

            _ = discovery.tick() => self.connect_to_peers(),

        }}

        Ok(())
    }

    // One announce against the cursor's current target. Success promotes
    // the URL and rewinds the cursor, failure advances it.
    async fn announce(&mut self) {

        self.cursor.clamp(&self.trackers);
        let event = if self.io_failed {
            Some(Event::Stopped)
        } else if !self.announced_started {
            Some(Event::Started)
        } else {
            None
        };

        let num_want = self.ctx.config.peer_connection_count_target
            .saturating_sub(self.peers.len() + self.peers_known.len());
        let params = AnnounceParams {
            info_hash: self.ctx.id,
            client_id: self.ctx.config.client_id,
            port: self.ctx.config.listen_address.port(),
            uploaded: self.content_bytes_out,
            downloaded: self.content_bytes_in,
            left: self.bytes_left,
            event,
            num_want: if num_want > 0 { Some(num_want) } else { None },
            tracker_id: self.trackerid.clone(),
            key: self.announce_key,
        };

        let config = &self.ctx.config;
        let client = &mut self.trackers[self.cursor.tier][self.cursor.index];
        tracing::debug!("announcing to {}", client.url());

        match client.announce(&params).await {
            Ok(resp) => {
                self.cursor.on_success(&mut self.trackers);
                if let Some(id) = resp.tracker_id {
                    self.trackerid = Some(id);
                }
                if event == Some(Event::Started) {
                    self.announced_started = true;
                }

                let fresh = resp.peers.len();
                self.peers_known.extend(resp.peers);
                tracing::info!("tracker returned {} peers", fresh);

                let interval = resp
                    .interval
                    .unwrap_or(config.announce_default_interval)
                    .max(config.announce_min_interval);
                self.next_announce = Instant::now() + interval;

                if self.peers.is_empty() {
                    self.connect_to_peers();
                }
            }
            Err(e) => {
                tracing::warn!("announce failed: {}", e);
                if self.cursor.on_failure(&self.trackers) {
                    self.trackerid = None;
                }
                self.next_announce = Instant::now() + config.announce_retry_interval;
            }
        }
    }

    // Open outgoing connections towards the target count.
    fn connect_to_peers(&mut self) {
        if !self.initialized || self.io_failed || self.download_complete {
            return;
        }

        let want = self.ctx.config.peer_connection_count_target
            .saturating_sub(self.peers.len());
        if want == 0 {
            return;
        }

        let mut candidates: Vec<SocketAddr> = self
            .peers_known
            .iter()
            .filter(|addr| !self.peers.contains_key(addr))
            .copied()
            .collect();
        if candidates.is_empty() {
            return;
        }
        candidates.shuffle(&mut rand::thread_rng());

        let count = want.min(candidates.len());
        tracing::info!("connecting to {} peers", count);
        for address in candidates.into_iter().take(count) {
            let handle = PeerHandle::start_outbound(address, self.context());
            self.peers.insert(address, handle);
        }
    }

    fn handle_incoming_peer(&mut self, conn: IncomingConn) {
        if !self.initialized || self.io_failed {
            tracing::debug!("refusing inbound peer, torrent not serving");
            return;
        }
        if self.peers.len() >= self.ctx.config.peer_connection_count_limit {
            // Resource limit; the socket closes cleanly on drop.
            tracing::warn!(
                "refusing inbound peer {}, at connection limit {}",
                conn.address,
                self.ctx.config.peer_connection_count_limit,
            );
            return;
        }

        let address = conn.address;
        self.peers_known.insert(address);
        let handle = PeerHandle::start_inbound(conn, self.context());
        self.peers.insert(address, handle);
    }

    async fn handle_peer_state(&mut self, address: SocketAddr, state: SessionState) {
        let interest_changed = match self.peers.get_mut(&address) {
            Some(peer) => {
                let changed = peer.state.peer_interested != state.peer_interested;
                peer.state = state;
                changed
            }
            None => return,
        };
        // Interest transitions re-run the unchoke selection without
        // touching the optimistic slots.
        if interest_changed {
            self.downloaders_update(false).await;
        }
    }

    fn handle_peer_disconnected(
        &mut self,
        address: SocketAddr,
        bytes_in: u64,
        bytes_out: u64,
        error: bool,
    ) {
        tracing::debug!("peer {} disconnected", address);
        self.content_bytes_in += bytes_in;
        self.content_bytes_out += bytes_out;
        self.peers.remove(&address);
        self.downloaders.retain(|a| *a != address);
        self.senders.retain(|a| *a != address);
        if error {
            // A misbehaving peer is not worth reconnecting to.
            self.peers_known.remove(&address);
        }
    }

    async fn handle_block_written(&mut self, block: BlockInfo, failed: bool) -> Result<()> {
        if failed {
            self.io_failure();
            return Ok(());
        }

        let sub = block.idx_in_piece(self.ctx.info.block_len);
        let complete = self.ctx.picker.write().await.mark_block_written(block.piece_idx, sub);
        if complete {
            self.ctx.disk_tx.send(CommandToDisk::VerifyPiece { piece_idx: block.piece_idx })?;
        }
        Ok(())
    }

    async fn handle_piece_verified(&mut self, idx: usize, valid: bool, failed: bool) -> Result<()> {
        if failed {
            self.io_failure();
            return Ok(());
        }

        let all_done = self.ctx.picker.write().await.piece_verified(idx, valid);
        if !valid {
            // Blocks were discarded; peers will re-request them. The source
            // of the bad data is unknowable, so nobody is punished.
            return Ok(());
        }

        self.bytes_left = self.bytes_left.saturating_sub(self.ctx.info.piece_length(idx) as u64);
        let missing = self.ctx.info.num_pieces - self.ctx.picker.read().await.pieces_have_count();
        tracing::info!("piece {} verified, {} pieces remain", idx, missing);

        // The write completed before this verdict was issued, so every HAVE
        // follows the data it advertises.
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
        }

        if all_done && !self.download_complete {
            self.download_complete = true;
            self.finished_at = Some(chrono::Utc::now());
            tracing::info!("torrent download complete");
            debug_assert_eq!(self.bytes_left, 0);
            if !self.trackers.is_empty() {
                self.announce_event(Event::Completed).await;
            }
        }
        Ok(())
    }

    async fn handle_validation_done(&mut self, piecemask: BitMask, failed: bool) -> Result<()> {
        if failed {
            self.io_failure();
            return Ok(());
        }

        {
            let mut picker = self.ctx.picker.write().await;
            picker.set_piecemask(piecemask);
            self.bytes_left = bytes_left_of(&self.ctx.info, &picker);
            self.download_complete = picker.is_complete();
        }
        tracing::info!("validation complete, {} bytes left", self.bytes_left);

        self.initialized = true;
        self.next_announce = Instant::now();
        Ok(())
    }

    // A disk failure pauses data acceptance for this torrent; other
    // torrents are unaffected.
    fn io_failure(&mut self) {
        if self.io_failed {
            return;
        }
        tracing::error!("disk failure, pausing torrent");
        self.io_failed = true;
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
    }

    // Periodic upkeep: endgame detection and the choke pass.
    async fn maintenance(&mut self) {
        if !self.initialized || self.io_failed {
            return;
        }
        self.ctx.picker.write().await.update_endgame(self.ctx.config.endgame_threshold);
        self.downloaders_update(true).await;
    }

    // The choke algorithm: pick the peers worth serving, unchoke them,
    // choke whoever dropped out of the set.
    async fn downloaders_update(&mut self, discard_optimistic: bool) {

        let config = &self.ctx.config;
        let snapshot: Vec<(SocketAddr, u64, bool)> = self
            .peers
            .iter()
            .map(|(addr, peer)| {
                (*addr, peer.state.throughput.down.avg(), peer.state.peer_interested)
            })
            .collect();

        let rate_count = config.downloader_count - config.optimistic_unchoke_count();
        let prev_optimistic: Vec<SocketAddr> = if discard_optimistic {
            Vec::new()
        } else {
            self.downloaders.iter().skip(rate_count).copied().collect()
        };

        let (downloaders, senders) = select_unchoked(
            &snapshot,
            &prev_optimistic,
            config.downloader_count,
            rate_count,
        );

        let previously: HashSet<SocketAddr> = self
            .downloaders
            .iter()
            .chain(self.senders.iter())
            .copied()
            .collect();
        let now: HashSet<SocketAddr> = downloaders
            .iter()
            .chain(senders.iter())
            .copied()
            .collect();

        for addr in now.difference(&previously) {
            if let Some(peer) = self.peers.get(addr) {
                peer.peer_tx.send(PeerCommand::Unchoke).ok();
            }
        }
        for addr in previously.difference(&now) {
            if let Some(peer) = self.peers.get(addr) {
                peer.peer_tx.send(PeerCommand::Choke).ok();
            }
        }

        self.downloaders = downloaders;
        self.senders = senders;
    }

    async fn announce_event(&mut self, event: Event) {
        self.cursor.clamp(&self.trackers);
        if self.trackers.is_empty() {
            return;
        }
        let params = AnnounceParams {
            info_hash: self.ctx.id,
            client_id: self.ctx.config.client_id,
            port: self.ctx.config.listen_address.port(),
            uploaded: self.content_bytes_out,
            downloaded: self.content_bytes_in,
            left: self.bytes_left,
            event: Some(event),
            num_want: None,
            tracker_id: self.trackerid.clone(),
            key: self.announce_key,
        };
        let client = &mut self.trackers[self.cursor.tier][self.cursor.index];
        if let Err(e) = client.announce(&params).await {
            tracing::warn!("{} announce failed: {}", event, e);
        }
    }

    // Serializable snapshot of the coordinator, per the resume format.
    pub async fn resume_state(&self) -> ResumeState {
        let picker = self.ctx.picker.read().await;
        ResumeState {
            piecemask: picker.piecemask().as_bytes().to_vec(),
            blockmask: picker.blockmask().as_bytes().to_vec(),
            piece_count: self.ctx.info.num_pieces,
            piece_length: self.ctx.info.piece_len,
            piece_length_last: self.ctx.info.last_piece_len,
            block_length: self.ctx.info.block_len,
            content_bytes_in: self.content_bytes_in,
            content_bytes_out: self.content_bytes_out,
            trackerid: self.trackerid.clone(),
            tier: self.cursor.tier,
            tier_index: self.cursor.index,
            announce_key: self.announce_key.to_vec(),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {

        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        for (address, peer) in self.peers.drain() {
            if let Some(handle) = peer.session_handle {
                if let Err(e) = handle.await {
                    tracing::warn!("session {} shutdown: {}", address, e);
                }
            }
        }

        self.ctx.disk_tx.send(CommandToDisk::Shutdown).ok();
        if let Some(handle) = self.disk_handle.take() {
            match handle.await {
                Ok(Err(e)) => tracing::error!("disk task error: {}", e),
                Err(e) => tracing::error!("disk task panicked: {}", e),
                _ => {}
            }
        }
        self.ctx.rate_tx.send(crate::bandwidth::RateCommand::Shutdown).ok();
        if let Some(handle) = self.rate_handle.take() {
            handle.await.ok();
        }

        if self.announced_started && !self.trackers.is_empty() {
            self.announce_event(Event::Stopped).await;
        }
        Ok(())
    }
}

// Unchoke selection. `peers` is (address, recent download rate,
// peer_interested); carried optimistic targets fill slots first, the
// remainder is drawn uniformly at random. Senders are high-rate peers that
// are not interested right now, unchoked so they know we would serve them.
fn select_unchoked(
    peers: &[(SocketAddr, u64, bool)],
    prev_optimistic: &[SocketAddr],
    downloader_count: usize,
    rate_count: usize,
) -> (Vec<SocketAddr>, Vec<SocketAddr>) {

    if downloader_count == 0 {
        return (Vec::new(), Vec::new());
    }

    let mut sorted: Vec<&(SocketAddr, u64, bool)> = peers.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));

    let interested: Vec<SocketAddr> = sorted
        .iter()
        .filter(|(_, _, interest)| *interest)
        .map(|(addr, _, _)| *addr)
        .collect();

    if interested.is_empty() {
        // Nobody wants anything; advertise willingness to everyone.
        let senders = sorted.iter().map(|(addr, _, _)| *addr).collect();
        return (Vec::new(), senders);
    }

    let mut downloaders: Vec<SocketAddr>;
    let mut pool: Vec<SocketAddr>;
    if interested.len() <= downloader_count {
        downloaders = interested.clone();
        pool = Vec::new();
    } else {
        downloaders = interested[..rate_count].to_vec();
        pool = interested[rate_count..].to_vec();

        // Previous optimistic unchokes keep their slot while they remain
        // present and interested.
        for addr in prev_optimistic {
            if downloaders.len() >= downloader_count {
                break;
            }
            if let Some(pos) = pool.iter().position(|a| a == addr) {
                downloaders.push(pool.remove(pos));
            }
        }
        let mut rng = rand::thread_rng();
        while downloaders.len() < downloader_count && !pool.is_empty() {
            let pick = rng.gen_range(0..pool.len());
            downloaders.push(pool.swap_remove(pick));
        }
    }

    // The slowest rate-based downloader sets the bar for senders.
    let boundary_rate = sorted
        .iter()
        .filter(|(addr, _, _)| downloaders.iter().take(rate_count).any(|a| a == addr))
        .map(|(_, rate, _)| *rate)
        .min()
        .unwrap_or(0);
    let senders: Vec<SocketAddr> = sorted
        .iter()
        .filter(|(addr, rate, interest)| {
            !*interest && *rate > boundary_rate && !downloaders.contains(addr)
        })
        .map(|(addr, _, _)| *addr)
        .collect();

    (downloaders, senders)
}

// Bytes still to download, derived from the verified piecemask. Counting
// whole pieces over-subtracts for a present last piece, which is shorter.
fn bytes_left_of(info: &StoreInfo, picker: &Picker) -> u64 {
    let have = picker.pieces_have_count() as u64;
    let mut left = info.total_len as i64 - (have * info.piece_len as u64) as i64;
    if info.num_pieces > 0 && picker.have_piece(info.num_pieces - 1) {
        left += (info.piece_len - info.last_piece_len) as i64;
    }
    debug_assert!(left >= 0);
    left.max(0) as u64
}

fn generate_announce_key() -> ID {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::new();
    hasher.update(std::process::id().to_be_bytes());
    hasher.update(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .to_be_bytes(),
    );
    hasher.update(rand::random::<u64>().to_be_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::new(10, 0, 0, n).into(), 6881)
    }

    #[test]
    fn test_select_unchoked_by_rate_with_optimistic() {
        // Six interested peers; rate slots go to the fastest three.
        let peers: Vec<(SocketAddr, u64, bool)> = (1..=6)
            .map(|n| (addr(n), n as u64 * 100, true))
            .collect();

        let (downloaders, senders) = select_unchoked(&peers, &[], 4, 3);
        assert_eq!(downloaders.len(), 4);
        assert!(downloaders.contains(&addr(6)));
        assert!(downloaders.contains(&addr(5)));
        assert!(downloaders.contains(&addr(4)));
        // The optimistic slot goes to one of the slow three.
        assert!(downloaders[3..].iter().all(|a| [addr(1), addr(2), addr(3)].contains(a)));
        assert!(senders.is_empty());
    }

    #[test]
    fn test_select_unchoked_carries_optimistic_target() {
        let peers: Vec<(SocketAddr, u64, bool)> = (1..=6)
            .map(|n| (addr(n), n as u64 * 100, true))
            .collect();

        let (downloaders, _) = select_unchoked(&peers, &[addr(2)], 4, 3);
        assert_eq!(downloaders[3], addr(2), "carried optimistic target keeps its slot");
    }

    #[test]
    fn test_select_unchoked_few_interested() {
        let peers = vec![
            (addr(1), 500, true),
            (addr(2), 50, true),
            (addr(3), 900, false),
        ];
        let (downloaders, senders) = select_unchoked(&peers, &[], 4, 3);
        let set: HashSet<SocketAddr> = downloaders.into_iter().collect();
        assert_eq!(set, [addr(1), addr(2)].into_iter().collect());
        // The fast disinterested peer is advertised to.
        assert_eq!(senders, vec![addr(3)]);
    }

    #[test]
    fn test_select_unchoked_nobody_interested() {
        let peers = vec![(addr(1), 0, false), (addr(2), 10, false)];
        let (downloaders, senders) = select_unchoked(&peers, &[], 4, 3);
        assert!(downloaders.is_empty());
        assert_eq!(senders.len(), 2);
    }

    #[test]
    fn test_resume_state_round_trip() {
        let state = ResumeState {
            piecemask: vec![0xe0],
            blockmask: vec![0xf8],
            piece_count: 3,
            piece_length: 1024,
            piece_length_last: 1,
            block_length: 512,
            content_bytes_in: 1234,
            content_bytes_out: 567,
            trackerid: Some("id".to_string()),
            tier: 1,
            tier_index: 2,
            announce_key: vec![7; 20],
        };
        let raw = state.to_bytes().unwrap();
        assert_eq!(ResumeState::from_bytes(&raw).unwrap(), state);
    }

    #[test]
    fn test_bytes_left_accounts_for_short_last_piece() {
        use crate::store::FileInfo;
        let info = StoreInfo {
            name: "t".into(),
            total_len: 2049,
            piece_len: 1024,
            last_piece_len: 1,
            num_pieces: 3,
            block_len: 512,
            files: vec![FileInfo { path: "t".into(), length: 2049, offset: 0 }],
            output_dir: "out".into(),
        };

        let mut picker = Picker::new(&info);
        assert_eq!(bytes_left_of(&info, &picker), 2049);

        // Only the short last piece present.
        let mut mask = BitMask::new(3);
        mask.set(2, true);
        picker.set_piecemask(mask);
        assert_eq!(bytes_left_of(&info, &picker), 2048);

        picker.set_piecemask(BitMask::set_full(3));
        assert_eq!(bytes_left_of(&info, &picker), 0);
    }

    #[test]
    fn test_announce_key_shape() {
        let a = generate_announce_key();
        let b = generate_announce_key();
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }
}
