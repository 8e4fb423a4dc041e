use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, FramedParts};
use crate::{
    bandwidth::{Grant, GrantTx, RateCommand},
    block::{Block, BlockData, BlockInfo},
    fs::CommandToDisk,
    mse,
    picker::BlockAccept,
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield, ID,
};
use super::{*, handshake::*, message::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Cap on the PIECE payload batched towards the wire at a time; small enough
// to stay responsive to CANCELs.
const UPLOAD_BATCH_BYTES: usize = 16 * 1024;

// Minimum chunk we ask the bandwidth governor for.
const BANDWIDTH_REQUEST_MIN: usize = 1024;

#[derive(Debug)]
pub struct PeerSession {

    // The peer's address.
    address: SocketAddr,

    // Shared torrent state: picker, geometry, channels.
    ctx: Arc<TorrentContext>,

    // Commands to the session.
    peer_rx: PeerRx,

    // Handed out for disk read completions.
    peer_tx: PeerTx,

    // Bandwidth grants for the upload pipeline.
    grant_rx: mpsc::UnboundedReceiver<Grant>,
    grant_tx: GrantTx,

    // Pieces the peer claims to have.
    bitfield: Bitfield,

    state: SessionState,

    // Both ends advertised the Fast Extension.
    ext_fast: bool,

    peer_id: Option<ID>,

    // Pieces worth requesting from this peer, preference ordered.
    pieces_wanted: VecDeque<usize>,

    // (piece, sub) blocks requested from the peer and not yet answered.
    blocks_pending: HashSet<(usize, usize)>,

    // Block requests from the peer, in arrival order.
    blocks_pending_out: VecDeque<BlockInfo>,

    // Fast Extension state.
    pieces_allowed_fast: HashSet<usize>,
    pieces_suggested: HashSet<usize>,

    // When the oldest entry of blocks_pending went on the wire.
    first_block_wait: Option<Instant>,

    last_in: Instant,
    last_out: Instant,
    last_maintenance: Instant,

    // Upload pipeline: blocks awaiting a bandwidth grant, bytes still to be
    // granted, grant credit accumulated, and whether a disk read is in
    // flight.
    out_batch: Vec<BlockInfo>,
    grant_needed: usize,
    granted_pool: usize,
    inflight_read: bool,

    content_bytes_in: u64,
    content_bytes_out: u64,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (grant_tx, grant_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, ctx.info.num_pieces);
        let now = Instant::now();

        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                grant_rx,
                grant_tx,
                bitfield,
                state: SessionState::default(),
                ext_fast: false,
                peer_id: None,
                pieces_wanted: VecDeque::new(),
                blocks_pending: HashSet::new(),
                blocks_pending_out: VecDeque::new(),
                pieces_allowed_fast: HashSet::new(),
                pieces_suggested: HashSet::new(),
                first_block_wait: None,
                last_in: now,
                last_out: now,
                last_maintenance: now,
                out_batch: Vec::new(),
                grant_needed: 0,
                granted_pool: 0,
                inflight_read: false,
                content_bytes_in: 0,
                content_bytes_out: 0,
            },
            peer_tx,
        )
    }

    // Open a connection to the peer, optionally through an MSE handshake,
    // exchange BT handshakes and run the session.
    pub async fn start_outbound(&mut self) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let timeout = time::Duration::from_secs(10);
        let mut stream = time::timeout(timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| PeerError::Timeout)??;
        tracing::trace!("outbound connection successful");

        let (crypto, leftover) = if self.ctx.config.mse_outgoing {
            mse::initiate(&mut stream, &self.ctx.id, &[]).await?
        } else {
            (mse::Crypto::plaintext(), bytes::BytesMut::new())
        };

        let mut parts = FramedParts::new::<Handshake>(stream, HandshakeCodec::with_crypto(crypto));
        parts.read_buf = leftover;
        let mut socket = Framed::from_parts(parts);

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let ours = Handshake::new(self.ctx.id, self.ctx.config.client_id);
        socket.send(ours).await?;
        self.last_out = Instant::now();

        let theirs = time::timeout(self.ctx.config.connection_timeout, socket.next())
            .await
            .map_err(|_| PeerError::Timeout)?
            .ok_or(PeerError::NoHandshake)??;
        self.accept_handshake(&theirs)?;
        if theirs.info_hash != self.ctx.id {
            return Err(PeerError::IncorrectInfoHash);
        }

        let socket = into_message_framed(socket);
        self.run(socket).await
    }

    // Adopt a connection the client accepted and identified; the peer's
    // handshake is already in hand and our reply has not been sent.
    pub async fn start_inbound(&mut self, conn: IncomingConn) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        if conn.handshake.info_hash != self.ctx.id {
            return Err(PeerError::IncorrectInfoHash);
        }
        self.accept_handshake(&conn.handshake)?;

        let mut parts = FramedParts::new::<Handshake>(
            conn.stream,
            HandshakeCodec::with_crypto(conn.crypto),
        );
        parts.read_buf = conn.read_buf;
        let mut socket = Framed::from_parts(parts);

        let ours = Handshake::new(self.ctx.id, self.ctx.config.client_id);
        socket.send(ours).await?;
        self.last_out = Instant::now();

        let socket = into_message_framed(socket);
        self.run(socket).await
    }

    // Shared handshake validation: self-connections close, features are the
    // intersection of both reserved masks.
    fn accept_handshake(&mut self, handshake: &Handshake) -> Result<()> {
        tracing::debug!("peer handshake: {:?}", handshake);

        if handshake.peer_id == self.ctx.config.client_id {
            return Err(PeerError::SelfConnect);
        }
        self.peer_id = Some(handshake.peer_id);
        self.ext_fast = handshake.reserved.contains(Reserved::FAST);
        if self.ext_fast {
            tracing::debug!("fast extension active");
        }
        if handshake.reserved.contains(Reserved::DHT) {
            tracing::trace!("peer advertises DHT support");
        }

        self.ctx.torrent_tx.send(CommandToTorrent::PeerConnected {
            address: self.address,
            id: handshake.peer_id,
        })?;
        Ok(())
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Introducing);
        let now = Instant::now();
        self.last_in = now;
        self.last_maintenance = now;

        let (mut sink, mut stream) = socket.split();

        // Tell the peer what we have straight away.
        let bitfield = self.ctx.picker.read().await.bitfield();
        self.send_message(&mut sink, Message::Bitfield(bitfield)).await?;

        let mut ticker = time::interval(time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop { tokio::select! {

            // Message from peer.
            msg = stream.next() => {
                match msg {
                    Some(Ok(msg)) => self.handle_msg(&mut sink, msg).await?,
                    Some(Err(e)) => return Err(e),
                    None => {
                        tracing::debug!("peer closed connection");
                        break;
                    }
                }
            }

            // Command from elsewhere in the engine.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,

                    PeerCommand::BlocksRead { blocks, failed } => {
                        self.handle_blocks_read(&mut sink, blocks, failed).await?
                    }

                    PeerCommand::Choke => self.handle_choke_cmd(&mut sink).await?,

                    PeerCommand::Unchoke => self.handle_unchoke_cmd(&mut sink).await?,

                    PeerCommand::Shutdown => {
                        tracing::debug!("session shutdown");
                        break;
                    },
                }
            }

            Some(grant) = self.grant_rx.recv() => self.handle_grant(grant),

            t = ticker.tick() => {
                if !self.tick(&mut sink, t.into_std()).await? {
                    break;
                }
            }

        }}

        Ok(())
    }

    // Logs and sends a message, with bandwidth bookkeeping. PIECE payloads
    // are admitted through the governor beforehand, so only their headers
    // are taken here.
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        let take = match &msg {
            Message::Block(_) => 13,
            other => other.wire_len(),
        };
        self.ctx.rate_tx.send(RateCommand::Take(take)).ok();
        sink.send(msg).await?;
        self.last_out = Instant::now();
        Ok(())
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);
        self.last_in = Instant::now();

        let was_introducing = self.state.conn_state == ConnState::Introducing;

        match msg {

            // The piece map messages are legal only directly after the
            // handshake.
            Message::Bitfield(bitfield) => {
                if !was_introducing {
                    tracing::warn!("bitfield after first data message");
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.handle_bitfield(sink, bitfield).await?;
            },

            Message::HaveAll => {
                if !self.ext_fast {
                    return Err(PeerError::InvalidMessage);
                }
                if !was_introducing {
                    return Err(PeerError::UnexpectedBitfield);
                }
                let full = Bitfield::repeat(true, self.ctx.info.num_pieces);
                self.handle_bitfield(sink, full).await?;
            },

            Message::HaveNone => {
                if !self.ext_fast {
                    return Err(PeerError::InvalidMessage);
                }
                if !was_introducing {
                    return Err(PeerError::UnexpectedBitfield);
                }
                // Same as the default assumption.
            },

            Message::KeepAlive => {},

            Message::Choke => self.handle_choke().await,

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.update(|state| state.peer_interested = true);
                    // The coordinator may want to unchoke this peer.
                    self.report_state();
                }
            },

            Message::NotInterested => {
                if self.state.peer_interested {
                    self.state.update(|state| state.peer_interested = false);
                    self.report_state();
                }
            },

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Request(block) => self.handle_request(sink, block).await?,

            Message::Block(block) => self.handle_block(sink, block).await?,

            Message::Cancel(block) => self.handle_cancel(block),

            Message::SuggestPiece { idx } => self.handle_suggest(idx).await?,

            Message::RejectRequest(block) => self.handle_reject(block).await?,

            Message::AllowedFast { idx } => self.handle_allowed_fast(sink, idx).await?,

        }

        if was_introducing && self.state.conn_state == ConnState::Introducing {
            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {

        let num_pieces = self.ctx.info.num_pieces;
        let expected_bytes = (num_pieces + 7) / 8;
        if bitfield.as_raw_slice().len() != expected_bytes {
            tracing::warn!("bitfield of {} bytes, expected {}", bitfield.as_raw_slice().len(), expected_bytes);
            return Err(PeerError::InvalidMessage);
        }
        bitfield.resize(num_pieces, false);
        tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);

        let interested = self.ctx.picker.write().await.register_bitfield(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        let idx = idx as usize;
        if idx >= self.ctx.info.num_pieces {
            tracing::warn!("have with invalid piece {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        if self.bitfield[idx] {
            return Ok(());
        }
        self.bitfield.set(idx, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self.ctx.picker.write().await.piece_available(idx);
        self.update_interest(sink, interested).await?;
        if self.state.interested && !self.state.peer_choking {
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    async fn handle_choke(&mut self) {
        if self.state.peer_choking {
            return;
        }
        self.state.update(|state| state.peer_choking = true);

        if !self.ext_fast {
            // Without Fast, a choke implicitly cancels everything we had
            // pending; the reservations go back to the pool.
            let pending: Vec<_> = self.blocks_pending.drain().collect();
            if !pending.is_empty() {
                let mut picker = self.ctx.picker.write().await;
                for (piece, sub) in pending {
                    picker.release_block(piece, sub);
                }
            }
            self.first_block_wait = None;
        }
        // With Fast we keep the pending set and wait for per-request
        // REJECTs.
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, block: BlockInfo) -> Result<()> {

        if self.state.choked {
            if self.ext_fast {
                self.send_message(sink, Message::RejectRequest(block)).await?;
            }
            // Without Fast the request is dropped silently.
            return Ok(());
        }

        if block.piece_idx >= self.ctx.info.num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        if !self.ctx.picker.read().await.have_piece(block.piece_idx) {
            tracing::warn!("request for piece {} we don't have", block.piece_idx);
            return Err(PeerError::InvalidMessage);
        }
        let piece_len = self.ctx.info.piece_length(block.piece_idx);
        if block.len == 0
            || block.len > self.ctx.config.request_block_length_max
            || block.offset + block.len > piece_len
        {
            tracing::warn!("invalid request geometry: {:?}", block);
            return Err(PeerError::InvalidMessage);
        }

        // An over-quota request must never land in the queue.
        if self.blocks_pending_out.len() >= self.ctx.config.blocks_pending_out_limit {
            tracing::warn!("peer exceeded request queue quota");
            return Err(PeerError::RequestQueueLimit);
        }
        self.blocks_pending_out.push_back(block);

        self.maybe_start_upload();
        Ok(())
    }

    async fn handle_block(&mut self, sink: &mut MessageSink, block: Block) -> Result<()> {

        let info = block.info();
        let sub = info.idx_in_piece(self.ctx.info.block_len);
        let key = (info.piece_idx, sub);

        if !self.blocks_pending.remove(&key) {
            if self.ext_fast {
                // With Fast there are no implicit cancels, so an unrequested
                // block is a protocol violation.
                tracing::warn!("unrequested block: {:?}", info);
                return Err(PeerError::InvalidMessage);
            }
            // Known race: a choke-unchoke sequence may cross in-flight
            // blocks whose requests we considered implicitly cancelled.
            // Observed from real clients, so tolerated and dropped.
            tracing::debug!("block for implicitly cancelled request: {:?}", info);
            self.state.update(|state| state.snubbed = false);
            return Ok(());
        }

        let was_snubbed = self.state.snubbed;
        self.state.update(|state| state.snubbed = false);
        self.first_block_wait = if self.blocks_pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };

        // The reservation stays in place until the disk write completes, so
        // the block cannot be re-picked while in flight.
        let accept = self.ctx.picker.read().await.accept_block(&info, was_snubbed);

        match accept {
            BlockAccept::Invalid => {
                tracing::warn!("invalid block geometry: {:?}", info);
                return Err(PeerError::InvalidMessage);
            }
            BlockAccept::Duplicate(_) => {
                tracing::debug!("duplicate block: {:?}", info);
            }
            BlockAccept::Fresh(_) => {
                self.state.update(|state| state.throughput.down += info.len as u64);
                self.content_bytes_in += info.len as u64;
                let data = match block.data {
                    BlockData::Owned(data) => data,
                    BlockData::Cached(data) => data.to_vec(),
                };
                self.ctx.disk_tx.send(CommandToDisk::WriteBlock { block: info, data })
                    .map_err(|e| PeerError::Channel(e.to_string()))?;
            }
        }

        if self.blocks_pending.len() <= self.ctx.config.request_queue_min {
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    fn handle_cancel(&mut self, block: BlockInfo) {
        // Already-drained entries are fine; the response may simply have
        // crossed the cancel on the wire.
        if let Some(pos) = self.blocks_pending_out.iter().position(|b| *b == block) {
            self.blocks_pending_out.remove(pos);
        } else {
            tracing::trace!("cancel for block not queued: {:?}", block);
        }
    }

    async fn handle_suggest(&mut self, idx: u32) -> Result<()> {
        let idx = idx as usize;
        if idx >= self.ctx.info.num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        if !self.ctx.picker.read().await.have_piece(idx) {
            self.pieces_suggested.insert(idx);
        }
        Ok(())
    }

    async fn handle_reject(&mut self, block: BlockInfo) -> Result<()> {
        if !self.ext_fast {
            return Err(PeerError::InvalidMessage);
        }
        if block.offset % self.ctx.info.block_len != 0 {
            return Err(PeerError::InvalidMessage);
        }
        let sub = block.idx_in_piece(self.ctx.info.block_len);
        if !self.blocks_pending.remove(&(block.piece_idx, sub)) {
            tracing::warn!("reject for block we never requested: {:?}", block);
            return Err(PeerError::InvalidMessage);
        }
        self.ctx.picker.write().await.release_block(block.piece_idx, sub);
        if self.blocks_pending.is_empty() {
            self.first_block_wait = None;
            self.state.update(|state| state.snubbed = false);
        }
        Ok(())
    }

    async fn handle_allowed_fast(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        if !self.ext_fast {
            return Err(PeerError::InvalidMessage);
        }
        let idx = idx as usize;
        if idx >= self.ctx.info.num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        self.pieces_allowed_fast.insert(idx);
        // Allowed-fast pieces may be requested even while choked.
        if self.state.peer_choking {
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    // When a piece completes: advertise it, and withdraw any of our own
    // requests that it makes redundant.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        if !self.bitfield[idx] {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        }

        let redundant: Vec<(usize, usize)> = self
            .blocks_pending
            .iter()
            .filter(|(piece, _)| *piece == idx)
            .copied()
            .collect();
        for (piece, sub) in redundant {
            let info = BlockInfo {
                piece_idx: piece,
                offset: sub * self.ctx.info.block_len,
                len: self.ctx.info.block_len(piece, sub),
            };
            self.forget_pending(piece, sub).await;
            self.send_message(sink, Message::Cancel(info)).await?;
        }
        Ok(())
    }

    async fn forget_pending(&mut self, piece: usize, sub: usize) {
        if self.blocks_pending.remove(&(piece, sub)) {
            self.ctx.picker.write().await.release_block(piece, sub);
        }
        if self.blocks_pending.is_empty() {
            self.first_block_wait = None;
        }
    }

    // Coordinator decided to choke this peer.
    async fn handle_choke_cmd(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.state.choked {
            return Ok(());
        }
        self.state.update(|state| state.choked = true);
        self.send_message(sink, Message::Choke).await?;

        // Drop the queue; with Fast every queued block is rejected
        // explicitly, without it the choke cancels implicitly.
        let queued: Vec<BlockInfo> = self
            .blocks_pending_out
            .drain(..)
            .chain(self.out_batch.drain(..))
            .collect();
        self.grant_needed = 0;
        self.granted_pool = 0;
        if self.ext_fast {
            for block in queued {
                self.send_message(sink, Message::RejectRequest(block)).await?;
            }
        }
        Ok(())
    }

    async fn handle_unchoke_cmd(&mut self, sink: &mut MessageSink) -> Result<()> {
        if !self.state.choked {
            return Ok(());
        }
        self.state.update(|state| state.choked = false);
        self.send_message(sink, Message::Unchoke).await
    }

    // Serve queued requests: batch up to 16 KiB, ask the governor for the
    // payload, read from disk once granted, send on completion.
    fn maybe_start_upload(&mut self) {
        if self.state.choked
            || self.inflight_read
            || !self.out_batch.is_empty()
            || self.blocks_pending_out.is_empty()
        {
            return;
        }

        let mut total = 0;
        while let Some(block) = self.blocks_pending_out.front().copied() {
            if !self.out_batch.is_empty() && total + block.len > UPLOAD_BATCH_BYTES {
                break;
            }
            total += block.len;
            self.blocks_pending_out.pop_front();
            self.out_batch.push(block);
        }

        self.grant_needed = total;
        self.granted_pool = 0;
        self.ctx.rate_tx
            .send(RateCommand::Request {
                bytes: total,
                bytes_min: BANDWIDTH_REQUEST_MIN.min(total),
                priority: 0,
                reply: self.grant_tx.clone(),
            })
            .ok();
    }

    fn handle_grant(&mut self, grant: Grant) {
        self.granted_pool += grant.granted;
        if self.grant_needed == 0 || self.out_batch.is_empty() {
            return;
        }
        if self.granted_pool >= self.grant_needed || grant.request_done {
            let blocks = std::mem::take(&mut self.out_batch);
            self.granted_pool = self.granted_pool.saturating_sub(self.grant_needed);
            self.grant_needed = 0;
            self.inflight_read = true;
            self.ctx.disk_tx
                .send(CommandToDisk::ReadBlocks { blocks, tx: self.peer_tx.clone() })
                .ok();
        }
    }

    async fn handle_blocks_read(
        &mut self,
        sink: &mut MessageSink,
        blocks: Vec<Block>,
        failed: bool,
    ) -> Result<()> {
        self.inflight_read = false;
        if failed {
            return Err(PeerError::DiskFailure);
        }

        for block in blocks {
            if self.state.choked {
                // Choked while the read was in flight; the queue was
                // already rejected or dropped there.
                break;
            }
            let len = block.data.len() as u64;
            self.send_message(sink, Message::Block(block)).await?;
            self.state.update(|state| state.throughput.up += len);
            self.content_bytes_out += len;
        }

        self.maybe_start_upload();
        Ok(())
    }

    // Queue REQUEST messages up to the configured depth.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.snubbed {
            return Ok(());
        }

        // While choked only Fast-allowed pieces are usable.
        let restrict_allowed_fast = if self.state.peer_choking {
            if !self.ext_fast || self.pieces_allowed_fast.is_empty() {
                return Ok(());
            }
            true
        } else {
            false
        };

        let mut to_request = Vec::new();
        {
            let mut picker = self.ctx.picker.write().await;

            // Refresh the wanted list: drop exhausted pieces, refill when
            // empty.
            self.pieces_wanted.retain(|&idx| picker.query_piece_wanted(idx));
            if self.pieces_wanted.is_empty() {
                let wanted = if restrict_allowed_fast {
                    let mut mask = Bitfield::repeat(false, self.ctx.info.num_pieces);
                    for &piece in &self.pieces_allowed_fast {
                        if self.bitfield[piece] {
                            mask.set(piece, true);
                        }
                    }
                    picker.pieces_wanted_get(&mask, self.ctx.config.pieces_wanted_max)
                } else {
                    picker.pieces_wanted_get(&self.bitfield, self.ctx.config.pieces_wanted_max)
                };
                self.pieces_wanted = wanted.into();
            }

            'outer: for &piece in self.pieces_wanted.iter() {
                if restrict_allowed_fast && !self.pieces_allowed_fast.contains(&piece) {
                    continue;
                }
                for sub in 0..self.ctx.info.num_blocks(piece) {
                    if self.blocks_pending.len() + to_request.len()
                        >= self.ctx.config.request_queue_len
                    {
                        break 'outer;
                    }
                    if self.blocks_pending.contains(&(piece, sub)) {
                        continue;
                    }
                    if picker.try_reserve(piece, sub) {
                        to_request.push((piece, sub));
                    }
                }
            }
        }

        for (piece, sub) in to_request {
            let info = BlockInfo {
                piece_idx: piece,
                offset: sub * self.ctx.info.block_len,
                len: self.ctx.info.block_len(piece, sub),
            };
            if self.blocks_pending.is_empty() {
                self.first_block_wait = Some(Instant::now());
            }
            self.blocks_pending.insert((piece, sub));
            self.send_message(sink, Message::Request(info)).await?;
        }

        Ok(())
    }

    // Announce or retract interest when it changes.
    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if !self.state.interested && interested {
            self.state.update(|state| state.interested = true);
            self.send_message(sink, Message::Interested).await?;
        } else if self.state.interested && !interested {
            self.state.update(|state| state.interested = false);
            self.send_message(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    fn report_state(&mut self) {
        self.ctx.torrent_tx
            .send(CommandToTorrent::PeerState {
                address: self.address,
                state: self.state,
            })
            .ok();
        self.state.changed = false;
    }

    // Once a second: timeouts, keepalives, periodic maintenance, state
    // reporting. Returns false for an orderly close.
    async fn tick(&mut self, sink: &mut MessageSink, now: Instant) -> Result<bool> {

        if now.saturating_duration_since(self.last_in) > self.ctx.config.connection_timeout {
            if self.state.conn_state == ConnState::Connected {
                tracing::info!("soft timeout, disconnecting");
                return Ok(false);
            }
            tracing::warn!("hard timeout before sync, disconnecting");
            return Err(PeerError::Timeout);
        }

        if now.saturating_duration_since(self.last_out) > self.ctx.config.keepalive_interval {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        if now.saturating_duration_since(self.last_maintenance)
            >= self.ctx.config.maintenance_interval
        {
            self.last_maintenance = now;
            self.maintenance(sink, now).await?;
        }

        if self.state.changed {
            self.report_state();
        }
        self.state.tick();

        Ok(true)
    }

    // Periodic upkeep: recompute interest against the wanted pieces and
    // detect snubbing.
    async fn maintenance(&mut self, sink: &mut MessageSink, now: Instant) -> Result<()> {

        {
            let picker = self.ctx.picker.read().await;
            self.pieces_wanted.retain(|&idx| picker.query_piece_wanted(idx));
            if self.pieces_wanted.is_empty() {
                self.pieces_wanted = picker
                    .pieces_wanted_get(&self.bitfield, self.ctx.config.pieces_wanted_max)
                    .into();
            }
        }
        let interested = !self.pieces_wanted.is_empty();
        self.update_interest(sink, interested).await?;

        // A peer sitting on our requests past the block timeout is snubbed:
        // all but one pending request go back to the pool.
        if !self.state.peer_choking
            && !self.state.snubbed
            && !self.blocks_pending.is_empty()
        {
            let stalled = self
                .first_block_wait
                .map_or(false, |since| now.saturating_duration_since(since) > self.ctx.config.block_timeout);
            if stalled {
                tracing::info!("peer appears to be snubbing us");
                self.state.update(|state| state.snubbed = true);

                let mut pending: Vec<(usize, usize)> = self.blocks_pending.iter().copied().collect();
                pending.sort_unstable();
                let mut picker = self.ctx.picker.write().await;
                for &(piece, sub) in pending.iter().skip(1) {
                    self.blocks_pending.remove(&(piece, sub));
                    picker.release_block(piece, sub);
                }
                drop(picker);
                for (piece, sub) in pending.into_iter().skip(1) {
                    let info = BlockInfo {
                        piece_idx: piece,
                        offset: sub * self.ctx.info.block_len,
                        len: self.ctx.info.block_len(piece, sub),
                    };
                    self.send_message(sink, Message::Cancel(info)).await?;
                }
            }
        }

        Ok(())
    }

    // Final bookkeeping once the session ends, however it ended: pending
    // reservations and the availability contribution go back, the
    // coordinator drops the peer.
    pub async fn disconnect(&mut self, error: bool) {

        {
            let mut picker = self.ctx.picker.write().await;
            for (piece, sub) in self.blocks_pending.drain() {
                picker.release_block(piece, sub);
            }
            if self.bitfield.any() {
                picker.unregister_bitfield(&self.bitfield);
            }
        }

        self.state.update(|state| state.conn_state = ConnState::Disconnected);
        self.report_state();
        self.ctx.torrent_tx
            .send(CommandToTorrent::PeerDisconnected {
                address: self.address,
                bytes_in: self.content_bytes_in,
                bytes_out: self.content_bytes_out,
                error,
            })
            .ok();
    }
}

// Swap the handshake codec for the message codec, carrying over the stream
// crypto and any buffered bytes.
fn into_message_framed(socket: Framed<TcpStream, HandshakeCodec>) -> Framed<TcpStream, MessageCodec> {
    let parts = socket.into_parts();
    let mut new_parts = FramedParts::new::<Message>(
        parts.io,
        MessageCodec::with_crypto(parts.codec.crypto),
    );
    new_parts.read_buf = parts.read_buf;
    new_parts.write_buf = parts.write_buf;
    Framed::from_parts(new_parts)
}
