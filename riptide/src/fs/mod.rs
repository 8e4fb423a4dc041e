use std::{
    io::{Read, Seek, Write},
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};
use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task};
use crate::{
    block::{Block, BlockData, BlockInfo},
    masks::BitMask,
    p2p::{PeerCommand, PeerTx},
    store::{FileInfo, FileSlice, StoreError, StoreInfo},
    torrent::{CommandToTorrent, TorrentTx},
    ID,
};


// Pieces cached for peer serving. Peers typically read several blocks of the
// same piece back to back, so whole pieces are cached, split at block
// granularity.
const READ_CACHE_SIZE: usize = 500;

// Validation reads the torrent sequentially in chunks of at least this size,
// rounded down to a whole number of pieces.
const VALIDATION_CHUNK: usize = 1 << 20;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("backing files locked by another process: {0:?}")]
    FileLocked(PathBuf),

    #[error("sync error: {0}")]
    SyncError(String),

    #[error("channel error: {0}")]
    ChannelError(String),

}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::SyncError(e.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for DiskError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        DiskError::ChannelError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::UnboundedSender<CommandToDisk>;
pub type DiskRx = mpsc::UnboundedReceiver<CommandToDisk>;

pub enum CommandToDisk {

    // Block from a peer to be written through to disk.
    WriteBlock {
        block: BlockInfo,
        data: Vec<u8>,
    },

    // Read a whole piece back and check it against its metainfo hash.
    VerifyPiece {
        piece_idx: usize,
    },

    // Blocks requested by a peer; served as one batch.
    ReadBlocks {
        blocks: Vec<BlockInfo>,
        tx: PeerTx,
    },

    // Hash everything on disk and report the resulting piecemask.
    Validate,

    Shutdown,

}

#[derive(Debug)]
pub struct Disk {

    // Storage geometry for offset translation.
    info: StoreInfo,

    piece_hashes: Vec<ID>,

    disk_rx: DiskRx,

    // Shared with the blocking IO closures.
    ctx: Arc<Ctx>,

    // Held for the lifetime of the disk task.
    _lock: Lockfile,

}

#[derive(Debug)]
struct Ctx {

    info: StoreInfo,

    files: Vec<RwLock<TorrentFile>>,

    torrent_tx: TorrentTx,

    read_cache: Mutex<lru::LruCache<usize, Vec<Arc<Vec<u8>>>>>,

}

#[derive(Debug)]
pub struct TorrentFile {

    pub info: FileInfo,

    pub handle: std::fs::File,

}

impl TorrentFile {
    pub fn new(dir: &std::path::Path, info: FileInfo) -> Result<Self> {

        let path = dir.join(&info.path);
        tracing::info!("opening file: {:?}", &path);

        let handle = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self { info, handle })
    }
}

// Advisory exclusive lock on the torrent's backing files: created with
// create_new so a holder elsewhere fails the open, removed on drop.
#[derive(Debug)]
struct Lockfile {
    path: PathBuf,
}

impl Lockfile {
    fn acquire(path: PathBuf) -> Result<Self> {
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(DiskError::FileLocked(path))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove lockfile {:?}: {}", self.path, e);
        }
    }
}

// Setup and spawn the disk task.
pub fn spawn(
    info: StoreInfo,
    piece_hashes: Vec<ID>,
    torrent_tx: TorrentTx,
) -> Result<(task::JoinHandle<Result<()>>, DiskTx)> {
    tracing::info!("spawning disk task");
    let (mut disk, disk_tx) = Disk::new(info, piece_hashes, torrent_tx)?;
    let handle = tokio::task::spawn(async move { disk.run().await });
    Ok((handle, disk_tx))
}

impl Disk {

    pub fn new(info: StoreInfo, piece_hashes: Vec<ID>, torrent_tx: TorrentTx) -> Result<(Self, DiskTx)> {

        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        let lock = Lockfile::acquire(info.lock_path())?;

        debug_assert!(!info.files.is_empty());
        let mut files = Vec::new();
        for file in info.files.iter() {
            let path = info.output_dir.join(&file.path);
            // Create sub-directories if they don't exist.
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    tracing::info!("creating sub-directory: {:?}", subdir);
                    std::fs::create_dir_all(subdir)?;
                }
            }
            files.push(RwLock::new(TorrentFile::new(&info.output_dir, file.clone())?));
        }

        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        // Unwrap safe because the value is always > 0.
        let read_cache = Mutex::new(lru::LruCache::new(
            std::num::NonZeroUsize::new(READ_CACHE_SIZE).unwrap(),
        ));
        Ok((
            Self {
                ctx: Arc::new(Ctx {
                    info: info.clone(),
                    files,
                    torrent_tx,
                    read_cache,
                }),
                info,
                piece_hashes,
                disk_rx,
                _lock: lock,
            },
            disk_tx,
        ))
    }

    #[tracing::instrument(name = "disk", skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("starting disk");
        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {

                CommandToDisk::WriteBlock { block, data } => self.write_block(block, data),

                CommandToDisk::VerifyPiece { piece_idx } => self.verify_piece(piece_idx),

                CommandToDisk::ReadBlocks { blocks, tx } => self.read_blocks(blocks, tx),

                CommandToDisk::Validate => self.validate(),

                CommandToDisk::Shutdown => {
                    tracing::info!("disk shutdown");
                    break;
                },

            }
        }
        Ok(())
    }

    fn write_block(&self, block: BlockInfo, data: Vec<u8>) {
        // Block geometry was validated by the coordinator before the write
        // was issued.
        tracing::trace!("write block {:?}", block);
        let offset = self.info.piece_abs_offset(block.piece_idx) + block.offset as u64;
        let ctx = Arc::clone(&self.ctx);

        tokio::task::spawn_blocking(move || {
            let failed = match write_range(&ctx, offset, &data) {
                Ok(()) => false,
                Err(e) => {
                    tracing::error!("block write failed: {}", e);
                    true
                }
            };
            ctx.torrent_tx
                .send(CommandToTorrent::BlockWritten { block, failed })
                .map_err(|e| {
                    tracing::error!("failed to report block write: {}", e);
                    e
                })
                .ok();
        });
    }

    fn verify_piece(&self, piece_idx: usize) {
        let hash = self.piece_hashes[piece_idx];
        let offset = self.info.piece_abs_offset(piece_idx);
        let len = self.info.piece_length(piece_idx);
        let ctx = Arc::clone(&self.ctx);

        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let (valid, failed) = match read_range(&ctx, offset, &mut buf) {
                Ok(()) => {
                    let mut hasher = Sha1::new();
                    hasher.update(&buf);
                    let digest: ID = hasher.finalize().into();
                    (digest == hash, false)
                }
                Err(e) => {
                    tracing::error!("piece {} read-back failed: {}", piece_idx, e);
                    (false, true)
                }
            };
            ctx.torrent_tx
                .send(CommandToTorrent::PieceVerified { idx: piece_idx, valid, failed })
                .ok();
        });
    }

    // Serves a batch of requested blocks to a peer in one completion,
    // reading whole pieces through the cache.
    fn read_blocks(&self, blocks: Vec<BlockInfo>, tx: PeerTx) {
        let ctx = Arc::clone(&self.ctx);

        tokio::task::spawn_blocking(move || {
            let mut out = Vec::with_capacity(blocks.len());
            let mut failed = false;

            for block in blocks {
                match cached_block(&ctx, &block) {
                    Ok(data) => out.push(Block {
                        piece_idx: block.piece_idx,
                        offset: block.offset,
                        data: BlockData::Cached(data),
                    }),
                    Err(e) => {
                        tracing::error!("block read failed: {}", e);
                        failed = true;
                        break;
                    }
                }
            }

            tx.send(PeerCommand::BlocksRead { blocks: out, failed }).ok();
        });
    }

    // Hashes everything on disk sequentially and reports which pieces match
    // their metainfo hashes.
    fn validate(&self) {
        let ctx = Arc::clone(&self.ctx);
        let hashes = self.piece_hashes.clone();

        tokio::task::spawn_blocking(move || {
            let info = &ctx.info;
            let mut piecemask = BitMask::new(info.num_pieces);
            let mut failed = false;

            let mut chunk_len = VALIDATION_CHUNK - (VALIDATION_CHUNK % info.piece_len);
            if chunk_len == 0 {
                chunk_len = info.piece_len;
            }

            let mut piece_idx = 0;
            let mut offset = 0u64;
            'scan: while offset < info.total_len {
                let len = chunk_len.min((info.total_len - offset) as usize);
                let mut buf = vec![0u8; len];
                if let Err(e) = read_range(&ctx, offset, &mut buf) {
                    tracing::error!("validation read at {} failed: {}", offset, e);
                    failed = true;
                    break 'scan;
                }

                for piece in buf.chunks(info.piece_len) {
                    let mut hasher = Sha1::new();
                    hasher.update(piece);
                    let digest: ID = hasher.finalize().into();
                    if digest == hashes[piece_idx] {
                        piecemask.set(piece_idx, true);
                    }
                    piece_idx += 1;
                }
                offset += len as u64;
            }

            tracing::info!("validation finished: {}/{} pieces present", piecemask.popcount(), info.num_pieces);
            ctx.torrent_tx
                .send(CommandToTorrent::ValidationDone { piecemask, failed })
                .ok();
        });
    }
}

fn write_range(ctx: &Ctx, offset: u64, data: &[u8]) -> Result<()> {
    let slices = ctx.info.file_slices(offset, data.len() as u64)?;
    let mut cursor = 0usize;
    for FileSlice { file_idx, offset, len } in slices {
        let mut file = ctx.files[file_idx].write()?;
        file.handle.seek(std::io::SeekFrom::Start(offset))?;
        file.handle.write_all(&data[cursor..cursor + len as usize])?;
        cursor += len as usize;
    }
    debug_assert_eq!(cursor, data.len());
    Ok(())
}

// Fills buf from the absolute offset. Reads past a file's current physical
// end yield zeroes, so sparse regions hash as zeroes during validation.
fn read_range(ctx: &Ctx, offset: u64, buf: &mut [u8]) -> Result<()> {
    let slices = ctx.info.file_slices(offset, buf.len() as u64)?;
    let mut cursor = 0usize;
    for FileSlice { file_idx, offset, len } in slices {
        let mut file = ctx.files[file_idx].write()?;
        file.handle.seek(std::io::SeekFrom::Start(offset))?;

        let target = &mut buf[cursor..cursor + len as usize];
        let mut filled = 0;
        while filled < target.len() {
            let n = file.handle.read(&mut target[filled..])?;
            if n == 0 {
                // Short file; the remainder stays zeroed.
                break;
            }
            filled += n;
        }
        cursor += len as usize;
    }
    debug_assert_eq!(cursor, buf.len());
    Ok(())
}

// A single block through the piece cache, reading and caching the whole
// piece on a miss.
fn cached_block(ctx: &Ctx, block: &BlockInfo) -> Result<Arc<Vec<u8>>> {
    let block_idx = block.idx_in_piece(ctx.info.block_len);

    if let Some(cached) = ctx.read_cache.lock()?.get(&block.piece_idx) {
        tracing::trace!("cache hit for piece {}", block.piece_idx);
        if block_idx < cached.len() {
            return Ok(Arc::clone(&cached[block_idx]));
        }
    }

    let piece_len = ctx.info.piece_length(block.piece_idx);
    let mut buf = vec![0u8; piece_len];
    read_range(ctx, ctx.info.piece_abs_offset(block.piece_idx), &mut buf)?;

    let piece: Vec<Arc<Vec<u8>>> = buf
        .chunks(ctx.info.block_len)
        .map(|chunk| Arc::new(chunk.to_vec()))
        .collect();
    let out = Arc::clone(&piece[block_idx]);
    ctx.read_cache.lock()?.put(block.piece_idx, piece);
    Ok(out)
}
