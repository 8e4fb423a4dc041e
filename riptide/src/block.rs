use std::sync::Arc;

// Identifies a block within a torrent by piece index, byte offset into the
// piece and length.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {
    // Index of the block within its piece, given the request granularity.
    #[inline]
    pub fn idx_in_piece(&self, block_length: usize) -> usize {
        self.offset / block_length
    }
}

// Block payloads served from the disk cache share the underlying buffer,
// blocks arriving off the wire own theirs.
#[derive(Debug, Clone)]
pub enum BlockData {
    Owned(Vec<u8>),
    Cached(Arc<Vec<u8>>),
}

impl BlockData {

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            BlockData::Owned(data) => data,
            BlockData::Cached(data) => data,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }
}

impl PartialEq for BlockData {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for BlockData {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {

    pub piece_idx: usize,

    pub offset: usize,

    pub data: BlockData,

}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.len(),
        }
    }
}

pub fn block_len(piece_len: usize, block_idx: usize, block_length: usize) -> usize {
    block_length.min(piece_len - (block_idx * block_length))
}

pub fn num_blocks(piece_len: usize, block_length: usize) -> usize {
    (piece_len + (block_length - 1)) / block_length
}
