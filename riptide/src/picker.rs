use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use crate::{
    block::BlockInfo,
    masks::{BitMask, BlockMask},
    store::StoreInfo,
    Bitfield,
};

// Outcome of validating an arriving PIECE payload against the masks.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockAccept {
    // New block, sub-index within its piece.
    Fresh(usize),
    // Block bytes we already hold; harmless during endgame or after a
    // choke/unchoke race.
    Duplicate(usize),
    // Geometry is wrong: misaligned offset or bogus length.
    Invalid,
}

// Piece and block bookkeeping for one torrent: which pieces are verified on
// disk, which blocks are present, which are reserved by a connection, and
// how rare every piece is across the swarm. Shared by the coordinator and
// its peer sessions behind the context lock.
#[derive(Debug)]
pub struct Picker {

    // Completed, hash-verified pieces.
    piecemask: BitMask,

    // Blocks durably on disk. Bits of complete pieces are stale and unused.
    blockmask: BlockMask,

    // Blocks currently requested from some peer. Single-owner outside
    // endgame, set-union within it.
    blockmask_req: BlockMask,

    // Per-piece count of connected peers advertising the piece.
    availability: Vec<u32>,

    pieces_have_count: usize,

    endgame: bool,

    download_complete: bool,

}

impl Picker {

    pub fn new(info: &StoreInfo) -> Self {
        let piece_count = info.num_pieces;
        Self {
            piecemask: BitMask::new(piece_count),
            blockmask: BlockMask::new(piece_count, info.piece_len, info.last_piece_len, info.block_len),
            blockmask_req: BlockMask::new(piece_count, info.piece_len, info.last_piece_len, info.block_len),
            availability: vec![0; piece_count],
            pieces_have_count: 0,
            endgame: false,
            download_complete: false,
        }
    }

    // Replace our piecemask wholesale, e.g. after startup validation or
    // resume. Block bits of incomplete pieces start over.
    pub fn set_piecemask(&mut self, piecemask: BitMask) {
        debug_assert_eq!(piecemask.bitlen(), self.piecemask.bitlen());
        self.pieces_have_count = piecemask.popcount();
        self.download_complete = self.pieces_have_count == piecemask.bitlen();
        self.piecemask = piecemask;
    }

    pub fn restore_blockmask(&mut self, blockmask: BlockMask) {
        self.blockmask = blockmask;
    }

    pub fn piecemask(&self) -> &BitMask {
        &self.piecemask
    }

    pub fn blockmask(&self) -> &BlockMask {
        &self.blockmask
    }

    pub fn blockmask_req(&self) -> &BlockMask {
        &self.blockmask_req
    }

    pub fn num_pieces(&self) -> usize {
        self.piecemask.bitlen()
    }

    pub fn pieces_have_count(&self) -> usize {
        self.pieces_have_count
    }

    pub fn pieces_missing(&self) -> usize {
        self.num_pieces() - self.pieces_have_count
    }

    pub fn have_piece(&self, idx: usize) -> bool {
        self.piecemask.get(idx)
    }

    pub fn is_complete(&self) -> bool {
        self.download_complete
    }

    pub fn endgame(&self) -> bool {
        self.endgame
    }

    // Flips endgame on once few enough pieces remain. Never flips back.
    pub fn update_endgame(&mut self, threshold: usize) -> bool {
        if !self.endgame && !self.download_complete && self.pieces_missing() < threshold {
            tracing::info!("entering endgame, {} pieces missing", self.pieces_missing());
            self.endgame = true;
        }
        self.endgame
    }

    pub fn availability(&self, idx: usize) -> u32 {
        self.availability[idx]
    }

    // A HAVE message landed; returns true when the piece makes the peer
    // interesting.
    pub fn piece_available(&mut self, idx: usize) -> bool {
        self.availability[idx] += 1;
        !self.have_piece(idx)
    }

    // Fold a whole peer bitfield into the availability counters; returns
    // true when the peer has anything we lack.
    pub fn register_bitfield(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.num_pieces());
        let mut interested = false;
        for (idx, bit) in bf.iter().enumerate() {
            if *bit {
                self.availability[idx] += 1;
                if !self.have_piece(idx) {
                    interested = true;
                }
            }
        }
        interested
    }

    // A connection closed; its availability contribution leaves with it.
    pub fn unregister_bitfield(&mut self, bf: &Bitfield) {
        debug_assert_eq!(bf.len(), self.num_pieces());
        for (idx, bit) in bf.iter().enumerate() {
            if *bit {
                debug_assert!(self.availability[idx] > 0);
                self.availability[idx] = self.availability[idx].saturating_sub(1);
            }
        }
    }

    // Whether the piece still has blocks that are neither on disk nor
    // reserved (reservations don't count during endgame).
    pub fn query_piece_wanted(&self, idx: usize) -> bool {
        if self.have_piece(idx) {
            return false;
        }
        (0..self.blockmask.blocks_in_piece(idx)).any(|sub| {
            !self.blockmask.get(idx, sub)
                && (!self.blockmask_req.get(idx, sub) || self.endgame)
        })
    }

    // Rarest-first piece preference: bucket the pieces we still need by
    // availability, shuffle within each bucket, concatenate ascending.
    // Strict availability is a suboptimal metric in one respect: it carries
    // no bias towards finishing mostly-complete files.
    fn pieces_preference(&self) -> Vec<usize> {
        let mut buckets: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for idx in 0..self.num_pieces() {
            if self.have_piece(idx) || self.availability[idx] == 0 {
                continue;
            }
            buckets.entry(self.availability[idx]).or_default().push(idx);
        }

        let mut rng = rand::thread_rng();
        let mut preference = Vec::new();
        for bucket in buckets.values_mut() {
            bucket.shuffle(&mut rng);
            preference.extend_from_slice(bucket);
        }
        preference
    }

    // Up to `count` pieces worth requesting from a peer advertising
    // `peer_mask`, in preference order.
    pub fn pieces_wanted_get(&self, peer_mask: &Bitfield, count: usize) -> Vec<usize> {
        if self.download_complete {
            return Vec::new();
        }

        self.pieces_preference()
            .into_iter()
            .filter(|&idx| peer_mask[idx] && self.query_piece_wanted(idx))
            .take(count)
            .collect()
    }

    // Try to reserve block (piece, sub) for a connection. Outside endgame a
    // block has exactly one owner; during endgame reservations are a
    // set-union and only the caller's own pending set gates duplicates.
    pub fn try_reserve(&mut self, piece: usize, sub: usize) -> bool {
        if self.have_piece(piece) || self.blockmask.get(piece, sub) {
            return false;
        }
        if self.blockmask_req.get(piece, sub) && !self.endgame {
            return false;
        }
        self.blockmask_req.set(piece, sub, true);
        true
    }

    // Hand back a reservation without data, e.g. choke, reject or close.
    pub fn release_block(&mut self, piece: usize, sub: usize) {
        self.blockmask_req.set(piece, sub, false);
    }

    // Validate an arriving PIECE payload. Alignment and length must fit the
    // torrent geometry; duplicate data is only acceptable in endgame or when
    // `tolerate_duplicate` covers a snub/choke race.
    pub fn accept_block(&self, block: &BlockInfo, tolerate_duplicate: bool) -> BlockAccept {
        let b = self.blockmask.block_length;

        if block.piece_idx >= self.num_pieces() || block.offset % b != 0 {
            return BlockAccept::Invalid;
        }
        let piece_len = if block.piece_idx == self.num_pieces() - 1 {
            self.blockmask.piece_length_last
        } else {
            self.blockmask.piece_length
        };
        let full_block = block.len == b;
        let tail_block = block.offset + block.len == piece_len && block.len < b;
        if block.offset >= piece_len || !(full_block || tail_block) {
            return BlockAccept::Invalid;
        }

        let sub = block.idx_in_piece(b);
        if self.blockmask.get(block.piece_idx, sub) {
            if self.endgame || tolerate_duplicate {
                BlockAccept::Duplicate(sub)
            } else {
                BlockAccept::Invalid
            }
        } else {
            BlockAccept::Fresh(sub)
        }
    }

    // A block write completed. The reservation clears unconditionally here
    // rather than at receipt: it keeps endgame's unioned reservations
    // consistent and stops the block being re-picked while its write is
    // still in flight. True when the piece just became fully present and is
    // ready for hash verification.
    pub fn mark_block_written(&mut self, piece: usize, sub: usize) -> bool {
        self.blockmask_req.set(piece, sub, false);
        if self.have_piece(piece) {
            return false;
        }
        if self.blockmask.get(piece, sub) {
            // Duplicate write race; the bits already say everything.
            tracing::debug!("block p{} s{} written twice", piece, sub);
            return false;
        }
        self.blockmask.set(piece, sub, true);
        self.blockmask.piece_complete(piece)
    }

    // Hash verdict for a freshly completed piece. A mismatch clears the
    // piece's blocks so they are downloaded again; nobody gets banned since
    // the bad block cannot be attributed. Returns true when the whole
    // torrent just completed.
    pub fn piece_verified(&mut self, idx: usize, valid: bool) -> bool {
        if !valid {
            tracing::warn!("piece {} failed hash verification, discarding its blocks", idx);
            self.blockmask.clear_piece(idx);
            return false;
        }

        if !self.have_piece(idx) {
            self.piecemask.set(idx, true);
            self.pieces_have_count += 1;
        }
        debug_assert_eq!(self.pieces_have_count, self.piecemask.popcount());

        if self.pieces_have_count == self.num_pieces() {
            self.download_complete = true;
        }
        self.download_complete
    }

    // Our piecemask as a wire bitfield.
    pub fn bitfield(&self) -> Bitfield {
        self.piecemask.to_bitfield()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileInfo, StoreInfo};
    use std::path::PathBuf;

    fn store_info(total: u64, piece_len: usize, block_len: usize) -> StoreInfo {
        let num_pieces = (total as usize + piece_len - 1) / piece_len;
        StoreInfo {
            name: "picker-test".into(),
            total_len: total,
            piece_len,
            last_piece_len: (total - (piece_len as u64 * (num_pieces as u64 - 1))) as usize,
            num_pieces,
            block_len,
            files: vec![FileInfo { path: PathBuf::from("t"), length: total, offset: 0 }],
            output_dir: PathBuf::from("out"),
        }
    }

    fn full_mask(n: usize) -> Bitfield {
        Bitfield::repeat(true, n)
    }

    #[test]
    fn test_rarest_first_ordering() {
        let info = store_info(8 * 1024, 1024, 512);
        let mut picker = Picker::new(&info);

        // Pieces 0..4 seen twice, 4..8 once.
        let mut common = Bitfield::repeat(false, 8);
        for i in 0..4 { common.set(i, true); }
        picker.register_bitfield(&full_mask(8));
        picker.register_bitfield(&common);

        let wanted = picker.pieces_wanted_get(&full_mask(8), 8);
        assert_eq!(wanted.len(), 8);
        // The four rare pieces come first, in some shuffled order.
        let rare: std::collections::HashSet<usize> = wanted[..4].iter().copied().collect();
        assert_eq!(rare, (4..8).collect());
    }

    #[test]
    fn test_wanted_respects_peer_mask_and_count() {
        let info = store_info(8 * 1024, 1024, 512);
        let mut picker = Picker::new(&info);
        picker.register_bitfield(&full_mask(8));

        let mut peer_mask = Bitfield::repeat(false, 8);
        peer_mask.set(2, true);
        peer_mask.set(5, true);
        let wanted = picker.pieces_wanted_get(&peer_mask, 8);
        let as_set: std::collections::HashSet<usize> = wanted.iter().copied().collect();
        assert_eq!(as_set, [2, 5].into_iter().collect());

        assert_eq!(picker.pieces_wanted_get(&full_mask(8), 3).len(), 3);
    }

    #[test]
    fn test_reserve_single_owner_outside_endgame() {
        let info = store_info(4 * 1024, 1024, 512);
        let mut picker = Picker::new(&info);
        picker.register_bitfield(&full_mask(4));

        assert!(picker.try_reserve(0, 0));
        assert!(!picker.try_reserve(0, 0));
        assert!(picker.blockmask_req().get(0, 0));

        picker.release_block(0, 0);
        assert!(picker.try_reserve(0, 0));
    }

    #[test]
    fn test_endgame_reservation_union() {
        let info = store_info(4 * 1024, 1024, 512);
        let mut picker = Picker::new(&info);
        picker.register_bitfield(&full_mask(4));
        picker.update_endgame(10);
        assert!(picker.endgame());

        assert!(picker.try_reserve(1, 0));
        // A second connection may request the same block in endgame.
        assert!(picker.try_reserve(1, 0));

        // The write completion clears the unioned reservation once and for
        // all.
        picker.mark_block_written(1, 0);
        assert!(!picker.blockmask_req().get(1, 0));
    }

    #[test]
    fn test_accept_block_geometry() {
        // 2049 bytes, P=1024, B=512: last piece is one byte.
        let info = store_info(2049, 1024, 512);
        let picker = Picker::new(&info);

        assert_eq!(picker.accept_block(&BlockInfo { piece_idx: 0, offset: 0, len: 512 }, false), BlockAccept::Fresh(0));
        assert_eq!(picker.accept_block(&BlockInfo { piece_idx: 0, offset: 512, len: 512 }, false), BlockAccept::Fresh(1));
        // Last piece accepts its true short length.
        assert_eq!(picker.accept_block(&BlockInfo { piece_idx: 2, offset: 0, len: 1 }, false), BlockAccept::Fresh(0));

        // Misaligned offset.
        assert_eq!(picker.accept_block(&BlockInfo { piece_idx: 0, offset: 100, len: 512 }, false), BlockAccept::Invalid);
        // Bogus length.
        assert_eq!(picker.accept_block(&BlockInfo { piece_idx: 0, offset: 0, len: 100 }, false), BlockAccept::Invalid);
        // Offset past the short last piece.
        assert_eq!(picker.accept_block(&BlockInfo { piece_idx: 2, offset: 512, len: 1 }, false), BlockAccept::Invalid);
    }

    #[test]
    fn test_duplicate_block_endgame_only() {
        let info = store_info(2048, 1024, 512);
        let mut picker = Picker::new(&info);

        let block = BlockInfo { piece_idx: 0, offset: 0, len: 512 };
        assert!(!picker.mark_block_written(0, 0));

        assert_eq!(picker.accept_block(&block, false), BlockAccept::Invalid);
        assert_eq!(picker.accept_block(&block, true), BlockAccept::Duplicate(0));

        picker.update_endgame(10);
        assert_eq!(picker.accept_block(&block, false), BlockAccept::Duplicate(0));
    }

    #[test]
    fn test_piece_verification_failure_clears_blocks() {
        let info = store_info(2048, 1024, 512);
        let mut picker = Picker::new(&info);

        assert!(!picker.mark_block_written(0, 0));
        assert!(picker.mark_block_written(0, 1), "piece should be complete");

        let complete = picker.piece_verified(0, false);
        assert!(!complete);
        assert!(!picker.have_piece(0));
        assert!(!picker.blockmask().get(0, 0));
        assert!(!picker.blockmask().get(0, 1));
        assert!(picker.query_piece_wanted(0) || picker.availability(0) == 0);
    }

    #[test]
    fn test_download_completion() {
        let info = store_info(2048, 1024, 512);
        let mut picker = Picker::new(&info);

        for piece in 0..2 {
            picker.mark_block_written(piece, 0);
            picker.mark_block_written(piece, 1);
            let done = picker.piece_verified(piece, true);
            assert_eq!(done, piece == 1);
        }
        assert!(picker.is_complete());
        assert_eq!(picker.pieces_have_count(), 2);
        assert!(picker.piecemask().is_full());
        assert!(picker.pieces_wanted_get(&full_mask(2), 4).is_empty());
    }

    #[test]
    fn test_availability_register_unregister() {
        let info = store_info(4 * 1024, 1024, 512);
        let mut picker = Picker::new(&info);

        let bf = full_mask(4);
        picker.register_bitfield(&bf);
        picker.register_bitfield(&bf);
        assert_eq!(picker.availability(2), 2);

        picker.unregister_bitfield(&bf);
        assert_eq!(picker.availability(2), 1);
        assert!(picker.piece_available(2));
        assert_eq!(picker.availability(2), 2);
    }
}
