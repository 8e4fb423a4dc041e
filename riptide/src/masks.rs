use crate::Bitfield;

// General purpose bitmask, MSB-first within each byte so the raw bytes are
// wire-compatible with BITFIELD messages. The backing storage is kept at
// whole-byte length; bits past `bitlen` are never read or written by the
// accessors and round-trip verbatim through serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMask {

    bits: Bitfield,

    bitlen: usize,

}

impl BitMask {

    pub fn new(bitlen: usize) -> Self {
        let bytes = (bitlen + 7) / 8;
        Self {
            bits: Bitfield::repeat(false, bytes * 8),
            bitlen,
        }
    }

    // A mask with the first n bits set and any trailing bits zero.
    pub fn set_full(bitlen: usize) -> Self {
        let mut mask = Self::new(bitlen);
        for i in 0..bitlen {
            mask.bits.set(i, true);
        }
        mask
    }

    pub fn from_bytes(raw: &[u8], bitlen: usize) -> Self {
        debug_assert!(raw.len() * 8 >= bitlen, "mask byte slice too short");
        Self {
            bits: Bitfield::from_slice(raw),
            bitlen,
        }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.bitlen, "bit index out of range");
        self.bits[idx]
    }

    #[inline]
    pub fn set(&mut self, idx: usize, val: bool) {
        assert!(idx < self.bitlen, "bit index out of range");
        self.bits.set(idx, val);
    }

    pub fn popcount(&self) -> usize {
        self.bits[..self.bitlen].count_ones()
    }

    #[inline]
    pub fn bitlen(&self) -> usize {
        self.bitlen
    }

    pub fn is_full(&self) -> bool {
        self.popcount() == self.bitlen
    }

    pub fn any(&self) -> bool {
        self.bits[..self.bitlen].any()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    // The in-range bits as a wire bitfield.
    pub fn to_bitfield(&self) -> Bitfield {
        let mut bf = self.bits.clone();
        bf.truncate(self.bitlen);
        bf
    }
}

// Block-granular mask over a whole torrent. Block (p, s) maps to linear bit
// p * blocks_per_piece + s; the last piece only contributes
// blocks_per_piece_last bits.
#[derive(Debug, Clone)]
pub struct BlockMask {

    mask: BitMask,

    pub piece_count: usize,

    pub piece_length: usize,

    pub piece_length_last: usize,

    pub block_length: usize,

    pub blocks_per_piece: usize,

    pub blocks_per_piece_last: usize,

}

impl BlockMask {

    pub fn new(
        piece_count: usize,
        piece_length: usize,
        piece_length_last: usize,
        block_length: usize,
    ) -> Self {
        let blocks_per_piece = crate::block::num_blocks(piece_length, block_length);
        let blocks_per_piece_last = crate::block::num_blocks(piece_length_last, block_length);
        assert!(0 < blocks_per_piece_last && blocks_per_piece_last <= blocks_per_piece);

        let bitlen = blocks_per_piece * (piece_count - 1) + blocks_per_piece_last;
        Self {
            mask: BitMask::new(bitlen),
            piece_count,
            piece_length,
            piece_length_last,
            block_length,
            blocks_per_piece,
            blocks_per_piece_last,
        }
    }

    pub fn from_bytes(
        raw: &[u8],
        piece_count: usize,
        piece_length: usize,
        piece_length_last: usize,
        block_length: usize,
    ) -> Self {
        let mut mask = Self::new(piece_count, piece_length, piece_length_last, block_length);
        mask.mask = BitMask::from_bytes(raw, mask.mask.bitlen());
        mask
    }

    #[inline]
    fn bit_index(&self, piece: usize, sub: usize) -> usize {
        debug_assert!(piece < self.piece_count);
        debug_assert!(sub < self.blocks_in_piece(piece));
        piece * self.blocks_per_piece + sub
    }

    pub fn blocks_in_piece(&self, piece: usize) -> usize {
        if piece == self.piece_count - 1 {
            self.blocks_per_piece_last
        } else {
            self.blocks_per_piece
        }
    }

    #[inline]
    pub fn get(&self, piece: usize, sub: usize) -> bool {
        self.mask.get(self.bit_index(piece, sub))
    }

    #[inline]
    pub fn set(&mut self, piece: usize, sub: usize, val: bool) {
        self.mask.set(self.bit_index(piece, sub), val);
    }

    // True when every block bit of the piece is set.
    pub fn piece_complete(&self, piece: usize) -> bool {
        (0..self.blocks_in_piece(piece)).all(|sub| self.get(piece, sub))
    }

    pub fn clear_piece(&mut self, piece: usize) {
        for sub in 0..self.blocks_in_piece(piece) {
            self.set(piece, sub, false);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.mask.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_popcount() {
        let mut mask = BitMask::new(21);
        assert_eq!(mask.popcount(), 0);

        let set = [0usize, 7, 8, 15, 20];
        for &i in &set {
            mask.set(i, true);
        }
        for i in 0..21 {
            assert_eq!(mask.get(i), set.contains(&i));
        }
        assert_eq!(mask.popcount(), set.len());
        assert_eq!(mask.popcount(), (0..21).filter(|&i| mask.get(i)).count());

        mask.set(7, false);
        assert!(!mask.get(7));
        assert_eq!(mask.popcount(), set.len() - 1);
    }

    #[test]
    fn test_set_full_trailing_bits_zero() {
        let mask = BitMask::set_full(10);
        assert_eq!(mask.popcount(), 10);
        assert!(mask.is_full());
        // 10 bits MSB-first: 0xff, 0xc0.
        assert_eq!(mask.as_bytes(), &[0xff, 0xc0]);
    }

    #[test]
    fn test_byte_round_trip_preserves_tail() {
        // Tail bits beyond bitlen carry junk that must survive untouched.
        let raw = [0xa5u8, 0xff];
        let mut mask = BitMask::from_bytes(&raw, 9);
        assert_eq!(mask.as_bytes(), &raw);
        assert_eq!(mask.popcount(), 5);

        mask.set(0, false);
        assert_eq!(mask.as_bytes(), &[0x25, 0xff]);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_get() {
        let mask = BitMask::new(9);
        mask.get(9);
    }

    #[test]
    fn test_blockmask_geometry() {
        // 3 pieces of 1024 bytes, last piece 1 byte, blocks of 512.
        let mask = BlockMask::new(3, 1024, 1, 512);
        assert_eq!(mask.blocks_per_piece, 2);
        assert_eq!(mask.blocks_per_piece_last, 1);
        assert_eq!(mask.blocks_in_piece(0), 2);
        assert_eq!(mask.blocks_in_piece(2), 1);
        assert!(mask.blocks_per_piece_last <= mask.blocks_per_piece);
    }

    #[test]
    fn test_blockmask_piece_complete() {
        let mut mask = BlockMask::new(3, 1024, 1, 512);
        assert!(!mask.piece_complete(0));

        mask.set(0, 0, true);
        assert!(!mask.piece_complete(0));
        mask.set(0, 1, true);
        assert!(mask.piece_complete(0));

        // Last piece has a single block.
        mask.set(2, 0, true);
        assert!(mask.piece_complete(2));

        mask.clear_piece(0);
        assert!(!mask.piece_complete(0));
        assert!(mask.piece_complete(2));
    }

    #[test]
    fn test_blockmask_uneven_piece() {
        // Piece length not a multiple of the block length.
        let mask = BlockMask::new(2, 1000, 300, 512);
        assert_eq!(mask.blocks_per_piece, 2);
        assert_eq!(mask.blocks_per_piece_last, 1);
    }
}
