// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod disk;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod piece_map;
mod storage_info;
mod torrent;
pub mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use peer::codec;
pub use storage_info::FileInfo;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian values, but within
/// the crate we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index within the torrent's file list.
pub type FileIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector in which the most significant bit of the first
/// byte corresponds to piece 0, the next bit to piece 1, and so on (e.g.
/// `0b1010_0000` means the holder has pieces 0 and 2). A set bit means the
/// holder possesses that piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// The canonical request size and thus the only block length we deal with,
/// except for a possibly shorter block at the end of a piece: 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happens at this block level of
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset of the block within its piece.
    pub offset: u32,
    /// The block's length in bytes, at most 16 KiB (0x4000 bytes).
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the
    /// canonical block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        // we need to use "lower than or equal" as this may be the last block
        // in piece, which may be shorter than the canonical block length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Returns the length of the block at the given index in a piece of the given
/// length.
///
/// All blocks are 16 KiB, except for the piece's trailing block, which is
/// whatever remains of the piece.
///
/// # Panics
///
/// Panics if the block index is not within the piece.
pub(crate) fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_offset = block_index as u32 * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // the last block may be shorter than the canonical block length, so round
    // up before dividing
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // a piece length that is an exact multiple of the canonical block length
    const EXACT_PIECE_LEN: u32 = 3 * BLOCK_LEN;

    // a piece length with a 500 byte tail beyond the nearest exact multiple
    const TAIL: u32 = 500;
    const TAILED_PIECE_LEN: u32 = 3 * BLOCK_LEN + TAIL;

    #[test]
    fn block_len_of_exact_multiple_piece() {
        assert_eq!(block_len(EXACT_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(EXACT_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(EXACT_PIECE_LEN, 2), BLOCK_LEN);
    }

    #[test]
    fn block_len_of_tailed_piece() {
        assert_eq!(block_len(TAILED_PIECE_LEN, 2), BLOCK_LEN);
        assert_eq!(block_len(TAILED_PIECE_LEN, 3), TAIL);
    }

    #[test]
    fn block_len_of_piece_shorter_than_block() {
        // a torrent whose total size is below 16 KiB has a single block of
        // the full piece length
        assert_eq!(block_len(6, 0), 6);
    }

    #[test]
    #[should_panic]
    fn block_len_panics_past_piece_end() {
        block_len(EXACT_PIECE_LEN, 3);
    }

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(block_count(EXACT_PIECE_LEN), 3);
        assert_eq!(block_count(TAILED_PIECE_LEN), 4);
        assert_eq!(block_count(1), 1);
    }
}
