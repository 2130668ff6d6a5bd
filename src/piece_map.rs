//! The shared piece map: the single source of truth for what has been
//! downloaded, what is in flight and to whom, and what to request next.
//!
//! Sessions pull work out of the map with [`PieceMap::next_request`] and
//! push received blocks back with [`PieceMap::on_block`]; the coordinator
//! applies the writer's verification verdicts and reaps timed out requests.
//! The map holds no references to sessions: peers are identified by their
//! remote address in every record.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{
    block_count, block_len, storage_info::StorageInfo, Bitfield, BlockInfo,
    PieceIndex, BLOCK_LEN,
};

/// What became of a block handed to [`PieceMap::on_block`].
#[derive(Debug, PartialEq)]
pub(crate) enum BlockReceipt {
    /// The block was a duplicate, out of bounds, or for a piece that no
    /// longer needs it. Dropped without effect.
    Ignored,
    /// The block was stored; the piece still has missing blocks.
    Accepted,
    /// The block completed its piece. The assembled piece buffer is handed
    /// over for hash verification.
    PieceComplete { data: Vec<u8> },
}

/// The download status of a single piece.
///
/// The happy path is `Missing → InFlight → Verifying → Complete`; a failed
/// hash check resets `Verifying` back to `Missing`.
#[derive(Clone, Copy, Debug, PartialEq)]
enum PieceStatus {
    /// No block of the piece has been requested or received.
    Missing,
    /// At least one block is outstanding or buffered.
    InFlight,
    /// All blocks were received and the buffer was handed to the writer; the
    /// verdict is pending. Not eligible for selection.
    Verifying,
    /// The piece was verified and written to disk.
    Complete,
}

struct Piece {
    status: PieceStatus,
    /// The received blocks keyed by their offset within the piece. Also
    /// serves as the received-block bitmap: a key's presence means the block
    /// is in. Drained when the piece is handed over for verification.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The peers that contributed at least one block to the current download
    /// attempt of this piece, kept for the integrity penalty.
    contributors: Vec<SocketAddr>,
}

struct OutstandingRequest {
    addr: SocketAddr,
    block: BlockInfo,
    requested_at: Instant,
}

pub(crate) struct PieceMap {
    pieces: Vec<Piece>,
    /// The local have-bitfield: a bit is set iff the piece is `Complete`.
    own_pieces: Bitfield,
    /// What each connected peer has advertised via bitfield and have
    /// messages.
    peer_pieces: HashMap<SocketAddr, Bitfield>,
    /// Requests sent to peers whose blocks haven't arrived yet. A block
    /// appears here at most once, so it is outstanding to at most one peer.
    outstanding: Vec<OutstandingRequest>,
    piece_len: u32,
    last_piece_len: u32,
    missing_count: usize,
}

impl PieceMap {
    pub fn new(storage: &StorageInfo) -> Self {
        let pieces = (0..storage.piece_count)
            .map(|_| Piece {
                status: PieceStatus::Missing,
                blocks: BTreeMap::new(),
                contributors: Vec::new(),
            })
            .collect();
        Self {
            pieces,
            own_pieces: Bitfield::repeat(false, storage.piece_count),
            peer_pieces: HashMap::new(),
            outstanding: Vec::new(),
            piece_len: storage.piece_len,
            last_piece_len: storage.last_piece_len,
            missing_count: storage.piece_count,
        }
    }

    /// Promotes a piece found intact on disk during the resume scan. Must
    /// only be used before any session is opened.
    pub fn mark_resumed(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        debug_assert_eq!(piece.status, PieceStatus::Missing);
        piece.status = PieceStatus::Complete;
        self.own_pieces.set(index, true);
        self.missing_count -= 1;
    }

    /// Records the full piece availability of a peer. The bitfield must
    /// already be validated and truncated to the torrent's piece count.
    pub fn register_peer_bitfield(&mut self, addr: SocketAddr, pieces: Bitfield) {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        self.peer_pieces.insert(addr, pieces);
    }

    /// Records that a peer announced possession of a single piece.
    pub fn register_peer_have(&mut self, addr: SocketAddr, index: PieceIndex) {
        debug_assert!(index < self.pieces.len());
        let piece_count = self.pieces.len();
        let pieces = self
            .peer_pieces
            .entry(addr)
            .or_insert_with(|| Bitfield::repeat(false, piece_count));
        pieces.set(index, true);
    }

    /// Forgets a peer: drops its advertised pieces and releases all requests
    /// outstanding to it. Called by session teardown; idempotent.
    pub fn unregister_peer(&mut self, addr: SocketAddr) {
        self.peer_pieces.remove(&addr);
        self.outstanding.retain(|request| request.addr != addr);
    }

    /// Returns true if the peer advertises at least one piece that is not
    /// yet complete. This is the session's interest predicate.
    pub fn peer_has_missing_piece(&self, addr: SocketAddr) -> bool {
        match self.peer_pieces.get(&addr) {
            Some(pieces) => self
                .pieces
                .iter()
                .enumerate()
                .any(|(index, piece)| {
                    piece.status != PieceStatus::Complete && pieces[index]
                }),
            None => false,
        }
    }

    /// Selects the next block to request from the given peer and records it
    /// as outstanding.
    ///
    /// The selection is sequential: the lowest indexed piece that is not
    /// complete or under verification, that the peer advertises, and that
    /// has a block neither received nor outstanding; within the piece,
    /// blocks are taken in ascending offset order. Returns `None` when the
    /// peer can offer no progress right now.
    pub fn next_request(
        &mut self,
        addr: SocketAddr,
        now: Instant,
    ) -> Option<BlockInfo> {
        let selected = {
            let peer_pieces = self.peer_pieces.get(&addr)?;
            let mut selected = None;
            'pieces: for (index, piece) in self.pieces.iter().enumerate() {
                if matches!(
                    piece.status,
                    PieceStatus::Complete | PieceStatus::Verifying
                ) || !peer_pieces[index]
                {
                    continue;
                }
                let piece_len = self.piece_len_of(index);
                for block_index in 0..block_count(piece_len) {
                    let offset = block_index as u32 * BLOCK_LEN;
                    if piece.blocks.contains_key(&offset)
                        || self.is_outstanding(index, offset)
                    {
                        continue;
                    }
                    selected = Some(BlockInfo {
                        piece_index: index,
                        offset,
                        len: block_len(piece_len, block_index),
                    });
                    break 'pieces;
                }
            }
            selected?
        };

        self.pieces[selected.piece_index].status = PieceStatus::InFlight;
        self.outstanding.push(OutstandingRequest {
            addr,
            block: selected,
            requested_at: now,
        });
        Some(selected)
    }

    /// Stores a block received from a peer.
    ///
    /// The matching outstanding entry is evicted no matter which peer it was
    /// issued to. A block nobody requested is still accepted if it fills a
    /// missing slot of an incomplete piece; anything else is dropped. When
    /// the last missing block of a piece arrives, the piece's buffer is
    /// assembled and returned for verification and the piece stops being
    /// eligible for selection until the verdict comes back.
    pub fn on_block(
        &mut self,
        addr: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> BlockReceipt {
        if piece_index >= self.pieces.len() {
            log::warn!("block for invalid piece {} dropped", piece_index);
            return BlockReceipt::Ignored;
        }
        let piece_len = self.piece_len_of(piece_index);
        if offset % BLOCK_LEN != 0 || offset >= piece_len {
            log::warn!(
                "block at invalid offset {} in piece {} dropped",
                offset,
                piece_index
            );
            return BlockReceipt::Ignored;
        }
        let block_index = (offset / BLOCK_LEN) as usize;
        if data.len() as u32 != block_len(piece_len, block_index) {
            log::warn!(
                "block of wrong length {} in piece {} dropped",
                data.len(),
                piece_index
            );
            return BlockReceipt::Ignored;
        }

        self.outstanding.retain(|request| {
            request.block.piece_index != piece_index
                || request.block.offset != offset
        });

        let piece = &mut self.pieces[piece_index];
        if matches!(
            piece.status,
            PieceStatus::Complete | PieceStatus::Verifying
        ) || piece.blocks.contains_key(&offset)
        {
            log::debug!(
                "duplicate block at offset {} in piece {} dropped",
                offset,
                piece_index
            );
            return BlockReceipt::Ignored;
        }

        piece.status = PieceStatus::InFlight;
        piece.blocks.insert(offset, data);
        if !piece.contributors.contains(&addr) {
            piece.contributors.push(addr);
        }

        if piece.blocks.len() == block_count(piece_len) {
            piece.status = PieceStatus::Verifying;
            let mut data = Vec::with_capacity(piece_len as usize);
            // BTreeMap iteration is offset ordered, so this concatenation
            // reassembles the piece
            for block in piece.blocks.values() {
                data.extend_from_slice(block);
            }
            piece.blocks.clear();
            BlockReceipt::PieceComplete { data }
        } else {
            BlockReceipt::Accepted
        }
    }

    /// Applies a successful verification verdict: the piece is complete and
    /// its have-bit is set.
    pub fn on_verified(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        debug_assert_eq!(piece.status, PieceStatus::Verifying);
        piece.status = PieceStatus::Complete;
        piece.contributors.clear();
        self.own_pieces.set(index, true);
        self.missing_count -= 1;
    }

    /// Applies a failed verification verdict: the piece is reset to missing
    /// with an empty buffer, and the peers that contributed to the failed
    /// attempt are returned so the coordinator can penalise them.
    pub fn on_verify_failed(&mut self, index: PieceIndex) -> Vec<SocketAddr> {
        let piece = &mut self.pieces[index];
        debug_assert_eq!(piece.status, PieceStatus::Verifying);
        piece.status = PieceStatus::Missing;
        piece.blocks.clear();
        std::mem::take(&mut piece.contributors)
    }

    /// Releases every outstanding request older than `ttl`, returning the
    /// affected peers and blocks so their sessions can drop the entries from
    /// their own pipeline accounting. Calling this twice with the same clock
    /// reaps nothing the second time.
    pub fn reap_timeouts(
        &mut self,
        now: Instant,
        ttl: Duration,
    ) -> Vec<(SocketAddr, BlockInfo)> {
        let mut reaped = Vec::new();
        self.outstanding.retain(|request| {
            if now.duration_since(request.requested_at) >= ttl {
                reaped.push((request.addr, request.block));
                false
            } else {
                true
            }
        });
        for (addr, block) in reaped.iter() {
            log::debug!("request {:?} to peer {} timed out", block, addr);
        }
        reaped
    }

    /// Releases all requests outstanding to the given peer, e.g. because it
    /// choked us and is not obligated to serve them anymore.
    pub fn release_requests(&mut self, addr: SocketAddr) -> Vec<BlockInfo> {
        let mut released = Vec::new();
        self.outstanding.retain(|request| {
            if request.addr == addr {
                released.push(request.block);
                false
            } else {
                true
            }
        });
        released
    }

    /// True iff every piece is complete.
    pub fn is_complete(&self) -> bool {
        self.missing_count == 0
    }

    pub fn missing_count(&self) -> usize {
        self.missing_count
    }

    /// The local have-bitfield, sized exactly to the piece count.
    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    fn piece_len_of(&self, index: PieceIndex) -> u32 {
        if index + 1 == self.pieces.len() {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    fn is_outstanding(&self, piece_index: PieceIndex, offset: u32) -> bool {
        self.outstanding.iter().any(|request| {
            request.block.piece_index == piece_index
                && request.block.offset == offset
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    const PEER_A: &str = "1.2.3.4:51413";
    const PEER_B: &str = "5.6.7.8:51413";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    /// A map over 3 pieces: two of 2 blocks, a last piece of 1.5 blocks.
    fn map() -> PieceMap {
        let storage = StorageInfo {
            piece_count: 3,
            piece_len: 2 * BLOCK_LEN,
            last_piece_len: BLOCK_LEN + BLOCK_LEN / 2,
            download_len: 2 * 2 * BLOCK_LEN as u64 + (BLOCK_LEN + BLOCK_LEN / 2) as u64,
            download_dir: PathBuf::from("/"),
            files: Vec::new(),
        };
        PieceMap::new(&storage)
    }

    fn full_bitfield() -> Bitfield {
        Bitfield::repeat(true, 3)
    }

    /// Feeds the map a block of the right length for the slot.
    fn feed(
        map: &mut PieceMap,
        peer: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
    ) -> BlockReceipt {
        let piece_len = map.piece_len_of(piece_index);
        let len = block_len(piece_len, (offset / BLOCK_LEN) as usize);
        map.on_block(peer, piece_index, offset, vec![piece_index as u8; len as usize])
    }

    #[test]
    fn selection_is_sequential() {
        let mut map = map();
        let a = addr(PEER_A);
        map.register_peer_bitfield(a, full_bitfield());

        let now = Instant::now();
        let expected = [
            (0, 0, BLOCK_LEN),
            (0, BLOCK_LEN, BLOCK_LEN),
            (1, 0, BLOCK_LEN),
            (1, BLOCK_LEN, BLOCK_LEN),
            (2, 0, BLOCK_LEN),
            (2, BLOCK_LEN, BLOCK_LEN / 2),
        ];
        for &(piece_index, offset, len) in expected.iter() {
            assert_eq!(
                map.next_request(a, now),
                Some(BlockInfo {
                    piece_index,
                    offset,
                    len
                })
            );
        }
        // everything is outstanding now
        assert_eq!(map.next_request(a, now), None);
    }

    #[test]
    fn selection_skips_pieces_the_peer_lacks() {
        let mut map = map();
        let a = addr(PEER_A);
        let mut pieces = Bitfield::repeat(false, 3);
        pieces.set(1, true);
        map.register_peer_bitfield(a, pieces);

        let block = map.next_request(a, Instant::now()).unwrap();
        assert_eq!(block.piece_index, 1);
    }

    #[test]
    fn block_is_outstanding_to_at_most_one_peer() {
        let mut map = map();
        let (a, b) = (addr(PEER_A), addr(PEER_B));
        map.register_peer_bitfield(a, full_bitfield());
        map.register_peer_bitfield(b, full_bitfield());

        let now = Instant::now();
        let first = map.next_request(a, now).unwrap();
        let second = map.next_request(b, now).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn completed_piece_buffer_is_assembled_in_offset_order() {
        let mut map = map();
        let a = addr(PEER_A);
        map.register_peer_bitfield(a, full_bitfield());

        // deliver the two blocks of piece 0 out of order
        let second = map.on_block(a, 0, BLOCK_LEN, vec![2; BLOCK_LEN as usize]);
        assert_eq!(second, BlockReceipt::Accepted);
        match map.on_block(a, 0, 0, vec![1; BLOCK_LEN as usize]) {
            BlockReceipt::PieceComplete { data } => {
                assert_eq!(data.len(), 2 * BLOCK_LEN as usize);
                assert!(data[..BLOCK_LEN as usize].iter().all(|b| *b == 1));
                assert!(data[BLOCK_LEN as usize..].iter().all(|b| *b == 2));
            }
            receipt => panic!("expected piece completion, got {:?}", receipt),
        }

        // while the verdict is pending the piece cannot be selected, even
        // though its buffer has been drained
        assert_eq!(map.next_request(a, Instant::now()).unwrap().piece_index, 1);

        map.on_verified(0);
        assert!(map.own_pieces()[0]);
        assert_eq!(map.missing_count(), 2);
    }

    #[test]
    fn failed_verification_resets_the_piece() {
        let mut map = map();
        let a = addr(PEER_A);
        map.register_peer_bitfield(a, full_bitfield());

        feed(&mut map, a, 0, 0);
        feed(&mut map, a, 0, BLOCK_LEN);
        let contributors = map.on_verify_failed(0);
        assert_eq!(contributors, vec![a]);
        assert!(!map.own_pieces()[0]);

        // the piece is selectable from scratch again
        let block = map.next_request(a, Instant::now()).unwrap();
        assert_eq!((block.piece_index, block.offset), (0, 0));
    }

    #[test]
    fn unrequested_block_is_accepted_iff_it_fills_a_missing_slot() {
        let mut map = map();
        let a = addr(PEER_A);

        // nothing was requested, yet the block lands in piece 1
        assert_eq!(
            feed(&mut map, a, 1, BLOCK_LEN),
            BlockReceipt::Accepted
        );
        // a duplicate of the same block is dropped
        assert_eq!(feed(&mut map, a, 1, BLOCK_LEN), BlockReceipt::Ignored);
    }

    #[test]
    fn bogus_blocks_are_ignored() {
        let mut map = map();
        let a = addr(PEER_A);
        // invalid piece
        assert_eq!(
            map.on_block(a, 9, 0, vec![0; BLOCK_LEN as usize]),
            BlockReceipt::Ignored
        );
        // misaligned offset
        assert_eq!(
            map.on_block(a, 0, 1, vec![0; BLOCK_LEN as usize]),
            BlockReceipt::Ignored
        );
        // offset past the end of the shorter last piece
        assert_eq!(
            map.on_block(a, 2, 2 * BLOCK_LEN, vec![0; BLOCK_LEN as usize]),
            BlockReceipt::Ignored
        );
        // wrong length for the slot
        assert_eq!(map.on_block(a, 0, 0, vec![0; 3]), BlockReceipt::Ignored);
    }

    #[test]
    fn reaping_is_idempotent() {
        let mut map = map();
        let a = addr(PEER_A);
        map.register_peer_bitfield(a, full_bitfield());

        let requested_at = Instant::now();
        let block = map.next_request(a, requested_at).unwrap();

        let later = requested_at + Duration::from_secs(31);
        let ttl = Duration::from_secs(30);
        assert_eq!(map.reap_timeouts(later, ttl), vec![(a, block)]);
        // same clock, nothing left to reap
        assert_eq!(map.reap_timeouts(later, ttl), vec![]);

        // the reaped block is selectable again
        assert_eq!(map.next_request(a, later), Some(block));
    }

    #[test]
    fn choke_releases_only_that_peers_requests() {
        let mut map = map();
        let (a, b) = (addr(PEER_A), addr(PEER_B));
        map.register_peer_bitfield(a, full_bitfield());
        map.register_peer_bitfield(b, full_bitfield());

        let now = Instant::now();
        let first = map.next_request(a, now).unwrap();
        let second = map.next_request(b, now).unwrap();

        assert_eq!(map.release_requests(a), vec![first]);
        // peer b's request is untouched, and peer b can now also pick up
        // the released block
        assert_eq!(map.next_request(b, now), Some(first));
        let _ = second;
    }

    #[test]
    fn resume_marks_make_the_map_complete() {
        let mut map = map();
        for index in 0..3 {
            map.mark_resumed(index);
        }
        assert!(map.is_complete());
        assert!(map.own_pieces().all());

        // a fully resumed map never hands out requests
        let a = addr(PEER_A);
        map.register_peer_bitfield(a, full_bitfield());
        assert_eq!(map.next_request(a, Instant::now()), None);
    }
}
