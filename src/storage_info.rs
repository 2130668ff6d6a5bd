//! Maps the torrent's logical byte stream onto the destination file system.
//!
//! All files of a torrent, viewed back to back, form a single contiguous
//! byte array that the pieces are hashed over. This module answers the two
//! geometric questions the writer and the resume scan keep asking: where
//! does a piece start in that array, and which files does it overlap.

use std::{ops::Range, path::PathBuf};

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    FileIndex, PieceIndex,
};

/// Information about one of the torrent's files.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's path relative to the download directory. For single file
    /// torrents this is just the torrent's name; for multi file torrents the
    /// paths are nested under a directory named after the torrent.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The offset of the file's first byte within the torrent, when all
    /// files are viewed as a single contiguous byte array.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns the offsets of the file's first and one past its last byte in
    /// the torrent, as a left-inclusive range.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns one past the file's last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the part of this file that overlaps with the byte range of
    /// the given length starting at the given torrent-level offset. The
    /// range may reach past the file, in which case the returned slice is
    /// clamped to the file's end.
    ///
    /// # Panics
    ///
    /// Panics if the offset doesn't fall within the file.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        if torrent_offset < self.torrent_offset {
            panic!("torrent offset must not be before file start");
        }
        let torrent_end_offset = self.torrent_end_offset();
        if torrent_offset >= torrent_end_offset {
            panic!("torrent offset must be before file end");
        }

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// The location of a byte range within a single file, relative to the file's
/// start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    pub offset: u64,
    pub len: u64,
}

/// The torrent's storage geometry: piece sizes and the destination files.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece, which differs from `piece_len` when the
    /// download size is not an exact multiple of the piece length.
    pub last_piece_len: u32,
    /// The sum of the lengths of all files in the torrent.
    pub download_len: u64,
    /// The destination directory. File paths in `files` are relative to it.
    pub download_dir: PathBuf,
    /// The torrent's files in torrent order, with strictly increasing
    /// torrent offsets. A single file torrent is simply a one element list.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts the storage geometry from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let piece_len = metainfo.info.piece_length;
        let download_len = metainfo.total_len();
        let last_piece_len =
            (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;

        let files = match &metainfo.info.files {
            // multi file torrents nest under a directory named after the
            // torrent so that the download dir isn't littered with entries
            Some(files) => {
                let mut result = Vec::with_capacity(files.len());
                let mut torrent_offset = 0;
                for file in files {
                    let mut path = PathBuf::from(&metainfo.info.name);
                    for component in &file.path {
                        path.push(component);
                    }
                    result.push(FileInfo {
                        path,
                        len: file.length,
                        torrent_offset,
                    });
                    torrent_offset += file.length;
                }
                result
            }
            None => vec![FileInfo {
                path: PathBuf::from(&metainfo.info.name),
                len: download_len,
                torrent_offset: 0,
            }],
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index < self.piece_count {
            Ok(self.piece_len)
        } else {
            log::error!("piece index {} out of bounds", index);
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// Returns the offset of the piece's first byte within the torrent.
    pub fn torrent_piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Returns the range of file indices the piece overlaps with.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        let piece_offset = self.torrent_piece_offset(index);
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.files_intersecting_bytes(piece_offset..piece_end))
    }

    /// Returns the range of file indices that overlap with the given
    /// left-inclusive torrent byte range.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        let first = match self
            .files
            .iter()
            .position(|file| file.byte_range().contains(&byte_range.start))
        {
            Some(first) => first,
            None => return 0..0,
        };

        let mut file_range = first..first + 1;
        for (index, file) in self.files.iter().enumerate().skip(first + 1) {
            // stop at the first file that starts at or past the range's end
            if !byte_range.contains(&file.torrent_offset) {
                break;
            }
            file_range.end = index + 1;
        }
        file_range
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn file(path: &str, torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            len,
            torrent_offset,
        }
    }

    #[test]
    fn file_slice_is_clamped_to_file_end() {
        // the file covers torrent bytes [100, 400)
        let file = file("x", 100, 300);

        // a range longer than the file returns at most the file's remainder
        assert_eq!(
            file.get_slice(250, 1000),
            FileSlice {
                offset: 150,
                len: 250,
            }
        );
        // a range within the file is returned as is
        assert_eq!(file.get_slice(250, 40), FileSlice { offset: 150, len: 40 });
        // the full file
        assert_eq!(file.get_slice(100, 300), FileSlice { offset: 0, len: 300 });
    }

    #[test]
    #[should_panic(expected = "before file start")]
    fn file_slice_panics_before_file() {
        file("x", 100, 300).get_slice(99, 10);
    }

    #[test]
    #[should_panic(expected = "before file end")]
    fn file_slice_panics_past_file() {
        file("x", 100, 300).get_slice(400, 10);
    }

    /// Single file: every piece maps to the only file.
    #[test]
    fn single_file_piece_intersections() {
        let info = StorageInfo {
            piece_count: 3,
            piece_len: 8,
            last_piece_len: 5,
            download_len: 21,
            download_dir: PathBuf::from("/"),
            files: vec![file("only", 0, 21)],
        };
        for index in 0..3 {
            assert_eq!(info.files_intersecting_piece(index).unwrap(), 0..1);
        }
        assert!(info.files_intersecting_piece(3).is_err());
    }

    /// Multi file layout used below:
    ///
    /// pieces (8 bytes each, last piece 4):
    /// -----------------------------------------
    /// |0:0      |1:8      |2:16     |3:24     |
    /// -----------------------------------------
    /// files (first byte offset, length):
    /// -----------------------------------------
    /// |a:0,3 |b:3,7      |c:10,2|d:12,16      |
    /// -----------------------------------------
    fn archive() -> StorageInfo {
        StorageInfo {
            piece_count: 4,
            piece_len: 8,
            last_piece_len: 4,
            download_len: 28,
            download_dir: PathBuf::from("/"),
            files: vec![
                file("a", 0, 3),
                file("b", 3, 7),
                file("c", 10, 2),
                file("d", 12, 16),
            ],
        }
    }

    #[test]
    fn multi_file_piece_intersections() {
        let info = archive();
        // piece 0 covers bytes [0, 8): files a and b
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
        // piece 1 covers bytes [8, 16): files b, c and d
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..4);
        // pieces 2 and 3 are entirely within d
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 3..4);
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 3..4);
    }

    #[test]
    fn byte_range_intersections() {
        let info = archive();
        // a single byte in the middle of a file
        assert_eq!(info.files_intersecting_bytes(5..6), 1..2);
        // a byte range touching the last byte of one file and the first of
        // the next
        assert_eq!(info.files_intersecting_bytes(9..11), 1..3);
        // the whole torrent
        assert_eq!(info.files_intersecting_bytes(0..28), 0..4);
        // an empty range intersects nothing beyond its containing file
        assert_eq!(info.files_intersecting_bytes(3..3), 1..2);
        // past the end of the torrent
        assert_eq!(info.files_intersecting_bytes(28..30), 0..0);
    }

    #[test]
    fn piece_lens() {
        let info = archive();
        assert_eq!(info.piece_len(0).unwrap(), 8);
        assert_eq!(info.piece_len(3).unwrap(), 4);
        assert!(info.piece_len(4).is_err());
        assert_eq!(info.torrent_piece_offset(3), 24);
    }
}
