//! The torrent metainfo codec: a thin serde layer over the bencoded
//! `.torrent` format plus the validation the rest of the engine relies on.
//!
//! The engine proper never touches bencode; it receives a parsed and
//! validated [`Metainfo`] record.

use sha1::{Digest, Sha1};
use url::Url;

use crate::{
    error::{Error, Result},
    Sha1Hash,
};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    /// The URL of the torrent's tracker, if any.
    #[serde(default)]
    pub announce: Option<String>,
    /// Tiers of alternative tracker URLs, per BEP 12.
    #[serde(default, rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
}

impl Metainfo {
    /// Parses and validates a bencoded metainfo buffer.
    ///
    /// Anything that would make the torrent geometrically impossible (no
    /// pieces, a hash string that is not a multiple of 20 bytes, a total
    /// length that doesn't fit the piece count) is rejected here so that
    /// later stages can assume a well-formed torrent.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        let info = &metainfo.info;

        if info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("piece length must be positive"));
        }
        if info.pieces.is_empty() {
            return Err(Error::InvalidMetainfo("torrent has no pieces"));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "piece hash string must be a multiple of 20 bytes",
            ));
        }
        match (&info.length, &info.files) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidMetainfo(
                    "torrent cannot be both single and multi file",
                ));
            }
            (None, None) => {
                return Err(Error::InvalidMetainfo(
                    "torrent must have a length or a file list",
                ));
            }
            (None, Some(files)) if files.is_empty() => {
                return Err(Error::InvalidMetainfo("torrent file list is empty"));
            }
            _ => {}
        }

        // the total length must fill the piece count, with only the last
        // piece allowed to be short
        let total_len = metainfo.total_len();
        let piece_count = metainfo.piece_count() as u64;
        let piece_len = u64::from(info.piece_length);
        if total_len > piece_count * piece_len
            || total_len <= (piece_count - 1) * piece_len
        {
            return Err(Error::InvalidMetainfo(
                "total length does not match piece count",
            ));
        }

        Ok(metainfo)
    }

    /// Computes the torrent's info hash: the SHA-1 digest of the re-encoded
    /// `info` dictionary.
    pub fn info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The expected hashes of all pieces, in piece order.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    /// The sum of the lengths of all files in the torrent.
    pub fn total_len(&self) -> u64 {
        match (&self.info.length, &self.info.files) {
            (Some(len), _) => *len,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            (None, None) => 0,
        }
    }

    /// The torrent's usable tracker URLs: the announce list flattened in tier
    /// order, followed by the single announce URL if it wasn't listed, with
    /// anything that is not well-formed HTTP filtered out.
    pub fn trackers(&self) -> Vec<Url> {
        let mut raw: Vec<&String> = Vec::new();
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !raw.contains(&url) {
                        raw.push(url);
                    }
                }
            }
        }
        if let Some(announce) = &self.announce {
            if !raw.contains(&announce) {
                raw.push(announce);
            }
        }
        raw.iter()
            .filter_map(|url| Url::parse(url).ok())
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    /// The concatenation of all 20 byte piece hashes.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// Set for single file torrents only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Set for multi file torrents only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    /// The file's path components, relative to the torrent's name directory.
    pub path: Vec<String>,
    pub length: u64,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A hand-bencoded single file torrent: 6 bytes of content, one piece.
    fn single_file_buf() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce31:http://tracker.example/announce");
        buf.extend_from_slice(b"4:infod6:lengthi6e4:name5:hello12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0xab; 20]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let metainfo = Metainfo::from_bytes(&single_file_buf()).unwrap();
        assert_eq!(metainfo.info.name, "hello");
        assert_eq!(metainfo.info.piece_length, 16384);
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.total_len(), 6);
        assert_eq!(metainfo.piece_hashes(), vec![[0xab; 20]]);
        assert_eq!(
            metainfo.trackers(),
            vec![Url::parse("http://tracker.example/announce").unwrap()]
        );
    }

    #[test]
    fn info_hash_matches_the_encoded_info_dict() {
        let buf = single_file_buf();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        // the info dict is everything between the "4:info" key and the outer
        // dict's closing 'e'
        let key_pos = buf
            .windows(6)
            .position(|w| w == b"4:info")
            .unwrap();
        let info_dict = &buf[key_pos + 6..buf.len() - 1];

        let mut expected = [0; 20];
        expected.copy_from_slice(&Sha1::digest(info_dict));
        assert_eq!(metainfo.info_hash().unwrap(), expected);
    }

    #[test]
    fn parses_multi_file_torrent() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(b"5:filesl");
        buf.extend_from_slice(b"d6:lengthi10e4:pathl1:aee");
        buf.extend_from_slice(b"d6:lengthi20e4:pathl3:sub1:bee");
        buf.extend_from_slice(b"e");
        buf.extend_from_slice(b"4:name7:archive12:piece lengthi16e6:pieces40:");
        buf.extend_from_slice(&[0xcd; 40]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.total_len(), 30);
        assert_eq!(metainfo.piece_count(), 2);
        let files = metainfo.info.files.as_ref().unwrap();
        assert_eq!(files[0].path, vec!["a"]);
        assert_eq!(files[1].path, vec!["sub", "b"]);
        assert!(metainfo.trackers().is_empty());
    }

    #[test]
    fn rejects_unaligned_piece_hashes() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod6:lengthi6e4:name1:x12:piece lengthi16384e6:pieces19:");
        buf.extend_from_slice(&[0; 19]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn rejects_length_not_matching_piece_count() {
        // one piece of 16 KiB cannot hold 20000 bytes
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod6:lengthi20000e4:name1:x12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn rejects_torrent_with_no_file_information() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod4:name1:x12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }
}
