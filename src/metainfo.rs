//! Parsing of `.torrent` metainfo files.
//!
//! The wire format is bencode (see [`serde_bencode`]); this module maps the
//! raw dictionary onto [`Metainfo`], which additionally derives the
//! higher-level [`crate::storage_info::FsStructure`] (single file vs archive)
//! so the rest of the crate never has to match on a raw file list again.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

/// A parsed and normalized `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The torrent's name. Used as the file name for single-file torrents
    /// and as the containing directory's name for archives.
    pub name: String,
    /// The concatenated SHA-1 hashes of all pieces, 20 bytes per piece.
    pub pieces: Vec<u8>,
    /// The nominal length of a piece, in bytes.
    pub piece_len: u32,
    /// The file layout derived from the raw `info` dictionary.
    pub structure: FsStructure,
    /// The tiered tracker list, flattened from either `announce-list` (BEP
    /// 12) or the single `announce` field if no list is present. Each inner
    /// vec is a tier: trackers are tried in order within a tier, and tiers
    /// are tried in order, per [`crate::conf::TorrentConf`].
    pub trackers: Vec<Vec<String>>,
    /// Free-form comment, if the torrent author left one.
    pub comment: Option<String>,
    /// Unix timestamp of torrent creation.
    pub creation_date: Option<i64>,
    /// Whether the torrent is marked private (BEP 27): when set, peers may
    /// only be obtained from the trackers listed, not DHT or PEX.
    pub is_private: bool,
    /// The SHA-1 hash of the raw `info` dictionary, computed once at parse
    /// time since `Metainfo` doesn't retain the original bencoded bytes.
    info_hash: Sha1Hash,
}

impl Metainfo {
    /// Parses a `.torrent` file's raw bytes into a [`Metainfo`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)
            .map_err(|_| Error::InvalidMetainfo)?;
        raw.into_metainfo()
    }

    /// Returns the number of pieces in the torrent, derived from the length
    /// of the concatenated piece hashes.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Returns the SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let start = index * 20;
        let end = start + 20;
        let slice =
            self.pieces.get(start..end).ok_or(Error::InvalidPieceIndex)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Ok(hash)
    }

    /// Returns the torrent's info hash, used to identify it to trackers and
    /// peers alike.
    pub fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }
}

/// The raw, on-the-wire bencoded metainfo dictionary.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    comment: Option<String>,
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u32,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: u64,
}

impl RawMetainfo {
    fn into_metainfo(self) -> Result<Metainfo> {
        let info_bytes = serde_bencode::to_bytes(&self.info)
            .map_err(|_| Error::InvalidMetainfo)?;
        let digest = Sha1::digest(&info_bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        let structure = match (&self.info.length, &self.info.files) {
            (Some(len), None) => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len: *len,
                torrent_offset: 0,
                is_pad: false,
            }),
            (None, Some(files)) => {
                let mut torrent_offset = 0;
                let files = files
                    .iter()
                    .map(|f| {
                        let path: PathBuf = f.path.iter().collect();
                        // BEP 47: padding files live under a top-level
                        // `.pad` directory and carry no real content.
                        let is_pad = f
                            .path
                            .first()
                            .map(|first| first == ".pad")
                            .unwrap_or(false);
                        let file = FileInfo {
                            path,
                            len: f.length,
                            torrent_offset,
                            is_pad,
                        };
                        torrent_offset += f.length;
                        file
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            _ => return Err(Error::InvalidMetainfo),
        };

        let trackers = match (self.announce_list, self.announce) {
            (Some(tiers), _) if !tiers.is_empty() => tiers,
            (_, Some(announce)) => vec![vec![announce]],
            _ => Vec::new(),
        };

        Ok(Metainfo {
            name: self.info.name,
            pieces: self.info.pieces,
            piece_len: self.info.piece_length,
            structure,
            trackers,
            comment: self.comment,
            creation_date: self.creation_date,
            is_private: self.info.private.unwrap_or(0) != 0,
            info_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce14:udp://a.b:8080");
        buf.extend_from_slice(
            b"4:infod6:lengthi1024e4:name8:file.txt12:piece lengthi512e6:pieces40:",
        );
        buf.extend(std::iter::repeat(b'a').take(40));
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let metainfo = Metainfo::from_bytes(&bencode_single_file()).unwrap();
        assert_eq!(metainfo.name, "file.txt");
        assert_eq!(metainfo.piece_len, 512);
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.structure.is_archive());
        assert_eq!(
            metainfo.trackers,
            vec![vec!["udp://a.b:8080".to_string()]]
        );
    }
}
