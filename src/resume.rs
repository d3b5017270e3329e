//! Persisted per-torrent state (§6 "Persisted state").
//!
//! A bencoded dictionary, round-tripped through [`serde_bencode`] like
//! [`crate::metainfo`]'s metainfo files are, but written by the crate
//! itself rather than a third party, so the shape is whatever this module
//! says it is rather than something to defensively parse.

use std::{collections::HashMap, path::PathBuf};

use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};

use crate::{error::Result, FileIndex, PieceIndex, Sha1Hash};

/// Current resume-data format version. Bumped whenever a field is added
/// or reinterpreted in a way that would misread an older file.
const RESUME_DATA_VERSION: u32 = 1;

/// A saved snapshot of one torrent's session-survivable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeData {
    pub(crate) version: u32,
    pub info_hash: Sha1Hash,
    pub total_uploaded: u64,
    pub total_downloaded: u64,
    pub active_time: u64,
    pub finished_time: u64,
    pub seeding_time: u64,
    pub last_seen_complete: Option<i64>,
    pub added_time: i64,
    pub completed_time: Option<i64>,
    pub save_path: PathBuf,
    pub flags: ResumeFlags,
    /// Bitfield of fully verified pieces, MSB-first packed bytes, as in
    /// the wire bitfield message.
    #[serde(with = "serde_bytes")]
    pub have_pieces: Vec<u8>,
    /// Set only in seed mode, where every piece is asserted present
    /// without having been individually verified yet (§4.5 seed mode).
    #[serde(with = "serde_bytes")]
    pub verified_pieces: Vec<u8>,
    /// Partially downloaded pieces and which of their blocks are present,
    /// so a restart doesn't have to re-request already-finished blocks.
    pub unfinished_pieces: HashMap<PieceIndex, ByteBuf>,
    /// Tiered tracker list, mirroring the metainfo's `announce-list`
    /// shape but editable independently of the original torrent file.
    pub trackers: Vec<Vec<String>>,
    pub url_seeds: Vec<String>,
    pub http_seeds: Vec<String>,
    pub banned_peers: Vec<String>,
    pub peers: Vec<String>,
    pub renamed_files: HashMap<FileIndex, String>,
    pub file_priorities: Vec<u8>,
    pub piece_priorities: Vec<u8>,
    pub upload_limit: Option<u32>,
    pub download_limit: Option<u32>,
    pub max_connections: Option<u32>,
    pub max_uploads: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResumeFlags {
    pub paused: bool,
    pub auto_managed: bool,
    pub seed_mode: bool,
    pub super_seeding: bool,
    pub sequential_download: bool,
}

impl ResumeData {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut this = self.clone();
        this.version = RESUME_DATA_VERSION;
        serde_bencode::to_bytes(&this)
            .map_err(|e| crate::error::Error::Storage(e.to_string()))
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf)
            .map_err(|_| crate::error::Error::InvalidMetainfo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResumeData {
        ResumeData {
            version: RESUME_DATA_VERSION,
            info_hash: [1; 20],
            total_uploaded: 123,
            total_downloaded: 456,
            active_time: 10,
            finished_time: 0,
            seeding_time: 0,
            last_seen_complete: None,
            added_time: 1_700_000_000,
            completed_time: None,
            save_path: PathBuf::from("/tmp/downloads"),
            flags: ResumeFlags::default(),
            have_pieces: vec![0xff, 0x00],
            verified_pieces: Vec::new(),
            unfinished_pieces: HashMap::new(),
            trackers: vec![vec!["http://tracker.example/announce".to_owned()]],
            url_seeds: Vec::new(),
            http_seeds: Vec::new(),
            banned_peers: Vec::new(),
            peers: vec!["1.2.3.4:6881".to_owned()],
            renamed_files: HashMap::new(),
            file_priorities: vec![4, 4],
            piece_priorities: vec![4; 16],
            upload_limit: None,
            download_limit: None,
            max_connections: Some(50),
            max_uploads: Some(4),
        }
    }

    #[test]
    fn round_trips_through_bencode() {
        let original = sample();
        let bytes = original.to_bytes().unwrap();
        let decoded = ResumeData::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.info_hash, original.info_hash);
        assert_eq!(decoded.total_uploaded, original.total_uploaded);
        assert_eq!(decoded.have_pieces, original.have_pieces);
        assert_eq!(decoded.trackers, original.trackers);
        assert_eq!(decoded.max_connections, original.max_connections);
    }

    #[test]
    fn stamps_current_version_on_save() {
        let mut original = sample();
        original.version = 0;
        let bytes = original.to_bytes().unwrap();
        let decoded = ResumeData::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.version, RESUME_DATA_VERSION);
    }
}
