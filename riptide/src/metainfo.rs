use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    // Path components, joined to form the file path inside the torrent directory.
    pub path: Vec<String>,

    // Length of the file in bytes (integer).
    pub length: u64,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

}

// Fields are declared in bencode key order so that re-encoding the dict for
// the info-hash matches the canonical form.
#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // A list of dictionaries, one for each file. Multi-file torrents only.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    // Length of the file in bytes. Single-file torrents only.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    // Single-file: the file name. Multi-file: the directory name.
    pub name: String,

    // Number of bytes in each piece (integer).
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // If set to 1, peers may only be obtained from the declared trackers.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

}

impl Info {
    // Calculates the sha1 hash of the info dict, identifying the torrent.
    pub fn info_hash(&self) -> Result<ID, MetaInfoError> {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        hasher.update(serde_bencode::to_bytes(&self)?);
        Ok(hasher.finalize().into())
    }
}

#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    // The announce URL of the tracker.
    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: url::Url,

    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,

    // sha1 hash of info dict.
    #[serde(skip)]
    pub info_hash: ID,

    #[serde(default)]
    pub encoding: Option<String>,

    // (optional) tiers of backup announce URLs, see BEP 12.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,

    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<MetaInfo, MetaInfoError> {

        let mut metainfo: MetaInfo = serde_bencode::from_bytes(raw)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if let Some(files) = &metainfo.info.files {
            if files.iter().any(|f| f.path.is_empty()) {
                return Err(MetaInfoError::FileEmptyPath);
            }
        }

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo loaded: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as length is checked to be a multiple of 20 on load.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Announce URLs grouped by tier. Each tier is shuffled once at load,
    // as BEP 12 prescribes.
    pub fn trackers(&self) -> Vec<Vec<url::Url>> {
        if let Some(announce_list) = self.announce_list.clone() {
            let mut tiers = Vec::new();
            for mut tier in announce_list {
                tier.shuffle(&mut rand::thread_rng());
                tiers.push(tier);
            }
            tiers
        } else {
            vec![vec![self.announce.clone()]]
        }
    }

    // File list in metainfo order. Single-file torrents yield one entry
    // named after the torrent.
    pub fn files(&self) -> Result<Vec<(std::path::PathBuf, u64)>, MetaInfoError> {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| {
                if f.path.is_empty() {
                    return Err(MetaInfoError::FileEmptyPath);
                }
                Ok((f.path.iter().collect(), f.length))
            }).collect()
        } else {
            Ok(vec![(
                self.info.name.clone().into(),
                self.info.length.ok_or(MetaInfoError::FileNoSize)?,
            )])
        }
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            let date = chrono::NaiveDateTime::from_timestamp_opt(v, 0);
            date.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v|
                        v.as_str()
                    ).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// The pieces field would swamp the output, so Debug is written by hand.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}
