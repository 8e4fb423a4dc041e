#![allow(dead_code)]

mod bandwidth;
mod block;
mod client;
mod config;
mod de;
mod fs;
mod masks;
mod metainfo;
mod mse;
mod p2p;
mod picker;
mod stats;
mod store;
mod torrent;
mod tracker;

// 20-byte identifiers: info hashes and peer ids.
pub type ID = [u8; 20];

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use client::{Client, ClientCommand, ClientTx};
pub use config::Config;
pub use metainfo::MetaInfo;
pub use torrent::{ResumeState, Torrent, TorrentParams};

// Client signature prepended to generated peer ids.
const CLIENT_PREFIX: &[u8; 8] = b"-RT0001-";

// Generates the process-wide peer id: client signature followed by 12 bytes
// derived from the pid and wall clock. Generated once at startup and
// immutable for the lifetime of the process.
pub fn generate_peer_id() -> ID {
    use sha1::Digest;

    let mut hasher = sha1::Sha1::new();
    hasher.update(std::process::id().to_be_bytes());
    hasher.update(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .to_be_bytes(),
    );
    hasher.update(rand::random::<u64>().to_be_bytes());
    let digest = hasher.finalize();

    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_PREFIX);
    id[8..].copy_from_slice(&digest[..12]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_shape() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_PREFIX);
        assert_eq!(id.len(), 20);
    }
}
