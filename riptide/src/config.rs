use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use crate::ID;

#[derive(Debug, Clone)]
pub struct Config {

    // Unique 20-byte identifier for this client, stable for the process.
    pub client_id: ID,

    // Address the client listens on for incoming peers.
    pub listen_address: SocketAddr,

    // Directory torrent data is written under.
    pub output_dir: PathBuf,

    // Request granularity for piece transfer.
    pub block_length: usize,

    // Re-hash data already on disk when a torrent starts.
    pub validate_on_startup: bool,

    // Initiate MSE on outgoing connections. Incoming MSE is always accepted.
    pub mse_outgoing: bool,

    // Close a connection with no inbound traffic for this long.
    pub connection_timeout: Duration,

    // Consider a peer snubbed when the oldest pending block is this old.
    pub block_timeout: Duration,

    // Interval of the per-connection and per-torrent upkeep passes.
    pub maintenance_interval: Duration,

    // Send a keepalive after this much outbound silence.
    pub keepalive_interval: Duration,

    // Outstanding request queue bounds towards a single peer.
    pub request_queue_len: usize,
    pub request_queue_min: usize,

    // Cap on the per-connection list of pieces worth requesting.
    pub pieces_wanted_max: usize,

    // Disconnect a peer queueing more than this many block requests.
    pub blocks_pending_out_limit: usize,

    // Largest single block a peer may request from us.
    pub request_block_length_max: usize,

    // Unchoke slots and the share of them handed out optimistically.
    pub downloader_count: usize,
    pub optimistic_unchoke_rate: f64,

    // Don't open more connections than the target; refuse inbound past the limit.
    pub peer_connection_count_target: usize,
    pub peer_connection_count_limit: usize,
    pub peer_connections_start_delay: Duration,

    // Announce scheduling floors and fallbacks.
    pub announce_min_interval: Duration,
    pub announce_default_interval: Duration,
    pub announce_retry_interval: Duration,

    // Outbound bandwidth governor: bytes per cycle and cycle length.
    pub byte_slice: usize,
    pub cycle_length: Duration,

    // Allow duplicate requests once fewer than this many pieces remain.
    pub endgame_threshold: usize,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: crate::generate_peer_id(),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            output_dir: PathBuf::from("downloads"),
            block_length: 0x4000,
            validate_on_startup: false,
            mse_outgoing: false,
            connection_timeout: Duration::from_secs(190),
            block_timeout: Duration::from_secs(290),
            maintenance_interval: Duration::from_secs(100),
            keepalive_interval: Duration::from_secs(15),
            request_queue_len: 16,
            request_queue_min: 8,
            pieces_wanted_max: 25,
            blocks_pending_out_limit: 128,
            request_block_length_max: 65_536,
            downloader_count: 4,
            optimistic_unchoke_rate: 0.2,
            peer_connection_count_target: 45,
            peer_connection_count_limit: 60,
            peer_connections_start_delay: Duration::from_secs(300),
            announce_min_interval: Duration::from_secs(50),
            announce_default_interval: Duration::from_secs(1800),
            announce_retry_interval: Duration::from_secs(100),
            byte_slice: 1 << 20,
            cycle_length: Duration::from_secs(1),
            endgame_threshold: 10,
        }
    }
}

impl Config {
    // Number of optimistic unchoke slots out of `downloader_count`.
    pub fn optimistic_unchoke_count(&self) -> usize {
        (self.downloader_count as f64 * self.optimistic_unchoke_rate).ceil() as usize
    }
}
