use std::{net::SocketAddr, time::Duration};
use url::Url;
use crate::ID;

mod http;
mod udp;
pub use http::HttpTracker;
pub use udp::UdpTracker;

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("tracker session timeout")]
    Timeout,

    #[error("invalid url")]
    InvalidUrl,

    #[error("unsupported announce scheme: {0}")]
    UnsupportedScheme(String),

    #[error("response error: {0}")]
    ResponseError(String),

}

impl From<tokio::time::error::Elapsed> for TrackerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TrackerError::Timeout
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {

    Completed,

    Started,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceParams {

    pub info_hash: ID,

    pub client_id: ID,

    // Port we accept peer connections on.
    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed for a complete download.
    pub left: u64,

    pub event: Option<Event>,

    pub num_want: Option<usize>,

    // Opaque id a previous response asked us to send back.
    pub tracker_id: Option<String>,

    // Announce key identifying this client across IP changes.
    pub key: ID,

}

#[derive(Debug, Default)]
pub struct AnnounceResponse {

    pub peers: Vec<SocketAddr>,

    pub interval: Option<Duration>,

    pub min_interval: Option<Duration>,

    pub tracker_id: Option<String>,

}

// One announce target. The per-scheme clients keep no schedule of their
// own; the coordinator owns the tier walk and timing.
#[async_trait::async_trait]
pub trait Announce: Send {

    async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse>;

    fn url(&self) -> &Url;

}

// Builds the announce client matching the URL scheme.
pub fn from_url(url: Url) -> Result<Box<dyn Announce>> {
    match url.scheme() {
        "http" | "https" => Ok(Box::new(HttpTracker::new(url))),
        "udp" => Ok(Box::new(UdpTracker::new(url))),
        scheme => Err(TrackerError::UnsupportedScheme(scheme.to_string())),
    }
}

// Cursor over the announce tiers of BEP 12: a success promotes the
// contacted URL to the front of its tier and rewinds to the first tier, a
// failure walks forward through the tier structure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TierCursor {

    pub tier: usize,

    pub index: usize,

    // Whether the last announce through this cursor succeeded.
    valid: bool,

}

impl TierCursor {

    // The cursor never outruns the structure.
    pub fn clamp<T>(&mut self, tiers: &[Vec<T>]) {
        if self.tier >= tiers.len() {
            self.tier = 0;
            self.index = 0;
        } else if self.index >= tiers[self.tier].len() {
            self.index = 0;
        }
    }

    pub fn on_success<T>(&mut self, tiers: &mut [Vec<T>]) {
        let tier = &mut tiers[self.tier];
        // Move the responding URL to the front of its tier.
        let url = tier.remove(self.index);
        tier.insert(0, url);

        self.tier = 0;
        self.index = 0;
        self.valid = true;
    }

    // Advance after a failed announce. Returns true when the tracker id
    // must be forgotten (we moved to another tier).
    pub fn on_failure<T>(&mut self, tiers: &[Vec<T>]) -> bool {
        if self.valid {
            // The tracker used to be reachable; start over from the top of
            // the tier structure.
            self.valid = false;
            self.tier = 0;
            self.index = 0;
        }

        if self.index + 1 < tiers[self.tier].len() {
            self.index += 1;
            false
        } else if self.tier + 1 < tiers.len() {
            self.tier += 1;
            self.index = 0;
            true
        } else {
            self.tier = 0;
            self.index = 0;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> Vec<Vec<&'static str>> {
        vec![vec!["a1", "a2"], vec!["b1"], vec!["c1", "c2", "c3"]]
    }

    #[test]
    fn test_cursor_failure_walks_tiers() {
        let tiers = tiers();
        let mut cursor = TierCursor::default();

        assert!(!cursor.on_failure(&tiers));
        assert_eq!((cursor.tier, cursor.index), (0, 1));

        assert!(cursor.on_failure(&tiers), "tier change forgets trackerid");
        assert_eq!((cursor.tier, cursor.index), (1, 0));

        assert!(cursor.on_failure(&tiers));
        assert_eq!((cursor.tier, cursor.index), (2, 0));

        cursor.on_failure(&tiers);
        cursor.on_failure(&tiers);
        assert_eq!((cursor.tier, cursor.index), (2, 2));

        // Exhausted; wraps to the start.
        assert!(!cursor.on_failure(&tiers));
        assert_eq!((cursor.tier, cursor.index), (0, 0));
    }

    #[test]
    fn test_cursor_success_promotes_and_rewinds() {
        let mut tiers = tiers();
        let mut cursor = TierCursor::default();

        // Walk to c2 by failing through the structure.
        for _ in 0..4 {
            cursor.on_failure(&tiers);
        }
        assert_eq!((cursor.tier, cursor.index), (2, 1));

        cursor.on_success(&mut tiers);
        assert_eq!(tiers[2], vec!["c2", "c1", "c3"]);
        assert_eq!((cursor.tier, cursor.index), (0, 0));
    }

    #[test]
    fn test_cursor_failure_after_success_restarts() {
        let tiers = tiers();
        let mut cursor = TierCursor { tier: 2, index: 1, valid: true };

        // First failure of a previously-valid tracker rewinds, then
        // advances from the top.
        assert!(!cursor.on_failure(&tiers));
        assert_eq!((cursor.tier, cursor.index), (0, 1));
    }

    #[test]
    fn test_from_url_schemes() {
        assert!(from_url(Url::parse("http://t.example/announce").unwrap()).is_ok());
        assert!(from_url(Url::parse("udp://t.example:8000").unwrap()).is_ok());
        assert!(matches!(
            from_url(Url::parse("wss://t.example").unwrap()),
            Err(TrackerError::UnsupportedScheme(_))
        ));
    }
}
