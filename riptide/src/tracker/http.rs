use std::{net::{IpAddr, Ipv4Addr, SocketAddr}, time::Duration};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use super::{Announce, AnnounceParams, AnnounceResponse, Result, TrackerError};

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

// The query string is assembled by hand: info_hash and friends are raw
// bytes, which Url's form serializer would mangle.
fn build_announce_url(url: &Url, params: &AnnounceParams) -> String {
    let mut out = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&key={}",
        url.as_str(),
        urlencoding::encode_binary(&params.info_hash),
        urlencoding::encode_binary(&params.client_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
        urlencoding::encode_binary(&params.key),
    );
    if let Some(event) = params.event {
        out.push_str(&format!("&event={}", event));
    }
    if let Some(num_want) = params.num_want {
        out.push_str(&format!("&numwant={}", num_want));
    }
    if let Some(tracker_id) = &params.tracker_id {
        out.push_str(&format!("&trackerid={}", urlencoding::encode(tracker_id)));
    }
    out
}

#[async_trait::async_trait]
impl Announce for HttpTracker {

    async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {

        let url = build_announce_url(&self.url, params);
        tracing::debug!("announce url: {}", url);

        let raw_resp = self.client
            .get(url)
            .send()
            .await?
            .bytes()
            .await?;

        let resp: HttpResponse = serde_bencode::from_bytes(&raw_resp)?;
        tracing::debug!("announce response: {:#?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::ResponseError(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }

        Ok(AnnounceResponse {
            peers: resp.peers,
            interval: resp.interval.map(Duration::from_secs),
            min_interval: resp.min_interval.map(Duration::from_secs),
            tracker_id: resp.tracker_id,
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct HttpResponse {

    // If present, no other keys matter; a human-readable error message.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    // Like failure reason, but the response still gets processed.
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    // Seconds to wait between regular announces.
    pub interval: Option<u64>,

    // If present, clients must not reannounce more frequently than this.
    #[serde(rename = "min interval")]
    pub min_interval: Option<u64>,

    // A string the client should send back on its next announcements.
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    // Seeder count (integer).
    pub complete: Option<u64>,

    // Leecher count (integer).
    pub incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    pub peers: Vec<SocketAddr>,
}

// The tracker returns either the compact 6-byte-per-peer string or a list
// of dicts, regardless of what we asked for.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // Compact model: 4 bytes IPv4, 2 bytes port, network byte order.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not multiple of 6"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(
                    SocketAddr::new(
                        IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                        v.get_u16(),
                    )
                )
            }

            Ok(peers)
        }

        // Dictionary model: a list of dicts with "ip" and "port".
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => continue,
                }
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Event;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0xaa; 20],
            client_id: *b"-RT0001-123456789012",
            port: 6881,
            uploaded: 1000,
            downloaded: 2000,
            left: 3000,
            event: Some(Event::Started),
            num_want: Some(40),
            tracker_id: Some("trk".to_string()),
            key: [0x02; 20],
        }
    }

    #[test]
    fn test_build_announce_url() {
        let url = Url::parse("http://tracker.example/announce").unwrap();
        let out = build_announce_url(&url, &params());

        assert!(out.starts_with("http://tracker.example/announce?info_hash=%AA%AA"));
        assert!(out.contains("&peer_id=-RT0001-123456789012"));
        assert!(out.contains("&port=6881"));
        assert!(out.contains("&uploaded=1000"));
        assert!(out.contains("&downloaded=2000"));
        assert!(out.contains("&left=3000"));
        assert!(out.contains("&compact=1"));
        assert!(out.contains("&event=started"));
        assert!(out.contains("&numwant=40"));
        assert!(out.contains("&trackerid=trk"));
        assert!(out.contains("&key=%02%02"));
    }

    #[test]
    fn test_parse_response_compact() {
        let s = "64383a636f6d706c65746569396531303a696e636f6d706c657465693165383a696e74657276616c69313830306531323a6d696e20696e74657276616c693138303065353a706565727336303a52454d051ae1ca2f2a2ec00884937726decc61759ab8138851ab05e8f6bb5062f69770469247493ad4d005879f2ec8d54237ce44ea6043db8806c8d565";
        let response: HttpResponse = serde_bencode::from_bytes(&hex::decode(s).unwrap()).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.min_interval, Some(1800));
        assert_eq!(response.complete, Some(9));
        assert_eq!(response.incomplete, Some(1));
        assert_eq!(response.peers.len(), 10);
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(97, 117, 154, 184)), 5000)));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 135, 159, 46)), 51413)));
    }

    #[test]
    fn test_parse_response_dict_model() {
        let raw = b"d5:peersld2:ip11:192.168.1.94:porti6881eed2:ip9:10.0.0.254:porti51413eeee";
        let response: HttpResponse = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(response.peers, vec![
            "192.168.1.9:6881".parse().unwrap(),
            "10.0.0.25:51413".parse().unwrap(),
        ]);
    }

    #[test]
    fn test_parse_failure_reason() {
        let raw = b"d14:failure reason12:unregistered";
        // Bencoded dict must be terminated.
        let mut full = raw.to_vec();
        full.push(b'e');
        let response: HttpResponse = serde_bencode::from_bytes(&full).unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("unregistered"));
    }
}
