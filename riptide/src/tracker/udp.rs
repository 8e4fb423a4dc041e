use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{Announce, AnnounceParams, AnnounceResponse, Event, Result, TrackerError};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64 = 0x41727101980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_ERROR: i32 = 3;

// The whole CONNECT/ANNOUNCE exchange must finish within this window.
const SESSION_TIMEOUT: Duration = Duration::from_secs(50);

pub struct UdpTracker {

    url: Url,

}

impl UdpTracker {

    pub fn new(url: Url) -> Self {
        Self { url }
    }

    async fn exchange(&self, params: &AnnounceParams) -> Result<AnnounceResponse> {

        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(TrackerError::InvalidUrl)?;

        // First available local port.
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        // CONNECT.
        let tid = rand::random();
        socket.send(&connect_frame(tid)).await?;

        let mut resp_buf = [0u8; 1024];
        let n = socket.recv(&mut resp_buf).await?;
        let conn_id = parse_connect_frame(&resp_buf[..n], tid)?;
        tracing::trace!("connected to tracker, connection id {:#x}", conn_id);

        // ANNOUNCE.
        let tid = rand::random();
        socket.send(&announce_frame(conn_id, tid, params)).await?;

        let n = socket.recv(&mut resp_buf).await?;
        parse_announce_frame(&resp_buf[..n], tid)
    }
}

#[async_trait::async_trait]
impl Announce for UdpTracker {

    async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let response = time::timeout(SESSION_TIMEOUT, self.exchange(params)).await??;
        tracing::debug!("udp tracker provided {} peers", response.peers.len());
        Ok(response)
    }

    fn url(&self) -> &Url {
        &self.url
    }
}

fn connect_frame(tid: i32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_i64(PROTOCOL_ID);
    buf.put_i32(ACTION_CONNECT);
    buf.put_i32(tid);
    buf
}

fn parse_connect_frame(mut resp: &[u8], tid: i32) -> Result<i64> {
    if resp.len() < 16 {
        return Err(TrackerError::ResponseError("connect response too short".to_string()));
    }
    if resp.get_i32() != ACTION_CONNECT {
        return Err(TrackerError::ResponseError("expected action 0".to_string()));
    }
    if resp.get_i32() != tid {
        return Err(TrackerError::ResponseError("invalid transaction id".to_string()));
    }
    Ok(resp.get_i64())
}

fn announce_frame(conn_id: i64, tid: i32, params: &AnnounceParams) -> BytesMut {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_i64(conn_id);
    buf.put_i32(ACTION_ANNOUNCE);
    buf.put_i32(tid);
    buf.put(&params.info_hash[..]);
    buf.put(&params.client_id[..]);
    buf.put_u64(params.downloaded);
    buf.put_u64(params.left);
    buf.put_u64(params.uploaded);
    buf.put_i32(match params.event {
        None => 0,
        Some(Event::Completed) => 1,
        Some(Event::Started) => 2,
        Some(Event::Stopped) => 3,
    });
    buf.put_i32(0); // IP address, default 0.
    // Key: last 4 bytes of the announce key.
    buf.put(&params.key[16..]);
    buf.put_i32(match params.num_want {
        Some(num_want) => num_want as i32,
        None => -1,
    });
    buf.put_u16(params.port);
    buf
}

fn parse_announce_frame(mut resp: &[u8], tid: i32) -> Result<AnnounceResponse> {
    let total = resp.len();
    if total < 8 {
        return Err(TrackerError::ResponseError("announce response too short".to_string()));
    }
    let action = resp.get_i32();
    let resp_tid = resp.get_i32();
    if action == ACTION_ERROR {
        return Err(TrackerError::ResponseError(
            String::from_utf8_lossy(resp).to_string(),
        ));
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::ResponseError("expected action 1".to_string()));
    }
    if resp_tid != tid {
        return Err(TrackerError::ResponseError("invalid transaction id".to_string()));
    }
    if total < 20 {
        return Err(TrackerError::ResponseError("announce response too short".to_string()));
    }

    let interval = resp.get_i32();
    let _leechers = resp.get_i32();
    let _seeders = resp.get_i32();

    let num_peers = (total - 20) / 6;
    let mut peers = Vec::with_capacity(num_peers);
    for _ in 0..num_peers {
        let ip = resp.get_u32();
        let port = resp.get_u16();
        peers.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
    }

    Ok(AnnounceResponse {
        peers,
        interval: Some(Duration::from_secs(interval.max(0) as u64)),
        min_interval: None,
        tracker_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0xab; 20],
            client_id: [0x30; 20],
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: Some(Event::Started),
            num_want: None,
            tracker_id: None,
            key: [0x07; 20],
        }
    }

    #[test]
    fn test_connect_frame_layout() {
        let frame = connect_frame(0x01020304);
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[..8], &0x41727101980i64.to_be_bytes());
        assert_eq!(&frame[8..12], &[0, 0, 0, 0]);
        assert_eq!(&frame[12..], &0x01020304i32.to_be_bytes());
    }

    #[test]
    fn test_parse_connect_frame() {
        let mut resp = BytesMut::new();
        resp.put_i32(ACTION_CONNECT);
        resp.put_i32(77);
        resp.put_i64(0x1122334455667788);
        assert_eq!(parse_connect_frame(&resp, 77).unwrap(), 0x1122334455667788);

        assert!(parse_connect_frame(&resp, 78).is_err());
        assert!(parse_connect_frame(&resp[..10], 77).is_err());
    }

    #[test]
    fn test_announce_frame_layout() {
        let frame = announce_frame(0x55, 99, &params());
        assert_eq!(frame.len(), 98);
        assert_eq!(&frame[..8], &0x55i64.to_be_bytes());
        assert_eq!(&frame[8..12], &1i32.to_be_bytes());
        assert_eq!(&frame[12..16], &99i32.to_be_bytes());
        assert_eq!(&frame[16..36], &[0xab; 20]);
        assert_eq!(&frame[36..56], &[0x30; 20]);
        // downloaded, left, uploaded
        assert_eq!(&frame[56..64], &2u64.to_be_bytes());
        assert_eq!(&frame[64..72], &3u64.to_be_bytes());
        assert_eq!(&frame[72..80], &1u64.to_be_bytes());
        // started = 2
        assert_eq!(&frame[80..84], &2i32.to_be_bytes());
        // key = last 4 bytes of the announce key
        assert_eq!(&frame[88..92], &[0x07; 4]);
        // num_want defaults to -1
        assert_eq!(&frame[92..96], &(-1i32).to_be_bytes());
        assert_eq!(&frame[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_parse_announce_frame() {
        let mut resp = BytesMut::new();
        resp.put_i32(ACTION_ANNOUNCE);
        resp.put_i32(42);
        resp.put_i32(1800); // interval
        resp.put_i32(3);    // leechers
        resp.put_i32(9);    // seeders
        // Two peers.
        resp.put(&[192, 168, 0, 1][..]);
        resp.put_u16(6881);
        resp.put(&[10, 1, 2, 3][..]);
        resp.put_u16(51413);

        let parsed = parse_announce_frame(&resp, 42).unwrap();
        assert_eq!(parsed.interval, Some(Duration::from_secs(1800)));
        assert_eq!(parsed.peers, vec![
            "192.168.0.1:6881".parse().unwrap(),
            "10.1.2.3:51413".parse().unwrap(),
        ]);
    }

    #[test]
    fn test_parse_announce_error_frame() {
        let mut resp = BytesMut::new();
        resp.put_i32(ACTION_ERROR);
        resp.put_i32(42);
        resp.put(&b"torrent not registered"[..]);
        match parse_announce_frame(&resp, 42) {
            Err(TrackerError::ResponseError(msg)) => {
                assert!(msg.contains("not registered"));
            }
            other => panic!("expected response error, got {:?}", other.is_ok()),
        }
    }
}
