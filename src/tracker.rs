//! Tracker transport (§6 "Tracker"): turns a [`crate::announce::PendingAnnounce`]
//! into an actual HTTP or UDP request and parses the response back into a
//! uniform [`TrackerResponse`].
//!
//! [`crate::announce::AnnounceScheduler`] only ever decides *when* to
//! announce; this module is the narrow interface that actually performs the
//! announce. [`TrackerClient`] is kept separate from [`crate::torrent::TorrentCore`]
//! so the latter never has to know which wire format a given tracker speaks;
//! [`HttpTrackerClient`] is exercised against `mockito` instead of a live
//! tracker.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use rand::Rng;
use url::Url;

use crate::{
    announce::AnnounceEvent,
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// Everything a tracker announce request needs, independent of transport.
#[derive(Clone, Debug)]
pub(crate) struct TrackerRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    /// An opaque value the client controls and resends on every announce so
    /// a tracker behind a NAT/anycast setup can recognize repeat requests
    /// from the same client despite a changing source IP.
    pub key: u32,
    pub num_want: Option<i32>,
    pub ip: Option<IpAddr>,
    pub compact: bool,
}

/// A tracker's response to an announce, normalized across the HTTP
/// (bencoded dict) and UDP (fixed binary layout) wire formats.
#[derive(Clone, Debug, Default)]
pub(crate) struct TrackerResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub warning: Option<String>,
    pub tracker_id: Option<String>,
}

/// BEP 3 HTTP(S) tracker announce, the transport this crate ships complete
/// (`mockito`-testable) support for. UDP trackers (BEP 15) use
/// [`UdpTrackerClient`] instead; [`TrackerClient::for_url`] picks between the
/// two by URL scheme, so `TorrentCore` never matches on scheme itself.
pub(crate) struct HttpTrackerClient {
    http: reqwest::Client,
}

impl HttpTrackerClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    async fn announce(
        &self,
        tracker_url: &Url,
        request: &TrackerRequest,
    ) -> Result<TrackerResponse> {
        let url = build_announce_url(tracker_url, request)?;
        log::debug!("Announcing to {}", url);

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        parse_http_response(&body)
    }
}

/// The narrow interface [`crate::torrent::TorrentCore`] drives: actual
/// network transport is someone else's problem at this boundary. An enum
/// rather than a trait object since there are exactly two transports and
/// neither is swapped in at runtime outside of tests.
pub(crate) enum TrackerClient {
    Http(HttpTrackerClient),
    Udp(UdpTrackerClient),
}

impl TrackerClient {
    /// Picks the right transport for `tracker_url`'s scheme.
    pub fn for_url(tracker_url: &Url) -> Result<Self> {
        match tracker_url.scheme() {
            "http" | "https" => Ok(Self::Http(HttpTrackerClient::new())),
            "udp" => Ok(Self::Udp(UdpTrackerClient::new())),
            scheme => {
                Err(Error::Tracker(format!("unsupported tracker scheme: {}", scheme)))
            }
        }
    }

    pub async fn announce(
        &self,
        tracker_url: &Url,
        request: &TrackerRequest,
    ) -> Result<TrackerResponse> {
        match self {
            Self::Http(client) => client.announce(tracker_url, request).await,
            Self::Udp(client) => client.announce(tracker_url, request).await,
        }
    }
}

/// `info_hash`/`peer_id` are raw 20 arbitrary bytes; BEP 3 percent-encodes
/// them directly rather than hex-encoding first, so the usual URL query
/// encoder (which assumes UTF-8) can't be used as-is.
const RAW_BYTES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'+')
    .add(b'&')
    .add(b'=');

fn build_announce_url(base: &Url, req: &TrackerRequest) -> Result<Url> {
    let event_str = match req.event {
        AnnounceEvent::Started => Some("started"),
        AnnounceEvent::Completed => Some("completed"),
        AnnounceEvent::Stopped => Some("stopped"),
        AnnounceEvent::None => None,
    };

    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}",
        percent_encode(&req.info_hash, RAW_BYTES),
        percent_encode(&req.peer_id, RAW_BYTES),
        req.port,
        req.uploaded,
        req.downloaded,
        req.left,
        if req.compact { 1 } else { 0 },
    );
    if let Some(event) = event_str {
        query.push_str("&event=");
        query.push_str(event);
    }
    query.push_str(&format!("&key={:08x}", req.key));
    if let Some(num_want) = req.num_want {
        query.push_str(&format!("&numwant={}", num_want));
    }
    if let Some(ip) = req.ip {
        query.push_str(&format!("&ip={}", ip));
    }

    let mut url = base.clone();
    let combined = match url.query() {
        Some(existing) => format!("{}&{}", existing, query),
        None => query,
    };
    url.set_query(Some(&combined));
    Ok(url)
}

fn parse_http_response(body: &[u8]) -> Result<TrackerResponse> {
    let raw: RawHttpResponse = serde_bencode::from_bytes(body)
        .map_err(|e| Error::Tracker(format!("malformed tracker response: {}", e)))?;

    if let Some(reason) = raw.failure_reason {
        return Err(Error::Tracker(reason));
    }

    let mut peers = Vec::new();
    match raw.peers {
        Some(RawPeers::Compact(bytes)) => peers.extend(parse_compact_peers_v4(&bytes)),
        Some(RawPeers::List(list)) => {
            for p in list {
                if let Ok(ip) = p.ip.parse::<IpAddr>() {
                    peers.push(SocketAddr::new(ip, p.port));
                }
            }
        }
        None => {}
    }
    if let Some(peers6) = raw.peers6 {
        peers.extend(parse_compact_peers_v6(&peers6));
    }

    Ok(TrackerResponse {
        interval: Duration::from_secs(raw.interval.unwrap_or(1800)),
        min_interval: raw.min_interval.map(Duration::from_secs),
        peers,
        complete: raw.complete,
        incomplete: raw.incomplete,
        warning: raw.warning_message,
        tracker_id: raw.tracker_id,
    })
}

fn parse_compact_peers_v4(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = std::net::Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

fn parse_compact_peers_v6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[0..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::new(IpAddr::V6(ip), port)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawHttpResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,
    complete: Option<u32>,
    incomplete: Option<u32>,
    peers: Option<RawPeers>,
    #[serde(with = "serde_bytes", rename = "peers6", default)]
    peers6: Option<Vec<u8>>,
}

#[derive(Debug)]
enum RawPeers {
    Compact(Vec<u8>),
    List(Vec<RawPeerDict>),
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    ip: String,
    port: u16,
}

impl<'de> serde::Deserialize<'de> for RawPeers {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PeersVisitor;
        impl<'de> serde::de::Visitor<'de> for PeersVisitor {
            type Value = RawPeers;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a compact peer byte string or a list of peer dicts")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(RawPeers::Compact(v.to_vec()))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(RawPeers::Compact(v))
            }

            fn visit_seq<A>(self, seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let list = serde::de::Deserialize::deserialize(
                    serde::de::value::SeqAccessDeserializer::new(seq),
                )?;
                Ok(RawPeers::List(list))
            }
        }
        deserializer.deserialize_any(PeersVisitor)
    }
}

/// BEP 15 UDP tracker protocol. A connect/announce round-trip per call;
/// `TorrentCore` is responsible for retrying on timeout (the protocol's
/// `15 * 2^n` backoff isn't reimplemented here, see the exponential
/// back-off [`crate::announce::EndpointState`] already applies at the
/// announce-scheduling layer instead).
pub(crate) struct UdpTrackerClient;

const UDP_PROTOCOL_MAGIC: u64 = 0x41727101980;
const UDP_ACTION_CONNECT: u32 = 0;
const UDP_ACTION_ANNOUNCE: u32 = 1;
const UDP_TIMEOUT: Duration = Duration::from_secs(15);

impl UdpTrackerClient {
    pub fn new() -> Self {
        Self
    }

    async fn connect(&self, socket: &tokio::net::UdpSocket) -> Result<u64> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut req = Vec::with_capacity(16);
        req.extend_from_slice(&UDP_PROTOCOL_MAGIC.to_be_bytes());
        req.extend_from_slice(&UDP_ACTION_CONNECT.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());

        socket
            .send(&req)
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(UDP_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Tracker("udp tracker connect timed out".into()))?
            .map_err(|e| Error::Tracker(e.to_string()))?;
        if n < 16 {
            return Err(Error::Tracker("short udp connect response".into()));
        }
        let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let recv_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if action != UDP_ACTION_CONNECT || recv_transaction_id != transaction_id {
            return Err(Error::Tracker("udp connect response mismatch".into()));
        }
        Ok(u64::from_be_bytes(buf[8..16].try_into().unwrap()))
    }
}

impl UdpTrackerClient {
    async fn announce(
        &self,
        tracker_url: &Url,
        request: &TrackerRequest,
    ) -> Result<TrackerResponse> {
        let host = tracker_url
            .host_str()
            .ok_or_else(|| Error::Tracker("udp tracker url has no host".into()))?;
        let port = tracker_url
            .port()
            .ok_or_else(|| Error::Tracker("udp tracker url has no port".into()))?;
        let remote = format!("{}:{}", host, port);

        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;
        socket
            .connect(&remote)
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let connection_id = self.connect(&socket).await?;

        let transaction_id: u32 = rand::thread_rng().gen();
        let event_code: u32 = match request.event {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        };

        let mut req = Vec::with_capacity(98);
        req.extend_from_slice(&connection_id.to_be_bytes());
        req.extend_from_slice(&UDP_ACTION_ANNOUNCE.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());
        req.extend_from_slice(&request.info_hash);
        req.extend_from_slice(&request.peer_id);
        req.extend_from_slice(&request.downloaded.to_be_bytes());
        req.extend_from_slice(&request.left.to_be_bytes());
        req.extend_from_slice(&request.uploaded.to_be_bytes());
        req.extend_from_slice(&event_code.to_be_bytes());
        req.extend_from_slice(&0u32.to_be_bytes()); // ip: 0 = default
        req.extend_from_slice(&request.key.to_be_bytes());
        req.extend_from_slice(&request.num_want.unwrap_or(-1).to_be_bytes());
        req.extend_from_slice(&request.port.to_be_bytes());

        socket
            .send(&req)
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let mut buf = [0u8; 4096];
        let n = tokio::time::timeout(UDP_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Tracker("udp tracker announce timed out".into()))?
            .map_err(|e| Error::Tracker(e.to_string()))?;
        if n < 20 {
            return Err(Error::Tracker("short udp announce response".into()));
        }
        let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let recv_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if action != UDP_ACTION_ANNOUNCE || recv_transaction_id != transaction_id {
            return Err(Error::Tracker("udp announce response mismatch".into()));
        }
        let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let incomplete = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let complete = u32::from_be_bytes(buf[16..20].try_into().unwrap());
        let peers = parse_compact_peers_v4(&buf[20..n]);

        Ok(TrackerResponse {
            interval: Duration::from_secs(interval as u64),
            min_interval: None,
            peers,
            complete: Some(complete),
            incomplete: Some(incomplete),
            warning: None,
            tracker_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> TrackerRequest {
        TrackerRequest {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: AnnounceEvent::Started,
            key: 0xdeadbeef,
            num_want: Some(50),
            ip: None,
            compact: true,
        }
    }

    #[test]
    fn builds_query_string_with_percent_encoded_hashes() {
        let base = Url::parse("http://tracker.example/announce").unwrap();
        let url = build_announce_url(&base, &sample_request()).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("info_hash=%01%01%01"));
        assert!(query.contains("event=started"));
        assert!(query.contains("compact=1"));
    }

    #[test]
    fn parses_compact_peers_from_http_response() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(&[127, 0, 0, 2, 0x1a, 0xe1]);
        body.extend_from_slice(b"e");

        let parsed = parse_http_response(&body).unwrap();
        assert_eq!(parsed.interval, Duration::from_secs(1800));
        assert_eq!(parsed.peers.len(), 2);
        assert_eq!(parsed.peers[0].port(), 6881);
    }

    #[test]
    fn failure_reason_surfaces_as_tracker_error() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d14:failure reason17:torrent not found");
        body.extend_from_slice(b"e");
        let result = parse_http_response(&body);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn http_announce_round_trips_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", mockito::Matcher::Regex("/announce.*".into()))
            .with_status(200)
            .with_body(b"d8:intervali900e5:peers6:\x7f\x00\x00\x01\x1a\xe1e")
            .create_async()
            .await;

        let base = Url::parse(&format!("{}/announce", server.url())).unwrap();
        let client = HttpTrackerClient::new();
        let response = client.announce(&base, &sample_request()).await.unwrap();
        assert_eq!(response.interval, Duration::from_secs(900));
        assert_eq!(response.peers.len(), 1);
    }
}
