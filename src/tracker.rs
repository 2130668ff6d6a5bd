//! The HTTP tracker collaborator.
//!
//! An announce is a GET request whose query carries the torrent's identity,
//! our progress counters and an optional lifecycle event; the tracker
//! answers with a bencoded dictionary holding the re-announce interval and
//! a compact peer list. The coordinator decides when to announce; this
//! module only speaks the protocol.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;
use url::Url;

use crate::{error::TrackerError, PeerId, Sha1Hash};

/// The lifecycle events of an announce, per the tracker protocol. The
/// regular re-announce carries no event parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    /// The first announce of a download.
    Started,
    /// Sent exactly once, when the download finishes.
    Completed,
    /// Sent when the engine shuts down without completing.
    Stopped,
    /// The regular re-announce at the tracker's chosen interval.
    Periodic,
}

impl Event {
    fn query_value(self) -> Option<&'static str> {
        match self {
            Self::Started => Some("started"),
            Self::Completed => Some("completed"),
            Self::Stopped => Some("stopped"),
            Self::Periodic => None,
        }
    }
}

/// The progress counters reported with every announce.
#[derive(Clone, Copy, Debug)]
pub struct AnnounceParams {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

/// A successful announce: when to come back, and whom to talk to.
#[derive(Debug)]
pub struct AnnounceResponse {
    /// The tracker's requested re-announce interval, if it sent one.
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

pub struct Tracker {
    client: reqwest::Client,
    url: Url,
    info_hash: Sha1Hash,
    client_id: PeerId,
    port: u16,
}

impl Tracker {
    pub fn new(
        url: Url,
        info_hash: Sha1Hash,
        client_id: PeerId,
        port: u16,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            info_hash,
            client_id,
            port,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends one announce and parses the tracker's answer.
    ///
    /// The info hash and peer id are raw 20 byte strings and have to be
    /// percent encoded by hand; serializing them through a query builder
    /// would mangle them as UTF-8.
    pub async fn announce(
        &self,
        params: AnnounceParams,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode(&self.info_hash, NON_ALPHANUMERIC),
            percent_encode(&self.client_id, NON_ALPHANUMERIC),
            self.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event.query_value() {
            query = format!("{}&event={}", query, event);
        }
        // the url's own query, if any, is kept in front of ours
        let url = if self.url.query().is_some() {
            format!("{}&{}", self.url, query)
        } else {
            format!("{}?{}", self.url, query)
        };

        log::debug!("announcing to tracker: {}", url);
        let resp = self.client.get(url.as_str()).send().await?;
        let body = resp.bytes().await?;
        let raw: RawResponse = serde_bencode::from_bytes(&body)?;

        if let Some(reason) = raw.failure_reason {
            return Err(TrackerError::Failure(reason));
        }

        let peers = match raw.peers {
            Some(compact) => parse_compact_peers(&compact)?,
            None => Vec::new(),
        };
        log::debug!("tracker returned {} peer(s)", peers.len());

        Ok(AnnounceResponse {
            interval: raw.interval.map(Duration::from_secs),
            peers,
        })
    }
}

/// The response dictionary as it appears on the wire.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    /// The compact peer list: 4 address bytes and 2 big endian port bytes
    /// per peer.
    #[serde(default)]
    peers: Option<ByteBuf>,
}

fn parse_compact_peers(buf: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    if buf.len() % 6 != 0 {
        return Err(TrackerError::InvalidPeerList);
    }
    Ok(buf
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// The mock server is shared between tests, so each test announces to
    /// its own path.
    fn tracker(path: &str) -> Tracker {
        let url = Url::parse(&format!("{}/{}", mockito::server_url(), path))
            .unwrap();
        Tracker::new(url, [0xf7; 20], *b"-bl0010-090807060504", 6881)
    }

    fn params(event: Event) -> AnnounceParams {
        AnnounceParams {
            uploaded: 0,
            downloaded: 100,
            left: 200,
            event,
        }
    }

    #[tokio::test]
    async fn announce_parses_interval_and_compact_peers() {
        // two peers: 10.0.0.2:6881 and 192.168.1.9:51413
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe1]);
        body.extend_from_slice(&[192, 168, 1, 9, 0xc8, 0xd5]);
        body.extend_from_slice(b"e");

        let _m = mockito::mock(
            "GET",
            mockito::Matcher::Regex("^/compact".to_string()),
        )
        .with_body(body)
        .create();

        let resp = tracker("compact")
            .announce(params(Event::Started))
            .await
            .unwrap();
        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        assert_eq!(
            resp.peers,
            vec![
                "10.0.0.2:6881".parse::<SocketAddr>().unwrap(),
                "192.168.1.9:51413".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn announce_query_carries_identity_and_counters() {
        let _m = mockito::mock(
            "GET",
            mockito::Matcher::Regex(
                // the info hash is all 0xf7 bytes, percent encoded
                "^/query\\?info_hash=(%F7){20}&peer_id=%2Dbl0010%2D090807060504\
                 &port=6881&uploaded=0&downloaded=100&left=200&compact=1\
                 &event=started$"
                    .to_string(),
            ),
        )
        .with_body(&b"d8:intervali60e5:peers0:e"[..])
        .create();

        let resp = tracker("query")
            .announce(params(Event::Started))
            .await
            .unwrap();
        assert!(resp.peers.is_empty());
    }

    #[tokio::test]
    async fn periodic_announce_omits_the_event() {
        let _m = mockito::mock(
            "GET",
            mockito::Matcher::Regex("^/periodic\\?.*compact=1$".to_string()),
        )
        .with_body(&b"d8:intervali60e5:peers0:e"[..])
        .create();

        assert!(tracker("periodic")
            .announce(params(Event::Periodic))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn failure_reason_is_surfaced() {
        let _m = mockito::mock(
            "GET",
            mockito::Matcher::Regex("^/failing".to_string()),
        )
        .with_body(&b"d14:failure reason15:unknown torrente"[..])
        .create();

        match tracker("failing").announce(params(Event::Started)).await {
            Err(TrackerError::Failure(reason)) => {
                assert_eq!(reason, "unknown torrent");
            }
            other => panic!("expected tracker failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unaligned_peer_list_is_rejected() {
        let mut body = b"d8:intervali60e5:peers5:".to_vec();
        body.extend_from_slice(&[1, 2, 3, 4, 5]);
        body.extend_from_slice(b"e");
        let _m = mockito::mock(
            "GET",
            mockito::Matcher::Regex("^/unaligned".to_string()),
        )
        .with_body(body)
        .create();

        assert!(matches!(
            tracker("unaligned").announce(params(Event::Periodic)).await,
            Err(TrackerError::InvalidPeerList)
        ));
    }
}
