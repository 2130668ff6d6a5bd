//! This module defines types used to configure the engine and its parts.
//!
//! There is no process-wide configuration state: a [`Conf`] value is
//! constructed by the caller and threaded through the engine explicitly.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The client id prefix, in the Azureus convention of BEP 20.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-bl0010-";

/// Generates the peer id announced to trackers and peers: the client prefix
/// followed by a random decimal suffix. Chosen once per engine run.
pub fn gen_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[CLIENT_ID_PREFIX.len()..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: gen_client_id(),
                port: 6881,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration of the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The port reported to trackers. The engine is leech-only and does not
    /// actually accept inbound connections.
    pub port: u16,
}

/// Configuration for a torrent download.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory into which the torrent's content is downloaded.
    pub download_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// The number of block requests a session keeps outstanding to a peer to
    /// saturate the link.
    pub request_queue_len: usize,

    /// An outstanding block request older than this is reclaimed by the
    /// timeout reaper and re-offered to the selector.
    pub request_timeout: Duration,

    /// A keepalive frame is sent if nothing else was sent for this long.
    pub keep_alive_interval: Duration,

    /// A peer that sends nothing for this long is dropped.
    pub peer_inactivity_timeout: Duration,

    /// How long a connection attempt (TCP dial and handshake, each) may take.
    pub connect_timeout: Duration,

    /// The first reconnect to a dropped peer waits this long; each further
    /// attempt doubles the wait.
    pub reconnect_backoff_base: Duration,

    /// The reconnect wait never exceeds this.
    pub reconnect_backoff_cap: Duration,

    /// Used between announces when the tracker doesn't provide an interval,
    /// and as the retry cadence after a failed announce.
    pub announce_interval: Duration,

    /// After this many consecutive announce failures with no known peers,
    /// the torrent gives up.
    pub tracker_error_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // mostly picked for performance while keeping in mind not to
            // overwhelm the host
            max_connected_peer_count: 50,
            request_queue_len: 8,
            request_timeout: Duration::from_secs(30),
            // the wire protocol's customary two minute windows
            keep_alive_interval: Duration::from_secs(120),
            peer_inactivity_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            reconnect_backoff_base: Duration::from_secs(15),
            reconnect_backoff_cap: Duration::from_secs(300),
            announce_interval: Duration::from_secs(30 * 60),
            tracker_error_threshold: 15,
        }
    }
}
