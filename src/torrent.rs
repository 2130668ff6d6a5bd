//! The coordinator of a single torrent download.
//!
//! The torrent owns the peer list and the session tasks, shares the piece
//! map and the disk handle with them, and reacts to the two event streams
//! nobody else drains: the writer's verdicts and finished session tasks. A
//! one second tick drives the request timeout reaper, reconnect backoff and
//! the periodic tracker announces.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{
    select,
    stream::{Fuse, FuturesUnordered},
    StreamExt,
};
use tokio::{sync::RwLock, task, time};

use crate::{
    conf::TorrentConf,
    disk::{Alert, AlertReceiver, DiskHandle},
    error::{Error, Result, TrackerError},
    peer::{self, PeerSession},
    piece_map::PieceMap,
    storage_info::StorageInfo,
    tracker::{AnnounceParams, AnnounceResponse, Event, Tracker},
    BlockInfo, PeerId, Sha1Hash,
};

/// Information shared between the torrent and all its peer sessions.
pub(crate) struct TorrentContext {
    /// The torrent's SHA-1 info hash, verified against every handshake.
    pub info_hash: Sha1Hash,
    /// Our own id, sent in every handshake.
    pub client_id: PeerId,
    /// The torrent's storage geometry.
    pub storage: StorageInfo,
}

/// Reconnect state for an address we have dropped at least once.
struct Backoff {
    attempts: u32,
    not_before: Instant,
}

type Sessions =
    FuturesUnordered<task::JoinHandle<(SocketAddr, Result<()>)>>;

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    conf: TorrentConf,
    piece_map: Arc<RwLock<PieceMap>>,
    disk: DiskHandle,
    disk_alert_port: Fuse<AlertReceiver>,
    tracker: Option<Tracker>,
    /// Addresses we know of but have never dialed.
    available: Vec<SocketAddr>,
    /// Every address we have ever been told about, connected or not.
    known: HashSet<SocketAddr>,
    /// The command channels of the currently running sessions.
    connected: HashMap<SocketAddr, peer::Sender>,
    /// Addresses of dropped peers, eligible again once their backoff
    /// expires.
    backoffs: HashMap<SocketAddr, Backoff>,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    /// Consecutive announce failures.
    tracker_error_count: usize,
    next_announce: Option<Instant>,
}

impl Torrent {
    pub fn new(
        ctx: Arc<TorrentContext>,
        conf: TorrentConf,
        piece_map: Arc<RwLock<PieceMap>>,
        disk: DiskHandle,
        disk_alert_port: AlertReceiver,
        tracker: Option<Tracker>,
        initial_peers: Vec<SocketAddr>,
        left: u64,
    ) -> Self {
        let mut torrent = Self {
            ctx,
            conf,
            piece_map,
            disk,
            disk_alert_port: disk_alert_port.fuse(),
            tracker,
            available: Vec::new(),
            known: HashSet::new(),
            connected: HashMap::new(),
            backoffs: HashMap::new(),
            uploaded: 0,
            downloaded: 0,
            left,
            tracker_error_count: 0,
            next_announce: None,
        };
        torrent.add_peers(initial_peers);
        torrent
    }

    /// Runs the download to completion, a fatal error, or cancellation of
    /// the engine. Sessions are shut down and a final announce is made on
    /// every exit path.
    pub async fn start(&mut self) -> Result<()> {
        log::info!(
            "starting torrent, {} piece(s) missing",
            self.piece_map.read().await.missing_count()
        );

        if let Some(tracker) = &self.tracker {
            log::info!("announcing start to tracker {}", tracker.url());
            match tracker.announce(self.announce_params(Event::Started)).await
            {
                Ok(resp) => self.handle_announce_response(resp),
                Err(e) => {
                    log::warn!("start announce failed: {}", e);
                    self.tracker_error_count += 1;
                    self.next_announce =
                        Some(Instant::now() + self.conf.announce_interval);
                }
            }
        }

        let mut sessions = Sessions::new();
        self.connect_to_peers(&mut sessions);

        let mut tick = time::interval(Duration::from_secs(1)).fuse();

        let run_result = loop {
            select! {
                alert = self.disk_alert_port.select_next_some() => {
                    match self.handle_disk_alert(alert).await {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(e) => break Err(e),
                    }
                }
                session = sessions.select_next_some() => {
                    let (addr, result) =
                        session.expect("peer session task panicked");
                    self.handle_session_exit(addr, result);
                }
                _ = tick.select_next_some() => {
                    if let Err(e) = self.tick(&mut sessions).await {
                        break Err(e);
                    }
                }
            }
        };

        self.shutdown(&mut sessions, run_result.is_ok()).await;
        run_result
    }

    /// Applies a writer verdict. Returns true when the torrent just became
    /// complete.
    async fn handle_disk_alert(&mut self, alert: Alert) -> Result<bool> {
        match alert {
            Alert::PieceCompletion { index, is_valid } => {
                if is_valid {
                    let piece_len =
                        u64::from(self.ctx.storage.piece_len(index)?);
                    let is_complete = {
                        let mut piece_map = self.piece_map.write().await;
                        piece_map.on_verified(index);
                        piece_map.is_complete()
                    };
                    self.downloaded += piece_len;
                    self.left -= piece_len;
                    log::info!(
                        "piece {} verified, {} byte(s) left",
                        index,
                        self.left
                    );
                    if is_complete {
                        log::info!("download complete");
                        return Ok(true);
                    }
                } else {
                    // the whole piece attempt is voided; every peer that fed
                    // it a block is suspect and gets dropped
                    let contributors = self
                        .piece_map
                        .write()
                        .await
                        .on_verify_failed(index);
                    log::warn!(
                        "piece {} failed verification, dropping {} peer(s)",
                        index,
                        contributors.len()
                    );
                    for addr in contributors {
                        if let Some(chan) = self.connected.get(&addr) {
                            chan.send(peer::Command::Shutdown).ok();
                        }
                    }
                }
                Ok(false)
            }
            Alert::Error(e) => {
                log::error!("fatal disk error: {}", e);
                Err(e)
            }
        }
    }

    fn handle_session_exit(&mut self, addr: SocketAddr, result: Result<()>) {
        self.connected.remove(&addr);
        match result {
            Ok(()) => log::info!("peer {} session ended", addr),
            Err(e) => log::warn!("peer {} session failed: {}", addr, e),
        }

        let backoff = self.backoffs.entry(addr).or_insert(Backoff {
            attempts: 0,
            not_before: Instant::now(),
        });
        // 15s, 30s, 60s... capped
        let factor = 1u32 << backoff.attempts.min(16);
        let delay = (self.conf.reconnect_backoff_base * factor)
            .min(self.conf.reconnect_backoff_cap);
        backoff.attempts += 1;
        backoff.not_before = Instant::now() + delay;
        log::info!(
            "peer {} eligible for reconnect in {:?} (attempt {})",
            addr,
            delay,
            backoff.attempts
        );
    }

    /// The periodic housekeeping pass: reaps timed out requests, announces
    /// when due, and tops up the session count.
    async fn tick(&mut self, sessions: &mut Sessions) -> Result<()> {
        let reaped = self.piece_map.write().await.reap_timeouts(
            Instant::now(),
            self.conf.request_timeout,
        );
        if !reaped.is_empty() {
            let mut by_peer: HashMap<SocketAddr, Vec<BlockInfo>> =
                HashMap::new();
            for (addr, block) in reaped {
                by_peer.entry(addr).or_default().push(block);
            }
            for (addr, blocks) in by_peer {
                if let Some(chan) = self.connected.get(&addr) {
                    chan.send(peer::Command::RequestsTimedOut(blocks)).ok();
                }
            }
        }

        self.announce_if_due().await?;
        self.connect_to_peers(sessions);
        Ok(())
    }

    async fn announce_if_due(&mut self) -> Result<()> {
        let tracker = match &self.tracker {
            Some(tracker) => tracker,
            None => return Ok(()),
        };
        let due =
            matches!(self.next_announce, Some(at) if Instant::now() >= at);
        if !due {
            return Ok(());
        }

        match tracker.announce(self.announce_params(Event::Periodic)).await {
            Ok(resp) => self.handle_announce_response(resp),
            Err(e) => {
                log::warn!("announce failed: {}", e);
                self.tracker_error_count += 1;
                self.next_announce =
                    Some(Instant::now() + self.conf.announce_interval);
                // a dead tracker is tolerable as long as there are peers to
                // work with
                if self.tracker_error_count
                    >= self.conf.tracker_error_threshold
                    && self.connected.is_empty()
                    && self.available.is_empty()
                    && self.backoffs.is_empty()
                {
                    return Err(Error::Tracker(TrackerError::Unreachable(
                        self.tracker_error_count,
                    )));
                }
            }
        }
        Ok(())
    }

    fn handle_announce_response(&mut self, resp: AnnounceResponse) {
        self.tracker_error_count = 0;
        let interval =
            resp.interval.unwrap_or(self.conf.announce_interval);
        self.next_announce = Some(Instant::now() + interval);
        self.add_peers(resp.peers);
    }

    fn add_peers(&mut self, peers: Vec<SocketAddr>) {
        for addr in peers {
            if self.known.insert(addr) {
                self.available.push(addr);
            }
        }
    }

    /// Opens sessions up to the configured cap, preferring fresh peers over
    /// previously dropped ones whose backoff has expired.
    fn connect_to_peers(&mut self, sessions: &mut Sessions) {
        let now = Instant::now();
        while self.connected.len() < self.conf.max_connected_peer_count {
            let addr = if let Some(addr) = self.available.pop() {
                addr
            } else if let Some(addr) = self
                .backoffs
                .iter()
                .find(|(addr, backoff)| {
                    backoff.not_before <= now
                        && !self.connected.contains_key(*addr)
                })
                .map(|(addr, _)| *addr)
            {
                addr
            } else {
                break;
            };
            if self.connected.contains_key(&addr) {
                continue;
            }
            self.spawn_session(addr, sessions);
        }
    }

    fn spawn_session(&mut self, addr: SocketAddr, sessions: &mut Sessions) {
        log::info!("spawning session for peer {}", addr);
        let (mut session, cmd_chan) = PeerSession::outbound(
            Arc::clone(&self.ctx),
            Arc::clone(&self.piece_map),
            self.disk.clone(),
            addr,
            self.conf.clone(),
        );
        self.connected.insert(addr, cmd_chan);
        sessions.push(task::spawn(async move {
            let result = session.start().await;
            (addr, result)
        }));
    }

    /// Stops all sessions, waits for them to finish their teardown, and
    /// makes the final announce.
    async fn shutdown(&mut self, sessions: &mut Sessions, completed: bool) {
        log::info!("shutting down torrent");
        for chan in self.connected.values() {
            chan.send(peer::Command::Shutdown).ok();
        }
        while let Some(session) = sessions.next().await {
            if let Ok((addr, _)) = session {
                self.connected.remove(&addr);
            }
        }
        self.connected.clear();

        if let Some(tracker) = &self.tracker {
            let event = if completed {
                Event::Completed
            } else {
                Event::Stopped
            };
            if let Err(e) =
                tracker.announce(self.announce_params(event)).await
            {
                log::warn!("final announce failed: {}", e);
            }
        }
    }

    fn announce_params(&self, event: Event) -> AnnounceParams {
        AnnounceParams {
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.left,
            event,
        }
    }
}
