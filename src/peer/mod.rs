pub mod codec;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{
    select,
    stream::{Fuse, SplitSink},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::TorrentConf,
    disk::DiskHandle,
    error::{Error, Result},
    piece_map::{BlockReceipt, PieceMap},
    torrent::TorrentContext,
    Bitfield, BlockInfo, PeerId, PieceIndex,
};
use codec::*;

/// The channel on which the coordinator sends commands to a session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// The timeout reaper released these outstanding requests; the session
    /// must drop them from its own pipeline accounting.
    RequestsTimedOut(Vec<BlockInfo>),
    /// Eventually shut down the session.
    Shutdown,
}

type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// A single peer connection, run as its own task.
///
/// The session dials the peer, exchanges handshakes, then settles into a
/// loop multiplexing the framed socket, commands from the coordinator, and
/// a one second tick driving keepalives and inactivity checks. Work comes
/// out of the shared piece map, received blocks go back into it, and
/// assembled pieces are queued on the disk handle.
pub(crate) struct PeerSession {
    /// Information shared across the torrent's sessions.
    torrent: Arc<TorrentContext>,
    /// The piece map holds the request state for all sessions; this session
    /// identifies itself by its remote address.
    piece_map: Arc<RwLock<PieceMap>>,
    /// Where assembled pieces are sent for verification and writing.
    disk: DiskHandle,
    conf: TorrentConf,
    /// The port on which the session receives coordinator commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    status: Status,
    /// The blocks we have requested and not yet received. Bounded by the
    /// configured request queue length. Every entry has a matching
    /// outstanding record in the piece map.
    outgoing_requests: Vec<BlockInfo>,
    /// Set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// When we last put a frame on the wire. Drives keepalives.
    last_send: Instant,
    /// When the peer last sent us anything. Drives the inactivity drop.
    last_recv: Instant,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address,
    /// along with the command channel the coordinator keeps.
    pub fn outbound(
        torrent: Arc<TorrentContext>,
        piece_map: Arc<RwLock<PieceMap>>,
        disk: DiskHandle,
        addr: SocketAddr,
        conf: TorrentConf,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_map,
                disk,
                conf,
                cmd_port: cmd_port.fuse(),
                addr,
                status: Status::default(),
                outgoing_requests: Vec::new(),
                peer_info: None,
                last_send: Instant::now(),
                last_recv: Instant::now(),
            },
            cmd_chan,
        )
    }

    /// Runs the session until the peer disconnects, a fatal session error
    /// occurs, or the coordinator orders a shutdown.
    ///
    /// Teardown is unconditional: whatever the exit path, the session's
    /// outstanding requests are returned to the selector and its advertised
    /// pieces are forgotten.
    pub async fn start(&mut self) -> Result<()> {
        let result = self.run().await;
        self.piece_map.write().await.unregister_peer(self.addr);
        self.outgoing_requests.clear();
        log::debug!(
            "peer {} final flags: am_choking={} am_interested={} \
             peer_choking={} peer_interested={}",
            self.addr,
            self.status.is_peer_choked,
            self.status.is_interested,
            self.status.is_choked,
            self.status.is_peer_interested
        );
        self.status.state = State::Disconnected;
        if let Some(peer_info) = &self.peer_info {
            log::debug!(
                "forgetting peer {} ({:?})",
                self.addr,
                String::from_utf8_lossy(&peer_info.peer_id)
            );
        }
        if let Err(e) = &result {
            log::info!("peer {} session stopped: {}", self.addr, e);
        }
        result
    }

    async fn run(&mut self) -> Result<()> {
        log::info!("connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = time::timeout(
            self.conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await??;
        log::info!("connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we send the first handshake
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        let peer_handshake = match time::timeout(
            self.conf.connect_timeout,
            socket.next(),
        )
        .await?
        {
            Some(peer_handshake) => peer_handshake?,
            None => {
                return Err(Error::Handshake(
                    "connection closed before handshake",
                ));
            }
        };
        log::debug!("peer {} handshake: {:?}", self.addr, peer_handshake);

        // the codec guarantees the protocol string; the torrent is on us
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::warn!("peer {} advertised the wrong info hash", self.addr);
            return Err(Error::Handshake("info hash mismatch"));
        }
        log::info!(
            "peer {} id: {:?}",
            self.addr,
            String::from_utf8_lossy(&peer_handshake.peer_id)
        );
        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            pieces: None,
        });

        // switch to the message codec, keeping whatever the peer sent right
        // after its handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // a bitfield may only be received directly after the handshake
        self.status.state = State::AvailabilityExchange;
        log::info!(
            "peer {} session state: {:?}",
            self.addr,
            self.status.state
        );
        self.last_send = Instant::now();
        self.last_recv = Instant::now();

        // announce our own pieces, unless we have none to announce
        let own_pieces = self.piece_map.read().await.own_pieces().clone();
        if own_pieces.any() {
            self.send_msg(&mut sink, Message::Bitfield(own_pieces)).await?;
        }

        let mut tick = time::interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => {
                            log::info!("peer {} disconnected", self.addr);
                            break;
                        }
                    };
                    log::debug!(
                        "received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );
                    self.last_recv = Instant::now();

                    if self.status.state == State::AvailabilityExchange {
                        self.status.state = State::Connected;
                        log::info!(
                            "peer {} session state: {:?}",
                            self.addr,
                            self.status.state
                        );
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(&mut sink, bitfield)
                                .await?;
                        } else {
                            // a peer with nothing to share may skip the
                            // bitfield; its availability arrives via have
                            // messages
                            self.handle_msg(&mut sink, msg).await?;
                        }
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => match cmd {
                    Command::RequestsTimedOut(blocks) => {
                        log::info!(
                            "{} request(s) to peer {} timed out",
                            blocks.len(),
                            self.addr
                        );
                        self.outgoing_requests
                            .retain(|block| !blocks.contains(block));
                        self.make_requests(&mut sink).await?;
                    }
                    Command::Shutdown => {
                        log::info!(
                            "shutting down peer {} session",
                            self.addr
                        );
                        self.status.state = State::Disconnecting;
                        break;
                    }
                },
                _ = tick.select_next_some() => {
                    self.tick(&mut sink).await?;
                }
            }
        }

        Ok(())
    }

    /// Runs the session's timers: the inactivity drop, the keepalive, and
    /// an opportunistic pipeline top-up (e.g. after a verification failure
    /// freed blocks no message would otherwise make us re-request).
    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let now = Instant::now();
        if now.duration_since(self.last_recv)
            >= self.conf.peer_inactivity_timeout
        {
            log::warn!("peer {} inactive, dropping", self.addr);
            return Err(Error::Timeout);
        }
        if now.duration_since(self.last_send) >= self.conf.keep_alive_interval
        {
            log::debug!("sending keepalive to peer {}", self.addr);
            self.send_msg(sink, Message::KeepAlive).await?;
        }
        if self.status.state == State::Connected {
            self.update_interest(sink).await?;
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    /// Handles the bitfield message expected in the availability exchange
    /// state. The raw bits must be exactly the torrent's piece count padded
    /// to a byte boundary with zero bits; anything else drops the peer.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut MessageSink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        log::info!("handling peer {} bitfield", self.addr);
        log::trace!("bitfield: {:?}", bitfield);

        validate_bitfield(&mut bitfield, self.torrent.storage.piece_count)?;

        self.piece_map
            .write()
            .await
            .register_peer_bitfield(self.addr, bitfield.clone());
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(bitfield);
        }

        self.update_interest(sink).await?;
        Ok(())
    }

    /// Handles messages expected in the connected state.
    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::warn!(
                    "peer {} sent bitfield not directly after handshake",
                    self.addr
                );
                return Err(Error::Protocol(
                    "bitfield only valid directly after handshake",
                ));
            }
            Message::KeepAlive => {
                log::trace!("peer {} sent keepalive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // the remote is not obligated to serve what's in flight,
                    // so the pipeline goes back to the selector
                    self.outgoing_requests.clear();
                    self.piece_map
                        .write()
                        .await
                        .release_requests(self.addr);
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("peer {} is no longer interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                if piece_index >= self.torrent.storage.piece_count {
                    return Err(Error::Protocol("have index out of range"));
                }
                log::debug!(
                    "peer {} announced piece {}",
                    self.addr,
                    piece_index
                );
                self.piece_map
                    .write()
                    .await
                    .register_peer_have(self.addr, piece_index);
                if let Some(pieces) = self
                    .peer_info
                    .as_mut()
                    .and_then(|peer_info| peer_info.pieces.as_mut())
                {
                    pieces.set(piece_index, true);
                }
                self.update_interest(sink).await?;
                self.make_requests(sink).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(piece_index, offset, data).await?;
                // a pipeline slot freed up
                self.make_requests(sink).await?;
            }
            // we never unchoke, so a well behaved peer won't send these;
            // they are not worth dropping the session over
            Message::Request(block) => {
                log::warn!(
                    "leech-only client ignoring request {:?} from peer {}",
                    block,
                    self.addr
                );
            }
            Message::Cancel(block) => {
                log::debug!(
                    "ignoring cancel {:?} from peer {}",
                    block,
                    self.addr
                );
            }
        }
        Ok(())
    }

    /// Delivers a received block to the piece map and, if it completed its
    /// piece, queues the assembled piece for verification and writing.
    async fn handle_block_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let block = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        log::debug!("received block {:?} from peer {}", block, self.addr);

        if let Some(pos) =
            self.outgoing_requests.iter().position(|b| *b == block)
        {
            self.outgoing_requests.remove(pos);
        } else {
            // the block may still fill a hole (another peer's timed out
            // request, or an unsolicited send); the piece map decides
            log::debug!(
                "peer {} sent block {:?} we didn't request",
                self.addr,
                block
            );
        }

        let receipt = self
            .piece_map
            .write()
            .await
            .on_block(self.addr, piece_index, offset, data);
        match receipt {
            BlockReceipt::Ignored => {
                log::debug!("block {:?} was dropped", block);
            }
            BlockReceipt::Accepted => {}
            BlockReceipt::PieceComplete { data } => {
                log::info!(
                    "piece {} assembled via peer {}",
                    piece_index,
                    self.addr
                );
                self.disk.write_piece(piece_index, data)?;
            }
        }
        Ok(())
    }

    /// Fills the free slots of the request pipeline from the piece map.
    /// No-ops while we're choked or not interested.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }

        let mut blocks = Vec::new();
        {
            let mut piece_map = self.piece_map.write().await;
            let now = Instant::now();
            while self.outgoing_requests.len() + blocks.len()
                < self.conf.request_queue_len
            {
                match piece_map.next_request(self.addr, now) {
                    Some(block) => blocks.push(block),
                    None => break,
                }
            }
        }

        for block in blocks {
            log::debug!("requesting block {:?} from peer {}", block, self.addr);
            self.outgoing_requests.push(block);
            self.send_msg(sink, Message::Request(block)).await?;
        }
        Ok(())
    }

    /// Recomputes whether the peer has anything we still need and announces
    /// interest transitions. Edge triggered: a frame is only sent when the
    /// state actually flips.
    async fn update_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        let has_wanted = self
            .piece_map
            .read()
            .await
            .peer_has_missing_piece(self.addr);
        if has_wanted != self.status.is_interested {
            self.status.is_interested = has_wanted;
            if has_wanted {
                log::info!("interested in peer {}", self.addr);
                self.send_msg(sink, Message::Interested).await?;
            } else {
                log::info!("no longer interested in peer {}", self.addr);
                self.send_msg(sink, Message::NotInterested).await?;
            }
        }
        Ok(())
    }

    async fn send_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        sink.send(msg).await?;
        self.last_send = Instant::now();
        Ok(())
    }
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other. This client is leech-only: the peer is never
/// unchoked.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, the peer doesn't serve our requests.
    is_choked: bool,
    /// If we're interested, the peer has pieces we don't have.
    is_interested: bool,
    /// If the peer is choked, we don't serve its requests. Always true.
    is_peer_choked: bool,
    /// If the peer is interested, it means to download pieces we have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The connection has not been established yet, or the session has shut
    /// down.
    Disconnected,
    /// The TCP connection is being established.
    Connecting,
    /// The BitTorrent handshakes are being exchanged.
    Handshaking,
    /// The window directly after the handshake during which a bitfield may
    /// be received. Closed by the first message of any kind.
    AvailabilityExchange,
    /// The normal state of a session, in which any message except a
    /// bitfield may be exchanged.
    Connected,
    /// The coordinator ordered a shutdown and teardown is in progress.
    Disconnecting,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the connected peer, learned from its handshake.
struct PeerInfo {
    /// The peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// All pieces the peer has advertised, updated by bitfield and have
    /// messages.
    pieces: Option<Bitfield>,
}

/// Checks a received bitfield against the torrent's piece count and trims
/// it down to the logical pieces.
///
/// The raw bits on the wire are the piece count rounded up to a byte
/// boundary; anything else, or a set bit in the padding, is a protocol
/// violation that drops the peer.
fn validate_bitfield(bitfield: &mut Bitfield, piece_count: usize) -> Result<()> {
    if bitfield.len() != 8 * ((piece_count + 7) / 8) {
        return Err(Error::Protocol("bitfield length mismatch"));
    }
    if bitfield[piece_count..].any() {
        return Err(Error::Protocol("bitfield has nonzero padding bits"));
    }
    bitfield.truncate(piece_count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_must_be_piece_count_rounded_to_bytes() {
        // 10 pieces round up to 2 bytes
        let mut bitfield = Bitfield::from_vec(vec![0xff, 0b1100_0000]);
        assert!(validate_bitfield(&mut bitfield, 10).is_ok());
        assert_eq!(bitfield.len(), 10);
        assert!(bitfield.all());

        let mut short = Bitfield::from_vec(vec![0xff]);
        assert!(matches!(
            validate_bitfield(&mut short, 10),
            Err(Error::Protocol(_))
        ));
        let mut long = Bitfield::from_vec(vec![0xff, 0xc0, 0x00]);
        assert!(matches!(
            validate_bitfield(&mut long, 10),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn bitfield_with_nonzero_padding_is_rejected() {
        // bit 10 of a 10 piece torrent is padding
        let mut bitfield = Bitfield::from_vec(vec![0xff, 0b1110_0000]);
        assert!(matches!(
            validate_bitfield(&mut bitfield, 10),
            Err(Error::Protocol(_))
        ));
    }
}
