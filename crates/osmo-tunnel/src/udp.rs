//! UDP port-forwarding.
//!
//! Every frame on the session stream is one datagram prefixed by the
//! originating peer's address: 4 bytes IPv4 plus 2 bytes port, big endian.
//! Each remote peer gets its own local socket so the local service sees
//! independent clients.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{ByteStream, RelayStats, TunnelError};

pub const UDP_HEADER_LEN: usize = 6;
const MAX_DATAGRAM: usize = 65_535;

/// Prefix `payload` with the peer address header.
#[must_use]
pub fn encode_datagram(peer: SocketAddrV4, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN + payload.len());
    buf.put_slice(&peer.ip().octets());
    buf.put_u16(peer.port());
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a frame into peer address and payload.
///
/// # Errors
/// Returns `MalformedFrame` if the frame is shorter than the header.
pub fn decode_datagram(frame: &Bytes) -> Result<(SocketAddrV4, Bytes), TunnelError> {
    if frame.len() < UDP_HEADER_LEN {
        return Err(TunnelError::MalformedFrame(frame.len()));
    }
    let ip = Ipv4Addr::new(frame[0], frame[1], frame[2], frame[3]);
    let port = u16::from_be_bytes([frame[4], frame[5]]);
    Ok((SocketAddrV4::new(ip, port), frame.slice(UDP_HEADER_LEN..)))
}

struct Peer {
    id: u64,
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// Traffic from the local side of a UDP session.
#[derive(Debug)]
pub enum PeerEvent {
    /// A framed reply for the remote side.
    Reply(Bytes),
    /// The socket of one peer failed; only that peer is affected.
    Failed {
        peer: SocketAddrV4,
        id: u64,
        error: io::Error,
    },
}

/// Local sockets keyed by remote peer address.
pub struct UdpDemux {
    target: SocketAddr,
    peers: HashMap<SocketAddrV4, Peer>,
    next_id: u64,
    outbound: mpsc::Sender<PeerEvent>,
}

impl UdpDemux {
    /// Replies from `target` are framed and sent on `outbound`.
    #[must_use]
    pub fn new(target: SocketAddr, outbound: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            target,
            peers: HashMap::new(),
            next_id: 0,
            outbound,
        }
    }

    /// Send `payload` to the target from the socket owned by `from`.
    ///
    /// A peer whose send fails is released and recreated by its next
    /// datagram.
    ///
    /// # Errors
    /// Returns error if the socket cannot be created or the send fails.
    pub async fn dispatch(&mut self, from: SocketAddrV4, payload: &[u8]) -> io::Result<()> {
        let socket = match self.peers.get(&from) {
            Some(peer) => Arc::clone(&peer.socket),
            None => self.open_peer(from).await?,
        };
        if let Err(e) = socket.send(payload).await {
            self.release(from, None);
            return Err(e);
        }
        Ok(())
    }

    async fn open_peer(&mut self, from: SocketAddrV4) -> io::Result<Arc<UdpSocket>> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?);
        socket.connect(self.target).await?;
        let id = self.next_id;
        self.next_id += 1;
        debug!(peer = %from, local = ?socket.local_addr().ok(), "New UDP peer");
        let reader = tokio::spawn(read_replies(
            Arc::clone(&socket),
            from,
            id,
            self.outbound.clone(),
        ));
        self.peers.insert(
            from,
            Peer {
                id,
                socket: Arc::clone(&socket),
                reader,
            },
        );
        Ok(socket)
    }

    /// Drop the socket of `peer`. With `id` set, only that incarnation is
    /// released, so a late failure cannot remove a recreated peer.
    pub fn release(&mut self, peer: SocketAddrV4, id: Option<u64>) -> bool {
        let current = self
            .peers
            .get(&peer)
            .is_some_and(|p| id.is_none_or(|id| p.id == id));
        if !current {
            return false;
        }
        if let Some(p) = self.peers.remove(&peer) {
            p.reader.abort();
        }
        true
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Stop every peer reader and release its socket.
    pub fn close(&mut self) {
        for (_, peer) in self.peers.drain() {
            peer.reader.abort();
        }
    }
}

impl Drop for UdpDemux {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_replies(
    socket: Arc<UdpSocket>,
    peer: SocketAddrV4,
    id: u64,
    outbound: mpsc::Sender<PeerEvent>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                let frame = encode_datagram(peer, &buf[..n]);
                if outbound.send(PeerEvent::Reply(frame)).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = outbound.send(PeerEvent::Failed { peer, id, error }).await;
                return;
            }
        }
    }
}

/// Forward a UDP session until the remote stream closes or fails.
///
/// Local socket errors only drop the affected peer.
pub async fn forward_udp(remote: ByteStream, target: SocketAddr) -> RelayStats {
    let ByteStream {
        mut sink,
        mut source,
    } = remote;
    let (tx, mut rx) = mpsc::channel(64);
    let mut demux = UdpDemux::new(target, tx);
    let mut stats = RelayStats::default();

    let result: Result<(), TunnelError> = loop {
        tokio::select! {
            frame = source.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                };
                let (peer, payload) = match decode_datagram(&frame) {
                    Ok(decoded) => decoded,
                    Err(e) => break Err(e),
                };
                match demux.dispatch(peer, &payload).await {
                    Ok(()) => stats.bytes_to_local += payload.len() as u64,
                    Err(e) => warn!(peer = %peer, "Dropping UDP peer after send failure: {e}"),
                }
            }
            Some(event) = rx.recv() => match event {
                PeerEvent::Reply(reply) => {
                    let len = (reply.len() - UDP_HEADER_LEN) as u64;
                    if let Err(e) = sink.send(reply).await {
                        break Err(e);
                    }
                    stats.bytes_to_remote += len;
                }
                PeerEvent::Failed { peer, id, error } => {
                    if demux.release(peer, Some(id)) {
                        warn!(peer = %peer, "Dropping UDP peer after receive failure: {error}");
                    }
                }
            },
        }
    };
    stats.error = result.err().map(|e| e.to_string());

    demux.close();
    if let Err(e) = sink.close().await {
        debug!("Closing UDP session stream failed: {e}");
    }
    stats
}
