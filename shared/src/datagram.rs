//! Unreliable but ordered sessions over UDP.
//!
//! Each datagram is a 4-byte big-endian session sequence followed by exactly one
//! complete length-prefixed frame. Receivers only deliver datagrams newer than the
//! last one they delivered, so the session may lose messages but never reorders them.
//! The session is surfaced as an in-memory byte stream, which lets the stream-based
//! connection code and framing run unchanged on top of it.

use crate::error::Result;
use crate::framing::{encode_frame, read_frame, split_frame, LENGTH_PREFIX, MAX_FRAME_SIZE};
use log::{debug, trace, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SEQUENCE_HEADER: usize = 4;
pub const MAX_DATAGRAM_SIZE: usize = SEQUENCE_HEADER + LENGTH_PREFIX + MAX_FRAME_SIZE;

/// Capacity of a session's in-memory pipe
const PIPE_CAPACITY: usize = MAX_FRAME_SIZE * 4;

pub fn wrap_datagram(sequence: u32, frame: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(SEQUENCE_HEADER + frame.len());
    datagram.extend_from_slice(&sequence.to_be_bytes());
    datagram.extend_from_slice(frame);
    datagram
}

/// Splits a datagram into its sequence and frame bytes
pub fn unwrap_datagram(datagram: &[u8]) -> Option<(u32, &[u8])> {
    if datagram.len() < SEQUENCE_HEADER {
        return None;
    }
    let mut header = [0u8; SEQUENCE_HEADER];
    header.copy_from_slice(&datagram[..SEQUENCE_HEADER]);
    Some((u32::from_be_bytes(header), &datagram[SEQUENCE_HEADER..]))
}

/// Accepts strictly increasing sequence numbers, tolerating wrap-around.
#[derive(Debug, Default)]
pub struct SequenceFilter {
    last: Option<u32>,
}

impl SequenceFilter {
    pub fn accept(&mut self, sequence: u32) -> bool {
        let newer = match self.last {
            None => true,
            Some(last) => (sequence.wrapping_sub(last) as i32) > 0,
        };
        if newer {
            self.last = Some(sequence);
        }
        newer
    }
}

/// Starts a datagram session with `peer`.
///
/// `inbound` carries raw datagrams received from that peer (the caller owns the
/// socket's receive side and demultiplexes by address). The returned stream reads the
/// frames delivered by the peer and writes frames that are sent to it. The task ends
/// when either the stream or the inbound channel is dropped.
pub fn open_datagram_session(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut inbound: mpsc::Receiver<Vec<u8>>,
) -> (DuplexStream, JoinHandle<()>) {
    let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (mut pipe_reader, mut pipe_writer) = tokio::io::split(remote);

    let handle = tokio::spawn(async move {
        let incoming = async {
            let mut filter = SequenceFilter::default();
            while let Some(datagram) = inbound.recv().await {
                let Some((sequence, frame)) = unwrap_datagram(&datagram) else {
                    trace!("Runt datagram from {}", peer);
                    continue;
                };
                if split_frame(frame).is_err() {
                    debug!("Dropping malformed datagram from {}", peer);
                    continue;
                }
                if !filter.accept(sequence) {
                    trace!("Dropping stale datagram {} from {}", sequence, peer);
                    continue;
                }
                if pipe_writer.write_all(frame).await.is_err() {
                    break;
                }
            }
        };

        let outgoing = async {
            let mut sequence: u32 = 0;
            loop {
                match read_frame(&mut pipe_reader).await {
                    Ok(Some(payload)) => {
                        let frame = match encode_frame(&payload) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Cannot frame datagram for {}: {}", peer, e);
                                continue;
                            }
                        };
                        let datagram = wrap_datagram(sequence, &frame);
                        sequence = sequence.wrapping_add(1);
                        if let Err(e) = socket.send_to(&datagram, peer).await {
                            warn!("Failed to send datagram to {}: {}", peer, e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Datagram session with {} ended: {}", peer, e);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = incoming => {}
            _ = outgoing => {}
        }
        debug!("Datagram session with {} closed", peer);
    });

    (local, handle)
}

/// Client side: binds an ephemeral socket, talks only to `server` and returns the
/// session stream.
pub async fn connect_datagram(server: SocketAddr) -> Result<(DuplexStream, JoinHandle<()>)> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    socket.connect(server).await?;

    let (tx, rx) = mpsc::channel(256);
    let receiver = socket.clone();
    let reader = tokio::spawn(async move {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match receiver.recv(&mut buffer).await {
                Ok(len) => {
                    // Lossy by contract: a full queue drops the datagram
                    if let Err(mpsc::error::TrySendError::Closed(_)) =
                        tx.try_send(buffer[..len].to_vec())
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Datagram receive error: {}", e);
                    break;
                }
            }
        }
    });

    let (stream, session) = open_datagram_session(socket, server, rx);
    let handle = tokio::spawn(async move {
        let _ = session.await;
        reader.abort();
    });
    Ok((stream, handle))
}
