//! The narrow interface through which a room talks to a connection.

use crate::error::SessionError;
use log::{debug, warn};
use shared::framing::encode_packet;
use shared::Packet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A peer the room can send framed bytes to.
///
/// Implementations must never block: a room broadcasts to every session from its
/// single event loop.
pub trait Session: Send + Sync {
    fn id(&self) -> u64;

    /// Queues one already framed message
    fn send(&self, frame: Vec<u8>) -> Result<(), SessionError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn send_packet(&self, packet: &Packet) -> Result<(), SessionError> {
        let frame = encode_packet(packet)?;
        self.send(frame)
    }
}

/// Session backed by a bounded outbound queue drained by a connection's write task.
///
/// A full queue drops the frame. If the queue stays full for longer than the grace
/// period the peer is treated as dead and the session closes itself.
pub struct ConnectionSession {
    id: u64,
    peer: String,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: watch::Sender<bool>,
    saturated_since: Mutex<Option<Instant>>,
    grace: Duration,
}

impl ConnectionSession {
    pub fn new(
        peer: impl Into<String>,
        capacity: usize,
        grace: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, receiver) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            outbound,
            closed,
            saturated_since: Mutex::new(None),
            grace,
        });
        (session, receiver)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Resolves once the session is closed
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl Session for ConnectionSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let mut saturated = self
            .saturated_since
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.outbound.try_send(frame) {
            Ok(()) => {
                *saturated = None;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let since = *saturated.get_or_insert_with(Instant::now);
                let stalled = since.elapsed();
                if stalled >= self.grace {
                    drop(saturated);
                    warn!(
                        "Session {} ({}) stalled for {:?}, closing",
                        self.id, self.peer, stalled
                    );
                    self.close();
                    Err(SessionError::Backpressure(stalled))
                } else {
                    Err(SessionError::QueueFull)
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                drop(saturated);
                self.close();
                Err(SessionError::Closed)
            }
        }
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Session {} ({}) closed", self.id, self.peer);
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
