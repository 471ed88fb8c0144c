//! Per-connection tasks.
//!
//! Each accepted stream gets a read loop, a writer draining the session's bounded
//! queue and a heartbeat. The read loop turns packets into room events; the room
//! answers through the session. Works over anything that is `AsyncRead +
//! AsyncWrite`, so TCP streams and datagram sessions share this code.

use crate::error::RoomError;
use crate::room::{RoomEvent, RoomHandle};
use crate::room_manager::RoomManager;
use crate::session::{ConnectionSession, Session};
use log::{debug, info, warn};
use shared::framing::{read_packet, write_frame};
use shared::{now_ms, Packet};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};

const MAX_NAME_LEN: usize = 16;

struct SeatRef {
    room: RoomHandle,
    player_id: u32,
}

struct Connection {
    peer: String,
    session: Arc<ConnectionSession>,
    rooms: RoomManager,
    seat: Option<SeatRef>,
}

/// Serves one client until it leaves, goes silent, misbehaves or the server shuts
/// down.
pub async fn serve_connection<S>(
    stream: S,
    peer: impl Into<String>,
    rooms: RoomManager,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let peer = peer.into();
    let config = rooms.config().clone();
    let (mut reader, writer) = tokio::io::split(stream);
    let (session, outbound) =
        ConnectionSession::new(peer.clone(), config.outbound_queue, config.backpressure_grace);
    let mut closed = session.closed_signal();
    info!("Client connected from {} (session {})", peer, session.id());

    let writer_task = tokio::spawn(write_loop(
        writer,
        outbound,
        session.clone(),
        config.write_timeout,
    ));
    let last_seen = Arc::new(AtomicU64::new(now_ms()));
    let heartbeat_task = tokio::spawn(heartbeat_loop(
        session.clone(),
        last_seen.clone(),
        config.heartbeat_interval,
        config.heartbeat_timeout(),
    ));

    let mut connection = Connection {
        peer,
        session,
        rooms,
        seat: None,
    };

    loop {
        if *closed.borrow() {
            break;
        }
        tokio::select! {
            _ = closed.changed() => {}

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    connection.reply(&Packet::Disconnected {
                        reason: "server shutting down".to_string(),
                    });
                    break;
                }
            }

            read = timeout(config.read_timeout, read_packet(&mut reader)) => match read {
                Ok(Ok(Some(packet))) => {
                    last_seen.store(now_ms(), Ordering::Relaxed);
                    if connection.handle(packet).await.is_break() {
                        break;
                    }
                }
                Ok(Ok(None)) => {
                    info!("Client {} closed the connection", connection.peer);
                    break;
                }
                Ok(Err(e)) => {
                    warn!("Dropping client {}: {}", connection.peer, e);
                    break;
                }
                Err(_) => {
                    info!(
                        "Client {} sent nothing for {:?}",
                        connection.peer, config.read_timeout
                    );
                    break;
                }
            }
        }
    }

    connection.finish().await;
    heartbeat_task.abort();
    if timeout(config.write_timeout, writer_task).await.is_err() {
        debug!("Writer did not finish flushing in time");
    }
}

impl Connection {
    async fn handle(&mut self, packet: Packet) -> ControlFlow<()> {
        match packet {
            Packet::Join { room_id, name } => {
                self.join(room_id, sanitize_name(&name)).await;
            }
            Packet::Reconnect { token } => self.reconnect(&token).await,
            Packet::Leave => {
                if let Some(seat) = self.seat.take() {
                    let _ = seat
                        .room
                        .send(RoomEvent::Leave {
                            player_id: seat.player_id,
                        })
                        .await;
                }
            }
            Packet::Input { inputs, .. } => {
                if let Some(seat) = &self.seat {
                    let delivered = seat.room.try_send(RoomEvent::Input {
                        player_id: seat.player_id,
                        inputs,
                    });
                    if !delivered {
                        debug!("Room mailbox full, dropping input from {}", self.peer);
                    }
                }
            }
            Packet::RoomAction { action } => {
                if let Some(seat) = &self.seat {
                    let _ = seat
                        .room
                        .send(RoomEvent::Action {
                            player_id: seat.player_id,
                            action,
                        })
                        .await;
                }
            }
            Packet::RoomListRequest => {
                let rooms = self.rooms.list().await;
                self.reply(&Packet::RoomList { rooms });
            }
            Packet::Ping { nonce, sent_at_ms } => {
                self.reply(&Packet::Pong {
                    nonce,
                    echo_ms: sent_at_ms,
                    peer_time_ms: now_ms(),
                });
            }
            Packet::Pong { nonce, echo_ms, .. } => {
                debug!(
                    "Heartbeat {} from {}: rtt {}ms",
                    nonce,
                    self.peer,
                    now_ms().saturating_sub(echo_ms)
                );
            }
            other => {
                warn!(
                    "Client {} sent server-only packet {}, closing",
                    self.peer,
                    other.kind()
                );
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn join(&mut self, room_id: Option<String>, name: String) {
        self.release_seat(true).await;

        // A room may close between lookup and join; one retry lands in a fresh one
        let mut retried = false;
        loop {
            let room = self.rooms.get_or_create(room_id.as_deref()).await;
            match room.join(self.session.clone(), name.clone()).await {
                Ok(player_id) => {
                    info!(
                        "Client {} is player {} in room {}",
                        self.peer,
                        player_id,
                        room.id()
                    );
                    self.seat = Some(SeatRef { room, player_id });
                    return;
                }
                Err(RoomError::Closed) if !retried => retried = true,
                Err(e) => {
                    self.reply(&Packet::JoinRejected {
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    async fn reconnect(&mut self, token: &str) {
        let claims = match self.rooms.tokens().verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                info!("Client {} presented a bad token: {}", self.peer, e);
                return self.reject_reconnect(RoomError::from(e));
            }
        };
        let Some(room) = self.rooms.get(&claims.room_id).await else {
            return self.reject_reconnect(RoomError::Closed);
        };

        self.release_seat(false).await;
        match room.reconnect(self.session.clone(), claims).await {
            Ok(player_id) => {
                info!(
                    "Client {} resumed as player {} in room {}",
                    self.peer,
                    player_id,
                    room.id()
                );
                self.seat = Some(SeatRef { room, player_id });
            }
            Err(e) => self.reject_reconnect(e),
        }
    }

    fn reject_reconnect(&self, error: RoomError) {
        self.reply(&Packet::ReconnectRejected {
            reason: error.to_string(),
        });
    }

    /// Gives up the current seat, either for good or as a disconnect the seat can
    /// come back from.
    async fn release_seat(&mut self, leave: bool) {
        let Some(seat) = self.seat.take() else {
            return;
        };
        let event = if leave {
            RoomEvent::Leave {
                player_id: seat.player_id,
            }
        } else {
            RoomEvent::Disconnected {
                player_id: seat.player_id,
                session_id: self.session.id(),
            }
        };
        let _ = seat.room.send(event).await;
    }

    fn reply(&self, packet: &Packet) {
        if let Err(e) = self.session.send_packet(packet) {
            debug!("Could not queue {} for {}: {}", packet.kind(), self.peer, e);
        }
    }

    async fn finish(&mut self) {
        self.release_seat(false).await;
        self.session.close();
        info!("Client {} disconnected", self.peer);
    }
}

fn sanitize_name(name: &str) -> String {
    let name: String = name
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LEN)
        .collect();
    if name.is_empty() {
        "player".to_string()
    } else {
        name
    }
}

async fn write_loop<W>(
    mut writer: WriteHalf<W>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    session: Arc<ConnectionSession>,
    write_timeout: Duration,
) where
    W: AsyncRead + AsyncWrite,
{
    let mut closed = session.closed_signal();
    loop {
        tokio::select! {
            biased;

            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if !write_with_timeout(&mut writer, &frame, write_timeout, session.peer()).await {
                        session.close();
                        break;
                    }
                }
                None => break,
            },

            _ = closed.changed() => {
                // Flush what was queued before the close, e.g. a rejection or goodbye
                while let Ok(frame) = outbound.try_recv() {
                    if !write_with_timeout(&mut writer, &frame, write_timeout, session.peer()).await {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_with_timeout<W>(writer: &mut W, frame: &[u8], limit: Duration, peer: &str) -> bool
where
    W: AsyncWrite + Unpin,
{
    match timeout(limit, write_frame(writer, frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Write to {} failed: {}", peer, e);
            false
        }
        Err(_) => {
            warn!("Write to {} stalled for {:?}", peer, limit);
            false
        }
    }
}

async fn heartbeat_loop(
    session: Arc<ConnectionSession>,
    last_seen: Arc<AtomicU64>,
    every: Duration,
    limit: Duration,
) {
    let mut ticker = interval(every);
    ticker.tick().await;
    let mut nonce: u32 = 0;
    loop {
        ticker.tick().await;
        if session.is_closed() {
            break;
        }
        let silent = now_ms().saturating_sub(last_seen.load(Ordering::Relaxed));
        if silent >= limit.as_millis() as u64 {
            warn!(
                "Client {} missed heartbeats for {}ms, closing",
                session.peer(),
                silent
            );
            session.close();
            break;
        }
        nonce = nonce.wrapping_add(1);
        let _ = session.send_packet(&Packet::Ping {
            nonce,
            sent_at_ms: now_ms(),
        });
    }
}
