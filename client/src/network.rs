use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::game::ClientGameState;
use crate::rendering::Renderer;
use log::{debug, error, info, warn};
use shared::datagram::connect_datagram;
use shared::framing::{read_packet, write_packet};
use shared::{
    now_ms, FrameInput, GameConfig, InputProvider, Packet, RoomAction, RoomInfo, Snapshot,
    WanderBot, WorldView,
};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, timeout_at, Instant, MissedTickBehavior};

/// Non-snapshot packets buffered between two polls
const INBOX_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Transport {
    Tcp,
    Udp,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Folds an unread snapshot into a newer one so no tile change is lost when the
/// older one is overwritten.
pub fn merge_snapshots(older: Snapshot, mut newer: Snapshot) -> Snapshot {
    if newer.full || older.seed != newer.seed {
        return newer;
    }
    let mut tile_changes = older.tile_changes;
    tile_changes.append(&mut newer.tile_changes);
    newer.tile_changes = tile_changes;
    newer.full |= older.full;
    newer
}

/// Hand-off between the network reader and the frame loop.
///
/// Snapshots go to a single latest-wins slot; everything else queues in order, oldest
/// dropped first when the frame loop falls behind.
#[derive(Default)]
pub struct Inbox {
    snapshot: Mutex<Option<Snapshot>>,
    packets: Mutex<VecDeque<Packet>>,
    closed: AtomicBool,
    notify: Notify,
}

impl Inbox {
    pub fn push(&self, packet: Packet) {
        match packet {
            Packet::Snapshot(snapshot) => {
                let mut slot = lock(&self.snapshot);
                let merged = match slot.take() {
                    Some(older) => merge_snapshots(older, snapshot),
                    None => snapshot,
                };
                *slot = Some(merged);
            }
            other => {
                let mut packets = lock(&self.packets);
                if packets.len() >= INBOX_CAPACITY {
                    if let Some(dropped) = packets.pop_front() {
                        warn!("Inbox full, dropping {}", dropped.kind());
                    }
                }
                packets.push_back(other);
            }
        }
        self.notify.notify_one();
    }

    pub fn take_snapshot(&self) -> Option<Snapshot> {
        lock(&self.snapshot).take()
    }

    pub fn drain(&self) -> Vec<Packet> {
        lock(&self.packets).drain(..).collect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

/// A packet held back by simulated latency until `release`
type Delayed = (Instant, Packet);

/// One live connection: the reader and writer tasks plus the queue feeding the writer.
///
/// Fake ping stamps every packet with a release time when it enters the link, so
/// packets overlap in flight and the delay never limits throughput.
struct Link {
    inbox: Arc<Inbox>,
    outbound: mpsc::Sender<Delayed>,
    one_way: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    async fn open(
        server: SocketAddr,
        transport: Transport,
        fake_ping: Duration,
    ) -> Result<Self, ClientError> {
        match transport {
            Transport::Tcp => {
                let stream = TcpStream::connect(server).await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok(Self::spawn(reader, writer, fake_ping, None))
            }
            Transport::Udp => {
                let (stream, session) = connect_datagram(server).await?;
                let (reader, writer) = tokio::io::split(stream);
                Ok(Self::spawn(reader, writer, fake_ping, Some(session)))
            }
        }
    }

    fn spawn<R, W>(
        mut reader: R,
        mut writer: W,
        fake_ping: Duration,
        session: Option<JoinHandle<()>>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let inbox = Arc::new(Inbox::default());
        let (outbound, mut queue) = mpsc::channel::<Delayed>(OUTBOUND_CAPACITY);
        let (arrived, mut arrivals) = mpsc::channel::<Delayed>(INBOX_CAPACITY);
        // Simulated latency is split evenly between the two directions
        let one_way = fake_ping / 2;

        let read_task = tokio::spawn(async move {
            loop {
                match read_packet(&mut reader).await {
                    Ok(Some(packet)) => {
                        if arrived.send((Instant::now() + one_way, packet)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Error reading from server: {}", e);
                        break;
                    }
                }
            }
        });

        // Closes the inbox only after every delayed packet has been handed over
        let read_inbox = inbox.clone();
        let deliver_task = tokio::spawn(async move {
            while let Some((release, packet)) = arrivals.recv().await {
                sleep_until(release).await;
                read_inbox.push(packet);
            }
            read_inbox.close();
        });

        let write_task = tokio::spawn(async move {
            while let Some((release, packet)) = queue.recv().await {
                sleep_until(release).await;
                if let Err(e) = write_packet(&mut writer, &packet).await {
                    debug!("Error sending {}: {}", packet.kind(), e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut tasks = vec![read_task, deliver_task, write_task];
        tasks.extend(session);
        Self {
            inbox,
            outbound,
            one_way,
            tasks,
        }
    }

    fn send(&self, packet: Packet) -> Result<(), ClientError> {
        match self.outbound.try_send((Instant::now() + self.one_way, packet)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full((_, packet))) => {
                // Inputs are resent in every batch; anything else is retried by the caller
                debug!("Outbound queue full, dropping {}", packet.kind());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ClientError::Closed),
        }
    }

    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Network client: owns the connection and drives a [`ClientGameState`] from it.
pub struct Client {
    server: SocketAddr,
    transport: Transport,
    fake_ping: Duration,
    link: Link,
    state: ClientGameState,

    token: Option<String>,
    seated: bool,
    rejection: Option<String>,
    rooms: Vec<RoomInfo>,
    next_nonce: u32,
}

impl Client {
    pub async fn connect(
        server: &str,
        transport: Transport,
        config: ClientConfig,
        game: GameConfig,
        fake_ping_ms: u64,
    ) -> Result<Self, ClientError> {
        let server = lookup_host(server).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "server address did not resolve")
        })?;
        let fake_ping = Duration::from_millis(fake_ping_ms);
        let link = Link::open(server, transport, fake_ping).await?;
        info!("Connected to {} over {:?}", server, transport);

        Ok(Self {
            server,
            transport,
            fake_ping,
            link,
            state: ClientGameState::new(config, game),
            token: None,
            seated: false,
            rejection: None,
            rooms: Vec::new(),
            next_nonce: 0,
        })
    }

    pub fn state(&self) -> &ClientGameState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ClientGameState {
        &mut self.state
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn rooms(&self) -> &[RoomInfo] {
        &self.rooms
    }

    pub fn is_seated(&self) -> bool {
        self.seated
    }

    pub fn is_connected(&self) -> bool {
        !self.link.inbox.is_closed()
    }

    pub fn send(&self, packet: Packet) -> Result<(), ClientError> {
        self.link.send(packet)
    }

    /// Asks for a seat in `room_id`, or in any open room when `None`
    pub async fn join(
        &mut self,
        room_id: Option<&str>,
        name: &str,
        timeout: Duration,
    ) -> Result<u32, ClientError> {
        self.seated = false;
        self.rejection = None;
        self.send(Packet::Join {
            room_id: room_id.map(str::to_string),
            name: name.to_string(),
        })?;
        self.await_seat(timeout).await
    }

    /// Opens a fresh connection and reclaims the seat held by the stored token
    pub async fn reconnect(&mut self, timeout: Duration) -> Result<u32, ClientError> {
        let token = self.token.clone().ok_or(ClientError::NoToken)?;
        self.link.abort();
        self.link = Link::open(self.server, self.transport, self.fake_ping).await?;
        self.seated = false;
        self.rejection = None;
        self.send(Packet::Reconnect { token })?;
        self.await_seat(timeout).await
    }

    async fn await_seat(&mut self, timeout: Duration) -> Result<u32, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if let Some(reason) = self.rejection.take() {
                return Err(ClientError::Rejected(reason));
            }
            if self.seated {
                if let Some(id) = self.state.player_id() {
                    return Ok(id);
                }
            }
            if self.link.inbox.is_closed() {
                return Err(ClientError::Closed);
            }
            if timeout_at(deadline, self.link.inbox.notified()).await.is_err() {
                return Err(ClientError::Timeout(timeout));
            }
        }
    }

    pub fn leave(&mut self) -> Result<(), ClientError> {
        self.seated = false;
        self.send(Packet::Leave)
    }

    pub fn request_rooms(&self) -> Result<(), ClientError> {
        self.send(Packet::RoomListRequest)
    }

    pub fn room_action(&self, action: RoomAction) -> Result<(), ClientError> {
        self.send(Packet::RoomAction { action })
    }

    pub fn ping(&mut self) -> Result<(), ClientError> {
        self.next_nonce = self.next_nonce.wrapping_add(1);
        self.send(Packet::Ping {
            nonce: self.next_nonce,
            sent_at_ms: now_ms(),
        })
    }

    /// Processes everything received since the last call. Returns how many packets
    /// were handled.
    pub fn poll(&mut self) -> usize {
        let now = now_ms();
        let packets = self.link.inbox.drain();
        let mut handled = packets.len();
        for packet in packets {
            self.handle_packet(packet, now);
        }
        if let Some(snapshot) = self.link.inbox.take_snapshot() {
            handled += 1;
            if self.seated {
                self.state.apply_snapshot(&snapshot, now);
            }
        }
        handled
    }

    fn handle_packet(&mut self, packet: Packet, now: u64) {
        match packet {
            Packet::Joined {
                player_id,
                room_id,
                token,
                seed,
                tick_rate,
                frame,
            }
            | Packet::Reconnected {
                player_id,
                room_id,
                token,
                seed,
                tick_rate,
                frame,
            } => {
                self.state.set_tick_rate(tick_rate);
                self.state.on_joined(player_id, &room_id, seed, frame, now);
                self.token = Some(token);
                self.seated = true;
            }
            Packet::JoinRejected { reason } | Packet::ReconnectRejected { reason } => {
                warn!("Server refused: {}", reason);
                self.rejection = Some(reason);
            }
            Packet::Snapshot(snapshot) => {
                if self.seated {
                    self.state.apply_snapshot(&snapshot, now);
                }
            }
            Packet::Event(event) => self.state.handle_event(&event),
            Packet::RoomList { rooms } => {
                debug!("{} rooms open", rooms.len());
                self.rooms = rooms;
            }
            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.seated = false;
            }
            Packet::Ping { nonce, sent_at_ms } => {
                let pong = Packet::Pong {
                    nonce,
                    echo_ms: sent_at_ms,
                    peer_time_ms: now,
                };
                if let Err(e) = self.send(pong) {
                    debug!("Could not answer ping: {}", e);
                }
            }
            Packet::Pong {
                echo_ms,
                peer_time_ms,
                ..
            } => {
                self.state
                    .latency_mut()
                    .record_pong(echo_ms, peer_time_ms, now);
            }
            other => warn!("Unexpected {} from server", other.kind()),
        }
    }

    /// Runs one local frame and sends the input batch
    pub fn tick(&mut self) -> Result<Option<FrameInput>, ClientError> {
        if !self.seated {
            return Ok(None);
        }
        let record = self.state.step(now_ms());
        if record.is_some() {
            if let Some(packet) = self.state.input_packet() {
                self.send(packet)?;
            }
        }
        Ok(record)
    }

    fn autopilot(&mut self, bot: &mut WanderBot) {
        let (Some(player_id), Some(predictor)) = (self.state.player_id(), self.state.predictor())
        else {
            return;
        };
        let world = predictor.world();
        let input = bot.decide(&WorldView {
            frame: world.frame(),
            player_id,
            simulation: world,
        });
        self.state.set_input(input);
    }

    /// Frame loop: poll, predict, send, render, with heartbeats on the side. A lost
    /// connection is retried once with the stored token.
    pub async fn run(
        &mut self,
        duration: Option<Duration>,
        renderer: &mut dyn Renderer,
        mut autopilot: Option<WanderBot>,
    ) -> Result<(), ClientError> {
        let frame_ms = self.state.game_config().frame_duration_ms();
        let mut frames = interval(Duration::from_secs_f64(frame_ms / 1000.0));
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(self.state.config().heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = Instant::now();

        while renderer.is_open() {
            if duration.is_some_and(|d| started.elapsed() >= d) {
                break;
            }

            tokio::select! {
                _ = frames.tick() => {
                    self.poll();
                    if self.link.inbox.is_closed() {
                        warn!("Connection lost, trying to reclaim the seat");
                        if let Err(e) = self.reconnect(RECONNECT_TIMEOUT).await {
                            error!("Reconnect failed: {}", e);
                            return Err(e);
                        }
                        continue;
                    }
                    if let Some(bot) = autopilot.as_mut() {
                        self.autopilot(bot);
                    }
                    self.tick()?;
                    if let Some(view) = self.state.view(now_ms()) {
                        renderer
                            .render(&view)
                            .map_err(|e| ClientError::Render(e.to_string()))?;
                    }
                }
                _ = heartbeat.tick() => {
                    self.ping()?;
                }
            }
        }

        if self.seated {
            self.leave()?;
            // Give the writer a moment to flush the goodbye
            sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Phase, TileChange, TileType};
    use std::collections::HashMap;

    fn snapshot(frame: u32, seed: u64, changes: Vec<TileChange>, full: bool) -> Snapshot {
        Snapshot {
            frame,
            phase: Phase::Running,
            seed,
            server_time_ms: frame as u64 * 16,
            players: Vec::new(),
            bombs: Vec::new(),
            explosions: Vec::new(),
            tile_changes: changes,
            last_processed_input: HashMap::new(),
            full,
        }
    }

    fn change(x: i32) -> TileChange {
        TileChange {
            x,
            y: 1,
            tile: TileType::Empty,
        }
    }

    fn ping(nonce: u32) -> Packet {
        Packet::Ping {
            nonce,
            sent_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_fake_ping_delays_without_throttling_inbound() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client_side);
        let link = Link::spawn(reader, writer, Duration::from_millis(100), None);

        let start = Instant::now();
        for nonce in 0..120 {
            write_packet(&mut server_side, &ping(nonce)).await.unwrap();
        }

        let mut received = Vec::new();
        let deadline = start + Duration::from_secs(1);
        while received.len() < 120 && Instant::now() < deadline {
            let _ = timeout_at(deadline, link.inbox.notified()).await;
            received.extend(link.inbox.drain());
        }
        // Serial 50ms waits would need six seconds for this many packets
        assert_eq!(received.len(), 120);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(matches!(received[0], Packet::Ping { nonce: 0, .. }));
        assert!(matches!(received[119], Packet::Ping { nonce: 119, .. }));
    }

    #[tokio::test]
    async fn test_fake_ping_delays_without_throttling_outbound() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client_side);
        let link = Link::spawn(reader, writer, Duration::from_millis(100), None);

        let start = Instant::now();
        for nonce in 0..60 {
            link.send(ping(nonce)).unwrap();
        }
        let nonces = tokio::time::timeout(Duration::from_secs(1), async {
            let mut nonces = Vec::new();
            while nonces.len() < 60 {
                match read_packet(&mut server_side).await.unwrap() {
                    Some(Packet::Ping { nonce, .. }) => nonces.push(nonce),
                    other => panic!("unexpected {:?}", other),
                }
            }
            nonces
        })
        .await
        .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(nonces, (0..60).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_keeps_older_tile_changes() {
        let merged = merge_snapshots(
            snapshot(1, 5, vec![change(1)], true),
            snapshot(2, 5, vec![change(3)], false),
        );
        assert_eq!(merged.frame, 2);
        assert!(merged.full);
        assert_eq!(merged.tile_changes, vec![change(1), change(3)]);
    }

    #[test]
    fn test_merge_new_round_discards_older() {
        let merged = merge_snapshots(
            snapshot(400, 5, vec![change(1)], false),
            snapshot(0, 6, Vec::new(), true),
        );
        assert_eq!(merged.seed, 6);
        assert!(merged.tile_changes.is_empty());
    }

    #[test]
    fn test_inbox_latest_snapshot_wins() {
        let inbox = Inbox::default();
        inbox.push(Packet::Snapshot(snapshot(1, 5, vec![change(1)], false)));
        inbox.push(Packet::Pong {
            nonce: 1,
            echo_ms: 0,
            peer_time_ms: 0,
        });
        inbox.push(Packet::Snapshot(snapshot(2, 5, Vec::new(), false)));

        let latest = inbox.take_snapshot().unwrap();
        assert_eq!(latest.frame, 2);
        assert_eq!(latest.tile_changes, vec![change(1)]);
        assert!(inbox.take_snapshot().is_none());
        assert_eq!(inbox.drain().len(), 1);
    }

    #[test]
    fn test_inbox_bounded() {
        let inbox = Inbox::default();
        for nonce in 0..(INBOX_CAPACITY as u32 + 10) {
            inbox.push(Packet::Ping {
                nonce,
                sent_at_ms: 0,
            });
        }
        let packets = inbox.drain();
        assert_eq!(packets.len(), INBOX_CAPACITY);
        assert_eq!(
            packets[0],
            Packet::Ping {
                nonce: 10,
                sent_at_ms: 0
            }
        );
    }

    #[tokio::test]
    async fn test_link_reads_and_closes() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(client_side);
        let link = Link::spawn(reader, writer, Duration::ZERO, None);

        write_packet(
            &mut server_side,
            &Packet::Disconnected {
                reason: "bye".to_string(),
            },
        )
        .await
        .unwrap();
        link.send(Packet::Leave).unwrap();
        assert_eq!(read_packet(&mut server_side).await.unwrap(), Some(Packet::Leave));

        drop(server_side);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !link.inbox.is_closed() {
                link.inbox.notified().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(link.inbox.drain().len(), 1);
    }
}
