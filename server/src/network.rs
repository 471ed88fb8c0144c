//! Listener side of the server: accepts TCP streams or demultiplexes UDP peers into
//! datagram sessions, and hands every connection to [`serve_connection`].

use crate::config::ServerConfig;
use crate::connection::serve_connection;
use crate::room_manager::RoomManager;
use log::{debug, error, info, warn};
use shared::datagram::{open_datagram_session, MAX_DATAGRAM_SIZE};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};

/// Datagrams buffered per UDP peer before new ones are dropped
const PEER_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Transport {
    /// Reliable ordered stream
    Tcp,
    /// Sequenced datagrams, stale ones discarded
    Udp,
}

enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// Cloneable trigger that stops a running [`Server`]
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

pub struct Server {
    listener: Listener,
    local_addr: SocketAddr,
    rooms: RoomManager,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        transport: Transport,
        config: ServerConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = match transport {
            Transport::Tcp => Listener::Tcp(TcpListener::bind(addr).await?),
            Transport::Udp => Listener::Udp(Arc::new(UdpSocket::bind(addr).await?)),
        };
        let local_addr = match &listener {
            Listener::Tcp(l) => l.local_addr()?,
            Listener::Udp(s) => s.local_addr()?,
        };
        info!("Server listening on {} ({:?})", local_addr, transport);

        let (shutdown, _) = watch::channel(false);
        Ok(Server {
            listener,
            local_addr,
            rooms: RoomManager::new(Arc::new(config)),
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn rooms(&self) -> RoomManager {
        self.rooms.clone()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(self.shutdown.clone())
    }

    /// Serves until the shutdown trigger fires, then closes every room
    pub async fn run(self) {
        let reaper = self.rooms.spawn_reaper(self.shutdown.subscribe());
        let mut stop = self.shutdown.subscribe();

        match &self.listener {
            Listener::Tcp(listener) => loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                            }
                            tokio::spawn(serve_connection(
                                stream,
                                addr.to_string(),
                                self.rooms.clone(),
                                self.shutdown.subscribe(),
                            ));
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                    _ = stop.changed() => break,
                }
            },
            Listener::Udp(socket) => self.run_datagrams(socket.clone(), &mut stop).await,
        }

        info!("Shutting down");
        self.rooms.shutdown_all().await;
        // Give connection writers a moment to flush their goodbyes
        tokio::time::sleep(Duration::from_millis(100)).await;
        reaper.abort();
    }

    async fn run_datagrams(&self, socket: Arc<UdpSocket>, stop: &mut watch::Receiver<bool>) {
        let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, addr)) => {
                        let datagram = buffer[..len].to_vec();
                        let datagram = match peers.get(&addr) {
                            Some(inbound) => match inbound.try_send(datagram) {
                                Ok(()) => continue,
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    debug!("Peer {} queue full, dropping datagram", addr);
                                    continue;
                                }
                                // The previous session ended; this datagram starts a new one
                                Err(mpsc::error::TrySendError::Closed(datagram)) => datagram,
                            },
                            None => datagram,
                        };

                        peers.retain(|_, inbound| !inbound.is_closed());
                        let (inbound, queue) = mpsc::channel(PEER_QUEUE);
                        let _ = inbound.try_send(datagram);
                        peers.insert(addr, inbound);

                        let (stream, _task) = open_datagram_session(socket.clone(), addr, queue);
                        tokio::spawn(serve_connection(
                            stream,
                            format!("udp://{}", addr),
                            self.rooms.clone(),
                            self.shutdown.subscribe(),
                        ));
                    }
                    Err(e) => {
                        // ICMP port unreachable from a departed peer surfaces here on some platforms
                        error!("Datagram receive failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = stop.changed() => break,
            }
        }
    }
}
