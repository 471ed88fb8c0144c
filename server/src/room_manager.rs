//! Registry of live rooms.
//!
//! Maps room ids to room handles, creates rooms on demand, routes auto-matched
//! joins into a room with space and periodically closes rooms nobody is using.

use crate::config::ServerConfig;
use crate::room::{Room, RoomHandle};
use crate::token::SessionTokenService;
use log::info;
use shared::RoomInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;

struct Inner {
    config: Arc<ServerConfig>,
    tokens: SessionTokenService,
    rooms: Mutex<HashMap<String, RoomHandle>>,
    next_room: AtomicU64,
}

#[derive(Clone)]
pub struct RoomManager {
    inner: Arc<Inner>,
}

impl RoomManager {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let tokens = SessionTokenService::new(config.token_secret, config.token_ttl);
        Self {
            inner: Arc::new(Inner {
                config,
                tokens,
                rooms: Mutex::new(HashMap::new()),
                next_room: AtomicU64::new(1),
            }),
        }
    }

    pub fn tokens(&self) -> &SessionTokenService {
        &self.inner.tokens
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.inner.config
    }

    /// Returns the named room, creating it if needed. Without a name, picks a room
    /// with a free seat or opens a new one.
    pub async fn get_or_create(&self, room_id: Option<&str>) -> RoomHandle {
        let mut rooms = self.inner.rooms.lock().await;

        if let Some(id) = room_id {
            if let Some(handle) = rooms.get(id).filter(|h| !h.is_closing()) {
                return handle.clone();
            }
            let handle = self.open(id.to_string());
            rooms.insert(id.to_string(), handle.clone());
            return handle;
        }

        let mut joinable: Vec<&RoomHandle> = rooms.values().filter(|h| h.is_joinable()).collect();
        joinable.sort_by(|a, b| a.id().cmp(b.id()));
        if let Some(handle) = joinable.first() {
            return (*handle).clone();
        }

        let id = loop {
            let candidate = format!("room-{}", self.inner.next_room.fetch_add(1, Ordering::Relaxed));
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        let handle = self.open(id.clone());
        rooms.insert(id, handle.clone());
        handle
    }

    fn open(&self, id: String) -> RoomHandle {
        info!("Opening room {}", id);
        let room = Room::new(id, self.inner.config.clone(), self.inner.tokens.clone());
        let (handle, _task) = room.spawn();
        handle
    }

    pub async fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.inner.rooms.lock().await.get(room_id).cloned()
    }

    pub async fn list(&self) -> Vec<RoomInfo> {
        let rooms = self.inner.rooms.lock().await;
        let mut infos: Vec<RoomInfo> = rooms
            .values()
            .filter(|h| !h.is_closing())
            .map(|h| h.info())
            .collect();
        infos.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        infos
    }

    pub async fn len(&self) -> usize {
        self.inner.rooms.lock().await.len()
    }

    /// Closes every room with nobody seated and no round in progress. Returns the
    /// ids of the closed rooms.
    pub async fn reap(&self) -> Vec<String> {
        let mut rooms = self.inner.rooms.lock().await;
        let idle: Vec<String> = rooms
            .iter()
            .filter(|(_, handle)| handle.mark_closing_if_idle())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &idle {
            if let Some(handle) = rooms.remove(id) {
                info!("Reaping idle room {}", id);
                handle.shutdown();
            }
        }
        idle
    }

    pub fn spawn_reaper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(manager.inner.config.reap_interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.reap().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn shutdown_all(&self) {
        let mut rooms = self.inner.rooms.lock().await;
        for (id, handle) in rooms.drain() {
            info!("Closing room {}", id);
            handle.shutdown();
        }
    }
}
