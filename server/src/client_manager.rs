//! Seat roster for one room.
//!
//! A seat is a player id plus whatever produces its input: a connected (or briefly
//! disconnected) human session, or a bot. Seats carry their own input buffer and
//! acknowledgment state, so reconnecting into a seat resumes exactly where the
//! player left off.

use crate::error::RoomError;
use crate::input_buffer::InputBuffer;
use crate::session::Session;
use log::info;
use shared::InputProvider;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub enum SeatKind {
    Human {
        session: Option<Arc<dyn Session>>,
        /// When the last session dropped; `None` while connected
        disconnected_at: Option<Instant>,
    },
    Bot {
        brain: Box<dyn InputProvider>,
    },
}

pub struct Seat {
    pub player_id: u32,
    pub name: String,
    pub kind: SeatKind,
    pub inputs: InputBuffer,
}

impl Seat {
    pub fn is_bot(&self) -> bool {
        matches!(self.kind, SeatKind::Bot { .. })
    }

    /// Humans with a live session. Bots count as connected.
    pub fn is_connected(&self) -> bool {
        match &self.kind {
            SeatKind::Human { session, .. } => session.is_some(),
            SeatKind::Bot { .. } => true,
        }
    }

    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        match &self.kind {
            SeatKind::Human { session, .. } => session.as_ref(),
            SeatKind::Bot { .. } => None,
        }
    }
}

pub struct ClientManager {
    /// Seats in player id order, so bots decide in a stable order
    seats: BTreeMap<u32, Seat>,
    next_player_id: u32,
    max_seats: usize,
    lookback: u32,
}

impl ClientManager {
    /// Player ids start at 1 and are never reused within a room
    pub fn new(max_seats: usize, lookback: u32) -> Self {
        Self {
            seats: BTreeMap::new(),
            next_player_id: 1,
            max_seats,
            lookback,
        }
    }

    pub fn len(&self) -> usize {
        self.seats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.seats.len() >= self.max_seats
    }

    pub fn capacity(&self) -> usize {
        self.max_seats
    }

    pub fn humans(&self) -> usize {
        self.seats.values().filter(|s| !s.is_bot()).count()
    }

    pub fn bot_ids(&self) -> Vec<u32> {
        self.seats
            .values()
            .filter(|s| s.is_bot())
            .map(|s| s.player_id)
            .collect()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.seats.keys().copied().collect()
    }

    pub fn get(&self, player_id: u32) -> Option<&Seat> {
        self.seats.get(&player_id)
    }

    pub fn get_mut(&mut self, player_id: u32) -> Option<&mut Seat> {
        self.seats.get_mut(&player_id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Seat> {
        self.seats.values_mut()
    }

    fn seat(&mut self, name: String, kind: SeatKind) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let player_id = self.next_player_id;
        self.next_player_id += 1;
        self.seats.insert(
            player_id,
            Seat {
                player_id,
                name,
                kind,
                inputs: InputBuffer::new(self.lookback),
            },
        );
        Some(player_id)
    }

    pub fn add_human(&mut self, name: String, session: Arc<dyn Session>) -> Option<u32> {
        let session_id = session.id();
        let player_id = self.seat(
            name,
            SeatKind::Human {
                session: Some(session),
                disconnected_at: None,
            },
        )?;
        info!("Player {} seated (session {})", player_id, session_id);
        Some(player_id)
    }

    pub fn add_bot(&mut self, name: String, brain: Box<dyn InputProvider>) -> Option<u32> {
        self.seat(name, SeatKind::Bot { brain })
    }

    pub fn remove(&mut self, player_id: u32) -> Option<Seat> {
        self.seats.remove(&player_id)
    }

    /// Splices a new session into a human seat and returns the one it replaced.
    pub fn attach(
        &mut self,
        player_id: u32,
        new_session: Arc<dyn Session>,
    ) -> Result<Option<Arc<dyn Session>>, RoomError> {
        match self.seats.get_mut(&player_id).map(|s| &mut s.kind) {
            Some(SeatKind::Human {
                session,
                disconnected_at,
            }) => {
                *disconnected_at = None;
                Ok(session.replace(new_session))
            }
            _ => Err(RoomError::UnknownPlayer(player_id)),
        }
    }

    /// Marks a seat as disconnected if `session_id` is still the one attached.
    /// A stale session closing after a reconnect is ignored.
    pub fn detach(&mut self, player_id: u32, session_id: u64, now: Instant) -> bool {
        match self.seats.get_mut(&player_id).map(|s| &mut s.kind) {
            Some(SeatKind::Human {
                session,
                disconnected_at,
            }) if session.as_ref().map(|s| s.id()) == Some(session_id) => {
                *session = None;
                *disconnected_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Human seats that have been disconnected for longer than `grace`
    pub fn expired(&self, grace: Duration, now: Instant) -> Vec<u32> {
        self.seats
            .values()
            .filter(|seat| match &seat.kind {
                SeatKind::Human {
                    disconnected_at: Some(at),
                    ..
                } => now.saturating_duration_since(*at) >= grace,
                _ => false,
            })
            .map(|seat| seat.player_id)
            .collect()
    }

    /// Every live session with its player id
    pub fn sessions(&self) -> Vec<(u32, Arc<dyn Session>)> {
        self.seats
            .values()
            .filter_map(|seat| seat.session().map(|s| (seat.player_id, s.clone())))
            .collect()
    }

    pub fn last_processed_inputs(&self) -> HashMap<u32, u32> {
        self.seats
            .values()
            .map(|seat| (seat.player_id, seat.inputs.ack()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use shared::{Input, WanderBot};
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct NullSession {
        id: u64,
        closed: AtomicBool,
    }

    impl NullSession {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Session for NullSession {
        fn id(&self) -> u64 {
            self.id
        }
        fn send(&self, _frame: Vec<u8>) -> Result<(), SessionError> {
            Ok(())
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_capacity_enforced() {
        let mut manager = ClientManager::new(2, 120);
        assert_eq!(manager.add_human("a".into(), NullSession::new(1)), Some(1));
        assert_eq!(
            manager.add_bot("bot".into(), Box::new(WanderBot::new(1))),
            Some(2)
        );
        assert!(manager.is_full());
        assert_eq!(manager.add_human("c".into(), NullSession::new(3)), None);
        assert_eq!(manager.humans(), 1);
        assert_eq!(manager.bot_ids(), vec![2]);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut manager = ClientManager::new(4, 120);
        let first = manager.add_human("a".into(), NullSession::new(1)).unwrap();
        manager.remove(first);
        let second = manager.add_human("b".into(), NullSession::new(2)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_detach_ignores_stale_session() {
        let mut manager = ClientManager::new(4, 120);
        let id = manager.add_human("a".into(), NullSession::new(10)).unwrap();
        let old = manager.attach(id, NullSession::new(11)).unwrap();
        assert_eq!(old.map(|s| s.id()), Some(10));

        assert!(!manager.detach(id, 10, Instant::now()));
        assert!(manager.get(id).unwrap().is_connected());
        assert!(manager.detach(id, 11, Instant::now()));
        assert!(!manager.get(id).unwrap().is_connected());
    }

    #[test]
    fn test_attach_rejects_bots_and_unknown() {
        let mut manager = ClientManager::new(4, 120);
        let bot = manager
            .add_bot("bot".into(), Box::new(WanderBot::new(1)))
            .unwrap();
        assert_eq!(
            manager.attach(bot, NullSession::new(1)).err(),
            Some(RoomError::UnknownPlayer(bot))
        );
        assert_eq!(
            manager.attach(99, NullSession::new(1)).err(),
            Some(RoomError::UnknownPlayer(99))
        );
    }

    #[test]
    fn test_expired_disconnects() {
        let mut manager = ClientManager::new(4, 120);
        let id = manager.add_human("a".into(), NullSession::new(1)).unwrap();
        let then = Instant::now();
        manager.detach(id, 1, then);
        assert!(manager.expired(Duration::from_secs(30), then).is_empty());
        assert_eq!(
            manager.expired(Duration::from_secs(30), then + Duration::from_secs(31)),
            vec![id]
        );
    }

    #[test]
    fn test_last_processed_inputs() {
        let mut manager = ClientManager::new(4, 120);
        let id = manager.add_human("a".into(), NullSession::new(1)).unwrap();
        let seat = manager.get_mut(id).unwrap();
        seat.inputs.push(
            shared::FrameInput {
                sequence: 5,
                frame: 0,
                input: Input::idle(),
            },
            0,
        );
        seat.inputs.take(0, crate::input_buffer::FallbackPolicy::Idle);
        assert_eq!(manager.last_processed_inputs().get(&id), Some(&5));
    }
}
