//! services/api/src/web/state.rs
//!
//! Defines the application's shared state: the presence registry mapping
//! users to live connections, and the per-session runtime state driving a
//! game room. Everything here is ephemeral; durable facts live behind the
//! `GameStore` port.

use crate::config::Config;
use crate::web::protocol::ServerMessage;
use classdare_core::ports::{GameStore, TokenVerifier};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn GameStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: Arc<Config>,
    pub presence: PresenceRegistry,
    pub rooms: SessionStateStore,
}

//=========================================================================================
// Presence Registry (user id -> live connection)
//=========================================================================================

/// The outbound half of a connection: messages pushed here are drained into
/// the WebSocket sink by the connection's writer task.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

struct PresenceEntry {
    conn_id: Uuid,
    sender: ClientSender,
}

/// A process-wide map from user identity to their active connection.
///
/// Registration overwrites any stale mapping for the same user (latest
/// connection wins). Unregistration is conditional on the connection id, so a
/// reconnect that beat the old connection's teardown is never clobbered.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<HashMap<Uuid, PresenceEntry>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: Uuid, conn_id: Uuid, sender: ClientSender) {
        let mut map = self.inner.lock().await;
        map.insert(user_id, PresenceEntry { conn_id, sender });
    }

    /// Removes the mapping only if it still belongs to `conn_id`.
    /// Returns whether this connection was still the registered one.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut map = self.inner.lock().await;
        match map.get(&user_id) {
            Some(entry) if entry.conn_id == conn_id => {
                map.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn sender_for(&self, user_id: Uuid) -> Option<ClientSender> {
        let map = self.inner.lock().await;
        map.get(&user_id).map(|e| e.sender.clone())
    }

    /// Best-effort targeted send; a missing or closed connection is not an error.
    pub async fn send_to(&self, user_id: Uuid, msg: ServerMessage) {
        if let Some(sender) = self.sender_for(user_id).await {
            let _ = sender.send(msg);
        }
    }
}

//=========================================================================================
// Per-Session Runtime State
//=========================================================================================

/// Where the current turn stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Player chosen but not yet revealed to the room.
    Spinning,
    /// Player revealed; waiting for the teacher to draw a prompt.
    Revealed,
    /// Prompt out; the answer window is open.
    Answering,
    /// Answer in; the grading window is open.
    Grading,
}

/// The player currently on the spot, and how far their turn has progressed.
/// `turn_id` is set once the durable turn record exists (at prompt draw).
#[derive(Debug, Clone)]
pub struct ActiveTurn {
    pub user_id: Uuid,
    pub participant_id: Uuid,
    pub turn_id: Option<Uuid>,
    pub phase: TurnPhase,
}

/// A roster row mirrored into memory for gameplay decisions.
#[derive(Debug, Clone)]
pub struct RosterSlot {
    pub participant_id: Uuid,
    pub online: bool,
}

/// The ephemeral, authoritative state of one live room. Never persisted;
/// losing it on restart means the room must be recreated.
pub struct RoomState {
    pub session_id: Uuid,
    pub teacher_id: Uuid,
    pub category_id: i64,
    /// Student user id -> roster slot.
    pub roster: HashMap<Uuid, RosterSlot>,
    /// Server-owned turn order: every participant is selected exactly once.
    pub queue: VecDeque<Uuid>,
    /// Players already selected this session (so a rejoin is never re-queued).
    pub played: HashSet<Uuid>,
    /// Set once the teacher starts the game and the queue is dealt.
    pub started: bool,
    pub active: Option<ActiveTurn>,
    /// Cancels the live answer/grading timer. Replaced on every new window,
    /// cancelled on every resolution path.
    pub turn_timer: Option<CancellationToken>,
}

impl RoomState {
    fn new(session_id: Uuid, teacher_id: Uuid, category_id: i64) -> Self {
        Self {
            session_id,
            teacher_id,
            category_id,
            roster: HashMap::new(),
            queue: VecDeque::new(),
            played: HashSet::new(),
            started: false,
            active: None,
            turn_timer: None,
        }
    }

    /// Cancels and discards the current turn timer, if any.
    pub fn cancel_timer(&mut self) {
        if let Some(token) = self.turn_timer.take() {
            token.cancel();
        }
    }

    /// Everyone who should receive room broadcasts: the roster plus the teacher.
    pub fn audience(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.roster.keys().copied().collect();
        ids.push(self.teacher_id);
        ids
    }
}

/// One live room: the mutable state plus the advisory busy flag that
/// serializes multi-step mutations across handler invocations.
pub struct Room {
    pub state: Mutex<RoomState>,
    busy: AtomicBool,
}

impl Room {
    fn new(state: RoomState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            busy: AtomicBool::new(false),
        })
    }

    /// Tries to take the room for a multi-step mutation. Never blocks: a held
    /// flag means the caller must back off with a busy rejection. The returned
    /// guard clears the flag on drop, so every exit path releases it.
    pub fn try_busy(self: &Arc<Self>) -> Option<RoomGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(RoomGuard { room: self.clone() })
        } else {
            None
        }
    }
}

/// RAII guard for a room's busy flag.
pub struct RoomGuard {
    room: Arc<Room>,
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        self.room.busy.store(false, Ordering::Release);
    }
}

//=========================================================================================
// Session State Store
//=========================================================================================

/// Process-wide map of live rooms, injected wherever gameplay events land.
#[derive(Clone, Default)]
pub struct SessionStateStore {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Room>>>>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the room for a session, creating it if absent.
    pub async fn ensure(&self, session_id: Uuid, teacher_id: Uuid, category_id: i64) -> Arc<Room> {
        let mut map = self.inner.lock().await;
        map.entry(session_id)
            .or_insert_with(|| Room::new(RoomState::new(session_id, teacher_id, category_id)))
            .clone()
    }

    /// Returns the room or `None` without creating it.
    pub async fn get(&self, session_id: Uuid) -> Option<Arc<Room>> {
        let map = self.inner.lock().await;
        map.get(&session_id).cloned()
    }

    /// Discards a session's runtime state entirely. Any timer still attached
    /// to the room is cancelled so stale callbacks become no-ops.
    pub async fn delete(&self, session_id: Uuid) {
        let room = {
            let mut map = self.inner.lock().await;
            map.remove(&session_id)
        };
        if let Some(room) = room {
            let mut state = room.state.lock().await;
            state.cancel_timer();
        }
    }
}

//=========================================================================================
// Tests
//=========================================================================================
