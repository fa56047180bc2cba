//! services/api/src/web/game.rs
//!
//! The turn orchestrator: drives one live room through
//! spin -> reveal -> answer -> grade -> resolution, with timeout-driven
//! forced transitions and disconnect recovery. Every multi-step mutation runs
//! under the room's advisory busy guard so near-simultaneous events for the
//! same session are serialized rather than interleaved.

use crate::web::{
    protocol::{RosterEntry, ServerMessage, WireCardType},
    state::{ActiveTurn, AppState, Room, RoomGuard, RosterSlot, RoomState, TurnPhase},
};
use classdare_core::domain::{CardType, GameSession, Identity, Role, SessionStatus};
use classdare_core::ports::PortError;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

//=========================================================================================
// Errors and Fixed Texts
//=========================================================================================

/// Request-level failures of gameplay operations. These are terminal for the
/// triggering request only, never for the session.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("not authorized for this session")]
    Forbidden,
    #[error("session not found")]
    SessionNotFound,
    #[error("server busy, try again")]
    Busy,
    #[error("no eligible players")]
    NoEligiblePlayers,
    #[error("{0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Port(#[from] PortError),
}

/// System-authored feedback when the answer window expires.
pub const NO_ANSWER_FEEDBACK: &str = "Time expired before an answer was submitted.";
/// System-authored feedback when the grading window expires.
pub const NO_GRADE_FEEDBACK: &str = "Time expired with no response from the teacher.";
/// System-authored feedback when the active player disconnects mid-turn.
pub const PLAYER_LEFT_FEEDBACK: &str = "Player left the game.";
/// What non-privileged viewers see instead of the raw answer text.
pub const REDACTED_ANSWER: &str = "(answer hidden until graded)";

/// Fallback prompt when the card pool for the category is empty. The round
/// degrades instead of stalling the session.
fn placeholder_prompt(card_type: CardType) -> &'static str {
    match card_type {
        CardType::Truth => "Tell the class one thing you learned this week.",
        CardType::Dare => "Stand up and say one sentence in front of the class.",
    }
}

//=========================================================================================
// Small Helpers
//=========================================================================================

async fn broadcast(app: &AppState, audience: &[Uuid], msg: ServerMessage) {
    for uid in audience {
        app.presence.send_to(*uid, msg.clone()).await;
    }
}

fn roster_update(state: &RoomState) -> ServerMessage {
    ServerMessage::RosterUpdate {
        session_id: state.session_id,
        participants: state
            .roster
            .iter()
            .map(|(uid, slot)| RosterEntry {
                user_id: *uid,
                is_present: slot.online,
            })
            .collect(),
    }
}

/// Looks up the room and checks the caller is its owning teacher.
/// Ownership mismatches are rejected before any state is touched.
async fn owned_room(app: &AppState, who: Identity, session_id: Uuid) -> Result<Arc<Room>, GameError> {
    let room = app
        .rooms
        .get(session_id)
        .await
        .ok_or(GameError::SessionNotFound)?;
    let state = room.state.lock().await;
    if !who.role.can_host() || state.teacher_id != who.user_id {
        return Err(GameError::Forbidden);
    }
    drop(state);
    Ok(room)
}

fn lock_room(room: &Arc<Room>) -> Result<RoomGuard, GameError> {
    room.try_busy().ok_or(GameError::Busy)
}

/// A turn taken out of the room state. Whoever holds this owns its resolution;
/// `active.take()` under the state mutex makes double-resolution impossible.
struct ClaimedTurn {
    turn: ActiveTurn,
    queue_done: bool,
    audience: Vec<Uuid>,
}

fn claim_active(state: &mut RoomState) -> ClaimedTurn {
    state.cancel_timer();
    let turn = state.active.take().expect("caller checked active");
    ClaimedTurn {
        turn,
        queue_done: state.queue.is_empty(),
        audience: state.audience(),
    }
}

//=========================================================================================
// Session Lifecycle
//=========================================================================================

/// Teacher opens a new session: durable row plus a fresh room.
pub async fn create_session(
    app: &AppState,
    who: Identity,
    category_id: i64,
    title: Option<String>,
) -> Result<GameSession, GameError> {
    if !who.role.can_host() {
        return Err(GameError::Forbidden);
    }
    let session = app
        .db
        .create_session(who.user_id, category_id, title.as_deref())
        .await?;
    app.rooms.ensure(session.id, who.user_id, category_id).await;
    info!(session_id = %session.id, teacher = %who.user_id, "session created");
    Ok(session)
}

/// Join the live room. Students become durable participants; the owning
/// teacher joins as host. The room is hydrated from the store on the first
/// gameplay event after a restart.
pub async fn join_room(app: &AppState, who: Identity, session_id: Uuid) -> Result<(), GameError> {
    let room = match app.rooms.get(session_id).await {
        Some(room) => room,
        None => {
            let session = app.db.get_session(session_id).await?;
            if session.status == SessionStatus::Finished {
                return Err(GameError::Invalid("session already finished"));
            }
            app.rooms
                .ensure(session_id, session.teacher_id, session.category_id)
                .await
        }
    };

    let is_owner = { room.state.lock().await.teacher_id == who.user_id };
    if !is_owner {
        if who.role != Role::Student {
            // Only the owning teacher hosts; other staff have no seat here.
            return Err(GameError::Forbidden);
        }
        let participant = app.db.join_session(session_id, who.user_id).await?;
        let mut state = room.state.lock().await;
        let slot = state
            .roster
            .entry(who.user_id)
            .or_insert_with(|| RosterSlot {
                participant_id: participant.id,
                online: true,
            });
        slot.online = true;
        // A late joiner still gets exactly one turn; a rejoin never queues twice.
        let on_the_spot = state
            .active
            .as_ref()
            .is_some_and(|t| t.user_id == who.user_id);
        if state.started
            && !state.queue.contains(&who.user_id)
            && !state.played.contains(&who.user_id)
            && !on_the_spot
        {
            state.queue.push_back(who.user_id);
        }
    }

    let (msg, audience) = {
        let state = room.state.lock().await;
        (roster_update(&state), state.audience())
    };
    broadcast(app, &audience, msg).await;
    Ok(())
}

/// Teacher starts the game: the roster is shuffled once, server-side, into
/// the turn queue. Selection order is never client-supplied.
pub async fn start_session(app: &AppState, who: Identity, session_id: Uuid) -> Result<(), GameError> {
    let room = owned_room(app, who, session_id).await?;
    let _guard = lock_room(&room)?;

    // Pick up any participants that joined before this room existed in memory.
    let participants = app.db.list_participants(session_id).await?;
    let audience = {
        let mut state = room.state.lock().await;
        if state.started {
            return Err(GameError::Invalid("session already started"));
        }
        for p in participants {
            state.roster.entry(p.user_id).or_insert(RosterSlot {
                participant_id: p.id,
                online: p.is_present,
            });
        }
        if !state.roster.values().any(|slot| slot.online) {
            return Err(GameError::Invalid("no students online"));
        }
        let mut order: Vec<Uuid> = state.roster.keys().copied().collect();
        order.shuffle(&mut rand::thread_rng());
        state.queue = order.into();
        state.started = true;
        state.audience()
    };

    app.db
        .set_session_status(session_id, SessionStatus::Running)
        .await?;
    broadcast(app, &audience, ServerMessage::SessionStarted { session_id }).await;
    Ok(())
}

/// Teacher ends the session early. Cancels any outstanding timer, marks the
/// durable row finished and discards the runtime state.
pub async fn end_session(app: &AppState, who: Identity, session_id: Uuid) -> Result<(), GameError> {
    let room = owned_room(app, who, session_id).await?;
    let _guard = lock_room(&room)?;
    let audience = {
        let mut state = room.state.lock().await;
        state.cancel_timer();
        state.active = None;
        state.audience()
    };
    finish_session(app, session_id, &audience).await;
    Ok(())
}

async fn finish_session(app: &AppState, session_id: Uuid, audience: &[Uuid]) {
    if let Err(e) = app
        .db
        .set_session_status(session_id, SessionStatus::Finished)
        .await
    {
        error!(%session_id, "failed to mark session finished: {e}");
    }
    broadcast(app, audience, ServerMessage::SessionEnded { session_id }).await;
    app.rooms.delete(session_id).await;
    info!(%session_id, "session ended");
}

//=========================================================================================
// Turn Flow
//=========================================================================================

/// Teacher spins the roulette. The next online player is taken off the
/// server-owned queue, announced as "selecting", and revealed after the
/// animation delay.
pub async fn select_player(app: &AppState, who: Identity, session_id: Uuid) -> Result<Uuid, GameError> {
    let room = owned_room(app, who, session_id).await?;
    let _guard = lock_room(&room)?;

    let (chosen, audience) = {
        let mut state = room.state.lock().await;
        if !state.started {
            return Err(GameError::Invalid("session not started"));
        }
        if state.active.is_some() {
            return Err(GameError::Invalid("a turn is already in progress"));
        }
        // First queued player who is currently online. An empty pool rejects
        // without touching anything.
        let pos = state
            .queue
            .iter()
            .position(|uid| state.roster.get(uid).map(|s| s.online).unwrap_or(false))
            .ok_or(GameError::NoEligiblePlayers)?;
        let chosen = state.queue.remove(pos).expect("position came from iter");
        let participant_id = state.roster[&chosen].participant_id;
        state.played.insert(chosen);
        state.active = Some(ActiveTurn {
            user_id: chosen,
            participant_id,
            turn_id: None,
            phase: TurnPhase::Spinning,
        });
        (chosen, state.audience())
    };

    broadcast(app, &audience, ServerMessage::Selecting { session_id }).await;

    // Reveal after the animation delay. The task re-fetches the room and
    // re-checks the active turn, so a disconnect or session end in the
    // meantime leaves it a no-op.
    let delayed = app.clone();
    let delay = app.config.reveal_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        reveal_selected(&delayed, session_id, chosen).await;
    });

    Ok(chosen)
}

async fn reveal_selected(app: &AppState, session_id: Uuid, chosen: Uuid) {
    let Some(room) = app.rooms.get(session_id).await else {
        return;
    };
    let audience = {
        let mut state = room.state.lock().await;
        match state.active.as_mut() {
            Some(turn) if turn.user_id == chosen && turn.phase == TurnPhase::Spinning => {
                turn.phase = TurnPhase::Revealed;
            }
            _ => return,
        }
        state.audience()
    };
    broadcast(
        app,
        &audience,
        ServerMessage::PlayerSelected {
            session_id,
            user_id: chosen,
        },
    )
    .await;
}

/// Teacher draws a prompt for the revealed player. Creates the durable turn
/// record and opens the answer window.
pub async fn draw_prompt(
    app: &AppState,
    who: Identity,
    session_id: Uuid,
    card_type: CardType,
) -> Result<(), GameError> {
    let room = owned_room(app, who, session_id).await?;
    let _guard = lock_room(&room)?;

    let (user_id, participant_id, category_id) = {
        let state = room.state.lock().await;
        let turn = state
            .active
            .as_ref()
            .ok_or(GameError::Invalid("no player selected"))?;
        if turn.phase != TurnPhase::Revealed {
            return Err(GameError::Invalid("no revealed player awaiting a prompt"));
        }
        (turn.user_id, turn.participant_id, state.category_id)
    };

    let card = app.db.get_random_card(category_id, card_type).await?;
    let (card_id, content) = match &card {
        Some(c) => (Some(c.id), c.content.clone()),
        None => (None, placeholder_prompt(card_type).to_string()),
    };
    let turn_rec = app.db.create_turn(participant_id, card_id).await?;

    let token = CancellationToken::new();
    let audience = {
        let mut state = room.state.lock().await;
        let turn = match state.active.as_mut() {
            Some(t) if t.user_id == user_id => t,
            // The player vanished while we were at the store; their claimed
            // resolution already ran and this turn record stays ungraded.
            _ => {
                warn!(%session_id, turn_id = %turn_rec.id, "active player lost before prompt delivery");
                return Err(GameError::Invalid("turn no longer active"));
            }
        };
        turn.turn_id = Some(turn_rec.id);
        turn.phase = TurnPhase::Answering;
        state.cancel_timer();
        state.turn_timer = Some(token.clone());
        state.audience()
    };

    broadcast(
        app,
        &audience,
        ServerMessage::PromptRevealed {
            session_id,
            turn_id: turn_rec.id,
            card_id,
            card_type: WireCardType::from(card_type),
            content,
        },
    )
    .await;

    spawn_turn_timer(
        app.clone(),
        session_id,
        user_id,
        TurnPhase::Answering,
        app.config.answer_window,
        token,
    );
    Ok(())
}

/// The active player submits their answer. The verbatim text goes only to
/// the owning teacher and the author; the rest of the room sees a redacted
/// placeholder. Opens the grading window.
pub async fn submit_answer(
    app: &AppState,
    who: Identity,
    session_id: Uuid,
    text: String,
) -> Result<(), GameError> {
    let room = app
        .rooms
        .get(session_id)
        .await
        .ok_or(GameError::SessionNotFound)?;
    let _guard = lock_room(&room)?;

    let (turn_id, teacher_id, others) = {
        let mut state = room.state.lock().await;
        let turn = state
            .active
            .as_ref()
            .ok_or(GameError::Invalid("no turn in progress"))?;
        if turn.user_id != who.user_id {
            return Err(GameError::Forbidden);
        }
        if turn.phase != TurnPhase::Answering {
            return Err(GameError::Invalid("the answer window is not open"));
        }
        let turn_id = turn.turn_id.ok_or(GameError::Invalid("turn record missing"))?;
        state.cancel_timer();
        let others: Vec<Uuid> = state
            .roster
            .keys()
            .copied()
            .filter(|uid| *uid != who.user_id)
            .collect();
        (turn_id, state.teacher_id, others)
    };

    app.db.record_answer(turn_id, &text).await?;

    let token = CancellationToken::new();
    {
        let mut state = room.state.lock().await;
        match state.active.as_mut() {
            Some(turn) if turn.user_id == who.user_id => {
                turn.phase = TurnPhase::Grading;
                state.turn_timer = Some(token.clone());
            }
            // Resolved while the answer was being written (disconnect race).
            _ => return Ok(()),
        }
    }

    let verbatim = ServerMessage::AnswerReady {
        session_id,
        user_id: who.user_id,
        text: text.clone(),
    };
    app.presence.send_to(teacher_id, verbatim.clone()).await;
    app.presence.send_to(who.user_id, verbatim).await;
    let redacted = ServerMessage::AnswerReady {
        session_id,
        user_id: who.user_id,
        text: REDACTED_ANSWER.to_string(),
    };
    for uid in others {
        app.presence.send_to(uid, redacted.clone()).await;
    }

    spawn_turn_timer(
        app.clone(),
        session_id,
        who.user_id,
        TurnPhase::Grading,
        app.config.grading_window,
        token,
    );
    Ok(())
}

/// The owning teacher grades the answer: the terminal mutation of the turn.
/// If the queue is exhausted the session auto-ends.
pub async fn submit_grade(
    app: &AppState,
    who: Identity,
    session_id: Uuid,
    score: i32,
    feedback: String,
) -> Result<(), GameError> {
    if !(0..=10).contains(&score) {
        return Err(GameError::Invalid("score must be between 0 and 10"));
    }
    let room = owned_room(app, who, session_id).await?;
    let _guard = lock_room(&room)?;

    let claimed = {
        let mut state = room.state.lock().await;
        match state.active.as_ref() {
            Some(turn) if turn.phase == TurnPhase::Grading => {}
            Some(_) => return Err(GameError::Invalid("no answer awaiting a grade")),
            None => return Err(GameError::Invalid("turn already resolved")),
        }
        claim_active(&mut state)
    };

    resolve_claimed(app, session_id, claimed, score, &feedback).await;
    Ok(())
}

//=========================================================================================
// Timers
//=========================================================================================

/// Single-shot, session-scoped window timer. Cancelled proactively on every
/// resolution path; if it does fire, the expiry handler re-checks the active
/// turn before acting so a stale timer is a no-op.
fn spawn_turn_timer(
    app: AppState,
    session_id: Uuid,
    expected_user: Uuid,
    expected_phase: TurnPhase,
    window: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(window) => {
                on_window_expired(&app, session_id, expected_user, expected_phase).await;
            }
        }
    });
}

async fn on_window_expired(
    app: &AppState,
    session_id: Uuid,
    expected_user: Uuid,
    expected_phase: TurnPhase,
) {
    let Some(room) = app.rooms.get(session_id).await else {
        return;
    };
    // Like disconnect recovery, this works under the state mutex alone. A
    // handler that merely holds the advisory flag must not swallow the
    // expiry; the claim below already serializes against any concurrent
    // resolution of the same turn.
    let claimed = {
        let mut state = room.state.lock().await;
        match state.active.as_ref() {
            Some(turn) if turn.user_id == expected_user && turn.phase == expected_phase => {}
            _ => return,
        }
        claim_active(&mut state)
    };

    let feedback = match expected_phase {
        TurnPhase::Answering => NO_ANSWER_FEEDBACK,
        _ => NO_GRADE_FEEDBACK,
    };
    info!(%session_id, player = %expected_user, "turn window expired, forcing zero-score resolution");
    resolve_claimed(app, session_id, claimed, 0, feedback).await;
}

//=========================================================================================
// Resolution and Disconnect Recovery
//=========================================================================================

/// Persists the grade (when a durable turn exists), broadcasts the result and
/// auto-ends the session once everyone has played. A persistence failure is
/// logged but never stalls the room.
async fn resolve_claimed(
    app: &AppState,
    session_id: Uuid,
    claimed: ClaimedTurn,
    score: i32,
    feedback: &str,
) {
    if let Some(turn_id) = claimed.turn.turn_id {
        if let Err(e) = app.db.record_grade(turn_id, score, feedback).await {
            error!(%session_id, %turn_id, "failed to record grade: {e}");
        }
    }
    broadcast(
        app,
        &claimed.audience,
        ServerMessage::TurnResolved {
            session_id,
            user_id: claimed.turn.user_id,
            score,
            feedback: feedback.to_string(),
        },
    )
    .await;
    if claimed.queue_done {
        finish_session(app, session_id, &claimed.audience).await;
    }
}

/// Implicit channel event: a registered connection went away.
///
/// If the disconnecting identity is the active player the turn resolves
/// immediately with score zero; the room never waits for the window timer.
/// Otherwise only the presence flag flips and the roster is re-broadcast.
pub async fn handle_disconnect(app: &AppState, who: Identity, session_id: Uuid) {
    let Some(room) = app.rooms.get(session_id).await else {
        return;
    };

    // Recovery works under the state mutex alone: it must run in the same
    // tick even if a busy handler holds the advisory flag.
    let (claimed, roster_msg, audience) = {
        let mut state = room.state.lock().await;
        if let Some(slot) = state.roster.get_mut(&who.user_id) {
            slot.online = false;
        }
        let was_active = state
            .active
            .as_ref()
            .is_some_and(|turn| turn.user_id == who.user_id);
        let claimed = was_active.then(|| claim_active(&mut state));
        (claimed, roster_update(&state), state.audience())
    };

    if who.role == Role::Student {
        if let Err(e) = app
            .db
            .set_participant_presence(session_id, who.user_id, false)
            .await
        {
            warn!(%session_id, user = %who.user_id, "failed to persist offline presence: {e}");
        }
    }

    broadcast(app, &audience, roster_msg).await;

    if let Some(claimed) = claimed {
        info!(%session_id, player = %who.user_id, "active player disconnected, forcing resolution");
        resolve_claimed(app, session_id, claimed, 0, PLAYER_LEFT_FEEDBACK).await;
    }
}

//=========================================================================================
// Tests
//=========================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::web::state::{PresenceRegistry, SessionStateStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use classdare_core::domain::{Card, GameSession, Participant, Turn};
    use classdare_core::ports::{GameStore, PortResult, TokenVerifier};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tracing::Level;

    /// A session never has more than one active player, the active player is
    /// never still queued, and the queue holds no duplicates.
    fn assert_room_invariants(state: &RoomState) {
        if let Some(turn) = &state.active {
            assert!(!state.queue.contains(&turn.user_id));
        }
        let queued: HashSet<&Uuid> = state.queue.iter().collect();
        assert_eq!(queued.len(), state.queue.len(), "queue holds duplicates");
    }

    //-------------------------------------------------------------------------------------
    // In-memory fakes
    //-------------------------------------------------------------------------------------

    #[derive(Default)]
    struct MemStore {
        sessions: StdMutex<HashMap<Uuid, GameSession>>,
        participants: StdMutex<HashMap<Uuid, Participant>>,
        turns: StdMutex<HashMap<Uuid, Turn>>,
        cards: StdMutex<Vec<Card>>,
    }

    #[async_trait]
    impl GameStore for MemStore {
        async fn create_session(
            &self,
            teacher_id: Uuid,
            category_id: i64,
            title: Option<&str>,
        ) -> PortResult<GameSession> {
            let session = GameSession {
                id: Uuid::new_v4(),
                teacher_id,
                category_id,
                title: title.map(str::to_string),
                status: SessionStatus::Waiting,
                created_at: Utc::now(),
            };
            self.sessions
                .lock()
                .unwrap()
                .insert(session.id, session.clone());
            Ok(session)
        }

        async fn get_session(&self, session_id: Uuid) -> PortResult<GameSession> {
            self.sessions
                .lock()
                .unwrap()
                .get(&session_id)
                .cloned()
                .ok_or_else(|| PortError::NotFound(format!("session {session_id}")))
        }

        async fn set_session_status(
            &self,
            session_id: Uuid,
            status: SessionStatus,
        ) -> PortResult<()> {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&session_id)
                .ok_or_else(|| PortError::NotFound(format!("session {session_id}")))?;
            session.status = status;
            Ok(())
        }

        async fn join_session(&self, session_id: Uuid, user_id: Uuid) -> PortResult<Participant> {
            let mut participants = self.participants.lock().unwrap();
            if let Some(existing) = participants
                .values_mut()
                .find(|p| p.session_id == session_id && p.user_id == user_id)
            {
                existing.is_present = true;
                return Ok(existing.clone());
            }
            let participant = Participant {
                id: Uuid::new_v4(),
                session_id,
                user_id,
                is_present: true,
                joined_at: Utc::now(),
            };
            participants.insert(participant.id, participant.clone());
            Ok(participant)
        }

        async fn set_participant_presence(
            &self,
            session_id: Uuid,
            user_id: Uuid,
            is_present: bool,
        ) -> PortResult<()> {
            let mut participants = self.participants.lock().unwrap();
            if let Some(p) = participants
                .values_mut()
                .find(|p| p.session_id == session_id && p.user_id == user_id)
            {
                p.is_present = is_present;
            }
            Ok(())
        }

        async fn list_participants(&self, session_id: Uuid) -> PortResult<Vec<Participant>> {
            Ok(self
                .participants
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.session_id == session_id)
                .cloned()
                .collect())
        }

        async fn get_random_card(
            &self,
            category_id: i64,
            card_type: CardType,
        ) -> PortResult<Option<Card>> {
            Ok(self
                .cards
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.category_id == category_id && c.card_type == card_type)
                .cloned())
        }

        async fn create_turn(&self, participant_id: Uuid, card_id: Option<i64>) -> PortResult<Turn> {
            let turn = Turn {
                id: Uuid::new_v4(),
                participant_id,
                card_id,
                answer_text: None,
                score: None,
                feedback: None,
                answered_at: None,
                graded_at: None,
            };
            self.turns.lock().unwrap().insert(turn.id, turn.clone());
            Ok(turn)
        }

        async fn record_answer(&self, turn_id: Uuid, answer_text: &str) -> PortResult<()> {
            let mut turns = self.turns.lock().unwrap();
            let turn = turns
                .get_mut(&turn_id)
                .ok_or_else(|| PortError::NotFound(format!("turn {turn_id}")))?;
            turn.answer_text = Some(answer_text.to_string());
            turn.answered_at = Some(Utc::now());
            Ok(())
        }

        async fn record_grade(&self, turn_id: Uuid, score: i32, feedback: &str) -> PortResult<()> {
            let mut turns = self.turns.lock().unwrap();
            let turn = turns
                .get_mut(&turn_id)
                .ok_or_else(|| PortError::NotFound(format!("turn {turn_id}")))?;
            turn.score = Some(score);
            turn.feedback = Some(feedback.to_string());
            turn.graded_at = Some(Utc::now());
            Ok(())
        }
    }

    struct DenyAll;
    impl TokenVerifier for DenyAll {
        fn verify(&self, _token: &str) -> PortResult<Identity> {
            Err(PortError::Unauthorized)
        }
    }

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            database_url: String::new(),
            log_level: Level::DEBUG,
            jwt_secret: "test-secret".to_string(),
            cors_origin: String::new(),
            answer_window: Duration::from_secs(30),
            grading_window: Duration::from_secs(30),
            reveal_delay: Duration::from_millis(100),
        }
    }

    fn truth_card(category_id: i64) -> Card {
        Card {
            id: 1,
            category_id,
            card_type: CardType::Truth,
            content: "What is your favourite subject?".to_string(),
        }
    }

    struct Harness {
        app: AppState,
        store: Arc<MemStore>,
        teacher: Identity,
    }

    fn harness(cards: Vec<Card>) -> Harness {
        let store = Arc::new(MemStore::default());
        *store.cards.lock().unwrap() = cards;
        let app = AppState {
            db: store.clone(),
            verifier: Arc::new(DenyAll),
            config: Arc::new(test_config()),
            presence: PresenceRegistry::new(),
            rooms: SessionStateStore::new(),
        };
        let teacher = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Teacher,
        };
        Harness { app, store, teacher }
    }

    async fn connect(app: &AppState, who: Identity) -> UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        app.presence.register(who.user_id, Uuid::new_v4(), tx).await;
        rx
    }

    fn student() -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            role: Role::Student,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Drives a room to the Answering phase and returns the active player.
    async fn start_answering(h: &Harness, session_id: Uuid) -> Uuid {
        let chosen = select_player(&h.app, h.teacher, session_id).await.unwrap();
        tokio::time::sleep(h.app.config.reveal_delay * 2).await;
        draw_prompt(&h.app, h.teacher, session_id, CardType::Truth)
            .await
            .unwrap();
        chosen
    }

    fn graded_turn(store: &MemStore) -> Turn {
        store
            .turns
            .lock()
            .unwrap()
            .values()
            .find(|t| t.graded_at.is_some())
            .cloned()
            .expect("a graded turn exists")
    }

    //-------------------------------------------------------------------------------------
    // Cases
    //-------------------------------------------------------------------------------------

    #[tokio::test]
    async fn select_rejects_when_no_one_is_eligible() {
        let h = harness(vec![truth_card(1)]);
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let a = student();
        let _a_rx = connect(&h.app, a).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();

        // The only queued player goes offline before the spin.
        handle_disconnect(&h.app, a, session.id).await;
        let err = select_player(&h.app, h.teacher, session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::NoEligiblePlayers));

        // The rejection mutated nothing: a keeps their place in the queue.
        let room = h.app.rooms.get(session.id).await.unwrap();
        let state = room.state.lock().await;
        assert!(state.active.is_none());
        assert!(state.queue.contains(&a.user_id));
        assert_room_invariants(&state);
    }

    #[tokio::test]
    async fn start_requires_an_online_student() {
        let h = harness(vec![truth_card(1)]);
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();

        // Nobody has joined.
        let err = start_session(&h.app, h.teacher, session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Invalid(_)));

        // One student joined but went offline again.
        let a = student();
        let _a_rx = connect(&h.app, a).await;
        join_room(&h.app, a, session.id).await.unwrap();
        handle_disconnect(&h.app, a, session.id).await;
        let err = start_session(&h.app, h.teacher, session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Invalid(_)));

        // Back online, the game starts.
        join_room(&h.app, a, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();
    }

    #[tokio::test]
    async fn busy_room_rejects_a_second_select() {
        let h = harness(vec![truth_card(1)]);
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let a = student();
        let _a_rx = connect(&h.app, a).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();

        let room = h.app.rooms.get(session.id).await.unwrap();
        let guard = room.try_busy().expect("free room");
        let err = select_player(&h.app, h.teacher, session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Busy));
        drop(guard);

        select_player(&h.app, h.teacher, session.id).await.unwrap();
    }

    #[tokio::test]
    async fn only_the_owner_may_drive_the_session() {
        let h = harness(vec![truth_card(1)]);
        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();

        let imposter = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Teacher,
        };
        assert!(matches!(
            select_player(&h.app, imposter, session.id).await,
            Err(GameError::Forbidden)
        ));
        assert!(matches!(
            end_session(&h.app, imposter, session.id).await,
            Err(GameError::Forbidden)
        ));

        let pupil = student();
        assert!(matches!(
            create_session(&h.app, pupil, 1, None).await,
            Err(GameError::Forbidden)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_active_player() {
        let h = harness(vec![truth_card(1)]);
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let (a, b) = (student(), student());
        let _a_rx = connect(&h.app, a).await;
        let _b_rx = connect(&h.app, b).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        join_room(&h.app, b, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();

        select_player(&h.app, h.teacher, session.id).await.unwrap();
        let err = select_player(&h.app, h.teacher, session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Invalid(_)));

        let room = h.app.rooms.get(session.id).await.unwrap();
        assert_room_invariants(&*room.state.lock().await);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_timeout_records_a_zero_score_turn() {
        let h = harness(vec![truth_card(1)]);
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let a = student();
        let _a_rx = connect(&h.app, a).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();
        start_answering(&h, session.id).await;

        // Nobody answers; the window lapses.
        tokio::time::sleep(h.app.config.answer_window + Duration::from_secs(1)).await;

        let turn = graded_turn(&h.store);
        assert_eq!(turn.score, Some(0));
        assert_eq!(turn.feedback.as_deref(), Some(NO_ANSWER_FEEDBACK));
        assert!(turn.answer_text.is_none());

        // Only player has now played: the session auto-ended.
        assert!(h.app.rooms.get(session.id).await.is_none());
        let stored = h.store.get_session(session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_timeout_fires_even_while_the_room_is_busy() {
        let h = harness(vec![truth_card(1)]);
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let a = student();
        let _a_rx = connect(&h.app, a).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();
        start_answering(&h, session.id).await;

        // Another handler holds the advisory flag across the whole window;
        // the timeout must still land.
        let room = h.app.rooms.get(session.id).await.unwrap();
        let guard = room.try_busy().expect("free room");
        tokio::time::sleep(h.app.config.answer_window + Duration::from_secs(1)).await;

        let turn = graded_turn(&h.store);
        assert_eq!(turn.score, Some(0));
        assert_eq!(turn.feedback.as_deref(), Some(NO_ANSWER_FEEDBACK));
        drop(guard);

        // The only player had played: the session still auto-ended.
        assert!(h.app.rooms.get(session.id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn grading_timeout_resolves_and_late_grade_is_rejected() {
        let h = harness(vec![truth_card(1)]);
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let (a, b) = (student(), student());
        let _a_rx = connect(&h.app, a).await;
        let _b_rx = connect(&h.app, b).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        join_room(&h.app, b, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();
        let chosen = start_answering(&h, session.id).await;

        let answering = if chosen == a.user_id { a } else { b };
        submit_answer(&h.app, answering, session.id, "my answer".to_string())
            .await
            .unwrap();

        // The teacher never grades.
        tokio::time::sleep(h.app.config.grading_window + Duration::from_secs(1)).await;

        let turn = graded_turn(&h.store);
        assert_eq!(turn.score, Some(0));
        assert_eq!(turn.feedback.as_deref(), Some(NO_GRADE_FEEDBACK));

        // The late grade finds no turn awaiting it.
        let err = submit_grade(&h.app, h.teacher, session.id, 9, "late".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Invalid(_)));
        // And the recorded zero was not overwritten.
        assert_eq!(graded_turn(&h.store).score, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn active_player_disconnect_resolves_without_waiting() {
        let h = harness(vec![truth_card(1)]);
        let mut teacher_rx = connect(&h.app, h.teacher).await;
        let (a, b) = (student(), student());
        let _a_rx = connect(&h.app, a).await;
        let _b_rx = connect(&h.app, b).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        join_room(&h.app, b, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();
        let chosen = start_answering(&h, session.id).await;
        let leaver = if chosen == a.user_id { a } else { b };

        drain(&mut teacher_rx);
        // No time is advanced: resolution must not depend on the timer.
        handle_disconnect(&h.app, leaver, session.id).await;

        let msgs = drain(&mut teacher_rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::TurnResolved { score: 0, user_id, .. } if *user_id == leaver.user_id
        )));

        let turn = graded_turn(&h.store);
        assert_eq!(turn.score, Some(0));
        assert_eq!(turn.feedback.as_deref(), Some(PLAYER_LEFT_FEEDBACK));

        let room = h.app.rooms.get(session.id).await.unwrap();
        let state = room.state.lock().await;
        assert!(state.active.is_none());
        assert!(state.turn_timer.is_none());
        assert!(!state.roster[&leaver.user_id].online);
    }

    #[tokio::test(start_paused = true)]
    async fn bystander_disconnect_leaves_the_turn_untouched() {
        let h = harness(vec![truth_card(1)]);
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let (a, b) = (student(), student());
        let _a_rx = connect(&h.app, a).await;
        let _b_rx = connect(&h.app, b).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        join_room(&h.app, b, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();
        let chosen = start_answering(&h, session.id).await;
        let bystander = if chosen == a.user_id { b } else { a };

        handle_disconnect(&h.app, bystander, session.id).await;

        let room = h.app.rooms.get(session.id).await.unwrap();
        let state = room.state.lock().await;
        let active = state.active.as_ref().expect("turn still in progress");
        assert_eq!(active.user_id, chosen);
        assert_eq!(active.phase, TurnPhase::Answering);
        assert!(!state.roster[&bystander.user_id].online);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_text_is_redacted_for_bystanders() {
        let h = harness(vec![truth_card(1)]);
        let mut teacher_rx = connect(&h.app, h.teacher).await;
        let (a, b) = (student(), student());
        let mut a_rx = connect(&h.app, a).await;
        let mut b_rx = connect(&h.app, b).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        join_room(&h.app, b, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();
        let chosen = start_answering(&h, session.id).await;
        let (author, author_rx, bystander_rx) = if chosen == a.user_id {
            (a, &mut a_rx, &mut b_rx)
        } else {
            (b, &mut b_rx, &mut a_rx)
        };

        drain(&mut teacher_rx);
        drain(author_rx);
        drain(bystander_rx);
        submit_answer(&h.app, author, session.id, "the secret answer".to_string())
            .await
            .unwrap();

        let text_of = |msgs: Vec<ServerMessage>| {
            msgs.into_iter()
                .find_map(|m| match m {
                    ServerMessage::AnswerReady { text, .. } => Some(text),
                    _ => None,
                })
                .expect("answer_ready was delivered")
        };
        assert_eq!(text_of(drain(&mut teacher_rx)), "the secret answer");
        assert_eq!(text_of(drain(author_rx)), "the secret answer");
        assert_eq!(text_of(drain(bystander_rx)), REDACTED_ANSWER);
    }

    #[tokio::test(start_paused = true)]
    async fn full_session_runs_both_turns_and_auto_ends() {
        let h = harness(vec![truth_card(1)]);
        let mut teacher_rx = connect(&h.app, h.teacher).await;
        let (a, b) = (student(), student());
        let _a_rx = connect(&h.app, a).await;
        let _b_rx = connect(&h.app, b).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        join_room(&h.app, b, session.id).await.unwrap();
        {
            let room = h.app.rooms.get(session.id).await.unwrap();
            assert_eq!(room.state.lock().await.roster.len(), 2);
        }
        start_session(&h.app, h.teacher, session.id).await.unwrap();

        // First turn.
        let first = start_answering(&h, session.id).await;
        let first_player = if first == a.user_id { a } else { b };
        submit_answer(&h.app, first_player, session.id, "answer1".to_string())
            .await
            .unwrap();
        submit_grade(&h.app, h.teacher, session.id, 7, "good".to_string())
            .await
            .unwrap();

        let msgs = drain(&mut teacher_rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::TurnResolved { score: 7, user_id, .. } if *user_id == first
        )));

        // Second turn: only the other student is left in the queue.
        let second = start_answering(&h, session.id).await;
        assert_ne!(second, first);
        let second_player = if second == a.user_id { a } else { b };
        submit_answer(&h.app, second_player, session.id, "answer2".to_string())
            .await
            .unwrap();
        submit_grade(&h.app, h.teacher, session.id, 5, "ok".to_string())
            .await
            .unwrap();

        let msgs = drain(&mut teacher_rx);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::SessionEnded { .. })));
        assert!(h.app.rooms.get(session.id).await.is_none());
        let stored = h.store.get_session(session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Finished);

        // Both answers were stored verbatim.
        let turns = h.store.turns.lock().unwrap();
        let answers: HashSet<String> = turns
            .values()
            .filter_map(|t| t.answer_text.clone())
            .collect();
        assert!(answers.contains("answer1"));
        assert!(answers.contains("answer2"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_card_pool_degrades_to_a_placeholder_prompt() {
        let h = harness(Vec::new());
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let a = student();
        let mut a_rx = connect(&h.app, a).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();

        select_player(&h.app, h.teacher, session.id).await.unwrap();
        tokio::time::sleep(h.app.config.reveal_delay * 2).await;
        drain(&mut a_rx);
        draw_prompt(&h.app, h.teacher, session.id, CardType::Dare)
            .await
            .unwrap();

        let revealed = drain(&mut a_rx)
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::PromptRevealed {
                    card_id, content, ..
                } => Some((card_id, content)),
                _ => None,
            })
            .expect("prompt was revealed");
        assert_eq!(revealed.0, None);
        assert_eq!(revealed.1, placeholder_prompt(CardType::Dare));
    }

    #[tokio::test(start_paused = true)]
    async fn selection_skips_offline_players() {
        let h = harness(vec![truth_card(1)]);
        let _teacher_rx = connect(&h.app, h.teacher).await;
        let (a, b) = (student(), student());
        let _a_rx = connect(&h.app, a).await;
        let _b_rx = connect(&h.app, b).await;

        let session = create_session(&h.app, h.teacher, 1, None).await.unwrap();
        join_room(&h.app, a, session.id).await.unwrap();
        join_room(&h.app, b, session.id).await.unwrap();
        start_session(&h.app, h.teacher, session.id).await.unwrap();

        handle_disconnect(&h.app, a, session.id).await;

        // Whatever the shuffle produced, only b is eligible.
        let chosen = select_player(&h.app, h.teacher, session.id).await.unwrap();
        assert_eq!(chosen, b.user_id);

        // a is still queued for when they reconnect.
        let room = h.app.rooms.get(session.id).await.unwrap();
        let state = room.state.lock().await;
        assert!(state.queue.contains(&a.user_id));
        assert_room_invariants(&state);
    }
}
