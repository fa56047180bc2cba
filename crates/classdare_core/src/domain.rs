//! crates/classdare_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The role attached to a verified identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    /// Teachers and admins may drive a game session.
    pub fn can_host(&self) -> bool {
        matches!(self, Role::Teacher | Role::Admin)
    }
}

/// The identity yielded by token verification: who is on the other end
/// of a connection and what they are allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

/// Lifecycle status of a game session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Waiting,
    Running,
    Finished,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Running => "running",
            SessionStatus::Finished => "finished",
        }
    }
}

/// A live classroom game session, owned by one teacher.
#[derive(Debug, Clone)]
pub struct GameSession {
    pub id: Uuid,
    pub teacher_id: Uuid,
    pub category_id: i64,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

/// A (session, user) membership with a presence flag.
/// Created on first join; presence flips on connect/disconnect.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub is_present: bool,
    pub joined_at: DateTime<Utc>,
}

/// The two kinds of prompt a card can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Truth,
    Dare,
}

impl CardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardType::Truth => "truth",
            CardType::Dare => "dare",
        }
    }
}

/// A prompt from the content bank. Read-only to the game core.
#[derive(Debug, Clone)]
pub struct Card {
    pub id: i64,
    pub category_id: i64,
    pub card_type: CardType,
    pub content: String,
}

/// One graded round for one participant.
///
/// Created the moment a card is drawn, mutated once on answer submission
/// and once on grading, then immutable. `card_id` is `None` when the card
/// pool was empty and the round ran on a placeholder prompt.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: Uuid,
    pub participant_id: Uuid,
    pub card_id: Option<i64>,
    pub answer_text: Option<String>,
    pub score: Option<i32>,
    pub feedback: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
    pub graded_at: Option<DateTime<Utc>>,
}
