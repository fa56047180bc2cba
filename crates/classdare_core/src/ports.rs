//! crates/classdare_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Card, CardType, GameSession, Identity, Participant, SessionStatus, Turn};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// The persistence gateway: every durable fact the orchestrator reads or
/// writes goes through this trait. The relational schema behind it (and the
/// dashboard CRUD layered on the same tables) is not the core's concern.
#[async_trait]
pub trait GameStore: Send + Sync {
    // --- Sessions ---
    async fn create_session(
        &self,
        teacher_id: Uuid,
        category_id: i64,
        title: Option<&str>,
    ) -> PortResult<GameSession>;

    async fn get_session(&self, session_id: Uuid) -> PortResult<GameSession>;

    async fn set_session_status(&self, session_id: Uuid, status: SessionStatus) -> PortResult<()>;

    // --- Participants ---
    /// Get-or-create the (session, user) membership and mark it present.
    async fn join_session(&self, session_id: Uuid, user_id: Uuid) -> PortResult<Participant>;

    async fn set_participant_presence(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        is_present: bool,
    ) -> PortResult<()>;

    async fn list_participants(&self, session_id: Uuid) -> PortResult<Vec<Participant>>;

    // --- Cards ---
    /// A uniformly random card for the category and type, or `None` if the
    /// pool is empty. The caller decides how to degrade.
    async fn get_random_card(&self, category_id: i64, card_type: CardType)
        -> PortResult<Option<Card>>;

    // --- Turns ---
    async fn create_turn(&self, participant_id: Uuid, card_id: Option<i64>) -> PortResult<Turn>;

    async fn record_answer(&self, turn_id: Uuid, answer_text: &str) -> PortResult<()>;

    /// The terminal mutation of a turn.
    async fn record_grade(&self, turn_id: Uuid, score: i32, feedback: &str) -> PortResult<()>;
}

/// The external authentication collaborator: turns a bearer credential into
/// a verified identity, or refuses it.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> PortResult<Identity>;
}
