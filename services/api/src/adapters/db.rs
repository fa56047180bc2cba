//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `GameStore` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classdare_core::domain::{Card, CardType, GameSession, Participant, SessionStatus, Turn};
use classdare_core::ports::{GameStore, PortError, PortResult};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `GameStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

fn parse_status(raw: &str) -> PortResult<SessionStatus> {
    match raw {
        "waiting" => Ok(SessionStatus::Waiting),
        "running" => Ok(SessionStatus::Running),
        "finished" => Ok(SessionStatus::Finished),
        other => Err(PortError::Unexpected(format!(
            "unknown session status '{other}'"
        ))),
    }
}

fn parse_card_type(raw: &str) -> PortResult<CardType> {
    match raw {
        "truth" => Ok(CardType::Truth),
        "dare" => Ok(CardType::Dare),
        other => Err(PortError::Unexpected(format!("unknown card type '{other}'"))),
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    teacher_id: Uuid,
    category_id: i64,
    title: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
}
impl SessionRecord {
    fn to_domain(self) -> PortResult<GameSession> {
        Ok(GameSession {
            id: self.id,
            teacher_id: self.teacher_id,
            category_id: self.category_id,
            title: self.title,
            status: parse_status(&self.status)?,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct ParticipantRecord {
    id: Uuid,
    session_id: Uuid,
    user_id: Uuid,
    is_present: bool,
    joined_at: DateTime<Utc>,
}
impl ParticipantRecord {
    fn to_domain(self) -> Participant {
        Participant {
            id: self.id,
            session_id: self.session_id,
            user_id: self.user_id,
            is_present: self.is_present,
            joined_at: self.joined_at,
        }
    }
}

#[derive(FromRow)]
struct CardRecord {
    id: i64,
    category_id: i64,
    card_type: String,
    content: String,
}
impl CardRecord {
    fn to_domain(self) -> PortResult<Card> {
        Ok(Card {
            id: self.id,
            category_id: self.category_id,
            card_type: parse_card_type(&self.card_type)?,
            content: self.content,
        })
    }
}

#[derive(FromRow)]
struct TurnRecord {
    id: Uuid,
    participant_id: Uuid,
    card_id: Option<i64>,
    answer_text: Option<String>,
    score: Option<i32>,
    feedback: Option<String>,
    answered_at: Option<DateTime<Utc>>,
    graded_at: Option<DateTime<Utc>>,
}
impl TurnRecord {
    fn to_domain(self) -> Turn {
        Turn {
            id: self.id,
            participant_id: self.participant_id,
            card_id: self.card_id,
            answer_text: self.answer_text,
            score: self.score,
            feedback: self.feedback,
            answered_at: self.answered_at,
            graded_at: self.graded_at,
        }
    }
}

//=========================================================================================
// `GameStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl GameStore for DbAdapter {
    async fn create_session(
        &self,
        teacher_id: Uuid,
        category_id: i64,
        title: Option<&str>,
    ) -> PortResult<GameSession> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "INSERT INTO game_sessions (teacher_id, category_id, title, status)
             VALUES ($1, $2, $3, 'waiting')
             RETURNING id, teacher_id, category_id, title, status, created_at",
        )
        .bind(teacher_id)
        .bind(category_id)
        .bind(title)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;

        record.to_domain()
    }

    async fn get_session(&self, session_id: Uuid) -> PortResult<GameSession> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, teacher_id, category_id, title, status, created_at
             FROM game_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Session {} not found", session_id))
            }
            _ => unexpected(e),
        })?;

        record.to_domain()
    }

    async fn set_session_status(&self, session_id: Uuid, status: SessionStatus) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE game_sessions
             SET status = $2,
                 ended_at = CASE WHEN $2 = 'finished' THEN now() ELSE ended_at END
             WHERE id = $1",
        )
        .bind(session_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!(
                "Session {} not found",
                session_id
            )));
        }
        Ok(())
    }

    async fn join_session(&self, session_id: Uuid, user_id: Uuid) -> PortResult<Participant> {
        let record = sqlx::query_as::<_, ParticipantRecord>(
            "INSERT INTO session_participants (session_id, user_id, is_present)
             VALUES ($1, $2, TRUE)
             ON CONFLICT (session_id, user_id) DO UPDATE SET is_present = TRUE
             RETURNING id, session_id, user_id, is_present, joined_at",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(record.to_domain())
    }

    async fn set_participant_presence(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        is_present: bool,
    ) -> PortResult<()> {
        sqlx::query(
            "UPDATE session_participants SET is_present = $3
             WHERE session_id = $1 AND user_id = $2",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(is_present)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(())
    }

    async fn list_participants(&self, session_id: Uuid) -> PortResult<Vec<Participant>> {
        let records = sqlx::query_as::<_, ParticipantRecord>(
            "SELECT id, session_id, user_id, is_present, joined_at
             FROM session_participants WHERE session_id = $1
             ORDER BY joined_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(records.into_iter().map(ParticipantRecord::to_domain).collect())
    }

    async fn get_random_card(
        &self,
        category_id: i64,
        card_type: CardType,
    ) -> PortResult<Option<Card>> {
        let record = sqlx::query_as::<_, CardRecord>(
            "SELECT id, category_id, card_type, content FROM cards
             WHERE category_id = $1 AND card_type = $2
             ORDER BY random() LIMIT 1",
        )
        .bind(category_id)
        .bind(card_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        record.map(CardRecord::to_domain).transpose()
    }

    async fn create_turn(&self, participant_id: Uuid, card_id: Option<i64>) -> PortResult<Turn> {
        let record = sqlx::query_as::<_, TurnRecord>(
            "INSERT INTO session_turns (participant_id, card_id)
             VALUES ($1, $2)
             RETURNING id, participant_id, card_id, answer_text, score, feedback,
                       answered_at, graded_at",
        )
        .bind(participant_id)
        .bind(card_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(record.to_domain())
    }

    async fn record_answer(&self, turn_id: Uuid, answer_text: &str) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE session_turns SET answer_text = $2, answered_at = now()
             WHERE id = $1",
        )
        .bind(turn_id)
        .bind(answer_text)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Turn {} not found", turn_id)));
        }
        Ok(())
    }

    async fn record_grade(&self, turn_id: Uuid, score: i32, feedback: &str) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE session_turns SET score = $2, feedback = $3, graded_at = now()
             WHERE id = $1",
        )
        .bind(turn_id)
        .bind(score)
        .bind(feedback)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Turn {} not found", turn_id)));
        }
        Ok(())
    }
}
