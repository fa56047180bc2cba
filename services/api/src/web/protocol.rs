//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser client and the
//! API server for the live game session.

use classdare_core::domain::CardType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Wire Representations of Domain Enums
//=========================================================================================

/// The card type as it travels over the wire. The domain enum stays free of
/// serde; this mirror owns the JSON spelling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WireCardType {
    Truth,
    Dare,
}

impl From<WireCardType> for CardType {
    fn from(w: WireCardType) -> Self {
        match w {
            WireCardType::Truth => CardType::Truth,
            WireCardType::Dare => CardType::Dare,
        }
    }
}

impl From<CardType> for WireCardType {
    fn from(c: CardType) -> Self {
        match c {
            CardType::Truth => WireCardType::Truth,
            CardType::Dare => WireCardType::Dare,
        }
    }
}

/// One roster row in a `roster_update` broadcast.
#[derive(Serialize, Debug, Clone)]
pub struct RosterEntry {
    pub user_id: Uuid,
    pub is_present: bool,
}

//=========================================================================================
// Messages Sent FROM the Client TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Teacher opens a new game session for a card category.
    CreateSession {
        category_id: i64,
        title: Option<String>,
    },

    /// Join the live room for a session. Students become participants;
    /// the owning teacher joins as the host.
    JoinRoom { session_id: Uuid },

    /// Teacher starts the game: the roster is shuffled into the turn queue
    /// and the session goes `running`.
    StartSession { session_id: Uuid },

    /// Teacher spins the roulette to pick the next player.
    SelectPlayer { session_id: Uuid },

    /// Teacher draws a prompt of the given type for the chosen player.
    DrawPrompt {
        session_id: Uuid,
        card_type: WireCardType,
    },

    /// The chosen player submits their answer.
    SubmitAnswer { session_id: Uuid, text: String },

    /// Teacher grades the submitted answer.
    SubmitGrade {
        session_id: Uuid,
        score: i32,
        feedback: String,
    },

    /// Teacher ends the session early.
    EndSession { session_id: Uuid },
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Direct reply to the creating teacher.
    SessionCreated { session_id: Uuid },

    /// The room's participant list changed (join, disconnect, reconnect).
    RosterUpdate {
        session_id: Uuid,
        participants: Vec<RosterEntry>,
    },

    /// The game has started and players can be selected.
    SessionStarted { session_id: Uuid },

    /// The roulette is spinning; the chosen player is not yet revealed.
    Selecting { session_id: Uuid },

    /// The roulette stopped on a player.
    PlayerSelected { session_id: Uuid, user_id: Uuid },

    /// A prompt was drawn for the active player. `card_id` is absent when the
    /// card pool was empty and a placeholder prompt is in play.
    PromptRevealed {
        session_id: Uuid,
        turn_id: Uuid,
        card_id: Option<i64>,
        card_type: WireCardType,
        content: String,
    },

    /// An answer is in. The text is verbatim only for the owning teacher and
    /// the answering player; everyone else receives a redacted placeholder.
    AnswerReady {
        session_id: Uuid,
        user_id: Uuid,
        text: String,
    },

    /// The turn was graded (by the teacher, or by a timeout/disconnect with
    /// score zero) and the room is back to idle.
    TurnResolved {
        session_id: Uuid,
        user_id: Uuid,
        score: i32,
        feedback: String,
    },

    /// The session is over; the room state is gone.
    SessionEnded { session_id: Uuid },

    /// Reports a request-level error back to the sender.
    Error { message: String },
}
