pub mod domain;
pub mod ports;

pub use domain::{Card, CardType, GameSession, Identity, Participant, Role, SessionStatus, Turn};
pub use ports::{GameStore, PortError, PortResult, TokenVerifier};
