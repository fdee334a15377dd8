//! Crate-wide error ladder.
//!
//! Each layer owns its own small error enum next to its code (`StoreError`,
//! `GridError`, ...); this module hosts the engine-facing [`EngineError`]
//! that the embedding UI sees, plus the conversions between layers.

use thiserror::Error;

use crate::engine::InvalidTransition;
use crate::grid::GridError;
use crate::store::StoreError;

/// Errors surfaced by the game engine to the embedding UI layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The shared document store rejected or lost an operation.
    #[error("store unavailable")]
    Store(#[from] StoreError),
    /// A grid invariant was violated (e.g. unmarking the free cell).
    #[error(transparent)]
    Grid(#[from] GridError),
    /// The attempt state machine rejected a transition.
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    /// The terminal flush failed; the final score may not be durable.
    ///
    /// Intermediate write failures are absorbed (the next coalesced write
    /// supersedes them) but no further write follows the terminal one, so
    /// this is the single persistence failure the caller must see.
    #[error("final state flush failed")]
    FinalFlushFailed(#[source] StoreError),
    /// A challenge-gate contract was broken (not a wrong answer, which is a
    /// gameplay outcome, but e.g. resolving with nothing pending).
    #[error(transparent)]
    Challenge(#[from] crate::challenge::ChallengeError),
    /// Invalid game configuration supplied by the embedding layer.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
