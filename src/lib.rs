//! Session synchronization and game-state core for live multi-participant
//! grid games.
//!
//! One presenter device drives a session; many participant devices play it
//! concurrently, coordinated only through a shared real-time document store.
//! This crate owns the hard parts of that arrangement: anchor-based timer
//! synchronization, grid marking with pattern win detection, local recovery
//! snapshots across reloads, debounced persistence with a guaranteed
//! terminal flush, and presence/kick detection. Rendering, theming, sound
//! playback, and routing live in the embedding layers.

pub mod challenge;
pub mod clock;
pub mod config;
pub mod documents;
pub mod engine;
mod error;
pub mod grid;
pub mod presence;
pub mod recovery;
pub mod store;
pub mod sync;
pub mod timer;

pub use config::GameConfig;
pub use engine::{AttemptPhase, GameEngine, GameHooks, MarkOutcome};
pub use error::EngineError;
pub use grid::{CellKey, Grid, WinPolicy};
