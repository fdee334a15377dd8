//! Game configuration supplied by the embedding UI layer.

use uuid::Uuid;

use crate::challenge::Question;
use crate::error::EngineError;
use crate::grid::{GridItem, SUPPORTED_SIZES, WinPolicy};

/// Everything the engine needs to run one participant's game attempt.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Session this attempt belongs to.
    pub session_id: Uuid,
    /// Identity of the owning participant.
    pub participant_id: Uuid,
    /// Card dimension N (3, 4, or 5).
    pub card_size: usize,
    /// Rule deciding when the attempt is won.
    pub win_policy: WinPolicy,
    /// Session time limit in seconds; `None` means untimed.
    pub time_limit_seconds: Option<u64>,
    /// Items to fill the card with; at least `card_size² − 1` required.
    pub items: Vec<GridItem>,
    /// Question list referenced by gated items.
    pub questions: Vec<Question>,
    /// Whether a win under a line-based policy ends the attempt immediately
    /// or lets play continue collecting further lines.
    pub end_on_win: bool,
}

impl GameConfig {
    /// Validate the input contract before anything is generated or persisted.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !SUPPORTED_SIZES.contains(&self.card_size) {
            return Err(EngineError::InvalidConfig(format!(
                "unsupported card size {} (expected one of {SUPPORTED_SIZES:?})",
                self.card_size
            )));
        }

        let free_cells = usize::from(self.card_size % 2 == 1);
        let required = self.card_size * self.card_size - free_cells;
        if self.items.len() < required {
            return Err(EngineError::InvalidConfig(format!(
                "{supplied} items supplied but a {n}x{n} card needs at least {required}",
                supplied = self.items.len(),
                n = self.card_size,
            )));
        }

        for item in &self.items {
            if let Some(index) = item.question {
                if index >= self.questions.len() {
                    return Err(EngineError::InvalidConfig(format!(
                        "item `{}` references unknown question {index}",
                        item.label
                    )));
                }
            }
        }

        if self.time_limit_seconds == Some(0) {
            return Err(EngineError::InvalidConfig(
                "time limit must be strictly positive".into(),
            ));
        }

        Ok(())
    }
}
