//! Verification gate in front of mark attempts.
//!
//! Cells may reference a quiz question; such a mark only commits once the
//! participant answers correctly. The gate holds at most one pending
//! verification and never touches grid state itself: the engine applies the
//! mark (and its side effects) only on a committed outcome.

use thiserror::Error;

use crate::grid::{CellKey, Grid};

/// A verification question attached to one or more cells.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Question {
    /// Prompt shown to the participant.
    pub prompt: String,
    /// Answer options, displayed in order.
    pub options: Vec<String>,
    /// Index of the correct option.
    pub answer: usize,
}

/// Outcome of asking the gate about a mark attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkAttempt {
    /// No question on the cell; the mark can be applied immediately.
    Committed(CellKey),
    /// A question must be answered first; nothing has changed yet.
    Pending {
        /// Cell waiting on verification.
        cell: CellKey,
        /// Question to present.
        question: Question,
    },
}

/// Outcome of answering a pending verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Correct answer: the held cell may now be marked.
    Committed(CellKey),
    /// Wrong answer: grid state stays untouched, the cell stays available
    /// for a later attempt.
    Rejected(CellKey),
}

/// Errors raised by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChallengeError {
    /// `resolve` was called while no verification is pending.
    #[error("no verification is pending")]
    NothingPending,
    /// A cell referenced a question index outside the configured list.
    #[error("cell {cell} references unknown question {index}")]
    UnknownQuestion {
        /// Cell carrying the dangling reference.
        cell: CellKey,
        /// Out-of-range question index.
        index: usize,
    },
}

/// Gate holding the configured question list and the single pending slot.
#[derive(Debug, Clone, Default)]
pub struct ChallengeGate {
    questions: Vec<Question>,
    pending: Option<CellKey>,
}

impl ChallengeGate {
    /// Build a gate over the configured question list.
    pub fn new(questions: Vec<Question>) -> Self {
        Self {
            questions,
            pending: None,
        }
    }

    /// Cell currently awaiting verification, if any.
    pub fn pending(&self) -> Option<CellKey> {
        self.pending
    }

    /// Ask whether marking `cell` needs verification.
    ///
    /// Opening a new verification while another is pending drops the old one
    /// un-committed; it is the same participant changing their mind.
    pub fn attempt(&mut self, grid: &Grid, cell: CellKey) -> Result<MarkAttempt, ChallengeError> {
        let question_index = grid.cell(cell).and_then(|c| c.question);
        match question_index {
            None => {
                self.pending = None;
                Ok(MarkAttempt::Committed(cell))
            }
            Some(index) => {
                let question = self
                    .questions
                    .get(index)
                    .cloned()
                    .ok_or(ChallengeError::UnknownQuestion { cell, index })?;
                self.pending = Some(cell);
                Ok(MarkAttempt::Pending { cell, question })
            }
        }
    }

    /// Answer the pending verification with the selected option index.
    pub fn resolve(
        &mut self,
        grid: &Grid,
        selected: usize,
    ) -> Result<Verification, ChallengeError> {
        let cell = self.pending.take().ok_or(ChallengeError::NothingPending)?;
        let index = grid
            .cell(cell)
            .and_then(|c| c.question)
            .ok_or(ChallengeError::NothingPending)?;
        let question = self
            .questions
            .get(index)
            .ok_or(ChallengeError::UnknownQuestion { cell, index })?;

        if question.answer == selected {
            Ok(Verification::Committed(cell))
        } else {
            Ok(Verification::Rejected(cell))
        }
    }

    /// Drop any pending verification without committing it.
    pub fn cancel(&mut self) {
        self.pending = None;
    }
}
