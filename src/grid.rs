//! Pure in-memory model of an N×N game card.
//!
//! Nothing in this module performs I/O: the grid is generated once per game
//! attempt, cell marks live in a plain set owned by the participant's client,
//! and win detection is a pure function over that set so callers can
//! re-evaluate it as often as they like. The first-win latch (record
//! `time_to_first_win` once, fire celebration effects once) is the engine's
//! responsibility, not this module's.

use std::collections::BTreeSet;
use std::fmt;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported card dimensions.
pub const SUPPORTED_SIZES: [usize; 3] = [3, 4, 5];

/// Position of a cell on the card, row-major from the top-left corner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CellKey {
    /// Zero-based row index.
    pub row: usize,
    /// Zero-based column index.
    pub col: usize,
}

impl CellKey {
    /// Build a key from row and column indices.
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    /// Parse the `"row-col"` wire form used in shared documents.
    pub fn parse(value: &str) -> Option<Self> {
        let (row, col) = value.split_once('-')?;
        Some(Self {
            row: row.parse().ok()?,
            col: col.parse().ok()?,
        })
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.row, self.col)
    }
}

/// Set of marked cell positions. Ordered so serialized forms are stable.
pub type MarkedSet = BTreeSet<CellKey>;

/// A single cell of the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Item label rendered on the cell.
    pub label: String,
    /// Optional reference into the configured question list; a cell with a
    /// question must pass the challenge gate before its mark commits.
    pub question: Option<usize>,
    /// Whether this is the free cell (pre-marked, can never be unmarked).
    pub free: bool,
}

/// Generated card: `size`×`size` cells stored row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    size: usize,
    cells: Vec<Cell>,
}

/// Rule deciding when a marked set constitutes a win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinPolicy {
    /// Any fully marked row, column, or diagonal wins.
    Line,
    /// Every cell of the card must be marked.
    FullCard,
    /// All four corner cells must be marked.
    Corners,
    /// Either a completed line or all four corners wins.
    AnyPattern,
}

/// Result of evaluating the win predicate over a marked set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinEvaluation {
    /// Count of fully marked rows + columns + diagonals (0..=2 diagonals).
    pub lines_completed: usize,
    /// Whether every cell of the card is marked.
    pub full_card: bool,
    /// Whether all four corners are marked.
    pub corners: bool,
    /// Whether the active policy is satisfied.
    pub won: bool,
}

/// Invariant violations raised at the grid boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    /// The free cell is always marked and can never be removed.
    #[error("the free cell at {0} cannot be unmarked")]
    FreeCellLocked(CellKey),
    /// The referenced cell is outside the card.
    #[error("cell {key} is outside a {size}x{size} card")]
    OutOfBounds {
        /// Offending position.
        key: CellKey,
        /// Card dimension.
        size: usize,
    },
}

impl Grid {
    /// Generate a fresh card from the configured item labels.
    ///
    /// Items are shuffled and laid out row-major; odd-sized cards get a free
    /// cell in the exact center. Callers must supply at least `size² − 1`
    /// items — [`crate::config::GameConfig::validate`] enforces that at the
    /// boundary, so running short here is a caller bug and the grid simply
    /// takes the items in order without padding.
    pub fn generate<R: rand::Rng + ?Sized>(
        items: &[GridItem],
        size: usize,
        rng: &mut R,
    ) -> Self {
        let mut shuffled: Vec<&GridItem> = items.iter().collect();
        shuffled.shuffle(rng);

        let free_cell = free_cell_for(size);
        let mut next = shuffled.into_iter();
        let mut cells = Vec::with_capacity(size * size);
        for row in 0..size {
            for col in 0..size {
                let key = CellKey::new(row, col);
                if Some(key) == free_cell {
                    cells.push(Cell {
                        label: FREE_CELL_LABEL.to_string(),
                        question: None,
                        free: true,
                    });
                } else {
                    let item = next.next();
                    cells.push(Cell {
                        label: item.map(|i| i.label.clone()).unwrap_or_default(),
                        question: item.and_then(|i| i.question),
                        free: false,
                    });
                }
            }
        }

        Self { size, cells }
    }

    /// Card dimension N.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Position of the free cell, if this card has one.
    pub fn free_cell(&self) -> Option<CellKey> {
        free_cell_for(self.size)
    }

    /// Look up a cell by position.
    pub fn cell(&self, key: CellKey) -> Option<&Cell> {
        if key.row >= self.size || key.col >= self.size {
            return None;
        }
        self.cells.get(key.row * self.size + key.col)
    }

    /// Iterate all cells with their positions, row-major.
    pub fn iter(&self) -> impl Iterator<Item = (CellKey, &Cell)> {
        self.cells.iter().enumerate().map(|(index, cell)| {
            (CellKey::new(index / self.size, index % self.size), cell)
        })
    }

    /// The marked set every fresh attempt starts from: just the free cell.
    pub fn initial_marks(&self) -> MarkedSet {
        self.free_cell().into_iter().collect()
    }

    /// Add `key` to the marked set. Idempotent: re-marking is a no-op.
    pub fn mark(&self, marked: &mut MarkedSet, key: CellKey) -> Result<(), GridError> {
        self.ensure_in_bounds(key)?;
        marked.insert(key);
        Ok(())
    }

    /// Remove `key` from the marked set.
    ///
    /// The free cell is a permanent member of the set: attempting to remove
    /// it is rejected and the set stays untouched.
    pub fn unmark(&self, marked: &mut MarkedSet, key: CellKey) -> Result<(), GridError> {
        self.ensure_in_bounds(key)?;
        if self.free_cell() == Some(key) {
            return Err(GridError::FreeCellLocked(key));
        }
        marked.remove(&key);
        Ok(())
    }

    /// Evaluate the win predicate for `policy` over `marked`.
    ///
    /// `lines_completed` is reported for every policy because line counts
    /// feed scoring and awards even when the active rule is corners or
    /// full-card.
    pub fn evaluate(&self, marked: &MarkedSet, policy: WinPolicy) -> WinEvaluation {
        let n = self.size;
        let row_done =
            |row: usize| (0..n).all(|col| marked.contains(&CellKey::new(row, col)));
        let col_done =
            |col: usize| (0..n).all(|row| marked.contains(&CellKey::new(row, col)));

        let mut lines = (0..n).filter(|&row| row_done(row)).count()
            + (0..n).filter(|&col| col_done(col)).count();
        if (0..n).all(|i| marked.contains(&CellKey::new(i, i))) {
            lines += 1;
        }
        if (0..n).all(|i| marked.contains(&CellKey::new(i, n - 1 - i))) {
            lines += 1;
        }

        let full_card = (0..n * n)
            .all(|index| marked.contains(&CellKey::new(index / n, index % n)));
        let corners = [
            CellKey::new(0, 0),
            CellKey::new(0, n - 1),
            CellKey::new(n - 1, 0),
            CellKey::new(n - 1, n - 1),
        ]
        .iter()
        .all(|key| marked.contains(key));

        let won = match policy {
            WinPolicy::Line => lines > 0,
            WinPolicy::FullCard => full_card,
            WinPolicy::Corners => corners,
            WinPolicy::AnyPattern => lines > 0 || corners,
        };

        WinEvaluation {
            lines_completed: lines,
            full_card,
            corners,
            won,
        }
    }

    fn ensure_in_bounds(&self, key: CellKey) -> Result<(), GridError> {
        if key.row >= self.size || key.col >= self.size {
            return Err(GridError::OutOfBounds {
                key,
                size: self.size,
            });
        }
        Ok(())
    }
}

/// Item supplied by the embedding layer to fill the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridItem {
    /// Label rendered on the cell.
    pub label: String,
    /// Optional index into the configured question list.
    pub question: Option<usize>,
}

impl GridItem {
    /// Item with no verification question attached.
    pub fn plain(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            question: None,
        }
    }

    /// Item gated by the question at `question` in the configured list.
    pub fn with_question(label: impl Into<String>, question: usize) -> Self {
        Self {
            label: label.into(),
            question: Some(question),
        }
    }
}

const FREE_CELL_LABEL: &str = "FREE";

/// Center position of the free cell for odd sizes; even cards have none.
fn free_cell_for(size: usize) -> Option<CellKey> {
    (size % 2 == 1).then(|| CellKey::new(size / 2, size / 2))
}
