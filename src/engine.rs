//! Participant-side game engine.
//!
//! Orchestrates one participant's game attempt: challenge gate → grid
//! mutation → score/streak update → debounced local and remote persistence →
//! win evaluation, with a latched finalize path shared by every terminal
//! trigger (timer expiry, policy-terminal win, external completion, kick).
//!
//! The engine is single-threaded cooperative: the embedding layer calls
//! [`GameEngine::tick`] roughly once per second and
//! [`GameEngine::pump_remote`] whenever it wants remote notifications
//! applied. No method blocks; all I/O suspends.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::challenge::{ChallengeGate, MarkAttempt, Question, Verification};
use crate::clock::SharedClock;
use crate::config::GameConfig;
use crate::documents::{ParticipantDoc, SessionStatus, participant_key, session_key};
use crate::error::EngineError;
use crate::grid::{CellKey, Grid, MarkedSet, WinEvaluation, WinPolicy};
use crate::presence::{PresenceEvent, PresenceMonitor};
use crate::recovery::{LocalStore, RecoverySnapshot, RecoveryStore, recovery_key};
use crate::store::DocumentStore;
use crate::sync::PersistQueue;
use crate::timer::{TimerFollower, TimerTuple};

/// Points awarded for every committed mark.
const MARK_BASE_POINTS: i64 = 10;
/// Extra points per step of the current streak.
const STREAK_BONUS_POINTS: i64 = 2;
/// Celebration window between a policy-terminal win and completion.
const CELEBRATION_MS: u64 = 3_000;

/// Phase of one participant's game attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    /// Nothing generated yet.
    NotStarted,
    /// Playing; no win observed so far.
    InProgress,
    /// Win observed; play continues collecting lines and cells.
    Won,
    /// Terminal: timer expiry, policy-terminal win, or external completion.
    Completed,
    /// Terminal: the presenter removed this participant.
    Removed,
}

impl AttemptPhase {
    /// Whether the attempt can still change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptPhase::Completed | AttemptPhase::Removed)
    }
}

/// Action attempted against the state machine, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptAction {
    /// Mark or resolve a challenge.
    Mark,
    /// Unmark a cell.
    Unmark,
    /// Finalize the attempt.
    Finalize,
}

/// Error returned when an action is not valid in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid action: {action:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// Phase the attempt was in.
    pub from: AttemptPhase,
    /// Rejected action.
    pub action: AttemptAction,
}

/// Why the attempt reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The session timer hit zero.
    TimerExpired,
    /// The win condition was met under a policy that ends the game.
    WinConditionMet,
    /// The presenter completed (or deleted) the session.
    SessionEnded,
}

/// Final statistics handed to the completion hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameStats {
    /// Final score.
    pub score: i64,
    /// Best streak reached.
    pub best_streak: u32,
    /// Completed rows + columns + diagonals.
    pub lines_completed: usize,
    /// Whether the whole card was marked.
    pub full_card: bool,
    /// Whether the win condition was ever satisfied.
    pub game_won: bool,
    /// Seconds from start to the first win, if any.
    pub time_to_first_win: Option<u64>,
    /// Terminal trigger.
    pub reason: CompletionReason,
}

/// Sound/visual cues requested by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    /// A mark committed.
    Mark,
    /// A verification was answered wrong.
    Reject,
    /// The win condition was first satisfied.
    Win,
    /// The attempt finalized.
    GameOver,
}

/// Injected effect surface; replaces any global sound/effect singleton so
/// tests can substitute a no-op.
pub trait EffectSink: Send + Sync {
    /// Play a sound cue.
    fn play(&self, cue: SoundCue);
    /// Run the win celebration (confetti etc.).
    fn celebrate(&self);
}

/// Callbacks delivered to the embedding layer.
pub trait GameHooks: Send + Sync {
    /// The attempt finalized; fired exactly once.
    fn on_game_complete(&self, stats: &GameStats);
    /// The presenter removed this participant; fired exactly once.
    fn on_kicked(&self);
}

/// Effect sink that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEffects;

impl EffectSink for NoopEffects {
    fn play(&self, _cue: SoundCue) {}
    fn celebrate(&self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl GameHooks for NoopHooks {
    fn on_game_complete(&self, _stats: &GameStats) {}
    fn on_kicked(&self) {}
}

/// What a mark attempt produced, surfaced to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    /// The mark committed; carries the fresh win evaluation and whether the
    /// first-win latch fired on this very mark.
    Marked {
        /// Win evaluation after the mark.
        evaluation: WinEvaluation,
        /// True only on the mark that first satisfied the win condition.
        first_win: bool,
    },
    /// A verification question must be answered first.
    Pending(Question),
    /// The verification was answered wrong; nothing changed.
    Rejected,
}

/// Result of one follower tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Remaining seconds after the tick.
    pub remaining: u64,
    /// Whether this tick finalized the attempt.
    pub finalized: bool,
}

/// One participant's running game attempt.
pub struct GameEngine {
    config: GameConfig,
    clock: SharedClock,
    effects: Arc<dyn EffectSink>,
    hooks: Arc<dyn GameHooks>,

    phase: AttemptPhase,
    grid: Grid,
    marked: MarkedSet,
    gate: ChallengeGate,

    score: i64,
    streak: u32,
    best_streak: u32,
    lines_completed: usize,
    full_card: bool,
    game_won: bool,
    time_to_first_win: Option<u64>,
    start_time_ms: u64,
    /// Deadline (epoch ms) after which a policy-terminal win completes the
    /// attempt; checked on tick instead of holding a separate timer.
    end_after_ms: Option<u64>,

    follower: TimerFollower,
    recovery: RecoveryStore,
    queue: PersistQueue<ParticipantDoc>,
    monitor: Option<PresenceMonitor>,
}

impl GameEngine {
    /// Start (or resume) an attempt.
    ///
    /// A valid recovery snapshot for this `(session, participant)` pair and
    /// card size resumes the previous state; otherwise a fresh grid is
    /// generated. The initial participant document is enqueued, not flushed:
    /// joining is not a terminal event.
    pub async fn start(
        config: GameConfig,
        store: Arc<dyn DocumentStore>,
        local: Arc<dyn LocalStore>,
        clock: SharedClock,
        effects: Arc<dyn EffectSink>,
        hooks: Arc<dyn GameHooks>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let session_key = session_key(config.session_id);
        let participant_key = participant_key(config.session_id, config.participant_id);
        let recovery = RecoveryStore::new(
            local,
            clock.clone(),
            recovery_key(config.session_id, config.participant_id),
        );
        let queue = PersistQueue::new(store.clone(), participant_key.clone());
        let monitor = PresenceMonitor::spawn(store, &session_key, &participant_key).await?;

        let restored = recovery.load(config.card_size);
        let mut engine = match restored {
            Some(snapshot) => {
                info!(
                    session = %config.session_id,
                    participant = %config.participant_id,
                    "resuming attempt from recovery snapshot"
                );
                let follower =
                    TimerFollower::new(clock.clone(), Some(snapshot.time_remaining));
                Self {
                    phase: if snapshot.game_won {
                        AttemptPhase::Won
                    } else {
                        AttemptPhase::InProgress
                    },
                    gate: ChallengeGate::new(config.questions.clone()),
                    marked: snapshot.marked_cells,
                    grid: snapshot.grid,
                    score: snapshot.score,
                    streak: snapshot.streak,
                    best_streak: snapshot.best_streak,
                    lines_completed: snapshot.completed_lines,
                    full_card: false,
                    game_won: snapshot.game_won,
                    time_to_first_win: snapshot.first_win_time,
                    start_time_ms: snapshot.start_time_ms,
                    end_after_ms: None,
                    follower,
                    recovery,
                    queue,
                    monitor: Some(monitor),
                    clock,
                    effects,
                    hooks,
                    config,
                }
            }
            None => {
                let grid =
                    Grid::generate(&config.items, config.card_size, &mut rand::rng());
                let marked = grid.initial_marks();
                let follower = TimerFollower::new(clock.clone(), config.time_limit_seconds);
                let start_time_ms = clock.now_ms();
                Self {
                    phase: AttemptPhase::InProgress,
                    gate: ChallengeGate::new(config.questions.clone()),
                    marked,
                    grid,
                    score: 0,
                    streak: 0,
                    best_streak: 0,
                    lines_completed: 0,
                    full_card: false,
                    game_won: false,
                    time_to_first_win: None,
                    start_time_ms,
                    end_after_ms: None,
                    follower,
                    recovery,
                    queue,
                    monitor: Some(monitor),
                    clock,
                    effects,
                    hooks,
                    config,
                }
            }
        };

        engine.full_card = engine
            .grid
            .evaluate(&engine.marked, WinPolicy::FullCard)
            .full_card;
        engine.queue.enqueue(engine.participant_doc());
        Ok(engine)
    }

    /// Current attempt phase.
    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    /// The generated card.
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Currently marked cells.
    pub fn marked(&self) -> &MarkedSet {
        &self.marked
    }

    /// Committed score. The same value feeds the UI and every persisted
    /// write; there is no separately captured copy to go stale.
    pub fn score(&self) -> i64 {
        self.score
    }

    /// Remaining seconds as last derived from the authority tuple (or the
    /// pre-authority fallback).
    pub fn remaining_seconds(&self) -> u64 {
        self.follower.remaining()
    }

    /// Attempt to mark `cell`, passing through the challenge gate.
    pub fn attempt_mark(&mut self, cell: CellKey) -> Result<MarkOutcome, EngineError> {
        self.ensure_active(AttemptAction::Mark)?;
        match self.gate.attempt(&self.grid, cell)? {
            MarkAttempt::Committed(cell) => Ok(self.apply_committed_mark(cell)?),
            MarkAttempt::Pending { question, .. } => Ok(MarkOutcome::Pending(question)),
        }
    }

    /// Answer the pending verification with the selected option index.
    pub fn resolve_challenge(&mut self, selected: usize) -> Result<MarkOutcome, EngineError> {
        self.ensure_active(AttemptAction::Mark)?;
        match self.gate.resolve(&self.grid, selected)? {
            Verification::Committed(cell) => Ok(self.apply_committed_mark(cell)?),
            Verification::Rejected(_cell) => {
                // A gameplay outcome, not an error: nothing persisted moves.
                self.effects.play(SoundCue::Reject);
                Ok(MarkOutcome::Rejected)
            }
        }
    }

    /// User-initiated unmark of a non-free cell. Breaks the streak.
    pub fn unmark(&mut self, cell: CellKey) -> Result<(), EngineError> {
        self.ensure_active(AttemptAction::Unmark)?;
        self.grid.unmark(&mut self.marked, cell)?;

        let evaluation = self.grid.evaluate(&self.marked, self.config.win_policy);
        self.lines_completed = evaluation.lines_completed;
        self.full_card = evaluation.full_card;
        self.streak = 0;
        // game_won stays latched even if the winning pattern is broken.
        self.persist_debounced();
        Ok(())
    }

    /// Advance one ≈1 s tick: recompute remaining time, apply the
    /// celebration deadline, finalize on expiry.
    pub async fn tick(&mut self) -> Result<TickReport, EngineError> {
        if self.phase.is_terminal() {
            return Ok(TickReport {
                remaining: self.follower.remaining(),
                finalized: false,
            });
        }

        if let Some(deadline) = self.end_after_ms {
            if self.clock.now_ms() >= deadline {
                self.finalize(CompletionReason::WinConditionMet).await?;
                return Ok(TickReport {
                    remaining: self.follower.remaining(),
                    finalized: true,
                });
            }
        }

        let outcome = self.follower.tick();
        if outcome.expired {
            self.finalize(CompletionReason::TimerExpired).await?;
            return Ok(TickReport {
                remaining: 0,
                finalized: true,
            });
        }

        Ok(TickReport {
            remaining: outcome.remaining,
            finalized: false,
        })
    }

    /// Drain and apply all presence notifications received so far.
    ///
    /// Timer tuples feed the follower; an external completion drives the
    /// same finalize path as timer expiry; a kick exits to [`AttemptPhase::Removed`].
    pub async fn pump_remote(&mut self) -> Result<(), EngineError> {
        loop {
            let event = match self.monitor.as_mut() {
                Some(monitor) => monitor.try_next(),
                None => return Ok(()),
            };
            let Some(event) = event else { return Ok(()) };

            match event {
                PresenceEvent::SessionUpdated(doc) => {
                    if doc.status == SessionStatus::Active {
                        if let Some(tuple) = TimerTuple::from_session(&doc) {
                            self.follower.apply_authority(tuple);
                        }
                    }
                }
                PresenceEvent::SessionCompleted => {
                    if !self.phase.is_terminal() {
                        self.finalize(CompletionReason::SessionEnded).await?;
                    }
                }
                PresenceEvent::Kicked => self.handle_kicked(),
            }
        }
    }

    /// Final statistics for the attempt as it stands.
    pub fn stats(&self, reason: CompletionReason) -> GameStats {
        GameStats {
            score: self.score,
            best_streak: self.best_streak,
            lines_completed: self.lines_completed,
            full_card: self.full_card,
            game_won: self.game_won,
            time_to_first_win: self.time_to_first_win,
            reason,
        }
    }

    /// Release every timer and subscription in one pass. Safe to call more
    /// than once; also runs on drop.
    pub fn teardown(&mut self) {
        self.queue.dispose();
        self.recovery.dispose();
        if let Some(mut monitor) = self.monitor.take() {
            monitor.teardown();
        }
    }

    fn ensure_active(&self, action: AttemptAction) -> Result<(), InvalidTransition> {
        if self.phase.is_terminal() {
            return Err(InvalidTransition {
                from: self.phase,
                action,
            });
        }
        Ok(())
    }

    /// Apply a mark that passed the gate: mutate the set, update score and
    /// streak, evaluate the win predicate, latch the first win, persist.
    ///
    /// Everything below runs under the same `&mut self` borrow, so the score
    /// the UI reads and the score that gets persisted are one committed
    /// value.
    fn apply_committed_mark(&mut self, cell: CellKey) -> Result<MarkOutcome, EngineError> {
        let already = self.marked.contains(&cell);
        self.grid.mark(&mut self.marked, cell)?;

        if !already {
            self.streak += 1;
            self.best_streak = self.best_streak.max(self.streak);
            self.score += MARK_BASE_POINTS + STREAK_BONUS_POINTS * i64::from(self.streak - 1);
            self.effects.play(SoundCue::Mark);
        }

        let evaluation = self.grid.evaluate(&self.marked, self.config.win_policy);
        self.lines_completed = evaluation.lines_completed;
        self.full_card = evaluation.full_card;

        let first_win = evaluation.won && !self.game_won;
        if first_win {
            // The win latch: record the offset once and fire the win side
            // effects once; later evaluations can never re-trigger them.
            self.game_won = true;
            self.time_to_first_win =
                Some(self.clock.now_ms().saturating_sub(self.start_time_ms) / 1000);
            self.phase = AttemptPhase::Won;
            self.effects.play(SoundCue::Win);
            self.effects.celebrate();

            let policy_terminal = self.config.end_on_win
                || self.config.win_policy == WinPolicy::FullCard
                || evaluation.full_card;
            if policy_terminal {
                self.end_after_ms = Some(self.clock.now_ms() + CELEBRATION_MS);
            }
            debug!(
                participant = %self.config.participant_id,
                time_to_first_win = ?self.time_to_first_win,
                "win condition first satisfied"
            );
        }

        self.persist_debounced();
        Ok(MarkOutcome::Marked {
            evaluation,
            first_win,
        })
    }

    /// Latched terminal transition shared by every trigger. Exactly one
    /// caller wins the latch; the rest are no-ops.
    async fn finalize(&mut self, reason: CompletionReason) -> Result<(), EngineError> {
        if self.phase.is_terminal() {
            return Ok(());
        }
        self.phase = AttemptPhase::Completed;
        self.end_after_ms = None;
        self.gate.cancel();

        let mut doc = self.participant_doc();
        doc.completed = true;

        // Terminal flush bypasses the coalescing window; its failure is the
        // one persistence error the caller must see.
        let flush = self.queue.flush_now(&doc).await;
        self.recovery.clear();
        if let Some(mut monitor) = self.monitor.take() {
            monitor.teardown();
        }

        let stats = self.stats(reason);
        info!(
            participant = %self.config.participant_id,
            score = stats.score,
            ?reason,
            "attempt finalized"
        );
        self.effects.play(SoundCue::GameOver);
        self.hooks.on_game_complete(&stats);

        flush.map_err(EngineError::FinalFlushFailed)
    }

    /// Kick path: a separate terminal distinct from completion. Clears the
    /// recovery entry and fires `on_kicked` once.
    fn handle_kicked(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = AttemptPhase::Removed;
        self.end_after_ms = None;
        self.gate.cancel();
        self.queue.dispose();
        self.recovery.clear();
        if let Some(mut monitor) = self.monitor.take() {
            monitor.teardown();
        }

        warn!(participant = %self.config.participant_id, "removed from session by presenter");
        self.hooks.on_kicked();
    }

    fn persist_debounced(&mut self) {
        self.recovery.save(self.capture_snapshot());
        self.queue.enqueue(self.participant_doc());
    }

    fn capture_snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            grid: self.grid.clone(),
            marked_cells: self.marked.clone(),
            score: self.score,
            streak: self.streak,
            best_streak: self.best_streak,
            first_win_time: self.time_to_first_win,
            start_time_ms: self.start_time_ms,
            time_remaining: self.follower.remaining(),
            completed_lines: self.lines_completed,
            game_won: self.game_won,
            card_size: self.config.card_size,
            captured_at_ms: self.clock.now_ms(),
        }
    }

    fn participant_doc(&self) -> ParticipantDoc {
        ParticipantDoc {
            marked_cell_keys: ParticipantDoc::encode_marks(&self.marked),
            score: self.score,
            streak: self.streak,
            best_streak: self.best_streak,
            lines_completed: self.lines_completed,
            full_card_achieved: self.full_card,
            game_won: self.game_won,
            time_to_first_win: self.time_to_first_win,
            completed: self.phase.is_terminal(),
            win_condition: self.config.win_policy,
        }
    }
}

impl Drop for GameEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::grid::GridItem;
    use crate::recovery::MemoryLocalStore;
    use crate::store::MemoryStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingHooks {
        completions: AtomicUsize,
        kicks: AtomicUsize,
        last_stats: Mutex<Option<GameStats>>,
    }

    impl GameHooks for RecordingHooks {
        fn on_game_complete(&self, stats: &GameStats) {
            self.completions.fetch_add(1, Ordering::SeqCst);
            *self.last_stats.lock().unwrap() = Some(stats.clone());
        }
        fn on_kicked(&self) {
            self.kicks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingEffects {
        cues: Mutex<Vec<SoundCue>>,
    }

    impl EffectSink for RecordingEffects {
        fn play(&self, cue: SoundCue) {
            self.cues.lock().unwrap().push(cue);
        }
        fn celebrate(&self) {}
    }

    struct Harness {
        store: Arc<MemoryStore>,
        local: Arc<MemoryLocalStore>,
        clock: Arc<ManualClock>,
        hooks: Arc<RecordingHooks>,
        effects: Arc<RecordingEffects>,
        config: GameConfig,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    impl Harness {
        fn new(card_size: usize, win_policy: WinPolicy) -> Self {
            init_tracing();
            Self {
                store: Arc::new(MemoryStore::new()),
                local: Arc::new(MemoryLocalStore::new()),
                clock: ManualClock::at(1_000_000),
                hooks: Arc::new(RecordingHooks::default()),
                effects: Arc::new(RecordingEffects::default()),
                config: GameConfig {
                    session_id: Uuid::new_v4(),
                    participant_id: Uuid::new_v4(),
                    card_size,
                    win_policy,
                    time_limit_seconds: Some(60),
                    items: (0..card_size * card_size)
                        .map(|i| GridItem::plain(format!("item {i}")))
                        .collect(),
                    questions: vec![],
                    end_on_win: false,
                },
            }
        }

        async fn engine(&self) -> GameEngine {
            GameEngine::start(
                self.config.clone(),
                self.store.clone(),
                self.local.clone(),
                self.clock.clone(),
                self.effects.clone(),
                self.hooks.clone(),
            )
            .await
            .unwrap()
        }

        fn participant_key(&self) -> String {
            participant_key(self.config.session_id, self.config.participant_id)
        }

        fn session_key(&self) -> String {
            session_key(self.config.session_id)
        }
    }

    fn mark_row(engine: &mut GameEngine, row: usize) {
        let size = engine.grid().size();
        for col in 0..size {
            engine.attempt_mark(CellKey::new(row, col)).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn marking_a_full_row_wins_once_and_records_first_win_time() {
        let h = Harness::new(5, WinPolicy::Line);
        let mut engine = h.engine().await;

        h.clock.advance_secs(12);
        let mut first_wins = 0;
        for col in 0..5 {
            match engine.attempt_mark(CellKey::new(2, col)).unwrap() {
                MarkOutcome::Marked { first_win, .. } if first_win => first_wins += 1,
                _ => {}
            }
        }

        assert_eq!(first_wins, 1);
        assert_eq!(engine.phase(), AttemptPhase::Won);
        assert_eq!(engine.time_to_first_win, Some(12));
        assert_eq!(engine.lines_completed, 1);

        // Marking more cells never re-fires the latch.
        let outcome = engine.attempt_mark(CellKey::new(0, 0)).unwrap();
        assert!(matches!(outcome, MarkOutcome::Marked { first_win: false, .. }));
        let wins = h
            .effects
            .cues
            .lock()
            .unwrap()
            .iter()
            .filter(|cue| **cue == SoundCue::Win)
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn score_and_persisted_doc_come_from_the_same_committed_value() {
        let h = Harness::new(3, WinPolicy::FullCard);
        let mut engine = h.engine().await;

        engine.attempt_mark(CellKey::new(0, 0)).unwrap();
        engine.attempt_mark(CellKey::new(0, 1)).unwrap();
        // 10 + (10 + 2): streak bonus on the second consecutive mark.
        assert_eq!(engine.score(), 22);

        tokio::time::sleep(crate::sync::FLUSH_DEBOUNCE).await;
        let doc = h.store.peek(&h.participant_key()).unwrap();
        assert_eq!(doc["score"], 22);
        assert_eq!(doc["streak"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_marks_is_one_remote_write_with_final_state() {
        let h = Harness::new(5, WinPolicy::Line);
        let mut engine = h.engine().await;

        for col in 0..3 {
            engine.attempt_mark(CellKey::new(0, col)).unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        tokio::time::sleep(crate::sync::FLUSH_DEBOUNCE).await;

        let doc = h.store.peek(&h.participant_key()).unwrap();
        // 4 keys: free cell + the 3 marks, reflecting the state after the
        // last mark of the burst.
        assert_eq!(doc["markedCellKeys"].as_array().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expiry_finalizes_exactly_once_even_with_external_completion() {
        let h = Harness::new(5, WinPolicy::Line);
        let mut engine = h.engine().await;

        // Authority starts a 60 s timer.
        h.store
            .update(
                &h.session_key(),
                serde_json::json!({
                    "status": "active",
                    "timerStartedAt": h.clock.now_ms(),
                    "sessionTimeLimit": 60,
                    "timerPaused": false,
                }),
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;
        engine.pump_remote().await.unwrap();
        assert_eq!(engine.remaining_seconds(), 60);

        // Presenter completes the session in the same instant the timer
        // runs out; both triggers race into the same latch.
        h.clock.advance_secs(61);
        h.store
            .update(&h.session_key(), serde_json::json!({ "status": "completed" }))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        let report = engine.tick().await.unwrap();
        assert!(report.finalized);
        engine.pump_remote().await.unwrap();

        assert_eq!(engine.phase(), AttemptPhase::Completed);
        assert_eq!(h.hooks.completions.load(Ordering::SeqCst), 1);

        // Terminal flush happened synchronously with the finalize.
        let doc = h.store.peek(&h.participant_key()).unwrap();
        assert_eq!(doc["completed"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn external_completion_alone_finalizes_via_the_same_path() {
        let h = Harness::new(5, WinPolicy::Line);
        let mut engine = h.engine().await;

        h.store
            .update(&h.session_key(), serde_json::json!({ "status": "completed" }))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        engine.pump_remote().await.unwrap();

        assert_eq!(engine.phase(), AttemptPhase::Completed);
        let stats = h.hooks.last_stats.lock().unwrap().clone().unwrap();
        assert_eq!(stats.reason, CompletionReason::SessionEnded);
        assert!(h.local.get(&recovery_key(
            h.config.session_id,
            h.config.participant_id
        )).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn kick_is_a_distinct_terminal_and_fires_once() {
        let h = Harness::new(5, WinPolicy::Line);
        let mut engine = h.engine().await;

        h.store.delete(&h.participant_key()).await.unwrap();
        tokio::task::yield_now().await;
        engine.pump_remote().await.unwrap();
        engine.pump_remote().await.unwrap();

        assert_eq!(engine.phase(), AttemptPhase::Removed);
        assert_eq!(h.hooks.kicks.load(Ordering::SeqCst), 1);
        assert_eq!(h.hooks.completions.load(Ordering::SeqCst), 0);

        // Terminal phase rejects further play.
        let err = engine.attempt_mark(CellKey::new(0, 0)).unwrap_err();
        assert!(matches!(err, EngineError::Transition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn full_card_win_completes_after_the_celebration_window() {
        let h = Harness::new(3, WinPolicy::FullCard);
        let mut engine = h.engine().await;

        for row in 0..3 {
            mark_row(&mut engine, row);
        }
        assert_eq!(engine.phase(), AttemptPhase::Won);

        // Celebration window still open.
        engine.tick().await.unwrap();
        assert_eq!(engine.phase(), AttemptPhase::Won);

        h.clock.advance_ms(CELEBRATION_MS);
        let report = engine.tick().await.unwrap();
        assert!(report.finalized);
        let stats = h.hooks.last_stats.lock().unwrap().clone().unwrap();
        assert_eq!(stats.reason, CompletionReason::WinConditionMet);
        assert!(stats.full_card);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_resumes_from_recovery_snapshot() {
        let h = Harness::new(5, WinPolicy::Line);
        {
            let mut engine = h.engine().await;
            mark_row(&mut engine, 2);
            // Flush the debounced snapshot before the "reload".
            tokio::time::sleep(crate::recovery::SAVE_DEBOUNCE).await;
            engine.teardown();
        }

        let resumed = h.engine().await;
        assert_eq!(resumed.phase(), AttemptPhase::Won);
        assert_eq!(resumed.lines_completed, 1);
        assert!(resumed.marked().contains(&CellKey::new(2, 4)));
        assert!(resumed.score() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_regenerates_a_fresh_grid() {
        let h = Harness::new(5, WinPolicy::Line);
        {
            let mut engine = h.engine().await;
            engine.attempt_mark(CellKey::new(0, 0)).unwrap();
            tokio::time::sleep(crate::recovery::SAVE_DEBOUNCE).await;
            engine.teardown();
        }

        h.clock
            .advance_ms(crate::recovery::SNAPSHOT_TTL_MS + 5 * 60 * 1000);
        let fresh = h.engine().await;
        assert_eq!(fresh.score(), 0);
        assert_eq!(fresh.marked().len(), 1); // free cell only
    }

    #[tokio::test(start_paused = true)]
    async fn unmark_breaks_streak_but_keeps_win_latch() {
        let h = Harness::new(5, WinPolicy::Line);
        let mut engine = h.engine().await;
        mark_row(&mut engine, 2);
        assert!(engine.game_won);

        engine.unmark(CellKey::new(2, 0)).unwrap();
        assert_eq!(engine.streak, 0);
        assert_eq!(engine.lines_completed, 0);
        assert!(engine.game_won);
        assert_eq!(engine.phase(), AttemptPhase::Won);
    }

    #[tokio::test(start_paused = true)]
    async fn free_cell_unmark_is_rejected() {
        let h = Harness::new(5, WinPolicy::Line);
        let mut engine = h.engine().await;
        let before = engine.marked().clone();

        let err = engine.unmark(CellKey::new(2, 2)).unwrap_err();
        assert!(matches!(err, EngineError::Grid(_)));
        assert_eq!(engine.marked(), &before);
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_rejection_mutates_nothing_persisted() {
        let mut h = Harness::new(3, WinPolicy::Line);
        h.config.questions = vec![Question {
            prompt: "2+2?".into(),
            options: vec!["3".into(), "4".into()],
            answer: 1,
        }];
        h.config.items = (0..9)
            .map(|i| GridItem::with_question(format!("item {i}"), 0))
            .collect();
        let mut engine = h.engine().await;

        let outcome = engine.attempt_mark(CellKey::new(0, 0)).unwrap();
        assert!(matches!(outcome, MarkOutcome::Pending(_)));
        let outcome = engine.resolve_challenge(0).unwrap();
        assert_eq!(outcome, MarkOutcome::Rejected);

        assert_eq!(engine.score(), 0);
        assert!(!engine.marked().contains(&CellKey::new(0, 0)));

        // Retry after rejection can still commit.
        engine.attempt_mark(CellKey::new(0, 0)).unwrap();
        let outcome = engine.resolve_challenge(1).unwrap();
        assert!(matches!(outcome, MarkOutcome::Marked { .. }));
        assert!(engine.marked().contains(&CellKey::new(0, 0)));
    }
}
