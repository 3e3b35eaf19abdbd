//! Match resolution and tie escalation.
//!
//! A match first plays its regular games (every board of the match, one or two games per
//! board depending on the [`GameFormat`]). The participant with more won games wins. On
//! equal win counts the match escalates:
//!
//! ```text
//! Normal -> Battle1 -> Battle2 -> SeedFallback
//! ```
//!
//! Each battle is two role-swapped games on the tiebreak board, under the stage's own
//! (tighter) budget from [`Limits::for_stage`]. Scores are recorded but never decide a
//! stage. `SeedFallback` plays nothing: the better seed wins. A match therefore never plays
//! more than four extra games.

use std::{fmt::Display, sync::Arc, thread, time::Duration};

use tracing::{info, instrument, warn};

use crate::{
    bracket::Match,
    error::MatchError,
    limits::{BoardLimits, BoardSize, Limits},
    participant::{Participant, Role, Slot},
    poll::CancelToken,
    result_extractor::{GameOutcome, Winner},
    setup::GameFormat,
};

/// Where a match was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TiebreakStage {
    Normal,
    Battle1,
    Battle2,
    SeedFallback,
}

impl TiebreakStage {
    /// Index of the battle in the tiebreak budget table, `None` for stages without games
    /// of their own budget.
    pub fn battle_index(self) -> Option<usize> {
        match self {
            TiebreakStage::Battle1 => Some(0),
            TiebreakStage::Battle2 => Some(1),
            TiebreakStage::Normal | TiebreakStage::SeedFallback => None,
        }
    }

    /// Stage entered when this one ends on a tie. `SeedFallback` is final.
    pub fn escalate(self) -> TiebreakStage {
        match self {
            TiebreakStage::Normal => TiebreakStage::Battle1,
            TiebreakStage::Battle1 => TiebreakStage::Battle2,
            TiebreakStage::Battle2 | TiebreakStage::SeedFallback => TiebreakStage::SeedFallback,
        }
    }

    /// Label written to the results table.
    pub fn label(self) -> &'static str {
        match self {
            TiebreakStage::Normal => "",
            TiebreakStage::Battle1 => "tiebreaker_battle_1",
            TiebreakStage::Battle2 => "tiebreaker_battle_2",
            TiebreakStage::SeedFallback => "group_stage_seed",
        }
    }
}

impl Display for TiebreakStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TiebreakStage::Normal => f.write_str("regular games"),
            other => f.write_str(other.label()),
        }
    }
}

/// Everything a single game needs to know, fixed before it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct GamePlan {
    pub stage: TiebreakStage,
    pub board: BoardSize,
    /// One-based, within the board (regular games) or the battle.
    pub number: usize,
    /// Slot playing circle.
    pub circle: Slot,
    pub limits: BoardLimits,
}

impl GamePlan {
    /// `small_game1`, `tiebreaker2_game1`, ...
    pub fn log_prefix(&self) -> String {
        match self.stage.battle_index() {
            Some(index) => format!("tiebreaker{}_game{}", index + 1, self.number),
            None => format!("{}_game{}", self.board, self.number),
        }
    }

    pub fn role_of(&self, slot: Slot) -> Role {
        if slot == self.circle {
            Role::Circle
        } else {
            Role::Square
        }
    }

    pub fn slot_of(&self, role: Role) -> Slot {
        match role {
            Role::Circle => self.circle,
            Role::Square => self.circle.other(),
        }
    }
}

/// A played game: its plan, the extracted outcome and the anomalies met on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub plan: GamePlan,
    pub outcome: GameOutcome,
    pub errors: Vec<MatchError>,
}

impl GameRecord {
    pub fn new(plan: GamePlan, outcome: GameOutcome) -> GameRecord {
        GameRecord {
            plan,
            outcome,
            errors: vec![],
        }
    }

    /// Slot that won, `None` on draws and undecided games.
    pub fn winner_slot(&self) -> Option<Slot> {
        match self.outcome.winner? {
            Winner::Role(role) => Some(self.plan.slot_of(role)),
            Winner::Draw => None,
        }
    }

    pub fn score(&self, slot: Slot) -> Option<f64> {
        self.outcome.score(self.plan.role_of(slot))
    }
}

/// Plays one game of a match. Implemented by the director, and by scripted players in
/// tests.
pub trait GamePlayer {
    /// # Errors
    /// Only for conditions that must abort the whole run (e.g. no port left). Anything
    /// that goes wrong with the game itself belongs in the returned record.
    ///
    /// Once `cancel` is set the game should be torn down without waiting for its watchdog.
    fn play(&self, m: &Match, plan: &GamePlan, cancel: &CancelToken) -> anyhow::Result<GameRecord>;
}

/// The games played during one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRecord {
    pub stage: TiebreakStage,
    pub games: Vec<GameRecord>,
}

impl StageRecord {
    pub fn wins(&self, slot: Slot) -> u32 {
        self.games
            .iter()
            .filter(|g| g.winner_slot() == Some(slot))
            .count() as u32
    }

    /// Sum of the known scores of `slot`. Unknown scores add nothing.
    pub fn score(&self, slot: Slot) -> f64 {
        self.games.iter().filter_map(|g| g.score(slot)).sum()
    }

    /// Total score of `slot` on one board.
    pub fn board_score(&self, board: BoardSize, slot: Slot) -> f64 {
        self.games
            .iter()
            .filter(|g| g.plan.board == board)
            .filter_map(|g| g.score(slot))
            .sum()
    }

    /// Slot with strictly more wins.
    pub fn leader(&self) -> Option<Slot> {
        let (first, second) = (self.wins(Slot::First), self.wins(Slot::Second));
        match first.cmp(&second) {
            std::cmp::Ordering::Greater => Some(Slot::First),
            std::cmp::Ordering::Less => Some(Slot::Second),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Resolved match. `winner` is always one of the two participants of `pairing`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub pairing: Match,
    /// Played stages, regular games first.
    pub stages: Vec<StageRecord>,
    /// Stage that produced the winner.
    pub decided_by: TiebreakStage,
    pub winner: Arc<Participant>,
    /// Match-level anomalies (staging, round budget). Game anomalies live in the games.
    pub errors: Vec<MatchError>,
}

impl MatchResult {
    /// A result decided without (further) games.
    pub fn decided(pairing: Match, slot: Slot, decided_by: TiebreakStage) -> MatchResult {
        let winner = pairing.participant(slot).clone();
        MatchResult {
            pairing,
            stages: vec![],
            decided_by,
            winner,
            errors: vec![],
        }
    }

    /// The better seed wins. Used when nothing else can decide the match.
    pub fn seed_fallback(pairing: Match, errors: Vec<MatchError>) -> MatchResult {
        let slot = better_seed_slot(&pairing);
        MatchResult {
            errors,
            ..MatchResult::decided(pairing, slot, TiebreakStage::SeedFallback)
        }
    }

    pub fn winner_slot(&self) -> Slot {
        if *self.pairing.first == *self.winner {
            Slot::First
        } else {
            Slot::Second
        }
    }

    pub fn loser(&self) -> &Arc<Participant> {
        self.pairing.participant(self.winner_slot().other())
    }

    /// Tiebreak stage used, `None` when the regular games decided.
    pub fn tiebreak(&self) -> Option<TiebreakStage> {
        (self.decided_by != TiebreakStage::Normal).then_some(self.decided_by)
    }

    pub fn stage(&self, stage: TiebreakStage) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn games(&self) -> impl Iterator<Item = &GameRecord> {
        self.stages.iter().flat_map(|s| s.games.iter())
    }

    /// Wins of `slot` in the regular games.
    pub fn wins(&self, slot: Slot) -> u32 {
        self.stage(TiebreakStage::Normal).map_or(0, |s| s.wins(slot))
    }

    /// Known score of `slot` summed over the regular games.
    pub fn total_score(&self, slot: Slot) -> f64 {
        self.stage(TiebreakStage::Normal).map_or(0.0, |s| s.score(slot))
    }

    /// Match and game anomalies, in order of occurrence.
    pub fn all_errors(&self) -> impl Iterator<Item = &MatchError> {
        self.errors
            .iter()
            .chain(self.games().flat_map(|g| g.errors.iter()))
    }
}

fn better_seed_slot(m: &Match) -> Slot {
    if m.first.better_seeded(&m.second) == &m.first {
        Slot::First
    } else {
        Slot::Second
    }
}

/// Plays a match through its stages until someone wins.
#[derive(Debug)]
pub struct TiebreakEscalator<'a, P> {
    player: &'a P,
    limits: &'a Limits,
    format: GameFormat,
    tiebreak_board: BoardSize,
}

impl<'a, P: GamePlayer> TiebreakEscalator<'a, P> {
    pub fn new(
        player: &'a P,
        limits: &'a Limits,
        format: GameFormat,
        tiebreak_board: BoardSize,
    ) -> Self {
        Self {
            player,
            limits,
            format,
            tiebreak_board,
        }
    }

    /// Games of `stage`, in playing order. Empty for `SeedFallback`.
    pub fn plans(&self, m: &Match, stage: TiebreakStage) -> Vec<GamePlan> {
        let plan = |board, number, circle| GamePlan {
            stage,
            board,
            number,
            circle,
            limits: self.limits.for_stage(stage, board),
        };
        match stage {
            TiebreakStage::Normal => m
                .boards
                .iter()
                .flat_map(|&board| match self.format {
                    GameFormat::RoleSwap => {
                        vec![plan(board, 1, Slot::First), plan(board, 2, Slot::Second)]
                    }
                    GameFormat::Single => vec![plan(board, 1, Slot::First)],
                })
                .collect(),
            TiebreakStage::Battle1 | TiebreakStage::Battle2 => vec![
                plan(self.tiebreak_board, 1, Slot::First),
                plan(self.tiebreak_board, 2, Slot::Second),
            ],
            TiebreakStage::SeedFallback => vec![],
        }
    }

    /// Once `cancel` is set no further game starts and the better seed advances.
    ///
    /// # Errors
    /// Only when the game player reports a run-aborting error.
    #[instrument(skip_all, fields(pairing = %m))]
    pub fn resolve(&self, m: &Match, cancel: &CancelToken) -> anyhow::Result<MatchResult> {
        let mut stages = vec![];
        let mut games_played = 0;
        let mut stage = TiebreakStage::Normal;

        let slot = 'stages: loop {
            if stage == TiebreakStage::SeedFallback {
                warn!("still tied after both tiebreak battles, better seed advances");
                break better_seed_slot(m);
            }

            let mut record = StageRecord {
                stage,
                games: vec![],
            };
            for plan in self.plans(m, stage) {
                if games_played > 0 {
                    self.pause(self.limits.delays().between_games);
                }
                if cancel.is_cancelled() {
                    warn!("cancelled during {stage}, better seed advances");
                    if !record.games.is_empty() {
                        stages.push(record);
                    }
                    stage = TiebreakStage::SeedFallback;
                    break 'stages better_seed_slot(m);
                }
                record.games.push(self.player.play(m, &plan, cancel)?);
                games_played += 1;
            }

            let leader = record.leader();
            info!(
                "{stage}: {} {}W ({:.2}) vs {} {}W ({:.2})",
                m.first,
                record.wins(Slot::First),
                record.score(Slot::First),
                m.second,
                record.wins(Slot::Second),
                record.score(Slot::Second),
            );
            stages.push(record);
            match leader {
                Some(slot) => break slot,
                None => stage = stage.escalate(),
            }
        };

        Ok(MatchResult {
            stages,
            decided_by: stage,
            ..MatchResult::decided(m.clone(), slot, stage)
        })
    }

    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{limits::Delays, result_extractor::TerminationReason};

    /// Plays games from a script of circle-relative winners.
    struct ScriptedPlayer {
        script: Mutex<Vec<Option<Winner>>>,
        played: Mutex<Vec<GamePlan>>,
        /// Cancels the match once this many games were played.
        cancel_after: Option<usize>,
    }

    impl ScriptedPlayer {
        fn new(script: &[Option<Winner>]) -> Self {
            let mut script = script.to_vec();
            script.reverse();
            Self {
                script: Mutex::new(script),
                played: Mutex::new(vec![]),
                cancel_after: None,
            }
        }
    }

    impl GamePlayer for ScriptedPlayer {
        fn play(
            &self,
            _m: &Match,
            plan: &GamePlan,
            cancel: &CancelToken,
        ) -> anyhow::Result<GameRecord> {
            self.played.lock().expect("poisoned").push(plan.clone());
            if self.cancel_after == Some(self.played.lock().expect("poisoned").len()) {
                cancel.cancel();
            }
            let winner = self.script.lock().expect("poisoned").pop().flatten();
            let outcome = GameOutcome {
                winner,
                circle_score: Some(10.0),
                square_score: Some(10.0),
                reason: if winner.is_some() {
                    TerminationReason::Normal
                } else {
                    TerminationReason::Unknown
                },
                detail: None,
            };
            Ok(GameRecord::new(plan.clone(), outcome))
        }
    }

    const CIRCLE: Option<Winner> = Some(Winner::Role(Role::Circle));
    const SQUARE: Option<Winner> = Some(Winner::Role(Role::Square));
    const DRAW: Option<Winner> = Some(Winner::Draw);

    fn limits() -> Limits {
        let no_delays = Delays {
            between_games: Duration::ZERO,
            ..Delays::default()
        };
        Limits::builder().with_delays(no_delays).build().unwrap()
    }

    fn pairing(first_seed: u32, second_seed: u32) -> Match {
        Match {
            round: "Final".to_string(),
            number: 1,
            first: Arc::new(Participant::new("A", "Group_A", first_seed)),
            second: Arc::new(Participant::new("B", "Group_B", second_seed)),
            boards: vec![BoardSize::Small],
        }
    }

    fn resolve(player: &ScriptedPlayer, m: &Match) -> MatchResult {
        let limits = limits();
        TiebreakEscalator::new(player, &limits, GameFormat::RoleSwap, BoardSize::Small)
            .resolve(m, &CancelToken::new())
            .unwrap()
    }

    #[test]
    fn regular_games_decide() {
        // game 1: first plays circle and wins, game 2: first plays square and wins
        let player = ScriptedPlayer::new(&[CIRCLE, SQUARE]);
        let result = resolve(&player, &pairing(1, 2));
        assert_eq!(result.winner.name, "A");
        assert_eq!(result.tiebreak(), None);
        assert_eq!(result.wins(Slot::First), 2);
        assert_eq!(result.total_score(Slot::First), 20.0);
        assert_eq!(player.played.lock().unwrap().len(), 2);
    }

    #[test]
    fn role_swap_maps_roles_to_slots() {
        // circle wins both games: one win each, then battle 1 goes to the second slot
        let player = ScriptedPlayer::new(&[CIRCLE, CIRCLE, SQUARE, DRAW]);
        let result = resolve(&player, &pairing(1, 2));
        assert_eq!(result.decided_by, TiebreakStage::Battle1);
        assert_eq!(result.winner.name, "B");
        assert_eq!(result.loser().name, "A");

        let played = player.played.lock().unwrap();
        let prefixes = played.iter().map(GamePlan::log_prefix).collect::<Vec<_>>();
        assert_eq!(
            prefixes,
            ["small_game1", "small_game2", "tiebreaker1_game1", "tiebreaker1_game2"]
        );
        assert_eq!(played[0].circle, Slot::First);
        assert_eq!(played[1].circle, Slot::Second);
        assert_eq!(played[2].limits, limits().for_stage(TiebreakStage::Battle1, BoardSize::Small));
    }

    #[test]
    fn battle_two_decides() {
        let player = ScriptedPlayer::new(&[DRAW, DRAW, CIRCLE, CIRCLE, None, CIRCLE]);
        let result = resolve(&player, &pairing(3, 6));
        assert_eq!(result.decided_by, TiebreakStage::Battle2);
        assert_eq!(result.winner.name, "B");
        assert_eq!(result.stages.len(), 3);
        let battle2 = result.stage(TiebreakStage::Battle2).unwrap();
        assert_eq!(battle2.wins(Slot::Second), 1);
        assert_eq!(battle2.games[0].plan.limits.thinking_time, Duration::from_secs(30));
    }

    #[test]
    fn identical_results_fall_back_to_seed() {
        for (first_seed, second_seed, expected) in [(2, 7, "A"), (7, 2, "B")] {
            let player = ScriptedPlayer::new(&[DRAW; 6]);
            let result = resolve(&player, &pairing(first_seed, second_seed));
            assert_eq!(result.decided_by, TiebreakStage::SeedFallback);
            assert_eq!(result.tiebreak().unwrap().label(), "group_stage_seed");
            assert_eq!(result.winner.name, expected);
            // at most four extra games
            assert_eq!(player.played.lock().unwrap().len(), 6);
            assert_eq!(result.stages.len(), 3);
        }
    }

    #[test]
    fn undecided_games_count_for_nobody() {
        let player = ScriptedPlayer::new(&[None, None, None, None, None, None]);
        let result = resolve(&player, &pairing(5, 4));
        assert_eq!(result.decided_by, TiebreakStage::SeedFallback);
        assert_eq!(result.winner.seed, 4);
    }

    #[test]
    fn single_format_plays_one_game_per_board() {
        let limits = limits();
        let player = ScriptedPlayer::new(&[SQUARE, CIRCLE, CIRCLE, DRAW]);
        let mut m = pairing(1, 2);
        m.boards = vec![BoardSize::Small, BoardSize::Large];
        let escalator =
            TiebreakEscalator::new(&player, &limits, GameFormat::Single, BoardSize::Small);
        let plans = escalator.plans(&m, TiebreakStage::Normal);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[1].log_prefix(), "large_game1");
        assert_eq!(plans[1].limits, limits.for_board(BoardSize::Large));

        let result = escalator.resolve(&m, &CancelToken::new()).unwrap();
        // one win each, escalate to a role-swapped battle
        assert_eq!(result.decided_by, TiebreakStage::Battle1);
        assert_eq!(result.winner.name, "A");
    }

    #[test]
    fn cancelled_match_stops_between_games() {
        let player = ScriptedPlayer {
            cancel_after: Some(1),
            ..ScriptedPlayer::new(&[SQUARE, SQUARE])
        };
        let result = resolve(&player, &pairing(4, 3));
        assert_eq!(player.played.lock().unwrap().len(), 1);
        assert_eq!(result.decided_by, TiebreakStage::SeedFallback);
        assert_eq!(result.winner.seed, 3);
        assert_eq!(result.games().count(), 1);
    }

    #[test]
    fn already_cancelled_match_plays_nothing() {
        let limits = limits();
        let player = ScriptedPlayer::new(&[CIRCLE, CIRCLE]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = TiebreakEscalator::new(&player, &limits, GameFormat::RoleSwap, BoardSize::Small)
            .resolve(&pairing(1, 2), &cancel)
            .unwrap();
        assert!(player.played.lock().unwrap().is_empty());
        assert!(result.stages.is_empty());
        assert_eq!(result.winner.seed, 1);
    }

    #[test]
    fn stage_escalation_terminates() {
        let mut stage = TiebreakStage::Normal;
        for _ in 0..10 {
            stage = stage.escalate();
        }
        assert_eq!(stage, TiebreakStage::SeedFallback);
    }

    #[test]
    fn seed_fallback_result() {
        let result = MatchResult::seed_fallback(
            pairing(9, 8),
            vec![MatchError::RoundTimeout(Duration::from_secs(1))],
        );
        assert_eq!(result.winner.seed, 8);
        assert_eq!(result.winner_slot(), Slot::Second);
        assert_eq!(result.all_errors().count(), 1);
    }
}
