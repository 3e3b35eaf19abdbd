//! Time budgets, delays and parallelism of a tournament run.
//!
//! # Overview
//!
//! The main entry point is [`LimitsBuilder`], which uses a builder pattern to configure:
//!
//! - **Board budgets**: per board size, the per-player thinking time enforced by the game
//!   server itself, and the external watchdog enforced by the orchestrator. The watchdog
//!   must be strictly larger than the thinking time so the server can time a player out on
//!   its own and flush its final score record before being torn down.
//! - **Tiebreak budgets**: tighter budgets for the two tiebreak battles.
//! - **Delays**: settle, connect, polling and teardown waits of a game (see [`Delays`]).
//! - **Parallelism**: maximum concurrent matches and the first port handed out.
//!
//! Budgets are plain values handed to every game explicitly. Nothing here is mutated while
//! matches are running, so a tiebreak budget can never leak into a concurrent match.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use ai_knockout::limits::{BoardSize, LimitsBuilder};
//!
//! let limits = LimitsBuilder::new()
//!     .with_board_limits(BoardSize::Small, Duration::from_secs(120), Duration::from_secs(300))
//!     .with_max_parallel(8)
//!     .with_base_port(9600)
//!     .build()
//!     .unwrap();
//! assert_eq!(limits.max_parallel(), 8);
//! ```
//!
//! Limits can also be read from environment variables with [`LimitsBuilder::from_env()`].

use std::{collections::HashMap, env, fmt::Display, str::FromStr, time::Duration};

use anyhow::{bail, Context};

use crate::tiebreak::TiebreakStage;

/// Board size understood by the game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BoardSize {
    Small,
    Medium,
    Large,
}

impl BoardSize {
    pub const ALL: [BoardSize; 3] = [BoardSize::Small, BoardSize::Medium, BoardSize::Large];

    pub fn as_str(self) -> &'static str {
        match self {
            BoardSize::Small => "small",
            BoardSize::Medium => "medium",
            BoardSize::Large => "large",
        }
    }

    fn default_limits(self) -> BoardLimits {
        let (thinking, watchdog) = match self {
            BoardSize::Small => (120, 300),
            BoardSize::Medium => (240, 600),
            BoardSize::Large => (360, 900),
        };
        BoardLimits::new(Duration::from_secs(thinking), Duration::from_secs(watchdog))
    }
}

impl Display for BoardSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoardSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(BoardSize::Small),
            "medium" => Ok(BoardSize::Medium),
            "large" => Ok(BoardSize::Large),
            other => bail!("unknown board size '{other}'"),
        }
    }
}

/// Budget of one game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardLimits {
    /// Per-player thinking time, enforced by the game server.
    pub thinking_time: Duration,
    /// Wall-clock bound on the whole game, enforced by the orchestrator.
    pub watchdog: Duration,
}

impl BoardLimits {
    pub fn new(thinking_time: Duration, watchdog: Duration) -> BoardLimits {
        BoardLimits {
            thinking_time,
            watchdog,
        }
    }
}

/// Fixed waits of the game lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delays {
    /// Wait after launching the server before checking it is still alive.
    pub server_settle: Duration,
    /// Wait between launching the first and the second player.
    pub player_stagger: Duration,
    /// Upper bound on waiting for the "connected" marker.
    pub connect_timeout: Duration,
    pub connect_poll: Duration,
    pub watchdog_poll: Duration,
    /// Wait after the server exited on its own, so its last log lines land.
    pub exit_grace: Duration,
    /// Wait after the watchdog expired, giving the server a last chance to write scores.
    pub expiry_grace: Duration,
    /// Graceful termination wait before force-killing.
    pub terminate_wait: Duration,
    pub kill_wait: Duration,
    /// Wait after teardown before the next game may start.
    pub port_settle: Duration,
    /// Pause between two consecutive games of the same match.
    pub between_games: Duration,
}

impl Default for Delays {
    fn default() -> Self {
        Delays {
            server_settle: Duration::from_secs(2),
            player_stagger: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            connect_poll: Duration::from_millis(500),
            watchdog_poll: Duration::from_secs(2),
            exit_grace: Duration::from_secs(2),
            expiry_grace: Duration::from_secs(5),
            terminate_wait: Duration::from_secs(5),
            kill_wait: Duration::from_secs(2),
            port_settle: Duration::from_secs(4),
            between_games: Duration::from_secs(5),
        }
    }
}

/// A builder for the time budgets and parallelism of a run.
///
/// Unset values fall back to the defaults of the game: small 120s/300s, medium 240s/600s,
/// large 360s/900s, tiebreak battles 60s/150s and 30s/90s, base port 9600, one match per
/// physical CPU (at most 16), no outer round budget.
#[derive(Debug, Default)]
pub struct LimitsBuilder {
    boards: HashMap<BoardSize, BoardLimits>,
    tiebreak: [Option<BoardLimits>; 2],
    delays: Option<Delays>,
    max_parallel: Option<usize>,
    base_port: Option<u16>,
    round_budget: Option<Duration>,
}

impl LimitsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `ARENA_THINKING_SECS_SMALL|MEDIUM|LARGE` (u64): per-player thinking time
    /// - `ARENA_WATCHDOG_SECS_SMALL|MEDIUM|LARGE` (u64): external watchdog
    /// - `ARENA_MAX_PARALLEL` (usize): concurrent matches
    /// - `ARENA_BASE_PORT` (u16): first port handed out
    /// - `ARENA_ROUND_BUDGET_SECS` (u64): outer budget of one round
    ///
    /// # Errors
    /// Fails when a variable is set but cannot be parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|var| env::var(var).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let parse = |var: &str| -> anyhow::Result<Option<u64>> {
            lookup(var)
                .map(|value| value.trim().parse().with_context(|| format!("invalid {var}: '{value}'")))
                .transpose()
        };

        let mut builder = LimitsBuilder::new();
        for board in BoardSize::ALL {
            let suffix = board.as_str().to_ascii_uppercase();
            let thinking = parse(&format!("ARENA_THINKING_SECS_{suffix}"))?;
            let watchdog = parse(&format!("ARENA_WATCHDOG_SECS_{suffix}"))?;
            if thinking.is_none() && watchdog.is_none() {
                continue;
            }
            let defaults = board.default_limits();
            builder.boards.insert(
                board,
                BoardLimits::new(
                    thinking.map_or(defaults.thinking_time, Duration::from_secs),
                    watchdog.map_or(defaults.watchdog, Duration::from_secs),
                ),
            );
        }
        builder.max_parallel = parse("ARENA_MAX_PARALLEL")?
            .map(usize::try_from)
            .transpose()
            .context("invalid ARENA_MAX_PARALLEL")?;
        builder.base_port = parse("ARENA_BASE_PORT")?
            .map(u16::try_from)
            .transpose()
            .context("invalid ARENA_BASE_PORT")?;
        builder.round_budget = parse("ARENA_ROUND_BUDGET_SECS")?.map(Duration::from_secs);
        Ok(builder)
    }

    #[must_use]
    pub fn with_board_limits(mut self, board: BoardSize, thinking: Duration, watchdog: Duration) -> Self {
        self.boards.insert(board, BoardLimits::new(thinking, watchdog));
        self
    }

    /// Budget of a tiebreak battle. `stage` must be [`TiebreakStage::Battle1`] or
    /// [`TiebreakStage::Battle2`]; other stages play no game and are ignored.
    #[must_use]
    pub fn with_tiebreak_limits(mut self, stage: TiebreakStage, thinking: Duration, watchdog: Duration) -> Self {
        if let Some(index) = stage.battle_index() {
            self.tiebreak[index] = Some(BoardLimits::new(thinking, watchdog));
        }
        self
    }

    #[must_use]
    pub fn with_delays(self, delays: Delays) -> Self {
        Self {
            delays: Some(delays),
            ..self
        }
    }

    #[must_use]
    pub fn with_max_parallel(self, max: usize) -> Self {
        Self {
            max_parallel: Some(max),
            ..self
        }
    }

    #[must_use]
    pub fn with_base_port(self, port: u16) -> Self {
        Self {
            base_port: Some(port),
            ..self
        }
    }

    /// Outer wall-clock budget of one round. Matches still running when it expires are
    /// abandoned and resolved by seed.
    #[must_use]
    pub fn with_round_budget(self, budget: Duration) -> Self {
        Self {
            round_budget: Some(budget),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed [`Limits`].
    ///
    /// # Errors
    ///
    /// Returns an error when a watchdog is not strictly larger than its thinking time, when
    /// no match may run in parallel, or when the base port is zero.
    pub fn build(self) -> anyhow::Result<Limits> {
        let boards = BoardSize::ALL
            .into_iter()
            .map(|board| {
                let limits = self
                    .boards
                    .get(&board)
                    .copied()
                    .unwrap_or_else(|| board.default_limits());
                (board, limits)
            })
            .collect::<HashMap<_, _>>();

        let tiebreak = [
            self.tiebreak[0]
                .unwrap_or(BoardLimits::new(Duration::from_secs(60), Duration::from_secs(150))),
            self.tiebreak[1]
                .unwrap_or(BoardLimits::new(Duration::from_secs(30), Duration::from_secs(90))),
        ];

        for (name, limits) in boards
            .iter()
            .map(|(board, limits)| (board.to_string(), limits))
            .chain(tiebreak.iter().enumerate().map(|(i, l)| (format!("tiebreaker {}", i + 1), l)))
        {
            if limits.watchdog <= limits.thinking_time {
                bail!(
                    "{name}: watchdog ({:?}) must be larger than the thinking time ({:?})",
                    limits.watchdog,
                    limits.thinking_time
                );
            }
        }

        let max_parallel = self
            .max_parallel
            .unwrap_or_else(|| num_cpus::get_physical().clamp(1, 16));
        if max_parallel == 0 {
            bail!("at least one match must be allowed to run");
        }

        let base_port = self.base_port.unwrap_or(9600);
        if base_port == 0 {
            bail!("base port must not be 0");
        }

        Ok(Limits {
            boards,
            tiebreak,
            delays: self.delays.unwrap_or_default(),
            max_parallel,
            base_port,
            round_budget: self.round_budget,
        })
    }
}

/// Obtained using [`LimitsBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    boards: HashMap<BoardSize, BoardLimits>,
    tiebreak: [BoardLimits; 2],
    delays: Delays,
    max_parallel: usize,
    base_port: u16,
    round_budget: Option<Duration>,
}

impl Limits {
    pub fn builder() -> LimitsBuilder {
        LimitsBuilder::new()
    }

    /// Budget of a regular game on `board`.
    pub fn for_board(&self, board: BoardSize) -> BoardLimits {
        self.boards
            .get(&board)
            .copied()
            .unwrap_or_else(|| board.default_limits())
    }

    /// Budget of a game played during `stage`.
    pub fn for_stage(&self, stage: TiebreakStage, board: BoardSize) -> BoardLimits {
        match stage.battle_index() {
            Some(index) => self.tiebreak[index],
            None => self.for_board(board),
        }
    }

    pub fn delays(&self) -> &Delays {
        &self.delays
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn round_budget(&self) -> Option<Duration> {
        self.round_budget
    }
}

/// Parses a comma-separated list of board sizes (`"small,large"`).
pub fn parse_board_list(s: &str) -> anyhow::Result<Vec<BoardSize>> {
    let boards = s
        .split(',')
        .filter(|item| !item.trim().is_empty())
        .map(|item| item.parse::<BoardSize>())
        .collect::<anyhow::Result<Vec<_>>>()
        .with_context(|| format!("invalid board list '{s}'"))?;
    if boards.is_empty() {
        bail!("board list is empty");
    }
    Ok(boards)
}
