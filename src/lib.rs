//! # Ai Knockout
//!
//! Seeded single-elimination tournaments between external game-playing programs.
//!
//! It provides:
//! - A bracket built from a seed table, where seed `i` meets seed `N + 1 - i` (`SingleElimination`)
//! - Parallel execution of the matches of a round with a concurrency cap and an optional
//!   round budget (`RoundScheduler`)
//! - One game server and two player processes per game, supervised through an explicit
//!   lifecycle and torn down as a whole process tree (`MatchDirector`, `ProcessGroup`)
//! - Tiebreak escalation when a match ends level: two tiebreaker battles, then the better
//!   seed (`TiebreakEscalator`)
//! - Game outcomes recovered from the logs the programs write (`ResultExtractor`)
//! - Results appended to a CSV file as soon as each match is decided (`ResultsStore`)
//!
//! Game programs are black boxes: the server receives a port and a board size, each player
//! receives its submission directory, the port, the board size and its role. Nothing is read
//! back from them except their logs.
//!
//! # Documentation Overview
//!
//! - For the whole run, see [`Tournament`](crate::tournament::Tournament).
//! - For file layout and external commands, see [`ArenaSetup`](crate::setup::ArenaSetup).
//! - For time limits, delays and parallelism, see [`Limits`](crate::limits::Limits).
//! - For logging and process containment, see [`Configuration`](crate::configuration::Configuration).
//! - For the game lifecycle, see the [`director`] module.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::time::Duration;
//! use ai_knockout::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let setup = ArenaSetupBuilder::new()
//!         .with_seeds_file("elimination_seeds.csv")
//!         .with_players_dir("submissions")
//!         .with_reference_dir("reference")
//!         .with_output_dir("elimination")
//!         .with_boards(&[BoardSize::Small, BoardSize::Medium])
//!         .build()?;
//!
//!     let limits = LimitsBuilder::new()
//!         .with_max_parallel(4)
//!         .with_round_budget(Duration::from_secs(3600))
//!         .build()?;
//!
//!     // Run without cgroups if cgroup v2 is not available
//!     let config = Configuration::new().with_allow_uncontained(true);
//!
//!     let run = Tournament::new(setup, limits, config)?.run()?;
//!     for standing in run.standings() {
//!         println!("{}. {} ({})", standing.place, standing.player, standing.eliminated_in);
//!     }
//!     Ok(())
//! }
//! ```

pub use anyhow;

pub mod bracket;
pub mod configuration;
pub mod director;
pub mod error;
pub mod limits;
mod logger;
pub mod participant;
pub mod poll;
pub mod port_allocator;
pub mod process_group;
pub mod result_extractor;
pub mod results_store;
pub mod sandbox;
pub mod scheduler;
pub mod seeds;
pub mod setup;
pub mod tiebreak;
pub mod tournament;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use ai_knockout::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bracket::{Match, SingleElimination};
    pub use crate::configuration::Configuration;
    pub use crate::error::MatchError;
    pub use crate::limits::{BoardLimits, BoardSize, Delays, Limits, LimitsBuilder};
    pub use crate::participant::{Participant, Role, Slot};
    pub use crate::scheduler::{MatchRunner, RoundScheduler};
    pub use crate::setup::{ArenaSetup, ArenaSetupBuilder, CommandLine, GameFormat};
    pub use crate::tiebreak::{MatchResult, TiebreakStage};
    pub use crate::tournament::{Tournament, TournamentRun};
}
