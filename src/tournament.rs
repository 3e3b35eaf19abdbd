//! Top-level orchestration of an elimination tournament.
//!
//! This module defines [`Tournament`], which drives a seeded bracket from the seed table
//! to its champion:
//!
//! - loading the seed table and checking the file system layout
//! - building each round from the previous one with [`SingleElimination`]
//! - running the matches of a round in parallel with a [`RoundScheduler`]
//! - persisting every result as soon as it is known with a [`ResultsStore`]
//!
//! Rounds are never pipelined: a round is completely resolved before the next one is paired.
//!
//! # Example
//!
//! ```no_run
//! use ai_knockout::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let setup = ArenaSetupBuilder::new()
//!         .with_seeds_file("elimination_seeds.csv")
//!         .with_players_dir("submissions")
//!         .with_reference_dir("reference")
//!         .with_output_dir("elimination")
//!         .build()?;
//!     let limits = LimitsBuilder::new().with_max_parallel(8).build()?;
//!     let config = Configuration::new().with_allow_uncontained(true);
//!
//!     let run = Tournament::new(setup, limits, config)?.run()?;
//!     println!("champion: {}", run.champion);
//!     Ok(())
//! }
//! ```

use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use tracing::{info, instrument, trace};

use crate::{
    bracket::{Match, SingleElimination},
    configuration::Configuration,
    director::MatchDirector,
    limits::Limits,
    logger::init_logger,
    participant::Participant,
    port_allocator::PortAllocator,
    process_group::check_containment,
    results_store::{standings, ResultsStore, Standing},
    scheduler::{MatchRunner, RoundEvent, RoundScheduler},
    seeds::load_seeds,
    setup::ArenaSetup,
    tiebreak::MatchResult,
};

/// Resolved matches of one round, in bracket order.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub name: String,
    pub results: Vec<MatchResult>,
}

/// A finished run.
#[derive(Debug, Clone)]
pub struct TournamentRun {
    pub rounds: Vec<RoundRecord>,
    pub champion: Arc<Participant>,
}

impl TournamentRun {
    pub fn standings(&self) -> Vec<Standing> {
        standings(&self.rounds)
    }
}

pub struct Tournament {
    setup: ArenaSetup,
    limits: Limits,
    config: Configuration,
    store: ResultsStore,
}

impl Tournament {
    /// # Errors
    /// Fails when logging is enabled and the log file cannot be created.
    #[instrument(skip_all)]
    pub fn new(setup: ArenaSetup, limits: Limits, config: Configuration) -> anyhow::Result<Self> {
        if config.log {
            std::fs::create_dir_all(setup.output_dir())?;
            init_logger(setup.output_dir())?;
        }
        trace!(?setup, ?limits, ?config);

        let store = ResultsStore::new(&setup);
        Ok(Tournament {
            setup,
            limits,
            config,
            store,
        })
    }

    pub fn store(&self) -> &ResultsStore {
        &self.store
    }

    /// Runs the whole bracket with real processes.
    ///
    /// # Errors
    /// Fails on configuration problems (seed table, directories, process containment) and
    /// on run-aborting match errors such as port exhaustion.
    pub fn run(&self) -> anyhow::Result<TournamentRun> {
        let seeds = load_seeds(self.setup.seeds_file())?;
        self.setup.check()?;
        check_containment(&self.config)?;

        if self.config.verbose {
            Self::setup_panic_hook();
            disable_line_wrap();
        }
        let ports = Arc::new(PortAllocator::new(self.limits.base_port()));
        let director = Arc::new(MatchDirector::new(
            self.setup.clone(),
            self.limits.clone(),
            self.config,
            ports,
        ));
        let run = self.run_with(&seeds, director);
        if self.config.verbose {
            enable_line_wrap();
        }
        run
    }

    /// Runs the whole bracket, every match going through `runner`.
    ///
    /// # Errors
    /// Fails when the seed count is not a power of two, when `runner` reports a
    /// run-aborting error, or when results cannot be written.
    pub fn run_with<R: MatchRunner + 'static>(
        &self,
        seeds: &[Arc<Participant>],
        runner: Arc<R>,
    ) -> anyhow::Result<TournamentRun> {
        std::fs::create_dir_all(self.setup.matches_dir())?;
        let scheduler = RoundScheduler::new(self.limits.max_parallel(), self.limits.round_budget());
        let mut bracket = SingleElimination::new(self.setup.boards());
        let mut matches = bracket.start(seeds)?;
        let mut rounds = vec![];

        while !matches.is_empty() {
            let name = matches[0].round.clone();
            info!(matches = matches.len(), "{name} starting");
            if self.config.verbose {
                println!(
                    "\n\x1b[1m{name}\x1b[0m: {} matches, {} at a time",
                    matches.len(),
                    self.limits.max_parallel()
                );
            }

            let results = self.run_round(&scheduler, matches, runner.clone())?;
            matches = bracket.advance(&results)?;
            rounds.push(RoundRecord { name, results });
        }

        let champion = bracket
            .champion()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("bracket ended without a champion"))?;
        info!("champion: {champion}");
        if self.config.verbose {
            println!("\n\x1b[32mCHAMPION\x1b[39m {champion} ({})", champion.group);
        }

        let run = TournamentRun { rounds, champion };
        self.store.write_champion(&run.champion)?;
        self.store.write_standings(&run.standings())?;
        Ok(run)
    }

    fn run_round<R: MatchRunner + 'static>(
        &self,
        scheduler: &RoundScheduler,
        matches: Vec<Match>,
        runner: Arc<R>,
    ) -> anyhow::Result<Vec<MatchResult>> {
        let running = Mutex::new(vec![]);
        let mut persist_error = None;

        let results = scheduler.run(matches, runner, |event| match event {
            RoundEvent::Started(m) => {
                let mut guard = running.lock().expect("poisoned");
                guard.push(m.clone());
                if self.config.verbose {
                    print_running_matches(&guard);
                }
            }
            RoundEvent::Finished(result) => {
                let mut guard = running.lock().expect("poisoned");
                guard.retain(|m| *m != result.pairing);
                if self.config.verbose {
                    print_match_result(result);
                    print_running_matches(&guard);
                }
                drop(guard);

                let persisted = self
                    .store
                    .append(result)
                    .and_then(|()| self.store.write_match_summary(result).map(|_| ()));
                if let (Err(e), None) = (persisted, &persist_error) {
                    persist_error = Some(e);
                }
            }
        })?;

        match persist_error {
            Some(e) => Err(e.context("could not persist results")),
            None => Ok(results),
        }
    }

    /// Restores line wrapping before the default hook prints the panic.
    fn setup_panic_hook() {
        let orig_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            enable_line_wrap();
            orig_hook(panic_info);
        }));
    }
}

fn print_match_result(result: &MatchResult) {
    let anomalies = result.all_errors().count();
    let via = match result.tiebreak() {
        Some(stage) => format!(" via {}", stage.label()),
        None => String::new(),
    };
    // clear line, green match, winner, red anomalies, start of line
    println!(
        "\x1b[2K\x1b[32m{}: \x1b[39m{}{via} \x1b[31m{}\x1b[39m\x1b[0G",
        result.pairing,
        result.winner,
        if anomalies > 0 {
            format!("({anomalies} anomalies)")
        } else {
            String::new()
        }
    );
}

fn print_running_matches(running: &[Match]) {
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(Match::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::stdout().flush();
}

fn disable_line_wrap() {
    print!("\x1b[?7l");
}

fn enable_line_wrap() {
    print!("\x1b[?7h");
}
