//! Running one match: staging, then every game through its lifecycle.
//!
//! A game goes through these phases:
//!
//! ```text
//! ServerStarting -> AwaitingConnect -> Active -> Draining -> Terminated
//! ```
//!
//! - `ServerStarting`: the server is launched on a fresh port, in the match directory, with
//!   its output redirected to `<prefix>_server.log`. After the settle delay it must still be
//!   alive, or the game ends with [`MatchError::ServerStartFailure`].
//! - `AwaitingConnect`: both players are launched, first slot first, and the server log is
//!   polled for the "connected" marker. A missing marker is recorded as
//!   [`MatchError::ConnectTimeout`] but the game still proceeds to `Active`.
//! - `Active`: the server is polled until it exits or the watchdog expires, then a grace
//!   delay lets the last log lines land. A cancelled match leaves `Active` at the next
//!   poll, without grace.
//! - `Draining`: the whole process group is terminated, then killed. The port settle delay
//!   follows.
//! - `Terminated`: the logs are handed to the [`ResultExtractor`].
//!
//! Staging happens once per match, before the first game.

use std::{
    fmt::Display,
    fs::File,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::Instant,
};

use anyhow::Context;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    bracket::Match,
    configuration::Configuration,
    error::MatchError,
    limits::Limits,
    participant::Slot,
    poll::{poll_until, CancelToken},
    port_allocator::PortAllocator,
    process_group::{MemberId, ProcessGroup},
    result_extractor::{ResultExtractor, TerminationReason},
    sandbox::{match_dir, stage_match},
    scheduler::MatchRunner,
    setup::{ArenaSetup, CommandLine},
    tiebreak::{GamePlan, GamePlayer, GameRecord, MatchResult, TiebreakEscalator, TiebreakStage},
};

/// Environment variable carrying the per-player thinking time (seconds) to the server.
pub const THINKING_TIME_ENV: &str = "ARENA_THINKING_TIME_SECS";

/// Lifecycle phase of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    Staging,
    ServerStarting,
    AwaitingConnect,
    Active,
    Draining,
    Terminated,
}

impl Display for GamePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GamePhase::Staging => "staging",
            GamePhase::ServerStarting => "server starting",
            GamePhase::AwaitingConnect => "awaiting connect",
            GamePhase::Active => "active",
            GamePhase::Draining => "draining",
            GamePhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Log files of one game.
#[derive(Debug, Clone)]
pub struct GameLogs {
    pub server: PathBuf,
    pub player1: PathBuf,
    pub player2: PathBuf,
}

impl GameLogs {
    pub fn new(dir: &Path, prefix: &str) -> GameLogs {
        GameLogs {
            server: dir.join(format!("{prefix}_server.log")),
            player1: dir.join(format!("{prefix}_player1.log")),
            player2: dir.join(format!("{prefix}_player2.log")),
        }
    }

    pub fn player(&self, slot: Slot) -> &Path {
        match slot {
            Slot::First => &self.player1,
            Slot::Second => &self.player2,
        }
    }
}

/// State of a game in flight.
struct GameRun<'a> {
    label: String,
    phase: GamePhase,
    group: ProcessGroup,
    logs: GameLogs,
    plan: &'a GamePlan,
    errors: Vec<MatchError>,
    watchdog_expired: bool,
}

impl GameRun<'_> {
    fn enter(&mut self, phase: GamePhase) {
        trace!("{}: {} -> {}", self.label, self.phase, phase);
        self.phase = phase;
    }
}

/// Runs matches between real processes.
#[derive(Debug)]
pub struct MatchDirector {
    setup: ArenaSetup,
    limits: Limits,
    config: Configuration,
    ports: Arc<PortAllocator>,
    extractor: ResultExtractor,
}

impl MatchDirector {
    pub fn new(
        setup: ArenaSetup,
        limits: Limits,
        config: Configuration,
        ports: Arc<PortAllocator>,
    ) -> Self {
        let extractor = ResultExtractor::new(setup.invalid_move_penalty);
        Self {
            setup,
            limits,
            config,
            ports,
            extractor,
        }
    }

    /// Stages the match directory, then plays games until the match is decided.
    ///
    /// When one submission cannot be staged the other participant wins without playing.
    /// When neither can, the better seed advances. Setting `cancel` stops the match after
    /// tearing down the game in flight.
    ///
    /// # Errors
    /// Fails on run-aborting conditions only: unusable output directory, missing reference
    /// assets, port exhaustion.
    #[instrument(skip_all, fields(pairing = %m))]
    pub fn play_match(&self, m: Match, cancel: &CancelToken) -> anyhow::Result<MatchResult> {
        trace!("{m}: {}", GamePhase::Staging);
        let staged = stage_match(&self.setup, &m)?;

        match staged.disqualified.len() {
            0 => TiebreakEscalator::new(
                self,
                &self.limits,
                self.setup.format,
                self.setup.tiebreak_board,
            )
            .resolve(&m, cancel),
            1 => {
                let (slot, error) = staged
                    .disqualified
                    .into_iter()
                    .next()
                    .context("disqualification vanished")?;
                info!("{} advances by forfeit", m.participant(slot.other()));
                Ok(MatchResult {
                    errors: vec![error],
                    ..MatchResult::decided(m, slot.other(), TiebreakStage::Normal)
                })
            }
            _ => {
                warn!("neither submission could be staged, better seed advances");
                let errors = staged.disqualified.into_iter().map(|(_, e)| e).collect();
                Ok(MatchResult::seed_fallback(m, errors))
            }
        }
    }

    fn command(&self, line: &CommandLine, dir: &Path, log: &Path) -> anyhow::Result<Command> {
        let stdout = File::create(log)
            .with_context(|| format!("could not create log file '{}'", log.display()))?;
        let stderr = stdout
            .try_clone()
            .with_context(|| format!("could not share log file '{}'", log.display()))?;
        let mut command = Command::new(&line.program);
        command
            .args(&line.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        Ok(command)
    }

    /// Plays one game in `dir`.
    ///
    /// # Errors
    /// Port exhaustion, failure to create the process group or the log files.
    #[instrument(skip_all, fields(game = %plan.log_prefix()))]
    pub fn run_game(
        &self,
        dir: &Path,
        m: &Match,
        plan: &GamePlan,
        cancel: &CancelToken,
    ) -> anyhow::Result<GameRecord> {
        let delays = self.limits.delays();
        let port = self.ports.allocate()?;
        let prefix = plan.log_prefix();
        let label = format!("{}_{prefix}", m.dir_name());
        info!(port, board = %plan.board, circle = %m.participant(plan.circle), "starting {prefix}");

        let mut game = GameRun {
            group: ProcessGroup::new(&label, &self.config)?,
            label,
            phase: GamePhase::ServerStarting,
            logs: GameLogs::new(dir, &prefix),
            plan,
            errors: vec![],
            watchdog_expired: false,
        };

        let board = plan.board.to_string();
        let port_arg = port.to_string();

        let mut server = self.command(&self.setup.server_command, dir, &game.logs.server)?;
        server
            .args([port_arg.as_str(), board.as_str()])
            .env(THINKING_TIME_ENV, plan.limits.thinking_time.as_secs().to_string());

        match game.group.spawn("server", &mut server) {
            Ok(server) => {
                thread::sleep(delays.server_settle);
                if game.group.is_running(server) {
                    self.connect_and_play(&mut game, server, dir, &port_arg, &board, cancel)?;
                } else {
                    let status = game.group.exit_status(server);
                    warn!("server exited during settle delay: {status:?}");
                    game.errors.push(MatchError::ServerStartFailure(format!(
                        "exited during settle delay ({status:?})"
                    )));
                }
            }
            Err(e) => {
                warn!("{e:#}");
                game.errors.push(MatchError::ServerStartFailure(format!("{e:#}")));
            }
        }

        game.enter(GamePhase::Draining);
        let survivors = game
            .group
            .shutdown(delays.terminate_wait, delays.kill_wait);
        if !survivors.is_empty() {
            game.errors.push(MatchError::Teardown(survivors.join(", ")));
        }
        thread::sleep(delays.port_settle);

        game.enter(GamePhase::Terminated);
        let mut outcome = self.extractor.parse_files(
            &game.logs.server,
            &[game.logs.player(Slot::First), game.logs.player(Slot::Second)],
        );
        if game.watchdog_expired {
            outcome = outcome.timed_out();
        }
        match outcome.reason {
            TerminationReason::Unknown | TerminationReason::Timeout => {
                let detail = outcome.detail.clone().unwrap_or_else(|| outcome.reason.to_string());
                game.errors.push(MatchError::GameInconclusive(detail));
            }
            TerminationReason::Crashed => {
                let detail = outcome.detail.clone().unwrap_or_default();
                game.errors.push(MatchError::ProcessCrash(detail));
            }
            _ => {}
        }
        info!(
            winner = ?outcome.winner,
            circle = ?outcome.circle_score,
            square = ?outcome.square_score,
            reason = %outcome.reason,
            "{prefix} over"
        );

        Ok(GameRecord {
            plan: plan.clone(),
            outcome,
            errors: game.errors,
        })
    }

    /// `AwaitingConnect` and `Active` phases.
    fn connect_and_play(
        &self,
        game: &mut GameRun,
        server: MemberId,
        dir: &Path,
        port: &str,
        board: &str,
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        let delays = self.limits.delays();
        game.enter(GamePhase::AwaitingConnect);

        for slot in [Slot::First, Slot::Second] {
            if slot == Slot::Second {
                thread::sleep(delays.player_stagger);
            }
            let role = game.plan.role_of(slot);
            let mut player =
                self.command(&self.setup.player_command, dir, game.logs.player(slot))?;
            player.args([slot.dir_name(), port, board, role.label()]);
            if let Err(e) = game.group.spawn(slot.dir_name(), &mut player) {
                warn!("{e:#}");
                game.errors.push(MatchError::PlayerLaunch {
                    slot: slot.dir_name().to_string(),
                    reason: format!("{e:#}"),
                });
                return Ok(());
            }
        }

        let server_log = game.logs.server.clone();
        let connected = poll_until(delays.connect_poll, delays.connect_timeout, || {
            if players_connected(&server_log) {
                Some(true)
            } else if cancel.is_cancelled() || !game.group.is_running(server) {
                Some(false)
            } else {
                None
            }
        });
        match connected.ready() {
            Some(true) => debug!("players connected"),
            Some(false) if cancel.is_cancelled() => {}
            Some(false) => debug!("server exited before the players connected"),
            None => {
                warn!("no connection marker after {:?}, proceeding", delays.connect_timeout);
                game.errors
                    .push(MatchError::ConnectTimeout(delays.connect_timeout));
            }
        }

        game.enter(GamePhase::Active);
        let started = Instant::now();
        let watchdog = game.plan.limits.watchdog;
        let exited = poll_until(delays.watchdog_poll, watchdog, || {
            (cancel.is_cancelled() || !game.group.is_running(server)).then_some(())
        });
        if cancel.is_cancelled() {
            warn!("match cancelled, tearing the game down");
        } else if exited.is_ready() {
            debug!("server exited after {:?}", started.elapsed());
            thread::sleep(delays.exit_grace);
        } else {
            warn!("watchdog expired after {watchdog:?}");
            game.watchdog_expired = true;
            // last chance for the server to write its scores
            let flushed = poll_until(delays.watchdog_poll, delays.expiry_grace, || {
                (!game.group.is_running(server)).then_some(())
            });
            if flushed.is_ready() {
                thread::sleep(delays.exit_grace.min(delays.expiry_grace));
            }
        }
        Ok(())
    }
}

fn players_connected(server_log: &Path) -> bool {
    let Ok(bytes) = std::fs::read(server_log) else {
        return false;
    };
    String::from_utf8_lossy(&bytes).lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.contains("both players connected") || (line.contains("game") && line.contains("started"))
    })
}

impl GamePlayer for MatchDirector {
    fn play(
        &self,
        m: &Match,
        plan: &GamePlan,
        cancel: &CancelToken,
    ) -> anyhow::Result<GameRecord> {
        self.run_game(&match_dir(&self.setup, m), m, plan, cancel)
    }
}

impl MatchRunner for MatchDirector {
    fn run_match(&self, m: Match, cancel: &CancelToken) -> anyhow::Result<MatchResult> {
        self.play_match(m, cancel)
    }
}
