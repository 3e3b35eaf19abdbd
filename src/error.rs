//! Per-game and per-match anomalies.
//!
//! None of these abort a round: they are attached to the game or match record, written to
//! the results table, and the bracket keeps advancing. Errors that must stop the whole run
//! (bad configuration, missing reference assets, port exhaustion) travel as
//! [`anyhow::Error`] instead.

use std::time::Duration;

use thiserror::Error;

/// Anomaly recorded while staging or playing a match.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    /// A submission is missing its required entry file. Disqualifying, never retried.
    #[error("staging failed for {participant}: {reason}")]
    Staging { participant: String, reason: String },

    /// The game server exited during its settle delay, or could not be launched at all.
    #[error("game server failed to start: {0}")]
    ServerStartFailure(String),

    /// A player process could not be launched.
    #[error("could not launch {slot}: {reason}")]
    PlayerLaunch { slot: String, reason: String },

    /// The "connected" marker never showed up. The game still got its watchdog window.
    #[error("players did not connect within {0:?}")]
    ConnectTimeout(Duration),

    /// No parseable outcome in any log.
    #[error("game inconclusive: {0}")]
    GameInconclusive(String),

    /// A log carries a fault signature and no explicit result.
    #[error("process crashed: {0}")]
    ProcessCrash(String),

    /// Teardown left something behind.
    #[error("teardown incomplete: {0}")]
    Teardown(String),

    /// The round's outer budget expired before this match reported.
    #[error("round budget of {0:?} expired before the match finished")]
    RoundTimeout(Duration),
}
