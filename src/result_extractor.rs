//! Game outcome extraction from process logs.
//!
//! The game server is a black box: the only thing the orchestrator learns about a game is
//! what the server and the players printed. This module is the single place that knows the
//! text of those logs. If the server's output format changes, this is the file to update.
//!
//! # Log contract
//!
//! Markers are matched case-insensitively:
//!
//! | Marker | Meaning |
//! |---|---|
//! | `Final Scores - Circle: <n>, Square: <n>` | authoritative scores |
//! | `Winner: <circle\|square\|draw>` | declared winner |
//! | `REPETITION DETECTED` / `repetition` | game stopped on repeated positions |
//! | `INVALID MOVE by <circle\|square>` | the named role played an illegal move |
//! | `Turn limit` / `1000 total turns` | turn cap reached |
//! | `Game finished` / `Game Over` / `Winner:` | game completed |
//!
//! # Priority
//!
//! The server log is read first, then the player logs. Within one log the first rule that
//! applies decides:
//!
//! 1. final scores: higher score wins, equal scores draw. The termination reason is
//!    `repetition`, `invalidMove` or `turnLimit` when the matching marker is also present,
//!    `normal` otherwise.
//! 2. repetition marker: winner from the winner marker (if any), no scores.
//! 3. invalid move naming a role: the other role wins with the penalty score pair.
//! 4. completion marker with a winner marker: that winner, no scores.
//!
//! When no log yields a result, the logs are searched for crash signatures (`crashed`),
//! then for near-empty logs (`crashed`), and the outcome is `unknown` otherwise. Absent
//! scores stay absent: they are never replaced by zero.

use std::{fmt::Display, fs, path::Path};

use tracing::{debug, warn};

use crate::participant::Role;

/// Logs shorter than this (trimmed) are taken as a sign the process died early.
const MIN_LOG_LEN: usize = 50;

const CRASH_SIGNATURES: &[&str] = &[
    "importerror",
    "modulenotfounderror",
    "attributeerror",
    "typeerror",
    "valueerror",
    "indexerror",
    "keyerror",
    "nameerror",
    "syntaxerror",
    "indentationerror",
    "traceback",
    "connectionrefusederror",
    "timeouterror",
    "connection refused",
    "panicked at",
    "segmentation fault",
];

/// Who won a single game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Role(Role),
    Draw,
}

impl Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Winner::Role(role) => write!(f, "{role}"),
            Winner::Draw => f.write_str("draw"),
        }
    }
}

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Normal,
    Timeout,
    InvalidMove,
    Repetition,
    TurnLimit,
    Crashed,
    Unknown,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Normal => "normal",
            TerminationReason::Timeout => "timeout",
            TerminationReason::InvalidMove => "invalidMove",
            TerminationReason::Repetition => "repetition",
            TerminationReason::TurnLimit => "turnLimit",
            TerminationReason::Crashed => "crashed",
            TerminationReason::Unknown => "unknown",
        }
    }
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one played game. Never modified once extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct GameOutcome {
    pub winner: Option<Winner>,
    pub circle_score: Option<f64>,
    pub square_score: Option<f64>,
    pub reason: TerminationReason,
    /// Offending log line or other context for anomalies.
    pub detail: Option<String>,
}

impl GameOutcome {
    fn new(reason: TerminationReason) -> GameOutcome {
        GameOutcome {
            winner: None,
            circle_score: None,
            square_score: None,
            reason,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> GameOutcome {
        self.detail = Some(detail.into());
        self
    }

    pub fn score(&self, role: Role) -> Option<f64> {
        match role {
            Role::Circle => self.circle_score,
            Role::Square => self.square_score,
        }
    }

    /// The watchdog fired: an outcome nobody could read becomes a timeout.
    pub(crate) fn timed_out(mut self) -> GameOutcome {
        if self.reason == TerminationReason::Unknown {
            self.reason = TerminationReason::Timeout;
        }
        self
    }
}

/// Reads game outcomes out of server and player logs.
#[derive(Debug, Clone, Copy)]
pub struct ResultExtractor {
    invalid_move_penalty: f64,
}

impl ResultExtractor {
    /// `invalid_move_penalty` is the score given to the non-offending role after an invalid
    /// move when the log has no final scores (the offender gets 0).
    pub fn new(invalid_move_penalty: f64) -> ResultExtractor {
        ResultExtractor {
            invalid_move_penalty,
        }
    }

    /// Reads the log files and parses them. Missing or unreadable files are skipped.
    pub fn parse_files(&self, server_log: &Path, player_logs: &[&Path]) -> GameOutcome {
        fn read(path: &Path) -> Option<String> {
            match fs::read(path) {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    debug!("could not read {}: {e}", path.display());
                    None
                }
            }
        }

        let server = read(server_log);
        let players = player_logs.iter().filter_map(|p| read(p)).collect::<Vec<_>>();
        let players = players.iter().map(String::as_str).collect::<Vec<_>>();
        self.parse(server.as_deref(), &players)
    }

    /// Extracts the outcome, preferring the server log over the player logs.
    pub fn parse(&self, server_log: Option<&str>, player_logs: &[&str]) -> GameOutcome {
        let logs = server_log
            .into_iter()
            .chain(player_logs.iter().copied())
            .map(LogText::new)
            .collect::<Vec<_>>();

        if logs.is_empty() {
            return GameOutcome::new(TerminationReason::Unknown).with_detail("no log files found");
        }

        for log in &logs {
            if let Some(outcome) = self.decisive_outcome(log) {
                return outcome;
            }
        }

        for log in &logs {
            if let Some(line) = log.crash_line() {
                warn!("crash signature found: {line}");
                return GameOutcome::new(TerminationReason::Crashed).with_detail(line);
            }
        }

        if logs.iter().any(|log| log.original.trim().len() < MIN_LOG_LEN) {
            return GameOutcome::new(TerminationReason::Crashed)
                .with_detail("log too short - process may have crashed");
        }

        let last_line = logs[0]
            .original
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(|line| truncate(line, 150));
        let outcome = GameOutcome::new(TerminationReason::Unknown);
        match last_line {
            Some(line) => outcome.with_detail(format!("game did not complete, last log: {line}")),
            None => outcome,
        }
    }

    fn decisive_outcome(&self, log: &LogText) -> Option<GameOutcome> {
        if let Some((circle, square)) = log.final_scores() {
            let reason = if log.contains("repetition") {
                TerminationReason::Repetition
            } else if log.invalid_move_by().is_some() {
                TerminationReason::InvalidMove
            } else if log.contains("turn limit") || log.contains("1000 total turns") {
                TerminationReason::TurnLimit
            } else {
                TerminationReason::Normal
            };
            return Some(GameOutcome {
                winner: Some(compare_scores(circle, square)),
                circle_score: Some(circle),
                square_score: Some(square),
                reason,
                detail: None,
            });
        }

        if log.contains("repetition") {
            let mut outcome = GameOutcome::new(TerminationReason::Repetition);
            outcome.winner = log.declared_winner();
            return Some(outcome);
        }

        if let Some(offender) = log.invalid_move_by() {
            let mut outcome = GameOutcome::new(TerminationReason::InvalidMove)
                .with_detail(format!("invalid move by {offender}"));
            outcome.winner = Some(Winner::Role(offender.opponent()));
            let (offender_score, other_score) = (0.0, self.invalid_move_penalty);
            match offender {
                Role::Circle => {
                    outcome.circle_score = Some(offender_score);
                    outcome.square_score = Some(other_score);
                }
                Role::Square => {
                    outcome.circle_score = Some(other_score);
                    outcome.square_score = Some(offender_score);
                }
            }
            return Some(outcome);
        }

        let completed =
            log.contains("game finished") || log.contains("game over") || log.contains("winner:");
        if completed {
            if let Some(winner) = log.declared_winner() {
                let mut outcome = GameOutcome::new(TerminationReason::Normal);
                outcome.winner = Some(winner);
                return Some(outcome);
            }
        }
        None
    }
}

fn compare_scores(circle: f64, square: f64) -> Winner {
    if circle > square {
        Winner::Role(Role::Circle)
    } else if square > circle {
        Winner::Role(Role::Square)
    } else {
        Winner::Draw
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// A log and its ASCII-lowercased copy. Both have the same byte offsets.
struct LogText<'a> {
    original: &'a str,
    lower: String,
}

impl<'a> LogText<'a> {
    fn new(original: &'a str) -> LogText<'a> {
        LogText {
            original,
            lower: original.to_ascii_lowercase(),
        }
    }

    fn contains(&self, needle: &str) -> bool {
        self.lower.contains(needle)
    }

    /// Text following the first occurrence of `marker`.
    fn after(&self, marker: &str) -> Option<&str> {
        self.lower
            .find(marker)
            .map(|pos| &self.lower[pos + marker.len()..])
    }

    fn final_scores(&self) -> Option<(f64, f64)> {
        let mut start = 0;
        while let Some(pos) = self.lower[start..].find("final scores - circle:") {
            let rest = &self.lower[start + pos + "final scores - circle:".len()..];
            if let Some(scores) = parse_score_pair(rest) {
                return Some(scores);
            }
            start += pos + 1;
        }
        None
    }

    fn declared_winner(&self) -> Option<Winner> {
        let word = leading_word(self.after("winner:")?.trim_start());
        match word {
            "draw" => Some(Winner::Draw),
            _ => Role::from_label(word).map(Winner::Role),
        }
    }

    fn invalid_move_by(&self) -> Option<Role> {
        self.lower
            .match_indices("invalid move by ")
            .find_map(|(pos, marker)| {
                let rest = &self.lower[pos + marker.len()..];
                Role::from_label(leading_word(rest.trim_start()))
            })
    }

    fn crash_line(&self) -> Option<String> {
        CRASH_SIGNATURES.iter().find_map(|signature| {
            let pos = self.lower.find(signature)?;
            let line_start = self.lower[..pos].rfind('\n').map_or(0, |i| i + 1);
            let line_end = self.lower[pos..].find('\n').map_or(self.lower.len(), |i| pos + i);
            Some(truncate(self.original[line_start..line_end].trim(), 200))
        })
    }
}

fn leading_word(s: &str) -> &str {
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(s.len());
    &s[..end]
}

/// Parses `<n>, square: <n>` (already lowercased).
fn parse_score_pair(s: &str) -> Option<(f64, f64)> {
    let (circle, rest) = leading_number(s.trim_start())?;
    let rest = rest.trim_start().strip_prefix(',')?;
    let rest = rest.trim_start().strip_prefix("square:")?;
    let (square, _) = leading_number(rest.trim_start())?;
    Some((circle, square))
}

/// `\d+(\.\d*)?` at the start of `s`, and what follows it.
fn leading_number(s: &str) -> Option<(f64, &str)> {
    let int_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if int_end == 0 {
        return None;
    }
    let mut end = int_end;
    if s[end..].starts_with('.') {
        end += 1;
        end += s[end..]
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len() - end);
    }
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PADDING: &str = "Server listening on port 9600\nBoard size: small\nBoth players connected\n";

    fn extract(server: &str) -> GameOutcome {
        ResultExtractor::new(100.0).parse(Some(server), &[])
    }

    #[test]
    fn final_scores_decide() {
        let log = format!("{PADDING}Final Scores - Circle: 55.0, Square: 40.0\n");
        let outcome = extract(&log);
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Circle)));
        assert_eq!(outcome.circle_score, Some(55.0));
        assert_eq!(outcome.square_score, Some(40.0));
        assert_eq!(outcome.reason, TerminationReason::Normal);
    }

    #[test]
    fn equal_scores_are_a_draw() {
        let log = format!("{PADDING}final scores - circle:12, square: 12.\n");
        let outcome = extract(&log);
        assert_eq!(outcome.winner, Some(Winner::Draw));
        assert_eq!(outcome.circle_score, Some(12.0));
        assert_eq!(outcome.square_score, Some(12.0));
    }

    #[test]
    fn square_wins_on_score() {
        let outcome = extract(&format!("{PADDING}Final Scores - Circle: 3, Square: 40.25"));
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Square)));
        assert_eq!(outcome.square_score, Some(40.25));
    }

    #[test]
    fn scores_with_markers_keep_the_marker_reason() {
        let log = format!("{PADDING}Turn limit reached\nFinal Scores - Circle: 10.0, Square: 20.0\n");
        let outcome = extract(&log);
        assert_eq!(outcome.reason, TerminationReason::TurnLimit);
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Square)));

        let log = format!("{PADDING}REPETITION DETECTED\nWinner: Circle\nFinal Scores - Circle: 1.0, Square: 2.0\n");
        let outcome = extract(&log);
        assert_eq!(outcome.reason, TerminationReason::Repetition);
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Square)));
    }

    #[test]
    fn invalid_move_without_scores() {
        let log = format!("{PADDING}INVALID MOVE by circle\n");
        let outcome = extract(&log);
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Square)));
        assert_eq!(outcome.circle_score, Some(0.0));
        assert_eq!(outcome.square_score, Some(100.0));
        assert_eq!(outcome.reason, TerminationReason::InvalidMove);
    }

    #[test]
    fn invalid_move_by_square_uses_configured_penalty() {
        let outcome =
            ResultExtractor::new(50.0).parse(Some(&format!("{PADDING}invalid move by Square")), &[]);
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Circle)));
        assert_eq!(outcome.circle_score, Some(50.0));
        assert_eq!(outcome.square_score, Some(0.0));
    }

    #[test]
    fn repetition_takes_declared_winner() {
        let outcome = extract(&format!("{PADDING}REPETITION DETECTED\nWinner: square\n"));
        assert_eq!(outcome.reason, TerminationReason::Repetition);
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Square)));
        assert_eq!(outcome.circle_score, None);
        assert_eq!(outcome.square_score, None);

        let outcome = extract(&format!("{PADDING}3-move repetition\n"));
        assert_eq!(outcome.reason, TerminationReason::Repetition);
        assert_eq!(outcome.winner, None);
    }

    #[test]
    fn completion_marker_without_scores() {
        let outcome = extract(&format!("{PADDING}Game Over\nWinner: Circle\n"));
        assert_eq!(outcome.reason, TerminationReason::Normal);
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Circle)));
        assert_eq!(outcome.circle_score, None);
        assert_eq!(outcome.square_score, None);
    }

    #[test]
    fn completion_without_winner_is_not_decisive() {
        let outcome = extract(&format!("{PADDING}Game finished\n"));
        assert_eq!(outcome.reason, TerminationReason::Unknown);
        assert_eq!(outcome.winner, None);
    }

    #[test]
    fn server_log_is_preferred() {
        let server = format!("{PADDING}Final Scores - Circle: 1.0, Square: 2.0");
        let player = format!("{PADDING}Final Scores - Circle: 9.0, Square: 2.0");
        let outcome = ResultExtractor::new(100.0).parse(Some(&server), &[&player]);
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Square)));
    }

    #[test]
    fn player_log_is_the_fallback() {
        let server = format!("{PADDING}waiting for moves...\n");
        let player = format!("{PADDING}Final Scores - Circle: 9.0, Square: 2.0");
        let outcome = ResultExtractor::new(100.0).parse(Some(&server), &[&player]);
        assert_eq!(outcome.winner, Some(Winner::Role(Role::Circle)));
        assert_eq!(outcome.circle_score, Some(9.0));
    }

    #[test]
    fn crash_signature_in_player_log() {
        let server = format!("{PADDING}waiting for moves...\n");
        let player = "Starting bot\nTraceback (most recent call last):\n  File \"x.py\"\nKeyError: 'board'\n";
        let outcome = ResultExtractor::new(100.0).parse(Some(&server), &[player]);
        assert_eq!(outcome.reason, TerminationReason::Crashed);
        assert_eq!(outcome.winner, None);
        // signatures are tried in list order, KeyError comes before Traceback
        assert_eq!(outcome.detail.as_deref(), Some("KeyError: 'board'"));
    }

    #[test]
    fn near_empty_log_never_fabricates_a_winner() {
        let outcome = extract("started\n");
        assert_eq!(outcome.reason, TerminationReason::Crashed);
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.circle_score, None);

        let outcome = extract("");
        assert!(matches!(
            outcome.reason,
            TerminationReason::Crashed | TerminationReason::Unknown
        ));
        assert_eq!(outcome.winner, None);
    }

    #[test]
    fn inconclusive_log_is_unknown() {
        let outcome = extract(&format!("{PADDING}Move 1: circle (3,4)\nMove 2: square (1,1)\n"));
        assert_eq!(outcome.reason, TerminationReason::Unknown);
        assert_eq!(outcome.winner, None);
        assert!(outcome.detail.as_deref().unwrap().ends_with("Move 2: square (1,1)"));
        assert_eq!(outcome.timed_out().reason, TerminationReason::Timeout);
    }

    #[test]
    fn no_logs_at_all() {
        let outcome = ResultExtractor::new(100.0).parse(None, &[]);
        assert_eq!(outcome.reason, TerminationReason::Unknown);
    }

    #[test]
    fn number_parsing() {
        assert_eq!(leading_number("55.0, x"), Some((55.0, ", x")));
        assert_eq!(leading_number("7"), Some((7.0, "")));
        assert_eq!(leading_number("7."), Some((7.0, "")));
        assert_eq!(leading_number(".5"), None);
        assert_eq!(parse_score_pair(" 1.5,square: 2"), Some((1.5, 2.0)));
        assert_eq!(parse_score_pair(" 1.5 square: 2"), None);
    }
}
