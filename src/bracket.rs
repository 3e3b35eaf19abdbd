//! Seeded single-elimination bracket.
//!
//! Round one pairs seed `i` against seed `N + 1 - i` (best against worst). Every later round
//! pairs the winners of consecutive matches, `(0, 1)`, `(2, 3)`, ..., in the order of the
//! previous round's match list. Winners are never re-seeded, so the bracket's halves stay
//! separated until the final.
//!
//! The number of seeds must be a power of two. Trimming the field or padding it with byes
//! is the caller's business.

use std::{fmt::Display, sync::Arc};

use anyhow::{bail, ensure};
use tracing::info;

use crate::{
    limits::BoardSize,
    participant::{Participant, Slot},
    tiebreak::MatchResult,
};

/// One pairing of the bracket.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Round name, e.g. `Round of 16`.
    pub round: String,
    /// One-based position of the match within its round.
    pub number: usize,
    pub first: Arc<Participant>,
    pub second: Arc<Participant>,
    /// Boards played, in order.
    pub boards: Vec<BoardSize>,
}

impl Match {
    pub fn participant(&self, slot: Slot) -> &Arc<Participant> {
        match slot {
            Slot::First => &self.first,
            Slot::Second => &self.second,
        }
    }

    /// Name of the match's working directory, e.g. `Round_of_16_match_3`.
    pub fn dir_name(&self) -> String {
        format!("{}_match_{}", self.round.replace(' ', "_"), self.number)
    }
}

impl Display for Match {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} {}: {} VS {}]",
            self.round, self.number, self.first, self.second
        )
    }
}

/// Display name of a round played by `players` participants.
pub fn round_name(players: usize) -> String {
    match players {
        2 => "Final".to_string(),
        4 => "Semifinals".to_string(),
        8 => "Quarterfinals".to_string(),
        n => format!("Round of {n}"),
    }
}

fn pair(round: &str, pairs: Vec<(Arc<Participant>, Arc<Participant>)>, boards: &[BoardSize]) -> Vec<Match> {
    pairs
        .into_iter()
        .enumerate()
        .map(|(i, (first, second))| Match {
            round: round.to_string(),
            number: i + 1,
            first,
            second,
            boards: boards.to_vec(),
        })
        .collect()
}

/// First round of the bracket: seed list position `i` against position `N - 1 - i`.
///
/// # Errors
/// Fails unless `seeds.len()` is a power of two, at least 2.
pub fn build_round1(seeds: &[Arc<Participant>], boards: &[BoardSize]) -> anyhow::Result<Vec<Match>> {
    let n = seeds.len();
    if n < 2 || !n.is_power_of_two() {
        bail!("a single-elimination bracket needs a power of two participants, got {n}");
    }
    let pairs = (0..n / 2)
        .map(|i| (seeds[i].clone(), seeds[n - 1 - i].clone()))
        .collect();
    Ok(pair(&round_name(n), pairs, boards))
}

/// Next round from the results of the previous one, in match-list order.
///
/// Returns an empty list when `results` holds a single match: its winner is the champion.
///
/// # Errors
/// Fails when `results` is empty or holds an odd number of matches (other than one).
pub fn advance_round(results: &[MatchResult], boards: &[BoardSize]) -> anyhow::Result<Vec<Match>> {
    ensure!(!results.is_empty(), "cannot advance a round without results");
    if results.len() == 1 {
        return Ok(vec![]);
    }
    ensure!(
        results.len() % 2 == 0,
        "cannot pair the winners of {} matches",
        results.len()
    );
    let winners = results.iter().map(|r| r.winner.clone()).collect::<Vec<_>>();
    let pairs = winners
        .chunks_exact(2)
        .map(|w| (w[0].clone(), w[1].clone()))
        .collect();
    Ok(pair(&round_name(winners.len()), pairs, boards))
}

/// Drives a bracket from the seed table to its champion.
///
/// Call [`start`](Self::start), then repeatedly feed each round's results (in match-list
/// order) to [`advance`](Self::advance) until it returns an empty list.
#[derive(Debug)]
pub struct SingleElimination {
    boards: Vec<BoardSize>,
    champion: Option<Arc<Participant>>,
    rounds_played: usize,
}

impl SingleElimination {
    pub fn new(boards: &[BoardSize]) -> Self {
        Self {
            boards: boards.to_vec(),
            champion: None,
            rounds_played: 0,
        }
    }

    /// Matches of the first round.
    pub fn start(&mut self, seeds: &[Arc<Participant>]) -> anyhow::Result<Vec<Match>> {
        let matches = build_round1(seeds, &self.boards)?;
        info!(participants = seeds.len(), rounds = seeds.len().trailing_zeros(), "bracket created");
        Ok(matches)
    }

    /// Matches of the next round, or an empty list once the champion is known.
    pub fn advance(&mut self, results: &[MatchResult]) -> anyhow::Result<Vec<Match>> {
        let next = advance_round(results, &self.boards)?;
        self.rounds_played += 1;
        if next.is_empty() {
            self.champion = Some(results[0].winner.clone());
        }
        Ok(next)
    }

    pub fn champion(&self) -> Option<&Arc<Participant>> {
        self.champion.as_ref()
    }

    pub fn rounds_played(&self) -> usize {
        self.rounds_played
    }
}
