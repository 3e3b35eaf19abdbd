//! Persistence of a run.
//!
//! - `elimination_results.csv`: one row per match, appended as soon as the match is
//!   resolved. The header is only written when the file is new or empty, so an interrupted
//!   run can be resumed into the same file.
//! - `match_summary.txt`: human-readable account of a match, in its match directory.
//! - `champion.txt` and `standings.csv`: written once the final is resolved.

use std::{
    fmt::Write as _,
    fs::{self, OpenOptions},
    path::PathBuf,
};

use anyhow::Context;
use serde::Serialize;
use time::{format_description, OffsetDateTime};
use tracing::{debug, info};

use crate::{
    limits::BoardSize,
    participant::{Participant, Slot},
    result_extractor::Winner,
    setup::{ArenaSetup, GameFormat},
    tiebreak::{GameRecord, MatchResult, TiebreakStage},
    tournament::RoundRecord,
};

pub const RESULTS_FILE: &str = "elimination_results.csv";
pub const CHAMPION_FILE: &str = "champion.txt";
pub const STANDINGS_FILE: &str = "standings.csv";
pub const SUMMARY_FILE: &str = "match_summary.txt";

/// Final place of a participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Standing {
    pub place: usize,
    pub seed: u32,
    pub player: String,
    pub group: String,
    /// Round lost, empty for the champion.
    pub eliminated_in: String,
}

/// Final places from the rounds of a complete bracket.
///
/// Losers of a round with `k` matches share place `k + 1`. Within a place, better seeds
/// come first.
pub fn standings(rounds: &[RoundRecord]) -> Vec<Standing> {
    let mut standings = vec![];
    let Some(final_round) = rounds.last() else {
        return standings;
    };
    if let [final_match] = final_round.results.as_slice() {
        standings.push(standing(1, &final_match.winner, ""));
    }
    for round in rounds.iter().rev() {
        let place = round.results.len() + 1;
        let mut losers = round
            .results
            .iter()
            .map(|r| r.loser().clone())
            .collect::<Vec<_>>();
        losers.sort_by_key(|p| p.seed);
        standings.extend(losers.iter().map(|p| standing(place, p, &round.name)));
    }
    standings
}

fn standing(place: usize, p: &Participant, round: &str) -> Standing {
    Standing {
        place,
        seed: p.seed,
        player: p.name.clone(),
        group: p.group.clone(),
        eliminated_in: round.to_string(),
    }
}

/// Writes the results of a run under its output directory.
#[derive(Debug, Clone)]
pub struct ResultsStore {
    output_dir: PathBuf,
    matches_dir: PathBuf,
    boards: Vec<BoardSize>,
    format: GameFormat,
}

impl ResultsStore {
    pub fn new(setup: &ArenaSetup) -> Self {
        Self {
            output_dir: setup.output_dir().to_path_buf(),
            matches_dir: setup.matches_dir(),
            boards: setup.boards().to_vec(),
            format: setup.format(),
        }
    }

    pub fn results_path(&self) -> PathBuf {
        self.output_dir.join(RESULTS_FILE)
    }

    fn games_per_board(&self) -> usize {
        match self.format {
            GameFormat::RoleSwap => 2,
            GameFormat::Single => 1,
        }
    }

    /// Columns of the results table. Scores are from the point of view of the two slots,
    /// whatever role they played.
    pub fn header(&self) -> Vec<String> {
        let mut header = [
            "round",
            "match_num",
            "player1_seed",
            "player1_name",
            "player1_group",
            "player2_seed",
            "player2_name",
            "player2_group",
            "match_winner",
            "match_winner_seed",
        ]
        .map(String::from)
        .to_vec();
        for board in &self.boards {
            for game in 1..=self.games_per_board() {
                for column in ["winner", "player1_score", "player2_score", "error"] {
                    header.push(format!("{board}_game{game}_{column}"));
                }
            }
            header.push(format!("{board}_player1_total_score"));
            header.push(format!("{board}_player2_total_score"));
        }
        header.push("tiebreaker".to_string());
        for battle in 1..=2 {
            for column in ["p1_wins", "p2_wins", "p1_score", "p2_score"] {
                header.push(format!("tiebreaker{battle}_{column}"));
            }
        }
        header.push("match_errors".to_string());
        header.push("timestamp".to_string());
        header
    }

    /// Row of `result`, aligned with [`header`](Self::header).
    pub fn row(&self, result: &MatchResult) -> Vec<String> {
        let m = &result.pairing;
        let mut row = vec![
            m.round.clone(),
            m.number.to_string(),
            m.first.seed.to_string(),
            m.first.name.clone(),
            m.first.group.clone(),
            m.second.seed.to_string(),
            m.second.name.clone(),
            m.second.group.clone(),
            result.winner.name.clone(),
            result.winner.seed.to_string(),
        ];

        let regular = result.stage(TiebreakStage::Normal);
        for &board in &self.boards {
            for number in 1..=self.games_per_board() {
                let game = regular.and_then(|s| {
                    s.games
                        .iter()
                        .find(|g| g.plan.board == board && g.plan.number == number)
                });
                match game {
                    Some(game) => row.extend([
                        winner_label(game),
                        score(game.score(Slot::First)),
                        score(game.score(Slot::Second)),
                        game_errors(game),
                    ]),
                    None => row.extend(std::iter::repeat(String::new()).take(4)),
                }
            }
            match regular {
                Some(stage) => {
                    row.push(format!("{:.2}", stage.board_score(board, Slot::First)));
                    row.push(format!("{:.2}", stage.board_score(board, Slot::Second)));
                }
                None => row.extend([String::new(), String::new()]),
            }
        }

        row.push(result.tiebreak().map(TiebreakStage::label).unwrap_or_default().to_string());
        for stage in [TiebreakStage::Battle1, TiebreakStage::Battle2] {
            match result.stage(stage) {
                Some(stage) => row.extend([
                    stage.wins(Slot::First).to_string(),
                    stage.wins(Slot::Second).to_string(),
                    format!("{:.2}", stage.score(Slot::First)),
                    format!("{:.2}", stage.score(Slot::Second)),
                ]),
                None => row.extend(std::iter::repeat(String::new()).take(4)),
            }
        }

        row.push(
            result
                .all_errors()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        );
        row.push(timestamp());
        row
    }

    /// Appends the row of `result` to the results table, creating it if needed.
    ///
    /// # Errors
    /// Fails when the table cannot be opened or written.
    pub fn append(&self, result: &MatchResult) -> anyhow::Result<()> {
        let path = self.results_path();
        let is_new = fs::metadata(&path).map_or(true, |meta| meta.len() == 0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("could not open '{}'", path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(self.header())?;
        }
        writer.write_record(self.row(result))?;
        writer
            .flush()
            .with_context(|| format!("could not write '{}'", path.display()))?;
        debug!("{} recorded", result.pairing);
        Ok(())
    }

    /// Writes `match_summary.txt` in the match directory.
    ///
    /// # Errors
    /// Fails when the file cannot be written.
    pub fn write_match_summary(&self, result: &MatchResult) -> anyhow::Result<PathBuf> {
        let dir = self.matches_dir.join(result.pairing.dir_name());
        fs::create_dir_all(&dir).with_context(|| format!("could not create '{}'", dir.display()))?;
        let path = dir.join(SUMMARY_FILE);
        fs::write(&path, match_summary(result))
            .with_context(|| format!("could not write '{}'", path.display()))?;
        Ok(path)
    }

    /// # Errors
    /// Fails when the file cannot be written.
    pub fn write_champion(&self, champion: &Participant) -> anyhow::Result<PathBuf> {
        let rule = "=".repeat(100);
        let text = format!(
            "{rule}\nELIMINATION TOURNAMENT CHAMPION\n{rule}\n\n\
             Seed: #{}\nPlayer: {}\nGroup: {}\nOriginal Wins: {}\nOriginal Score: {}\n\n{rule}\n",
            champion.seed, champion.name, champion.group, champion.wins, champion.total_score
        );
        let path = self.output_dir.join(CHAMPION_FILE);
        fs::write(&path, text).with_context(|| format!("could not write '{}'", path.display()))?;
        info!("champion written to {}", path.display());
        Ok(path)
    }

    /// # Errors
    /// Fails when the file cannot be written.
    pub fn write_standings(&self, standings: &[Standing]) -> anyhow::Result<PathBuf> {
        let path = self.output_dir.join(STANDINGS_FILE);
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("could not create '{}'", path.display()))?;
        for standing in standings {
            writer.serialize(standing)?;
        }
        writer.flush()?;
        Ok(path)
    }
}

fn winner_label(game: &GameRecord) -> String {
    match game.outcome.winner {
        Some(Winner::Role(role)) => role.label().to_string(),
        Some(Winner::Draw) => "draw".to_string(),
        None => "error".to_string(),
    }
}

fn score(score: Option<f64>) -> String {
    score.map(|s| s.to_string()).unwrap_or_default()
}

fn game_errors(game: &GameRecord) -> String {
    game.errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
        .ok()
        .and_then(|format| now.format(&format).ok())
        .unwrap_or_default()
}

fn match_summary(result: &MatchResult) -> String {
    let m = &result.pairing;
    let mut out = String::new();
    let _ = writeln!(out, "{} - match {}", m.round, m.number);
    let _ = writeln!(out, "Player 1: {} ({})", m.first, m.first.group);
    let _ = writeln!(out, "Player 2: {} ({})", m.second, m.second.group);

    for stage in &result.stages {
        let _ = writeln!(out, "\n[{stage}]", stage = stage.stage);
        for game in &stage.games {
            let circle = m.participant(game.plan.circle);
            let scores = match (game.outcome.circle_score, game.outcome.square_score) {
                (Some(c), Some(s)) => format!(" ({c:.2} - {s:.2})"),
                _ => String::new(),
            };
            let winner = match game.winner_slot() {
                Some(slot) => m.participant(slot).to_string(),
                None => winner_label(game),
            };
            let _ = writeln!(
                out,
                "{}: circle {circle}, winner {winner}{scores}, {}",
                game.plan.log_prefix(),
                game.outcome.reason
            );
            for error in &game.errors {
                let _ = writeln!(out, "    ! {error}");
            }
        }
        let _ = writeln!(
            out,
            "wins {} - {}, points {:.2} - {:.2}",
            stage.wins(Slot::First),
            stage.wins(Slot::Second),
            stage.score(Slot::First),
            stage.score(Slot::Second)
        );
    }

    for error in &result.errors {
        let _ = writeln!(out, "\n! {error}");
    }
    let decided_by = match result.decided_by {
        TiebreakStage::Normal => "regular games".to_string(),
        stage => stage.label().to_string(),
    };
    let _ = writeln!(out, "\nWinner: {} (decided by {decided_by})", result.winner);
    out
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use super::*;
    use crate::{
        bracket::Match,
        error::MatchError,
        limits::BoardLimits,
        participant::Role,
        result_extractor::{GameOutcome, TerminationReason},
        tiebreak::{GamePlan, StageRecord},
    };

    fn store(root: &Path) -> ResultsStore {
        let setup = ArenaSetup::builder()
            .with_seeds_file(root.join("seeds.csv"))
            .with_players_dir(root.join("players"))
            .with_reference_dir(root.join("reference"))
            .with_output_dir(root)
            .build()
            .unwrap();
        ResultsStore::new(&setup)
    }

    fn pairing() -> Match {
        Match {
            round: "Final".to_string(),
            number: 1,
            first: Arc::new(Participant::new("alice", "Group_A", 1)),
            second: Arc::new(Participant::new("bob", "Group_B", 2)),
            boards: vec![BoardSize::Small],
        }
    }

    fn game(number: usize, circle: Slot, winner: Option<Role>, scores: Option<(f64, f64)>) -> GameRecord {
        GameRecord::new(
            GamePlan {
                stage: TiebreakStage::Normal,
                board: BoardSize::Small,
                number,
                circle,
                limits: BoardLimits::new(
                    std::time::Duration::from_secs(120),
                    std::time::Duration::from_secs(300),
                ),
            },
            GameOutcome {
                winner: winner.map(Winner::Role),
                circle_score: scores.map(|s| s.0),
                square_score: scores.map(|s| s.1),
                reason: if winner.is_some() {
                    TerminationReason::Normal
                } else {
                    TerminationReason::Unknown
                },
                detail: None,
            },
        )
    }

    fn played() -> MatchResult {
        MatchResult {
            stages: vec![StageRecord {
                stage: TiebreakStage::Normal,
                games: vec![
                    game(1, Slot::First, Some(Role::Circle), Some((55.0, 40.0))),
                    game(2, Slot::Second, Some(Role::Square), None),
                ],
            }],
            ..MatchResult::decided(pairing(), Slot::First, TiebreakStage::Normal)
        }
    }

    #[test]
    fn row_matches_header() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());
        let header = store.header();
        let row = store.row(&played());
        assert_eq!(header.len(), row.len());

        let column = |name: &str| {
            let i = header.iter().position(|h| h == name).unwrap();
            row[i].clone()
        };
        assert_eq!(column("match_winner"), "alice");
        assert_eq!(column("small_game1_winner"), "circle");
        assert_eq!(column("small_game1_player1_score"), "55");
        assert_eq!(column("small_game1_player2_score"), "40");
        // game 2: alice played square, no scores
        assert_eq!(column("small_game2_winner"), "square");
        assert_eq!(column("small_game2_player1_score"), "");
        assert_eq!(column("small_player1_total_score"), "55.00");
        assert_eq!(column("tiebreaker"), "");
        assert_eq!(column("tiebreaker1_p1_wins"), "");
    }

    #[test]
    fn match_errors_include_tiebreak_games() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());

        let mut battle_game = game(1, Slot::First, None, None);
        battle_game.plan.stage = TiebreakStage::Battle1;
        battle_game.errors.push(MatchError::ProcessCrash("Segmentation fault".to_string()));
        let mut result = played();
        result.stages.push(StageRecord {
            stage: TiebreakStage::Battle1,
            games: vec![battle_game],
        });
        result.errors.push(MatchError::RoundTimeout(std::time::Duration::from_secs(60)));

        let header = store.header();
        let row = store.row(&result);
        let i = header.iter().position(|h| h == "match_errors").unwrap();
        assert!(row[i].contains("Segmentation fault"), "{}", row[i]);
        assert_eq!(row[i].split("; ").count(), 2);
        // regular game columns only carry regular game errors
        assert_eq!(row[header.iter().position(|h| h == "small_game1_error").unwrap()], "");
    }

    #[test]
    fn header_is_written_once() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());
        store.append(&played()).unwrap();
        store.append(&played()).unwrap();

        let mut reader = csv::Reader::from_path(store.results_path()).unwrap();
        assert_eq!(reader.headers().unwrap().len(), store.header().len());
        assert_eq!(reader.records().count(), 2);

        // a second store on the same directory keeps appending
        let again = self::store(root.path());
        again.append(&played()).unwrap();
        let mut reader = csv::Reader::from_path(store.results_path()).unwrap();
        assert_eq!(reader.records().count(), 3);
    }

    #[test]
    fn summary_and_champion() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());
        let summary = store.write_match_summary(&played()).unwrap();
        assert_eq!(summary, root.path().join("matches/Final_match_1/match_summary.txt"));
        let text = fs::read_to_string(summary).unwrap();
        assert!(text.contains("small_game1: circle #1 alice, winner #1 alice (55.00 - 40.00), normal"));
        assert!(text.contains("Winner: #1 alice (decided by regular games)"));

        let champion = Participant::new("alice", "Group_A", 1).with_stats(4, 512.5);
        let path = store.write_champion(&champion).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("Seed: #1\nPlayer: alice\nGroup: Group_A\nOriginal Wins: 4\nOriginal Score: 512.5\n"));
    }

    #[test]
    fn standings_follow_elimination_round() {
        let seeds = (1..=4)
            .map(|i| Arc::new(Participant::new(format!("S{i}"), "G", i)))
            .collect::<Vec<_>>();
        let semis = crate::bracket::build_round1(&seeds, &[BoardSize::Small]).unwrap();
        let semi_results = vec![
            MatchResult::decided(semis[0].clone(), Slot::First, TiebreakStage::Normal),
            MatchResult::decided(semis[1].clone(), Slot::Second, TiebreakStage::Normal),
        ];
        let final_match = crate::bracket::advance_round(&semi_results, &[BoardSize::Small]).unwrap();
        let final_results = vec![MatchResult::decided(
            final_match[0].clone(),
            Slot::Second,
            TiebreakStage::Normal,
        )];
        let rounds = vec![
            RoundRecord {
                name: "Semifinals".to_string(),
                results: semi_results,
            },
            RoundRecord {
                name: "Final".to_string(),
                results: final_results,
            },
        ];

        let standings = standings(&rounds);
        let summary = standings
            .iter()
            .map(|s| (s.place, s.seed, s.eliminated_in.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![(1, 3, ""), (2, 1, "Final"), (3, 2, "Semifinals"), (3, 4, "Semifinals")]
        );

        let root = tempfile::tempdir().unwrap();
        let path = store(root.path()).write_standings(&standings).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.starts_with("place,seed,player,group,eliminated_in\n1,3,S3,G,\n"));
    }
}
