//! Seed table loading.
//!
//! The seed table is produced by the group stage and consumed here as a CSV file with the
//! header `seed,group,player,wins,total_score`. Rows may come in any order; the table is
//! returned sorted by seed.

use std::{collections::HashSet, path::Path, sync::Arc};

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::participant::Participant;

#[derive(Debug, Deserialize)]
struct SeedRow {
    seed: u32,
    group: String,
    player: String,
    wins: u32,
    total_score: f64,
}

/// Reads the seed table at `path`.
///
/// # Errors
/// Fails when the file cannot be read, a row is malformed, or two rows share a seed or a
/// player name.
#[instrument]
pub fn load_seeds(path: &Path) -> anyhow::Result<Vec<Arc<Participant>>> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("could not open seed table '{}'", path.display()))?;
    parse_seeds(reader)
}

/// Same as [`load_seeds`], from any reader.
pub fn read_seeds<R: std::io::Read>(reader: R) -> anyhow::Result<Vec<Arc<Participant>>> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    parse_seeds(reader)
}

fn parse_seeds<R: std::io::Read>(mut reader: csv::Reader<R>) -> anyhow::Result<Vec<Arc<Participant>>> {
    let mut seen_seeds = HashSet::new();
    let mut seen_names = HashSet::new();
    let mut participants = vec![];

    for (i, row) in reader.deserialize::<SeedRow>().enumerate() {
        // +2: one-based, plus the header line
        let row = row.with_context(|| format!("seed table line {}", i + 2))?;
        if !seen_seeds.insert(row.seed) {
            bail!("seed {} appears twice", row.seed);
        }
        if !seen_names.insert(row.player.clone()) {
            bail!("player '{}' appears twice", row.player);
        }
        participants.push(
            Participant::new(row.player, row.group, row.seed).with_stats(row.wins, row.total_score),
        );
    }

    participants.sort_by_key(|p| p.seed);
    info!(count = participants.len(), "seed table loaded");
    Ok(participants.into_iter().map(Arc::new).collect())
}
