//! Working directory of a match.
//!
//! ```text
//! <output>/matches/<Round_name>_match_<n>/
//! ├── <copy of the reference directory>
//! ├── player1/            first slot's submission
//! ├── player2/            second slot's submission
//! └── <prefix>_<server|player1|player2>.log
//! ```

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::{debug, instrument, warn};

use crate::{bracket::Match, error::MatchError, participant::Slot, setup::ArenaSetup};

/// A staged match directory.
#[derive(Debug)]
pub struct StagedMatch {
    pub dir: PathBuf,
    /// Participants whose submission could not be staged.
    pub disqualified: Vec<(Slot, MatchError)>,
}

impl StagedMatch {
    pub fn is_playable(&self) -> bool {
        self.disqualified.is_empty()
    }
}

/// Directory of match `m`.
pub fn match_dir(setup: &ArenaSetup, m: &Match) -> PathBuf {
    setup.matches_dir().join(m.dir_name())
}

/// Creates the match directory from scratch: a leftover directory of a previous run is
/// removed first.
///
/// # Errors
/// Fails when the directory cannot be created or the reference assets cannot be copied.
/// A broken submission is not an error here, see [`StagedMatch::disqualified`].
#[instrument(skip_all, fields(pairing = %m))]
pub fn stage_match(setup: &ArenaSetup, m: &Match) -> anyhow::Result<StagedMatch> {
    let dir = match_dir(setup, m);
    if dir.exists() {
        debug!("removing previous '{}'", dir.display());
        fs::remove_dir_all(&dir)
            .with_context(|| format!("could not clear '{}'", dir.display()))?;
    }
    fs::create_dir_all(&dir).with_context(|| format!("could not create '{}'", dir.display()))?;

    copy_dir_contents(&setup.reference_dir, &dir).with_context(|| {
        format!(
            "could not copy reference directory '{}'",
            setup.reference_dir.display()
        )
    })?;

    let mut disqualified = vec![];
    for slot in [Slot::First, Slot::Second] {
        let participant = m.participant(slot);
        let source = setup.submission_dir(&participant.group, &participant.name);
        if let Err(reason) = stage_submission(&source, &dir.join(slot.dir_name()), &setup.entry_files) {
            warn!("{participant}: {reason}");
            disqualified.push((
                slot,
                MatchError::Staging {
                    participant: participant.name.clone(),
                    reason,
                },
            ));
        }
    }

    Ok(StagedMatch { dir, disqualified })
}

fn stage_submission(source: &Path, dest: &Path, entry_files: &[String]) -> Result<(), String> {
    if !source.is_dir() {
        return Err(format!("submission '{}' not found", source.display()));
    }
    fs::create_dir_all(dest).map_err(|e| format!("could not create '{}': {e}", dest.display()))?;
    copy_dir_contents(source, dest).map_err(|e| format!("could not copy submission: {e}"))?;

    if !entry_files.is_empty() && !entry_files.iter().any(|f| dest.join(f).is_file()) {
        return Err(format!("none of {entry_files:?} found"));
    }
    Ok(())
}

/// Copies everything inside `from` into the existing directory `to`.
fn copy_dir_contents(from: &Path, to: &Path) -> io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_dir_contents(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
