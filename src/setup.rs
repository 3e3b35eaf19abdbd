//! Where things live and how the external programs are launched.
//!
//! [`ArenaSetup`] gathers the file system layout of a run (seed table, submissions,
//! reference assets, output) and the command lines of the game server and of the player
//! harness. Build it with [`ArenaSetupBuilder`], either programmatically or from
//! environment variables:
//!
//! - `ARENA_SEEDS` : seeds CSV (`seed,group,player,wins,total_score`)
//! - `ARENA_PLAYERS` : submissions base directory, laid out as `<group>/<player>/`
//! - `ARENA_REFERENCE` : directory copied into every match directory (server, harness, assets)
//! - `ARENA_OUTPUT` : output directory
//! - `ARENA_SERVER_CMD` : server command line (default: `python -u web_server.py`)
//! - `ARENA_PLAYER_CMD` : player command line (default: `python -u test_bot_student.py`)
//! - `ARENA_ENTRY_FILES` : comma-separated files, one of which every submission must contain
//! - `ARENA_BOARDS` : comma-separated board sizes (default: `small`)
//! - `ARENA_FORMAT` : `roleswap` (default) or `single`
//!
//! Command lines are split on whitespace and must not contain any quote.

use std::{
    env,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context};

use crate::limits::{parse_board_list, BoardSize};

/// A program and its leading arguments. Per-game arguments are appended at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: &[&str]) -> CommandLine {
        CommandLine {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FromStr for CommandLine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('"') || s.contains('\'') || s.contains('`') {
            bail!("command line should not contain any quote: '{s}'");
        }
        let mut words = s.split_whitespace().map(String::from);
        let program = words.next().context("empty command line")?;
        Ok(CommandLine {
            program,
            args: words.collect(),
        })
    }
}

impl Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How many games a pairing plays per board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameFormat {
    /// Two games per board, roles swapped for the second one.
    RoleSwap,
    /// One game per board, first slot plays circle.
    Single,
}

impl FromStr for GameFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roleswap" | "role_swap" | "t1" => Ok(GameFormat::RoleSwap),
            "single" => Ok(GameFormat::Single),
            other => bail!("unknown game format '{other}'"),
        }
    }
}

/// Obtained using [`ArenaSetupBuilder`].
#[derive(Debug, Clone)]
pub struct ArenaSetup {
    pub(crate) seeds_file: PathBuf,
    pub(crate) players_dir: PathBuf,
    pub(crate) reference_dir: PathBuf,
    pub(crate) output_dir: PathBuf,
    pub(crate) server_command: CommandLine,
    pub(crate) player_command: CommandLine,
    pub(crate) entry_files: Vec<String>,
    pub(crate) boards: Vec<BoardSize>,
    pub(crate) format: GameFormat,
    pub(crate) tiebreak_board: BoardSize,
    pub(crate) invalid_move_penalty: f64,
}

impl ArenaSetup {
    pub fn builder() -> ArenaSetupBuilder {
        ArenaSetupBuilder::new()
    }

    pub fn seeds_file(&self) -> &Path {
        &self.seeds_file
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn matches_dir(&self) -> PathBuf {
        self.output_dir.join("matches")
    }

    pub fn boards(&self) -> &[BoardSize] {
        &self.boards
    }

    pub fn format(&self) -> GameFormat {
        self.format
    }

    /// Submission directory of a participant: `<players>/<group>/<player>`.
    pub fn submission_dir(&self, group: &str, player: &str) -> PathBuf {
        self.players_dir.join(group).join(player)
    }

    /// Fails when something every match needs is missing. Called once before the first
    /// round, since a missing reference directory would fail every single match.
    pub fn check(&self) -> anyhow::Result<()> {
        if !self.reference_dir.is_dir() {
            bail!(
                "reference directory '{}' does not exist",
                self.reference_dir.display()
            );
        }
        if !self.players_dir.is_dir() {
            bail!(
                "players directory '{}' does not exist",
                self.players_dir.display()
            );
        }
        std::fs::create_dir_all(self.matches_dir()).with_context(|| {
            format!(
                "could not create output directory '{}'",
                self.output_dir.display()
            )
        })?;
        Ok(())
    }
}

/// A builder for [`ArenaSetup`].
#[derive(Debug, Default)]
pub struct ArenaSetupBuilder {
    seeds_file: Option<PathBuf>,
    players_dir: Option<PathBuf>,
    reference_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    server_command: Option<CommandLine>,
    player_command: Option<CommandLine>,
    entry_files: Option<Vec<String>>,
    boards: Option<Vec<BoardSize>>,
    format: Option<GameFormat>,
    tiebreak_board: Option<BoardSize>,
    invalid_move_penalty: Option<f64>,
}

impl ArenaSetupBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the variables listed in the [module documentation](self).
    ///
    /// # Errors
    /// Fails when a variable is set but cannot be parsed. Missing variables are only
    /// reported by [`build`](Self::build).
    pub fn from_env() -> anyhow::Result<Self> {
        fn path(var: &str) -> Option<PathBuf> {
            env::var_os(var).map(PathBuf::from)
        }

        fn parsed<T: FromStr<Err = anyhow::Error>>(var: &str) -> anyhow::Result<Option<T>> {
            match env::var(var) {
                Ok(value) => Ok(Some(
                    value.parse().with_context(|| format!("invalid {var}"))?,
                )),
                Err(_) => Ok(None),
            }
        }

        Ok(ArenaSetupBuilder {
            seeds_file: path("ARENA_SEEDS"),
            players_dir: path("ARENA_PLAYERS"),
            reference_dir: path("ARENA_REFERENCE"),
            output_dir: path("ARENA_OUTPUT"),
            server_command: parsed("ARENA_SERVER_CMD")?,
            player_command: parsed("ARENA_PLAYER_CMD")?,
            entry_files: env::var("ARENA_ENTRY_FILES").ok().map(|s| split_list(&s)),
            boards: match env::var("ARENA_BOARDS") {
                Ok(s) => Some(parse_board_list(&s).context("invalid ARENA_BOARDS")?),
                Err(_) => None,
            },
            format: parsed("ARENA_FORMAT")?,
            tiebreak_board: None,
            invalid_move_penalty: None,
        })
    }

    #[must_use]
    pub fn with_seeds_file(self, path: impl Into<PathBuf>) -> Self {
        Self {
            seeds_file: Some(path.into()),
            ..self
        }
    }

    #[must_use]
    pub fn with_players_dir(self, path: impl Into<PathBuf>) -> Self {
        Self {
            players_dir: Some(path.into()),
            ..self
        }
    }

    #[must_use]
    pub fn with_reference_dir(self, path: impl Into<PathBuf>) -> Self {
        Self {
            reference_dir: Some(path.into()),
            ..self
        }
    }

    #[must_use]
    pub fn with_output_dir(self, path: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: Some(path.into()),
            ..self
        }
    }

    #[must_use]
    pub fn with_server_command(self, command: CommandLine) -> Self {
        Self {
            server_command: Some(command),
            ..self
        }
    }

    #[must_use]
    pub fn with_player_command(self, command: CommandLine) -> Self {
        Self {
            player_command: Some(command),
            ..self
        }
    }

    /// A submission is accepted when it contains at least one of these files.
    #[must_use]
    pub fn with_entry_files(self, files: &[&str]) -> Self {
        Self {
            entry_files: Some(files.iter().map(|s| s.to_string()).collect()),
            ..self
        }
    }

    #[must_use]
    pub fn with_boards(self, boards: &[BoardSize]) -> Self {
        Self {
            boards: Some(boards.to_vec()),
            ..self
        }
    }

    #[must_use]
    pub fn with_format(self, format: GameFormat) -> Self {
        Self {
            format: Some(format),
            ..self
        }
    }

    /// Board of the tiebreak battles. Defaults to the first board of the schedule.
    #[must_use]
    pub fn with_tiebreak_board(self, board: BoardSize) -> Self {
        Self {
            tiebreak_board: Some(board),
            ..self
        }
    }

    /// Score awarded to the non-offending role after an invalid move (the offender gets 0).
    #[must_use]
    pub fn with_invalid_move_penalty(self, penalty: f64) -> Self {
        Self {
            invalid_move_penalty: Some(penalty),
            ..self
        }
    }

    /// # Errors
    /// Fails when one of the four directories is not set, or the board list is empty.
    pub fn build(self) -> anyhow::Result<ArenaSetup> {
        let boards = self.boards.unwrap_or_else(|| vec![BoardSize::Small]);
        let Some(first_board) = boards.first().copied() else {
            bail!("at least one board size is required");
        };

        Ok(ArenaSetup {
            seeds_file: self.seeds_file.context("seeds file not set (ARENA_SEEDS)")?,
            players_dir: self
                .players_dir
                .context("players directory not set (ARENA_PLAYERS)")?,
            reference_dir: self
                .reference_dir
                .context("reference directory not set (ARENA_REFERENCE)")?,
            output_dir: self
                .output_dir
                .context("output directory not set (ARENA_OUTPUT)")?,
            server_command: self
                .server_command
                .unwrap_or_else(|| CommandLine::new("python", &["-u", "web_server.py"])),
            player_command: self
                .player_command
                .unwrap_or_else(|| CommandLine::new("python", &["-u", "test_bot_student.py"])),
            entry_files: self
                .entry_files
                .unwrap_or_else(|| vec!["student_agent.py".into(), "CMakeLists.txt".into()]),
            boards,
            format: self.format.unwrap_or(GameFormat::RoleSwap),
            tiebreak_board: self.tiebreak_board.unwrap_or(first_board),
            invalid_move_penalty: self.invalid_move_penalty.unwrap_or(100.0),
        })
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_parsing() {
        let cmd: CommandLine = "python  -u web_server.py".parse().unwrap();
        assert_eq!(cmd.program, "python");
        assert_eq!(cmd.args, vec!["-u", "web_server.py"]);
        assert_eq!(cmd.to_string(), "python -u web_server.py");

        assert!("".parse::<CommandLine>().is_err());
        assert!("sh -c 'echo hi'".parse::<CommandLine>().is_err());
    }

    #[test]
    fn missing_directories_are_reported() {
        let err = ArenaSetupBuilder::new()
            .with_seeds_file("seeds.csv")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("ARENA_PLAYERS"));
    }

    #[test]
    fn defaults() {
        let setup = ArenaSetupBuilder::new()
            .with_seeds_file("seeds.csv")
            .with_players_dir("players")
            .with_reference_dir("reference")
            .with_output_dir("out")
            .with_boards(&[BoardSize::Medium, BoardSize::Small])
            .build()
            .unwrap();
        assert_eq!(setup.format(), GameFormat::RoleSwap);
        assert_eq!(setup.tiebreak_board, BoardSize::Medium);
        assert_eq!(setup.invalid_move_penalty, 100.0);
        assert_eq!(
            setup.submission_dir("Group_A", "submission_1"),
            PathBuf::from("players/Group_A/submission_1")
        );
        assert_eq!(setup.matches_dir(), PathBuf::from("out/matches"));
    }

    #[test]
    fn format_parsing() {
        assert_eq!("RoleSwap".parse::<GameFormat>().unwrap(), GameFormat::RoleSwap);
        assert_eq!("single".parse::<GameFormat>().unwrap(), GameFormat::Single);
        assert!("double".parse::<GameFormat>().is_err());
    }

    #[test]
    fn list_splitting() {
        assert_eq!(split_list("a.py, b.txt,,"), vec!["a.py", "b.txt"]);
    }
}
