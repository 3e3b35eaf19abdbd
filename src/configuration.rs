//! Config for the orchestrator behaviors
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional and case-insensitive. Set the value to `"true"` to enable a flag.
//!
//! - `ARENA_VERBOSE` : Print match progress to stdout (default: `true`)
//! - `ARENA_LOG` : Write a tracing log file in the output directory (default: `false`)
//! - `ARENA_CONTAIN_PROCESSES` : Place each game's processes in a dedicated cgroup (default: `true`)
//! - `ARENA_ALLOW_UNCONTAINED` : Fall back to plain child processes when cgroups v2 is not usable (default: `false`)

/// Configuration for orchestrator behaviors.
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) contain_processes: bool,
    pub(crate) allow_uncontained: bool,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Match progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - Every game's processes are placed in their own cgroup.
    /// - Running without a cgroup is not allowed.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            contain_processes: true,
            allow_uncontained: false,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Any value other than `"true"` (including unset) keeps the default for flags that
    /// default to `false`; unset keeps the default for flags that default to `true`.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        Self {
            verbose: get_env_flag("ARENA_VERBOSE", true),
            log: get_env_flag("ARENA_LOG", false),
            contain_processes: get_env_flag("ARENA_CONTAIN_PROCESSES", true),
            allow_uncontained: get_env_flag("ARENA_ALLOW_UNCONTAINED", false),
        }
    }

    /// Enable or disable progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Enable or disable per-game cgroups.
    pub fn with_contain_processes(mut self, value: bool) -> Self {
        self.contain_processes = value;
        self
    }

    /// Enable or disable the uncontained fallback.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
