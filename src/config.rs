use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// What to do with stages that are already running when a later stage of the
/// same pipeline fails to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// Leave them running and never wait for them.
    Abandon,
    /// Send SIGTERM to their process group, cancel builtins, then reap them.
    Terminate,
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        LaunchPolicy::Abandon
    }
}

impl FromStr for LaunchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abandon" => Ok(LaunchPolicy::Abandon),
            "terminate" => Ok(LaunchPolicy::Terminate),
            other => Err(format!(
                "unknown launch failure policy `{}`, expected `abandon` or `terminate`",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Target of `cd` without arguments.
    pub home: PathBuf,
    pub launch_policy: LaunchPolicy,
}

impl Config {
    pub fn new(home: Option<PathBuf>, launch_policy: LaunchPolicy) -> Self {
        let home = home
            .or_else(|| env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/"));

        Self {
            home,
            launch_policy,
        }
    }
}
