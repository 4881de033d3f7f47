pub mod builtin;
pub mod config;
pub mod error;
pub mod execution;
pub mod parser;
pub mod shell;
pub mod sig;
#[cfg(test)]
mod testutil;

use std::error::Error;
use std::io::{self, BufReader, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use argh::FromArgs;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::builtin::Registry;
use crate::config::{Config, LaunchPolicy};
use crate::shell::{Buffered, Interactive, Shell};
use crate::sig::{spawn_coordinator, Foreground};

#[derive(FromArgs)]
/// Interactive shell running builtins and external programs as pipelines.
struct Args {
    #[argh(option)]
    /// directory `cd` changes to without an argument. Defaults to $HOME.
    home: Option<PathBuf>,

    #[argh(option, default = "LaunchPolicy::Abandon")]
    /// what happens to started stages when a later one fails to start:
    /// `abandon` or `terminate`.
    on_launch_failure: LaunchPolicy,

    #[argh(option, default = "String::from(\"warn\")")]
    /// log filter used when PIPESH_LOG is not set.
    log_level: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Args = argh::from_env();

    let filter =
        EnvFilter::try_from_env("PIPESH_LOG").unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let config = Config::new(args.home, args.on_launch_failure);
    debug!(?config, "starting");

    let registry = Arc::new(Registry::new(config.home.clone()));
    let foreground = Foreground::new();
    let _coordinator = spawn_coordinator(foreground.clone())?;

    let shell = Shell::new(registry, foreground, config.launch_policy);
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();

    if io::stdin().is_terminal() {
        shell.run(&mut Interactive::new()?, &mut stdout, &mut stderr)?;
    } else {
        // no lock held across lines, builtin stages may read stdin too
        let mut source = Buffered::new(BufReader::new(io::stdin()), io::stdout());
        shell.run(&mut source, &mut stdout, &mut stderr)?;
    }

    Ok(())
}
