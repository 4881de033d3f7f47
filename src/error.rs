use std::io;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::process::ExitStatus;

use rustyline::error::ReadlineError;
use thiserror::Error;

use crate::sig::SigError;

/// Everything that can end the evaluation of one input line.
#[derive(Debug, Error)]
pub enum ShellError {
    /// A pipe segment was empty, e.g. `a | | b`.
    #[error("syntax error near unexpected token `|'")]
    Syntax,

    /// An external stage could not be started.
    #[error("{program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// An external stage terminated unsuccessfully.
    #[error("{program}: {status}")]
    Exited { program: String, status: ExitStatus },

    /// A builtin stage returned an error.
    #[error("{name}: {source}")]
    Builtin {
        name: String,
        #[source]
        source: BuiltinError,
    },

    #[error("{name}: builtin panicked")]
    Panicked { name: String },

    #[error("cannot allocate pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("cannot read input: {0}")]
    Readline(#[from] ReadlineError),

    #[error("cannot read input: {0}")]
    Input(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ShellError {
    /// True for failures raised while a pipeline was already running.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            ShellError::Exited { .. } | ShellError::Builtin { .. } | ShellError::Panicked { .. }
        )
    }

    /// True when the line source is gone for good, e.g. the terminal hung up
    /// or nobody reads the prompt any more.
    ///
    /// Any other read failure only loses the current line.
    pub fn is_dead_input(&self) -> bool {
        let errno = match self {
            ShellError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe => return true,
            ShellError::Input(e) | ShellError::Io(e) | ShellError::Readline(ReadlineError::Io(e)) => {
                e.raw_os_error()
            }
            #[cfg(unix)]
            ShellError::Readline(ReadlineError::Errno(errno)) => Some(*errno as i32),
            _ => None,
        };
        matches!(errno, Some(libc::EIO) | Some(libc::EBADF) | Some(libc::ENXIO))
    }
}

#[derive(Debug, Error)]
pub enum BuiltinError {
    #[error("missing pid")]
    MissingPid,

    #[error("invalid pid `{value}`: {source}")]
    InvalidPid {
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("{}: {source}", .path.display())]
    ChangeDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Signal(#[from] SigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BuiltinError {
    /// The reading side of the output went away before the builtin finished.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, BuiltinError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::ShellError;

    #[test]
    fn test_dead_input() {
        let hangup = ShellError::Input(io::Error::from_raw_os_error(libc::EIO));
        assert!(hangup.is_dead_input());
        assert_eq!(
            hangup.to_string(),
            format!("cannot read input: {}", io::Error::from_raw_os_error(libc::EIO))
        );

        let closed = ShellError::Input(io::Error::from_raw_os_error(libc::EBADF));
        assert!(closed.is_dead_input());

        let flaky = ShellError::Input(io::Error::new(io::ErrorKind::Other, "flaky"));
        assert!(!flaky.is_dead_input());
        let prompt = ShellError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(prompt.is_dead_input());

        assert!(!ShellError::Syntax.is_dead_input());
    }
}
