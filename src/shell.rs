use std::env;
use std::io::{BufRead, Write};
use std::sync::Arc;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::debug;

use crate::builtin::Registry;
use crate::config::LaunchPolicy;
use crate::error::ShellError;
use crate::execution::{Input, Output, Pipeline};
use crate::parser::segment;
use crate::sig::Foreground;

/// Supplies input lines to the command loop.
pub(crate) trait LineSource {
    /// Shows `prompt` and reads one line. `None` means end of input.
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>, ShellError>;
}

/// Line editor for terminals.
///
/// Pipeline groups are not made the terminal's foreground process group, so
/// a stage that reads the terminal itself (e.g. `cat` with no pipe in front)
/// is stopped by SIGTTIN and the line hangs until the group is killed from
/// elsewhere. Feed such programs through a pipe or a script instead.
pub(crate) struct Interactive {
    editor: DefaultEditor,
}

impl Interactive {
    pub(crate) fn new() -> Result<Self, ShellError> {
        Ok(Self {
            editor: DefaultEditor::new()?,
        })
    }
}

impl LineSource for Interactive {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>, ShellError> {
        match self.editor.readline(prompt) {
            Ok(line) => Ok(Some(line)),
            // Ctrl-C at the prompt discards the line
            Err(ReadlineError::Interrupted) => Ok(Some(String::new())),
            Err(ReadlineError::Eof) => Ok(None),
            // includes undecodable input, the loop decides what is fatal
            Err(err) => Err(err.into()),
        }
    }
}

/// Reads lines from any buffered reader, e.g. a script piped to stdin.
pub(crate) struct Buffered<R, W> {
    reader: R,
    console: W,
}

impl<R: BufRead, W: Write> Buffered<R, W> {
    pub(crate) fn new(reader: R, console: W) -> Self {
        Self { reader, console }
    }
}

impl<R: BufRead, W: Write> LineSource for Buffered<R, W> {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>, ShellError> {
        write!(self.console, "{}", prompt)?;
        self.console.flush()?;

        let mut raw = Vec::new();
        match self.reader.read_until(b'\n', &mut raw).map_err(ShellError::Input)? {
            0 => Ok(None),
            _ => Ok(Some(String::from_utf8_lossy(&raw).into_owned())),
        }
    }
}

pub(crate) struct Shell {
    registry: Arc<Registry>,
    foreground: Foreground,
    policy: LaunchPolicy,
}

impl Shell {
    pub(crate) fn new(
        registry: Arc<Registry>,
        foreground: Foreground,
        policy: LaunchPolicy,
    ) -> Self {
        Self {
            registry,
            foreground,
            policy,
        }
    }

    /// Reads and evaluates lines until the input ends.
    ///
    /// Evaluation errors are reported on `errors` and never stop the loop.
    /// Read errors are reported the same way and only the line is lost,
    /// unless the source is dead (see [`ShellError::is_dead_input`]).
    pub(crate) fn run<S: LineSource>(
        &self,
        source: &mut S,
        console: &mut dyn Write,
        errors: &mut dyn Write,
    ) -> Result<(), ShellError> {
        loop {
            let line = match source.read_line(&prompt()) {
                Ok(Some(line)) => line,
                Ok(None) => {
                    writeln!(console)?;
                    return Ok(());
                }
                Err(err) if err.is_dead_input() => return Err(err),
                Err(err) => {
                    debug!("read failed: {:?}", err);
                    writeln!(errors, "{}", err)?;
                    continue;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Err(err) = self.eval(line, Input::Inherit, Output::Inherit) {
                debug!(runtime = err.is_runtime(), "line failed: {:?}", err);
                writeln!(errors, "{}", err)?;
            }
        }
    }

    /// Evaluates one line with the given outer streams.
    pub(crate) fn eval(&self, line: &str, stdin: Input, stdout: Output) -> Result<(), ShellError> {
        let segments = segment(line)?;

        if let [argv] = segments.as_slice() {
            if let Some(handler) = argv.first().and_then(|name| self.registry.get(name)) {
                let mut output = stdout.into_writer();

                return handler
                    .run(&argv[1..], &mut stdin.into_reader(), &mut output)
                    .and_then(|()| output.flush().map_err(Into::into))
                    .map_err(|source| ShellError::Builtin {
                        name: handler.name().to_string(),
                        source,
                    });
            }
        }

        if segments.is_empty() {
            return Ok(());
        }

        let pipeline = Pipeline::build(segments, &self.registry, stdin, stdout)?;
        pipeline.run(&self.foreground, self.policy)
    }
}

fn prompt() -> String {
    match env::current_dir() {
        Ok(cwd) => format!("{}$ ", cwd.display()),
        Err(_) => "$ ".to_string(),
    }
}
