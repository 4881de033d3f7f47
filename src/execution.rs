use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use libc::pid_t;
use os_pipe::{PipeReader, PipeWriter};
use tracing::{debug, warn};

use crate::builtin::{Builtin, Registry};
use crate::config::LaunchPolicy;
use crate::error::{BuiltinError, ShellError};
use crate::sig::{deliver, CancelToken, Foreground, ForegroundGuard, Signal, Target};

/// Where a stage reads from.
pub(crate) enum Input {
    Inherit,
    Pipe(PipeReader),
}

impl Input {
    fn into_stdio(self) -> Stdio {
        match self {
            Input::Inherit => Stdio::inherit(),
            Input::Pipe(reader) => reader.into(),
        }
    }

    pub(crate) fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            Input::Inherit => Box::new(io::stdin()),
            Input::Pipe(reader) => Box::new(reader),
        }
    }
}

/// Where a stage writes to.
pub(crate) enum Output {
    Inherit,
    Pipe(PipeWriter),
}

impl Output {
    fn into_stdio(self) -> Stdio {
        match self {
            Output::Inherit => Stdio::inherit(),
            Output::Pipe(writer) => writer.into(),
        }
    }

    pub(crate) fn into_writer(self) -> Box<dyn Write + Send> {
        match self {
            Output::Inherit => Box::new(io::stdout()),
            Output::Pipe(writer) => Box::new(writer),
        }
    }
}

pub(crate) enum StageKind {
    Builtin {
        handler: Arc<dyn Builtin>,
        args: Vec<String>,
    },
    External {
        argv: Vec<String>,
    },
}

pub(crate) struct Stage {
    name: String,
    kind: StageKind,
    input: Input,
    output: Output,
}

pub(crate) struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Creates one stage per segment and connects neighbours with OS pipes.
    ///
    /// Every boundary owns exactly one pipe: its write end becomes the output
    /// of the stage before it, its read end the input of the stage after it.
    pub(crate) fn build(
        segments: Vec<Vec<String>>,
        registry: &Registry,
        stdin: Input,
        stdout: Output,
    ) -> Result<Self, ShellError> {
        let boundaries = segments.len().saturating_sub(1);
        let mut inputs = Vec::with_capacity(segments.len());
        let mut outputs = Vec::with_capacity(segments.len());

        inputs.push(stdin);
        for _ in 0..boundaries {
            let (reader, writer) = os_pipe::pipe().map_err(ShellError::Pipe)?;
            outputs.push(Output::Pipe(writer));
            inputs.push(Input::Pipe(reader));
        }
        outputs.push(stdout);

        let mut stages = Vec::with_capacity(segments.len());
        for ((mut argv, input), output) in segments.into_iter().zip(inputs).zip(outputs) {
            let name = match argv.first() {
                Some(name) => name.clone(),
                None => return Err(ShellError::Syntax),
            };

            let kind = match registry.get(&name) {
                Some(handler) => StageKind::Builtin {
                    handler,
                    args: argv.split_off(1),
                },
                None => StageKind::External { argv },
            };

            stages.push(Stage {
                name,
                kind,
                input,
                output,
            });
        }

        Ok(Self { stages })
    }

    /// Runs the pipeline to completion as the foreground pipeline.
    pub(crate) fn run(
        self,
        foreground: &Foreground,
        policy: LaunchPolicy,
    ) -> Result<(), ShellError> {
        let cancel = CancelToken::new();
        let guard = foreground.begin(cancel.clone());

        let running = launch(self, &cancel, &guard, policy)?;
        wait_all(running)
    }
}

/// A started stage, waited on by [`wait_all`].
pub(crate) enum Running {
    Builtin {
        name: String,
        handle: JoinHandle<Result<(), BuiltinError>>,
    },
    External {
        name: String,
        child: Child,
        last: bool,
    },
}

/// Starts every stage of `pipeline`.
///
/// External stages share one process group, led by the first of them. If a
/// stage cannot be started, the stages after it are dropped (closing their
/// pipe ends) and `policy` decides what happens to the ones already running.
pub(crate) fn launch(
    pipeline: Pipeline,
    cancel: &CancelToken,
    foreground: &ForegroundGuard<'_>,
    policy: LaunchPolicy,
) -> Result<Vec<Running>, ShellError> {
    let count = pipeline.stages.len();
    let mut running = Vec::with_capacity(count);
    let mut pgid: Option<pid_t> = None;

    let mut stages = pipeline.stages.into_iter();
    while let Some(stage) = stages.next() {
        let last = running.len() + 1 == count;

        let started = match start(stage, cancel, pgid, last) {
            Ok(started) => started,
            Err(err) => {
                drop(stages);
                warn!("cannot start pipeline stage: {}", err);
                abort_launch(running, pgid, cancel, policy);
                return Err(err);
            }
        };

        if let (None, Running::External { child, .. }) = (pgid, &started) {
            let leader = child.id() as pid_t;
            debug!(pgid = leader, "created process group");
            foreground.set_group(leader);
            pgid = Some(leader);
        }

        running.push(started);
    }

    if let Err(e) = foreground.forward_pending_interrupt() {
        warn!("cannot forward interrupt: {}", e);
    }

    Ok(running)
}

fn start(
    stage: Stage,
    cancel: &CancelToken,
    pgid: Option<pid_t>,
    last: bool,
) -> Result<Running, ShellError> {
    let Stage {
        name,
        kind,
        input,
        output,
    } = stage;

    match kind {
        StageKind::Builtin { handler, args } => {
            let cancel = cancel.clone();
            let handle = thread::Builder::new()
                .name(format!("builtin-{}", name))
                .spawn(move || {
                    let mut input = Cancellable::new(input.into_reader(), cancel.clone());
                    let mut output = Cancellable::new(output.into_writer(), cancel);

                    let result = handler
                        .run(&args, &mut input, &mut output)
                        .and_then(|()| output.flush().map_err(BuiltinError::from));

                    // closes a pipe write end, the next stage sees end of stream
                    drop(output);
                    result
                })
                .map_err(|source| ShellError::Launch {
                    program: name.clone(),
                    source,
                })?;

            debug!(builtin = %name, "started builtin stage");
            Ok(Running::Builtin { name, handle })
        }
        StageKind::External { argv } => {
            let mut command = Command::new(&name);
            command
                .args(argv.iter().skip(1))
                .stdin(input.into_stdio())
                .stdout(output.into_stdio())
                .stderr(Stdio::inherit())
                .process_group(pgid.unwrap_or(0));

            let spawned = command.spawn();
            // `command` holds the parent's copies of the pipe ends
            drop(command);

            let child = spawned.map_err(|source| ShellError::Launch {
                program: name.clone(),
                source,
            })?;

            debug!(program = %name, pid = child.id(), "spawned external stage");
            Ok(Running::External { name, child, last })
        }
    }
}

fn abort_launch(
    started: Vec<Running>,
    pgid: Option<pid_t>,
    cancel: &CancelToken,
    policy: LaunchPolicy,
) {
    match policy {
        LaunchPolicy::Abandon => {
            if !started.is_empty() {
                warn!(
                    stages = started.len(),
                    "leaving already started stages running"
                );
            }
            // JoinHandle detaches and Child neither kills nor reaps on drop
            drop(started);
        }
        LaunchPolicy::Terminate => {
            if let Some(pgid) = pgid {
                if let Err(e) = deliver(Target::Group(pgid), Signal::Terminate) {
                    warn!(pgid, "cannot terminate process group: {}", e);
                }
            }
            cancel.cancel();

            if let Err(e) = wait_all(started) {
                debug!("terminated stage reported: {}", e);
            }
        }
    }
}

/// Waits for every stage in order and returns the first error.
///
/// Builtin threads close their output when they finish and external stages
/// never hold their pipe ends in this process, so every reader eventually
/// sees end of stream.
pub(crate) fn wait_all(stages: Vec<Running>) -> Result<(), ShellError> {
    let mut first_error = None;

    for stage in stages {
        if let Err(err) = stage.wait() {
            match first_error {
                None => first_error = Some(err),
                Some(_) => debug!("discarding later pipeline error: {}", err),
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

impl Running {
    fn wait(self) -> Result<(), ShellError> {
        match self {
            Running::Builtin { name, handle } => match handle.join() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) if source.is_broken_pipe() => {
                    debug!(builtin = %name, "reader went away");
                    Ok(())
                }
                Ok(Err(source)) => Err(ShellError::Builtin { name, source }),
                Err(_) => Err(ShellError::Panicked { name }),
            },
            Running::External {
                name,
                mut child,
                last,
            } => {
                let status = child.wait()?;
                debug!(program = %name, %status, "stage exited");

                let closed_pipe = !last && status.signal() == Some(libc::SIGPIPE);
                if status.success() || closed_pipe {
                    Ok(())
                } else {
                    Err(ShellError::Exited {
                        program: name,
                        status,
                    })
                }
            }
        }
    }
}

/// Fails reads and writes once the pipeline has been interrupted.
struct Cancellable<T> {
    inner: T,
    cancel: CancelToken,
}

impl<T> Cancellable<T> {
    fn new(inner: T, cancel: CancelToken) -> Self {
        Self { inner, cancel }
    }

    fn check(&self) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            // not ErrorKind::Interrupted, std retries those
            Err(io::Error::new(io::ErrorKind::Other, "interrupted"))
        } else {
            Ok(())
        }
    }
}

impl<T: Read> Read for Cancellable<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        self.inner.read(buf)
    }
}

impl<T: Write> Write for Cancellable<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.flush()
    }
}
