use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libc::pid_t;
use tracing::debug;

use crate::error::BuiltinError;
use crate::sig::{deliver, Signal, Target};

/// A command run inside the shell process instead of being spawned.
///
/// Handlers must only use the streams they are given, never the process's
/// own stdio, so they compose with any pipeline position.
pub trait Builtin: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        args: &[String],
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), BuiltinError>;
}

/// Name to handler table, filled once at startup.
pub struct Registry {
    builtins: HashMap<&'static str, Arc<dyn Builtin>>,
}

impl Registry {
    pub fn new(home: PathBuf) -> Self {
        let mut registry = Self {
            builtins: HashMap::new(),
        };
        registry.register(Cd { home });
        registry.register(Pwd);
        registry.register(Echo);
        registry.register(Kill);
        registry.register(Ps::default());
        registry
    }

    fn register<B: Builtin + 'static>(&mut self, builtin: B) {
        self.builtins.insert(builtin.name(), Arc::new(builtin));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Builtin>> {
        self.builtins.get(name).cloned()
    }
}

pub struct Cd {
    home: PathBuf,
}

impl Builtin for Cd {
    fn name(&self) -> &'static str {
        "cd"
    }

    fn run(
        &self,
        args: &[String],
        _: &mut dyn Read,
        _: &mut dyn Write,
    ) -> Result<(), BuiltinError> {
        let target = match args.first() {
            Some(dir) => PathBuf::from(dir),
            None => self.home.clone(),
        };

        env::set_current_dir(&target).map_err(|source| BuiltinError::ChangeDir {
            path: target,
            source,
        })
    }
}

pub struct Pwd;

impl Builtin for Pwd {
    fn name(&self) -> &'static str {
        "pwd"
    }

    fn run(
        &self,
        _: &[String],
        _: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), BuiltinError> {
        let cwd = env::current_dir()?;
        writeln!(output, "{}", cwd.display())?;
        Ok(())
    }
}

pub struct Echo;

impl Builtin for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn run(
        &self,
        args: &[String],
        _: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), BuiltinError> {
        writeln!(output, "{}", args.join(" "))?;
        Ok(())
    }
}

/// Sends SIGTERM to a single process.
pub struct Kill;

impl Builtin for Kill {
    fn name(&self) -> &'static str {
        "kill"
    }

    fn run(
        &self,
        args: &[String],
        _: &mut dyn Read,
        _: &mut dyn Write,
    ) -> Result<(), BuiltinError> {
        let value = args.first().ok_or(BuiltinError::MissingPid)?;
        let pid: pid_t = value.parse().map_err(|source| BuiltinError::InvalidPid {
            value: value.clone(),
            source,
        })?;

        deliver(Target::Process(pid), Signal::Terminate)?;
        Ok(())
    }
}

/// Lists the processes found under a procfs mount.
pub struct Ps {
    root: PathBuf,
}

impl Default for Ps {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl Ps {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pids(&self) -> Result<Vec<u32>, BuiltinError> {
        let mut pids: Vec<u32> = fs::read_dir(&self.root)?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();

        pids.sort_unstable();
        Ok(pids)
    }

    fn command(dir: &Path) -> Option<String> {
        let cmdline = fs::read(dir.join("cmdline"))
            .map(|raw| String::from_utf8_lossy(&raw).replace('\0', " "))
            .unwrap_or_default();
        let cmdline = cmdline.trim();
        if !cmdline.is_empty() {
            return Some(cmdline.to_string());
        }

        fs::read_to_string(dir.join("comm"))
            .ok()
            .map(|comm| comm.trim().to_string())
    }
}

impl Builtin for Ps {
    fn name(&self) -> &'static str {
        "ps"
    }

    fn run(
        &self,
        _: &[String],
        _: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), BuiltinError> {
        let mut out = BufWriter::new(output);

        for pid in self.pids()? {
            // processes may exit between listing and reading
            match Self::command(&self.root.join(pid.to_string())) {
                Some(command) => writeln!(out, "{} {}", pid, command)?,
                None => debug!(pid, "skipping unreadable process entry"),
            }
        }

        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io::{empty, sink};
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::process::Command;

    use super::{Builtin, Echo, Ps, Registry};
    use crate::error::BuiltinError;
    use crate::testutil::CWD_LOCK;

    fn run(registry: &Registry, name: &str, args: &[&str]) -> Result<String, BuiltinError> {
        let builtin = registry.get(name).expect("builtin should be registered");
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let mut out = Vec::new();
        builtin.run(&args, &mut empty(), &mut out)?;
        Ok(String::from_utf8(out).expect("utf8"))
    }

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::new(PathBuf::from("/"));
        for name in &["cd", "pwd", "echo", "kill", "ps"] {
            assert_eq!(registry.get(name).map(|b| b.name()), Some(*name));
        }
        assert!(registry.get("ls").is_none());
    }

    #[test]
    fn test_echo_joins_with_single_space() {
        let mut out = Vec::new();
        let args = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        Echo.run(&args, &mut empty(), &mut out).unwrap();
        assert_eq!(out, b"a b c\n");

        let mut out = Vec::new();
        Echo.run(&[], &mut empty(), &mut out).unwrap();
        assert_eq!(out, b"\n");
    }

    #[test]
    fn test_cd_and_pwd() {
        let _lock = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let previous = env::current_dir().unwrap();
        let registry = Registry::new(PathBuf::from("/tmp"));

        run(&registry, "cd", &["/"]).unwrap();
        assert_eq!(run(&registry, "pwd", &[]).unwrap(), "/\n");

        let err = run(&registry, "cd", &["/nonexistent-path-for-pipesh"]).unwrap_err();
        assert!(matches!(err, BuiltinError::ChangeDir { .. }));
        assert_eq!(run(&registry, "pwd", &[]).unwrap(), "/\n");

        env::set_current_dir(previous).unwrap();
    }

    #[test]
    fn test_cd_defaults_to_home() {
        let _lock = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let previous = env::current_dir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let registry = Registry::new(home.path().to_path_buf());

        run(&registry, "cd", &[]).unwrap();
        assert_eq!(
            env::current_dir().unwrap().canonicalize().unwrap(),
            home.path().canonicalize().unwrap()
        );

        env::set_current_dir(previous).unwrap();
    }

    #[test]
    fn test_kill_arguments() {
        let registry = Registry::new(PathBuf::from("/"));

        assert!(matches!(
            run(&registry, "kill", &[]),
            Err(BuiltinError::MissingPid)
        ));
        assert!(matches!(
            run(&registry, "kill", &["abc"]),
            Err(BuiltinError::InvalidPid { .. })
        ));
        assert!(matches!(
            run(&registry, "kill", &["0"]),
            Err(BuiltinError::Signal(_))
        ));
    }

    #[test]
    fn test_kill_terminates_process() {
        let registry = Registry::new(PathBuf::from("/"));
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();

        let pid = child.id().to_string();
        run(&registry, "kill", &[pid.as_str()]).unwrap();

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn test_ps_sorted_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let proc_entry = |pid: &str, cmdline: Option<&[u8]>, comm: Option<&str>| {
            let dir = root.path().join(pid);
            fs::create_dir(&dir).unwrap();
            if let Some(cmdline) = cmdline {
                fs::write(dir.join("cmdline"), cmdline).unwrap();
            }
            if let Some(comm) = comm {
                fs::write(dir.join("comm"), comm).unwrap();
            }
        };

        proc_entry("10", Some(b"sleep\x0030\x00"), Some("sleep\n"));
        proc_entry("2", Some(b"/sbin/init\x00"), Some("init\n"));
        proc_entry("1", Some(b"bash\x00-l\x00"), None);
        proc_entry("3", Some(b""), Some("kworker/0:1\n"));
        proc_entry("4", None, None);
        proc_entry("self", Some(b"ignored\x00"), None);
        fs::write(root.path().join("5"), "not a process").unwrap();

        let mut out = Vec::new();
        Ps::with_root(root.path())
            .run(&[], &mut empty(), &mut out)
            .unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "1 bash -l\n2 /sbin/init\n3 kworker/0:1\n10 sleep 30\n"
        );
    }

    #[test]
    fn test_ps_missing_root() {
        let result = Ps::with_root("/nonexistent-proc-root").run(&[], &mut empty(), &mut sink());
        assert!(matches!(result, Err(BuiltinError::Io(_))));
    }
}
