//! Worker process management.
//!
//! [`ProcessSpawner`] is the seam between a trial and the operating system so
//! the lifecycle can be exercised without real simulators. A
//! [`ProcessGroup`] owns everything a trial started and hard-kills it exactly
//! once, either explicitly or when the group is dropped on an error path.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{debug, info, warn};

use crate::SweepError;

/// A fully resolved command line for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Short role name used in logs, e.g. `simulator` or `plotter:cycle0`
    pub label: String,
    pub program: String,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `true` if `flag` appears and is followed by `value`.
    pub fn has_flag_value(&self, flag: &str, value: &str) -> bool {
        self.args
            .windows(2)
            .any(|pair| pair[0] == *flag && pair[1] == *value)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// A started process that can be force-terminated.
pub trait ManagedProcess: Send {
    fn label(&self) -> &str;
    fn id(&self) -> Option<u32>;
    /// Hard termination; must tolerate a process that already exited.
    fn kill(&mut self) -> io::Result<()>;
}

pub trait ProcessSpawner {
    fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>, SweepError>;
}

/// Spawns real OS processes in a fixed working directory.
///
/// Worker stdout is discarded; stderr is inherited so worker logs stay visible.
#[derive(Debug, Clone)]
pub struct SystemSpawner {
    working_dir: PathBuf,
}

impl SystemSpawner {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>, SweepError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SweepError::Launch {
                label: spec.label.clone(),
                source,
            })?;

        info!(label = %spec.label, pid = child.id(), "launched {spec}");
        Ok(Box::new(SystemProcess {
            label: spec.label.clone(),
            child,
        }))
    }
}

struct SystemProcess {
    label: String,
    child: Child,
}

impl ManagedProcess for SystemProcess {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => {}
            // Already exited and reaped.
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
            Err(err) => return Err(err),
        }
        // SIGKILL cannot be ignored, so reaping returns promptly.
        let status = self.child.wait()?;
        debug!(label = %self.label, %status, "process reaped");
        Ok(())
    }
}

/// Every process one trial started, terminated exactly once.
#[derive(Default)]
pub struct ProcessGroup {
    members: Vec<Box<dyn ManagedProcess>>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, process: Box<dyn ManagedProcess>) {
        self.members.push(process);
    }

    /// Spawns `spec` and adopts the process.
    pub fn launch(&mut self, spawner: &dyn ProcessSpawner, spec: &CommandSpec) -> Result<(), SweepError> {
        let process = spawner.spawn(spec)?;
        self.push(process);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Kills and releases every member. Returns how many were terminated.
    ///
    /// Kill failures are logged; the member is released either way.
    pub fn terminate_all(&mut self) -> usize {
        let members = std::mem::take(&mut self.members);
        let count = members.len();
        for mut process in members {
            if let Err(err) = process.kill() {
                warn!(label = process.label(), "failed to kill process: {err}");
            }
        }
        if count > 0 {
            info!("terminated {count} processes");
        }
        count
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording spawner for lifecycle tests.

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct Journal {
        pub attempts: usize,
        pub spawned: Vec<CommandSpec>,
        pub killed: Vec<String>,
    }

    /// Spawns nothing; records spawns and kills, optionally failing the n-th attempt.
    #[derive(Clone, Default)]
    pub struct MockSpawner {
        pub journal: Arc<Mutex<Journal>>,
        pub fail_on: Option<usize>,
        /// Called after every successful spawn
        pub on_spawn: Option<Arc<dyn Fn(&CommandSpec) + Send + Sync>>,
    }

    impl MockSpawner {
        pub fn failing_on(index: usize) -> Self {
            Self {
                fail_on: Some(index),
                ..Self::default()
            }
        }

        pub fn spawned_labels(&self) -> Vec<String> {
            let journal = self.journal.lock().unwrap();
            journal.spawned.iter().map(|spec| spec.label.clone()).collect()
        }

        pub fn killed(&self) -> Vec<String> {
            self.journal.lock().unwrap().killed.clone()
        }
    }

    struct MockProcess {
        label: String,
        journal: Arc<Mutex<Journal>>,
    }

    impl ManagedProcess for MockProcess {
        fn label(&self) -> &str {
            &self.label
        }

        fn id(&self) -> Option<u32> {
            None
        }

        fn kill(&mut self) -> io::Result<()> {
            self.journal.lock().unwrap().killed.push(self.label.clone());
            Ok(())
        }
    }

    impl ProcessSpawner for MockSpawner {
        fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>, SweepError> {
            let attempt = {
                let mut journal = self.journal.lock().unwrap();
                journal.attempts += 1;
                journal.attempts - 1
            };
            if self.fail_on == Some(attempt) {
                return Err(SweepError::Launch {
                    label: spec.label.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "no such program"),
                });
            }
            self.journal.lock().unwrap().spawned.push(spec.clone());
            if let Some(hook) = &self.on_spawn {
                hook(spec);
            }
            Ok(Box::new(MockProcess {
                label: spec.label.clone(),
                journal: Arc::clone(&self.journal),
            }))
        }
    }
}
