//! Fork/join launcher for worker processes.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult, WorkerFailure};

/// Environment variable overriding the worker executable.
pub const WORKER_BIN_ENV: &str = "KOOP_WORKER_BIN";
/// Set on every worker to its index within the pool.
pub const WORKER_INDEX_ENV: &str = "KOOP_WORKER_INDEX";

/// Program and arguments shared by every worker in a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn spawn(&self, index: usize) -> EngineResult<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_INDEX_ENV, index.to_string())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                index,
                program: self.program.display().to_string(),
                source,
            })
    }
}

/// The `koop-worker` executable: `KOOP_WORKER_BIN` if set, otherwise the
/// binary next to the running one.
pub fn worker_executable() -> EngineResult<PathBuf> {
    if let Some(path) = std::env::var_os(WORKER_BIN_ENV) {
        return Ok(PathBuf::from(path));
    }
    let current = std::env::current_exe()?;
    let dir = current
        .parent()
        .ok_or_else(|| EngineError::Config(format!("{} has no parent directory", current.display())))?;
    Ok(dir.join(format!("koop-worker{}", std::env::consts::EXE_SUFFIX)))
}

fn failure(pid: u32, status: ExitStatus) -> Option<WorkerFailure> {
    if status.success() {
        return None;
    }
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    Some(WorkerFailure::exited(pid, status.code(), signal))
}

/// A launched worker that can be reaped.
trait WorkerHandle {
    fn pid(&self) -> u32;
    fn wait(&mut self) -> io::Result<ExitStatus>;
}

impl WorkerHandle for Child {
    fn pid(&self) -> u32 {
        self.id()
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Child::wait(self)
    }
}

/// Wait on every worker in turn. A failed wait is recorded like a failed
/// exit so the remaining workers are still reaped.
fn join_all<H: WorkerHandle>(handles: Vec<H>) -> Vec<WorkerFailure> {
    let mut failures = Vec::new();
    for mut handle in handles {
        let pid = handle.pid();
        match handle.wait() {
            Ok(status) => match failure(pid, status) {
                Some(failed) => {
                    warn!(pid, status = %status, "worker failed");
                    failures.push(failed);
                }
                None => info!(pid, "worker finished"),
            },
            Err(err) => {
                error!(pid, error = %err, "failed to wait on worker");
                failures.push(WorkerFailure::unwaited(pid, &err));
            }
        }
    }
    failures
}

/// Launch `n_processes` workers and wait for all of them.
///
/// Every launched worker is waited on even when others fail; the error then
/// names each failed process.
pub fn run_workers(command: &WorkerCommand, n_processes: usize) -> EngineResult<()> {
    let mut children = Vec::with_capacity(n_processes);
    let mut spawn_error = None;
    for index in 0..n_processes {
        match command.spawn(index) {
            Ok(child) => {
                info!(worker = index, pid = child.id(), program = %command.program.display(), "worker started");
                children.push(child);
            }
            Err(err) => {
                error!(worker = index, error = %err, "failed to start worker");
                spawn_error = Some(err);
                break;
            }
        }
    }

    let failures = join_all(children);
    if let Some(err) = spawn_error {
        return Err(err);
    }
    if !failures.is_empty() {
        return Err(EngineError::WorkersFailed { failures });
    }
    Ok(())
}
