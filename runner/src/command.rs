use std::{
    fmt, fs, io,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use common::config::driver::WAIT_POLL_INTERVAL;
use nix::{
    sys::{
        resource::{setrlimit, Resource},
        signal::{kill, Signal},
    },
    unistd::Pid,
};
use thiserror::Error;

/// target binary missing or unexecutable, fatal and operator-visible
#[derive(Debug, Error)]
#[error("failed to launch target {path:?}: {source}")]
pub struct LaunchError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Argument/environment vector for the target binary. The same configured
/// command can be spawned repeatedly; every `spawn` builds a fresh process.
#[derive(Debug, Clone)]
pub struct TargetCommand {
    path: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    rss_limit_mb: Option<u64>,
}

impl fmt::Display for TargetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={value} ")?;
        }
        write!(f, "{}", self.path.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl TargetCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: vec![],
            env: vec![],
            stdout: None,
            stderr: None,
            rss_limit_mb: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// redirect target stdout/stderr to files for crash diagnostics
    pub fn output_files(mut self, stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }

    pub fn rss_limit_mb(mut self, limit_mb: u64) -> Self {
        self.rss_limit_mb = Some(limit_mb);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rss_limit(&self) -> Option<u64> {
        self.rss_limit_mb
    }

    pub fn spawn(&self) -> Result<Child, LaunchError> {
        let launch_error = |source| LaunchError {
            path: self.path.clone(),
            source,
        };

        let mut command = Command::new(&self.path);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }

        command.stdin(Stdio::null());
        command.stdout(match &self.stdout {
            Some(path) => Stdio::from(fs::File::create(path).map_err(launch_error)?),
            None => Stdio::null(),
        });
        command.stderr(match &self.stderr {
            Some(path) => Stdio::from(fs::File::create(path).map_err(launch_error)?),
            None => Stdio::null(),
        });

        if let Some(limit_mb) = self.rss_limit_mb {
            let limit = limit_mb * 1024 * 1024;
            unsafe {
                command.pre_exec(move || {
                    setrlimit(Resource::RLIMIT_AS, limit, limit)
                        .map_err(|e| io::Error::from_raw_os_error(e as i32))
                });
            }
        }

        command.spawn().map_err(launch_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    /// deadline elapsed, the process was killed forcibly
    TimedOut,
}

/// wait for process exit, killing it when the deadline elapses
pub fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Result<WaitOutcome> {
    loop {
        if let Some(status) = child.try_wait().context("wait for target process")? {
            return Ok(WaitOutcome::Exited(status));
        }

        if Instant::now() >= deadline {
            kill_child(child);
            let _ = child.wait();
            return Ok(WaitOutcome::TimedOut);
        }

        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

pub fn kill_child(child: &Child) {
    if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        log::debug!("failed to kill target process {}: {}", child.id(), e);
    }
}

/// grace period used when draining an already-signaled process
pub fn short_deadline() -> Instant {
    Instant::now() + Duration::from_millis(200)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn command_line_rendering() {
        let command = TargetCommand::new("/bin/target")
            .arg("--shard=3")
            .env("SKADI_SHM_REQ", "/skadi-req");

        assert_eq!(
            command.to_string(),
            "SKADI_SHM_REQ=/skadi-req /bin/target --shard=3"
        );
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let command = TargetCommand::new("/nonexistent/skadi-target");

        let err = command.spawn().unwrap_err();
        assert_eq!(err.path, PathBuf::from("/nonexistent/skadi-target"));
    }

    #[test]
    fn spawn_is_reinvocable() {
        let command = TargetCommand::new("/bin/true");

        for _ in 0..3 {
            let mut child = command.spawn().unwrap();
            let status = child.wait().unwrap();
            assert!(status.success());
        }
    }

    #[test]
    fn deadline_kills_hanging_process() {
        let command = TargetCommand::new("/bin/sleep").arg("30");

        let mut child = command.spawn().unwrap();
        let outcome = wait_with_deadline(&mut child, Instant::now()).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
