use std::{
    fs,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    process::Child,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use common::config::driver::{DONE_BYTE, GO_BYTE, HANDSHAKE_TIMEOUT, READY_BYTE};
use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    poll::{poll, PollFd, PollFlags},
    sys::stat::Mode,
    unistd::{close, mkfifo, read, write},
};

use crate::command::{kill_child, TargetCommand};

pub const ENV_CONTROL_FIFO: &str = "SKADI_CTL_FIFO";
pub const ENV_STATUS_FIFO: &str = "SKADI_ST_FIFO";

/// explicit fork-server lifecycle; state transitions are the only code
/// touching the OS process handle and the pipe fds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkServerState {
    NotStarted,
    Handshaking,
    Ready,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// target acknowledged batch completion
    Done,
    /// target exited or closed its pipes mid-run
    Died,
    /// no completion byte before the deadline
    TimedOut,
}

/// Persistent target process serviced over a named pipe pair: the target
/// writes a readiness byte on the status pipe once initialized, then blocks
/// on the control pipe for a "go" byte per batch and writes a completion
/// byte back after each one.
#[derive(Debug)]
pub struct ForkServer {
    state: ForkServerState,
    control_path: PathBuf,
    status_path: PathBuf,
    control_fd: Option<RawFd>,
    status_fd: Option<RawFd>,
    child: Option<Child>,
}

impl ForkServer {
    pub fn new() -> Self {
        Self {
            state: ForkServerState::NotStarted,
            control_path: PathBuf::new(),
            status_path: PathBuf::new(),
            control_fd: None,
            status_fd: None,
            child: None,
        }
    }

    pub fn state(&self) -> ForkServerState {
        self.state
    }

    /// launch the target and perform the readiness handshake; `Ok(false)`
    /// means the target does not speak the protocol and the caller must
    /// fall back to process-per-batch mode
    pub fn start(&mut self, dir: &Path, prefix: &str, command: &TargetCommand) -> Result<bool> {
        debug_assert_eq!(self.state, ForkServerState::NotStarted);

        self.control_path = dir.join(format!("{prefix}-ctl.pipe"));
        self.status_path = dir.join(format!("{prefix}-st.pipe"));

        for path in [&self.control_path, &self.status_path] {
            let _ = fs::remove_file(path);
            mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
                .with_context(|| format!("Failed to create fifo {path:?}"))?;
        }

        // open the status read end first so the readiness byte is never lost
        let status_fd = open(
            &self.status_path,
            OFlag::O_RDONLY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .with_context(|| format!("Failed to open status fifo {:?}", self.status_path))?;
        self.status_fd = Some(status_fd);

        let command = command
            .clone()
            .env(ENV_CONTROL_FIFO, self.control_path.display().to_string())
            .env(ENV_STATUS_FIFO, self.status_path.display().to_string());
        log::debug!("starting fork server: {}", command);

        self.child = Some(command.spawn().context("launch fork server target")?);
        self.state = ForkServerState::Handshaking;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

        // wait for the readiness byte
        match self.read_status_byte(deadline)? {
            Some(READY_BYTE) => {}
            Some(byte) => {
                log::warn!("unexpected fork server handshake byte: {:#x}", byte);
                self.shutdown();
                return Ok(false);
            }
            None => {
                log::warn!("fork server handshake timed out or target died");
                self.shutdown();
                return Ok(false);
            }
        }

        // the target has its control read end open by now, keep retrying
        // until the nonblocking open stops reporting a missing reader
        loop {
            match open(
                &self.control_path,
                OFlag::O_WRONLY | OFlag::O_NONBLOCK,
                Mode::empty(),
            ) {
                Ok(fd) => {
                    self.control_fd = Some(fd);
                    break;
                }
                Err(Errno::ENXIO) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    log::warn!("failed to open control fifo: {}", e);
                    self.shutdown();
                    return Ok(false);
                }
            }
        }

        log::info!("fork server ready: {}", self.control_path.display());
        self.state = ForkServerState::Ready;

        Ok(true)
    }

    /// signal one batch execution and wait for its completion byte
    pub fn request_run(&mut self, timeout: Duration) -> Result<RunStatus> {
        debug_assert_eq!(self.state, ForkServerState::Ready);
        let control_fd = self.control_fd.context("fork server control fd missing")?;

        if let Err(e) = write(control_fd, &[GO_BYTE]) {
            log::debug!("fork server go signal failed: {}", e);
            self.shutdown();
            return Ok(RunStatus::Died);
        }

        match self.read_status_byte(Instant::now() + timeout)? {
            Some(DONE_BYTE) => Ok(RunStatus::Done),
            Some(byte) => {
                log::warn!("unexpected fork server status byte: {:#x}", byte);
                self.shutdown();
                Ok(RunStatus::Died)
            }
            None if self.child_exited() => {
                self.shutdown();
                Ok(RunStatus::Died)
            }
            None => Ok(RunStatus::TimedOut),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        self.state == ForkServerState::Ready && !self.child_exited()
    }

    fn child_exited(&mut self) -> bool {
        match &mut self.child {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// poll the status pipe for one byte; `None` on deadline or target death
    fn read_status_byte(&mut self, deadline: Instant) -> Result<Option<u8>> {
        let status_fd = self.status_fd.context("fork server status fd missing")?;

        loop {
            let mut poll_fd = [PollFd::new(status_fd, PollFlags::POLLIN)];
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let timeout_ms = remaining.as_millis().min(50) as i32;
            match poll(&mut poll_fd, timeout_ms) {
                Ok(0) => {
                    if self.child_exited() {
                        return Ok(None);
                    }
                }
                Ok(_) => {
                    let mut byte = [0u8; 1];
                    match read(status_fd, &mut byte) {
                        Ok(1) => return Ok(Some(byte[0])),
                        // writer closed without data, keep polling until
                        // the deadline in case it reopens
                        Ok(_) | Err(Errno::EAGAIN) => {
                            if self.child_exited() {
                                return Ok(None);
                            }
                        }
                        Err(e) => return Err(e).context("read fork server status pipe"),
                    }
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e).context("poll fork server status pipe"),
            }
        }
    }

    /// kill the target and release all handles
    pub fn shutdown(&mut self) {
        if let Some(child) = &mut self.child {
            kill_child(child);
            let _ = child.wait();
        }
        self.child = None;

        for fd in [self.control_fd.take(), self.status_fd.take()].into_iter().flatten() {
            let _ = close(fd);
        }

        for path in [&self.control_path, &self.status_path] {
            if path.as_os_str().is_empty() {
                continue;
            }
            let _ = fs::remove_file(path);
        }

        self.state = ForkServerState::Dead;
    }
}

impl Default for ForkServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ForkServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fake_target(batches: usize) -> TargetCommand {
        // minimal shell target speaking the handshake protocol; the control
        // read end stays open for the whole run like a real target's would
        let script = format!(
            r#"printf R > "${ENV_STATUS_FIFO}"
exec 3< "${ENV_CONTROL_FIFO}"
for _ in $(seq {batches}); do
    head -c1 <&3 > /dev/null
    printf D > "${ENV_STATUS_FIFO}"
done"#
        );

        TargetCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn handshake_and_repeated_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut fork_server = ForkServer::new();

        let started = fork_server
            .start(dir.path(), "skadi-test", &fake_target(3))
            .unwrap();
        assert!(started);
        assert_eq!(fork_server.state(), ForkServerState::Ready);

        for _ in 0..3 {
            let status = fork_server.request_run(Duration::from_secs(5)).unwrap();
            assert_eq!(status, RunStatus::Done);
        }
    }

    #[test]
    fn non_protocol_target_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut fork_server = ForkServer::new();

        // target that exits without ever writing the readiness byte
        let command = TargetCommand::new("/bin/true");
        let started = fork_server.start(dir.path(), "skadi-noproto", &command).unwrap();

        assert!(!started);
        assert_eq!(fork_server.state(), ForkServerState::Dead);
    }
}
