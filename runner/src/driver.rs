use std::{
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::ExitStatus,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use common::config::{
    channel::DEFAULT_CAPACITY,
    driver::{DEFAULT_BATCH_TIMEOUT, DEFAULT_RSS_LIMIT_MB},
};
use ipc::{
    channel::{Blob, BlobChannel, ChannelError, TAG_BATCH_DONE},
    message::{BatchExecutor, BatchOutcome, ExecutionRequest, ExecutionResult, Failure, FailureKind},
    shmem::ShmRegion,
};
use nix::sys::signal::Signal;
use thiserror::Error;

use crate::{
    command::{wait_with_deadline, TargetCommand, WaitOutcome},
    fork_server::{ForkServer, RunStatus},
};

pub const ENV_SHM_REQUEST: &str = "SKADI_SHM_REQ";
pub const ENV_SHM_RESULT: &str = "SKADI_SHM_RES";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("batch of {requests} requests exceeds the request channel capacity")]
    BatchOverflow { requests: usize },
    #[error("request channel: {0}")]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub command: TargetCommand,
    /// directory holding the fork server fifos
    pub runtime_dir: PathBuf,
    /// namespaces the shm objects and fifos of one shard
    pub prefix: String,
    pub channel_capacity: usize,
    pub batch_timeout: Duration,
    pub use_fork_server: bool,
}

impl DriverConfig {
    pub fn new(command: TargetCommand, runtime_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            command: command.rss_limit_mb(DEFAULT_RSS_LIMIT_MB),
            runtime_dir: runtime_dir.into(),
            prefix: prefix.into(),
            channel_capacity: DEFAULT_CAPACITY,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            use_fork_server: true,
        }
    }
}

enum RunOutcome {
    Exited(ExitStatus),
    TimedOut,
    ForkDone,
    ForkDied,
}

/// Runs execution batches against the target process: requests go out over
/// one shared-memory blob channel, results come back over a second one. A
/// fork server is used when the target speaks the handshake protocol,
/// otherwise every batch spawns a fresh process.
pub struct ProcessDriver {
    config: DriverConfig,
    /// target command with the shm environment baked in
    command: TargetCommand,
    request_channel: BlobChannel,
    result_channel: BlobChannel,
    fork_server: Option<ForkServer>,
    /// set after a failed handshake so we probe only once
    fork_server_unsupported: bool,
}

impl ProcessDriver {
    pub fn new(config: DriverConfig) -> Result<Self> {
        let request_region = Arc::new(
            ShmRegion::create(&format!("{}-req", config.prefix), config.channel_capacity)
                .context("create request channel region")?,
        );
        let result_region = Arc::new(
            ShmRegion::create(&format!("{}-res", config.prefix), config.channel_capacity)
                .context("create result channel region")?,
        );

        let request_name = request_region
            .name()
            .context("request region has no shm name")?
            .to_string();
        let result_name = result_region
            .name()
            .context("result region has no shm name")?
            .to_string();

        let command = config
            .command
            .clone()
            .env(ENV_SHM_REQUEST, request_name)
            .env(ENV_SHM_RESULT, result_name);

        let request_channel = BlobChannel::create(request_region)?;
        let result_channel = BlobChannel::create(result_region)?;

        Ok(Self {
            config,
            command,
            request_channel,
            result_channel,
            fork_server: None,
            fork_server_unsupported: false,
        })
    }

    pub fn command(&self) -> &TargetCommand {
        &self.command
    }

    fn write_requests(&mut self, batch: &[ExecutionRequest]) -> Result<()> {
        for request in batch {
            let blob = request.to_blob().context("encode execution request")?;
            match self.request_channel.write(blob.tag, &blob.data) {
                Ok(()) => {}
                Err(ChannelError::Full) => {
                    return Err(DriverError::BatchOverflow {
                        requests: batch.len(),
                    }
                    .into());
                }
                Err(e) => return Err(DriverError::Channel(e).into()),
            }
        }
        self.request_channel.finish();

        Ok(())
    }

    /// lazily probe for fork server support on the first batch
    fn fork_server(&mut self) -> Result<Option<&mut ForkServer>> {
        if !self.config.use_fork_server || self.fork_server_unsupported {
            return Ok(None);
        }

        let alive = self.fork_server.as_mut().is_some_and(ForkServer::is_alive);
        if !alive {
            let mut fork_server = ForkServer::new();
            let started = fork_server
                .start(&self.config.runtime_dir, &self.config.prefix, &self.command)
                .context("start fork server")?;

            if started {
                self.fork_server = Some(fork_server);
            } else {
                log::info!("target does not support the fork server protocol, using process-per-batch mode");
                self.fork_server_unsupported = true;
                self.fork_server = None;
                return Ok(None);
            }
        }

        Ok(self.fork_server.as_mut())
    }

    fn run_target(&mut self) -> Result<RunOutcome> {
        let timeout = self.config.batch_timeout;

        if let Some(fork_server) = self.fork_server()? {
            return Ok(match fork_server.request_run(timeout)? {
                RunStatus::Done => RunOutcome::ForkDone,
                RunStatus::Died => RunOutcome::ForkDied,
                RunStatus::TimedOut => {
                    fork_server.shutdown();
                    RunOutcome::TimedOut
                }
            });
        }

        let mut child = self.command.spawn().context("launch target process")?;
        match wait_with_deadline(&mut child, Instant::now() + timeout)? {
            WaitOutcome::Exited(status) => Ok(RunOutcome::Exited(status)),
            WaitOutcome::TimedOut => Ok(RunOutcome::TimedOut),
        }
    }

    fn classify(&self, outcome: RunOutcome, batch_complete: bool) -> Option<Failure> {
        let fault = |kind, diagnostic: String| Some(Failure { kind, diagnostic });

        match outcome {
            RunOutcome::TimedOut => fault(FailureKind::Hang, "batch deadline exceeded".into()),
            RunOutcome::ForkDied => fault(
                FailureKind::Crash,
                "fork server target died mid-batch".into(),
            ),
            RunOutcome::ForkDone if batch_complete => None,
            RunOutcome::ForkDone => fault(
                FailureKind::Crash,
                "target acknowledged the batch without completing it".into(),
            ),
            RunOutcome::Exited(status) => {
                if let Some(signal) = status.signal() {
                    // with an address-space ceiling installed, allocation
                    // failure surfaces as an abort
                    if signal == Signal::SIGABRT as i32 && self.command.rss_limit().is_some() {
                        return fault(FailureKind::Oom, format!("killed by signal {signal}"));
                    }
                    return fault(FailureKind::Crash, format!("killed by signal {signal}"));
                }

                match status.code() {
                    Some(0) if batch_complete => None,
                    Some(0) => fault(
                        FailureKind::Crash,
                        "target exited before completing the batch".into(),
                    ),
                    Some(code) => fault(FailureKind::Crash, format!("exit code {code}")),
                    None => fault(FailureKind::Crash, "unknown exit status".into()),
                }
            }
        }
    }
}

impl BatchExecutor for ProcessDriver {
    fn execute_batch(&mut self, batch: &[ExecutionRequest]) -> Result<BatchOutcome> {
        self.request_channel.reset();
        self.result_channel.reset();

        self.write_requests(batch)?;
        let outcome = self.run_target()?;
        let (results, batch_complete) = drain_results(&mut self.result_channel);
        let fault = self.classify(outcome, batch_complete);

        if fault.is_some() {
            // a dead or wedged target invalidates the fork server session
            if let Some(fork_server) = &mut self.fork_server {
                fork_server.shutdown();
            }
            self.fork_server = None;
        }

        Ok(BatchOutcome { results, fault })
    }
}

/// decode everything the target published; malformed records are dropped,
/// a corrupt channel truncates the batch instead of failing it
fn drain_results(channel: &mut BlobChannel) -> (Vec<ExecutionResult>, bool) {
    let mut results = vec![];
    let mut complete = false;

    loop {
        let blob = match channel.try_read() {
            Ok(Some(blob)) => blob,
            Ok(None) => break,
            Err(e) => {
                log::warn!("result channel corrupt, truncating batch: {}", e);
                break;
            }
        };

        if blob.tag == TAG_BATCH_DONE {
            complete = true;
            break;
        }

        match decode_result(&blob) {
            Ok(result) => results.push(result),
            Err(e) => log::warn!("dropping malformed result record (tag {}): {}", blob.tag, e),
        }
    }

    (results, complete)
}

fn decode_result(blob: &Blob) -> Result<ExecutionResult> {
    let result = ExecutionResult::from_blob(blob)?;
    if result.seq != blob.tag {
        anyhow::bail!("sequence {} does not match record tag {}", result.seq, blob.tag);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use ipc::message::ExecStats;
    use pretty_assertions::assert_eq;

    use super::*;

    fn channel_pair(len: usize) -> (BlobChannel, BlobChannel) {
        let region = Arc::new(ShmRegion::anonymous(len).unwrap());
        let writer = BlobChannel::create(region.clone()).unwrap();
        let reader = BlobChannel::attach(region).unwrap();
        (writer, reader)
    }

    fn result(seq: u64) -> ExecutionResult {
        ExecutionResult {
            seq,
            features: vec![seq as u8],
            stats: ExecStats::default(),
            failure: None,
        }
    }

    #[test]
    fn drain_decodes_until_batch_done() {
        let (writer, mut reader) = channel_pair(1 << 16);

        for seq in 0..3 {
            let blob = result(seq).to_blob().unwrap();
            writer.write(blob.tag, &blob.data).unwrap();
        }
        writer.write(TAG_BATCH_DONE, &[]).unwrap();

        let (results, complete) = drain_results(&mut reader);
        assert!(complete);
        assert_eq!(results, vec![result(0), result(1), result(2)]);
    }

    #[test]
    fn drain_drops_malformed_records() {
        let (writer, mut reader) = channel_pair(1 << 16);

        let blob = result(1).to_blob().unwrap();
        writer.write(blob.tag, &blob.data).unwrap();
        writer.write(2, &[0xff; 5]).unwrap();
        writer.write(TAG_BATCH_DONE, &[]).unwrap();

        let (results, complete) = drain_results(&mut reader);
        assert!(complete);
        assert_eq!(results, vec![result(1)]);
    }

    #[test]
    fn drain_without_marker_is_incomplete() {
        let (writer, mut reader) = channel_pair(1 << 16);

        let blob = result(1).to_blob().unwrap();
        writer.write(blob.tag, &blob.data).unwrap();

        let (results, complete) = drain_results(&mut reader);
        assert!(!complete);
        assert_eq!(results.len(), 1);
    }

    fn driver(command: TargetCommand) -> ProcessDriver {
        let dir = std::env::temp_dir();
        let prefix = format!("skadi-driver-test-{}-{:x}", std::process::id(), fastrand_seed());

        let mut config = DriverConfig::new(command, dir, prefix);
        config.use_fork_server = false;
        config.batch_timeout = Duration::from_millis(500);
        config.channel_capacity = 1 << 16;

        ProcessDriver::new(config).unwrap()
    }

    fn fastrand_seed() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64
    }

    #[test]
    fn fork_server_fallback_is_decided_once() {
        let dir = std::env::temp_dir();
        let prefix = format!("skadi-driver-fsfb-{}-{:x}", std::process::id(), fastrand_seed());

        let mut config = DriverConfig::new(TargetCommand::new("/bin/true"), dir, prefix);
        config.batch_timeout = Duration::from_millis(500);
        config.channel_capacity = 1 << 16;
        let mut driver = ProcessDriver::new(config).unwrap();

        let batch = [ExecutionRequest {
            seq: 0,
            input: vec![],
        }];

        // /bin/true never answers the handshake, the driver drops to
        // process-per-batch mode and stays there
        let outcome = driver.execute_batch(&batch).unwrap();
        assert_eq!(outcome.fault.unwrap().kind, FailureKind::Crash);
        assert!(driver.fork_server_unsupported);
        assert!(driver.fork_server.is_none());

        let outcome = driver.execute_batch(&batch).unwrap();
        assert_eq!(outcome.fault.unwrap().kind, FailureKind::Crash);
    }

    #[test]
    fn silent_exit_is_a_crash_fault() {
        let mut driver = driver(TargetCommand::new("/bin/true"));
        let batch = [ExecutionRequest {
            seq: 0,
            input: b"input".to_vec(),
        }];

        let outcome = driver.execute_batch(&batch).unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.fault.unwrap().kind, FailureKind::Crash);
    }

    #[test]
    fn hanging_target_is_a_hang_fault() {
        let mut driver = driver(TargetCommand::new("/bin/sleep").arg("30"));
        let batch = [ExecutionRequest {
            seq: 0,
            input: vec![],
        }];

        let outcome = driver.execute_batch(&batch).unwrap();
        assert_eq!(outcome.fault.unwrap().kind, FailureKind::Hang);
    }

    #[test]
    fn nonzero_exit_is_a_crash_fault() {
        let mut driver = driver(TargetCommand::new("/bin/sh").arg("-c").arg("exit 3"));
        let batch = [ExecutionRequest {
            seq: 0,
            input: vec![],
        }];

        let outcome = driver.execute_batch(&batch).unwrap();
        let fault = outcome.fault.unwrap();
        assert_eq!(fault.kind, FailureKind::Crash);
        assert_eq!(fault.diagnostic, "exit code 3");
    }
}
