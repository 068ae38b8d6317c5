//! First-to-finish race
//!
//! A fixed set of independent contenders is polled without blocking at a
//! fixed interval. The first output accepted by the caller's predicate wins
//! and every other contender is terminated immediately. Rejected outputs are
//! collected; when every contender has finished without an accepted output
//! the race reports `AllRejected`. An outer ceiling bounds the whole race
//! independently of whatever timeout the contenders enforce themselves.
//!
//! `ProcessContender` runs each contender as an isolated OS process so that a
//! hung remote call can always be killed.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Contender: Send {
    type Output: Send;

    /// Non-blocking check. `Some` once the contender has produced its output.
    async fn poll_output(&mut self) -> Option<Self::Output>;

    /// Stop the contender and release its resources. Must be idempotent.
    async fn terminate(&mut self);
}

#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub poll_interval: Duration,
    /// Hard ceiling for the whole race.
    pub ceiling: Duration,
}

#[derive(Debug)]
pub enum RaceOutcome<T> {
    Winner { index: usize, output: T },
    AllRejected { rejected: Vec<T> },
    HardTimeout { rejected: Vec<T> },
}

/// Run the race. Every contender is terminated before this returns.
pub async fn race<C, F>(mut contenders: Vec<C>, accept: F, config: &RaceConfig) -> RaceOutcome<C::Output>
where
    C: Contender,
    F: Fn(&C::Output) -> bool,
{
    let deadline = Instant::now() + config.ceiling;
    let mut finished = vec![false; contenders.len()];
    let mut rejected = Vec::new();

    let outcome = loop {
        let mut winner = None;
        for (index, contender) in contenders.iter_mut().enumerate() {
            if finished[index] {
                continue;
            }
            if let Some(output) = contender.poll_output().await {
                finished[index] = true;
                if accept(&output) {
                    winner = Some((index, output));
                    break;
                }
                debug!("Contender {} finished with a rejected output", index);
                rejected.push(output);
            }
        }

        if let Some((index, output)) = winner {
            info!("✅ Contender {} won the race", index);
            break RaceOutcome::Winner { index, output };
        }
        if finished.iter().all(|f| *f) {
            break RaceOutcome::AllRejected { rejected };
        }
        if Instant::now() >= deadline {
            warn!("Race exceeded its {}s ceiling", config.ceiling.as_secs());
            break RaceOutcome::HardTimeout { rejected };
        }
        tokio::time::sleep(config.poll_interval).await;
    };

    for contender in contenders.iter_mut() {
        contender.terminate().await;
    }
    outcome
}

/// What a finished worker process left behind.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub status: Option<ExitStatus>,
}

/// Program plus leading arguments used to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

/// A child process fed a job on stdin whose stdout is read to EOF in the
/// background. Both pipes are driven by tasks, so a worker that never reads
/// its job cannot stall the race.
pub struct ProcessContender {
    child: Child,
    pid: Option<u32>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<std::io::Result<String>>>,
    terminated: bool,
}

impl ProcessContender {
    /// Spawn `command` with extra environment variables and write `stdin_payload`
    /// to its stdin.
    pub async fn spawn(
        command: &WorkerCommand,
        env: &[(String, String)],
        stdin_payload: &[u8],
    ) -> std::io::Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let writer = child.stdin.take().map(|mut stdin| {
            let payload = stdin_payload.to_vec();
            tokio::spawn(async move {
                // A worker that exits without reading its job closes the pipe early.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("Worker {:?} did not take its job: {}", pid, e);
                }
            })
        });
        let reader = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = String::new();
                stdout.read_to_string(&mut buf).await?;
                Ok(buf)
            })
        });

        Ok(Self { child, pid, writer, reader, terminated: false })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl Contender for ProcessContender {
    type Output = ProcessOutput;

    async fn poll_output(&mut self) -> Option<ProcessOutput> {
        let reader_done = self.reader.as_ref().map(|r| r.is_finished()).unwrap_or(true);
        if !reader_done {
            return None;
        }
        let status = match self.child.try_wait() {
            Ok(Some(status)) => Some(status),
            Ok(None) => return None,
            Err(_) => None,
        };
        let stdout = match self.reader.take() {
            Some(handle) => match handle.await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    warn!("Failed reading worker {:?} output: {}", self.pid, e);
                    String::new()
                }
                Err(e) => {
                    warn!("Worker {:?} reader task failed: {}", self.pid, e);
                    String::new()
                }
            },
            None => String::new(),
        };
        Some(ProcessOutput { stdout, status })
    }

    async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.start_kill() {
                debug!("Kill of worker {:?} failed: {}", self.pid, e);
            }
        }
        // Reap so no zombie outlives the race.
        if let Err(e) = self.child.wait().await {
            debug!("Reaping worker {:?} failed: {}", self.pid, e);
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn config(ceiling_ms: u64) -> RaceConfig {
        RaceConfig {
            poll_interval: Duration::from_millis(20),
            ceiling: Duration::from_millis(ceiling_ms),
        }
    }

    #[tokio::test]
    async fn test_first_accepted_output_wins_and_losers_die() {
        let mut contenders = Vec::new();
        for script in ["exec sleep 30", "sleep 0.2; echo done", "exec sleep 30"] {
            contenders.push(ProcessContender::spawn(&sh(script), &[], b"").await.unwrap());
        }
        let pids: Vec<u32> = contenders.iter().filter_map(|c| c.pid()).collect();

        let outcome = race(contenders, |out: &ProcessOutput| out.stdout.contains("done"), &config(10_000)).await;
        match outcome {
            RaceOutcome::Winner { index, output } => {
                assert_eq!(index, 1);
                assert_eq!(output.stdout.trim(), "done");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        #[cfg(target_os = "linux")]
        for pid in pids {
            assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists(), "pid {} still alive", pid);
        }
    }

    #[tokio::test]
    async fn test_all_rejected() {
        let mut contenders = Vec::new();
        for _ in 0..2 {
            contenders.push(ProcessContender::spawn(&sh("echo timeout"), &[], b"").await.unwrap());
        }
        let outcome = race(contenders, |out: &ProcessOutput| !out.stdout.contains("timeout"), &config(5_000)).await;
        match outcome {
            RaceOutcome::AllRejected { rejected } => assert_eq!(rejected.len(), 2),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hard_ceiling_kills_everything() {
        let contender = ProcessContender::spawn(&sh("exec sleep 30"), &[], b"").await.unwrap();
        let pid = contender.pid();
        let started = Instant::now();
        let outcome = race(vec![contender], |_: &ProcessOutput| true, &config(200)).await;
        assert!(matches!(outcome, RaceOutcome::HardTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        #[cfg(target_os = "linux")]
        if let Some(pid) = pid {
            assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
        }
    }

    #[tokio::test]
    async fn test_stdin_payload_reaches_worker() {
        let contender = ProcessContender::spawn(&sh("cat"), &[], b"{\"job\":1}").await.unwrap();
        let outcome = race(vec![contender], |_: &ProcessOutput| true, &config(5_000)).await;
        match outcome {
            RaceOutcome::Winner { output, .. } => assert_eq!(output.stdout, "{\"job\":1}"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unread_job_does_not_block_spawn() {
        let job = vec![b'x'; 4 * 1024 * 1024];
        let started = Instant::now();
        let contender = ProcessContender::spawn(&sh("exec sleep 30"), &[], &job).await.unwrap();
        let pid = contender.pid();
        let outcome = race(vec![contender], |_: &ProcessOutput| true, &config(300)).await;
        assert!(matches!(outcome, RaceOutcome::HardTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        #[cfg(target_os = "linux")]
        if let Some(pid) = pid {
            assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
        }
    }
}
