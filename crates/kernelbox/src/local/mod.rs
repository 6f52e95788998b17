//! Local backend: kernels are Python child processes owned by the manager.
//!
//! Each kernel runs an embedded driver program that speaks line-delimited
//! Jupyter-style envelopes over stdin/stdout, so execution results fold
//! through the same [`OutputCollector`] the gateway backend uses. The
//! manager keeps a registry of running kernels; children are spawned with
//! `kill_on_drop` so dropping the manager never leaks processes.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BoxError, BoxResult};
use crate::manager::{BoxManager, CodeBox, StartOptions};
use crate::output::{decode_frame, Collect, ExecutionOutput, OutputCollector};
use crate::schema::{ExecutionRequest, ExecutionResponse, ExecutionState, KernelMessage};

/// Driver program executed by the kernel child process.
const DRIVER_SOURCE: &str = include_str!("driver.py");

/// How long shutdown waits for a kernel to exit after its stdin closes
/// before resorting to a kill (milliseconds).
const SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Configuration for the local backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalConfig {
    /// Python interpreter used to run kernels.
    pub python: PathBuf,
    /// Maximum wall-clock time to wait for a kernel's readiness handshake
    /// (milliseconds).
    pub startup_timeout_ms: u64,
    /// Default deadline for one execution (milliseconds).
    pub execute_timeout_ms: u64,
    /// Environment merged into every kernel process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            startup_timeout_ms: 10_000,
            execute_timeout_ms: 60_000,
            env: BTreeMap::new(),
        }
    }
}

/// One running kernel: the child process plus its protocol channel.
struct KernelChannel {
    kernel_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
}

impl KernelChannel {
    /// Read the next protocol frame. `None` means the child closed stdout.
    async fn read_frame(&mut self) -> BoxResult<Option<ExecutionResponse>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode_frame(&line).map(Some),
            }
        }
    }

    async fn send(&mut self, request: &ExecutionRequest) -> BoxResult<()> {
        let mut payload = serde_json::to_string(request)?;
        payload.push('\n');
        let stdin = self.stdin.as_mut().ok_or_else(|| missing_pipe("stdin"))?;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Send an interrupt to abort the in-flight execution.
    #[cfg(unix)]
    fn interrupt(&self) {
        if let Some(pid) = self.child.id() {
            // The driver catches KeyboardInterrupt and reports it as an
            // execution error, keeping the kernel alive.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
            info!(kernel_id = %self.kernel_id, "interrupt signal sent");
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) {
        warn!(kernel_id = %self.kernel_id, "interrupt signal is not supported on this platform");
    }

    /// Tear the kernel down: close stdin so the driver's read loop ends and
    /// the interpreter unwinds (atexit hooks, buffered writes), then kill it
    /// if it does not exit within the grace period.
    async fn terminate(&mut self) {
        drop(self.stdin.take());
        match timeout(Duration::from_millis(SHUTDOWN_GRACE_MS), self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(kernel_id = %self.kernel_id, %status, "kernel exited after stdin close");
            }
            Ok(Err(err)) => {
                warn!(kernel_id = %self.kernel_id, error = %err, "failed to reap kernel process");
            }
            Err(_) => {
                warn!(kernel_id = %self.kernel_id, "kernel did not exit after stdin close, killing");
                if let Err(err) = self.child.kill().await {
                    warn!(kernel_id = %self.kernel_id, error = %err, "failed to kill kernel process");
                }
            }
        }
    }
}

/// Manager that spawns and owns local kernel processes.
pub struct LocalBoxManager {
    config: LocalConfig,
    registry: Arc<Mutex<HashMap<String, Arc<Mutex<KernelChannel>>>>>,
}

impl LocalBoxManager {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Kernel ids currently registered with this manager.
    pub async fn kernel_ids(&self) -> Vec<String> {
        self.registry.lock().await.keys().cloned().collect()
    }

    /// Whether `kernel_id` is registered with this manager.
    pub async fn contains(&self, kernel_id: &str) -> bool {
        self.registry.lock().await.contains_key(kernel_id)
    }

    async fn spawn_kernel(&self, kernel_id: &str, opts: &StartOptions) -> BoxResult<KernelChannel> {
        debug!(%kernel_id, "starting new kernel");

        let mut command = Command::new(&self.config.python);
        command
            .arg("-u")
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for (key, value) in &self.config.env {
            command.env(key, value);
        }
        for (key, value) in &opts.env {
            command.env(key, env_value_to_string(value));
        }
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| missing_pipe("stdout"))?;

        let mut channel = KernelChannel {
            kernel_id: kernel_id.to_string(),
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
        };

        self.await_ready(&mut channel).await?;
        Ok(channel)
    }

    /// Wait for the driver's readiness handshake: a `status: idle` frame
    /// under a `kernel_info_request` parent.
    async fn await_ready(&self, channel: &mut KernelChannel) -> BoxResult<()> {
        let limit = Duration::from_millis(self.config.startup_timeout_ms);
        let handshake = async {
            loop {
                let Some(frame) = channel.read_frame().await? else {
                    return Err(kernel_exited(channel));
                };
                if frame.parent_header.msg_type != "kernel_info_request" {
                    warn!(msg_type = frame.msg_type(), "unexpected init message");
                    continue;
                }
                if let KernelMessage::Status(status) = frame.message()? {
                    if status.execution_state == ExecutionState::Idle {
                        return Ok(());
                    }
                }
            }
        };
        timeout(limit, handshake).await.map_err(|_| {
            BoxError::StartupTimeout {
                limit_ms: self.config.startup_timeout_ms,
            }
        })?
    }
}

impl Default for LocalBoxManager {
    fn default() -> Self {
        Self::new(LocalConfig::default())
    }
}

#[async_trait]
impl BoxManager for LocalBoxManager {
    type Box = LocalBox;

    async fn start(&self, opts: StartOptions) -> BoxResult<LocalBox> {
        let kernel_id = opts
            .kernel_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut registry = self.registry.lock().await;
        if let Some(channel) = registry.get(&kernel_id) {
            // Starting an id that is already running re-attaches to it.
            debug!(%kernel_id, "kernel already running, re-attaching");
            return Ok(LocalBox {
                kernel_id,
                channel: Arc::clone(channel),
                default_deadline: Duration::from_millis(self.config.execute_timeout_ms),
            });
        }

        let channel = Arc::new(Mutex::new(self.spawn_kernel(&kernel_id, &opts).await?));
        registry.insert(kernel_id.clone(), Arc::clone(&channel));
        info!(%kernel_id, "started kernel");

        Ok(LocalBox {
            kernel_id,
            channel,
            default_deadline: Duration::from_millis(self.config.execute_timeout_ms),
        })
    }

    async fn shutdown(&self, kernel_id: &str) -> BoxResult<()> {
        let removed = self.registry.lock().await.remove(kernel_id);
        match removed {
            None => {
                warn!(%kernel_id, "kernel not found");
                Ok(())
            }
            Some(channel) => {
                channel.lock().await.terminate().await;
                info!(%kernel_id, "kernel shut down");
                Ok(())
            }
        }
    }

    async fn shutdown_all(&self) -> BoxResult<()> {
        let drained: Vec<_> = self.registry.lock().await.drain().collect();
        info!(count = drained.len(), "shutting down all kernels");
        for (kernel_id, channel) in drained {
            channel.lock().await.terminate().await;
            debug!(%kernel_id, "kernel shut down");
        }
        Ok(())
    }
}

/// Handle to one local kernel.
pub struct LocalBox {
    kernel_id: String,
    channel: Arc<Mutex<KernelChannel>>,
    default_deadline: Duration,
}

#[async_trait]
impl CodeBox for LocalBox {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    async fn execute(&self, code: &str) -> BoxResult<ExecutionOutput> {
        self.execute_with_deadline(code, self.default_deadline).await
    }

    async fn execute_with_deadline(
        &self,
        code: &str,
        deadline: Duration,
    ) -> BoxResult<ExecutionOutput> {
        let request = ExecutionRequest::of_code(code);
        debug!(kernel_id = %self.kernel_id, msg_id = request.msg_id(), "executing code");

        let mut channel = self.channel.lock().await;
        channel.send(&request).await?;

        let mut collector = OutputCollector::new(request.msg_id());
        let started = Instant::now();
        loop {
            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                channel.interrupt();
                return Err(BoxError::ExecutionTimeout {
                    limit_ms: deadline.as_millis() as u64,
                });
            };
            let frame = match timeout(remaining, channel.read_frame()).await {
                Err(_) => {
                    channel.interrupt();
                    return Err(BoxError::ExecutionTimeout {
                        limit_ms: deadline.as_millis() as u64,
                    });
                }
                Ok(read) => read?,
            };
            let Some(frame) = frame else {
                return Err(kernel_exited(&mut channel));
            };
            if collector.absorb(&frame)? == Collect::Done {
                break;
            }
        }
        drop(channel);

        let output = collector.finish();
        match output.error {
            Some(error) => Err(BoxError::from_error_content(error)),
            None => Ok(output),
        }
    }
}

/// Build the error for a kernel whose process is gone, harvesting the exit
/// status when it is already available.
fn kernel_exited(channel: &mut KernelChannel) -> BoxError {
    let status = match channel.child.try_wait() {
        Ok(Some(status)) => status.to_string(),
        Ok(None) => "stdout closed".to_string(),
        Err(err) => err.to_string(),
    };
    BoxError::KernelExited {
        kernel_id: channel.kernel_id.clone(),
        status,
    }
}

fn missing_pipe(name: &str) -> BoxError {
    BoxError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("kernel process has no {name} handle"),
    ))
}

fn env_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
