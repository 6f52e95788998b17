//! The uniform interface every backend implements.
//!
//! A [`BoxManager`] multiplexes many kernels behind one registry: `start`
//! spawns (or re-attaches to) a kernel and hands back a [`CodeBox`],
//! `shutdown` tears one down, `shutdown_all` drains the registry. Use
//! [`run_scoped`] when a kernel should never outlive one unit of work.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::BoxResult;
use crate::output::ExecutionOutput;

/// Options for starting (or re-attaching to) a kernel.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Kernel id to start or re-attach to. A fresh uuid4 is generated when
    /// absent.
    pub kernel_id: Option<String>,
    /// Working directory for the kernel process.
    pub cwd: Option<String>,
    /// Username recorded against the kernel (gateway backends forward it
    /// as `KERNEL_USERNAME`).
    pub username: Option<String>,
    /// Extra environment for the kernel process.
    pub env: BTreeMap<String, Value>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel_id(mut self, kernel_id: impl Into<String>) -> Self {
        self.kernel_id = Some(kernel_id.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A handle to one kernel that can execute code.
#[async_trait]
pub trait CodeBox: Send + Sync {
    /// The kernel this box is attached to.
    fn kernel_id(&self) -> &str;

    /// Execute `code` with the backend's default deadline and return the
    /// folded output.
    ///
    /// A kernel-reported failure surfaces as [`crate::BoxError::Execution`].
    async fn execute(&self, code: &str) -> BoxResult<ExecutionOutput>;

    /// Execute `code`, bounding the whole exchange by `deadline`.
    async fn execute_with_deadline(
        &self,
        code: &str,
        deadline: Duration,
    ) -> BoxResult<ExecutionOutput>;
}

/// Kernel lifecycle manager.
#[async_trait]
pub trait BoxManager: Send + Sync {
    type Box: CodeBox;

    /// Start a new kernel, or re-attach when `opts.kernel_id` names one that
    /// is already running under this manager.
    async fn start(&self, opts: StartOptions) -> BoxResult<Self::Box>;

    /// Shut a kernel down. An unknown id logs a warning and succeeds, so
    /// teardown paths stay idempotent.
    async fn shutdown(&self, kernel_id: &str) -> BoxResult<()>;

    /// Shut down every kernel this manager started.
    async fn shutdown_all(&self) -> BoxResult<()>;
}

/// Run `work` against a freshly started box and shut the kernel down on
/// every exit path, success and error alike.
///
/// The shutdown error (if any) is logged rather than returned so it never
/// masks the outcome of `work`.
pub async fn run_scoped<M, F, Fut, T>(manager: &M, opts: StartOptions, work: F) -> BoxResult<T>
where
    M: BoxManager,
    F: FnOnce(M::Box) -> Fut,
    Fut: Future<Output = BoxResult<T>>,
{
    let sandbox = manager.start(opts).await?;
    let kernel_id = sandbox.kernel_id().to_string();

    let outcome = work(sandbox).await;

    if let Err(err) = manager.shutdown(&kernel_id).await {
        warn!(%kernel_id, error = %err, "failed to shut down scoped kernel");
    }
    outcome
}
