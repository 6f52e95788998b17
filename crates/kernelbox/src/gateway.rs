//! Remote backend: kernels hosted by a Jupyter Enterprise Gateway
//! compatible service.
//!
//! Lifecycle goes over the REST API (`POST`/`GET`/`DELETE /api/kernels`);
//! code execution goes over the kernel's WebSocket channel
//! (`/api/kernels/{id}/channels`), one connection per execution.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{BoxError, BoxResult};
use crate::manager::{BoxManager, CodeBox, StartOptions};
use crate::output::{decode_frame, Collect, ExecutionOutput, OutputCollector};
use crate::schema::{
    CreateKernelRequest, ExecutionRequest, ExecutionState, KernelInfo, KernelMessage,
};

/// The gateway reports a duplicate kernel id with this marker in a
/// non-success body instead of a dedicated status code.
const KERNEL_EXISTS_MARKER: &str = "Kernel already exists:";

/// Configuration for the gateway backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// Base URL of the gateway, e.g. `http://gateway:8888`.
    pub url: String,
    /// Environment forwarded on every kernel creation, merged with
    /// per-start env.
    #[serde(default)]
    pub kernel_env: BTreeMap<String, Value>,
    /// Deadline for one execution round trip (milliseconds).
    pub execute_timeout_ms: u64,
    /// Timeout applied to individual REST requests (milliseconds).
    pub request_timeout_ms: u64,
    /// Bound on draining a fresh kernel's init messages (milliseconds).
    pub init_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8888".to_string(),
            kernel_env: BTreeMap::new(),
            execute_timeout_ms: 300_000,
            request_timeout_ms: 60_000,
            init_timeout_ms: 15_000,
        }
    }
}

/// Manager that drives kernels hosted by an Enterprise Gateway service.
pub struct GatewayBoxManager {
    base: Url,
    client: reqwest::Client,
    config: GatewayConfig,
    registry: Arc<Mutex<HashSet<String>>>,
}

impl GatewayBoxManager {
    pub fn new(config: GatewayConfig) -> BoxResult<Self> {
        let base = Url::parse(&config.url)
            .map_err(|err| BoxError::InvalidConfig(format!("invalid gateway url: {err}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            base,
            client,
            config,
            registry: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn api_url(&self, path: &str) -> BoxResult<Url> {
        self.base
            .join(path)
            .map_err(|err| BoxError::InvalidConfig(format!("invalid api path {path}: {err}")))
    }

    /// WebSocket endpoint for a kernel's channels: same host as the REST
    /// API with the scheme flipped to `ws`/`wss`.
    fn ws_url(&self, kernel_id: &str) -> BoxResult<Url> {
        let mut url = self.api_url(&format!("/api/kernels/{kernel_id}/channels"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| BoxError::InvalidConfig(format!("cannot derive ws scheme for {url}")))?;
        Ok(url)
    }

    fn kernel_env(&self, opts: &StartOptions) -> BTreeMap<String, Value> {
        let mut env = self.config.kernel_env.clone();
        if let Some(kernel_id) = &opts.kernel_id {
            env.insert("KERNEL_ID".to_string(), Value::String(kernel_id.clone()));
        }
        if let Some(cwd) = &opts.cwd {
            env.insert("KERNEL_WORKING_DIR".to_string(), Value::String(cwd.clone()));
        }
        if let Some(username) = &opts.username {
            env.insert("KERNEL_USERNAME".to_string(), Value::String(username.clone()));
        }
        env.extend(opts.env.clone());
        env
    }

    async fn create_kernel(&self, opts: &StartOptions) -> BoxResult<KernelInfo> {
        let body = CreateKernelRequest::with_env(self.kernel_env(opts));
        debug!(payload = %serde_json::to_string(&body)?, "starting kernel");

        let response = self
            .client
            .post(self.api_url("/api/kernels")?)
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response.json().await?);
        }

        let status = response.status().as_u16();
        let text = response.text().await?;
        if text.contains(KERNEL_EXISTS_MARKER) {
            // Re-attach; the id must have been supplied for this to happen.
            let kernel_id = opts.kernel_id.as_deref().unwrap_or_default();
            debug!(%kernel_id, "kernel already exists, fetching it");
            return self.get_kernel(kernel_id).await;
        }
        Err(BoxError::Gateway { status, body: text })
    }

    async fn get_kernel(&self, kernel_id: &str) -> BoxResult<KernelInfo> {
        let response = self
            .client
            .get(self.api_url(&format!("/api/kernels/{kernel_id}"))?)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(BoxError::Gateway { status, body });
        }
        Ok(response.json().await?)
    }

    /// Drain the status burst a kernel publishes after its channel comes
    /// up: `busy` then `idle` under a `kernel_info_request` parent.
    async fn drain_init_messages(&self, ws_url: &Url) -> BoxResult<()> {
        let limit = Duration::from_millis(self.config.init_timeout_ms);
        let drain = async {
            let (mut stream, _) = connect_async(ws_url.as_str()).await?;
            let mut session: Option<String> = None;
            let mut boot_msg_id: Option<String> = None;

            while let Some(message) = stream.next().await {
                let Message::Text(raw) = message? else {
                    continue;
                };
                let frame = decode_frame(&raw)?;

                if let Some(current) = frame.header.session.clone() {
                    if let Some(first) = session.clone() {
                        if first != current {
                            warn!(%first, %current, "multiple session ids during kernel init");
                        }
                    } else {
                        session = Some(current);
                    }
                }

                if frame.msg_type() != "status"
                    || frame.parent_header.msg_type != "kernel_info_request"
                {
                    warn!(msg_type = frame.msg_type(), "unexpected init message");
                    continue;
                }
                let KernelMessage::Status(status) = frame.message()? else {
                    continue;
                };
                match status.execution_state {
                    ExecutionState::Busy => boot_msg_id = Some(frame.parent_header.msg_id.clone()),
                    ExecutionState::Idle
                        if boot_msg_id.as_deref() == Some(frame.parent_header.msg_id.as_str()) =>
                    {
                        return Ok(());
                    }
                    _ => {}
                }
            }
            Ok(())
        };
        timeout(limit, drain).await.map_err(|_| {
            BoxError::StartupTimeout {
                limit_ms: self.config.init_timeout_ms,
            }
        })?
    }
}

#[async_trait]
impl BoxManager for GatewayBoxManager {
    type Box = GatewayBox;

    async fn start(&self, opts: StartOptions) -> BoxResult<GatewayBox> {
        let kernel = self.create_kernel(&opts).await?;
        let ws_url = self.ws_url(&kernel.id)?;

        // A failure while draining init messages does not make the kernel
        // unusable; log it and move on.
        if let Err(err) = self.drain_init_messages(&ws_url).await {
            warn!(kernel_id = %kernel.id, error = %err, "error draining kernel init messages");
        }

        self.registry.lock().await.insert(kernel.id.clone());
        info!(kernel_id = %kernel.id, "started kernel");

        Ok(GatewayBox {
            kernel,
            ws_url,
            default_deadline: Duration::from_millis(self.config.execute_timeout_ms),
        })
    }

    async fn shutdown(&self, kernel_id: &str) -> BoxResult<()> {
        let response = self
            .client
            .delete(self.api_url(&format!("/api/kernels/{kernel_id}"))?)
            .send()
            .await?;

        if !response.status().is_success() {
            if response.status() == StatusCode::NOT_FOUND {
                warn!(%kernel_id, "kernel not found");
            } else {
                let status = response.status().as_u16();
                let body = response.text().await?;
                return Err(BoxError::Gateway { status, body });
            }
        }
        self.registry.lock().await.remove(kernel_id);
        info!(%kernel_id, "kernel shut down");
        Ok(())
    }

    async fn shutdown_all(&self) -> BoxResult<()> {
        let kernel_ids: Vec<String> = self.registry.lock().await.iter().cloned().collect();
        info!(count = kernel_ids.len(), "shutting down all kernels");
        for kernel_id in kernel_ids {
            self.shutdown(&kernel_id).await?;
        }
        Ok(())
    }
}

/// Handle to one gateway-hosted kernel.
pub struct GatewayBox {
    /// Kernel record as returned by the gateway.
    pub kernel: KernelInfo,
    ws_url: Url,
    default_deadline: Duration,
}

impl GatewayBox {
    async fn execute_inner(&self, request: &ExecutionRequest) -> BoxResult<ExecutionOutput> {
        debug!(kernel_id = %self.kernel.id, url = %self.ws_url, "connecting to kernel");
        let (mut stream, _) = connect_async(self.ws_url.as_str()).await?;

        stream
            .send(Message::Text(serde_json::to_string(request)?))
            .await?;

        let mut collector = OutputCollector::new(request.msg_id());
        while let Some(message) = stream.next().await {
            let frame = match message? {
                Message::Text(raw) => decode_frame(&raw)?,
                Message::Close(_) => break,
                _ => continue,
            };
            if collector.absorb(&frame)? == Collect::Done {
                let output = collector.finish();
                return match output.error {
                    Some(error) => Err(BoxError::from_error_content(error)),
                    None => Ok(output),
                };
            }
        }
        // Channel closed before the idle status for this request arrived.
        Err(BoxError::Channel(
            tokio_tungstenite::tungstenite::Error::ConnectionClosed,
        ))
    }
}

#[async_trait]
impl CodeBox for GatewayBox {
    fn kernel_id(&self) -> &str {
        &self.kernel.id
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
        match timeout(deadline, self.execute_inner(&request)).await {
            Ok(result) => result,
            Err(_) => Err(BoxError::ExecutionTimeout {
                limit_ms: deadline.as_millis() as u64,
            }),
        }
    }
}
