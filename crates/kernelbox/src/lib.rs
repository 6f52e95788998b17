//! Kernelbox: lifecycle management for Python code-execution sandboxes.
//!
//! A [`BoxManager`] multiplexes many isolated execution sessions behind one
//! async interface: `start` yields a [`CodeBox`], `execute` runs code in it
//! and returns folded [`ExecutionOutput`], `shutdown` tears the kernel
//! down. Two backends are provided:
//!
//! - [`local::LocalBoxManager`] spawns and owns local Python kernel
//!   processes;
//! - [`gateway::GatewayBoxManager`] drives kernels hosted by a Jupyter
//!   Enterprise Gateway compatible service.
//!
//! Use [`run_scoped`] to guarantee a kernel is shut down on every exit
//! path of a unit of work.
//!
//! # Example
//!
//! ```no_run
//! use kernelbox::{run_scoped, BoxManager, CodeBox, StartOptions};
//! use kernelbox::local::{LocalBoxManager, LocalConfig};
//!
//! # async fn demo() -> kernelbox::BoxResult<()> {
//! let manager = LocalBoxManager::new(LocalConfig::default());
//! let answer = run_scoped(&manager, StartOptions::new(), |sandbox| async move {
//!     let out = sandbox.execute("6 * 7").await?;
//!     Ok(out.text().unwrap_or_default().to_string())
//! })
//! .await?;
//! assert_eq!(answer, "42");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod gateway;
pub mod local;
pub mod manager;
pub mod output;
pub mod schema;
pub mod telemetry;
pub mod utils;

pub use error::{BoxError, BoxResult};
pub use gateway::{GatewayBox, GatewayBoxManager, GatewayConfig};
pub use local::{LocalBox, LocalBoxManager, LocalConfig};
pub use manager::{run_scoped, BoxManager, CodeBox, StartOptions};
pub use output::{ExecutionOutput, OutputCollector};
pub use schema::{
    CreateKernelRequest, ErrorContent, ExecutionRequest, ExecutionResponse, ExecutionState,
    KernelInfo, KernelMessage, MimeBundle,
};
pub use telemetry::init_tracing;
pub use utils::clean_ansi_codes;
