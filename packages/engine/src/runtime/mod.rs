// ABOUTME: Capability traits the engine calls into: runtime client, networks, builder
// ABOUTME: Defines the runtime-neutral creation parameters and inspection types

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::spec::{ContainerPort, ImageBuild, PortMap};

pub mod docker;

pub use docker::{DockerNetworks, DockerRuntime};

/// Errors reported by runtime capability implementations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The sandbox (or network) no longer exists. Cleanup paths treat
    /// this as success.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("runtime API error: {0}")]
    Api(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Final runtime-creation parameters produced by the reconciler.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub image: String,
    pub name: Option<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    pub exposed_ports: Vec<ContainerPort>,
    pub port_bindings: PortMap,
    pub mounts: Vec<ResolvedMount>,
    pub network_mode: Option<String>,
    pub endpoints: Vec<EndpointConfig>,
}

/// A mount declaration resolved to its concrete runtime form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedMount {
    Bind {
        host_path: String,
        target: String,
        read_only: bool,
    },
    Volume {
        name: String,
        target: String,
        read_only: bool,
    },
    Image {
        image: String,
        sub_path: String,
        target: String,
    },
}

/// Endpoint configuration for one declared network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub network: String,
    pub network_id: String,
    /// Installed only when explicitly declared in the specification.
    pub aliases: Vec<String>,
}

/// Runtime-reported lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Created,
    Running,
    Paused,
    Exited,
    Dead,
    Unknown,
}

/// Runtime-reported health of a sandbox, when the image defines a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

/// Snapshot of a running sandbox as reported by the runtime.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub id: String,
    pub name: String,
    pub status: RuntimeStatus,
    pub health: Option<HealthState>,
    pub ip_address: Option<String>,
    /// Mapped host ports for exposed container ports.
    pub host_ports: HashMap<ContainerPort, u16>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Output of a command executed inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The external sandbox runtime. The engine only drives this interface;
/// it never speaks the wire protocol itself.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Create a sandbox and return its runtime-assigned id. Must not
    /// start it.
    async fn create_sandbox(&self, params: &CreateParams) -> Result<String, ClientError>;

    async fn start(&self, id: &str) -> Result<(), ClientError>;

    /// Stop with an optional grace period before the runtime kills the
    /// sandbox process.
    async fn stop(&self, id: &str, timeout: Option<Duration>) -> Result<(), ClientError>;

    async fn remove(&self, id: &str) -> Result<(), ClientError>;

    async fn inspect(&self, id: &str) -> Result<SandboxInfo, ClientError>;

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, ClientError>;

    /// Write `content` to `container_path` inside the sandbox with the
    /// given file mode.
    async fn copy_into(
        &self,
        id: &str,
        content: &[u8],
        container_path: &str,
        mode: u32,
    ) -> Result<(), ClientError>;
}

/// Resolves declared network names to runtime identities, creating the
/// network when it does not exist yet.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    async fn ensure_network(&self, name: &str) -> Result<String, ClientError>;
}

/// Builds an image from a local context. Wired into the engine only when
/// specifications declare image builds.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build and return the resulting image reference.
    async fn build_image(&self, build: &ImageBuild) -> Result<String, ClientError>;
}
