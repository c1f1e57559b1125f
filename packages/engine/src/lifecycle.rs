// ABOUTME: Lifecycle state machine driving sandboxes through their phases
// ABOUTME: Invokes combined hooks at every transition with re-entrancy rules

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, ValidationError};
use crate::hooks::{combine, CombinedHooks, HookBundle, SandboxHook};
use crate::observe::{logging_hooks, LogSink, TracingSink};
use crate::reconcile::build_create_params;
use crate::runtime::{
    ClientError, ExecOutput, ImageBuilder, NetworkManager, RuntimeClient, SandboxInfo,
};
use crate::spec::{FileCopy, SandboxSpec};
use crate::wait::ReadinessProbe;

/// Lifecycle phase of a sandbox.
///
/// `Unstarted` and `Creating` exist only transiently inside
/// [`SandboxEngine::create`]; a handle is first observable in `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    Unstarted,
    Creating,
    Created,
    Starting,
    Started,
    Ready,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
}

impl Phase {
    /// Whether the sandbox process is up from the engine's point of view.
    pub fn is_running(&self) -> bool {
        matches!(self, Phase::Started | Phase::Ready)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// Allowed source phases per transition. Start is re-entrant from Stopped;
// terminate accepts mid-transition phases so cleanup works after failures.
const START_FROM: &[Phase] = &[Phase::Created, Phase::Stopped];
const STOP_FROM: &[Phase] = &[Phase::Started, Phase::Ready];
const TERMINATE_FROM: &[Phase] = &[
    Phase::Created,
    Phase::Starting,
    Phase::Started,
    Phase::Ready,
    Phase::Stopping,
    Phase::Stopped,
];

/// Orchestrates sandbox creation against the configured capabilities.
///
/// The engine owns no background tasks; every transition runs on the
/// caller's own executor and hooks run strictly sequentially, so
/// cancellation is cooperative (drop the future).
pub struct SandboxEngine {
    runtime: Arc<dyn RuntimeClient>,
    networks: Arc<dyn NetworkManager>,
    builder: Option<Arc<dyn ImageBuilder>>,
    sink: Arc<dyn LogSink>,
    config: EngineConfig,
}

impl SandboxEngine {
    pub fn new(runtime: Arc<dyn RuntimeClient>, networks: Arc<dyn NetworkManager>) -> Self {
        Self {
            runtime,
            networks,
            builder: None,
            sink: Arc::new(TracingSink),
            config: EngineConfig::default(),
        }
    }

    /// Wire an image builder; required only for specifications that
    /// declare an image build.
    pub fn with_image_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Replace the sink the default observability hooks write to.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Default bundles, assembled per creation and passed into the
    /// combinator explicitly rather than held as ambient state.
    fn default_hooks(&self, spec: &SandboxSpec) -> Vec<HookBundle> {
        vec![
            logging_hooks(self.sink.clone()),
            copy_files_hooks(spec.files.clone()),
        ]
    }

    /// Creates a sandbox: Unstarted → Creating → Created.
    ///
    /// Runs the optional build edge, then pre-create hooks on the
    /// specification, then reconciles it into creation parameters and
    /// asks the runtime for a sandbox. A pre-create hook error aborts
    /// before any runtime-create call; no partial sandbox is left behind.
    pub async fn create(&self, spec: SandboxSpec) -> Result<SandboxHandle> {
        let mut spec = spec;
        let hooks = combine(&self.default_hooks(&spec), &spec.hooks);

        if spec.build.is_some() {
            let builder = self
                .builder
                .clone()
                .ok_or(ValidationError::NoImageBuilder)?;

            hooks.building(&mut spec).await?;
            // Re-read after the hooks: pre-build may have swapped the build.
            if let Some(build) = spec.build.clone() {
                let image =
                    builder
                        .build_image(&build)
                        .await
                        .map_err(|source| EngineError::Runtime {
                            op: "build",
                            source,
                        })?;
                debug!(image = %image, "image built");
                spec.image = image;
            }
            hooks.built(&mut spec).await?;
        }

        if spec.image.is_empty() {
            return Err(ValidationError::MissingImage.into());
        }

        hooks.creating(&mut spec).await?;

        let params = build_create_params(&spec, self.networks.as_ref(), &self.config).await?;
        let id = self
            .runtime
            .create_sandbox(&params)
            .await
            .map_err(|source| EngineError::Runtime {
                op: "create",
                source,
            })?;
        debug!(id = %id, image = %spec.image, "sandbox created");

        let handle = SandboxHandle {
            id,
            name: params.name.clone().unwrap_or_default(),
            image: spec.image.clone(),
            runtime: self.runtime.clone(),
            hooks,
            probe: spec.probe.clone(),
            ready_timeout: spec.ready_timeout.unwrap_or_else(|| self.config.ready_timeout()),
            stop_timeout: spec.stop_timeout.unwrap_or_else(|| self.config.stop_timeout()),
            phase: Phase::Created,
            restarts: 0,
            created_at: Utc::now(),
            started_at: None,
        };

        handle.hooks.created(&handle).await?;

        Ok(handle)
    }

    /// Creates and starts a sandbox in one call.
    pub async fn run(&self, spec: SandboxSpec) -> Result<SandboxHandle> {
        let mut handle = self.create(spec).await?;
        handle.start().await?;
        Ok(handle)
    }
}

/// A provisioned sandbox and its lifecycle state.
///
/// Transitions require `&mut self`, so a handle cannot be driven through
/// two transitions concurrently; read operations take `&self` and may be
/// used from hooks while a transition is in flight.
pub struct SandboxHandle {
    id: String,
    name: String,
    image: String,
    runtime: Arc<dyn RuntimeClient>,
    hooks: CombinedHooks,
    probe: Option<Arc<dyn ReadinessProbe>>,
    ready_timeout: Duration,
    stop_timeout: Duration,
    phase: Phase,
    restarts: u32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

impl SandboxHandle {
    /// Runtime-assigned identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True once the sandbox has been started again after a stop.
    pub fn is_restart(&self) -> bool {
        self.restarts > 0
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    fn ensure_can(&self, action: &'static str, allowed: &[Phase]) -> Result<()> {
        if self.phase == Phase::Terminated {
            return Err(EngineError::AlreadyTerminated);
        }
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                from: self.phase,
                action,
            })
        }
    }

    /// Starts the sandbox: Created/Stopped → Starting → Started → Ready.
    ///
    /// After post-start hooks the readiness probe runs under the ready
    /// timeout; on timeout the handle stays in `Started` so readiness can
    /// be retried without recreating the sandbox. Without a probe the
    /// sandbox is ready immediately after post-start. A start from
    /// `Stopped` re-runs the exact same hook sequence as the first start.
    pub async fn start(&mut self) -> Result<()> {
        self.ensure_can("start", START_FROM)?;

        if self.phase == Phase::Stopped {
            self.restarts += 1;
        }
        self.phase = Phase::Starting;
        self.hooks.starting(&*self).await?;

        self.runtime
            .start(&self.id)
            .await
            .map_err(|source| EngineError::Runtime {
                op: "start",
                source,
            })?;
        self.phase = Phase::Started;
        self.started_at = Some(Utc::now());
        self.hooks.started(&*self).await?;

        if let Some(probe) = self.probe.clone() {
            let waited = self.ready_timeout;
            match tokio::time::timeout(waited, probe.wait_until_ready(&*self)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(EngineError::ReadyTimeout { waited }),
            }
        }

        self.phase = Phase::Ready;
        self.hooks.readied(&*self).await?;

        Ok(())
    }

    /// Stops the sandbox: Started/Ready → Stopping → Stopped.
    ///
    /// `timeout` overrides the configured grace period. A runtime report
    /// of "not found" (the sandbox vanished externally, e.g. a reaper
    /// removed it) still completes the transition.
    pub async fn stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_can("stop", STOP_FROM)?;

        self.phase = Phase::Stopping;
        self.hooks.stopping(&*self).await?;

        let grace = timeout.unwrap_or(self.stop_timeout);
        match self.runtime.stop(&self.id, Some(grace)).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(id = %self.id, "sandbox already gone, treating stop as a no-op");
            }
            Err(ClientError::Timeout(msg)) => {
                warn!(id = %self.id, %msg, "stop grace period exceeded");
                return Err(EngineError::StopTimeout { waited: grace });
            }
            Err(source) => return Err(EngineError::Runtime { op: "stop", source }),
        }

        self.phase = Phase::Stopped;
        self.hooks.stopped(&*self).await?;

        Ok(())
    }

    /// Terminates the sandbox. If it is currently Started or Ready a full
    /// stop sequence runs first, with its pre-stop/post-stop hooks as an
    /// observable side effect. Terminal: no transition is valid afterward.
    pub async fn terminate(&mut self) -> Result<()> {
        self.ensure_can("terminate", TERMINATE_FROM)?;

        if self.phase.is_running() {
            self.stop(None).await?;
        }

        self.phase = Phase::Terminating;
        self.hooks.terminating(&*self).await?;

        match self.runtime.remove(&self.id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(id = %self.id, "sandbox already gone, treating remove as a no-op");
            }
            Err(source) => {
                return Err(EngineError::Runtime {
                    op: "remove",
                    source,
                })
            }
        }

        self.phase = Phase::Terminated;
        self.hooks.terminated(&*self).await?;

        Ok(())
    }

    /// Runtime snapshot of the sandbox.
    pub async fn inspect(&self) -> Result<SandboxInfo> {
        self.guard_not_terminated()?;
        self.runtime
            .inspect(&self.id)
            .await
            .map_err(|source| EngineError::Runtime {
                op: "inspect",
                source,
            })
    }

    /// Executes a command inside the sandbox.
    pub async fn exec(&self, cmd: &[String]) -> Result<ExecOutput> {
        self.guard_not_terminated()?;
        self.runtime
            .exec(&self.id, cmd)
            .await
            .map_err(|source| EngineError::Runtime { op: "exec", source })
    }

    /// Copies a host file into the sandbox.
    pub async fn copy_file_into(
        &self,
        host_path: &Path,
        container_path: &str,
        mode: u32,
    ) -> Result<()> {
        let content = tokio::fs::read(host_path)
            .await
            .map_err(|err| EngineError::Runtime {
                op: "copy",
                source: ClientError::Api(format!("read {}: {}", host_path.display(), err)),
            })?;
        self.copy_bytes_into(&content, container_path, mode).await
    }

    /// Writes raw bytes to a path inside the sandbox.
    pub async fn copy_bytes_into(
        &self,
        content: &[u8],
        container_path: &str,
        mode: u32,
    ) -> Result<()> {
        self.guard_not_terminated()?;
        self.runtime
            .copy_into(&self.id, content, container_path, mode)
            .await
            .map_err(|source| EngineError::Runtime { op: "copy", source })
    }

    fn guard_not_terminated(&self) -> Result<()> {
        if self.phase == Phase::Terminated {
            return Err(EngineError::AlreadyTerminated);
        }
        Ok(())
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("image", &self.image)
            .field("phase", &self.phase)
            .field("restarts", &self.restarts)
            .finish_non_exhaustive()
    }
}

struct CopyFiles {
    files: Vec<FileCopy>,
}

#[async_trait]
impl SandboxHook for CopyFiles {
    async fn run(&self, handle: &SandboxHandle) -> anyhow::Result<()> {
        for file in &self.files {
            handle
                .copy_file_into(&file.host_path, &file.container_path, file.mode)
                .await?;
        }
        Ok(())
    }
}

/// Default bundle copying the specification's declared files into the
/// sandbox right after creation. Runs after user post-create hooks per
/// the post-* ordering rule.
fn copy_files_hooks(files: Vec<FileCopy>) -> HookBundle {
    HookBundle::new().on_post_create(CopyFiles { files })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display_matches_debug() {
        assert_eq!(Phase::Ready.to_string(), "Ready");
        assert_eq!(Phase::Terminated.to_string(), "Terminated");
    }

    #[test]
    fn test_running_phases() {
        assert!(Phase::Started.is_running());
        assert!(Phase::Ready.is_running());
        assert!(!Phase::Created.is_running());
        assert!(!Phase::Stopped.is_running());
    }

    #[test]
    fn test_transition_tables() {
        assert!(START_FROM.contains(&Phase::Stopped));
        assert!(!START_FROM.contains(&Phase::Started));
        assert!(STOP_FROM.contains(&Phase::Ready));
        assert!(!STOP_FROM.contains(&Phase::Stopped));
        assert!(!TERMINATE_FROM.contains(&Phase::Terminated));
    }
}
