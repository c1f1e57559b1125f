// ABOUTME: Readiness probe capability and built-in probe strategies
// ABOUTME: Probes poll until ready; the engine bounds them with the ready timeout

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::Result;
use crate::lifecycle::SandboxHandle;
use crate::runtime::HealthState;
use crate::spec::ContainerPort;

/// Default interval between probe attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Gate between `Started` and `Ready`.
///
/// Invoked once per start transition, after post-start hooks. The engine
/// wraps the call in the ready timeout, so implementations may poll
/// indefinitely as long as they keep yielding at await points.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn wait_until_ready(&self, handle: &SandboxHandle) -> Result<()>;
}

/// Ready once the mapped host port for an exposed container port accepts
/// TCP connections.
pub struct TcpProbe {
    port: ContainerPort,
    poll_interval: Duration,
}

impl TcpProbe {
    pub fn new(port: ContainerPort) -> Self {
        Self {
            port,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn wait_until_ready(&self, handle: &SandboxHandle) -> Result<()> {
        loop {
            let info = handle.inspect().await?;
            if let Some(host_port) = info.host_ports.get(&self.port) {
                // Published ports are reachable through the host loopback.
                let addr = format!("127.0.0.1:{}", host_port);
                if TcpStream::connect(&addr).await.is_ok() {
                    trace!(port = %self.port, %addr, "tcp probe connected");
                    return Ok(());
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Ready once a command inside the sandbox exits 0.
///
/// Exec failures are retried rather than surfaced: early in startup the
/// runtime may not accept exec sessions yet. The ready timeout bounds the
/// retries.
pub struct ExecProbe {
    cmd: Vec<String>,
    poll_interval: Duration,
}

impl ExecProbe {
    pub fn new(cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl ReadinessProbe for ExecProbe {
    async fn wait_until_ready(&self, handle: &SandboxHandle) -> Result<()> {
        loop {
            match handle.exec(&self.cmd).await {
                Ok(output) if output.success() => return Ok(()),
                Ok(output) => {
                    trace!(exit_code = output.exit_code, "exec probe not ready yet");
                }
                Err(err) => {
                    trace!(error = %err, "exec probe attempt failed, retrying");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Ready once the runtime reports the sandbox's health check as healthy.
pub struct HealthyProbe {
    poll_interval: Duration,
}

impl HealthyProbe {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for HealthyProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadinessProbe for HealthyProbe {
    async fn wait_until_ready(&self, handle: &SandboxHandle) -> Result<()> {
        loop {
            let info = handle.inspect().await?;
            if info.health == Some(HealthState::Healthy) {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Ready once every inner probe is ready, evaluated in order.
pub struct AllOf {
    probes: Vec<Arc<dyn ReadinessProbe>>,
}

impl AllOf {
    pub fn new(probes: Vec<Arc<dyn ReadinessProbe>>) -> Self {
        Self { probes }
    }
}

#[async_trait]
impl ReadinessProbe for AllOf {
    async fn wait_until_ready(&self, handle: &SandboxHandle) -> Result<()> {
        for probe in &self.probes {
            probe.wait_until_ready(handle).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_probe_collects_command() {
        let probe = ExecProbe::new(["redis-cli", "ping"]);
        assert_eq!(probe.cmd, vec!["redis-cli", "ping"]);
        assert_eq!(probe.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_poll_interval_override() {
        let probe = TcpProbe::new(ContainerPort::tcp(6379))
            .with_poll_interval(Duration::from_millis(250));
        assert_eq!(probe.poll_interval, Duration::from_millis(250));
    }
}
