// ABOUTME: Docker implementations of the runtime client and network manager
// ABOUTME: Uses bollard; maps 404 to NotFound and 304 to success for idempotent cleanup

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bollard::container::{
    Config, CreateContainerOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    ClientError, CreateParams, ExecOutput, HealthState, NetworkManager, ResolvedMount,
    RuntimeClient, RuntimeStatus, SandboxInfo,
};
use crate::spec::ContainerPort;

fn map_err(err: BollardError) -> ClientError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ClientError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => ClientError::Api(format!("status {}: {}", status_code, message)),
        other => ClientError::Api(other.to_string()),
    }
}

/// Runtime client backed by the local Docker daemon.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self, ClientError> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    /// Use an existing bollard client (for tests and custom transports).
    pub fn from_client(client: Docker) -> Self {
        Self { client }
    }

    /// Whether the daemon responds to pings.
    pub async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    fn to_config(params: &CreateParams) -> Result<Config<String>, ClientError> {
        let env: Vec<String> = params
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut exposed_ports = HashMap::new();
        for port in &params.exposed_ports {
            exposed_ports.insert(port.to_string(), HashMap::new());
        }

        let mut port_bindings = HashMap::new();
        for (port, bindings) in &params.port_bindings {
            let docker_bindings: Vec<bollard::models::PortBinding> = bindings
                .iter()
                .map(|b| bollard::models::PortBinding {
                    host_ip: Some(b.host_ip.clone()),
                    host_port: Some(b.host_port.clone()),
                })
                .collect();
            port_bindings.insert(port.to_string(), Some(docker_bindings));
        }

        let mut binds = Vec::new();
        let mut mounts = Vec::new();
        for mount in &params.mounts {
            match mount {
                ResolvedMount::Bind {
                    host_path,
                    target,
                    read_only,
                } => {
                    binds.push(format!(
                        "{}:{}:{}",
                        host_path,
                        target,
                        if *read_only { "ro" } else { "rw" }
                    ));
                }
                ResolvedMount::Volume {
                    name,
                    target,
                    read_only,
                } => {
                    mounts.push(bollard::models::Mount {
                        target: Some(target.clone()),
                        source: Some(name.clone()),
                        typ: Some(bollard::models::MountTypeEnum::VOLUME),
                        read_only: Some(*read_only),
                        ..Default::default()
                    });
                }
                ResolvedMount::Image { image, .. } => {
                    // Image-derived mounts need a daemon API this client does
                    // not speak yet (mount type "image", API 1.48).
                    return Err(ClientError::Api(format!(
                        "image-derived mount from '{}' is not supported by the docker runtime",
                        image
                    )));
                }
            }
        }

        let host_config = bollard::models::HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: params.network_mode.clone(),
            ..Default::default()
        };

        let networking_config = if params.endpoints.is_empty() {
            None
        } else {
            let mut endpoints_config = HashMap::new();
            for endpoint in &params.endpoints {
                endpoints_config.insert(
                    endpoint.network.clone(),
                    bollard::models::EndpointSettings {
                        network_id: Some(endpoint.network_id.clone()),
                        aliases: if endpoint.aliases.is_empty() {
                            None
                        } else {
                            Some(endpoint.aliases.clone())
                        },
                        ..Default::default()
                    },
                );
            }
            Some(NetworkingConfig { endpoints_config })
        };

        Ok(Config {
            image: Some(params.image.clone()),
            cmd: if params.cmd.is_empty() {
                None
            } else {
                Some(params.cmd.clone())
            },
            entrypoint: params.entrypoint.clone(),
            env: Some(env),
            working_dir: params.working_dir.clone(),
            labels: Some(params.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        })
    }

    fn convert_status(state: &str) -> RuntimeStatus {
        match state.to_lowercase().as_str() {
            "created" => RuntimeStatus::Created,
            "running" | "restarting" => RuntimeStatus::Running,
            "paused" => RuntimeStatus::Paused,
            "exited" | "removing" => RuntimeStatus::Exited,
            "dead" => RuntimeStatus::Dead,
            _ => RuntimeStatus::Unknown,
        }
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn create_sandbox(&self, params: &CreateParams) -> Result<String, ClientError> {
        let config = Self::to_config(params)?;

        let response = match &params.name {
            Some(name) => {
                let options = CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                };
                self.client
                    .create_container(Some(options), config)
                    .await
                    .map_err(map_err)?
            }
            None => self
                .client
                .create_container::<String, String>(None, config)
                .await
                .map_err(map_err)?,
        };

        info!("created container {} from image {}", response.id, params.image);
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), ClientError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)?;
        debug!("started container {}", id);
        Ok(())
    }

    async fn stop(&self, id: &str, timeout: Option<Duration>) -> Result<(), ClientError> {
        let options = timeout.map(|t| StopContainerOptions { t: t.as_secs() as i64 });

        match self.client.stop_container(id, options).await {
            Ok(()) => Ok(()),
            // 304: already stopped, which is what we wanted.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("container {} already stopped", id);
                Ok(())
            }
            Err(err) => Err(map_err(err)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), ClientError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(map_err)?;
        debug!("removed container {}", id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<SandboxInfo, ClientError> {
        let inspect = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(map_err)?;

        let state = inspect.state.as_ref();
        let status = state
            .and_then(|s| s.status.as_ref())
            .map(|s| Self::convert_status(s.as_ref()))
            .unwrap_or(RuntimeStatus::Unknown);

        let health = state
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status.as_ref())
            .and_then(|h| match format!("{:?}", h).as_str() {
                "STARTING" => Some(HealthState::Starting),
                "HEALTHY" => Some(HealthState::Healthy),
                "UNHEALTHY" => Some(HealthState::Unhealthy),
                _ => None,
            });

        let mut host_ports = HashMap::new();
        if let Some(network_settings) = &inspect.network_settings {
            if let Some(port_map) = &network_settings.ports {
                for (port_str, bindings) in port_map {
                    let Ok(port) = port_str.parse::<ContainerPort>() else {
                        continue;
                    };
                    let host_port = bindings
                        .as_ref()
                        .and_then(|b| b.first())
                        .and_then(|b| b.host_port.as_ref())
                        .and_then(|p| p.parse::<u16>().ok());
                    if let Some(host_port) = host_port {
                        host_ports.insert(port, host_port);
                    }
                }
            }
        }

        let created_at = inspect
            .created
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        let started_at = state
            .and_then(|s| s.started_at.as_ref())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(SandboxInfo {
            id: id.to_string(),
            name: inspect
                .name
                .unwrap_or_else(|| id.to_string())
                .trim_start_matches('/')
                .to_string(),
            status,
            health,
            ip_address: inspect
                .network_settings
                .and_then(|ns| ns.ip_address)
                .filter(|s| !s.is_empty()),
            host_ports,
            created_at,
            started_at,
        })
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, ClientError> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(id, exec_config)
            .await
            .map_err(map_err)?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(map_err)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.extend_from_slice(&message)
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.extend_from_slice(&message)
                        }
                        Ok(bollard::container::LogOutput::Console { message }) => {
                            stdout.extend_from_slice(&message)
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!("exec stream error on container {}: {}", id, err);
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ClientError::Api("exec was detached unexpectedly".to_string()))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(map_err)?;

        Ok(ExecOutput {
            exit_code: exec_inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn copy_into(
        &self,
        id: &str,
        content: &[u8],
        container_path: &str,
        mode: u32,
    ) -> Result<(), ClientError> {
        // Transfer via exec and base64 so no archive plumbing is needed.
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let script = format!(
            "mkdir -p \"$(dirname '{path}')\" && echo '{encoded}' | base64 -d > '{path}' && chmod {mode:o} '{path}'",
            path = container_path,
        );
        let cmd = vec!["sh".to_string(), "-c".to_string(), script];

        let output = self.exec(id, &cmd).await?;
        if !output.success() {
            return Err(ClientError::Api(format!(
                "copy to '{}' failed: {}",
                container_path,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Network manager backed by the local Docker daemon: resolves a network
/// by name, creating it when absent.
pub struct DockerNetworks {
    client: Docker,
}

impl DockerNetworks {
    pub fn new() -> Result<Self, ClientError> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Docker) -> Self {
        Self { client }
    }

    async fn network_id(&self, name: &str) -> Result<String, ClientError> {
        let network = self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(map_err)?;
        Ok(network.id.unwrap_or_else(|| name.to_string()))
    }
}

#[async_trait]
impl NetworkManager for DockerNetworks {
    async fn ensure_network(&self, name: &str) -> Result<String, ClientError> {
        match self.network_id(name).await {
            Ok(id) => Ok(id),
            Err(ClientError::NotFound(_)) => {
                info!("creating network {}", name);
                let options = CreateNetworkOptions {
                    name: name.to_string(),
                    ..Default::default()
                };
                let _ = self
                    .client
                    .create_network(options)
                    .await
                    .map_err(map_err)?;
                self.network_id(name).await
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{PortBinding, PortMap};

    fn params_with_ports() -> CreateParams {
        let mut port_bindings = PortMap::new();
        port_bindings.insert(
            ContainerPort::tcp(80),
            vec![PortBinding::new("0.0.0.0", "8080")],
        );
        CreateParams {
            image: "nginx:alpine".to_string(),
            name: Some("web".to_string()),
            env: HashMap::from([("A".to_string(), "b".to_string())]),
            exposed_ports: vec![ContainerPort::tcp(80)],
            port_bindings,
            mounts: vec![
                ResolvedMount::Bind {
                    host_path: "/host/data".to_string(),
                    target: "/data".to_string(),
                    read_only: true,
                },
                ResolvedMount::Volume {
                    name: "appdata".to_string(),
                    target: "/appdata".to_string(),
                    read_only: false,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_to_config_maps_ports_env_and_mounts() {
        let config = DockerRuntime::to_config(&params_with_ports()).expect("valid params");

        assert_eq!(config.image.as_deref(), Some("nginx:alpine"));
        assert_eq!(config.env, Some(vec!["A=b".to_string()]));

        let exposed = config.exposed_ports.expect("exposed ports set");
        assert!(exposed.contains_key("80/tcp"));

        let host_config = config.host_config.expect("host config set");
        let bindings = host_config.port_bindings.expect("port bindings set");
        let web = bindings.get("80/tcp").cloned().flatten().expect("binding");
        assert_eq!(web[0].host_port.as_deref(), Some("8080"));

        assert_eq!(
            host_config.binds,
            Some(vec!["/host/data:/data:ro".to_string()])
        );
        let mounts = host_config.mounts.expect("volume mount set");
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].source.as_deref(), Some("appdata"));
    }

    #[test]
    fn test_to_config_rejects_image_mounts() {
        let mut params = params_with_ports();
        params.mounts.push(ResolvedMount::Image {
            image: "nginx:latest".to_string(),
            sub_path: "var/www".to_string(),
            target: "/var/www".to_string(),
        });

        let err = DockerRuntime::to_config(&params).unwrap_err();
        assert!(err.to_string().contains("image-derived mount"));
    }

    #[test]
    fn test_convert_status() {
        assert_eq!(DockerRuntime::convert_status("running"), RuntimeStatus::Running);
        assert_eq!(DockerRuntime::convert_status("exited"), RuntimeStatus::Exited);
        assert_eq!(DockerRuntime::convert_status("weird"), RuntimeStatus::Unknown);
    }

    #[tokio::test]
    #[ignore] // Requires Docker daemon
    async fn test_connect_and_ping() {
        let runtime = DockerRuntime::new().expect("failed to connect to Docker");
        assert!(runtime.is_available().await);
    }
}
