// ABOUTME: Declarative sandbox specification and port/mount/file data types
// ABOUTME: Parses exposed-port declarations into protocol-qualified bindings

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::hooks::HookBundle;
use crate::runtime::CreateParams;
use crate::wait::ReadinessProbe;

/// Transport protocol of an exposed container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(ValidationError::Port(other.to_string())),
        }
    }
}

/// A protocol-qualified container port, e.g. `80/tcp`.
///
/// Declarations without an explicit protocol default to tcp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerPort {
    pub number: u16,
    pub protocol: Protocol,
}

impl ContainerPort {
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

impl FromStr for ContainerPort {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, protocol) = match s.split_once('/') {
            Some((number, protocol)) => (number, protocol.parse()?),
            None => (s, Protocol::Tcp),
        };
        let number = number
            .parse::<u16>()
            .map_err(|_| ValidationError::Port(s.to_string()))?;
        Ok(Self { number, protocol })
    }
}

/// One host-side binding for an exposed port. Empty strings mean the
/// runtime picks the address/port at start time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

impl PortBinding {
    pub fn new(host_ip: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            host_ip: host_ip.into(),
            host_port: host_port.into(),
        }
    }
}

/// Mapping from protocol-qualified port to its host bindings.
pub type PortMap = HashMap<ContainerPort, Vec<PortBinding>>;

/// Parses declared exposed-port strings into a port map.
///
/// Accepted forms: `"80"`, `"80/udp"`, `"8080:80"`, `"1.2.3.4:8080:80/tcp"`.
/// A declaration without a host part yields one empty binding, meaning the
/// runtime assigns a random host port.
pub fn parse_exposed_ports(specs: &[String]) -> Result<PortMap, ValidationError> {
    let mut parsed = PortMap::new();

    for spec in specs {
        let (port, binding) = parse_port_spec(spec)?;
        parsed.entry(port).or_default().push(binding);
    }

    Ok(parsed)
}

fn parse_port_spec(spec: &str) -> Result<(ContainerPort, PortBinding), ValidationError> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [port] => Ok((port.parse()?, PortBinding::default())),
        [host_port, port] => Ok((port.parse()?, PortBinding::new("", *host_port))),
        [host_ip, host_port, port] => Ok((port.parse()?, PortBinding::new(*host_ip, *host_port))),
        _ => Err(ValidationError::Port(spec.to_string())),
    }
}

/// Where a declared mount takes its content from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountSource {
    /// A host directory or file, bind-mounted into the sandbox.
    Bind { host_path: String },
    /// A named volume managed by the runtime.
    Volume { name: String },
    /// A sub-path of another image, mounted read-only.
    Image { image: String, sub_path: String },
}

/// A declared mount: a source plus a target path inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    pub fn bind(host_path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: MountSource::Bind {
                host_path: host_path.into(),
            },
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: MountSource::Volume { name: name.into() },
            target: target.into(),
            read_only: false,
        }
    }

    pub fn from_image(
        image: impl Into<String>,
        sub_path: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source: MountSource::Image {
                image: image.into(),
                sub_path: sub_path.into(),
            },
            target: target.into(),
            read_only: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// A host file copied into the sandbox right after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCopy {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: u32,
}

/// Declaration of an image to build before creation instead of pulling one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuild {
    pub context_dir: PathBuf,
    pub dockerfile: String,
    pub tag: Option<String>,
    pub build_args: HashMap<String, String>,
}

impl ImageBuild {
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self {
            context_dir: context_dir.into(),
            dockerfile: "Dockerfile".to_string(),
            tag: None,
            build_args: HashMap::new(),
        }
    }
}

/// Closure applied to the assembled creation parameters before the port
/// merge. This is the "configured" source of port bindings.
pub type ParamsModifier = Arc<dyn Fn(&mut CreateParams) + Send + Sync>;

/// Declarative description of a desired sandbox.
///
/// Immutable once creation begins, except that pre-build and pre-create
/// hooks may mutate it before any runtime call is issued.
#[derive(Clone, Default)]
pub struct SandboxSpec {
    pub image: String,
    pub name: Option<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,

    /// Declared exposed ports; also the allow-list for configured bindings.
    pub exposed_ports: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub files: Vec<FileCopy>,
    pub networks: Vec<String>,
    pub network_aliases: HashMap<String, Vec<String>>,

    /// Build an image from a context instead of using `image` directly.
    pub build: Option<ImageBuild>,

    pub params_modifier: Option<ParamsModifier>,

    /// User hook bundles, combined with the engine defaults per the
    /// pre/post partition rule.
    pub hooks: Vec<HookBundle>,

    pub probe: Option<Arc<dyn ReadinessProbe>>,
    pub ready_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
}

impl SandboxSpec {
    pub fn from_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_exposed_port(mut self, port: impl Into<String>) -> Self {
        self.exposed_ports.push(port.into());
        self
    }

    pub fn with_hooks(mut self, bundle: HookBundle) -> Self {
        self.hooks.push(bundle);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

impl fmt::Debug for SandboxSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxSpec")
            .field("image", &self.image)
            .field("name", &self.name)
            .field("cmd", &self.cmd)
            .field("exposed_ports", &self.exposed_ports)
            .field("mounts", &self.mounts)
            .field("files", &self.files)
            .field("networks", &self.networks)
            .field("build", &self.build)
            .field("hook_bundles", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_defaults_to_tcp() {
        let port: ContainerPort = "80".parse().unwrap();
        assert_eq!(port, ContainerPort::tcp(80));
        assert_eq!(port.to_string(), "80/tcp");
    }

    #[test]
    fn test_port_with_protocol() {
        let port: ContainerPort = "53/udp".parse().unwrap();
        assert_eq!(port, ContainerPort::udp(53));
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        assert!("http".parse::<ContainerPort>().is_err());
        assert!("80/ipx".parse::<ContainerPort>().is_err());
        assert!("99999".parse::<ContainerPort>().is_err());
    }

    #[test]
    fn test_parse_exposed_ports_plain() {
        let parsed = parse_exposed_ports(&["80/tcp".to_string()]).unwrap();
        assert_eq!(
            parsed.get(&ContainerPort::tcp(80)),
            Some(&vec![PortBinding::default()])
        );
    }

    #[test]
    fn test_parse_exposed_ports_with_host_parts() {
        let parsed = parse_exposed_ports(&[
            "8080:80".to_string(),
            "1.2.3.4:9090:90/udp".to_string(),
        ])
        .unwrap();

        assert_eq!(
            parsed.get(&ContainerPort::tcp(80)),
            Some(&vec![PortBinding::new("", "8080")])
        );
        assert_eq!(
            parsed.get(&ContainerPort::udp(90)),
            Some(&vec![PortBinding::new("1.2.3.4", "9090")])
        );
    }

    #[test]
    fn test_parse_exposed_ports_preserves_declaration_order() {
        let parsed = parse_exposed_ports(&["80".to_string(), "8080:80".to_string()]).unwrap();
        assert_eq!(
            parsed.get(&ContainerPort::tcp(80)),
            Some(&vec![PortBinding::default(), PortBinding::new("", "8080")])
        );
    }
}
