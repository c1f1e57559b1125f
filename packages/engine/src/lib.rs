// ABOUTME: Sandbox lifecycle orchestration engine for test suites
// ABOUTME: Combines hook bundles, drives phase transitions and reconciles requests

pub mod config;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod observe;
pub mod reconcile;
pub mod runtime;
pub mod spec;
pub mod wait;

pub use config::EngineConfig;
pub use error::{EngineError, MountError, Result, ValidationError};
pub use hooks::{combine, sandbox_hook, spec_hook, CombinedHooks, HookBundle, SandboxHook, SpecHook};
pub use lifecycle::{Phase, SandboxEngine, SandboxHandle};
pub use observe::{logging_hooks, LogSink, MemorySink, TracingSink};
pub use reconcile::{merge_port_bindings, resolve_mounts};
pub use runtime::{
    ClientError, CreateParams, DockerNetworks, DockerRuntime, EndpointConfig, ExecOutput,
    HealthState, ImageBuilder, NetworkManager, ResolvedMount, RuntimeClient, RuntimeStatus,
    SandboxInfo,
};
pub use spec::{
    parse_exposed_ports, ContainerPort, FileCopy, ImageBuild, MountSource, MountSpec, PortBinding,
    PortMap, Protocol, SandboxSpec,
};
pub use wait::{AllOf, ExecProbe, HealthyProbe, ReadinessProbe, TcpProbe};
