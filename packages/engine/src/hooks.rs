// ABOUTME: Lifecycle hook bundles and the ordered combinator
// ABOUTME: Pre-* edges run default bundles first, post-* edges run them last

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::lifecycle::SandboxHandle;
use crate::spec::SandboxSpec;

/// A hook that runs against the specification before the sandbox exists.
///
/// Pre-build, post-build and pre-create edges carry these; they may mutate
/// or validate the specification, and an error aborts the transition
/// before any runtime call is issued.
#[async_trait]
pub trait SpecHook: Send + Sync {
    async fn run(&self, spec: &mut SandboxSpec) -> anyhow::Result<()>;
}

/// A hook that runs against the live sandbox handle.
///
/// All edges from post-create onward carry these. Handle hooks may call
/// read and exec operations on the handle.
#[async_trait]
pub trait SandboxHook: Send + Sync {
    async fn run(&self, handle: &SandboxHandle) -> anyhow::Result<()>;
}

struct FnSpecHook<F>(F);

#[async_trait]
impl<F> SpecHook for FnSpecHook<F>
where
    F: Fn(&mut SandboxSpec) -> anyhow::Result<()> + Send + Sync,
{
    async fn run(&self, spec: &mut SandboxSpec) -> anyhow::Result<()> {
        (self.0)(spec)
    }
}

struct FnSandboxHook<F>(F);

#[async_trait]
impl<F> SandboxHook for FnSandboxHook<F>
where
    F: Fn(&SandboxHandle) -> anyhow::Result<()> + Send + Sync,
{
    async fn run(&self, handle: &SandboxHandle) -> anyhow::Result<()> {
        (self.0)(handle)
    }
}

/// One registrant's hooks across all eleven phase-edges.
///
/// Hooks within an edge run in registration order. Bundles are cheap to
/// clone; the engine never mutates one.
#[derive(Clone, Default)]
pub struct HookBundle {
    pub pre_builds: Vec<Arc<dyn SpecHook>>,
    pub post_builds: Vec<Arc<dyn SpecHook>>,
    pub pre_creates: Vec<Arc<dyn SpecHook>>,
    pub post_creates: Vec<Arc<dyn SandboxHook>>,
    pub pre_starts: Vec<Arc<dyn SandboxHook>>,
    pub post_starts: Vec<Arc<dyn SandboxHook>>,
    pub post_readies: Vec<Arc<dyn SandboxHook>>,
    pub pre_stops: Vec<Arc<dyn SandboxHook>>,
    pub post_stops: Vec<Arc<dyn SandboxHook>>,
    pub pre_terminates: Vec<Arc<dyn SandboxHook>>,
    pub post_terminates: Vec<Arc<dyn SandboxHook>>,
}

impl HookBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pre_build(mut self, hook: impl SpecHook + 'static) -> Self {
        self.pre_builds.push(Arc::new(hook));
        self
    }

    pub fn on_post_build(mut self, hook: impl SpecHook + 'static) -> Self {
        self.post_builds.push(Arc::new(hook));
        self
    }

    pub fn on_pre_create(mut self, hook: impl SpecHook + 'static) -> Self {
        self.pre_creates.push(Arc::new(hook));
        self
    }

    pub fn on_post_create(mut self, hook: impl SandboxHook + 'static) -> Self {
        self.post_creates.push(Arc::new(hook));
        self
    }

    pub fn on_pre_start(mut self, hook: impl SandboxHook + 'static) -> Self {
        self.pre_starts.push(Arc::new(hook));
        self
    }

    pub fn on_post_start(mut self, hook: impl SandboxHook + 'static) -> Self {
        self.post_starts.push(Arc::new(hook));
        self
    }

    pub fn on_post_ready(mut self, hook: impl SandboxHook + 'static) -> Self {
        self.post_readies.push(Arc::new(hook));
        self
    }

    pub fn on_pre_stop(mut self, hook: impl SandboxHook + 'static) -> Self {
        self.pre_stops.push(Arc::new(hook));
        self
    }

    pub fn on_post_stop(mut self, hook: impl SandboxHook + 'static) -> Self {
        self.post_stops.push(Arc::new(hook));
        self
    }

    pub fn on_pre_terminate(mut self, hook: impl SandboxHook + 'static) -> Self {
        self.pre_terminates.push(Arc::new(hook));
        self
    }

    pub fn on_post_terminate(mut self, hook: impl SandboxHook + 'static) -> Self {
        self.post_terminates.push(Arc::new(hook));
        self
    }
}

/// Wraps a synchronous closure as a specification hook.
pub fn spec_hook<F>(f: F) -> impl SpecHook + 'static
where
    F: Fn(&mut SandboxSpec) -> anyhow::Result<()> + Send + Sync + 'static,
{
    FnSpecHook(f)
}

/// Wraps a synchronous closure as a sandbox handle hook.
pub fn sandbox_hook<F>(f: F) -> impl SandboxHook + 'static
where
    F: Fn(&SandboxHandle) -> anyhow::Result<()> + Send + Sync + 'static,
{
    FnSandboxHook(f)
}

/// The single bundle a sandbox handle owns for its lifetime, produced by
/// [`combine`].
#[derive(Clone, Default)]
pub struct CombinedHooks {
    pre_builds: Vec<Arc<dyn SpecHook>>,
    post_builds: Vec<Arc<dyn SpecHook>>,
    pre_creates: Vec<Arc<dyn SpecHook>>,
    post_creates: Vec<Arc<dyn SandboxHook>>,
    pre_starts: Vec<Arc<dyn SandboxHook>>,
    post_starts: Vec<Arc<dyn SandboxHook>>,
    post_readies: Vec<Arc<dyn SandboxHook>>,
    pre_stops: Vec<Arc<dyn SandboxHook>>,
    post_stops: Vec<Arc<dyn SandboxHook>>,
    pre_terminates: Vec<Arc<dyn SandboxHook>>,
    post_terminates: Vec<Arc<dyn SandboxHook>>,
}

/// Merges default and user bundles into one ordered bundle per edge.
///
/// Pre-* edges concatenate default bundles first (registration order,
/// internal order preserved), then user bundles. Post-* edges concatenate
/// user bundles first, then default bundles, so built-in bookkeeping
/// always observes state last. Only registration order and the
/// default/user partition determine order; zero bundles of either kind
/// yield an empty, no-op pipeline.
pub fn combine(defaults: &[HookBundle], users: &[HookBundle]) -> CombinedHooks {
    let mut combined = CombinedHooks::default();

    for bundle in defaults.iter().chain(users.iter()) {
        combined.pre_builds.extend(bundle.pre_builds.iter().cloned());
        combined.pre_creates.extend(bundle.pre_creates.iter().cloned());
        combined.pre_starts.extend(bundle.pre_starts.iter().cloned());
        combined.pre_stops.extend(bundle.pre_stops.iter().cloned());
        combined
            .pre_terminates
            .extend(bundle.pre_terminates.iter().cloned());
    }

    for bundle in users.iter().chain(defaults.iter()) {
        combined.post_builds.extend(bundle.post_builds.iter().cloned());
        combined
            .post_creates
            .extend(bundle.post_creates.iter().cloned());
        combined.post_starts.extend(bundle.post_starts.iter().cloned());
        combined
            .post_readies
            .extend(bundle.post_readies.iter().cloned());
        combined.post_stops.extend(bundle.post_stops.iter().cloned());
        combined
            .post_terminates
            .extend(bundle.post_terminates.iter().cloned());
    }

    combined
}

async fn run_spec_edge(
    edge: &'static str,
    hooks: &[Arc<dyn SpecHook>],
    spec: &mut SandboxSpec,
) -> Result<()> {
    for hook in hooks {
        hook.run(spec)
            .await
            .map_err(|source| EngineError::Hook { edge, source })?;
    }
    Ok(())
}

async fn run_sandbox_edge(
    edge: &'static str,
    hooks: &[Arc<dyn SandboxHook>],
    handle: &SandboxHandle,
) -> Result<()> {
    for hook in hooks {
        hook.run(handle)
            .await
            .map_err(|source| EngineError::Hook { edge, source })?;
    }
    Ok(())
}

impl CombinedHooks {
    pub async fn building(&self, spec: &mut SandboxSpec) -> Result<()> {
        run_spec_edge("pre-build", &self.pre_builds, spec).await
    }

    pub async fn built(&self, spec: &mut SandboxSpec) -> Result<()> {
        run_spec_edge("post-build", &self.post_builds, spec).await
    }

    pub async fn creating(&self, spec: &mut SandboxSpec) -> Result<()> {
        run_spec_edge("pre-create", &self.pre_creates, spec).await
    }

    pub async fn created(&self, handle: &SandboxHandle) -> Result<()> {
        run_sandbox_edge("post-create", &self.post_creates, handle).await
    }

    pub async fn starting(&self, handle: &SandboxHandle) -> Result<()> {
        run_sandbox_edge("pre-start", &self.pre_starts, handle).await
    }

    pub async fn started(&self, handle: &SandboxHandle) -> Result<()> {
        run_sandbox_edge("post-start", &self.post_starts, handle).await
    }

    pub async fn readied(&self, handle: &SandboxHandle) -> Result<()> {
        run_sandbox_edge("post-ready", &self.post_readies, handle).await
    }

    pub async fn stopping(&self, handle: &SandboxHandle) -> Result<()> {
        run_sandbox_edge("pre-stop", &self.pre_stops, handle).await
    }

    pub async fn stopped(&self, handle: &SandboxHandle) -> Result<()> {
        run_sandbox_edge("post-stop", &self.post_stops, handle).await
    }

    pub async fn terminating(&self, handle: &SandboxHandle) -> Result<()> {
        run_sandbox_edge("pre-terminate", &self.pre_terminates, handle).await
    }

    pub async fn terminated(&self, handle: &SandboxHandle) -> Result<()> {
        run_sandbox_edge("post-terminate", &self.post_terminates, handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn tagging_bundle(prints: &Arc<Mutex<Vec<String>>>, prefix: &str, id: usize) -> HookBundle {
        let mut bundle = HookBundle::new();
        for hook_id in 1..=2 {
            let log = prints.clone();
            let tag = format!("[{prefix}] pre-create hook {id}.{hook_id}");
            bundle = bundle.on_pre_create(spec_hook(move |_spec: &mut SandboxSpec| {
                log.lock().unwrap().push(tag.clone());
                Ok(())
            }));

            let log = prints.clone();
            let tag = format!("[{prefix}] post-build hook {id}.{hook_id}");
            bundle = bundle.on_post_build(spec_hook(move |_spec: &mut SandboxSpec| {
                log.lock().unwrap().push(tag.clone());
                Ok(())
            }));
        }
        bundle
    }

    #[tokio::test]
    async fn test_pre_edges_run_defaults_before_users() {
        let prints = Arc::new(Mutex::new(Vec::new()));

        let defaults = vec![
            tagging_bundle(&prints, "default", 1),
            tagging_bundle(&prints, "default", 2),
        ];
        let users = vec![
            tagging_bundle(&prints, "user", 1),
            tagging_bundle(&prints, "user", 2),
            tagging_bundle(&prints, "user", 3),
        ];

        let combined = combine(&defaults, &users);
        let mut spec = SandboxSpec::from_image("alpine:latest");
        combined.creating(&mut spec).await.expect("pipeline failed");

        let expected = vec![
            "[default] pre-create hook 1.1",
            "[default] pre-create hook 1.2",
            "[default] pre-create hook 2.1",
            "[default] pre-create hook 2.2",
            "[user] pre-create hook 1.1",
            "[user] pre-create hook 1.2",
            "[user] pre-create hook 2.1",
            "[user] pre-create hook 2.2",
            "[user] pre-create hook 3.1",
            "[user] pre-create hook 3.2",
        ];
        assert_eq!(*prints.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_post_edges_run_users_before_defaults() {
        let prints = Arc::new(Mutex::new(Vec::new()));

        let defaults = vec![
            tagging_bundle(&prints, "default", 1),
            tagging_bundle(&prints, "default", 2),
        ];
        let users = vec![
            tagging_bundle(&prints, "user", 1),
            tagging_bundle(&prints, "user", 2),
            tagging_bundle(&prints, "user", 3),
        ];

        let combined = combine(&defaults, &users);
        let mut spec = SandboxSpec::from_image("alpine:latest");
        combined.built(&mut spec).await.expect("pipeline failed");

        let expected = vec![
            "[user] post-build hook 1.1",
            "[user] post-build hook 1.2",
            "[user] post-build hook 2.1",
            "[user] post-build hook 2.2",
            "[user] post-build hook 3.1",
            "[user] post-build hook 3.2",
            "[default] post-build hook 1.1",
            "[default] post-build hook 1.2",
            "[default] post-build hook 2.1",
            "[default] post-build hook 2.2",
        ];
        assert_eq!(*prints.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_zero_bundles_yield_noop_pipelines() {
        let combined = combine(&[], &[]);
        let mut spec = SandboxSpec::from_image("alpine:latest");

        combined.building(&mut spec).await.expect("pre-build");
        combined.built(&mut spec).await.expect("post-build");
        combined.creating(&mut spec).await.expect("pre-create");
    }

    #[tokio::test]
    async fn test_failing_hook_aborts_the_edge() {
        let prints = Arc::new(Mutex::new(Vec::new()));

        let log = prints.clone();
        let first = spec_hook(move |_spec: &mut SandboxSpec| {
            log.lock().unwrap().push("first".to_string());
            Ok(())
        });
        let failing =
            spec_hook(|_spec: &mut SandboxSpec| Err(anyhow::anyhow!("rejected by policy")));
        let log = prints.clone();
        let never = spec_hook(move |_spec: &mut SandboxSpec| {
            log.lock().unwrap().push("never".to_string());
            Ok(())
        });

        let bundle = HookBundle::new()
            .on_pre_create(first)
            .on_pre_create(failing)
            .on_pre_create(never);

        let combined = combine(&[], &[bundle]);
        let mut spec = SandboxSpec::from_image("alpine:latest");
        let err = combined.creating(&mut spec).await.unwrap_err();

        match err {
            EngineError::Hook { edge, source } => {
                assert_eq!(edge, "pre-create");
                assert!(source.to_string().contains("rejected by policy"));
            }
            other => panic!("expected hook error, got {other:?}"),
        }
        assert_eq!(*prints.lock().unwrap(), vec!["first".to_string()]);
    }

    #[tokio::test]
    async fn test_pre_create_hooks_may_mutate_the_spec() {
        let bundle = HookBundle::new().on_pre_create(spec_hook(|spec: &mut SandboxSpec| {
            spec.env
                .insert("INJECTED".to_string(), "yes".to_string());
            Ok(())
        }));

        let combined = combine(&[bundle], &[]);
        let mut spec = SandboxSpec::from_image("alpine:latest");
        combined.creating(&mut spec).await.expect("pipeline failed");

        assert_eq!(spec.env.get("INJECTED"), Some(&"yes".to_string()));
    }

    #[tokio::test]
    async fn test_registering_a_bundle_twice_doubles_invocations() {
        let prints = Arc::new(Mutex::new(Vec::new()));
        let bundle = tagging_bundle(&prints, "user", 1);

        let combined = combine(&[], &[bundle.clone(), bundle]);
        let mut spec = SandboxSpec::from_image("alpine:latest");
        combined.creating(&mut spec).await.expect("pipeline failed");

        let expected = vec![
            "[user] pre-create hook 1.1",
            "[user] pre-create hook 1.2",
            "[user] pre-create hook 1.1",
            "[user] pre-create hook 1.2",
        ];
        assert_eq!(*prints.lock().unwrap(), expected);
    }
}
