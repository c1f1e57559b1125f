// ABOUTME: Logging sink capability and the built-in observability hook bundle
// ABOUTME: Logs every phase entry; registering it twice logs every line twice

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::hooks::{HookBundle, SandboxHook, SpecHook};
use crate::lifecycle::SandboxHandle;
use crate::spec::SandboxSpec;

/// Destination for the default observability hook. Also usable from
/// custom hooks.
pub trait LogSink: Send + Sync {
    fn printf(&self, message: fmt::Arguments<'_>);
}

/// Default sink: forwards to the `tracing` subscriber at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn printf(&self, message: fmt::Arguments<'_>) {
        tracing::info!("{}", message);
    }
}

/// In-memory sink collecting formatted lines, for tests and callers that
/// assert on output.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().unwrap().is_empty()
    }
}

impl LogSink for MemorySink {
    fn printf(&self, message: fmt::Arguments<'_>) {
        self.lines.lock().unwrap().push(message.to_string());
    }
}

struct CreatingLog {
    sink: Arc<dyn LogSink>,
}

#[async_trait]
impl SpecHook for CreatingLog {
    async fn run(&self, spec: &mut SandboxSpec) -> anyhow::Result<()> {
        self.sink
            .printf(format_args!("creating sandbox from image {}", spec.image));
        Ok(())
    }
}

struct StartingLog {
    sink: Arc<dyn LogSink>,
}

#[async_trait]
impl SandboxHook for StartingLog {
    async fn run(&self, handle: &SandboxHandle) -> anyhow::Result<()> {
        if handle.is_restart() {
            self.sink
                .printf(format_args!("restarting sandbox: {}", handle.id()));
        } else {
            self.sink
                .printf(format_args!("starting sandbox: {}", handle.id()));
        }
        Ok(())
    }
}

struct PhaseLog {
    sink: Arc<dyn LogSink>,
    template: &'static str,
}

#[async_trait]
impl SandboxHook for PhaseLog {
    async fn run(&self, handle: &SandboxHandle) -> anyhow::Result<()> {
        self.sink
            .printf(format_args!("{}: {}", self.template, handle.id()));
        Ok(())
    }
}

/// The built-in observability bundle: one log line per phase entry,
/// written through the injected sink.
///
/// It composes under the ordering rule like any other bundle, and there
/// is no deduplication: registering it N times produces N lines per edge.
pub fn logging_hooks(sink: Arc<dyn LogSink>) -> HookBundle {
    let phase = |template| PhaseLog {
        sink: sink.clone(),
        template,
    };

    HookBundle::new()
        .on_pre_create(CreatingLog { sink: sink.clone() })
        .on_post_create(phase("sandbox created"))
        .on_pre_start(StartingLog { sink: sink.clone() })
        .on_post_start(phase("sandbox started"))
        .on_post_ready(phase("sandbox ready"))
        .on_pre_stop(phase("stopping sandbox"))
        .on_post_stop(phase("sandbox stopped"))
        .on_pre_terminate(phase("terminating sandbox"))
        .on_post_terminate(phase("sandbox terminated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::combine;

    #[test]
    fn test_memory_sink_collects_lines() {
        let sink = MemorySink::new();
        sink.printf(format_args!("hello {}", 1));
        sink.printf(format_args!("hello {}", 2));
        assert_eq!(sink.lines(), vec!["hello 1", "hello 2"]);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_creating_line_names_the_image() {
        let sink = Arc::new(MemorySink::new());
        let bundle = logging_hooks(sink.clone());

        let combined = combine(&[], &[bundle]);
        let mut spec = SandboxSpec::from_image("nginx:alpine");
        combined.creating(&mut spec).await.expect("pipeline failed");

        assert_eq!(sink.lines(), vec!["creating sandbox from image nginx:alpine"]);
    }

    #[test]
    fn test_bundle_covers_every_runtime_edge() {
        let sink: Arc<dyn LogSink> = Arc::new(MemorySink::new());
        let bundle = logging_hooks(sink);

        assert_eq!(bundle.pre_creates.len(), 1);
        assert_eq!(bundle.post_creates.len(), 1);
        assert_eq!(bundle.pre_starts.len(), 1);
        assert_eq!(bundle.post_starts.len(), 1);
        assert_eq!(bundle.post_readies.len(), 1);
        assert_eq!(bundle.pre_stops.len(), 1);
        assert_eq!(bundle.post_stops.len(), 1);
        assert_eq!(bundle.pre_terminates.len(), 1);
        assert_eq!(bundle.post_terminates.len(), 1);
        assert!(bundle.pre_builds.is_empty());
        assert!(bundle.post_builds.is_empty());
    }
}
