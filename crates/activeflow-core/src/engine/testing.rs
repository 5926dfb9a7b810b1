//! In-process stand-ins for external programs.

use super::config::{ContextConfigBuilder, ExecutorConfig};
use super::context::ExecutionContext;
use super::process::{
    ExitKind, Invocation, Launcher, ProcessDescriptor, ProcessError, ProcessOutcome, STDERR_FILE,
    STDOUT_FILE, stage_inputs,
};
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) type Script = Arc<dyn Fn(&Invocation, &Path) -> std::io::Result<ExitKind> + Send + Sync>;

/// Runs a closure per program name instead of spawning a process.
///
/// The closure receives the invocation and its staged working directory and
/// writes whatever output files the real program would produce.
#[derive(Clone, Default)]
pub(crate) struct ScriptedLauncher {
    scripts: HashMap<String, Script>,
    launches: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on<F>(mut self, program: &str, script: F) -> Self
    where
        F: Fn(&Invocation, &Path) -> std::io::Result<ExitKind> + Send + Sync + 'static,
    {
        self.scripts.insert(program.to_string(), Arc::new(script));
        self
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(
        &self,
        invocation: Invocation,
        workdir: PathBuf,
    ) -> BoxFuture<'static, Result<ProcessOutcome, ProcessError>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.get(&invocation.descriptor.program).cloned();
        async move {
            stage_inputs(&invocation.inputs, &workdir).await?;
            let stdout = workdir.join(STDOUT_FILE);
            let stderr = workdir.join(STDERR_FILE);
            let io_err = |source| ProcessError::Io {
                path: workdir.clone(),
                source,
            };
            std::fs::write(&stdout, "").map_err(io_err)?;
            std::fs::write(&stderr, "").map_err(io_err)?;
            let exit = match script {
                Some(script) => script(&invocation, &workdir).map_err(io_err)?,
                None => ExitKind::Failed(Some(127)),
            };
            Ok(ProcessOutcome {
                exit,
                workdir,
                stdout,
                stderr,
            })
        }
        .boxed()
    }
}

/// Executors `reference` (program `cp2k`), `sampler` (program `sampler`) and
/// `model` (program `trainer`).
pub(crate) fn test_context(root: &Path, launcher: ScriptedLauncher) -> ExecutionContext {
    let executor = |name: &str, program: &str| ExecutorConfig {
        name: name.to_string(),
        descriptor: ProcessDescriptor::new(program),
        max_concurrent: 4,
    };
    let config = ContextConfigBuilder::new()
        .root(root.to_path_buf())
        .executor(executor("reference", "cp2k"))
        .executor(executor("sampler", "sampler"))
        .executor(executor("model", "trainer"))
        .build()
        .unwrap();
    ExecutionContext::with_launcher(config, Arc::new(launcher)).unwrap()
}
