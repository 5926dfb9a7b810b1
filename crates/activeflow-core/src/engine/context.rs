use super::config::{ContextConfig, ExecutorConfig};
use super::deferred::Deferred;
use super::error::{EngineError, TaskError};
use super::process::{Invocation, Launcher, LocalLauncher, ProcessError, ProcessOutcome, WorkdirPolicy};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info};

struct Executor {
    config: ExecutorConfig,
    slots: Arc<Semaphore>,
}

struct ContextInner {
    root: PathBuf,
    session: String,
    counter: AtomicU64,
    coupling_groups: AtomicU64,
    runtime: Handle,
    launcher: Arc<dyn Launcher>,
    executors: HashMap<String, Executor>,
}

/// Shared handle to the scheduler, the file namespace and the executors.
///
/// Created once per process and passed explicitly to every component that
/// submits work. Cloning is cheap.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("root", &self.inner.root)
            .field("executors", &self.inner.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutionContext {
    /// Creates a context that launches jobs on the local machine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ContextConfig) -> Result<Self, EngineError> {
        Self::with_launcher(config, Arc::new(LocalLauncher))
    }

    pub fn with_launcher(config: ContextConfig, launcher: Arc<dyn Launcher>) -> Result<Self, EngineError> {
        let runtime = Handle::try_current()
            .map_err(|e| EngineError::Internal(format!("no async runtime available: {e}")))?;
        std::fs::create_dir_all(&config.root).map_err(|e| EngineError::io(&config.root, e))?;
        let session = claim_session(&config.root)?;
        for executor in &config.executors {
            executor.descriptor.validate()?;
        }
        let executors = config
            .executors
            .into_iter()
            .map(|config| {
                let slots = Arc::new(Semaphore::new(config.max_concurrent));
                (config.name.clone(), Executor { config, slots })
            })
            .collect();
        info!(root = %config.root.display(), session, "Execution context initialized");
        Ok(Self {
            inner: Arc::new(ContextInner {
                root: config.root,
                session,
                counter: AtomicU64::new(0),
                coupling_groups: AtomicU64::new(0),
                runtime,
                launcher,
                executors,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// The directory under the root that holds this context's files and jobs.
    pub fn session_dir(&self) -> PathBuf {
        self.inner.root.join(&self.inner.session)
    }

    fn next_id(&self) -> u64 {
        self.inner.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Identifier for a new group of coupled walkers.
    pub(crate) fn next_coupling_group(&self) -> u64 {
        self.inner.coupling_groups.fetch_add(1, Ordering::Relaxed)
    }

    /// A path no other call, and no earlier context on the same root, has handed out.
    pub fn new_file(&self, prefix: &str, suffix: &str) -> PathBuf {
        self.session_dir()
            .join(format!("{prefix}{:06}{suffix}", self.next_id()))
    }

    pub fn has_executor(&self, name: &str) -> bool {
        self.inner.executors.contains_key(name)
    }

    /// Starts a unit of work now and returns a handle to its result.
    pub fn submit<T, F>(&self, name: &str, future: F) -> Deferred<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let handle = self.inner.runtime.spawn(future);
        let name = name.to_string();
        Deferred::from_future(async move {
            handle
                .await
                .map_err(|e| TaskError::new(name, format!("task aborted: {e}")))?
        })
    }

    /// Starts a blocking computation (filesystem, CPU-bound) on the blocking pool.
    pub fn submit_blocking<T, F>(&self, name: &str, f: F) -> Deferred<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        let handle = self.inner.runtime.spawn_blocking(f);
        let name = name.to_string();
        Deferred::from_future(async move {
            handle
                .await
                .map_err(|e| TaskError::new(name, format!("task aborted: {e}")))?
        })
    }

    /// Runs a blocking computation once `input` resolves.
    pub fn then_blocking<A, T, F>(&self, name: &str, input: &Deferred<A>, f: F) -> Deferred<T>
    where
        A: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: FnOnce(A) -> Result<T, TaskError> + Send + 'static,
    {
        let input = input.clone();
        let task = name.to_string();
        self.submit(name, async move {
            let value = input.resolve().await?;
            tokio::task::spawn_blocking(move || f(value))
                .await
                .map_err(|e| TaskError::new(task, format!("task aborted: {e}")))?
        })
    }

    /// Prepares an invocation of the executor's program.
    pub fn invocation(&self, executor: &str) -> Result<Invocation, ProcessError> {
        self.inner
            .executors
            .get(executor)
            .map(|e| Invocation::new(e.config.descriptor.clone()))
            .ok_or_else(|| ProcessError::UnknownExecutor(executor.to_string()))
    }

    /// Waits for a free slot of `executor`, then launches the invocation.
    pub async fn run_process(
        &self,
        executor: &str,
        invocation: Invocation,
    ) -> Result<ProcessOutcome, ProcessError> {
        invocation.validate()?;
        let slots = self
            .inner
            .executors
            .get(executor)
            .map(|e| e.slots.clone())
            .ok_or_else(|| ProcessError::UnknownExecutor(executor.to_string()))?;
        let _permit = slots
            .acquire_owned()
            .await
            .map_err(|_| ProcessError::Invalid(format!("executor '{executor}' was shut down")))?;

        let base = match &invocation.descriptor.workdir {
            WorkdirPolicy::Scratch => self.session_dir(),
            WorkdirPolicy::Within(base) => base.join(&self.inner.session),
        };
        let workdir = base.join(format!("{executor}_{:06}", self.next_id()));
        debug!(executor, workdir = %workdir.display(), "Submitting external job");
        self.inner.launcher.launch(invocation, workdir).await
    }
}

/// Creates the first unused `session_NNN` directory under `root`.
///
/// Contexts restarted on the same root never see each other's files.
fn claim_session(root: &Path) -> Result<String, EngineError> {
    for index in 0.. {
        let name = format!("session_{index:03}");
        let dir = root.join(&name);
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok(name),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(EngineError::io(&dir, e)),
        }
    }
    Err(EngineError::Internal(format!(
        "no free session directory under {}",
        root.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::process::ExitKind;
    use crate::engine::testing::{ScriptedLauncher, test_context};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn new_file_hands_out_unique_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let a = ctx.new_file("data_", ".xyz");
        let b = ctx.new_file("data_", ".xyz");
        assert_ne!(a, b);
        assert!(a.starts_with(dir.path()));
        assert_eq!(a.extension().unwrap(), "xyz");
    }

    #[tokio::test]
    async fn contexts_on_the_same_root_use_separate_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let first = test_context(dir.path(), ScriptedLauncher::new());
        let second = test_context(dir.path(), ScriptedLauncher::new());
        assert_ne!(first.session_dir(), second.session_dir());
        assert_ne!(first.new_file("data_", ".xyz"), second.new_file("data_", ".xyz"));
        assert!(first.session_dir().is_dir());
        assert!(second.session_dir().is_dir());
    }

    #[tokio::test]
    async fn jobs_of_a_restarted_context_get_fresh_working_directories() {
        let dir = tempfile::tempdir().unwrap();
        let script = |_: &Invocation, workdir: &Path| {
            let stale = workdir.join("leftover");
            let seen = stale.exists();
            std::fs::write(stale, "x")?;
            Ok(if seen { ExitKind::Failed(Some(1)) } else { ExitKind::Success })
        };
        for _ in 0..2 {
            let ctx = test_context(dir.path(), ScriptedLauncher::new().on("cp2k", script));
            let invocation = ctx.invocation("reference").unwrap();
            let outcome = ctx.run_process("reference", invocation).await.unwrap();
            assert!(outcome.is_success());
        }
    }

    #[tokio::test]
    async fn submitted_work_runs_without_being_awaited() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        let marker = dir.path().join("marker");
        let target = marker.clone();
        let _ = ctx.submit_blocking("touch", move || {
            std::fs::write(&target, "x").map_err(|e| TaskError::new("touch", e))
        });
        for _ in 0..100 {
            if marker.exists() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn unknown_executor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), ScriptedLauncher::new());
        assert!(matches!(
            ctx.invocation("missing"),
            Err(ProcessError::UnknownExecutor(_))
        ));
    }
}
