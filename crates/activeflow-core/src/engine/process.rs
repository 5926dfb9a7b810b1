use futures_util::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub const STDOUT_FILE: &str = "stdout.log";
pub const STDERR_FILE: &str = "stderr.log";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Invalid process descriptor: {0}")]
    Invalid(String),
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("I/O error in working directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unknown executor '{0}'")]
    UnknownExecutor(String),
}

/// Where an external job runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum WorkdirPolicy {
    /// A fresh directory under the context root.
    #[default]
    Scratch,
    /// A fresh directory under the given base.
    Within(PathBuf),
}

/// Static description of an external program.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessDescriptor {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: WorkdirPolicy,
    pub walltime: Option<Duration>,
}

impl ProcessDescriptor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            workdir: WorkdirPolicy::Scratch,
            walltime: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn walltime(mut self, walltime: Duration) -> Self {
        self.walltime = Some(walltime);
        self
    }

    pub fn workdir(mut self, policy: WorkdirPolicy) -> Self {
        self.workdir = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.program.trim().is_empty() {
            return Err(ProcessError::Invalid("program must not be empty".into()));
        }
        if self.walltime.is_some_and(|w| w.is_zero()) {
            return Err(ProcessError::Invalid("walltime must be positive".into()));
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(ProcessError::Invalid(format!("invalid environment variable name '{key}'")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    Contents(String),
    Copy(PathBuf),
}

/// A file staged into the working directory before launch.
#[derive(Debug, Clone, PartialEq)]
pub struct InputFile {
    pub name: String,
    pub source: InputSource,
}

impl InputFile {
    pub fn contents(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: InputSource::Contents(contents.into()),
        }
    }

    pub fn copy(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: InputSource::Copy(path.into()),
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// One concrete run of an external program.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub descriptor: ProcessDescriptor,
    pub extra_args: Vec<String>,
    pub inputs: Vec<InputFile>,
}

impl Invocation {
    pub fn new(descriptor: ProcessDescriptor) -> Self {
        Self {
            descriptor,
            extra_args: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn input(mut self, input: InputFile) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn validate(&self) -> Result<(), ProcessError> {
        self.descriptor.validate()?;
        for (i, input) in self.inputs.iter().enumerate() {
            if !is_plain_name(&input.name) {
                return Err(ProcessError::Invalid(format!(
                    "input file name '{}' must be a plain relative name",
                    input.name
                )));
            }
            if self.inputs[..i].iter().any(|other| other.name == input.name) {
                return Err(ProcessError::Invalid(format!("input file '{}' staged twice", input.name)));
            }
        }
        Ok(())
    }

    pub fn command_line(&self) -> Vec<&str> {
        std::iter::once(self.descriptor.program.as_str())
            .chain(self.descriptor.args.iter().map(String::as_str))
            .chain(self.extra_args.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Failed(Option<i32>),
    TimedOut,
}

impl From<ExitStatus> for ExitKind {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            ExitKind::Success
        } else {
            ExitKind::Failed(status.code())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub exit: ExitKind,
    pub workdir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.exit == ExitKind::Success
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.workdir.join(name)
    }
}

/// Runs an invocation inside a prepared working directory.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        invocation: Invocation,
        workdir: PathBuf,
    ) -> BoxFuture<'static, Result<ProcessOutcome, ProcessError>>;
}

/// Creates an empty `workdir` holding only `inputs`.
pub(crate) async fn stage_inputs(inputs: &[InputFile], workdir: &Path) -> Result<(), ProcessError> {
    let io_err = |source: std::io::Error| ProcessError::Io {
        path: workdir.to_path_buf(),
        source,
    };
    match tokio::fs::remove_dir_all(workdir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(io_err(e)),
        _ => {}
    }
    tokio::fs::create_dir_all(workdir).await.map_err(io_err)?;
    for input in inputs {
        let target = workdir.join(&input.name);
        match &input.source {
            InputSource::Contents(text) => tokio::fs::write(&target, text).await.map_err(io_err)?,
            InputSource::Copy(path) => {
                tokio::fs::copy(path, &target).await.map_err(|source| ProcessError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }
    }
    Ok(())
}

/// Launches programs on the local machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

impl Launcher for LocalLauncher {
    fn launch(
        &self,
        invocation: Invocation,
        workdir: PathBuf,
    ) -> BoxFuture<'static, Result<ProcessOutcome, ProcessError>> {
        async move {
            stage_inputs(&invocation.inputs, &workdir).await?;
            let stdout = workdir.join(STDOUT_FILE);
            let stderr = workdir.join(STDERR_FILE);
            let open = |path: &Path| {
                std::fs::File::create(path).map_err(|source| ProcessError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            };
            let descriptor = &invocation.descriptor;
            let mut child = Command::new(&descriptor.program)
                .args(&descriptor.args)
                .args(&invocation.extra_args)
                .envs(&descriptor.env)
                .current_dir(&workdir)
                .stdin(Stdio::null())
                .stdout(Stdio::from(open(&stdout)?))
                .stderr(Stdio::from(open(&stderr)?))
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| ProcessError::Spawn {
                    program: descriptor.program.clone(),
                    source,
                })?;
            debug!(command = ?invocation.command_line(), workdir = %workdir.display(), "Launched process");

            let wait_err = |source| ProcessError::Io {
                path: workdir.clone(),
                source,
            };
            let exit = match descriptor.walltime {
                Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                    Ok(status) => ExitKind::from(status.map_err(wait_err)?),
                    Err(_) => {
                        warn!(program = %descriptor.program, ?limit, "Walltime exceeded; killing process");
                        let _ = child.kill().await;
                        ExitKind::TimedOut
                    }
                },
                None => ExitKind::from(child.wait().await.map_err(wait_err)?),
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
