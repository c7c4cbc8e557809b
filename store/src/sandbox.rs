//! Running builder executables.
//!
//! The [Sandbox] trait is the boundary between the build pipeline and
//! whatever isolates the builder process. [ProcessSandbox] runs it as a plain
//! child process without isolation, [DummySandbox] refuses to run anything.
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument};
use url::Url;

/// A single process to run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SandboxRequest {
    /// The executable followed by its arguments.
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub dir: PathBuf,
    /// Paths made visible inside the sandbox. A `:ro` suffix mounts the path
    /// read only.
    pub mounts: Vec<String>,
    /// Whether the process may use the network.
    pub network: bool,
    /// Capture stdout and stderr instead of passing them through.
    pub capture_output: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SandboxOutput {
    pub exit_code: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
}

impl SandboxOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Runs the process to completion. Dropping the returned future kills
    /// the process.
    async fn run(&self, request: SandboxRequest) -> std::io::Result<SandboxOutput>;
}

/// Runs builders as ordinary child processes. Mounts and the network flag
/// are not enforced.
#[derive(Clone, Debug, Default)]
pub struct ProcessSandbox {}

#[async_trait]
impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(args = ?request.args, dir = ?request.dir), err)]
    async fn run(&self, request: SandboxRequest) -> std::io::Result<SandboxOutput> {
        let (program, args) = request
            .args
            .split_first()
            .ok_or_else(|| std::io::Error::other("no program to run"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(request.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&request.dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if !request.capture_output {
            let status = command.status().await?;
            return Ok(SandboxOutput {
                exit_code: status.code().unwrap_or(-1),
                ..Default::default()
            });
        }

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        debug!(pid = ?child.id(), "spawned builder");

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr not captured"))?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let (status, _, _) = tokio::try_join!(
            child.wait(),
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err),
        )?;

        Ok(SandboxOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: out.into(),
            stderr: err.into(),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct DummySandbox {}

#[async_trait]
impl Sandbox for DummySandbox {
    #[instrument(skip_all, err)]
    async fn run(&self, _request: SandboxRequest) -> std::io::Result<SandboxOutput> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "running builders is not supported with DummySandbox",
        ))
    }
}

/// Constructs a [Sandbox] from an URI.
///
/// The following schemes are supported:
/// - `process://` ([ProcessSandbox])
/// - `dummy://` ([DummySandbox])
pub fn from_addr(uri: &str) -> std::io::Result<Box<dyn Sandbox>> {
    let url = Url::parse(uri)
        .map_err(|e| std::io::Error::other(format!("unable to parse url: {}", e)))?;

    Ok(match url.scheme() {
        "process" => Box::<ProcessSandbox>::default(),
        "dummy" => Box::<DummySandbox>::default(),
        scheme => Err(std::io::Error::other(format!("unknown scheme: {}", scheme)))?,
    })
}
