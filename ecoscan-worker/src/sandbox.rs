//! Launches the analyzer inside an isolated rootfs bundle.
//!
//! The bundle is an OCI-like directory tree executed by a lightweight
//! isolation runtime. The adapter's contract is narrow: run a program with
//! arguments, hand back its stdout. Children are spawned with
//! `kill_on_drop`, so dropping an in-flight run (client disconnect, memory
//! monitor trip, worker shutdown) terminates the sandboxed process.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::errors::include_stderr;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The runtime could not be started at all.
    #[error("sandbox launch: {0}")]
    Launch(#[from] std::io::Error),
    /// The runtime started but the program exited non-zero; stderr is
    /// included in the message.
    #[error("sandbox exit: {0}")]
    Exit(String),
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Runs `program` with `args` inside the bundle and returns its stdout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, SandboxError>;
}

/// The production sandbox: a bundle directory plus the isolation runtime
/// that executes it.
pub struct Sandbox {
    bundle: PathBuf,
    runtime: PathBuf,
}

impl Sandbox {
    pub fn new(bundle: impl Into<PathBuf>, runtime: impl Into<PathBuf>) -> Self {
        Self {
            bundle: bundle.into(),
            runtime: runtime.into(),
        }
    }
}

#[async_trait]
impl SandboxRunner for Sandbox {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, SandboxError> {
        debug!(program, ?args, bundle = %self.bundle.display(), "starting sandboxed program");
        let output = Command::new(&self.runtime)
            .arg("run")
            .arg("--bundle")
            .arg(&self.bundle)
            .arg(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(SandboxError::Exit(include_stderr(&output)));
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted sandbox for scanner tests: records invocations and replays a
    /// canned response after an optional delay.
    pub struct FakeSandbox {
        pub response: Mutex<Result<Vec<u8>, String>>,
        pub delay: Duration,
        pub calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeSandbox {
        pub fn returning(stdout: &[u8]) -> Self {
            Self {
                response: Mutex::new(Ok(stdout.to_vec())),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn slow(stdout: &[u8], delay: Duration) -> Self {
            Self {
                delay,
                ..Self::returning(stdout)
            }
        }
    }

    #[async_trait]
    impl SandboxRunner for FakeSandbox {
        async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, SandboxError> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().map(|a| a.to_string()));
            self.calls.lock().unwrap().push(call);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &*self.response.lock().unwrap() {
                Ok(stdout) => Ok(stdout.clone()),
                Err(msg) => Err(SandboxError::Exit(msg.clone())),
            }
        }
    }
}
