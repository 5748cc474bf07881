//! External command execution
//!
//! All shell-outs of the daemon go through [`Execs`]. The underlying
//! [`CommandRunner`] is an injected capability so tests can substitute a
//! recording fake.

use crate::config::ExecutablesConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs external commands. The production implementation spawns real
/// processes; tests record the invocations instead.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command to completion, optionally feeding stdin, and
    /// returns its captured output.
    async fn run(&self, name: &str, args: &[String], stdin: Option<&str>)
        -> std::io::Result<Output>;
}

/// Command runner backed by the operating system.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        name: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> std::io::Result<Output> {
        let mut command = tokio::process::Command::new(name);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
            }
        }
        child.wait_with_output().await
    }
}

/// Shell-out shim for `ip`, `nft`, `resolvectl` and `sysctl`. Cancelling
/// the token aborts running children.
pub struct Execs {
    runner: Arc<dyn CommandRunner>,
    config: ExecutablesConfig,
    cancel: CancellationToken,
}

impl Execs {
    /// Creates a new exec shim with the given runner and executables.
    pub fn new(
        config: ExecutablesConfig,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            config,
            cancel,
        }
    }

    async fn run(&self, name: &str, args: &[&str], stdin: Option<&str>) -> Result<Vec<u8>> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let command = format!("{} {}", name, args.join(" "));
        debug!("running command: {}", command);

        let output = tokio::select! {
            result = self.runner.run(name, &args, stdin) => result?,
            _ = self.cancel.cancelled() => return Err(Error::Canceled(command)),
        };
        if !output.status.success() {
            return Err(Error::command(
                command,
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(output.stdout)
    }

    /// Runs `ip` with raw arguments.
    pub async fn run_ip(&self, args: &[&str]) -> Result<Vec<u8>> {
        self.run(&self.config.ip, args, None).await
    }

    /// Runs `ip link` with arguments.
    pub async fn run_ip_link(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut all = vec!["link"];
        all.extend_from_slice(args);
        self.run_ip(&all).await
    }

    /// Runs `ip address` with arguments.
    pub async fn run_ip_address(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut all = vec!["address"];
        all.extend_from_slice(args);
        self.run_ip(&all).await
    }

    /// Runs `ip route` for the given address family with arguments.
    pub async fn run_ip_route(&self, family: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut all = vec![family, "route"];
        all.extend_from_slice(args);
        self.run_ip(&all).await
    }

    /// Runs `ip rule` for the given address family with arguments.
    pub async fn run_ip_rule(&self, family: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut all = vec![family, "rule"];
        all.extend_from_slice(args);
        self.run_ip(&all).await
    }

    /// Runs `nft -f -` with the program fed through stdin.
    pub async fn run_nft(&self, program: &str) -> Result<()> {
        self.run(&self.config.nft, &["-f", "-"], Some(program))
            .await?;
        Ok(())
    }

    /// Runs `resolvectl` with arguments.
    pub async fn run_resolvectl(&self, args: &[&str]) -> Result<Vec<u8>> {
        self.run(&self.config.resolvectl, args, None).await
    }

    /// Runs `sysctl` with arguments.
    pub async fn run_sysctl(&self, args: &[&str]) -> Result<Vec<u8>> {
        self.run(&self.config.sysctl, args, None).await
    }
}
