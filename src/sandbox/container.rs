//! Container sandbox implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;

use crate::config::{ContainerConfig, RunnerConfig};
use crate::error::{Error, Result};

use super::docker::{self, BindMount, DockerClient};
use super::tracker::is_background_command;
use super::workspace::Workspace;
use super::{resolve_path, shell_quote, CommandOutput, CommandSpec, Sandbox};

/// A sandbox backed by one long-lived container per run.
///
/// By default the host workspace is bind-mounted at the container workdir so
/// files are visible on both sides. In isolated mode nothing is mounted:
/// the workspace is copied in at start and, when preserved, copied back out.
pub struct ContainerSandbox {
    docker: DockerClient,
    settings: ContainerConfig,
    workspace: Workspace,
    workdir: PathBuf,
    container_id: Option<String>,
    default_timeout: Duration,
    max_output_bytes: usize,
    spool_seq: u32,
}

impl ContainerSandbox {
    /// Plans a container sandbox for `run_id`. Nothing is created until
    /// [`Sandbox::initialize`].
    pub fn new(config: &RunnerConfig, run_id: &str) -> Self {
        let settings = config.container.clone();
        Self {
            docker: DockerClient::new(settings.socket_path()),
            workdir: PathBuf::from(&settings.workdir),
            workspace: Workspace::plan(&config.workspace_base(), run_id),
            settings,
            container_id: None,
            default_timeout: config.command_timeout(),
            max_output_bytes: config.max_output_bytes,
            spool_seq: 0,
        }
    }

    /// Id of the running container, once initialized.
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    fn container_name(&self) -> String {
        let name = self
            .workspace
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.workspace.run_id().to_string());
        format!("tutorial-runner-{}", name)
    }

    fn id(&self) -> Result<&str> {
        self.container_id
            .as_deref()
            .ok_or_else(|| Error::Sandbox("container sandbox is not initialized".to_string()))
    }

    /// Relative paths live on the host when the workspace is bind-mounted.
    fn host_side(&self, path: &str) -> Option<PathBuf> {
        if self.settings.isolated || path.starts_with('/') {
            None
        } else {
            Some(resolve_path(self.workspace.path(), path))
        }
    }

    fn container_path(&self, path: &str) -> String {
        resolve_path(&self.workdir, path).to_string_lossy().to_string()
    }

    async fn ensure_image(&self) -> Result<()> {
        let image = &self.settings.image;
        if self.docker.image_exists(image).await? {
            return Ok(());
        }

        match &self.settings.dockerfile {
            Some(dockerfile) if dockerfile.exists() => {
                docker::build_image(image, dockerfile).await
            }
            dockerfile => Err(Error::ImageMissing {
                image: image.clone(),
                remediation: docker::build_remediation(image, dockerfile.as_deref()),
            }),
        }
    }

    async fn exec(
        &self,
        command: &str,
        workdir: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput> {
        let id = self.id()?;
        self.docker
            .exec(id, command, workdir, env, self.max_output_bytes)
            .await
    }

    /// Runs a helper command at the workdir, failing on a non-zero exit.
    async fn exec_checked(&self, command: &str) -> Result<CommandOutput> {
        let workdir = self.workdir.to_string_lossy().to_string();
        let output = self.exec(command, &workdir, &BTreeMap::new()).await?;
        if output.exit_code != 0 {
            return Err(Error::Sandbox(format!(
                "`{}` failed in container (exit {}): {}",
                command,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn start_container(&mut self) -> Result<()> {
        let host = tokio::fs::canonicalize(self.workspace.path()).await?;
        let bind = BindMount {
            host,
            container: self.settings.workdir.clone(),
        };
        let bind = (!self.settings.isolated).then_some(&bind);

        let name = self.container_name();
        let id = self
            .docker
            .create_container(&name, &self.settings.image, &self.settings.workdir, bind)
            .await?;
        self.container_id = Some(id.clone());
        self.docker.start_container(&id).await?;

        tracing::info!(
            container = %name,
            image = %self.settings.image,
            isolated = self.settings.isolated,
            "started sandbox container"
        );

        if self.settings.isolated {
            self.exec_checked(&format!("mkdir -p {}", shell_quote(&self.settings.workdir)))
                .await?;
            let source = format!("{}/.", self.workspace.path().display());
            docker::copy(&source, &format!("{}:{}", id, self.settings.workdir)).await?;
        }
        Ok(())
    }

    /// Wraps a backgrounding command so its output goes to spool files.
    ///
    /// An attached exec stream stays open while any process holds its
    /// stdout, so detached children would otherwise block the call.
    fn spooled(&mut self, command: &str) -> (String, String, String) {
        self.spool_seq += 1;
        let out = format!("/tmp/.tutorial-runner-{}.out", self.spool_seq);
        let err = format!("/tmp/.tutorial-runner-{}.err", self.spool_seq);
        let wrapped = format!("{{ {}\n}} >{} 2>{} </dev/null", command, out, err);
        (wrapped, out, err)
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn name(&self) -> &str {
        "container"
    }

    fn root(&self) -> &Path {
        &self.workdir
    }

    fn host_path(&self) -> &Path {
        self.workspace.path()
    }

    async fn initialize(&mut self) -> Result<()> {
        if !self.docker.ping().await {
            return Err(Error::SandboxCreation(format!(
                "docker engine is not reachable at {}",
                self.docker.socket().display()
            )));
        }
        self.workspace.create().await?;
        self.ensure_image().await?;
        self.start_container().await
    }

    async fn run(&mut self, spec: &CommandSpec) -> Result<CommandOutput> {
        let dir = spec.working_dir.as_deref().unwrap_or("");
        match self.host_side(dir) {
            Some(host_dir) => tokio::fs::create_dir_all(&host_dir).await?,
            None => {
                let target = self.container_path(dir);
                self.exec_checked(&format!("mkdir -p {}", shell_quote(&target)))
                    .await?;
            }
        }
        let workdir = self.container_path(dir);
        let timeout = spec.timeout.unwrap_or(self.default_timeout);

        tracing::debug!(command = %spec.command, workdir = %workdir, "running container command");

        if is_background_command(&spec.command) {
            let (wrapped, out, err) = self.spooled(&spec.command);
            let status = tokio::time::timeout(timeout, self.exec(&wrapped, &workdir, &spec.env))
                .await
                .map_err(|_| Error::Timeout(timeout))??;
            let stdout = self.exec_checked(&format!("cat {}", out)).await?.stdout;
            let stderr = self.exec_checked(&format!("cat {}", err)).await?.stdout;
            return Ok(CommandOutput {
                exit_code: status.exit_code,
                stdout,
                stderr,
            });
        }

        // Timed-out processes keep running until the container is stopped.
        let output = tokio::time::timeout(timeout, self.exec(&spec.command, &workdir, &spec.env))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        tracing::debug!(exit_code = output.exit_code, "container command finished");
        Ok(output)
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        if let Some(host) = self.host_side(path) {
            return Ok(tokio::fs::read_to_string(host).await?);
        }
        let target = self.container_path(path);
        Ok(self
            .exec_checked(&format!("cat {}", shell_quote(&target)))
            .await?
            .stdout)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        if let Some(host) = self.host_side(path) {
            if let Some(parent) = host.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&host, content).await?;
            return Ok(());
        }

        let target = self.container_path(path);
        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        let command = format!(
            "mkdir -p \"$(dirname {target})\" && printf '%s' {data} | base64 -d > {target}",
            target = shell_quote(&target),
            data = shell_quote(&encoded),
        );
        self.exec_checked(&command).await?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        if let Some(host) = self.host_side(path) {
            return Ok(tokio::fs::try_exists(host).await?);
        }
        let target = self.container_path(path);
        let workdir = self.workdir.to_string_lossy().to_string();
        let output = self
            .exec(&format!("test -e {}", shell_quote(&target)), &workdir, &BTreeMap::new())
            .await?;
        Ok(output.exit_code == 0)
    }

    async fn cleanup(&mut self, preserve: bool) {
        if let Some(id) = self.container_id.take() {
            if preserve && self.settings.isolated {
                let source = format!("{}:{}/.", id, self.settings.workdir);
                let dest = self.workspace.path().to_string_lossy().to_string();
                if let Err(e) = docker::copy(&source, &dest).await {
                    tracing::warn!(error = %e, "failed to copy workspace out of container");
                }
            }
            if let Err(e) = self.docker.stop_container(&id).await {
                tracing::warn!(error = %e, container = %id, "failed to stop container");
            }
            match self.docker.remove_container(&id).await {
                Ok(()) => tracing::debug!(container = %id, "removed sandbox container"),
                Err(e) => tracing::warn!(error = %e, container = %id, "failed to remove container"),
            }
        }
        self.workspace.remove(preserve).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox(isolated: bool) -> (TempDir, ContainerSandbox) {
        let base = TempDir::new().unwrap();
        let mut config = RunnerConfig::default().with_workspace_dir(base.path());
        config.container.isolated = isolated;
        let sandbox = ContainerSandbox::new(&config, "container-test");
        (base, sandbox)
    }

    #[test]
    fn bound_workspace_uses_host_for_relative_paths() {
        let (_base, sandbox) = sandbox(false);
        let host = sandbox.host_side("src/app.js").unwrap();
        assert!(host.starts_with(sandbox.host_path()));
        assert!(sandbox.host_side("/etc/hosts").is_none());
    }

    #[test]
    fn isolated_workspace_never_touches_host() {
        let (_base, sandbox) = sandbox(true);
        assert!(sandbox.host_side("src/app.js").is_none());
        assert_eq!(sandbox.container_path("src/app.js"), "/workspace/src/app.js");
        assert_eq!(sandbox.container_path(""), "/workspace");
    }

    #[test]
    fn background_commands_are_spooled() {
        let (_base, mut sandbox) = sandbox(false);
        let (wrapped, out, err) = sandbox.spooled("npm run dev &");
        assert!(wrapped.starts_with("{ npm run dev &\n}"));
        assert!(wrapped.contains(&format!(">{}", out)));
        assert!(wrapped.contains(&format!("2>{}", err)));

        let (_, next_out, _) = sandbox.spooled("x &");
        assert_ne!(out, next_out);
    }

    #[tokio::test]
    async fn run_before_initialize_is_an_error() {
        let (_base, mut sandbox) = sandbox(true);
        let err = sandbox.run(&CommandSpec::new("true")).await.unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
    }

    #[tokio::test]
    async fn cleanup_without_container_is_a_no_op() {
        let (_base, mut sandbox) = sandbox(false);
        sandbox.cleanup(false).await;
        assert!(sandbox.container_id().is_none());
    }
}
