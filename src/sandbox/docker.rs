//! Minimal Docker Engine API client over the local Unix socket.
//!
//! Only the handful of endpoints the container sandbox needs are wrapped.
//! Image builds and archive copies shell out to the `docker` CLI instead,
//! since their tar-stream bodies add nothing the CLI does not already do.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as HyperlocalUri};
use serde_json::{json, Value};
use tokio::process::Command;

use super::frame::FrameDecoder;
use super::CommandOutput;
use crate::error::{Error, Result};

/// Parsed JSON response from the Engine.
#[derive(Debug)]
struct JsonResponse {
    status: StatusCode,
    body: Value,
    raw_body: String,
}

impl JsonResponse {
    fn message(&self) -> String {
        self.body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.raw_body.trim().to_string())
    }

    fn into_error(self, operation: &'static str) -> Error {
        Error::Docker {
            operation,
            status: self.status.as_u16(),
            message: self.message(),
        }
    }
}

/// Mount of a host directory into a container.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: String,
}

/// Talks to the Docker Engine through its Unix socket.
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
}

impl DockerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        operation: &'static str,
    ) -> Result<Response<Incoming>> {
        let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
        let uri: Uri = HyperlocalUri::new(&self.socket, path).into();

        let mut builder = Request::builder().method(method).uri(uri);
        let request_body = match body {
            Some(payload) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(payload.to_string()))
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder.body(request_body).map_err(|e| Error::Docker {
            operation,
            status: 0,
            message: format!("failed to build request: {}", e),
        })?;

        client.request(request).await.map_err(|e| Error::Docker {
            operation,
            status: 0,
            message: format!("cannot reach {}: {}", self.socket.display(), e),
        })
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        operation: &'static str,
    ) -> Result<JsonResponse> {
        let response = self.send(method, path, body, operation).await?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Docker {
                operation,
                status: status.as_u16(),
                message: format!("failed to read response: {}", e),
            })?
            .to_bytes();

        let raw_body = String::from_utf8_lossy(&bytes).into_owned();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(raw_body.clone()))
        };
        Ok(JsonResponse {
            status,
            body,
            raw_body,
        })
    }

    /// Returns true if the engine answers a ping.
    pub async fn ping(&self) -> bool {
        match self.request_json(Method::GET, "/_ping", None, "ping").await {
            Ok(resp) => resp.status.is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "docker ping failed");
                false
            }
        }
    }

    /// Returns true if `image` is present locally.
    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        let path = format!("/images/{}/json", image);
        let resp = self
            .request_json(Method::GET, &path, None, "inspect image")
            .await?;
        match resp.status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(resp.into_error("inspect image")),
        }
    }

    /// Creates a container that idles until stopped. Returns its id.
    pub async fn create_container(
        &self,
        name: &str,
        image: &str,
        workdir: &str,
        bind: Option<&BindMount>,
    ) -> Result<String> {
        let binds: Vec<String> = bind
            .map(|b| vec![format!("{}:{}", b.host.display(), b.container)])
            .unwrap_or_default();
        let payload = json!({
            "Image": image,
            "Cmd": ["sleep", "infinity"],
            "WorkingDir": workdir,
            "Tty": false,
            "OpenStdin": false,
            "Labels": { "tutorial-runner": "sandbox" },
            "HostConfig": {
                "Binds": binds,
                "Init": true,
            },
        });

        let path = format!("/containers/create?name={}", name);
        let resp = self
            .request_json(Method::POST, &path, Some(payload), "create container")
            .await?;
        if !resp.status.is_success() {
            return Err(resp.into_error("create container"));
        }
        resp.body
            .get("Id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Docker {
                operation: "create container",
                status: resp.status.as_u16(),
                message: "response did not include a container id".to_string(),
            })
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}/start", id);
        let resp = self
            .request_json(Method::POST, &path, None, "start container")
            .await?;
        // 304: already running
        if resp.status.is_success() || resp.status == StatusCode::NOT_MODIFIED {
            Ok(())
        } else {
            Err(resp.into_error("start container"))
        }
    }

    /// Stops a container. Already-stopped and missing containers are not errors.
    pub async fn stop_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}/stop?t=5", id);
        let resp = self
            .request_json(Method::POST, &path, None, "stop container")
            .await?;
        match resp.status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(resp.into_error("stop container")),
        }
    }

    /// Force-removes a container and its anonymous volumes.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}?force=true&v=true", id);
        let resp = self
            .request_json(Method::DELETE, &path, None, "remove container")
            .await?;
        match resp.status {
            s if s.is_success() => Ok(()),
            // gone already, or removal in progress
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(()),
            _ => Err(resp.into_error("remove container")),
        }
    }

    /// Runs `sh -c command` in the container and collects demultiplexed output.
    pub async fn exec(
        &self,
        id: &str,
        command: &str,
        workdir: &str,
        env: &BTreeMap<String, String>,
        limit: usize,
    ) -> Result<CommandOutput> {
        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let payload = json!({
            "Cmd": ["sh", "-c", command],
            "AttachStdin": false,
            "AttachStdout": true,
            "AttachStderr": true,
            "Tty": false,
            "WorkingDir": workdir,
            "Env": env,
        });

        let path = format!("/containers/{}/exec", id);
        let resp = self
            .request_json(Method::POST, &path, Some(payload), "create exec")
            .await?;
        if !resp.status.is_success() {
            return Err(resp.into_error("create exec"));
        }
        let exec_id = resp
            .body
            .get("Id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Docker {
                operation: "create exec",
                status: resp.status.as_u16(),
                message: "response did not include an exec id".to_string(),
            })?;

        let (stdout, stderr) = self.start_exec(&exec_id, limit).await?;
        let exit_code = self.exec_exit_code(&exec_id).await?;

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Starts an exec attached and streams its output through a [`FrameDecoder`].
    async fn start_exec(&self, exec_id: &str, limit: usize) -> Result<(String, String)> {
        let path = format!("/exec/{}/start", exec_id);
        let payload = json!({ "Detach": false, "Tty": false });
        let response = self
            .send(Method::POST, &path, Some(payload), "start exec")
            .await?;

        let status = response.status();
        if !status.is_success() {
            let bytes = response
                .into_body()
                .collect()
                .await
                .map(|c| c.to_bytes())
                .unwrap_or_default();
            return Err(Error::Docker {
                operation: "start exec",
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }

        let mut body = response.into_body();
        let mut decoder = FrameDecoder::new(limit);
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| Error::Docker {
                operation: "start exec",
                status: status.as_u16(),
                message: format!("output stream failed: {}", e),
            })?;
            if let Ok(data) = frame.into_data() {
                decoder.push(&data)?;
            }
        }
        Ok(decoder.finish())
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i32> {
        let path = format!("/exec/{}/json", exec_id);
        let resp = self
            .request_json(Method::GET, &path, None, "inspect exec")
            .await?;
        if !resp.status.is_success() {
            return Err(resp.into_error("inspect exec"));
        }
        resp.body
            .get("ExitCode")
            .and_then(Value::as_i64)
            .and_then(|code| i32::try_from(code).ok())
            .ok_or_else(|| Error::Docker {
                operation: "inspect exec",
                status: resp.status.as_u16(),
                message: "exec has no exit code".to_string(),
            })
    }
}

/// Builds `image` from `dockerfile` with the docker CLI.
pub async fn build_image(image: &str, dockerfile: &Path) -> Result<()> {
    let context = dockerfile
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    tracing::info!(image = %image, dockerfile = ?dockerfile, "building sandbox image");
    let output = Command::new("docker")
        .arg("build")
        .arg("-t")
        .arg(image)
        .arg("-f")
        .arg(dockerfile)
        .arg(context)
        .output()
        .await
        .map_err(|e| Error::Sandbox(format!("failed to run docker build: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::SandboxCreation(format!(
            "docker build of '{}' failed: {}",
            image,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Copies between host and container with `docker cp`.
pub async fn copy(source: &str, destination: &str) -> Result<()> {
    let output = Command::new("docker")
        .arg("cp")
        .arg(source)
        .arg(destination)
        .output()
        .await
        .map_err(|e| Error::Sandbox(format!("failed to run docker cp: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Sandbox(format!(
            "docker cp {} {} failed: {}",
            source,
            destination,
            stderr.trim()
        )));
    }
    Ok(())
}

/// The command a user should run to build a missing image.
pub fn build_remediation(image: &str, dockerfile: Option<&Path>) -> String {
    let dockerfile = dockerfile
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "Dockerfile".to_string());
    format!("docker build -t {} -f {} .", image, dockerfile)
}
