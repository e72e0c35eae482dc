use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Engine REST API version the runtime speaks.
pub const API_VERSION: &str = "1.25";

#[derive(thiserror::Error, Debug)]
pub enum DockerError {
    #[error("container engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("container engine error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("container engine at {0} is unreachable")]
    Unreachable(Url),

    #[error("container engine API version {found} is below the required {required}")]
    ApiVersionTooOld { found: String, required: String },

    #[error("container attach failed: {0}")]
    Attach(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("{0}")]
    Other(String),
}

impl DockerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DockerError::Api { status: 404, .. })
    }
}

pub type AttachStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Thin client for the subset of the container-engine REST API the runtime
/// needs.
pub struct DockerClient {
    http: reqwest::Client,
    base: Url,
}

impl DockerClient {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, DockerError> {
        self.base
            .join(&format!("v{API_VERSION}/{path}"))
            .map_err(|err| DockerError::Other(format!("invalid engine path {path}: {err}")))
    }

    async fn parse(response: reqwest::Response) -> Result<serde_json::Value, DockerError> {
        let status = response.status();
        if status.is_success() {
            if status == reqwest::StatusCode::NO_CONTENT {
                return Ok(serde_json::Value::Null);
            }
            let text = response.text().await?;
            if text.is_empty() {
                return Ok(serde_json::Value::Null);
            }
            return Ok(serde_json::from_str(&text)
                .unwrap_or(serde_json::Value::String(text)));
        }

        let message = response
            .text()
            .await
            .ok()
            .and_then(|body| {
                serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|json| json["message"].as_str().map(str::to_string))
                    .or(Some(body))
            })
            .unwrap_or_default();
        Err(DockerError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn get(&self, path: &str) -> Result<serde_json::Value, DockerError> {
        let response = self.http.get(self.endpoint(path)?).send().await?;
        Self::parse(response).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, DockerError> {
        let mut request = self.http.post(self.endpoint(path)?);
        request = match body {
            Some(body) => request.json(body),
            None => request.header(reqwest::header::CONTENT_LENGTH, 0),
        };
        Self::parse(request.send().await?).await
    }

    pub async fn delete(&self, path: &str) -> Result<serde_json::Value, DockerError> {
        let response = self.http.delete(self.endpoint(path)?).send().await?;
        Self::parse(response).await
    }

    /// Confirms the engine is reachable and recent enough.
    pub async fn check_connection(&self) -> Result<(), DockerError> {
        let version = match self.get("version").await {
            Ok(version) => version,
            Err(DockerError::Http(_)) => {
                return Err(DockerError::Unreachable(self.base.clone()))
            }
            Err(err) => return Err(err),
        };
        let api_version = version["ApiVersion"].as_str().unwrap_or("0").to_string();
        if bridge::parse_version(&api_version) < bridge::parse_version(API_VERSION) {
            return Err(DockerError::ApiVersionTooOld {
                found: api_version,
                required: API_VERSION.to_string(),
            });
        }
        Ok(())
    }

    pub async fn inspect_image(&self, image: &str) -> Result<serde_json::Value, DockerError> {
        self.get(&format!("images/{image}/json")).await
    }

    /// Pulls an image, draining the progress stream to completion.
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        tracing::info!(image, "pulling image from the registry");
        let response = self
            .http
            .post(self.endpoint(&format!("images/create?fromImage={image}"))?)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DockerError::Api {
                status: status.as_u16(),
                message: format!("could not pull image '{image}'"),
            });
        }
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            chunk?;
        }
        Ok(())
    }

    pub async fn create_container(
        &self,
        name: &str,
        spec: &serde_json::Value,
    ) -> Result<String, DockerError> {
        let result = self
            .post(&format!("containers/create?name={name}"), Some(spec))
            .await?;
        result["Id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DockerError::Other("engine returned no container id".to_string()))
    }

    pub async fn inspect_container(&self, cid: &str) -> Result<serde_json::Value, DockerError> {
        self.get(&format!("containers/{cid}/json")).await
    }

    /// Container state string: `running`, `paused`, `exited`…
    pub async fn container_state(&self, cid: &str) -> Result<String, DockerError> {
        let info = self.inspect_container(cid).await?;
        let state = &info["State"];
        if state["Paused"].as_bool().unwrap_or(false) {
            Ok("paused".to_string())
        } else if state["Running"].as_bool().unwrap_or(false) {
            Ok("running".to_string())
        } else {
            Ok("exited".to_string())
        }
    }

    pub async fn container_pid(&self, cid: &str) -> Result<i64, DockerError> {
        let info = self.inspect_container(cid).await?;
        info["State"]["Pid"]
            .as_i64()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| DockerError::Other("container has no PID".to_string()))
    }

    pub async fn start_container(&self, cid: &str) -> Result<(), DockerError> {
        self.post(&format!("containers/{cid}/start"), None).await?;
        Ok(())
    }

    pub async fn stop_container(&self, cid: &str, timeout: u32) -> Result<(), DockerError> {
        match self
            .post(&format!("containers/{cid}/stop?t={timeout}"), None)
            .await
        {
            Ok(_) => Ok(()),
            // 304: already stopped.
            Err(DockerError::Api { status: 304, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn pause_container(&self, cid: &str) -> Result<(), DockerError> {
        self.post(&format!("containers/{cid}/pause"), None).await?;
        Ok(())
    }

    pub async fn unpause_container(&self, cid: &str) -> Result<(), DockerError> {
        self.post(&format!("containers/{cid}/unpause"), None)
            .await?;
        Ok(())
    }

    pub async fn restart_container(&self, cid: &str) -> Result<(), DockerError> {
        self.post(&format!("containers/{cid}/restart"), None)
            .await?;
        Ok(())
    }

    /// Force-removes the container together with its anonymous volumes.
    pub async fn delete_container(&self, cid: &str) -> Result<(), DockerError> {
        self.delete(&format!("containers/{cid}?force=1&v=1")).await?;
        Ok(())
    }

    pub async fn container_logs(&self, cid: &str) -> Result<String, DockerError> {
        let response = self
            .http
            .get(self.endpoint(&format!("containers/{cid}/logs?stderr=1&stdout=1"))?)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DockerError::Api {
                status: status.as_u16(),
                message: "could not read container logs".to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&response.bytes().await?).into_owned())
    }

    /// Runs a command inside the container, detached.
    pub async fn exec(&self, cid: &str, cmd: &[String]) -> Result<(), DockerError> {
        let created = self
            .post(
                &format!("containers/{cid}/exec"),
                Some(&serde_json::json!({
                    "Cmd": cmd,
                    "AttachStdout": false,
                    "AttachStderr": false,
                })),
            )
            .await?;
        let exec_id = created["Id"]
            .as_str()
            .ok_or_else(|| DockerError::Other("engine returned no exec id".to_string()))?;
        self.post(
            &format!("exec/{exec_id}/start"),
            Some(&serde_json::json!({"Detach": true})),
        )
        .await?;
        Ok(())
    }

    pub async fn resize_tty(&self, cid: &str, columns: u16, rows: u16) -> Result<(), DockerError> {
        self.post(&format!("containers/{cid}/resize?h={rows}&w={columns}"), None)
            .await?;
        Ok(())
    }

    /// Attaches to the container's TTY stream over WebSocket.
    pub async fn attach(&self, cid: &str) -> Result<AttachStream, DockerError> {
        let mut url = self
            .endpoint(&format!(
                "containers/{cid}/attach/ws?stream=1&stdin=1&stdout=1&stderr=1"
            ))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| DockerError::Other("cannot derive websocket scheme".to_string()))?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        Ok(stream)
    }
}
