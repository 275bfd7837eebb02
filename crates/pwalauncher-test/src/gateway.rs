//! TestGateway: out-of-process harness around the `pwalauncher` binary.

use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use thiserror::Error;

/// Markup served for `/` and every unknown path.
pub const INDEX_HTML: &str = "<!doctype html><title>app</title>";

/// Errors from TestGateway operations.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("gateway failed to start: {0}")]
    StartupFailed(String),

    #[error("gateway binary not found at {0}")]
    BinaryNotFound(String),
}

/// A running gateway process with a plain listener on a free port.
pub struct TestGateway {
    child: Child,
    port: u16,
    client: reqwest::Client,
    dir: TempDir,
}

impl TestGateway {
    /// Start a gateway with the default config plus `overrides`, a JSON
    /// object merged on top (camelCase keys, as in the config file).
    pub async fn start(overrides: Value) -> Result<Self, TestError> {
        let dir = TempDir::new()?;
        let www = dir.path().join("www");
        std::fs::create_dir_all(www.join("assets"))?;
        std::fs::write(www.join("index.html"), INDEX_HTML)?;
        std::fs::write(www.join("assets/app.js"), "console.log('app')")?;

        let port = find_available_port()?;
        let mut config = json!({
            "port": port,
            "wwwroot": www,
        });
        if let (Some(base), Value::Object(extra)) = (config.as_object_mut(), overrides) {
            base.extend(extra);
        }

        let config_path = dir.path().join("pwalauncher.json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

        let child = Command::new(find_binary()?)
            .arg(&config_path)
            .args(["--log-level", "debug"])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let mut gateway = TestGateway {
            child,
            port,
            client,
            dir,
        };
        gateway.wait_for_ready().await?;
        Ok(gateway)
    }

    /// Poll until the listener accepts TCP connections.
    async fn wait_for_ready(&mut self) -> Result<(), TestError> {
        let max_attempts = 50;
        let delay = Duration::from_millis(100);

        for _ in 0..max_attempts {
            if TcpStream::connect(("127.0.0.1", self.port)).is_ok() {
                return Ok(());
            }

            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(TestError::StartupFailed(format!(
                    "gateway exited with status: {}",
                    status
                )));
            }

            tokio::time::sleep(delay).await;
        }

        Err(TestError::StartupFailed(
            "gateway did not become ready in time".to_string(),
        ))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// The `wwwroot` the gateway serves from.
    pub fn wwwroot(&self) -> PathBuf {
        self.dir.path().join("www")
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response, TestError> {
        let url = format!("{}{}", self.base_url(), path);
        Ok(self.client.get(&url).send().await?)
    }

    pub async fn post(&self, path: &str, body: &str) -> Result<reqwest::Response, TestError> {
        let url = format!("{}{}", self.base_url(), path);
        Ok(self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await?)
    }

    /// A request builder against the gateway, for custom headers.
    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url(), path))
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Locate the `pwalauncher` binary built for this workspace.
pub fn find_binary() -> Result<PathBuf, TestError> {
    let workspace = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()?;
    let target = std::env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| workspace.join("target"));

    let name = format!("pwalauncher{}", std::env::consts::EXE_SUFFIX);
    for profile in ["debug", "release"] {
        let candidate = target.join(profile).join(&name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(TestError::BinaryNotFound(format!(
        "{}/{{debug,release}}/{}",
        target.display(),
        name
    )))
}

/// Find an available TCP port.
fn find_available_port() -> Result<u16, TestError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
