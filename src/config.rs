//! Settings for building and running the container, loaded from `narratoctl.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::errors::{Error, Result};

/// Port streamlit listens on inside the container
pub const CONTAINER_PORT: u16 = 8501;

/// Host port the web UI is published on unless configured otherwise
pub const DEFAULT_HOST_PORT: u16 = 11170;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "narratoctl.toml";

/// Environment variable naming an alternative config file
pub const CONFIG_ENV: &str = "NARRATOCTL_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub container: ContainerSettings,
    pub paths: PathSettings,
    pub build: BuildSettings,
    pub health: HealthSettings,
    pub docker: DockerSettings,
    pub registry: Option<RegistrySettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub timezone: String,
    pub restart_policy: String,
    pub stop_timeout_secs: u64,
    /// Extra environment passed to the container on top of the fixed ones
    pub env: BTreeMap<String, String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            name: "narratoai".to_string(),
            image: "narratoai:latest".to_string(),
            host_port: DEFAULT_HOST_PORT,
            timezone: "Asia/Shanghai".to_string(),
            restart_policy: "unless-stopped".to_string(),
            stop_timeout_secs: 10,
            env: BTreeMap::new(),
        }
    }
}

impl ContainerSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// `KEY=VALUE` pairs for the container, fixed ones first
    pub fn environment(&self) -> Vec<String> {
        let mut env = vec![
            "PYTHONUNBUFFERED=1".to_string(),
            format!("TZ={}", self.timezone),
        ];
        env.extend(
            self.env
                .iter()
                .filter(|(k, _)| k.as_str() != "PYTHONUNBUFFERED" && k.as_str() != "TZ")
                .map(|(k, v)| format!("{}={}", k, v)),
        );
        env
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Project checkout holding `storage/`, `config.toml` and `resource/`
    pub root: PathBuf,
    /// Working directory of the application inside the image
    pub app_dir: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            app_dir: "/NarratoAI".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Build context, defaults to `paths.root`
    pub context: Option<PathBuf>,
    /// Use this Dockerfile from the context instead of rendering one
    pub dockerfile: Option<String>,
    pub python_image: String,
    pub build_packages: Vec<String>,
    pub runtime_packages: Vec<String>,
    pub requirements: String,
    pub pip_index_url: Option<String>,
    pub app_entry: String,
    /// Always attempt to pull a newer base image
    pub pull: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            context: None,
            dockerfile: None,
            python_image: "python:3.12-slim-bookworm".to_string(),
            build_packages: ["build-essential", "git", "git-lfs", "pkg-config"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            runtime_packages: [
                "imagemagick",
                "ffmpeg",
                "wget",
                "curl",
                "git-lfs",
                "ca-certificates",
                "tzdata",
                "dos2unix",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            requirements: "requirements.txt".to_string(),
            pip_index_url: None,
            app_entry: "webui.py".to_string(),
            pull: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub path: String,
    /// Host the published port is probed on
    pub probe_host: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub start_period_secs: u64,
    pub retries: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            path: "/_stcore/health".to_string(),
            probe_host: "127.0.0.1".to_string(),
            interval_secs: 30,
            timeout_secs: 10,
            start_period_secs: 60,
            retries: 3,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn start_period(&self) -> Duration {
        Duration::from_secs(self.start_period_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// e.g. `unix:///var/run/docker.sock` or `tcp://10.0.0.5:2376`
    pub host: Option<String>,
    /// Directory holding `cert.pem`, `key.pem` and `ca.pem`
    pub cert_path: Option<PathBuf>,
    pub tls_verify: bool,
}

/// Credentials for pulling a prebuilt image. An identity token, when set,
/// is sent instead of the username and password.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub username: String,
    pub password: String,
    pub server_address: Option<String>,
    pub identity_token: Option<String>,
}

/// Values given on the command line, which win over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub image: Option<String>,
    pub host_port: Option<u16>,
    pub root: Option<PathBuf>,
}

/// First existing file among the `$NARRATOCTL_CONFIG` path and
/// `narratoctl.toml` in `dir`
fn discover(
    env_path: Option<PathBuf>,
    dir: &Path,
) -> Option<PathBuf> {
    env_path
        .into_iter()
        .chain(Some(dir.join(CONFIG_FILE)))
        .find(|path| {
            let found = path.is_file();
            if !found {
                log::debug!("no config at {}", path.display());
            }
            found
        })
}

impl Settings {
    /// Loads settings from `explicit`, `$NARRATOCTL_CONFIG` or `./narratoctl.toml`,
    /// in that order. An explicit path must exist; otherwise a missing file
    /// means defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Settings> {
        let path = match explicit {
            Some(path) => {
                if !path.is_file() {
                    return Err(Error::InvalidArgument(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                Some(path.to_path_buf())
            }
            None => discover(env::var_os(CONFIG_ENV).map(PathBuf::from), Path::new("")),
        };

        match path {
            Some(path) => {
                log::debug!("loading settings from {}", path.display());
                let content = fs::read_to_string(&path)?;
                let mut settings = Settings::from_toml(&content)?;
                if let Some(dir) = path.parent() {
                    settings.resolve_relative_to(dir);
                }
                Ok(settings)
            }
            None => {
                log::debug!("no {} found, using defaults", CONFIG_FILE);
                Ok(Settings::default())
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Settings> {
        Ok(toml::from_str(content)?)
    }

    /// Relative paths in a config file are relative to the file itself
    fn resolve_relative_to(
        &mut self,
        dir: &Path,
    ) {
        if dir.as_os_str().is_empty() {
            return;
        }
        if self.paths.root.is_relative() {
            self.paths.root = dir.join(&self.paths.root);
        }
        if let Some(context) = self.build.context.as_mut() {
            if context.is_relative() {
                *context = dir.join(&*context);
            }
        }
    }

    pub fn apply(
        &mut self,
        overrides: &Overrides,
    ) {
        if let Some(ref name) = overrides.name {
            self.container.name = name.clone();
        }
        if let Some(ref image) = overrides.image {
            self.container.image = image.clone();
        }
        if let Some(port) = overrides.host_port {
            self.container.host_port = port;
        }
        if let Some(ref root) = overrides.root {
            self.paths.root = root.clone();
        }
    }

    /// Directory sent to the daemon as build context
    pub fn build_context(&self) -> PathBuf {
        self.build
            .context
            .clone()
            .unwrap_or_else(|| self.paths.root.clone())
    }

    /// URL of the streamlit health endpoint through the published port
    pub fn health_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.health.probe_host, self.container.host_port, self.health.path
        )
    }

    /// URL a browser reaches the web UI on
    pub fn web_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.health.probe_host, self.container.host_port
        )
    }
}
