//! Create and drive the application container.
//!
//! API Reference: <https://docs.docker.com/engine/api/v1.41/#tag/Container>

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use hyper::Body;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    docker::Docker,
    errors::{Error, Result},
    exec::{Exec, ExecContainerOptions},
    transport::{encode_query, with_query},
    tty,
};

/// A single container, addressed by id or name
pub struct Container<'docker> {
    docker: &'docker Docker,
    id: String,
}

impl<'docker> Container<'docker> {
    pub fn new<S>(
        docker: &'docker Docker,
        id: S,
    ) -> Self
    where
        S: Into<String>,
    {
        Container {
            docker,
            id: id.into(),
        }
    }

    pub async fn inspect(&self) -> Result<ContainerDetails> {
        self.docker
            .get_json(&format!("/containers/{}/json", self.id))
            .await
    }

    /// Demultiplexed stdout/stderr of the container. With `follow` set the
    /// stream stays open until the container exits.
    pub fn logs(
        &self,
        opts: &LogsOptions,
    ) -> impl Stream<Item = Result<tty::TtyChunk>> + Unpin + 'docker {
        let path = with_query(
            format!("/containers/{}/logs", self.id),
            encode_query(&opts.params),
        );
        let chunks = Box::pin(self.docker.stream_get(path));

        Box::pin(tty::decode(chunks))
    }

    pub async fn start(&self) -> Result<()> {
        self.docker
            .post(&format!("/containers/{}/start", self.id), None)
            .await
    }

    /// Asks the container to stop, killing it once `wait` has elapsed.
    /// Without `wait` the daemon uses the container's own stop timeout.
    pub async fn stop(
        &self,
        wait: Option<Duration>,
    ) -> Result<()> {
        let mut params = HashMap::new();
        if let Some(wait) = wait {
            params.insert("t", wait.as_secs().to_string());
        }
        let path = with_query(
            format!("/containers/{}/stop", self.id),
            encode_query(&params),
        );
        self.docker.post(&path, None).await
    }

    pub async fn remove(
        &self,
        opts: RmContainerOptions,
    ) -> Result<()> {
        let path = with_query(format!("/containers/{}", self.id), encode_query(&opts.params));
        self.docker.delete(&path).await
    }

    /// Registers a command to run inside this container. Nothing runs until
    /// the returned [`Exec`] is started.
    pub async fn exec(
        &self,
        opts: &ExecContainerOptions,
    ) -> Result<Exec<'docker>> {
        Exec::create(self.docker, &self.id, opts).await
    }
}

/// Entry point for container endpoints
pub struct Containers<'docker> {
    docker: &'docker Docker,
}

impl<'docker> Containers<'docker> {
    pub fn new(docker: &'docker Docker) -> Self {
        Containers { docker }
    }

    pub fn get<S>(
        &self,
        name: S,
    ) -> Container<'docker>
    where
        S: Into<String>,
    {
        Container::new(self.docker, name)
    }

    pub async fn create(
        &self,
        opts: &ContainerOptions,
    ) -> Result<ContainerCreateInfo> {
        let body: Body = opts.serialize()?.into();
        let mut params = HashMap::new();
        if let Some(name) = &opts.name {
            params.insert("name", name.clone());
        }
        let path = with_query("/containers/create".to_owned(), encode_query(&params));

        self.docker
            .post_json(&path, Some((body, mime::APPLICATION_JSON)))
            .await
    }
}

/// Body of a create request. Built with [`ContainerOptions::builder`].
#[derive(Serialize, Debug)]
pub struct ContainerOptions {
    pub name: Option<String>,
    params: HashMap<&'static str, Value>,
}

/// Stores `value` under a dotted key such as `HostConfig.RestartPolicy.Name`,
/// creating the intermediate objects on the way down.
fn set_path(
    root: &mut Value,
    dotted: &str,
    value: Value,
) -> Result<()> {
    let mut keys = dotted.split('.').peekable();
    let mut node = root;
    while let Some(key) = keys.next() {
        let object = node.as_object_mut().ok_or_else(|| {
            Error::InvalidArgument(format!("container option {} crosses a non-object", dotted))
        })?;
        if keys.peek().is_none() {
            object.insert(key.to_owned(), value);
            return Ok(());
        }
        node = object
            .entry(key.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

impl ContainerOptions {
    pub fn builder(image: &str) -> ContainerOptionsBuilder {
        ContainerOptionsBuilder::new(image)
    }

    pub fn serialize(&self) -> Result<String> {
        // the daemon rejects a create body without HostConfig on old API versions
        let mut body = json!({ "HostConfig": {} });
        for (key, value) in &self.params {
            set_path(&mut body, key, value.clone())?;
        }
        Ok(serde_json::to_string(&body)?)
    }
}

/// Container-level health probe, the create-time equivalent of a `HEALTHCHECK`
/// instruction. The daemon expects every duration in nanoseconds.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthcheckSpec {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub start_period: Duration,
    pub retries: u32,
}

impl HealthcheckSpec {
    fn to_json(&self) -> Value {
        json!({
            "Test": self.test,
            "Interval": self.interval.as_nanos() as u64,
            "Timeout": self.timeout.as_nanos() as u64,
            "StartPeriod": self.start_period.as_nanos() as u64,
            "Retries": self.retries,
        })
    }
}

#[derive(Default)]
pub struct ContainerOptionsBuilder {
    name: Option<String>,
    params: HashMap<&'static str, Value>,
    // "8501/tcp" -> host port
    ports: BTreeMap<String, u16>,
}

impl ContainerOptionsBuilder {
    pub(crate) fn new(image: &str) -> Self {
        let mut params = HashMap::new();
        params.insert("Image", json!(image));
        ContainerOptionsBuilder {
            params,
            ..Default::default()
        }
    }

    pub fn name(
        &mut self,
        name: &str,
    ) -> &mut Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Bind mounts in `host-path:container-path[:mode]` form
    pub fn binds<S>(
        &mut self,
        binds: &[S],
    ) -> &mut Self
    where
        S: AsRef<str>,
    {
        let binds: Vec<&str> = binds.iter().map(AsRef::as_ref).collect();
        self.params.insert("HostConfig.Binds", json!(binds));
        self
    }

    /// Publishes `container_port/protocol` on `host_port` of every host interface.
    /// Publishing the same container port twice keeps the last host port.
    pub fn publish(
        &mut self,
        container_port: u16,
        protocol: &str,
        host_port: u16,
    ) -> &mut Self {
        self.ports
            .insert(format!("{}/{}", container_port, protocol), host_port);
        self
    }

    pub fn labels(
        &mut self,
        labels: &HashMap<&str, &str>,
    ) -> &mut Self {
        self.params.insert("Labels", json!(labels));
        self
    }

    pub fn env<S>(
        &mut self,
        vars: &[S],
    ) -> &mut Self
    where
        S: AsRef<str>,
    {
        let vars: Vec<&str> = vars.iter().map(AsRef::as_ref).collect();
        self.params.insert("Env", json!(vars));
        self
    }

    /// `no`, `always`, `unless-stopped` or `on-failure`. The retry count only
    /// applies to `on-failure`.
    pub fn restart_policy(
        &mut self,
        name: &str,
        max_retries: u64,
    ) -> &mut Self {
        self.params
            .insert("HostConfig.RestartPolicy.Name", json!(name));
        if name == "on-failure" {
            self.params
                .insert("HostConfig.RestartPolicy.MaximumRetryCount", json!(max_retries));
        }
        self
    }

    /// Whole seconds only
    pub fn stop_timeout(
        &mut self,
        timeout: Duration,
    ) -> &mut Self {
        self.params.insert("StopTimeout", json!(timeout.as_secs()));
        self
    }

    pub fn healthcheck(
        &mut self,
        spec: &HealthcheckSpec,
    ) -> &mut Self {
        self.params.insert("Healthcheck", spec.to_json());
        self
    }

    pub fn build(&self) -> ContainerOptions {
        let mut params = self.params.clone();
        if !self.ports.is_empty() {
            let bindings: Map<String, Value> = self
                .ports
                .iter()
                .map(|(port, host)| (port.clone(), json!([{ "HostPort": host.to_string() }])))
                .collect();
            let exposed: Map<String, Value> = self
                .ports
                .keys()
                .map(|port| (port.clone(), json!({})))
                .collect();
            params.insert("HostConfig.PortBindings", Value::Object(bindings));
            params.insert("ExposedPorts", Value::Object(exposed));
        }
        ContainerOptions {
            name: self.name.clone(),
            params,
        }
    }
}

/// Query for the logs endpoint
#[derive(Default, Debug)]
pub struct LogsOptions {
    params: HashMap<&'static str, String>,
}

impl LogsOptions {
    pub fn builder() -> LogsOptionsBuilder {
        LogsOptionsBuilder::default()
    }

    pub fn serialize(&self) -> Option<String> {
        encode_query(&self.params)
    }
}

#[derive(Default)]
pub struct LogsOptionsBuilder {
    params: HashMap<&'static str, String>,
}

impl LogsOptionsBuilder {
    pub fn follow(
        &mut self,
        follow: bool,
    ) -> &mut Self {
        self.params.insert("follow", follow.to_string());
        self
    }

    pub fn stdout(
        &mut self,
        stdout: bool,
    ) -> &mut Self {
        self.params.insert("stdout", stdout.to_string());
        self
    }

    pub fn stderr(
        &mut self,
        stderr: bool,
    ) -> &mut Self {
        self.params.insert("stderr", stderr.to_string());
        self
    }

    pub fn timestamps(
        &mut self,
        timestamps: bool,
    ) -> &mut Self {
        self.params.insert("timestamps", timestamps.to_string());
        self
    }

    /// Number of lines from the end, or `all`
    pub fn tail(
        &mut self,
        lines: &str,
    ) -> &mut Self {
        self.params.insert("tail", lines.to_owned());
        self
    }

    pub fn build(&self) -> LogsOptions {
        LogsOptions {
            params: self.params.clone(),
        }
    }
}

/// Query for container removal
#[derive(Default, Debug)]
pub struct RmContainerOptions {
    params: HashMap<&'static str, String>,
}

impl RmContainerOptions {
    pub fn builder() -> RmContainerOptionsBuilder {
        RmContainerOptionsBuilder::default()
    }

    pub fn serialize(&self) -> Option<String> {
        encode_query(&self.params)
    }
}

#[derive(Default)]
pub struct RmContainerOptionsBuilder {
    params: HashMap<&'static str, String>,
}

impl RmContainerOptionsBuilder {
    /// Kill the container first if it is running
    pub fn force(
        &mut self,
        force: bool,
    ) -> &mut Self {
        self.params.insert("force", force.to_string());
        self
    }

    pub fn build(&self) -> RmContainerOptions {
        RmContainerOptions {
            params: self.params.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created: DateTime<Utc>,
    pub state: State,
    #[serde(default)]
    pub host_config: Option<HostConfig>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub restart_count: u64,
}

impl ContainerDetails {
    /// First host port bound to `port/tcp`, if any
    pub fn host_port(
        &self,
        port: u16,
    ) -> Option<u16> {
        self.host_config
            .as_ref()?
            .port_bindings
            .as_ref()?
            .get(&format!("{}/tcp", port))?
            .iter()
            .filter_map(|binding| binding.get("HostPort"))
            .find_map(|p| p.parse().ok())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub mode: String,
    #[serde(rename = "RW")]
    pub rw: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct State {
    #[serde(default)]
    pub error: String,
    pub exit_code: i64,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    pub paused: bool,
    pub pid: u64,
    pub restarting: bool,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub health: Option<Health>,
}

/// Result of the runtime's own healthcheck; only present when one is configured
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Health {
    pub status: String,
    #[serde(default)]
    pub failing_streak: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub network_mode: Option<String>,
    pub port_bindings: Option<HashMap<String, Vec<HashMap<String, String>>>>,
    #[serde(default)]
    pub binds: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateInfo {
    pub id: String,
    pub warnings: Option<Vec<String>>,
}
