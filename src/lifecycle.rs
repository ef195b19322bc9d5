//! The operations behind each `narratoctl` subcommand.
//!
//! Everything addresses the single container named in the settings. Cleanup
//! steps (removing a previous container, stopping one that may not run) are
//! best effort: their failures are logged and otherwise ignored.

use std::{
    collections::HashMap,
    fmt, fs,
    io::Write,
    path::PathBuf,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;

use crate::{
    config::{RegistrySettings, Settings, CONTAINER_PORT},
    container::{Container, ContainerOptions, LogsOptions, RmContainerOptions},
    docker::Docker,
    errors::{Error, Result},
    exec::ExecContainerOptions,
    health::{self, HealthReport, Probe},
    image::{progress_line, BuildOptions, PullOptions, RegistryAuth},
    layout::HostLayout,
    recipe::Recipe,
    tty::TtyChunk,
};

/// Label put on every container this tool creates
pub const MANAGED_BY_LABEL: &str = "io.narratoai.managed-by";

/// Upper bound for each `doctor` check
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between probes while waiting for the web UI
const WAIT_POLL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    /// Build the image before starting
    pub build: bool,
    /// Pull the image when it is missing locally
    pub pull: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BuildRequest {
    pub no_cache: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LogsRequest {
    pub follow: bool,
    /// Number of lines from the end, all when unset
    pub tail: Option<usize>,
    pub timestamps: bool,
}

/// Snapshot of the managed container
#[derive(Clone, Debug)]
pub struct ContainerStatus {
    pub name: String,
    pub id: String,
    pub state: String,
    pub running: bool,
    pub health: Option<String>,
    pub host_port: Option<u16>,
    pub started_at: DateTime<Utc>,
    pub restart_count: u64,
}

impl fmt::Display for ContainerStatus {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        let short_id: String = self.id.chars().take(12).collect();
        write!(f, "{} ({}): {}", self.name, short_id, self.state)?;
        if let Some(ref health) = self.health {
            write!(f, ", {}", health)?;
        }
        if self.running {
            write!(f, ", up since {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        }
        if let Some(port) = self.host_port {
            write!(f, ", port {} -> {}", port, CONTAINER_PORT)?;
        }
        if self.restart_count > 0 {
            write!(f, ", restarted {} times", self.restart_count)?;
        }
        Ok(())
    }
}

/// Result of one `doctor` check
#[derive(Clone, Debug, PartialEq)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

/// Drives the NarratoAI container through a docker daemon
pub struct Lifecycle {
    docker: Docker,
    settings: Settings,
}

impl Lifecycle {
    pub fn new(
        docker: Docker,
        settings: Settings,
    ) -> Self {
        Lifecycle { docker, settings }
    }

    /// Connects to the daemon named in the settings or the environment
    pub fn connect(settings: Settings) -> Result<Self> {
        let docker = Docker::from_settings(&settings.docker)?;
        log::debug!("using {:?}", docker);
        Ok(Lifecycle::new(docker, settings))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn layout(&self) -> HostLayout {
        HostLayout::new(self.settings.paths.root.clone())
    }

    fn recipe(&self) -> Recipe {
        Recipe::from_settings(&self.settings)
    }

    fn container(&self) -> Container<'_> {
        self.docker.containers().get(self.settings.container.name.as_str())
    }

    /// Creates the bind mount sources on the host
    pub fn prepare(&self) -> Result<()> {
        let layout = self.layout();
        layout.prepare()?;
        log::info!("host layout ready under {}", layout.root().display());
        Ok(())
    }

    /// Writes the rendered `Dockerfile` and entrypoint into the project root
    pub fn render(&self) -> Result<Vec<PathBuf>> {
        let root = &self.settings.paths.root;
        let mut written = Vec::new();
        for file in self.recipe().context_files() {
            let path = root.join(&file.path);
            fs::write(&path, &file.contents)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&path, fs::Permissions::from_mode(file.mode))?;
            }
            log::info!("wrote {}", path.display());
            written.push(path);
        }
        Ok(written)
    }

    /// Builds and tags the image, streaming the daemon's output to `out`
    pub async fn build<W>(
        &self,
        request: &BuildRequest,
        out: &mut W,
    ) -> Result<()>
    where
        W: Write,
    {
        let context = self.settings.build_context();
        let image = &self.settings.container.image;

        let mut builder = BuildOptions::builder(context.clone());
        builder
            .tag(image.as_str())
            .rm(true)
            .nocache(request.no_cache)
            .pull(self.settings.build.pull);

        match self.settings.build.dockerfile {
            Some(ref dockerfile) => {
                log::info!("building {} from {}", image, dockerfile);
                builder.dockerfile(dockerfile.as_str());
                builder.buildargs(&self.pip_buildargs());
            }
            None if context.join("Dockerfile").is_file() => {
                log::info!("building {} from the context's own Dockerfile", image);
                builder.buildargs(&self.pip_buildargs());
            }
            None => {
                log::info!("building {} from the rendered recipe", image);
                for file in self.recipe().context_files() {
                    builder.extra_file(file);
                }
            }
        }

        let mut stream = self.docker.images().build(&builder.build());
        while let Some(value) = stream.next().await {
            if let Some(line) = progress_line(&value?) {
                writeln!(out, "{}", line)?;
            }
        }
        log::info!("built {}", image);
        Ok(())
    }

    fn pip_buildargs(&self) -> HashMap<String, String> {
        let mut args = HashMap::new();
        if let Some(ref url) = self.settings.build.pip_index_url {
            args.insert("PIP_INDEX_URL".to_string(), url.clone());
        }
        args
    }

    /// Pulls the configured image, using registry credentials when set
    pub async fn pull<W>(
        &self,
        out: &mut W,
    ) -> Result<()>
    where
        W: Write,
    {
        let mut builder = PullOptions::builder();
        builder.image(self.settings.container.image.as_str());
        if let Some(ref registry) = self.settings.registry {
            builder.auth(registry_auth(registry));
        }

        let mut stream = self.docker.images().pull(&builder.build());
        while let Some(value) = stream.next().await {
            if let Some(line) = progress_line(&value?) {
                writeln!(out, "{}", line)?;
            }
        }
        Ok(())
    }

    async fn ensure_image<W>(
        &self,
        options: &StartOptions,
        out: &mut W,
    ) -> Result<()>
    where
        W: Write,
    {
        let image = &self.settings.container.image;
        if options.build {
            return self.build(&BuildRequest::default(), out).await;
        }
        match self.docker.images().get(image.as_str()).inspect().await {
            Ok(details) => {
                log::debug!("image {} is {}", image, details.id);
                Ok(())
            }
            Err(e) if e.is_not_found() && options.pull => {
                log::info!("pulling {}", image);
                self.pull(out).await
            }
            Err(e) if e.is_not_found() => Err(Error::InvalidArgument(format!(
                "image {} not found, run `narratoctl build` or pass --build",
                image
            ))),
            Err(e) => Err(e),
        }
    }

    fn container_options(&self) -> Result<ContainerOptions> {
        let settings = &self.settings;
        let binds = self.layout().binds(&settings.paths.app_dir)?;

        let mut labels = HashMap::new();
        labels.insert(MANAGED_BY_LABEL, "narratoctl");

        Ok(ContainerOptions::builder(&settings.container.image)
            .name(&settings.container.name)
            .publish(CONTAINER_PORT, "tcp", settings.container.host_port)
            .binds(&binds)
            .env(&settings.container.environment())
            .labels(&labels)
            .restart_policy(&settings.container.restart_policy, 0)
            .stop_timeout(settings.container.stop_timeout())
            .healthcheck(&self.recipe().healthcheck())
            .build())
    }

    /// Replaces any previous container with a fresh one and starts it.
    /// Returns the URL the web UI will be served on.
    pub async fn start<W>(
        &self,
        options: &StartOptions,
        out: &mut W,
    ) -> Result<String>
    where
        W: Write,
    {
        self.prepare()?;
        self.ensure_image(options, out).await?;

        let name = &self.settings.container.name;
        let removal = RmContainerOptions::builder().force(true).build();
        match self.container().remove(removal).await {
            Ok(()) => log::info!("removed previous container {}", name),
            Err(e) if e.is_not_found() => log::debug!("no previous container {}", name),
            Err(e) => log::warn!("could not remove previous container {}: {}", name, e),
        }

        let info = self
            .docker
            .containers()
            .create(&self.container_options()?)
            .await?;
        for warning in info.warnings.iter().flatten() {
            log::warn!("{}", warning);
        }

        self.docker.containers().get(info.id.as_str()).start().await?;
        log::info!("started {} ({})", name, info.id);

        Ok(self.settings.web_url())
    }

    /// Stops and removes the container, ignoring either step's failure
    pub async fn stop(&self) -> Result<()> {
        let name = &self.settings.container.name;
        let container = self.container();

        match container.stop(Some(self.settings.container.stop_timeout())).await {
            Ok(()) => log::info!("stopped {}", name),
            Err(e) if e.is_not_modified() => log::info!("{} is not running", name),
            Err(e) if e.is_not_found() => log::info!("no such container {}", name),
            Err(e) => log::warn!("could not stop {}: {}", name, e),
        }

        match container.remove(RmContainerOptions::default()).await {
            Ok(()) => log::info!("removed {}", name),
            Err(e) if e.is_not_found() => log::debug!("{} already removed", name),
            Err(e) => log::warn!("could not remove {}: {}", name, e),
        }
        Ok(())
    }

    /// Copies the container's output to `out` and `err`
    pub async fn logs<O, E>(
        &self,
        request: &LogsRequest,
        out: &mut O,
        err: &mut E,
    ) -> Result<()>
    where
        O: Write,
        E: Write,
    {
        let tail = request
            .tail
            .map(|n| n.to_string())
            .unwrap_or_else(|| "all".to_string());
        let options = LogsOptions::builder()
            .stdout(true)
            .stderr(true)
            .follow(request.follow)
            .timestamps(request.timestamps)
            .tail(&tail)
            .build();

        let mut stream = self.container().logs(&options);
        while let Some(chunk) = stream.next().await {
            write_chunk(chunk?, out, err)?;
        }
        Ok(())
    }

    /// Runs `cmd` inside the running container and returns its exit code
    pub async fn exec<O, E>(
        &self,
        cmd: &[String],
        out: &mut O,
        err: &mut E,
    ) -> Result<i64>
    where
        O: Write,
        E: Write,
    {
        if cmd.is_empty() {
            return Err(Error::InvalidArgument("exec needs a command".into()));
        }
        let container = self.container();
        let details = container.inspect().await?;
        if !details.state.running {
            return Err(Error::InvalidArgument(format!(
                "container {} is not running ({})",
                self.settings.container.name, details.state.status
            )));
        }

        let options = ExecContainerOptions::builder()
            .cmd(cmd)
            .working_dir(&self.settings.paths.app_dir)
            .attach_stdout(true)
            .attach_stderr(true)
            .build();
        let exec = container.exec(&options).await?;
        log::debug!("exec {} runs {:?}", exec.id(), cmd);

        let mut stream = exec.start();
        while let Some(chunk) = stream.next().await {
            write_chunk(chunk?, out, err)?;
        }

        exec.inspect().await?.exit_code.ok_or_else(|| {
            Error::InvalidResponse(format!("exec {} reported no exit code", exec.id()))
        })
    }

    /// Probes the web UI and reads the runtime's healthcheck state.
    ///
    /// With `wait`, keeps probing until the endpoint is healthy or the wait is over.
    pub async fn health(
        &self,
        wait: Option<Duration>,
    ) -> Result<HealthReport> {
        let (container, port) = match self.container().inspect().await {
            Ok(details) => (
                details.state.health.as_ref().map(|h| h.status.clone()),
                details.host_port(CONTAINER_PORT),
            ),
            Err(e) => {
                log::debug!("could not inspect {}: {}", self.settings.container.name, e);
                (None, None)
            }
        };

        let mut settings = self.settings.clone();
        if let Some(port) = port {
            settings.container.host_port = port;
        }
        let url = settings.health_url();
        let timeout = settings.health.timeout();

        let endpoint: Probe = match wait {
            Some(deadline) => health::wait_until_healthy(&url, timeout, WAIT_POLL, deadline).await?,
            None => health::probe(&url, timeout).await?,
        };

        Ok(HealthReport { endpoint, container })
    }

    /// `None` when no container with the configured name exists
    pub async fn status(&self) -> Result<Option<ContainerStatus>> {
        let details = match self.container().inspect().await {
            Ok(details) => details,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(ContainerStatus {
            name: details.name.trim_start_matches('/').to_string(),
            host_port: details.host_port(CONTAINER_PORT),
            health: details.state.health.map(|h| h.status),
            state: details.state.status,
            running: details.state.running,
            started_at: details.state.started_at,
            restart_count: details.restart_count,
            id: details.id,
        }))
    }

    /// Checks the daemon and a host `ffmpeg`, each bounded by a short timeout
    pub async fn doctor(&self) -> Vec<Check> {
        let docker = match tokio::time::timeout(CHECK_TIMEOUT, self.docker.version()).await {
            Ok(Ok(version)) => Check {
                name: "docker",
                ok: true,
                detail: format!(
                    "Docker {} (API {}, {}/{})",
                    version.version, version.api_version, version.os, version.arch
                ),
            },
            Ok(Err(e)) => Check {
                name: "docker",
                ok: false,
                detail: e.to_string(),
            },
            Err(_) => Check {
                name: "docker",
                ok: false,
                detail: "daemon did not answer within 5s".to_string(),
            },
        };

        vec![docker, command_check("ffmpeg", "ffmpeg", &["-version"]).await]
    }
}

/// Runs `program args` and reports the first line of its output
async fn command_check(
    name: &'static str,
    program: &str,
    args: &[&str],
) -> Check {
    let mut command = tokio::process::Command::new(program);
    command.args(args);
    match tokio::time::timeout(CHECK_TIMEOUT, command.output()).await {
        Ok(Ok(output)) if output.status.success() => Check {
            name,
            ok: true,
            detail: String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string(),
        },
        Ok(Ok(output)) => Check {
            name,
            ok: false,
            detail: format!("{} exited with {}", program, output.status),
        },
        Ok(Err(e)) => Check {
            name,
            ok: false,
            detail: format!("{} not installed ({})", program, e),
        },
        Err(_) => Check {
            name,
            ok: false,
            detail: format!("{} did not finish within 5s", program),
        },
    }
}

fn registry_auth(registry: &RegistrySettings) -> RegistryAuth {
    match registry.identity_token {
        Some(ref token) => RegistryAuth::Token {
            identity_token: token.clone(),
        },
        None => RegistryAuth::Password {
            username: registry.username.clone(),
            password: registry.password.clone(),
            server_address: registry.server_address.clone(),
        },
    }
}

fn write_chunk<O, E>(
    chunk: TtyChunk,
    out: &mut O,
    err: &mut E,
) -> Result<()>
where
    O: Write,
    E: Write,
{
    match chunk {
        TtyChunk::StdOut(bytes) => {
            out.write_all(&bytes)?;
            out.flush()?;
        }
        TtyChunk::StdErr(bytes) => {
            err.write_all(&bytes)?;
            err.flush()?;
        }
        TtyChunk::StdIn(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::ENTRYPOINT_FILE;
    use serde_json::Value;

    fn lifecycle(root: &std::path::Path) -> Lifecycle {
        let mut settings = Settings::default();
        settings.paths.root = root.to_path_buf();
        settings.container.host_port = 18080;
        Lifecycle::new(Docker::tcp("127.0.0.1:1"), settings)
    }

    #[test]
    fn create_body_wires_everything_up() {
        let root = tempfile::tempdir().unwrap();
        let lifecycle = lifecycle(root.path());
        lifecycle.prepare().unwrap();

        let options = lifecycle.container_options().unwrap();
        assert_eq!(options.name.as_deref(), Some("narratoai"));

        let body: Value = serde_json::from_str(&options.serialize().unwrap()).unwrap();
        assert_eq!(body["Image"], "narratoai:latest");
        assert_eq!(
            body["HostConfig"]["PortBindings"]["8501/tcp"][0]["HostPort"],
            "18080"
        );
        assert_eq!(body["HostConfig"]["RestartPolicy"]["Name"], "unless-stopped");
        assert_eq!(body["HostConfig"]["Binds"].as_array().unwrap().len(), 3);
        assert_eq!(body["Env"][0], "PYTHONUNBUFFERED=1");
        assert_eq!(body["Env"][1], "TZ=Asia/Shanghai");
        assert_eq!(body["Labels"][MANAGED_BY_LABEL], "narratoctl");
        assert_eq!(body["Healthcheck"]["Retries"], 3);
        assert_eq!(body["StopTimeout"], 10);
    }

    #[test]
    fn render_writes_executable_entrypoint() {
        let root = tempfile::tempdir().unwrap();
        let written = lifecycle(root.path()).render().unwrap();

        assert_eq!(written.len(), 2);
        assert!(fs::read_to_string(root.path().join("Dockerfile"))
            .unwrap()
            .contains("EXPOSE 8501"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(root.path().join(ENTRYPOINT_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn identity_token_replaces_password() {
        let mut registry = RegistrySettings {
            username: "narrato".into(),
            password: "s3cret".into(),
            ..Default::default()
        };
        assert!(matches!(
            registry_auth(&registry),
            RegistryAuth::Password { ref username, .. } if username == "narrato"
        ));

        registry.identity_token = Some("dckr_pat_1".into());
        let header = registry_auth(&registry).serialize().unwrap();
        let decoded = base64::decode_config(&header, base64::URL_SAFE).unwrap();
        assert_eq!(decoded, br#"{"identitytoken":"dckr_pat_1"}"#.to_vec());
    }

    #[test]
    fn chunks_go_to_their_stream() {
        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        write_chunk(TtyChunk::StdOut(b"ready\n".to_vec()), &mut out, &mut err).unwrap();
        write_chunk(TtyChunk::StdErr(b"warn\n".to_vec()), &mut out, &mut err).unwrap();
        write_chunk(TtyChunk::StdIn(b"ignored".to_vec()), &mut out, &mut err).unwrap();
        assert_eq!(out, b"ready\n");
        assert_eq!(err, b"warn\n");
    }

    #[test]
    fn status_line() {
        let status = ContainerStatus {
            name: "narratoai".into(),
            id: "4fa6e0f0c6786a1f2b".into(),
            state: "running".into(),
            running: true,
            health: Some("healthy".into()),
            host_port: Some(11170),
            started_at: DateTime::<Utc>::from_timestamp(1_714_640_000, 0).unwrap(),
            restart_count: 0,
        };
        assert_eq!(
            status.to_string(),
            "narratoai (4fa6e0f0c678): running, healthy, up since 2024-05-02 08:53:20 UTC, port 11170 -> 8501"
        );
    }

    #[tokio::test]
    async fn missing_program_fails_its_check() {
        let check = command_check("ghost", "narratoctl-no-such-binary", &["-version"]).await;
        assert!(!check.ok);
        assert!(check.detail.starts_with("narratoctl-no-such-binary not installed"));
    }

    #[tokio::test]
    async fn exec_needs_a_command() {
        let root = tempfile::tempdir().unwrap();
        let result = lifecycle(root.path())
            .exec(&[], &mut Vec::<u8>::new(), &mut Vec::<u8>::new())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
