//! The multi-stage image recipe and the container entrypoint.
//!
//! Both are rendered from [`Settings`] so the `Dockerfile` shipped in the build
//! context and the healthcheck attached at container creation never drift apart.

use std::{fmt, time::Duration};

use crate::{
    config::{Settings, CONTAINER_PORT},
    container::HealthcheckSpec,
    tarball::ContextFile,
};

/// Location of the virtualenv shared between the two stages
pub const VENV_DIR: &str = "/opt/venv";

/// File name of the rendered entrypoint inside the context and the image
pub const ENTRYPOINT_FILE: &str = "docker-entrypoint.sh";

/// Subdirectories of `storage/` the application expects to exist
pub const STORAGE_DIRS: [&str; 5] = [
    "temp",
    "tasks",
    "json",
    "narration_scripts",
    "drama_analysis",
];

/// Typed description of the image build
#[derive(Clone, Debug, PartialEq)]
pub struct Recipe {
    pub python_image: String,
    pub build_packages: Vec<String>,
    pub runtime_packages: Vec<String>,
    pub requirements: String,
    pub pip_index_url: Option<String>,
    pub app_dir: String,
    pub app_entry: String,
    pub timezone: String,
    pub port: u16,
    pub health_path: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub start_period: Duration,
    pub retries: u32,
}

impl Recipe {
    pub fn from_settings(settings: &Settings) -> Recipe {
        Recipe {
            python_image: settings.build.python_image.clone(),
            build_packages: settings.build.build_packages.clone(),
            runtime_packages: settings.build.runtime_packages.clone(),
            requirements: settings.build.requirements.clone(),
            pip_index_url: settings.build.pip_index_url.clone(),
            app_dir: settings.paths.app_dir.clone(),
            app_entry: settings.build.app_entry.clone(),
            timezone: settings.container.timezone.clone(),
            port: CONTAINER_PORT,
            health_path: settings.health.path.clone(),
            interval: settings.health.interval(),
            timeout: settings.health.timeout(),
            start_period: settings.health.start_period(),
            retries: settings.health.retries,
        }
    }

    fn probe_command(&self) -> String {
        format!(
            "curl -f http://localhost:{}{} || exit 1",
            self.port, self.health_path
        )
    }

    /// Renders the `Dockerfile` text
    pub fn dockerfile(&self) -> String {
        Dockerfile(self).to_string()
    }

    /// Renders `docker-entrypoint.sh`.
    ///
    /// Without arguments, or with `webui`, it launches streamlit on all
    /// interfaces; anything else is exec'd as given.
    pub fn entrypoint(&self) -> String {
        Entrypoint(self).to_string()
    }

    /// The probe of the `HEALTHCHECK` instruction, in container-create form
    pub fn healthcheck(&self) -> HealthcheckSpec {
        HealthcheckSpec {
            test: vec!["CMD-SHELL".to_string(), self.probe_command()],
            interval: self.interval,
            timeout: self.timeout,
            start_period: self.start_period,
            retries: self.retries,
        }
    }

    /// The rendered files as build context entries
    pub fn context_files(&self) -> Vec<ContextFile> {
        vec![
            ContextFile::new("Dockerfile", self.dockerfile(), 0o644),
            ContextFile::new(ENTRYPOINT_FILE, self.entrypoint(), 0o755),
        ]
    }

    fn storage_dirs(&self) -> Vec<String> {
        STORAGE_DIRS
            .iter()
            .map(|d| format!("{}/storage/{}", self.app_dir, d))
            .collect()
    }
}

struct Dockerfile<'a>(&'a Recipe);

impl fmt::Display for Dockerfile<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        let recipe = self.0;
        let index = match recipe.pip_index_url {
            Some(ref url) => format!(" -i {}", url),
            None => String::new(),
        };

        // stage 1 compiles wheels into a virtualenv
        writeln!(f, "FROM {} AS builder\n", recipe.python_image)?;
        writeln!(
            f,
            "ENV DEBIAN_FRONTEND=noninteractive \\
    PIP_NO_CACHE_DIR=1 \\
    PIP_DISABLE_PIP_VERSION_CHECK=1\n"
        )?;
        apt_install(f, &recipe.build_packages)?;
        writeln!(f, "RUN python -m venv {}", VENV_DIR)?;
        writeln!(f, "ENV PATH=\"{}/bin:$PATH\"\n", VENV_DIR)?;
        writeln!(f, "WORKDIR /build")?;
        writeln!(f, "COPY {} ./", recipe.requirements)?;
        writeln!(
            f,
            "RUN pip install --upgrade pip{} && \\
    pip install{} -r {}\n",
            index, index, recipe.requirements
        )?;

        // stage 2 only carries runtime packages and the venv
        writeln!(f, "FROM {}\n", recipe.python_image)?;
        writeln!(
            f,
            "ENV DEBIAN_FRONTEND=noninteractive \\
    PYTHONUNBUFFERED=1 \\
    PYTHONDONTWRITEBYTECODE=1 \\
    TZ={} \\
    PATH=\"{}/bin:$PATH\"\n",
            recipe.timezone, VENV_DIR
        )?;
        apt_install(f, &recipe.runtime_packages)?;
        if recipe.runtime_packages.iter().any(|p| p == "imagemagick") {
            // Debian's policy blocks the @file reads moviepy relies on
            writeln!(
                f,
                "RUN sed -i 's/<policy domain=\"path\" rights=\"none\" pattern=\"@\\*\"/<!-- & -->/' \\
    /etc/ImageMagick-6/policy.xml || true"
            )?;
        }
        if recipe.runtime_packages.iter().any(|p| p == "git-lfs") {
            writeln!(f, "RUN git lfs install --system || true")?;
        }
        writeln!(f)?;
        writeln!(f, "COPY --from=builder {} {}\n", VENV_DIR, VENV_DIR)?;
        writeln!(f, "WORKDIR {}", recipe.app_dir)?;
        writeln!(f, "COPY . .")?;
        writeln!(f, "COPY {0} /usr/local/bin/{0}", ENTRYPOINT_FILE)?;
        writeln!(
            f,
            "RUN dos2unix /usr/local/bin/{0} 2>/dev/null || true && \\
    chmod +x /usr/local/bin/{0} && \\
    mkdir -p {1}\n",
            ENTRYPOINT_FILE,
            recipe.storage_dirs().join(" ")
        )?;
        writeln!(f, "EXPOSE {}\n", recipe.port)?;
        writeln!(
            f,
            "HEALTHCHECK --interval={}s --timeout={}s --start-period={}s --retries={} \\
    CMD {}\n",
            recipe.interval.as_secs(),
            recipe.timeout.as_secs(),
            recipe.start_period.as_secs(),
            recipe.retries,
            recipe.probe_command()
        )?;
        writeln!(f, "ENTRYPOINT [\"/usr/local/bin/{}\"]", ENTRYPOINT_FILE)?;
        writeln!(f, "CMD [\"webui\"]")
    }
}

struct Entrypoint<'a>(&'a Recipe);

impl fmt::Display for Entrypoint<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        let recipe = self.0;
        writeln!(f, "#!/bin/sh\nset -e\n")?;
        writeln!(f, "cd {}\n", recipe.app_dir)?;
        writeln!(f, "mkdir -p {}\n", recipe.storage_dirs().join(" "))?;
        writeln!(
            f,
            "if [ ! -f config.toml ]; then
    if [ -f config.example.toml ]; then
        cp config.example.toml config.toml
    else
        touch config.toml
    fi
fi
"
        )?;
        writeln!(
            f,
            "if [ \"$#\" -eq 0 ] || [ \"$1\" = \"webui\" ]; then
    [ \"$#\" -gt 0 ] && shift
    exec streamlit run {} \\
        --server.address=0.0.0.0 \\
        --server.port={} \\
        --server.enableCORS=true \\
        --browser.gatherUsageStats=false \\
        \"$@\"
fi
",
            recipe.app_entry, recipe.port
        )?;
        writeln!(f, "exec \"$@\"")
    }
}

fn apt_install(
    f: &mut fmt::Formatter,
    packages: &[String],
) -> fmt::Result {
    if packages.is_empty() {
        return Ok(());
    }
    writeln!(
        f,
        "RUN apt-get update && \\
    apt-get install -y --no-install-recommends {} && \\
    rm -rf /var/lib/apt/lists/*",
        packages.join(" ")
    )
}
