//! Command line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Overrides;

/// Build, run and probe the NarratoAI container
#[derive(Parser, Debug, Clone)]
#[command(name = "narratoctl", version)]
#[command(about = "Build, run and probe the NarratoAI container", long_about = None)]
pub struct Args {
    /// Config file, defaults to $NARRATOCTL_CONFIG or ./narratoctl.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Container name
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Image reference
    #[arg(long, global = true)]
    pub image: Option<String>,

    /// Host port published for the web UI
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Project root holding storage/, config.toml and resource/
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create and start the container, replacing a previous one
    Start {
        /// Build the image first
        #[arg(long)]
        build: bool,

        /// Pull the image if it is not available locally
        #[arg(long, conflicts_with = "build")]
        pull: bool,
    },
    /// Stop and remove the container
    Stop,
    /// Print the container's output
    Logs {
        /// Keep streaming new output
        #[arg(short, long)]
        follow: bool,

        /// Only the last N lines
        #[arg(long, value_name = "N")]
        tail: Option<usize>,

        /// Prefix each line with its timestamp
        #[arg(short, long)]
        timestamps: bool,
    },
    /// Run a command inside the running container
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
    /// Probe the web UI's health endpoint
    Health {
        /// Keep probing for up to SECS seconds until healthy
        #[arg(long, value_name = "SECS")]
        wait: Option<u64>,
    },
    /// Build the image
    Build {
        #[arg(long)]
        no_cache: bool,
    },
    /// Show the container's state
    Status,
    /// Create the host directories and config.toml
    Prepare,
    /// Write the Dockerfile and entrypoint into the project root
    Render,
    /// Check that docker and ffmpeg are available
    Doctor,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            name: self.name.clone(),
            image: self.image.clone(),
            host_port: self.port,
            root: self.root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_defaults() {
        let args = Args::parse_from(["narratoctl", "start"]);
        assert_eq!(
            args.command,
            Command::Start {
                build: false,
                pull: false
            }
        );
        assert!(args.config.is_none());
        assert!(args.port.is_none());
    }

    #[test]
    fn test_global_overrides_after_subcommand() {
        let args = Args::parse_from(["narratoctl", "start", "--build", "--port", "11170"]);
        assert_eq!(
            args.command,
            Command::Start {
                build: true,
                pull: false
            }
        );
        let overrides = args.overrides();
        assert_eq!(overrides.host_port, Some(11170));
        assert_eq!(overrides.name, None);
    }

    #[test]
    fn test_build_and_pull_conflict() {
        assert!(Args::try_parse_from(["narratoctl", "start", "--build", "--pull"]).is_err());
    }

    #[test]
    fn test_logs_flags() {
        let args = Args::parse_from(["narratoctl", "logs", "-f", "--tail", "200", "-t"]);
        assert_eq!(
            args.command,
            Command::Logs {
                follow: true,
                tail: Some(200),
                timestamps: true
            }
        );
    }

    #[test]
    fn test_exec_keeps_command_flags() {
        let args = Args::parse_from(["narratoctl", "exec", "python", "-c", "import torch"]);
        assert_eq!(
            args.command,
            Command::Exec {
                cmd: vec!["python".into(), "-c".into(), "import torch".into()]
            }
        );
    }

    #[test]
    fn test_exec_requires_command() {
        assert!(Args::try_parse_from(["narratoctl", "exec"]).is_err());
    }

    #[test]
    fn test_health_wait() {
        let args = Args::parse_from([
            "narratoctl",
            "-c",
            "/etc/narratoctl.toml",
            "health",
            "--wait",
            "90",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/narratoctl.toml")));
        assert_eq!(args.command, Command::Health { wait: Some(90) });
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Args::try_parse_from(["narratoctl", "restart"]).is_err());
    }
}
