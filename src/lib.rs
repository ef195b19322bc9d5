//! narratoctl builds, runs and probes the [NarratoAI](https://github.com/linyqh/NarratoAI)
//! container by talking to the docker daemon's HTTP API.
//!
//! # examples
//!
//! ```no_run
//! # async {
//! use narratoctl::{lifecycle::{Lifecycle, StartOptions}, Settings};
//!
//! let settings = Settings::load(None)?;
//! let lifecycle = Lifecycle::connect(settings)?;
//! let url = lifecycle
//!     .start(&StartOptions::default(), &mut std::io::stdout())
//!     .await?;
//! println!("web ui on {}", url);
//! # Ok::<(), narratoctl::Error>(())
//! # };
//! ```

pub mod cli;
pub mod config;
pub mod container;
pub mod docker;
pub mod errors;
pub mod exec;
pub mod health;
pub mod image;
pub mod layout;
pub mod lifecycle;
pub mod recipe;
pub mod tarball;
pub mod transport;
pub mod tty;

pub use crate::{
    config::Settings,
    container::{Container, ContainerOptions, Containers, LogsOptions, RmContainerOptions},
    docker::Docker,
    errors::{Error, Result},
    exec::{Exec, ExecContainerOptions},
    health::{HealthReport, Probe},
    image::{BuildOptions, Image, Images, PullOptions, RegistryAuth},
    lifecycle::Lifecycle,
    recipe::Recipe,
};
