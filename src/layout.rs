//! Host side of the bind mounts.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    errors::{Error, Result},
    recipe::STORAGE_DIRS,
};

/// The project directories and files shared with the container
#[derive(Clone, Debug)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new<P>(root: P) -> Self
    where
        P: Into<PathBuf>,
    {
        HostLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn storage(&self) -> PathBuf {
        self.root.join("storage")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn resource(&self) -> PathBuf {
        self.root.join("resource")
    }

    /// Creates every bind mount source. Safe to call repeatedly; an existing
    /// `config.toml` is never touched.
    pub fn prepare(&self) -> Result<()> {
        for dir in STORAGE_DIRS.iter() {
            fs::create_dir_all(self.storage().join(dir))?;
        }
        fs::create_dir_all(self.resource())?;

        let config = self.config_file();
        if config.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is a directory, expected a file",
                config.display()
            )));
        }
        if !config.exists() {
            let example = self.root.join("config.example.toml");
            if example.is_file() {
                log::info!("seeding {} from {}", config.display(), example.display());
                fs::copy(&example, &config)?;
            } else {
                log::info!("creating empty {}", config.display());
                fs::File::create(&config)?;
            }
        }
        Ok(())
    }

    /// `host:container:rw` bind strings with absolute host paths
    pub fn binds(
        &self,
        app_dir: &str,
    ) -> Result<Vec<String>> {
        let root = self.root.canonicalize()?;
        let config = root.join("config.toml");
        if config.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is a directory, expected a file",
                config.display()
            )));
        }
        let app_dir = app_dir.trim_end_matches('/');
        Ok(["storage", "config.toml", "resource"]
            .iter()
            .map(|name| {
                format!(
                    "{}:{}/{}:rw",
                    root.join(name).display(),
                    app_dir,
                    name
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_creates_every_mount_source() {
        let root = tempfile::tempdir().unwrap();
        let layout = HostLayout::new(root.path());
        layout.prepare().unwrap();

        for dir in STORAGE_DIRS.iter() {
            assert!(root.path().join("storage").join(dir).is_dir());
        }
        assert!(root.path().join("resource").is_dir());
        assert!(root.path().join("config.toml").is_file());
    }

    #[test]
    fn prepare_seeds_config_once() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("config.example.toml"), "[app]\nllm = \"openai\"\n").unwrap();
        let layout = HostLayout::new(root.path());

        layout.prepare().unwrap();
        assert_eq!(
            fs::read_to_string(layout.config_file()).unwrap(),
            "[app]\nllm = \"openai\"\n"
        );

        fs::write(layout.config_file(), "[app]\nllm = \"ollama\"\n").unwrap();
        layout.prepare().unwrap();
        assert_eq!(
            fs::read_to_string(layout.config_file()).unwrap(),
            "[app]\nllm = \"ollama\"\n"
        );
    }

    #[test]
    fn config_directory_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("config.toml")).unwrap();
        let layout = HostLayout::new(root.path());

        assert!(matches!(layout.prepare(), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            layout.binds("/NarratoAI"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn binds_are_absolute() {
        let root = tempfile::tempdir().unwrap();
        let layout = HostLayout::new(root.path());
        layout.prepare().unwrap();

        let abs = root.path().canonicalize().unwrap();
        assert_eq!(
            layout.binds("/NarratoAI/").unwrap(),
            vec![
                format!("{}:/NarratoAI/storage:rw", abs.join("storage").display()),
                format!("{}:/NarratoAI/config.toml:rw", abs.join("config.toml").display()),
                format!("{}:/NarratoAI/resource:rw", abs.join("resource").display()),
            ]
        );
    }
}
