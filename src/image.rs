//! Build, pull and inspect the application image.
//!
//! API Reference: <https://docs.docker.com/engine/api/v1.41/#tag/Image>

use std::{collections::HashMap, path::PathBuf};

use futures_util::{stream::Stream, TryFutureExt, TryStreamExt};
use hyper::Body;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    docker::Docker,
    errors::{Error, Result},
    tarball::{self, ContextFile},
    transport::{encode_query, tar, with_query},
};

/// An image addressed by name, `repo:tag` or id
pub struct Image<'docker> {
    docker: &'docker Docker,
    name: String,
}

impl<'docker> Image<'docker> {
    pub fn new<S>(
        docker: &'docker Docker,
        name: S,
    ) -> Self
    where
        S: Into<String>,
    {
        Image {
            docker,
            name: name.into(),
        }
    }

    /// Fails with a 404 fault when the daemon does not have the image
    pub async fn inspect(&self) -> Result<ImageDetails> {
        self.docker
            .get_json(&format!("/images/{}/json", self.name))
            .await
    }
}

/// Entry point for image endpoints
pub struct Images<'docker> {
    docker: &'docker Docker,
}

impl<'docker> Images<'docker> {
    pub fn new(docker: &'docker Docker) -> Self {
        Images { docker }
    }

    /// Builds a new image from the build context directory named in the options.
    ///
    /// The stream yields the daemon's progress messages; a message carrying an
    /// `error` ends it with [`Error::Stream`].
    pub fn build(
        &self,
        opts: &BuildOptions,
    ) -> impl Stream<Item = Result<Value>> + Unpin + 'docker {
        let endpoint = with_query("/build".to_owned(), opts.serialize());

        // Tar the context up front so the stream does not borrow `opts`
        let mut bytes = Vec::default();
        let tar_result = tarball::dir(&mut bytes, &opts.path, &opts.extra_files);

        let docker = self.docker;
        Box::pin(
            async move {
                tar_result?;

                let messages = docker
                    .stream_post_json(endpoint, Some((Body::from(bytes), tar())), None)
                    .and_then(|value| async move { progress_or_error(value) });

                Ok(messages)
            }
            .try_flatten_stream(),
        )
    }

    pub fn get<S>(
        &self,
        name: S,
    ) -> Image<'docker>
    where
        S: Into<String>,
    {
        Image::new(self.docker, name)
    }

    /// Pulls from a registry, streaming progress the same way [`Images::build`] does
    pub fn pull(
        &self,
        opts: &PullOptions,
    ) -> impl Stream<Item = Result<Value>> + Unpin + 'docker {
        let path = with_query("/images/create".to_owned(), opts.serialize());
        let headers = opts
            .auth_header()
            .map(|auth| vec![("X-Registry-Auth", auth)]);

        Box::pin(
            self.docker
                .stream_post_json(path, None, headers)
                .and_then(|value| async move { progress_or_error(value) }),
        )
    }
}

/// Turns an `{"error": ...}` progress message into an error
fn progress_or_error(value: Value) -> Result<Value> {
    match value.get("error").and_then(Value::as_str) {
        Some(message) => Err(Error::Stream(message.trim_end().to_owned())),
        None => Ok(value),
    }
}

/// Human readable line of a build or pull progress message, if it has one
pub fn progress_line(value: &Value) -> Option<String> {
    if let Some(stream) = value.get("stream").and_then(Value::as_str) {
        let line = stream.trim_end();
        return if line.is_empty() {
            None
        } else {
            Some(line.to_owned())
        };
    }
    let status = value.get("status").and_then(Value::as_str)?;
    match value.get("progress").and_then(Value::as_str) {
        Some(progress) => Some(format!("{} {}", status, progress)),
        None => Some(status.to_owned()),
    }
}

#[derive(Clone, Serialize, Debug)]
#[serde(untagged)]
pub enum RegistryAuth {
    Password {
        username: String,
        password: String,

        #[serde(rename = "serveraddress")]
        #[serde(skip_serializing_if = "Option::is_none")]
        server_address: Option<String>,
    },
    Token {
        #[serde(rename = "identitytoken")]
        identity_token: String,
    },
}

impl RegistryAuth {
    /// Value of the `X-Registry-Auth` header: the JSON form, url-safe base64 encoded
    pub fn serialize(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(base64::encode_config(&json, base64::URL_SAFE))
    }
}

#[derive(Default, Debug)]
pub struct PullOptions {
    auth: Option<RegistryAuth>,
    params: HashMap<&'static str, String>,
}

impl PullOptions {
    pub fn builder() -> PullOptionsBuilder {
        PullOptionsBuilder::default()
    }

    pub fn serialize(&self) -> Option<String> {
        encode_query(&self.params)
    }

    pub(crate) fn auth_header(&self) -> Option<String> {
        self.auth.as_ref().and_then(|a| a.serialize().ok())
    }
}

#[derive(Default)]
pub struct PullOptionsBuilder {
    auth: Option<RegistryAuth>,
    params: HashMap<&'static str, String>,
}

impl PullOptionsBuilder {
    /// Repository to pull from, optionally with a `:tag` or `@digest`
    pub fn image<I>(
        &mut self,
        image: I,
    ) -> &mut Self
    where
        I: Into<String>,
    {
        self.params.insert("fromImage", image.into());
        self
    }

    pub fn auth(
        &mut self,
        auth: RegistryAuth,
    ) -> &mut Self {
        self.auth = Some(auth);
        self
    }

    pub fn build(&mut self) -> PullOptions {
        PullOptions {
            auth: self.auth.take(),
            params: self.params.clone(),
        }
    }
}

#[derive(Default, Debug)]
pub struct BuildOptions {
    pub path: PathBuf,
    extra_files: Vec<ContextFile>,
    params: HashMap<&'static str, String>,
}

impl BuildOptions {
    /// `path` is the build context directory
    pub fn builder<P>(path: P) -> BuildOptionsBuilder
    where
        P: Into<PathBuf>,
    {
        BuildOptionsBuilder::new(path)
    }

    pub fn serialize(&self) -> Option<String> {
        encode_query(&self.params)
    }
}

#[derive(Default)]
pub struct BuildOptionsBuilder {
    path: PathBuf,
    extra_files: Vec<ContextFile>,
    params: HashMap<&'static str, String>,
}

impl BuildOptionsBuilder {
    pub(crate) fn new<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        BuildOptionsBuilder {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Dockerfile location relative to the context, `Dockerfile` when unset
    pub fn dockerfile<P>(
        &mut self,
        path: P,
    ) -> &mut Self
    where
        P: Into<String>,
    {
        self.params.insert("dockerfile", path.into());
        self
    }

    pub fn tag<T>(
        &mut self,
        name: T,
    ) -> &mut Self
    where
        T: Into<String>,
    {
        self.params.insert("t", name.into());
        self
    }

    pub fn nocache(
        &mut self,
        nocache: bool,
    ) -> &mut Self {
        self.params.insert("nocache", nocache.to_string());
        self
    }

    /// Refresh base images even when a local copy exists
    pub fn pull(
        &mut self,
        pull: bool,
    ) -> &mut Self {
        self.params.insert("pull", pull.to_string());
        self
    }

    pub fn rm(
        &mut self,
        rm: bool,
    ) -> &mut Self {
        self.params.insert("rm", rm.to_string());
        self
    }

    /// `ARG` values for the build, sent as a JSON object
    pub fn buildargs(
        &mut self,
        args: &HashMap<String, String>,
    ) -> &mut Self {
        if !args.is_empty() {
            if let Ok(encoded) = serde_json::to_string(args) {
                self.params.insert("buildargs", encoded);
            }
        }
        self
    }

    /// Adds a generated file to the context. It shadows a file at the same path
    /// on disk and replaces an earlier extra file with that path.
    pub fn extra_file(
        &mut self,
        file: ContextFile,
    ) -> &mut Self {
        self.extra_files.retain(|f| f.path != file.path);
        self.extra_files.push(file);
        self
    }

    pub fn build(&self) -> BuildOptions {
        BuildOptions {
            path: self.path.clone(),
            extra_files: self.extra_files.clone(),
            params: self.params.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageDetails {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    pub created: String,
    #[serde(default)]
    pub size: u64,
}
