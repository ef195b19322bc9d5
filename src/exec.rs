//! Run new commands inside the running container.
//!
//! API Reference: <https://docs.docker.com/engine/api/v1.41/#tag/Exec>

use std::collections::HashMap;

use futures_util::{stream::Stream, TryFutureExt};
use hyper::Body;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{Error, Result},
    tty, Docker,
};

/// Interface for docker exec instance
pub struct Exec<'docker> {
    docker: &'docker Docker,
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

impl<'docker> Exec<'docker> {
    fn new<S>(
        docker: &'docker Docker,
        id: S,
    ) -> Self
    where
        S: Into<String>,
    {
        Exec {
            docker,
            id: id.into(),
        }
    }

    /// The daemon assigned id of this exec instance
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creates a new exec instance that will be executed in a container with id == container_id
    pub async fn create(
        docker: &'docker Docker,
        container_id: &str,
        opts: &ExecContainerOptions,
    ) -> Result<Exec<'docker>> {
        let body: Body = opts.serialize()?.into();

        let id = docker
            .post_json(
                &format!("/containers/{}/exec", container_id),
                Some((body, mime::APPLICATION_JSON)),
            )
            .await
            .map(|resp: CreateResponse| resp.id)?;

        Ok(Exec::new(docker, id))
    }

    /// Starts this exec instance returning a multiplexed tty stream
    pub fn start(&self) -> impl Stream<Item = Result<tty::TtyChunk>> + Unpin + 'docker {
        // Own the docker reference and endpoint so the stream outlives `self`
        let docker = self.docker;
        let endpoint = format!("/exec/{}/start", &self.id);
        Box::pin(
            async move {
                let stream = Box::pin(docker.stream_post(
                    endpoint,
                    Some((r#"{"Detach":false}"#.into(), mime::APPLICATION_JSON)),
                    None,
                ));

                Ok::<_, Error>(tty::decode(stream))
            }
            .try_flatten_stream(),
        )
    }

    /// Inspect this exec instance to aquire detailed information
    pub async fn inspect(&self) -> Result<ExecDetails> {
        self.docker
            .get_json(&format!("/exec/{}/json", &self.id)[..])
            .await
    }
}

/// Interface for creating a new exec instance
#[derive(Serialize, Debug)]
pub struct ExecContainerOptions {
    params: HashMap<&'static str, Vec<String>>,
    params_bool: HashMap<&'static str, bool>,
    working_dir: Option<String>,
}

impl ExecContainerOptions {
    /// return a new instance of a builder for options
    pub fn builder() -> ExecContainerOptionsBuilder {
        ExecContainerOptionsBuilder::default()
    }

    /// serialize options as a string
    pub fn serialize(&self) -> Result<String> {
        let mut body = serde_json::Map::new();

        for (k, v) in &self.params {
            body.insert(k.to_string(), serde_json::to_value(v)?);
        }

        for (k, v) in &self.params_bool {
            body.insert(k.to_string(), serde_json::to_value(v)?);
        }

        if let Some(ref dir) = self.working_dir {
            body.insert("WorkingDir".to_string(), serde_json::to_value(dir)?);
        }

        serde_json::to_string(&body).map_err(Error::from)
    }
}

#[derive(Default)]
pub struct ExecContainerOptionsBuilder {
    params: HashMap<&'static str, Vec<String>>,
    params_bool: HashMap<&'static str, bool>,
    working_dir: Option<String>,
}

impl ExecContainerOptionsBuilder {
    /// Command to run, as an array of strings
    pub fn cmd<S>(
        &mut self,
        cmds: &[S],
    ) -> &mut Self
    where
        S: AsRef<str>,
    {
        for cmd in cmds {
            self.params
                .entry("Cmd")
                .or_insert_with(Vec::new)
                .push(cmd.as_ref().to_owned());
        }
        self
    }

    /// Directory the command runs in
    pub fn working_dir(
        &mut self,
        dir: &str,
    ) -> &mut Self {
        self.working_dir = Some(dir.to_owned());
        self
    }

    /// Attach to stdout of the exec command
    pub fn attach_stdout(
        &mut self,
        stdout: bool,
    ) -> &mut Self {
        self.params_bool.insert("AttachStdout", stdout);
        self
    }

    /// Attach to stderr of the exec command
    pub fn attach_stderr(
        &mut self,
        stderr: bool,
    ) -> &mut Self {
        self.params_bool.insert("AttachStderr", stderr);
        self
    }

    pub fn build(&self) -> ExecContainerOptions {
        ExecContainerOptions {
            params: self.params.clone(),
            params_bool: self.params_bool.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecDetails {
    #[serde(rename = "ID")]
    pub id: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn exec_options_body() {
        let options = ExecContainerOptions::builder()
            .cmd(&["python", "-c", "import moviepy"])
            .working_dir("/NarratoAI")
            .attach_stdout(true)
            .attach_stderr(true)
            .build();

        let body: Value = serde_json::from_str(&options.serialize().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({
                "AttachStderr": true,
                "AttachStdout": true,
                "Cmd": ["python", "-c", "import moviepy"],
                "WorkingDir": "/NarratoAI",
            })
        );
    }

    #[test]
    fn exec_details_without_exit_code_while_running() {
        let details: ExecDetails = serde_json::from_str(
            r#"{"ID":"e1","Running":true,"ExitCode":null,"ContainerID":"c1","Pid":77}"#,
        )
        .unwrap();
        assert!(details.running);
        assert_eq!(details.exit_code, None);
    }
}
