//! Connection to the docker daemon, plus the raw request helpers the
//! container, exec and image endpoints are built on.
//!
//! API Reference: <https://docs.docker.com/engine/api/v1.41/>

use std::env;
#[cfg(feature = "tls")]
use std::path::Path;

use futures_util::{
    stream::{self, Stream},
    StreamExt,
};
use hyper::{body::Bytes, client::HttpConnector, Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::DockerSettings,
    container::Containers,
    errors::{Error, Result},
    image::Images,
    transport::{Headers, Payload, Transport},
};

#[cfg(feature = "tls")]
use hyper_openssl::HttpsConnector;
#[cfg(feature = "tls")]
use openssl::ssl::{SslConnector, SslConnectorBuilder, SslFiletype, SslMethod};

#[cfg(feature = "unix-socket")]
use hyperlocal::UnixConnector;

/// Socket the docker daemon listens on when nothing else is configured
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// A daemon address in `DOCKER_HOST` syntax
#[derive(Clone, Debug, PartialEq)]
pub enum DaemonAddr {
    /// Path of a unix domain socket
    Unix(String),
    /// `host:port` of a tcp listener
    Tcp(String),
}

impl DaemonAddr {
    /// Accepts `unix://<path>`, `tcp://<authority>` and `http://<authority>`
    pub fn parse(uri: &str) -> Result<DaemonAddr> {
        let (scheme, rest) = match uri.find("://") {
            Some(at) => (&uri[..at], &uri[at + 3..]),
            None => return Err(Error::UnsupportedScheme(uri.to_owned())),
        };
        let rest = rest.trim_end_matches('/');

        match scheme {
            "unix" | "tcp" | "http" if rest.is_empty() => Err(Error::MissingAuthority),
            // the trailing slash trim above would eat a bare "/"
            "unix" => Ok(DaemonAddr::Unix(format!("/{}", rest.trim_start_matches('/')))),
            "tcp" | "http" => Ok(DaemonAddr::Tcp(rest.to_owned())),
            other => Err(Error::UnsupportedScheme(other.to_owned())),
        }
    }
}

/// Handle on a docker daemon. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Docker {
    transport: Transport,
}

fn http_connector() -> HttpConnector {
    let mut http = HttpConnector::new();
    // tcp:// uris are accepted as well as http://
    http.enforce_http(false);
    http
}

/// Client certificate from `cert.pem`/`key.pem`, and `ca.pem` when verifying
#[cfg(feature = "tls")]
fn ssl_connector(
    cert_dir: &Path,
    verify: bool,
) -> Result<SslConnectorBuilder> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_cipher_list("DEFAULT")?;
    builder.set_certificate_file(cert_dir.join("cert.pem"), SslFiletype::PEM)?;
    builder.set_private_key_file(cert_dir.join("key.pem"), SslFiletype::PEM)?;
    if verify {
        builder.set_ca_file(cert_dir.join("ca.pem"))?;
    }
    Ok(builder)
}

impl Docker {
    /// Connects without TLS to a daemon given in `DOCKER_HOST` syntax.
    /// Use [`Docker::tls`] for certificate authenticated tcp.
    pub fn new<S>(uri: S) -> Result<Docker>
    where
        S: AsRef<str>,
    {
        match DaemonAddr::parse(uri.as_ref())? {
            #[cfg(feature = "unix-socket")]
            DaemonAddr::Unix(path) => Ok(Docker::unix(path)),
            #[cfg(not(feature = "unix-socket"))]
            DaemonAddr::Unix(_) => Err(Error::UnsupportedScheme("unix".to_owned())),
            DaemonAddr::Tcp(host) => Ok(Docker::tcp(host)),
        }
    }

    /// Connects the way the docker cli would: an explicit host from the settings first,
    /// then `DOCKER_HOST`, then the default local socket. TLS is used for tcp hosts
    /// whenever a certificate directory is configured or `DOCKER_CERT_PATH` is set.
    pub fn from_settings(settings: &DockerSettings) -> Result<Docker> {
        let host = settings
            .host
            .clone()
            .or_else(|| env::var("DOCKER_HOST").ok())
            .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_owned());

        #[cfg(feature = "tls")]
        {
            let cert_dir = settings
                .cert_path
                .clone()
                .or_else(|| env::var_os("DOCKER_CERT_PATH").map(Into::into));
            if let (Some(cert_dir), DaemonAddr::Tcp(authority)) =
                (cert_dir, DaemonAddr::parse(&host)?)
            {
                let verify = settings.tls_verify || env::var_os("DOCKER_TLS_VERIFY").is_some();
                return Docker::tls(authority, cert_dir, verify);
            }
        }

        Docker::new(host)
    }

    /// Talks to the daemon over the unix socket at `socket_path`
    #[cfg(feature = "unix-socket")]
    pub fn unix<S>(socket_path: S) -> Docker
    where
        S: Into<String>,
    {
        Docker {
            transport: Transport::Unix {
                client: Client::builder()
                    .pool_max_idle_per_host(0)
                    .build(UnixConnector),
                path: socket_path.into(),
            },
        }
    }

    /// Talks to the daemon at `host` (`host:port`) over TLS, authenticating
    /// with the certificates in `cert_dir`
    #[cfg(feature = "tls")]
    pub fn tls<S, P>(
        host: S,
        cert_dir: P,
        verify: bool,
    ) -> Result<Docker>
    where
        S: Into<String>,
        P: AsRef<Path>,
    {
        let connector = ssl_connector(cert_dir.as_ref(), verify)?;
        let https = HttpsConnector::with_connector(http_connector(), connector)?;

        Ok(Docker {
            transport: Transport::EncryptedTcp {
                client: Client::builder().build(https),
                host: format!("https://{}", host.into()),
            },
        })
    }

    /// Talks to the daemon at `host` (`host:port`) over plain tcp
    pub fn tcp<S>(host: S) -> Docker
    where
        S: Into<String>,
    {
        Docker {
            transport: Transport::Tcp {
                client: Client::builder().build(http_connector()),
                host: format!("tcp://{}", host.into()),
            },
        }
    }

    pub fn images(&self) -> Images<'_> {
        Images::new(self)
    }

    pub fn containers(&self) -> Containers<'_> {
        Containers::new(self)
    }

    /// Version of the daemon and the platform it runs on
    pub async fn version(&self) -> Result<Version> {
        self.get_json("/version").await
    }

    pub(crate) async fn get_json<T>(
        &self,
        endpoint: &str,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let raw = self
            .transport
            .request(Method::GET, endpoint, None, None)
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// POST whose response body is of no interest
    pub(crate) async fn post(
        &self,
        endpoint: &str,
        body: Payload,
    ) -> Result<()> {
        self.transport
            .request(Method::POST, endpoint, body, None)
            .await?;
        Ok(())
    }

    pub(crate) async fn post_json<T>(
        &self,
        endpoint: &str,
        body: Payload,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let raw = self
            .transport
            .request(Method::POST, endpoint, body, None)
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub(crate) async fn delete(
        &self,
        endpoint: &str,
    ) -> Result<()> {
        self.transport
            .request(Method::DELETE, endpoint, None, None)
            .await?;
        Ok(())
    }

    /// Response body of a GET, chunk by chunk
    pub(crate) fn stream_get<'a>(
        &'a self,
        endpoint: String,
    ) -> impl Stream<Item = Result<Bytes>> + 'a {
        self.transport
            .stream_chunks(Method::GET, endpoint, None, None)
    }

    /// Response body of a POST, chunk by chunk
    pub(crate) fn stream_post<'a>(
        &'a self,
        endpoint: String,
        body: Payload,
        headers: Headers,
    ) -> impl Stream<Item = Result<Bytes>> + 'a {
        self.transport
            .stream_chunks(Method::POST, endpoint, body, headers)
    }

    /// POST answered by a stream of JSON messages, as build and pull are.
    /// Messages do not line up with body chunks: a chunk may carry several
    /// of them or end halfway through one.
    pub(crate) fn stream_post_json<'a>(
        &'a self,
        endpoint: String,
        body: Payload,
        headers: Headers,
    ) -> impl Stream<Item = Result<Value>> + 'a {
        let chunks = Box::pin(self.stream_post(endpoint, body, headers));
        stream::try_unfold((chunks, JsonMessages::default()), next_json_message)
    }
}

/// Bytes received so far that do not yet form a complete JSON message
#[derive(Debug, Default)]
struct JsonMessages {
    pending: Vec<u8>,
}

impl JsonMessages {
    fn extend(
        &mut self,
        chunk: &[u8],
    ) {
        self.pending.extend_from_slice(chunk);
    }

    /// Takes the next complete message off the front of the buffer
    fn next_message(&mut self) -> Result<Option<Value>> {
        let (next, consumed) = {
            let mut values =
                serde_json::Deserializer::from_slice(&self.pending).into_iter::<Value>();
            let next = values.next();
            (next, values.byte_offset())
        };
        match next {
            Some(Ok(value)) => {
                self.pending.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(e.into()),
            None => {
                // only whitespace left
                self.pending.clear();
                Ok(None)
            }
        }
    }

    fn finish(&self) -> Result<()> {
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(Error::InvalidResponse(format!(
                "stream ended inside a message: {}",
                String::from_utf8_lossy(&self.pending)
            )))
        }
    }
}

async fn next_json_message<S>(
    (mut chunks, mut messages): (S, JsonMessages),
) -> Result<Option<(Value, (S, JsonMessages))>>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    loop {
        if let Some(value) = messages.next_message()? {
            return Ok(Some((value, (chunks, messages))));
        }
        match chunks.next().await {
            Some(chunk) => messages.extend(&chunk?),
            None => {
                messages.finish()?;
                return Ok(None);
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Version {
    pub version: String,
    pub api_version: String,
    #[serde(default)]
    pub git_commit: String,
    #[serde(default)]
    pub go_version: String,
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub kernel_version: String,
}
