//! Transports for communicating with the docker daemon

use crate::{Error, Result};
use futures_util::{
    stream::{self, Stream},
    StreamExt, TryFutureExt,
};
use hyper::{
    body::{Bytes, HttpBody},
    client::{Client, HttpConnector},
    header, Body, Method, Request, Response, StatusCode,
};
#[cfg(feature = "tls")]
use hyper_openssl::HttpsConnector;
#[cfg(feature = "unix-socket")]
use hyperlocal::UnixConnector;
#[cfg(feature = "unix-socket")]
use hyperlocal::Uri as DomainUri;
use mime::Mime;
use serde::Deserialize;
use std::{collections::HashMap, fmt};
use url::form_urlencoded;

pub(crate) type Headers = Option<Vec<(&'static str, String)>>;
pub(crate) type Payload = Option<(Body, Mime)>;

pub fn tar() -> Mime {
    "application/x-tar".parse().unwrap()
}

/// Form-encodes query parameters, `None` when there are none
pub(crate) fn encode_query(params: &HashMap<&'static str, String>) -> Option<String> {
    if params.is_empty() {
        return None;
    }
    Some(
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish(),
    )
}

/// `path?query`, or `path` alone without a query
pub(crate) fn with_query(
    path: String,
    query: Option<String>,
) -> String {
    match query {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    }
}

/// Transports are types which define the means of communication
/// with the docker daemon
#[derive(Clone)]
pub enum Transport {
    /// A network tcp interface
    Tcp {
        client: Client<HttpConnector>,
        host: String,
    },
    /// TCP/TLS
    #[cfg(feature = "tls")]
    EncryptedTcp {
        client: Client<HttpsConnector<HttpConnector>>,
        host: String,
    },
    /// A Unix domain socket
    #[cfg(feature = "unix-socket")]
    Unix {
        client: Client<UnixConnector>,
        path: String,
    },
}

impl fmt::Debug for Transport {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            Transport::Tcp { ref host, .. } => write!(f, "Tcp({})", host),
            #[cfg(feature = "tls")]
            Transport::EncryptedTcp { ref host, .. } => write!(f, "EncryptedTcp({})", host),
            #[cfg(feature = "unix-socket")]
            Transport::Unix { ref path, .. } => write!(f, "Unix({})", path),
        }
    }
}

impl Transport {
    /// Make a request and return the whole response body as a String
    pub async fn request(
        &self,
        method: Method,
        endpoint: impl AsRef<str>,
        body: Payload,
        headers: Headers,
    ) -> Result<String> {
        let body = self.get_body(method, endpoint, body, headers).await?;
        let bytes = concat_chunks(body).await?;

        let string = String::from_utf8(bytes)?;

        Ok(string)
    }

    async fn get_body(
        &self,
        method: Method,
        endpoint: impl AsRef<str>,
        body: Payload,
        headers: Headers,
    ) -> Result<Body> {
        let req = self.build_request(method, endpoint, body, headers)?;
        let response = self.send_request(req).await?;

        let status = response.status();

        match status {
            StatusCode::OK
            | StatusCode::CREATED
            | StatusCode::SWITCHING_PROTOCOLS
            | StatusCode::NO_CONTENT => Ok(response.into_body()),
            _ => {
                let bytes = concat_chunks(response.into_body()).await?;
                let message_body = String::from_utf8(bytes)?;

                Err(Error::Fault {
                    code: status,
                    message: Self::get_error_message(&message_body).unwrap_or_else(|| {
                        status
                            .canonical_reason()
                            .unwrap_or("unknown error code")
                            .to_owned()
                    }),
                })
            }
        }
    }

    async fn get_chunk_stream(
        &self,
        method: Method,
        endpoint: impl AsRef<str>,
        body: Payload,
        headers: Headers,
    ) -> Result<impl Stream<Item = Result<Bytes>>> {
        let body = self.get_body(method, endpoint, body, headers).await?;

        Ok(stream_body(body))
    }

    /// Make a request and return a stream of the response body chunks
    pub fn stream_chunks<'a>(
        &'a self,
        method: Method,
        endpoint: impl AsRef<str> + 'a,
        body: Payload,
        headers: Headers,
    ) -> impl Stream<Item = Result<Bytes>> + 'a {
        self.get_chunk_stream(method, endpoint, body, headers)
            .try_flatten_stream()
    }

    /// Builds an HTTP request.
    fn build_request(
        &self,
        method: Method,
        endpoint: impl AsRef<str>,
        body: Payload,
        headers: Headers,
    ) -> Result<Request<Body>> {
        let uri = match self {
            Transport::Tcp { host, .. } => format!("{}{}", host, endpoint.as_ref()),
            #[cfg(feature = "tls")]
            Transport::EncryptedTcp { host, .. } => format!("{}{}", host, endpoint.as_ref()),
            #[cfg(feature = "unix-socket")]
            Transport::Unix { path, .. } => {
                let uri: hyper::Uri = DomainUri::new(&path, endpoint.as_ref()).into();
                uri.to_string()
            }
        };
        log::debug!("{} {}", method, uri);

        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header(header::HOST, "");

        if let Some(h) = headers {
            for (k, v) in h.into_iter() {
                builder = builder.header(k, v);
            }
        }

        match body {
            Some((b, c)) => Ok(builder
                .header(header::CONTENT_TYPE, &c.to_string()[..])
                .body(b)?),
            _ => Ok(builder.body(Body::empty())?),
        }
    }

    /// Send the given request to the docker daemon and return a Future of the response.
    async fn send_request(
        &self,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        match self {
            Transport::Tcp { ref client, .. } => Ok(client.request(req).await?),
            #[cfg(feature = "tls")]
            Transport::EncryptedTcp { ref client, .. } => Ok(client.request(req).await?),
            #[cfg(feature = "unix-socket")]
            Transport::Unix { ref client, .. } => Ok(client.request(req).await?),
        }
    }

    /// Extract the error message content from an HTTP response that
    /// contains a Docker JSON error structure.
    fn get_error_message(body: &str) -> Option<String> {
        serde_json::from_str::<ErrorResponse>(body)
            .map(|e| e.message)
            .ok()
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: String,
}

fn stream_body(body: Body) -> impl Stream<Item = Result<Bytes>> {
    async fn unfold(mut body: Body) -> Option<(Result<Bytes>, Body)> {
        let chunk_result = body.data().await?.map_err(Error::from);

        Some((chunk_result, body))
    }

    stream::unfold(body, unfold)
}

pub(crate) async fn concat_chunks(body: Body) -> Result<Vec<u8>> {
    let mut v = Vec::default();
    let mut stream = Box::pin(stream_body(body));

    while let Some(bytes) = stream.next().await {
        v.extend(bytes?);
    }

    Ok(v)
}
