//! Drives the lifecycle against a fake docker daemon served over plain tcp.

use std::{
    convert::Infallible,
    io::Read,
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use narratoctl::{
    lifecycle::{BuildRequest, Lifecycle, LogsRequest, StartOptions},
    Docker, Error, Settings,
};
use serde_json::{json, Value};

#[derive(Default)]
struct Daemon {
    has_image: bool,
    exists: bool,
    stopped: bool,
    port: AtomicU16,
    requests: Mutex<Vec<String>>,
    create_bodies: Mutex<Vec<Value>>,
    build_context: Mutex<Vec<(String, Vec<u8>)>>,
}

fn frame(
    kind: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = vec![kind, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn reply(
    status: StatusCode,
    body: Value,
) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap()
}

/// Files of a gzipped build context tarball
fn unpack(tarball: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(tarball));
    let mut files = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        files.push((name, contents));
    }
    files
}

/// Answers with `parts` as separate body chunks, pausing between them
fn dribble(parts: Vec<&'static str>) -> Response<Body> {
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        for part in parts {
            if sender.send_data(part.into()).await.is_err() {
                return;
            }
            tokio::time::delay_for(Duration::from_millis(50)).await;
        }
    });
    Response::builder()
        .header("Content-Type", "application/json")
        .body(body)
        .unwrap()
}

fn no_such_container() -> Response<Body> {
    reply(
        StatusCode::NOT_FOUND,
        json!({"message": "No such container: narratoai"}),
    )
}

impl Daemon {
    fn inspect(&self) -> Value {
        json!({
            "Id": "c0ffee",
            "Name": "/narratoai",
            "Image": "sha256:9a5d",
            "Created": "2024-05-02T09:11:42.123456789Z",
            "State": {
                "Status": "running",
                "Running": true,
                "Paused": false,
                "Restarting": false,
                "OOMKilled": false,
                "Pid": 4242,
                "ExitCode": 0,
                "Error": "",
                "StartedAt": "2024-05-02T09:11:43Z",
                "FinishedAt": "0001-01-01T00:00:00Z",
                "Health": {"Status": "healthy", "FailingStreak": 0}
            },
            "HostConfig": {
                "NetworkMode": "default",
                "PortBindings": {
                    "8501/tcp": [{
                        "HostIp": "",
                        "HostPort": self.port.load(Ordering::SeqCst).to_string()
                    }]
                }
            },
            "Mounts": [],
            "RestartCount": 0
        })
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Response<Body> {
        let line = format!(
            "{} {}",
            req.method(),
            req.uri()
                .path_and_query()
                .map(|p| p.as_str())
                .unwrap_or("/")
        );
        self.requests.lock().unwrap().push(line.clone());

        match line.as_str() {
            "GET /images/narratoai:latest/json" if self.has_image => reply(
                StatusCode::OK,
                json!({
                    "Id": "sha256:9a5d",
                    "RepoTags": ["narratoai:latest"],
                    "Created": "2024-05-02T09:00:00Z",
                    "Size": 1
                }),
            ),
            "GET /images/narratoai:latest/json" => reply(
                StatusCode::NOT_FOUND,
                json!({"message": "No such image: narratoai:latest"}),
            ),
            "DELETE /containers/narratoai?force=true" | "DELETE /containers/narratoai" => {
                if self.exists {
                    empty(StatusCode::NO_CONTENT)
                } else {
                    no_such_container()
                }
            }
            "POST /containers/narratoai/stop?t=10" if self.stopped => {
                empty(StatusCode::NOT_MODIFIED)
            }
            "POST /containers/narratoai/stop?t=10" => no_such_container(),
            "POST /containers/create?name=narratoai" => {
                let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                self.create_bodies
                    .lock()
                    .unwrap()
                    .push(serde_json::from_slice(&bytes).unwrap());
                reply(
                    StatusCode::CREATED,
                    json!({"Id": "c0ffee", "Warnings": []}),
                )
            }
            "POST /containers/c0ffee/start" => empty(StatusCode::NO_CONTENT),
            "GET /containers/narratoai/json" if self.exists => {
                reply(StatusCode::OK, self.inspect())
            }
            "GET /containers/narratoai/json" => no_such_container(),
            "POST /containers/narratoai/exec" => {
                reply(StatusCode::CREATED, json!({"Id": "e1"}))
            }
            "POST /exec/e1/start" => {
                let mut wire = frame(1, b"hello\n");
                wire.extend(frame(2, b"oops\n"));
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/vnd.docker.raw-stream")
                    .body(Body::from(wire))
                    .unwrap()
            }
            "GET /exec/e1/json" => reply(
                StatusCode::OK,
                json!({"ID": "e1", "Running": false, "ExitCode": 3, "ContainerID": "c0ffee"}),
            ),
            _ if line.starts_with("GET /containers/narratoai/logs?") => {
                let mut wire = frame(1, b"booting streamlit\n");
                wire.extend(frame(2, b"WARNING: no GPU found\n"));
                wire.extend(frame(1, b"You can now view your Streamlit app\n"));
                Response::builder()
                    .header("Content-Type", "application/vnd.docker.raw-stream")
                    .body(Body::from(wire))
                    .unwrap()
            }
            _ if line.starts_with("POST /build?") => {
                let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                *self.build_context.lock().unwrap() = unpack(&bytes);
                dribble(vec![
                    r#"{"stream":"Step 1/9 : FROM pyth"#,
                    "on:3.12-slim-bookworm AS builder\\n\"}\r\n{\"stream\":\"\\n\"}",
                    "\r\n{\"aux\":{\"ID\":\"sha256:9a5d\"}}\r\n",
                    "{\"stream\":\"Successfully tagged narratoai:latest\\n\"}\r\n",
                ])
            }
            "GET /_stcore/health" => Response::new(Body::from("ok")),
            _ => reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"message": format!("unexpected request {}", line)}),
            ),
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve(daemon: Daemon) -> (Arc<Daemon>, SocketAddr) {
    let daemon = Arc::new(daemon);
    let shared = daemon.clone();
    let make_svc = make_service_fn(move |_| {
        let daemon = shared.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let daemon = daemon.clone();
                async move { Ok::<_, Infallible>(daemon.handle(req).await) }
            }))
        }
    });

    let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
    let addr = server.local_addr();
    daemon.port.store(addr.port(), Ordering::SeqCst);
    tokio::spawn(async move {
        let _ = server.await;
    });
    (daemon, addr)
}

fn lifecycle(
    addr: SocketAddr,
    root: &Path,
) -> Lifecycle {
    let mut settings = Settings::default();
    settings.paths.root = root.to_path_buf();
    settings.health.timeout_secs = 2;
    let docker = Docker::new(format!("tcp://{}", addr)).unwrap();
    Lifecycle::new(docker, settings)
}

#[tokio::test]
async fn start_replaces_previous_container() {
    let (daemon, addr) = serve(Daemon {
        has_image: true,
        exists: true,
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();

    let url = lifecycle(addr, root.path())
        .start(&StartOptions::default(), &mut Vec::<u8>::new())
        .await
        .unwrap();

    assert_eq!(url, "http://127.0.0.1:11170");
    assert_eq!(
        daemon.requests(),
        vec![
            "GET /images/narratoai:latest/json",
            "DELETE /containers/narratoai?force=true",
            "POST /containers/create?name=narratoai",
            "POST /containers/c0ffee/start",
        ]
    );

    let body = daemon.create_bodies.lock().unwrap()[0].clone();
    assert_eq!(body["Image"], "narratoai:latest");
    assert_eq!(body["Env"], json!(["PYTHONUNBUFFERED=1", "TZ=Asia/Shanghai"]));
    assert_eq!(
        body["HostConfig"]["PortBindings"]["8501/tcp"][0]["HostPort"],
        "11170"
    );
    let binds = body["HostConfig"]["Binds"].as_array().unwrap();
    assert!(binds[0].as_str().unwrap().ends_with("/storage:/NarratoAI/storage:rw"));
    assert!(root.path().join("storage/narration_scripts").is_dir());
    assert!(root.path().join("config.toml").is_file());
}

#[tokio::test]
async fn start_without_image_asks_for_a_build() {
    let (daemon, addr) = serve(Daemon::default()).await;
    let root = tempfile::tempdir().unwrap();

    let result = lifecycle(addr, root.path())
        .start(&StartOptions::default(), &mut Vec::<u8>::new())
        .await;

    match result {
        Err(Error::InvalidArgument(message)) => assert!(message.contains("narratoctl build")),
        other => panic!("expected a missing image error, got {:?}", other),
    }
    assert_eq!(daemon.requests(), vec!["GET /images/narratoai:latest/json"]);
}

#[tokio::test]
async fn stop_tolerates_missing_container() {
    let (daemon, addr) = serve(Daemon::default()).await;
    let root = tempfile::tempdir().unwrap();

    lifecycle(addr, root.path()).stop().await.unwrap();

    assert_eq!(
        daemon.requests(),
        vec![
            "POST /containers/narratoai/stop?t=10",
            "DELETE /containers/narratoai",
        ]
    );
}

#[tokio::test]
async fn exec_streams_output_and_returns_exit_code() {
    let (_daemon, addr) = serve(Daemon {
        exists: true,
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();

    let mut out = Vec::<u8>::new();
    let mut err = Vec::<u8>::new();
    let code = lifecycle(addr, root.path())
        .exec(&["python".to_string(), "--version".to_string()], &mut out, &mut err)
        .await
        .unwrap();

    assert_eq!(code, 3);
    assert_eq!(out, b"hello\n");
    assert_eq!(err, b"oops\n");
}

#[tokio::test]
async fn health_follows_the_published_port() {
    let (_daemon, addr) = serve(Daemon {
        exists: true,
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();

    let report = lifecycle(addr, root.path()).health(None).await.unwrap();

    assert!(report.is_healthy(), "{}", report);
    assert_eq!(report.container.as_deref(), Some("healthy"));
}

#[tokio::test]
async fn status_of_missing_container() {
    let (_daemon, addr) = serve(Daemon::default()).await;
    let root = tempfile::tempdir().unwrap();

    assert!(lifecycle(addr, root.path()).status().await.unwrap().is_none());
}

#[tokio::test]
async fn status_of_running_container() {
    let (daemon, addr) = serve(Daemon {
        exists: true,
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();

    let status = lifecycle(addr, root.path())
        .status()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.name, "narratoai");
    assert!(status.running);
    assert_eq!(status.host_port, Some(daemon.port.load(Ordering::SeqCst)));
}

#[tokio::test]
async fn stop_removes_an_already_stopped_container() {
    let (daemon, addr) = serve(Daemon {
        exists: true,
        stopped: true,
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();

    lifecycle(addr, root.path()).stop().await.unwrap();

    assert_eq!(
        daemon.requests(),
        vec![
            "POST /containers/narratoai/stop?t=10",
            "DELETE /containers/narratoai",
        ]
    );
}

#[tokio::test]
async fn logs_split_stdout_and_stderr() {
    let (daemon, addr) = serve(Daemon {
        exists: true,
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();

    let request = LogsRequest {
        follow: true,
        tail: Some(50),
        timestamps: false,
    };
    let mut out = Vec::<u8>::new();
    let mut err = Vec::<u8>::new();
    lifecycle(addr, root.path())
        .logs(&request, &mut out, &mut err)
        .await
        .unwrap();

    assert_eq!(
        String::from_utf8(out).unwrap(),
        "booting streamlit\nYou can now view your Streamlit app\n"
    );
    assert_eq!(String::from_utf8(err).unwrap(), "WARNING: no GPU found\n");

    let requests = daemon.requests();
    assert_eq!(requests.len(), 1);
    for pair in &[
        "follow=true",
        "stdout=true",
        "stderr=true",
        "timestamps=false",
        "tail=50",
    ] {
        assert!(requests[0].contains(pair), "{} missing from {}", pair, requests[0]);
    }
}

#[tokio::test]
async fn build_ships_rendered_recipe_and_survives_split_messages() {
    let (daemon, addr) = serve(Daemon::default()).await;
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("webui.py"), "import streamlit\n").unwrap();

    let mut out = Vec::<u8>::new();
    lifecycle(addr, root.path())
        .build(&BuildRequest { no_cache: true }, &mut out)
        .await
        .unwrap();

    assert_eq!(
        String::from_utf8(out).unwrap(),
        "Step 1/9 : FROM python:3.12-slim-bookworm AS builder\n\
         Successfully tagged narratoai:latest\n"
    );

    let requests = daemon.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("t=narratoai%3Alatest"), "{}", requests[0]);
    assert!(requests[0].contains("nocache=true"), "{}", requests[0]);

    let context = daemon.build_context.lock().unwrap().clone();
    let names: Vec<&str> = context.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"webui.py"), "{:?}", names);
    assert!(names.contains(&"docker-entrypoint.sh"), "{:?}", names);
    let dockerfile = context
        .iter()
        .find(|(name, _)| name == "Dockerfile")
        .map(|(_, contents)| String::from_utf8(contents.clone()).unwrap())
        .unwrap();
    assert!(dockerfile.starts_with("FROM python:3.12-slim-bookworm AS builder\n"));
    assert!(dockerfile.contains("EXPOSE 8501\n"));
}
