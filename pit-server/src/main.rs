//! Pit Server
//!
//! Hosts pit repositories over HTTP. The server is passive: it answers the
//! six sync requests (create, head, has, fetch, objects, advance) and keeps
//! no session state between them. Object payloads travel as compressed
//! binary frames; everything else is JSON.

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use pit_core::sync::SyncError;
use pit_core::{wire, ObjectId, RepoHub};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Maximum accepted request body.
const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "pit-server")]
#[command(version = "0.1.0")]
#[command(about = "Repository hosting server for pit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:8080)
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        addr: String,

        /// Directory holding hosted repositories
        #[arg(short, long, default_value = "./data/repos")]
        data_dir: String,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { addr, data_dir, debug } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            info!("Starting pit server on {}", addr);
            info!("Data directory: {}", data_dir);

            let hub = RepoHub::open(std::path::Path::new(&data_dir))?;

            let addr: SocketAddr = addr.parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!("Server listening on {}", addr);

            loop {
                let (stream, _) = listener.accept().await?;
                let hub = hub.clone();
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |req| handle_request(req, hub.clone())),
                        )
                        .await
                    {
                        error!("Error serving connection: {:?}", e);
                    }
                });
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    hub: RepoHub,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    let body = match read_body(req.into_body(), MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(resp) => return Ok(resp),
    };

    Ok(route(&method, &path, &body, &hub).await)
}

/// Collect a request body, aborting as soon as it exceeds `limit` rather
/// than buffering the whole thing first.
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, Response<Full<Bytes>>>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(json_error(413, "Request body too large"))
        }
        Err(e) => Err(json_error(400, &format!("Failed to read body: {}", e))),
    }
}

async fn route(method: &str, path: &str, body: &[u8], hub: &RepoHub) -> Response<Full<Bytes>> {
    if method == "POST" && path == "/repos/create" {
        return handle_create(hub, body).await;
    }
    if method == "GET" && path == "/repos" {
        return handle_list(hub).await;
    }

    // Remaining routes are /repos/{name}/<op>.
    if let Some(rest) = path.strip_prefix("/repos/") {
        if let Some((name, op)) = rest.split_once('/') {
            match (method, op) {
                ("GET", "head") => return handle_head(hub, name).await,
                ("POST", "has") => return handle_has(hub, name, body).await,
                ("POST", "fetch") => return handle_fetch(hub, name, body).await,
                ("POST", "objects") => return handle_objects(hub, name, body).await,
                ("POST", "head/advance") => return handle_advance(hub, name, body).await,
                _ => {}
            }
        }
    }

    json_error(404, &format!("Unknown endpoint: {} {}", method, path))
}

#[derive(serde::Deserialize)]
struct CreateRequest {
    name: String,
}

#[derive(serde::Serialize)]
struct CreateResponse {
    id: String,
    name: String,
}

async fn handle_create(hub: &RepoHub, body: &[u8]) -> Response<Full<Bytes>> {
    let req: CreateRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => return json_error(400, &format!("Invalid JSON body: {}", e)),
    };
    match hub.create(&req.name).await {
        Ok(id) => json_with_status(201, &CreateResponse { id, name: req.name }),
        Err(e) => sync_error(e),
    }
}

#[derive(serde::Serialize)]
struct ListResponse {
    repos: Vec<String>,
}

async fn handle_list(hub: &RepoHub) -> Response<Full<Bytes>> {
    json_ok(&ListResponse { repos: hub.list().await })
}

#[derive(serde::Serialize)]
struct HeadResponse {
    head: Option<String>,
}

async fn handle_head(hub: &RepoHub, name: &str) -> Response<Full<Bytes>> {
    match hub.get(name).await {
        Ok(repo) => {
            let head = repo.head().await.map(|id| id.to_hex());
            json_ok(&HeadResponse { head })
        }
        Err(e) => sync_error(e),
    }
}

#[derive(serde::Deserialize)]
struct IdsRequest {
    ids: Vec<String>,
}

fn parse_ids(raw: &[String]) -> Result<Vec<ObjectId>, String> {
    raw.iter()
        .map(|hex| ObjectId::from_hex(hex).map_err(|_| format!("Invalid object id: {}", hex)))
        .collect()
}

#[derive(serde::Serialize)]
struct HasResponse {
    present: Vec<String>,
}

async fn handle_has(hub: &RepoHub, name: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let req: IdsRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => return json_error(400, &format!("Invalid JSON body: {}", e)),
    };
    let ids = match parse_ids(&req.ids) {
        Ok(ids) => ids,
        Err(msg) => return json_error(400, &msg),
    };

    let repo = match hub.get(name).await {
        Ok(repo) => repo,
        Err(e) => return sync_error(e),
    };
    let mut present = Vec::new();
    for id in ids {
        match repo.store().has(id).await {
            Ok(true) => present.push(id.to_hex()),
            Ok(false) => {}
            Err(e) => return json_error(500, &format!("Storage error: {}", e)),
        }
    }
    json_ok(&HasResponse { present })
}

async fn handle_fetch(hub: &RepoHub, name: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let req: IdsRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => return json_error(400, &format!("Invalid JSON body: {}", e)),
    };
    let ids = match parse_ids(&req.ids) {
        Ok(ids) => ids,
        Err(msg) => return json_error(400, &msg),
    };

    let repo = match hub.get(name).await {
        Ok(repo) => repo,
        Err(e) => return sync_error(e),
    };

    let mut objects = Vec::with_capacity(ids.len());
    for id in ids {
        match repo.store().get(id).await {
            Ok(data) => objects.push((id, Some(data))),
            Err(pit_core::StoreError::NotFound(_)) => objects.push((id, None)),
            Err(e) => return json_error(500, &format!("Storage error: {}", e)),
        }
    }

    match wire::seal_objects(&objects) {
        Ok(frame) => binary_ok(frame, objects.len()),
        Err(e) => json_error(500, &format!("Failed to encode objects: {}", e)),
    }
}

#[derive(serde::Serialize)]
struct StoredResponse {
    stored: usize,
}

async fn handle_objects(hub: &RepoHub, name: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let decoded = match wire::open_objects(body) {
        Ok(objects) => objects,
        Err(e) => return json_error(400, &format!("Invalid object frame: {}", e)),
    };
    let mut objects = Vec::with_capacity(decoded.len());
    for (id, data) in decoded {
        match data {
            Some(bytes) => objects.push((id, bytes)),
            None => return json_error(400, &format!("Upload frame marks {} absent", id)),
        }
    }
    let count = objects.len();

    let repo = match hub.get(name).await {
        Ok(repo) => repo,
        Err(e) => return sync_error(e),
    };
    match repo.receive_objects(objects).await {
        Ok(()) => json_ok(&StoredResponse { stored: count }),
        Err(e) => sync_error(e),
    }
}

#[derive(serde::Deserialize)]
struct AdvanceRequest {
    expected: Option<String>,
    new_head: String,
}

#[derive(serde::Serialize)]
struct AdvanceResponse {
    head: String,
}

async fn handle_advance(hub: &RepoHub, name: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let req: AdvanceRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => return json_error(400, &format!("Invalid JSON body: {}", e)),
    };
    let new_head = match ObjectId::from_hex(&req.new_head) {
        Ok(id) => id,
        Err(_) => return json_error(400, &format!("Invalid object id: {}", req.new_head)),
    };
    let expected = match req.expected.as_deref() {
        Some(hex) => match ObjectId::from_hex(hex) {
            Ok(id) => Some(id),
            Err(_) => return json_error(400, &format!("Invalid object id: {}", hex)),
        },
        None => None,
    };

    let repo = match hub.get(name).await {
        Ok(repo) => repo,
        Err(e) => return sync_error(e),
    };
    match repo.advance_head(expected, new_head).await {
        Ok(()) => json_ok(&AdvanceResponse { head: new_head.to_hex() }),
        Err(e) => sync_error(e),
    }
}

fn sync_error(err: SyncError) -> Response<Full<Bytes>> {
    let status = match &err {
        SyncError::AlreadyExists(_) => 409,
        SyncError::NotFound(_) => 404,
        SyncError::NonFastForward => 409,
        SyncError::Conflict | SyncError::Corrupt(_) => 422,
        SyncError::Transport(_) => 400,
        _ => 500,
    };
    json_error(status, &err.to_string())
}

fn json_error(status: u16, message: &str) -> Response<Full<Bytes>> {
    json_with_status(status, &serde_json::json!({ "error": message }))
}

fn json_with_status<T: serde::Serialize>(status: u16, data: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(data).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn json_ok<T: serde::Serialize>(data: &T) -> Response<Full<Bytes>> {
    json_with_status(200, data)
}

fn binary_ok(frame: Vec<u8>, count: usize) -> Response<Full<Bytes>> {
    Response::builder()
        .status(200)
        .header("Content-Type", "application/octet-stream")
        .header("X-Object-Count", count.to_string())
        .body(Full::new(Bytes::from(frame)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn hub_with_repo(name: &str) -> RepoHub {
        let hub = RepoHub::in_memory();
        hub.create(name).await.unwrap();
        hub
    }

    #[tokio::test]
    async fn test_create_route() {
        let hub = RepoHub::in_memory();
        let resp = route("POST", "/repos/create", br#"{"name":"docs"}"#, &hub).await;
        assert_eq!(resp.status(), 201);

        let resp = route("POST", "/repos/create", br#"{"name":"docs"}"#, &hub).await;
        assert_eq!(resp.status(), 409);
    }

    #[tokio::test]
    async fn test_head_of_empty_repo() {
        let hub = hub_with_repo("docs").await;
        let resp = route("GET", "/repos/docs/head", b"", &hub).await;
        assert_eq!(resp.status(), 200);

        let resp = route("GET", "/repos/missing/head", b"", &hub).await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let body = Full::new(Bytes::from(vec![0u8; 64]));
        let resp = read_body(body, 16).await.unwrap_err();
        assert_eq!(resp.status(), 413);

        let body = Full::new(Bytes::from_static(b"ok"));
        assert_eq!(read_body(body, 16).await.unwrap(), Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let hub = RepoHub::in_memory();
        let resp = route("GET", "/nope", b"", &hub).await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_upload_and_fetch_roundtrip() {
        let hub = hub_with_repo("docs").await;
        let blob = pit_core::Blob::new(b"payload".to_vec());
        let id = blob.id();
        let frame =
            wire::seal_objects(&[(id, Some(Bytes::from(blob.into_data())))]).unwrap();

        let resp = route("POST", "/repos/docs/objects", &frame, &hub).await;
        assert_eq!(resp.status(), 200);

        let body = format!(r#"{{"ids":["{}"]}}"#, id.to_hex());
        let resp = route("POST", "/repos/docs/fetch", body.as_bytes(), &hub).await;
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_digest() {
        let hub = hub_with_repo("docs").await;
        let wrong = ObjectId::from_data(b"something else");
        let frame = wire::seal_objects(&[(wrong, Some(Bytes::from_static(b"payload")))]).unwrap();

        let resp = route("POST", "/repos/docs/objects", &frame, &hub).await;
        assert_eq!(resp.status(), 422);
    }

    #[tokio::test]
    async fn test_advance_requires_uploaded_closure() {
        let hub = hub_with_repo("docs").await;
        let ghost = ObjectId::from_data(b"never uploaded");
        let body = format!(r#"{{"expected":null,"new_head":"{}"}}"#, ghost.to_hex());

        let resp = route("POST", "/repos/docs/head/advance", body.as_bytes(), &hub).await;
        assert_eq!(resp.status(), 422);
    }
}
