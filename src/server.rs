use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::transport::{Bus, Hello};

#[derive(Clone)]
pub(crate) struct ServerState {
    public_dir: Arc<PathBuf>,
    bus: Arc<Bus>,
}

pub(crate) fn router(public_dir: PathBuf, bus: Arc<Bus>) -> Router {
    let state = ServerState {
        public_dir: Arc::new(public_dir),
        bus,
    };
    Router::new()
        .route("/bus", get(bus_handler))
        .route("/", get(static_handler))
        .route("/{*path}", get(static_handler))
        .with_state(state)
}

pub(crate) async fn run(listen: SocketAddr, public_dir: PathBuf) -> Result<()> {
    let app = router(public_dir, Bus::new());
    let listener = TcpListener::bind(listen).await?;
    info!("Server running at http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn static_handler(State(state): State<ServerState>, uri: Uri) -> Response {
    let Some(path) = resolve(&state.public_dir, uri.path()) else {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(content) => ([(header::CONTENT_TYPE, content_type(&path))], content).into_response(),
        Err(err) => {
            debug!("static read {} failed: {err}", path.display());
            (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                "Not found",
            )
                .into_response()
        }
    }
}

/// Resolves a request path against the public root. Anything that would
/// step outside the root is refused outright.
fn resolve(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let rel = uri_path.trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };
    let mut path = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(segment) => path.push(segment),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn bus_handler(State(state): State<ServerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| relay(socket, state.bus))
}

/// Bridges one subscriber socket onto the in-process bus: the first frame
/// names the channel, everything after is forwarded verbatim to the other
/// subscribers of that channel.
async fn relay(mut socket: WebSocket, bus: Arc<Bus>) {
    let hello = match socket.recv().await {
        Some(Ok(frame)) => frame,
        _ => return,
    };
    let hello: Hello = match serde_json::from_slice(&hello.into_data()) {
        Ok(hello) => hello,
        Err(err) => {
            warn!("relay subscriber sent a bad hello: {err}");
            return;
        }
    };
    let (tx, mut rx) = bus.subscribe(&hello.channel).await;
    debug!(
        "relay subscriber joined {} ({} attached)",
        hello.channel,
        bus.subscribers(&hello.channel).await
    );

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Binary(frame))) => tx.send(frame),
                Some(Ok(Message::Text(frame))) => tx.send(Bytes::from(frame.to_string())),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("relay socket error: {err}");
                    break;
                }
            },
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    if socket.send(Message::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
    debug!("relay subscriber left {}", hello.channel);
}
