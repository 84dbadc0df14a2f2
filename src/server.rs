// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

//! The WebSocket endpoint of a running agent.
//!
//! Browser-hosted SSH clients connect to [`AGENT_PATH`] and exchange agent
//! protocol frames, one per text message. The command line client connects to
//! [`api::MANAGE_PATH`] to manage keys.
//!
//! Browsers attach an `Origin` header to every WebSocket handshake, and any
//! page the user visits can open a connection to a local port. A handshake
//! that carries an origin is accepted only when the origin is in the allow
//! list. A handshake without one cannot come from a browser page, so it is
//! accepted on the management endpoint and nowhere else.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, StatusCode},
        Message,
    },
    WebSocketStream,
};
use url::Url;

use crate::{
    agent,
    agentport::{AgentPort, AgentStream, Channel, Frame, Registry},
    api,
    error::{self, Result},
    keys::{Keyring, Manager},
    message,
};

pub(crate) const AGENT_PATH: &str = "/agent";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Agent,
    Manage,
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            AGENT_PATH => Some(Self::Agent),
            api::MANAGE_PATH => Some(Self::Manage),
            _ => None,
        }
    }
}

/// Decides whether a handshake for `path` from `origin` may proceed.
fn authorize(path: &str, origin: Option<&str>, allowed: &[String]) -> Result<Route, StatusCode> {
    let route = Route::from_path(path).ok_or(StatusCode::NOT_FOUND)?;
    match origin {
        Some(origin) if allowed.iter().any(|candidate| candidate == origin) => Ok(route),
        None if route == Route::Manage => Ok(route),
        _ => Err(StatusCode::FORBIDDEN),
    }
}

/// Posts frames to a WebSocket through the connection's writer task.
struct WebSocketChannel {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn post_message(&self, frame: Frame) -> Result<()> {
        let text = serde_json::to_string(&frame)?;
        self.tx
            .send(Message::Text(text))
            .await
            .map_err(error::Internal::from)?;
        Ok(())
    }

    async fn disconnect(&self) {
        _ = self.tx.send(Message::Close(None)).await;
    }
}

struct State {
    manager: Arc<Manager>,
    origins: Vec<String>,
    streams: mpsc::Sender<AgentStream>,
    ports: Mutex<Registry<WebSocketChannel>>,
}

/// Listens on the host and port of `url` until the listener or the agent
/// fails. Browser pages may connect only from `origins`.
pub(crate) async fn serve(
    url: &Url,
    origins: Vec<String>,
    manager: Arc<Manager>,
    keyring: Arc<Keyring>,
) -> Result<()> {
    let addrs = url.socket_addrs(|| None)?;
    let listener = TcpListener::bind(&*addrs).await?;
    info!("Listening on {}", listener.local_addr()?);
    if origins.is_empty() {
        warn!("No allowed origins are configured; browser clients will be refused");
    }

    run(listener, origins, manager, keyring).await
}

async fn run(
    listener: TcpListener,
    origins: Vec<String>,
    manager: Arc<Manager>,
    keyring: Arc<Keyring>,
) -> Result<()> {
    let (streams, mut agent) = agent::spawn(keyring);
    let state = Arc::new(State {
        manager,
        origins,
        streams,
        ports: Mutex::new(Registry::new()),
    });

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            joined = &mut agent => {
                joined?;
                return Err(error::Internal::ChannelClosed.into());
            }
        };

        let state = Arc::clone(&state);
        _ = tokio::spawn(async move {
            if let Err(e) = accept(stream, peer, state).await {
                warn!("Connection from {} failed: {}", peer, e);
            }
        });
    }
}

async fn accept(stream: TcpStream, peer: SocketAddr, state: Arc<State>) -> Result<()> {
    let mut route = None;
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        let path = req.uri().path();
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .map(|value| value.to_str().unwrap_or_default());
        match authorize(path, origin, &state.origins) {
            Ok(allowed) => {
                route = Some(allowed);
                Ok(resp)
            }
            Err(status) => {
                warn!(
                    "Refused connection from {} to {} (origin {:?}): {}",
                    peer, path, origin, status
                );
                let mut err = ErrorResponse::new(Some(format!("{} {}", status, path)));
                *err.status_mut() = status;
                Err(err)
            }
        }
    })
    .await?;

    match route {
        Some(Route::Agent) => {
            info!("Agent connection from {}", peer);
            serve_agent(ws, &state).await
        }
        Some(Route::Manage) => {
            debug!("Management connection from {}", peer);
            serve_manage(ws, &state.manager).await
        }
        None => Ok(()),
    }
}

async fn serve_agent(ws: WebSocketStream<TcpStream>, state: &State) -> Result<()> {
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::channel(16);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = sink.send(msg).await {
                debug!("Stopped writing to agent connection: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let channel = Arc::new(WebSocketChannel { tx });
    let (port, stream) = AgentPort::new(Arc::clone(&channel) as Arc<dyn Channel>);
    {
        let mut ports = state.ports.lock().await;
        ports.add(Arc::clone(&channel), Arc::new(port));
        debug!("{} agent connections open", ports.len());
    }

    let result = async {
        state
            .streams
            .send(stream)
            .await
            .map_err(error::Internal::from)?;

        while let Some(msg) = source.next().await {
            // LINT: Control frames are answered by tungstenite itself.
            #[allow(clippy::wildcard_enum_match_arm)]
            match msg? {
                Message::Text(text) => {
                    let port = state.ports.lock().await.lookup(&channel);
                    match port {
                        Some(port) => port.on_message(&text).await?,
                        None => break,
                    }
                }
                Message::Binary(_) => {
                    return Err(error::Protocol::Decode(
                        "binary messages are not supported".to_owned(),
                    )
                    .into())
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
    .await;

    let port = state.ports.lock().await.delete(&channel);
    if let Some(port) = port {
        port.disconnect();
        port.closed().await?;
    }
    channel.disconnect().await;
    writer.await?;

    result
}

async fn serve_manage(ws: WebSocketStream<TcpStream>, manager: &Manager) -> Result<()> {
    let mut stream: message::WebSocketStream<_, api::Request, api::Response> = ws.into();

    while let Some(req) = stream.next().await {
        let resp = match req {
            Ok(req) => api::dispatch(manager, req).await,
            Err(e @ error::Error::Json(_)) => e.into(),
            Err(e) => return Err(e),
        };
        stream.send(resp).await?;
    }

    _ = stream.close().await;
    Ok(())
}
