//! WebSocket front of the chat hub.
//!
//! The upgrade request carries the identity as query parameters
//! (`?roomId=..&userId=..&userName=..&token=..`); an upgrade without
//! `roomId` or `userId` is answered with 400. After the upgrade, each socket
//! gets a writer task fed by the hub and a read loop feeding the hub.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::hub::{ChatHub, Flow};
use crate::protocol::{ChatFrame, ConnectParams};

pub struct ChatServer {
    config: ChatConfig,
    hub: Arc<ChatHub>,
}

impl ChatServer {
    pub fn new(config: ChatConfig) -> Self {
        let hub = Arc::new(ChatHub::new(config.history_limit));
        Self { config, hub }
    }

    pub fn hub(&self) -> &Arc<ChatHub> {
        &self.hub
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ChatError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Chat server listening on {}", self.config.bind_addr);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener. On shutdown, stop accepting,
    /// send Close to every socket and give them a moment to flush.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ChatError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let hub = self.hub.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(hub, stream, addr).await {
                                log::warn!("Chat connection from {addr} ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => log::error!("Accept failed: {e}"),
                },
            }
        }

        drop(listener);
        let closed = self.hub.close_all();
        log::info!("Chat server shutting down, closed {closed} sockets");
        tokio::time::sleep(self.config.shutdown_grace()).await;
        Ok(())
    }
}

fn reject(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

async fn handle_connection(hub: Arc<ChatHub>, stream: TcpStream, addr: SocketAddr) -> Result<(), ChatError> {
    // The handshake callback is synchronous; it parks the parsed params here.
    let params_holder: Arc<Mutex<Option<ConnectParams>>> = Arc::new(Mutex::new(None));
    let params_holder_c = params_holder.clone();

    let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        match ConnectParams::from_query(req.uri().query()) {
            Ok(params) => {
                *params_holder_c.lock().unwrap_or_else(PoisonError::into_inner) = Some(params);
                Ok(resp)
            }
            Err(e) => {
                log::warn!("Rejecting chat upgrade from {addr}: {e}");
                Err(reject(e.to_string()))
            }
        }
    })
    .await?;

    let Some(params) = params_holder
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    else {
        return Ok(());
    };

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let id = hub.connect(params, tx);
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match ChatFrame::decode(&text) {
                Ok(frame) => {
                    if hub.handle_frame(id, frame) == Flow::Close {
                        break;
                    }
                }
                Err(e) => log::warn!("Dropping malformed chat frame from {addr}: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("Socket {id} from {addr} failed: {e}");
                break;
            }
        }
    }

    hub.disconnect(id);
    let _ = writer.await;
    Ok(())
}
