//! Websocket front door: upgrades connections, demultiplexes inbound
//! JSON-RPC requests onto the dispatch pipeline and writes responses
//! back in sink order.
//!
//! Responses to concurrently dispatched requests may interleave in any
//! order relative to the requests; clients re-associate by `id`.

use core::time::Duration;
use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context as _, Result as AnyResult};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use types::jsonrpc::{Error as JsonError, Request, Response};

use crate::{
    statistics::{CONNECTIONS_ACCEPTED, REQUESTS_RECEIVED, REQUESTS_REJECTED},
    App,
};

/// Per-connection bound on queued responses. A full queue slows the
/// reader, which slows inbound request acceptance.
const RESPONSE_QUEUE_CAPACITY: usize = 256;

/// Grace period for draining connections at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub async fn serve(app: Arc<App>, address: SocketAddr, cancel: CancellationToken) -> AnyResult<()> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("error binding {} for websocket server", address))?;
    serve_listener(app, listener, cancel).await
}

pub async fn serve_listener(
    app: Arc<App>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> AnyResult<()> {
    info!(
        "Listening on ws://{}",
        listener.local_addr().context("listener has no local addr")?
    );

    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("error accepting connection")?;
                CONNECTIONS_ACCEPTED.inc();
                let app = app.clone();
                let connection_cancel = cancel.child_token();
                tracker.spawn(async move {
                    if let Err(error) = handle_connection(app, stream, connection_cancel).await {
                        debug!(?error, %peer, "connection closed with error");
                    }
                });
            }
        }
    }

    // stop accepting and drain active connections
    tracker.close();
    if timeout(SHUTDOWN_DEADLINE, tracker.wait()).await.is_err() {
        warn!("shutdown deadline elapsed with connections still active");
    }
    Ok(())
}

async fn handle_connection(
    app: Arc<App>,
    stream: TcpStream,
    cancel: CancellationToken,
) -> AnyResult<()> {
    let websocket = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket upgrade failed")?;
    let (mut sink, mut source) = websocket.split();
    let (resp_tx, mut resp_rx) = mpsc::channel::<Response>(RESPONSE_QUEUE_CAPACITY);

    // writer: drains the response queue in FIFO order
    let writer = tokio::spawn(async move {
        while let Some(response) = resp_rx.recv().await {
            let json = match serde_json::to_string(&response) {
                Ok(json) => json,
                Err(error) => {
                    error!(?error, "failed to encode response");
                    continue;
                }
            };
            if let Err(error) = sink.send(Message::Text(json.into())).await {
                match error {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => return,
                    error => error!(?error, "failed to write json to websocket"),
                }
            }
        }
    });

    // reader: one frame is one request; each request runs as its own task
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = source.next() => {
                let message = match message {
                    None => break,
                    Some(Err(error)) => {
                        debug!(?error, "websocket read failed");
                        break;
                    }
                    Some(Ok(message)) => message,
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    // control frames are handled by the library
                    _ => continue,
                };
                match serde_json::from_str::<Request>(text.as_str()) {
                    Err(_) => {
                        REQUESTS_REJECTED.inc();
                        let response = Response::error(None, JsonError::parse_error());
                        if resp_tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    Ok(request) => {
                        REQUESTS_RECEIVED.inc();
                        let app = app.clone();
                        let resp_tx = resp_tx.clone();
                        let request_cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = request_cancel.cancelled() => {}
                                response = app.handle(request) => {
                                    let _ = resp_tx.send(response).await;
                                }
                            }
                        });
                    }
                }
            }
        }
    }

    // closing the queue drains the writer
    drop(resp_tx);
    writer.await.context("writer task panicked")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::{SinkExt as _, StreamExt as _};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_tungstenite::connect_async;

    use super::*;
    use crate::routing::{RouteError, RouteOpts, Router};
    use crate::{methods, tracking::HeadHandle};

    struct EmptyFleetRouter;

    #[async_trait]
    impl Router for EmptyFleetRouter {
        async fn route(&self, _req: Request, _opts: RouteOpts) -> Result<Response, RouteError> {
            Err(RouteError::NoClientsAvailable)
        }
    }

    async fn start_server() -> (String, CancellationToken) {
        let head = HeadHandle::default();
        let router: Arc<dyn Router> = Arc::new(EmptyFleetRouter);
        let registry = methods::build(1, &head, router).unwrap();
        let app = Arc::new(App::new(registry, Duration::from_secs(1)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve_listener(app, listener, cancel.clone()));
        (format!("ws://{}", address), cancel)
    }

    async fn roundtrip(url: &str, frame: &str) -> serde_json::Value {
        let (mut socket, _) = connect_async(url).await.unwrap();
        socket.send(Message::Text(frame.to_owned().into())).await.unwrap();
        let reply = socket.next().await.unwrap().unwrap();
        let text = match reply {
            Message::Text(text) => text.to_string(),
            other => panic!("unexpected frame: {:?}", other),
        };
        socket.close(None).await.ok();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn empty_fleet_answers_no_client_available() {
        let (url, cancel) = start_server().await;
        let reply = roundtrip(
            &url,
            r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}"#,
        )
        .await;
        assert_eq!(reply["error"]["code"], json!(-3200));
        assert_eq!(reply["id"], json!(1));
        cancel.cancel();
    }

    #[tokio::test]
    async fn unsupported_method_answers_method_not_found() {
        let (url, cancel) = start_server().await;
        let reply = roundtrip(
            &url,
            r#"{"jsonrpc":"2.0","id":7,"method":"eth_madeUpMethod","params":[]}"#,
        )
        .await;
        assert_eq!(reply["error"]["code"], json!(-32601));
        assert_eq!(reply["id"], json!(7));
        cancel.cancel();
    }

    #[tokio::test]
    async fn malformed_frames_answer_parse_error() {
        let (url, cancel) = start_server().await;
        let reply = roundtrip(&url, "{not json").await;
        assert_eq!(reply["error"]["code"], json!(-32700));
        cancel.cancel();
    }

    #[tokio::test]
    async fn static_methods_answer_without_a_fleet() {
        let (url, cancel) = start_server().await;
        let reply = roundtrip(
            &url,
            r#"{"jsonrpc":"2.0","id":2,"method":"net_listening","params":[]}"#,
        )
        .await;
        assert_eq!(reply["result"], json!(true));
        assert_eq!(reply["id"], json!(2));
        cancel.cancel();
    }
}
