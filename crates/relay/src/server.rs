//! Relay server - exposes a `MessageRelay` over WebSocket
//!
//! Each connection handles one request at a time. A client that goes away
//! while its call is blocked (a pull on an empty queue, a push into a full
//! one) cancels that call.

use crate::{MessageRelay, RelayRequest, RelayResponse, TransportError};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tokio_tungstenite::{accept_async, tungstenite::Message as Frame, WebSocketStream};
use trade_types::{CallContext, TradeId};

type FrameSink = SplitSink<WebSocketStream<TcpStream>, Frame>;
type FrameStream = SplitStream<WebSocketStream<TcpStream>>;

/// WebSocket front of a relay
pub struct RelayServer {
    relay: Arc<MessageRelay>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(relay: Arc<MessageRelay>) -> Self {
        Self { relay }
    }

    /// Bind `addr` and serve until `cx` is cancelled
    pub async fn run(self, addr: &str, cx: CallContext) -> Result<(), TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        self.serve(listener, cx).await
    }

    /// Serve connections from an already bound listener until `cx` is cancelled
    pub async fn serve(self, listener: TcpListener, cx: CallContext) -> Result<(), TransportError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Relay server listening on {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                _ = cx.done() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("Relay client connected from {}", peer_addr);
                    let relay = self.relay.clone();
                    let cx = cx.child();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, relay, cx).await {
                            tracing::warn!("Relay connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }

        tracing::info!("Relay server stopped");
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    relay: Arc<MessageRelay>,
    cx: CallContext,
) -> Result<(), TransportError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    while let Some(frame) = ws_receiver.next().await {
        let data = match frame? {
            Frame::Binary(data) => data,
            Frame::Close(_) => break,
            _ => continue,
        };

        let request = match RelayRequest::from_bytes(&data) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed request from {}: {}", peer_addr, e);
                send(&mut ws_sender, &RelayResponse::Error { message: e.to_string() }).await?;
                continue;
            }
        };

        if let RelayRequest::Watch { trade_id } = request {
            return stream_counter(&relay, trade_id, ws_sender, ws_receiver).await;
        }

        let op = request.op();
        let call = cx.child();
        let response = tokio::select! {
            response = dispatch(&relay, &call, request) => response,
            _ = client_gone(&mut ws_receiver) => {
                call.cancel();
                tracing::debug!(op, "Client {} left during call", peer_addr);
                return Ok(());
            }
        };
        send(&mut ws_sender, &response).await?;
    }

    tracing::debug!("Relay client {} disconnected", peer_addr);
    Ok(())
}

async fn dispatch(relay: &MessageRelay, cx: &CallContext, request: RelayRequest) -> RelayResponse {
    let result = match request {
        RelayRequest::Push { message } => relay
            .push(cx, message)
            .await
            .map(|counter| RelayResponse::Pushed { counter }),
        RelayRequest::Pull { trade_id } => relay.pull(cx, trade_id).await.map(RelayResponse::Message),
        RelayRequest::Counter { trade_id } => Ok(RelayResponse::Counter {
            trade_id,
            value: relay.find_counter(trade_id),
        }),
        RelayRequest::Watch { trade_id } => Ok(RelayResponse::Counter {
            trade_id,
            value: relay.find_counter(trade_id),
        }),
    };
    result.unwrap_or_else(|e| RelayResponse::Error { message: e.to_string() })
}

/// Resolves once the client closes the connection or it breaks
async fn client_gone(ws_receiver: &mut FrameStream) {
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Frame::Close(_)) | Err(_) => return,
            Ok(_) => tracing::debug!("Ignoring frame received during a pending call"),
        }
    }
}

/// Send the current counter, then every update until either side closes
async fn stream_counter(
    relay: &MessageRelay,
    trade_id: TradeId,
    mut ws_sender: FrameSink,
    mut ws_receiver: FrameStream,
) -> Result<(), TransportError> {
    let mut updates = relay.watch(trade_id);
    let initial = relay.find_counter(trade_id);
    send(&mut ws_sender, &RelayResponse::CounterUpdate { trade_id, value: initial }).await?;

    loop {
        tokio::select! {
            _ = client_gone(&mut ws_receiver) => return Ok(()),
            update = updates.recv() => match update {
                Ok(value) if value > initial => {
                    send(&mut ws_sender, &RelayResponse::CounterUpdate { trade_id, value }).await?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let value = relay.find_counter(trade_id);
                    send(&mut ws_sender, &RelayResponse::CounterUpdate { trade_id, value }).await?;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = ws_sender.send(Frame::Close(None)).await;
                    return Ok(());
                }
            },
        }
    }
}

async fn send(ws_sender: &mut FrameSink, response: &RelayResponse) -> Result<(), TransportError> {
    ws_sender.send(Frame::Binary(response.to_bytes()?)).await?;
    Ok(())
}
