//! WebSocket transport to remote relays

use crate::{
    transport::WATCH_BUFFER, RelayConnection, RelayRequest, RelayResponse, Transport,
    TransportError,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as Frame, MaybeTlsStream, WebSocketStream,
};
use trade_types::{CallContext, Message, TradeId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport speaking the relay protocol over WebSocket
///
/// Endpoints are `host:port`; a full `ws://` or `wss://` URL is used as is.
#[derive(Clone, Debug, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

fn endpoint_url(endpoint: &str) -> String {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else {
        format!("ws://{}", endpoint)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        cx: &CallContext,
        endpoint: &str,
    ) -> Result<Box<dyn RelayConnection>, TransportError> {
        let url = endpoint_url(endpoint);
        let (stream, _) = cx
            .run(connect_async(url.as_str()))
            .await?
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Connected to relay at {}", url);
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WsStream,
}

impl WsConnection {
    /// Send one request and wait for its response
    async fn call(&mut self, cx: &CallContext, request: RelayRequest) -> Result<RelayResponse, TransportError> {
        cx.check()?;
        self.stream.send(Frame::Binary(request.to_bytes()?)).await?;

        match cx.run(next_response(&mut self.stream)).await {
            Ok(response) => match response? {
                RelayResponse::Error { message } => Err(TransportError::Remote(message)),
                response => Ok(response),
            },
            Err(canceled) => {
                // Closing tells the relay to abandon the call
                let _ = self.stream.close(None).await;
                Err(canceled.into())
            }
        }
    }
}

async fn next_response(stream: &mut WsStream) -> Result<RelayResponse, TransportError> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Frame::Binary(data) => return Ok(RelayResponse::from_bytes(&data)?),
            Frame::Close(_) => break,
            _ => continue,
        }
    }
    Err(TransportError::ConnectionClosed)
}

#[async_trait]
impl RelayConnection for WsConnection {
    async fn push(&mut self, cx: &CallContext, message: Message) -> Result<u64, TransportError> {
        match self.call(cx, RelayRequest::Push { message }).await? {
            RelayResponse::Pushed { counter } => Ok(counter),
            _ => Err(TransportError::UnexpectedResponse("push")),
        }
    }

    async fn pull(&mut self, cx: &CallContext, trade_id: TradeId) -> Result<Message, TransportError> {
        match self.call(cx, RelayRequest::Pull { trade_id }).await? {
            RelayResponse::Message(message) => Ok(message),
            _ => Err(TransportError::UnexpectedResponse("pull")),
        }
    }

    async fn counter(&mut self, cx: &CallContext, trade_id: TradeId) -> Result<u64, TransportError> {
        match self.call(cx, RelayRequest::Counter { trade_id }).await? {
            RelayResponse::Counter { value, .. } => Ok(value),
            _ => Err(TransportError::UnexpectedResponse("counter")),
        }
    }

    async fn watch(mut self: Box<Self>, trade_id: TradeId) -> Result<mpsc::Receiver<u64>, TransportError> {
        let request = RelayRequest::Watch { trade_id };
        self.stream.send(Frame::Binary(request.to_bytes()?)).await?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut stream = self.stream;
        tokio::spawn(async move {
            loop {
                let response = tokio::select! {
                    _ = tx.closed() => break,
                    response = next_response(&mut stream) => response,
                };
                match response {
                    Ok(RelayResponse::CounterUpdate { value, .. }) => {
                        if tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Ok(other) => {
                        tracing::warn!(trade_id = %trade_id, "Unexpected watch frame: {:?}", other);
                    }
                    Err(e) => {
                        tracing::debug!(trade_id = %trade_id, "Counter watch ended: {}", e);
                        break;
                    }
                }
            }
            let _ = stream.close(None).await;
        });

        Ok(rx)
    }
}
