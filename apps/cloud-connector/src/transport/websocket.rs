//! Production transport: bincode-framed bridge messages over a WebSocket,
//! with enrollment as a unary HTTPS call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_proto::{C2vBridgeMessage, RegisterDeploymentRequest, RegisterDeploymentResponse, V2cBridgeMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;
use url::Url;

use super::{BridgeConn, TransportError, VzConnClient};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ENROLLMENT_PATH: &str = "v1/vizier/deployments";
const DEPLOY_KEY_HEADER: &str = "X-API-KEY";

pub struct WebSocketVzConn {
    stream_url: Url,
    api_url: Url,
    http: reqwest::Client,
}

impl WebSocketVzConn {
    pub fn new(stream_url: Url, api_url: Url) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Self {
            stream_url,
            api_url,
            http,
        })
    }
}

#[async_trait]
impl VzConnClient for WebSocketVzConn {
    async fn connect(&self) -> Result<Arc<dyn BridgeConn>, TransportError> {
        trace!(url = %self.stream_url, "opening bridge stream");
        let (ws, _) = connect_async(self.stream_url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Arc::new(WsConn::new(ws)) as Arc<dyn BridgeConn>)
    }

    async fn register_deployment(
        &self,
        request: &RegisterDeploymentRequest,
        deploy_key: &str,
    ) -> Result<RegisterDeploymentResponse, TransportError> {
        let endpoint = self
            .api_url
            .join(ENROLLMENT_PATH)
            .map_err(|err| TransportError::Enrollment(err.to_string()))?;
        let response = self
            .http
            .post(endpoint)
            .header(DEPLOY_KEY_HEADER, deploy_key)
            .json(request)
            .send()
            .await
            .map_err(|err| TransportError::Enrollment(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Enrollment(format!(
                "unexpected http status {}",
                response.status()
            )));
        }
        response
            .json::<RegisterDeploymentResponse>()
            .await
            .map_err(|err| TransportError::Enrollment(err.to_string()))
    }
}

struct WsConn {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    done_tx: watch::Sender<bool>,
}

impl WsConn {
    fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        let (done_tx, _) = watch::channel(false);
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            done_tx,
        }
    }

    fn mark_done(&self) {
        let _ = self.done_tx.send(true);
    }
}

#[async_trait]
impl BridgeConn for WsConn {
    async fn send(&self, msg: V2cBridgeMessage) -> Result<(), TransportError> {
        let bytes =
            bincode::serialize(&msg).map_err(|err| TransportError::Send(err.to_string()))?;
        let mut sink = self.sink.lock().await;
        match sink.send(Message::Binary(bytes)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.mark_done();
                Err(TransportError::Send(err.to_string()))
            }
        }
    }

    async fn recv(&self) -> Result<Option<C2vBridgeMessage>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                None => {
                    self.mark_done();
                    return Ok(None);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return bincode::deserialize(&bytes)
                        .map(Some)
                        .map_err(|err| TransportError::Recv(err.to_string()));
                }
                Some(Ok(Message::Close(_))) => {
                    self.mark_done();
                    return Ok(None);
                }
                // Pings, pongs and text frames are not part of the bridge
                // protocol.
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    self.mark_done();
                    return Err(TransportError::Recv(err.to_string()));
                }
            }
        }
    }

    async fn close_send(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }
}
