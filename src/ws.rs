//! Websocket transport for the remote quote service.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionError, Connector, QuoteTransport};
use crate::protocol::{decode_response, HistoryResponse, TicksHistoryRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsConnector {
    cfg: ConnectionConfig,
}

impl WsConnector {
    pub fn new(cfg: ConnectionConfig) -> Self {
        Self { cfg }
    }

    pub fn endpoint(&self) -> String {
        self.cfg.endpoint()
    }

    fn tls_connector(&self) -> Result<tokio_tungstenite::Connector, ConnectionError> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(self.cfg.accept_invalid_certs)
            .danger_accept_invalid_hostnames(self.cfg.accept_invalid_certs)
            .build()
            .map_err(|err| ConnectionError::Tls(err.to_string()))?;
        Ok(tokio_tungstenite::Connector::NativeTls(tls))
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self) -> Result<WsTransport, ConnectionError> {
        let url = self.endpoint();
        if self.cfg.accept_invalid_certs {
            warn!(
                component = "connection",
                event = "connection.tls.relaxed",
                endpoint = %url
            );
        }

        let connector = self.tls_connector()?;
        let connect = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            true,
            Some(connector),
        );
        let (stream, response) =
            match tokio::time::timeout(Duration::from_millis(self.cfg.connect_timeout_ms), connect)
                .await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(err)) => {
                    return Err(ConnectionError::Connect {
                        url,
                        message: err.to_string(),
                    })
                }
                Err(_) => {
                    return Err(ConnectionError::Timeout {
                        after_ms: self.cfg.connect_timeout_ms,
                    })
                }
            };

        debug!(
            component = "connection",
            event = "connection.handshake",
            endpoint = %url,
            status = %response.status()
        );

        Ok(WsTransport {
            stream,
            alive: true,
            next_req_id: 1,
        })
    }

    fn describe(&self) -> String {
        self.endpoint()
    }
}

pub struct WsTransport {
    stream: WsStream,
    alive: bool,
    next_req_id: u64,
}

impl WsTransport {
    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        self.alive = false;
        err
    }
}

#[async_trait]
impl QuoteTransport for WsTransport {
    async fn request(
        &mut self,
        request: &TicksHistoryRequest,
    ) -> Result<HistoryResponse, ConnectionError> {
        if !self.alive {
            return Err(ConnectionError::Closed);
        }

        let req_id = self.next_req_id;
        self.next_req_id += 1;
        let payload = request
            .clone()
            .with_req_id(req_id)
            .to_json()
            .map_err(|err| ConnectionError::Send(err.to_string()))?;

        if let Err(err) = self.stream.send(Message::Text(payload.into())).await {
            return Err(self.fail(ConnectionError::Send(err.to_string())));
        }

        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(self.fail(ConnectionError::Receive(err.to_string()))),
                None => return Err(self.fail(ConnectionError::Closed)),
            };

            let text = match message {
                Message::Text(text) => text.as_str().to_string(),
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                Message::Close(_) => return Err(self.fail(ConnectionError::Closed)),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            let frame = match decode_response(&text) {
                Ok(frame) => frame,
                Err(err) => return Err(self.fail(ConnectionError::Decode(err.to_string()))),
            };

            match frame.req_id {
                Some(id) if id != req_id => {
                    debug!(
                        component = "connection",
                        event = "connection.frame.skipped",
                        expected_req_id = req_id,
                        got_req_id = id
                    );
                    continue;
                }
                _ => return Ok(frame.response),
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn close(&mut self) {
        if self.alive {
            let _ = self.stream.close(None).await;
        }
        self.alive = false;
    }
}
