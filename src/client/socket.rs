//! Socket 传输：HTTP 回填（reqwest）+ WebSocket 实时流（tokio-tungstenite）

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::transport::{LiveStream, Transport};
use crate::error::{Error, Result};
use crate::protocol::StreamMessage;
use crate::types::Event;

/// HTTP 请求超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 默认实时流空闲超时（服务端心跳 30 秒）
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Socket 传输
pub struct SocketTransport {
    base: Url,
    http: reqwest::Client,
    idle_timeout: Duration,
}

impl SocketTransport {
    /// `server_url` 形如 `http://127.0.0.1:4000`
    pub fn new(server_url: &str) -> Result<Self> {
        let base = Url::parse(server_url)
            .map_err(|e| Error::Config(format!("invalid server url {}: {}", server_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("invalid server url: {}", server_url)));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self {
            base,
            http,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// 实时流在该时间内收不到任何帧即结束，交给重连循环
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn stream_url(&self) -> anyhow::Result<Url> {
        let mut url = self.endpoint(&["stream"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch {} to {}", url, scheme))?;
        Ok(url)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn backfill(&self, limit: usize) -> anyhow::Result<Vec<Event>> {
        let url = self.endpoint(&["events", "recent"])?;
        let events = self
            .http
            .get(url)
            .query(&[("limit", limit)])
            .send()
            .await
            .context("backfill request failed")?
            .error_for_status()?
            .json::<Vec<Event>>()
            .await
            .context("invalid backfill response")?;
        Ok(events)
    }

    async fn subscribe(&self) -> anyhow::Result<Box<dyn LiveStream>> {
        let url = self.stream_url()?;
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect {}", url))?;
        tracing::debug!("🔗 Stream connected: {}", url);
        Ok(Box::new(SocketStream {
            ws,
            idle_timeout: self.idle_timeout,
        }))
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let url = self.endpoint(&["events", "clear"])?;
        self.http
            .post(url)
            .send()
            .await
            .context("clear request failed")?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        let url = self.endpoint(&["sessions", session_id])?;
        self.http
            .delete(url)
            .send()
            .await
            .context("delete request failed")?
            .error_for_status()?;
        Ok(())
    }
}

/// WebSocket 实时流
struct SocketStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    idle_timeout: Duration,
}

#[async_trait]
impl LiveStream for SocketStream {
    async fn next(&mut self) -> Option<StreamMessage> {
        loop {
            let frame = match tokio::time::timeout(self.idle_timeout, self.ws.next()).await {
                Ok(frame) => frame?,
                Err(_) => {
                    tracing::warn!("⚠️ No frame for {:?}, dropping stream", self.idle_timeout);
                    return None;
                }
            };
            match frame {
                Ok(Message::Text(text)) => match StreamMessage::from_frame(text.as_str()) {
                    Ok(StreamMessage::Ping) => {
                        // 应答服务端心跳
                        if let Ok(frame) = StreamMessage::Pong.to_frame() {
                            if self.ws.send(Message::Text(frame.into())).await.is_err() {
                                return None;
                            }
                        }
                        return Some(StreamMessage::Ping);
                    }
                    Ok(message) => return Some(message),
                    Err(e) => tracing::warn!("⚠️ Unparsable stream frame: {}", e),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Stream read failed: {}", e);
                    return None;
                }
            }
        }
    }
}
