//! Framed RPC over a duplex byte stream.
//!
//! One JSON document per line in both directions:
//!
//! ```text
//! → {"seq":1,"method":"ctl.status","params":{}}
//! ← {"type":"response","seq":1,"ok":true,"data":{...}}
//! ← {"type":"notify","method":"session.logged_in","params":{...}}
//! ```
//!
//! A request names its protocol and method as `<protocol>.<method>`. Requests
//! are dispatched concurrently; every outbound frame goes through a single
//! writer task so frames never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Frames queued for a connection before senders start waiting.
pub const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection closed by peer")]
    Eof,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("unknown method '{method}' in protocol '{protocol}'")]
    UnknownMethod { protocol: String, method: String },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("protocol '{0}' is already registered")]
    DuplicateProtocol(String),

    #[error("outbound channel closed")]
    Closed,

    #[error("{0}")]
    Handler(String),
}

impl RpcError {
    pub fn is_eof(&self) -> bool {
        matches!(self, RpcError::Eof)
    }
}

/// Inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub seq: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Outbound frame: a reply to a request, or an unsolicited notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Response {
        seq: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Notify {
        method: String,
        #[serde(default)]
        params: Value,
    },
}

impl Frame {
    pub fn ok(seq: u64, data: Value) -> Self {
        Frame::Response {
            seq,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(seq: u64, message: impl Into<String>) -> Self {
        Frame::Response {
            seq,
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn notify(method: impl Into<String>, params: Value) -> Self {
        Frame::Notify {
            method: method.into(),
            params,
        }
    }
}

/// Cloneable sender half of a connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Frame>,
}

impl Outbound {
    pub async fn send(&self, frame: Frame) -> Result<(), RpcError> {
        self.tx.send(frame).await.map_err(|_| RpcError::Closed)
    }

    /// Queue a notification without waiting. A full queue drops the frame.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        match self.tx.try_send(Frame::notify(method, params)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(method, "outbound queue full; dropping notification");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RpcError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A byte stream split into a line reader and a writer task.
pub struct Transport {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    outbound: Outbound,
}

impl Transport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        tokio::spawn(write_frames(write_half, rx));
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        Self {
            reader: BufReader::new(reader),
            outbound: Outbound { tx },
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Next non-blank line, or [`RpcError::Eof`] once the peer hangs up.
    async fn next_line(&mut self) -> Result<String, RpcError> {
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).await?;
            if read == 0 {
                return Err(RpcError::Eof);
            }
            if !line.trim().is_empty() {
                return Ok(line);
            }
        }
    }
}

async fn write_frames<W>(mut writer: W, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let mut payload = match serde_json::to_vec(&frame) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode outbound frame");
                continue;
            }
        };
        payload.push(b'\n');
        let written = async {
            writer.write_all(&payload).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            tracing::debug!(error = %err, "connection writer stopped");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Server side of one protocol.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// A protocol handler that releases per-connection resources when the
/// connection goes away.
pub trait Shutdownable: Send + Sync {
    fn shutdown(&self);
}

/// Dispatches framed requests to registered protocols.
pub struct RpcServer {
    transport: Transport,
    protocols: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl RpcServer {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            protocols: HashMap::new(),
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.transport.outbound()
    }

    pub fn register(
        &mut self,
        name: &str,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<(), RpcError> {
        if self.protocols.contains_key(name) {
            return Err(RpcError::DuplicateProtocol(name.to_string()));
        }
        self.protocols.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn protocol_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.protocols.keys().cloned().collect();
        names.sort();
        names
    }

    /// Serve until the transport fails. Always yields the terminal error;
    /// a clean hang-up is [`RpcError::Eof`].
    ///
    /// Calls still in flight when the transport ends are aborted.
    pub async fn run(mut self) -> RpcError {
        let mut in_flight = JoinSet::new();
        loop {
            while in_flight.try_join_next().is_some() {}
            let line = match self.transport.next_line().await {
                Ok(line) => line,
                Err(err) => return err,
            };

            let request: RpcRequest = match serde_json::from_str(line.trim_end()) {
                Ok(request) => request,
                Err(err) => {
                    let reply = Frame::error(0, format!("invalid request JSON: {err}"));
                    if self.transport.outbound.send(reply).await.is_err() {
                        return RpcError::Closed;
                    }
                    continue;
                }
            };

            let outbound = self.transport.outbound();
            let dispatch = self.route(&request.method);
            in_flight.spawn(async move {
                let seq = request.seq;
                let result = match dispatch {
                    Ok((handler, method)) => handler.call(&method, request.params).await,
                    Err(err) => Err(err),
                };
                let frame = match result {
                    Ok(data) => Frame::ok(seq, data),
                    Err(err) => Frame::error(seq, err.to_string()),
                };
                let _ = outbound.send(frame).await;
            });
        }
    }

    fn route(&self, full: &str) -> Result<(Arc<dyn ProtocolHandler>, String), RpcError> {
        let (protocol, method) = full
            .split_once('.')
            .ok_or_else(|| RpcError::UnknownProtocol(full.to_string()))?;
        let handler = self
            .protocols
            .get(protocol)
            .ok_or_else(|| RpcError::UnknownProtocol(protocol.to_string()))?;
        Ok((Arc::clone(handler), method.to_string()))
    }
}

/// Decode call params, mapping failures to [`RpcError::InvalidParams`].
///
/// `null` params decode as an empty object so methods with all-optional
/// params accept a bare call.
pub fn decode_params<T>(params: Value) -> Result<T, RpcError>
where
    T: serde::de::DeserializeOwned,
{
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

/// Encode a handler result.
pub fn encode<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(RpcError::Codec)
}

pub(crate) fn unknown_method(protocol: &str, method: &str) -> RpcError {
    RpcError::UnknownMethod {
        protocol: protocol.to_string(),
        method: method.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Echo;

    #[async_trait]
    impl ProtocolHandler for Echo {
        async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            match method {
                "echo" => Ok(params),
                "slow" => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok(json!("slow"))
                }
                other => Err(unknown_method("echo", other)),
            }
        }
    }

    async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Frame {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read frame");
        serde_json::from_str(line.trim_end()).expect("decode frame")
    }

    #[test]
    fn frames_are_tagged_by_type() {
        let encoded = serde_json::to_value(Frame::ok(7, json!({"a": 1}))).unwrap();
        assert_eq!(encoded["type"], "response");
        assert_eq!(encoded["seq"], 7);
        assert!(encoded.get("error").is_none());

        let encoded = serde_json::to_value(Frame::notify("session.logged_out", Value::Null)).unwrap();
        assert_eq!(encoded["type"], "notify");
        assert_eq!(encoded["method"], "session.logged_out");
    }

    #[test]
    fn null_params_decode_as_empty_object() {
        #[derive(Deserialize)]
        struct Opt {
            #[serde(default)]
            flag: bool,
        }
        let decoded: Opt = decode_params(Value::Null).unwrap();
        assert!(!decoded.flag);
    }

    #[tokio::test]
    async fn duplicate_protocol_is_rejected() {
        let (_client, server_side) = duplex(1024);
        let mut server = RpcServer::new(Transport::new(server_side));
        server.register("echo", Arc::new(Echo)).unwrap();
        let err = server.register("echo", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateProtocol(name) if name == "echo"));
    }

    #[tokio::test]
    async fn serves_requests_and_reports_eof() {
        let (client, server_side) = duplex(4096);
        let mut server = RpcServer::new(Transport::new(server_side));
        server.register("echo", Arc::new(Echo)).unwrap();
        let serving = tokio::spawn(server.run());

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(b"{\"seq\":1,\"method\":\"echo.echo\",\"params\":{\"x\":1}}\n")
            .await
            .unwrap();
        assert_eq!(read_frame(&mut reader).await, Frame::ok(1, json!({"x": 1})));

        write_half
            .write_all(b"{\"seq\":2,\"method\":\"nope.echo\"}\n")
            .await
            .unwrap();
        match read_frame(&mut reader).await {
            Frame::Response { seq, ok, error, .. } => {
                assert_eq!(seq, 2);
                assert!(!ok);
                assert!(error.unwrap().contains("unknown protocol"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        write_half.write_all(b"not json\n").await.unwrap();
        match read_frame(&mut reader).await {
            Frame::Response { ok, error, .. } => {
                assert!(!ok);
                assert!(error.unwrap().contains("invalid request JSON"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        write_half.shutdown().await.unwrap();
        drop(write_half);
        let terminal = serving.await.unwrap();
        assert!(terminal.is_eof(), "got {terminal}");
    }

    #[tokio::test]
    async fn slow_call_does_not_block_later_requests() {
        let (client, server_side) = duplex(4096);
        let mut server = RpcServer::new(Transport::new(server_side));
        server.register("echo", Arc::new(Echo)).unwrap();
        tokio::spawn(server.run());

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);
        write_half
            .write_all(b"{\"seq\":1,\"method\":\"echo.slow\"}\n{\"seq\":2,\"method\":\"echo.echo\",\"params\":2}\n")
            .await
            .unwrap();

        assert_eq!(read_frame(&mut reader).await, Frame::ok(2, json!(2)));
        assert_eq!(read_frame(&mut reader).await, Frame::ok(1, json!("slow")));
    }
}
