// Copyright 2020 Joyent, Inc.

//! In-process mock Fast server used by the client tests. The client and the
//! mock server are connected by a `tokio::io::duplex` pipe, optionally with
//! a fault injector on the client's end.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::io::{
    duplex, AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf,
    WriteHalf,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use fast_rpc::protocol::{
    encode_msg, FastMessage, FastMessageData, FastRpc, FP_DEFAULT_MAX_DATA_LEN,
};
use fast_rpc::{FastClient, FastClientConfig, FastRequest, RpcOptions};

pub const DUMMY_METHOD: &str = "dummy_rpc";
pub const PIPE_SIZE: usize = 64 * 1024;

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn dummy_value() -> Value {
    json!({ "testing": "dummy value" })
}

pub fn dummy_response_data() -> FastMessageData {
    FastMessageData::response(json!([dummy_value()]))
}

pub fn dummy_response_error() -> FastMessageData {
    FastMessageData::response(json!({
        "name": "DummyError",
        "message": "dummy error message",
        "context": { "key": "value" }
    }))
}

pub fn dummy_args() -> Vec<Value> {
    vec![json!({ "hello": "world" })]
}

/// Client end of the pipe. Once `fault` is set, reads fail with a
/// connection reset; the read must be woken (by the server writing
/// something) for the client to notice.
pub struct FaultyStream {
    inner: DuplexStream,
    fault: Arc<AtomicBool>,
}

impl AsyncRead for FaultyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.fault.load(Ordering::SeqCst) {
            let err = io::Error::new(io::ErrorKind::ConnectionReset, "read ECONNRESET");
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FaultyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub struct MockServer {
    reader: FramedRead<ReadHalf<DuplexStream>, FastRpc>,
    writer: FramedWrite<WriteHalf<DuplexStream>, FastRpc>,
    fault: Arc<AtomicBool>,
}

impl MockServer {
    /// The next request from the client, or `None` once the client has
    /// closed its side.
    pub async fn next_request(&mut self) -> Option<FastMessage> {
        self.reader
            .next()
            .await
            .map(|msg| msg.expect("client sent a malformed message"))
    }

    pub async fn send(&mut self, msg: FastMessage) {
        self.writer.send(msg).await.expect("mock server write");
    }

    /// Write a message without validating it first.
    pub async fn send_unchecked(&mut self, msg: FastMessage) {
        let mut buf = BytesMut::new();
        encode_msg(&msg, FP_DEFAULT_MAX_DATA_LEN, &mut buf).expect("encode");
        let sock = self.writer.get_mut();
        sock.write_all(&buf).await.expect("mock server raw write");
        sock.flush().await.expect("mock server flush");
    }

    /// Respond to `msg`: an optional DATA message, then END (carrying one
    /// more value) or ERROR.
    pub async fn reply(&mut self, msg: &FastMessage, data: bool, error: bool) {
        if data {
            self.send(FastMessage::data(msg.id, dummy_response_data())).await;
        }
        if error {
            self.send(FastMessage::error(msg.id, dummy_response_error())).await;
        } else {
            self.send(FastMessage::end(msg.id, dummy_response_data())).await;
        }
    }

    /// Close the server's side of the pipe for writing, so the client sees
    /// end-of-stream.
    pub async fn end(&mut self) {
        self.writer
            .get_mut()
            .shutdown()
            .await
            .expect("mock server shutdown");
    }

    /// Make the client's next read fail with a connection reset.
    pub async fn reset_connection(&mut self) {
        self.fault.store(true, Ordering::SeqCst);
        let sock = self.writer.get_mut();
        sock.write_all(b"boom!").await.expect("mock server raw write");
    }
}

pub fn connect() -> (FastClient, MockServer) {
    connect_with_config(FastClientConfig::default(), PIPE_SIZE)
}

pub fn connect_with_config(
    config: FastClientConfig,
    pipe_size: usize,
) -> (FastClient, MockServer) {
    let (client_end, server_end) = duplex(pipe_size);
    let fault = Arc::new(AtomicBool::new(false));
    let stream = FaultyStream {
        inner: client_end,
        fault: Arc::clone(&fault),
    };
    let log = test_logger();
    let client = FastClient::with_config(stream, config, Some(&log));

    let (read_half, write_half) = tokio::io::split(server_end);
    let server = MockServer {
        reader: FramedRead::new(read_half, FastRpc::new()),
        writer: FramedWrite::new(write_half, FastRpc::new()),
        fault,
    };

    (client, server)
}

pub fn make_request(client: &FastClient) -> FastRequest {
    client.rpc(DUMMY_METHOD, dummy_args(), RpcOptions::new())
}
