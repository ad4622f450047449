// Copyright 2020 Joyent, Inc.

//! Outstanding RPC requests.
//!
//! Each request has two halves. The client's request table owns a
//! `PendingRequest`, which is the only way to deliver data to the caller or
//! complete the request; its terminal operations consume it, so a request
//! can only complete once. The caller holds the matching [`FastRequest`],
//! a stream of the values the server sent, ending with `Err` if the request
//! failed. Completion travels on a separate channel that is only reported
//! once the data channel has drained, so every value is seen before the
//! outcome. The one exception is abandonment, after which buffered values
//! are discarded.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use slog::{debug, trace, Logger};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Shared;
use crate::error::{FastError, FastErrorKind};

type Completion = Result<(), FastError>;

/// Per-request options for [`FastClient::rpc`](crate::client::FastClient::rpc).
#[derive(Clone, Debug, Default)]
pub struct RpcOptions {
    /// Fail the request with a timeout error if it has not completed
    /// after this long.
    pub timeout: Option<Duration>,
    /// Drop `null` entries from response data instead of failing the
    /// request.
    pub ignore_null_values: bool,
}

impl RpcOptions {
    pub fn new() -> RpcOptions {
        RpcOptions::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> RpcOptions {
        self.timeout = Some(timeout);
        self
    }

    pub fn ignore_null_values(mut self, ignore: bool) -> RpcOptions {
        self.ignore_null_values = ignore;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Running,
    Done,
    Abandoned,
}

/// Everything a request produced, as returned by [`FastRequest::result`].
#[derive(Debug)]
pub struct RpcResult {
    pub msgid: u32,
    pub data: Vec<Value>,
    pub error: Option<FastError>,
}

/// The client-side table entry for an outstanding request.
pub(crate) struct PendingRequest {
    msgid: u32,
    ignore_null_values: bool,
    data_tx: mpsc::Sender<Value>,
    done_tx: oneshot::Sender<Completion>,
    finished: CancellationToken,
    timer: Option<JoinHandle<()>>,
    log: Logger,
}

impl PendingRequest {
    pub(crate) fn new(
        msgid: u32,
        method: &str,
        args: Vec<Value>,
        options: &RpcOptions,
        buffer: usize,
        client: Weak<Shared>,
        log: Logger,
    ) -> (PendingRequest, FastRequest) {
        let (data_tx, data_rx) = mpsc::channel(buffer.max(1));
        let (done_tx, done_rx) = oneshot::channel();

        let entry = PendingRequest {
            msgid,
            ignore_null_values: options.ignore_null_values,
            data_tx,
            done_tx,
            finished: CancellationToken::new(),
            timer: None,
            log,
        };
        let request = FastRequest {
            msgid,
            method: String::from(method),
            args,
            state: RequestState::Running,
            data_rx,
            done_rx,
            outcome: None,
            client,
        };

        (entry, request)
    }

    pub(crate) fn set_timer(&mut self, timer: JoinHandle<()>) {
        self.timer = Some(timer);
    }

    pub(crate) fn sink(&self) -> DataSink {
        DataSink {
            msgid: self.msgid,
            ignore_null_values: self.ignore_null_values,
            tx: self.data_tx.clone(),
            finished: self.finished.clone(),
            log: self.log.clone(),
        }
    }

    pub(crate) fn on_end(self) {
        trace!(self.log, "request completed");
        self.finish(Ok(()));
    }

    pub(crate) fn on_error(self, info: Value) {
        let err = FastError::server(info);
        debug!(self.log, "server returned error"; "err" => %err);
        self.fail(err);
    }

    pub(crate) fn on_timeout(self, timeout: Duration) {
        debug!(self.log, "request timed out";
            "timeout_ms" => timeout.as_millis() as u64);
        self.fail(FastError::Timeout { timeout });
    }

    pub(crate) fn abandon(self) {
        debug!(self.log, "request abandoned");
        self.fail(FastError::Abandoned);
    }

    pub(crate) fn fail(self, cause: FastError) {
        self.fail_shared(Arc::new(cause));
    }

    /// Fail with a cause that may be shared with other requests.
    pub(crate) fn fail_shared(self, cause: Arc<FastError>) {
        let msgid = self.msgid;
        self.finish(Err(FastError::request(msgid, cause)));
    }

    fn finish(self, outcome: Completion) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // Release a reader that is waiting for room in this request's buffer.
        self.finished.cancel();
        // The caller may have dropped its handle already.
        let _ = self.done_tx.send(outcome);
    }
}

/// Delivers response values to one request's caller.
pub(crate) struct DataSink {
    msgid: u32,
    ignore_null_values: bool,
    tx: mpsc::Sender<Value>,
    finished: CancellationToken,
    log: Logger,
}

/// Holds the client's flow-control flag set while alive.
struct Paused<'a>(&'a AtomicBool);

impl<'a> Paused<'a> {
    fn new(flag: &'a AtomicBool) -> Paused<'a> {
        flag.store(true, Ordering::SeqCst);
        Paused(flag)
    }
}

impl Drop for Paused<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DataSink {
    /// Hand `values` to the caller in order. When the caller's buffer is
    /// full this waits for it to catch up, with `flow_controlled` set for
    /// the duration. A `null` value stops delivery with an error unless
    /// the request ignores nulls, in which case it is skipped. Once the
    /// request has finished (abandoned, timed out or failed) the remaining
    /// values are dropped.
    pub(crate) async fn on_data(
        &self,
        values: Vec<Value>,
        flow_controlled: &AtomicBool,
    ) -> Result<(), FastError> {
        for value in values {
            if self.finished.is_cancelled() {
                trace!(self.log, "request finished; dropping values");
                return Ok(());
            }

            if value.is_null() {
                if self.ignore_null_values {
                    trace!(self.log, "ignoring null value");
                    continue;
                }
                return Err(FastError::null_value(self.msgid, false));
            }

            match self.tx.try_send(value) {
                Ok(()) => (),
                Err(TrySendError::Full(value)) => {
                    debug!(self.log, "consumer is behind; pausing reads");
                    let _paused = Paused::new(flow_controlled);
                    tokio::select! {
                        sent = self.tx.send(value) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                            debug!(self.log, "consumer caught up; resuming reads");
                        }
                        _ = self.finished.cancelled() => {
                            debug!(self.log, "request finished while paused; resuming reads");
                            return Ok(());
                        }
                    }
                }
                Err(TrySendError::Closed(_)) => return Ok(()),
            }
        }

        Ok(())
    }
}

/// The caller's handle on one RPC.
///
/// As a [`Stream`], it yields each value the server sent, in order. A
/// request that completes successfully ends the stream; a failed request
/// yields one `Err` (a [`FastError::Request`] wrapping the cause) and then
/// ends. An abandoned request yields no further values, only the error.
/// Dropping a handle whose request is still running abandons it.
pub struct FastRequest {
    msgid: u32,
    method: String,
    args: Vec<Value>,
    state: RequestState,
    data_rx: mpsc::Receiver<Value>,
    done_rx: oneshot::Receiver<Completion>,
    outcome: Option<Completion>,
    client: Weak<Shared>,
}

impl FastRequest {
    /// A request that failed before it could be sent.
    pub(crate) fn failed(
        msgid: u32,
        method: &str,
        args: Vec<Value>,
        cause: FastError,
    ) -> FastRequest {
        let (_, data_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();
        let _ = done_tx.send(Err(FastError::request(msgid, Arc::new(cause))));

        FastRequest {
            msgid,
            method: String::from(method),
            args,
            state: RequestState::Running,
            data_rx,
            done_rx,
            outcome: None,
            client: Weak::new(),
        }
    }

    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// The state as observed through this handle: a request becomes `Done`
    /// or `Abandoned` once its outcome has been read from the stream.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Stop tracking this request. Values not yet read from the handle are
    /// discarded. The remote server is not told; any response that arrives
    /// later is treated as a protocol error by the client. Has no effect if
    /// the request already completed or was abandoned.
    pub fn abandon(&self) {
        if let Some(client) = self.client.upgrade() {
            client.abandon(self.msgid);
        }
    }

    /// Wait for the request to complete, collecting all of its data.
    pub async fn result(mut self) -> RpcResult {
        let mut data = Vec::new();
        let mut error = None;

        while let Some(item) = self.next().await {
            match item {
                Ok(value) => data.push(value),
                Err(err) => error = Some(err),
            }
        }

        RpcResult {
            msgid: self.msgid,
            data,
            error,
        }
    }
}

impl fmt::Debug for FastRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastRequest")
            .field("msgid", &self.msgid)
            .field("method", &self.method)
            .field("state", &self.state)
            .finish()
    }
}

impl Stream for FastRequest {
    type Item = Result<Value, FastError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.state != RequestState::Running {
            return Poll::Ready(None);
        }

        if this.outcome.is_none() {
            match Pin::new(&mut this.done_rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => this.outcome = Some(outcome),
                // The client went away without completing the request.
                Poll::Ready(Err(_)) => {
                    let cause = Arc::new(FastError::client_detached());
                    this.outcome = Some(Err(FastError::request(this.msgid, cause)));
                }
                Poll::Pending => (),
            }
        }

        let abandoned = match &this.outcome {
            Some(Err(err)) => err.cause().map(FastError::kind) == Some(FastErrorKind::Abandoned),
            _ => false,
        };

        if abandoned {
            this.data_rx.close();
        } else {
            match this.data_rx.poll_recv(cx) {
                Poll::Ready(Some(value)) => return Poll::Ready(Some(Ok(value))),
                Poll::Ready(None) => (),
                Poll::Pending => return Poll::Pending,
            }
        }

        match this.outcome.take() {
            None => Poll::Pending,
            Some(Ok(())) => {
                this.state = RequestState::Done;
                Poll::Ready(None)
            }
            Some(Err(err)) => {
                this.state = if abandoned {
                    RequestState::Abandoned
                } else {
                    RequestState::Done
                };
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl Drop for FastRequest {
    fn drop(&mut self) {
        if self.state == RequestState::Running {
            self.abandon();
        }
    }
}
