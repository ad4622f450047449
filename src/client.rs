// Copyright 2020 Joyent, Inc.

//! The Fast client: many concurrent RPCs over one transport.
//!
//! A `FastClient` owns one connection. Requests are issued with
//! [`FastClient::rpc`], which never blocks: the request is registered under
//! a fresh msgid and queued for a writer task. A reader task decodes
//! responses and routes each one to the request with the matching msgid.
//!
//! A failure that affects the whole connection (an I/O error, a protocol
//! violation by the server, or the transport ending while requests are
//! outstanding) is published once on the client's error channel and then
//! fails every outstanding request with that failure as the cause. The
//! client is detached afterwards, and later requests fail immediately.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{FastError, FastErrorKind};
use crate::protocol::{
    FastMessage, FastMessageData, FastMessageId, FastMessageStatus, FastRpc,
    FP_DEFAULT_MAX_DATA_LEN,
};
use crate::request::{FastRequest, PendingRequest, RpcOptions};

/// Default number of response values buffered per request before the
/// client stops reading from the transport.
pub const DEFAULT_REQUEST_BUFFER: usize = 16;

#[derive(Clone, Debug)]
pub struct FastClientConfig {
    /// Values buffered for each request ahead of its consumer.
    pub request_buffer: usize,
    /// Largest message payload accepted or sent, in bytes.
    pub max_data_len: usize,
}

impl Default for FastClientConfig {
    fn default() -> FastClientConfig {
        FastClientConfig {
            request_buffer: DEFAULT_REQUEST_BUFFER,
            max_data_len: FP_DEFAULT_MAX_DATA_LEN,
        }
    }
}

struct ClientState {
    pending: HashMap<u32, PendingRequest>,
    msg_ids: FastMessageId,
    writer: Option<mpsc::UnboundedSender<FastMessage>>,
    reader: Option<JoinHandle<()>>,
    detached: bool,
}

impl ClientState {
    /// The next id in sequence that does not belong to a live request.
    fn next_msgid(&mut self) -> u32 {
        loop {
            let msgid = self.msg_ids.next().unwrap_or(1);
            if !self.pending.contains_key(&msgid) {
                return msgid;
            }
        }
    }
}

/// State shared between the client handle, its I/O tasks and its requests.
pub(crate) struct Shared {
    state: Mutex<ClientState>,
    flow_controlled: AtomicBool,
    errors: watch::Sender<Option<FastError>>,
    log: Logger,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_detached(&self) -> bool {
        self.state().detached
    }

    /// Remove `msgid` from the table and hand its entry to `f`. Does
    /// nothing if the request is no longer outstanding.
    fn complete<F>(&self, msgid: u32, f: F)
    where
        F: FnOnce(PendingRequest),
    {
        let entry = self.state().pending.remove(&msgid);
        if let Some(entry) = entry {
            f(entry);
        }
    }

    pub(crate) fn abandon(&self, msgid: u32) {
        self.complete(msgid, PendingRequest::abandon);
    }

    fn expire(&self, msgid: u32, timeout: Duration) {
        self.complete(msgid, |entry| entry.on_timeout(timeout));
    }

    async fn handle_message(&self, msg: FastMessage) -> Result<(), FastError> {
        let msgid = msg.id;
        let sink = {
            let state = self.state();
            match state.pending.get(&msgid) {
                Some(entry) => entry.sink(),
                None => return Err(FastError::unknown_msgid(msgid)),
            }
        };

        trace!(self.log, "routing message";
            "msgid" => msgid, "status" => msg.status.name());

        match msg.status {
            FastMessageStatus::Data | FastMessageStatus::End => {
                let values = match msg.data.d {
                    Value::Array(values) => values,
                    _ => {
                        let reason = format!(
                            "data.d for {} message {} must be an array",
                            msg.status.name(),
                            msgid
                        );
                        return Err(FastError::bad_data(msgid, reason));
                    }
                };

                if let Err(err) = sink.on_data(values, &self.flow_controlled).await {
                    self.complete(msgid, |entry| entry.fail(err));
                } else if msg.status == FastMessageStatus::End {
                    self.complete(msgid, PendingRequest::on_end);
                }
            }
            FastMessageStatus::Error => {
                self.complete(msgid, |entry| entry.on_error(msg.data.d));
            }
        }

        Ok(())
    }

    /// Detach from the transport and fail every outstanding request with
    /// `err` as the cause. `publish` makes `err` visible on the client's
    /// error channel. Only the first call has any effect.
    fn fail(&self, err: FastError, publish: bool) {
        let (pending, reader) = {
            let mut state = self.state();
            if state.detached {
                return;
            }
            state.detached = true;
            state.writer = None;
            (mem::take(&mut state.pending), state.reader.take())
        };

        if let Some(reader) = reader {
            reader.abort();
        }
        // An aborted reader may not get to clear this itself.
        self.flow_controlled.store(false, Ordering::SeqCst);

        if publish {
            error!(self.log, "client failed; detaching";
                "err" => %err, "npending" => pending.len());
        } else {
            info!(self.log, "detaching from transport"; "npending" => pending.len());
        }

        let cause = Arc::new(err);
        for (_, entry) in pending {
            entry.fail_shared(Arc::clone(&cause));
        }

        if publish {
            let _ = self.errors.send(Some(FastError::clone(&cause)));
        }
    }

    fn end_of_stream(&self) {
        let npending = self.state().pending.len();
        if npending > 0 {
            self.fail(FastError::unexpected_end(), true);
        } else {
            debug!(self.log, "transport ended");
            self.fail(FastError::transport_detached(), false);
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut frames: FramedRead<R, FastRpc>)
where
    R: AsyncRead + Unpin,
{
    let err = loop {
        match frames.next().await {
            Some(Ok(msg)) => {
                if let Err(err) = shared.handle_message(msg).await {
                    break err;
                }
            }
            Some(Err(err)) => break err,
            None => {
                shared.end_of_stream();
                return;
            }
        }
    };

    shared.fail(err, true);
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut sink: FramedWrite<W, FastRpc>,
    mut outbound: mpsc::UnboundedReceiver<FastMessage>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        if shared.is_detached() {
            // Requests still queued have already failed locally.
            outbound.close();
            trace!(shared.log, "dropping queued requests after detach");
            break;
        }

        let msgid = msg.id;
        match sink.send(msg).await {
            Ok(()) => (),
            // The encoder rejected this one message; nothing was written.
            Err(err) if err.kind() == FastErrorKind::Protocol => {
                warn!(shared.log, "failed to encode request";
                    "msgid" => msgid, "err" => %err);
                shared.complete(msgid, |entry| entry.fail(err));
            }
            Err(err) => {
                shared.fail(err, true);
                return;
            }
        }
    }

    if let Err(err) = sink.close().await {
        debug!(shared.log, "error closing transport"; "err" => %err);
    }
}

/// A Fast client bound to one transport connection.
///
/// Must be created and used from within a Tokio runtime. Dropping the
/// client detaches it.
pub struct FastClient {
    shared: Arc<Shared>,
    config: FastClientConfig,
    errors: watch::Receiver<Option<FastError>>,
}

impl FastClient {
    pub fn new<T>(transport: T, log: Option<&Logger>) -> FastClient
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        FastClient::with_config(transport, FastClientConfig::default(), log)
    }

    pub fn with_config<T>(
        transport: T,
        config: FastClientConfig,
        log: Option<&Logger>,
    ) -> FastClient
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("component" => "FastClient"));

        let (read_half, write_half) = tokio::io::split(transport);
        let codec = FastRpc::with_max_data_len(config.max_data_len);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            state: Mutex::new(ClientState {
                pending: HashMap::new(),
                msg_ids: FastMessageId::new(),
                writer: Some(writer_tx),
                reader: None,
                detached: false,
            }),
            flow_controlled: AtomicBool::new(false),
            errors: errors_tx,
            log,
        });

        tokio::spawn(write_loop(
            Arc::clone(&shared),
            FramedWrite::new(write_half, codec.clone()),
            writer_rx,
        ));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&shared),
            FramedRead::new(read_half, codec),
        ));

        {
            let mut state = shared.state();
            if state.detached {
                reader.abort();
            } else {
                state.reader = Some(reader);
            }
        }

        debug!(shared.log, "client attached to transport");
        FastClient {
            shared,
            config,
            errors: errors_rx,
        }
    }

    /// Issue an RPC. Returns immediately; the response arrives through the
    /// returned [`FastRequest`]. If the client is detached, the request has
    /// already failed and nothing is sent.
    pub fn rpc(&self, method: &str, args: Vec<Value>, options: RpcOptions) -> FastRequest {
        let mut state = self.shared.state();
        let msgid = state.next_msgid();
        let log = self
            .shared
            .log
            .new(o!("msgid" => msgid, "method" => String::from(method)));

        if state.detached {
            debug!(log, "request issued after detach");
            let cause = FastError::transport_detached();
            return FastRequest::failed(msgid, method, args, cause);
        }

        let message = FastMessage::data(
            msgid,
            FastMessageData::new(String::from(method), Value::Array(args.clone())),
        );
        let (mut entry, request) = PendingRequest::new(
            msgid,
            method,
            args,
            &options,
            self.config.request_buffer,
            Arc::downgrade(&self.shared),
            log.clone(),
        );

        if let Some(timeout) = options.timeout {
            let client = Arc::downgrade(&self.shared);
            entry.set_timer(tokio::spawn(async move {
                time::sleep(timeout).await;
                if let Some(client) = client.upgrade() {
                    client.expire(msgid, timeout);
                }
            }));
        }

        state.pending.insert(msgid, entry);
        if let Some(writer) = &state.writer {
            // The writer task only exits once the client is detached, which
            // cannot happen while the state lock is held.
            let _ = writer.send(message);
        }
        drop(state);

        debug!(log, "request issued");
        request
    }

    /// Detach from the transport. Every outstanding request fails with
    /// "client detached from transport", and all later requests fail
    /// immediately. Calling this more than once has no further effect.
    pub fn detach(&self) {
        self.shared.fail(FastError::client_detached(), false);
    }

    pub fn is_detached(&self) -> bool {
        self.shared.is_detached()
    }

    /// Number of requests still waiting for a terminal response.
    pub fn pending_requests(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Whether the client has stopped reading from the transport because a
    /// request's consumer has not kept up with its data.
    pub fn is_flow_controlled(&self) -> bool {
        self.shared.flow_controlled.load(Ordering::SeqCst)
    }

    /// Receiver for the first connection-wide error, if one occurs.
    pub fn errors(&self) -> watch::Receiver<Option<FastError>> {
        self.errors.clone()
    }

    /// The connection-wide error that detached this client, if any.
    pub fn error(&self) -> Option<FastError> {
        self.errors.borrow().clone()
    }

    pub fn config(&self) -> &FastClientConfig {
        &self.config
    }
}

impl Drop for FastClient {
    fn drop(&mut self) {
        self.detach();
    }
}
