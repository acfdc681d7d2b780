//! Call-multiplexing client
//!
//! One [`Client`] owns one connection. Any number of tasks may issue calls
//! on it concurrently: requests are written one at a time under a send
//! lock, and a single background reader matches each response to its call
//! by sequence number.
//!
//! ```rust,no_run
//! # async fn demo() -> wirecall::Result<()> {
//! use wirecall::Client;
//!
//! let client = Client::dial("127.0.0.1:9000", None).await?;
//! let sum: i32 = client.call("Arith.Sum", &(3, 4)).await?;
//! assert_eq!(sum, 7);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, instrument, warn};
use uuid::Uuid;

use crate::protocol::metrics::Metrics;
use crate::protocol::{CodecRegistry, DecodeTarget, Error, Header, Options, Result};
use crate::transport::{self, Config, ConnReader, ConnWriter};

/// Outcome of one call, delivered on its completion channel.
#[derive(Debug)]
pub struct Call<R> {
    /// Sequence number the request was sent with
    pub seq: u64,
    /// Target in `Service.Method` form
    pub service_method: String,
    /// Decoded reply, present when the call succeeded
    pub reply: Option<R>,
    /// Failure, if any
    pub error: Option<Error>,
}

impl<R> Call<R> {
    /// The reply, or the error the call completed with.
    pub fn into_result(self) -> Result<R> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.reply
            .ok_or_else(|| Error::Decode(format!("no reply for {}", self.service_method)))
    }
}

/// A call waiting in the pending table, with its reply type erased.
trait PendingCall: Send {
    fn assign(&mut self, seq: u64);
    fn reply_target(&mut self) -> &mut dyn DecodeTarget;
    fn complete(self: Box<Self>, error: Option<Error>);
}

struct Pending<R> {
    seq: u64,
    service_method: String,
    reply: Option<R>,
    done: mpsc::Sender<Call<R>>,
}

impl<R> PendingCall for Pending<R>
where
    R: DeserializeOwned + Send + 'static,
{
    fn assign(&mut self, seq: u64) {
        self.seq = seq;
    }

    fn reply_target(&mut self) -> &mut dyn DecodeTarget {
        &mut self.reply
    }

    fn complete(self: Box<Self>, error: Option<Error>) {
        let Pending {
            seq,
            service_method,
            reply,
            done,
        } = *self;
        if error.is_some() {
            Metrics::record_call_failed();
        }

        let call = Call {
            seq,
            reply: if error.is_none() { reply } else { None },
            service_method,
            error,
        };
        // The completer never waits on the caller.
        match done.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => {
                debug!(seq = call.seq, method = %call.service_method, "completion channel full, delivering later");
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(call)) = done.send(call).await {
                        debug!(seq = call.seq, "caller went away, discarding call");
                    }
                });
            }
            Err(TrySendError::Closed(call)) => {
                debug!(seq = call.seq, method = %call.service_method, "caller went away, discarding call");
            }
        }
    }
}

/// A call taken out of the pending table by the reader.
///
/// If the read is abandoned before the call completes, dropping the claim
/// completes it with [`Error::Shutdown`].
struct Claimed(Option<Box<dyn PendingCall>>);

impl Claimed {
    fn reply_target(&mut self) -> Option<&mut dyn DecodeTarget> {
        self.0.as_mut().map(|call| call.reply_target())
    }

    fn complete(mut self, error: Option<Error>) {
        if let Some(call) = self.0.take() {
            call.complete(error);
        }
    }
}

impl Drop for Claimed {
    fn drop(&mut self) {
        if let Some(call) = self.0.take() {
            debug!("response read abandoned, failing its call");
            call.complete(Some(Error::Shutdown));
        }
    }
}

#[derive(Default)]
struct State {
    next_seq: u64,
    pending: HashMap<u64, Box<dyn PendingCall>>,
    /// Closed by the user
    closing: bool,
    /// Reader loop has stopped
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    sender: Arc<tokio::sync::Mutex<ConnWriter>>,
    close_signal: Notify,
    config: Config,
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("client state mutex poisoned")
    }

    /// Assign the next sequence number and park the call.
    fn register_call(
        &self,
        mut call: Box<dyn PendingCall>,
    ) -> std::result::Result<u64, Box<dyn PendingCall>> {
        let mut state = self.lock_state();
        if state.closing || state.shutdown {
            return Err(call);
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        call.assign(seq);
        state.pending.insert(seq, call);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<Box<dyn PendingCall>> {
        self.lock_state().pending.remove(&seq)
    }

    /// Mark the client shut down and fail everything still pending.
    fn terminate_calls(&self, cause: Option<&Error>) {
        let drained: Vec<_> = {
            let mut state = self.lock_state();
            state.shutdown = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending calls");
        }
        for call in drained {
            let error = match cause {
                Some(cause) => Error::ConnectionLost(cause.to_string()),
                None => Error::Shutdown,
            };
            call.complete(Some(error));
        }
    }

    /// Returns false if the client was already closing.
    fn begin_close(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.closing {
                return false;
            }
            state.closing = true;
        }
        self.close_signal.notify_one();
        true
    }

    /// Read one response and complete the call it belongs to.
    ///
    /// Only errors that leave the stream unusable are returned.
    async fn receive(&self, reader: &mut ConnReader) -> Result<()> {
        let header = reader.read_header().await?;
        let Some(call) = self.remove_call(header.seq) else {
            // Usually a call whose write failed after it was registered.
            debug!(seq = header.seq, "response for unknown call");
            return reader.read_body(None).await;
        };
        let mut call = Claimed(Some(call));
        Metrics::record_response_received();

        if header.is_error() {
            let drained = reader.read_body(None).await;
            call.complete(Some(Error::Remote(header.error)));
            return drained;
        }

        match reader.read_body(call.reply_target()).await {
            Ok(()) => {
                call.complete(None);
                Ok(())
            }
            Err(err) if err.is_connection_fatal() => {
                call.complete(Some(Error::ConnectionLost(format!("reading body: {err}"))));
                Err(err)
            }
            Err(err) => {
                call.complete(Some(err));
                Ok(())
            }
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: ConnReader) {
    let cause = loop {
        tokio::select! {
            biased;
            () = inner.close_signal.notified() => break None,
            result = inner.receive(&mut reader) => {
                if let Err(err) = result {
                    break Some(err);
                }
            }
        }
    };

    match &cause {
        None => debug!("client closed"),
        Some(err) if err.is_eof() => debug!("server closed the connection"),
        Some(err) => warn!(error = %err, "client reader stopped"),
    }
    inner.terminate_calls(cause.as_ref());
    inner.sender.lock().await.close().await;
}

/// RPC client bound to one connection.
pub struct Client {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Negotiate `options` on an open connection and start the reader.
    #[instrument(level = "debug", skip_all, fields(codec = %options.codec_type))]
    pub async fn new<S>(
        conn: S,
        options: Options,
        config: Config,
        registry: &CodecRegistry,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let options = options.normalized();
        let (reader, writer) = transport::initiate(conn, &options, &config, registry).await?;

        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            sender: Arc::new(tokio::sync::Mutex::new(writer)),
            close_signal: Notify::new(),
            config,
        });
        let span = info_span!("client", conn = %Uuid::new_v4(), codec = %options.codec_type);
        let handle = tokio::spawn(read_loop(Arc::clone(&inner), reader).instrument(span));

        Ok(Self {
            inner,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Connect over TCP with the built-in codecs and default configuration.
    pub async fn dial(addr: impl ToSocketAddrs, options: Option<Options>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::new(
            stream,
            options.unwrap_or_default(),
            Config::default(),
            &CodecRegistry::default(),
        )
        .await
    }

    /// Completion channel with the configured default capacity.
    #[must_use]
    pub fn done_channel<R>(&self) -> (mpsc::Sender<Call<R>>, mpsc::Receiver<Call<R>>) {
        mpsc::channel(self.inner.config.done_capacity.max(1))
    }

    /// Send a request and return once it is written.
    ///
    /// The outcome arrives on `done`; if `done` is full at that moment it is
    /// delivered once the caller makes room. A call abandoned by its caller
    /// stays in the pending table until its response or a connection
    /// failure arrives. Dropping this future never leaves a partial frame on
    /// the wire: once sending starts it finishes in its own task.
    pub async fn go<A, R>(&self, service_method: &str, args: &A, done: mpsc::Sender<Call<R>>)
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send + 'static,
    {
        let call = Box::new(Pending {
            seq: 0,
            service_method: service_method.to_owned(),
            reply: None,
            done,
        });

        let mut writer = Arc::clone(&self.inner.sender).lock_owned().await;
        let seq = match self.inner.register_call(call) {
            Ok(seq) => seq,
            Err(call) => {
                drop(writer);
                call.complete(Some(Error::Shutdown));
                return;
            }
        };

        let staged = writer.stage(&Header::request(service_method, seq), args);
        let inner = Arc::clone(&self.inner);
        let send = tokio::spawn(async move {
            let written = writer.send_staged(staged).await;
            drop(writer);
            match written {
                Ok(()) => Metrics::record_call_sent(),
                Err(err) => {
                    debug!(seq, error = %err, "request write failed");
                    if let Some(call) = inner.remove_call(seq) {
                        call.complete(Some(err));
                    }
                }
            }
        });
        if let Err(err) = send.await {
            warn!(seq, error = %err, "request send task failed");
        }
    }

    /// Call `service_method` and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, mut completed) = mpsc::channel(1);
        self.go(service_method, args, done).await;
        match completed.recv().await {
            Some(call) => call.into_result(),
            None => Err(Error::Shutdown),
        }
    }

    /// Whether new calls are still accepted.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let state = self.inner.lock_state();
        !state.closing && !state.shutdown
    }

    /// Close the connection.
    ///
    /// Pending calls complete with [`Error::Shutdown`] before this returns.
    /// Closing an already closed client returns [`Error::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        if !self.inner.begin_close() {
            return Err(Error::Shutdown);
        }
        let handle = self
            .reader
            .lock()
            .expect("client reader mutex poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "client reader task failed");
            }
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.begin_close();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Client")
            .field("pending", &state.pending.len())
            .field("closing", &state.closing)
            .field("shutdown", &state.shutdown)
            .finish_non_exhaustive()
    }
}
