//! Concurrent request dispatcher
//!
//! A [`Server`] owns a service registry and serves any number of
//! connections. Each connection gets one reader that decodes requests in
//! arrival order and one task per request that runs the handler. Responses
//! share the connection's send lock, so each one reaches the wire whole,
//! though not necessarily in request order.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::protocol::metrics::Metrics;
use crate::protocol::{CodecRegistry, Error, Header, Invalid, Result};
use crate::service::{Argument, MethodType, Reply, Service};
use crate::transport::{self, Config, ConnReader, ConnWriter};

/// A request read off the wire.
enum Incoming {
    /// Resolved and decoded, ready to run
    Dispatch {
        header: Header,
        method: Arc<MethodType>,
        argument: Argument,
    },
    /// Could not be dispatched; the header carries the reason
    Rejected(Header),
}

struct Inner {
    services: RwLock<HashMap<String, Arc<Service>>>,
    config: Config,
    registry: CodecRegistry,
}

/// RPC server.
///
/// Cloning is cheap and every clone serves the same registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Server with the built-in codecs and default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default(), CodecRegistry::default())
    }

    /// Server with explicit configuration and codecs.
    #[must_use]
    pub fn with_config(config: Config, registry: CodecRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                services: RwLock::new(HashMap::new()),
                config,
                registry,
            }),
        }
    }

    /// Publish a service.
    ///
    /// Fails if the name is not an identifier or is already taken; an
    /// existing service is never replaced.
    pub fn register(&self, service: impl Into<Service>) -> Result<()> {
        let service = service.into();
        service.validate_name()?;

        let mut services = self
            .inner
            .services
            .write()
            .expect("service registry lock poisoned");
        if services.contains_key(service.name()) {
            return Err(Error::DuplicateService(service.name().to_owned()));
        }
        info!(
            service = service.name(),
            methods = ?service.method_names(),
            "service registered"
        );
        services.insert(service.name().to_owned(), Arc::new(service));
        Ok(())
    }

    /// Resolve `Service.Method`.
    ///
    /// The name is split at its last `.`. A missing service and a missing
    /// method are reported as different errors.
    pub fn find_service(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodType>)> {
        let Some((service_name, method_name)) = service_method.rsplit_once('.') else {
            return Err(Error::IllFormedServiceMethod(service_method.to_owned()));
        };

        let service = self
            .inner
            .services
            .read()
            .expect("service registry lock poisoned")
            .get(service_name)
            .cloned()
            .ok_or_else(|| Error::UnknownService(service_name.to_owned()))?;
        let method = service
            .method(method_name)
            .ok_or_else(|| Error::UnknownMethod(method_name.to_owned()))?;
        Ok((service, method))
    }

    /// Serve every connection accepted on `listener`.
    ///
    /// Each connection runs on its own task. Returns only when accepting
    /// fails, which ends the loop.
    pub async fn accept(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "accepting connections");
        }
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed, stopping");
                    return Err(err.into());
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, error = %err, "failed to set TCP_NODELAY");
            }
            let server = self.clone();
            tokio::spawn(
                async move { server.serve_conn(stream).await }
                    .instrument(info_span!("peer", %peer)),
            );
        }
    }

    /// Serve one connection until the peer goes away.
    ///
    /// A connection whose negotiation fails is closed without a response.
    #[instrument(level = "debug", skip_all, fields(conn = %Uuid::new_v4()))]
    pub async fn serve_conn<S>(&self, conn: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (options, reader, writer) =
            match transport::respond(conn, &self.inner.config, &self.inner.registry).await {
                Ok(negotiated) => negotiated,
                Err(err) => {
                    warn!(error = %err, "rejecting connection");
                    return;
                }
            };
        debug!(codec = %options.codec_type, "connection negotiated");

        Metrics::record_connection_open();
        self.serve_codec(reader, writer).await;
        Metrics::record_connection_close();
    }

    async fn serve_codec(&self, mut reader: ConnReader, writer: ConnWriter) {
        let sender = Arc::new(Mutex::new(writer));
        let mut handlers = JoinSet::new();

        loop {
            let incoming = match self.read_request(&mut reader).await {
                Ok(incoming) => incoming,
                Err(err) => {
                    if err.is_eof() {
                        debug!("client closed the connection");
                    } else {
                        warn!(error = %err, "reading request failed");
                    }
                    break;
                }
            };

            match incoming {
                Incoming::Dispatch {
                    header,
                    method,
                    argument,
                } => {
                    handlers.spawn(
                        handle_request(Arc::clone(&sender), header, method, argument)
                            .in_current_span(),
                    );
                }
                Incoming::Rejected(header) => {
                    send_response(&sender, &header, Box::new(Invalid)).await;
                }
            }

            while let Some(finished) = handlers.try_join_next() {
                log_join(finished);
            }
        }

        while let Some(finished) = handlers.join_next().await {
            log_join(finished);
        }
        sender.lock().await.close().await;
    }

    /// Read one header and its body.
    ///
    /// Requests that cannot be dispatched come back as
    /// [`Incoming::Rejected`] with their body consumed, so the stream stays
    /// in step. Only errors that end the connection are returned.
    async fn read_request(&self, reader: &mut ConnReader) -> Result<Incoming> {
        let mut header = reader.read_header().await?;

        let method = match self.find_service(&header.service_method) {
            Ok((_, method)) => method,
            Err(err) => {
                debug!(seq = header.seq, method = %header.service_method, error = %err, "unroutable request");
                reader.read_body(None).await?;
                header.set_error(err);
                return Ok(Incoming::Rejected(header));
            }
        };

        let mut argument = method.new_argument();
        match reader.read_body(Some(argument.target())).await {
            Ok(()) => Ok(Incoming::Dispatch {
                header,
                method,
                argument,
            }),
            Err(err) if err.is_connection_fatal() => Err(err),
            Err(err) => {
                warn!(seq = header.seq, method = %header.service_method, error = %err, "bad request argument");
                header.set_error(err);
                Ok(Incoming::Rejected(header))
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let services = self
            .inner
            .services
            .read()
            .expect("service registry lock poisoned");
        let mut names: Vec<&String> = services.keys().collect();
        names.sort_unstable();
        f.debug_struct("Server")
            .field("services", &names)
            .field("codecs", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

async fn handle_request(
    sender: Arc<Mutex<ConnWriter>>,
    mut header: Header,
    method: Arc<MethodType>,
    argument: Argument,
) {
    let reply: Reply = match method.invoke(argument) {
        Ok(reply) => reply,
        Err(err) => {
            header.set_error(err);
            Box::new(Invalid)
        }
    };
    send_response(&sender, &header, reply).await;
}

async fn send_response(sender: &Mutex<ConnWriter>, header: &Header, body: Reply) {
    let mut writer = sender.lock().await;
    match writer.write(header, &*body).await {
        Ok(()) => Metrics::record_request_served(header.is_error()),
        Err(err) => warn!(seq = header.seq, error = %err, "writing response failed"),
    }
}

fn log_join(finished: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = finished {
        warn!(error = %err, "request handler failed");
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::protocol::{CodecType, MAGIC_NUMBER, Options, write_options};

    struct Arith;

    #[derive(Serialize, Deserialize)]
    struct Args {
        a: i32,
        b: i32,
    }

    fn arith() -> Service {
        Service::new(Arith)
            .method("Sum", |_: &Arith, args: Args| Ok::<_, String>(args.a + args.b))
            .method("Div", |_: &Arith, args: Args| {
                args.a.checked_div(args.b).ok_or("divide by zero")
            })
            .method("Boom", |_: &Arith, _: Args| -> std::result::Result<i32, String> {
                panic!("handler blew up")
            })
            .build()
    }

    fn server() -> Server {
        let server = Server::new();
        server.register(arith()).unwrap();
        server
    }

    /// Serve one end of a pipe and hand back the other, already negotiated.
    async fn connect(server: &Server, codec: &str) -> (ConnReader, ConnWriter) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let served = server.clone();
        tokio::spawn(async move { served.serve_conn(far).await });
        transport::initiate(
            near,
            &Options::with_codec(codec),
            &Config::default(),
            &CodecRegistry::default(),
        )
        .await
        .unwrap()
    }

    async fn read_i32(reader: &mut ConnReader) -> (Header, Option<i32>) {
        let header = reader.read_header().await.unwrap();
        if header.is_error() {
            reader.read_body(None).await.unwrap();
            return (header, None);
        }
        let mut reply: Option<i32> = None;
        reader.read_body(Some(&mut reply)).await.unwrap();
        (header, reply)
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let server = server();
        let err = server.register(Service::new(Arith).build()).unwrap_err();
        assert!(matches!(err, Error::DuplicateService(ref name) if name == "Arith"));
        assert!(server.find_service("Arith.Sum").is_ok());
    }

    #[test]
    fn test_invalid_service_name_rejected() {
        let server = Server::new();
        let err = server
            .register(Service::with_name("a.b", Arith))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidServiceName(_)));
    }

    #[test]
    fn test_find_service_errors_are_distinct() {
        let server = server();
        let (service, method) = server.find_service("Arith.Sum").unwrap();
        assert_eq!(service.name(), "Arith");
        assert_eq!(method.name(), "Sum");

        assert!(matches!(
            server.find_service("Nope.Sum"),
            Err(Error::UnknownService(ref name)) if name == "Nope"
        ));
        assert!(matches!(
            server.find_service("Arith.Nope"),
            Err(Error::UnknownMethod(ref name)) if name == "Nope"
        ));
        assert!(matches!(
            server.find_service("ArithSum"),
            Err(Error::IllFormedServiceMethod(_))
        ));
    }

    #[tokio::test]
    async fn test_serves_request() {
        let server = server();
        let (mut reader, mut writer) = connect(&server, CodecType::BINCODE).await;

        writer
            .write(&Header::request("Arith.Sum", 1), &Args { a: 2, b: 3 })
            .await
            .unwrap();
        let (header, reply) = read_i32(&mut reader).await;
        assert_eq!(header.seq, 1);
        assert_eq!(header.service_method, "Arith.Sum");
        assert_eq!(reply, Some(5));

        let (_, method) = server.find_service("Arith.Sum").unwrap();
        assert_eq!(method.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_requests_get_error_and_connection_survives() {
        let server = server();
        let (mut reader, mut writer) = connect(&server, CodecType::BINCODE).await;

        writer
            .write(&Header::request("Nope.Sum", 1), &Args { a: 1, b: 1 })
            .await
            .unwrap();
        writer
            .write(&Header::request("Arith.Nope", 2), &Args { a: 1, b: 1 })
            .await
            .unwrap();
        writer
            .write(&Header::request("Arith.Sum", 3), &Args { a: 1, b: 1 })
            .await
            .unwrap();

        let (first, _) = read_i32(&mut reader).await;
        assert_eq!(first.error, "can't find service: Nope");
        let (second, _) = read_i32(&mut reader).await;
        assert_eq!(second.error, "can't find method: Nope");
        let (third, reply) = read_i32(&mut reader).await;
        assert_eq!((third.seq, reply), (3, Some(2)));
    }

    #[tokio::test]
    async fn test_bad_argument_gets_one_error_response() {
        let server = server();
        let (mut reader, mut writer) = connect(&server, CodecType::JSON).await;

        writer
            .write(&Header::request("Arith.Sum", 1), &"not args")
            .await
            .unwrap();
        writer
            .write(&Header::request("Arith.Sum", 2), &Args { a: 4, b: 4 })
            .await
            .unwrap();

        let (first, reply) = read_i32(&mut reader).await;
        assert_eq!(first.seq, 1);
        assert!(first.is_error());
        assert_eq!(reply, None);
        let (second, reply) = read_i32(&mut reader).await;
        assert_eq!((second.seq, reply), (2, Some(8)));
    }

    #[tokio::test]
    async fn test_panicking_handler_still_answers() {
        let server = server();
        let (mut reader, mut writer) = connect(&server, CodecType::BINCODE).await;

        writer
            .write(&Header::request("Arith.Boom", 1), &Args { a: 1, b: 1 })
            .await
            .unwrap();
        writer
            .write(&Header::request("Arith.Sum", 2), &Args { a: 1, b: 1 })
            .await
            .unwrap();

        let mut replies = Vec::new();
        for _ in 0..2 {
            let read = tokio::time::timeout(std::time::Duration::from_secs(5), read_i32(&mut reader));
            replies.push(read.await.expect("a response must arrive"));
        }
        replies.sort_by_key(|(header, _)| header.seq);
        assert_eq!(replies[0].0.error, "method Boom panicked: handler blew up");
        assert_eq!(replies[0].1, None);
        assert_eq!((replies[1].0.seq, replies[1].1), (2, Some(2)));
    }

    #[tokio::test]
    async fn test_handler_error_is_reported() {
        let server = server();
        let (mut reader, mut writer) = connect(&server, CodecType::BINCODE).await;

        writer
            .write(&Header::request("Arith.Div", 1), &Args { a: 1, b: 0 })
            .await
            .unwrap();
        let (header, reply) = read_i32(&mut reader).await;
        assert_eq!(header.error, "divide by zero");
        assert_eq!(reply, None);
    }

    /// Bytes the server sent back after a handshake with `options`.
    async fn rejected(server: &Server, options: &Options) -> Vec<u8> {
        let (mut near, far) = tokio::io::duplex(4096);
        let served = server.clone();
        let serving = tokio::spawn(async move { served.serve_conn(far).await });

        write_options(&mut near, options).await.unwrap();
        // Whatever follows must be ignored; the peer may already be gone.
        let _ = near.write_all(b"trailing request bytes").await;

        let mut rest = Vec::new();
        near.read_to_end(&mut rest).await.unwrap();
        serving.await.unwrap();
        rest
    }

    #[tokio::test]
    async fn test_bad_magic_gets_no_response() {
        let server = server();
        let options = Options {
            magic_number: MAGIC_NUMBER ^ 1,
            codec_type: CodecType::bincode(),
        };
        assert!(rejected(&server, &options).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_codec_gets_no_response() {
        let server = server();
        let options = Options::with_codec("application/gob");
        assert!(rejected(&server, &options).await.is_empty());
    }
}
