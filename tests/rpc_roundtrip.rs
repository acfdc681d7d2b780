use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wirecall::protocol::write_options;
use wirecall::transport::{self, Config};
use wirecall::{
    Client, CodecRegistry, CodecType, Error, MAGIC_NUMBER, Options, Server, Service,
    metrics_snapshot,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Inventory {
    owner: String,
    items: BTreeMap<String, u32>,
    tags: Vec<String>,
}

struct Arith;

struct Store;

fn arith() -> Service {
    Service::new(Arith)
        .method("Sum", |_: &Arith, args: Args| Ok::<_, String>(args.num1 + args.num2))
        .method("Div", |_: &Arith, args: Args| {
            args.num1.checked_div(args.num2).ok_or("divide by zero")
        })
        .method("Sleep", |_: &Arith, millis: u64| {
            std::thread::sleep(Duration::from_millis(millis));
            Ok::<_, String>(millis)
        })
        .method("Boom", |_: &Arith, _: Args| -> Result<i64, String> {
            panic!("out of cheese")
        })
        .build()
}

fn store() -> Service {
    Service::new(Store)
        .method("Echo", |_: &Store, inventory: Inventory| {
            Ok::<_, String>(inventory)
        })
        .build()
}

async fn start(server: Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move { server.accept(listener).await });
    addr
}

async fn start_arith() -> SocketAddr {
    let server = Server::new();
    server.register(arith()).expect("register Arith");
    server.register(store()).expect("register Store");
    start(server).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_get_their_own_reply() {
    let addr = start_arith().await;
    let client = Arc::new(Client::dial(addr, None).await.expect("dial"));

    let mut tasks = Vec::new();
    for i in 0..100_i64 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let args = Args {
                num1: i,
                num2: i * i,
            };
            let sum: i64 = client.call("Arith.Sum", &args).await.expect("call");
            (i, sum)
        }));
    }

    for task in tasks {
        let (i, sum) = task.await.expect("task");
        assert_eq!(sum, i + i * i);
    }
}

#[tokio::test]
async fn duplicate_service_keeps_first_registration() {
    let server = Server::new();
    server.register(arith()).expect("first registration");

    let second = Service::new(Arith)
        .method("Sum", |_: &Arith, _: Args| Ok::<_, String>(-1_i64))
        .build();
    let err = server.register(second).expect_err("duplicate must fail");
    assert_eq!(err.to_string(), "service already defined: Arith");

    let addr = start(server).await;
    let client = Client::dial(addr, None).await.expect("dial");
    let sum: i64 = client
        .call("Arith.Sum", &Args { num1: 2, num2: 3 })
        .await
        .expect("call");
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn unknown_service_and_method_are_distinct() {
    let addr = start_arith().await;
    let client = Client::dial(addr, None).await.expect("dial");
    let args = Args { num1: 1, num2: 1 };

    let service = client
        .call::<_, i64>("Nope.Sum", &args)
        .await
        .expect_err("unknown service");
    let method = client
        .call::<_, i64>("Arith.Nope", &args)
        .await
        .expect_err("unknown method");

    assert_eq!(service.to_string(), "can't find service: Nope");
    assert_eq!(method.to_string(), "can't find method: Nope");
    assert!(client.is_available());
}

#[tokio::test]
async fn remote_error_reaches_caller() {
    let addr = start_arith().await;
    let client = Client::dial(addr, None).await.expect("dial");

    let err = client
        .call::<_, i64>("Arith.Div", &Args { num1: 1, num2: 0 })
        .await
        .expect_err("division by zero");
    assert!(matches!(err, Error::Remote(ref text) if text == "divide by zero"));

    let quotient: i64 = client
        .call("Arith.Div", &Args { num1: 9, num2: 3 })
        .await
        .expect("call");
    assert_eq!(quotient, 3);
}

#[tokio::test]
async fn panicking_handler_fails_only_its_call() {
    let addr = start_arith().await;
    let client = Client::dial(addr, None).await.expect("dial");

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        client.call::<_, i64>("Arith.Boom", &Args { num1: 1, num2: 2 }),
    )
    .await
    .expect("caller must not hang")
    .expect_err("handler panicked");
    assert!(matches!(err, Error::Remote(ref text) if text.contains("out of cheese")));

    let sum: i64 = client
        .call("Arith.Sum", &Args { num1: 1, num2: 2 })
        .await
        .expect("call");
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn bad_argument_gets_error_and_connection_continues() {
    let addr = start_arith().await;
    let stream = TcpStream::connect(addr).await.expect("connect");
    let client = Client::new(
        stream,
        Options::with_codec(CodecType::JSON),
        Config::default(),
        &CodecRegistry::default(),
    )
    .await
    .expect("client");

    let err = client
        .call::<_, i64>("Arith.Sum", &"not an Args")
        .await
        .expect_err("argument must not decode");
    assert!(matches!(err, Error::Remote(_)));

    let sum: i64 = client
        .call("Arith.Sum", &Args { num1: 20, num2: 22 })
        .await
        .expect("call");
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn every_codec_round_trips_structured_values() {
    let addr = start_arith().await;
    let inventory = Inventory {
        owner: "ops".to_string(),
        items: BTreeMap::from([("bolts".to_string(), 12), ("nuts".to_string(), 0)]),
        tags: Vec::new(),
    };

    for codec in [CodecType::BINCODE, CodecType::JSON] {
        let client = Client::dial(addr, Some(Options::with_codec(codec)))
            .await
            .expect("dial");
        let echoed: Inventory = client.call("Store.Echo", &inventory).await.expect("call");
        assert_eq!(echoed, inventory, "codec {codec}");
    }
}

#[tokio::test]
async fn severed_connection_fails_pending_calls() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let client = Client::new(
        near,
        Options::default(),
        Config::default(),
        &CodecRegistry::default(),
    )
    .await
    .expect("client");

    let (_, mut reader, writer) =
        transport::respond(far, &Config::default(), &CodecRegistry::default())
            .await
            .expect("negotiate");

    let (done, mut completed) = client.done_channel::<i64>();
    for i in 0..8 {
        client
            .go("Arith.Sum", &Args { num1: i, num2: i }, done.clone())
            .await;
    }
    for _ in 0..8 {
        reader.read_header().await.expect("header");
        reader.read_body(None).await.expect("body");
    }
    drop((reader, writer));

    for _ in 0..8 {
        let call = tokio::time::timeout(Duration::from_secs(5), completed.recv())
            .await
            .expect("completion must not hang")
            .expect("completion");
        assert!(matches!(call.error, Some(Error::ConnectionLost(_))));
    }
    assert!(!client.is_available());
}

async fn server_reply_to_handshake(options: &Options) -> Vec<u8> {
    let addr = start_arith().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    write_options(&mut stream, options).await.expect("options");
    let _ = stream.write_all(b"request bytes that must be ignored").await;

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("server must close the connection")
        .ok();
    rest
}

#[tokio::test]
async fn wrong_magic_gets_zero_responses() {
    let before = metrics_snapshot();
    let options = Options {
        magic_number: MAGIC_NUMBER + 1,
        codec_type: CodecType::bincode(),
    };
    assert!(server_reply_to_handshake(&options).await.is_empty());
    assert!(metrics_snapshot().rejected_handshakes > before.rejected_handshakes);
}

#[tokio::test]
async fn unknown_codec_gets_zero_responses() {
    let options = Options::with_codec("application/gob");
    assert!(server_reply_to_handshake(&options).await.is_empty());
}

#[tokio::test]
async fn unknown_codec_is_refused_locally() {
    let addr = start_arith().await;
    let err = Client::dial(addr, Some(Options::with_codec("application/gob")))
        .await
        .expect_err("codec is not registered");
    assert!(matches!(err, Error::UnknownCodec(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_is_layered_over_go() {
    let addr = start_arith().await;
    let client = Client::dial(addr, None).await.expect("dial");
    let (done, mut completed) = client.done_channel::<u64>();

    client.go("Arith.Sleep", &300_u64, done).await;
    let waited = tokio::time::timeout(Duration::from_millis(20), completed.recv()).await;
    assert!(waited.is_err(), "reply cannot arrive that early");

    // The call stays pending and still completes once the reply lands.
    let call = completed.recv().await.expect("completion");
    assert_eq!(call.reply, Some(300));
}

#[tokio::test]
async fn closed_client_refuses_new_calls() {
    let addr = start_arith().await;
    let client = Client::dial(addr, None).await.expect("dial");
    client.close().await.expect("first close");

    assert!(!client.is_available());
    let err = client
        .call::<_, i64>("Arith.Sum", &Args { num1: 1, num2: 1 })
        .await
        .expect_err("closed");
    assert!(matches!(err, Error::Shutdown));
    assert!(matches!(client.close().await, Err(Error::Shutdown)));
}
