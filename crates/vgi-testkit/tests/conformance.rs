//! The conformance suite, run against every transport: an in-memory
//! pipe, a spawned pipe worker, plain HTTP, and HTTP with zstd.

use std::sync::{Arc, Mutex};

use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};
use tokio::process::{ChildStdin, ChildStdout, Command};

use vgi_http::{HttpClient, HttpServerConfig, HttpService, HttpSession};
use vgi_pipe::{serve, PipeClient, PipeServerConfig, PipeSession};
use vgi_testkit::conformance_protocol;
use vgi_types::{LogRecord, Row, RpcError, Value};

type MemPipeClient = PipeClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;
type ProcPipeClient = PipeClient<ChildStdout, ChildStdin>;

#[derive(Clone, Copy, Debug)]
enum Transport {
    PipeMem,
    PipeProc,
    Http,
    HttpZstd,
}

const ALL_TRANSPORTS: [Transport; 4] = [
    Transport::PipeMem,
    Transport::PipeProc,
    Transport::Http,
    Transport::HttpZstd,
];

enum Conn {
    PipeMem(MemPipeClient),
    PipeProc(ProcPipeClient),
    Http(HttpClient),
}

enum Session {
    PipeMem(PipeSession<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>),
    PipeProc(PipeSession<ChildStdout, ChildStdin>),
    Http(HttpSession),
}

type Logs = Arc<Mutex<Vec<LogRecord>>>;

async fn connect(transport: Transport) -> (Conn, Logs) {
    let logs: Logs = Arc::new(Mutex::new(Vec::new()));
    let sink = logs.clone();
    let on_log = move |record: LogRecord| sink.lock().unwrap().push(record);

    let conn = match transport {
        Transport::PipeMem => {
            let (client_end, server_end) = duplex(256 * 1024);
            let (server_read, server_write) = split(server_end);
            let (client_read, client_write) = split(client_end);
            tokio::spawn(serve(
                Arc::new(conformance_protocol()),
                server_read,
                server_write,
                PipeServerConfig::default(),
            ));
            Conn::PipeMem(PipeClient::new(client_read, client_write).with_on_log(on_log))
        }
        Transport::PipeProc => {
            let command = Command::new(env!("CARGO_BIN_EXE_conformance-pipe"));
            Conn::PipeProc(
                PipeClient::subprocess(command)
                    .expect("spawn pipe worker")
                    .with_on_log(on_log),
            )
        }
        Transport::Http | Transport::HttpZstd => {
            let mut config = HttpServerConfig::default();
            if matches!(transport, Transport::HttpZstd) {
                config = config.with_compression_level(3);
            }
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            let addr = listener.local_addr().expect("local addr");
            let service = HttpService::new(Arc::new(conformance_protocol()), config);
            tokio::spawn(service.serve(listener));
            let mut client = HttpClient::new(format!("http://{addr}")).with_on_log(on_log);
            if matches!(transport, Transport::HttpZstd) {
                client = client.with_compression_level(3);
            }
            Conn::Http(client)
        }
    };
    (conn, logs)
}

impl Conn {
    async fn call(&self, method: &str, params: Row) -> Result<Row, RpcError> {
        match self {
            Conn::PipeMem(c) => c.call(method, params).await,
            Conn::PipeProc(c) => c.call(method, params).await,
            Conn::Http(c) => c.call(method, params).await,
        }
    }

    async fn stream(&self, method: &str, params: Row) -> Result<Session, RpcError> {
        match self {
            Conn::PipeMem(c) => c.stream(method, params).await.map(Session::PipeMem),
            Conn::PipeProc(c) => c.stream(method, params).await.map(Session::PipeProc),
            Conn::Http(c) => c.stream(method, params).await.map(Session::Http),
        }
    }
}

impl Session {
    fn header(&self) -> Option<&Row> {
        match self {
            Session::PipeMem(s) => s.header(),
            Session::PipeProc(s) => s.header(),
            Session::Http(s) => s.header(),
        }
    }

    async fn next_rows(&mut self) -> Result<Option<Vec<Row>>, RpcError> {
        match self {
            Session::PipeMem(s) => s.next_rows().await,
            Session::PipeProc(s) => s.next_rows().await,
            Session::Http(s) => s.next_rows().await,
        }
    }

    async fn exchange(&mut self, rows: &[Row]) -> Result<Vec<Row>, RpcError> {
        match self {
            Session::PipeMem(s) => s.exchange(rows).await,
            Session::PipeProc(s) => s.exchange(rows).await,
            Session::Http(s) => s.exchange(rows).await,
        }
    }

    async fn close(self) {
        match self {
            Session::PipeMem(s) => s.close().await,
            Session::PipeProc(s) => s.close().await,
            Session::Http(s) => s.close().await,
        }
    }
}

fn expect_remote(err: RpcError) -> vgi_types::RemoteError {
    match err {
        RpcError::Remote(remote) => remote,
        other => panic!("expected a remote error, got {other}"),
    }
}

#[tokio::test]
async fn unary_add() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        // Integer inputs widen into the declared float columns.
        let result = conn
            .call("add", Row::new().with("a", 3i64).with("b", 4i64))
            .await
            .unwrap();
        assert_eq!(result.get_f64("result").unwrap(), 7.0, "{transport:?}");
    }
}

#[tokio::test]
async fn unary_defaults_apply_client_side() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        let result = conn.call("greet", Row::new()).await.unwrap();
        assert_eq!(result.get_str("greeting").unwrap(), "hello, world");

        let result = conn
            .call("greet", Row::new().with("name", "vgi"))
            .await
            .unwrap();
        assert_eq!(result.get_str("greeting").unwrap(), "hello, vgi");
    }
}

#[tokio::test]
async fn unary_echo_preserves_exotic_values() {
    let samples: Vec<Row> = vec![
        Row::new()
            .with("f", f64::NAN)
            .with("i", i64::MIN)
            .with("s", "héllo 🦀 \u{5b57}\u{4f53} \u{5e9}\u{5dc}\u{5d5}\u{5dd}")
            .with("b", vec![0u8, 1, 0, 255])
            .with("flag", true),
        Row::new()
            .with("f", f64::NEG_INFINITY)
            .with("i", i64::MAX)
            .with("s", "")
            .with("b", Vec::<u8>::new())
            .with("flag", false),
        Row::new()
            .with("f", -0.0f64)
            .with("i", 0i64)
            .with("s", "plain")
            .with("b", vec![0u8])
            .with("flag", true),
    ];

    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        for sample in &samples {
            let result = conn.call("echo", sample.clone()).await.unwrap();
            for (name, value) in sample.iter() {
                let got = result.get(name).unwrap();
                assert!(
                    got.same_value(value),
                    "{transport:?}: field {name}: sent {value:?}, got {got:?}"
                );
            }
        }
    }
}

#[tokio::test]
async fn unary_logs_reach_the_callback() {
    for transport in ALL_TRANSPORTS {
        let (conn, logs) = connect(transport).await;
        let result = conn
            .call("log_then_add", Row::new().with("a", 3.0f64).with("b", 4.0f64))
            .await
            .unwrap();
        assert_eq!(result.get_f64("result").unwrap(), 7.0);

        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 2, "{transport:?}");
        assert_eq!(logs[0].level, "INFO");
        assert_eq!(logs[0].message, "adding 3 and 4");
        assert_eq!(logs[0].extra.as_ref().unwrap()["operands"][0], 3.0);
        assert_eq!(logs[1].level, "DEBUG");
    }
}

#[tokio::test]
async fn unary_failure_surfaces_as_remote_error() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        let err = conn
            .call("fail", Row::new().with("message", "on purpose"))
            .await
            .unwrap_err();
        let remote = expect_remote(err);
        assert_eq!(remote.exception_type, "HandlerError");
        assert_eq!(remote.exception_message, "on purpose");
    }
}

#[tokio::test]
async fn producer_count_is_complete_and_monotonic() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        let mut session = conn
            .stream(
                "count",
                Row::new().with("limit", 100_000i64).with("batch_size", 1000i64),
            )
            .await
            .unwrap();

        let mut expected = 0i64;
        let mut checked = Vec::new();
        while let Some(rows) = session.next_rows().await.unwrap() {
            for row in rows {
                let n = row.get_i64("n").unwrap();
                assert_eq!(n, expected, "{transport:?}");
                if n == 999 || n == 99_999 {
                    checked.push((n, row.get_i64("n_squared").unwrap()));
                }
                expected += 1;
            }
        }
        assert_eq!(expected, 100_000, "{transport:?}");
        assert_eq!(checked, vec![(999, 998_001), (99_999, 9_999_800_001)]);
    }
}

#[tokio::test]
async fn producer_header_arrives_before_data() {
    for transport in ALL_TRANSPORTS {
        let (conn, logs) = connect(transport).await;
        let mut session = conn
            .stream("count_with_header", Row::new().with("limit", 3i64))
            .await
            .unwrap();

        let header = session.header().expect("header row");
        assert_eq!(header.get_i32("limit_echo").unwrap(), 3);
        assert!(
            logs.lock().unwrap().iter().any(|l| l.message.contains("starting")),
            "{transport:?}"
        );

        let mut seen = Vec::new();
        while let Some(rows) = session.next_rows().await.unwrap() {
            for row in rows {
                seen.push(row.get_i32("n").unwrap());
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }
}

#[tokio::test]
async fn producer_error_mid_stream_after_exact_batches() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        let mut session = conn
            .stream(
                "produce_error_mid_stream",
                Row::new().with("emit_before_error", 2i64),
            )
            .await
            .unwrap();

        let mut data_batches = 0;
        let err = loop {
            match session.next_rows().await {
                Ok(Some(_)) => data_batches += 1,
                Ok(None) => panic!("{transport:?}: stream ended without the error"),
                Err(e) => break e,
            }
        };
        assert_eq!(data_batches, 2, "{transport:?}");
        let remote = expect_remote(err);
        assert_eq!(remote.exception_message, "intentional error after 2 batches");
    }
}

#[tokio::test]
async fn producer_init_error_reaches_the_caller() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        // HTTP raises at stream open; the pipe defers to the first pull.
        let err = match conn.stream("produce_error_on_init", Row::new()).await {
            Err(e) => e,
            Ok(mut session) => session.next_rows().await.expect_err("expected init error"),
        };
        let remote = expect_remote(err);
        assert_eq!(remote.exception_message, "intentional init error");
    }
}

#[tokio::test]
async fn exchange_scale() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        let mut session = conn
            .stream("scale", Row::new().with("factor", 2.0f64))
            .await
            .unwrap();
        let out = session
            .exchange(&[
                Row::new().with("value", 5.0f64),
                Row::new().with("value", 10.0f64),
            ])
            .await
            .unwrap();
        let values: Vec<f64> = out.iter().map(|r| r.get_f64("value").unwrap()).collect();
        assert_eq!(values, vec![10.0, 20.0], "{transport:?}");
        session.close().await;
    }
}

#[tokio::test]
async fn exchange_accumulate_keeps_state_across_rounds() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        let mut session = conn.stream("accumulate", Row::new()).await.unwrap();

        for (input, want_sum, want_count) in [(1.0, 1.0, 1i64), (2.0, 3.0, 2), (3.0, 6.0, 3)] {
            let rows = session
                .exchange(&[Row::new().with("value", input)])
                .await
                .unwrap();
            assert_eq!(rows.len(), 1, "{transport:?}");
            assert_eq!(rows[0].get_f64("running_sum").unwrap(), want_sum);
            assert_eq!(rows[0].get_i64("exchange_count").unwrap(), want_count);
        }
        session.close().await;
    }
}

#[tokio::test]
async fn exchange_init_error_reaches_the_caller() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        let err = match conn.stream("exchange_error_on_init", Row::new()).await {
            Err(e) => e,
            Ok(mut session) => session
                .exchange(&[Row::new().with("value", 1.0f64)])
                .await
                .expect_err("expected init error"),
        };
        let remote = expect_remote(err);
        assert_eq!(remote.exception_message, "intentional exchange init error");
    }
}

#[tokio::test]
async fn transport_survives_an_abandoned_stream() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        let mut session = conn
            .stream(
                "count",
                Row::new().with("limit", 100_000i64).with("batch_size", 10i64),
            )
            .await
            .unwrap();
        assert!(session.next_rows().await.unwrap().is_some());
        session.close().await;

        let result = conn
            .call("add", Row::new().with("a", 1.0f64).with("b", 2.0f64))
            .await
            .unwrap();
        assert_eq!(result.get_f64("result").unwrap(), 3.0, "{transport:?}");
    }
}

#[tokio::test]
async fn describe_matches_the_registered_protocol() {
    for transport in ALL_TRANSPORTS {
        let (conn, _) = connect(transport).await;
        let info = match &conn {
            Conn::PipeMem(c) => c.describe().await.unwrap(),
            Conn::PipeProc(c) => c.describe().await.unwrap(),
            Conn::Http(c) => c.describe().await.unwrap(),
        };
        assert_eq!(info.protocol_name, "conformance");
        assert_eq!(info.methods.len(), 12);

        let names: Vec<_> = info.methods.keys().cloned().collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted, "describe rows are sorted by name");

        let add = &info.methods["add"];
        assert_eq!(add.method_type, "unary");
        assert!(add.has_return);
        let count = &info.methods["count"];
        assert_eq!(count.method_type, "stream");
        assert!(!count.has_return);
        assert!(info.methods["count_with_header"].has_header);
        assert_eq!(
            info.methods["greet"].defaults["name"],
            serde_json::json!("world")
        );
    }
}

#[tokio::test]
async fn null_first_exchange_input_is_a_contract_violation() {
    // A null sample in the first exchange row infers a nullable string
    // column; the handler's typed read then rejects it.
    for transport in [Transport::PipeMem, Transport::Http] {
        let (conn, _) = connect(transport).await;
        let mut session = conn
            .stream("scale", Row::new().with("factor", 2.0f64))
            .await
            .unwrap();
        let err = session
            .exchange(&[Row::new().with("value", Value::Null)])
            .await
            .unwrap_err();
        let remote = expect_remote(err);
        assert_eq!(remote.exception_type, "ContractError", "{transport:?}");
    }
}

#[tokio::test]
async fn http_worker_announces_its_port() {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut child = Command::new(env!("CARGO_BIN_EXE_conformance-http"))
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .expect("spawn http worker");
    let stdout = child.stdout.take().expect("captured stdout");
    let mut lines = BufReader::new(stdout).lines();
    let line = lines
        .next_line()
        .await
        .expect("read port line")
        .expect("port line present");
    let port: u16 = line
        .strip_prefix("PORT:")
        .expect("PORT: prefix")
        .parse()
        .expect("port number");

    let client = HttpClient::new(format!("http://127.0.0.1:{port}"));
    let result = client
        .call("add", Row::new().with("a", 19.0f64).with("b", 23.0f64))
        .await
        .unwrap();
    assert_eq!(result.get_f64("result").unwrap(), 42.0);

    child.kill().await.ok();
}
