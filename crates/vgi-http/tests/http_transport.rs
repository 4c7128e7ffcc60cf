//! HTTP transport round trips against an in-process server.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};

use vgi_core::{
    unary_fn, BoxFuture, Method, OutputCollector, Protocol, RpcContext, StreamHandler,
};
use vgi_http::{HttpClient, HttpServerConfig, HttpService};
use vgi_ipc::IpcBytesReader;
use vgi_token::StreamState;
use vgi_types::{keys, Row, RpcError};
use vgi_wire::{build_request, classify, BatchKind};

fn f64_fields(names: &[&str]) -> SchemaRef {
    SchemaRef::new(Schema::new(
        names
            .iter()
            .map(|n| Field::new(*n, DataType::Float64, false))
            .collect::<Vec<_>>(),
    ))
}

struct Nums;

impl StreamHandler for Nums {
    fn init(&self, params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move {
            let mut state = StreamState::new();
            state.set("next", 0i64);
            state.set("limit", params.get_i64("limit")?);
            Ok(state)
        })
    }

    fn produce<'a>(
        &'a self,
        state: &'a mut StreamState,
        out: &'a mut OutputCollector,
    ) -> BoxFuture<'a, Result<(), RpcError>> {
        Box::pin(async move {
            let next = state.get_i64("next").unwrap_or(0);
            let limit = state.get_i64("limit").unwrap_or(0);
            out.emit_rows(&[Row::new().with("n", next)])?;
            if next + 1 >= limit {
                out.finish()?;
            }
            state.set("next", next + 1);
            Ok(())
        })
    }
}

struct Boom;

impl StreamHandler for Boom {
    fn init(&self, _params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move {
            let mut state = StreamState::new();
            state.set("emitted", 0i64);
            Ok(state)
        })
    }

    fn produce<'a>(
        &'a self,
        state: &'a mut StreamState,
        out: &'a mut OutputCollector,
    ) -> BoxFuture<'a, Result<(), RpcError>> {
        Box::pin(async move {
            let emitted = state.get_i64("emitted").unwrap_or(0);
            if emitted >= 2 {
                return Err(RpcError::handler("intentional error after 2 batches"));
            }
            out.emit_rows(&[Row::new().with("n", emitted)])?;
            state.set("emitted", emitted + 1);
            Ok(())
        })
    }
}

struct FailInit;

impl StreamHandler for FailInit {
    fn init(&self, _params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move { Err(RpcError::handler("intentional init error")) })
    }
}

struct Flex;

impl StreamHandler for Flex {
    fn init(&self, _params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move {
            let mut state = StreamState::new();
            state.set("next", 0i64);
            state.set_mode_override(vgi_types::StreamMode::Producer);
            Ok(state)
        })
    }

    fn produce<'a>(
        &'a self,
        state: &'a mut StreamState,
        out: &'a mut OutputCollector,
    ) -> BoxFuture<'a, Result<(), RpcError>> {
        Box::pin(async move {
            let next = state.get_i64("next").unwrap_or(0);
            out.emit_rows(&[Row::new().with("value", next as f64)])?;
            if next >= 2 {
                out.finish()?;
            }
            state.set("next", next + 1);
            Ok(())
        })
    }
}

struct Accumulate;

impl StreamHandler for Accumulate {
    fn init(&self, _params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move {
            let mut state = StreamState::new();
            state.set("running_sum", 0.0f64);
            state.set("exchange_count", 0i64);
            Ok(state)
        })
    }

    fn exchange<'a>(
        &'a self,
        state: &'a mut StreamState,
        input: &'a vgi_ipc::AnnotatedBatch,
        out: &'a mut OutputCollector,
    ) -> BoxFuture<'a, Result<(), RpcError>> {
        Box::pin(async move {
            let mut sum = state.get_f64("running_sum").unwrap_or(0.0);
            for row in vgi_wire::batch_rows(&input.batch)? {
                sum += row.get_f64("value")?;
            }
            let count = state.get_i64("exchange_count").unwrap_or(0) + 1;
            state.set("running_sum", sum);
            state.set("exchange_count", count);
            out.emit_rows(&[Row::new()
                .with("running_sum", sum)
                .with("exchange_count", count)])?;
            Ok(())
        })
    }
}

fn test_protocol() -> Arc<Protocol> {
    let mut protocol = Protocol::new("http-tests");
    protocol
        .register(
            "add",
            Method::unary(
                f64_fields(&["a", "b"]),
                f64_fields(&["result"]),
                unary_fn(|params: Row, _ctx| async move {
                    Ok(Row::new().with("result", params.get_f64("a")? + params.get_f64("b")?))
                }),
            ),
        )
        .unwrap();
    let int_out = SchemaRef::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
    protocol
        .register(
            "nums",
            Method::producer(
                SchemaRef::new(Schema::new(vec![Field::new(
                    "limit",
                    DataType::Int64,
                    false,
                )])),
                int_out.clone(),
                Arc::new(Nums),
            ),
        )
        .unwrap();
    protocol
        .register(
            "boom",
            Method::producer(SchemaRef::new(Schema::empty()), int_out.clone(), Arc::new(Boom)),
        )
        .unwrap();
    protocol
        .register(
            "fail_init",
            Method::producer(SchemaRef::new(Schema::empty()), int_out, Arc::new(FailInit)),
        )
        .unwrap();
    // Registered as an exchange; init flips it to a producer.
    protocol
        .register(
            "flex",
            Method::exchange(
                SchemaRef::new(Schema::empty()),
                f64_fields(&["value"]),
                f64_fields(&["value"]),
                Arc::new(Flex),
            ),
        )
        .unwrap();
    protocol
        .register(
            "accumulate",
            Method::exchange(
                SchemaRef::new(Schema::empty()),
                f64_fields(&["value"]),
                SchemaRef::new(Schema::new(vec![
                    Field::new("running_sum", DataType::Float64, false),
                    Field::new("exchange_count", DataType::Int64, false),
                ])),
                Arc::new(Accumulate),
            ),
        )
        .unwrap();
    Arc::new(protocol)
}

async fn start(config: HttpServerConfig) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = HttpService::new(test_protocol(), config);
    tokio::spawn(service.serve(listener));
    format!("http://{addr}")
}

#[tokio::test]
async fn unary_add_round_trips() {
    let url = start(HttpServerConfig::default()).await;
    let client = HttpClient::new(url);
    let result = client
        .call("add", Row::new().with("a", 3.0f64).with("b", 4.0f64))
        .await
        .unwrap();
    assert_eq!(result.get_f64("result").unwrap(), 7.0);
}

#[tokio::test]
async fn compressed_round_trips_match_identity() {
    let url = start(HttpServerConfig::default().with_compression_level(3)).await;
    let client = HttpClient::new(url).with_compression_level(3);
    let result = client
        .call("add", Row::new().with("a", 20.0f64).with("b", 22.0f64))
        .await
        .unwrap();
    assert_eq!(result.get_f64("result").unwrap(), 42.0);
}

#[tokio::test]
async fn producer_completes_within_budget() {
    let url = start(HttpServerConfig::default()).await;
    let client = HttpClient::new(url);
    let mut session = client
        .stream("nums", Row::new().with("limit", 5i64))
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(rows) = session.next_rows().await.unwrap() {
        for row in rows {
            seen.push(row.get_i64("n").unwrap());
        }
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn byte_budget_forces_continuation_tokens() {
    // A one-byte budget caps every round trip at a single data batch, so
    // the run only completes if continuation tokens resume correctly.
    let url = start(HttpServerConfig::default().with_response_byte_budget(1)).await;
    let client = HttpClient::new(url);
    let mut session = client
        .stream("nums", Row::new().with("limit", 7i64))
        .await
        .unwrap();
    let mut batches = 0usize;
    let mut seen = Vec::new();
    while let Some(rows) = session.next_rows().await.unwrap() {
        batches += 1;
        for row in rows {
            seen.push(row.get_i64("n").unwrap());
        }
    }
    assert_eq!(seen, (0..7).collect::<Vec<_>>());
    assert!(batches >= 7, "expected one batch per round trip");
}

#[tokio::test]
async fn exchange_accumulates_state_across_round_trips() {
    let url = start(HttpServerConfig::default()).await;
    let client = HttpClient::new(url);
    let mut session = client.stream("accumulate", Row::new()).await.unwrap();

    for (input, want_sum, want_count) in [(1.0, 1.0, 1), (2.0, 3.0, 2), (3.0, 6.0, 3)] {
        let rows = session
            .exchange(&[Row::new().with("value", input)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_f64("running_sum").unwrap(), want_sum);
        assert_eq!(rows[0].get_i64("exchange_count").unwrap(), want_count);
    }
}

#[tokio::test]
async fn mode_override_runs_the_producer_loop_on_init() {
    let url = start(HttpServerConfig::default()).await;
    let client = HttpClient::new(url);
    let mut session = client.stream("flex", Row::new()).await.unwrap();
    let mut seen = Vec::new();
    while let Some(rows) = session.next_rows().await.unwrap() {
        for row in rows {
            seen.push(row.get_f64("value").unwrap());
        }
    }
    assert_eq!(seen, vec![0.0, 1.0, 2.0]);
}

#[tokio::test]
async fn exchange_schema_lock_fails_client_side() {
    let url = start(HttpServerConfig::default()).await;
    let client = HttpClient::new(url);
    let mut session = client.stream("accumulate", Row::new()).await.unwrap();
    session
        .exchange(&[Row::new().with("value", 1.0f64)])
        .await
        .unwrap();

    let err = session
        .exchange(&[Row::new().with("other", 1.0f64)])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)));
    assert!(err.to_string().contains("schema changed"), "{err}");

    // The rejection never hit the wire; the token is still valid.
    let rows = session
        .exchange(&[Row::new().with("value", 2.0f64)])
        .await
        .unwrap();
    assert_eq!(rows[0].get_f64("running_sum").unwrap(), 3.0);
}

#[tokio::test]
async fn mid_stream_error_is_deferred_to_iteration() {
    let url = start(HttpServerConfig::default()).await;
    let client = HttpClient::new(url);
    let mut session = client.stream("boom", Row::new()).await.unwrap();

    let mut data_batches = 0;
    let err = loop {
        match session.next_rows().await {
            Ok(Some(_)) => data_batches += 1,
            Ok(None) => panic!("expected a deferred error"),
            Err(e) => break e,
        }
    };
    assert_eq!(data_batches, 2);
    let RpcError::Remote(remote) = err else {
        panic!("expected remote error");
    };
    assert_eq!(remote.exception_message, "intentional error after 2 batches");
}

#[tokio::test]
async fn init_error_raises_at_stream_open() {
    let url = start(HttpServerConfig::default()).await;
    let client = HttpClient::new(url);
    let err = client.stream("fail_init", Row::new()).await.unwrap_err();
    let RpcError::Remote(remote) = err else {
        panic!("expected remote error");
    };
    assert_eq!(remote.exception_message, "intentional init error");
}

#[tokio::test]
async fn unknown_method_is_404_with_an_error_batch() {
    let url = start(HttpServerConfig::default()).await;
    let client = HttpClient::new(url);
    let err = client.call("missing", Row::new()).await.unwrap_err();
    let RpcError::Remote(remote) = err else {
        panic!("expected remote error, got other kind");
    };
    assert_eq!(remote.exception_type, "ProtocolError");
    assert!(remote.exception_message.contains("add"), "{remote}");
}

#[tokio::test]
async fn tampered_token_is_rejected_with_400() {
    let url = start(HttpServerConfig::default()).await;

    // Drive the wire by hand: init an exchange, grab the token, flip one
    // byte of it, and resubmit.
    let schema = SchemaRef::new(Schema::empty());
    let request = build_request(&schema, &Row::new(), "accumulate", None).unwrap();
    let body = vgi_ipc::encode_stream(schema, &[request]).unwrap();

    let http = reqwest::Client::new();
    let response = http
        .post(format!("{url}/accumulate/init"))
        .header("content-type", keys::ARROW_STREAM_CONTENT_TYPE)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let bytes = response.bytes().await.unwrap();
    let mut reader = IpcBytesReader::new(&bytes);
    let stream = reader.read_stream().unwrap();
    let token = match classify(&stream.batches[0]) {
        BatchKind::Continuation(token) => token,
        other => panic!("expected a continuation batch, got {other:?}"),
    };

    let mut tampered = token.into_bytes();
    let mid = tampered.len() / 2;
    tampered[mid] ^= 0x01;
    let tampered = String::from_utf8(tampered).unwrap();

    let input_schema = f64_fields(&["value"]);
    let batch = vgi_wire::build_batch(&input_schema, &[Row::new().with("value", 1.0f64)]).unwrap();
    let mut metadata = vgi_ipc::BatchMetadata::new();
    metadata.insert(keys::STREAM_STATE.to_owned(), tampered);
    let body = vgi_ipc::encode_stream(
        input_schema,
        &[vgi_ipc::AnnotatedBatch::with_metadata(batch, metadata)],
    )
    .unwrap();

    let response = http
        .post(format!("{url}/accumulate/exchange"))
        .header("content-type", keys::ARROW_STREAM_CONTENT_TYPE)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let bytes = response.bytes().await.unwrap();
    let mut reader = IpcBytesReader::new(&bytes);
    let stream = reader.read_stream().unwrap();
    match classify(&stream.batches[0]) {
        BatchKind::Error(remote) => {
            assert!(
                remote.exception_message.contains("HMAC verification failed")
                    || remote.exception_message.contains("base64"),
                "{remote}"
            );
        }
        other => panic!("expected an error batch, got {other:?}"),
    }
}

#[tokio::test]
async fn policy_statuses_are_enforced() {
    let url = start(
        HttpServerConfig::default()
            .with_max_request_bytes(256)
            .with_cors_origin("https://app.example"),
    )
    .await;
    let http = reqwest::Client::new();

    // Wrong verb.
    let response = http.get(format!("{url}/add")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 405);

    // Wrong content type.
    let response = http
        .post(format!("{url}/add"))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 415);

    // Oversized request.
    let response = http
        .post(format!("{url}/add"))
        .header("content-type", keys::ARROW_STREAM_CONTENT_TYPE)
        .body(vec![0u8; 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 413);

    // Capabilities preflight advertises the request cap.
    let response = http
        .request(reqwest::Method::OPTIONS, format!("{url}/__capabilities__"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);
    assert_eq!(
        response
            .headers()
            .get("VGI-Max-Request-Bytes")
            .and_then(|v| v.to_str().ok()),
        Some("256")
    );

    // CORS preflight and response headers.
    let response = http
        .request(reqwest::Method::OPTIONS, format!("{url}/add"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("https://app.example")
    );
}
