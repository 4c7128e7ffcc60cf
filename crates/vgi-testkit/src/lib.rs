//! The conformance protocol.
//!
//! A fixed multi-method protocol exercising every dispatch path: unary
//! calls with logs, defaults, and failures; producers with headers,
//! early finishes, and mid-stream errors; stateful exchanges; and init
//! failures on both stream flavors. The transports' integration suites
//! and the worker binaries all serve exactly this protocol.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};

use vgi_core::{
    unary_fn, BoxFuture, Method, OutputCollector, Protocol, RpcContext, StreamHandler,
};
use vgi_ipc::AnnotatedBatch;
use vgi_token::StreamState;
use vgi_types::{LogLevel, Row, RpcError};
use vgi_wire::batch_rows;

fn fields(specs: &[(&str, DataType)]) -> SchemaRef {
    SchemaRef::new(Schema::new(
        specs
            .iter()
            .map(|(name, data_type)| Field::new(*name, data_type.clone(), false))
            .collect::<Vec<_>>(),
    ))
}

fn empty() -> SchemaRef {
    SchemaRef::new(Schema::empty())
}

/// `count(limit, batch_size)` — batches of `n` and `n²` for
/// `n = 0..limit`.
struct Count;

impl StreamHandler for Count {
    fn init(&self, params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move {
            let limit = params.get_i32("limit")?;
            let batch_size = params.get_i32("batch_size")?;
            if batch_size <= 0 {
                return Err(RpcError::contract("batch_size must be positive"));
            }
            let mut state = StreamState::new();
            state.set("next", 0i64);
            state.set("limit", limit as i64);
            state.set("batch_size", batch_size as i64);
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
            let batch_size = state.get_i64("batch_size").unwrap_or(1);

            let end = (next + batch_size).min(limit);
            let rows: Vec<Row> = (next..end)
                .map(|n| Row::new().with("n", n).with("n_squared", n * n))
                .collect();
            if !rows.is_empty() {
                out.emit_rows(&rows)?;
            }
            if end >= limit {
                out.finish()?;
            }
            state.set("next", end);
            Ok(())
        })
    }
}

/// `count_with_header(limit)` — one row per tick, after a header that
/// echoes the limit.
struct CountWithHeader;

impl StreamHandler for CountWithHeader {
    fn init(&self, params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move {
            let mut state = StreamState::new();
            state.set("next", 0i64);
            state.set("limit", params.get_i32("limit")? as i64);
            Ok(state)
        })
    }

    fn header_row<'a>(
        &'a self,
        params: &'a Row,
        _state: &'a mut StreamState,
        ctx: RpcContext,
    ) -> BoxFuture<'a, Result<Row, RpcError>> {
        Box::pin(async move {
            ctx.client_log(LogLevel::Info, "starting counted stream", None);
            Ok(Row::new().with("limit_echo", params.get_i32("limit")?))
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

/// `produce_error_mid_stream(emit_before_error)` — emits, then fails.
struct ProduceErrorMidStream;

impl StreamHandler for ProduceErrorMidStream {
    fn init(&self, params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move {
            let mut state = StreamState::new();
            state.set("emitted", 0i64);
            state.set("emit_before_error", params.get_i32("emit_before_error")? as i64);
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
            let threshold = state.get_i64("emit_before_error").unwrap_or(0);
            if emitted >= threshold {
                return Err(RpcError::handler(format!(
                    "intentional error after {emitted} batches"
                )));
            }
            out.emit_rows(&[Row::new().with("n", emitted)])?;
            state.set("emitted", emitted + 1);
            Ok(())
        })
    }
}

/// `produce_error_on_init()` — init always fails.
struct ProduceErrorOnInit;

impl StreamHandler for ProduceErrorOnInit {
    fn init(&self, _params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move { Err(RpcError::handler("intentional init error")) })
    }
}

/// `scale(factor)` — multiplies each input value.
struct Scale;

impl StreamHandler for Scale {
    fn init(&self, params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move {
            let mut state = StreamState::new();
            state.set("factor", params.get_f64("factor")?);
            Ok(state)
        })
    }

    fn exchange<'a>(
        &'a self,
        state: &'a mut StreamState,
        input: &'a AnnotatedBatch,
        out: &'a mut OutputCollector,
    ) -> BoxFuture<'a, Result<(), RpcError>> {
        Box::pin(async move {
            let factor = state.get_f64("factor").unwrap_or(1.0);
            let rows: Vec<Row> = batch_rows(&input.batch)?
                .into_iter()
                .map(|row| Ok(Row::new().with("value", row.get_f64("value")? * factor)))
                .collect::<Result<_, RpcError>>()?;
            out.emit_rows(&rows)?;
            Ok(())
        })
    }
}

/// `accumulate()` — running sum and round counter across rounds.
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
        input: &'a AnnotatedBatch,
        out: &'a mut OutputCollector,
    ) -> BoxFuture<'a, Result<(), RpcError>> {
        Box::pin(async move {
            let mut sum = state.get_f64("running_sum").unwrap_or(0.0);
            for row in batch_rows(&input.batch)? {
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

/// `exchange_error_on_init()` — init always fails.
struct ExchangeErrorOnInit;

impl StreamHandler for ExchangeErrorOnInit {
    fn init(&self, _params: Row, _ctx: RpcContext) -> BoxFuture<'static, Result<StreamState, RpcError>> {
        Box::pin(async move { Err(RpcError::handler("intentional exchange init error")) })
    }
}

/// Build the conformance protocol.
pub fn conformance_protocol() -> Protocol {
    let mut protocol = Protocol::new("conformance");

    protocol
        .register(
            "add",
            Method::unary(
                fields(&[("a", DataType::Float64), ("b", DataType::Float64)]),
                fields(&[("result", DataType::Float64)]),
                unary_fn(|params: Row, _ctx| async move {
                    Ok(Row::new().with("result", params.get_f64("a")? + params.get_f64("b")?))
                }),
            )
            .with_doc("Add two numbers.")
            .with_param_type("a", "float64")
            .with_param_type("b", "float64"),
        )
        .expect("register add");

    protocol
        .register(
            "greet",
            Method::unary(
                fields(&[("name", DataType::Utf8)]),
                fields(&[("greeting", DataType::Utf8)]),
                unary_fn(|params: Row, _ctx| async move {
                    Ok(Row::new().with("greeting", format!("hello, {}", params.get_str("name")?)))
                }),
            )
            .with_doc("Greet someone, defaulting to the whole world.")
            .with_default("name", serde_json::json!("world")),
        )
        .expect("register greet");

    protocol
        .register(
            "echo",
            Method::unary(
                fields(&[
                    ("f", DataType::Float64),
                    ("i", DataType::Int64),
                    ("s", DataType::Utf8),
                    ("b", DataType::Binary),
                    ("flag", DataType::Boolean),
                ]),
                fields(&[
                    ("f", DataType::Float64),
                    ("i", DataType::Int64),
                    ("s", DataType::Utf8),
                    ("b", DataType::Binary),
                    ("flag", DataType::Boolean),
                ]),
                unary_fn(|params: Row, _ctx| async move { Ok(params) }),
            )
            .with_doc("Echo every supported scalar type unchanged."),
        )
        .expect("register echo");

    protocol
        .register(
            "log_then_add",
            Method::unary(
                fields(&[("a", DataType::Float64), ("b", DataType::Float64)]),
                fields(&[("result", DataType::Float64)]),
                unary_fn(|params: Row, ctx: RpcContext| async move {
                    let a = params.get_f64("a")?;
                    let b = params.get_f64("b")?;
                    ctx.client_log(
                        LogLevel::Info,
                        format!("adding {a} and {b}"),
                        Some(serde_json::json!({"operands": [a, b]})),
                    );
                    ctx.client_log(LogLevel::Debug, "about to return", None);
                    Ok(Row::new().with("result", a + b))
                }),
            ),
        )
        .expect("register log_then_add");

    protocol
        .register(
            "fail",
            Method::unary(
                fields(&[("message", DataType::Utf8)]),
                empty(),
                unary_fn(|params: Row, _ctx| async move {
                    Err::<Row, _>(RpcError::handler(params.get_str("message")?))
                }),
            )
            .with_doc("Raise a handler error with the given message."),
        )
        .expect("register fail");

    protocol
        .register(
            "count",
            Method::producer(
                fields(&[("limit", DataType::Int32), ("batch_size", DataType::Int32)]),
                fields(&[("n", DataType::Int32), ("n_squared", DataType::Int64)]),
                Arc::new(Count),
            )
            .with_doc("Produce n and n squared for n in 0..limit."),
        )
        .expect("register count");

    protocol
        .register(
            "count_with_header",
            Method::producer(
                fields(&[("limit", DataType::Int32)]),
                fields(&[("n", DataType::Int32)]),
                Arc::new(CountWithHeader),
            )
            .with_header(fields(&[("limit_echo", DataType::Int32)])),
        )
        .expect("register count_with_header");

    protocol
        .register(
            "produce_error_mid_stream",
            Method::producer(
                fields(&[("emit_before_error", DataType::Int32)]),
                fields(&[("n", DataType::Int64)]),
                Arc::new(ProduceErrorMidStream),
            ),
        )
        .expect("register produce_error_mid_stream");

    protocol
        .register(
            "produce_error_on_init",
            Method::producer(
                empty(),
                fields(&[("n", DataType::Int64)]),
                Arc::new(ProduceErrorOnInit),
            ),
        )
        .expect("register produce_error_on_init");

    protocol
        .register(
            "scale",
            Method::exchange(
                fields(&[("factor", DataType::Float64)]),
                fields(&[("value", DataType::Float64)]),
                fields(&[("value", DataType::Float64)]),
                Arc::new(Scale),
            )
            .with_doc("Scale each input value by a constant factor."),
        )
        .expect("register scale");

    protocol
        .register(
            "accumulate",
            Method::exchange(
                empty(),
                fields(&[("value", DataType::Float64)]),
                fields(&[
                    ("running_sum", DataType::Float64),
                    ("exchange_count", DataType::Int64),
                ]),
                Arc::new(Accumulate),
            ),
        )
        .expect("register accumulate");

    protocol
        .register(
            "exchange_error_on_init",
            Method::exchange(
                empty(),
                fields(&[("value", DataType::Float64)]),
                fields(&[("value", DataType::Float64)]),
                Arc::new(ExchangeErrorOnInit),
            ),
        )
        .expect("register exchange_error_on_init");

    protocol
}
