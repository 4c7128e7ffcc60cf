//! Method definitions and handler traits.
//!
//! A method is a tagged variant over unary, producer, and exchange; the
//! dispatch loops pattern-match and never store callbacks polymorphically
//! across variants. Handlers are first-class values owned by the registry
//! and always called with explicit context and state arguments.

use std::sync::Arc;

use arrow_schema::{Schema, SchemaRef};

use vgi_ipc::AnnotatedBatch;
use vgi_token::StreamState;
use vgi_types::{Row, RpcError, StreamMode};

use crate::context::RpcContext;
use crate::collector::OutputCollector;
use crate::BoxFuture;

/// A unary method body.
pub trait UnaryHandler: Send + Sync {
    fn call(&self, params: Row, ctx: RpcContext) -> BoxFuture<'static, Result<Row, RpcError>>;
}

/// Wrap a plain async closure as a [`UnaryHandler`].
pub fn unary_fn<F, Fut>(f: F) -> Arc<dyn UnaryHandler>
where
    F: Fn(Row, RpcContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Row, RpcError>> + Send + 'static,
{
    struct FnUnary<F>(F);

    impl<F, Fut> UnaryHandler for FnUnary<F>
    where
        F: Fn(Row, RpcContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Row, RpcError>> + Send + 'static,
    {
        fn call(&self, params: Row, ctx: RpcContext) -> BoxFuture<'static, Result<Row, RpcError>> {
            Box::pin((self.0)(params, ctx))
        }
    }

    Arc::new(FnUnary(f))
}

/// A stream method body.
///
/// `init` runs once per stream. `produce` drives producer ticks,
/// `exchange` drives exchange rounds; a method implements whichever apply
/// (both, if it flips shape at runtime through the state mode override).
/// `header_row` runs when the method declares a header schema.
pub trait StreamHandler: Send + Sync {
    fn init(&self, params: Row, ctx: RpcContext)
        -> BoxFuture<'static, Result<StreamState, RpcError>>;

    fn header_row<'a>(
        &'a self,
        params: &'a Row,
        state: &'a mut StreamState,
        ctx: RpcContext,
    ) -> BoxFuture<'a, Result<Row, RpcError>> {
        let _ = (params, state, ctx);
        Box::pin(async { Err(RpcError::handler("method does not declare a header")) })
    }

    fn produce<'a>(
        &'a self,
        state: &'a mut StreamState,
        out: &'a mut OutputCollector,
    ) -> BoxFuture<'a, Result<(), RpcError>> {
        let _ = (state, out);
        Box::pin(async { Err(RpcError::handler("method does not produce")) })
    }

    fn exchange<'a>(
        &'a self,
        state: &'a mut StreamState,
        input: &'a AnnotatedBatch,
        out: &'a mut OutputCollector,
    ) -> BoxFuture<'a, Result<(), RpcError>> {
        let _ = (state, input, out);
        Box::pin(async { Err(RpcError::handler("method does not exchange")) })
    }
}

/// Definition of a unary method.
pub struct UnaryDef {
    pub params: SchemaRef,
    pub result: SchemaRef,
    pub handler: Arc<dyn UnaryHandler>,
    pub doc: Option<String>,
    pub defaults: serde_json::Map<String, serde_json::Value>,
    pub param_types: serde_json::Map<String, serde_json::Value>,
}

/// Definition of a producer or exchange method. A producer is a stream
/// method whose input schema has no fields.
pub struct StreamDef {
    pub params: SchemaRef,
    pub input: SchemaRef,
    pub output: SchemaRef,
    pub header: Option<SchemaRef>,
    pub handler: Arc<dyn StreamHandler>,
    pub doc: Option<String>,
    pub defaults: serde_json::Map<String, serde_json::Value>,
    pub param_types: serde_json::Map<String, serde_json::Value>,
}

impl StreamDef {
    /// The mode this definition implies before any state override.
    pub fn registered_mode(&self) -> StreamMode {
        if self.input.fields().is_empty() {
            StreamMode::Producer
        } else {
            StreamMode::Exchange
        }
    }
}

/// One registered method.
pub enum Method {
    Unary(UnaryDef),
    Producer(StreamDef),
    Exchange(StreamDef),
}

impl Method {
    pub fn unary(params: SchemaRef, result: SchemaRef, handler: Arc<dyn UnaryHandler>) -> Self {
        Method::Unary(UnaryDef {
            params,
            result,
            handler,
            doc: None,
            defaults: serde_json::Map::new(),
            param_types: serde_json::Map::new(),
        })
    }

    pub fn producer(
        params: SchemaRef,
        output: SchemaRef,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        Method::Producer(StreamDef {
            params,
            input: SchemaRef::new(Schema::empty()),
            output,
            header: None,
            handler,
            doc: None,
            defaults: serde_json::Map::new(),
            param_types: serde_json::Map::new(),
        })
    }

    pub fn exchange(
        params: SchemaRef,
        input: SchemaRef,
        output: SchemaRef,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        Method::Exchange(StreamDef {
            params,
            input,
            output,
            header: None,
            handler,
            doc: None,
            defaults: serde_json::Map::new(),
            param_types: serde_json::Map::new(),
        })
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        let doc = Some(doc.into());
        match &mut self {
            Method::Unary(def) => def.doc = doc,
            Method::Producer(def) | Method::Exchange(def) => def.doc = doc,
        }
        self
    }

    pub fn with_header(mut self, header: SchemaRef) -> Self {
        match &mut self {
            Method::Producer(def) | Method::Exchange(def) => def.header = Some(header),
            Method::Unary(_) => {}
        }
        self
    }

    /// Default value for a parameter omitted by the caller.
    pub fn with_default(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        let defaults = match &mut self {
            Method::Unary(def) => &mut def.defaults,
            Method::Producer(def) | Method::Exchange(def) => &mut def.defaults,
        };
        defaults.insert(name.into(), value);
        self
    }

    /// Domain-specific type tag for a parameter, serialized verbatim into
    /// the describe row.
    pub fn with_param_type(
        mut self,
        name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        let param_types = match &mut self {
            Method::Unary(def) => &mut def.param_types,
            Method::Producer(def) | Method::Exchange(def) => &mut def.param_types,
        };
        param_types.insert(name.into(), serde_json::Value::String(tag.into()));
        self
    }

    /// `"unary"` or `"stream"` for the describe row.
    pub fn type_str(&self) -> &'static str {
        match self {
            Method::Unary(_) => "unary",
            Method::Producer(_) | Method::Exchange(_) => "stream",
        }
    }

    pub fn params_schema(&self) -> &SchemaRef {
        match self {
            Method::Unary(def) => &def.params,
            Method::Producer(def) | Method::Exchange(def) => &def.params,
        }
    }

    pub fn stream_def(&self) -> Option<&StreamDef> {
        match self {
            Method::Producer(def) | Method::Exchange(def) => Some(def),
            Method::Unary(_) => None,
        }
    }

    pub fn doc(&self) -> Option<&str> {
        match self {
            Method::Unary(def) => def.doc.as_deref(),
            Method::Producer(def) | Method::Exchange(def) => def.doc.as_deref(),
        }
    }

    pub fn defaults(&self) -> &serde_json::Map<String, serde_json::Value> {
        match self {
            Method::Unary(def) => &def.defaults,
            Method::Producer(def) | Method::Exchange(def) => &def.defaults,
        }
    }

    pub fn param_types(&self) -> &serde_json::Map<String, serde_json::Value> {
        match self {
            Method::Unary(def) => &def.param_types,
            Method::Producer(def) | Method::Exchange(def) => &def.param_types,
        }
    }
}
