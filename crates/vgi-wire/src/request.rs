//! Request batches.

use arrow_schema::SchemaRef;

use vgi_ipc::{AnnotatedBatch, BatchMetadata};
use vgi_types::{keys, Row, RpcError};

/// A decoded request batch.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub request_id: Option<String>,
    pub params: Row,
}

/// Build the one-row request batch for `method` on the given parameter
/// schema. The row count is 1 even when the schema has no fields.
pub fn build_request(
    schema: &SchemaRef,
    params: &Row,
    method: &str,
    request_id: Option<&str>,
) -> Result<AnnotatedBatch, RpcError> {
    let batch = crate::columns::build_batch(schema, std::slice::from_ref(params))?;
    let mut metadata = BatchMetadata::new();
    metadata.insert(keys::METHOD.to_owned(), method.to_owned());
    metadata.insert(
        keys::REQUEST_VERSION.to_owned(),
        keys::REQUEST_VERSION_VALUE.to_owned(),
    );
    if let Some(id) = request_id {
        metadata.insert(keys::REQUEST_ID.to_owned(), id.to_owned());
    }
    Ok(AnnotatedBatch::with_metadata(batch, metadata))
}

/// Parse a request batch: method and request id from the metadata, the
/// parameter row from the single data row.
pub fn parse_request(annotated: &AnnotatedBatch) -> Result<ParsedRequest, RpcError> {
    let method = annotated
        .meta(keys::METHOD)
        .ok_or_else(|| RpcError::protocol("request batch is missing `method` metadata"))?
        .to_owned();

    match annotated.meta(keys::REQUEST_VERSION) {
        None => {
            return Err(RpcError::version(
                "request batch is missing `request_version` metadata",
            ))
        }
        Some(v) if v != keys::REQUEST_VERSION_VALUE => {
            return Err(RpcError::version(format!(
                "unsupported request version {v:?}, expected \"{}\"",
                keys::REQUEST_VERSION_VALUE
            )))
        }
        Some(_) => {}
    }

    let request_id = annotated.meta(keys::REQUEST_ID).map(str::to_owned);

    let schema = annotated.schema();
    let rows = annotated.num_rows();
    let params = if schema.fields().is_empty() {
        // A parameterless request may arrive with zero or one rows.
        if rows > 1 {
            return Err(RpcError::protocol(format!(
                "request batch must have at most 1 row, got {rows}"
            )));
        }
        Row::new()
    } else {
        if rows != 1 {
            return Err(RpcError::protocol(format!(
                "request batch must have exactly 1 row, got {rows}"
            )));
        }
        crate::columns::batch_rows(&annotated.batch)?
            .pop()
            .expect("one row")
    };

    Ok(ParsedRequest {
        method,
        request_id,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        SchemaRef::new(Schema::new(vec![
            Field::new("a", DataType::Float64, false),
            Field::new("b", DataType::Float64, false),
        ]))
    }

    #[test]
    fn request_round_trips() {
        let params = Row::new().with("a", 3.0f64).with("b", 4i64);
        let annotated = build_request(&schema(), &params, "add", Some("req-1")).unwrap();
        assert_eq!(annotated.num_rows(), 1);

        let parsed = parse_request(&annotated).unwrap();
        assert_eq!(parsed.method, "add");
        assert_eq!(parsed.request_id.as_deref(), Some("req-1"));
        assert_eq!(parsed.params.get_f64("a").unwrap(), 3.0);
        assert_eq!(parsed.params.get_f64("b").unwrap(), 4.0);
    }

    #[test]
    fn missing_method_is_protocol_error() {
        let params = Row::new().with("a", 1.0f64).with("b", 2.0f64);
        let mut annotated = build_request(&schema(), &params, "add", None).unwrap();
        annotated.metadata.remove("method");
        assert!(matches!(
            parse_request(&annotated),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn wrong_version_is_version_error() {
        let params = Row::new().with("a", 1.0f64).with("b", 2.0f64);
        let mut annotated = build_request(&schema(), &params, "add", None).unwrap();
        annotated
            .metadata
            .insert("request_version".into(), "7".into());
        assert!(matches!(
            parse_request(&annotated),
            Err(RpcError::Version(_))
        ));

        annotated.metadata.remove("request_version");
        assert!(matches!(
            parse_request(&annotated),
            Err(RpcError::Version(_))
        ));
    }

    #[test]
    fn parameterless_request_round_trips() {
        let schema = SchemaRef::new(Schema::empty());
        let annotated = build_request(&schema, &Row::new(), "ping", None).unwrap();
        let parsed = parse_request(&annotated).unwrap();
        assert_eq!(parsed.method, "ping");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn exotic_values_survive_the_codec() {
        let schema = SchemaRef::new(Schema::new(vec![
            Field::new("f", DataType::Float64, false),
            Field::new("i", DataType::Int64, false),
            Field::new("s", DataType::Utf8, false),
            Field::new("b", DataType::Binary, false),
        ]));
        let cases: Vec<Row> = vec![
            Row::new()
                .with("f", f64::NAN)
                .with("i", i64::MIN)
                .with("s", "héllo 🦀 \u{5b57} \u{5d0}")
                .with("b", vec![0u8, 1, 0, 255]),
            Row::new()
                .with("f", f64::NEG_INFINITY)
                .with("i", i64::MAX)
                .with("s", "")
                .with("b", Vec::<u8>::new()),
        ];
        for params in cases {
            let annotated = build_request(&schema, &params, "echo", None).unwrap();
            let parsed = parse_request(&annotated).unwrap();
            for (name, value) in params.iter() {
                assert!(
                    parsed.params.get(name).unwrap().same_value(value),
                    "field {name}: {value:?} vs {:?}",
                    parsed.params.get(name)
                );
            }
        }
    }
}
