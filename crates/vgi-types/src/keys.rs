//! Stable wire strings.
//!
//! Every metadata key and version constant that appears on the wire lives
//! here so the codec, the dispatchers, and the clients agree on spelling.

/// Batch metadata key carrying the target method name on a request.
pub const METHOD: &str = "method";
/// Batch metadata key carrying the request protocol version.
pub const REQUEST_VERSION: &str = "request_version";
/// Batch metadata key identifying the serving process on responses.
pub const SERVER_ID: &str = "server_id";
/// Optional batch metadata key correlating requests and responses.
pub const REQUEST_ID: &str = "request_id";
/// Batch metadata key marking a zero-row batch as a log or error.
pub const LOG_LEVEL: &str = "log_level";
/// Batch metadata key carrying the rendered log or error message.
pub const LOG_MESSAGE: &str = "log_message";
/// Batch metadata key carrying structured extras as a JSON object.
pub const LOG_EXTRA: &str = "log_extra";
/// Describe batch metadata key naming the protocol.
pub const PROTOCOL_NAME: &str = "protocol_name";
/// Describe batch metadata key carrying the describe format version.
pub const DESCRIBE_VERSION: &str = "describe_version";
/// Batch metadata key carrying an HTTP continuation token.
pub const STREAM_STATE: &str = "stream_state";

/// The only accepted request version.
pub const REQUEST_VERSION_VALUE: &str = "1";
/// The describe format version this runtime emits.
pub const DESCRIBE_VERSION_VALUE: &str = "2";
/// `log_level` value that marks a terminal error batch.
pub const EXCEPTION_LEVEL: &str = "EXCEPTION";

/// Reserved introspection method, handled before method dispatch.
pub const DESCRIBE_METHOD: &str = "__describe__";
/// Reserved HTTP path segment advertising server capabilities.
pub const CAPABILITIES_SEGMENT: &str = "__capabilities__";
/// Response header on the capabilities preflight carrying the request cap.
pub const MAX_REQUEST_BYTES_HEADER: &str = "VGI-Max-Request-Bytes";
/// Content type both HTTP directions require.
pub const ARROW_STREAM_CONTENT_TYPE: &str = "application/vnd.apache.arrow.stream";
