//! gRPC integration adapter
//!
//! Tools with a stored gRPC descriptor invoke the declared unary method over
//! a tonic channel. The descriptor names the full method path
//! (`/{package.Service}/{Method}`) and declares the JSON codec; arguments
//! and results cross the wire as JSON bytes.

use std::str::FromStr;
use std::time::Duration;

use bytes::{Buf, BufMut};
use http::uri::PathAndQuery;
use serde_json::Value;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::Endpoint;
use tonic::{Request, Status};

use mcpgate_core::{GatewayError, GatewayResult};

/// JSON byte codec for descriptor-declared JSON methods.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

/// Encoder half of [`JsonCodec`].
#[derive(Debug, Default)]
pub struct JsonEncoder;

/// Decoder half of [`JsonCodec`].
#[derive(Debug, Default)]
pub struct JsonDecoder;

impl Encoder for JsonEncoder {
    type Item = Value;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        serde_json::to_writer(dst.writer(), &item)
            .map_err(|e| Status::internal(format!("encode: {e}")))
    }
}

impl Decoder for JsonDecoder {
    type Item = Value;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if src.remaining() == 0 {
            return Ok(None);
        }
        let bytes = src.copy_to_bytes(src.remaining());
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Status::internal(format!("decode: {e}")))
    }
}

impl Codec for JsonCodec {
    type Encode = Value;
    type Decode = Value;
    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder
    }
}

/// Invoke a unary gRPC method with JSON arguments.
pub async fn execute_grpc(
    endpoint: &str,
    method_path: &str,
    args: Value,
    timeout: Duration,
) -> GatewayResult<Value> {
    let path = PathAndQuery::from_str(method_path).map_err(|_| {
        GatewayError::invalid_request(format!("bad gRPC method path '{method_path}'"))
    })?;

    let channel = Endpoint::from_shared(endpoint.to_string())
        .map_err(|e| GatewayError::invalid_request(format!("bad gRPC endpoint: {e}")))?
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect()
        .await
        .map_err(|e| GatewayError::unavailable(format!("grpc connect: {e}")))?;

    let mut grpc = Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| GatewayError::unavailable(format!("grpc not ready: {e}")))?;

    let response = grpc
        .unary(Request::new(args), path, JsonCodec)
        .await
        .map_err(map_status)?;
    Ok(response.into_inner())
}

fn map_status(status: Status) -> GatewayError {
    match status.code() {
        tonic::Code::Unavailable => {
            GatewayError::unavailable(format!("grpc unavailable: {}", status.message()))
        }
        tonic::Code::DeadlineExceeded => GatewayError::timeout("grpc call", 0),
        tonic::Code::NotFound => GatewayError::not_found(status.message().to_string()),
        tonic::Code::Cancelled => GatewayError::cancelled(status.message().to_string()),
        _ => GatewayError::upstream(format!(
            "grpc {}: {}",
            status.code(),
            status.message()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_path_must_parse() {
        let err = tokio_test::block_on(execute_grpc(
            "http://127.0.0.1:50051",
            "no leading slash",
            json!({}),
            Duration::from_millis(100),
        ))
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let err = execute_grpc(
            "http://127.0.0.1:9",
            "/pkg.Service/Method",
            json!({}),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::UpstreamUnavailable { .. } | GatewayError::UpstreamTimeout { .. }
        ));
    }
}
