//! Result dispatch
//!
//! Turns function results into HTTP responses. What happens depends on the
//! kind of function: background functions answer 202 before they finish,
//! scheduled functions get a synthetic timer event, and functions requested
//! as builders must say they are builders.

use axum::body::Body;
use axum::response::Response;
use base64::{engine::general_purpose, Engine};
use bytes::{Bytes, BytesMut};
use chrono::{SecondsFormat, Utc};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use funcstack_core::{ErrorCode, ErrorFormat, FunctionsError, RequestId, REQUEST_ID_HEADER};

use crate::event::{AdaptedRequest, FunctionTarget};
use crate::function::{FunctionDescriptor, FunctionKind};
use crate::invocation::{Executor, FunctionOutput, InvocationError, BUILD_ERROR};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(900);

const STREAM_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Your function did not return a response. Return an object with a numeric statusCode")]
    Missing,

    #[error("Your function response must be an object. You gave: {0}")]
    NotAnObject(&'static str),

    #[error("Your function response must have a numerical statusCode. You gave: {0}")]
    StatusCode(String),

    #[error("Your function response must have a string or a stream body. You gave: {0}")]
    Body(&'static str),

    #[error("Your function response has an invalid header '{0}'")]
    Header(String),

    #[error("Your function response body is flagged as base64 but does not decode: {0}")]
    Base64(String),
}

/// Body of a validated response
#[derive(Debug)]
pub enum ResponseBody {
    Empty,
    Text(String),
    Binary(Bytes),
    Stream(TcpStream),
}

/// A function result that passed validation
#[derive(Debug)]
pub struct FunctionResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub builder_function: bool,
}

impl FunctionResponse {
    pub fn validate(output: FunctionOutput) -> Result<Self, ValidationError> {
        let FunctionOutput { value, stream } = output;

        let fields = match value {
            Value::Object(fields) => fields,
            Value::Null => return Err(ValidationError::Missing),
            other => return Err(ValidationError::NotAnObject(type_name(&other))),
        };

        let status = parse_status(fields.get("statusCode"))?;
        let headers = parse_headers(&fields)?;

        let body = match (stream, fields.get("body")) {
            (Some(stream), _) => ResponseBody::Stream(stream),
            (None, None | Some(Value::Null)) => ResponseBody::Empty,
            (None, Some(Value::String(body))) if is_truthy(fields.get("isBase64Encoded")) => {
                let bytes = general_purpose::STANDARD
                    .decode(body)
                    .map_err(|e| ValidationError::Base64(e.to_string()))?;
                ResponseBody::Binary(Bytes::from(bytes))
            }
            (None, Some(Value::String(body))) => ResponseBody::Text(body.clone()),
            (None, Some(other)) => return Err(ValidationError::Body(type_name(other))),
        };

        let builder_function = fields
            .get("metadata")
            .and_then(|metadata| metadata.get("builder_function"))
            .is_some_and(|flag| is_truthy(Some(flag)));

        Ok(Self {
            status,
            headers,
            body,
            builder_function,
        })
    }

    pub fn into_response(self) -> Response {
        let body = match self.body {
            ResponseBody::Empty => Body::empty(),
            ResponseBody::Text(text) => Body::from(text),
            ResponseBody::Binary(bytes) => Body::from(bytes),
            ResponseBody::Stream(stream) => stream_body(stream),
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

fn parse_status(value: Option<&Value>) -> Result<StatusCode, ValidationError> {
    let code = match value {
        None | Some(Value::Null) => return Err(ValidationError::StatusCode("undefined".to_string())),
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
        Some(_) => None,
    };

    code.filter(|code| *code != 0)
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ValidationError::StatusCode(value.map(Value::to_string).unwrap_or_default()))
}

fn parse_headers(fields: &Map<String, Value>) -> Result<HeaderMap, ValidationError> {
    let mut headers = HeaderMap::new();

    if let Some(Value::Object(single)) = fields.get("headers") {
        for (name, value) in single {
            let (name, value) = header_pair(name, value)?;
            headers.insert(name, value);
        }
    }

    if let Some(Value::Object(multi)) = fields.get("multiValueHeaders") {
        for (name, values) in multi {
            let Value::Array(values) = values else {
                return Err(ValidationError::Header(name.clone()));
            };
            for value in values {
                let (name, value) = header_pair(name, value)?;
                headers.append(name, value);
            }
        }
    }

    Ok(headers)
}

fn header_pair(name: &str, value: &Value) -> Result<(HeaderName, HeaderValue), ValidationError> {
    let invalid = || ValidationError::Header(name.to_string());
    let text = match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => return Err(invalid()),
    };
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
    let value = HeaderValue::from_str(&text).map_err(|_| invalid())?;
    Ok((name, value))
}

/// Truthiness as the function runtime understands it
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Pipe a handed-off connection into the response body. A read error ends
/// the body after it is reported.
fn stream_body(stream: TcpStream) -> Body {
    let chunks = futures::stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        let mut buf = BytesMut::with_capacity(STREAM_CHUNK_SIZE);
        match stream.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok::<Bytes, std::io::Error>(buf.freeze()), Some(stream))),
            Err(e) => Some((Err(e), None)),
        }
    });
    Body::from_stream(chunks)
}

/// Render an error for the client, in the format its `Accept` header asks for
pub fn error_response(error: &FunctionsError, accept: Option<&str>) -> Response {
    let format = ErrorFormat::negotiate(accept);
    let mut response = Response::new(Body::from(error.render(format)));
    *response.status_mut() =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    if let Ok(value) = HeaderValue::from_str(&error.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn invocation_failure(function: &str, request_id: &RequestId, error: InvocationError) -> FunctionsError {
    let code = if error.is_timeout() {
        ErrorCode::InvocationTimeout
    } else if error.error_type == BUILD_ERROR {
        ErrorCode::BuildFailed
    } else {
        ErrorCode::InvocationFailed
    };
    FunctionsError::new(code, error.error_message)
        .with_error_type(error.error_type)
        .with_stack_trace(error.stack_trace)
        .with_function(function)
        .with_request_id(request_id.as_str())
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub synchronous: Duration,
    pub background: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            synchronous: DEFAULT_TIMEOUT,
            background: DEFAULT_BACKGROUND_TIMEOUT,
        }
    }
}

/// Invokes functions and writes their results according to their kind
pub struct Dispatcher {
    executor: Arc<Executor>,
    timeouts: Timeouts,
}

impl Dispatcher {
    pub fn new(executor: Arc<Executor>, timeouts: Timeouts) -> Self {
        Self { executor, timeouts }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub async fn dispatch(
        &self,
        function: Arc<FunctionDescriptor>,
        request: AdaptedRequest,
        target: &FunctionTarget,
    ) -> Response {
        let accept = request.accept.clone();
        let request_id = request.request_id.clone();

        let mut response = match function.kind().await {
            Ok(FunctionKind::Background) => self.dispatch_background(Arc::clone(&function), request),
            Ok(FunctionKind::Scheduled) => self.dispatch_scheduled(&function, request).await,
            Ok(_) => self.dispatch_synchronous(&function, request, target).await,
            Err(e) => Err(invocation_failure(
                function.name(),
                &request_id,
                InvocationError::new(BUILD_ERROR, e.to_string()),
            )),
        }
        .unwrap_or_else(|e| {
            error!(
                function = %function.name(),
                request_id = %request_id,
                error_type = %e.error_type,
                error = %e.message,
                stack = %e.stack_trace.join("\n"),
                "Function invocation failed"
            );
            error_response(&e, accept.as_deref())
        });

        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }

    async fn dispatch_synchronous(
        &self,
        function: &FunctionDescriptor,
        request: AdaptedRequest,
        target: &FunctionTarget,
    ) -> Result<Response, FunctionsError> {
        let response = self
            .invoke_and_validate(function, &request, self.timeouts.synchronous)
            .await?;

        if target.builder
            && FunctionKind::Synchronous.refine(response.builder_function) != FunctionKind::Builder
        {
            return Err(FunctionsError::new(
                ErrorCode::MissingBuilderMetadata,
                format!(
                    "Function '{}' was requested through /.netlify/builders/ but its response is \
                     missing builder metadata. Wrap the handler with the builder() helper, or \
                     request it through /.netlify/functions/{} instead.",
                    function.name(),
                    function.name()
                ),
            )
            .with_function(function.name())
            .with_request_id(request.request_id.as_str()));
        }

        Ok(response.into_response())
    }

    async fn dispatch_scheduled(
        &self,
        function: &FunctionDescriptor,
        mut request: AdaptedRequest,
    ) -> Result<Response, FunctionsError> {
        let schedule_error = |message: String| {
            FunctionsError::new(ErrorCode::BuildFailed, message)
                .with_function(function.name())
                .with_request_id(request.request_id.as_str())
        };

        let schedule = function
            .build_data()
            .await
            .map_err(|e| schedule_error(e.to_string()))?
            .schedule
            .clone()
            .unwrap_or_default();
        let next_run = function
            .next_run(Utc::now())
            .await
            .map_err(|e| schedule_error(e.to_string()))?
            .ok_or_else(|| schedule_error(format!("Function '{}' has no schedule", function.name())))?;

        request.event = request.event.into_scheduled(next_run);
        let response = self
            .invoke_and_validate(function, &request, self.timeouts.synchronous)
            .await?;

        let mut text = format!(
            "You performed an HTTP request to {name}, which is a scheduled function. \
             You can do this to test your functions locally, but it won't work in production.\n\n\
             Schedule: {schedule}\nNext run: {next_run}",
            name = function.name(),
            next_run = next_run.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        if let ResponseBody::Text(body) = &response.body {
            if !body.is_empty() {
                text.push_str("\n\nResponse body:\n");
                text.push_str(body);
            }
        }

        info!(function = %function.name(), status = response.status.as_u16(), "Scheduled function ran");

        let mut http_response = Response::new(Body::from(text));
        *http_response.status_mut() = response.status;
        http_response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        Ok(http_response)
    }

    /// Answer 202 now; the outcome only reaches the log
    fn dispatch_background(
        &self,
        function: Arc<FunctionDescriptor>,
        request: AdaptedRequest,
    ) -> Result<Response, FunctionsError> {
        let executor = Arc::clone(&self.executor);
        let timeout = self.timeouts.background;

        tokio::spawn(async move {
            let result = executor
                .invoke(
                    &function,
                    &request.event,
                    request.client_context.as_ref(),
                    &request.request_id,
                    timeout,
                )
                .await;
            match result {
                Ok(_) => info!(
                    function = %function.name(),
                    request_id = %request.request_id,
                    "Background function completed"
                ),
                Err(e) => error!(
                    function = %function.name(),
                    request_id = %request.request_id,
                    error_type = %e.error_type,
                    error = %e.error_message,
                    stack = %e.stack_trace.join("\n"),
                    "Background function failed"
                ),
            }
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::ACCEPTED;
        Ok(response)
    }

    async fn invoke_and_validate(
        &self,
        function: &FunctionDescriptor,
        request: &AdaptedRequest,
        timeout: Duration,
    ) -> Result<FunctionResponse, FunctionsError> {
        let output = self
            .executor
            .invoke(
                function,
                &request.event,
                request.client_context.as_ref(),
                &request.request_id,
                timeout,
            )
            .await
            .map_err(|e| invocation_failure(function.name(), &request.request_id, e))?;

        FunctionResponse::validate(output).map_err(|e| {
            warn!(function = %function.name(), error = %e, "Invalid function response");
            FunctionsError::new(ErrorCode::InvalidResponse, e.to_string())
                .with_error_type("ValidationError")
                .with_function(function.name())
                .with_request_id(request.request_id.as_str())
        })
    }
}
