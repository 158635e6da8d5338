//! Function error codes and HTTP-facing error rendering

use serde::Serialize;
use thiserror::Error;

/// Error codes surfaced over HTTP by the function server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Routing
    FunctionNotFound,
    InvalidFunctionName,

    // Build
    BuildFailed,

    // Invocation
    InvocationFailed,
    InvocationTimeout,
    InvalidResponse,
    MissingBuilderMetadata,

    // Request
    BadRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FunctionNotFound => "FunctionNotFound",
            Self::InvalidFunctionName => "InvalidFunctionName",
            Self::BuildFailed => "BuildFailed",
            Self::InvocationFailed => "InvocationFailed",
            Self::InvocationTimeout => "InvocationTimeout",
            Self::InvalidResponse => "InvalidResponse",
            Self::MissingBuilderMetadata => "MissingBuilderMetadata",
            Self::BadRequest => "BadRequest",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::FunctionNotFound => 404,
            Self::InvalidFunctionName | Self::MissingBuilderMetadata | Self::BadRequest => 400,
            Self::BuildFailed
            | Self::InvocationFailed
            | Self::InvocationTimeout
            | Self::InvalidResponse => 500,
        }
    }
}

/// How an error body should be rendered for the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFormat {
    Html,
    Text,
    Json,
}

impl ErrorFormat {
    /// Pick a format from an `Accept` header value.
    ///
    /// HTML wins whenever the client lists it; plain text is used when it is
    /// listed ahead of JSON; JSON otherwise.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::Json;
        };
        let accept = accept.to_ascii_lowercase();
        if accept.contains("text/html") {
            return Self::Html;
        }
        match (accept.find("text/plain"), accept.find("application/json")) {
            (Some(_), None) => Self::Text,
            (Some(text), Some(json)) if text < json => Self::Text,
            _ => Self::Json,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Html => "text/html; charset=utf-8",
            Self::Text => "text/plain; charset=utf-8",
            Self::Json => "application/json",
        }
    }
}

/// An error as shown to the HTTP client
#[derive(Debug, Error)]
#[error("{error_type}: {message}")]
pub struct FunctionsError {
    pub code: ErrorCode,
    pub error_type: String,
    pub message: String,
    pub stack_trace: Vec<String>,
    pub function: Option<String>,
    pub request_id: String,
}

impl FunctionsError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            error_type: code.as_str().to_string(),
            message: message.into(),
            stack_trace: Vec::new(),
            function: None,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn render(&self, format: ErrorFormat) -> String {
        match format {
            ErrorFormat::Html => self.to_html(),
            ErrorFormat::Text => self.to_text(),
            ErrorFormat::Json => self.to_json(),
        }
    }

    /// Format as a JSON document mirroring the invocation error shape
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct JsonError<'a> {
            error_type: &'a str,
            error_message: &'a str,
            stack_trace: &'a [String],
            #[serde(skip_serializing_if = "Option::is_none")]
            function_name: Option<&'a str>,
            request_id: &'a str,
        }

        let error = JsonError {
            error_type: &self.error_type,
            error_message: &self.message,
            stack_trace: &self.stack_trace,
            function_name: self.function.as_deref(),
            request_id: &self.request_id,
        };

        serde_json::to_string(&error).unwrap_or_else(|_| {
            format!(
                r#"{{"errorType":"{}","errorMessage":"{}"}}"#,
                self.error_type, self.message
            )
        })
    }

    pub fn to_text(&self) -> String {
        let mut text = format!("{}: {}", self.error_type, self.message);
        for line in &self.stack_trace {
            text.push('\n');
            text.push_str(line);
        }
        text
    }

    pub fn to_html(&self) -> String {
        let title = match &self.function {
            Some(name) => format!("Function {} failed", escape_html(name)),
            None => "Function invocation failed".to_string(),
        };
        let stack = self
            .stack_trace
            .iter()
            .map(|line| escape_html(line))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
</head>
<body>
    <h1>{title}</h1>
    <h2>{error_type}: {message}</h2>
    <pre>{stack}</pre>
    <p><small>Request ID: {request_id}</small></p>
</body>
</html>"#,
            title = title,
            error_type = escape_html(&self.error_type),
            message = escape_html(&self.message),
            stack = stack,
            request_id = escape_html(&self.request_id),
        )
    }
}

/// Escape text for inclusion in HTML
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
