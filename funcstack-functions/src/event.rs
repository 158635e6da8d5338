//! Invocation events and the HTTP request adapter

use axum::body::Body;
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use http::{header, HeaderMap, Request};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use funcstack_core::{RequestId, REQUEST_ID_HEADER};

use crate::geo::{GeoLocator, GeoMode, GEO_HEADER};
use crate::identity::{ClientContext, IdentityProvider};

pub const FUNCTIONS_PREFIX: &str = "/.netlify/functions/";
pub const BUILDERS_PREFIX: &str = "/.netlify/builders/";

/// Internal routing headers; never visible to function code
pub const FUNCTION_NAME_HEADER: &str = "x-nf-function-name";
pub const FUNCTION_ROUTE_HEADER: &str = "x-nf-function-route";

pub const CLIENT_IP_HEADER: &str = "x-nf-client-connection-ip";
const LEGACY_CLIENT_IP_HEADER: &str = "client-ip";

pub const SCHEDULE_USER_AGENT: &str = "Netlify Clockwork";
pub const EVENT_TYPE_HEADER: &str = "x-nf-event";

#[derive(Debug, Error)]
pub enum AdaptationError {
    #[error("Could not read request body: {0}")]
    Body(String),
}

/// Canonical event passed to a function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEvent {
    pub path: String,
    pub http_method: String,
    pub headers: HashMap<String, String>,
    pub multi_value_headers: HashMap<String, Vec<String>>,
    pub query_string_parameters: HashMap<String, String>,
    pub multi_value_query_string_parameters: HashMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub is_base64_encoded: bool,
    pub raw_url: String,
    pub raw_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

impl InvocationEvent {
    /// Turn a request event into the event of a timer-driven run
    pub fn into_scheduled(mut self, next_run: DateTime<Utc>) -> Self {
        let body = serde_json::json!({
            "next_run": next_run.to_rfc3339_opts(SecondsFormat::Millis, true),
        });

        for name in [header::CONTENT_LENGTH.as_str(), header::TRANSFER_ENCODING.as_str()] {
            self.headers.remove(name);
            self.multi_value_headers.remove(name);
        }
        for (name, value) in [
            (header::USER_AGENT.as_str(), SCHEDULE_USER_AGENT),
            (EVENT_TYPE_HEADER, "schedule"),
            (header::CONTENT_TYPE.as_str(), "application/json"),
        ] {
            self.set_header(name, value);
        }

        self.http_method = "POST".to_string();
        self.body = Some(body.to_string());
        self.is_base64_encoded = false;
        self
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
        self.multi_value_headers
            .insert(name.to_string(), vec![value.to_string()]);
    }

    /// Body bytes, decoding base64 when flagged
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match &self.body {
            None => Ok(Vec::new()),
            Some(body) if self.is_base64_encoded => general_purpose::STANDARD.decode(body),
            Some(body) => Ok(body.clone().into_bytes()),
        }
    }
}

/// The function a request is aimed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionTarget {
    pub name: String,
    pub route: Option<String>,
    /// Requested through the builders prefix
    pub builder: bool,
}

/// Resolve the target from the routing headers, then the URL prefixes
pub fn resolve_target(path: &str, headers: &HeaderMap) -> Option<FunctionTarget> {
    if let Some(name) = header_str(headers, FUNCTION_NAME_HEADER) {
        return Some(FunctionTarget {
            name: name.to_string(),
            route: header_str(headers, FUNCTION_ROUTE_HEADER).map(str::to_string),
            builder: false,
        });
    }

    for (prefix, builder) in [(FUNCTIONS_PREFIX, false), (BUILDERS_PREFIX, true)] {
        if let Some(rest) = path.strip_prefix(prefix) {
            let segment = rest.split('/').next().unwrap_or_default();
            if segment.is_empty() {
                return None;
            }
            let name = percent_decode_str(segment).decode_utf8_lossy().into_owned();
            return Some(FunctionTarget {
                name,
                route: None,
                builder,
            });
        }
    }

    None
}

/// An adapted request, ready for invocation
#[derive(Debug, Clone)]
pub struct AdaptedRequest {
    pub event: InvocationEvent,
    pub client_context: Option<ClientContext>,
    pub request_id: RequestId,
    pub accept: Option<String>,
}

/// Converts HTTP requests into invocation events
pub struct RequestAdapter {
    identity: IdentityProvider,
    geo: Arc<dyn GeoLocator>,
    geo_mode: GeoMode,
    max_body_bytes: usize,
}

impl RequestAdapter {
    pub fn new(
        identity: IdentityProvider,
        geo: Arc<dyn GeoLocator>,
        geo_mode: GeoMode,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            identity,
            geo,
            geo_mode,
            max_body_bytes,
        }
    }

    pub async fn to_event(
        &self,
        request: Request<Body>,
        remote: Option<SocketAddr>,
        target: &FunctionTarget,
    ) -> Result<AdaptedRequest, AdaptationError> {
        let (parts, body) = request.into_parts();
        let headers = &parts.headers;

        let request_id = RequestId::from_header(header_str(headers, REQUEST_ID_HEADER));
        let is_base64_encoded = should_base64_encode(header_str(headers, header::CONTENT_TYPE.as_str()));

        let body = if declares_body(headers) {
            let bytes = axum::body::to_bytes(body, self.max_body_bytes)
                .await
                .map_err(|e| AdaptationError::Body(e.to_string()))?;
            Some(if is_base64_encoded {
                general_purpose::STANDARD.encode(&bytes)
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            })
        } else {
            None
        };

        let (mut single_headers, mut multi_headers) = collect_headers(headers);

        let client_ip = client_ip(headers, remote);
        let geo = self.geo.lookup(self.geo_mode).await.to_header_value();
        let mut inject = |name: &str, value: String| {
            single_headers.insert(name.to_string(), value.clone());
            multi_headers.insert(name.to_string(), vec![value]);
        };
        inject(CLIENT_IP_HEADER, client_ip.clone());
        inject(LEGACY_CLIENT_IP_HEADER, client_ip);
        inject(GEO_HEADER, geo);
        inject(REQUEST_ID_HEADER, request_id.to_string());

        let raw_query = parts.uri.query().unwrap_or_default().to_string();
        let (query_string_parameters, multi_value_query_string_parameters) = parse_query(&raw_query);

        let event = InvocationEvent {
            path: parts.uri.path().to_string(),
            http_method: parts.method.to_string(),
            headers: single_headers,
            multi_value_headers: multi_headers,
            query_string_parameters,
            multi_value_query_string_parameters,
            body,
            is_base64_encoded,
            raw_url: raw_url(headers, &parts.uri),
            raw_query,
            route: target.route.clone(),
        };

        debug!(
            function = %target.name,
            request_id = %request_id,
            has_body = event.body.is_some(),
            base64 = event.is_base64_encoded,
            "Adapted request"
        );

        Ok(AdaptedRequest {
            event,
            client_context: self.identity.client_context(headers),
            request_id,
            accept: header_str(headers, header::ACCEPT.as_str()).map(str::to_string),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// A request carries a body only when it says so
pub fn declares_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    header_str(headers, header::CONTENT_LENGTH.as_str())
        .is_some_and(|value| value.trim().parse::<u64>().is_ok())
}

/// Whether a body with this content type travels as base64
pub fn should_base64_encode(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence.is_empty() {
        return false;
    }

    let is_text = essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json"
                | "application/javascript"
                | "application/xml"
                | "application/x-www-form-urlencoded"
                | "multipart/form-data"
                | "application/graphql"
        );
    !is_text
}

/// Single-valued and multi-valued header maps, names lower-cased.
/// Internal routing headers are dropped.
pub fn collect_headers(
    headers: &HeaderMap,
) -> (HashMap<String, String>, HashMap<String, Vec<String>>) {
    let mut multi: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if name == FUNCTION_NAME_HEADER || name == FUNCTION_ROUTE_HEADER {
            continue;
        }
        multi
            .entry(name.to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    let single = multi
        .iter()
        .map(|(name, values)| (name.clone(), values.join(", ")))
        .collect();
    (single, multi)
}

/// Simple query semantics: repeated keys are joined with ", " in the
/// single-valued map and kept in order in the multi-valued map.
pub fn parse_query(raw: &str) -> (HashMap<String, String>, HashMap<String, Vec<String>>) {
    let mut multi: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        multi.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    let single = multi
        .iter()
        .map(|(key, values)| (key.clone(), values.join(", ")))
        .collect();
    (single, multi)
}

/// Client address: first `x-forwarded-for` entry, else the socket peer
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').map(str::trim).find(|s| !s.is_empty()))
        .and_then(normalize_ip);

    forwarded
        .or_else(|| remote.map(|addr| canonical_ip(addr.ip()).to_string()))
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Strip brackets, ports and IPv4-mapped prefixes from an address
fn normalize_ip(raw: &str) -> Option<String> {
    let raw = raw.trim();

    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(canonical_ip(addr.ip()).to_string());
    }
    if let Ok(ip) = raw.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Some(canonical_ip(ip).to_string());
    }
    // IPv4 with a port
    if let Some((host, port)) = raw.rsplit_once(':') {
        if port.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Some(canonical_ip(ip).to_string());
            }
        }
    }
    None
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}

fn raw_url(headers: &HeaderMap, uri: &http::Uri) -> String {
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(headers, header::HOST.as_str())
        .or_else(|| uri.authority().map(http::uri::Authority::as_str))
        .unwrap_or("localhost");
    let path_and_query = uri
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);
    format!("{scheme}://{host}{path_and_query}")
}
