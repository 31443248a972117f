//! Completed network request records.
//!
//! Request times are in milliseconds on the trace clock; `timing` offsets are
//! milliseconds relative to the start of the request, with `-1` meaning the
//! phase did not happen (e.g. an already established connection).

use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::Milliseconds;

/// Schemes that never touch the network.
pub const NON_NETWORK_SCHEMES: [&str; 6] = [
    "blob",
    "data",
    "intent",
    "file",
    "filesystem",
    "chrome-extension",
];

/// Resource type as reported by the browser.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    TextTrack,
    XHR,
    Fetch,
    Prefetch,
    EventSource,
    WebSocket,
    Manifest,
    SignedExchange,
    Ping,
    CSPViolationReport,
    Preflight,
    #[default]
    Other,
}

/// Request priority as reported by the browser.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

impl Priority {
    /// Start-position penalty in milliseconds applied when ordering ready
    /// requests, so that high priority requests grab connections first.
    pub fn start_time_penalty_ms(self) -> Milliseconds {
        match self {
            Priority::VeryHigh => 0.0,
            Priority::High => 250.0,
            Priority::Medium => 500.0,
            Priority::Low => 1000.0,
            Priority::VeryLow => 2000.0,
        }
    }
}

/// URL components used for grouping and connection modelling.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedUrl {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    /// Scheme + host + port, default port omitted (`"null"` for opaque origins)
    pub security_origin: String,
}

impl ParsedUrl {
    /// Parses a URL string; unparsable input yields an opaque origin.
    pub fn parse(raw: &str) -> Self {
        match Url::parse(raw) {
            Ok(url) => Self {
                scheme: url.scheme().to_string(),
                host: url.host_str().unwrap_or_default().to_string(),
                port: url.port_or_known_default(),
                security_origin: url.origin().ascii_serialization(),
            },
            Err(_) => Self {
                security_origin: "null".to_string(),
                ..Default::default()
            },
        }
    }

    /// Whether the scheme implies a TLS handshake.
    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss")
    }
}

/// Connection and request phase offsets (ms from request start, `-1` = skipped).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTiming {
    pub dns_start: f64,
    pub dns_end: f64,
    pub connect_start: f64,
    pub connect_end: f64,
    pub ssl_start: f64,
    pub ssl_end: f64,
    pub send_start: f64,
    #[serde(default = "unset")]
    pub send_end: f64,
    pub receive_headers_end: f64,
}

fn unset() -> f64 {
    -1.0
}

impl Default for ResourceTiming {
    fn default() -> Self {
        Self {
            dns_start: -1.0,
            dns_end: -1.0,
            connect_start: -1.0,
            connect_end: -1.0,
            ssl_start: -1.0,
            ssl_end: -1.0,
            send_start: -1.0,
            send_end: -1.0,
            receive_headers_end: -1.0,
        }
    }
}

impl ResourceTiming {
    /// Timing of a request that reused an existing connection.
    pub fn reused(send_start: f64, receive_headers_end: f64) -> Self {
        Self {
            send_start,
            send_end: send_start,
            receive_headers_end,
            ..Default::default()
        }
    }

    /// Timing of a request that opened a fresh connection.
    pub fn fresh(dns_ms: f64, connect_ms: f64, ssl_ms: Option<f64>, receive_headers_end: f64) -> Self {
        let connect_start = dns_ms;
        let connect_end = connect_start + connect_ms;
        let (ssl_start, ssl_end) = match ssl_ms {
            Some(ssl) => (connect_end - ssl, connect_end),
            None => (-1.0, -1.0),
        };
        Self {
            dns_start: 0.0,
            dns_end: dns_ms,
            connect_start,
            connect_end,
            ssl_start,
            ssl_end,
            send_start: connect_end,
            send_end: connect_end,
            receive_headers_end,
        }
    }
}

/// A script stack from the initiator, chained through async parents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatorStack {
    #[serde(default)]
    pub call_frames: Vec<crate::trace::CallFrame>,
    #[serde(default)]
    pub parent: Option<Box<InitiatorStack>>,
}

/// What caused a request to be issued.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Initiator {
    /// `parser`, `script`, `preload`, `other`, ...
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub stack: Option<InitiatorStack>,
}

impl Initiator {
    pub fn parser(url: impl Into<String>) -> Self {
        Self {
            kind: "parser".to_string(),
            url: Some(url.into()),
            stack: None,
        }
    }

    pub fn script(stack: InitiatorStack) -> Self {
        Self {
            kind: "script".to_string(),
            url: None,
            stack: Some(stack),
        }
    }
}

/// A completed network request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub request_id: String,
    pub url: String,
    pub parsed_url: ParsedUrl,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub transfer_size: f64,
    #[serde(default)]
    pub resource_size: f64,
    pub network_request_time: Milliseconds,
    #[serde(default)]
    pub response_headers_end_time: Milliseconds,
    pub network_end_time: Milliseconds,
    #[serde(default)]
    pub from_disk_cache: bool,
    #[serde(default)]
    pub from_worker: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default = "default_true")]
    pub finished: bool,
    #[serde(default = "default_status")]
    pub status_code: u16,
    #[serde(default)]
    pub timing: Option<ResourceTiming>,
    #[serde(default)]
    pub connection_id: Option<u64>,
    #[serde(default)]
    pub connection_reused: bool,
    #[serde(default)]
    pub initiator: Initiator,
    #[serde(default)]
    pub initiator_request_id: Option<String>,
    /// Ids of the requests that redirected to this one, earliest first
    #[serde(default)]
    pub redirects: Vec<String>,
    #[serde(default)]
    pub redirect_destination_id: Option<String>,
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub document_url: Option<String>,
    /// Observed server response time, when the browser reported one
    #[serde(default)]
    pub server_response_time: Option<Milliseconds>,
}

fn default_true() -> bool {
    true
}

fn default_status() -> u16 {
    200
}

impl NetworkRequest {
    /// Creates a finished request; the URL is parsed for its origin.
    pub fn new(
        request_id: impl Into<String>,
        url: impl Into<String>,
        network_request_time: Milliseconds,
        network_end_time: Milliseconds,
    ) -> Self {
        let url = url.into();
        let parsed_url = ParsedUrl::parse(&url);
        let protocol = if parsed_url.scheme == "data" {
            "data".to_string()
        } else {
            "http/1.1".to_string()
        };
        Self {
            request_id: request_id.into(),
            url,
            parsed_url,
            protocol,
            resource_type: ResourceType::Other,
            priority: Priority::Medium,
            mime_type: String::new(),
            transfer_size: 0.0,
            resource_size: 0.0,
            network_request_time,
            response_headers_end_time: network_request_time,
            network_end_time,
            from_disk_cache: false,
            from_worker: false,
            failed: false,
            finished: true,
            status_code: 200,
            timing: None,
            connection_id: None,
            connection_reused: false,
            initiator: Initiator::default(),
            initiator_request_id: None,
            redirects: Vec::new(),
            redirect_destination_id: None,
            frame_id: None,
            document_url: None,
            server_response_time: None,
        }
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Sets both transfer and resource size.
    pub fn with_size(mut self, bytes: f64) -> Self {
        self.transfer_size = bytes;
        self.resource_size = bytes;
        self
    }

    pub fn with_timing(mut self, timing: ResourceTiming) -> Self {
        self.response_headers_end_time = self.network_request_time + timing.receive_headers_end.max(0.0);
        self.timing = Some(timing);
        self
    }

    pub fn with_initiator(mut self, initiator: Initiator) -> Self {
        self.initiator = initiator;
        self
    }

    pub fn with_initiator_request(mut self, request_id: impl Into<String>) -> Self {
        self.initiator_request_id = Some(request_id.into());
        self
    }

    pub fn with_redirects(mut self, redirects: Vec<String>) -> Self {
        self.redirects = redirects;
        self
    }

    pub fn with_frame(mut self, frame_id: impl Into<String>, document_url: impl Into<String>) -> Self {
        self.frame_id = Some(frame_id.into());
        self.document_url = Some(document_url.into());
        self
    }

    pub fn from_disk_cache(mut self) -> Self {
        self.from_disk_cache = true;
        self
    }

    /// Origin used for connection grouping.
    pub fn origin(&self) -> &str {
        &self.parsed_url.security_origin
    }

    /// Whether the request was served without a network protocol.
    pub fn is_non_network_protocol(&self) -> bool {
        NON_NETWORK_SCHEMES.contains(&self.protocol.as_str())
            || NON_NETWORK_SCHEMES.contains(&self.parsed_url.scheme.as_str())
    }

    pub fn is_h2(&self) -> bool {
        self.protocol == "h2"
    }

    pub fn is_h3(&self) -> bool {
        self.protocol.starts_with("h3")
    }

    pub fn is_document(&self) -> bool {
        self.resource_type == ResourceType::Document
    }
}

impl AsRef<NetworkRequest> for NetworkRequest {
    fn as_ref(&self) -> &NetworkRequest {
        self
    }
}

/// Compares two URLs ignoring their fragments.
pub(crate) fn equal_without_fragment(a: &str, b: &str) -> bool {
    fn strip(u: &str) -> &str {
        u.split_once('#').map(|(head, _)| head).unwrap_or(u)
    }
    strip(a) == strip(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_url_origin() {
        let parsed = ParsedUrl::parse("https://example.com/a/b?c=1");
        assert_eq!(parsed.scheme, "https");
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, Some(443));
        assert_eq!(parsed.security_origin, "https://example.com");
        assert!(parsed.is_secure());

        let custom = ParsedUrl::parse("http://example.com:8080/");
        assert_eq!(custom.security_origin, "http://example.com:8080");
    }

    #[test]
    fn test_data_url_is_non_network() {
        let req = NetworkRequest::new("1", "data:image/png;base64,AAAA", 0.0, 1.0);
        assert!(req.is_non_network_protocol());
        assert_eq!(req.origin(), "null");
    }

    #[test]
    fn test_priority_penalty_ordering() {
        assert!(Priority::VeryHigh.start_time_penalty_ms() < Priority::High.start_time_penalty_ms());
        assert!(Priority::Low.start_time_penalty_ms() < Priority::VeryLow.start_time_penalty_ms());
    }

    #[test]
    fn test_fresh_timing_layout() {
        let timing = ResourceTiming::fresh(10.0, 40.0, Some(20.0), 120.0);
        assert_eq!(timing.connect_start, 10.0);
        assert_eq!(timing.connect_end, 50.0);
        assert_eq!(timing.ssl_start, 30.0);
        assert_eq!(timing.send_start, 50.0);
    }

    #[test]
    fn test_request_deserialization_defaults() {
        let json = r#"{
            "requestId": "7",
            "url": "https://a.test/",
            "parsedUrl": {"scheme": "https", "host": "a.test", "port": 443, "securityOrigin": "https://a.test"},
            "resourceType": "Document",
            "priority": "VeryHigh",
            "networkRequestTime": 0,
            "networkEndTime": 100
        }"#;
        let req: NetworkRequest = serde_json::from_str(json).unwrap();
        assert!(req.finished);
        assert_eq!(req.status_code, 200);
        assert!(req.is_document());
        assert_eq!(req.priority, Priority::VeryHigh);
    }

    #[test]
    fn test_equal_without_fragment() {
        assert!(equal_without_fragment("https://a.test/#x", "https://a.test/"));
        assert!(!equal_without_fragment("https://a.test/a", "https://a.test/b"));
    }
}
