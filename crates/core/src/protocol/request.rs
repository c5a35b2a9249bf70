use std::fmt;

use crate::error::{ParseErrorKind, RtspError};

/// RTSP request methods (RFC 2326 §10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    /// Anything else (ANNOUNCE, RECORD, REDIRECT, extensions).
    Other(String),
}

impl Method {
    fn parse(token: &str) -> Self {
        match token {
            "OPTIONS" => Self::Options,
            "DESCRIBE" => Self::Describe,
            "SETUP" => Self::Setup,
            "PLAY" => Self::Play,
            "PAUSE" => Self::Pause,
            "TEARDOWN" => Self::Teardown,
            "GET_PARAMETER" => Self::GetParameter,
            "SET_PARAMETER" => Self::SetParameter,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Pause => "PAUSE",
            Self::Teardown => "TEARDOWN",
            Self::GetParameter => "GET_PARAMETER",
            Self::SetParameter => "SET_PARAMETER",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed RTSP request head (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. The body, if any,
/// is consumed by the connection using [`content_length`](Self::content_length)
/// and is not kept.
#[derive(Debug)]
pub struct RtspRequest {
    pub method: Method,
    pub uri: String,
    pub version: String,
    /// Headers as received; lookups through [`get_header`](Self::get_header).
    pub headers: Vec<(String, String)>,
}

impl RtspRequest {
    /// Parse a request head: request line, headers, blank line.
    ///
    /// Every request must carry `CSeq` (RFC 2326 §12.17); a request without
    /// one is rejected with [`ParseErrorKind::MissingCSeq`].
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let parse_error = |kind| RtspError::Parse { kind };
        let mut lines = raw.lines().skip_while(|l| l.trim().is_empty());

        let request_line = lines
            .next()
            .ok_or_else(|| parse_error(ParseErrorKind::EmptyRequest))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let [method, uri, version] = parts[..] else {
            return Err(parse_error(ParseErrorKind::InvalidRequestLine));
        };
        if !version.starts_with("RTSP/") {
            return Err(parse_error(ParseErrorKind::InvalidRequestLine));
        }
        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| parse_error(ParseErrorKind::InvalidHeader))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(parse_error(ParseErrorKind::InvalidHeader));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        let request = RtspRequest {
            method: Method::parse(method),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        };
        if request.cseq().is_none() {
            return Err(parse_error(ParseErrorKind::MissingCSeq));
        }
        Ok(request)
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Session ID from the `Session` header, without `;timeout=`.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .and_then(|v| v.split(';').next())
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Declared body length; 0 when absent or unparsable.
    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}
