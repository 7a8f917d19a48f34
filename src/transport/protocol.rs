//! Worker protocol message types.
//!
//! Requests are a single JSON object. Responses are newline-separated
//! metadata directives ending in `end-header`, followed by the raw body.
//!
//! ```text
//! http-status 200
//! mime-type text/html
//! header-field true Cache-Control no-store
//! end-header
//! <body bytes>
//! ```

use std::collections::BTreeMap;
use std::io;

use anyhow::{bail, ensure, Context, Result};
use serde::Serialize;
use serde_json::ser::{CharEscape, Formatter};
use tracing::{debug, error, warn};

/// The only status for which a body is forwarded.
pub const HTTP_OK: u16 = 200;

/// Largest POST body we parse into form fields (1 MiB).
pub const MAX_POST_SIZE: usize = 1024 * 1024;

/// Prefix of a worker's reply to `ExitNow` and `GetPID`.
const PID_REPLY_PREFIX: &str = "gosp-pid ";

/// Everything a worker needs to know about one HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestContext {
    pub scheme: String,
    pub local_hostname: String,
    pub port: u16,
    pub uri: String,
    pub path_info: String,
    pub query_args: String,
    pub url: String,
    pub method: String,
    pub request_line: String,
    /// Milliseconds since the Unix epoch.
    pub request_time: i64,
    pub remote_hostname: String,
    pub remote_ip: String,
    pub filename: String,
    pub admin_email: String,
    pub post_data: BTreeMap<String, String>,
    pub get_data: BTreeMap<String, String>,
    pub header_data: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
}

/// Top-level message sent to a worker.
#[derive(Debug, Serialize)]
pub struct ServiceRequest<'a> {
    #[serde(rename = "UserData", skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a RequestContext>,

    #[serde(rename = "GetPID", skip_serializing_if = "std::ops::Not::not")]
    get_pid: bool,

    #[serde(rename = "ExitNow", skip_serializing_if = "std::ops::Not::not")]
    exit_now: bool,
}

impl<'a> ServiceRequest<'a> {
    /// Ask the worker to render a page.
    pub const fn page(ctx: &'a RequestContext) -> Self {
        Self {
            user_data: Some(ctx),
            get_pid: false,
            exit_now: false,
        }
    }

    /// Ask the worker for its process id (liveness probe).
    pub const fn get_pid() -> Self {
        Self {
            user_data: None,
            get_pid: true,
            exit_now: false,
        }
    }

    /// Ask the worker to shut down cleanly.
    pub const fn exit_now() -> Self {
        Self {
            user_data: None,
            get_pid: false,
            exit_now: true,
        }
    }

    /// Serialize for the wire.
    ///
    /// Strings escape only `"` and `\`; every other byte, control characters
    /// included, is written as-is. Workers depend on this exact encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, MinimalEscape);
        self.serialize(&mut ser)
            .context("Failed to serialize worker request")?;
        Ok(buf)
    }
}

/// Compact JSON formatter that escapes only quote and backslash.
struct MinimalEscape;

impl Formatter for MinimalEscape {
    fn write_char_escape<W>(&mut self, writer: &mut W, char_escape: CharEscape) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let raw = match char_escape {
            CharEscape::Quote => return writer.write_all(b"\\\""),
            CharEscape::ReverseSolidus => return writer.write_all(b"\\\\"),
            CharEscape::Solidus => b'/',
            CharEscape::Backspace => b'\x08',
            CharEscape::FormFeed => b'\x0c',
            CharEscape::LineFeed => b'\n',
            CharEscape::CarriageReturn => b'\r',
            CharEscape::Tab => b'\t',
            CharEscape::AsciiControl(byte) => byte,
        };
        writer.write_all(&[raw])
    }
}

/// Split a raw query string into arguments.
///
/// Pairs are separated by `&` and split at the first `=`. A pair without
/// `=` maps to an empty value; empty keys are kept. No percent-decoding is
/// applied.
pub fn parse_get_args(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.to_string(), value.to_string())
        })
        .collect()
}

/// Decode an `application/x-www-form-urlencoded` POST body.
pub fn parse_post_data(body: &[u8]) -> Result<BTreeMap<String, String>> {
    ensure!(
        body.len() <= MAX_POST_SIZE,
        "POST body of {} bytes exceeds the {MAX_POST_SIZE}-byte limit",
        body.len()
    );
    Ok(url::form_urlencoded::parse(body).into_owned().collect())
}

/// A header assignment requested by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    /// Replace earlier values of the field rather than append.
    pub replace: bool,
    pub name: String,
    pub value: String,
}

/// One metadata line from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    HttpStatus(u16),
    MimeType(String),
    HeaderField(HeaderField),
    ErrorMessage(String),
    DebugMessage(String),
    KeepAlive,
    EndHeader,
}

impl Directive {
    /// Parse one metadata line (without its newline).
    pub fn parse(line: &str) -> Result<Self> {
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        let directive = match key {
            "http-status" => Self::HttpStatus(
                value
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid HTTP status {value:?} from worker"))?,
            ),
            "mime-type" => Self::MimeType(value.to_string()),
            "header-field" => {
                let mut parts = value.splitn(3, ' ');
                let replace = match parts.next() {
                    Some("true") => true,
                    Some("false") => false,
                    other => bail!("Invalid header-field mode {other:?} from worker"),
                };
                let name = parts
                    .next()
                    .filter(|name| !name.is_empty())
                    .with_context(|| format!("header-field without a name: {line:?}"))?;
                Self::HeaderField(HeaderField {
                    replace,
                    name: name.to_string(),
                    value: parts.next().unwrap_or_default().to_string(),
                })
            }
            "error-message" => Self::ErrorMessage(value.to_string()),
            "debug-message" => Self::DebugMessage(value.to_string()),
            "keep-alive" => Self::KeepAlive,
            "end-header" => Self::EndHeader,
            _ => bail!("Unrecognized directive from worker: {line:?}"),
        };
        Ok(directive)
    }
}

/// A worker's parsed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub mime_type: Option<String>,
    pub headers: Vec<HeaderField>,
    /// Body bytes, present only when `status` is [`HTTP_OK`].
    pub body: Vec<u8>,
}

impl Default for ResponseEnvelope {
    fn default() -> Self {
        Self {
            status: HTTP_OK,
            mime_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl ResponseEnvelope {
    /// Parse a complete response stream.
    ///
    /// Directives are applied in order. Error and debug messages are logged
    /// here and go no further. The body starts immediately after the
    /// `end-header` line; a stream that never reaches it yields no body.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut envelope = Self::default();
        let mut rest = raw;

        while let Some(newline) = rest.iter().position(|&b| b == b'\n') {
            let line = std::str::from_utf8(&rest[..newline])
                .context("Worker sent a metadata line that is not UTF-8")?;
            rest = &rest[newline + 1..];

            match Directive::parse(line)? {
                Directive::EndHeader => {
                    if envelope.status == HTTP_OK {
                        envelope.body = rest.to_vec();
                    }
                    return Ok(envelope);
                }
                Directive::HttpStatus(status) => envelope.status = status,
                Directive::MimeType(mime) => envelope.mime_type = Some(mime),
                Directive::HeaderField(field) => envelope.headers.push(field),
                Directive::ErrorMessage(msg) => error!(message = %msg, "Worker reported an error"),
                Directive::DebugMessage(msg) => debug!(message = %msg, "Worker debug message"),
                Directive::KeepAlive => {}
            }
        }

        warn!(
            trailing_bytes = rest.len(),
            "Worker response ended before end-header"
        );
        Ok(envelope)
    }
}

/// Parse a `gosp-pid <pid>` reply.
pub fn parse_pid_reply(raw: &[u8]) -> Result<u32> {
    let text = String::from_utf8_lossy(raw);
    let pid: i64 = text
        .trim_end()
        .strip_prefix(PID_REPLY_PREFIX)
        .and_then(|pid| pid.trim().parse().ok())
        .with_context(|| format!("Failed to parse worker reply {text:?} as a process id"))?;
    ensure!(pid > 0, "Worker reported invalid process id {pid}");
    u32::try_from(pid).with_context(|| format!("Process id {pid} out of range"))
}
