//! Request line and header parsing
//!
//! Only what the proxy needs is extracted: the method, the target authority
//! and the size of the header block. Absolute-form requests are rewritten to
//! origin-form before being forwarded.

use std::fmt;

use burrow_command::config::MAX_HOST_NAME_LEN;
use url::{Host, Url};

use crate::protocol::ClientKind;

pub const MAX_HEADERS: usize = 128;

/// headers meant for the proxy itself, never forwarded
const HOP_BY_HOP: [&str; 2] = ["proxy-connection", "proxy-authorization"];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(httparse::Error),
    #[error("request carries no target host")]
    MissingHost,
    #[error("invalid authority {0:?}")]
    InvalidAuthority(String),
    #[error("unsupported scheme {0}")]
    UnsupportedScheme(String),
    #[error("host name of {0} bytes is too long")]
    HostTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// lowercase domain or IP literal, IPv6 without brackets
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub kind: ClientKind,
    pub target: Target,
    /// length of the request line and headers, terminator included
    pub header_len: usize,
    /// header block to forward instead of the received one
    pub rewritten: Option<Vec<u8>>,
}

/// `Ok(None)` while the header block is incomplete
pub fn parse(buf: &[u8]) -> Result<Option<ParsedRequest>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let header_len = match request.parse(buf).map_err(RequestError::Malformed)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    // a complete parse always fills these
    let (Some(method), Some(path), Some(version)) =
        (request.method, request.path, request.version)
    else {
        return Err(RequestError::Malformed(httparse::Error::Token));
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(Some(ParsedRequest {
            method: method.to_owned(),
            kind: ClientKind::Https,
            target: parse_authority(path, 443)?,
            header_len,
            rewritten: None,
        }));
    }

    let host_header = request
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("host"));

    if path.starts_with('/') || path == "*" {
        let host = host_header.ok_or(RequestError::MissingHost)?;
        let authority = std::str::from_utf8(host.value).map_err(|_| {
            RequestError::InvalidAuthority(String::from_utf8_lossy(host.value).to_string())
        })?;

        return Ok(Some(ParsedRequest {
            method: method.to_owned(),
            kind: ClientKind::Http,
            target: parse_authority(authority.trim(), 80)?,
            header_len,
            rewritten: None,
        }));
    }

    let url = Url::parse(path).map_err(|_| RequestError::InvalidAuthority(path.to_owned()))?;
    let default_port = match url.scheme() {
        "http" => 80,
        "https" => 443,
        scheme => return Err(RequestError::UnsupportedScheme(scheme.to_owned())),
    };
    let target = Target {
        host: host_to_string(url.host())?,
        port: url.port().unwrap_or(default_port),
    };
    check_host_len(&target.host)?;

    let mut origin = url.path().to_owned();
    if let Some(query) = url.query() {
        origin.push('?');
        origin.push_str(query);
    }

    let mut rewritten = format!("{method} {origin} HTTP/1.{version}\r\n").into_bytes();
    for header in request.headers.iter() {
        if HOP_BY_HOP
            .iter()
            .any(|name| header.name.eq_ignore_ascii_case(name))
        {
            continue;
        }
        rewritten.extend_from_slice(header.name.as_bytes());
        rewritten.extend_from_slice(b": ");
        rewritten.extend_from_slice(header.value);
        rewritten.extend_from_slice(b"\r\n");
    }
    if host_header.is_none() {
        let host = match url.port() {
            Some(port) => format!("Host: {}:{port}\r\n", url_host_str(&url)),
            None => format!("Host: {}\r\n", url_host_str(&url)),
        };
        rewritten.extend_from_slice(host.as_bytes());
    }
    rewritten.extend_from_slice(b"\r\n");

    Ok(Some(ParsedRequest {
        method: method.to_owned(),
        kind: ClientKind::Http,
        target,
        header_len,
        rewritten: Some(rewritten),
    }))
}

/// Parses `host[:port]`, IPv6 literals in brackets
pub fn parse_authority(authority: &str, default_port: u16) -> Result<Target, RequestError> {
    if authority.is_empty() {
        return Err(RequestError::MissingHost);
    }
    let invalid = || RequestError::InvalidAuthority(authority.to_owned());

    // a scheme without default port keeps an explicit `:80` or `:443`
    let url = Url::parse(&format!("authority://{authority}")).map_err(|_| invalid())?;
    if !url.path().is_empty()
        || url.query().is_some()
        || url.fragment().is_some()
        || !url.username().is_empty()
        || url.password().is_some()
    {
        return Err(invalid());
    }

    let host = host_to_string(url.host())?;
    if host.is_empty() {
        return Err(RequestError::MissingHost);
    }
    check_host_len(&host)?;

    let port = url.port().unwrap_or(default_port);
    if port == 0 {
        return Err(invalid());
    }

    Ok(Target {
        host: host.to_ascii_lowercase(),
        port,
    })
}

fn host_to_string(host: Option<Host<&str>>) -> Result<String, RequestError> {
    match host {
        Some(Host::Domain(domain)) => Ok(domain.to_owned()),
        Some(Host::Ipv4(address)) => Ok(address.to_string()),
        Some(Host::Ipv6(address)) => Ok(address.to_string()),
        None => Err(RequestError::MissingHost),
    }
}

fn url_host_str(url: &Url) -> &str {
    url.host_str().unwrap_or_default()
}

fn check_host_len(host: &str) -> Result<(), RequestError> {
    if host.len() > MAX_HOST_NAME_LEN {
        return Err(RequestError::HostTooLong(host.len()));
    }
    Ok(())
}
