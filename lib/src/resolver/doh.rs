//! DNS-over-HTTPS, JSON API flavour
//!
//! `GET <url>?name=<host>` with `accept: application/dns-json`, as served
//! by AdGuard, Cloudflare and Google.

use std::{fmt, net::IpAddr, time::Duration};

use reqwest::{blocking::Client, header::ACCEPT, StatusCode};
use serde::Deserialize;

use crate::resolver::{Lookup, ResolveError};

pub const DNS_JSON: &str = "application/dns-json";

/// RCODE of a DNS answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsStatus {
    FormatError,
    ServerFailure,
    NonExistentDomain,
    NotImplemented,
    Refused,
    NotAuthorized,
    Unknown(u32),
}

impl DnsStatus {
    /// `None` for a successful answer
    pub fn from_code(code: u32) -> Option<DnsStatus> {
        match code {
            0 => None,
            1 => Some(DnsStatus::FormatError),
            2 => Some(DnsStatus::ServerFailure),
            3 => Some(DnsStatus::NonExistentDomain),
            4 => Some(DnsStatus::NotImplemented),
            5 => Some(DnsStatus::Refused),
            9 => Some(DnsStatus::NotAuthorized),
            other => Some(DnsStatus::Unknown(other)),
        }
    }
}

impl fmt::Display for DnsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsStatus::FormatError => write!(f, "invalid query format"),
            DnsStatus::ServerFailure => write!(f, "server failure"),
            DnsStatus::NonExistentDomain => write!(f, "non-existent domain"),
            DnsStatus::NotImplemented => write!(f, "not implemented"),
            DnsStatus::Refused => write!(f, "query refused"),
            DnsStatus::NotAuthorized => write!(f, "not authorized"),
            DnsStatus::Unknown(code) => write!(f, "unknown status {code}"),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct DohResponse {
    status: u32,
    #[serde(default)]
    answer: Vec<DohAnswer>,
}

#[derive(Deserialize, Debug)]
struct DohAnswer {
    #[serde(rename = "type", default)]
    record_type: u16,
    data: String,
}

pub struct DohLookup {
    url: String,
    client: Client,
}

impl DohLookup {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ResolveError> {
        // lookups must never loop back through a proxy, this one included
        let client = Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(ResolveError::HttpClient)?;

        Ok(DohLookup {
            url: url.to_owned(),
            client,
        })
    }
}

impl Lookup for DohLookup {
    fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("name", host)])
            .header(ACCEPT, DNS_JSON)
            .send()
            .map_err(|error| ResolveError::Http {
                host: host.to_owned(),
                error,
            })?;

        if response.status() != StatusCode::OK {
            return Err(ResolveError::HttpStatus(response.status().as_u16()));
        }

        let body = response.text().map_err(|error| ResolveError::Http {
            host: host.to_owned(),
            error,
        })?;
        parse_response(host, &body)
    }
}

/// Every answer whose data is an IP address, in answer order. CNAME
/// records and the like are skipped.
pub fn parse_response(host: &str, body: &str) -> Result<Vec<IpAddr>, ResolveError> {
    let response: DohResponse = serde_json::from_str(body)
        .map_err(|error| ResolveError::InvalidResponse(error.to_string()))?;

    if let Some(status) = DnsStatus::from_code(response.status) {
        return Err(ResolveError::Dns {
            host: host.to_owned(),
            status,
        });
    }

    let addresses: Vec<IpAddr> = response
        .answer
        .iter()
        .filter_map(|answer| {
            let address = answer.data.parse::<IpAddr>().ok();
            if address.is_none() {
                trace!("skipping DNS record of type {}: {}", answer.record_type, answer.data);
            }
            address
        })
        .collect();

    if addresses.is_empty() {
        return Err(ResolveError::NoAddress(host.to_owned()));
    }
    Ok(addresses)
}
