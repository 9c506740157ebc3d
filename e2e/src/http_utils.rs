/// a complete response, the connection closes after it
pub fn http_ok_response<S: Into<String>>(content: S) -> String {
    let content = content.into();
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content.len(),
        content
    )
}

/// an absolute-form request, as a browser sends it to a proxy
pub fn http_request<S1, S2>(method: S1, url: S2, host: &str) -> String
where
    S1: Into<String>,
    S2: Into<String>,
{
    format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
        method.into(),
        url.into(),
        host
    )
}

pub fn connect_request(authority: &str) -> String {
    format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n")
}

/// DNS JSON answer of a DNS-over-HTTPS server
pub fn doh_answer(name: &str, address: Option<&str>) -> String {
    match address {
        Some(address) => format!(
            "{{\"Status\":0,\"Answer\":[{{\"name\":\"{name}.\",\"type\":1,\"TTL\":60,\"data\":\"{address}\"}}]}}"
        ),
        None => "{\"Status\":3}".to_owned(),
    }
}
