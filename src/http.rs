//! Minimal HTTP/1.1 plumbing for the local services.
//!
//! One request per connection, answered with `Connection: close`. Requests
//! are handled sequentially on a background thread; handlers that need to
//! do long work hand it off to their own threads.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Percent-decoded path without the query string.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First value of a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// `200` JSON body readable from any origin.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(200, "application/json; charset=utf-8", body)
                .with_header("Access-Control-Allow-Origin", "*"),
            Err(err) => {
                log::error!("failed to encode response: {}", err);
                Self::error(500, "encode_failed")
            }
        }
    }

    pub fn error(status: u16, code: &str) -> Self {
        let body = serde_json::json!({ "error": code }).to_string();
        Self::new(status, "application/json; charset=utf-8", body)
    }

    pub fn not_found() -> Self {
        Self::error(404, "not_found")
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

pub fn write_response<W: Write>(stream: &mut W, response: &HttpResponse) -> Result<()> {
    let mut header = format!(
        "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status_line(response.status),
        response.content_type,
        response.body.len()
    );
    for (name, value) in &response.headers {
        header.push_str(name);
        header.push_str(": ");
        header.push_str(value);
        header.push_str("\r\n");
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
pub enum RequestError {
    TooLarge,
    Malformed(anyhow::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Malformed(err.into())
    }
}

/// Reads the request head and a `Content-Length` body of at most `max_body` bytes.
pub fn read_request<R: Read>(stream: &mut R, max_body: usize) -> Result<HttpRequest, RequestError> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let head_end = loop {
        if let Some(pos) = find_header_end(&data) {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::TooLarge);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!("connection closed before headers")));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("empty request")))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing method")))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing path")))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(anyhow!("invalid content-length")))?,
        None => 0,
    };
    if content_length > max_body {
        return Err(RequestError::TooLarge);
    }
    let mut body = data[head_end + 4..].to_vec();
    body.truncate(content_length);
    if body.len() < content_length {
        let mut rest = vec![0u8; content_length - body.len()];
        stream.read_exact(&mut rest)?;
        body.extend_from_slice(&rest);
    }

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, Vec::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: percent_decode(path),
        query,
        headers,
        body,
    })
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// `application/x-www-form-urlencoded` pairs; `+` means space.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode(&k.replace('+', " ")),
                percent_decode(&v.replace('+', " ")),
            )
        })
        .collect()
}

fn percent_decode(value: &str) -> String {
    match urlencoding::decode(value) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(value.as_bytes()))
            .into_owned(),
    }
}

/// Content type from a file extension.
pub fn guess_mime(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("txt") | Some("log") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Request handler run on the server thread.
pub trait Handler: Send + 'static {
    fn handle(&mut self, request: HttpRequest) -> HttpResponse;

    /// Largest accepted request body.
    fn max_body(&self) -> usize {
        64 * 1024
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

/// Binds `addr` and serves `handler` on a background thread until stopped.
pub fn spawn<H: Handler>(addr: &str, name: &'static str, handler: H) -> Result<ServerHandle> {
    let configured: SocketAddr = addr
        .parse()
        .map_err(|e| anyhow!("invalid listen address '{}': {}", addr, e))?;
    let listener = TcpListener::bind(configured)?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(err) = serve(listener, handler, shutdown_thread) {
                log::error!("{} stopped: {}", name, err);
            }
        })?;

    Ok(ServerHandle {
        addr,
        shutdown,
        join: Some(join),
    })
}

fn serve<H: Handler>(listener: TcpListener, mut handler: H, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &mut handler) {
                    log::warn!("request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection<H: Handler>(mut stream: TcpStream, handler: &mut H) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let response = match read_request(&mut stream, handler.max_body()) {
        Ok(request) => {
            log::debug!("{} {}", request.method, request.path);
            handler.handle(request)
        }
        Err(RequestError::TooLarge) => HttpResponse::error(413, "request_too_large"),
        Err(RequestError::Malformed(err)) => {
            log::debug!("malformed request: {}", err);
            HttpResponse::error(400, "bad_request")
        }
    };
    write_response(&mut stream, &response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_query_and_body() {
        let raw = b"POST /api/upload?filename=a%20b.jpg&x=1+2 HTTP/1.1\r\n\
                    Host: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let request = read_request(&mut Cursor::new(raw.to_vec()), 1024).expect("request");
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/upload");
        assert_eq!(request.query_param("filename"), Some("a b.jpg"));
        assert_eq!(request.query_param("x"), Some("1 2"));
        assert_eq!(request.header("Host"), Some("localhost"));
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn decodes_percent_encoded_paths() {
        let raw = b"GET /images/%E5%9B%BE.jpg?dataset=mouse HTTP/1.1\r\n\r\n";
        let request = read_request(&mut Cursor::new(raw.to_vec()), 0).expect("request");
        assert_eq!(request.path, "/images/\u{56fe}.jpg");
    }

    #[test]
    fn oversized_body_is_rejected() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 100\r\n\r\n";
        let result = read_request(&mut Cursor::new(raw.to_vec()), 10);
        assert!(matches!(result, Err(RequestError::TooLarge)));
    }

    #[test]
    fn response_carries_length_and_extra_headers() -> Result<()> {
        let mut out = Vec::new();
        let response = HttpResponse::json(&serde_json::json!({"ok": true}));
        write_response(&mut out, &response)?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"ok\":true}"));
        Ok(())
    }
}
