//! Receiver for logs shipped by the mobile detection app.
//!
//! The app posts `{"type": "...", "time": "...", "message": "..."}` to
//! `POST /log`; each entry is re-emitted through the `log` facade.

use anyhow::Result;
use serde::Deserialize;

use crate::http::{self, HttpRequest, HttpResponse, ServerHandle};

const MAX_ENTRY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppLogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub time: Option<String>,
    pub message: serde_json::Value,
}

/// One posted body as it will be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum LogLine {
    Entry(AppLogEntry),
    Raw(String),
}

impl LogLine {
    pub fn parse(body: &[u8]) -> Self {
        match serde_json::from_slice::<AppLogEntry>(body) {
            Ok(entry) => LogLine::Entry(entry),
            Err(_) => LogLine::Raw(String::from_utf8_lossy(body).into_owned()),
        }
    }

    pub fn level(&self) -> log::Level {
        match self {
            LogLine::Entry(entry) => match entry.kind.as_str() {
                "error" => log::Level::Error,
                "warn" => log::Level::Warn,
                _ => log::Level::Info,
            },
            LogLine::Raw(_) => log::Level::Info,
        }
    }

    pub fn render(&self) -> String {
        match self {
            LogLine::Entry(entry) => {
                let message = match &entry.message {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                format!("[{}] {}", entry.time.as_deref().unwrap_or(""), message)
            }
            LogLine::Raw(body) => format!("RAW: {body}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct LogSink {
    received: u64,
}

impl LogSink {
    pub fn received(&self) -> u64 {
        self.received
    }
}

impl http::Handler for LogSink {
    fn handle(&mut self, request: HttpRequest) -> HttpResponse {
        if request.method != "POST" || request.path != "/log" {
            return HttpResponse::new(404, "text/plain; charset=utf-8", Vec::new());
        }
        let line = LogLine::parse(&request.body);
        log::log!(target: "app", line.level(), "{}", line.render());
        self.received += 1;
        HttpResponse::text(200, "ok")
    }

    fn max_body(&self) -> usize {
        MAX_ENTRY_BYTES
    }
}

pub fn spawn(addr: &str) -> Result<ServerHandle> {
    http::spawn(addr, "app-log-sink", LogSink::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Handler;
    use std::collections::HashMap;

    fn request(method: &str, path: &str, body: &[u8]) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            query: Vec::new(),
            headers: HashMap::new(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn entries_map_to_levels() {
        let line = LogLine::parse(br#"{"type":"error","time":"12:00:01","message":"model load failed"}"#);
        assert_eq!(line.level(), log::Level::Error);
        assert_eq!(line.render(), "[12:00:01] model load failed");

        let line = LogLine::parse(br#"{"type":"warn","message":"slow frame"}"#);
        assert_eq!(line.level(), log::Level::Warn);
        assert_eq!(line.render(), "[] slow frame");

        let line = LogLine::parse(br#"{"type":"log","message":{"boxes":3}}"#);
        assert_eq!(line.level(), log::Level::Info);
        assert_eq!(line.render(), "[] {\"boxes\":3}");
    }

    #[test]
    fn non_json_bodies_are_raw() {
        let line = LogLine::parse(b"plain text");
        assert_eq!(line, LogLine::Raw("plain text".to_string()));
        assert_eq!(line.render(), "RAW: plain text");
    }

    #[test]
    fn only_post_log_is_accepted() {
        let mut sink = LogSink::default();
        let ok = sink.handle(request("POST", "/log", b"{}"));
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body, b"ok");
        assert_eq!(sink.handle(request("GET", "/log", b"")).status, 404);
        assert_eq!(sink.handle(request("POST", "/other", b"")).status, 404);
        assert_eq!(sink.received(), 1);
    }
}
