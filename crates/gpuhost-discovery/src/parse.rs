//! Pure parsers for probe output. Input is untrusted text; bad lines are skipped.

use regex_lite::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

fn url_port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^:/\s]+:(\d+)/").expect("valid url port pattern"))
}

fn socket_port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":(\d+)\s").expect("valid socket port pattern"))
}

fn any_port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":(\d+)").expect("valid port pattern"))
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"token=([A-Za-z0-9]+)").expect("valid token pattern"))
}

/// Generated server tokens are at least this long
const FULL_TOKEN_LEN: usize = 32;

fn nonzero_port(text: &str) -> Option<u16> {
    text.parse::<u16>().ok().filter(|port| *port != 0)
}

/// First usable `port` field from line-delimited JSON records
pub fn port_from_json_lines(output: &str) -> Option<u16> {
    server_from_json_lines(output).map(|(port, _)| port)
}

/// Port and non-empty `token` of the first JSON record with a usable port
pub fn server_from_json_lines(output: &str) -> Option<(u16, Option<String>)> {
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let record: Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                debug!("Skipping non-JSON listing line: {}", e);
                continue;
            }
        };
        let port = match record.get("port") {
            Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        if let Some(port) = port.filter(|p| *p != 0) {
            let token = record
                .get("token")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            return Some((port, token));
        }
    }
    None
}

/// First port of an `http(s)://host:port/` URL; port 0 is not an answer
pub fn port_from_url_text(output: &str) -> Option<u16> {
    url_port_re()
        .captures_iter(output)
        .filter_map(|caps| nonzero_port(&caps[1]))
        .next()
}

/// Access token from `token=` in server URLs; a full-length token wins over a short one
pub fn token_from_text(output: &str) -> Option<String> {
    let tokens: Vec<&str> = token_re()
        .captures_iter(output)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    tokens
        .iter()
        .find(|t| t.len() >= FULL_TOKEN_LEN)
        .or_else(|| tokens.first())
        .map(|t| t.to_string())
}

/// Whether the text names a URL whose port is 0 (server bound to a random port)
pub fn reports_port_zero(output: &str) -> bool {
    url_port_re()
        .captures_iter(output)
        .any(|caps| &caps[1] == "0")
}

/// Listening port from `ss`/`netstat` lines
pub fn port_from_socket_table(output: &str) -> Option<u16> {
    output.lines().find_map(|line| {
        // trailing space so the last column still matches
        let line = format!("{} ", line);
        socket_port_re()
            .captures_iter(&line)
            .filter_map(|caps| nonzero_port(&caps[1]))
            .next()
    })
}

/// Port from `lsof -i -P -n` lines
pub fn port_from_lsof(output: &str) -> Option<u16> {
    output.lines().find_map(|line| {
        any_port_re()
            .captures_iter(line)
            .filter_map(|caps| nonzero_port(&caps[1]))
            .next()
    })
}
