//! Streaming HTTP engine: a byte-oriented incremental parser feeding
//! the rule engine, and the canonical serializer that puts rewritten
//! messages back on the wire.

use super::{
    kv::{glob_match, KvTree},
    rules::BoundRule,
};
use crate::config::{
    Direction, DstMode, Id, KeyType, KvAction, KvPattern, RuleAction, EMPTY_ID,
};
use bytes::{Bytes, BytesMut};
use derive_more::Display;
use std::{collections::HashMap, net::SocketAddr};

#[derive(Debug, Display)]
pub enum HttpError {
    #[display(fmt = "malformed request line")]
    BadRequestLine,
    #[display(fmt = "malformed status line")]
    BadStatusLine,
    #[display(fmt = "malformed header line")]
    BadHeader,
    #[display(fmt = "malformed chunk encoding")]
    BadChunk,
    #[display(fmt = "malformed content length")]
    BadContentLength,
    #[display(fmt = "header block too large")]
    HeaderTooLong,
}

impl std::error::Error for HttpError {}

/// Message framing derived from the header block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyKind {
    None,
    Length(u64),
    Chunked,
    /// Read until the peer closes; only valid for responses.
    Unlimited,
}

/// Parsed header block of one message direction.
#[derive(Debug)]
pub struct HttpDesc {
    pub dir: Direction,
    pub method: Option<String>,
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub headers: KvTree,
    pub cookies: KvTree,
    pub query_kv: KvTree,
    cookies_dirty: bool,
    query_dirty: bool,
}

impl HttpDesc {
    fn new(dir: Direction) -> Self {
        Self {
            dir,
            method: None,
            path: String::new(),
            query: None,
            version: String::new(),
            status: None,
            reason: None,
            headers: KvTree::new(true),
            cookies: KvTree::new(true),
            query_kv: KvTree::new(true),
            cookies_dirty: false,
            query_dirty: false,
        }
    }

    fn parse_request_line(line: &str, desc: &mut Self) -> Result<(), HttpError> {
        let mut parts = line.split_ascii_whitespace();
        let method = parts.next().ok_or(HttpError::BadRequestLine)?;
        let target = parts.next().ok_or(HttpError::BadRequestLine)?;
        let version = parts.next().ok_or(HttpError::BadRequestLine)?;
        if parts.next().is_some() || !version.starts_with("HTTP/") {
            return Err(HttpError::BadRequestLine);
        }
        desc.method = Some(method.to_ascii_uppercase());
        match target.split_once('?') {
            Some((path, query)) => {
                desc.path = path.to_string();
                desc.query = Some(query.to_string());
            }
            None => desc.path = target.to_string(),
        }
        desc.version = version.to_string();
        Ok(())
    }

    fn parse_status_line(line: &str, desc: &mut Self) -> Result<(), HttpError> {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().ok_or(HttpError::BadStatusLine)?;
        let code = parts.next().ok_or(HttpError::BadStatusLine)?;
        if !version.starts_with("HTTP/") {
            return Err(HttpError::BadStatusLine);
        }
        desc.version = version.to_string();
        desc.status = Some(code.parse().map_err(|_| HttpError::BadStatusLine)?);
        desc.reason = parts.next().map(str::to_string);
        Ok(())
    }

    fn add_header(&mut self, line: &str) -> Result<(), HttpError> {
        // Obsolete line folding is rejected like any other malformed
        // header line.
        let (key, value) = line.split_once(':').ok_or(HttpError::BadHeader)?;
        if key.is_empty() || key.contains(' ') {
            return Err(HttpError::BadHeader);
        }
        self.headers.add(key, Some(value.trim()));
        Ok(())
    }

    /// Build the derived kv trees once all headers are in.
    fn finish(&mut self) {
        if self.dir == Direction::Request {
            if let Some(cookies) = self.headers.find("cookie").and_then(|kv| kv.value.clone()) {
                for part in cookies.split(';') {
                    match part.trim().split_once('=') {
                        Some((k, v)) => self.cookies.add(k, Some(v)),
                        None if !part.trim().is_empty() => self.cookies.add(part.trim(), None),
                        None => continue,
                    };
                }
            }
            if let Some(query) = &self.query {
                for part in query.split('&') {
                    match part.split_once('=') {
                        Some((k, v)) => self.query_kv.add(k, Some(v)),
                        None if !part.is_empty() => self.query_kv.add(part, None),
                        None => continue,
                    };
                }
            }
        } else {
            // Set-Cookie entries become roots with attribute children.
            let set: Vec<String> = self
                .headers
                .iter()
                .filter(|kv| kv.key.eq_ignore_ascii_case("set-cookie"))
                .filter_map(|kv| kv.value.clone())
                .collect();
            for header in set {
                let mut parts = header.split(';');
                let root = match parts.next().map(str::trim).and_then(|p| p.split_once('=')) {
                    Some((k, v)) => self.cookies.add(k, Some(v)),
                    None => continue,
                };
                for attr in parts {
                    match attr.trim().split_once('=') {
                        Some((k, v)) => self.cookies.add_child(root, k, Some(v)),
                        None if !attr.trim().is_empty() => {
                            self.cookies.add_child(root, attr.trim(), None)
                        }
                        None => continue,
                    };
                }
            }
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.find("host").and_then(|kv| kv.value.as_deref())
    }

    /// The lookup form of the URL: host, path and query, no scheme.
    pub fn url(&self) -> String {
        let mut url = self.host().unwrap_or("").to_string();
        url.push_str(&self.path);
        if let Some(query) = &self.query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    fn body_kind(&self) -> Result<BodyKind, HttpError> {
        if let Some(status) = self.status {
            if status < 200 || status == 204 || status == 304 {
                return Ok(BodyKind::None);
            }
        }
        if let Some(te) = self
            .headers
            .find("transfer-encoding")
            .and_then(|kv| kv.value.as_deref())
        {
            if te.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyKind::Chunked);
            }
        }
        if let Some(cl) = self
            .headers
            .find("content-length")
            .and_then(|kv| kv.value.as_deref())
        {
            let len: u64 = cl.trim().parse().map_err(|_| HttpError::BadContentLength)?;
            return Ok(if len == 0 {
                BodyKind::None
            } else {
                BodyKind::Length(len)
            });
        }
        Ok(match self.dir {
            Direction::Request => BodyKind::None,
            Direction::Response => BodyKind::Unlimited,
        })
    }

    fn keep_alive(&self, body: BodyKind) -> bool {
        if body == BodyKind::Unlimited {
            return false;
        }
        let connection = self
            .headers
            .find("connection")
            .and_then(|kv| kv.value.as_deref())
            .map(|v| v.to_ascii_lowercase());
        if self.version == "HTTP/1.0" {
            connection.as_deref() == Some("keep-alive")
        } else {
            connection.as_deref() != Some("close")
        }
    }

    /// Serialize the (possibly rewritten) header block.
    pub fn serialize(&mut self) -> Vec<u8> {
        if self.query_dirty {
            let query: Vec<String> = self
                .query_kv
                .iter()
                .map(|kv| match &kv.value {
                    Some(value) => format!("{}={}", kv.key, value),
                    None => kv.key.clone(),
                })
                .collect();
            self.query = if query.is_empty() {
                None
            } else {
                Some(query.join("&"))
            };
            self.query_dirty = false;
        }
        if self.cookies_dirty && self.dir == Direction::Request {
            let cookies: Vec<String> = self
                .cookies
                .iter()
                .map(|kv| match &kv.value {
                    Some(value) => format!("{}={}", kv.key, value),
                    None => kv.key.clone(),
                })
                .collect();
            if cookies.is_empty() {
                self.headers.remove("cookie");
            } else {
                self.headers.set("Cookie", &cookies.join("; "));
            }
            self.cookies_dirty = false;
        }

        let mut out = Vec::with_capacity(256);
        match self.dir {
            Direction::Request => {
                let method = self.method.as_deref().unwrap_or("GET");
                out.extend_from_slice(method.as_bytes());
                out.push(b' ');
                out.extend_from_slice(self.path.as_bytes());
                if let Some(query) = &self.query {
                    out.push(b'?');
                    out.extend_from_slice(query.as_bytes());
                }
                out.push(b' ');
                out.extend_from_slice(self.version.as_bytes());
            }
            Direction::Response => {
                out.extend_from_slice(self.version.as_bytes());
                out.push(b' ');
                out.extend_from_slice(
                    self.status.unwrap_or(200).to_string().as_bytes(),
                );
                if let Some(reason) = &self.reason {
                    out.push(b' ');
                    out.extend_from_slice(reason.as_bytes());
                }
            }
        }
        out.extend_from_slice(b"\r\n");
        for kv in self.headers.iter() {
            out.extend_from_slice(kv.key.as_bytes());
            out.extend_from_slice(b": ");
            if let Some(value) = &kv.value {
                out.extend_from_slice(value.as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Parser states per direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HttpState {
    ReadRequestLine,
    ReadStatusLine,
    ReadHeaders,
    ReadBody(u64),
    ReadUnlimited,
    ReadChunkLength,
    ReadChunkData(u64),
    ReadTrailers,
    Done,
}

#[derive(Debug)]
pub enum HttpEvent {
    /// Header block complete; the descriptor is ready for the rules.
    Headers { desc: HttpDesc, body: BodyKind },
    /// Raw body bytes (including chunk framing) to forward verbatim.
    Body(Bytes),
    /// Message complete; `keep_alive` reports whether another message
    /// may follow on this stream.
    Done { keep_alive: bool },
}

#[derive(Debug)]
pub struct HttpParser {
    dir: Direction,
    state: HttpState,
    buf: BytesMut,
    desc: Option<HttpDesc>,
    header_len: usize,
    keep_alive: bool,
    eof: bool,
}

impl HttpParser {
    pub fn new(dir: Direction) -> Self {
        let state = match dir {
            Direction::Request => HttpState::ReadRequestLine,
            Direction::Response => HttpState::ReadStatusLine,
        };
        Self {
            dir,
            state,
            buf: BytesMut::new(),
            desc: None,
            header_len: 0,
            keep_alive: true,
            eof: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn eof(&mut self) {
        self.eof = true;
    }

    /// Rearm for the next message on the same stream.
    pub fn next_message(&mut self) {
        self.state = match self.dir {
            Direction::Request => HttpState::ReadRequestLine,
            Direction::Response => HttpState::ReadStatusLine,
        };
        self.desc = None;
        self.header_len = 0;
    }

    /// Take one complete line off the buffer: raw bytes including the
    /// terminator plus the trimmed text.
    fn take_line(&mut self) -> Result<Option<(Bytes, String)>, HttpError> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                let raw = self.buf.split_to(idx + 1).freeze();
                let text = std::str::from_utf8(&raw[..idx])
                    .map_err(|_| HttpError::BadHeader)?
                    .trim_end_matches('\r')
                    .to_string();
                Ok(Some((raw, text)))
            }
            None => {
                if self.state == HttpState::ReadHeaders
                    && self.buf.len() > crate::RELAY_MAX_HEADER_LENGTH
                {
                    return Err(HttpError::HeaderTooLong);
                }
                Ok(None)
            }
        }
    }

    pub fn poll(&mut self) -> Result<Option<HttpEvent>, HttpError> {
        loop {
            match self.state {
                HttpState::ReadRequestLine | HttpState::ReadStatusLine => {
                    let (_, line) = match self.take_line()? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    if line.is_empty() {
                        // Tolerate stray empty lines between messages.
                        continue;
                    }
                    let mut desc = HttpDesc::new(self.dir);
                    if self.state == HttpState::ReadRequestLine {
                        HttpDesc::parse_request_line(&line, &mut desc)?;
                    } else {
                        HttpDesc::parse_status_line(&line, &mut desc)?;
                    }
                    self.header_len = line.len();
                    self.desc = Some(desc);
                    self.state = HttpState::ReadHeaders;
                }
                HttpState::ReadHeaders => {
                    let (raw, line) = match self.take_line()? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    self.header_len += raw.len();
                    if self.header_len > crate::RELAY_MAX_HEADER_LENGTH {
                        return Err(HttpError::HeaderTooLong);
                    }
                    let mut desc = match self.desc.take() {
                        Some(desc) => desc,
                        None => return Err(HttpError::BadHeader),
                    };
                    if !line.is_empty() {
                        desc.add_header(&line)?;
                        self.desc = Some(desc);
                        continue;
                    }
                    desc.finish();
                    let body = desc.body_kind()?;
                    self.keep_alive = desc.keep_alive(body);
                    self.state = match body {
                        BodyKind::None => HttpState::Done,
                        BodyKind::Length(n) => HttpState::ReadBody(n),
                        BodyKind::Chunked => HttpState::ReadChunkLength,
                        BodyKind::Unlimited => HttpState::ReadUnlimited,
                    };
                    return Ok(Some(HttpEvent::Headers { desc, body }));
                }
                HttpState::ReadBody(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        HttpState::Done
                    } else {
                        HttpState::ReadBody(remaining)
                    };
                    return Ok(Some(HttpEvent::Body(chunk)));
                }
                HttpState::ReadUnlimited => {
                    if !self.buf.is_empty() {
                        let chunk = self.buf.split_to(self.buf.len()).freeze();
                        return Ok(Some(HttpEvent::Body(chunk)));
                    }
                    if self.eof {
                        self.state = HttpState::Done;
                        continue;
                    }
                    return Ok(None);
                }
                HttpState::ReadChunkLength => {
                    let (raw, line) = match self.take_line()? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    let size = line
                        .split(';')
                        .next()
                        .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
                        .ok_or(HttpError::BadChunk)?;
                    self.state = if size == 0 {
                        HttpState::ReadTrailers
                    } else {
                        // Chunk data plus its trailing CRLF.
                        HttpState::ReadChunkData(size + 2)
                    };
                    return Ok(Some(HttpEvent::Body(raw)));
                }
                HttpState::ReadChunkData(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        HttpState::ReadChunkLength
                    } else {
                        HttpState::ReadChunkData(remaining)
                    };
                    return Ok(Some(HttpEvent::Body(chunk)));
                }
                HttpState::ReadTrailers => {
                    let (raw, line) = match self.take_line()? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    let done = line.is_empty();
                    if done {
                        self.state = HttpState::Done;
                    }
                    return Ok(Some(HttpEvent::Body(raw)));
                }
                HttpState::Done => {
                    return Ok(Some(HttpEvent::Done {
                        keep_alive: self.keep_alive,
                    }));
                }
            }
        }
    }
}

//
// Rule evaluation.
//

/// Mutable session state the rules read and write.
#[derive(Debug)]
pub struct SessionCtx {
    pub remote: SocketAddr,
    pub server: SocketAddr,
    pub server_name: String,
    pub label: u16,
    pub tag: u16,
    pub hash_data: Vec<u8>,
    pub log: Vec<String>,
}

impl SessionCtx {
    pub fn new(remote: SocketAddr, server: SocketAddr, server_name: &str) -> Self {
        Self {
            remote,
            server,
            server_name: server_name.to_string(),
            label: 0,
            tag: 0,
            hash_data: Vec::new(),
            log: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Pass,
    Block,
}

#[derive(Debug)]
pub struct EvalResult {
    pub verdict: Verdict,
    /// Table binding from the last matching rule, if any.
    pub table: Option<(Id, DstMode)>,
}

fn value_match(pattern: &str, value: &str) -> bool {
    if pattern.contains(|ch| matches!(ch, '*' | '?' | '[')) {
        glob_match(pattern, value, true)
    } else {
        pattern == value
    }
}

/// Look up one kv pattern; `Some(matched)` carries the value the
/// pattern matched on, for macro expansion.
fn lookup(desc: &HttpDesc, kv: &KvPattern) -> Option<String> {
    let tree = match kv.typ {
        KeyType::Header => &desc.headers,
        KeyType::Cookie => &desc.cookies,
        KeyType::Query => &desc.query_kv,
        KeyType::Path => {
            if !glob_or_eq(&kv.key, &desc.path) {
                return None;
            }
            let query = desc.query.as_deref().unwrap_or("");
            if let Some(pattern) = &kv.value {
                if !value_match(pattern, query) {
                    return None;
                }
            }
            return Some(desc.path.clone());
        }
        KeyType::Url => {
            let url = desc.url();
            if !glob_or_eq(&kv.key, &url) {
                return None;
            }
            if let Some(pattern) = &kv.value {
                if !value_match(pattern, &url) {
                    return None;
                }
            }
            return Some(url);
        }
    };
    let found = if kv.globbing() {
        tree.glob(&kv.key)
    } else {
        tree.find(&kv.key)
    }?;
    let value = found.value.clone().unwrap_or_default();
    if let Some(pattern) = &kv.value {
        if !value_match(pattern, &value) {
            return None;
        }
    }
    Some(value)
}

fn glob_or_eq(pattern: &str, text: &str) -> bool {
    if pattern.contains(|ch| matches!(ch, '*' | '?' | '[')) {
        glob_match(pattern, text, true)
    } else {
        pattern == text
    }
}

/// Expand runtime macros in an action value.
pub fn expand_macros(
    input: &str,
    desc: &HttpDesc,
    ctx: &SessionCtx,
    matched: &HashMap<KeyType, String>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let (expansion, used) = if rest.starts_with("$HEADER") {
            (
                matched.get(&KeyType::Header).cloned().unwrap_or_default(),
                "$HEADER".len(),
            )
        } else if rest.starts_with("$HOST") {
            (desc.host().unwrap_or("").to_string(), "$HOST".len())
        } else if rest.starts_with("$PATH") {
            (desc.path.clone(), "$PATH".len())
        } else if rest.starts_with("$QUERY") {
            (desc.query.clone().unwrap_or_default(), "$QUERY".len())
        } else if rest.starts_with("$REMOTE_ADDR") {
            (ctx.remote.ip().to_string(), "$REMOTE_ADDR".len())
        } else if rest.starts_with("$REMOTE_PORT") {
            (ctx.remote.port().to_string(), "$REMOTE_PORT".len())
        } else if rest.starts_with("$SERVER_ADDR") {
            (ctx.server.ip().to_string(), "$SERVER_ADDR".len())
        } else if rest.starts_with("$SERVER_PORT") {
            (ctx.server.port().to_string(), "$SERVER_PORT".len())
        } else if rest.starts_with("$SERVER_NAME") {
            (ctx.server_name.clone(), "$SERVER_NAME".len())
        } else {
            out.push('$');
            rest = &rest[1..];
            continue;
        };
        out.push_str(&expansion);
        rest = &rest[used..];
    }
    out.push_str(rest);
    out
}

fn apply_action(
    desc: &mut HttpDesc,
    ctx: &mut SessionCtx,
    action: &crate::config::KvActionPattern,
    matched: &HashMap<KeyType, String>,
) {
    let value = action
        .value
        .as_deref()
        .map(|v| expand_macros(v, desc, ctx, matched))
        .unwrap_or_default();
    match (action.action, action.typ) {
        (KvAction::Set, KeyType::Path) => {
            desc.path = value;
        }
        (KvAction::Set, KeyType::Url) => {
            // host/path, like the lookup form.
            match value.split_once('/') {
                Some((host, path)) => {
                    if !host.is_empty() {
                        desc.headers.set("Host", host);
                    }
                    desc.path = format!("/{}", path);
                }
                None => desc.headers.set("Host", &value),
            }
        }
        (KvAction::Set, typ) => {
            tree_mut(desc, typ).set(&action.key, &value);
            mark_dirty(desc, typ);
        }
        (KvAction::Append, typ) => {
            tree_mut(desc, typ).append(&action.key, &value);
            mark_dirty(desc, typ);
        }
        (KvAction::Remove, KeyType::Path) | (KvAction::Remove, KeyType::Url) => {}
        (KvAction::Remove, typ) => {
            tree_mut(desc, typ).remove(&action.key);
            mark_dirty(desc, typ);
        }
        (KvAction::Hash, typ) => {
            let value = match typ {
                KeyType::Path => Some(desc.path.clone()),
                KeyType::Url => Some(desc.url()),
                _ => tree_of(desc, typ)
                    .find(&action.key)
                    .and_then(|kv| kv.value.clone()),
            };
            if let Some(value) = value {
                ctx.hash_data.extend_from_slice(action.key.as_bytes());
                ctx.hash_data.extend_from_slice(value.as_bytes());
            }
        }
        (KvAction::Log, typ) => {
            let value = match typ {
                KeyType::Path => Some(desc.path.clone()),
                KeyType::Url => Some(desc.url()),
                _ => tree_of(desc, typ)
                    .find(&action.key)
                    .and_then(|kv| kv.value.clone()),
            };
            if let Some(value) = value {
                ctx.log.push(format!("{} [{}: {}]", action.typ, action.key, value));
            }
        }
    }
}

fn tree_of(desc: &HttpDesc, typ: KeyType) -> &KvTree {
    match typ {
        KeyType::Cookie => &desc.cookies,
        KeyType::Query => &desc.query_kv,
        _ => &desc.headers,
    }
}

fn tree_mut(desc: &mut HttpDesc, typ: KeyType) -> &mut KvTree {
    match typ {
        KeyType::Cookie => &mut desc.cookies,
        KeyType::Query => &mut desc.query_kv,
        _ => &mut desc.headers,
    }
}

fn mark_dirty(desc: &mut HttpDesc, typ: KeyType) {
    match typ {
        KeyType::Cookie => desc.cookies_dirty = true,
        KeyType::Query => desc.query_dirty = true,
        _ => {}
    }
}

/// Evaluate the rule list in order against one message direction.
/// First terminal match wins; `match` rules apply their side effects
/// and keep going.
pub fn eval_rules(
    rules: &[BoundRule],
    desc: &mut HttpDesc,
    ctx: &mut SessionCtx,
) -> EvalResult {
    let mut result = EvalResult {
        verdict: Verdict::Pass,
        table: None,
    };

    for bound in rules {
        let rule = &bound.rule;
        if rule.dir != desc.dir {
            continue;
        }
        if bound.tagged != 0 && ctx.tag != bound.tagged {
            continue;
        }
        if let Some(method) = &rule.method {
            match &desc.method {
                Some(m) if m.eq_ignore_ascii_case(method) => {}
                _ => continue,
            }
        }

        let mut matched = HashMap::new();
        let mut miss = false;
        for kv in &rule.kv {
            match lookup(desc, kv) {
                Some(value) => {
                    matched.insert(kv.typ, value);
                }
                None => {
                    miss = true;
                    break;
                }
            }
        }
        if miss {
            continue;
        }

        // The rule matches: bind labels and tags, run the actions.
        if bound.label != 0 {
            ctx.label = bound.label;
        }
        if bound.tag != 0 {
            ctx.tag = bound.tag;
        }
        for action in &rule.actions {
            apply_action(desc, ctx, action, &matched);
        }
        if rule.table_id != EMPTY_ID {
            result.table = Some((rule.table_id, rule.table_mode));
        }

        match rule.action {
            RuleAction::Match => continue,
            RuleAction::Pass => {
                result.verdict = Verdict::Pass;
                break;
            }
            RuleAction::Block => {
                result.verdict = Verdict::Block;
                break;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{KvActionPattern, Rule},
        relay::rules::{BoundRule, Registry},
    };

    fn ctx() -> SessionCtx {
        SessionCtx::new(
            "192.0.2.1:4711".parse().unwrap(),
            "10.0.0.1:80".parse().unwrap(),
            "test-relay",
        )
    }

    fn parse_request(raw: &str) -> HttpDesc {
        let mut parser = HttpParser::new(Direction::Request);
        parser.push(raw.as_bytes());
        match parser.poll().unwrap().unwrap() {
            HttpEvent::Headers { desc, .. } => desc,
            event => panic!("unexpected event: {:?}", event),
        }
    }

    #[test]
    fn test_parse_request_with_query_and_cookies() {
        let desc = parse_request(
            "GET /search?q=relayd&page=2 HTTP/1.1\r\n\
             Host: www.example.com\r\n\
             Cookie: session=abc; theme=dark\r\n\
             \r\n",
        );
        assert_eq!(desc.method.as_deref(), Some("GET"));
        assert_eq!(desc.path, "/search");
        assert_eq!(desc.query.as_deref(), Some("q=relayd&page=2"));
        assert_eq!(
            desc.query_kv.find("q").unwrap().value.as_deref(),
            Some("relayd")
        );
        assert_eq!(
            desc.cookies.find("theme").unwrap().value.as_deref(),
            Some("dark")
        );
        assert_eq!(desc.url(), "www.example.com/search?q=relayd&page=2");
    }

    #[test]
    fn test_parse_streaming_at_byte_boundaries() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello";
        for split in 1..raw.len() - 1 {
            let mut parser = HttpParser::new(Direction::Request);
            parser.push(&raw[..split]);
            let mut events = Vec::new();
            loop {
                match parser.poll().unwrap() {
                    Some(event) => events.push(format!("{:?}", event)),
                    None => break,
                }
            }
            parser.push(&raw[split..]);
            loop {
                match parser.poll().unwrap() {
                    Some(HttpEvent::Done { .. }) => {
                        events.push("done".to_string());
                        break;
                    }
                    Some(event) => events.push(format!("{:?}", event)),
                    None => break,
                }
            }
            assert!(
                events.iter().any(|e| e.starts_with("Headers")),
                "split {}",
                split
            );
            assert_eq!(events.last().map(String::as_str), Some("done"), "split {}", split);
        }
    }

    #[test]
    fn test_parse_chunked_body() {
        let mut parser = HttpParser::new(Direction::Response);
        parser.push(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\n\r\n",
        );
        let mut body = Vec::new();
        let mut done = false;
        loop {
            match parser.poll().unwrap() {
                Some(HttpEvent::Headers { body: kind, .. }) => {
                    assert_eq!(kind, BodyKind::Chunked)
                }
                Some(HttpEvent::Body(bytes)) => body.extend_from_slice(&bytes),
                Some(HttpEvent::Done { keep_alive }) => {
                    assert!(keep_alive);
                    done = true;
                    break;
                }
                None => break,
            }
        }
        assert!(done);
        assert_eq!(body, b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn test_header_block_cap() {
        let mut parser = HttpParser::new(Direction::Request);
        parser.push(b"GET / HTTP/1.1\r\n");
        let long = format!("X-Fill: {}\r\n", "x".repeat(crate::RELAY_MAX_HEADER_LENGTH));
        parser.push(long.as_bytes());
        assert!(matches!(
            parser.poll(),
            Err(HttpError::HeaderTooLong)
        ));
    }

    #[test]
    fn test_serialize_preserves_header_order() {
        let mut desc = parse_request(
            "GET / HTTP/1.1\r\nHost: a\r\nAccept: */*\r\nX-Last: 1\r\n\r\n",
        );
        let out = String::from_utf8(desc.serialize()).unwrap();
        let host = out.find("Host:").unwrap();
        let accept = out.find("Accept:").unwrap();
        let last = out.find("X-Last:").unwrap();
        assert!(host < accept && accept < last);
    }

    fn bind(rules: Vec<Rule>) -> (Vec<BoundRule>, Registry) {
        let mut registry = Registry::default();
        let bound = rules
            .into_iter()
            .map(|rule| BoundRule::inherit(rule, &mut registry))
            .collect();
        (bound, registry)
    }

    /// The literal header rewrite scenario: a glob match on Host adds
    /// a header carrying the matched value.
    #[test]
    fn test_match_set_header_with_macro() {
        let (rules, _registry) = bind(vec![Rule {
            action: RuleAction::Match,
            dir: Direction::Request,
            kv: vec![KvPattern {
                typ: KeyType::Header,
                key: "Host".to_string(),
                value: Some("*.example.com".to_string()),
            }],
            actions: vec![KvActionPattern {
                action: KvAction::Set,
                typ: KeyType::Header,
                key: "X-Original-Host".to_string(),
                value: Some("$HEADER".to_string()),
            }],
            ..Default::default()
        }]);
        let mut desc =
            parse_request("GET / HTTP/1.1\r\nHost: api.example.com\r\n\r\n");
        let mut ctx = ctx();
        let result = eval_rules(&rules, &mut desc, &mut ctx);
        assert_eq!(result.verdict, Verdict::Pass);
        assert_eq!(
            desc.headers.find("x-original-host").unwrap().value.as_deref(),
            Some("api.example.com")
        );
        let out = String::from_utf8(desc.serialize()).unwrap();
        assert!(out.contains("X-Original-Host: api.example.com\r\n"));
    }

    /// Rules are order-sensitive and first-terminating.
    #[test]
    fn test_first_terminal_rule_wins() {
        let (rules, _registry) = bind(vec![
            Rule {
                action: RuleAction::Pass,
                dir: Direction::Request,
                actions: vec![KvActionPattern {
                    action: KvAction::Set,
                    typ: KeyType::Header,
                    key: "X-First".to_string(),
                    value: Some("1".to_string()),
                }],
                ..Default::default()
            },
            Rule {
                action: RuleAction::Block,
                dir: Direction::Request,
                actions: vec![KvActionPattern {
                    action: KvAction::Set,
                    typ: KeyType::Header,
                    key: "X-Second".to_string(),
                    value: Some("2".to_string()),
                }],
                ..Default::default()
            },
        ]);
        let mut desc = parse_request("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut ctx = ctx();
        let result = eval_rules(&rules, &mut desc, &mut ctx);
        assert_eq!(result.verdict, Verdict::Pass);
        assert!(desc.headers.find("X-First").is_some());
        assert!(desc.headers.find("X-Second").is_none());
    }

    #[test]
    fn test_block_on_glob_path() {
        let (rules, _registry) = bind(vec![Rule {
            action: RuleAction::Block,
            dir: Direction::Request,
            kv: vec![KvPattern {
                typ: KeyType::Path,
                key: "/admin*".to_string(),
                value: None,
            }],
            ..Default::default()
        }]);
        let mut blocked = parse_request("GET /admin/users HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut passed = parse_request("GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut ctx1 = ctx();
        let mut ctx2 = ctx();
        assert_eq!(
            eval_rules(&rules, &mut blocked, &mut ctx1).verdict,
            Verdict::Block
        );
        assert_eq!(
            eval_rules(&rules, &mut passed, &mut ctx2).verdict,
            Verdict::Pass
        );
    }

    #[test]
    fn test_tagged_rule_requires_tag() {
        let (rules, _registry) = bind(vec![
            Rule {
                action: RuleAction::Match,
                dir: Direction::Request,
                kv: vec![KvPattern {
                    typ: KeyType::Header,
                    key: "X-Debug".to_string(),
                    value: None,
                }],
                tag: Some("debug".to_string()),
                ..Default::default()
            },
            Rule {
                action: RuleAction::Block,
                dir: Direction::Request,
                tagged: Some("debug".to_string()),
                ..Default::default()
            },
        ]);

        let mut tagged = parse_request("GET / HTTP/1.1\r\nX-Debug: 1\r\n\r\n");
        let mut ctx1 = ctx();
        assert_eq!(
            eval_rules(&rules, &mut tagged, &mut ctx1).verdict,
            Verdict::Block
        );

        let mut plain = parse_request("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut ctx2 = ctx();
        assert_eq!(
            eval_rules(&rules, &mut plain, &mut ctx2).verdict,
            Verdict::Pass
        );
    }

    #[test]
    fn test_hash_and_query_rewrite() {
        let (rules, _registry) = bind(vec![Rule {
            action: RuleAction::Match,
            dir: Direction::Request,
            actions: vec![
                KvActionPattern {
                    action: KvAction::Hash,
                    typ: KeyType::Query,
                    key: "sessid".to_string(),
                    value: None,
                },
                KvActionPattern {
                    action: KvAction::Remove,
                    typ: KeyType::Query,
                    key: "debug".to_string(),
                    value: None,
                },
            ],
            ..Default::default()
        }]);
        let mut desc = parse_request(
            "GET /?sessid=42&debug=1 HTTP/1.1\r\nHost: a\r\n\r\n",
        );
        let mut ctx = ctx();
        eval_rules(&rules, &mut desc, &mut ctx);
        assert!(!ctx.hash_data.is_empty());
        let out = String::from_utf8(desc.serialize()).unwrap();
        assert!(out.starts_with("GET /?sessid=42 HTTP/1.1\r\n"));
    }
}
