//! STOMP-subset frame codec
//!
//! Wire format: a command line, `key:value` header lines up to the first
//! blank line, then the body terminated by a single NUL byte.

use thiserror::Error;

/// Terminator appended to every encoded frame.
pub const FRAME_TERMINATOR: char = '\0';

/// Frame command tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Disconnect,
}

impl Command {
    /// Wire spelling of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn from_line(line: &str) -> Option<Self> {
        match line {
            "CONNECT" => Some(Command::Connect),
            "STOMP" => Some(Command::Stomp),
            "CONNECTED" => Some(Command::Connected),
            "SUBSCRIBE" => Some(Command::Subscribe),
            "UNSUBSCRIBE" => Some(Command::Unsubscribe),
            "SEND" => Some(Command::Send),
            "MESSAGE" => Some(Command::Message),
            "RECEIPT" => Some(Command::Receipt),
            "DISCONNECT" => Some(Command::Disconnect),
            _ => None,
        }
    }
}

/// Frame decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// One protocol unit: command, ordered headers, body.
///
/// Header order carries no meaning but is preserved so encoding is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// All headers in insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Parse a raw text message into a frame.
    ///
    /// Header lines without a colon are skipped rather than rejected. A
    /// missing trailing terminator is tolerated.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let raw = raw.strip_suffix(FRAME_TERMINATOR).unwrap_or(raw);

        // The first blank line separates the head from the body.
        let (head, body) = match raw.split_once("\n\n") {
            Some((head, body)) => (head, body),
            None => (raw, ""),
        };

        let mut lines = head.split('\n');
        let command_line = lines.next().unwrap_or("").trim_end_matches('\r');
        if command_line.is_empty() {
            return Err(DecodeError::Empty);
        }
        let command = Command::from_line(command_line)
            .ok_or_else(|| DecodeError::UnknownCommand(command_line.to_string()))?;

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if let Some((key, value)) = line.split_once(':') {
                headers.push((key.to_string(), value.to_string()));
            }
            // No colon: malformed header line, ignored.
        }

        Ok(Self {
            command,
            headers,
            body: body.to_string(),
        })
    }

    /// Serialize the frame to wire text, terminator included.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (key, value) in &self.headers {
            out.push_str(key);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(FRAME_TERMINATOR);
        out
    }
}
