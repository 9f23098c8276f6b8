use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest frame accepted by [`read_message`], delimiter excluded.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Connect,
    StartConversation,
    SendMessage,
    EndConversation,
    Disconnect,
}

/// A single client request. `addresseeNick` and `message` may be omitted on
/// the wire and default to empty strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub sender_nick: String,
    #[serde(default)]
    pub addressee_nick: String,
    #[serde(default)]
    pub message: String,
}

impl Command {
    pub fn new(
        kind: CommandKind,
        sender_nick: impl Into<String>,
        addressee_nick: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender_nick: sender_nick.into(),
            addressee_nick: addressee_nick.into(),
            message: message.into(),
        }
    }

    pub fn connect(nickname: impl Into<String>) -> Self {
        Self::new(CommandKind::Connect, nickname, "", "")
    }

    pub fn disconnect(nickname: impl Into<String>) -> Self {
        Self::new(CommandKind::Disconnect, nickname, "", "")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    RejectConnection,
    Users,
    Message,
    EndConversation,
    Error,
    Info,
    ServerClose,
}

/// Structured payload carried next to the human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ResponseData {
    /// Online nicknames, sent with `USERS`.
    Nicknames(Vec<String>),
    /// Original sender, sent with `MESSAGE` and `END_CONVERSATION`.
    Nickname(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub target_nick: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl Response {
    fn new(
        kind: ResponseKind,
        target_nick: impl Into<String>,
        message: impl Into<String>,
        data: Option<ResponseData>,
    ) -> Self {
        Self {
            kind,
            target_nick: target_nick.into(),
            message: message.into(),
            data,
        }
    }

    pub fn users(target_nick: &str, nicknames: Vec<String>, message: impl Into<String>) -> Self {
        Self::new(
            ResponseKind::Users,
            target_nick,
            message,
            Some(ResponseData::Nicknames(nicknames)),
        )
    }

    pub fn message(target_nick: &str, text: impl Into<String>, sender: &str) -> Self {
        Self::new(
            ResponseKind::Message,
            target_nick,
            text,
            Some(ResponseData::Nickname(sender.to_string())),
        )
    }

    pub fn end_conversation(target_nick: &str, text: impl Into<String>, sender: &str) -> Self {
        Self::new(
            ResponseKind::EndConversation,
            target_nick,
            text,
            Some(ResponseData::Nickname(sender.to_string())),
        )
    }

    pub fn reject_connection(target_nick: &str, message: impl Into<String>) -> Self {
        Self::new(ResponseKind::RejectConnection, target_nick, message, None)
    }

    pub fn error(target_nick: &str, message: impl Into<String>) -> Self {
        Self::new(ResponseKind::Error, target_nick, message, None)
    }

    pub fn info(target_nick: &str, message: impl Into<String>) -> Self {
        Self::new(ResponseKind::Info, target_nick, message, None)
    }

    pub fn server_close(target_nick: &str, message: impl Into<String>) -> Self {
        Self::new(ResponseKind::ServerClose, target_nick, message, None)
    }

    pub fn nicknames(&self) -> Option<&[String]> {
        match &self.data {
            Some(ResponseData::Nicknames(nicknames)) => Some(nicknames),
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match &self.data {
            Some(ResponseData::Nickname(nickname)) => Some(nickname),
            _ => None,
        }
    }
}

/// Why a frame could not be turned into a message.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("invalid message: {0}")]
    Invalid(#[source] serde_json::Error),

    #[error("frame exceeds {0} bytes")]
    TooLong(usize),
}

impl FrameError {
    /// Only an object of the wrong shape can be answered and skipped; anything
    /// else leaves the stream in a state we cannot reason about.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::Invalid(_))
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // Line-oriented framing keeps interoperability with netcat-style tools.
    let mut line = String::new();
    loop {
        line.clear();
        let limit = MAX_FRAME_BYTES as u64 + 1;
        let bytes = (&mut *reader).take(limit).read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes as u64 == limit && !line.ends_with('\n') {
            return Err(FrameError::TooLong(MAX_FRAME_BYTES));
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }

        return decode_frame(trimmed).map(Some);
    }
}

fn decode_frame<T: DeserializeOwned>(frame: &str) -> Result<T, FrameError> {
    let value: Value = serde_json::from_str(frame).map_err(FrameError::Malformed)?;
    if !value.is_object() {
        return Err(FrameError::NotAnObject(json_kind(&value)));
    }
    serde_json::from_value(value).map_err(FrameError::Invalid)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    // Encode once, append the delimiter, and flush so peers get timely updates.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
