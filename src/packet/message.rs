use super::CodecError;
use super::xml::{
    XmlReader, XmlWriter, decode_base64, encode_base64, read_text, write_err, xml_err,
};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::fmt;

pub const ELEMENT: &str = "Message";

/// Kind of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageType {
    #[default]
    None,
    Success,
    Error,
    Hello,
    /// Add partial data such as username, OTP seed or public key.
    Add,
    Verify,
    Resync,
}

impl MessageType {
    /// Wire name. `None` has no wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Hello => "HELLO",
            Self::Add => "ADD",
            Self::Verify => "VERIFY",
            Self::Resync => "RESYNC",
        }
    }

    /// Look up a wire name. Only the six types a peer may send are accepted.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            "HELLO" => Some(Self::Hello),
            "ADD" => Some(Self::Add),
            "VERIFY" => Some(Self::Verify),
            "RESYNC" => Some(Self::Resync),
            _ => None,
        }
    }

    /// Client-to-server requests. Their status must stay `NONE`.
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(self, Self::Hello | Self::Add | Self::Verify | Self::Resync)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result code of a `SUCCESS` or `ERROR` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusCode {
    #[default]
    None,
    /// General success.
    Ok,
    /// Resynchronization succeeded.
    ResyncOk,
    /// General error.
    Error,
    /// OTP could not be verified.
    NotVerified,
    /// User or process identifier not found.
    NotFound,
    /// Required data missing: username, OTP, public key or MAC.
    Incomplete,
    /// Unspecified server-side error.
    Unknown,
}

impl StatusCode {
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Ok => 200,
            Self::ResyncOk => 201,
            Self::Error => 400,
            Self::NotVerified => 401,
            Self::NotFound => 404,
            Self::Incomplete => 480,
            Self::Unknown => 500,
        }
    }

    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Self::Ok),
            201 => Some(Self::ResyncOk),
            400 => Some(Self::Error),
            401 => Some(Self::NotVerified),
            404 => Some(Self::NotFound),
            480 => Some(Self::Incomplete),
            500 => Some(Self::Unknown),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::ResyncOk)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Ok => "S_OK",
            Self::ResyncOk => "S_RESYNC_OK",
            Self::Error => "E_ERROR",
            Self::NotVerified => "E_NOT_VERIFIED",
            Self::NotFound => "E_NOT_FOUND",
            Self::Incomplete => "E_INCOMPLETE",
            Self::Unknown => "E_UNKNOWN",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.name())
    }
}

/// Semantic envelope of a packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub message_type: MessageType,
    pub status: StatusCode,
    pub content: String,
    pub mac: Vec<u8>,
    pub timestamp: i64,
}

impl Message {
    #[must_use]
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn response(
        message_type: MessageType,
        status: StatusCode,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_type,
            status,
            content: content.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mac(mut self, mac: impl Into<Vec<u8>>) -> Self {
        self.mac = mac.into();
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    #[must_use]
    pub fn has_mac(&self) -> bool {
        !self.mac.is_empty()
    }

    pub(crate) fn read(
        reader: &mut XmlReader<'_>,
        start: &BytesStart<'_>,
        empty: bool,
    ) -> Result<Self, CodecError> {
        let mut message = Self::default();

        for attr in start.attributes() {
            let attr = attr.map_err(xml_err)?;
            let value = attr.unescape_value().map_err(xml_err)?;
            match attr.key.as_ref() {
                b"type" => {
                    message.message_type = MessageType::from_wire(value.trim())
                        .ok_or_else(|| CodecError::UnknownMessageType(value.to_string()))?;
                }
                b"status" => {
                    message.status = value
                        .trim()
                        .parse::<u16>()
                        .ok()
                        .and_then(StatusCode::from_code)
                        .ok_or_else(|| CodecError::UnknownStatus(value.to_string()))?;
                }
                b"timestamp" => {
                    message.timestamp =
                        value
                            .trim()
                            .parse::<i64>()
                            .map_err(|_| CodecError::InvalidInteger {
                                field: "timestamp",
                                value: value.to_string(),
                            })?;
                }
                b"mac" => message.mac = decode_base64("mac", &value)?,
                _ => {}
            }
        }

        message.content = read_text(reader, start, empty)?;

        if message.message_type == MessageType::None {
            return Err(CodecError::MissingType);
        }
        if message.message_type.is_request() && message.status != StatusCode::None {
            return Err(CodecError::StatusOnRequest(message.message_type));
        }

        Ok(message)
    }

    pub(crate) fn write(&self, writer: &mut XmlWriter) -> Result<(), CodecError> {
        if self.message_type == MessageType::None {
            return Err(CodecError::MissingType);
        }

        let status = self.status.code().to_string();
        let timestamp = self.timestamp.to_string();
        let mac = encode_base64(&self.mac);

        let mut start = BytesStart::new(ELEMENT);
        start.push_attribute(("type", self.message_type.as_str()));
        if self.status != StatusCode::None {
            start.push_attribute(("status", status.as_str()));
        }
        if self.timestamp != 0 {
            start.push_attribute(("timestamp", timestamp.as_str()));
        }
        if !self.mac.is_empty() {
            start.push_attribute(("mac", mac.as_str()));
        }

        writer.write_event(Event::Start(start)).map_err(write_err)?;
        if !self.content.is_empty() {
            writer
                .write_event(Event::Text(BytesText::new(&self.content)))
                .map_err(write_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(ELEMENT)))
            .map_err(write_err)?;
        Ok(())
    }
}
