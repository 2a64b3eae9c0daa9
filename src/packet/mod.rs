//! Wire model of the OTP protocol and its XML encoding.
//!
//! Every entity knows how to read itself from a [`quick_xml::Reader`] positioned
//! on its start tag and how to write itself to a [`quick_xml::Writer`]. Parsing is
//! driven by attribute and element names, never by position, and rejects values
//! outside the closed tables of the protocol instead of defaulting them.
//!
//! ```xml
//! <OTPPacket version="1">
//!   <ProcessIdentifier>1001</ProcessIdentifier>
//!   <Message type="VERIFY" mac="bWFj">optional text</Message>
//!   <DataItems>
//!     <Username>alice</Username>
//!     <OTP>123456</OTP>
//!   </DataItems>
//! </OTPPacket>
//! ```

pub mod data_item;
pub mod framing;
pub mod key_data;
pub mod message;
pub mod otp_packet;
pub mod process_identifier;

mod xml;

pub use data_item::DataItem;
pub use framing::PacketReader;
pub use key_data::KeyData;
pub use message::{Message, MessageType, StatusCode};
pub use otp_packet::{OtpPacket, PROTOCOL_VERSION};
pub use process_identifier::ProcessIdentifier;

use thiserror::Error;

/// Reasons a packet cannot be decoded from, or encoded to, its XML form.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed xml: {0}")]
    Xml(String),
    #[error("unexpected element <{0}>")]
    UnexpectedElement(String),
    #[error("unexpected text inside <{0}>")]
    UnexpectedText(String),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unknown message type: {0:?}")]
    UnknownMessageType(String),
    #[error("unknown status code: {0:?}")]
    UnknownStatus(String),
    #[error("message is missing its type")]
    MissingType,
    #[error("request message {0} must not carry a status")]
    StatusOnRequest(MessageType),
    #[error("packet has no message")]
    MissingMessage,
    #[error("packet has more than one {0}")]
    Duplicate(&'static str),
    #[error("invalid integer in {field}: {value:?}")]
    InvalidInteger { field: &'static str, value: String },
    #[error("invalid base64 in {0}")]
    Base64(&'static str),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("packet exceeds {0} bytes")]
    TooLarge(usize),
    #[error("failed to write xml: {0}")]
    Write(String),
}
