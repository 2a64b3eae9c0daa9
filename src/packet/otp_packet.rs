use super::xml::{XmlReader, element_name, ensure_whitespace, write_err, xml_err};
use super::{CodecError, DataItem, KeyData, Message, MessageType, ProcessIdentifier, StatusCode};
use super::{data_item, message, process_identifier};
use quick_xml::Reader;
use quick_xml::events::{BytesEnd, BytesStart, Event};

pub const ELEMENT: &str = "OTPPacket";

/// Highest protocol version this server speaks. Packets announcing a newer one are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// One protocol packet: a message, the flow it belongs to, and its data items.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OtpPacket {
    pub message: Message,
    pub process_identifier: ProcessIdentifier,
    pub data_items: Vec<DataItem>,
}

impl OtpPacket {
    #[must_use]
    pub fn new(message: Message, process_identifier: ProcessIdentifier) -> Self {
        Self {
            message,
            process_identifier,
            data_items: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_item(mut self, item: DataItem) -> Self {
        self.data_items.push(item);
        self
    }

    /// Reply to a `HELLO`: carries only the freshly assigned identifier.
    #[must_use]
    pub fn hello(process_identifier: ProcessIdentifier) -> Self {
        Self::new(Message::new(MessageType::Hello), process_identifier)
    }

    #[must_use]
    pub fn success(
        process_identifier: ProcessIdentifier,
        text: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self::new(
            Message::response(MessageType::Success, status, text),
            process_identifier,
        )
    }

    #[must_use]
    pub fn error(
        process_identifier: ProcessIdentifier,
        text: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self::new(
            Message::response(MessageType::Error, status, text),
            process_identifier,
        )
    }

    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message.message_type
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.data_items.iter().find_map(|item| match item {
            DataItem::Username(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// One-time passwords in the order they were sent.
    pub fn otps(&self) -> impl Iterator<Item = &str> {
        self.data_items.iter().filter_map(|item| match item {
            DataItem::Otp(otp) => Some(otp.as_str()),
            _ => None,
        })
    }

    #[must_use]
    pub fn seed(&self) -> Option<&[u8]> {
        self.data_items.iter().find_map(|item| match item {
            DataItem::Seed(seed) => Some(seed.as_slice()),
            _ => None,
        })
    }

    #[must_use]
    pub fn key(&self) -> Option<&KeyData> {
        self.data_items.iter().find_map(|item| match item {
            DataItem::Key(key) if !key.is_none() => Some(key),
            _ => None,
        })
    }

    /// Decode one packet from its XML text.
    ///
    /// # Errors
    /// Returns a [`CodecError`] if the text is not well-formed, announces an
    /// unsupported protocol version, or contains anything outside the protocol.
    pub fn from_xml(xml: &str) -> Result<Self, CodecError> {
        let mut reader = Reader::from_str(xml);

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) => return Self::read(&mut reader, &e, false),
                Event::Empty(e) => return Self::read(&mut reader, &e, true),
                Event::Text(t) => ensure_whitespace(&t, "document")?,
                Event::Eof => return Err(CodecError::UnexpectedEof),
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::End(e) => {
                    return Err(CodecError::Xml(format!(
                        "unexpected end tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                Event::CData(_) => return Err(CodecError::UnexpectedText("document".to_string())),
            }
        }
    }

    pub(crate) fn read(
        reader: &mut XmlReader<'_>,
        start: &BytesStart<'_>,
        empty: bool,
    ) -> Result<Self, CodecError> {
        let name = element_name(start);
        if name != ELEMENT {
            return Err(CodecError::UnexpectedElement(name));
        }

        for attr in start.attributes() {
            let attr = attr.map_err(xml_err)?;
            if attr.key.as_ref() == b"version" {
                let value = attr.unescape_value().map_err(xml_err)?;
                let version =
                    value
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| CodecError::InvalidInteger {
                            field: "version",
                            value: value.to_string(),
                        })?;
                if version == 0 || version > PROTOCOL_VERSION {
                    return Err(CodecError::UnsupportedVersion(version));
                }
            }
        }

        if empty {
            return Err(CodecError::MissingMessage);
        }

        let mut message = None;
        let mut process_identifier = None;
        let mut data_items = None;

        loop {
            let (e, is_empty) = match reader.read_event().map_err(xml_err)? {
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                Event::End(e) if e.name() == start.name() => break,
                Event::End(e) => {
                    return Err(CodecError::Xml(format!(
                        "mismatched end tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                Event::Text(t) => {
                    ensure_whitespace(&t, ELEMENT)?;
                    continue;
                }
                Event::CData(_) => return Err(CodecError::UnexpectedText(ELEMENT.to_string())),
                Event::Eof => return Err(CodecError::UnexpectedEof),
                Event::Comment(_) | Event::PI(_) | Event::Decl(_) | Event::DocType(_) => continue,
            };

            let child = element_name(&e);
            match child.as_str() {
                message::ELEMENT => {
                    if message.is_some() {
                        return Err(CodecError::Duplicate(message::ELEMENT));
                    }
                    message = Some(Message::read(reader, &e, is_empty)?);
                }
                process_identifier::ELEMENT => {
                    if process_identifier.is_some() {
                        return Err(CodecError::Duplicate(process_identifier::ELEMENT));
                    }
                    process_identifier = Some(ProcessIdentifier::read(reader, &e, is_empty)?);
                }
                data_item::ELEMENT => {
                    if data_items.is_some() {
                        return Err(CodecError::Duplicate(data_item::ELEMENT));
                    }
                    data_items = Some(DataItem::read_all(reader, &e, is_empty)?);
                }
                _ => return Err(CodecError::UnexpectedElement(child)),
            }
        }

        Ok(Self {
            message: message.ok_or(CodecError::MissingMessage)?,
            process_identifier: process_identifier.unwrap_or_default(),
            data_items: data_items.unwrap_or_default(),
        })
    }

    /// Encode the packet as a single XML element.
    ///
    /// # Errors
    /// Returns a [`CodecError`] if the message has no type or the writer fails.
    pub fn to_xml(&self) -> Result<String, CodecError> {
        let mut writer = quick_xml::Writer::new(Vec::new());
        let version = PROTOCOL_VERSION.to_string();

        let mut start = BytesStart::new(ELEMENT);
        start.push_attribute(("version", version.as_str()));
        writer.write_event(Event::Start(start)).map_err(write_err)?;
        self.process_identifier.write(&mut writer)?;
        self.message.write(&mut writer)?;
        DataItem::write_all(&self.data_items, &mut writer)?;
        writer
            .write_event(Event::End(BytesEnd::new(ELEMENT)))
            .map_err(write_err)?;

        String::from_utf8(writer.into_inner()).map_err(write_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_packet() -> OtpPacket {
        OtpPacket::new(
            Message::new(MessageType::Add).with_mac(vec![0xde, 0xad]),
            ProcessIdentifier::new(1001),
        )
        .with_item(DataItem::Username("alice".to_string()))
        .with_item(DataItem::Seed(b"12345678901234567890".to_vec()))
        .with_item(DataItem::Key(KeyData::rsa(vec![0xc3, 0x11], vec![1, 0, 1])))
    }

    #[test]
    fn packet_survives_write_and_parse() {
        let packet = add_packet();
        let xml = packet.to_xml().unwrap_or_default();
        assert_eq!(OtpPacket::from_xml(&xml).ok(), Some(packet));
    }

    #[test]
    fn hello_reply_is_minimal() {
        let xml = OtpPacket::hello(ProcessIdentifier::new(1001))
            .to_xml()
            .unwrap_or_default();
        assert_eq!(
            xml,
            concat!(
                r#"<OTPPacket version="1"><ProcessIdentifier>1001</ProcessIdentifier>"#,
                r#"<Message type="HELLO"></Message></OTPPacket>"#,
            )
        );
    }

    #[test]
    fn accessors_find_items() {
        let packet = add_packet()
            .with_item(DataItem::Otp("111111".to_string()))
            .with_item(DataItem::Otp("222222".to_string()));
        assert_eq!(packet.username(), Some("alice"));
        assert_eq!(packet.seed(), Some(&b"12345678901234567890"[..]));
        assert!(packet.key().is_some());
        assert_eq!(packet.otps().collect::<Vec<_>>(), vec!["111111", "222222"]);
    }

    #[test]
    fn accepts_declaration_and_whitespace() {
        let xml = concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<OTPPacket>\n  <Message type=\"HELLO\"/>\n</OTPPacket>\n",
        );
        let packet = OtpPacket::from_xml(xml).ok();
        assert_eq!(
            packet.as_ref().map(OtpPacket::message_type),
            Some(MessageType::Hello)
        );
        assert_eq!(
            packet.map(|p| p.process_identifier),
            Some(ProcessIdentifier::NONE)
        );
    }

    #[test]
    fn newer_protocol_version_is_rejected() {
        let xml = r#"<OTPPacket version="2"><Message type="HELLO"/></OTPPacket>"#;
        assert!(matches!(
            OtpPacket::from_xml(xml),
            Err(CodecError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn packet_without_message_is_rejected() {
        let xml = "<OTPPacket><ProcessIdentifier>3</ProcessIdentifier></OTPPacket>";
        assert!(matches!(
            OtpPacket::from_xml(xml),
            Err(CodecError::MissingMessage)
        ));
        assert!(matches!(
            OtpPacket::from_xml("<OTPPacket/>"),
            Err(CodecError::MissingMessage)
        ));
    }

    #[test]
    fn duplicate_message_is_rejected() {
        let xml = r#"<OTPPacket><Message type="HELLO"/><Message type="ADD"/></OTPPacket>"#;
        assert!(matches!(
            OtpPacket::from_xml(xml),
            Err(CodecError::Duplicate("Message"))
        ));
    }

    #[test]
    fn wrong_root_is_rejected() {
        assert!(matches!(
            OtpPacket::from_xml(r#"<Packet><Message type="HELLO"/></Packet>"#),
            Err(CodecError::UnexpectedElement(name)) if name == "Packet"
        ));
    }

    #[test]
    fn truncated_packet_is_rejected() {
        assert!(OtpPacket::from_xml(r#"<OTPPacket><Message type="HELLO">"#).is_err());
        assert!(OtpPacket::from_xml("not xml at all").is_err());
    }
}
