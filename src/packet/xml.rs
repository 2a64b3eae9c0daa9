use super::CodecError;
use base64ct::{Base64, Encoding};
use quick_xml::Reader;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::fmt::Display;

pub(crate) type XmlReader<'a> = Reader<&'a [u8]>;
pub(crate) type XmlWriter = quick_xml::Writer<Vec<u8>>;

pub(crate) fn xml_err<E: Display>(e: E) -> CodecError {
    CodecError::Xml(e.to_string())
}

pub(crate) fn write_err<E: Display>(e: E) -> CodecError {
    CodecError::Write(e.to_string())
}

pub(crate) fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

/// Read the text content of the element opened by `start`, consuming its end tag.
///
/// Nested elements are rejected. An empty element (`<Name/>`) yields an empty string.
pub(crate) fn read_text(
    reader: &mut XmlReader<'_>,
    start: &BytesStart<'_>,
    empty: bool,
) -> Result<String, CodecError> {
    let mut text = String::new();
    if empty {
        return Ok(text);
    }

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Text(t) => text.push_str(&t.unescape().map_err(xml_err)?),
            Event::CData(c) => {
                let raw = std::str::from_utf8(&c).map_err(xml_err)?;
                text.push_str(raw);
            }
            Event::End(end) if end.name() == start.name() => return Ok(text),
            Event::Start(e) | Event::Empty(e) => {
                return Err(CodecError::UnexpectedElement(element_name(&e)));
            }
            Event::End(e) => {
                return Err(CodecError::Xml(format!(
                    "mismatched end tag </{}>",
                    String::from_utf8_lossy(e.name().as_ref())
                )));
            }
            Event::Eof => return Err(CodecError::UnexpectedEof),
            Event::Comment(_) | Event::PI(_) | Event::Decl(_) | Event::DocType(_) => {}
        }
    }
}

/// Structural positions accept whitespace between elements and nothing else.
pub(crate) fn ensure_whitespace(text: &BytesText<'_>, parent: &str) -> Result<(), CodecError> {
    if text.iter().all(u8::is_ascii_whitespace) {
        Ok(())
    } else {
        Err(CodecError::UnexpectedText(parent.to_string()))
    }
}

pub(crate) fn decode_base64(field: &'static str, value: &str) -> Result<Vec<u8>, CodecError> {
    Base64::decode_vec(value.trim()).map_err(|_| CodecError::Base64(field))
}

pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    Base64::encode_string(bytes)
}

pub(crate) fn write_text_element(
    writer: &mut XmlWriter,
    name: &str,
    text: &str,
) -> Result<(), CodecError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(write_err)?;
    if !text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(write_err)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(write_err)?;
    Ok(())
}
