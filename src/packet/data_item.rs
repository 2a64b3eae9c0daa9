use super::CodecError;
use super::key_data::{self, KeyData};
use super::xml::{
    XmlReader, XmlWriter, decode_base64, element_name, encode_base64, ensure_whitespace,
    read_text, write_err, write_text_element, xml_err,
};
use quick_xml::events::{BytesEnd, BytesStart, Event};

pub const ELEMENT: &str = "DataItems";
const USERNAME: &str = "Username";
const OTP: &str = "OTP";
const SEED: &str = "Seed";

/// A named piece of partial identity data carried by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataItem {
    Username(String),
    /// One-time password as typed by the user. Kept as text so leading zeros survive.
    Otp(String),
    /// OTP shared secret.
    Seed(Vec<u8>),
    Key(KeyData),
}

impl DataItem {
    /// Read every item of a `<DataItems>` block.
    pub(crate) fn read_all(
        reader: &mut XmlReader<'_>,
        start: &BytesStart<'_>,
        empty: bool,
    ) -> Result<Vec<Self>, CodecError> {
        let mut items = Vec::new();
        if empty {
            return Ok(items);
        }

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) => items.push(Self::read_one(reader, &e, false)?),
                Event::Empty(e) => items.push(Self::read_one(reader, &e, true)?),
                Event::End(e) if e.name() == start.name() => return Ok(items),
                Event::End(e) => {
                    return Err(CodecError::Xml(format!(
                        "mismatched end tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                Event::Text(t) => ensure_whitespace(&t, ELEMENT)?,
                Event::CData(_) => return Err(CodecError::UnexpectedText(ELEMENT.to_string())),
                Event::Eof => return Err(CodecError::UnexpectedEof),
                Event::Comment(_) | Event::PI(_) | Event::Decl(_) | Event::DocType(_) => {}
            }
        }
    }

    fn read_one(
        reader: &mut XmlReader<'_>,
        start: &BytesStart<'_>,
        empty: bool,
    ) -> Result<Self, CodecError> {
        let name = element_name(start);
        match name.as_str() {
            USERNAME => Ok(Self::Username(read_text(reader, start, empty)?)),
            OTP => Ok(Self::Otp(read_text(reader, start, empty)?.trim().to_string())),
            SEED => {
                let text = read_text(reader, start, empty)?;
                Ok(Self::Seed(decode_base64(SEED, &text)?))
            }
            key_data::ELEMENT => Ok(Self::Key(KeyData::read(reader, start, empty)?)),
            _ => Err(CodecError::UnexpectedElement(name)),
        }
    }

    /// Write a `<DataItems>` block. Nothing is written for an empty slice.
    pub(crate) fn write_all(items: &[Self], writer: &mut XmlWriter) -> Result<(), CodecError> {
        if items.is_empty() {
            return Ok(());
        }

        writer
            .write_event(Event::Start(BytesStart::new(ELEMENT)))
            .map_err(write_err)?;
        for item in items {
            match item {
                Self::Username(name) => write_text_element(writer, USERNAME, name)?,
                Self::Otp(otp) => write_text_element(writer, OTP, otp)?,
                Self::Seed(seed) => write_text_element(writer, SEED, &encode_base64(seed))?,
                Self::Key(key) => key.write(writer)?,
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(ELEMENT)))
            .map_err(write_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quick_xml::{Reader, Writer};

    fn parse(xml: &str) -> Result<Vec<DataItem>, CodecError> {
        let mut reader = Reader::from_str(xml);
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => return DataItem::read_all(&mut reader, &e, false),
                Ok(Event::Empty(e)) => return DataItem::read_all(&mut reader, &e, true),
                Ok(Event::Eof) | Err(_) => return Err(CodecError::UnexpectedEof),
                Ok(_) => {}
            }
        }
    }

    #[test]
    fn keeps_item_order() {
        let items = parse(
            concat!(
                "<DataItems>\n<Username>alice</Username>\n<OTP> 012345 </OTP>\n",
                "<OTP>678901</OTP>\n<Seed>AQID</Seed>\n</DataItems>",
            ),
        );
        assert_eq!(
            items.ok(),
            Some(vec![
                DataItem::Username("alice".to_string()),
                DataItem::Otp("012345".to_string()),
                DataItem::Otp("678901".to_string()),
                DataItem::Seed(vec![1, 2, 3]),
            ])
        );
    }

    #[test]
    fn reads_nested_key_data() {
        let items = parse(
            concat!(
                "<DataItems><KeyData><RSAKeyValue><Modulus>AQID</Modulus>",
                "<Exponent>AQAB</Exponent></RSAKeyValue></KeyData></DataItems>",
            ),
        );
        assert_eq!(
            items.ok(),
            Some(vec![DataItem::Key(KeyData::rsa(vec![1, 2, 3], vec![1, 0, 1]))])
        );
    }

    #[test]
    fn unknown_item_is_rejected() {
        assert!(matches!(
            parse("<DataItems><Password>x</Password></DataItems>"),
            Err(CodecError::UnexpectedElement(name)) if name == "Password"
        ));
    }

    #[test]
    fn stray_text_is_rejected() {
        assert!(matches!(
            parse("<DataItems>alice</DataItems>"),
            Err(CodecError::UnexpectedText(_))
        ));
    }

    #[test]
    fn empty_slice_writes_nothing() {
        let mut writer = Writer::new(Vec::new());
        assert!(DataItem::write_all(&[], &mut writer).is_ok());
        assert!(writer.into_inner().is_empty());
    }
}
