use super::CodecError;
use super::xml::{
    XmlReader, XmlWriter, decode_base64, element_name, encode_base64, ensure_whitespace,
    read_text, write_err, write_text_element, xml_err,
};
use quick_xml::events::{BytesEnd, BytesStart, Event};

pub const ELEMENT: &str = "KeyData";
const RSA_KEY_VALUE: &str = "RSAKeyValue";
const MODULUS: &str = "Modulus";
const EXPONENT: &str = "Exponent";

/// RSA public key as carried on the wire.
///
/// Modulus and exponent are kept as the exact big-endian byte strings the client
/// sent; they are never reinterpreted as numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

/// Public key attached to a packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyData {
    /// No key present. Serializes to nothing.
    #[default]
    None,
    Rsa(RsaPublicKey),
}

impl KeyData {
    #[must_use]
    pub fn rsa(modulus: impl Into<Vec<u8>>, exponent: impl Into<Vec<u8>>) -> Self {
        Self::Rsa(RsaPublicKey {
            modulus: modulus.into(),
            exponent: exponent.into(),
        })
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub(crate) fn read(
        reader: &mut XmlReader<'_>,
        start: &BytesStart<'_>,
        empty: bool,
    ) -> Result<Self, CodecError> {
        if empty {
            return Ok(Self::None);
        }

        let mut in_rsa = false;
        let mut seen_rsa = false;
        let mut modulus = None;
        let mut exponent = None;

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) => {
                    let name = element_name(&e);
                    match name.as_str() {
                        RSA_KEY_VALUE if !seen_rsa => {
                            in_rsa = true;
                            seen_rsa = true;
                        }
                        MODULUS if in_rsa && modulus.is_none() => {
                            let text = read_text(reader, &e, false)?;
                            modulus = Some(decode_base64(MODULUS, &text)?);
                        }
                        EXPONENT if in_rsa && exponent.is_none() => {
                            let text = read_text(reader, &e, false)?;
                            exponent = Some(decode_base64(EXPONENT, &text)?);
                        }
                        _ => return Err(CodecError::UnexpectedElement(name)),
                    }
                }
                Event::Empty(e) => {
                    let name = element_name(&e);
                    match name.as_str() {
                        RSA_KEY_VALUE if !seen_rsa => seen_rsa = true,
                        MODULUS if in_rsa && modulus.is_none() => modulus = Some(Vec::new()),
                        EXPONENT if in_rsa && exponent.is_none() => exponent = Some(Vec::new()),
                        _ => return Err(CodecError::UnexpectedElement(name)),
                    }
                }
                Event::End(e) if e.name().as_ref() == RSA_KEY_VALUE.as_bytes() && in_rsa => {
                    in_rsa = false;
                }
                Event::End(e) if e.name() == start.name() && !in_rsa => break,
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

        if !seen_rsa {
            return Ok(Self::None);
        }
        match (modulus, exponent) {
            (Some(modulus), Some(exponent)) => Ok(Self::Rsa(RsaPublicKey { modulus, exponent })),
            (None, _) => Err(CodecError::Xml(format!("{RSA_KEY_VALUE} without {MODULUS}"))),
            (_, None) => Err(CodecError::Xml(format!("{RSA_KEY_VALUE} without {EXPONENT}"))),
        }
    }

    pub(crate) fn write(&self, writer: &mut XmlWriter) -> Result<(), CodecError> {
        let Self::Rsa(key) = self else {
            return Ok(());
        };

        writer
            .write_event(Event::Start(BytesStart::new(ELEMENT)))
            .map_err(write_err)?;
        writer
            .write_event(Event::Start(BytesStart::new(RSA_KEY_VALUE)))
            .map_err(write_err)?;
        write_text_element(writer, MODULUS, &encode_base64(&key.modulus))?;
        write_text_element(writer, EXPONENT, &encode_base64(&key.exponent))?;
        writer
            .write_event(Event::End(BytesEnd::new(RSA_KEY_VALUE)))
            .map_err(write_err)?;
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

    fn parse(xml: &str) -> Result<KeyData, CodecError> {
        let mut reader = Reader::from_str(xml);
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => return KeyData::read(&mut reader, &e, false),
                Ok(Event::Empty(e)) => return KeyData::read(&mut reader, &e, true),
                Ok(Event::Eof) | Err(_) => return Err(CodecError::UnexpectedEof),
                Ok(_) => {}
            }
        }
    }

    fn render(key: &KeyData) -> String {
        let mut writer = Writer::new(Vec::new());
        assert!(key.write(&mut writer).is_ok());
        String::from_utf8(writer.into_inner()).unwrap_or_default()
    }

    #[test]
    fn parses_rsa_key_value() {
        let key = parse(concat!(
            "<KeyData>\n  <RSAKeyValue>\n",
            "    <Modulus>AAEC/w==</Modulus>\n    <Exponent>AQAB</Exponent>\n",
            "  </RSAKeyValue>\n</KeyData>",
        ));
        assert_eq!(key.ok(), Some(KeyData::rsa(vec![0, 1, 2, 255], vec![1, 0, 1])));
    }

    #[test]
    fn leading_zero_bytes_survive() {
        let key = KeyData::rsa(vec![0, 0, 7], vec![0, 1]);
        let xml = render(&key);
        assert_eq!(parse(&xml).ok(), Some(key));
    }

    #[test]
    fn unknown_element_fails_fast() {
        let result = parse(
            "<KeyData><RSAKeyValue><Modulus>AQAB</Modulus><P>AQAB</P></RSAKeyValue></KeyData>",
        );
        assert!(matches!(result, Err(CodecError::UnexpectedElement(name)) if name == "P"));

        let result = parse("<KeyData><DSAKeyValue/></KeyData>");
        assert!(matches!(
            result,
            Err(CodecError::UnexpectedElement(name)) if name == "DSAKeyValue"
        ));
    }

    #[test]
    fn modulus_outside_rsa_block_fails() {
        let result = parse("<KeyData><Modulus>AQAB</Modulus></KeyData>");
        assert!(matches!(result, Err(CodecError::UnexpectedElement(_))));
    }

    #[test]
    fn incomplete_rsa_block_fails() {
        let result =
            parse("<KeyData><RSAKeyValue><Modulus>AQAB</Modulus></RSAKeyValue></KeyData>");
        assert!(matches!(result, Err(CodecError::Xml(_))));
    }

    #[test]
    fn empty_rsa_block_reads_like_an_open_one() {
        let open = parse("<KeyData><RSAKeyValue></RSAKeyValue></KeyData>");
        let empty = parse("<KeyData><RSAKeyValue/></KeyData>");
        assert!(matches!(open, Err(CodecError::Xml(_))));
        assert!(matches!(empty, Err(CodecError::Xml(ref m)) if m.contains("without Modulus")));

        let twice = parse("<KeyData><RSAKeyValue/><RSAKeyValue/></KeyData>");
        assert!(matches!(twice, Err(CodecError::UnexpectedElement(name)) if name == "RSAKeyValue"));
    }

    #[test]
    fn empty_key_data_is_none() {
        assert_eq!(parse("<KeyData/>").ok(), Some(KeyData::None));
        assert_eq!(parse("<KeyData></KeyData>").ok(), Some(KeyData::None));
    }

    #[test]
    fn none_writes_nothing() {
        assert_eq!(render(&KeyData::None), "");
    }

    #[test]
    fn rsa_writes_base64_values() {
        let xml = render(&KeyData::rsa(vec![1, 2, 3], vec![1, 0, 1]));
        assert_eq!(
            xml,
            concat!(
                "<KeyData><RSAKeyValue><Modulus>AQID</Modulus>",
                "<Exponent>AQAB</Exponent></RSAKeyValue></KeyData>",
            )
        );
    }
}
