use super::CodecError;
use super::xml::{XmlReader, XmlWriter, read_text, write_text_element};
use quick_xml::events::BytesStart;
use std::fmt;

pub const ELEMENT: &str = "ProcessIdentifier";

/// Server-side handle of one authentication flow.
///
/// Minted by the authority on `HELLO` and echoed by the client on every later
/// packet of the same flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ProcessIdentifier(u32);

impl ProcessIdentifier {
    /// No identifier assigned yet.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn read(
        reader: &mut XmlReader<'_>,
        start: &BytesStart<'_>,
        empty: bool,
    ) -> Result<Self, CodecError> {
        let text = read_text(reader, start, empty)?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::NONE);
        }
        trimmed
            .parse::<u32>()
            .map(Self)
            .map_err(|_| CodecError::InvalidInteger {
                field: ELEMENT,
                value: text.clone(),
            })
    }

    pub(crate) fn write(self, writer: &mut XmlWriter) -> Result<(), CodecError> {
        write_text_element(writer, ELEMENT, &self.0.to_string())
    }
}

impl fmt::Display for ProcessIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessIdentifier {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
