use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use std::collections::HashMap;

/// SUPPORTED response: the STARTUP options the server accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_multimap(buf)?;

        Ok(Supported { options })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_string_multimap(&self.options, buf)?;
        Ok(())
    }

    /// Values listed under `key`, empty when the server did not mention it.
    pub fn values(&self, key: &str) -> &[String] {
        self.options.get(key).map(Vec::as_slice).unwrap_or_default()
    }
}
