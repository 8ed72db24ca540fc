use crate::frame::frame_errors::ParseError;

use std::{borrow::Cow, collections::HashMap};

use crate::frame::{
    request::{DeserializableRequest, RequestOpcode, SerializableRequest},
    types,
};

/// Opens the CQL session on a fresh connection. Carries the options
/// (CQL version, compression, driver identity) agreed on after OPTIONS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Startup<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_map(buf)?
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(Self { options })
    }
}

impl Startup<'_> {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|v| v.as_ref())
    }
}
