use std::collections::HashMap;

use crate::frame::frame_errors::ParseError;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

pub const CQL_VERSION_KEY: &str = "CQL_VERSION";
pub const COMPRESSION_KEY: &str = "COMPRESSION";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    pub options: HashMap<String, String>,
}

impl SerializableRequest for Startup {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Startup {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_map(buf)?;
        Ok(Self { options })
    }
}
