use crate::frame::frame_errors::ParseError;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    pub query: String,
}

impl SerializableRequest for Prepare {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(&self.query, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Prepare {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let query = types::read_long_string(buf)?.to_owned();
        Ok(Self { query })
    }
}
