use crate::frame::frame_errors::ParseError;

use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};

#[derive(Debug)]
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), ParseError> {
        Ok(())
    }
}

impl DeserializableRequest for Options {
    fn deserialize(_buf: &mut &[u8]) -> Result<Self, ParseError> {
        Ok(Options)
    }
}
