use crate::frame::frame_errors::ParseError;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

/// One step of the SASL exchange: the token the authenticator produced for
/// the last AUTHENTICATE or AUTH_CHALLENGE. `None` is sent as a null `[bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub token: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_bytes_opt(self.token.as_deref(), buf)
    }
}

impl DeserializableRequest for AuthResponse {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let token = types::read_bytes_opt(buf)?.map(<[u8]>::to_vec);
        Ok(AuthResponse { token })
    }
}
