//! Bodies of the three responses of the SASL exchange.
//!
//! AUTHENTICATE names the server-side authenticator class and starts the
//! exchange; the driver then sends AUTH_RESPONSE tokens until the server
//! answers with AUTH_SUCCESS. Tokens are `[bytes]` and may be null.

use crate::frame::frame_errors::ParseError;
use crate::frame::types;

fn read_token(buf: &mut &[u8]) -> Result<Option<Vec<u8>>, ParseError> {
    Ok(types::read_bytes_opt(buf)?.map(<[u8]>::to_vec))
}

/// The server requires authentication before READY.
#[derive(Debug)]
pub struct Authenticate {
    /// Fully qualified class name, e.g.
    /// `org.apache.cassandra.auth.PasswordAuthenticator`.
    pub authenticator: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        Ok(Authenticate {
            authenticator: types::read_string(buf)?.to_owned(),
        })
    }
}

/// The exchange finished; carries an optional final token.
#[derive(Debug)]
pub struct AuthSuccess {
    pub token: Option<Vec<u8>>,
}

impl AuthSuccess {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        Ok(AuthSuccess {
            token: read_token(buf)?,
        })
    }
}

/// The server wants another AUTH_RESPONSE, computed from this token.
#[derive(Debug)]
pub struct AuthChallenge {
    pub token: Option<Vec<u8>>,
}

impl AuthChallenge {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        Ok(AuthChallenge {
            token: read_token(buf)?,
        })
    }
}
