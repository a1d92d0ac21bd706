pub mod authenticate;
pub mod cql_to_rust;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

use crate::frame::frame_errors::ParseError;

use authenticate::{AuthChallenge, AuthSuccess, Authenticate};
use event::Event;

pub use error::Error;
pub use supported::Supported;

use super::TryFromPrimitiveError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            0x0E => Ok(Self::AuthChallenge),
            0x10 => Ok(Self::AuthSuccess),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            }),
        }
    }
}

/// A response frame body, decoded according to its opcode.
#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::Result),
    Authenticate(Authenticate),
    AuthSuccess(AuthSuccess),
    AuthChallenge(AuthChallenge),
    Supported(Supported),
    Event(Event),
}

impl Response {
    pub fn deserialize(opcode: ResponseOpcode, buf: &mut &[u8]) -> Result<Response, ParseError> {
        Ok(match opcode {
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(result::deserialize(buf)?),
            ResponseOpcode::Event => Response::Event(Event::deserialize(buf)?),
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Authenticate => Response::Authenticate(Authenticate::deserialize(buf)?),
            ResponseOpcode::AuthChallenge => {
                Response::AuthChallenge(AuthChallenge::deserialize(buf)?)
            }
            ResponseOpcode::AuthSuccess => Response::AuthSuccess(AuthSuccess::deserialize(buf)?),
        })
    }

    /// Splits off the ERROR response so that callers can match on the rest.
    pub fn into_non_error_response(self) -> Result<NonErrorResponse, Error> {
        let response = match self {
            Response::Error(error) => return Err(error),
            Response::Ready => NonErrorResponse::Ready,
            Response::Result(body) => NonErrorResponse::Result(body),
            Response::Event(event) => NonErrorResponse::Event(event),
            Response::Supported(options) => NonErrorResponse::Supported(options),
            Response::Authenticate(body) => NonErrorResponse::Authenticate(body),
            Response::AuthChallenge(body) => NonErrorResponse::AuthChallenge(body),
            Response::AuthSuccess(body) => NonErrorResponse::AuthSuccess(body),
        };
        Ok(response)
    }
}

/// Every response but ERROR, which the driver turns into an error value first.
#[derive(Debug)]
pub enum NonErrorResponse {
    Ready,
    Result(result::Result),
    Authenticate(Authenticate),
    AuthSuccess(AuthSuccess),
    AuthChallenge(AuthChallenge),
    Supported(Supported),
    Event(Event),
}
