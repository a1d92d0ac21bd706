use crate::errors::{DbError, WriteType};
use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use byteorder::ReadBytesExt;
use bytes::{BufMut, Bytes};

#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: buf.read_u8()? != 0,
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_string(),
                table: types::read_string(buf)?.to_string(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }

    /// Writes the body of an ERROR response. Used by in-process test servers.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_int(self.error.code(), buf);
        types::write_string(&self.reason, buf)?;
        match &self.error {
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*required, buf);
                types::write_int(*alive, buf);
            }
            DbError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                buf.put_u8(u8::from(*data_present));
            }
            DbError::AlreadyExists { keyspace, table } => {
                types::write_string(keyspace, buf)?;
                types::write_string(table, buf)?;
            }
            DbError::Unprepared { statement_id } => {
                types::write_short_bytes(statement_id, buf)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::errors::{DbError, WriteType};
    use crate::frame::types::Consistency;
    use bytes::Bytes;

    // Serializes the beginning of an error - error code and reason
    fn make_error_request_bytes(error_code: i32, reason: &str) -> Vec<u8> {
        let mut bytes: Vec<u8> = Vec::new();
        let reason_len: u16 = reason.len().try_into().unwrap();

        bytes.extend(error_code.to_be_bytes());
        bytes.extend(reason_len.to_be_bytes());
        bytes.extend(reason.as_bytes());

        bytes
    }

    #[test]
    fn deserialize_simple_errors() {
        let simple_error_mappings: [(i32, DbError); 11] = [
            (0x0000, DbError::ServerError),
            (0x000A, DbError::ProtocolError),
            (0x0100, DbError::AuthenticationError),
            (0x1001, DbError::Overloaded),
            (0x1002, DbError::IsBootstrapping),
            (0x1003, DbError::TruncateError),
            (0x2000, DbError::SyntaxError),
            (0x2100, DbError::Unauthorized),
            (0x2200, DbError::Invalid),
            (0x2300, DbError::ConfigError),
            (0x1234, DbError::Other(0x1234)),
        ];

        for (error_code, expected_error) in &simple_error_mappings {
            let bytes: Vec<u8> = make_error_request_bytes(*error_code, "simple message");
            let error: Error = Error::deserialize(&mut bytes.as_slice()).unwrap();
            assert_eq!(error.error, *expected_error);
            assert_eq!(error.reason, "simple message");
        }
    }

    #[test]
    fn deserialize_write_timeout() {
        let mut bytes = make_error_request_bytes(0x1100, "Write timeout");
        bytes.extend(0x0004_i16.to_be_bytes());
        bytes.extend(2_i32.to_be_bytes());
        bytes.extend(3_i32.to_be_bytes());
        let write_type_str = "BATCH_LOG";
        let write_type_str_len: u16 = write_type_str.len().try_into().unwrap();
        bytes.extend(write_type_str_len.to_be_bytes());
        bytes.extend(write_type_str.as_bytes());

        let error: Error = Error::deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            error.error,
            DbError::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 2,
                required: 3,
                write_type: WriteType::BatchLog,
            }
        );
    }

    #[test]
    fn deserialize_read_timeout() {
        let mut bytes = make_error_request_bytes(0x1200, "Read timeout");
        bytes.extend(0x0001_i16.to_be_bytes());
        bytes.extend(1_i32.to_be_bytes());
        bytes.extend(1_i32.to_be_bytes());
        bytes.push(0);

        let error: Error = Error::deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            error.error,
            DbError::ReadTimeout {
                consistency: Consistency::One,
                received: 1,
                required: 1,
                data_present: false,
            }
        );
    }

    #[test]
    fn deserialize_unprepared() {
        let mut bytes = make_error_request_bytes(0x2500, "Unprepared");
        bytes.extend(4_u16.to_be_bytes());
        bytes.extend([1, 2, 3, 4]);

        let error: Error = Error::deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            error.error,
            DbError::Unprepared {
                statement_id: Bytes::from_static(&[1, 2, 3, 4]),
            }
        );
    }

    #[test]
    fn serialized_error_is_readable() {
        let error = Error {
            error: DbError::AlreadyExists {
                keyspace: "ks".to_string(),
                table: "t".to_string(),
            },
            reason: "exists".to_string(),
        };
        let mut buf = Vec::new();
        error.serialize(&mut buf).unwrap();
        let parsed = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(parsed.error, error.error);
        assert_eq!(parsed.reason, "exists");
    }
}
