use crate::frame::{frame_errors::ParseError, types::SerialConsistency};
use bytes::{Buf, BufMut, Bytes};

use crate::{
    frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest},
    frame::types,
};

// Query flags
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const ALL_FLAGS: u8 = FLAG_VALUES
    | FLAG_SKIP_METADATA
    | FLAG_PAGE_SIZE
    | FLAG_WITH_PAGING_STATE
    | FLAG_WITH_SERIAL_CONSISTENCY;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub contents: String,
    pub parameters: QueryParameters,
}

impl SerializableRequest for Query {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Query {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let contents = types::read_long_string(buf)?.to_owned();
        let parameters = QueryParameters::deserialize(buf)?;

        Ok(Self {
            contents,
            parameters,
        })
    }
}

/// Parameters shared by QUERY and EXECUTE.
///
/// Values are already serialized cells; `None` is sent as a CQL `null`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryParameters {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub values: Vec<Option<Bytes>>,
}

impl QueryParameters {
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }

        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }

        buf.put_u8(flags);

        if !self.values.is_empty() {
            let count: u16 = self.values.len().try_into().map_err(|_| {
                ParseError::BadData(format!("Too many values: {}", self.values.len()))
            })?;
            types::write_short(count, buf);
            for value in &self.values {
                types::write_bytes_opt(value.as_deref(), buf)?;
            }
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        Ok(())
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let consistency = types::read_consistency(buf)?;

        if !buf.has_remaining() {
            return Err(ParseError::BadIncomingData(
                "Missing query flags".to_string(),
            ));
        }
        let flags = buf.get_u8();
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(ParseError::BadIncomingData(format!(
                "Specified flags are not recognised: {:02x}",
                unknown_flags
            )));
        }

        let values = if flags & FLAG_VALUES != 0 {
            let count = types::read_short(buf)?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice));
            }
            values
        } else {
            Vec::new()
        };

        let skip_metadata = flags & FLAG_SKIP_METADATA != 0;

        let page_size = if flags & FLAG_PAGE_SIZE != 0 {
            Some(types::read_int(buf)?)
        } else {
            None
        };

        let paging_state = if flags & FLAG_WITH_PAGING_STATE != 0 {
            Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
        } else {
            None
        };

        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            match types::read_consistency(buf)? {
                types::Consistency::Serial => Some(SerialConsistency::Serial),
                types::Consistency::LocalSerial => Some(SerialConsistency::LocalSerial),
                other => {
                    return Err(ParseError::BadIncomingData(format!(
                        "Expected SerialConsistency, got regular Consistency {}",
                        other
                    )))
                }
            }
        } else {
            None
        };

        Ok(Self {
            consistency,
            serial_consistency,
            skip_metadata,
            page_size,
            paging_state,
            values,
        })
    }
}
