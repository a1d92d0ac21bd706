use super::result::ColumnType;
use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FromRowError {
    #[error("{err} in the column with index {column}")]
    BadCqlVal { err: FromCqlValError, column: usize },
    #[error("Wrong row size: expected {expected}, actual {actual}")]
    WrongRowSize { expected: usize, actual: usize },
    #[error("No column named {0} in the result")]
    NoSuchColumn(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CqlTypeError {
    #[error("Invalid number of collection elements: {0}")]
    InvalidNumberOfElements(u16),
    #[error("Invalid length of a fixed-size value: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Conversion of a serialized cell into a rust value, driven by the column type
/// announced in the result metadata.
pub trait FromCqlVal: Sized {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FromCqlValError {
    #[error("Bad CQL type")]
    BadCqlType,
    #[error("Value is null")]
    ValIsNull,
    #[error("Malformed value: {0}")]
    BadVal(String),
}

impl From<ParseError> for FromCqlValError {
    fn from(err: ParseError) -> Self {
        FromCqlValError::BadVal(err.to_string())
    }
}

impl From<CqlTypeError> for FromCqlValError {
    fn from(err: CqlTypeError) -> Self {
        FromCqlValError::BadVal(err.to_string())
    }
}

fn non_null(cell: Option<&[u8]>) -> Result<&[u8], FromCqlValError> {
    cell.ok_or(FromCqlValError::ValIsNull)
}

fn fixed<const N: usize>(cell: &[u8]) -> Result<[u8; N], FromCqlValError> {
    cell.try_into().map_err(|_| {
        CqlTypeError::InvalidLength {
            expected: N,
            actual: cell.len(),
        }
        .into()
    })
}

impl<T: FromCqlVal> FromCqlVal for Option<T> {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        match cell {
            None => Ok(None),
            Some(_) => T::from_cql(typ, cell).map(Some),
        }
    }
}

impl FromCqlVal for String {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        match typ {
            ColumnType::Ascii | ColumnType::Text | ColumnType::Custom(_) => {
                let raw = non_null(cell)?;
                std::str::from_utf8(raw)
                    .map(str::to_owned)
                    .map_err(|err| FromCqlValError::BadVal(err.to_string()))
            }
            _ => Err(FromCqlValError::BadCqlType),
        }
    }
}

impl FromCqlVal for i32 {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        match typ {
            ColumnType::Int => Ok(i32::from_be_bytes(fixed(non_null(cell)?)?)),
            _ => Err(FromCqlValError::BadCqlType),
        }
    }
}

impl FromCqlVal for i64 {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        match typ {
            ColumnType::BigInt | ColumnType::Counter | ColumnType::Timestamp => {
                Ok(i64::from_be_bytes(fixed(non_null(cell)?)?))
            }
            _ => Err(FromCqlValError::BadCqlType),
        }
    }
}

impl FromCqlVal for bool {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        match typ {
            ColumnType::Boolean => Ok(fixed::<1>(non_null(cell)?)?[0] != 0),
            _ => Err(FromCqlValError::BadCqlType),
        }
    }
}

impl FromCqlVal for Uuid {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        match typ {
            ColumnType::Uuid | ColumnType::Timeuuid => {
                Ok(Uuid::from_bytes(fixed(non_null(cell)?)?))
            }
            _ => Err(FromCqlValError::BadCqlType),
        }
    }
}

impl FromCqlVal for IpAddr {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        if *typ != ColumnType::Inet {
            return Err(FromCqlValError::BadCqlType);
        }
        let raw = non_null(cell)?;
        match raw.len() {
            4 => Ok(IpAddr::from(fixed::<4>(raw)?)),
            16 => Ok(IpAddr::from(fixed::<16>(raw)?)),
            actual => Err(CqlTypeError::InvalidLength {
                expected: 4,
                actual,
            }
            .into()),
        }
    }
}

impl FromCqlVal for Bytes {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        match typ {
            ColumnType::Blob | ColumnType::Custom(_) => {
                Ok(Bytes::copy_from_slice(non_null(cell)?))
            }
            _ => Err(FromCqlValError::BadCqlType),
        }
    }
}

// Collections are encoded with [short] element counts and lengths in v2.
fn read_elements(mut raw: &[u8]) -> Result<Vec<&[u8]>, FromCqlValError> {
    let buf = &mut raw;
    let count = types::read_short(buf)?;
    let mut elements = Vec::with_capacity(count as usize);
    for _ in 0..count {
        elements.push(types::read_short_bytes(buf)?);
    }
    if !buf.is_empty() {
        return Err(CqlTypeError::InvalidNumberOfElements(count).into());
    }
    Ok(elements)
}

impl<T: FromCqlVal> FromCqlVal for Vec<T> {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        let elem_type = match typ {
            ColumnType::List(elem) | ColumnType::Set(elem) => elem,
            _ => return Err(FromCqlValError::BadCqlType),
        };
        // A null collection is an empty one.
        let Some(raw) = cell else {
            return Ok(Vec::new());
        };
        read_elements(raw)?
            .into_iter()
            .map(|elem| T::from_cql(elem_type, Some(elem)))
            .collect()
    }
}

impl<T: FromCqlVal + Eq + std::hash::Hash> FromCqlVal for HashSet<T> {
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        Ok(Vec::<T>::from_cql(typ, cell)?.into_iter().collect())
    }
}

fn read_map_entries<K: FromCqlVal, V: FromCqlVal>(
    typ: &ColumnType,
    cell: Option<&[u8]>,
) -> Result<Vec<(K, V)>, FromCqlValError> {
    let (key_type, value_type) = match typ {
        ColumnType::Map(key, value) => (key, value),
        _ => return Err(FromCqlValError::BadCqlType),
    };
    let Some(raw) = cell else {
        return Ok(Vec::new());
    };
    let elements = read_elements_pairs(raw)?;
    elements
        .into_iter()
        .map(|(key, value)| {
            Ok((
                K::from_cql(key_type, Some(key))?,
                V::from_cql(value_type, Some(value))?,
            ))
        })
        .collect()
}

fn read_elements_pairs(mut raw: &[u8]) -> Result<Vec<(&[u8], &[u8])>, FromCqlValError> {
    let buf = &mut raw;
    let count = types::read_short(buf)?;
    let mut pairs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = types::read_short_bytes(buf)?;
        let value = types::read_short_bytes(buf)?;
        pairs.push((key, value));
    }
    if !buf.is_empty() {
        return Err(CqlTypeError::InvalidNumberOfElements(count).into());
    }
    Ok(pairs)
}

impl<K, V> FromCqlVal for HashMap<K, V>
where
    K: FromCqlVal + Eq + std::hash::Hash,
    V: FromCqlVal,
{
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        Ok(read_map_entries(typ, cell)?.into_iter().collect())
    }
}

impl<K, V> FromCqlVal for BTreeMap<K, V>
where
    K: FromCqlVal + Ord,
    V: FromCqlVal,
{
    fn from_cql(typ: &ColumnType, cell: Option<&[u8]>) -> Result<Self, FromCqlValError> {
        Ok(read_map_entries(typ, cell)?.into_iter().collect())
    }
}

/// Serializes a list or set of strings the way v2 expects it inside a cell.
pub fn serialize_string_collection<'a>(values: impl IntoIterator<Item = &'a str>) -> Bytes {
    let values: Vec<&str> = values.into_iter().collect();
    let mut buf = Vec::new();
    types::write_short(values.len() as u16, &mut buf);
    for value in values {
        types::write_short(value.len() as u16, &mut buf);
        buf.extend_from_slice(value.as_bytes());
    }
    buf.into()
}

/// Serializes a `map<text, text>` cell.
pub fn serialize_string_map<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Bytes {
    let entries: Vec<(&str, &str)> = entries.into_iter().collect();
    let mut buf = Vec::new();
    types::write_short(entries.len() as u16, &mut buf);
    for (key, value) in entries {
        types::write_short(key.len() as u16, &mut buf);
        buf.extend_from_slice(key.as_bytes());
        types::write_short(value.len() as u16, &mut buf);
        buf.extend_from_slice(value.as_bytes());
    }
    buf.into()
}
