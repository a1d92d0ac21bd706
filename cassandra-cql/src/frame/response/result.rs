use crate::frame::frame_errors::ParseError;
use crate::frame::response::cql_to_rust::{FromCqlVal, FromRowError};
use crate::frame::response::event::SchemaChangeType;
use crate::frame::types;
use bytes::{Buf, BufMut, Bytes};

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: ResultMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub change_type: SchemaChangeType,
    pub keyspace_name: String,
    pub table_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Text,
    Varint,
    Timeuuid,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

/// A single row; one optional serialized cell per column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

#[derive(Debug, Clone)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows: Vec<Row>,
}

impl Rows {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.metadata.col_specs.iter().position(|spec| spec.name == name)
    }

    /// Reads the cell of the named column, converting it by the column's type.
    pub fn get<T: FromCqlVal>(&self, row: &Row, column: &str) -> std::result::Result<T, FromRowError> {
        let index = self
            .column_index(column)
            .ok_or_else(|| FromRowError::NoSuchColumn(column.to_string()))?;
        let typ = &self.metadata.col_specs[index].typ;
        let cell = row
            .columns
            .get(index)
            .ok_or(FromRowError::WrongRowSize {
                expected: index + 1,
                actual: row.columns.len(),
            })?
            .as_deref();
        T::from_cql(typ, cell).map_err(|err| FromRowError::BadCqlVal {
            err,
            column: index,
        })
    }
}

#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_type(buf: &mut &[u8]) -> std::result::Result<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => Custom(types::read_string(buf)?.to_string()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000A | 0x000D => Text,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        id => return Err(ParseError::TypeNotImplemented(id)),
    })
}

fn ser_type(typ: &ColumnType, buf: &mut impl BufMut) -> std::result::Result<(), ParseError> {
    use ColumnType::*;
    let id: u16 = match typ {
        Custom(_) => 0x0000,
        Ascii => 0x0001,
        BigInt => 0x0002,
        Blob => 0x0003,
        Boolean => 0x0004,
        Counter => 0x0005,
        Decimal => 0x0006,
        Double => 0x0007,
        Float => 0x0008,
        Int => 0x0009,
        Timestamp => 0x000B,
        Uuid => 0x000C,
        Text => 0x000D,
        Varint => 0x000E,
        Timeuuid => 0x000F,
        Inet => 0x0010,
        List(_) => 0x0020,
        Map(_, _) => 0x0021,
        Set(_) => 0x0022,
    };
    types::write_short(id, buf);
    match typ {
        Custom(name) => types::write_string(name, buf)?,
        List(elem) | Set(elem) => ser_type(elem, buf)?,
        Map(key, value) => {
            ser_type(key, buf)?;
            ser_type(value, buf)?;
        }
        _ => {}
    }
    Ok(())
}

fn deser_table_spec(buf: &mut &[u8]) -> std::result::Result<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_result_metadata(buf: &mut &[u8]) -> std::result::Result<ResultMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count: usize = types::read_int(buf)?.try_into()?;

    let paging_state = if has_more_pages {
        Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
    } else {
        None
    };

    if no_metadata {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            col_specs: vec![],
        });
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match &global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn ser_result_metadata(
    metadata: &ResultMetadata,
    buf: &mut impl BufMut,
) -> std::result::Result<(), ParseError> {
    let mut flags = 0;
    if metadata.paging_state.is_some() {
        flags |= FLAG_HAS_MORE_PAGES;
    }
    if metadata.col_specs.is_empty() {
        flags |= FLAG_NO_METADATA;
    }
    types::write_int(flags, buf);
    types::write_int(metadata.col_count as i32, buf);
    if let Some(paging_state) = &metadata.paging_state {
        types::write_bytes(paging_state, buf)?;
    }
    for spec in &metadata.col_specs {
        types::write_string(&spec.table_spec.ks_name, buf)?;
        types::write_string(&spec.table_spec.table_name, buf)?;
        types::write_string(&spec.name, buf)?;
        ser_type(&spec.typ, buf)?;
    }
    Ok(())
}

fn deser_rows(buf: &mut &[u8]) -> std::result::Result<Rows, ParseError> {
    let metadata = deser_result_metadata(buf)?;

    let rows_count: usize = types::read_int(buf)?.try_into()?;

    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for _ in 0..metadata.col_count {
            columns.push(types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice));
        }
        rows.push(Row { columns });
    }
    Ok(Rows { metadata, rows })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> std::result::Result<SetKeyspace, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(buf: &mut &[u8]) -> std::result::Result<Prepared, ParseError> {
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
    let prepared_metadata = deser_result_metadata(buf)?;
    let result_metadata = deser_result_metadata(buf)?;
    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> std::result::Result<SchemaChange, ParseError> {
    let change_type = match types::read_string(buf)? {
        "CREATED" => SchemaChangeType::Created,
        "UPDATED" => SchemaChangeType::Updated,
        "DROPPED" => SchemaChangeType::Dropped,
        _ => SchemaChangeType::Invalid,
    };
    let keyspace_name = types::read_string(buf)?.to_string();
    let table_name = types::read_string(buf)?;
    Ok(SchemaChange {
        change_type,
        keyspace_name,
        table_name: (!table_name.is_empty()).then(|| table_name.to_string()),
    })
}

pub fn deserialize(buf: &mut &[u8]) -> std::result::Result<Result, ParseError> {
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf)?),
        0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Prepared(deser_prepared(buf)?),
        0x0005 => SchemaChange(deser_schema_change(buf)?),
        k => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown query result id: {}",
                k
            )))
        }
    })
}

impl Result {
    /// Writes the body of a RESULT response. Used by in-process test servers.
    pub fn serialize(&self, buf: &mut impl BufMut) -> std::result::Result<(), ParseError> {
        match self {
            Result::Void => types::write_int(0x0001, buf),
            Result::Rows(rows) => {
                types::write_int(0x0002, buf);
                ser_result_metadata(&rows.metadata, buf)?;
                types::write_int(rows.rows.len() as i32, buf);
                for row in &rows.rows {
                    for cell in &row.columns {
                        types::write_bytes_opt(cell.as_deref(), buf)?;
                    }
                }
            }
            Result::SetKeyspace(set_keyspace) => {
                types::write_int(0x0003, buf);
                types::write_string(&set_keyspace.keyspace_name, buf)?;
            }
            Result::Prepared(prepared) => {
                types::write_int(0x0004, buf);
                types::write_short_bytes(&prepared.id, buf)?;
                ser_result_metadata(&prepared.prepared_metadata, buf)?;
                ser_result_metadata(&prepared.result_metadata, buf)?;
            }
            Result::SchemaChange(change) => {
                types::write_int(0x0005, buf);
                let change_type = match change.change_type {
                    SchemaChangeType::Created => "CREATED",
                    SchemaChangeType::Updated => "UPDATED",
                    SchemaChangeType::Dropped => "DROPPED",
                    SchemaChangeType::Invalid => "INVALID",
                };
                types::write_string(change_type, buf)?;
                types::write_string(&change.keyspace_name, buf)?;
                types::write_string(change.table_name.as_deref().unwrap_or(""), buf)?;
            }
        }
        Ok(())
    }
}

impl Rows {
    /// Builds a rows result of a single table, one spec per `(name, type)`.
    pub fn new(
        ks_name: &str,
        table_name: &str,
        columns: Vec<(&str, ColumnType)>,
        rows: Vec<Row>,
    ) -> Rows {
        let table_spec = TableSpec {
            ks_name: ks_name.to_string(),
            table_name: table_name.to_string(),
        };
        let col_specs: Vec<ColumnSpec> = columns
            .into_iter()
            .map(|(name, typ)| ColumnSpec {
                table_spec: table_spec.clone(),
                name: name.to_string(),
                typ,
            })
            .collect();
        Rows {
            metadata: ResultMetadata {
                col_count: col_specs.len(),
                paging_state: None,
                col_specs,
            },
            rows,
        }
    }
}
