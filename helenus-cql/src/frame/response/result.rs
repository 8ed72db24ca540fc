use crate::frame::frame_errors::{CqlTypeError, ParseError};
use crate::frame::types;
use crate::frame::value::Value;
use crate::value::{CqlDate, CqlDecimal, CqlDuration, CqlTime, CqlTimestamp, CqlValue, CqlVarint};
use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use std::{convert::TryFrom, net::IpAddr, result::Result as StdResult, str};

// RESULT kinds
const KIND_VOID: i32 = 0x0001;
const KIND_ROWS: i32 = 0x0002;
const KIND_SET_KEYSPACE: i32 = 0x0003;
const KIND_PREPARED: i32 = 0x0004;
const KIND_SCHEMA_CHANGE: i32 = 0x0005;

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    /// CREATED, UPDATED or DROPPED
    pub change_type: String,
    /// KEYSPACE, TABLE, TYPE, FUNCTION or AGGREGATE
    pub target: String,
    pub keyspace: String,
    /// Name of the affected object, `None` for keyspace changes.
    pub name: Option<String>,
    pub arguments: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        type_name: String,
        keyspace: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

impl ColumnType {
    /// Writes the `[option]` describing this type, as found in rows metadata.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), ParseError> {
        use ColumnType::*;
        let id: u16 = match self {
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
            Date => 0x0011,
            Time => 0x0012,
            SmallInt => 0x0013,
            TinyInt => 0x0014,
            Duration => 0x0015,
            List(_) => 0x0020,
            Map(_, _) => 0x0021,
            Set(_) => 0x0022,
            UserDefinedType { .. } => 0x0030,
            Tuple(_) => 0x0031,
        };
        types::write_short(id, buf);

        match self {
            List(elem) | Set(elem) => elem.serialize(buf)?,
            Map(key, value) => {
                key.serialize(buf)?;
                value.serialize(buf)?;
            }
            UserDefinedType {
                type_name,
                keyspace,
                field_types,
            } => {
                types::write_string(keyspace, buf)?;
                types::write_string(type_name, buf)?;
                types::write_short_length(field_types.len(), buf)?;
                for (field_name, field_type) in field_types {
                    types::write_string(field_name, buf)?;
                    field_type.serialize(buf)?;
                }
            }
            Tuple(elems) => {
                types::write_short_length(elems.len(), buf)?;
                for elem in elems {
                    elem.serialize(buf)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    /// Metadata for columns that all belong to one table.
    pub fn new_for_table(table_spec: TableSpec, columns: Vec<(String, ColumnType)>) -> Self {
        let col_specs: Vec<ColumnSpec> = columns
            .into_iter()
            .map(|(name, typ)| ColumnSpec {
                table_spec: table_spec.clone(),
                name,
                typ,
            })
            .collect();
        ResultMetadata {
            col_count: col_specs.len(),
            paging_state: None,
            col_specs,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), ParseError> {
        let global_table_spec = self
            .col_specs
            .first()
            .map(|first| &first.table_spec)
            .filter(|spec| self.col_specs.iter().all(|c| &c.table_spec == *spec));

        let mut flags = 0;
        if global_table_spec.is_some() {
            flags |= FLAG_GLOBAL_TABLES_SPEC;
        }
        if self.paging_state.is_some() {
            flags |= FLAG_HAS_MORE_PAGES;
        }
        types::write_int(flags, buf);
        types::write_int_length(self.col_count, buf)?;
        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }
        if let Some(spec) = global_table_spec {
            serialize_table_spec(spec, buf)?;
        }
        for col_spec in &self.col_specs {
            if global_table_spec.is_none() {
                serialize_table_spec(&col_spec.table_spec, buf)?;
            }
            types::write_string(&col_spec.name, buf)?;
            col_spec.typ.serialize(buf)?;
        }
        Ok(())
    }
}

/// Rows as they travel: one cell per column spec, `None` for null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Vec<Option<CqlValue>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    SchemaChange(SchemaChange),
}

impl Result {
    /// Writes the RESULT body. Used by servers and scripted test peers.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), ParseError> {
        match self {
            Result::Void => types::write_int(KIND_VOID, buf),
            Result::Rows(rows) => {
                types::write_int(KIND_ROWS, buf);
                rows.metadata.serialize(buf)?;
                types::write_int_length(rows.rows.len(), buf)?;
                for row in &rows.rows {
                    for cell in row {
                        cell.serialize(buf).map_err(|e| {
                            ParseError::BadDataToSerialize(e.to_string())
                        })?;
                    }
                }
            }
            Result::SetKeyspace(set_keyspace) => {
                types::write_int(KIND_SET_KEYSPACE, buf);
                types::write_string(&set_keyspace.keyspace_name, buf)?;
            }
            Result::SchemaChange(change) => {
                types::write_int(KIND_SCHEMA_CHANGE, buf);
                types::write_string(&change.change_type, buf)?;
                types::write_string(&change.target, buf)?;
                types::write_string(&change.keyspace, buf)?;
                if let Some(name) = &change.name {
                    types::write_string(name, buf)?;
                }
                if matches!(change.target.as_str(), "FUNCTION" | "AGGREGATE") {
                    types::write_string_list(&change.arguments, buf)?;
                }
            }
        }
        Ok(())
    }
}

fn serialize_table_spec(spec: &TableSpec, buf: &mut Vec<u8>) -> StdResult<(), ParseError> {
    types::write_string(&spec.ks_name, buf)?;
    types::write_string(&spec.table_name, buf)?;
    Ok(())
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000A => Text, // varchar, an alias of text
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace_name: String = types::read_string(buf)?.to_string();
            let type_name: String = types::read_string(buf)?.to_string();
            let fields_size: usize = types::read_short(buf)?.into();

            let mut field_types: Vec<(String, ColumnType)> = Vec::with_capacity(fields_size);

            for _ in 0..fields_size {
                let field_name: String = types::read_string(buf)?.to_string();
                let field_type: ColumnType = deser_type(buf)?;

                field_types.push((field_name, field_type));
            }

            UserDefinedType {
                type_name,
                keyspace: keyspace_name,
                field_types,
            }
        }
        0x0031 => {
            let len: usize = types::read_short(buf)?.into();
            let mut types = Vec::with_capacity(len);
            for _ in 0..len {
                types.push(deser_type(buf)?);
            }
            Tuple(types)
        }
        // Custom types (0x0000) carry a server-side class name we cannot interpret.
        id => return Err(CqlTypeError::UnknownTypeId(id).into()),
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ParseError> {
    let mut col_specs = Vec::with_capacity(col_count.min(buf.len()));
    for _ in 0..col_count {
        let table_spec = if let Some(spec) = global_table_spec {
            spec.clone()
        } else {
            deser_table_spec(buf)?
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(buf: &mut &[u8]) -> StdResult<ResultMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count = types::read_int_length(buf)?;

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

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn expect_len(typ: &'static str, buf: &[u8], expected: usize) -> StdResult<(), CqlTypeError> {
    if buf.len() != expected {
        return Err(CqlTypeError::BadLength {
            typ,
            expected,
            got: buf.len(),
        });
    }
    Ok(())
}

fn malformed(typ: &'static str, reason: impl ToString) -> CqlTypeError {
    CqlTypeError::Malformed {
        typ,
        reason: reason.to_string(),
    }
}

fn deser_text(typ: &'static str, buf: &[u8]) -> StdResult<String, CqlTypeError> {
    str::from_utf8(buf)
        .map(ToOwned::to_owned)
        .map_err(|e| malformed(typ, e))
}

/// Decodes the body of a non-null cell of the given type.
///
/// The whole of `buf` must belong to the value; a body that does not fit
/// the declared type is reported as a [`CqlTypeError`].
pub fn deser_cql_value(typ: &ColumnType, buf: &mut &[u8]) -> StdResult<CqlValue, ParseError> {
    use ColumnType::*;
    Ok(match typ {
        Ascii => {
            if !buf.is_ascii() {
                return Err(malformed("ascii", "string is not ascii").into());
            }
            CqlValue::Ascii(deser_text("ascii", buf)?)
        }
        Boolean => {
            expect_len("boolean", buf, 1)?;
            CqlValue::Boolean(buf[0] != 0x00)
        }
        Blob => CqlValue::Blob(buf.to_vec()),
        Date => {
            expect_len("date", buf, 4)?;
            CqlValue::Date(CqlDate(buf.read_u32::<BigEndian>()?))
        }
        Counter => {
            expect_len("counter", buf, 8)?;
            CqlValue::Counter(crate::value::Counter(buf.read_i64::<BigEndian>()?))
        }
        Decimal => {
            if buf.len() < 4 {
                return Err(CqlTypeError::BadLength {
                    typ: "decimal",
                    expected: 4,
                    got: buf.len(),
                }
                .into());
            }
            let scale = types::read_int(buf)?;
            CqlValue::Decimal(CqlDecimal::from_signed_be_bytes_and_exponent(
                buf.to_vec(),
                scale,
            ))
        }
        Double => {
            expect_len("double", buf, 8)?;
            CqlValue::Double(buf.read_f64::<BigEndian>()?)
        }
        Duration => {
            let months = i32::try_from(types::vint_decode(buf)?)
                .map_err(|e| malformed("duration", e))?;
            let days = i32::try_from(types::vint_decode(buf)?)
                .map_err(|e| malformed("duration", e))?;
            let nanoseconds = types::vint_decode(buf)?;
            if !buf.is_empty() {
                return Err(malformed("duration", "trailing bytes").into());
            }
            CqlValue::Duration(CqlDuration {
                months,
                days,
                nanoseconds,
            })
        }
        Float => {
            expect_len("float", buf, 4)?;
            CqlValue::Float(buf.read_f32::<BigEndian>()?)
        }
        Int => {
            expect_len("int", buf, 4)?;
            CqlValue::Int(buf.read_i32::<BigEndian>()?)
        }
        SmallInt => {
            expect_len("smallint", buf, 2)?;
            CqlValue::SmallInt(buf.read_i16::<BigEndian>()?)
        }
        TinyInt => {
            expect_len("tinyint", buf, 1)?;
            CqlValue::TinyInt(buf.read_i8()?)
        }
        BigInt => {
            expect_len("bigint", buf, 8)?;
            CqlValue::BigInt(buf.read_i64::<BigEndian>()?)
        }
        Text => CqlValue::Text(deser_text("text", buf)?),
        Timestamp => {
            expect_len("timestamp", buf, 8)?;
            CqlValue::Timestamp(CqlTimestamp(buf.read_i64::<BigEndian>()?))
        }
        Time => {
            expect_len("time", buf, 8)?;
            let nanoseconds: i64 = buf.read_i64::<BigEndian>()?;

            // Valid values are in the range 0 to 86399999999999
            if !(0..=86_399_999_999_999).contains(&nanoseconds) {
                return Err(malformed(
                    "time",
                    format!("{nanoseconds} is not between 0 and 86399999999999"),
                )
                .into());
            }

            CqlValue::Time(CqlTime(nanoseconds))
        }
        Timeuuid => {
            expect_len("timeuuid", buf, 16)?;
            CqlValue::Timeuuid(types::read_uuid(buf)?)
        }
        Inet => CqlValue::Inet(match buf.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[0..4]);
                *buf = &buf[4..];
                IpAddr::from(octets)
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[0..16]);
                *buf = &buf[16..];
                IpAddr::from(octets)
            }
            v => return Err(malformed("inet", format!("invalid address length {v}")).into()),
        }),
        Uuid => {
            expect_len("uuid", buf, 16)?;
            CqlValue::Uuid(types::read_uuid(buf)?)
        }
        Varint => CqlValue::Varint(CqlVarint::from_signed_bytes_be_slice(buf)),
        List(type_name) => CqlValue::List(deser_collection(type_name, buf)?),
        Map(key_type, value_type) => {
            let len = types::read_int_length(buf)?;
            let mut res = Vec::with_capacity(len.min(buf.len()));
            for _ in 0..len {
                let mut b = types::read_bytes(buf)?;
                let key = deser_cql_value(key_type, &mut b)?;
                b = types::read_bytes(buf)?;
                let val = deser_cql_value(value_type, &mut b)?;
                res.push((key, val));
            }
            CqlValue::Map(res)
        }
        Set(type_name) => CqlValue::Set(deser_collection(type_name, buf)?),
        UserDefinedType {
            type_name,
            keyspace,
            field_types,
        } => {
            let mut fields = Vec::with_capacity(field_types.len());

            for (field_name, field_type) in field_types {
                // A serialized UDT may end early when trailing fields are null.
                if buf.is_empty() {
                    fields.push((field_name.clone(), None));
                    continue;
                }
                let field_value = types::read_bytes_opt(buf)?
                    .map(|mut b| deser_cql_value(field_type, &mut b))
                    .transpose()?;
                fields.push((field_name.clone(), field_value));
            }

            CqlValue::UserDefinedType {
                keyspace: keyspace.clone(),
                name: type_name.clone(),
                fields,
            }
        }
        Tuple(type_names) => {
            let mut res = Vec::with_capacity(type_names.len());
            for type_name in type_names {
                let value = types::read_bytes_opt(buf)?
                    .map(|mut b| deser_cql_value(type_name, &mut b))
                    .transpose()?;
                res.push(value);
            }
            CqlValue::Tuple(res)
        }
    })
}

fn deser_collection(typ: &ColumnType, buf: &mut &[u8]) -> StdResult<Vec<CqlValue>, ParseError> {
    let len = types::read_int_length(buf)?;
    let mut res = Vec::with_capacity(len.min(buf.len()));
    for _ in 0..len {
        let mut b = types::read_bytes(buf)?;
        res.push(deser_cql_value(typ, &mut b)?);
    }
    Ok(res)
}

fn deser_rows(buf: &mut &[u8]) -> StdResult<Rows, ParseError> {
    let metadata = deser_result_metadata(buf)?;

    // Rows are never requested with SKIP_METADATA, so the specs must be there.
    if metadata.col_count != metadata.col_specs.len() {
        return Err(ParseError::BadIncomingData(format!(
            "Rows metadata announces {} columns but describes {}",
            metadata.col_count,
            metadata.col_specs.len()
        )));
    }

    let rows_count = types::read_int_length(buf)?;

    let mut rows = Vec::with_capacity(rows_count.min(buf.len()));
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for col_spec in &metadata.col_specs {
            let v = if let Some(mut b) = types::read_bytes_opt(buf)? {
                Some(deser_cql_value(&col_spec.typ, &mut b)?)
            } else {
                None
            };
            columns.push(v);
        }
        rows.push(columns);
    }
    Ok(Rows {
        metadata,
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_schema_change(buf: &mut &[u8]) -> StdResult<SchemaChange, ParseError> {
    let change_type = types::read_string(buf)?.to_string();
    let target = types::read_string(buf)?.to_string();
    let keyspace = types::read_string(buf)?.to_string();

    let (name, arguments) = match target.as_str() {
        "KEYSPACE" => (None, Vec::new()),
        "TABLE" | "TYPE" => (Some(types::read_string(buf)?.to_string()), Vec::new()),
        "FUNCTION" | "AGGREGATE" => (
            Some(types::read_string(buf)?.to_string()),
            types::read_string_list(buf)?,
        ),
        other => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown schema change target: {other}"
            )))
        }
    };

    Ok(SchemaChange {
        change_type,
        target,
        keyspace,
        name,
        arguments,
    })
}

pub fn deserialize(buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        KIND_VOID => Void,
        KIND_ROWS => Rows(deser_rows(buf)?),
        KIND_SET_KEYSPACE => SetKeyspace(deser_set_keyspace(buf)?),
        KIND_SCHEMA_CHANGE => SchemaChange(deser_schema_change(buf)?),
        KIND_PREPARED => {
            return Err(ParseError::BadIncomingData(
                "Received a PREPARED result, but no statement was prepared".to_owned(),
            ))
        }
        k => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown query result id: {}",
                k
            )))
        }
    })
}
