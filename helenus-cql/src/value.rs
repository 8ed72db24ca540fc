//! Native representations of CQL values.

use std::net::IpAddr;

use thiserror::Error;
use uuid::Uuid;

/// A value could not be converted because it is out of range of the target type.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Conversion between CQL type and another type failed: value out of range")]
pub struct ValueOverflow;

/// Value of a `counter` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Counter(pub i64);

/// Native CQL `varint`: an arbitrary precision integer, kept as the
/// two's complement big-endian bytes it travels as.
///
/// Conversions to and from `num_bigint::BigInt` are enabled with the
/// `num-bigint-04` feature.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CqlVarint(Vec<u8>);

impl CqlVarint {
    pub fn from_signed_bytes_be(digits: Vec<u8>) -> Self {
        Self(digits)
    }

    pub fn from_signed_bytes_be_slice(digits: &[u8]) -> Self {
        Self(digits.to_vec())
    }

    pub fn as_signed_bytes_be_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_signed_bytes_be(self) -> Vec<u8> {
        self.0
    }
}

impl From<i64> for CqlVarint {
    fn from(value: i64) -> Self {
        let bytes = value.to_be_bytes();
        // Drop redundant sign bytes, keeping the sign bit intact.
        let mut start = 0;
        while start < bytes.len() - 1 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        Self(bytes[start..].to_vec())
    }
}

#[cfg(feature = "num-bigint-04")]
impl From<num_bigint_04::BigInt> for CqlVarint {
    fn from(value: num_bigint_04::BigInt) -> Self {
        Self(value.to_signed_bytes_be())
    }
}

#[cfg(feature = "num-bigint-04")]
impl From<CqlVarint> for num_bigint_04::BigInt {
    fn from(val: CqlVarint) -> Self {
        num_bigint_04::BigInt::from_signed_bytes_be(&val.0)
    }
}

/// Native CQL `decimal`: an unscaled [`CqlVarint`] and a 32-bit scale.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CqlDecimal {
    int_val: CqlVarint,
    scale: i32,
}

impl CqlDecimal {
    pub fn from_signed_be_bytes_and_exponent(bytes: Vec<u8>, scale: i32) -> Self {
        Self {
            int_val: CqlVarint::from_signed_bytes_be(bytes),
            scale,
        }
    }

    pub fn as_signed_be_bytes_slice_and_exponent(&self) -> (&[u8], i32) {
        (self.int_val.as_signed_bytes_be_slice(), self.scale)
    }
}

#[cfg(feature = "bigdecimal-04")]
impl From<CqlDecimal> for bigdecimal_04::BigDecimal {
    fn from(value: CqlDecimal) -> Self {
        Self::from((
            num_bigint_04::BigInt::from_signed_bytes_be(value.int_val.as_signed_bytes_be_slice()),
            value.scale as i64,
        ))
    }
}

#[cfg(feature = "bigdecimal-04")]
impl TryFrom<bigdecimal_04::BigDecimal> for CqlDecimal {
    type Error = ValueOverflow;

    fn try_from(value: bigdecimal_04::BigDecimal) -> Result<Self, Self::Error> {
        let (bigint, scale) = value.into_bigint_and_exponent();
        let scale: i32 = scale.try_into().map_err(|_| ValueOverflow)?;
        Ok(Self::from_signed_be_bytes_and_exponent(
            bigint.to_signed_bytes_be(),
            scale,
        ))
    }
}

/// Native CQL `date`: days since -5877641-06-23, i.e. 2^31 days before the unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CqlDate(pub u32);

/// Native CQL `timestamp`: signed milliseconds since the unix epoch.
///
/// Two timestamps are equal exactly when they denote the same millisecond.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CqlTimestamp(pub i64);

/// Native CQL `time`: nanoseconds since midnight.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CqlTime(pub i64);

/// Native CQL `duration`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CqlDuration {
    pub months: i32,
    pub days: i32,
    pub nanoseconds: i64,
}

impl From<chrono_04::NaiveDate> for CqlDate {
    fn from(value: chrono_04::NaiveDate) -> Self {
        let days = (1i64 << 31) + value.signed_duration_since(unix_epoch_date()).num_days();
        Self(days as u32)
    }
}

impl TryFrom<CqlDate> for chrono_04::NaiveDate {
    type Error = ValueOverflow;

    fn try_from(value: CqlDate) -> Result<Self, Self::Error> {
        let days_since_unix_epoch = value.0 as i64 - (1 << 31);
        let since_epoch = chrono_04::Duration::try_days(days_since_unix_epoch).ok_or(ValueOverflow)?;
        unix_epoch_date()
            .checked_add_signed(since_epoch)
            .ok_or(ValueOverflow)
    }
}

fn unix_epoch_date() -> chrono_04::NaiveDate {
    chrono_04::NaiveDate::default()
}

impl From<chrono_04::DateTime<chrono_04::Utc>> for CqlTimestamp {
    fn from(value: chrono_04::DateTime<chrono_04::Utc>) -> Self {
        Self(value.timestamp_millis())
    }
}

impl TryFrom<CqlTimestamp> for chrono_04::DateTime<chrono_04::Utc> {
    type Error = ValueOverflow;

    fn try_from(value: CqlTimestamp) -> Result<Self, Self::Error> {
        use chrono_04::TimeZone;
        match chrono_04::Utc.timestamp_millis_opt(value.0) {
            chrono_04::LocalResult::Single(datetime) => Ok(datetime),
            _ => Err(ValueOverflow),
        }
    }
}

impl TryFrom<CqlTime> for chrono_04::NaiveTime {
    type Error = ValueOverflow;

    fn try_from(value: CqlTime) -> Result<Self, Self::Error> {
        let secs = (value.0 / 1_000_000_000)
            .try_into()
            .map_err(|_| ValueOverflow)?;
        let nanos = (value.0 % 1_000_000_000)
            .try_into()
            .map_err(|_| ValueOverflow)?;
        chrono_04::NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).ok_or(ValueOverflow)
    }
}

/// A decoded, non-null CQL value.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(Counter),
    Decimal(CqlDecimal),
    Date(CqlDate),
    Double(f64),
    Duration(CqlDuration),
    Float(f32),
    Int(i32),
    BigInt(i64),
    Text(String),
    Timestamp(CqlTimestamp),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    UserDefinedType {
        keyspace: String,
        name: String,
        /// In the order the fields are declared in the type.
        fields: Vec<(String, Option<CqlValue>)>,
    },
    SmallInt(i16),
    TinyInt(i8),
    Time(CqlTime),
    Timeuuid(Uuid),
    Tuple(Vec<Option<CqlValue>>),
    Uuid(Uuid),
    Varint(CqlVarint),
}

impl CqlValue {
    /// Text of an `ascii` or `text` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&String> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ascii(&self) -> Option<&String> {
        match self {
            Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_tinyint(&self) -> Option<i8> {
        match self {
            Self::TinyInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_smallint(&self) -> Option<i16> {
        match self {
            Self::SmallInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    /// Any integer-like value widened to `i64`, counters included.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::TinyInt(i) => Some(*i as i64),
            Self::SmallInt(i) => Some(*i as i64),
            Self::Int(i) => Some(*i as i64),
            Self::BigInt(i) => Some(*i),
            Self::Counter(c) => Some(c.0),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<Counter> {
        match self {
            Self::Counter(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Vec<u8>> {
        match self {
            Self::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_timeuuid(&self) -> Option<Uuid> {
        match self {
            Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_cql_timestamp(&self) -> Option<CqlTimestamp> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<chrono_04::DateTime<chrono_04::Utc>> {
        self.as_cql_timestamp().and_then(|ts| ts.try_into().ok())
    }

    pub fn as_cql_date(&self) -> Option<CqlDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_naive_date(&self) -> Option<chrono_04::NaiveDate> {
        self.as_cql_date().and_then(|d| d.try_into().ok())
    }

    pub fn as_cql_time(&self) -> Option<CqlTime> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_cql_duration(&self) -> Option<CqlDuration> {
        match self {
            Self::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<CqlValue>> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&Vec<CqlValue>> {
        match self {
            Self::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Vec<(CqlValue, CqlValue)>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_blob(self) -> Option<Vec<u8>> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_vec(self) -> Option<Vec<CqlValue>> {
        match self {
            Self::List(v) | Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_pair_vec(self) -> Option<Vec<(CqlValue, CqlValue)>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_varint(self) -> Option<CqlVarint> {
        match self {
            Self::Varint(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_decimal(self) -> Option<CqlDecimal> {
        match self {
            Self::Decimal(d) => Some(d),
            _ => None,
        }
    }
}

impl From<&str> for CqlValue {
    fn from(value: &str) -> Self {
        CqlValue::Text(value.to_owned())
    }
}

impl From<String> for CqlValue {
    fn from(value: String) -> Self {
        CqlValue::Text(value)
    }
}

impl From<i32> for CqlValue {
    fn from(value: i32) -> Self {
        CqlValue::Int(value)
    }
}

impl From<i64> for CqlValue {
    fn from(value: i64) -> Self {
        CqlValue::BigInt(value)
    }
}

impl From<bool> for CqlValue {
    fn from(value: bool) -> Self {
        CqlValue::Boolean(value)
    }
}

impl From<CqlTimestamp> for CqlValue {
    fn from(value: CqlTimestamp) -> Self {
        CqlValue::Timestamp(value)
    }
}

impl From<Uuid> for CqlValue {
    fn from(value: Uuid) -> Self {
        CqlValue::Uuid(value)
    }
}
