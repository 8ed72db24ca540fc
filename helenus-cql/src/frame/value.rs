//! Serialization of bound values.
//!
//! Values are always sent as typed `[value]`s next to the statement text,
//! never spliced into it, so their content (quotes included) cannot change
//! the meaning of the statement.

use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use crate::value::{
    Counter, CqlDate, CqlDecimal, CqlDuration, CqlTime, CqlTimestamp, CqlValue, CqlVarint,
};
use bytes::BufMut;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// Every value being sent in a query must implement this trait.
/// `serialize` writes the value as `[value]`, length prefix included.
pub trait Value {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig>;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[error("Value too big to be sent in a request - max 2GiB allowed")]
pub struct ValueTooBig;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SerializeValuesError {
    #[error("Too many values to add, max 32 767 values can be sent in a request")]
    TooManyValues,
    #[error(transparent)]
    ValueTooBig(#[from] ValueTooBig),
}

/// Represents an unset value: the column keeps whatever it held.
pub struct Unset;

/// A value that might be left unset.
pub enum MaybeUnset<V: Value> {
    Unset,
    Set(V),
}

/// Keeps a buffer with serialized values, in bind marker order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    values_num: u16,
}

pub type SerializedResult<'a> = Result<Cow<'a, SerializedValues>, SerializeValuesError>;

impl SerializedValues {
    pub const fn new() -> Self {
        SerializedValues {
            serialized_values: Vec::new(),
            values_num: 0,
        }
    }

    /// A const empty instance, useful for taking references
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    /// Serializes value and appends it to the list
    pub fn add_value(&mut self, val: &impl Value) -> Result<(), SerializeValuesError> {
        if self.values_num == i16::MAX as u16 {
            return Err(SerializeValuesError::TooManyValues);
        }

        let len_before_serialize = self.serialized_values.len();

        if let Err(e) = val.serialize(&mut self.serialized_values) {
            self.serialized_values.truncate(len_before_serialize);
            return Err(SerializeValuesError::from(e));
        }

        self.values_num += 1;
        Ok(())
    }

    /// Iterates over the raw value bodies; `None` stands for null or unset.
    pub fn iter(&self) -> impl Iterator<Item = Option<&[u8]>> {
        let mut buf = &self.serialized_values[..];
        std::iter::from_fn(move || {
            if buf.is_empty() {
                return None;
            }
            types::read_bytes_opt(&mut buf).ok()
        })
    }

    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.values_num);
        buf.put(&self.serialized_values[..]);
    }

    pub fn is_empty(&self) -> bool {
        self.values_num == 0
    }

    pub fn len(&self) -> u16 {
        self.values_num
    }

    /// Reads `<n><value_1>...<value_n>` as written by [`Self::write_to_request`].
    pub fn new_from_frame(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let values_num = types::read_short(buf)?;
        let values_beg = *buf;
        for _ in 0..values_num {
            let len = types::read_int(buf)?;
            if len >= 0 {
                types::read_raw_bytes(len as usize, buf)?;
            }
        }
        let values_len_in_buf = values_beg.len() - buf.len();
        Ok(SerializedValues {
            serialized_values: values_beg[..values_len_in_buf].to_vec(),
            values_num,
        })
    }
}

/// A list of values bound to the `?` markers of a statement, in order.
pub trait ValueList {
    /// Provides a view of ValueList as SerializedValues
    fn serialized(&self) -> SerializedResult<'_>;
}

//
//  Value impls
//

fn write_len(len: usize, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
    let len: i32 = len.try_into().map_err(|_| ValueTooBig)?;
    buf.put_i32(len);
    Ok(())
}

// Writes a placeholder length, runs `f`, then patches the length in.
fn with_len_prefix(
    buf: &mut Vec<u8>,
    f: impl FnOnce(&mut Vec<u8>) -> Result<(), ValueTooBig>,
) -> Result<(), ValueTooBig> {
    let bytes_num_pos = buf.len();
    buf.put_i32(0);
    f(buf)?;
    let written_bytes = buf.len() - bytes_num_pos - 4;
    let written_bytes: i32 = written_bytes.try_into().map_err(|_| ValueTooBig)?;
    buf[bytes_num_pos..(bytes_num_pos + 4)].copy_from_slice(&written_bytes.to_be_bytes());
    Ok(())
}

macro_rules! impl_value_for_fixed_size {
    ($t:ty, $put:ident, $size:expr) => {
        impl Value for $t {
            fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
                buf.put_i32($size);
                buf.$put(*self);
                Ok(())
            }
        }
    };
}

impl_value_for_fixed_size!(i8, put_i8, 1);
impl_value_for_fixed_size!(i16, put_i16, 2);
impl_value_for_fixed_size!(i32, put_i32, 4);
impl_value_for_fixed_size!(i64, put_i64, 8);
impl_value_for_fixed_size!(f32, put_f32, 4);
impl_value_for_fixed_size!(f64, put_f64, 8);

impl Value for bool {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(1);
        buf.put_u8(u8::from(*self));
        Ok(())
    }
}

impl Value for Counter {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        self.0.serialize(buf)
    }
}

impl Value for CqlTimestamp {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        self.0.serialize(buf)
    }
}

impl Value for chrono_04::DateTime<chrono_04::Utc> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        CqlTimestamp::from(*self).serialize(buf)
    }
}

impl Value for CqlDate {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(4);
        buf.put_u32(self.0);
        Ok(())
    }
}

impl Value for chrono_04::NaiveDate {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        CqlDate::from(*self).serialize(buf)
    }
}

impl Value for CqlTime {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        self.0.serialize(buf)
    }
}

impl Value for CqlDuration {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        let mut body = Vec::with_capacity(27);
        types::vint_encode(self.months as i64, &mut body);
        types::vint_encode(self.days as i64, &mut body);
        types::vint_encode(self.nanoseconds, &mut body);
        write_len(body.len(), buf)?;
        buf.extend_from_slice(&body);
        Ok(())
    }
}

impl Value for CqlVarint {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        let digits = self.as_signed_bytes_be_slice();
        write_len(digits.len(), buf)?;
        buf.put_slice(digits);
        Ok(())
    }
}

impl Value for CqlDecimal {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        let (digits, scale) = self.as_signed_be_bytes_slice_and_exponent();
        write_len(digits.len() + 4, buf)?;
        buf.put_i32(scale);
        buf.put_slice(digits);
        Ok(())
    }
}

impl Value for Uuid {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(16);
        buf.put_slice(self.as_bytes());
        Ok(())
    }
}

impl Value for IpAddr {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        match self {
            IpAddr::V4(addr) => {
                buf.put_i32(4);
                buf.put_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                buf.put_i32(16);
                buf.put_slice(&addr.octets());
            }
        }
        Ok(())
    }
}

impl Value for &str {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        write_len(self.len(), buf)?;
        buf.put_slice(self.as_bytes());
        Ok(())
    }
}

impl Value for String {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        self.as_str().serialize(buf)
    }
}

impl Value for Vec<u8> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        write_len(self.len(), buf)?;
        buf.put_slice(self);
        Ok(())
    }
}

impl Value for &[u8] {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        write_len(self.len(), buf)?;
        buf.put_slice(self);
        Ok(())
    }
}

/// `None` is sent as null.
impl<T: Value> Value for Option<T> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        match self {
            Some(val) => val.serialize(buf),
            None => {
                buf.put_i32(-1);
                Ok(())
            }
        }
    }
}

impl Value for Unset {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(-2);
        Ok(())
    }
}

impl<V: Value> Value for MaybeUnset<V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        match self {
            MaybeUnset::Set(v) => v.serialize(buf),
            MaybeUnset::Unset => Unset.serialize(buf),
        }
    }
}

impl<T: Value> Value for &T {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        <T as Value>::serialize(*self, buf)
    }
}

fn serialize_collection<'a, T: Value + 'a>(
    len: usize,
    items: impl Iterator<Item = &'a T>,
    buf: &mut Vec<u8>,
) -> Result<(), ValueTooBig> {
    with_len_prefix(buf, |buf| {
        write_len(len, buf)?;
        for item in items {
            item.serialize(buf)?;
        }
        Ok(())
    })
}

impl<T: Value> Value for Vec<T> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        serialize_collection(self.len(), self.iter(), buf)
    }
}

impl<K: Value, V: Value> Value for HashMap<K, V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        with_len_prefix(buf, |buf| {
            write_len(self.len(), buf)?;
            for (key, value) in self {
                key.serialize(buf)?;
                value.serialize(buf)?;
            }
            Ok(())
        })
    }
}

impl<K: Value, V: Value> Value for BTreeMap<K, V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        with_len_prefix(buf, |buf| {
            write_len(self.len(), buf)?;
            for (key, value) in self {
                key.serialize(buf)?;
                value.serialize(buf)?;
            }
            Ok(())
        })
    }
}

impl Value for CqlValue {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        match self {
            CqlValue::Ascii(s) | CqlValue::Text(s) => s.serialize(buf),
            CqlValue::Boolean(b) => b.serialize(buf),
            CqlValue::Blob(b) => b.serialize(buf),
            CqlValue::Counter(c) => c.serialize(buf),
            CqlValue::Decimal(d) => d.serialize(buf),
            CqlValue::Date(d) => d.serialize(buf),
            CqlValue::Double(d) => d.serialize(buf),
            CqlValue::Duration(d) => d.serialize(buf),
            CqlValue::Float(f) => f.serialize(buf),
            CqlValue::Int(i) => i.serialize(buf),
            CqlValue::BigInt(i) => i.serialize(buf),
            CqlValue::Timestamp(t) => t.serialize(buf),
            CqlValue::Inet(a) => a.serialize(buf),
            CqlValue::List(l) | CqlValue::Set(l) => l.serialize(buf),
            CqlValue::Map(m) => with_len_prefix(buf, |buf| {
                write_len(m.len(), buf)?;
                for (key, value) in m {
                    key.serialize(buf)?;
                    value.serialize(buf)?;
                }
                Ok(())
            }),
            CqlValue::UserDefinedType { fields, .. } => with_len_prefix(buf, |buf| {
                for (_, value) in fields {
                    value.serialize(buf)?;
                }
                Ok(())
            }),
            CqlValue::Tuple(items) => with_len_prefix(buf, |buf| {
                for item in items {
                    item.serialize(buf)?;
                }
                Ok(())
            }),
            CqlValue::SmallInt(i) => i.serialize(buf),
            CqlValue::TinyInt(i) => i.serialize(buf),
            CqlValue::Time(t) => t.serialize(buf),
            CqlValue::Timeuuid(u) | CqlValue::Uuid(u) => u.serialize(buf),
            CqlValue::Varint(v) => v.serialize(buf),
        }
    }
}

//
//  ValueList impls
//

impl ValueList for () {
    fn serialized(&self) -> SerializedResult<'_> {
        Ok(Cow::Owned(SerializedValues::new()))
    }
}

impl<T: Value> ValueList for [T] {
    fn serialized(&self) -> SerializedResult<'_> {
        let mut result = SerializedValues::new();
        for val in self {
            result.add_value(val)?;
        }
        Ok(Cow::Owned(result))
    }
}

impl<T: Value, const N: usize> ValueList for [T; N] {
    fn serialized(&self) -> SerializedResult<'_> {
        self.as_slice().serialized()
    }
}

impl<T: Value> ValueList for Vec<T> {
    fn serialized(&self) -> SerializedResult<'_> {
        self.as_slice().serialized()
    }
}

impl ValueList for SerializedValues {
    fn serialized(&self) -> SerializedResult<'_> {
        Ok(Cow::Borrowed(self))
    }
}

impl<L: ValueList + ?Sized> ValueList for &L {
    fn serialized(&self) -> SerializedResult<'_> {
        <L as ValueList>::serialized(*self)
    }
}

macro_rules! impl_value_list_for_tuple {
    ( $($Ti:ident),* ; $($FieldI:tt),* ) => {
        impl<$($Ti),+> ValueList for ($($Ti,)+)
        where
            $($Ti: Value),+
        {
            fn serialized(&self) -> SerializedResult<'_> {
                let mut result = SerializedValues::new();
                $(
                    result.add_value(&self.$FieldI)?;
                )*
                Ok(Cow::Owned(result))
            }
        }
    }
}

impl_value_list_for_tuple!(T0; 0);
impl_value_list_for_tuple!(T0, T1; 0, 1);
impl_value_list_for_tuple!(T0, T1, T2; 0, 1, 2);
impl_value_list_for_tuple!(T0, T1, T2, T3; 0, 1, 2, 3);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4; 0, 1, 2, 3, 4);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5; 0, 1, 2, 3, 4, 5);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6; 0, 1, 2, 3, 4, 5, 6);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7; 0, 1, 2, 3, 4, 5, 6, 7);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8; 0, 1, 2, 3, 4, 5, 6, 7, 8);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9;
                           0, 1, 2, 3, 4, 5, 6, 7, 8, 9);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10;
                           0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11;
                           0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12;
                           0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13;
                           0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14;
                           0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15;
                           0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15);
