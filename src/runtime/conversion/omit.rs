//! Omit-on-empty support for struct fields.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Profile {
//!     #[serde(default, skip_serializing_if = "jsbridge::omit::is_empty")]
//!     nickname: String,
//! }
//! ```
//!
//! A value is empty when its dynamic form would be one of: `undefined`,
//! `null`, the empty string, a zero number or bigint, a date at the Unix
//! epoch second, or a zero-length array. Booleans and objects are never empty.

use super::magic;
use crate::runtime::js_value::ValueKind;
use serde::ser::{self, Serialize};
use serde::{Deserialize, Deserializer};
use std::fmt;

/// `skip_serializing_if` predicate: whether `value` converts to an empty dynamic value.
pub fn is_empty<T: Serialize + ?Sized>(value: &T) -> bool {
    value.serialize(EmptinessCheck).unwrap_or(false)
}

/// `deserialize_with` helper: absent, null, undefined and empty values all
/// become `T::default()`.
pub fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug)]
struct NotScalar;

impl fmt::Display for NotScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("value has no emptiness")
    }
}

impl std::error::Error for NotScalar {}

impl ser::Error for NotScalar {
    fn custom<T: fmt::Display>(_msg: T) -> Self {
        NotScalar
    }
}

/// Whole Unix seconds, floored, are zero.
fn millis_empty(millis: f64) -> bool {
    millis.div_euclid(1000.0) == 0.0
}

fn handle_empty() -> bool {
    magic::peek_value(|value| {
        let Some(value) = value else {
            return false;
        };
        let env = value.env();
        let raw = value.raw();
        match value.kind() {
            Ok(ValueKind::Undefined) | Ok(ValueKind::Null) => true,
            Ok(ValueKind::String) => env
                .get_value_string_utf8(raw)
                .map(|s| s.is_empty())
                .unwrap_or(false),
            Ok(ValueKind::Number) => env.get_value_double(raw).map(|n| n == 0.0).unwrap_or(false),
            Ok(ValueKind::BigInt) => env
                .get_value_bigint_i128(raw)
                .map(|n| n == 0)
                .unwrap_or(false),
            Ok(ValueKind::Date) => env.get_date_value(raw).map(millis_empty).unwrap_or(false),
            Ok(ValueKind::Array) => env.get_array_length(raw).map(|n| n == 0).unwrap_or(false),
            _ => false,
        }
    })
}

struct EmptinessCheck;

/// Collects a date's milliseconds from inside its newtype wrapper.
struct MillisCheck;

impl ser::Serializer for MillisCheck {
    type Ok = bool;
    type Error = NotScalar;
    type SerializeSeq = ser::Impossible<bool, NotScalar>;
    type SerializeTuple = ser::Impossible<bool, NotScalar>;
    type SerializeTupleStruct = ser::Impossible<bool, NotScalar>;
    type SerializeTupleVariant = ser::Impossible<bool, NotScalar>;
    type SerializeMap = ser::Impossible<bool, NotScalar>;
    type SerializeStruct = ser::Impossible<bool, NotScalar>;
    type SerializeStructVariant = ser::Impossible<bool, NotScalar>;

    fn serialize_f64(self, v: f64) -> Result<bool, NotScalar> {
        Ok(millis_empty(v))
    }

    fn serialize_bool(self, _v: bool) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_i8(self, _v: i8) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_i16(self, _v: i16) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_i32(self, _v: i32) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_i64(self, _v: i64) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_u8(self, _v: u8) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_u16(self, _v: u16) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_u32(self, _v: u32) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_u64(self, _v: u64) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_f32(self, v: f32) -> Result<bool, NotScalar> {
        Ok(millis_empty(v as f64))
    }
    fn serialize_char(self, _v: char) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_str(self, _v: &str) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_bytes(self, _v: &[u8]) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_none(self) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_some<T: ?Sized + Serialize>(self, _value: &T) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_unit(self) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_unit_struct(self, _name: &'static str) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _value: &T,
    ) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<bool, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, NotScalar> {
        Err(NotScalar)
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, NotScalar> {
        Err(NotScalar)
    }
}

/// Counts elements of sequences; every other compound is non-empty.
struct Compound {
    count: usize,
    sequence: bool,
}

impl Compound {
    fn sequence() -> Self {
        Self {
            count: 0,
            sequence: true,
        }
    }

    fn other() -> Self {
        Self {
            count: 0,
            sequence: false,
        }
    }

    fn add(&mut self) -> Result<(), NotScalar> {
        self.count += 1;
        Ok(())
    }

    fn empty(&self) -> Result<bool, NotScalar> {
        Ok(self.sequence && self.count == 0)
    }
}

impl ser::SerializeSeq for Compound {
    type Ok = bool;
    type Error = NotScalar;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), NotScalar> {
        self.add()
    }
    fn end(self) -> Result<bool, NotScalar> {
        self.empty()
    }
}

impl ser::SerializeTuple for Compound {
    type Ok = bool;
    type Error = NotScalar;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), NotScalar> {
        self.add()
    }
    fn end(self) -> Result<bool, NotScalar> {
        self.empty()
    }
}

impl ser::SerializeTupleStruct for Compound {
    type Ok = bool;
    type Error = NotScalar;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), NotScalar> {
        self.add()
    }
    fn end(self) -> Result<bool, NotScalar> {
        self.empty()
    }
}

impl ser::SerializeTupleVariant for Compound {
    type Ok = bool;
    type Error = NotScalar;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), NotScalar> {
        self.add()
    }
    fn end(self) -> Result<bool, NotScalar> {
        self.empty()
    }
}

impl ser::SerializeMap for Compound {
    type Ok = bool;
    type Error = NotScalar;
    fn serialize_key<T: ?Sized + Serialize>(&mut self, _key: &T) -> Result<(), NotScalar> {
        Ok(())
    }
    fn serialize_value<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), NotScalar> {
        self.add()
    }
    fn end(self) -> Result<bool, NotScalar> {
        self.empty()
    }
}

impl ser::SerializeStruct for Compound {
    type Ok = bool;
    type Error = NotScalar;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        _value: &T,
    ) -> Result<(), NotScalar> {
        self.add()
    }
    fn end(self) -> Result<bool, NotScalar> {
        self.empty()
    }
}

impl ser::SerializeStructVariant for Compound {
    type Ok = bool;
    type Error = NotScalar;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        _value: &T,
    ) -> Result<(), NotScalar> {
        self.add()
    }
    fn end(self) -> Result<bool, NotScalar> {
        self.empty()
    }
}

impl ser::Serializer for EmptinessCheck {
    type Ok = bool;
    type Error = NotScalar;
    type SerializeSeq = Compound;
    type SerializeTuple = Compound;
    type SerializeTupleStruct = Compound;
    type SerializeTupleVariant = Compound;
    type SerializeMap = Compound;
    type SerializeStruct = Compound;
    type SerializeStructVariant = Compound;

    fn serialize_bool(self, _v: bool) -> Result<bool, NotScalar> {
        Ok(false)
    }
    fn serialize_i8(self, v: i8) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_i16(self, v: i16) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_i32(self, v: i32) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_i64(self, v: i64) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_i128(self, v: i128) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_u8(self, v: u8) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_u16(self, v: u16) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_u32(self, v: u32) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_u64(self, v: u64) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_u128(self, v: u128) -> Result<bool, NotScalar> {
        Ok(v == 0)
    }
    fn serialize_f32(self, v: f32) -> Result<bool, NotScalar> {
        Ok(v == 0.0)
    }
    fn serialize_f64(self, v: f64) -> Result<bool, NotScalar> {
        Ok(v == 0.0)
    }
    fn serialize_char(self, _v: char) -> Result<bool, NotScalar> {
        Ok(false)
    }
    fn serialize_str(self, v: &str) -> Result<bool, NotScalar> {
        Ok(v.is_empty())
    }
    fn serialize_bytes(self, v: &[u8]) -> Result<bool, NotScalar> {
        Ok(v.is_empty())
    }
    fn serialize_none(self) -> Result<bool, NotScalar> {
        Ok(true)
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<bool, NotScalar> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<bool, NotScalar> {
        Ok(true)
    }
    fn serialize_unit_struct(self, _name: &'static str) -> Result<bool, NotScalar> {
        Ok(true)
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<bool, NotScalar> {
        Ok(variant.is_empty())
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<bool, NotScalar> {
        match name {
            magic::DATE_TOKEN => value.serialize(MillisCheck),
            magic::VALUE_TOKEN => Ok(handle_empty()),
            magic::FUNCTION_TOKEN => Ok(false),
            _ => value.serialize(self),
        }
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<bool, NotScalar> {
        Ok(false)
    }
    fn serialize_seq(self, _len: Option<usize>) -> Result<Compound, NotScalar> {
        Ok(Compound::sequence())
    }
    fn serialize_tuple(self, _len: usize) -> Result<Compound, NotScalar> {
        Ok(Compound::sequence())
    }
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Compound, NotScalar> {
        Ok(Compound::sequence())
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Compound, NotScalar> {
        Ok(Compound::other())
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<Compound, NotScalar> {
        Ok(Compound::other())
    }
    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Compound, NotScalar> {
        Ok(Compound::other())
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Compound, NotScalar> {
        Ok(Compound::other())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::conversion::Date;
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_scalars() {
        assert!(is_empty(""));
        assert!(!is_empty("x"));
        assert!(is_empty(&0i32));
        assert!(is_empty(&0u64));
        assert!(!is_empty(&0.5f64));
        assert!(!is_empty(&false));
        assert!(is_empty(&None::<String>));
        assert!(is_empty(&Some(String::new())));
    }

    #[test]
    fn test_sequences_and_maps() {
        assert!(is_empty(&Vec::<u8>::new()));
        assert!(!is_empty(&vec![1]));
        assert!(!is_empty(&HashMap::<String, i32>::new()));
    }

    #[test]
    fn test_dates() {
        assert!(is_empty(&Date::default()));
        assert!(is_empty(&Date(SystemTime::UNIX_EPOCH + Duration::from_millis(999))));
        assert!(!is_empty(&Date(SystemTime::UNIX_EPOCH + Duration::from_secs(1))));
        assert!(!is_empty(&Date::from_millis(-1.0)));
        assert!(!is_empty(&Date::from_millis(-999.0)));
    }

    #[test]
    fn test_seconds_are_floored() {
        assert!(millis_empty(0.0));
        assert!(millis_empty(999.9));
        assert!(!millis_empty(-0.5));
        assert!(!millis_empty(1000.0));
    }

    #[test]
    fn test_or_default_fills_null_and_absent() {
        use crate::runtime::conversion::from_js;
        use crate::runtime::sys::test_env;
        use crate::runtime::values::JsObject;

        #[derive(Deserialize, Debug, PartialEq)]
        struct Settings {
            #[serde(default, deserialize_with = "or_default")]
            name: String,
            #[serde(default, deserialize_with = "or_default")]
            retries: u32,
            #[serde(default, deserialize_with = "or_default")]
            tags: Vec<String>,
        }

        let (env, _) = test_env();
        let object = JsObject::new(&env);
        object.set_value("name", &()).unwrap();
        object.set_value("retries", &3u32).unwrap();
        let settings: Settings = from_js(&object).unwrap();
        assert_eq!(
            settings,
            Settings {
                name: String::new(),
                retries: 3,
                tags: Vec::new(),
            }
        );
    }
}
