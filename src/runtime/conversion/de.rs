//! `serde::Deserializer` reading engine values.
//!
//! The value's tag drives extraction: a target whose shape does not fit the
//! tag fails with a [`ConversionError`] naming both.

use super::magic;
use crate::runtime::error::{BridgeError, ConversionError};
use crate::runtime::js_value::{JsValue, ValueKind};
use crate::runtime::sys::{Env, RawValue};
use serde::de::{self, DeserializeSeed, IntoDeserializer, Visitor};
use serde::forward_to_deserialize_any;

/// Deserializes a host value out of one [`JsValue`].
pub struct Deserializer {
    value: JsValue,
    kind: ValueKind,
    depth: usize,
}

impl Deserializer {
    pub fn new(value: JsValue) -> Result<Self, BridgeError> {
        Self::at_depth(value, 0)
    }

    fn at_depth(value: JsValue, depth: usize) -> Result<Self, BridgeError> {
        let max_depth = value.env().options().max_conversion_depth;
        if depth > max_depth {
            return Err(ConversionError::custom(format!(
                "depth exceeded maximum limit of {}",
                max_depth
            ))
            .into());
        }
        let kind = value.kind()?;
        Ok(Self { value, kind, depth })
    }

    fn env(&self) -> &Env {
        self.value.env()
    }

    fn raw(&self) -> RawValue {
        self.value.raw()
    }

    fn mismatch(&self, target: &str) -> BridgeError {
        ConversionError::mismatch(self.kind, target).into()
    }

    fn number(&self, target: &str) -> Result<f64, BridgeError> {
        match self.kind {
            ValueKind::Number => Ok(self.env().get_value_double(self.raw())?),
            ValueKind::BigInt => Ok(self.env().get_value_bigint_i128(self.raw())? as f64),
            _ => Err(self.mismatch(target)),
        }
    }

    /// Integer view of a number (truncated toward zero) or bigint.
    fn integer(&self, target: &str) -> Result<i128, BridgeError> {
        match self.kind {
            ValueKind::Number => {
                let n = self.env().get_value_double(self.raw())?;
                if !n.is_finite() {
                    return Err(ConversionError::custom(format!(
                        "cannot set non-finite number {} to {}",
                        n, target
                    ))
                    .into());
                }
                Ok(n.trunc() as i128)
            }
            ValueKind::BigInt => Ok(self.env().get_value_bigint_i128(self.raw())?),
            _ => Err(self.mismatch(target)),
        }
    }

    fn array_access(self) -> Result<ArrayAccess, BridgeError> {
        let length = self.env().get_array_length(self.raw())?;
        Ok(ArrayAccess {
            env: self.env().clone(),
            array: self.raw(),
            depth: self.depth,
            index: 0,
            length,
            padded_to: length,
        })
    }

    fn object_access(self) -> Result<ObjectAccess, BridgeError> {
        let keys = self.env().property_names(self.raw())?;
        Ok(ObjectAccess {
            env: self.env().clone(),
            object: self.raw(),
            depth: self.depth,
            keys: keys.into_iter(),
            current: None,
        })
    }

    fn bytes(&self) -> Result<Option<Vec<u8>>, BridgeError> {
        match self.kind {
            ValueKind::Buffer => Ok(Some(self.env().get_buffer_info(self.raw())?)),
            ValueKind::ArrayBuffer => Ok(Some(self.env().get_arraybuffer_info(self.raw())?)),
            _ => Ok(None),
        }
    }
}

fn out_of_range(value: i128, target: &str) -> BridgeError {
    ConversionError::custom(format!("value {} out of range for {}", value, target)).into()
}

macro_rules! deserialize_integer {
    ($method:ident, $visit:ident, $ty:ty) => {
        fn $method<V>(self, visitor: V) -> Result<V::Value, BridgeError>
        where
            V: Visitor<'de>,
        {
            let target = stringify!($ty);
            let value = self.integer(target)?;
            let value = <$ty>::try_from(value).map_err(|_| out_of_range(value, target))?;
            visitor.$visit(value)
        }
    };
}

impl<'de> de::Deserializer<'de> for Deserializer {
    type Error = BridgeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::Undefined | ValueKind::Null => visitor.visit_unit(),
            ValueKind::Boolean => visitor.visit_bool(self.env().get_value_bool(self.raw())?),
            ValueKind::Number => {
                let n = self.env().get_value_double(self.raw())?;
                if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    visitor.visit_i64(n as i64)
                } else {
                    visitor.visit_f64(n)
                }
            }
            ValueKind::BigInt => {
                let value = self.env().get_value_bigint_i128(self.raw())?;
                if let Ok(value) = i64::try_from(value) {
                    visitor.visit_i64(value)
                } else if let Ok(value) = u64::try_from(value) {
                    visitor.visit_u64(value)
                } else {
                    visitor.visit_i128(value)
                }
            }
            ValueKind::String => visitor.visit_string(self.env().get_value_string_utf8(self.raw())?),
            ValueKind::Date => visitor.visit_f64(self.env().get_date_value(self.raw())?),
            ValueKind::Buffer | ValueKind::ArrayBuffer => {
                let bytes = self.bytes()?.unwrap_or_default();
                visitor.visit_seq(BytesAccess {
                    bytes: bytes.into_iter(),
                })
            }
            ValueKind::Array => visitor.visit_seq(self.array_access()?),
            ValueKind::Object | ValueKind::Error => visitor.visit_map(self.object_access()?),
            _ => Err(self.mismatch("any")),
        }
    }

    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::Boolean => visitor.visit_bool(self.env().get_value_bool(self.raw())?),
            _ => Err(self.mismatch("bool")),
        }
    }

    deserialize_integer!(deserialize_i8, visit_i8, i8);
    deserialize_integer!(deserialize_i16, visit_i16, i16);
    deserialize_integer!(deserialize_i32, visit_i32, i32);
    deserialize_integer!(deserialize_i64, visit_i64, i64);
    deserialize_integer!(deserialize_i128, visit_i128, i128);
    deserialize_integer!(deserialize_u8, visit_u8, u8);
    deserialize_integer!(deserialize_u16, visit_u16, u16);
    deserialize_integer!(deserialize_u32, visit_u32, u32);
    deserialize_integer!(deserialize_u64, visit_u64, u64);
    deserialize_integer!(deserialize_u128, visit_u128, u128);

    fn deserialize_f32<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_f32(self.number("f32")? as f32)
    }

    fn deserialize_f64<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_f64(self.number("f64")?)
    }

    fn deserialize_char<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        if self.kind != ValueKind::String {
            return Err(self.mismatch("char"));
        }
        let text = self.env().get_value_string_utf8(self.raw())?;
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => visitor.visit_char(c),
            _ => Err(ConversionError::custom(format!(
                "cannot set string of length {} to char",
                text.chars().count()
            ))
            .into()),
        }
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_string(visitor)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::String => visitor.visit_string(self.env().get_value_string_utf8(self.raw())?),
            _ => Err(self.mismatch("string")),
        }
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_byte_buf(visitor)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.bytes()? {
            Some(bytes) => visitor.visit_byte_buf(bytes),
            None if self.kind == ValueKind::Array => visitor.visit_seq(self.array_access()?),
            None => Err(self.mismatch("bytes")),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::Undefined | ValueKind::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::Undefined | ValueKind::Null => visitor.visit_unit(),
            _ => Err(self.mismatch("unit")),
        }
    }

    fn deserialize_unit_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match name {
            magic::VALUE_TOKEN => magic::with_parked_value(self.value.clone(), || visitor.visit_unit()),
            magic::DATE_TOKEN => match self.kind {
                ValueKind::Date => visitor.visit_f64(self.env().get_date_value(self.raw())?),
                _ => Err(self.mismatch("Date")),
            },
            magic::FUNCTION_TOKEN => Err(self.mismatch("HostFunction")),
            _ => visitor.visit_newtype_struct(self),
        }
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::Array => visitor.visit_seq(self.array_access()?),
            ValueKind::Buffer | ValueKind::ArrayBuffer => {
                let bytes = self.bytes()?.unwrap_or_default();
                visitor.visit_seq(BytesAccess {
                    bytes: bytes.into_iter(),
                })
            }
            _ => Err(self.mismatch("sequence")),
        }
    }

    fn deserialize_tuple<V>(self, len: usize, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::Array => {
                let len = u32::try_from(len).unwrap_or(u32::MAX);
                let mut access = self.array_access()?;
                access.length = access.length.min(len);
                access.padded_to = len;
                visitor.visit_seq(access)
            }
            _ => Err(self.mismatch("tuple")),
        }
    }

    fn deserialize_tuple_struct<V>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::Object | ValueKind::Error => visitor.visit_map(self.object_access()?),
            _ => Err(self.mismatch("map")),
        }
    }

    fn deserialize_struct<V>(
        self,
        name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::Object => visitor.visit_map(self.object_access()?),
            _ => Err(self.mismatch(if name.is_empty() { "struct" } else { name })),
        }
    }

    fn deserialize_enum<V>(
        self,
        name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::String => {
                let variant = self.env().get_value_string_utf8(self.raw())?;
                visitor.visit_enum(variant.into_deserializer())
            }
            ValueKind::Object => {
                let keys = self.env().property_names(self.raw())?;
                if keys.len() != 1 {
                    return Err(ConversionError::custom(format!(
                        "cannot set object with {} properties to enum {}",
                        keys.len(),
                        name
                    ))
                    .into());
                }
                let variant = keys.into_iter().next().unwrap_or_default();
                let raw = self.env().get_named_property(self.raw(), &variant)?;
                let value = Deserializer::at_depth(JsValue::from_raw(self.env(), raw), self.depth + 1)?;
                visitor.visit_enum(EnumAccess { variant, value })
            }
            _ => Err(self.mismatch(name)),
        }
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.kind {
            ValueKind::String => visitor.visit_string(self.env().get_value_string_utf8(self.raw())?),
            _ => Err(self.mismatch("identifier")),
        }
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }
}

/// Elements past `length` up to `padded_to` come from [`ZeroDeserializer`].
struct ArrayAccess {
    env: Env,
    array: RawValue,
    depth: usize,
    index: u32,
    length: u32,
    padded_to: u32,
}

impl<'de> de::SeqAccess<'de> for ArrayAccess {
    type Error = BridgeError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, BridgeError>
    where
        T: DeserializeSeed<'de>,
    {
        if self.index >= self.padded_to {
            return Ok(None);
        }
        let index = self.index;
        self.index += 1;
        if index >= self.length {
            let zero = ZeroDeserializer {
                env: self.env.clone(),
            };
            return seed.deserialize(zero).map(Some);
        }
        let raw = self.env.get_element(self.array, index)?;
        let element = Deserializer::at_depth(JsValue::from_raw(&self.env, raw), self.depth + 1)?;
        seed.deserialize(element).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.padded_to.saturating_sub(self.index) as usize)
    }
}

/// Produces the zero value of whatever the target asks for. Fills fixed-size
/// targets read from a shorter array.
struct ZeroDeserializer {
    env: Env,
}

impl ZeroDeserializer {
    fn no_zero(target: &str) -> BridgeError {
        ConversionError::custom(format!("{} has no zero value", target)).into()
    }
}

macro_rules! deserialize_zero {
    ($method:ident, $visit:ident, $zero:expr) => {
        fn $method<V>(self, visitor: V) -> Result<V::Value, BridgeError>
        where
            V: Visitor<'de>,
        {
            visitor.$visit($zero)
        }
    };
}

impl<'de> de::Deserializer<'de> for ZeroDeserializer {
    type Error = BridgeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }

    deserialize_zero!(deserialize_bool, visit_bool, false);
    deserialize_zero!(deserialize_i8, visit_i8, 0);
    deserialize_zero!(deserialize_i16, visit_i16, 0);
    deserialize_zero!(deserialize_i32, visit_i32, 0);
    deserialize_zero!(deserialize_i64, visit_i64, 0);
    deserialize_zero!(deserialize_i128, visit_i128, 0);
    deserialize_zero!(deserialize_u8, visit_u8, 0);
    deserialize_zero!(deserialize_u16, visit_u16, 0);
    deserialize_zero!(deserialize_u32, visit_u32, 0);
    deserialize_zero!(deserialize_u64, visit_u64, 0);
    deserialize_zero!(deserialize_u128, visit_u128, 0);
    deserialize_zero!(deserialize_f32, visit_f32, 0.0);
    deserialize_zero!(deserialize_f64, visit_f64, 0.0);
    deserialize_zero!(deserialize_char, visit_char, '\0');
    deserialize_zero!(deserialize_str, visit_str, "");
    deserialize_zero!(deserialize_string, visit_str, "");
    deserialize_zero!(deserialize_bytes, visit_bytes, &[]);
    deserialize_zero!(deserialize_byte_buf, visit_bytes, &[]);

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_none()
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match name {
            magic::VALUE_TOKEN => {
                let undefined = JsValue::undefined(&self.env);
                magic::with_parked_value(undefined, || visitor.visit_unit())
            }
            magic::DATE_TOKEN => visitor.visit_f64(0.0),
            magic::FUNCTION_TOKEN => Err(Self::no_zero("HostFunction")),
            _ => visitor.visit_newtype_struct(self),
        }
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_seq(ZeroSeq {
            env: self.env,
            remaining: 0,
        })
    }

    fn deserialize_tuple<V>(self, len: usize, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_seq(ZeroSeq {
            env: self.env,
            remaining: len,
        })
    }

    fn deserialize_tuple_struct<V>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        const NO_FIELDS: &[&str] = &[];
        visitor.visit_map(ZeroFields {
            env: self.env,
            fields: NO_FIELDS.iter(),
        })
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_map(ZeroFields {
            env: self.env,
            fields: fields.iter(),
        })
    }

    fn deserialize_enum<V>(
        self,
        name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        Err(Self::no_zero(name))
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }
}

struct ZeroSeq {
    env: Env,
    remaining: usize,
}

impl<'de> de::SeqAccess<'de> for ZeroSeq {
    type Error = BridgeError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, BridgeError>
    where
        T: DeserializeSeed<'de>,
    {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let zero = ZeroDeserializer {
            env: self.env.clone(),
        };
        seed.deserialize(zero).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

/// Yields every declared field once, each with its zero value.
struct ZeroFields {
    env: Env,
    fields: std::slice::Iter<'static, &'static str>,
}

impl<'de> de::MapAccess<'de> for ZeroFields {
    type Error = BridgeError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, BridgeError>
    where
        K: DeserializeSeed<'de>,
    {
        match self.fields.next() {
            Some(field) => seed.deserialize((*field).into_deserializer()).map(Some),
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, BridgeError>
    where
        V: DeserializeSeed<'de>,
    {
        let zero = ZeroDeserializer {
            env: self.env.clone(),
        };
        seed.deserialize(zero)
    }
}

struct BytesAccess {
    bytes: std::vec::IntoIter<u8>,
}

impl<'de> de::SeqAccess<'de> for BytesAccess {
    type Error = BridgeError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, BridgeError>
    where
        T: DeserializeSeed<'de>,
    {
        match self.bytes.next() {
            Some(byte) => seed.deserialize(byte.into_deserializer()).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.bytes.len())
    }
}

struct ObjectAccess {
    env: Env,
    object: RawValue,
    depth: usize,
    keys: std::vec::IntoIter<String>,
    current: Option<String>,
}

impl<'de> de::MapAccess<'de> for ObjectAccess {
    type Error = BridgeError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, BridgeError>
    where
        K: DeserializeSeed<'de>,
    {
        match self.keys.next() {
            Some(key) => {
                self.current = Some(key.clone());
                seed.deserialize(MapKeyDeserializer { key }).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, BridgeError>
    where
        V: DeserializeSeed<'de>,
    {
        let key = self
            .current
            .take()
            .ok_or_else(|| ConversionError::custom("object value requested before its key"))?;
        let raw = self.env.get_named_property(self.object, &key)?;
        let value = Deserializer::at_depth(JsValue::from_raw(&self.env, raw), self.depth + 1)?;
        seed.deserialize(value)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.keys.len())
    }
}

struct EnumAccess {
    variant: String,
    value: Deserializer,
}

impl<'de> de::EnumAccess<'de> for EnumAccess {
    type Error = BridgeError;
    type Variant = Deserializer;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Deserializer), BridgeError>
    where
        V: DeserializeSeed<'de>,
    {
        let variant = seed.deserialize(MapKeyDeserializer { key: self.variant })?;
        Ok((variant, self.value))
    }
}

impl<'de> de::VariantAccess<'de> for Deserializer {
    type Error = BridgeError;

    fn unit_variant(self) -> Result<(), BridgeError> {
        match self.kind {
            ValueKind::Undefined | ValueKind::Null => Ok(()),
            _ => Err(self.mismatch("unit variant")),
        }
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value, BridgeError>
    where
        T: DeserializeSeed<'de>,
    {
        seed.deserialize(self)
    }

    fn tuple_variant<V>(self, len: usize, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_tuple(self, len, visitor)
    }

    fn struct_variant<V>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_struct(self, "", fields, visitor)
    }
}

/// Object property names are text; non-string key targets are parsed from it.
struct MapKeyDeserializer {
    key: String,
}

impl MapKeyDeserializer {
    fn parse<T: std::str::FromStr>(&self, target: &str) -> Result<T, BridgeError> {
        self.key.parse::<T>().map_err(|_| {
            ConversionError::custom(format!("cannot parse map key {:?} as {}", self.key, target)).into()
        })
    }
}

macro_rules! deserialize_parsed_key {
    ($method:ident, $visit:ident, $ty:ty) => {
        fn $method<V>(self, visitor: V) -> Result<V::Value, BridgeError>
        where
            V: Visitor<'de>,
        {
            let value: $ty = self.parse(stringify!($ty))?;
            visitor.$visit(value)
        }
    };
}

impl<'de> de::Deserializer<'de> for MapKeyDeserializer {
    type Error = BridgeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_string(self.key)
    }

    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        match self.key.as_str() {
            "1" | "t" | "T" | "TRUE" | "true" | "True" => visitor.visit_bool(true),
            "0" | "f" | "F" | "FALSE" | "false" | "False" => visitor.visit_bool(false),
            _ => Err(ConversionError::custom(format!(
                "cannot parse map key {:?} as bool",
                self.key
            ))
            .into()),
        }
    }

    deserialize_parsed_key!(deserialize_i8, visit_i8, i8);
    deserialize_parsed_key!(deserialize_i16, visit_i16, i16);
    deserialize_parsed_key!(deserialize_i32, visit_i32, i32);
    deserialize_parsed_key!(deserialize_i64, visit_i64, i64);
    deserialize_parsed_key!(deserialize_i128, visit_i128, i128);
    deserialize_parsed_key!(deserialize_u8, visit_u8, u8);
    deserialize_parsed_key!(deserialize_u16, visit_u16, u16);
    deserialize_parsed_key!(deserialize_u32, visit_u32, u32);
    deserialize_parsed_key!(deserialize_u64, visit_u64, u64);
    deserialize_parsed_key!(deserialize_u128, visit_u128, u128);
    deserialize_parsed_key!(deserialize_f32, visit_f32, f32);
    deserialize_parsed_key!(deserialize_f64, visit_f64, f64);
    deserialize_parsed_key!(deserialize_char, visit_char, char);

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, BridgeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_enum(self.key.into_deserializer())
    }

    forward_to_deserialize_any! {
        str string bytes byte_buf unit unit_struct seq tuple
        tuple_struct map struct identifier ignored_any
    }
}
