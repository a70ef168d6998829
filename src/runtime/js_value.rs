//! Dynamic value handles and their natural host representation.
//!
//! [`JsValue`] pairs an engine value with the [`Env`] it belongs to.
//! [`AnyValue`] is what a dynamic value becomes when the host target is
//! untyped: every tag maps to its closest Rust shape, with cycle detection
//! and depth/size limits enforced while walking objects and arrays.

use crate::runtime::conversion::magic;
use crate::runtime::conversion::Date;
use crate::runtime::error::{BridgeError, ConversionError};
use crate::runtime::sys::{Env, RawValue, ValueType};
use crate::runtime::values::{JsError, JsFunction, JsHandle};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::SystemTime;

/// Default maximum nesting depth when converting into [`AnyValue`].
pub const MAX_JS_DEPTH: usize = 100;
/// Default maximum accumulated size when converting into [`AnyValue`].
pub const MAX_JS_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Runtime type tag of a dynamic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Unknown,
    Undefined,
    Null,
    Boolean,
    Number,
    BigInt,
    String,
    Symbol,
    Object,
    Function,
    External,
    TypedArray,
    Promise,
    DataView,
    Buffer,
    Date,
    Array,
    ArrayBuffer,
    Error,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Unknown => "unknown",
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::BigInt => "bigint",
            ValueKind::String => "string",
            ValueKind::Symbol => "symbol",
            ValueKind::Object => "object",
            ValueKind::Function => "function",
            ValueKind::External => "external",
            ValueKind::TypedArray => "typedarray",
            ValueKind::Promise => "promise",
            ValueKind::DataView => "dataview",
            ValueKind::Buffer => "buffer",
            ValueKind::Date => "date",
            ValueKind::Array => "array",
            ValueKind::ArrayBuffer => "arraybuffer",
            ValueKind::Error => "error",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-owning reference to an engine value, tied to its environment.
#[derive(Clone)]
pub struct JsValue {
    env: Env,
    raw: RawValue,
}

impl JsValue {
    /// Wrap a raw value, checking it belongs to `env`.
    pub fn new(env: &Env, raw: RawValue) -> Result<Self, BridgeError> {
        if !env.owns(raw) {
            return Err(crate::runtime::sys::Status::InvalidArg.into());
        }
        Ok(Self::from_raw(env, raw))
    }

    pub(crate) fn from_raw(env: &Env, raw: RawValue) -> Self {
        Self {
            env: env.clone(),
            raw,
        }
    }

    pub fn undefined(env: &Env) -> Self {
        Self::from_raw(env, env.get_undefined())
    }

    pub fn null(env: &Env) -> Self {
        Self::from_raw(env, env.get_null())
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn raw(&self) -> RawValue {
        self.raw
    }

    /// Classify the value. Structural checks win over `typeof`.
    pub fn kind(&self) -> Result<ValueKind, BridgeError> {
        let env = &self.env;
        let raw = self.raw;
        let kind = if env.is_typedarray(raw)? {
            ValueKind::TypedArray
        } else if env.is_promise(raw)? {
            ValueKind::Promise
        } else if env.is_dataview(raw)? {
            ValueKind::DataView
        } else if env.is_buffer(raw)? {
            ValueKind::Buffer
        } else if env.is_date(raw)? {
            ValueKind::Date
        } else if env.is_array(raw)? {
            ValueKind::Array
        } else if env.is_arraybuffer(raw)? {
            ValueKind::ArrayBuffer
        } else if env.is_error(raw)? {
            ValueKind::Error
        } else {
            match env.typeof_value(raw)? {
                ValueType::Undefined => ValueKind::Undefined,
                ValueType::Null => ValueKind::Null,
                ValueType::Boolean => ValueKind::Boolean,
                ValueType::Number => ValueKind::Number,
                ValueType::String => ValueKind::String,
                ValueType::Symbol => ValueKind::Symbol,
                ValueType::Object => ValueKind::Object,
                ValueType::Function => ValueKind::Function,
                ValueType::External => ValueKind::External,
                ValueType::Bigint => ValueKind::BigInt,
            }
        };
        Ok(kind)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(
            self.env.typeof_value(self.raw),
            Ok(ValueType::Undefined) | Ok(ValueType::Null)
        )
    }

    pub fn strict_equals(&self, other: &JsValue) -> Result<bool, BridgeError> {
        Ok(self.env.strict_equals(self.raw, other.raw)?)
    }

    /// JS `String(value)`.
    pub fn coerce_to_string(&self) -> Result<String, BridgeError> {
        Ok(self.env.coerce_to_string(self.raw)?)
    }

    /// Narrow to a typed handle, failing when the tag does not match.
    pub fn cast<T: JsHandle>(self) -> Result<T, BridgeError> {
        T::try_from_value(self)
    }
}

impl PartialEq for JsValue {
    fn eq(&self, other: &Self) -> bool {
        self.env.same_env(&other.env) && self.raw == other.raw
    }
}

impl fmt::Debug for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Ok(kind) => write!(f, "JsValue({})", kind),
            Err(_) => write!(f, "JsValue(<invalid>)"),
        }
    }
}

impl Serialize for JsValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        magic::serialize_value(self, serializer)
    }
}

impl<'de> Deserialize<'de> for JsValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        magic::deserialize_value(deserializer)
    }
}

/// Natural host representation of a dynamic value.
///
/// Tags without a plain-data shape (symbol, external, promise, typed array,
/// data view, array buffer) are kept as handles.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    Date(SystemTime),
    Array(Vec<AnyValue>),
    Buffer(Vec<u8>),
    /// Object properties in insertion order
    Object(IndexMap<String, AnyValue>),
    Function(JsFunction),
    Error(JsError),
    Handle(JsValue),
}

impl AnyValue {
    /// Convert a dynamic value using the limits configured on its environment.
    pub fn from_js(value: &JsValue) -> Result<Self, BridgeError> {
        let options = value.env().options();
        let mut tracker = LimitTracker::new(options.max_conversion_depth, options.max_conversion_bytes);
        let mut seen = HashSet::new();
        Self::from_js_internal(value, &mut seen, &mut tracker)
    }

    fn from_js_internal(
        value: &JsValue,
        seen: &mut HashSet<RawValue>,
        tracker: &mut LimitTracker,
    ) -> Result<Self, BridgeError> {
        tracker.enter()?;
        let env = value.env();
        let raw = value.raw();

        let result = match value.kind()? {
            ValueKind::Undefined => {
                tracker.add_bytes(9)?;
                AnyValue::Undefined
            }
            ValueKind::Null => {
                tracker.add_bytes(4)?;
                AnyValue::Null
            }
            ValueKind::Boolean => {
                tracker.add_bytes(5)?;
                AnyValue::Bool(env.get_value_bool(raw)?)
            }
            ValueKind::Number => {
                tracker.add_bytes(24)?;
                AnyValue::Number(env.get_value_double(raw)?)
            }
            ValueKind::BigInt => {
                tracker.add_bytes(40)?;
                AnyValue::BigInt(env.get_value_bigint_i128(raw)?)
            }
            ValueKind::String => {
                let text = env.get_value_string_utf8(raw)?;
                tracker.add_bytes(text.len())?;
                AnyValue::String(text)
            }
            ValueKind::Date => {
                tracker.add_bytes(24)?;
                AnyValue::Date(Date::from_millis(env.get_date_value(raw)?).into())
            }
            ValueKind::Buffer => {
                let bytes = env.get_buffer_info(raw)?;
                tracker.add_bytes(bytes.len())?;
                AnyValue::Buffer(bytes)
            }
            ValueKind::Array => {
                if !seen.insert(raw) {
                    return Err(ConversionError::custom("cannot convert circular reference").into());
                }
                let length = env.get_array_length(raw)?;
                let mut items = Vec::with_capacity(length as usize);
                for index in 0..length {
                    let item = JsValue::from_raw(env, env.get_element(raw, index)?);
                    items.push(Self::from_js_internal(&item, seen, tracker)?);
                }
                seen.remove(&raw);
                AnyValue::Array(items)
            }
            ValueKind::Object => {
                if !seen.insert(raw) {
                    return Err(ConversionError::custom("cannot convert circular reference").into());
                }
                let mut map = IndexMap::new();
                for key in env.property_names(raw)? {
                    let item = JsValue::from_raw(env, env.get_named_property(raw, &key)?);
                    tracker.add_bytes(key.len())?;
                    let converted = Self::from_js_internal(&item, seen, tracker)?;
                    map.insert(key, converted);
                }
                seen.remove(&raw);
                AnyValue::Object(map)
            }
            ValueKind::Function => {
                tracker.add_bytes(8)?;
                AnyValue::Function(JsFunction::try_from_value(value.clone())?)
            }
            ValueKind::Error => {
                tracker.add_bytes(8)?;
                AnyValue::Error(JsError::try_from_value(value.clone())?)
            }
            ValueKind::Symbol
            | ValueKind::External
            | ValueKind::TypedArray
            | ValueKind::Promise
            | ValueKind::DataView
            | ValueKind::ArrayBuffer
            | ValueKind::Unknown => {
                tracker.add_bytes(8)?;
                AnyValue::Handle(value.clone())
            }
        };

        tracker.exit();
        Ok(result)
    }

    /// Convert back into a dynamic value.
    pub fn to_js(&self, env: &Env) -> Result<JsValue, BridgeError> {
        crate::runtime::conversion::to_js(env, self)
    }
}

impl Serialize for AnyValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            AnyValue::Undefined => serializer.serialize_unit(),
            AnyValue::Null => serializer.serialize_none(),
            AnyValue::Bool(b) => serializer.serialize_bool(*b),
            AnyValue::Number(n) => serializer.serialize_f64(*n),
            AnyValue::BigInt(i) => serializer.serialize_i128(*i),
            AnyValue::String(s) => serializer.serialize_str(s),
            AnyValue::Date(time) => Date(*time).serialize(serializer),
            AnyValue::Array(items) => items.serialize(serializer),
            AnyValue::Buffer(bytes) => serializer.serialize_bytes(bytes),
            AnyValue::Object(map) => map.serialize(serializer),
            AnyValue::Function(function) => function.serialize(serializer),
            AnyValue::Error(error) => error.serialize(serializer),
            AnyValue::Handle(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for AnyValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct AnyValueVisitor;

        impl<'de> Visitor<'de> for AnyValueVisitor {
            type Value = AnyValue;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("any JavaScript value")
            }

            fn visit_newtype_struct<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                deserializer.deserialize_any(self)
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
                Ok(AnyValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
                Ok(AnyValue::Number(value as f64))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                Ok(AnyValue::Number(value as f64))
            }

            fn visit_i128<E>(self, value: i128) -> Result<Self::Value, E> {
                Ok(AnyValue::BigInt(value))
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
                Ok(AnyValue::Number(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
                Ok(AnyValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
                Ok(AnyValue::String(value))
            }

            fn visit_bytes<E>(self, value: &[u8]) -> Result<Self::Value, E> {
                Ok(AnyValue::Buffer(value.to_vec()))
            }

            fn visit_byte_buf<E>(self, value: Vec<u8>) -> Result<Self::Value, E> {
                Ok(AnyValue::Buffer(value))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(AnyValue::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                deserializer.deserialize_any(self)
            }

            // The bridge deserializer hands the source value over out of band.
            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match magic::take_value() {
                    Some(value) => AnyValue::from_js(&value).map_err(E::custom),
                    None => Ok(AnyValue::Null),
                }
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(AnyValue::Array(items))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut object = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    object.insert(key, value);
                }
                Ok(AnyValue::Object(object))
            }
        }

        deserializer.deserialize_newtype_struct(magic::VALUE_TOKEN, AnyValueVisitor)
    }
}

/// Tracks depth and size limits while walking a value graph.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    /// Enter a new depth level.
    ///
    /// Returns an error if the depth limit is exceeded.
    pub fn enter(&mut self) -> Result<(), ConversionError> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(ConversionError::custom(format!(
                "depth exceeded maximum limit of {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    /// Add to the byte count.
    ///
    /// Returns an error if the size limit is exceeded.
    pub fn add_bytes(&mut self, bytes: usize) -> Result<(), ConversionError> {
        self.current_bytes += bytes;
        if self.current_bytes > self.max_bytes {
            return Err(ConversionError::custom(format!(
                "size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}
