//! Typed handles over [`JsValue`] with call-through accessors.

use crate::runtime::conversion::{from_js, to_js, Date};
use crate::runtime::error::{BridgeError, ConversionError};
use crate::runtime::js_value::{JsValue, ValueKind};
use crate::runtime::sys::{Deferred, Env, PromiseState, Status, TypedArrayType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::ops::Deref;
use std::rc::Rc;
use std::time::SystemTime;

/// A [`JsValue`] statically known to carry one of a set of tags.
pub trait JsHandle: Sized + Clone {
    /// Tags this handle accepts.
    const KINDS: &'static [ValueKind];
    /// Name used in conversion errors.
    const NAME: &'static str;

    fn from_value_unchecked(value: JsValue) -> Self;

    fn as_value(&self) -> &JsValue;

    fn into_value(self) -> JsValue;

    fn try_from_value(value: JsValue) -> Result<Self, BridgeError> {
        let kind = value.kind()?;
        if Self::KINDS.contains(&kind) {
            Ok(Self::from_value_unchecked(value))
        } else {
            Err(ConversionError::mismatch(kind, Self::NAME).into())
        }
    }
}

const OBJECT_KINDS: &[ValueKind] = &[
    ValueKind::Object,
    ValueKind::Array,
    ValueKind::Function,
    ValueKind::Error,
    ValueKind::Date,
    ValueKind::Promise,
    ValueKind::Buffer,
    ValueKind::TypedArray,
    ValueKind::DataView,
    ValueKind::ArrayBuffer,
];

macro_rules! js_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal, $kinds:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name(JsValue);

        impl JsHandle for $name {
            const KINDS: &'static [ValueKind] = $kinds;
            const NAME: &'static str = $label;

            fn from_value_unchecked(value: JsValue) -> Self {
                Self(value)
            }

            fn as_value(&self) -> &JsValue {
                &self.0
            }

            fn into_value(self) -> JsValue {
                self.0
            }
        }

        impl Deref for $name {
            type Target = JsValue;

            fn deref(&self) -> &JsValue {
                &self.0
            }
        }

        impl From<$name> for JsValue {
            fn from(handle: $name) -> JsValue {
                handle.0
            }
        }

        impl TryFrom<JsValue> for $name {
            type Error = BridgeError;

            fn try_from(value: JsValue) -> Result<Self, BridgeError> {
                Self::try_from_value(value)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                self.0.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let value = JsValue::deserialize(deserializer)?;
                Self::try_from_value(value).map_err(serde::de::Error::custom)
            }
        }
    };
}

js_handle!(JsString, "string", &[ValueKind::String]);
js_handle!(JsNumber, "number", &[ValueKind::Number]);
js_handle!(JsBigInt, "bigint", &[ValueKind::BigInt]);
js_handle!(JsBoolean, "boolean", &[ValueKind::Boolean]);
js_handle!(JsSymbol, "symbol", &[ValueKind::Symbol]);
js_handle!(JsDate, "date", &[ValueKind::Date]);
js_handle!(
    /// Any object-like value: plain objects, arrays, functions and the
    /// structurally tagged kinds.
    JsObject,
    "object",
    OBJECT_KINDS
);
js_handle!(JsArray, "array", &[ValueKind::Array]);
js_handle!(JsFunction, "function", &[ValueKind::Function]);
js_handle!(JsError, "error", &[ValueKind::Error]);
js_handle!(JsPromise, "promise", &[ValueKind::Promise]);
js_handle!(JsBuffer, "buffer", &[ValueKind::Buffer]);
js_handle!(JsArrayBuffer, "arraybuffer", &[ValueKind::ArrayBuffer]);
js_handle!(JsTypedArray, "typedarray", &[ValueKind::TypedArray]);
js_handle!(JsDataView, "dataview", &[ValueKind::DataView]);
js_handle!(JsExternal, "external", &[ValueKind::External]);

fn wrap(env: &Env, raw: crate::runtime::sys::RawValue) -> JsValue {
    JsValue::from_raw(env, raw)
}

impl JsString {
    pub fn new(env: &Env, value: &str) -> Self {
        Self(wrap(env, env.create_string_utf8(value)))
    }

    pub fn from_utf16(env: &Env, value: &[u16]) -> Self {
        Self(wrap(env, env.create_string_utf16(value)))
    }

    pub fn value(&self) -> Result<String, BridgeError> {
        Ok(self.env().get_value_string_utf8(self.raw())?)
    }

    pub fn utf16(&self) -> Result<Vec<u16>, BridgeError> {
        Ok(self.env().get_value_string_utf16(self.raw())?)
    }
}

impl JsNumber {
    pub fn new(env: &Env, value: f64) -> Self {
        Self(wrap(env, env.create_double(value)))
    }

    pub fn from_i32(env: &Env, value: i32) -> Self {
        Self(wrap(env, env.create_int32(value)))
    }

    pub fn from_u32(env: &Env, value: u32) -> Self {
        Self(wrap(env, env.create_uint32(value)))
    }

    pub fn from_i64(env: &Env, value: i64) -> Self {
        Self(wrap(env, env.create_int64(value)))
    }

    pub fn value(&self) -> Result<f64, BridgeError> {
        Ok(self.env().get_value_double(self.raw())?)
    }

    pub fn as_i32(&self) -> Result<i32, BridgeError> {
        Ok(self.env().get_value_int32(self.raw())?)
    }

    pub fn as_u32(&self) -> Result<u32, BridgeError> {
        Ok(self.env().get_value_uint32(self.raw())?)
    }

    pub fn as_i64(&self) -> Result<i64, BridgeError> {
        Ok(self.env().get_value_int64(self.raw())?)
    }
}

impl JsBigInt {
    pub fn from_i64(env: &Env, value: i64) -> Self {
        Self(wrap(env, env.create_bigint_int64(value)))
    }

    pub fn from_u64(env: &Env, value: u64) -> Self {
        Self(wrap(env, env.create_bigint_uint64(value)))
    }

    /// Value truncated to `i64`, and whether no precision was lost.
    pub fn as_i64(&self) -> Result<(i64, bool), BridgeError> {
        Ok(self.env().get_value_bigint_int64(self.raw())?)
    }

    /// Value truncated to `u64`, and whether no precision was lost.
    pub fn as_u64(&self) -> Result<(u64, bool), BridgeError> {
        Ok(self.env().get_value_bigint_uint64(self.raw())?)
    }
}

impl JsBoolean {
    pub fn new(env: &Env, value: bool) -> Self {
        Self(wrap(env, env.get_boolean(value)))
    }

    pub fn value(&self) -> Result<bool, BridgeError> {
        Ok(self.env().get_value_bool(self.raw())?)
    }
}

impl JsSymbol {
    pub fn new(env: &Env, description: Option<&str>) -> Self {
        Self(wrap(env, env.create_symbol(description)))
    }
}

impl JsDate {
    pub fn new(env: &Env, time: SystemTime) -> Self {
        Self::from_millis(env, Date(time).millis())
    }

    pub fn from_millis(env: &Env, millis: f64) -> Self {
        Self(wrap(env, env.create_date(millis)))
    }

    /// Milliseconds since the Unix epoch.
    pub fn millis(&self) -> Result<f64, BridgeError> {
        Ok(self.env().get_date_value(self.raw())?)
    }

    pub fn time(&self) -> Result<SystemTime, BridgeError> {
        Ok(Date::from_millis(self.millis()?).into())
    }
}

impl JsObject {
    pub fn new(env: &Env) -> Self {
        Self(wrap(env, env.create_object()))
    }

    /// The environment's global object.
    pub fn global(env: &Env) -> Self {
        Self(wrap(env, env.get_global()))
    }

    pub fn get(&self, key: &str) -> Result<JsValue, BridgeError> {
        let raw = self.env().get_named_property(self.raw(), key)?;
        Ok(wrap(self.env(), raw))
    }

    /// Read a property and convert it to a host value.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, BridgeError> {
        from_js(&self.get(key)?)
    }

    pub fn set(&self, key: &str, value: &JsValue) -> Result<(), BridgeError> {
        Ok(self.env().set_named_property(self.raw(), key, value.raw())?)
    }

    /// Convert a host value and store it under `key`.
    pub fn set_value<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), BridgeError> {
        let value = to_js(self.env(), value)?;
        self.set(key, &value)
    }

    /// Property access keyed by a dynamic value, stringified like JS does.
    pub fn get_by(&self, key: &JsValue) -> Result<JsValue, BridgeError> {
        let raw = self.env().get_property(self.raw(), key.raw())?;
        Ok(wrap(self.env(), raw))
    }

    pub fn set_by(&self, key: &JsValue, value: &JsValue) -> Result<(), BridgeError> {
        Ok(self.env().set_property(self.raw(), key.raw(), value.raw())?)
    }

    pub fn has(&self, key: &str) -> Result<bool, BridgeError> {
        Ok(self.env().has_named_property(self.raw(), key)?)
    }

    pub fn has_own(&self, key: &JsValue) -> Result<bool, BridgeError> {
        Ok(self.env().has_own_property(self.raw(), key.raw())?)
    }

    pub fn delete(&self, key: &str) -> Result<bool, BridgeError> {
        Ok(self.env().delete_named_property(self.raw(), key)?)
    }

    pub fn property_names(&self) -> Result<Vec<String>, BridgeError> {
        Ok(self.env().property_names(self.raw())?)
    }

    /// Own properties in enumeration order.
    pub fn entries(&self) -> Result<Vec<(String, JsValue)>, BridgeError> {
        self.property_names()?
            .into_iter()
            .map(|key| {
                let value = self.get(&key)?;
                Ok((key, value))
            })
            .collect()
    }

    pub fn freeze(&self) -> Result<(), BridgeError> {
        Ok(self.env().object_freeze(self.raw())?)
    }

    pub fn seal(&self) -> Result<(), BridgeError> {
        Ok(self.env().object_seal(self.raw())?)
    }
}

impl JsArray {
    pub fn new(env: &Env) -> Self {
        Self(wrap(env, env.create_array()))
    }

    pub fn with_length(env: &Env, length: usize) -> Self {
        Self(wrap(env, env.create_array_with_length(length)))
    }

    pub fn len(&self) -> Result<u32, BridgeError> {
        Ok(self.env().get_array_length(self.raw())?)
    }

    pub fn is_empty(&self) -> Result<bool, BridgeError> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: u32) -> Result<JsValue, BridgeError> {
        let raw = self.env().get_element(self.raw(), index)?;
        Ok(wrap(self.env(), raw))
    }

    pub fn set(&self, index: u32, value: &JsValue) -> Result<(), BridgeError> {
        Ok(self.env().set_element(self.raw(), index, value.raw())?)
    }

    pub fn push(&self, value: &JsValue) -> Result<(), BridgeError> {
        let index = self.len()?;
        self.set(index, value)
    }

    pub fn to_vec(&self) -> Result<Vec<JsValue>, BridgeError> {
        (0..self.len()?).map(|index| self.get(index)).collect()
    }

    pub fn as_object(&self) -> JsObject {
        JsObject(self.0.clone())
    }
}

impl JsFunction {
    pub fn name(&self) -> Result<String, BridgeError> {
        Ok(self.env().get_function_name(self.raw())?)
    }

    /// Call with `undefined` as the receiver.
    pub fn call(&self, args: &[JsValue]) -> Result<JsValue, BridgeError> {
        self.call_with_this(&JsValue::undefined(self.env()), args)
    }

    /// Call synchronously. A script exception is taken off the environment and
    /// returned as [`BridgeError::Thrown`].
    pub fn call_with_this(&self, this: &JsValue, args: &[JsValue]) -> Result<JsValue, BridgeError> {
        let env = self.env();
        let raw_args: Vec<_> = args.iter().map(JsValue::raw).collect();
        match env.call_function(this.raw(), self.raw(), &raw_args) {
            Ok(raw) => Ok(wrap(env, raw)),
            Err(Status::PendingException) => Err(JsError::take_pending(env)),
            Err(status) => Err(status.into()),
        }
    }

    /// Call with host arguments, converting each with [`to_js`].
    pub fn call_with<T: Serialize>(&self, args: &[T]) -> Result<JsValue, BridgeError> {
        let env = self.env();
        let args = args
            .iter()
            .map(|arg| to_js(env, arg))
            .collect::<Result<Vec<_>, _>>()?;
        self.call(&args)
    }
}

impl JsError {
    pub fn new(env: &Env, code: Option<&str>, message: &str) -> Result<Self, BridgeError> {
        let code = code.map(|c| env.create_string_utf8(c));
        let message = env.create_string_utf8(message);
        Ok(Self(wrap(env, env.create_error(code, message)?)))
    }

    pub fn type_error(env: &Env, code: Option<&str>, message: &str) -> Result<Self, BridgeError> {
        let code = code.map(|c| env.create_string_utf8(c));
        let message = env.create_string_utf8(message);
        Ok(Self(wrap(env, env.create_type_error(code, message)?)))
    }

    pub fn range_error(env: &Env, code: Option<&str>, message: &str) -> Result<Self, BridgeError> {
        let code = code.map(|c| env.create_string_utf8(c));
        let message = env.create_string_utf8(message);
        Ok(Self(wrap(env, env.create_range_error(code, message)?)))
    }

    /// Build the script error a host-side failure becomes.
    pub fn from_bridge_error(env: &Env, error: &BridgeError) -> Result<Self, BridgeError> {
        Self::new(env, error.code(), &error.to_string())
    }

    pub fn message(&self) -> Result<String, BridgeError> {
        from_js(&self.as_object().get("message")?)
    }

    pub fn code(&self) -> Result<Option<String>, BridgeError> {
        from_js(&self.as_object().get("code")?)
    }

    pub fn throw(&self) -> Result<(), BridgeError> {
        Ok(self.env().throw(self.raw())?)
    }

    pub fn as_object(&self) -> JsObject {
        JsObject(self.0.clone())
    }

    /// Clear the pending exception and describe it as a host error.
    pub(crate) fn take_pending(env: &Env) -> BridgeError {
        match env.get_and_clear_last_exception() {
            Some(raw) => BridgeError::Thrown(describe_exception(&wrap(env, raw))),
            None => BridgeError::from(Status::PendingException),
        }
    }
}

/// Human-readable message of a thrown value: an error's `message`, or `String(value)`.
pub(crate) fn describe_exception(value: &JsValue) -> String {
    if let Ok(error) = value.clone().cast::<JsError>() {
        if let Ok(message) = error.message() {
            return message;
        }
    }
    value
        .coerce_to_string()
        .unwrap_or_else(|_| "unknown exception".to_string())
}

/// Settlement state of a promise, as observed from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseOutcome {
    Pending,
    Fulfilled(JsValue),
    Rejected(JsValue),
}

impl JsPromise {
    /// Create a pending promise and the capability that settles it.
    pub fn new(env: &Env) -> (Self, JsDeferred) {
        let (deferred, promise) = env.create_promise();
        (
            Self(wrap(env, promise)),
            JsDeferred {
                env: env.clone(),
                deferred,
            },
        )
    }

    pub fn outcome(&self) -> Result<PromiseOutcome, BridgeError> {
        let env = self.env();
        Ok(match env.promise_state(self.raw())? {
            PromiseState::Pending => PromiseOutcome::Pending,
            PromiseState::Fulfilled(raw) => PromiseOutcome::Fulfilled(wrap(env, raw)),
            PromiseState::Rejected(raw) => PromiseOutcome::Rejected(wrap(env, raw)),
        })
    }
}

/// Resolver capability of a [`JsPromise`]. Settles exactly once.
#[derive(Debug)]
pub struct JsDeferred {
    env: Env,
    deferred: Deferred,
}

impl JsDeferred {
    pub fn resolve(self, value: &JsValue) -> Result<(), BridgeError> {
        Ok(self.env.resolve_deferred(self.deferred, value.raw())?)
    }

    pub fn reject(self, reason: &JsValue) -> Result<(), BridgeError> {
        Ok(self.env.reject_deferred(self.deferred, reason.raw())?)
    }
}

impl JsBuffer {
    pub fn new(env: &Env, data: &[u8]) -> Self {
        Self(wrap(env, env.create_buffer_copy(data)))
    }

    pub fn data(&self) -> Result<Vec<u8>, BridgeError> {
        Ok(self.env().get_buffer_info(self.raw())?)
    }
}

impl JsArrayBuffer {
    pub fn new(env: &Env, data: &[u8]) -> Self {
        Self(wrap(env, env.create_arraybuffer(data)))
    }

    pub fn data(&self) -> Result<Vec<u8>, BridgeError> {
        Ok(self.env().get_arraybuffer_info(self.raw())?)
    }
}

/// Layout of a typed array view.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArrayInfo {
    pub kind: TypedArrayType,
    pub length: usize,
    pub data: Vec<u8>,
    pub byte_offset: usize,
}

impl JsTypedArray {
    pub fn new(
        env: &Env,
        kind: TypedArrayType,
        length: usize,
        buffer: &JsArrayBuffer,
        byte_offset: usize,
    ) -> Result<Self, BridgeError> {
        let raw = env.create_typedarray(kind, length, buffer.raw(), byte_offset)?;
        Ok(Self(wrap(env, raw)))
    }

    pub fn info(&self) -> Result<TypedArrayInfo, BridgeError> {
        let (kind, length, data, _buffer, byte_offset) = self.env().get_typedarray_info(self.raw())?;
        Ok(TypedArrayInfo {
            kind,
            length,
            data,
            byte_offset,
        })
    }
}

impl JsDataView {
    pub fn new(
        env: &Env,
        byte_length: usize,
        buffer: &JsArrayBuffer,
        byte_offset: usize,
    ) -> Result<Self, BridgeError> {
        let raw = env.create_dataview(byte_length, buffer.raw(), byte_offset)?;
        Ok(Self(wrap(env, raw)))
    }

    /// Bytes visible through the view.
    pub fn data(&self) -> Result<Vec<u8>, BridgeError> {
        let (_length, data, _buffer, _offset) = self.env().get_dataview_info(self.raw())?;
        Ok(data)
    }
}

impl JsExternal {
    pub fn new<T: Any>(env: &Env, data: T) -> Self {
        Self(wrap(env, env.create_external(Rc::new(data))))
    }

    /// The wrapped host value, if it has type `T`.
    pub fn downcast<T: Any>(&self) -> Result<Option<Rc<T>>, BridgeError> {
        let data = self.env().get_value_external(self.raw())?;
        Ok(data.downcast::<T>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sys::test_env;

    #[test]
    fn test_cast_checks_tag() {
        let (env, _) = test_env();
        let value: JsValue = JsString::new(&env, "hi").into();
        assert!(value.clone().cast::<JsString>().is_ok());
        let err = value.cast::<JsNumber>().unwrap_err();
        assert_eq!(err.to_string(), "cannot set string to number");
    }

    #[test]
    fn test_object_accepts_structural_kinds() {
        let (env, _) = test_env();
        let array: JsValue = JsArray::new(&env).into();
        assert!(array.cast::<JsObject>().is_ok());
    }

    #[test]
    fn test_object_properties() {
        let (env, _) = test_env();
        let object = JsObject::new(&env);
        object.set_value("a", &1i32).unwrap();
        object.set_value("b", "two").unwrap();
        assert!(object.has("a").unwrap());
        assert_eq!(object.get_as::<i32>("a").unwrap(), 1);
        assert_eq!(object.property_names().unwrap(), vec!["a", "b"]);
        assert!(object.delete("a").unwrap());
        assert!(!object.has("a").unwrap());
        let key: JsValue = JsNumber::new(&env, 3.0).into();
        object.set_by(&key, &JsBoolean::new(&env, true)).unwrap();
        assert!(object.has("3").unwrap());
    }

    #[test]
    fn test_array_push_and_iterate() {
        let (env, _) = test_env();
        let array = JsArray::new(&env);
        array.push(&JsNumber::new(&env, 1.0)).unwrap();
        array.push(&JsNumber::new(&env, 2.0)).unwrap();
        let items: Vec<f64> = array
            .to_vec()
            .unwrap()
            .into_iter()
            .map(|item| item.cast::<JsNumber>().unwrap().value().unwrap())
            .collect();
        assert_eq!(items, vec![1.0, 2.0]);
    }

    #[test]
    fn test_error_message_and_code() {
        let (env, _) = test_env();
        let error = JsError::new(&env, Some("E_CODE"), "broken").unwrap();
        assert_eq!(error.message().unwrap(), "broken");
        assert_eq!(error.code().unwrap(), Some("E_CODE".to_string()));
        error.throw().unwrap();
        assert_eq!(JsError::take_pending(&env).to_string(), "broken");
    }

    #[test]
    fn test_promise_resolution() {
        let (env, _) = test_env();
        let (promise, deferred) = JsPromise::new(&env);
        assert_eq!(promise.outcome().unwrap(), PromiseOutcome::Pending);
        let value: JsValue = JsNumber::new(&env, 7.0).into();
        deferred.resolve(&value).unwrap();
        assert_eq!(promise.outcome().unwrap(), PromiseOutcome::Fulfilled(value));
    }

    #[test]
    fn test_external_downcast() {
        let (env, _) = test_env();
        let external = JsExternal::new(&env, 42u32);
        assert_eq!(*external.downcast::<u32>().unwrap().unwrap(), 42);
        assert!(external.downcast::<String>().unwrap().is_none());
    }

    #[test]
    fn test_date_round_trip() {
        let (env, _) = test_env();
        let date = JsDate::from_millis(&env, 1_500.0);
        assert_eq!(date.millis().unwrap(), 1_500.0);
        let time = date.time().unwrap();
        assert_eq!(JsDate::new(&env, time).millis().unwrap(), 1_500.0);
    }
}
