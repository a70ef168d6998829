//! Out-of-band exchange for values serde cannot carry.
//!
//! Engine handles and host functions travel through serde as newtype structs
//! with reserved names. The payload itself is parked in a thread-local slot
//! and picked up by the bridge (de)serializer on the other side. Any other
//! serializer sees a unit value and the slot is cleared afterwards.

use crate::runtime::host_fn::HostFunction;
use crate::runtime::js_value::JsValue;
use serde::de::{self, Visitor};
use std::cell::RefCell;
use std::fmt;

pub(crate) const VALUE_TOKEN: &str = "$__jsbridge_private_JsValue";
pub(crate) const FUNCTION_TOKEN: &str = "$__jsbridge_private_HostFunction";
pub(crate) const DATE_TOKEN: &str = "$__jsbridge_private_Date";

enum Exchange {
    Value(JsValue),
    Function(HostFunction),
}

thread_local! {
    static EXCHANGE: RefCell<Option<Exchange>> = const { RefCell::new(None) };
}

fn park(item: Exchange) {
    EXCHANGE.with(|slot| *slot.borrow_mut() = Some(item));
}

fn clear() {
    EXCHANGE.with(|slot| slot.borrow_mut().take());
}

pub(crate) fn put_value(value: JsValue) {
    park(Exchange::Value(value));
}

pub(crate) fn take_value() -> Option<JsValue> {
    EXCHANGE.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.take() {
            Some(Exchange::Value(value)) => Some(value),
            other => {
                *slot = other;
                None
            }
        }
    })
}

/// Look at the parked value without consuming it.
pub(crate) fn peek_value<R>(f: impl FnOnce(Option<&JsValue>) -> R) -> R {
    EXCHANGE.with(|slot| match &*slot.borrow() {
        Some(Exchange::Value(value)) => f(Some(value)),
        _ => f(None),
    })
}

pub(crate) fn take_function() -> Option<HostFunction> {
    EXCHANGE.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.take() {
            Some(Exchange::Function(function)) => Some(function),
            other => {
                *slot = other;
                None
            }
        }
    })
}

pub(crate) fn serialize_value<S>(value: &JsValue, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    park(Exchange::Value(value.clone()));
    let result = serializer.serialize_newtype_struct(VALUE_TOKEN, &());
    clear();
    result
}

pub(crate) fn serialize_function<S>(function: &HostFunction, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    park(Exchange::Function(function.clone()));
    let result = serializer.serialize_newtype_struct(FUNCTION_TOKEN, &());
    clear();
    result
}

/// Run `visit` with `value` parked, so a visitor can pick it up in `visit_unit`.
pub(crate) fn with_parked_value<R>(value: JsValue, visit: impl FnOnce() -> R) -> R {
    park(Exchange::Value(value));
    let result = visit();
    clear();
    result
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = JsValue;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an engine value handle")
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        take_value().ok_or_else(|| {
            E::custom("engine value handles can only be produced by the bridge deserializer")
        })
    }
}

pub(crate) fn deserialize_value<'de, D>(deserializer: D) -> Result<JsValue, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserializer.deserialize_newtype_struct(VALUE_TOKEN, ValueVisitor)
}
