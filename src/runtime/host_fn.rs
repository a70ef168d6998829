//! Host functions exposed to scripts.
//!
//! A [`HostFunction`] wraps a Rust closure so scripts can call it. Each call
//! checks the argument count, converts every argument with
//! [`from_js`], runs the closure and converts what it returns:
//!
//! - `()` becomes `undefined`, a single value is converted directly and a
//!   tuple becomes an array of its elements.
//! - `Err(e)` from a `Result` return is thrown at the caller; the `Ok` side
//!   follows the rules above.
//! - A panic inside the closure is caught and thrown as an error with code
//!   `ERR_HOST_PANIC`.

use crate::runtime::conversion::{from_js, magic, to_js, Date};
use crate::runtime::error::{ArityError, BridgeError};
use crate::runtime::js_value::{AnyValue, JsValue, ValueKind};
use crate::runtime::sys::{CallbackInfo, Env, NativeCallback, RawValue};
use crate::runtime::values::{
    JsArray, JsArrayBuffer, JsBigInt, JsBoolean, JsBuffer, JsDataView, JsDate, JsError,
    JsExternal, JsFunction, JsHandle, JsNumber, JsObject, JsPromise, JsString, JsSymbol,
    JsTypedArray,
};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::BuildHasher;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::error;

type Invoke = dyn Fn(&CallContext) -> Result<JsValue, BridgeError>;

/// Receiver and arguments of one script call.
pub struct CallContext {
    env: Env,
    this: JsValue,
    args: Vec<JsValue>,
}

impl CallContext {
    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn this(&self) -> &JsValue {
        &self.this
    }

    pub fn args(&self) -> &[JsValue] {
        &self.args
    }

    /// Argument `index`, or `undefined` when the caller passed fewer.
    pub fn arg(&self, index: usize) -> JsValue {
        self.args
            .get(index)
            .cloned()
            .unwrap_or_else(|| JsValue::undefined(&self.env))
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    fn check(self, received: usize) -> Result<(), ArityError> {
        match self {
            Arity::Exact(expected) if received != expected => Err(ArityError {
                expected,
                received,
                variadic: false,
            }),
            Arity::AtLeast(expected) if received < expected => Err(ArityError {
                expected,
                received,
                variadic: true,
            }),
            _ => Ok(()),
        }
    }
}

/// A Rust closure callable from scripts.
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    arity: Arity,
    invoke: Rc<Invoke>,
    /// Raw functions throw an Error-tagged return value instead of returning it.
    throws_errors: bool,
}

impl HostFunction {
    /// Wrap a closure taking up to eight convertible arguments.
    ///
    /// ```ignore
    /// let add = HostFunction::new("add", |a: i32, b: i32| a + b);
    /// ```
    pub fn new<Args, F>(name: impl Into<String>, function: F) -> Self
    where
        F: IntoHostFn<Args>,
    {
        Self {
            name: name.into(),
            arity: Arity::Exact(F::ARITY),
            invoke: function.into_invoke(),
            throws_errors: false,
        }
    }

    /// Wrap a closure whose last parameter is a `Vec<T>` collecting every
    /// argument past the fixed ones.
    pub fn variadic<Args, F>(name: impl Into<String>, function: F) -> Self
    where
        F: IntoVariadicHostFn<Args>,
    {
        Self {
            name: name.into(),
            arity: Arity::AtLeast(F::FIXED),
            invoke: function.into_invoke(),
            throws_errors: false,
        }
    }

    /// Wrap a closure that works on the raw call. No arity check is made.
    pub fn raw<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&CallContext) -> Result<JsValue, BridgeError> + 'static,
    {
        Self {
            name: name.into(),
            arity: Arity::Any,
            invoke: Rc::new(function),
            throws_errors: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The same function under another name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create the script function in `env`.
    pub fn to_function(&self, env: &Env) -> Result<JsFunction, BridgeError> {
        let function = self.clone();
        let callback: NativeCallback =
            Rc::new(move |env: &Env, info: CallbackInfo| function.dispatch(env, info));
        let raw = env.create_function(&self.name, callback);
        Ok(JsFunction::from_value_unchecked(JsValue::from_raw(env, raw)))
    }

    fn dispatch(&self, env: &Env, info: CallbackInfo) -> Option<RawValue> {
        let context = CallContext {
            env: env.clone(),
            this: JsValue::from_raw(env, info.this),
            args: info
                .args
                .into_iter()
                .map(|raw| JsValue::from_raw(env, raw))
                .collect(),
        };

        let outcome = match self.arity.check(context.len()) {
            Ok(()) => catch_unwind(AssertUnwindSafe(|| (self.invoke)(&context))).unwrap_or_else(
                |payload| {
                    let err = BridgeError::from_panic(payload);
                    error!("host function '{}' panicked: {}", self.name, err);
                    Err(err)
                },
            ),
            Err(err) => Err(err.into()),
        };

        match outcome {
            Ok(value) if self.throws_errors && matches!(value.kind(), Ok(ValueKind::Error)) => {
                throw_value(env, value.raw());
                None
            }
            Ok(value) => Some(value.raw()),
            Err(err) => {
                throw_bridge_error(env, &err);
                None
            }
        }
    }
}

fn throw_value(env: &Env, value: RawValue) {
    if let Err(status) = env.throw(value) {
        error!("failed to throw from host function: {}", status);
    }
}

/// Throw `err` unless the callee already left an exception pending.
pub(crate) fn throw_bridge_error(env: &Env, err: &BridgeError) {
    if env.is_exception_pending() {
        return;
    }
    match JsError::from_bridge_error(env, err) {
        Ok(error) => throw_value(env, error.raw()),
        Err(create_err) => error!("failed to build script error for '{}': {}", err, create_err),
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

impl Serialize for HostFunction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        magic::serialize_function(self, serializer)
    }
}

/// `serialize_with` helper for `Option<HostFunction>` fields: an absent
/// callback becomes `undefined` instead of `null`.
///
/// ```ignore
/// #[derive(Serialize)]
/// struct Hooks {
///     #[serde(serialize_with = "jsbridge::optional_function")]
///     on_close: Option<HostFunction>,
/// }
/// ```
pub fn optional_function<S>(function: &Option<HostFunction>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match function {
        Some(function) => magic::serialize_function(function, serializer),
        None => serializer.serialize_newtype_struct(magic::FUNCTION_TOKEN, &()),
    }
}

/// Convert an optional callback; an absent one becomes `undefined`.
pub fn wrap_optional(env: &Env, function: Option<&HostFunction>) -> Result<JsValue, BridgeError> {
    match function {
        Some(function) => Ok(function.to_function(env)?.into()),
        None => Ok(JsValue::undefined(env)),
    }
}

/// Closures usable with [`HostFunction::new`].
pub trait IntoHostFn<Args> {
    const ARITY: usize;

    fn into_invoke(self) -> Rc<Invoke>;
}

/// Closures usable with [`HostFunction::variadic`].
pub trait IntoVariadicHostFn<Args> {
    /// Parameters before the trailing `Vec<T>`.
    const FIXED: usize;

    fn into_invoke(self) -> Rc<Invoke>;
}

macro_rules! impl_into_host_fn {
    ($count:expr; $($arg:ident $index:tt),*) => {
        impl<F, R, $($arg,)*> IntoHostFn<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + 'static,
            R: HostReturn,
            $($arg: DeserializeOwned,)*
        {
            const ARITY: usize = $count;

            fn into_invoke(self) -> Rc<Invoke> {
                Rc::new(move |context: &CallContext| {
                    let result = (self)($(from_js::<$arg>(&context.arg($index))?),*);
                    result.into_js(context.env())
                })
            }
        }

        impl<F, R, T, $($arg,)*> IntoVariadicHostFn<($($arg,)* Vec<T>,)> for F
        where
            F: Fn($($arg,)* Vec<T>) -> R + 'static,
            R: HostReturn,
            T: DeserializeOwned,
            $($arg: DeserializeOwned,)*
        {
            const FIXED: usize = $count;

            fn into_invoke(self) -> Rc<Invoke> {
                Rc::new(move |context: &CallContext| {
                    let rest = context.args()[$count..]
                        .iter()
                        .map(from_js::<T>)
                        .collect::<Result<Vec<T>, _>>()?;
                    let result = (self)($(from_js::<$arg>(&context.arg($index))?,)* rest);
                    result.into_js(context.env())
                })
            }
        }
    };
}

impl_into_host_fn!(0;);
impl_into_host_fn!(1; A0 0);
impl_into_host_fn!(2; A0 0, A1 1);
impl_into_host_fn!(3; A0 0, A1 1, A2 2);
impl_into_host_fn!(4; A0 0, A1 1, A2 2, A3 3);
impl_into_host_fn!(5; A0 0, A1 1, A2 2, A3 3, A4 4);
impl_into_host_fn!(6; A0 0, A1 1, A2 2, A3 3, A4 4, A5 5);
impl_into_host_fn!(7; A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6);
impl_into_host_fn!(8; A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7);

/// What a host function may return.
pub trait HostReturn {
    fn into_js(self, env: &Env) -> Result<JsValue, BridgeError>;
}

impl<R, E> HostReturn for Result<R, E>
where
    R: HostReturn,
    E: Into<BridgeError>,
{
    fn into_js(self, env: &Env) -> Result<JsValue, BridgeError> {
        match self {
            Ok(value) => value.into_js(env),
            Err(err) => Err(err.into()),
        }
    }
}

macro_rules! host_return_via_serde {
    ($($ty:ty),* $(,)?) => {
        $(
            impl HostReturn for $ty {
                fn into_js(self, env: &Env) -> Result<JsValue, BridgeError> {
                    to_js(env, &self)
                }
            }
        )*
    };
}

host_return_via_serde!(
    (),
    bool,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    char,
    String,
    &'static str,
    Date,
    AnyValue,
    serde_json::Value,
    HostFunction,
    JsValue,
    JsString,
    JsNumber,
    JsBigInt,
    JsBoolean,
    JsSymbol,
    JsDate,
    JsObject,
    JsArray,
    JsFunction,
    JsError,
    JsPromise,
    JsBuffer,
    JsArrayBuffer,
    JsTypedArray,
    JsDataView,
    JsExternal,
);

impl<T: Serialize> HostReturn for Vec<T> {
    fn into_js(self, env: &Env) -> Result<JsValue, BridgeError> {
        to_js(env, &self)
    }
}

impl<T: Serialize> HostReturn for Option<T> {
    fn into_js(self, env: &Env) -> Result<JsValue, BridgeError> {
        to_js(env, &self)
    }
}

impl<T: Serialize> HostReturn for Box<T> {
    fn into_js(self, env: &Env) -> Result<JsValue, BridgeError> {
        to_js(env, &*self)
    }
}

impl<K: Serialize, V: Serialize, S: BuildHasher> HostReturn for HashMap<K, V, S> {
    fn into_js(self, env: &Env) -> Result<JsValue, BridgeError> {
        to_js(env, &self)
    }
}

impl<K: Serialize, V: Serialize> HostReturn for BTreeMap<K, V> {
    fn into_js(self, env: &Env) -> Result<JsValue, BridgeError> {
        to_js(env, &self)
    }
}

impl<K: Serialize, V: Serialize, S: BuildHasher> HostReturn for IndexMap<K, V, S> {
    fn into_js(self, env: &Env) -> Result<JsValue, BridgeError> {
        to_js(env, &self)
    }
}

macro_rules! host_return_tuple {
    ($($name:ident),+) => {
        impl<$($name: Serialize),+> HostReturn for ($($name,)+) {
            fn into_js(self, env: &Env) -> Result<JsValue, BridgeError> {
                to_js(env, &self)
            }
        }
    };
}

host_return_tuple!(A, B);
host_return_tuple!(A, B, C);
host_return_tuple!(A, B, C, D);
host_return_tuple!(A, B, C, D, E);
host_return_tuple!(A, B, C, D, E, F);
