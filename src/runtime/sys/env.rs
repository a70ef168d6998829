//! Engine context: value heap, exception state and object model.

use super::async_work::{WorkEntry, WorkPool};
use super::heap::{
    array_index, number_to_string, CallbackInfo, Heap, HeapObject, NativeCallback, ObjectClass,
    PromiseState, RawValue, Slot, TypedArrayType, ValueType,
};
use super::status::{Status, SysResult};
use super::threadsafe::TsfnEntry;
use super::{EventSink, LoopEvent};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_ENV_ID: AtomicU32 = AtomicU32::new(1);

/// Options fixed at environment creation.
#[derive(Debug, Clone)]
pub struct EnvOptions {
    pub async_work_threads: usize,
    pub default_max_queue_size: usize,
    pub max_conversion_depth: usize,
    pub max_conversion_bytes: usize,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            async_work_threads: 4,
            default_max_queue_size: 0,
            max_conversion_depth: 100,
            max_conversion_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Capability to settle one promise. Consumed by resolve/reject.
///
/// The promise stays rooted until it is settled.
#[derive(Debug)]
pub struct Deferred {
    pub(crate) promise: RawValue,
    pub(crate) reference: Reference,
}

/// Handle to a persistent reference created by [`Env::create_reference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference(u64);

struct ReferenceEntry {
    value: RawValue,
    count: u32,
}

/// Scope bounding the lifetime of values allocated while it is open.
///
/// On drop, values allocated inside the scope are reclaimed unless they are
/// reachable from the global object, a strong reference, a pending or
/// uncaught exception, a live threadsafe function, a value outside the scope
/// or a value passed to [`escape`](HandleScope::escape). Scopes nest and must
/// be dropped innermost first.
pub struct HandleScope<'a> {
    env: &'a Env,
    depth: usize,
}

impl HandleScope<'_> {
    /// Keep `value` alive past this scope by handing it to the enclosing one.
    pub fn escape(&self, value: RawValue) -> RawValue {
        if let Ok(mut heap) = self.env.inner.heap.try_borrow_mut() {
            heap.escape(value);
        }
        value
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        self.env.close_handle_scope(self.depth);
    }
}

pub(crate) struct EnvInner {
    pub(super) id: u32,
    pub(super) heap: RefCell<Heap>,
    pub(super) global: RawValue,
    pub(super) exception: RefCell<Option<RawValue>>,
    pub(super) uncaught: RefCell<Vec<RawValue>>,
    pub(super) instance_data: RefCell<Option<Rc<dyn Any>>>,
    pub(super) bridge_data: RefCell<Option<Rc<dyn Any>>>,
    references: RefCell<HashMap<u64, ReferenceEntry>>,
    next_reference: Cell<u64>,
    pub(super) options: EnvOptions,
    pub(super) sink: Arc<dyn EventSink>,
    pub(super) pool: RefCell<Option<WorkPool>>,
    pub(super) works: RefCell<HashMap<u64, WorkEntry>>,
    pub(super) next_work: Cell<u64>,
    pub(super) tsfns: RefCell<HashMap<u64, TsfnEntry>>,
}

/// Handle to one single-threaded engine context.
///
/// Cloning is cheap and yields the same context. Not `Send`: every value
/// operation must happen on the thread that owns the engine.
#[derive(Clone)]
pub struct Env {
    pub(super) inner: Rc<EnvInner>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").field("id", &self.inner.id).finish()
    }
}

impl Env {
    pub fn new(options: EnvOptions, sink: Arc<dyn EventSink>) -> Self {
        let id = NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed);
        let mut heap = Heap::new(id);
        let global = heap.alloc(Slot::Object(HeapObject::new(ObjectClass::Plain)));
        Self {
            inner: Rc::new(EnvInner {
                id,
                heap: RefCell::new(heap),
                global,
                exception: RefCell::new(None),
                uncaught: RefCell::new(Vec::new()),
                instance_data: RefCell::new(None),
                bridge_data: RefCell::new(None),
                references: RefCell::new(HashMap::new()),
                next_reference: Cell::new(1),
                options,
                sink,
                pool: RefCell::new(None),
                works: RefCell::new(HashMap::new()),
                next_work: Cell::new(1),
                tsfns: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn options(&self) -> &EnvOptions {
        &self.inner.options
    }

    pub fn same_env(&self, other: &Env) -> bool {
        self.inner.id == other.inner.id
    }

    /// Whether `value` belongs to this environment and is still live.
    pub(crate) fn owns(&self, value: RawValue) -> bool {
        value.env == self.inner.id && self.inner.heap.borrow().contains(value)
    }

    fn alloc(&self, slot: Slot) -> RawValue {
        self.inner.heap.borrow_mut().alloc(slot)
    }

    fn alloc_object(&self, class: ObjectClass) -> RawValue {
        self.alloc(Slot::Object(HeapObject::new(class)))
    }

    // Handle scopes and references

    pub fn open_handle_scope(&self) -> HandleScope<'_> {
        let mut heap = self.inner.heap.borrow_mut();
        heap.open_frame();
        HandleScope {
            env: self,
            depth: heap.depth(),
        }
    }

    fn close_handle_scope(&self, depth: usize) {
        let Some(roots) = self.roots() else {
            tracing::warn!(env = self.inner.id, "handle scope closed while engine state is borrowed");
            return;
        };
        let Ok(mut heap) = self.inner.heap.try_borrow_mut() else {
            tracing::warn!(env = self.inner.id, "handle scope closed while the heap is borrowed");
            return;
        };
        if heap.depth() != depth {
            tracing::warn!(
                env = self.inner.id,
                expected = depth,
                actual = heap.depth(),
                "handle scopes closed out of order"
            );
        }
        let freed = heap.close_frame(&roots);
        if freed > 0 {
            tracing::trace!(env = self.inner.id, freed, "reclaimed values");
        }
    }

    /// Values the collector must keep regardless of scope. `None` while any
    /// of the root sets is being mutated.
    fn roots(&self) -> Option<Vec<RawValue>> {
        let mut roots = vec![self.inner.global];
        roots.extend(*self.inner.exception.try_borrow().ok()?);
        roots.extend(self.inner.uncaught.try_borrow().ok()?.iter().copied());
        roots.extend(
            self.inner
                .references
                .try_borrow()
                .ok()?
                .values()
                .filter(|entry| entry.count > 0)
                .map(|entry| entry.value),
        );
        roots.extend(
            self.inner
                .tsfns
                .try_borrow()
                .ok()?
                .values()
                .filter_map(|entry| entry.rooted()),
        );
        Some(roots)
    }

    /// Number of live values in the heap.
    pub fn live_values(&self) -> usize {
        self.inner.heap.borrow().live()
    }

    /// Create a reference to `value`. A count above zero keeps the value
    /// alive; at zero the reference is weak.
    pub fn create_reference(&self, value: RawValue, initial_count: u32) -> SysResult<Reference> {
        if !self.owns(value) {
            return Err(Status::InvalidArg);
        }
        let id = self.inner.next_reference.get();
        self.inner.next_reference.set(id + 1);
        self.inner.references.borrow_mut().insert(
            id,
            ReferenceEntry {
                value,
                count: initial_count,
            },
        );
        Ok(Reference(id))
    }

    pub fn reference_ref(&self, reference: Reference) -> SysResult<u32> {
        let mut references = self.inner.references.borrow_mut();
        let entry = references.get_mut(&reference.0).ok_or(Status::InvalidArg)?;
        entry.count += 1;
        Ok(entry.count)
    }

    pub fn reference_unref(&self, reference: Reference) -> SysResult<u32> {
        let mut references = self.inner.references.borrow_mut();
        let entry = references.get_mut(&reference.0).ok_or(Status::InvalidArg)?;
        if entry.count == 0 {
            return Err(Status::GenericFailure);
        }
        entry.count -= 1;
        Ok(entry.count)
    }

    /// The referenced value, or `None` once a weak reference's value was reclaimed.
    pub fn get_reference_value(&self, reference: Reference) -> SysResult<Option<RawValue>> {
        let value = self
            .inner
            .references
            .borrow()
            .get(&reference.0)
            .map(|entry| entry.value)
            .ok_or(Status::InvalidArg)?;
        Ok(self.owns(value).then_some(value))
    }

    pub fn delete_reference(&self, reference: Reference) -> SysResult<()> {
        self.inner
            .references
            .borrow_mut()
            .remove(&reference.0)
            .map(|_| ())
            .ok_or(Status::InvalidArg)
    }

    // Singletons and global

    pub fn get_undefined(&self) -> RawValue {
        self.inner.heap.borrow().raw(Heap::UNDEFINED)
    }

    pub fn get_null(&self) -> RawValue {
        self.inner.heap.borrow().raw(Heap::NULL)
    }

    pub fn get_boolean(&self, value: bool) -> RawValue {
        let index = if value { Heap::TRUE } else { Heap::FALSE };
        self.inner.heap.borrow().raw(index)
    }

    pub fn get_global(&self) -> RawValue {
        self.inner.global
    }

    pub fn typeof_value(&self, value: RawValue) -> SysResult<ValueType> {
        self.inner.heap.borrow().type_of(value)
    }

    // Primitives

    pub fn get_value_bool(&self, value: RawValue) -> SysResult<bool> {
        match self.inner.heap.borrow().get(value)? {
            Slot::Boolean(b) => Ok(*b),
            _ => Err(Status::BooleanExpected),
        }
    }

    pub fn create_double(&self, value: f64) -> RawValue {
        self.alloc(Slot::Number(value))
    }

    pub fn create_int32(&self, value: i32) -> RawValue {
        self.alloc(Slot::Number(value as f64))
    }

    pub fn create_uint32(&self, value: u32) -> RawValue {
        self.alloc(Slot::Number(value as f64))
    }

    pub fn create_int64(&self, value: i64) -> RawValue {
        self.alloc(Slot::Number(value as f64))
    }

    pub fn get_value_double(&self, value: RawValue) -> SysResult<f64> {
        match self.inner.heap.borrow().get(value)? {
            Slot::Number(n) => Ok(*n),
            _ => Err(Status::NumberExpected),
        }
    }

    pub fn get_value_int32(&self, value: RawValue) -> SysResult<i32> {
        let n = self.get_value_double(value)?;
        if !n.is_finite() {
            return Ok(0);
        }
        Ok((n.trunc() % 4_294_967_296.0) as i64 as i32)
    }

    pub fn get_value_uint32(&self, value: RawValue) -> SysResult<u32> {
        let n = self.get_value_double(value)?;
        if !n.is_finite() {
            return Ok(0);
        }
        Ok((n.trunc() % 4_294_967_296.0) as i64 as u32)
    }

    pub fn get_value_int64(&self, value: RawValue) -> SysResult<i64> {
        let n = self.get_value_double(value)?;
        if !n.is_finite() {
            return Ok(0);
        }
        Ok(n as i64)
    }

    pub fn create_bigint_int64(&self, value: i64) -> RawValue {
        self.alloc(Slot::BigInt(value as i128))
    }

    pub fn create_bigint_uint64(&self, value: u64) -> RawValue {
        self.alloc(Slot::BigInt(value as i128))
    }

    /// Create a bigint from a wide integer. Values outside the 64-bit signed or
    /// unsigned range are rejected.
    pub fn create_bigint_i128(&self, value: i128) -> SysResult<RawValue> {
        if value < i64::MIN as i128 || value > u64::MAX as i128 {
            return Err(Status::InvalidArg);
        }
        Ok(self.alloc(Slot::BigInt(value)))
    }

    fn bigint(&self, value: RawValue) -> SysResult<i128> {
        match self.inner.heap.borrow().get(value)? {
            Slot::BigInt(v) => Ok(*v),
            _ => Err(Status::BigintExpected),
        }
    }

    /// Returns the value truncated to `i64` and whether that was lossless.
    pub fn get_value_bigint_int64(&self, value: RawValue) -> SysResult<(i64, bool)> {
        let v = self.bigint(value)?;
        let lossless = v >= i64::MIN as i128 && v <= i64::MAX as i128;
        Ok((v as i64, lossless))
    }

    /// Returns the value truncated to `u64` and whether that was lossless.
    pub fn get_value_bigint_uint64(&self, value: RawValue) -> SysResult<(u64, bool)> {
        let v = self.bigint(value)?;
        let lossless = v >= 0 && v <= u64::MAX as i128;
        Ok((v as u64, lossless))
    }

    pub fn get_value_bigint_i128(&self, value: RawValue) -> SysResult<i128> {
        self.bigint(value)
    }

    pub fn create_string_utf8(&self, value: &str) -> RawValue {
        self.alloc(Slot::String(value.to_string()))
    }

    pub fn create_string_utf16(&self, value: &[u16]) -> RawValue {
        self.alloc(Slot::String(String::from_utf16_lossy(value)))
    }

    pub fn get_value_string_utf8(&self, value: RawValue) -> SysResult<String> {
        match self.inner.heap.borrow().get(value)? {
            Slot::String(s) => Ok(s.clone()),
            _ => Err(Status::StringExpected),
        }
    }

    pub fn get_value_string_utf16(&self, value: RawValue) -> SysResult<Vec<u16>> {
        match self.inner.heap.borrow().get(value)? {
            Slot::String(s) => Ok(s.encode_utf16().collect()),
            _ => Err(Status::StringExpected),
        }
    }

    pub fn create_symbol(&self, description: Option<&str>) -> RawValue {
        self.alloc(Slot::Symbol(description.map(str::to_string)))
    }

    pub fn create_external(&self, data: Rc<dyn Any>) -> RawValue {
        self.alloc(Slot::External(data))
    }

    pub fn get_value_external(&self, value: RawValue) -> SysResult<Rc<dyn Any>> {
        match self.inner.heap.borrow().get(value)? {
            Slot::External(data) => Ok(data.clone()),
            _ => Err(Status::InvalidArg),
        }
    }

    pub fn create_date(&self, millis: f64) -> RawValue {
        self.alloc_object(ObjectClass::Date(millis))
    }

    pub fn get_date_value(&self, value: RawValue) -> SysResult<f64> {
        match self.inner.heap.borrow().get(value)? {
            Slot::Object(HeapObject {
                class: ObjectClass::Date(ms),
                ..
            }) => Ok(*ms),
            _ => Err(Status::DateExpected),
        }
    }

    /// JS `String(value)` for the kinds this engine models.
    pub fn coerce_to_string(&self, value: RawValue) -> SysResult<String> {
        if self.is_array(value)? {
            let length = self.get_array_length(value)?;
            let mut parts = Vec::with_capacity(length as usize);
            for index in 0..length {
                let item = self.get_element(value, index)?;
                match self.typeof_value(item)? {
                    ValueType::Undefined | ValueType::Null => parts.push(String::new()),
                    _ => parts.push(self.coerce_to_string(item)?),
                }
            }
            return Ok(parts.join(","));
        }
        let heap = self.inner.heap.borrow();
        let text = match heap.get(value)? {
            Slot::Undefined => "undefined".to_string(),
            Slot::Null => "null".to_string(),
            Slot::Boolean(b) => b.to_string(),
            Slot::Number(n) => number_to_string(*n),
            Slot::BigInt(v) => v.to_string(),
            Slot::String(s) => s.clone(),
            Slot::Symbol(desc) => format!("Symbol({})", desc.as_deref().unwrap_or("")),
            Slot::External(_) => "[object External]".to_string(),
            Slot::Object(object) => match &object.class {
                ObjectClass::Error => {
                    let read = |key: &str| -> Option<String> {
                        let raw = object.props.get(key)?;
                        match heap.get(*raw).ok()? {
                            Slot::String(s) => Some(s.clone()),
                            _ => None,
                        }
                    };
                    let name = read("name").unwrap_or_else(|| "Error".to_string());
                    match read("message") {
                        Some(message) if !message.is_empty() => format!("{}: {}", name, message),
                        _ => name,
                    }
                }
                ObjectClass::Function { name, .. } => {
                    format!("function {}() {{ [native code] }}", name)
                }
                ObjectClass::Date(ms) => number_to_string(*ms),
                ObjectClass::Promise(_) => "[object Promise]".to_string(),
                _ => "[object Object]".to_string(),
            },
        };
        Ok(text)
    }

    // Objects and arrays

    pub fn create_object(&self) -> RawValue {
        self.alloc_object(ObjectClass::Plain)
    }

    pub fn create_array(&self) -> RawValue {
        self.alloc_object(ObjectClass::Array(Vec::new()))
    }

    pub fn create_array_with_length(&self, length: usize) -> RawValue {
        let undefined = self.get_undefined();
        self.alloc_object(ObjectClass::Array(vec![undefined; length]))
    }

    pub fn get_array_length(&self, array: RawValue) -> SysResult<u32> {
        match &self.inner.heap.borrow().object(array)?.class {
            ObjectClass::Array(items) => Ok(items.len() as u32),
            _ => Err(Status::ArrayExpected),
        }
    }

    pub fn get_element(&self, object: RawValue, index: u32) -> SysResult<RawValue> {
        self.get_named_property(object, &index.to_string())
    }

    pub fn set_element(&self, object: RawValue, index: u32, value: RawValue) -> SysResult<()> {
        self.set_named_property(object, &index.to_string(), value)
    }

    pub fn has_element(&self, object: RawValue, index: u32) -> SysResult<bool> {
        self.has_named_property(object, &index.to_string())
    }

    pub fn delete_element(&self, object: RawValue, index: u32) -> SysResult<bool> {
        self.delete_named_property(object, &index.to_string())
    }

    pub fn set_property(&self, object: RawValue, key: RawValue, value: RawValue) -> SysResult<()> {
        let key = self.inner.heap.borrow().property_key(key)?;
        self.set_named_property(object, &key, value)
    }

    pub fn get_property(&self, object: RawValue, key: RawValue) -> SysResult<RawValue> {
        let key = self.inner.heap.borrow().property_key(key)?;
        self.get_named_property(object, &key)
    }

    pub fn has_property(&self, object: RawValue, key: RawValue) -> SysResult<bool> {
        let key = self.inner.heap.borrow().property_key(key)?;
        self.has_named_property(object, &key)
    }

    pub fn has_own_property(&self, object: RawValue, key: RawValue) -> SysResult<bool> {
        self.has_property(object, key)
    }

    pub fn delete_property(&self, object: RawValue, key: RawValue) -> SysResult<bool> {
        let key = self.inner.heap.borrow().property_key(key)?;
        self.delete_named_property(object, &key)
    }

    pub fn set_named_property(&self, object: RawValue, key: &str, value: RawValue) -> SysResult<()> {
        if !self.owns(value) {
            return Err(Status::InvalidArg);
        }
        let undefined = self.get_undefined();
        let mut heap = self.inner.heap.borrow_mut();
        let target = heap.object_mut(object)?;
        if target.frozen {
            return Err(Status::GenericFailure);
        }
        if let ObjectClass::Array(items) = &mut target.class {
            if let Some(index) = array_index(key) {
                if index >= items.len() {
                    if target.sealed {
                        return Err(Status::GenericFailure);
                    }
                    items.resize(index + 1, undefined);
                }
                items[index] = value;
                return Ok(());
            }
        }
        if target.sealed && !target.props.contains_key(key) {
            return Err(Status::GenericFailure);
        }
        target.props.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get_named_property(&self, object: RawValue, key: &str) -> SysResult<RawValue> {
        enum Lookup {
            Found(RawValue),
            Number(u32),
            Missing,
        }
        let lookup = {
            let heap = self.inner.heap.borrow();
            let target = heap.object(object)?;
            let (index, length) = match &target.class {
                ObjectClass::Array(items) => match array_index(key) {
                    Some(index) => {
                        let item = items.get(index).copied();
                        return Ok(item.unwrap_or(heap.raw(Heap::UNDEFINED)));
                    }
                    None => (None, Some(items.len())),
                },
                ObjectClass::Buffer(bytes) => (
                    array_index(key).map(|index| bytes.get(index).copied()),
                    Some(bytes.len()),
                ),
                _ => (None, None),
            };
            match (index, target.props.get(key), length) {
                (Some(Some(byte)), _, _) => Lookup::Number(byte as u32),
                (Some(None), _, _) => Lookup::Missing,
                (None, Some(found), _) => Lookup::Found(*found),
                (None, None, Some(length)) if key == "length" => Lookup::Number(length as u32),
                (None, None, _) => Lookup::Missing,
            }
        };
        Ok(match lookup {
            Lookup::Found(value) => value,
            Lookup::Number(n) => self.create_uint32(n),
            Lookup::Missing => self.get_undefined(),
        })
    }

    pub fn has_named_property(&self, object: RawValue, key: &str) -> SysResult<bool> {
        let heap = self.inner.heap.borrow();
        let target = heap.object(object)?;
        match &target.class {
            ObjectClass::Array(items) => {
                if let Some(index) = array_index(key) {
                    return Ok(index < items.len());
                }
                if key == "length" {
                    return Ok(true);
                }
            }
            ObjectClass::Buffer(bytes) => {
                if let Some(index) = array_index(key) {
                    return Ok(index < bytes.len());
                }
            }
            _ => {}
        }
        Ok(target.props.contains_key(key))
    }

    pub fn delete_named_property(&self, object: RawValue, key: &str) -> SysResult<bool> {
        let undefined = self.get_undefined();
        let mut heap = self.inner.heap.borrow_mut();
        let target = heap.object_mut(object)?;
        if target.frozen || target.sealed {
            return Ok(false);
        }
        if let ObjectClass::Array(items) = &mut target.class {
            if let Some(index) = array_index(key) {
                if index < items.len() {
                    items[index] = undefined;
                }
                return Ok(true);
            }
        }
        target.props.shift_remove(key);
        Ok(true)
    }

    /// Own enumerable property names in JS order: array indices, then insertion order.
    pub fn get_property_names(&self, object: RawValue) -> SysResult<RawValue> {
        let names = self.property_names(object)?;
        let items: Vec<RawValue> = names.iter().map(|n| self.create_string_utf8(n)).collect();
        Ok(self.alloc_object(ObjectClass::Array(items)))
    }

    pub(crate) fn property_names(&self, object: RawValue) -> SysResult<Vec<String>> {
        let heap = self.inner.heap.borrow();
        let target = heap.object(object)?;
        let mut names = Vec::new();
        match &target.class {
            ObjectClass::Array(items) => names.extend((0..items.len()).map(|i| i.to_string())),
            ObjectClass::Buffer(bytes) => names.extend((0..bytes.len()).map(|i| i.to_string())),
            _ => {}
        }
        names.extend(target.props.keys().cloned());
        Ok(names)
    }

    pub fn object_freeze(&self, object: RawValue) -> SysResult<()> {
        let mut heap = self.inner.heap.borrow_mut();
        let target = heap.object_mut(object)?;
        target.frozen = true;
        target.sealed = true;
        Ok(())
    }

    pub fn object_seal(&self, object: RawValue) -> SysResult<()> {
        let mut heap = self.inner.heap.borrow_mut();
        heap.object_mut(object)?.sealed = true;
        Ok(())
    }

    pub fn strict_equals(&self, lhs: RawValue, rhs: RawValue) -> SysResult<bool> {
        let heap = self.inner.heap.borrow();
        let equal = match (heap.get(lhs)?, heap.get(rhs)?) {
            (Slot::Undefined, Slot::Undefined) | (Slot::Null, Slot::Null) => true,
            (Slot::Boolean(a), Slot::Boolean(b)) => a == b,
            (Slot::Number(a), Slot::Number(b)) => a == b,
            (Slot::BigInt(a), Slot::BigInt(b)) => a == b,
            (Slot::String(a), Slot::String(b)) => a == b,
            _ => lhs == rhs,
        };
        Ok(equal)
    }

    // Structural predicates

    fn class_matches(&self, value: RawValue, check: fn(&ObjectClass) -> bool) -> SysResult<bool> {
        match self.inner.heap.borrow().get(value)? {
            Slot::Object(object) => Ok(check(&object.class)),
            _ => Ok(false),
        }
    }

    pub fn is_array(&self, value: RawValue) -> SysResult<bool> {
        self.class_matches(value, |c| matches!(c, ObjectClass::Array(_)))
    }

    pub fn is_arraybuffer(&self, value: RawValue) -> SysResult<bool> {
        self.class_matches(value, |c| matches!(c, ObjectClass::ArrayBuffer(_)))
    }

    pub fn is_buffer(&self, value: RawValue) -> SysResult<bool> {
        self.class_matches(value, |c| matches!(c, ObjectClass::Buffer(_)))
    }

    pub fn is_date(&self, value: RawValue) -> SysResult<bool> {
        self.class_matches(value, |c| matches!(c, ObjectClass::Date(_)))
    }

    pub fn is_error(&self, value: RawValue) -> SysResult<bool> {
        self.class_matches(value, |c| matches!(c, ObjectClass::Error))
    }

    pub fn is_typedarray(&self, value: RawValue) -> SysResult<bool> {
        self.class_matches(value, |c| matches!(c, ObjectClass::TypedArray { .. }))
    }

    pub fn is_dataview(&self, value: RawValue) -> SysResult<bool> {
        self.class_matches(value, |c| matches!(c, ObjectClass::DataView { .. }))
    }

    pub fn is_promise(&self, value: RawValue) -> SysResult<bool> {
        self.class_matches(value, |c| matches!(c, ObjectClass::Promise(_)))
    }

    // Binary data

    pub fn create_buffer_copy(&self, data: &[u8]) -> RawValue {
        self.alloc_object(ObjectClass::Buffer(data.to_vec()))
    }

    pub fn get_buffer_info(&self, value: RawValue) -> SysResult<Vec<u8>> {
        match &self.inner.heap.borrow().object(value)?.class {
            ObjectClass::Buffer(bytes) => Ok(bytes.clone()),
            _ => Err(Status::InvalidArg),
        }
    }

    pub fn create_arraybuffer(&self, data: &[u8]) -> RawValue {
        self.alloc_object(ObjectClass::ArrayBuffer(data.to_vec()))
    }

    pub fn get_arraybuffer_info(&self, value: RawValue) -> SysResult<Vec<u8>> {
        match &self.inner.heap.borrow().object(value)?.class {
            ObjectClass::ArrayBuffer(bytes) => Ok(bytes.clone()),
            _ => Err(Status::ArraybufferExpected),
        }
    }

    fn arraybuffer_len(&self, value: RawValue) -> SysResult<usize> {
        match &self.inner.heap.borrow().object(value)?.class {
            ObjectClass::ArrayBuffer(bytes) => Ok(bytes.len()),
            _ => Err(Status::ArraybufferExpected),
        }
    }

    fn arraybuffer_slice(&self, buffer: RawValue, offset: usize, len: usize) -> SysResult<Vec<u8>> {
        let bytes = self.get_arraybuffer_info(buffer)?;
        bytes
            .get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .ok_or(Status::InvalidArg)
    }

    pub fn create_typedarray(
        &self,
        kind: TypedArrayType,
        length: usize,
        arraybuffer: RawValue,
        byte_offset: usize,
    ) -> SysResult<RawValue> {
        let size = kind.element_size();
        if byte_offset % size != 0 {
            return Err(Status::InvalidArg);
        }
        if byte_offset + length * size > self.arraybuffer_len(arraybuffer)? {
            return Err(Status::InvalidArg);
        }
        Ok(self.alloc_object(ObjectClass::TypedArray {
            kind,
            length,
            buffer: arraybuffer,
            byte_offset,
        }))
    }

    /// Returns `(type, length, bytes, arraybuffer, byte_offset)`.
    pub fn get_typedarray_info(
        &self,
        value: RawValue,
    ) -> SysResult<(TypedArrayType, usize, Vec<u8>, RawValue, usize)> {
        let (kind, length, buffer, byte_offset) = match &self.inner.heap.borrow().object(value)?.class
        {
            ObjectClass::TypedArray {
                kind,
                length,
                buffer,
                byte_offset,
            } => (*kind, *length, *buffer, *byte_offset),
            _ => return Err(Status::InvalidArg),
        };
        let bytes = self.arraybuffer_slice(buffer, byte_offset, length * kind.element_size())?;
        Ok((kind, length, bytes, buffer, byte_offset))
    }

    pub fn create_dataview(
        &self,
        byte_length: usize,
        arraybuffer: RawValue,
        byte_offset: usize,
    ) -> SysResult<RawValue> {
        if byte_offset + byte_length > self.arraybuffer_len(arraybuffer)? {
            return Err(Status::InvalidArg);
        }
        Ok(self.alloc_object(ObjectClass::DataView {
            byte_length,
            buffer: arraybuffer,
            byte_offset,
        }))
    }

    /// Returns `(byte_length, bytes, arraybuffer, byte_offset)`.
    pub fn get_dataview_info(&self, value: RawValue) -> SysResult<(usize, Vec<u8>, RawValue, usize)> {
        let (byte_length, buffer, byte_offset) = match &self.inner.heap.borrow().object(value)?.class {
            ObjectClass::DataView {
                byte_length,
                buffer,
                byte_offset,
            } => (*byte_length, *buffer, *byte_offset),
            _ => return Err(Status::InvalidArg),
        };
        let bytes = self.arraybuffer_slice(buffer, byte_offset, byte_length)?;
        Ok((byte_length, bytes, buffer, byte_offset))
    }

    // Errors and exceptions

    fn create_error_object(
        &self,
        name: &str,
        code: Option<RawValue>,
        message: RawValue,
    ) -> SysResult<RawValue> {
        self.get_value_string_utf8(message)?;
        if let Some(code) = code {
            self.get_value_string_utf8(code)?;
        }
        let error = self.alloc_object(ObjectClass::Error);
        let name = self.create_string_utf8(name);
        self.set_named_property(error, "name", name)?;
        self.set_named_property(error, "message", message)?;
        if let Some(code) = code {
            self.set_named_property(error, "code", code)?;
        }
        Ok(error)
    }

    pub fn create_error(&self, code: Option<RawValue>, message: RawValue) -> SysResult<RawValue> {
        self.create_error_object("Error", code, message)
    }

    pub fn create_type_error(&self, code: Option<RawValue>, message: RawValue) -> SysResult<RawValue> {
        self.create_error_object("TypeError", code, message)
    }

    pub fn create_range_error(&self, code: Option<RawValue>, message: RawValue) -> SysResult<RawValue> {
        self.create_error_object("RangeError", code, message)
    }

    pub fn throw(&self, error: RawValue) -> SysResult<()> {
        if !self.owns(error) {
            return Err(Status::InvalidArg);
        }
        let mut slot = self.inner.exception.borrow_mut();
        if slot.is_some() {
            return Err(Status::PendingException);
        }
        *slot = Some(error);
        Ok(())
    }

    pub fn throw_error(&self, code: Option<&str>, message: &str) -> SysResult<()> {
        let code = code.map(|c| self.create_string_utf8(c));
        let message = self.create_string_utf8(message);
        let error = self.create_error(code, message)?;
        self.throw(error)
    }

    pub fn is_exception_pending(&self) -> bool {
        self.inner.exception.borrow().is_some()
    }

    pub fn get_and_clear_last_exception(&self) -> Option<RawValue> {
        self.inner.exception.borrow_mut().take()
    }

    /// Move a pending exception that no script caller will observe to the uncaught list.
    pub(crate) fn report_uncaught(&self) -> Option<RawValue> {
        let exception = self.get_and_clear_last_exception()?;
        self.inner.uncaught.borrow_mut().push(exception);
        Some(exception)
    }

    pub fn take_uncaught_exceptions(&self) -> Vec<RawValue> {
        std::mem::take(&mut *self.inner.uncaught.borrow_mut())
    }

    // Promises

    pub fn create_promise(&self) -> (Deferred, RawValue) {
        let promise = self.alloc_object(ObjectClass::Promise(PromiseState::Pending));
        let id = self.inner.next_reference.get();
        self.inner.next_reference.set(id + 1);
        self.inner.references.borrow_mut().insert(
            id,
            ReferenceEntry {
                value: promise,
                count: 1,
            },
        );
        (
            Deferred {
                promise,
                reference: Reference(id),
            },
            promise,
        )
    }

    fn settle(&self, deferred: Deferred, state: PromiseState) -> SysResult<()> {
        let mut heap = self.inner.heap.borrow_mut();
        let settled = match &mut heap.object_mut(deferred.promise)?.class {
            ObjectClass::Promise(current @ PromiseState::Pending) => {
                *current = state;
                Ok(())
            }
            ObjectClass::Promise(_) => Err(Status::GenericFailure),
            _ => Err(Status::InvalidArg),
        };
        drop(heap);
        if settled.is_ok() {
            self.inner.references.borrow_mut().remove(&deferred.reference.0);
        }
        settled
    }

    pub fn resolve_deferred(&self, deferred: Deferred, value: RawValue) -> SysResult<()> {
        if !self.owns(value) {
            return Err(Status::InvalidArg);
        }
        self.settle(deferred, PromiseState::Fulfilled(value))
    }

    pub fn reject_deferred(&self, deferred: Deferred, reason: RawValue) -> SysResult<()> {
        if !self.owns(reason) {
            return Err(Status::InvalidArg);
        }
        self.settle(deferred, PromiseState::Rejected(reason))
    }

    pub fn promise_state(&self, promise: RawValue) -> SysResult<PromiseState> {
        match &self.inner.heap.borrow().object(promise)?.class {
            ObjectClass::Promise(state) => Ok(*state),
            _ => Err(Status::InvalidArg),
        }
    }

    // Functions

    pub fn create_function(&self, name: &str, callback: NativeCallback) -> RawValue {
        self.alloc_object(ObjectClass::Function {
            name: name.to_string(),
            callback,
        })
    }

    pub fn get_function_name(&self, function: RawValue) -> SysResult<String> {
        match &self.inner.heap.borrow().object(function)?.class {
            ObjectClass::Function { name, .. } => Ok(name.clone()),
            _ => Err(Status::FunctionExpected),
        }
    }

    /// Invoke `function` synchronously. If the callee leaves an exception
    /// pending the call fails with [`Status::PendingException`] and the
    /// exception stays retrievable.
    pub fn call_function(
        &self,
        recv: RawValue,
        function: RawValue,
        args: &[RawValue],
    ) -> SysResult<RawValue> {
        if self.is_exception_pending() {
            return Err(Status::PendingException);
        }
        if !self.owns(recv) || args.iter().any(|a| !self.owns(*a)) {
            return Err(Status::InvalidArg);
        }
        let callback = match &self.inner.heap.borrow().object(function) {
            Ok(HeapObject {
                class: ObjectClass::Function { callback, .. },
                ..
            }) => callback.clone(),
            Ok(_) | Err(Status::ObjectExpected) => return Err(Status::FunctionExpected),
            Err(status) => return Err(*status),
        };
        let info = CallbackInfo {
            this: recv,
            args: args.to_vec(),
        };
        let result = callback(self, info);
        if self.is_exception_pending() {
            return Err(Status::PendingException);
        }
        Ok(result.unwrap_or_else(|| self.get_undefined()))
    }

    // Instance data

    pub fn set_instance_data(&self, data: Rc<dyn Any>) {
        *self.inner.instance_data.borrow_mut() = Some(data);
    }

    pub fn get_instance_data(&self) -> Option<Rc<dyn Any>> {
        self.inner.instance_data.borrow().clone()
    }

    /// Slot reserved for the threadsafe bridge, separate from user instance data.
    pub(crate) fn bridge_data(&self) -> Option<Rc<dyn Any>> {
        self.inner.bridge_data.borrow().clone()
    }

    pub(crate) fn set_bridge_data(&self, data: Rc<dyn Any>) {
        *self.inner.bridge_data.borrow_mut() = Some(data);
    }

    // Event loop

    /// Run one event delivered by the engine loop.
    pub fn process_event(&self, event: LoopEvent) {
        match event {
            LoopEvent::Dispatch { tsfn, data } => self.dispatch_threadsafe_call(tsfn, data),
            LoopEvent::Finalize { tsfn } => self.finalize_threadsafe_function(tsfn),
            LoopEvent::Complete { work, status } => self.complete_async_work(work, status),
        }
    }

    /// Number of threadsafe functions and async works not yet torn down.
    pub fn outstanding_resources(&self) -> (usize, usize) {
        (
            self.inner.tsfns.borrow().len(),
            self.inner.works.borrow().len(),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Collects posted events so tests can pump them by hand.
    #[derive(Default)]
    pub(crate) struct QueueSink {
        pub(crate) events: Mutex<Vec<LoopEvent>>,
        pub(crate) alive: Mutex<Vec<bool>>,
    }

    impl EventSink for QueueSink {
        fn post(&self, event: LoopEvent) -> bool {
            self.events.lock().unwrap().push(event);
            true
        }

        fn keep_alive(&self, alive: bool) {
            self.alive.lock().unwrap().push(alive);
        }
    }

    pub(crate) fn test_env() -> (Env, Arc<QueueSink>) {
        let sink = Arc::new(QueueSink::default());
        (Env::new(EnvOptions::default(), sink.clone()), sink)
    }

    #[test]
    fn test_property_keys_are_stringified() {
        let (env, _) = test_env();
        let object = env.create_object();
        let key = env.create_int32(7);
        let value = env.create_string_utf8("seven");
        env.set_property(object, key, value).unwrap();
        assert!(env.has_named_property(object, "7").unwrap());
        let names = env.property_names(object).unwrap();
        assert_eq!(names, vec!["7".to_string()]);
    }

    #[test]
    fn test_array_grows_with_undefined() {
        let (env, _) = test_env();
        let array = env.create_array();
        let value = env.create_double(1.0);
        env.set_element(array, 2, value).unwrap();
        assert_eq!(env.get_array_length(array).unwrap(), 3);
        let hole = env.get_element(array, 0).unwrap();
        assert_eq!(env.typeof_value(hole).unwrap(), ValueType::Undefined);
    }

    #[test]
    fn test_frozen_object_rejects_writes() {
        let (env, _) = test_env();
        let object = env.create_object();
        env.object_freeze(object).unwrap();
        let value = env.get_null();
        assert_eq!(
            env.set_named_property(object, "a", value),
            Err(Status::GenericFailure)
        );
    }

    #[test]
    fn test_values_from_other_env_are_invalid() {
        let (env, _) = test_env();
        let (other, _) = test_env();
        let foreign = other.create_double(1.0);
        assert_eq!(env.get_value_double(foreign), Err(Status::InvalidArg));
    }

    #[test]
    fn test_bigint_lossless_flags() {
        let (env, _) = test_env();
        let big = env.create_bigint_uint64(u64::MAX);
        assert_eq!(env.get_value_bigint_uint64(big).unwrap(), (u64::MAX, true));
        assert!(!env.get_value_bigint_int64(big).unwrap().1);
        let negative = env.create_bigint_int64(-1);
        assert_eq!(env.get_value_bigint_int64(negative).unwrap(), (-1, true));
        assert!(!env.get_value_bigint_uint64(negative).unwrap().1);
    }

    #[test]
    fn test_call_function_reports_pending_exception() {
        let (env, _) = test_env();
        let thrower: NativeCallback = Rc::new(|env: &Env, _info| {
            let _ = env.throw_error(Some("E_TEST"), "nope");
            None
        });
        let function = env.create_function("thrower", thrower);
        let recv = env.get_undefined();
        assert_eq!(
            env.call_function(recv, function, &[]),
            Err(Status::PendingException)
        );
        let exception = env.get_and_clear_last_exception().unwrap();
        assert_eq!(env.coerce_to_string(exception).unwrap(), "Error: nope");
    }

    #[test]
    fn test_promise_settles_once() {
        let (env, _) = test_env();
        let (deferred, promise) = env.create_promise();
        let value = env.create_double(3.0);
        env.resolve_deferred(deferred, value).unwrap();
        assert_eq!(
            env.promise_state(promise).unwrap(),
            PromiseState::Fulfilled(value)
        );
        let again = Deferred {
            promise,
            reference: Reference(0),
        };
        assert_eq!(
            env.reject_deferred(again, value),
            Err(Status::GenericFailure)
        );
    }

    #[test]
    fn test_scope_reclaims_temporaries() {
        let (env, _) = test_env();
        let keep = env.create_object();
        let baseline = env.live_values();
        for round in 0..1_000 {
            let _scope = env.open_handle_scope();
            let items = env.create_array();
            for n in 0..5 {
                let item = env.create_int32(round + n);
                env.set_element(items, n as u32, item).unwrap();
            }
            if round == 999 {
                env.set_named_property(keep, "last", items).unwrap();
            }
        }
        // The kept array and its five elements.
        assert_eq!(env.live_values(), baseline + 6);
        let last = env.get_named_property(keep, "last").unwrap();
        assert_eq!(env.get_array_length(last).unwrap(), 5);
    }

    #[test]
    fn test_escaped_value_outlives_scope() {
        let (env, _) = test_env();
        let outer = env.open_handle_scope();
        let escaped = {
            let inner = env.open_handle_scope();
            let text = env.create_string_utf8("kept");
            env.create_string_utf8("dropped");
            inner.escape(text)
        };
        assert_eq!(env.get_value_string_utf8(escaped).unwrap(), "kept");
        drop(outer);
        assert_eq!(env.get_value_string_utf8(escaped), Err(Status::InvalidArg));
    }

    #[test]
    fn test_references_root_values_until_weak() {
        let (env, _) = test_env();
        let (strong, weak) = {
            let _scope = env.open_handle_scope();
            let strong = env.create_reference(env.create_double(1.0), 1).unwrap();
            let weak = env.create_reference(env.create_double(2.0), 0).unwrap();
            (strong, weak)
        };
        let value = env.get_reference_value(strong).unwrap().unwrap();
        assert_eq!(env.get_value_double(value).unwrap(), 1.0);
        assert_eq!(env.get_reference_value(weak).unwrap(), None);

        assert_eq!(env.reference_unref(strong).unwrap(), 0);
        drop(env.open_handle_scope());
        // Allocated with no scope open: survives even once weak.
        assert!(env.get_reference_value(strong).unwrap().is_some());
        env.delete_reference(strong).unwrap();
        assert_eq!(env.reference_ref(strong), Err(Status::InvalidArg));
    }

    #[test]
    fn test_pending_promise_is_rooted() {
        let (env, _) = test_env();
        let (deferred, promise) = {
            let _scope = env.open_handle_scope();
            env.create_promise()
        };
        assert!(env.is_promise(promise).unwrap());
        let value = env.get_boolean(true);
        env.resolve_deferred(deferred, value).unwrap();
    }

    #[test]
    fn test_typedarray_bounds_checked() {
        let (env, _) = test_env();
        let buffer = env.create_arraybuffer(&[0u8; 8]);
        assert!(env
            .create_typedarray(TypedArrayType::Int32, 2, buffer, 0)
            .is_ok());
        assert_eq!(
            env.create_typedarray(TypedArrayType::Int32, 3, buffer, 0),
            Err(Status::InvalidArg)
        );
        assert!(!env.is_typedarray(buffer).unwrap());
    }
}
