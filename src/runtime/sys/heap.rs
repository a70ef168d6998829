//! Index-addressed value storage backing an [`Env`](super::Env).
//!
//! Values allocated while a handle scope is open belong to that scope's
//! frame. Closing the frame frees every member no longer reachable from the
//! roots or from a value outside the frame; freed slots go on a free list and
//! their generation is bumped, so a stale [`RawValue`] is rejected instead of
//! aliasing the slot's next occupant. Values allocated with no scope open live
//! as long as the environment.

use super::env::Env;
use super::status::{Status, SysResult};
use indexmap::IndexMap;
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

/// Opaque reference to a value owned by one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawValue {
    pub(crate) env: u32,
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// `typeof`-level classification reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
    Function,
    External,
    Bigint,
}

/// Element type of a typed array view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypedArrayType {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl TypedArrayType {
    pub fn element_size(self) -> usize {
        match self {
            TypedArrayType::Int8 | TypedArrayType::Uint8 | TypedArrayType::Uint8Clamped => 1,
            TypedArrayType::Int16 | TypedArrayType::Uint16 => 2,
            TypedArrayType::Int32 | TypedArrayType::Uint32 | TypedArrayType::Float32 => 4,
            TypedArrayType::Float64 | TypedArrayType::BigInt64 | TypedArrayType::BigUint64 => 8,
        }
    }
}

/// Settlement state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled(RawValue),
    Rejected(RawValue),
}

/// Arguments handed to a native function callback.
#[derive(Debug, Clone)]
pub struct CallbackInfo {
    pub this: RawValue,
    pub args: Vec<RawValue>,
}

/// Native function body. Returning `None` yields `undefined`.
pub type NativeCallback = Rc<dyn Fn(&Env, CallbackInfo) -> Option<RawValue>>;

pub(crate) enum Slot {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    Symbol(Option<String>),
    External(Rc<dyn Any>),
    Object(HeapObject),
}

pub(crate) struct HeapObject {
    pub(crate) class: ObjectClass,
    pub(crate) props: IndexMap<String, RawValue>,
    pub(crate) frozen: bool,
    pub(crate) sealed: bool,
}

impl HeapObject {
    pub(crate) fn new(class: ObjectClass) -> Self {
        Self {
            class,
            props: IndexMap::new(),
            frozen: false,
            sealed: false,
        }
    }
}

pub(crate) enum ObjectClass {
    Plain,
    Array(Vec<RawValue>),
    Function { name: String, callback: NativeCallback },
    Error,
    Date(f64),
    Promise(PromiseState),
    Buffer(Vec<u8>),
    ArrayBuffer(Vec<u8>),
    TypedArray {
        kind: TypedArrayType,
        length: usize,
        buffer: RawValue,
        byte_offset: usize,
    },
    DataView {
        byte_length: usize,
        buffer: RawValue,
        byte_offset: usize,
    },
}

struct HeapCell {
    generation: u32,
    slot: Option<Slot>,
}

pub(crate) struct Heap {
    env: u32,
    cells: Vec<HeapCell>,
    free: Vec<u32>,
    frames: Vec<Vec<u32>>,
}

impl Heap {
    pub(crate) const UNDEFINED: u32 = 0;
    pub(crate) const NULL: u32 = 1;
    pub(crate) const TRUE: u32 = 2;
    pub(crate) const FALSE: u32 = 3;

    pub(crate) fn new(env: u32) -> Self {
        let cells = [
            Slot::Undefined,
            Slot::Null,
            Slot::Boolean(true),
            Slot::Boolean(false),
        ]
        .into_iter()
        .map(|slot| HeapCell {
            generation: 0,
            slot: Some(slot),
        })
        .collect();
        Self {
            env,
            cells,
            free: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub(crate) fn raw(&self, index: u32) -> RawValue {
        RawValue {
            env: self.env,
            index,
            generation: self
                .cells
                .get(index as usize)
                .map_or(0, |cell| cell.generation),
        }
    }

    pub(crate) fn alloc(&mut self, slot: Slot) -> RawValue {
        let index = match self.free.pop() {
            Some(index) => {
                self.cells[index as usize].slot = Some(slot);
                index
            }
            None => {
                self.cells.push(HeapCell {
                    generation: 0,
                    slot: Some(slot),
                });
                (self.cells.len() - 1) as u32
            }
        };
        if let Some(frame) = self.frames.last_mut() {
            frame.push(index);
        }
        self.raw(index)
    }

    /// Number of occupied slots, singletons included.
    pub(crate) fn live(&self) -> usize {
        self.cells.iter().filter(|cell| cell.slot.is_some()).count()
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn open_frame(&mut self) {
        self.frames.push(Vec::new());
    }

    /// Hand `value` over to the enclosing frame, or to the environment when
    /// the innermost frame is the outermost one.
    pub(crate) fn escape(&mut self, value: RawValue) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        let Some(position) = frame.iter().position(|index| *index == value.index) else {
            return;
        };
        frame.swap_remove(position);
        let depth = self.frames.len();
        if depth >= 2 {
            self.frames[depth - 2].push(value.index);
        }
    }

    /// Pop the innermost frame and free its unreachable members. Survivors
    /// move to the enclosing frame. Returns how many slots were freed.
    pub(crate) fn close_frame(&mut self, roots: &[RawValue]) -> usize {
        let Some(young) = self.frames.pop() else {
            return 0;
        };
        let mut marked: HashMap<u32, bool> = young.iter().map(|index| (*index, false)).collect();

        let mut pending: Vec<u32> = roots
            .iter()
            .filter(|root| root.env == self.env)
            .map(|root| root.index)
            .collect();
        for (index, cell) in self.cells.iter().enumerate() {
            if marked.contains_key(&(index as u32)) {
                continue;
            }
            if let Some(slot) = &cell.slot {
                children(slot, &mut pending);
            }
        }
        while let Some(index) = pending.pop() {
            let Some(seen) = marked.get_mut(&index) else {
                continue;
            };
            if *seen {
                continue;
            }
            *seen = true;
            if let Some(slot) = self.cells.get(index as usize).and_then(|cell| cell.slot.as_ref()) {
                children(slot, &mut pending);
            }
        }

        let mut freed = 0;
        let mut survivors = Vec::new();
        for index in young {
            if marked.get(&index) == Some(&true) {
                survivors.push(index);
                continue;
            }
            let cell = &mut self.cells[index as usize];
            if cell.slot.take().is_some() {
                cell.generation = cell.generation.wrapping_add(1);
                self.free.push(index);
                freed += 1;
            }
        }
        if let Some(parent) = self.frames.last_mut() {
            parent.extend(survivors);
        }
        freed
    }

    fn check(&self, value: RawValue) -> SysResult<usize> {
        if value.env != self.env {
            return Err(Status::InvalidArg);
        }
        let index = value.index as usize;
        match self.cells.get(index) {
            Some(cell) if cell.slot.is_some() && cell.generation == value.generation => Ok(index),
            _ => Err(Status::InvalidArg),
        }
    }

    pub(crate) fn contains(&self, value: RawValue) -> bool {
        self.check(value).is_ok()
    }

    pub(crate) fn get(&self, value: RawValue) -> SysResult<&Slot> {
        let index = self.check(value)?;
        self.cells[index].slot.as_ref().ok_or(Status::InvalidArg)
    }

    pub(crate) fn object(&self, value: RawValue) -> SysResult<&HeapObject> {
        match self.get(value)? {
            Slot::Object(object) => Ok(object),
            _ => Err(Status::ObjectExpected),
        }
    }

    pub(crate) fn object_mut(&mut self, value: RawValue) -> SysResult<&mut HeapObject> {
        let index = self.check(value)?;
        match &mut self.cells[index].slot {
            Some(Slot::Object(object)) => Ok(object),
            _ => Err(Status::ObjectExpected),
        }
    }

    /// JS `ToPropertyKey` for the primitive kinds this engine supports as keys.
    pub(crate) fn property_key(&self, key: RawValue) -> SysResult<String> {
        match self.get(key)? {
            Slot::String(text) => Ok(text.clone()),
            Slot::Number(number) => Ok(number_to_string(*number)),
            Slot::BigInt(value) => Ok(value.to_string()),
            Slot::Boolean(value) => Ok(value.to_string()),
            Slot::Undefined => Ok("undefined".to_string()),
            Slot::Null => Ok("null".to_string()),
            Slot::Symbol(_) | Slot::External(_) | Slot::Object(_) => Err(Status::NameExpected),
        }
    }

    pub(crate) fn type_of(&self, value: RawValue) -> SysResult<ValueType> {
        Ok(match self.get(value)? {
            Slot::Undefined => ValueType::Undefined,
            Slot::Null => ValueType::Null,
            Slot::Boolean(_) => ValueType::Boolean,
            Slot::Number(_) => ValueType::Number,
            Slot::BigInt(_) => ValueType::Bigint,
            Slot::String(_) => ValueType::String,
            Slot::Symbol(_) => ValueType::Symbol,
            Slot::External(_) => ValueType::External,
            Slot::Object(object) => match object.class {
                ObjectClass::Function { .. } => ValueType::Function,
                _ => ValueType::Object,
            },
        })
    }
}

/// Slots directly referenced by `slot`.
fn children(slot: &Slot, out: &mut Vec<u32>) {
    let Slot::Object(object) = slot else {
        return;
    };
    out.extend(object.props.values().map(|value| value.index));
    match &object.class {
        ObjectClass::Array(items) => out.extend(items.iter().map(|value| value.index)),
        ObjectClass::Promise(PromiseState::Fulfilled(value) | PromiseState::Rejected(value)) => {
            out.push(value.index)
        }
        ObjectClass::TypedArray { buffer, .. } | ObjectClass::DataView { buffer, .. } => {
            out.push(buffer.index)
        }
        _ => {}
    }
}

/// Render a number the way JS `Number.prototype.toString` does for the common cases.
pub(crate) fn number_to_string(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if value == 0.0 {
        "0".to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e21 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Canonical array index per JS: decimal digits without leading zeros, below 2^32 - 1.
pub(crate) fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u64 = key.parse().ok()?;
    if index >= u32::MAX as u64 {
        return None;
    }
    Some(index as usize)
}
