//! `serde::Serializer` producing engine values.

use super::magic;
use crate::runtime::error::{BridgeError, ConversionError};
use crate::runtime::js_value::JsValue;
use crate::runtime::sys::{Env, RawValue, Status};
use serde::ser::{self, Serialize};

/// Serializes a host value into a [`JsValue`] owned by `env`.
#[derive(Clone, Copy)]
pub struct Serializer<'a> {
    env: &'a Env,
}

impl<'a> Serializer<'a> {
    pub fn new(env: &'a Env) -> Self {
        Self { env }
    }

    fn wrap(&self, raw: RawValue) -> JsValue {
        JsValue::from_raw(self.env, raw)
    }

    fn bigint(&self, value: i128) -> Result<JsValue, BridgeError> {
        match self.env.create_bigint_i128(value) {
            Ok(raw) => Ok(self.wrap(raw)),
            Err(Status::InvalidArg) => Err(ConversionError::custom(format!(
                "integer {} does not fit a 64-bit bigint",
                value
            ))
            .into()),
            Err(status) => Err(status.into()),
        }
    }

    /// `{ variant: value }`, the externally tagged enum shape.
    fn tagged(&self, variant: &str, value: &JsValue) -> Result<JsValue, BridgeError> {
        let object = self.env.create_object();
        self.env.set_named_property(object, variant, value.raw())?;
        Ok(self.wrap(object))
    }
}

impl<'a> ser::Serializer for Serializer<'a> {
    type Ok = JsValue;
    type Error = BridgeError;

    type SerializeSeq = SerializeArray<'a>;
    type SerializeTuple = SerializeArray<'a>;
    type SerializeTupleStruct = SerializeArray<'a>;
    type SerializeTupleVariant = SerializeArray<'a>;
    type SerializeMap = SerializeObject<'a>;
    type SerializeStruct = SerializeObject<'a>;
    type SerializeStructVariant = SerializeObject<'a>;

    fn serialize_bool(self, v: bool) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.get_boolean(v)))
    }

    fn serialize_i8(self, v: i8) -> Result<JsValue, BridgeError> {
        self.serialize_i32(v as i32)
    }

    fn serialize_i16(self, v: i16) -> Result<JsValue, BridgeError> {
        self.serialize_i32(v as i32)
    }

    fn serialize_i32(self, v: i32) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.create_int32(v)))
    }

    // 64-bit integers go to bigint: a double cannot hold them losslessly.
    fn serialize_i64(self, v: i64) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.create_bigint_int64(v)))
    }

    fn serialize_i128(self, v: i128) -> Result<JsValue, BridgeError> {
        self.bigint(v)
    }

    fn serialize_u8(self, v: u8) -> Result<JsValue, BridgeError> {
        self.serialize_u32(v as u32)
    }

    fn serialize_u16(self, v: u16) -> Result<JsValue, BridgeError> {
        self.serialize_u32(v as u32)
    }

    fn serialize_u32(self, v: u32) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.create_uint32(v)))
    }

    fn serialize_u64(self, v: u64) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.create_bigint_uint64(v)))
    }

    fn serialize_u128(self, v: u128) -> Result<JsValue, BridgeError> {
        let v = i128::try_from(v).map_err(|_| {
            ConversionError::custom(format!("integer {} does not fit a 64-bit bigint", v))
        })?;
        self.bigint(v)
    }

    fn serialize_f32(self, v: f32) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.create_double(v as f64)))
    }

    fn serialize_f64(self, v: f64) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.create_double(v)))
    }

    fn serialize_char(self, v: char) -> Result<JsValue, BridgeError> {
        let mut buf = [0u8; 4];
        self.serialize_str(v.encode_utf8(&mut buf))
    }

    fn serialize_str(self, v: &str) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.create_string_utf8(v)))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.create_buffer_copy(v)))
    }

    fn serialize_none(self) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.get_null()))
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<JsValue, BridgeError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<JsValue, BridgeError> {
        Ok(self.wrap(self.env.get_undefined()))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<JsValue, BridgeError> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<JsValue, BridgeError> {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<JsValue, BridgeError> {
        match name {
            magic::VALUE_TOKEN => match magic::take_value() {
                Some(handle) if handle.env().same_env(self.env) => Ok(handle),
                Some(_) => Err(Status::InvalidArg.into()),
                None => self.serialize_unit(),
            },
            magic::FUNCTION_TOKEN => match magic::take_function() {
                Some(function) => Ok(function.to_function(self.env)?.into()),
                None => self.serialize_unit(),
            },
            magic::DATE_TOKEN => {
                let millis = value.serialize(self)?;
                let millis = self.env.get_value_double(millis.raw())?;
                Ok(self.wrap(self.env.create_date(millis)))
            }
            _ => value.serialize(self),
        }
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<JsValue, BridgeError> {
        let inner = value.serialize(self)?;
        self.tagged(variant, &inner)
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SerializeArray<'a>, BridgeError> {
        Ok(SerializeArray::new(self, len.unwrap_or(0), None))
    }

    fn serialize_tuple(self, len: usize) -> Result<SerializeArray<'a>, BridgeError> {
        Ok(SerializeArray::new(self, len, None))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SerializeArray<'a>, BridgeError> {
        Ok(SerializeArray::new(self, len, None))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SerializeArray<'a>, BridgeError> {
        Ok(SerializeArray::new(self, len, Some(variant)))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<SerializeObject<'a>, BridgeError> {
        Ok(SerializeObject::new(self, None))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<SerializeObject<'a>, BridgeError> {
        Ok(SerializeObject::new(self, None))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<SerializeObject<'a>, BridgeError> {
        Ok(SerializeObject::new(self, Some(variant)))
    }
}

/// Builds an array element by element.
pub struct SerializeArray<'a> {
    ser: Serializer<'a>,
    array: RawValue,
    index: u32,
    variant: Option<&'static str>,
}

impl<'a> SerializeArray<'a> {
    fn new(ser: Serializer<'a>, capacity: usize, variant: Option<&'static str>) -> Self {
        let array = if capacity > 0 {
            ser.env.create_array_with_length(capacity)
        } else {
            ser.env.create_array()
        };
        Self {
            ser,
            array,
            index: 0,
            variant,
        }
    }

    fn push<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), BridgeError> {
        let element = value
            .serialize(self.ser)
            .map_err(|err| err.with_partial(self.array))?;
        self.ser.env.set_element(self.array, self.index, element.raw())?;
        self.index += 1;
        Ok(())
    }

    fn finish(self) -> Result<JsValue, BridgeError> {
        let array = self.ser.wrap(self.array);
        match self.variant {
            Some(variant) => self.ser.tagged(variant, &array),
            None => Ok(array),
        }
    }
}

impl ser::SerializeSeq for SerializeArray<'_> {
    type Ok = JsValue;
    type Error = BridgeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), BridgeError> {
        self.push(value)
    }

    fn end(self) -> Result<JsValue, BridgeError> {
        self.finish()
    }
}

impl ser::SerializeTuple for SerializeArray<'_> {
    type Ok = JsValue;
    type Error = BridgeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), BridgeError> {
        self.push(value)
    }

    fn end(self) -> Result<JsValue, BridgeError> {
        self.finish()
    }
}

impl ser::SerializeTupleStruct for SerializeArray<'_> {
    type Ok = JsValue;
    type Error = BridgeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), BridgeError> {
        self.push(value)
    }

    fn end(self) -> Result<JsValue, BridgeError> {
        self.finish()
    }
}

impl ser::SerializeTupleVariant for SerializeArray<'_> {
    type Ok = JsValue;
    type Error = BridgeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), BridgeError> {
        self.push(value)
    }

    fn end(self) -> Result<JsValue, BridgeError> {
        self.finish()
    }
}

/// Builds an object property by property, in insertion order.
pub struct SerializeObject<'a> {
    ser: Serializer<'a>,
    object: RawValue,
    pending_key: Option<JsValue>,
    variant: Option<&'static str>,
}

impl<'a> SerializeObject<'a> {
    fn new(ser: Serializer<'a>, variant: Option<&'static str>) -> Self {
        Self {
            object: ser.env.create_object(),
            ser,
            pending_key: None,
            variant,
        }
    }

    fn field<T: ?Sized + Serialize>(&mut self, key: &str, value: &T) -> Result<(), BridgeError> {
        let value = value.serialize(self.ser)?;
        self.ser.env.set_named_property(self.object, key, value.raw())?;
        Ok(())
    }

    fn finish(self) -> Result<JsValue, BridgeError> {
        let object = self.ser.wrap(self.object);
        match self.variant {
            Some(variant) => self.ser.tagged(variant, &object),
            None => Ok(object),
        }
    }
}

impl ser::SerializeMap for SerializeObject<'_> {
    type Ok = JsValue;
    type Error = BridgeError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), BridgeError> {
        self.pending_key = Some(key.serialize(self.ser)?);
        Ok(())
    }

    // Keys are engine values; the object setter stringifies them.
    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), BridgeError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| ConversionError::custom("map value serialized before its key"))?;
        let value = value.serialize(self.ser)?;
        match self.ser.env.set_property(self.object, key.raw(), value.raw()) {
            Ok(()) => Ok(()),
            Err(Status::NameExpected) => Err(ConversionError::mismatch(key.kind()?, "property key").into()),
            Err(status) => Err(status.into()),
        }
    }

    fn end(self) -> Result<JsValue, BridgeError> {
        self.finish()
    }
}

impl ser::SerializeStruct for SerializeObject<'_> {
    type Ok = JsValue;
    type Error = BridgeError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), BridgeError> {
        self.field(key, value)
    }

    fn end(self) -> Result<JsValue, BridgeError> {
        self.finish()
    }
}

impl ser::SerializeStructVariant for SerializeObject<'_> {
    type Ok = JsValue;
    type Error = BridgeError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), BridgeError> {
        self.field(key, value)
    }

    fn end(self) -> Result<JsValue, BridgeError> {
        self.finish()
    }
}
