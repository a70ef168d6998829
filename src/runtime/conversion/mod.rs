//! Conversion between host values and engine values.
//!
//! Host values go in through [`to_js`] (any `Serialize`) and come back out
//! through [`from_js`] (any `DeserializeOwned`). The dynamic value's tag
//! decides how it is read; a shape the target cannot hold is a
//! [`ConversionError`](crate::runtime::error::ConversionError).
//!
//! Engine handles ([`JsValue`] and the typed wrappers) and host functions can
//! be embedded anywhere inside a converted value and pass through unchanged.

mod date;
mod de;
pub(crate) mod magic;
pub mod omit;
mod ser;

pub use date::Date;
pub use de::Deserializer;
pub use ser::{SerializeArray, SerializeObject, Serializer};

use crate::runtime::error::{panic_message, BridgeError, ConversionError};
use crate::runtime::js_value::JsValue;
use crate::runtime::sys::Env;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Convert a host value into an engine value owned by `env`.
pub fn to_js<T>(env: &Env, value: &T) -> Result<JsValue, BridgeError>
where
    T: Serialize + ?Sized,
{
    catch_unwind(AssertUnwindSafe(|| value.serialize(Serializer::new(env))))
        .unwrap_or_else(|payload| Err(conversion_fault(payload.as_ref())))
}

/// Convert an engine value into a freshly built host value.
pub fn from_js<T>(value: &JsValue) -> Result<T, BridgeError>
where
    T: DeserializeOwned,
{
    catch_unwind(AssertUnwindSafe(|| {
        let deserializer = Deserializer::new(value.clone())?;
        T::deserialize(deserializer)
    }))
    .unwrap_or_else(|payload| Err(conversion_fault(payload.as_ref())))
}

/// Like [`from_js`], writing into `target`. On failure `target` is untouched.
pub fn from_js_into<T>(value: &JsValue, target: &mut T) -> Result<(), BridgeError>
where
    T: DeserializeOwned,
{
    *target = from_js(value)?;
    Ok(())
}

fn conversion_fault(payload: &(dyn std::any::Any + Send)) -> BridgeError {
    let message = format!("panic during conversion: {}", panic_message(payload));
    tracing::error!("{}", message);
    ConversionError::custom(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::js_value::{AnyValue, ValueKind};
    use crate::runtime::sys::test_env;
    use crate::runtime::values::{JsArray, JsObject};
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, HashMap};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Shape {
        Point,
        Circle(f64),
        Rect { w: u32, h: u32 },
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        #[serde(rename = "displayAge")]
        age: u8,
        score: f64,
        tags: Vec<String>,
        parent: Option<Box<Record>>,
        shape: Shape,
        #[serde(skip)]
        cache: u32,
    }

    fn record() -> Record {
        Record {
            name: "ada".to_string(),
            age: 36,
            score: 9.5,
            tags: vec!["math".to_string(), "engines".to_string()],
            parent: Some(Box::new(Record {
                name: "byron".to_string(),
                age: 70,
                score: 0.0,
                tags: vec![],
                parent: None,
                shape: Shape::Point,
                cache: 0,
            })),
            shape: Shape::Rect { w: 3, h: 4 },
            cache: 0,
        }
    }

    #[test]
    fn test_struct_round_trip() {
        let (env, _) = test_env();
        let value = to_js(&env, &record()).unwrap();
        assert_eq!(value.kind().unwrap(), ValueKind::Object);

        let object = value.clone().cast::<JsObject>().unwrap();
        assert!(object.has("displayAge").unwrap());
        assert!(!object.has("age").unwrap());
        assert!(!object.has("cache").unwrap());

        let back: Record = from_js(&value).unwrap();
        assert_eq!(back, record());
    }

    #[test]
    fn test_struct_fields_keep_declaration_order() {
        let (env, _) = test_env();
        let value = to_js(&env, &record()).unwrap();
        let names = value.cast::<JsObject>().unwrap().property_names().unwrap();
        assert_eq!(
            names,
            vec!["name", "displayAge", "score", "tags", "parent", "shape"]
        );
    }

    #[test]
    fn test_bigint_boundaries() {
        let (env, _) = test_env();

        let negative = to_js(&env, &-1i64).unwrap();
        assert_eq!(negative.kind().unwrap(), ValueKind::BigInt);
        assert_eq!(env.get_value_bigint_int64(negative.raw()).unwrap(), (-1, true));
        assert_eq!(from_js::<i64>(&negative).unwrap(), -1);

        let max = to_js(&env, &u64::MAX).unwrap();
        assert_eq!(max.kind().unwrap(), ValueKind::BigInt);
        assert_eq!(
            env.get_value_bigint_uint64(max.raw()).unwrap(),
            (u64::MAX, true)
        );
        assert_eq!(from_js::<u64>(&max).unwrap(), u64::MAX);
    }

    #[test]
    fn test_small_integers_are_numbers() {
        let (env, _) = test_env();
        for value in [
            to_js(&env, &7i32).unwrap(),
            to_js(&env, &7u8).unwrap(),
            to_js(&env, &7.0f32).unwrap(),
        ] {
            assert_eq!(value.kind().unwrap(), ValueKind::Number);
            assert_eq!(from_js::<f64>(&value).unwrap(), 7.0);
        }
    }

    #[test]
    fn test_oversized_i128_fails() {
        let (env, _) = test_env();
        let err = to_js(&env, &(u64::MAX as i128 + 1)).unwrap_err();
        assert!(matches!(err, BridgeError::Conversion(_)));
    }

    #[test]
    fn test_integer_range_checked() {
        let (env, _) = test_env();
        let value = to_js(&env, &300i32).unwrap();
        assert!(from_js::<u8>(&value).is_err());
        assert_eq!(from_js::<u16>(&value).unwrap(), 300);
    }

    #[test]
    fn test_map_keys_round_trip_through_text() {
        let (env, _) = test_env();
        let mut map = HashMap::new();
        map.insert(7i32, "seven".to_string());

        let value = to_js(&env, &map).unwrap();
        let object = value.clone().cast::<JsObject>().unwrap();
        assert_eq!(object.property_names().unwrap(), vec!["7"]);

        let back: HashMap<i32, String> = from_js(&value).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_map_key_parse_failure() {
        let (env, _) = test_env();
        let mut map = BTreeMap::new();
        map.insert("seven".to_string(), 7);
        let value = to_js(&env, &map).unwrap();
        assert!(from_js::<BTreeMap<i32, i32>>(&value).is_err());

        let mut flags = BTreeMap::new();
        flags.insert(true, 1);
        let value = to_js(&env, &flags).unwrap();
        assert_eq!(from_js::<BTreeMap<bool, i32>>(&value).unwrap(), flags);
    }

    #[test]
    fn test_omitted_field_is_absent() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Profile {
            id: u32,
            #[serde(default, skip_serializing_if = "omit::is_empty")]
            nickname: String,
        }

        let (env, _) = test_env();
        let value = to_js(
            &env,
            &Profile {
                id: 1,
                nickname: String::new(),
            },
        )
        .unwrap();
        let object = value.clone().cast::<JsObject>().unwrap();
        assert!(!object.has("nickname").unwrap());

        let back: Profile = from_js(&value).unwrap();
        assert_eq!(back.nickname, "");
    }

    #[test]
    fn test_missing_required_field_fails() {
        #[derive(Deserialize, Debug)]
        #[allow(dead_code)]
        struct Required {
            id: u32,
            name: String,
        }

        let (env, _) = test_env();
        let object = JsObject::new(&env);
        object.set_value("id", &1u32).unwrap();
        assert!(from_js::<Required>(&object).is_err());
    }

    #[test]
    fn test_tag_mismatch_reports_kind() {
        let (env, _) = test_env();
        let object = JsObject::new(&env);
        let err = from_js::<i32>(&object).unwrap_err();
        match err {
            BridgeError::Conversion(err) => {
                assert_eq!(err.kind(), Some(ValueKind::Object));
                assert_eq!(err.message(), "cannot set object to i32");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_json_values_use_generic_form() {
        let (env, _) = test_env();
        let json = serde_json::json!({ "list": [1, "two", { "three": true }], "none": null });
        let value = to_js(&env, &json).unwrap();
        let object = value.clone().cast::<JsObject>().unwrap();
        assert_eq!(object.get("list").unwrap().kind().unwrap(), ValueKind::Array);

        let back: serde_json::Value = from_js(&value).unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn test_handles_pass_through() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            label: String,
            inner: JsValue,
        }

        let (env, _) = test_env();
        let inner = JsArray::new(&env);
        let holder = Holder {
            label: "x".to_string(),
            inner: JsValue::from(inner.clone()),
        };
        let value = to_js(&env, &holder).unwrap();
        let stored = value.clone().cast::<JsObject>().unwrap().get("inner").unwrap();
        assert_eq!(stored.raw(), inner.raw());

        let back: Holder = from_js(&value).unwrap();
        assert_eq!(back.inner.raw(), inner.raw());
    }

    #[test]
    fn test_short_arrays_pad_fixed_targets() {
        let (env, _) = test_env();
        let value = to_js(&env, &vec![1, 2]).unwrap();
        assert_eq!(from_js::<[i32; 3]>(&value).unwrap(), [1, 2, 0]);
        assert_eq!(from_js::<[i32; 1]>(&value).unwrap(), [1]);
        assert!(from_js::<(i32, String, Option<u8>)>(&value).is_err());

        let names = to_js(&env, &vec!["a"]).unwrap();
        let padded: (String, String, Option<u8>) = from_js(&names).unwrap();
        assert_eq!(padded, ("a".to_string(), String::new(), None));
    }

    #[test]
    fn test_short_arrays_pad_structs_with_zero_fields() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Point {
            x: f64,
            label: String,
            tags: Vec<String>,
        }

        let (env, _) = test_env();
        let value = to_js(&env, &Vec::<String>::new()).unwrap();
        let points: [Point; 1] = from_js(&value).unwrap();
        assert_eq!(
            points,
            [Point {
                x: 0.0,
                label: String::new(),
                tags: Vec::new(),
            }]
        );
    }

    #[test]
    fn test_failed_element_keeps_partial_array() {
        struct Faulty(bool);

        impl Serialize for Faulty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if self.0 {
                    serializer.serialize_i32(1)
                } else {
                    Err(serde::ser::Error::custom("bad element"))
                }
            }
        }

        let (env, _) = test_env();
        let err = to_js(&env, &vec![Faulty(true), Faulty(false), Faulty(true)]).unwrap_err();
        assert_eq!(err.to_string(), "bad element");
        let partial = err.partial(&env).unwrap().cast::<JsArray>().unwrap();
        assert_eq!(partial.len().unwrap(), 3);
        assert_eq!(from_js::<i32>(&partial.get(0).unwrap()).unwrap(), 1);
        assert_eq!(partial.get(1).unwrap().kind().unwrap(), ValueKind::Undefined);
        assert_eq!(partial.get(2).unwrap().kind().unwrap(), ValueKind::Undefined);

        let err = to_js(&env, &Faulty(false)).unwrap_err();
        assert!(err.partial(&env).is_none());
    }

    #[test]
    fn test_struct_with_dynamic_field() {
        #[derive(Deserialize, Debug)]
        struct Event {
            name: String,
            payload: AnyValue,
        }

        let (env, _) = test_env();
        let payload = JsObject::new(&env);
        payload.set_value("count", &3).unwrap();
        payload.set_value("tags", &vec!["a", "b"]).unwrap();
        let event = JsObject::new(&env);
        event.set_value("name", "tick").unwrap();
        event.set("payload", &payload.into()).unwrap();

        let decoded: Event = from_js(&event).unwrap();
        assert_eq!(decoded.name, "tick");
        let AnyValue::Object(fields) = decoded.payload else {
            panic!("payload should stay an object");
        };
        assert_eq!(fields["count"], AnyValue::Number(3.0));
        assert_eq!(
            fields["tags"],
            AnyValue::Array(vec![
                AnyValue::String("a".into()),
                AnyValue::String("b".into())
            ])
        );
    }

    #[test]
    fn test_bytes_become_buffer() {
        struct Raw(Vec<u8>);

        impl Serialize for Raw {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_bytes(&self.0)
            }
        }

        let (env, _) = test_env();
        let value = to_js(&env, &Raw(vec![1, 2, 3])).unwrap();
        assert_eq!(value.kind().unwrap(), ValueKind::Buffer);
        assert_eq!(from_js::<Vec<u8>>(&value).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_panicking_serialize_is_contained() {
        struct Exploding;

        impl Serialize for Exploding {
            fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
                panic!("kaboom")
            }
        }

        let (env, _) = test_env();
        let err = to_js(&env, &Exploding).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn test_from_js_into_keeps_target_on_error() {
        let (env, _) = test_env();
        let mut target = vec![1, 2, 3];
        let bad = to_js(&env, "nope").unwrap();
        assert!(from_js_into(&bad, &mut target).is_err());
        assert_eq!(target, vec![1, 2, 3]);

        let good = to_js(&env, &vec![4]).unwrap();
        from_js_into(&good, &mut target).unwrap();
        assert_eq!(target, vec![4]);
    }

    #[test]
    fn test_dates() {
        let (env, _) = test_env();
        let date = Date::from_millis(1_700_000_000_000.0);
        let value = to_js(&env, &date).unwrap();
        assert_eq!(value.kind().unwrap(), ValueKind::Date);
        assert_eq!(from_js::<Date>(&value).unwrap(), date);
    }

    #[test]
    fn test_unit_variants_are_strings() {
        let (env, _) = test_env();
        let value = to_js(&env, &Shape::Point).unwrap();
        assert_eq!(value.kind().unwrap(), ValueKind::String);
        assert_eq!(from_js::<Shape>(&value).unwrap(), Shape::Point);

        let value = to_js(&env, &Shape::Circle(2.0)).unwrap();
        assert_eq!(from_js::<Shape>(&value).unwrap(), Shape::Circle(2.0));
    }
}
