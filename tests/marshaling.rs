mod common;

use common::{detached_env, init_tracing};
use jsbridge::{from_js, omit, to_js, BridgeError, JsObject, ValueKind};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Settings {
    name: String,
    #[serde(skip_serializing_if = "omit::is_empty", default)]
    retries: u32,
    #[serde(skip_serializing_if = "omit::is_empty", default)]
    tags: Vec<String>,
    #[serde(skip_serializing_if = "omit::is_empty", default)]
    label: String,
}

#[test]
fn test_empty_tagged_fields_are_left_out() {
    init_tracing();
    let env = detached_env();
    let settings = Settings {
        name: "cache".to_string(),
        retries: 0,
        tags: vec![],
        label: "primary".to_string(),
    };

    let value = to_js(&env, &settings).unwrap();
    let object: JsObject = value.clone().cast().unwrap();
    assert_eq!(object.property_names().unwrap(), vec!["name", "label"]);

    let back: Settings = from_js(&value).unwrap();
    assert_eq!(back, settings);
}

#[test]
fn test_bigint_boundaries() {
    let env = detached_env();

    let max = to_js(&env, &i64::MAX).unwrap();
    assert_eq!(max.kind().unwrap(), ValueKind::BigInt);
    assert_eq!(from_js::<i64>(&max).unwrap(), i64::MAX);

    let min = to_js(&env, &i64::MIN).unwrap();
    assert_eq!(from_js::<i64>(&min).unwrap(), i64::MIN);

    let unsigned = to_js(&env, &u64::MAX).unwrap();
    assert_eq!(from_js::<u64>(&unsigned).unwrap(), u64::MAX);

    // Negative values never fit an unsigned target.
    let err = from_js::<u64>(&min).unwrap_err();
    assert!(matches!(err, BridgeError::Conversion(_)));
}

#[test]
fn test_integer_keyed_map_round_trip() {
    let env = detached_env();
    let mut ports = HashMap::new();
    ports.insert(80u16, "http".to_string());
    ports.insert(443u16, "https".to_string());

    let value = to_js(&env, &ports).unwrap();
    let object: JsObject = value.clone().cast().unwrap();
    assert_eq!(object.get_as::<String>("443").unwrap(), "https");

    let back: HashMap<u16, String> = from_js(&value).unwrap();
    assert_eq!(back, ports);
}

#[test]
fn test_shape_mismatch_names_kind_and_target() {
    let env = detached_env();
    let value = to_js(&env, &"not a number").unwrap();
    let err = from_js::<f64>(&value).unwrap_err();
    match err {
        BridgeError::Conversion(conversion) => {
            assert_eq!(conversion.kind(), Some(ValueKind::String));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    id: u32,
    name: String,
    score: f64,
    flags: Vec<bool>,
    parent: Option<Box<Record>>,
}

fn record() -> impl Strategy<Value = Record> {
    let leaf = (any::<u32>(), "[a-z]{0,12}", -1.0e9..1.0e9f64, prop::collection::vec(any::<bool>(), 0..4))
        .prop_map(|(id, name, score, flags)| Record {
            id,
            name,
            score,
            flags,
            parent: None,
        });
    leaf.prop_recursive(3, 8, 1, |inner| {
        (inner.clone(), inner).prop_map(|(mut child, parent)| {
            child.parent = Some(Box::new(parent));
            child
        })
    })
}

proptest! {
    #[test]
    fn test_struct_round_trip(value in record()) {
        let env = detached_env();
        let converted = to_js(&env, &value).unwrap();
        let back: Record = from_js(&converted).unwrap();
        prop_assert_eq!(back, value);
    }
}
