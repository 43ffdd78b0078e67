//! Tests for the typed parameter store.

use sagaflow::engine::params::ParamStore;
use sagaflow::engine::types::WorkflowError;
use serde_json::json;

#[test]
fn put_and_get_typed_values() {
    let mut params = ParamStore::new();
    params.put("name", &"orders").unwrap();
    params.put("count", &42u32).unwrap();
    params.put("enabled", &true).unwrap();

    let name: String = params.get("name").unwrap();
    let count: u32 = params.get("count").unwrap();
    let enabled: bool = params.get("enabled").unwrap();

    assert_eq!(name, "orders");
    assert_eq!(count, 42);
    assert!(enabled);
}

#[test]
fn get_missing_key_is_typed_error() {
    let params = ParamStore::new();
    let err = params.get::<String>("nope").unwrap_err();
    assert!(matches!(err, WorkflowError::MissingParam(key) if key == "nope"));
}

#[test]
fn get_wrong_type_is_typed_error() {
    let mut params = ParamStore::new();
    params.put("count", &"not a number").unwrap();

    let err = params.get::<u32>("count").unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidParam { key, .. } if key == "count"));
}

#[test]
fn get_opt_distinguishes_absent_from_invalid() {
    let mut params = ParamStore::new();
    params.put("flag", &true).unwrap();

    assert_eq!(params.get_opt::<bool>("flag").unwrap(), Some(true));
    assert_eq!(params.get_opt::<bool>("absent").unwrap(), None);
    assert!(params.get_opt::<u32>("flag").is_err());
}

#[test]
fn from_value_accepts_objects_and_null_only() {
    let params = ParamStore::from_value(json!({ "a": 1, "b": "two" })).unwrap();
    assert_eq!(params.len(), 2);
    assert_eq!(params.get::<u32>("a").unwrap(), 1);

    let empty = ParamStore::from_value(serde_json::Value::Null).unwrap();
    assert!(empty.is_empty());

    assert!(ParamStore::from_value(json!([1, 2, 3])).is_err());
    assert!(ParamStore::from_value(json!("scalar")).is_err());
}

#[test]
fn merge_overwrites_colliding_keys() {
    let mut base = ParamStore::new();
    base.put("a", &1u32).unwrap();
    base.put("b", &2u32).unwrap();

    let mut other = ParamStore::new();
    other.put("b", &20u32).unwrap();
    other.put("c", &30u32).unwrap();

    base.merge(&other);

    assert_eq!(base.get::<u32>("a").unwrap(), 1);
    assert_eq!(base.get::<u32>("b").unwrap(), 20);
    assert_eq!(base.get::<u32>("c").unwrap(), 30);
}

#[test]
fn set_response_writes_reserved_keys() {
    let mut params = ParamStore::new();
    params.set_response(201, &json!({ "id": "abc" })).unwrap();

    let status: u16 = params.get(ParamStore::STATUS_CODE).unwrap();
    assert_eq!(status, 201);
    assert_eq!(
        params.get_value(ParamStore::RESPONSE),
        Some(&json!({ "id": "abc" }))
    );
}

#[test]
fn serializes_as_plain_json_object() {
    let mut params = ParamStore::new();
    params.put("zeta", &1u32).unwrap();
    params.put("alpha", &2u32).unwrap();

    let value = serde_json::to_value(&params).unwrap();
    assert_eq!(value, json!({ "alpha": 2, "zeta": 1 }));

    let back: ParamStore = serde_json::from_value(value).unwrap();
    assert_eq!(back, params);
}
