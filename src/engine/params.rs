use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::types::WorkflowError;

/// Typed key-value store shared across a workflow's steps.
///
/// Two instances exist per workflow: the input parameters, frozen once the
/// workflow starts, and the working map that steps mutate as they go. Values
/// are stored as JSON so the whole map serializes into the workflow record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamStore(BTreeMap<String, serde_json::Value>);

impl ParamStore {
    /// Working-map key holding the operation's result payload.
    pub const RESPONSE: &'static str = "response";
    /// Working-map key holding the result's status classification.
    pub const STATUS_CODE: &'static str = "status_code";

    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a store from a JSON object. Anything other than an object is
    /// rejected, so inputs always round-trip as a flat key→value map.
    pub fn from_value(value: serde_json::Value) -> Result<Self, WorkflowError> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(map.into_iter().collect())),
            serde_json::Value::Null => Ok(Self::new()),
            other => Err(WorkflowError::InvalidParam {
                key: "inputs".to_string(),
                message: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }

    /// Store a serializable value under `key`, replacing any previous value.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), WorkflowError> {
        let json = serde_json::to_value(value).map_err(|e| WorkflowError::InvalidParam {
            key: key.to_string(),
            message: format!("failed to serialize: {}", e),
        })?;
        self.0.insert(key.to_string(), json);
        Ok(())
    }

    /// Fetch and decode the value under `key`; missing keys are an error.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, WorkflowError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| WorkflowError::MissingParam(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| WorkflowError::InvalidParam {
            key: key.to_string(),
            message: format!("failed to decode: {}", e),
        })
    }

    /// Fetch and decode the value under `key`, or `None` when absent.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, WorkflowError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                WorkflowError::InvalidParam {
                    key: key.to_string(),
                    message: format!("failed to decode: {}", e),
                }
            }),
        }
    }

    /// Raw JSON access, used when the caller does not care about the shape.
    pub fn get_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Fold another store into this one; colliding keys take the other's
    /// value.
    pub fn merge(&mut self, other: &ParamStore) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Write the reserved result payload and status code in one shot.
    pub fn set_response<T: Serialize>(
        &mut self,
        status_code: u16,
        payload: &T,
    ) -> Result<(), WorkflowError> {
        self.put(Self::RESPONSE, payload)?;
        self.put(Self::STATUS_CODE, &status_code)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
