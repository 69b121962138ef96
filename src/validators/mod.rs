//! Response validators.
//!
//! Validators are pure: they inspect an [`EndpointResult`] and a shared
//! per-fetch context map, and return a [`ValidationResult`] plus a flag
//! telling the chain whether to continue. New variants are added to the
//! registry in [`build_validator`] and nowhere else.

mod json;

pub use json::{JsonDataValidator, JsonValidator};

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::application::EndpointSnapshot;
use crate::config::ConfigError;
use crate::models::{EndpointResult, ValidationResult};

pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    /// Validates `result`, optionally publishing artifacts into `ctx` for
    /// later validators in the chain. Returns `(continue, result)`; a
    /// `false` continue flag terminates the chain after this result is
    /// recorded. The returned result is always present, even for
    /// infrastructure problems such as an unrecognised command.
    fn validate(
        &self,
        endpoint: &EndpointSnapshot,
        result: &EndpointResult,
        ctx: &mut Map<String, Value>,
    ) -> (bool, ValidationResult);
}

/// Creates a validator from its configured type tag and options map.
pub fn build_validator(
    kind: &str,
    name: &str,
    options: &Value,
) -> Result<Arc<dyn Validator>, ConfigError> {
    match kind {
        "Status" => Ok(Arc::new(StatusValidator::from_options(name, options)?)),
        "Size" => Ok(Arc::new(SizeValidator::from_options(name, options)?)),
        "JSON" => Ok(Arc::new(JsonValidator::new(name))),
        "JSONData" => Ok(Arc::new(JsonDataValidator::from_options(name, options)?)),
        other => Err(ConfigError::UnknownValidatorType(other.to_string())),
    }
}

/// Validates that the HTTP status code is one of a set of expected values.
pub struct StatusValidator {
    name: String,
    valid_status_codes: Vec<u16>,
}

impl StatusValidator {
    pub fn from_options(name: &str, options: &Value) -> Result<StatusValidator, ConfigError> {
        let codes = match options.get("status") {
            Some(Value::Number(n)) => vec![number_to_status(name, n)?],
            Some(Value::Array(list)) => {
                let mut codes = Vec::with_capacity(list.len());
                for item in list {
                    match item {
                        Value::Number(n) => codes.push(number_to_status(name, n)?),
                        other => {
                            return Err(ConfigError::InvalidValidatorOptions {
                                name: name.to_string(),
                                reason: format!("status list entry {other} is not a number"),
                            })
                        }
                    }
                }
                codes
            }
            _ => {
                return Err(ConfigError::InvalidValidatorOptions {
                    name: name.to_string(),
                    reason: "missing status code or list of status codes".to_string(),
                })
            }
        };
        Ok(StatusValidator {
            name: name.to_string(),
            valid_status_codes: codes,
        })
    }
}

fn number_to_status(name: &str, n: &serde_json::Number) -> Result<u16, ConfigError> {
    n.as_u64()
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| ConfigError::InvalidValidatorOptions {
            name: name.to_string(),
            reason: format!("{n} is not a valid HTTP status code"),
        })
}

impl Validator for StatusValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(
        &self,
        _endpoint: &EndpointSnapshot,
        result: &EndpointResult,
        _ctx: &mut Map<String, Value>,
    ) -> (bool, ValidationResult) {
        let mut res = ValidationResult::new(&self.name);
        res.valid = self.valid_status_codes.contains(&result.status);
        if !res.valid {
            res.errors.push(format!(
                "Status code {} does not match expected status code(s): {:?}",
                result.status, self.valid_status_codes
            ));
        }
        (true, res)
    }
}

/// Validates that the reported body size falls within configured bounds.
/// Either bound may be zero to disable it.
pub struct SizeValidator {
    name: String,
    minimum_size: i64,
    maximum_size: i64,
}

impl SizeValidator {
    pub fn from_options(name: &str, options: &Value) -> Result<SizeValidator, ConfigError> {
        let bound = |key: &str| -> Result<i64, ConfigError> {
            match options.get(key) {
                None | Some(Value::Null) => Ok(0),
                Some(Value::Number(n)) => {
                    n.as_i64()
                        .ok_or_else(|| ConfigError::InvalidValidatorOptions {
                            name: name.to_string(),
                            reason: format!("{key} value {n} is not an integer"),
                        })
                }
                Some(other) => Err(ConfigError::InvalidValidatorOptions {
                    name: name.to_string(),
                    reason: format!("{key} value {other} is not an integer"),
                }),
            }
        };
        Ok(SizeValidator {
            name: name.to_string(),
            minimum_size: bound("minsize")?,
            maximum_size: bound("maxsize")?,
        })
    }
}

impl Validator for SizeValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(
        &self,
        _endpoint: &EndpointSnapshot,
        result: &EndpointResult,
        _ctx: &mut Map<String, Value>,
    ) -> (bool, ValidationResult) {
        let mut res = ValidationResult::new(&self.name);
        res.valid = true;
        if self.minimum_size > 0 && result.size < self.minimum_size {
            res.valid = false;
            res.errors.push(format!(
                "Size of body ({}) was smaller than the minimum size ({}).",
                result.size, self.minimum_size
            ));
        }
        if self.maximum_size > 0 && result.size > self.maximum_size {
            res.valid = false;
            res.errors.push(format!(
                "Size of body ({}) was larger than the maximum size ({}).",
                result.size, self.maximum_size
            ));
        }
        (true, res)
    }
}
