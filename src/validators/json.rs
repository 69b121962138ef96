//! JSON well-formedness and JSON data-point validators.

use serde_json::{Map, Value};

use super::Validator;
use crate::application::EndpointSnapshot;
use crate::config::ConfigError;
use crate::models::{EndpointResult, ValidationResult};

/// Key under which the parsed body is published into the per-fetch context.
pub const CONTEXT_DATA_KEY: &str = "data";

/// Validates that the body parses as JSON. On success the parsed value is
/// published under `data` for downstream validators; on failure the chain
/// is short-circuited so data-point rules never run against an unparseable
/// body.
pub struct JsonValidator {
    name: String,
}

impl JsonValidator {
    pub fn new(name: &str) -> JsonValidator {
        JsonValidator {
            name: name.to_string(),
        }
    }
}

impl Validator for JsonValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(
        &self,
        _endpoint: &EndpointSnapshot,
        result: &EndpointResult,
        ctx: &mut Map<String, Value>,
    ) -> (bool, ValidationResult) {
        let mut res = ValidationResult::new(&self.name);
        match serde_json::from_slice::<Value>(&result.body) {
            Ok(data) => {
                res.valid = true;
                ctx.insert(CONTEXT_DATA_KEY.to_string(), data);
                (true, res)
            }
            Err(e) => {
                res.errors.push(format!("JSON is not well-formed. {e}"));
                (false, res)
            }
        }
    }
}

/// Validates specific values inside a JSON body.
///
/// Each rule is a path and a command. Paths are dot-separated segments;
/// `[]` addresses every element of an array, `[N]` the element at index N.
/// A command prefixed with `?` is optional: a missing key is not an error.
pub struct JsonDataValidator {
    name: String,
    rules: Vec<(String, String)>,
}

impl JsonDataValidator {
    pub fn from_options(name: &str, options: &Value) -> Result<JsonDataValidator, ConfigError> {
        let Some(Value::Array(entries)) = options.get("keys") else {
            return Err(ConfigError::InvalidValidatorOptions {
                name: name.to_string(),
                reason: "missing keys list".to_string(),
            });
        };
        let mut rules = Vec::new();
        for entry in entries {
            let Some(map) = entry.as_object() else {
                return Err(ConfigError::InvalidValidatorOptions {
                    name: name.to_string(),
                    reason: format!("keys entry {entry} is not a path/command map"),
                });
            };
            for (path, command) in map {
                let Some(command) = command.as_str() else {
                    return Err(ConfigError::InvalidValidatorOptions {
                        name: name.to_string(),
                        reason: format!("command for path {path} is not a string"),
                    });
                };
                rules.push((path.clone(), command.to_string()));
            }
        }
        Ok(JsonDataValidator {
            name: name.to_string(),
            rules,
        })
    }

    fn navigate_tree(
        &self,
        keys: &[&str],
        key_index: usize,
        command: &str,
        value: &Value,
    ) -> Vec<String> {
        let optional = command.starts_with('?');

        if keys.len() <= key_index || (keys.len() == 1 && keys[0] == "[]") {
            return match self.validate_value(keys, command, value) {
                Some(err) => vec![err],
                None => Vec::new(),
            };
        }

        let key = keys[key_index];

        match value {
            Value::Array(elements) => {
                if let Some(index) = parse_array_index(key) {
                    if index >= elements.len() {
                        return vec![format!(
                            "Array at key {} does not have an element at index {}. Array size is: {}",
                            key,
                            index,
                            elements.len()
                        )];
                    }
                    return self.navigate_tree(keys, key_index + 1, command, &elements[index]);
                }
                if key != "[]" {
                    return vec![format!(
                        "Key {} at index {} not defined as array, but json data is of type array.",
                        key, key_index
                    )];
                }
                let mut errors = Vec::new();
                for element in elements {
                    errors.extend(self.navigate_tree(keys, key_index + 1, command, element));
                }
                errors
            }
            Value::Object(map) => {
                if key == "[]" {
                    return vec![format!(
                        "Key element at index {} defined as array, but json element is an object.",
                        key_index
                    )];
                }
                match map.get(key) {
                    Some(inner) => self.navigate_tree(keys, key_index + 1, command, inner),
                    None => {
                        if optional {
                            Vec::new()
                        } else {
                            vec![format!("Key element {} not found in JSON.", key)]
                        }
                    }
                }
            }
            other => vec![format!(
                "Error processing validation for key {}. Element has type {}",
                key,
                type_name(other)
            )],
        }
    }

    /// Applies `command` to a resolved value, returning an error message on
    /// mismatch. `None` means the value passed.
    pub(crate) fn validate_value(
        &self,
        keys: &[&str],
        command: &str,
        value: &Value,
    ) -> Option<String> {
        let key = keys.join(".");

        let command = command.strip_prefix('?').unwrap_or(command);

        let Some((comparison, expected)) = command.split_once(' ') else {
            return Some(format!(
                "Error parsing JSONData comparison value {command} for key {key}. \
                 Should be a space between the comparison type and expected value."
            ));
        };
        let comparison = comparison.to_lowercase();
        let c = comparison.as_str();

        match value {
            Value::Bool(actual) => match c {
                "type" => {
                    if !(expected.eq_ignore_ascii_case("bool")
                        || expected.eq_ignore_ascii_case("boolean"))
                    {
                        return Some(format!(
                            "Type comparison failed for key {key}. Actual value: {actual} was a boolean but expected type {expected}"
                        ));
                    }
                    None
                }
                "=" => {
                    let matches = (*actual && expected.eq_ignore_ascii_case("true"))
                        || (!*actual && expected.eq_ignore_ascii_case("false"));
                    if !matches {
                        return Some(format!(
                            "Boolean comparison failed for key {key}. Expected value of {expected} did not match actual value {actual}"
                        ));
                    }
                    None
                }
                _ => Some(format!(
                    "Unknown comparison {c} for boolean type for key {key}."
                )),
            },
            Value::Number(n) => {
                let actual = n.as_f64().unwrap_or(f64::NAN);
                if c == "type" {
                    if !(expected.eq_ignore_ascii_case("number")
                        || expected.eq_ignore_ascii_case("int"))
                    {
                        return Some(format!(
                            "Type comparison failed for key {key}. Actual value: {actual} was a number but expected type {expected}"
                        ));
                    }
                    return None;
                }
                let Ok(cv) = expected.parse::<f64>() else {
                    return Some(format!(
                        "Number comparison failed for key {key}. Unable to convert expected value: {expected} to a number."
                    ));
                };
                compare_numbers(&key, c, actual, cv, "Number")
            }
            Value::String(actual) => {
                if let Some(len_c) = c.strip_prefix("len") {
                    let Ok(cv) = expected.parse::<f64>() else {
                        return Some(format!(
                            "String length comparison failed for key {key}. Unable to convert expected value: {expected} to a number."
                        ));
                    };
                    return compare_numbers(&key, len_c, actual.len() as f64, cv, "String length");
                }
                match c {
                    "type" => {
                        if !expected.eq_ignore_ascii_case("string") {
                            return Some(format!(
                                "Type comparison failed for key {key}. Actual value: {actual} was a string but expected type {expected}"
                            ));
                        }
                        None
                    }
                    "=" => {
                        if actual != expected {
                            return Some(format!(
                                "String comparison failed for key {key}. Actual value {actual} is not equal to comparison value {expected}"
                            ));
                        }
                        None
                    }
                    "!=" => {
                        if actual == expected {
                            return Some(format!(
                                "String comparison failed for key {key}. Actual value {actual} is equal to comparison value {expected}"
                            ));
                        }
                        None
                    }
                    _ => Some(format!(
                        "Unknown comparison {c} for string type for key {key}."
                    )),
                }
            }
            Value::Array(elements) => {
                if c == "type" {
                    if !(expected == "[]" || expected.eq_ignore_ascii_case("array")) {
                        return Some(format!(
                            "Type comparison failed for key {key}. Actual value was an array but expected type {expected}"
                        ));
                    }
                    return None;
                }
                if let Some(len_c) = c.strip_prefix("len") {
                    let Ok(cv) = expected.parse::<f64>() else {
                        return Some(format!(
                            "Array length comparison failed for key {key}. Unable to convert expected value: {expected} to a number."
                        ));
                    };
                    return compare_numbers(&key, len_c, elements.len() as f64, cv, "Array length");
                }
                Some(format!(
                    "Unknown comparison {c} for array type for key {key}."
                ))
            }
            other => Some(format!(
                "Unexpected type {} encountered for key {key} of value {other}.",
                type_name(other)
            )),
        }
    }
}

fn parse_array_index(key: &str) -> Option<usize> {
    key.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .filter(|inner| !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|inner| inner.parse().ok())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn compare_numbers(key: &str, c: &str, v1: f64, v2: f64, kind: &str) -> Option<String> {
    let failed = match c {
        ">" => v1 <= v2,
        ">=" => v1 < v2,
        "=" => v1 != v2,
        "!=" => v1 == v2,
        "<" => v1 >= v2,
        "<=" => v1 > v2,
        _ => {
            return Some(format!(
                "Unknown comparison {c} for {kind} type for key {key}."
            ))
        }
    };
    if failed {
        Some(format!(
            "{kind} comparison failed for key {key}. Actual value {v1} did not satisfy {c} {v2}"
        ))
    } else {
        None
    }
}

impl Validator for JsonDataValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(
        &self,
        _endpoint: &EndpointSnapshot,
        result: &EndpointResult,
        ctx: &mut Map<String, Value>,
    ) -> (bool, ValidationResult) {
        let mut res = ValidationResult::new(&self.name);

        let data = match ctx.get(CONTEXT_DATA_KEY) {
            Some(data) => data.clone(),
            None => match serde_json::from_slice::<Value>(&result.body) {
                Ok(data) => data,
                Err(e) => {
                    res.errors.push(format!("JSON is not well-formed. {e}"));
                    return (false, res);
                }
            },
        };

        let mut errors = Vec::new();
        for (path, command) in &self.rules {
            let keys: Vec<&str> = path.split('.').collect();
            errors.extend(self.navigate_tree(&keys, 0, command, &data));
        }

        res.valid = errors.is_empty();
        res.errors = errors;
        (true, res)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{result_with_body, snapshot};
    use super::*;
    use serde_json::json;

    fn data_validator(rules: Value) -> JsonDataValidator {
        JsonDataValidator::from_options("Test Validator", &json!({ "keys": rules })).unwrap()
    }

    fn run(v: &JsonDataValidator, body: &[u8]) -> ValidationResult {
        let ep = snapshot();
        let er = result_with_body(body);
        let mut ctx = Map::new();
        v.validate(&ep, &er, &mut ctx).1
    }

    fn check_value(command: &str, value: Value, should_pass: bool) {
        let v = data_validator(json!([]));
        let keys = ["test", "key", "set"];
        let res = v.validate_value(&keys, command, &value);
        match (should_pass, res) {
            (true, Some(err)) => {
                panic!("command {command:?} on {value} should pass, got error: {err}")
            }
            (false, None) => panic!("command {command:?} on {value} should fail but passed"),
            _ => {}
        }
    }

    #[test]
    fn json_validator_publishes_data_and_short_circuits() {
        let v = JsonValidator::new("json");
        let ep = snapshot();
        let mut ctx = Map::new();

        let ok = result_with_body(br#"{"a": 1}"#);
        let (cont, res) = v.validate(&ep, &ok, &mut ctx);
        assert!(cont);
        assert!(res.valid);
        assert_eq!(ctx.get("data").unwrap()["a"], json!(1));

        let mut ctx = Map::new();
        let bad = result_with_body(b"{not json");
        let (cont, res) = v.validate(&ep, &bad, &mut ctx);
        assert!(!cont);
        assert!(!res.valid);
        assert!(res.errors[0].contains("not well-formed"));
        assert!(ctx.get("data").is_none());
    }

    #[test]
    fn missing_key_simple() {
        let v = data_validator(json!([{ "key2": "< 10" }, { "basekey": "> 0" }]));
        assert!(!run(&v, b"{}").valid);
        assert!(run(&v, br#"{"key2": 9, "basekey": 3}"#).valid);
    }

    #[test]
    fn missing_key_in_array_elements() {
        let v = data_validator(json!([{ "[].key1": "< 10" }]));
        assert!(!run(&v, br#"[{"key2":4}]"#).valid);
        assert!(run(&v, br#"[{"key1":4},{"key1":5}]"#).valid);
    }

    #[test]
    fn root_array_length() {
        let v = data_validator(json!([{ "[]": "len= 2" }]));
        assert!(!run(&v, br#"[{"test":4}, {"test":5}, {"test":6}]"#).valid);
        assert!(run(&v, br#"[{"key1":4},{"key1":5}]"#).valid);
    }

    #[test]
    fn array_index_addressing() {
        let v = data_validator(json!([{ "stuff.[1].innerId": "= 20" }]));
        let res = run(&v, br#"{"id": 4,"stuff": [{"innerId": 10},{"innerId": 25}]}"#);
        assert!(!res.valid);
        assert!(res.errors[0].contains("stuff.[1].innerId"));
        assert!(run(&v, br#"{"id": 4,"stuff": [{"innerId": 10},{"innerId": 20}]}"#).valid);
    }

    #[test]
    fn array_index_out_of_bounds() {
        let v = data_validator(json!([{ "stuff.[5].innerId": "= 20" }]));
        let res = run(&v, br#"{"stuff": [{"innerId": 10}]}"#);
        assert!(!res.valid);
        assert!(res.errors[0].contains("index 5"));
    }

    #[test]
    fn optional_keys() {
        let v = data_validator(json!([{ "key1": "?< 10" }]));
        assert!(!run(&v, br#"{"key1":12}"#).valid);
        assert!(run(&v, br#"{"key1":9}"#).valid);
        assert!(run(&v, br#"{"key2":4}"#).valid);
        assert!(run(&v, b"{}").valid);
    }

    #[test]
    fn uses_published_context_data_over_body() {
        let v = data_validator(json!([{ "a": "= 1" }]));
        let ep = snapshot();
        let er = result_with_body(b"not json at all");
        let mut ctx = Map::new();
        ctx.insert("data".to_string(), json!({"a": 1}));
        let (cont, res) = v.validate(&ep, &er, &mut ctx);
        assert!(cont);
        assert!(res.valid);
    }

    #[test]
    fn malformed_body_without_context_short_circuits() {
        let v = data_validator(json!([{ "a": "= 1" }]));
        let ep = snapshot();
        let er = result_with_body(b"nope");
        let mut ctx = Map::new();
        let (cont, res) = v.validate(&ep, &er, &mut ctx);
        assert!(!cont);
        assert!(!res.valid);
    }

    #[test]
    fn bool_commands() {
        check_value("= true", json!(true), true);
        check_value("= true", json!(false), false);
        check_value("= false", json!(false), true);
        check_value("= false", json!(true), false);
        check_value("?= true", json!(true), true);
        check_value("type bool", json!(true), true);
        check_value("type boolean", json!(true), true);
        check_value("type string", json!(true), false);
        check_value("type number", json!(false), false);
        check_value("type array", json!(false), false);
        check_value("?type bool", json!(true), true);
        check_value("len= 3", json!(true), false);
    }

    #[test]
    fn number_commands() {
        check_value("= 3.65", json!(3.65), true);
        check_value("= 3.65", json!(3.6), false);
        check_value("?= 3.65", json!(3.65), true);
        check_value("!= 3.65", json!(3.64), true);
        check_value("!= 3.65", json!(3.65), false);
        check_value("> 3.65", json!(3.66), true);
        check_value("> 3.65", json!(3.65), false);
        check_value(">= 3.65", json!(3.65), true);
        check_value(">= 3.65", json!(3.64), false);
        check_value("< 3.65", json!(3.64), true);
        check_value("< 3.65", json!(3.65), false);
        check_value("<= 3.65", json!(3.65), true);
        check_value("<= 3.65", json!(3.66), false);
        check_value("type number", json!(3.65), true);
        check_value("type int", json!(3), true);
        check_value("type bool", json!(3.65), false);
        check_value("type string", json!(3.65), false);
        check_value("type array", json!(3.65), false);
        // Length commands do not apply to numbers.
        check_value("len= 3", json!(3.0), false);
    }

    #[test]
    fn string_commands() {
        check_value("= Test", json!("Test"), true);
        check_value("!= Test", json!("Test"), false);
        check_value("= Test", json!("not Test"), false);
        check_value("!= Test", json!("not Test"), true);
        check_value("len= 4", json!("test"), true);
        check_value("len= 5", json!("test"), false);
        check_value("len!= 3", json!("test"), true);
        check_value("len!= 4", json!("test"), false);
        check_value("len> 3", json!("test"), true);
        check_value("len> 4", json!("test"), false);
        check_value("len>= 4", json!("test"), true);
        check_value("len>= 5", json!("test"), false);
        check_value("len< 5", json!("test"), true);
        check_value("len< 4", json!("test"), false);
        check_value("len<= 4", json!("test"), true);
        check_value("len<= 3", json!("test"), false);
        check_value("type string", json!("test"), true);
        check_value("type bool", json!("test"), false);
        check_value("type number", json!("test"), false);
        check_value("type array", json!("test"), false);
    }

    #[test]
    fn array_commands() {
        let a = json!(["test", "key", "set"]);
        check_value("len= 3", a.clone(), true);
        check_value("len= 4", a.clone(), false);
        check_value("?len= 3", a.clone(), true);
        check_value("len!= 3", a.clone(), false);
        check_value("len!= 4", a.clone(), true);
        check_value("len> 2", a.clone(), true);
        check_value("len> 3", a.clone(), false);
        check_value("len>= 3", a.clone(), true);
        check_value("len>= 4", a.clone(), false);
        check_value("len< 4", a.clone(), true);
        check_value("len< 3", a.clone(), false);
        check_value("len<= 3", a.clone(), true);
        check_value("len<= 2", a.clone(), false);
        check_value("type array", a.clone(), true);
        check_value("type []", a.clone(), true);
        check_value("type bool", a.clone(), false);
        check_value("type string", a.clone(), false);
        check_value("type number", a.clone(), false);
        check_value("= x", a, false);
    }

    #[test]
    fn command_without_space_is_reported() {
        check_value("=5", json!(5), false);
    }
}
