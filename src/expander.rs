//! Template evaluation for dynamic URLs and request headers/bodies.
//!
//! Templates are Tera, rendered against the per-tick context map (endpoint
//! key to published context). A dynamic URL template emits zero or more
//! URLs joined by `|||`; one trailing separator is tolerated.

use serde_json::Value;
use std::collections::HashMap;
use tera::Tera;

/// The literal URL separator expected in dynamic URL template output.
pub const URL_SEPARATOR: &str = "|||";

/// Renders a single template string against the tick context.
pub fn render_template(
    template: &str,
    data: &HashMap<String, Value>,
) -> Result<String, tera::Error> {
    let mut tera = Tera::default();
    register_filters(&mut tera);
    tera.add_raw_template("inline", template)?;
    let mut context = tera::Context::new();
    for (key, value) in data {
        context.insert(key, value);
    }
    tera.render("inline", &context)
}

/// Expands a dynamic URL template into the list of concrete URLs.
pub fn expand_urls(
    template: &str,
    data: &HashMap<String, Value>,
) -> Result<Vec<String>, tera::Error> {
    let mut rendered = render_template(template, data)?;
    if let Some(stripped) = rendered.strip_suffix(URL_SEPARATOR) {
        rendered = stripped.to_string();
    }
    if rendered.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(rendered
        .split(URL_SEPARATOR)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect())
}

/// String helpers available to all templates, alongside Tera's built-ins.
pub fn register_filters(tera: &mut Tera) {
    tera.register_filter("trim_prefix", trim_prefix);
    tera.register_filter("trim_suffix", trim_suffix);
    tera.register_filter("trim_at", trim_at);
}

fn string_arg(args: &HashMap<String, Value>, name: &str) -> tera::Result<String> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(tera::Error::msg(format!("missing string argument `{name}`"))),
    }
}

fn value_as_str(value: &Value) -> tera::Result<&str> {
    value
        .as_str()
        .ok_or_else(|| tera::Error::msg("filter input is not a string"))
}

fn trim_prefix(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let s = value_as_str(value)?;
    let prefix = string_arg(args, "prefix")?;
    Ok(Value::String(
        s.strip_prefix(&prefix).unwrap_or(s).to_string(),
    ))
}

fn trim_suffix(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let s = value_as_str(value)?;
    let suffix = string_arg(args, "suffix")?;
    Ok(Value::String(
        s.strip_suffix(&suffix).unwrap_or(s).to_string(),
    ))
}

/// Returns the prefix of the input before the first occurrence of `sep`,
/// or the whole string when `sep` is absent.
fn trim_at(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let s = value_as_str(value)?;
    let sep = string_arg(args, "sep")?;
    let trimmed = match s.find(&sep) {
        Some(index) => &s[..index],
        None => s,
    };
    Ok(Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(key: &str, value: Value) -> HashMap<String, Value> {
        let mut data = HashMap::new();
        data.insert(key.to_string(), value);
        data
    }

    #[test]
    fn expands_iteration_in_array_order() {
        let data = ctx(
            "ids",
            json!({"data": {"ids": [{"id": "x"}, {"id": "y"}]}}),
        );
        let urls = expand_urls(
            "{% for item in ids.data.ids %}http://example.com/item/{{ item.id }}|||{% endfor %}",
            &data,
        )
        .unwrap();
        assert_eq!(
            urls,
            vec![
                "http://example.com/item/x".to_string(),
                "http://example.com/item/y".to_string()
            ]
        );
    }

    #[test]
    fn strips_trailing_separator_and_trims_elements() {
        let urls = expand_urls("http://a/ ||| http://b/|||", &HashMap::new()).unwrap();
        assert_eq!(urls, vec!["http://a/".to_string(), "http://b/".to_string()]);
    }

    #[test]
    fn empty_output_yields_no_urls() {
        let data = ctx("ids", json!({"data": {"ids": []}}));
        let urls = expand_urls(
            "{% for item in ids.data.ids %}http://x/{{ item.id }}|||{% endfor %}",
            &data,
        )
        .unwrap();
        assert!(urls.is_empty());
    }

    #[test]
    fn template_errors_surface() {
        assert!(expand_urls("{% for x in %}", &HashMap::new()).is_err());
    }

    #[test]
    fn missing_context_key_is_an_error() {
        assert!(expand_urls("{{ absent.data }}", &HashMap::new()).is_err());
    }

    #[test]
    fn string_helper_filters() {
        let data = ctx("v", json!("https://example.com/path?x=1"));
        let out = render_template("{{ v | trim_prefix(prefix=\"https://\") }}", &data).unwrap();
        assert_eq!(out, "example.com/path?x=1");

        let out = render_template("{{ v | trim_at(sep=\"?\") }}", &data).unwrap();
        assert_eq!(out, "https://example.com/path");

        let out = render_template("{{ v | trim_suffix(suffix=\"x=1\") }}", &data).unwrap();
        assert_eq!(out, "https://example.com/path?");

        let data = ctx("v", json!("no-separator"));
        let out = render_template("{{ v | trim_at(sep=\"?\") }}", &data).unwrap();
        assert_eq!(out, "no-separator");
    }
}
