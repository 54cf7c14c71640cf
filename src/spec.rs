//! JSON reference spec parsing, versions 0 and 1.
//!
//! Version 0 is a flat `path -> value` mapping. Version 1 adds named URL
//! templates and parametric `gen` entries that expand to many references
//! via a Cartesian product over their dimensions.

use indexmap::IndexMap;
use itertools::Itertools;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::error::{RefError, Result};
use crate::reference::{encode_inline_json, Reference};
use crate::store::eager::EagerRefMap;
use crate::template::Templates;

// ── Spec schema ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SpecV1 {
    #[allow(dead_code)]
    version: u64,
    #[serde(default)]
    templates: IndexMap<String, String>,
    #[serde(default)]
    refs: IndexMap<String, Value>,
    #[serde(default)]
    gen: Vec<GenEntry>,
}

#[derive(Debug, Deserialize)]
struct GenEntry {
    key: String,
    url: String,
    dimensions: IndexMap<String, Dimension>,
    offset: Option<String>,
    length: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Dimension {
    List(Vec<Value>),
    Range {
        #[serde(default)]
        start: i64,
        stop: i64,
        #[serde(default = "default_step")]
        step: i64,
    },
}

fn default_step() -> i64 {
    1
}

// ── Parsing ────────────────────────────────────────────────────────

/// Parse a reference spec into an eager map, expanding templates and
/// generators. Returns the map together with the parsed template set
/// (used later to derive a remote protocol).
pub fn parse_spec(
    spec: &Value,
    template_overrides: Option<&IndexMap<String, String>>,
    simple_templates: bool,
) -> Result<(EagerRefMap, Templates)> {
    let obj = spec
        .as_object()
        .ok_or_else(|| RefError::BadSpec("reference spec must be a JSON object".into()))?;
    match obj.get("version") {
        None => {
            let map = parse_refs_v0(obj)?;
            info!(refs = map.len(), "loaded version-0 reference spec");
            Ok((map, Templates::empty()))
        }
        Some(v) if v.as_u64() == Some(1) => {
            let parsed: SpecV1 = serde_json::from_value(spec.clone())?;
            let templates =
                Templates::new(parsed.templates, template_overrides, simple_templates);
            let mut map = EagerRefMap::new();
            for (key, value) in &parsed.refs {
                map.put(key.clone(), parse_ref_value(key, value, Some(&templates))?);
            }
            for gen in &parsed.gen {
                expand_gen(gen, &templates, &mut map)?;
            }
            info!(refs = map.len(), "loaded version-1 reference spec");
            Ok((map, templates))
        }
        Some(v) => Err(RefError::BadSpec(format!(
            "unknown reference spec version: {v}"
        ))),
    }
}

fn parse_refs_v0(obj: &serde_json::Map<String, Value>) -> Result<EagerRefMap> {
    let mut map = EagerRefMap::new();
    for (key, value) in obj {
        map.put(key.clone(), parse_ref_value(key, value, None)?);
    }
    Ok(map)
}

/// Classify one spec value: inline string (possibly base64), `[url]`, or
/// `[url, offset, size]`. The dynamic union does not survive past this
/// boundary.
fn parse_ref_value(key: &str, value: &Value, templates: Option<&Templates>) -> Result<Reference> {
    match value {
        Value::String(s) => Reference::inline_from_str(s),
        Value::Array(parts) => {
            let url = match parts.first() {
                Some(Value::Null) | None => None,
                Some(Value::String(u)) => Some(match templates {
                    Some(t) => t.expand_url(u)?,
                    None => u.clone(),
                }),
                Some(other) => {
                    return Err(RefError::BadSpec(format!(
                        "reference '{key}': target must be a URL or null, got {other}"
                    )))
                }
            };
            match parts.len() {
                1 => Ok(Reference::Whole(url)),
                3 => {
                    let offset = expect_u64(key, &parts[1], "offset")?;
                    let size = expect_u64(key, &parts[2], "size")?;
                    Ok(Reference::Slice { url, offset, size })
                }
                n => Err(RefError::BadSpec(format!(
                    "reference '{key}': expected 1 or 3 elements, got {n}"
                ))),
            }
        }
        other => Err(RefError::BadSpec(format!(
            "reference '{key}': expected string or array, got {other}"
        ))),
    }
}

fn expect_u64(key: &str, value: &Value, what: &str) -> Result<u64> {
    value.as_u64().ok_or_else(|| {
        RefError::BadSpec(format!(
            "reference '{key}': {what} must be a non-negative integer, got {value}"
        ))
    })
}

// ── Generator expansion ────────────────────────────────────────────

fn expand_gen(gen: &GenEntry, templates: &Templates, out: &mut EagerRefMap) -> Result<()> {
    if gen.offset.is_some() != gen.length.is_some() {
        return Err(RefError::BadSpec(
            "both 'offset' and 'length' are required for a generator entry if either is provided"
                .into(),
        ));
    }

    let names: Vec<&String> = gen.dimensions.keys().collect();
    let value_lists: Vec<Vec<Value>> = gen
        .dimensions
        .values()
        .map(materialize_dimension)
        .collect::<Result<_>>()?;

    // Iteration order over bindings follows dimension insertion order.
    let combos: Box<dyn Iterator<Item = Vec<Value>>> = if value_lists.is_empty() {
        Box::new(std::iter::once(Vec::new()))
    } else {
        Box::new(
            value_lists
                .into_iter()
                .map(|values| values.into_iter())
                .multi_cartesian_product(),
        )
    };

    for combo in combos {
        let mut binding = serde_json::Map::new();
        for (name, value) in names.iter().zip(combo) {
            binding.insert((*name).clone(), value);
        }
        let key = templates.render_with(&gen.key, &binding)?;
        let url = templates.render_with(&gen.url, &binding)?;
        let reference = match (&gen.offset, &gen.length) {
            (Some(offset), Some(length)) => Reference::Slice {
                url: Some(url),
                offset: render_int(templates, offset, &binding)?,
                size: render_int(templates, length, &binding)?,
            },
            _ => Reference::Whole(Some(url)),
        };
        out.put(key, reference);
    }
    Ok(())
}

fn materialize_dimension(dim: &Dimension) -> Result<Vec<Value>> {
    match dim {
        Dimension::List(values) => Ok(values.clone()),
        Dimension::Range { start, stop, step } => {
            if *step == 0 {
                return Err(RefError::BadSpec("generator dimension step must not be 0".into()));
            }
            let mut values = Vec::new();
            let mut i = *start;
            while (*step > 0 && i < *stop) || (*step < 0 && i > *stop) {
                values.push(Value::from(i));
                i += step;
            }
            Ok(values)
        }
    }
}

fn render_int(
    templates: &Templates,
    template: &str,
    binding: &serde_json::Map<String, Value>,
) -> Result<u64> {
    let rendered = templates.render_with(template, binding)?;
    rendered.trim().parse::<u64>().map_err(|_| {
        RefError::BadSpec(format!(
            "generator offset/length '{template}' rendered to non-integer '{rendered}'"
        ))
    })
}

// ── Serialization back to JSON ─────────────────────────────────────

/// Serialize references as a version-1 spec. Inline bytes that are ASCII
/// are emitted as strings, anything else in the `"base64:"` form; `Absent`
/// entries are dropped.
pub fn refs_to_json(entries: impl IntoIterator<Item = (String, Reference)>) -> Value {
    let mut refs = serde_json::Map::new();
    for (key, reference) in entries {
        let value = match reference {
            Reference::Inline(b) => Value::String(encode_inline_json(&b)),
            Reference::Whole(url) => Value::Array(vec![url_value(url)]),
            Reference::Slice { url, offset, size } => {
                Value::Array(vec![url_value(url), offset.into(), size.into()])
            }
            Reference::Absent => continue,
        };
        refs.insert(key, value);
    }
    serde_json::json!({ "version": 1, "refs": refs })
}

fn url_value(url: Option<String>) -> Value {
    match url {
        Some(u) => Value::String(u),
        None => Value::Null,
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn parse(spec: Value) -> EagerRefMap {
        parse_spec(&spec, None, true).unwrap().0
    }

    #[test]
    fn v0_flat_mapping() {
        let map = parse(serde_json::json!({
            "a": "base64:aGVsbG8=",
            "b": ["http://h/x"],
            "c": ["http://h/x", 10, 5],
        }));
        assert_eq!(map.get("a"), Some(&Reference::Inline(Bytes::from_static(b"hello"))));
        assert_eq!(map.get("b"), Some(&Reference::Whole(Some("http://h/x".into()))));
        assert_eq!(
            map.get("c"),
            Some(&Reference::Slice { url: Some("http://h/x".into()), offset: 10, size: 5 })
        );
    }

    #[test]
    fn v1_template_expansion() {
        let map = parse(serde_json::json!({
            "version": 1,
            "templates": {"u": "http://server/path"},
            "refs": {"key": ["{{u}}/file", 0, 2]},
        }));
        assert_eq!(
            map.get("key"),
            Some(&Reference::Slice { url: Some("http://server/path/file".into()), offset: 0, size: 2 })
        );
    }

    #[test]
    fn gen_expands_cartesian_product() {
        let map = parse(serde_json::json!({
            "version": 1,
            "refs": {},
            "gen": [{
                "key": "data/{{i}}.{{j}}",
                "url": "http://h/{{i}}-{{j}}",
                "dimensions": {"i": {"stop": 2}, "j": [0, 1]},
            }],
        }));
        assert_eq!(map.len(), 4);
        assert_eq!(
            map.get("data/1.0"),
            Some(&Reference::Whole(Some("http://h/1-0".into())))
        );
    }

    #[test]
    fn gen_with_offset_and_length_yields_slices() {
        let map = parse(serde_json::json!({
            "version": 1,
            "gen": [{
                "key": "f/{{i}}",
                "url": "http://h/blob",
                "dimensions": {"i": {"stop": 3}},
                "offset": "{{ i * 100 }}",
                "length": "100",
            }],
        }));
        assert_eq!(
            map.get("f/2"),
            Some(&Reference::Slice { url: Some("http://h/blob".into()), offset: 200, size: 100 })
        );
    }

    #[test]
    fn gen_with_only_offset_is_rejected() {
        let err = parse_spec(
            &serde_json::json!({
                "version": 1,
                "gen": [{
                    "key": "f/{{i}}",
                    "url": "http://h/blob",
                    "dimensions": {"i": {"stop": 1}},
                    "offset": "0",
                }],
            }),
            None,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, RefError::BadSpec(_)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = parse_spec(&serde_json::json!({"version": 2, "refs": {}}), None, true)
            .unwrap_err();
        assert!(matches!(err, RefError::BadSpec(_)));
    }

    #[test]
    fn save_round_trips_untemplated_specs() {
        let spec = serde_json::json!({
            "version": 1,
            "refs": {
                "a": "hello",
                "b": ["http://h/x"],
                "c": ["http://h/x", 10, 5],
                "d": "base64:/w==",
            },
        });
        let map = parse(spec.clone());
        let emitted = refs_to_json(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        assert_eq!(emitted["refs"], spec["refs"]);
    }
}
