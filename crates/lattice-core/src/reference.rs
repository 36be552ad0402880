//! Reference resolution: `{{Name.field[.sub][n]}}` tokens interpolated
//! against upstream node outputs.
//!
//! Resolution is lazy and string-level. Tokens that do not resolve are left
//! verbatim so users can author templates before the upstream shape exists.
//! The same scan drives both interpolation and reference discovery (edge
//! inference).

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// One step into a referenced output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed `{{...}}` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The whole token, braces included.
    pub raw: String,
    /// Display name of the referenced node.
    pub node_name: String,
    /// Field path below the node's output; never empty.
    pub path: Vec<PathSegment>,
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("token regex"))
}

fn segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^\[\]]+)((?:\[\d+\])*)$").expect("segment regex"))
}

/// Parse the inner text of a token into `(node_name, path)`.
///
/// Returns `None` for text that is not a well-formed reference (no field
/// part, empty segments, malformed indices); such tokens are never touched.
fn parse_inner(inner: &str) -> Option<(String, Vec<PathSegment>)> {
    let inner = inner.trim();
    let mut parts = inner.split('.');
    let name = parts.next()?.trim();
    if name.is_empty() || name.contains('[') {
        return None;
    }

    let mut path = Vec::new();
    for part in parts {
        let caps = segment_re().captures(part.trim())?;
        let key = caps.get(1)?.as_str().trim();
        if key.is_empty() {
            return None;
        }
        path.push(PathSegment::Key(key.to_string()));
        let indices = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        for idx in indices.split(['[', ']']).filter(|s| !s.is_empty()) {
            path.push(PathSegment::Index(idx.parse().ok()?));
        }
    }

    if path.is_empty() {
        return None;
    }
    Some((name.to_string(), path))
}

/// Scan `text` for references, in order of appearance.
pub fn find_references(text: &str) -> Vec<Reference> {
    token_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let raw = caps.get(0)?.as_str().to_string();
            let (node_name, path) = parse_inner(caps.get(1)?.as_str())?;
            Some(Reference {
                raw,
                node_name,
                path,
            })
        })
        .collect()
}

/// Resolve one reference against a `name -> output` map.
pub fn resolve<'a>(reference: &Reference, outputs: &'a HashMap<String, Value>) -> Option<&'a Value> {
    let mut current = outputs.get(&reference.node_name)?;
    for segment in &reference.path {
        current = match segment {
            PathSegment::Key(key) => current.get(key)?,
            PathSegment::Index(idx) => current.get(idx)?,
        };
    }
    Some(current)
}

/// Render a resolved value into template text: scalars bare, everything else
/// JSON-stringified.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Replace every resolvable reference in `text`; leave the rest verbatim.
pub fn interpolate(text: &str, outputs: &HashMap<String, Value>) -> String {
    token_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let raw = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let Some((node_name, path)) = caps.get(1).and_then(|m| parse_inner(m.as_str())) else {
                return raw.to_string();
            };
            let reference = Reference {
                raw: raw.to_string(),
                node_name,
                path,
            };
            match resolve(&reference, outputs) {
                Some(value) => render(value),
                None => raw.to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert(
            "Input".to_string(),
            json!({"prompt": "hello", "value": "hello"}),
        );
        map.insert(
            "Agent".to_string(),
            json!({
                "result": "done",
                "value": {"summary": "ok", "items": ["a", "b", "c"]},
                "count": 3,
                "flag": true,
            }),
        );
        map
    }

    #[test]
    fn finds_simple_reference() {
        let refs = find_references("Echo: {{Input.prompt}}");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].node_name, "Input");
        assert_eq!(refs[0].path, vec![PathSegment::Key("prompt".into())]);
        assert_eq!(refs[0].raw, "{{Input.prompt}}");
    }

    #[test]
    fn finds_nested_and_indexed() {
        let refs = find_references("{{Agent.value.items[1]}} and {{Agent.value.summary}}");
        assert_eq!(refs.len(), 2);
        assert_eq!(
            refs[0].path,
            vec![
                PathSegment::Key("value".into()),
                PathSegment::Key("items".into()),
                PathSegment::Index(1),
            ]
        );
    }

    #[test]
    fn name_only_token_is_not_a_reference() {
        assert!(find_references("{{Input}}").is_empty());
        assert!(find_references("{{ }}").is_empty());
    }

    #[test]
    fn names_may_contain_spaces() {
        let refs = find_references("{{My Agent.result}}");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].node_name, "My Agent");
    }

    #[test]
    fn interpolates_scalars_bare() {
        let out = interpolate(
            "p={{Input.prompt}} n={{Agent.count}} f={{Agent.flag}}",
            &outputs(),
        );
        assert_eq!(out, "p=hello n=3 f=true");
    }

    #[test]
    fn interpolates_non_scalars_as_json() {
        let out = interpolate("v={{Agent.value}}", &outputs());
        assert_eq!(out, r#"v={"summary":"ok","items":["a","b","c"]}"#);
    }

    #[test]
    fn array_indexing() {
        let out = interpolate("first={{Agent.value.items[0]}}", &outputs());
        assert_eq!(out, "first=a");
        let out = interpolate("missing={{Agent.value.items[9]}}", &outputs());
        assert_eq!(out, "missing={{Agent.value.items[9]}}");
    }

    #[test]
    fn unknown_node_or_field_left_verbatim() {
        let out = interpolate("{{Ghost.result}} / {{Agent.nope}}", &outputs());
        assert_eq!(out, "{{Ghost.result}} / {{Agent.nope}}");
    }

    #[test]
    fn idempotent_without_references() {
        let text = "plain text with {single} braces and {{malformed";
        assert_eq!(interpolate(text, &outputs()), text);
    }

    #[test]
    fn every_found_reference_is_replaced_when_present() {
        // find/interpolate agree: anything findReferences returns that
        // resolves must disappear from the interpolated text.
        let text = "{{Input.prompt}} {{Agent.result}} {{Agent.value.items[2]}}";
        let refs = find_references(text);
        assert_eq!(refs.len(), 3);
        let out = interpolate(text, &outputs());
        for r in refs {
            assert!(!out.contains(&r.raw), "{} survived interpolation", r.raw);
        }
    }

    #[test]
    fn multiple_occurrences_all_replaced() {
        let out = interpolate("{{Input.prompt}}-{{Input.prompt}}", &outputs());
        assert_eq!(out, "hello-hello");
    }
}
