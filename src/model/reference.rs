//! References from one resource's properties to another resource's outputs.
//!
//! A string property may contain `${other}` or `${other.output}`. The first
//! form refers to the provider's primary identifier (`id`). References are
//! the source of implicit dependency edges and are substituted with real
//! provider identifiers right before a resource is applied.

use serde_json::Value;
use std::fmt;

/// Output read when a reference names no attribute.
pub const DEFAULT_OUTPUT: &str = "id";

/// A reference to another resource's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Referenced resource id.
    pub resource: String,
    /// Output attribute, `id` when omitted.
    pub output: String,
}

impl Reference {
    /// Parses the inside of a `${...}` expression.
    #[must_use]
    pub fn parse(expr: &str) -> Option<Self> {
        let expr = expr.trim();
        let (resource, output) = match expr.split_once('.') {
            Some((resource, output)) => (resource, output),
            None => (expr, DEFAULT_OUTPUT),
        };

        if !is_ident(resource) || !is_ident(output) {
            return None;
        }

        Some(Self {
            resource: resource.to_string(),
            output: output.to_string(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.output)
    }
}

fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A `${...}` occurrence inside a string.
struct Span {
    start: usize,
    end: usize,
    reference: Reference,
}

fn scan(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find("${") {
        let open = cursor + offset;
        let Some(len) = text[open..].find('}') else {
            break;
        };
        let close = open + len + 1;
        if let Some(reference) = Reference::parse(&text[open + 2..close - 1]) {
            spans.push(Span {
                start: open,
                end: close,
                reference,
            });
        }
        cursor = close;
    }

    spans
}

/// Collects every reference contained in a value, in encounter order.
#[must_use]
pub fn extract(value: &Value) -> Vec<Reference> {
    let mut found = Vec::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut Vec<Reference>) {
    match value {
        Value::String(text) => found.extend(scan(text).into_iter().map(|s| s.reference)),
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

/// Substitutes references using `lookup`.
///
/// A string consisting of exactly one reference is replaced by the looked-up
/// value itself (so it may become `null` or a number); references embedded in
/// longer strings are interpolated as text. References for which `lookup`
/// returns `None` are left untouched.
pub fn substitute<F>(value: &Value, lookup: &mut F) -> Value
where
    F: FnMut(&Reference) -> Option<Value>,
{
    match value {
        Value::String(text) => substitute_str(text, lookup),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str<F>(text: &str, lookup: &mut F) -> Value
where
    F: FnMut(&Reference) -> Option<Value>,
{
    let spans = scan(text);
    if spans.is_empty() {
        return Value::String(text.to_string());
    }

    if let [only] = spans.as_slice()
        && only.start == 0
        && only.end == text.len()
    {
        return lookup(&only.reference).unwrap_or_else(|| Value::String(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        out.push_str(&text[cursor..span.start]);
        match lookup(&span.reference) {
            Some(Value::String(s)) => out.push_str(&s),
            Some(Value::Null) => {}
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&text[span.start..span.end]),
        }
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);

    Value::String(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reference_forms() {
        let r = Reference::parse("vpc").unwrap();
        assert_eq!(r.resource, "vpc");
        assert_eq!(r.output, "id");

        let r = Reference::parse("alb.dns_name").unwrap();
        assert_eq!(r.resource, "alb");
        assert_eq!(r.output, "dns_name");

        assert!(Reference::parse("").is_none());
        assert!(Reference::parse("a b").is_none());
    }

    #[test]
    fn test_extract_nested() {
        let value = json!({
            "origin": "${alb.dns_name}",
            "subnets": ["${public-a}", "${public-b}"],
            "url": "https://${cdn.dns_name}/wp",
            "port": 80
        });
        let refs: Vec<String> = extract(&value).into_iter().map(|r| r.resource).collect();
        assert_eq!(refs.len(), 4);
        assert!(refs.contains(&String::from("alb")));
        assert!(refs.contains(&String::from("cdn")));
    }

    #[test]
    fn test_substitute_whole_and_embedded() {
        let value = json!({
            "acl": "${waf.arn}",
            "url": "https://${cdn.dns_name}/wp"
        });
        let resolved = substitute(&value, &mut |r: &Reference| match r.resource.as_str() {
            "waf" => Some(Value::Null),
            "cdn" => Some(json!("d123.cloudfront.net")),
            _ => None,
        });
        assert_eq!(resolved["acl"], Value::Null);
        assert_eq!(resolved["url"], json!("https://d123.cloudfront.net/wp"));
    }

    #[test]
    fn test_unresolved_left_in_place() {
        let value = json!("${vpc}");
        let resolved = substitute(&value, &mut |_: &Reference| None);
        assert_eq!(resolved, json!("${vpc}"));
        assert_eq!(extract(&resolved).len(), 1);
    }
}
