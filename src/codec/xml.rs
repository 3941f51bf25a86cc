//! XML bridge for dynamic maps.
//!
//! Objects become nested elements under a single `<xml>` root, arrays repeat
//! their parent element, scalars become text nodes. Decoding produces string
//! leaves; repeated sibling elements collapse into arrays.

use eyre::Result;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::defs::{Map, Value};

pub fn to_xml(value: &Value) -> String {
    let mut out = String::from("<xml>");
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                write_element(&mut out, k, v);
            }
        }
        other => out.push_str(&escape(&crate::defs::text_of(other))),
    }
    out.push_str("</xml>");
    out
}

fn write_element(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(out, name, item);
            }
        }
        Value::Object(map) => {
            out.push_str(&format!("<{name}>"));
            for (k, v) in map {
                write_element(out, k, v);
            }
            out.push_str(&format!("</{name}>"));
        }
        other => {
            out.push_str(&format!(
                "<{name}>{}</{name}>",
                escape(&crate::defs::text_of(other))
            ));
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn from_xml(text: &str) -> Result<Value> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    // the stack holds the partially-built object for each open element
    let mut stack: Vec<(String, Map, String)> = vec![(String::new(), Map::new(), String::new())];

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                stack.push((name, Map::new(), String::new()));
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.2.push_str(&t.unescape()?);
                }
            }
            Event::End(_) => {
                let (name, children, text) = stack.pop().unwrap_or_default();
                let value = if children.is_empty() {
                    Value::String(text)
                } else {
                    Value::Object(children)
                };
                if let Some((_, parent, _)) = stack.last_mut() {
                    insert_repeating(parent, &name, value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let (_, root, _) = stack.pop().unwrap_or_default();
    // unwrap the single root element when present
    if root.len() == 1 {
        if let Some(Value::Object(inner)) = root.values().next() {
            return Ok(Value::Object(inner.clone()));
        }
    }
    Ok(Value::Object(root))
}

fn insert_repeating(map: &mut Map, name: &str, value: Value) {
    match map.get_mut(name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(name.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_roundtrip() {
        let v = json!({ "name": "neo", "tags": ["a", "b"], "nested": { "x": "1" } });
        let xml = to_xml(&v);
        let back = from_xml(&xml).unwrap();
        assert_eq!(back["name"], json!("neo"));
        assert_eq!(back["tags"], json!(["a", "b"]));
        assert_eq!(back["nested"]["x"], json!("1"));
    }

    #[test]
    fn scalars_escape_markup() {
        let v = json!({ "t": "a<b&c" });
        let xml = to_xml(&v);
        assert!(xml.contains("a&lt;b&amp;c"));
        assert_eq!(from_xml(&xml).unwrap()["t"], json!("a<b&c"));
    }
}
