//! SCI/RCI envelope construction and XML document parsing.
//!
//! Device commands travel through the cloud's `sci` resource as nested XML:
//! a versioned `sci_request` wrapper, a `send_message`/`data_service` block
//! addressing one device by id, and an inner versioned `rci_request` carrying
//! the actual command (`query_setting`, `set_setting`, `set_state`). Rather
//! than model every shape with structs, documents are represented as
//! `serde_json::Value` trees using the conventions most dynamic XML mappers
//! share: attributes become `"@name"` keys, element text becomes `"#text"`,
//! and repeated sibling elements collapse into arrays. [`to_xml`] and
//! [`from_xml`] convert between the two representations; the `*_request`
//! builders produce ready-to-POST envelope bodies.
//!
//! Everything in this module is format-only. No state, no I/O.

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde_json::{Map, Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("xml write error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Build an RCI `query_setting` envelope. When `settings_group` is given the
/// query is scoped to that single group; otherwise the device reports all
/// groups. `cache` selects the cloud-side settings cache over a live device
/// round trip.
pub fn query_setting_request(
    device_id: &str,
    settings_group: Option<&str>,
    cache: bool,
) -> Result<String, EnvelopeError> {
    let query = match settings_group {
        Some(group) => json!({ group: {} }),
        None => json!({}),
    };
    let doc = json!({
        "sci_request": {
            "@version": "1.0",
            "send_message": {
                "@cache": cache.to_string(),
                "targets": { "device": { "@id": device_id } },
                "rci_request": {
                    "@version": "1.1",
                    "query_setting": query,
                },
            },
        },
    });
    to_xml(&doc)
}

/// Build an RCI `set_setting` envelope from a nested settings tree of the
/// form `{"group": {"key": value, ...}, ...}`.
pub fn set_setting_request(device_id: &str, settings: &Value) -> Result<String, EnvelopeError> {
    let doc = json!({
        "sci_request": {
            "@version": "1.0",
            "send_message": {
                "@cache": "false",
                "targets": { "device": { "@id": device_id } },
                "rci_request": {
                    "@version": "1.1",
                    "set_setting": settings,
                },
            },
        },
    });
    to_xml(&doc)
}

/// Build the combined output-mask / io-level `set_state` envelope. The `OM`
/// element must precede `IO` in the rendered document; the device applies the
/// enable mask first, then the levels.
pub fn set_output_request(
    device_id: &str,
    enable_mask: &str,
    io_mask: &str,
) -> Result<String, EnvelopeError> {
    let doc = json!({
        "sci_request": {
            "@version": "1.0",
            "send_message": {
                "targets": { "device": { "@id": device_id } },
                "rci_request": {
                    "@version": "1.1",
                    "set_state": {
                        "Executable": {
                            "OM": enable_mask,
                            "IO": io_mask,
                        },
                    },
                },
            },
        },
    });
    to_xml(&doc)
}

/// Build a data-service envelope delivering a base64 payload to the device
/// serial port. `target_name` selects a data service target for modules in
/// API mode; transparent-mode modules use the empty default.
pub fn serial_data_request(
    device_id: &str,
    target_name: &str,
    data_b64: &str,
) -> Result<String, EnvelopeError> {
    let doc = json!({
        "sci_request": {
            "@version": "1.0",
            "data_service": {
                "targets": { "device": { "@id": device_id } },
                "requests": {
                    "device_request": {
                        "@target_name": target_name,
                        "@format": "base64",
                        "#text": data_b64,
                    },
                },
            },
        },
    });
    to_xml(&doc)
}

/// Serialize a document tree to an XML string. The tree must be an object
/// with exactly one root element.
pub fn to_xml(doc: &Value) -> Result<String, EnvelopeError> {
    let root = doc
        .as_object()
        .filter(|map| map.len() == 1)
        .ok_or_else(|| {
            EnvelopeError::Malformed("document must have exactly one root element".into())
        })?;

    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    for (name, value) in root {
        write_element(&mut writer, name, value)?;
    }
    String::from_utf8(writer.into_inner())
        .map_err(|e| EnvelopeError::Malformed(format!("non-utf8 output: {e}")))
}

fn write_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    value: &Value,
) -> Result<(), EnvelopeError> {
    match value {
        // Repeated sibling elements
        Value::Array(items) => {
            for item in items {
                write_element(writer, name, item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            let mut attrs: Vec<(&str, String)> = Vec::new();
            let mut text = None;
            let mut children: Vec<(&String, &Value)> = Vec::new();
            for (key, val) in map {
                if let Some(attr) = key.strip_prefix('@') {
                    attrs.push((attr, scalar_text(val)?));
                } else if key == "#text" {
                    text = Some(scalar_text(val)?);
                } else {
                    children.push((key, val));
                }
            }
            let mut start = BytesStart::new(name);
            for (attr, value) in &attrs {
                start.push_attribute((*attr, value.as_str()));
            }
            if text.is_none() && children.is_empty() {
                writer.write_event(Event::Empty(start))?;
                return Ok(());
            }
            writer.write_event(Event::Start(start))?;
            if let Some(text) = text {
                writer.write_event(Event::Text(BytesText::new(&text)))?;
            }
            for (key, val) in children {
                write_element(writer, key, val)?;
            }
            writer.write_event(Event::End(BytesEnd::new(name)))?;
            Ok(())
        }
        Value::Null => {
            writer.write_event(Event::Empty(BytesStart::new(name)))?;
            Ok(())
        }
        scalar => {
            writer.write_event(Event::Start(BytesStart::new(name)))?;
            writer.write_event(Event::Text(BytesText::new(&scalar_text(scalar)?)))?;
            writer.write_event(Event::End(BytesEnd::new(name)))?;
            Ok(())
        }
    }
}

fn scalar_text(value: &Value) -> Result<String, EnvelopeError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(EnvelopeError::Malformed(format!(
            "expected scalar value, got {other}"
        ))),
    }
}

/// Parse an XML document into a `serde_json::Value` tree. Attributes map to
/// `"@name"` keys, element text to `"#text"` (or directly to a string when
/// the element has no attributes or children), empty elements to `null`, and
/// repeated siblings to arrays.
pub fn from_xml(xml: &str) -> Result<Value, EnvelopeError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // Bottom of the stack holds the document root's children.
    let mut stack: Vec<(String, Map<String, Value>)> = vec![(String::new(), Map::new())];

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut map = Map::new();
                collect_attributes(&start, &mut map)?;
                stack.push((name, map));
            }
            Event::Empty(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut map = Map::new();
                collect_attributes(&start, &mut map)?;
                let parent = &mut stack
                    .last_mut()
                    .ok_or_else(|| EnvelopeError::Malformed("unbalanced document".into()))?
                    .1;
                insert_child(parent, name, finalize(map));
            }
            Event::Text(text) => {
                let content = text.unescape()?.into_owned();
                append_text(&mut stack, &content)?;
            }
            Event::CData(data) => {
                let content = String::from_utf8_lossy(data.as_ref()).into_owned();
                append_text(&mut stack, &content)?;
            }
            Event::End(_) => {
                let (name, map) = stack
                    .pop()
                    .ok_or_else(|| EnvelopeError::Malformed("unbalanced document".into()))?;
                let parent = &mut stack
                    .last_mut()
                    .ok_or_else(|| EnvelopeError::Malformed("unbalanced document".into()))?
                    .1;
                insert_child(parent, name, finalize(map));
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(EnvelopeError::Malformed("unbalanced document".into()));
    }
    let (_, root) = stack.remove(0);
    if root.is_empty() {
        return Err(EnvelopeError::Malformed("empty document".into()));
    }
    Ok(Value::Object(root))
}

fn collect_attributes(start: &BytesStart<'_>, map: &mut Map<String, Value>) -> Result<(), EnvelopeError> {
    for attr in start.attributes() {
        let attr = attr.map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
        let value = attr
            .unescape_value()
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?
            .into_owned();
        map.insert(key, Value::String(value));
    }
    Ok(())
}

fn append_text(
    stack: &mut [(String, Map<String, Value>)],
    content: &str,
) -> Result<(), EnvelopeError> {
    if content.is_empty() {
        return Ok(());
    }
    let current = &mut stack
        .last_mut()
        .ok_or_else(|| EnvelopeError::Malformed("text outside of document".into()))?
        .1;
    match current.get_mut("#text") {
        Some(Value::String(existing)) => existing.push_str(content),
        _ => {
            current.insert("#text".into(), Value::String(content.to_string()));
        }
    }
    Ok(())
}

/// Collapse a finished element: text-only elements become plain strings,
/// childless elements become `null`.
fn finalize(map: Map<String, Value>) -> Value {
    if map.is_empty() {
        return Value::Null;
    }
    if map.len() == 1 {
        if let Some(Value::String(text)) = map.get("#text") {
            return Value::String(text.clone());
        }
    }
    Value::Object(map)
}

fn insert_child(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_setting_envelope_shape() {
        let xml = query_setting_request("00000000-00000000-00409DFF-FF000000", None, false)
            .expect("build envelope");
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains(r#"<sci_request version="1.0">"#));
        assert!(xml.contains(r#"<send_message cache="false">"#));
        assert!(xml.contains(r#"<device id="00000000-00000000-00409DFF-FF000000"/>"#));
        assert!(xml.contains(r#"<rci_request version="1.1"><query_setting/></rci_request>"#));
    }

    #[test]
    fn query_setting_scoped_to_group() {
        let xml = query_setting_request("dev", Some("InputOutput"), true).expect("build envelope");
        assert!(xml.contains(r#"<send_message cache="true">"#));
        assert!(xml.contains("<query_setting><InputOutput/></query_setting>"));
    }

    #[test]
    fn set_output_orders_enable_mask_before_levels() {
        let xml = set_output_request("dev", "0x5", "0x4").expect("build envelope");
        let om = xml.find("<OM>0x5</OM>").expect("OM present");
        let io = xml.find("<IO>0x4</IO>").expect("IO present");
        assert!(om < io, "OM must be rendered before IO");
    }

    #[test]
    fn serial_request_carries_payload_as_text() {
        let xml = serial_data_request("dev", "", "aGVsbG8=").expect("build envelope");
        assert!(xml.contains(r#"<device_request target_name="" format="base64">aGVsbG8=</device_request>"#));
    }

    #[test]
    fn set_setting_renders_nested_groups() {
        let settings = json!({ "InputOutput": { "D1": "ADC", "IR": "5000" } });
        let xml = set_setting_request("dev", &settings).expect("build envelope");
        assert!(xml.contains("<set_setting><InputOutput><D1>ADC</D1><IR>5000</IR></InputOutput></set_setting>"));
    }

    #[test]
    fn parse_roundtrips_attributes_text_and_nesting() {
        let xml = r#"<?xml version="1.0"?>
            <sci_reply version="1.0">
              <send_message>
                <device id="dev1">
                  <rci_reply version="1.1">
                    <query_setting>
                      <InputOutput><D1>ADC</D1><IR>5000</IR></InputOutput>
                    </query_setting>
                  </rci_reply>
                </device>
              </send_message>
            </sci_reply>"#;
        let doc = from_xml(xml).expect("parse");
        assert_eq!(doc["sci_reply"]["@version"], "1.0");
        let device = &doc["sci_reply"]["send_message"]["device"];
        assert_eq!(device["@id"], "dev1");
        assert_eq!(
            device["rci_reply"]["query_setting"]["InputOutput"]["IR"],
            "5000"
        );
    }

    #[test]
    fn parse_collapses_repeated_elements_into_array() {
        let xml = r#"<result><Monitor><monId>1</monId></Monitor><Monitor><monId>2</monId></Monitor></result>"#;
        let doc = from_xml(xml).expect("parse");
        let monitors = doc["result"]["Monitor"].as_array().expect("array");
        assert_eq!(monitors.len(), 2);
        assert_eq!(monitors[1]["monId"], "2");
    }

    #[test]
    fn parse_empty_element_is_null() {
        let doc = from_xml("<reply><query_setting/></reply>").expect("parse");
        assert!(doc["reply"]["query_setting"].is_null());
    }

    #[test]
    fn escaped_text_is_unescaped_and_reescaped() {
        let doc = json!({ "root": { "value": "a < b & c" } });
        let xml = to_xml(&doc).expect("serialize");
        assert!(xml.contains("a &lt; b &amp; c"));
        let back = from_xml(&xml).expect("parse");
        assert_eq!(back["root"]["value"], "a < b & c");
    }
}
