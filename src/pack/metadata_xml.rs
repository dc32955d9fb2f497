//! Metadata export payload.
//!
//! One `<value>` element per metadata value, carrying schema, element,
//! qualifier and language as attributes and the value as text. Newlines and
//! tabs are escaped, so every value sits on exactly one line.

use super::{PackError, PackResult};
use crate::content::MetadataValue;

const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

pub fn encode(values: &[MetadataValue]) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    out.push_str("<metadata>\n");
    for value in values {
        out.push_str("  <value");
        push_attr(&mut out, "schema", &value.schema);
        push_attr(&mut out, "element", &value.element);
        if let Some(qualifier) = &value.qualifier {
            push_attr(&mut out, "qualifier", qualifier);
        }
        if let Some(language) = &value.language {
            push_attr(&mut out, "language", language);
        }
        out.push('>');
        out.push_str(&xml_escape(&value.value));
        out.push_str("</value>\n");
    }
    out.push_str("</metadata>\n");
    out
}

pub fn decode(text: &str) -> PackResult<Vec<MetadataValue>> {
    let mut values = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty()
            || line.starts_with("<?xml")
            || matches!(line, "<metadata>" | "</metadata>" | "<metadata/>")
        {
            continue;
        }
        values.push(decode_value(line, line_no)?);
    }
    Ok(values)
}

fn decode_value(line: &str, line_no: usize) -> PackResult<MetadataValue> {
    let malformed = |reason: &str| PackError::MalformedMetadata {
        line: line_no,
        reason: reason.to_string(),
    };

    let rest = line
        .strip_prefix("<value")
        .ok_or_else(|| malformed("expected <value> element"))?;
    let body = rest
        .strip_suffix("</value>")
        .ok_or_else(|| malformed("missing </value>"))?;
    let close = body.find('>').ok_or_else(|| malformed("unterminated start tag"))?;
    let (attrs, text) = (&body[..close], &body[close + 1..]);

    let mut schema = None;
    let mut element = None;
    let mut qualifier = None;
    let mut language = None;
    for (name, value) in parse_attrs(attrs).ok_or_else(|| malformed("bad attribute syntax"))? {
        let value = xml_unescape(value).ok_or_else(|| malformed("bad entity in attribute"))?;
        match name {
            "schema" => schema = Some(value),
            "element" => element = Some(value),
            "qualifier" => qualifier = Some(value),
            "language" => language = Some(value),
            _ => return Err(malformed(&format!("unknown attribute `{name}`"))),
        }
    }

    Ok(MetadataValue {
        schema: schema.ok_or_else(|| malformed("missing schema"))?,
        element: element.ok_or_else(|| malformed("missing element"))?,
        qualifier,
        language,
        value: xml_unescape(text).ok_or_else(|| malformed("bad entity in value"))?,
    })
}

fn parse_attrs(mut input: &str) -> Option<Vec<(&str, &str)>> {
    let mut attrs = Vec::new();
    loop {
        input = input.trim_start();
        if input.is_empty() {
            return Some(attrs);
        }
        let eq = input.find('=')?;
        let name = input[..eq].trim();
        let after = input[eq + 1..].trim_start().strip_prefix('"')?;
        let end = after.find('"')?;
        attrs.push((name, &after[..end]));
        input = &after[end + 1..];
    }
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&xml_escape(value));
    out.push('"');
}

pub(crate) fn xml_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '\n' => escaped.push_str("&#10;"),
            '\r' => escaped.push_str("&#13;"),
            '\t' => escaped.push_str("&#9;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn xml_unescape(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let end = tail.find(';')?;
        let entity = &tail[1..end];
        let ch = match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()?
                } else {
                    entity.strip_prefix('#')?.parse::<u32>().ok()?
                };
                char::from_u32(code)?
            }
        };
        out.push(ch);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_with_markup_and_newlines_survive() {
        let values = vec![
            MetadataValue::new("dc", "title", None, "Rocks & <Minerals>").with_language("en"),
            MetadataValue::new("dc", "description", Some("abstract"), "line one\nline \"two\""),
        ];
        let xml = encode(&values);
        assert_eq!(xml.lines().filter(|l| l.contains("<value")).count(), 2);
        assert_eq!(decode(&xml).unwrap(), values);
    }

    #[test]
    fn empty_export_decodes_to_nothing() {
        assert!(decode(&encode(&[])).unwrap().is_empty());
    }

    #[test]
    fn malformed_line_is_reported_with_position() {
        let xml = "<metadata>\n  <value schema=\"dc\">no element</value>\n</metadata>\n";
        match decode(xml).unwrap_err() {
            PackError::MalformedMetadata { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(decode("<metadata>\n<value schema=\"dc\" element=\"x\">open\n").is_err());
    }
}
