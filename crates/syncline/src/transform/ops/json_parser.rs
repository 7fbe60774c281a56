use quick_xml::{events::Event, Reader};

use super::{require_str, string_list};
use crate::{
    row::{Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "json_parser";

/// Extracts fields from an embedded JSON or XML document column. Dotted
/// paths walk objects and array indices; the extracted field lands in a
/// sibling column named after the last path segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParserTransformation;

impl Transformation for JsonParserTransformation {
    fn type_name(&self) -> &'static str {
        "json_parser"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        require_str(config, "source_column", OPERATOR)?;
        let format = require_str(config, "format", OPERATOR)?;
        if format != "json" && format != "xml" {
            return Err(TransformError::invalid(
                OPERATOR,
                format!("invalid format: {format}"),
            ));
        }
        string_list(config, "fields_to_extract", OPERATOR)?;
        Ok(())
    }

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let source_column = require_str(config, "source_column", OPERATOR)?.to_string();
        let format = require_str(config, "format", OPERATOR)?.to_string();
        let fields = string_list(config, "fields_to_extract", OPERATOR)?;

        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            let extracted = match row.get(&source_column) {
                None => Row::new(),
                Some(source) if format == "json" => extract_json(source, &fields),
                Some(source) => {
                    let xml = match source {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    extract_xml(&xml, &fields)
                }
            };
            for (column, value) in extracted {
                row.insert(column, value);
            }
            out.push(row);
        }
        Ok(out)
    }
}

fn extract_json(source: &Value, fields: &[String]) -> Row {
    let parsed;
    let document = match source {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => {
                parsed = value;
                &parsed
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedded JSON did not parse");
                return Row::new();
            }
        },
        other => other,
    };
    if !document.is_object() && !document.is_array() {
        return Row::new();
    }

    let mut extracted = Row::new();
    if fields.is_empty() {
        if let Some(object) = document.as_object() {
            return object.clone();
        }
        return extracted;
    }
    for path in fields {
        let value = walk_path(document, path);
        if !value.is_null() {
            let name = path.rsplit('.').next().unwrap_or(path);
            extracted.insert(name.to_string(), value);
        }
    }
    extracted
}

fn walk_path(document: &Value, path: &str) -> Value {
    let mut current = document;
    for segment in path.split('.') {
        current = match current {
            Value::Object(object) => match object.get(segment) {
                Some(next) => next,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// Flat tag extraction: the text content of the first element whose name
/// matches each requested field.
fn extract_xml(xml: &str, fields: &[String]) -> Row {
    let mut extracted = Row::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current_tag: Option<String> = None;
    let mut buffer = Vec::new();
    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                current_tag = Some(name);
            }
            Ok(Event::Text(text)) => {
                if let Some(tag) = &current_tag {
                    if fields.contains(tag) && !extracted.contains_key(tag) {
                        if let Ok(value) = text.decode() {
                            extracted.insert(tag.clone(), Value::String(value.into_owned()));
                        }
                    }
                }
            }
            Ok(Event::End(_)) => current_tag = None,
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!(error = %e, "embedded XML did not parse");
                break;
            }
            Ok(_) => {}
        }
        buffer.clear();
    }
    extracted
}
