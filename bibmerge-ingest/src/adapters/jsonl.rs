//! Newline-delimited JSON reader shared by the Aminer, MAG and Semantic
//! Scholar adapters
//!
//! Only the first JSON value on a line is used; anything after it is ignored.
//! Invalid UTF-8 is replaced rather than rejected. Lines that do not start
//! with a JSON value are skipped with a warning.

use crate::error::{AdapterError, AdapterResult};
use serde_json::Value;
use std::io::BufRead;
use tracing::warn;

pub struct JsonLines {
    reader: Box<dyn BufRead + Send>,
    label: String,
    line_no: u64,
    buf: Vec<u8>,
    failed: bool,
}

impl JsonLines {
    pub fn new(reader: Box<dyn BufRead + Send>, label: String) -> Self {
        Self {
            reader,
            label,
            line_no: 0,
            buf: Vec::new(),
            failed: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Iterator for JsonLines {
    /// `(line number, value)`
    type Item = AdapterResult<(u64, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    self.failed = true;
                    return Some(Err(AdapterError::Io(e)));
                }
            }
            self.line_no += 1;

            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match first_value(line) {
                Ok(value) => return Some(Ok((self.line_no, value))),
                Err(e) => {
                    warn!(file = %self.label, line = self.line_no, error = %e, "Skipping corrupt JSON line");
                }
            }
        }
    }
}

fn first_value(line: &str) -> Result<Value, serde_json::Error> {
    let mut values = serde_json::Deserializer::from_str(line).into_iter::<Value>();
    match values.next() {
        Some(result) => result,
        None => serde_json::from_str(line),
    }
}

// ===== Field helpers =====

/// String field, `None` when absent, not a string, or blank
pub fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key)?.as_str().and_then(super::non_empty)
}

/// Integer given either as a JSON number or as a numeric string
pub fn int_field(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Free-form text given as a string or a number
pub fn text_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => super::non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Array of strings, non-string entries dropped
pub fn str_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn lines(input: &[u8]) -> JsonLines {
        JsonLines::new(Box::new(Cursor::new(input.to_vec())), "test".to_string())
    }

    #[test]
    fn test_trailing_garbage_and_corrupt_lines() {
        let input = b"{\"id\": 1} trailing junk\nnot json at all\n\n{\"id\": 2}\n";
        let values: Vec<(u64, Value)> = lines(input).map(|r| r.unwrap()).collect();

        assert_eq!(values, vec![(1, json!({"id": 1})), (4, json!({"id": 2}))]);
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let input = b"{\"title\": \"Caf\xe9\"}\n";
        let values: Vec<(u64, Value)> = lines(input).map(|r| r.unwrap()).collect();

        assert_eq!(values.len(), 1);
        assert_eq!(values[0].1["title"], json!("Caf\u{FFFD}"));
    }

    #[test]
    fn test_field_helpers() {
        let value = json!({
            "year": "2019",
            "volume": 12,
            "title": "  ",
            "refs": ["a", 3, "b"],
        });

        assert_eq!(int_field(&value, "year"), Some(2019));
        assert_eq!(text_field(&value, "volume"), Some("12".to_string()));
        assert_eq!(str_field(&value, "title"), None);
        assert_eq!(str_list(&value, "refs"), vec!["a".to_string(), "b".to_string()]);
    }
}
