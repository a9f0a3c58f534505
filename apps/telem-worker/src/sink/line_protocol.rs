//! InfluxDB v2 line protocol encoding.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ns
//! ```

use crate::telemetry::{FieldValue, Record};

impl FieldValue {
    /// Floats are written bare, so `1.0` encodes as `1` and is still
    /// stored as a float (integers would need an `i` suffix).
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Boolean(v) => {
                if *v {
                    "true".to_string()
                } else {
                    "false".to_string()
                }
            }
            FieldValue::String(v) => {
                let escaped = v
                    .replace('\\', "\\\\")
                    .replace('"', "\\\"")
                    .replace('\n', "\\n")
                    .replace('\r', "\\r");
                format!("\"{}\"", escaped)
            }
        }
    }
}

impl Record {
    /// Tags and fields come out sorted by key.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(self.measurement);

        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line.push(' ');
        // Out-of-range timestamps never reach a record; see `timestamp::resolve`.
        let nanos = self.timestamp.timestamp_nanos_opt().unwrap_or_default();
        line.push_str(&nanos.to_string());
        line
    }
}

fn escape_measurement(s: &str) -> String {
    escape(s, &[',', ' '])
}

/// Tag keys, tag values and field keys share one escaping rule.
fn escape_key(s: &str) -> String {
    escape(s, &[',', '=', ' '])
}

/// Prefixes `special` with a backslash and writes control characters as
/// two-character escapes, so one record is always one line. A run of
/// backslashes that ends right before an escape or the end of the token is
/// padded to an even length; an odd run would swallow the next separator.
fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    let mut run = 0usize;
    for c in s.chars() {
        match c {
            '\\' => {
                run += 1;
                out.push(c);
                continue;
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if special.contains(&c) => {
                pad_backslashes(&mut out, run);
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
        run = 0;
    }
    pad_backslashes(&mut out, run);
    out
}

fn pad_backslashes(out: &mut String, run: usize) {
    if run % 2 == 1 {
        out.push('\\');
    }
}
