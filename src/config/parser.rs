//! Line-oriented `key value` configuration format
//!
//! ```text
//! # SOCKS5 side
//! socks_port 34567
//! aquasent_port /dev/ttyUSB0
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. A later key
//! overrides an earlier one. Values made only of digits become integers;
//! wrap a value in double quotes to keep it a string.

use toml::{Table, Value};

/// Error for a line that is not `key value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    /// One-based line number
    pub line: usize,
    /// Offending content
    pub content: String,
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: expected `key value`, got {:?}", self.line, self.content)
    }
}

impl std::error::Error for LineError {}

fn value_of(raw: &str) -> Value {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(number) = raw.parse::<i64>() {
            return Value::Integer(number);
        }
    }
    Value::String(raw.to_string())
}

/// Parse `key value` lines into a flat table
pub fn parse_lines(content: &str) -> Result<Table, LineError> {
    let mut table = Table::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let key = parts.next().unwrap_or_default();
        let value = parts.next().map(str::trim).unwrap_or_default();
        if value.is_empty() {
            return Err(LineError {
                line: index + 1,
                content: line.to_string(),
            });
        }
        table.insert(key.to_string(), value_of(value));
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lines() {
        let table = parse_lines(
            "# comment\n\nsocks_addr 127.0.0.1\nsocks_port   1080\naquasent_name \"01\"\n",
        )
        .unwrap();
        assert_eq!(table["socks_addr"], Value::String("127.0.0.1".into()));
        assert_eq!(table["socks_port"], Value::Integer(1080));
        assert_eq!(table["aquasent_name"], Value::String("01".into()));
    }

    #[test]
    fn test_later_key_wins() {
        let table = parse_lines("log_level info\nlog_level debug\n").unwrap();
        assert_eq!(table["log_level"], Value::String("debug".into()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_key_without_value_is_rejected() {
        let err = parse_lines("socks_port 1\naquasent_port\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.to_string().contains("aquasent_port"));
    }
}
