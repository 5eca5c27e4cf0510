use kubetail_types::{LogFileSpec, LogRecord};

/// Parser for the engine's JSON-lines output
pub struct RecordParser;

impl RecordParser {
    /// Parse one output line into a record
    pub fn parse(line: &str) -> Result<LogRecord, serde_json::Error> {
        serde_json::from_str(line.trim_end_matches(['\r', '\n']))
    }

    /// Parse one output line and stamp it with the file it came from
    pub fn parse_with_source(
        line: &str,
        source: &LogFileSpec,
    ) -> Result<LogRecord, serde_json::Error> {
        Self::parse(line).map(|record| record.with_source(source.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_parse_record() {
        let line = r#"{"timestamp":"2024-01-15T10:30:00.123456789Z","message":"hello"}"#;
        let record = RecordParser::parse(line).unwrap();
        assert_eq!(record.message, "hello");
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
                + chrono::Duration::nanoseconds(123_456_789)
        );
        assert!(record.source.is_none());
    }

    #[test]
    fn test_parse_trailing_newline() {
        let line = "{\"timestamp\":\"2024-01-15T10:30:00Z\",\"message\":\"x\"}\r\n";
        assert_eq!(RecordParser::parse(line).unwrap().message, "x");
    }

    #[test]
    fn test_parse_malformed() {
        assert!(RecordParser::parse("not json").is_err());
        assert!(RecordParser::parse(r#"{"message":"no timestamp"}"#).is_err());
        assert!(RecordParser::parse("").is_err());
    }

    #[test]
    fn test_parse_with_source() {
        let spec = LogFileSpec {
            node_name: "node-1".to_string(),
            namespace: "ns".to_string(),
            pod_name: "pod".to_string(),
            container_name: "c".to_string(),
            container_id: "abc".to_string(),
        };
        let line = r#"{"timestamp":"2024-01-15T10:30:00Z","message":"m"}"#;
        let record = RecordParser::parse_with_source(line, &spec).unwrap();
        assert_eq!(record.source, Some(spec));
    }
}
