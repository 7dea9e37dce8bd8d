use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use std::time::Duration;

/// Parse `Key: Value` header flags. Later duplicates win.
pub fn parse_headers(headers: &[String]) -> Result<IndexMap<String, String>> {
    let mut parsed = IndexMap::new();

    for header in headers {
        let (key, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid header format: {}", header))?;
        parsed.insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(parsed)
}

/// Parse `"30"`, `"30s"`, `"500ms"` or `"5m"` into a [`Duration`].
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let parse = |digits: &str| -> Result<u64> {
        digits
            .parse::<u64>()
            .with_context(|| format!("Invalid duration: {}", value))
    };

    if let Some(millis) = value.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(millis)?))
    } else if let Some(seconds) = value.strip_suffix('s') {
        Ok(Duration::from_secs(parse(seconds)?))
    } else if let Some(minutes) = value.strip_suffix('m') {
        Ok(Duration::from_secs(parse(minutes)? * 60))
    } else {
        Ok(Duration::from_secs(parse(value)?))
    }
}

/// Parse a JSON object flag such as `--overrides='{"express":"latest"}'`.
pub fn parse_json_object(value: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str(value).with_context(|| format!("Invalid JSON: {}", value))? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(anyhow!("Expected a JSON object, got {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers_splits_on_first_colon() {
        let headers = parse_headers(&[
            "Content-Type: application/json".to_string(),
            "X-Url: http://example.com".to_string(),
        ])
        .unwrap();
        assert_eq!(headers["Content-Type"], "application/json");
        assert_eq!(headers["X-Url"], "http://example.com");
        assert!(parse_headers(&["broken".to_string()]).is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_json_object() {
        let map = parse_json_object(r#"{"express":"latest"}"#).unwrap();
        assert_eq!(map["express"], "latest");
        assert!(parse_json_object("[1,2]").is_err());
    }
}
