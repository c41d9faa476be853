use serde_json::Value;

/// Pulls the array bound to `key` out of a model response.
///
/// A clean full-text JSON parse is tried first; failing that, the response is
/// scanned for `"key"` and the following bracket-balanced array, so prose
/// around the JSON body is tolerated.
pub fn extract_array_for_key(response: &str, key: &str) -> Option<Vec<Value>> {
    if let Ok(value) = serde_json::from_str::<Value>(response.trim()) {
        if let Some(Value::Array(items)) = value.get(key) {
            return Some(items.clone());
        }
    }

    let needle = format!("\"{key}\"");
    let mut search_from = 0usize;
    while let Some(found) = response.get(search_from..).and_then(|s| s.find(&needle)) {
        let after_key = search_from + found + needle.len();
        if let Some(candidate) = response
            .get(after_key..)
            .and_then(array_after_colon)
            .and_then(|raw| serde_json::from_str::<Vec<Value>>(raw).ok())
        {
            return Some(candidate);
        }
        search_from = after_key;
    }
    None
}

/// Expects `: [ ... ]` (with arbitrary whitespace) and returns the balanced
/// array slice.
fn array_after_colon(s: &str) -> Option<&str> {
    let colon = s.find(':')?;
    if !s.get(..colon)?.trim().is_empty() {
        return None;
    }
    let rest = s.get(colon + 1..)?;
    let start = rest.find('[')?;
    if !rest.get(..start)?.trim().is_empty() {
        return None;
    }
    balanced_array(rest.get(start..)?)
}

/// Given a slice starting at `[`, returns the prefix up to the matching `]`,
/// honoring JSON string and escape rules. Structural characters are ASCII so
/// a byte scan stays UTF-8 safe.
fn balanced_array(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, byte) in s.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return s.get(..=i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_json_object_parses_directly() {
        let response = r#"{"fact": [["a", "rel", "b"]]}"#;
        let items = extract_array_for_key(response, "fact").unwrap();
        assert_eq!(items, vec![json!(["a", "rel", "b"])]);
    }

    #[test]
    fn json_embedded_in_prose_is_found() {
        let response = "Sure! Here are the relevant facts:\n\
            {\"fact\": [[\"paris\", \"capital of\", \"france\"], [\"france\", \"in\", \"europe\"]]}\n\
            Let me know if you need more.";
        let items = extract_array_for_key(response, "fact").unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn nested_brackets_and_escapes_do_not_confuse_the_scan() {
        let response = r#"noise {"triples": [["a [sic]", "says \"hi\"", "b"]]} trailing"#;
        let items = extract_array_for_key(response, "triples").unwrap();
        assert_eq!(items, vec![json!(["a [sic]", "says \"hi\"", "b"])]);
    }

    #[test]
    fn missing_key_returns_none() {
        assert!(extract_array_for_key("no json here", "fact").is_none());
        assert!(extract_array_for_key(r#"{"other": []}"#, "fact").is_none());
    }

    #[test]
    fn later_occurrence_is_used_when_first_is_malformed() {
        let response = r#"broken "fact": [unclosed ... but {"fact": ["ok"]}"#;
        let items = extract_array_for_key(response, "fact").unwrap();
        assert_eq!(items, vec![json!("ok")]);
    }
}
