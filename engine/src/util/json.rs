//! Safe JSON parsing and first-object extraction from noisy LLM output.

use serde::de::DeserializeOwned;

const MAX_SCAN: usize = 300_000;

/// Best-effort `serde_json::from_str`, returning `None` on any parse error.
pub fn safe_json_parse<T: DeserializeOwned>(s: &str) -> Option<T> {
    serde_json::from_str(s).ok()
}

/// Scan `s` for the first balanced `{...}` or `[...]`, respecting quoted
/// strings and backslash escapes, bounded by a scan cap to avoid pathological
/// inputs. Returns the matched substring.
pub fn first_json_object(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let start_obj = s.find('{');
    let start_arr = s.find('[');
    let start = match (start_obj, start_arr) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth: i64 = 0;
    let mut in_str = false;
    let mut esc = false;
    for (offset, &c) in bytes[start..].iter().enumerate() {
        if offset > MAX_SCAN {
            break;
        }
        if in_str {
            if esc {
                esc = false;
            } else if c == b'\\' {
                esc = true;
            } else if c == b'"' {
                in_str = false;
            }
            continue;
        }
        if c == b'"' {
            in_str = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                let end = start + offset + 1;
                return Some(&s[start..end]);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_balanced_object() {
        let s = "noise before {\"a\": 1, \"b\": [1,2,{\"c\":3}]} trailing";
        let blob = first_json_object(s).unwrap();
        assert_eq!(blob, "{\"a\": 1, \"b\": [1,2,{\"c\":3}]}");
    }

    #[test]
    fn respects_quoted_braces() {
        let s = "{\"a\": \"}not a close{\"}";
        let blob = first_json_object(s).unwrap();
        assert_eq!(blob, s);
    }

    #[test]
    fn returns_none_without_brackets() {
        assert_eq!(first_json_object("no json here"), None);
    }

    #[test]
    fn safe_parse_returns_none_on_garbage() {
        let v: Option<serde_json::Value> = safe_json_parse("{not json");
        assert!(v.is_none());
    }
}
