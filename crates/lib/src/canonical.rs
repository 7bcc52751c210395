//! Canonical JSON encoding.
//!
//! Produces a byte string that is a deterministic function of a value tree:
//! mapping keys sorted by code point, no insignificant whitespace, integers
//! as bare digits, and strings escaped to ASCII with `\uXXXX` sequences
//! (surrogate pairs for characters outside the BMP). Two value trees encode
//! to the same string exactly when they are equal, which makes the encoding
//! suitable as a digest input.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodingError {
  /// Floats have no canonical textual form here; the manifest boundary
  /// accepts integers and strings for numeric fields that must round-trip.
  #[error("cannot canonically encode number `{0}`")]
  Number(String),
}

/// Encode a value tree as canonical JSON.
pub fn encode(value: &Value) -> Result<String, EncodingError> {
  let mut out = String::new();
  encode_value(value, &mut out)?;
  Ok(out)
}

fn encode_value(value: &Value, out: &mut String) -> Result<(), EncodingError> {
  match value {
    Value::Null => out.push_str("null"),
    Value::Bool(true) => out.push_str("true"),
    Value::Bool(false) => out.push_str("false"),
    Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
      } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
      } else {
        return Err(EncodingError::Number(n.to_string()));
      }
    }
    Value::String(s) => encode_string(s, out),
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        encode_value(item, out)?;
      }
      out.push(']');
    }
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        encode_string(key, out);
        out.push(':');
        encode_value(&map[key.as_str()], out)?;
      }
      out.push('}');
    }
  }
  Ok(())
}

fn encode_string(s: &str, out: &mut String) {
  out.push('"');
  for c in s.chars() {
    match c {
      '"' => out.push_str("\\\""),
      '\\' => out.push_str("\\\\"),
      '\n' => out.push_str("\\n"),
      '\r' => out.push_str("\\r"),
      '\t' => out.push_str("\\t"),
      '\u{0008}' => out.push_str("\\b"),
      '\u{000C}' => out.push_str("\\f"),
      c if (' '..='\u{007e}').contains(&c) => out.push(c),
      c => {
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units) {
          out.push_str(&format!("\\u{:04x}", unit));
        }
      }
    }
  }
  out.push('"');
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn scalars() {
    assert_eq!(encode(&json!(null)).unwrap(), "null");
    assert_eq!(encode(&json!(true)).unwrap(), "true");
    assert_eq!(encode(&json!(false)).unwrap(), "false");
    assert_eq!(encode(&json!(42)).unwrap(), "42");
    assert_eq!(encode(&json!(-7)).unwrap(), "-7");
    assert_eq!(encode(&json!(0)).unwrap(), "0");
    assert_eq!(encode(&json!(u64::MAX)).unwrap(), u64::MAX.to_string());
  }

  #[test]
  fn keys_sorted_no_whitespace() {
    let value = json!({"b": 1, "a": [1, 2, {"z": null, "y": "x"}]});
    assert_eq!(encode(&value).unwrap(), r#"{"a":[1,2,{"y":"x","z":null}],"b":1}"#);
  }

  #[test]
  fn string_escapes() {
    assert_eq!(encode(&json!("a\"b\\c")).unwrap(), "\"a\\\"b\\\\c\"");
    assert_eq!(encode(&json!("line\nbreak\ttab")).unwrap(), "\"line\\nbreak\\ttab\"");
    assert_eq!(encode(&json!("\u{0001}")).unwrap(), "\"\\u0001\"");
  }

  #[test]
  fn non_ascii_escaped_to_bmp_units() {
    assert_eq!(encode(&json!("h\u{00e9}llo")).unwrap(), "\"h\\u00e9llo\"");
    // Outside the BMP: surrogate pair.
    assert_eq!(encode(&json!("\u{1d11e}")).unwrap(), "\"\\ud834\\udd1e\"");
  }

  #[test]
  fn floats_rejected() {
    assert!(matches!(encode(&json!(1.5)), Err(EncodingError::Number(_))));
  }

  #[test]
  fn equal_trees_encode_equally() {
    let a = json!({"x": {"k": [1, "two"]}, "y": 3});
    let b = json!({"y": 3, "x": {"k": [1, "two"]}});
    assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
  }
}
