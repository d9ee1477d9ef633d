//! Structural limits on inbound parameters, checked before authorization.

use serde_json::Value;

use crate::bridge::protocol::Params;
use crate::config::InputLimits;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitViolation {
    #[error("parameters nested deeper than {max} levels")]
    TooDeep { max: usize },
    #[error("string of {len} characters exceeds limit of {max}")]
    StringTooLong { len: usize, max: usize },
    #[error("array of {len} items exceeds limit of {max}")]
    ArrayTooLong { len: usize, max: usize },
}

impl InputLimits {
    pub fn check(&self, params: &Params) -> Result<(), LimitViolation> {
        for (key, value) in params {
            self.check_str(key)?;
            self.check_value(value, 1)?;
        }
        Ok(())
    }

    fn check_value(&self, value: &Value, depth: usize) -> Result<(), LimitViolation> {
        if depth > self.max_depth {
            return Err(LimitViolation::TooDeep {
                max: self.max_depth,
            });
        }
        match value {
            Value::String(s) => self.check_str(s),
            Value::Array(items) => {
                if items.len() > self.max_array_length {
                    return Err(LimitViolation::ArrayTooLong {
                        len: items.len(),
                        max: self.max_array_length,
                    });
                }
                items
                    .iter()
                    .try_for_each(|item| self.check_value(item, depth + 1))
            }
            Value::Object(map) => map.iter().try_for_each(|(key, item)| {
                self.check_str(key)?;
                self.check_value(item, depth + 1)
            }),
            Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
        }
    }

    fn check_str(&self, s: &str) -> Result<(), LimitViolation> {
        // Byte length bounds the char count; only count when it could matter.
        if s.len() > self.max_string_length {
            let len = s.chars().count();
            if len > self.max_string_length {
                return Err(LimitViolation::StringTooLong {
                    len,
                    max: self.max_string_length,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    fn limits() -> InputLimits {
        InputLimits {
            max_depth: 3,
            max_string_length: 8,
            max_array_length: 4,
        }
    }

    #[test]
    fn accepts_within_limits() {
        let p = params(json!({"a": [1, 2, {"b": "short"}], "c": null}));
        assert_eq!(limits().check(&p), Ok(()));
        assert_eq!(limits().check(&Params::new()), Ok(()));
    }

    #[test]
    fn rejects_deep_nesting() {
        let p = params(json!({"a": {"b": {"c": {"d": 1}}}}));
        assert_eq!(limits().check(&p), Err(LimitViolation::TooDeep { max: 3 }));
    }

    #[test]
    fn rejects_long_strings_and_keys() {
        let p = params(json!({"a": "0123456789"}));
        assert!(matches!(
            limits().check(&p),
            Err(LimitViolation::StringTooLong { len: 10, max: 8 })
        ));
        let p = params(json!({"a_very_long_key": 1}));
        assert!(limits().check(&p).is_err());
        // Multibyte characters are counted, not bytes.
        let p = params(json!({"a": "éééééééé"}));
        assert_eq!(limits().check(&p), Ok(()));
    }

    #[test]
    fn rejects_long_arrays() {
        let p = params(json!({"a": [1, 2, 3, 4, 5]}));
        assert_eq!(
            limits().check(&p),
            Err(LimitViolation::ArrayTooLong { len: 5, max: 4 })
        );
    }
}
