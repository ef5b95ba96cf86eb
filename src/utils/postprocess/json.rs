use serde_json::{from_str, Value};
use anyhow::Result;
use std::error::Error;
use std::fmt;
use std::fmt::Formatter;


/// Filters invalid content and tries to parse the valid json string.
///
/// Returns a [serde_json::Value] if the string is valid json else an [InvalidJSON] error.
///
/// # Example
/// ```
/// use intent_tuner::utils::postprocess::json::filter_to_json;
/// let valid_str = "partially valid: {\"label\":\"card_arrival\"}";
/// let json_value = filter_to_json(valid_str).expect("Expect to be fine but failed");
/// assert_eq!(json_value["label"], "card_arrival");
///
/// let invalid_str = "partially valid: \"label\":\"card_arrival\"}";
/// assert_eq!(filter_to_json(invalid_str).is_err(), true)
/// ```
pub fn filter_to_json(string: impl Into<String>) -> Result<Value> {
    let string = string.into();
    let left_brace_idx = string.find('{');
    let right_brace_idx = string.rfind('}');
    match (left_brace_idx, right_brace_idx) {
        (Some(lbi), Some(rbi)) if lbi < rbi => {
            let valid_json = &string[lbi..rbi + 1];
            let value = from_str(valid_json)?;
            Ok(value)
        }
        _ => Err(InvalidJSON { invalid_string: string }.into())
    }
}

/// Reads a string field of a JSON object, treating `null` and non-strings as absent.
pub fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Error when the string is not a valid json.
#[derive(Debug, Clone)]
pub struct InvalidJSON {
    pub invalid_string: String,
}


impl fmt::Display for InvalidJSON {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid string to be parsed:\n{}", self.invalid_string)
    }
}

impl Error for InvalidJSON {}


#[cfg(test)]
mod test_json {
    use crate::utils::postprocess::json::{filter_to_json, str_field};

    #[test]
    fn test_filter_to_json() {
        let valid_str = "{\"label\":\"card_arrival\"}";
        let json_value = filter_to_json(valid_str).expect("Expect to be fine but failed");
        assert_eq!(Some("card_arrival"), str_field(&json_value, "label"));

        let valid_str = "Here is the result you ask for:\n```json\n{\"reasoning\":\"late\",\"label\":\"card_arrival\"}\n```";
        let json_value = filter_to_json(valid_str).expect("Expect to be fine but failed");
        assert_eq!(Some("late"), str_field(&json_value, "reasoning"));

        let invalid_str = "Here is the result you ask for: {\"label\":\"card_arrival\"";
        filter_to_json(invalid_str).expect_err("This should give error but not");

        let invalid_str = "{{}}";
        filter_to_json(invalid_str).expect_err("This should give error but not");

        let invalid_str = "} reversed {";
        filter_to_json(invalid_str).expect_err("This should give error but not");
    }

    #[test]
    fn test_str_field_ignores_null() {
        let value = filter_to_json("{\"reasoning\": null, \"n\": 3}").unwrap();
        assert_eq!(None, str_field(&value, "reasoning"));
        assert_eq!(None, str_field(&value, "n"));
        assert_eq!(None, str_field(&value, "missing"));
    }
}
