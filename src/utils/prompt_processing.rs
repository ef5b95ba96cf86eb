use std::collections::{HashMap, HashSet};
use regex::{Captures, Regex};
use lazy_static::lazy_static;


lazy_static! {
    pub(crate) static ref PLACEHOLDER_MATCH_RE: Regex = Regex::new(r"\{\[.*?\]\}").unwrap();
}

#[inline]
pub(crate) fn strip_format(key: &str) -> &str {
    //! Strips "{\[" and "\]}" for a string, which is algorithmically unsafe.
    //! Ensure the string is properly formatted like "{\[a\]}".
    &key[2..key.len() - 2]
}

/// Replaces all placeholders in a single pass, so filling values are never expanded again.
/// Placeholders missing from the mapping are kept verbatim.
pub(crate) fn replace_all_placeholders(original: &str, mapping: &HashMap<&str, &str>) -> String {
    PLACEHOLDER_MATCH_RE.replace_all(original, |captures: &Captures| {
        let match_text = &captures[0];
        let key = strip_format(match_text);
        match mapping.get(key) {
            Some(replacement) => replacement.to_string(),
            None => match_text.to_string(),
        }
    }).into_owned()
}

pub fn get_placeholders(string: &str) -> HashSet<String> {
    PLACEHOLDER_MATCH_RE.captures_iter(string)
        .map(|captures| strip_format(&captures[0]).to_string())
        .collect()
}
