//! Tag strings.
//!
//! Field annotations are written as `name;name=value;...`. A bare name reads
//! as present-without-argument.

use std::collections::{BTreeMap, HashMap};

/// Field name under which entity-level tags are stored.
pub const ENTITY_TAG_FIELD: &str = "ORM";

/// Parse `"unique=Name;required;skip-crud-stream"` into a tag map.
pub fn parse_tags(source: &str) -> BTreeMap<String, String> {
    source
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

/// Per-(field, tag) string map shared by every column of one entity.
#[derive(Debug, Clone, Default)]
pub struct TagBag(HashMap<String, BTreeMap<String, String>>);

impl TagBag {
    pub(crate) fn insert_field(&mut self, field: &str, tags: BTreeMap<String, String>) {
        if !tags.is_empty() {
            self.0.entry(field.to_string()).or_default().extend(tags);
        }
    }

    /// Raw tag value. `Some("")` when the tag is present without argument.
    pub fn raw(&self, field: &str, tag: &str) -> Option<&str> {
        self.0
            .get(field)
            .and_then(|tags| tags.get(tag))
            .map(String::as_str)
    }

    pub fn has(&self, field: &str, tag: &str) -> bool {
        self.raw(field, tag).is_some()
    }

    /// `true_value` if the tag is present without argument (or `true`),
    /// `false_value` if absent (or `false`), the argument otherwise.
    pub fn get(&self, field: &str, tag: &str, true_value: &str, false_value: &str) -> String {
        match self.raw(field, tag) {
            None | Some("false") => false_value.to_string(),
            Some("") | Some("true") => true_value.to_string(),
            Some(value) => value.to_string(),
        }
    }

    pub fn field_tags(&self, field: &str) -> Option<&BTreeMap<String, String>> {
        self.0.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("unique=Name; required ;;log-table=audit");
        assert_eq!(tags.get("unique").map(String::as_str), Some("Name"));
        assert_eq!(tags.get("required").map(String::as_str), Some(""));
        assert_eq!(tags.get("log-table").map(String::as_str), Some("audit"));
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn test_get_tag_semantics() {
        let mut bag = TagBag::default();
        bag.insert_field("Name", parse_tags("crud-stream;fk=skip;cached=false"));
        assert_eq!(bag.get("Name", "crud-stream", "yes", "no"), "yes");
        assert_eq!(bag.get("Name", "fk", "yes", "no"), "skip");
        assert_eq!(bag.get("Name", "cached", "yes", "no"), "no");
        assert_eq!(bag.get("Name", "missing", "yes", "no"), "no");
        assert_eq!(bag.get("Other", "crud-stream", "yes", "no"), "no");
    }
}
