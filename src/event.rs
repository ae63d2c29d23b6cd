//! Flush events and the meta bag.
//!
//! A [`FlushEvent`] is built for every dirty entity and handed to pre-flush
//! plugins, which may rewrite it before SQL is emitted. Setters keep the
//! kind/before/after invariants intact:
//!
//! - `Insert` has no `before`
//! - `Delete` has no `after`
//! - `Update` has both, and every key of `after` differs from `before`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bind::Bind;

/// Meta key set by the lazy-flush replay path.
pub const META_LAZY: &str = "lazy";
/// Meta key set by `force_delete`, bypasses fake-delete.
pub const META_FORCE_FAKE_DELETE: &str = "force-fake-delete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlushKind {
    Insert,
    Update,
    Delete,
}

impl FlushKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushKind::Insert => "insert",
            FlushKind::Update => "update",
            FlushKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for FlushKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// String to string context propagated from the caller to stream events
/// and audit rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaData(BTreeMap<String, String>);

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Copy every entry of `other` that is not already set here.
    pub fn merge_missing(&mut self, other: &MetaData) {
        for (k, v) in &other.0 {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Mutable record describing one entity write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushEvent {
    entity_name: String,
    id: u64,
    kind: FlushKind,
    before: Option<Bind>,
    after: Option<Bind>,
    #[serde(default, skip_serializing_if = "MetaData::is_empty")]
    meta: MetaData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on_duplicate_key_update: Option<Bind>,
}

impl FlushEvent {
    pub fn insert(entity_name: impl Into<String>, id: u64, after: Bind) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            kind: FlushKind::Insert,
            before: None,
            after: Some(after),
            meta: MetaData::new(),
            on_duplicate_key_update: None,
        }
    }

    pub fn update(entity_name: impl Into<String>, id: u64, before: Bind, after: Bind) -> Self {
        let mut event = Self {
            entity_name: entity_name.into(),
            id,
            kind: FlushKind::Update,
            before: Some(before),
            after: Some(after),
            meta: MetaData::new(),
            on_duplicate_key_update: None,
        };
        event.normalize_update();
        event
    }

    pub fn delete(entity_name: impl Into<String>, id: u64, before: Bind) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            kind: FlushKind::Delete,
            before: Some(before),
            after: None,
            meta: MetaData::new(),
            on_duplicate_key_update: None,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> FlushKind {
        self.kind
    }

    pub fn before(&self) -> Option<&Bind> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&Bind> {
        self.after.as_ref()
    }

    pub fn meta(&self) -> &MetaData {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetaData {
        &mut self.meta
    }

    pub fn on_duplicate_key_update(&self) -> Option<&Bind> {
        self.on_duplicate_key_update.as_ref()
    }

    /// Assign the id of a pending insert.
    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Set a single column in `after`.
    ///
    /// On an update, a value equal to the corresponding `before` entry
    /// removes the column from the change-set instead.
    pub fn set_after_value(&mut self, column: &str, value: Option<String>) {
        if self.kind == FlushKind::Delete {
            return;
        }
        self.after
            .get_or_insert_with(Bind::new)
            .insert_raw(column.to_string(), value);
        if self.kind == FlushKind::Update {
            self.normalize_update();
        }
    }

    /// Turn this event into an update with the given images.
    ///
    /// Used by pre-flush plugins that rewrite deletes (fake-delete). Columns
    /// whose value does not change are dropped from both images.
    pub fn set_update(&mut self, before: Bind, after: Bind) {
        self.kind = FlushKind::Update;
        self.before = Some(before);
        self.after = Some(after);
        self.normalize_update();
    }

    /// Turn this event into a physical delete of the row described by `before`.
    pub fn set_delete(&mut self, before: Bind) {
        self.kind = FlushKind::Delete;
        self.before = Some(before);
        self.after = None;
        self.on_duplicate_key_update = None;
    }

    pub fn set_on_duplicate_key_update(&mut self, bind: Option<Bind>) {
        self.on_duplicate_key_update = bind;
    }

    pub(crate) fn set_meta(&mut self, meta: MetaData) {
        self.meta = meta;
    }

    /// The duplicate-key branch of an upsert fired: only the update columns
    /// changed and the previous row image is unknown.
    pub(crate) fn into_upsert_update(mut self, id: u64) -> Self {
        self.id = id;
        self.kind = FlushKind::Update;
        self.before = None;
        self.after = self.on_duplicate_key_update.take();
        self
    }

    /// An update with nothing left to write.
    pub fn is_empty_update(&self) -> bool {
        self.kind == FlushKind::Update && self.after.as_ref().map_or(true, Bind::is_empty)
    }

    fn normalize_update(&mut self) {
        let (Some(before), Some(after)) = (self.before.as_mut(), self.after.as_mut()) else {
            return;
        };
        let unchanged: Vec<String> = after
            .iter()
            .filter(|(k, v)| before.get(k.as_str()) == Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        for column in unchanged {
            after.remove(&column);
            before.remove(&column);
        }
        let stale: Vec<String> = before
            .keys()
            .filter(|k| !after.contains(k))
            .map(str::to_string)
            .collect();
        for column in stale {
            before.remove(&column);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_drops_unchanged_columns() {
        let event = FlushEvent::update(
            "UserEntity",
            1,
            Bind::new().with("Name", "John").with("Country", "PL"),
            Bind::new().with("Name", "Tom").with("Country", "PL"),
        );
        assert_eq!(event.before(), Some(&Bind::new().with("Name", "John")));
        assert_eq!(event.after(), Some(&Bind::new().with("Name", "Tom")));
    }

    #[test]
    fn test_delete_rewritten_to_update() {
        let mut event = FlushEvent::delete(
            "UserEntity",
            7,
            Bind::new().with("Name", "John").with("FakeDelete", "0"),
        );
        event.set_update(
            Bind::new().with("FakeDelete", "0"),
            Bind::new().with("FakeDelete", "7"),
        );
        assert_eq!(event.kind(), FlushKind::Update);
        assert_eq!(event.after().and_then(|a| a.value("FakeDelete")), Some("7"));
    }

    #[test]
    fn test_set_after_value_equal_to_before_empties_update() {
        let mut event = FlushEvent::update(
            "UserEntity",
            1,
            Bind::new().with("Name", "John"),
            Bind::new().with("Name", "Tom"),
        );
        event.set_after_value("Name", Some("John".to_string()));
        assert!(event.is_empty_update());
        assert_eq!(event.before(), Some(&Bind::new()));
    }

    #[test]
    fn test_upsert_update_branch() {
        let mut event = FlushEvent::insert("UserEntity", 0, Bind::new().with("Name", "Ivona"));
        event.set_on_duplicate_key_update(Some(Bind::new().with("LastName", "Spring")));
        let event = event.into_upsert_update(3);
        assert_eq!(event.kind(), FlushKind::Update);
        assert_eq!(event.id(), 3);
        assert!(event.before().is_none());
        assert_eq!(event.after(), Some(&Bind::new().with("LastName", "Spring")));
    }

    #[test]
    fn test_meta_merge_missing_keeps_existing() {
        let mut meta = MetaData::new().with("lazy", "1");
        meta.merge_missing(&MetaData::new().with("lazy", "0").with("user", "7"));
        assert_eq!(meta.get("lazy"), Some("1"));
        assert_eq!(meta.get("user"), Some("7"));
    }

    #[test]
    fn test_event_json_shape() {
        let event = FlushEvent::insert("UserEntity", 0, Bind::new().with("Name", "Tom"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "Insert");
        assert!(json.get("meta").is_none());
        let back: FlushEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
