//! Column-name to value maps.
//!
//! A [`Bind`] is the unit of change-data in the pipeline: entity snapshots,
//! flush event before/after images, and CDC payloads are all binds. Values
//! are stored in the textual form MySQL returns them in, `None` is SQL NULL.
//! Insertion order is preserved so emitted SQL follows declaration order.

use std::fmt::Display;
use std::str::FromStr;

use indexmap::map::Iter;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bind(IndexMap<String, Option<String>>);

impl Bind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column to a non-NULL value.
    pub fn set(&mut self, column: impl Into<String>, value: impl Display) -> &mut Self {
        self.0.insert(column.into(), Some(value.to_string()));
        self
    }

    /// Set a column to NULL.
    pub fn set_null(&mut self, column: impl Into<String>) -> &mut Self {
        self.0.insert(column.into(), None);
        self
    }

    /// Set a nullable column.
    pub fn set_opt<V: Display>(&mut self, column: impl Into<String>, value: Option<V>) -> &mut Self {
        self.0.insert(column.into(), value.map(|v| v.to_string()));
        self
    }

    /// Booleans are stored as `0`/`1`.
    pub fn set_bool(&mut self, column: impl Into<String>, value: bool) -> &mut Self {
        self.set(column, if value { "1" } else { "0" })
    }

    pub fn insert_raw(&mut self, column: impl Into<String>, value: Option<String>) {
        self.0.insert(column.into(), value);
    }

    /// Builder form of [`Bind::set`].
    pub fn with(mut self, column: impl Into<String>, value: impl Display) -> Self {
        self.set(column, value);
        self
    }

    /// Builder form of [`Bind::set_null`].
    pub fn with_null(mut self, column: impl Into<String>) -> Self {
        self.set_null(column);
        self
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    /// Raw value. `None` when the column is absent, `Some(None)` for NULL.
    pub fn get(&self, column: &str) -> Option<&Option<String>> {
        self.0.get(column)
    }

    /// Non-NULL value of a column.
    pub fn value(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(|v| v.as_deref())
    }

    /// Parse a non-NULL value. Absent, NULL, or unparsable values yield `None`.
    pub fn parse<T: FromStr>(&self, column: &str) -> Option<T> {
        self.value(column).and_then(|v| v.parse().ok())
    }

    /// Any stored value other than `0` reads as true, so fake-deleted rows
    /// (whose flag column holds the row id) hydrate as deleted.
    pub fn get_bool(&self, column: &str) -> bool {
        matches!(self.value(column), Some(v) if v != "0" && !v.is_empty())
    }

    pub fn remove(&mut self, column: &str) -> Option<Option<String>> {
        self.0.shift_remove(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> Iter<'_, String, Option<String>> {
        self.0.iter()
    }

    /// Overlay `other` on top of this bind.
    pub fn merge(&mut self, other: &Bind) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Columns whose value in `current` differs from `self`.
    ///
    /// Returns `(before, after)` restricted to the changed columns, in
    /// `current`'s order. Columns missing from `self` count as changed.
    pub fn diff(&self, current: &Bind) -> (Bind, Bind) {
        let mut before = Bind::new();
        let mut after = Bind::new();
        for (column, value) in current.iter() {
            match self.0.get(column) {
                Some(old) if old == value => {}
                Some(old) => {
                    before.insert_raw(column.clone(), old.clone());
                    after.insert_raw(column.clone(), value.clone());
                }
                None => {
                    before.insert_raw(column.clone(), None);
                    after.insert_raw(column.clone(), value.clone());
                }
            }
        }
        (before, after)
    }
}

impl<'a> IntoIterator for &'a Bind {
    type Item = (&'a String, &'a Option<String>);
    type IntoIter = Iter<'a, String, Option<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(String, Option<String>)> for Bind {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
