use crate::sharding::EntityId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// A persisted aggregate. The backend stamps `id` and `version` into the
/// stored document, so both fields must deserialize from the row body.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Logical table name.
    const KIND: &'static str;

    /// Typed field-equality constraints usable in a [`Predicate`].
    type Filter: FieldFilter;

    fn id(&self) -> EntityId;

    fn version(&self) -> i64;

    /// Natural keys that must be unique within the partition.
    fn unique_keys(&self) -> Vec<UniqueKey> {
        Vec::new()
    }
}

/// One `field = value` constraint on an entity's serialized form.
pub trait FieldFilter: Send + Sync {
    fn field(&self) -> &'static str;

    fn value(&self) -> Value;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueKey {
    pub field: &'static str,
    pub value: String,
}

impl UniqueKey {
    pub fn new(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

/// Conjunction of typed field-equality constraints. An empty predicate
/// matches every row.
pub struct Predicate<T: Entity> {
    clauses: Vec<T::Filter>,
}

impl<T: Entity> Predicate<T> {
    pub fn new() -> Self {
        Self {
            clauses: Vec::new(),
        }
    }

    pub fn and(mut self, filter: T::Filter) -> Self {
        self.clauses.push(filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub(crate) fn conditions(&self) -> Vec<(&'static str, Value)> {
        self.clauses
            .iter()
            .map(|clause| (clause.field(), clause.value()))
            .collect()
    }
}

impl<T: Entity> Default for Predicate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (field, value) in self.conditions() {
            list.entry(&format_args!("{field} = {value}"));
        }
        list.finish()
    }
}

/// Test helper: every filter field must name a key of the serialized entity,
/// otherwise a typo would silently match nothing.
#[cfg(test)]
pub(crate) fn assert_filter_fields_exist<T: Entity>(sample: &T, filters: &[T::Filter]) {
    let body = serde_json::to_value(sample).expect("entity serializes");
    for filter in filters {
        assert!(
            body.get(filter.field()).is_some(),
            "{} has no field '{}'",
            T::KIND,
            filter.field()
        );
    }
}
