// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The object database.
//!
//! The core treats objects as opaque `ObjectId → property map` entries with
//! typed values; per-type semantics live in a small behavior table the
//! service handlers consult. Property writes report a [`Change`] that the
//! application routes through the COV engine first and the event engine
//! second, synchronously, on the write path.

use std::collections::{HashMap, HashSet};

use crate::error::{error_class, error_code, ServiceError};
use crate::types::{property, ObjectId, ObjectType, PropertyId};
use crate::wire::value::Value;

/// Per-object-type capabilities consulted by the service handlers.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub writable: HashSet<PropertyId>,
    pub commandable: bool,
    pub event_capable: bool,
    /// Whether CreateObject/DeleteObject may touch instances of this type.
    pub dynamically_creatable: bool,
}

impl Behavior {
    /// The permissive behavior used when no table entry exists: only
    /// present-value is writable.
    fn fallback() -> Behavior {
        Behavior {
            writable: [property::PRESENT_VALUE].into_iter().collect(),
            commandable: false,
            event_capable: false,
            dynamically_creatable: false,
        }
    }
}

/// One observed property mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub object: ObjectId,
    pub property: PropertyId,
    pub values: Vec<Value>,
}

/// The opaque object database.
#[derive(Default)]
pub struct ObjectStore {
    objects: HashMap<ObjectId, HashMap<PropertyId, Vec<Value>>>,
    behaviors: HashMap<ObjectType, Behavior>,
}

impl ObjectStore {
    pub fn new() -> ObjectStore {
        ObjectStore::default()
    }

    pub fn set_behavior(&mut self, object_type: ObjectType, behavior: Behavior) {
        self.behaviors.insert(object_type, behavior);
    }

    pub fn behavior(&self, object_type: ObjectType) -> Behavior {
        self.behaviors.get(&object_type).cloned().unwrap_or_else(Behavior::fallback)
    }

    pub fn contains(&self, object: &ObjectId) -> bool {
        self.objects.contains_key(object)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Creates (or replaces) an object outright; used by startup code and
    /// by CreateObject after its behavior check.
    pub fn insert(&mut self, object: ObjectId, properties: HashMap<PropertyId, Vec<Value>>) {
        self.objects.insert(object, properties);
    }

    pub fn remove(&mut self, object: &ObjectId) -> bool {
        self.objects.remove(object).is_some()
    }

    pub fn read(&self, object: &ObjectId, prop: PropertyId) -> Result<&Vec<Value>, ServiceError> {
        let properties = self
            .objects
            .get(object)
            .ok_or(ServiceError::new(error_class::OBJECT, error_code::UNKNOWN_OBJECT))?;
        properties
            .get(&prop)
            .ok_or(ServiceError::new(error_class::PROPERTY, error_code::UNKNOWN_PROPERTY))
    }

    /// Read with array-index handling: index 0 is the element count, N the
    /// Nth element.
    pub fn read_indexed(
        &self,
        object: &ObjectId,
        prop: PropertyId,
        index: Option<u32>,
    ) -> Result<Vec<Value>, ServiceError> {
        let values = self.read(object, prop)?;
        match index {
            None => Ok(values.clone()),
            Some(0) => Ok(vec![Value::Unsigned(values.len() as u64)]),
            Some(n) => values
                .get(n as usize - 1)
                .map(|v| vec![v.clone()])
                .ok_or(ServiceError::new(error_class::PROPERTY, error_code::VALUE_OUT_OF_RANGE)),
        }
    }

    /// A peer-initiated write: behavior-checked, then applied. The returned
    /// change drives the COV and event pipelines.
    pub fn write(
        &mut self,
        object: ObjectId,
        prop: PropertyId,
        values: Vec<Value>,
    ) -> Result<Change, ServiceError> {
        let behavior = self.behavior(object.object_type());
        if !behavior.writable.contains(&prop) {
            return Err(ServiceError::new(
                error_class::PROPERTY,
                error_code::WRITE_ACCESS_DENIED,
            ));
        }
        self.write_unchecked(object, prop, values)
    }

    /// A local (application-initiated) write: no access check, same change
    /// reporting.
    pub fn write_unchecked(
        &mut self,
        object: ObjectId,
        prop: PropertyId,
        values: Vec<Value>,
    ) -> Result<Change, ServiceError> {
        let properties = self
            .objects
            .get_mut(&object)
            .ok_or(ServiceError::new(error_class::OBJECT, error_code::UNKNOWN_OBJECT))?;
        properties.insert(prop, values.clone());
        Ok(Change { object, property: prop, values })
    }

    /// Appends to a list property, for AddListElement.
    pub fn add_list_elements(
        &mut self,
        object: ObjectId,
        prop: PropertyId,
        elements: Vec<Value>,
    ) -> Result<Change, ServiceError> {
        let properties = self
            .objects
            .get_mut(&object)
            .ok_or(ServiceError::new(error_class::OBJECT, error_code::UNKNOWN_OBJECT))?;
        let list = properties.entry(prop).or_default();
        for element in elements {
            if !list.contains(&element) {
                list.push(element);
            }
        }
        let values = list.clone();
        Ok(Change { object, property: prop, values })
    }

    /// Removes from a list property, for RemoveListElement.
    pub fn remove_list_elements(
        &mut self,
        object: ObjectId,
        prop: PropertyId,
        elements: &[Value],
    ) -> Result<Change, ServiceError> {
        let properties = self
            .objects
            .get_mut(&object)
            .ok_or(ServiceError::new(error_class::OBJECT, error_code::UNKNOWN_OBJECT))?;
        let list = properties
            .get_mut(&prop)
            .ok_or(ServiceError::new(error_class::PROPERTY, error_code::UNKNOWN_PROPERTY))?;
        let before = list.len();
        list.retain(|v| !elements.contains(v));
        if list.len() == before {
            return Err(ServiceError::new(
                error_class::SERVICES,
                error_code::OTHER,
            ));
        }
        let values = list.clone();
        Ok(Change { object, property: prop, values })
    }

    /// All property ids an object carries, for ReadPropertyMultiple `ALL`.
    pub fn property_ids(&self, object: &ObjectId) -> Result<Vec<PropertyId>, ServiceError> {
        let properties = self
            .objects
            .get(object)
            .ok_or(ServiceError::new(error_class::OBJECT, error_code::UNKNOWN_OBJECT))?;
        let mut ids: Vec<PropertyId> = properties.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Convenience constructor for a typical analog point.
pub fn analog_object(object: ObjectId, name: &str, present_value: f32) -> HashMap<PropertyId, Vec<Value>> {
    let mut properties = HashMap::new();
    properties.insert(property::OBJECT_IDENTIFIER, vec![Value::ObjectId(object)]);
    properties.insert(property::OBJECT_NAME, vec![Value::string(name)]);
    properties.insert(
        property::OBJECT_TYPE,
        vec![Value::Enumerated(object.object_type() as u32)],
    );
    properties.insert(property::PRESENT_VALUE, vec![Value::Real(present_value)]);
    properties.insert(
        property::STATUS_FLAGS,
        vec![Value::BitString(crate::wire::primitives::BitString::from_bits(&[
            false, false, false, false,
        ]))],
    );
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::object_type;
    use assert_matches::assert_matches;

    fn ai(instance: u32) -> ObjectId {
        ObjectId::new(object_type::ANALOG_INPUT, instance).unwrap()
    }

    fn store_with_object() -> ObjectStore {
        let mut store = ObjectStore::new();
        store.insert(ai(1), analog_object(ai(1), "oat", 22.5));
        store
    }

    #[test]
    fn read_and_unknown_errors() {
        let store = store_with_object();
        assert_eq!(
            store.read(&ai(1), property::PRESENT_VALUE).unwrap(),
            &vec![Value::Real(22.5)]
        );
        assert_matches!(
            store.read(&ai(2), property::PRESENT_VALUE),
            Err(ServiceError { class: 1, .. })
        );
        assert_matches!(
            store.read(&ai(1), property::HIGH_LIMIT),
            Err(ServiceError { class: 2, .. })
        );
    }

    #[test]
    fn indexed_reads() {
        let mut store = ObjectStore::new();
        store.insert(ai(1), {
            let mut p = HashMap::new();
            p.insert(property::PRIORITY, vec![Value::Unsigned(1), Value::Unsigned(2)]);
            p
        });
        assert_eq!(
            store.read_indexed(&ai(1), property::PRIORITY, Some(0)).unwrap(),
            vec![Value::Unsigned(2)]
        );
        assert_eq!(
            store.read_indexed(&ai(1), property::PRIORITY, Some(2)).unwrap(),
            vec![Value::Unsigned(2)]
        );
        assert_matches!(
            store.read_indexed(&ai(1), property::PRIORITY, Some(3)),
            Err(ServiceError { code: 37, .. })
        );
    }

    #[test]
    fn write_respects_behavior_table() {
        let mut store = store_with_object();
        // Fallback behavior: only present-value writable.
        let change = store
            .write(ai(1), property::PRESENT_VALUE, vec![Value::Real(23.0)])
            .unwrap();
        assert_eq!(change.values, vec![Value::Real(23.0)]);
        assert_matches!(
            store.write(ai(1), property::OBJECT_NAME, vec![Value::string("x")]),
            Err(ServiceError { code: 40, .. })
        );

        // Widen the table and the same write goes through.
        store.set_behavior(object_type::ANALOG_INPUT, Behavior {
            writable: [property::PRESENT_VALUE, property::OBJECT_NAME].into_iter().collect(),
            ..Behavior::default()
        });
        assert!(store.write(ai(1), property::OBJECT_NAME, vec![Value::string("x")]).is_ok());
    }

    #[test]
    fn unchecked_write_skips_access_control() {
        let mut store = store_with_object();
        assert!(store
            .write_unchecked(ai(1), property::OBJECT_NAME, vec![Value::string("renamed")])
            .is_ok());
    }

    #[test]
    fn list_element_services() {
        let mut store = store_with_object();
        let change = store
            .add_list_elements(ai(1), property::RECIPIENT_LIST, vec![Value::Unsigned(7)])
            .unwrap();
        assert_eq!(change.values, vec![Value::Unsigned(7)]);
        // Duplicates are not appended twice.
        store
            .add_list_elements(ai(1), property::RECIPIENT_LIST, vec![Value::Unsigned(7)])
            .unwrap();
        assert_eq!(store.read(&ai(1), property::RECIPIENT_LIST).unwrap().len(), 1);

        store
            .remove_list_elements(ai(1), property::RECIPIENT_LIST, &[Value::Unsigned(7)])
            .unwrap();
        assert!(store.read(&ai(1), property::RECIPIENT_LIST).unwrap().is_empty());
        assert_matches!(
            store.remove_list_elements(ai(1), property::RECIPIENT_LIST, &[Value::Unsigned(7)]),
            Err(_)
        );
    }

    #[test]
    fn property_listing_is_sorted() {
        let store = store_with_object();
        let ids = store.property_ids(&ai(1)).unwrap();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert!(ids.contains(&property::PRESENT_VALUE));
    }

    #[test]
    fn remove_objects() {
        let mut store = store_with_object();
        assert!(store.remove(&ai(1)));
        assert!(!store.remove(&ai(1)));
        assert!(store.is_empty());
    }
}
