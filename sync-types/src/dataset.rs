//! The classroom dataset exchanged between devices.
//!
//! The engine does not interpret record contents. It only needs each field's
//! value, its last-modified timestamp, and the [`Dot`] of the write that
//! produced it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Dot, SyncError};

/// Logical collection a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Classes (courses).
    Classes,
    /// Students enrolled in classes.
    Students,
    /// Participation ratings.
    Participations,
    /// Homework marks.
    Homework,
}

impl Collection {
    /// All collections, in display order.
    pub const ALL: [Collection; 4] = [
        Collection::Classes,
        Collection::Students,
        Collection::Participations,
        Collection::Homework,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Classes => "classes",
            Collection::Students => "students",
            Collection::Participations => "participations",
            Collection::Homework => "homework",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a record: collection plus record id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Collection the record lives in.
    pub collection: Collection,
    /// Record id, unique within the collection.
    pub id: String,
}

impl RecordKey {
    /// Create a new record key.
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Current value of one field plus its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    /// The value, opaque to the engine.
    pub value: serde_json::Value,
    /// Unix millis of the write.
    pub modified_at: u64,
    /// Clock event of the write.
    pub dot: Dot,
}

impl FieldValue {
    /// Create a new field value.
    pub fn new(value: serde_json::Value, modified_at: u64, dot: Dot) -> Self {
        Self {
            value,
            modified_at,
            dot,
        }
    }
}

/// One logical record (a class, a student, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Collection the record lives in.
    pub collection: Collection,
    /// Record id, unique within the collection.
    pub id: String,
    /// Field name to value.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create an empty record.
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// The record's key.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.collection, self.id.clone())
    }

    /// Most recent `modified_at` across fields.
    pub fn latest_modification(&self) -> Option<u64> {
        self.fields.values().map(|f| f.modified_at).max()
    }
}

/// Summary of a dataset shown to the user before a first sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStats {
    /// Number of records per collection.
    pub record_counts: BTreeMap<Collection, u64>,
    /// Total number of records.
    pub total_records: u64,
    /// Most recent modification across all records.
    pub latest_modification: Option<u64>,
}

impl DataStats {
    /// True when there are no records.
    pub fn is_empty(&self) -> bool {
        self.total_records == 0
    }

    /// Count for one collection.
    pub fn count(&self, collection: Collection) -> u64 {
        self.record_counts.get(&collection).copied().unwrap_or(0)
    }
}

/// A set of records, either a full snapshot or a delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset {
    records: Vec<Record>,
}

impl Dataset {
    /// Create an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dataset from records. Records with the same key are merged
    /// field-by-field, later entries winning.
    pub fn from_records<I: IntoIterator<Item = Record>>(records: I) -> Self {
        let mut dataset = Self::new();
        for record in records {
            dataset.upsert_record(record);
        }
        dataset
    }

    /// All records.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consume into records.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record.
    pub fn get(&self, key: &RecordKey) -> Option<&Record> {
        self.records
            .iter()
            .find(|r| r.collection == key.collection && r.id == key.id)
    }

    /// Look up a single field.
    pub fn get_field(&self, key: &RecordKey, field: &str) -> Option<&FieldValue> {
        self.get(key).and_then(|r| r.fields.get(field))
    }

    /// Insert or overwrite one field, creating the record if needed.
    pub fn upsert_field(&mut self, key: &RecordKey, field: &str, value: FieldValue) {
        match self
            .records
            .iter_mut()
            .find(|r| r.collection == key.collection && r.id == key.id)
        {
            Some(record) => {
                record.fields.insert(field.to_string(), value);
            }
            None => {
                let record =
                    Record::new(key.collection, key.id.clone()).with_field(field, value);
                self.records.push(record);
            }
        }
    }

    /// Insert a record, merging its fields into an existing one.
    pub fn upsert_record(&mut self, record: Record) {
        let key = record.key();
        for (name, value) in record.fields {
            self.upsert_field(&key, &name, value);
        }
        if self.get(&key).is_none() {
            self.records.push(Record::new(key.collection, key.id));
        }
    }

    /// Number of records in one collection.
    pub fn count_in(&self, collection: Collection) -> usize {
        self.records
            .iter()
            .filter(|r| r.collection == collection)
            .count()
    }

    /// Compute [`DataStats`] for this dataset.
    pub fn stats(&self) -> DataStats {
        let mut record_counts = BTreeMap::new();
        for record in &self.records {
            *record_counts.entry(record.collection).or_insert(0u64) += 1;
        }
        DataStats {
            record_counts,
            total_records: self.records.len() as u64,
            latest_modification: self
                .records
                .iter()
                .filter_map(Record::latest_modification)
                .max(),
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

/// BLAKE3 digest (hex) of serialized dataset bytes.
///
/// Used as `SyncPacket::data_hash` to detect corruption and no-op syncs.
pub(crate) fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
