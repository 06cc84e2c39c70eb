//! Field-level reconciliation of two datasets.
//!
//! Every field carries the [`Dot`] of the write that produced it. Comparing
//! a field's dot against the other side's vector clock tells whether that
//! side has already seen the write:
//!
//! | local dot seen by remote | remote dot seen by local | outcome        |
//! |--------------------------|--------------------------|----------------|
//! | yes                      | no                       | apply remote   |
//! | no                       | yes                      | keep local     |
//! | no                       | no                       | conflict       |
//! | yes                      | yes (dots differ)        | conflict       |
//!
//! The last row only happens when an earlier manual conflict was left
//! unresolved on both sides.
//!
//! Nothing here mutates a store: [`reconcile`] returns a [`MergePlan`] that
//! the engine commits atomically once the whole round succeeded.

use classsync_types::{
    ConflictId, Dataset, DeviceId, Dot, FieldValue, Record, RecordKey, VectorClock,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// How concurrent writes to the same field are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Later `modified_at` wins; ties go to the greater device id.
    #[default]
    Newest,
    /// Keep local and surface the conflict until a choice is recorded.
    Manual,
    /// Combine both values with the injected [`MergePolicy`].
    Merge,
}

/// One field of one record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    /// Record address.
    pub key: RecordKey,
    /// Field name.
    pub field: String,
}

impl FieldRef {
    /// Create a field reference.
    pub fn new(key: RecordKey, field: impl Into<String>) -> Self {
        Self {
            key,
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.field)
    }
}

/// How a conflict was (or should be) settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Local value kept.
    KeepLocal,
    /// Remote value adopted.
    TakeRemote,
    /// Values combined by the merge policy.
    Merged,
    /// A value supplied by the user.
    Custom(Value),
}

/// Two concurrent writes to the same field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict id.
    pub id: ConflictId,
    /// Peer the conflicting write came from.
    pub peer: DeviceId,
    /// Conflicting field.
    pub field: FieldRef,
    /// Local value at detection time.
    pub local_value: Value,
    /// Remote value at detection time.
    pub remote_value: Value,
    /// Local `modified_at`.
    pub local_timestamp: u64,
    /// Remote `modified_at`.
    pub remote_timestamp: u64,
    /// Dot of the local write.
    pub local_dot: Dot,
    /// Dot of the remote write.
    pub remote_dot: Dot,
    /// When the conflict was detected (Unix millis).
    pub detected_at: u64,
    /// Whether a winner has been picked.
    pub resolved: bool,
    /// The pick, once resolved.
    pub resolution: Option<Resolution>,
}

impl Conflict {
    /// Value the field takes under `resolution`.
    pub fn value_for(&self, resolution: &Resolution) -> Option<Value> {
        match resolution {
            Resolution::KeepLocal => Some(self.local_value.clone()),
            Resolution::TakeRemote => Some(self.remote_value.clone()),
            Resolution::Custom(value) => Some(value.clone()),
            Resolution::Merged => None,
        }
    }
}

/// Classification of one remote field against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOutcome {
    /// Same write on both sides.
    NoOp,
    /// Remote is causally newer (or local has no value).
    ApplyRemote,
    /// Local is causally newer.
    KeepLocal,
    /// Both sides wrote independently.
    Conflict,
}

/// Classify a remote field against the local one.
pub fn classify(
    local: Option<&FieldValue>,
    remote: &FieldValue,
    local_clock: &VectorClock,
    remote_clock: &VectorClock,
) -> FieldOutcome {
    let Some(local) = local else {
        return FieldOutcome::ApplyRemote;
    };
    if local.dot == remote.dot {
        return FieldOutcome::NoOp;
    }
    let local_unseen = !remote_clock.covers(&local.dot);
    let remote_unseen = !local_clock.covers(&remote.dot);
    match (local_unseen, remote_unseen) {
        (false, true) => FieldOutcome::ApplyRemote,
        (true, false) => FieldOutcome::KeepLocal,
        (true, true) | (false, false) => FieldOutcome::Conflict,
    }
}

/// Field-level rule for the `merge` strategy.
///
/// Implementations receive both sides ordered by author device id so that
/// both peers compute the same value.
pub trait MergePolicy: Send + Sync {
    /// Combine two concurrent values of `field`.
    fn merge(&self, field: &FieldRef, first: &FieldValue, second: &FieldValue) -> Value;
}

/// Merge by JSON type: arrays are unioned, numbers take the maximum, objects
/// are merged key by key, and anything else falls back to newest-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldTypeMergePolicy;

impl MergePolicy for FieldTypeMergePolicy {
    fn merge(&self, _field: &FieldRef, first: &FieldValue, second: &FieldValue) -> Value {
        let second_newer = newest_order(second, first) == Ordering::Greater;
        merge_json(&first.value, &second.value, second_newer)
    }
}

fn merge_json(first: &Value, second: &Value, second_newer: bool) -> Value {
    match (first, second) {
        (Value::Array(a), Value::Array(b)) => {
            let mut union = a.clone();
            for item in b {
                if !union.contains(item) {
                    union.push(item.clone());
                }
            }
            Value::Array(union)
        }
        (Value::Number(a), Value::Number(b)) => {
            let a_val = a.as_f64().unwrap_or(f64::MIN);
            let b_val = b.as_f64().unwrap_or(f64::MIN);
            if b_val > a_val {
                second.clone()
            } else {
                first.clone()
            }
        }
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = Map::new();
            for (name, a_value) in a {
                let value = match b.get(name) {
                    Some(b_value) => merge_json(a_value, b_value, second_newer),
                    None => a_value.clone(),
                };
                merged.insert(name.clone(), value);
            }
            for (name, b_value) in b {
                if !a.contains_key(name) {
                    merged.insert(name.clone(), b_value.clone());
                }
            }
            Value::Object(merged)
        }
        _ if second_newer => second.clone(),
        _ => first.clone(),
    }
}

/// Newest-wins order: `modified_at`, then author device id, then counter.
fn newest_order(a: &FieldValue, b: &FieldValue) -> Ordering {
    a.modified_at
        .cmp(&b.modified_at)
        .then_with(|| a.dot.device.cmp(&b.dot.device))
        .then_with(|| a.dot.counter.cmp(&b.dot.counter))
}

/// A field write to commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    /// Record address.
    pub key: RecordKey,
    /// Field name.
    pub field: String,
    /// New value with provenance.
    pub value: FieldValue,
}

/// The set of writes a sync round commits to the local store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedDelta {
    /// Field writes, in application order.
    pub updates: Vec<FieldUpdate>,
}

impl MergedDelta {
    /// Number of field writes.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// True when nothing needs to be written.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Apply every write to `dataset`.
    pub fn apply_to(&self, dataset: &mut Dataset) {
        for update in &self.updates {
            dataset.upsert_field(&update.key, &update.field, update.value.clone());
        }
    }
}

/// Result of reconciling a remote delta, not yet committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    /// Writes to commit.
    pub delta: MergedDelta,
    /// Conflicts detected (resolved or not).
    pub conflicts: Vec<Conflict>,
    /// `merge(local_clock, remote_clock)`.
    pub merged_clock: VectorClock,
    /// Remote fields adopted without conflict.
    pub applied: usize,
    /// Remote fields ignored because local was newer.
    pub kept_local: usize,
}

impl MergePlan {
    /// Conflicts still waiting for a manual choice.
    pub fn unresolved(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }
}

/// Inputs to [`reconcile`].
pub struct ReconcileInput<'a> {
    /// Local dataset snapshot.
    pub local: &'a Dataset,
    /// Local clock.
    pub local_clock: &'a VectorClock,
    /// Fields received from the peer.
    pub remote: &'a Dataset,
    /// Peer's clock.
    pub remote_clock: &'a VectorClock,
    /// Peer device id.
    pub peer: DeviceId,
    /// Configured strategy.
    pub strategy: ConflictStrategy,
    /// Policy used by [`ConflictStrategy::Merge`].
    pub policy: &'a dyn MergePolicy,
    /// Current time (Unix millis).
    pub now: u64,
}

/// Reconcile a remote delta against local state.
pub fn reconcile(input: ReconcileInput<'_>) -> MergePlan {
    let mut plan = MergePlan {
        merged_clock: input.local_clock.merge(input.remote_clock),
        ..MergePlan::default()
    };

    for record in input.remote.records() {
        let key = record.key();
        for (name, remote) in &record.fields {
            let local = input.local.get_field(&key, name);
            match classify(local, remote, input.local_clock, input.remote_clock) {
                FieldOutcome::NoOp => {}
                FieldOutcome::KeepLocal => plan.kept_local += 1,
                FieldOutcome::ApplyRemote => {
                    plan.applied += 1;
                    push_update(&mut plan.delta, &key, name, remote.clone());
                }
                FieldOutcome::Conflict => {
                    if let Some(local) = local {
                        settle_conflict(&input, &mut plan, FieldRef::new(key.clone(), name), local, remote);
                    }
                }
            }
        }
    }

    plan
}

fn settle_conflict(
    input: &ReconcileInput<'_>,
    plan: &mut MergePlan,
    field: FieldRef,
    local: &FieldValue,
    remote: &FieldValue,
) {
    // Identical values written twice converge on the larger dot silently.
    if local.value == remote.value {
        if remote.dot.total_cmp(&local.dot) == Ordering::Greater {
            push_update(&mut plan.delta, &field.key, &field.field, remote.clone());
        }
        return;
    }

    let mut conflict = Conflict {
        id: ConflictId::new(),
        peer: input.peer,
        field,
        local_value: local.value.clone(),
        remote_value: remote.value.clone(),
        local_timestamp: local.modified_at,
        remote_timestamp: remote.modified_at,
        local_dot: local.dot,
        remote_dot: remote.dot,
        detected_at: input.now,
        resolved: true,
        resolution: None,
    };

    match input.strategy {
        ConflictStrategy::Newest => {
            if newest_order(remote, local) == Ordering::Greater {
                push_update(&mut plan.delta, &conflict.field.key, &conflict.field.field, remote.clone());
                conflict.resolution = Some(Resolution::TakeRemote);
            } else {
                conflict.resolution = Some(Resolution::KeepLocal);
            }
        }
        ConflictStrategy::Manual => {
            conflict.resolved = false;
        }
        ConflictStrategy::Merge => {
            let (first, second) = if local.dot.device <= remote.dot.device {
                (local, remote)
            } else {
                (remote, local)
            };
            let merged = FieldValue::new(
                input.policy.merge(&conflict.field, first, second),
                local.modified_at.max(remote.modified_at),
                Dot::max_of(local.dot, remote.dot),
            );
            push_update(&mut plan.delta, &conflict.field.key, &conflict.field.field, merged);
            conflict.resolution = Some(Resolution::Merged);
        }
    }

    plan.conflicts.push(conflict);
}

fn push_update(delta: &mut MergedDelta, key: &RecordKey, field: &str, value: FieldValue) {
    delta.updates.push(FieldUpdate {
        key: key.clone(),
        field: field.to_string(),
        value,
    });
}

/// Fields of `local` whose writes `peer_clock` has not seen.
pub fn delta_for(local: &Dataset, peer_clock: &VectorClock) -> Dataset {
    let records = local.records().iter().filter_map(|record| {
        let fields: Vec<_> = record
            .fields
            .iter()
            .filter(|(_, value)| !peer_clock.covers(&value.dot))
            .collect();
        if fields.is_empty() {
            return None;
        }
        let mut out = Record::new(record.collection, record.id.clone());
        for (name, value) in fields {
            out.fields.insert(name.clone(), value.clone());
        }
        Some(out)
    });
    Dataset::from_records(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use classsync_types::Collection;
    use proptest::prelude::*;
    use serde_json::json;

    const NOW: u64 = 1_700_000_000_000;

    /// Two device ids with `a < b`.
    fn devices() -> (DeviceId, DeviceId) {
        let mut v = [DeviceId::random(), DeviceId::random()];
        v.sort();
        (v[0], v[1])
    }

    fn fv(value: Value, at: u64, device: DeviceId, counter: u64) -> FieldValue {
        FieldValue::new(value, at, Dot::new(device, counter))
    }

    fn student() -> RecordKey {
        RecordKey::new(Collection::Students, "s1")
    }

    fn run(
        local: &Dataset,
        local_clock: &VectorClock,
        remote: &Dataset,
        remote_clock: &VectorClock,
        peer: DeviceId,
        strategy: ConflictStrategy,
    ) -> MergePlan {
        reconcile(ReconcileInput {
            local,
            local_clock,
            remote: &delta_for(remote, local_clock),
            remote_clock,
            peer,
            strategy,
            policy: &FieldTypeMergePolicy,
            now: NOW,
        })
    }

    // ===========================================
    // Classification
    // ===========================================

    #[test]
    fn classify_covers_all_cases() {
        let (a, b) = devices();
        let clock_a = VectorClock::from_entries([(a, 3), (b, 1)]);
        let clock_b = VectorClock::from_entries([(a, 2), (b, 2)]);

        let old_a = fv(json!(1), 1, a, 2);
        let new_a = fv(json!(2), 2, a, 3);
        let new_b = fv(json!(3), 3, b, 2);

        assert_eq!(classify(None, &new_b, &clock_a, &clock_b), FieldOutcome::ApplyRemote);
        assert_eq!(classify(Some(&old_a), &old_a, &clock_a, &clock_b), FieldOutcome::NoOp);
        assert_eq!(classify(Some(&old_a), &new_b, &clock_a, &clock_b), FieldOutcome::ApplyRemote);
        assert_eq!(classify(Some(&new_a), &old_a, &clock_a, &clock_b), FieldOutcome::KeepLocal);
        assert_eq!(classify(Some(&new_a), &new_b, &clock_a, &clock_b), FieldOutcome::Conflict);
    }

    #[test]
    fn divergent_dots_both_seen_are_a_conflict() {
        let (a, b) = devices();
        let clock = VectorClock::from_entries([(a, 5), (b, 5)]);
        let local = fv(json!("x"), 1, a, 4);
        let remote = fv(json!("y"), 2, b, 4);
        assert_eq!(classify(Some(&local), &remote, &clock, &clock), FieldOutcome::Conflict);
    }

    // ===========================================
    // Scenario: {A:3,B:1} meets {A:2,B:2}
    // ===========================================

    #[test]
    fn concurrent_writes_since_common_point_are_flagged() {
        let (a, b) = devices();
        let key = student();

        // Common state at {A:2,B:1}: name by A:1, grade by A:2, note by B:1
        let common = Dataset::from_records([Record::new(Collection::Students, "s1")
            .with_field("name", fv(json!("Ana"), 10, a, 1))
            .with_field("grade", fv(json!(6), 20, a, 2))
            .with_field("note", fv(json!("quiet"), 30, b, 1))]);

        let mut data_a = common.clone();
        data_a.upsert_field(&key, "grade", fv(json!(7), 100, a, 3));
        let clock_a = VectorClock::from_entries([(a, 3), (b, 1)]);

        let mut data_b = common;
        data_b.upsert_field(&key, "grade", fv(json!(8), 90, b, 2));
        let clock_b = VectorClock::from_entries([(a, 2), (b, 2)]);

        let plan = run(&data_a, &clock_a, &data_b, &clock_b, b, ConflictStrategy::Manual);

        assert_eq!(plan.merged_clock, VectorClock::from_entries([(a, 3), (b, 2)]));
        assert_eq!(plan.conflicts.len(), 1);
        let conflict = &plan.conflicts[0];
        assert_eq!(conflict.field, FieldRef::new(key, "grade"));
        assert_eq!(conflict.local_value, json!(7));
        assert_eq!(conflict.remote_value, json!(8));
        assert!(!conflict.resolved);
        assert!(plan.delta.is_empty());
    }

    // ===========================================
    // Strategies
    // ===========================================

    fn concurrent_pair(
        local_at: u64,
        remote_at: u64,
        local_value: Value,
        remote_value: Value,
    ) -> (Dataset, VectorClock, Dataset, VectorClock, DeviceId, DeviceId) {
        let (a, b) = devices();
        let key = student();
        let mut local = Dataset::new();
        local.upsert_field(&key, "tags", fv(local_value, local_at, a, 1));
        let mut remote = Dataset::new();
        remote.upsert_field(&key, "tags", fv(remote_value, remote_at, b, 1));
        (
            local,
            VectorClock::from_entries([(a, 1)]),
            remote,
            VectorClock::from_entries([(b, 1)]),
            a,
            b,
        )
    }

    #[test]
    fn newest_takes_later_timestamp() {
        let (local, lc, remote, rc, _, b) = concurrent_pair(10, 20, json!("old"), json!("new"));
        let plan = run(&local, &lc, &remote, &rc, b, ConflictStrategy::Newest);

        assert_eq!(plan.conflicts.len(), 1);
        assert!(plan.conflicts[0].resolved);
        assert_eq!(plan.conflicts[0].resolution, Some(Resolution::TakeRemote));
        assert_eq!(plan.delta.updates[0].value.value, json!("new"));
    }

    #[test]
    fn newest_keeps_local_when_local_is_later() {
        let (local, lc, remote, rc, _, b) = concurrent_pair(30, 20, json!("mine"), json!("theirs"));
        let plan = run(&local, &lc, &remote, &rc, b, ConflictStrategy::Newest);

        assert_eq!(plan.conflicts[0].resolution, Some(Resolution::KeepLocal));
        assert!(plan.delta.is_empty());
    }

    #[test]
    fn newest_tie_goes_to_greater_device_id() {
        // local authored by a (smaller), remote by b (greater)
        let (local, lc, remote, rc, _, b) = concurrent_pair(50, 50, json!("a"), json!("b"));
        let plan = run(&local, &lc, &remote, &rc, b, ConflictStrategy::Newest);
        assert_eq!(plan.conflicts[0].resolution, Some(Resolution::TakeRemote));

        // and from b's point of view, b keeps its own value
        let plan = run(&remote, &rc, &local, &lc, DeviceId::random(), ConflictStrategy::Newest);
        assert_eq!(plan.conflicts[0].resolution, Some(Resolution::KeepLocal));
    }

    #[test]
    fn merge_unions_arrays_with_larger_dot() {
        let (local, lc, remote, rc, a, b) =
            concurrent_pair(10, 20, json!(["late", "redo"]), json!(["redo", "star"]));
        let plan = run(&local, &lc, &remote, &rc, b, ConflictStrategy::Merge);

        assert_eq!(plan.conflicts[0].resolution, Some(Resolution::Merged));
        let merged = &plan.delta.updates[0].value;
        assert_eq!(merged.value, json!(["late", "redo", "star"]));
        assert_eq!(merged.modified_at, 20);
        assert_eq!(merged.dot, Dot::max_of(Dot::new(a, 1), Dot::new(b, 1)));
    }

    #[test]
    fn identical_concurrent_values_do_not_conflict() {
        let (local, lc, remote, rc, _, b) = concurrent_pair(10, 20, json!("same"), json!("same"));
        let plan = run(&local, &lc, &remote, &rc, b, ConflictStrategy::Manual);
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn field_type_policy_rules() {
        let (a, b) = devices();
        let field = FieldRef::new(student(), "x");
        let policy = FieldTypeMergePolicy;

        let merged = policy.merge(&field, &fv(json!(3), 1, a, 1), &fv(json!(7.5), 1, b, 1));
        assert_eq!(merged, json!(7.5));

        let merged = policy.merge(
            &field,
            &fv(json!({"mark": 2, "tags": ["a"]}), 5, a, 1),
            &fv(json!({"mark": 1, "tags": ["b"], "late": true}), 1, b, 1),
        );
        assert_eq!(merged, json!({"mark": 2, "tags": ["a", "b"], "late": true}));

        // Scalars fall back to newest
        let merged = policy.merge(&field, &fv(json!("x"), 9, a, 1), &fv(json!("y"), 3, b, 1));
        assert_eq!(merged, json!("x"));
    }

    // ===========================================
    // Convergence
    // ===========================================

    /// Run a full symmetric exchange and return both resulting datasets.
    fn exchange(
        data_a: &Dataset,
        clock_a: &VectorClock,
        id_a: DeviceId,
        data_b: &Dataset,
        clock_b: &VectorClock,
        id_b: DeviceId,
        strategy: ConflictStrategy,
    ) -> (Dataset, Dataset) {
        let plan_a = run(data_a, clock_a, data_b, clock_b, id_b, strategy);
        let plan_b = run(data_b, clock_b, data_a, clock_a, id_a, strategy);
        let mut out_a = data_a.clone();
        plan_a.delta.apply_to(&mut out_a);
        let mut out_b = data_b.clone();
        plan_b.delta.apply_to(&mut out_b);
        (out_a, out_b)
    }

    fn field_map(dataset: &Dataset) -> Vec<(String, String, Value, Dot)> {
        let mut out: Vec<_> = dataset
            .records()
            .iter()
            .flat_map(|r| {
                r.fields
                    .iter()
                    .map(move |(n, v)| (r.key().to_string(), n.clone(), v.value.clone(), v.dot))
            })
            .collect();
        out.sort_by(|x, y| (&x.0, &x.1).cmp(&(&y.0, &y.1)));
        out
    }

    #[test]
    fn newest_and_merge_converge_both_sides() {
        for strategy in [ConflictStrategy::Newest, ConflictStrategy::Merge] {
            let (local, lc, remote, rc, a, b) =
                concurrent_pair(10, 10, json!([1, 2]), json!([2, 3]));
            let (out_a, out_b) = exchange(&local, &lc, a, &remote, &rc, b, strategy);
            assert_eq!(field_map(&out_a), field_map(&out_b), "{:?}", strategy);
        }
    }

    #[test]
    fn delta_excludes_fields_peer_has_seen() {
        let (a, b) = devices();
        let dataset = Dataset::from_records([
            Record::new(Collection::Classes, "c1")
                .with_field("name", fv(json!("7a"), 1, a, 1))
                .with_field("room", fv(json!("B2"), 2, a, 2)),
            Record::new(Collection::Classes, "c2").with_field("name", fv(json!("7b"), 3, b, 1)),
        ]);
        let peer_clock = VectorClock::from_entries([(a, 1), (b, 1)]);

        let delta = delta_for(&dataset, &peer_clock);
        assert_eq!(delta.len(), 1);
        let record = &delta.records()[0];
        assert_eq!(record.id, "c1");
        assert_eq!(record.fields.keys().collect::<Vec<_>>(), vec!["room"]);
    }

    proptest! {
        // Disjoint field-level changes on top of a shared base are never lost.
        #[test]
        fn disjoint_changes_are_never_lost(
            local_fields in proptest::collection::btree_set("[a-e]", 0..5),
            remote_fields in proptest::collection::btree_set("[f-j]", 0..5),
        ) {
            let (a, b) = devices();
            let key = student();
            let base = Dataset::from_records([
                Record::new(Collection::Students, "s1").with_field("base", fv(json!(0), 1, a, 1)),
            ]);
            let base_clock = VectorClock::from_entries([(a, 1)]);

            let mut data_a = base.clone();
            let mut clock_a = base_clock.clone();
            for name in &local_fields {
                let dot = clock_a.increment(a);
                data_a.upsert_field(&key, name, FieldValue::new(json!(name), 10, dot));
            }
            let mut data_b = base;
            let mut clock_b = base_clock;
            for name in &remote_fields {
                let dot = clock_b.increment(b);
                data_b.upsert_field(&key, name, FieldValue::new(json!(name), 10, dot));
            }

            let (out_a, out_b) =
                exchange(&data_a, &clock_a, a, &data_b, &clock_b, b, ConflictStrategy::Manual);

            for name in local_fields.iter().chain(remote_fields.iter()) {
                prop_assert_eq!(&out_a.get_field(&key, name).unwrap().value, &json!(name));
                prop_assert_eq!(&out_b.get_field(&key, name).unwrap().value, &json!(name));
            }
            prop_assert_eq!(field_map(&out_a), field_map(&out_b));
        }
    }
}
