//! Diff engine: pure comparison of desired and observed state.
//!
//! Comparison is a normalized subset check. Only fields the declaration
//! mentions are compared, plus the paths listed as managed. Server-managed
//! fields are ignored, mappings compare order-independently, lists compare in
//! order unless their path is listed as unordered, and numbers compare by
//! value.

use std::collections::BTreeSet;

use keel_core::{fields, values_equal, DesiredObject, DesiredSet, DiffOptions, ObservedObject};
use serde_json::{Map, Value};

use crate::types::{Delta, DeltaSet, Observation, ObservedState};

/// Computes deltas under a fixed set of options.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    options: DiffOptions,
    prune: bool,
}

impl DiffEngine {
    /// Create an engine; with `prune`, undeclared live objects become deletes.
    pub const fn new(options: DiffOptions, prune: bool) -> Self {
        Self { options, prune }
    }

    /// Whether undeclared objects are deleted.
    pub const fn prunes(&self) -> bool {
        self.prune
    }

    /// Delta for every key in either set.
    pub fn diff(&self, desired: &DesiredSet, observed: &ObservedState) -> DeltaSet {
        let mut deltas = DeltaSet::new();

        for (key, object) in &desired.objects {
            let delta = match observed.get(key) {
                None | Some(Observation::Absent) => Delta::Create(object.clone()),
                Some(Observation::Failed(reason)) => Delta::Unknown {
                    key: key.clone(),
                    reason: reason.clone(),
                },
                Some(Observation::Present(live)) => {
                    let changed_fields = self.changed_fields(object, live);
                    if changed_fields.is_empty() {
                        Delta::Unchanged(key.clone())
                    } else {
                        Delta::Update {
                            desired: object.clone(),
                            observed: live.clone(),
                            changed_fields,
                        }
                    }
                }
            };
            deltas.insert(delta);
        }

        for (key, observation) in &observed.entries {
            if desired.objects.contains_key(key) {
                continue;
            }
            match observation {
                Observation::Present(live) if self.prune => deltas.insert(Delta::Delete(live.clone())),
                Observation::Present(_) => deltas.insert(Delta::Unchanged(key.clone())),
                Observation::Failed(reason) => deltas.insert(Delta::Unknown {
                    key: key.clone(),
                    reason: reason.clone(),
                }),
                Observation::Absent => {}
            }
        }

        deltas
    }

    /// Dotted paths whose observed value differs from the declared one.
    pub fn changed_fields(&self, desired: &DesiredObject, observed: &ObservedObject) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        self.compare_maps("", &desired.attributes, Some(&observed.attributes), &mut changed);

        for path in &self.options.managed_fields {
            if self.options.is_ignored(path) || desired.field(path).is_some() {
                continue;
            }
            if observed.field(path).is_some_and(|v| !v.is_null()) {
                changed.insert(path.clone());
            }
        }
        changed
    }

    fn compare_maps(
        &self,
        path: &str,
        desired: &Map<String, Value>,
        observed: Option<&Map<String, Value>>,
        changed: &mut BTreeSet<String>,
    ) {
        for (field, want) in desired {
            let child = fields::join(path, field);
            if self.options.is_ignored(&child) {
                continue;
            }
            let have = observed.and_then(|map| map.get(field));
            self.compare_values(&child, want, have, changed);
        }
    }

    fn compare_values(&self, path: &str, want: &Value, have: Option<&Value>, changed: &mut BTreeSet<String>) {
        match (want, have) {
            (Value::Object(want), Some(Value::Object(have))) => {
                self.compare_maps(path, want, Some(have), changed);
            }
            (Value::Object(want), None) if want.is_empty() => {}
            (Value::Object(want), None) => self.compare_maps(path, want, None, changed),
            (Value::Array(want), Some(Value::Array(have))) => {
                if !self.lists_match(path, want, have) {
                    changed.insert(path.to_string());
                }
            }
            (Value::Null, None) => {}
            (want, Some(have)) if values_equal(want, have) => {}
            _ => {
                changed.insert(path.to_string());
            }
        }
    }

    fn lists_match(&self, path: &str, want: &[Value], have: &[Value]) -> bool {
        if want.len() != have.len() {
            return false;
        }
        if !self.options.is_unordered(path) {
            return want
                .iter()
                .zip(have)
                .all(|(w, h)| self.element_matches(path, w, h));
        }

        // Bipartite matching: every wanted element needs its own observed one.
        let candidates: Vec<Vec<usize>> = want
            .iter()
            .map(|w| {
                have.iter()
                    .enumerate()
                    .filter(|(_, h)| self.element_matches(path, w, h))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();
        let mut owner: Vec<Option<usize>> = vec![None; have.len()];
        (0..want.len()).all(|w| {
            let mut visited = vec![false; have.len()];
            assign(w, &candidates, &mut owner, &mut visited)
        })
    }

    fn element_matches(&self, path: &str, want: &Value, have: &Value) -> bool {
        let mut changed = BTreeSet::new();
        self.compare_values(path, want, Some(have), &mut changed);
        changed.is_empty()
    }
}

/// Find an observed element for wanted element `w`, moving earlier
/// assignments along when that frees one up.
fn assign(w: usize, candidates: &[Vec<usize>], owner: &mut [Option<usize>], visited: &mut [bool]) -> bool {
    for &h in &candidates[w] {
        if visited[h] {
            continue;
        }
        visited[h] = true;
        let free = match owner[h] {
            None => true,
            Some(other) => assign(other, candidates, owner, visited),
        };
        if free {
            owner[h] = Some(w);
            return true;
        }
    }
    false
}
