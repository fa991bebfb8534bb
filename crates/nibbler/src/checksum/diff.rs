//! Row-level comparison results and running totals.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connector::{IndividualChecksum, Key, SampledRecord};

/// Three-way difference between the individual checksums of one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "K: Key")]
pub struct DiffResult<K> {
    /// Rows the master holds in the window.
    pub qty: u64,
    /// Ids present on the master only.
    pub missing: Vec<K>,
    /// Ids present on both sides with different hashes.
    pub incorrect: Vec<K>,
    /// Ids present on the remote only.
    pub extra: Vec<K>,
    /// Alternate ids reported by the remote for differing records.
    pub map: BTreeMap<K, String>,
}

impl<K: Key> DiffResult<K> {
    /// Compare master and remote checksums of the same window.
    ///
    /// Neither side needs to be sorted; result vectors are in key order.
    pub fn compare(master: &[IndividualChecksum<K>], remote: &[IndividualChecksum<K>]) -> Self {
        let remote_by_id: BTreeMap<&K, &IndividualChecksum<K>> =
            remote.iter().map(|c| (&c.id, c)).collect();
        let master_by_id: BTreeMap<&K, &IndividualChecksum<K>> =
            master.iter().map(|c| (&c.id, c)).collect();

        let mut diff = DiffResult::empty();
        diff.qty = master_by_id.len() as u64;

        for (id, ours) in &master_by_id {
            match remote_by_id.get(id) {
                None => diff.missing.push((*id).clone()),
                Some(theirs) if theirs.hash != ours.hash => {
                    diff.incorrect.push((*id).clone());
                    if let Some(alt) = &theirs.alt_id {
                        diff.map.insert((*id).clone(), alt.clone());
                    }
                }
                Some(_) => {}
            }
        }

        for (id, theirs) in &remote_by_id {
            if !master_by_id.contains_key(id) {
                diff.extra.push((*id).clone());
                if let Some(alt) = &theirs.alt_id {
                    diff.map.insert((*id).clone(), alt.clone());
                }
            }
        }

        diff
    }

    /// Result of comparing two empty windows.
    pub fn empty() -> Self {
        DiffResult {
            qty: 0,
            missing: Vec::new(),
            incorrect: Vec::new(),
            extra: Vec::new(),
            map: BTreeMap::new(),
        }
    }

    /// Fold in the result of a disjoint part of the same window.
    pub fn absorb(&mut self, part: DiffResult<K>) {
        self.qty += part.qty;
        for (ours, theirs) in [
            (&mut self.missing, part.missing),
            (&mut self.incorrect, part.incorrect),
            (&mut self.extra, part.extra),
        ] {
            ours.extend(theirs);
            ours.sort();
        }
        self.map.extend(part.map);
    }

    /// Total number of differences.
    pub fn total_differences(&self) -> usize {
        self.missing.len() + self.incorrect.len() + self.extra.len()
    }

    /// Check if there are any differences.
    pub fn has_differences(&self) -> bool {
        self.total_differences() > 0
    }

    /// Per-window counts for [`ComparisonTotals::update`].
    pub fn counts(&self) -> WindowCounts {
        let incorrect = self.incorrect.len() as u64;
        let missing = self.missing.len() as u64;
        WindowCounts {
            qty: self.qty,
            correct: self.qty.saturating_sub(incorrect + missing),
            incorrect,
            missing,
            extra: self.extra.len() as u64,
        }
    }
}

/// Outcome of one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounts {
    pub qty: u64,
    pub correct: u64,
    pub incorrect: u64,
    pub missing: u64,
    pub extra: u64,
}

impl WindowCounts {
    /// Window that matched as a whole.
    pub fn matched(qty: u64) -> Self {
        Self {
            qty,
            correct: qty,
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.incorrect == 0 && self.missing == 0 && self.extra == 0
    }
}

/// Running totals over all windows of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonTotals {
    pub progress: u64,
    pub total_correct: u64,
    pub total_incorrect: u64,
    pub total_missing: u64,
    pub total_extra: u64,
    /// Consecutive windows without a difference.
    pub streak: u64,
}

impl ComparisonTotals {
    /// Fold one window into the totals.
    pub fn update(&mut self, window: &WindowCounts) {
        self.progress += window.qty;
        self.total_correct += window.correct;
        self.total_incorrect += window.incorrect;
        self.total_missing += window.missing;
        self.total_extra += window.extra;
        if window.is_clean() {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
    }

    pub fn total_differences(&self) -> u64 {
        self.total_incorrect + self.total_missing + self.total_extra
    }
}

/// Field-level difference of one sampled record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff<K> {
    pub id: K,
    pub fields: Vec<FieldChange>,
}

/// One field whose value differs between master and remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub master: Option<Value>,
    pub remote: Option<Value>,
}

impl<K: Key> FieldDiff<K> {
    /// Fields that differ between the two sampled versions of `id`.
    ///
    /// Master field order is kept; fields only the remote has follow.
    pub fn between(
        id: K,
        master: Option<&SampledRecord<K>>,
        remote: Option<&SampledRecord<K>>,
    ) -> Self {
        let ours: &[(String, Value)] = master.map(|r| r.fields.as_slice()).unwrap_or(&[]);
        let theirs: &[(String, Value)] = remote.map(|r| r.fields.as_slice()).unwrap_or(&[]);

        let lookup = |fields: &[(String, Value)], name: &str| {
            fields.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone())
        };

        let mut seen = BTreeSet::new();
        let mut fields = Vec::new();
        for (name, _) in ours.iter().chain(theirs.iter()) {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let m = lookup(ours, name.as_str());
            let r = lookup(theirs, name.as_str());
            if m != r {
                fields.push(FieldChange {
                    field: name.clone(),
                    master: m,
                    remote: r,
                });
            }
        }

        Self { id, fields }
    }

    /// Aligned table of the differing fields, one per line.
    pub fn render(&self) -> String {
        let show = |v: &Option<Value>| match v {
            Some(v) => v.to_string(),
            None => "<absent>".to_string(),
        };
        let rows: Vec<(String, String, String)> = self
            .fields
            .iter()
            .map(|c| (c.field.clone(), show(&c.master), show(&c.remote)))
            .collect();

        let field_w = rows.iter().map(|r| r.0.len()).max().unwrap_or(0).max(5);
        let master_w = rows.iter().map(|r| r.1.len()).max().unwrap_or(0).max(6);

        let mut out = format!("id {:?}\n", self.id);
        out.push_str(&format!(
            "  {:<fw$}  {:<mw$}  remote\n",
            "field",
            "master",
            fw = field_w,
            mw = master_w
        ));
        for (field, master, remote) in rows {
            out.push_str(&format!(
                "  {:<fw$}  {:<mw$}  {}\n",
                field,
                master,
                remote,
                fw = field_w,
                mw = master_w
            ));
        }
        out
    }
}
