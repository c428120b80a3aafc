//! Subscription aggregation.
//!
//! Panels subscribe independently; the player only needs one request per
//! `(topic, preload type)`. [`merge_subscriptions`] collapses the panel
//! requests into that minimal set, and [`SubscriptionMemo`] interns the
//! result so unchanged payloads keep the same `Arc` across merges.
//!
//! Merge rules:
//! - a `Full` subscription also counts as a `Partial` one for the same fields
//! - `fields: None` (all fields) wins over any explicit list
//! - explicit lists are unioned after trimming, dropping blanks and duplicates
//! - a topic whose only requests are empty lists is dropped
//!
//! Output is canonical: all `Full` entries, then all `Partial`, each sorted
//! by topic, with sorted field lists. Equal subscription sets therefore merge
//! to equal output whatever order the panels registered in.

use log::trace;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::entities::{PreloadType, SubscribePayload};

/// Merged field request for one topic.
#[derive(Debug)]
enum FieldSet {
    All,
    Some(BTreeSet<String>),
}

impl FieldSet {
    fn absorb(&mut self, fields: Option<&[String]>) {
        let FieldSet::Some(set) = self else {
            return;
        };
        match fields {
            None => *self = FieldSet::All,
            Some(fields) => {
                for field in fields {
                    let field = field.trim();
                    if !field.is_empty() {
                        set.insert(field.to_string());
                    }
                }
            }
        }
    }

    fn into_fields(self) -> Option<Option<Vec<String>>> {
        match self {
            FieldSet::All => Some(None),
            FieldSet::Some(set) if set.is_empty() => None,
            FieldSet::Some(set) => Some(Some(set.into_iter().collect())),
        }
    }
}

fn bucket<'a>(buckets: &mut BTreeMap<&'a str, FieldSet>, sub: &'a SubscribePayload) {
    buckets
        .entry(sub.topic.as_str())
        .or_insert_with(|| FieldSet::Some(BTreeSet::new()))
        .absorb(sub.fields.as_deref());
}

fn emit(buckets: BTreeMap<&str, FieldSet>, preload_type: PreloadType, out: &mut Vec<SubscribePayload>) {
    for (topic, fields) in buckets {
        match fields.into_fields() {
            Some(fields) => out.push(SubscribePayload {
                topic: topic.to_string(),
                fields,
                preload_type,
            }),
            None => trace!("Dropping {:?} subscription to {} (no fields requested)", preload_type, topic),
        }
    }
}

/// Merge panel subscriptions into the minimal set to send to the player.
///
/// Pure, deterministic and independent of input order.
pub fn merge_subscriptions(subscriptions: &[SubscribePayload]) -> Vec<SubscribePayload> {
    let mut full: BTreeMap<&str, FieldSet> = BTreeMap::new();
    let mut partial: BTreeMap<&str, FieldSet> = BTreeMap::new();

    for sub in subscriptions {
        if sub.preload_type == PreloadType::Full {
            bucket(&mut full, sub);
        }
        // Full preload implies partial.
        bucket(&mut partial, sub);
    }

    let mut merged = Vec::with_capacity(full.len() + partial.len());
    emit(full, PreloadType::Full, &mut merged);
    emit(partial, PreloadType::Partial, &mut merged);
    merged
}

/// Per-pipeline interning cache for merged payloads.
///
/// Equal payloads returned by different merges share one `Arc`, so
/// [`same_subscriptions`] can detect "nothing changed" by identity.
/// Entries are never evicted; the cache lives as long as its pipeline.
#[derive(Debug, Default)]
pub struct SubscriptionMemo {
    interned: HashSet<Arc<SubscribePayload>>,
}

impl SubscriptionMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared instance equal to `payload`, inserting it if new.
    pub fn intern(&mut self, payload: SubscribePayload) -> Arc<SubscribePayload> {
        if let Some(existing) = self.interned.get(&payload) {
            return Arc::clone(existing);
        }
        let payload = Arc::new(payload);
        self.interned.insert(Arc::clone(&payload));
        payload
    }

    /// [`merge_subscriptions`] followed by interning of every output entry.
    pub fn merge(&mut self, subscriptions: &[SubscribePayload]) -> Vec<Arc<SubscribePayload>> {
        merge_subscriptions(subscriptions)
            .into_iter()
            .map(|payload| self.intern(payload))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }
}

/// True when both lists hold the same interned payloads in the same order.
pub fn same_subscriptions(a: &[Arc<SubscribePayload>], b: &[Arc<SubscribePayload>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
}
