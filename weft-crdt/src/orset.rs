//! Observed-Remove Set with durable tombstones.
//!
//! Every add mints a unique tag; a remove tombstones the tags it has
//! observed. An element is present iff it still owns at least one live tag.
//! Two consequences fall out of that bookkeeping:
//!
//! - A remove durably beats the adds it observed: merging a stale replica
//!   that still carries a removed element's old tag cannot resurrect it,
//!   because the tombstone travels with the merge.
//! - A concurrent add the remover never saw survives, since its tag was
//!   never tombstoned. You can only remove what you have observed.
//!
//! Tombstones are kept forever. A long-offline device may reappear months
//! later holding arbitrarily old tags, and dropping a tombstone would let
//! its stale adds come back from the dead.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Unique identifier of one add operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(Uuid);

impl Tag {
    /// Mints a fresh tag.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for Tag {
    fn default() -> Self {
        Self::new()
    }
}

/// An Observed-Remove Set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ORSet<T>
where
    T: Eq + std::hash::Hash + Clone,
{
    /// Live tags per element.
    elements: HashMap<T, HashSet<Tag>>,
    /// Tags removed by some replica; retained indefinitely.
    tombstones: HashSet<Tag>,
}

impl<T> Default for ORSet<T>
where
    T: Eq + std::hash::Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ORSet<T>
where
    T: Eq + std::hash::Hash + Clone,
{
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            elements: HashMap::new(),
            tombstones: HashSet::new(),
        }
    }

    /// True if the element currently owns a live tag.
    #[must_use]
    pub fn contains(&self, element: &T) -> bool {
        self.elements
            .get(element)
            .is_some_and(|tags| !tags.is_empty())
    }

    /// Number of present elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements
            .values()
            .filter(|tags| !tags.is_empty())
            .count()
    }

    /// True when no element is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the present elements.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elements
            .iter()
            .filter(|(_, tags)| !tags.is_empty())
            .map(|(element, _)| element)
    }

    /// Adds an element, minting and returning the tag for this operation.
    ///
    /// Adding the same element again creates an additional tag; the element
    /// stays present until every one of its tags is removed.
    pub fn add(&mut self, element: T) -> Tag {
        let tag = Tag::new();
        self.add_with_tag(element, tag);
        tag
    }

    /// Replays an add with a known tag (replication path).
    ///
    /// A tag that was already tombstoned stays dead.
    pub fn add_with_tag(&mut self, element: T, tag: Tag) {
        if !self.tombstones.contains(&tag) {
            self.elements.entry(element).or_default().insert(tag);
        }
    }

    /// Removes an element by tombstoning every tag observed for it.
    ///
    /// Returns the tombstoned tags so the removal can be replicated.
    pub fn remove(&mut self, element: &T) -> Vec<Tag> {
        let removed: Vec<Tag> = self
            .elements
            .get_mut(element)
            .map(|tags| tags.drain().collect())
            .unwrap_or_default();

        self.tombstones.extend(removed.iter().copied());
        removed
    }

    /// Replays a removal of specific tags (replication path).
    pub fn remove_tags(&mut self, tags: &[Tag]) {
        self.tombstones.extend(tags.iter().copied());
        for live in self.elements.values_mut() {
            for tag in tags {
                live.remove(tag);
            }
        }
    }

    /// Merges another replica's state into this one.
    ///
    /// Tombstones are united first so that no tag a peer has removed can be
    /// re-admitted through the element walk below.
    pub fn merge(&mut self, other: &Self) {
        self.tombstones.extend(&other.tombstones);

        for (element, other_tags) in &other.elements {
            let live = self.elements.entry(element.clone()).or_default();
            for tag in other_tags {
                if !self.tombstones.contains(tag) {
                    live.insert(*tag);
                }
            }
        }

        for live in self.elements.values_mut() {
            live.retain(|tag| !self.tombstones.contains(tag));
        }
    }

    /// Merge into a new set, leaving both inputs untouched.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Live tags for an element, if any were ever added.
    #[must_use]
    pub fn tags_for(&self, element: &T) -> Option<&HashSet<Tag>> {
        self.elements.get(element)
    }

    /// All tombstoned tags.
    #[must_use]
    pub fn tombstones(&self) -> &HashSet<Tag> {
        &self.tombstones
    }
}

impl<T> FromIterator<T> for ORSet<T>
where
    T: Eq + std::hash::Hash + Clone,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            set.add(item);
        }
        set
    }
}

impl<T> ORSet<T>
where
    T: Eq + std::hash::Hash + Clone + Ord,
{
    /// Present elements in sorted order, for stable serialized output.
    #[must_use]
    pub fn to_sorted_vec(&self) -> Vec<T> {
        let mut items: Vec<T> = self.iter().cloned().collect();
        items.sort();
        items
    }
}
