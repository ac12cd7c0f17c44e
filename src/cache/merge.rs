//! Delta application rules.
//!
//! Every merge is a pure function of the existing collection and the delta:
//! tombstones remove by id, everything else is an insert-or-replace that keeps
//! the first-seen position. Merges never fail; a delta that does not line up
//! with the local view is folded as well as it can be and reported.

use std::collections::HashMap;

use tracing::debug;

use super::traits::Record;
use crate::ledger::types::{Category, CategoryGroup};

/// Output of a merge.
#[derive(Debug, Clone)]
pub struct Merged<T> {
  pub records: Vec<T>,
  /// Nested records whose parent was missing from the merged view
  pub orphans: Vec<Orphan>,
}

impl<T> Merged<T> {
  pub fn plain(records: Vec<T>) -> Self {
    Self {
      records,
      orphans: Vec::new(),
    }
  }
}

/// A category that referenced a group the mirror does not know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
  pub record_id: String,
  pub parent_id: String,
}

/// Insertion-ordered map keyed by record id.
///
/// Removed records leave a hole so positions of later records stay valid.
struct OrderedIndex<T> {
  positions: HashMap<String, usize>,
  slots: Vec<Option<T>>,
}

impl<T: Record> OrderedIndex<T> {
  fn with_capacity(capacity: usize) -> Self {
    Self {
      positions: HashMap::with_capacity(capacity),
      slots: Vec::with_capacity(capacity),
    }
  }

  fn from_existing(existing: &[T], extra: usize) -> Self {
    let mut index = Self::with_capacity(existing.len() + extra);
    for record in existing {
      // A tombstone that slipped into a cached view is dropped here
      if !record.is_deleted() {
        index.upsert(record.clone());
      }
    }
    index
  }

  fn upsert(&mut self, record: T) {
    let known = self.positions.get(record.record_id().as_ref()).copied();
    match known {
      Some(pos) => self.slots[pos] = Some(record),
      None => {
        self.positions.insert(record.record_id().into_owned(), self.slots.len());
        self.slots.push(Some(record));
      }
    }
  }

  fn remove(&mut self, id: &str) -> Option<T> {
    let pos = self.positions.remove(id)?;
    self.slots[pos].take()
  }

  fn get_mut(&mut self, id: &str) -> Option<&mut T> {
    let pos = *self.positions.get(id)?;
    self.slots[pos].as_mut()
  }

  fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
    self.slots.iter_mut().flatten()
  }

  fn into_vec(self) -> Vec<T> {
    self.slots.into_iter().flatten().collect()
  }
}

/// Fold `delta` into `existing` at the identifier level.
pub fn merge_records<T: Record>(existing: &[T], delta: Vec<T>) -> Vec<T> {
  let mut index = OrderedIndex::from_existing(existing, delta.len());

  for record in delta {
    if record.is_deleted() {
      index.remove(&record.record_id());
    } else {
      index.upsert(record);
    }
  }

  index.into_vec()
}

/// Fold a category-group delta into the cached groups.
///
/// Group-level changes are applied first so that a parent appearing later in
/// the same response is known before its categories are placed. A category is
/// filed under the group named by its `category_group_id`; when that group is
/// unknown it is kept under a placeholder group and reported as an orphan.
pub fn merge_category_groups(existing: &[CategoryGroup], delta: Vec<CategoryGroup>) -> Merged<CategoryGroup> {
  let mut groups = OrderedIndex::from_existing(existing, delta.len());
  let mut pending: Vec<(String, Category)> = Vec::new();

  for mut incoming in delta {
    if incoming.deleted {
      if groups.remove(&incoming.id).is_some() {
        debug!(group = %incoming.id, "Removed category group");
      }
      // Categories carried by an earlier upsert of this group die with it
      pending.retain(|(containing, category)| {
        containing != &incoming.id
          || !(category.category_group_id.is_empty() || category.category_group_id == incoming.id)
      });
      continue;
    }

    let categories = std::mem::take(&mut incoming.categories);
    for category in categories {
      pending.push((incoming.id.clone(), category));
    }

    match groups.get_mut(&incoming.id) {
      Some(current) => {
        current.name = incoming.name;
        current.hidden = incoming.hidden;
        current.placeholder = false;
      }
      None => {
        incoming.placeholder = false;
        groups.upsert(incoming);
      }
    }
  }

  let mut orphans = Vec::new();

  for (containing_group, category) in pending {
    let parent = if category.category_group_id.is_empty() {
      containing_group
    } else {
      category.category_group_id.clone()
    };

    // Category ids are unique across groups; a move detaches it from the old one
    for group in groups.values_mut() {
      if group.id != parent || category.deleted {
        group.categories.retain(|c| c.id != category.id);
      }
    }

    if category.deleted {
      continue;
    }

    if groups.get_mut(&parent).is_none() {
      groups.upsert(CategoryGroup::placeholder(&parent));
    }

    if let Some(group) = groups.get_mut(&parent) {
      if group.placeholder {
        orphans.push(Orphan {
          record_id: category.id.clone(),
          parent_id: parent.clone(),
        });
      }

      let mut category = category;
      category.category_group_id = parent;
      match group.categories.iter_mut().find(|c| c.id == category.id) {
        Some(slot) => *slot = category,
        None => group.categories.push(category),
      }
    }
  }

  let records = groups
    .into_vec()
    .into_iter()
    .filter(|group| !(group.placeholder && group.categories.is_empty()))
    .collect();

  Merged { records, orphans }
}
