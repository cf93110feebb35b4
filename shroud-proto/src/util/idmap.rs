//! A map from randomly-allocated identifiers to entries.
//!
//! Circuit IDs on a channel and stream IDs on a circuit are both
//! picked uniformly at random from their ID space, retrying on
//! collision; this type implements that allocation policy once.

use crate::{Error, Result};

use rand::distributions::Distribution;
use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;

/// How many random draws do we attempt before declaring an ID space
/// saturated?
///
/// With a space even one-eighth occupied, sixty-four independent
/// draws fail with probability about 2^-192; hitting this limit in
/// practice means the map is effectively full.
pub(crate) const MAX_ID_ATTEMPTS: usize = 64;

/// A map from identifiers to entries, along with a distribution for
/// allocating new identifiers.
pub(crate) struct IdMap<ID, DST, VAL>
where
    ID: Hash + Eq + Clone,
    DST: Distribution<ID>,
{
    /// The distribution new identifiers are drawn from.
    dist: DST,
    /// The entries, indexed by identifier.
    m: HashMap<ID, VAL>,
}

impl<ID, DST, VAL> IdMap<ID, DST, VAL>
where
    ID: Hash + Eq + Clone,
    DST: Distribution<ID>,
{
    /// Make a new empty map.
    pub(crate) fn new(dist: DST) -> Self {
        Self {
            dist,
            m: HashMap::new(),
        }
    }

    /// Construct a new random identifier not presently in use.
    fn gen_id<R: Rng>(&self, rng: &mut R) -> Option<ID> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.dist.sample(rng);
            if !self.m.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Insert a new entry into this map, allocating an identifier for
    /// it.
    ///
    /// Fails with [`Error::IdRangeFull`] when the space is saturated.
    pub(crate) fn add_ent<R: Rng>(&mut self, rng: &mut R, val: VAL) -> Result<ID> {
        let id = self.gen_id(rng).ok_or(Error::IdRangeFull)?;
        self.m.insert(id.clone(), val);
        Ok(id)
    }

    /// Replace the current entry at `id` with `val`.
    pub(crate) fn put_ent(&mut self, id: ID, val: VAL) {
        self.m.insert(id, val);
    }

    /// Remove the entry for `id` on this map, if any.
    pub(crate) fn remove(&mut self, id: &ID) -> Option<VAL> {
        self.m.remove(id)
    }

    /// Return the entry for `id` in this map, if any.
    pub(crate) fn get_mut(&mut self, id: &ID) -> Option<&mut VAL> {
        self.m.get_mut(id)
    }

    /// Return the number of entries in this map.
    pub(crate) fn len(&self) -> usize {
        self.m.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::distributions::Standard;

    #[test]
    fn alloc_and_remove() {
        let mut map: IdMap<u16, Standard, &str> = IdMap::new(Standard);
        let mut rng = rand::thread_rng();
        let id1 = map.add_ent(&mut rng, "first").unwrap();
        let id2 = map.add_ent(&mut rng, "second").unwrap();
        assert_ne!(id1, id2);
        assert_eq!(map.len(), 2);
        assert_eq!(map.remove(&id1), Some("first"));
        assert_eq!(map.remove(&id1), None);
        assert_eq!(map.get_mut(&id2), Some(&mut "second"));
    }
}
