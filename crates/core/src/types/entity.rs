//! Keyed records shared by every synchronized collection.

use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A record that lives in a keyed collection owned by a domain store.
///
/// The key must be derived from the record's own fields (never from a
/// server-assigned row id) so that guest-created records and remotely owned
/// records agree on identity when they are merged.
pub trait Entity:
    Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Natural key of the record.
    type Key: Clone + Ord + Hash + Debug + Send + Sync + 'static;

    /// Compute the natural key.
    fn key(&self) -> Self::Key;
}
