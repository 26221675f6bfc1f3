use std::collections::{btree_map, BTreeMap};

use serde::{ser::SerializeMap, Serialize, Serializer};

/// Column name of relevance tables.
pub const RELEVANT: &str = "relevant";
/// Column name of recommendation tables.
pub const RECOMMENDATIONS: &str = "recommendations";

/// Per-user ordered item lists under a named column.
///
/// Serializes as `{"<user_id>": {"<column>": [items...]}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingTable {
    column: &'static str,
    rows: BTreeMap<u32, Vec<u32>>,
}

/// Ground-truth ranking derived from observed ratings.
pub type RelevanceTable = RankingTable;
/// Ranking derived from model scores.
pub type RecommendationTable = RankingTable;

impl RankingTable {
    /// Empty table with column `relevant`.
    #[must_use]
    pub const fn relevance() -> Self {
        Self {
            column: RELEVANT,
            rows: BTreeMap::new(),
        }
    }

    /// Empty table with column `recommendations`.
    #[must_use]
    pub const fn recommendations() -> Self {
        Self {
            column: RECOMMENDATIONS,
            rows: BTreeMap::new(),
        }
    }

    /// Column name.
    #[must_use]
    pub const fn column(&self) -> &'static str {
        self.column
    }

    /// Items for `user_id`.
    #[must_use]
    pub fn get(&self, user_id: u32) -> Option<&[u32]> {
        self.rows.get(&user_id).map(Vec::as_slice)
    }

    /// Sets the items for `user_id`.
    pub fn insert(&mut self, user_id: u32, items: Vec<u32>) {
        self.rows.insert(user_id, items);
    }

    /// Number of users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no user is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Users, ascending.
    pub fn users(&self) -> impl Iterator<Item = u32> + '_ {
        self.rows.keys().copied()
    }

    /// `(user, items)` pairs ordered by user.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u32])> + '_ {
        self.rows.iter().map(|(user, items)| (*user, items.as_slice()))
    }

    /// Consumes the table into its user map.
    #[must_use]
    pub fn into_inner(self) -> BTreeMap<u32, Vec<u32>> {
        self.rows
    }
}

impl<'a> IntoIterator for &'a RankingTable {
    type Item = (&'a u32, &'a Vec<u32>);
    type IntoIter = btree_map::Iter<'a, u32, Vec<u32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl Serialize for RankingTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Entry<'a>(&'static str, &'a [u32]);

        impl Serialize for Entry<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(self.0, self.1)?;
                map.end()
            }
        }

        serializer.collect_map(
            self.rows
                .iter()
                .map(|(user, items)| (user, Entry(self.column, items))),
        )
    }
}
