use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A scheduled one-shot transformation attached to `(chain_id, block)`.
/// Its input entity set is pre-loaded through the store while the block is
/// being staged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub name: String,
    pub chain_id: u64,
    pub block: u64,
    /// The collection whose snapshot the migration consumes.
    pub entity: String,
}

/// Migrations flattened into a `"<chain_id>-<block>"` map at startup for a
/// constant-time lookup per recorded block.
#[derive(Debug, Default)]
pub struct MigrationsIndex {
    by_block: HashMap<String, Vec<Migration>>,
}

impl MigrationsIndex {
    pub fn index(migrations: impl IntoIterator<Item = Migration>) -> Self {
        let mut by_block: HashMap<String, Vec<Migration>> = HashMap::new();
        for migration in migrations {
            by_block
                .entry(Self::block_key(migration.chain_id, migration.block))
                .or_default()
                .push(migration);
        }
        MigrationsIndex { by_block }
    }

    pub fn at(&self, chain_id: u64, number: u64) -> &[Migration] {
        self.by_block
            .get(&Self::block_key(chain_id, number))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_block.is_empty()
    }

    fn block_key(chain_id: u64, number: u64) -> String {
        format!("{}-{}", chain_id, number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(name: &str, chain_id: u64, block: u64) -> Migration {
        Migration {
            name: name.to_owned(),
            chain_id,
            block,
            entity: "balances".to_owned(),
        }
    }

    #[test]
    fn lookups_are_scoped_to_chain_and_block() {
        let index = MigrationsIndex::index(vec![
            migration("a", 1, 100),
            migration("b", 1, 100),
            migration("c", 5, 100),
        ]);

        assert_eq!(index.at(1, 100).len(), 2);
        assert_eq!(index.at(5, 100).len(), 1);
        assert!(index.at(1, 101).is_empty());
        assert!(index.at(2, 100).is_empty());
    }

    #[test]
    fn empty_index() {
        let index = MigrationsIndex::index(Vec::new());
        assert!(index.is_empty());
        assert!(index.at(1, 1).is_empty());
    }
}
