//! Impls - ストア実装
//!
//! - **InMemoryStore**: 開発・テスト用（単一プロセス）
//! - **SqliteStore**: ファイルを共有する複数プロセスでも claim が排他になる
//!
//! `Store` は両者の閉じた直和。呼び出し側は match で振り分ける。

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryStore;
pub use self::sqlite::SqliteStore;

use crate::config::StoreConfig;
use crate::domain::StoreError;
use crate::ports::{Repositories, TransactionManager};

#[derive(Debug, Clone)]
pub enum Store {
    Memory(InMemoryStore),
    Sqlite(SqliteStore),
}

impl Store {
    pub fn memory() -> Self {
        Store::Memory(InMemoryStore::new())
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        match config {
            StoreConfig::Memory => Ok(Store::memory()),
            StoreConfig::Sqlite { path } => SqliteStore::open(path).map(Store::Sqlite),
        }
    }
}

impl TransactionManager for Store {
    fn transaction<T, F>(&self, block: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Repositories) -> Result<T, StoreError>,
    {
        match self {
            Store::Memory(store) => store.transaction(block),
            Store::Sqlite(store) => store.transaction(block),
        }
    }
}

impl From<InMemoryStore> for Store {
    fn from(store: InMemoryStore) -> Self {
        Store::Memory(store)
    }
}

impl From<SqliteStore> for Store {
    fn from(store: SqliteStore) -> Self {
        Store::Sqlite(store)
    }
}
