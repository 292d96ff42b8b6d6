//! Catalog tables - providers, models and policies keyed by id.
//!
//! Values are JSON. The catalog store computes the diff between catalog
//! versions and writes only changed rows, all tables in one transaction.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;
use std::convert::Infallible;

use super::StorageError;
use crate::types::{Model, Policy, Provider};

/// Rows loaded at startup.
#[derive(Debug, Default)]
pub struct CatalogRows {
    pub providers: Vec<Provider>,
    pub models: Vec<Model>,
    pub policies: Vec<Policy>,
}

/// Which catalog table a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogTable {
    Providers,
    Models,
    Policies,
}

/// Row writes for one catalog version. `None` deletes the row.
#[derive(Debug, Default)]
pub struct CatalogChanges {
    providers: Vec<(String, Option<Vec<u8>>)>,
    models: Vec<(String, Option<Vec<u8>>)>,
    policies: Vec<(String, Option<Vec<u8>>)>,
}

impl CatalogChanges {
    fn rows_mut(&mut self, table: CatalogTable) -> &mut Vec<(String, Option<Vec<u8>>)> {
        match table {
            CatalogTable::Providers => &mut self.providers,
            CatalogTable::Models => &mut self.models,
            CatalogTable::Policies => &mut self.policies,
        }
    }

    pub fn put<T: Serialize>(&mut self, table: CatalogTable, id: &str, row: &T) -> Result<(), StorageError> {
        let value = serde_json::to_vec(row)?;
        self.rows_mut(table).push((id.to_string(), Some(value)));
        Ok(())
    }

    pub fn delete(&mut self, table: CatalogTable, id: &str) {
        self.rows_mut(table).push((id.to_string(), None));
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.models.is_empty() && self.policies.is_empty()
    }
}

fn apply_rows(
    tree: &TransactionalTree,
    rows: &[(String, Option<Vec<u8>>)],
) -> Result<(), ConflictableTransactionError<Infallible>> {
    for (id, value) in rows {
        match value {
            Some(value) => {
                tree.insert(id.as_bytes(), value.as_slice())?;
            }
            None => {
                tree.remove(id.as_bytes())?;
            }
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct CatalogRepository {
    providers: sled::Tree,
    models: sled::Tree,
    policies: sled::Tree,
}

impl CatalogRepository {
    pub(super) fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            providers: db.open_tree("providers")?,
            models: db.open_tree("models")?,
            policies: db.open_tree("policies")?,
        })
    }

    pub fn load_all(&self) -> Result<CatalogRows, StorageError> {
        Ok(CatalogRows {
            providers: read_all(&self.providers)?,
            models: read_all(&self.models)?,
            policies: read_all(&self.policies)?,
        })
    }

    /// Write every change or none of them.
    pub fn commit(&self, changes: &CatalogChanges) -> Result<(), StorageError> {
        if changes.is_empty() {
            return Ok(());
        }
        (&self.providers, &self.models, &self.policies)
            .transaction(|(providers, models, policies)| {
                apply_rows(providers, &changes.providers)?;
                apply_rows(models, &changes.models)?;
                apply_rows(policies, &changes.policies)?;
                Ok::<(), ConflictableTransactionError<Infallible>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => StorageError::Database(e),
                TransactionError::Abort(never) => match never {},
            })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        for tree in [&self.providers, &self.models, &self.policies] {
            tree.flush()?;
        }
        Ok(())
    }
}

fn read_all<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, StorageError> {
    let mut rows = Vec::with_capacity(tree.len());
    for item in tree.iter() {
        let (_key, value) = item?;
        rows.push(serde_json::from_slice(&value)?);
    }
    Ok(rows)
}
