use thiserror::Error as ThisError;

use crate::error::{Cause, Error, Message, Result};
use crate::model::{
    Acl, Assignment, Content, ContentType, ContentVersionInfo, Group, HistoryEntry, Id, IdSpace,
    PrimaryKey, Property, Step, StructureRows,
};

/// Failure reported by a persistence collaborator.
#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("foreign key constraint violated: {0}")]
    ForeignKeyViolation(String),
    #[error("row not found: {0}")]
    Missing(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Index row of one data node, used for multiplicity aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub pk: PrimaryKey,
    pub assignment_id: Id,
    /// Parent path with indices, e.g. `/ADDRESS[2]`
    pub parent_xpath: String,
    pub index: u32,
    pub empty: bool,
}

/// Min and max number of same-assignment siblings found in stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccurrenceBounds {
    pub min: u32,
    pub max: u32,
}

/// A stored instance touched by a structural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceRef {
    pub pk: PrimaryKey,
    pub type_id: Id,
    pub acl: Id,
    pub step: Id,
}

/// Rows making up the schema
pub trait StructureStore: Send + Sync {
    fn load_structure(&self) -> StoreResult<StructureRows>;

    fn insert_type(&self, t: &ContentType) -> StoreResult<()>;
    fn update_type(&self, t: &ContentType) -> StoreResult<()>;
    fn delete_type(&self, id: Id) -> StoreResult<()>;

    fn insert_property(&self, property: &Property) -> StoreResult<()>;
    fn update_property(&self, property: &Property) -> StoreResult<()>;
    fn delete_property(&self, id: Id) -> StoreResult<()>;

    fn insert_group(&self, group: &Group) -> StoreResult<()>;
    fn update_group(&self, group: &Group) -> StoreResult<()>;
    fn delete_group(&self, id: Id) -> StoreResult<()>;

    fn insert_assignment(&self, assignment: &Assignment) -> StoreResult<()>;
    fn update_assignment(&self, assignment: &Assignment) -> StoreResult<()>;
    /// Fails with `ForeignKeyViolation` while another assignment still refers to it.
    fn delete_assignment(&self, id: Id) -> StoreResult<()>;

    fn insert_acl(&self, acl: &Acl) -> StoreResult<()>;
    fn insert_step(&self, step: &Step) -> StoreResult<()>;
}

/// Stored content versions plus their index rows
pub trait InstanceStore: Send + Sync {
    fn version_info(&self, id: Id) -> StoreResult<Option<ContentVersionInfo>>;
    fn load_version(&self, id: Id, version: i32) -> StoreResult<Option<Content>>;
    fn store_version(&self, content: &Content, info: &ContentVersionInfo, rows: Vec<DataRow>) -> StoreResult<()>;
    fn remove_content(&self, id: Id) -> StoreResult<()>;

    /// Non-empty occurrence counts per (instance, parent, assignment) over `assignment_ids`;
    /// `None` when no instance stores a node of them.
    fn occurrence_bounds(&self, assignment_ids: &[Id]) -> StoreResult<Option<OccurrenceBounds>>;
    /// Instances holding data of any of `assignment_ids`.
    fn affected_instances(&self, assignment_ids: &[Id]) -> StoreResult<Vec<InstanceRef>>;
    fn instance_count(&self, type_id: Id) -> StoreResult<usize>;
    /// Drop stored data of the assignments; returns the binary ids it referenced.
    fn remove_assignment_data(&self, assignment_ids: &[Id]) -> StoreResult<Vec<Id>>;
    /// Rewrite stored XPaths below `old_prefix` (full xpath with type name).
    fn update_xpath(&self, old_prefix: &str, new_prefix: &str) -> StoreResult<usize>;

    fn store_binary(&self, id: Id, bytes: Vec<u8>) -> StoreResult<()>;
    fn remove_binaries(&self, ids: &[Id]) -> StoreResult<()>;
}

/// Caller-demarcated transaction boundary; calls nest.
pub trait Transactional: Send + Sync {
    fn begin(&self) -> StoreResult<()>;
    fn commit(&self) -> StoreResult<()>;
    fn rollback(&self) -> StoreResult<()>;
}

pub trait SequenceGenerator: Send + Sync {
    fn next_id(&self, space: IdSpace) -> StoreResult<Id>;
}

pub trait HistorySink: Send + Sync {
    fn record(&self, entry: HistoryEntry) -> StoreResult<()>;
}

pub trait Store: StructureStore + InstanceStore + Transactional + SequenceGenerator + HistorySink + Send + Sync {}

impl StoreError {
    fn wrap(self, message: Message, kind: fn(Message, Option<Cause>) -> Error) -> Error {
        match self {
            StoreError::UniqueViolation(_) => Error::EntryExists(message),
            other => kind(message, Some(Box::new(other))),
        }
    }

    /// Uniqueness violations become `EntryExists`, anything else a `Create` failure.
    pub fn into_create(self, message: Message) -> Error {
        self.wrap(message, |message, source| Error::Create { message, source })
    }

    pub fn into_update(self, message: Message) -> Error {
        self.wrap(message, |message, source| Error::Update { message, source })
    }

    pub fn into_remove(self, message: Message) -> Error {
        self.wrap(message, |message, source| Error::Remove { message, source })
    }

    pub fn into_load(self, message: Message) -> Error {
        Error::Load(message.arg(self))
    }
}

impl DataRow {
    /// Index rows of every node of an instance.
    pub fn collect(content: &Content) -> Result<Vec<DataRow>> {
        let tree = content.data();
        let mut rows = Vec::new();
        for id in tree.descendants(tree.root())? {
            let node = tree.node(id)?;
            let parent_xpath = match node.parent {
                Some(parent) => tree.xpath_full(parent)?,
                None => "/".to_string(),
            };
            rows.push(DataRow {
                pk: content.pk,
                assignment_id: node.assignment_id,
                parent_xpath,
                index: node.index,
                empty: tree.is_empty(id)?,
            });
        }
        Ok(rows)
    }
}

/// Run `f` inside a transaction: commit on success, roll back on the first error.
pub fn in_transaction<S, T, F>(store: &S, f: F) -> Result<T>
where
    S: Transactional + ?Sized,
    F: FnOnce() -> Result<T>,
{
    store
        .begin()
        .map_err(|e| e.into_update(Message::new("ex.db.transaction.begin")))?;
    match f() {
        Ok(value) => {
            store
                .commit()
                .map_err(|e| e.into_update(Message::new("ex.db.transaction.commit")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = store.rollback() {
                log::error!("rollback after '{}' failed: {}", err, rollback);
            }
            Err(err)
        }
    }
}
