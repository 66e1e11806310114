//! Typed helpers over the record-based [`Storage`] contract.

use async_trait::async_trait;
use toggler_core::{Entity, Record};

use crate::StorageResult;
use crate::context::Context;
use crate::traits::{Storage, collect, decode_stream};

/// Typed CRUD for every [`Storage`].
#[async_trait]
pub trait StorageExt: Storage {
    /// Creates `entity`, writing the assigned id back into it.
    async fn create_entity<T: Entity>(&self, ctx: &Context, entity: &mut T) -> StorageResult<()> {
        let mut record = Record::from_entity(entity)?;
        self.create(ctx, &mut record).await?;
        entity.set_id(record.id);
        Ok(())
    }

    async fn find_entity<T: Entity>(&self, ctx: &Context, id: &str) -> StorageResult<Option<T>> {
        match self.find_by_id(ctx, T::KIND, id).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    async fn find_all_entities<T: Entity>(&self, ctx: &Context) -> StorageResult<Vec<T>> {
        let records = self.find_all(ctx, T::KIND).await?;
        collect(decode_stream(records)).await
    }

    async fn update_entity<T: Entity>(&self, ctx: &Context, entity: &T) -> StorageResult<()> {
        let record = Record::from_entity(entity)?;
        self.update(ctx, &record).await
    }

    async fn delete_entity<T: Entity>(&self, ctx: &Context, id: &str) -> StorageResult<()> {
        self.delete_by_id(ctx, T::KIND, id).await
    }

    async fn delete_all_entities<T: Entity>(&self, ctx: &Context) -> StorageResult<()> {
        self.delete_all(ctx, T::KIND).await
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}
