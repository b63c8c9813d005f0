use async_trait::async_trait;
use course_core::model::Module;

use super::SqliteRepository;
use super::mapping::{map_module_row, module_id_to_i64};
use crate::repository::{CatalogRepository, StorageError};

#[async_trait]
impl CatalogRepository for SqliteRepository {
    async fn upsert_module(&self, module: &Module) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO modules (id, sequence_number, title, media_locator, media_kind)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                sequence_number = excluded.sequence_number,
                title = excluded.title,
                media_locator = excluded.media_locator,
                media_kind = excluded.media_kind
            ",
        )
        .bind(module_id_to_i64(module.id())?)
        .bind(i64::from(module.sequence_number()))
        .bind(module.title())
        .bind(module.media_locator().to_persisted())
        .bind(module.media_kind().as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(())
    }

    async fn list_modules(&self) -> Result<Vec<Module>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id, sequence_number, title, media_locator, media_kind
            FROM modules
            ORDER BY sequence_number ASC
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut modules = Vec::with_capacity(rows.len());
        for row in rows {
            modules.push(map_module_row(&row)?);
        }
        Ok(modules)
    }
}
