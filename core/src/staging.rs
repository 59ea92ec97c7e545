use futures::pin_mut;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type as PgType};
use tokio_postgres::{Error as PgError, Transaction as PgTransaction};
use tracing::debug;

use crate::generate::{build_copy_in, build_create_staging, build_drop, build_values_insert};
use crate::helpers::generate_random_id;
use crate::mapping::{ColumnMapping, TableSpec};
use crate::settings::{LoadStrategy, TempTableNaming, COPY_THRESHOLD};
use crate::value::SqlValue;

#[derive(thiserror::Error, Debug)]
pub enum StagingError {
    #[error("This connection does not support staged bulk loads: {0}")]
    Unsupported(#[source] PgError),

    #[error("Could not create the staging table: {0}")]
    Create(#[source] PgError),

    #[error("Could not write rows to the staging table: {0}")]
    Load(#[source] PgError),

    #[error("Could not drop the staging table: {0}")]
    Drop(#[source] PgError),
}

fn unsupported_or(e: PgError, otherwise: fn(PgError) -> StagingError) -> StagingError {
    if e.code() == Some(&SqlState::FEATURE_NOT_SUPPORTED) {
        StagingError::Unsupported(e)
    } else {
        otherwise(e)
    }
}

pub fn staged_table_name(table: &str, naming: &TempTableNaming) -> String {
    match naming {
        TempTableNaming::UniqueToken => format!("stage_{}_{}", table, generate_random_id(8)),
        TempTableNaming::Exact(name) => name.clone(),
    }
}

/// A transient table shaped like the columns being moved, living inside
/// the operation's transaction. Rolling the transaction back removes it on
/// every exceptional exit; the success path drops it before commit.
pub struct StagedTable {
    pub name: String,
    columns: Vec<ColumnMapping>,
}

impl StagedTable {
    pub async fn create(
        tx: &PgTransaction<'_>,
        spec: &TableSpec,
        columns: Vec<ColumnMapping>,
        naming: &TempTableNaming,
    ) -> Result<StagedTable, StagingError> {
        let name = staged_table_name(&spec.table_name, naming);
        let column_refs: Vec<&ColumnMapping> = columns.iter().collect();
        let sql = build_create_staging(&column_refs, &name);
        debug!(table = %spec.table_name, staged = %name, "Creating staging table");
        tx.batch_execute(&sql).await.map_err(|e| unsupported_or(e, StagingError::Create))?;
        Ok(StagedTable { name, columns })
    }

    pub fn columns(&self) -> &[ColumnMapping] {
        &self.columns
    }

    /// Load staged rows. Each row must carry one value per staged column,
    /// in staged-column order.
    pub async fn load(
        &self,
        tx: &PgTransaction<'_>,
        rows: &[Vec<SqlValue>],
        strategy: LoadStrategy,
        batch_size: usize,
    ) -> Result<u64, StagingError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let use_copy = match strategy {
            LoadStrategy::BinaryCopy => true,
            LoadStrategy::Values => false,
            LoadStrategy::Auto => rows.len() > COPY_THRESHOLD,
        };

        if use_copy {
            self.load_via_copy(tx, rows).await
        } else {
            self.load_via_values(tx, rows, batch_size).await
        }
    }

    async fn load_via_copy(
        &self,
        tx: &PgTransaction<'_>,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64, StagingError> {
        let column_refs: Vec<&ColumnMapping> = self.columns.iter().collect();
        let stmt = build_copy_in(&self.name, &column_refs);
        debug!(staged = %self.name, rows = rows.len(), "Bulk loading via binary COPY");

        let sink = tx
            .copy_in(&stmt)
            .await
            .map_err(|e| unsupported_or(e, StagingError::Load))?;

        let types: Vec<PgType> = self.columns.iter().map(|c| c.sql_type.pg_type()).collect();
        let writer = BinaryCopyInWriter::new(sink, &types);
        pin_mut!(writer);

        for row in rows {
            let params: Vec<&(dyn ToSql + Sync)> =
                row.iter().map(|value| value as &(dyn ToSql + Sync)).collect();
            writer.as_mut().write(&params).await.map_err(StagingError::Load)?;
        }

        writer.finish().await.map_err(StagingError::Load)
    }

    async fn load_via_values(
        &self,
        tx: &PgTransaction<'_>,
        rows: &[Vec<SqlValue>],
        batch_size: usize,
    ) -> Result<u64, StagingError> {
        let column_refs: Vec<&ColumnMapping> = self.columns.iter().collect();
        debug!(staged = %self.name, rows = rows.len(), "Bulk loading via chunked VALUES");

        let mut loaded = 0u64;
        for chunk in rows.chunks(batch_size.max(1)) {
            let sql = build_values_insert(&self.name, &column_refs, chunk.len());
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|value| value as &(dyn ToSql + Sync)))
                .collect();
            loaded += tx.execute(&sql, &params).await.map_err(StagingError::Load)?;
        }
        Ok(loaded)
    }

    /// Success-path teardown. Exceptional exits rely on the transaction
    /// rollback instead.
    pub async fn drop(&self, tx: &PgTransaction<'_>) -> Result<(), StagingError> {
        debug!(staged = %self.name, "Dropping staging table");
        tx.batch_execute(&build_drop(&self.name)).await.map_err(StagingError::Drop)
    }
}
