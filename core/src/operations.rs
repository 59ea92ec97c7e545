use std::marker::PhantomData;

use tokio_postgres::{Error as PgError, Row};
use tracing::debug;

use crate::client::{PostgresClient, PostgresError, ToSql};
use crate::expression::{
    compile_modifier, compile_predicate, Expr, ExpressionError, ValueExpr,
};
use crate::generate::{
    build_delete, build_insert_select, build_merge, build_row_insert, build_row_update,
    build_set_based_update, build_single_column_update,
};
use crate::mapping::{BulkEntity, ColumnMapping, MappingError, TableSpec};
use crate::settings::{BulkSettings, DeleteSettings, UpdateSettings};
use crate::staging::{StagedTable, StagingError};
use crate::value::SqlValue;

/// Columns used to match existing rows during a merge. Defaults to the
/// primary-key columns when unset or empty.
#[derive(Debug, Clone, Default)]
pub struct IdentitySpecification {
    properties: Vec<String>,
}

impl IdentitySpecification {
    pub fn columns<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IdentitySpecification { properties: properties.into_iter().map(Into::into).collect() }
    }

    fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Columns eligible to be overwritten by an update or a matched merge row.
/// Defaults to every non-key column when unset.
#[derive(Debug, Clone, Default)]
pub struct UpdateSpecification {
    properties: Vec<String>,
}

impl UpdateSpecification {
    pub fn columns<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        UpdateSpecification { properties: properties.into_iter().map(Into::into).collect() }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("No connection that can be used was found: {0}")]
    NoUsableConnection(#[source] PostgresError),

    #[error("Statement rejected by the store: {source} (sql: {sql}, parameters: {parameters:?})")]
    Execution {
        sql: String,
        parameters: Vec<(String, SqlValue)>,
        #[source]
        source: PgError,
    },

    #[error(transparent)]
    Postgres(#[from] PostgresError),
}

fn execution_error(source: PgError, sql: &str, parameters: Vec<(String, SqlValue)>) -> BatchError {
    BatchError::Execution { sql: sql.to_string(), parameters, source }
}

/// Identity columns for a merge: the explicit specification when given,
/// the primary-key columns otherwise.
fn resolve_identity_columns<'s>(
    spec: &'s TableSpec,
    identity: Option<&IdentitySpecification>,
) -> Result<Vec<&'s ColumnMapping>, MappingError> {
    match identity {
        Some(identity) if !identity.is_empty() => identity
            .properties
            .iter()
            .map(|property| spec.column_for_property(property))
            .collect(),
        _ => spec.require_primary_key(),
    }
}

/// Update columns: the explicit specification (primary keys filtered out)
/// when given, every non-key column otherwise.
fn resolve_update_columns<'s>(
    spec: &'s TableSpec,
    update: Option<&UpdateSpecification>,
) -> Result<Vec<&'s ColumnMapping>, MappingError> {
    match update {
        Some(update) if !update.properties.is_empty() => {
            let mut columns = Vec::with_capacity(update.properties.len());
            for property in &update.properties {
                let mapping = spec.column_for_property(property)?;
                if !mapping.is_primary_key {
                    columns.push(mapping);
                }
            }
            Ok(columns)
        }
        _ => Ok(spec.non_key_columns()),
    }
}

/// Project entity rows onto the staged column subset, by ordinal.
fn project_rows<E: BulkEntity>(
    spec: &TableSpec,
    items: &[E],
    columns: &[&ColumnMapping],
) -> Result<Vec<Vec<SqlValue>>, MappingError> {
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let full = item.row();
        if full.len() != spec.columns.len() {
            return Err(MappingError::RowArity {
                entity: spec.entity_name(),
                expected: spec.columns.len(),
                actual: full.len(),
            });
        }
        rows.push(columns.iter().map(|c| full[c.ordinal].clone()).collect());
    }
    Ok(rows)
}

/// Per-entity-type bulk mutation facade. Resolves the table mapping once;
/// each operation call stages, generates, executes, and cleans up on one
/// dedicated connection.
pub struct BatchOperation<'c, E: BulkEntity> {
    client: &'c PostgresClient,
    spec: TableSpec,
    _entity: PhantomData<E>,
}

impl<'c, E: BulkEntity> BatchOperation<'c, E> {
    pub fn new(client: &'c PostgresClient) -> Result<Self, BatchError> {
        let spec = TableSpec::resolve::<E>()?;
        debug!(entity = spec.entity_name(), table = %spec.table_name, "Resolved table mapping");
        Ok(BatchOperation { client, spec, _entity: PhantomData })
    }

    pub fn table_spec(&self) -> &TableSpec {
        &self.spec
    }

    fn client_for<'a>(
        &'a self,
        override_connection: Option<&'a PostgresClient>,
    ) -> &'a PostgresClient {
        override_connection.unwrap_or(self.client)
    }

    /// Bulk insert. Stages the non-generated columns and runs one
    /// insert-select; degrades to row-by-row inserts when the connection
    /// cannot stage and the fallback is permitted.
    pub async fn insert_all(&self, items: &[E], settings: &BulkSettings) -> Result<u64, BatchError> {
        if items.is_empty() {
            return Ok(0);
        }
        match self.staged_insert(items, settings, false).await {
            Ok((affected, _)) => Ok(affected),
            Err(BatchError::Staging(StagingError::Unsupported(_)))
                if !settings.disable_default_fallback =>
            {
                debug!(table = %self.spec.table_name, "Staging unsupported, falling back to row-by-row inserts");
                let (affected, _) = self.fallback_insert(items, settings, false).await?;
                Ok(affected)
            }
            Err(other) => Err(other),
        }
    }

    /// Bulk insert that hands back the store-generated column values.
    pub async fn insert_all_returning(
        &self,
        items: &[E],
        settings: &BulkSettings,
    ) -> Result<Vec<Row>, BatchError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        match self.staged_insert(items, settings, true).await {
            Ok((_, rows)) => Ok(rows),
            Err(BatchError::Staging(StagingError::Unsupported(_)))
                if !settings.disable_default_fallback =>
            {
                debug!(table = %self.spec.table_name, "Staging unsupported, falling back to row-by-row inserts");
                let (_, rows) = self.fallback_insert(items, settings, true).await?;
                Ok(rows)
            }
            Err(other) => Err(other),
        }
    }

    async fn staged_insert(
        &self,
        items: &[E],
        settings: &BulkSettings,
        want_rows: bool,
    ) -> Result<(u64, Vec<Row>), BatchError> {
        let columns = self.spec.insertable_columns();
        let rows = project_rows(&self.spec, items, &columns)?;
        let owned: Vec<ColumnMapping> = columns.into_iter().cloned().collect();

        let client = self.client_for(settings.connection.as_deref());
        let mut session = client.dedicated().await.map_err(BatchError::NoUsableConnection)?;
        let tx = session.transaction().await?;

        let staged = StagedTable::create(&tx, &self.spec, owned, &settings.naming).await?;
        staged.load(&tx, &rows, settings.load_strategy, settings.batch_size()).await?;

        let sql = build_insert_select(&self.spec, &staged.name);
        debug!(table = %self.spec.table_name, "Executing staged insert");
        let (affected, returned) = if want_rows {
            let returned =
                tx.query(&sql, &[]).await.map_err(|e| execution_error(e, &sql, Vec::new()))?;
            (returned.len() as u64, returned)
        } else {
            let affected =
                tx.execute(&sql, &[]).await.map_err(|e| execution_error(e, &sql, Vec::new()))?;
            (affected, Vec::new())
        };

        staged.drop(&tx).await?;
        tx.commit().await.map_err(PostgresError::PgError)?;
        Ok((affected, returned))
    }

    /// Bulk update: stages key and update columns, joins on the primary
    /// key, and assigns every staged update column in one statement.
    pub async fn update_all(
        &self,
        items: &[E],
        update: Option<&UpdateSpecification>,
        settings: &BulkSettings,
    ) -> Result<u64, BatchError> {
        if items.is_empty() {
            return Ok(0);
        }
        let keys = self.spec.require_primary_key()?;
        let update_columns = resolve_update_columns(&self.spec, update)?;
        if update_columns.is_empty() {
            debug!(table = %self.spec.table_name, "No updatable columns, skipping update");
            return Ok(0);
        }

        match self.staged_update(items, &keys, &update_columns, settings).await {
            Ok(affected) => Ok(affected),
            Err(BatchError::Staging(StagingError::Unsupported(_)))
                if !settings.disable_default_fallback =>
            {
                debug!(table = %self.spec.table_name, "Staging unsupported, falling back to row-by-row updates");
                self.fallback_update(items, &keys, &update_columns, settings).await
            }
            Err(other) => Err(other),
        }
    }

    async fn staged_update(
        &self,
        items: &[E],
        keys: &[&ColumnMapping],
        update_columns: &[&ColumnMapping],
        settings: &BulkSettings,
    ) -> Result<u64, BatchError> {
        // Stage keys plus update columns, in table ordinal order.
        let staged_columns: Vec<&ColumnMapping> = self
            .spec
            .columns
            .iter()
            .filter(|c| {
                keys.iter().any(|k| k.ordinal == c.ordinal)
                    || update_columns.iter().any(|u| u.ordinal == c.ordinal)
            })
            .collect();
        let rows = project_rows(&self.spec, items, &staged_columns)?;
        let owned: Vec<ColumnMapping> = staged_columns.into_iter().cloned().collect();

        let client = self.client_for(settings.connection.as_deref());
        let mut session = client.dedicated().await.map_err(BatchError::NoUsableConnection)?;
        let tx = session.transaction().await?;

        let staged = StagedTable::create(&tx, &self.spec, owned, &settings.naming).await?;
        staged.load(&tx, &rows, settings.load_strategy, settings.batch_size()).await?;

        let sql = build_set_based_update(&self.spec, update_columns, keys, &staged.name);
        debug!(table = %self.spec.table_name, "Executing staged update");
        let affected =
            tx.execute(&sql, &[]).await.map_err(|e| execution_error(e, &sql, Vec::new()))?;

        staged.drop(&tx).await?;
        tx.commit().await.map_err(PostgresError::PgError)?;
        Ok(affected)
    }

    /// Bulk upsert: stages every column and merges against the identity
    /// columns (primary keys unless specified).
    pub async fn merge_all(
        &self,
        items: &[E],
        identity: Option<&IdentitySpecification>,
        update: Option<&UpdateSpecification>,
        settings: &BulkSettings,
    ) -> Result<u64, BatchError> {
        if items.is_empty() {
            return Ok(0);
        }
        let identity_columns = resolve_identity_columns(&self.spec, identity)?;
        let update_columns = resolve_update_columns(&self.spec, update)?;

        match self.staged_merge(items, &identity_columns, &update_columns, settings).await {
            Ok(affected) => Ok(affected),
            Err(BatchError::Staging(StagingError::Unsupported(_)))
                if !settings.disable_default_fallback =>
            {
                debug!(table = %self.spec.table_name, "Staging unsupported, falling back to row-by-row upserts");
                self.fallback_merge(items, &identity_columns, &update_columns, settings).await
            }
            Err(other) => Err(other),
        }
    }

    async fn staged_merge(
        &self,
        items: &[E],
        identity_columns: &[&ColumnMapping],
        update_columns: &[&ColumnMapping],
        settings: &BulkSettings,
    ) -> Result<u64, BatchError> {
        // Identity columns are match keys, so the staged shape carries
        // every column, store-generated ones included.
        let all_columns: Vec<&ColumnMapping> = self.spec.columns.iter().collect();
        let rows = project_rows(&self.spec, items, &all_columns)?;
        let owned: Vec<ColumnMapping> = self.spec.columns.clone();

        let client = self.client_for(settings.connection.as_deref());
        let mut session = client.dedicated().await.map_err(BatchError::NoUsableConnection)?;
        let tx = session.transaction().await?;

        let staged = StagedTable::create(&tx, &self.spec, owned, &settings.naming).await?;
        staged.load(&tx, &rows, settings.load_strategy, settings.batch_size()).await?;

        let sql = build_merge(&self.spec, &staged.name, identity_columns, update_columns);
        debug!(table = %self.spec.table_name, "Executing staged merge");
        let affected =
            tx.execute(&sql, &[]).await.map_err(|e| execution_error(e, &sql, Vec::new()))?;

        staged.drop(&tx).await?;
        tx.commit().await.map_err(PostgresError::PgError)?;
        Ok(affected)
    }

    /// Filtered operations compile the predicate straight to SQL; no rows
    /// are staged because no bulk payload exists beyond scalar parameters.
    pub fn where_(&self, predicate: Expr) -> FilteredOperation<'_, 'c, E> {
        FilteredOperation { operation: self, predicate }
    }

    async fn fallback_insert(
        &self,
        items: &[E],
        settings: &BulkSettings,
        want_rows: bool,
    ) -> Result<(u64, Vec<Row>), BatchError> {
        let columns = self.spec.insertable_columns();
        let rows = project_rows(&self.spec, items, &columns)?;
        let sql = build_row_insert(&self.spec);
        let has_generated = !self.spec.store_generated_columns().is_empty();

        let client = self.client_for(settings.connection.as_deref());
        let mut affected = 0u64;
        let mut returned = Vec::new();
        for chunk in rows.chunks(settings.batch_size().max(1)) {
            let mut session = client.dedicated().await.map_err(BatchError::NoUsableConnection)?;
            let tx = session.transaction().await?;
            for row in chunk {
                let params: Vec<&(dyn ToSql + Sync)> =
                    row.iter().map(|value| value as &(dyn ToSql + Sync)).collect();
                if want_rows && has_generated {
                    let row = tx
                        .query_one(&sql, &params)
                        .await
                        .map_err(|e| execution_error(e, &sql, Vec::new()))?;
                    returned.push(row);
                    affected += 1;
                } else {
                    affected += tx
                        .execute(&sql, &params)
                        .await
                        .map_err(|e| execution_error(e, &sql, Vec::new()))?;
                }
            }
            tx.commit().await.map_err(PostgresError::PgError)?;
        }
        Ok((affected, returned))
    }

    async fn fallback_update(
        &self,
        items: &[E],
        keys: &[&ColumnMapping],
        update_columns: &[&ColumnMapping],
        settings: &BulkSettings,
    ) -> Result<u64, BatchError> {
        let mut staged_order: Vec<&ColumnMapping> = update_columns.to_vec();
        staged_order.extend_from_slice(keys);
        let rows = project_rows(&self.spec, items, &staged_order)?;
        let sql = build_row_update(&self.spec, update_columns, keys);

        let client = self.client_for(settings.connection.as_deref());
        let mut affected = 0u64;
        for chunk in rows.chunks(settings.batch_size().max(1)) {
            let mut session = client.dedicated().await.map_err(BatchError::NoUsableConnection)?;
            let tx = session.transaction().await?;
            for row in chunk {
                let params: Vec<&(dyn ToSql + Sync)> =
                    row.iter().map(|value| value as &(dyn ToSql + Sync)).collect();
                affected += tx
                    .execute(&sql, &params)
                    .await
                    .map_err(|e| execution_error(e, &sql, Vec::new()))?;
            }
            tx.commit().await.map_err(PostgresError::PgError)?;
        }
        Ok(affected)
    }

    async fn fallback_merge(
        &self,
        items: &[E],
        identity_columns: &[&ColumnMapping],
        update_columns: &[&ColumnMapping],
        settings: &BulkSettings,
    ) -> Result<u64, BatchError> {
        let mut update_order: Vec<&ColumnMapping> = update_columns.to_vec();
        update_order.extend_from_slice(identity_columns);
        let update_rows = project_rows(&self.spec, items, &update_order)?;

        let insert_columns = self.spec.insertable_columns();
        let insert_rows = project_rows(&self.spec, items, &insert_columns)?;

        let update_sql = build_row_update(&self.spec, update_columns, identity_columns);
        let insert_sql = build_row_insert(&self.spec);

        let client = self.client_for(settings.connection.as_deref());
        let mut session = client.dedicated().await.map_err(BatchError::NoUsableConnection)?;
        let tx = session.transaction().await?;

        let mut affected = 0u64;
        for (update_row, insert_row) in update_rows.iter().zip(insert_rows.iter()) {
            let params: Vec<&(dyn ToSql + Sync)> =
                update_row.iter().map(|value| value as &(dyn ToSql + Sync)).collect();
            let updated = if update_columns.is_empty() {
                0
            } else {
                tx.execute(&update_sql, &params)
                    .await
                    .map_err(|e| execution_error(e, &update_sql, Vec::new()))?
            };
            if updated == 0 {
                let params: Vec<&(dyn ToSql + Sync)> =
                    insert_row.iter().map(|value| value as &(dyn ToSql + Sync)).collect();
                affected += tx
                    .execute(&insert_sql, &params)
                    .await
                    .map_err(|e| execution_error(e, &insert_sql, Vec::new()))?;
            } else {
                affected += updated;
            }
        }
        tx.commit().await.map_err(PostgresError::PgError)?;
        Ok(affected)
    }
}

/// A predicate-bound handle for the non-staged delete and single-column
/// update operations.
pub struct FilteredOperation<'op, 'c, E: BulkEntity> {
    operation: &'op BatchOperation<'c, E>,
    predicate: Expr,
}

impl<E: BulkEntity> FilteredOperation<'_, '_, E> {
    /// Delete the matching rows. The explicit match-all predicate deletes
    /// every row; that choice stays with the caller.
    pub async fn delete(&self, settings: &DeleteSettings) -> Result<u64, BatchError> {
        let info = compile_predicate(&self.operation.spec, &self.predicate)?;
        let sql = build_delete(&info);
        let params: Vec<&(dyn ToSql + Sync)> =
            info.parameters.iter().map(|(_, value)| value as &(dyn ToSql + Sync)).collect();

        let client = self.operation.client_for(settings.connection.as_deref());
        debug!(table = %self.operation.spec.table_name, "Executing filtered delete");
        client.execute(&sql, &params).await.map_err(|e| match e {
            PostgresError::PgError(source) => execution_error(source, &sql, info.parameters.clone()),
            pool @ PostgresError::ConnectionPoolError(_) => BatchError::NoUsableConnection(pool),
        })
    }

    /// Set one column on the matching rows from a modifier expression.
    pub async fn update(
        &self,
        property: &str,
        modifier: &ValueExpr,
        settings: &UpdateSettings,
    ) -> Result<u64, BatchError> {
        let info = compile_predicate(&self.operation.spec, &self.predicate)?;
        let compiled =
            compile_modifier(&self.operation.spec, property, modifier, info.parameters.len())?;
        let sql = build_single_column_update(&info, &compiled);

        let mut parameters = info.parameters.clone();
        parameters.extend(compiled.parameters.iter().cloned());
        let params: Vec<&(dyn ToSql + Sync)> =
            parameters.iter().map(|(_, value)| value as &(dyn ToSql + Sync)).collect();

        let client = self.operation.client_for(settings.connection.as_deref());
        debug!(table = %self.operation.spec.table_name, column = %compiled.column, "Executing filtered update");
        client.execute(&sql, &params).await.map_err(|e| match e {
            PostgresError::PgError(source) => execution_error(source, &sql, parameters.clone()),
            pool @ PostgresError::ConnectionPoolError(_) => BatchError::NoUsableConnection(pool),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::test_entities::BlogPost;
    use crate::mapping::{ColumnDescriptor, TableSpec};
    use crate::value::{SqlColumnType, SqlValue};
    use chrono::{TimeZone, Utc};

    fn spec() -> TableSpec {
        TableSpec::resolve::<BlogPost>().unwrap()
    }

    fn post(id: i32, title: &str, reads: i32) -> BlogPost {
        BlogPost {
            id,
            title: Some(title.to_string()),
            created: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            reads,
        }
    }

    #[test]
    fn test_identity_defaults_to_primary_key() {
        let spec = spec();
        let identity = resolve_identity_columns(&spec, None).unwrap();
        let names: Vec<_> = identity.iter().map(|c| c.name_in_database.as_str()).collect();
        assert_eq!(names, vec!["id"]);
        // An empty explicit specification behaves like the default.
        let empty = IdentitySpecification::default();
        let identity = resolve_identity_columns(&spec, Some(&empty)).unwrap();
        assert_eq!(identity.len(), 1);
    }

    #[test]
    fn test_identity_can_match_on_non_key_columns() {
        let spec = spec();
        let identity = IdentitySpecification::columns(["title"]);
        let columns = resolve_identity_columns(&spec, Some(&identity)).unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name_in_database.as_str()).collect();
        assert_eq!(names, vec!["title"]);
    }

    #[test]
    fn test_update_columns_default_to_all_non_key() {
        let spec = spec();
        let columns = resolve_update_columns(&spec, None).unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name_in_database.as_str()).collect();
        assert_eq!(names, vec!["title", "created", "reads"]);
    }

    #[test]
    fn test_update_specification_restricts_and_filters_keys() {
        let spec = spec();
        let update = UpdateSpecification::columns(["reads", "id"]);
        let columns = resolve_update_columns(&spec, Some(&update)).unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name_in_database.as_str()).collect();
        assert_eq!(names, vec!["reads"]);
    }

    #[test]
    fn test_unknown_property_in_specification() {
        let spec = spec();
        let identity = IdentitySpecification::columns(["missing"]);
        assert!(matches!(
            resolve_identity_columns(&spec, Some(&identity)),
            Err(MappingError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn test_project_rows_selects_by_ordinal() {
        let spec = spec();
        let items = vec![post(1, "T1", 10)];
        let columns = spec.insertable_columns();
        let rows = project_rows(&spec, &items, &columns).unwrap();
        assert_eq!(rows.len(), 1);
        // Insertable order: title, created, reads. The generated id never
        // appears in the projection.
        assert_eq!(rows[0][0], SqlValue::Text("T1".into()));
        assert_eq!(rows[0][2], SqlValue::Int(10));
        assert_eq!(rows[0].len(), 3);
    }

    #[test]
    fn test_project_rows_rejects_arity_mismatch() {
        struct Lying;
        impl BulkEntity for Lying {
            fn table_name() -> &'static str {
                "lying"
            }
            fn columns() -> Vec<ColumnDescriptor> {
                vec![
                    ColumnDescriptor::new("a", SqlColumnType::Integer).primary_key(),
                    ColumnDescriptor::new("b", SqlColumnType::Integer),
                ]
            }
            fn row(&self) -> Vec<SqlValue> {
                vec![SqlValue::Int(1)]
            }
        }
        let spec = TableSpec::resolve::<Lying>().unwrap();
        let columns: Vec<_> = spec.columns.iter().collect();
        assert!(matches!(
            project_rows(&spec, &[Lying], &columns),
            Err(MappingError::RowArity { .. })
        ));
    }

    #[test]
    fn test_keyless_merge_without_identity_fails_before_staging() {
        struct KeylessLog;
        impl BulkEntity for KeylessLog {
            fn table_name() -> &'static str {
                "keyless_logs"
            }
            fn columns() -> Vec<ColumnDescriptor> {
                vec![ColumnDescriptor::new("message", SqlColumnType::Text)]
            }
            fn row(&self) -> Vec<SqlValue> {
                vec![SqlValue::Text("m".into())]
            }
        }
        let spec = TableSpec::resolve::<KeylessLog>().unwrap();
        assert!(matches!(
            resolve_identity_columns(&spec, None),
            Err(MappingError::NoPrimaryKey { .. })
        ));
        // With an explicit identity the same entity is mergeable.
        let identity = IdentitySpecification::columns(["message"]);
        assert!(resolve_identity_columns(&spec, Some(&identity)).is_ok());
    }
}
