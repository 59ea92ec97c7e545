use std::collections::HashSet;

use crate::value::{SqlColumnType, SqlValue};

/// Declared metadata for one entity property. `column` overrides the
/// database name when the property and column are named differently.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub property: &'static str,
    pub column: Option<&'static str>,
    pub sql_type: SqlColumnType,
    pub primary_key: bool,
    pub store_generated: bool,
}

impl ColumnDescriptor {
    pub fn new(property: &'static str, sql_type: SqlColumnType) -> Self {
        ColumnDescriptor { property, column: None, sql_type, primary_key: false, store_generated: false }
    }

    pub fn renamed(mut self, column: &'static str) -> Self {
        self.column = Some(column);
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn store_generated(mut self) -> Self {
        self.store_generated = true;
        self
    }
}

/// An entity type the engine can stage and mutate in bulk. `columns` and
/// `row` must agree on order and arity; ordinals come from declared order.
pub trait BulkEntity: Send + Sync {
    fn schema() -> &'static str {
        "public"
    }

    fn table_name() -> &'static str;

    fn columns() -> Vec<ColumnDescriptor>;

    /// Values for this instance, one per descriptor, in declared order.
    fn row(&self) -> Vec<SqlValue>;
}

#[derive(thiserror::Error, Debug)]
pub enum MappingError {
    #[error("Entity {entity} declares no columns so it cannot be mapped to a table")]
    NoColumns { entity: &'static str },

    #[error("Entity {entity} maps two properties to database column {column}")]
    DuplicateColumn { entity: &'static str, column: String },

    #[error("Entity {entity} has no primary key column and no identity specification was given")]
    NoPrimaryKey { entity: &'static str },

    #[error("Property {property} does not exist on entity {entity}")]
    UnknownProperty { entity: &'static str, property: String },

    #[error("Entity {entity} declares {expected} columns but produced a row of {actual} values")]
    RowArity { entity: &'static str, expected: usize, actual: usize },
}

/// One resolved property-to-column correspondence. Immutable once the
/// owning `TableSpec` is built.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub name_on_object: String,
    pub name_in_database: String,
    pub is_primary_key: bool,
    pub is_store_generated: bool,
    pub ordinal: usize,
    pub sql_type: SqlColumnType,
}

/// Resolved shape of the target table for one entity type. Safe to cache
/// for the process lifetime; never mutated after construction.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub schema: String,
    pub table_name: String,
    pub columns: Vec<ColumnMapping>,
    entity: &'static str,
}

impl TableSpec {
    pub fn resolve<E: BulkEntity>() -> Result<TableSpec, MappingError> {
        let entity = std::any::type_name::<E>();
        let descriptors = E::columns();
        if descriptors.is_empty() {
            return Err(MappingError::NoColumns { entity });
        }

        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(descriptors.len());
        for (ordinal, descriptor) in descriptors.iter().enumerate() {
            let name_in_database = descriptor.column.unwrap_or(descriptor.property).to_string();
            if !seen.insert(name_in_database.clone()) {
                return Err(MappingError::DuplicateColumn { entity, column: name_in_database });
            }
            columns.push(ColumnMapping {
                name_on_object: descriptor.property.to_string(),
                name_in_database,
                is_primary_key: descriptor.primary_key,
                is_store_generated: descriptor.store_generated,
                ordinal,
                sql_type: descriptor.sql_type,
            });
        }

        Ok(TableSpec {
            schema: E::schema().to_string(),
            table_name: E::table_name().to_string(),
            columns,
            entity,
        })
    }

    pub fn entity_name(&self) -> &'static str {
        self.entity
    }

    /// Database column name for a declared property name.
    pub fn column_for_property(&self, property: &str) -> Result<&ColumnMapping, MappingError> {
        self.columns.iter().find(|c| c.name_on_object == property).ok_or_else(|| {
            MappingError::UnknownProperty { entity: self.entity, property: property.to_string() }
        })
    }

    pub fn primary_key_columns(&self) -> Vec<&ColumnMapping> {
        self.columns.iter().filter(|c| c.is_primary_key).collect()
    }

    pub fn non_key_columns(&self) -> Vec<&ColumnMapping> {
        self.columns.iter().filter(|c| !c.is_primary_key).collect()
    }

    pub fn insertable_columns(&self) -> Vec<&ColumnMapping> {
        self.columns.iter().filter(|c| !c.is_store_generated).collect()
    }

    pub fn store_generated_columns(&self) -> Vec<&ColumnMapping> {
        self.columns.iter().filter(|c| c.is_store_generated).collect()
    }

    pub fn require_primary_key(&self) -> Result<Vec<&ColumnMapping>, MappingError> {
        let keys = self.primary_key_columns();
        if keys.is_empty() {
            return Err(MappingError::NoPrimaryKey { entity: self.entity });
        }
        Ok(keys)
    }
}
