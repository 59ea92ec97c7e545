mod client;
pub use client::{
    connection_string, PostgresClient, PostgresConnectionError, PostgresError, ToSql,
};

pub mod expression;
pub use expression::{
    compile_modifier, compile_predicate, ArithOp, CmpOp, CompiledModifier, Expr, ExpressionError,
    QueryInformation, ValueExpr,
};

pub mod generate;

mod helpers;
pub use helpers::generate_random_id;

pub mod mapping;
pub use mapping::{BulkEntity, ColumnDescriptor, ColumnMapping, MappingError, TableSpec};

mod operations;
pub use operations::{
    BatchError, BatchOperation, FilteredOperation, IdentitySpecification, UpdateSpecification,
};

mod settings;
pub use settings::{
    BulkSettings, DeleteSettings, LoadStrategy, TempTableNaming, UpdateSettings, COPY_THRESHOLD,
    DEFAULT_BATCH_SIZE,
};

mod staging;
pub use staging::{staged_table_name, StagedTable, StagingError};

mod value;
pub use value::{nullable, SqlColumnType, SqlValue};

// export 3rd party dependencies
pub use tokio_postgres::types::Type as PgType;
pub use tokio_postgres::Row;
