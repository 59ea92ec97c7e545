use std::{env, time::Duration};

use bb8::{Pool, PooledConnection, RunError};
use bb8_postgres::PostgresConnectionManager;
use dotenv::dotenv;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::{task, time::timeout};
pub use tokio_postgres::types::{ToSql, Type as PgType};
use tokio_postgres::{
    config::SslMode, Config, Error as PgError, Row, ToStatement, Transaction as PgTransaction,
};
use tracing::{debug, error};

type Manager = PostgresConnectionManager<MakeTlsConnector>;

pub fn connection_string() -> Result<String, env::VarError> {
    dotenv().ok();
    let connection = env::var("DATABASE_URL")?;
    Ok(connection)
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] env::VarError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] tokio_postgres::Error),

    #[error("Can not connect to the database please make sure your connection string is correct")]
    CanNotConnectToDatabase,

    #[error("Could not parse connection string make sure it is correctly formatted")]
    CouldNotParseConnectionString,

    #[error("Could not create tls connector")]
    CouldNotCreateTlsConnector,
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresError {
    #[error("PgError {0}")]
    PgError(#[from] PgError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] RunError<tokio_postgres::Error>),
}

/// Pooled Postgres handle. One staged operation borrows one dedicated
/// session for its whole lifetime; filtered statements borrow per call.
pub struct PostgresClient {
    pool: Pool<Manager>,
}

impl PostgresClient {
    /// Connects using `DATABASE_URL`, retrying without SSL when the server
    /// rejects a TLS handshake and the caller did not pin `sslmode`.
    pub async fn new() -> Result<Self, PostgresConnectionError> {
        let connection_str = connection_string()?;
        Self::from_connection_string(&connection_str).await
    }

    pub async fn from_connection_string(
        connection_str: &str,
    ) -> Result<Self, PostgresConnectionError> {
        async fn build(
            connection_str: &str,
            disable_ssl: bool,
        ) -> Result<PostgresClient, PostgresConnectionError> {
            let mut config: Config = connection_str
                .parse()
                .map_err(|_| PostgresConnectionError::CouldNotParseConnectionString)?;

            if disable_ssl {
                config.ssl_mode(SslMode::Disable);
            }

            let connector = TlsConnector::builder()
                .build()
                .map_err(|_| PostgresConnectionError::CouldNotCreateTlsConnector)?;
            let tls_connector = MakeTlsConnector::new(connector);

            // Direct connection test before handing the config to the pool.
            match timeout(Duration::from_millis(5000), config.connect(tls_connector.clone())).await
            {
                Ok(Ok((client, connection))) => {
                    let connection_handle = task::spawn(connection);
                    if client.query_one("SELECT 1", &[]).await.is_err() {
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                    drop(client);
                    connection_handle.abort();
                }
                Ok(Err(e)) => {
                    if !disable_ssl
                        && config.get_ssl_mode() != SslMode::Disable
                        && !connection_str.contains("sslmode=require")
                    {
                        return Box::pin(build(connection_str, true)).await;
                    }
                    error!("Error connecting to database: {}", e);
                    return Err(PostgresConnectionError::CanNotConnectToDatabase);
                }
                Err(e) => {
                    error!("Timeout connecting to database: {}", e);
                    return Err(PostgresConnectionError::CanNotConnectToDatabase);
                }
            }

            let manager = PostgresConnectionManager::new(config, tls_connector);
            let pool = Pool::builder().build(manager).await?;

            Ok(PostgresClient { pool })
        }

        build(connection_str, false).await
    }

    /// Borrow one connection for the lifetime of a staged operation. Temp
    /// tables are session scoped, so the create, load, statement, and drop
    /// must all run on this session.
    pub async fn dedicated(&self) -> Result<DedicatedSession<'_>, PostgresError> {
        let conn = self.pool.get().await?;
        Ok(DedicatedSession { conn })
    }

    pub async fn execute<T>(
        &self,
        query: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, PostgresError>
    where
        T: ?Sized + ToStatement,
    {
        let conn = self.pool.get().await?;
        debug!("Executing statement");
        conn.execute(query, params).await.map_err(PostgresError::PgError)
    }

    pub async fn query<T>(
        &self,
        query: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, PostgresError>
    where
        T: ?Sized + ToStatement,
    {
        let conn = self.pool.get().await?;
        let rows = conn.query(query, params).await.map_err(PostgresError::PgError)?;
        Ok(rows)
    }

    pub async fn batch_execute(&self, sql: &str) -> Result<(), PostgresError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(sql).await.map_err(PostgresError::PgError)
    }
}

/// One pooled session pinned for the duration of a staged operation.
pub struct DedicatedSession<'a> {
    conn: PooledConnection<'a, Manager>,
}

impl DedicatedSession<'_> {
    /// Opens the operation's transaction. Dropping the transaction without
    /// committing rolls it back, which also removes any temp table created
    /// inside it.
    pub async fn transaction(&mut self) -> Result<PgTransaction<'_>, PostgresError> {
        self.conn.transaction().await.map_err(PostgresError::PgError)
    }
}
