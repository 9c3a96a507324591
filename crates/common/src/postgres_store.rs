//! Postgres state backend, the production database.
//!
//! ## TLS
//!
//! Hosted Postgres add-ons require TLS but present certificates that do not
//! chain to a public root. When the URL carries no `sslmode`, `sslmode=require`
//! is appended, and `require` follows libpq semantics: the session is
//! encrypted, the certificate is not verified.

use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::task::JoinHandle;
use tokio_postgres::Client;
use tracing::warn;

use crate::store::{StateBackend, StoreError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS "tailscale_data" (
    "id"    serial primary key,
    "state" text not null
);
"#;

/// [`StateBackend`] over one `tokio-postgres` connection.
pub struct PostgresBackend {
    client: Client,
    connection: JoinHandle<()>,
}

impl PostgresBackend {
    /// Connects using a `postgres://` URL.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let url = with_default_sslmode(database_url);
        let config: tokio_postgres::Config = url
            .parse()
            .map_err(|e: tokio_postgres::Error| StoreError::InvalidUrl(e.to_string()))?;

        let tls = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        let (client, connection) = config.connect(MakeTlsConnector::new(tls)).await?;

        // The connection future drives the socket; it ends when `client` drops.
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection closed with error");
            }
        });

        Ok(Self { client, connection })
    }
}

impl Drop for PostgresBackend {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

/// Appends `sslmode=require` unless the URL already names a mode.
pub fn with_default_sslmode(database_url: &str) -> String {
    if database_url.contains("sslmode=") {
        return database_url.to_string();
    }
    let sep = if database_url.contains('?') { '&' } else { '?' };
    format!("{}{}sslmode=require", database_url, sep)
}

#[async_trait]
impl StateBackend for PostgresBackend {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.client.batch_execute(CREATE_TABLE).await?;
        Ok(())
    }

    async fn latest(&self) -> Result<Option<String>, StoreError> {
        let row = self
            .client
            .query_opt(
                r#"SELECT "state" FROM "tailscale_data" ORDER BY "id" DESC LIMIT 1"#,
                &[],
            )
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<_, String>(0)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, state: &str) -> Result<i64, StoreError> {
        let row = self
            .client
            .query_one(
                r#"INSERT INTO "tailscale_data" ("state") VALUES ($1) RETURNING "id""#,
                &[&state],
            )
            .await?;
        let id: i32 = row.try_get(0)?;
        Ok(i64::from(id))
    }

    async fn prune(&self, keep: usize) -> Result<u64, StoreError> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let deleted = self
            .client
            .execute(
                r#"DELETE FROM "tailscale_data" WHERE "id" NOT IN (
                       SELECT "id" FROM "tailscale_data" ORDER BY "id" DESC LIMIT $1
                   )"#,
                &[&keep],
            )
            .await?;
        Ok(deleted)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = self
            .client
            .query_one(r#"SELECT COUNT(*) FROM "tailscale_data""#, &[])
            .await?;
        let n: i64 = row.try_get(0)?;
        Ok(n.max(0) as u64)
    }
}
