use sqlx::{PgPool, migrate, postgres::PgPoolOptions};

use crate::error::{Error, ErrorDetails};

pub mod quota_queries;
pub mod rate_limit_queries;

#[derive(Debug, Clone)]
pub enum PostgresConnectionInfo {
    Enabled { pool: PgPool },
    Disabled,
}

impl PostgresConnectionInfo {
    pub fn new_with_pool(pool: PgPool) -> Self {
        Self::Enabled { pool }
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    pub async fn connect(postgres_url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .connect(postgres_url)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::PostgresConnectionInitialization {
                    message: e.to_string(),
                })
            })?;
        Ok(Self::Enabled { pool })
    }

    pub fn get_pool_result(&self) -> Result<&PgPool, Error> {
        match self {
            Self::Enabled { pool } => Ok(pool),
            Self::Disabled => Err(Error::new(ErrorDetails::PostgresConnectionInitialization {
                message: "Postgres is disabled but an admission operation required it".to_string(),
            })),
        }
    }
}

pub async fn run_postgres_migrations(pool: &PgPool) -> Result<(), Error> {
    migrate!("src/db/postgres/migrations")
        .run(pool)
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::PostgresMigration {
                message: e.to_string(),
            })
        })
}

/// Runs the embedded migrations against `ADMISSION_POSTGRES_URL`.
/// Entry point for operators running migrations out-of-band.
pub async fn manual_run_postgres_migrations() -> Result<(), Error> {
    let postgres_url = std::env::var("ADMISSION_POSTGRES_URL").map_err(|_| {
        Error::new(ErrorDetails::PostgresConnectionInitialization {
            message: "Failed to read ADMISSION_POSTGRES_URL environment variable".to_string(),
        })
    })?;
    let connection = PostgresConnectionInfo::connect(&postgres_url).await?;
    run_postgres_migrations(connection.get_pool_result()?).await
}
