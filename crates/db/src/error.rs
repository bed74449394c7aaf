use ocrd_core::error::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Record not found: {0}")]
    MissingRecord(String),
}

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        CoreError::Storage(err.to_string())
    }
}
