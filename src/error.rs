use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Credentials(String),

    #[error("{0}")]
    Api(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

/// Failure causes inside the snapshot store. These never cross the store's
/// public `bool`/`Option` surface; they exist so logs and tests can tell them
/// apart.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot store is unavailable")]
    Unavailable,

    #[error("observation is missing {0}")]
    MissingMeasure(&'static str),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
