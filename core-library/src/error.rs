use thiserror::Error;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Corrupt row: {0}")]
    Decode(String),
}

impl LibraryError {
    pub fn not_found(entity_type: &str, id: impl Into<String>) -> Self {
        LibraryError::NotFound {
            entity_type: entity_type.to_string(),
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LibraryError>;
