pub mod approval;
pub mod compensation;
pub mod config;
pub mod definition;
pub mod error;
pub mod executor;
pub mod graph;
pub mod interpolate;
pub mod predicate;
pub mod provider;
pub mod run;
pub mod service;
pub mod store;

mod node;

pub use error::{EngineError, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("cascade tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = EngineError::Validation("missing input node".into());
        assert_eq!(err.to_string(), "validation error: missing input node");
    }

    #[test]
    fn database_error_conversion() {
        let sqlx_err = sqlx::Error::RowNotFound;
        let err: EngineError = sqlx_err.into();
        assert!(matches!(err, EngineError::Database(_)));
        assert_eq!(err.code(), "internal");
    }
}
