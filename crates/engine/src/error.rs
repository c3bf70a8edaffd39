use std::io;

use imgload_cache::ConfigError;

/// Error type returned by pluggable strategies
pub type StrategyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a load failed
///
/// Delivered to every caller attached to the failed load, shared behind an
/// `Arc`.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The model's data could not be retrieved
    #[error("failed to fetch {model}: {source}")]
    Fetch { model: String, source: StrategyError },

    /// Data was retrieved but could not be turned into a resource
    #[error("failed to decode {model}: {source}")]
    Decode { model: String, source: StrategyError },

    /// The resource could not be serialized for the disk cache
    #[error("failed to encode {key}: {source}")]
    Encode { key: String, source: StrategyError },

    /// No strategy registered for the requested input/output types
    #[error("no {kind} registered for {type_name}")]
    Unregistered {
        kind: &'static str,
        type_name: &'static str,
    },

    #[error("load was cancelled")]
    Cancelled,
}

/// Errors from [`EngineBuilder`](crate::EngineBuilder)
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to start executor: {0}")]
    Executor(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_load_error_display_and_source() {
        let err = LoadError::Fetch {
            model: "https://example.com/a.png".to_string(),
            source: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to fetch https://example.com/a.png: connection refused"
        );
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_unregistered_display() {
        let err = LoadError::Unregistered {
            kind: "model loader",
            type_name: "u32",
        };
        assert_eq!(err.to_string(), "no model loader registered for u32");
    }
}
