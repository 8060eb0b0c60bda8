use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChipletError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {msg}")]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid hypergraph: {0}")]
    InvalidHypergraph(String),

    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    #[error("external tool `{tool}` failed: {msg}")]
    ExternalTool { tool: String, msg: String },
}

impl ChipletError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChipletError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, msg: impl Into<String>) -> Self {
        ChipletError::Parse {
            path: path.into(),
            line,
            msg: msg.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChipletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_message_has_location() {
        let err = ChipletError::parse("design.hgr", 7, "expected 3 fields");
        assert_eq!(err.to_string(), "design.hgr:7: expected 3 fields");
    }
}
