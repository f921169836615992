use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cannot read dictionary {path}: {source}")]
    Dictionary {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create compression context: {0}")]
    Context(#[source] io::Error),

    #[error("compression failed: {0}")]
    Compression(#[source] io::Error),

    #[error(
        "cannot reliably compress {len} bytes (compress bound {bound}) into buffer of size {available}"
    )]
    DestinationTooSmall {
        len: usize,
        bound: usize,
        available: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("discarding data of length {len}: cannot fit into buffer of size {capacity}")]
    TooLarge { len: usize, capacity: usize },
}

pub type Result<T, E = CodecError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_error_names_all_sizes() {
        let err = CodecError::DestinationTooSmall {
            len: 300,
            bound: 364,
            available: 128,
        };
        let msg = err.to_string();
        assert!(msg.contains("300"));
        assert!(msg.contains("364"));
        assert!(msg.contains("128"));
    }

    #[test]
    fn too_large_message() {
        let err = BufferError::TooLarge {
            len: 10,
            capacity: 8,
        };
        assert_eq!(
            err.to_string(),
            "discarding data of length 10: cannot fit into buffer of size 8"
        );
    }
}
