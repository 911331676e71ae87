use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Fatal diagnostic for contract violations and resource exhaustion.
///
/// Emits a structured error event and panics. The release profile builds with
/// `panic = "abort"`, so outside of tests this terminates the process.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*);
    }};
}

pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: SchedulerError = io.into();
        assert!(matches!(err, SchedulerError::Io(_)));
        assert!(err.to_string().contains("short read"));
    }

    #[test]
    #[should_panic(expected = "block 7")]
    fn fatal_panics_with_diagnostic() {
        fatal!("contract violation: block {} released too often", 7);
    }
}
