pub use anyhow::Context;
pub use tracing::{debug, error, info, trace, warn};

/// Result type with `anyhow::Error` as the default error.
pub type AnyResult<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Extensions for error reporting.
pub trait ErrorExt {
    /// Display the whole error chain on one line.
    fn oneliner(&self) -> String;
}

impl ErrorExt for anyhow::Error {
    fn oneliner(&self) -> String {
        self.chain()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ")
    }
}
