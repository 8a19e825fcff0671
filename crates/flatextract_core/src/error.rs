// error.rs: error type shared by every stage of the extractor
use thiserror::Error;

/// The primary error type for all operations in this crate.
///
/// Everything except the crypto fallback in the anonymizer is fatal for the run;
/// the driver is expected to report the error and stop.
#[derive(Debug, Error)]
pub enum FfeError {
    /// An error originating from I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A schema or run configuration document could not be parsed.
    #[error("Failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    /// The schema parsed but violates a structural rule.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// A structure name given by the caller is not declared in the schema.
    #[error("No structure named '{0}'")]
    UnknownStructure(String),

    /// Records were requested before a structure was selected or detected.
    #[error("No structure selected; select or detect one first")]
    NoStructureSelected,

    /// A selection expression names a field the structure does not have.
    #[error("Field '{0}' in expression was not found in the current structure")]
    UnknownField(String),

    /// An anonymization profile name is not declared in the schema.
    #[error("No anonymization profile named '{0}'")]
    UnknownProfile(String),

    /// More than one structure matched every sampled line or block.
    #[error("Input data matches several structures: {}", quote_names(.0))]
    Ambiguous(Vec<String>),

    /// No structure matched the sample.
    #[error("Input data does not match any structure")]
    NoMatchingStructure,

    /// A single line or block did not fit into the input window.
    #[error("Input unit exceeds the read buffer of {capacity} bytes; select the structure explicitly")]
    BufferExhausted { capacity: usize },

    /// A text line matched no record in strict mode.
    #[error("Invalid input line in file '{file}', line {line}, line length = {length}")]
    InvalidLine { file: String, line: u64, length: usize },

    /// A binary block matched no record in strict mode.
    #[error("Invalid input block in file '{file}', offset {offset}")]
    InvalidBlock { file: String, offset: u64 },

    /// Byte order conversion was requested for an unsupported width.
    #[error("Internal endian error: cannot convert a {width} byte value")]
    Endian { width: usize },

    /// A regular expression Id matcher failed to compile.
    #[error("Error in regular expression: {0}")]
    Regex(#[from] regex::Error),

    /// Spawning or talking to a child process failed.
    #[error("Command '{command}' failed: {reason}")]
    Process { command: String, reason: String },

    /// The schema cache lock was poisoned by a panic in another thread.
    #[error("Schema cache lock was poisoned")]
    LockPoisoned,
}

fn quote_names(names: &[String]) -> String {
    names.iter().map(|n| format!("'{}'", n)).collect::<Vec<_>>().join(" ")
}

/// A convenience `Result` type alias using the crate's `FfeError` type.
pub type Result<T> = std::result::Result<T, FfeError>;

#[cfg(test)]
mod tests {
    use super::FfeError;

    #[test]
    fn test_ambiguous_lists_every_candidate() {
        let e = FfeError::Ambiguous(vec!["cdr".to_string(), "cdr_v2".to_string()]);
        assert_eq!(e.to_string(), "Input data matches several structures: 'cdr' 'cdr_v2'");
    }

    #[test]
    fn test_buffer_exhausted_hints_explicit_selection() {
        let e = FfeError::BufferExhausted { capacity: 16 };
        assert!(e.to_string().contains("select the structure explicitly"));
    }
}
