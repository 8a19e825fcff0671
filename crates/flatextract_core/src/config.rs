// config.rs: run configuration passed by the driver
use serde::Deserialize;
use std::fs;

use crate::codec::DecodeOptions;
use crate::error::{FfeError, Result};
use crate::expression::Selection;

pub const DEFAULT_GUESS_LINES: usize = 10_000;
pub const DEFAULT_GUESS_BYTES: usize = 1024 * 1024;
pub const DEFAULT_READ_BUFFER: usize = 512 * 1024;
pub const DEFAULT_NO_MATCH_REPORT_LIMIT: usize = 3;

fn default_strict() -> bool { true }
fn default_guess_lines() -> usize { DEFAULT_GUESS_LINES }
fn default_guess_bytes() -> usize { DEFAULT_GUESS_BYTES }
fn default_read_buffer() -> usize { DEFAULT_READ_BUFFER }
fn default_report_limit() -> usize { DEFAULT_NO_MATCH_REPORT_LIMIT }

#[derive(Deserialize, Clone, Debug)]
pub struct RunConfig {
    pub version: Option<u32>,
    /// Invalid input is fatal when set, skipped with a warning otherwise.
    #[serde(default = "default_strict")]
    pub strict: bool,
    #[serde(default = "default_guess_lines")]
    pub guess_lines: usize,
    #[serde(default = "default_guess_bytes")]
    pub guess_bytes: usize,
    /// Capacity of the input window; no single line or block may exceed it.
    #[serde(default = "default_read_buffer")]
    pub read_buffer_size: usize,
    /// Shell command template, `%s` is replaced by the input file name.
    #[serde(default)]
    pub preprocessor: Option<String>,
    #[serde(default)]
    pub debug_log: Option<String>,
    #[serde(default)]
    pub hex_uppercase: bool,
    #[serde(default = "default_report_limit")]
    pub no_match_report_limit: usize,
    /// Record selection expressions such as `name=ALICE`; empty selects every record.
    #[serde(default)]
    pub expressions: Vec<String>,
    /// Combine expressions with logical and instead of or.
    #[serde(default)]
    pub expression_all: bool,
    #[serde(default)]
    pub invert_match: bool,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            version: None,
            strict: default_strict(),
            guess_lines: DEFAULT_GUESS_LINES,
            guess_bytes: DEFAULT_GUESS_BYTES,
            read_buffer_size: DEFAULT_READ_BUFFER,
            preprocessor: None,
            debug_log: None,
            hex_uppercase: false,
            no_match_report_limit: DEFAULT_NO_MATCH_REPORT_LIMIT,
            expressions: Vec::new(),
            expression_all: false,
            invert_match: false,
            case_insensitive: false,
        }
    }
}

impl RunConfig {
    pub fn from_json(json: &str) -> Result<RunConfig> {
        let cfg: RunConfig = serde_json::from_str(json)
            .map_err(|e| FfeError::Parse { what: "run configuration", reason: e.to_string() })?;
        if let Some(v) = cfg.version {
            if v != 1 {
                return Err(FfeError::Parse {
                    what: "run configuration",
                    reason: format!("Unsupported run configuration version: {}", v),
                });
            }
        }
        if cfg.read_buffer_size == 0 {
            return Err(FfeError::Parse { what: "run configuration", reason: "read_buffer_size must be positive".to_string() });
        }
        Ok(cfg)
    }

    pub fn load(path: &str) -> Result<RunConfig> {
        let data = fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions { hex_uppercase: self.hex_uppercase }
    }

    /// The configured record selection, None when no expressions are given.
    pub fn selection(&self) -> Result<Option<Selection>> {
        if self.expressions.is_empty() {
            return Ok(None);
        }
        Selection::new(&self.expressions, self.expression_all, self.invert_match, self.case_insensitive).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let cfg = RunConfig::from_json("{}").unwrap();
        assert!(cfg.strict);
        assert_eq!(cfg.guess_lines, 10_000);
        assert_eq!(cfg.guess_bytes, 1024 * 1024);
        assert_eq!(cfg.read_buffer_size, 512 * 1024);
        assert_eq!(cfg.no_match_report_limit, DEFAULT_NO_MATCH_REPORT_LIMIT);
        assert!(cfg.preprocessor.is_none());
        assert!(cfg.selection().unwrap().is_none());
    }

    #[test]
    fn test_selection_options() {
        let cfg = RunConfig::from_json(
            r#"{ "expressions": [ "name^AL", "id=002" ], "expression_all": true, "case_insensitive": true }"#,
        )
        .unwrap();
        let selection = cfg.selection().unwrap().expect("selection");
        assert_eq!(selection.conditions().len(), 2);
        let bad = RunConfig::from_json(r#"{ "expressions": [ "no operator" ] }"#).unwrap();
        assert!(matches!(bad.selection(), Err(FfeError::Parse { .. })));
    }

    #[test]
    fn test_overrides_and_version_check() {
        let cfg = RunConfig::from_json(
            r#"{ "version": 1, "strict": false, "preprocessor": "gzip -dc %s", "hex_uppercase": true }"#,
        )
        .unwrap();
        assert!(!cfg.strict);
        assert_eq!(cfg.preprocessor.as_deref(), Some("gzip -dc %s"));
        assert!(cfg.decode_options().hex_uppercase);
        assert!(matches!(RunConfig::from_json(r#"{ "version": 2 }"#), Err(FfeError::Parse { .. })));
        assert!(matches!(RunConfig::from_json(r#"{ "read_buffer_size": 0 }"#), Err(FfeError::Parse { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut f, br#"{ "guess_lines": 5 }"#).unwrap();
        let cfg = RunConfig::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.guess_lines, 5);
    }
}
