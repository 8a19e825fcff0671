// anonymizer/rules.rs: anonymization profiles as declared in the schema document
use serde::Deserialize;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Mask,
    Random,
    #[serde(alias = "nrandom")]
    NumericRandom,
    Hash,
    #[serde(alias = "nhash")]
    NumericHash,
}

/// Digest used by the hash methods, selected by the key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestSize {
    Bits128,
    Bits256,
    Bits512,
}

fn default_start() -> i64 {
    1
}

/// Which part of a field is replaced, and how.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AnonymizationSpec {
    pub method: Method,
    /// 1-based position counted from the front, or from the end when negative.
    #[serde(default = "default_start")]
    pub start: i64,
    /// Maximum number of bytes to replace; 0 means up to the end of the field.
    #[serde(default)]
    pub length: usize,
    /// Mask character for `mask`, digest size in bytes (16, 32, 64) for the hashes.
    #[serde(default)]
    pub key: Option<String>,
}

impl AnonymizationSpec {
    pub fn new(method: Method) -> Self {
        AnonymizationSpec { method, start: default_start(), length: 0, key: None }
    }

    pub fn mask_byte(&self) -> u8 {
        self.key.as_deref().and_then(|k| k.as_bytes().first().copied()).unwrap_or(b'0')
    }

    pub fn digest_size(&self) -> DigestSize {
        match self.key.as_deref().map(str::trim).and_then(|k| k.parse::<u32>().ok()) {
            Some(32) => DigestSize::Bits256,
            Some(64) => DigestSize::Bits512,
            _ => DigestSize::Bits128,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.method, Method::NumericRandom | Method::NumericHash)
    }
}

/// One entry of a named profile: the field it applies to and its `AnonymizationSpec`.
#[derive(Deserialize, Clone, Debug)]
pub struct AnonRule {
    pub field: String,
    #[serde(flatten)]
    pub spec: AnonymizationSpec,
}
