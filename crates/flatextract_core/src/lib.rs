// flatextract_core: schema-driven field extraction from fixed-width, separated and binary flat files.
pub mod anonymizer;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod expression;
pub mod filter;
pub mod locator;
pub mod reader;
pub mod schema;
pub mod tokenizer;
pub mod voter;

pub use anonymizer::{AnonRule, AnonymizationSpec, Anonymizer, Method};
pub use codec::{align, decode, encode_bcd, DecodeOptions, Endian, FieldFormat, FieldType};
pub use config::RunConfig;
pub use context::{ExecutionContext, FieldInfo, RecordView, UnitPosition};
pub use error::{FfeError, Result};
pub use expression::{Operator, Selection};
pub use filter::run_filter;
pub use locator::{resolve, Layout};
pub use reader::{Mode, StreamReader};
pub use schema::{ensure_schema_loaded, load_schema, Encoding, Field, Record, Schema, Structure};
pub use tokenizer::{extract_field, field_count, split_fields, Dialect};
pub use voter::{Guess, StructureVoter};
