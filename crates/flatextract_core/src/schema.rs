// schema.rs: structure/record/field model, JSON loader and cache
use log::debug;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use std::time::SystemTime;

use crate::anonymizer::{AnonRule, AnonymizationSpec};
use crate::codec::FieldFormat;
use crate::error::{FfeError, Result};
use crate::tokenizer::Dialect;

/// Upper bound for a record's nesting level.
pub const MAX_LEVEL: u32 = 1024;

// ---------------- Schema document (JSON) ----------------
#[derive(Deserialize)]
pub struct SchemaRoot {
    pub version: Option<u32>,
    #[serde(default)]
    pub structures: Vec<StructureDef>,
    #[serde(default)]
    pub anonymizations: HashMap<String, Vec<AnonRule>>,
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KindDef { Fixed, Separated, Binary }

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMode {
    #[default]
    #[serde(alias = "none")]
    No,
    First,
    All,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum LengthPolicy {
    #[default]
    Strict,
    Minimum,
}

#[derive(Deserialize)]
pub struct StructureDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: KindDef,
    pub separator: Option<String>,
    #[serde(default)]
    pub squeeze: bool,
    pub quote: Option<String>,
    #[serde(default)]
    pub header: HeaderMode,
    #[serde(default)]
    pub records: Vec<RecordDef>,
}

#[derive(Deserialize)]
pub struct RecordDef {
    pub name: String,
    #[serde(default)]
    pub ids: Vec<IdDef>,
    #[serde(default)]
    pub record_length: LengthPolicy,
    pub variable_length: Option<VariableLengthDef>,
    pub level: Option<LevelDef>,
    pub fields_from: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum IdDef {
    Regex { position: usize, regex: String },
    Literal { position: usize, key: String },
}

#[derive(Deserialize)]
pub struct VariableLengthDef {
    pub length_field: String,
    pub variable_field: String,
    #[serde(default)]
    pub adjust: i64,
}

#[derive(Deserialize)]
pub struct LevelDef {
    pub level: u32,
    pub element: Option<String>,
    pub group: Option<String>,
}

#[derive(Deserialize, Clone)]
pub struct FieldDef {
    pub name: Option<String>,
    pub length: Option<usize>,
    #[serde(rename = "type")]
    pub type_keyword: Option<String>,
    #[serde(rename = "const")]
    pub const_value: Option<String>,
    pub filter: Option<String>,
}

// ---------------- Frozen model ----------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoding {
    Fixed,
    Separated(Dialect),
    Binary,
}

#[derive(Debug, Clone)]
pub enum IdKind {
    Literal(Vec<u8>),
    Regex(Regex),
}

/// Voting key: a literal or regex expected at a 1-based position (column for
/// separated structures).
#[derive(Debug, Clone)]
pub struct IdMatcher {
    pub position: usize,
    pub kind: IdKind,
}

/// Where a field's bytes come from.
#[derive(Debug, Clone)]
pub enum FieldSource {
    Const(Vec<u8>),
    /// `position` is the 0-based byte offset for fixed/binary records and the
    /// 1-based column for separated records.
    Input { position: usize, format: FieldFormat },
}

#[derive(Debug, Clone)]
pub struct Field {
    /// None for separated fields named later from the header line.
    pub name: Option<String>,
    pub source: FieldSource,
    pub filter: Option<String>,
    pub anonymize: Option<AnonymizationSpec>,
}

impl Field {
    pub fn is_const(&self) -> bool {
        matches!(self.source, FieldSource::Const(_))
    }

    pub fn format(&self) -> Option<&FieldFormat> {
        match &self.source {
            FieldSource::Input { format, .. } => Some(format),
            FieldSource::Const(_) => None,
        }
    }

    pub fn position(&self) -> Option<usize> {
        match &self.source {
            FieldSource::Input { position, .. } => Some(*position),
            FieldSource::Const(_) => None,
        }
    }

    /// Declared byte length; the literal length for constants.
    pub fn length(&self) -> usize {
        match &self.source {
            FieldSource::Input { format, .. } => format.length,
            FieldSource::Const(v) => v.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableLength {
    pub length_field: usize,
    pub variable_field: usize,
    pub adjust: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    pub level: u32,
    pub element: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub name: String,
    pub ids: Vec<IdMatcher>,
    pub fields: Vec<Field>,
    pub policy: LengthPolicy,
    /// Byte length (fixed/binary) or column count (separated).
    pub length: usize,
    pub variable: Option<VariableLength>,
    pub level: Option<Level>,
}

#[derive(Debug, Clone)]
pub struct Structure {
    pub name: String,
    pub encoding: Encoding,
    pub header: HeaderMode,
    pub records: Vec<Record>,
    pub max_record_len: usize,
}

impl Structure {
    pub fn is_binary(&self) -> bool {
        self.encoding == Encoding::Binary
    }

    pub fn dialect(&self) -> Option<&Dialect> {
        match &self.encoding {
            Encoding::Separated(d) => Some(d),
            _ => None,
        }
    }

    pub fn has_header(&self) -> bool {
        self.header != HeaderMode::No
    }

    pub fn record(&self, name: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub structures: Vec<Structure>,
    pub profiles: HashMap<String, Vec<AnonRule>>,
    /// Largest static record length over all binary structures.
    pub max_binary_record_length: usize,
}

impl Schema {
    pub fn from_json(json: &str) -> Result<Schema> {
        let root: SchemaRoot = serde_json::from_str(json)
            .map_err(|e| FfeError::Parse { what: "schema JSON", reason: e.to_string() })?;
        if let Some(v) = root.version {
            if v != 1 {
                return Err(FfeError::InvalidSchema(format!("Unsupported schema version: {}", v)));
            }
        }
        Self::freeze(root)
    }

    /// Build the frozen model: positions, lengths and cross references resolved once.
    pub fn freeze(root: SchemaRoot) -> Result<Schema> {
        if root.structures.is_empty() {
            return Err(FfeError::InvalidSchema("No structure definitions".to_string()));
        }
        let mut structures = Vec::with_capacity(root.structures.len());
        let mut max_binary_record_length = 0usize;
        for def in root.structures {
            if structures.iter().any(|s: &Structure| s.name == def.name) {
                return Err(FfeError::InvalidSchema(format!("Duplicate structure '{}'", def.name)));
            }
            let s = build_structure(def, &root.filters)?;
            if s.is_binary() {
                max_binary_record_length = max_binary_record_length.max(s.max_record_len);
            }
            structures.push(s);
        }
        debug!("Schema frozen with {} structures", structures.len());
        Ok(Schema { structures, profiles: root.anonymizations, max_binary_record_length })
    }

    pub fn structure_index(&self, name: &str) -> Result<usize> {
        self.structures
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| FfeError::UnknownStructure(name.to_string()))
    }

    pub fn structure(&self, name: &str) -> Option<&Structure> {
        self.structures.iter().find(|s| s.name == name)
    }

    /// Attach the specs of `profile` to the matching fields of `structure`.
    ///
    /// Field names compare case-insensitively. Any earlier activation on the structure
    /// is replaced. Returns the number of fields that will be anonymized.
    pub fn activate_anonymization(&mut self, structure: &str, profile: &str) -> Result<usize> {
        let idx = self.structure_index(structure)?;
        let rules = self
            .profiles
            .get(profile)
            .ok_or_else(|| FfeError::UnknownProfile(profile.to_string()))?;
        let mut active = 0usize;
        for record in self.structures[idx].records.iter_mut() {
            for field in record.fields.iter_mut() {
                field.anonymize = None;
                if field.is_const() {
                    continue;
                }
                let Some(name) = field.name.as_deref() else { continue };
                if let Some(rule) = rules.iter().find(|r| r.field.eq_ignore_ascii_case(name)) {
                    field.anonymize = Some(rule.spec.clone());
                    active += 1;
                }
            }
        }
        Ok(active)
    }
}

fn single_byte(value: &str, what: &str, structure: &str) -> Result<u8> {
    match value.as_bytes() {
        [b] => Ok(*b),
        _ => Err(FfeError::InvalidSchema(format!(
            "{} must be a single byte, structure '{}'",
            what, structure
        ))),
    }
}

fn build_structure(def: StructureDef, filters: &HashMap<String, String>) -> Result<Structure> {
    let encoding = match def.kind {
        KindDef::Fixed => Encoding::Fixed,
        KindDef::Binary => Encoding::Binary,
        KindDef::Separated => {
            let delimiter = match def.separator.as_deref() {
                Some(s) => single_byte(s, "Separator", &def.name)?,
                None => b',',
            };
            let quote = match def.quote.as_deref() {
                Some(q) => Some(single_byte(q, "Quotation", &def.name)?),
                None => None,
            };
            if quote == Some(delimiter) {
                return Err(FfeError::InvalidSchema(format!(
                    "Quotation and separator cannot be the same character, structure '{}'",
                    def.name
                )));
            }
            Encoding::Separated(Dialect { delimiter, quote, squeeze: def.squeeze })
        }
    };
    if def.header != HeaderMode::No && !matches!(encoding, Encoding::Separated(_)) {
        return Err(FfeError::InvalidSchema(format!(
            "Headers are valid only in separated input, structure '{}'",
            def.name
        )));
    }
    if def.records.is_empty() {
        return Err(FfeError::InvalidSchema(format!("No records in structure '{}'", def.name)));
    }

    let several_records = def.records.len() > 1;
    let field_lists: HashMap<&str, &Vec<FieldDef>> =
        def.records.iter().map(|r| (r.name.as_str(), &r.fields)).collect();

    let mut records = Vec::with_capacity(def.records.len());
    let mut max_record_len = 0usize;
    let mut header_field_count: Option<usize> = None;

    for rdef in &def.records {
        let field_defs: Vec<FieldDef> = match rdef.fields_from.as_deref() {
            Some(from) => {
                if !rdef.fields.is_empty() {
                    return Err(FfeError::InvalidSchema(format!(
                        "fields and fields_from are mutually exclusive, structure '{}', record '{}'",
                        def.name, rdef.name
                    )));
                }
                let src = field_lists.get(from).ok_or_else(|| {
                    FfeError::InvalidSchema(format!(
                        "No record named as '{}' in structure '{}'",
                        from, def.name
                    ))
                })?;
                (*src).clone()
            }
            None => rdef.fields.clone(),
        };
        let record = build_record(&def, &encoding, rdef, field_defs, filters)?;

        if several_records && encoding == Encoding::Binary && record.ids.is_empty() {
            return Err(FfeError::InvalidSchema(format!(
                "Every record in a binary multi-record structure must have an id, structure '{}', record '{}'",
                def.name, record.name
            )));
        }
        if def.header != HeaderMode::No {
            match header_field_count {
                None => header_field_count = Some(record.length),
                Some(n) if n != record.length => {
                    return Err(FfeError::InvalidSchema(format!(
                        "All records in separated structure with header must have equal count of fields, structure '{}'",
                        def.name
                    )))
                }
                Some(_) => {}
            }
        }
        max_record_len = max_record_len.max(record.length);
        records.push(record);
    }

    Ok(Structure { name: def.name, encoding, header: def.header, records, max_record_len })
}

fn build_record(
    sdef: &StructureDef,
    encoding: &Encoding,
    rdef: &RecordDef,
    field_defs: Vec<FieldDef>,
    filters: &HashMap<String, String>,
) -> Result<Record> {
    let invalid = |msg: String| {
        FfeError::InvalidSchema(format!("{}, structure '{}', record '{}'", msg, sdef.name, rdef.name))
    };
    if field_defs.is_empty() {
        return Err(invalid("No fields".to_string()));
    }
    let positioned = field_defs.iter().filter(|f| f.const_value.is_none()).count();
    let mut policy = rdef.record_length;
    let mut length = 0usize;
    let mut ordinal = 0usize;
    let mut fields = Vec::with_capacity(field_defs.len());

    for fdef in field_defs {
        let filter = match fdef.filter.as_deref() {
            Some(name) => Some(
                filters
                    .get(name)
                    .cloned()
                    .ok_or_else(|| invalid(format!("No filter named as '{}'", name)))?,
            ),
            None => None,
        };
        if let Some(value) = fdef.const_value {
            if fdef.length.is_some() || fdef.type_keyword.is_some() {
                return Err(invalid(format!(
                    "Constant field '{}' cannot have a length or type",
                    fdef.name.as_deref().unwrap_or("*")
                )));
            }
            fields.push(Field {
                name: fdef.name,
                source: FieldSource::Const(value.into_bytes()),
                filter,
                anonymize: None,
            });
            continue;
        }

        ordinal += 1;
        let format = match (&fdef.type_keyword, fdef.length) {
            (Some(_), Some(_)) => {
                return Err(invalid("A field has either a length or a type".to_string()));
            }
            (Some(kw), None) => FieldFormat::from_keyword(kw)
                .ok_or_else(|| invalid(format!("Unknown field type '{}'", kw)))?,
            (None, Some(len)) => FieldFormat::ascii(len),
            (None, None) => FieldFormat::ascii(0),
        };
        let fname = fdef.name.as_deref().unwrap_or("*");
        let position = match encoding {
            Encoding::Fixed | Encoding::Binary => {
                if format.length < 1 {
                    if *encoding == Encoding::Binary {
                        return Err(invalid(format!("The field '{}' must have length", fname)));
                    }
                    if ordinal < positioned {
                        return Err(invalid(format!("The field '{}' must have length", fname)));
                    }
                    // last field without length takes the rest of the line
                    policy = LengthPolicy::Minimum;
                }
                let p = length;
                length += format.length;
                p
            }
            Encoding::Separated(_) => {
                length += 1;
                ordinal
            }
        };
        let name = match fdef.name {
            Some(n) => Some(n),
            None if sdef.header == HeaderMode::No => Some(ordinal.to_string()),
            None => None,
        };
        fields.push(Field { name, source: FieldSource::Input { position, format }, filter, anonymize: None });
    }

    let mut ids = Vec::with_capacity(rdef.ids.len());
    for idef in &rdef.ids {
        let (position, kind) = match idef {
            IdDef::Regex { position, regex } => (*position, IdKind::Regex(Regex::new(regex)?)),
            IdDef::Literal { position, key } => (*position, IdKind::Literal(expand_non_print(key))),
        };
        if position < 1 {
            return Err(invalid("Id position must be greater than zero".to_string()));
        }
        ids.push(IdMatcher { position, kind });
    }

    let variable = match &rdef.variable_length {
        Some(v) => {
            if matches!(encoding, Encoding::Separated(_)) {
                return Err(invalid("variable_length is valid only in fixed and binary records".to_string()));
            }
            let find = |name: &str| {
                fields
                    .iter()
                    .position(|f| !f.is_const() && f.name.as_deref() == Some(name))
                    .ok_or_else(|| invalid(format!("No field named as '{}'", name)))
            };
            let length_field = find(&v.length_field)?;
            let variable_field = find(&v.variable_field)?;
            if length_field >= variable_field {
                return Err(invalid("The length field must precede the variable field".to_string()));
            }
            Some(VariableLength { length_field, variable_field, adjust: v.adjust })
        }
        None => None,
    };

    let level = match &rdef.level {
        Some(l) => {
            if l.level < 1 || l.level > MAX_LEVEL {
                return Err(invalid(format!("Invalid level value {}", l.level)));
            }
            Some(Level { level: l.level, element: l.element.clone(), group: l.group.clone() })
        }
        None => None,
    };

    Ok(Record { name: rdef.name.clone(), ids, fields, policy, length, variable, level })
}

/// Expand `\xNN` escapes so literal ids can carry non-printable bytes.
pub(crate) fn expand_non_print(s: &str) -> Vec<u8> {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0usize;
    while i < b.len() {
        if b[i] == b'\\' && i + 3 < b.len() && b[i + 1] == b'x' {
            let parsed = std::str::from_utf8(&b[i + 2..i + 4])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(v) = parsed {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(b[i]);
        i += 1;
    }
    out
}

// ---------------- Cached loading ----------------
pub struct LoadedSchema {
    pub path: String,
    pub mtime: Option<SystemTime>,
    pub schema: Schema,
}

pub static SCHEMA_CACHE: Lazy<RwLock<Option<LoadedSchema>>> = Lazy::new(|| RwLock::new(None));

fn read_mtime(path: &Path) -> Option<SystemTime> { fs::metadata(path).ok().and_then(|m| m.modified().ok()) }

pub fn load_schema(schema_path: &str) -> Result<LoadedSchema> {
    let data = fs::read_to_string(schema_path)?;
    let schema = Schema::from_json(&data)?;
    let mtime = read_mtime(Path::new(schema_path));
    Ok(LoadedSchema { path: schema_path.to_string(), mtime, schema })
}

/// Return the schema at `schema_path`, reloading it when the path or mtime changed.
pub fn ensure_schema_loaded(schema_path: &str) -> Result<Schema> {
    let mut guard = SCHEMA_CACHE.write().map_err(|_| FfeError::LockPoisoned)?;
    let need_reload = match guard.as_ref() {
        None => true,
        Some(ls) => {
            if ls.path != schema_path { true } else {
                let current = read_mtime(Path::new(schema_path));
                current != ls.mtime
            }
        }
    };
    if need_reload {
        let loaded = load_schema(schema_path)?;
        *guard = Some(loaded);
    }
    match guard.as_ref() {
        Some(ls) => Ok(ls.schema.clone()),
        None => Err(FfeError::InvalidSchema(format!("Schema '{}' not loaded", schema_path))),
    }
}
