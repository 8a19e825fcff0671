// context.rs: execution context driving detection and record iteration
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;

use crate::anonymizer::Anonymizer;
use crate::codec::{decode, DecodeOptions};
use crate::config::RunConfig;
use crate::error::{FfeError, Result};
use crate::expression::Selection;
use crate::filter::run_filter;
use crate::locator::{resolve, Layout};
use crate::reader::{Mode, StreamReader};
use crate::schema::{Encoding, FieldSource, HeaderMode, Level, Record, Schema, Structure};
use crate::tokenizer::{split_fields, unquote_into};
use crate::voter::{Guess, RecordMatcher, StructureVoter};

/// Where a unit came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitPosition {
    pub file: String,
    pub file_line: u64,
    pub global_line: u64,
    pub file_offset: u64,
    pub global_offset: u64,
}

impl UnitPosition {
    fn of(reader: &StreamReader) -> Self {
        UnitPosition {
            file: reader.file_name().to_string(),
            file_line: reader.file_line(),
            global_line: reader.global_line(),
            file_offset: reader.file_offset(),
            global_offset: reader.global_offset(),
        }
    }
}

/// Append-only copy of every unmatched line or block.
struct DebugLog {
    path: String,
    file: File,
    lines: u64,
}

impl DebugLog {
    fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(DebugLog { path: path.to_string(), file, lines: 0 })
    }

    /// Returns the line number of the entry in the log.
    fn write_unit(&mut self, unit: &[u8], binary: bool) -> Result<u64> {
        self.file.write_all(unit)?;
        if !binary {
            self.file.write_all(b"\n")?;
        }
        self.lines += 1;
        Ok(self.lines)
    }
}

/// Owns everything a run needs: schema, reader, detection and per-record scratch.
pub struct ExecutionContext {
    schema: Schema,
    config: RunConfig,
    reader: StreamReader,
    voter: StructureVoter,
    matcher: RecordMatcher,
    layout: Layout,
    anonymizer: Anonymizer,
    structure: Option<usize>,
    record: usize,
    replay: VecDeque<(Vec<u8>, UnitPosition)>,
    raw: Vec<u8>,
    position: UnitPosition,
    header_names: Vec<String>,
    active_profile: Option<(String, String)>,
    debug_log: Option<DebugLog>,
    selection: Option<Selection>,
    selection_checked: bool,
}

impl ExecutionContext {
    pub fn open(schema: Schema, config: RunConfig, files: Vec<String>) -> Result<Self> {
        let reader = StreamReader::open(
            files,
            config.read_buffer_size,
            schema.max_binary_record_length,
            config.preprocessor.clone(),
        );
        let debug_log = match config.debug_log.as_deref() {
            Some(path) => Some(DebugLog::open(path)?),
            None => None,
        };
        let voter = StructureVoter::new(config.no_match_report_limit);
        let selection = config.selection()?;
        Ok(ExecutionContext {
            schema,
            config,
            reader,
            voter,
            matcher: RecordMatcher::new(),
            layout: Layout::new(),
            anonymizer: Anonymizer::new(),
            structure: None,
            record: 0,
            replay: VecDeque::new(),
            raw: Vec::new(),
            position: UnitPosition::default(),
            header_names: Vec::new(),
            active_profile: None,
            debug_log,
            selection,
            selection_checked: false,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn structure(&self) -> Option<&Structure> {
        self.structure.map(|i| &self.schema.structures[i])
    }

    pub fn set_anonymizer(&mut self, anonymizer: Anonymizer) {
        self.anonymizer = anonymizer;
    }

    /// Replace the record selection; None passes every record.
    pub fn set_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection.filter(|s| !s.is_empty());
        self.selection_checked = false;
    }

    pub fn select_structure(&mut self, name: &str) -> Result<()> {
        let idx = self.schema.structure_index(name)?;
        info!("Using structure '{}'", name);
        self.structure = Some(idx);
        Ok(())
    }

    /// Guess the structure from a sample of the input; sampled lines are read again later.
    pub fn detect_structure(&mut self) -> Result<&str> {
        let n = self.schema.structures.len();
        let binary_candidates = self
            .schema
            .structures
            .iter()
            .any(|s| s.is_binary() && s.records.iter().all(|r| !r.ids.is_empty()));

        if binary_candidates {
            self.voter.reset(n);
            if let Some(block) = self.reader.peek_block()? {
                self.voter.vote_block(&self.schema, block);
            }
            match self.voter.outcome(&self.schema) {
                Guess::Found(i) => return Ok(self.detected(i, 1)),
                Guess::Ambiguous(names) => return Err(FfeError::Ambiguous(names)),
                Guess::NoMatch => debug!("No binary structure matches the first block"),
            }
        }

        if self.schema.structures.iter().all(|s| s.is_binary()) {
            return Err(FfeError::NoMatchingStructure);
        }
        self.voter.reset(n);
        let mut bytes = 0usize;
        while self.voter.examined() < self.config.guess_lines && bytes < self.config.guess_bytes {
            let Some(line) = self.reader.next_unit(Mode::Text)? else { break };
            let line = line.to_vec();
            let pos = UnitPosition::of(&self.reader);
            bytes += line.len() + 1;
            self.voter.vote_line(&self.schema, &line, pos.file_line);
            self.replay.push_back((line, pos));
        }
        let sampled = self.voter.examined();
        match self.voter.outcome(&self.schema) {
            Guess::Found(i) => Ok(self.detected(i, sampled)),
            Guess::Ambiguous(names) => Err(FfeError::Ambiguous(names)),
            Guess::NoMatch => Err(FfeError::NoMatchingStructure),
        }
    }

    fn detected(&mut self, idx: usize, sampled: usize) -> &str {
        self.structure = Some(idx);
        let name = &self.schema.structures[idx].name;
        info!("Structure '{}' detected from {} sampled units", name, sampled);
        name
    }

    /// Attach an anonymization profile to a structure; returns the number of fields it covers.
    pub fn activate_anonymization(&mut self, structure: &str, profile: &str) -> Result<usize> {
        let count = self.schema.activate_anonymization(structure, profile)?;
        info!("Anonymization profile '{}' covers {} fields of '{}'", profile, count, structure);
        self.active_profile = Some((structure.to_string(), profile.to_string()));
        Ok(count)
    }

    /// Next valid record of the selected structure, or None at the end of input.
    pub fn next_record(&mut self) -> Result<Option<RecordView<'_>>> {
        let Some(sidx) = self.structure else {
            return Err(FfeError::NoStructureSelected);
        };
        if !self.advance(sidx)? {
            return Ok(None);
        }
        let structure = &self.schema.structures[sidx];
        Ok(Some(RecordView {
            structure,
            record: &structure.records[self.record],
            layout: &self.layout,
            raw: &self.raw,
            position: &self.position,
            header_names: &self.header_names,
            opts: self.config.decode_options(),
        }))
    }

    fn advance(&mut self, sidx: usize) -> Result<bool> {
        let binary = self.schema.structures[sidx].is_binary();
        let mode = if binary { Mode::Binary } else { Mode::Text };
        loop {
            if let Some((bytes, pos)) = self.replay.pop_front() {
                self.raw = bytes;
                self.position = pos;
            } else {
                let Some(unit) = self.reader.next_unit(mode)? else { return Ok(false) };
                self.raw.clear();
                self.raw.extend_from_slice(unit);
                self.position = UnitPosition::of(&self.reader);
            }

            let structure = &self.schema.structures[sidx];
            if !binary && self.position.file_line == 1 {
                let header = match structure.header {
                    HeaderMode::No => false,
                    HeaderMode::First => self.position.global_line == 1,
                    HeaderMode::All => true,
                };
                if header {
                    self.take_header(sidx)?;
                    continue;
                }
            }

            let Some(ridx) = self.matcher.match_record(structure, &self.raw) else {
                self.invalid_unit(binary)?;
                continue;
            };
            let record = &structure.records[ridx];
            let consumed = resolve(self.config.decode_options(), structure, record, &self.raw, &mut self.layout)?;
            if binary {
                self.reader.report_consumed(consumed);
                self.raw.truncate(consumed);
            }
            if let Some(selection) = &self.selection {
                if !self.selection_checked {
                    selection.check_fields(structure, &self.header_names)?;
                    self.selection_checked = true;
                }
                let view = RecordView {
                    structure,
                    record,
                    layout: &self.layout,
                    raw: &self.raw,
                    position: &self.position,
                    header_names: &self.header_names,
                    opts: self.config.decode_options(),
                };
                if !selection.matches(&view)? {
                    trace!("Record '{}' at line {} not selected", record.name, self.position.global_line);
                    continue;
                }
            }
            if record.fields.iter().any(|f| f.anonymize.is_some()) {
                self.anonymizer.apply(structure, record, &self.layout, &mut self.raw);
            }
            self.record = ridx;
            return Ok(true);
        }
    }

    fn invalid_unit(&mut self, binary: bool) -> Result<()> {
        let logged = match self.debug_log.as_mut() {
            Some(log) => Some((log.write_unit(&self.raw, binary)?, log.path.clone())),
            None => None,
        };
        let err = if binary {
            FfeError::InvalidBlock { file: self.position.file.clone(), offset: self.position.file_offset }
        } else {
            FfeError::InvalidLine {
                file: self.position.file.clone(),
                line: self.position.file_line,
                length: self.raw.len(),
            }
        };
        if self.config.strict {
            return Err(err);
        }
        match logged {
            Some((line, path)) => warn!("{} (line {} in '{}')", err, line, path),
            None => warn!("{}", err),
        }
        if binary {
            self.reader.report_consumed(1);
        }
        Ok(())
    }

    /// Name unnamed fields of the structure from the header columns, once.
    fn take_header(&mut self, sidx: usize) -> Result<()> {
        if !self.header_names.is_empty() {
            return Ok(());
        }
        let Encoding::Separated(dialect) = self.schema.structures[sidx].encoding else {
            return Ok(());
        };
        self.header_names = split_fields(&self.raw, &dialect)
            .into_iter()
            .map(|c| String::from_utf8_lossy(&c).into_owned())
            .collect();
        debug!("Header with {} columns read from '{}'", self.header_names.len(), self.position.file);

        let mut renamed = false;
        for record in self.schema.structures[sidx].records.iter_mut() {
            for field in record.fields.iter_mut().filter(|f| f.name.is_none()) {
                if let FieldSource::Input { position, .. } = field.source {
                    let name = self.header_names.get(position - 1).cloned().unwrap_or_else(|| position.to_string());
                    field.name = Some(name);
                    renamed = true;
                }
            }
        }
        if renamed {
            if let Some((structure, profile)) = self.active_profile.clone() {
                if structure == self.schema.structures[sidx].name {
                    self.schema.activate_anonymization(&structure, &profile)?;
                }
            }
        }
        Ok(())
    }
}

/// Static description of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo<'a> {
    pub name: Option<&'a str>,
    /// Declared byte offset (fixed, binary) or column (separated); None for constants.
    pub position: Option<usize>,
    pub length: usize,
}

/// The current record as seen by a renderer.
pub struct RecordView<'a> {
    structure: &'a Structure,
    record: &'a Record,
    layout: &'a Layout,
    raw: &'a [u8],
    position: &'a UnitPosition,
    header_names: &'a [String],
    opts: DecodeOptions,
}

impl<'a> RecordView<'a> {
    pub fn structure_name(&self) -> &'a str {
        &self.structure.name
    }

    pub fn record_name(&self) -> &'a str {
        &self.record.name
    }

    pub fn position(&self) -> &'a UnitPosition {
        self.position
    }

    pub fn file_name(&self) -> &'a str {
        &self.position.file
    }

    pub fn file_line(&self) -> u64 {
        self.position.file_line
    }

    pub fn global_line(&self) -> u64 {
        self.position.global_line
    }

    pub fn file_offset(&self) -> u64 {
        self.position.file_offset
    }

    pub fn global_offset(&self) -> u64 {
        self.position.global_offset
    }

    /// Record bytes after anonymization.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn level(&self) -> Option<&'a Level> {
        self.record.level.as_ref()
    }

    pub fn field_count(&self) -> usize {
        self.record.fields.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        (0..self.field_count()).find(|&i| self.field_info(i).and_then(|f| f.name) == Some(name))
    }

    pub fn field_info(&self, idx: usize) -> Option<FieldInfo<'a>> {
        let field = self.record.fields.get(idx)?;
        let name = match (&field.name, field.position()) {
            (Some(n), _) => Some(n.as_str()),
            (None, Some(p)) => self.header_names.get(p - 1).map(String::as_str),
            (None, None) => None,
        };
        Some(FieldInfo { name, position: field.position(), length: field.length() })
    }

    /// Resolved offset of the field in `raw`, None when absent or constant.
    pub fn field_offset(&self, idx: usize) -> Option<usize> {
        self.layout.offsets.get(idx).copied().flatten()
    }

    pub fn is_present(&self, idx: usize) -> bool {
        match self.record.fields.get(idx) {
            Some(f) if f.is_const() => true,
            Some(_) => self.field_offset(idx).is_some(),
            None => false,
        }
    }

    /// Decoded text of a field, None when the field is absent in this record.
    pub fn field_text(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        let Some(field) = self.record.fields.get(idx) else { return Ok(None) };
        let format = match &field.source {
            FieldSource::Const(v) => return Ok(Some(v.clone())),
            FieldSource::Input { format, .. } => format,
        };
        let Some(bytes) = self.layout.field_bytes(idx, self.raw) else { return Ok(None) };
        let mut out = Vec::with_capacity(bytes.len());
        match self.structure.dialect() {
            Some(d) => unquote_into(bytes, d, &mut out),
            None => decode(format, bytes, self.opts, &mut out)?,
        }
        Ok(Some(out))
    }

    /// Decoded text without surrounding whitespace.
    pub fn field_trimmed(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        Ok(self.field_text(idx)?.map(|t| {
            let start = t.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(t.len());
            let end = t.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |e| e + 1);
            t[start..end].to_vec()
        }))
    }

    /// Decoded text passed through the field's filter command, if it has one.
    pub fn filtered_text(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        let Some(text) = self.field_text(idx)? else { return Ok(None) };
        match self.record.fields.get(idx).and_then(|f| f.filter.as_deref()) {
            Some(command) => run_filter(command, &text).map(Some),
            None => Ok(Some(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn input(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    fn path(f: &tempfile::NamedTempFile) -> String {
        f.path().to_str().unwrap().to_string()
    }

    fn text(v: Option<Vec<u8>>) -> String {
        String::from_utf8(v.expect("field present")).unwrap()
    }

    const SCHEMA: &str = r##"{
      "structures": [
        { "name": "people", "type": "fixed", "records": [
          { "name": "person", "fields": [ { "name": "id", "length": 3 }, { "name": "name", "length": 7 } ] } ] },
        { "name": "pairs", "type": "separated", "separator": ";", "quote": "\"", "header": "first", "records": [
          { "name": "pair", "fields": [ {}, { "name": "value", "filter": "upper" }, { "name": "src", "const": "feed" } ] } ] },
        { "name": "blocks", "type": "binary", "records": [
          { "name": "blk", "ids": [ { "position": 1, "key": "B" } ],
            "fields": [ { "name": "tag", "length": 1 }, { "name": "n", "type": "uint32_le" }, { "name": "pad", "length": 3 } ] } ] }
      ],
      "filters": { "upper": "tr a-z A-Z" },
      "anonymizations": { "p": [ { "field": "key", "method": "mask", "key": "#" } ] }
    }"##;

    fn context(data: &[u8], cfg: RunConfig) -> (ExecutionContext, tempfile::NamedTempFile) {
        let f = input(data);
        let schema = Schema::from_json(SCHEMA).unwrap();
        let ctx = ExecutionContext::open(schema, cfg, vec![path(&f)]).unwrap();
        (ctx, f)
    }

    #[test]
    fn test_detect_fixed_and_read_fields() {
        let (mut ctx, _f) = context(b"001ALICE  \n002BOB    \n", RunConfig::default());
        assert_eq!(ctx.detect_structure().unwrap(), "people");
        let rec = ctx.next_record().unwrap().unwrap();
        assert_eq!(rec.record_name(), "person");
        assert_eq!(rec.field_offset(0), Some(0));
        assert_eq!(rec.field_offset(1), Some(3));
        assert_eq!(text(rec.field_text(0).unwrap()), "001");
        assert_eq!(text(rec.field_trimmed(1).unwrap()), "ALICE");
        assert_eq!((rec.file_line(), rec.global_offset()), (1, 0));
        let rec = ctx.next_record().unwrap().unwrap();
        assert_eq!(text(rec.field_trimmed(1).unwrap()), "BOB");
        assert_eq!(rec.file_offset(), 11);
        assert!(ctx.next_record().unwrap().is_none());
    }

    #[test]
    fn test_binary_blocks_detected_and_consumed() {
        let mut data = Vec::new();
        for i in 0..3u32 {
            data.push(b'B');
            data.extend_from_slice(&(i + 10).to_le_bytes());
            data.extend_from_slice(b"xyz");
        }
        let (mut ctx, _f) = context(&data, RunConfig::default());
        assert_eq!(ctx.detect_structure().unwrap(), "blocks");
        let mut seen = Vec::new();
        while let Some(rec) = ctx.next_record().unwrap() {
            assert_eq!(rec.raw().len(), 8);
            seen.push(text(rec.field_text(1).unwrap()));
        }
        assert_eq!(seen, vec!["10", "11", "12"]);
    }

    #[test]
    fn test_loose_mode_resyncs_binary_by_one_byte() {
        let mut data = b"??".to_vec();
        data.push(b'B');
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(b"abc");
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("invalid.log");
        let cfg = RunConfig {
            strict: false,
            debug_log: Some(log.to_str().unwrap().to_string()),
            ..RunConfig::default()
        };
        let (mut ctx, _f) = context(&data, cfg);
        ctx.select_structure("blocks").unwrap();
        let rec = ctx.next_record().unwrap().unwrap();
        assert_eq!(rec.file_offset(), 2);
        assert_eq!(text(rec.field_text(1).unwrap()), "7");
        assert!(ctx.next_record().unwrap().is_none());
        let logged = std::fs::read(&log).unwrap();
        assert_eq!(&logged[..2], b"??");
    }

    #[test]
    fn test_strict_mode_rejects_invalid_line() {
        let (mut ctx, _f) = context(b"001ALICE  \nshort\n", RunConfig::default());
        ctx.select_structure("people").unwrap();
        assert!(ctx.next_record().unwrap().is_some());
        match ctx.next_record() {
            Err(FfeError::InvalidLine { line, length, .. }) => assert_eq!((line, length), (2, 5)),
            other => panic!("expected invalid line, got {:?}", other.map(|r| r.is_some())),
        }
    }

    #[test]
    fn test_header_names_fields_and_enables_anonymization() {
        let (mut ctx, _f) = context(b"key;value\nabc;\"x;y\"\n", RunConfig::default());
        assert_eq!(ctx.detect_structure().unwrap(), "pairs");
        // "key" is only known once the header has been read
        assert_eq!(ctx.activate_anonymization("pairs", "p").unwrap(), 0);
        let rec = ctx.next_record().unwrap().unwrap();
        assert_eq!(rec.file_line(), 2);
        assert_eq!(rec.field_info(0).unwrap().name, Some("key"));
        assert_eq!(rec.field_index("value"), Some(1));
        assert_eq!(text(rec.field_text(0).unwrap()), "###");
        assert_eq!(text(rec.field_text(1).unwrap()), "x;y");
        assert_eq!(text(rec.filtered_text(1).unwrap()), "X;Y");
        assert!(rec.is_present(2));
        assert_eq!(text(rec.field_text(2).unwrap()), "feed");
        assert_eq!(rec.raw(), b"###;\"x;y\"");
    }

    #[test]
    fn test_next_record_requires_a_structure() {
        let (mut ctx, _f) = context(b"001ALICE  \n", RunConfig::default());
        let err = ctx.next_record().err().expect("no structure selected");
        assert!(matches!(err, FfeError::NoStructureSelected));
        assert!(err.to_string().contains("select or detect"));
    }

    #[test]
    fn test_selection_skips_unmatched_records() {
        let data = b"001ALICE  \n002BOB    \n003alina  \n";
        let cfg = RunConfig {
            expressions: vec!["NAME^al".to_string()],
            case_insensitive: true,
            ..RunConfig::default()
        };
        let (mut ctx, _f) = context(data, cfg);
        ctx.select_structure("people").unwrap();
        let mut ids = Vec::new();
        while let Some(rec) = ctx.next_record().unwrap() {
            ids.push(text(rec.field_text(0).unwrap()));
        }
        assert_eq!(ids, vec!["001", "003"]);

        let cfg = RunConfig {
            expressions: vec!["id=001".to_string(), "id=003".to_string()],
            invert_match: true,
            ..RunConfig::default()
        };
        let (mut ctx, _f) = context(data, cfg);
        ctx.select_structure("people").unwrap();
        let rec = ctx.next_record().unwrap().unwrap();
        assert_eq!(rec.file_line(), 2);
        assert!(ctx.next_record().unwrap().is_none());
    }

    #[test]
    fn test_selection_on_unknown_field_is_fatal() {
        let (mut ctx, _f) = context(b"001ALICE  \n", RunConfig::default());
        ctx.select_structure("people").unwrap();
        ctx.set_selection(Some(Selection::new(&["phone=1"], false, false, false).unwrap()));
        assert!(matches!(ctx.next_record(), Err(FfeError::UnknownField(f)) if f == "phone"));
    }

    #[test]
    fn test_ambiguous_and_unmatched_detection() {
        let schema = Schema::from_json(
            r#"{ "structures": [
              { "name": "a", "type": "fixed", "records": [ { "name": "r", "fields": [ { "name": "x", "length": 2 } ] } ] },
              { "name": "b", "type": "fixed", "records": [ { "name": "r", "fields": [ { "name": "y", "length": 2 } ] } ] }
            ] }"#,
        )
        .unwrap();
        let f = input(b"12\n34\n");
        let mut ctx = ExecutionContext::open(schema.clone(), RunConfig::default(), vec![path(&f)]).unwrap();
        match ctx.detect_structure() {
            Err(FfeError::Ambiguous(names)) => assert_eq!(names, vec!["a".to_string(), "b".to_string()]),
            other => panic!("expected ambiguity, got {:?}", other),
        }
        let g = input(b"123\n");
        let mut ctx = ExecutionContext::open(schema, RunConfig::default(), vec![path(&g)]).unwrap();
        assert!(matches!(ctx.detect_structure(), Err(FfeError::NoMatchingStructure)));
    }

    #[test]
    fn test_detection_buffer_exhaustion_is_actionable() {
        let cfg = RunConfig { read_buffer_size: 8, ..RunConfig::default() };
        let (mut ctx, _f) = context(b"0123456789ABCDEF\n", cfg);
        let err = ctx.detect_structure().unwrap_err();
        assert!(err.to_string().contains("select the structure explicitly"));
    }
}
