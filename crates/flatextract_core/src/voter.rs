// voter.rs: structure detection by voting over sampled lines and blocks
use log::{debug, warn};

use crate::locator::fixed_part;
use crate::schema::{Encoding, IdKind, IdMatcher, LengthPolicy, Record, Schema, Structure};
use crate::tokenizer::{column_spans, unquote_into, Dialect};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guess {
    /// Index of the single winning structure.
    Found(usize),
    Ambiguous(Vec<String>),
    NoMatch,
}

/// Reusable scratch for Id and length tests.
#[derive(Debug, Default)]
pub struct RecordMatcher {
    spans: Vec<(usize, usize)>,
    column: Vec<u8>,
}

impl RecordMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first record of `structure` accepting `unit`.
    pub fn match_record(&mut self, structure: &Structure, unit: &[u8]) -> Option<usize> {
        if let Encoding::Separated(d) = &structure.encoding {
            column_spans(unit, d, &mut self.spans);
        }
        structure.records.iter().position(|r| self.record_matches(structure, r, unit))
    }

    fn record_matches(&mut self, structure: &Structure, record: &Record, unit: &[u8]) -> bool {
        match &structure.encoding {
            Encoding::Separated(d) => {
                let count = self.spans.len();
                let length_ok = match record.policy {
                    LengthPolicy::Strict => count == record.length,
                    LengthPolicy::Minimum => count >= record.length,
                };
                length_ok && record.ids.iter().all(|id| self.column_matches(d, id, unit))
            }
            Encoding::Fixed => {
                let need = fixed_part(record);
                let length_ok = match (record.policy, record.variable) {
                    (LengthPolicy::Strict, None) => unit.len() == need,
                    _ => unit.len() >= need,
                };
                length_ok && record.ids.iter().all(|id| bytes_match(id, unit))
            }
            // the window may hold more than one record
            Encoding::Binary => fixed_part(record) <= unit.len() && record.ids.iter().all(|id| bytes_match(id, unit)),
        }
    }

    fn column_matches(&mut self, d: &Dialect, id: &IdMatcher, unit: &[u8]) -> bool {
        let Some(&(s, e)) = self.spans.get(id.position - 1) else { return false };
        self.column.clear();
        unquote_into(&unit[s..e], d, &mut self.column);
        match &id.kind {
            IdKind::Literal(key) => self.column == *key,
            IdKind::Regex(re) => re.is_match(&self.column),
        }
    }
}

fn bytes_match(id: &IdMatcher, unit: &[u8]) -> bool {
    let start = id.position - 1;
    if start > unit.len() {
        return false;
    }
    match &id.kind {
        IdKind::Literal(key) => unit[start..].starts_with(key),
        IdKind::Regex(re) => re.is_match(&unit[start..]),
    }
}

/// Vote counters for one detection pass.
#[derive(Debug)]
pub struct StructureVoter {
    votes: Vec<usize>,
    examined: usize,
    unmatched: usize,
    report_limit: usize,
    matcher: RecordMatcher,
}

impl StructureVoter {
    pub fn new(report_limit: usize) -> Self {
        StructureVoter { votes: Vec::new(), examined: 0, unmatched: 0, report_limit, matcher: RecordMatcher::new() }
    }

    pub fn reset(&mut self, structures: usize) {
        self.votes.clear();
        self.votes.resize(structures, 0);
        self.examined = 0;
        self.unmatched = 0;
    }

    pub fn votes(&self) -> &[usize] {
        &self.votes
    }

    pub fn examined(&self) -> usize {
        self.examined
    }

    /// Test one sample line against every text structure still in the running.
    ///
    /// `file_line` is the 1-based line number within its file; line 1 of a
    /// structure with a header votes without testing.
    pub fn vote_line(&mut self, schema: &Schema, line: &[u8], file_line: u64) -> bool {
        let seen = self.examined;
        self.examined += 1;
        let mut any = false;
        for (i, structure) in schema.structures.iter().enumerate() {
            if structure.is_binary() || self.votes[i] < seen {
                continue;
            }
            let hit = (structure.has_header() && file_line == 1)
                || self.matcher.match_record(structure, line).is_some();
            if hit {
                self.votes[i] += 1;
                any = true;
            }
        }
        if !any {
            self.unmatched += 1;
            if self.unmatched <= self.report_limit {
                warn!(
                    "Sample line {} of length {} does not match any structure",
                    self.examined,
                    line.len()
                );
            }
        }
        any
    }

    /// Test one block against binary structures whose records all carry Ids.
    pub fn vote_block(&mut self, schema: &Schema, block: &[u8]) -> bool {
        self.examined = 1;
        let mut any = false;
        for (i, structure) in schema.structures.iter().enumerate() {
            if !structure.is_binary() || structure.records.iter().any(|r| r.ids.is_empty()) {
                continue;
            }
            if self.matcher.match_record(structure, block).is_some() {
                debug!("Block matches binary structure '{}'", structure.name);
                self.votes[i] = 1;
                any = true;
            }
        }
        any
    }

    /// A structure wins iff it voted for every examined unit.
    pub fn outcome(&self, schema: &Schema) -> Guess {
        if self.examined == 0 {
            return Guess::NoMatch;
        }
        let winners: Vec<usize> = self
            .votes
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v == self.examined)
            .map(|(i, _)| i)
            .collect();
        match winners.as_slice() {
            [] => Guess::NoMatch,
            [one] => Guess::Found(*one),
            many => Guess::Ambiguous(many.iter().map(|&i| schema.structures[i].name.clone()).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::from_json(
            r#"{ "structures": [
              { "name": "people", "type": "fixed", "records": [
                { "name": "p", "fields": [ { "name": "id", "length": 3 }, { "name": "name", "length": 7 } ] } ] },
              { "name": "coded", "type": "fixed", "records": [
                { "name": "a", "ids": [ { "position": 1, "key": "00" } ],
                  "fields": [ { "name": "id", "length": 3 }, { "name": "name", "length": 7 } ] },
                { "name": "b", "ids": [ { "position": 1, "regex": "^[0-9]+" } ],
                  "fields": [ { "name": "id", "length": 3 }, { "name": "name", "length": 7 } ] } ] },
              { "name": "csv", "type": "separated", "header": "first", "records": [
                { "name": "r", "ids": [ { "position": 1, "key": "A" } ],
                  "fields": [ { "name": "k" }, { "name": "v" } ] } ] },
              { "name": "cdr", "type": "binary", "records": [
                { "name": "x", "ids": [ { "position": 1, "key": "\\x01" } ], "fields": [ { "name": "t", "type": "uint8" }, { "name": "n", "type": "uint16_be" } ] } ] }
            ] }"#,
        )
        .expect("schema")
    }

    #[test]
    fn test_strict_fixed_length_votes_exactly_once() {
        let s = schema();
        let mut voter = StructureVoter::new(3);
        voter.reset(s.structures.len());
        voter.vote_line(&s, b"001ALICE  ", 2);
        assert_eq!(voter.votes()[0], 1);
        // both records of "coded" match, still one vote
        assert_eq!(voter.votes()[1], 1);

        voter.reset(s.structures.len());
        voter.vote_line(&s, b"001ALICE ", 2);
        assert_eq!(voter.votes()[0], 0);
        assert_eq!(voter.outcome(&s), Guess::NoMatch);
    }

    #[test]
    fn test_ambiguous_reports_all_names() {
        let s = schema();
        let mut voter = StructureVoter::new(3);
        voter.reset(s.structures.len());
        voter.vote_line(&s, b"001ALICE  ", 2);
        voter.vote_line(&s, b"002BOB    ", 3);
        assert_eq!(voter.outcome(&s), Guess::Ambiguous(vec!["people".to_string(), "coded".to_string()]));
        // a line only "people" accepts settles it
        voter.vote_line(&s, b"X02BOB    ", 4);
        assert_eq!(voter.outcome(&s), Guess::Found(0));
    }

    #[test]
    fn test_header_line_votes_without_testing() {
        let s = schema();
        let mut voter = StructureVoter::new(3);
        voter.reset(s.structures.len());
        voter.vote_line(&s, b"key,value", 1);
        voter.vote_line(&s, b"A,1", 2);
        assert_eq!(voter.outcome(&s), Guess::Found(2));
    }

    #[test]
    fn test_block_vote_requires_ids() {
        let s = schema();
        let mut voter = StructureVoter::new(3);
        voter.reset(s.structures.len());
        assert!(voter.vote_block(&s, &[0x01, 0x00, 0x10, 0x01]));
        assert_eq!(voter.outcome(&s), Guess::Found(3));
        voter.reset(s.structures.len());
        assert!(!voter.vote_block(&s, &[0x02, 0x00, 0x10]));
        // too short for the record
        voter.reset(s.structures.len());
        assert!(!voter.vote_block(&s, &[0x01, 0x00]));
        assert_eq!(voter.outcome(&s), Guess::NoMatch);
    }
}
