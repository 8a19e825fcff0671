// expression.rs: record selection by conditions on decoded field values
use log::debug;
use memchr::memmem;
use regex::bytes::{Regex, RegexBuilder};
use std::fs;

use crate::context::RecordView;
use crate::error::{FfeError, Result};
use crate::schema::Structure;

/// Comparison applied between a field's text and the condition's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `field=value`
    Equal,
    /// `field!value` or `field!=value`
    NotEqual,
    /// `field^value`, the text starts with the value.
    StartsWith,
    /// `field~value`, the text contains the value.
    Contains,
    /// `field?regex`
    Regex,
}

impl Operator {
    fn symbol(self) -> u8 {
        match self {
            Operator::Equal => b'=',
            Operator::NotEqual => b'!',
            Operator::StartsWith => b'^',
            Operator::Contains => b'~',
            Operator::Regex => b'?',
        }
    }
}

// an operator character found earlier in this list wins
const OPERATOR_ORDER: [Operator; 5] =
    [Operator::Regex, Operator::Equal, Operator::StartsWith, Operator::Contains, Operator::NotEqual];

/// One field, one operator and every value given for that pair.
///
/// The condition holds when any of its values matches.
#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    values: Vec<Vec<u8>>,
    regexes: Vec<Regex>,
}

impl Condition {
    fn holds(&self, text: &[u8], case_insensitive: bool) -> bool {
        let eq = |v: &[u8], t: &[u8]| if case_insensitive { v.eq_ignore_ascii_case(t) } else { v == t };
        match self.op {
            Operator::Equal => self.values.iter().any(|v| eq(v, text)),
            Operator::NotEqual => !self.values.iter().any(|v| eq(v, text)),
            Operator::StartsWith => self
                .values
                .iter()
                .any(|v| text.len() >= v.len() && eq(v, &text[..v.len()])),
            Operator::Contains => {
                if case_insensitive {
                    let hay = text.to_ascii_lowercase();
                    self.values.iter().any(|v| memmem::find(&hay, &v.to_ascii_lowercase()).is_some())
                } else {
                    self.values.iter().any(|v| memmem::find(text, v).is_some())
                }
            }
            Operator::Regex => self.regexes.iter().any(|r| r.is_match(text)),
        }
    }
}

/// Split `expr` into field, operator and value.
fn split_expression(expr: &str) -> Result<(&str, Operator, &str)> {
    let bytes = expr.as_bytes();
    let found = OPERATOR_ORDER
        .iter()
        .find_map(|&op| memchr::memchr(op.symbol(), bytes).map(|at| (op, at)));
    let Some((mut op, at)) = found else {
        return Err(FfeError::Parse {
            what: "expression",
            reason: format!("Expression must contain an operator: =,^,~,? or !: {}", expr),
        });
    };
    let mut field = &expr[..at];
    if op == Operator::Equal && field.ends_with('!') {
        op = Operator::NotEqual;
        field = &field[..field.len() - 1];
    }
    if field.is_empty() {
        return Err(FfeError::Parse { what: "expression", reason: format!("Expression has no field name: {}", expr) });
    }
    Ok((field, op, &expr[at + 1..]))
}

/// Values of a `file:` operand, one per non-empty line.
fn read_values(path: &str) -> Result<Vec<Vec<u8>>> {
    let data = fs::read(path)?;
    Ok(data
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.to_vec())
        .collect())
}

/// A set of conditions deciding which records are passed to the renderer.
#[derive(Debug, Clone)]
pub struct Selection {
    conditions: Vec<Condition>,
    all: bool,
    invert: bool,
    case_insensitive: bool,
}

impl Selection {
    /// Build a selection from expressions such as `name=ALICE` or `msisdn^358`.
    ///
    /// Expressions with the same field (case-insensitively) and operator merge into
    /// one condition. A value of `file:PATH` reads the values from PATH. Conditions
    /// are or'ed unless `all` is set; `invert` negates the outcome.
    pub fn new<S: AsRef<str>>(expressions: &[S], all: bool, invert: bool, case_insensitive: bool) -> Result<Self> {
        let mut conditions: Vec<Condition> = Vec::new();
        for expr in expressions {
            let (field, op, operand) = split_expression(expr.as_ref())?;
            let values = match operand.strip_prefix("file:") {
                Some(path) => read_values(path)?,
                None => vec![operand.as_bytes().to_vec()],
            };
            let idx = match conditions.iter().position(|c| c.op == op && c.field.eq_ignore_ascii_case(field)) {
                Some(i) => i,
                None => {
                    conditions.push(Condition { field: field.to_string(), op, values: Vec::new(), regexes: Vec::new() });
                    conditions.len() - 1
                }
            };
            let cond = &mut conditions[idx];
            if op == Operator::Regex {
                for v in &values {
                    let pattern = String::from_utf8_lossy(v);
                    cond.regexes.push(RegexBuilder::new(&pattern).case_insensitive(case_insensitive).build()?);
                }
            }
            cond.values.extend(values);
        }
        debug!("Selection with {} conditions", conditions.len());
        Ok(Selection { conditions, all, invert, case_insensitive })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Fail when a condition names a field no record of `structure` carries.
    pub fn check_fields(&self, structure: &Structure, header_names: &[String]) -> Result<()> {
        for cond in &self.conditions {
            let known = structure.records.iter().flat_map(|r| r.fields.iter()).any(|f| {
                let name = match (&f.name, f.position()) {
                    (Some(n), _) => Some(n.as_str()),
                    (None, Some(p)) => header_names.get(p - 1).map(String::as_str),
                    (None, None) => None,
                };
                name.is_some_and(|n| n.eq_ignore_ascii_case(&cond.field))
            });
            if !known {
                return Err(FfeError::UnknownField(cond.field.clone()));
            }
        }
        Ok(())
    }

    /// Whether the record is selected. An empty selection selects everything.
    ///
    /// Absent fields compare as empty text. A condition on a field the record does
    /// not carry is false.
    pub fn matches(&self, view: &RecordView<'_>) -> Result<bool> {
        if self.conditions.is_empty() {
            return Ok(true);
        }
        let mut hits = 0usize;
        for cond in &self.conditions {
            let idx = (0..view.field_count())
                .find(|&i| view.field_info(i).and_then(|f| f.name).is_some_and(|n| n.eq_ignore_ascii_case(&cond.field)));
            let holds = match idx {
                Some(i) => {
                    let text = view.field_text(i)?.unwrap_or_default();
                    cond.holds(&text, self.case_insensitive)
                }
                None => false,
            };
            if holds {
                hits += 1;
                if !self.all {
                    break;
                }
            } else if self.all {
                break;
            }
        }
        let selected = if self.all { hits == self.conditions.len() } else { hits > 0 };
        Ok(selected != self.invert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(expr: &str, ci: bool) -> Condition {
        Selection::new(&[expr], false, false, ci).unwrap().conditions[0].clone()
    }

    #[test]
    fn test_operator_precedence_and_not_equal_forms() {
        assert_eq!(split_expression("name=a^b").unwrap(), ("name", Operator::Equal, "a^b"));
        assert_eq!(split_expression("id?^[0-9]=").unwrap(), ("id", Operator::Regex, "^[0-9]="));
        assert_eq!(split_expression("id!7").unwrap(), ("id", Operator::NotEqual, "7"));
        assert_eq!(split_expression("id!=7").unwrap(), ("id", Operator::NotEqual, "7"));
        assert_eq!(split_expression("msisdn^358").unwrap(), ("msisdn", Operator::StartsWith, "358"));
        assert!(matches!(split_expression("plain"), Err(FfeError::Parse { .. })));
        assert!(matches!(split_expression("=x"), Err(FfeError::Parse { .. })));
    }

    #[test]
    fn test_condition_operators() {
        assert!(cond("f=abc", false).holds(b"abc", false));
        assert!(!cond("f=abc", false).holds(b"ABC", false));
        assert!(cond("f=abc", true).holds(b"ABC", true));
        assert!(cond("f!abc", false).holds(b"abd", false));
        assert!(!cond("f!abc", false).holds(b"abc", false));
        assert!(cond("f^35", false).holds(b"358401", false));
        assert!(!cond("f^35", false).holds(b"3", false));
        assert!(cond("f~LIC", true).holds(b"alice", true));
        assert!(!cond("f~LIC", false).holds(b"alice", false));
        assert!(cond("f?^[a-c]+$", false).holds(b"cab", false));
        assert!(cond("f?^X", true).holds(b"xyz", true));
    }

    #[test]
    fn test_same_field_and_operator_merge_values() {
        let s = Selection::new(&["Name=a", "name=b", "name~c"], false, false, false).unwrap();
        assert_eq!(s.conditions().len(), 2);
        assert!(s.conditions()[0].holds(b"b", false));
    }

    #[test]
    fn test_values_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut f, b"001\n\n003\n").unwrap();
        let expr = format!("id=file:{}", f.path().to_str().unwrap());
        let c = cond(&expr, false);
        assert!(c.holds(b"003", false));
        assert!(!c.holds(b"", false));
        assert!(!c.holds(b"002", false));
    }

    #[test]
    fn test_invalid_regex_is_an_error() {
        assert!(matches!(Selection::new(&["f?("], false, false, false), Err(FfeError::Regex(_))));
    }
}
