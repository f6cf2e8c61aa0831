use super::types::{Direction, HostVariableRef, StatementKind, VarShape};
use regex::{Captures, Regex};
use std::ops::Range;
use std::sync::LazyLock;

static INTO_CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bINTO\b(.*?)(?:\bFROM\b|\bWHERE\b|;|$)").expect("valid regex")
});

struct ShapeMatcher {
    shape: VarShape,
    pattern: Regex,
}

/// Finds `:host` references of every shape inside one SQL statement.
pub struct HostVarExtractor {
    // Precedence order: longer composite shapes first.
    matchers: Vec<ShapeMatcher>,
}

impl Default for HostVarExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostVarExtractor {
    pub fn new() -> Self {
        let table = [
            // :rec.field:ind  or  :rec.field INDICATOR :ind
            (
                VarShape::StructIndicator,
                r"(?i):(\w+)\.(\w+)(?:\s+INDICATOR\s*)?:(\w+)",
            ),
            // :arr[i]:ind
            (
                VarShape::ArrayIndicator,
                r"(?i):(\w+)\[([^\]]+)\](?:\s+INDICATOR\s*)?:(\w+)",
            ),
            (VarShape::Array, r":(\w+)\[([^\]]+)\]"),
            (VarShape::Struct, r":(\w+)\.(\w+)"),
            (VarShape::Indicator, r"(?i):(\w+)(?:\s+INDICATOR\s*)?:(\w+)"),
            (VarShape::Basic, r":(\w+)"),
        ];
        let matchers = table
            .into_iter()
            .map(|(shape, pattern)| ShapeMatcher {
                shape,
                pattern: Regex::new(pattern).expect("valid regex"),
            })
            .collect();
        Self { matchers }
    }

    /// All accepted references in `text`, ordered by position, never overlapping.
    pub fn extract_all(&self, text: &str) -> Vec<HostVariableRef> {
        let masked = masked_ranges(text);
        let mut candidates = Vec::new();

        for matcher in &self.matchers {
            for caps in matcher.pattern.captures_iter(text) {
                let Some(whole) = caps.get(0) else { continue };
                if !starts_reference(text, whole.start()) || inside(&masked, whole.start()) {
                    continue;
                }
                candidates.push(build_ref(matcher.shape, &caps));
            }
        }

        resolve_overlaps(candidates)
    }

    /// Splits references into `(inputs, outputs)` by their position relative to
    /// the `INTO` clause. Only select-family kinds have outputs.
    pub fn classify_by_direction(
        &self,
        text: &str,
        kind: StatementKind,
    ) -> (Vec<HostVariableRef>, Vec<HostVariableRef>) {
        let refs = self.extract_all(text);
        let into = if kind.has_output_into() {
            into_clause_span(text)
        } else {
            None
        };

        refs.into_iter()
            .partition(|r| direction_of(r, into.as_ref()) == Direction::Input)
    }
}

/// Byte range of the variable list between `INTO` and the next `FROM`/`WHERE`/end.
pub fn into_clause_span(text: &str) -> Option<Range<usize>> {
    into_clause(text).map(|(_, vars)| vars)
}

/// Byte range of the whole clause, from the `INTO` keyword to the end of its variable list.
pub fn into_clause_range(text: &str) -> Option<Range<usize>> {
    into_clause(text).map(|(keyword, vars)| keyword..vars.end)
}

fn into_clause(text: &str) -> Option<(usize, Range<usize>)> {
    let masked = masked_ranges(text);
    INTO_CLAUSE_RE
        .captures_iter(text)
        .filter_map(|caps| Some((caps.get(0)?.start(), caps.get(1)?.range())))
        .find(|(keyword, _)| !inside(&masked, *keyword))
}

fn direction_of(var: &HostVariableRef, into: Option<&Range<usize>>) -> Direction {
    match into {
        Some(span) if span.contains(&var.span.start) => Direction::Output,
        _ => Direction::Input,
    }
}

fn build_ref(shape: VarShape, caps: &Captures) -> HostVariableRef {
    let group = |i: usize| caps.get(i).map(|m| m.as_str().to_string());
    let whole = caps.get(0).map_or(0..0, |m| m.range());
    let raw_text = caps.get(0).map_or_else(String::new, |m| m.as_str().to_string());
    let var_name = group(1).unwrap_or_default();

    let (field_name, array_index, indicator_name) = match shape {
        VarShape::Basic => (None, None, None),
        VarShape::Struct => (group(2), None, None),
        VarShape::Array => (None, group(2).map(|s| s.trim().to_string()), None),
        VarShape::Indicator => (None, None, group(2)),
        VarShape::StructIndicator => (group(2), None, group(3)),
        VarShape::ArrayIndicator => (None, group(2).map(|s| s.trim().to_string()), group(3)),
    };

    HostVariableRef {
        shape,
        var_name,
        field_name,
        array_index,
        indicator_name,
        raw_text,
        span: whole,
    }
}

/// Sort by start (stable, so precedence order breaks ties) and keep the longer
/// of any two overlapping matches. Equal lengths keep the earlier one.
fn resolve_overlaps(mut candidates: Vec<HostVariableRef>) -> Vec<HostVariableRef> {
    candidates.sort_by_key(|c| c.span.start);
    let mut kept: Vec<HostVariableRef> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        match kept.last_mut() {
            Some(last) if candidate.span.start < last.span.end => {
                if candidate.span_len() > last.span_len() {
                    *last = candidate;
                }
            }
            _ => kept.push(candidate),
        }
    }

    kept
}

/// A `:` right after another `:` is the second half of a `::` cast. Keywords
/// glued to a reference (`INTO:out`) still count; indicator tails lose to the
/// longer indicator match during overlap resolution.
fn starts_reference(text: &str, colon: usize) -> bool {
    text[..colon].chars().next_back() != Some(':')
}

fn inside(ranges: &[Range<usize>], offset: usize) -> bool {
    ranges.iter().any(|r| r.contains(&offset))
}

/// Single-quoted SQL literals and SQL comments, where `:` is just text
/// (`TO_CHAR(d, 'HH24:MI:SS')`).
fn masked_ranges(text: &str) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut ranges = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                let start = i;
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\'' {
                        if bytes.get(i + 1) == Some(&b'\'') {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i = (i + 1).min(bytes.len());
                ranges.push(start..i);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let start = i;
                i = text[i + 2..]
                    .find("*/")
                    .map_or(bytes.len(), |p| i + 2 + p + 2);
                ranges.push(start..i);
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let start = i;
                i = text[i..].find('\n').map_or(bytes.len(), |p| i + p);
                ranges.push(start..i);
            }
            _ => i += 1,
        }
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(refs: &[HostVariableRef]) -> Vec<&str> {
        refs.iter().map(|r| r.var_name.as_str()).collect()
    }

    #[test]
    fn test_struct_indicator_is_single_reference() {
        let extractor = HostVarExtractor::new();
        let refs = extractor.extract_all("UPDATE t SET a = :a.b:c WHERE k = 1");
        assert_eq!(refs.len(), 1, "got {refs:?}");
        let r = &refs[0];
        assert_eq!(r.shape, VarShape::StructIndicator);
        assert_eq!(r.var_name, "a");
        assert_eq!(r.field_name.as_deref(), Some("b"));
        assert_eq!(r.indicator_name.as_deref(), Some("c"));
        assert_eq!(r.raw_text, ":a.b:c");
    }

    #[test]
    fn test_all_shapes() {
        let extractor = HostVarExtractor::new();
        let text = "VALUES (:id, :arr[i], :emp.name, :sal:sal_ind, :rows[2]:ind, :u.x:ux)";
        let refs = extractor.extract_all(text);
        let shapes: Vec<VarShape> = refs.iter().map(|r| r.shape).collect();
        assert_eq!(
            shapes,
            vec![
                VarShape::Basic,
                VarShape::Array,
                VarShape::Struct,
                VarShape::Indicator,
                VarShape::ArrayIndicator,
                VarShape::StructIndicator,
            ]
        );
        assert_eq!(refs[1].array_index.as_deref(), Some("i"));
        assert_eq!(refs[4].array_index.as_deref(), Some("2"));
        assert_eq!(refs[4].indicator_name.as_deref(), Some("ind"));
        for r in &refs {
            assert_eq!(&text[r.span.clone()], r.raw_text);
        }
    }

    #[test]
    fn test_indicator_keyword() {
        let extractor = HostVarExtractor::new();
        let refs = extractor.extract_all("SELECT a INTO :v INDICATOR :v_ind FROM t");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].shape, VarShape::Indicator);
        assert_eq!(refs[0].indicator_name.as_deref(), Some("v_ind"));
    }

    #[test]
    fn test_literals_and_casts_are_not_references() {
        let extractor = HostVarExtractor::new();
        let text = "SELECT TO_CHAR(d, 'HH24:MI:SS'), x::int INTO :out FROM t -- :nope\n WHERE y = :in";
        let refs = extractor.extract_all(text);
        assert_eq!(names(&refs), vec!["out", "in"]);
    }

    #[test]
    fn test_direction_round_trip() {
        let extractor = HostVarExtractor::new();
        let (inputs, outputs) = extractor
            .classify_by_direction("SELECT x INTO :out FROM t WHERE y = :in", StatementKind::Select);
        assert_eq!(names(&outputs), vec!["out"]);
        assert_eq!(names(&inputs), vec!["in"]);
    }

    #[test]
    fn test_reference_glued_to_keyword() {
        let extractor = HostVarExtractor::new();
        let (inputs, outputs) = extractor
            .classify_by_direction("SELECT x INTO:out FROM t WHERE y=:in", StatementKind::Select);
        assert_eq!(names(&outputs), vec!["out"]);
        assert_eq!(names(&inputs), vec!["in"]);

        let refs = extractor.extract_all("VALUES(:a:a_ind,:b)");
        assert_eq!(names(&refs), vec!["a", "b"]);
        assert_eq!(refs[0].shape, VarShape::Indicator);
    }

    #[test]
    fn test_fetch_outputs_run_to_end() {
        let extractor = HostVarExtractor::new();
        let (inputs, outputs) =
            extractor.classify_by_direction("FETCH c1 INTO :a, :b:b_ind", StatementKind::FetchInto);
        assert!(inputs.is_empty());
        assert_eq!(names(&outputs), vec!["a", "b"]);
    }

    #[test]
    fn test_non_select_kinds_are_all_input() {
        let extractor = HostVarExtractor::new();
        let (inputs, outputs) = extractor
            .classify_by_direction("INSERT INTO t (a, b) VALUES (:a, :b)", StatementKind::Insert);
        assert!(outputs.is_empty());
        assert_eq!(names(&inputs), vec!["a", "b"]);
    }

    #[test]
    fn test_equal_length_overlap_keeps_first() {
        let a = HostVariableRef {
            shape: VarShape::Struct,
            var_name: "a".into(),
            field_name: Some("b".into()),
            array_index: None,
            indicator_name: None,
            raw_text: ":a.b".into(),
            span: 0..4,
        };
        let b = HostVariableRef {
            shape: VarShape::Indicator,
            var_name: "a".into(),
            field_name: None,
            array_index: None,
            indicator_name: Some("b".into()),
            raw_text: ":a:b".into(),
            span: 0..4,
        };
        let kept = resolve_overlaps(vec![a.clone(), b]);
        assert_eq!(kept, vec![a]);
    }
}
