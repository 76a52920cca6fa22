//! FileCheck-style assertions over printed IR
//!
//! A check file is scanned for directives carrying a prefix (default
//! `CHECK`):
//!
//! | Directive        | Meaning                                              |
//! |------------------|------------------------------------------------------|
//! | `CHECK:`         | pattern occurs after the previous match              |
//! | `CHECK-NEXT:`    | pattern occurs on the line after the previous match  |
//! | `CHECK-SAME:`    | pattern occurs later on the previous match's line    |
//! | `CHECK-NOT:`     | pattern does not occur between the surrounding matches |
//! | `CHECK-LABEL:`   | splits the input into independently checked blocks   |
//!
//! Patterns are literal text with `{{regex}}` blocks, `[[NAME:regex]]`
//! definitions and `[[NAME]]` uses. Runs of whitespace compare equal.

mod pattern;

use pattern::{canonicalize, Match, Pattern};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Check,
    Next,
    Same,
    Not,
    Label,
}

impl DirectiveKind {
    fn suffix(self) -> &'static str {
        match self {
            DirectiveKind::Check => "",
            DirectiveKind::Next => "-NEXT",
            DirectiveKind::Same => "-SAME",
            DirectiveKind::Not => "-NOT",
            DirectiveKind::Label => "-LABEL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub pattern: String,
    /// 1-based line in the check file
    pub line: usize,
}

/// Check failure, with 1-based line numbers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("no {prefix}: directives found")]
    NoDirectives { prefix: String },

    #[error("check line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("check line {line}: {directive}: expected string not found in input\n  pattern: {pattern}")]
    NotFound {
        line: usize,
        directive: String,
        pattern: String,
    },

    #[error(
        "check line {line}: {directive}: not on the expected line (input line {expected})\n  pattern: {pattern}"
    )]
    WrongLine {
        line: usize,
        directive: String,
        pattern: String,
        expected: usize,
    },

    #[error("check line {line}: {directive}: excluded string found at input line {input_line}\n  pattern: {pattern}")]
    Excluded {
        line: usize,
        directive: String,
        pattern: String,
        input_line: usize,
    },
}

/// Position in the canonicalized input
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Pos {
    line: usize,
    col: usize,
}

/// A parsed check file
#[derive(Debug, Clone)]
pub struct FileCheck {
    prefix: String,
    directives: Vec<Directive>,
}

impl FileCheck {
    pub fn parse(checks: &str) -> Result<FileCheck, CheckError> {
        FileCheck::with_prefix(checks, "CHECK")
    }

    pub fn with_prefix(checks: &str, prefix: &str) -> Result<FileCheck, CheckError> {
        let mut directives = Vec::new();
        for (index, text) in checks.lines().enumerate() {
            if let Some((kind, pattern)) = find_directive(text, prefix) {
                directives.push(Directive {
                    kind,
                    pattern: pattern.trim().to_string(),
                    line: index + 1,
                });
            }
        }
        if directives.is_empty() {
            return Err(CheckError::NoDirectives {
                prefix: prefix.to_string(),
            });
        }
        if let Some(first) = directives.first().filter(|d| matches!(d.kind, DirectiveKind::Next | DirectiveKind::Same)) {
            return Err(CheckError::Syntax {
                line: first.line,
                message: format!("{prefix}{} cannot be the first directive", first.kind.suffix()),
            });
        }
        Ok(FileCheck {
            prefix: prefix.to_string(),
            directives,
        })
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Match every directive against `input`
    pub fn check(&self, input: &str) -> Result<(), CheckError> {
        let lines: Vec<Vec<char>> = input.lines().map(canonicalize).collect();
        let mut run = Run {
            check: self,
            lines: &lines,
            vars: HashMap::new(),
        };

        let mut groups: Vec<(Option<&Directive>, Vec<&Directive>)> = vec![(None, Vec::new())];
        for directive in &self.directives {
            if directive.kind == DirectiveKind::Label {
                groups.push((Some(directive), Vec::new()));
            } else if let Some((_, body)) = groups.last_mut() {
                body.push(directive);
            }
        }

        // Labels are located first, in order, so a missing CHECK in one
        // function cannot consume the text of the next.
        let mut starts = Vec::with_capacity(groups.len());
        let mut search = Pos { line: 0, col: 0 };
        for (label, _) in &groups {
            match label {
                None => starts.push(None),
                Some(label) => {
                    let (line, found) = run.search(label, search, lines.len())?;
                    run.bind(&found);
                    let pos = Pos { line, col: found.end };
                    starts.push(Some(pos));
                    search = Pos { line: line + 1, col: 0 };
                }
            }
        }

        for (index, (_, body)) in groups.iter().enumerate() {
            let start = starts[index];
            let end = starts[index + 1..]
                .iter()
                .flatten()
                .next()
                .map_or(lines.len(), |pos| pos.line);
            run.check_group(body, start, end)?;
        }
        Ok(())
    }

    fn name(&self, kind: DirectiveKind) -> String {
        format!("{}{}", self.prefix, kind.suffix())
    }
}

/// Check `input` against the `CHECK` directives in `checks`
pub fn check(checks: &str, input: &str) -> Result<(), CheckError> {
    FileCheck::parse(checks)?.check(input)
}

fn find_directive<'a>(text: &'a str, prefix: &str) -> Option<(DirectiveKind, &'a str)> {
    let mut offset = 0;
    while let Some(found) = text[offset..].find(prefix) {
        let at = offset + found;
        offset = at + prefix.len();
        let boundary = text[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_' || c == '-'));
        if !boundary {
            continue;
        }
        let rest = &text[offset..];
        let kinds = [
            (":", DirectiveKind::Check),
            ("-NEXT:", DirectiveKind::Next),
            ("-SAME:", DirectiveKind::Same),
            ("-NOT:", DirectiveKind::Not),
            ("-LABEL:", DirectiveKind::Label),
        ];
        if let Some((marker, kind)) = kinds.iter().find(|(marker, _)| rest.starts_with(marker)) {
            return Some((*kind, &rest[marker.len()..]));
        }
    }
    None
}

struct Run<'a> {
    check: &'a FileCheck,
    lines: &'a [Vec<char>],
    vars: HashMap<String, String>,
}

impl Run<'_> {
    fn compile(&self, directive: &Directive) -> Result<Pattern, CheckError> {
        Pattern::compile(&directive.pattern, &self.vars).map_err(|message| CheckError::Syntax {
            line: directive.line,
            message,
        })
    }

    fn bind(&mut self, found: &Match) {
        for (name, value) in &found.bindings {
            self.vars.insert(name.clone(), value.clone());
        }
    }

    fn not_found(&self, directive: &Directive) -> CheckError {
        CheckError::NotFound {
            line: directive.line,
            directive: self.check.name(directive.kind),
            pattern: directive.pattern.clone(),
        }
    }

    /// First match at or after `from`, before line `end`
    fn search(&self, directive: &Directive, from: Pos, end: usize) -> Result<(usize, Match), CheckError> {
        let pattern = self.compile(directive)?;
        (from.line..end.min(self.lines.len()))
            .find_map(|line| {
                let text = &self.lines[line];
                let col = if line == from.line { from.col } else { 0 };
                pattern.find_in(text, col.min(text.len()), text.len()).map(|m| (line, m))
            })
            .ok_or_else(|| self.not_found(directive))
    }

    fn check_group(&mut self, body: &[&Directive], start: Option<Pos>, end: usize) -> Result<(), CheckError> {
        let mut cursor = start.unwrap_or(Pos { line: 0, col: 0 });
        let mut last_line = start.map(|pos| pos.line);
        let mut pending_not: Vec<&Directive> = Vec::new();

        for directive in body {
            let (line, found) = match directive.kind {
                DirectiveKind::Not => {
                    pending_not.push(directive);
                    continue;
                }
                DirectiveKind::Check | DirectiveKind::Label => self.search(directive, cursor, end)?,
                DirectiveKind::Next => {
                    let expected = last_line.map_or(0, |l| l + 1);
                    let (line, found) = self.search(directive, cursor, end)?;
                    if line != expected {
                        return Err(self.wrong_line(directive, expected));
                    }
                    (line, found)
                }
                DirectiveKind::Same => {
                    let expected = last_line.unwrap_or(0);
                    let pattern = self.compile(directive)?;
                    let text = self.lines.get(expected).ok_or_else(|| self.not_found(directive))?;
                    let col = if cursor.line == expected { cursor.col } else { text.len() };
                    let found = pattern
                        .find_in(text, col.min(text.len()), text.len())
                        .ok_or_else(|| self.wrong_line(directive, expected))?;
                    (expected, found)
                }
            };
            let next = Pos { line, col: found.start };
            self.check_excluded(&pending_not, cursor, next)?;
            pending_not.clear();
            self.bind(&found);
            cursor = Pos { line, col: found.end };
            last_line = Some(line);
        }

        let end_pos = Pos { line: end, col: 0 };
        self.check_excluded(&pending_not, cursor, end_pos)
    }

    fn wrong_line(&self, directive: &Directive, expected: usize) -> CheckError {
        CheckError::WrongLine {
            line: directive.line,
            directive: self.check.name(directive.kind),
            pattern: directive.pattern.clone(),
            expected: expected + 1,
        }
    }

    /// Fail if any `CHECK-NOT` pattern occurs in `[from, to)`
    fn check_excluded(&self, nots: &[&Directive], from: Pos, to: Pos) -> Result<(), CheckError> {
        for directive in nots {
            let pattern = self.compile(directive)?;
            let last = to.line.min(self.lines.len().saturating_sub(1));
            for line in from.line..=last {
                let Some(text) = self.lines.get(line) else {
                    break;
                };
                let col = if line == from.line { from.col.min(text.len()) } else { 0 };
                let limit = if line == to.line { to.col } else { text.len() };
                if col > limit {
                    continue;
                }
                if pattern.find_in(text, col, limit).is_some() {
                    return Err(CheckError::Excluded {
                        line: directive.line,
                        directive: self.check.name(directive.kind),
                        pattern: directive.pattern.clone(),
                        input_line: line + 1,
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IR: &str = "\
sil @f : $@convention(thin) () -> () {
bb0:
  %0 = alloc_stack $Int
  %1 = integer_literal $Int, 5
  store %1 to [trivial] %0 : $*Int
  dealloc_stack %0 : $*Int
  %4 = tuple ()
  return %4 : $()
}

sil @g : $@convention(thin) () -> () {
bb0:
  %0 = tuple ()
  return %0 : $()
}
";

    #[test]
    fn test_check_and_next_with_captures() {
        let checks = "\
// CHECK-LABEL: sil @f
// CHECK: [[SLOT:%.*]] = alloc_stack $Int
// CHECK-NEXT: [[ONE:%.*]] = integer_literal $Int, 5
// CHECK-NEXT: store [[ONE]] to [trivial] [[SLOT]]
// CHECK: dealloc_stack [[SLOT]]
";
        check(checks, IR).unwrap();
    }

    #[test]
    fn test_next_must_be_adjacent() {
        let checks = "\
// CHECK: alloc_stack
// CHECK-NEXT: store
";
        let err = check(checks, IR).unwrap_err();
        assert!(matches!(err, CheckError::WrongLine { line: 2, .. }), "{err}");
    }

    #[test]
    fn test_not_between_matches() {
        let ok = "\
// CHECK-LABEL: sil @g
// CHECK-NOT: alloc_stack
// CHECK: return
";
        check(ok, IR).unwrap();

        let bad = "\
// CHECK-LABEL: sil @f
// CHECK-NOT: integer_literal
// CHECK: dealloc_stack
";
        let err = check(bad, IR).unwrap_err();
        assert!(matches!(err, CheckError::Excluded { input_line: 4, .. }), "{err}");
    }

    #[test]
    fn test_labels_confine_checks() {
        // `alloc_stack` only appears in @f, so it must not be found after @g's label
        let checks = "\
// CHECK-LABEL: sil @g
// CHECK: alloc_stack
";
        assert!(matches!(check(checks, IR), Err(CheckError::NotFound { .. })));

        let checks = "\
// CHECK-LABEL: sil @f
// CHECK: return
// CHECK-LABEL: sil @g
// CHECK: tuple ()
";
        check(checks, IR).unwrap();
    }

    #[test]
    fn test_same_line() {
        let checks = "\
// CHECK: store
// CHECK-SAME: [trivial]
";
        check(checks, IR).unwrap();
    }

    #[test]
    fn test_custom_prefix_and_missing_directives() {
        let checks = "// OPT: integer_literal $Int, 5\n// CHECK: nothing like this";
        FileCheck::with_prefix(checks, "OPT").unwrap().check(IR).unwrap();
        assert!(matches!(
            FileCheck::with_prefix(checks, "NONE"),
            Err(CheckError::NoDirectives { .. })
        ));
    }

    #[test]
    fn test_prefix_must_start_a_word() {
        assert!(find_directive("// XCHECK: foo", "CHECK").is_none());
        assert_eq!(
            find_directive("// CHECK-NEXT: foo", "CHECK"),
            Some((DirectiveKind::Next, " foo"))
        );
    }
}
