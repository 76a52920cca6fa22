//! Directive patterns: literal text, `{{regex}}` blocks and `[[VAR]]`
//! captures, compiled to a small backtracking matcher over one line.
//!
//! The regex subset covers what IR checks need: `.`, character classes,
//! `\` escapes and the `*`, `+`, `?` quantifiers.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
enum Atom {
    Any,
    Char(char),
    Class { ranges: Vec<(char, char)>, negated: bool },
}

impl Atom {
    fn matches(&self, c: char) -> bool {
        match self {
            Atom::Any => true,
            Atom::Char(expected) => *expected == c,
            Atom::Class { ranges, negated } => ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)) != *negated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Rep {
    One,
    Star,
    Plus,
    Opt,
}

impl Rep {
    fn bounds(self) -> (usize, usize) {
        match self {
            Rep::One => (1, 1),
            Rep::Star => (0, usize::MAX),
            Rep::Plus => (1, usize::MAX),
            Rep::Opt => (0, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Atom(Atom, Rep),
    Start(usize),
    End(usize),
    Backref(usize),
}

/// A pattern compiled against the variables bound so far
#[derive(Debug, Clone)]
pub(crate) struct Pattern {
    toks: Vec<Tok>,
    /// Variables defined by this pattern, with their capture slot
    defines: Vec<(String, usize)>,
}

/// A successful match within one line
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Match {
    pub start: usize,
    pub end: usize,
    pub bindings: Vec<(String, String)>,
}

/// Collapse runs of horizontal whitespace to one space
pub(crate) fn canonicalize(line: &str) -> Vec<char> {
    let mut out = Vec::with_capacity(line.len());
    for c in line.trim_end().chars() {
        if c.is_whitespace() {
            if out.last() != Some(&' ') {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl Pattern {
    pub(crate) fn compile(text: &str, vars: &HashMap<String, String>) -> Result<Pattern, String> {
        let chars: Vec<char> = text.trim().chars().collect();
        let mut toks = Vec::new();
        let mut defines: Vec<(String, usize)> = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            if chars[i..].starts_with(&['{', '{']) {
                let close = find(&chars, i + 2, &['}', '}']).ok_or("unterminated {{ regex")?;
                parse_regex(&chars[i + 2..close], &mut toks)?;
                i = close + 2;
            } else if chars[i..].starts_with(&['[', '[']) {
                let close = find(&chars, i + 2, &[']', ']']).ok_or("unterminated [[ variable")?;
                let body: String = chars[i + 2..close].iter().collect();
                match body.split_once(':') {
                    Some((name, regex)) => {
                        check_name(name)?;
                        let slot = defines.len();
                        defines.push((name.to_string(), slot));
                        toks.push(Tok::Start(slot));
                        let regex: Vec<char> = regex.chars().collect();
                        parse_regex(&regex, &mut toks)?;
                        toks.push(Tok::End(slot));
                    }
                    None => {
                        check_name(&body)?;
                        if let Some((_, slot)) = defines.iter().find(|(n, _)| *n == body) {
                            toks.push(Tok::Backref(*slot));
                        } else if let Some(value) = vars.get(&body) {
                            toks.extend(value.chars().map(|c| Tok::Atom(Atom::Char(c), Rep::One)));
                        } else {
                            return Err(format!("undefined variable {body}"));
                        }
                    }
                }
                i = close + 2;
            } else if chars[i].is_whitespace() {
                while i < chars.len() && chars[i].is_whitespace() {
                    i += 1;
                }
                toks.push(Tok::Atom(Atom::Char(' '), Rep::One));
            } else {
                toks.push(Tok::Atom(Atom::Char(chars[i]), Rep::One));
                i += 1;
            }
        }
        if toks.is_empty() {
            return Err("empty pattern".to_string());
        }
        Ok(Pattern { toks, defines })
    }

    /// Leftmost match in `line[from..limit]`
    pub(crate) fn find_in(&self, line: &[char], from: usize, limit: usize) -> Option<Match> {
        let text = &line[..limit.min(line.len())];
        let mut caps = vec![(0, 0); self.defines.len()];
        (from..=text.len()).find_map(|start| {
            let end = match_at(&self.toks, text, start, &mut caps)?;
            let bindings = self
                .defines
                .iter()
                .map(|(name, slot)| {
                    let (s, e) = caps[*slot];
                    (name.clone(), text[s..e].iter().collect())
                })
                .collect();
            Some(Match { start, end, bindings })
        })
    }
}

fn find(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    (from..chars.len()).find(|&i| chars[i..].starts_with(needle))
}

fn check_name(name: &str) -> Result<(), String> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(format!("invalid variable name '{name}'"))
    }
}

fn parse_regex(chars: &[char], toks: &mut Vec<Tok>) -> Result<(), String> {
    let mut i = 0;
    while i < chars.len() {
        let atom = match chars[i] {
            '.' => {
                i += 1;
                Atom::Any
            }
            '\\' => {
                let escaped = *chars.get(i + 1).ok_or("dangling escape")?;
                i += 2;
                match escaped {
                    'd' => Atom::Class {
                        ranges: vec![('0', '9')],
                        negated: false,
                    },
                    's' => Atom::Char(' '),
                    other => Atom::Char(other),
                }
            }
            '[' => {
                let (atom, next) = parse_class(chars, i + 1)?;
                i = next;
                atom
            }
            '*' | '+' | '?' => return Err(format!("quantifier '{}' has nothing to repeat", chars[i])),
            c => {
                i += 1;
                Atom::Char(c)
            }
        };
        let rep = match chars.get(i) {
            Some('*') => Rep::Star,
            Some('+') => Rep::Plus,
            Some('?') => Rep::Opt,
            _ => Rep::One,
        };
        if rep != Rep::One {
            i += 1;
        }
        toks.push(Tok::Atom(atom, rep));
    }
    Ok(())
}

fn parse_class(chars: &[char], mut i: usize) -> Result<(Atom, usize), String> {
    let negated = chars.get(i) == Some(&'^');
    if negated {
        i += 1;
    }
    let mut ranges = Vec::new();
    loop {
        let c = *chars.get(i).ok_or("unterminated character class")?;
        if c == ']' && !ranges.is_empty() {
            return Ok((Atom::Class { ranges, negated }, i + 1));
        }
        let lo = if c == '\\' {
            i += 1;
            *chars.get(i).ok_or("dangling escape")?
        } else {
            c
        };
        i += 1;
        if chars.get(i) == Some(&'-') && chars.get(i + 1).is_some_and(|c| *c != ']') {
            ranges.push((lo, chars[i + 1]));
            i += 2;
        } else {
            ranges.push((lo, lo));
        }
    }
}

fn match_at(toks: &[Tok], text: &[char], pos: usize, caps: &mut Vec<(usize, usize)>) -> Option<usize> {
    let Some((tok, rest)) = toks.split_first() else {
        return Some(pos);
    };
    match tok {
        Tok::Start(slot) => {
            let saved = caps[*slot];
            caps[*slot].0 = pos;
            let result = match_at(rest, text, pos, caps);
            if result.is_none() {
                caps[*slot] = saved;
            }
            result
        }
        Tok::End(slot) => {
            let saved = caps[*slot];
            caps[*slot].1 = pos;
            let result = match_at(rest, text, pos, caps);
            if result.is_none() {
                caps[*slot] = saved;
            }
            result
        }
        Tok::Backref(slot) => {
            let (s, e) = caps[*slot];
            let captured = &text[s..e];
            if text[pos..].starts_with(captured) {
                match_at(rest, text, pos + captured.len(), caps)
            } else {
                None
            }
        }
        Tok::Atom(atom, rep) => {
            let (min, max) = rep.bounds();
            let available = text[pos..].iter().take(max).take_while(|c| atom.matches(**c)).count();
            (min..=available)
                .rev()
                .find_map(|n| match_at(rest, text, pos + n, caps))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> Vec<char> {
        canonicalize(s)
    }

    fn first(pattern: &str, input: &str) -> Option<Match> {
        let p = Pattern::compile(pattern, &HashMap::new()).unwrap();
        let l = line(input);
        p.find_in(&l, 0, l.len())
    }

    #[test]
    fn test_literal_substring() {
        let m = first("load [copy]", "  %4 = load [copy] %3 : $*Int").unwrap();
        assert_eq!(m.start, 6);
    }

    #[test]
    fn test_whitespace_is_canonical() {
        assert!(first("begin_access   [modify]", "%5 = begin_access [modify]    [dynamic] %2").is_some());
    }

    #[test]
    fn test_capture_backtracks_to_fit() {
        let m = first("[[ADDR:%.*]] = begin_access", "  %7 = begin_access [read] [static] %1").unwrap();
        assert_eq!(m.bindings, vec![("ADDR".to_string(), "%7".to_string())]);
    }

    #[test]
    fn test_same_line_backref() {
        assert!(first("[[X:%[0-9]+]] = copy_value [[X]]", "%3 = copy_value %3").is_some());
        assert!(first("[[X:%[0-9]+]] = copy_value [[X]]", "%3 = copy_value %4").is_none());
    }

    #[test]
    fn test_known_variable_is_substituted() {
        let mut vars = HashMap::new();
        vars.insert("BOX".to_string(), "%2".to_string());
        let p = Pattern::compile("project_box [[BOX]]", &vars).unwrap();
        let l = line("%3 = project_box %2 : ${ var Int }");
        assert!(p.find_in(&l, 0, l.len()).is_some());
        let l = line("%3 = project_box %20 : ${ var Int }");
        assert!(p.find_in(&l, 0, l.len()).is_some_and(|m| m.end == 19));
    }

    #[test]
    fn test_regex_block() {
        assert!(first("function_ref @{{.*}}Addressor", "%0 = function_ref @Foo.a.unsafeMutableAddressor").is_some());
        assert!(first("integer_literal $Int, {{[0-9]+}}", "%1 = integer_literal $Int, 5").is_some());
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        assert!(Pattern::compile("[[NOPE]]", &HashMap::new()).is_err());
        assert!(Pattern::compile("[[1BAD:.*]]", &HashMap::new()).is_err());
    }

    #[test]
    fn test_limit_restricts_search() {
        let p = Pattern::compile("dealloc_stack", &HashMap::new()).unwrap();
        let l = line("end_access %5 ; dealloc_stack %1");
        assert!(p.find_in(&l, 0, 10).is_none());
        assert!(p.find_in(&l, 0, l.len()).is_some());
    }
}
