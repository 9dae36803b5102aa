use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// End of a rule definition.
    End,
    /// Start of an alternate definition for the same rule.
    Alt,
    RuleRef,
    Char,
    /// Inverse char(s) (`[^a]`, `[^a-b]`, `[^abc]`).
    CharNot,
    /// Upper bound of a range started by the preceding `Char`/`CharNot`.
    CharRngUpper,
    /// Additional char or range in a class (`[ab]`, `[a-zA]`).
    CharAlt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrammarElement {
    pub kind: ElementKind,
    pub value: u32,
}

impl GrammarElement {
    pub(super) fn new(kind: ElementKind, value: u32) -> Self {
        Self { kind, value }
    }

    pub(super) fn is_end_of_sequence(&self) -> bool {
        matches!(self.kind, ElementKind::End | ElementKind::Alt)
    }
}

pub type Rule = Vec<GrammarElement>;

#[derive(Debug, Error, PartialEq)]
#[error("{message} at byte {position}")]
pub struct GrammarParseError {
    pub message: String,
    pub position: usize,
}

#[derive(Debug, Default)]
pub struct ParsedGrammar {
    pub symbol_ids: HashMap<String, u32>,
    pub rules: Vec<Rule>,
}

impl ParsedGrammar {
    pub fn root(&self) -> Option<usize> {
        self.symbol_ids.get("root").map(|&id| id as usize)
    }
}

type ParseResult<T> = std::result::Result<T, GrammarParseError>;

struct Parser<'s> {
    src: &'s [u8],
    out: ParsedGrammar,
}

fn fail<T>(message: &str, position: usize) -> ParseResult<T> {
    Err(GrammarParseError {
        message: message.to_string(),
        position,
    })
}

fn is_word_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-'
}

/// Parses GBNF text into a rule table.
pub fn parse(src: &str) -> ParseResult<ParsedGrammar> {
    let mut parser = Parser {
        src: src.as_bytes(),
        out: ParsedGrammar::default(),
    };
    let mut pos = parser.parse_space(0, true);
    while pos < parser.src.len() {
        pos = parser.parse_rule(pos)?;
    }
    parser.validate()?;
    Ok(parser.out)
}

impl<'s> Parser<'s> {
    fn at(&self, pos: usize) -> u8 {
        self.src.get(pos).copied().unwrap_or(0)
    }

    fn symbol_id(&mut self, name: &str) -> u32 {
        let next_id = self.out.symbol_ids.len() as u32;
        *self.out.symbol_ids.entry(name.to_string()).or_insert(next_id)
    }

    fn generate_symbol_id(&mut self, base: &str) -> u32 {
        let next_id = self.out.symbol_ids.len() as u32;
        self.out
            .symbol_ids
            .insert(format!("{}_{}", base, next_id), next_id);
        next_id
    }

    fn add_rule(&mut self, rule_id: u32, rule: Rule) {
        let idx = rule_id as usize;
        if self.out.rules.len() <= idx {
            self.out.rules.resize(idx + 1, Vec::new());
        }
        self.out.rules[idx] = rule;
    }

    fn parse_space(&self, mut pos: usize, newline_ok: bool) -> usize {
        loop {
            match self.at(pos) {
                b' ' | b'\t' => pos += 1,
                b'#' => {
                    while pos < self.src.len() && !matches!(self.src[pos], b'\r' | b'\n') {
                        pos += 1;
                    }
                }
                b'\r' | b'\n' if newline_ok => pos += 1,
                _ => return pos,
            }
        }
    }

    fn parse_name(&self, pos: usize) -> ParseResult<usize> {
        let mut end = pos;
        while is_word_char(self.at(end)) {
            end += 1;
        }
        if end == pos {
            return fail("expecting name", pos);
        }
        Ok(end)
    }

    fn parse_hex(&self, pos: usize, size: usize) -> ParseResult<(u32, usize)> {
        let mut value = 0u32;
        let mut end = pos;
        while end < pos + size {
            let digit = match (self.at(end) as char).to_digit(16) {
                Some(d) => d,
                None => break,
            };
            value = (value << 4) + digit;
            end += 1;
        }
        if end != pos + size {
            return fail(&format!("expecting {} hex chars", size), pos);
        }
        Ok((value, end))
    }

    fn decode_char(&self, pos: usize) -> ParseResult<(u32, usize)> {
        const LOOKUP: [usize; 16] = [1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 2, 2, 3, 4];
        let first = self.at(pos);
        let len = LOOKUP[(first >> 4) as usize];
        if len == 0 || pos + len > self.src.len() {
            return fail("invalid utf-8 sequence", pos);
        }
        let mask = (1u8 << (8 - len)) - 1;
        let mut value = (first & mask) as u32;
        for &byte in &self.src[pos + 1..pos + len] {
            value = (value << 6) + (byte & 0x3F) as u32;
        }
        Ok((value, pos + len))
    }

    fn parse_char(&self, pos: usize) -> ParseResult<(u32, usize)> {
        if pos >= self.src.len() {
            return fail("unexpected end of input", pos);
        }
        if self.at(pos) != b'\\' {
            return self.decode_char(pos);
        }
        match self.at(pos + 1) {
            b'x' => self.parse_hex(pos + 2, 2),
            b'u' => self.parse_hex(pos + 2, 4),
            b'U' => self.parse_hex(pos + 2, 8),
            b't' => Ok(('\t' as u32, pos + 2)),
            b'r' => Ok(('\r' as u32, pos + 2)),
            b'n' => Ok(('\n' as u32, pos + 2)),
            c @ (b'\\' | b'"' | b'[' | b']') => Ok((c as u32, pos + 2)),
            _ => fail("unknown escape", pos),
        }
    }

    fn parse_sequence(
        &mut self,
        mut pos: usize,
        rule_name: &str,
        out: &mut Rule,
        is_nested: bool,
    ) -> ParseResult<usize> {
        let mut last_sym_start = out.len();
        while pos < self.src.len() {
            let c = self.at(pos);
            if c == b'"' {
                pos += 1;
                last_sym_start = out.len();
                while self.at(pos) != b'"' {
                    let (ch, next) = self.parse_char(pos)?;
                    out.push(GrammarElement::new(ElementKind::Char, ch));
                    pos = next;
                }
                pos = self.parse_space(pos + 1, is_nested);
            } else if c == b'[' {
                pos += 1;
                let mut start_kind = ElementKind::Char;
                if self.at(pos) == b'^' {
                    pos += 1;
                    start_kind = ElementKind::CharNot;
                }
                last_sym_start = out.len();
                while self.at(pos) != b']' {
                    let (ch, next) = self.parse_char(pos)?;
                    pos = next;
                    let kind = if last_sym_start < out.len() {
                        ElementKind::CharAlt
                    } else {
                        start_kind
                    };
                    out.push(GrammarElement::new(kind, ch));
                    if self.at(pos) == b'-' && self.at(pos + 1) != b']' {
                        let (end_ch, next) = self.parse_char(pos + 1)?;
                        pos = next;
                        out.push(GrammarElement::new(ElementKind::CharRngUpper, end_ch));
                    }
                }
                pos = self.parse_space(pos + 1, is_nested);
            } else if is_word_char(c) {
                let name_end = self.parse_name(pos)?;
                let name = String::from_utf8_lossy(&self.src[pos..name_end]).into_owned();
                let ref_rule_id = self.symbol_id(&name);
                pos = self.parse_space(name_end, is_nested);
                last_sym_start = out.len();
                out.push(GrammarElement::new(ElementKind::RuleRef, ref_rule_id));
            } else if c == b'(' {
                pos = self.parse_space(pos + 1, true);
                let sub_rule_id = self.generate_symbol_id(rule_name);
                pos = self.parse_alternates(pos, rule_name, sub_rule_id, true)?;
                last_sym_start = out.len();
                out.push(GrammarElement::new(ElementKind::RuleRef, sub_rule_id));
                if self.at(pos) != b')' {
                    return fail("expecting ')'", pos);
                }
                pos = self.parse_space(pos + 1, is_nested);
            } else if matches!(c, b'*' | b'+' | b'?') {
                if last_sym_start == out.len() {
                    return fail("expecting preceding item to */+/?", pos);
                }
                // S* --> S' ::= S S' |
                // S+ --> S' ::= S S' | S
                // S? --> S' ::= S |
                let sub_rule_id = self.generate_symbol_id(rule_name);
                let item: Rule = out[last_sym_start..].to_vec();
                let mut sub_rule = item.clone();
                if c != b'?' {
                    sub_rule.push(GrammarElement::new(ElementKind::RuleRef, sub_rule_id));
                }
                sub_rule.push(GrammarElement::new(ElementKind::Alt, 0));
                if c == b'+' {
                    sub_rule.extend_from_slice(&item);
                }
                sub_rule.push(GrammarElement::new(ElementKind::End, 0));
                self.add_rule(sub_rule_id, sub_rule);

                out.truncate(last_sym_start);
                out.push(GrammarElement::new(ElementKind::RuleRef, sub_rule_id));
                pos = self.parse_space(pos + 1, is_nested);
            } else {
                break;
            }
        }
        Ok(pos)
    }

    fn parse_alternates(
        &mut self,
        pos: usize,
        rule_name: &str,
        rule_id: u32,
        is_nested: bool,
    ) -> ParseResult<usize> {
        let mut rule = Rule::new();
        let mut pos = self.parse_sequence(pos, rule_name, &mut rule, is_nested)?;
        while self.at(pos) == b'|' {
            rule.push(GrammarElement::new(ElementKind::Alt, 0));
            pos = self.parse_space(pos + 1, true);
            pos = self.parse_sequence(pos, rule_name, &mut rule, is_nested)?;
        }
        rule.push(GrammarElement::new(ElementKind::End, 0));
        self.add_rule(rule_id, rule);
        Ok(pos)
    }

    fn parse_rule(&mut self, pos: usize) -> ParseResult<usize> {
        let name_end = self.parse_name(pos)?;
        let name = String::from_utf8_lossy(&self.src[pos..name_end]).into_owned();
        let mut pos = self.parse_space(name_end, false);
        let rule_id = self.symbol_id(&name);

        if !self.src[pos..].starts_with(b"::=") {
            return fail("expecting ::=", pos);
        }
        pos = self.parse_space(pos + 3, true);
        pos = self.parse_alternates(pos, &name, rule_id, false)?;

        match self.at(pos) {
            b'\r' => pos += if self.at(pos + 1) == b'\n' { 2 } else { 1 },
            b'\n' => pos += 1,
            0 if pos >= self.src.len() => {}
            _ => return fail("expecting newline or end", pos),
        }
        Ok(self.parse_space(pos, true))
    }

    fn validate(&self) -> ParseResult<()> {
        let rules = &self.out.rules;
        for rule in rules {
            for elem in rule {
                if elem.kind == ElementKind::RuleRef {
                    let idx = elem.value as usize;
                    if idx >= rules.len() || rules[idx].is_empty() {
                        let name = self
                            .out
                            .symbol_ids
                            .iter()
                            .find(|(_, &id)| id == elem.value)
                            .map(|(n, _)| n.as_str())
                            .unwrap_or("?");
                        return fail(&format!("undefined rule identifier '{}'", name), 0);
                    }
                }
            }
        }
        if self.out.root().is_none() {
            return fail("grammar does not define 'root'", 0);
        }

        let n = rules.len();
        let mut visited = vec![false; n];
        let mut in_progress = vec![false; n];
        let mut may_be_empty = vec![false; n];
        for i in 0..n {
            if visited[i] {
                continue;
            }
            if detect_left_recursion(rules, i, &mut visited, &mut in_progress, &mut may_be_empty) {
                return fail("left recursion detected", 0);
            }
        }
        Ok(())
    }
}

fn detect_left_recursion(
    rules: &[Rule],
    rule_index: usize,
    visited: &mut [bool],
    in_progress: &mut [bool],
    may_be_empty: &mut [bool],
) -> bool {
    if in_progress[rule_index] {
        return true;
    }
    in_progress[rule_index] = true;
    let rule = &rules[rule_index];

    let mut at_rule_start = true;
    for elem in rule {
        if elem.is_end_of_sequence() {
            if at_rule_start {
                may_be_empty[rule_index] = true;
                break;
            }
            at_rule_start = true;
        } else {
            at_rule_start = false;
        }
    }

    // leftmost nonterminals, continuing past any that may be empty
    let mut recurse = true;
    for elem in rule {
        if elem.kind == ElementKind::RuleRef && recurse {
            let target = elem.value as usize;
            if detect_left_recursion(rules, target, visited, in_progress, may_be_empty) {
                return true;
            }
            if !may_be_empty[target] {
                recurse = false;
            }
        } else {
            recurse = elem.is_end_of_sequence();
        }
    }

    in_progress[rule_index] = false;
    visited[rule_index] = true;
    false
}
