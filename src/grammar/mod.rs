//! GBNF grammar constraints.
//!
//! The grammar is tracked as a set of pushdown stacks; each stack is a path of
//! positions into the rule table whose top is always a terminal. Tokens are
//! matched code point by code point, with a partially decoded UTF-8 sequence
//! carried between tokens.

mod parser;

pub use parser::{parse, ElementKind, GrammarElement, GrammarParseError, ParsedGrammar, Rule};

use tracing::{debug, warn};

use crate::error::{KernelError, Result};
use crate::sampling::CandidateSet;

/// Position of an element: `(rule index, offset within the rule)`.
type Pos = (usize, usize);
type Stack = Vec<Pos>;

/// A UTF-8 sequence cut short at the end of a token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialUtf8 {
    /// Bits decoded so far.
    pub value: u32,
    /// Continuation bytes still expected; `-1` flags an invalid sequence.
    pub n_remain: i32,
}

/// Decodes `src` continuing from `partial`, returning the complete code
/// points and the new partial state.
pub fn decode_utf8(src: &[u8], partial: PartialUtf8) -> (Vec<u32>, PartialUtf8) {
    const LOOKUP: [i32; 16] = [1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 2, 2, 3, 4];
    let mut pos = 0;
    let mut code_points = Vec::with_capacity(src.len());
    let mut value = partial.value;
    let mut n_remain = partial.n_remain;

    while pos < src.len() && n_remain > 0 {
        let next_byte = src[pos];
        if next_byte >> 6 != 2 {
            return (Vec::new(), PartialUtf8 { value: 0, n_remain: -1 });
        }
        value = (value << 6) + (next_byte & 0x3F) as u32;
        pos += 1;
        n_remain -= 1;
    }
    if partial.n_remain > 0 && n_remain == 0 {
        code_points.push(value);
    }

    while pos < src.len() {
        let first_byte = src[pos];
        n_remain = LOOKUP[(first_byte >> 4) as usize] - 1;
        if n_remain < 0 {
            return (Vec::new(), PartialUtf8 { value: 0, n_remain });
        }
        let mask = (1u32 << (7 - n_remain)) - 1;
        value = first_byte as u32 & mask;
        pos += 1;
        while pos < src.len() && n_remain > 0 {
            value = (value << 6) + (src[pos] & 0x3F) as u32;
            pos += 1;
            n_remain -= 1;
        }
        if n_remain == 0 {
            code_points.push(value);
        }
    }

    (code_points, PartialUtf8 { value, n_remain })
}

#[derive(Debug, Clone)]
pub struct Grammar {
    source: String,
    rules: Vec<Rule>,
    stacks: Vec<Stack>,
    partial_utf8: PartialUtf8,
}

struct Candidate<'a> {
    index: usize,
    code_points: &'a [u32],
    offset: usize,
    partial: PartialUtf8,
}

impl<'a> Candidate<'a> {
    fn current(&self) -> Option<u32> {
        self.code_points.get(self.offset).copied()
    }
}

impl Grammar {
    pub fn parse(source: &str) -> std::result::Result<Self, GrammarParseError> {
        let parsed = parse(source)?;
        let root = parsed.root().ok_or_else(|| GrammarParseError {
            message: "grammar does not define 'root'".to_string(),
            position: 0,
        })?;
        Ok(Self::from_rules(source.to_string(), parsed.rules, root))
    }

    fn from_rules(source: String, rules: Vec<Rule>, root: usize) -> Self {
        let mut stacks = Vec::new();
        let mut offset = 0;
        loop {
            let mut stack = Stack::new();
            if !rules[root][offset].is_end_of_sequence() {
                stack.push((root, offset));
            }
            advance_stack(&rules, stack, &mut stacks);
            while !rules[root][offset].is_end_of_sequence() {
                offset += 1;
            }
            if rules[root][offset].kind == ElementKind::Alt {
                offset += 1;
            } else {
                break;
            }
        }
        Self {
            source,
            rules,
            stacks,
            partial_utf8: PartialUtf8::default(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// EOS is only acceptable once some stack has been fully consumed.
    pub fn allows_eos(&self) -> bool {
        self.stacks.iter().any(|s| s.is_empty())
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.len()
    }

    fn element(&self, pos: Pos) -> GrammarElement {
        self.rules[pos.0][pos.1]
    }

    /// Returns the indices into `pieces` of every candidate the grammar
    /// cannot accept from the current state.
    fn reject(&self, pieces: &[(usize, &[u8])]) -> Vec<usize> {
        let decoded: Vec<(usize, Vec<u32>, PartialUtf8)> = pieces
            .iter()
            .map(|(index, piece)| {
                let (cps, partial) = decode_utf8(piece, self.partial_utf8);
                (*index, cps, partial)
            })
            .collect();
        let candidates: Vec<Candidate<'_>> = decoded
            .iter()
            .map(|(index, cps, partial)| Candidate {
                index: *index,
                code_points: cps,
                offset: 0,
                partial: *partial,
            })
            .collect();
        reject_candidates(&self.rules, &self.stacks, candidates)
            .into_iter()
            .map(|c| c.index)
            .collect()
    }

    /// Advances the grammar over a sampled token.
    pub fn accept_token(&mut self, token: u32, piece: &[u8], eos: u32) -> Result<()> {
        if token == eos {
            if self.allows_eos() {
                return Ok(());
            }
            return Err(KernelError::GrammarViolation(
                "end of stream before the grammar was satisfied".to_string(),
            ));
        }

        let (code_points, partial) = decode_utf8(piece, self.partial_utf8);
        let mut stacks = std::mem::take(&mut self.stacks);
        for cp in code_points {
            stacks = accept(&self.rules, &stacks, cp);
        }
        self.stacks = stacks;
        self.partial_utf8 = partial;

        if self.stacks.is_empty() {
            return Err(KernelError::GrammarViolation(format!(
                "token {} ({:?}) has no continuation",
                token,
                String::from_utf8_lossy(piece)
            )));
        }
        Ok(())
    }

    pub fn gate<'a>(&'a self, pieces: &'a [Vec<u8>], eos: u32) -> GrammarGate<'a> {
        GrammarGate {
            grammar: self,
            pieces,
            eos,
        }
    }
}

/// Applies a grammar to a candidate set: rejected tokens get `-inf`.
#[derive(Clone, Copy)]
pub struct GrammarGate<'a> {
    grammar: &'a Grammar,
    pieces: &'a [Vec<u8>],
    eos: u32,
}

impl GrammarGate<'_> {
    pub fn apply(&self, candidates: &mut CandidateSet) {
        let allow_eos = self.grammar.allows_eos();
        let mut suppressed = Vec::new();
        let mut pending: Vec<(usize, &[u8])> = Vec::new();

        for (i, t) in candidates.as_slice().iter().enumerate() {
            let piece: &[u8] = self
                .pieces
                .get(t.id as usize)
                .map(|p| p.as_slice())
                .unwrap_or(&[]);
            if t.id == self.eos {
                if !allow_eos {
                    suppressed.push(i);
                }
            } else if piece.first().map_or(true, |&b| b == 0) {
                suppressed.push(i);
            } else {
                pending.push((i, piece));
            }
        }

        suppressed.extend(self.grammar.reject(&pending));
        debug!(rejected = suppressed.len(), "grammar gate applied");
        for i in suppressed {
            candidates.suppress(i);
        }
    }
}

/// Reloads the grammar unless the caller asked to keep an identical one.
///
/// An invalid grammar disables constraints for the request.
pub fn refresh(slot: &mut Option<Grammar>, source: &str, retain_state: bool) {
    let unchanged = slot.as_ref().is_some_and(|g| g.source() == source);
    if retain_state && !source.is_empty() && unchanged {
        return;
    }
    *slot = None;
    if source.is_empty() {
        return;
    }
    match Grammar::parse(source) {
        Ok(grammar) => *slot = Some(grammar),
        Err(e) => warn!(error = %e, "ignoring invalid grammar"),
    }
}

fn advance_stack(rules: &[Rule], stack: Stack, new_stacks: &mut Vec<Stack>) {
    let Some(&pos) = stack.last() else {
        if !new_stacks.contains(&stack) {
            new_stacks.push(stack);
        }
        return;
    };

    let elem = rules[pos.0][pos.1];
    match elem.kind {
        ElementKind::RuleRef => {
            let rule_id = elem.value as usize;
            let rule = &rules[rule_id];
            let mut sub = 0;
            loop {
                let mut new_stack = stack[..stack.len() - 1].to_vec();
                if !rules[pos.0][pos.1 + 1].is_end_of_sequence() {
                    new_stack.push((pos.0, pos.1 + 1));
                }
                if !rule[sub].is_end_of_sequence() {
                    new_stack.push((rule_id, sub));
                }
                advance_stack(rules, new_stack, new_stacks);
                while !rule[sub].is_end_of_sequence() {
                    sub += 1;
                }
                if rule[sub].kind == ElementKind::Alt {
                    sub += 1;
                } else {
                    break;
                }
            }
        }
        ElementKind::Char | ElementKind::CharNot => {
            if !new_stacks.contains(&stack) {
                new_stacks.push(stack);
            }
        }
        // only terminals and rule references are ever on top of a stack
        ElementKind::End | ElementKind::Alt | ElementKind::CharRngUpper | ElementKind::CharAlt => {}
    }
}

/// Matches `chr` against the char element at `pos`, returning the result and
/// the position following the element's char class.
fn match_char(rules: &[Rule], pos: Pos, chr: u32) -> (bool, Pos) {
    let rule = &rules[pos.0];
    let mut i = pos.1;
    let is_positive = matches!(rule[i].kind, ElementKind::Char | ElementKind::CharAlt);
    let mut found = false;
    loop {
        if rule[i + 1].kind == ElementKind::CharRngUpper {
            found = found || (rule[i].value <= chr && chr <= rule[i + 1].value);
            i += 2;
        } else {
            found = found || rule[i].value == chr;
            i += 1;
        }
        if rule[i].kind != ElementKind::CharAlt {
            break;
        }
    }
    (found == is_positive, (pos.0, i))
}

/// Whether some completion of a partial UTF-8 sequence could satisfy the
/// char element at `pos`.
fn match_partial_char(rules: &[Rule], pos: Pos, partial: PartialUtf8) -> bool {
    let rule = &rules[pos.0];
    let mut i = pos.1;
    let is_positive = matches!(rule[i].kind, ElementKind::Char | ElementKind::CharAlt);

    let n_remain = partial.n_remain;
    // invalid sequence or a 7-bit char split across two bytes (overlong)
    if n_remain < 0 || (n_remain == 1 && partial.value < 2) {
        return false;
    }

    let shift = (n_remain * 6) as u32;
    let mut low = partial.value << shift;
    let high = low | ((1u32 << shift) - 1);
    if low == 0 {
        if n_remain == 2 {
            low = 1 << 11;
        } else if n_remain == 3 {
            low = 1 << 16;
        }
    }

    loop {
        if rule[i + 1].kind == ElementKind::CharRngUpper {
            if rule[i].value <= high && low <= rule[i + 1].value {
                return is_positive;
            }
            i += 2;
        } else {
            if low <= rule[i].value && rule[i].value <= high {
                return is_positive;
            }
            i += 1;
        }
        if rule[i].kind != ElementKind::CharAlt {
            break;
        }
    }
    !is_positive
}

fn accept(rules: &[Rule], stacks: &[Stack], chr: u32) -> Vec<Stack> {
    let mut new_stacks = Vec::new();
    for stack in stacks {
        let Some(&top) = stack.last() else {
            continue;
        };
        let (matched, next) = match_char(rules, top, chr);
        if matched {
            let mut new_stack = stack[..stack.len() - 1].to_vec();
            if !rules[next.0][next.1].is_end_of_sequence() {
                new_stack.push(next);
            }
            advance_stack(rules, new_stack, &mut new_stacks);
        }
    }
    new_stacks
}

fn reject_candidates<'a>(
    rules: &[Rule],
    stacks: &[Stack],
    candidates: Vec<Candidate<'a>>,
) -> Vec<Candidate<'a>> {
    let Some((first, rest)) = stacks.split_first() else {
        return candidates;
    };
    if candidates.is_empty() {
        return candidates;
    }
    let mut rejects = reject_candidates_for_stack(rules, first, candidates);
    for stack in rest {
        rejects = reject_candidates_for_stack(rules, stack, rejects);
    }
    rejects
}

fn reject_candidates_for_stack<'a>(
    rules: &[Rule],
    stack: &Stack,
    candidates: Vec<Candidate<'a>>,
) -> Vec<Candidate<'a>> {
    let Some(&top) = stack.last() else {
        // a finished stack only accepts tokens that add nothing
        return candidates
            .into_iter()
            .filter(|c| c.current().is_some() || c.partial.n_remain != 0)
            .collect();
    };

    let mut rejects = Vec::new();
    let mut next_candidates = Vec::new();
    for c in candidates {
        match c.current() {
            None => {
                if c.partial.n_remain != 0 && !match_partial_char(rules, top, c.partial) {
                    rejects.push(c);
                }
            }
            Some(cp) => {
                if match_char(rules, top, cp).0 {
                    next_candidates.push(Candidate {
                        offset: c.offset + 1,
                        ..c
                    });
                } else {
                    rejects.push(c);
                }
            }
        }
    }

    let (_, after) = match_char(rules, top, 0);
    let mut stack_after = stack[..stack.len() - 1].to_vec();
    if !rules[after.0][after.1].is_end_of_sequence() {
        stack_after.push(after);
    }
    let mut next_stacks = Vec::new();
    advance_stack(rules, stack_after, &mut next_stacks);

    for c in reject_candidates(rules, &next_stacks, next_candidates) {
        rejects.push(Candidate {
            offset: c.offset - 1,
            ..c
        });
    }
    rejects
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: u32 = 0;

    fn pieces(words: &[&str]) -> Vec<Vec<u8>> {
        words.iter().map(|w| w.as_bytes().to_vec()).collect()
    }

    fn allowed(grammar: &Grammar, vocab: &[Vec<u8>]) -> Vec<u32> {
        let mut set = CandidateSet::from_logits(&vec![0.0; vocab.len()]);
        grammar.gate(vocab, EOS).apply(&mut set);
        set.as_slice()
            .iter()
            .filter(|t| t.logit.is_finite())
            .map(|t| t.id)
            .collect()
    }

    #[test]
    fn decode_utf8_carries_partial_sequences() {
        let euro = "€".as_bytes();
        let (cps, partial) = decode_utf8(&euro[..1], PartialUtf8::default());
        assert!(cps.is_empty());
        assert_eq!(partial.n_remain, 2);

        let (cps, partial) = decode_utf8(&euro[1..], partial);
        assert_eq!(cps, vec!['€' as u32]);
        assert_eq!(partial.n_remain, 0);

        let (cps, partial) = decode_utf8(&[0x80], PartialUtf8::default());
        assert!(cps.is_empty());
        assert_eq!(partial.n_remain, -1);
    }

    #[test]
    fn gate_only_allows_grammar_tokens() {
        let grammar = Grammar::parse("root ::= \"yes\" | \"no\"").unwrap();
        let vocab = pieces(&["</s>", "ye", "s", "no", "maybe", "y", ""]);
        assert_eq!(allowed(&grammar, &vocab), vec![1, 3, 5]);
    }

    #[test]
    fn eos_only_after_completion() {
        let mut grammar = Grammar::parse("root ::= \"ab\"").unwrap();
        let vocab = pieces(&["</s>", "a", "b"]);
        assert!(!grammar.allows_eos());
        assert!(grammar.accept_token(EOS, b"", EOS).is_err());

        grammar.accept_token(1, b"a", EOS).unwrap();
        assert_eq!(allowed(&grammar, &vocab), vec![2]);
        grammar.accept_token(2, b"b", EOS).unwrap();
        assert!(grammar.allows_eos());
        assert_eq!(allowed(&grammar, &vocab), vec![0]);
        grammar.accept_token(EOS, b"", EOS).unwrap();
    }

    #[test]
    fn rejection_is_idempotent_without_accepting() {
        let grammar = Grammar::parse("root ::= [0-9]+").unwrap();
        let vocab = pieces(&["</s>", "1", "x", "42", "4a"]);
        let first = allowed(&grammar, &vocab);
        assert_eq!(first, vec![1, 3]);
        assert_eq!(allowed(&grammar, &vocab), first);
    }

    #[test]
    fn partial_utf8_tokens_are_judged_by_possible_completion() {
        let grammar = Grammar::parse("root ::= \"€\"").unwrap();
        let euro = "€".as_bytes();
        let vocab = vec![b"</s>".to_vec(), euro[..1].to_vec(), vec![0xC3], b"e".to_vec()];
        assert_eq!(allowed(&grammar, &vocab), vec![1]);
    }

    #[test]
    fn accepting_a_rejected_token_is_a_violation() {
        let mut grammar = Grammar::parse("root ::= \"a\"").unwrap();
        let err = grammar.accept_token(5, b"z", EOS).unwrap_err();
        assert!(matches!(err, KernelError::GrammarViolation(_)));
    }

    #[test]
    fn refresh_retains_or_reloads() {
        let mut slot = None;
        refresh(&mut slot, "root ::= \"ab\"", false);
        slot.as_mut().unwrap().accept_token(1, b"a", EOS).unwrap();

        refresh(&mut slot, "root ::= \"ab\"", true);
        assert!(!slot.as_ref().unwrap().allows_eos());
        slot.as_mut().unwrap().accept_token(2, b"b", EOS).unwrap();
        assert!(slot.as_ref().unwrap().allows_eos());

        refresh(&mut slot, "root ::= \"ab\"", false);
        assert!(!slot.as_ref().unwrap().allows_eos());
        assert!(slot.as_mut().unwrap().accept_token(2, b"b", EOS).is_err());

        refresh(&mut slot, "root ::= nope", false);
        assert!(slot.is_none());
        refresh(&mut slot, "", true);
        assert!(slot.is_none());
    }
}
