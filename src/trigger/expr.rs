//! Trigger rule language.
//!
//! ```text
//! rule    := or
//! or      := and (("or" | "|" | "||") and)*
//! and     := not (("and" | "&" | "&&") not)*
//! not     := ("not" | "!" | "~") not | atom
//! atom    := "CH1".."CH6" | "True" | "False" | "1" | "0" | "(" or ")"
//! ```
//!
//! Keywords and channel names are case-insensitive. Errors carry the
//! character position of the offending token. Rules are limited to
//! [`MAX_RULE_TOKENS`] tokens and [`MAX_NESTING`] levels of negation or
//! parentheses.

use std::fmt;

use crate::error::{Result, TluError};

/// Number of trigger inputs.
pub const CHANNELS: u8 = 6;

/// Longest accepted rule, in tokens.
pub const MAX_RULE_TOKENS: usize = 256;

/// Deepest accepted nesting of `not` and parentheses.
pub const MAX_NESTING: usize = 64;

/// Parsed trigger rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerExpr {
    /// Literal true/false
    Const(bool),
    /// Input channel, 1-based
    Channel(u8),
    /// Negation
    Not(Box<TriggerExpr>),
    /// Conjunction
    And(Box<TriggerExpr>, Box<TriggerExpr>),
    /// Disjunction
    Or(Box<TriggerExpr>, Box<TriggerExpr>),
}

impl TriggerExpr {
    /// Parse rule text.
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = lex(text)?;
        if let Some(tok) = tokens.get(MAX_RULE_TOKENS) {
            return Err(parse_error(
                tok.pos,
                format!("rule longer than {} tokens", MAX_RULE_TOKENS),
            ));
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            end: text.chars().count(),
            depth: 0,
        };
        let expr = parser.or()?;
        if let Some(tok) = parser.peek() {
            return Err(parse_error(tok.pos, format!("unexpected {}", tok.kind)));
        }
        Ok(expr)
    }

    /// Evaluate against a combination; bit `i` of `combination` is channel
    /// `i + 1`.
    pub fn eval(&self, combination: u8) -> bool {
        match self {
            TriggerExpr::Const(v) => *v,
            TriggerExpr::Channel(ch) => matches!(
                ch.checked_sub(1)
                    .and_then(|bit| combination.checked_shr(u32::from(bit))),
                Some(bits) if bits & 1 == 1
            ),
            TriggerExpr::Not(e) => !e.eval(combination),
            TriggerExpr::And(a, b) => a.eval(combination) && b.eval(combination),
            TriggerExpr::Or(a, b) => a.eval(combination) || b.eval(combination),
        }
    }
}

impl fmt::Display for TriggerExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerExpr::Const(true) => write!(f, "True"),
            TriggerExpr::Const(false) => write!(f, "False"),
            TriggerExpr::Channel(ch) => write!(f, "CH{}", ch),
            TriggerExpr::Not(e) => write!(f, "not {}", Paren(e)),
            TriggerExpr::And(a, b) => write!(f, "{} and {}", Paren(a), Paren(b)),
            TriggerExpr::Or(a, b) => write!(f, "{} or {}", Paren(a), Paren(b)),
        }
    }
}

struct Paren<'a>(&'a TriggerExpr);

impl fmt::Display for Paren<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            TriggerExpr::And(..) | TriggerExpr::Or(..) => write!(f, "({})", self.0),
            other => write!(f, "{}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Channel(u8),
    Const(bool),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Channel(ch) => write!(f, "'CH{}'", ch),
            TokenKind::Const(v) => write!(f, "'{}'", v),
            TokenKind::And => write!(f, "'and'"),
            TokenKind::Or => write!(f, "'or'"),
            TokenKind::Not => write!(f, "'not'"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn parse_error(pos: usize, what: impl fmt::Display) -> TluError {
    TluError::config(format!("trigger rule: {} at position {}", what, pos))
}

fn lex(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let pos = i;
        let doubled = chars.get(i + 1) == Some(&c);
        let kind = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '!' | '~' => TokenKind::Not,
            '&' | '|' => {
                if doubled {
                    i += 1;
                }
                if c == '&' {
                    TokenKind::And
                } else {
                    TokenKind::Or
                }
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token {
                    kind: word_token(&word, start)?,
                    pos: start,
                });
                continue;
            }
            other => return Err(parse_error(pos, format!("unexpected character '{}'", other))),
        };
        tokens.push(Token { kind, pos });
        i += 1;
    }
    Ok(tokens)
}

fn word_token(word: &str, pos: usize) -> Result<TokenKind> {
    let lower = word.to_ascii_lowercase();
    let kind = match lower.as_str() {
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "true" | "1" => TokenKind::Const(true),
        "false" | "0" => TokenKind::Const(false),
        _ => {
            let channel = lower
                .strip_prefix("ch")
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| (1..=CHANNELS).contains(n));
            match channel {
                Some(ch) => TokenKind::Channel(ch),
                None => return Err(parse_error(pos, format!("unknown identifier '{}'", word))),
            }
        }
    };
    Ok(kind)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        match self.peek() {
            Some(tok) if tok.kind == kind => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    /// Run `f` one nesting level deeper; `pos` is the opening token.
    fn nested(
        &mut self,
        pos: usize,
        f: impl FnOnce(&mut Self) -> Result<TriggerExpr>,
    ) -> Result<TriggerExpr> {
        if self.depth >= MAX_NESTING {
            return Err(parse_error(pos, "rule nested too deeply"));
        }
        self.depth += 1;
        let expr = f(self);
        self.depth -= 1;
        expr
    }

    fn or(&mut self) -> Result<TriggerExpr> {
        let mut lhs = self.and()?;
        while self.eat(TokenKind::Or) {
            let rhs = self.and()?;
            lhs = TriggerExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<TriggerExpr> {
        let mut lhs = self.not()?;
        while self.eat(TokenKind::And) {
            let rhs = self.not()?;
            lhs = TriggerExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<TriggerExpr> {
        match self.peek() {
            Some(tok) if tok.kind == TokenKind::Not => {
                self.pos += 1;
                let inner = self.nested(tok.pos, |p| p.not())?;
                Ok(TriggerExpr::Not(Box::new(inner)))
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<TriggerExpr> {
        let Some(tok) = self.peek() else {
            return Err(parse_error(self.end, "unexpected end of rule"));
        };
        self.pos += 1;
        match tok.kind {
            TokenKind::Channel(ch) => Ok(TriggerExpr::Channel(ch)),
            TokenKind::Const(v) => Ok(TriggerExpr::Const(v)),
            TokenKind::LParen => {
                let inner = self.nested(tok.pos, |p| p.or())?;
                if !self.eat(TokenKind::RParen) {
                    let pos = self.peek().map_or(self.end, |t| t.pos);
                    return Err(parse_error(pos, format!("missing ')' for '(' at {}", tok.pos)));
                }
                Ok(inner)
            }
            other => Err(parse_error(tok.pos, format!("unexpected {}", other))),
        }
    }
}
