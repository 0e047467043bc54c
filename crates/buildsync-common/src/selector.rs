//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Kubernetes-style label selector parsing and matching."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
//! Label selectors restrict which tracked jobs an operator instance owns.
//!
//! The accepted grammar mirrors the Kubernetes label selector syntax:
//! comma separated requirements of the form `key=value`, `key==value`,
//! `key!=value`, `key in (a,b)`, `key notin (a,b)`, `key`, `!key`,
//! `key>1` and `key<1`. All requirements must hold for a label set to match.
//!
//! As in Kubernetes, `in` and `notin` are plain words where a value is
//! expected (`tier=in`), and an empty member of a value set stands for the
//! empty value: `key in ()`, `key in (a,)` and `key in (,a)` all admit `""`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use thiserror::Error;

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("found '{found}', expected {expected} (at offset {offset})")]
    Unexpected {
        offset: usize,
        found: String,
        expected: &'static str,
    },
    #[error("unterminated value set for key '{0}'")]
    UnterminatedSet(String),
    #[error("invalid label key '{0}'")]
    InvalidKey(String),
    #[error("invalid label value '{0}'")]
    InvalidValue(String),
    #[error("value '{0}' for a numeric comparison is not an integer")]
    NotAnInteger(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
    GreaterThan,
    LessThan,
}

/// A single clause of a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: BTreeSet<String>,
}

impl Requirement {
    fn matches(&self, labels: &IndexMap<String, String>) -> bool {
        let current = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => {
                current.map(|v| self.values.contains(v)).unwrap_or(false)
            }
            Operator::NotEquals | Operator::NotIn => {
                current.map(|v| !self.values.contains(v)).unwrap_or(true)
            }
            Operator::Exists => current.is_some(),
            Operator::DoesNotExist => current.is_none(),
            Operator::GreaterThan | Operator::LessThan => {
                let Some(actual) = current.and_then(|v| v.parse::<i64>().ok()) else {
                    return false;
                };
                let Some(bound) = self.values.iter().next().and_then(|v| v.parse::<i64>().ok())
                else {
                    return false;
                };
                if self.operator == Operator::GreaterThan {
                    actual > bound
                } else {
                    actual < bound
                }
            }
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, joined()),
            Operator::NotEquals => write!(f, "{}!={}", self.key, joined()),
            Operator::In => write!(f, "{} in ({})", self.key, joined()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, joined()),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            Operator::GreaterThan => write!(f, "{}>{}", self.key, joined()),
            Operator::LessThan => write!(f, "{}<{}", self.key, joined()),
        }
    }
}

/// Parsed label selector. The empty selector matches every label set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let tokens = tokenize(input)?;
        Parser { tokens, pos: 0 }.parse()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: &IndexMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Identifier(String),
    Not,
    Equals,
    DoubleEquals,
    NotEquals,
    GreaterThan,
    LessThan,
    In,
    NotIn,
    OpenParen,
    CloseParen,
    Comma,
    End,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Identifier(value) => value.clone(),
            Token::Not => "!".into(),
            Token::Equals => "=".into(),
            Token::DoubleEquals => "==".into(),
            Token::NotEquals => "!=".into(),
            Token::GreaterThan => ">".into(),
            Token::LessThan => "<".into(),
            Token::In => "in".into(),
            Token::NotIn => "notin".into(),
            Token::OpenParen => "(".into(),
            Token::CloseParen => ")".into(),
            Token::Comma => ",".into(),
            Token::End => "end of input".into(),
        }
    }
}

fn is_identifier_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/')
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, SelectorError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some((offset, ch)) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '(' => Token::OpenParen,
            ')' => Token::CloseParen,
            ',' => Token::Comma,
            '>' => Token::GreaterThan,
            '<' => Token::LessThan,
            '!' => {
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    Token::NotEquals
                } else {
                    Token::Not
                }
            }
            '=' => {
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    Token::DoubleEquals
                } else {
                    Token::Equals
                }
            }
            c if is_identifier_char(c) => {
                let mut ident = String::from(c);
                while let Some((_, next)) = chars.peek() {
                    if !is_identifier_char(*next) {
                        break;
                    }
                    ident.push(*next);
                    chars.next();
                }
                match ident.as_str() {
                    "in" => Token::In,
                    "notin" => Token::NotIn,
                    _ => Token::Identifier(ident),
                }
            }
            other => {
                return Err(SelectorError::Unexpected {
                    offset,
                    found: other.to_string(),
                    expected: "a label key, operator, or separator",
                })
            }
        };
        tokens.push((offset, token));
    }
    tokens.push((input.len(), Token::End));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn next(&mut self) -> (usize, Token) {
        let idx = self.pos.min(self.tokens.len() - 1);
        self.pos += 1;
        self.tokens[idx].clone()
    }

    fn unexpected(offset: usize, token: &Token, expected: &'static str) -> SelectorError {
        SelectorError::Unexpected {
            offset,
            found: token.describe(),
            expected,
        }
    }

    fn parse(mut self) -> Result<LabelSelector, SelectorError> {
        let mut requirements = Vec::new();
        if *self.peek() == Token::End {
            return Ok(LabelSelector { requirements });
        }
        loop {
            requirements.push(self.requirement()?);
            match self.next() {
                (_, Token::Comma) => continue,
                (_, Token::End) => break,
                (offset, other) => return Err(Self::unexpected(offset, &other, "',' or end of input")),
            }
        }
        Ok(LabelSelector { requirements })
    }

    fn requirement(&mut self) -> Result<Requirement, SelectorError> {
        let (offset, token) = self.next();
        let (key, negated) = match token {
            Token::Not => match self.next() {
                (_, Token::Identifier(key)) => (key, true),
                (offset, other) => return Err(Self::unexpected(offset, &other, "a label key")),
            },
            Token::Identifier(key) => (key, false),
            other => return Err(Self::unexpected(offset, &other, "a label key or '!'")),
        };
        validate_key(&key)?;
        if negated {
            return Ok(Requirement {
                key,
                operator: Operator::DoesNotExist,
                values: BTreeSet::new(),
            });
        }

        let operator = match self.peek() {
            Token::Comma | Token::End => {
                return Ok(Requirement {
                    key,
                    operator: Operator::Exists,
                    values: BTreeSet::new(),
                })
            }
            Token::Equals | Token::DoubleEquals => Operator::Equals,
            Token::NotEquals => Operator::NotEquals,
            Token::In => Operator::In,
            Token::NotIn => Operator::NotIn,
            Token::GreaterThan => Operator::GreaterThan,
            Token::LessThan => Operator::LessThan,
            other => {
                let offset = self.tokens[self.pos].0;
                return Err(Self::unexpected(offset, &other.clone(), "an operator"));
            }
        };
        self.next();

        let values = match operator {
            Operator::In | Operator::NotIn => self.value_set(&key)?,
            Operator::GreaterThan | Operator::LessThan => {
                let value = self.single_value()?;
                if value.parse::<i64>().is_err() {
                    return Err(SelectorError::NotAnInteger(value));
                }
                BTreeSet::from([value])
            }
            _ => BTreeSet::from([self.single_value()?]),
        };
        Ok(Requirement {
            key,
            operator,
            values,
        })
    }

    /// Tokens in value position, where the set keywords read as words.
    fn peek_value(&self) -> Token {
        as_value(self.peek().clone())
    }

    fn next_value(&mut self) -> (usize, Token) {
        let (offset, token) = self.next();
        (offset, as_value(token))
    }

    fn single_value(&mut self) -> Result<String, SelectorError> {
        match self.peek_value() {
            // `key=` selects the empty value.
            Token::Comma | Token::End => Ok(String::new()),
            Token::Identifier(value) => {
                self.next();
                validate_value(&value)?;
                Ok(value)
            }
            other => {
                let offset = self.tokens[self.pos].0;
                Err(Self::unexpected(offset, &other, "a label value"))
            }
        }
    }

    fn value_set(&mut self, key: &str) -> Result<BTreeSet<String>, SelectorError> {
        match self.next() {
            (_, Token::OpenParen) => {}
            (offset, other) => return Err(Self::unexpected(offset, &other, "'('")),
        }
        let mut values = BTreeSet::new();
        // Each member ends at ',' or ')'; a missing identifier is the empty value.
        loop {
            let value = match self.peek_value() {
                Token::Identifier(value) => {
                    self.next();
                    validate_value(&value)?;
                    value
                }
                _ => String::new(),
            };
            values.insert(value);
            match self.next_value() {
                (_, Token::Comma) => continue,
                (_, Token::CloseParen) => break,
                (_, Token::End) => return Err(SelectorError::UnterminatedSet(key.to_owned())),
                (offset, other) => return Err(Self::unexpected(offset, &other, "',' or ')'")),
            }
        }
        Ok(values)
    }
}

fn as_value(token: Token) -> Token {
    match token {
        Token::In => Token::Identifier("in".into()),
        Token::NotIn => Token::Identifier("notin".into()),
        other => other,
    }
}

fn is_qualified_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let valid = match key.split_once('/') {
        Some((prefix, name)) => {
            !prefix.is_empty()
                && prefix.len() <= MAX_PREFIX_LEN
                && prefix.split('.').all(|part| {
                    !part.is_empty()
                        && part.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                })
                && is_qualified_name(name)
        }
        None => is_qualified_name(key),
    };
    if valid {
        Ok(())
    } else {
        Err(SelectorError::InvalidKey(key.to_owned()))
    }
}

fn validate_value(value: &str) -> Result<(), SelectorError> {
    if value.is_empty() || (!value.contains('/') && is_qualified_name(value)) {
        Ok(())
    } else {
        Err(SelectorError::InvalidValue(value.to_owned()))
    }
}
