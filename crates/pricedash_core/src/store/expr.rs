//! Parser and evaluator for native condition/filter/update expressions.
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! condition := and ( OR and )*
//! and       := unary ( AND unary )*
//! unary     := NOT unary | primary
//! primary   := '(' condition ')'
//!            | attribute_exists '(' path ')' | attribute_not_exists '(' path ')'
//!            | begins_with '(' operand ',' operand ')' | contains '(' operand ',' operand ')'
//!            | operand comparator operand
//!            | operand BETWEEN operand AND operand
//!            | operand IN '(' operand ( ',' operand )* ')'
//! update    := ( SET path '=' operand ( ',' path '=' operand )* | REMOVE path ( ',' path )* )+
//! ```

use super::{AttributeNames, AttributeValues, Item};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Cmp(Comparator),
    Name(String),
    Value(String),
    Word(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Path {
    /// `#alias`, resolved through the request's name map.
    Alias(String),
    /// Bare attribute name.
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Path(Path),
    /// `:alias`, resolved through the request's value map.
    Value(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Condition {
    Compare(Operand, Comparator, Operand),
    Between(Operand, Operand, Operand),
    In(Operand, Vec<Operand>),
    AttributeExists(Path),
    AttributeNotExists(Path),
    BeginsWith(Operand, Operand),
    Contains(Operand, Operand),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UpdateAction {
    Set(Path, Operand),
    Remove(Path),
}

/// Placeholder tables of one request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bindings<'a> {
    pub names: &'a AttributeNames,
    pub values: &'a AttributeValues,
}

impl<'a> Bindings<'a> {
    pub fn new(names: &'a AttributeNames, values: &'a AttributeValues) -> Self {
        Self { names, values }
    }

    /// Attribute name a path refers to, if its alias is defined.
    pub fn attribute_name<'b>(&self, path: &'b Path) -> Option<&'b str>
    where
        'a: 'b,
    {
        match path {
            Path::Alias(alias) => self.names.get(alias).map(String::as_str),
            Path::Attribute(name) => Some(name.as_str()),
        }
    }

    fn resolve<'b>(&self, operand: &'b Operand, item: &'b Item) -> Option<&'b Value>
    where
        'a: 'b,
    {
        match operand {
            Operand::Path(path) => self.attribute_name(path).and_then(|name| item.get(name)),
            Operand::Value(alias) => self.values.get(alias),
        }
    }
}

/// Placeholders referenced by a set of parsed expressions.
#[derive(Debug, Default)]
pub(crate) struct PlaceholderUsage {
    pub names: BTreeSet<String>,
    pub values: BTreeSet<String>,
}

impl PlaceholderUsage {
    fn path(&mut self, path: &Path) {
        if let Path::Alias(alias) = path {
            self.names.insert(alias.clone());
        }
    }

    fn operand(&mut self, operand: &Operand) {
        match operand {
            Operand::Path(path) => self.path(path),
            Operand::Value(alias) => {
                self.values.insert(alias.clone());
            }
        }
    }

    pub fn condition(&mut self, condition: &Condition) {
        match condition {
            Condition::Compare(lhs, _, rhs)
            | Condition::BeginsWith(lhs, rhs)
            | Condition::Contains(lhs, rhs) => {
                self.operand(lhs);
                self.operand(rhs);
            }
            Condition::Between(value, low, high) => {
                self.operand(value);
                self.operand(low);
                self.operand(high);
            }
            Condition::In(value, candidates) => {
                self.operand(value);
                candidates.iter().for_each(|candidate| self.operand(candidate));
            }
            Condition::AttributeExists(path) | Condition::AttributeNotExists(path) => {
                self.path(path);
            }
            Condition::And(lhs, rhs) | Condition::Or(lhs, rhs) => {
                self.condition(lhs);
                self.condition(rhs);
            }
            Condition::Not(inner) => self.condition(inner),
        }
    }

    pub fn update(&mut self, actions: &[UpdateAction]) {
        for action in actions {
            match action {
                UpdateAction::Set(path, operand) => {
                    self.path(path);
                    self.operand(operand);
                }
                UpdateAction::Remove(path) => self.path(path),
            }
        }
    }

    /// Checks the request's tables against this usage, both directions.
    pub fn check(&self, bindings: Bindings<'_>) -> Result<(), String> {
        if let Some(missing) = self.names.iter().find(|n| !bindings.names.contains_key(*n)) {
            return Err(format!(
                "an expression attribute name used in the document path is not defined; attribute name: {missing}"
            ));
        }
        if let Some(missing) = self.values.iter().find(|v| !bindings.values.contains_key(*v)) {
            return Err(format!(
                "an expression attribute value used in expression is not defined; attribute value: {missing}"
            ));
        }

        let unused_names: Vec<&str> = bindings
            .names
            .keys()
            .filter(|name| !self.names.contains(*name))
            .map(String::as_str)
            .collect();
        if !unused_names.is_empty() {
            return Err(format!(
                "value provided in ExpressionAttributeNames unused in expressions: keys: {{{}}}",
                unused_names.join(", ")
            ));
        }

        let unused_values: Vec<&str> = bindings
            .values
            .keys()
            .filter(|value| !self.values.contains(*value))
            .map(String::as_str)
            .collect();
        if !unused_values.is_empty() {
            return Err(format!(
                "value provided in ExpressionAttributeValues unused in expressions: keys: {{{}}}",
                unused_values.join(", ")
            ));
        }
        Ok(())
    }
}

pub(crate) fn parse_condition(source: &str) -> Result<Condition, String> {
    let mut parser = Parser::new(tokenize(source)?);
    let condition = parser.condition()?;
    parser.expect_end()?;
    Ok(condition)
}

pub(crate) fn parse_update(source: &str) -> Result<Vec<UpdateAction>, String> {
    let mut parser = Parser::new(tokenize(source)?);
    let actions = parser.update()?;
    parser.expect_end()?;
    Ok(actions)
}

impl Condition {
    pub fn evaluate(&self, item: &Item, bindings: Bindings<'_>) -> bool {
        match self {
            Self::Compare(lhs, op, rhs) => {
                match (bindings.resolve(lhs, item), bindings.resolve(rhs, item)) {
                    (Some(lhs), Some(rhs)) => compare(lhs, *op, rhs),
                    _ => false,
                }
            }
            Self::Between(value, low, high) => match (
                bindings.resolve(value, item),
                bindings.resolve(low, item),
                bindings.resolve(high, item),
            ) {
                (Some(value), Some(low), Some(high)) => {
                    compare(value, Comparator::Ge, low) && compare(value, Comparator::Le, high)
                }
                _ => false,
            },
            Self::In(value, candidates) => bindings.resolve(value, item).is_some_and(|value| {
                candidates.iter().any(|candidate| {
                    bindings
                        .resolve(candidate, item)
                        .is_some_and(|candidate| values_equal(value, candidate))
                })
            }),
            Self::AttributeExists(path) => bindings
                .attribute_name(path)
                .is_some_and(|name| item.contains_key(name)),
            Self::AttributeNotExists(path) => bindings
                .attribute_name(path)
                .is_some_and(|name| !item.contains_key(name)),
            Self::BeginsWith(value, prefix) => {
                match (bindings.resolve(value, item), bindings.resolve(prefix, item)) {
                    (Some(Value::String(value)), Some(Value::String(prefix))) => {
                        value.starts_with(prefix.as_str())
                    }
                    _ => false,
                }
            }
            Self::Contains(haystack, needle) => {
                match (bindings.resolve(haystack, item), bindings.resolve(needle, item)) {
                    (Some(Value::String(haystack)), Some(Value::String(needle))) => {
                        haystack.contains(needle.as_str())
                    }
                    (Some(Value::Array(elements)), Some(needle)) => elements
                        .iter()
                        .any(|element| values_equal(element, needle)),
                    _ => false,
                }
            }
            Self::And(lhs, rhs) => lhs.evaluate(item, bindings) && rhs.evaluate(item, bindings),
            Self::Or(lhs, rhs) => lhs.evaluate(item, bindings) || rhs.evaluate(item, bindings),
            Self::Not(inner) => !inner.evaluate(item, bindings),
        }
    }

    /// Splits a chain of `AND`s into its conjuncts.
    pub fn conjuncts(&self) -> Vec<&Condition> {
        match self {
            Self::And(lhs, rhs) => {
                let mut parts = lhs.conjuncts();
                parts.extend(rhs.conjuncts());
                parts
            }
            other => vec![other],
        }
    }
}

/// Applies update actions to `item` in order.
pub(crate) fn apply_update(
    actions: &[UpdateAction],
    item: &mut Item,
    bindings: Bindings<'_>,
) -> Result<(), String> {
    for action in actions {
        match action {
            UpdateAction::Set(path, operand) => {
                let name = bindings
                    .attribute_name(path)
                    .ok_or_else(|| "update path alias is not defined".to_string())?
                    .to_string();
                let value = bindings.resolve(operand, item).cloned().ok_or_else(|| {
                    "the provided expression refers to an attribute that does not exist in the item"
                        .to_string()
                })?;
                item.insert(name, value);
            }
            UpdateAction::Remove(path) => {
                let name = bindings
                    .attribute_name(path)
                    .ok_or_else(|| "update path alias is not defined".to_string())?;
                item.remove(name);
            }
        }
    }
    Ok(())
}

pub(crate) fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(lhs), Value::Number(rhs)) => lhs.as_f64() == rhs.as_f64(),
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, op: Comparator, rhs: &Value) -> bool {
    match op {
        Comparator::Eq => values_equal(lhs, rhs),
        Comparator::Ne => !values_equal(lhs, rhs),
        Comparator::Lt => order(lhs, rhs) == Some(Ordering::Less),
        Comparator::Le => matches!(order(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
        Comparator::Gt => order(lhs, rhs) == Some(Ordering::Greater),
        Comparator::Ge => matches!(order(lhs, rhs), Some(Ordering::Greater | Ordering::Equal)),
    }
}

// Only numbers and strings are ordered; mixed types never compare.
fn order(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(lhs), Value::Number(rhs)) => lhs.as_f64()?.partial_cmp(&rhs.as_f64()?),
        (Value::String(lhs), Value::String(rhs)) => Some(lhs.cmp(rhs)),
        _ => None,
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let take_word = |start: usize| {
        let mut end = start;
        while end < chars.len() && is_word(chars[end]) {
            end += 1;
        }
        (chars[start..end].iter().collect::<String>(), end)
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Cmp(Comparator::Eq));
                i += 1;
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Cmp(Comparator::Ne));
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Cmp(Comparator::Le));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Cmp(Comparator::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(Comparator::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(Comparator::Gt));
                    i += 1;
                }
            }
            '#' | ':' => {
                let (word, end) = take_word(i + 1);
                if word.is_empty() {
                    return Err(format!("syntax error; dangling `{c}` at offset {i}"));
                }
                let alias = format!("{c}{word}");
                tokens.push(if c == '#' {
                    Token::Name(alias)
                } else {
                    Token::Value(alias)
                });
                i = end;
            }
            _ if is_word(c) => {
                let (word, end) = take_word(i);
                tokens.push(Token::Word(word));
                i = end;
            }
            other => return Err(format!("syntax error; unexpected `{other}` at offset {i}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("syntax error; expected {expected:?}, found {token:?}")),
            None => Err(format!("syntax error; expected {expected:?}, found end of input")),
        }
    }

    fn expect_end(&self) -> Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("syntax error; unexpected trailing {token:?}")),
        }
    }

    fn condition(&mut self) -> Result<Condition, String> {
        let mut lhs = self.and()?;
        while self.eat_keyword("OR") {
            let rhs = self.and()?;
            lhs = Condition::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Condition, String> {
        let mut lhs = self.unary()?;
        while self.eat_keyword("AND") {
            let rhs = self.unary()?;
            lhs = Condition::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Condition, String> {
        if self.eat_keyword("NOT") {
            return Ok(Condition::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.condition()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }

        if let Some(Token::Word(word)) = self.peek() {
            let function = word.to_ascii_lowercase();
            if self.tokens.get(self.pos + 1) == Some(&Token::LParen) {
                self.pos += 2;
                let condition = match function.as_str() {
                    "attribute_exists" => Condition::AttributeExists(self.path()?),
                    "attribute_not_exists" => Condition::AttributeNotExists(self.path()?),
                    "begins_with" => {
                        let (lhs, rhs) = self.operand_pair()?;
                        Condition::BeginsWith(lhs, rhs)
                    }
                    "contains" => {
                        let (lhs, rhs) = self.operand_pair()?;
                        Condition::Contains(lhs, rhs)
                    }
                    other => return Err(format!("invalid function name; function: {other}")),
                };
                self.expect(Token::RParen)?;
                return Ok(condition);
            }
        }

        let lhs = self.operand()?;
        if self.eat_keyword("BETWEEN") {
            let low = self.operand()?;
            if !self.eat_keyword("AND") {
                return Err("syntax error; BETWEEN requires AND".to_string());
            }
            let high = self.operand()?;
            return Ok(Condition::Between(lhs, low, high));
        }
        if self.eat_keyword("IN") {
            self.expect(Token::LParen)?;
            let mut candidates = vec![self.operand()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                candidates.push(self.operand()?);
            }
            self.expect(Token::RParen)?;
            return Ok(Condition::In(lhs, candidates));
        }
        match self.next() {
            Some(Token::Cmp(op)) => Ok(Condition::Compare(lhs, op, self.operand()?)),
            Some(token) => Err(format!("syntax error; expected comparator, found {token:?}")),
            None => Err("syntax error; expected comparator, found end of input".to_string()),
        }
    }

    fn operand_pair(&mut self) -> Result<(Operand, Operand), String> {
        let lhs = self.operand()?;
        self.expect(Token::Comma)?;
        let rhs = self.operand()?;
        Ok((lhs, rhs))
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.peek() {
            Some(Token::Value(alias)) => {
                let alias = alias.clone();
                self.pos += 1;
                Ok(Operand::Value(alias))
            }
            _ => Ok(Operand::Path(self.path()?)),
        }
    }

    fn path(&mut self) -> Result<Path, String> {
        match self.next() {
            Some(Token::Name(alias)) => Ok(Path::Alias(alias)),
            Some(Token::Word(word)) if !is_reserved(&word) => Ok(Path::Attribute(word)),
            Some(Token::Word(word)) => Err(format!(
                "attribute name is a reserved keyword; reserved keyword: {word}"
            )),
            Some(token) => Err(format!("syntax error; expected attribute, found {token:?}")),
            None => Err("syntax error; expected attribute, found end of input".to_string()),
        }
    }

    fn update(&mut self) -> Result<Vec<UpdateAction>, String> {
        let mut actions = Vec::new();
        loop {
            if self.eat_keyword("SET") {
                loop {
                    let path = self.path()?;
                    self.expect(Token::Cmp(Comparator::Eq))?;
                    actions.push(UpdateAction::Set(path, self.operand()?));
                    if self.peek() != Some(&Token::Comma) {
                        break;
                    }
                    self.pos += 1;
                }
            } else if self.eat_keyword("REMOVE") {
                loop {
                    actions.push(UpdateAction::Remove(self.path()?));
                    if self.peek() != Some(&Token::Comma) {
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        if actions.is_empty() {
            return Err("syntax error; update expression has no actions".to_string());
        }
        Ok(actions)
    }
}

// Subset of the reserved word list; bare attribute names matching one of
// these must go through a `#` alias.
fn is_reserved(word: &str) -> bool {
    const RESERVED: &[&str] = &[
        "AND", "OR", "NOT", "BETWEEN", "IN", "SET", "REMOVE", "TIMESTAMP", "NAME", "VALUE",
        "DATA", "KEY", "TIME", "DATE", "STATUS",
    ];
    RESERVED
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(word))
}
