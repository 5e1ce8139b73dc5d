//! Restricted condition expressions for rule files.
//!
//! Grammar: comparisons (`< <= == != >= >`), boolean `and`/`or`/`not`,
//! `is null` / `is not null`, and literals (numbers, strings, booleans,
//! `None`/`null`). Function calls, attribute access, subscripts and
//! identifiers starting with an underscore are rejected at parse time.
//! Comparisons involving null evaluate to false, never an error.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("unexpected character `{0}`")]
    BadChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("identifier `{0}` is not allowed")]
    ForbiddenIdent(String),
    #[error("construct `{0}` is not allowed")]
    ForbiddenConstruct(&'static str),
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
}

// ── Values ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Convert a JSON value from the evaluation context.
pub fn value_from_json(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::Str(s.clone()),
        _ => Value::Null,
    }
}

// ── Tokens ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Num(f64),
    Str(String),
    Lt,
    Le,
    EqEq,
    Ne,
    Ge,
    Gt,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                // A call looks like `ident(`; boolean keywords before a
                // paren are grouping, not calls.
                if let Some(Token::Ident(prev)) = tokens.last() {
                    if !matches!(prev.as_str(), "and" | "or" | "not" | "is") {
                        return Err(ExprError::ForbiddenConstruct("function call"));
                    }
                }
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExprError::BadChar('='));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(ExprError::BadChar('!'));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(ExprError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '-' | '0'..='9' => {
                let mut s = String::new();
                if c == '-' {
                    s.push('-');
                    i += 1;
                }
                while let Some(&ch) = chars.get(i) {
                    if ch.is_ascii_digit() || ch == '.' {
                        s.push(ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                let n: f64 = s.parse().map_err(|_| ExprError::BadChar(c))?;
                tokens.push(Token::Num(n));
            }
            '.' => return Err(ExprError::ForbiddenConstruct("attribute access")),
            '[' | ']' => return Err(ExprError::ForbiddenConstruct("subscript")),
            '{' | '}' => return Err(ExprError::ForbiddenConstruct("comprehension")),
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&ch) = chars.get(i) {
                    if ch.is_alphanumeric() || ch == '_' {
                        s.push(ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                if s.starts_with('_') {
                    return Err(ExprError::ForbiddenIdent(s));
                }
                match s.as_str() {
                    "lambda" => return Err(ExprError::ForbiddenConstruct("lambda")),
                    "for" | "in" => return Err(ExprError::ForbiddenConstruct("comprehension")),
                    "import" => return Err(ExprError::ForbiddenConstruct("import")),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            other => return Err(ExprError::BadChar(other)),
        }
    }

    Ok(tokens)
}

// ── AST ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

#[derive(Debug, Clone)]
pub enum Operand {
    Lit(Value),
    Ident(String),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(Operand, CmpOp, Operand),
    IsNull(Operand, bool),
    Truthy(Operand),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == kw)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.is_keyword("or") {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        while self.is_keyword("and") {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.is_keyword("not") {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.next();
            let inner = self.parse_or()?;
            match self.next() {
                Some(Token::RParen) => return Ok(inner),
                Some(t) => return Err(ExprError::UnexpectedToken(format!("{t:?}"))),
                None => return Err(ExprError::UnexpectedEnd),
            }
        }

        let lhs = self.parse_operand()?;

        // `x is null` / `x is not null`
        if self.is_keyword("is") {
            self.next();
            let negated = if self.is_keyword("not") {
                self.next();
                true
            } else {
                false
            };
            if self.is_keyword("null") || self.is_keyword("None") {
                self.next();
                return Ok(Expr::IsNull(lhs, negated));
            }
            return Err(ExprError::UnexpectedToken("is".to_string()));
        }

        let op = match self.peek() {
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::EqEq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::Gt) => Some(CmpOp::Gt),
            _ => None,
        };

        if let Some(op) = op {
            self.next();
            let rhs = self.parse_operand()?;
            return Ok(Expr::Cmp(lhs, op, rhs));
        }

        Ok(Expr::Truthy(lhs))
    }

    fn parse_operand(&mut self) -> Result<Operand, ExprError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Operand::Lit(Value::Num(n))),
            Some(Token::Str(s)) => Ok(Operand::Lit(Value::Str(s))),
            Some(Token::Ident(s)) => match s.as_str() {
                "true" | "True" => Ok(Operand::Lit(Value::Bool(true))),
                "false" | "False" => Ok(Operand::Lit(Value::Bool(false))),
                "None" | "null" => Ok(Operand::Lit(Value::Null)),
                "and" | "or" | "not" | "is" => Err(ExprError::UnexpectedToken(s)),
                _ => Ok(Operand::Ident(s)),
            },
            Some(t) => Err(ExprError::UnexpectedToken(format!("{t:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

impl Expr {
    /// Parse and safety-check an expression. Called at rule load time so a
    /// bad rule file is rejected before it can replace a good snapshot.
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ExprError::UnexpectedEnd);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::UnexpectedToken(format!(
                "{:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }

    /// Evaluate against a lookup of identifier values. Unknown identifiers
    /// resolve to null; null never raises.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> Value) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(lookup) || b.eval(lookup),
            Expr::And(a, b) => a.eval(lookup) && b.eval(lookup),
            Expr::Not(inner) => !inner.eval(lookup),
            Expr::Truthy(op) => resolve(op, lookup).truthy(),
            Expr::IsNull(op, negated) => {
                let is_null = resolve(op, lookup) == Value::Null;
                is_null != *negated
            }
            Expr::Cmp(lhs, op, rhs) => compare(resolve(lhs, lookup), *op, resolve(rhs, lookup)),
        }
    }
}

fn resolve(op: &Operand, lookup: &dyn Fn(&str) -> Value) -> Value {
    match op {
        Operand::Lit(v) => v.clone(),
        Operand::Ident(name) => lookup(name),
    }
}

fn compare(lhs: Value, op: CmpOp, rhs: Value) -> bool {
    use CmpOp::*;
    // Null on either side never fires a rule.
    if lhs == Value::Null || rhs == Value::Null {
        return false;
    }
    match (&lhs, &rhs) {
        (Value::Num(a), Value::Num(b)) => match op {
            Lt => a < b,
            Le => a <= b,
            Eq => a == b,
            Ne => a != b,
            Ge => a >= b,
            Gt => a > b,
        },
        (Value::Str(a), Value::Str(b)) => match op {
            Lt => a < b,
            Le => a <= b,
            Eq => a == b,
            Ne => a != b,
            Ge => a >= b,
            Gt => a > b,
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            Eq => a == b,
            Ne => a != b,
            _ => false,
        },
        // Mixed types: only inequality holds.
        _ => matches!(op, Ne),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(pairs: &'a [(&'a str, Value)]) -> impl Fn(&str) -> Value + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null)
        }
    }

    #[test]
    fn comparisons_and_boolean_operators() {
        let e = Expr::parse("buy_tax >= 10 or sell_tax >= 10").unwrap();
        assert!(e.eval(&ctx(&[("buy_tax", Value::Num(12.0)), ("sell_tax", Value::Num(1.0))])));
        assert!(!e.eval(&ctx(&[("buy_tax", Value::Num(2.0)), ("sell_tax", Value::Num(2.0))])));
    }

    #[test]
    fn null_comparisons_are_false_not_errors() {
        let e = Expr::parse("buy_tax > 5").unwrap();
        assert!(!e.eval(&ctx(&[])));

        let e = Expr::parse("goplus_risk == 'red'").unwrap();
        assert!(!e.eval(&ctx(&[])));
        assert!(e.eval(&ctx(&[("goplus_risk", Value::Str("red".into()))])));
    }

    #[test]
    fn is_null_predicates() {
        let e = Expr::parse("dex_liquidity is null and dex_volume_1h is null").unwrap();
        assert!(e.eval(&ctx(&[])));
        assert!(!e.eval(&ctx(&[("dex_liquidity", Value::Num(100.0))])));

        let e = Expr::parse("goplus_risk is not null").unwrap();
        assert!(!e.eval(&ctx(&[])));
        assert!(e.eval(&ctx(&[("goplus_risk", Value::Str("green".into()))])));
    }

    #[test]
    fn not_and_parentheses() {
        let e = Expr::parse("not (heat_slope > 0 or last_sentiment_score > 0.5)").unwrap();
        assert!(e.eval(&ctx(&[("heat_slope", Value::Num(-1.0))])));
        assert!(!e.eval(&ctx(&[("heat_slope", Value::Num(1.0))])));
    }

    #[test]
    fn forbidden_constructs_rejected_at_parse() {
        assert!(Expr::parse("open('/etc/passwd')").is_err());
        assert!(Expr::parse("obj.attr == 1").is_err());
        assert!(Expr::parse("_secret > 0").is_err());
        assert!(Expr::parse("[x for x in y]").is_err());
        assert!(Expr::parse("lambda x: x").is_err());
        assert!(Expr::parse("import os").is_err());
    }

    #[test]
    fn negative_numbers_parse() {
        let e = Expr::parse("heat_slope <= -0.5").unwrap();
        assert!(e.eval(&ctx(&[("heat_slope", Value::Num(-1.0))])));
        assert!(!e.eval(&ctx(&[("heat_slope", Value::Num(0.0))])));
    }

    #[test]
    fn mixed_type_equality_is_false() {
        let e = Expr::parse("goplus_risk == 1").unwrap();
        assert!(!e.eval(&ctx(&[("goplus_risk", Value::Str("red".into()))])));
        let e = Expr::parse("goplus_risk != 1").unwrap();
        assert!(e.eval(&ctx(&[("goplus_risk", Value::Str("red".into()))])));
    }
}
