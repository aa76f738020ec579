//! Arithmetic expressions used for deferred knob definitions and element strengths.
//!
//! Grammar (lowest to highest precedence): `+ -`, `* /`, unary `-`/`+`, `^` (right
//! associative), atoms (numbers, identifiers, function calls, parenthesised expressions).
//! Identifiers are case-insensitive and stored lower-cased.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Speed of light in vacuum [m/s].
pub const CLIGHT: f64 = 299_792_458.0;
/// Proton rest energy [GeV].
pub const PMASS_GEV: f64 = 0.938_272_088_16;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {offset} in `{text}`")]
    UnexpectedChar {
        ch: char,
        offset: usize,
        text: String,
    },
    #[error("unexpected end of expression `{0}`")]
    UnexpectedEnd(String),
    #[error("unexpected token `{token}` in `{text}`")]
    UnexpectedToken { token: String, text: String },
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("function `{name}` takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("undefined variable `{0}`")]
    Undefined(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    fn precedence(self) -> u8 {
        match self {
            BinOp::Add | BinOp::Sub => 1,
            BinOp::Mul | BinOp::Div => 2,
            BinOp::Pow => 4,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => " + ",
            BinOp::Sub => " - ",
            BinOp::Mul => " * ",
            BinOp::Div => " / ",
            BinOp::Pow => "^",
        }
    }

    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinOp::Add => lhs + rhs,
            BinOp::Sub => lhs - rhs,
            BinOp::Mul => lhs * rhs,
            BinOp::Div => lhs / rhs,
            BinOp::Pow => lhs.powf(rhs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
    Log,
    Log10,
    Atan2,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "sqrt" => Func::Sqrt,
            "abs" => Func::Abs,
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "tan" => Func::Tan,
            "asin" => Func::Asin,
            "acos" => Func::Acos,
            "atan" => Func::Atan,
            "exp" => Func::Exp,
            "log" => Func::Log,
            "log10" => Func::Log10,
            "atan2" => Func::Atan2,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Func::Sqrt => "sqrt",
            Func::Abs => "abs",
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::Asin => "asin",
            Func::Acos => "acos",
            Func::Atan => "atan",
            Func::Exp => "exp",
            Func::Log => "log",
            Func::Log10 => "log10",
            Func::Atan2 => "atan2",
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::Atan2 => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        let a = args[0];
        match self {
            Func::Sqrt => a.sqrt(),
            Func::Abs => a.abs(),
            Func::Sin => a.sin(),
            Func::Cos => a.cos(),
            Func::Tan => a.tan(),
            Func::Asin => a.asin(),
            Func::Acos => a.acos(),
            Func::Atan => a.atan(),
            Func::Exp => a.exp(),
            Func::Log => a.ln(),
            Func::Log10 => a.log10(),
            Func::Atan2 => a.atan2(args[1]),
        }
    }
}

/// Built-in constants, resolved before any user lookup.
pub fn constant(name: &str) -> Option<f64> {
    match name {
        "pi" => Some(std::f64::consts::PI),
        "twopi" => Some(2.0 * std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        "clight" => Some(CLIGHT),
        "pmass" => Some(PMASS_GEV),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Expr {
    Number(f64),
    Var(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            text,
        };
        let expr = parser.expression()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(ExprError::UnexpectedToken {
                token: token.to_string(),
                text: text.to_string(),
            }),
        }
    }

    pub fn var(name: &str) -> Self {
        Expr::Var(name.to_ascii_lowercase())
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// `self * factor`, folded when `self` is a plain number.
    pub fn scaled(self, factor: f64) -> Self {
        match self {
            Expr::Number(v) => Expr::Number(v * factor),
            other if factor == 1.0 => other,
            other => Expr::binary(BinOp::Mul, other, Expr::Number(factor)),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn eval<F>(&self, lookup: &F) -> Result<f64, ExprError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        match self {
            Expr::Number(v) => Ok(*v),
            Expr::Var(name) => constant(name)
                .or_else(|| lookup(name))
                .ok_or_else(|| ExprError::Undefined(name.clone())),
            Expr::Neg(inner) => Ok(-inner.eval(lookup)?),
            Expr::Binary { op, lhs, rhs } => Ok(op.apply(lhs.eval(lookup)?, rhs.eval(lookup)?)),
            Expr::Call { func, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval(lookup))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(func.apply(&values))
            }
        }
    }

    /// Referenced variable names, excluding built-in constants.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Var(name) => {
                if constant(name).is_none() {
                    out.insert(name.clone());
                }
            }
            Expr::Neg(inner) => inner.collect_variables(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Neg(_) => 3,
            Expr::Number(v) if v.is_sign_negative() => 3,
            _ => 5,
        }
    }

    fn write_operand(&self, f: &mut fmt::Formatter<'_>, parens: bool) -> fmt::Result {
        if parens {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

fn write_number(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    let magnitude = v.abs();
    if v == 0.0 || (1e-5..1e16).contains(&magnitude) {
        write!(f, "{v}")
    } else {
        write!(f, "{v:e}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(v) => write_number(f, *v),
            Expr::Var(name) => f.write_str(name),
            Expr::Neg(inner) => {
                f.write_str("-")?;
                inner.write_operand(f, inner.precedence() < 3)
            }
            Expr::Binary { op, lhs, rhs } => {
                let p = op.precedence();
                let lhs_parens = match op {
                    BinOp::Pow => lhs.precedence() <= p,
                    _ => lhs.precedence() < p,
                };
                let rhs_parens = match op {
                    BinOp::Pow => rhs.precedence() < 3,
                    _ => rhs.precedence() <= p,
                };
                lhs.write_operand(f, lhs_parens)?;
                f.write_str(op.symbol())?;
                rhs.write_operand(f, rhs_parens)
            }
            Expr::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl FromStr for Expr {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expr::parse(s)
    }
}

impl TryFrom<String> for Expr {
    type Error = ExprError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Expr::parse(&value)
    }
}

impl From<Expr> for String {
    fn from(value: Expr) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(v) => write!(f, "{v}"),
            Token::Ident(name) => f.write_str(name),
            Token::Op(c) => write!(f, "{c}"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$'
}

fn tokenize(text: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse::<f64>()
                .map_err(|_| ExprError::InvalidNumber(literal.clone()))?;
            tokens.push(Token::Number(value));
        } else if is_ident_start(c) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            tokens.push(Token::Ident(ident.to_ascii_lowercase()));
        } else {
            let token = match c {
                '+' | '-' | '*' | '/' | '^' => Token::Op(c),
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                _ => {
                    return Err(ExprError::UnexpectedChar {
                        ch: c,
                        offset: i,
                        text: text.to_string(),
                    })
                }
            };
            tokens.push(token);
            i += 1;
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    text: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&'a Token, ExprError> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| ExprError::UnexpectedEnd(self.text.to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self, token: &Token) -> ExprError {
        ExprError::UnexpectedToken {
            token: token.to_string(),
            text: self.text.to_string(),
        }
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            self.pos += 1;
            let op = if *c == '+' { BinOp::Add } else { BinOp::Sub };
            let rhs = self.term()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/'))) = self.peek() {
            self.pos += 1;
            let op = if *c == '*' { BinOp::Mul } else { BinOp::Div };
            let rhs = self.unary()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.atom()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        let token = self.next()?;
        match token {
            Token::Number(v) => Ok(Expr::Number(*v)),
            Token::Ident(name) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let func = Func::lookup(name)
                        .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                    let args = self.arguments()?;
                    if args.len() != func.arity() {
                        return Err(ExprError::Arity {
                            name: name.clone(),
                            expected: func.arity(),
                            got: args.len(),
                        });
                    }
                    Ok(Expr::Call { func, args })
                } else {
                    Ok(Expr::Var(name.clone()))
                }
            }
            Token::LParen => {
                let inner = self.expression()?;
                match self.next()? {
                    Token::RParen => Ok(inner),
                    other => Err(self.unexpected(other)),
                }
            }
            other => Err(self.unexpected(other)),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            match self.next()? {
                Token::Comma => continue,
                Token::RParen => return Ok(args),
                other => return Err(self.unexpected(other)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars(_: &str) -> Option<f64> {
        None
    }

    #[test]
    fn precedence_and_associativity() {
        let e = Expr::parse("1 + 2 * 3 ^ 2 - 8 / 4 / 2").unwrap();
        assert!((e.eval(&no_vars).unwrap() - 18.0).abs() < 1e-12);
        let p = Expr::parse("2 ^ 3 ^ 2").unwrap();
        assert!((p.eval(&no_vars).unwrap() - 512.0).abs() < 1e-9);
        let n = Expr::parse("-2 ^ 2").unwrap();
        assert!((n.eval(&no_vars).unwrap() + 4.0).abs() < 1e-12);
    }

    #[test]
    fn identifiers_are_lowercased_and_dotted() {
        let e = Expr::parse("KQF0.B1 + 0.5 * DQX.B1_OP").unwrap();
        let vars: Vec<_> = e.variables().into_iter().collect();
        assert_eq!(vars, vec!["dqx.b1_op".to_string(), "kqf0.b1".to_string()]);
        let value = e
            .eval(&|name: &str| match name {
                "kqf0.b1" => Some(1.0),
                "dqx.b1_op" => Some(4.0),
                _ => None,
            })
            .unwrap();
        assert!((value - 3.0).abs() < 1e-12);
    }

    #[test]
    fn constants_and_functions() {
        let e = Expr::parse("sqrt(4) + cos(0) + twopi / pi + atan2(0, 1)").unwrap();
        assert!((e.eval(&no_vars).unwrap() - 5.0).abs() < 1e-12);
        assert!(e.variables().is_empty());
    }

    #[test]
    fn display_reparses_to_same_value() {
        let lookup = |name: &str| match name {
            "a" => Some(1.7),
            "b" => Some(-0.3),
            "c" => Some(2.5e-9),
            _ => None,
        };
        for text in [
            "a - (b - c)",
            "a / (b * c)",
            "-(a + b) ^ 2",
            "(a ^ b) ^ c",
            "a ^ -b",
            "1e-8 * a + 3.25e20",
            "sqrt(abs(b)) * (a + 1)",
        ] {
            let e = Expr::parse(text).unwrap();
            let printed = e.to_string();
            let again = Expr::parse(&printed).unwrap();
            assert_eq!(
                e.eval(&lookup).unwrap().to_bits(),
                again.eval(&lookup).unwrap().to_bits(),
                "{text} -> {printed}"
            );
            assert_eq!(e, again, "{text} -> {printed}");
        }
    }

    #[test]
    fn undefined_variable_is_reported() {
        let e = Expr::parse("x + 1").unwrap();
        assert_eq!(e.eval(&no_vars), Err(ExprError::Undefined("x".into())));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(Expr::parse("1 +"), Err(ExprError::UnexpectedEnd(_))));
        assert!(matches!(Expr::parse("(1"), Err(ExprError::UnexpectedEnd(_))));
        assert!(matches!(Expr::parse("1 # 2"), Err(ExprError::UnexpectedChar { .. })));
        assert!(matches!(Expr::parse("foo(1)"), Err(ExprError::UnknownFunction(_))));
        assert!(matches!(Expr::parse("sqrt(1, 2)"), Err(ExprError::Arity { .. })));
        assert!(matches!(Expr::parse("1 2"), Err(ExprError::UnexpectedToken { .. })));
    }

    #[test]
    fn scaled_folds_numbers() {
        assert_eq!(Expr::Number(2.0).scaled(3.0), Expr::Number(6.0));
        let e = Expr::var("k").scaled(3.1);
        assert!((e.eval(&|_: &str| Some(2.0)).unwrap() - 6.2).abs() < 1e-12);
    }

    #[test]
    fn serde_uses_text_form() {
        let e = Expr::parse("kqf0.b1 + 0.1 * dqx.b1_op").unwrap();
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, "\"kqf0.b1 + 0.1 * dqx.b1_op\"");
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
