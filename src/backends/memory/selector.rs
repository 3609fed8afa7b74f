//! Subset of the JMS selector language evaluated by the in-memory broker.
//!
//! Supports comparisons (`=`, `<>`, `!=`, `<`, `<=`, `>`, `>=`) between an
//! identifier and a string, numeric or boolean literal, `IS [NOT] NULL`,
//! `AND`, `OR`, `NOT` and parentheses. `JMSMessageID`, `JMSCorrelationID`,
//! `JMSReplyTo`, `JMSType` and `JMSPriority` read message headers; every other
//! identifier reads an application property.

use crate::backends::{BackendError, Result};
use crate::message::Message;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(&'static str),
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Compare {
        ident: String,
        op: &'static str,
        literal: Literal,
    },
    IsNull {
        ident: String,
        negated: bool,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// Parsed selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    expr: Expr,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(input, "unexpected trailing input"));
        }
        Ok(Self { expr })
    }

    pub fn matches(&self, message: &Message) -> bool {
        eval(&self.expr, message)
    }
}

fn invalid(input: &str, reason: &str) -> BackendError {
    BackendError::Config(format!("Invalid selector '{}': {}", input, reason))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid(input, "unterminated string")),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '=' => {
                tokens.push(Token::Op("="));
                i += 1;
            }
            '<' | '>' | '!' => {
                let next = chars.get(i + 1).copied();
                let op = match (c, next) {
                    ('<', Some('>')) | ('!', Some('=')) => "<>",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    _ => return Err(invalid(input, "unexpected '!'")),
                };
                i += if op.len() == 2 { 2 } else { 1 };
                tokens.push(Token::Op(op));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| invalid(input, "malformed number"))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '$'
                        || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(invalid(input, &format!("unexpected character '{}'", c))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(
            self.tokens.get(self.pos),
            Some(Token::Ident(w)) if w.eq_ignore_ascii_case(keyword)
        )
    }

    fn error(&self, reason: &str) -> BackendError {
        BackendError::Config(format!("Invalid selector: {} at token {}", reason, self.pos))
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.peek_keyword("OR") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while self.peek_keyword("AND") {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek_keyword("NOT") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.tokens.get(self.pos) == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or_expr()?;
            if self.tokens.get(self.pos) != Some(&Token::RParen) {
                return Err(self.error("missing ')'"));
            }
            self.pos += 1;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let ident = match self.tokens.get(self.pos) {
            Some(Token::Ident(name)) => name.clone(),
            _ => return Err(self.error("expected identifier")),
        };
        self.pos += 1;

        if self.peek_keyword("IS") {
            self.pos += 1;
            let negated = self.peek_keyword("NOT");
            if negated {
                self.pos += 1;
            }
            if !self.peek_keyword("NULL") {
                return Err(self.error("expected NULL"));
            }
            self.pos += 1;
            return Ok(Expr::IsNull { ident, negated });
        }

        let op = match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => *op,
            _ => return Err(self.error("expected comparison operator")),
        };
        self.pos += 1;

        let literal = match self.tokens.get(self.pos) {
            Some(Token::Str(s)) => Literal::Str(s.clone()),
            Some(Token::Num(n)) => Literal::Num(*n),
            Some(Token::Ident(w)) if w.eq_ignore_ascii_case("TRUE") => Literal::Bool(true),
            Some(Token::Ident(w)) if w.eq_ignore_ascii_case("FALSE") => Literal::Bool(false),
            _ => return Err(self.error("expected literal")),
        };
        self.pos += 1;

        Ok(Expr::Compare { ident, op, literal })
    }
}

fn lookup(ident: &str, message: &Message) -> Option<String> {
    match ident {
        "JMSMessageID" => message.message_id.clone(),
        "JMSCorrelationID" => message.correlation_id.clone(),
        "JMSReplyTo" => message.reply_to.clone(),
        "JMSType" => message.content_type.clone(),
        "JMSPriority" => Some(message.effective_priority().to_string()),
        _ => message.properties.get(ident).map(|v| v.to_string()),
    }
}

fn eval(expr: &Expr, message: &Message) -> bool {
    match expr {
        Expr::And(a, b) => eval(a, message) && eval(b, message),
        Expr::Or(a, b) => eval(a, message) || eval(b, message),
        Expr::Not(inner) => !eval(inner, message),
        Expr::IsNull { ident, negated } => lookup(ident, message).is_none() != *negated,
        Expr::Compare { ident, op, literal } => {
            let Some(value) = lookup(ident, message) else {
                return false;
            };
            let ordering = match literal {
                Literal::Str(s) => value.as_str().partial_cmp(s.as_str()),
                Literal::Num(n) => value.parse::<f64>().ok().and_then(|v| v.partial_cmp(n)),
                // Booleans only support equality.
                Literal::Bool(b) if value.eq_ignore_ascii_case(&b.to_string()) => {
                    Some(std::cmp::Ordering::Equal)
                }
                Literal::Bool(_) => Some(std::cmp::Ordering::Less),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match *op {
                "=" => ordering.is_eq(),
                "<>" => ordering.is_ne(),
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PropertyValue;

    fn message_with(props: &[(&str, PropertyValue)]) -> Message {
        let mut message = Message::new("x");
        for (k, v) in props {
            message.properties.insert(k.to_string(), v.clone());
        }
        message
    }

    #[test]
    fn test_string_equality() {
        let selector = Selector::parse("color = 'red'").unwrap();
        assert!(selector.matches(&message_with(&[("color", "red".into())])));
        assert!(!selector.matches(&message_with(&[("color", "blue".into())])));
        assert!(!selector.matches(&message_with(&[])));
    }

    #[test]
    fn test_numeric_comparison_on_stringified_values() {
        let selector = Selector::parse("weight >= 10").unwrap();
        assert!(selector.matches(&message_with(&[("weight", PropertyValue::Int(12))])));
        assert!(selector.matches(&message_with(&[("weight", "10".into())])));
        assert!(!selector.matches(&message_with(&[("weight", PropertyValue::Int(3))])));
    }

    #[test]
    fn test_boolean_logic_and_parentheses() {
        let selector =
            Selector::parse("(color = 'red' OR color = 'blue') AND NOT size = 'xl'").unwrap();
        assert!(selector.matches(&message_with(&[("color", "blue".into()), ("size", "m".into())])));
        assert!(!selector.matches(&message_with(&[
            ("color", "blue".into()),
            ("size", "xl".into())
        ])));
        assert!(!selector.matches(&message_with(&[("color", "green".into())])));
    }

    #[test]
    fn test_headers_and_null_checks() {
        let mut message = Message::new("x");
        message.correlation_id = Some("c-1".to_string());
        assert!(Selector::parse("JMSCorrelationID = 'c-1'").unwrap().matches(&message));
        assert!(Selector::parse("JMSMessageID IS NULL").unwrap().matches(&message));
        assert!(Selector::parse("JMSCorrelationID IS NOT NULL").unwrap().matches(&message));
    }

    #[test]
    fn test_quote_escape() {
        let selector = Selector::parse("name = 'o''brien'").unwrap();
        assert!(selector.matches(&message_with(&[("name", "o'brien".into())])));
    }

    #[test]
    fn test_invalid_selectors() {
        assert!(Selector::parse("color =").is_err());
        assert!(Selector::parse("color = 'red").is_err());
        assert!(Selector::parse("(a = 1").is_err());
        assert!(Selector::parse("a = 1 b").is_err());
    }
}
