// Boolean filter predicates evaluated during topic fan-out. The grammar is
// a small SQL-flavoured subset over property names and the fixed header
// fields `priority`, `message_id`, `timestamp`, and `durable`:
//
//   expr     := term (OR term)*
//   term     := factor (AND factor)*
//   factor   := NOT factor | comparison
//   compare  := operand ((= | <> | < | <= | > | >=) operand
//                | IS NULL | IS NOT NULL)?
//   operand  := '(' expr ')' | literal | identifier
//
// Comparisons involving null (or mismatched kinds) are unknown, and a
// message matches only when the whole expression is definitely true.
use crate::{Message, MessageError, PropertyValue, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Long(i64),
    Double(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Operand),
    Ident(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    IsNull { operand: Box<Expr>, negated: bool },
}

/// Compiled message selector.
///
/// ```
/// use bytes::Bytes;
/// use courier_common::ids::MessageId;
/// use courier_message::{MessageBuilder, PropertyValue, Selector};
///
/// let selector = Selector::parse("priority > 5 AND region = 'emea'").expect("parse");
/// let message = MessageBuilder::new(Bytes::new())
///     .priority(8)
///     .property("region", PropertyValue::Str("emea".into()))
///     .finish(MessageId::from_raw(1), 0);
/// assert!(selector.eval(&message));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    text: String,
    root: Expr,
}

impl Selector {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some((pos, _)) = parser.peek() {
            return Err(err(*pos, "trailing input after expression"));
        }
        Ok(Self {
            text: text.to_string(),
            root,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// True only when the predicate is definitely true for this message.
    pub fn eval(&self, message: &Message) -> bool {
        truth(&self.root, message) == Some(true)
    }
}

fn err(pos: usize, reason: impl Into<String>) -> MessageError {
    MessageError::Selector {
        pos,
        reason: reason.into(),
    }
}

// ---- tokenizer ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Long(i64),
    Double(f64),
    Str(String),
    And,
    Or,
    Not,
    Is,
    Null,
    True,
    False,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        match c {
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            '=' => {
                tokens.push((start, Token::Eq));
                i += 1;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'>') {
                    tokens.push((start, Token::Ne));
                    i += 2;
                } else if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((start, Token::Le));
                    i += 2;
                } else {
                    tokens.push((start, Token::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((start, Token::Ge));
                    i += 2;
                } else {
                    tokens.push((start, Token::Gt));
                    i += 1;
                }
            }
            '\'' => {
                // Single-quoted string; '' escapes a quote.
                let mut value = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(err(start, "unterminated string literal")),
                        Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some(b'\'') => {
                            i += 1;
                            break;
                        }
                        Some(_) => {
                            let ch_start = i;
                            while i < bytes.len() && bytes[i] != b'\'' {
                                i += 1;
                            }
                            value.push_str(
                                std::str::from_utf8(&bytes[ch_start..i])
                                    .map_err(|_| err(ch_start, "invalid utf-8 in string"))?,
                            );
                        }
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            _ if c.is_ascii_digit() => {
                let mut is_double = false;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    if bytes[i] == b'.' {
                        is_double = true;
                    }
                    i += 1;
                }
                let raw = &text[start..i];
                if is_double {
                    let value = raw
                        .parse::<f64>()
                        .map_err(|_| err(start, format!("bad number {raw}")))?;
                    tokens.push((start, Token::Double(value)));
                } else {
                    let value = raw
                        .parse::<i64>()
                        .map_err(|_| err(start, format!("bad number {raw}")))?;
                    tokens.push((start, Token::Long(value)));
                }
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let word = &text[start..i];
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((start, token));
            }
            _ => return Err(err(start, format!("unexpected character {c:?}"))),
        }
    }
    Ok(tokens)
}

// ---- parser ---------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if let Some((_, token)) = self.peek() {
            if token == expected {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        while self.eat(&Token::Or) {
            let right = self.term()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.factor()?;
        while self.eat(&Token::And) {
            let right = self.factor()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            let inner = self.factor()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.operand()?;
        if self.eat(&Token::Is) {
            let negated = self.eat(&Token::Not);
            let pos = self.peek().map(|(p, _)| *p).unwrap_or_default();
            if !self.eat(&Token::Null) {
                return Err(err(pos, "expected NULL after IS"));
            }
            return Ok(Expr::IsNull {
                operand: Box::new(left),
                negated,
            });
        }
        let op = match self.peek() {
            Some((_, Token::Eq)) => Some(CmpOp::Eq),
            Some((_, Token::Ne)) => Some(CmpOp::Ne),
            Some((_, Token::Lt)) => Some(CmpOp::Lt),
            Some((_, Token::Le)) => Some(CmpOp::Le),
            Some((_, Token::Gt)) => Some(CmpOp::Gt),
            Some((_, Token::Ge)) => Some(CmpOp::Ge),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let right = self.operand()?;
                Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn operand(&mut self) -> Result<Expr> {
        match self.next() {
            Some((_, Token::LParen)) => {
                let inner = self.expr()?;
                let pos = self.peek().map(|(p, _)| *p).unwrap_or_default();
                if !self.eat(&Token::RParen) {
                    return Err(err(pos, "expected closing parenthesis"));
                }
                Ok(inner)
            }
            Some((_, Token::Ident(name))) => Ok(Expr::Ident(name)),
            Some((_, Token::Long(v))) => Ok(Expr::Literal(Operand::Long(v))),
            Some((_, Token::Double(v))) => Ok(Expr::Literal(Operand::Double(v))),
            Some((_, Token::Str(v))) => Ok(Expr::Literal(Operand::Str(v))),
            Some((_, Token::True)) => Ok(Expr::Literal(Operand::Bool(true))),
            Some((_, Token::False)) => Ok(Expr::Literal(Operand::Bool(false))),
            Some((_, Token::Null)) => Ok(Expr::Literal(Operand::Null)),
            Some((pos, token)) => Err(err(pos, format!("unexpected token {token:?}"))),
            None => Err(err(0, "unexpected end of expression")),
        }
    }
}

// ---- evaluation -----------------------------------------------------------

// Headers are addressed by fixed lowercase names; anything else is a
// property lookup. Unknown names resolve to null so selectors never fail
// at delivery time.
fn resolve(expr: &Expr, message: &Message) -> Operand {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Ident(name) => match name.as_str() {
            "priority" => Operand::Long(i64::from(message.priority())),
            "message_id" => Operand::Long(message.id().as_u64() as i64),
            "timestamp" => Operand::Long(message.timestamp() as i64),
            "durable" => Operand::Bool(message.durable()),
            _ => match message.properties().get_object(name) {
                Some(PropertyValue::Bool(v)) => Operand::Bool(*v),
                Some(PropertyValue::Byte(v)) => Operand::Long(i64::from(*v)),
                Some(PropertyValue::Short(v)) => Operand::Long(i64::from(*v)),
                Some(PropertyValue::Int(v)) => Operand::Long(i64::from(*v)),
                Some(PropertyValue::Long(v)) => Operand::Long(*v),
                Some(PropertyValue::Float(v)) => Operand::Double(f64::from(*v)),
                Some(PropertyValue::Double(v)) => Operand::Double(*v),
                Some(PropertyValue::Str(v)) => Operand::Str(v.clone()),
                Some(PropertyValue::Bytes(_)) | Some(PropertyValue::Null) | None => Operand::Null,
            },
        },
        // Nested boolean expressions fold to a boolean operand.
        other => match truth(other, message) {
            Some(v) => Operand::Bool(v),
            None => Operand::Null,
        },
    }
}

fn compare(op: CmpOp, left: &Operand, right: &Operand) -> Option<bool> {
    use Operand::*;
    let ordering = match (left, right) {
        (Null, _) | (_, Null) => return None,
        (Long(a), Long(b)) => a.partial_cmp(b)?,
        (Long(a), Double(b)) => (*a as f64).partial_cmp(b)?,
        (Double(a), Long(b)) => a.partial_cmp(&(*b as f64))?,
        (Double(a), Double(b)) => a.partial_cmp(b)?,
        // Strings and booleans support equality only.
        (Str(a), Str(b)) => {
            return match op {
                CmpOp::Eq => Some(a == b),
                CmpOp::Ne => Some(a != b),
                _ => None,
            };
        }
        (Bool(a), Bool(b)) => {
            return match op {
                CmpOp::Eq => Some(a == b),
                CmpOp::Ne => Some(a != b),
                _ => None,
            };
        }
        _ => return None,
    };
    Some(match op {
        CmpOp::Eq => ordering.is_eq(),
        CmpOp::Ne => !ordering.is_eq(),
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
    })
}

// Three-valued logic: None is "unknown", and unknown propagates the way
// SQL does so that null-valued properties never satisfy a comparison.
fn truth(expr: &Expr, message: &Message) -> Option<bool> {
    match expr {
        Expr::Not(inner) => truth(inner, message).map(|v| !v),
        Expr::And(left, right) => match (truth(left, message), truth(right, message)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Expr::Or(left, right) => match (truth(left, message), truth(right, message)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        Expr::Cmp(op, left, right) => {
            let left = resolve(left, message);
            let right = resolve(right, message);
            compare(*op, &left, &right)
        }
        Expr::IsNull { operand, negated } => {
            let is_null = resolve(operand, message) == Operand::Null;
            Some(is_null != *negated)
        }
        Expr::Literal(Operand::Bool(v)) => Some(*v),
        Expr::Literal(Operand::Null) => None,
        Expr::Literal(_) => None,
        Expr::Ident(_) => match resolve(expr, message) {
            Operand::Bool(v) => Some(v),
            _ => None,
        },
    }
}
