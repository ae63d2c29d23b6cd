//! `WHERE` evaluation for the in-memory database.
//!
//! Supports comparisons (`= != <> < > <= >=`), `IS [NOT] NULL`,
//! `[NOT] IN (...)`, `AND`/`OR`/`NOT`, parentheses, `?` parameters,
//! column-to-column comparisons, and a trailing `ORDER BY`.

use std::cmp::Ordering;

use crate::bind::Bind;
use crate::storage::{DatabaseError, Result, ER_BAD_FIELD};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    Param,
    Op(String),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone)]
enum Operand {
    Column(String),
    Literal(Option<String>),
}

#[derive(Debug, Clone)]
enum Cond {
    Compare(Operand, String, Operand),
    IsNull(Operand, bool),
    In(Operand, Vec<Operand>, bool),
    Truthy(Operand),
    Not(Box<Cond>),
    And(Vec<Cond>),
    Or(Vec<Cond>),
}

/// A compiled filter with its sort order.
#[derive(Debug, Clone)]
pub(crate) struct Filter {
    cond: Cond,
    order: Vec<(String, bool)>,
}

impl Filter {
    pub(crate) fn compile(query: &str, params: &[Option<String>]) -> Result<Self> {
        let tokens = tokenize(query)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            params: params.iter(),
        };
        let cond = if parser.peek_keyword("ORDER") || parser.at_end() {
            Cond::Truthy(Operand::Literal(Some("1".to_string())))
        } else {
            parser.parse_or()?
        };
        let order = parser.parse_order_by()?;
        if !parser.at_end() {
            return Err(unsupported(query));
        }
        Ok(Self { cond, order })
    }

    pub(crate) fn matches(&self, row: &Bind) -> Result<bool> {
        eval(&self.cond, row)
    }

    pub(crate) fn has_order(&self) -> bool {
        !self.order.is_empty()
    }

    pub(crate) fn sort(&self, rows: &mut [Bind]) {
        if self.order.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            for (column, ascending) in &self.order {
                let ord = compare_values(a.value(column), b.value(column));
                let ord = if *ascending { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
}

fn unsupported(query: &str) -> DatabaseError {
    DatabaseError::Unsupported(format!("filter: {}", query))
}

fn tokenize(query: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = query.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
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
            '?' => {
                tokens.push(Token::Param);
                i += 1;
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .ok_or_else(|| unsupported(query))?;
                tokens.push(Token::Ident(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '\'' | '"' => {
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(unsupported(query)),
                        Some(&ch) if ch == c => {
                            if chars.get(j + 1) == Some(&c) {
                                value.push(c);
                                j += 2;
                            } else {
                                break;
                            }
                        }
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(j + 1) {
                                value.push(escaped);
                            }
                            j += 2;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            j += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
                i = j + 1;
            }
            '=' | '<' | '>' | '!' => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                if matches!(two.as_str(), "<=" | ">=" | "<>" | "!=") {
                    tokens.push(Token::Op(two));
                    i += 2;
                } else if c == '!' {
                    return Err(unsupported(query));
                } else {
                    tokens.push(Token::Op(c.to_string()));
                    i += 1;
                }
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Num(chars[start..i].iter().collect()));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(unsupported(query)),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: std::slice::Iter<'a, Option<String>>,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| DatabaseError::Unsupported("unexpected end of filter".to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(DatabaseError::Unsupported(format!(
                "expected {:?}, found {:?}",
                expected, token
            )))
        }
    }

    fn parse_or(&mut self) -> Result<Cond> {
        let mut parts = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Cond::Or(parts)
        })
    }

    fn parse_and(&mut self) -> Result<Cond> {
        let mut parts = vec![self.parse_unary()?];
        while self.eat_keyword("AND") {
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Cond::And(parts)
        })
    }

    fn parse_unary(&mut self) -> Result<Cond> {
        if self.eat_keyword("NOT") {
            return Ok(Cond::Not(Box::new(self.parse_unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        let left = self.parse_operand()?;
        match self.peek().cloned() {
            Some(Token::Op(op)) => {
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Cond::Compare(left, op, right))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("IS") => {
                self.pos += 1;
                let negate = self.eat_keyword("NOT");
                if !self.eat_keyword("NULL") {
                    return Err(DatabaseError::Unsupported("expected NULL after IS".to_string()));
                }
                Ok(Cond::IsNull(left, negate))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("IN") || word.eq_ignore_ascii_case("NOT") => {
                let negate = self.eat_keyword("NOT");
                if !self.eat_keyword("IN") {
                    return Err(DatabaseError::Unsupported("expected IN".to_string()));
                }
                self.expect(Token::LParen)?;
                let mut list = vec![self.parse_operand()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    list.push(self.parse_operand()?);
                }
                self.expect(Token::RParen)?;
                Ok(Cond::In(left, list, negate))
            }
            _ => Ok(Cond::Truthy(left)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.next()? {
            Token::Param => {
                let value = self
                    .params
                    .next()
                    .ok_or_else(|| DatabaseError::Unsupported("missing filter parameter".to_string()))?;
                Ok(Operand::Literal(value.clone()))
            }
            Token::Str(s) | Token::Num(s) => Ok(Operand::Literal(Some(s))),
            Token::Ident(word) if word.eq_ignore_ascii_case("NULL") => Ok(Operand::Literal(None)),
            Token::Ident(word) if word.eq_ignore_ascii_case("TRUE") => Ok(Operand::Literal(Some("1".to_string()))),
            Token::Ident(word) if word.eq_ignore_ascii_case("FALSE") => {
                Ok(Operand::Literal(Some("0".to_string())))
            }
            Token::Ident(word) => Ok(Operand::Column(word.rsplit('.').next().unwrap_or(&word).to_string())),
            other => Err(DatabaseError::Unsupported(format!("unexpected {:?}", other))),
        }
    }

    fn parse_order_by(&mut self) -> Result<Vec<(String, bool)>> {
        let mut order = Vec::new();
        if !self.eat_keyword("ORDER") {
            return Ok(order);
        }
        if !self.eat_keyword("BY") {
            return Err(DatabaseError::Unsupported("expected BY".to_string()));
        }
        loop {
            let column = match self.next()? {
                Token::Ident(name) => name,
                other => return Err(DatabaseError::Unsupported(format!("unexpected {:?}", other))),
            };
            let ascending = if self.eat_keyword("DESC") {
                false
            } else {
                self.eat_keyword("ASC");
                true
            };
            order.push((column, ascending));
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(order)
    }
}

fn resolve<'r>(operand: &'r Operand, row: &'r Bind) -> Result<Option<&'r str>> {
    match operand {
        Operand::Literal(value) => Ok(value.as_deref()),
        Operand::Column(name) => match row.get(name) {
            Some(value) => Ok(value.as_deref()),
            None => Err(DatabaseError::server(
                ER_BAD_FIELD,
                format!("Unknown column '{}' in 'where clause'", name),
            )),
        },
    }
}

fn compare_values(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.cmp(b),
        },
    }
}

fn eval(cond: &Cond, row: &Bind) -> Result<bool> {
    Ok(match cond {
        Cond::Compare(left, op, right) => {
            let (Some(a), Some(b)) = (resolve(left, row)?, resolve(right, row)?) else {
                return Ok(false);
            };
            let ord = compare_values(Some(a), Some(b));
            match op.as_str() {
                "=" => ord == Ordering::Equal,
                "!=" | "<>" => ord != Ordering::Equal,
                "<" => ord == Ordering::Less,
                ">" => ord == Ordering::Greater,
                "<=" => ord != Ordering::Greater,
                ">=" => ord != Ordering::Less,
                other => return Err(DatabaseError::Unsupported(format!("operator {}", other))),
            }
        }
        Cond::IsNull(operand, negate) => resolve(operand, row)?.is_none() != *negate,
        Cond::In(operand, list, negate) => {
            let Some(value) = resolve(operand, row)? else {
                return Ok(false);
            };
            let mut found = false;
            for candidate in list {
                if let Some(c) = resolve(candidate, row)? {
                    if compare_values(Some(value), Some(c)) == Ordering::Equal {
                        found = true;
                        break;
                    }
                }
            }
            found != *negate
        }
        Cond::Truthy(operand) => match resolve(operand, row)? {
            None => false,
            Some(v) => v.parse::<f64>().map_or(!v.is_empty(), |n| n != 0.0),
        },
        Cond::Not(inner) => !eval(inner, row)?,
        Cond::And(parts) => {
            for part in parts {
                if !eval(part, row)? {
                    return Ok(false);
                }
            }
            true
        }
        Cond::Or(parts) => {
            for part in parts {
                if eval(part, row)? {
                    return Ok(true);
                }
            }
            false
        }
    })
}
