//! Recognizer for single-table filtered reads.
//!
//! Backends without a raw SQL endpoint can only serve statements of the form
//!
//! ```text
//! SELECT <cols|*> FROM <table>
//!   [WHERE <col> <op> <value> [AND ...]]
//!   [ORDER BY <col> [ASC|DESC][, ...]]
//!   [LIMIT n] [OFFSET m]
//! ```
//!
//! Anything else is rejected here and left to the adapter's escape hatch.

use serde_json::{Number, Value};

/// Comparison supported in a simple WHERE clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    ILike,
    IsNull,
    IsNotNull,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    /// `Null` for the IS [NOT] NULL forms, an array for IN
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleSelect {
    pub table: String,
    /// Empty means all columns
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Quoted(String),
    Str(String),
    Num(Number),
    Placeholder,
    Symbol(&'static str),
}

impl Token {
    fn keyword(&self) -> Option<String> {
        match self {
            Token::Ident(s) => Some(s.to_ascii_uppercase()),
            _ => None,
        }
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Ident(s) if s.eq_ignore_ascii_case(kw))
    }
}

const RESERVED: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "ORDER", "BY", "LIMIT", "OFFSET", "GROUP",
    "HAVING", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "ON", "UNION", "DISTINCT", "AS",
    "IN", "IS", "NULL", "LIKE", "ILIKE", "ASC", "DESC", "TRUE", "FALSE",
];

fn tokenize(sql: &str) -> Option<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
        } else if (c == '-' && next == Some('-')) || (c == '/' && next == Some('*')) {
            return None;
        } else if c == '\'' {
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        s.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                    None => return None,
                }
            }
            tokens.push(Token::Str(s));
        } else if c == '"' || c == '`' {
            let close = c;
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    Some(ch) if *ch == close => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                    None => return None,
                }
            }
            tokens.push(Token::Quoted(s));
        } else if c.is_ascii_digit() || (c == '-' && next.map_or(false, |n| n.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len()
                && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e' || chars[i] == 'E')
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Num(parse_number(&text)?));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c == '?' {
            tokens.push(Token::Placeholder);
            i += 1;
        } else {
            let (symbol, width) = match (c, next) {
                ('!', Some('=')) => ("!=", 2),
                ('<', Some('>')) => ("!=", 2),
                ('<', Some('=')) => ("<=", 2),
                ('>', Some('=')) => (">=", 2),
                ('<', _) => ("<", 1),
                ('>', _) => (">", 1),
                ('=', _) => ("=", 1),
                (',', _) => (",", 1),
                ('*', _) => ("*", 1),
                ('(', _) => ("(", 1),
                (')', _) => (")", 1),
                (';', _) => (";", 1),
                _ => return None,
            };
            tokens.push(Token::Symbol(symbol));
            i += width;
        }
    }

    Some(tokens)
}

fn parse_number(text: &str) -> Option<Number> {
    if text.contains(['.', 'e', 'E']) {
        text.parse::<f64>().ok().and_then(Number::from_f64)
    } else {
        text.parse::<i64>().ok().map(Number::from)
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: std::slice::Iter<'a, Value>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek().map_or(false, |t| t.is_keyword(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn identifier(&mut self) -> Option<String> {
        match self.bump()? {
            Token::Ident(name) if !RESERVED.contains(&name.to_ascii_uppercase().as_str()) => {
                Some(name)
            }
            Token::Quoted(name) if !name.is_empty() => Some(name),
            _ => None,
        }
    }

    fn value(&mut self) -> Option<Value> {
        match self.bump()? {
            Token::Str(s) => Some(Value::String(s)),
            Token::Num(n) => Some(Value::Number(n)),
            Token::Placeholder => self.params.next().cloned(),
            token => match token.keyword()?.as_str() {
                "TRUE" => Some(Value::Bool(true)),
                "FALSE" => Some(Value::Bool(false)),
                "NULL" => Some(Value::Null),
                _ => None,
            },
        }
    }

    fn count(&mut self) -> Option<u64> {
        self.value()?.as_u64()
    }

    fn filter(&mut self) -> Option<Filter> {
        let column = self.identifier()?;
        let token = self.bump()?;
        let (op, value) = match token {
            Token::Symbol(symbol) => {
                let op = match symbol {
                    "=" => FilterOp::Eq,
                    "!=" => FilterOp::Ne,
                    "<" => FilterOp::Lt,
                    "<=" => FilterOp::Le,
                    ">" => FilterOp::Gt,
                    ">=" => FilterOp::Ge,
                    _ => return None,
                };
                (op, self.value()?)
            }
            token => match token.keyword()?.as_str() {
                "LIKE" => (FilterOp::Like, Value::String(self.value()?.as_str()?.to_string())),
                "ILIKE" => (FilterOp::ILike, Value::String(self.value()?.as_str()?.to_string())),
                "IS" => {
                    let negated = self.eat_keyword("NOT");
                    if !self.eat_keyword("NULL") {
                        return None;
                    }
                    let op = if negated {
                        FilterOp::IsNotNull
                    } else {
                        FilterOp::IsNull
                    };
                    (op, Value::Null)
                }
                "IN" => {
                    if !self.eat_symbol("(") {
                        return None;
                    }
                    let mut values = vec![self.value()?];
                    while self.eat_symbol(",") {
                        values.push(self.value()?);
                    }
                    if !self.eat_symbol(")") {
                        return None;
                    }
                    (FilterOp::In, Value::Array(values))
                }
                _ => return None,
            },
        };
        Some(Filter { column, op, value })
    }

    fn select(&mut self) -> Option<SimpleSelect> {
        if !self.eat_keyword("SELECT") {
            return None;
        }

        let mut columns = Vec::new();
        if !self.eat_symbol("*") {
            columns.push(self.identifier()?);
            while self.eat_symbol(",") {
                columns.push(self.identifier()?);
            }
        }

        if !self.eat_keyword("FROM") {
            return None;
        }
        let table = self.identifier()?;

        let mut filters = Vec::new();
        if self.eat_keyword("WHERE") {
            filters.push(self.filter()?);
            while self.eat_keyword("AND") {
                filters.push(self.filter()?);
            }
        }

        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            if !self.eat_keyword("BY") {
                return None;
            }
            loop {
                let column = self.identifier()?;
                let descending = if self.eat_keyword("DESC") {
                    true
                } else {
                    self.eat_keyword("ASC");
                    false
                };
                order_by.push(OrderBy { column, descending });
                if !self.eat_symbol(",") {
                    break;
                }
            }
        }

        let limit = if self.eat_keyword("LIMIT") {
            Some(self.count()?)
        } else {
            None
        };
        let offset = if self.eat_keyword("OFFSET") {
            Some(self.count()?)
        } else {
            None
        };

        self.eat_symbol(";");
        if self.peek().is_some() || self.params.next().is_some() {
            return None;
        }

        Some(SimpleSelect {
            table,
            columns,
            filters,
            order_by,
            limit,
            offset,
        })
    }
}

/// Recognize a single-table read, binding `?` parameters in order.
///
/// Returns `None` for anything outside the supported shape, including
/// statements whose placeholder count does not match `params`.
pub fn parse_simple_select(sql: &str, params: &[Value]) -> Option<SimpleSelect> {
    let tokens = tokenize(sql)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        params: params.iter(),
    };
    parser.select()
}
