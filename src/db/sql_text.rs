//! Lexical helpers over raw statement text.
//!
//! These do not parse SQL. They only track whether a character sits in
//! executable code, inside a quoted literal/identifier, or inside a comment,
//! which is enough to rewrite placeholders and split batches safely.

use std::fmt::Write;

use serde_json::Value;

use crate::db::connectors::ensure_param_count;
use crate::error::Result;

/// Placeholder syntax expected by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` (MySQL, SQLite)
    QuestionMark,
    /// `$1, $2, ...` (PostgreSQL)
    Dollar,
    /// `@P1, @P2, ...` (SQL Server)
    AtP,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Code,
    Quoted,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Code,
    SingleQuote,
    DoubleQuote,
    Backtick,
    LineComment,
    BlockComment,
}

/// Tag every character of `sql` with the region it belongs to.
fn classify(sql: &str) -> Vec<(char, Region)> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = Vec::with_capacity(chars.len());
    let mut state = State::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            State::Code => match c {
                '\'' => {
                    state = State::SingleQuote;
                    out.push((c, Region::Quoted));
                }
                '"' => {
                    state = State::DoubleQuote;
                    out.push((c, Region::Quoted));
                }
                '`' => {
                    state = State::Backtick;
                    out.push((c, Region::Quoted));
                }
                '-' if next == Some('-') => {
                    state = State::LineComment;
                    out.push((c, Region::Comment));
                    out.push(('-', Region::Comment));
                    i += 2;
                    continue;
                }
                '/' if next == Some('*') => {
                    state = State::BlockComment;
                    out.push((c, Region::Comment));
                    out.push(('*', Region::Comment));
                    i += 2;
                    continue;
                }
                _ => out.push((c, Region::Code)),
            },
            State::SingleQuote => {
                out.push((c, Region::Quoted));
                if c == '\'' {
                    // '' is an escaped quote, not the end of the literal
                    if next == Some('\'') {
                        out.push(('\'', Region::Quoted));
                        i += 2;
                        continue;
                    }
                    state = State::Code;
                }
            }
            State::DoubleQuote => {
                out.push((c, Region::Quoted));
                if c == '"' {
                    state = State::Code;
                }
            }
            State::Backtick => {
                out.push((c, Region::Quoted));
                if c == '`' {
                    state = State::Code;
                }
            }
            State::LineComment => {
                out.push((c, Region::Comment));
                if c == '\n' {
                    state = State::Code;
                }
            }
            State::BlockComment => {
                out.push((c, Region::Comment));
                if c == '*' && next == Some('/') {
                    out.push(('/', Region::Comment));
                    state = State::Code;
                    i += 2;
                    continue;
                }
            }
        }
        i += 1;
    }

    out
}

/// Rewrite universal `?` placeholders into the driver's syntax.
///
/// Returns the rewritten statement and the number of placeholders found.
pub fn translate_placeholders(sql: &str, style: PlaceholderStyle) -> (String, usize) {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut count = 0;

    for (c, region) in classify(sql) {
        if c == '?' && region == Region::Code {
            count += 1;
            match style {
                PlaceholderStyle::QuestionMark => out.push('?'),
                PlaceholderStyle::Dollar => {
                    let _ = write!(out, "${}", count);
                }
                PlaceholderStyle::AtP => {
                    let _ = write!(out, "@P{}", count);
                }
            }
        } else {
            out.push(c);
        }
    }

    (out, count)
}

pub fn count_placeholders(sql: &str) -> usize {
    translate_placeholders(sql, PlaceholderStyle::QuestionMark).1
}

/// Split a batch on top-level semicolons, dropping segments with no code.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;

    for (c, region) in classify(sql) {
        if c == ';' && region == Region::Code {
            if has_code {
                statements.push(current.trim().to_string());
            }
            current.clear();
            has_code = false;
            continue;
        }
        if region != Region::Comment && !c.is_whitespace() {
            has_code = true;
        }
        current.push(c);
    }
    if has_code {
        statements.push(current.trim().to_string());
    }

    statements
}

/// First keyword of the statement, uppercased, ignoring comments and
/// leading parentheses.
pub fn leading_keyword(sql: &str) -> Option<String> {
    let mut keyword = String::new();
    for (c, region) in classify(sql) {
        if region == Region::Comment {
            if keyword.is_empty() {
                continue;
            }
            break;
        }
        if c.is_ascii_alphabetic() || (c == '_' && !keyword.is_empty()) {
            keyword.push(c.to_ascii_uppercase());
        } else if keyword.is_empty() && (c.is_whitespace() || c == '(') {
            continue;
        } else {
            break;
        }
    }
    if keyword.is_empty() {
        None
    } else {
        Some(keyword)
    }
}

const READ_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "SHOW", "EXPLAIN", "DESCRIBE", "DESC", "PRAGMA", "VALUES", "TABLE",
];

/// Keywords that make a `WITH` statement write through one of its CTEs.
const CTE_WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];

/// Uppercased words outside literals and comments, in order.
fn code_words(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for (c, region) in classify(sql) {
        let word_char = c.is_ascii_alphanumeric() || c == '_' || c == '$';
        if region == Region::Code && word_char {
            current.push(c.to_ascii_uppercase());
            continue;
        }
        if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// The keyword that decides what a statement does: the leading keyword,
/// except that a `WITH` carrying a data-modifying CTE reports that verb.
pub fn effective_keyword(sql: &str) -> Option<String> {
    let leading = leading_keyword(sql)?;
    if leading != "WITH" {
        return Some(leading);
    }
    let write = code_words(sql)
        .into_iter()
        .find(|word| CTE_WRITE_KEYWORDS.contains(&word.as_str()));
    Some(write.unwrap_or(leading))
}

/// Whether `keyword` (uppercase) appears as a word outside literals and comments.
pub fn contains_keyword(sql: &str, keyword: &str) -> bool {
    code_words(sql).iter().any(|word| word == keyword)
}

pub fn is_read_keyword(keyword: &str) -> bool {
    READ_KEYWORDS.contains(&keyword)
}

/// Whether the statement only reads.
pub fn is_read_statement(sql: &str) -> bool {
    effective_keyword(sql)
        .map(|kw| is_read_keyword(&kw))
        .unwrap_or(false)
}

/// Render a JSON parameter as an SQL literal.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(_) | Value::Object(_) => quote_literal(&value.to_string()),
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Substitute parameters into the statement as literals.
///
/// Only used for backends whose raw-SQL entry point takes plain text.
pub fn inline_parameters(sql: &str, params: &[Value]) -> Result<String> {
    ensure_param_count(count_placeholders(sql), params.len())?;

    let mut out = String::with_capacity(sql.len());
    let mut next = params.iter();
    for (c, region) in classify(sql) {
        if c == '?' && region == Region::Code {
            if let Some(param) = next.next() {
                out.push_str(&sql_literal(param));
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}
