//! Lexer for the traversal dialect.
//!
//! Identifier recognition is case-insensitive: `g.v().has(...)` and
//! `G.V().Has(...)` tokenize identically.

use crate::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    G,
    V,
    Context,
    Has,
    Out,
    In,
    Both,
    Dedup,
    Sort,
    Range,
    Limit,
    Count,
    Metrics,
    Sum,
    PropertyValues,
    PropertyKeys,

    // Flow extension tokens.
    Flows,
    Hops,
    Nodes,
    CaptureNode,
    Aggregates,

    Str(String),
    Int(i64),
    Bool(bool),
    /// Sort order keyword (true = descending).
    Order(bool),

    Dot,
    LeftParen,
    RightParen,
    Comma,
}

fn keyword(ident: &str) -> Option<Token> {
    let token = match ident.to_uppercase().as_str() {
        "G" => Token::G,
        "V" => Token::V,
        "CONTEXT" => Token::Context,
        "HAS" => Token::Has,
        "OUT" => Token::Out,
        "IN" => Token::In,
        "BOTH" => Token::Both,
        "DEDUP" => Token::Dedup,
        "SORT" => Token::Sort,
        "RANGE" => Token::Range,
        "LIMIT" => Token::Limit,
        "COUNT" => Token::Count,
        "METRICS" => Token::Metrics,
        "SUM" => Token::Sum,
        "PROPERTYVALUES" => Token::PropertyValues,
        "PROPERTYKEYS" => Token::PropertyKeys,
        "FLOWS" => Token::Flows,
        "HOPS" => Token::Hops,
        "NODES" => Token::Nodes,
        "CAPTURENODE" => Token::CaptureNode,
        "AGGREGATES" => Token::Aggregates,
        "TRUE" => Token::Bool(true),
        "FALSE" => Token::Bool(false),
        "ASC" => Token::Order(false),
        "DESC" => Token::Order(true),
        _ => return None,
    };
    Some(token)
}

/// Tokenize a whole query.
pub fn scan(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            ' ' | '\t' | '\n' | '\r' => pos += 1,
            '.' => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LeftParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = pos + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(QueryError::Syntax(pos, "unterminated string".to_string()));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                pos = end + 1;
            }
            '-' | '0'..='9' => {
                let start = pos;
                pos += 1;
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    pos += 1;
                }
                let literal: String = chars[start..pos].iter().collect();
                let value = literal
                    .parse::<i64>()
                    .map_err(|_| QueryError::Syntax(start, format!("bad number {literal:?}")))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len()
                    && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_')
                {
                    pos += 1;
                }
                let ident: String = chars[start..pos].iter().collect();
                match keyword(&ident) {
                    Some(token) => tokens.push(token),
                    None => {
                        return Err(QueryError::Syntax(
                            start,
                            format!("unknown identifier {ident:?}"),
                        ))
                    }
                }
            }
            other => {
                return Err(QueryError::Syntax(
                    pos,
                    format!("unexpected character {other:?}"),
                ))
            }
        }
    }

    Ok(tokens)
}
