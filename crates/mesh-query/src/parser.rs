//! Parser: token stream to a step chain.

use crate::token::{scan, Token};
use crate::QueryError;

/// A literal step argument.
#[derive(Debug, Clone, PartialEq)]
pub enum StepParam {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Sort order (true = descending).
    Order(bool),
}

impl StepParam {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StepParam::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StepParam::Int(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
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
    Flows,
    Hops,
    Nodes,
    CaptureNode,
    Aggregates,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub kind: StepKind,
    pub params: Vec<StepParam>,
}

fn step_kind(token: &Token) -> Option<StepKind> {
    let kind = match token {
        Token::V => StepKind::V,
        Token::Context => StepKind::Context,
        Token::Has => StepKind::Has,
        Token::Out => StepKind::Out,
        Token::In => StepKind::In,
        Token::Both => StepKind::Both,
        Token::Dedup => StepKind::Dedup,
        Token::Sort => StepKind::Sort,
        Token::Range => StepKind::Range,
        Token::Limit => StepKind::Limit,
        Token::Count => StepKind::Count,
        Token::Metrics => StepKind::Metrics,
        Token::Sum => StepKind::Sum,
        Token::PropertyValues => StepKind::PropertyValues,
        Token::PropertyKeys => StepKind::PropertyKeys,
        Token::Flows => StepKind::Flows,
        Token::Hops => StepKind::Hops,
        Token::Nodes => StepKind::Nodes,
        Token::CaptureNode => StepKind::CaptureNode,
        Token::Aggregates => StepKind::Aggregates,
        _ => return None,
    };
    Some(kind)
}

/// Parse a traversal expression: `G` followed by dotted steps with
/// parenthesized literal arguments.
pub fn parse(input: &str) -> Result<Vec<Step>, QueryError> {
    let tokens = scan(input)?;
    let mut pos = 0;

    let expect = |tokens: &[Token], pos: usize, want: &Token| -> Result<(), QueryError> {
        match tokens.get(pos) {
            Some(token) if token == want => Ok(()),
            other => Err(QueryError::Syntax(
                pos,
                format!("expected {want:?}, found {other:?}"),
            )),
        }
    };

    expect(&tokens, pos, &Token::G)?;
    pos += 1;

    let mut steps = Vec::new();
    while pos < tokens.len() {
        expect(&tokens, pos, &Token::Dot)?;
        pos += 1;

        let kind = tokens
            .get(pos)
            .and_then(step_kind)
            .ok_or_else(|| QueryError::Syntax(pos, "expected a step name".to_string()))?;
        pos += 1;

        expect(&tokens, pos, &Token::LeftParen)?;
        pos += 1;

        let mut params = Vec::new();
        loop {
            match tokens.get(pos) {
                Some(Token::RightParen) => {
                    pos += 1;
                    break;
                }
                Some(Token::Str(s)) => params.push(StepParam::Str(s.clone())),
                Some(Token::Int(v)) => params.push(StepParam::Int(*v)),
                Some(Token::Bool(b)) => params.push(StepParam::Bool(*b)),
                Some(Token::Order(desc)) => params.push(StepParam::Order(*desc)),
                other => {
                    return Err(QueryError::Syntax(
                        pos,
                        format!("expected a literal argument, found {other:?}"),
                    ))
                }
            }
            pos += 1;
            match tokens.get(pos) {
                Some(Token::Comma) => pos += 1,
                Some(Token::RightParen) => {
                    pos += 1;
                    break;
                }
                other => {
                    return Err(QueryError::Syntax(
                        pos,
                        format!("expected ',' or ')', found {other:?}"),
                    ))
                }
            }
        }

        validate(&kind, &params)?;
        steps.push(Step { kind, params });
    }

    if steps.is_empty() || steps[0].kind != StepKind::V && steps[0].kind != StepKind::Context {
        return Err(QueryError::Syntax(
            0,
            "traversal must start with V() or Context()".to_string(),
        ));
    }

    Ok(steps)
}

fn validate(kind: &StepKind, params: &[StepParam]) -> Result<(), QueryError> {
    match kind {
        StepKind::Has => {
            if params.is_empty() || params.len() % 2 != 0 {
                return Err(QueryError::InvalidArgument(
                    "Has expects key/value pairs".to_string(),
                ));
            }
        }
        StepKind::Range => {
            if params.len() != 2 || params.iter().any(|p| p.as_int().is_none()) {
                return Err(QueryError::InvalidArgument(
                    "Range expects two integers".to_string(),
                ));
            }
        }
        StepKind::Limit => {
            if params.len() != 1 || params[0].as_int().is_none() {
                return Err(QueryError::InvalidArgument(
                    "Limit expects one integer".to_string(),
                ));
            }
        }
        StepKind::Context => {
            let ints = params.iter().all(|p| p.as_int().is_some());
            if params.is_empty() || params.len() > 2 || !ints {
                return Err(QueryError::InvalidArgument(
                    "Context expects one or two timestamps".to_string(),
                ));
            }
        }
        StepKind::Sum | StepKind::PropertyValues => {
            if params.len() != 1 || params[0].as_str().is_none() {
                return Err(QueryError::InvalidArgument(
                    "expected one string key".to_string(),
                ));
            }
        }
        StepKind::Sort => {
            // Accepted forms: (), (key), (order, key).
            let ok = match params {
                [] => true,
                [StepParam::Str(_)] => true,
                [StepParam::Order(_), StepParam::Str(_)] => true,
                _ => false,
            };
            if !ok {
                return Err(QueryError::InvalidArgument(
                    "Sort expects ([order,] key)".to_string(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_step_chain() {
        let steps = parse("G.V().Has('Type', 'veth').Flows().Sort().Limit(10)").unwrap();
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::V,
                StepKind::Has,
                StepKind::Flows,
                StepKind::Sort,
                StepKind::Limit,
            ]
        );
        assert_eq!(
            steps[1].params,
            vec![
                StepParam::Str("Type".to_string()),
                StepParam::Str("veth".to_string()),
            ]
        );
    }

    #[test]
    fn context_starts_a_time_sliced_traversal() {
        let steps = parse("G.Context(1000, 2000).V().Flows()").unwrap();
        assert_eq!(steps[0].kind, StepKind::Context);
        assert_eq!(
            steps[0].params,
            vec![StepParam::Int(1000), StepParam::Int(2000)]
        );
    }

    #[test]
    fn odd_has_arity_is_invalid() {
        assert!(matches!(
            parse("G.V().Has('Type')"),
            Err(QueryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn must_start_with_g_dot_v() {
        assert!(parse("V().Has('x','y')").is_err());
        assert!(parse("G.Has('x','y')").is_err());
    }

    #[test]
    fn sort_forms() {
        assert!(parse("G.V().Flows().Sort()").is_ok());
        assert!(parse("G.V().Flows().Sort('Start')").is_ok());
        assert!(parse("G.V().Flows().Sort(DESC, 'Start')").is_ok());
        assert!(parse("G.V().Flows().Sort(1)").is_err());
    }

    #[test]
    fn range_requires_two_ints() {
        assert!(parse("G.V().Flows().Range(0, 10)").is_ok());
        assert!(parse("G.V().Flows().Range(0)").is_err());
        assert!(parse("G.V().Flows().Range('a','b')").is_err());
    }
}
