//! Parser for weft expressions
//!
//! Produces `ast::expr::Expr` directly; the template parser calls into this
//! for every `${...}` run and directive head.
//!
//! Precedence, loosest first:
//! `?:` < `??` < `||` < `&&` < `== !=` < `< > <= >=` < `+ -` < `* / %` < `! -`

use std::ops::Range;

use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, cut_err, delimited, opt, preceded, repeat, separated, terminated};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::stream::{LocatingSlice, Stateful, Stream};
use winnow::token::{any, one_of, take_while};

use crate::ast::expr::{Expr, ExprKind, Path, PathSegment};
use crate::ast::{BinOp, LineIndex, Literal, Position, SourceLocation, UnaryOp};

type Input<'a> = Stateful<LocatingSlice<&'a str>, Nesting>;
type PResult<T> = winnow::ModalResult<T>;

/// Deepest `(...)`, `?:` or unary nesting accepted in one expression
pub(crate) const MAX_EXPR_DEPTH: usize = 32;
/// Most binary operators accepted in one expression
pub(crate) const MAX_EXPR_OPERATORS: usize = 256;

/// Recursion budget threaded through the input
#[derive(Debug, Clone, Copy, Default)]
struct Nesting {
    depth: usize,
    operators: usize,
    exceeded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (line {}, column {}, offset {})",
            self.message, self.line, self.column, self.offset
        )
    }
}

impl std::error::Error for ParseError {}

/// Parse a standalone expression
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let index = LineIndex::new(input);
    parse_embedded(input, input, 0, &index)
}

/// Parse `input`, a slice of `full` starting at byte `base`. Locations and
/// errors are reported against `full`.
pub(crate) fn parse_embedded(
    input: &str,
    full: &str,
    base: usize,
    index: &LineIndex,
) -> Result<Expr, ParseError> {
    let mut stream = Stateful {
        input: LocatingSlice::new(input),
        state: Nesting::default(),
    };
    let result = delimited(ws, expr, ws).parse_next(&mut stream);
    let consumed = input.len() - stream.eof_offset();

    if stream.state.exceeded {
        return Err(build_parse_error(
            format!(
                "expression nested too deeply (limit {MAX_EXPR_DEPTH} levels, {MAX_EXPR_OPERATORS} operators)"
            ),
            full,
            base + consumed,
            index,
        ));
    }
    let mut parsed = match result {
        Ok(parsed) if stream.eof_offset() == 0 => parsed,
        Ok(_) => {
            return Err(build_parse_error(
                "unexpected trailing input".to_string(),
                full,
                base + consumed,
                index,
            ));
        }
        Err(e) => {
            return Err(build_parse_error(
                error_message(e),
                full,
                base + consumed,
                index,
            ));
        }
    };

    parsed.walk_mut(&mut |e| {
        e.location = index.location(
            full,
            base + e.location.start.offset,
            base + e.location.end.offset,
        );
    });
    Ok(parsed)
}

fn error_message(e: ErrMode<ContextError>) -> String {
    let message = match e {
        ErrMode::Backtrack(inner) | ErrMode::Cut(inner) => inner.to_string(),
        ErrMode::Incomplete(_) => String::new(),
    };
    if message.trim().is_empty() {
        "invalid expression".to_string()
    } else {
        message.replace('\n', "; ")
    }
}

fn build_parse_error(message: String, full: &str, offset: usize, index: &LineIndex) -> ParseError {
    let Position { line, column, .. } = index.position(full, offset);
    ParseError {
        message,
        offset,
        line,
        column,
    }
}

/// Location with offsets only; `parse_embedded` fills in lines and columns.
fn span_location(span: Range<usize>) -> SourceLocation {
    SourceLocation::new(
        Position {
            offset: span.start,
            ..Position::default()
        },
        Position {
            offset: span.end,
            ..Position::default()
        },
    )
}

fn expected(what: &'static str) -> StrContext {
    StrContext::Expected(StrContextValue::Description(what))
}

// ============ Top-level expression (handles precedence) ============

fn expr(input: &mut Input<'_>) -> PResult<Expr> {
    nested(input, ternary)
}

/// Run `parser` one level deeper, failing hard past [`MAX_EXPR_DEPTH`]
fn nested<'a, O>(
    input: &mut Input<'a>,
    mut parser: impl Parser<Input<'a>, O, ErrMode<ContextError>>,
) -> PResult<O> {
    if input.state.depth >= MAX_EXPR_DEPTH {
        input.state.exceeded = true;
        return Err(ErrMode::Cut(ContextError::new()));
    }
    input.state.depth += 1;
    let result = parser.parse_next(input);
    input.state.depth -= 1;
    result
}

/// Binary chains fold into left-deep trees, so their length is capped too
fn count_operators(input: &mut Input<'_>, count: usize) -> PResult<()> {
    input.state.operators += count;
    if input.state.operators > MAX_EXPR_OPERATORS {
        input.state.exceeded = true;
        return Err(ErrMode::Cut(ContextError::new()));
    }
    Ok(())
}

fn ternary(input: &mut Input<'_>) -> PResult<Expr> {
    let condition = nullish.parse_next(input)?;
    let branches = opt((
        preceded((ws, '?', ws), cut_err(expr).context(expected("expression after '?'"))),
        preceded(
            (ws, cut_err(':').context(expected("':'")), ws),
            cut_err(expr).context(expected("expression after ':'")),
        ),
    ))
    .parse_next(input)?;

    Ok(match branches {
        Some((truthy, falsy)) => {
            let location = condition.location.to(&falsy.location);
            Expr::new(
                ExprKind::Ternary {
                    condition: Box::new(condition),
                    truthy: Box::new(truthy),
                    falsy: Box::new(falsy),
                },
                location,
            )
        }
        None => condition,
    })
}

fn nullish(input: &mut Input<'_>) -> PResult<Expr> {
    let first = or_expr.parse_next(input)?;
    let rest: Vec<Expr> =
        repeat(0.., preceded((ws, "??", ws), cut_err(or_expr))).parse_next(input)?;
    count_operators(input, rest.len())?;
    Ok(rest
        .into_iter()
        .fold(first, |l, r| l.binop(BinOp::Nullish, r)))
}

fn or_expr(input: &mut Input<'_>) -> PResult<Expr> {
    let first = and_expr.parse_next(input)?;
    let rest: Vec<Expr> =
        repeat(0.., preceded((ws, "||", ws), cut_err(and_expr))).parse_next(input)?;
    count_operators(input, rest.len())?;
    Ok(rest.into_iter().fold(first, |l, r| l.binop(BinOp::Or, r)))
}

fn and_expr(input: &mut Input<'_>) -> PResult<Expr> {
    let first = eq_expr.parse_next(input)?;
    let rest: Vec<Expr> =
        repeat(0.., preceded((ws, "&&", ws), cut_err(eq_expr))).parse_next(input)?;
    count_operators(input, rest.len())?;
    Ok(rest.into_iter().fold(first, |l, r| l.binop(BinOp::And, r)))
}

fn eq_expr(input: &mut Input<'_>) -> PResult<Expr> {
    let first = rel_expr.parse_next(input)?;
    let rest: Vec<(BinOp, Expr)> = repeat(
        0..,
        (preceded(ws, eq_op), preceded(ws, cut_err(rel_expr))),
    )
    .parse_next(input)?;
    count_operators(input, rest.len())?;
    Ok(rest.into_iter().fold(first, |l, (op, r)| l.binop(op, r)))
}

fn eq_op(input: &mut Input<'_>) -> PResult<BinOp> {
    alt(("==".value(BinOp::Eq), "!=".value(BinOp::Ne))).parse_next(input)
}

fn rel_expr(input: &mut Input<'_>) -> PResult<Expr> {
    let first = add_expr.parse_next(input)?;
    let rest: Vec<(BinOp, Expr)> = repeat(
        0..,
        (preceded(ws, rel_op), preceded(ws, cut_err(add_expr))),
    )
    .parse_next(input)?;
    count_operators(input, rest.len())?;
    Ok(rest.into_iter().fold(first, |l, (op, r)| l.binop(op, r)))
}

fn rel_op(input: &mut Input<'_>) -> PResult<BinOp> {
    alt((
        "<=".value(BinOp::Le),
        ">=".value(BinOp::Ge),
        "<".value(BinOp::Lt),
        ">".value(BinOp::Gt),
    ))
    .parse_next(input)
}

fn add_expr(input: &mut Input<'_>) -> PResult<Expr> {
    let first = mul_expr.parse_next(input)?;
    let rest: Vec<(BinOp, Expr)> = repeat(
        0..,
        (preceded(ws, add_op), preceded(ws, cut_err(mul_expr))),
    )
    .parse_next(input)?;
    count_operators(input, rest.len())?;
    Ok(rest.into_iter().fold(first, |l, (op, r)| l.binop(op, r)))
}

fn add_op(input: &mut Input<'_>) -> PResult<BinOp> {
    alt(('+'.value(BinOp::Add), '-'.value(BinOp::Sub))).parse_next(input)
}

fn mul_expr(input: &mut Input<'_>) -> PResult<Expr> {
    let first = unary_expr.parse_next(input)?;
    let rest: Vec<(BinOp, Expr)> = repeat(
        0..,
        (preceded(ws, mul_op), preceded(ws, cut_err(unary_expr))),
    )
    .parse_next(input)?;
    count_operators(input, rest.len())?;
    Ok(rest.into_iter().fold(first, |l, (op, r)| l.binop(op, r)))
}

fn mul_op(input: &mut Input<'_>) -> PResult<BinOp> {
    alt((
        '*'.value(BinOp::Mul),
        '/'.value(BinOp::Div),
        '%'.value(BinOp::Mod),
    ))
    .parse_next(input)
}

fn unary_expr(input: &mut Input<'_>) -> PResult<Expr> {
    preceded(
        ws,
        alt((
            (unary_op.with_span(), preceded(ws, cut_err(nested_unary))).map(
                |((op, span), operand)| {
                    let location = span_location(span).to(&operand.location);
                    Expr::new(
                        ExprKind::Unary {
                            op,
                            operand: Box::new(operand),
                        },
                        location,
                    )
                },
            ),
            primary,
        )),
    )
    .parse_next(input)
}

fn nested_unary(input: &mut Input<'_>) -> PResult<Expr> {
    nested(input, unary_expr)
}

fn unary_op(input: &mut Input<'_>) -> PResult<UnaryOp> {
    alt(('!'.value(UnaryOp::Not), '-'.value(UnaryOp::Neg))).parse_next(input)
}

// ============ Primary expressions ============

fn primary(input: &mut Input<'_>) -> PResult<Expr> {
    alt((paren_expr, literal_expr, reference))
        .context(expected("expression"))
        .parse_next(input)
}

fn paren_expr(input: &mut Input<'_>) -> PResult<Expr> {
    delimited(
        ('(', ws),
        cut_err(expr),
        (ws, cut_err(')').context(expected("')'"))),
    )
    .parse_next(input)
}

fn literal_expr(input: &mut Input<'_>) -> PResult<Expr> {
    alt((number_lit, string_lit.map(Literal::String)))
        .with_span()
        .map(|(lit, span)| Expr::new(ExprKind::Literal(lit), span_location(span)))
        .parse_next(input)
}

/// Path, call or keyword literal: `user.name`, `$x[0]`, `$.locale`,
/// `upper(name)`, `true`
fn reference(input: &mut Input<'_>) -> PResult<Expr> {
    reference_kind
        .with_span()
        .map(|(kind, span)| Expr::new(kind, span_location(span)))
        .parse_next(input)
}

fn reference_kind(input: &mut Input<'_>) -> PResult<ExprKind> {
    let prefix = opt(path_prefix).parse_next(input)?;
    let head = ident.parse_next(input)?;
    let is_global = prefix == Some(true);

    if prefix.is_none() {
        if let Some(lit) = keyword_literal(&head) {
            return Ok(ExprKind::Literal(lit));
        }
    }

    if !is_global {
        if let Some(args) = opt(call_args).parse_next(input)? {
            return Ok(ExprKind::Call { callee: head, args });
        }
    }

    let rest: Vec<PathSegment> = repeat(0.., segment).parse_next(input)?;
    let mut segments = Vec::with_capacity(rest.len() + 1);
    segments.push(PathSegment::Key(head));
    segments.extend(rest);
    let path = Path {
        segments,
        is_global,
    };

    Ok(if path.has_star() {
        ExprKind::Wildcard(path)
    } else {
        ExprKind::Path(path)
    })
}

/// `$.` → global (true), `$` → local/data (false)
fn path_prefix(input: &mut Input<'_>) -> PResult<bool> {
    alt(("$.".value(true), '$'.value(false))).parse_next(input)
}

fn keyword_literal(name: &str) -> Option<Literal> {
    match name {
        "true" => Some(Literal::Bool(true)),
        "false" => Some(Literal::Bool(false)),
        "null" => Some(Literal::Null),
        "undefined" => Some(Literal::Undefined),
        _ => None,
    }
}

fn call_args(input: &mut Input<'_>) -> PResult<Vec<Expr>> {
    delimited(
        ('(', ws),
        opt(terminated(
            separated(1.., expr, (ws, ',', ws)),
            opt((ws, ',')), // trailing comma
        ))
        .map(|args| args.unwrap_or_default()),
        (ws, cut_err(')').context(expected("')' to close argument list"))),
    )
    .parse_next(input)
}

fn segment(input: &mut Input<'_>) -> PResult<PathSegment> {
    alt((
        preceded('.', ident).map(PathSegment::Key),
        delimited(
            ('[', ws),
            cut_err(bracket_segment).context(expected("index, string key or '*'")),
            (ws, cut_err(']').context(expected("']'"))),
        ),
    ))
    .parse_next(input)
}

fn bracket_segment(input: &mut Input<'_>) -> PResult<PathSegment> {
    alt((
        '*'.value(PathSegment::Star),
        digit1
            .try_map(|s: &str| s.parse::<usize>())
            .map(PathSegment::Index),
        string_lit.map(PathSegment::Key),
    ))
    .parse_next(input)
}

// ============ Identifiers ============

fn ident(input: &mut Input<'_>) -> PResult<String> {
    (
        one_of(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .map(str::to_string)
        .parse_next(input)
}

pub(crate) fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn is_keyword(s: &str) -> bool {
    keyword_literal(s).is_some()
}

// ============ Literals ============

fn number_lit(input: &mut Input<'_>) -> PResult<Literal> {
    (
        digit1,
        opt(('.', digit1)),
        opt((one_of(['e', 'E']), opt(one_of(['+', '-'])), digit1)),
    )
        .take()
        .try_map(|s: &str| s.parse::<f64>())
        .map(Literal::Number)
        .parse_next(input)
}

fn string_lit(input: &mut Input<'_>) -> PResult<String> {
    let quote = one_of(['"', '\'']).parse_next(input)?;
    let mut result = String::new();
    loop {
        let c = string_char.parse_next(input)?;
        if c == quote {
            break;
        }
        if c == '\\' {
            let escaped = string_char.parse_next(input)?;
            result.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other, // \\, \", \' and unknown escapes pass through
            });
        } else {
            result.push(c);
        }
    }
    Ok(result)
}

fn string_char(input: &mut Input<'_>) -> PResult<char> {
    cut_err(any)
        .context(expected("closing quote"))
        .parse_next(input)
}

// ============ Whitespace ============

fn ws(input: &mut Input<'_>) -> PResult<()> {
    multispace0.void().parse_next(input)
}

// ============ Sanity Tests ============
// Most testing is done via integration tests in tests/integration.rs
