//! Printing for weft expressions
//!
//! `Display` output parses back to the same tree: parentheses are inserted
//! only where precedence or associativity would otherwise change the shape.

use std::fmt::{self, Display};

use crate::ast::expr::{Expr, ExprKind, Path, PathSegment};
use crate::ast::{BinOp, Literal, UnaryOp};
use crate::parse::{is_ident, is_keyword};
use crate::value::format_number;

// ============ Display (single-line) ============

impl Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "\"{}\"", escape_string(s)),
            Literal::Number(n) => write!(f, "{}", format_number(*n)),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Null => write!(f, "null"),
            Literal::Undefined => write!(f, "undefined"),
        }
    }
}

impl Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Nullish => "??",
        };
        write!(f, "{}", s)
    }
}

impl Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
        };
        write!(f, "{}", s)
    }
}

impl Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) if is_ident(key) => write!(f, ".{key}"),
            PathSegment::Key(key) => write!(f, "[\"{}\"]", escape_string(key)),
            PathSegment::Index(i) => write!(f, "[{i}]"),
            PathSegment::Star => write!(f, "[*]"),
        }
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut segments = self.segments.iter();
        if self.is_global {
            write!(f, "$.")?;
        }
        match segments.next() {
            Some(PathSegment::Key(head)) => {
                if !self.is_global && is_keyword(head) {
                    write!(f, "$")?;
                }
                write!(f, "{head}")?;
            }
            Some(other) => write!(f, "{other}")?,
            None => {}
        }
        for segment in segments {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// Binding strength, loosest first. Primaries bind tightest.
fn precedence(expr: &Expr) -> u8 {
    match &expr.kind {
        ExprKind::Ternary { .. } => 1,
        ExprKind::Binary { op, .. } => binop_precedence(*op),
        ExprKind::Unary { .. } => 9,
        ExprKind::Literal(Literal::Number(n)) if n.is_sign_negative() => 9,
        _ => 10,
    }
}

fn binop_precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Nullish => 2,
        BinOp::Or => 3,
        BinOp::And => 4,
        BinOp::Eq | BinOp::Ne => 5,
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 6,
        BinOp::Add | BinOp::Sub => 7,
        BinOp::Mul | BinOp::Div | BinOp::Mod => 8,
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, parens: bool) -> fmt::Result {
    if parens {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Literal(lit) => write!(f, "{lit}"),
            ExprKind::Path(path) | ExprKind::Wildcard(path) => write!(f, "{path}"),
            ExprKind::Unary { op, operand } => {
                write!(f, "{op}")?;
                write_operand(f, operand, precedence(operand) < 9)
            }
            ExprKind::Binary { op, left, right } => {
                let prec = binop_precedence(*op);
                // Left-associative: equal precedence on the right needs parens
                write_operand(f, left, precedence(left) < prec)?;
                write!(f, " {op} ")?;
                write_operand(f, right, precedence(right) <= prec)
            }
            ExprKind::Ternary {
                condition,
                truthy,
                falsy,
            } => {
                write_operand(f, condition, precedence(condition) <= 1)?;
                write!(f, " ? {truthy} : {falsy}")
            }
            ExprKind::Call { callee, args } => {
                write!(f, "{callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out
}
