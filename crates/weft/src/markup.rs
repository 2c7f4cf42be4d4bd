//! Template parser
//!
//! Hand-written recursive descent over the raw source. Every `${...}` run and
//! directive head is handed to [`crate::parse`] with its absolute offset, so
//! expression locations point into the template.
//!
//! `}` closes a directive block only while `block_depth > 0`. Everywhere
//! else (plain text, `<style>`, `<script>`) it is ordinary text.
//!
//! Errors never abort the parse: each one becomes a [`Diagnostic`] and the
//! parser resumes at the next construct it recognizes.

use indexmap::IndexMap;
use log::debug;

use crate::ast::expr::{Expr, ExprKind};
use crate::ast::template::{
    Attribute, AttributeValue, CommentStyle, ComponentDefinition, IfBranch, IterationKind, LetValue,
    MatchCase, Node, NodeKind, PropBinding, PropDefinition, TextSegment, is_raw_element,
    is_void_element,
};
use crate::ast::{BinOp, LineIndex, Literal, SourceLocation, UnaryOp};
use crate::diagnostics::{Diagnostic, codes};
use crate::parse::parse_embedded;

/// Nesting past this is reported instead of recursed into
const MAX_PARSE_DEPTH: usize = 256;

/// Output of [`parse_template`]
#[derive(Debug, Clone, Default)]
pub struct ParsedTemplate {
    pub nodes: Vec<Node>,
    /// `<template:Name>` definitions, in source order
    pub components: IndexMap<String, ComponentDefinition>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ParsedTemplate {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

/// Parse a template into nodes, component definitions and diagnostics
pub fn parse_template(source: &str) -> ParsedTemplate {
    parse_template_named(source, None)
}

/// Like [`parse_template`], tagging every location with `name`
pub fn parse_template_named(source: &str, name: Option<&str>) -> ParsedTemplate {
    let mut parser = Parser::new(source, name);
    let (nodes, _) = parser.parse_nodes(End::Eof);
    debug!(
        "parsed template: {} top-level nodes, {} components, {} diagnostics",
        nodes.len(),
        parser.components.len(),
        parser.diagnostics.len()
    );
    ParsedTemplate {
        nodes,
        components: parser.components,
        diagnostics: parser.diagnostics,
    }
}

/// What terminates the node list being parsed
#[derive(Debug, Clone, Copy)]
enum End<'a> {
    Eof,
    /// `}` of a directive block
    Block,
    /// `</name>`
    Tag(&'a str),
    /// `</>`
    Fragment,
}

enum Closing {
    /// Closed the current list; tag consumed
    Matched,
    /// Closes an ancestor; left for the ancestor to consume
    Ancestor,
    /// Stray tag, reported and consumed
    Skipped,
    /// `</` that is not a closing tag
    NotATag,
}

/// Accumulates adjacent literal and expression segments into one text node
#[derive(Default)]
struct TextBuilder {
    start: usize,
    end: usize,
    segments: Vec<TextSegment>,
}

impl TextBuilder {
    fn literal(&mut self, start: usize, end: usize, text: &str) {
        if self.segments.is_empty() {
            self.start = start;
        }
        self.end = end;
        match self.segments.last_mut() {
            Some(TextSegment::Literal(last)) => last.push_str(text),
            _ => self.segments.push(TextSegment::Literal(text.to_string())),
        }
    }

    fn expr(&mut self, start: usize, end: usize, expr: Expr) {
        if self.segments.is_empty() {
            self.start = start;
        }
        self.end = end;
        self.segments.push(TextSegment::Expr(expr));
    }
}

struct Parser<'s> {
    src: &'s str,
    pos: usize,
    index: LineIndex,
    /// Open directive blocks around the cursor
    block_depth: usize,
    /// Open elements and fragments (`""`) around the cursor
    open_tags: Vec<String>,
    depth: usize,
    components: IndexMap<String, ComponentDefinition>,
    diagnostics: Vec<Diagnostic>,
}

impl<'s> Parser<'s> {
    fn new(src: &'s str, name: Option<&str>) -> Self {
        Self {
            src,
            pos: 0,
            index: LineIndex::new(src).with_source(name.map(str::to_string)),
            block_depth: 0,
            open_tags: Vec::new(),
            depth: 0,
            components: IndexMap::new(),
            diagnostics: Vec::new(),
        }
    }

    // ============ Cursor ============

    fn rest(&self) -> &'s str {
        let src: &'s str = self.src;
        &src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    /// `word` followed by something that cannot continue an identifier
    fn starts_with_word(&self, word: &str) -> bool {
        self.starts_with(word) && ident_end(self.src, self.pos + word.len()) == self.pos + word.len()
    }

    fn skip_ws(&mut self) {
        self.pos = skip_ws(self.src, self.pos);
    }

    fn at_line_start(&self) -> bool {
        self.src[..self.pos]
            .rsplit('\n')
            .next()
            .is_none_or(|line| line.trim().is_empty())
    }

    fn loc(&self, start: usize, end: usize) -> SourceLocation {
        self.index.location(self.src, start, end)
    }

    fn error(&mut self, code: &'static str, message: impl Into<String>, start: usize, end: usize) {
        let location = self.loc(start, end);
        self.diagnostics
            .push(Diagnostic::error(message, location).with_code(code));
    }

    /// Parse `src[start..end]` as an expression. Failures are reported and
    /// replaced by `undefined` so the tree keeps its shape.
    fn expr_at(&mut self, start: usize, end: usize) -> Expr {
        let src = self.src;
        let slice = &src[start..end];
        if slice.trim().is_empty() {
            self.error(codes::INVALID_EXPRESSION, "empty expression", start, end);
            return Expr::undefined(self.loc(start, end));
        }
        match parse_embedded(slice, src, start, &self.index) {
            Ok(expr) => expr,
            Err(err) => {
                self.error(
                    codes::INVALID_EXPRESSION,
                    format!("invalid expression `{}`: {}", slice.trim(), err.message),
                    err.offset,
                    err.offset,
                );
                Expr::undefined(self.loc(start, end))
            }
        }
    }

    fn flush(&self, text: &mut TextBuilder, nodes: &mut Vec<Node>) {
        if text.segments.is_empty() {
            return;
        }
        let segments = std::mem::take(&mut text.segments);
        nodes.push(Node::new(
            NodeKind::Text { segments },
            self.loc(text.start, text.end),
        ));
    }

    // ============ Node lists ============

    /// Parse nodes until `end`. Returns the nodes and whether the terminator
    /// was found (and consumed).
    fn parse_nodes(&mut self, end: End<'_>) -> (Vec<Node>, bool) {
        let mut nodes = Vec::new();
        let mut text = TextBuilder::default();
        // Literal `{` seen inside a block; their `}` are text too
        let mut text_braces = 0usize;

        let closed = loop {
            let Some(c) = self.peek() else {
                break matches!(end, End::Eof);
            };
            let start = self.pos;
            match c {
                '<' if self.starts_with("</") => match self.closing_tag(end) {
                    Closing::Matched => break true,
                    Closing::Ancestor => break false,
                    Closing::Skipped => {}
                    Closing::NotATag => {
                        self.pos += 1;
                        text.literal(start, self.pos, "<");
                    }
                },
                '<' if self.starts_with("<!--") => {
                    self.flush(&mut text, &mut nodes);
                    nodes.push(self.html_comment());
                }
                '<' if self.at_tag_start() => {
                    self.flush(&mut text, &mut nodes);
                    if let Some(node) = self.element() {
                        nodes.push(node);
                    }
                }
                '@' => self.at_sign(&mut text, &mut nodes),
                '$' => self.dollar(&mut text),
                '\\' if self.starts_with("\\${") => {
                    self.pos += 3;
                    text.literal(start, self.pos, "${");
                }
                '{' => {
                    if self.block_depth > 0 {
                        text_braces += 1;
                    }
                    self.pos += 1;
                    text.literal(start, self.pos, "{");
                }
                '}' if self.block_depth > 0 && text_braces == 0 => {
                    if matches!(end, End::Block) {
                        self.pos += 1;
                        break true;
                    }
                    break false;
                }
                '}' => {
                    text_braces = text_braces.saturating_sub(1);
                    self.pos += 1;
                    text.literal(start, self.pos, "}");
                }
                '/' if self.at_line_start()
                    && (self.starts_with("//") || self.starts_with("/*")) =>
                {
                    self.flush(&mut text, &mut nodes);
                    nodes.push(self.script_comment());
                }
                _ => {
                    // Plain run up to the next character that may start something
                    let run = self.rest()[c.len_utf8()..]
                        .find(['<', '@', '$', '\\', '{', '}', '/'])
                        .map_or(self.src.len(), |i| self.pos + c.len_utf8() + i);
                    text.literal(start, run, &self.src[start..run]);
                    self.pos = run;
                }
            }
        };

        self.flush(&mut text, &mut nodes);
        (nodes, closed)
    }

    fn at_tag_start(&self) -> bool {
        let mut chars = self.rest().chars().skip(1);
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '>')
    }

    fn closing_tag(&mut self, end: End<'_>) -> Closing {
        let src = self.src;
        let start = self.pos;
        let name_start = start + 2;
        let name_end = tag_name_end(src, name_start);
        let after = skip_ws(src, name_end);
        if !src[after..].starts_with('>') {
            return Closing::NotATag;
        }
        let name = &src[name_start..name_end];

        let matched = match end {
            End::Tag(tag) => tag == name,
            End::Fragment => name.is_empty(),
            End::Eof | End::Block => false,
        };
        if matched {
            self.pos = after + 1;
            return Closing::Matched;
        }
        if self.open_tags.iter().any(|open| open == name) {
            return Closing::Ancestor;
        }

        let shown = if name.is_empty() { "</>" } else { name };
        self.error(
            codes::UNEXPECTED_CLOSING_TAG,
            format!("unexpected closing tag `{shown}`"),
            start,
            after + 1,
        );
        self.pos = after + 1;
        Closing::Skipped
    }

    // ============ Interpolation ============

    /// `${expr}`, `$path` shorthand, or a literal `$`
    fn dollar(&mut self, text: &mut TextBuilder) {
        let start = self.pos;
        if self.starts_with("${") {
            match matching_close(self.src, start + 2, '}') {
                Some(close) => {
                    let expr = self.expr_at(start + 2, close);
                    self.pos = close + 1;
                    text.expr(start, self.pos, expr);
                }
                None => {
                    self.error(
                        codes::UNTERMINATED_EXPRESSION,
                        "unterminated `${` expression",
                        start,
                        start + 2,
                    );
                    self.pos = start + 2;
                    text.literal(start, self.pos, "${");
                }
            }
            return;
        }

        match shorthand_end(self.src, start) {
            Some(end) => {
                let expr = self.expr_at(start, end);
                self.pos = end;
                text.expr(start, end, expr);
            }
            None => {
                self.pos += 1;
                text.literal(start, self.pos, "$");
            }
        }
    }

    /// Literal/expression segments of `src[start..end]`, for quoted
    /// attribute values and raw element content
    fn segments_in(&mut self, start: usize, end: usize) -> Vec<TextSegment> {
        let src = self.src;
        let mut text = TextBuilder::default();
        let mut p = start;
        while p < end {
            let next = src[p..end].find(['$', '\\']).map_or(end, |i| p + i);
            if next > p {
                text.literal(p, next, &src[p..next]);
                p = next;
                continue;
            }
            let rest = &src[p..end];
            if rest.starts_with("\\${") {
                text.literal(p, p + 3, "${");
                p += 3;
            } else if rest.starts_with("${") {
                match matching_close(src, p + 2, '}').filter(|close| *close < end) {
                    Some(close) => {
                        let expr = self.expr_at(p + 2, close);
                        text.expr(p, close + 1, expr);
                        p = close + 1;
                    }
                    None => {
                        self.error(
                            codes::UNTERMINATED_EXPRESSION,
                            "unterminated `${` expression",
                            p,
                            p + 2,
                        );
                        text.literal(p, end, &src[p..end]);
                        p = end;
                    }
                }
            } else {
                text.literal(p, p + 1, &rest[..1]);
                p += 1;
            }
        }
        text.segments
    }

    // ============ Comments ============

    fn html_comment(&mut self) -> Node {
        let start = self.pos;
        let body = start + 4;
        let (text_end, end) = match self.src[body..].find("-->") {
            Some(i) => (body + i, body + i + 3),
            None => {
                self.error(codes::UNCLOSED_COMMENT, "unclosed `<!--` comment", start, body);
                (self.src.len(), self.src.len())
            }
        };
        self.pos = end;
        Node::new(
            NodeKind::Comment {
                style: CommentStyle::Html,
                text: self.src[body..text_end].to_string(),
            },
            self.loc(start, end),
        )
    }

    /// Line-leading `// ...` or `/* ... */`
    fn script_comment(&mut self) -> Node {
        let start = self.pos;
        let body = start + 2;
        let (style, text_end, end) = if self.starts_with("//") {
            let eol = self.src[body..].find('\n').map_or(self.src.len(), |i| body + i);
            (CommentStyle::Line, eol, eol)
        } else {
            match self.src[body..].find("*/") {
                Some(i) => (CommentStyle::Block, body + i, body + i + 2),
                None => {
                    self.error(codes::UNCLOSED_COMMENT, "unclosed `/*` comment", start, body);
                    (CommentStyle::Block, self.src.len(), self.src.len())
                }
            }
        };
        self.pos = end;
        Node::new(
            NodeKind::Comment {
                style,
                text: self.src[body..text_end].to_string(),
            },
            self.loc(start, end),
        )
    }

    // ============ Directives ============

    fn at_sign(&mut self, text: &mut TextBuilder, nodes: &mut Vec<Node>) {
        let start = self.pos;
        for (escape, literal) in [("@@", "@"), ("@{", "{"), ("@}", "}")] {
            if self.starts_with(escape) {
                self.pos += 2;
                text.literal(start, self.pos, literal);
                return;
            }
        }

        let src = self.src;
        let word_end = ident_end(src, start + 1);
        let word = &src[start + 1..word_end];
        let directive = match word {
            "if" | "for" | "match" | "let" => word,
            "else" => {
                self.pos = word_end;
                self.error(
                    codes::INVALID_DIRECTIVE,
                    "`@else` without a preceding `@if`",
                    start,
                    word_end,
                );
                return;
            }
            _ => {
                // Not a directive (`user@example.com`, `@media`)
                self.pos += 1;
                text.literal(start, self.pos, "@");
                return;
            }
        };

        self.flush(text, nodes);
        self.pos = word_end;
        let node = match directive {
            "if" => self.if_directive(start),
            "for" => self.for_directive(start),
            "match" => self.match_directive(start),
            _ => self.let_directive(start),
        };
        nodes.extend(node);
    }

    /// `( expr )` after a directive keyword
    fn paren_expr(&mut self, directive: &str) -> Option<Expr> {
        let (open, close) = self.paren_region(directive)?;
        let expr = self.expr_at(open + 1, close);
        self.pos = close + 1;
        Some(expr)
    }

    /// Locate `( ... )`; returns the offsets of both parentheses
    fn paren_region(&mut self, directive: &str) -> Option<(usize, usize)> {
        self.skip_ws();
        let open = self.pos;
        if self.peek() != Some('(') {
            self.error(
                codes::INVALID_DIRECTIVE,
                format!("expected `(` after `{directive}`"),
                open,
                open,
            );
            return None;
        }
        match matching_close(self.src, open + 1, ')') {
            Some(close) => Some((open, close)),
            None => {
                self.error(
                    codes::UNTERMINATED_EXPRESSION,
                    format!("unclosed `(` in `{directive}`"),
                    open,
                    open + 1,
                );
                self.pos = open + 1;
                None
            }
        }
    }

    /// `{ nodes }` body shared by every directive
    fn block_body(&mut self, directive: &str) -> Option<Vec<Node>> {
        self.skip_ws();
        let open = self.pos;
        if self.peek() != Some('{') {
            self.error(
                codes::INVALID_DIRECTIVE,
                format!("expected `{{` to open the `{directive}` body"),
                open,
                open,
            );
            return None;
        }
        if !self.enter(open) {
            return None;
        }
        self.pos += 1;
        self.block_depth += 1;
        let (nodes, closed) = self.parse_nodes(End::Block);
        self.block_depth -= 1;
        self.depth -= 1;
        if !closed {
            self.error(
                codes::UNCLOSED_BLOCK,
                format!("`{directive}` block is never closed with `}}`"),
                open,
                open + 1,
            );
        }
        Some(nodes)
    }

    fn enter(&mut self, at: usize) -> bool {
        if self.depth >= MAX_PARSE_DEPTH {
            self.error(
                codes::MALFORMED_TAG,
                format!("nesting deeper than {MAX_PARSE_DEPTH} levels"),
                at,
                at,
            );
            self.pos = self.src.len();
            return false;
        }
        self.depth += 1;
        true
    }

    fn if_directive(&mut self, start: usize) -> Option<Node> {
        let mut branches = Vec::new();
        let mut else_branch = None;
        let mut keyword = "@if";
        loop {
            let condition = self.paren_expr(keyword)?;
            let body = self.block_body(keyword)?;
            branches.push(IfBranch { condition, body });

            let save = self.pos;
            self.skip_ws();
            if !self.starts_with_word("@else") {
                self.pos = save;
                break;
            }
            self.pos += "@else".len();
            self.skip_ws();
            if self.starts_with_word("if") {
                self.pos += "if".len();
                keyword = "@else if";
                continue;
            }
            else_branch = Some(self.block_body("@else")?);
            break;
        }
        Some(Node::new(
            NodeKind::If {
                branches,
                else_branch,
            },
            self.loc(start, self.pos),
        ))
    }

    fn for_directive(&mut self, start: usize) -> Option<Node> {
        let (open, close) = self.paren_region("@for")?;
        self.pos = close + 1;
        let Some((item_var, index_var, iteration, items)) = self.for_head(open + 1, close) else {
            self.error(
                codes::INVALID_DIRECTIVE,
                "expected `@for (item of items)`, `@for (item, index of items)` or `@for (key in object)`",
                open,
                close + 1,
            );
            return None;
        };
        let body = self.block_body("@for")?;
        Some(Node::new(
            NodeKind::For {
                items,
                item_var,
                index_var,
                iteration,
                body,
            },
            self.loc(start, self.pos),
        ))
    }

    fn for_head(
        &mut self,
        start: usize,
        end: usize,
    ) -> Option<(String, Option<String>, IterationKind, Expr)> {
        let src = self.src;
        let (item, mut p) = binding_name(src, skip_ws(src, start))?;
        p = skip_ws(src, p);

        let mut index = None;
        if src[p..end].starts_with(',') {
            let (name, next) = binding_name(src, skip_ws(src, p + 1))?;
            index = Some(name);
            p = skip_ws(src, next);
        }

        let keyword_end = ident_end(src, p);
        let iteration = match &src[p..keyword_end] {
            "of" => IterationKind::Of,
            "in" => IterationKind::In,
            _ => return None,
        };
        if keyword_end >= end {
            return None;
        }
        let items = self.expr_at(keyword_end, end);
        Some((item, index, iteration, items))
    }

    fn match_directive(&mut self, start: usize) -> Option<Node> {
        let value = self.paren_expr("@match")?;
        self.skip_ws();
        let open = self.pos;
        if self.peek() != Some('{') {
            self.error(
                codes::INVALID_DIRECTIVE,
                "expected `{` to open the `@match` cases",
                open,
                open,
            );
            return None;
        }
        self.pos += 1;

        let mut cases = Vec::new();
        let mut default_case = None;
        loop {
            self.skip_ws();
            let case_start = self.pos;
            match self.peek() {
                None => {
                    self.error(
                        codes::UNCLOSED_BLOCK,
                        "`@match` is never closed with `}`",
                        open,
                        open + 1,
                    );
                    break;
                }
                Some('}') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {}
            }

            let arrow = scan_top_level(self.src, case_start, |rest| {
                rest.starts_with("=>") || rest.starts_with('}')
            });
            if !self.src[arrow..].starts_with("=>") {
                self.error(
                    codes::INVALID_DIRECTIVE,
                    "expected `pattern => { ... }` in `@match`",
                    case_start,
                    arrow,
                );
                // an unbalanced closer stops the scan where it started
                self.pos = if arrow > case_start { arrow } else { case_start + 1 };
                continue;
            }
            self.pos = arrow + 2;
            let body = self.block_body("@match case")?;

            let is_default = self.src[case_start..arrow].trim() == "_";
            if is_default {
                if default_case.is_some() {
                    self.error(
                        codes::INVALID_DIRECTIVE,
                        "`@match` has more than one `_` case",
                        case_start,
                        arrow,
                    );
                }
                default_case = Some(body);
                continue;
            }
            if let Some(case) = self.match_case(case_start, arrow, body) {
                cases.push(case);
            }
        }

        Some(Node::new(
            NodeKind::Match {
                value,
                cases,
                default_case,
            },
            self.loc(start, self.pos),
        ))
    }

    /// `"a", "b"` → literal case; any single expression → condition case
    fn match_case(&mut self, start: usize, end: usize, body: Vec<Node>) -> Option<MatchCase> {
        let mut parts = Vec::new();
        let mut p = start;
        loop {
            let comma = scan_top_level(self.src, p, |rest| rest.starts_with(','));
            let part_end = comma.min(end);
            parts.push(self.expr_at(p, part_end));
            if comma >= end {
                break;
            }
            p = comma + 1;
        }

        let literals: Option<Vec<Literal>> = parts.iter().map(case_literal).collect();
        match literals {
            Some(values) => Some(MatchCase::Literal { values, body }),
            None if parts.len() == 1 => Some(MatchCase::Expression {
                condition: parts.remove(0),
                body,
            }),
            None => {
                self.error(
                    codes::INVALID_DIRECTIVE,
                    "a `@match` case lists either literals or one condition",
                    start,
                    end,
                );
                None
            }
        }
    }

    /// `@let name = expr`, `@let $.name = expr`, `@let f(a, b) = expr`,
    /// ended by `;`, a newline or the enclosing `}`
    fn let_directive(&mut self, start: usize) -> Option<Node> {
        self.skip_ws();
        let is_global = if self.starts_with("$.") {
            self.pos += 2;
            true
        } else {
            if self.starts_with("$") {
                self.pos += 1;
            }
            false
        };

        let name_start = self.pos;
        let name_end = ident_end(self.src, name_start);
        if name_end == name_start || self.src[name_start..].starts_with(|c: char| c.is_ascii_digit())
        {
            self.error(
                codes::INVALID_DIRECTIVE,
                "expected a name after `@let`",
                start,
                name_start,
            );
            return None;
        }
        let name = self.src[name_start..name_end].to_string();
        self.pos = name_end;

        let params = if self.peek() == Some('(') {
            let close = match matching_close(self.src, self.pos + 1, ')') {
                Some(close) => close,
                None => {
                    self.error(
                        codes::UNTERMINATED_EXPRESSION,
                        format!("unclosed parameter list for `{name}`"),
                        self.pos,
                        self.pos + 1,
                    );
                    return None;
                }
            };
            let src = self.src;
            let list = &src[self.pos + 1..close];
            let params: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if let Some(bad) = params.iter().find(|p| !crate::parse::is_ident(p)) {
                let message = format!("invalid parameter `{bad}` for `{name}`");
                self.error(codes::INVALID_DIRECTIVE, message, self.pos, close + 1);
                return None;
            }
            self.pos = close + 1;
            Some(params)
        } else {
            None
        };

        self.skip_ws();
        if self.peek() != Some('=') || self.starts_with("==") {
            self.error(
                codes::INVALID_DIRECTIVE,
                format!("expected `=` after `@let {name}`"),
                start,
                self.pos,
            );
            return None;
        }
        self.pos += 1;

        let value_start = self.pos;
        let value_end = scan_top_level(self.src, value_start, |rest| {
            rest.starts_with([';', '\n', '}'])
        });
        let expr = self.expr_at(value_start, value_end);
        self.pos = value_end;
        if self.peek() == Some(';') {
            self.pos += 1;
        }

        let value = match params {
            Some(params) => LetValue::Function {
                params,
                body: std::sync::Arc::new(expr),
            },
            None => LetValue::Expr(expr),
        };
        Some(Node::new(
            NodeKind::Let {
                name,
                is_global,
                value,
            },
            self.loc(start, self.pos),
        ))
    }

    // ============ Elements ============

    fn element(&mut self) -> Option<Node> {
        let start = self.pos;
        if !self.enter(start) {
            return None;
        }
        let node = self.element_inner(start);
        self.depth -= 1;
        node
    }

    fn element_inner(&mut self, start: usize) -> Option<Node> {
        self.pos += 1;

        if self.peek() == Some('>') {
            self.pos += 1;
            let children = self.children("", start);
            return Some(Node::new(
                NodeKind::Fragment { children },
                self.loc(start, self.pos),
            ));
        }

        let name_end = tag_name_end(self.src, self.pos);
        let name = self.src[self.pos..name_end].to_string();
        self.pos = name_end;
        let (attributes, self_closing) = self.attributes(start, &name)?;

        if let Some(component) = name.strip_prefix("template:") {
            self.component_definition(start, component, attributes, self_closing);
            return None;
        }

        let children = if self_closing || is_void_element(&name) {
            Vec::new()
        } else if is_raw_element(&name) {
            self.raw_children(start, &name)
        } else {
            self.children(&name, start)
        };
        let location = self.loc(start, self.pos);

        let kind = if name == "slot" {
            let slot_name = attributes.iter().find_map(|attr| match &attr.value {
                AttributeValue::Static(Some(value)) if attr.name == "name" => Some(value.clone()),
                _ => None,
            });
            NodeKind::Slot {
                name: slot_name,
                fallback: (!children.is_empty()).then_some(children),
            }
        } else if is_component_name(&name) {
            NodeKind::Component {
                props: attributes.into_iter().map(prop_binding).collect(),
                name,
                children,
            }
        } else {
            NodeKind::Element {
                tag: name,
                attributes,
                children,
            }
        };
        Some(Node::new(kind, location))
    }

    /// Children up to `</tag>` (or `</>` when `tag` is empty)
    fn children(&mut self, tag: &str, start: usize) -> Vec<Node> {
        self.open_tags.push(tag.to_string());
        let end = if tag.is_empty() {
            End::Fragment
        } else {
            End::Tag(tag)
        };
        let (children, closed) = self.parse_nodes(end);
        self.open_tags.pop();
        if !closed {
            let shown = if tag.is_empty() { "<>" } else { tag };
            self.error(
                codes::UNCLOSED_ELEMENT,
                format!("`{shown}` is never closed"),
                start,
                start + 1,
            );
        }
        children
    }

    /// `<style>` / `<script>` body: scanned for the closing tag only;
    /// braces are text, `${...}` still interpolates
    fn raw_children(&mut self, start: usize, tag: &str) -> Vec<Node> {
        let body = self.pos;
        let needle = format!("</{}", tag.to_ascii_lowercase());
        let close = self.src[body..]
            .to_ascii_lowercase()
            .find(&needle)
            .map(|i| body + i);

        let body_end = close.unwrap_or(self.src.len());
        let segments = self.segments_in(body, body_end);
        let children = if segments.is_empty() {
            Vec::new()
        } else {
            vec![Node::new(
                NodeKind::Text { segments },
                self.loc(body, body_end),
            )]
        };

        match close {
            Some(close) => {
                let gt = self.src[close..].find('>').map_or(self.src.len(), |i| close + i + 1);
                self.pos = gt;
            }
            None => {
                self.error(
                    codes::UNCLOSED_ELEMENT,
                    format!("`{tag}` is never closed"),
                    start,
                    start + 1,
                );
                self.pos = self.src.len();
            }
        }
        children
    }

    /// Attributes up to `>` or `/>`; the flag is true for `/>`
    fn attributes(&mut self, start: usize, tag: &str) -> Option<(Vec<Attribute>, bool)> {
        let mut attributes = Vec::new();
        loop {
            self.skip_ws();
            let Some(c) = self.peek() else {
                self.error(
                    codes::MALFORMED_TAG,
                    format!("`<{tag}` is missing its closing `>`"),
                    start,
                    self.pos,
                );
                return None;
            };
            if self.starts_with("/>") {
                self.pos += 2;
                return Some((attributes, true));
            }
            if c == '>' {
                self.pos += 1;
                return Some((attributes, false));
            }

            let attr_start = self.pos;
            let name_end = attribute_name_end(self.src, attr_start);
            if name_end == attr_start {
                self.error(
                    codes::MALFORMED_TAG,
                    format!("unexpected `{c}` in `<{tag}>`"),
                    attr_start,
                    attr_start + c.len_utf8(),
                );
                // `{...}` spreads and stray quotes are skipped whole
                self.pos = match c {
                    '{' => matching_close(self.src, attr_start + 1, '}')
                        .map_or(attr_start + 1, |close| close + 1),
                    _ => attr_start + c.len_utf8(),
                };
                continue;
            }
            let name = self.src[attr_start..name_end].to_string();
            self.pos = name_end;

            let save = self.pos;
            self.skip_ws();
            let value = if self.peek() == Some('=') {
                self.pos += 1;
                self.skip_ws();
                self.attribute_value(tag)?
            } else {
                self.pos = save;
                AttributeValue::Static(None)
            };
            attributes.push(Attribute {
                name,
                value,
                location: self.loc(attr_start, self.pos),
            });
        }
    }

    fn attribute_value(&mut self, tag: &str) -> Option<AttributeValue> {
        let start = self.pos;
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                let Some(end) = closing_quote(self.src, start + 1, quote) else {
                    self.error(
                        codes::MALFORMED_TAG,
                        format!("unterminated attribute value in `<{tag}>`"),
                        start,
                        start + 1,
                    );
                    self.pos = self.src.len();
                    return None;
                };
                let mut segments = self.segments_in(start + 1, end);
                self.pos = end + 1;
                Some(match segments.len() {
                    0 => AttributeValue::Static(Some(String::new())),
                    1 => match segments.remove(0) {
                        TextSegment::Literal(s) => AttributeValue::Static(Some(s)),
                        TextSegment::Expr(e) => AttributeValue::Expr(e),
                    },
                    _ => AttributeValue::Mixed(segments),
                })
            }
            Some('{') => self.braced_value(start, start + 1),
            Some('$') if self.starts_with("${") => self.braced_value(start, start + 2),
            _ => {
                let end = scan_unquoted(self.src, start);
                self.pos = end;
                Some(AttributeValue::Static(Some(self.src[start..end].to_string())))
            }
        }
    }

    fn braced_value(&mut self, start: usize, body: usize) -> Option<AttributeValue> {
        match matching_close(self.src, body, '}') {
            Some(close) => {
                let expr = self.expr_at(body, close);
                self.pos = close + 1;
                Some(AttributeValue::Expr(expr))
            }
            None => {
                self.error(
                    codes::UNTERMINATED_EXPRESSION,
                    "unterminated attribute expression",
                    start,
                    body,
                );
                self.pos = self.src.len();
                None
            }
        }
    }

    /// `<template:Name title subtitle? size="md">body</template:Name>`
    fn component_definition(
        &mut self,
        start: usize,
        name: &str,
        attributes: Vec<Attribute>,
        self_closing: bool,
    ) {
        let tag = format!("template:{name}");
        let body = if self_closing {
            Vec::new()
        } else {
            self.children(&tag, start)
        };
        let location = self.loc(start, self.pos);

        if !is_component_name(name) {
            self.diagnostics.push(
                Diagnostic::warning(
                    format!("component `{name}` should start with an uppercase letter to be usable as a tag"),
                    location.clone(),
                )
                .with_code(codes::INVALID_DIRECTIVE),
            );
        }
        if self.components.contains_key(name) {
            self.diagnostics.push(
                Diagnostic::error(format!("component `{name}` is defined more than once"), location.clone())
                    .with_code(codes::DUPLICATE_COMPONENT),
            );
        }

        let props = attributes.into_iter().map(prop_definition).collect();
        debug!("defined component {name}");
        self.components.insert(
            name.to_string(),
            ComponentDefinition {
                name: name.to_string(),
                props,
                body,
                location,
            },
        );
    }
}

// ============ Node construction ============

fn is_component_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_uppercase())
}

/// Value of a literal match pattern; `-3` counts as a literal
fn case_literal(expr: &Expr) -> Option<Literal> {
    match &expr.kind {
        ExprKind::Literal(lit) => Some(lit.clone()),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match operand.as_literal() {
            Some(Literal::Number(n)) => Some(Literal::Number(-n)),
            _ => None,
        },
        _ => None,
    }
}

/// `"a ${b} c"` as one expression: `"" + "a " + b + " c"`
fn concat_segments(segments: Vec<TextSegment>, location: &SourceLocation) -> Expr {
    let empty = Expr::new(
        ExprKind::Literal(Literal::String(String::new())),
        location.clone(),
    );
    segments.into_iter().fold(empty, |acc, segment| {
        let part = match segment {
            TextSegment::Literal(s) => {
                Expr::new(ExprKind::Literal(Literal::String(s)), location.clone())
            }
            TextSegment::Expr(e) => e,
        };
        let mut joined = acc.binop(BinOp::Add, part);
        joined.location = location.clone();
        joined
    })
}

fn attribute_expr(attr: Attribute) -> Expr {
    match attr.value {
        AttributeValue::Static(None) => {
            Expr::new(ExprKind::Literal(Literal::Bool(true)), attr.location)
        }
        AttributeValue::Static(Some(s)) => {
            Expr::new(ExprKind::Literal(Literal::String(s)), attr.location)
        }
        AttributeValue::Expr(e) => e,
        AttributeValue::Mixed(segments) => concat_segments(segments, &attr.location),
    }
}

fn prop_binding(attr: Attribute) -> PropBinding {
    PropBinding {
        name: attr.name.clone(),
        value: attribute_expr(attr),
    }
}

/// `title` → required, `subtitle?` → optional, `size="md"` → default
fn prop_definition(attr: Attribute) -> PropDefinition {
    match attr.value {
        AttributeValue::Static(None) => PropDefinition {
            required: !attr.name.ends_with('?'),
            name: attr.name.trim_end_matches('?').to_string(),
            default_value: None,
        },
        _ => PropDefinition {
            name: attr.name.trim_end_matches('?').to_string(),
            required: false,
            default_value: Some(attribute_expr(attr)),
        },
    }
}

// ============ Scanning helpers ============

fn skip_ws(src: &str, p: usize) -> usize {
    let rest = &src[p..];
    p + (rest.len() - rest.trim_start().len())
}

/// End of the ASCII identifier starting at `p` (`p` itself when none)
fn ident_end(src: &str, p: usize) -> usize {
    src[p..]
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .map_or(src.len(), |i| p + i)
}

fn tag_name_end(src: &str, p: usize) -> usize {
    src[p..]
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')))
        .map_or(src.len(), |i| p + i)
}

fn attribute_name_end(src: &str, p: usize) -> usize {
    src[p..]
        .find(|c: char| {
            c.is_whitespace() || matches!(c, '=' | '>' | '/' | '"' | '\'' | '{' | '}' | '<')
        })
        .map_or(src.len(), |i| p + i)
}

fn scan_unquoted(src: &str, p: usize) -> usize {
    let mut end = p;
    for (i, c) in src[p..].char_indices() {
        if c.is_whitespace() || c == '>' || src[p + i..].starts_with("/>") {
            break;
        }
        end = p + i + c.len_utf8();
    }
    end
}

/// `item` or `$item` in a `@for` head
fn binding_name(src: &str, p: usize) -> Option<(String, usize)> {
    let start = if src[p..].starts_with('$') { p + 1 } else { p };
    let end = ident_end(src, start);
    let name = &src[start..end];
    crate::parse::is_ident(name).then(|| (name.to_string(), end))
}

/// `$name.path[0]` shorthand starting at the `$`; `None` if the `$` does
/// not start a path
fn shorthand_end(src: &str, dollar: usize) -> Option<usize> {
    let mut p = dollar + 1;
    if src[p..].starts_with('.') {
        p += 1;
    }
    if !src[p..].starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        return None;
    }
    p = ident_end(src, p);
    loop {
        let rest = &src[p..];
        if rest.starts_with('.') && rest[1..].starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            p = ident_end(src, p + 1);
        } else if rest.starts_with('[') {
            match rest.find(']') {
                Some(i) if !rest[..i].contains(['\n', '<']) => p += i + 1,
                _ => break,
            }
        } else {
            break;
        }
    }
    Some(p)
}

/// Offset of the quote closing an attribute value that opened just before
/// `from`. `${...}` runs may contain the quote character.
fn closing_quote(src: &str, from: usize, quote: char) -> Option<usize> {
    let mut p = from;
    while p < src.len() {
        let rest = &src[p..];
        if rest.starts_with("${") {
            p = matching_close(src, p + 2, '}')? + 1;
            continue;
        }
        let c = rest.chars().next()?;
        if c == quote {
            return Some(p);
        }
        p += c.len_utf8();
    }
    None
}

/// Offset of the `close` bracket balancing an opener just before `from`.
/// Nested brackets and quoted strings are skipped.
fn matching_close(src: &str, from: usize, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut chars = src[from..].char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' | '\'' | '`' => loop {
                match chars.next() {
                    Some((_, '\\')) => {
                        chars.next();
                    }
                    Some((_, q)) if q == c => break,
                    Some(_) => {}
                    None => return None,
                }
            },
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                if depth == 0 {
                    return (c == close).then_some(from + i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// First offset at bracket depth 0, outside strings, where `stop` matches
/// the remaining text; `src.len()` when there is none. An unbalanced
/// closer also stops the scan.
fn scan_top_level(src: &str, from: usize, stop: impl Fn(&str) -> bool) -> usize {
    let mut depth = 0usize;
    let mut chars = src[from..].char_indices();
    while let Some((i, c)) = chars.next() {
        let at = from + i;
        if depth == 0 && stop(&src[at..]) {
            return at;
        }
        match c {
            '"' | '\'' | '`' => loop {
                match chars.next() {
                    Some((_, '\\')) => {
                        chars.next();
                    }
                    Some((_, q)) if q == c => break,
                    Some(_) => {}
                    None => return src.len(),
                }
            },
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                if depth == 0 {
                    return at;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    src.len()
}

// ============ Sanity Tests ============
// Most testing is done via integration tests in tests/integration.rs

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> ParsedTemplate {
        let parsed = parse_template(src);
        assert!(
            parsed.diagnostics.is_empty(),
            "unexpected diagnostics: {:?}",
            parsed.diagnostics
        );
        parsed
    }

    fn codes_of(parsed: &ParsedTemplate) -> Vec<&'static str> {
        parsed.diagnostics.iter().filter_map(|d| d.code).collect()
    }

    #[test]
    fn text_and_interpolation() {
        let parsed = parse_ok("Hi ${name}, you have $count.total items.");
        let [node] = parsed.nodes.as_slice() else {
            panic!("Expected one node");
        };
        let NodeKind::Text { segments } = &node.kind else {
            panic!("Expected text");
        };
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[4], TextSegment::Literal(" items.".into()));
    }

    #[test]
    fn escapes() {
        let parsed = parse_ok("@@home @{x@} \\${raw} user@example.com");
        let NodeKind::Text { segments } = &parsed.nodes[0].kind else {
            panic!("Expected text");
        };
        assert_eq!(
            segments,
            &vec![TextSegment::Literal("@home {x} ${raw} user@example.com".into())]
        );
    }

    #[test]
    fn elements_and_attributes() {
        let parsed = parse_ok(r#"<a href="/u/${id}" title='t' disabled data-x={n + 1} class=big>go</a><br>"#);
        assert_eq!(parsed.nodes.len(), 2);
        let NodeKind::Element {
            tag, attributes, ..
        } = &parsed.nodes[0].kind
        else {
            panic!("Expected element");
        };
        assert_eq!(tag, "a");
        assert!(matches!(attributes[0].value, AttributeValue::Mixed(_)));
        assert_eq!(attributes[1].value, AttributeValue::Static(Some("t".into())));
        assert_eq!(attributes[2].value, AttributeValue::Static(None));
        assert!(matches!(attributes[3].value, AttributeValue::Expr(_)));
        assert_eq!(attributes[4].value, AttributeValue::Static(Some("big".into())));
    }

    #[test]
    fn single_interpolation_attribute_is_an_expression() {
        let parsed = parse_ok(r#"<input checked="${done}">"#);
        let NodeKind::Element { attributes, .. } = &parsed.nodes[0].kind else {
            panic!("Expected element");
        };
        assert!(matches!(attributes[0].value, AttributeValue::Expr(_)));
    }

    #[test]
    fn if_else_chain() {
        let parsed = parse_ok("@if (a) { A } @else if (b) { B } @else { C }");
        let NodeKind::If {
            branches,
            else_branch,
        } = &parsed.nodes[0].kind
        else {
            panic!("Expected if");
        };
        assert_eq!(branches.len(), 2);
        assert!(else_branch.is_some());
    }

    #[test]
    fn for_heads() {
        let parsed = parse_ok("@for (item, i of items) {${i}} @for ($k in obj) {${k}}");
        let NodeKind::For {
            item_var,
            index_var,
            iteration,
            ..
        } = &parsed.nodes[0].kind
        else {
            panic!("Expected for");
        };
        assert_eq!(item_var, "item");
        assert_eq!(index_var.as_deref(), Some("i"));
        assert_eq!(*iteration, IterationKind::Of);
        assert!(matches!(
            parsed.nodes[2].kind,
            NodeKind::For {
                iteration: IterationKind::In,
                ..
            }
        ));
    }

    #[test]
    fn match_cases() {
        let parsed = parse_ok(r#"@match (v) { "a", "b" => { AB } -1 => { neg } _ > 3 => { big } _ => { other } }"#);
        let NodeKind::Match {
            cases,
            default_case,
            ..
        } = &parsed.nodes[0].kind
        else {
            panic!("Expected match");
        };
        assert_eq!(cases.len(), 3);
        assert!(matches!(&cases[0], MatchCase::Literal { values, .. } if values.len() == 2));
        assert!(
            matches!(&cases[1], MatchCase::Literal { values, .. } if values == &vec![Literal::Number(-1.0)])
        );
        assert!(matches!(&cases[2], MatchCase::Expression { .. }));
        assert!(default_case.is_some());
    }

    #[test]
    fn let_forms() {
        let parsed = parse_ok("@let x = 1 + 2;\n@let $.theme = 'dark'\n@let twice(n) = n * 2;");
        let lets: Vec<_> = parsed
            .nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Let {
                    name,
                    is_global,
                    value,
                } => Some((name.as_str(), *is_global, value)),
                _ => None,
            })
            .collect();
        assert_eq!(lets.len(), 3);
        assert_eq!((lets[0].0, lets[0].1), ("x", false));
        assert_eq!((lets[1].0, lets[1].1), ("theme", true));
        assert!(matches!(lets[2].2, LetValue::Function { params, .. } if params == &vec!["n".to_string()]));
    }

    #[test]
    fn braces_outside_blocks_are_text() {
        let parsed = parse_ok("a { b } c }");
        let NodeKind::Text { segments } = &parsed.nodes[0].kind else {
            panic!("Expected text");
        };
        assert_eq!(segments, &vec![TextSegment::Literal("a { b } c }".into())]);
    }

    #[test]
    fn literal_braces_inside_blocks_balance() {
        let parsed = parse_ok("@if (x) { f() { y } }after");
        let NodeKind::If { branches, .. } = &parsed.nodes[0].kind else {
            panic!("Expected if");
        };
        let NodeKind::Text { segments } = &branches[0].body[0].kind else {
            panic!("Expected text");
        };
        assert_eq!(segments, &vec![TextSegment::Literal(" f() { y } ".into())]);
    }

    #[test]
    fn style_is_raw_content() {
        let parsed = parse_ok("@if (x) {<style>body { font-family: ${font ?? 'Arial'}; }</style>}");
        let NodeKind::If { branches, .. } = &parsed.nodes[0].kind else {
            panic!("Expected if");
        };
        let NodeKind::Element { tag, children, .. } = &branches[0].body[0].kind else {
            panic!("Expected style element");
        };
        assert_eq!(tag, "style");
        let NodeKind::Text { segments } = &children[0].kind else {
            panic!("Expected text");
        };
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2], TextSegment::Literal("; }".into()));
    }

    #[test]
    fn components_slots_and_definitions() {
        let parsed = parse_ok(
            r#"<template:Card title subtitle? size="md"><h1>${title}</h1><slot/><slot name="footer">none</slot></template:Card><Card title="x" wide>body<template slot="footer">f</template></Card>"#,
        );
        let card = &parsed.components["Card"];
        assert_eq!(card.props.len(), 3);
        assert!(card.props[0].required);
        assert!(!card.props[1].required);
        assert!(card.props[2].default_value.is_some());
        assert!(matches!(card.body[1].kind, NodeKind::Slot { name: None, fallback: None }));
        assert!(matches!(&card.body[2].kind, NodeKind::Slot { name: Some(n), fallback: Some(_) } if n == "footer"));

        let [usage] = parsed.nodes.as_slice() else {
            panic!("Expected one node");
        };
        let NodeKind::Component { name, props, children } = &usage.kind else {
            panic!("Expected component");
        };
        assert_eq!(name, "Card");
        assert_eq!(props.len(), 2);
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn comments() {
        let parsed = parse_ok("<!-- keep -->\n// line\n/* block */x");
        let styles: Vec<_> = parsed
            .nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Comment { style, .. } => Some(*style),
                _ => None,
            })
            .collect();
        assert_eq!(
            styles,
            vec![CommentStyle::Html, CommentStyle::Line, CommentStyle::Block]
        );
        // not line-leading: plain text
        let parsed = parse_ok("see http://example.com");
        assert!(matches!(parsed.nodes[0].kind, NodeKind::Text { .. }));
    }

    #[test]
    fn recovers_from_errors() {
        let parsed = parse_template("<div>${a +}</span><p>ok</p>");
        let found = codes_of(&parsed);
        assert!(found.contains(&codes::INVALID_EXPRESSION));
        assert!(found.contains(&codes::UNEXPECTED_CLOSING_TAG));
        assert!(found.contains(&codes::UNCLOSED_ELEMENT));
        // the <p> after the errors still parses, nested in the unclosed div
        let NodeKind::Element { children, .. } = &parsed.nodes[0].kind else {
            panic!("Expected element");
        };
        assert!(children.iter().any(|c| matches!(&c.kind, NodeKind::Element { tag, .. } if tag == "p")));
    }

    #[test]
    fn unclosed_block_and_comment() {
        let parsed = parse_template("@if (x) { open");
        assert_eq!(codes_of(&parsed), vec![codes::UNCLOSED_BLOCK]);

        let parsed = parse_template("<!-- never");
        assert_eq!(codes_of(&parsed), vec![codes::UNCLOSED_COMMENT]);
    }

    #[test]
    fn diagnostics_point_at_the_template() {
        let parsed = parse_template("line one\n<b>${ 1 + }</b>");
        let diag = &parsed.diagnostics[0];
        assert_eq!(diag.location.start.line, 2);
        assert!(diag.location.start.column > 3);
    }
}
