//! Iterative parser producing a compact structure-of-arrays AST.
//!
//! Nodes live in one flat array of `(tag, lhs, rhs, token)` entries; anything
//! with more than two children spills a half-open range into `extra`. The
//! parser never recurses: nested records and lists push frames onto an
//! explicit work stack, capped at [`MAX_DEPTH`].

use crate::diag::{Located, Span};
use crate::lexer::{Tag, Token};

/// Sentinel for an absent node or token index.
pub const NIL: u32 = u32::MAX;

/// Nesting limit for records and lists.
pub const MAX_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeTag {
    /// `extra[lhs..rhs]` lists the macro declaration nodes. Always `nodes[0]`.
    Root,
    /// `token` is the keyword, `lhs` the name token index, `rhs` the body record.
    MacroDecl,
    /// `token` is the field name, `lhs` the value node.
    Field,
    /// `extra[lhs..rhs]` lists field nodes.
    Record,
    /// `extra[lhs..rhs]` lists value nodes.
    List,
    Reference,
    Str,
    Number,
    Ident,
}

#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub tag: NodeTag,
    pub lhs: u32,
    pub rhs: u32,
    /// Index of the token this node was built from, or [`NIL`].
    pub token: u32,
}

/// Parse output: the token array plus the node/extra arrays that reference it.
#[derive(Debug)]
pub struct Ast {
    pub tokens: Vec<Token>,
    pub nodes: Vec<Node>,
    pub extra: Vec<u32>,
}

impl Ast {
    pub fn node(&self, id: u32) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn token(&self, index: u32) -> &Token {
        &self.tokens[index as usize]
    }

    /// The children range of a `Root`, `Record` or `List` node.
    pub fn children(&self, node: &Node) -> &[u32] {
        &self.extra[node.lhs as usize..node.rhs as usize]
    }

    pub fn node_span(&self, id: u32) -> Span {
        let node = self.node(id);
        if node.token != NIL {
            return self.token(node.token).span;
        }
        // Containers have no token of their own; fall back to the first child.
        match self.children(node).first() {
            Some(&child) => self.node_span(child),
            None => Span::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnexpectedToken { expected: &'static str, got: Tag },
    TooDeep,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub span: Span,
}

impl std::error::Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ParseErrorKind::UnexpectedToken { expected, got } => {
                write!(f, "expected {expected}, found {got:?}")
            }
            ParseErrorKind::TooDeep => {
                write!(f, "nesting exceeds the {MAX_DEPTH}-level limit")
            }
        }
    }
}

impl Located for ParseError {
    fn span(&self) -> Span {
        self.span
    }
}

/// One unfinished container on the work stack.
enum Frame {
    Record {
        children: Vec<u32>,
        /// Field-name token waiting for its value, if the parser sits
        /// between `=` and the value.
        pending_field: Option<u32>,
    },
    List {
        children: Vec<u32>,
    },
}

/// What the collapsed container should become once its frame pops.
enum Finished {
    Value(u32),
    MacroBody(u32),
}

pub fn parse_tokens(tokens: Vec<Token>) -> Result<Ast, ParseError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        nodes: Vec::new(),
        extra: Vec::new(),
    };
    // nodes[0] is the root; its extra range is patched once all macros parsed.
    parser.nodes.push(Node {
        tag: NodeTag::Root,
        lhs: 0,
        rhs: 0,
        token: NIL,
    });
    let mut macros = Vec::new();
    while parser.peek().tag != Tag::Eof {
        macros.push(parser.macro_decl()?);
    }
    let lhs = parser.extra.len() as u32;
    parser.extra.extend_from_slice(&macros);
    let rhs = parser.extra.len() as u32;
    parser.nodes[0].lhs = lhs;
    parser.nodes[0].rhs = rhs;
    Ok(Ast {
        tokens: parser.tokens,
        nodes: parser.nodes,
        extra: parser.extra,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nodes: Vec<Node>,
    extra: Vec<u32>,
}

impl Parser {
    fn peek(&self) -> Token {
        self.tokens[self.pos]
    }

    fn bump(&mut self) -> (Token, u32) {
        let index = self.pos as u32;
        let token = self.tokens[self.pos];
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        (token, index)
    }

    fn expect(&mut self, tag: Tag, expected: &'static str) -> Result<u32, ParseError> {
        let token = self.peek();
        if token.tag != tag {
            return Err(self.unexpected(expected));
        }
        Ok(self.bump().1)
    }

    fn unexpected(&self, expected: &'static str) -> ParseError {
        let token = self.peek();
        ParseError {
            kind: ParseErrorKind::UnexpectedToken {
                expected,
                got: token.tag,
            },
            span: token.span,
        }
    }

    fn push_node(&mut self, node: Node) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(node);
        id
    }

    fn leaf(&mut self, tag: NodeTag, token: u32) -> u32 {
        self.push_node(Node {
            tag,
            lhs: NIL,
            rhs: NIL,
            token,
        })
    }

    fn container(&mut self, tag: NodeTag, children: &[u32]) -> u32 {
        let lhs = self.extra.len() as u32;
        self.extra.extend_from_slice(children);
        let rhs = self.extra.len() as u32;
        self.push_node(Node {
            tag,
            lhs,
            rhs,
            token: NIL,
        })
    }

    /// `'#' keyword ident '{' fields '}'`
    fn macro_decl(&mut self) -> Result<u32, ParseError> {
        let keyword = self.peek();
        let keyword_index = match keyword.tag {
            Tag::Macro(_) => self.bump().1,
            _ => return Err(self.unexpected("a macro declaration")),
        };
        let name = self.expect(Tag::Ident, "a declaration name")?;
        self.expect(Tag::LBrace, "`{`")?;
        let body = self.record_body()?;
        Ok(self.push_node(Node {
            tag: NodeTag::MacroDecl,
            lhs: name,
            rhs: body,
            token: keyword_index,
        }))
    }

    /// Parse the fields after an already-consumed `{` and every container
    /// nested inside them, without recursion. Returns the record node.
    fn record_body(&mut self) -> Result<u32, ParseError> {
        let mut stack: Vec<Frame> = vec![Frame::Record {
            children: Vec::new(),
            pending_field: None,
        }];

        loop {
            // Decide what the current frame wants next.
            let expects_value = match stack.last() {
                Some(Frame::Record { pending_field, .. }) => pending_field.is_some(),
                Some(Frame::List { .. }) => true,
                None => unreachable!("stack never drains without returning"),
            };

            if !expects_value {
                // Record position: either a field or the closing brace.
                match self.peek().tag {
                    Tag::RBrace => {
                        let finished = self.close_record(&mut stack)?;
                        match finished {
                            Finished::MacroBody(id) => return Ok(id),
                            Finished::Value(id) => self.attach(&mut stack, id)?,
                        }
                        continue;
                    }
                    Tag::Ident => {
                        let name = self.bump().1;
                        self.expect(Tag::Eq, "`=`")?;
                        match stack.last_mut() {
                            Some(Frame::Record { pending_field, .. }) => {
                                *pending_field = Some(name)
                            }
                            _ => unreachable!("field position implies a record frame"),
                        }
                        continue;
                    }
                    _ => return Err(self.unexpected("a field name or `}`")),
                }
            }

            // Value position.
            let token = self.peek();
            match token.tag {
                Tag::Str => {
                    let index = self.bump().1;
                    let id = self.leaf(NodeTag::Str, index);
                    self.attach(&mut stack, id)?;
                }
                Tag::Int | Tag::Float => {
                    let index = self.bump().1;
                    let id = self.leaf(NodeTag::Number, index);
                    self.attach(&mut stack, id)?;
                }
                Tag::Reference => {
                    let index = self.bump().1;
                    let id = self.leaf(NodeTag::Reference, index);
                    self.attach(&mut stack, id)?;
                }
                Tag::Ident => {
                    let index = self.bump().1;
                    let id = self.leaf(NodeTag::Ident, index);
                    self.attach(&mut stack, id)?;
                }
                Tag::LBrace => {
                    self.bump();
                    self.push_frame(
                        &mut stack,
                        Frame::Record {
                            children: Vec::new(),
                            pending_field: None,
                        },
                    )?;
                }
                Tag::LBracket => {
                    self.bump();
                    self.push_frame(&mut stack, Frame::List { children: Vec::new() })?;
                }
                Tag::RBracket => {
                    // Empty list or list close right after a comma.
                    let id = self.close_list(&mut stack)?;
                    self.attach(&mut stack, id)?;
                }
                _ => return Err(self.unexpected("a value")),
            }
        }
    }

    fn push_frame(&mut self, stack: &mut Vec<Frame>, frame: Frame) -> Result<(), ParseError> {
        if stack.len() >= MAX_DEPTH {
            return Err(ParseError {
                kind: ParseErrorKind::TooDeep,
                span: self.peek().span,
            });
        }
        stack.push(frame);
        Ok(())
    }

    fn close_record(&mut self, stack: &mut Vec<Frame>) -> Result<Finished, ParseError> {
        self.expect(Tag::RBrace, "`}`")?;
        let children = match stack.pop() {
            Some(Frame::Record {
                children,
                pending_field: None,
            }) => children,
            _ => unreachable!("close_record only runs in field position"),
        };
        let id = self.container(NodeTag::Record, &children);
        if stack.is_empty() {
            Ok(Finished::MacroBody(id))
        } else {
            Ok(Finished::Value(id))
        }
    }

    fn close_list(&mut self, stack: &mut Vec<Frame>) -> Result<u32, ParseError> {
        self.expect(Tag::RBracket, "`]`")?;
        let children = match stack.pop() {
            Some(Frame::List { children }) => children,
            _ => return Err(self.unexpected("a value")),
        };
        Ok(self.container(NodeTag::List, &children))
    }

    /// Hand a finished value to the enclosing frame and consume the separator
    /// that follows it.
    fn attach(&mut self, stack: &mut Vec<Frame>, value: u32) -> Result<(), ParseError> {
        match stack.last_mut() {
            Some(Frame::Record {
                children,
                pending_field,
            }) => {
                let name = pending_field
                    .take()
                    .unwrap_or_else(|| unreachable!("value position implies a pending field"));
                let field = self.push_node(Node {
                    tag: NodeTag::Field,
                    lhs: value,
                    rhs: NIL,
                    token: name,
                });
                children.push(field);
                match self.peek().tag {
                    Tag::Comma => {
                        self.bump();
                        Ok(())
                    }
                    Tag::RBrace => Ok(()),
                    _ => Err(self.unexpected("`,` or `}`")),
                }
            }
            Some(Frame::List { children }) => {
                children.push(value);
                match self.peek().tag {
                    Tag::Comma => {
                        self.bump();
                        Ok(())
                    }
                    Tag::RBracket => Ok(()),
                    _ => Err(self.unexpected("`,` or `]`")),
                }
            }
            None => unreachable!("attach never runs on an empty stack"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse(source: &str) -> Result<Ast, ParseError> {
        parse_tokens(tokenize(source).unwrap())
    }

    fn parse_ok(source: &str) -> Ast {
        parse(source).unwrap()
    }

    #[test]
    fn root_lists_macros() {
        let ast = parse_ok("#buffer a { size = 4 } #buffer b { size = 8 }");
        let root = ast.node(0);
        assert_eq!(root.tag, NodeTag::Root);
        let decls = ast.children(root);
        assert_eq!(decls.len(), 2);
        for &decl in decls {
            assert_eq!(ast.node(decl).tag, NodeTag::MacroDecl);
        }
    }

    #[test]
    fn nested_values() {
        let ast = parse_ok(
            "#renderPipeline p { vertex = { module = $wgsl.m, buffers = [ { stride = 16 } ] } }",
        );
        let decl = ast.children(ast.node(0))[0];
        let body = ast.node(ast.node(decl).rhs);
        assert_eq!(body.tag, NodeTag::Record);
        let field = ast.node(ast.children(body)[0]);
        assert_eq!(field.tag, NodeTag::Field);
        let vertex = ast.node(field.lhs);
        assert_eq!(vertex.tag, NodeTag::Record);
        assert_eq!(ast.children(vertex).len(), 2);
    }

    #[test]
    fn empty_list_and_trailing_comma() {
        let ast = parse_ok("#frame f { before = [], perform = [$renderPass.p,] }");
        let decl = ast.children(ast.node(0))[0];
        let body = ast.node(ast.node(decl).rhs);
        assert_eq!(ast.children(body).len(), 2);
    }

    #[test]
    fn non_terminal_indices_are_valid() {
        let ast = parse_ok("#computePass c { dispatch = [8, 8, 1], groups = [{ slot = 0 }] }");
        let count = ast.nodes.len() as u32;
        for node in &ast.nodes {
            match node.tag {
                NodeTag::Root | NodeTag::Record | NodeTag::List => {
                    for &child in ast.children(node) {
                        assert!(child < count);
                    }
                }
                NodeTag::Field => assert!(node.lhs < count),
                NodeTag::MacroDecl => assert!(node.rhs < count),
                _ => {}
            }
        }
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut source = String::from("#data d { v = ");
        for _ in 0..80 {
            source.push('[');
        }
        let err = parse(&source).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooDeep);
    }

    #[test]
    fn missing_value_is_reported() {
        let err = parse("#buffer b { size = }").unwrap_err();
        assert!(matches!(
            err.kind,
            ParseErrorKind::UnexpectedToken { expected: "a value", .. }
        ));
    }

    #[test]
    fn stray_token_at_top_level() {
        let err = parse("42").unwrap_err();
        assert!(matches!(
            err.kind,
            ParseErrorKind::UnexpectedToken { expected: "a macro declaration", .. }
        ));
    }
}
