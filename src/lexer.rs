//! Tokenizer for the scene DSL.
//!
//! The lexer is a byte state machine with one byte of lookahead. Tokens never
//! own text; each one is a tag plus a span into the source, and the source is
//! treated as if terminated by a zero sentinel so the hot loop needs no
//! explicit end-of-input branches. Token storage is pre-sized with a rough
//! one-token-per-eight-bytes heuristic and grows geometrically from there.

use crate::diag::{Located, Span};

/// The closed set of macro keywords.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MacroKind {
    Buffer,
    Texture,
    Sampler,
    Wgsl,
    BindGroupLayout,
    PipelineLayout,
    BindGroup,
    RenderPipeline,
    ComputePipeline,
    RenderPass,
    ComputePass,
    Frame,
    Queue,
    Animation,
    Define,
    WasmCall,
    Data,
}

impl MacroKind {
    /// Keyword lookup for the text after `#`.
    pub fn from_keyword(word: &str) -> Option<MacroKind> {
        Some(match word {
            "buffer" => MacroKind::Buffer,
            "texture" => MacroKind::Texture,
            "sampler" => MacroKind::Sampler,
            "wgsl" => MacroKind::Wgsl,
            "bindGroupLayout" => MacroKind::BindGroupLayout,
            "pipelineLayout" => MacroKind::PipelineLayout,
            "bindGroup" => MacroKind::BindGroup,
            "renderPipeline" => MacroKind::RenderPipeline,
            "computePipeline" => MacroKind::ComputePipeline,
            "renderPass" => MacroKind::RenderPass,
            "computePass" => MacroKind::ComputePass,
            "frame" => MacroKind::Frame,
            "queue" => MacroKind::Queue,
            "animation" => MacroKind::Animation,
            "define" => MacroKind::Define,
            "wasmCall" => MacroKind::WasmCall,
            "data" => MacroKind::Data,
            _ => return None,
        })
    }
}

/// Reference namespaces accepted after `$`.
pub const NAMESPACES: &[&str] = &[
    "buffer",
    "texture",
    "sampler",
    "wgsl",
    "bindGroupLayout",
    "pipelineLayout",
    "bindGroup",
    "renderPipeline",
    "computePipeline",
    "renderPass",
    "computePass",
    "frame",
    "queue",
    "data",
    "define",
    "canvas",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Macro(MacroKind),
    Ident,
    /// Double-quoted string literal, span includes the quotes.
    Str,
    Int,
    Float,
    /// An atomic `$ns.name` reference.
    Reference,
    Eq,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Eof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token {
    pub tag: Tag,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LexErrorKind {
    UnexpectedByte(u8),
    UnterminatedString,
    UnterminatedComment,
    BadNumber,
    UnknownMacro,
    UnknownNamespace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LexError {
    pub kind: LexErrorKind,
    pub span: Span,
}

impl std::error::Error for LexError {}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            LexErrorKind::UnexpectedByte(b) => {
                if b.is_ascii_graphic() {
                    write!(f, "unexpected character `{}`", b as char)
                } else {
                    write!(f, "unexpected byte 0x{b:02x}")
                }
            }
            LexErrorKind::UnterminatedString => write!(f, "unterminated string literal"),
            LexErrorKind::UnterminatedComment => write!(f, "unterminated block comment"),
            LexErrorKind::BadNumber => write!(f, "malformed number literal"),
            LexErrorKind::UnknownMacro => write!(f, "unknown macro keyword"),
            LexErrorKind::UnknownNamespace => write!(f, "unknown reference namespace"),
        }
    }
}

impl Located for LexError {
    fn span(&self) -> Span {
        self.span
    }
}

/// Tokenize `source` into a token array ending with a single [`Tag::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::with_capacity(source.len() / 8 + 4);
    loop {
        let token = lexer.next_token()?;
        let done = token.tag == Tag::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
}

impl<'s> Lexer<'s> {
    fn new(source: &'s str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
        }
    }

    /// Current byte, or the zero sentinel past the end.
    fn byte(&self) -> u8 {
        self.src.get(self.pos).copied().unwrap_or(0)
    }

    fn byte_at(&self, at: usize) -> u8 {
        self.src.get(at).copied().unwrap_or(0)
    }

    fn err(&self, kind: LexErrorKind, start: usize) -> LexError {
        let end = self.pos.min(self.src.len()).max(start);
        LexError {
            kind,
            span: Span::new(start.min(end), end),
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia()?;
        let start = self.pos;
        let b = self.byte();
        let tag = match b {
            0 if self.pos >= self.src.len() => {
                return Ok(Token {
                    tag: Tag::Eof,
                    span: Span::point(self.src.len()),
                })
            }
            b'#' => return self.macro_keyword(),
            b'$' => return self.reference(),
            b'"' => return self.string(),
            b'=' => {
                self.pos += 1;
                Tag::Eq
            }
            b'{' => {
                self.pos += 1;
                Tag::LBrace
            }
            b'}' => {
                self.pos += 1;
                Tag::RBrace
            }
            b'[' => {
                self.pos += 1;
                Tag::LBracket
            }
            b']' => {
                self.pos += 1;
                Tag::RBracket
            }
            b',' => {
                self.pos += 1;
                Tag::Comma
            }
            b':' => {
                self.pos += 1;
                Tag::Colon
            }
            b'-' | b'+' | b'0'..=b'9' => return self.number(),
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                self.ident();
                Tag::Ident
            }
            other => {
                self.pos += 1;
                return Err(self.err(LexErrorKind::UnexpectedByte(other), start));
            }
        };
        Ok(Token {
            tag,
            span: Span::new(start, self.pos),
        })
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.byte() {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'/' if self.byte_at(self.pos + 1) == b'/' => {
                    while self.pos < self.src.len() && self.byte() != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.byte_at(self.pos + 1) == b'*' => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos >= self.src.len() {
                            return Err(self.err(LexErrorKind::UnterminatedComment, start));
                        }
                        if self.byte() == b'*' && self.byte_at(self.pos + 1) == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Consume `[A-Za-z_][A-Za-z0-9_]*` and return its span.
    fn ident(&mut self) -> Span {
        let start = self.pos;
        while matches!(self.byte(), b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_') {
            self.pos += 1;
        }
        Span::new(start, self.pos)
    }

    fn macro_keyword(&mut self) -> Result<Token, LexError> {
        let start = self.pos;
        self.pos += 1;
        let word = self.ident();
        let text = std::str::from_utf8(&self.src[word.start as usize..word.end as usize])
            .expect("identifier bytes are ASCII");
        match MacroKind::from_keyword(text) {
            Some(kind) => Ok(Token {
                tag: Tag::Macro(kind),
                span: Span::new(start, self.pos),
            }),
            None => Err(LexError {
                kind: LexErrorKind::UnknownMacro,
                span: Span::new(start, self.pos),
            }),
        }
    }

    /// `$ns.name` as one atomic token. The namespace must be a known keyword.
    fn reference(&mut self) -> Result<Token, LexError> {
        let start = self.pos;
        self.pos += 1;
        let ns = self.ident();
        let ns_text = std::str::from_utf8(&self.src[ns.start as usize..ns.end as usize])
            .expect("identifier bytes are ASCII");
        if !NAMESPACES.contains(&ns_text) {
            return Err(LexError {
                kind: LexErrorKind::UnknownNamespace,
                span: Span::new(start, self.pos),
            });
        }
        if self.byte() != b'.' {
            self.pos += 1;
            return Err(self.err(LexErrorKind::UnexpectedByte(self.byte_at(self.pos - 1)), start));
        }
        self.pos += 1;
        let name = self.ident();
        if name.start == name.end {
            return Err(self.err(LexErrorKind::UnexpectedByte(self.byte()), start));
        }
        Ok(Token {
            tag: Tag::Reference,
            span: Span::new(start, self.pos),
        })
    }

    fn string(&mut self) -> Result<Token, LexError> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.byte() {
                0 if self.pos >= self.src.len() => {
                    return Err(LexError {
                        kind: LexErrorKind::UnterminatedString,
                        span: Span::new(start, self.src.len()),
                    })
                }
                b'"' => {
                    self.pos += 1;
                    return Ok(Token {
                        tag: Tag::Str,
                        span: Span::new(start, self.pos),
                    });
                }
                b'\\' => {
                    match self.byte_at(self.pos + 1) {
                        b'\\' | b'"' | b'n' | b't' => self.pos += 2,
                        other => {
                            self.pos += 1;
                            return Err(self.err(LexErrorKind::UnexpectedByte(other), self.pos));
                        }
                    }
                }
                b'\n' => {
                    return Err(LexError {
                        kind: LexErrorKind::UnterminatedString,
                        span: Span::new(start, self.pos),
                    })
                }
                _ => self.pos += 1,
            }
        }
    }

    fn number(&mut self) -> Result<Token, LexError> {
        let start = self.pos;
        if matches!(self.byte(), b'-' | b'+') {
            self.pos += 1;
        }
        let digits = self.digits();
        if digits == 0 {
            self.pos += 1;
            return Err(self.err(LexErrorKind::BadNumber, start));
        }
        let mut tag = Tag::Int;
        if self.byte() == b'.' {
            // A digit must follow; `1.` is malformed.
            self.pos += 1;
            if self.digits() == 0 {
                return Err(self.err(LexErrorKind::BadNumber, start));
            }
            tag = Tag::Float;
        }
        if matches!(self.byte(), b'e' | b'E') {
            self.pos += 1;
            if matches!(self.byte(), b'-' | b'+') {
                self.pos += 1;
            }
            if self.digits() == 0 {
                return Err(self.err(LexErrorKind::BadNumber, start));
            }
            tag = Tag::Float;
        }
        // An identifier glued onto a number is a lex error, not two tokens.
        if matches!(self.byte(), b'A'..=b'Z' | b'a'..=b'z' | b'_') {
            self.pos += 1;
            return Err(self.err(LexErrorKind::BadNumber, start));
        }
        Ok(Token {
            tag,
            span: Span::new(start, self.pos),
        })
    }

    fn digits(&mut self) -> usize {
        let start = self.pos;
        while self.byte().is_ascii_digit() {
            self.pos += 1;
        }
        self.pos - start
    }
}

/// Decode the text of a [`Tag::Str`] token, resolving escapes.
pub fn string_value(source: &str, span: Span) -> String {
    let raw = &source[span.start as usize + 1..span.end as usize - 1];
    if !raw.contains('\\') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut bytes = raw.bytes();
    while let Some(b) = bytes.next() {
        if b == b'\\' {
            match bytes.next() {
                Some(b'n') => out.push('\n'),
                Some(b't') => out.push('\t'),
                Some(b'"') => out.push('"'),
                Some(b'\\') => out.push('\\'),
                _ => unreachable!("lexer validated escapes"),
            }
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Split a [`Tag::Reference`] token into `(namespace, name)`.
pub fn reference_parts(source: &str, span: Span) -> (&str, &str) {
    let text = &source[span.start as usize + 1..span.end as usize];
    let dot = text.find('.').expect("reference token contains a dot");
    (&text[..dot], &text[dot + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(source: &str) -> Vec<Tag> {
        tokenize(source).unwrap().iter().map(|t| t.tag).collect()
    }

    #[test]
    fn spans_stay_in_bounds() {
        let src = "#buffer b { size = 16, usage = [UNIFORM] }";
        for token in tokenize(src).unwrap() {
            assert!(token.span.start <= token.span.end);
            assert!(token.span.end as usize <= src.len());
        }
    }

    #[test]
    fn macro_and_fields() {
        assert_eq!(
            tags("#frame main { perform = [$renderPass.draw] }"),
            vec![
                Tag::Macro(MacroKind::Frame),
                Tag::Ident,
                Tag::LBrace,
                Tag::Ident,
                Tag::Eq,
                Tag::LBracket,
                Tag::Reference,
                Tag::RBracket,
                Tag::RBrace,
                Tag::Eof,
            ]
        );
    }

    #[test]
    fn reference_is_atomic() {
        let src = "$wgsl.common";
        let tokens = tokenize(src).unwrap();
        assert_eq!(tokens[0].tag, Tag::Reference);
        assert_eq!(tokens[0].span.slice(src), "$wgsl.common");
        assert_eq!(reference_parts(src, tokens[0].span), ("wgsl", "common"));
    }

    #[test]
    fn unknown_namespace_is_an_error() {
        let err = tokenize("$nope.x").unwrap_err();
        assert_eq!(err.kind, LexErrorKind::UnknownNamespace);
    }

    #[test]
    fn numbers() {
        assert_eq!(tags("3 -7 0.5 1.0e-3 +2")[..5].to_vec(), vec![
            Tag::Int,
            Tag::Int,
            Tag::Float,
            Tag::Float,
            Tag::Int,
        ]);
        assert_eq!(
            tokenize("1.").unwrap_err().kind,
            LexErrorKind::BadNumber
        );
        assert_eq!(
            tokenize("12px").unwrap_err().kind,
            LexErrorKind::BadNumber
        );
    }

    #[test]
    fn strings_and_escapes() {
        let src = r#""a\n\"b\"""#;
        let tokens = tokenize(src).unwrap();
        assert_eq!(tokens[0].tag, Tag::Str);
        assert_eq!(string_value(src, tokens[0].span), "a\n\"b\"");
        assert_eq!(
            tokenize("\"open").unwrap_err().kind,
            LexErrorKind::UnterminatedString
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            tags("// line\n/* block\nstill */ 1"),
            vec![Tag::Int, Tag::Eof]
        );
        assert_eq!(
            tokenize("/* open").unwrap_err().kind,
            LexErrorKind::UnterminatedComment
        );
    }

    #[test]
    fn unknown_macro_is_an_error() {
        assert_eq!(
            tokenize("#blorp x {}").unwrap_err().kind,
            LexErrorKind::UnknownMacro
        );
    }
}
