//! pngine — a WebGPU scene bytecode engine.
//!
//! A declarative, macro-based scene description is compiled into a compact
//! binary module (PNGB) that can ride inside a PNG file, and a small
//! interpreter replays that module against an abstract GPU backend, frame by
//! frame. The pipeline:
//!
//! ```text
//! source ─ lexer ─ parser ─ analyzer ─ emitter ─► PNGB bytes
//!                                                    │
//!                              chunk::embed ◄────────┤
//!                                                    ▼
//!                                   Module::decode ─► Dispatcher ─► Backend
//! ```
//!
//! Compilation is a pure function of the source text: same input, same
//! bytes. The dispatcher is generic over [`backend::Backend`], so the
//! recording [`mock::MockBackend`] and the serializing
//! [`dispatch::command::CommandRecorder`] exercise the same code path a real
//! driver binding would.
//!
//! ```no_run
//! use pngine::{compile_to_bytes, Dispatcher, MockBackend, Module};
//!
//! let bytes = compile_to_bytes(r#"
//!     #wgsl tri { code = "@vertex fn vs() {}" }
//!     #renderPipeline p { vertex = { module = $wgsl.tri, entryPoint = "vs" } }
//!     #renderPass draw { colorAttachments = [{}], pipeline = $renderPipeline.p, draw = 3 }
//!     #frame main { perform = [$renderPass.draw] }
//! "#).unwrap();
//!
//! let module = Module::decode(&bytes).unwrap();
//! let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
//! dispatcher.init().unwrap();
//! dispatcher.frame(0.0, 512, 512, &[]).unwrap();
//! ```

pub mod analyze;
pub mod backend;
pub mod chunk;
pub mod diag;
pub mod dispatch;
pub mod emit;
pub mod lexer;
pub mod parser;
pub mod pngb;
pub mod scene;
pub mod uniforms;

pub mod mock;

use thiserror::Error;

pub use analyze::{analyze, analyze_with, AnalyzeError, Reflector};
pub use backend::{Backend, BackendError};
pub use diag::Span;
pub use dispatch::{DispatchError, Dispatcher};
pub use emit::{emit, Emitter};
pub use lexer::LexError;
pub use mock::MockBackend;
pub use parser::ParseError;
pub use pngb::{EmitError, FormatError, Module};
pub use scene::Scene;

/// A failure anywhere in the source-to-bytes pipeline.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{} analysis error(s)", .0.len())]
    Analyze(Vec<AnalyzeError>),
    #[error(transparent)]
    Emit(#[from] EmitError),
}

impl From<Vec<AnalyzeError>> for CompileError {
    fn from(errors: Vec<AnalyzeError>) -> Self {
        CompileError::Analyze(errors)
    }
}

/// Compile source text into an in-memory module.
pub fn compile(source: &str) -> Result<Module, CompileError> {
    let tokens = lexer::tokenize(source)?;
    let ast = parser::parse_tokens(tokens)?;
    let scene = analyze::analyze(source, &ast)?;
    Ok(emit::emit(&scene)?)
}

/// Compile source text straight to PNGB bytes.
pub fn compile_to_bytes(source: &str) -> Result<Vec<u8>, CompileError> {
    Ok(compile(source)?.encode()?)
}

/// Render every diagnostic in `error` against the source it came from.
pub fn render_diagnostics(source: &str, error: &CompileError) -> Vec<String> {
    match error {
        CompileError::Lex(err) => vec![diag::render(source, err)],
        CompileError::Parse(err) => vec![diag::render(source, err)],
        CompileError::Analyze(errors) => {
            errors.iter().map(|err| diag::render(source, err)).collect()
        }
        CompileError::Emit(err) => vec![err.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_produces_decodable_bytes() {
        let bytes = compile_to_bytes(
            r#"
            #frame main { perform = [] }
            "#,
        )
        .unwrap();
        let module = Module::decode(&bytes).unwrap();
        assert_eq!(module.strings, vec!["main".to_string()]);
    }

    #[test]
    fn diagnostics_carry_line_and_column() {
        let source = "#buffer b { size = }";
        let err = compile_to_bytes(source).unwrap_err();
        let rendered = render_diagnostics(source, &err);
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].starts_with("1:20:"), "{}", rendered[0]);
    }

    #[test]
    fn analysis_errors_are_all_reported() {
        let source = r#"
            #buffer a { size = 4, usage = [UNIFORM], bogus = 1, worse = 2 }
        "#;
        match compile(source).unwrap_err() {
            CompileError::Analyze(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected analysis errors, got {other}"),
        }
    }
}
