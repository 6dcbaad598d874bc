//! Hybris front end: tokenizer and recursive-descent parser.
//!
//! Produces the AST consumed by the runtime's execution engine.
//! The parser owns nothing at run time: every `Node` is immutable once
//! built, and the runtime shares subtrees via `Arc` (function bodies,
//! method prototypes).

pub mod ast;
pub mod parser;

pub use ast::{Access, BinOp, Literal, Node, NodeKind, UnOp};
pub use parser::{ParseError, Parser};
