//! Tessera is an embeddable template engine compatible with the widely used
//! Jinja template syntax, aimed at rendering model chat templates,
//! configuration files, and other structured text without a scripting
//! runtime.
//!
//! Source goes through a lexer, a recursive-descent parser, and a bytecode
//! compiler; a stack VM executes the result with lexical scoping, loop state,
//! macros, template inheritance, includes and imports, autoescaping, and a
//! registry of filters, tests, and globals.
//!
//! # Example
//!
//! ```
//! use indexmap::IndexMap;
//! use tessera::{Environment, Object};
//!
//! let env = Environment::new();
//! let mut vars = IndexMap::new();
//! vars.insert("name".to_owned(), Object::from("world"));
//! let out = env.render_string("Hello {{ name }}!", "hello", vars).unwrap();
//! assert_eq!(out, "Hello world!");
//! ```
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are bounds-checked")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors the reference engine")]
#![expect(clippy::must_use_candidate, reason = "builder-style accessors are self-evident")]
#![expect(clippy::float_cmp, reason = "value equality requires exact float comparison")]
#![expect(clippy::struct_excessive_bools, reason = "option flags mirror the reference engine API")]

mod args;
mod asyncio;
mod builtins;
mod bytecode;
mod environment;
mod error;
mod expressions;
mod lexer;
mod loader;
mod object;
mod output;
mod parse;
mod template;
mod value;

pub use crate::{
    environment::{Autoescape, Environment, HostFilterFn, HostGlobalFn, SyntaxConfig, UndefinedPolicy},
    error::{Error, ErrorKind, SourceLoc},
    loader::{DictLoader, FileSystemLoader, Loader, TemplateSource},
    object::Object,
};
