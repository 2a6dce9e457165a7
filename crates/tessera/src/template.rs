//! Compiled template objects.

use std::sync::Arc;

use ahash::AHashMap;

use crate::bytecode::Code;

/// One block definition collected from a template.
#[derive(Debug)]
pub(crate) struct BlockDef {
    pub name: String,
    pub code: Code,
    /// Must be overridden by a descendant before rendering.
    pub required: bool,
    /// Sees the loop/with variables at its textual call position.
    pub scoped: bool,
}

/// One declared macro parameter.
#[derive(Debug, Clone)]
pub(crate) struct MacroParam {
    pub name: String,
    pub has_default: bool,
}

/// A compiled macro definition. Default expressions live in the code chunk's
/// prologue so they are evaluated when arguments are bound.
#[derive(Debug)]
pub(crate) struct MacroDef {
    pub name: String,
    pub params: Vec<MacroParam>,
    pub code: Code,
}

/// A fully compiled template: the root chunk, its block table for
/// inheritance, and its macro table.
///
/// Immutable after compilation; shared between the environment cache and any
/// VM currently rendering it.
#[derive(Debug)]
pub(crate) struct Template {
    pub name: String,
    pub filename: Option<String>,
    pub root: Code,
    pub blocks: AHashMap<String, Arc<BlockDef>>,
    pub macros: Vec<Arc<MacroDef>>,
    /// Statically known from the parse: the root begins with `{% extends %}`.
    pub has_extends: bool,
}
