//! The engine configuration object.
//!
//! An [`Environment`] holds the delimiter syntax, whitespace and autoescape
//! options, the filter/test/global registries, the loader, and the compiled
//! template cache. Configure it up front, then render from as many threads as
//! you like: rendering never mutates shared state outside the cache mutex.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    asyncio::AsyncId,
    builtins::{BuiltinFilter, BuiltinGlobal, BuiltinTest},
    bytecode::{compile_template, vm::Vm},
    error::{Error, ErrorKind, RunResult},
    lexer::{LexOptions, lex},
    loader::Loader,
    object::Object,
    parse::parse,
    template::Template,
    value::{Callable, Value, ValueMap},
};

/// The three delimiter pairs recognized by the lexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxConfig {
    pub block_start: String,
    pub block_end: String,
    pub variable_start: String,
    pub variable_end: String,
    pub comment_start: String,
    pub comment_end: String,
}

impl Default for SyntaxConfig {
    fn default() -> Self {
        Self {
            block_start: "{%".to_owned(),
            block_end: "%}".to_owned(),
            variable_start: "{{".to_owned(),
            variable_end: "}}".to_owned(),
            comment_start: "{#".to_owned(),
            comment_end: "#}".to_owned(),
        }
    }
}

/// Autoescape configuration: off, on, or decided per template name.
#[derive(Clone, Default)]
pub enum Autoescape {
    #[default]
    Off,
    On,
    /// Called with the template name; `render_string` passes the given name.
    Callback(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl fmt::Debug for Autoescape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("Off"),
            Self::On => f.write_str("On"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// How undefined values behave.
///
/// `Lenient` and `Chainable` follow the base rules (render empty, falsy,
/// iterate empty, chain through attribute and subscript lookup); `Strict`
/// elevates every use of an undefined value to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndefinedPolicy {
    #[default]
    Lenient,
    Strict,
    Chainable,
}

/// Signature for host-registered filters and tests:
/// `(value, positional args, kwargs) -> value`.
pub type HostFilterFn =
    dyn Fn(Object, &[Object], &IndexMap<String, Object>) -> Result<Object, Error> + Send + Sync;

/// Signature for host-registered global functions.
pub type HostGlobalFn = dyn Fn(&[Object], &IndexMap<String, Object>) -> Result<Object, Error> + Send + Sync;

/// A host-registered filter or test, with an optional async variant used by
/// the async render entry points.
#[derive(Clone)]
pub(crate) struct HostFilter {
    pub sync_fn: Arc<HostFilterFn>,
    pub async_fn: Option<Arc<HostFilterFn>>,
}

impl fmt::Debug for HostFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFilter")
            .field("has_async", &self.async_fn.is_some())
            .finish()
    }
}

impl HostFilter {
    /// Converts runtime values across the host boundary and back.
    pub fn call_sync(&self, value: &Value, pos: &[Value], kwargs: &ValueMap) -> RunResult<Value> {
        let value = Object::from_value(value);
        let pos: Vec<Object> = pos.iter().map(Object::from_value).collect();
        let kwargs: IndexMap<String, Object> =
            kwargs.iter().map(|(k, v)| (k.clone(), Object::from_value(v))).collect();
        (self.sync_fn)(value, &pos, &kwargs).map(Object::into_value)
    }
}

/// A registered global: a plain value or a host function.
pub(crate) enum GlobalEntry {
    Value(Object),
    Func { name: String, func: Arc<HostGlobalFn> },
}

impl fmt::Debug for GlobalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Func { name, .. } => f.debug_tuple("Func").field(name).finish(),
        }
    }
}

/// A resolved filter: host registrations shadow builtins by name.
pub(crate) enum FilterImpl<'e> {
    Host(&'e HostFilter),
    Builtin(BuiltinFilter),
}

pub(crate) enum TestImpl<'e> {
    Host(&'e HostFilter),
    Builtin(BuiltinTest),
}

/// An abstraction that holds the engine configuration.
///
/// Construct one with [`Environment::new`], configure it, then call
/// [`render_string`](Self::render_string) or
/// [`render_template`](Self::render_template).
#[derive(Debug)]
pub struct Environment {
    syntax: SyntaxConfig,
    trim_blocks: bool,
    lstrip_blocks: bool,
    keep_trailing_newline: bool,
    line_statement_prefix: Option<String>,
    autoescape: Autoescape,
    enable_async: bool,
    undefined: UndefinedPolicy,
    filters: AHashMap<String, HostFilter>,
    tests: AHashMap<String, HostFilter>,
    globals: AHashMap<String, GlobalEntry>,
    loader: Option<Box<dyn Loader>>,
    cache: Mutex<AHashMap<String, Arc<Template>>>,
    async_ids: AtomicU32,
}

impl fmt::Debug for dyn Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<loader>")
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Creates an environment with the default delimiters and all built-in
    /// filters, tests, and globals available.
    #[must_use]
    pub fn new() -> Self {
        Self {
            syntax: SyntaxConfig::default(),
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: false,
            line_statement_prefix: None,
            autoescape: Autoescape::Off,
            enable_async: false,
            undefined: UndefinedPolicy::default(),
            filters: AHashMap::new(),
            tests: AHashMap::new(),
            globals: AHashMap::new(),
            loader: None,
            cache: Mutex::new(AHashMap::new()),
            async_ids: AtomicU32::new(0),
        }
    }

    // --- configuration ---

    pub fn set_syntax(&mut self, syntax: SyntaxConfig) {
        self.syntax = syntax;
    }

    /// When set, a newline directly after a block tag is removed.
    pub fn set_trim_blocks(&mut self, enabled: bool) {
        self.trim_blocks = enabled;
    }

    /// When set, leading whitespace on a block tag's line is removed.
    pub fn set_lstrip_blocks(&mut self, enabled: bool) {
        self.lstrip_blocks = enabled;
    }

    /// When set, a single trailing newline in the source is preserved.
    /// The reference engine default is to drop it.
    pub fn set_keep_trailing_newline(&mut self, enabled: bool) {
        self.keep_trailing_newline = enabled;
    }

    /// Enables line statements: a line whose first non-whitespace text is the
    /// prefix becomes a block statement.
    pub fn set_line_statement_prefix(&mut self, prefix: Option<String>) {
        self.line_statement_prefix = prefix;
    }

    pub fn set_autoescape(&mut self, autoescape: Autoescape) {
        self.autoescape = autoescape;
    }

    /// Enables the async render entry points.
    pub fn set_enable_async(&mut self, enabled: bool) {
        self.enable_async = enabled;
    }

    pub fn set_undefined_policy(&mut self, policy: UndefinedPolicy) {
        self.undefined = policy;
    }

    pub fn set_loader(&mut self, loader: impl Loader + 'static) {
        self.loader = Some(Box::new(loader));
    }

    // --- registries ---

    /// Registers a filter, shadowing any builtin of the same name.
    pub fn add_filter<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Object, &[Object], &IndexMap<String, Object>) -> Result<Object, Error> + Send + Sync + 'static,
    {
        self.filters.insert(
            name.into(),
            HostFilter {
                sync_fn: Arc::new(func),
                async_fn: None,
            },
        );
    }

    /// Registers a filter with a separate async implementation. The async
    /// variant runs under the async entry points and its result is awaited at
    /// the point of use.
    pub fn add_async_filter<F, A>(&mut self, name: impl Into<String>, sync_fn: F, async_fn: A)
    where
        F: Fn(Object, &[Object], &IndexMap<String, Object>) -> Result<Object, Error> + Send + Sync + 'static,
        A: Fn(Object, &[Object], &IndexMap<String, Object>) -> Result<Object, Error> + Send + Sync + 'static,
    {
        self.filters.insert(
            name.into(),
            HostFilter {
                sync_fn: Arc::new(sync_fn),
                async_fn: Some(Arc::new(async_fn)),
            },
        );
    }

    /// Registers a test; the returned value's truthiness is the verdict.
    pub fn add_test<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Object, &[Object], &IndexMap<String, Object>) -> Result<Object, Error> + Send + Sync + 'static,
    {
        self.tests.insert(
            name.into(),
            HostFilter {
                sync_fn: Arc::new(func),
                async_fn: None,
            },
        );
    }

    pub fn add_async_test<F, A>(&mut self, name: impl Into<String>, sync_fn: F, async_fn: A)
    where
        F: Fn(Object, &[Object], &IndexMap<String, Object>) -> Result<Object, Error> + Send + Sync + 'static,
        A: Fn(Object, &[Object], &IndexMap<String, Object>) -> Result<Object, Error> + Send + Sync + 'static,
    {
        self.tests.insert(
            name.into(),
            HostFilter {
                sync_fn: Arc::new(sync_fn),
                async_fn: Some(Arc::new(async_fn)),
            },
        );
    }

    /// Registers a global value resolvable wherever no scope binding shadows it.
    pub fn add_global(&mut self, name: impl Into<String>, value: impl Into<Object>) {
        self.globals.insert(name.into(), GlobalEntry::Value(value.into()));
    }

    /// Registers a global function.
    pub fn add_global_fn<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&[Object], &IndexMap<String, Object>) -> Result<Object, Error> + Send + Sync + 'static,
    {
        let name = name.into();
        self.globals.insert(
            name.clone(),
            GlobalEntry::Func {
                name,
                func: Arc::new(func),
            },
        );
    }

    // --- rendering ---

    /// Renders template source against the given variables.
    pub fn render_string(
        &self,
        source: &str,
        name: &str,
        vars: IndexMap<String, Object>,
    ) -> Result<String, Error> {
        let template = self.compile_source(source, name, None)?;
        Vm::render(self, &template, vars, false)
    }

    /// Renders a template resolved through the loader.
    pub fn render_template(&self, name: &str, vars: IndexMap<String, Object>) -> Result<String, Error> {
        let template = self.get_template(name)?;
        Vm::render(self, &template, vars, false)
    }

    /// Async-mode variant of [`render_string`](Self::render_string).
    ///
    /// Fails with `AsyncNotEnabled` unless async is enabled on this
    /// environment. Async filters/tests run their async implementations and
    /// their results resolve at the point of use.
    pub fn render_string_async(
        &self,
        source: &str,
        name: &str,
        vars: IndexMap<String, Object>,
    ) -> Result<String, Error> {
        self.check_async()?;
        let template = self.compile_source(source, name, None)?;
        Vm::render(self, &template, vars, true)
    }

    /// Async-mode variant of [`render_template`](Self::render_template).
    pub fn render_template_async(&self, name: &str, vars: IndexMap<String, Object>) -> Result<String, Error> {
        self.check_async()?;
        let template = self.get_template(name)?;
        Vm::render(self, &template, vars, true)
    }

    fn check_async(&self) -> Result<(), Error> {
        if self.enable_async {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::AsyncNotEnabled,
                "async rendering requires enable_async",
            ))
        }
    }

    // --- crate-internal plumbing ---

    pub(crate) fn lex_options(&self) -> LexOptions {
        LexOptions {
            syntax: self.syntax.clone(),
            trim_blocks: self.trim_blocks,
            lstrip_blocks: self.lstrip_blocks,
            keep_trailing_newline: self.keep_trailing_newline,
            line_statement_prefix: self.line_statement_prefix.clone(),
        }
    }

    pub(crate) fn compile_source(
        &self,
        source: &str,
        name: &str,
        filename: Option<String>,
    ) -> RunResult<Arc<Template>> {
        let tokens = lex(source, name, &self.lex_options())?;
        let stmts = parse(tokens, name)?;
        Ok(Arc::new(compile_template(&stmts, name, filename)?))
    }

    /// Loads and compiles a template by name, with caching.
    pub(crate) fn get_template(&self, name: &str) -> RunResult<Arc<Template>> {
        let Some(loader) = &self.loader else {
            return Err(Error::new(
                ErrorKind::TemplateNotFound,
                format!("no loader configured, cannot load {name:?}"),
            ));
        };
        {
            let cache = self.cache.lock().expect("template cache poisoned");
            if let Some(template) = cache.get(name)
                && loader.up_to_date(name)
            {
                return Ok(template.clone());
            }
        }
        let source = loader.get_source(name)?;
        let template = self.compile_source(&source.source, name, source.filename)?;
        self.cache
            .lock()
            .expect("template cache poisoned")
            .insert(name.to_owned(), template.clone());
        Ok(template)
    }

    pub(crate) fn autoescape_for(&self, template_name: &str) -> bool {
        match &self.autoescape {
            Autoescape::Off => false,
            Autoescape::On => true,
            Autoescape::Callback(cb) => cb(template_name),
        }
    }

    pub(crate) fn is_strict(&self) -> bool {
        self.undefined == UndefinedPolicy::Strict
    }

    pub(crate) fn lookup_filter(&self, name: &str) -> Option<FilterImpl<'_>> {
        if let Some(host) = self.filters.get(name) {
            return Some(FilterImpl::Host(host));
        }
        name.parse::<BuiltinFilter>().ok().map(FilterImpl::Builtin)
    }

    pub(crate) fn lookup_test(&self, name: &str) -> Option<TestImpl<'_>> {
        if let Some(host) = self.tests.get(name) {
            return Some(TestImpl::Host(host));
        }
        name.parse::<BuiltinTest>().ok().map(TestImpl::Builtin)
    }

    pub(crate) fn has_filter(&self, name: &str) -> bool {
        self.lookup_filter(name).is_some()
    }

    pub(crate) fn has_test(&self, name: &str) -> bool {
        self.lookup_test(name).is_some()
    }

    /// Resolves a global by name: host registrations first, then builtins.
    pub(crate) fn lookup_global(&self, name: &str) -> Option<Value> {
        if let Some(entry) = self.globals.get(name) {
            return Some(match entry {
                GlobalEntry::Value(obj) => obj.clone().into_value(),
                GlobalEntry::Func { name, func } => Value::callable(Callable::Host {
                    name: name.clone(),
                    func: func.clone(),
                }),
            });
        }
        name.parse::<BuiltinGlobal>()
            .ok()
            .map(|g| Value::callable(Callable::Global(g)))
    }

    pub(crate) fn next_async_id(&self) -> AsyncId {
        AsyncId::new(self.async_ids.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_filters_resolve_with_aliases() {
        let env = Environment::new();
        assert!(env.has_filter("default"));
        assert!(env.has_filter("d"));
        assert!(env.has_filter("tojson"));
        assert!(!env.has_filter("bogus"));
    }

    #[test]
    fn host_filter_shadows_builtin() {
        let mut env = Environment::new();
        env.add_filter("upper", |v, _, _| Ok(Object::String(format!("host:{v}"))));
        assert!(matches!(env.lookup_filter("upper"), Some(FilterImpl::Host(_))));
    }

    #[test]
    fn globals_resolve_builtins() {
        let env = Environment::new();
        assert!(env.lookup_global("range").is_some());
        assert!(env.lookup_global("strftime_now").is_some());
        assert!(env.lookup_global("nope").is_none());
    }

    #[test]
    fn async_entry_requires_flag() {
        let env = Environment::new();
        let err = env.render_string_async("x", "t", IndexMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AsyncNotEnabled);
    }
}
