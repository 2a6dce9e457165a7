use std::{
    cell::RefCell,
    cmp::Ordering,
    fmt::{self, Write},
    rc::Rc,
    sync::Arc,
};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    asyncio::AsyncCell,
    builtins::{BuiltinGlobal, MethodKind},
    bytecode::vm::loops::LoopState,
    environment::HostGlobalFn,
    error::{Error, ErrorKind, RunResult},
    template::{MacroDef, Template},
};

/// Insertion-ordered mapping used for dict and namespace payloads.
pub(crate) type ValueMap = IndexMap<String, Value, ahash::RandomState>;

/// One frame of the scope chain: a mutable name-to-value mapping.
pub(crate) type ScopeMap = AHashMap<String, Value>;

/// Shared handle to a scope frame. Macro closures keep their defining chain
/// alive through these, so a scope popping off the chain can never free a
/// value a closure still references.
pub(crate) type ScopeRef = Rc<RefCell<ScopeMap>>;

/// An immutable string payload with its autoescape safety mark.
///
/// The `safe` flag is set by the `safe`/`escape` filters and by engine-produced
/// markup (macro output, `super()` output, captured blocks) so autoescape does
/// not escape it a second time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Str {
    text: String,
    safe: bool,
}

impl Str {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            safe: false,
        }
    }

    pub fn safe(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            safe: true,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[inline]
    pub fn is_safe(&self) -> bool {
        self.safe
    }
}

/// A lazy integer sequence with Python `range` semantics.
///
/// Stored inline in `Value` since three integers are cheaper than a heap
/// allocation; materialized only when iterated or indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    /// Number of values produced, zero for empty or inverted ranges.
    pub fn len(&self) -> usize {
        if self.step > 0 && self.start < self.stop {
            ((self.stop - self.start - 1) / self.step + 1) as usize
        } else if self.step < 0 && self.start > self.stop {
            ((self.start - self.stop - 1) / (-self.step) + 1) as usize
        } else {
            0
        }
    }

    /// The value at position `i`, which must be `< len()`.
    pub fn at(&self, i: usize) -> i64 {
        self.start + self.step * i as i64
    }

    pub fn values(&self) -> Vec<Value> {
        (0..self.len()).map(|i| Value::Int(self.at(i))).collect()
    }

    pub fn contains(&self, v: i64) -> bool {
        if self.step > 0 {
            v >= self.start && v < self.stop && (v - self.start) % self.step == 0
        } else if self.step < 0 {
            v <= self.start && v > self.stop && (self.start - v) % (-self.step) == 0
        } else {
            false
        }
    }
}

/// State for the `cycler(*items)` global: remembers its position across calls.
#[derive(Debug)]
pub(crate) struct CyclerState {
    pub items: Vec<Value>,
    pub pos: usize,
}

/// State for the `joiner(sep)` global: emits nothing on first call, the
/// separator on every later call.
#[derive(Debug)]
pub(crate) struct JoinerState {
    pub sep: String,
    pub used: bool,
}

/// A named callable value.
///
/// Builtin globals, stateful helper objects, bound methods, host-registered
/// functions, and the block-local `super` all funnel through this one variant
/// so the VM's `Call` instruction has a single dispatch point.
pub(crate) enum Callable {
    /// A builtin global function such as `range` or `namespace`.
    Global(BuiltinGlobal),
    /// A `cycler(...)` instance; calling it advances and returns the next item.
    Cycler(RefCell<CyclerState>),
    /// A `joiner(sep)` instance.
    Joiner(RefCell<JoinerState>),
    /// A method bound to its receiver, e.g. `"  hi  ".strip`.
    Method { recv: Value, method: MethodKind },
    /// A host-registered global function, called with public `Object` values.
    Host { name: String, func: Arc<HostGlobalFn> },
    /// The `super()` callable available inside block bodies.
    Super,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global(g) => write!(f, "Global({g})"),
            Self::Cycler(_) => f.write_str("Cycler"),
            Self::Joiner(_) => f.write_str("Joiner"),
            Self::Method { method, .. } => write!(f, "Method({method:?})"),
            Self::Host { name, .. } => write!(f, "Host({name})"),
            Self::Super => f.write_str("Super"),
        }
    }
}

impl Callable {
    /// Display name used in error messages and reprs.
    pub fn name(&self) -> &str {
        match self {
            Self::Global(g) => <&'static str>::from(*g),
            Self::Cycler(_) => "cycler",
            Self::Joiner(_) => "joiner",
            Self::Method { method, .. } => method.name(),
            Self::Host { name, .. } => name,
            Self::Super => "super",
        }
    }
}

/// A macro value: the compiled definition plus the lexically captured scope
/// chain. The chain is captured by refcounted reference, so mutations to the
/// defining scope after the definition are visible to later calls.
#[derive(Debug, Clone)]
pub(crate) struct MacroValue {
    pub def: Arc<MacroDef>,
    pub template: Arc<Template>,
    pub closure: Vec<ScopeRef>,
}

/// Primary value type representing template data at runtime.
///
/// Small immediate values (none, bool, int, float, range) are stored inline;
/// strings and containers are `Rc`-shared. Cloning a value is cheap and never
/// deep-copies a container, which also gives Python-style aliasing semantics
/// for mutations through namespaces and list methods.
#[derive(Debug, Clone)]
pub(crate) enum Value {
    /// A missing name or attribute. Renders as empty, is falsy, and chains
    /// through attribute/subscript lookup; the strict policy elevates any use
    /// to an error.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<Str>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<ValueMap>>),
    Range(RangeValue),
    Callable(Rc<Callable>),
    Macro(Rc<MacroValue>),
    /// A pending or resolved async result; the VM auto-awaits before use.
    AsyncResult(Rc<RefCell<AsyncCell>>),
    /// A mutable attribute bag created by `namespace()`. Distinct from dict
    /// because attribute assignment `ns.x = v` is legal on it.
    Namespace(Rc<RefCell<ValueMap>>),
    /// The `loop` object bound inside `for` bodies.
    Loop(Rc<RefCell<LoopState>>),
}

impl Value {
    pub fn string(text: impl Into<String>) -> Self {
        Self::Str(Rc::new(Str::new(text)))
    }

    pub fn safe_string(text: impl Into<String>) -> Self {
        Self::Str(Rc::new(Str::safe(text)))
    }

    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(map: ValueMap) -> Self {
        Self::Dict(Rc::new(RefCell::new(map)))
    }

    pub fn namespace(map: ValueMap) -> Self {
        Self::Namespace(Rc::new(RefCell::new(map)))
    }

    pub fn callable(c: Callable) -> Self {
        Self::Callable(Rc::new(c))
    }

    /// The type name used in error messages and by the `string`-family tests.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Range(_) => "range",
            Self::Callable(_) => "function",
            Self::Macro(_) => "macro",
            Self::AsyncResult(_) => "async result",
            Self::Namespace(_) => "namespace",
            Self::Loop(_) => "loop",
        }
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Whether this is a string carrying the autoescape-safe mark.
    pub fn is_safe(&self) -> bool {
        match self {
            Self::Str(s) => s.is_safe(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view used by the arithmetic coercion matrix: ints, floats, and
    /// bools (as 0/1) all participate.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(v) => Some(f64::from(u8::from(*v))),
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Truthiness: none, false, numeric zero, and empty containers are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::None => false,
            Self::Bool(v) => *v,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Str(s) => !s.as_str().is_empty(),
            Self::List(l) => !l.borrow().is_empty(),
            Self::Dict(d) => !d.borrow().is_empty(),
            Self::Range(r) => r.len() != 0,
            Self::Namespace(_) | Self::Callable(_) | Self::Macro(_) | Self::AsyncResult(_) | Self::Loop(_) => true,
        }
    }

    /// Element count for sized values; strings count Unicode characters.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) => Some(s.as_str().chars().count()),
            Self::List(l) => Some(l.borrow().len()),
            Self::Dict(d) => Some(d.borrow().len()),
            Self::Namespace(n) => Some(n.borrow().len()),
            Self::Range(r) => Some(r.len()),
            _ => None,
        }
    }

    /// Structural equality with int/float/bool numeric coercion.
    pub fn value_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) => true,
            (Self::Undefined, _) | (_, Self::Undefined) => false,
            (Self::None, Self::None) => true,
            (Self::Str(a), Self::Str(b)) => a.as_str() == b.as_str(),
            (Self::List(a), Self::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.value_eq(y))
            }
            (Self::Dict(a), Self::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.value_eq(other)))
            }
            (Self::Namespace(a), Self::Namespace(b)) => Rc::ptr_eq(a, b),
            (Self::Range(a), Self::Range(b)) => a == b,
            (Self::Range(r), Self::List(l)) | (Self::List(l), Self::Range(r)) => {
                let items = l.borrow();
                items.len() == r.len()
                    && items
                        .iter()
                        .enumerate()
                        .all(|(i, v)| v.value_eq(&Self::Int(r.at(i))))
            }
            (Self::Callable(a), Self::Callable(b)) => Rc::ptr_eq(a, b),
            (Self::Macro(a), Self::Macro(b)) => Rc::ptr_eq(a, b),
            (Self::Loop(a), Self::Loop(b)) => Rc::ptr_eq(a, b),
            (Self::AsyncResult(a), Self::AsyncResult(b)) => Rc::ptr_eq(a, b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Ordering for comparisons and `sort`: numbers numerically, strings
    /// lexicographically, lists elementwise, bools below/above as 0/1.
    pub fn value_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.as_str().cmp(b.as_str())),
            (Self::List(a), Self::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.value_cmp(y) {
                        Some(Ordering::Equal) => {}
                        other => return other,
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Membership test used by the `in` operator: substring for strings, key
    /// lookup for dicts and namespaces, element equality for sequences.
    pub fn contains(&self, needle: &Self) -> RunResult<bool> {
        match self {
            Self::Str(haystack) => {
                let Some(sub) = needle.as_str() else {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        format!("'in <string>' requires string as left operand, not {}", needle.kind_name()),
                    ));
                };
                Ok(haystack.as_str().contains(sub))
            }
            Self::List(items) => Ok(items.borrow().iter().any(|v| v.value_eq(needle))),
            Self::Dict(map) | Self::Namespace(map) => {
                Ok(needle.as_str().is_some_and(|key| map.borrow().contains_key(key)))
            }
            Self::Range(r) => Ok(needle.as_i64().is_some_and(|v| r.contains(v))),
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("value of type {} is not a container", self.kind_name()),
            )),
        }
    }

    /// Materializes this value as a sequence for `for` loops and
    /// sequence-consuming filters: lists clone their items, ranges expand,
    /// dicts yield insertion-ordered keys, strings yield one-character strings.
    pub fn try_iter(&self) -> RunResult<Vec<Self>> {
        match self {
            Self::Undefined => Ok(Vec::new()),
            Self::List(items) => Ok(items.borrow().clone()),
            Self::Range(r) => Ok(r.values()),
            Self::Dict(map) => Ok(map.borrow().keys().map(|k| Self::string(k.clone())).collect()),
            Self::Str(s) => Ok(s.as_str().chars().map(|c| Self::string(c.to_string())).collect()),
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("value of type {} is not iterable", self.kind_name()),
            )),
        }
    }

    /// Writes the rendered (str-style) form: strings raw, containers repr-style.
    pub fn write_display(&self, out: &mut String) {
        match self {
            Self::Undefined => {}
            Self::None => out.push_str("None"),
            Self::Bool(v) => out.push_str(if *v { "True" } else { "False" }),
            Self::Int(v) => {
                let _ = write!(out, "{v}");
            }
            Self::Float(v) => write_f64(out, *v),
            Self::Str(s) => out.push_str(s.as_str()),
            _ => self.write_repr(out),
        }
    }

    /// Writes the repr form: strings single-quoted with escapes, containers
    /// recursively, Python-style.
    pub fn write_repr(&self, out: &mut String) {
        match self {
            Self::Str(s) => write_str_repr(out, s.as_str()),
            Self::List(items) => {
                out.push('[');
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out);
                }
                out.push(']');
            }
            Self::Dict(map) => {
                out.push('{');
                for (i, (k, v)) in map.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_str_repr(out, k);
                    out.push_str(": ");
                    v.write_repr(out);
                }
                out.push('}');
            }
            Self::Range(r) => {
                let _ = if r.step == 1 {
                    write!(out, "range({}, {})", r.start, r.stop)
                } else {
                    write!(out, "range({}, {}, {})", r.start, r.stop, r.step)
                };
            }
            Self::Namespace(map) => {
                out.push_str("namespace(");
                for (i, (k, v)) in map.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{k}=");
                    v.write_repr(out);
                }
                out.push(')');
            }
            Self::Callable(c) => {
                let _ = write!(out, "<function {}>", c.name());
            }
            Self::Macro(m) => {
                let _ = write!(out, "<macro {}>", m.def.name);
            }
            Self::AsyncResult(_) => out.push_str("<async result>"),
            Self::Loop(_) => out.push_str("<loop>"),
            _ => self.write_display(out),
        }
    }

    pub fn to_display_string(&self) -> String {
        let mut out = String::new();
        self.write_display(&mut out);
        out
    }
}

/// Formats a float the way Python renders it: integral values keep a
/// trailing `.0`, specials render as `inf`/`-inf`/`nan`.
pub(crate) fn write_f64(out: &mut String, v: f64) {
    if v.is_nan() {
        out.push_str("nan");
    } else if v.is_infinite() {
        out.push_str(if v > 0.0 { "inf" } else { "-inf" });
    } else if v == v.trunc() && v.abs() < 1e16 {
        let _ = write!(out, "{v:.1}");
    } else {
        let _ = write!(out, "{v}");
    }
}

fn write_str_repr(out: &mut String, s: &str) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('\'');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_of_empty_and_zero() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
        assert!(
            !Value::Range(RangeValue {
                start: 0,
                stop: 0,
                step: 1
            })
            .is_truthy()
        );
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::string("x").is_truthy());
    }

    #[test]
    fn numeric_equality_coerces() {
        assert!(Value::Int(1).value_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).value_eq(&Value::Int(1)));
        assert!(!Value::Int(1).value_eq(&Value::string("1")));
    }

    #[test]
    fn range_len_and_contains() {
        let r = RangeValue {
            start: 0,
            stop: 10,
            step: 3,
        };
        assert_eq!(r.len(), 4);
        assert!(r.contains(9));
        assert!(!r.contains(10));
        let back = RangeValue {
            start: 5,
            stop: 0,
            step: -2,
        };
        assert_eq!(back.len(), 3);
        assert!(back.contains(1));
    }

    #[test]
    fn float_display_keeps_trailing_zero() {
        let mut out = String::new();
        write_f64(&mut out, 1.0);
        assert_eq!(out, "1.0");
        out.clear();
        write_f64(&mut out, 2.5);
        assert_eq!(out, "2.5");
    }

    #[test]
    fn repr_quotes_strings_inside_lists() {
        let v = Value::list(vec![Value::Int(1), Value::string("a")]);
        let mut out = String::new();
        v.write_display(&mut out);
        assert_eq!(out, "[1, 'a']");
    }
}
