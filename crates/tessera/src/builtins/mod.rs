//! Built-in filters, tests, globals, and value methods.
//!
//! Each family is an enum with strum-derived name mapping; the environment
//! resolves host-registered entries first, then falls back to these, so a
//! host registration can shadow any builtin by name.

mod filters;
mod globals;

use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    args::ArgValues,
    environment::Environment,
    error::{Error, ErrorKind, RunResult},
    value::Value,
};

/// Built-in filter names, including the reference engine's short aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum BuiltinFilter {
    Upper,
    Lower,
    Title,
    Capitalize,
    Trim,
    Replace,
    #[strum(serialize = "default", serialize = "d")]
    Default,
    Join,
    #[strum(serialize = "length", serialize = "count")]
    Length,
    String,
    Int,
    Float,
    List,
    First,
    Last,
    Reverse,
    Sort,
    Min,
    Max,
    Sum,
    Unique,
    Items,
    Abs,
    Tojson,
    Truncate,
    Batch,
    Slice,
    Round,
    Indent,
    Center,
    Wordwrap,
    Format,
    Safe,
    #[strum(serialize = "escape", serialize = "e")]
    Escape,
}

impl BuiltinFilter {
    pub fn call(self, value: Value, args: ArgValues, env: &Environment) -> RunResult<Value> {
        filters::call(self, value, args, env)
    }
}

/// Built-in test names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum BuiltinTest {
    Defined,
    Undefined,
    None,
    True,
    False,
    Boolean,
    String,
    Number,
    Integer,
    Float,
    Mapping,
    Sequence,
    Iterable,
    Callable,
    Even,
    Odd,
    Divisibleby,
    #[strum(serialize = "equalto", serialize = "eq")]
    Equalto,
    In,
    Empty,
    Filter,
    Test,
}

impl BuiltinTest {
    pub fn call(self, value: &Value, args: ArgValues, env: &Environment) -> RunResult<bool> {
        tests::call(self, value, args, env)
    }
}

/// Built-in global functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum BuiltinGlobal {
    Range,
    Dict,
    Lipsum,
    Cycler,
    Joiner,
    Namespace,
    StrftimeNow,
    RaiseException,
}

impl BuiltinGlobal {
    pub fn call(self, args: ArgValues) -> RunResult<Value> {
        globals::call(self, args)
    }
}

/// Methods callable on values, bound at attribute-lookup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MethodKind {
    StrUpper,
    StrLower,
    StrTitle,
    StrCapitalize,
    StrStrip,
    StrLstrip,
    StrRstrip,
    StrStartswith,
    StrEndswith,
    StrReplace,
    StrSplit,
    DictGet,
    DictKeys,
    DictValues,
    DictItems,
    ListAppend,
    LoopCycle,
    LoopChanged,
}

impl MethodKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::StrUpper => "upper",
            Self::StrLower => "lower",
            Self::StrTitle => "title",
            Self::StrCapitalize => "capitalize",
            Self::StrStrip => "strip",
            Self::StrLstrip => "lstrip",
            Self::StrRstrip => "rstrip",
            Self::StrStartswith => "startswith",
            Self::StrEndswith => "endswith",
            Self::StrReplace => "replace",
            Self::StrSplit => "split",
            Self::DictGet => "get",
            Self::DictKeys => "keys",
            Self::DictValues => "values",
            Self::DictItems => "items",
            Self::ListAppend => "append",
            Self::LoopCycle => "cycle",
            Self::LoopChanged => "changed",
        }
    }
}

/// Resolves an attribute name to a bound method for this value's type.
pub(crate) fn method_for(value: &Value, name: &str) -> Option<MethodKind> {
    match value {
        Value::Str(_) => match name {
            "upper" => Some(MethodKind::StrUpper),
            "lower" => Some(MethodKind::StrLower),
            "title" => Some(MethodKind::StrTitle),
            "capitalize" => Some(MethodKind::StrCapitalize),
            "strip" => Some(MethodKind::StrStrip),
            "lstrip" => Some(MethodKind::StrLstrip),
            "rstrip" => Some(MethodKind::StrRstrip),
            "startswith" => Some(MethodKind::StrStartswith),
            "endswith" => Some(MethodKind::StrEndswith),
            "replace" => Some(MethodKind::StrReplace),
            "split" => Some(MethodKind::StrSplit),
            _ => None,
        },
        Value::Dict(_) => match name {
            "get" => Some(MethodKind::DictGet),
            "keys" => Some(MethodKind::DictKeys),
            "values" => Some(MethodKind::DictValues),
            "items" => Some(MethodKind::DictItems),
            _ => None,
        },
        Value::List(_) => match name {
            "append" => Some(MethodKind::ListAppend),
            _ => None,
        },
        Value::Loop(_) => match name {
            "cycle" => Some(MethodKind::LoopCycle),
            "changed" => Some(MethodKind::LoopChanged),
            _ => None,
        },
        _ => None,
    }
}

/// Calls a bound method.
pub(crate) fn call_method(recv: &Value, method: MethodKind, args: ArgValues) -> RunResult<Value> {
    use crate::args::{ArgParser, coerce_str};

    match method {
        MethodKind::StrUpper => {
            args.check_zero("upper")?;
            Ok(Value::string(expect_str(recv)?.to_uppercase()))
        }
        MethodKind::StrLower => {
            args.check_zero("lower")?;
            Ok(Value::string(expect_str(recv)?.to_lowercase()))
        }
        MethodKind::StrTitle => {
            args.check_zero("title")?;
            Ok(Value::string(filters::title_case(expect_str(recv)?)))
        }
        MethodKind::StrCapitalize => {
            args.check_zero("capitalize")?;
            Ok(Value::string(filters::capitalize(expect_str(recv)?)))
        }
        MethodKind::StrStrip | MethodKind::StrLstrip | MethodKind::StrRstrip => {
            let name = method.name();
            let mut parser = ArgParser::new(
                match method {
                    MethodKind::StrStrip => "strip",
                    MethodKind::StrLstrip => "lstrip",
                    _ => "rstrip",
                },
                args,
            );
            let chars = parser.next_opt("chars")?;
            parser.finish()?;
            let s = expect_str(recv)?;
            let stripped = match &chars {
                Some(Value::None) | None => match method {
                    MethodKind::StrStrip => s.trim(),
                    MethodKind::StrLstrip => s.trim_start(),
                    _ => s.trim_end(),
                }
                .to_owned(),
                Some(chars) => {
                    let set: Vec<char> = coerce_str(chars, name, "chars")?.chars().collect();
                    let matcher = |c: char| set.contains(&c);
                    match method {
                        MethodKind::StrStrip => s.trim_matches(matcher),
                        MethodKind::StrLstrip => s.trim_start_matches(matcher),
                        _ => s.trim_end_matches(matcher),
                    }
                    .to_owned()
                }
            };
            Ok(Value::string(stripped))
        }
        MethodKind::StrStartswith | MethodKind::StrEndswith => {
            let name = method.name();
            let mut parser = ArgParser::new(
                if method == MethodKind::StrStartswith {
                    "startswith"
                } else {
                    "endswith"
                },
                args,
            );
            let probe = parser.next_arg("prefix")?;
            parser.finish()?;
            let probe = coerce_str(&probe, name, "prefix")?;
            let s = expect_str(recv)?;
            let hit = if method == MethodKind::StrStartswith {
                s.starts_with(&probe)
            } else {
                s.ends_with(&probe)
            };
            Ok(Value::Bool(hit))
        }
        MethodKind::StrReplace => {
            let mut parser = ArgParser::new("replace", args);
            let old = parser.next_arg("old")?;
            let new = parser.next_arg("new")?;
            let count = parser.next_opt("count")?;
            parser.finish()?;
            let old = coerce_str(&old, "replace", "old")?;
            let new = coerce_str(&new, "replace", "new")?;
            let s = expect_str(recv)?;
            let replaced = match count.and_then(|c| c.as_i64()) {
                Some(n) if n >= 0 => s.replacen(&old, &new, n as usize),
                _ => s.replace(&old, &new),
            };
            Ok(Value::string(replaced))
        }
        MethodKind::StrSplit => {
            let mut parser = ArgParser::new("split", args);
            let sep = parser.next_opt("sep")?;
            let maxsplit = parser.next_opt("maxsplit")?;
            parser.finish()?;
            let s = expect_str(recv)?;
            let limit = maxsplit.and_then(|m| m.as_i64()).filter(|m| *m >= 0);
            let parts: Vec<Value> = match &sep {
                Some(Value::None) | None => match limit {
                    Some(n) => split_whitespace_limited(s, n as usize),
                    None => s.split_whitespace().map(Value::string).collect(),
                },
                Some(sep) => {
                    let sep = coerce_str(sep, "split", "sep")?;
                    match limit {
                        Some(n) => s.splitn(n as usize + 1, sep.as_str()).map(Value::string).collect(),
                        None => s.split(sep.as_str()).map(Value::string).collect(),
                    }
                }
            };
            Ok(Value::list(parts))
        }
        MethodKind::DictGet => {
            let mut parser = ArgParser::new("get", args);
            let key = parser.next_arg("key")?;
            let default = parser.next_opt("default")?;
            parser.finish()?;
            let Value::Dict(map) = recv else {
                return Err(method_type_error(recv, method));
            };
            let key = coerce_str(&key, "get", "key")?;
            Ok(map
                .borrow()
                .get(&key)
                .cloned()
                .or(default)
                .unwrap_or(Value::None))
        }
        MethodKind::DictKeys | MethodKind::DictValues | MethodKind::DictItems => {
            args.check_zero(method.name())?;
            let Value::Dict(map) = recv else {
                return Err(method_type_error(recv, method));
            };
            let map = map.borrow();
            let items = match method {
                MethodKind::DictKeys => map.keys().map(|k| Value::string(k.clone())).collect(),
                MethodKind::DictValues => map.values().cloned().collect(),
                _ => map
                    .iter()
                    .map(|(k, v)| Value::list(vec![Value::string(k.clone()), v.clone()]))
                    .collect(),
            };
            Ok(Value::list(items))
        }
        MethodKind::ListAppend => {
            let item = args.get_one("append")?;
            let Value::List(items) = recv else {
                return Err(method_type_error(recv, method));
            };
            items.borrow_mut().push(item);
            Ok(Value::None)
        }
        MethodKind::LoopCycle => {
            let items = args.into_positional("loop.cycle")?;
            if items.is_empty() {
                return Err(Error::new(ErrorKind::InvalidArguments, "no items for cycling given"));
            }
            let Value::Loop(state) = recv else {
                return Err(method_type_error(recv, method));
            };
            let idx = state.borrow().index0();
            Ok(items[idx % items.len()].clone())
        }
        MethodKind::LoopChanged => {
            let probe = args.into_positional("loop.changed")?;
            let Value::Loop(state) = recv else {
                return Err(method_type_error(recv, method));
            };
            let mut state = state.borrow_mut();
            let changed = match &state.last_changed {
                Some(last) => last.len() != probe.len() || last.iter().zip(probe.iter()).any(|(a, b)| !a.value_eq(b)),
                None => true,
            };
            state.last_changed = Some(probe);
            Ok(Value::Bool(changed))
        }
    }
}

/// `split(None, n)`: at most `n` splits, keeping the remainder whole.
fn split_whitespace_limited(s: &str, n: usize) -> Vec<Value> {
    let mut parts = Vec::new();
    let mut rest = s.trim_start();
    while parts.len() < n && !rest.is_empty() {
        match rest.find(char::is_whitespace) {
            Some(i) => {
                parts.push(Value::string(&rest[..i]));
                rest = rest[i..].trim_start();
            }
            None => {
                parts.push(Value::string(rest));
                rest = "";
            }
        }
    }
    let rest = rest.trim_end();
    if !rest.is_empty() {
        parts.push(Value::string(rest));
    }
    parts
}

fn expect_str(value: &Value) -> RunResult<&str> {
    value.as_str().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("string method called on {}", value.kind_name()),
        )
    })
}

fn method_type_error(value: &Value, method: MethodKind) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!("method {} not available on {}", method.name(), value.kind_name()),
    )
}
