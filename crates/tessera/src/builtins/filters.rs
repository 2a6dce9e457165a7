//! Built-in filter implementations.

use std::cmp::Ordering;

use serde_json::ser::PrettyFormatter;

use super::BuiltinFilter;
use crate::{
    args::{ArgParser, ArgValues, coerce_str, coerce_usize},
    environment::Environment,
    error::{Error, ErrorKind, RunResult},
    output::escape_html,
    value::Value,
};

pub(super) fn call(filter: BuiltinFilter, value: Value, args: ArgValues, _env: &Environment) -> RunResult<Value> {
    match filter {
        BuiltinFilter::Upper => {
            args.check_zero("upper")?;
            Ok(Value::string(value.to_display_string().to_uppercase()))
        }
        BuiltinFilter::Lower => {
            args.check_zero("lower")?;
            Ok(Value::string(value.to_display_string().to_lowercase()))
        }
        BuiltinFilter::Title => {
            args.check_zero("title")?;
            Ok(Value::string(title_case(&value.to_display_string())))
        }
        BuiltinFilter::Capitalize => {
            args.check_zero("capitalize")?;
            Ok(Value::string(capitalize(&value.to_display_string())))
        }
        BuiltinFilter::Trim => {
            let mut parser = ArgParser::new("trim", args);
            let chars = parser.next_opt("chars")?;
            parser.finish()?;
            let s = value.to_display_string();
            let trimmed = match chars {
                Some(Value::None) | None => s.trim().to_owned(),
                Some(chars) => {
                    let set: Vec<char> = coerce_str(&chars, "trim", "chars")?.chars().collect();
                    s.trim_matches(|c| set.contains(&c)).to_owned()
                }
            };
            Ok(Value::string(trimmed))
        }
        BuiltinFilter::Replace => {
            let mut parser = ArgParser::new("replace", args);
            let old = parser.next_arg("old")?;
            let new = parser.next_arg("new")?;
            let count = parser.next_opt("count")?;
            parser.finish()?;
            let old = coerce_str(&old, "replace", "old")?;
            let new = coerce_str(&new, "replace", "new")?;
            let s = value.to_display_string();
            let replaced = match count.and_then(|c| c.as_i64()) {
                Some(n) if n >= 0 => s.replacen(&old, &new, n as usize),
                _ => s.replace(&old, &new),
            };
            Ok(Value::string(replaced))
        }
        BuiltinFilter::Default => {
            let mut parser = ArgParser::new("default", args);
            let fallback = parser.next_opt("default_value")?.unwrap_or_else(|| Value::string(""));
            let boolean = parser.next_opt("boolean")?.is_some_and(|b| b.is_truthy());
            parser.finish()?;
            let use_default = if boolean { !value.is_truthy() } else { value.is_undefined() };
            Ok(if use_default { fallback } else { value })
        }
        BuiltinFilter::Join => {
            let mut parser = ArgParser::new("join", args);
            let sep = parser.next_opt("d")?;
            parser.finish()?;
            let sep = match sep {
                Some(sep) => coerce_str(&sep, "join", "d")?,
                None => String::new(),
            };
            let items = value.try_iter()?;
            let mut out = String::new();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(&sep);
                }
                item.write_display(&mut out);
            }
            Ok(Value::string(out))
        }
        BuiltinFilter::Length => {
            args.check_zero("length")?;
            value.len().map(|n| Value::Int(n as i64)).ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("object of type {} has no length", value.kind_name()),
                )
            })
        }
        BuiltinFilter::String => {
            args.check_zero("string")?;
            Ok(Value::string(value.to_display_string()))
        }
        BuiltinFilter::Int => {
            let mut parser = ArgParser::new("int", args);
            let default = parser.next_opt("default")?.and_then(|d| d.as_i64()).unwrap_or(0);
            let base = parser.next_opt("base")?.and_then(|b| b.as_i64()).unwrap_or(10);
            parser.finish()?;
            Ok(Value::Int(to_int(&value, default, base)))
        }
        BuiltinFilter::Float => {
            let mut parser = ArgParser::new("float", args);
            let default = parser.next_opt("default")?.and_then(|d| d.as_f64()).unwrap_or(0.0);
            parser.finish()?;
            let converted = match &value {
                Value::Str(s) => s.as_str().trim().parse::<f64>().unwrap_or(default),
                other => other.as_f64().unwrap_or(default),
            };
            Ok(Value::Float(converted))
        }
        BuiltinFilter::List => {
            args.check_zero("list")?;
            Ok(Value::list(value.try_iter()?))
        }
        BuiltinFilter::First => {
            args.check_zero("first")?;
            Ok(value.try_iter()?.into_iter().next().unwrap_or(Value::Undefined))
        }
        BuiltinFilter::Last => {
            args.check_zero("last")?;
            Ok(value.try_iter()?.pop().unwrap_or(Value::Undefined))
        }
        BuiltinFilter::Reverse => {
            args.check_zero("reverse")?;
            match &value {
                Value::Str(s) => Ok(Value::string(s.as_str().chars().rev().collect::<String>())),
                other => {
                    let mut items = other.try_iter()?;
                    items.reverse();
                    Ok(Value::list(items))
                }
            }
        }
        BuiltinFilter::Sort => sort_filter(value, args),
        BuiltinFilter::Min => {
            args.check_zero("min")?;
            pick_extreme(value, Ordering::Less)
        }
        BuiltinFilter::Max => {
            args.check_zero("max")?;
            pick_extreme(value, Ordering::Greater)
        }
        BuiltinFilter::Sum => {
            let mut parser = ArgParser::new("sum", args);
            let start = parser.next_opt("start")?;
            parser.finish()?;
            let mut int_total = start.as_ref().and_then(Value::as_i64).unwrap_or(0);
            let mut float_total = 0.0;
            let mut is_float = matches!(start, Some(Value::Float(_)));
            if let Some(Value::Float(f)) = start {
                float_total = f;
            }
            for item in value.try_iter()? {
                match item {
                    Value::Int(v) if !is_float => int_total = int_total.wrapping_add(v),
                    other => {
                        let Some(f) = other.as_f64() else {
                            return Err(Error::new(
                                ErrorKind::InvalidOperation,
                                format!("cannot sum {} values", other.kind_name()),
                            ));
                        };
                        if !is_float {
                            float_total = int_total as f64;
                            is_float = true;
                        }
                        float_total += f;
                    }
                }
            }
            Ok(if is_float {
                Value::Float(float_total)
            } else {
                Value::Int(int_total)
            })
        }
        BuiltinFilter::Unique => {
            args.check_zero("unique")?;
            let mut out: Vec<Value> = Vec::new();
            for item in value.try_iter()? {
                if !out.iter().any(|seen| seen.value_eq(&item)) {
                    out.push(item);
                }
            }
            Ok(Value::list(out))
        }
        BuiltinFilter::Items => {
            args.check_zero("items")?;
            match &value {
                Value::Dict(map) | Value::Namespace(map) => Ok(Value::list(
                    map.borrow()
                        .iter()
                        .map(|(k, v)| Value::list(vec![Value::string(k.clone()), v.clone()]))
                        .collect(),
                )),
                other => Err(Error::new(
                    ErrorKind::InvalidOperation,
                    format!("items filter requires a mapping, got {}", other.kind_name()),
                )),
            }
        }
        BuiltinFilter::Abs => {
            args.check_zero("abs")?;
            match value {
                Value::Int(v) => Ok(Value::Int(v.checked_abs().ok_or_else(|| {
                    Error::new(ErrorKind::IntegerOverflow, "integer overflow in abs")
                })?)),
                Value::Float(v) => Ok(Value::Float(v.abs())),
                other => Err(Error::new(
                    ErrorKind::InvalidOperation,
                    format!("abs requires a number, got {}", other.kind_name()),
                )),
            }
        }
        BuiltinFilter::Tojson => tojson_filter(value, args),
        BuiltinFilter::Truncate => truncate_filter(value, args),
        BuiltinFilter::Batch => batch_filter(value, args),
        BuiltinFilter::Slice => slice_filter(value, args),
        BuiltinFilter::Round => round_filter(value, args),
        BuiltinFilter::Indent => indent_filter(value, args),
        BuiltinFilter::Center => {
            let mut parser = ArgParser::new("center", args);
            let width = match parser.next_opt("width")? {
                Some(w) => coerce_usize(&w, "center", "width")?,
                None => 80,
            };
            parser.finish()?;
            let s = value.to_display_string();
            let len = s.chars().count();
            if len >= width {
                return Ok(Value::string(s));
            }
            let pad = width - len;
            let left = pad / 2;
            let mut out = " ".repeat(left);
            out.push_str(&s);
            out.push_str(&" ".repeat(pad - left));
            Ok(Value::string(out))
        }
        BuiltinFilter::Wordwrap => wordwrap_filter(value, args),
        BuiltinFilter::Format => format_filter(value, args),
        BuiltinFilter::Safe => {
            args.check_zero("safe")?;
            Ok(Value::safe_string(value.to_display_string()))
        }
        BuiltinFilter::Escape => {
            args.check_zero("escape")?;
            if value.is_safe() {
                return Ok(value);
            }
            Ok(Value::safe_string(escape_html(&value.to_display_string())))
        }
    }
}

/// Uppercases the first letter of every word, lowercasing the rest.
pub(super) fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

pub(super) fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

fn to_int(value: &Value, default: i64, base: i64) -> i64 {
    match value {
        Value::Bool(v) => i64::from(*v),
        Value::Int(v) => *v,
        Value::Float(v) => *v as i64,
        Value::Str(s) => {
            let text = s.as_str().trim();
            if base == 10 {
                text.parse::<i64>()
                    .or_else(|_| text.parse::<f64>().map(|f| f as i64))
                    .unwrap_or(default)
            } else {
                let radix = u32::try_from(base).unwrap_or(10);
                let stripped = match radix {
                    16 => text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text),
                    8 => text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")).unwrap_or(text),
                    2 => text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")).unwrap_or(text),
                    _ => text,
                };
                i64::from_str_radix(stripped, radix).unwrap_or(default)
            }
        }
        _ => default,
    }
}

fn sort_filter(value: Value, args: ArgValues) -> RunResult<Value> {
    let mut parser = ArgParser::new("sort", args);
    let reverse = parser.next_opt("reverse")?.is_some_and(|v| v.is_truthy());
    let case_sensitive = parser.next_opt("case_sensitive")?.is_some_and(|v| v.is_truthy());
    let attribute = match parser.next_opt("attribute")? {
        Some(Value::None) | None => None,
        Some(attr) => Some(coerce_str(&attr, "sort", "attribute")?),
    };
    parser.finish()?;

    let mut items = value.try_iter()?;
    let key_of = |item: &Value| -> Value {
        let base = match &attribute {
            Some(path) => lookup_attribute(item, path),
            None => item.clone(),
        };
        match (&base, case_sensitive) {
            (Value::Str(s), false) => Value::string(s.as_str().to_lowercase()),
            _ => base,
        }
    };
    items.sort_by(|a, b| key_of(a).value_cmp(&key_of(b)).unwrap_or(Ordering::Equal));
    if reverse {
        items.reverse();
    }
    Ok(Value::list(items))
}

/// Follows a dotted attribute path through dicts and namespaces.
fn lookup_attribute(item: &Value, path: &str) -> Value {
    let mut current = item.clone();
    for part in path.split('.') {
        current = match &current {
            Value::Dict(map) | Value::Namespace(map) => map.borrow().get(part).cloned().unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        };
    }
    current
}

fn pick_extreme(value: Value, keep: Ordering) -> RunResult<Value> {
    let items = value.try_iter()?;
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => {
                if item.value_cmp(&current) == Some(keep) {
                    item
                } else {
                    current
                }
            }
        });
    }
    Ok(best.unwrap_or(Value::Undefined))
}

fn value_to_json(value: &Value) -> RunResult<serde_json::Value> {
    Ok(match value {
        Value::Undefined | Value::None => serde_json::Value::Null,
        Value::Bool(v) => serde_json::Value::Bool(*v),
        Value::Int(v) => serde_json::Value::Number((*v).into()),
        Value::Float(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s.as_str().to_owned()),
        Value::List(items) => {
            let mut out = Vec::new();
            for item in items.borrow().iter() {
                out.push(value_to_json(item)?);
            }
            serde_json::Value::Array(out)
        }
        Value::Range(r) => serde_json::Value::Array(r.values().iter().map(|v| value_to_json(v)).collect::<RunResult<_>>()?),
        Value::Dict(map) | Value::Namespace(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map.borrow().iter() {
                out.insert(k.clone(), value_to_json(v)?);
            }
            serde_json::Value::Object(out)
        }
        other => {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("value of type {} is not JSON serializable", other.kind_name()),
            ));
        }
    })
}

fn tojson_filter(value: Value, args: ArgValues) -> RunResult<Value> {
    let mut parser = ArgParser::new("tojson", args);
    let indent = match parser.next_opt("indent")? {
        Some(Value::None) | None => None,
        Some(v) => Some(coerce_usize(&v, "tojson", "indent")?),
    };
    parser.finish()?;
    let json = value_to_json(&value)?;
    let rendered = match indent {
        None => serde_json::to_string(&json),
        Some(width) => {
            let indent_bytes = vec![b' '; width];
            let mut out = Vec::new();
            let formatter = PrettyFormatter::with_indent(&indent_bytes);
            let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
            serde::Serialize::serialize(&json, &mut ser).map(|()| String::from_utf8_lossy(&out).into_owned())
        }
    }
    .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("JSON serialization failed: {e}")))?;
    Ok(Value::safe_string(rendered))
}

fn truncate_filter(value: Value, args: ArgValues) -> RunResult<Value> {
    let mut parser = ArgParser::new("truncate", args);
    let length = match parser.next_opt("length")? {
        Some(v) => coerce_usize(&v, "truncate", "length")?,
        None => 255,
    };
    let killwords = parser.next_opt("killwords")?.is_some_and(|v| v.is_truthy());
    let end = match parser.next_opt("end")? {
        Some(v) => coerce_str(&v, "truncate", "end")?,
        None => "...".to_owned(),
    };
    let leeway = match parser.next_opt("leeway")? {
        Some(v) => coerce_usize(&v, "truncate", "leeway")?,
        None => 5,
    };
    parser.finish()?;

    let s = value.to_display_string();
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= length + leeway {
        return Ok(Value::string(s));
    }
    let end_len = end.chars().count();
    let keep = length.saturating_sub(end_len);
    let cut: String = chars[..keep].iter().collect();
    let truncated = if killwords {
        cut
    } else {
        match cut.rfind(' ') {
            Some(idx) => cut[..idx].to_owned(),
            None => cut,
        }
    };
    Ok(Value::string(truncated + &end))
}

fn batch_filter(value: Value, args: ArgValues) -> RunResult<Value> {
    let mut parser = ArgParser::new("batch", args);
    let size = coerce_usize(&parser.next_arg("linecount")?, "batch", "linecount")?;
    let fill = parser.next_opt("fill_with")?;
    parser.finish()?;
    if size == 0 {
        return Err(Error::new(ErrorKind::InvalidArguments, "batch() size must be positive"));
    }
    let items = value.try_iter()?;
    let mut rows = Vec::new();
    for chunk in items.chunks(size) {
        let mut row = chunk.to_vec();
        if let Some(fill) = &fill
            && !matches!(fill, Value::None)
        {
            while row.len() < size {
                row.push(fill.clone());
            }
        }
        rows.push(Value::list(row));
    }
    Ok(Value::list(rows))
}

fn slice_filter(value: Value, args: ArgValues) -> RunResult<Value> {
    let mut parser = ArgParser::new("slice", args);
    let count = coerce_usize(&parser.next_arg("slices")?, "slice", "slices")?;
    let fill = parser.next_opt("fill_with")?;
    parser.finish()?;
    if count == 0 {
        return Err(Error::new(ErrorKind::InvalidArguments, "slice() count must be positive"));
    }
    let items = value.try_iter()?;
    let per_slice = items.len() / count;
    let with_extra = items.len() % count;
    let mut out = Vec::new();
    let mut offset = 0;
    for column in 0..count {
        let take = per_slice + usize::from(column < with_extra);
        let mut slice: Vec<Value> = items[offset..offset + take].to_vec();
        offset += take;
        if column >= with_extra
            && let Some(fill) = &fill
            && !matches!(fill, Value::None)
            && with_extra > 0
        {
            slice.push(fill.clone());
        }
        out.push(Value::list(slice));
    }
    Ok(Value::list(out))
}

fn round_filter(value: Value, args: ArgValues) -> RunResult<Value> {
    let mut parser = ArgParser::new("round", args);
    let precision = parser.next_opt("precision")?.and_then(|v| v.as_i64()).unwrap_or(0);
    let method = match parser.next_opt("method")? {
        Some(v) => coerce_str(&v, "round", "method")?,
        None => "common".to_owned(),
    };
    parser.finish()?;
    let Some(v) = value.as_f64() else {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("round requires a number, got {}", value.kind_name()),
        ));
    };
    let factor = 10f64.powi(precision as i32);
    let rounded = match method.as_str() {
        "common" => (v * factor).round() / factor,
        "ceil" => (v * factor).ceil() / factor,
        "floor" => (v * factor).floor() / factor,
        other => {
            return Err(Error::new(
                ErrorKind::InvalidArguments,
                format!("round() method must be common, ceil or floor, not {other}"),
            ));
        }
    };
    Ok(Value::Float(rounded))
}

fn indent_filter(value: Value, args: ArgValues) -> RunResult<Value> {
    let mut parser = ArgParser::new("indent", args);
    let width = match parser.next_opt("width")? {
        Some(v) => coerce_usize(&v, "indent", "width")?,
        None => 4,
    };
    let first = parser.next_opt("first")?.is_some_and(|v| v.is_truthy());
    let blank = parser.next_opt("blank")?.is_some_and(|v| v.is_truthy());
    parser.finish()?;

    let s = value.to_display_string();
    let pad = " ".repeat(width);
    let mut out = String::new();
    for (i, line) in s.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let indent_this = if i == 0 { first } else { blank || !line.trim().is_empty() };
        if indent_this && !(line.is_empty() && !blank) {
            out.push_str(&pad);
        }
        out.push_str(line);
    }
    Ok(Value::string(out))
}

fn wordwrap_filter(value: Value, args: ArgValues) -> RunResult<Value> {
    let mut parser = ArgParser::new("wordwrap", args);
    let width = match parser.next_opt("width")? {
        Some(v) => coerce_usize(&v, "wordwrap", "width")?,
        None => 79,
    };
    let break_long_words = parser.next_opt("break_long_words")?.is_none_or(|v| v.is_truthy());
    let wrapstring = match parser.next_opt("wrapstring")? {
        Some(Value::None) | None => "\n".to_owned(),
        Some(v) => coerce_str(&v, "wordwrap", "wrapstring")?,
    };
    let break_on_hyphens = parser.next_opt("break_on_hyphens")?.is_none_or(|v| v.is_truthy());
    parser.finish()?;
    if width == 0 {
        return Err(Error::new(ErrorKind::InvalidArguments, "wordwrap() width must be positive"));
    }

    let s = value.to_display_string();
    let mut wrapped_lines = Vec::new();
    for line in s.split('\n') {
        if line.trim().is_empty() {
            wrapped_lines.push(String::new());
            continue;
        }
        let mut current = String::new();
        for word in line.split_whitespace() {
            let word_len = word.chars().count();
            let current_len = current.chars().count();
            let needed = if current.is_empty() { word_len } else { current_len + 1 + word_len };
            if needed <= width {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(word);
            } else if word_len > width && break_long_words {
                if !current.is_empty() {
                    wrapped_lines.push(std::mem::take(&mut current));
                }
                for piece in break_word(word, width, break_on_hyphens) {
                    if piece.chars().count() == width {
                        wrapped_lines.push(piece);
                    } else {
                        current = piece;
                    }
                }
            } else {
                if !current.is_empty() {
                    wrapped_lines.push(std::mem::take(&mut current));
                }
                current.push_str(word);
            }
        }
        if !current.is_empty() {
            wrapped_lines.push(current);
        }
    }
    Ok(Value::string(wrapped_lines.join(&wrapstring)))
}

/// Splits an over-long word into width-sized pieces, preferring hyphen
/// positions when asked.
fn break_word(word: &str, width: usize, on_hyphens: bool) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest: Vec<char> = word.chars().collect();
    while rest.len() > width {
        let mut cut = width;
        if on_hyphens
            && let Some(hyphen) = rest[..width].iter().rposition(|c| *c == '-')
            && hyphen > 0
        {
            cut = hyphen + 1;
        }
        pieces.push(rest[..cut].iter().collect());
        rest.drain(..cut);
    }
    if !rest.is_empty() {
        pieces.push(rest.into_iter().collect());
    }
    pieces
}

/// Python `%`-style string formatting over a conservative directive set:
/// `%s %d %i %f %x %X %o %%` with optional `-`/`0` flags, width, and precision.
fn format_filter(value: Value, args: ArgValues) -> RunResult<Value> {
    let (pos, kwargs) = args.into_parts();
    if !kwargs.is_empty() {
        return Err(Error::new(ErrorKind::InvalidArguments, "format() takes no keyword arguments"));
    }
    let template = value.to_display_string();
    let mut out = String::new();
    let mut values = pos.into_iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut left_align = false;
        let mut zero_pad = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => left_align = true,
                '0' => zero_pad = true,
                _ => break,
            }
            chars.next();
        }
        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + d as usize;
            chars.next();
        }
        let mut precision: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = p * 10 + d as usize;
                chars.next();
            }
            precision = Some(p);
        }
        let conv = chars.next().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArguments, "incomplete format directive")
        })?;
        let arg = values.next().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArguments, "not enough arguments for format string")
        })?;
        let rendered = match conv {
            's' => {
                let mut s = arg.to_display_string();
                if let Some(p) = precision {
                    s = s.chars().take(p).collect();
                }
                s
            }
            'd' | 'i' => {
                let v = arg.as_f64().ok_or_else(|| format_type_error(conv, &arg))? as i64;
                format!("{v}")
            }
            'x' => {
                let v = arg.as_i64().ok_or_else(|| format_type_error(conv, &arg))?;
                format!("{v:x}")
            }
            'X' => {
                let v = arg.as_i64().ok_or_else(|| format_type_error(conv, &arg))?;
                format!("{v:X}")
            }
            'o' => {
                let v = arg.as_i64().ok_or_else(|| format_type_error(conv, &arg))?;
                format!("{v:o}")
            }
            'f' => {
                let v = arg.as_f64().ok_or_else(|| format_type_error(conv, &arg))?;
                format!("{:.*}", precision.unwrap_or(6), v)
            }
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidArguments,
                    format!("unsupported format directive %{other}"),
                ));
            }
        };
        out.push_str(&pad_field(&rendered, width, left_align, zero_pad));
    }
    Ok(Value::string(out))
}

fn format_type_error(conv: char, arg: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidArguments,
        format!("%{conv} format requires a number, not {}", arg.kind_name()),
    )
}

fn pad_field(s: &str, width: usize, left_align: bool, zero_pad: bool) -> String {
    let len = s.chars().count();
    if len >= width {
        return s.to_owned();
    }
    let pad = width - len;
    if left_align {
        let mut out = s.to_owned();
        out.push_str(&" ".repeat(pad));
        out
    } else if zero_pad {
        // keep a leading sign ahead of the zeros
        if let Some(rest) = s.strip_prefix('-') {
            format!("-{}{rest}", "0".repeat(pad))
        } else {
            format!("{}{s}", "0".repeat(pad))
        }
    } else {
        format!("{}{s}", " ".repeat(pad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueMap;

    fn fenv() -> Environment {
        Environment::new()
    }

    fn apply(filter: BuiltinFilter, value: Value, args: Vec<Value>) -> RunResult<Value> {
        call(filter, value, ArgValues::positional(args), &fenv())
    }

    #[test]
    fn default_replaces_only_undefined() {
        let out = apply(BuiltinFilter::Default, Value::Undefined, vec![Value::string("x")]).unwrap();
        assert_eq!(out.as_str(), Some("x"));
        let out = apply(BuiltinFilter::Default, Value::string("y"), vec![Value::string("x")]).unwrap();
        assert_eq!(out.as_str(), Some("y"));
        // boolean mode also replaces falsy values
        let mut kwargs = ValueMap::default();
        kwargs.insert("boolean".to_owned(), Value::Bool(true));
        let out = call(
            BuiltinFilter::Default,
            Value::string(""),
            ArgValues::new(vec![Value::string("x")], kwargs),
            &fenv(),
        )
        .unwrap();
        assert_eq!(out.as_str(), Some("x"));
    }

    #[test]
    fn join_stringifies_items() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let out = apply(BuiltinFilter::Join, list, vec![Value::string(",")]).unwrap();
        assert_eq!(out.as_str(), Some("1,2,3"));
    }

    #[test]
    fn truncate_respects_leeway() {
        let s = Value::string("foo bar baz qux");
        // length 9 + default leeway 5 covers the 15-char string
        let out = apply(BuiltinFilter::Truncate, s.clone(), vec![Value::Int(12)]).unwrap();
        assert_eq!(out.as_str(), Some("foo bar baz qux"));
        let out = apply(BuiltinFilter::Truncate, s, vec![Value::Int(9), Value::Bool(true)]).unwrap();
        assert_eq!(out.as_str(), Some("foo ba..."));
    }

    #[test]
    fn batch_fills_last_row() {
        let list = Value::list((1..=5).map(Value::Int).collect());
        let out = apply(BuiltinFilter::Batch, list, vec![Value::Int(2), Value::Int(0)]).unwrap();
        let rendered = out.to_display_string();
        assert_eq!(rendered, "[[1, 2], [3, 4], [5, 0]]");
    }

    #[test]
    fn round_methods() {
        let out = apply(BuiltinFilter::Round, Value::Float(2.55), vec![Value::Int(1)]).unwrap();
        assert_eq!(out.to_display_string(), "2.5");
        let mut kwargs = ValueMap::default();
        kwargs.insert("method".to_owned(), Value::string("ceil"));
        let out = call(
            BuiltinFilter::Round,
            Value::Float(2.1),
            ArgValues::new(vec![], kwargs),
            &fenv(),
        )
        .unwrap();
        assert_eq!(out.to_display_string(), "3.0");
    }

    #[test]
    fn indent_skips_first_line_by_default() {
        let out = apply(BuiltinFilter::Indent, Value::string("a\nb\nc"), vec![Value::Int(2)]).unwrap();
        assert_eq!(out.as_str(), Some("a\n  b\n  c"));
    }

    #[test]
    fn format_directives() {
        let out = apply(
            BuiltinFilter::Format,
            Value::string("%s scored %05.1f%%"),
            vec![Value::string("kai"), Value::Float(9.25)],
        )
        .unwrap();
        assert_eq!(out.as_str(), Some("kai scored 009.2%"));
    }

    #[test]
    fn tojson_two_space_indent() {
        let mut map = ValueMap::default();
        map.insert("name".to_owned(), Value::string("t"));
        map.insert("value".to_owned(), Value::Int(42));
        let mut kwargs = ValueMap::default();
        kwargs.insert("indent".to_owned(), Value::Int(2));
        let out = call(BuiltinFilter::Tojson, Value::dict(map), ArgValues::new(vec![], kwargs), &fenv()).unwrap();
        assert_eq!(out.as_str(), Some("{\n  \"name\": \"t\",\n  \"value\": 42\n}"));
        assert!(out.is_safe());
    }

    #[test]
    fn sort_is_case_insensitive_by_default() {
        let list = Value::list(vec![Value::string("b"), Value::string("A"), Value::string("c")]);
        let out = apply(BuiltinFilter::Sort, list, vec![]).unwrap();
        assert_eq!(out.to_display_string(), "['A', 'b', 'c']");
    }

    #[test]
    fn wordwrap_breaks_lines() {
        let out = apply(BuiltinFilter::Wordwrap, Value::string("aa bb cc dd"), vec![Value::Int(5)]).unwrap();
        assert_eq!(out.as_str(), Some("aa bb\ncc dd"));
    }
}
