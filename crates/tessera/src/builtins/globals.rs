//! Built-in global functions.

use std::cell::RefCell;

use chrono::{Datelike, Local, Timelike};
use rand::Rng;

use super::BuiltinGlobal;
use crate::{
    args::{ArgParser, ArgValues, coerce_str},
    error::{Error, ErrorKind, RunResult},
    value::{Callable, CyclerState, JoinerState, RangeValue, Value, ValueMap},
};

pub(super) fn call(global: BuiltinGlobal, args: ArgValues) -> RunResult<Value> {
    match global {
        BuiltinGlobal::Range => range_fn(args),
        BuiltinGlobal::Dict => {
            let (pos, kwargs) = args.into_parts();
            if !pos.is_empty() {
                return Err(Error::new(ErrorKind::InvalidArguments, "dict() takes only keyword arguments"));
            }
            let mut map = ValueMap::default();
            for (k, v) in kwargs {
                map.insert(k, v);
            }
            Ok(Value::dict(map))
        }
        BuiltinGlobal::Lipsum => lipsum_fn(args),
        BuiltinGlobal::Cycler => {
            let items = args.into_positional("cycler")?;
            if items.is_empty() {
                return Err(Error::new(ErrorKind::InvalidArguments, "cycler() requires at least one item"));
            }
            Ok(Value::callable(Callable::Cycler(RefCell::new(CyclerState { items, pos: 0 }))))
        }
        BuiltinGlobal::Joiner => {
            let mut parser = ArgParser::new("joiner", args);
            let sep = match parser.next_opt("sep")? {
                Some(v) => coerce_str(&v, "joiner", "sep")?,
                None => ", ".to_owned(),
            };
            parser.finish()?;
            Ok(Value::callable(Callable::Joiner(RefCell::new(JoinerState {
                sep,
                used: false,
            }))))
        }
        BuiltinGlobal::Namespace => {
            let (pos, kwargs) = args.into_parts();
            if !pos.is_empty() {
                return Err(Error::new(
                    ErrorKind::InvalidArguments,
                    "namespace() takes only keyword arguments",
                ));
            }
            let mut map = ValueMap::default();
            for (k, v) in kwargs {
                map.insert(k, v);
            }
            Ok(Value::namespace(map))
        }
        BuiltinGlobal::StrftimeNow => {
            let format = args.get_one("strftime_now")?;
            let format = coerce_str(&format, "strftime_now", "format")?;
            Ok(Value::string(strftime_local(&format)))
        }
        BuiltinGlobal::RaiseException => {
            let message = args.get_one("raise_exception")?;
            Err(Error::new(ErrorKind::RaisedException, message.to_display_string()))
        }
    }
}

fn range_fn(args: ArgValues) -> RunResult<Value> {
    let values = args.into_positional("range")?;
    let ints: Vec<i64> = values
        .iter()
        .map(|v| {
            v.as_i64().ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidArguments,
                    format!("range() requires integer arguments, got {}", v.kind_name()),
                )
            })
        })
        .collect::<RunResult<_>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidArguments,
                format!("range() takes 1 to 3 arguments ({} given)", ints.len()),
            ));
        }
    };
    if step == 0 {
        return Err(Error::new(ErrorKind::InvalidArguments, "range() step must not be zero"));
    }
    Ok(Value::Range(RangeValue { start, stop, step }))
}

const LIPSUM_WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do", "eiusmod", "tempor",
    "incididunt", "ut", "labore", "et", "dolore", "magna", "aliqua", "enim", "ad", "minim", "veniam", "quis",
    "nostrud", "exercitation", "ullamco", "laboris", "nisi", "aliquip", "ex", "ea", "commodo", "consequat", "duis",
    "aute", "irure", "in", "reprehenderit", "voluptate", "velit", "esse", "cillum", "eu", "fugiat", "nulla",
    "pariatur", "excepteur", "sint", "occaecat", "cupidatat", "non", "proident", "sunt", "culpa", "qui", "officia",
    "deserunt", "mollit", "anim", "id", "est", "laborum",
];

fn lipsum_fn(args: ArgValues) -> RunResult<Value> {
    let mut parser = ArgParser::new("lipsum", args);
    let n = match parser.next_opt("n")? {
        Some(v) => v.as_i64().unwrap_or(5).max(0) as usize,
        None => 5,
    };
    let html = parser.next_opt("html")?.is_none_or(|v| v.is_truthy());
    let min = match parser.next_opt("min")? {
        Some(v) => v.as_i64().unwrap_or(20).max(1) as usize,
        None => 20,
    };
    let max = match parser.next_opt("max")? {
        Some(v) => v.as_i64().unwrap_or(100).max(1) as usize,
        None => 100,
    };
    parser.finish()?;

    let mut rng = rand::thread_rng();
    let mut paragraphs = Vec::with_capacity(n);
    for _ in 0..n {
        let count = if min >= max { min } else { rng.gen_range(min..=max) };
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(LIPSUM_WORDS[rng.gen_range(0..LIPSUM_WORDS.len())]);
        }
        let mut text = words.join(" ");
        if let Some(first) = text.get(..1) {
            let upper = first.to_uppercase();
            text.replace_range(..1, &upper);
        }
        text.push('.');
        paragraphs.push(text);
    }
    if html {
        let joined: Vec<String> = paragraphs.into_iter().map(|p| format!("<p>{p}</p>")).collect();
        Ok(Value::safe_string(joined.join("\n")))
    } else {
        Ok(Value::string(paragraphs.join("\n\n")))
    }
}

const MONTHS_ABBR: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const MONTHS_FULL: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];
const DAYS_ABBR: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const DAYS_FULL: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// Formats the local clock with the strftime directive subset the template
/// language guarantees: `%Y %y %m %d %H %I %M %S %p %b %B %a %A %j %w %%`.
/// Unknown directives pass through literally.
fn strftime_local(format: &str) -> String {
    let now = Local::now();
    let mut out = String::with_capacity(format.len() + 8);
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", now.year())),
            Some('y') => out.push_str(&format!("{:02}", now.year().rem_euclid(100))),
            Some('m') => out.push_str(&format!("{:02}", now.month())),
            Some('d') => out.push_str(&format!("{:02}", now.day())),
            Some('H') => out.push_str(&format!("{:02}", now.hour())),
            Some('I') => out.push_str(&format!("{:02}", now.hour12().1)),
            Some('M') => out.push_str(&format!("{:02}", now.minute())),
            Some('S') => out.push_str(&format!("{:02}", now.second())),
            Some('p') => out.push_str(if now.hour12().0 { "PM" } else { "AM" }),
            Some('b') => out.push_str(MONTHS_ABBR[now.month0() as usize]),
            Some('B') => out.push_str(MONTHS_FULL[now.month0() as usize]),
            Some('a') => out.push_str(DAYS_ABBR[now.weekday().num_days_from_monday() as usize]),
            Some('A') => out.push_str(DAYS_FULL[now.weekday().num_days_from_monday() as usize]),
            Some('j') => out.push_str(&format!("{:03}", now.ordinal())),
            // Python %w counts Sunday as 0
            Some('w') => out.push_str(&now.weekday().num_days_from_sunday().to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod unit {
    use super::*;

    fn call_global(global: BuiltinGlobal, args: Vec<Value>) -> RunResult<Value> {
        call(global, ArgValues::positional(args))
    }

    #[test]
    fn range_arities() {
        let r = call_global(BuiltinGlobal::Range, vec![Value::Int(3)]).unwrap();
        assert_eq!(r.try_iter().unwrap().len(), 3);
        let r = call_global(BuiltinGlobal::Range, vec![Value::Int(1), Value::Int(7), Value::Int(2)]).unwrap();
        assert_eq!(r.len(), Some(3));
        assert!(call_global(BuiltinGlobal::Range, vec![Value::Int(1), Value::Int(2), Value::Int(0)]).is_err());
    }

    #[test]
    fn raise_exception_surfaces_message() {
        let err = call_global(BuiltinGlobal::RaiseException, vec![Value::string("boom")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RaisedException);
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn strftime_directives_shape() {
        let out = strftime_local("%Y-%m-%d %% %H:%M");
        assert_eq!(out.len(), "2026-08-01 % 12:34".len());
        assert!(out.contains('%'));
    }

    #[test]
    fn namespace_takes_kwargs() {
        let mut kwargs = ValueMap::default();
        kwargs.insert("x".to_owned(), Value::Int(1));
        let ns = call(BuiltinGlobal::Namespace, ArgValues::new(vec![], kwargs)).unwrap();
        assert!(matches!(ns, Value::Namespace(_)));
    }
}
