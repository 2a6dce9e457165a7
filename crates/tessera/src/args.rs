use smallvec::SmallVec;

use crate::{
    error::{Error, ErrorKind, RunResult},
    value::{Value, ValueMap},
};

/// Positional and keyword arguments for a filter, test, or function call.
///
/// Most call sites pass zero to two positional values, so the positional
/// storage is a small vector to avoid heap allocation for the common cases.
#[derive(Debug, Default)]
pub(crate) struct ArgValues {
    pos: SmallVec<[Value; 2]>,
    kwargs: ValueMap,
}

impl ArgValues {
    pub fn new(pos: Vec<Value>, kwargs: ValueMap) -> Self {
        Self {
            pos: SmallVec::from_vec(pos),
            kwargs,
        }
    }

    pub fn positional(pos: Vec<Value>) -> Self {
        Self::new(pos, ValueMap::default())
    }

    /// Checks that no arguments at all were passed.
    pub fn check_zero(self, name: &str) -> RunResult<()> {
        if self.pos.is_empty() && self.kwargs.is_empty() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::InvalidArguments,
                format!("{name}() takes no arguments ({} given)", self.pos.len() + self.kwargs.len()),
            ))
        }
    }

    /// Checks that exactly one positional argument was passed, returning it.
    pub fn get_one(mut self, name: &str) -> RunResult<Value> {
        if self.pos.len() == 1 && self.kwargs.is_empty() {
            Ok(self.pos.remove(0))
        } else {
            Err(Error::new(
                ErrorKind::InvalidArguments,
                format!("{name}() takes exactly one argument ({} given)", self.pos.len()),
            ))
        }
    }

    /// Returns all positional arguments, rejecting keyword arguments.
    pub fn into_positional(self, name: &str) -> RunResult<Vec<Value>> {
        if self.kwargs.is_empty() {
            Ok(self.pos.into_vec())
        } else {
            Err(Error::new(
                ErrorKind::InvalidArguments,
                format!("{name}() takes no keyword arguments"),
            ))
        }
    }

    pub fn into_parts(self) -> (Vec<Value>, ValueMap) {
        (self.pos.into_vec(), self.kwargs)
    }
}

/// Binds call arguments against a declared parameter order.
///
/// Positional values fill parameters left to right; a parameter not covered
/// positionally may be supplied by keyword. Covering a parameter both ways is
/// an error, as are leftover arguments at [`ArgParser::finish`].
#[derive(Debug)]
pub(crate) struct ArgParser {
    name: &'static str,
    pos: std::vec::IntoIter<Value>,
    kwargs: ValueMap,
}

impl ArgParser {
    pub fn new(name: &'static str, args: ArgValues) -> Self {
        Self {
            name,
            pos: args.pos.into_vec().into_iter(),
            kwargs: args.kwargs,
        }
    }

    /// Takes the next required parameter.
    pub fn next_arg(&mut self, param: &str) -> RunResult<Value> {
        self.next_opt(param)?.ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidArguments,
                format!("{}() missing required argument: '{param}'", self.name),
            )
        })
    }

    /// Takes the next optional parameter, from the positional list or by keyword.
    pub fn next_opt(&mut self, param: &str) -> RunResult<Option<Value>> {
        if let Some(value) = self.pos.next() {
            if self.kwargs.shift_remove(param).is_some() {
                return Err(Error::new(
                    ErrorKind::InvalidArguments,
                    format!("{}() got multiple values for argument '{param}'", self.name),
                ));
            }
            return Ok(Some(value));
        }
        Ok(self.kwargs.shift_remove(param))
    }

    /// Drains the remaining positional arguments.
    pub fn rest(&mut self) -> Vec<Value> {
        self.pos.by_ref().collect()
    }

    /// Verifies every argument was consumed.
    pub fn finish(mut self) -> RunResult<()> {
        if self.pos.next().is_some() {
            return Err(Error::new(
                ErrorKind::InvalidArguments,
                format!("{}() got too many positional arguments", self.name),
            ));
        }
        if let Some(key) = self.kwargs.keys().next() {
            return Err(Error::new(
                ErrorKind::InvalidArguments,
                format!("{}() got an unexpected keyword argument '{key}'", self.name),
            ));
        }
        Ok(())
    }
}

/// Requires a string value, returning an owned copy of its text.
pub(crate) fn coerce_str(value: &Value, name: &str, param: &str) -> RunResult<String> {
    value.as_str().map(str::to_owned).ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidArguments,
            format!("{name}() argument '{param}' must be a string, not {}", value.kind_name()),
        )
    })
}

/// Requires an integer value (bools do not coerce here).
pub(crate) fn coerce_int(value: &Value, name: &str, param: &str) -> RunResult<i64> {
    value.as_i64().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidArguments,
            format!("{name}() argument '{param}' must be an integer, not {}", value.kind_name()),
        )
    })
}

/// Requires a non-negative integer, converted to usize.
pub(crate) fn coerce_usize(value: &Value, name: &str, param: &str) -> RunResult<usize> {
    let v = coerce_int(value, name, param)?;
    usize::try_from(v).map_err(|_| {
        Error::new(
            ErrorKind::InvalidArguments,
            format!("{name}() argument '{param}' must be non-negative"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_then_keyword_binding() {
        let mut kwargs = ValueMap::default();
        kwargs.insert("end".to_owned(), Value::string("…"));
        let mut parser = ArgParser::new("truncate", ArgValues::new(vec![Value::Int(10)], kwargs));
        assert_eq!(parser.next_arg("length").unwrap().as_i64(), Some(10));
        assert!(parser.next_opt("killwords").unwrap().is_none());
        assert_eq!(parser.next_opt("end").unwrap().unwrap().as_str(), Some("…"));
        parser.finish().unwrap();
    }

    #[test]
    fn duplicate_argument_is_rejected() {
        let mut kwargs = ValueMap::default();
        kwargs.insert("sep".to_owned(), Value::string(","));
        let mut parser = ArgParser::new("join", ArgValues::new(vec![Value::string("-")], kwargs));
        let err = parser.next_arg("sep").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn unexpected_keyword_is_rejected_at_finish() {
        let mut kwargs = ValueMap::default();
        kwargs.insert("bogus".to_owned(), Value::Int(1));
        let parser = ArgParser::new("upper", ArgValues::new(vec![], kwargs));
        assert_eq!(parser.finish().unwrap_err().kind(), ErrorKind::InvalidArguments);
    }
}
