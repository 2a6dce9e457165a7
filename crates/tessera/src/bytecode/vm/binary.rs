//! Binary operator, comparison, subscript, slice, and attribute dispatch.
//!
//! Operations match on value variant pairs with a small numeric coercion
//! matrix: int op int stays int (checked), anything touching a float
//! promotes, bools participate as 0/1.

use std::cmp::Ordering;

use crate::{
    builtins,
    error::{Error, ErrorKind, RunResult},
    expressions::{CmpOperator, Operator},
    value::{Callable, Value},
};

pub(super) fn binop(op: Operator, left: &Value, right: &Value) -> RunResult<Value> {
    match op {
        Operator::Add => add(left, right),
        Operator::Sub => numeric_op(op, left, right, i64::checked_sub, |a, b| a - b),
        Operator::Mul => mul(left, right),
        Operator::Div => div(left, right),
        Operator::FloorDiv => floor_div(left, right),
        Operator::Mod => modulo(left, right),
        Operator::Pow => pow(left, right),
        Operator::Concat => {
            let mut out = left.to_display_string();
            right.write_display(&mut out);
            Ok(Value::string(out))
        }
    }
}

fn type_error(op: Operator, left: &Value, right: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!(
            "unsupported operand types for `{}`: {} and {}",
            op.describe(),
            left.kind_name(),
            right.kind_name()
        ),
    )
}

fn overflow(op: Operator) -> Error {
    Error::new(
        ErrorKind::IntegerOverflow,
        format!("integer overflow in `{}`", op.describe()),
    )
}

/// Integer view for arithmetic: ints and bools (0/1).
fn int_operand(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(*v),
        Value::Bool(v) => Some(i64::from(*v)),
        _ => None,
    }
}

fn numeric_op(
    op: Operator,
    left: &Value,
    right: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> RunResult<Value> {
    if let (Some(a), Some(b)) = (int_operand(left), int_operand(right)) {
        return int_op(a, b).map(Value::Int).ok_or_else(|| overflow(op));
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
        _ => Err(type_error(op, left, right)),
    }
}

fn add(left: &Value, right: &Value) -> RunResult<Value> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => {
            let mut out = a.as_str().to_owned();
            out.push_str(b.as_str());
            Ok(Value::string(out))
        }
        (Value::Str(_), _) | (_, Value::Str(_)) => Err(type_error(Operator::Add, left, right)),
        (Value::List(a), Value::List(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().cloned());
            Ok(Value::list(out))
        }
        _ => numeric_op(Operator::Add, left, right, i64::checked_add, |a, b| a + b),
    }
}

fn mul(left: &Value, right: &Value) -> RunResult<Value> {
    match (left, right) {
        (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
            let times = usize::try_from(*n).unwrap_or(0);
            Ok(Value::string(s.as_str().repeat(times)))
        }
        (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
            let times = usize::try_from(*n).unwrap_or(0);
            let items = items.borrow();
            let mut out = Vec::with_capacity(items.len() * times);
            for _ in 0..times {
                out.extend(items.iter().cloned());
            }
            Ok(Value::list(out))
        }
        _ => numeric_op(Operator::Mul, left, right, i64::checked_mul, |a, b| a * b),
    }
}

fn div(left: &Value, right: &Value) -> RunResult<Value> {
    match (left.as_f64(), right.as_f64()) {
        (Some(_), Some(b)) if b == 0.0 => Err(Error::new(ErrorKind::DivisionByZero, "division by zero")),
        // true division always yields a float
        (Some(a), Some(b)) => Ok(Value::Float(a / b)),
        _ => Err(type_error(Operator::Div, left, right)),
    }
}

fn floor_div(left: &Value, right: &Value) -> RunResult<Value> {
    if let (Some(a), Some(b)) = (int_operand(left), int_operand(right)) {
        if b == 0 {
            return Err(Error::new(ErrorKind::DivisionByZero, "integer division by zero"));
        }
        // floor toward negative infinity, like Python
        let q = a.checked_div(b).ok_or_else(|| overflow(Operator::FloorDiv))?;
        let r = a % b;
        let floored = if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q };
        return Ok(Value::Int(floored));
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(_), Some(b)) if b == 0.0 => Err(Error::new(ErrorKind::DivisionByZero, "division by zero")),
        (Some(a), Some(b)) => Ok(Value::Float((a / b).floor())),
        _ => Err(type_error(Operator::FloorDiv, left, right)),
    }
}

fn modulo(left: &Value, right: &Value) -> RunResult<Value> {
    if let (Some(a), Some(b)) = (int_operand(left), int_operand(right)) {
        if b == 0 {
            return Err(Error::new(ErrorKind::DivisionByZero, "modulo by zero"));
        }
        // result takes the divisor's sign, like Python
        let r = a % b;
        let adjusted = if r != 0 && (r < 0) != (b < 0) { r + b } else { r };
        return Ok(Value::Int(adjusted));
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(_), Some(b)) if b == 0.0 => Err(Error::new(ErrorKind::DivisionByZero, "modulo by zero")),
        (Some(a), Some(b)) => {
            let r = a % b;
            let adjusted = if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r };
            Ok(Value::Float(adjusted))
        }
        _ => Err(type_error(Operator::Mod, left, right)),
    }
}

fn pow(left: &Value, right: &Value) -> RunResult<Value> {
    if let (Some(a), Some(b)) = (int_operand(left), int_operand(right))
        && b >= 0
    {
        let exp = u32::try_from(b).map_err(|_| overflow(Operator::Pow))?;
        return a.checked_pow(exp).map(Value::Int).ok_or_else(|| overflow(Operator::Pow));
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
        _ => Err(type_error(Operator::Pow, left, right)),
    }
}

pub(super) fn compare(op: CmpOperator, left: &Value, right: &Value) -> RunResult<Value> {
    let result = match op {
        CmpOperator::Eq => left.value_eq(right),
        CmpOperator::Ne => !left.value_eq(right),
        CmpOperator::In => right.contains(left)?,
        CmpOperator::NotIn => !right.contains(left)?,
        CmpOperator::Lt | CmpOperator::Le | CmpOperator::Gt | CmpOperator::Ge => {
            let Some(ordering) = left.value_cmp(right) else {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    format!(
                        "cannot compare {} with {}",
                        left.kind_name(),
                        right.kind_name()
                    ),
                ));
            };
            match op {
                CmpOperator::Lt => ordering == Ordering::Less,
                CmpOperator::Le => ordering != Ordering::Greater,
                CmpOperator::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }
        }
    };
    Ok(Value::Bool(result))
}

/// Attribute lookup: methods first (the Python `getattr` order), then mapping
/// entries; unknown attributes chain to undefined.
pub(super) fn get_attr(obj: &Value, name: &str) -> RunResult<Value> {
    if let Value::Loop(state) = obj
        && let Some(value) = state.borrow().attr(name)
    {
        return Ok(value);
    }
    if let Some(method) = builtins::method_for(obj, name) {
        return Ok(Value::callable(Callable::Method {
            recv: obj.clone(),
            method,
        }));
    }
    Ok(match obj {
        Value::Dict(map) | Value::Namespace(map) => map.borrow().get(name).cloned().unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    })
}

/// Subscript lookup: item access only, never methods. Missing entries chain
/// to undefined; unsupported containers are an error.
pub(super) fn subscript(obj: &Value, index: &Value) -> RunResult<Value> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let Some(i) = normalize_index(index, items.len(), obj)? else {
                return Ok(Value::Undefined);
            };
            Ok(items.get(i).cloned().unwrap_or(Value::Undefined))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.as_str().chars().collect();
            let Some(i) = normalize_index(index, chars.len(), obj)? else {
                return Ok(Value::Undefined);
            };
            Ok(chars.get(i).map_or(Value::Undefined, |c| Value::string(c.to_string())))
        }
        Value::Range(r) => {
            let Some(i) = normalize_index(index, r.len(), obj)? else {
                return Ok(Value::Undefined);
            };
            if i < r.len() {
                Ok(Value::Int(r.at(i)))
            } else {
                Ok(Value::Undefined)
            }
        }
        Value::Dict(map) | Value::Namespace(map) => match index.as_str() {
            Some(key) => Ok(map.borrow().get(key).cloned().unwrap_or(Value::Undefined)),
            None => Ok(Value::Undefined),
        },
        Value::Undefined => Ok(Value::Undefined),
        other => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("value of type {} is not subscriptable", other.kind_name()),
        )),
    }
}

/// Wraps a possibly negative index; out-of-range becomes `None`.
fn normalize_index(index: &Value, len: usize, obj: &Value) -> RunResult<Option<usize>> {
    let Some(raw) = index.as_i64() else {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!(
                "{} indices must be integers, not {}",
                obj.kind_name(),
                index.kind_name()
            ),
        ));
    };
    let len = len as i64;
    let wrapped = if raw < 0 { raw + len } else { raw };
    if wrapped < 0 || wrapped >= len {
        Ok(None)
    } else {
        Ok(Some(wrapped as usize))
    }
}

/// Python slice semantics: omitted bounds default per step direction,
/// negative bounds wrap, everything clamps instead of erroring.
pub(super) fn slice(
    obj: &Value,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> RunResult<Value> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Error::new(ErrorKind::InvalidOperation, "slice step cannot be zero"));
    }
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let picked = slice_indices(items.len(), start, stop, step)
                .into_iter()
                .map(|i| items[i].clone())
                .collect();
            Ok(Value::list(picked))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.as_str().chars().collect();
            let picked: String = slice_indices(chars.len(), start, stop, step)
                .into_iter()
                .map(|i| chars[i])
                .collect();
            Ok(Value::string(picked))
        }
        Value::Range(r) => {
            let picked = slice_indices(r.len(), start, stop, step)
                .into_iter()
                .map(|i| Value::Int(r.at(i)))
                .collect();
            Ok(Value::list(picked))
        }
        Value::Undefined => Ok(Value::Undefined),
        other => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("value of type {} cannot be sliced", other.kind_name()),
        )),
    }
}

fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let clamp_bound = |v: i64, low: i64, high: i64| v.clamp(low, high);
    let wrap = |v: i64| if v < 0 { v + len } else { v };
    let mut out = Vec::new();
    if step > 0 {
        let begin = clamp_bound(start.map_or(0, wrap), 0, len);
        let end = clamp_bound(stop.map_or(len, wrap), 0, len);
        let mut i = begin;
        while i < end {
            out.push(i as usize);
            i += step;
        }
    } else {
        let begin = clamp_bound(start.map_or(len - 1, wrap), -1, len - 1);
        let end = clamp_bound(stop.map_or(-1, wrap), -1, len - 1);
        let mut i = begin;
        while i > end {
            out.push(i as usize);
            i += step;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn division_always_floats() {
        let v = binop(Operator::Div, &Value::Int(7), &Value::Int(2)).unwrap();
        assert_eq!(v.to_display_string(), "3.5");
    }

    #[test]
    fn floor_division_floors_negatives() {
        let v = binop(Operator::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap();
        assert_eq!(v.as_i64(), Some(-4));
        let v = binop(Operator::FloorDiv, &Value::Int(7), &Value::Int(-2)).unwrap();
        assert_eq!(v.as_i64(), Some(-4));
    }

    #[test]
    fn modulo_takes_divisor_sign() {
        let v = binop(Operator::Mod, &Value::Int(-7), &Value::Int(3)).unwrap();
        assert_eq!(v.as_i64(), Some(2));
    }

    #[test]
    fn concat_stringifies() {
        let v = binop(Operator::Concat, &Value::Int(1), &Value::string("x")).unwrap();
        assert_eq!(v.as_str(), Some("1x"));
    }

    #[test]
    fn string_repetition() {
        let v = binop(Operator::Mul, &Value::string("ab"), &Value::Int(3)).unwrap();
        assert_eq!(v.as_str(), Some("ababab"));
    }

    #[test]
    fn negative_indices_wrap() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let v = subscript(&list, &Value::Int(-1)).unwrap();
        assert_eq!(v.as_i64(), Some(3));
        assert!(subscript(&list, &Value::Int(9)).unwrap().is_undefined());
    }

    #[test]
    fn slice_defaults_and_negative_step() {
        let list = Value::list((1..=5).map(Value::Int).collect());
        let v = slice(&list, Some(1), None, None).unwrap();
        assert_eq!(v.to_display_string(), "[2, 3, 4, 5]");
        let v = slice(&list, None, None, Some(-1)).unwrap();
        assert_eq!(v.to_display_string(), "[5, 4, 3, 2, 1]");
        let v = slice(&list, None, Some(-2), Some(2)).unwrap();
        assert_eq!(v.to_display_string(), "[1, 3]");
    }

    #[test]
    fn division_by_zero_is_reported() {
        let err = binop(Operator::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DivisionByZero);
    }
}
