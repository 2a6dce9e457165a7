//! Loop state for `for` bodies.

use crate::value::Value;

/// The record behind the `loop` object.
///
/// One record lives on the VM's loop stack per active `for`; the innermost is
/// also bound as `loop` in the iteration scope, so nested loops shadow outer
/// ones naturally. Items are materialized up front, which is what makes
/// `length`, `revindex`, `previtem`, and `nextitem` cheap.
#[derive(Debug)]
pub(crate) struct LoopState {
    pub items: Vec<Value>,
    /// Current 0-based position; `usize::MAX` before the first advance.
    pub idx: usize,
    pub depth0: usize,
    /// Last values handed to `loop.changed(...)`.
    pub last_changed: Option<Vec<Value>>,
    /// Instruction index of the loop's `ForNext`.
    pub next_ip: usize,
    /// Instruction index of the loop's `ForEnd`.
    pub end_ip: usize,
    /// Whether an iteration scope is currently pushed.
    pub scope_active: bool,
}

impl LoopState {
    pub fn new(items: Vec<Value>, depth0: usize, next_ip: usize, end_ip: usize) -> Self {
        Self {
            items,
            idx: usize::MAX,
            depth0,
            last_changed: None,
            next_ip,
            end_ip,
            scope_active: false,
        }
    }

    pub fn index0(&self) -> usize {
        if self.idx == usize::MAX { 0 } else { self.idx }
    }

    /// Resolves a `loop.<name>` attribute; `None` for unknown names.
    pub fn attr(&self, name: &str) -> Option<Value> {
        let index0 = self.index0();
        let length = self.items.len();
        Some(match name {
            "index" => Value::Int(index0 as i64 + 1),
            "index0" => Value::Int(index0 as i64),
            "revindex" => Value::Int((length - index0) as i64),
            "revindex0" => Value::Int((length - index0) as i64 - 1),
            "first" => Value::Bool(index0 == 0),
            "last" => Value::Bool(index0 + 1 == length),
            "length" => Value::Int(length as i64),
            "depth" => Value::Int(self.depth0 as i64 + 1),
            "depth0" => Value::Int(self.depth0 as i64),
            "previtem" => {
                if index0 == 0 {
                    Value::Undefined
                } else {
                    self.items[index0 - 1].clone()
                }
            }
            "nextitem" => self.items.get(index0 + 1).cloned().unwrap_or(Value::Undefined),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_identities_hold() {
        let mut state = LoopState::new(vec![Value::Int(10), Value::Int(20), Value::Int(30)], 0, 0, 0);
        state.idx = 1;
        let as_i64 = |name: &str| state.attr(name).unwrap().as_i64().unwrap();
        assert_eq!(as_i64("index"), as_i64("index0") + 1);
        assert_eq!(as_i64("revindex"), 3 - as_i64("index0"));
        assert_eq!(as_i64("revindex0"), 3 - as_i64("index"));
        assert_eq!(as_i64("depth"), as_i64("depth0") + 1);
        assert!(matches!(state.attr("first"), Some(Value::Bool(false))));
        assert_eq!(state.attr("previtem").unwrap().as_i64(), Some(10));
        assert_eq!(state.attr("nextitem").unwrap().as_i64(), Some(30));
    }

    #[test]
    fn edge_items_are_undefined() {
        let mut state = LoopState::new(vec![Value::Int(1)], 0, 0, 0);
        state.idx = 0;
        assert!(state.attr("previtem").unwrap().is_undefined());
        assert!(state.attr("nextitem").unwrap().is_undefined());
        assert!(matches!(state.attr("last"), Some(Value::Bool(true))));
    }
}
