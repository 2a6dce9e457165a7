//! The template virtual machine.
//!
//! A stack machine over [`Code`] chunks. State beyond the operand stack: the
//! scope chain (refcounted frames, so macro closures keep their defining
//! scopes alive), the output buffer stack, the autoescape stack, the loop
//! stack, the block-resolution chain for inheritance, and the active render
//! stack used for cycle detection.

mod binary;
pub(crate) mod loops;

use std::{cell::RefCell, rc::Rc, sync::Arc};

use ahash::AHashMap;
use indexmap::IndexMap;

use loops::LoopState;

use crate::{
    args::ArgValues,
    asyncio::AsyncCell,
    builtins,
    bytecode::{Code, Instr},
    environment::{Environment, FilterImpl, HostFilter, TestImpl},
    error::{Error, ErrorKind, RunResult},
    object::Object,
    output::Output,
    template::{BlockDef, Template},
    value::{Callable, MacroValue, ScopeMap, ScopeRef, Value, ValueMap},
};

/// Maximum eval nesting (blocks, macros, includes) within one render.
const MAX_RECURSION: usize = 500;

enum Flow {
    Next,
    Return,
}

/// Tracks the active block while its body runs, for `super()`.
struct BlockFrame {
    name: String,
    depth: usize,
}

pub(crate) struct Vm<'env> {
    env: &'env Environment,
    async_mode: bool,
    stack: Vec<Value>,
    /// Scope chain, innermost last. Index 0 is the template root scope.
    scopes: Vec<ScopeRef>,
    out: Output,
    autoescape: Vec<bool>,
    loops: Vec<Rc<RefCell<LoopState>>>,
    /// Names of templates currently being rendered; a repeat is a cycle.
    render_stack: Vec<String>,
    /// Most-derived-first block definitions per name, with owning templates.
    blocks: AHashMap<String, Vec<(Arc<Template>, Arc<BlockDef>)>>,
    block_frames: Vec<BlockFrame>,
    /// Parent template name recorded by an `Extends` instruction.
    pending_extends: Option<String>,
    /// True while running an extending template's root for side effects only;
    /// output is discarded and block call sites are skipped.
    collecting: bool,
    depth: usize,
}

impl<'env> Vm<'env> {
    /// Renders a compiled template with the given variables.
    pub fn render(
        env: &'env Environment,
        template: &Arc<Template>,
        vars: IndexMap<String, Object>,
        async_mode: bool,
    ) -> Result<String, Error> {
        let mut root_scope = ScopeMap::default();
        for (name, value) in vars {
            root_scope.insert(name, value.into_value());
        }
        let mut vm = Vm {
            env,
            async_mode,
            stack: Vec::new(),
            scopes: vec![Rc::new(RefCell::new(root_scope))],
            out: Output::new(),
            autoescape: vec![env.autoescape_for(&template.name)],
            loops: Vec::new(),
            render_stack: vec![template.name.clone()],
            blocks: AHashMap::new(),
            block_frames: Vec::new(),
            pending_extends: None,
            collecting: false,
            depth: 0,
        };
        vm.exec_template(template)?;
        Ok(vm.out.finish())
    }

    /// Runs a template through its inheritance chain.
    ///
    /// Extending roots execute once each with output discarded (collecting
    /// template-scope side effects and the parent name), then the root-most
    /// template's body renders with the merged block-resolution map.
    fn exec_template(&mut self, template: &Arc<Template>) -> RunResult<()> {
        let render_stack_len = self.render_stack.len();
        let mut chain = vec![template.clone()];
        loop {
            let current = chain.last().expect("chain is never empty").clone();
            if !current.has_extends {
                break;
            }
            self.pending_extends = None;
            self.out.begin_discard();
            let was_collecting = std::mem::replace(&mut self.collecting, true);
            let result = self.eval(&current.root, &current);
            self.collecting = was_collecting;
            self.out.end_discard();
            result?;
            let Some(parent_name) = self.pending_extends.take() else {
                break;
            };
            self.check_cycle(&parent_name)?;
            let parent = self.env.get_template(&parent_name)?;
            self.render_stack.push(parent_name);
            chain.push(parent);
        }

        let mut block_map: AHashMap<String, Vec<(Arc<Template>, Arc<BlockDef>)>> = AHashMap::new();
        for tmpl in &chain {
            for (name, def) in &tmpl.blocks {
                block_map
                    .entry(name.clone())
                    .or_default()
                    .push((tmpl.clone(), def.clone()));
            }
        }
        for defs in block_map.values() {
            let (_, most_derived) = &defs[0];
            if most_derived.required {
                return Err(Error::new(
                    ErrorKind::RequiredBlockUnsatisfied,
                    format!("required block `{}` was never overridden", most_derived.name),
                )
                .with_template(&template.name));
            }
        }
        self.blocks = block_map;

        let root = chain.last().expect("chain is never empty").clone();
        let result = self.eval(&root.root, &root);
        // parent names pushed while walking the chain are done rendering
        self.render_stack.truncate(render_stack_len);
        result
    }

    fn check_cycle(&self, name: &str) -> RunResult<()> {
        if self.render_stack.iter().any(|active| active == name) {
            return Err(Error::new(
                ErrorKind::CycleDetected,
                format!("template {name:?} is already being rendered (inheritance/include cycle)"),
            ));
        }
        Ok(())
    }

    // --- interpreter core ---

    fn eval(&mut self, code: &Code, template: &Arc<Template>) -> RunResult<()> {
        self.depth += 1;
        if self.depth > MAX_RECURSION {
            self.depth -= 1;
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "render recursion limit reached",
            ));
        }
        let mut ip = 0usize;
        let result = loop {
            if ip >= code.instrs.len() {
                break Ok(());
            }
            let at = ip;
            match self.exec_instr(code, template, &mut ip) {
                Ok(Flow::Next) => {}
                Ok(Flow::Return) => break Ok(()),
                Err(e) => break Err(e.with_loc(code.span_at(at)).with_template(&template.name)),
            }
        };
        self.depth -= 1;
        result
    }

    fn exec_instr(&mut self, code: &Code, template: &Arc<Template>, ip: &mut usize) -> RunResult<Flow> {
        let instr = &code.instrs[*ip];
        *ip += 1;
        match instr {
            Instr::EmitText(idx) => {
                self.out.write_str(code.const_at(*idx).as_str());
            }
            Instr::EmitValue => {
                let value = self.pop_resolved()?;
                if self.env.is_strict() && value.is_undefined() {
                    return Err(undefined_error("cannot render an undefined value"));
                }
                let escape = *self.autoescape.last().expect("autoescape stack is never empty");
                self.out.write_value(&value, escape);
            }
            Instr::LoadConst(idx) => self.stack.push(code.const_at(*idx).to_value()),
            Instr::LoadUndefined => self.stack.push(Value::Undefined),
            Instr::LoadName(idx) => {
                let value = self.lookup_name(code.name_at(*idx));
                self.stack.push(value);
            }
            Instr::StoreName(idx) => {
                let value = self.pop();
                self.store_name(code.name_at(*idx), value);
            }
            Instr::LoadAttr(idx) => {
                let obj = self.pop_resolved()?;
                if self.env.is_strict() && obj.is_undefined() {
                    return Err(undefined_error("attribute lookup on undefined value"));
                }
                let value = binary::get_attr(&obj, code.name_at(*idx))?;
                self.stack.push(value);
            }
            Instr::StoreAttr(idx) => {
                let value = self.pop();
                let obj = self.pop_resolved()?;
                let Value::Namespace(map) = &obj else {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        format!("cannot assign attributes on {}", obj.kind_name()),
                    ));
                };
                map.borrow_mut().insert(code.name_at(*idx).to_owned(), value);
            }
            Instr::LoadSubscript => {
                let index = self.pop_resolved()?;
                let obj = self.pop_resolved()?;
                if self.env.is_strict() && obj.is_undefined() {
                    return Err(undefined_error("subscript on undefined value"));
                }
                let value = binary::subscript(&obj, &index)?;
                self.stack.push(value);
            }
            Instr::Slice {
                has_start,
                has_stop,
                has_step,
            } => {
                let step = if *has_step { self.pop_slice_bound("step")? } else { None };
                let stop = if *has_stop { self.pop_slice_bound("stop")? } else { None };
                let start = if *has_start { self.pop_slice_bound("start")? } else { None };
                let obj = self.pop_resolved()?;
                if self.env.is_strict() && obj.is_undefined() {
                    return Err(undefined_error("slice of undefined value"));
                }
                let value = binary::slice(&obj, start, stop, step)?;
                self.stack.push(value);
            }
            Instr::BuildList(n) => {
                let split = self.stack.len() - *n as usize;
                let items = self.stack.split_off(split);
                self.stack.push(Value::list(items));
            }
            Instr::BuildDict(n) => {
                let split = self.stack.len() - 2 * *n as usize;
                let flat = self.stack.split_off(split);
                let mut map = ValueMap::default();
                let mut iter = flat.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    let key = self.resolve(key)?;
                    let Some(key) = key.as_str().map(str::to_owned) else {
                        return Err(Error::new(
                            ErrorKind::InvalidOperation,
                            format!("dict keys must be strings, got {}", key.kind_name()),
                        ));
                    };
                    map.insert(key, value);
                }
                self.stack.push(Value::dict(map));
            }
            Instr::BinOp(op) => {
                let right = self.pop_resolved()?;
                let left = self.pop_resolved()?;
                self.stack.push(binary::binop(*op, &left, &right)?);
            }
            Instr::Neg => {
                let value = self.pop_resolved()?;
                let negated = match value {
                    Value::Int(v) => Value::Int(v.checked_neg().ok_or_else(|| {
                        Error::new(ErrorKind::IntegerOverflow, "integer overflow in negation")
                    })?),
                    Value::Float(v) => Value::Float(-v),
                    other => {
                        return Err(Error::new(
                            ErrorKind::InvalidOperation,
                            format!("cannot negate {}", other.kind_name()),
                        ));
                    }
                };
                self.stack.push(negated);
            }
            Instr::Not => {
                let value = self.pop_resolved()?;
                self.check_strict_truth(&value)?;
                self.stack.push(Value::Bool(!value.is_truthy()));
            }
            Instr::Compare(op) => {
                let right = self.pop_resolved()?;
                let left = self.pop_resolved()?;
                self.stack.push(binary::compare(*op, &left, &right)?);
            }
            Instr::PerformTest {
                name,
                argc,
                has_kwargs,
                negated,
            } => {
                let args = self.pop_call_args(*argc, *has_kwargs)?;
                let value = self.pop_resolved()?;
                let verdict = self.perform_test(code.name_at(*name), &value, args)?;
                self.stack.push(Value::Bool(verdict != *negated));
            }
            Instr::ApplyFilter { name, argc, has_kwargs } => {
                let args = self.pop_call_args(*argc, *has_kwargs)?;
                let value = self.pop_resolved()?;
                let result = self.apply_filter(code.name_at(*name), value, args)?;
                self.stack.push(result);
            }
            Instr::Call {
                argc,
                has_kwargs,
                has_caller,
            } => {
                let args = self.pop_call_args(*argc, *has_kwargs)?;
                let callee = self.pop_resolved()?;
                let caller = if *has_caller { Some(self.pop()) } else { None };
                let result = self.call_value(&callee, args, caller)?;
                self.stack.push(result);
            }
            Instr::Jump(target) => *ip = *target as usize,
            Instr::JumpIfFalse(target) => {
                let value = self.pop_resolved()?;
                self.check_strict_truth(&value)?;
                if !value.is_truthy() {
                    *ip = *target as usize;
                }
            }
            Instr::JumpIfTrue(target) => {
                let value = self.pop_resolved()?;
                self.check_strict_truth(&value)?;
                if value.is_truthy() {
                    *ip = *target as usize;
                }
            }
            Instr::JumpIfFalseOrPop(target) => {
                let value = self.pop_resolved()?;
                self.check_strict_truth(&value)?;
                if !value.is_truthy() {
                    self.stack.push(value);
                    *ip = *target as usize;
                }
            }
            Instr::JumpIfTrueOrPop(target) => {
                let value = self.pop_resolved()?;
                self.check_strict_truth(&value)?;
                if value.is_truthy() {
                    self.stack.push(value);
                    *ip = *target as usize;
                }
            }
            Instr::JumpIfBound { name, target } => {
                let bound = self
                    .scopes
                    .last()
                    .expect("scope chain is never empty")
                    .borrow()
                    .contains_key(code.name_at(*name));
                if bound {
                    *ip = *target as usize;
                }
            }
            Instr::PushScope => self.scopes.push(Rc::new(RefCell::new(ScopeMap::default()))),
            Instr::PopScope => {
                self.scopes.pop();
            }
            Instr::ForStart { filter, end } => {
                let iterable = self.pop_resolved()?;
                if self.env.is_strict() && iterable.is_undefined() {
                    return Err(undefined_error("iteration over undefined value"));
                }
                let mut items = iterable.try_iter()?;
                if let Some(filter_idx) = filter {
                    items = self.filter_items(code, template, *filter_idx, items)?;
                }
                let state = LoopState::new(items, self.loops.len(), *ip, *end as usize);
                self.loops.push(Rc::new(RefCell::new(state)));
            }
            Instr::ForNext { end } => {
                let state = self.loops.last().expect("for-next without loop").clone();
                let mut s = state.borrow_mut();
                if s.scope_active {
                    self.scopes.pop();
                    s.scope_active = false;
                }
                let next_idx = if s.idx == usize::MAX { 0 } else { s.idx + 1 };
                if next_idx >= s.items.len() {
                    *ip = *end as usize;
                } else {
                    s.idx = next_idx;
                    s.scope_active = true;
                    let item = s.items[next_idx].clone();
                    drop(s);
                    let mut scope = ScopeMap::default();
                    scope.insert("loop".to_owned(), Value::Loop(state));
                    self.scopes.push(Rc::new(RefCell::new(scope)));
                    self.stack.push(item);
                }
            }
            Instr::ForEnd { push_did_iterate } => {
                let state = self.loops.pop().expect("for-end without loop");
                if *push_did_iterate {
                    let did_iterate = !state.borrow().items.is_empty();
                    self.stack.push(Value::Bool(did_iterate));
                }
            }
            Instr::Break { extra_scopes } => {
                for _ in 0..*extra_scopes {
                    self.scopes.pop();
                }
                let state = self.loops.last().expect("break without loop").clone();
                let mut s = state.borrow_mut();
                if s.scope_active {
                    self.scopes.pop();
                    s.scope_active = false;
                }
                *ip = s.end_ip;
            }
            Instr::Continue { extra_scopes } => {
                for _ in 0..*extra_scopes {
                    self.scopes.pop();
                }
                let state = self.loops.last().expect("continue without loop").clone();
                let next_ip = state.borrow().next_ip;
                *ip = next_ip;
            }
            Instr::UnpackSequence(n) => {
                let value = self.pop_resolved()?;
                let items = value.try_iter()?;
                if items.len() != *n as usize {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        format!("cannot unpack {} values into {n} targets", items.len()),
                    ));
                }
                for item in items.into_iter().rev() {
                    self.stack.push(item);
                }
            }
            Instr::BeginCapture => self.out.begin_capture(),
            Instr::EndCaptureValue => {
                let text = self.out.end_capture();
                self.stack.push(Value::safe_string(text));
            }
            Instr::CallBlock(idx) => {
                if !self.collecting {
                    self.render_block(code.name_at(*idx), 0, template)?;
                }
            }
            Instr::MakeMacro(idx) => {
                let def = template.macros[*idx as usize].clone();
                self.stack.push(Value::Macro(Rc::new(MacroValue {
                    def,
                    template: template.clone(),
                    closure: self.scopes.clone(),
                })));
            }
            Instr::Include {
                ignore_missing,
                with_context,
            } => {
                let names = self.pop_resolved()?;
                self.include_template(&names, *ignore_missing, *with_context)?;
            }
            Instr::Import { with_context } => {
                let name = self.pop_resolved()?;
                let module = self.import_template(&name, *with_context)?;
                self.stack.push(module);
            }
            Instr::LoadExport(idx) => {
                let module = self.pop();
                let name = code.name_at(*idx);
                let Value::Namespace(map) = &module else {
                    return Err(Error::new(ErrorKind::InvalidOperation, "import of a non-module value"));
                };
                let Some(value) = map.borrow().get(name).cloned() else {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        format!("imported template does not export {name:?}"),
                    ));
                };
                self.stack.push(value);
            }
            Instr::Dup => {
                let top = self.stack.last().expect("dup on empty stack").clone();
                self.stack.push(top);
            }
            Instr::Pop => {
                self.pop();
            }
            Instr::Extends => {
                let name = self.pop_resolved()?;
                let Some(name) = name.as_str() else {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        format!("extends requires a template name, got {}", name.kind_name()),
                    ));
                };
                self.pending_extends = Some(name.to_owned());
            }
            Instr::PushAutoescape => {
                let value = self.pop_resolved()?;
                self.autoescape.push(value.is_truthy());
            }
            Instr::PopAutoescape => {
                self.autoescape.pop();
            }
            Instr::Return => return Ok(Flow::Return),
        }
        Ok(Flow::Next)
    }

    // --- stack and name helpers ---

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn pop_resolved(&mut self) -> RunResult<Value> {
        let value = self.pop();
        self.resolve(value)
    }

    /// Auto-awaits an async result at its point of use.
    fn resolve(&self, value: Value) -> RunResult<Value> {
        match value {
            Value::AsyncResult(cell) => cell.borrow_mut().resolve(),
            other => Ok(other),
        }
    }

    fn pop_slice_bound(&mut self, what: &str) -> RunResult<Option<i64>> {
        let value = self.pop_resolved()?;
        match value {
            Value::None | Value::Undefined => Ok(None),
            other => other.as_i64().map(Some).ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("slice {what} must be an integer, got {}", other.kind_name()),
                )
            }),
        }
    }

    fn check_strict_truth(&self, value: &Value) -> RunResult<()> {
        if self.env.is_strict() && value.is_undefined() {
            return Err(undefined_error("undefined value used in a boolean context"));
        }
        Ok(())
    }

    fn lookup_name(&self, name: &str) -> Value {
        if name == "super" && !self.block_frames.is_empty() {
            return Value::callable(Callable::Super);
        }
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.borrow().get(name) {
                return value.clone();
            }
        }
        self.env.lookup_global(name).unwrap_or(Value::Undefined)
    }

    fn store_name(&mut self, name: &str, value: Value) {
        self.scopes
            .last()
            .expect("scope chain is never empty")
            .borrow_mut()
            .insert(name.to_owned(), value);
    }

    /// Pops call arguments: the kwargs dict (when flagged), then `argc`
    /// positional values.
    fn pop_call_args(&mut self, argc: u8, has_kwargs: bool) -> RunResult<ArgValues> {
        let kwargs = if has_kwargs {
            let dict = self.pop_resolved()?;
            let Value::Dict(map) = dict else {
                return Err(Error::new(ErrorKind::InvalidOperation, "malformed keyword arguments"));
            };
            map.borrow().clone()
        } else {
            ValueMap::default()
        };
        let split = self.stack.len() - argc as usize;
        let pos = self.stack.split_off(split);
        Ok(ArgValues::new(pos, kwargs))
    }

    // --- filters, tests, calls ---

    fn apply_filter(&mut self, name: &str, value: Value, args: ArgValues) -> RunResult<Value> {
        if self.env.is_strict() && value.is_undefined() && !matches!(name, "default" | "d") {
            return Err(undefined_error(&format!("undefined value piped into filter {name}")));
        }
        match self.env.lookup_filter(name) {
            None => Err(Error::new(ErrorKind::UnknownFilter, format!("no filter named {name}"))),
            Some(FilterImpl::Builtin(filter)) => filter.call(value, args, self.env),
            Some(FilterImpl::Host(host)) => {
                let (pos, kwargs) = args.into_parts();
                if self.async_mode && host.async_fn.is_some() {
                    Ok(self.defer_host_call(host, &value, &pos, &kwargs))
                } else {
                    host.call_sync(&value, &pos, &kwargs)
                }
            }
        }
    }

    /// Wraps an async host function into a pending async result resolved at
    /// the point of use.
    fn defer_host_call(&self, host: &HostFilter, value: &Value, pos: &[Value], kwargs: &ValueMap) -> Value {
        let func = host.async_fn.clone().expect("deferred call requires an async fn");
        let value = Object::from_value(value);
        let pos: Vec<Object> = pos.iter().map(Object::from_value).collect();
        let kwargs: IndexMap<String, Object> =
            kwargs.iter().map(|(k, v)| (k.clone(), Object::from_value(v))).collect();
        let id = self.env.next_async_id();
        let resolver = Box::new(move || func(value, &pos, &kwargs).map(Object::into_value));
        Value::AsyncResult(Rc::new(RefCell::new(AsyncCell::pending(id, resolver))))
    }

    fn perform_test(&mut self, name: &str, value: &Value, args: ArgValues) -> RunResult<bool> {
        if self.env.is_strict() && value.is_undefined() && !matches!(name, "defined" | "undefined") {
            return Err(undefined_error(&format!("undefined value tested with {name}")));
        }
        match self.env.lookup_test(name) {
            None => Err(Error::new(ErrorKind::UnknownTest, format!("no test named {name}"))),
            Some(TestImpl::Builtin(test)) => test.call(value, args, self.env),
            Some(TestImpl::Host(host)) => {
                let (pos, kwargs) = args.into_parts();
                // a test's verdict is consumed immediately, so the async
                // variant resolves right here
                let func = if self.async_mode && host.async_fn.is_some() {
                    host.async_fn.clone().expect("checked above")
                } else {
                    host.sync_fn.clone()
                };
                let entry = HostFilter {
                    sync_fn: func,
                    async_fn: None,
                };
                Ok(entry.call_sync(value, &pos, &kwargs)?.is_truthy())
            }
        }
    }

    fn call_value(&mut self, callee: &Value, args: ArgValues, caller: Option<Value>) -> RunResult<Value> {
        match callee {
            Value::Macro(m) => self.call_macro(m, args, caller),
            Value::Callable(c) => {
                if caller.is_some() {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        "call blocks can only invoke macros",
                    ));
                }
                match &**c {
                    Callable::Global(global) => global.call(args),
                    Callable::Cycler(state) => {
                        args.check_zero("cycler")?;
                        let mut state = state.borrow_mut();
                        let item = state.items[state.pos % state.items.len()].clone();
                        state.pos += 1;
                        Ok(item)
                    }
                    Callable::Joiner(state) => {
                        args.check_zero("joiner")?;
                        let mut state = state.borrow_mut();
                        if state.used {
                            Ok(Value::string(state.sep.clone()))
                        } else {
                            state.used = true;
                            Ok(Value::string(""))
                        }
                    }
                    Callable::Method { recv, method } => builtins::call_method(recv, *method, args),
                    Callable::Host { func, .. } => {
                        let (pos, kwargs) = args.into_parts();
                        let pos: Vec<Object> = pos.iter().map(Object::from_value).collect();
                        let kwargs: IndexMap<String, Object> =
                            kwargs.iter().map(|(k, v)| (k.clone(), Object::from_value(v))).collect();
                        func(&pos, &kwargs).map(Object::into_value)
                    }
                    Callable::Super => {
                        args.check_zero("super")?;
                        self.render_super()
                    }
                }
            }
            Value::Undefined => Err(undefined_error("cannot call an undefined value")),
            other => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("value of type {} is not callable", other.kind_name()),
            )),
        }
    }

    /// Invokes a macro: binds arguments into a fresh scope parented at the
    /// closure chain, collects extras into `varargs`/`kwargs`, binds `caller`,
    /// and captures the body's output as a safe string.
    fn call_macro(&mut self, m: &Rc<MacroValue>, args: ArgValues, caller: Option<Value>) -> RunResult<Value> {
        let (pos, mut kwargs) = args.into_parts();
        let mut scope = ScopeMap::default();
        let mut pos_iter = pos.into_iter();
        for param in &m.def.params {
            if let Some(value) = pos_iter.next() {
                if kwargs.shift_remove(&param.name).is_some() {
                    return Err(Error::new(
                        ErrorKind::InvalidArguments,
                        format!("{}() got multiple values for argument '{}'", m.def.name, param.name),
                    ));
                }
                scope.insert(param.name.clone(), value);
            } else if let Some(value) = kwargs.shift_remove(&param.name) {
                scope.insert(param.name.clone(), value);
            }
            // unbound parameters stay missing so the default prologue fills them
        }
        scope.insert("varargs".to_owned(), Value::list(pos_iter.collect()));
        let mut extra = ValueMap::default();
        for (key, value) in kwargs {
            extra.insert(key, value);
        }
        scope.insert("kwargs".to_owned(), Value::dict(extra));
        scope.insert("caller".to_owned(), caller.unwrap_or(Value::Undefined));

        let mut chain = m.closure.clone();
        chain.push(Rc::new(RefCell::new(scope)));
        let saved_scopes = std::mem::replace(&mut self.scopes, chain);
        let saved_loops = std::mem::take(&mut self.loops);
        self.out.begin_capture();
        let result = self.eval(&m.def.code, &m.template);
        let text = self.out.end_capture();
        self.loops = saved_loops;
        self.scopes = saved_scopes;
        result?;
        Ok(Value::safe_string(text))
    }

    // --- inheritance ---

    /// Renders the block definition at `depth` in the resolution chain.
    fn render_block(&mut self, name: &str, depth: usize, template: &Arc<Template>) -> RunResult<()> {
        let defs = match self.blocks.get(name) {
            Some(defs) if !defs.is_empty() => defs.clone(),
            _ => match template.blocks.get(name) {
                Some(def) => vec![(template.clone(), def.clone())],
                None => {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        format!("no block named `{name}`"),
                    ));
                }
            },
        };
        let Some((owner, def)) = defs.get(depth).cloned() else {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("block `{name}` has no definition to render at this level"),
            ));
        };
        self.block_frames.push(BlockFrame {
            name: name.to_owned(),
            depth,
        });
        // non-scoped blocks see only the template root scope
        let saved_scopes = if def.scoped {
            None
        } else {
            let root = self.scopes.first().expect("scope chain is never empty").clone();
            Some(std::mem::replace(&mut self.scopes, vec![root]))
        };
        self.scopes.push(Rc::new(RefCell::new(ScopeMap::default())));
        let result = self.eval(&def.code, &owner);
        self.scopes.pop();
        if let Some(saved) = saved_scopes {
            self.scopes = saved;
        }
        self.block_frames.pop();
        result
    }

    /// `super()`: renders the next definition up the chain, capturing its
    /// output as a safe string.
    fn render_super(&mut self) -> RunResult<Value> {
        let Some(frame) = self.block_frames.last() else {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "super() is only available inside blocks",
            ));
        };
        let name = frame.name.clone();
        let parent_depth = frame.depth + 1;
        let available = self.blocks.get(&name).map_or(0, Vec::len);
        if parent_depth >= available {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("block `{name}` has no parent block for super()"),
            ));
        }
        let (owner, _) = self.blocks.get(&name).expect("checked above")[parent_depth].clone();
        self.out.begin_capture();
        let result = self.render_block(&name, parent_depth, &owner);
        let text = self.out.end_capture();
        result?;
        Ok(Value::safe_string(text))
    }

    // --- includes and imports ---

    fn include_template(&mut self, names: &Value, ignore_missing: bool, with_context: bool) -> RunResult<()> {
        let candidates: Vec<String> = match names {
            Value::Str(s) => vec![s.as_str().to_owned()],
            Value::List(items) => {
                let mut out = Vec::new();
                for item in items.borrow().iter() {
                    let Some(name) = item.as_str() else {
                        return Err(Error::new(
                            ErrorKind::InvalidOperation,
                            format!("include names must be strings, got {}", item.kind_name()),
                        ));
                    };
                    out.push(name.to_owned());
                }
                out
            }
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    format!("include requires a template name, got {}", other.kind_name()),
                ));
            }
        };

        let mut found = None;
        let mut last_missing = None;
        for candidate in &candidates {
            match self.env.get_template(candidate) {
                Ok(template) => {
                    found = Some((candidate.clone(), template));
                    break;
                }
                Err(e) if e.kind() == ErrorKind::TemplateNotFound => last_missing = Some(e),
                Err(e) => return Err(e),
            }
        }
        let Some((name, template)) = found else {
            if ignore_missing {
                return Ok(());
            }
            return Err(last_missing.unwrap_or_else(|| {
                Error::new(ErrorKind::TemplateNotFound, "no templates given to include")
            }));
        };

        self.check_cycle(&name)?;
        self.render_stack.push(name.clone());
        let saved_scopes = if with_context {
            self.scopes.push(Rc::new(RefCell::new(ScopeMap::default())));
            None
        } else {
            Some(std::mem::replace(
                &mut self.scopes,
                vec![Rc::new(RefCell::new(ScopeMap::default()))],
            ))
        };
        let saved_blocks = std::mem::take(&mut self.blocks);
        let saved_frames = std::mem::take(&mut self.block_frames);
        self.autoescape.push(self.env.autoescape_for(&name));

        let result = self.exec_template(&template);

        self.autoescape.pop();
        self.block_frames = saved_frames;
        self.blocks = saved_blocks;
        match saved_scopes {
            Some(saved) => self.scopes = saved,
            None => {
                self.scopes.pop();
            }
        }
        self.render_stack.pop();
        result
    }

    /// Loads a template as a module: runs its root with output discarded and
    /// returns its exported names (top-level bindings not starting with `_`)
    /// as a namespace value.
    fn import_template(&mut self, name: &Value, with_context: bool) -> RunResult<Value> {
        let Some(name) = name.as_str().map(str::to_owned) else {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("import requires a template name, got {}", name.kind_name()),
            ));
        };
        let template = self.env.get_template(&name)?;
        self.check_cycle(&name)?;
        self.render_stack.push(name.clone());

        let module_scope = Rc::new(RefCell::new(ScopeMap::default()));
        let saved_scopes = if with_context {
            self.scopes.push(module_scope.clone());
            None
        } else {
            Some(std::mem::replace(&mut self.scopes, vec![module_scope.clone()]))
        };
        let saved_blocks = std::mem::take(&mut self.blocks);
        let saved_frames = std::mem::take(&mut self.block_frames);
        self.out.begin_discard();

        let result = self.exec_template(&template);

        self.out.end_discard();
        self.block_frames = saved_frames;
        self.blocks = saved_blocks;
        match saved_scopes {
            Some(saved) => self.scopes = saved,
            None => {
                self.scopes.pop();
            }
        }
        self.render_stack.pop();
        result?;

        let mut exports = ValueMap::default();
        for (key, value) in module_scope.borrow().iter() {
            if !key.starts_with('_') {
                exports.insert(key.clone(), value.clone());
            }
        }
        Ok(Value::namespace(exports))
    }

    /// Applies a `for … if` filter chunk to the candidate items.
    fn filter_items(
        &mut self,
        code: &Code,
        template: &Arc<Template>,
        filter_idx: u16,
        items: Vec<Value>,
    ) -> RunResult<Vec<Value>> {
        let chunk = code.children[filter_idx as usize].clone();
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            self.scopes.push(Rc::new(RefCell::new(ScopeMap::default())));
            self.stack.push(item.clone());
            let result = self.eval(&chunk, template);
            self.scopes.pop();
            result?;
            let verdict = self.pop_resolved()?;
            if verdict.is_truthy() {
                kept.push(item);
            }
        }
        Ok(kept)
    }
}

fn undefined_error(message: &str) -> Error {
    Error::new(ErrorKind::UndefinedError, message.to_owned())
}
