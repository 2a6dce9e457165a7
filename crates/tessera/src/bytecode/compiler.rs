//! AST to bytecode compiler.
//!
//! Lowers the statement tree into linear instruction chunks: one root chunk
//! per template, one chunk per block definition, one per macro, and child
//! chunks for inline `for … if` filter conditions. Jump targets are patched
//! through [`CodeBuilder`] labels.

use std::sync::Arc;

use ahash::AHashMap;

use super::{builder::CodeBuilder, code::Const, op::Instr};
use crate::{
    error::{Error, ErrorKind, RunResult},
    expressions::{CallArgs, Expr, ExprLoc, Literal, MacroParamDecl, SetTarget, Stmt, StmtNode},
    template::{BlockDef, MacroDef, MacroParam, Template},
};

pub(crate) fn compile_template(stmts: &[Stmt], name: &str, filename: Option<String>) -> RunResult<Template> {
    let mut parts = TemplateParts::default();
    let mut compiler = FnCompiler::new(&mut parts);
    compiler
        .compile_stmts(stmts)
        .map_err(|e| e.with_template(name))?;
    compiler.builder.emit(Instr::Return);
    let root = compiler.builder.build();
    let has_extends = stmts.iter().any(|s| matches!(s.node, StmtNode::Extends(_)));
    Ok(Template {
        name: name.to_owned(),
        filename,
        root,
        blocks: parts.blocks,
        macros: parts.macros,
        has_extends,
    })
}

/// Block and macro tables shared by every chunk compiled for one template.
#[derive(Default)]
struct TemplateParts {
    blocks: AHashMap<String, Arc<BlockDef>>,
    macros: Vec<Arc<MacroDef>>,
}

/// Tracks one enclosing `for` body during compilation.
struct LoopRecord {
    /// Scope depth at the loop body, used to unwind `with` scopes on
    /// break/continue.
    scope_depth: u8,
}

/// Compiles one code chunk (template root, block body, or macro body).
struct FnCompiler<'p> {
    builder: CodeBuilder,
    parts: &'p mut TemplateParts,
    loops: Vec<LoopRecord>,
    scope_depth: u8,
}

impl<'p> FnCompiler<'p> {
    fn new(parts: &'p mut TemplateParts) -> Self {
        Self {
            builder: CodeBuilder::new(),
            parts,
            loops: Vec::new(),
            scope_depth: 0,
        }
    }

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> RunResult<()> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> RunResult<()> {
        self.builder.set_location(stmt.loc);
        match &stmt.node {
            StmtNode::Text(text) => {
                let idx = self.builder.add_const(Const::Str(text.clone()));
                self.builder.emit(Instr::EmitText(idx));
            }
            StmtNode::Emit(expr) => {
                self.compile_expr(expr)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::EmitValue);
            }
            StmtNode::If { arms, else_body } => self.compile_if(arms, else_body)?,
            StmtNode::For {
                targets,
                iter,
                cond,
                body,
                else_body,
            } => self.compile_for(targets, iter, cond.as_ref(), body, else_body)?,
            StmtNode::Set { target, value } => {
                if let SetTarget::Attr { name, .. } = target {
                    let idx = self.builder.add_name(name);
                    self.builder.emit(Instr::LoadName(idx));
                }
                self.compile_expr(value)?;
                self.compile_store_target(target, stmt)?;
            }
            StmtNode::SetBlock { target, body } => {
                if let SetTarget::Attr { name, .. } = target {
                    let idx = self.builder.add_name(name);
                    self.builder.emit(Instr::LoadName(idx));
                }
                self.builder.emit(Instr::BeginCapture);
                self.compile_barrier_body(body)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::EndCaptureValue);
                self.compile_store_target(target, stmt)?;
            }
            StmtNode::With { bindings, body } => {
                self.builder.emit(Instr::PushScope);
                self.scope_depth += 1;
                for (name, value) in bindings {
                    self.compile_expr(value)?;
                    let idx = self.builder.add_name(name);
                    self.builder.emit(Instr::StoreName(idx));
                }
                self.compile_stmts(body)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::PopScope);
                self.scope_depth -= 1;
            }
            StmtNode::Macro(decl) => {
                let idx = self.compile_macro_def(&decl.name, &decl.params, &decl.body)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::MakeMacro(idx));
                let name_idx = self.builder.add_name(&decl.name);
                self.builder.emit(Instr::StoreName(name_idx));
            }
            StmtNode::CallBlock { params, call, body } => {
                let idx = self.compile_macro_def("caller", params, body)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::MakeMacro(idx));
                let Expr::Call { callee, args } = &call.expr else {
                    // the parser only produces CallBlock around call expressions
                    unreachable!("call block without call expression");
                };
                self.compile_expr(callee)?;
                let (argc, has_kwargs) = self.compile_call_args(args)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::Call {
                    argc,
                    has_kwargs,
                    has_caller: true,
                });
                self.builder.emit(Instr::EmitValue);
            }
            StmtNode::FilterBlock { filters, body } => {
                self.builder.emit(Instr::BeginCapture);
                self.compile_barrier_body(body)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::EndCaptureValue);
                for (name, args, loc) in filters {
                    let (argc, has_kwargs) = self.compile_call_args(args)?;
                    self.builder.set_location(*loc);
                    let name_idx = self.builder.add_name(name);
                    self.builder.emit(Instr::ApplyFilter {
                        name: name_idx,
                        argc,
                        has_kwargs,
                    });
                }
                self.builder.emit(Instr::EmitValue);
            }
            StmtNode::Include {
                expr,
                ignore_missing,
                with_context,
            } => {
                self.compile_expr(expr)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::Include {
                    ignore_missing: *ignore_missing,
                    with_context: *with_context,
                });
            }
            StmtNode::Import {
                template,
                alias,
                with_context,
            } => {
                self.compile_expr(template)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::Import {
                    with_context: *with_context,
                });
                let idx = self.builder.add_name(alias);
                self.builder.emit(Instr::StoreName(idx));
            }
            StmtNode::FromImport {
                template,
                names,
                with_context,
            } => {
                self.compile_expr(template)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::Import {
                    with_context: *with_context,
                });
                for (name, alias) in names {
                    self.builder.emit(Instr::Dup);
                    let name_idx = self.builder.add_name(name);
                    self.builder.emit(Instr::LoadExport(name_idx));
                    let alias_idx = self.builder.add_name(alias.as_deref().unwrap_or(name));
                    self.builder.emit(Instr::StoreName(alias_idx));
                }
                self.builder.emit(Instr::Pop);
            }
            StmtNode::Extends(expr) => {
                self.compile_expr(expr)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::Extends);
            }
            StmtNode::Block(decl) => {
                let mut block_compiler = FnCompiler::new(&mut *self.parts);
                block_compiler.compile_stmts(&decl.body)?;
                block_compiler.builder.emit(Instr::Return);
                let code = block_compiler.builder.build();
                self.parts.blocks.insert(
                    decl.name.clone(),
                    Arc::new(BlockDef {
                        name: decl.name.clone(),
                        code,
                        required: decl.required,
                        scoped: decl.scoped,
                    }),
                );
                self.builder.set_location(stmt.loc);
                let idx = self.builder.add_name(&decl.name);
                self.builder.emit(Instr::CallBlock(idx));
            }
            StmtNode::Autoescape { enabled, body } => {
                self.compile_expr(enabled)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::PushAutoescape);
                self.compile_stmts(body)?;
                self.builder.set_location(stmt.loc);
                self.builder.emit(Instr::PopAutoescape);
            }
            StmtNode::Do(expr) => {
                self.compile_expr(expr)?;
                self.builder.emit(Instr::Pop);
            }
            StmtNode::Break => {
                let Some(record) = self.loops.last() else {
                    return Err(Error::new_at(ErrorKind::OutsideLoop, "`break` outside of a loop", stmt.loc));
                };
                let extra_scopes = self.scope_depth - record.scope_depth;
                self.builder.emit(Instr::Break { extra_scopes });
            }
            StmtNode::Continue => {
                let Some(record) = self.loops.last() else {
                    return Err(Error::new_at(
                        ErrorKind::OutsideLoop,
                        "`continue` outside of a loop",
                        stmt.loc,
                    ));
                };
                let extra_scopes = self.scope_depth - record.scope_depth;
                self.builder.emit(Instr::Continue { extra_scopes });
            }
        }
        Ok(())
    }

    /// Compiles a captured body (set block, filter block). Captures cannot be
    /// jumped out of, so enclosing loops are hidden from their bodies.
    fn compile_barrier_body(&mut self, body: &[Stmt]) -> RunResult<()> {
        let saved = std::mem::take(&mut self.loops);
        let result = self.compile_stmts(body);
        self.loops = saved;
        result
    }

    fn compile_store_target(&mut self, target: &SetTarget, stmt: &Stmt) -> RunResult<()> {
        self.builder.set_location(stmt.loc);
        match target {
            SetTarget::Name(name) => {
                let idx = self.builder.add_name(name);
                self.builder.emit(Instr::StoreName(idx));
            }
            SetTarget::Attr { attr, .. } => {
                let idx = self.builder.add_name(attr);
                self.builder.emit(Instr::StoreAttr(idx));
            }
        }
        Ok(())
    }

    fn compile_if(&mut self, arms: &[(ExprLoc, Vec<Stmt>)], else_body: &[Stmt]) -> RunResult<()> {
        let mut end_jumps = Vec::new();
        for (cond, body) in arms {
            self.compile_expr(cond)?;
            let next_arm = self.builder.emit_jump(Instr::JumpIfFalse(0));
            self.compile_stmts(body)?;
            end_jumps.push(self.builder.emit_jump(Instr::Jump(0)));
            self.builder.patch_jump(next_arm);
        }
        self.compile_stmts(else_body)?;
        for jump in end_jumps {
            self.builder.patch_jump(jump);
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        targets: &[String],
        iter: &ExprLoc,
        cond: Option<&ExprLoc>,
        body: &[Stmt],
        else_body: &[Stmt],
    ) -> RunResult<()> {
        self.compile_expr(iter)?;
        let filter = match cond {
            Some(cond) => Some(self.compile_filter_chunk(targets, cond)?),
            None => None,
        };
        let start = self.builder.emit_jump(Instr::ForStart { filter, end: 0 });
        let next = self.builder.emit_jump(Instr::ForNext { end: 0 });
        self.emit_target_stores(targets);
        self.loops.push(LoopRecord {
            scope_depth: self.scope_depth,
        });
        self.compile_stmts(body)?;
        self.loops.pop();
        // jump back to the ForNext instruction
        self.builder.emit(Instr::Jump(next.index()));
        self.builder.patch_jump(start);
        self.builder.patch_jump(next);
        let has_else = !else_body.is_empty();
        self.builder.emit(Instr::ForEnd {
            push_did_iterate: has_else,
        });
        if has_else {
            let skip = self.builder.emit_jump(Instr::JumpIfTrue(0));
            self.compile_stmts(else_body)?;
            self.builder.patch_jump(skip);
        }
        Ok(())
    }

    /// Compiles the inline `if` condition of a `for` into a child chunk that
    /// binds the loop targets from the candidate item and yields the verdict.
    fn compile_filter_chunk(&mut self, targets: &[String], cond: &ExprLoc) -> RunResult<u16> {
        let mut chunk = FnCompiler::new(&mut *self.parts);
        chunk.emit_target_stores(targets);
        chunk.compile_expr(cond)?;
        chunk.builder.emit(Instr::Return);
        let code = chunk.builder.build();
        Ok(self.builder.add_child(code))
    }

    fn emit_target_stores(&mut self, targets: &[String]) {
        if targets.len() == 1 {
            let idx = self.builder.add_name(&targets[0]);
            self.builder.emit(Instr::StoreName(idx));
        } else {
            self.builder
                .emit(Instr::UnpackSequence(u8::try_from(targets.len()).expect("too many loop targets")));
            for target in targets {
                let idx = self.builder.add_name(target);
                self.builder.emit(Instr::StoreName(idx));
            }
        }
    }

    fn compile_macro_def(&mut self, name: &str, params: &[MacroParamDecl], body: &[Stmt]) -> RunResult<u16> {
        let code = {
            let mut mc = FnCompiler::new(&mut *self.parts);
            for param in params {
                if let Some(default) = &param.default {
                    let name_idx = mc.builder.add_name(&param.name);
                    let bound = mc.builder.emit_jump(Instr::JumpIfBound {
                        name: name_idx,
                        target: 0,
                    });
                    mc.compile_expr(default)?;
                    mc.builder.emit(Instr::StoreName(name_idx));
                    mc.builder.patch_jump(bound);
                }
            }
            mc.compile_stmts(body)?;
            mc.builder.emit(Instr::Return);
            mc.builder.build()
        };
        let def = MacroDef {
            name: name.to_owned(),
            params: params
                .iter()
                .map(|p| MacroParam {
                    name: p.name.clone(),
                    has_default: p.default.is_some(),
                })
                .collect(),
            code,
        };
        let idx = u16::try_from(self.parts.macros.len()).expect("macro table exceeds u16");
        self.parts.macros.push(Arc::new(def));
        Ok(idx)
    }

    /// Compiles positional arguments, then the kwargs dict when present.
    fn compile_call_args(&mut self, args: &CallArgs) -> RunResult<(u8, bool)> {
        for arg in &args.pos {
            self.compile_expr(arg)?;
        }
        let has_kwargs = !args.kwargs.is_empty();
        if has_kwargs {
            for (name, value) in &args.kwargs {
                let key = self.builder.add_const(Const::Str(name.clone()));
                self.builder.emit(Instr::LoadConst(key));
                self.compile_expr(value)?;
            }
            self.builder
                .emit(Instr::BuildDict(u16::try_from(args.kwargs.len()).expect("too many kwargs")));
        }
        Ok((u8::try_from(args.pos.len()).expect("too many arguments"), has_kwargs))
    }

    fn compile_expr(&mut self, expr: &ExprLoc) -> RunResult<()> {
        self.builder.set_location(expr.loc);
        match &expr.expr {
            Expr::Literal(literal) => {
                let constant = match literal {
                    Literal::None => Const::None,
                    Literal::Bool(v) => Const::Bool(*v),
                    Literal::Int(v) => Const::Int(*v),
                    Literal::Float(v) => Const::Float(*v),
                    Literal::Str(s) => Const::Str(s.clone()),
                };
                let idx = self.builder.add_const(constant);
                self.builder.emit(Instr::LoadConst(idx));
            }
            Expr::Name(name) => {
                let idx = self.builder.add_name(name);
                self.builder.emit(Instr::LoadName(idx));
            }
            Expr::List(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.builder.set_location(expr.loc);
                self.builder
                    .emit(Instr::BuildList(u16::try_from(items.len()).expect("list literal too long")));
            }
            Expr::Dict(pairs) => {
                for (key, value) in pairs {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.builder.set_location(expr.loc);
                self.builder
                    .emit(Instr::BuildDict(u16::try_from(pairs.len()).expect("dict literal too long")));
            }
            Expr::BinOp { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.builder.set_location(expr.loc);
                self.builder.emit(Instr::BinOp(*op));
            }
            Expr::Compare { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.builder.set_location(expr.loc);
                self.builder.emit(Instr::Compare(*op));
            }
            Expr::And { left, right } => {
                self.compile_expr(left)?;
                let short = self.builder.emit_jump(Instr::JumpIfFalseOrPop(0));
                self.compile_expr(right)?;
                self.builder.patch_jump(short);
            }
            Expr::Or { left, right } => {
                self.compile_expr(left)?;
                let short = self.builder.emit_jump(Instr::JumpIfTrueOrPop(0));
                self.compile_expr(right)?;
                self.builder.patch_jump(short);
            }
            Expr::Not(inner) => {
                self.compile_expr(inner)?;
                self.builder.set_location(expr.loc);
                self.builder.emit(Instr::Not);
            }
            Expr::Neg(inner) => {
                self.compile_expr(inner)?;
                self.builder.set_location(expr.loc);
                self.builder.emit(Instr::Neg);
            }
            Expr::CondExpr { cond, then, otherwise } => {
                self.compile_expr(cond)?;
                let alt = self.builder.emit_jump(Instr::JumpIfFalse(0));
                self.compile_expr(then)?;
                let end = self.builder.emit_jump(Instr::Jump(0));
                self.builder.patch_jump(alt);
                match otherwise {
                    Some(otherwise) => self.compile_expr(otherwise)?,
                    None => {
                        self.builder.emit(Instr::LoadUndefined);
                    }
                }
                self.builder.patch_jump(end);
            }
            Expr::Attr { obj, name } => {
                self.compile_expr(obj)?;
                self.builder.set_location(expr.loc);
                let idx = self.builder.add_name(name);
                self.builder.emit(Instr::LoadAttr(idx));
            }
            Expr::Subscript { obj, index } => {
                self.compile_expr(obj)?;
                self.compile_expr(index)?;
                self.builder.set_location(expr.loc);
                self.builder.emit(Instr::LoadSubscript);
            }
            Expr::Slice { obj, start, stop, step } => {
                self.compile_expr(obj)?;
                for part in [start, stop, step].into_iter().flatten() {
                    self.compile_expr(part)?;
                }
                self.builder.set_location(expr.loc);
                self.builder.emit(Instr::Slice {
                    has_start: start.is_some(),
                    has_stop: stop.is_some(),
                    has_step: step.is_some(),
                });
            }
            Expr::Call { callee, args } => {
                self.compile_expr(callee)?;
                let (argc, has_kwargs) = self.compile_call_args(args)?;
                self.builder.set_location(expr.loc);
                self.builder.emit(Instr::Call {
                    argc,
                    has_kwargs,
                    has_caller: false,
                });
            }
            Expr::Filter { name, value, args } => {
                self.compile_expr(value)?;
                let (argc, has_kwargs) = self.compile_call_args(args)?;
                self.builder.set_location(expr.loc);
                let name_idx = self.builder.add_name(name);
                self.builder.emit(Instr::ApplyFilter {
                    name: name_idx,
                    argc,
                    has_kwargs,
                });
            }
            Expr::Test {
                name,
                value,
                args,
                negated,
            } => {
                self.compile_expr(value)?;
                let (argc, has_kwargs) = self.compile_call_args(args)?;
                self.builder.set_location(expr.loc);
                let name_idx = self.builder.add_name(name);
                self.builder.emit(Instr::PerformTest {
                    name: name_idx,
                    argc,
                    has_kwargs,
                    negated: *negated,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        environment::SyntaxConfig,
        lexer::{LexOptions, lex},
        parse::parse,
    };

    fn compile_source(source: &str) -> RunResult<Template> {
        let options = LexOptions {
            syntax: SyntaxConfig::default(),
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: true,
            line_statement_prefix: None,
        };
        let stmts = parse(lex(source, "test", &options)?, "test")?;
        compile_template(&stmts, "test", None)
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let err = compile_source("{% break %}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutsideLoop);
    }

    #[test]
    fn break_inside_set_block_is_rejected() {
        let err = compile_source("{% for x in xs %}{% set y %}{% break %}{% endset %}{% endfor %}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutsideLoop);
    }

    #[test]
    fn blocks_are_collected_into_the_template() {
        let tmpl = compile_source("a{% block b %}inner{% endblock %}c").unwrap();
        assert!(tmpl.blocks.contains_key("b"));
        assert!(!tmpl.has_extends);
        assert!(tmpl.root.instrs.contains(&Instr::CallBlock(0)) || !tmpl.root.names.is_empty());
    }

    #[test]
    fn extends_is_statically_known() {
        let tmpl = compile_source("{% extends 'base' %}").unwrap();
        assert!(tmpl.has_extends);
    }

    #[test]
    fn for_loop_shape() {
        let tmpl = compile_source("{% for i in xs %}{{ i }}{% endfor %}").unwrap();
        let has_start = tmpl
            .root
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::ForStart { .. }));
        let has_next = tmpl.root.instrs.iter().any(|i| matches!(i, Instr::ForNext { .. }));
        assert!(has_start && has_next);
    }

    #[test]
    fn macro_defaults_compile_into_prologue() {
        let tmpl = compile_source("{% macro m(a, b=1) %}{{ a }}{{ b }}{% endmacro %}").unwrap();
        assert_eq!(tmpl.macros.len(), 1);
        let def = &tmpl.macros[0];
        assert_eq!(def.params.len(), 2);
        assert!(def.params[1].has_default);
        assert!(
            def.code
                .instrs
                .iter()
                .any(|i| matches!(i, Instr::JumpIfBound { .. }))
        );
    }
}
