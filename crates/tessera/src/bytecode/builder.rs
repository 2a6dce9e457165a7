//! Builder for emitting instructions during compilation.
//!
//! `CodeBuilder` handles constant/name pooling, forward jumps with patching,
//! and per-instruction source locations for runtime error reporting.

use std::sync::Arc;

use ahash::AHashMap;

use super::{
    code::{Code, Const},
    op::Instr,
};
use crate::error::SourceLoc;

/// A forward-jump placeholder returned by [`CodeBuilder::emit_jump`]; resolve
/// it with [`CodeBuilder::patch_jump`] once the target is known.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub(crate) struct JumpLabel(usize);

impl JumpLabel {
    /// The instruction index this label was emitted at.
    pub fn index(self) -> u32 {
        u32::try_from(self.0).expect("code chunk exceeds u32 instructions")
    }
}

#[derive(Debug, Default)]
pub(crate) struct CodeBuilder {
    instrs: Vec<Instr>,
    spans: Vec<SourceLoc>,
    consts: Vec<Const>,
    /// Dedup index for string constants; other constants are cheap enough to repeat.
    str_consts: AHashMap<String, u16>,
    names: Vec<String>,
    name_index: AHashMap<String, u16>,
    children: Vec<Arc<Code>>,
    current_loc: SourceLoc,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source location recorded for subsequently emitted instructions.
    pub fn set_location(&mut self, loc: SourceLoc) {
        self.current_loc = loc;
    }

    /// Emits an instruction, returning its index.
    pub fn emit(&mut self, instr: Instr) -> usize {
        self.instrs.push(instr);
        self.spans.push(self.current_loc);
        self.instrs.len() - 1
    }

    /// Emits a jump-family instruction with a placeholder target.
    pub fn emit_jump(&mut self, instr: Instr) -> JumpLabel {
        JumpLabel(self.emit(instr))
    }

    /// Points a previously emitted jump at the current offset.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.current_offset();
        self.patch_jump_to(label, target);
    }

    /// Points a previously emitted jump at an explicit offset.
    pub fn patch_jump_to(&mut self, label: JumpLabel, target: u32) {
        match &mut self.instrs[label.0] {
            Instr::Jump(t)
            | Instr::JumpIfFalse(t)
            | Instr::JumpIfTrue(t)
            | Instr::JumpIfFalseOrPop(t)
            | Instr::JumpIfTrueOrPop(t)
            | Instr::JumpIfBound { target: t, .. }
            | Instr::ForStart { end: t, .. }
            | Instr::ForNext { end: t } => *t = target,
            other => panic!("patch_jump on non-jump instruction {other:?}"),
        }
    }

    pub fn current_offset(&self) -> u32 {
        u32::try_from(self.instrs.len()).expect("code chunk exceeds u32 instructions")
    }

    pub fn add_const(&mut self, value: Const) -> u16 {
        if let Const::Str(s) = &value
            && let Some(&idx) = self.str_consts.get(s)
        {
            return idx;
        }
        let idx = u16::try_from(self.consts.len()).expect("constant pool exceeds u16");
        if let Const::Str(s) = &value {
            self.str_consts.insert(s.clone(), idx);
        }
        self.consts.push(value);
        idx
    }

    pub fn add_name(&mut self, name: &str) -> u16 {
        if let Some(&idx) = self.name_index.get(name) {
            return idx;
        }
        let idx = u16::try_from(self.names.len()).expect("name pool exceeds u16");
        self.name_index.insert(name.to_owned(), idx);
        self.names.push(name.to_owned());
        idx
    }

    pub fn add_child(&mut self, code: Code) -> u16 {
        let idx = u16::try_from(self.children.len()).expect("child pool exceeds u16");
        self.children.push(Arc::new(code));
        idx
    }

    pub fn build(self) -> Code {
        Code {
            instrs: self.instrs,
            spans: self.spans,
            consts: self.consts,
            names: self.names,
            children: self.children,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_tracks_locations() {
        let mut builder = CodeBuilder::new();
        builder.set_location(SourceLoc::new(2, 7));
        builder.emit(Instr::EmitValue);
        let code = builder.build();
        assert_eq!(code.span_at(0), SourceLoc::new(2, 7));
    }

    #[test]
    fn forward_jump_patches_to_current_offset() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Instr::JumpIfFalse(0));
        builder.emit(Instr::Pop);
        builder.emit(Instr::Pop);
        builder.patch_jump(jump);
        let code = builder.build();
        assert_eq!(code.instrs[0], Instr::JumpIfFalse(3));
    }

    #[test]
    fn string_constants_dedup() {
        let mut builder = CodeBuilder::new();
        let a = builder.add_const(Const::Str("x".to_owned()));
        let b = builder.add_const(Const::Str("x".to_owned()));
        assert_eq!(a, b);
        let c = builder.add_name("n");
        let d = builder.add_name("n");
        assert_eq!(c, d);
    }
}
