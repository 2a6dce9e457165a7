//! Bytecode pipeline: instruction set, code objects, builder, compiler, and
//! the virtual machine that executes compiled templates.

pub(crate) use code::Code;
pub(crate) use compiler::compile_template;
pub(crate) use op::Instr;

mod builder;
mod code;
mod compiler;
mod op;
pub(crate) mod vm;
