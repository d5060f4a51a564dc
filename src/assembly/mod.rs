//! Instruction set and method body editing.
//!
//! - [`Instruction`], [`Opcode`], [`Operand`] - the abstract stack machine's instructions
//! - [`MethodBody`] - an editable instruction list that keeps branch targets consistent
//! - [`InstructionAssembler`] - label-based construction of instruction lists

mod assembler;
mod body;
mod instruction;

pub use assembler::InstructionAssembler;
pub use body::{BranchFixup, MethodBody};
pub use instruction::{FlowType, Instruction, Opcode, Operand, StackBehavior};
