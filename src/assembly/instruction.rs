//! Instruction representation for the abstract stack machine.
//!
//! This module defines the instruction set the analysis and rewrite engine operate on. It is a
//! compact subset of CIL: loads and stores of arguments, locals, fields and array elements,
//! calls, object and delegate construction, branches and a handful of arithmetic and comparison
//! operations. Everything the static-state transformation needs to reason about is expressible;
//! everything else is deliberately left out.
//!
//! # Key Components
//!
//! - [`Opcode`] - The operation, with its textual mnemonic
//! - [`Operand`] - Typed operand payload (tokens, indices, branch targets)
//! - [`Instruction`] - Opcode plus operand
//! - [`FlowType`] - Control flow classification
//! - [`StackBehavior`] - Stack effect, see [`crate::metadata::Module::stack_behavior`] for the
//!   call-dependent cases
//!
//! Branch targets are instruction indices into the owning [`crate::assembly::MethodBody`], never
//! byte offsets; the body keeps them consistent across insertions and relocations.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};

use crate::metadata::{Token, TypeSig};

/// Operation performed by an [`Instruction`].
///
/// The `Display` implementation yields the CIL-style mnemonic.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum Opcode {
    /// No operation
    #[strum(serialize = "nop")]
    Nop,
    /// Duplicate the top of the stack
    #[strum(serialize = "dup")]
    Dup,
    /// Discard the top of the stack
    #[strum(serialize = "pop")]
    Pop,
    /// Push a null reference
    #[strum(serialize = "ldnull")]
    LdNull,
    /// Push a 32-bit integer constant
    #[strum(serialize = "ldc.i4")]
    LdcI4,
    /// Push a 64-bit integer constant
    #[strum(serialize = "ldc.i8")]
    LdcI8,
    /// Push a string literal
    #[strum(serialize = "ldstr")]
    LdStr,
    /// Push an argument (`this` is argument 0 of instance methods)
    #[strum(serialize = "ldarg")]
    Ldarg,
    /// Store into an argument slot
    #[strum(serialize = "starg")]
    Starg,
    /// Push a local variable
    #[strum(serialize = "ldloc")]
    Ldloc,
    /// Store into a local variable
    #[strum(serialize = "stloc")]
    Stloc,
    /// Load an instance field of the popped object
    #[strum(serialize = "ldfld")]
    Ldfld,
    /// Store an instance field: pops object and value
    #[strum(serialize = "stfld")]
    Stfld,
    /// Load a static field
    #[strum(serialize = "ldsfld")]
    Ldsfld,
    /// Store a static field
    #[strum(serialize = "stsfld")]
    Stsfld,
    /// Load an array element: pops array and index
    #[strum(serialize = "ldelem")]
    Ldelem,
    /// Store an array element: pops array, index and value
    #[strum(serialize = "stelem")]
    Stelem,
    /// Allocate a zero-based array: pops the length
    #[strum(serialize = "newarr")]
    Newarr,
    /// Push the length of the popped array
    #[strum(serialize = "ldlen")]
    Ldlen,
    /// Direct call
    #[strum(serialize = "call")]
    Call,
    /// Virtual call
    #[strum(serialize = "callvirt")]
    Callvirt,
    /// Allocate an object and run its constructor
    #[strum(serialize = "newobj")]
    Newobj,
    /// Push a method pointer
    #[strum(serialize = "ldftn")]
    Ldftn,
    /// Push a virtual method pointer resolved against the popped object
    #[strum(serialize = "ldvirtftn")]
    Ldvirtftn,
    /// Return from the method
    #[strum(serialize = "ret")]
    Ret,
    /// Unconditional branch
    #[strum(serialize = "br")]
    Br,
    /// Branch if the popped value is non-zero / non-null
    #[strum(serialize = "brtrue")]
    Brtrue,
    /// Branch if the popped value is zero / null
    #[strum(serialize = "brfalse")]
    Brfalse,
    /// Branch if the two popped values are equal
    #[strum(serialize = "beq")]
    Beq,
    /// Branch if the two popped values differ
    #[strum(serialize = "bne.un")]
    Bne,
    /// Branch if less than
    #[strum(serialize = "blt")]
    Blt,
    /// Branch if greater than
    #[strum(serialize = "bgt")]
    Bgt,
    /// Jump table on the popped index
    #[strum(serialize = "switch")]
    Switch,
    /// Integer addition
    #[strum(serialize = "add")]
    Add,
    /// Integer subtraction
    #[strum(serialize = "sub")]
    Sub,
    /// Integer multiplication
    #[strum(serialize = "mul")]
    Mul,
    /// Integer division
    #[strum(serialize = "div")]
    Div,
    /// Integer remainder
    #[strum(serialize = "rem")]
    Rem,
    /// Integer negation
    #[strum(serialize = "neg")]
    Neg,
    /// Bitwise and
    #[strum(serialize = "and")]
    And,
    /// Bitwise or
    #[strum(serialize = "or")]
    Or,
    /// Bitwise xor
    #[strum(serialize = "xor")]
    Xor,
    /// Compare equal
    #[strum(serialize = "ceq")]
    Ceq,
    /// Compare less than
    #[strum(serialize = "clt")]
    Clt,
    /// Compare greater than
    #[strum(serialize = "cgt")]
    Cgt,
    /// Checked reference cast
    #[strum(serialize = "castclass")]
    Castclass,
    /// Type test, pushes the object or null
    #[strum(serialize = "isinst")]
    Isinst,
    /// Throw the popped object
    #[strum(serialize = "throw")]
    Throw,
}

/// Operand payload of an [`Instruction`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    /// No operand
    None,
    /// Integer immediate
    Int(i64),
    /// String literal
    String(String),
    /// Type, field or method token
    Token(Token),
    /// Type signature (array element types)
    Type(TypeSig),
    /// Argument index
    Arg(u16),
    /// Local variable index
    Local(u16),
    /// Branch target (instruction index)
    Target(usize),
    /// Switch table (instruction indices)
    Switch(Vec<usize>),
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch (switch statement)
    Switch,
    /// Exception throwing
    Throw,
}

/// Stack effect of an instruction.
///
/// Describes how an instruction modifies the evaluation stack. Call-like instructions only have
/// a known stack effect once the callee is resolved against the module, see
/// [`crate::metadata::Module::stack_behavior`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Number of items popped from stack
    pub pops: u16,
    /// Number of items pushed to stack
    pub pushes: u16,
}

impl StackBehavior {
    /// Creates a stack behaviour.
    #[must_use]
    pub const fn new(pops: u16, pushes: u16) -> Self {
        Self { pops, pushes }
    }

    /// Net effect on stack depth (pushes - pops)
    #[must_use]
    pub fn net_effect(&self) -> i32 {
        i32::from(self.pushes) - i32::from(self.pops)
    }
}

/// A single instruction of a method body.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    /// The operation
    pub opcode: Opcode,
    /// The operand data for this instruction
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction from its parts.
    #[must_use]
    pub const fn new(opcode: Opcode, operand: Operand) -> Self {
        Self { opcode, operand }
    }

    /// Creates an operand-less instruction.
    #[must_use]
    pub const fn simple(opcode: Opcode) -> Self {
        Self::new(opcode, Operand::None)
    }

    /// `ldarg index`
    #[must_use]
    pub const fn ldarg(index: u16) -> Self {
        Self::new(Opcode::Ldarg, Operand::Arg(index))
    }

    /// `starg index`
    #[must_use]
    pub const fn starg(index: u16) -> Self {
        Self::new(Opcode::Starg, Operand::Arg(index))
    }

    /// `ldloc index`
    #[must_use]
    pub const fn ldloc(index: u16) -> Self {
        Self::new(Opcode::Ldloc, Operand::Local(index))
    }

    /// `stloc index`
    #[must_use]
    pub const fn stloc(index: u16) -> Self {
        Self::new(Opcode::Stloc, Operand::Local(index))
    }

    /// `ldc.i4 value`
    #[must_use]
    pub const fn ldc_i4(value: i32) -> Self {
        Self::new(Opcode::LdcI4, Operand::Int(value as i64))
    }

    /// An instruction whose operand is a token (`ldfld`, `call`, `newobj`, ...).
    #[must_use]
    pub const fn with_token(opcode: Opcode, token: Token) -> Self {
        Self::new(opcode, Operand::Token(token))
    }

    /// A branch instruction to the given instruction index.
    #[must_use]
    pub const fn branch(opcode: Opcode, target: usize) -> Self {
        Self::new(opcode, Operand::Target(target))
    }

    /// Returns the token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Returns the argument index operand of `ldarg` / `starg`.
    #[must_use]
    pub fn arg_index(&self) -> Option<u16> {
        match self.operand {
            Operand::Arg(index) => Some(index),
            _ => None,
        }
    }

    /// Returns the local index operand of `ldloc` / `stloc`.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        match self.operand {
            Operand::Local(index) => Some(index),
            _ => None,
        }
    }

    /// Returns the integer immediate, if any.
    #[must_use]
    pub fn int_operand(&self) -> Option<i64> {
        match self.operand {
            Operand::Int(value) => Some(value),
            _ => None,
        }
    }

    /// Control flow classification of this instruction.
    #[must_use]
    pub const fn flow_type(&self) -> FlowType {
        match self.opcode {
            Opcode::Br => FlowType::UnconditionalBranch,
            Opcode::Brtrue
            | Opcode::Brfalse
            | Opcode::Beq
            | Opcode::Bne
            | Opcode::Blt
            | Opcode::Bgt => FlowType::ConditionalBranch,
            Opcode::Switch => FlowType::Switch,
            Opcode::Ret => FlowType::Return,
            Opcode::Throw => FlowType::Throw,
            Opcode::Call | Opcode::Callvirt | Opcode::Newobj => FlowType::Call,
            _ => FlowType::Sequential,
        }
    }

    /// Check if this instruction is a branch instruction.
    #[must_use]
    pub const fn is_branch(&self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Switch
        )
    }

    /// Returns `true` if execution never falls through to the next instruction.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::UnconditionalBranch | FlowType::Return | FlowType::Throw
        )
    }

    /// Returns `true` for `call`, `callvirt` and `newobj`.
    #[must_use]
    pub const fn is_call(&self) -> bool {
        matches!(self.opcode, Opcode::Call | Opcode::Callvirt | Opcode::Newobj)
    }

    /// Branch targets of this instruction (instruction indices).
    #[must_use]
    pub fn targets(&self) -> Vec<usize> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Applies `remap` to every branch target of this instruction.
    pub fn remap_targets(&mut self, mut remap: impl FnMut(usize) -> usize) {
        match &mut self.operand {
            Operand::Target(target) => *target = remap(*target),
            Operand::Switch(targets) => {
                for target in targets.iter_mut() {
                    *target = remap(*target);
                }
            }
            _ => {}
        }
    }

    /// Stack behaviour for every opcode whose effect does not depend on a callee.
    ///
    /// Returns `None` for `call`, `callvirt`, `newobj` and `ret`; use
    /// [`crate::metadata::Module::stack_behavior`] for those.
    #[must_use]
    pub const fn fixed_stack_behavior(&self) -> Option<StackBehavior> {
        let (pops, pushes) = match self.opcode {
            Opcode::Nop | Opcode::Br => (0, 0),
            Opcode::Dup => (1, 2),
            Opcode::Pop
            | Opcode::Starg
            | Opcode::Stloc
            | Opcode::Stsfld
            | Opcode::Brtrue
            | Opcode::Brfalse
            | Opcode::Switch
            | Opcode::Throw => (1, 0),
            Opcode::LdNull
            | Opcode::LdcI4
            | Opcode::LdcI8
            | Opcode::LdStr
            | Opcode::Ldarg
            | Opcode::Ldloc
            | Opcode::Ldsfld
            | Opcode::Ldftn => (0, 1),
            Opcode::Ldfld
            | Opcode::Newarr
            | Opcode::Ldlen
            | Opcode::Ldvirtftn
            | Opcode::Neg
            | Opcode::Castclass
            | Opcode::Isinst => (1, 1),
            Opcode::Stfld | Opcode::Beq | Opcode::Bne | Opcode::Blt | Opcode::Bgt => (2, 0),
            Opcode::Ldelem
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Rem
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Ceq
            | Opcode::Clt
            | Opcode::Cgt => (2, 1),
            Opcode::Stelem => (3, 0),
            Opcode::Call | Opcode::Callvirt | Opcode::Newobj | Opcode::Ret => return None,
        };
        Some(StackBehavior::new(pops, pushes))
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Int(value) => write!(f, " {value}"),
            Operand::String(value) => write!(f, " \"{value}\""),
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Type(sig) => write!(f, " {sig}"),
            Operand::Arg(index) | Operand::Local(index) => write!(f, " {index}"),
            Operand::Target(target) => write!(f, " IL_{target:04}"),
            Operand::Switch(targets) => {
                write!(f, " (")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "IL_{target:04}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_mnemonics() {
        assert_eq!(Opcode::LdcI4.to_string(), "ldc.i4");
        assert_eq!(Opcode::Callvirt.to_string(), "callvirt");
        let name: &'static str = Opcode::Stsfld.into();
        assert_eq!(name, "stsfld");
    }

    #[test]
    fn test_flow_types() {
        assert!(Instruction::branch(Opcode::Br, 3).is_terminal());
        assert!(Instruction::branch(Opcode::Brtrue, 3).is_branch());
        assert!(!Instruction::branch(Opcode::Brtrue, 3).is_terminal());
        assert!(Instruction::simple(Opcode::Ret).is_terminal());
        assert!(Instruction::with_token(Opcode::Newobj, Token(0x0600_0001)).is_call());
    }

    #[test]
    fn test_fixed_stack_behavior_coverage() {
        for opcode in Opcode::iter() {
            let instr = Instruction::simple(opcode);
            let dynamic = matches!(
                opcode,
                Opcode::Call | Opcode::Callvirt | Opcode::Newobj | Opcode::Ret
            );
            assert_eq!(instr.fixed_stack_behavior().is_none(), dynamic, "{opcode}");
        }
        let stelem = Instruction::simple(Opcode::Stelem).fixed_stack_behavior().unwrap();
        assert_eq!(stelem.net_effect(), -3);
    }

    #[test]
    fn test_remap_targets() {
        let mut switch = Instruction::new(Opcode::Switch, Operand::Switch(vec![1, 4, 9]));
        switch.remap_targets(|t| if t >= 4 { t + 2 } else { t });
        assert_eq!(switch.targets(), vec![1, 6, 11]);
        assert_eq!(switch.to_string(), "switch (IL_0001, IL_0006, IL_0011)");
    }
}
