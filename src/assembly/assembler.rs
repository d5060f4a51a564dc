//! Fluent, label-based instruction assembler.
//!
//! [`InstructionAssembler`] builds instruction lists with symbolic branch labels that are
//! resolved to instruction indices by [`InstructionAssembler::finalize`]. It backs
//! [`crate::metadata::MethodBuilder`] and is the usual way tests and synthesized methods produce
//! code.
//!
//! # Examples
//!
//! ```rust
//! use ctxweave::assembly::InstructionAssembler;
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?
//!     .brfalse("zero")?
//!     .ldc_i4(1)?
//!     .ret()?
//!     .label("zero")?
//!     .ldc_i4(0)?
//!     .ret()?;
//! let instructions = asm.finalize()?;
//! assert_eq!(instructions[1].targets(), vec![4]);
//! # Ok::<(), ctxweave::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::{Instruction, Opcode, Operand},
    metadata::{Token, TypeSig},
    Result,
};

/// Unresolved label reference recorded by a branch or switch.
#[derive(Debug, Clone)]
struct LabelFixup {
    /// Index of the branch instruction
    instruction: usize,
    /// Target label names, one per branch target
    labels: Vec<String>,
}

/// Builder for instruction sequences with symbolic labels.
#[derive(Debug, Default)]
pub struct InstructionAssembler {
    instructions: Vec<Instruction>,
    labels: HashMap<String, usize>,
    fixups: Vec<LabelFixup>,
}

macro_rules! simple_ops {
    ($($(#[$doc:meta])* $name:ident => $opcode:ident;)*) => {
        $(
            $(#[$doc])*
            ///
            /// # Errors
            /// Never fails; returns `Result` for chaining consistency.
            pub fn $name(&mut self) -> Result<&mut Self> {
                self.emit(Instruction::simple(Opcode::$opcode))
            }
        )*
    };
}

macro_rules! token_ops {
    ($($(#[$doc:meta])* $name:ident => $opcode:ident;)*) => {
        $(
            $(#[$doc])*
            ///
            /// # Errors
            /// Never fails; returns `Result` for chaining consistency.
            pub fn $name(&mut self, token: Token) -> Result<&mut Self> {
                self.emit(Instruction::with_token(Opcode::$opcode, token))
            }
        )*
    };
}

macro_rules! branch_ops {
    ($($(#[$doc:meta])* $name:ident => $opcode:ident;)*) => {
        $(
            $(#[$doc])*
            ///
            /// # Errors
            /// Never fails; unresolved labels are reported by `finalize`.
            pub fn $name(&mut self, label: &str) -> Result<&mut Self> {
                self.emit_branch(Opcode::$opcode, label)
            }
        )*
    };
}

impl InstructionAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fully formed instruction. Branch targets in it are taken as absolute indices.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining consistency.
    pub fn emit(&mut self, instruction: Instruction) -> Result<&mut Self> {
        self.instructions.push(instruction);
        Ok(self)
    }

    /// Defines `name` at the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the label is already defined.
    pub fn label(&mut self, name: &str) -> Result<&mut Self> {
        if self.labels.contains_key(name) {
            return Err(malformed_error!("Duplicate label '{}'", name));
        }
        self.labels.insert(name.to_string(), self.instructions.len());
        Ok(self)
    }

    /// Emits a branch to `label`, resolved on finalization.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `opcode` is not a single-target branch.
    pub fn emit_branch(&mut self, opcode: Opcode, label: &str) -> Result<&mut Self> {
        let instruction = Instruction::branch(opcode, usize::MAX);
        if !instruction.is_branch() || opcode == Opcode::Switch {
            return Err(malformed_error!("'{}' is not a branch instruction", opcode));
        }
        self.fixups.push(LabelFixup {
            instruction: self.instructions.len(),
            labels: vec![label.to_string()],
        });
        self.emit(instruction)
    }

    /// Emits a `switch` over `labels`.
    ///
    /// # Errors
    /// Never fails; unresolved labels are reported by `finalize`.
    pub fn switch(&mut self, labels: &[&str]) -> Result<&mut Self> {
        self.fixups.push(LabelFixup {
            instruction: self.instructions.len(),
            labels: labels.iter().map(ToString::to_string).collect(),
        });
        self.emit(Instruction::new(
            Opcode::Switch,
            Operand::Switch(vec![usize::MAX; labels.len()]),
        ))
    }

    simple_ops! {
        /// `nop`
        nop => Nop;
        /// `dup`
        dup => Dup;
        /// `pop`
        pop => Pop;
        /// `ldnull`
        ldnull => LdNull;
        /// `ldelem`
        ldelem => Ldelem;
        /// `stelem`
        stelem => Stelem;
        /// `ldlen`
        ldlen => Ldlen;
        /// `ret`
        ret => Ret;
        /// `add`
        add => Add;
        /// `sub`
        sub => Sub;
        /// `mul`
        mul => Mul;
        /// `div`
        div => Div;
        /// `rem`
        rem => Rem;
        /// `neg`
        neg => Neg;
        /// `ceq`
        ceq => Ceq;
        /// `clt`
        clt => Clt;
        /// `cgt`
        cgt => Cgt;
        /// `throw`
        throw => Throw;
    }

    token_ops! {
        /// `ldfld field`
        ldfld => Ldfld;
        /// `stfld field`
        stfld => Stfld;
        /// `ldsfld field`
        ldsfld => Ldsfld;
        /// `stsfld field`
        stsfld => Stsfld;
        /// `call method`
        call => Call;
        /// `callvirt method`
        callvirt => Callvirt;
        /// `newobj ctor`
        newobj => Newobj;
        /// `ldftn method`
        ldftn => Ldftn;
        /// `ldvirtftn method`
        ldvirtftn => Ldvirtftn;
        /// `castclass type`
        castclass => Castclass;
        /// `isinst type`
        isinst => Isinst;
    }

    branch_ops! {
        /// `br label`
        br => Br;
        /// `brtrue label`
        brtrue => Brtrue;
        /// `brfalse label`
        brfalse => Brfalse;
        /// `beq label`
        beq => Beq;
        /// `bne.un label`
        bne => Bne;
        /// `blt label`
        blt => Blt;
        /// `bgt label`
        bgt => Bgt;
    }

    /// `ldarg index`
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining consistency.
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Instruction::ldarg(index))
    }

    /// `starg index`
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining consistency.
    pub fn starg(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Instruction::starg(index))
    }

    /// `ldloc index`
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining consistency.
    pub fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Instruction::ldloc(index))
    }

    /// `stloc index`
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining consistency.
    pub fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Instruction::stloc(index))
    }

    /// `ldc.i4 value`
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining consistency.
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        self.emit(Instruction::ldc_i4(value))
    }

    /// `ldstr value`
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining consistency.
    pub fn ldstr(&mut self, value: &str) -> Result<&mut Self> {
        self.emit(Instruction::new(
            Opcode::LdStr,
            Operand::String(value.to_string()),
        ))
    }

    /// `newarr element`
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining consistency.
    pub fn newarr(&mut self, element: TypeSig) -> Result<&mut Self> {
        self.emit(Instruction::new(Opcode::Newarr, Operand::Type(element)))
    }

    /// Resolves all labels and returns the instruction list.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a referenced label was never defined.
    pub fn finalize(mut self) -> Result<Vec<Instruction>> {
        for fixup in &self.fixups {
            let mut targets = Vec::with_capacity(fixup.labels.len());
            for label in &fixup.labels {
                let target = self
                    .labels
                    .get(label)
                    .copied()
                    .ok_or_else(|| malformed_error!("Undefined label '{}'", label))?;
                targets.push(target);
            }
            let instruction = &mut self.instructions[fixup.instruction];
            instruction.operand = match instruction.operand {
                Operand::Switch(_) => Operand::Switch(targets),
                _ => Operand::Target(targets[0]),
            };
        }
        Ok(self.instructions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_and_forward_labels() {
        let mut asm = InstructionAssembler::new();
        asm.label("top")
            .unwrap()
            .ldarg(0)
            .unwrap()
            .brtrue("out")
            .unwrap()
            .br("top")
            .unwrap()
            .label("out")
            .unwrap()
            .ret()
            .unwrap();
        let code = asm.finalize().unwrap();
        assert_eq!(code[1].targets(), vec![3]);
        assert_eq!(code[2].targets(), vec![0]);
    }

    #[test]
    fn test_switch_labels() {
        let mut asm = InstructionAssembler::new();
        asm.ldarg(0).unwrap();
        asm.switch(&["a", "b"]).unwrap();
        asm.label("a").unwrap().ret().unwrap();
        asm.label("b").unwrap().ret().unwrap();
        let code = asm.finalize().unwrap();
        assert_eq!(code[1].targets(), vec![2, 3]);
    }

    #[test]
    fn test_label_errors() {
        let mut asm = InstructionAssembler::new();
        asm.label("x").unwrap();
        assert!(asm.label("x").is_err());
        assert!(asm.emit_branch(Opcode::Add, "x").is_err());

        let mut asm = InstructionAssembler::new();
        asm.br("nowhere").unwrap();
        assert!(asm.finalize().is_err());
    }
}
