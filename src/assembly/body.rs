//! Mutable method bodies.
//!
//! A [`MethodBody`] is an ordered instruction list plus the declared local variable types. All
//! structural edits go through this type so that branch targets (instruction indices) stay
//! consistent: inserting, removing or relocating instructions remaps every target in the body.
//!
//! Insertion comes in two flavours, selected by [`BranchFixup`]:
//!
//! - [`BranchFixup::Retarget`] - branches that targeted the insertion point now target the first
//!   inserted instruction, so the new code runs on every path reaching that point
//! - [`BranchFixup::Preserve`] - branches keep targeting the original instruction, so the new code
//!   only runs on the fall-through path

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    assembly::Instruction,
    metadata::TypeSig,
    Result,
};

/// How incoming branches are treated when inserting before a branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchFixup {
    /// Incoming branches are redirected to the inserted code
    Retarget,
    /// Incoming branches keep pointing at the original instruction
    Preserve,
}

/// Instructions and local variable declarations of a method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodBody {
    /// The instruction stream
    pub instructions: Vec<Instruction>,
    /// Declared types of local variables, indexed by local slot
    pub locals: Vec<TypeSig>,
}

impl MethodBody {
    /// Creates a body from instructions and local declarations.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>, locals: Vec<TypeSig>) -> Self {
        MethodBody {
            instructions,
            locals,
        }
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if the body holds no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Instruction at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    /// Declares a new local variable and returns its slot.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the local table is full.
    pub fn add_local(&mut self, sig: TypeSig) -> Result<u16> {
        let slot = u16::try_from(self.locals.len())
            .map_err(|_| malformed_error!("Too many locals in method body"))?;
        self.locals.push(sig);
        Ok(slot)
    }

    /// Every instruction index that is the target of some branch.
    #[must_use]
    pub fn branch_targets(&self) -> BTreeSet<usize> {
        self.instructions
            .iter()
            .flat_map(Instruction::targets)
            .collect()
    }

    /// Returns `true` if some branch targets `index`.
    #[must_use]
    pub fn is_branch_target(&self, index: usize) -> bool {
        self.instructions
            .iter()
            .any(|instr| instr.targets().contains(&index))
    }

    /// Inserts `instrs` before position `at`.
    ///
    /// # Arguments
    /// * `at` - Insertion point, `0..=len`
    /// * `instrs` - Instructions to insert; branch targets inside them are absolute indices in
    ///   the resulting body
    /// * `fixup` - Treatment of branches targeting `at`
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `at` is out of range.
    pub fn insert(
        &mut self,
        at: usize,
        instrs: Vec<Instruction>,
        fixup: BranchFixup,
    ) -> Result<()> {
        if at > self.instructions.len() {
            return Err(malformed_error!(
                "Insertion point {} beyond body of {} instructions",
                at,
                self.instructions.len()
            ));
        }
        let count = instrs.len();
        if count == 0 {
            return Ok(());
        }

        for instr in &mut self.instructions {
            instr.remap_targets(|target| {
                if target > at || (target == at && fixup == BranchFixup::Preserve) {
                    target + count
                } else {
                    target
                }
            });
        }
        self.instructions.splice(at..at, instrs);
        Ok(())
    }

    /// Replaces the instruction at `at`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `at` is out of range.
    pub fn replace(&mut self, at: usize, instr: Instruction) -> Result<Instruction> {
        let slot = self
            .instructions
            .get_mut(at)
            .ok_or_else(|| malformed_error!("Replace index {} out of range", at))?;
        Ok(std::mem::replace(slot, instr))
    }

    /// Removes the instruction at `at`.
    ///
    /// Branches that targeted the removed instruction now target its successor.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `at` is out of range.
    pub fn remove(&mut self, at: usize) -> Result<Instruction> {
        if at >= self.instructions.len() {
            return Err(malformed_error!("Remove index {} out of range", at));
        }
        let removed = self.instructions.remove(at);
        for instr in &mut self.instructions {
            instr.remap_targets(|target| if target > at { target - 1 } else { target });
        }
        Ok(removed)
    }

    /// Moves the instruction range `start..end` so it begins at `to`, with `to <= start`.
    ///
    /// Instructions in `to..start` shift down behind the moved block. No branch may target the
    /// interior of the moved range; a branch targeting `to` is treated according to `fixup`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the ranges are invalid or a branch targets the
    /// moved range.
    pub fn relocate(
        &mut self,
        start: usize,
        end: usize,
        to: usize,
        fixup: BranchFixup,
    ) -> Result<()> {
        if to > start || start > end || end > self.instructions.len() {
            return Err(malformed_error!(
                "Invalid relocation of {}..{} to {}",
                start,
                end,
                to
            ));
        }
        if to == start || start == end {
            return Ok(());
        }
        if self
            .branch_targets()
            .iter()
            .any(|t| *t >= start && *t < end)
        {
            return Err(malformed_error!(
                "Relocated range {}..{} is a branch target",
                start,
                end
            ));
        }

        let moved = end - start;
        for instr in &mut self.instructions {
            instr.remap_targets(|target| {
                if target == to && fixup == BranchFixup::Retarget {
                    to
                } else if target >= to && target < start {
                    target + moved
                } else {
                    target
                }
            });
        }
        let block: Vec<Instruction> = self.instructions.drain(start..end).collect();
        self.instructions.splice(to..to, block);
        Ok(())
    }

    /// Checks that every branch target lies inside the body and the body does not fall off its
    /// end.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let len = self.instructions.len();
        for (index, instr) in self.instructions.iter().enumerate() {
            if let Some(target) = instr.targets().into_iter().find(|t| *t >= len) {
                return Err(malformed_error!(
                    "Branch at {} targets {} outside body of {} instructions",
                    index,
                    target,
                    len
                ));
            }
        }
        match self.instructions.last() {
            Some(last) if !last.is_terminal() => {
                Err(malformed_error!("Control falls off the end of the body"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::Opcode;

    fn body() -> MethodBody {
        // 0: ldarg 0
        // 1: brfalse 4
        // 2: ldc.i4 1
        // 3: ret
        // 4: ldc.i4 2
        // 5: ret
        MethodBody::new(
            vec![
                Instruction::ldarg(0),
                Instruction::branch(Opcode::Brfalse, 4),
                Instruction::ldc_i4(1),
                Instruction::simple(Opcode::Ret),
                Instruction::ldc_i4(2),
                Instruction::simple(Opcode::Ret),
            ],
            vec![],
        )
    }

    #[test]
    fn test_insert_retarget() {
        let mut body = body();
        body.insert(4, vec![Instruction::simple(Opcode::Nop)], BranchFixup::Retarget)
            .unwrap();
        assert_eq!(body.instructions[1].targets(), vec![4]);
        assert_eq!(body.instructions[4].opcode, Opcode::Nop);
        body.validate().unwrap();
    }

    #[test]
    fn test_insert_preserve() {
        let mut body = body();
        body.insert(4, vec![Instruction::simple(Opcode::Nop)], BranchFixup::Preserve)
            .unwrap();
        assert_eq!(body.instructions[1].targets(), vec![5]);
        assert_eq!(body.instructions[5].int_operand(), Some(2));
    }

    #[test]
    fn test_insert_before_branch_shifts_targets() {
        let mut body = body();
        body.insert(0, vec![Instruction::simple(Opcode::Nop); 2], BranchFixup::Preserve)
            .unwrap();
        assert_eq!(body.instructions[3].targets(), vec![6]);
        assert!(body.insert(99, vec![], BranchFixup::Preserve).is_err());
    }

    #[test]
    fn test_remove_and_replace() {
        let mut body = body();
        let old = body.replace(2, Instruction::ldc_i4(7)).unwrap();
        assert_eq!(old.int_operand(), Some(1));
        body.remove(2).unwrap();
        assert_eq!(body.instructions[1].targets(), vec![3]);
        assert_eq!(body.instructions[3].int_operand(), Some(2));
    }

    #[test]
    fn test_relocate() {
        // 0: ldc.i4 10   (initializer, moved behind)
        // 1: pop
        // 2: ldarg 0     (base call prefix)
        // 3: call base
        // 4: ret
        let mut body = MethodBody::new(
            vec![
                Instruction::ldc_i4(10),
                Instruction::simple(Opcode::Pop),
                Instruction::ldarg(0),
                Instruction::with_token(Opcode::Call, crate::metadata::Token(0x0600_0001)),
                Instruction::simple(Opcode::Ret),
            ],
            vec![],
        );
        body.relocate(2, 4, 0, BranchFixup::Retarget).unwrap();
        assert_eq!(body.instructions[0].opcode, Opcode::Ldarg);
        assert_eq!(body.instructions[1].opcode, Opcode::Call);
        assert_eq!(body.instructions[2].int_operand(), Some(10));
        assert!(body.relocate(3, 4, 4, BranchFixup::Retarget).is_err());
    }

    #[test]
    fn test_relocate_rejects_branch_into_block() {
        let mut body = body();
        assert!(body.relocate(4, 6, 2, BranchFixup::Retarget).is_err());
    }

    #[test]
    fn test_validate() {
        let mut body = body();
        body.validate().unwrap();
        body.instructions.pop();
        assert!(body.validate().is_err());
        let locals = body.add_local(TypeSig::I4).unwrap();
        assert_eq!(locals, 0);
    }
}
