//! Inserting a value below the operands of an instruction.
//!
//! To thread a context value into a call, the engine must place the load at a specific operand
//! slot: below every operand pushed after that slot, in the position the value would have had
//! if it had been an argument all along. The walk below finds that position by stepping back
//! over the instructions that compute the later operands. When the walk would cross a join
//! point (several control-flow predecessors), it falls back to spilling the in-flight operands
//! into temporary locals instead, so every path sees the same stack.

use crate::{
    analysis::JumpSiteMap,
    assembly::{BranchFixup, Instruction, MethodBody},
    metadata::{Module, Token, TypeSig},
    Result,
};

/// Where and how much was inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insertion {
    /// Index of the first inserted instruction
    pub at: usize,
    /// Number of inserted instructions
    pub count: usize,
    /// `true` if the operands above the slot were spilled into temporaries
    pub spilled: bool,
}

/// Position before `index` at which the values later popped as operands `slot..` of
/// `index` have not been pushed yet, or `None` if that position is not reachable by a
/// straight-line walk.
///
/// `above` is the number of operands above the slot.
#[must_use]
pub fn operand_start(map: &JumpSiteMap, index: usize, above: usize) -> Option<usize> {
    let mut need = above;
    let mut pos = index;
    while need > 0 {
        if !map.is_straight_line(pos) {
            return None;
        }
        let prev = pos - 1;
        let effect = map.effect(prev)?;
        let pushes = usize::from(effect.pushes);
        if pushes > need {
            return None;
        }
        need = need - pushes + usize::from(effect.pops);
        pos = prev;
    }
    Some(pos)
}

/// Inserts `load` so that its value becomes operand `slot` of the instruction at `index`.
///
/// `above` holds the declared types of the operands currently at slots `slot..`, deepest
/// first; they are used for the temporaries when spilling is needed.
///
/// # Errors
/// Returns an error if the body cannot be edited.
pub fn insert_operand(
    module: &Module,
    method: Token,
    body: &mut MethodBody,
    index: usize,
    above: &[TypeSig],
    load: Vec<Instruction>,
) -> Result<Insertion> {
    let map = JumpSiteMap::from_body(module, method, body);
    if let Some(at) = operand_start(&map, index, above.len()) {
        let count = load.len();
        body.insert(at, load, BranchFixup::Retarget)?;
        return Ok(Insertion {
            at,
            count,
            spilled: false,
        });
    }

    log::debug!(
        "Spilling {} operand(s) at {}@{} around a join point",
        above.len(),
        module.method_name(method),
        index
    );
    let mut temps = Vec::with_capacity(above.len());
    for sig in above {
        temps.push(body.add_local(sig.clone())?);
    }
    let mut code: Vec<Instruction> = temps.iter().rev().map(|t| Instruction::stloc(*t)).collect();
    code.extend(load);
    code.extend(temps.iter().map(|t| Instruction::ldloc(*t)));
    let count = code.len();
    body.insert(index, code, BranchFixup::Retarget)?;
    Ok(Insertion {
        at: index,
        count,
        spilled: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{InstructionAssembler, Opcode},
        metadata::{MethodModifiers, ModuleBuilder},
    };

    /// `Game.Sink::Take(int, int)` plus a caller built by `build`.
    fn module_with<F>(build: F) -> (Module, Token, Token)
    where
        F: FnOnce(&mut InstructionAssembler, Token) -> Result<()> + 'static,
    {
        let mut builder = ModuleBuilder::new("Insertion").unwrap();
        let sink = builder.static_class("Game", "Sink");
        let take = builder
            .method(sink, "Take")
            .flags(MethodModifiers::STATIC)
            .param("a", TypeSig::I4)
            .param("b", TypeSig::I4)
            .implementation(|asm| {
                asm.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let caller = builder
            .method(sink, "Caller")
            .flags(MethodModifiers::STATIC)
            .param("flag", TypeSig::Bool)
            .implementation(move |asm| build(asm, take))
            .build()
            .unwrap();
        (builder.build(), caller, take)
    }

    #[test]
    fn test_walks_back_over_operand_expressions() {
        // 0: ldc 1; 1: ldc 2; 2: ldc 3; 3: add; 4: call Take; 5: ret
        let (module, caller, _) = module_with(|asm, take| {
            asm.ldc_i4(1)?.ldc_i4(2)?.ldc_i4(3)?.add()?.call(take)?.ret()?;
            Ok(())
        });
        let mut body = module.body(caller).unwrap().clone();
        let inserted = insert_operand(
            &module,
            caller,
            &mut body,
            4,
            &[TypeSig::I4, TypeSig::I4],
            vec![Instruction::ldc_i4(42)],
        )
        .unwrap();

        assert_eq!(inserted, Insertion { at: 0, count: 1, spilled: false });
        assert_eq!(body.instructions[0], Instruction::ldc_i4(42));
        let original: Vec<_> = body.instructions[1..].to_vec();
        assert_eq!(&original[..], &module.body(caller).unwrap().instructions[..]);
    }

    #[test]
    fn test_slot_between_operands() {
        let (module, caller, _) = module_with(|asm, take| {
            asm.ldc_i4(1)?.ldc_i4(2)?.call(take)?.ret()?;
            Ok(())
        });
        let mut body = module.body(caller).unwrap().clone();
        let inserted = insert_operand(
            &module,
            caller,
            &mut body,
            2,
            &[TypeSig::I4],
            vec![Instruction::ldc_i4(7)],
        )
        .unwrap();
        assert_eq!(inserted.at, 1);
        assert_eq!(body.instructions[1], Instruction::ldc_i4(7));
        assert_eq!(body.instructions[2], Instruction::ldc_i4(2));
    }

    #[test]
    fn test_join_point_spills_operands() {
        // 0: ldc 1; 1: ldarg 0; 2: brfalse 5; 3: ldc 2; 4: br 6; 5: ldc 3; 6: call Take; 7: ret
        let (module, caller, _) = module_with(|asm, take| {
            asm.ldc_i4(1)?
                .ldarg(0)?
                .brfalse("other")?
                .ldc_i4(2)?
                .br("call")?
                .label("other")?
                .ldc_i4(3)?
                .label("call")?
                .call(take)?
                .ret()?;
            Ok(())
        });
        let mut body = module.body(caller).unwrap().clone();
        let locals_before = body.locals.len();
        let inserted = insert_operand(
            &module,
            caller,
            &mut body,
            6,
            &[TypeSig::I4, TypeSig::I4],
            vec![Instruction::ldc_i4(9)],
        )
        .unwrap();

        assert!(inserted.spilled);
        assert_eq!(inserted.count, 5);
        assert_eq!(body.locals.len(), locals_before + 2);
        // Both branches now reach the spill code.
        assert_eq!(body.instructions[4].targets(), vec![6]);
        assert_eq!(body.instructions[6].opcode, Opcode::Stloc);
        assert_eq!(body.instructions[8], Instruction::ldc_i4(9));
        assert_eq!(body.instructions[11].opcode, Opcode::Call);
        body.validate().unwrap();
    }
}
