//! Context construction and cleanup after injection.
//!
//! Building a root context builds the whole tree: every synthesized context type stores its
//! root and parent, then constructs its children. Once the tree exists the root constructor
//! runs every per-context static initializer in record creation order, so a holder's
//! initializer (which creates a reused singleton) always runs before the singleton's own.

use crate::{
    assembly::{Instruction, MethodBody, Opcode},
    context::{injection::remap_overrides, ContextModel, ContextTypeRecord, IdMap},
    metadata::{Module, Token},
    Result,
};

/// Emits every context constructor, retires replaced definitions and remaps overrides.
///
/// # Errors
/// Returns an error if a record refers to a definition that no longer exists.
pub fn finalize(module: &mut Module, model: &ContextModel, methods: &IdMap) -> Result<()> {
    for record in model.records().filter(|r| !r.reused) {
        let body = context_constructor(model, record)?;
        module.method_mut(record.constructor)?.body = Some(body);
    }
    let root = root_constructor(module, model)?;
    module.method_mut(model.root_ctor())?.body = Some(root);

    remap_overrides(module, methods)?;
    for (original, _) in methods.replaced() {
        module.remove_method(original)?;
    }
    for (original, _) in model.field_map().replaced() {
        module.remove_field(original)?;
    }

    log::debug!(
        "Finalized {} context type(s), retired {} method(s)",
        model.len(),
        methods.replaced().count()
    );
    Ok(())
}

/// `ctor(root, parent)`: stores both, then constructs every child with the same root and
/// `this` as parent.
fn context_constructor(model: &ContextModel, record: &ContextTypeRecord) -> Result<MethodBody> {
    let parent_field = record.parent_field.ok_or_else(|| {
        invariant_error!(record.constructor, None, "synthesized context type has no parent field")
    })?;
    let mut code = vec![
        Instruction::ldarg(0),
        Instruction::with_token(Opcode::Call, model.object_ctor()),
        Instruction::ldarg(0),
        Instruction::ldarg(1),
        Instruction::with_token(Opcode::Stfld, record.root_field),
        Instruction::ldarg(0),
        Instruction::ldarg(2),
        Instruction::with_token(Opcode::Stfld, parent_field),
    ];
    for child in &record.children {
        let child = child_record(model, *child)?;
        code.extend([
            Instruction::ldarg(0),
            Instruction::ldarg(1),
            Instruction::ldarg(0),
            Instruction::with_token(Opcode::Newobj, child.constructor),
            Instruction::with_token(Opcode::Stfld, link_of(child)?),
        ]);
    }
    code.push(Instruction::simple(Opcode::Ret));
    Ok(MethodBody::new(code, Vec::new()))
}

fn root_constructor(module: &Module, model: &ContextModel) -> Result<MethodBody> {
    let mut code = vec![
        Instruction::ldarg(0),
        Instruction::with_token(Opcode::Call, model.object_ctor()),
    ];
    for original in model.top_level() {
        let record = child_record(model, *original)?;
        code.extend([
            Instruction::ldarg(0),
            Instruction::ldarg(0),
            Instruction::ldarg(0),
            Instruction::with_token(Opcode::Newobj, record.constructor),
            Instruction::with_token(Opcode::Stfld, link_of(record)?),
        ]);
    }
    for record in model.records() {
        let Some(init) = record.static_init else {
            continue;
        };
        code.push(Instruction::ldarg(0));
        // Static initializers that stay static take the root instead of their context.
        if !module.method(init)?.is_static() {
            code.extend(
                record
                    .chain
                    .iter()
                    .map(|link| Instruction::with_token(Opcode::Ldfld, *link)),
            );
        }
        code.push(Instruction::with_token(Opcode::Call, init));
    }
    code.push(Instruction::simple(Opcode::Ret));
    Ok(MethodBody::new(code, Vec::new()))
}

fn child_record(model: &ContextModel, original: Token) -> Result<&ContextTypeRecord> {
    model
        .record(original)
        .ok_or(crate::Error::TypeNotFound(original))
}

fn link_of(record: &ContextTypeRecord) -> Result<Token> {
    record
        .link_field()
        .ok_or_else(|| invariant_error!(record.constructor, None, "context type has no link field"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{Diagnostics, JumpSiteCache},
        context::{ContextNames, SingletonIndex},
        metadata::{ModuleBuilder, TypeAttributes, TypeSig},
    };

    #[test]
    fn test_root_constructor_builds_tree() {
        let mut builder = ModuleBuilder::new("Tree").unwrap();
        let outer = builder.static_class("Game", "World");
        let inner = builder
            .nested_class(outer, "Clock", TypeAttributes::ABSTRACT | TypeAttributes::SEALED)
            .unwrap();
        let ticks = builder.static_field(inner, "ticks", TypeSig::I8).unwrap();
        let mut module = builder.build();
        let index = SingletonIndex::build(&module, &JumpSiteCache::new()).unwrap();
        let mut model = ContextModel::new(
            &mut module,
            index,
            [ticks].into_iter().collect(),
            ContextNames::default(),
        )
        .unwrap();
        model.bind_field(&mut module, ticks, &Diagnostics::new()).unwrap();

        finalize(&mut module, &model, &IdMap::new()).unwrap();

        let world = model.record(outer).unwrap();
        let clock = model.record(inner).unwrap();
        let root = module.body(model.root_ctor()).unwrap();
        assert!(root
            .instructions
            .contains(&Instruction::with_token(Opcode::Newobj, world.constructor)));
        assert!(!root
            .instructions
            .contains(&Instruction::with_token(Opcode::Newobj, clock.constructor)));

        let world_ctor = module.body(world.constructor).unwrap();
        assert!(world_ctor
            .instructions
            .contains(&Instruction::with_token(Opcode::Newobj, clock.constructor)));
        assert_eq!(
            world_ctor.instructions.last(),
            Some(&Instruction::simple(Opcode::Ret))
        );
        // The static field is gone, the bound field lives on the clock context.
        assert!(module.field(ticks).is_err());
    }
}
