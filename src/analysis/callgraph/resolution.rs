//! Method inheritance and Class Hierarchy Analysis (CHA).
//!
//! This module provides the method-level view of the type hierarchy:
//! - Which methods override or implement a virtual, abstract or interface method
//! - The concrete bodies a virtual call can reach (CHA)
//! - The override family of a method (every method sharing its virtual slot)
//! - Receiver-type specific dispatch when the runtime type is known
//!
//! A method `o` on type `S` overrides a method `m` on type `D` when `S` derives from or
//! implements `D`, both are instance methods with the same name and parameter count, `o` is
//! virtual and does not open a new slot. Explicit overrides recorded on a method count as well.
//! Interface methods can also be implemented by a matching virtual method inherited from a base
//! class of the implementing type.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::{
    analysis::TypeHierarchy,
    metadata::{MethodDef, MethodModifiers, Module, Token},
};

/// Override relation between the methods of a module.
///
/// The graph precomputes, for every virtual method, the transitive set of methods overriding
/// it, and the inverse relation. Both are computed once per module snapshot and never change.
#[derive(Debug, Clone)]
pub struct InheritanceGraph {
    hierarchy: TypeHierarchy,
    /// Method -> every method transitively overriding or implementing it
    overriders: HashMap<Token, BTreeSet<Token>>,
    /// Method -> every method it transitively overrides or implements
    overridden: HashMap<Token, BTreeSet<Token>>,
    /// Methods that are not abstract
    concrete: BTreeSet<Token>,
    total_methods: usize,
}

impl InheritanceGraph {
    /// Builds the override relation for every method of `module`.
    #[must_use]
    pub fn new(module: &Module) -> Self {
        let hierarchy = TypeHierarchy::new(module);
        let mut direct: Vec<(Token, Token)> = Vec::new();

        for method in module.methods() {
            if !method.is_static() && !method.overrides.is_empty() {
                for base in &method.overrides {
                    direct.push((method.token, *base));
                }
            }
            if method.is_static() || !(method.is_virtual() || method.is_abstract()) {
                continue;
            }
            let declaring_is_interface = module
                .type_def(method.declaring_type)
                .is_ok_and(|t| t.is_interface());

            for sub in hierarchy.all_subtypes(method.declaring_type) {
                if let Some(found) = find_slot_match(module, sub, method) {
                    direct.push((found, method.token));
                } else if declaring_is_interface {
                    let inherited = hierarchy
                        .base_chain(module, sub)
                        .into_iter()
                        .skip(1)
                        .find_map(|base| find_slot_match(module, base, method));
                    if let Some(found) = inherited {
                        direct.push((found, method.token));
                    }
                }
            }
        }

        let mut up: HashMap<Token, Vec<Token>> = HashMap::new();
        let mut down: HashMap<Token, Vec<Token>> = HashMap::new();
        for (overrider, base) in direct {
            if overrider == base {
                continue;
            }
            down.entry(base).or_default().push(overrider);
            up.entry(overrider).or_default().push(base);
        }

        let overriders = close(&down);
        let overridden = close(&up);
        let concrete = module
            .methods()
            .filter(|m| !m.is_abstract())
            .map(|m| m.token)
            .collect();

        InheritanceGraph {
            hierarchy,
            overriders,
            overridden,
            concrete,
            total_methods: module.methods().count(),
        }
    }

    /// The type hierarchy the relation was derived from.
    #[must_use]
    pub fn hierarchy(&self) -> &TypeHierarchy {
        &self.hierarchy
    }

    /// Every method transitively overriding or implementing `method`.
    #[must_use]
    pub fn overriders(&self, method: Token) -> Vec<Token> {
        self.overriders
            .get(&method)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every method that `method` transitively overrides or implements.
    #[must_use]
    pub fn overridden(&self, method: Token) -> Vec<Token> {
        self.overridden
            .get(&method)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if `overrider` transitively overrides `base`.
    #[must_use]
    pub fn is_override_of(&self, overrider: Token, base: Token) -> bool {
        self.overriders
            .get(&base)
            .is_some_and(|set| set.contains(&overrider))
    }

    /// The override family of `method`: every method connected to it through the override
    /// relation in either direction, including `method` itself. All members share one virtual
    /// slot and therefore must keep identical signatures.
    #[must_use]
    pub fn family(&self, method: Token) -> BTreeSet<Token> {
        let mut family = BTreeSet::from([method]);
        let mut queue = VecDeque::from([method]);
        while let Some(current) = queue.pop_front() {
            let linked = self
                .overriders
                .get(&current)
                .into_iter()
                .chain(self.overridden.get(&current))
                .flatten();
            for next in linked {
                if family.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        family
    }

    /// Resolves possible targets for a virtual call using Class Hierarchy Analysis.
    ///
    /// Returns the declared method (unless abstract) plus every concrete override, in token
    /// order. A method without overrides resolves to itself.
    #[must_use]
    pub fn resolve_virtual(&self, method: Token) -> Vec<Token> {
        let mut targets: Vec<Token> = std::iter::once(method)
            .chain(self.overriders.get(&method).into_iter().flatten().copied())
            .filter(|m| self.concrete.contains(m))
            .collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    /// The method a virtual call of `declared` reaches when the receiver's runtime type is
    /// `receiver`: the first member of `declared`'s override set found walking up the base
    /// chain of `receiver`.
    #[must_use]
    pub fn resolve_for_receiver(
        &self,
        module: &Module,
        declared: Token,
        receiver: Token,
    ) -> Option<Token> {
        for ty in self.hierarchy.base_chain(module, receiver) {
            let Ok(def) = module.type_def(ty) else {
                continue;
            };
            let found = def
                .methods
                .iter()
                .copied()
                .find(|m| *m == declared || self.is_override_of(*m, declared));
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Returns `true` if a virtual call of `method` can reach more than one body.
    #[must_use]
    pub fn is_polymorphic(&self, method: Token) -> bool {
        self.resolve_virtual(method).len() > 1
    }

    /// Returns statistics about the relation.
    #[must_use]
    pub fn stats(&self) -> ResolverStats {
        let max_targets = self
            .overriders
            .keys()
            .map(|m| self.resolve_virtual(*m).len())
            .max()
            .unwrap_or(0);
        ResolverStats {
            total_methods: self.total_methods,
            overridden_methods: self.overriders.len(),
            overriding_methods: self.overridden.len(),
            polymorphic_methods: self
                .overriders
                .keys()
                .filter(|m| self.is_polymorphic(**m))
                .count(),
            max_targets,
        }
    }
}

/// A method declared directly on `ty` that occupies the slot of `base`.
fn find_slot_match(module: &Module, ty: Token, base: &MethodDef) -> Option<Token> {
    let def = module.type_def(ty).ok()?;
    def.methods.iter().copied().find(|candidate| {
        module.method(*candidate).is_ok_and(|c| {
            !c.is_static()
                && c.is_virtual()
                && !c.flags.contains(MethodModifiers::NEW_SLOT)
                && c.name == base.name
                && c.params.len() == base.params.len()
        })
    })
}

/// Transitive closure of an adjacency map.
fn close(edges: &HashMap<Token, Vec<Token>>) -> HashMap<Token, BTreeSet<Token>> {
    let mut closed = HashMap::new();
    for start in edges.keys() {
        let mut reached = BTreeSet::new();
        let mut worklist = edges[start].clone();
        while let Some(next) = worklist.pop() {
            if next != *start && reached.insert(next) {
                if let Some(more) = edges.get(&next) {
                    worklist.extend(more.iter().copied());
                }
            }
        }
        closed.insert(*start, reached);
    }
    closed
}

/// Statistics about the inheritance graph.
#[derive(Debug, Clone, Default)]
pub struct ResolverStats {
    /// Total number of methods indexed.
    pub total_methods: usize,
    /// Number of methods with at least one override.
    pub overridden_methods: usize,
    /// Number of methods overriding at least one other method.
    pub overriding_methods: usize,
    /// Number of methods with multiple possible targets.
    pub polymorphic_methods: usize,
    /// Maximum number of targets for any virtual method.
    pub max_targets: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ModuleBuilder, TypeAttributes, TypeSig};

    struct Shapes {
        module: Module,
        area: Token,
        circle_area: Token,
        square_area: Token,
        unit_area: Token,
        circle: Token,
        unit: Token,
        describe: Token,
        circle_describe: Token,
    }

    fn shapes() -> Shapes {
        let mut builder = ModuleBuilder::new("Shapes").unwrap();
        let shape = builder.add_type("Shapes", "Shape", TypeAttributes::ABSTRACT, None);
        let circle = builder.add_type("Shapes", "Circle", TypeAttributes::empty(), Some(shape));
        let square = builder.add_type("Shapes", "Square", TypeAttributes::empty(), Some(shape));
        let unit = builder.add_type("Shapes", "UnitCircle", TypeAttributes::empty(), Some(circle));
        let describable = builder.interface("Shapes", "IDescribable");
        builder
            .module_mut()
            .type_def_mut(circle)
            .unwrap()
            .interfaces
            .push(describable);

        let area = builder
            .method(shape, "Area")
            .flags(MethodModifiers::VIRTUAL | MethodModifiers::ABSTRACT)
            .returns(TypeSig::I4)
            .build()
            .unwrap();
        let virtual_body = |value: i32| {
            move |asm: &mut crate::assembly::InstructionAssembler| -> crate::Result<()> {
                asm.ldc_i4(value)?.ret()?;
                Ok(())
            }
        };
        let circle_area = builder
            .method(circle, "Area")
            .flags(MethodModifiers::VIRTUAL)
            .returns(TypeSig::I4)
            .implementation(virtual_body(3))
            .build()
            .unwrap();
        let square_area = builder
            .method(square, "Area")
            .flags(MethodModifiers::VIRTUAL)
            .returns(TypeSig::I4)
            .implementation(virtual_body(4))
            .build()
            .unwrap();
        let unit_area = builder
            .method(unit, "Area")
            .flags(MethodModifiers::VIRTUAL)
            .returns(TypeSig::I4)
            .implementation(virtual_body(1))
            .build()
            .unwrap();
        let describe = builder
            .method(describable, "Describe")
            .flags(MethodModifiers::VIRTUAL | MethodModifiers::ABSTRACT)
            .returns(TypeSig::String)
            .build()
            .unwrap();
        let circle_describe = builder
            .method(circle, "Describe")
            .flags(MethodModifiers::VIRTUAL | MethodModifiers::FINAL)
            .returns(TypeSig::String)
            .implementation(|asm| {
                asm.ldstr("circle")?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();

        Shapes {
            module: builder.build(),
            area,
            circle_area,
            square_area,
            unit_area,
            circle,
            unit,
            describe,
            circle_describe,
        }
    }

    #[test]
    fn test_cha_resolution() {
        let s = shapes();
        let graph = InheritanceGraph::new(&s.module);
        assert_eq!(
            graph.resolve_virtual(s.area),
            vec![s.circle_area, s.square_area, s.unit_area]
        );
        assert_eq!(graph.resolve_virtual(s.circle_area), vec![s.circle_area, s.unit_area]);
        assert_eq!(graph.resolve_virtual(s.square_area), vec![s.square_area]);
        assert!(graph.is_override_of(s.unit_area, s.area));
        assert_eq!(graph.overridden(s.unit_area), vec![s.area, s.circle_area]);
        assert_eq!(graph.resolve_virtual(s.describe), vec![s.circle_describe]);
    }

    #[test]
    fn test_receiver_dispatch() {
        let s = shapes();
        let graph = InheritanceGraph::new(&s.module);
        assert_eq!(
            graph.resolve_for_receiver(&s.module, s.area, s.unit),
            Some(s.unit_area)
        );
        assert_eq!(
            graph.resolve_for_receiver(&s.module, s.area, s.circle),
            Some(s.circle_area)
        );
        // UnitCircle inherits Describe from Circle
        assert_eq!(
            graph.resolve_for_receiver(&s.module, s.describe, s.unit),
            Some(s.circle_describe)
        );
    }

    #[test]
    fn test_family() {
        let s = shapes();
        let graph = InheritanceGraph::new(&s.module);
        let family = graph.family(s.square_area);
        assert_eq!(
            family,
            BTreeSet::from([s.area, s.circle_area, s.square_area, s.unit_area])
        );
        assert_eq!(graph.family(s.describe).len(), 2);

        let stats = graph.stats();
        assert_eq!(stats.max_targets, 3);
        assert!(stats.polymorphic_methods >= 2);
    }

    #[test]
    fn test_new_slot_breaks_override() {
        let mut builder = ModuleBuilder::new("Test").unwrap();
        let base = builder.class("Test", "Base");
        let derived = builder.add_type("Test", "Derived", TypeAttributes::empty(), Some(base));
        let run = builder
            .method(base, "Run")
            .flags(MethodModifiers::VIRTUAL)
            .implementation(|asm| {
                asm.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let hidden = builder
            .method(derived, "Run")
            .flags(MethodModifiers::VIRTUAL | MethodModifiers::NEW_SLOT)
            .implementation(|asm| {
                asm.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();
        let graph = InheritanceGraph::new(&module);
        assert_eq!(graph.resolve_virtual(run), vec![run]);
        assert!(graph.overridden(hidden).is_empty());
    }
}
