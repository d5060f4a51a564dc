//! Type inheritance index.
//!
//! [`TypeHierarchy`] precomputes, for every type of a module, its full set of ancestors (base
//! chain followed by every transitively implemented interface) and the reverse relation. Both
//! directions are needed constantly by virtual call resolution, so they are computed once per
//! module snapshot.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::metadata::{Module, Token};

/// Precomputed ancestor / descendant relation over the types of a module.
#[derive(Debug, Clone, Default)]
pub struct TypeHierarchy {
    /// Type -> ancestors, base chain first (nearest base first), then interfaces
    ancestors: HashMap<Token, Vec<Token>>,
    /// Type -> types directly deriving from or implementing it
    direct_subtypes: HashMap<Token, Vec<Token>>,
}

impl TypeHierarchy {
    /// Builds the index for every type in `module`.
    ///
    /// Base or interface tokens that do not resolve are skipped; cyclic base chains (which a
    /// valid module cannot contain) are cut at the first repeated type.
    #[must_use]
    pub fn new(module: &Module) -> Self {
        let mut direct_subtypes: HashMap<Token, Vec<Token>> = HashMap::new();
        for ty in module.types() {
            for parent in ty.base.iter().chain(ty.interfaces.iter()) {
                direct_subtypes.entry(*parent).or_default().push(ty.token);
            }
        }

        let mut ancestors = HashMap::new();
        for ty in module.types() {
            let mut seen = BTreeSet::new();
            let mut chain = Vec::new();

            let mut current = ty.base;
            while let Some(base) = current {
                if base == ty.token || !seen.insert(base) {
                    break;
                }
                chain.push(base);
                current = module.type_def(base).ok().and_then(|b| b.base);
            }

            let mut queue: VecDeque<Token> = std::iter::once(ty.token)
                .chain(chain.iter().copied())
                .collect();
            while let Some(next) = queue.pop_front() {
                let Ok(def) = module.type_def(next) else {
                    continue;
                };
                for interface in &def.interfaces {
                    if *interface != ty.token && seen.insert(*interface) {
                        chain.push(*interface);
                        queue.push_back(*interface);
                    }
                }
            }
            ancestors.insert(ty.token, chain);
        }

        TypeHierarchy {
            ancestors,
            direct_subtypes,
        }
    }

    /// Ancestors of `ty`, nearest base first, interfaces last. Does not include `ty` itself.
    #[must_use]
    pub fn ancestors(&self, ty: Token) -> &[Token] {
        self.ancestors.get(&ty).map_or(&[], Vec::as_slice)
    }

    /// `ty` followed by its base classes, nearest first.
    #[must_use]
    pub fn base_chain(&self, module: &Module, ty: Token) -> Vec<Token> {
        let mut chain = vec![ty];
        for ancestor in self.ancestors(ty) {
            if module.type_def(*ancestor).is_ok_and(|d| d.is_interface()) {
                continue;
            }
            chain.push(*ancestor);
        }
        chain
    }

    /// Returns `true` if a value of type `sub` can be used where `sup` is expected.
    #[must_use]
    pub fn is_assignable(&self, sub: Token, sup: Token) -> bool {
        sub == sup || self.ancestors(sub).contains(&sup)
    }

    /// Types directly deriving from or implementing `ty`.
    #[must_use]
    pub fn direct_subtypes(&self, ty: Token) -> &[Token] {
        self.direct_subtypes.get(&ty).map_or(&[], Vec::as_slice)
    }

    /// Every transitive descendant of `ty`, in breadth-first order. Does not include `ty`.
    #[must_use]
    pub fn all_subtypes(&self, ty: Token) -> Vec<Token> {
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        let mut queue = VecDeque::from([ty]);
        while let Some(current) = queue.pop_front() {
            for sub in self.direct_subtypes(current) {
                if *sub != ty && seen.insert(*sub) {
                    result.push(*sub);
                    queue.push_back(*sub);
                }
            }
        }
        result
    }

    /// Number of indexed types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ancestors.len()
    }

    /// Returns `true` if no types are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ancestors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ModuleBuilder;

    #[test]
    fn test_ancestors_and_subtypes() {
        let mut builder = ModuleBuilder::new("Shapes").unwrap();
        let object = builder.core().object;
        let drawable = builder.interface("Shapes", "IDrawable");
        let named = builder.interface("Shapes", "INamed");
        builder
            .module_mut()
            .type_def_mut(drawable)
            .unwrap()
            .interfaces
            .push(named);
        let shape = builder.class("Shapes", "Shape");
        builder.module_mut().type_def_mut(shape).unwrap().interfaces.push(drawable);
        let circle = builder.add_type("Shapes", "Circle", Default::default(), Some(shape));
        let module = builder.build();

        let hierarchy = TypeHierarchy::new(&module);
        assert_eq!(hierarchy.ancestors(circle), &[shape, object, drawable, named]);
        assert!(hierarchy.is_assignable(circle, named));
        assert!(!hierarchy.is_assignable(shape, circle));
        assert_eq!(hierarchy.base_chain(&module, circle), vec![circle, shape, object]);

        let below_named = hierarchy.all_subtypes(named);
        assert_eq!(below_named, vec![drawable, shape, circle]);
        assert_eq!(hierarchy.direct_subtypes(shape), &[circle]);
    }
}
