//! Abstract stack reasoning over method bodies.
//!
//! The analyses and the injection engine never build a full control flow graph. Everything they
//! need is answered by walking backwards over the instruction list:
//!
//! - [`JumpSiteMap`] - per instruction, the instructions that can execute immediately before it
//!   (fall-through and branch sources), together with each instruction's stack effect
//! - [`JumpSiteCache`] - memoized maps per method, invalidated when the injection engine edits
//!   a body
//! - [`JumpSiteMap::producers`] - which instructions may have pushed the value found at a given
//!   stack depth before an instruction
//! - [`StackDepths`] - forward stack depth computation, used to verify rewritten bodies

use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    sync::Arc,
};

use dashmap::DashMap;

use crate::{
    assembly::{Instruction, MethodBody, Opcode, StackBehavior},
    metadata::{Module, Token},
    Result,
};

/// Predecessor index and stack effects of one method body.
#[derive(Debug, Clone)]
pub struct JumpSiteMap {
    method: Token,
    /// Instructions that can execute immediately before each instruction
    predecessors: Vec<Vec<usize>>,
    /// Stack effect per instruction, `None` if the callee does not resolve
    effects: Vec<Option<StackBehavior>>,
    /// Instructions targeted by at least one branch
    branch_targets: BTreeSet<usize>,
}

impl JumpSiteMap {
    /// Builds the map for `method`.
    ///
    /// # Errors
    /// Returns [`crate::Error::MethodNotFound`] or [`crate::Error::Malformed`] if the method
    /// does not exist or has no body.
    pub fn build(module: &Module, method: Token) -> Result<Self> {
        let body = module.body(method)?;
        Ok(Self::from_body(module, method, body))
    }

    /// Builds the map for a body that is not (yet) stored in the module.
    #[must_use]
    pub fn from_body(module: &Module, method: Token, body: &MethodBody) -> Self {
        let len = body.len();
        let mut predecessors = vec![Vec::new(); len];
        let mut effects = Vec::with_capacity(len);
        let mut branch_targets = BTreeSet::new();

        for (index, instr) in body.instructions.iter().enumerate() {
            if !instr.is_terminal() && index + 1 < len {
                predecessors[index + 1].push(index);
            }
            for target in instr.targets() {
                if target < len {
                    predecessors[target].push(index);
                    branch_targets.insert(target);
                }
            }
            effects.push(module.stack_behavior(instr, method).ok());
        }

        JumpSiteMap {
            method,
            predecessors,
            effects,
            branch_targets,
        }
    }

    /// The method this map describes.
    #[must_use]
    pub fn method(&self) -> Token {
        self.method
    }

    /// Number of instructions covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.predecessors.len()
    }

    /// Returns `true` for an empty body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predecessors.is_empty()
    }

    /// Instructions that can execute immediately before `index`.
    #[must_use]
    pub fn predecessors(&self, index: usize) -> &[usize] {
        self.predecessors.get(index).map_or(&[], Vec::as_slice)
    }

    /// Returns `true` if `index` is reached only by falling through from `index - 1`.
    #[must_use]
    pub fn is_straight_line(&self, index: usize) -> bool {
        index > 0 && self.predecessors(index) == [index - 1]
    }

    /// Returns `true` if some branch targets `index`.
    #[must_use]
    pub fn is_branch_target(&self, index: usize) -> bool {
        self.branch_targets.contains(&index)
    }

    /// Stack effect of the instruction at `index`.
    #[must_use]
    pub fn effect(&self, index: usize) -> Option<StackBehavior> {
        self.effects.get(index).copied().flatten()
    }

    /// Instructions that may have pushed the value at `depth` (0 = top of stack) immediately
    /// before `index` executes.
    ///
    /// `dup` is looked through: the producers of a duplicated value are the producers of the
    /// original. Paths that reach the method entry or cross an instruction with unknown stack
    /// effect contribute nothing.
    #[must_use]
    pub fn producers(&self, body: &MethodBody, index: usize, depth: usize) -> Vec<usize> {
        let mut result = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<(usize, usize)> = self
            .predecessors(index)
            .iter()
            .map(|p| (*p, depth))
            .collect();

        while let Some((at, depth)) = queue.pop_front() {
            if !visited.insert((at, depth)) {
                continue;
            }
            let Some(effect) = self.effect(at) else {
                continue;
            };
            let pushes = usize::from(effect.pushes);
            let pops = usize::from(effect.pops);

            if depth < pushes {
                if body.instructions[at].opcode == Opcode::Dup {
                    queue.extend(self.predecessors(at).iter().map(|p| (*p, 0)));
                } else {
                    result.insert(at);
                }
                continue;
            }
            let below = depth - pushes + pops;
            queue.extend(self.predecessors(at).iter().map(|p| (*p, below)));
        }
        result.into_iter().collect()
    }

    /// Producers of the `operand`-th stack operand (0 = deepest) of the instruction at `index`.
    #[must_use]
    pub fn operand_producers(&self, body: &MethodBody, index: usize, operand: usize) -> Vec<usize> {
        match self.effect(index) {
            Some(effect) if operand < usize::from(effect.pops) => {
                self.producers(body, index, usize::from(effect.pops) - 1 - operand)
            }
            _ => Vec::new(),
        }
    }
}

/// Memoized [`JumpSiteMap`]s keyed by method.
///
/// Lookups are safe from multiple threads. Entries must be invalidated explicitly when a
/// method body changes.
#[derive(Debug, Default)]
pub struct JumpSiteCache {
    maps: DashMap<Token, Arc<JumpSiteMap>>,
}

impl JumpSiteCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        JumpSiteCache {
            maps: DashMap::new(),
        }
    }

    /// Returns the map of `method`, building it on first use.
    ///
    /// # Errors
    /// Returns an error if the method does not exist or has no body.
    pub fn get(&self, module: &Module, method: Token) -> Result<Arc<JumpSiteMap>> {
        if let Some(map) = self.maps.get(&method) {
            return Ok(Arc::clone(map.value()));
        }
        let map = Arc::new(JumpSiteMap::build(module, method)?);
        self.maps.insert(method, Arc::clone(&map));
        Ok(map)
    }

    /// Drops the cached map of `method`.
    pub fn invalidate(&self, method: Token) {
        self.maps.remove(&method);
    }

    /// Drops every cached map.
    pub fn clear(&self) {
        self.maps.clear();
    }

    /// Number of cached maps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

/// Stack depth before every instruction of a method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDepths {
    depths: Vec<Option<u16>>,
    max: u16,
}

impl StackDepths {
    /// Computes stack depths for `method` by forward propagation from the entry.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvariantViolation`] on stack underflow, on two paths joining
    /// with different depths, on a `ret` with a non-empty remaining stack, or on a call whose
    /// stack effect cannot be derived.
    pub fn compute(module: &Module, method: Token) -> Result<Self> {
        let body = module.body(method)?;
        Self::compute_body(module, method, body)
    }

    /// Computes stack depths for a body that is not (yet) stored in the module.
    ///
    /// # Errors
    /// See [`StackDepths::compute`].
    pub fn compute_body(module: &Module, method: Token, body: &MethodBody) -> Result<Self> {
        let len = body.len();
        let mut depths: Vec<Option<u16>> = vec![None; len];
        let mut max = 0;
        let mut worklist = Vec::new();
        if len > 0 {
            depths[0] = Some(0);
            worklist.push(0);
        }

        while let Some(index) = worklist.pop() {
            let instr: &Instruction = &body.instructions[index];
            let depth = depths[index].unwrap_or(0);
            let effect = module.stack_behavior(instr, method).map_err(|e| {
                invariant_error!(method, Some(index), "No stack effect for '{}': {}", instr, e)
            })?;
            if depth < effect.pops {
                return Err(invariant_error!(
                    method,
                    Some(index),
                    "Stack underflow: '{}' pops {} with depth {}",
                    instr,
                    effect.pops,
                    depth
                ));
            }
            let after = depth - effect.pops + effect.pushes;
            max = max.max(after);

            if instr.opcode == Opcode::Ret && after != 0 {
                return Err(invariant_error!(
                    method,
                    Some(index),
                    "{} value(s) left on the stack at return",
                    after
                ));
            }

            let mut successors = instr.targets();
            if !instr.is_terminal() {
                successors.push(index + 1);
            }
            for next in successors {
                if next >= len {
                    return Err(invariant_error!(
                        method,
                        Some(index),
                        "Control flow leaves the body towards {}",
                        next
                    ));
                }
                match depths[next] {
                    None => {
                        depths[next] = Some(after);
                        worklist.push(next);
                    }
                    Some(existing) if existing != after => {
                        return Err(invariant_error!(
                            method,
                            Some(next),
                            "Inconsistent stack depth at join: {} vs {}",
                            existing,
                            after
                        ));
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(StackDepths { depths, max })
    }

    /// Depth before the instruction at `index`, `None` if unreachable.
    #[must_use]
    pub fn depth(&self, index: usize) -> Option<u16> {
        self.depths.get(index).copied().flatten()
    }

    /// Maximum depth reached anywhere in the body.
    #[must_use]
    pub fn max_depth(&self) -> u16 {
        self.max
    }

    /// Depths of all instructions, in order.
    #[must_use]
    pub fn as_slice(&self) -> &[Option<u16>] {
        &self.depths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MethodModifiers, ModuleBuilder, TypeSig};

    fn build(
        params: usize,
        f: impl FnOnce(&mut crate::assembly::InstructionAssembler) -> Result<()> + 'static,
    ) -> (Module, Token) {
        let mut builder = ModuleBuilder::new("Test").unwrap();
        let ty = builder.static_class("Test", "Program");
        let mut method = builder
            .method(ty, "Run")
            .flags(MethodModifiers::STATIC)
            .returns(TypeSig::I4)
            .local(TypeSig::I4);
        for i in 0..params {
            method = method.param(&format!("p{i}"), TypeSig::I4);
        }
        let token = method.implementation(f).build().unwrap();
        (builder.build(), token)
    }

    #[test]
    fn test_producers_straight_line() {
        // 0: ldc 1, 1: ldc 2, 2: add, 3: ret
        let (module, method) = build(0, |asm| {
            asm.ldc_i4(1)?.ldc_i4(2)?.add()?.ret()?;
            Ok(())
        });
        let body = module.body(method).unwrap();
        let map = JumpSiteMap::build(&module, method).unwrap();
        assert_eq!(map.producers(body, 2, 0), vec![1]);
        assert_eq!(map.producers(body, 2, 1), vec![0]);
        assert_eq!(map.operand_producers(body, 2, 0), vec![0]);
        assert_eq!(map.producers(body, 3, 0), vec![2]);
        assert!(map.is_straight_line(1));
    }

    #[test]
    fn test_producers_join_and_dup() {
        // 0: ldarg 0, 1: brtrue L, 2: ldc 1, 3: br M, 4(L): ldc 2, 5(M): dup, 6: add, 7: ret
        let (module, method) = build(1, |asm| {
            asm.ldarg(0)?
                .brtrue("L")?
                .ldc_i4(1)?
                .br("M")?
                .label("L")?
                .ldc_i4(2)?
                .label("M")?
                .dup()?
                .add()?
                .ret()?;
            Ok(())
        });
        let body = module.body(method).unwrap();
        let map = JumpSiteMap::build(&module, method).unwrap();
        assert_eq!(map.predecessors(5), &[3, 4]);
        assert!(map.is_branch_target(5));
        assert!(!map.is_straight_line(5));
        assert_eq!(map.producers(body, 6, 0), vec![2, 4]);
        assert_eq!(map.producers(body, 6, 1), vec![2, 4]);
    }

    #[test]
    fn test_stack_depths() {
        let (module, method) = build(0, |asm| {
            asm.ldc_i4(1)?.stloc(0)?.label("top")?.ldloc(0)?.brtrue("top")?.ldc_i4(0)?.ret()?;
            Ok(())
        });
        let depths = StackDepths::compute(&module, method).unwrap();
        assert_eq!(depths.depth(0), Some(0));
        assert_eq!(depths.depth(3), Some(1));
        assert_eq!(depths.depth(4), Some(0));
        assert_eq!(depths.max_depth(), 1);
    }

    #[test]
    fn test_stack_depths_rejects_bad_shapes() {
        let (module, method) = build(0, |asm| {
            asm.add()?.ret()?;
            Ok(())
        });
        assert!(matches!(
            StackDepths::compute(&module, method),
            Err(crate::Error::InvariantViolation { offset: Some(0), .. })
        ));

        let (module, method) = build(1, |asm| {
            asm.ldarg(0)?
                .brtrue("L")?
                .ldc_i4(1)?
                .label("L")?
                .ldc_i4(2)?
                .ret()?;
            Ok(())
        });
        assert!(StackDepths::compute(&module, method).is_err());
    }

    #[test]
    fn test_cache_invalidation() {
        let (module, method) = build(0, |asm| {
            asm.ldc_i4(0)?.ret()?;
            Ok(())
        });
        let cache = JumpSiteCache::new();
        let first = cache.get(&module, method).unwrap();
        let second = cache.get(&module, method).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        cache.invalidate(method);
        assert!(cache.is_empty());
        assert!(cache.get(&module, Token(0x0600_0fff)).is_err());
    }
}
