//! The reference interpreter.
//!
//! Executes method bodies of a [`Module`] directly, one frame per call, with lazily run static
//! initializers, virtual dispatch through the [`InheritanceGraph`] and the runtime intrinsics
//! (callback invoke / combine / remove, thread and task dispatch, collections). Asynchronous
//! dispatch primitives run their callback synchronously.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    analysis::InheritanceGraph,
    assembly::{Instruction, MethodBody, Opcode, Operand},
    emulation::{EmValue, HeapObject, HeapRef, ManagedHeap},
    metadata::{Intrinsic, MethodDef, Module, Token, TypeSig},
    Error, Result,
};

/// Limits of one interpreter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulationConfig {
    /// Maximum instructions executed over the interpreter's lifetime (default: 1,000,000).
    pub max_instructions: u64,
    /// Maximum nested calls (default: 256).
    pub max_call_depth: usize,
    /// Maximum heap objects (default: 1,048,576).
    pub max_heap_objects: usize,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_call_depth: 256,
            max_heap_objects: 1 << 20,
        }
    }
}

/// Executes code of one module.
pub struct Interpreter<'a> {
    module: &'a Module,
    inheritance: InheritanceGraph,
    config: EmulationConfig,
    heap: ManagedHeap,
    statics: HashMap<Token, EmValue>,
    initialized: HashSet<Token>,
    executed: u64,
    depth: usize,
}

impl<'a> Interpreter<'a> {
    /// Creates an interpreter with default limits.
    #[must_use]
    pub fn new(module: &'a Module) -> Self {
        Self::with_config(module, EmulationConfig::default())
    }

    /// Creates an interpreter with the given limits.
    #[must_use]
    pub fn with_config(module: &'a Module, config: EmulationConfig) -> Self {
        Interpreter {
            module,
            inheritance: InheritanceGraph::new(module),
            config,
            heap: ManagedHeap::new(config.max_heap_objects),
            statics: HashMap::new(),
            initialized: HashSet::new(),
            executed: 0,
            depth: 0,
        }
    }

    /// Calls `method` with `args` (receiver first for instance methods) and returns its result,
    /// [`EmValue::Void`] for void methods.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] on runtime faults or exhausted limits, or a metadata error
    /// for unresolvable tokens.
    pub fn call(&mut self, method: Token, args: &[EmValue]) -> Result<EmValue> {
        let def = self.module.method(method)?;
        if def.is_static() {
            self.ensure_initialized(def.declaring_type)?;
        }
        self.invoke(method, args.to_vec())
    }

    /// Runs `new` on `ctor` and returns the new object.
    ///
    /// # Errors
    /// See [`Interpreter::call`].
    pub fn construct(&mut self, ctor: Token, args: &[EmValue]) -> Result<EmValue> {
        self.new_object(ctor, args.to_vec())
    }

    /// Reads instance field `field` of `object`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if `object` is not an object reference.
    pub fn field(&self, object: &EmValue, field: Token) -> Result<EmValue> {
        let target = object
            .as_heap_ref()
            .ok_or_else(|| Error::Emulation(format!("field {field} read on {object}")))?;
        self.load_field(target, field)
    }

    /// Reads static field `field`, running its type's static initializer first.
    ///
    /// # Errors
    /// Returns an error if the initializer fails.
    pub fn static_field(&mut self, field: Token) -> Result<EmValue> {
        let def = self.module.field(field)?;
        self.ensure_initialized(def.declaring_type)?;
        Ok(self
            .statics
            .get(&field)
            .cloned()
            .unwrap_or_else(|| EmValue::default_for(&def.sig)))
    }

    /// The string behind `value`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if `value` is not a string reference.
    pub fn string(&self, value: &EmValue) -> Result<Arc<str>> {
        let target = value
            .as_heap_ref()
            .ok_or_else(|| Error::Emulation(format!("expected string, found {value}")))?;
        self.heap.get_string(target)
    }

    /// Allocates a string argument.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if the heap is full.
    pub fn alloc_string(&mut self, value: &str) -> Result<EmValue> {
        Ok(EmValue::ObjectRef(self.heap.alloc_string(value)?))
    }

    /// The heap.
    #[must_use]
    pub fn heap(&self) -> &ManagedHeap {
        &self.heap
    }

    /// Instructions executed so far.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed
    }

    fn ensure_initialized(&mut self, ty: Token) -> Result<()> {
        if !self.initialized.insert(ty) {
            return Ok(());
        }
        if let Some(cctor) = self.module.static_constructor(ty) {
            if self.module.method(cctor)?.has_body() {
                log::trace!("Running static initializer of {}", self.module.type_name(ty));
                self.invoke(cctor, Vec::new())?;
            }
        }
        Ok(())
    }

    fn invoke(&mut self, method: Token, args: Vec<EmValue>) -> Result<EmValue> {
        let module = self.module;
        let def = module.method(method)?;
        if let Some(intrinsic) = def.intrinsic {
            return self.intrinsic(intrinsic, args);
        }
        let Some(body) = def.body.as_ref() else {
            return Err(Error::Emulation(format!(
                "{} has no body",
                module.method_name(method)
            )));
        };
        if self.depth >= self.config.max_call_depth {
            return Err(Error::Emulation(format!(
                "call depth limit of {} reached in {}",
                self.config.max_call_depth,
                module.method_name(method)
            )));
        }
        self.depth += 1;
        let result = self.execute(def, body, args);
        self.depth -= 1;
        result
    }

    fn execute(
        &mut self,
        def: &'a MethodDef,
        body: &'a MethodBody,
        mut args: Vec<EmValue>,
    ) -> Result<EmValue> {
        let expected = def.arg_count();
        if args.len() != expected {
            return Err(Error::Emulation(format!(
                "{} expects {} argument(s), got {}",
                self.module.method_name(def.token),
                expected,
                args.len()
            )));
        }
        let mut locals: Vec<EmValue> = body.locals.iter().map(EmValue::default_for).collect();
        let mut stack: Vec<EmValue> = Vec::new();
        let mut pc = 0usize;

        loop {
            let instr = body.get(pc).ok_or_else(|| {
                Error::Emulation(format!(
                    "{} ran past its last instruction",
                    self.module.method_name(def.token)
                ))
            })?;
            self.executed += 1;
            if self.executed > self.config.max_instructions {
                return Err(Error::Emulation(format!(
                    "instruction budget of {} exhausted",
                    self.config.max_instructions
                )));
            }

            let mut next = pc + 1;
            match instr.opcode {
                Opcode::Nop => {}
                Opcode::Dup => {
                    let top = stack.last().cloned().ok_or_else(|| underflow(instr))?;
                    stack.push(top);
                }
                Opcode::Pop => {
                    pop(&mut stack, instr)?;
                }
                Opcode::LdNull => stack.push(EmValue::Null),
                Opcode::LdcI4 => {
                    let value = instr.int_operand().unwrap_or_default();
                    stack.push(EmValue::I32(value as i32));
                }
                Opcode::LdcI8 => stack.push(EmValue::I64(instr.int_operand().unwrap_or_default())),
                Opcode::LdStr => {
                    let Operand::String(value) = &instr.operand else {
                        return Err(bad_operand(instr));
                    };
                    stack.push(EmValue::ObjectRef(self.heap.alloc_string(value)?));
                }
                Opcode::Ldarg => {
                    let index = usize::from(instr.arg_index().ok_or_else(|| bad_operand(instr))?);
                    let value = args.get(index).cloned().ok_or_else(|| bad_operand(instr))?;
                    stack.push(value);
                }
                Opcode::Starg => {
                    let index = usize::from(instr.arg_index().ok_or_else(|| bad_operand(instr))?);
                    let value = pop(&mut stack, instr)?;
                    *args.get_mut(index).ok_or_else(|| bad_operand(instr))? = value;
                }
                Opcode::Ldloc => {
                    let index = usize::from(instr.local_index().ok_or_else(|| bad_operand(instr))?);
                    let value = locals.get(index).cloned().ok_or_else(|| bad_operand(instr))?;
                    stack.push(value);
                }
                Opcode::Stloc => {
                    let index = usize::from(instr.local_index().ok_or_else(|| bad_operand(instr))?);
                    let value = pop(&mut stack, instr)?;
                    *locals.get_mut(index).ok_or_else(|| bad_operand(instr))? = value;
                }
                Opcode::Ldfld => {
                    let field = token(instr)?;
                    let object = pop(&mut stack, instr)?;
                    let target = object_ref(&object, instr)?;
                    stack.push(self.load_field(target, field)?);
                }
                Opcode::Stfld => {
                    let field = token(instr)?;
                    let value = pop(&mut stack, instr)?;
                    let object = pop(&mut stack, instr)?;
                    let target = object_ref(&object, instr)?;
                    self.heap.set_field(target, field, value)?;
                }
                Opcode::Ldsfld => {
                    let value = self.static_field(token(instr)?)?;
                    stack.push(value);
                }
                Opcode::Stsfld => {
                    let field = token(instr)?;
                    self.ensure_initialized(self.module.field(field)?.declaring_type)?;
                    let value = pop(&mut stack, instr)?;
                    self.statics.insert(field, value);
                }
                Opcode::Ldelem => {
                    let index = pop_index(&mut stack, instr)?;
                    let array = pop(&mut stack, instr)?;
                    let value = match self.heap.get(object_ref(&array, instr)?)? {
                        HeapObject::Array(items) => items.get(index).cloned(),
                        _ => None,
                    };
                    stack.push(value.ok_or_else(|| {
                        Error::Emulation(format!("index {index} out of range in {instr}"))
                    })?);
                }
                Opcode::Stelem => {
                    let value = pop(&mut stack, instr)?;
                    let index = pop_index(&mut stack, instr)?;
                    let array = pop(&mut stack, instr)?;
                    match self.heap.get_mut(object_ref(&array, instr)?)? {
                        HeapObject::Array(items) if index < items.len() => items[index] = value,
                        _ => {
                            return Err(Error::Emulation(format!(
                                "index {index} out of range in {instr}"
                            )))
                        }
                    }
                }
                Opcode::Newarr => {
                    let Operand::Type(element) = &instr.operand else {
                        return Err(bad_operand(instr));
                    };
                    let length = pop_index(&mut stack, instr)?;
                    let array = vec![EmValue::default_for(element); length];
                    stack.push(EmValue::ObjectRef(self.heap.alloc(HeapObject::Array(array))?));
                }
                Opcode::Ldlen => {
                    let array = pop(&mut stack, instr)?;
                    let length = match self.heap.get(object_ref(&array, instr)?)? {
                        HeapObject::Array(items) => items.len(),
                        other => {
                            return Err(Error::Emulation(format!("ldlen on a {}", other.kind())))
                        }
                    };
                    stack.push(EmValue::I32(i32::try_from(length).unwrap_or(i32::MAX)));
                }
                Opcode::Call | Opcode::Callvirt => {
                    let virtual_call = instr.opcode == Opcode::Callvirt;
                    self.call_site(token(instr)?, virtual_call, &mut stack, instr)?;
                }
                Opcode::Newobj => {
                    let ctor = token(instr)?;
                    let count = self.module.method(ctor)?.params.len();
                    let ctor_args = pop_n(&mut stack, count, instr)?;
                    let object = self.new_object(ctor, ctor_args)?;
                    stack.push(object);
                }
                Opcode::Ldftn => stack.push(EmValue::Method(token(instr)?)),
                Opcode::Ldvirtftn => {
                    let method = token(instr)?;
                    let receiver = pop(&mut stack, instr)?;
                    stack.push(EmValue::Method(self.resolve(method, &receiver)?));
                }
                Opcode::Ret => {
                    return if def.returns_value() {
                        pop(&mut stack, instr)
                    } else {
                        Ok(EmValue::Void)
                    };
                }
                Opcode::Br => next = target(instr)?,
                Opcode::Brtrue | Opcode::Brfalse => {
                    let value = pop(&mut stack, instr)?;
                    if value.is_truthy() == (instr.opcode == Opcode::Brtrue) {
                        next = target(instr)?;
                    }
                }
                Opcode::Beq | Opcode::Bne | Opcode::Blt | Opcode::Bgt => {
                    let right = pop(&mut stack, instr)?;
                    let left = pop(&mut stack, instr)?;
                    let taken = match instr.opcode {
                        Opcode::Beq => left == right || ints_equal(&left, &right),
                        Opcode::Bne => !(left == right || ints_equal(&left, &right)),
                        Opcode::Blt => int(&left, instr)? < int(&right, instr)?,
                        _ => int(&left, instr)? > int(&right, instr)?,
                    };
                    if taken {
                        next = target(instr)?;
                    }
                }
                Opcode::Switch => {
                    let Operand::Switch(targets) = &instr.operand else {
                        return Err(bad_operand(instr));
                    };
                    let selector = int(&pop(&mut stack, instr)?, instr)?;
                    let selected = usize::try_from(selector)
                        .ok()
                        .and_then(|s| targets.get(s));
                    if let Some(target) = selected {
                        next = *target;
                    }
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Rem
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor => {
                    let right = pop(&mut stack, instr)?;
                    let left = pop(&mut stack, instr)?;
                    stack.push(arithmetic(instr, &left, &right)?);
                }
                Opcode::Neg => {
                    let value = pop(&mut stack, instr)?;
                    stack.push(match value {
                        EmValue::I32(v) => EmValue::I32(v.wrapping_neg()),
                        EmValue::I64(v) => EmValue::I64(v.wrapping_neg()),
                        _ => return Err(type_mismatch(instr, &value)),
                    });
                }
                Opcode::Ceq | Opcode::Clt | Opcode::Cgt => {
                    let right = pop(&mut stack, instr)?;
                    let left = pop(&mut stack, instr)?;
                    let result = match instr.opcode {
                        Opcode::Ceq => left == right || ints_equal(&left, &right),
                        Opcode::Clt => int(&left, instr)? < int(&right, instr)?,
                        _ => int(&left, instr)? > int(&right, instr)?,
                    };
                    stack.push(EmValue::from(result));
                }
                Opcode::Castclass | Opcode::Isinst => {
                    let ty = token(instr)?;
                    let value = pop(&mut stack, instr)?;
                    if self.is_instance_of(&value, ty)? {
                        stack.push(value);
                    } else if instr.opcode == Opcode::Isinst {
                        stack.push(EmValue::Null);
                    } else {
                        return Err(Error::Emulation(format!(
                            "invalid cast of {value} to {}",
                            self.module.type_name(ty)
                        )));
                    }
                }
                Opcode::Throw => {
                    let value = pop(&mut stack, instr)?;
                    return Err(Error::Emulation(format!(
                        "{} threw {value}",
                        self.module.method_name(def.token)
                    )));
                }
            }
            pc = next;
        }
    }

    fn call_site(
        &mut self,
        method: Token,
        is_virtual: bool,
        stack: &mut Vec<EmValue>,
        instr: &Instruction,
    ) -> Result<()> {
        let def = self.module.method(method)?;
        let args = pop_n(stack, def.arg_count(), instr)?;
        let target = if def.is_static() {
            self.ensure_initialized(def.declaring_type)?;
            method
        } else {
            let receiver = args.first().ok_or_else(|| underflow(instr))?;
            if receiver.is_null() {
                return Err(Error::Emulation(format!(
                    "null receiver calling {}",
                    self.module.method_name(method)
                )));
            }
            if is_virtual {
                self.resolve(method, receiver)?
            } else {
                method
            }
        };
        let result = self.invoke(target, args)?;
        if def.returns_value() {
            stack.push(result);
        }
        Ok(())
    }

    /// The body a virtual call of `method` on `receiver` runs.
    fn resolve(&self, method: Token, receiver: &EmValue) -> Result<Token> {
        let Some(target) = receiver.as_heap_ref() else {
            return Ok(method);
        };
        Ok(self
            .heap
            .get(target)?
            .type_token()
            .and_then(|ty| self.inheritance.resolve_for_receiver(self.module, method, ty))
            .unwrap_or(method))
    }

    fn new_object(&mut self, ctor: Token, args: Vec<EmValue>) -> Result<EmValue> {
        let def = self.module.method(ctor)?;
        let ty = def.declaring_type;
        if def.intrinsic == Some(Intrinsic::CollectionCtor) {
            return Ok(EmValue::ObjectRef(self.heap.alloc(HeapObject::List(Vec::new()))?));
        }
        if self.module.type_def(ty)?.is_delegate() {
            let [receiver, EmValue::Method(method)] = args.as_slice() else {
                return Err(Error::Emulation(format!(
                    "callback {} constructed without a function pointer",
                    self.module.type_name(ty)
                )));
            };
            let delegate = HeapObject::Delegate {
                type_token: ty,
                invocations: vec![(receiver.clone(), *method)],
            };
            return Ok(EmValue::ObjectRef(self.heap.alloc(delegate)?));
        }

        self.ensure_initialized(ty)?;
        let object = EmValue::ObjectRef(self.heap.alloc_object(ty)?);
        let mut ctor_args = Vec::with_capacity(args.len() + 1);
        ctor_args.push(object.clone());
        ctor_args.extend(args);
        self.invoke(ctor, ctor_args)?;
        Ok(object)
    }

    fn load_field(&self, target: HeapRef, field: Token) -> Result<EmValue> {
        match self.heap.get_field(target, field)? {
            Some(value) => Ok(value),
            None => Ok(EmValue::default_for(&self.module.field(field)?.sig)),
        }
    }

    fn is_instance_of(&self, value: &EmValue, ty: Token) -> Result<bool> {
        let Some(target) = value.as_heap_ref() else {
            return Ok(true);
        };
        Ok(match self.heap.get(target)?.type_token() {
            Some(actual) => actual == ty || self.inheritance.hierarchy().is_assignable(actual, ty),
            None => true,
        })
    }

    fn invocations(&self, value: &EmValue) -> Result<Option<(Token, Vec<(EmValue, Token)>)>> {
        let Some(target) = value.as_heap_ref() else {
            return Ok(None);
        };
        match self.heap.get(target)? {
            HeapObject::Delegate {
                type_token,
                invocations,
            } => Ok(Some((*type_token, invocations.clone()))),
            other => Err(Error::Emulation(format!(
                "expected callback, found {}",
                other.kind()
            ))),
        }
    }

    fn invoke_callback(&mut self, callback: &EmValue, args: &[EmValue]) -> Result<EmValue> {
        let (_, invocations) = self
            .invocations(callback)?
            .ok_or_else(|| Error::Emulation("null callback invoked".to_string()))?;
        let mut result = EmValue::Void;
        for (receiver, method) in invocations {
            let mut call_args = Vec::with_capacity(args.len() + 1);
            if !self.module.method(method)?.is_static() {
                call_args.push(receiver);
            }
            call_args.extend_from_slice(args);
            result = self.invoke(method, call_args)?;
        }
        Ok(result)
    }

    fn list(&mut self, value: Option<&EmValue>) -> Result<&mut Vec<EmValue>> {
        let target = value
            .and_then(EmValue::as_heap_ref)
            .ok_or_else(|| Error::Emulation("null collection".to_string()))?;
        match self.heap.get_mut(target)? {
            HeapObject::List(items) => Ok(items),
            other => Err(Error::Emulation(format!(
                "expected collection, found {}",
                other.kind()
            ))),
        }
    }

    fn intrinsic(&mut self, intrinsic: Intrinsic, args: Vec<EmValue>) -> Result<EmValue> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(EmValue::Null);
        match intrinsic {
            Intrinsic::ObjectCtor | Intrinsic::CollectionCtor => Ok(EmValue::Void),
            Intrinsic::DelegateInvoke => {
                let (callback, rest) = args
                    .split_first()
                    .ok_or_else(|| {
                        Error::Emulation("callback invoked without receiver".to_string())
                    })?;
                self.invoke_callback(callback, rest)
            }
            Intrinsic::DelegateCombine => {
                let (a, b) = (arg(0), arg(1));
                match (self.invocations(&a)?, self.invocations(&b)?) {
                    (None, _) => Ok(b),
                    (_, None) => Ok(a),
                    (Some((ty, mut first)), Some((_, second))) => {
                        first.extend(second);
                        Ok(EmValue::ObjectRef(self.heap.alloc(HeapObject::Delegate {
                            type_token: ty,
                            invocations: first,
                        })?))
                    }
                }
            }
            Intrinsic::DelegateRemove => {
                let (a, b) = (arg(0), arg(1));
                match (self.invocations(&a)?, self.invocations(&b)?) {
                    (None, _) => Ok(EmValue::Null),
                    (_, None) => Ok(a),
                    (Some((ty, mut from)), Some((_, remove))) => {
                        if let Some(start) = (0..=from.len().saturating_sub(remove.len()))
                            .rev()
                            .find(|s| from.get(*s..*s + remove.len()) == Some(&remove[..]))
                        {
                            from.drain(start..start + remove.len());
                        }
                        if from.is_empty() {
                            Ok(EmValue::Null)
                        } else {
                            Ok(EmValue::ObjectRef(self.heap.alloc(HeapObject::Delegate {
                                type_token: ty,
                                invocations: from,
                            })?))
                        }
                    }
                }
            }
            Intrinsic::ThreadStart | Intrinsic::TaskRun | Intrinsic::ThreadPoolQueue => {
                self.invoke_callback(&arg(0), &[])?;
                Ok(EmValue::Void)
            }
            Intrinsic::CollectionGet => {
                let index = index_of(&arg(1))?;
                let items = self.list(args.first())?;
                items
                    .get(index)
                    .cloned()
                    .ok_or_else(|| Error::Emulation(format!("index {index} out of range")))
            }
            Intrinsic::CollectionSet => {
                let index = index_of(&arg(1))?;
                let value = arg(2);
                let items = self.list(args.first())?;
                let slot = items
                    .get_mut(index)
                    .ok_or_else(|| Error::Emulation(format!("index {index} out of range")))?;
                *slot = value;
                Ok(EmValue::Void)
            }
            Intrinsic::CollectionAdd => {
                let value = arg(1);
                self.list(args.first())?.push(value);
                Ok(EmValue::Void)
            }
            Intrinsic::CollectionRemove => {
                let value = arg(1);
                let items = self.list(args.first())?;
                if let Some(position) = items.iter().position(|v| *v == value) {
                    items.remove(position);
                }
                Ok(EmValue::Void)
            }
            Intrinsic::CollectionClear => {
                self.list(args.first())?.clear();
                Ok(EmValue::Void)
            }
            Intrinsic::CollectionCount => {
                let count = self.list(args.first())?.len();
                Ok(EmValue::I32(i32::try_from(count).unwrap_or(i32::MAX)))
            }
            Intrinsic::GetEnumerator => {
                let list = arg(0)
                    .as_heap_ref()
                    .ok_or_else(|| Error::Emulation("null collection".to_string()))?;
                Ok(EmValue::ObjectRef(self.heap.alloc(HeapObject::Enumerator {
                    list,
                    position: None,
                })?))
            }
            Intrinsic::EnumeratorMoveNext | Intrinsic::EnumeratorCurrent => {
                let enumerator = arg(0)
                    .as_heap_ref()
                    .ok_or_else(|| Error::Emulation("null enumerator".to_string()))?;
                let HeapObject::Enumerator { list, position } = self.heap.get(enumerator)?.clone()
                else {
                    return Err(Error::Emulation("expected enumerator".to_string()));
                };
                let items = match self.heap.get(list)? {
                    HeapObject::List(items) => items.clone(),
                    other => {
                        return Err(Error::Emulation(format!(
                            "expected collection, found {}",
                            other.kind()
                        )))
                    }
                };
                if intrinsic == Intrinsic::EnumeratorCurrent {
                    return position
                        .and_then(|p| items.get(p).cloned())
                        .ok_or_else(|| {
                            Error::Emulation("enumerator is not positioned".to_string())
                        });
                }
                let advanced = position.map_or(0, |p| p + 1);
                if let HeapObject::Enumerator { position, .. } = self.heap.get_mut(enumerator)? {
                    *position = Some(advanced);
                }
                Ok(EmValue::from(advanced < items.len()))
            }
        }
    }
}

fn pop(stack: &mut Vec<EmValue>, instr: &Instruction) -> Result<EmValue> {
    stack.pop().ok_or_else(|| underflow(instr))
}

fn pop_n(stack: &mut Vec<EmValue>, count: usize, instr: &Instruction) -> Result<Vec<EmValue>> {
    if stack.len() < count {
        return Err(underflow(instr));
    }
    Ok(stack.split_off(stack.len() - count))
}

fn pop_index(stack: &mut Vec<EmValue>, instr: &Instruction) -> Result<usize> {
    let value = pop(stack, instr)?;
    index_of(&value)
}

fn index_of(value: &EmValue) -> Result<usize> {
    value
        .as_i64()
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| Error::Emulation(format!("invalid index {value}")))
}

fn int(value: &EmValue, instr: &Instruction) -> Result<i64> {
    value.as_i64().ok_or_else(|| type_mismatch(instr, value))
}

fn ints_equal(left: &EmValue, right: &EmValue) -> bool {
    matches!((left.as_i64(), right.as_i64()), (Some(a), Some(b)) if a == b)
}

fn object_ref(value: &EmValue, instr: &Instruction) -> Result<HeapRef> {
    value
        .as_heap_ref()
        .ok_or_else(|| Error::Emulation(format!("{instr} on {value}")))
}

fn token(instr: &Instruction) -> Result<Token> {
    instr.token().ok_or_else(|| bad_operand(instr))
}

fn target(instr: &Instruction) -> Result<usize> {
    match instr.operand {
        Operand::Target(target) => Ok(target),
        _ => Err(bad_operand(instr)),
    }
}

fn arithmetic(instr: &Instruction, left: &EmValue, right: &EmValue) -> Result<EmValue> {
    let wide = matches!(left, EmValue::I64(_)) || matches!(right, EmValue::I64(_));
    let (a, b) = (int(left, instr)?, int(right, instr)?);
    if matches!(instr.opcode, Opcode::Div | Opcode::Rem) && b == 0 {
        return Err(Error::Emulation(format!("division by zero in {instr}")));
    }
    if wide {
        let result = match instr.opcode {
            Opcode::Add => a.wrapping_add(b),
            Opcode::Sub => a.wrapping_sub(b),
            Opcode::Mul => a.wrapping_mul(b),
            Opcode::Div => a.wrapping_div(b),
            Opcode::Rem => a.wrapping_rem(b),
            Opcode::And => a & b,
            Opcode::Or => a | b,
            _ => a ^ b,
        };
        return Ok(EmValue::I64(result));
    }
    let (a, b) = (a as i32, b as i32);
    let result = match instr.opcode {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div => a.wrapping_div(b),
        Opcode::Rem => a.wrapping_rem(b),
        Opcode::And => a & b,
        Opcode::Or => a | b,
        _ => a ^ b,
    };
    Ok(EmValue::I32(result))
}

fn underflow(instr: &Instruction) -> Error {
    Error::Emulation(format!("stack underflow at {instr}"))
}

fn bad_operand(instr: &Instruction) -> Error {
    Error::Emulation(format!("malformed operand in {instr}"))
}

fn type_mismatch(instr: &Instruction, value: &EmValue) -> Error {
    Error::Emulation(format!("{instr} cannot operate on {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MethodModifiers, ModuleBuilder, TypeAttributes};

    #[test]
    fn test_arithmetic_and_branches() {
        let mut builder = ModuleBuilder::new("Math").unwrap();
        let math = builder.static_class("Game", "Math");
        // Sum of 1..=n
        let sum = builder
            .method(math, "Sum")
            .flags(MethodModifiers::STATIC)
            .param("n", TypeSig::I4)
            .returns(TypeSig::I4)
            .local(TypeSig::I4)
            .implementation(|asm| {
                asm.label("loop")?
                    .ldarg(0)?
                    .brfalse("done")?
                    .ldloc(0)?
                    .ldarg(0)?
                    .add()?
                    .stloc(0)?
                    .ldarg(0)?
                    .ldc_i4(1)?
                    .sub()?
                    .starg(0)?
                    .br("loop")?
                    .label("done")?
                    .ldloc(0)?
                    .ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();

        let mut interpreter = Interpreter::new(&module);
        assert_eq!(interpreter.call(sum, &[EmValue::I32(4)]).unwrap(), EmValue::I32(10));
        assert!(interpreter.executed() > 0);
    }

    #[test]
    fn test_static_initializer_runs_once() {
        let mut builder = ModuleBuilder::new("Statics").unwrap();
        let counter = builder.static_class("Game", "Counter");
        let n = builder.static_field(counter, "n", TypeSig::I4).unwrap();
        builder
            .static_constructor(counter)
            .implementation(move |asm| {
                asm.ldc_i4(10)?.stsfld(n)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let bump = builder
            .method(counter, "Bump")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.ldsfld(n)?.ldc_i4(1)?.add()?.stsfld(n)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();

        let mut interpreter = Interpreter::new(&module);
        interpreter.call(bump, &[]).unwrap();
        interpreter.call(bump, &[]).unwrap();
        assert_eq!(interpreter.static_field(n).unwrap(), EmValue::I32(12));
    }

    #[test]
    fn test_virtual_dispatch_and_callbacks() {
        let mut builder = ModuleBuilder::new("Dispatch").unwrap();
        let shape = builder.add_type("Game", "Shape", TypeAttributes::ABSTRACT, None);
        let area = builder
            .method(shape, "Area")
            .flags(MethodModifiers::VIRTUAL | MethodModifiers::ABSTRACT | MethodModifiers::NEW_SLOT)
            .returns(TypeSig::I4)
            .build()
            .unwrap();
        builder.default_constructor(shape).unwrap();
        let square = builder.class("Game", "Square");
        builder.module_mut().type_def_mut(square).unwrap().base = Some(shape);
        builder
            .method(square, "Area")
            .flags(MethodModifiers::VIRTUAL)
            .returns(TypeSig::I4)
            .overrides(area)
            .implementation(|asm| {
                asm.ldc_i4(16)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let square_ctor = builder.default_constructor(square).unwrap();
        let callback = builder.delegate("Game", "Measure", vec![], TypeSig::I4).unwrap();
        let measure = builder
            .method(shape, "Measure")
            .flags(MethodModifiers::STATIC)
            .param("shape", TypeSig::Class(shape))
            .returns(TypeSig::I4)
            .implementation(move |asm| {
                asm.ldarg(0)?
                    .dup()?
                    .ldvirtftn(area)?
                    .newobj(callback.ctor)?
                    .callvirt(callback.invoke)?
                    .ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();

        let mut interpreter = Interpreter::new(&module);
        let object = interpreter.construct(square_ctor, &[]).unwrap();
        // Direct calls do not dispatch.
        assert!(interpreter.call(area, &[object.clone()]).is_err());
        assert_eq!(interpreter.call(measure, &[object]).unwrap(), EmValue::I32(16));
    }

    #[test]
    fn test_instruction_budget() {
        let mut builder = ModuleBuilder::new("Spin").unwrap();
        let spin = builder.static_class("Game", "Spin");
        let forever = builder
            .method(spin, "Forever")
            .flags(MethodModifiers::STATIC)
            .implementation(|asm| {
                asm.label("top")?.br("top")?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();
        let config = EmulationConfig {
            max_instructions: 100,
            ..EmulationConfig::default()
        };
        let mut interpreter = Interpreter::with_config(&module, config);
        assert!(matches!(interpreter.call(forever, &[]), Err(Error::Emulation(_))));
        assert_eq!(interpreter.executed(), 101);
    }
}
