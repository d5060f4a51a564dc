//! The module: owner of every type, field and method definition.
//!
//! A [`Module`] is the unit of analysis and rewriting. It stores definitions in token order and
//! hands out new tokens when definitions are added, so tokens stay stable across edits: removing
//! a method never renumbers another one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    assembly::{Instruction, MethodBody, Opcode, StackBehavior},
    metadata::{
        FieldAttributes, FieldDef, Intrinsic, MethodDef, MethodModifiers, Param, Token,
        TypeAttributes, TypeDef, TypeSig,
    },
    Error, Result,
};

/// A bytecode module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Module name
    pub name: String,
    types: BTreeMap<Token, TypeDef>,
    fields: BTreeMap<Token, FieldDef>,
    methods: BTreeMap<Token, MethodDef>,
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            ..Self::default()
        }
    }

    fn next_token<T>(map: &BTreeMap<Token, T>, table: u8) -> Token {
        let row = map.keys().next_back().map_or(1, |last| last.row() + 1);
        Token::from_parts(table, row)
    }

    /// Adds a type definition and returns its token.
    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        flags: TypeAttributes,
        base: Option<Token>,
    ) -> Token {
        let token = Self::next_token(&self.types, Token::TYPE_TABLE);
        self.types
            .insert(token, TypeDef::new(token, namespace, name, flags, base));
        token
    }

    /// Adds a type nested inside `enclosing`.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `enclosing` does not exist.
    pub fn add_nested_type(
        &mut self,
        enclosing: Token,
        name: &str,
        flags: TypeAttributes,
        base: Option<Token>,
    ) -> Result<Token> {
        let namespace = self.type_def(enclosing)?.namespace.clone();
        let token = self.add_type(&namespace, name, flags, base);
        self.type_def_mut(token)?.enclosing = Some(enclosing);
        Ok(token)
    }

    /// Adds a field to `declaring`.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `declaring` does not exist.
    pub fn add_field(
        &mut self,
        declaring: Token,
        name: &str,
        sig: TypeSig,
        flags: FieldAttributes,
    ) -> Result<Token> {
        let token = Self::next_token(&self.fields, Token::FIELD_TABLE);
        self.type_def_mut(declaring)?.fields.push(token);
        self.fields.insert(
            token,
            FieldDef {
                token,
                name: name.to_string(),
                declaring_type: declaring,
                sig,
                flags,
            },
        );
        Ok(token)
    }

    /// Adds a body-less method to `declaring`.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `declaring` does not exist.
    pub fn add_method(
        &mut self,
        declaring: Token,
        name: &str,
        flags: MethodModifiers,
        params: Vec<Param>,
        return_type: TypeSig,
    ) -> Result<Token> {
        let token = Self::next_token(&self.methods, Token::METHOD_TABLE);
        self.type_def_mut(declaring)?.methods.push(token);
        self.methods.insert(
            token,
            MethodDef {
                token,
                name: name.to_string(),
                declaring_type: declaring,
                flags,
                params,
                return_type,
                generic_params: Vec::new(),
                overrides: Vec::new(),
                intrinsic: None,
                body: None,
            },
        );
        Ok(token)
    }

    /// Removes a method from the module and from its declaring type.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the method does not exist.
    pub fn remove_method(&mut self, token: Token) -> Result<MethodDef> {
        let method = self
            .methods
            .remove(&token)
            .ok_or(Error::MethodNotFound(token))?;
        if let Some(owner) = self.types.get_mut(&method.declaring_type) {
            owner.methods.retain(|m| *m != token);
        }
        Ok(method)
    }

    /// Removes a field from the module and from its declaring type.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the field does not exist.
    pub fn remove_field(&mut self, token: Token) -> Result<FieldDef> {
        let field = self
            .fields
            .remove(&token)
            .ok_or(Error::FieldNotFound(token))?;
        if let Some(owner) = self.types.get_mut(&field.declaring_type) {
            owner.fields.retain(|f| *f != token);
        }
        Ok(field)
    }

    /// Looks up a type definition.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the token does not resolve.
    pub fn type_def(&self, token: Token) -> Result<&TypeDef> {
        self.types.get(&token).ok_or(Error::TypeNotFound(token))
    }

    /// Looks up a type definition for modification.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the token does not resolve.
    pub fn type_def_mut(&mut self, token: Token) -> Result<&mut TypeDef> {
        self.types.get_mut(&token).ok_or(Error::TypeNotFound(token))
    }

    /// Looks up a field definition.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the token does not resolve.
    pub fn field(&self, token: Token) -> Result<&FieldDef> {
        self.fields.get(&token).ok_or(Error::FieldNotFound(token))
    }

    /// Looks up a field definition for modification.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the token does not resolve.
    pub fn field_mut(&mut self, token: Token) -> Result<&mut FieldDef> {
        self.fields.get_mut(&token).ok_or(Error::FieldNotFound(token))
    }

    /// Looks up a method definition.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the token does not resolve.
    pub fn method(&self, token: Token) -> Result<&MethodDef> {
        self.methods.get(&token).ok_or(Error::MethodNotFound(token))
    }

    /// Looks up a method definition for modification.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the token does not resolve.
    pub fn method_mut(&mut self, token: Token) -> Result<&mut MethodDef> {
        self.methods
            .get_mut(&token)
            .ok_or(Error::MethodNotFound(token))
    }

    /// The body of a method.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the method does not exist, or
    /// [`Error::Malformed`] if it has no body.
    pub fn body(&self, token: Token) -> Result<&MethodBody> {
        self.method(token)?
            .body
            .as_ref()
            .ok_or_else(|| malformed_error!("Method {} has no body", token))
    }

    /// Returns `true` if `token` names a method in this module.
    #[must_use]
    pub fn contains_method(&self, token: Token) -> bool {
        self.methods.contains_key(&token)
    }

    /// Iterates all types in token order.
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    /// Iterates all fields in token order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    /// Iterates all methods in token order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.methods.values()
    }

    /// Tokens of all methods that carry a body.
    #[must_use]
    pub fn methods_with_body(&self) -> Vec<Token> {
        self.methods
            .values()
            .filter(|m| m.has_body())
            .map(|m| m.token)
            .collect()
    }

    /// Full name of a type, with `/` separating nesting levels (`Game.Outer/Inner`).
    #[must_use]
    pub fn type_name(&self, token: Token) -> String {
        match self.types.get(&token) {
            Some(ty) => match ty.enclosing {
                Some(outer) => format!("{}/{}", self.type_name(outer), ty.name),
                None => ty.qualified_name(),
            },
            None => token.to_string(),
        }
    }

    /// `Type::Method` display name, for logs and diagnostics.
    #[must_use]
    pub fn method_name(&self, token: Token) -> String {
        match self.methods.get(&token) {
            Some(m) => format!("{}::{}", self.type_name(m.declaring_type), m.name),
            None => token.to_string(),
        }
    }

    /// `Type::field` display name, for logs and diagnostics.
    #[must_use]
    pub fn field_name(&self, token: Token) -> String {
        match self.fields.get(&token) {
            Some(f) => format!("{}::{}", self.type_name(f.declaring_type), f.name),
            None => token.to_string(),
        }
    }

    /// Finds a type by its full name (see [`Module::type_name`]).
    #[must_use]
    pub fn find_type(&self, full_name: &str) -> Option<Token> {
        self.types
            .keys()
            .copied()
            .find(|token| self.type_name(*token) == full_name)
    }

    /// Finds the first method named `name` declared on `ty`.
    #[must_use]
    pub fn find_method(&self, ty: Token, name: &str) -> Option<Token> {
        let def = self.types.get(&ty)?;
        def.methods
            .iter()
            .copied()
            .find(|m| self.methods.get(m).is_some_and(|m| m.name == name))
    }

    /// Finds the field named `name` declared on `ty`.
    #[must_use]
    pub fn find_field(&self, ty: Token, name: &str) -> Option<Token> {
        let def = self.types.get(&ty)?;
        def.fields
            .iter()
            .copied()
            .find(|f| self.fields.get(f).is_some_and(|f| f.name == name))
    }

    /// Instance constructors declared on `ty`.
    #[must_use]
    pub fn constructors(&self, ty: Token) -> Vec<Token> {
        self.types.get(&ty).map_or_else(Vec::new, |def| {
            def.methods
                .iter()
                .copied()
                .filter(|m| self.methods.get(m).is_some_and(MethodDef::is_constructor))
                .collect()
        })
    }

    /// The static initializer of `ty`, if it has one.
    #[must_use]
    pub fn static_constructor(&self, ty: Token) -> Option<Token> {
        let def = self.types.get(&ty)?;
        def.methods.iter().copied().find(|m| {
            self.methods
                .get(m)
                .is_some_and(MethodDef::is_static_constructor)
        })
    }

    /// Returns `true` if `sig` denotes a callback (delegate) type.
    #[must_use]
    pub fn is_callback_sig(&self, sig: &TypeSig) -> bool {
        sig.type_token()
            .and_then(|t| self.types.get(&t))
            .is_some_and(TypeDef::is_delegate)
    }

    /// Returns `true` if `ty` is a callback (delegate) type.
    #[must_use]
    pub fn is_callback_type(&self, ty: Token) -> bool {
        self.types.get(&ty).is_some_and(TypeDef::is_delegate)
    }

    /// The intrinsic behaviour of a method, if it is runtime-provided.
    #[must_use]
    pub fn intrinsic(&self, method: Token) -> Option<Intrinsic> {
        self.methods.get(&method).and_then(|m| m.intrinsic)
    }

    /// The first runtime method implementing `intrinsic`.
    #[must_use]
    pub fn find_intrinsic(&self, intrinsic: Intrinsic) -> Option<Token> {
        self.methods
            .values()
            .find(|m| m.intrinsic == Some(intrinsic))
            .map(|m| m.token)
    }

    /// The callback `Invoke` method of a delegate type.
    #[must_use]
    pub fn delegate_invoke(&self, ty: Token) -> Option<Token> {
        let def = self.types.get(&ty)?;
        def.methods.iter().copied().find(|m| {
            self.methods
                .get(m)
                .is_some_and(|m| m.intrinsic == Some(Intrinsic::DelegateInvoke))
        })
    }

    /// Computes the stack effect of `instr` inside `owner`.
    ///
    /// Calls pop their arguments (including `this` for instance callees) and push the return
    /// value if there is one. `newobj` pops the constructor's declared parameters and pushes
    /// the new object. `ret` pops the return value of `owner`.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if a callee or `owner` does not resolve, or
    /// [`Error::Malformed`] if a call has no token operand.
    pub fn stack_behavior(&self, instr: &Instruction, owner: Token) -> Result<StackBehavior> {
        if let Some(fixed) = instr.fixed_stack_behavior() {
            return Ok(fixed);
        }
        let count = |n: usize| {
            u16::try_from(n).map_err(|_| malformed_error!("Argument count {} out of range", n))
        };
        match instr.opcode {
            Opcode::Ret => Ok(StackBehavior::new(
                u16::from(self.method(owner)?.returns_value()),
                0,
            )),
            Opcode::Newobj => {
                let callee = self.callee(instr)?;
                Ok(StackBehavior::new(count(callee.params.len())?, 1))
            }
            _ => {
                let callee = self.callee(instr)?;
                Ok(StackBehavior::new(
                    count(callee.arg_count())?,
                    u16::from(callee.returns_value()),
                ))
            }
        }
    }

    fn callee(&self, instr: &Instruction) -> Result<&MethodDef> {
        let token = instr
            .token()
            .ok_or_else(|| malformed_error!("'{}' without method token", instr.opcode))?;
        self.method(token)
    }

    /// Serializes the module to JSON.
    ///
    /// # Errors
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserializes a module from JSON.
    ///
    /// # Errors
    /// Returns [`Error::Serialization`] if decoding fails.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
