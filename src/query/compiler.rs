//! Directive compiler.
//!
//! Directives are short expressions such as `limit`, `^.targetId()` or
//! `<0?^.lookup(x)>0`. Each one compiles into a [`Program`] whose result binds
//! one placeholder. A [`CompilePass`] spans every directive of one synthesis:
//! local slots stored by `>N` stay visible to later directives, and only the
//! first `^` resolves the side provider.
//!
//! The parser is single pass and never backtracks. Positions in errors are
//! byte offsets into the directive.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::query::errors::CompileError;
use crate::query::program::{Op, Program};
use crate::query::schema::{MethodDef, Schema, TypeDef};
use crate::query::value::{TypeRef, Value};

/// Highest local slot a directive may address.
pub const MAX_LOCAL_SLOT: usize = 255;

/// Mutable compiler state shared by all directives of one synthesis pass.
pub struct CompilePass<'s> {
    schema: &'s Schema,
    record: TypeRef,
    side: Option<TypeRef>,
    locals: Vec<Option<TypeRef>>,
    provider_resolved: bool,
}

impl<'s> CompilePass<'s> {
    /// Starts a pass over `record`, optionally with a side provider type.
    pub fn new(schema: &'s Schema, record: TypeRef, side: Option<TypeRef>) -> Self {
        Self {
            schema,
            record,
            side,
            locals: Vec::new(),
            provider_resolved: false,
        }
    }

    /// Type recorded for a local slot, if something stored it.
    pub fn local(&self, slot: usize) -> Option<&TypeRef> {
        self.locals.get(slot).and_then(Option::as_ref)
    }

    /// Whether a previous directive already resolved the side provider.
    pub fn provider_resolved(&self) -> bool {
        self.provider_resolved
    }

    /// Compiles one directive.
    pub fn compile(&mut self, directive: &str) -> Result<Program, CompileError> {
        if directive.trim().is_empty() {
            return Err(CompileError::EmptyDirective);
        }
        let mut parser = Parser {
            pass: self,
            src: directive,
            pos: 0,
            ops: Vec::new(),
        };
        let result = parser.expr(Mode::Top)?;
        let ops = parser.ops;
        Ok(Program::new(Arc::from(directive), ops, result))
    }

    fn set_local(&mut self, slot: usize, ty: TypeRef) {
        if self.locals.len() <= slot {
            self.locals.resize(slot + 1, None);
        }
        self.locals[slot] = Some(ty);
    }
}

/// Where an expression sits, which decides its legal terminators.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Mode {
    /// Whole directive; ends at end of input only.
    Top,
    /// Method argument; ends at `,` or `)`.
    Args,
    /// Parenthesized group; ends at `)`.
    Group,
}

/// Outcome of compiling the operand at the start of an expression.
enum Operand {
    Value(TypeRef),
    /// `<N?` found slot N populated: the expression is complete.
    Reused(TypeRef),
    /// `<N?` found slot N empty: compile the rest as a fresh expression.
    Pending,
}

struct Parser<'c, 's> {
    pass: &'c mut CompilePass<'s>,
    src: &'c str,
    pos: usize,
    ops: Vec<Op>,
}

impl<'c> Parser<'c, '_> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.bump();
        }
    }

    fn unexpected(&self, found: char, expected: &'static str) -> CompileError {
        CompileError::UnexpectedChar {
            directive: self.src.to_owned(),
            pos: self.pos,
            found,
            expected,
        }
    }

    fn ended(&self, expected: &'static str) -> CompileError {
        CompileError::UnexpectedEnd {
            directive: self.src.to_owned(),
            expected,
        }
    }

    fn expr(&mut self, mode: Mode) -> Result<TypeRef, CompileError> {
        let mut context: Option<TypeRef> = None;
        loop {
            self.skip_ws();
            let Some(c) = self.peek() else {
                if mode != Mode::Top {
                    return Err(self.ended("`)`"));
                }
                break;
            };
            match c {
                ',' | ')' if mode == Mode::Top => {
                    return Err(CompileError::TopLevelTerminator {
                        directive: self.src.to_owned(),
                        pos: self.pos,
                        found: c,
                    });
                }
                ',' if mode == Mode::Group => return Err(self.unexpected(c, "`)`")),
                ',' | ')' => break,
                _ if context.is_none() => match self.operand(c)? {
                    Operand::Value(ty) => context = Some(ty),
                    Operand::Reused(ty) => {
                        self.skip_rest(mode);
                        return Ok(ty);
                    }
                    Operand::Pending => {}
                },
                '.' => {
                    self.bump();
                    self.skip_ws();
                    let Some(name) = self.ident() else {
                        return Err(match self.peek() {
                            Some(found) => self.unexpected(found, "identifier after `.`"),
                            None => self.ended("identifier after `.`"),
                        });
                    };
                    context = Some(self.member(context.take(), name)?);
                }
                '>' => {
                    self.bump();
                    let slot = self.slot()?;
                    let ty = context.clone().ok_or_else(|| CompileError::StoreOnVoid {
                        directive: self.src.to_owned(),
                        pos: self.pos,
                    })?;
                    self.pass.set_local(slot, ty);
                    self.ops.push(Op::StoreLocal(slot));
                }
                '?' => return Err(self.unexpected(c, "`?` only directly after `<N`")),
                _ => return Err(self.unexpected(c, "`.`, `>` or end of expression")),
            }
        }
        match context {
            Some(ty) => Ok(ty),
            None => match self.peek() {
                Some(found) => Err(self.unexpected(found, "expression")),
                None => Err(self.ended("expression")),
            },
        }
    }

    fn operand(&mut self, c: char) -> Result<Operand, CompileError> {
        match c {
            '<' => {
                self.bump();
                let slot = self.slot()?;
                let known = self.pass.local(slot).cloned();
                if self.peek() == Some('?') {
                    self.bump();
                    return Ok(match known {
                        Some(ty) => {
                            self.ops.push(Op::LoadLocal(slot));
                            Operand::Reused(ty)
                        }
                        None => Operand::Pending,
                    });
                }
                let ty = known.ok_or_else(|| CompileError::LocalUnset {
                    directive: self.src.to_owned(),
                    slot,
                })?;
                self.ops.push(Op::LoadLocal(slot));
                Ok(Operand::Value(ty))
            }
            '^' => {
                let side = self.pass.side.clone().ok_or_else(|| CompileError::NoSideProvider {
                    directive: self.src.to_owned(),
                })?;
                self.bump();
                if self.pass.provider_resolved {
                    self.ops.push(Op::LoadProvider);
                } else {
                    self.pass.provider_resolved = true;
                    self.ops.push(Op::ResolveProvider);
                }
                Ok(Operand::Value(side))
            }
            '(' => {
                self.bump();
                let ty = self.expr(Mode::Group)?;
                if self.peek() != Some(')') {
                    return Err(self.ended("`)`"));
                }
                self.bump();
                Ok(Operand::Value(ty))
            }
            '>' => Err(CompileError::StoreOnVoid {
                directive: self.src.to_owned(),
                pos: self.pos,
            }),
            c if c.is_ascii_digit() => self.literal().map(Operand::Value),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let name = self.ident().unwrap_or_default();
                self.member(None, name).map(Operand::Value)
            }
            c => Err(self.unexpected(c, "expression")),
        }
    }

    /// Field access or method call on `receiver`, defaulting to the record.
    fn member(&mut self, receiver: Option<TypeRef>, name: &str) -> Result<TypeRef, CompileError> {
        let receiver = match receiver {
            Some(ty) => ty,
            None => {
                self.ops.push(Op::LoadRecord);
                self.pass.record.clone()
            }
        };
        if self.peek() == Some('(') {
            self.bump();
            let args = self.args()?;
            let def = self.type_def(&receiver)?;
            let candidates: SmallVec<[&Arc<MethodDef>; 4]> = def
                .iter()
                .flat_map(|def| def.methods(name, args.len()))
                .collect();
            if candidates.is_empty() {
                return Err(CompileError::NoSuchMethod {
                    ty: receiver.to_string(),
                    name: name.to_owned(),
                    arity: args.len(),
                });
            }
            let method = candidates
                .into_iter()
                .find(|method| method.accepts(&args))
                .cloned()
                .ok_or_else(|| CompileError::NoApplicableOverload {
                    ty: receiver.to_string(),
                    name: name.to_owned(),
                    args: args
                        .iter()
                        .map(TypeRef::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                })?;
            let ret = method.ret().clone();
            self.ops.push(Op::Invoke {
                method,
                argc: args.len(),
            });
            return Ok(ret);
        }
        if let Some(found @ '?') = self.peek() {
            return Err(self.unexpected(found, "`?` only directly after `<N`"));
        }
        let field = self
            .type_def(&receiver)?
            .as_ref()
            .and_then(|def| def.field(name).cloned())
            .ok_or_else(|| CompileError::NoSuchField {
                ty: receiver.to_string(),
                name: name.to_owned(),
            })?;
        let ty = field.ty().clone();
        self.ops.push(Op::LoadField(field));
        Ok(ty)
    }

    fn args(&mut self) -> Result<SmallVec<[TypeRef; 4]>, CompileError> {
        let mut types = SmallVec::new();
        self.skip_ws();
        if self.peek() == Some(')') {
            self.bump();
            return Ok(types);
        }
        loop {
            types.push(self.expr(Mode::Args)?);
            match self.peek() {
                Some(',') => self.bump(),
                Some(')') => {
                    self.bump();
                    return Ok(types);
                }
                Some(found) => return Err(self.unexpected(found, "`,` or `)`")),
                None => return Err(self.ended("`)`")),
            }
        }
    }

    /// Schema entry for `ty`; scalars have no members.
    fn type_def(&self, ty: &TypeRef) -> Result<Option<Arc<TypeDef>>, CompileError> {
        match ty {
            TypeRef::Object(name) => self
                .pass
                .schema
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| CompileError::UnknownType {
                    name: name.to_string(),
                }),
            TypeRef::Scalar(_) | TypeRef::Any => Ok(None),
        }
    }

    fn ident(&mut self) -> Option<&'c str> {
        let src = self.src;
        let start = self.pos;
        let rest = &src[start..];
        let first = rest.chars().next()?;
        if !(first.is_ascii_alphabetic() || first == '_') {
            return None;
        }
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        Some(&src[start..start + len])
    }

    fn digits(&mut self) -> &'c str {
        let src = self.src;
        let start = self.pos;
        let rest = &src[start..];
        let len = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        self.pos += len;
        &src[start..start + len]
    }

    fn slot(&mut self) -> Result<usize, CompileError> {
        let pos = self.pos;
        let text = self.digits();
        match text.parse::<usize>() {
            Ok(slot) if slot <= MAX_LOCAL_SLOT => Ok(slot),
            _ => {
                let shown = if text.is_empty() {
                    self.peek().map(String::from).unwrap_or_default()
                } else {
                    text.to_owned()
                };
                Err(CompileError::InvalidSlot {
                    directive: self.src.to_owned(),
                    pos,
                    text: shown,
                })
            }
        }
    }

    fn literal(&mut self) -> Result<TypeRef, CompileError> {
        let pos = self.pos;
        let text = self.digits();
        let (value, ty) = match text.parse::<i64>() {
            Ok(n) => match i32::try_from(n) {
                Ok(small) => (Value::Int(small), TypeRef::INT),
                Err(_) => (Value::Long(n), TypeRef::LONG),
            },
            Err(_) => {
                self.pos = pos;
                let found = self.peek().unwrap_or('0');
                return Err(self.unexpected(found, "integer literal within 64 bits"));
            }
        };
        self.ops.push(Op::PushConstant(value));
        Ok(ty)
    }

    /// Skips the remainder of the current sub-expression.
    fn skip_rest(&mut self, mode: Mode) {
        if mode == Mode::Top {
            self.pos = self.src.len();
            return;
        }
        let mut depth = 0usize;
        for (offset, c) in self.src[self.pos..].char_indices() {
            match c {
                '(' => depth += 1,
                ')' if depth == 0 => {
                    self.pos += offset;
                    return;
                }
                ')' => depth -= 1,
                ',' if depth == 0 && mode == Mode::Args => {
                    self.pos += offset;
                    return;
                }
                _ => {}
            }
        }
        self.pos = self.src.len();
    }
}
