//! The variable-expression evaluator: literals, identifiers, history
//! references, member access, indexing and calls, evaluated against the
//! focused thread's stop state.

use crate::address::VirtualAddress;
use crate::dwarf::{DieRef, DwarfData, CfaRule};
use crate::error::{Error, Result};
use crate::invoker;
use crate::loaded_elves::LoadedElf;
use crate::register::{register_by_dwarf_id, RegisterState};
use crate::thread_engine::{ProcessContext, ThreadEngine};
use crate::typed_data::{
    signature_from_die, type_descriptor_from_die, SignatureDescriptor, TypeDescriptor, TypedData,
};
use std::rc::Rc;

// ---------------------------------------------------------------------------
// syntax

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i128),
    Float(f64),
    Rune(u8),
    Str(String),
    Bool(bool),
    Ident(String),
    History(usize),
    Dot,
    Arrow,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '-' if bytes.get(i + 1) == Some(&b'>') => {
                tokens.push(Token::Arrow);
                i += 2;
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && (bytes[end] as char).is_ascii_digit() {
                    end += 1;
                }
                if end == start {
                    return Err(Error::invalid("expected a number after '$'"));
                }
                let n: usize = input[start..end]
                    .parse()
                    .map_err(|_| Error::invalid("bad history reference"))?;
                tokens.push(Token::History(n));
                i = end;
            }
            '\'' => {
                // ASCII character literal, with the usual escapes.
                let (value, next) = lex_rune(bytes, i)?;
                tokens.push(Token::Rune(value));
                i = next;
            }
            '"' => {
                let (value, next) = lex_string(bytes, i)?;
                tokens.push(Token::Str(value));
                i = next;
            }
            '-' | '0'..='9' => {
                let (token, next) = lex_number(input, i)?;
                tokens.push(token);
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                tokens.push(match word {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => {
                return Err(Error::invalid(format!(
                    "unexpected character {:?} in expression",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

fn lex_rune(bytes: &[u8], start: usize) -> Result<(u8, usize)> {
    let mut i = start + 1;
    let value = match bytes.get(i) {
        Some(b'\\') => {
            i += 1;
            let escaped = match bytes.get(i) {
                Some(b'n') => b'\n',
                Some(b't') => b'\t',
                Some(b'0') => 0,
                Some(b'\\') => b'\\',
                Some(b'\'') => b'\'',
                _ => return Err(Error::invalid("bad escape in character literal")),
            };
            i += 1;
            escaped
        }
        Some(&b) if b < 0x80 && b != b'\'' => {
            i += 1;
            b
        }
        _ => return Err(Error::invalid("character literals are ASCII-only")),
    };
    if bytes.get(i) != Some(&b'\'') {
        return Err(Error::invalid("unterminated character literal"));
    }
    Ok((value, i + 1))
}

fn lex_string(bytes: &[u8], start: usize) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut i = start + 1;
    loop {
        match bytes.get(i) {
            Some(b'"') => return Ok((out, i + 1)),
            Some(b'\\') => {
                i += 1;
                match bytes.get(i) {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    _ => return Err(Error::invalid("bad escape in string literal")),
                }
                i += 1;
            }
            Some(&b) => {
                out.push(b as char);
                i += 1;
            }
            None => return Err(Error::invalid("unterminated string literal")),
        }
    }
}

fn lex_number(input: &str, start: usize) -> Result<(Token, usize)> {
    let bytes = input.as_bytes();
    let mut i = start;
    if bytes[i] == b'-' {
        i += 1;
    }
    let digits_start = i;
    let hex = input[i..].starts_with("0x") || input[i..].starts_with("0X");
    if hex {
        i += 2;
        while i < bytes.len() && (bytes[i] as char).is_ascii_hexdigit() {
            i += 1;
        }
        let value = i128::from_str_radix(&input[digits_start + 2..i], 16)
            .map_err(|_| Error::invalid("bad hex literal"))?;
        let value = if bytes[start] == b'-' { -value } else { value };
        return Ok((Token::Int(value), i));
    }
    let mut is_float = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_digit() {
            i += 1;
        } else if c == '.' && !is_float && bytes.get(i + 1).map_or(false, |b| (*b as char).is_ascii_digit()) {
            is_float = true;
            i += 1;
        } else {
            break;
        }
    }
    let text = &input[start..i];
    if is_float {
        let value: f64 = text.parse().map_err(|_| Error::invalid("bad float literal"))?;
        Ok((Token::Float(value), i))
    } else {
        let value: i128 = text.parse().map_err(|_| Error::invalid("bad integer literal"))?;
        Ok((Token::Int(value), i))
    }
}

#[derive(Clone, Debug)]
enum Expr {
    Int(i128),
    Float(f64),
    Rune(u8),
    Str(String),
    Bool(bool),
    Ident(String),
    History(usize),
    Member {
        base: Box<Expr>,
        name: String,
        arrow: bool,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(Error::invalid(format!(
                "expected {:?}, found {:?}",
                token, other
            ))),
        }
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) | Some(Token::Arrow) => {
                    let arrow = matches!(self.next(), Some(Token::Arrow));
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(Error::invalid(format!(
                                "expected a field name, found {:?}",
                                other
                            )))
                        }
                    };
                    expr = Expr::Member {
                        base: Box::new(expr),
                        name,
                        arrow,
                    };
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.expression()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::LParen) => {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Float(v)) => Ok(Expr::Float(v)),
            Some(Token::Rune(v)) => Ok(Expr::Rune(v)),
            Some(Token::Str(v)) => Ok(Expr::Str(v)),
            Some(Token::Bool(v)) => Ok(Expr::Bool(v)),
            Some(Token::Ident(v)) => Ok(Expr::Ident(v)),
            Some(Token::History(n)) => Ok(Expr::History(n)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(Error::invalid(format!(
                "unexpected token {:?} in expression",
                other
            ))),
        }
    }
}

fn parse(input: &str) -> Result<Expr> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression()?;
    if parser.peek().is_some() {
        return Err(Error::invalid("trailing input after expression"));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// evaluation

/// Evaluates expressions and keeps the `$N` result history.
#[derive(Default)]
pub struct ExpressionEvaluator {
    history: Vec<TypedData>,
}

impl ExpressionEvaluator {
    pub fn new() -> ExpressionEvaluator {
        ExpressionEvaluator::default()
    }

    pub fn history(&self) -> &[TypedData] {
        &self.history
    }

    pub fn evaluate(
        &mut self,
        ctx: &ProcessContext,
        thread: &mut ThreadEngine,
        input: &str,
    ) -> Result<TypedData> {
        let ast = parse(input)?;
        let value = self.eval(ctx, thread, &ast)?;
        self.history.push(value.clone());
        Ok(value)
    }

    fn eval(
        &mut self,
        ctx: &ProcessContext,
        thread: &mut ThreadEngine,
        expr: &Expr,
    ) -> Result<TypedData> {
        match expr {
            Expr::Int(v) => {
                // 32-bit signed unless the literal needs more room.
                if *v >= i32::MIN as i128 && *v <= i32::MAX as i128 {
                    Ok(TypedData::implicit_i32(*v as i32))
                } else if *v >= i64::MIN as i128 && *v <= i64::MAX as i128 {
                    Ok(TypedData::implicit_i64(*v as i64))
                } else {
                    Err(Error::invalid("integer literal out of range"))
                }
            }
            Expr::Float(v) => Ok(TypedData::implicit_f64(*v)),
            Expr::Rune(v) => Ok(TypedData::implicit_char(*v)),
            Expr::Bool(v) => Ok(TypedData::implicit_bool(*v)),
            Expr::Str(v) => invoker::tracee_string(ctx, thread, v),
            Expr::History(n) => self.history.get(*n).cloned().ok_or_else(|| {
                Error::invalid(format!(
                    "$-reference {} out of bounds ({} results so far)",
                    n,
                    self.history.len()
                ))
            }),
            Expr::Ident(name) => resolve_identifier(ctx, thread, name),
            Expr::Member { base, name, arrow } => {
                let base = self.eval(ctx, thread, base)?;
                let base = if *arrow {
                    base.deref(&ctx.elves.borrow(), &*ctx.memory)?
                } else {
                    base
                };
                base.field(name)
            }
            Expr::Index { base, index } => {
                let base = self.eval(ctx, thread, base)?;
                let index = self.eval(ctx, thread, index)?;
                let i = match index.read_scalar(&*ctx.memory)? {
                    crate::typed_data::ScalarValue::Int(v) if v >= 0 => v as u64,
                    crate::typed_data::ScalarValue::Uint(v) => v,
                    other => {
                        return Err(Error::invalid(format!(
                            "index must be a non-negative integer, got {}",
                            other
                        )))
                    }
                };
                base.index(i, &ctx.elves.borrow(), &*ctx.memory)
            }
            Expr::Call { callee, args } => {
                let arg_values: Vec<TypedData> = args
                    .iter()
                    .map(|a| self.eval(ctx, thread, a))
                    .collect::<Result<_>>()?;
                match &**callee {
                    // `obj.method(args)` / `ptr->method(args)`
                    Expr::Member { base, name, arrow } => {
                        let receiver_base = self.eval(ctx, thread, base)?;
                        let receiver_base = if *arrow {
                            receiver_base.deref(&ctx.elves.borrow(), &*ctx.memory)?
                        } else {
                            receiver_base
                        };
                        let (signatures, receiver) = receiver_base.method(name)?;
                        invoker::invoke(ctx, thread, &signatures, Some(receiver), arg_values)
                    }
                    // `f(args)`
                    Expr::Ident(name) => {
                        let signatures = function_signatures(ctx, name)?;
                        invoker::invoke(ctx, thread, &signatures, None, arg_values)
                    }
                    other => {
                        let callee = self.eval(ctx, thread, other)?;
                        let signatures = match &callee.descriptor {
                            TypeDescriptor::Function(sig) => vec![(**sig).clone()],
                            ty => {
                                return Err(Error::invalid(format!(
                                    "{} is not callable",
                                    ty
                                )))
                            }
                        };
                        invoker::invoke(ctx, thread, &signatures, None, arg_values)
                    }
                }
            }
        }
    }
}

/// All function definitions with this name, across every loaded image.
fn function_signatures(ctx: &ProcessContext, name: &str) -> Result<Vec<SignatureDescriptor>> {
    let elves = ctx.elves.borrow();
    let mut signatures = Vec::new();
    for elf in elves.iter() {
        if let Some(dwarf) = elf.dwarf.as_ref().filter(|d| d.has_units()) {
            for die_ref in dwarf.function_definitions_named(name) {
                signatures.push(signature_from_die(elf, dwarf, die_ref)?);
            }
        }
    }
    if signatures.is_empty() {
        return Err(Error::not_found(format!("no function named {:?}", name)));
    }
    Ok(signatures)
}

/// Identifier resolution order: locals and parameters of the innermost
/// function at the pc, then globals, then functions, then plain ELF
/// symbols.
fn resolve_identifier(
    ctx: &ProcessContext,
    thread: &mut ThreadEngine,
    name: &str,
) -> Result<TypedData> {
    let state = thread.register_state()?;
    let pc = state.program_counter();
    let elves = ctx.elves.borrow();

    // Locals of the enclosing function.
    if let Some((elf, fa)) = elves.find_by_virtual_address(pc) {
        if let Some(dwarf) = elf.dwarf.as_ref().filter(|d| d.has_units()) {
            if let Some(function) = dwarf.function_definition_containing(fa) {
                if let Some(found) =
                    find_local(elf, dwarf, function, fa, name, ctx, &state)?
                {
                    return Ok(found);
                }
            }
        }
    }

    // Globals, across every image.
    for elf in elves.iter() {
        let dwarf = match elf.dwarf.as_ref().filter(|d| d.has_units()) {
            Some(dwarf) => dwarf,
            None => continue,
        };
        for (unit_index, unit) in dwarf.units().iter().enumerate() {
            for (die_index, die) in unit.dies.iter().enumerate() {
                if die.tag != Some(gimli::DW_TAG_variable)
                    || die.name.as_deref() != Some(name)
                    || die.location_expr.is_none()
                    || die.declaration
                {
                    continue;
                }
                // Only unit-scope variables here; locals were handled
                // above.
                let die_ref = DieRef {
                    unit: unit_index,
                    die: die_index,
                };
                let parent_tag = dwarf.parent_of(die_ref).and_then(|p| dwarf.die(p).tag);
                if parent_tag != Some(gimli::DW_TAG_compile_unit) {
                    continue;
                }
                if let Some(value) = locate_variable(elf, dwarf, die_ref, None, ctx, &state)? {
                    return Ok(value);
                }
            }
        }
    }

    // Function names evaluate to callable values.
    for elf in elves.iter() {
        if let Some(dwarf) = elf.dwarf.as_ref().filter(|d| d.has_units()) {
            if let Some(&die_ref) = dwarf.function_definitions_named(name).first() {
                let signature = signature_from_die(elf, dwarf, die_ref)?;
                return Ok(TypedData::function(signature));
            }
        }
    }

    // Last resort: a data symbol without debug info.
    for elf in elves.iter() {
        if let Some(sym) = elf
            .image
            .symbols_named(name)
            .into_iter()
            .find(|s| s.address_range().is_some())
        {
            let range = sym.address_range().unwrap();
            let size = sym.size.clamp(1, 8);
            return Ok(TypedData::in_memory(
                TypeDescriptor::Uint { size },
                elf.to_virtual(range.low),
            ));
        }
    }

    Err(Error::not_found(format!("unknown identifier {:?}", name)))
}

/// DFS the function subtree for a variable or parameter named `name`,
/// honoring lexical-block ranges.
fn find_local(
    elf: &LoadedElf,
    dwarf: &DwarfData,
    function: DieRef,
    fa: crate::address::FileAddress,
    name: &str,
    ctx: &ProcessContext,
    state: &RegisterState,
) -> Result<Option<TypedData>> {
    let mut stack = vec![function];
    while let Some(current) = stack.pop() {
        for child_ref in dwarf.children_of(current) {
            let child = dwarf.die(child_ref);
            match child.tag {
                Some(gimli::DW_TAG_variable) | Some(gimli::DW_TAG_formal_parameter) => {
                    if child.name.as_deref() == Some(name) && child.location_expr.is_some() {
                        return locate_variable(elf, dwarf, child_ref, Some(function), ctx, state);
                    }
                }
                Some(gimli::DW_TAG_lexical_block) => {
                    if child.ranges.is_empty() || child.ranges.contains(fa) {
                        stack.push(child_ref);
                    }
                }
                Some(gimli::DW_TAG_inlined_subroutine) => {
                    if child.ranges.contains(fa) {
                        stack.push(child_ref);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(None)
}

/// Turn a variable DIE's location expression into a typed value.
fn locate_variable(
    elf: &LoadedElf,
    dwarf: &DwarfData,
    die_ref: DieRef,
    function: Option<DieRef>,
    ctx: &ProcessContext,
    state: &RegisterState,
) -> Result<Option<TypedData>> {
    let die = dwarf.die(die_ref);
    let expr = match &die.location_expr {
        Some(expr) => expr.clone(),
        None => return Ok(None),
    };
    let descriptor = match dwarf.type_of(die_ref) {
        Some(type_ref) => type_descriptor_from_die(elf, dwarf, type_ref)?,
        None => TypeDescriptor::Uint { size: 8 },
    };
    let frame_base = function.and_then(|f| dwarf.die(f).frame_base_expr.clone());

    match evaluate_location(&expr, frame_base.as_deref(), elf, dwarf, ctx, state)? {
        LocationOutcome::Address(addr) => Ok(Some(TypedData::in_memory(descriptor, addr))),
        LocationOutcome::Value(value) => Ok(Some(TypedData::implicit(
            descriptor,
            value.to_le_bytes().to_vec(),
        ))),
        LocationOutcome::Register(dwarf_id) => {
            let value = register_by_dwarf_id(dwarf_id as i16)
                .and_then(|spec| state.canonical_u64(spec))
                .ok_or_else(|| Error::decode("variable lives in an unreadable register"))?;
            Ok(Some(TypedData::implicit(
                descriptor,
                value.to_le_bytes().to_vec(),
            )))
        }
    }
}

enum LocationOutcome {
    Address(VirtualAddress),
    Value(u64),
    Register(u16),
}

/// Run a DW_AT_location expression with register, memory, frame-base and
/// CFA support.
fn evaluate_location(
    expr: &[u8],
    frame_base: Option<&[u8]>,
    elf: &LoadedElf,
    dwarf: &DwarfData,
    ctx: &ProcessContext,
    state: &RegisterState,
) -> Result<LocationOutcome> {
    let reader =
        gimli::EndianRcSlice::new(Rc::from(expr), gimli::RunTimeEndian::Little);
    let encoding = gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size: 8,
    };
    let mut eval = gimli::Evaluation::new(reader, encoding);
    let mut step = eval.evaluate()?;
    loop {
        match step {
            gimli::EvaluationResult::Complete => break,
            gimli::EvaluationResult::RequiresRegister { register, .. } => {
                let value = register_by_dwarf_id(register.0 as i16)
                    .and_then(|spec| state.canonical_u64(spec))
                    .ok_or_else(|| Error::decode("location needs an undefined register"))?;
                step = eval.resume_with_register(gimli::Value::Generic(value))?;
            }
            gimli::EvaluationResult::RequiresMemory { address, size, .. } => {
                let mut buf = [0u8; 8];
                let n = (size as usize).min(8);
                ctx.memory.read(VirtualAddress::new(address), &mut buf[..n])?;
                step = eval.resume_with_memory(gimli::Value::Generic(u64::from_le_bytes(buf)))?;
            }
            gimli::EvaluationResult::RequiresRelocatedAddress(addr) => {
                step = eval.resume_with_relocated_address(addr.wrapping_add(elf.load_bias))?;
            }
            gimli::EvaluationResult::RequiresFrameBase => {
                let fb_expr = frame_base
                    .ok_or_else(|| Error::decode("location needs a frame base"))?;
                let fb = match evaluate_location(fb_expr, None, elf, dwarf, ctx, state)? {
                    LocationOutcome::Address(addr) => addr.as_u64(),
                    LocationOutcome::Value(value) => value,
                    LocationOutcome::Register(dwarf_id) => register_by_dwarf_id(dwarf_id as i16)
                        .and_then(|spec| state.canonical_u64(spec))
                        .ok_or_else(|| Error::decode("frame base register is undefined"))?,
                };
                step = eval.resume_with_frame_base(fb)?;
            }
            gimli::EvaluationResult::RequiresCallFrameCfa => {
                let cfa = compute_cfa(dwarf, elf, state)?;
                step = eval.resume_with_call_frame_cfa(cfa)?;
            }
            other => {
                return Err(Error::decode(format!(
                    "unsupported location expression requirement: {:?}",
                    other
                )))
            }
        }
    }
    let pieces = eval.result();
    let piece = pieces
        .first()
        .ok_or_else(|| Error::decode("empty location expression result"))?;
    match &piece.location {
        gimli::Location::Address { address } => {
            Ok(LocationOutcome::Address(VirtualAddress::new(*address)))
        }
        gimli::Location::Register { register } => Ok(LocationOutcome::Register(register.0)),
        gimli::Location::Value { value } => Ok(LocationOutcome::Value(
            value.to_u64(u64::MAX).map_err(Error::from)?,
        )),
        _ => Err(Error::decode("unsupported variable location kind")),
    }
}

/// The canonical frame address at the current pc, from the unwind rules.
fn compute_cfa(dwarf: &DwarfData, elf: &LoadedElf, state: &RegisterState) -> Result<u64> {
    let fa = elf.to_file_address(state.program_counter());
    let rules = dwarf
        .compute_unwind_rules_at(fa)?
        .ok_or_else(|| Error::not_found("no unwind rules at the current pc"))?;
    match rules.cfa {
        CfaRule::RegisterOffset { register, offset } => {
            let base = register_by_dwarf_id(register as i16)
                .and_then(|spec| state.canonical_u64(spec))
                .ok_or_else(|| Error::decode("CFA register is undefined"))?;
            Ok(base.wrapping_add(offset as u64))
        }
        CfaRule::Expression(_) => Err(Error::decode(
            "expression-based CFA is not supported in variable locations",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_the_full_token_set() {
        let tokens = lex("foo.bar->baz[3]($1, 'a', \"hi\", 2.5, true)").unwrap();
        assert!(tokens.contains(&Token::Ident("foo".into())));
        assert!(tokens.contains(&Token::Arrow));
        assert!(tokens.contains(&Token::History(1)));
        assert!(tokens.contains(&Token::Rune(b'a')));
        assert!(tokens.contains(&Token::Str("hi".into())));
        assert!(tokens.contains(&Token::Float(2.5)));
        assert!(tokens.contains(&Token::Bool(true)));
    }

    #[test]
    fn parses_postfix_chains() {
        let expr = parse("a.b->c[0](1, 2)").unwrap();
        match expr {
            Expr::Call { callee, args } => {
                assert_eq!(args.len(), 2);
                assert!(matches!(*callee, Expr::Index { .. }));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn rejects_non_ascii_runes_and_trailing_input() {
        assert!(parse("'é'").is_err());
        assert!(parse("1 2").is_err());
        assert!(parse("(1").is_err());
    }

    #[test]
    fn grouping_parses() {
        assert!(matches!(parse("(foo)").unwrap(), Expr::Ident(_)));
    }

    #[test]
    fn negative_and_hex_literals() {
        assert!(matches!(parse("-42").unwrap(), Expr::Int(-42)));
        assert!(matches!(parse("0xff").unwrap(), Expr::Int(255)));
    }
}
