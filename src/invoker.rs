//! Function-call synthesis: build a SysV x86-64 call frame inside the
//! stopped tracee, run it to an engine-owned return site, reconstruct the
//! return value and put every register back.

use crate::address::VirtualAddress;
use crate::error::{Error, Result};
use crate::register::{register_by_name, RegisterValue};
use crate::thread_engine::{ProcessContext, ThreadEngine, ThreadStatus};
use crate::typed_data::{
    DataLocation, PointeeRef, SignatureDescriptor, TypeDescriptor, TypedData,
};
use log::debug;

const INTEGER_REGISTERS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];
const SSE_REGISTERS: [&str; 8] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7",
];

/// Parameter/return classification, restricted to the classes this engine
/// synthesizes (no x87, no SSEUP).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum AbiClass {
    NoClass,
    Integer,
    Sse,
    Memory,
}

/// How one value travels: in up to two eightbytes, or through memory.
#[derive(Clone, Debug, PartialEq)]
enum Classification {
    None,
    Registers(Vec<AbiClass>),
    Memory,
}

/// SysV §3.2.3 merge: INTEGER wins over SSE; MEMORY poisons everything.
fn merge(a: AbiClass, b: AbiClass) -> AbiClass {
    use AbiClass::*;
    match (a, b) {
        (x, y) if x == y => x,
        (NoClass, x) | (x, NoClass) => x,
        (Memory, _) | (_, Memory) => Memory,
        (Integer, _) | (_, Integer) => Integer,
        _ => Sse,
    }
}

fn classify(ty: &TypeDescriptor) -> Result<Classification> {
    match ty {
        TypeDescriptor::Void => Ok(Classification::None),
        TypeDescriptor::Bool
        | TypeDescriptor::Char { .. }
        | TypeDescriptor::Int { .. }
        | TypeDescriptor::Uint { .. }
        | TypeDescriptor::Pointer { .. }
        | TypeDescriptor::Enum { .. } => {
            if ty.byte_size() > 8 {
                return Err(Error::invalid(format!(
                    "{}-byte scalar parameters are unsupported",
                    ty.byte_size()
                )));
            }
            Ok(Classification::Registers(vec![AbiClass::Integer]))
        }
        TypeDescriptor::Float { size } => {
            if *size > 8 {
                return Err(Error::invalid("extended floating parameters are unsupported"));
            }
            Ok(Classification::Registers(vec![AbiClass::Sse]))
        }
        TypeDescriptor::Struct(_) | TypeDescriptor::Array { .. } => {
            let size = ty.byte_size();
            if size == 0 {
                return Ok(Classification::None);
            }
            if size > 16 {
                return Ok(Classification::Memory);
            }
            if let TypeDescriptor::Struct(s) = ty {
                if s.has_unaligned_fields || s.call_nontrivial {
                    return Ok(Classification::Memory);
                }
            }
            let mut eightbytes = [AbiClass::NoClass; 2];
            walk_fields(ty, 0, &mut eightbytes)?;
            // Rule 5a: any MEMORY eightbyte demotes the aggregate.
            if eightbytes.iter().any(|&c| c == AbiClass::Memory) {
                return Ok(Classification::Memory);
            }
            let used = ((size + 7) / 8) as usize;
            Ok(Classification::Registers(eightbytes[..used].to_vec()))
        }
        TypeDescriptor::Function(_) => {
            Err(Error::invalid("function values cannot be passed by value"))
        }
    }
}

fn walk_fields(ty: &TypeDescriptor, offset: u64, eightbytes: &mut [AbiClass; 2]) -> Result<()> {
    match ty {
        TypeDescriptor::Struct(s) => {
            for member in &s.members {
                let base = if s.is_union { 0 } else { member.byte_offset };
                walk_fields(&member.ty, offset + base, eightbytes)?;
            }
            Ok(())
        }
        TypeDescriptor::Array { element, count } => {
            let elem_size = element.byte_size();
            for i in 0..count.unwrap_or(0) {
                walk_fields(element, offset + i * elem_size, eightbytes)?;
            }
            Ok(())
        }
        scalar => {
            let class = match scalar {
                TypeDescriptor::Float { .. } => AbiClass::Sse,
                TypeDescriptor::Void => AbiClass::NoClass,
                _ => AbiClass::Integer,
            };
            let start = (offset / 8) as usize;
            let end = ((offset + scalar.byte_size().max(1) - 1) / 8) as usize;
            for slot in start..=end.min(1) {
                eightbytes[slot] = merge(eightbytes[slot], class);
            }
            Ok(())
        }
    }
}

/// Pick the single signature whose parameter list structurally matches
/// the argument types. Zero matches is NotFound; more than one is an
/// ambiguity error.
fn select_signature<'a>(
    signatures: &'a [SignatureDescriptor],
    args: &[TypedData],
) -> Result<&'a SignatureDescriptor> {
    let mut matches = signatures.iter().filter(|sig| {
        sig.parameters.len() == args.len()
            && sig
                .parameters
                .iter()
                .zip(args.iter())
                .all(|(p, a)| p.structurally_equal(&a.descriptor))
    });
    let first = matches
        .next()
        .ok_or_else(|| Error::not_found("no signature matches the argument types"))?;
    if matches.next().is_some() {
        return Err(Error::invalid("ambiguous call: multiple signatures match"));
    }
    Ok(first)
}

/// Call a function taking only integer-register arguments and return its
/// rax. The workhorse behind tracee malloc and string allocation.
pub fn invoke_simple(
    ctx: &ProcessContext,
    thread: &mut ThreadEngine,
    function: VirtualAddress,
    int_args: &[u64],
) -> Result<u64> {
    if int_args.len() > INTEGER_REGISTERS.len() {
        return Err(Error::invalid("too many arguments for a simple call"));
    }
    let saved_regs = thread.register_state()?;
    let (saved_status, saved_stack) = thread.snapshot_for_invocation();

    let result = (|| -> Result<u64> {
        let return_site = ctx.elves.borrow().executable().entry_point();
        let mut state = saved_regs;
        for (value, reg) in int_args.iter().zip(INTEGER_REGISTERS.iter()) {
            let spec = register_by_name(reg).unwrap();
            state = state.with_value(spec, RegisterValue::U64(*value))?;
        }
        let rax = register_by_name("rax").unwrap();
        state = state.with_value(rax, RegisterValue::U64(0))?;

        // Stay clear of the red zone and leave rsp ≡ 8 (mod 16), the
        // state a real CALL instruction produces.
        let mut sp = (state.stack_pointer().as_u64() - 128) & !15;
        sp -= 8;
        ctx.memory
            .write_u64(VirtualAddress::new(sp), return_site.as_u64())?;
        state = state.with_stack_pointer(VirtualAddress::new(sp));
        state = state.with_program_counter(function);
        thread.set_register_state(&state)?;

        run_to_return_site(ctx, thread, return_site)?;
        Ok(thread.register_state()?.gprs().rax)
    })();

    let _ = thread.set_register_state(&saved_regs);
    thread.restore_after_invocation(saved_status, saved_stack);
    result
}

/// Resolve the tracee's malloc and carve `size` bytes out of its heap.
pub fn tracee_malloc(
    ctx: &ProcessContext,
    thread: &mut ThreadEngine,
    size: u64,
) -> Result<VirtualAddress> {
    let malloc = {
        let elves = ctx.elves.borrow();
        let mut found = None;
        for elf in elves.iter() {
            if let Some(sym) = elf.image.symbols_named("malloc").into_iter().find(|s| {
                s.kind == crate::elf::SymbolKind::Function && s.address_range().is_some()
            }) {
                found = Some(elf.to_virtual(sym.address_range().unwrap().low));
                break;
            }
        }
        found.ok_or_else(|| Error::not_found("malloc is not resolvable in the tracee"))?
    };
    let addr = invoke_simple(ctx, thread, malloc, &[size])?;
    if addr == 0 {
        return Err(Error::invalid("tracee malloc returned NULL"));
    }
    Ok(VirtualAddress::new(addr))
}

fn run_to_return_site(
    ctx: &ProcessContext,
    thread: &mut ThreadEngine,
    return_site: VirtualAddress,
) -> Result<()> {
    match thread.resume_until_address(ctx, return_site)? {
        ThreadStatus::Stopped(stopped) if stopped.next_instruction == return_site => Ok(()),
        ThreadStatus::Stopped(stopped) => Err(Error::invalid(format!(
            "synthesized call stopped unexpectedly at {}",
            stopped.next_instruction
        ))),
        _ => Err(Error::ProcessExited {
            pid: thread.tid().as_raw(),
        }),
    }
}

/// Synthesize a call to one of `signatures` with `args` (receiver
/// prepended for methods), reconstruct the return value and restore the
/// thread exactly.
pub fn invoke(
    ctx: &ProcessContext,
    thread: &mut ThreadEngine,
    signatures: &[SignatureDescriptor],
    receiver: Option<TypedData>,
    args: Vec<TypedData>,
) -> Result<TypedData> {
    let signature = select_signature(signatures, &args)?.clone();
    let function = signature
        .address
        .ok_or_else(|| Error::not_found(format!("{} has no code address", signature.name)))?;

    // Full argument list: methods implicitly lead with the receiver
    // pointer.
    let mut full_args: Vec<TypedData> = Vec::with_capacity(args.len() + 1);
    if signature.is_method {
        full_args.push(receiver.ok_or_else(|| {
            Error::invalid(format!("method {} needs a receiver", signature.name))
        })?);
    }
    full_args.extend(args);

    let arg_classes: Vec<Classification> = full_args
        .iter()
        .map(|a| classify(&a.descriptor))
        .collect::<Result<_>>()?;
    let return_class = classify(&signature.return_type)?;

    // Return storage for anything that does not come back in registers
    // as a simple scalar.
    let needs_buffer = matches!(return_class, Classification::Memory)
        || (!signature.return_type.is_scalar()
            && !matches!(return_class, Classification::None));
    let return_buffer = if needs_buffer {
        Some(tracee_malloc(
            ctx,
            thread,
            signature.return_type.byte_size().max(1),
        )?)
    } else {
        None
    };

    let saved_regs = thread.register_state()?;
    let (saved_status, saved_stack) = thread.snapshot_for_invocation();

    let result = (|| -> Result<TypedData> {
        let return_site = ctx.elves.borrow().executable().entry_point();
        let mut state = saved_regs;
        let mut next_int = 0usize;
        let mut next_sse = 0usize;
        let mut stack_bytes: Vec<u8> = Vec::new();

        if matches!(return_class, Classification::Memory) {
            // The hidden return-slot pointer takes the first INTEGER
            // register.
            let rdi = register_by_name(INTEGER_REGISTERS[0]).unwrap();
            state = state.with_value(
                rdi,
                RegisterValue::U64(return_buffer.unwrap().as_u64()),
            )?;
            next_int = 1;
        }

        for (arg, class) in full_args.iter().zip(arg_classes.iter()) {
            let bytes = arg.raw_bytes(&*ctx.memory)?;
            match class {
                Classification::None => {}
                Classification::Memory => push_stack_arg(&mut stack_bytes, &bytes),
                Classification::Registers(eightbytes) => {
                    let ints = eightbytes.iter().filter(|&&c| c == AbiClass::Integer).count();
                    let sses = eightbytes.iter().filter(|&&c| c == AbiClass::Sse).count();
                    if next_int + ints > INTEGER_REGISTERS.len()
                        || next_sse + sses > SSE_REGISTERS.len()
                    {
                        push_stack_arg(&mut stack_bytes, &bytes);
                        continue;
                    }
                    for (i, eightbyte) in eightbytes.iter().enumerate() {
                        let chunk = eightbyte_chunk(&bytes, i);
                        match eightbyte {
                            AbiClass::Integer => {
                                let spec =
                                    register_by_name(INTEGER_REGISTERS[next_int]).unwrap();
                                state = state.with_value(spec, RegisterValue::U64(chunk))?;
                                next_int += 1;
                            }
                            AbiClass::Sse => {
                                let spec = register_by_name(SSE_REGISTERS[next_sse]).unwrap();
                                state =
                                    state.with_value(spec, RegisterValue::U128(chunk as u128))?;
                                next_sse += 1;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        // Vararg contract: rax carries the number of SSE registers used.
        let rax = register_by_name("rax").unwrap();
        state = state.with_value(rax, RegisterValue::U64(next_sse as u64))?;

        // Reserve the parameter area below the red zone, realign to 16,
        // then push the return address so the callee sees a normal call
        // frame (rsp ≡ 8 mod 16, parameters at rsp+8).
        let param_base =
            (state.stack_pointer().as_u64() - 128 - stack_bytes.len() as u64) & !15;
        let sp = param_base - 8;
        ctx.memory
            .write(VirtualAddress::new(param_base), &stack_bytes)?;
        ctx.memory
            .write_u64(VirtualAddress::new(sp), return_site.as_u64())?;
        state = state.with_stack_pointer(VirtualAddress::new(sp));
        state = state.with_program_counter(function);

        debug!(
            "invoking {} at {} ({} int, {} sse, {} stack bytes)",
            signature.name,
            function,
            next_int,
            next_sse,
            stack_bytes.len()
        );
        thread.set_register_state(&state)?;
        run_to_return_site(ctx, thread, return_site)?;

        reconstruct_return(
            ctx,
            thread,
            &signature.return_type,
            &return_class,
            return_buffer,
        )
    })();

    // Cleanup runs regardless; its own failures never mask the call's.
    let _ = thread.set_register_state(&saved_regs);
    thread.restore_after_invocation(saved_status, saved_stack);
    result
}

fn push_stack_arg(stack: &mut Vec<u8>, bytes: &[u8]) {
    stack.extend_from_slice(bytes);
    // Stack slots are eightbyte-aligned.
    while stack.len() % 8 != 0 {
        stack.push(0);
    }
}

fn eightbyte_chunk(bytes: &[u8], index: usize) -> u64 {
    let mut chunk = [0u8; 8];
    let start = index * 8;
    if start < bytes.len() {
        let end = (start + 8).min(bytes.len());
        chunk[..end - start].copy_from_slice(&bytes[start..end]);
    }
    u64::from_le_bytes(chunk)
}

fn reconstruct_return(
    ctx: &ProcessContext,
    thread: &mut ThreadEngine,
    return_type: &TypeDescriptor,
    return_class: &Classification,
    return_buffer: Option<VirtualAddress>,
) -> Result<TypedData> {
    match return_class {
        Classification::None => Ok(TypedData {
            descriptor: TypeDescriptor::Void,
            location: DataLocation::Implicit(Vec::new()),
            function_addresses: Vec::new(),
        }),
        Classification::Memory => Ok(TypedData::in_memory(
            return_type.clone(),
            return_buffer.expect("memory-class returns allocate a buffer"),
        )),
        Classification::Registers(eightbytes) => {
            let state = thread.register_state()?;
            let mut int_sources = ["rax", "rdx"].iter();
            let mut sse_sources = ["xmm0", "xmm1"].iter();
            let mut bytes: Vec<u8> = Vec::new();
            for eightbyte in eightbytes {
                let value = match eightbyte {
                    AbiClass::Integer => {
                        let name = int_sources
                            .next()
                            .ok_or_else(|| Error::invalid("too many INTEGER return pieces"))?;
                        state
                            .canonical_u64(register_by_name(name).unwrap())
                            .unwrap_or(0)
                    }
                    AbiClass::Sse => {
                        let name = sse_sources
                            .next()
                            .ok_or_else(|| Error::invalid("too many SSE return pieces"))?;
                        state
                            .canonical_u64(register_by_name(name).unwrap())
                            .unwrap_or(0)
                    }
                    _ => 0,
                };
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            bytes.truncate(return_type.byte_size().max(1) as usize);

            if return_type.is_scalar() {
                Ok(TypedData::implicit(return_type.clone(), bytes))
            } else {
                // Small aggregate: spill the register image into the
                // allocated buffer so the result is addressable.
                let buffer =
                    return_buffer.expect("aggregate returns allocate a buffer");
                ctx.memory.write(buffer, &bytes)?;
                Ok(TypedData::in_memory(return_type.clone(), buffer))
            }
        }
    }
}

/// Allocate a C string inside the tracee and return it as `char*`.
pub fn tracee_string(
    ctx: &ProcessContext,
    thread: &mut ThreadEngine,
    value: &str,
) -> Result<TypedData> {
    let buffer = tracee_malloc(ctx, thread, value.len() as u64 + 1)?;
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    ctx.memory.write(buffer, &bytes)?;
    Ok(TypedData::implicit(
        TypeDescriptor::Pointer {
            pointee: PointeeRef::Known(Box::new(TypeDescriptor::Char { signed: true })),
        },
        buffer.as_u64().to_le_bytes().to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed_data::{MemberDescriptor, StructDescriptor};

    fn small_struct(members: Vec<(TypeDescriptor, u64)>, size: u64) -> TypeDescriptor {
        TypeDescriptor::Struct(StructDescriptor {
            name: Some("t".into()),
            byte_size: size,
            members: members
                .into_iter()
                .enumerate()
                .map(|(i, (ty, byte_offset))| MemberDescriptor {
                    name: format!("m{}", i),
                    ty,
                    byte_offset,
                    bit_offset: None,
                    bit_size: None,
                })
                .collect(),
            methods: Vec::new(),
            has_unaligned_fields: false,
            call_nontrivial: false,
            is_union: false,
        })
    }

    #[test]
    fn scalars_classify_by_kind() {
        assert_eq!(
            classify(&TypeDescriptor::Int { size: 4 }).unwrap(),
            Classification::Registers(vec![AbiClass::Integer])
        );
        assert_eq!(
            classify(&TypeDescriptor::Pointer {
                pointee: PointeeRef::Opaque
            })
            .unwrap(),
            Classification::Registers(vec![AbiClass::Integer])
        );
        assert_eq!(
            classify(&TypeDescriptor::Float { size: 8 }).unwrap(),
            Classification::Registers(vec![AbiClass::Sse])
        );
        assert_eq!(classify(&TypeDescriptor::Void).unwrap(), Classification::None);
    }

    #[test]
    fn large_aggregates_go_to_memory() {
        let big = small_struct(
            vec![
                (TypeDescriptor::Int { size: 8 }, 0),
                (TypeDescriptor::Int { size: 8 }, 8),
                (TypeDescriptor::Int { size: 8 }, 16),
            ],
            24,
        );
        assert_eq!(classify(&big).unwrap(), Classification::Memory);
    }

    #[test]
    fn mixed_eightbytes_merge_to_integer() {
        // { float; int } packs into one eightbyte: INTEGER wins.
        let s = small_struct(
            vec![
                (TypeDescriptor::Float { size: 4 }, 0),
                (TypeDescriptor::Int { size: 4 }, 4),
            ],
            8,
        );
        assert_eq!(
            classify(&s).unwrap(),
            Classification::Registers(vec![AbiClass::Integer])
        );
    }

    #[test]
    fn two_doubles_take_two_sse_eightbytes() {
        let s = small_struct(
            vec![
                (TypeDescriptor::Float { size: 8 }, 0),
                (TypeDescriptor::Float { size: 8 }, 8),
            ],
            16,
        );
        assert_eq!(
            classify(&s).unwrap(),
            Classification::Registers(vec![AbiClass::Sse, AbiClass::Sse])
        );
    }

    #[test]
    fn nontrivial_types_are_memory_class() {
        let mut s = match small_struct(vec![(TypeDescriptor::Int { size: 4 }, 0)], 4) {
            TypeDescriptor::Struct(s) => s,
            _ => unreachable!(),
        };
        s.call_nontrivial = true;
        assert_eq!(
            classify(&TypeDescriptor::Struct(s)).unwrap(),
            Classification::Memory
        );
    }

    #[test]
    fn signature_selection_is_structural_and_unambiguous() {
        let sig = |params: Vec<TypeDescriptor>| SignatureDescriptor {
            name: "f".into(),
            return_type: TypeDescriptor::Void,
            parameters: params,
            address: Some(VirtualAddress::new(0x1000)),
            is_method: false,
        };
        let sigs = vec![
            sig(vec![TypeDescriptor::Int { size: 4 }]),
            sig(vec![TypeDescriptor::Float { size: 8 }]),
        ];
        let args = vec![TypedData::implicit_i32(5)];
        assert_eq!(
            select_signature(&sigs, &args).unwrap().parameters.len(),
            1
        );
        let args = vec![TypedData::implicit_bool(true)];
        assert!(matches!(
            select_signature(&sigs, &args).unwrap_err(),
            Error::NotFound(_)
        ));
        let dup = vec![sig(vec![TypeDescriptor::Int { size: 4 }]); 2];
        let args = vec![TypedData::implicit_i32(5)];
        assert!(matches!(
            select_signature(&dup, &args).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn eightbyte_chunking_pads_the_tail() {
        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert_eq!(eightbyte_chunk(&bytes, 0), 0x0807060504030201);
        assert_eq!(eightbyte_chunk(&bytes, 1), 0x0a09);
        assert_eq!(eightbyte_chunk(&bytes, 2), 0);
    }
}
