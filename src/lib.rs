//! rdb: a source-level, multi-threaded, ptrace-backed debugger engine for
//! ELF/DWARF binaries on Linux/x86-64.
//!
//! The crate is the runtime core an interactive frontend drives: the
//! per-thread stop/resume state machine, the refcounted stop-site pool
//! (INT3 patching and debug-register scheduling), DWARF-driven stepping
//! and backtraces, dynamic-linker rendezvous tracking, SysV function-call
//! synthesis, and typed access to tracee data.

#![cfg(target_os = "linux")]
#![cfg(target_arch = "x86_64")]

pub mod address;
pub mod call_stack;
pub mod disasm;
pub mod dwarf;
pub mod elf;
pub mod error;
pub mod expr;
pub mod invoker;
pub mod loaded_elves;
pub mod memory;
pub mod process_engine;
pub mod register;
pub mod stop_point;
pub mod stop_site;
pub mod thread_engine;
pub mod tracer;
pub mod typed_data;

pub use address::{AddressRange, AddressRanges, FileAddress, VirtualAddress};
pub use call_stack::{CallFrame, CallStack};
pub use error::{Error, Result};
pub use expr::ExpressionEvaluator;
pub use process_engine::{ProcessEngine, ThreadLifeCycleCallback, ThreadLifeCycleEvent};
pub use register::{RegisterState, RegisterValue};
pub use stop_point::{Resolver, StopPointId};
pub use stop_site::{StopSiteMode, StopSiteType, TrapKind};
pub use thread_engine::{StoppedStatus, SyscallCatchPolicy, ThreadStatus};
pub use typed_data::{ScalarValue, TypeDescriptor, TypedData};
