//! Runtime routines called from compiled code.
//!
//! The table mapping each [`RuntimeCall`] to an address is built once and
//! then only read; the code generator and the code cache take it by
//! reference. Embedders replace the entries whose host routines cannot do
//! anything useful on their own (allocation, exception dispatch).

use std::fmt;

/// A runtime entry point reachable from compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeCall {
    IntDivide,
    IntRemainder,
    LongDivide,
    LongRemainder,
    /// `(hub) -> object`
    NewInstance,
    /// `(hub, length) -> array`; throws for a negative length.
    NewArray,
    /// `(object, hub) -> u32`, nonzero when the cast succeeds.
    CheckCast,
    ThrowNullPointer,
    ThrowArithmetic,
    ThrowClassCast,
    /// `(index)`
    ThrowIndexOutOfBounds,
    /// `(exception)`; never returns.
    UnwindException,
    /// Target of not-yet-linked direct calls.
    UnresolvedCall,
}

impl RuntimeCall {
    pub const COUNT: usize = 13;

    pub const ALL: [RuntimeCall; Self::COUNT] = [
        RuntimeCall::IntDivide,
        RuntimeCall::IntRemainder,
        RuntimeCall::LongDivide,
        RuntimeCall::LongRemainder,
        RuntimeCall::NewInstance,
        RuntimeCall::NewArray,
        RuntimeCall::CheckCast,
        RuntimeCall::ThrowNullPointer,
        RuntimeCall::ThrowArithmetic,
        RuntimeCall::ThrowClassCast,
        RuntimeCall::ThrowIndexOutOfBounds,
        RuntimeCall::UnwindException,
        RuntimeCall::UnresolvedCall,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Whether control returns to the caller.
    pub fn returns(self) -> bool {
        !matches!(
            self,
            RuntimeCall::ThrowNullPointer
                | RuntimeCall::ThrowArithmetic
                | RuntimeCall::ThrowClassCast
                | RuntimeCall::ThrowIndexOutOfBounds
                | RuntimeCall::UnwindException
        )
    }
}

impl fmt::Display for RuntimeCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Immutable map from runtime call to routine address.
#[derive(Clone, PartialEq, Eq)]
pub struct RuntimeCallTable {
    entries: [u64; RuntimeCall::COUNT],
}

impl RuntimeCallTable {
    /// Table pointing at the routines in this module.
    pub fn host() -> Self {
        let mut entries = [0u64; RuntimeCall::COUNT];
        for call in RuntimeCall::ALL {
            entries[call.index()] = match call {
                RuntimeCall::IntDivide => lirjit_int_divide as usize as u64,
                RuntimeCall::IntRemainder => lirjit_int_remainder as usize as u64,
                RuntimeCall::LongDivide => lirjit_long_divide as usize as u64,
                RuntimeCall::LongRemainder => lirjit_long_remainder as usize as u64,
                RuntimeCall::NewInstance => lirjit_new_instance as usize as u64,
                RuntimeCall::NewArray => lirjit_new_array as usize as u64,
                RuntimeCall::CheckCast => lirjit_check_cast as usize as u64,
                RuntimeCall::ThrowNullPointer => lirjit_throw_null_pointer as usize as u64,
                RuntimeCall::ThrowArithmetic => lirjit_throw_arithmetic as usize as u64,
                RuntimeCall::ThrowClassCast => lirjit_throw_class_cast as usize as u64,
                RuntimeCall::ThrowIndexOutOfBounds => lirjit_throw_index_out_of_bounds as usize as u64,
                RuntimeCall::UnwindException => lirjit_unwind_exception as usize as u64,
                RuntimeCall::UnresolvedCall => lirjit_unresolved_call as usize as u64,
            };
        }
        RuntimeCallTable { entries }
    }

    /// Replace one entry. Only meaningful before the table is shared.
    pub fn with_entry(mut self, call: RuntimeCall, address: u64) -> Self {
        self.entries[call.index()] = address;
        self
    }

    pub fn address(&self, call: RuntimeCall) -> u64 {
        self.entries[call.index()]
    }
}

impl fmt::Debug for RuntimeCallTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for call in RuntimeCall::ALL {
            map.entry(&call, &format_args!("{:#x}", self.address(call)));
        }
        map.finish()
    }
}

fn fatal(message: &str) -> ! {
    tracing::error!("fatal runtime call: {message}");
    std::process::abort()
}

// Divisors are checked for zero by the caller before these are reached.

pub extern "C" fn lirjit_int_divide(dividend: i32, divisor: i32) -> i32 {
    if divisor == 0 {
        fatal("int division by zero reached the runtime");
    }
    dividend.wrapping_div(divisor)
}

pub extern "C" fn lirjit_int_remainder(dividend: i32, divisor: i32) -> i32 {
    if divisor == 0 {
        fatal("int remainder by zero reached the runtime");
    }
    dividend.wrapping_rem(divisor)
}

pub extern "C" fn lirjit_long_divide(dividend: i64, divisor: i64) -> i64 {
    if divisor == 0 {
        fatal("long division by zero reached the runtime");
    }
    dividend.wrapping_div(divisor)
}

pub extern "C" fn lirjit_long_remainder(dividend: i64, divisor: i64) -> i64 {
    if divisor == 0 {
        fatal("long remainder by zero reached the runtime");
    }
    dividend.wrapping_rem(divisor)
}

extern "C" fn lirjit_new_instance(_hub: u64) -> u64 {
    fatal("no allocator installed for NewInstance")
}

extern "C" fn lirjit_new_array(_hub: u64, _length: i32) -> u64 {
    fatal("no allocator installed for NewArray")
}

extern "C" fn lirjit_check_cast(_object: u64, _hub: u64) -> u32 {
    fatal("no type checker installed for CheckCast")
}

extern "C" fn lirjit_throw_null_pointer() {
    fatal("NullPointerException with no exception dispatcher installed")
}

extern "C" fn lirjit_throw_arithmetic() {
    fatal("ArithmeticException with no exception dispatcher installed")
}

extern "C" fn lirjit_throw_class_cast() {
    fatal("ClassCastException with no exception dispatcher installed")
}

extern "C" fn lirjit_throw_index_out_of_bounds(index: i32) {
    fatal(&format!("ArrayIndexOutOfBoundsException ({index}) with no exception dispatcher installed"))
}

extern "C" fn lirjit_unwind_exception(_exception: u64) {
    fatal("exception thrown with no exception dispatcher installed")
}

extern "C" fn lirjit_unresolved_call() {
    fatal("call through an unlinked call site")
}
