//! Per-architecture register tables.
//!
//! A suspended thread may hold the only reference to an object in a register
//! that has not been spilled yet, so every register that can carry a pointer
//! is pushed as a root. Which registers those are is the only
//! architecture-specific knowledge the scanner needs; it lives in one table
//! per architecture, and the rest of the crate works on [`RegisterContext`].

use core_types::{approximate_sp, Address};

/// The pointer-carrying registers of one architecture, in push order.
#[derive(Debug, PartialEq, Eq)]
pub struct ArchTable {
    /// Architecture name as used by `cfg(target_arch)`.
    pub name: &'static str,
    /// Registers pushed as roots.
    pub registers: &'static [&'static str],
    /// The stack pointer register.
    pub stack_pointer: &'static str,
}

/// x86-64.
pub static X86_64: ArchTable = ArchTable {
    name: "x86_64",
    registers: &[
        "rax", "rcx", "rdx", "rbx", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
        "r14", "r15",
    ],
    stack_pointer: "rsp",
};

/// 32-bit x86.
pub static X86: ArchTable = ArchTable {
    name: "x86",
    registers: &["edi", "esi", "ebx", "edx", "ecx", "eax", "ebp"],
    stack_pointer: "esp",
};

/// 32-bit ARM.
pub static ARM: ArchTable = ArchTable {
    name: "arm",
    registers: &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12",
    ],
    stack_pointer: "sp",
};

/// AArch64.
pub static AARCH64: ArchTable = ArchTable {
    name: "aarch64",
    registers: &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "lr",
    ],
    stack_pointer: "sp",
};

/// SuperH.
pub static SH: ArchTable = ArchTable {
    name: "sh",
    registers: &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13",
        "r14",
    ],
    stack_pointer: "r15",
};

/// MIPS.
pub static MIPS: ArchTable = ArchTable {
    name: "mips",
    registers: &[
        "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7",
        "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "s8",
    ],
    stack_pointer: "sp",
};

/// 32-bit PowerPC.
pub static POWERPC: ArchTable = ArchTable {
    name: "powerpc",
    registers: &[
        "r0", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r14", "r15", "r16",
        "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26", "r27", "r28", "r29",
        "r30", "r31",
    ],
    stack_pointer: "r1",
};

/// Alpha.
pub static ALPHA: ArchTable = ArchTable {
    name: "alpha",
    registers: &[
        "v0", "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7", "s0", "s1", "s2", "s3", "s4", "s5",
        "fp", "a0", "a1", "a2", "a3", "a4", "a5", "t8", "t9", "t10", "t11", "t12", "at",
    ],
    stack_pointer: "sp",
};

static TABLES: [&ArchTable; 8] = [
    &X86_64, &X86, &ARM, &AARCH64, &SH, &MIPS, &POWERPC, &ALPHA,
];

/// Looks up a table by architecture name.
pub fn table_for(name: &str) -> Option<&'static ArchTable> {
    TABLES.iter().copied().find(|table| table.name == name)
}

/// The table for the architecture this crate was built for.
///
/// Unknown architectures get an empty table: only stacks are scanned.
pub fn host_table() -> &'static ArchTable {
    static GENERIC: ArchTable = ArchTable {
        name: "generic",
        registers: &[],
        stack_pointer: "sp",
    };
    table_for(std::env::consts::ARCH).unwrap_or(&GENERIC)
}

/// Register snapshot of a stopped thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterContext {
    table: &'static ArchTable,
    sp: Address,
    values: Vec<usize>,
}

impl RegisterContext {
    /// An all-zero snapshot with the given stack pointer.
    pub fn new(table: &'static ArchTable, sp: Address) -> Self {
        RegisterContext {
            table,
            sp,
            values: vec![0; table.registers.len()],
        }
    }

    /// Sets a register by name. Returns false if the table has no such
    /// register.
    pub fn set(&mut self, name: &str, value: usize) -> bool {
        match self.table.registers.iter().position(|r| *r == name) {
            Some(index) => {
                self.values[index] = value;
                true
            }
            None => false,
        }
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, name: &str, value: usize) -> Self {
        self.set(name, value);
        self
    }

    /// Reads a register by name.
    pub fn get(&self, name: &str) -> Option<usize> {
        let index = self.table.registers.iter().position(|r| *r == name)?;
        Some(self.values[index])
    }

    /// The captured stack pointer.
    pub fn sp(&self) -> Address {
        self.sp
    }

    /// The table this snapshot follows.
    pub fn table(&self) -> &'static ArchTable {
        self.table
    }

    /// Captures the calling thread: its approximate stack pointer and the
    /// callee-saved registers, which are the only ones that can still hold
    /// values the caller has not spilled.
    #[inline(never)]
    pub fn capture_current() -> Self {
        let mut context = RegisterContext::new(host_table(), approximate_sp());
        for (name, value) in callee_saved() {
            context.set(name, value);
        }
        context
    }
}

/// The word-sized root values of a snapshot, in table order.
pub fn capture_register_roots(context: &RegisterContext) -> &[usize] {
    &context.values
}

/// Reads one register. Each read is its own asm block so the output operand
/// can never alias a register read later.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
macro_rules! read_register {
    ($reg:literal) => {{
        let value: usize;
        // SAFETY: a register-to-register move; no memory or stack access.
        unsafe {
            std::arch::asm!(
                concat!("mov {}, ", $reg),
                out(reg) value,
                options(nomem, nostack, preserves_flags),
            );
        }
        value
    }};
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn callee_saved() -> Vec<(&'static str, usize)> {
    vec![
        ("rbx", read_register!("rbx")),
        ("rbp", read_register!("rbp")),
        ("r12", read_register!("r12")),
        ("r13", read_register!("r13")),
        ("r14", read_register!("r14")),
        ("r15", read_register!("r15")),
    ]
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn callee_saved() -> Vec<(&'static str, usize)> {
    vec![
        ("x19", read_register!("x19")),
        ("x20", read_register!("x20")),
        ("x21", read_register!("x21")),
        ("x22", read_register!("x22")),
        ("x23", read_register!("x23")),
        ("x24", read_register!("x24")),
        ("x25", read_register!("x25")),
        ("x26", read_register!("x26")),
        ("x27", read_register!("x27")),
        ("x28", read_register!("x28")),
        ("lr", read_register!("x30")),
    ]
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn callee_saved() -> Vec<(&'static str, usize)> {
    Vec::new()
}
