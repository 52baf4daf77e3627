//! Counter budget probe via the architectural performance monitoring leaf.

use super::CounterBudget;

/// CPUID leaf describing architectural performance monitoring.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const PERFMON_LEAF: u32 = 0x0A;

/// Decode CPUID leaf 0x0A registers into a counter budget.
///
/// EAX[7:0] is the PMU version, EAX[15:8] the number of general-purpose
/// counters per logical processor. EDX[4:0] holds the fixed counter count,
/// defined from version 2 onwards.
pub fn decode(eax: u32, edx: u32) -> CounterBudget {
    let version = eax & 0xFF;
    let general_slots = ((eax >> 8) & 0xFF) as usize;
    let fixed_slots = if version > 1 {
        (edx & 0x1F) as usize
    } else {
        0
    };

    CounterBudget {
        fixed_slots,
        general_slots,
    }
}

/// Read the counter budget of the current processor.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn probe() -> Result<CounterBudget, String> {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::{__cpuid, __get_cpuid_max};
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::{__cpuid, __get_cpuid_max};

    // Safety: CPUID is available on every x86_64 processor and on every x86
    // processor this crate supports; the leaf is bounds-checked first.
    #[allow(unused_unsafe)]
    let (max_leaf, _) = unsafe { __get_cpuid_max(0) };
    if max_leaf < PERFMON_LEAF {
        return Err(format!(
            "cpuid leaf {PERFMON_LEAF:#x} not supported (max {max_leaf:#x})"
        ));
    }

    #[allow(unused_unsafe)]
    let regs = unsafe { __cpuid(PERFMON_LEAF) };
    if regs.eax & 0xFF == 0 {
        return Err("architectural performance monitoring not supported".to_string());
    }

    Ok(decode(regs.eax, regs.edx))
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn probe() -> Result<CounterBudget, String> {
    Err("counter probe is only supported on x86".to_string())
}
