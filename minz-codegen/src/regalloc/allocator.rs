//! Three-tier register allocation for the Z80.
//!
//! Values are placed greedily by a linear scan over the live intervals: physical registers for
//! as long as they last, the shadow bank for call-free ranges when the physical tier is
//! exhausted (or freely inside interrupt handlers, which bracket themselves with `EXX`), and
//! fixed low-memory slots for everything else.
//!
//! Named locals and parameters get their low-memory homes here too, one address per slot in
//! declaration order. Addresses are handed out from a single bump pointer, so two distinct
//! slots can never share one; the allocator is the only place addresses come from.
//!
//! `A`, `H` and `L` are never handed out; the emitter needs the accumulators for staging.

use crate::diagnostic::{Diagnostics, OptRecord};
use crate::entity::SecondaryMap;
use crate::isa::z80::registers::{Reg, Reg16, Reg8};
use crate::mir::{Function, TypeStore, Value};
use crate::regalloc::liveness::Liveness;
use crate::regalloc::register_set::RegisterSet;
use crate::settings::Flags;
use std::collections::BTreeMap;

/// Spill everything past this many intervals rather than scanning.
const PRESSURE_LIMIT: usize = 160;

/// Where a value lives during execution.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Location {
    /// A main-bank register.
    Phys(Reg),
    /// The same register name in the alternate bank, reached through `EXX`.
    Shadow(Reg),
    /// A fixed low-memory address.
    Mem(u16),
}

/// The allocation result for one function.
pub struct Allocation {
    locations: SecondaryMap<Value, Option<Location>>,
    local_addrs: BTreeMap<String, u16>,
    /// First address past everything this function reserved.
    pub high_water: u16,
    /// True when pathological pressure forced the all-memory fallback.
    pub spilled_all: bool,
}

impl Allocation {
    /// The location of `value`. Total for every value referenced by the layout.
    pub fn location(&self, value: Value) -> Location {
        self.locations[value].expect("location assigned for every live value")
    }

    /// The location of `value`, when it has one.
    pub fn try_location(&self, value: Value) -> Option<Location> {
        self.locations[value]
    }

    /// Override the location of `value`. The emitter pins parameter reads to their incoming
    /// registers with this.
    pub fn set_location(&mut self, value: Value, location: Location) {
        self.locations[value] = Some(location);
    }

    /// The low-memory home of a named local or parameter.
    pub fn local_addr(&self, name: &str) -> Option<u16> {
        self.local_addrs.get(name).copied()
    }

    /// All named homes, in address order.
    pub fn named_homes(&self) -> impl Iterator<Item = (&str, u16)> {
        self.local_addrs.iter().map(|(name, &addr)| (name.as_str(), addr))
    }
}

/// Allocatable 8-bit registers.
///
/// Only B and C: A stages 8-bit arithmetic, H and L belong to the 16-bit accumulator and the
/// staging paths, and D/E carry incoming parameters and the 16-bit secondary operand.
const POOL_8: [(Reg, u16); 2] = [
    (Reg::R8(Reg8::B), 1 << 1),
    (Reg::R8(Reg8::C), 1 << 2),
];

/// Allocatable 16-bit pairs. BC only, for the same reasons.
const POOL_16: [(Reg, u16); 1] = [(Reg::R16(Reg16::BC), (1 << 1) | (1 << 2))];

/// Run allocation for `func`.
///
/// `reserved_units` is a unit mask the emitter needs untouched (incoming parameter registers,
/// for one). `base` is the low-memory tier base address for this target.
pub fn allocate(
    func: &Function,
    types: &TypeStore,
    base: u16,
    reserved_units: u16,
    flags: &Flags,
    diag: &mut Diagnostics,
) -> Allocation {
    let mut allocation = Allocation {
        locations: SecondaryMap::new(),
        local_addrs: BTreeMap::new(),
        high_water: base,
        spilled_all: false,
    };

    // Named homes first: parameters, then declared locals, in slot order.
    for param in &func.signature.params {
        let size = types.size_of(param.ty).max(1);
        allocation
            .local_addrs
            .insert(param.name.clone(), allocation.high_water);
        allocation.high_water += size;
    }
    for (_, local) in func.locals.iter() {
        let size = types.size_of(local.ty).max(1);
        allocation
            .local_addrs
            .insert(local.name.clone(), allocation.high_water);
        allocation.high_water += size;
    }

    let liveness = Liveness::compute(func);
    let intervals = liveness.intervals();

    if intervals.len() > PRESSURE_LIMIT {
        // Pathological pressure: give every value a memory slot and report it.
        for interval in intervals {
            let wide = !func.value_type(interval.value).is_byte();
            allocation.locations[interval.value] = Some(Location::Mem(allocation.high_water));
            allocation.high_water += if wide { 2 } else { 1 };
        }
        allocation.spilled_all = true;
        diag.record(OptRecord {
            pass: "regalloc",
            function: func.qualified_name(),
            site: None,
            rationale: format!(
                "register pressure over limit ({} intervals); spilled everything",
                intervals.len()
            ),
            before: String::new(),
            after: String::new(),
            saved_tstates: 0,
            saved_bytes: 0,
        });
        return allocation;
    }

    let mut phys = RegisterSet::with_units(!reserved_units & unit_mask_all());
    let mut shadow = RegisterSet::with_units(unit_mask_all());
    // Active assignments: (end position, unit mask, shadow tier).
    let mut active: Vec<(u32, u16, bool)> = Vec::new();

    let shadow_allowed = flags.enable_shadow || func.interrupt;

    for interval in intervals {
        // Expire ranges that ended before this one starts.
        active.retain(|&(end, mask, in_shadow)| {
            if end < interval.start {
                if in_shadow {
                    shadow.free(mask);
                } else {
                    phys.free(mask);
                }
                false
            } else {
                true
            }
        });

        let wide = !func.value_type(interval.value).is_byte();
        let pool: &[(Reg, u16)] = if wide { &POOL_16 } else { &POOL_8 };

        // Tier 1: physical, unless the range crosses a call (caller-saved set).
        let choice = if interval.crosses_call {
            None
        } else {
            phys.first_avail(pool)
        };
        if let Some(reg) = choice {
            phys.take(reg.mask());
            active.push((interval.end, reg.mask(), false));
            allocation.locations[interval.value] = Some(Location::Phys(reg));
            continue;
        }

        // Tier 2: shadow, for call-free ranges (an interrupt handler's whole body counts).
        let shadow_ok = shadow_allowed && (func.interrupt || !interval.crosses_call);
        if shadow_ok {
            if let Some(reg) = shadow.first_avail(pool) {
                shadow.take(reg.mask());
                active.push((interval.end, reg.mask(), true));
                allocation.locations[interval.value] = Some(Location::Shadow(reg));
                continue;
            }
        }

        // Tier 3: a fixed low-memory slot of its own.
        allocation.locations[interval.value] = Some(Location::Mem(allocation.high_water));
        allocation.high_water += if wide { 2 } else { 1 };
    }

    allocation
}

fn unit_mask_all() -> u16 {
    POOL_8.iter().map(|&(_, m)| m).fold(0, |acc, m| acc | m)
        | POOL_16.iter().map(|&(_, m)| m).fold(0, |acc, m| acc | m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Diagnostics;
    use crate::mir::{FuncName, FunctionBuilder, Opcode, Signature, Type};
    use std::collections::HashSet;

    fn flags() -> Flags {
        Flags::default()
    }

    #[test]
    fn distinct_locals_get_distinct_addresses() {
        let mut b = FunctionBuilder::new(FuncName::new("m", "three"), {
            let mut sig = Signature::new();
            sig.ret = Some(Type::U8);
            sig
        });
        b.declare_local("a", Type::U8).unwrap();
        b.declare_local("b", Type::U8).unwrap();
        b.declare_local("c", Type::U8).unwrap();
        let v = b.load_const(10, Type::U8);
        b.store_var("a", v).unwrap();
        b.ret(Some(v));
        let func = b.finish().unwrap();

        let types = TypeStore::new();
        let mut diag = Diagnostics::new();
        let allocation = allocate(&func, &types, 0xF000, 0, &flags(), &mut diag);

        let addrs: HashSet<u16> = ["a", "b", "c"]
            .iter()
            .map(|name| allocation.local_addr(name).unwrap())
            .collect();
        assert_eq!(addrs.len(), 3, "every local has its own address");
        assert!(addrs.iter().all(|&addr| addr >= 0xF000));
    }

    #[test]
    fn wide_locals_advance_by_two() {
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), Signature::new());
        b.declare_local("w", Type::U16).unwrap();
        b.declare_local("n", Type::U8).unwrap();
        b.ret(None);
        let func = b.finish().unwrap();

        let types = TypeStore::new();
        let mut diag = Diagnostics::new();
        let allocation = allocate(&func, &types, 0xF000, 0, &flags(), &mut diag);
        assert_eq!(allocation.local_addr("w"), Some(0xF000));
        assert_eq!(allocation.local_addr("n"), Some(0xF002));
    }

    #[test]
    fn call_crossing_values_avoid_registers() {
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), Signature::new());
        let v = b.load_const(1, Type::U8);
        b.call("m.g", &[], None).unwrap();
        b.store_var("x", v).unwrap();
        b.ret(None);
        let func = b.finish().unwrap();

        let types = TypeStore::new();
        let mut diag = Diagnostics::new();
        // Shadow off so the value has to take memory.
        let flags = Flags::builder().enable_shadow(false).build();
        let allocation = allocate(&func, &types, 0xF000, 0, &flags, &mut diag);
        match allocation.location(v) {
            Location::Mem(addr) => assert!(addr >= 0xF000),
            other => panic!("expected memory slot, got {:?}", other),
        }
    }

    #[test]
    fn pressure_limit_spills_everything() {
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), Signature::new());
        let mut last = b.load_const(0, Type::U8);
        for i in 1..200 {
            let c = b.load_const(i, Type::U8);
            last = b.binary(Opcode::Add, last, c).unwrap();
        }
        b.store_var("out", last).unwrap();
        b.ret(None);
        let func = b.finish().unwrap();

        let types = TypeStore::new();
        let mut diag = Diagnostics::new();
        let allocation = allocate(&func, &types, 0xF000, 0, &flags(), &mut diag);
        assert!(allocation.spilled_all);
        assert_eq!(diag.by_pass("regalloc").count(), 1);
        assert!(matches!(allocation.location(last), Location::Mem(_)));
    }

    #[test]
    fn overflow_spills_to_the_shadow_bank() {
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), {
            let mut sig = Signature::new();
            sig.ret = Some(Type::U8);
            sig
        });
        for name in ["x", "y", "z"] {
            b.declare_local(name, Type::U8).unwrap();
        }
        // Three overlapping call-free ranges; only two physical registers exist.
        let x = b.load_var("x", Type::U8).unwrap();
        let y = b.load_var("y", Type::U8).unwrap();
        let z = b.load_var("z", Type::U8).unwrap();
        let xy = b.binary(Opcode::Add, x, y).unwrap();
        let xyz = b.binary(Opcode::Add, xy, z).unwrap();
        b.ret(Some(xyz));
        let func = b.finish().unwrap();

        let types = TypeStore::new();
        let mut diag = Diagnostics::new();
        let allocation = allocate(&func, &types, 0xF000, 0, &flags(), &mut diag);
        assert!(matches!(allocation.location(x), Location::Phys(_)));
        assert!(matches!(allocation.location(y), Location::Phys(_)));
        assert!(matches!(allocation.location(z), Location::Shadow(_)));

        // With the shadow tier off, the third range takes memory instead.
        let no_shadow = Flags::builder().enable_shadow(false).build();
        let mut diag = Diagnostics::new();
        let allocation = allocate(&func, &types, 0xF000, 0, &no_shadow, &mut diag);
        assert!(matches!(allocation.location(z), Location::Mem(_)));
    }

    #[test]
    fn registers_are_reused_after_expiry() {
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), Signature::new());
        // Two short, disjoint ranges can share one register.
        let a = b.load_const(1, Type::U8);
        b.store_var("x", a).unwrap();
        let c = b.load_const(2, Type::U8);
        b.store_var("y", c).unwrap();
        b.ret(None);
        let func = b.finish().unwrap();

        let types = TypeStore::new();
        let mut diag = Diagnostics::new();
        let allocation = allocate(&func, &types, 0xF000, 0, &flags(), &mut diag);
        assert_eq!(allocation.location(a), allocation.location(c));
    }
}
