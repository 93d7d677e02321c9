//! Live intervals over the linear layout.
//!
//! Values are single-definition and loop back-edges re-enter through named locals, so a value's
//! live range is exactly the span from its defining position to its last use in layout order.
//! That keeps the intervals linear and the allocator a straightforward scan.

use crate::entity::SecondaryMap;
use crate::mir::{Function, Value};

/// The live interval of one value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    /// The value.
    pub value: Value,
    /// Layout position of the definition.
    pub start: u32,
    /// Layout position of the last use. Equal to `start` for unused values.
    pub end: u32,
    /// Number of uses; the allocator's notion of heat.
    pub uses: u32,
    /// Does the range cross a call? Physical registers are caller-saved, so such values
    /// cannot live in them.
    pub crosses_call: bool,
}

impl Interval {
    /// Do two intervals overlap?
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Live intervals for all values of a function, ordered by start position.
pub struct Liveness {
    intervals: Vec<Interval>,
}

impl Liveness {
    /// Compute intervals for `func`.
    pub fn compute(func: &Function) -> Self {
        let mut starts: SecondaryMap<Value, u32> = SecondaryMap::with_default(u32::max_value());
        let mut ends: SecondaryMap<Value, u32> = SecondaryMap::new();
        let mut uses: SecondaryMap<Value, u32> = SecondaryMap::new();
        let mut call_positions = Vec::new();

        for (pos, inst) in func.layout_iter() {
            let pos = pos as u32;
            let data = &func.insts[inst];
            if data.opcode().is_call() {
                call_positions.push(pos);
            }
            for arg in data.arguments() {
                ends[arg] = pos;
                uses[arg] += 1;
            }
            if let Some(result) = func.inst_result(inst) {
                starts[result] = pos;
                if ends[result] < pos {
                    ends[result] = pos;
                }
            }
        }

        let mut intervals = Vec::new();
        for (value, _) in func.values.iter() {
            let start = starts[value];
            if start == u32::max_value() {
                // Dangling value with no definition in the layout; nothing to allocate.
                continue;
            }
            let end = ends[value].max(start);
            let crosses_call = call_positions.iter().any(|&call| start < call && call < end);
            intervals.push(Interval {
                value,
                start,
                end,
                uses: uses[value],
                crosses_call,
            });
        }
        intervals.sort_unstable_by_key(|interval| interval.start);
        Self { intervals }
    }

    /// The intervals, ordered by start position.
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{FuncName, FunctionBuilder, Opcode, Signature, Type};

    #[test]
    fn ranges_span_def_to_last_use() {
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), {
            let mut sig = Signature::new();
            sig.ret = Some(Type::U8);
            sig
        });
        let a = b.load_const(1, Type::U8); // pos 0
        let c = b.load_const(2, Type::U8); // pos 1
        let sum = b.binary(Opcode::Add, a, c).unwrap(); // pos 2
        let sum2 = b.binary(Opcode::Add, sum, a).unwrap(); // pos 3: last use of a
        b.ret(Some(sum2)); // pos 4
        let func = b.finish().unwrap();

        let liveness = Liveness::compute(&func);
        let of = |v| {
            *liveness
                .intervals()
                .iter()
                .find(|i| i.value == v)
                .unwrap()
        };
        assert_eq!(of(a).start, 0);
        assert_eq!(of(a).end, 3);
        assert_eq!(of(a).uses, 2);
        assert_eq!(of(c).end, 2);
        assert_eq!(of(sum2).end, 4);
        assert!(!of(a).crosses_call);
    }

    #[test]
    fn call_crossing_is_flagged() {
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), Signature::new());
        let a = b.load_const(1, Type::U8); // pos 0
        b.call("m.g", &[], None).unwrap(); // pos 1
        b.store_var("x", a).unwrap(); // pos 2
        b.ret(None);
        let func = b.finish().unwrap();

        let liveness = Liveness::compute(&func);
        let interval = liveness.intervals().iter().find(|i| i.value == a).unwrap();
        assert!(interval.crosses_call);
    }
}
