//! Call graph construction and recursion detection.
//!
//! The graph holds `FuncId` indices into the module's function arena, never references to the
//! functions themselves, so passes can keep a graph alive while they rewrite bodies.
//!
//! Call targets are resolved with the same comparator the functions use for their own names:
//! both the qualified `module.name` spelling and the bare simple name resolve inside the owning
//! module. Comparing only simple names is exactly the failure that leaves recursion undetected
//! and misroutes calling-convention selection, so the comparator is tested both ways.
//!
//! Recursion is classified from the strongly connected components: a self-edge is direct
//! recursion, a two-node cycle is mutual, and a cycle of three or more nodes is indirect. The
//! shortest cycle through each recursive function is reported to the diagnostics sink.

use crate::diagnostic::{Diagnostics, OptRecord};
use crate::entity::{EntityRef, SecondaryMap};
use crate::mir::{FuncId, InstructionData, Module, Recursion};
use std::collections::VecDeque;

/// A directed call graph over the functions of one module.
pub struct CallGraph {
    succs: SecondaryMap<FuncId, Vec<FuncId>>,
    incoming: SecondaryMap<FuncId, u32>,
    num_funcs: usize,
}

impl CallGraph {
    /// Build the call graph of `module`.
    pub fn with_module(module: &Module) -> Self {
        let mut graph = Self {
            succs: SecondaryMap::new(),
            incoming: SecondaryMap::new(),
            num_funcs: module.funcs.len(),
        };
        for (id, func) in module.funcs.iter() {
            for &inst in &func.layout {
                match func.insts[inst] {
                    InstructionData::Call { func: ref callee, .. }
                    | InstructionData::SmcPatch { func: ref callee, .. } => {
                        if let Some(target) = module.find_function(callee) {
                            graph.succs[id].push(target);
                            graph.incoming[target] += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
        graph
    }

    /// The call targets of `func`, one entry per call site.
    pub fn callees(&self, func: FuncId) -> &[FuncId] {
        &self.succs[func]
    }

    /// Number of call sites targeting `func` across the module.
    pub fn call_site_count(&self, func: FuncId) -> u32 {
        self.incoming[func]
    }

    /// Compute strongly connected components with Tarjan's algorithm.
    ///
    /// Components are returned in reverse topological order; singleton components without a
    /// self-edge are included.
    pub fn sccs(&self) -> Vec<Vec<FuncId>> {
        let mut state = TarjanState {
            graph: self,
            index: 0,
            indices: SecondaryMap::with_default(UNVISITED),
            lowlink: SecondaryMap::new(),
            on_stack: SecondaryMap::new(),
            stack: Vec::new(),
            components: Vec::new(),
        };
        for raw in 0..self.num_funcs {
            let node = FuncId::new(raw);
            if state.indices[node] == UNVISITED {
                state.visit(node);
            }
        }
        state.components
    }

    /// Does the graph contain the edge `from -> to`?
    pub fn has_edge(&self, from: FuncId, to: FuncId) -> bool {
        self.succs[from].contains(&to)
    }

    /// Length in edges of the shortest cycle through `node`, if one exists.
    pub fn shortest_cycle(&self, node: FuncId) -> Option<usize> {
        if self.has_edge(node, node) {
            return Some(1);
        }
        // BFS back to the start.
        let mut dist: SecondaryMap<FuncId, u32> = SecondaryMap::with_default(u32::max_value());
        let mut queue = VecDeque::new();
        dist[node] = 0;
        queue.push_back(node);
        while let Some(current) = queue.pop_front() {
            for &next in &self.succs[current] {
                if next == node {
                    return Some(dist[current] as usize + 1);
                }
                if dist[next] == u32::max_value() {
                    dist[next] = dist[current] + 1;
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

const UNVISITED: u32 = u32::max_value();

struct TarjanState<'a> {
    graph: &'a CallGraph,
    index: u32,
    indices: SecondaryMap<FuncId, u32>,
    lowlink: SecondaryMap<FuncId, u32>,
    on_stack: SecondaryMap<FuncId, bool>,
    stack: Vec<FuncId>,
    components: Vec<Vec<FuncId>>,
}

impl<'a> TarjanState<'a> {
    fn visit(&mut self, node: FuncId) {
        self.indices[node] = self.index;
        self.lowlink[node] = self.index;
        self.index += 1;
        self.stack.push(node);
        self.on_stack[node] = true;

        for i in 0..self.graph.succs[node].len() {
            let next = self.graph.succs[node][i];
            if self.indices[next] == UNVISITED {
                self.visit(next);
                self.lowlink[node] = self.lowlink[node].min(self.lowlink[next]);
            } else if self.on_stack[next] {
                self.lowlink[node] = self.lowlink[node].min(self.indices[next]);
            }
        }

        if self.lowlink[node] == self.indices[node] {
            let mut component = Vec::new();
            loop {
                let popped = self.stack.pop().expect("tarjan stack underflow");
                self.on_stack[popped] = false;
                component.push(popped);
                if popped == node {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

/// Detect recursion and refresh the leaf flags across the module.
///
/// After this runs, every function with an intra-SCC edge has a non-`None` recursion class.
pub fn analyze_recursion(module: &mut Module, diag: &mut Diagnostics) -> CallGraph {
    let graph = CallGraph::with_module(module);
    let sccs = graph.sccs();

    let mut classes: SecondaryMap<FuncId, Recursion> = SecondaryMap::new();
    for component in &sccs {
        for &node in component {
            let recursive = component.len() >= 2 || graph.has_edge(node, node);
            if !recursive {
                continue;
            }
            let cycle = graph
                .shortest_cycle(node)
                .expect("recursive node has a cycle");
            classes[node] = match cycle {
                1 => Recursion::Direct,
                2 => Recursion::Mutual,
                _ => Recursion::Indirect,
            };
            let func = &module.funcs[node];
            diag.record(OptRecord {
                pass: "recursion",
                function: func.qualified_name(),
                site: None,
                rationale: format!("shortest cycle through {} call edges", cycle),
                before: String::new(),
                after: format!("{:?}", classes[node]),
                saved_tstates: 0,
                saved_bytes: 0,
            });
        }
    }

    for (id, func) in module.funcs.iter_mut() {
        func.recursion = classes[id];
        func.update_leaf_flag();
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{FuncName, FunctionBuilder, Signature, Type};

    fn add_func(module: &mut Module, name: &str, calls: &[&str]) -> FuncId {
        let mut b = FunctionBuilder::new(
            FuncName::new(module.name.clone(), name),
            Signature::new(),
        );
        let v = b.load_const(1, Type::U8);
        for callee in calls {
            b.call(*callee, &[v], None).unwrap();
        }
        b.ret(None);
        module.add_function(b.finish().unwrap())
    }

    #[test]
    fn direct_recursion_by_simple_name() {
        // A function that calls itself by its simple name inside its own module must still be
        // detected; the comparator accepts both spellings.
        let mut module = Module::new("math");
        let fact = add_func(&mut module, "fact", &["fact"]);
        let mut diag = Diagnostics::new();
        analyze_recursion(&mut module, &mut diag);
        assert_eq!(module.funcs[fact].recursion, Recursion::Direct);
        assert_eq!(diag.by_pass("recursion").count(), 1);
    }

    #[test]
    fn direct_recursion_by_qualified_name() {
        let mut module = Module::new("math");
        let fact = add_func(&mut module, "fact", &["math.fact"]);
        let mut diag = Diagnostics::new();
        analyze_recursion(&mut module, &mut diag);
        assert_eq!(module.funcs[fact].recursion, Recursion::Direct);
    }

    #[test]
    fn mutual_recursion() {
        let mut module = Module::new("m");
        let is_even = add_func(&mut module, "is_even", &["is_odd"]);
        let is_odd = add_func(&mut module, "is_odd", &["is_even"]);
        let mut diag = Diagnostics::new();
        analyze_recursion(&mut module, &mut diag);
        assert_eq!(module.funcs[is_even].recursion, Recursion::Mutual);
        assert_eq!(module.funcs[is_odd].recursion, Recursion::Mutual);
    }

    #[test]
    fn indirect_recursion_through_three() {
        let mut module = Module::new("m");
        let a = add_func(&mut module, "a", &["b"]);
        add_func(&mut module, "b", &["c"]);
        add_func(&mut module, "c", &["a"]);
        let mut diag = Diagnostics::new();
        let graph = analyze_recursion(&mut module, &mut diag);
        assert_eq!(module.funcs[a].recursion, Recursion::Indirect);
        assert_eq!(graph.shortest_cycle(a), Some(3));
    }

    #[test]
    fn non_recursive_stays_clean() {
        let mut module = Module::new("m");
        let main = add_func(&mut module, "main", &["helper"]);
        let helper = add_func(&mut module, "helper", &[]);
        let mut diag = Diagnostics::new();
        let graph = analyze_recursion(&mut module, &mut diag);
        assert_eq!(module.funcs[main].recursion, Recursion::None);
        assert!(module.funcs[helper].is_leaf);
        assert!(!module.funcs[main].is_leaf);
        assert_eq!(graph.call_site_count(helper), 1);
    }
}
