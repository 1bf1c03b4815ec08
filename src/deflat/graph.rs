//! The dispatcher block graph and its reduction passes.

use std::collections::HashSet;
use std::fmt::Write as _;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::deflat::block::{DeflatBlock, DispatchWalker, Fork};
use crate::deflat::predicate::PredicateAnalyser;
use crate::deflat::state::FlatState;
use crate::error::{Error, Result};
use crate::solver::SolverBackend;

/// Edge kinds in the block graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Taken when the fork condition is truthy.
    True,
    /// Taken when the fork condition is falsy.
    False,
    /// Unconditional fallthrough.
    Uncond,
}

/// Control-flow graph over [`DeflatBlock`]s.
///
/// Node 0 is the exit sentinel reached when the dispatcher test turns
/// false; node 1 is the start block seeded from the `for` initializer.
/// Reduction passes detach nodes rather than removing them, so indices
/// stay stable.
pub struct DeflatGraph<'a> {
    pub graph: DiGraph<DeflatBlock<'a>, EdgeKind>,
    pub exit: NodeIndex,
    pub start: NodeIndex,
}

impl<'a> DeflatGraph<'a> {
    /// Symbolically execute the dispatcher from `initial_state`.
    pub fn build<'s>(
        walker: &DispatchWalker<'a, 's>,
        initial_state: FlatState,
    ) -> Result<DeflatGraph<'a>> {
        let mut graph = DiGraph::new();
        let exit = graph.add_node(DeflatBlock::exit_sentinel());
        let mut this = DeflatGraph {
            graph,
            exit,
            start: exit,
        };
        this.start = this.build_block(walker, initial_state)?;
        log::info!(
            "built {} dispatcher block(s)",
            this.graph.node_count().saturating_sub(1)
        );
        Ok(this)
    }

    fn build_block<'s>(
        &mut self,
        walker: &DispatchWalker<'a, 's>,
        state: FlatState,
    ) -> Result<NodeIndex> {
        if !walker.loop_continues(&state)? {
            return Ok(self.exit);
        }

        let mut block = DeflatBlock::with_state(state);
        walker.walk_iteration(&mut block)?;

        // Merge with any block already produced for this switching state;
        // blocks still on the recursion stack participate, which is what
        // closes loops.
        for node in self.graph.node_indices() {
            if node == self.exit {
                continue;
            }
            if self.graph[node].switching_state == block.switching_state {
                return Ok(node);
            }
        }

        let fork = block.fork.clone();
        let fall_state = block.state.clone();
        let jumps_out = block.jump_out.is_some();
        let node = self.graph.add_node(block);

        if jumps_out {
            // Terminal: control has left the dispatcher.
        } else if let Some(Fork {
            true_state,
            false_state,
            ..
        }) = fork
        {
            let true_node = self.build_block(walker, true_state)?;
            let false_node = self.build_block(walker, false_state)?;
            self.graph.add_edge(node, true_node, EdgeKind::True);
            self.graph.add_edge(node, false_node, EdgeKind::False);
        } else {
            let next = self.build_block(walker, fall_state)?;
            self.graph.add_edge(node, next, EdgeKind::Uncond);
        }
        Ok(node)
    }

    pub fn block(&self, node: NodeIndex) -> &DeflatBlock<'a> {
        &self.graph[node]
    }

    /// Successors ordered True, then False, then unconditional.
    pub fn ordered_successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut edges: Vec<(EdgeKind, NodeIndex)> = self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| (*e.weight(), e.target()))
            .collect();
        edges.sort_by_key(|(kind, _)| match kind {
            EdgeKind::True => 0,
            EdgeKind::False => 1,
            EdgeKind::Uncond => 2,
        });
        edges.into_iter().map(|(_, target)| target).collect()
    }

    pub fn predecessors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut preds: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        preds.sort();
        preds.dedup();
        preds
    }

    pub fn edge_kind(&self, from: NodeIndex, to: NodeIndex) -> Option<EdgeKind> {
        self.graph
            .edges_directed(from, Direction::Outgoing)
            .find(|e| e.target() == to)
            .map(|e| *e.weight())
    }

    /// Prune forks whose condition the solver proves one-sided. Returns
    /// the number of forks demoted to straight edges.
    pub fn optimize_bogus_fork(&mut self, backend: &mut dyn SolverBackend) -> Result<usize> {
        let mut pruned = 0;
        loop {
            let Some((node, keep_true)) = self.find_bogus_fork(backend)? else {
                break;
            };
            let drop_kind = if keep_true { EdgeKind::False } else { EdgeKind::True };
            let dropped = self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .find(|e| *e.weight() == drop_kind)
                .map(|e| e.id());
            let kept = self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .find(|e| *e.weight() != drop_kind)
                .map(|e| e.id());
            let (Some(dropped), Some(kept)) = (dropped, kept) else {
                return Err(Error::internal("fork node lost its branch edges"));
            };
            // Rewrite the kept edge before the removal; `remove_edge`
            // invalidates the last edge index.
            self.graph[kept] = EdgeKind::Uncond;
            self.graph.remove_edge(dropped);

            let block = &mut self.graph[node];
            if let Some(fork) = block.fork.take() {
                block.bogus_fork = Some(fork.test);
            }
            pruned += 1;
            log::debug!(
                "pruned bogus fork at block {} (always {})",
                node.index(),
                keep_true
            );
        }
        if pruned > 0 {
            log::info!("optimized {pruned} bogus fork(s)");
        }
        Ok(pruned)
    }

    /// First decidable fork reachable from the start block.
    fn find_bogus_fork(
        &self,
        backend: &mut dyn SolverBackend,
    ) -> Result<Option<(NodeIndex, bool)>> {
        let mut visited = HashSet::new();
        let mut stack = vec![self.start];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) || node == self.exit {
                continue;
            }
            if self.graph[node].fork.is_some() {
                let analyser = PredicateAnalyser::new(self, node);
                if let Some(always) = analyser.analyse(backend)? {
                    return Ok(Some((node, always)));
                }
            }
            for succ in self.ordered_successors(node) {
                stack.push(succ);
            }
        }
        Ok(None)
    }

    /// Detach blocks that lost all predecessors but still point at
    /// successors. Returns the number of blocks detached.
    pub fn optimize_unreachable_block(&mut self) -> usize {
        let mut detached = 0;
        let nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        for node in nodes {
            if node == self.exit || node == self.start {
                continue;
            }
            let has_preds = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .next()
                .is_some();
            let out_edges: Vec<_> = self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .map(|e| e.id())
                .collect();
            if !has_preds && !out_edges.is_empty() {
                for edge in out_edges {
                    self.graph.remove_edge(edge);
                }
                detached += 1;
            }
        }
        if detached > 0 {
            log::info!("detached {detached} unreachable block(s)");
        }
        detached
    }

    /// Re-link around blocks that carry no residual code and have exactly
    /// one successor. Returns the number of blocks elided.
    pub fn optimize_empty_block(&mut self) -> usize {
        let mut elided = 0;
        let nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        for node in nodes {
            if node == self.exit {
                continue;
            }
            if !self.graph[node].is_empty() {
                continue;
            }
            let succs = self.ordered_successors(node);
            if succs.len() != 1 || succs[0] == node {
                continue;
            }
            let target = succs[0];

            if node == self.start {
                self.start = target;
                let out: Vec<_> = self
                    .graph
                    .edges_directed(node, Direction::Outgoing)
                    .map(|e| e.id())
                    .collect();
                for edge in out {
                    self.graph.remove_edge(edge);
                }
                elided += 1;
                continue;
            }

            let incoming: Vec<(NodeIndex, EdgeKind, _)> = self
                .graph
                .edges_directed(node, Direction::Incoming)
                .map(|e| (e.source(), *e.weight(), e.id()))
                .collect();
            if incoming.is_empty() {
                // Already detached; nothing to re-link.
                continue;
            }
            for (source, kind, edge) in incoming {
                self.graph.remove_edge(edge);
                self.graph.add_edge(source, target, kind);
            }
            let out: Vec<_> = self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .map(|e| e.id())
                .collect();
            for edge in out {
                self.graph.remove_edge(edge);
            }
            elided += 1;
        }
        if elided > 0 {
            log::info!("elided {elided} empty block(s)");
        }
        elided
    }

    /// Run all reduction passes to a fixed point.
    pub fn reduce(&mut self, backend: &mut dyn SolverBackend) -> Result<()> {
        loop {
            let mut changed = 0;
            changed += self.optimize_bogus_fork(backend)?;
            changed += self.optimize_unreachable_block();
            changed += self.optimize_empty_block();
            if changed == 0 {
                return Ok(());
            }
        }
    }

    /// Graphviz rendering of the current graph shape.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph deflat {\n");
        for node in self.graph.node_indices() {
            let block = &self.graph[node];
            let label = if block.is_exit {
                "exit".to_string()
            } else {
                let mut label = format!(
                    "b{}: {} stmt(s)",
                    node.index(),
                    block.residual.len()
                );
                if let Some(state) = &block.switching_state {
                    let pairs: Vec<String> =
                        state.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
                    let _ = write!(label, "\\n{}", pairs.join(", "));
                }
                if block.fork.is_some() {
                    label.push_str("\\nfork");
                }
                if block.jump_out.is_some() {
                    label.push_str("\\njump-out");
                }
                label
            };
            let _ = writeln!(out, "    {} [label=\"{}\"];", node.index(), label);
        }
        for edge in self.graph.edge_indices() {
            if let Some((from, to)) = self.graph.edge_endpoints(edge) {
                let style = match self.graph[edge] {
                    EdgeKind::True => " [label=\"T\"]",
                    EdgeKind::False => " [label=\"F\"]",
                    EdgeKind::Uncond => "",
                };
                let _ = writeln!(out, "    {} -> {}{};", from.index(), to.index(), style);
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflat::block::Residual;
    use crate::solver::EnumerationBackend;
    use oxc_allocator::Allocator;
    use oxc_parser::Parser;
    use oxc_span::SourceType;

    fn graph_with_chain<'a>(
        stmts: &[&'a oxc_ast::ast::Statement<'a>],
    ) -> DeflatGraph<'a> {
        // exit <- bN <- ... <- b1(start)
        let mut graph = DiGraph::new();
        let exit = graph.add_node(DeflatBlock::exit_sentinel());
        let mut this = DeflatGraph {
            graph,
            exit,
            start: exit,
        };
        let mut nodes = Vec::new();
        for stmt in stmts {
            let mut block = DeflatBlock::default();
            block.residual.push(Residual::Stmt(stmt));
            block.switching_state = Some(FlatState::new());
            nodes.push(this.graph.add_node(block));
        }
        for pair in nodes.windows(2) {
            this.graph.add_edge(pair[0], pair[1], EdgeKind::Uncond);
        }
        if let Some(last) = nodes.last() {
            this.graph.add_edge(*last, exit, EdgeKind::Uncond);
        }
        this.start = nodes.first().copied().unwrap_or(exit);
        this
    }

    #[test]
    fn test_empty_block_elision_relinks_predecessors() {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "a(); b();", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let mut g = graph_with_chain(&[&program.body[0], &program.body[1]]);

        // Insert an empty block between the two residual blocks.
        let empty = g.graph.add_node(DeflatBlock::default());
        let n1 = NodeIndex::new(1);
        let n2 = NodeIndex::new(2);
        let old = g
            .graph
            .find_edge(n1, n2)
            .expect("chain edge present");
        g.graph.remove_edge(old);
        g.graph.add_edge(n1, empty, EdgeKind::Uncond);
        g.graph.add_edge(empty, n2, EdgeKind::Uncond);

        assert_eq!(g.optimize_empty_block(), 1);
        assert_eq!(g.ordered_successors(n1), vec![n2]);
        assert!(g.ordered_successors(empty).is_empty());
        // Second run is a no-op.
        assert_eq!(g.optimize_empty_block(), 0);
    }

    #[test]
    fn test_unreachable_block_detached() {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "a(); b();", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let mut g = graph_with_chain(&[&program.body[0]]);

        // A stray block pointing into the live chain but never entered.
        let mut stray_block = DeflatBlock::default();
        stray_block.residual.push(Residual::Stmt(&program.body[1]));
        let stray = g.graph.add_node(stray_block);
        g.graph.add_edge(stray, NodeIndex::new(1), EdgeKind::Uncond);

        assert_eq!(g.optimize_unreachable_block(), 1);
        assert!(g.ordered_successors(stray).is_empty());
        assert_eq!(g.optimize_unreachable_block(), 0);
        // The live chain survives untouched.
        assert_eq!(g.ordered_successors(NodeIndex::new(1)), vec![g.exit]);
    }

    #[test]
    fn test_bogus_fork_pruning_survives_edge_removal() {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "r = 7; r > 3; t(); f();", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let test_expr = match &program.body[1] {
            oxc_ast::ast::Statement::ExpressionStatement(stmt) => &stmt.expression,
            other => panic!("fixture statement 1 is not an expression: {other:?}"),
        };

        let mut graph = DiGraph::new();
        let exit = graph.add_node(DeflatBlock::exit_sentinel());
        let mut fork_block = DeflatBlock::default();
        fork_block.residual.push(Residual::Stmt(&program.body[0]));
        fork_block.switching_state = Some(FlatState::new());
        fork_block.fork = Some(Fork {
            test: test_expr,
            true_state: FlatState::new(),
            false_state: FlatState::new(),
        });
        let b1 = graph.add_node(fork_block);
        let mut true_block = DeflatBlock::default();
        true_block.residual.push(Residual::Stmt(&program.body[2]));
        true_block.switching_state = Some(FlatState::new());
        let b2 = graph.add_node(true_block);
        let mut false_block = DeflatBlock::default();
        false_block.residual.push(Residual::Stmt(&program.body[3]));
        false_block.switching_state = Some(FlatState::new());
        let b3 = graph.add_node(false_block);

        // The kept True edge is added last so it holds the highest edge
        // index when its sibling is removed.
        graph.add_edge(b1, b3, EdgeKind::False);
        graph.add_edge(b2, exit, EdgeKind::Uncond);
        graph.add_edge(b3, exit, EdgeKind::Uncond);
        graph.add_edge(b1, b2, EdgeKind::True);

        let mut g = DeflatGraph {
            graph,
            exit,
            start: b1,
        };
        // r = 7 makes r > 3 one-sided; the False edge is dropped.
        let pruned = g
            .optimize_bogus_fork(&mut EnumerationBackend::new())
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(g.ordered_successors(b1), vec![b2]);
        assert_eq!(g.edge_kind(b1, b2), Some(EdgeKind::Uncond));
        assert!(g.block(b1).fork.is_none());
        assert!(g.block(b1).bogus_fork.is_some());
        // The untouched edges keep their endpoints.
        assert_eq!(g.ordered_successors(b2), vec![g.exit]);
        assert_eq!(g.ordered_successors(b3), vec![g.exit]);
    }

    #[test]
    fn test_dot_export_mentions_all_blocks() {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "a();", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let g = graph_with_chain(&[&program.body[0]]);
        let dot = g.to_dot();
        assert!(dot.contains("digraph deflat"));
        assert!(dot.contains("exit"));
        assert!(dot.contains("b1: 1 stmt(s)"));
    }
}
