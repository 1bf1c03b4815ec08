//! Recovery of structured control flow from the reduced block graph.
//!
//! The recovery walks the graph once, consuming every edge exactly once.
//! Straight-line blocks accumulate into sequences; a fork either closes at
//! a converge node (an `if`), or one side escapes the enclosing scope (an
//! "if-escape" whose staying side continues the sequence); a node with an
//! unconsumed incoming edge is a loop header whose body is the set of
//! nodes backward-reachable from the back edge. Edge revisits and
//! ambiguous convergence make the graph ill-formed and abort recovery.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::graph::NodeIndex;

use crate::deflat::graph::DeflatGraph;
use crate::error::{Error, Result};

/// How an escaping branch leaves its enclosing loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Continue,
    Break,
}

/// Structured control-flow tree over graph nodes. Block contents stay in
/// the graph; the tree holds indices only.
#[derive(Debug)]
pub enum Element {
    /// Residual code of one graph node.
    Block(NodeIndex),
    Seq(Vec<Element>),
    If {
        cond: NodeIndex,
        true_body: Option<Box<Element>>,
        false_body: Option<Box<Element>>,
    },
    /// One fork side escapes the enclosing scope; the other side continues
    /// the surrounding sequence. `escape_cond` means the true branch is
    /// the escaping one.
    IfEscape {
        cond: NodeIndex,
        escape_cond: bool,
        body: Box<Element>,
    },
    Loop {
        id: usize,
        loopin: NodeIndex,
        continue_node: NodeIndex,
        body: Box<Element>,
    },
    /// `level` counts enclosing loops outward; 0 targets the innermost.
    Break { level: usize },
    Continue { level: usize },
}

/// Recovery output: the tree plus labels for loops targeted across
/// nesting levels.
#[derive(Debug)]
pub struct StructuredCfg {
    pub root: Element,
    pub labels: BTreeMap<usize, String>,
}

enum Context {
    If {
        nodes: HashSet<NodeIndex>,
        cond_node: NodeIndex,
        converge_node: NodeIndex,
    },
    IfEscape {
        nodes: HashSet<NodeIndex>,
        exit_map: HashMap<NodeIndex, (ExitKind, usize)>,
    },
    Loop {
        nodes: HashSet<NodeIndex>,
        loopin_node: NodeIndex,
        continue_node: NodeIndex,
        break_node: NodeIndex,
    },
}

pub struct CfgRecovery<'g, 'a> {
    graph: &'g DeflatGraph<'a>,
    visited_edges: HashSet<(NodeIndex, NodeIndex)>,
    next_loop_id: usize,
}

impl<'g, 'a> CfgRecovery<'g, 'a> {
    pub fn structure(graph: &'g DeflatGraph<'a>) -> Result<StructuredCfg> {
        let mut recovery = CfgRecovery {
            graph,
            visited_edges: HashSet::new(),
            next_loop_id: 0,
        };
        let root = recovery.build_sequential(graph.start, &mut Vec::new())?;
        let labels = assign_loop_labels(&root)?;
        Ok(StructuredCfg { root, labels })
    }

    fn mark_edge_visited(&mut self, u: NodeIndex, v: NodeIndex) -> Result<()> {
        if !self.visited_edges.insert((u, v)) {
            return Err(Error::ill_formed(format!(
                "edge ({}, {}) visited twice",
                u.index(),
                v.index()
            )));
        }
        Ok(())
    }

    /// Longest acyclic path length from `node`; cycles contribute 0.
    fn calculate_weight(&self, node: NodeIndex, visit_path: &mut Vec<NodeIndex>) -> usize {
        if visit_path.contains(&node) {
            return 0;
        }
        let succs = self.graph.ordered_successors(node);
        if succs.is_empty() {
            return 1;
        }
        visit_path.push(node);
        let w = succs
            .iter()
            .map(|&n| self.calculate_weight(n, visit_path))
            .max()
            .unwrap_or(0)
            + 1;
        visit_path.pop();
        w
    }

    /// Breadth-first broadcast from both fork successors; the first node
    /// both sides reach is the converge node.
    fn search_if_converge(
        &self,
        cond_node: NodeIndex,
        contexts: &[Context],
    ) -> Result<Option<NodeIndex>> {
        let succs = self.graph.ordered_successors(cond_node);
        if succs.len() != 2 {
            return Err(Error::internal("fork node without two successors"));
        }
        if succs.contains(&cond_node) {
            return Err(Error::structuring(format!(
                "fork block {} branches to itself",
                cond_node.index()
            )));
        }

        let mut left_broadcast: HashSet<NodeIndex> = HashSet::from([succs[0]]);
        let mut right_broadcast: HashSet<NodeIndex> = HashSet::from([succs[1]]);
        let mut left_visited: HashSet<NodeIndex> = HashSet::new();
        let mut right_visited: HashSet<NodeIndex> = HashSet::new();

        loop {
            let left_visitable: Vec<NodeIndex> = left_broadcast
                .iter()
                .copied()
                .filter(|&n| self.converge_node_visitable(n, contexts))
                .collect();
            let right_visitable: Vec<NodeIndex> = right_broadcast
                .iter()
                .copied()
                .filter(|&n| self.converge_node_visitable(n, contexts))
                .collect();

            if left_visitable.is_empty() && right_visitable.is_empty() {
                return Ok(None);
            }

            left_visited.extend(left_visitable.iter().copied());
            right_visited.extend(right_visitable.iter().copied());

            let mut common: Vec<NodeIndex> =
                left_visited.intersection(&right_visited).copied().collect();
            common.sort();
            match common.len() {
                0 => {
                    left_broadcast =
                        self.converge_broadcast(&left_visitable, &left_visited, contexts);
                    right_broadcast =
                        self.converge_broadcast(&right_visitable, &right_visited, contexts);
                }
                1 => return Ok(Some(common[0])),
                _ => {
                    return Err(Error::ill_formed(format!(
                        "multiple converge nodes below block {}",
                        cond_node.index()
                    )))
                }
            }
        }
    }

    fn converge_node_visitable(&self, node: NodeIndex, contexts: &[Context]) -> bool {
        match contexts.last() {
            None => true,
            Some(Context::If {
                nodes,
                converge_node,
                ..
            }) => nodes.contains(&node) || node == *converge_node,
            Some(Context::IfEscape { nodes, exit_map }) => {
                nodes.contains(&node) || exit_map.contains_key(&node)
            }
            Some(Context::Loop { nodes, .. }) => nodes.contains(&node),
        }
    }

    fn converge_node_broadcastable(&self, node: NodeIndex, contexts: &[Context]) -> bool {
        match contexts.last() {
            None => true,
            Some(Context::If { converge_node, .. }) => node != *converge_node,
            Some(Context::IfEscape { exit_map, .. }) => !exit_map.contains_key(&node),
            Some(Context::Loop { continue_node, .. }) => node != *continue_node,
        }
    }

    fn converge_broadcast(
        &self,
        nodes: &[NodeIndex],
        visited: &HashSet<NodeIndex>,
        contexts: &[Context],
    ) -> HashSet<NodeIndex> {
        let mut next = HashSet::new();
        for &node in nodes {
            if self.converge_node_broadcastable(node, contexts) {
                for succ in self.graph.ordered_successors(node) {
                    if !visited.contains(&succ) {
                        next.insert(succ);
                    }
                }
            }
        }
        next
    }

    /// Collect every node on a backward path from `node` to `target`.
    fn backward_traverse(
        &self,
        node: NodeIndex,
        target: NodeIndex,
        visit_path: &mut Vec<NodeIndex>,
        reachable_prefix: usize,
        reachable: &mut HashSet<NodeIndex>,
        contexts: &[Context],
    ) -> bool {
        if node == target || reachable.contains(&node) {
            for &n in &visit_path[reachable_prefix..] {
                reachable.insert(n);
            }
            return true;
        }
        if visit_path.contains(&node) {
            return false;
        }
        match contexts.last() {
            None => {}
            Some(Context::If {
                nodes, cond_node, ..
            }) => {
                if !nodes.contains(&node) || node == *cond_node {
                    return false;
                }
            }
            Some(Context::IfEscape { nodes, .. }) => {
                if !nodes.contains(&node) {
                    return false;
                }
            }
            Some(Context::Loop {
                nodes, loopin_node, ..
            }) => {
                if !nodes.contains(&node) || node == *loopin_node {
                    return false;
                }
            }
        }

        let mut found = false;
        let mut prefix = reachable_prefix;
        let mut revisit: Vec<NodeIndex> = Vec::new();

        visit_path.push(node);
        for pred in self.graph.predecessors(node) {
            if found {
                self.backward_traverse(pred, target, visit_path, prefix, reachable, contexts);
            } else if self.backward_traverse(pred, target, visit_path, prefix, reachable, contexts)
            {
                found = true;
                prefix = visit_path.len();
                let pending = std::mem::take(&mut revisit);
                for n in pending {
                    self.backward_traverse(n, target, visit_path, prefix, reachable, contexts);
                }
            } else {
                revisit.push(pred);
            }
        }
        visit_path.pop();
        found
    }

    fn traverse_if(
        &self,
        cond_node: NodeIndex,
        converge_node: NodeIndex,
        contexts: &[Context],
    ) -> Result<HashSet<NodeIndex>> {
        let mut if_nodes = HashSet::new();
        let mut reachable = false;
        for pred in self.graph.predecessors(converge_node) {
            if self.backward_traverse(pred, cond_node, &mut Vec::new(), 0, &mut if_nodes, contexts)
            {
                reachable = true;
            }
        }
        if !reachable {
            return Err(Error::ill_formed(format!(
                "converge block {} cannot reach condition block {} backwards",
                converge_node.index(),
                cond_node.index()
            )));
        }
        Ok(if_nodes)
    }

    /// Reachable set and scope exits of an escaping branch.
    fn traverse_if_escape(
        &self,
        start: NodeIndex,
        contexts: &[Context],
    ) -> Result<(HashSet<NodeIndex>, HashMap<NodeIndex, (ExitKind, usize)>)> {
        let mut nodes = HashSet::new();
        let mut exit_map = HashMap::new();
        self.traverse_if_escape_dfs(start, &mut Vec::new(), &mut nodes, &mut exit_map, contexts)?;
        Ok((nodes, exit_map))
    }

    fn traverse_if_escape_dfs(
        &self,
        node: NodeIndex,
        visit_path: &mut Vec<NodeIndex>,
        reachable: &mut HashSet<NodeIndex>,
        exit_map: &mut HashMap<NodeIndex, (ExitKind, usize)>,
        contexts: &[Context],
    ) -> Result<()> {
        let mut visitable = true;

        match contexts.last() {
            None => {}
            Some(Context::IfEscape { .. }) => {
                return Err(Error::structuring(
                    "escape branch nested directly inside another escape branch".to_string(),
                ));
            }
            Some(last) => {
                let mut nest_level = 0usize;
                for context in contexts.iter().rev() {
                    let Context::Loop {
                        continue_node,
                        break_node,
                        ..
                    } = context
                    else {
                        continue;
                    };
                    if node == *continue_node {
                        if matches!(last, Context::Loop { .. }) && nest_level == 0 {
                            return Err(Error::structuring(
                                "escape branch re-enters its own loop header".to_string(),
                            ));
                        }
                        visitable = false;
                        exit_map.insert(node, (ExitKind::Continue, nest_level));
                        break;
                    } else if node == *break_node {
                        visitable = false;
                        exit_map.insert(node, (ExitKind::Break, nest_level));
                        break;
                    } else {
                        nest_level += 1;
                    }
                }
            }
        }

        if visitable {
            reachable.insert(node);
            visit_path.push(node);
            for succ in self.graph.ordered_successors(node) {
                if !visit_path.contains(&succ) && !reachable.contains(&succ) {
                    self.traverse_if_escape_dfs(succ, visit_path, reachable, exit_map, contexts)?;
                }
            }
            visit_path.pop();
        }
        Ok(())
    }

    fn traverse_loop(
        &self,
        pred_nodes: &[NodeIndex],
        loopin_node: NodeIndex,
        contexts: &[Context],
    ) -> Result<HashSet<NodeIndex>> {
        let mut loop_nodes = HashSet::new();
        for &pred in pred_nodes {
            if !self.backward_traverse(
                pred,
                loopin_node,
                &mut Vec::new(),
                0,
                &mut loop_nodes,
                contexts,
            ) {
                return Err(Error::ill_formed(format!(
                    "back edge into block {} does not close a loop",
                    loopin_node.index()
                )));
            }
        }
        loop_nodes.insert(loopin_node);
        Ok(loop_nodes)
    }

    fn search_loopout_nodes(
        &self,
        loopin_node: NodeIndex,
        loop_nodes: &HashSet<NodeIndex>,
    ) -> HashSet<NodeIndex> {
        let mut visited = HashSet::new();
        let mut loopout = HashSet::new();
        self.search_loopout_dfs(loopin_node, loop_nodes, &mut visited, &mut loopout);
        loopout
    }

    fn search_loopout_dfs(
        &self,
        node: NodeIndex,
        loop_nodes: &HashSet<NodeIndex>,
        visited: &mut HashSet<NodeIndex>,
        loopout: &mut HashSet<NodeIndex>,
    ) {
        if !visited.insert(node) {
            return;
        }
        if loop_nodes.contains(&node) {
            for succ in self.graph.ordered_successors(node) {
                self.search_loopout_dfs(succ, loop_nodes, visited, loopout);
            }
        } else {
            loopout.insert(node);
        }
    }

    /// The in-loop block that re-enters the header: a distinct update node
    /// when exactly one in-loop predecessor funnels several paths.
    fn search_loop_continue_node(
        &self,
        loopin_node: NodeIndex,
        loop_nodes: &HashSet<NodeIndex>,
    ) -> Result<NodeIndex> {
        let preds: Vec<NodeIndex> = self
            .graph
            .predecessors(loopin_node)
            .into_iter()
            .filter(|n| loop_nodes.contains(n))
            .collect();
        match preds.len() {
            0 => Err(Error::ill_formed(format!(
                "loop header {} has no in-loop predecessor",
                loopin_node.index()
            ))),
            1 => {
                let candidate = preds[0];
                let funnels = self.graph.predecessors(candidate).len() > 1
                    && self.graph.ordered_successors(candidate).len() == 1;
                Ok(if funnels { candidate } else { loopin_node })
            }
            _ => Ok(loopin_node),
        }
    }

    fn search_loop_break_node(
        &self,
        loopout_nodes: &HashSet<NodeIndex>,
    ) -> Result<NodeIndex> {
        if loopout_nodes.len() == 1 {
            if let Some(&node) = loopout_nodes.iter().next() {
                return Ok(node);
            }
        }
        let mut candidates: Vec<NodeIndex> = loopout_nodes
            .iter()
            .copied()
            .filter(|&n| self.graph.predecessors(n).len() > 1)
            .collect();
        candidates.sort();
        if candidates.len() == 1 {
            Ok(candidates[0])
        } else {
            Err(Error::structuring(
                "loop with several distinct exits".to_string(),
            ))
        }
    }

    fn build_sequential(
        &mut self,
        node: NodeIndex,
        contexts: &mut Vec<Context>,
    ) -> Result<Element> {
        let mut sequence: Vec<Element> = Vec::new();
        let mut prev_node: Option<NodeIndex> = None;
        let mut current = node;

        'main: loop {
            if let Some(prev) = prev_node {
                self.mark_edge_visited(prev, current)?;
            }

            match contexts.last() {
                None => {}
                Some(Context::If { converge_node, .. }) => {
                    if current == *converge_node {
                        break 'main;
                    }
                }
                Some(Context::IfEscape { exit_map, .. }) => {
                    if let Some(&(kind, level)) = exit_map.get(&current) {
                        sequence.push(match kind {
                            ExitKind::Continue => Element::Continue { level },
                            ExitKind::Break => Element::Break { level },
                        });
                        break 'main;
                    }
                }
                Some(Context::Loop { continue_node, .. }) => {
                    if !sequence.is_empty() && current == *continue_node {
                        break 'main;
                    }
                }
            }

            let succ_nodes = self.graph.ordered_successors(current);

            // Unconsumed incoming edges signal a loop header, except at the
            // header of the loop currently being built.
            let at_own_loop_header = matches!(
                contexts.last(),
                Some(Context::Loop { loopin_node, .. }) if current == *loopin_node
            );
            let proper_pred_nodes: Vec<NodeIndex> = if at_own_loop_header {
                Vec::new()
            } else {
                self.graph
                    .predecessors(current)
                    .into_iter()
                    .filter(|&p| !self.visited_edges.contains(&(p, current)))
                    .collect()
            };

            if proper_pred_nodes.is_empty() {
                match succ_nodes.len() {
                    0 => {
                        sequence.push(Element::Block(current));
                        break 'main;
                    }
                    1 => {
                        sequence.push(Element::Block(current));
                        prev_node = Some(current);
                        current = succ_nodes[0];
                    }
                    2 => {
                        if let Some(converge) = self.search_if_converge(current, contexts)? {
                            let if_nodes = self.traverse_if(current, converge, contexts)?;
                            let element =
                                self.build_if(if_nodes, current, converge, contexts)?;
                            sequence.push(element);
                            prev_node = None;
                            current = converge;
                        } else {
                            let (escape_cond, escape_start) = self.pick_escape_branch(
                                current,
                                &succ_nodes,
                                contexts,
                            )?;
                            let (nodes, exit_map) =
                                self.traverse_if_escape(escape_start, contexts)?;
                            let stay = if escape_cond {
                                succ_nodes[1]
                            } else {
                                succ_nodes[0]
                            };
                            let element = self.build_if_escape(
                                nodes,
                                current,
                                escape_cond,
                                exit_map,
                                contexts,
                            )?;
                            sequence.push(element);
                            prev_node = None;
                            current = stay;
                        }
                    }
                    _ => {
                        return Err(Error::internal(format!(
                            "block {} has more than two successors",
                            current.index()
                        )))
                    }
                }
            } else {
                let loop_nodes = self.traverse_loop(&proper_pred_nodes, current, contexts)?;
                let loopout_nodes = self.search_loopout_nodes(current, &loop_nodes);
                let continue_node = self.search_loop_continue_node(current, &loop_nodes)?;
                if loopout_nodes.is_empty() {
                    return Err(Error::structuring(format!(
                        "loop at block {} never exits",
                        current.index()
                    )));
                }
                let break_node = self.search_loop_break_node(&loopout_nodes)?;
                let element = self.build_loop(
                    loop_nodes,
                    current,
                    continue_node,
                    break_node,
                    contexts,
                )?;
                sequence.push(element);
                prev_node = None;
                current = break_node;
            }
        }

        Ok(Element::Seq(sequence))
    }

    /// Whether every path from `node` terminates in a block that jumps out
    /// of the dispatcher.
    fn ends_in_jump_out(&self, node: NodeIndex) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![node];
        let mut terminals = 0usize;
        while let Some(n) = stack.pop() {
            if !visited.insert(n) {
                continue;
            }
            let succs = self.graph.ordered_successors(n);
            if succs.is_empty() {
                if self.graph.block(n).jump_out.is_none() {
                    return false;
                }
                terminals += 1;
            } else {
                stack.extend(succs);
            }
        }
        terminals > 0
    }

    /// Which fork side escapes when no converge node exists. At top level
    /// the shorter side escapes; inside a scope, the side that leaves it.
    fn pick_escape_branch(
        &self,
        cond_node: NodeIndex,
        succ_nodes: &[NodeIndex],
        contexts: &[Context],
    ) -> Result<(bool, NodeIndex)> {
        match contexts.last() {
            None => {
                // A side whose every path jumps out of the dispatcher
                // cannot continue the sequence.
                let true_leaves = self.ends_in_jump_out(succ_nodes[0]);
                let false_leaves = self.ends_in_jump_out(succ_nodes[1]);
                let escape_cond = match (true_leaves, false_leaves) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => {
                        let true_weight =
                            self.calculate_weight(succ_nodes[0], &mut Vec::new());
                        let false_weight =
                            self.calculate_weight(succ_nodes[1], &mut Vec::new());
                        true_weight < false_weight
                    }
                };
                Ok((
                    escape_cond,
                    if escape_cond { succ_nodes[0] } else { succ_nodes[1] },
                ))
            }
            Some(Context::If {
                nodes,
                converge_node,
                ..
            }) => {
                let true_in = nodes.contains(&succ_nodes[0]) || succ_nodes[0] == *converge_node;
                let false_in = nodes.contains(&succ_nodes[1]) || succ_nodes[1] == *converge_node;
                if true_in == false_in {
                    return Err(Error::structuring(format!(
                        "cannot classify escape at block {}",
                        cond_node.index()
                    )));
                }
                // The branch leaving the scope escapes.
                Ok((
                    false_in,
                    if false_in { succ_nodes[0] } else { succ_nodes[1] },
                ))
            }
            Some(Context::Loop { nodes, .. }) => {
                let true_in = nodes.contains(&succ_nodes[0]);
                let false_in = nodes.contains(&succ_nodes[1]);
                if true_in == false_in {
                    return Err(Error::structuring(format!(
                        "cannot classify escape at block {}",
                        cond_node.index()
                    )));
                }
                Ok((
                    false_in,
                    if false_in { succ_nodes[0] } else { succ_nodes[1] },
                ))
            }
            Some(Context::IfEscape { .. }) => Err(Error::structuring(
                "fork without convergence inside an escape branch".to_string(),
            )),
        }
    }

    fn build_if(
        &mut self,
        nodes: HashSet<NodeIndex>,
        cond_node: NodeIndex,
        converge_node: NodeIndex,
        contexts: &mut Vec<Context>,
    ) -> Result<Element> {
        let succ_nodes = self.graph.ordered_successors(cond_node);
        self.mark_edge_visited(cond_node, succ_nodes[0])?;
        self.mark_edge_visited(cond_node, succ_nodes[1])?;

        let true_body = if succ_nodes[0] == converge_node {
            None
        } else {
            contexts.push(Context::If {
                nodes: nodes.clone(),
                cond_node,
                converge_node,
            });
            let body = self.build_sequential(succ_nodes[0], contexts)?;
            contexts.pop();
            Some(Box::new(body))
        };

        let false_body = if succ_nodes[1] == converge_node {
            None
        } else {
            contexts.push(Context::If {
                nodes: nodes.clone(),
                cond_node,
                converge_node,
            });
            let body = self.build_sequential(succ_nodes[1], contexts)?;
            contexts.pop();
            Some(Box::new(body))
        };

        if true_body.is_none() && false_body.is_none() {
            return Err(Error::structuring(format!(
                "both branches of block {} are empty",
                cond_node.index()
            )));
        }
        Ok(Element::If {
            cond: cond_node,
            true_body,
            false_body,
        })
    }

    fn build_if_escape(
        &mut self,
        nodes: HashSet<NodeIndex>,
        cond_node: NodeIndex,
        escape_cond: bool,
        exit_map: HashMap<NodeIndex, (ExitKind, usize)>,
        contexts: &mut Vec<Context>,
    ) -> Result<Element> {
        let succ_nodes = self.graph.ordered_successors(cond_node);
        self.mark_edge_visited(cond_node, succ_nodes[0])?;
        self.mark_edge_visited(cond_node, succ_nodes[1])?;

        contexts.push(Context::IfEscape { nodes, exit_map });
        let body = self.build_sequential(
            if escape_cond { succ_nodes[0] } else { succ_nodes[1] },
            contexts,
        )?;
        contexts.pop();

        Ok(Element::IfEscape {
            cond: cond_node,
            escape_cond,
            body: Box::new(body),
        })
    }

    fn build_loop(
        &mut self,
        nodes: HashSet<NodeIndex>,
        loopin_node: NodeIndex,
        continue_node: NodeIndex,
        break_node: NodeIndex,
        contexts: &mut Vec<Context>,
    ) -> Result<Element> {
        contexts.push(Context::Loop {
            nodes,
            loopin_node,
            continue_node,
            break_node,
        });
        let body = self.build_sequential(loopin_node, contexts)?;
        contexts.pop();

        if loopin_node != continue_node {
            self.mark_edge_visited(continue_node, loopin_node)?;
        }

        let id = self.next_loop_id;
        self.next_loop_id += 1;
        Ok(Element::Loop {
            id,
            loopin: loopin_node,
            continue_node,
            body: Box::new(body),
        })
    }
}

/// Assign labels to loops targeted by a break or continue from a deeper
/// nesting level. Traversal order is deterministic, so label numbering is
/// stable across runs.
pub fn assign_loop_labels(root: &Element) -> Result<BTreeMap<usize, String>> {
    fn walk(
        element: &Element,
        stack: &mut Vec<usize>,
        labels: &mut BTreeMap<usize, String>,
    ) -> Result<()> {
        match element {
            Element::Block(_) => {}
            Element::Seq(items) => {
                for item in items {
                    walk(item, stack, labels)?;
                }
            }
            Element::If {
                true_body,
                false_body,
                ..
            } => {
                if let Some(body) = true_body {
                    walk(body, stack, labels)?;
                }
                if let Some(body) = false_body {
                    walk(body, stack, labels)?;
                }
            }
            Element::IfEscape { body, .. } => walk(body, stack, labels)?,
            Element::Loop { id, body, .. } => {
                stack.push(*id);
                walk(body, stack, labels)?;
                stack.pop();
            }
            Element::Break { level } | Element::Continue { level } => {
                if *level > 0 {
                    let target = stack
                        .len()
                        .checked_sub(1 + *level)
                        .and_then(|i| stack.get(i))
                        .ok_or_else(|| {
                            Error::internal("break/continue level exceeds loop nesting")
                        })?;
                    if !labels.contains_key(target) {
                        let label = format!("_loop{}", labels.len());
                        labels.insert(*target, label);
                    }
                }
            }
        }
        Ok(())
    }

    let mut labels = BTreeMap::new();
    walk(root, &mut Vec::new(), &mut labels)?;
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflat::block::{DeflatBlock, Fork, JumpKind};
    use crate::deflat::graph::EdgeKind;
    use crate::deflat::state::FlatState;
    use oxc_allocator::Allocator;
    use oxc_ast::ast::{Expression, Statement};
    use oxc_parser::Parser;
    use oxc_span::SourceType;
    use petgraph::graph::DiGraph;

    fn expression_at<'b>(program: &'b oxc_ast::ast::Program<'b>, index: usize) -> &'b Expression<'b> {
        match &program.body[index] {
            Statement::ExpressionStatement(stmt) => &stmt.expression,
            other => panic!("fixture statement {index} is not an expression: {other:?}"),
        }
    }

    fn block_with<'b>(stmt: &'b Statement<'b>) -> DeflatBlock<'b> {
        let mut block = DeflatBlock::default();
        block.residual.push(crate::deflat::block::Residual::Stmt(stmt));
        block.switching_state = Some(FlatState::new());
        block
    }

    #[test]
    fn test_if_else_with_converge() {
        // b1 forks to b2/b3, both converging on exit
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "c; t(); f();", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;

        let mut graph = DiGraph::new();
        let exit = graph.add_node(DeflatBlock::exit_sentinel());
        let mut cond = DeflatBlock::default();
        cond.switching_state = Some(FlatState::new());
        cond.fork = Some(Fork {
            test: expression_at(&program, 0),
            true_state: FlatState::new(),
            false_state: FlatState::new(),
        });
        let b1 = graph.add_node(cond);
        let b2 = graph.add_node(block_with(&program.body[1]));
        let b3 = graph.add_node(block_with(&program.body[2]));
        graph.add_edge(b1, b2, EdgeKind::True);
        graph.add_edge(b1, b3, EdgeKind::False);
        graph.add_edge(b2, exit, EdgeKind::Uncond);
        graph.add_edge(b3, exit, EdgeKind::Uncond);
        let g = DeflatGraph {
            graph,
            exit,
            start: b1,
        };

        let structured = CfgRecovery::structure(&g).unwrap();
        let Element::Seq(items) = &structured.root else {
            panic!("root must be a sequence");
        };
        assert!(matches!(
            items[0],
            Element::If {
                cond,
                true_body: Some(_),
                false_body: Some(_),
            } if cond == b1
        ));
        // Traversal continues at the converge node (exit).
        assert!(matches!(items[1], Element::Block(n) if n == exit));
        assert!(structured.labels.is_empty());
    }

    #[test]
    fn test_terminal_branch_escapes_on_equal_weight() {
        // b1 forks; the true side ends in a jump out of the dispatcher,
        // the false side falls through to exit. Both sides weigh the
        // same, so the jump-out side must be picked as the escape.
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "c; pre();", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;

        let mut graph = DiGraph::new();
        let exit = graph.add_node(DeflatBlock::exit_sentinel());
        let mut cond = DeflatBlock::default();
        cond.switching_state = Some(FlatState::new());
        cond.fork = Some(Fork {
            test: expression_at(&program, 0),
            true_state: FlatState::new(),
            false_state: FlatState::new(),
        });
        let b1 = graph.add_node(cond);
        let mut jumper = block_with(&program.body[1]);
        jumper.jump_out = Some(JumpKind::Loop);
        let b2 = graph.add_node(jumper);
        graph.add_edge(b1, b2, EdgeKind::True);
        graph.add_edge(b1, exit, EdgeKind::False);
        let g = DeflatGraph {
            graph,
            exit,
            start: b1,
        };

        let structured = CfgRecovery::structure(&g).unwrap();
        let Element::Seq(items) = &structured.root else {
            panic!("root must be a sequence");
        };
        let Element::IfEscape {
            cond,
            escape_cond,
            body,
        } = &items[0]
        else {
            panic!("expected an escaping fork first, got {:?}", items[0]);
        };
        assert_eq!(*cond, b1);
        assert!(*escape_cond, "the jump-out side must escape");
        let Element::Seq(body_items) = body.as_ref() else {
            panic!("escape body must be a sequence");
        };
        assert!(matches!(body_items[0], Element::Block(n) if n == b2));
        assert!(matches!(items[1], Element::Block(n) if n == exit));
    }

    #[test]
    fn test_two_block_loop_recovers() {
        // b1: cond forks (true -> b2 stays in loop, false -> exit)
        // b2: body, loops back to b1
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "c; body();", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;

        let mut graph = DiGraph::new();
        let exit = graph.add_node(DeflatBlock::exit_sentinel());
        let mut cond = DeflatBlock::default();
        cond.switching_state = Some(FlatState::new());
        cond.fork = Some(Fork {
            test: expression_at(&program, 0),
            true_state: FlatState::new(),
            false_state: FlatState::new(),
        });
        let b1 = graph.add_node(cond);
        let b2 = graph.add_node(block_with(&program.body[1]));
        graph.add_edge(b1, b2, EdgeKind::True);
        graph.add_edge(b1, exit, EdgeKind::False);
        graph.add_edge(b2, b1, EdgeKind::Uncond);
        let g = DeflatGraph {
            graph,
            exit,
            start: b1,
        };

        let structured = CfgRecovery::structure(&g).unwrap();
        let Element::Seq(items) = &structured.root else {
            panic!("root must be a sequence");
        };
        let Element::Loop { loopin, continue_node, body, .. } = &items[0] else {
            panic!("expected a loop first, got {:?}", items[0]);
        };
        assert_eq!(*loopin, b1);
        assert_eq!(*continue_node, b1);
        // The loop body leads with the escaping condition.
        let Element::Seq(body_items) = body.as_ref() else {
            panic!("loop body must be a sequence");
        };
        let Element::IfEscape { cond, escape_cond, body: escape_body } = &body_items[0] else {
            panic!("loop body must lead with the exit test, got {body_items:?}");
        };
        assert_eq!(*cond, b1);
        // The false edge leaves the loop.
        assert!(!escape_cond);
        let Element::Seq(escape_items) = escape_body.as_ref() else {
            panic!("escape body must be a sequence");
        };
        assert!(matches!(escape_items[0], Element::Break { level: 0 }));
        // After the loop, traversal continues at the exit node.
        assert!(matches!(items[1], Element::Block(n) if n == exit));
    }
}
