//! Basic blocks of the recovered control-flow graph and the symbolic
//! walker that produces them.
//!
//! One [`DeflatBlock`] corresponds to one pass through the dispatcher loop
//! body under a concrete switching state. The walker folds dispatcher
//! bookkeeping into the state, pushes everything else as residual code, and
//! records at most one fork plus at most one jump out of the dispatcher.

use std::collections::BTreeSet;

use oxc_ast::ast::{
    AssignmentOperator, AssignmentTarget, Expression, LogicalOperator, Statement, SwitchCase,
    SwitchStatement, UnaryOperator, VariableDeclaration,
};
use oxc_ast_visit::Visit;

use crate::deflat::state::{expect_evaluate, strict_values_equal, try_evaluate, FlatState, FlatValue};
use crate::error::{Error, Result};

/// Residual program text carried by a block, in source order.
#[derive(Debug, Clone, Copy)]
pub enum Residual<'a> {
    Stmt(&'a Statement<'a>),
    Expr(&'a Expression<'a>),
}

/// A two-way split on a condition the walker could not decide.
#[derive(Debug, Clone)]
pub struct Fork<'a> {
    pub test: &'a Expression<'a>,
    pub true_state: FlatState,
    pub false_state: FlatState,
}

/// A control transfer that leaves the dispatcher entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// `continue` targeting the dispatcher loop or an enclosing loop.
    Loop,
    /// `return` from the surrounding function.
    Return,
}

#[derive(Debug, Default, Clone)]
pub struct DeflatBlock<'a> {
    pub residual: Vec<Residual<'a>>,
    pub state: FlatState,
    /// State snapshot taken when the dispatch switch is entered; the merge
    /// key for block deduplication.
    pub switching_state: Option<FlatState>,
    pub fork: Option<Fork<'a>>,
    /// Condition of a fork that was proven one-sided and demoted to a
    /// straight edge. Kept so its side effects survive into the output.
    pub bogus_fork: Option<&'a Expression<'a>>,
    pub jump_out: Option<JumpKind>,
    /// Marks the synthetic node control reaches when the dispatcher test
    /// turns false.
    pub is_exit: bool,
}

impl<'a> DeflatBlock<'a> {
    pub fn exit_sentinel() -> Self {
        DeflatBlock {
            is_exit: true,
            ..DeflatBlock::default()
        }
    }

    pub fn with_state(state: FlatState) -> Self {
        DeflatBlock {
            state,
            ..DeflatBlock::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.residual.is_empty() && self.fork.is_none() && self.bogus_fork.is_none()
    }
}

/// Signal produced while walking nested statement lists.
enum Flow {
    /// Fell off the end of the list.
    Next,
    /// Unlabeled `break`, bound to the innermost enclosing switch.
    BreakSwitch,
    /// `return` belonging to an inlined IIFE, consumed at its call site.
    ReturnIife,
    /// Transfer that leaves the dispatcher for good.
    Jump(JumpKind),
}

struct Ctx {
    /// Open switch nesting, counting the dispatch switch itself.
    switch_depth: u32,
    /// Nesting depth of inlined zero-argument IIFEs.
    iife_depth: u32,
}

/// Counts references to a fixed name set inside a subtree.
struct TrackedRefScan<'s> {
    tracked: &'s BTreeSet<String>,
    hits: usize,
}

impl<'a, 's> Visit<'a> for TrackedRefScan<'s> {
    fn visit_identifier_reference(&mut self, it: &oxc_ast::ast::IdentifierReference<'a>) {
        if self.tracked.contains(it.name.as_str()) {
            self.hits += 1;
        }
    }

    fn visit_binding_identifier(&mut self, it: &oxc_ast::ast::BindingIdentifier<'a>) {
        if self.tracked.contains(it.name.as_str()) {
            self.hits += 1;
        }
    }
}

pub fn statement_references_tracked(stmt: &Statement<'_>, tracked: &BTreeSet<String>) -> bool {
    let mut scan = TrackedRefScan { tracked, hits: 0 };
    scan.visit_statement(stmt);
    scan.hits > 0
}

pub fn expression_references_tracked(expr: &Expression<'_>, tracked: &BTreeSet<String>) -> bool {
    let mut scan = TrackedRefScan { tracked, hits: 0 };
    scan.visit_expression(expr);
    scan.hits > 0
}

/// Walks one dispatcher iteration for a given entry state.
pub struct DispatchWalker<'a, 's> {
    pub loop_test: &'a Expression<'a>,
    pub derived_decl: &'a VariableDeclaration<'a>,
    pub dispatch: &'a SwitchStatement<'a>,
    pub tracked: &'s BTreeSet<String>,
}

impl<'a, 's> DispatchWalker<'a, 's> {
    /// Whether the dispatcher test admits another iteration under `state`.
    pub fn loop_continues(&self, state: &FlatState) -> Result<bool> {
        Ok(expect_evaluate(self.loop_test, state)?.is_truthy())
    }

    /// Run the loop body (derived-keys declaration, then the dispatch
    /// switch) against `block.state`, filling in residual code, the
    /// switching-state snapshot, and fork / jump-out outcomes.
    pub fn walk_iteration(&self, block: &mut DeflatBlock<'a>) -> Result<()> {
        let mut ctx = Ctx {
            switch_depth: 1,
            iife_depth: 0,
        };

        self.walk_variable_declaration(block, self.derived_decl)?;
        block.switching_state = Some(block.state.clone());

        let discriminant = expect_evaluate(&self.dispatch.discriminant, &block.state)?;
        let start = self.select_case(block, &discriminant)?;

        let flow = self.walk_cases(block, &mut ctx, &self.dispatch.cases, start)?;

        match flow {
            Flow::Next | Flow::BreakSwitch => {}
            Flow::Jump(kind) => block.jump_out = Some(kind),
            Flow::ReturnIife => {
                return Err(Error::internal(
                    "IIFE return escaped its call site".to_string(),
                ))
            }
        }

        if block.fork.is_some() && block.jump_out.is_some() {
            return Err(Error::unhandled(
                "walk",
                "block both forks and jumps out of the dispatcher".to_string(),
            ));
        }
        Ok(())
    }

    /// Index of the case the confident discriminant selects.
    fn select_case(&self, block: &DeflatBlock<'a>, discriminant: &FlatValue) -> Result<usize> {
        let mut default_idx = None;
        for (idx, case) in self.dispatch.cases.iter().enumerate() {
            match &case.test {
                Some(test) => {
                    let test_value = expect_evaluate(test, &block.state)?;
                    if strict_values_equal(&test_value, discriminant) {
                        return Ok(idx);
                    }
                }
                None => default_idx = Some(idx),
            }
        }
        default_idx.ok_or_else(|| {
            Error::unhandled(
                "walk",
                format!("no dispatch case matches key {discriminant:?}"),
            )
        })
    }

    /// Walk case consequents starting at `start`, honoring fallthrough.
    fn walk_cases(
        &self,
        block: &mut DeflatBlock<'a>,
        ctx: &mut Ctx,
        cases: &'a [SwitchCase<'a>],
        start: usize,
    ) -> Result<Flow> {
        for case in &cases[start..] {
            match self.walk_statements(block, ctx, &case.consequent)? {
                Flow::Next => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Next)
    }

    fn walk_statements(
        &self,
        block: &mut DeflatBlock<'a>,
        ctx: &mut Ctx,
        stmts: &'a [Statement<'a>],
    ) -> Result<Flow> {
        for stmt in stmts {
            match self.walk_statement(block, ctx, stmt)? {
                Flow::Next => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Next)
    }

    fn walk_statement(
        &self,
        block: &mut DeflatBlock<'a>,
        ctx: &mut Ctx,
        stmt: &'a Statement<'a>,
    ) -> Result<Flow> {
        match stmt {
            Statement::EmptyStatement(_) => Ok(Flow::Next),

            Statement::VariableDeclaration(decl) => {
                let tracked_count = decl
                    .declarations
                    .iter()
                    .filter(|d| self.is_tracked_declarator(d))
                    .count();
                if tracked_count == 0 {
                    self.push_residual_stmt(block, stmt)?;
                } else if tracked_count == decl.declarations.len() {
                    self.walk_variable_declaration(block, decl)?;
                } else {
                    return Err(Error::unhandled(
                        "walk",
                        "declaration mixes dispatcher and program variables".to_string(),
                    ));
                }
                Ok(Flow::Next)
            }

            Statement::ExpressionStatement(expr_stmt) => {
                self.walk_expression(block, ctx, &expr_stmt.expression, Some(stmt))
            }

            Statement::BlockStatement(inner) => self.walk_statements(block, ctx, &inner.body),

            Statement::BreakStatement(brk) => {
                if brk.label.is_some() {
                    return Err(Error::unhandled("walk", "labeled break".to_string()));
                }
                if ctx.switch_depth == 0 {
                    return Err(Error::unhandled(
                        "walk",
                        "break outside the dispatch switch".to_string(),
                    ));
                }
                Ok(Flow::BreakSwitch)
            }

            Statement::ContinueStatement(cont) => {
                if cont.label.is_some() {
                    return Err(Error::unhandled("walk", "labeled continue".to_string()));
                }
                // Ends the iteration; the statement itself does not
                // survive into the output.
                Ok(Flow::Jump(JumpKind::Loop))
            }

            Statement::ReturnStatement(ret) => {
                if ctx.iife_depth == 0 {
                    self.push_residual_stmt(block, stmt)?;
                    Ok(Flow::Jump(JumpKind::Return))
                } else {
                    // Return leaves the inlined IIFE; only the argument's
                    // side effects survive.
                    if let Some(arg) = &ret.argument {
                        self.push_residual_expr(block, arg)?;
                    }
                    Ok(Flow::ReturnIife)
                }
            }

            Statement::SwitchStatement(nested) if self.references_tracked_switch(nested) => {
                let discriminant = expect_evaluate(&nested.discriminant, &block.state)?;
                let mut default_idx = None;
                let mut start = None;
                for (idx, case) in nested.cases.iter().enumerate() {
                    match &case.test {
                        Some(test) => {
                            let value = expect_evaluate(test, &block.state)?;
                            if strict_values_equal(&value, &discriminant) {
                                start = Some(idx);
                                break;
                            }
                        }
                        None => default_idx = Some(idx),
                    }
                }
                let Some(start) = start.or(default_idx) else {
                    // No case selected; the switch is a no-op.
                    return Ok(Flow::Next);
                };
                ctx.switch_depth += 1;
                let flow = self.walk_cases(block, ctx, &nested.cases, start)?;
                ctx.switch_depth -= 1;
                match flow {
                    Flow::BreakSwitch => Ok(Flow::Next),
                    other => Ok(other),
                }
            }

            Statement::IfStatement(if_stmt)
                if statement_references_tracked(stmt, self.tracked) =>
            {
                match try_evaluate(&if_stmt.test, &block.state)? {
                    Some(test) => {
                        if test.is_truthy() {
                            self.walk_statement(block, ctx, &if_stmt.consequent)
                        } else if let Some(alternate) = &if_stmt.alternate {
                            self.walk_statement(block, ctx, alternate)
                        } else {
                            Ok(Flow::Next)
                        }
                    }
                    None => Err(Error::unhandled(
                        "walk",
                        "if statement with an undecidable test over dispatcher state".to_string(),
                    )),
                }
            }

            Statement::ThrowStatement(_) => {
                Err(Error::unhandled("walk", "throw statement".to_string()))
            }

            // Anything else is residual as long as it cannot touch the
            // dispatcher variables.
            other => {
                self.push_residual_stmt(block, other)?;
                Ok(Flow::Next)
            }
        }
    }

    fn references_tracked_switch(&self, nested: &SwitchStatement<'_>) -> bool {
        expression_references_tracked(&nested.discriminant, self.tracked)
    }

    /// Fold a declaration whose declarators all bind dispatcher variables.
    fn walk_variable_declaration(
        &self,
        block: &mut DeflatBlock<'a>,
        decl: &'a VariableDeclaration<'a>,
    ) -> Result<()> {
        for declarator in &decl.declarations {
            let Some(name) = declarator.id.get_identifier_name() else {
                return Err(Error::unhandled(
                    "walk",
                    "destructuring declaration of a dispatcher variable".to_string(),
                ));
            };
            match &declarator.init {
                Some(init) => self.fold_tracked_assignment(block, name.as_str(), init)?,
                None => {
                    block.state.insert(name.to_string(), FlatValue::Undefined);
                }
            }
        }
        Ok(())
    }

    fn is_tracked_declarator(&self, declarator: &oxc_ast::ast::VariableDeclarator<'a>) -> bool {
        declarator
            .id
            .get_identifier_name()
            .is_some_and(|name| self.tracked.contains(name.as_str()))
    }

    /// Fold `name = value_expr` into the state, producing a fork when the
    /// value is a conditional whose test cannot be decided.
    fn fold_tracked_assignment(
        &self,
        block: &mut DeflatBlock<'a>,
        name: &str,
        value_expr: &'a Expression<'a>,
    ) -> Result<()> {
        if block.fork.is_some() {
            return Err(Error::unhandled(
                "walk",
                format!("dispatcher variable `{name}` assigned after a fork"),
            ));
        }

        // Peel conditional layers while their tests are decidable; the
        // obfuscator nests these when several keys share a case.
        let mut value_expr = strip_parens(value_expr);
        while let Expression::ConditionalExpression(cond) = value_expr {
            match try_evaluate(&cond.test, &block.state)? {
                Some(test) => {
                    value_expr = strip_parens(if test.is_truthy() {
                        &cond.consequent
                    } else {
                        &cond.alternate
                    });
                }
                None => break,
            }
        }

        // Any conditional left over has an undecidable test.
        if let Expression::ConditionalExpression(cond) = value_expr {
            let true_value = expect_evaluate(&cond.consequent, &block.state)?;
            let false_value = expect_evaluate(&cond.alternate, &block.state)?;
            let mut true_state = block.state.clone();
            true_state.insert(name.to_string(), true_value);
            let mut false_state = block.state.clone();
            false_state.insert(name.to_string(), false_value);
            block.fork = Some(Fork {
                test: &cond.test,
                true_state,
                false_state,
            });
            return Ok(());
        }

        match try_evaluate(value_expr, &block.state)? {
            Some(value) => {
                block.state.insert(name.to_string(), value);
                Ok(())
            }
            None => Err(Error::unhandled(
                "walk",
                format!("dispatcher variable `{name}` assigned an undecidable value"),
            )),
        }
    }

    fn walk_expression(
        &self,
        block: &mut DeflatBlock<'a>,
        ctx: &mut Ctx,
        expr: &'a Expression<'a>,
        whole_stmt: Option<&'a Statement<'a>>,
    ) -> Result<Flow> {
        match expr {
            Expression::SequenceExpression(seq) => {
                for sub in &seq.expressions {
                    match self.walk_expression(block, ctx, sub, None)? {
                        Flow::Next => {}
                        other => return Ok(other),
                    }
                }
                Ok(Flow::Next)
            }

            Expression::ParenthesizedExpression(inner) => {
                self.walk_expression(block, ctx, &inner.expression, whole_stmt)
            }

            Expression::AssignmentExpression(assign) => {
                if let AssignmentTarget::AssignmentTargetIdentifier(target) = &assign.left {
                    if self.tracked.contains(target.name.as_str()) {
                        if assign.operator != AssignmentOperator::Assign {
                            return Err(Error::unhandled(
                                "walk",
                                format!(
                                    "compound assignment to dispatcher variable `{}`",
                                    target.name
                                ),
                            ));
                        }
                        self.fold_tracked_assignment(block, target.name.as_str(), &assign.right)?;
                        return Ok(Flow::Next);
                    }
                }
                self.push_residual_of(block, expr, whole_stmt)?;
                Ok(Flow::Next)
            }

            Expression::UpdateExpression(update) => {
                use oxc_ast::ast::SimpleAssignmentTarget;
                if let SimpleAssignmentTarget::AssignmentTargetIdentifier(target) = &update.argument
                {
                    if self.tracked.contains(target.name.as_str()) {
                        return Err(Error::unhandled(
                            "walk",
                            format!("update of dispatcher variable `{}`", target.name),
                        ));
                    }
                }
                self.push_residual_of(block, expr, whole_stmt)?;
                Ok(Flow::Next)
            }

            Expression::CallExpression(call) => {
                if let Some(body) = iife_body(call) {
                    ctx.iife_depth += 1;
                    let saved_depth = std::mem::replace(&mut ctx.switch_depth, 0);
                    let flow = self.walk_statements(block, ctx, body)?;
                    ctx.switch_depth = saved_depth;
                    ctx.iife_depth -= 1;
                    return match flow {
                        Flow::ReturnIife | Flow::Next => Ok(Flow::Next),
                        Flow::BreakSwitch => Err(Error::unhandled(
                            "walk",
                            "break escapes an inlined function".to_string(),
                        )),
                        jump @ Flow::Jump(_) => Ok(jump),
                    };
                }
                self.push_residual_of(block, expr, whole_stmt)?;
                Ok(Flow::Next)
            }

            Expression::ConditionalExpression(cond)
                if expression_references_tracked(expr, self.tracked) =>
            {
                match try_evaluate(&cond.test, &block.state)? {
                    Some(test) => {
                        let taken = if test.is_truthy() {
                            &cond.consequent
                        } else {
                            &cond.alternate
                        };
                        self.walk_expression(block, ctx, taken, None)
                    }
                    None => {
                        self.push_residual_of(block, expr, whole_stmt)?;
                        Ok(Flow::Next)
                    }
                }
            }

            // `void (k = ...)` and `!function () { ... }()` are wrappers the
            // obfuscator puts around dispatcher bookkeeping; unwrap them.
            Expression::UnaryExpression(unary)
                if expression_references_tracked(expr, self.tracked)
                    && (unary.operator == UnaryOperator::Void
                        && matches!(
                            strip_parens(&unary.argument),
                            Expression::AssignmentExpression(_)
                                | Expression::ConditionalExpression(_)
                        )
                        || unary.operator == UnaryOperator::LogicalNot
                            && matches!(
                                strip_parens(&unary.argument),
                                Expression::CallExpression(_)
                            )) =>
            {
                self.walk_expression(block, ctx, &unary.argument, None)
            }

            Expression::LogicalExpression(logical)
                if expression_references_tracked(expr, self.tracked) =>
            {
                let Some(left) = try_evaluate(&logical.left, &block.state)? else {
                    return Err(Error::unhandled(
                        "walk",
                        "logical expression with an undecidable left operand".to_string(),
                    ));
                };
                let descend = match logical.operator {
                    LogicalOperator::And => left.is_truthy(),
                    LogicalOperator::Or => !left.is_truthy(),
                    LogicalOperator::Coalesce => {
                        return Err(Error::unhandled(
                            "walk",
                            "nullish coalescing over dispatcher state".to_string(),
                        ))
                    }
                };
                if descend {
                    self.walk_expression(block, ctx, &logical.right, None)
                } else {
                    Ok(Flow::Next)
                }
            }

            other => {
                self.push_residual_of(block, other, whole_stmt)?;
                Ok(Flow::Next)
            }
        }
    }

    /// Prefer re-emitting the whole statement when the expression was its
    /// entire content; sequence operands are pushed individually.
    fn push_residual_of(
        &self,
        block: &mut DeflatBlock<'a>,
        expr: &'a Expression<'a>,
        whole_stmt: Option<&'a Statement<'a>>,
    ) -> Result<()> {
        match whole_stmt {
            Some(stmt) => self.push_residual_stmt(block, stmt),
            None => self.push_residual_expr(block, expr),
        }
    }

    fn push_residual_stmt(&self, block: &mut DeflatBlock<'a>, stmt: &'a Statement<'a>) -> Result<()> {
        if block.fork.is_some() {
            return Err(Error::unhandled(
                "walk",
                "residual code after the dispatcher fork".to_string(),
            ));
        }
        if statement_references_tracked(stmt, self.tracked) {
            return Err(Error::unhandled(
                "walk",
                "dispatcher variable escapes into residual code".to_string(),
            ));
        }
        block.residual.push(Residual::Stmt(stmt));
        Ok(())
    }

    fn push_residual_expr(
        &self,
        block: &mut DeflatBlock<'a>,
        expr: &'a Expression<'a>,
    ) -> Result<()> {
        if block.fork.is_some() {
            return Err(Error::unhandled(
                "walk",
                "residual code after the dispatcher fork".to_string(),
            ));
        }
        if expression_references_tracked(expr, self.tracked) {
            return Err(Error::unhandled(
                "walk",
                "dispatcher variable escapes into residual code".to_string(),
            ));
        }
        block.residual.push(Residual::Expr(expr));
        Ok(())
    }
}

fn strip_parens<'a>(expr: &'a Expression<'a>) -> &'a Expression<'a> {
    let mut expr = expr;
    while let Expression::ParenthesizedExpression(inner) = expr {
        expr = &inner.expression;
    }
    expr
}

/// Body of a zero-argument immediately invoked function expression, when
/// the call is one.
fn iife_body<'a>(call: &'a oxc_ast::ast::CallExpression<'a>) -> Option<&'a [Statement<'a>]> {
    if !call.arguments.is_empty() {
        return None;
    }
    let mut callee = &call.callee;
    while let Expression::ParenthesizedExpression(inner) = callee {
        callee = &inner.expression;
    }
    let Expression::FunctionExpression(func) = callee else {
        return None;
    };
    if func.r#async || func.generator || !func.params.items.is_empty() {
        return None;
    }
    func.body.as_ref().map(|body| body.statements.as_slice())
}
