//! Kernel body validation.
//!
//! Kernel bodies are a restricted subset of Rust: structured control flow,
//! arithmetic on scalars and vectors, buffer indexing and intrinsic calls.
//! This pass rejects everything outside that subset before any HLSL is
//! generated, so emission never starts on a body it cannot finish.

use quote::ToTokens;
use thiserror::Error;

/// Errors that can occur during validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A Rust construct with no structured HLSL equivalent.
    #[error("unsupported construct `{construct}`: {detail}")]
    Unsupported {
        /// Short name of the construct (`labeled break`, `macro`, ...).
        construct: &'static str,
        /// Source snippet or explanation.
        detail: String,
    },

    /// The closure signature does not describe a kernel.
    #[error("invalid kernel signature: {0}")]
    InvalidSignature(String),
}

impl ValidationError {
    fn unsupported(construct: &'static str, tokens: &impl ToTokens) -> Self {
        ValidationError::Unsupported {
            construct,
            detail: tokens.to_token_stream().to_string(),
        }
    }

    /// The construct name for [`ValidationError::Unsupported`].
    pub fn construct(&self) -> Option<&'static str> {
        match self {
            ValidationError::Unsupported { construct, .. } => Some(construct),
            ValidationError::InvalidSignature(_) => None,
        }
    }
}

/// Validate a kernel closure.
///
/// The closure must take exactly one identifier parameter (the dispatch thread
/// id, optionally annotated as `ThreadIds`) and must not declare a return type.
pub fn validate_kernel(closure: &syn::ExprClosure) -> Result<(), ValidationError> {
    if closure.asyncness.is_some() {
        return Err(ValidationError::unsupported("async closure", closure));
    }
    if closure.lifetimes.is_some() || closure.constness.is_some() {
        return Err(ValidationError::InvalidSignature(
            "closure binders and const closures are not kernels".to_string(),
        ));
    }
    if closure.inputs.len() != 1 {
        return Err(ValidationError::InvalidSignature(format!(
            "expected exactly one thread id parameter, found {}",
            closure.inputs.len()
        )));
    }
    match &closure.inputs[0] {
        syn::Pat::Ident(_) => {}
        syn::Pat::Type(pat_type) => {
            if !matches!(pat_type.pat.as_ref(), syn::Pat::Ident(_)) {
                return Err(ValidationError::unsupported("pattern", &pat_type.pat));
            }
            if !crate::types::is_thread_ids_type(&pat_type.ty) {
                return Err(ValidationError::InvalidSignature(format!(
                    "thread id parameter must be `ThreadIds`, found `{}`",
                    pat_type.ty.to_token_stream()
                )));
            }
        }
        other => return Err(ValidationError::unsupported("pattern", other)),
    }
    if !matches!(closure.output, syn::ReturnType::Default) {
        return Err(ValidationError::InvalidSignature(
            "kernels do not return values".to_string(),
        ));
    }

    validate_expr(&closure.body)
}

/// Validate a block of statements.
fn validate_block(block: &syn::Block) -> Result<(), ValidationError> {
    for stmt in &block.stmts {
        validate_stmt(stmt)?;
    }
    Ok(())
}

/// Validate a single statement.
fn validate_stmt(stmt: &syn::Stmt) -> Result<(), ValidationError> {
    match stmt {
        syn::Stmt::Local(local) => {
            validate_binding_pattern(&local.pat)?;
            if let Some(init) = &local.init {
                if init.diverge.is_some() {
                    return Err(ValidationError::unsupported("let-else", local));
                }
                validate_expr(&init.expr)?;
            }
            Ok(())
        }
        syn::Stmt::Expr(expr, _) => validate_expr(expr),
        syn::Stmt::Item(item) => Err(ValidationError::unsupported("nested item", item)),
        syn::Stmt::Macro(mac) => Err(ValidationError::unsupported("macro", mac)),
    }
}

/// `let` patterns: a plain identifier, optionally with a type annotation.
fn validate_binding_pattern(pat: &syn::Pat) -> Result<(), ValidationError> {
    match pat {
        syn::Pat::Ident(ident) if ident.by_ref.is_none() && ident.subpat.is_none() => Ok(()),
        syn::Pat::Type(pat_type) => validate_binding_pattern(&pat_type.pat),
        other => Err(ValidationError::unsupported("pattern", other)),
    }
}

/// Validate an expression.
fn validate_expr(expr: &syn::Expr) -> Result<(), ValidationError> {
    match expr {
        syn::Expr::Lit(_) | syn::Expr::Path(_) => Ok(()),
        syn::Expr::Paren(p) => validate_expr(&p.expr),
        syn::Expr::Group(g) => validate_expr(&g.expr),

        syn::Expr::Binary(bin) => {
            validate_expr(&bin.left)?;
            validate_expr(&bin.right)
        }
        syn::Expr::Unary(unary) => validate_expr(&unary.expr),
        syn::Expr::Cast(cast) => validate_expr(&cast.expr),
        syn::Expr::Assign(assign) => {
            validate_expr(&assign.left)?;
            validate_expr(&assign.right)
        }
        syn::Expr::Index(idx) => {
            validate_expr(&idx.expr)?;
            validate_expr(&idx.index)
        }
        syn::Expr::Field(field) => validate_expr(&field.base),

        syn::Expr::Call(call) => {
            if !matches!(call.func.as_ref(), syn::Expr::Path(_)) {
                return Err(ValidationError::unsupported("indirect call", call));
            }
            call.args.iter().try_for_each(validate_expr)
        }
        syn::Expr::MethodCall(method) => {
            if method.turbofish.is_some() {
                return Err(ValidationError::unsupported("turbofish", method));
            }
            validate_expr(&method.receiver)?;
            method.args.iter().try_for_each(validate_expr)
        }

        syn::Expr::If(if_expr) => {
            if matches!(if_expr.cond.as_ref(), syn::Expr::Let(_)) {
                return Err(ValidationError::unsupported("if let", &if_expr.cond));
            }
            validate_expr(&if_expr.cond)?;
            validate_block(&if_expr.then_branch)?;
            if let Some((_, else_branch)) = &if_expr.else_branch {
                validate_expr(else_branch)?;
            }
            Ok(())
        }
        syn::Expr::Block(block) => {
            if block.label.is_some() {
                return Err(ValidationError::unsupported("labeled block", block));
            }
            validate_block(&block.block)
        }
        syn::Expr::Match(m) => {
            validate_expr(&m.expr)?;
            for arm in &m.arms {
                if let Some((_, guard)) = &arm.guard {
                    return Err(ValidationError::unsupported("match guard", guard));
                }
                validate_match_pattern(&arm.pat)?;
                validate_expr(&arm.body)?;
            }
            Ok(())
        }

        syn::Expr::ForLoop(for_loop) => {
            if for_loop.label.is_some() {
                return Err(ValidationError::unsupported("labeled loop", for_loop));
            }
            validate_binding_pattern(&for_loop.pat)?;
            match for_loop.expr.as_ref() {
                syn::Expr::Range(range) => {
                    if range.start.is_none() || range.end.is_none() {
                        return Err(ValidationError::unsupported("open range", range));
                    }
                    if let Some(start) = &range.start {
                        validate_expr(start)?;
                    }
                    if let Some(end) = &range.end {
                        validate_expr(end)?;
                    }
                }
                other => return Err(ValidationError::unsupported("iterator loop", other)),
            }
            validate_block(&for_loop.body)
        }
        syn::Expr::While(while_loop) => {
            if while_loop.label.is_some() {
                return Err(ValidationError::unsupported("labeled loop", while_loop));
            }
            if matches!(while_loop.cond.as_ref(), syn::Expr::Let(_)) {
                return Err(ValidationError::unsupported("while let", &while_loop.cond));
            }
            validate_expr(&while_loop.cond)?;
            validate_block(&while_loop.body)
        }
        syn::Expr::Loop(loop_expr) => {
            if loop_expr.label.is_some() {
                return Err(ValidationError::unsupported("labeled loop", loop_expr));
            }
            validate_block(&loop_expr.body)
        }

        syn::Expr::Break(brk) => {
            if brk.label.is_some() {
                return Err(ValidationError::unsupported("labeled break", brk));
            }
            if brk.expr.is_some() {
                return Err(ValidationError::unsupported("break with value", brk));
            }
            Ok(())
        }
        syn::Expr::Continue(cont) => {
            if cont.label.is_some() {
                return Err(ValidationError::unsupported("labeled continue", cont));
            }
            Ok(())
        }
        syn::Expr::Return(ret) => {
            if ret.expr.is_some() {
                return Err(ValidationError::unsupported("return with value", ret));
            }
            Ok(())
        }

        syn::Expr::Closure(c) => Err(ValidationError::unsupported("closure", c)),
        syn::Expr::Macro(m) => Err(ValidationError::unsupported("macro", m)),
        syn::Expr::Async(a) => Err(ValidationError::unsupported("async block", a)),
        syn::Expr::Await(a) => Err(ValidationError::unsupported("await", a)),
        syn::Expr::Unsafe(u) => Err(ValidationError::unsupported("unsafe block", u)),
        syn::Expr::Try(t) => Err(ValidationError::unsupported("try operator", t)),
        syn::Expr::TryBlock(t) => Err(ValidationError::unsupported("try block", t)),
        syn::Expr::Reference(r) => Err(ValidationError::unsupported("reference", r)),
        syn::Expr::Range(r) => Err(ValidationError::unsupported("range", r)),
        syn::Expr::Array(a) => Err(ValidationError::unsupported("array literal", a)),
        syn::Expr::Repeat(r) => Err(ValidationError::unsupported("array literal", r)),
        syn::Expr::Tuple(t) => Err(ValidationError::unsupported("tuple", t)),
        syn::Expr::Struct(s) => Err(ValidationError::unsupported("struct literal", s)),
        syn::Expr::Let(l) => Err(ValidationError::unsupported("let expression", l)),
        syn::Expr::Yield(y) => Err(ValidationError::unsupported("yield", y)),
        syn::Expr::Const(c) => Err(ValidationError::unsupported("const block", c)),
        other => Err(ValidationError::unsupported("expression", other)),
    }
}

/// `match` arms may only test integer literals, `_`, or alternations of literals.
fn validate_match_pattern(pat: &syn::Pat) -> Result<(), ValidationError> {
    match pat {
        syn::Pat::Wild(_) => Ok(()),
        syn::Pat::Lit(lit) if matches!(lit.lit, syn::Lit::Int(_)) => Ok(()),
        syn::Pat::Or(or) => or.cases.iter().try_for_each(validate_match_pattern),
        other => Err(ValidationError::unsupported("pattern", other)),
    }
}
