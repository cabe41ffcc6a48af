//! Kernel source emitter.
//!
//! Translates a validated kernel closure into an HLSL compute shader. Every
//! expression is emitted together with its inferred [`ShaderType`], so type
//! errors surface here rather than in the shader compiler.
//!
//! The output is a pure function of the closure tokens, the buffer layout and
//! the thread group size: identical inputs produce byte-identical source.

use std::collections::HashMap;

use quote::ToTokens;
use syn::{BinOp, Expr, Lit, Pat, RangeLimits, Stmt, UnOp};

use crate::intrinsics::{HlslIntrinsic, IntrinsicRegistry};
use crate::kernel::ThreadGroupSize;
use crate::layout::{packoffset, BufferField, BufferLayout};
use crate::loops::{range_to_for_loop, range_var_type, LoopPattern, RangeInfo};
use crate::types::{parse_vector_or_matrix, AccessMode, ScalarKind, ShaderType, StructType, TypeMapper};
use crate::validation::validate_kernel;
use crate::{CompileError, Result};

/// Entry point name of every emitted kernel.
pub const ENTRY_POINT: &str = "CSMain";

/// Name of the constant buffer holding value captures.
pub const CONSTANT_BUFFER_NAME: &str = "Constants";

/// A kernel body: a closure over the dispatch thread id.
pub type KernelBody = syn::ExprClosure;

/// Emitted HLSL source and its entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmittedKernel {
    /// Complete HLSL compute shader.
    pub source: String,
    /// Entry point function name.
    pub entry_point: String,
}

/// Emit HLSL for a kernel body against a planned layout.
pub fn emit(
    body: &KernelBody,
    layout: &BufferLayout,
    thread_group: ThreadGroupSize,
) -> Result<EmittedKernel> {
    HlslEmitter::new(layout, thread_group).emit(body)
}

/// Identifiers that would collide with HLSL keywords or emitted names.
const RESERVED: &[&str] = &[
    "asm", "bool", "break", "case", "cbuffer", "centroid", "column_major", "compile", "const",
    "continue", "default", "discard", "do", "double", "else", "export", "extern", "false", "float",
    "for", "groupshared", "half", "if", "in", "inline", "inout", "int", "line", "lineadj",
    "linear", "matrix", "namespace", "nointerpolation", "noperspective", "out", "packoffset",
    "pass", "point", "precise", "register", "return", "row_major", "sample", "sampler", "shared",
    "snorm", "static", "string", "struct", "switch", "tbuffer", "technique", "texture", "triangle",
    "triangleadj", "true", "typedef", "uint", "uniform", "unorm", "vector", "void", "volatile",
    "while", ENTRY_POINT, CONSTANT_BUFFER_NAME,
];

/// What a name in scope refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymbolKind {
    Local { mutable: bool },
    ThreadId,
    Constant,
    Resource(AccessMode),
}

#[derive(Debug, Clone)]
struct Symbol {
    ty: ShaderType,
    kind: SymbolKind,
}

/// An emitted expression and its type.
///
/// `literal` marks unsuffixed numeric literals, which adopt the type of the
/// other operand the way Rust's literal inference does.
#[derive(Debug, Clone)]
struct Typed {
    code: String,
    ty: ShaderType,
    literal: bool,
}

impl Typed {
    fn new(code: String, ty: ShaderType) -> Self {
        Self {
            code,
            ty,
            literal: false,
        }
    }
}

/// Innermost construct a `break` would leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Breakable {
    Loop,
    Switch,
}

/// Operator families with distinct typing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpClass {
    Arithmetic,
    Comparison,
    Logical,
    Bitwise,
    Shift,
}

/// HLSL spelling, family, Rust precedence and whether the operator assigns.
fn binop_info(op: &BinOp) -> Option<(&'static str, OpClass, u8, bool)> {
    use OpClass::*;
    Some(match op {
        BinOp::Mul(_) => ("*", Arithmetic, 10, false),
        BinOp::Div(_) => ("/", Arithmetic, 10, false),
        BinOp::Rem(_) => ("%", Arithmetic, 10, false),
        BinOp::Add(_) => ("+", Arithmetic, 9, false),
        BinOp::Sub(_) => ("-", Arithmetic, 9, false),
        BinOp::Shl(_) => ("<<", Shift, 8, false),
        BinOp::Shr(_) => (">>", Shift, 8, false),
        BinOp::BitAnd(_) => ("&", Bitwise, 7, false),
        BinOp::BitXor(_) => ("^", Bitwise, 6, false),
        BinOp::BitOr(_) => ("|", Bitwise, 5, false),
        BinOp::Eq(_) => ("==", Comparison, 4, false),
        BinOp::Ne(_) => ("!=", Comparison, 4, false),
        BinOp::Lt(_) => ("<", Comparison, 4, false),
        BinOp::Le(_) => ("<=", Comparison, 4, false),
        BinOp::Gt(_) => (">", Comparison, 4, false),
        BinOp::Ge(_) => (">=", Comparison, 4, false),
        BinOp::And(_) => ("&&", Logical, 3, false),
        BinOp::Or(_) => ("||", Logical, 2, false),
        BinOp::AddAssign(_) => ("+=", Arithmetic, 0, true),
        BinOp::SubAssign(_) => ("-=", Arithmetic, 0, true),
        BinOp::MulAssign(_) => ("*=", Arithmetic, 0, true),
        BinOp::DivAssign(_) => ("/=", Arithmetic, 0, true),
        BinOp::RemAssign(_) => ("%=", Arithmetic, 0, true),
        BinOp::BitAndAssign(_) => ("&=", Bitwise, 0, true),
        BinOp::BitOrAssign(_) => ("|=", Bitwise, 0, true),
        BinOp::BitXorAssign(_) => ("^=", Bitwise, 0, true),
        BinOp::ShlAssign(_) => ("<<=", Shift, 0, true),
        BinOp::ShrAssign(_) => (">>=", Shift, 0, true),
        _ => return None,
    })
}

/// Whether a binary operand must be parenthesized under a parent operator.
///
/// Rust and HLSL agree on arithmetic precedence but not on bitwise operators
/// versus comparisons, so bitwise operands are always parenthesized.
fn needs_parens(child: &Expr, parent_prec: u8, parent_class: OpClass) -> bool {
    match child {
        Expr::Binary(bin) => match binop_info(&bin.op) {
            Some((_, class, prec, false)) => {
                !(prec > parent_prec
                    && class != OpClass::Bitwise
                    && parent_class != OpClass::Bitwise)
            }
            _ => true,
        },
        Expr::Cast(_) | Expr::Unary(_) => false,
        _ => false,
    }
}

fn is_plain_int(code: &str) -> bool {
    let digits = code.strip_prefix('-').unwrap_or(code);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_plain_float(code: &str) -> bool {
    !code.is_empty()
        && code
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'-' | b'+'))
}

/// Re-type a literal's code as another scalar kind.
fn convert_literal(code: &str, from: ScalarKind, to: ScalarKind) -> Result<String> {
    let converted = match (from, to) {
        (a, b) if a == b => code.to_string(),
        (ScalarKind::Int, ScalarKind::UInt) => {
            if code.starts_with('-') {
                return Err(CompileError::Type(format!(
                    "cannot use negative literal `{code}` as `uint`"
                )));
            }
            if is_plain_int(code) {
                format!("{code}u")
            } else {
                format!("uint({code})")
            }
        }
        (ScalarKind::Int, ScalarKind::Float) if is_plain_int(code) => format!("{code}.0"),
        (ScalarKind::Int, ScalarKind::Double) if is_plain_int(code) => format!("{code}.0L"),
        (ScalarKind::Float, ScalarKind::Double) if is_plain_float(code) => format!("{code}L"),
        (ScalarKind::Int, ScalarKind::Float | ScalarKind::Double)
        | (ScalarKind::Float, ScalarKind::Double) => format!("{}({code})", to.to_hlsl()),
        _ => {
            return Err(CompileError::Type(format!(
                "cannot use a `{}` literal as `{}`",
                from.to_hlsl(),
                to.to_hlsl()
            )))
        }
    };
    Ok(converted)
}

/// Whether the type carries a matrix anywhere inside it.
fn contains_matrix(ty: &ShaderType) -> bool {
    match ty {
        ShaderType::Matrix(..) => true,
        ShaderType::Struct(s) => s.fields.iter().any(|f| contains_matrix(&f.ty)),
        ShaderType::Buffer { element, .. } => contains_matrix(element),
        _ => false,
    }
}

fn declaration(ty: &ShaderType, name: &str) -> String {
    match ty {
        ShaderType::Matrix(..) => format!("row_major {} {}", ty.to_hlsl(), name),
        _ => format!("{} {}", ty.to_hlsl(), name),
    }
}

fn unsupported(construct: &str, tokens: &impl ToTokens) -> CompileError {
    CompileError::UnsupportedConstruct {
        construct: construct.to_string(),
        detail: tokens.to_token_stream().to_string(),
    }
}

/// HLSL emitter for one kernel.
pub struct HlslEmitter<'a> {
    /// Capture layout the kernel binds against.
    layout: &'a BufferLayout,
    /// `[numthreads]` dimensions.
    thread_group: ThreadGroupSize,
    /// Type mapper (aware of captured struct types).
    type_mapper: TypeMapper,
    /// Intrinsic registry.
    intrinsics: IntrinsicRegistry,
    /// Lexical scopes, outermost first.
    scopes: Vec<HashMap<String, Symbol>>,
    /// Enclosing loops and switches, innermost last.
    breakables: Vec<Breakable>,
    /// Current indentation level.
    indent: usize,
}

impl<'a> HlslEmitter<'a> {
    /// Create an emitter for a layout.
    pub fn new(layout: &'a BufferLayout, thread_group: ThreadGroupSize) -> Self {
        let mut type_mapper = TypeMapper::new();
        for s in Self::collect_structs(layout) {
            type_mapper.register_struct(s.clone());
        }

        Self {
            layout,
            thread_group,
            type_mapper,
            intrinsics: IntrinsicRegistry::new(),
            scopes: Vec::new(),
            breakables: Vec::new(),
            indent: 0,
        }
    }

    fn collect_structs(layout: &BufferLayout) -> Vec<&StructType> {
        let mut structs = Vec::new();
        for field in layout.fields() {
            // plan_layout already rejected conflicting struct shapes.
            let _ = match field {
                BufferField::Constant(c) => c.ty.collect_structs(&mut structs),
                BufferField::Resource(r) => r.element.collect_structs(&mut structs),
            };
        }
        structs
    }

    /// Get current indentation string.
    fn indent_str(&self) -> String {
        "    ".repeat(self.indent)
    }

    fn indented<F>(&mut self, f: F) -> Result<String>
    where
        F: FnOnce(&mut Self) -> Result<String>,
    {
        self.indent += 1;
        let result = f(self);
        self.indent -= 1;
        result
    }

    /// Emit the complete shader.
    pub fn emit(mut self, body: &KernelBody) -> Result<EmittedKernel> {
        validate_kernel(body)?;

        let thread_param = match &body.inputs[0] {
            Pat::Ident(ident) => ident.ident.to_string(),
            Pat::Type(pat_type) => match pat_type.pat.as_ref() {
                Pat::Ident(ident) => ident.ident.to_string(),
                other => return Err(unsupported("pattern", other)),
            },
            other => return Err(unsupported("pattern", other)),
        };

        self.scopes.push(HashMap::new());
        for field in self.layout.fields() {
            let (ty, kind) = match field {
                BufferField::Constant(c) => (c.ty.clone(), SymbolKind::Constant),
                BufferField::Resource(r) => (
                    ShaderType::Buffer {
                        element: Box::new(r.element.clone()),
                        access: r.access,
                    },
                    SymbolKind::Resource(r.access),
                ),
            };
            self.declare(field.name(), ty, kind)?;
        }
        self.declare(&thread_param, ShaderType::THREAD_IDS, SymbolKind::ThreadId)?;

        let mut output = self.emit_declarations();

        output.push_str(&format!(
            "[numthreads({}, {}, {})]\n",
            self.thread_group.x, self.thread_group.y, self.thread_group.z
        ));
        output.push_str(&format!(
            "void {ENTRY_POINT}(uint3 {thread_param} : SV_DispatchThreadID)\n{{\n"
        ));

        let body_code = match body.body.as_ref() {
            Expr::Block(block) => self.indented(|s| s.emit_block(&block.block))?,
            other => self.indented(|s| s.emit_stmt_expr(other, true))?,
        };
        output.push_str(&body_code);
        output.push_str("}\n");

        Ok(EmittedKernel {
            source: output,
            entry_point: ENTRY_POINT.to_string(),
        })
    }

    /// Struct, constant buffer and resource declarations.
    fn emit_declarations(&self) -> String {
        let mut output = String::new();

        let needs_row_major = self.layout.fields().iter().any(|f| match f {
            BufferField::Constant(c) => contains_matrix(&c.ty),
            BufferField::Resource(r) => contains_matrix(&r.element),
        });
        if needs_row_major {
            output.push_str("#pragma pack_matrix(row_major)\n\n");
        }

        for s in Self::collect_structs(self.layout) {
            output.push_str(&format!("struct {}\n{{\n", s.name));
            for field in &s.fields {
                output.push_str(&format!("    {};\n", declaration(&field.ty, &field.name)));
            }
            output.push_str("};\n\n");
        }

        if self.layout.has_constants() {
            output.push_str(&format!(
                "cbuffer {CONSTANT_BUFFER_NAME} : register(b0)\n{{\n"
            ));
            for field in self.layout.constants() {
                output.push_str(&format!(
                    "    {} : packoffset({});\n",
                    declaration(&field.ty, &field.name),
                    packoffset(field)
                ));
            }
            output.push_str("};\n\n");
        }

        let mut any_resource = false;
        for resource in self.layout.resources() {
            output.push_str(&format!(
                "{} {} : register({});\n",
                resource.hlsl_type,
                resource.name,
                resource.register()
            ));
            any_resource = true;
        }
        if any_resource {
            output.push('\n');
        }

        output
    }

    // ---- scopes -------------------------------------------------------------

    fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn declare(&mut self, name: &str, ty: ShaderType, kind: SymbolKind) -> Result<()> {
        if RESERVED.contains(&name) || name.starts_with("SV_") || name.starts_with("__") {
            return Err(CompileError::Type(format!(
                "`{name}` is a reserved identifier in HLSL"
            )));
        }
        if self.lookup(name).is_some() {
            return Err(CompileError::Type(format!(
                "`{name}` shadows an existing binding; shadowing is not supported in kernels"
            )));
        }
        match self.scopes.last_mut() {
            Some(scope) => {
                scope.insert(name.to_string(), Symbol { ty, kind });
                Ok(())
            }
            None => Err(CompileError::Type(format!(
                "`{name}` declared outside of any scope"
            ))),
        }
    }

    // ---- statements ---------------------------------------------------------

    /// Emit a block in a fresh scope.
    fn emit_block(&mut self, block: &syn::Block) -> Result<String> {
        self.scopes.push(HashMap::new());
        let result = self.emit_block_stmts(block);
        self.scopes.pop();
        result
    }

    fn emit_block_stmts(&mut self, block: &syn::Block) -> Result<String> {
        let mut output = String::new();
        let last = block.stmts.len().saturating_sub(1);
        for (i, stmt) in block.stmts.iter().enumerate() {
            let code = match stmt {
                Stmt::Local(local) => self.emit_local(local)?,
                Stmt::Expr(expr, semi) => self.emit_stmt_expr(expr, semi.is_none() && i == last)?,
                Stmt::Item(item) => return Err(unsupported("nested item", item)),
                Stmt::Macro(mac) => return Err(unsupported("macro", mac)),
            };
            output.push_str(&code);
        }
        Ok(output)
    }

    fn emit_local(&mut self, local: &syn::Local) -> Result<String> {
        let indent = self.indent_str();
        let (ident, annotation) = match &local.pat {
            Pat::Ident(ident) => (ident, None),
            Pat::Type(pat_type) => match pat_type.pat.as_ref() {
                Pat::Ident(ident) => (ident, Some(pat_type.ty.as_ref())),
                other => return Err(unsupported("pattern", other)),
            },
            other => return Err(unsupported("pattern", other)),
        };
        let name = ident.ident.to_string();
        let mutable = ident.mutability.is_some();

        let declared = annotation
            .map(|ty| self.type_mapper.map_type(ty).map_err(CompileError::Type))
            .transpose()?;

        let (ty, code) = match (&local.init, declared) {
            (Some(init), declared) => {
                let value = self.emit_expr(&init.expr)?;
                match declared {
                    Some(ty) => {
                        let code = self.coerce(value, &ty)?;
                        (ty, Some(code))
                    }
                    None => (value.ty, Some(value.code)),
                }
            }
            (None, Some(ty)) => (ty, None),
            (None, None) => {
                return Err(CompileError::Type(format!(
                    "`let {name};` needs a type annotation"
                )))
            }
        };

        if matches!(ty, ShaderType::Void | ShaderType::Buffer { .. }) {
            return Err(CompileError::Type(format!(
                "local `{name}` cannot hold a `{ty}`"
            )));
        }

        // Deferred initialization assigns later, so the local must be writable.
        let mutable = mutable || code.is_none();
        self.declare(&name, ty.clone(), SymbolKind::Local { mutable })?;

        Ok(match code {
            Some(code) => format!("{indent}{} = {code};\n", declaration(&ty, &name)),
            None => format!("{indent}{};\n", declaration(&ty, &name)),
        })
    }

    /// Emit an expression in statement position.
    fn emit_stmt_expr(&mut self, expr: &Expr, is_tail: bool) -> Result<String> {
        let indent = self.indent_str();
        match expr {
            Expr::If(if_expr) => self.emit_if_stmt(if_expr),
            Expr::ForLoop(for_loop) => self.emit_for_loop(for_loop),
            Expr::While(while_loop) => {
                if while_loop.label.is_some() {
                    return Err(unsupported("labeled loop", while_loop));
                }
                let cond = self.emit_condition(&while_loop.cond)?;
                let header = LoopPattern::While { condition: cond }.to_hlsl_header();
                self.emit_loop_body(&header, &while_loop.body)
            }
            Expr::Loop(loop_expr) => {
                if loop_expr.label.is_some() {
                    return Err(unsupported("labeled loop", loop_expr));
                }
                let header = LoopPattern::Loop.to_hlsl_header();
                self.emit_loop_body(&header, &loop_expr.body)
            }
            Expr::Match(match_expr) => self.emit_switch(match_expr),
            Expr::Block(block) => {
                if block.label.is_some() {
                    return Err(unsupported("labeled block", block));
                }
                let inner = self.indented(|s| s.emit_block(&block.block))?;
                Ok(format!("{indent}{{\n{inner}{indent}}}\n"))
            }
            Expr::Break(brk) => {
                if brk.label.is_some() {
                    return Err(unsupported("labeled break", brk));
                }
                match self.breakables.last() {
                    Some(Breakable::Loop) => Ok(format!("{indent}break;\n")),
                    Some(Breakable::Switch) => Err(unsupported("break inside match", brk)),
                    None => Err(CompileError::Type("`break` outside of a loop".to_string())),
                }
            }
            Expr::Continue(cont) => {
                if cont.label.is_some() {
                    return Err(unsupported("labeled continue", cont));
                }
                if !self.breakables.contains(&Breakable::Loop) {
                    return Err(CompileError::Type(
                        "`continue` outside of a loop".to_string(),
                    ));
                }
                Ok(format!("{indent}continue;\n"))
            }
            Expr::Return(ret) => {
                if ret.expr.is_some() {
                    return Err(unsupported("return with value", ret));
                }
                Ok(format!("{indent}return;\n"))
            }
            Expr::Assign(assign) => {
                let code = self.emit_assign(&assign.left, &assign.right)?;
                Ok(format!("{indent}{code};\n"))
            }
            Expr::Binary(bin) if matches!(binop_info(&bin.op), Some((_, _, _, true))) => {
                let code = self.emit_compound_assign(bin)?;
                Ok(format!("{indent}{code};\n"))
            }
            _ => {
                let typed = self.emit_expr(expr)?;
                if is_tail && typed.ty != ShaderType::Void {
                    return Err(CompileError::Type(format!(
                        "kernel statements must not produce a value, found `{}`",
                        typed.ty
                    )));
                }
                Ok(format!("{indent}{};\n", typed.code))
            }
        }
    }

    fn emit_condition(&self, cond: &Expr) -> Result<String> {
        let inner = match cond {
            Expr::Paren(paren) => paren.expr.as_ref(),
            other => other,
        };
        let typed = self.emit_expr(inner)?;
        if typed.ty != ShaderType::BOOL {
            return Err(CompileError::Type(format!(
                "condition must be `bool`, found `{}`",
                typed.ty
            )));
        }
        Ok(typed.code)
    }

    fn emit_if_stmt(&mut self, if_expr: &syn::ExprIf) -> Result<String> {
        let indent = self.indent_str();
        let cond = self.emit_condition(&if_expr.cond)?;
        let then_code = self.indented(|s| s.emit_block(&if_expr.then_branch))?;
        let mut output = format!("{indent}if ({cond})\n{indent}{{\n{then_code}{indent}}}\n");

        if let Some((_, else_branch)) = &if_expr.else_branch {
            match else_branch.as_ref() {
                Expr::If(nested) => {
                    let nested_code = self.emit_if_stmt(nested)?;
                    output.push_str(&format!("{indent}else {}", nested_code.trim_start()));
                }
                Expr::Block(block) => {
                    let else_code = self.indented(|s| s.emit_block(&block.block))?;
                    output.push_str(&format!("{indent}else\n{indent}{{\n{else_code}{indent}}}\n"));
                }
                other => return Err(unsupported("else branch", other)),
            }
        }

        Ok(output)
    }

    fn emit_for_loop(&mut self, for_loop: &syn::ExprForLoop) -> Result<String> {
        if for_loop.label.is_some() {
            return Err(unsupported("labeled loop", for_loop));
        }
        let var = match for_loop.pat.as_ref() {
            Pat::Ident(ident) => ident.ident.to_string(),
            other => return Err(unsupported("pattern", other)),
        };
        let range = match for_loop.expr.as_ref() {
            Expr::Range(range) => range,
            other => return Err(unsupported("iterator loop", other)),
        };
        let (start, end) = match (&range.start, &range.end) {
            (Some(start), Some(end)) => (self.emit_expr(start)?, self.emit_expr(end)?),
            _ => return Err(unsupported("open range", range)),
        };
        let (start, end) = self.unify(start, end)?;
        // Literal-only ranges count like `usize` indices unless they go negative.
        let all_literal = start.literal && end.literal;
        let ty = if all_literal && !start.code.starts_with('-') && !end.code.starts_with('-') {
            ShaderType::UINT
        } else {
            range_var_type(&start.ty, &end.ty).map_err(CompileError::Type)?
        };
        let start = self.coerce(start, &ty)?;
        let end = self.coerce(end, &ty)?;
        let inclusive = matches!(range.limits, RangeLimits::Closed(_));

        let header =
            range_to_for_loop(&var, ty.clone(), &RangeInfo::new(start, end, inclusive))
                .to_hlsl_header();

        // The loop variable lives in its own scope around the body.
        self.scopes.push(HashMap::new());
        let declared = self.declare(&var, ty, SymbolKind::Local { mutable: false });
        let result = declared.and_then(|_| self.emit_loop_body(&header, &for_loop.body));
        self.scopes.pop();
        result
    }

    fn emit_loop_body(&mut self, header: &str, body: &syn::Block) -> Result<String> {
        let indent = self.indent_str();
        self.breakables.push(Breakable::Loop);
        let body_code = self.indented(|s| s.emit_block(body));
        self.breakables.pop();
        Ok(format!("{indent}{header}\n{indent}{{\n{}{indent}}}\n", body_code?))
    }

    fn emit_switch(&mut self, match_expr: &syn::ExprMatch) -> Result<String> {
        let indent = self.indent_str();
        let case_indent = "    ".repeat(self.indent + 1);
        let scrutinee = self.emit_expr(&match_expr.expr)?;
        let kind = match scrutinee.ty {
            ShaderType::Scalar(kind) if kind.is_integer() => kind,
            ref other => {
                return Err(CompileError::Type(format!(
                    "`match` requires an integer scrutinee, found `{other}`"
                )))
            }
        };

        let mut output = format!("{indent}switch ({})\n{indent}{{\n", scrutinee.code);
        for arm in &match_expr.arms {
            if let Some((_, guard)) = &arm.guard {
                return Err(unsupported("match guard", guard));
            }
            for label in Self::case_labels(&arm.pat, kind)? {
                output.push_str(&format!("{case_indent}{label}\n"));
            }

            self.breakables.push(Breakable::Switch);
            let body = self.indented(|s| {
                s.indented(|s| match arm.body.as_ref() {
                    Expr::Block(block) if block.label.is_none() => s.emit_block(&block.block),
                    other => s.emit_stmt_expr(other, true),
                })
            });
            self.breakables.pop();

            output.push_str(&format!(
                "{case_indent}{{\n{}{case_indent}    break;\n{case_indent}}}\n",
                body?
            ));
        }
        output.push_str(&format!("{indent}}}\n"));
        Ok(output)
    }

    fn case_labels(pat: &Pat, kind: ScalarKind) -> Result<Vec<String>> {
        match pat {
            Pat::Wild(_) => Ok(vec!["default:".to_string()]),
            Pat::Lit(lit) => match &lit.lit {
                Lit::Int(int) => {
                    let digits = int.base10_digits();
                    let value = match kind {
                        ScalarKind::UInt => format!("{digits}u"),
                        _ => digits.to_string(),
                    };
                    Ok(vec![format!("case {value}:")])
                }
                other => Err(unsupported("pattern", other)),
            },
            Pat::Or(or) => {
                let mut labels = Vec::new();
                for case in &or.cases {
                    labels.extend(Self::case_labels(case, kind)?);
                }
                Ok(labels)
            }
            other => Err(unsupported("pattern", other)),
        }
    }

    // ---- assignment ---------------------------------------------------------

    /// Check that an assignment target is writable.
    fn check_writable(&self, target: &Expr, via_index: bool) -> Result<()> {
        match target {
            Expr::Paren(paren) => self.check_writable(&paren.expr, via_index),
            Expr::Field(field) => self.check_writable(&field.base, via_index),
            Expr::Index(index) => self.check_writable(&index.expr, true),
            Expr::Path(path) if path.path.segments.len() == 1 => {
                let name = path.path.segments[0].ident.to_string();
                let symbol = self
                    .lookup(&name)
                    .ok_or_else(|| CompileError::Type(format!("unknown identifier `{name}`")))?;
                match symbol.kind {
                    SymbolKind::Local { mutable: true } => Ok(()),
                    SymbolKind::Local { mutable: false } => Err(CompileError::Type(format!(
                        "cannot assign to immutable local `{name}`; declare it with `let mut`"
                    ))),
                    SymbolKind::ThreadId => Err(CompileError::Type(format!(
                        "thread id `{name}` is read-only"
                    ))),
                    SymbolKind::Constant | SymbolKind::Resource(AccessMode::ReadOnly) => {
                        Err(CompileError::ReadOnlyCapture(name))
                    }
                    SymbolKind::Resource(AccessMode::ReadWrite) if via_index => Ok(()),
                    SymbolKind::Resource(AccessMode::ReadWrite) => Err(CompileError::Type(
                        format!("buffer `{name}` cannot be reassigned; write its elements instead"),
                    )),
                }
            }
            other => Err(CompileError::Type(format!(
                "invalid assignment target `{}`",
                other.to_token_stream()
            ))),
        }
    }

    fn emit_assign(&self, left: &Expr, right: &Expr) -> Result<String> {
        self.check_writable(left, false)?;
        let target = self.emit_expr(left)?;
        let value = self.emit_expr(right)?;
        let code = self.coerce(value, &target.ty)?;
        Ok(format!("{} = {}", target.code, code))
    }

    fn emit_compound_assign(&self, bin: &syn::ExprBinary) -> Result<String> {
        let (op, class, _, _) = binop_info(&bin.op)
            .ok_or_else(|| unsupported("operator", bin))?;
        self.check_writable(&bin.left, false)?;
        let target = self.emit_expr(&bin.left)?;
        let value = self.emit_expr(&bin.right)?;
        let (target, value) = self.unify(target, value)?;
        let result = binary_result_type(class, op, &target.ty, &value.ty)?;
        if result != target.ty {
            return Err(CompileError::Type(format!(
                "`{op}` would change `{}` into `{result}`",
                target.ty
            )));
        }
        Ok(format!("{} {op} {}", target.code, value.code))
    }

    // ---- typing helpers -----------------------------------------------------

    /// Convert an expression to a target type, re-typing literals.
    fn coerce(&self, value: Typed, target: &ShaderType) -> Result<String> {
        if value.ty == *target {
            return Ok(value.code);
        }
        if value.literal {
            if let (ShaderType::Scalar(from), ShaderType::Scalar(to)) = (&value.ty, target) {
                return convert_literal(&value.code, *from, *to);
            }
        }
        Err(CompileError::Type(format!(
            "expected `{target}`, found `{}`",
            value.ty
        )))
    }

    /// Let a literal operand adopt the component kind of the other operand.
    fn unify(&self, a: Typed, b: Typed) -> Result<(Typed, Typed)> {
        fn adopt(literal: Typed, other: &Typed) -> Result<Typed> {
            match (&literal.ty, other.ty.scalar_kind()) {
                (ShaderType::Scalar(from), Some(to)) => Ok(Typed::new(
                    convert_literal(&literal.code, *from, to)?,
                    ShaderType::Scalar(to),
                )),
                _ => Ok(literal),
            }
        }

        match (a.literal, b.literal) {
            (true, false) => Ok((adopt(a, &b)?, b)),
            (false, true) => {
                let b = adopt(b, &a)?;
                Ok((a, b))
            }
            _ => Ok((a, b)),
        }
    }

    // ---- expressions --------------------------------------------------------

    /// Emit an expression with its type.
    fn emit_expr(&self, expr: &Expr) -> Result<Typed> {
        match expr {
            Expr::Lit(lit) => self.emit_lit(&lit.lit),
            Expr::Path(path) => self.emit_path(path),
            Expr::Paren(paren) => {
                let inner = self.emit_expr(&paren.expr)?;
                Ok(Typed {
                    code: format!("({})", inner.code),
                    ..inner
                })
            }
            Expr::Group(group) => self.emit_expr(&group.expr),
            Expr::Binary(bin) => self.emit_binary(bin),
            Expr::Unary(unary) => self.emit_unary(unary),
            Expr::Cast(cast) => self.emit_cast(cast),
            Expr::Index(index) => self.emit_index(index),
            Expr::Field(field) => self.emit_field(field),
            Expr::Call(call) => self.emit_call(call),
            Expr::MethodCall(method) => self.emit_method_call(method),
            Expr::If(if_expr) => self.emit_if_value(if_expr),
            Expr::Block(block) if block.label.is_none() => {
                let inner = self.block_value(&block.block)?;
                Ok(Typed {
                    code: format!("({})", inner.code),
                    ..inner
                })
            }
            Expr::Assign(_) => Err(CompileError::Type(
                "assignment cannot be used as a value".to_string(),
            )),
            Expr::Match(m) => Err(unsupported("match expression", m)),
            Expr::ForLoop(_) | Expr::While(_) | Expr::Loop(_) => {
                Err(unsupported("loop expression", expr))
            }
            Expr::Break(_) | Expr::Continue(_) | Expr::Return(_) => {
                Err(unsupported("diverging expression", expr))
            }
            other => Err(unsupported("expression", other)),
        }
    }

    fn emit_lit(&self, lit: &Lit) -> Result<Typed> {
        match lit {
            Lit::Float(f) => {
                let mut code = f.base10_digits().to_string();
                if !code.contains(['.', 'e', 'E']) {
                    code.push_str(".0");
                } else if code.ends_with('.') {
                    code.push('0');
                }
                match f.suffix() {
                    "" => Ok(Typed {
                        code,
                        ty: ShaderType::FLOAT,
                        literal: true,
                    }),
                    "f32" => Ok(Typed::new(code, ShaderType::FLOAT)),
                    "f64" => Ok(Typed::new(
                        format!("{code}L"),
                        ShaderType::Scalar(ScalarKind::Double),
                    )),
                    other => Err(CompileError::Type(format!(
                        "unsupported float suffix `{other}`"
                    ))),
                }
            }
            Lit::Int(i) => {
                let digits = i.base10_digits().to_string();
                let value = i.base10_parse::<u64>().ok();
                match i.suffix() {
                    "" => match value {
                        Some(v) if v <= i32::MAX as u64 => Ok(Typed {
                            code: digits,
                            ty: ShaderType::INT,
                            literal: true,
                        }),
                        // Too wide for `int`: the literal becomes `uint`.
                        Some(v) if v <= u32::MAX as u64 => Ok(Typed {
                            code: format!("{digits}u"),
                            ty: ShaderType::UINT,
                            literal: true,
                        }),
                        _ => Err(CompileError::Type(format!(
                            "integer literal `{digits}` does not fit in 32 bits"
                        ))),
                    },
                    "i32" | "isize" => Ok(Typed::new(digits, ShaderType::INT)),
                    "u32" | "usize" => Ok(Typed::new(format!("{digits}u"), ShaderType::UINT)),
                    "f32" => Ok(Typed::new(format!("{digits}.0"), ShaderType::FLOAT)),
                    "f64" => Ok(Typed::new(
                        format!("{digits}.0L"),
                        ShaderType::Scalar(ScalarKind::Double),
                    )),
                    other => Err(CompileError::Type(format!(
                        "`{other}` integers are not supported in kernels"
                    ))),
                }
            }
            Lit::Bool(b) => Ok(Typed::new(b.value.to_string(), ShaderType::BOOL)),
            other => Err(CompileError::Type(format!(
                "unsupported literal `{}`",
                other.to_token_stream()
            ))),
        }
    }

    fn emit_path(&self, path: &syn::ExprPath) -> Result<Typed> {
        let segments: Vec<String> = path
            .path
            .segments
            .iter()
            .map(|s| s.ident.to_string())
            .collect();

        if let [name] = segments.as_slice() {
            let symbol = self
                .lookup(name)
                .ok_or_else(|| CompileError::Type(format!("unknown identifier `{name}`")))?;
            return Ok(Typed::new(name.clone(), symbol.ty.clone()));
        }

        let joined = segments.join("::");
        let joined = joined
            .strip_prefix("std::")
            .or_else(|| joined.strip_prefix("core::"))
            .unwrap_or(&joined);

        let (code, ty) = match joined {
            "f32::MAX" => ("3.402823466e+38", ShaderType::FLOAT),
            "f32::MIN" => ("-3.402823466e+38", ShaderType::FLOAT),
            "f32::EPSILON" => ("1.192092896e-07", ShaderType::FLOAT),
            "f32::consts::PI" => ("3.14159265358979", ShaderType::FLOAT),
            "f32::consts::TAU" => ("6.28318530717959", ShaderType::FLOAT),
            "f32::consts::E" => ("2.71828182845905", ShaderType::FLOAT),
            "f32::consts::FRAC_PI_2" => ("1.5707963267949", ShaderType::FLOAT),
            "f32::consts::SQRT_2" => ("1.4142135623731", ShaderType::FLOAT),
            "u32::MAX" => ("4294967295u", ShaderType::UINT),
            "u32::MIN" => ("0u", ShaderType::UINT),
            "i32::MAX" => ("2147483647", ShaderType::INT),
            "i32::MIN" => ("(-2147483647 - 1)", ShaderType::INT),
            _ => {
                return Err(CompileError::Type(format!(
                    "unsupported path `{}`",
                    segments.join("::")
                )))
            }
        };
        Ok(Typed::new(code.to_string(), ty))
    }

    fn emit_binary(&self, bin: &syn::ExprBinary) -> Result<Typed> {
        let (op, class, prec, assigns) =
            binop_info(&bin.op).ok_or_else(|| unsupported("operator", bin))?;
        if assigns {
            return Err(CompileError::Type(format!(
                "`{op}` cannot be used as a value"
            )));
        }

        let left = self.emit_expr(&bin.left)?;
        let right = self.emit_expr(&bin.right)?;
        let both_literal = left.literal && right.literal;
        let (mut left, mut right) = self.unify(left, right)?;
        if class == OpClass::Shift && right.ty != left.ty && right.literal {
            right = Typed::new(self.coerce(right, &left.ty)?, left.ty.clone());
        }

        let ty = binary_result_type(class, op, &left.ty, &right.ty)?;

        if needs_parens(&bin.left, prec, class) {
            left.code = format!("({})", left.code);
        }
        if needs_parens(&bin.right, prec, class) {
            right.code = format!("({})", right.code);
        }

        Ok(Typed {
            code: format!("{} {op} {}", left.code, right.code),
            literal: both_literal && class == OpClass::Arithmetic,
            ty,
        })
    }

    fn emit_unary(&self, unary: &syn::ExprUnary) -> Result<Typed> {
        let inner = self.emit_expr(&unary.expr)?;
        let operand = if matches!(unary.expr.as_ref(), Expr::Binary(_)) {
            format!("({})", inner.code)
        } else {
            inner.code.clone()
        };

        match unary.op {
            UnOp::Neg(_) => match inner.ty.scalar_kind() {
                Some(ScalarKind::UInt) if !inner.literal => Err(CompileError::Type(
                    "cannot negate a `uint`".to_string(),
                )),
                Some(kind) if kind != ScalarKind::Bool => Ok(Typed {
                    code: format!("-{operand}"),
                    ..inner
                }),
                _ => Err(CompileError::Type(format!(
                    "cannot negate `{}`",
                    inner.ty
                ))),
            },
            UnOp::Not(_) => match inner.ty.scalar_kind() {
                Some(ScalarKind::Bool) => Ok(Typed::new(format!("!{operand}"), inner.ty)),
                Some(kind) if kind.is_integer() => Ok(Typed {
                    code: format!("~{operand}"),
                    ..inner
                }),
                _ => Err(CompileError::Type(format!(
                    "`!` is not defined for `{}`",
                    inner.ty
                ))),
            },
            _ => Err(unsupported("dereference", unary)),
        }
    }

    fn emit_cast(&self, cast: &syn::ExprCast) -> Result<Typed> {
        let target = self
            .type_mapper
            .map_type(&cast.ty)
            .map_err(CompileError::Type)?;
        let inner = self.emit_expr(&cast.expr)?;

        let compatible = match (&inner.ty, &target) {
            (ShaderType::Scalar(_), ShaderType::Scalar(_)) => true,
            (ShaderType::Vector(_, n), ShaderType::Vector(_, m)) => n == m,
            _ => false,
        };
        if !compatible {
            return Err(CompileError::Type(format!(
                "cannot cast `{}` as `{target}`",
                inner.ty
            )));
        }

        Ok(Typed::new(
            format!("{}({})", target.to_hlsl(), inner.code),
            target,
        ))
    }

    fn emit_index(&self, index: &syn::ExprIndex) -> Result<Typed> {
        let base = self.emit_expr(&index.expr)?;
        let idx = self.emit_expr(&index.index)?;
        let idx_code = match idx.ty {
            ShaderType::Scalar(ScalarKind::UInt) | ShaderType::Scalar(ScalarKind::Int) => {
                if idx.literal {
                    self.coerce(idx, &ShaderType::UINT)?
                } else {
                    idx.code
                }
            }
            ref other => {
                return Err(CompileError::Type(format!(
                    "index must be an integer, found `{other}`"
                )))
            }
        };

        let element = match &base.ty {
            ShaderType::Buffer { element, .. } => element.as_ref().clone(),
            ShaderType::Vector(kind, _) => ShaderType::Scalar(*kind),
            ShaderType::Matrix(kind, _, cols) => ShaderType::Vector(*kind, *cols),
            other => {
                return Err(CompileError::Type(format!("cannot index `{other}`")));
            }
        };

        Ok(Typed::new(format!("{}[{}]", base.code, idx_code), element))
    }

    fn emit_field(&self, field: &syn::ExprField) -> Result<Typed> {
        let base = self.emit_expr(&field.base)?;
        let member = match &field.member {
            syn::Member::Named(ident) => ident.to_string(),
            syn::Member::Unnamed(idx) => {
                return Err(CompileError::Type(format!(
                    "tuple field `.{}` is not supported",
                    idx.index
                )))
            }
        };

        let ty = match &base.ty {
            ShaderType::Vector(kind, n) => swizzle_type(*kind, *n, &member).ok_or_else(|| {
                CompileError::Type(format!("invalid swizzle `.{member}` on `{}`", base.ty))
            })?,
            ShaderType::Struct(s) => s.field(&member).cloned().ok_or_else(|| {
                CompileError::Type(format!("no field `{member}` on `{}`", s.name))
            })?,
            other => {
                return Err(CompileError::Type(format!(
                    "no field `{member}` on `{other}`"
                )))
            }
        };

        Ok(Typed::new(format!("{}.{member}", base.code), ty))
    }

    fn emit_call(&self, call: &syn::ExprCall) -> Result<Typed> {
        let path = match call.func.as_ref() {
            Expr::Path(path) => path,
            other => return Err(unsupported("indirect call", other)),
        };
        let segments: Vec<String> = path
            .path
            .segments
            .iter()
            .map(|s| s.ident.to_string())
            .collect();
        let args: Vec<&Expr> = call.args.iter().collect();

        let name = match segments.as_slice() {
            [ty, ctor] => {
                if let Some(target) = parse_vector_or_matrix(ty) {
                    return self.emit_constructor(&target, ctor, &args);
                }
                if !matches!(ty.as_str(), "f32" | "f64" | "i32" | "u32") {
                    return Err(unsupported("function call", path));
                }
                ctor
            }
            [name] => name,
            _ => return Err(unsupported("function call", path)),
        };

        match self.intrinsics.lookup(name) {
            Some(intrinsic) => self.emit_intrinsic(intrinsic, &args),
            None => Err(unsupported("function call", path)),
        }
    }

    fn emit_method_call(&self, method: &syn::ExprMethodCall) -> Result<Typed> {
        let name = method.method.to_string();
        match self.intrinsics.lookup(&name) {
            Some(intrinsic) if intrinsic.arity() == method.args.len() + 1 => {
                let args: Vec<&Expr> = std::iter::once(method.receiver.as_ref())
                    .chain(method.args.iter())
                    .collect();
                self.emit_intrinsic(intrinsic, &args)
            }
            _ => Err(unsupported("method call", &method.method)),
        }
    }

    fn emit_intrinsic(&self, intrinsic: HlslIntrinsic, args: &[&Expr]) -> Result<Typed> {
        if intrinsic.is_atomic() {
            if let Some(dest) = args.first() {
                self.check_writable(dest, false)?;
                if !matches!(dest, Expr::Index(_) | Expr::Field(_)) {
                    return Err(CompileError::Type(format!(
                        "`{}` needs a buffer element as its destination",
                        intrinsic.to_hlsl()
                    )));
                }
            }
        }

        let typed: Vec<Typed> = args
            .iter()
            .map(|arg| self.emit_expr(arg))
            .collect::<Result<_>>()?;

        // Literal arguments adopt the component kind of the first typed argument.
        let anchor = typed.iter().find(|t| !t.literal).cloned();
        let typed: Vec<Typed> = match anchor {
            Some(anchor) => typed
                .into_iter()
                .map(|t| self.unify(t, anchor.clone()).map(|(t, _)| t))
                .collect::<Result<_>>()?,
            None => typed,
        };

        let types: Vec<ShaderType> = typed.iter().map(|t| t.ty.clone()).collect();
        let ty = intrinsic
            .result_type(&types)
            .map_err(CompileError::Type)?;
        let codes: Vec<String> = typed.into_iter().map(|t| t.code).collect();

        Ok(Typed::new(
            format!("{}({})", intrinsic.to_hlsl(), codes.join(", ")),
            ty,
        ))
    }

    fn emit_constructor(&self, target: &ShaderType, ctor: &str, args: &[&Expr]) -> Result<Typed> {
        let kind = target
            .scalar_kind()
            .ok_or_else(|| CompileError::Type(format!("`{target}` has no constructor")))?;
        let scalar = ShaderType::Scalar(kind);
        let wanted = match target {
            ShaderType::Vector(_, n) => *n as usize,
            ShaderType::Matrix(_, r, c) => (*r as usize) * (*c as usize),
            _ => 1,
        };

        let mut codes = Vec::with_capacity(args.len());
        let mut components = 0usize;
        for arg in args {
            let typed = self.emit_expr(arg)?;
            if typed.ty.scalar_kind() != Some(kind) && !typed.literal {
                return Err(CompileError::Type(format!(
                    "`{target}` components must be `{}`, found `{}`",
                    kind.to_hlsl(),
                    typed.ty
                )));
            }
            components += typed.ty.component_count().map(usize::from).unwrap_or(wanted);
            codes.push(if typed.literal {
                self.coerce(typed, &scalar)?
            } else {
                typed.code
            });
        }

        match ctor {
            "new" if components == wanted => Ok(Typed::new(
                format!("{}({})", target.to_hlsl(), codes.join(", ")),
                target.clone(),
            )),
            "new" => Err(CompileError::Type(format!(
                "`{target}` needs {wanted} components, found {components}"
            ))),
            "splat" if codes.len() == 1 && components == 1 => Ok(Typed::new(
                format!("(({}){})", target.to_hlsl(), codes[0]),
                target.clone(),
            )),
            _ => Err(CompileError::Type(format!(
                "unsupported constructor `{target}::{ctor}`"
            ))),
        }
    }

    fn emit_if_value(&self, if_expr: &syn::ExprIf) -> Result<Typed> {
        let else_branch = match &if_expr.else_branch {
            Some((_, else_branch)) => else_branch,
            None => {
                return Err(CompileError::Type(
                    "`if` without `else` has no value".to_string(),
                ))
            }
        };
        let cond = self.emit_condition(&if_expr.cond)?;
        let then_value = self.block_value(&if_expr.then_branch)?;
        let else_value = match else_branch.as_ref() {
            Expr::Block(block) => self.block_value(&block.block)?,
            Expr::If(nested) => self.emit_if_value(nested)?,
            other => return Err(unsupported("else branch", other)),
        };

        let both_literal = then_value.literal && else_value.literal;
        let (then_value, else_value) = self.unify(then_value, else_value)?;
        if then_value.ty != else_value.ty {
            return Err(CompileError::Type(format!(
                "`if` branches have different types: `{}` and `{}`",
                then_value.ty, else_value.ty
            )));
        }

        Ok(Typed {
            code: format!("({cond} ? {} : {})", then_value.code, else_value.code),
            ty: then_value.ty,
            literal: both_literal,
        })
    }

    /// Value of a block that is a single tail expression.
    fn block_value(&self, block: &syn::Block) -> Result<Typed> {
        match block.stmts.as_slice() {
            [Stmt::Expr(expr, None)] => self.emit_expr(expr),
            _ => Err(unsupported("block expression", block)),
        }
    }
}

/// Result type of a swizzle such as `.xy` or `.rgb`.
fn swizzle_type(kind: ScalarKind, n: u8, member: &str) -> Option<ShaderType> {
    const SETS: [&str; 2] = ["xyzw", "rgba"];
    if member.is_empty() || member.len() > 4 {
        return None;
    }
    let set = SETS
        .iter()
        .find(|set| member.chars().all(|c| set.contains(c)))?;
    let in_range = member
        .chars()
        .all(|c| set.find(c).is_some_and(|i| i < n as usize));
    if !in_range {
        return None;
    }
    Some(match member.len() {
        1 => ShaderType::Scalar(kind),
        len => ShaderType::Vector(kind, len as u8),
    })
}

/// Result type of a binary operator after literal unification.
fn binary_result_type(
    class: OpClass,
    op: &str,
    left: &ShaderType,
    right: &ShaderType,
) -> Result<ShaderType> {
    use ShaderType::{Matrix, Scalar, Vector};

    let mismatch = || {
        CompileError::Type(format!(
            "`{op}` is not defined for `{left}` and `{right}`"
        ))
    };
    let (lk, rk) = match (left.scalar_kind(), right.scalar_kind()) {
        (Some(lk), Some(rk)) => (lk, rk),
        _ => return Err(mismatch()),
    };

    match class {
        OpClass::Arithmetic => {
            if lk == ScalarKind::Bool || lk != rk {
                return Err(mismatch());
            }
            match (left, right) {
                (Matrix(..), Matrix(..)) if op.starts_with('*') => Err(CompileError::Type(
                    "use `mul(a, b)` for matrix products".to_string(),
                )),
                (a, b) if a == b => Ok(a.clone()),
                (Scalar(_), Vector(..)) => Ok(right.clone()),
                (Vector(..), Scalar(_)) => Ok(left.clone()),
                (Scalar(_), Matrix(..)) if op.starts_with('*') => Ok(right.clone()),
                (Matrix(..), Scalar(_)) if op.starts_with('*') || op.starts_with('/') => {
                    Ok(left.clone())
                }
                _ => Err(mismatch()),
            }
        }
        OpClass::Comparison => {
            if lk != rk || (lk == ScalarKind::Bool && !matches!(op, "==" | "!=")) {
                return Err(mismatch());
            }
            match (left, right) {
                (Scalar(_), Scalar(_)) => Ok(ShaderType::BOOL),
                (Vector(_, n), Vector(_, m)) if n == m => Ok(Vector(ScalarKind::Bool, *n)),
                (Vector(_, n), Scalar(_)) | (Scalar(_), Vector(_, n)) => {
                    Ok(Vector(ScalarKind::Bool, *n))
                }
                _ => Err(mismatch()),
            }
        }
        OpClass::Logical => {
            if *left == ShaderType::BOOL && *right == ShaderType::BOOL {
                Ok(ShaderType::BOOL)
            } else {
                Err(mismatch())
            }
        }
        OpClass::Bitwise => {
            let allowed = lk.is_integer() || lk == ScalarKind::Bool;
            if allowed && left == right && !matches!(left, Matrix(..)) {
                Ok(left.clone())
            } else {
                Err(mismatch())
            }
        }
        OpClass::Shift => {
            if lk.is_integer() && rk.is_integer() && !matches!(left, Matrix(..)) {
                Ok(left.clone())
            } else {
                Err(mismatch())
            }
        }
    }
}
