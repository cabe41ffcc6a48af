//! Intrinsic registry for HLSL code generation.
//!
//! Maps kernel-body function calls (`sqrt(x)`) and method calls (`x.sqrt()`)
//! to HLSL intrinsics, and infers their result types. Calls to anything not
//! in this registry are rejected by the emitter.

use std::collections::HashMap;

use crate::types::{ScalarKind, ShaderType};

/// HLSL intrinsic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HlslIntrinsic {
    // Math - single argument
    Abs,
    Sqrt,
    Rsqrt,
    Floor,
    Ceil,
    Round,
    Trunc,
    Frac,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Exp2,
    Log,
    Log2,
    Log10,
    Saturate,
    Sign,
    Rcp,
    Normalize,

    // Math - multiple arguments
    Atan2,
    Pow,
    Min,
    Max,
    Clamp,
    Lerp,
    Step,
    Smoothstep,
    Mad,
    Cross,

    // Reductions to scalar
    Dot,
    Length,
    Distance,
    All,
    Any,

    // Matrix/vector product
    Mul,

    // Bit reinterpretation
    AsFloat,
    AsInt,
    AsUInt,

    // Synchronization
    GroupBarrier,
    DeviceBarrier,
    AllBarrier,

    // Atomics on read-write buffer elements
    InterlockedAdd,
    InterlockedMin,
    InterlockedMax,
    InterlockedAnd,
    InterlockedOr,
    InterlockedXor,
}

/// How an intrinsic's result type follows from its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultRule {
    /// Same type as the first argument.
    SameAsFirst,
    /// Scalar of the first argument's component kind.
    ScalarOfFirst,
    /// `bool`.
    Bool,
    /// Matrix/vector product rules.
    Product,
    /// Same shape, reinterpreted as another kind.
    Bitcast(ScalarKind),
    /// No value.
    Void,
}

impl HlslIntrinsic {
    /// Get the HLSL function name for this intrinsic.
    pub fn to_hlsl(&self) -> &'static str {
        match self {
            HlslIntrinsic::Abs => "abs",
            HlslIntrinsic::Sqrt => "sqrt",
            HlslIntrinsic::Rsqrt => "rsqrt",
            HlslIntrinsic::Floor => "floor",
            HlslIntrinsic::Ceil => "ceil",
            HlslIntrinsic::Round => "round",
            HlslIntrinsic::Trunc => "trunc",
            HlslIntrinsic::Frac => "frac",
            HlslIntrinsic::Sin => "sin",
            HlslIntrinsic::Cos => "cos",
            HlslIntrinsic::Tan => "tan",
            HlslIntrinsic::Asin => "asin",
            HlslIntrinsic::Acos => "acos",
            HlslIntrinsic::Atan => "atan",
            HlslIntrinsic::Sinh => "sinh",
            HlslIntrinsic::Cosh => "cosh",
            HlslIntrinsic::Tanh => "tanh",
            HlslIntrinsic::Exp => "exp",
            HlslIntrinsic::Exp2 => "exp2",
            HlslIntrinsic::Log => "log",
            HlslIntrinsic::Log2 => "log2",
            HlslIntrinsic::Log10 => "log10",
            HlslIntrinsic::Saturate => "saturate",
            HlslIntrinsic::Sign => "sign",
            HlslIntrinsic::Rcp => "rcp",
            HlslIntrinsic::Normalize => "normalize",
            HlslIntrinsic::Atan2 => "atan2",
            HlslIntrinsic::Pow => "pow",
            HlslIntrinsic::Min => "min",
            HlslIntrinsic::Max => "max",
            HlslIntrinsic::Clamp => "clamp",
            HlslIntrinsic::Lerp => "lerp",
            HlslIntrinsic::Step => "step",
            HlslIntrinsic::Smoothstep => "smoothstep",
            HlslIntrinsic::Mad => "mad",
            HlslIntrinsic::Cross => "cross",
            HlslIntrinsic::Dot => "dot",
            HlslIntrinsic::Length => "length",
            HlslIntrinsic::Distance => "distance",
            HlslIntrinsic::All => "all",
            HlslIntrinsic::Any => "any",
            HlslIntrinsic::Mul => "mul",
            HlslIntrinsic::AsFloat => "asfloat",
            HlslIntrinsic::AsInt => "asint",
            HlslIntrinsic::AsUInt => "asuint",
            HlslIntrinsic::GroupBarrier => "GroupMemoryBarrierWithGroupSync",
            HlslIntrinsic::DeviceBarrier => "DeviceMemoryBarrierWithGroupSync",
            HlslIntrinsic::AllBarrier => "AllMemoryBarrierWithGroupSync",
            HlslIntrinsic::InterlockedAdd => "InterlockedAdd",
            HlslIntrinsic::InterlockedMin => "InterlockedMin",
            HlslIntrinsic::InterlockedMax => "InterlockedMax",
            HlslIntrinsic::InterlockedAnd => "InterlockedAnd",
            HlslIntrinsic::InterlockedOr => "InterlockedOr",
            HlslIntrinsic::InterlockedXor => "InterlockedXor",
        }
    }

    /// Number of arguments the intrinsic takes (receiver included for method calls).
    pub fn arity(&self) -> usize {
        match self {
            HlslIntrinsic::GroupBarrier | HlslIntrinsic::DeviceBarrier | HlslIntrinsic::AllBarrier => {
                0
            }
            HlslIntrinsic::Atan2
            | HlslIntrinsic::Pow
            | HlslIntrinsic::Min
            | HlslIntrinsic::Max
            | HlslIntrinsic::Step
            | HlslIntrinsic::Cross
            | HlslIntrinsic::Dot
            | HlslIntrinsic::Distance
            | HlslIntrinsic::Mul
            | HlslIntrinsic::InterlockedAdd
            | HlslIntrinsic::InterlockedMin
            | HlslIntrinsic::InterlockedMax
            | HlslIntrinsic::InterlockedAnd
            | HlslIntrinsic::InterlockedOr
            | HlslIntrinsic::InterlockedXor => 2,
            HlslIntrinsic::Clamp
            | HlslIntrinsic::Lerp
            | HlslIntrinsic::Smoothstep
            | HlslIntrinsic::Mad => 3,
            _ => 1,
        }
    }

    /// Whether this intrinsic writes through its first argument.
    pub fn is_atomic(&self) -> bool {
        matches!(
            self,
            HlslIntrinsic::InterlockedAdd
                | HlslIntrinsic::InterlockedMin
                | HlslIntrinsic::InterlockedMax
                | HlslIntrinsic::InterlockedAnd
                | HlslIntrinsic::InterlockedOr
                | HlslIntrinsic::InterlockedXor
        )
    }

    /// Whether this intrinsic only accepts floating point arguments.
    fn requires_float(&self) -> bool {
        !matches!(
            self,
            HlslIntrinsic::Abs
                | HlslIntrinsic::Min
                | HlslIntrinsic::Max
                | HlslIntrinsic::Clamp
                | HlslIntrinsic::Sign
                | HlslIntrinsic::Dot
                | HlslIntrinsic::Mul
                | HlslIntrinsic::Mad
                | HlslIntrinsic::All
                | HlslIntrinsic::Any
                | HlslIntrinsic::AsFloat
                | HlslIntrinsic::AsInt
                | HlslIntrinsic::AsUInt
                | HlslIntrinsic::GroupBarrier
                | HlslIntrinsic::DeviceBarrier
                | HlslIntrinsic::AllBarrier
                | HlslIntrinsic::InterlockedAdd
                | HlslIntrinsic::InterlockedMin
                | HlslIntrinsic::InterlockedMax
                | HlslIntrinsic::InterlockedAnd
                | HlslIntrinsic::InterlockedOr
                | HlslIntrinsic::InterlockedXor
        )
    }

    fn result_rule(&self) -> ResultRule {
        match self {
            HlslIntrinsic::Dot | HlslIntrinsic::Length | HlslIntrinsic::Distance => {
                ResultRule::ScalarOfFirst
            }
            HlslIntrinsic::All | HlslIntrinsic::Any => ResultRule::Bool,
            HlslIntrinsic::Mul => ResultRule::Product,
            HlslIntrinsic::AsFloat => ResultRule::Bitcast(ScalarKind::Float),
            HlslIntrinsic::AsInt => ResultRule::Bitcast(ScalarKind::Int),
            HlslIntrinsic::AsUInt => ResultRule::Bitcast(ScalarKind::UInt),
            HlslIntrinsic::GroupBarrier
            | HlslIntrinsic::DeviceBarrier
            | HlslIntrinsic::AllBarrier
            | HlslIntrinsic::InterlockedAdd
            | HlslIntrinsic::InterlockedMin
            | HlslIntrinsic::InterlockedMax
            | HlslIntrinsic::InterlockedAnd
            | HlslIntrinsic::InterlockedOr
            | HlslIntrinsic::InterlockedXor => ResultRule::Void,
            _ => ResultRule::SameAsFirst,
        }
    }

    /// Infer the result type from argument types.
    pub fn result_type(&self, args: &[ShaderType]) -> Result<ShaderType, String> {
        if args.len() != self.arity() {
            return Err(format!(
                "`{}` takes {} argument(s), found {}",
                self.to_hlsl(),
                self.arity(),
                args.len()
            ));
        }

        let first = args.first();
        if let Some(first) = first {
            let kind = first.scalar_kind().ok_or_else(|| {
                format!("`{}` is not defined for `{}`", self.to_hlsl(), first)
            })?;
            if self.requires_float() && !kind.is_float() {
                return Err(format!(
                    "`{}` requires a floating point argument, found `{}`",
                    self.to_hlsl(),
                    first
                ));
            }
            if self.is_atomic() && !kind.is_integer() {
                return Err(format!(
                    "`{}` requires an int or uint destination, found `{}`",
                    self.to_hlsl(),
                    first
                ));
            }
        }

        match self.result_rule() {
            ResultRule::Void => Ok(ShaderType::Void),
            ResultRule::Bool => Ok(ShaderType::BOOL),
            ResultRule::SameAsFirst => Ok(first.cloned().unwrap_or(ShaderType::Void)),
            ResultRule::ScalarOfFirst => Ok(first
                .and_then(ShaderType::scalar_kind)
                .map(ShaderType::Scalar)
                .unwrap_or(ShaderType::Void)),
            ResultRule::Bitcast(kind) => Ok(first
                .map(|t| t.with_kind(kind))
                .unwrap_or(ShaderType::Void)),
            ResultRule::Product => product_type(&args[0], &args[1]),
        }
    }
}

/// Result type of `mul(a, b)` with HLSL's row-vector/column-vector rules.
fn product_type(a: &ShaderType, b: &ShaderType) -> Result<ShaderType, String> {
    use ShaderType::{Matrix, Scalar, Vector};

    match (a, b) {
        (Scalar(_), other) | (other, Scalar(_)) => Ok(other.clone()),
        (Vector(k, n), Vector(_, m)) if n == m => Ok(Scalar(*k)),
        (Vector(k, n), Matrix(_, r, c)) if n == r => Ok(Vector(*k, *c)),
        (Matrix(k, r, c), Vector(_, n)) if c == n => Ok(Vector(*k, *r)),
        (Matrix(k, r, c), Matrix(_, r2, c2)) if c == r2 => Ok(Matrix(*k, *r, *c2)),
        _ => Err(format!("`mul` dimension mismatch between `{a}` and `{b}`")),
    }
}

/// Registry mapping kernel-body function names to HLSL intrinsics.
pub struct IntrinsicRegistry {
    mappings: HashMap<&'static str, HlslIntrinsic>,
}

impl Default for IntrinsicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrinsicRegistry {
    /// Create a new intrinsic registry with all standard mappings.
    pub fn new() -> Self {
        let mut mappings = HashMap::new();

        // Math functions (Rust std names and HLSL names both resolve)
        mappings.insert("abs", HlslIntrinsic::Abs);
        mappings.insert("sqrt", HlslIntrinsic::Sqrt);
        mappings.insert("rsqrt", HlslIntrinsic::Rsqrt);
        mappings.insert("floor", HlslIntrinsic::Floor);
        mappings.insert("ceil", HlslIntrinsic::Ceil);
        mappings.insert("round", HlslIntrinsic::Round);
        mappings.insert("trunc", HlslIntrinsic::Trunc);
        mappings.insert("frac", HlslIntrinsic::Frac);
        mappings.insert("fract", HlslIntrinsic::Frac);
        mappings.insert("sin", HlslIntrinsic::Sin);
        mappings.insert("cos", HlslIntrinsic::Cos);
        mappings.insert("tan", HlslIntrinsic::Tan);
        mappings.insert("asin", HlslIntrinsic::Asin);
        mappings.insert("acos", HlslIntrinsic::Acos);
        mappings.insert("atan", HlslIntrinsic::Atan);
        mappings.insert("sinh", HlslIntrinsic::Sinh);
        mappings.insert("cosh", HlslIntrinsic::Cosh);
        mappings.insert("tanh", HlslIntrinsic::Tanh);
        mappings.insert("exp", HlslIntrinsic::Exp);
        mappings.insert("exp2", HlslIntrinsic::Exp2);
        mappings.insert("log", HlslIntrinsic::Log);
        mappings.insert("ln", HlslIntrinsic::Log);
        mappings.insert("log2", HlslIntrinsic::Log2);
        mappings.insert("log10", HlslIntrinsic::Log10);
        mappings.insert("saturate", HlslIntrinsic::Saturate);
        mappings.insert("sign", HlslIntrinsic::Sign);
        mappings.insert("signum", HlslIntrinsic::Sign);
        mappings.insert("rcp", HlslIntrinsic::Rcp);
        mappings.insert("recip", HlslIntrinsic::Rcp);
        mappings.insert("normalize", HlslIntrinsic::Normalize);
        mappings.insert("atan2", HlslIntrinsic::Atan2);
        mappings.insert("pow", HlslIntrinsic::Pow);
        mappings.insert("powf", HlslIntrinsic::Pow);
        mappings.insert("min", HlslIntrinsic::Min);
        mappings.insert("max", HlslIntrinsic::Max);
        mappings.insert("clamp", HlslIntrinsic::Clamp);
        mappings.insert("lerp", HlslIntrinsic::Lerp);
        mappings.insert("step", HlslIntrinsic::Step);
        mappings.insert("smoothstep", HlslIntrinsic::Smoothstep);
        mappings.insert("mad", HlslIntrinsic::Mad);
        mappings.insert("mul_add", HlslIntrinsic::Mad);
        mappings.insert("cross", HlslIntrinsic::Cross);
        mappings.insert("dot", HlslIntrinsic::Dot);
        mappings.insert("length", HlslIntrinsic::Length);
        mappings.insert("distance", HlslIntrinsic::Distance);
        mappings.insert("all", HlslIntrinsic::All);
        mappings.insert("any", HlslIntrinsic::Any);
        mappings.insert("mul", HlslIntrinsic::Mul);

        // Bit reinterpretation
        mappings.insert("as_float", HlslIntrinsic::AsFloat);
        mappings.insert("as_int", HlslIntrinsic::AsInt);
        mappings.insert("as_uint", HlslIntrinsic::AsUInt);

        // Synchronization
        mappings.insert("group_barrier", HlslIntrinsic::GroupBarrier);
        mappings.insert("device_barrier", HlslIntrinsic::DeviceBarrier);
        mappings.insert("all_barrier", HlslIntrinsic::AllBarrier);

        // Atomics
        mappings.insert("interlocked_add", HlslIntrinsic::InterlockedAdd);
        mappings.insert("interlocked_min", HlslIntrinsic::InterlockedMin);
        mappings.insert("interlocked_max", HlslIntrinsic::InterlockedMax);
        mappings.insert("interlocked_and", HlslIntrinsic::InterlockedAnd);
        mappings.insert("interlocked_or", HlslIntrinsic::InterlockedOr);
        mappings.insert("interlocked_xor", HlslIntrinsic::InterlockedXor);

        Self { mappings }
    }

    /// Look up an intrinsic by kernel-body function name.
    pub fn lookup(&self, name: &str) -> Option<HlslIntrinsic> {
        self.mappings.get(name).copied()
    }

    /// Check if a function name is a known intrinsic.
    pub fn is_intrinsic(&self, name: &str) -> bool {
        self.mappings.contains_key(name)
    }
}
