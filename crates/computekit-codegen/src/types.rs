//! Type mapping from Rust to HLSL.
//!
//! This module handles the conversion of the Rust types used in kernel bodies
//! and capture declarations to their HLSL equivalents.
//!
//! # Type Mappings
//!
//! | Rust Type | HLSL Type | Notes |
//! |-----------|-----------|-------|
//! | `f32` | `float` | Direct mapping |
//! | `f64` | `double` | 8-byte aligned in constant buffers |
//! | `i32` / `isize` | `int` | |
//! | `u32` / `usize` | `uint` | HLSL uses 32-bit indexing |
//! | `bool` | `bool` | Packed as 32 bits |
//! | `Float3`, `Int2`, `UInt4`, ... | `float3`, `int2`, `uint4`, ... | Vectors |
//! | `Float4x4`, `Float3x4`, ... | `float4x4`, `float3x4`, ... | Emitted `row_major` |
//! | `ReadOnlyBuffer<T>` | `StructuredBuffer<T>` | `t#` register |
//! | `ReadWriteBuffer<T>` | `RWStructuredBuffer<T>` | `u#` register |
//! | `ThreadIds` | `uint3` | Dispatch thread id |

use std::collections::HashMap;
use std::fmt;

/// Scalar component kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// 32-bit signed integer.
    Int,
    /// 32-bit unsigned integer.
    UInt,
    /// Boolean (32 bits wide in buffers).
    Bool,
}

impl ScalarKind {
    /// HLSL spelling of the scalar.
    pub fn to_hlsl(self) -> &'static str {
        match self {
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
            ScalarKind::Int => "int",
            ScalarKind::UInt => "uint",
            ScalarKind::Bool => "bool",
        }
    }

    /// Size of one component in a constant buffer.
    pub fn size(self) -> usize {
        match self {
            ScalarKind::Double => 8,
            _ => 4,
        }
    }

    /// Whether the kind is a floating point kind.
    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::Float | ScalarKind::Double)
    }

    /// Whether the kind is an integer kind.
    pub fn is_integer(self) -> bool {
        matches!(self, ScalarKind::Int | ScalarKind::UInt)
    }

    /// Rust-facing name prefix used by vector and matrix type names.
    fn rust_prefix(self) -> &'static str {
        match self {
            ScalarKind::Float => "Float",
            ScalarKind::Double => "Double",
            ScalarKind::Int => "Int",
            ScalarKind::UInt => "UInt",
            ScalarKind::Bool => "Bool",
        }
    }
}

/// Access mode of a resource capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read-only buffer (shader resource view).
    ReadOnly,
    /// Read-write buffer (unordered access view).
    ReadWrite,
}

impl AccessMode {
    /// HLSL register class letter.
    pub fn register_class(self) -> char {
        match self {
            AccessMode::ReadOnly => 't',
            AccessMode::ReadWrite => 'u',
        }
    }

    /// HLSL buffer object name.
    pub fn buffer_object(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "StructuredBuffer",
            AccessMode::ReadWrite => "RWStructuredBuffer",
        }
    }
}

/// A named field inside a [`StructType`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructField {
    /// Field name (also used in HLSL).
    pub name: String,
    /// Field type.
    pub ty: ShaderType,
}

/// A user-defined aggregate type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructType {
    /// Struct name (also used in HLSL).
    pub name: String,
    /// Ordered fields.
    pub fields: Vec<StructField>,
}

impl StructType {
    /// Create a struct type.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    /// Append a field.
    pub fn with_field(mut self, name: &str, ty: ShaderType) -> Self {
        self.fields.push(StructField {
            name: name.to_string(),
            ty,
        });
        self
    }

    /// Look up a field type by name.
    pub fn field(&self, name: &str) -> Option<&ShaderType> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.ty)
    }
}

/// Shader-side type of a capture, local or expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShaderType {
    /// Scalar value.
    Scalar(ScalarKind),
    /// Vector of 2 to 4 components.
    Vector(ScalarKind, u8),
    /// Matrix with rows x columns, each 1 to 4.
    Matrix(ScalarKind, u8, u8),
    /// User-defined aggregate.
    Struct(StructType),
    /// Structured buffer resource.
    Buffer {
        /// Element type.
        element: Box<ShaderType>,
        /// Read-only or read-write.
        access: AccessMode,
    },
    /// No value (statements, barrier intrinsics).
    Void,
}

impl ShaderType {
    /// `float`
    pub const FLOAT: ShaderType = ShaderType::Scalar(ScalarKind::Float);
    /// `int`
    pub const INT: ShaderType = ShaderType::Scalar(ScalarKind::Int);
    /// `uint`
    pub const UINT: ShaderType = ShaderType::Scalar(ScalarKind::UInt);
    /// `bool`
    pub const BOOL: ShaderType = ShaderType::Scalar(ScalarKind::Bool);
    /// `uint3`, the dispatch thread id.
    pub const THREAD_IDS: ShaderType = ShaderType::Vector(ScalarKind::UInt, 3);

    /// A read-only structured buffer of `element`.
    pub fn read_only_buffer(element: ShaderType) -> Self {
        ShaderType::Buffer {
            element: Box::new(element),
            access: AccessMode::ReadOnly,
        }
    }

    /// A read-write structured buffer of `element`.
    pub fn read_write_buffer(element: ShaderType) -> Self {
        ShaderType::Buffer {
            element: Box::new(element),
            access: AccessMode::ReadWrite,
        }
    }

    /// Convert to HLSL type syntax.
    pub fn to_hlsl(&self) -> String {
        match self {
            ShaderType::Scalar(kind) => kind.to_hlsl().to_string(),
            ShaderType::Vector(kind, n) => format!("{}{}", kind.to_hlsl(), n),
            ShaderType::Matrix(kind, r, c) => format!("{}{}x{}", kind.to_hlsl(), r, c),
            ShaderType::Struct(s) => s.name.clone(),
            ShaderType::Buffer { element, access } => {
                format!("{}<{}>", access.buffer_object(), element.to_hlsl())
            }
            ShaderType::Void => "void".to_string(),
        }
    }

    /// Whether this is a resource (bound by register, not packed).
    pub fn is_resource(&self) -> bool {
        matches!(self, ShaderType::Buffer { .. })
    }

    /// Whether this is a scalar.
    pub fn is_scalar(&self) -> bool {
        matches!(self, ShaderType::Scalar(_))
    }

    /// Whether this is a vector.
    pub fn is_vector(&self) -> bool {
        matches!(self, ShaderType::Vector(..))
    }

    /// Scalar kind of scalars, vectors and matrices.
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            ShaderType::Scalar(k) | ShaderType::Vector(k, _) | ShaderType::Matrix(k, _, _) => {
                Some(*k)
            }
            _ => None,
        }
    }

    /// Number of components of scalars and vectors.
    pub fn component_count(&self) -> Option<u8> {
        match self {
            ShaderType::Scalar(_) => Some(1),
            ShaderType::Vector(_, n) => Some(*n),
            _ => None,
        }
    }

    /// Same shape with a different scalar kind.
    pub fn with_kind(&self, kind: ScalarKind) -> ShaderType {
        match self {
            ShaderType::Scalar(_) => ShaderType::Scalar(kind),
            ShaderType::Vector(_, n) => ShaderType::Vector(kind, *n),
            ShaderType::Matrix(_, r, c) => ShaderType::Matrix(kind, *r, *c),
            other => other.clone(),
        }
    }

    /// Element type of buffers.
    pub fn element_type(&self) -> Option<&ShaderType> {
        match self {
            ShaderType::Buffer { element, .. } => Some(element),
            _ => None,
        }
    }

    /// Check vector and matrix dimensions, recursing into structs and buffers.
    ///
    /// Vectors have 2 to 4 components; matrices have 1 to 4 rows and columns.
    pub fn check_dimensions(&self) -> Result<(), String> {
        match self {
            ShaderType::Vector(kind, n) if !(2..=4).contains(n) => Err(format!(
                "vector of {n} `{}` components (must be 2 to 4)",
                kind.to_hlsl()
            )),
            ShaderType::Matrix(kind, r, c) if !(1..=4).contains(r) || !(1..=4).contains(c) => {
                Err(format!(
                    "matrix of {r}x{c} `{}` (rows and columns must be 1 to 4)",
                    kind.to_hlsl()
                ))
            }
            ShaderType::Struct(s) => s.fields.iter().try_for_each(|field| {
                field
                    .ty
                    .check_dimensions()
                    .map_err(|reason| format!("field `{}.{}`: {reason}", s.name, field.name))
            }),
            ShaderType::Buffer { element, .. } => element.check_dimensions(),
            _ => Ok(()),
        }
    }

    /// Structs nested (depth-first, dependencies first) inside this type.
    ///
    /// A name already in `out` with a different shape is an error.
    pub fn collect_structs<'a>(&'a self, out: &mut Vec<&'a StructType>) -> Result<(), String> {
        match self {
            ShaderType::Struct(s) => {
                for field in &s.fields {
                    field.ty.collect_structs(out)?;
                }
                match out.iter().find(|known| known.name == s.name) {
                    Some(known) if *known != s => Err(format!(
                        "struct `{}` is declared with two different shapes",
                        s.name
                    )),
                    Some(_) => Ok(()),
                    None => {
                        out.push(s);
                        Ok(())
                    }
                }
            }
            ShaderType::Buffer { element, .. } => element.collect_structs(out),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ShaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hlsl())
    }
}

/// Type mapper for converting Rust types to shader types.
#[derive(Debug, Clone, Default)]
pub struct TypeMapper {
    /// User-registered aggregate types (Rust name -> type).
    custom_types: HashMap<String, ShaderType>,
}

impl TypeMapper {
    /// Create a new type mapper with the built-in mappings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a struct so it can be named in casts and annotations.
    pub fn register_struct(&mut self, ty: StructType) {
        self.custom_types
            .insert(ty.name.clone(), ShaderType::Struct(ty));
    }

    /// Map a Rust type to a shader type.
    pub fn map_type(&self, ty: &syn::Type) -> Result<ShaderType, String> {
        match ty {
            syn::Type::Path(type_path) => self.map_type_path(type_path),
            syn::Type::Paren(paren) => self.map_type(&paren.elem),
            syn::Type::Tuple(tuple) if tuple.elems.is_empty() => Ok(ShaderType::Void),
            syn::Type::Reference(_) => {
                Err("reference types cannot cross the host/GPU boundary".to_string())
            }
            syn::Type::Array(_) | syn::Type::Slice(_) => Err(
                "arrays and slices are not supported; use ReadOnlyBuffer<T> or ReadWriteBuffer<T>"
                    .to_string(),
            ),
            _ => Err(format!(
                "unsupported type `{}`",
                quote::ToTokens::to_token_stream(ty)
            )),
        }
    }

    fn map_type_path(&self, type_path: &syn::TypePath) -> Result<ShaderType, String> {
        let segment = type_path
            .path
            .segments
            .last()
            .ok_or_else(|| "empty type path".to_string())?;
        let ident = segment.ident.to_string();

        if let Some(ty) = self.custom_types.get(&ident) {
            return Ok(ty.clone());
        }

        match ident.as_str() {
            "f32" => Ok(ShaderType::FLOAT),
            "f64" => Ok(ShaderType::Scalar(ScalarKind::Double)),
            "i32" | "isize" => Ok(ShaderType::INT),
            "u32" | "usize" => Ok(ShaderType::UINT),
            "bool" => Ok(ShaderType::BOOL),
            "ThreadIds" => Ok(ShaderType::THREAD_IDS),
            "ReadOnlyBuffer" => Ok(ShaderType::read_only_buffer(
                self.extract_generic_arg(segment)?,
            )),
            "ReadWriteBuffer" => Ok(ShaderType::read_write_buffer(
                self.extract_generic_arg(segment)?,
            )),
            other => parse_vector_or_matrix(other)
                .ok_or_else(|| format!("type `{other}` has no HLSL equivalent")),
        }
    }

    fn extract_generic_arg(&self, segment: &syn::PathSegment) -> Result<ShaderType, String> {
        match &segment.arguments {
            syn::PathArguments::AngleBracketed(args) => match args.args.first() {
                Some(syn::GenericArgument::Type(ty)) => {
                    let element = self.map_type(ty)?;
                    if element.is_resource() {
                        return Err("buffers of buffers are not supported".to_string());
                    }
                    Ok(element)
                }
                _ => Err("expected a type argument".to_string()),
            },
            _ => Err(format!("`{}` needs an element type", segment.ident)),
        }
    }
}

/// Parse `Float3`, `UInt2`, `Float4x4` style names.
pub fn parse_vector_or_matrix(name: &str) -> Option<ShaderType> {
    let kinds = [
        ScalarKind::UInt,
        ScalarKind::Int,
        ScalarKind::Float,
        ScalarKind::Double,
        ScalarKind::Bool,
    ];
    let kind = kinds
        .into_iter()
        .find(|k| name.starts_with(k.rust_prefix()))?;
    let dims = &name[kind.rust_prefix().len()..];

    let parse_dim = |s: &str| -> Option<u8> {
        match s.parse::<u8>() {
            Ok(n) if (1..=4).contains(&n) => Some(n),
            _ => None,
        }
    };

    match dims.split_once('x') {
        Some((rows, cols)) => Some(ShaderType::Matrix(kind, parse_dim(rows)?, parse_dim(cols)?)),
        None => {
            let n = parse_dim(dims)?;
            if n < 2 {
                return None;
            }
            Some(ShaderType::Vector(kind, n))
        }
    }
}

/// Check if a type is the `ThreadIds` marker type.
pub fn is_thread_ids_type(ty: &syn::Type) -> bool {
    if let syn::Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            return segment.ident == "ThreadIds";
        }
    }
    false
}
