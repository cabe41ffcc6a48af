//! Buffer layout planning.
//!
//! Turns an ordered list of capture declarations into a [`BufferLayout`]:
//! resources get registers, values get constant-buffer offsets.
//!
//! # Packing rules
//!
//! - Components align to 4 bytes (8 for `double`).
//! - A scalar or vector never straddles a 16-byte register; it moves to the
//!   next register instead. Vectors wider than 16 bytes start on a register.
//! - Matrices (`row_major`) and structs start on a register, and whatever
//!   follows them starts on a fresh register.
//! - Struct members follow the same rules recursively, relative to the start
//!   of the struct.
//! - The total size is rounded up to 16; with no value captures it is 0 and
//!   no constant buffer is declared.

use std::collections::HashSet;
use std::fmt::Write as _;

use thiserror::Error;

use crate::capture::{CaptureDecl, HostValue, ResourceHandle};
use crate::types::{AccessMode, ScalarKind, ShaderType, StructType};
use crate::{CompileError, Result};

/// Size of one constant-buffer register.
pub const REGISTER_SIZE: usize = 16;

/// Largest constant buffer the pipeline accepts (4096 registers).
pub const MAX_CONSTANT_BUFFER_SIZE: usize = 4096 * REGISTER_SIZE;

/// A value capture packed into the constant buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstantField {
    /// Position of the capture in declaration order.
    pub capture_index: usize,
    /// Field name in the constant buffer.
    pub name: String,
    /// Declared type.
    pub ty: ShaderType,
    /// HLSL type name.
    pub hlsl_type: String,
    /// Byte offset inside the constant buffer.
    pub offset: usize,
    /// Packed size in bytes.
    pub size: usize,
}

/// A buffer capture bound to a register.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceField {
    /// Position of the capture in declaration order.
    pub capture_index: usize,
    /// Resource name in the shader.
    pub name: String,
    /// Element type of the structured buffer.
    pub element: ShaderType,
    /// Read-only (`t#`) or read-write (`u#`).
    pub access: AccessMode,
    /// Register slot within its register class.
    pub slot: u32,
    /// HLSL type name.
    pub hlsl_type: String,
}

impl ResourceField {
    /// Register name, e.g. `u0`.
    pub fn register(&self) -> String {
        format!("{}{}", self.access.register_class(), self.slot)
    }
}

/// One entry of a [`BufferLayout`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BufferField {
    /// Packed into the constant buffer.
    Constant(ConstantField),
    /// Bound as a resource.
    Resource(ResourceField),
}

impl BufferField {
    /// Capture position in declaration order.
    pub fn capture_index(&self) -> usize {
        match self {
            BufferField::Constant(c) => c.capture_index,
            BufferField::Resource(r) => r.capture_index,
        }
    }

    /// Name in the shader.
    pub fn name(&self) -> &str {
        match self {
            BufferField::Constant(c) => &c.name,
            BufferField::Resource(r) => &r.name,
        }
    }
}

/// Errors that can occur while packing constant values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    /// Number of values does not match the number of captures.
    #[error("expected {expected} capture values, found {found}")]
    CountMismatch { expected: usize, found: usize },

    /// A value does not fit its field.
    #[error("value for `{field}` is not a `{expected}`")]
    ShapeMismatch { field: String, expected: String },
}

/// Ordered capture fields plus the constant buffer size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferLayout {
    fields: Vec<BufferField>,
    constant_size: usize,
}

impl BufferLayout {
    /// All fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[BufferField] {
        &self.fields
    }

    /// Constant buffer size in bytes (multiple of 16, 0 when empty).
    #[must_use]
    pub fn constant_size(&self) -> usize {
        self.constant_size
    }

    /// Whether a constant buffer is needed at all.
    #[must_use]
    pub fn has_constants(&self) -> bool {
        self.constant_size > 0
    }

    /// Number of captures the layout was planned for.
    #[must_use]
    pub fn capture_count(&self) -> usize {
        self.fields.len()
    }

    /// Constant-buffer fields in offset order.
    pub fn constants(&self) -> impl Iterator<Item = &ConstantField> {
        self.fields.iter().filter_map(|f| match f {
            BufferField::Constant(c) => Some(c),
            BufferField::Resource(_) => None,
        })
    }

    /// Resource fields in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceField> {
        self.fields.iter().filter_map(|f| match f {
            BufferField::Resource(r) => Some(r),
            BufferField::Constant(_) => None,
        })
    }

    /// Look up a field by capture name.
    pub fn field(&self, name: &str) -> Option<&BufferField> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// Canonical, order-stable description used for kernel identity.
    pub fn describe(&self) -> String {
        let mut out = format!("cbuffer {}\n", self.constant_size);
        for field in &self.fields {
            // Writing to a String cannot fail.
            let _ = match field {
                BufferField::Constant(c) => writeln!(
                    out,
                    "c {} {} {} @{}+{}",
                    c.capture_index, c.name, c.hlsl_type, c.offset, c.size
                ),
                BufferField::Resource(r) => writeln!(
                    out,
                    "r {} {} {} {}",
                    r.capture_index,
                    r.name,
                    r.hlsl_type,
                    r.register()
                ),
            };
        }
        out
    }

    /// Pack capture values into constant-buffer bytes.
    ///
    /// `values` holds one entry per capture in declaration order. Resource
    /// entries are skipped here; they are bound separately.
    pub fn pack_constants(&self, values: &[HostValue]) -> std::result::Result<Vec<u8>, PackError> {
        if values.len() != self.fields.len() {
            return Err(PackError::CountMismatch {
                expected: self.fields.len(),
                found: values.len(),
            });
        }

        let mut bytes = vec![0u8; self.constant_size];
        for field in self.constants() {
            let value = &values[field.capture_index];
            write_value(&mut bytes, field.offset, &field.ty, value).ok_or_else(|| {
                PackError::ShapeMismatch {
                    field: field.name.clone(),
                    expected: field.hlsl_type.clone(),
                }
            })?;
        }
        Ok(bytes)
    }

    /// Resource handles to bind, paired with their fields.
    pub fn resource_bindings<'a>(
        &'a self,
        values: &[HostValue],
    ) -> std::result::Result<Vec<(&'a ResourceField, ResourceHandle)>, PackError> {
        if values.len() != self.fields.len() {
            return Err(PackError::CountMismatch {
                expected: self.fields.len(),
                found: values.len(),
            });
        }

        self.resources()
            .map(|field| {
                values[field.capture_index]
                    .as_resource()
                    .map(|handle| (field, handle))
                    .ok_or_else(|| PackError::ShapeMismatch {
                        field: field.name.clone(),
                        expected: field.hlsl_type.clone(),
                    })
            })
            .collect()
    }
}

/// Plan the layout for an ordered list of captures.
pub fn plan_layout(captures: &[CaptureDecl]) -> Result<BufferLayout> {
    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(captures.len());
    let mut srv_slot = 0u32;
    let mut uav_slot = 0u32;
    let mut cursor = 0usize;
    let mut end = 0usize;
    let mut structs = Vec::new();

    for (capture_index, capture) in captures.iter().enumerate() {
        if !seen.insert(capture.name.as_str()) {
            return Err(CompileError::Layout(format!(
                "capture `{}` declared twice",
                capture.name
            )));
        }
        capture
            .ty
            .check_dimensions()
            .map_err(|reason| CompileError::UnsupportedCapture {
                name: capture.name.clone(),
                reason,
            })?;
        capture
            .ty
            .collect_structs(&mut structs)
            .map_err(|reason| CompileError::Type(format!("capture `{}`: {reason}", capture.name)))?;

        match &capture.ty {
            ShaderType::Buffer { element, access } => {
                let slot = match access {
                    AccessMode::ReadOnly => &mut srv_slot,
                    AccessMode::ReadWrite => &mut uav_slot,
                };
                fields.push(BufferField::Resource(ResourceField {
                    capture_index,
                    name: capture.name.clone(),
                    element: element.as_ref().clone(),
                    access: *access,
                    slot: *slot,
                    hlsl_type: capture.ty.to_hlsl(),
                }));
                *slot += 1;
            }
            ShaderType::Void => {
                return Err(CompileError::UnsupportedCapture {
                    name: capture.name.clone(),
                    reason: "captures must have a value or buffer type".to_string(),
                })
            }
            ty => {
                let placed = place(ty, cursor).map_err(|reason| CompileError::UnsupportedCapture {
                    name: capture.name.clone(),
                    reason,
                })?;
                fields.push(BufferField::Constant(ConstantField {
                    capture_index,
                    name: capture.name.clone(),
                    ty: ty.clone(),
                    hlsl_type: ty.to_hlsl(),
                    offset: placed.offset,
                    size: placed.size,
                }));
                cursor = placed.next;
                end = end.max(placed.offset + placed.size);
            }
        }
    }

    let constant_size = align_up(end, REGISTER_SIZE);
    if constant_size > MAX_CONSTANT_BUFFER_SIZE {
        return Err(CompileError::Layout(format!(
            "constant buffer needs {constant_size} bytes, limit is {MAX_CONSTANT_BUFFER_SIZE}"
        )));
    }

    tracing::trace!(
        captures = captures.len(),
        constant_size,
        "planned buffer layout"
    );

    Ok(BufferLayout {
        fields,
        constant_size,
    })
}

/// Where a value lands and where the next one may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    offset: usize,
    size: usize,
    next: usize,
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Byte distance between matrix rows.
fn row_stride(kind: ScalarKind, cols: u8) -> usize {
    align_up(kind.size() * cols as usize, REGISTER_SIZE)
}

/// Packed size of a value type.
fn packed_size(ty: &ShaderType) -> std::result::Result<usize, String> {
    match ty {
        ShaderType::Scalar(kind) => Ok(kind.size()),
        ShaderType::Vector(kind, n) => Ok(kind.size() * *n as usize),
        ShaderType::Matrix(kind, rows, cols) => {
            Ok(row_stride(*kind, *cols) * (*rows as usize - 1) + kind.size() * *cols as usize)
        }
        ShaderType::Struct(s) => Ok(struct_layout(s)?.size),
        other => Err(format!("`{other}` cannot be packed into a constant buffer")),
    }
}

/// Place a value type at or after `cursor`.
///
/// Scalars and vectors never straddle a register, except `double3` and
/// `double4`: at 24 and 32 bytes they cannot fit in one, so they start on a
/// register boundary and run into the next. Structs and matrices start on a
/// register and the value after them starts on a fresh one.
fn place(ty: &ShaderType, cursor: usize) -> std::result::Result<Placement, String> {
    let size = packed_size(ty)?;
    match ty {
        ShaderType::Scalar(kind) | ShaderType::Vector(kind, _) => {
            let mut offset = align_up(cursor, kind.size());
            let straddles = offset % REGISTER_SIZE + size > REGISTER_SIZE;
            if straddles {
                offset = align_up(offset, REGISTER_SIZE);
            }
            Ok(Placement {
                offset,
                size,
                next: offset + size,
            })
        }
        _ => {
            let offset = align_up(cursor, REGISTER_SIZE);
            Ok(Placement {
                offset,
                size,
                next: align_up(offset + size, REGISTER_SIZE),
            })
        }
    }
}

/// Member offsets of a struct, relative to its start.
#[derive(Debug, Clone)]
struct StructLayout {
    offsets: Vec<usize>,
    size: usize,
}

fn struct_layout(s: &StructType) -> std::result::Result<StructLayout, String> {
    if s.fields.is_empty() {
        return Err(format!("struct `{}` has no fields", s.name));
    }
    let mut offsets = Vec::with_capacity(s.fields.len());
    let mut cursor = 0;
    let mut end = 0;
    for field in &s.fields {
        let placed = place(&field.ty, cursor)
            .map_err(|reason| format!("field `{}.{}`: {}", s.name, field.name, reason))?;
        offsets.push(placed.offset);
        cursor = placed.next;
        end = end.max(placed.offset + placed.size);
    }
    Ok(StructLayout { offsets, size: end })
}

fn write_scalar(bytes: &mut [u8], offset: usize, kind: ScalarKind, value: &HostValue) -> Option<()> {
    let src: &[u8] = match (kind, value) {
        (ScalarKind::Float, HostValue::Float(v)) => bytemuck::bytes_of(v),
        (ScalarKind::Double, HostValue::Double(v)) => bytemuck::bytes_of(v),
        (ScalarKind::Int, HostValue::Int(v)) => bytemuck::bytes_of(v),
        (ScalarKind::UInt, HostValue::UInt(v)) => bytemuck::bytes_of(v),
        (ScalarKind::Bool, HostValue::Bool(v)) => {
            let word = u32::from(*v);
            bytes
                .get_mut(offset..offset + 4)?
                .copy_from_slice(bytemuck::bytes_of(&word));
            return Some(());
        }
        _ => return None,
    };
    bytes.get_mut(offset..offset + src.len())?.copy_from_slice(src);
    Some(())
}

fn write_value(bytes: &mut [u8], offset: usize, ty: &ShaderType, value: &HostValue) -> Option<()> {
    if !value.matches(ty) {
        return None;
    }
    match (ty, value) {
        (ShaderType::Scalar(kind), v) => write_scalar(bytes, offset, *kind, v),
        (ShaderType::Vector(kind, _), HostValue::Vector { components, .. }) => {
            for (i, component) in components.iter().enumerate() {
                write_scalar(bytes, offset + i * kind.size(), *kind, component)?;
            }
            Some(())
        }
        (ShaderType::Matrix(kind, _, cols), HostValue::Matrix { data, .. }) => {
            let stride = row_stride(*kind, *cols);
            for (i, component) in data.iter().enumerate() {
                let row = i / *cols as usize;
                let col = i % *cols as usize;
                write_scalar(bytes, offset + row * stride + col * kind.size(), *kind, component)?;
            }
            Some(())
        }
        (ShaderType::Struct(s), HostValue::Struct(values)) => {
            let layout = struct_layout(s).ok()?;
            for ((field, member_offset), value) in s.fields.iter().zip(&layout.offsets).zip(values) {
                write_value(bytes, offset + member_offset, &field.ty, value)?;
            }
            Some(())
        }
        _ => None,
    }
}

/// HLSL packoffset annotation for a constant field, e.g. `c1.y` or `c2`.
pub fn packoffset(field: &ConstantField) -> String {
    let register = field.offset / REGISTER_SIZE;
    match &field.ty {
        ShaderType::Scalar(_) | ShaderType::Vector(..) => {
            let component = ["x", "y", "z", "w"][(field.offset % REGISTER_SIZE) / 4];
            format!("c{register}.{component}")
        }
        _ => format!("c{register}"),
    }
}
