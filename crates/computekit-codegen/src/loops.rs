//! Loop lowering for HLSL code generation.
//!
//! Handles Rust for/while/loop constructs and converts them to HLSL equivalents.

use crate::types::ShaderType;

/// Represents recognized loop patterns from kernel bodies.
#[derive(Debug, Clone)]
pub enum LoopPattern {
    /// `for i in start..end` or `for i in start..=end`
    ForRange {
        var: String,
        ty: ShaderType,
        start: String,
        end: String,
        inclusive: bool,
    },
    /// `while condition { ... }`
    While { condition: String },
    /// `loop { ... }`, exited with `break`
    Loop,
}

impl LoopPattern {
    /// Generate the HLSL loop header.
    pub fn to_hlsl_header(&self) -> String {
        match self {
            LoopPattern::ForRange {
                var,
                ty,
                start,
                end,
                inclusive,
            } => {
                let op = if *inclusive { "<=" } else { "<" };
                format!("for ({ty} {var} = {start}; {var} {op} {end}; {var}++)")
            }
            LoopPattern::While { condition } => format!("while ({condition})"),
            LoopPattern::Loop => "while (true)".to_string(),
        }
    }
}

/// Information about a range expression.
#[derive(Debug, Clone)]
pub struct RangeInfo {
    /// Start expression (HLSL).
    pub start: String,
    /// End expression (HLSL).
    pub end: String,
    /// Whether the range is inclusive (`..=`)
    pub inclusive: bool,
}

impl RangeInfo {
    /// Create a new range info.
    pub fn new(start: impl Into<String>, end: impl Into<String>, inclusive: bool) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            inclusive,
        }
    }
}

/// Loop variable type for a range with the given bound types.
///
/// `uint` when either bound is unsigned, `int` otherwise.
pub fn range_var_type(start: &ShaderType, end: &ShaderType) -> Result<ShaderType, String> {
    for bound in [start, end] {
        match bound.scalar_kind() {
            Some(kind) if kind.is_integer() && bound.is_scalar() => {}
            _ => return Err(format!("range bounds must be integers, found `{bound}`")),
        }
    }
    if *start == ShaderType::UINT || *end == ShaderType::UINT {
        Ok(ShaderType::UINT)
    } else {
        Ok(ShaderType::INT)
    }
}

/// Convert a range to an HLSL for loop pattern.
pub fn range_to_for_loop(var: &str, ty: ShaderType, range: &RangeInfo) -> LoopPattern {
    LoopPattern::ForRange {
        var: var.to_string(),
        ty,
        start: range.start.clone(),
        end: range.end.clone(),
        inclusive: range.inclusive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_range_exclusive() {
        let range = RangeInfo::new("0", "10", false);
        let pattern = range_to_for_loop("i", ShaderType::INT, &range);
        assert_eq!(pattern.to_hlsl_header(), "for (int i = 0; i < 10; i++)");
    }

    #[test]
    fn test_for_range_inclusive() {
        let range = RangeInfo::new("1", "n", true);
        let pattern = range_to_for_loop("j", ShaderType::UINT, &range);
        assert_eq!(pattern.to_hlsl_header(), "for (uint j = 1; j <= n; j++)");
    }

    #[test]
    fn test_while_and_loop() {
        let pattern = LoopPattern::While {
            condition: "x > 0".to_string(),
        };
        assert_eq!(pattern.to_hlsl_header(), "while (x > 0)");
        assert_eq!(LoopPattern::Loop.to_hlsl_header(), "while (true)");
    }

    #[test]
    fn test_range_var_type() {
        assert_eq!(
            range_var_type(&ShaderType::INT, &ShaderType::INT).unwrap(),
            ShaderType::INT
        );
        assert_eq!(
            range_var_type(&ShaderType::INT, &ShaderType::UINT).unwrap(),
            ShaderType::UINT
        );
        assert!(range_var_type(&ShaderType::FLOAT, &ShaderType::INT).is_err());
    }
}
