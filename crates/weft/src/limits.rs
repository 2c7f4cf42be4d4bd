//! Execution limits for rendering untrusted templates

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::ast::SourceLocation;

/// Counters checked before every loop iteration, function call, node
/// descent and component render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub max_loop_nesting: usize,
    pub max_iterations_per_loop: usize,
    pub max_total_iterations: usize,
    pub max_function_call_depth: usize,
    pub max_recursion_depth: usize,
    pub max_component_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_loop_nesting: 10,
            max_iterations_per_loop: 10_000,
            max_total_iterations: 100_000,
            max_function_call_depth: 64,
            max_recursion_depth: 512,
            max_component_depth: 32,
        }
    }
}

impl ResourceLimits {
    pub fn max(&self, limit: LimitType) -> usize {
        match limit {
            LimitType::LoopNesting => self.max_loop_nesting,
            LimitType::IterationsPerLoop => self.max_iterations_per_loop,
            LimitType::TotalIterations => self.max_total_iterations,
            LimitType::FunctionCallDepth => self.max_function_call_depth,
            LimitType::RecursionDepth => self.max_recursion_depth,
            LimitType::ComponentDepth => self.max_component_depth,
        }
    }

    /// Error if `current` is past the configured maximum for `limit`.
    pub fn check(
        &self,
        limit: LimitType,
        current: usize,
        location: &SourceLocation,
    ) -> Result<(), ResourceLimitError> {
        let max = self.max(limit);
        if current > max {
            Err(ResourceLimitError {
                limit_type: limit,
                current,
                max,
                location: location.clone(),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitType {
    LoopNesting,
    IterationsPerLoop,
    TotalIterations,
    FunctionCallDepth,
    RecursionDepth,
    ComponentDepth,
}

impl LimitType {
    pub fn code(self) -> &'static str {
        match self {
            LimitType::LoopNesting => "LOOP_NESTING_EXCEEDED",
            LimitType::IterationsPerLoop | LimitType::TotalIterations => {
                "ITERATION_LIMIT_EXCEEDED"
            }
            LimitType::FunctionCallDepth => "FUNCTION_CALL_DEPTH_EXCEEDED",
            LimitType::RecursionDepth => "RECURSION_DEPTH_EXCEEDED",
            LimitType::ComponentDepth => "COMPONENT_DEPTH_EXCEEDED",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LimitType::LoopNesting => "loopNesting",
            LimitType::IterationsPerLoop => "iterationsPerLoop",
            LimitType::TotalIterations => "totalIterations",
            LimitType::FunctionCallDepth => "functionCallDepth",
            LimitType::RecursionDepth => "recursionDepth",
            LimitType::ComponentDepth => "componentDepth",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{limit_type} limit exceeded at {location}: {current} > {max}")]
pub struct ResourceLimitError {
    pub limit_type: LimitType,
    pub current: usize,
    pub max: usize,
    pub location: SourceLocation,
}

impl ResourceLimitError {
    pub fn code(&self) -> &'static str {
        self.limit_type.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_allows_up_to_max() {
        let limits = ResourceLimits {
            max_loop_nesting: 2,
            ..ResourceLimits::default()
        };
        let loc = SourceLocation::default();
        assert!(limits.check(LimitType::LoopNesting, 2, &loc).is_ok());

        let err = limits.check(LimitType::LoopNesting, 3, &loc).unwrap_err();
        assert_eq!(err.current, 3);
        assert_eq!(err.max, 2);
        assert_eq!(err.code(), "LOOP_NESTING_EXCEEDED");
        assert_eq!(err.limit_type.to_string(), "loopNesting");
    }
}
