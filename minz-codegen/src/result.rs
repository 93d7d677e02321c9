//! Result and error types representing the outcome of compiling a function or module.

use core::fmt;
use thiserror::Error;

/// A structural invariant that MIR construction and verification enforce.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvariantCode {
    /// A `StoreVar`/`LoadVar` or bit-field access carries an empty symbol name.
    EmptySymbol,
    /// A branch references a label that is never placed in the layout.
    UnplacedLabel,
    /// A label is placed in the layout more than once.
    DuplicateLabel,
    /// A branch references a label belonging to another function.
    ForeignLabel,
    /// A value has more than one defining instruction.
    MultipleDefinition,
    /// A value is used above its definition in the layout.
    UseBeforeDef,
    /// An `SmcPatch` targets a missing anchor or a non-TSMC callee.
    AnchorMismatch,
    /// An SMC parameter index is out of range for the callee's signature.
    BadParamIndex,
    /// Operand types disagree with the instruction's type tag.
    TypeMismatch,
    /// A TSMC function breaks the parameter-count or width limits, or is in ROM.
    TsmcLimits,
}

impl fmt::Display for InvariantCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            InvariantCode::EmptySymbol => "empty symbol on named storage access",
            InvariantCode::UnplacedLabel => "branch to a label that is never placed",
            InvariantCode::DuplicateLabel => "label placed more than once",
            InvariantCode::ForeignLabel => "branch to a label of another function",
            InvariantCode::MultipleDefinition => "value defined more than once",
            InvariantCode::UseBeforeDef => "value used before its definition",
            InvariantCode::AnchorMismatch => "SMC patch does not match a callee anchor",
            InvariantCode::BadParamIndex => "SMC parameter index out of range",
            InvariantCode::TypeMismatch => "operand type disagrees with instruction type",
            InvariantCode::TsmcLimits => "function is not eligible for the TSMC convention",
        })
    }
}

/// A compilation error.
///
/// When a function-level error is returned from the top-level compile call, no partial output
/// has been written.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// The MIR violates a structural invariant. Fatal for the function it names.
    #[error("invariant violation in {context}: {code}")]
    Invariant {
        /// Which invariant.
        code: InvariantCode,
        /// The qualified function name and site.
        context: String,
    },

    /// The active backend cannot lower an opcode. Fatal for the module; the backend registry
    /// should have refused the module earlier.
    #[error("target {target} cannot lower `{opcode}` in {function}")]
    UnsupportedOpcode {
        /// Mnemonic of the offending opcode.
        opcode: &'static str,
        /// Qualified function name.
        function: String,
        /// Backend name.
        target: &'static str,
    },

    /// An `@abi` annotation conflicts with inferred constraints. Fatal for the function.
    #[error("ABI conflict in {function}: {reason}")]
    AbiConflict {
        /// Qualified function name.
        function: String,
        /// Short rationale.
        reason: String,
    },

    /// No backend with this name is registered. Fatal for the invocation.
    #[error("no target backend named `{0}` is registered")]
    BackendUnavailable(String),
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error type.
pub type CodegenResult<T> = Result<T, CodegenError>;

impl CodegenError {
    /// Shorthand for an invariant violation.
    pub fn invariant(code: InvariantCode, context: impl Into<String>) -> Self {
        CodegenError::Invariant {
            code,
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_function() {
        let err = CodegenError::invariant(InvariantCode::EmptySymbol, "math.fact");
        assert_eq!(
            err.to_string(),
            "invariant violation in math.fact: empty symbol on named storage access"
        );

        let err = CodegenError::BackendUnavailable("pdp11".to_string());
        assert!(err.to_string().contains("pdp11"));
    }
}
