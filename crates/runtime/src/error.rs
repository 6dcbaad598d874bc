//! Runtime error taxonomy.
//!
//! Every fallible registry or dispatch operation returns
//! `Result<_, HybrisError>`; the engine converts an `Err` into the
//! current frame's `Exception` state at the point of evaluation, so
//! propagation stays uniform with `return` instead of unwinding through
//! host panics.

use std::fmt;

/// The error kinds a script can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Parser violations, duplicate definitions, reserved-name misuse,
    /// native-call arity mismatches.
    Syntax,
    /// Undeclared identifier or unknown function.
    Name,
    /// Type mismatch on an operator or a native argument.
    Type,
    /// Private/protected member accessed from outside its scope.
    Access,
    /// Missing attribute.
    Attribute,
    /// Out-of-bounds subscript.
    Index,
    /// Arithmetic faults, FFI failures, I/O errors.
    Runtime,
    /// `self` used outside a method body.
    Scope,
    /// Memory cap exceeded. Fatal: never caught by script code.
    OutOfMemory,
    /// Recursion/nesting limit exceeded.
    StackOverflow,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Name => "NameError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Access => "AccessError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Scope => "ScopeError",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::StackOverflow => "StackOverflow",
        };
        write!(f, "{}", name)
    }
}

/// An error raised by the runtime, carried through a frame's exception
/// state as its rendered string form.
#[derive(Debug, Clone, PartialEq)]
pub struct HybrisError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HybrisError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        HybrisError {
            kind,
            message: message.into(),
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn name(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Name, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn access(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Access, message)
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Attribute, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }
}

impl fmt::Display for HybrisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HybrisError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = HybrisError::name("'x' undeclared identifier");
        assert_eq!(err.to_string(), "NameError: 'x' undeclared identifier");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::OutOfMemory.to_string(), "OutOfMemory");
        assert_eq!(ErrorKind::StackOverflow.to_string(), "StackOverflow");
        assert_eq!(ErrorKind::Access.to_string(), "AccessError");
    }
}
