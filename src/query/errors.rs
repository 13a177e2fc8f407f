#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Structured errors emitted by the binding compiler.
///
/// Positions are byte offsets into the directive so callers can point at the
/// offending character.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Directive is empty or whitespace-only.
    #[error("directive is empty")]
    EmptyDirective,
    /// A character is not legal in the current parse context.
    #[error("`{directive}` @ {pos}: `{found}` not valid here, expected {expected}")]
    UnexpectedChar {
        directive: String,
        pos: usize,
        found: char,
        expected: &'static str,
    },
    /// Directive ended where more input was required.
    #[error("`{directive}` ended early, expected {expected}")]
    UnexpectedEnd {
        directive: String,
        expected: &'static str,
    },
    /// `,` or `)` reached outside of an argument list.
    #[error("`{directive}` @ {pos}: `{found}` not valid for unnested expression")]
    TopLevelTerminator {
        directive: String,
        pos: usize,
        found: char,
    },
    /// `<`/`>` was not followed by a slot number.
    #[error("`{directive}` @ {pos}: `{text}` is not a local slot index")]
    InvalidSlot {
        directive: String,
        pos: usize,
        text: String,
    },
    /// `<N` without `?` read a slot nothing stored.
    #[error("`{directive}`: local {slot} not stored")]
    LocalUnset { directive: String, slot: usize },
    /// `>N` with nothing to store.
    #[error("`{directive}` @ {pos}: attempted store on empty expression")]
    StoreOnVoid { directive: String, pos: usize },
    /// Referenced object type is absent from the schema.
    #[error("unknown type '{name}'")]
    UnknownType { name: String },
    /// Field lookup failed on the current context.
    #[error("type '{ty}' has no field '{name}'")]
    NoSuchField { ty: String, name: String },
    /// No method with this name and arity exists.
    #[error("type '{ty}' has no method '{name}' taking {arity} argument(s)")]
    NoSuchMethod {
        ty: String,
        name: String,
        arity: usize,
    },
    /// Methods exist but none accepts the argument types.
    #[error("no overload of '{ty}.{name}' accepts ({args})")]
    NoApplicableOverload {
        ty: String,
        name: String,
        args: String,
    },
    /// `^` used without a side provider configured.
    #[error("`{directive}`: side provider dereferenced but none is configured")]
    NoSideProvider { directive: String },
}

impl CompileError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::EmptyDirective => "EmptyDirective",
            CompileError::UnexpectedChar { .. } => "UnexpectedChar",
            CompileError::UnexpectedEnd { .. } => "UnexpectedEnd",
            CompileError::TopLevelTerminator { .. } => "TopLevelTerminator",
            CompileError::InvalidSlot { .. } => "InvalidSlot",
            CompileError::LocalUnset { .. } => "LocalUnset",
            CompileError::StoreOnVoid { .. } => "StoreOnVoid",
            CompileError::UnknownType { .. } => "UnknownType",
            CompileError::NoSuchField { .. } => "UnresolvedIdentifier",
            CompileError::NoSuchMethod { .. } => "UnresolvedIdentifier",
            CompileError::NoApplicableOverload { .. } => "NoApplicableOverload",
            CompileError::NoSideProvider { .. } => "NoSideProvider",
        }
    }
}

/// Structural problems in a query descriptor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// No table with id 0.
    #[error("descriptor '{query}' has no primary table (id 0)")]
    MissingPrimaryTable { query: String },
    /// Two tables share an id.
    #[error("descriptor '{query}' declares table {id} more than once")]
    DuplicateTable { query: String, id: u32 },
    /// Table ids are not dense from zero.
    #[error("descriptor '{query}' skips table id {expected}")]
    SparseTableIds { query: String, expected: u32 },
    /// More tables than alias letters.
    #[error("descriptor '{query}' joins {count} tables, at most {max} supported")]
    TooManyTables {
        query: String,
        count: usize,
        max: usize,
    },
    /// A reference names a table that does not exist.
    #[error("descriptor '{query}' references unknown table {id} in {context}")]
    UnknownTable {
        query: String,
        id: u32,
        context: &'static str,
    },
    /// A secondary table lacks its join predicate.
    #[error("descriptor '{query}' table {id} ('{name}') has no join columns")]
    MissingJoin { query: String, id: u32, name: String },
    /// The primary table declared a join.
    #[error("descriptor '{query}' primary table '{name}' cannot be joined")]
    PrimaryJoined { query: String, name: String },
    /// Nothing is selected.
    #[error("descriptor '{query}' has no projections")]
    NoProjections { query: String },
    /// A column path has no segments or a blank segment.
    #[error("descriptor '{query}' has an empty column path in {context}")]
    EmptyPath {
        query: String,
        context: &'static str,
    },
    /// Placeholder count and directive count disagree.
    #[error(
        "descriptor '{query}' fragment `{fragment}` has {placeholders} placeholder(s) but {values} value(s)"
    )]
    PlaceholderMismatch {
        query: String,
        fragment: String,
        placeholders: usize,
        values: usize,
    },
}

impl DescriptorError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            DescriptorError::MissingPrimaryTable { .. } => "MissingPrimaryTable",
            DescriptorError::DuplicateTable { .. } => "DuplicateTable",
            DescriptorError::SparseTableIds { .. } => "SparseTableIds",
            DescriptorError::TooManyTables { .. } => "TooManyTables",
            DescriptorError::UnknownTable { .. } => "UnknownTable",
            DescriptorError::MissingJoin { .. } => "MissingJoin",
            DescriptorError::PrimaryJoined { .. } => "PrimaryJoined",
            DescriptorError::NoProjections { .. } => "NoProjections",
            DescriptorError::EmptyPath { .. } => "EmptyPath",
            DescriptorError::PlaceholderMismatch { .. } => "PlaceholderMismatch",
        }
    }
}

/// Convenience wrapper that formats compile errors with their codes.
pub struct CompileErrorWithCode<'a>(pub &'a CompileError);

impl fmt::Display for CompileErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}
