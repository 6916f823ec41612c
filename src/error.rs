//! Error and trap types shared by the whole engine.
//!
//! Traps abort the current invocation and are recovered only at the
//! [`invoke`](crate::Executor::invoke) boundary; inside the interpreter they
//! unwind unconditionally through `Result`.

use core::fmt;
use std::sync::Arc;

use downcast_rs::{impl_downcast, DowncastSync};
use thiserror::Error;

/// Classifies an error as originating from Wasm semantics or from the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrCategory {
    /// Errors defined by WebAssembly semantics.
    Wasm,
    /// User-defined errors returned verbatim from host functions.
    User,
}

macro_rules! define_trap_codes {
    (
        $( $(#[$attr:meta])* $ident:ident = $msg:literal ),* $(,)?
    ) => {
        /// A non-recoverable error raised while executing Wasm code.
        ///
        /// Terminates the current invocation; see [`Trap`].
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum TrapCode {
            $(
                $( #[$attr] )*
                $ident
            ),*
        }

        impl TrapCode {
            /// Returns the human readable trap message.
            pub fn trap_message(&self) -> &'static str {
                match self {
                    $( Self::$ident => $msg ),*
                }
            }
        }
    };
}

define_trap_codes! {
    /// Wasm code executed the `unreachable` opcode.
    Unreachable = "wasm `unreachable` instruction executed",
    /// A load or store lies outside the bounds of the accessed linear memory.
    MemoryOutOfBounds = "out of bounds memory access",
    /// A table access lies outside the bounds of the accessed table.
    TableOutOfBounds = "out of bounds table access",
    /// `call_indirect` hit a null (uninitialized) table element.
    UndefinedElement = "uninitialized element",
    /// Integer division or remainder with a zero divisor.
    DivideByZero = "integer divide by zero",
    /// Signed division overflow (`INT_MIN / -1`).
    IntegerOverflow = "integer overflow",
    /// Non-saturating float-to-int truncation of NaN or an out-of-range value.
    InvalidConvToInt = "invalid conversion to integer",
    /// The value or call stack grew past its configured limit.
    StackOverflow = "call stack exhausted",
    /// The callee type does not match the type expected by the call site.
    FuncTypeMismatch = "indirect call type mismatch",
    /// A reference value does not match the destination reference type.
    RefTypeMismatch = "reference type mismatch",
    /// A null reference was stored or passed where a non-nullable type is
    /// required.
    NonNullRequired = "null reference where non-null required",
    /// `ref.cast` failed the dynamic type check.
    CastFailed = "cast failure",
    /// A struct or array access lies outside the declared bounds.
    ArrayOutOfBounds = "out of bounds array access",
    /// The GC heap could not satisfy an allocation.
    OutOfMemory = "allocation failure: out of memory",
    /// The accumulated instruction cost crossed the configured gas limit.
    CostLimitExceeded = "cost limit exceeded",
    /// The invocation was cancelled from the outside.
    Interrupted = "execution interrupted",
    /// An exception was thrown and no enclosing `try` caught it.
    UncaughtException = "uncaught exception",
    /// The opcode belongs to a proposal that is disabled in the
    /// configuration.
    IllegalOpCode = "illegal opcode for the negotiated proposals",
    /// The host requested graceful termination of the whole invocation.
    ///
    /// Treated as success at the invoke boundary.
    Terminated = "terminated",
}

impl TrapCode {
    /// All codes defined here belong to the Wasm semantics category.
    pub fn category(&self) -> ErrCategory {
        ErrCategory::Wasm
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.trap_message())
    }
}

/// Trait that allows the host to return a custom error through a trap.
///
/// Concrete host error types can be recovered at the invoke boundary with
/// [`Trap::downcast_ref`].
pub trait HostError: DowncastSync + fmt::Display + fmt::Debug {}
impl_downcast!(sync HostError);

/// The reason of a [`Trap`].
#[derive(Debug, Clone)]
pub enum TrapKind {
    /// A trap defined by Wasm semantics.
    Code(TrapCode),
    /// An opaque user-defined error code returned by a host function.
    ///
    /// The code is limited to 24 bits and surfaced verbatim to the caller.
    User(u32),
    /// A structured error returned by a host function.
    ///
    /// Shared so that traps stay cloneable across async result handles.
    Host(Arc<dyn HostError>),
}

/// Error type raised by executing Wasm code or by the host environment.
///
/// Traps cannot be handled by WebAssembly code; they abort the invocation
/// and are reported to the embedder.
#[derive(Debug, Clone)]
pub struct Trap {
    kind: TrapKind,
}

impl Trap {
    /// Creates a new trap from its kind.
    #[cold]
    pub fn new(kind: TrapKind) -> Self {
        Self { kind }
    }

    /// Creates a user-defined trap; the code is truncated to 24 bits.
    #[cold]
    pub fn user(code: u32) -> Self {
        Self::new(TrapKind::User(code & 0x00ff_ffff))
    }

    /// Returns the kind of this trap.
    pub fn kind(&self) -> &TrapKind {
        &self.kind
    }

    /// Converts into the kind of this trap.
    pub fn into_kind(self) -> TrapKind {
        self.kind
    }

    /// Returns the [`TrapCode`] if this trap originates from Wasm semantics.
    pub fn trap_code(&self) -> Option<TrapCode> {
        match self.kind {
            TrapKind::Code(code) => Some(code),
            _ => None,
        }
    }

    /// Returns the error category of this trap.
    pub fn category(&self) -> ErrCategory {
        match self.kind {
            TrapKind::Code(_) => ErrCategory::Wasm,
            TrapKind::User(_) | TrapKind::Host(_) => ErrCategory::User,
        }
    }

    /// Whether this trap denotes graceful termination.
    pub fn is_terminated(&self) -> bool {
        matches!(self.kind, TrapKind::Code(TrapCode::Terminated))
    }

    /// Whether this trap was raised by the host.
    pub fn is_host(&self) -> bool {
        matches!(self.kind, TrapKind::User(_) | TrapKind::Host(_))
    }

    /// Downcasts a host error carried by this trap.
    pub fn downcast_ref<T: HostError>(&self) -> Option<&T> {
        match &self.kind {
            TrapKind::Host(err) => err.downcast_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            TrapKind::Code(code) => write!(f, "trap: {code}"),
            TrapKind::User(code) => write!(f, "user trap: {code:#08x}"),
            TrapKind::Host(err) => write!(f, "host trap: {err}"),
        }
    }
}

impl std::error::Error for Trap {}

impl From<TrapCode> for Trap {
    #[cold]
    fn from(code: TrapCode) -> Self {
        Self::new(TrapKind::Code(code))
    }
}

impl<E> From<E> for Trap
where
    E: HostError,
{
    #[cold]
    fn from(err: E) -> Self {
        Self::new(TrapKind::Host(Arc::new(err)))
    }
}

/// The error type of the public engine API.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An import could not be resolved against the store.
    #[error("unknown import: {module}::{name}")]
    UnknownImport {
        /// Requested module name.
        module: String,
        /// Requested item name.
        name: String,
    },
    /// An import resolved to an item of an incompatible external type.
    #[error("incompatible import type for {module}::{name}")]
    IncompatibleImportType {
        /// Requested module name.
        module: String,
        /// Requested item name.
        name: String,
    },
    /// A module with the same name is already registered.
    #[error("module name conflict: {0}")]
    ModuleNameConflict(String),
    /// The module cannot be dropped while other modules import from it.
    #[error("module still in use: {0}")]
    ModuleInUse(String),
    /// No module with the given name is registered.
    #[error("unknown module: {0}")]
    UnknownModule(String),
    /// No export with the given name exists.
    #[error("unknown export: {0}")]
    UnknownExport(String),
    /// Attempt to write an immutable global.
    #[error("cannot set the value of a constant global")]
    SetValueToConst,
    /// A value type was constructed from a code outside the negotiated
    /// proposals.
    #[error("malformed value type")]
    MalformedValType,
    /// A concrete reference type was constructed with function references
    /// disabled.
    #[error("malformed reference type")]
    MalformedRefType,
    /// Memory instance level error.
    #[error("memory: {0}")]
    Memory(String),
    /// Table instance level error.
    #[error("table: {0}")]
    Table(String),
    /// Global instance level error.
    #[error("global: {0}")]
    Global(String),
    /// Module instantiation failed.
    #[error("instantiation: {0}")]
    Instantiation(String),
    /// A trap occurred.
    #[error(transparent)]
    Trap(#[from] Trap),
}

impl Error {
    /// Returns the [`TrapCode`] if this error wraps a Wasm trap.
    pub fn trap_code(&self) -> Option<TrapCode> {
        match self {
            Self::Trap(trap) => trap.trap_code(),
            _ => None,
        }
    }
}

impl From<TrapCode> for Error {
    fn from(code: TrapCode) -> Self {
        Self::Trap(Trap::from(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct MyError(u32);

    impl fmt::Display for MyError {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "my error, code={}", self.0)
        }
    }

    impl HostError for MyError {}

    #[test]
    fn host_error_downcast() {
        let trap = Trap::from(MyError(1312));
        assert_eq!(trap.downcast_ref::<MyError>().unwrap().0, 1312);
        assert_eq!(trap.category(), ErrCategory::User);
    }

    #[test]
    fn user_code_is_truncated_to_24_bits() {
        let trap = Trap::user(0xff00_0042);
        assert!(matches!(trap.kind(), TrapKind::User(0x42)));
    }

    #[test]
    fn terminated_is_not_a_failure_code() {
        let trap = Trap::from(TrapCode::Terminated);
        assert!(trap.is_terminated());
        assert!(!trap.is_host());
    }

    #[test]
    fn errors_clone_including_host_payloads() {
        let error = Error::Trap(Trap::from(MyError(7)));
        let cloned = error.clone();
        match cloned {
            Error::Trap(trap) => assert!(trap.downcast_ref::<MyError>().is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
