//! Function instances.
//!
//! A function is defined either by a Wasm module (locals plus a body that
//! gets a jump side-table at allocation time), by the host (a callable bound
//! to a Wasm function type, with an optional gas cost), or by a compiler (a
//! native entry point honoring the same trap and cost contract).

use std::fmt;
use std::sync::{Arc, Weak};

use crate::ast::{ControlOp, ExceptionOp, Expr, Instruction};
use crate::error::TrapCode;
use crate::host::{CallingFrame, HostFunction};
use crate::instance::ModuleInstance;
use crate::types::{DefType, FuncType, ValType};
use crate::value::Value;

/// Reference to a [`FuncInstance`] with shared ownership semantics.
#[derive(Clone)]
pub struct FuncRef(Arc<FuncInstance>);

impl core::ops::Deref for FuncRef {
    type Target = FuncInstance;
    fn deref(&self) -> &FuncInstance {
        &self.0
    }
}

impl FuncRef {
    /// Whether two references point at the same function instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Native entry point of a compiled function body.
///
/// Receives the calling frame, the arguments in declared order and the
/// output buffer; reports failure through the shared [`TrapCode`] contract
/// so that compiled and interpreted dispatch are indistinguishable.
pub type CompiledEntry =
    Arc<dyn Fn(&CallingFrame, &[Value], &mut Vec<Value>) -> Result<(), TrapCode> + Send + Sync>;

pub(crate) enum FuncKind {
    /// A function defined by Wasm code.
    Wasm {
        /// The defining module; weak so that instances do not keep their
        /// module alive (the module owns its functions, not vice versa).
        module: Weak<ModuleInstance>,
        body: Arc<FuncBody>,
    },
    /// A function implemented by the host.
    Host {
        callback: Arc<dyn HostFunction>,
        cost: Option<u64>,
    },
    /// A function with a compiled native body.
    Compiled {
        module: Weak<ModuleInstance>,
        entry: CompiledEntry,
    },
}

/// Runtime representation of a function.
pub struct FuncInstance {
    ty: DefType,
    kind: FuncKind,
}

impl fmt::Debug for FuncInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // The defining module is skipped: printing it would recurse back
        // into this function instance.
        match &self.kind {
            FuncKind::Wasm { .. } => write!(f, "Wasm {{ ty: {:?} }}", self.ty),
            FuncKind::Host { .. } => write!(f, "Host {{ ty: {:?} }}", self.ty),
            FuncKind::Compiled { .. } => write!(f, "Compiled {{ ty: {:?} }}", self.ty),
        }
    }
}

impl FuncInstance {
    /// Allocates a Wasm-defined function instance.
    pub(crate) fn alloc_wasm(
        module: Weak<ModuleInstance>,
        ty: DefType,
        body: FuncBody,
    ) -> FuncRef {
        FuncRef(Arc::new(FuncInstance {
            ty,
            kind: FuncKind::Wasm {
                module,
                body: Arc::new(body),
            },
        }))
    }

    /// Allocates a host function instance.
    ///
    /// `cost` is charged against the gas limit before each call.
    pub fn alloc_host(
        ty: DefType,
        callback: Arc<dyn HostFunction>,
        cost: Option<u64>,
    ) -> FuncRef {
        FuncRef(Arc::new(FuncInstance {
            ty,
            kind: FuncKind::Host { callback, cost },
        }))
    }

    /// Allocates a function instance carrying a compiled native body.
    pub fn alloc_compiled(
        module: Weak<ModuleInstance>,
        ty: DefType,
        entry: CompiledEntry,
    ) -> FuncRef {
        FuncRef(Arc::new(FuncInstance {
            ty,
            kind: FuncKind::Compiled { module, entry },
        }))
    }

    /// The canonical defined type of this function.
    pub fn def_type(&self) -> &DefType {
        &self.ty
    }

    /// The function signature.
    pub fn func_type(&self) -> &FuncType {
        self.ty
            .func_type()
            .expect("function instances always carry function types")
    }

    /// The defining module instance, unless this is a host function or the
    /// module was dropped.
    pub fn module(&self) -> Option<Arc<ModuleInstance>> {
        match &self.kind {
            FuncKind::Wasm { module, .. } | FuncKind::Compiled { module, .. } => module.upgrade(),
            FuncKind::Host { .. } => None,
        }
    }

    /// Whether this function is implemented by the host.
    pub fn is_host(&self) -> bool {
        matches!(self.kind, FuncKind::Host { .. })
    }

    pub(crate) fn kind(&self) -> &FuncKind {
        &self.kind
    }

    /// The interpreted body, if any.
    pub(crate) fn body(&self) -> Option<Arc<FuncBody>> {
        match &self.kind {
            FuncKind::Wasm { body, .. } => Some(Arc::clone(body)),
            _ => None,
        }
    }

    /// The host callback and its optional cost, if any.
    pub(crate) fn host(&self) -> Option<(Arc<dyn HostFunction>, Option<u64>)> {
        match &self.kind {
            FuncKind::Host { callback, cost } => Some((Arc::clone(callback), *cost)),
            _ => None,
        }
    }

    /// The compiled entry point, if any.
    pub(crate) fn compiled(&self) -> Option<CompiledEntry> {
        match &self.kind {
            FuncKind::Compiled { entry, .. } => Some(Arc::clone(entry)),
            _ => None,
        }
    }
}

/// One catch clause of a `try` block.
#[derive(Clone, Debug)]
pub(crate) struct CatchClause {
    /// Tag index within the defining module; `None` is `catch_all`.
    pub tag: Option<u32>,
    /// Position of the `catch` instruction.
    pub pc: u32,
}

/// Resolved jump targets of one structured instruction.
#[derive(Clone, Debug, Default)]
pub(crate) struct JumpInfo {
    /// Position of the matching `end`.
    pub end_pc: u32,
    /// Position of the matching `else`, or `u32::MAX`.
    pub else_pc: u32,
    /// Catch clauses of a `try`, in declaration order.
    pub catches: Option<Box<[CatchClause]>>,
}

/// The interpreted body of a Wasm function: locals, code and the jump
/// side-table computed once at allocation.
#[derive(Debug)]
pub struct FuncBody {
    pub(crate) locals: Vec<(u32, ValType)>,
    pub(crate) code: Vec<Instruction>,
    pub(crate) jumps: Vec<JumpInfo>,
}

impl FuncBody {
    /// Builds a body, resolving block/else/end/catch targets in one pass.
    pub(crate) fn new(locals: Vec<(u32, ValType)>, code: Expr) -> Self {
        let jumps = build_jump_table(&code);
        Self {
            locals,
            code,
            jumps,
        }
    }

    pub(crate) fn jump(&self, pc: usize) -> &JumpInfo {
        &self.jumps[pc]
    }
}

struct OpenBlock {
    opener_pc: u32,
    /// `else`/`catch` positions that share the opener's `end`.
    aux_pcs: Vec<u32>,
    catches: Vec<CatchClause>,
}

/// Matches every structured opener with its `else`, `catch` arms and `end`.
///
/// Validation guarantees the nesting is well formed, so the walk never
/// underflows. The implicit function block has no entry; the interpreter
/// treats its final `end` as return.
fn build_jump_table(code: &[Instruction]) -> Vec<JumpInfo> {
    let mut jumps = vec![JumpInfo::default(); code.len()];
    let mut open: Vec<OpenBlock> = Vec::new();
    for (pc, instr) in code.iter().enumerate() {
        let pc = pc as u32;
        match instr {
            Instruction::Control(ControlOp::Block(_))
            | Instruction::Control(ControlOp::Loop(_))
            | Instruction::Control(ControlOp::If(_))
            | Instruction::Exception(ExceptionOp::Try(_)) => {
                jumps[pc as usize].else_pc = u32::MAX;
                open.push(OpenBlock {
                    opener_pc: pc,
                    aux_pcs: Vec::new(),
                    catches: Vec::new(),
                });
            }
            Instruction::Control(ControlOp::Else) => {
                if let Some(block) = open.last_mut() {
                    jumps[block.opener_pc as usize].else_pc = pc;
                    block.aux_pcs.push(pc);
                }
            }
            Instruction::Exception(ExceptionOp::Catch(tag)) => {
                if let Some(block) = open.last_mut() {
                    block.catches.push(CatchClause {
                        tag: Some(*tag),
                        pc,
                    });
                    block.aux_pcs.push(pc);
                }
            }
            Instruction::Exception(ExceptionOp::CatchAll) => {
                if let Some(block) = open.last_mut() {
                    block.catches.push(CatchClause { tag: None, pc });
                    block.aux_pcs.push(pc);
                }
            }
            Instruction::Control(ControlOp::End) => {
                if let Some(block) = open.pop() {
                    jumps[block.opener_pc as usize].end_pc = pc;
                    for aux in block.aux_pcs {
                        jumps[aux as usize].end_pc = pc;
                    }
                    if !block.catches.is_empty() {
                        jumps[block.opener_pc as usize].catches =
                            Some(block.catches.into_boxed_slice());
                    }
                }
            }
            _ => {}
        }
    }
    jumps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BlockType, NumericOp};

    #[test]
    fn nested_blocks_resolve_their_ends() {
        // block ; block ; end ; end ; end(func)
        let code = vec![
            ControlOp::Block(BlockType::Empty).into(),
            ControlOp::Block(BlockType::Empty).into(),
            ControlOp::End.into(),
            ControlOp::End.into(),
            ControlOp::End.into(),
        ];
        let jumps = build_jump_table(&code);
        assert_eq!(jumps[0].end_pc, 3);
        assert_eq!(jumps[1].end_pc, 2);
    }

    #[test]
    fn if_else_targets() {
        // if ; nop ; else ; nop ; end ; end(func)
        let code = vec![
            ControlOp::If(BlockType::Empty).into(),
            ControlOp::Nop.into(),
            ControlOp::Else.into(),
            ControlOp::Nop.into(),
            ControlOp::End.into(),
            ControlOp::End.into(),
        ];
        let jumps = build_jump_table(&code);
        assert_eq!(jumps[0].else_pc, 2);
        assert_eq!(jumps[0].end_pc, 4);
        assert_eq!(jumps[2].end_pc, 4);
    }

    #[test]
    fn try_catch_clauses_are_collected() {
        // try ; nop ; catch 0 ; nop ; catch_all ; end ; end(func)
        let code = vec![
            ExceptionOp::Try(BlockType::Empty).into(),
            ControlOp::Nop.into(),
            ExceptionOp::Catch(0).into(),
            Instruction::Numeric(NumericOp::I32Const(1)),
            Instruction::Parametric(crate::ast::ParametricOp::Drop),
            ExceptionOp::CatchAll.into(),
            ControlOp::End.into(),
            ControlOp::End.into(),
        ];
        let jumps = build_jump_table(&code);
        let catches = jumps[0].catches.as_ref().unwrap();
        assert_eq!(catches.len(), 2);
        assert_eq!(catches[0].tag, Some(0));
        assert_eq!(catches[0].pc, 2);
        assert_eq!(catches[1].tag, None);
        assert_eq!(catches[1].pc, 5);
        assert_eq!(jumps[0].end_pc, 6);
        assert_eq!(jumps[2].end_pc, 6);
        assert_eq!(jumps[5].end_pc, 6);
    }
}
