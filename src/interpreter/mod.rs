//! The instruction interpreter.
//!
//! A single threaded loop reads the next instruction of the active frame
//! and dispatches on the family tag. Structured control uses the function
//! body's jump side-table; branches unwind the label stack, returns unwind
//! the current frame, tail calls replace it in place. Per opcode the loop
//! observes the cancellation flag and, when enabled, charges gas before
//! counting the instruction as retired.

pub(crate) mod stack;

mod numeric;
mod simd;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::ast::{
    AtomicOp, BlockType, ControlOp, ExceptionOp, GcOp, Instruction, MemArg, MemoryOp,
    ParametricOp, RefOp, SimdOp, TableOp, VariableOp,
};
use crate::config::Proposal;
use crate::error::{Trap, TrapCode};
use crate::executor::Executor;
use crate::func::{FuncRef, FuncKind};
use crate::host::CallingFrame;
use crate::instance::ModuleInstance;
use crate::memory::MemoryRef;
use crate::table::TableInstance;
use crate::types::{heap_matches, val_matches, DefType, HeapType, RefType, StorageType, ValType};
use crate::value::{LittleEndianConvert, RefValue, Value};

use stack::{CallStack, Exception, Frame, Label, LabelKind, ValueStack};

/// What the executed instruction asks the loop to do next.
enum Control {
    Next,
    Jump(usize),
    Call { func: FuncRef, tail: bool },
    Return,
    Throw(Exception),
}

pub(crate) struct Interpreter<'e> {
    exec: &'e Executor,
    values: ValueStack,
    labels: Vec<Label>,
    frames: CallStack,
}

impl<'e> Interpreter<'e> {
    pub(crate) fn new(exec: &'e Executor) -> Self {
        Self {
            exec,
            values: ValueStack::new(exec.config().max_value_stack()),
            labels: Vec::new(),
            frames: CallStack::new(exec.config().max_call_depth()),
        }
    }

    /// Runs `func` with `args` to completion and returns the results.
    pub(crate) fn invoke(&mut self, func: &FuncRef, args: &[Value]) -> Result<Vec<Value>, Trap> {
        check_args(func, args)?;
        for arg in args {
            self.values.push(arg.clone())?;
        }
        match func.kind() {
            FuncKind::Host { .. } => {
                let finished = self.call_host(func, false, None)?;
                debug_assert!(finished);
            }
            FuncKind::Compiled { .. } => {
                let finished = self.call_compiled(func, false, func.module())?;
                debug_assert!(finished);
            }
            FuncKind::Wasm { .. } => {
                self.push_frame(func.clone(), false)?;
                self.run()?;
            }
        }
        let arity = func.func_type().results().len();
        Ok(self.values.pop_n(arity))
    }

    fn cur_module(&self) -> Arc<ModuleInstance> {
        Arc::clone(&self.frames.peek().module)
    }

    fn run(&mut self) -> Result<(), Trap> {
        let stats = self.exec.statistics();
        let stat_cfg = self.exec.config().statistics();
        loop {
            if self.exec.is_cancelled() {
                return Err(TrapCode::Interrupted.into());
            }
            let (body, pc, module) = {
                let frame = self.frames.top();
                (Arc::clone(&frame.body), frame.pc, Arc::clone(&frame.module))
            };
            let instr = &body.code[pc];
            self.check_proposals(instr)?;
            if stat_cfg.cost && !stats.add_instr_cost(instr.opcode()) {
                // The crossing opcode traps and is not counted as retired.
                return Err(TrapCode::CostLimitExceeded.into());
            }
            if stat_cfg.instr_count {
                stats.inc_instr_count();
            }
            self.frames.top().pc = pc + 1;
            match self.step(instr, pc, &body, &module)? {
                Control::Next => {}
                Control::Jump(target) => self.frames.top().pc = target,
                Control::Call { func, tail } => {
                    if self.do_call(func, tail)? {
                        return Ok(());
                    }
                }
                Control::Return => {
                    if self.do_return() {
                        return Ok(());
                    }
                }
                Control::Throw(exception) => self.do_throw(exception)?,
            }
        }
    }

    /// Traps [`TrapCode::IllegalOpCode`] on opcodes of disabled proposals.
    fn check_proposals(&self, instr: &Instruction) -> Result<(), Trap> {
        let proposals = self.exec.config().proposals();
        let illegal = match instr {
            Instruction::Atomic(_) => !proposals.contains(Proposal::Threads),
            Instruction::Exception(_) => !proposals.contains(Proposal::ExceptionHandling),
            Instruction::Gc(_) => !proposals.contains(Proposal::GC),
            Instruction::Simd(op) => {
                op.is_relaxed() && !proposals.contains(Proposal::RelaxedSimd)
            }
            Instruction::Control(ControlOp::ReturnCall(_))
            | Instruction::Control(ControlOp::ReturnCallIndirect(..)) => {
                !proposals.contains(Proposal::TailCall)
            }
            Instruction::Control(ControlOp::CallRef(_)) => {
                !proposals.contains(Proposal::FunctionReferences)
            }
            Instruction::Control(ControlOp::ReturnCallRef(_)) => {
                !proposals.contains(Proposal::FunctionReferences)
                    || !proposals.contains(Proposal::TailCall)
            }
            _ => false,
        };
        if illegal {
            return Err(TrapCode::IllegalOpCode.into());
        }
        Ok(())
    }

    fn block_arity(&self, module: &ModuleInstance, bt: &BlockType) -> (usize, usize) {
        match bt {
            BlockType::Empty => (0, 0),
            BlockType::Value(_) => (0, 1),
            BlockType::Func(idx) => {
                let def = module
                    .type_by_index(*idx)
                    .expect("validation proved the block type index");
                let ty = def.func_type().expect("block types are function types");
                (ty.params().len(), ty.results().len())
            }
        }
    }

    fn push_label(&mut self, label: Label) {
        self.labels.push(label);
    }

    /// Branch to relative label `depth`; branching past the outermost label
    /// of the frame returns from the function.
    fn branch(&mut self, depth: u32) -> Control {
        let frame_labels = self.labels.len() - self.frames.top().label_base;
        if depth as usize >= frame_labels {
            return Control::Return;
        }
        let idx = self.labels.len() - 1 - depth as usize;
        let (arity, height, target) = {
            let label = &self.labels[idx];
            (label.arity, label.height, label.target)
        };
        self.values.truncate_keep(height, arity);
        self.labels.truncate(idx);
        Control::Jump(target as usize)
    }

    fn push_frame(&mut self, func: FuncRef, tail: bool) -> Result<(), Trap> {
        let body = func.body().expect("wasm frames carry interpreted bodies");
        let module = func
            .module()
            .expect("wasm functions outlive their defining module");
        let ty = func.func_type();
        let mut locals = self.values.pop_n(ty.params().len());
        for (count, val_type) in &body.locals {
            let default = Value::default(&module.canon_val_type(val_type))
                .expect("validation rejects non-defaultable locals");
            for _ in 0..*count {
                locals.push(default.clone());
            }
        }
        let return_arity = ty.results().len();
        if tail {
            self.unwind_frame();
        }
        self.frames.push(Frame {
            func,
            module,
            body,
            locals,
            pc: 0,
            return_arity,
            label_base: self.labels.len(),
            height: self.values.len(),
        })?;
        Ok(())
    }

    /// Drops the current frame's labels and operands, keeping nothing.
    fn unwind_frame(&mut self) {
        let frame = self.frames.pop().expect("an active frame exists");
        self.labels.truncate(frame.label_base);
        self.values.truncate_keep(frame.height, 0);
    }

    /// Returns `true` once the entry frame has returned.
    fn do_return(&mut self) -> bool {
        let frame = self.frames.pop().expect("an active frame exists");
        self.labels.truncate(frame.label_base);
        self.values.truncate_keep(frame.height, frame.return_arity);
        self.frames.is_empty()
    }

    /// Returns `true` once the whole invocation finished (tail call into a
    /// host function at the bottom frame).
    fn do_call(&mut self, func: FuncRef, tail: bool) -> Result<bool, Trap> {
        match func.kind() {
            FuncKind::Host { .. } => {
                let module = Some(self.cur_module());
                self.call_host(&func, tail, module)
            }
            // `force_interpreter` cannot help a function that only carries
            // a native body; the entry point honors the same contract.
            FuncKind::Compiled { .. } => {
                let module = Some(self.cur_module());
                self.call_compiled(&func, tail, module)
            }
            FuncKind::Wasm { .. } => {
                self.push_frame(func, tail)?;
                Ok(false)
            }
        }
    }

    /// The host-function bridge of the calling-frame contract.
    fn call_host(
        &mut self,
        func: &FuncRef,
        tail: bool,
        module: Option<Arc<ModuleInstance>>,
    ) -> Result<bool, Trap> {
        let (callback, cost) = func.host().expect("host path takes host functions");
        let stats = self.exec.statistics();
        let stat_cfg = self.exec.config().statistics();
        if let Some(cost) = cost {
            if stat_cfg.cost && !stats.add_cost(cost) {
                return Err(TrapCode::CostLimitExceeded.into());
            }
        }
        let ty = func.func_type();
        let args = self.values.pop_n(ty.params().len());
        if tail {
            self.unwind_frame();
        }
        let frame = CallingFrame::new(self.exec, module);
        if stat_cfg.time {
            stats.start_record_host();
        }
        let result = callback.call(&frame, &args);
        if stat_cfg.time {
            stats.stop_record_host();
        }
        // Cancellation is observed at every host return as well.
        if self.exec.is_cancelled() {
            return Err(TrapCode::Interrupted.into());
        }
        let rets = result.map_err(Trap::from)?;
        check_results(func.def_type(), ty.results(), &rets)?;
        self.values.push_n(rets)?;
        Ok(self.frames.is_empty())
    }

    /// Dispatch into a compiled native body; identical contract.
    fn call_compiled(
        &mut self,
        func: &FuncRef,
        tail: bool,
        module: Option<Arc<ModuleInstance>>,
    ) -> Result<bool, Trap> {
        let entry = func.compiled().expect("compiled path takes compiled functions");
        if self.exec.config().force_interpreter() {
            // Nothing to fall back to: the function carries no interpreted
            // body, so the native entry runs regardless.
            log::debug!("force_interpreter set, but the callee only has a native body");
        }
        let ty = func.func_type();
        let args = self.values.pop_n(ty.params().len());
        if tail {
            self.unwind_frame();
        }
        let frame = CallingFrame::new(self.exec, module);
        let mut rets = Vec::with_capacity(ty.results().len());
        entry(&frame, &args, &mut rets).map_err(Trap::from)?;
        check_results(func.def_type(), ty.results(), &rets)?;
        self.values.push_n(rets)?;
        Ok(self.frames.is_empty())
    }

    /// Unwinds frames and labels to the innermost matching `try`.
    fn do_throw(&mut self, exception: Exception) -> Result<(), Trap> {
        loop {
            let label_base = self.frames.top().label_base;
            while self.labels.len() > label_base {
                let (is_try, try_pc, height) = {
                    let label = self.labels.last().expect("label depth checked");
                    match label.kind {
                        LabelKind::Try { try_pc } => (true, try_pc, label.height),
                        _ => (false, 0, 0),
                    }
                };
                if is_try {
                    let body = Arc::clone(&self.frames.top().body);
                    let module = self.cur_module();
                    let clauses = body.jump(try_pc as usize).catches.clone();
                    let mut handler = None;
                    if let Some(clauses) = &clauses {
                        for clause in clauses.iter() {
                            match clause.tag {
                                None => {
                                    handler = Some((clause.pc, false));
                                    break;
                                }
                                Some(tag_idx) => {
                                    let tag = module
                                        .tag_by_index(tag_idx)
                                        .expect("validation proved the tag index");
                                    if crate::instance::TagRef::ptr_eq(&tag, &exception.tag) {
                                        handler = Some((clause.pc, true));
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    if let Some((handler_pc, carries_values)) = handler {
                        self.values.truncate_keep(height, 0);
                        if carries_values {
                            self.values.push_n(exception.values.clone())?;
                        }
                        let label = self.labels.last_mut().expect("label depth checked");
                        label.kind = LabelKind::Catch { exception };
                        self.frames.top().pc = handler_pc as usize + 1;
                        return Ok(());
                    }
                }
                self.labels.pop();
            }
            self.unwind_frame();
            if self.frames.is_empty() {
                return Err(TrapCode::UncaughtException.into());
            }
        }
    }

    fn memory(&self, index: u32) -> MemoryRef {
        self.cur_module()
            .memory_by_index(index)
            .expect("validation proved the memory index")
    }

    fn effective_addr(&mut self, memarg: &MemArg) -> u64 {
        let base = self.values.pop_as::<u32>();
        base as u64 + memarg.offset
    }

    fn load<T>(&mut self, memarg: &MemArg) -> Result<T, TrapCode>
    where
        T: LittleEndianConvert,
    {
        let addr = self.effective_addr(memarg);
        self.memory(memarg.memory).get_value(addr)
    }

    fn store<T>(&mut self, memarg: &MemArg, value: T) -> Result<(), TrapCode>
    where
        T: LittleEndianConvert,
    {
        let addr = self.effective_addr(memarg);
        self.memory(memarg.memory).set_value(addr, value)
    }

    fn step(
        &mut self,
        instr: &Instruction,
        pc: usize,
        body: &Arc<crate::func::FuncBody>,
        module: &Arc<ModuleInstance>,
    ) -> Result<Control, Trap> {
        match instr {
            Instruction::Numeric(op) => {
                numeric::run(op, &mut self.values)?;
                Ok(Control::Next)
            }
            Instruction::Control(op) => self.step_control(op, pc, body, module),
            Instruction::Exception(op) => self.step_exception(op, pc, body, module),
            Instruction::Parametric(op) => self.step_parametric(op),
            Instruction::Variable(op) => self.step_variable(op, module),
            Instruction::Ref(op) => self.step_ref(op, module),
            Instruction::Gc(op) => self.step_gc(op, module),
            Instruction::Table(op) => self.step_table(op, module),
            Instruction::Memory(op) => self.step_memory(op, module),
            Instruction::Simd(op) => self.step_simd(op),
            Instruction::Atomic(op) => self.step_atomic(op),
        }
    }

    fn step_control(
        &mut self,
        op: &ControlOp,
        pc: usize,
        body: &Arc<crate::func::FuncBody>,
        module: &Arc<ModuleInstance>,
    ) -> Result<Control, Trap> {
        match op {
            ControlOp::Unreachable => Err(TrapCode::Unreachable.into()),
            ControlOp::Nop => Ok(Control::Next),
            ControlOp::Block(bt) => {
                let (params, results) = self.block_arity(module, bt);
                let end_pc = body.jump(pc).end_pc;
                self.push_label(Label {
                    arity: results,
                    target: end_pc + 1,
                    height: self.values.len() - params,
                    kind: LabelKind::Block,
                });
                Ok(Control::Next)
            }
            ControlOp::Loop(bt) => {
                let (params, _results) = self.block_arity(module, bt);
                self.push_label(Label {
                    arity: params,
                    target: pc as u32,
                    height: self.values.len() - params,
                    kind: LabelKind::Loop,
                });
                Ok(Control::Next)
            }
            ControlOp::If(bt) => {
                let condition = self.values.pop_as::<i32>();
                let (params, results) = self.block_arity(module, bt);
                let jump = body.jump(pc);
                let (end_pc, else_pc) = (jump.end_pc, jump.else_pc);
                self.push_label(Label {
                    arity: results,
                    target: end_pc + 1,
                    height: self.values.len() - params,
                    kind: LabelKind::If,
                });
                if condition != 0 {
                    Ok(Control::Next)
                } else if else_pc != u32::MAX {
                    Ok(Control::Jump(else_pc as usize + 1))
                } else {
                    // No else: fall to the end, which pops the label.
                    Ok(Control::Jump(end_pc as usize))
                }
            }
            ControlOp::Else => {
                // The then-branch ran to completion; jump to the end.
                let end_pc = body.jump(pc).end_pc;
                Ok(Control::Jump(end_pc as usize))
            }
            ControlOp::End => {
                if self.labels.len() > self.frames.top().label_base {
                    self.labels.pop();
                    Ok(Control::Next)
                } else {
                    Ok(Control::Return)
                }
            }
            ControlOp::Br(depth) => Ok(self.branch(*depth)),
            ControlOp::BrIf(depth) => {
                let condition = self.values.pop_as::<i32>();
                if condition != 0 {
                    Ok(self.branch(*depth))
                } else {
                    Ok(Control::Next)
                }
            }
            ControlOp::BrTable(targets, default) => {
                let index = self.values.pop_as::<u32>() as usize;
                let depth = targets.get(index).copied().unwrap_or(*default);
                Ok(self.branch(depth))
            }
            ControlOp::Return => Ok(Control::Return),
            ControlOp::Call(func_idx) => {
                let func = module
                    .func_by_index(*func_idx)
                    .expect("validation proved the function index");
                Ok(Control::Call { func, tail: false })
            }
            ControlOp::ReturnCall(func_idx) => {
                let func = module
                    .func_by_index(*func_idx)
                    .expect("validation proved the function index");
                Ok(Control::Call { func, tail: true })
            }
            ControlOp::CallIndirect(table_idx, type_idx) => {
                let func = self.indirect_callee(module, *table_idx, *type_idx)?;
                Ok(Control::Call { func, tail: false })
            }
            ControlOp::ReturnCallIndirect(table_idx, type_idx) => {
                let func = self.indirect_callee(module, *table_idx, *type_idx)?;
                Ok(Control::Call { func, tail: true })
            }
            ControlOp::CallRef(_type_idx) => {
                let func = self.ref_callee()?;
                Ok(Control::Call { func, tail: false })
            }
            ControlOp::ReturnCallRef(_type_idx) => {
                let func = self.ref_callee()?;
                Ok(Control::Call { func, tail: true })
            }
        }
    }

    fn indirect_callee(
        &mut self,
        module: &Arc<ModuleInstance>,
        table_idx: u32,
        type_idx: u32,
    ) -> Result<FuncRef, Trap> {
        let index = self.values.pop_as::<u32>();
        let table = module
            .table_by_index(table_idx)
            .expect("validation proved the table index");
        let entry = table
            .get(index)
            .map_err(|_| Trap::from(TrapCode::UndefinedElement))?;
        let func = match entry {
            RefValue::Null(_) => return Err(TrapCode::UndefinedElement.into()),
            RefValue::Func(func) => func,
            _ => return Err(TrapCode::FuncTypeMismatch.into()),
        };
        let expected = module
            .type_by_index(type_idx)
            .expect("validation proved the type index");
        if !func.def_type().matches(&expected) {
            return Err(TrapCode::FuncTypeMismatch.into());
        }
        Ok(func)
    }

    fn ref_callee(&mut self) -> Result<FuncRef, Trap> {
        match self.values.pop_as::<RefValue>() {
            RefValue::Null(_) => Err(TrapCode::NonNullRequired.into()),
            RefValue::Func(func) => Ok(func),
            _ => Err(TrapCode::FuncTypeMismatch.into()),
        }
    }

    fn step_exception(
        &mut self,
        op: &ExceptionOp,
        pc: usize,
        body: &Arc<crate::func::FuncBody>,
        module: &Arc<ModuleInstance>,
    ) -> Result<Control, Trap> {
        match op {
            ExceptionOp::Try(bt) => {
                let (params, results) = self.block_arity(module, bt);
                let end_pc = body.jump(pc).end_pc;
                self.push_label(Label {
                    arity: results,
                    target: end_pc + 1,
                    height: self.values.len() - params,
                    kind: LabelKind::Try { try_pc: pc as u32 },
                });
                Ok(Control::Next)
            }
            ExceptionOp::Catch(_) | ExceptionOp::CatchAll => {
                // The try body completed without throwing; skip the arms.
                let end_pc = body.jump(pc).end_pc;
                Ok(Control::Jump(end_pc as usize))
            }
            ExceptionOp::Throw(tag_idx) => {
                let tag = module
                    .tag_by_index(*tag_idx)
                    .expect("validation proved the tag index");
                let arity = tag
                    .ty()
                    .func_type()
                    .expect("tag types are function types")
                    .params()
                    .len();
                let values = self.values.pop_n(arity);
                Ok(Control::Throw(Exception { tag, values }))
            }
            ExceptionOp::Rethrow(depth) => {
                let idx = self.labels.len() - 1 - *depth as usize;
                let exception = match &self.labels[idx].kind {
                    LabelKind::Catch { exception } => Exception {
                        tag: exception.tag.clone(),
                        values: exception.values.clone(),
                    },
                    _ => unreachable!("validation targets rethrow at catch labels"),
                };
                Ok(Control::Throw(exception))
            }
        }
    }

    fn step_parametric(&mut self, op: &ParametricOp) -> Result<Control, Trap> {
        match op {
            ParametricOp::Drop => {
                self.values.pop();
            }
            ParametricOp::Select | ParametricOp::SelectT(_) => {
                let condition = self.values.pop_as::<i32>();
                let on_false = self.values.pop();
                let on_true = self.values.pop();
                self.values
                    .push(if condition != 0 { on_true } else { on_false })?;
            }
        }
        Ok(Control::Next)
    }

    fn step_variable(
        &mut self,
        op: &VariableOp,
        module: &Arc<ModuleInstance>,
    ) -> Result<Control, Trap> {
        match op {
            VariableOp::LocalGet(idx) => {
                let value = self.frames.top().locals[*idx as usize].clone();
                self.values.push(value)?;
            }
            VariableOp::LocalSet(idx) => {
                let value = self.values.pop();
                self.frames.top().locals[*idx as usize] = value;
            }
            VariableOp::LocalTee(idx) => {
                let value = self.values.peek().clone();
                self.frames.top().locals[*idx as usize] = value;
            }
            VariableOp::GlobalGet(idx) => {
                let global = module
                    .global_by_index(*idx)
                    .expect("validation proved the global index");
                self.values.push(global.get())?;
            }
            VariableOp::GlobalSet(idx) => {
                let global = module
                    .global_by_index(*idx)
                    .expect("validation proved the global index");
                global.set_unchecked(self.values.pop());
            }
        }
        Ok(Control::Next)
    }

    fn step_ref(&mut self, op: &RefOp, module: &Arc<ModuleInstance>) -> Result<Control, Trap> {
        match op {
            RefOp::RefNull(heap) => {
                let heap = module.canon_heap(heap);
                self.values.push(Value::Ref(RefValue::Null(heap)))?;
                Ok(Control::Next)
            }
            RefOp::RefIsNull => {
                let value = self.values.pop_as::<RefValue>();
                self.values.push(Value::from(value.is_null()))?;
                Ok(Control::Next)
            }
            RefOp::RefFunc(idx) => {
                let func = module
                    .func_by_index(*idx)
                    .expect("validation proved the function index");
                self.values.push(Value::Ref(RefValue::Func(func)))?;
                Ok(Control::Next)
            }
            RefOp::RefEq => {
                let rhs = self.values.pop_as::<RefValue>();
                let lhs = self.values.pop_as::<RefValue>();
                self.values.push(Value::from(lhs == rhs))?;
                Ok(Control::Next)
            }
            RefOp::RefAsNonNull => {
                let value = self.values.pop_as::<RefValue>();
                if value.is_null() {
                    return Err(TrapCode::NonNullRequired.into());
                }
                self.values.push(Value::Ref(value))?;
                Ok(Control::Next)
            }
            RefOp::BrOnNull(depth) => {
                let value = self.values.pop_as::<RefValue>();
                if value.is_null() {
                    Ok(self.branch(*depth))
                } else {
                    self.values.push(Value::Ref(value))?;
                    Ok(Control::Next)
                }
            }
            RefOp::BrOnNonNull(depth) => {
                let value = self.values.pop_as::<RefValue>();
                if value.is_null() {
                    Ok(Control::Next)
                } else {
                    self.values.push(Value::Ref(value))?;
                    Ok(self.branch(*depth))
                }
            }
        }
    }

    fn non_null_gc(&mut self) -> Result<crate::gc::GcRef, Trap> {
        match self.values.pop_as::<RefValue>() {
            RefValue::Null(_) => Err(TrapCode::NonNullRequired.into()),
            RefValue::Struct(gc_ref) | RefValue::Array(gc_ref) => Ok(gc_ref),
            _ => Err(TrapCode::CastFailed.into()),
        }
    }

    fn ref_passes(&self, value: &RefValue, target: &RefType) -> bool {
        match value {
            RefValue::Null(_) => target.nullable,
            non_null => heap_matches(&non_null.heap_type(), &target.heap),
        }
    }

    fn def_at(&self, module: &Arc<ModuleInstance>, type_idx: u32) -> DefType {
        module
            .type_by_index(type_idx)
            .expect("validation proved the type index")
    }

    fn step_gc(&mut self, op: &GcOp, module: &Arc<ModuleInstance>) -> Result<Control, Trap> {
        let heap = self.exec.heap();
        match op {
            GcOp::StructNew(type_idx) => {
                let def = self.def_at(module, *type_idx);
                let count = match def.comp() {
                    crate::types::CompositeType::Struct(s) => s.fields.len(),
                    _ => unreachable!("validation proved a struct type"),
                };
                let values = self.values.pop_n(count);
                let gc_ref = heap.alloc_struct(def, values)?;
                self.values.push(Value::Ref(RefValue::Struct(gc_ref)))?;
            }
            GcOp::StructNewDefault(type_idx) => {
                let def = self.def_at(module, *type_idx);
                let gc_ref = heap.alloc_struct_default(def)?;
                self.values.push(Value::Ref(RefValue::Struct(gc_ref)))?;
            }
            GcOp::StructGet(_, field) => {
                let gc_ref = self.non_null_gc()?;
                let value = heap.struct_get(&gc_ref, *field, true)?;
                self.values.push(value)?;
            }
            GcOp::StructGetS(_, field) => {
                let gc_ref = self.non_null_gc()?;
                let value = heap.struct_get(&gc_ref, *field, true)?;
                self.values.push(value)?;
            }
            GcOp::StructGetU(_, field) => {
                let gc_ref = self.non_null_gc()?;
                let value = heap.struct_get(&gc_ref, *field, false)?;
                self.values.push(value)?;
            }
            GcOp::StructSet(_, field) => {
                let value = self.values.pop();
                let gc_ref = self.non_null_gc()?;
                heap.struct_set(&gc_ref, *field, value)?;
            }
            GcOp::ArrayNew(type_idx) => {
                let def = self.def_at(module, *type_idx);
                let len = self.values.pop_as::<u32>();
                let init = self.values.pop();
                let gc_ref = heap.alloc_array(def, len, init)?;
                self.values.push(Value::Ref(RefValue::Array(gc_ref)))?;
            }
            GcOp::ArrayNewDefault(type_idx) => {
                let def = self.def_at(module, *type_idx);
                let len = self.values.pop_as::<u32>();
                let elem_type = match def.comp() {
                    crate::types::CompositeType::Array(array_type) => {
                        def.resolve_storage(&array_type.field.storage).unpacked()
                    }
                    _ => unreachable!("validation proved an array type"),
                };
                let init =
                    Value::default(&elem_type).ok_or(Trap::from(TrapCode::NonNullRequired))?;
                let gc_ref = heap.alloc_array(def, len, init)?;
                self.values.push(Value::Ref(RefValue::Array(gc_ref)))?;
            }
            GcOp::ArrayNewFixed(type_idx, count) => {
                let def = self.def_at(module, *type_idx);
                let values = self.values.pop_n(*count as usize);
                let gc_ref = heap.alloc_array_fixed(def, values)?;
                self.values.push(Value::Ref(RefValue::Array(gc_ref)))?;
            }
            GcOp::ArrayNewData(type_idx, data_idx) => {
                let def = self.def_at(module, *type_idx);
                let len = self.values.pop_as::<u32>();
                let offset = self.values.pop_as::<u32>();
                let values = self.array_values_from_data(module, &def, *data_idx, offset, len)?;
                let gc_ref = heap.alloc_array_fixed(def, values)?;
                self.values.push(Value::Ref(RefValue::Array(gc_ref)))?;
            }
            GcOp::ArrayNewElem(type_idx, elem_idx) => {
                let def = self.def_at(module, *type_idx);
                let len = self.values.pop_as::<u32>();
                let offset = self.values.pop_as::<u32>();
                let items = module
                    .elem_by_index(*elem_idx)
                    .expect("validation proved the element index")
                    .items();
                let end = offset as u64 + len as u64;
                if end > items.len() as u64 {
                    return Err(TrapCode::TableOutOfBounds.into());
                }
                let values = items[offset as usize..end as usize]
                    .iter()
                    .map(|item| Value::Ref(item.clone()))
                    .collect();
                let gc_ref = heap.alloc_array_fixed(def, values)?;
                self.values.push(Value::Ref(RefValue::Array(gc_ref)))?;
            }
            GcOp::ArrayGet(_) => {
                let index = self.values.pop_as::<u32>();
                let gc_ref = self.non_null_gc()?;
                let value = heap.array_get(&gc_ref, index, true)?;
                self.values.push(value)?;
            }
            GcOp::ArrayGetS(_) => {
                let index = self.values.pop_as::<u32>();
                let gc_ref = self.non_null_gc()?;
                let value = heap.array_get(&gc_ref, index, true)?;
                self.values.push(value)?;
            }
            GcOp::ArrayGetU(_) => {
                let index = self.values.pop_as::<u32>();
                let gc_ref = self.non_null_gc()?;
                let value = heap.array_get(&gc_ref, index, false)?;
                self.values.push(value)?;
            }
            GcOp::ArraySet(_) => {
                let value = self.values.pop();
                let index = self.values.pop_as::<u32>();
                let gc_ref = self.non_null_gc()?;
                heap.array_set(&gc_ref, index, value)?;
            }
            GcOp::ArrayLen => {
                let gc_ref = self.non_null_gc()?;
                let len = heap.array_len(&gc_ref)?;
                self.values.push(Value::I32(len as i32))?;
            }
            GcOp::ArrayFill(_) => {
                let len = self.values.pop_as::<u32>();
                let value = self.values.pop();
                let offset = self.values.pop_as::<u32>();
                let gc_ref = self.non_null_gc()?;
                heap.array_fill(&gc_ref, offset, value, len)?;
            }
            GcOp::ArrayCopy(_, _) => {
                let len = self.values.pop_as::<u32>();
                let src_offset = self.values.pop_as::<u32>();
                let src = self.non_null_gc()?;
                let dst_offset = self.values.pop_as::<u32>();
                let dst = self.non_null_gc()?;
                heap.array_copy(&dst, dst_offset, &src, src_offset, len)?;
            }
            GcOp::ArrayInitData(_, data_idx) => {
                let len = self.values.pop_as::<u32>();
                let src_offset = self.values.pop_as::<u32>();
                let dst_offset = self.values.pop_as::<u32>();
                let gc_ref = self.non_null_gc()?;
                let def = gc_ref.def_type();
                let values =
                    self.array_values_from_data(module, &def, *data_idx, src_offset, len)?;
                for (i, value) in values.into_iter().enumerate() {
                    heap.array_set(&gc_ref, dst_offset + i as u32, value)?;
                }
            }
            GcOp::ArrayInitElem(_, elem_idx) => {
                let len = self.values.pop_as::<u32>();
                let src_offset = self.values.pop_as::<u32>();
                let dst_offset = self.values.pop_as::<u32>();
                let gc_ref = self.non_null_gc()?;
                let items = module
                    .elem_by_index(*elem_idx)
                    .expect("validation proved the element index")
                    .items();
                let end = src_offset as u64 + len as u64;
                if end > items.len() as u64 {
                    return Err(TrapCode::TableOutOfBounds.into());
                }
                for (i, item) in items[src_offset as usize..end as usize].iter().enumerate() {
                    heap.array_set(&gc_ref, dst_offset + i as u32, Value::Ref(item.clone()))?;
                }
            }
            GcOp::RefTest(target) => {
                let target = module.canon_ref_type(target);
                let value = self.values.pop_as::<RefValue>();
                let passes = self.ref_passes(&value, &target);
                self.values.push(Value::from(passes))?;
            }
            GcOp::RefCast(target) => {
                let target = module.canon_ref_type(target);
                let value = self.values.pop_as::<RefValue>();
                if !self.ref_passes(&value, &target) {
                    return Err(TrapCode::CastFailed.into());
                }
                self.values.push(Value::Ref(value))?;
            }
            GcOp::BrOnCast(depth, _, to) => {
                let to = module.canon_ref_type(to);
                let value = self.values.pop_as::<RefValue>();
                let passes = self.ref_passes(&value, &to);
                self.values.push(Value::Ref(value))?;
                if passes {
                    return Ok(self.branch(*depth));
                }
            }
            GcOp::BrOnCastFail(depth, _, to) => {
                let to = module.canon_ref_type(to);
                let value = self.values.pop_as::<RefValue>();
                let passes = self.ref_passes(&value, &to);
                self.values.push(Value::Ref(value))?;
                if !passes {
                    return Ok(self.branch(*depth));
                }
            }
            GcOp::AnyConvertExtern => {
                let value = self.values.pop_as::<RefValue>();
                let converted = match value {
                    RefValue::Null(_) => RefValue::Null(HeapType::None),
                    other => other,
                };
                self.values.push(Value::Ref(converted))?;
            }
            GcOp::ExternConvertAny => {
                let value = self.values.pop_as::<RefValue>();
                let converted = match value {
                    RefValue::Null(_) => RefValue::Null(HeapType::NoExtern),
                    other => other,
                };
                self.values.push(Value::Ref(converted))?;
            }
            GcOp::RefI31 => {
                let value = self.values.pop_as::<u32>();
                self.values
                    .push(Value::Ref(RefValue::I31(value & 0x7fff_ffff)))?;
            }
            GcOp::I31GetS => match self.values.pop_as::<RefValue>() {
                RefValue::Null(_) => return Err(TrapCode::NonNullRequired.into()),
                RefValue::I31(value) => {
                    let signed = ((value << 1) as i32) >> 1;
                    self.values.push(Value::I32(signed))?;
                }
                _ => return Err(TrapCode::CastFailed.into()),
            },
            GcOp::I31GetU => match self.values.pop_as::<RefValue>() {
                RefValue::Null(_) => return Err(TrapCode::NonNullRequired.into()),
                RefValue::I31(value) => {
                    self.values.push(Value::I32((value & 0x7fff_ffff) as i32))?;
                }
                _ => return Err(TrapCode::CastFailed.into()),
            },
        }
        Ok(Control::Next)
    }

    /// Decodes `len` array elements of `def`'s element type from a data
    /// segment.
    fn array_values_from_data(
        &mut self,
        module: &Arc<ModuleInstance>,
        def: &DefType,
        data_idx: u32,
        offset: u32,
        len: u32,
    ) -> Result<Vec<Value>, Trap> {
        let storage = match def.comp() {
            crate::types::CompositeType::Array(array_type) => array_type.field.storage.clone(),
            _ => unreachable!("validation proved an array type"),
        };
        let bytes = module
            .data_by_index(data_idx)
            .expect("validation proved the data index")
            .bytes();
        let elem_size = storage.size() as u64;
        let end = offset as u64 + len as u64 * elem_size;
        if end > bytes.len() as u64 {
            return Err(TrapCode::MemoryOutOfBounds.into());
        }
        let mut values = Vec::with_capacity(len as usize);
        for i in 0..len as u64 {
            let at = (offset as u64 + i * elem_size) as usize;
            let chunk = &bytes[at..at + elem_size as usize];
            let value = match &storage {
                StorageType::I8 => Value::I32(i8::from_little_endian(chunk) as i32),
                StorageType::I16 => Value::I32(i16::from_little_endian(chunk) as i32),
                StorageType::Val(ValType::I32) => Value::I32(i32::from_little_endian(chunk)),
                StorageType::Val(ValType::I64) => Value::I64(i64::from_little_endian(chunk)),
                StorageType::Val(ValType::F32) => {
                    Value::F32(crate::nan_preserving_float::F32::from_little_endian(chunk))
                }
                StorageType::Val(ValType::F64) => {
                    Value::F64(crate::nan_preserving_float::F64::from_little_endian(chunk))
                }
                StorageType::Val(ValType::V128) => Value::V128(u128::from_little_endian(chunk)),
                StorageType::Val(ValType::Ref(_)) => {
                    unreachable!("validation rejects array.new_data on reference arrays")
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    fn step_table(&mut self, op: &TableOp, module: &Arc<ModuleInstance>) -> Result<Control, Trap> {
        let table = |idx: &u32| -> crate::table::TableRef {
            module
                .table_by_index(*idx)
                .expect("validation proved the table index")
        };
        match op {
            TableOp::TableGet(idx) => {
                let index = self.values.pop_as::<u32>();
                let value = table(idx).get(index)?;
                self.values.push(Value::Ref(value))?;
            }
            TableOp::TableSet(idx) => {
                let value = self.values.pop_as::<RefValue>();
                let index = self.values.pop_as::<u32>();
                table(idx).set(index, value)?;
            }
            TableOp::TableInit(elem_idx, table_idx) => {
                let len = self.values.pop_as::<u32>();
                let src = self.values.pop_as::<u32>();
                let dst = self.values.pop_as::<u32>();
                let items = module
                    .elem_by_index(*elem_idx)
                    .expect("validation proved the element index")
                    .items();
                table(table_idx).init(dst, &items, src, len)?;
            }
            TableOp::ElemDrop(elem_idx) => {
                module
                    .elem_by_index(*elem_idx)
                    .expect("validation proved the element index")
                    .drop_items();
            }
            TableOp::TableCopy(dst_idx, src_idx) => {
                let len = self.values.pop_as::<u32>();
                let src = self.values.pop_as::<u32>();
                let dst = self.values.pop_as::<u32>();
                if dst_idx == src_idx {
                    table(dst_idx).copy_within(dst, src, len)?;
                } else {
                    TableInstance::copy_between(&table(dst_idx), &table(src_idx), dst, src, len)?;
                }
            }
            TableOp::TableGrow(idx) => {
                let delta = self.values.pop_as::<u32>();
                let init = self.values.pop_as::<RefValue>();
                let old_size = table(idx).grow(delta, init);
                self.values.push(Value::I32(old_size as i32))?;
            }
            TableOp::TableSize(idx) => {
                let size = table(idx).size();
                self.values.push(Value::I32(size as i32))?;
            }
            TableOp::TableFill(idx) => {
                let len = self.values.pop_as::<u32>();
                let value = self.values.pop_as::<RefValue>();
                let offset = self.values.pop_as::<u32>();
                table(idx).fill(offset, value, len)?;
            }
        }
        Ok(Control::Next)
    }

    fn step_memory(
        &mut self,
        op: &MemoryOp,
        module: &Arc<ModuleInstance>,
    ) -> Result<Control, Trap> {
        use crate::nan_preserving_float::{F32, F64};
        match op {
            MemoryOp::I32Load(memarg) => {
                let value: i32 = self.load(memarg)?;
                self.values.push(Value::I32(value))?;
            }
            MemoryOp::I64Load(memarg) => {
                let value: i64 = self.load(memarg)?;
                self.values.push(Value::I64(value))?;
            }
            MemoryOp::F32Load(memarg) => {
                let value: F32 = self.load(memarg)?;
                self.values.push(Value::F32(value))?;
            }
            MemoryOp::F64Load(memarg) => {
                let value: F64 = self.load(memarg)?;
                self.values.push(Value::F64(value))?;
            }
            MemoryOp::I32Load8S(memarg) => {
                let value: i8 = self.load(memarg)?;
                self.values.push(Value::I32(value as i32))?;
            }
            MemoryOp::I32Load8U(memarg) => {
                let value: u8 = self.load(memarg)?;
                self.values.push(Value::I32(value as i32))?;
            }
            MemoryOp::I32Load16S(memarg) => {
                let value: i16 = self.load(memarg)?;
                self.values.push(Value::I32(value as i32))?;
            }
            MemoryOp::I32Load16U(memarg) => {
                let value: u16 = self.load(memarg)?;
                self.values.push(Value::I32(value as i32))?;
            }
            MemoryOp::I64Load8S(memarg) => {
                let value: i8 = self.load(memarg)?;
                self.values.push(Value::I64(value as i64))?;
            }
            MemoryOp::I64Load8U(memarg) => {
                let value: u8 = self.load(memarg)?;
                self.values.push(Value::I64(value as i64))?;
            }
            MemoryOp::I64Load16S(memarg) => {
                let value: i16 = self.load(memarg)?;
                self.values.push(Value::I64(value as i64))?;
            }
            MemoryOp::I64Load16U(memarg) => {
                let value: u16 = self.load(memarg)?;
                self.values.push(Value::I64(value as i64))?;
            }
            MemoryOp::I64Load32S(memarg) => {
                let value: i32 = self.load(memarg)?;
                self.values.push(Value::I64(value as i64))?;
            }
            MemoryOp::I64Load32U(memarg) => {
                let value: u32 = self.load(memarg)?;
                self.values.push(Value::I64(value as i64))?;
            }
            MemoryOp::I32Store(memarg) => {
                let value = self.values.pop_as::<i32>();
                self.store(memarg, value)?;
            }
            MemoryOp::I64Store(memarg) => {
                let value = self.values.pop_as::<i64>();
                self.store(memarg, value)?;
            }
            MemoryOp::F32Store(memarg) => {
                let value = self.values.pop_as::<F32>();
                self.store(memarg, value)?;
            }
            MemoryOp::F64Store(memarg) => {
                let value = self.values.pop_as::<F64>();
                self.store(memarg, value)?;
            }
            MemoryOp::I32Store8(memarg) => {
                let value = self.values.pop_as::<i32>();
                self.store(memarg, value as i8)?;
            }
            MemoryOp::I32Store16(memarg) => {
                let value = self.values.pop_as::<i32>();
                self.store(memarg, value as i16)?;
            }
            MemoryOp::I64Store8(memarg) => {
                let value = self.values.pop_as::<i64>();
                self.store(memarg, value as i8)?;
            }
            MemoryOp::I64Store16(memarg) => {
                let value = self.values.pop_as::<i64>();
                self.store(memarg, value as i16)?;
            }
            MemoryOp::I64Store32(memarg) => {
                let value = self.values.pop_as::<i64>();
                self.store(memarg, value as i32)?;
            }
            MemoryOp::MemorySize(mem_idx) => {
                let pages = self.memory(*mem_idx).current_pages();
                self.values.push(Value::I32(pages as i32))?;
            }
            MemoryOp::MemoryGrow(mem_idx) => {
                let delta = self.values.pop_as::<u32>();
                let old_pages = self.memory(*mem_idx).grow(delta);
                self.values.push(Value::I32(old_pages as i32))?;
            }
            MemoryOp::MemoryInit(data_idx, mem_idx) => {
                let len = self.values.pop_as::<u32>() as u64;
                let src = self.values.pop_as::<u32>() as u64;
                let dst = self.values.pop_as::<u32>() as u64;
                let bytes = module
                    .data_by_index(*data_idx)
                    .expect("validation proved the data index")
                    .bytes();
                if src + len > bytes.len() as u64 {
                    return Err(TrapCode::MemoryOutOfBounds.into());
                }
                self.memory(*mem_idx)
                    .set(dst, &bytes[src as usize..(src + len) as usize])?;
            }
            MemoryOp::DataDrop(data_idx) => {
                module
                    .data_by_index(*data_idx)
                    .expect("validation proved the data index")
                    .drop_bytes();
            }
            MemoryOp::MemoryCopy(dst_idx, src_idx) => {
                let len = self.values.pop_as::<u32>() as u64;
                let src = self.values.pop_as::<u32>() as u64;
                let dst = self.values.pop_as::<u32>() as u64;
                if dst_idx == src_idx {
                    self.memory(*dst_idx).copy_within(dst, src, len)?;
                } else {
                    let dst_mem = self.memory(*dst_idx);
                    let src_mem = self.memory(*src_idx);
                    crate::memory::MemoryInstance::copy_between(&dst_mem, &src_mem, dst, src, len)?;
                }
            }
            MemoryOp::MemoryFill(mem_idx) => {
                let len = self.values.pop_as::<u32>() as u64;
                let byte = self.values.pop_as::<i32>() as u8;
                let dst = self.values.pop_as::<u32>() as u64;
                self.memory(*mem_idx).fill(dst, byte, len)?;
            }
        }
        Ok(Control::Next)
    }

    fn step_simd(&mut self, op: &SimdOp) -> Result<Control, Trap> {
        use SimdOp::*;
        match op {
            V128Load(memarg) => {
                let value: u128 = self.load(memarg)?;
                self.values.push(Value::V128(value))?;
            }
            V128Store(memarg) => {
                let value = self.values.pop_as::<u128>();
                self.store(memarg, value)?;
            }
            V128Load8Splat(memarg) => {
                let byte: u8 = self.load(memarg)?;
                self.values
                    .push(Value::V128(u128::from_le_bytes([byte; 16])))?;
            }
            V128Load16Splat(memarg) => {
                let half: u16 = self.load(memarg)?;
                let mut bytes = [0u8; 16];
                for chunk in bytes.chunks_exact_mut(2) {
                    chunk.copy_from_slice(&half.to_le_bytes());
                }
                self.values.push(Value::V128(u128::from_le_bytes(bytes)))?;
            }
            V128Load32Splat(memarg) => {
                let word: u32 = self.load(memarg)?;
                let mut bytes = [0u8; 16];
                for chunk in bytes.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&word.to_le_bytes());
                }
                self.values.push(Value::V128(u128::from_le_bytes(bytes)))?;
            }
            V128Load64Splat(memarg) => {
                let word: u64 = self.load(memarg)?;
                let mut bytes = [0u8; 16];
                for chunk in bytes.chunks_exact_mut(8) {
                    chunk.copy_from_slice(&word.to_le_bytes());
                }
                self.values.push(Value::V128(u128::from_le_bytes(bytes)))?;
            }
            V128Load32Zero(memarg) => {
                let word: u32 = self.load(memarg)?;
                self.values.push(Value::V128(word as u128))?;
            }
            V128Load64Zero(memarg) => {
                let word: u64 = self.load(memarg)?;
                self.values.push(Value::V128(word as u128))?;
            }
            V128Load8x8S(memarg) => self.load_extend(memarg, |bytes| {
                let mut out = [0u8; 16];
                for i in 0..8 {
                    out[2 * i..2 * i + 2]
                        .copy_from_slice(&(bytes[i] as i8 as i16).to_le_bytes());
                }
                u128::from_le_bytes(out)
            })?,
            V128Load8x8U(memarg) => self.load_extend(memarg, |bytes| {
                let mut out = [0u8; 16];
                for i in 0..8 {
                    out[2 * i..2 * i + 2].copy_from_slice(&(bytes[i] as u16).to_le_bytes());
                }
                u128::from_le_bytes(out)
            })?,
            V128Load16x4S(memarg) => self.load_extend(memarg, |bytes| {
                let mut out = [0u8; 16];
                for i in 0..4 {
                    let half = i16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
                    out[4 * i..4 * i + 4].copy_from_slice(&(half as i32).to_le_bytes());
                }
                u128::from_le_bytes(out)
            })?,
            V128Load16x4U(memarg) => self.load_extend(memarg, |bytes| {
                let mut out = [0u8; 16];
                for i in 0..4 {
                    let half = u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
                    out[4 * i..4 * i + 4].copy_from_slice(&(half as u32).to_le_bytes());
                }
                u128::from_le_bytes(out)
            })?,
            V128Load32x2S(memarg) => self.load_extend(memarg, |bytes| {
                let mut out = [0u8; 16];
                for i in 0..2 {
                    let word =
                        i32::from_le_bytes(bytes[4 * i..4 * i + 4].try_into().expect("4 bytes"));
                    out[8 * i..8 * i + 8].copy_from_slice(&(word as i64).to_le_bytes());
                }
                u128::from_le_bytes(out)
            })?,
            V128Load32x2U(memarg) => self.load_extend(memarg, |bytes| {
                let mut out = [0u8; 16];
                for i in 0..2 {
                    let word =
                        u32::from_le_bytes(bytes[4 * i..4 * i + 4].try_into().expect("4 bytes"));
                    out[8 * i..8 * i + 8].copy_from_slice(&(word as u64).to_le_bytes());
                }
                u128::from_le_bytes(out)
            })?,
            V128Load8Lane(memarg, lane) => self.load_lane(memarg, *lane, 1)?,
            V128Load16Lane(memarg, lane) => self.load_lane(memarg, *lane, 2)?,
            V128Load32Lane(memarg, lane) => self.load_lane(memarg, *lane, 4)?,
            V128Load64Lane(memarg, lane) => self.load_lane(memarg, *lane, 8)?,
            V128Store8Lane(memarg, lane) => self.store_lane(memarg, *lane, 1)?,
            V128Store16Lane(memarg, lane) => self.store_lane(memarg, *lane, 2)?,
            V128Store32Lane(memarg, lane) => self.store_lane(memarg, *lane, 4)?,
            V128Store64Lane(memarg, lane) => self.store_lane(memarg, *lane, 8)?,
            other => simd::run(other, &mut self.values)?,
        }
        Ok(Control::Next)
    }

    fn load_extend(
        &mut self,
        memarg: &MemArg,
        widen: impl FnOnce([u8; 8]) -> u128,
    ) -> Result<(), TrapCode> {
        let addr = self.effective_addr(memarg);
        let mut bytes = [0u8; 8];
        self.memory(memarg.memory).get_into(addr, &mut bytes)?;
        self.values.push(Value::V128(widen(bytes)))
    }

    fn load_lane(&mut self, memarg: &MemArg, lane: u8, size: usize) -> Result<(), TrapCode> {
        let vector = self.values.pop_as::<u128>();
        let addr = self.effective_addr(memarg);
        let mut lane_bytes = vec![0u8; size];
        self.memory(memarg.memory).get_into(addr, &mut lane_bytes)?;
        let mut bytes = vector.to_le_bytes();
        bytes[lane as usize * size..(lane as usize + 1) * size].copy_from_slice(&lane_bytes);
        self.values.push(Value::V128(u128::from_le_bytes(bytes)))
    }

    fn store_lane(&mut self, memarg: &MemArg, lane: u8, size: usize) -> Result<(), TrapCode> {
        let vector = self.values.pop_as::<u128>();
        let addr = self.effective_addr(memarg);
        let bytes = vector.to_le_bytes();
        self.memory(memarg.memory)
            .set(addr, &bytes[lane as usize * size..(lane as usize + 1) * size])
    }

    fn step_atomic(&mut self, op: &AtomicOp) -> Result<Control, Trap> {
        use AtomicOp::*;

        macro_rules! atomic_load {
            ($memarg:expr, $t:ty, $push:ident, $wide:ty) => {{
                let addr = self.effective_addr($memarg);
                let value: $t = self.memory($memarg.memory).atomic_load(addr)?;
                self.values.push(Value::$push(value as $wide))?;
            }};
        }
        macro_rules! atomic_store {
            ($memarg:expr, $pop:ty, $t:ty) => {{
                let value = self.values.pop_as::<$pop>() as $t;
                let addr = self.effective_addr($memarg);
                self.memory($memarg.memory).atomic_store(addr, value)?;
            }};
        }
        macro_rules! atomic_rmw {
            ($memarg:expr, $pop:ty, $t:ty, $push:ident, $wide:ty, $op:expr) => {{
                let operand = self.values.pop_as::<$pop>() as $t;
                let addr = self.effective_addr($memarg);
                let old = self
                    .memory($memarg.memory)
                    .atomic_rmw::<$t, _>(addr, |current| $op(current, operand))?;
                self.values.push(Value::$push(old as $wide))?;
            }};
        }

        match op {
            MemoryAtomicNotify(memarg) => {
                let count = self.values.pop_as::<u32>();
                let addr = self.effective_addr(memarg);
                let woken = self.memory(memarg.memory).notify(addr, count)?;
                self.values.push(Value::I32(woken as i32))?;
            }
            MemoryAtomicWait32(memarg) => {
                let timeout = self.values.pop_as::<i64>();
                let expected = self.values.pop_as::<i32>();
                let addr = self.effective_addr(memarg);
                let outcome = self.memory(memarg.memory).wait::<u32>(
                    addr,
                    expected as u32,
                    timeout,
                    self.exec.cancel_flag(),
                )?;
                self.values.push(Value::I32(outcome as i32))?;
            }
            MemoryAtomicWait64(memarg) => {
                let timeout = self.values.pop_as::<i64>();
                let expected = self.values.pop_as::<i64>();
                let addr = self.effective_addr(memarg);
                let outcome = self.memory(memarg.memory).wait::<u64>(
                    addr,
                    expected as u64,
                    timeout,
                    self.exec.cancel_flag(),
                )?;
                self.values.push(Value::I32(outcome as i32))?;
            }
            AtomicFence => {
                std::sync::atomic::fence(Ordering::SeqCst);
            }

            I32AtomicLoad(memarg) => atomic_load!(memarg, u32, I32, i32),
            I64AtomicLoad(memarg) => atomic_load!(memarg, u64, I64, i64),
            I32AtomicLoad8U(memarg) => atomic_load!(memarg, u8, I32, i32),
            I32AtomicLoad16U(memarg) => atomic_load!(memarg, u16, I32, i32),
            I64AtomicLoad8U(memarg) => atomic_load!(memarg, u8, I64, i64),
            I64AtomicLoad16U(memarg) => atomic_load!(memarg, u16, I64, i64),
            I64AtomicLoad32U(memarg) => atomic_load!(memarg, u32, I64, i64),
            I32AtomicStore(memarg) => atomic_store!(memarg, u32, u32),
            I64AtomicStore(memarg) => atomic_store!(memarg, u64, u64),
            I32AtomicStore8(memarg) => atomic_store!(memarg, u32, u8),
            I32AtomicStore16(memarg) => atomic_store!(memarg, u32, u16),
            I64AtomicStore8(memarg) => atomic_store!(memarg, u64, u8),
            I64AtomicStore16(memarg) => atomic_store!(memarg, u64, u16),
            I64AtomicStore32(memarg) => atomic_store!(memarg, u64, u32),

            I32AtomicRmwAdd(memarg) => {
                atomic_rmw!(memarg, u32, u32, I32, i32, |a: u32, b: u32| a.wrapping_add(b))
            }
            I64AtomicRmwAdd(memarg) => {
                atomic_rmw!(memarg, u64, u64, I64, i64, |a: u64, b: u64| a.wrapping_add(b))
            }
            I32AtomicRmw8AddU(memarg) => {
                atomic_rmw!(memarg, u32, u8, I32, i32, |a: u8, b: u8| a.wrapping_add(b))
            }
            I32AtomicRmw16AddU(memarg) => {
                atomic_rmw!(memarg, u32, u16, I32, i32, |a: u16, b: u16| a.wrapping_add(b))
            }
            I64AtomicRmw8AddU(memarg) => {
                atomic_rmw!(memarg, u64, u8, I64, i64, |a: u8, b: u8| a.wrapping_add(b))
            }
            I64AtomicRmw16AddU(memarg) => {
                atomic_rmw!(memarg, u64, u16, I64, i64, |a: u16, b: u16| a.wrapping_add(b))
            }
            I64AtomicRmw32AddU(memarg) => {
                atomic_rmw!(memarg, u64, u32, I64, i64, |a: u32, b: u32| a.wrapping_add(b))
            }
            I32AtomicRmwSub(memarg) => {
                atomic_rmw!(memarg, u32, u32, I32, i32, |a: u32, b: u32| a.wrapping_sub(b))
            }
            I64AtomicRmwSub(memarg) => {
                atomic_rmw!(memarg, u64, u64, I64, i64, |a: u64, b: u64| a.wrapping_sub(b))
            }
            I32AtomicRmw8SubU(memarg) => {
                atomic_rmw!(memarg, u32, u8, I32, i32, |a: u8, b: u8| a.wrapping_sub(b))
            }
            I32AtomicRmw16SubU(memarg) => {
                atomic_rmw!(memarg, u32, u16, I32, i32, |a: u16, b: u16| a.wrapping_sub(b))
            }
            I64AtomicRmw8SubU(memarg) => {
                atomic_rmw!(memarg, u64, u8, I64, i64, |a: u8, b: u8| a.wrapping_sub(b))
            }
            I64AtomicRmw16SubU(memarg) => {
                atomic_rmw!(memarg, u64, u16, I64, i64, |a: u16, b: u16| a.wrapping_sub(b))
            }
            I64AtomicRmw32SubU(memarg) => {
                atomic_rmw!(memarg, u64, u32, I64, i64, |a: u32, b: u32| a.wrapping_sub(b))
            }
            I32AtomicRmwAnd(memarg) => {
                atomic_rmw!(memarg, u32, u32, I32, i32, |a: u32, b: u32| a & b)
            }
            I64AtomicRmwAnd(memarg) => {
                atomic_rmw!(memarg, u64, u64, I64, i64, |a: u64, b: u64| a & b)
            }
            I32AtomicRmw8AndU(memarg) => {
                atomic_rmw!(memarg, u32, u8, I32, i32, |a: u8, b: u8| a & b)
            }
            I32AtomicRmw16AndU(memarg) => {
                atomic_rmw!(memarg, u32, u16, I32, i32, |a: u16, b: u16| a & b)
            }
            I64AtomicRmw8AndU(memarg) => {
                atomic_rmw!(memarg, u64, u8, I64, i64, |a: u8, b: u8| a & b)
            }
            I64AtomicRmw16AndU(memarg) => {
                atomic_rmw!(memarg, u64, u16, I64, i64, |a: u16, b: u16| a & b)
            }
            I64AtomicRmw32AndU(memarg) => {
                atomic_rmw!(memarg, u64, u32, I64, i64, |a: u32, b: u32| a & b)
            }
            I32AtomicRmwOr(memarg) => {
                atomic_rmw!(memarg, u32, u32, I32, i32, |a: u32, b: u32| a | b)
            }
            I64AtomicRmwOr(memarg) => {
                atomic_rmw!(memarg, u64, u64, I64, i64, |a: u64, b: u64| a | b)
            }
            I32AtomicRmw8OrU(memarg) => atomic_rmw!(memarg, u32, u8, I32, i32, |a: u8, b: u8| a | b),
            I32AtomicRmw16OrU(memarg) => {
                atomic_rmw!(memarg, u32, u16, I32, i32, |a: u16, b: u16| a | b)
            }
            I64AtomicRmw8OrU(memarg) => atomic_rmw!(memarg, u64, u8, I64, i64, |a: u8, b: u8| a | b),
            I64AtomicRmw16OrU(memarg) => {
                atomic_rmw!(memarg, u64, u16, I64, i64, |a: u16, b: u16| a | b)
            }
            I64AtomicRmw32OrU(memarg) => {
                atomic_rmw!(memarg, u64, u32, I64, i64, |a: u32, b: u32| a | b)
            }
            I32AtomicRmwXor(memarg) => {
                atomic_rmw!(memarg, u32, u32, I32, i32, |a: u32, b: u32| a ^ b)
            }
            I64AtomicRmwXor(memarg) => {
                atomic_rmw!(memarg, u64, u64, I64, i64, |a: u64, b: u64| a ^ b)
            }
            I32AtomicRmw8XorU(memarg) => {
                atomic_rmw!(memarg, u32, u8, I32, i32, |a: u8, b: u8| a ^ b)
            }
            I32AtomicRmw16XorU(memarg) => {
                atomic_rmw!(memarg, u32, u16, I32, i32, |a: u16, b: u16| a ^ b)
            }
            I64AtomicRmw8XorU(memarg) => {
                atomic_rmw!(memarg, u64, u8, I64, i64, |a: u8, b: u8| a ^ b)
            }
            I64AtomicRmw16XorU(memarg) => {
                atomic_rmw!(memarg, u64, u16, I64, i64, |a: u16, b: u16| a ^ b)
            }
            I64AtomicRmw32XorU(memarg) => {
                atomic_rmw!(memarg, u64, u32, I64, i64, |a: u32, b: u32| a ^ b)
            }
            I32AtomicRmwXchg(memarg) => {
                atomic_rmw!(memarg, u32, u32, I32, i32, |_a: u32, b: u32| b)
            }
            I64AtomicRmwXchg(memarg) => {
                atomic_rmw!(memarg, u64, u64, I64, i64, |_a: u64, b: u64| b)
            }
            I32AtomicRmw8XchgU(memarg) => {
                atomic_rmw!(memarg, u32, u8, I32, i32, |_a: u8, b: u8| b)
            }
            I32AtomicRmw16XchgU(memarg) => {
                atomic_rmw!(memarg, u32, u16, I32, i32, |_a: u16, b: u16| b)
            }
            I64AtomicRmw8XchgU(memarg) => {
                atomic_rmw!(memarg, u64, u8, I64, i64, |_a: u8, b: u8| b)
            }
            I64AtomicRmw16XchgU(memarg) => {
                atomic_rmw!(memarg, u64, u16, I64, i64, |_a: u16, b: u16| b)
            }
            I64AtomicRmw32XchgU(memarg) => {
                atomic_rmw!(memarg, u64, u32, I64, i64, |_a: u32, b: u32| b)
            }

            I32AtomicRmwCmpxchg(memarg) => {
                self.cmpxchg::<u32>(memarg, |v| Value::I32(v as i32))?
            }
            I64AtomicRmwCmpxchg(memarg) => {
                self.cmpxchg::<u64>(memarg, |v| Value::I64(v as i64))?
            }
            I32AtomicRmw8CmpxchgU(memarg) => self.cmpxchg_narrow::<u8>(memarg, 32)?,
            I32AtomicRmw16CmpxchgU(memarg) => self.cmpxchg_narrow::<u16>(memarg, 32)?,
            I64AtomicRmw8CmpxchgU(memarg) => self.cmpxchg_narrow::<u8>(memarg, 64)?,
            I64AtomicRmw16CmpxchgU(memarg) => self.cmpxchg_narrow::<u16>(memarg, 64)?,
            I64AtomicRmw32CmpxchgU(memarg) => self.cmpxchg_narrow::<u32>(memarg, 64)?,
        }
        Ok(Control::Next)
    }

    fn cmpxchg<T>(&mut self, memarg: &MemArg, wrap: impl FnOnce(T) -> Value) -> Result<(), Trap>
    where
        T: LittleEndianConvert + Copy + PartialEq + crate::value::FromValue,
    {
        let replacement = self.values.pop_as::<T>();
        let expected = self.values.pop_as::<T>();
        let addr = self.effective_addr(memarg);
        let old = self
            .memory(memarg.memory)
            .atomic_cmpxchg(addr, expected, replacement)?;
        self.values.push(wrap(old))?;
        Ok(())
    }

    /// Narrow compare-exchange: operands arrive as the wide type and are
    /// wrapped to the accessed width.
    fn cmpxchg_narrow<T>(&mut self, memarg: &MemArg, wide_bits: u32) -> Result<(), Trap>
    where
        T: LittleEndianConvert + Copy + PartialEq + TryFrom<u64>,
        u64: From<T>,
    {
        let (replacement, expected) = if wide_bits == 32 {
            (
                self.values.pop_as::<u32>() as u64,
                self.values.pop_as::<u32>() as u64,
            )
        } else {
            (self.values.pop_as::<u64>(), self.values.pop_as::<u64>())
        };
        let mask = (1u128 << (core::mem::size_of::<T>() * 8)) - 1;
        let narrow = |v: u64| -> T {
            T::try_from(v & mask as u64).unwrap_or_else(|_| unreachable!("masked to width"))
        };
        let addr = self.effective_addr(memarg);
        let old = self.memory(memarg.memory).atomic_cmpxchg(
            addr,
            narrow(expected),
            narrow(replacement),
        )?;
        let old = u64::from(old);
        if wide_bits == 32 {
            self.values.push(Value::I32(old as i32))?;
        } else {
            self.values.push(Value::I64(old as i64))?;
        }
        Ok(())
    }
}

/// Checks invocation arguments against the function type.
///
/// Declared types may carry intra-group back references; they resolve
/// against the function's own defined type before matching.
fn check_args(func: &FuncRef, args: &[Value]) -> Result<(), Trap> {
    let def = func.def_type();
    let params = func.func_type().params();
    if params.len() != args.len() {
        return Err(TrapCode::FuncTypeMismatch.into());
    }
    for (arg, param) in args.iter().zip(params) {
        if !val_matches(&arg.value_type(), &def.resolve_val(param)) {
            return Err(TrapCode::FuncTypeMismatch.into());
        }
    }
    Ok(())
}

/// Checks host/compiled results against the declared result types.
fn check_results(def: &DefType, results: &[ValType], rets: &[Value]) -> Result<(), Trap> {
    if results.len() != rets.len() {
        return Err(TrapCode::FuncTypeMismatch.into());
    }
    for (ret, result) in rets.iter().zip(results) {
        if !val_matches(&ret.value_type(), &def.resolve_val(result)) {
            return Err(TrapCode::FuncTypeMismatch.into());
        }
    }
    Ok(())
}

/// Evaluates a constant (initializer) expression.
///
/// Runs on a synthetic frame that only exposes the module's globals,
/// `ref.func`, GC allocation and, under the extended-constants proposal,
/// the const-expression arithmetic subset.
pub(crate) fn eval_const_expr(
    exec: &Executor,
    module: &Arc<ModuleInstance>,
    expr: &[Instruction],
) -> Result<Value, Trap> {
    let mut values = ValueStack::new(64);
    for instr in expr {
        match instr {
            Instruction::Control(ControlOp::End) => break,
            Instruction::Numeric(op) => numeric::run(op, &mut values)?,
            Instruction::Ref(RefOp::RefNull(heap)) => {
                values.push(Value::Ref(RefValue::Null(module.canon_heap(heap))))?;
            }
            Instruction::Ref(RefOp::RefFunc(idx)) => {
                let func = module
                    .func_by_index(*idx)
                    .expect("validation proved the function index");
                values.push(Value::Ref(RefValue::Func(func)))?;
            }
            Instruction::Variable(VariableOp::GlobalGet(idx)) => {
                let global = module
                    .global_by_index(*idx)
                    .expect("validation proved the global index");
                values.push(global.get())?;
            }
            Instruction::Gc(GcOp::RefI31) => {
                let value = values.pop_as::<u32>();
                values.push(Value::Ref(RefValue::I31(value & 0x7fff_ffff)))?;
            }
            Instruction::Gc(GcOp::StructNew(type_idx)) => {
                let def = module
                    .type_by_index(*type_idx)
                    .expect("validation proved the struct type index");
                let count = match def.comp() {
                    crate::types::CompositeType::Struct(s) => s.fields.len(),
                    _ => unreachable!("validation proved a struct type"),
                };
                let args = values.pop_n(count);
                let gc_ref = exec.heap().alloc_struct(def, args)?;
                values.push(Value::Ref(RefValue::Struct(gc_ref)))?;
            }
            Instruction::Gc(GcOp::StructNewDefault(type_idx)) => {
                let def = module
                    .type_by_index(*type_idx)
                    .expect("validation proved the struct type index");
                let gc_ref = exec.heap().alloc_struct_default(def)?;
                values.push(Value::Ref(RefValue::Struct(gc_ref)))?;
            }
            Instruction::Gc(GcOp::ArrayNew(type_idx)) => {
                let def = module
                    .type_by_index(*type_idx)
                    .expect("validation proved the array type index");
                let len = values.pop_as::<u32>();
                let init = values.pop();
                let gc_ref = exec.heap().alloc_array(def, len, init)?;
                values.push(Value::Ref(RefValue::Array(gc_ref)))?;
            }
            other => unreachable!("validation rejects {other:?} in constant expressions"),
        }
    }
    Ok(values.pop())
}
