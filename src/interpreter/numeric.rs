//! Evaluation of the numeric instruction family.
//!
//! One `match` over [`NumericOp`], dispatching into the conversion and
//! arithmetic traits of the value module. Shift and rotate counts are
//! taken modulo the bit width; division and truncation edge cases trap as
//! the semantics require.

use crate::ast::NumericOp;
use crate::error::TrapCode;
use crate::nan_preserving_float::{F32, F64};
use crate::value::{
    ArithmeticOps, ExtendInto, Float, FromValue, Integer, TransmuteInto, TruncateSatInto,
    TryTruncateInto, Value, WrapInto,
};

use super::stack::ValueStack;

fn unop<T, R>(stack: &mut ValueStack, f: impl FnOnce(T) -> R) -> Result<(), TrapCode>
where
    T: FromValue,
    Value: From<R>,
{
    let value = stack.pop_as::<T>();
    stack.push(Value::from(f(value)))
}

fn try_unop<T, R>(
    stack: &mut ValueStack,
    f: impl FnOnce(T) -> Result<R, TrapCode>,
) -> Result<(), TrapCode>
where
    T: FromValue,
    Value: From<R>,
{
    let value = stack.pop_as::<T>();
    stack.push(Value::from(f(value)?))
}

fn binop<T, R>(stack: &mut ValueStack, f: impl FnOnce(T, T) -> R) -> Result<(), TrapCode>
where
    T: FromValue,
    Value: From<R>,
{
    let rhs = stack.pop_as::<T>();
    let lhs = stack.pop_as::<T>();
    stack.push(Value::from(f(lhs, rhs)))
}

fn try_binop<T, R>(
    stack: &mut ValueStack,
    f: impl FnOnce(T, T) -> Result<R, TrapCode>,
) -> Result<(), TrapCode>
where
    T: FromValue,
    Value: From<R>,
{
    let rhs = stack.pop_as::<T>();
    let lhs = stack.pop_as::<T>();
    stack.push(Value::from(f(lhs, rhs)?))
}

/// Executes one numeric instruction against the operand stack.
pub(super) fn run(op: &NumericOp, stack: &mut ValueStack) -> Result<(), TrapCode> {
    use NumericOp::*;
    match op {
        I32Const(value) => stack.push(Value::I32(*value)),
        I64Const(value) => stack.push(Value::I64(*value)),
        F32Const(value) => stack.push(Value::F32(*value)),
        F64Const(value) => stack.push(Value::F64(*value)),

        I32Eqz => unop(stack, |v: i32| v == 0),
        I32Eq => binop(stack, |a: i32, b| a == b),
        I32Ne => binop(stack, |a: i32, b| a != b),
        I32LtS => binop(stack, |a: i32, b| a < b),
        I32LtU => binop(stack, |a: u32, b| a < b),
        I32GtS => binop(stack, |a: i32, b| a > b),
        I32GtU => binop(stack, |a: u32, b| a > b),
        I32LeS => binop(stack, |a: i32, b| a <= b),
        I32LeU => binop(stack, |a: u32, b| a <= b),
        I32GeS => binop(stack, |a: i32, b| a >= b),
        I32GeU => binop(stack, |a: u32, b| a >= b),
        I64Eqz => unop(stack, |v: i64| v == 0),
        I64Eq => binop(stack, |a: i64, b| a == b),
        I64Ne => binop(stack, |a: i64, b| a != b),
        I64LtS => binop(stack, |a: i64, b| a < b),
        I64LtU => binop(stack, |a: u64, b| a < b),
        I64GtS => binop(stack, |a: i64, b| a > b),
        I64GtU => binop(stack, |a: u64, b| a > b),
        I64LeS => binop(stack, |a: i64, b| a <= b),
        I64LeU => binop(stack, |a: u64, b| a <= b),
        I64GeS => binop(stack, |a: i64, b| a >= b),
        I64GeU => binop(stack, |a: u64, b| a >= b),
        F32Eq => binop(stack, |a: F32, b| a == b),
        F32Ne => binop(stack, |a: F32, b| a != b),
        F32Lt => binop(stack, |a: F32, b| a < b),
        F32Gt => binop(stack, |a: F32, b| a > b),
        F32Le => binop(stack, |a: F32, b| a <= b),
        F32Ge => binop(stack, |a: F32, b| a >= b),
        F64Eq => binop(stack, |a: F64, b| a == b),
        F64Ne => binop(stack, |a: F64, b| a != b),
        F64Lt => binop(stack, |a: F64, b| a < b),
        F64Gt => binop(stack, |a: F64, b| a > b),
        F64Le => binop(stack, |a: F64, b| a <= b),
        F64Ge => binop(stack, |a: F64, b| a >= b),

        I32Clz => unop(stack, |v: i32| Integer::leading_zeros(v)),
        I32Ctz => unop(stack, |v: i32| Integer::trailing_zeros(v)),
        I32Popcnt => unop(stack, |v: i32| Integer::count_ones(v)),
        I32Add => binop(stack, |a: i32, b| a.add(b)),
        I32Sub => binop(stack, |a: i32, b| a.sub(b)),
        I32Mul => binop(stack, |a: i32, b| a.mul(b)),
        I32DivS => try_binop(stack, |a: i32, b| a.div(b)),
        I32DivU => try_binop(stack, |a: u32, b| a.div(b)),
        I32RemS => try_binop(stack, |a: i32, b| a.rem(b)),
        I32RemU => try_binop(stack, |a: u32, b| a.rem(b)),
        I32And => binop(stack, |a: i32, b| a & b),
        I32Or => binop(stack, |a: i32, b| a | b),
        I32Xor => binop(stack, |a: i32, b| a ^ b),
        I32Shl => binop(stack, |a: i32, b: i32| a.wrapping_shl(b as u32)),
        I32ShrS => binop(stack, |a: i32, b| a.wrapping_shr(b as u32)),
        I32ShrU => binop(stack, |a: u32, b| a.wrapping_shr(b)),
        I32Rotl => binop(stack, |a: i32, b| a.rotl(b)),
        I32Rotr => binop(stack, |a: i32, b| a.rotr(b)),
        I64Clz => unop(stack, |v: i64| Integer::leading_zeros(v)),
        I64Ctz => unop(stack, |v: i64| Integer::trailing_zeros(v)),
        I64Popcnt => unop(stack, |v: i64| Integer::count_ones(v)),
        I64Add => binop(stack, |a: i64, b| a.add(b)),
        I64Sub => binop(stack, |a: i64, b| a.sub(b)),
        I64Mul => binop(stack, |a: i64, b| a.mul(b)),
        I64DivS => try_binop(stack, |a: i64, b| a.div(b)),
        I64DivU => try_binop(stack, |a: u64, b| a.div(b)),
        I64RemS => try_binop(stack, |a: i64, b| a.rem(b)),
        I64RemU => try_binop(stack, |a: u64, b| a.rem(b)),
        I64And => binop(stack, |a: i64, b| a & b),
        I64Or => binop(stack, |a: i64, b| a | b),
        I64Xor => binop(stack, |a: i64, b| a ^ b),
        I64Shl => binop(stack, |a: i64, b| a.wrapping_shl(b as u32)),
        I64ShrS => binop(stack, |a: i64, b| a.wrapping_shr(b as u32)),
        I64ShrU => binop(stack, |a: u64, b| a.wrapping_shr(b as u32)),
        I64Rotl => binop(stack, |a: i64, b| a.rotl(b)),
        I64Rotr => binop(stack, |a: i64, b| a.rotr(b)),

        F32Abs => unop(stack, |v: F32| Float::abs(v)),
        F32Neg => unop(stack, |v: F32| -v),
        F32Ceil => unop(stack, |v: F32| Float::ceil(v)),
        F32Floor => unop(stack, |v: F32| Float::floor(v)),
        F32Trunc => unop(stack, |v: F32| Float::trunc(v)),
        F32Nearest => unop(stack, |v: F32| Float::nearest(v)),
        F32Sqrt => unop(stack, |v: F32| Float::sqrt(v)),
        F32Add => binop(stack, |a: F32, b| a.add(b)),
        F32Sub => binop(stack, |a: F32, b| a.sub(b)),
        F32Mul => binop(stack, |a: F32, b| a.mul(b)),
        F32Div => try_binop(stack, |a: F32, b| a.div(b)),
        F32Min => binop(stack, |a: F32, b| Float::min(a, b)),
        F32Max => binop(stack, |a: F32, b| Float::max(a, b)),
        F32Copysign => binop(stack, |a: F32, b| Float::copysign(a, b)),
        F64Abs => unop(stack, |v: F64| Float::abs(v)),
        F64Neg => unop(stack, |v: F64| -v),
        F64Ceil => unop(stack, |v: F64| Float::ceil(v)),
        F64Floor => unop(stack, |v: F64| Float::floor(v)),
        F64Trunc => unop(stack, |v: F64| Float::trunc(v)),
        F64Nearest => unop(stack, |v: F64| Float::nearest(v)),
        F64Sqrt => unop(stack, |v: F64| Float::sqrt(v)),
        F64Add => binop(stack, |a: F64, b| a.add(b)),
        F64Sub => binop(stack, |a: F64, b| a.sub(b)),
        F64Mul => binop(stack, |a: F64, b| a.mul(b)),
        F64Div => try_binop(stack, |a: F64, b| a.div(b)),
        F64Min => binop(stack, |a: F64, b| Float::min(a, b)),
        F64Max => binop(stack, |a: F64, b| Float::max(a, b)),
        F64Copysign => binop(stack, |a: F64, b| Float::copysign(a, b)),

        I32WrapI64 => unop(stack, |v: i64| WrapInto::<i32>::wrap_into(v)),
        I32TruncF32S => try_unop(stack, |v: F32| TryTruncateInto::<i32>::try_truncate_into(v)),
        I32TruncF32U => try_unop(stack, |v: F32| TryTruncateInto::<u32>::try_truncate_into(v)),
        I32TruncF64S => try_unop(stack, |v: F64| TryTruncateInto::<i32>::try_truncate_into(v)),
        I32TruncF64U => try_unop(stack, |v: F64| TryTruncateInto::<u32>::try_truncate_into(v)),
        I64ExtendI32S => unop(stack, |v: i32| ExtendInto::<i64>::extend_into(v)),
        I64ExtendI32U => unop(stack, |v: u32| ExtendInto::<u64>::extend_into(v)),
        I64TruncF32S => try_unop(stack, |v: F32| TryTruncateInto::<i64>::try_truncate_into(v)),
        I64TruncF32U => try_unop(stack, |v: F32| TryTruncateInto::<u64>::try_truncate_into(v)),
        I64TruncF64S => try_unop(stack, |v: F64| TryTruncateInto::<i64>::try_truncate_into(v)),
        I64TruncF64U => try_unop(stack, |v: F64| TryTruncateInto::<u64>::try_truncate_into(v)),
        F32ConvertI32S => unop(stack, |v: i32| ExtendInto::<F32>::extend_into(v)),
        F32ConvertI32U => unop(stack, |v: u32| ExtendInto::<F32>::extend_into(v)),
        F32ConvertI64S => unop(stack, |v: i64| ExtendInto::<F32>::extend_into(v)),
        F32ConvertI64U => unop(stack, |v: u64| ExtendInto::<F32>::extend_into(v)),
        F32DemoteF64 => unop(stack, |v: F64| WrapInto::<F32>::wrap_into(v)),
        F64ConvertI32S => unop(stack, |v: i32| ExtendInto::<F64>::extend_into(v)),
        F64ConvertI32U => unop(stack, |v: u32| ExtendInto::<F64>::extend_into(v)),
        F64ConvertI64S => unop(stack, |v: i64| ExtendInto::<F64>::extend_into(v)),
        F64ConvertI64U => unop(stack, |v: u64| ExtendInto::<F64>::extend_into(v)),
        F64PromoteF32 => unop(stack, |v: F32| ExtendInto::<F64>::extend_into(v)),
        I32ReinterpretF32 => unop(stack, |v: F32| TransmuteInto::<i32>::transmute_into(v)),
        I64ReinterpretF64 => unop(stack, |v: F64| TransmuteInto::<i64>::transmute_into(v)),
        F32ReinterpretI32 => unop(stack, |v: i32| TransmuteInto::<F32>::transmute_into(v)),
        F64ReinterpretI64 => unop(stack, |v: i64| TransmuteInto::<F64>::transmute_into(v)),

        I32Extend8S => unop(stack, |v: i32| v as i8 as i32),
        I32Extend16S => unop(stack, |v: i32| v as i16 as i32),
        I64Extend8S => unop(stack, |v: i64| v as i8 as i64),
        I64Extend16S => unop(stack, |v: i64| v as i16 as i64),
        I64Extend32S => unop(stack, |v: i64| v as i32 as i64),

        I32TruncSatF32S => unop(stack, |v: F32| TruncateSatInto::<i32>::truncate_sat_into(v)),
        I32TruncSatF32U => unop(stack, |v: F32| TruncateSatInto::<u32>::truncate_sat_into(v)),
        I32TruncSatF64S => unop(stack, |v: F64| TruncateSatInto::<i32>::truncate_sat_into(v)),
        I32TruncSatF64U => unop(stack, |v: F64| TruncateSatInto::<u32>::truncate_sat_into(v)),
        I64TruncSatF32S => unop(stack, |v: F32| TruncateSatInto::<i64>::truncate_sat_into(v)),
        I64TruncSatF32U => unop(stack, |v: F32| TruncateSatInto::<u64>::truncate_sat_into(v)),
        I64TruncSatF64S => unop(stack, |v: F64| TruncateSatInto::<i64>::truncate_sat_into(v)),
        I64TruncSatF64U => unop(stack, |v: F64| TruncateSatInto::<u64>::truncate_sat_into(v)),
    }
}
