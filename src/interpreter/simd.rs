//! Evaluation of the 128-bit vector instruction family.
//!
//! Vectors are carried as `u128` in little-endian lane order and split
//! into lane arrays per shape. Relaxed operations execute with the
//! deterministic semantics of their non-relaxed counterparts, which the
//! relaxed-SIMD proposal permits.

use crate::ast::SimdOp;
use crate::error::TrapCode;
use crate::nan_preserving_float::{F32, F64};
use crate::value::Value;

use super::stack::ValueStack;

macro_rules! lane_shape {
    ($to:ident, $from:ident, $t:ty, $n:expr) => {
        fn $to(v: u128) -> [$t; $n] {
            let bytes = v.to_le_bytes();
            let size = core::mem::size_of::<$t>();
            let mut out = [0 as $t; $n];
            for (i, lane) in out.iter_mut().enumerate() {
                let mut buf = [0u8; core::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[i * size..(i + 1) * size]);
                *lane = <$t>::from_le_bytes(buf);
            }
            out
        }

        fn $from(lanes: [$t; $n]) -> u128 {
            let size = core::mem::size_of::<$t>();
            let mut bytes = [0u8; 16];
            for (i, lane) in lanes.iter().enumerate() {
                bytes[i * size..(i + 1) * size].copy_from_slice(&lane.to_le_bytes());
            }
            u128::from_le_bytes(bytes)
        }
    };
}

lane_shape!(to_i8x16, from_i8x16, i8, 16);
lane_shape!(to_u8x16, from_u8x16, u8, 16);
lane_shape!(to_i16x8, from_i16x8, i16, 8);
lane_shape!(to_u16x8, from_u16x8, u16, 8);
lane_shape!(to_i32x4, from_i32x4, i32, 4);
lane_shape!(to_u32x4, from_u32x4, u32, 4);
lane_shape!(to_i64x2, from_i64x2, i64, 2);
lane_shape!(to_u64x2, from_u64x2, u64, 2);
lane_shape!(to_f32x4, from_f32x4, f32, 4);
lane_shape!(to_f64x2, from_f64x2, f64, 2);

fn pop_v128(stack: &mut ValueStack) -> u128 {
    stack.pop_as::<u128>()
}

fn push_v128(stack: &mut ValueStack, v: u128) -> Result<(), TrapCode> {
    stack.push(Value::V128(v))
}

macro_rules! lanewise {
    // binary
    ($stack:expr, $to:ident, $from:ident, |$a:ident, $b:ident| $body:expr) => {{
        let rhs = pop_v128($stack);
        let lhs = pop_v128($stack);
        let (lhs, rhs) = ($to(lhs), $to(rhs));
        let mut out = $to(0);
        for i in 0..out.len() {
            let ($a, $b) = (lhs[i], rhs[i]);
            out[i] = $body;
        }
        push_v128($stack, $from(out))
    }};
    // unary
    ($stack:expr, $to:ident, $from:ident, |$a:ident| $body:expr) => {{
        let value = pop_v128($stack);
        let value = $to(value);
        let mut out = $to(0);
        for i in 0..out.len() {
            let $a = value[i];
            out[i] = $body;
        }
        push_v128($stack, $from(out))
    }};
}

fn mask_lane<T: Copy, const N: usize>(input: [bool; N], ones: T, zeros: T) -> [T; N] {
    let mut out = [zeros; N];
    for (lane, flag) in out.iter_mut().zip(input) {
        if flag {
            *lane = ones;
        }
    }
    out
}

macro_rules! cmp_shape {
    ($stack:expr, $to:ident, $from:ident, $t:ty, $n:expr, |$a:ident, $b:ident| $body:expr) => {{
        let rhs = pop_v128($stack);
        let lhs = pop_v128($stack);
        let (lhs, rhs) = ($to(lhs), $to(rhs));
        let mut flags = [false; $n];
        for i in 0..$n {
            let ($a, $b) = (lhs[i], rhs[i]);
            flags[i] = $body;
        }
        push_v128($stack, $from(mask_lane(flags, -1 as $t, 0 as $t)))
    }};
}

macro_rules! shift_shape {
    ($stack:expr, $to:ident, $from:ident, $bits:expr, |$a:ident, $s:ident| $body:expr) => {{
        let count = $stack.pop_as::<i32>() as u32 % $bits;
        let value = $to(pop_v128($stack));
        let mut out = $to(0);
        for i in 0..out.len() {
            let ($a, $s) = (value[i], count);
            out[i] = $body;
        }
        push_v128($stack, $from(out))
    }};
}

fn all_true<T: Copy + PartialEq + Default, const N: usize>(lanes: [T; N]) -> bool {
    lanes.iter().all(|lane| *lane != T::default())
}

fn float_min_f32(a: f32, b: f32) -> f32 {
    F32::from_float(a).min(F32::from_float(b)).to_float()
}

fn float_max_f32(a: f32, b: f32) -> f32 {
    F32::from_float(a).max(F32::from_float(b)).to_float()
}

fn float_min_f64(a: f64, b: f64) -> f64 {
    F64::from_float(a).min(F64::from_float(b)).to_float()
}

fn float_max_f64(a: f64, b: f64) -> f64 {
    F64::from_float(a).max(F64::from_float(b)).to_float()
}

fn nearest_f32(v: f32) -> f32 {
    F32::from_float(v).nearest().to_float()
}

fn nearest_f64(v: f64) -> f64 {
    F64::from_float(v).nearest().to_float()
}

/// Executes one non-memory vector instruction.
///
/// The memory-touching variants (`v128.load*`, `v128.store*`) are
/// dispatched by the interpreter loop, which owns memory resolution.
pub(super) fn run(op: &SimdOp, stack: &mut ValueStack) -> Result<(), TrapCode> {
    use SimdOp::*;
    match op {
        V128Load(_) | V128Load8x8S(_) | V128Load8x8U(_) | V128Load16x4S(_) | V128Load16x4U(_)
        | V128Load32x2S(_) | V128Load32x2U(_) | V128Load8Splat(_) | V128Load16Splat(_)
        | V128Load32Splat(_) | V128Load64Splat(_) | V128Store(_) | V128Load8Lane(..)
        | V128Load16Lane(..) | V128Load32Lane(..) | V128Load64Lane(..) | V128Store8Lane(..)
        | V128Store16Lane(..) | V128Store32Lane(..) | V128Store64Lane(..) | V128Load32Zero(_)
        | V128Load64Zero(_) => {
            unreachable!("memory-touching SIMD ops are dispatched by the interpreter loop")
        }

        V128Const(value) => push_v128(stack, *value),

        I8x16Shuffle(imm) => {
            let rhs = to_u8x16(pop_v128(stack));
            let lhs = to_u8x16(pop_v128(stack));
            let mut out = [0u8; 16];
            for (lane, pick) in out.iter_mut().zip(imm.iter()) {
                *lane = if *pick < 16 {
                    lhs[*pick as usize]
                } else {
                    rhs[(*pick - 16) as usize]
                };
            }
            push_v128(stack, u128::from_le_bytes(out))
        }
        I8x16Swizzle | I8x16RelaxedSwizzle => {
            let selector = to_u8x16(pop_v128(stack));
            let value = to_u8x16(pop_v128(stack));
            let mut out = [0u8; 16];
            for (lane, pick) in out.iter_mut().zip(selector) {
                *lane = if pick < 16 { value[pick as usize] } else { 0 };
            }
            push_v128(stack, u128::from_le_bytes(out))
        }

        I8x16Splat => {
            let value = stack.pop_as::<i32>() as i8;
            push_v128(stack, from_i8x16([value; 16]))
        }
        I16x8Splat => {
            let value = stack.pop_as::<i32>() as i16;
            push_v128(stack, from_i16x8([value; 8]))
        }
        I32x4Splat => {
            let value = stack.pop_as::<i32>();
            push_v128(stack, from_i32x4([value; 4]))
        }
        I64x2Splat => {
            let value = stack.pop_as::<i64>();
            push_v128(stack, from_i64x2([value; 2]))
        }
        F32x4Splat => {
            let value = stack.pop_as::<F32>().to_float();
            push_v128(stack, from_f32x4([value; 4]))
        }
        F64x2Splat => {
            let value = stack.pop_as::<F64>().to_float();
            push_v128(stack, from_f64x2([value; 2]))
        }

        I8x16ExtractLaneS(lane) => {
            let value = to_i8x16(pop_v128(stack));
            stack.push(Value::I32(value[*lane as usize] as i32))
        }
        I8x16ExtractLaneU(lane) => {
            let value = to_u8x16(pop_v128(stack));
            stack.push(Value::I32(value[*lane as usize] as i32))
        }
        I8x16ReplaceLane(lane) => {
            let scalar = stack.pop_as::<i32>() as i8;
            let mut value = to_i8x16(pop_v128(stack));
            value[*lane as usize] = scalar;
            push_v128(stack, from_i8x16(value))
        }
        I16x8ExtractLaneS(lane) => {
            let value = to_i16x8(pop_v128(stack));
            stack.push(Value::I32(value[*lane as usize] as i32))
        }
        I16x8ExtractLaneU(lane) => {
            let value = to_u16x8(pop_v128(stack));
            stack.push(Value::I32(value[*lane as usize] as i32))
        }
        I16x8ReplaceLane(lane) => {
            let scalar = stack.pop_as::<i32>() as i16;
            let mut value = to_i16x8(pop_v128(stack));
            value[*lane as usize] = scalar;
            push_v128(stack, from_i16x8(value))
        }
        I32x4ExtractLane(lane) => {
            let value = to_i32x4(pop_v128(stack));
            stack.push(Value::I32(value[*lane as usize]))
        }
        I32x4ReplaceLane(lane) => {
            let scalar = stack.pop_as::<i32>();
            let mut value = to_i32x4(pop_v128(stack));
            value[*lane as usize] = scalar;
            push_v128(stack, from_i32x4(value))
        }
        I64x2ExtractLane(lane) => {
            let value = to_i64x2(pop_v128(stack));
            stack.push(Value::I64(value[*lane as usize]))
        }
        I64x2ReplaceLane(lane) => {
            let scalar = stack.pop_as::<i64>();
            let mut value = to_i64x2(pop_v128(stack));
            value[*lane as usize] = scalar;
            push_v128(stack, from_i64x2(value))
        }
        F32x4ExtractLane(lane) => {
            let value = to_f32x4(pop_v128(stack));
            stack.push(Value::F32(F32::from_float(value[*lane as usize])))
        }
        F32x4ReplaceLane(lane) => {
            let scalar = stack.pop_as::<F32>().to_float();
            let mut value = to_f32x4(pop_v128(stack));
            value[*lane as usize] = scalar;
            push_v128(stack, from_f32x4(value))
        }
        F64x2ExtractLane(lane) => {
            let value = to_f64x2(pop_v128(stack));
            stack.push(Value::F64(F64::from_float(value[*lane as usize])))
        }
        F64x2ReplaceLane(lane) => {
            let scalar = stack.pop_as::<F64>().to_float();
            let mut value = to_f64x2(pop_v128(stack));
            value[*lane as usize] = scalar;
            push_v128(stack, from_f64x2(value))
        }

        I8x16Eq => cmp_shape!(stack, to_i8x16, from_i8x16, i8, 16, |a, b| a == b),
        I8x16Ne => cmp_shape!(stack, to_i8x16, from_i8x16, i8, 16, |a, b| a != b),
        I8x16LtS => cmp_shape!(stack, to_i8x16, from_i8x16, i8, 16, |a, b| a < b),
        I8x16LtU => cmp_shape!(stack, to_u8x16, from_i8x16, i8, 16, |a, b| a < b),
        I8x16GtS => cmp_shape!(stack, to_i8x16, from_i8x16, i8, 16, |a, b| a > b),
        I8x16GtU => cmp_shape!(stack, to_u8x16, from_i8x16, i8, 16, |a, b| a > b),
        I8x16LeS => cmp_shape!(stack, to_i8x16, from_i8x16, i8, 16, |a, b| a <= b),
        I8x16LeU => cmp_shape!(stack, to_u8x16, from_i8x16, i8, 16, |a, b| a <= b),
        I8x16GeS => cmp_shape!(stack, to_i8x16, from_i8x16, i8, 16, |a, b| a >= b),
        I8x16GeU => cmp_shape!(stack, to_u8x16, from_i8x16, i8, 16, |a, b| a >= b),
        I16x8Eq => cmp_shape!(stack, to_i16x8, from_i16x8, i16, 8, |a, b| a == b),
        I16x8Ne => cmp_shape!(stack, to_i16x8, from_i16x8, i16, 8, |a, b| a != b),
        I16x8LtS => cmp_shape!(stack, to_i16x8, from_i16x8, i16, 8, |a, b| a < b),
        I16x8LtU => cmp_shape!(stack, to_u16x8, from_i16x8, i16, 8, |a, b| a < b),
        I16x8GtS => cmp_shape!(stack, to_i16x8, from_i16x8, i16, 8, |a, b| a > b),
        I16x8GtU => cmp_shape!(stack, to_u16x8, from_i16x8, i16, 8, |a, b| a > b),
        I16x8LeS => cmp_shape!(stack, to_i16x8, from_i16x8, i16, 8, |a, b| a <= b),
        I16x8LeU => cmp_shape!(stack, to_u16x8, from_i16x8, i16, 8, |a, b| a <= b),
        I16x8GeS => cmp_shape!(stack, to_i16x8, from_i16x8, i16, 8, |a, b| a >= b),
        I16x8GeU => cmp_shape!(stack, to_u16x8, from_i16x8, i16, 8, |a, b| a >= b),
        I32x4Eq => cmp_shape!(stack, to_i32x4, from_i32x4, i32, 4, |a, b| a == b),
        I32x4Ne => cmp_shape!(stack, to_i32x4, from_i32x4, i32, 4, |a, b| a != b),
        I32x4LtS => cmp_shape!(stack, to_i32x4, from_i32x4, i32, 4, |a, b| a < b),
        I32x4LtU => cmp_shape!(stack, to_u32x4, from_i32x4, i32, 4, |a, b| a < b),
        I32x4GtS => cmp_shape!(stack, to_i32x4, from_i32x4, i32, 4, |a, b| a > b),
        I32x4GtU => cmp_shape!(stack, to_u32x4, from_i32x4, i32, 4, |a, b| a > b),
        I32x4LeS => cmp_shape!(stack, to_i32x4, from_i32x4, i32, 4, |a, b| a <= b),
        I32x4LeU => cmp_shape!(stack, to_u32x4, from_i32x4, i32, 4, |a, b| a <= b),
        I32x4GeS => cmp_shape!(stack, to_i32x4, from_i32x4, i32, 4, |a, b| a >= b),
        I32x4GeU => cmp_shape!(stack, to_u32x4, from_i32x4, i32, 4, |a, b| a >= b),
        I64x2Eq => cmp_shape!(stack, to_i64x2, from_i64x2, i64, 2, |a, b| a == b),
        I64x2Ne => cmp_shape!(stack, to_i64x2, from_i64x2, i64, 2, |a, b| a != b),
        I64x2LtS => cmp_shape!(stack, to_i64x2, from_i64x2, i64, 2, |a, b| a < b),
        I64x2GtS => cmp_shape!(stack, to_i64x2, from_i64x2, i64, 2, |a, b| a > b),
        I64x2LeS => cmp_shape!(stack, to_i64x2, from_i64x2, i64, 2, |a, b| a <= b),
        I64x2GeS => cmp_shape!(stack, to_i64x2, from_i64x2, i64, 2, |a, b| a >= b),
        F32x4Eq => cmp_shape!(stack, to_f32x4, from_i32x4, i32, 4, |a, b| a == b),
        F32x4Ne => cmp_shape!(stack, to_f32x4, from_i32x4, i32, 4, |a, b| a != b),
        F32x4Lt => cmp_shape!(stack, to_f32x4, from_i32x4, i32, 4, |a, b| a < b),
        F32x4Gt => cmp_shape!(stack, to_f32x4, from_i32x4, i32, 4, |a, b| a > b),
        F32x4Le => cmp_shape!(stack, to_f32x4, from_i32x4, i32, 4, |a, b| a <= b),
        F32x4Ge => cmp_shape!(stack, to_f32x4, from_i32x4, i32, 4, |a, b| a >= b),
        F64x2Eq => cmp_shape!(stack, to_f64x2, from_i64x2, i64, 2, |a, b| a == b),
        F64x2Ne => cmp_shape!(stack, to_f64x2, from_i64x2, i64, 2, |a, b| a != b),
        F64x2Lt => cmp_shape!(stack, to_f64x2, from_i64x2, i64, 2, |a, b| a < b),
        F64x2Gt => cmp_shape!(stack, to_f64x2, from_i64x2, i64, 2, |a, b| a > b),
        F64x2Le => cmp_shape!(stack, to_f64x2, from_i64x2, i64, 2, |a, b| a <= b),
        F64x2Ge => cmp_shape!(stack, to_f64x2, from_i64x2, i64, 2, |a, b| a >= b),

        V128Not => {
            let value = pop_v128(stack);
            push_v128(stack, !value)
        }
        V128And => {
            let rhs = pop_v128(stack);
            let lhs = pop_v128(stack);
            push_v128(stack, lhs & rhs)
        }
        V128AndNot => {
            let rhs = pop_v128(stack);
            let lhs = pop_v128(stack);
            push_v128(stack, lhs & !rhs)
        }
        V128Or => {
            let rhs = pop_v128(stack);
            let lhs = pop_v128(stack);
            push_v128(stack, lhs | rhs)
        }
        V128Xor => {
            let rhs = pop_v128(stack);
            let lhs = pop_v128(stack);
            push_v128(stack, lhs ^ rhs)
        }
        V128Bitselect
        | I8x16RelaxedLaneselect
        | I16x8RelaxedLaneselect
        | I32x4RelaxedLaneselect
        | I64x2RelaxedLaneselect => {
            let mask = pop_v128(stack);
            let rhs = pop_v128(stack);
            let lhs = pop_v128(stack);
            push_v128(stack, (lhs & mask) | (rhs & !mask))
        }
        V128AnyTrue => {
            let value = pop_v128(stack);
            stack.push(Value::from(value != 0))
        }

        F32x4DemoteF64x2Zero => {
            let value = to_f64x2(pop_v128(stack));
            push_v128(
                stack,
                from_f32x4([value[0] as f32, value[1] as f32, 0.0, 0.0]),
            )
        }
        F64x2PromoteLowF32x4 => {
            let value = to_f32x4(pop_v128(stack));
            push_v128(stack, from_f64x2([value[0] as f64, value[1] as f64]))
        }

        I8x16Abs => lanewise!(stack, to_i8x16, from_i8x16, |a| a.wrapping_abs()),
        I8x16Neg => lanewise!(stack, to_i8x16, from_i8x16, |a| a.wrapping_neg()),
        I8x16Popcnt => lanewise!(stack, to_u8x16, from_u8x16, |a| a.count_ones() as u8),
        I8x16AllTrue => {
            let value = to_i8x16(pop_v128(stack));
            stack.push(Value::from(all_true(value)))
        }
        I8x16Bitmask => {
            let value = to_i8x16(pop_v128(stack));
            let mut mask = 0i32;
            for (i, lane) in value.iter().enumerate() {
                if *lane < 0 {
                    mask |= 1 << i;
                }
            }
            stack.push(Value::I32(mask))
        }
        I8x16NarrowI16x8S => {
            let rhs = to_i16x8(pop_v128(stack));
            let lhs = to_i16x8(pop_v128(stack));
            let mut out = [0i8; 16];
            for i in 0..8 {
                out[i] = lhs[i].clamp(i8::MIN as i16, i8::MAX as i16) as i8;
                out[i + 8] = rhs[i].clamp(i8::MIN as i16, i8::MAX as i16) as i8;
            }
            push_v128(stack, from_i8x16(out))
        }
        I8x16NarrowI16x8U => {
            let rhs = to_i16x8(pop_v128(stack));
            let lhs = to_i16x8(pop_v128(stack));
            let mut out = [0u8; 16];
            for i in 0..8 {
                out[i] = lhs[i].clamp(0, u8::MAX as i16) as u8;
                out[i + 8] = rhs[i].clamp(0, u8::MAX as i16) as u8;
            }
            push_v128(stack, from_u8x16(out))
        }
        I8x16Shl => shift_shape!(stack, to_i8x16, from_i8x16, 8, |a, s| a.wrapping_shl(s)),
        I8x16ShrS => shift_shape!(stack, to_i8x16, from_i8x16, 8, |a, s| a.wrapping_shr(s)),
        I8x16ShrU => shift_shape!(stack, to_u8x16, from_u8x16, 8, |a, s| a.wrapping_shr(s)),
        I8x16Add => lanewise!(stack, to_i8x16, from_i8x16, |a, b| a.wrapping_add(b)),
        I8x16AddSatS => lanewise!(stack, to_i8x16, from_i8x16, |a, b| a.saturating_add(b)),
        I8x16AddSatU => lanewise!(stack, to_u8x16, from_u8x16, |a, b| a.saturating_add(b)),
        I8x16Sub => lanewise!(stack, to_i8x16, from_i8x16, |a, b| a.wrapping_sub(b)),
        I8x16SubSatS => lanewise!(stack, to_i8x16, from_i8x16, |a, b| a.saturating_sub(b)),
        I8x16SubSatU => lanewise!(stack, to_u8x16, from_u8x16, |a, b| a.saturating_sub(b)),
        I8x16MinS => lanewise!(stack, to_i8x16, from_i8x16, |a, b| a.min(b)),
        I8x16MinU => lanewise!(stack, to_u8x16, from_u8x16, |a, b| a.min(b)),
        I8x16MaxS => lanewise!(stack, to_i8x16, from_i8x16, |a, b| a.max(b)),
        I8x16MaxU => lanewise!(stack, to_u8x16, from_u8x16, |a, b| a.max(b)),
        I8x16AvgrU => lanewise!(stack, to_u8x16, from_u8x16, |a, b| {
            ((a as u16 + b as u16 + 1) / 2) as u8
        }),

        I16x8ExtaddPairwiseI8x16S => {
            let value = to_i8x16(pop_v128(stack));
            let mut out = [0i16; 8];
            for i in 0..8 {
                out[i] = value[2 * i] as i16 + value[2 * i + 1] as i16;
            }
            push_v128(stack, from_i16x8(out))
        }
        I16x8ExtaddPairwiseI8x16U => {
            let value = to_u8x16(pop_v128(stack));
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = value[2 * i] as u16 + value[2 * i + 1] as u16;
            }
            push_v128(stack, from_u16x8(out))
        }
        I32x4ExtaddPairwiseI16x8S => {
            let value = to_i16x8(pop_v128(stack));
            let mut out = [0i32; 4];
            for i in 0..4 {
                out[i] = value[2 * i] as i32 + value[2 * i + 1] as i32;
            }
            push_v128(stack, from_i32x4(out))
        }
        I32x4ExtaddPairwiseI16x8U => {
            let value = to_u16x8(pop_v128(stack));
            let mut out = [0u32; 4];
            for i in 0..4 {
                out[i] = value[2 * i] as u32 + value[2 * i + 1] as u32;
            }
            push_v128(stack, from_u32x4(out))
        }

        I16x8Abs => lanewise!(stack, to_i16x8, from_i16x8, |a| a.wrapping_abs()),
        I16x8Neg => lanewise!(stack, to_i16x8, from_i16x8, |a| a.wrapping_neg()),
        I16x8Q15MulrSatS | I16x8RelaxedQ15MulrS => {
            lanewise!(stack, to_i16x8, from_i16x8, |a, b| {
                let product = (a as i32 * b as i32 + 0x4000) >> 15;
                product.clamp(i16::MIN as i32, i16::MAX as i32) as i16
            })
        }
        I16x8AllTrue => {
            let value = to_i16x8(pop_v128(stack));
            stack.push(Value::from(all_true(value)))
        }
        I16x8Bitmask => {
            let value = to_i16x8(pop_v128(stack));
            let mut mask = 0i32;
            for (i, lane) in value.iter().enumerate() {
                if *lane < 0 {
                    mask |= 1 << i;
                }
            }
            stack.push(Value::I32(mask))
        }
        I16x8NarrowI32x4S => {
            let rhs = to_i32x4(pop_v128(stack));
            let lhs = to_i32x4(pop_v128(stack));
            let mut out = [0i16; 8];
            for i in 0..4 {
                out[i] = lhs[i].clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                out[i + 4] = rhs[i].clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
            push_v128(stack, from_i16x8(out))
        }
        I16x8NarrowI32x4U => {
            let rhs = to_i32x4(pop_v128(stack));
            let lhs = to_i32x4(pop_v128(stack));
            let mut out = [0u16; 8];
            for i in 0..4 {
                out[i] = lhs[i].clamp(0, u16::MAX as i32) as u16;
                out[i + 4] = rhs[i].clamp(0, u16::MAX as i32) as u16;
            }
            push_v128(stack, from_u16x8(out))
        }
        I16x8ExtendLowI8x16S => {
            let value = to_i8x16(pop_v128(stack));
            let mut out = [0i16; 8];
            for i in 0..8 {
                out[i] = value[i] as i16;
            }
            push_v128(stack, from_i16x8(out))
        }
        I16x8ExtendHighI8x16S => {
            let value = to_i8x16(pop_v128(stack));
            let mut out = [0i16; 8];
            for i in 0..8 {
                out[i] = value[i + 8] as i16;
            }
            push_v128(stack, from_i16x8(out))
        }
        I16x8ExtendLowI8x16U => {
            let value = to_u8x16(pop_v128(stack));
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = value[i] as u16;
            }
            push_v128(stack, from_u16x8(out))
        }
        I16x8ExtendHighI8x16U => {
            let value = to_u8x16(pop_v128(stack));
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = value[i + 8] as u16;
            }
            push_v128(stack, from_u16x8(out))
        }
        I16x8Shl => shift_shape!(stack, to_i16x8, from_i16x8, 16, |a, s| a.wrapping_shl(s)),
        I16x8ShrS => shift_shape!(stack, to_i16x8, from_i16x8, 16, |a, s| a.wrapping_shr(s)),
        I16x8ShrU => shift_shape!(stack, to_u16x8, from_u16x8, 16, |a, s| a.wrapping_shr(s)),
        I16x8Add => lanewise!(stack, to_i16x8, from_i16x8, |a, b| a.wrapping_add(b)),
        I16x8AddSatS => lanewise!(stack, to_i16x8, from_i16x8, |a, b| a.saturating_add(b)),
        I16x8AddSatU => lanewise!(stack, to_u16x8, from_u16x8, |a, b| a.saturating_add(b)),
        I16x8Sub => lanewise!(stack, to_i16x8, from_i16x8, |a, b| a.wrapping_sub(b)),
        I16x8SubSatS => lanewise!(stack, to_i16x8, from_i16x8, |a, b| a.saturating_sub(b)),
        I16x8SubSatU => lanewise!(stack, to_u16x8, from_u16x8, |a, b| a.saturating_sub(b)),
        I16x8Mul => lanewise!(stack, to_i16x8, from_i16x8, |a, b| a.wrapping_mul(b)),
        I16x8MinS => lanewise!(stack, to_i16x8, from_i16x8, |a, b| a.min(b)),
        I16x8MinU => lanewise!(stack, to_u16x8, from_u16x8, |a, b| a.min(b)),
        I16x8MaxS => lanewise!(stack, to_i16x8, from_i16x8, |a, b| a.max(b)),
        I16x8MaxU => lanewise!(stack, to_u16x8, from_u16x8, |a, b| a.max(b)),
        I16x8AvgrU => lanewise!(stack, to_u16x8, from_u16x8, |a, b| {
            ((a as u32 + b as u32 + 1) / 2) as u16
        }),
        I16x8ExtmulLowI8x16S => {
            let rhs = to_i8x16(pop_v128(stack));
            let lhs = to_i8x16(pop_v128(stack));
            let mut out = [0i16; 8];
            for i in 0..8 {
                out[i] = lhs[i] as i16 * rhs[i] as i16;
            }
            push_v128(stack, from_i16x8(out))
        }
        I16x8ExtmulHighI8x16S => {
            let rhs = to_i8x16(pop_v128(stack));
            let lhs = to_i8x16(pop_v128(stack));
            let mut out = [0i16; 8];
            for i in 0..8 {
                out[i] = lhs[i + 8] as i16 * rhs[i + 8] as i16;
            }
            push_v128(stack, from_i16x8(out))
        }
        I16x8ExtmulLowI8x16U => {
            let rhs = to_u8x16(pop_v128(stack));
            let lhs = to_u8x16(pop_v128(stack));
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = lhs[i] as u16 * rhs[i] as u16;
            }
            push_v128(stack, from_u16x8(out))
        }
        I16x8ExtmulHighI8x16U => {
            let rhs = to_u8x16(pop_v128(stack));
            let lhs = to_u8x16(pop_v128(stack));
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = lhs[i + 8] as u16 * rhs[i + 8] as u16;
            }
            push_v128(stack, from_u16x8(out))
        }
        I16x8RelaxedDotI8x16I7x16S => {
            let rhs = to_i8x16(pop_v128(stack));
            let lhs = to_i8x16(pop_v128(stack));
            let mut out = [0i16; 8];
            for i in 0..8 {
                out[i] = (lhs[2 * i] as i16 * rhs[2 * i] as i16)
                    .wrapping_add(lhs[2 * i + 1] as i16 * rhs[2 * i + 1] as i16);
            }
            push_v128(stack, from_i16x8(out))
        }

        I32x4Abs => lanewise!(stack, to_i32x4, from_i32x4, |a| a.wrapping_abs()),
        I32x4Neg => lanewise!(stack, to_i32x4, from_i32x4, |a| a.wrapping_neg()),
        I32x4AllTrue => {
            let value = to_i32x4(pop_v128(stack));
            stack.push(Value::from(all_true(value)))
        }
        I32x4Bitmask => {
            let value = to_i32x4(pop_v128(stack));
            let mut mask = 0i32;
            for (i, lane) in value.iter().enumerate() {
                if *lane < 0 {
                    mask |= 1 << i;
                }
            }
            stack.push(Value::I32(mask))
        }
        I32x4ExtendLowI16x8S => {
            let value = to_i16x8(pop_v128(stack));
            push_v128(
                stack,
                from_i32x4([
                    value[0] as i32,
                    value[1] as i32,
                    value[2] as i32,
                    value[3] as i32,
                ]),
            )
        }
        I32x4ExtendHighI16x8S => {
            let value = to_i16x8(pop_v128(stack));
            push_v128(
                stack,
                from_i32x4([
                    value[4] as i32,
                    value[5] as i32,
                    value[6] as i32,
                    value[7] as i32,
                ]),
            )
        }
        I32x4ExtendLowI16x8U => {
            let value = to_u16x8(pop_v128(stack));
            push_v128(
                stack,
                from_u32x4([
                    value[0] as u32,
                    value[1] as u32,
                    value[2] as u32,
                    value[3] as u32,
                ]),
            )
        }
        I32x4ExtendHighI16x8U => {
            let value = to_u16x8(pop_v128(stack));
            push_v128(
                stack,
                from_u32x4([
                    value[4] as u32,
                    value[5] as u32,
                    value[6] as u32,
                    value[7] as u32,
                ]),
            )
        }
        I32x4Shl => shift_shape!(stack, to_i32x4, from_i32x4, 32, |a, s| a.wrapping_shl(s)),
        I32x4ShrS => shift_shape!(stack, to_i32x4, from_i32x4, 32, |a, s| a.wrapping_shr(s)),
        I32x4ShrU => shift_shape!(stack, to_u32x4, from_u32x4, 32, |a, s| a.wrapping_shr(s)),
        I32x4Add => lanewise!(stack, to_i32x4, from_i32x4, |a, b| a.wrapping_add(b)),
        I32x4Sub => lanewise!(stack, to_i32x4, from_i32x4, |a, b| a.wrapping_sub(b)),
        I32x4Mul => lanewise!(stack, to_i32x4, from_i32x4, |a, b| a.wrapping_mul(b)),
        I32x4MinS => lanewise!(stack, to_i32x4, from_i32x4, |a, b| a.min(b)),
        I32x4MinU => lanewise!(stack, to_u32x4, from_u32x4, |a, b| a.min(b)),
        I32x4MaxS => lanewise!(stack, to_i32x4, from_i32x4, |a, b| a.max(b)),
        I32x4MaxU => lanewise!(stack, to_u32x4, from_u32x4, |a, b| a.max(b)),
        I32x4DotI16x8S => {
            let rhs = to_i16x8(pop_v128(stack));
            let lhs = to_i16x8(pop_v128(stack));
            let mut out = [0i32; 4];
            for i in 0..4 {
                out[i] = (lhs[2 * i] as i32 * rhs[2 * i] as i32)
                    .wrapping_add(lhs[2 * i + 1] as i32 * rhs[2 * i + 1] as i32);
            }
            push_v128(stack, from_i32x4(out))
        }
        I32x4ExtmulLowI16x8S => {
            let rhs = to_i16x8(pop_v128(stack));
            let lhs = to_i16x8(pop_v128(stack));
            let mut out = [0i32; 4];
            for i in 0..4 {
                out[i] = lhs[i] as i32 * rhs[i] as i32;
            }
            push_v128(stack, from_i32x4(out))
        }
        I32x4ExtmulHighI16x8S => {
            let rhs = to_i16x8(pop_v128(stack));
            let lhs = to_i16x8(pop_v128(stack));
            let mut out = [0i32; 4];
            for i in 0..4 {
                out[i] = lhs[i + 4] as i32 * rhs[i + 4] as i32;
            }
            push_v128(stack, from_i32x4(out))
        }
        I32x4ExtmulLowI16x8U => {
            let rhs = to_u16x8(pop_v128(stack));
            let lhs = to_u16x8(pop_v128(stack));
            let mut out = [0u32; 4];
            for i in 0..4 {
                out[i] = lhs[i] as u32 * rhs[i] as u32;
            }
            push_v128(stack, from_u32x4(out))
        }
        I32x4ExtmulHighI16x8U => {
            let rhs = to_u16x8(pop_v128(stack));
            let lhs = to_u16x8(pop_v128(stack));
            let mut out = [0u32; 4];
            for i in 0..4 {
                out[i] = lhs[i + 4] as u32 * rhs[i + 4] as u32;
            }
            push_v128(stack, from_u32x4(out))
        }
        I32x4RelaxedDotI8x16I7x16AddS => {
            let acc = to_i32x4(pop_v128(stack));
            let rhs = to_i8x16(pop_v128(stack));
            let lhs = to_i8x16(pop_v128(stack));
            let mut out = [0i32; 4];
            for i in 0..4 {
                let mut sum = 0i32;
                for j in 0..4 {
                    let k = 4 * i + j;
                    sum = sum.wrapping_add(lhs[k] as i32 * rhs[k] as i32);
                }
                out[i] = sum.wrapping_add(acc[i]);
            }
            push_v128(stack, from_i32x4(out))
        }

        I64x2Abs => lanewise!(stack, to_i64x2, from_i64x2, |a| a.wrapping_abs()),
        I64x2Neg => lanewise!(stack, to_i64x2, from_i64x2, |a| a.wrapping_neg()),
        I64x2AllTrue => {
            let value = to_i64x2(pop_v128(stack));
            stack.push(Value::from(all_true(value)))
        }
        I64x2Bitmask => {
            let value = to_i64x2(pop_v128(stack));
            let mut mask = 0i32;
            for (i, lane) in value.iter().enumerate() {
                if *lane < 0 {
                    mask |= 1 << i;
                }
            }
            stack.push(Value::I32(mask))
        }
        I64x2ExtendLowI32x4S => {
            let value = to_i32x4(pop_v128(stack));
            push_v128(stack, from_i64x2([value[0] as i64, value[1] as i64]))
        }
        I64x2ExtendHighI32x4S => {
            let value = to_i32x4(pop_v128(stack));
            push_v128(stack, from_i64x2([value[2] as i64, value[3] as i64]))
        }
        I64x2ExtendLowI32x4U => {
            let value = to_u32x4(pop_v128(stack));
            push_v128(stack, from_u64x2([value[0] as u64, value[1] as u64]))
        }
        I64x2ExtendHighI32x4U => {
            let value = to_u32x4(pop_v128(stack));
            push_v128(stack, from_u64x2([value[2] as u64, value[3] as u64]))
        }
        I64x2Shl => shift_shape!(stack, to_i64x2, from_i64x2, 64, |a, s| a.wrapping_shl(s)),
        I64x2ShrS => shift_shape!(stack, to_i64x2, from_i64x2, 64, |a, s| a.wrapping_shr(s)),
        I64x2ShrU => shift_shape!(stack, to_u64x2, from_u64x2, 64, |a, s| a.wrapping_shr(s)),
        I64x2Add => lanewise!(stack, to_i64x2, from_i64x2, |a, b| a.wrapping_add(b)),
        I64x2Sub => lanewise!(stack, to_i64x2, from_i64x2, |a, b| a.wrapping_sub(b)),
        I64x2Mul => lanewise!(stack, to_i64x2, from_i64x2, |a, b| a.wrapping_mul(b)),
        I64x2ExtmulLowI32x4S => {
            let rhs = to_i32x4(pop_v128(stack));
            let lhs = to_i32x4(pop_v128(stack));
            push_v128(
                stack,
                from_i64x2([
                    lhs[0] as i64 * rhs[0] as i64,
                    lhs[1] as i64 * rhs[1] as i64,
                ]),
            )
        }
        I64x2ExtmulHighI32x4S => {
            let rhs = to_i32x4(pop_v128(stack));
            let lhs = to_i32x4(pop_v128(stack));
            push_v128(
                stack,
                from_i64x2([
                    lhs[2] as i64 * rhs[2] as i64,
                    lhs[3] as i64 * rhs[3] as i64,
                ]),
            )
        }
        I64x2ExtmulLowI32x4U => {
            let rhs = to_u32x4(pop_v128(stack));
            let lhs = to_u32x4(pop_v128(stack));
            push_v128(
                stack,
                from_u64x2([
                    lhs[0] as u64 * rhs[0] as u64,
                    lhs[1] as u64 * rhs[1] as u64,
                ]),
            )
        }
        I64x2ExtmulHighI32x4U => {
            let rhs = to_u32x4(pop_v128(stack));
            let lhs = to_u32x4(pop_v128(stack));
            push_v128(
                stack,
                from_u64x2([
                    lhs[2] as u64 * rhs[2] as u64,
                    lhs[3] as u64 * rhs[3] as u64,
                ]),
            )
        }

        F32x4Abs => lanewise!(stack, to_f32x4, from_f32x4, |a| f32::abs(a)),
        F32x4Neg => lanewise!(stack, to_f32x4, from_f32x4, |a| -a),
        F32x4Sqrt => lanewise!(stack, to_f32x4, from_f32x4, |a| f32::sqrt(a)),
        F32x4Ceil => lanewise!(stack, to_f32x4, from_f32x4, |a| f32::ceil(a)),
        F32x4Floor => lanewise!(stack, to_f32x4, from_f32x4, |a| f32::floor(a)),
        F32x4Trunc => lanewise!(stack, to_f32x4, from_f32x4, |a| f32::trunc(a)),
        F32x4Nearest => lanewise!(stack, to_f32x4, from_f32x4, |a| nearest_f32(a)),
        F32x4Add => lanewise!(stack, to_f32x4, from_f32x4, |a, b| a + b),
        F32x4Sub => lanewise!(stack, to_f32x4, from_f32x4, |a, b| a - b),
        F32x4Mul => lanewise!(stack, to_f32x4, from_f32x4, |a, b| a * b),
        F32x4Div => lanewise!(stack, to_f32x4, from_f32x4, |a, b| a / b),
        F32x4Min | F32x4RelaxedMin => {
            lanewise!(stack, to_f32x4, from_f32x4, |a, b| float_min_f32(a, b))
        }
        F32x4Max | F32x4RelaxedMax => {
            lanewise!(stack, to_f32x4, from_f32x4, |a, b| float_max_f32(a, b))
        }
        F32x4Pmin => lanewise!(stack, to_f32x4, from_f32x4, |a, b| if b < a { b } else { a }),
        F32x4Pmax => lanewise!(stack, to_f32x4, from_f32x4, |a, b| if a < b { b } else { a }),
        F64x2Abs => lanewise!(stack, to_f64x2, from_f64x2, |a| f64::abs(a)),
        F64x2Neg => lanewise!(stack, to_f64x2, from_f64x2, |a| -a),
        F64x2Sqrt => lanewise!(stack, to_f64x2, from_f64x2, |a| f64::sqrt(a)),
        F64x2Ceil => lanewise!(stack, to_f64x2, from_f64x2, |a| f64::ceil(a)),
        F64x2Floor => lanewise!(stack, to_f64x2, from_f64x2, |a| f64::floor(a)),
        F64x2Trunc => lanewise!(stack, to_f64x2, from_f64x2, |a| f64::trunc(a)),
        F64x2Nearest => lanewise!(stack, to_f64x2, from_f64x2, |a| nearest_f64(a)),
        F64x2Add => lanewise!(stack, to_f64x2, from_f64x2, |a, b| a + b),
        F64x2Sub => lanewise!(stack, to_f64x2, from_f64x2, |a, b| a - b),
        F64x2Mul => lanewise!(stack, to_f64x2, from_f64x2, |a, b| a * b),
        F64x2Div => lanewise!(stack, to_f64x2, from_f64x2, |a, b| a / b),
        F64x2Min | F64x2RelaxedMin => {
            lanewise!(stack, to_f64x2, from_f64x2, |a, b| float_min_f64(a, b))
        }
        F64x2Max | F64x2RelaxedMax => {
            lanewise!(stack, to_f64x2, from_f64x2, |a, b| float_max_f64(a, b))
        }
        F64x2Pmin => lanewise!(stack, to_f64x2, from_f64x2, |a, b| if b < a { b } else { a }),
        F64x2Pmax => lanewise!(stack, to_f64x2, from_f64x2, |a, b| if a < b { b } else { a }),

        I32x4TruncSatF32x4S | I32x4RelaxedTruncF32x4S => {
            let value = to_f32x4(pop_v128(stack));
            let mut out = [0i32; 4];
            for (lane, v) in out.iter_mut().zip(value) {
                *lane = v as i32;
            }
            push_v128(stack, from_i32x4(out))
        }
        I32x4TruncSatF32x4U | I32x4RelaxedTruncF32x4U => {
            let value = to_f32x4(pop_v128(stack));
            let mut out = [0u32; 4];
            for (lane, v) in out.iter_mut().zip(value) {
                *lane = v as u32;
            }
            push_v128(stack, from_u32x4(out))
        }
        F32x4ConvertI32x4S => {
            let value = to_i32x4(pop_v128(stack));
            let mut out = [0f32; 4];
            for (lane, v) in out.iter_mut().zip(value) {
                *lane = v as f32;
            }
            push_v128(stack, from_f32x4(out))
        }
        F32x4ConvertI32x4U => {
            let value = to_u32x4(pop_v128(stack));
            let mut out = [0f32; 4];
            for (lane, v) in out.iter_mut().zip(value) {
                *lane = v as f32;
            }
            push_v128(stack, from_f32x4(out))
        }
        I32x4TruncSatF64x2SZero | I32x4RelaxedTruncF64x2SZero => {
            let value = to_f64x2(pop_v128(stack));
            push_v128(stack, from_i32x4([value[0] as i32, value[1] as i32, 0, 0]))
        }
        I32x4TruncSatF64x2UZero | I32x4RelaxedTruncF64x2UZero => {
            let value = to_f64x2(pop_v128(stack));
            push_v128(stack, from_u32x4([value[0] as u32, value[1] as u32, 0, 0]))
        }
        F64x2ConvertLowI32x4S => {
            let value = to_i32x4(pop_v128(stack));
            push_v128(stack, from_f64x2([value[0] as f64, value[1] as f64]))
        }
        F64x2ConvertLowI32x4U => {
            let value = to_u32x4(pop_v128(stack));
            push_v128(stack, from_f64x2([value[0] as f64, value[1] as f64]))
        }

        F32x4RelaxedMadd => {
            let addend = to_f32x4(pop_v128(stack));
            let rhs = to_f32x4(pop_v128(stack));
            let lhs = to_f32x4(pop_v128(stack));
            let mut out = [0f32; 4];
            for i in 0..4 {
                out[i] = lhs[i] * rhs[i] + addend[i];
            }
            push_v128(stack, from_f32x4(out))
        }
        F32x4RelaxedNmadd => {
            let addend = to_f32x4(pop_v128(stack));
            let rhs = to_f32x4(pop_v128(stack));
            let lhs = to_f32x4(pop_v128(stack));
            let mut out = [0f32; 4];
            for i in 0..4 {
                out[i] = -(lhs[i] * rhs[i]) + addend[i];
            }
            push_v128(stack, from_f32x4(out))
        }
        F64x2RelaxedMadd => {
            let addend = to_f64x2(pop_v128(stack));
            let rhs = to_f64x2(pop_v128(stack));
            let lhs = to_f64x2(pop_v128(stack));
            let mut out = [0f64; 2];
            for i in 0..2 {
                out[i] = lhs[i] * rhs[i] + addend[i];
            }
            push_v128(stack, from_f64x2(out))
        }
        F64x2RelaxedNmadd => {
            let addend = to_f64x2(pop_v128(stack));
            let rhs = to_f64x2(pop_v128(stack));
            let lhs = to_f64x2(pop_v128(stack));
            let mut out = [0f64; 2];
            for i in 0..2 {
                out[i] = -(lhs[i] * rhs[i]) + addend[i];
            }
            push_v128(stack, from_f64x2(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(ops: &[SimdOp], inputs: &[Value]) -> Value {
        let mut stack = ValueStack::new(64);
        for input in inputs {
            stack.push(input.clone()).unwrap();
        }
        for op in ops {
            run(op, &mut stack).unwrap();
        }
        stack.pop()
    }

    fn splat8(byte: u8) -> u128 {
        u128::from_le_bytes([byte; 16])
    }

    #[test]
    fn i8x16_add_wraps() {
        let result = eval(
            &[SimdOp::I8x16Add],
            &[Value::V128(splat8(0xff)), Value::V128(splat8(2))],
        );
        assert_eq!(result, Value::V128(splat8(1)));
    }

    #[test]
    fn i8x16_add_sat_saturates() {
        let result = eval(
            &[SimdOp::I8x16AddSatU],
            &[Value::V128(splat8(0xf0)), Value::V128(splat8(0x20))],
        );
        assert_eq!(result, Value::V128(splat8(0xff)));
    }

    #[test]
    fn comparison_produces_lane_masks() {
        let result = eval(
            &[SimdOp::I8x16Eq],
            &[Value::V128(splat8(3)), Value::V128(splat8(3))],
        );
        assert_eq!(result, Value::V128(u128::MAX));
    }

    #[test]
    fn bitmask_collects_sign_bits() {
        let result = eval(&[SimdOp::I8x16Bitmask], &[Value::V128(splat8(0x80))]);
        assert_eq!(result, Value::I32(0xffff));
    }

    #[test]
    fn splat_and_extract_round_trip() {
        let result = eval(
            &[SimdOp::I32x4Splat, SimdOp::I32x4ExtractLane(3)],
            &[Value::I32(-7)],
        );
        assert_eq!(result, Value::I32(-7));
    }

    #[test]
    fn shuffle_picks_across_both_vectors() {
        let mut imm = [0u8; 16];
        imm[0] = 0;
        imm[1] = 16;
        let result = eval(
            &[SimdOp::I8x16Shuffle(imm)],
            &[Value::V128(splat8(0xaa)), Value::V128(splat8(0xbb))],
        );
        let bytes = match result {
            Value::V128(v) => v.to_le_bytes(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(bytes[0], 0xaa);
        assert_eq!(bytes[1], 0xbb);
    }

    #[test]
    fn shift_counts_mask_by_lane_width() {
        let result = eval(
            &[SimdOp::I8x16Shl],
            &[Value::V128(splat8(1)), Value::I32(9)],
        );
        assert_eq!(result, Value::V128(splat8(2)));
    }

    #[test]
    fn trunc_sat_clamps_lanes() {
        let input = from_f32x4([3.5e10, -3.5e10, f32::NAN, 1.5]);
        let result = eval(&[SimdOp::I32x4TruncSatF32x4S], &[Value::V128(input)]);
        assert_eq!(result, Value::V128(from_i32x4([i32::MAX, i32::MIN, 0, 1])));
    }
}
