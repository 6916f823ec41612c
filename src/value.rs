//! Runtime values and the numeric conversion traits the interpreter
//! dispatches through.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::TrapCode;
use crate::func::FuncRef;
use crate::gc::GcRef;
use crate::nan_preserving_float::{F32, F64};
use crate::types::{HeapType, RefType, ValType};

/// An opaque reference supplied by the host.
///
/// The engine never looks inside; equality is handle identity.
#[derive(Clone)]
pub struct ExternRef(Arc<dyn Any + Send + Sync>);

impl ExternRef {
    /// Wraps a host value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcasts the wrapped host value.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Whether two handles wrap the same host value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ExternRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ExternRef({:p})", Arc::as_ptr(&self.0))
    }
}

/// A reference value: null or one of the four non-null variants.
#[derive(Clone)]
pub enum RefValue {
    /// Null of the given heap type.
    Null(HeapType),
    /// A reference to a function instance.
    Func(FuncRef),
    /// An opaque external handle.
    Extern(ExternRef),
    /// An unboxed 31-bit integer.
    I31(u32),
    /// A struct on the GC heap.
    Struct(GcRef),
    /// An array on the GC heap.
    Array(GcRef),
}

impl RefValue {
    /// A null `funcref`.
    pub fn null_func() -> Self {
        Self::Null(HeapType::NoFunc)
    }

    /// A null `externref`.
    pub fn null_extern() -> Self {
        Self::Null(HeapType::NoExtern)
    }

    /// Whether the reference is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// The canonical heap type of this value.
    pub fn heap_type(&self) -> HeapType {
        match self {
            Self::Null(heap) => heap.bottom(),
            Self::Func(func) => HeapType::Def(func.def_type().clone()),
            Self::Extern(_) => HeapType::Extern,
            Self::I31(_) => HeapType::I31,
            Self::Struct(gc_ref) | Self::Array(gc_ref) => HeapType::Def(gc_ref.def_type()),
        }
    }

    /// The most precise reference type of this value.
    pub fn ref_type(&self) -> RefType {
        match self {
            Self::Null(heap) => RefType::nullable(heap.bottom()),
            other => RefType::non_null(other.heap_type()),
        }
    }
}

impl PartialEq for RefValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null(_), Self::Null(_)) => true,
            (Self::Func(a), Self::Func(b)) => FuncRef::ptr_eq(a, b),
            (Self::Extern(a), Self::Extern(b)) => a.ptr_eq(b),
            (Self::I31(a), Self::I31(b)) => a & 0x7fff_ffff == b & 0x7fff_ffff,
            (Self::Struct(a), Self::Struct(b)) | (Self::Array(a), Self::Array(b)) => {
                a.id() == b.id()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for RefValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Null(heap) => write!(f, "null:{heap:?}"),
            Self::Func(_) => f.write_str("funcref"),
            Self::Extern(ext) => ext.fmt(f),
            Self::I31(value) => write!(f, "i31:{value}"),
            Self::Struct(gc_ref) => write!(f, "structref:{:?}", gc_ref.id()),
            Self::Array(gc_ref) => write!(f, "arrayref:{:?}", gc_ref.id()),
        }
    }
}

/// Runtime representation of a value.
///
/// There is no distinction between signed and unsigned integers; operations
/// interpret the bits as either as required.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(F32),
    /// 64-bit float.
    F64(F64),
    /// 128-bit vector.
    V128(u128),
    /// Reference.
    Ref(RefValue),
}

impl Value {
    /// Creates the default (zero / null) value of `val_type`.
    ///
    /// Returns `None` for non-nullable reference types, which have no
    /// default.
    pub fn default(val_type: &ValType) -> Option<Self> {
        match val_type {
            ValType::I32 => Some(Self::I32(0)),
            ValType::I64 => Some(Self::I64(0)),
            ValType::F32 => Some(Self::F32(F32::from_bits(0))),
            ValType::F64 => Some(Self::F64(F64::from_bits(0))),
            ValType::V128 => Some(Self::V128(0)),
            ValType::Ref(ref_type) => {
                if ref_type.nullable {
                    Some(Self::Ref(RefValue::Null(ref_type.heap.clone())))
                } else {
                    None
                }
            }
        }
    }

    /// The most precise value type of this value.
    pub fn value_type(&self) -> ValType {
        match self {
            Self::I32(_) => ValType::I32,
            Self::I64(_) => ValType::I64,
            Self::F32(_) => ValType::F32,
            Self::F64(_) => ValType::F64,
            Self::V128(_) => ValType::V128,
            Self::Ref(ref_value) => ValType::Ref(ref_value.ref_type()),
        }
    }

    /// Interprets a `u32` as an `f32` value.
    pub fn decode_f32(bits: u32) -> Self {
        Self::F32(F32::from_bits(bits))
    }

    /// Interprets a `u64` as an `f64` value.
    pub fn decode_f64(bits: u64) -> Self {
        Self::F64(F64::from_bits(bits))
    }

    /// Extracts a `T` if this value is of the matching type.
    pub fn try_into<T: FromValue>(self) -> Option<T> {
        T::from_value(self)
    }
}

/// Trait for extracting a native value out of a [`Value`].
pub trait FromValue: Sized {
    /// Returns `None` when the value is of a different type.
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($( $variant:ident => $t:ty as $conv:ty ),* $(,)?) => {
        $(
            impl FromValue for $t {
                fn from_value(value: Value) -> Option<Self> {
                    match value {
                        Value::$variant(inner) => Some(inner as $conv as $t),
                        _ => None,
                    }
                }
            }

            impl From<$t> for Value {
                fn from(value: $t) -> Self {
                    Value::$variant(value as $conv)
                }
            }
        )*
    };
}

impl_from_value! {
    I32 => i32 as i32,
    I32 => u32 as i32,
    I64 => i64 as i64,
    I64 => u64 as i64,
}

impl FromValue for F32 {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::F32(inner) => Some(inner),
            _ => None,
        }
    }
}

impl FromValue for F64 {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::F64(inner) => Some(inner),
            _ => None,
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Option<Self> {
        F32::from_value(value).map(F32::to_float)
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Option<Self> {
        F64::from_value(value).map(F64::to_float)
    }
}

impl FromValue for u128 {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::V128(inner) => Some(inner),
            _ => None,
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::I32(inner) => Some(inner != 0),
            _ => None,
        }
    }
}

impl FromValue for RefValue {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Ref(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<F32> for Value {
    fn from(value: F32) -> Self {
        Value::F32(value)
    }
}

impl From<F64> for Value {
    fn from(value: F64) -> Self {
        Value::F64(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::F32(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value.into())
    }
}

impl From<u128> for Value {
    fn from(value: u128) -> Self {
        Value::V128(value)
    }
}

impl From<RefValue> for Value {
    fn from(value: RefValue) -> Self {
        Value::Ref(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::I32(value as i32)
    }
}

/// Convert one type to another by wrapping.
pub trait WrapInto<T> {
    /// Convert one type to another by wrapping.
    fn wrap_into(self) -> T;
}

/// Convert one type to another by rounding towards zero; traps on NaN and
/// out-of-range inputs.
pub trait TryTruncateInto<T> {
    /// Convert one type to another by rounding towards zero.
    fn try_truncate_into(self) -> Result<T, TrapCode>;
}

/// Convert one type to another by rounding towards zero, saturating at the
/// bounds and mapping NaN to zero.
pub trait TruncateSatInto<T> {
    /// Convert with saturation.
    fn truncate_sat_into(self) -> T;
}

/// Convert one type to another by extending with leading zeroes or the sign
/// bit.
pub trait ExtendInto<T> {
    /// Convert one type to another by extension.
    fn extend_into(self) -> T;
}

/// Reinterprets the bits of a value as another type.
pub trait TransmuteInto<T> {
    /// Reinterprets the bits of a value as another type.
    fn transmute_into(self) -> T;
}

/// Convert from and to little endian byte slices.
///
/// Callers bounds-check the slice before conversion; the slice length must
/// equal `size_of::<Self>()`.
pub trait LittleEndianConvert: Sized {
    /// Writes the value to a little endian buffer.
    fn into_little_endian(self, buffer: &mut [u8]);
    /// Reads the value from a little endian buffer.
    fn from_little_endian(buffer: &[u8]) -> Self;
}

/// Arithmetic operations.
pub trait ArithmeticOps<T>: Copy {
    /// Add two values.
    fn add(self, other: T) -> T;
    /// Subtract two values.
    fn sub(self, other: T) -> T;
    /// Multiply two values.
    fn mul(self, other: T) -> T;
    /// Divide two values.
    fn div(self, other: T) -> Result<T, TrapCode>;
}

/// Integer operations.
pub trait Integer<T>: ArithmeticOps<T> {
    /// Counts leading zeros in the bitwise representation.
    fn leading_zeros(self) -> T;
    /// Counts trailing zeros in the bitwise representation.
    fn trailing_zeros(self) -> T;
    /// Counts 1-bits in the bitwise representation.
    fn count_ones(self) -> T;
    /// Left bit rotation; the amount is taken modulo the bit width.
    fn rotl(self, other: T) -> T;
    /// Right bit rotation; the amount is taken modulo the bit width.
    fn rotr(self, other: T) -> T;
    /// Division remainder.
    fn rem(self, other: T) -> Result<T, TrapCode>;
}

/// Float operations.
pub trait Float<T>: ArithmeticOps<T> {
    /// Absolute value.
    fn abs(self) -> T;
    /// Largest integer less than or equal to the value.
    fn floor(self) -> T;
    /// Smallest integer greater than or equal to the value.
    fn ceil(self) -> T;
    /// Integer part of the value.
    fn trunc(self) -> T;
    /// Nearest integer, ties to even.
    fn nearest(self) -> T;
    /// Square root.
    fn sqrt(self) -> T;
    /// Wasm minimum with NaN propagation.
    fn min(self, other: T) -> T;
    /// Wasm maximum with NaN propagation.
    fn max(self, other: T) -> T;
    /// Copies the sign of `other` onto `self`.
    fn copysign(self, other: T) -> T;
}

macro_rules! impl_wrap_into {
    ($( $from:ty => $into:ty ),* $(,)?) => {
        $(
            impl WrapInto<$into> for $from {
                fn wrap_into(self) -> $into {
                    self as $into
                }
            }
        )*
    };
}

impl_wrap_into! {
    i64 => i32,
    u64 => u32,
    i32 => i8, i32 => i16,
    i64 => i8, i64 => i16,
}

impl WrapInto<F32> for F64 {
    fn wrap_into(self) -> F32 {
        F32::from_float(self.to_float() as f32)
    }
}

macro_rules! impl_extend_into {
    ($( $from:ty => $into:ty ),* $(,)?) => {
        $(
            impl ExtendInto<$into> for $from {
                fn extend_into(self) -> $into {
                    self as $into
                }
            }
        )*
    };
}

impl_extend_into! {
    i8 => i32, u8 => i32, i16 => i32, u16 => i32,
    i8 => i64, u8 => i64, i16 => i64, u16 => i64,
    i32 => i64, u32 => i64, u32 => u64,
}

macro_rules! impl_float_extend {
    ($( $from:ty => $into:ident via $native:ty ),* $(,)?) => {
        $(
            impl ExtendInto<$into> for $from {
                fn extend_into(self) -> $into {
                    $into::from_float(self as $native)
                }
            }
        )*
    };
}

impl_float_extend! {
    i32 => F32 via f32, u32 => F32 via f32, i64 => F32 via f32, u64 => F32 via f32,
    i32 => F64 via f64, u32 => F64 via f64, i64 => F64 via f64, u64 => F64 via f64,
}

impl ExtendInto<F64> for F32 {
    fn extend_into(self) -> F64 {
        F64::from_float(self.to_float() as f64)
    }
}

macro_rules! impl_transmute {
    ($( $a:ty => $b:ty ),* $(,)?) => {
        $(
            impl TransmuteInto<$b> for $a {
                fn transmute_into(self) -> $b {
                    self as $b
                }
            }
            impl TransmuteInto<$a> for $b {
                fn transmute_into(self) -> $a {
                    self as $a
                }
            }
        )*
    };
}

impl_transmute! {
    i32 => u32,
    i64 => u64,
    i8 => u8,
    i16 => u16,
}

impl TransmuteInto<F32> for i32 {
    fn transmute_into(self) -> F32 {
        F32::from_bits(self as u32)
    }
}

impl TransmuteInto<i32> for F32 {
    fn transmute_into(self) -> i32 {
        self.to_bits() as i32
    }
}

impl TransmuteInto<F64> for i64 {
    fn transmute_into(self) -> F64 {
        F64::from_bits(self as u64)
    }
}

impl TransmuteInto<i64> for F64 {
    fn transmute_into(self) -> i64 {
        self.to_bits() as i64
    }
}

macro_rules! impl_try_truncate {
    ($( $float:ident => $int:ty ),* $(,)?) => {
        $(
            impl TryTruncateInto<$int> for $float {
                fn try_truncate_into(self) -> Result<$int, TrapCode> {
                    // The bound checks run in the f64 domain, where the
                    // relevant powers of two are exact and f32 inputs
                    // convert losslessly.
                    let value = self.to_float() as f64;
                    if value.is_nan() {
                        return Err(TrapCode::InvalidConvToInt);
                    }
                    let truncated = value.trunc();
                    let lower = <$int>::MIN as f64;
                    let upper = (<$int>::MAX as f64) + 1.0;
                    if truncated >= lower && truncated < upper {
                        Ok(truncated as $int)
                    } else {
                        Err(TrapCode::InvalidConvToInt)
                    }
                }
            }

            impl TruncateSatInto<$int> for $float {
                fn truncate_sat_into(self) -> $int {
                    // `as` from float saturates at the bounds and maps NaN
                    // to zero, exactly the required semantics.
                    self.to_float() as $int
                }
            }
        )*
    };
}

impl_try_truncate! {
    F32 => i32, F32 => u32, F32 => i64, F32 => u64,
    F64 => i32, F64 => u32, F64 => i64, F64 => u64,
}

macro_rules! impl_little_endian {
    ($( $t:ty ),* $(,)?) => {
        $(
            impl LittleEndianConvert for $t {
                fn into_little_endian(self, buffer: &mut [u8]) {
                    buffer.copy_from_slice(&self.to_le_bytes());
                }

                fn from_little_endian(buffer: &[u8]) -> Self {
                    let mut bytes = [0u8; core::mem::size_of::<$t>()];
                    bytes.copy_from_slice(buffer);
                    Self::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_little_endian!(i8, u8, i16, u16, i32, u32, i64, u64, u128);

impl LittleEndianConvert for F32 {
    fn into_little_endian(self, buffer: &mut [u8]) {
        self.to_bits().into_little_endian(buffer);
    }

    fn from_little_endian(buffer: &[u8]) -> Self {
        F32::from_bits(u32::from_little_endian(buffer))
    }
}

impl LittleEndianConvert for F64 {
    fn into_little_endian(self, buffer: &mut [u8]) {
        self.to_bits().into_little_endian(buffer);
    }

    fn from_little_endian(buffer: &[u8]) -> Self {
        F64::from_bits(u64::from_little_endian(buffer))
    }
}

macro_rules! impl_integer_ops {
    ($( $t:ty ),* $(,)?) => {
        $(
            impl ArithmeticOps<$t> for $t {
                fn add(self, other: $t) -> $t {
                    self.wrapping_add(other)
                }
                fn sub(self, other: $t) -> $t {
                    self.wrapping_sub(other)
                }
                fn mul(self, other: $t) -> $t {
                    self.wrapping_mul(other)
                }
                fn div(self, other: $t) -> Result<$t, TrapCode> {
                    if other == 0 {
                        return Err(TrapCode::DivideByZero);
                    }
                    match self.checked_div(other) {
                        Some(result) => Ok(result),
                        None => Err(TrapCode::IntegerOverflow),
                    }
                }
            }

            impl Integer<$t> for $t {
                fn leading_zeros(self) -> $t {
                    self.leading_zeros() as $t
                }
                fn trailing_zeros(self) -> $t {
                    self.trailing_zeros() as $t
                }
                fn count_ones(self) -> $t {
                    self.count_ones() as $t
                }
                fn rotl(self, other: $t) -> $t {
                    self.rotate_left(other as u32)
                }
                fn rotr(self, other: $t) -> $t {
                    self.rotate_right(other as u32)
                }
                fn rem(self, other: $t) -> Result<$t, TrapCode> {
                    if other == 0 {
                        return Err(TrapCode::DivideByZero);
                    }
                    // INT_MIN % -1 is 0, not an overflow.
                    Ok(self.wrapping_rem(other))
                }
            }
        )*
    };
}

impl_integer_ops!(i32, u32, i64, u64);

macro_rules! impl_float_ops {
    ($( $t:ident ),* $(,)?) => {
        $(
            impl ArithmeticOps<$t> for $t {
                fn add(self, other: $t) -> $t {
                    self + other
                }
                fn sub(self, other: $t) -> $t {
                    self - other
                }
                fn mul(self, other: $t) -> $t {
                    self * other
                }
                fn div(self, other: $t) -> Result<$t, TrapCode> {
                    Ok(self / other)
                }
            }

            impl Float<$t> for $t {
                fn abs(self) -> $t {
                    $t::abs(self)
                }
                fn floor(self) -> $t {
                    $t::floor(self)
                }
                fn ceil(self) -> $t {
                    $t::ceil(self)
                }
                fn trunc(self) -> $t {
                    $t::trunc(self)
                }
                fn nearest(self) -> $t {
                    $t::nearest(self)
                }
                fn sqrt(self) -> $t {
                    $t::sqrt(self)
                }
                fn min(self, other: $t) -> $t {
                    $t::min(self, other)
                }
                fn max(self, other: $t) -> $t {
                    $t::max(self, other)
                }
                fn copysign(self, other: $t) -> $t {
                    $t::copysign(self, other)
                }
            }
        )*
    };
}

impl_float_ops!(F32, F64);

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn division_edge_cases() {
        assert_matches!(1i32.div(0), Err(TrapCode::DivideByZero));
        assert_matches!(i32::MIN.div(-1), Err(TrapCode::IntegerOverflow));
        assert_matches!(i32::MIN.rem(-1), Ok(0));
        assert_matches!(7u32.div(2), Ok(3));
    }

    #[test]
    fn truncation_traps_on_nan_and_overflow() {
        assert_matches!(
            TryTruncateInto::<i32>::try_truncate_into(F32::NAN),
            Err(TrapCode::InvalidConvToInt)
        );
        assert_matches!(
            TryTruncateInto::<i32>::try_truncate_into(F64::from(3e10)),
            Err(TrapCode::InvalidConvToInt)
        );
        assert_matches!(
            TryTruncateInto::<i32>::try_truncate_into(F64::from(-7.9)),
            Ok(-7)
        );
    }

    #[test]
    fn saturating_truncation_clamps() {
        assert_eq!(TruncateSatInto::<i32>::truncate_sat_into(F32::NAN), 0);
        assert_eq!(
            TruncateSatInto::<i32>::truncate_sat_into(F64::from(3e10)),
            i32::MAX
        );
        assert_eq!(
            TruncateSatInto::<u32>::truncate_sat_into(F64::from(-5.0)),
            0
        );
    }

    #[test]
    fn value_round_trips_through_from_value() {
        let value = Value::from(42u32);
        assert_eq!(value.try_into::<u32>(), Some(42));
        assert_eq!(Value::from(1.5f64).try_into::<f64>(), Some(1.5));
        assert_eq!(Value::I64(-1).try_into::<i32>(), None);
    }

    #[test]
    fn null_refs_compare_equal() {
        assert_eq!(
            RefValue::null_func(),
            RefValue::Null(HeapType::NoFunc)
        );
        assert!(RefValue::null_extern().is_null());
    }
}
