//! Struct, array and i31 references executed through Wasm code, plus
//! collection of cycles built by Wasm.

use crate::ast::{self, ControlOp, GcOp, NumericOp, VariableOp};
use crate::{
    ArrayType, CompositeType, Config, FieldType, FuncType, HeapType, Mutability, Proposal,
    RecGroup, RefType, StorageType, StructType, SubType, TrapCode, ValType, Value,
};

use super::setup_with;

fn gc_config() -> Config {
    Config::new()
        .with_proposal(Proposal::GC)
        .with_proposal(Proposal::FunctionReferences)
}

/// Type 0: `struct (field (mut i32)) (field (mut (ref null 0)))`.
/// Type 1: `array (mut i16)`.
fn gc_module() -> ast::Module {
    let node_ref = ValType::Ref(RefType::nullable(HeapType::Index(0)));
    let mut module = ast::Module::default();
    module.types.push(RecGroup::single(SubType {
        is_final: true,
        supers: vec![],
        comp: CompositeType::Struct(StructType {
            fields: Box::new([
                FieldType {
                    storage: StorageType::Val(ValType::I32),
                    mutability: Mutability::Var,
                },
                FieldType {
                    storage: StorageType::Val(node_ref.clone()),
                    mutability: Mutability::Var,
                },
            ]),
        }),
    }));
    module.types.push(RecGroup::single(SubType {
        is_final: true,
        supers: vec![],
        comp: CompositeType::Array(ArrayType {
            field: FieldType {
                storage: StorageType::I16,
                mutability: Mutability::Var,
            },
        }),
    }));

    let export = |module: &mut ast::Module, name: &str, ty: FuncType, locals, body| {
        let type_idx = module.types.len() as u32;
        module.types.push(RecGroup::single(SubType::final_func(ty)));
        let func_idx = module.funcs.len() as u32;
        module.funcs.push(type_idx);
        module.bodies.push(ast::FuncBodyDef { locals, body });
        module.exports.push(ast::Export {
            name: name.into(),
            kind: ast::ExternKind::Func,
            index: func_idx,
        });
    };

    export(
        &mut module,
        "make",
        FuncType::new([], [node_ref.clone()]),
        vec![],
        vec![GcOp::StructNewDefault(0).into(), ControlOp::End.into()],
    );
    export(
        &mut module,
        "set_val",
        FuncType::new([node_ref.clone(), ValType::I32], []),
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            VariableOp::LocalGet(1).into(),
            GcOp::StructSet(0, 0).into(),
            ControlOp::End.into(),
        ],
    );
    export(
        &mut module,
        "get_val",
        FuncType::new([node_ref.clone()], [ValType::I32]),
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            GcOp::StructGet(0, 0).into(),
            ControlOp::End.into(),
        ],
    );
    export(
        &mut module,
        "link",
        FuncType::new([node_ref.clone(), node_ref.clone()], []),
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            VariableOp::LocalGet(1).into(),
            GcOp::StructSet(0, 1).into(),
            ControlOp::End.into(),
        ],
    );
    export(
        &mut module,
        "roundtrip_i31",
        FuncType::new([ValType::I32], [ValType::I32]),
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            GcOp::RefI31.into(),
            GcOp::I31GetS.into(),
            ControlOp::End.into(),
        ],
    );
    export(
        &mut module,
        "is_struct",
        FuncType::new(
            [ValType::Ref(RefType::nullable(HeapType::Any))],
            [ValType::I32],
        ),
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            GcOp::RefTest(RefType::non_null(HeapType::Struct)).into(),
            ControlOp::End.into(),
        ],
    );
    let arr_ref = ValType::Ref(RefType::nullable(HeapType::Index(1)));
    export(
        &mut module,
        "arr_make",
        FuncType::new([ValType::I32], [arr_ref.clone()]),
        vec![],
        vec![
            NumericOp::I32Const(0x7fff).into(),
            VariableOp::LocalGet(0).into(),
            GcOp::ArrayNew(1).into(),
            ControlOp::End.into(),
        ],
    );
    export(
        &mut module,
        "arr_get_u",
        FuncType::new([arr_ref.clone(), ValType::I32], [ValType::I32]),
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            VariableOp::LocalGet(1).into(),
            GcOp::ArrayGetU(1).into(),
            ControlOp::End.into(),
        ],
    );
    export(
        &mut module,
        "arr_len",
        FuncType::new([arr_ref], [ValType::I32]),
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            GcOp::ArrayLen.into(),
            ControlOp::End.into(),
        ],
    );
    module
}

#[test]
fn struct_fields_survive_round_trips() {
    let (exec, store) = setup_with(gc_config());
    let instance = exec.instantiate(&store, &gc_module()).unwrap();

    let node = exec.invoke_export(&instance, "make", &[]).unwrap().remove(0);
    // Default-constructed: field 0 is zero.
    assert_eq!(
        exec.invoke_export(&instance, "get_val", &[node.clone()]).unwrap(),
        vec![Value::I32(0)]
    );
    exec.invoke_export(&instance, "set_val", &[node.clone(), Value::I32(-7)])
        .unwrap();
    assert_eq!(
        exec.invoke_export(&instance, "get_val", &[node]).unwrap(),
        vec![Value::I32(-7)]
    );
}

#[test]
fn struct_access_through_null_traps() {
    let (exec, store) = setup_with(gc_config());
    let instance = exec.instantiate(&store, &gc_module()).unwrap();
    let null = Value::Ref(crate::RefValue::Null(HeapType::None));
    let result = exec.invoke_export(&instance, "get_val", &[null]);
    assert_eq!(
        result.unwrap_err().trap_code(),
        Some(TrapCode::NonNullRequired)
    );
}

#[test]
fn wasm_built_cycle_is_collected() {
    let (exec, store) = setup_with(gc_config());
    let instance = exec.instantiate(&store, &gc_module()).unwrap();
    let baseline = exec.heap().used();

    let a = exec.invoke_export(&instance, "make", &[]).unwrap().remove(0);
    let b = exec.invoke_export(&instance, "make", &[]).unwrap().remove(0);
    exec.invoke_export(&instance, "link", &[a.clone(), b.clone()])
        .unwrap();
    exec.invoke_export(&instance, "link", &[b.clone(), a.clone()])
        .unwrap();
    assert!(exec.heap().used() > baseline);

    // Both external handles gone: only the cycle keeps the pair alive.
    drop(a);
    drop(b);
    exec.collect_garbage();
    assert_eq!(exec.heap().used(), baseline);
}

#[test]
fn rooted_objects_survive_collection_cycles() {
    let (exec, store) = setup_with(gc_config());
    let instance = exec.instantiate(&store, &gc_module()).unwrap();
    let node = exec.invoke_export(&instance, "make", &[]).unwrap().remove(0);
    exec.invoke_export(&instance, "set_val", &[node.clone(), Value::I32(5)])
        .unwrap();
    exec.collect_garbage();
    exec.collect_garbage();
    assert_eq!(
        exec.invoke_export(&instance, "get_val", &[node]).unwrap(),
        vec![Value::I32(5)]
    );
}

#[test]
fn i31_round_trips_with_sign() {
    let (exec, store) = setup_with(gc_config());
    let instance = exec.instantiate(&store, &gc_module()).unwrap();
    for value in [0i32, 1, -1, 0x3fff_ffff, -0x4000_0000] {
        assert_eq!(
            exec.invoke_export(&instance, "roundtrip_i31", &[Value::I32(value)])
                .unwrap(),
            vec![Value::I32(value)],
            "i31 should round-trip {value}"
        );
    }
}

#[test]
fn ref_test_distinguishes_hierarchies() {
    let (exec, store) = setup_with(gc_config());
    let instance = exec.instantiate(&store, &gc_module()).unwrap();
    let node = exec.invoke_export(&instance, "make", &[]).unwrap().remove(0);
    assert_eq!(
        exec.invoke_export(&instance, "is_struct", &[node]).unwrap(),
        vec![Value::I32(1)]
    );
    let i31 = Value::Ref(crate::RefValue::I31(3));
    assert_eq!(
        exec.invoke_export(&instance, "is_struct", &[i31]).unwrap(),
        vec![Value::I32(0)]
    );
    let null = Value::Ref(crate::RefValue::Null(HeapType::None));
    assert_eq!(
        exec.invoke_export(&instance, "is_struct", &[null]).unwrap(),
        vec![Value::I32(0)]
    );
}

#[test]
fn packed_arrays_truncate_and_extend() {
    let (exec, store) = setup_with(gc_config());
    let instance = exec.instantiate(&store, &gc_module()).unwrap();
    let array = exec
        .invoke_export(&instance, "arr_make", &[Value::I32(4)])
        .unwrap()
        .remove(0);
    assert_eq!(
        exec.invoke_export(&instance, "arr_len", &[array.clone()]).unwrap(),
        vec![Value::I32(4)]
    );
    // 0x7fff zero-extends to itself through an i16 element.
    assert_eq!(
        exec.invoke_export(&instance, "arr_get_u", &[array.clone(), Value::I32(0)])
            .unwrap(),
        vec![Value::I32(0x7fff)]
    );
    let oob = exec.invoke_export(&instance, "arr_get_u", &[array, Value::I32(4)]);
    assert_eq!(
        oob.unwrap_err().trap_code(),
        Some(TrapCode::ArrayOutOfBounds)
    );
}

#[test]
fn gc_opcodes_require_the_proposal() {
    let (exec, store) = setup_with(Config::new().with_proposal(Proposal::FunctionReferences));
    let module = gc_module();
    let instance = exec.instantiate(&store, &module).unwrap();
    let result = exec.invoke_export(&instance, "make", &[]);
    assert_eq!(
        result.unwrap_err().trap_code(),
        Some(TrapCode::IllegalOpCode)
    );
}
