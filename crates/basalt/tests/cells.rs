use std::rc::Rc;

use basalt::{
    Cell, CodeBuilder, CodeUnit, Engine, EngineConfig, ErrorKind, ExcType, InternalError, MAKE_FUNCTION_CLOSURE,
    Opcode, RunError, Value,
};

/// `def inner(): return x` over one free variable.
fn reader() -> Rc<CodeUnit> {
    let mut b = CodeBuilder::new("inner");
    let x = b.add_free_var("x");
    b.emit_u16(Opcode::LoadDeref, x);
    b.emit(Opcode::ReturnValue);
    Rc::new(b.build().unwrap())
}

/// Emits `MakeFunction` for `code` closing over the given cells.
fn emit_closure(b: &mut CodeBuilder, code: Rc<CodeUnit>, cells: &[u16]) {
    for &cell in cells {
        b.emit_u16(Opcode::LoadClosure, cell);
    }
    b.emit_u16(Opcode::BuildTuple, u16::try_from(cells.len()).unwrap());
    let index = b.add_const(Value::Code(code));
    b.emit_u16_u8(Opcode::MakeFunction, index, MAKE_FUNCTION_CLOSURE);
}

#[test]
fn closure_sees_later_writes_of_the_enclosing_frame() {
    let mut b = CodeBuilder::new("outer");
    let x = b.add_cell_var("x");
    let f = b.add_local("f");
    b.emit_load_int(1);
    b.emit_u16(Opcode::StoreDeref, x);
    emit_closure(&mut b, reader(), &[x]);
    b.emit_store_local(f);
    b.emit_load_int(2);
    b.emit_u16(Opcode::StoreDeref, x);
    b.emit_load_local(f);
    b.emit(Opcode::CallFunction0);
    b.emit(Opcode::ReturnValue);

    let mut engine = Engine::new(EngineConfig::default());
    let result = engine.invoke(&Rc::new(b.build().unwrap()), vec![], vec![]).unwrap();
    assert_eq!(result, Value::Int(2));
}

#[test]
fn enclosing_frame_sees_writes_of_the_closure() {
    let mut inner = CodeBuilder::new("inner");
    let free = inner.add_free_var("x");
    inner.emit_load_int(10);
    inner.emit_u16(Opcode::StoreDeref, free);
    inner.emit_return_none();
    let inner = Rc::new(inner.build().unwrap());

    let mut b = CodeBuilder::new("outer");
    let x = b.add_cell_var("x");
    b.emit_load_int(1);
    b.emit_u16(Opcode::StoreDeref, x);
    emit_closure(&mut b, inner, &[x]);
    b.emit(Opcode::CallFunction0);
    b.emit(Opcode::Pop);
    b.emit_u16(Opcode::LoadDeref, x);
    b.emit(Opcode::ReturnValue);

    let mut engine = Engine::new(EngineConfig::default());
    let result = engine.invoke(&Rc::new(b.build().unwrap()), vec![], vec![]).unwrap();
    assert_eq!(result, Value::Int(10));
}

#[test]
fn captured_parameter_initializes_its_cell() {
    let mut b = CodeBuilder::new("outer");
    b.add_param("x");
    let x = b.add_cell_var("x");
    emit_closure(&mut b, reader(), &[x]);
    b.emit(Opcode::CallFunction0);
    b.emit(Opcode::ReturnValue);

    let mut engine = Engine::new(EngineConfig::default());
    let result = engine
        .invoke(&Rc::new(b.build().unwrap()), vec![Value::str("arg")], vec![])
        .unwrap();
    assert_eq!(result, Value::str("arg"));
}

#[test]
fn sibling_closures_share_one_cell() {
    // def make(): n = 0; def inc(): n = n + 1; return n; def get(): return n; return inc, get
    let mut inc = CodeBuilder::new("inc");
    let n = inc.add_free_var("n");
    inc.emit_u16(Opcode::LoadDeref, n);
    inc.emit_load_int(1);
    inc.emit(Opcode::BinaryAdd);
    inc.emit_u16(Opcode::StoreDeref, n);
    inc.emit_u16(Opcode::LoadDeref, n);
    inc.emit(Opcode::ReturnValue);
    let inc = Rc::new(inc.build().unwrap());

    let mut get = CodeBuilder::new("get");
    let n_get = get.add_free_var("n");
    get.emit_u16(Opcode::LoadDeref, n_get);
    get.emit(Opcode::ReturnValue);
    let get = Rc::new(get.build().unwrap());

    let mut b = CodeBuilder::new("make");
    let n = b.add_cell_var("n");
    b.emit_load_int(0);
    b.emit_u16(Opcode::StoreDeref, n);
    emit_closure(&mut b, inc, &[n]);
    emit_closure(&mut b, get, &[n]);
    b.emit_u16(Opcode::BuildTuple, 2);
    b.emit(Opcode::ReturnValue);

    let mut engine = Engine::new(EngineConfig::default());
    let Value::Tuple(pair) = engine.invoke(&Rc::new(b.build().unwrap()), vec![], vec![]).unwrap() else {
        panic!("expected a tuple");
    };
    assert_eq!(engine.call(&pair[0], vec![]).unwrap(), Value::Int(1));
    assert_eq!(engine.call(&pair[0], vec![]).unwrap(), Value::Int(2));
    assert_eq!(engine.call(&pair[1], vec![]).unwrap(), Value::Int(2));
}

#[test]
fn host_supplied_cells_are_shared() {
    let cell = Rc::new(Cell::with_value(Value::Int(7)));
    let mut engine = Engine::new(EngineConfig::default());
    let code = reader();
    assert_eq!(engine.invoke(&code, vec![], vec![Rc::clone(&cell)]).unwrap(), Value::Int(7));
    cell.set(Value::Int(8));
    assert_eq!(engine.invoke(&code, vec![], vec![Rc::clone(&cell)]).unwrap(), Value::Int(8));
    assert!(!cell.is_finalized());
}

#[test]
fn unbound_free_variable_raises_name_error() {
    let mut engine = Engine::new(EngineConfig::default());
    let err = engine
        .invoke(&reader(), vec![], vec![Rc::new(Cell::unbound())])
        .unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::NameError));
    assert_eq!(err.kind(), ErrorKind::UnboundVariable);
    assert!(err.exception().unwrap().message().unwrap().contains("free variable 'x'"));
}

#[test]
fn deleted_cell_is_unbound() {
    let mut b = CodeBuilder::new("outer");
    let x = b.add_cell_var("x");
    b.emit_load_int(1);
    b.emit_u16(Opcode::StoreDeref, x);
    b.emit_u16(Opcode::DeleteDeref, x);
    b.emit_u16(Opcode::LoadDeref, x);
    b.emit(Opcode::ReturnValue);

    let mut engine = Engine::new(EngineConfig::default());
    let err = engine.invoke(&Rc::new(b.build().unwrap()), vec![], vec![]).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::UnboundLocalError));
}

#[test]
fn closure_length_must_match_free_variables() {
    let mut engine = Engine::new(EngineConfig::default());
    let err = engine.invoke(&reader(), vec![], vec![]).unwrap_err();
    assert!(matches!(
        err,
        RunError::Internal(InternalError::ClosureMismatch { expected: 1, got: 0, .. })
    ));
}
