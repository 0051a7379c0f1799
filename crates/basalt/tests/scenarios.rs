use std::rc::Rc;

use basalt::{CodeBuilder, CodeFlags, Engine, EngineConfig, ErrorKind, ExcType, GeneratorRef, Opcode, Value};

fn generator_of(engine: &mut Engine, builder: CodeBuilder) -> GeneratorRef {
    let code = Rc::new(builder.build().unwrap());
    let Value::Generator(generator) = engine.invoke(&code, vec![], vec![]).unwrap() else {
        panic!("generator code should produce a generator");
    };
    generator
}

#[test]
fn constant_addition_returns_sum() {
    let mut b = CodeBuilder::new("f");
    b.emit_load_const(Value::Int(1));
    b.emit_load_const(Value::Int(2));
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::ReturnValue);
    let code = Rc::new(b.build().unwrap());

    let mut engine = Engine::new(EngineConfig::default());
    assert_eq!(engine.invoke(&code, vec![], vec![]).unwrap(), Value::Int(3));
}

#[test]
fn two_yield_generator_then_exhaustion() {
    let mut b = CodeBuilder::new("g");
    b.set_flags(CodeFlags::GENERATOR);
    b.emit_load_const(Value::str("a"));
    b.emit(Opcode::Yield);
    b.emit(Opcode::Pop);
    b.emit_load_const(Value::str("b"));
    b.emit(Opcode::Yield);
    b.emit(Opcode::Pop);
    b.emit_return_none();

    let mut engine = Engine::new(EngineConfig::default());
    let generator = generator_of(&mut engine, b);

    assert_eq!(engine.generator_send(&generator, Value::None).unwrap(), Value::str("a"));
    assert_eq!(engine.generator_send(&generator, Value::None).unwrap(), Value::str("b"));

    let err = engine.generator_send(&generator, Value::None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IterationExhausted);
    let exc = err.exception().unwrap();
    assert_eq!(exc.exc_type(), ExcType::StopIteration);
    assert_eq!(exc.payload(), Value::None);
    assert!(generator.borrow().is_finished());

    // further sends keep reporting exhaustion
    let again = engine.generator_send(&generator, Value::None).unwrap_err();
    assert_eq!(again.kind(), ErrorKind::IterationExhausted);
}

#[test]
fn stack_is_balanced_after_return() {
    // `(1, 2)[0] + len([3, 4, 5])` leaves exactly one value for the return
    let mut b = CodeBuilder::new("f");
    let len = b.add_name("len");
    b.emit_load_int(1);
    b.emit_load_int(2);
    b.emit_u16(Opcode::BuildTuple, 2);
    b.emit_load_int(0);
    b.emit(Opcode::BinarySubscr);
    b.emit_u16(Opcode::LoadGlobal, len);
    b.emit_load_int(3);
    b.emit_load_int(4);
    b.emit_load_int(5);
    b.emit_u16(Opcode::BuildList, 3);
    b.emit(Opcode::CallFunction1);
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::ReturnValue);
    let code = Rc::new(b.build().unwrap());
    assert_eq!(code.stack_size(), 5);

    let mut engine = Engine::new(EngineConfig::default());
    assert_eq!(engine.invoke(&code, vec![], vec![]).unwrap(), Value::Int(4));
}

#[test]
fn stack_overflow_is_fatal() {
    use basalt::{CodeParts, CodeUnit, InternalError, RunError};

    // a hand-assembled unit that declares less stack than it uses
    let code = CodeUnit::from_parts(CodeParts {
        name: "tight".to_owned(),
        bytecode: vec![
            Opcode::LoadNone as u8,
            Opcode::LoadNone as u8,
            Opcode::Pop as u8,
            Opcode::ReturnValue as u8,
        ],
        stack_size: 1,
        ..CodeParts::default()
    })
    .unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    let err = engine.invoke(&Rc::new(code), vec![], vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StackUsageViolation);
    assert!(matches!(err, RunError::Internal(InternalError::StackOverflow { .. })));
}
