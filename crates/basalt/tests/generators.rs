use std::rc::Rc;

use basalt::{
    CodeBuilder, CodeFlags, Engine, EngineConfig, ErrorKind, ExcType, ExceptionRange, GeneratorRef, GeneratorStep,
    Globals, NativeFunction, Opcode, Value,
};

fn offset(b: &CodeBuilder) -> u32 {
    u32::try_from(b.current_offset()).unwrap()
}

fn start(engine: &mut Engine, b: CodeBuilder, args: Vec<Value>) -> GeneratorRef {
    let code = Rc::new(b.build().unwrap());
    let Value::Generator(generator) = engine.invoke(&code, args, vec![]).unwrap() else {
        panic!("generator code should produce a generator");
    };
    generator
}

/// `x = yield 1; yield x * 2; return x`
fn doubler() -> CodeBuilder {
    let mut b = CodeBuilder::new("doubler");
    b.set_flags(CodeFlags::GENERATOR);
    let x = b.add_local("x");
    b.emit_load_int(1);
    b.emit(Opcode::Yield);
    b.emit_store_local(x);
    b.emit_load_local(x);
    b.emit_load_int(2);
    b.emit(Opcode::BinaryMul);
    b.emit(Opcode::Yield);
    b.emit(Opcode::Pop);
    b.emit_load_local(x);
    b.emit(Opcode::ReturnValue);
    b
}

/// `try: yield 1 except BaseException: <on_catch>`
fn guarded_yield(flags: CodeFlags, on_catch: impl FnOnce(&mut CodeBuilder)) -> CodeBuilder {
    let mut b = CodeBuilder::new("guarded");
    b.set_flags(flags);
    let start = offset(&b);
    b.emit_load_int(1);
    b.emit(Opcode::Yield);
    b.emit(Opcode::Pop);
    let end = offset(&b);
    b.emit_return_none();
    let handler = offset(&b);
    b.set_stack_depth(1);
    b.emit(Opcode::Pop);
    b.emit(Opcode::PopExcept);
    on_catch(&mut b);
    b.add_exception_entry(ExceptionRange::new(start, end, handler, 0));
    b
}

#[test]
fn sent_values_flow_back_into_the_body() {
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, doubler(), vec![]);
    assert!(!generator.borrow().is_started());

    assert_eq!(engine.generator_send(&generator, Value::None).unwrap(), Value::Int(1));
    assert_eq!(engine.generator_send(&generator, Value::Int(21)).unwrap(), Value::Int(42));
    let err = engine.generator_send(&generator, Value::None).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::StopIteration));
    assert_eq!(err.exception().unwrap().payload(), Value::Int(21));
}

#[test]
fn resume_reports_return_as_a_step() {
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, doubler(), vec![]);
    assert_eq!(
        engine.generator_resume(&generator, Value::None).unwrap(),
        GeneratorStep::Yielded(Value::Int(1))
    );
    assert_eq!(
        engine.generator_resume(&generator, Value::Int(5)).unwrap(),
        GeneratorStep::Yielded(Value::Int(10))
    );
    assert_eq!(
        engine.generator_resume(&generator, Value::None).unwrap(),
        GeneratorStep::Returned(Value::Int(5))
    );
    assert!(generator.borrow().is_finished());
    let err = engine.generator_resume(&generator, Value::None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IterationExhausted);
}

#[test]
fn just_started_generator_rejects_non_none() {
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, doubler(), vec![]);
    let err = engine.generator_send(&generator, Value::Int(1)).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::TypeError));
    assert!(!generator.borrow().is_started());
    assert_eq!(engine.generator_send(&generator, Value::None).unwrap(), Value::Int(1));
}

#[test]
fn arguments_are_bound_at_creation() {
    let mut b = CodeBuilder::new("count_up");
    b.set_flags(CodeFlags::GENERATOR);
    let n = b.add_param("n");
    b.emit_load_local(n);
    b.emit(Opcode::Yield);
    b.emit(Opcode::Pop);
    b.emit_load_local(n);
    b.emit_load_int(1);
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::Yield);
    b.emit(Opcode::Pop);
    b.emit_return_none();

    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, b, vec![Value::Int(41)]);
    let items = engine.iterate(&Value::Generator(generator)).unwrap();
    assert_eq!(items, [Value::Int(41), Value::Int(42)]);
}

#[test]
fn resuming_a_running_generator_fails() {
    let globals = Rc::new(Globals::new());
    globals.set(
        "resume",
        Value::Native(Rc::new(NativeFunction::new("resume", |engine, args| {
            let Some(Value::Generator(generator)) = args.first() else {
                panic!("expected a generator");
            };
            engine.generator_send(generator, Value::None)
        }))),
    );

    let mut b = CodeBuilder::new("reentrant");
    b.set_flags(CodeFlags::GENERATOR);
    let resume = b.add_name("resume");
    let me = b.add_name("me");
    b.emit_u16(Opcode::LoadGlobal, resume);
    b.emit_u16(Opcode::LoadGlobal, me);
    b.emit(Opcode::CallFunction1);
    b.emit(Opcode::Yield);
    b.emit(Opcode::Pop);
    b.emit_return_none();
    let code = Rc::new(b.build().unwrap());

    let mut engine = Engine::new(EngineConfig::default());
    let value = engine.invoke_with_globals(&code, Rc::clone(&globals), vec![], vec![]).unwrap();
    globals.set("me", value.clone());
    let Value::Generator(generator) = value else {
        panic!("generator code should produce a generator");
    };

    let err = engine.generator_send(&generator, Value::None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReentrancyViolation);
    assert_eq!(err.exc_type(), Some(ExcType::ValueError));
    assert_eq!(err.exception().unwrap().message(), Some("generator already executing"));
    assert!(!generator.borrow().is_running());
    assert!(generator.borrow().is_finished());
}

#[test]
fn throw_before_start_finishes_the_generator() {
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, doubler(), vec![]);
    let err = engine
        .generator_throw(&generator, Value::ExcType(ExcType::ValueError))
        .unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::ValueError));
    assert!(generator.borrow().is_finished());

    let err = engine.generator_send(&generator, Value::None).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::StopIteration));
}

#[test]
fn thrown_exception_reaches_handler_at_yield() {
    let b = guarded_yield(CodeFlags::GENERATOR, |b| {
        b.emit_load_int(99);
        b.emit(Opcode::Yield);
        b.emit(Opcode::Pop);
        b.emit_return_none();
    });
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, b, vec![]);
    assert_eq!(engine.generator_send(&generator, Value::None).unwrap(), Value::Int(1));
    let thrown = engine
        .generator_throw(&generator, Value::ExcType(ExcType::KeyError))
        .unwrap();
    assert_eq!(thrown, Value::Int(99));
}

#[test]
fn throw_into_finished_generator_reraises() {
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, doubler(), vec![]);
    engine.generator_close(&generator).unwrap();
    let err = engine
        .generator_throw(&generator, Value::ExcType(ExcType::KeyError))
        .unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::KeyError));
    let traceback = err.exception().unwrap().traceback();
    assert_eq!(traceback.len(), 1);
    assert_eq!(&*traceback[0].code_name, "doubler");
    assert_eq!(traceback[0].offset, 0);
}

#[test]
fn close_unwinds_a_suspended_generator() {
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, doubler(), vec![]);
    engine.generator_send(&generator, Value::None).unwrap();
    engine.generator_close(&generator).unwrap();
    assert!(generator.borrow().is_finished());
    // closing twice is a no-op
    engine.generator_close(&generator).unwrap();
}

#[test]
fn close_accepts_a_return_from_the_handler() {
    let b = guarded_yield(CodeFlags::GENERATOR, |b| {
        b.emit_load_str("cleaned up");
        b.emit(Opcode::ReturnValue);
    });
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, b, vec![]);
    engine.generator_send(&generator, Value::None).unwrap();
    engine.generator_close(&generator).unwrap();
    assert!(generator.borrow().is_finished());
}

#[test]
fn yielding_after_close_is_a_protocol_violation() {
    let b = guarded_yield(CodeFlags::GENERATOR, |b| {
        b.emit_load_int(2);
        b.emit(Opcode::Yield);
        b.emit(Opcode::Pop);
        b.emit_return_none();
    });
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, b, vec![]);
    engine.generator_send(&generator, Value::None).unwrap();
    let err = engine.generator_close(&generator).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(err.exc_type(), Some(ExcType::RuntimeError));
    assert_eq!(err.exception().unwrap().message(), Some("generator ignored GeneratorExit"));

    // a failed close still finishes the generator
    assert!(generator.borrow().is_finished());
    let err = engine.generator_send(&generator, Value::None).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::StopIteration));
}

#[test]
fn stop_iteration_escaping_the_body_becomes_runtime_error() {
    let mut b = CodeBuilder::new("leaky");
    b.set_flags(CodeFlags::GENERATOR);
    b.emit_load_const(Value::ExcType(ExcType::StopIteration));
    b.emit(Opcode::Raise);

    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, b, vec![]);
    let err = engine.generator_send(&generator, Value::None).unwrap_err();
    let exc = err.exception().unwrap();
    assert_eq!(exc.exc_type(), ExcType::RuntimeError);
    assert_eq!(exc.message(), Some("generator raised StopIteration"));
    assert_eq!(exc.cause().unwrap().exc_type(), ExcType::StopIteration);
    assert_eq!(err.kind(), ErrorKind::UnhandledOperationFailure);
    assert!(generator.borrow().is_finished());
}

#[test]
fn async_generator_signals_stop_async_iteration() {
    let mut b = CodeBuilder::new("agen");
    b.set_flags(CodeFlags::ASYNC_GENERATOR);
    b.emit_load_int(1);
    b.emit(Opcode::Yield);
    b.emit(Opcode::Pop);
    b.emit_return_none();

    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, b, vec![]);
    assert_eq!(engine.generator_send(&generator, Value::None).unwrap(), Value::Int(1));
    let err = engine.generator_send(&generator, Value::None).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::StopAsyncIteration));
    assert_eq!(err.kind(), ErrorKind::IterationExhausted);
    let again = engine.generator_send(&generator, Value::None).unwrap_err();
    assert_eq!(again.exc_type(), Some(ExcType::StopAsyncIteration));
}

#[test]
fn async_generator_wraps_escaping_stop_async_iteration() {
    let mut b = CodeBuilder::new("agen");
    b.set_flags(CodeFlags::ASYNC_GENERATOR);
    b.emit_load_const(Value::ExcType(ExcType::StopAsyncIteration));
    b.emit(Opcode::Raise);

    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, b, vec![]);
    let err = engine.generator_send(&generator, Value::None).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::RuntimeError));
    assert_eq!(
        err.exception().unwrap().message(),
        Some("async generator raised StopAsyncIteration")
    );
}

#[test]
fn async_generators_are_not_iterable() {
    let mut b = CodeBuilder::new("agen");
    b.set_flags(CodeFlags::ASYNC_GENERATOR);
    b.emit_return_none();
    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, b, vec![]);
    let err = engine.iterate(&Value::Generator(generator)).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::TypeError));
}

#[test]
fn coroutine_cannot_be_reused() {
    let mut b = CodeBuilder::new("coro");
    b.set_flags(CodeFlags::COROUTINE);
    b.emit_load_int(5);
    b.emit(Opcode::ReturnValue);

    let mut engine = Engine::new(EngineConfig::default());
    let coroutine = start(&mut engine, b, vec![]);
    assert_eq!(
        engine.generator_resume(&coroutine, Value::None).unwrap(),
        GeneratorStep::Returned(Value::Int(5))
    );
    let err = engine.generator_resume(&coroutine, Value::None).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::RuntimeError));
    assert_eq!(
        err.exception().unwrap().message(),
        Some("cannot reuse already awaited coroutine")
    );
}

#[test]
fn generator_methods_are_callable_from_bytecode() {
    // delegate: `inner.send(None)` twice through `CallMethod`
    let mut b = CodeBuilder::new("delegate");
    let inner = b.add_param("inner");
    let send = b.add_name("send");
    b.emit_load_local(inner);
    b.emit(Opcode::LoadNone);
    b.emit_u16_u8(Opcode::CallMethod, send, 1);
    b.emit_load_local(inner);
    b.emit_load_int(4);
    b.emit_u16_u8(Opcode::CallMethod, send, 1);
    b.emit(Opcode::BinaryAdd);
    b.emit(Opcode::ReturnValue);
    let code = Rc::new(b.build().unwrap());

    let mut engine = Engine::new(EngineConfig::default());
    let generator = start(&mut engine, doubler(), vec![]);
    let result = engine.invoke(&code, vec![Value::Generator(generator)], vec![]).unwrap();
    assert_eq!(result, Value::Int(9));
}
