use std::rc::Rc;

use basalt::{
    CodeBuilder, CodeUnit, DefaultRuntime, Engine, EngineConfig, ExcType, Function, Globals, MAKE_FUNCTION_DEFAULTS,
    NativeFunction, Opcode, Value,
};
use num_bigint::BigInt;

/// `def collect(p0, ..., pN): return [p0, ..., pN]`
fn collect(arity: u16) -> Rc<CodeUnit> {
    let mut b = CodeBuilder::new("collect");
    for i in 0..arity {
        b.add_param(&format!("p{i}"));
    }
    for i in 0..arity {
        b.emit_load_local(i);
    }
    b.emit_u16(Opcode::BuildList, arity);
    b.emit(Opcode::ReturnValue);
    Rc::new(b.build().unwrap())
}

fn function(code: Rc<CodeUnit>) -> Value {
    Value::Function(Rc::new(Function::new(code, Rc::new(Globals::new()), vec![], vec![]).unwrap()))
}

/// `def caller(f): return f(1, ..., arity)` using the dedicated call opcode.
fn caller(arity: u8) -> Rc<CodeUnit> {
    let mut b = CodeBuilder::new("caller");
    let f = b.add_param("f");
    b.emit_load_local(f);
    for i in 1..=arity {
        b.emit_load_int(i64::from(i));
    }
    match arity {
        0 => b.emit(Opcode::CallFunction0),
        1 => b.emit(Opcode::CallFunction1),
        2 => b.emit(Opcode::CallFunction2),
        3 => b.emit(Opcode::CallFunction3),
        4 => b.emit(Opcode::CallFunction4),
        n => b.emit_u8(Opcode::CallFunction, n),
    }
    b.emit(Opcode::ReturnValue);
    Rc::new(b.build().unwrap())
}

fn ints(values: impl IntoIterator<Item = i64>) -> Value {
    Value::list(values.into_iter().map(Value::Int).collect())
}

#[test]
fn every_fixed_arity_passes_arguments_in_order() {
    let mut engine = Engine::new(EngineConfig::default());
    for arity in 0..=6u8 {
        let target = function(collect(u16::from(arity)));
        let result = engine.invoke(&caller(arity), vec![target], vec![]).unwrap();
        assert_eq!(result, ints(1..=i64::from(arity)), "arity {arity}");
    }
}

#[test]
fn wrong_argument_count_is_a_type_error() {
    let mut engine = Engine::new(EngineConfig::default());
    let err = engine.invoke(&caller(3), vec![function(collect(2))], vec![]).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::TypeError));
    assert_eq!(
        err.exception().unwrap().message(),
        Some("collect() takes 2 positional arguments but 3 were given")
    );

    let err = engine.invoke(&caller(1), vec![function(collect(3))], vec![]).unwrap_err();
    assert_eq!(
        err.exception().unwrap().message(),
        Some("collect() missing 2 required positional arguments: 'p1' and 'p2'")
    );
}

#[test]
fn varargs_call_spreads_an_iterable() {
    // def f(a, *rest): return (a, rest)
    let mut f = CodeBuilder::new("f");
    let a = f.add_param("a");
    let rest = f.add_varargs("rest");
    f.emit_load_local(a);
    f.emit_load_local(rest);
    f.emit_u16(Opcode::BuildTuple, 2);
    f.emit(Opcode::ReturnValue);
    let f = function(Rc::new(f.build().unwrap()));

    // def caller(f): return f(*[1, 2, 3])
    let mut b = CodeBuilder::new("caller");
    let param = b.add_param("f");
    b.emit_load_local(param);
    b.emit_load_int(1);
    b.emit_load_int(2);
    b.emit_load_int(3);
    b.emit_u16(Opcode::BuildList, 3);
    b.emit(Opcode::CallFunctionVarargs);
    b.emit(Opcode::ReturnValue);

    let mut engine = Engine::new(EngineConfig::default());
    let result = engine.invoke(&Rc::new(b.build().unwrap()), vec![f], vec![]).unwrap();
    let expected = Value::tuple(vec![Value::Int(1), Value::tuple(vec![Value::Int(2), Value::Int(3)])]);
    assert_eq!(result, expected);
}

#[test]
fn defaults_fill_missing_trailing_arguments() {
    // def g(a, b=10): return a + b
    let mut g = CodeBuilder::new("g");
    let a = g.add_param("a");
    let b_param = g.add_param("b");
    g.emit_load_local(a);
    g.emit_load_local(b_param);
    g.emit(Opcode::BinaryAdd);
    g.emit(Opcode::ReturnValue);
    let g = Rc::new(g.build().unwrap());

    let mut b = CodeBuilder::new("caller");
    b.emit_load_int(10);
    b.emit_u16(Opcode::BuildTuple, 1);
    let index = b.add_const(Value::Code(g));
    b.emit_u16_u8(Opcode::MakeFunction, index, MAKE_FUNCTION_DEFAULTS);
    b.emit(Opcode::Dup);
    b.emit_load_int(1);
    b.emit(Opcode::CallFunction1);
    b.emit(Opcode::Rot2);
    b.emit_load_int(1);
    b.emit_load_int(2);
    b.emit(Opcode::CallFunction2);
    b.emit_u16(Opcode::BuildTuple, 2);
    b.emit(Opcode::ReturnValue);

    let mut engine = Engine::new(EngineConfig::default());
    let result = engine.invoke(&Rc::new(b.build().unwrap()), vec![], vec![]).unwrap();
    assert_eq!(result, Value::tuple(vec![Value::Int(11), Value::Int(3)]));
}

/// `def fact(n): return 1 if n < 1 else n * fact(n - 1)`, bound in `globals`.
fn factorial(globals: &Rc<Globals>) -> Value {
    let mut b = CodeBuilder::new("fact");
    let n = b.add_param("n");
    let fact = b.add_name("fact");
    b.emit_load_local(n);
    b.emit_load_int(1);
    b.emit(Opcode::CompareLt);
    let recurse = b.emit_jump(Opcode::JumpIfFalse);
    b.emit_load_int(1);
    b.emit(Opcode::ReturnValue);
    b.patch_jump(recurse);
    b.emit_load_local(n);
    b.emit_u16(Opcode::LoadGlobal, fact);
    b.emit_load_local(n);
    b.emit_load_int(1);
    b.emit(Opcode::BinarySub);
    b.emit(Opcode::CallFunction1);
    b.emit(Opcode::BinaryMul);
    b.emit(Opcode::ReturnValue);
    let code = Rc::new(b.build().unwrap());
    let function = Value::Function(Rc::new(Function::new(code, Rc::clone(globals), vec![], vec![]).unwrap()));
    globals.set("fact", function.clone());
    function
}

#[test]
fn recursion_promotes_to_big_integers() {
    let globals = Rc::new(Globals::new());
    let fact = factorial(&globals);
    let mut engine = Engine::new(EngineConfig::default());
    assert_eq!(
        engine.call(&fact, vec![Value::Int(20)]).unwrap(),
        Value::Int(2_432_902_008_176_640_000)
    );
    let expected: BigInt = "15511210043330985984000000".parse().unwrap();
    assert_eq!(engine.call(&fact, vec![Value::Int(25)]).unwrap(), Value::from_bigint(expected));
}

#[test]
fn recursion_limit_raises_recursion_error() {
    let globals = Rc::new(Globals::new());
    let fact = factorial(&globals);
    let mut engine = Engine::new(EngineConfig::default().max_recursion_depth(30));
    let err = engine.call(&fact, vec![Value::Int(100)]).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::RecursionError));
    // depth accounting unwinds with the error
    assert_eq!(engine.call(&fact, vec![Value::Int(5)]).unwrap(), Value::Int(120));
}

#[test]
fn natives_and_builtins_are_callable() {
    let mut runtime = DefaultRuntime::new();
    runtime.add_builtin(
        "twice",
        Value::Native(Rc::new(NativeFunction::new("twice", |engine, args| {
            let Some(f) = args.first() else {
                return Ok(Value::None);
            };
            let first = engine.call(f, vec![])?;
            let second = engine.call(f, vec![])?;
            Ok(Value::tuple(vec![first, second]))
        }))),
    );

    // def f(): return len("abc")
    let mut f = CodeBuilder::new("f");
    let len = f.add_name("len");
    f.emit_u16(Opcode::LoadGlobal, len);
    f.emit_load_str("abc");
    f.emit(Opcode::CallFunction1);
    f.emit(Opcode::ReturnValue);
    let f = Rc::new(f.build().unwrap());

    let mut b = CodeBuilder::new("main");
    let twice = b.add_name("twice");
    b.emit_u16(Opcode::LoadGlobal, twice);
    let index = b.add_const(Value::Code(f));
    b.emit_u16_u8(Opcode::MakeFunction, index, 0);
    b.emit(Opcode::CallFunction1);
    b.emit(Opcode::ReturnValue);

    let mut engine = Engine::with_runtime(EngineConfig::default(), runtime);
    let result = engine.invoke(&Rc::new(b.build().unwrap()), vec![], vec![]).unwrap();
    assert_eq!(result, Value::tuple(vec![Value::Int(3), Value::Int(3)]));
}

#[test]
fn missing_global_is_name_error() {
    let mut b = CodeBuilder::new("f");
    let name = b.add_name("undefined_thing");
    b.emit_u16(Opcode::LoadGlobal, name);
    b.emit(Opcode::ReturnValue);
    let mut engine = Engine::new(EngineConfig::default());
    let err = engine.invoke(&Rc::new(b.build().unwrap()), vec![], vec![]).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::NameError));
    assert_eq!(
        err.exception().unwrap().message(),
        Some("name 'undefined_thing' is not defined")
    );
}

#[test]
fn calling_a_non_callable_is_a_type_error() {
    let mut b = CodeBuilder::new("f");
    b.emit_load_int(1);
    b.emit(Opcode::CallFunction0);
    b.emit(Opcode::ReturnValue);
    let mut engine = Engine::new(EngineConfig::default());
    let err = engine.invoke(&Rc::new(b.build().unwrap()), vec![], vec![]).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::TypeError));
    assert_eq!(err.exception().unwrap().message(), Some("'int' object is not callable"));
}

/// `total = 0; for f in fs: total = total + f(); return total`
fn call_each() -> Rc<CodeUnit> {
    let mut b = CodeBuilder::new("call_each");
    let fs = b.add_param("fs");
    let total = b.add_local("total");
    b.emit_load_int(0);
    b.emit_store_local(total);
    b.emit_load_local(fs);
    b.emit(Opcode::GetIter);
    let header = b.current_offset();
    let exit = b.emit_jump(Opcode::ForIter);
    b.emit(Opcode::CallFunction0);
    b.emit_load_local(total);
    b.emit(Opcode::BinaryAdd);
    b.emit_store_local(total);
    b.emit_jump_back(header);
    b.patch_jump(exit);
    b.set_stack_depth(0);
    b.emit_load_local(total);
    b.emit(Opcode::ReturnValue);
    Rc::new(b.build().unwrap())
}

fn constant(value: i64) -> Value {
    let mut b = CodeBuilder::new("constant");
    b.emit_load_int(value);
    b.emit(Opcode::ReturnValue);
    function(Rc::new(b.build().unwrap()))
}

#[test]
fn monomorphic_call_site_hits_its_cache() {
    let one = constant(1);
    let fs = Value::list(vec![one; 10]);
    let mut engine = Engine::new(EngineConfig::default().osr_threshold(None));
    assert_eq!(engine.invoke(&call_each(), vec![fs], vec![]).unwrap(), Value::Int(10));
    let stats = engine.stats();
    assert!(stats.resolved_sites >= 1);
    assert!(stats.cache_hits >= 9);
    assert_eq!(stats.cache_misses, 0);
}

#[test]
fn polymorphic_call_site_stays_correct() {
    let (one, two) = (constant(1), constant(2));
    let fs = Value::list((0..20).map(|i| if i % 2 == 0 { one.clone() } else { two.clone() }).collect());
    let mut engine = Engine::new(EngineConfig::default().osr_threshold(None));
    assert_eq!(engine.invoke(&call_each(), vec![fs], vec![]).unwrap(), Value::Int(30));
    assert!(engine.stats().cache_misses > 0);
}

#[test]
fn disabling_specialization_keeps_results_and_skips_caches() {
    let one = constant(1);
    let fs = Value::list(vec![one; 10]);
    let mut engine = Engine::new(EngineConfig::default().specialize(false).osr_threshold(None));
    assert_eq!(engine.invoke(&call_each(), vec![fs], vec![]).unwrap(), Value::Int(10));
    assert_eq!(engine.stats(), basalt::EngineStats::default());
}
