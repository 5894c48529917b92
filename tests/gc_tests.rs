// Garbage collector tests.
//
// Stress mode collects at every allocation point, which is the oracle
// for "a collection is safe anywhere": any program must produce the same
// output with and without it. The other tests pin down the weak-key
// behavior of the intern set and that live data survives collections.

use lox::value::Value;
use lox::vm::{InterpretResult, Vm};

fn run_with_stress(source: &str, stress: bool) -> (InterpretResult, String) {
    let mut vm = Vm::new();
    vm.heap.set_stress(stress);
    vm.capture_output();
    let result = vm.interpret(source);
    (result, vm.take_output())
}

fn assert_stress_equivalent(source: &str) {
    let (plain_result, plain_output) = run_with_stress(source, false);
    let (stress_result, stress_output) = run_with_stress(source, true);
    assert_eq!(plain_result, stress_result, "stress mode changed the result of:\n{}", source);
    assert_eq!(plain_output, stress_output, "stress mode changed the output of:\n{}", source);
    assert_eq!(plain_result, InterpretResult::Ok);
}

#[test]
fn stress_mode_matches_plain_runs() {
    assert_stress_equivalent("print 1 + 2 * 3;");
    assert_stress_equivalent("print \"he\" + \"llo\";\nprint \"hello\"[1:4];");
    assert_stress_equivalent("for (var i = 0; i < 3; i = i + 1) print i;");
    assert_stress_equivalent(
        "fun makeCounter() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }\n\
         var f = makeCounter(); print f(); print f(); print f();",
    );
    assert_stress_equivalent(
        "class A { init(x) { this.x = x; } who() { print \"A\"; } }\n\
         class B < A { who() { super.who(); print \"B\"; } }\n\
         B(7).who(); print B(7).x;",
    );
}

#[test]
fn stress_mode_survives_string_churn() {
    // Builds and drops lots of intermediate strings; every concatenation
    // is an allocation point.
    assert_stress_equivalent(
        "var s = \"\";\n\
         for (var i = 0; i < 20; i = i + 1) { s = s + \"x\"; }\n\
         print s == \"xxxxxxxxxxxxxxxxxxxx\";",
    );
}

#[test]
fn garbage_is_reclaimed_between_statements() {
    let mut vm = Vm::new();
    vm.capture_output();
    let result = vm.interpret(
        "var keep = \"kept string\";\n\
         { var temp = \"doomed\" + \" string\"; print temp; }\n\
         print keep;",
    );
    assert_eq!(result, InterpretResult::Ok);

    let before = vm.heap.arena.object_count();
    vm.heap.collect_garbage();
    let after = vm.heap.arena.object_count();
    assert!(after <= before);

    // Nothing is rooted after the script returned except the native
    // registry and the init string; the doomed concatenation is gone.
    let hash = vm.heap.hash_str("doomed string");
    assert!(vm.heap.strings.find_string(&vm.heap.arena, "doomed string", hash).is_none());
}

#[test]
fn interned_strings_live_while_referenced() {
    let mut vm = Vm::new();
    let kept = vm.heap.copy_string("precious");
    vm.heap.stack.push(Value::Obj(kept));

    vm.heap.collect_garbage();

    let hash = vm.heap.hash_str("precious");
    assert_eq!(
        vm.heap.strings.find_string(&vm.heap.arena, "precious", hash),
        Some(kept)
    );
    assert_eq!(vm.heap.string_chars(kept), "precious");
}

#[test]
fn natives_survive_collection() {
    let mut vm = Vm::new();
    vm.heap.collect_garbage();
    vm.heap.collect_garbage();

    vm.capture_output();
    let result = vm.interpret("print clock() >= 0;");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(vm.take_output(), "true\n");
}

#[test]
fn collections_do_happen_under_stress() {
    let mut vm = Vm::new();
    vm.heap.set_stress(true);
    vm.capture_output();
    let before = vm.heap.collections();
    let result = vm.interpret("var s = \"a\" + \"b\" + \"c\"; print s;");
    assert_eq!(result, InterpretResult::Ok);
    assert!(vm.heap.collections() > before);
}
