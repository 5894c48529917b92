// Bytecode shape tests.
//
// Compiles real programs and walks the emitted chunks with an abstract
// stack-height interpreter: heights must never go negative, every RETURN
// must have a result on the stack, and control-flow joins must agree on
// the height. Nested functions in the constant pool are checked too.

use std::collections::HashMap;

use lox::bytecode::OpCode;
use lox::heap::Heap;
use lox::object::ObjRef;
use lox::value::Value;
use lox::vm::Vm;

fn compile(vm: &mut Vm, source: &str) -> ObjRef {
    match vm.produce_function(source) {
        Value::Obj(function) => function,
        _ => panic!("program failed to compile:\n{}", source),
    }
}

// Walks one chunk; recurses into function constants.
fn check_function(heap: &Heap, function: ObjRef) {
    let chunk = &heap.arena.function(function).chunk;
    let code = &chunk.code;

    let mut heights: HashMap<usize, i64> = HashMap::new();
    let mut worklist: Vec<(usize, i64)> = vec![(0, 0)];

    while let Some((offset, height)) = worklist.pop() {
        if offset >= code.len() {
            continue;
        }
        if let Some(&seen) = heights.get(&offset) {
            assert_eq!(
                seen, height,
                "join at offset {} disagrees on stack height ({} vs {})",
                offset, seen, height
            );
            continue;
        }
        heights.insert(offset, height);
        assert!(height >= 0, "negative stack height at offset {}", offset);

        let op = OpCode::try_from(code[offset]).expect("undecodable opcode in compiled chunk");
        match op {
            OpCode::GetConstant | OpCode::Nil | OpCode::True | OpCode::False => {
                let size = if op == OpCode::GetConstant { 2 } else { 1 };
                worklist.push((offset + size, height + 1));
            }
            OpCode::Pop => worklist.push((offset + 1, height - 1)),
            OpCode::PopMany => {
                let count = code[offset + 1] as i64;
                worklist.push((offset + 2, height - count));
            }
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Exponent
            | OpCode::Equal
            | OpCode::Greater
            | OpCode::Less => worklist.push((offset + 1, height - 1)),
            OpCode::Negate | OpCode::Not => worklist.push((offset + 1, height)),
            OpCode::Print => worklist.push((offset + 1, height - 1)),
            OpCode::AccessIndex => worklist.push((offset + 1, height - 1)),
            OpCode::SliceIndex => worklist.push((offset + 1, height - 2)),
            OpCode::GetLength => worklist.push((offset + 2, height + 1)),
            OpCode::GetLocal | OpCode::GetUpvalue => worklist.push((offset + 2, height + 1)),
            OpCode::SetLocal | OpCode::SetUpvalue => worklist.push((offset + 2, height)),
            OpCode::CloseUpvalue => worklist.push((offset + 1, height - 1)),
            OpCode::Jump => {
                let distance = read_u16(code, offset + 1) as usize;
                worklist.push((offset + 3 + distance, height));
            }
            OpCode::Loop => {
                let distance = read_u16(code, offset + 1) as usize;
                worklist.push((offset + 3 - distance, height));
            }
            OpCode::JumpIfFalse => {
                let distance = read_u16(code, offset + 1) as usize;
                worklist.push((offset + 3, height));
                worklist.push((offset + 3 + distance, height));
            }
            OpCode::Call => {
                let argc = code[offset + 1] as i64;
                worklist.push((offset + 2, height - argc));
            }
            OpCode::Closure => {
                let constant = code[offset + 1] as usize;
                let nested = match chunk.constant(constant) {
                    Value::Obj(r) => r,
                    other => panic!("closure over non-object constant {:?}", other),
                };
                let upvalue_count = heap.arena.function(nested).upvalue_count;
                worklist.push((offset + 2 + 2 * upvalue_count, height + 1));
            }
            OpCode::Return => {
                assert!(height >= 1, "RETURN with no result at offset {}", offset);
            }
            OpCode::Class => worklist.push((offset + 2, height + 1)),
            OpCode::Method => worklist.push((offset + 2, height - 1)),
            OpCode::Inherit => worklist.push((offset + 1, height - 1)),
            OpCode::GetProperty => worklist.push((offset + 2, height)),
            OpCode::SetProperty => worklist.push((offset + 2, height - 1)),
            OpCode::GetSuper => worklist.push((offset + 2, height - 1)),
            OpCode::Invoke => {
                let argc = code[offset + 2] as i64;
                worklist.push((offset + 3, height - argc));
            }
            OpCode::SuperInvoke => {
                let argc = code[offset + 2] as i64;
                worklist.push((offset + 3, height - argc - 1));
            }
            OpCode::DebugBreakPoint => worklist.push((offset + 1, height)),
            OpCode::ExitVm => {}
            OpCode::LoadInlineConstant | OpCode::Invalid => {
                panic!("compiler should never emit {:?}", op);
            }
        }
    }

    for constant in chunk.constants() {
        if let Value::Obj(r) = constant {
            if matches!(heap.arena.get(*r), lox::object::Obj::Function(_)) {
                check_function(heap, *r);
            }
        }
    }
}

fn assert_balanced(source: &str) {
    let mut vm = Vm::new();
    let function = compile(&mut vm, source);
    check_function(&vm.heap, function);
}

fn read_u16(code: &[u8], offset: usize) -> u16 {
    ((code[offset] as u16) << 8) | code[offset + 1] as u16
}

#[test]
fn expressions_are_stack_balanced() {
    assert_balanced("print 1 + 2 * 3;");
    assert_balanced("print 1 < 2 ? \"a\" : \"b\";");
    assert_balanced("print (1 and 2) or 3;");
    assert_balanced("print \"hello\"[1:4]; print \"hello\"[2]; print \"hello\"[:2];");
    assert_balanced("var a = 1; var b = 2; print a ** b == 1;");
}

#[test]
fn statements_are_stack_balanced() {
    assert_balanced("var x = 1; x = x + 1; print x;");
    assert_balanced("if (1 < 2) print \"a\"; else print \"b\";");
    assert_balanced("while (false) { print 1; }");
    assert_balanced("for (var i = 0; i < 3; i = i + 1) print i;");
    assert_balanced(
        "for (var i = 0; i < 5; i = i + 1) { if (i == 1) continue; if (i == 3) break; print i; }",
    );
    assert_balanced("{ var a = 1; var b = 2; var c = 3; print a + b + c; }");
}

#[test]
fn functions_are_stack_balanced() {
    assert_balanced("fun add(a, b) { return a + b; } print add(1, 2);");
    assert_balanced(
        "fun makeCounter() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }\n\
         var f = makeCounter(); print f();",
    );
    assert_balanced("var twice = fun (x) { return x * 2; }; print twice(2);");
}

#[test]
fn classes_are_stack_balanced() {
    assert_balanced(
        "class A { init(x) { this.x = x; } who() { print \"A\"; } }\n\
         class B < A { who() { super.who(); print \"B\"; } }\n\
         B(7).who(); print B(7).x;",
    );
    assert_balanced(
        "class Greeter { init(name) { this.name = name; } greet() { return this.name; } }\n\
         var m = Greeter(\"x\").greet; print m();",
    );
}

#[test]
fn disassembly_is_side_effect_free() {
    // Walking the whole chunk through the disassembler must not disturb
    // the program: running it afterwards produces the normal output.
    let source = "fun makeCounter() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }\n\
                  var f = makeCounter(); print f(); print f();";

    let mut vm = Vm::new();
    let function = compile(&mut vm, source);
    {
        let chunk = &vm.heap.arena.function(function).chunk;
        let mut disassembler = lox::debug::Disassembler::new(&vm.heap, chunk);
        let mut offset = 0;
        while offset < chunk.code.len() {
            let next = disassembler.instruction(offset);
            assert!(next > offset, "disassembler must make progress");
            offset = next;
        }
    }

    vm.capture_output();
    let result = vm.interpret(source);
    assert_eq!(result, lox::vm::InterpretResult::Ok);
    assert_eq!(vm.take_output(), "1\n2\n");
}

#[test]
fn set_pop_get_peephole_keeps_balance() {
    // x = expr; print x; is the pattern the peephole rewrites.
    assert_balanced("var x = 0; x = 5; print x;");
    assert_balanced("var x = 0; var y = 0; x = 1; y = x; print x + y;");
}
