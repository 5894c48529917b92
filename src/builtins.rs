// File: src/builtins.rs
//
// Built-in native functions for Lox.
// Natives are plain Rust functions bound to interned names; `import`
// resolves them at compile time and embeds the native value as a chunk
// constant. Arity is checked by the VM before the call.

use chrono::Utc;
use std::io::BufRead;

use crate::value::Value;
use crate::vm::Vm;

/// Seconds of VM uptime; the cheap monotonic counterpart to `time`.
pub fn clock(vm: &mut Vm, _args: usize) -> Result<Value, String> {
    Ok(Value::Number(vm.uptime_seconds()))
}

/// Seconds since the Unix epoch, fractional.
pub fn time(_vm: &mut Vm, _args: usize) -> Result<Value, String> {
    let millis = Utc::now().timestamp_millis();
    Ok(Value::Number(millis as f64 / 1000.0))
}

/// Reads one line from standard input, without the trailing newline.
pub fn input(vm: &mut Vm, _args: usize) -> Result<Value, String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| format!("Could not read from stdin: {}.", e))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    let string = vm.heap.take_string(line);
    Ok(Value::Obj(string))
}

/// Compiles a source string and returns the resulting function value,
/// or nil when it does not compile.
pub fn eval(vm: &mut Vm, args: usize) -> Result<Value, String> {
    let source = match vm.heap.stack[args] {
        Value::Obj(r) if matches!(vm.heap.arena.get(r), crate::object::Obj::String(_)) => {
            vm.heap.string_chars(r).to_string()
        }
        _ => return Err("Argument to eval() must be a string.".to_string()),
    };
    Ok(vm.produce_function(&source))
}
