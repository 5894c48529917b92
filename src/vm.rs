// File: src/vm.rs
//
// Virtual Machine for executing Lox bytecode.
// A stack machine: one value stack, a stack of call frames, and a tight
// fetch-decode-execute loop over the current frame's chunk. The heap owns
// the stacks so the collector always sees every root; the loop keeps a
// local copy of the top frame and writes it back before anything that
// needs an accurate instruction pointer (calls, errors, debug dumps).

use std::time::Instant;

use crate::builtins;
use crate::bytecode::{OpCode, INLINE_FUNCTION, INLINE_NUMBER, INLINE_STRING};
use crate::compiler;
use crate::debug;
use crate::errors;
use crate::heap::Heap;
use crate::object::{CallFrame, NativeFn, Obj, ObjRef, UpvalueState};
use crate::value::{is_falsy, values_equal, Value};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
    Exit,
}

// Copied out of the arena before dispatch so the borrow on the callee
// object ends before the call mutates the VM.
enum CallAction {
    Closure,
    Native(NativeFn, u8),
    Class,
    Bound(Value, ObjRef),
}

pub struct Vm {
    pub heap: Heap,
    pub exit_code: i32,
    started: Instant,
    capture: Option<String>,
}

impl Vm {
    pub fn new() -> Vm {
        let mut vm = Vm {
            heap: Heap::new(),
            exit_code: 0,
            started: Instant::now(),
            capture: None,
        };

        let init = vm.heap.copy_string("init");
        vm.heap.init_string = Some(init);

        vm.define_native("clock", builtins::clock, 0);
        vm.define_native("time", builtins::time, 0);
        vm.define_native("input", builtins::input, 0);
        vm.define_native("eval", builtins::eval, 1);

        vm.heap.enabled = true;
        vm
    }

    /// Routes `print` output into a buffer instead of stdout, for tests
    /// and tools that capture program output.
    pub fn capture_output(&mut self) {
        self.capture = Some(String::new());
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.capture {
            Some(buffer) => std::mem::take(buffer),
            None => String::new(),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        if !self.load_from_source(source) {
            return InterpretResult::CompileError;
        }
        self.run()
    }

    /// Compiles the source and sets it up as the current call frame
    /// without running it.
    pub fn load_from_source(&mut self, source: &str) -> bool {
        // A previous run may have ended in an error or an exit; start
        // this one from a clean machine state.
        self.heap.stack.clear();
        self.heap.frames.clear();
        self.heap.open_upvalues.clear();

        let function = match compiler::compile(&mut self.heap, source) {
            Some(function) => function,
            None => return false,
        };

        self.push(Value::Obj(function));
        let closure = self.heap.new_closure(function);
        self.pop();
        self.push(Value::Obj(closure));

        if self.heap.arena.function(function).upvalue_count != 0 {
            errors::report_ice("Script has upvalues.");
        }

        if self.call_closure(closure, 0).is_err() {
            errors::report_ice("Could not enter script frame.");
            return false;
        }
        true
    }

    /// Compiles a source string into a bare function value; nil when it
    /// does not compile. Used by the `eval` native.
    pub fn produce_function(&mut self, source: &str) -> Value {
        match compiler::compile(&mut self.heap, source) {
            Some(function) => Value::Obj(function),
            None => Value::Nil,
        }
    }

    fn define_native(&mut self, name: &str, function: NativeFn, arity: u8) {
        let name_ref = self.heap.copy_string(name);
        self.push(Value::Obj(name_ref));
        let native = self.heap.new_native(function, arity, name_ref);
        self.push(Value::Obj(native));
        let hash = self.heap.str_hash(name_ref);
        self.heap.natives.set(name_ref, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // ---- stack ----------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.heap.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.heap.stack.pop().unwrap_or(Value::Nil)
    }

    fn peek(&self, distance: usize) -> Value {
        self.heap.stack[self.heap.stack.len() - 1 - distance]
    }

    // ---- frame plumbing -------------------------------------------------

    fn current_frame(&self) -> CallFrame {
        self.heap.frames[self.heap.frames.len() - 1]
    }

    fn sync_frame(&mut self, frame: &CallFrame) {
        if let Some(top) = self.heap.frames.last_mut() {
            *top = *frame;
        }
    }

    fn read_byte(&self, frame: &mut CallFrame) -> u8 {
        let closure = self.heap.arena.closure(frame.closure);
        let function = self.heap.arena.function(closure.function);
        let byte = function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&self, frame: &mut CallFrame) -> u16 {
        let high = self.read_byte(frame) as u16;
        let low = self.read_byte(frame) as u16;
        (high << 8) | low
    }

    fn read_constant(&self, frame: &mut CallFrame) -> Value {
        let index = self.read_byte(frame) as usize;
        let closure = self.heap.arena.closure(frame.closure);
        self.heap.arena.function(closure.function).chunk.constant(index)
    }

    fn frame_function(&self, frame: &CallFrame) -> ObjRef {
        self.heap.arena.closure(frame.closure).function
    }

    // ---- error reporting ------------------------------------------------

    fn runtime_error(&mut self, frame: &CallFrame, message: &str) -> InterpretResult {
        self.sync_frame(frame);
        self.runtime_error_synced(message)
    }

    fn runtime_error_synced(&mut self, message: &str) -> InterpretResult {
        errors::report_runtime_error(message);
        self.print_stack_trace();
        InterpretResult::RuntimeError
    }

    fn print_stack_trace(&self) {
        for frame in self.heap.frames.iter().rev() {
            let function = self.heap.arena.function(self.frame_function(frame));
            let line = function.chunk.get_line(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(name) => self.heap.string_chars(name),
                None => "script",
            };
            errors::report_trace_line(line, name);
        }
    }

    // ---- helpers --------------------------------------------------------

    fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Obj(r) if matches!(self.heap.arena.get(r), Obj::String(_)))
    }

    fn as_instance(&self, value: Value) -> Option<ObjRef> {
        match value {
            Value::Obj(r) if matches!(self.heap.arena.get(r), Obj::Instance(_)) => Some(r),
            _ => None,
        }
    }

    fn write_line(&mut self, text: &str) {
        match &mut self.capture {
            Some(buffer) => {
                buffer.push_str(text);
                buffer.push('\n');
            }
            None => println!("{}", text),
        }
    }

    // Both operands stay on the stack until the result string exists, so
    // a collection triggered by the allocation cannot free them.
    fn concatenate(&mut self) {
        let right = self.peek(0).as_obj();
        let left = self.peek(1).as_obj();
        let (left, right) = match (left, right) {
            (Some(l), Some(r)) => (l, r),
            _ => return,
        };
        let mut combined =
            String::with_capacity(self.heap.string_chars(left).len() + self.heap.string_chars(right).len());
        combined.push_str(self.heap.string_chars(left));
        combined.push_str(self.heap.string_chars(right));
        let result = self.heap.take_string(combined);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    fn numeric_binary(
        &mut self,
        frame: &CallFrame,
        apply: fn(f64, f64) -> Value,
    ) -> Option<InterpretResult> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Some(self.runtime_error(frame, "Operands must be numbers."));
        }
        let right = self.pop().as_number();
        let left = self.pop().as_number();
        self.push(apply(left, right));
        None
    }

    fn sequence_length(&self, value: Value) -> Option<usize> {
        value.as_obj().and_then(|r| match self.heap.arena.get(r) {
            Obj::String(s) => Some(s.chars.len()),
            _ => None,
        })
    }

    fn access_sequence_index(&mut self, target: Value, index: i64) -> Result<Value, String> {
        let Some(r) = target.as_obj() else {
            return Err("Unrecognised sequence type".to_string());
        };
        let chars = self.heap.string_chars(r);
        let length = chars.len() as i64;
        let real = if index < 0 { length + index } else { index };
        if real < 0 || real >= length {
            return Err(format!("Index '{}' out of bounds for string '{}'.", index, chars));
        }
        let piece = String::from_utf8_lossy(&chars.as_bytes()[real as usize..real as usize + 1])
            .into_owned();
        let result = self.heap.copy_string(&piece);
        Ok(Value::Obj(result))
    }

    fn access_sequence_slice(
        &mut self,
        target: Value,
        start: i64,
        end: i64,
    ) -> Result<Value, String> {
        let Some(r) = target.as_obj() else {
            return Err("Unrecognised sequence type".to_string());
        };
        let chars = self.heap.string_chars(r);
        let length = chars.len() as i64;
        let real_end = if end < 0 { length + end } else { end };
        let real_start = if start < 0 { length + start } else { start };
        if real_end > length {
            return Err(format!("Index '{}' out of bounds for string '{}'.", end, chars));
        }
        if real_start < 0 || real_start >= length {
            return Err(format!("Index '{}' out of bounds for string '{}'.", start, chars));
        }
        if real_end <= real_start {
            return Err(format!(
                "Invalid sequence slice. Start: '{}' (inclusive), End: '{}' (exclusive).",
                real_start, real_end
            ));
        }
        let piece = String::from_utf8_lossy(
            &chars.as_bytes()[real_start as usize..real_end as usize],
        )
        .into_owned();
        let result = self.heap.take_string(piece);
        Ok(Value::Obj(result))
    }

    // ---- calls ----------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        let Some(r) = callee.as_obj() else {
            return Err("Can only call functions and classes.".to_string());
        };

        let action = match self.heap.arena.get(r) {
            Obj::Closure(_) => CallAction::Closure,
            Obj::Native(native) => CallAction::Native(native.function, native.arity),
            Obj::Class(_) => CallAction::Class,
            Obj::BoundMethod(bound) => CallAction::Bound(bound.receiver, bound.method),
            Obj::Function(_) => {
                return Err("ICE. No direct function call. Must wrap with closure.".to_string());
            }
            _ => return Err("Can only call functions and classes.".to_string()),
        };

        match action {
            CallAction::Closure => self.call_closure(r, argc),
            CallAction::Native(function, arity) => {
                if arity as usize != argc {
                    return Err(format!(
                        "Function call requires {} arguments, cannot pass {}.",
                        arity, argc
                    ));
                }
                let args_base = self.heap.stack.len() - argc;
                let result = function(self, args_base)?;
                let keep = self.heap.stack.len() - argc - 1;
                self.heap.stack.truncate(keep);
                self.push(result);
                Ok(())
            }
            CallAction::Class => {
                // The callee slot becomes the receiver, so init (or the
                // caller) finds the instance in slot 0.
                let instance = self.heap.new_instance(r);
                let slot = self.heap.stack.len() - argc - 1;
                self.heap.stack[slot] = Value::Obj(instance);

                if let Some(init) = self.heap.init_string {
                    let hash = self.heap.str_hash(init);
                    if let Some(initializer) = self.heap.arena.class(r).methods.get(init, hash) {
                        let Some(closure) = initializer.as_obj() else {
                            return Err("ICE. Initializer is not a closure.".to_string());
                        };
                        return self.call_closure(closure, argc);
                    }
                }
                if argc != 0 {
                    return Err(format!("Expected 0 arguments but got {}.", argc));
                }
                Ok(())
            }
            CallAction::Bound(receiver, method) => {
                let slot = self.heap.stack.len() - argc - 1;
                self.heap.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), String> {
        let function = self.heap.arena.closure(closure).function;
        let arity = self.heap.arena.function(function).arity as usize;

        if self.heap.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        if argc != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, argc));
        }

        let base = self.heap.stack.len() - argc - 1;
        self.heap.frames.push(CallFrame { closure, ip: 0, base });
        Ok(())
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: usize) -> Result<(), String> {
        let hash = self.heap.str_hash(name);
        match self.heap.arena.class(class).methods.get(name, hash) {
            Some(method) => {
                let Some(closure) = method.as_obj() else {
                    return Err("ICE. Method is not a closure.".to_string());
                };
                self.call_closure(closure, argc)
            }
            None => Err(format!("Undefined property '{}'.", self.heap.string_chars(name))),
        }
    }

    // ---- upvalues -------------------------------------------------------

    // The open list is sorted by descending stack slot; an existing open
    // upvalue for the slot is reused so every closure sees one shared
    // cell per captured local.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.heap.open_upvalues.len();
        for i in 0..self.heap.open_upvalues.len() {
            let existing = self.heap.open_upvalues[i];
            if let Some(open_slot) = self.heap.arena.upvalue(existing).stack_slot() {
                if open_slot == slot {
                    return existing;
                }
                if open_slot < slot {
                    insert_at = i;
                    break;
                }
            }
        }

        let created = self.heap.new_upvalue(slot);
        self.heap.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes every open upvalue at or above `from`, moving the live
    /// stack value into the upvalue object.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&head) = self.heap.open_upvalues.first() {
            let slot = match self.heap.arena.upvalue(head).stack_slot() {
                Some(slot) => slot,
                None => break,
            };
            if slot < from {
                break;
            }
            let value = self.heap.stack[slot];
            self.heap.arena.upvalue_mut(head).state = UpvalueState::Closed(value);
            self.heap.open_upvalues.remove(0);
        }
    }

    fn load_inline_constant(&mut self, frame: &mut CallFrame) -> Result<(), String> {
        let tag = self.read_byte(frame);
        let function = self.frame_function(frame);
        match tag {
            INLINE_NUMBER => {
                let mut bytes = [0u8; 8];
                for b in bytes.iter_mut() {
                    *b = self.read_byte(frame);
                }
                let value = Value::Number(f64::from_le_bytes(bytes));
                self.heap.arena.function_mut(function).chunk.raw_add_constant(value);
                Ok(())
            }
            INLINE_STRING => {
                let mut len_bytes = [0u8; 4];
                for b in len_bytes.iter_mut() {
                    *b = self.read_byte(frame);
                }
                let length = u32::from_le_bytes(len_bytes) as usize;
                let mut buffer = Vec::with_capacity(length);
                for _ in 0..length {
                    buffer.push(self.read_byte(frame));
                }
                let text = String::from_utf8_lossy(&buffer).into_owned();
                let string = self.heap.take_string(text);
                self.heap
                    .arena
                    .function_mut(function)
                    .chunk
                    .raw_add_constant(Value::Obj(string));
                Ok(())
            }
            INLINE_FUNCTION => {
                // Restores code only; nested constants are not restored,
                // so callers must not rely on function payloads.
                let arity = self.read_byte(frame);
                let mut len_bytes = [0u8; 4];
                for b in len_bytes.iter_mut() {
                    *b = self.read_byte(frame);
                }
                let length = u32::from_le_bytes(len_bytes) as usize;
                let nested = self.heap.new_function();
                self.heap.arena.function_mut(nested).arity = arity;
                for _ in 0..length {
                    let byte = self.read_byte(frame);
                    self.heap.arena.function_mut(nested).chunk.write(byte, 0);
                }
                self.heap
                    .arena
                    .function_mut(function)
                    .chunk
                    .raw_add_constant(Value::Obj(nested));
                Ok(())
            }
            _ => Err(format!("Invalid Value Type '{}'", tag)),
        }
    }

    // ---- the dispatch loop ----------------------------------------------

    pub fn run(&mut self) -> InterpretResult {
        let mut frame = match self.heap.frames.last() {
            Some(frame) => *frame,
            None => {
                errors::report_ice("run() with no call frame");
                return InterpretResult::RuntimeError;
            }
        };

        loop {
            if self.heap.stack.len() >= STACK_MAX {
                return self.runtime_error(&frame, "Stack overflow.");
            }

            if debug::trace_exec_enabled() && !debug::silent() {
                let function = self.frame_function(&frame);
                let chunk = &self.heap.arena.function(function).chunk;
                debug::Disassembler::new(&self.heap, chunk).instruction(frame.ip);
            }

            let byte = self.read_byte(&mut frame);
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => {
                    let message = format!("Unrecognised opcode '{}'.", byte);
                    return self.runtime_error(&frame, &message);
                }
            };

            match op {
                OpCode::Invalid => {
                    return self.runtime_error(&frame, "Unrecognised opcode '0'.");
                }
                OpCode::GetConstant => {
                    let value = self.read_constant(&mut frame);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopMany => {
                    let count = self.read_byte(&mut frame) as usize;
                    let keep = self.heap.stack.len().saturating_sub(count);
                    self.heap.stack.truncate(keep);
                }
                OpCode::Add => {
                    if self.is_string(self.peek(0)) && self.is_string(self.peek(1)) {
                        self.concatenate();
                    } else if self.peek(0).is_number() && self.peek(1).is_number() {
                        let right = self.pop().as_number();
                        let left = self.pop().as_number();
                        self.push(Value::Number(left + right));
                    } else {
                        return self
                            .runtime_error(&frame, "Operands must be two numbers or two strings.");
                    }
                }
                OpCode::Subtract => {
                    if let Some(result) =
                        self.numeric_binary(&frame, |a, b| Value::Number(a - b))
                    {
                        return result;
                    }
                }
                OpCode::Multiply => {
                    if let Some(result) =
                        self.numeric_binary(&frame, |a, b| Value::Number(a * b))
                    {
                        return result;
                    }
                }
                OpCode::Divide => {
                    if let Some(result) =
                        self.numeric_binary(&frame, |a, b| Value::Number(a / b))
                    {
                        return result;
                    }
                }
                OpCode::Greater => {
                    if let Some(result) = self.numeric_binary(&frame, |a, b| Value::Bool(a > b)) {
                        return result;
                    }
                }
                OpCode::Less => {
                    if let Some(result) = self.numeric_binary(&frame, |a, b| Value::Bool(a < b)) {
                        return result;
                    }
                }
                OpCode::Exponent => {
                    if !self.peek(0).is_number() {
                        return self
                            .runtime_error(&frame, "Right operand to '**' must be a number.");
                    }
                    if !self.peek(1).is_number() {
                        return self
                            .runtime_error(&frame, "Left operand to '**' must be a number.");
                    }
                    let right = self.pop().as_number();
                    let left = self.pop().as_number();
                    self.push(Value::Number(left.powf(right)));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return self.runtime_error(&frame, "Operand must be a number.");
                    }
                    let value = self.pop().as_number();
                    self.push(Value::Number(-value));
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(is_falsy(value)));
                }
                OpCode::Equal => {
                    let right = self.pop();
                    let left = self.pop();
                    self.push(Value::Bool(values_equal(left, right)));
                }
                OpCode::AccessIndex => {
                    if !self.peek(0).is_number() {
                        return self.runtime_error(&frame, "Array index must be an integer.");
                    }
                    if !self.is_string(self.peek(1)) {
                        return self.runtime_error(&frame, "Slice target must be a sequence");
                    }
                    let index = self.pop().as_number() as i64;
                    let target = self.peek(0); // stays on the stack for the GC
                    match self.access_sequence_index(target, index) {
                        Result::Ok(value) => {
                            self.pop();
                            self.push(value);
                        }
                        Result::Err(message) => return self.runtime_error(&frame, &message),
                    }
                }
                OpCode::SliceIndex => {
                    if !self.peek(0).is_number() {
                        return self.runtime_error(&frame, "Slice end index must be an integer.");
                    }
                    if !self.peek(1).is_number() {
                        return self
                            .runtime_error(&frame, "Slice start index must be an integer.");
                    }
                    if !self.is_string(self.peek(2)) {
                        return self.runtime_error(&frame, "Slice target must be a sequence");
                    }
                    let end = self.pop().as_number() as i64;
                    let start = self.pop().as_number() as i64;
                    let target = self.peek(0); // stays on the stack for the GC
                    match self.access_sequence_slice(target, start, end) {
                        Result::Ok(value) => {
                            self.pop();
                            self.push(value);
                        }
                        Result::Err(message) => return self.runtime_error(&frame, &message),
                    }
                }
                OpCode::GetLength => {
                    let offset = self.read_byte(&mut frame) as usize;
                    let target = self.peek(offset);
                    match self.sequence_length(target) {
                        Some(length) => self.push(Value::Number(length as f64)),
                        None => {
                            return self
                                .runtime_error(&frame, "Length target must be a sequence");
                        }
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte(&mut frame) as usize;
                    self.push(self.heap.stack[frame.base + slot]);
                }
                OpCode::SetLocal => {
                    // Assignment is an expression; the value stays on the
                    // stack so assignments can chain.
                    let slot = self.read_byte(&mut frame) as usize;
                    self.heap.stack[frame.base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte(&mut frame) as usize;
                    let upvalue = self.heap.arena.closure(frame.closure).upvalues[index];
                    let value = match self.heap.arena.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.heap.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte(&mut frame) as usize;
                    let upvalue = self.heap.arena.closure(frame.closure).upvalues[index];
                    let value = self.peek(0);
                    match self.heap.arena.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.heap.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.arena.upvalue_mut(upvalue).state =
                                UpvalueState::Closed(value);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.heap.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Jump => {
                    let distance = self.read_short(&mut frame) as usize;
                    frame.ip += distance;
                }
                OpCode::Loop => {
                    let distance = self.read_short(&mut frame) as usize;
                    frame.ip -= distance;
                }
                OpCode::JumpIfFalse => {
                    // Leaves the condition in place; and/or reuse it.
                    let distance = self.read_short(&mut frame) as usize;
                    if is_falsy(self.peek(0)) {
                        frame.ip += distance;
                    }
                }
                OpCode::Call => {
                    let argc = self.read_byte(&mut frame) as usize;
                    self.sync_frame(&frame);
                    if let Err(message) = self.call_value(self.peek(argc), argc) {
                        return self.runtime_error_synced(&message);
                    }
                    frame = self.current_frame();
                }
                OpCode::Closure => {
                    let function_value = self.read_constant(&mut frame);
                    let Some(function) = function_value.as_obj() else {
                        return self.runtime_error(&frame, "ICE. Closure over a non-function.");
                    };
                    self.push(function_value); // for the GC
                    let closure = self.heap.new_closure(function);
                    self.pop();
                    self.push(Value::Obj(closure));

                    let upvalue_count = self.heap.arena.function(function).upvalue_count;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte(&mut frame);
                        let index = self.read_byte(&mut frame) as usize;
                        let upvalue = if is_local != 0 {
                            self.capture_upvalue(frame.base + index)
                        } else {
                            self.heap.arena.closure(frame.closure).upvalues[index]
                        };
                        self.heap.arena.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::Return => {
                    let result = self.pop();
                    self.heap.frames.pop();

                    if self.heap.frames.is_empty() {
                        // Returning from the script itself: the result is
                        // the process exit code.
                        self.heap.stack.clear();
                        self.heap.open_upvalues.clear();
                        if let Value::Number(code) = result {
                            self.exit_code = code as i32;
                            return InterpretResult::Ok;
                        }
                        return self.runtime_error_synced(
                            "Top level return value must be an integer (for process exit code)",
                        );
                    }

                    // Promote any still-open captures of this frame's
                    // locals before the slots disappear.
                    self.close_upvalues(frame.base);
                    self.heap.stack.truncate(frame.base);
                    frame = self.current_frame();
                    self.push(result);
                }
                OpCode::Class => {
                    let name_value = self.read_constant(&mut frame);
                    let Some(name) = name_value.as_obj() else {
                        return self.runtime_error(&frame, "ICE. Class name is not a string.");
                    };
                    let class = self.heap.new_class(name);
                    self.push(Value::Obj(class));
                }
                OpCode::Method => {
                    let name_value = self.read_constant(&mut frame);
                    let Some(name) = name_value.as_obj() else {
                        return self.runtime_error(&frame, "ICE. Method name is not a string.");
                    };
                    let method = self.peek(0);
                    let Some(class) = self.peek(1).as_obj() else {
                        return self.runtime_error(&frame, "ICE. Method outside a class.");
                    };
                    let hash = self.heap.str_hash(name);
                    self.heap.arena.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let Some(superclass) = superclass.as_obj() else {
                        return self.runtime_error(&frame, "Superclass must be a class.");
                    };
                    if !matches!(self.heap.arena.get(superclass), Obj::Class(_)) {
                        return self.runtime_error(&frame, "Superclass must be a class.");
                    }
                    let Some(subclass) = self.peek(0).as_obj() else {
                        return self.runtime_error(&frame, "ICE. Inherit without a subclass.");
                    };

                    // Copy now, override later: methods compiled after
                    // this shadow the inherited ones.
                    let methods: Vec<(ObjRef, Value)> =
                        self.heap.arena.class(superclass).methods.iter().collect();
                    for (name, method) in methods {
                        let hash = self.heap.str_hash(name);
                        self.heap.arena.class_mut(subclass).methods.set(name, hash, method);
                    }
                    self.pop(); // subclass
                }
                OpCode::GetProperty => {
                    let name_value = self.read_constant(&mut frame);
                    let Some(name) = name_value.as_obj() else {
                        return self.runtime_error(&frame, "ICE. Property name is not a string.");
                    };
                    let receiver = self.peek(0);
                    let Some(instance) = self.as_instance(receiver) else {
                        return self.runtime_error(&frame, "Only instances have properties.");
                    };

                    let hash = self.heap.str_hash(name);
                    if let Some(value) = self.heap.arena.instance(instance).fields.get(name, hash)
                    {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.arena.instance(instance).class;
                        match self.heap.arena.class(class).methods.get(name, hash) {
                            Some(method_value) => {
                                let Some(method) = method_value.as_obj() else {
                                    return self
                                        .runtime_error(&frame, "ICE. Method is not a closure.");
                                };
                                let bound = self.heap.new_bound_method(receiver, method);
                                self.pop();
                                self.push(Value::Obj(bound));
                            }
                            None => {
                                let message = format!(
                                    "Undefined property '{}'.",
                                    self.heap.string_chars(name)
                                );
                                return self.runtime_error(&frame, &message);
                            }
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name_value = self.read_constant(&mut frame);
                    let Some(name) = name_value.as_obj() else {
                        return self.runtime_error(&frame, "ICE. Property name is not a string.");
                    };
                    let Some(instance) = self.as_instance(self.peek(1)) else {
                        return self.runtime_error(&frame, "Only instances have fields.");
                    };
                    let value = self.peek(0);
                    let hash = self.heap.str_hash(name);
                    self.heap.arena.instance_mut(instance).fields.set(name, hash, value);
                    // A set expression's result is the assigned value.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::Invoke => {
                    let name_value = self.read_constant(&mut frame);
                    let Some(name) = name_value.as_obj() else {
                        return self.runtime_error(&frame, "ICE. Method name is not a string.");
                    };
                    let argc = self.read_byte(&mut frame) as usize;
                    let receiver = self.peek(argc);
                    let Some(instance) = self.as_instance(receiver) else {
                        return self.runtime_error(&frame, "Only instances have methods.");
                    };

                    self.sync_frame(&frame);
                    let hash = self.heap.str_hash(name);
                    // A field shadows a method: fall back to calling it.
                    let field = self.heap.arena.instance(instance).fields.get(name, hash);
                    let outcome = match field {
                        Some(callee) => {
                            let slot = self.heap.stack.len() - argc - 1;
                            self.heap.stack[slot] = callee;
                            self.call_value(callee, argc)
                        }
                        None => {
                            let class = self.heap.arena.instance(instance).class;
                            self.invoke_from_class(class, name, argc)
                        }
                    };
                    if let Err(message) = outcome {
                        return self.runtime_error_synced(&message);
                    }
                    frame = self.current_frame();
                }
                OpCode::GetSuper => {
                    let name_value = self.read_constant(&mut frame);
                    let Some(name) = name_value.as_obj() else {
                        return self.runtime_error(&frame, "ICE. Method name is not a string.");
                    };
                    let Some(superclass) = self.pop().as_obj() else {
                        return self.runtime_error(&frame, "ICE. Missing superclass.");
                    };

                    let hash = self.heap.str_hash(name);
                    match self.heap.arena.class(superclass).methods.get(name, hash) {
                        Some(method_value) => {
                            let Some(method) = method_value.as_obj() else {
                                return self.runtime_error(&frame, "ICE. Method is not a closure.");
                            };
                            let receiver = self.peek(0);
                            let bound = self.heap.new_bound_method(receiver, method);
                            self.pop();
                            self.push(Value::Obj(bound));
                        }
                        None => {
                            let message =
                                format!("Undefined property '{}'.", self.heap.string_chars(name));
                            return self.runtime_error(&frame, &message);
                        }
                    }
                }
                OpCode::SuperInvoke => {
                    let name_value = self.read_constant(&mut frame);
                    let Some(name) = name_value.as_obj() else {
                        return self.runtime_error(&frame, "ICE. Method name is not a string.");
                    };
                    let argc = self.read_byte(&mut frame) as usize;
                    let Some(superclass) = self.pop().as_obj() else {
                        return self.runtime_error(&frame, "ICE. Missing superclass.");
                    };

                    self.sync_frame(&frame);
                    if let Err(message) = self.invoke_from_class(superclass, name, argc) {
                        return self.runtime_error_synced(&message);
                    }
                    frame = self.current_frame();
                }
                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    self.write_line(&text);
                }
                OpCode::LoadInlineConstant => {
                    if let Err(message) = self.load_inline_constant(&mut frame) {
                        return self.runtime_error(&frame, &message);
                    }
                }
                OpCode::DebugBreakPoint => {
                    self.sync_frame(&frame);
                    self.print_debug_info();
                }
                OpCode::ExitVm => {
                    // Ends the REPL session (or the script) deliberately.
                    self.sync_frame(&frame);
                    return InterpretResult::Exit;
                }
            }
        }
    }

    /// The `debugger;` dump: constants, heap objects, stack, frames, and
    /// interned strings. Execution continues afterwards.
    pub fn print_debug_info(&self) {
        if debug::silent() {
            return;
        }

        println!("Current Chunk Constants:");
        if let Some(frame) = self.heap.frames.last() {
            let function = self.heap.arena.function(self.frame_function(frame));
            for (i, constant) in function.chunk.constants().iter().enumerate() {
                println!("          {:3} [{}]", i, self.heap.format_value(*constant));
            }
        }

        println!("Allocated Heap Objects:");
        for r in self.heap.arena.refs() {
            println!("          {:4} [{}]", r.0, self.heap.format_value(Value::Obj(r)));
        }

        println!("Current Stack:");
        print!("          ");
        for value in &self.heap.stack {
            print!("[{}]", self.heap.format_value(*value));
        }
        println!();

        self.print_stack_trace();

        println!("Strings:");
        for (key, _) in self.heap.strings.iter() {
            println!("          [{}]", self.heap.string_chars(key));
        }
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{INLINE_NUMBER, INLINE_STRING};

    // Builds a script closure around a hand-written chunk and runs it.
    fn run_raw_chunk(vm: &mut Vm, build: impl FnOnce(&mut crate::bytecode::Chunk)) -> InterpretResult {
        let function = vm.heap.new_function();
        build(&mut vm.heap.arena.function_mut(function).chunk);
        vm.heap.stack.clear();
        vm.heap.frames.clear();
        vm.push(Value::Obj(function));
        let closure = vm.heap.new_closure(function);
        vm.pop();
        vm.push(Value::Obj(closure));
        vm.call_closure(closure, 0).expect("script frame");
        vm.run()
    }

    #[test]
    fn inline_number_constant_loads_at_runtime() {
        let mut vm = Vm::new();
        vm.capture_output();
        let result = run_raw_chunk(&mut vm, |chunk| {
            chunk.write(OpCode::LoadInlineConstant.into(), 1);
            chunk.write(INLINE_NUMBER, 1);
            for byte in 42.0f64.to_le_bytes() {
                chunk.write(byte, 1);
            }
            chunk.write(OpCode::GetConstant.into(), 1);
            chunk.write(0, 1);
            chunk.write(OpCode::Print.into(), 1);
            chunk.write(OpCode::GetConstant.into(), 1);
            chunk.write(0, 1);
            chunk.write(OpCode::Return.into(), 1);
        });
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(vm.exit_code, 42);
        assert_eq!(vm.take_output(), "42\n");
    }

    #[test]
    fn inline_string_constant_is_interned() {
        let mut vm = Vm::new();
        vm.capture_output();
        let text = b"inlined";
        let result = run_raw_chunk(&mut vm, |chunk| {
            chunk.write(OpCode::LoadInlineConstant.into(), 1);
            chunk.write(INLINE_STRING, 1);
            for byte in (text.len() as u32).to_le_bytes() {
                chunk.write(byte, 1);
            }
            for &byte in text.iter() {
                chunk.write(byte, 1);
            }
            chunk.write(OpCode::GetConstant.into(), 1);
            chunk.write(0, 1);
            chunk.write(OpCode::Print.into(), 1);
            chunk.write(OpCode::LoadInlineConstant.into(), 1);
            chunk.write(INLINE_NUMBER, 1);
            for byte in 0.0f64.to_le_bytes() {
                chunk.write(byte, 1);
            }
            chunk.write(OpCode::GetConstant.into(), 1);
            chunk.write(1, 1);
            chunk.write(OpCode::Return.into(), 1);
        });
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(vm.take_output(), "inlined\n");
    }

    fn open_slots(vm: &Vm) -> Vec<usize> {
        vm.heap
            .open_upvalues
            .iter()
            .filter_map(|&u| vm.heap.arena.upvalue(u).stack_slot())
            .collect()
    }

    #[test]
    fn open_upvalue_list_is_sorted_and_deduplicated() {
        let mut vm = Vm::new();
        for i in 0..10 {
            vm.push(Value::Number(i as f64));
        }

        let first = vm.capture_upvalue(5);
        vm.capture_upvalue(2);
        vm.capture_upvalue(8);
        let again = vm.capture_upvalue(5);

        assert_eq!(first, again);
        assert_eq!(open_slots(&vm), vec![8, 5, 2]);
    }

    #[test]
    fn close_upvalues_closes_everything_at_or_above() {
        let mut vm = Vm::new();
        for i in 0..10 {
            vm.push(Value::Number(i as f64));
        }
        vm.capture_upvalue(2);
        let mid = vm.capture_upvalue(5);
        let top = vm.capture_upvalue(8);

        vm.close_upvalues(5);
        assert_eq!(open_slots(&vm), vec![2]);

        for closed in [mid, top] {
            match vm.heap.arena.upvalue(closed).state {
                UpvalueState::Closed(Value::Number(_)) => {}
                other => panic!("expected a closed number, got {:?}", other),
            }
        }
        match vm.heap.arena.upvalue(top).state {
            UpvalueState::Closed(value) => {
                assert!(crate::value::values_equal(value, Value::Number(8.0)));
            }
            _ => unreachable!(),
        }
    }
}
