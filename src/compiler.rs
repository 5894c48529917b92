// File: src/compiler.rs
//
// Bytecode compiler for the Lox programming language.
// A single-pass Pratt parser: tokens stream in from the lexer and
// bytecode streams out into the function under construction. There is no
// AST. The compiler keeps a stack of enclosing function compilations so
// closures can resolve upvalues, and registers every in-progress function
// with the heap so a garbage collection during compilation sees them.

use crate::bytecode::OpCode;
use crate::debug;
use crate::errors::{self, ErrorAt};
use crate::heap::Heap;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARITY: u32 = 255;
const MAX_JUMP: usize = u16::MAX as usize;

// Order matters: parse_precedence compares these numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Ternary,    // a ? b : c
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Exponent,   // **
    Unary,      // ! -
    Index,      // []
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn one_higher(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Exponent,
            Precedence::Exponent => Precedence::Unary,
            Precedence::Unary => Precedence::Index,
            Precedence::Index => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy)]
struct Local<'src> {
    name: &'src str,
    // -1 while the variable is mid-initialization and not yet resolvable.
    depth: i32,
    is_final: bool,
    assignments: u32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    // A capture of the enclosing function's local, as opposed to one of
    // its upvalues.
    is_local: bool,
}

struct TargetFunction<'src> {
    kind: FunctionKind,
    function: ObjRef,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

struct LoopContext {
    continue_target: usize,
    // Break jumps to the loop exit, past the pop of any loop variable,
    // so it pops down to the depth outside the loop's own scope.
    // Continue stays inside the loop, so the loop variable survives.
    break_depth: i32,
    continue_depth: i32,
    break_positions: Vec<usize>,
    continue_positions: Vec<usize>,
}

pub struct Compiler<'src, 'h> {
    heap: &'h mut Heap,
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    current_has_super: bool,
    functions: Vec<TargetFunction<'src>>,
    loops: Vec<LoopContext>,
    // Deferred-emission buffers: while one is active, emit_byte appends
    // to it instead of the chunk. Used to move the for-loop increment
    // after the body without a second pass.
    buffers: Vec<Vec<u8>>,
    // Highest code offset that is (or may become) a jump target; the
    // peephole below never rewrites bytes at or past it.
    last_label: usize,
}

/// Compiles a source string into a script function. Returns `None` when
/// any compile error was reported; errors latch but parsing continues to
/// the end of the file.
pub fn compile(heap: &mut Heap, source: &str) -> Option<ObjRef> {
    if heap.init_string.is_none() {
        let init = heap.copy_string("init");
        heap.init_string = Some(init);
    }

    let placeholder = Token { kind: TokenKind::Eof, text: "", line: 1, column: 1 };
    let mut compiler = Compiler {
        heap,
        lexer: Lexer::new(source),
        current: placeholder,
        previous: placeholder,
        had_error: false,
        panic_mode: false,
        current_has_super: false,
        functions: Vec::new(),
        loops: Vec::new(),
        buffers: Vec::new(),
        last_label: 0,
    };
    compiler.script()
}

fn synthetic_token(text: &'static str) -> Token<'static> {
    Token { kind: TokenKind::Identifier, text, line: 0, column: 0 }
}

impl<'src, 'h> Compiler<'src, 'h> {
    // The whole script compiles as an implicit function, so the VM just
    // wraps the result in a closure and calls it. "Global" variables are
    // that function's locals.
    fn script(&mut self) -> Option<ObjRef> {
        self.push_function(FunctionKind::Script);
        self.advance();

        // Lox proper has no imports, so the script gets clock for free.
        self.import_native(synthetic_token("clock"));

        while !self.matches(TokenKind::Eof) {
            self.declaration();
        }

        // The implicit top-level return carries the process exit code.
        self.emit_constant_access(Value::Number(0.0));
        self.emit_op(OpCode::Return);

        if !self.had_error {
            debug::dump_function(self.heap, self.target().function, "script");
        }

        let function = self.pop_function();
        if self.had_error {
            None
        } else {
            Some(function)
        }
    }

    // ---- token plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.text);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if !self.matches(kind) {
            let token = self.current;
            self.error_at(token, message);
        }
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => ErrorAt::Eof,
            TokenKind::Error => ErrorAt::Lexical,
            _ => ErrorAt::Token(token.text),
        };
        errors::report_compile_error(token.line, at, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    // Skips forward to a statement boundary so one mistake does not
    // cascade into a wall of messages.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- emit helpers ---------------------------------------------------

    fn target(&self) -> &TargetFunction<'src> {
        &self.functions[self.functions.len() - 1]
    }

    fn target_mut(&mut self) -> &mut TargetFunction<'src> {
        let last = self.functions.len() - 1;
        &mut self.functions[last]
    }

    fn scope_depth(&self) -> i32 {
        self.target().scope_depth
    }

    fn code_size(&self) -> usize {
        self.heap.arena.function(self.target().function).chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        if let Some(buffer) = self.buffers.last_mut() {
            buffer.push(byte);
            return;
        }
        let line = self.current.line;
        let function = self.target().function;
        self.heap.arena.function_mut(function).chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_bytes(&mut self, first: u8, second: u8) {
        self.emit_byte(first);
        self.emit_byte(second);
    }

    fn emit_constant_access(&mut self, value: Value) {
        match value {
            Value::Bool(true) => self.emit_op(OpCode::True),
            Value::Bool(false) => self.emit_op(OpCode::False),
            Value::Nil => self.emit_op(OpCode::Nil),
            _ => {
                let function = self.target().function;
                match self.heap.arena.function_mut(function).chunk.add_constant(value) {
                    Ok(index) => {
                        self.emit_op(OpCode::GetConstant);
                        self.emit_byte(index);
                    }
                    Err(message) => self.error(message),
                }
            }
        }
    }

    fn identifier_constant(&mut self, name: Token<'src>) -> u8 {
        let value = Value::Obj(self.heap.copy_string(name.text));
        let function = self.target().function;
        match self.heap.arena.function_mut(function).chunk.add_constant(value) {
            Ok(index) => index,
            Err(message) => {
                self.error(message);
                0
            }
        }
    }

    // ---- jumps ----------------------------------------------------------

    // Current end of code; anything recorded here may be jumped to, which
    // also fences the peephole.
    fn jump_target(&mut self) -> usize {
        let target = self.code_size();
        self.last_label = self.last_label.max(target);
        target
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_bytes(0xff, 0xff);
        self.code_size() - 2
    }

    fn emit_jump_if_false(&mut self) -> usize {
        self.emit_jump(OpCode::JumpIfFalse)
    }

    fn emit_jump_if_true(&mut self) -> usize {
        let over_skip = self.emit_jump(OpCode::JumpIfFalse);
        let skip = self.emit_jump(OpCode::Jump);
        self.patch_jump(over_skip);
        skip
    }

    fn emit_jump_unconditionally(&mut self) -> usize {
        self.emit_jump(OpCode::Jump)
    }

    fn patch_jump(&mut self, from: usize) {
        let distance = self.jump_target() - from - 2;
        if distance > MAX_JUMP {
            let token = self.current;
            self.error_at(token, "Too much code to jump over.");
        }
        self.write_short(Some(from), distance as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let distance = self.jump_target() - loop_start + 2;
        if distance > MAX_JUMP {
            let token = self.current;
            self.error_at(token, "Too much code to jump over.");
        }
        self.write_short(None, distance as u16);
    }

    fn write_short(&mut self, offset: Option<usize>, value: u16) {
        let high = (value >> 8) as u8;
        let low = (value & 0xff) as u8;
        match offset {
            Some(at) => {
                let function = self.target().function;
                let chunk = &mut self.heap.arena.function_mut(function).chunk;
                chunk.set_code_at(at, high);
                chunk.set_code_at(at + 1, low);
            }
            None => self.emit_bytes(high, low),
        }
    }

    // ---- deferred emission ----------------------------------------------

    fn push_buffer(&mut self) {
        self.buffers.push(Vec::new());
    }

    fn pop_buffer(&mut self) -> Vec<u8> {
        self.buffers.pop().unwrap_or_default()
    }

    fn flush_buffer(&mut self, buffer: Vec<u8>) {
        for byte in buffer {
            self.emit_byte(byte);
        }
        self.last_label = self.last_label.max(self.code_size());
    }

    // ---- functions and scopes -------------------------------------------

    fn push_function(&mut self, kind: FunctionKind) {
        let function = self.heap.new_function();
        self.heap.compiler_roots.push(function);
        self.functions.push(TargetFunction {
            kind,
            function,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
        });

        // Reserve stack slot 0. Methods use it for the receiver; plain
        // functions leave it holding the callee.
        let name = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        self.make_local(synthetic_token(name));
        self.define_local_variable();
    }

    fn pop_function(&mut self) -> ObjRef {
        self.heap.compiler_roots.pop();
        match self.functions.pop() {
            Some(target) => target.function,
            None => panic!("ICE: compiler function stack underflow"),
        }
    }

    fn begin_scope(&mut self) {
        self.target_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let target_depth = self.scope_depth() - 1;
        let count = self.emit_scope_pops(target_depth);
        let target = self.target_mut();
        let keep = target.locals.len() - count;
        target.locals.truncate(keep);
        target.scope_depth -= 1;
    }

    // Emits pops (batched where possible) for every local deeper than
    // `target_depth`, closing captured ones. Returns how many locals
    // that covered without modifying the local stack.
    fn emit_scope_pops(&mut self, target_depth: i32) -> usize {
        let mut count = 0;
        let mut plain_run = 0usize;
        for i in (0..self.target().locals.len()).rev() {
            let local = self.target().locals[i];
            if local.depth != -1 && local.depth <= target_depth {
                break;
            }
            if local.is_captured {
                self.flush_pops(plain_run);
                plain_run = 0;
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                plain_run += 1;
            }
            count += 1;
        }
        self.flush_pops(plain_run);
        count
    }

    fn flush_pops(&mut self, mut count: usize) {
        while count > 0 {
            if count == 1 {
                self.emit_op(OpCode::Pop);
                count = 0;
            } else {
                let batch = count.min(255);
                self.emit_op(OpCode::PopMany);
                self.emit_byte(batch as u8);
                count -= batch;
            }
        }
    }

    // ---- variables ------------------------------------------------------

    // Declares without defining so a variable cannot reference itself in
    // its own initializer.
    fn make_local(&mut self, name: Token<'src>) {
        if self.target().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }

        let depth = self.scope_depth();
        for i in (0..self.target().locals.len()).rev() {
            let existing = self.target().locals[i];
            if existing.depth != -1 && existing.depth < depth {
                break;
            }
            if existing.name == name.text {
                self.error("Already a variable with this name in this scope.");
            }
        }

        self.target_mut().locals.push(Local {
            name: name.text,
            depth: -1,
            is_final: false,
            assignments: 0,
            is_captured: false,
        });
    }

    fn declare_local_variable(&mut self) {
        let name = self.previous;
        self.make_local(name);
    }

    fn define_local_variable(&mut self) {
        // Marks the local initialized. A no-op at runtime: the value just
        // produced stays in place and the stack slot becomes the local.
        let depth = self.scope_depth();
        if let Some(local) = self.target_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_local_variable(&mut self, message: &str) {
        self.consume(TokenKind::Identifier, message);
        self.declare_local_variable();
    }

    fn resolve_local(&mut self, func_index: usize, name: Token<'src>) -> Option<u8> {
        for i in (0..self.functions[func_index].locals.len()).rev() {
            let local = self.functions[func_index].locals[i];
            if local.name == name.text {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, func_index: usize, name: Token<'src>) -> Option<u8> {
        // Reached the script without finding it.
        if func_index == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(func_index - 1, name) {
            self.functions[func_index - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(func_index, local, true);
        }

        if let Some(upvalue) = self.resolve_upvalue(func_index - 1, name) {
            return self.add_upvalue(func_index, upvalue, false);
        }

        None
    }

    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool) -> Option<u8> {
        let desc = UpvalueDesc { index, is_local };
        for (i, existing) in self.functions[func_index].upvalues.iter().enumerate() {
            if *existing == desc {
                return Some(i as u8);
            }
        }

        if self.functions[func_index].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return Some(0);
        }

        self.functions[func_index].upvalues.push(desc);
        let function = self.functions[func_index].function;
        self.heap.arena.function_mut(function).upvalue_count += 1;
        Some((self.functions[func_index].upvalues.len() - 1) as u8)
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let top = self.functions.len() - 1;
        let (get_op, set_op, index, is_local);
        match self.resolve_local(top, name) {
            Some(slot) => {
                get_op = OpCode::GetLocal;
                set_op = OpCode::SetLocal;
                index = slot;
                is_local = true;
            }
            None => match self.resolve_upvalue(top, name) {
                Some(slot) => {
                    get_op = OpCode::GetUpvalue;
                    set_op = OpCode::SetUpvalue;
                    index = slot;
                    is_local = false;
                }
                None => {
                    self.error_at(name, "Undeclared variable.");
                    return;
                }
            },
        }

        // Inside a higher-precedence expression this must parse as a get:
        // a * b = c is a syntax error, not a * (b = c).
        if can_assign && self.matches(TokenKind::Equal) {
            if is_local {
                let local = &mut self.target_mut().locals[index as usize];
                local.assignments += 1;
                if local.assignments > 1 && local.is_final {
                    self.error("Cannot assign to final variable.");
                    return;
                }
            }
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(index);
        } else if get_op == OpCode::GetLocal {
            self.emit_get_local(index);
        } else {
            self.emit_op(get_op);
            self.emit_byte(index);
        }
    }

    // GET_LOCAL with the set/pop/get peephole: "x = expr; use(x)"
    // compiles to SET_LOCAL without the intervening POP/GET pair. Only
    // fires for matching slots, outside buffers, and clear of any jump
    // target.
    fn emit_get_local(&mut self, slot: u8) {
        if self.buffers.is_empty() {
            let size = self.code_size();
            if size >= 3 && self.last_label <= size - 3 {
                let function = self.target().function;
                let code = &self.heap.arena.function(function).chunk.code;
                if code[size - 3] == u8::from(OpCode::SetLocal)
                    && code[size - 2] == slot
                    && code[size - 1] == u8::from(OpCode::Pop)
                {
                    self.heap.arena.function_mut(function).chunk.pop_byte();
                    return;
                }
            }
        }
        self.emit_op(OpCode::GetLocal);
        self.emit_byte(slot);
    }

    // ---- declarations ---------------------------------------------------

    fn declaration(&mut self) {
        match self.current.kind {
            TokenKind::Final | TokenKind::Var => self.var_statement(),
            TokenKind::Fun => self.fun_declaration(),
            TokenKind::Class => self.class_declaration(),
            TokenKind::Import => {
                self.advance();
                while self.matches(TokenKind::Identifier) {
                    let name = self.previous;
                    self.import_native(name);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
                self.consume(TokenKind::Semicolon, "Expect ';' after statement.");
            }
            _ => self.statement(),
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    // Imports resolve at compile time: the native's value is embedded as
    // a constant and bound to a fresh local.
    fn import_native(&mut self, name: Token<'src>) {
        self.make_local(name);
        self.define_local_variable();

        let name_str = self.heap.copy_string(name.text);
        let hash = self.heap.str_hash(name_str);
        match self.heap.natives.get(name_str, hash) {
            Some(value) => self.emit_constant_access(value),
            None => self.error_at(name, "Invalid import"),
        }
    }

    fn var_statement(&mut self) {
        let is_final = self.matches(TokenKind::Final);
        self.matches(TokenKind::Var);

        self.parse_local_variable("Expect variable name.");
        if let Some(local) = self.target_mut().locals.last_mut() {
            local.is_final = is_final;
        }

        if self.matches(TokenKind::Equal) {
            self.expression();
            if let Some(local) = self.target_mut().locals.last_mut() {
                local.assignments += 1;
            }
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.define_local_variable();
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
    }

    // NAME(PARAMS) { BODY }
    fn fun_declaration(&mut self) {
        self.advance();
        self.parse_local_variable("Expect function name.");
        self.define_local_variable();

        let name = self.heap.copy_string(self.previous.text);
        self.function_expression(FunctionKind::Function, Some(name));
    }

    fn class_declaration(&mut self) {
        // The callstack saves the enclosing class's flag.
        let enclosing_has_super = self.current_has_super;

        self.advance();
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_id = self.identifier_constant(class_name);
        self.declare_local_variable();
        self.define_local_variable();
        self.emit_op(OpCode::Class);
        self.emit_byte(name_id);

        self.begin_scope();
        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect super class name.");
            let super_name = self.previous;
            if class_name.text == super_name.text {
                self.error_at(super_name, "A class can't inherit from itself.");
            }

            // Reserve a slot holding the superclass for super lookups.
            self.make_local(synthetic_token("super"));
            self.define_local_variable();

            self.named_variable(super_name, false); // stays as the `super` slot
            self.named_variable(class_name, false); // popped by OP_INHERIT
            self.emit_op(OpCode::Inherit);
            self.current_has_super = true;
        } else {
            self.current_has_super = false;
        }

        // The class value sits on the stack while methods install.
        self.named_variable(class_name, false);

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");

        self.emit_op(OpCode::Pop);
        self.current_has_super = enclosing_has_super;
        self.end_scope();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name_id = self.identifier_constant(self.previous);
        let name = self.heap.copy_string(self.previous.text);

        // Leaves the closure on the stack for OP_METHOD to install.
        let kind = if Some(name) == self.heap.init_string {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function_expression(kind, Some(name));

        self.emit_op(OpCode::Method);
        self.emit_byte(name_id);
    }

    fn function_expression(&mut self, kind: FunctionKind, name: Option<ObjRef>) {
        // The name is only reachable through the intern set, which is
        // weak; keep it pinned until the function object holds it.
        if let Some(name) = name {
            self.heap.stack.push(Value::Obj(name));
        }
        self.push_function(kind);
        let function = self.target().function;
        self.heap.arena.function_mut(function).name = name;
        if name.is_some() {
            self.heap.stack.pop();
        }
        let opening = self.previous;

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");

        if !self.check(TokenKind::RightParen) {
            loop {
                if u32::from(self.heap.arena.function(function).arity) >= MAX_ARITY {
                    let token = self.current;
                    self.error_at(token, "Can't have more than 255 parameters.");
                }
                self.parse_local_variable("Expect parameter name.");
                self.define_local_variable();
                let arity = self.heap.arena.function(function).arity;
                self.heap.arena.function_mut(function).arity = arity.wrapping_add(1);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // The scope is not closed: the return pops the whole frame.
        self.emit_empty_return();

        if !self.had_error {
            let label = match name {
                Some(n) => self.heap.string_chars(n).to_string(),
                None => "script".to_string(),
            };
            debug::dump_function(self.heap, function, &label);
        }

        self.heap.compiler_roots.pop();
        let target = match self.functions.pop() {
            Some(target) => target,
            None => panic!("ICE: compiler function stack underflow"),
        };

        let enclosing = self.target().function;
        match self.heap.arena.function_mut(enclosing).chunk.add_constant(Value::Obj(function)) {
            Ok(index) => {
                self.emit_op(OpCode::Closure);
                self.emit_byte(index);
            }
            Err(message) => self.error(message),
        }

        if target.upvalues.len() != self.heap.arena.function(function).upvalue_count {
            self.error_at(opening, "ICE. Incorrect upvalue count.");
        }

        for upvalue in &target.upvalues {
            let is_local = if upvalue.is_local { 1 } else { 0 };
            let index = upvalue.index;
            self.emit_bytes(is_local, index);
        }
    }

    fn emit_empty_return(&mut self) {
        if self.target().kind == FunctionKind::Initializer {
            // Constructors return `this` implicitly.
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // ---- statements -----------------------------------------------------

    fn statement(&mut self) {
        match self.current.kind {
            TokenKind::LeftBrace => {
                self.advance();
                self.begin_scope();
                self.block();
                self.end_scope();
            }
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Print => {
                self.advance();
                self.expression();
                self.consume(TokenKind::Semicolon, "Expect ';' after value.");
                self.emit_op(OpCode::Print);
            }
            TokenKind::Debugger => {
                self.advance();
                self.consume(TokenKind::Semicolon, "Expect ';' after 'debugger'.");
                self.emit_op(OpCode::DebugBreakPoint);
            }
            TokenKind::Exit => {
                self.advance();
                self.consume(TokenKind::Semicolon, "Expect ';' after 'exit'.");
                self.emit_op(OpCode::ExitVm);
            }
            TokenKind::Return => {
                self.advance();
                if self.matches(TokenKind::Semicolon) {
                    self.emit_empty_return();
                } else {
                    if self.target().kind == FunctionKind::Initializer {
                        self.error("Can't return a value from an initializer.");
                    }
                    self.expression();
                    self.consume(TokenKind::Semicolon, "Expect ';' after 'return'.");
                    self.emit_op(OpCode::Return);
                }
            }
            TokenKind::Break | TokenKind::Continue => {
                self.break_or_continue(self.current.kind);
            }
            _ => self.expression_statement(),
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        // A statement must not change the stack height; leaking one slot
        // per statement would eventually overflow a long-running program.
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.advance();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let jump_over_then = self.emit_jump_if_false();
        self.emit_op(OpCode::Pop);
        self.statement();

        // JUMP_IF_FALSE leaves the condition on the stack (and/or rely on
        // that), so the false path needs its own pop to hop over.
        let jump_over_else = self.emit_jump_unconditionally();
        self.patch_jump(jump_over_then);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(jump_over_else);
    }

    fn while_statement(&mut self) {
        let jump_to_condition = self.jump_target();
        let break_depth = self.scope_depth();
        self.push_active_loop(break_depth);
        self.set_continue_target();
        self.advance();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let jump_over_body = self.emit_jump_if_false();
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(jump_to_condition);

        self.patch_jump(jump_over_body);
        self.emit_op(OpCode::Pop);
        self.set_break_target_and_pop_active_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.advance();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        // Initializer.
        if self.matches(TokenKind::Semicolon) {
            // None.
        } else if self.check(TokenKind::Var) || self.check(TokenKind::Final) {
            self.var_statement();
        } else {
            self.expression_statement();
        }

        // Condition.
        let jump_to_condition = self.jump_target();
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
        } else {
            self.emit_op(OpCode::True);
        }

        let jump_over_body = self.emit_jump_if_false();
        self.emit_op(OpCode::Pop);

        // The increment runs after the body but is written before it, so
        // it compiles into a buffer and flushes later.
        self.push_buffer();
        if !self.check(TokenKind::RightParen) {
            self.expression();
            self.emit_op(OpCode::Pop);
        }
        let increment = self.pop_buffer();
        self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

        // Body.
        let break_depth = self.scope_depth() - 1;
        self.push_active_loop(break_depth);
        self.statement();
        self.set_continue_target();
        self.flush_buffer(increment);
        self.emit_loop(jump_to_condition);

        // Done.
        self.patch_jump(jump_over_body);
        self.emit_op(OpCode::Pop);
        self.end_scope();
        self.set_break_target_and_pop_active_loop();
    }

    fn break_or_continue(&mut self, kind: TokenKind) {
        self.advance();
        self.consume(TokenKind::Semicolon, "Expect ';' after statement.");
        if self.loops.is_empty() {
            self.error("Can't use loop jump outside loop.");
            return;
        }

        let context = &self.loops[self.loops.len() - 1];
        let target_depth = match kind {
            TokenKind::Break => context.break_depth,
            _ => context.continue_depth,
        };
        self.emit_scope_pops(target_depth);
        let location = self.emit_jump_unconditionally();
        if let Some(context) = self.loops.last_mut() {
            match kind {
                TokenKind::Break => context.break_positions.push(location),
                TokenKind::Continue => context.continue_positions.push(location),
                _ => {}
            }
        }
    }

    // `break_depth` is the scope depth whose locals the loop exit has
    // already popped; for a `for` loop that is one level out, so a break
    // also pops the loop variable.
    fn push_active_loop(&mut self, break_depth: i32) {
        let continue_depth = self.scope_depth();
        self.loops.push(LoopContext {
            continue_target: 0,
            break_depth,
            continue_depth,
            break_positions: Vec::new(),
            continue_positions: Vec::new(),
        });
    }

    // Call at the location `continue` should come back to.
    fn set_continue_target(&mut self) {
        let target = self.jump_target();
        if let Some(context) = self.loops.last_mut() {
            context.continue_target = target;
        }
    }

    // Call at the location `break` should skip to, after the condition's
    // pop. Break jumps always go forward; continue jumps pick their
    // direction now that the target is known.
    fn set_break_target_and_pop_active_loop(&mut self) {
        let context = match self.loops.pop() {
            Some(context) => context,
            None => return,
        };

        for location in context.break_positions {
            self.patch_jump(location);
        }

        for location in context.continue_positions {
            let mut distance = context.continue_target as i64 - location as i64 - 2;
            let op = if distance < 0 {
                distance = -distance;
                OpCode::Loop
            } else {
                OpCode::Jump
            };
            if distance > MAX_JUMP as i64 {
                let token = self.current;
                self.error_at(token, "Too much code to jump over.");
            }
            let function = self.target().function;
            self.heap.arena.function_mut(function).chunk.set_code_at(location - 1, op.into());
            self.write_short(Some(location), distance as u16);
        }
    }

    // ---- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.text.parse().unwrap_or(0.0);
        self.emit_constant_access(Value::Number(value));
    }

    fn string(&mut self) {
        let text = self.previous.text;
        let inner = &text[1..text.len() - 1];
        let value = Value::Obj(self.heap.copy_string(inner));
        self.emit_constant_access(value);
    }

    // Grouping changes precedence only; there is nothing to emit.
    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => self.error("Expect expression."),
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut args: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                if args >= MAX_ARITY {
                    let token = self.current;
                    self.error_at(token, "Can't have more than 255 arguments.");
                }
                self.expression();
                args += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        args.min(255) as u8
    }

    fn super_access(&mut self) {
        if !self.current_has_super {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method_id = self.identifier_constant(self.previous);
        self.named_variable(synthetic_token("this"), false);
        if self.matches(TokenKind::LeftParen) {
            // Fast path for a direct super call.
            let args = self.argument_list();
            self.named_variable(synthetic_token("super"), false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_bytes(method_id, args);
        } else {
            self.named_variable(synthetic_token("super"), false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(method_id);
        }
    }

    // Expects '[' already consumed: either one index or a half-open
    // slice with either bound defaulted.
    fn sequence_slice_expression(&mut self) {
        if self.check(TokenKind::Colon) {
            self.emit_constant_access(Value::Number(0.0));
        } else {
            self.expression();
        }

        if self.matches(TokenKind::Colon) {
            if self.matches(TokenKind::RightSquareBracket) {
                self.emit_op(OpCode::GetLength);
                self.emit_byte(1);
            } else {
                self.expression();
                self.consume(TokenKind::RightSquareBracket, "Expect ']' after sequence slice");
            }
            self.emit_op(OpCode::SliceIndex);
        } else {
            self.consume(TokenKind::RightSquareBracket, "Expect ']' after sequence index");
            self.emit_op(OpCode::AccessIndex);
        }
    }

    fn infix_binary(&mut self, min: Precedence, op_prec: Precedence, ops: &[OpCode]) -> bool {
        if min > op_prec {
            return false;
        }
        self.advance();
        self.parse_precedence(op_prec.one_higher());
        for &op in ops {
            self.emit_op(op);
        }
        true
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;

        match self.previous.kind {
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::Identifier => {
                let name = self.previous;
                self.named_variable(name, can_assign);
            }
            TokenKind::Fun => {
                if self.check(TokenKind::Identifier) {
                    self.error("Expect expression.");
                } else {
                    let name = format!("lambda:{}", self.previous.line);
                    let name_ref = self.heap.take_string(name);
                    self.function_expression(FunctionKind::Function, Some(name_ref));
                }
            }
            TokenKind::This => {
                let name = self.previous;
                self.named_variable(name, false);
            }
            TokenKind::Super => self.super_access(),
            _ => {
                self.error("Expect expression.");
                return;
            }
        }

        loop {
            match self.current.kind {
                TokenKind::Minus => {
                    if !self.infix_binary(precedence, Precedence::Term, &[OpCode::Subtract]) {
                        return;
                    }
                }
                TokenKind::Plus => {
                    if !self.infix_binary(precedence, Precedence::Term, &[OpCode::Add]) {
                        return;
                    }
                }
                TokenKind::Slash => {
                    if !self.infix_binary(precedence, Precedence::Factor, &[OpCode::Divide]) {
                        return;
                    }
                }
                TokenKind::Star => {
                    if !self.infix_binary(precedence, Precedence::Factor, &[OpCode::Multiply]) {
                        return;
                    }
                }
                TokenKind::Exponent => {
                    if !self.infix_binary(precedence, Precedence::Exponent, &[OpCode::Exponent]) {
                        return;
                    }
                }
                TokenKind::EqualEqual => {
                    if !self.infix_binary(precedence, Precedence::Equality, &[OpCode::Equal]) {
                        return;
                    }
                }
                TokenKind::Less => {
                    if !self.infix_binary(precedence, Precedence::Comparison, &[OpCode::Less]) {
                        return;
                    }
                }
                TokenKind::Greater => {
                    if !self.infix_binary(precedence, Precedence::Comparison, &[OpCode::Greater]) {
                        return;
                    }
                }
                TokenKind::BangEqual => {
                    if !self.infix_binary(
                        precedence,
                        Precedence::Equality,
                        &[OpCode::Equal, OpCode::Not],
                    ) {
                        return;
                    }
                }
                TokenKind::GreaterEqual => {
                    if !self.infix_binary(
                        precedence,
                        Precedence::Comparison,
                        &[OpCode::Less, OpCode::Not],
                    ) {
                        return;
                    }
                }
                TokenKind::LessEqual => {
                    if !self.infix_binary(
                        precedence,
                        Precedence::Comparison,
                        &[OpCode::Greater, OpCode::Not],
                    ) {
                        return;
                    }
                }
                TokenKind::Equal => {
                    let token = self.current;
                    self.error_at(token, "Invalid assignment target.");
                    return;
                }
                TokenKind::LeftSquareBracket => {
                    if precedence > Precedence::Index {
                        return;
                    }
                    self.advance();
                    self.sequence_slice_expression();
                }
                TokenKind::And => {
                    if precedence > Precedence::And {
                        return;
                    }
                    self.advance();
                    let jump_over_right = self.emit_jump_if_false();
                    self.emit_op(OpCode::Pop);
                    self.parse_precedence(Precedence::And);
                    self.patch_jump(jump_over_right);
                }
                TokenKind::Or => {
                    if precedence > Precedence::Or {
                        return;
                    }
                    self.advance();
                    let jump_over_right = self.emit_jump_if_true();
                    self.emit_op(OpCode::Pop);
                    self.parse_precedence(Precedence::Or);
                    self.patch_jump(jump_over_right);
                }
                TokenKind::Question => {
                    if precedence > Precedence::Ternary {
                        return;
                    }
                    self.advance();

                    let jump_over_then = self.emit_jump_if_false();
                    self.emit_op(OpCode::Pop); // condition
                    self.expression(); // if true
                    self.consume(TokenKind::Colon, "Expect ':' after '?' expression.");

                    let jump_over_else = self.emit_jump_unconditionally();

                    self.patch_jump(jump_over_then);
                    self.emit_op(OpCode::Pop); // condition
                    self.expression(); // if false

                    self.patch_jump(jump_over_else);
                    return;
                }
                TokenKind::LeftParen => {
                    // Function call.
                    if precedence > Precedence::Call {
                        return;
                    }
                    self.advance();
                    let args = self.argument_list();
                    self.emit_op(OpCode::Call);
                    self.emit_byte(args);
                }
                TokenKind::Dot => {
                    // Property access: get, set, or direct invoke.
                    if precedence > Precedence::Call {
                        return;
                    }
                    self.advance();
                    self.consume(TokenKind::Identifier, "Expect property name after '.'.");
                    let name_id = self.identifier_constant(self.previous);

                    if can_assign && self.matches(TokenKind::Equal) {
                        self.expression();
                        self.emit_op(OpCode::SetProperty);
                        self.emit_byte(name_id);
                    } else if self.matches(TokenKind::LeftParen) {
                        let args = self.argument_list();
                        self.emit_op(OpCode::Invoke);
                        self.emit_bytes(name_id, args);
                    } else {
                        self.emit_op(OpCode::GetProperty);
                        self.emit_byte(name_id);
                    }
                }
                _ => return,
            }
        }
    }
}
