// File: src/debug.rs
//
// Bytecode disassembler and diagnostic toggles for the Lox VM.
// LOX_DUMP_CODE disassembles each function as it finishes compiling;
// LOX_TRACE_EXEC disassembles each instruction as it executes. The -s
// flag silences both regardless of the environment.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::bytecode::{Chunk, OpCode, INLINE_FUNCTION, INLINE_NUMBER, INLINE_STRING};
use crate::heap::Heap;
use crate::object::ObjRef;

static SILENT: AtomicBool = AtomicBool::new(false);

pub fn set_silent(silent: bool) {
    SILENT.store(silent, Ordering::Relaxed);
}

pub fn silent() -> bool {
    SILENT.load(Ordering::Relaxed)
}

pub fn dump_code_enabled() -> bool {
    std::env::var("LOX_DUMP_CODE").is_ok()
}

pub fn trace_exec_enabled() -> bool {
    std::env::var("LOX_TRACE_EXEC").is_ok()
}

/// Disassembles a finished function when code dumping is on.
pub fn dump_function(heap: &Heap, function: ObjRef, name: &str) {
    if !dump_code_enabled() || silent() {
        return;
    }
    let chunk = &heap.arena.function(function).chunk;
    Disassembler::new(heap, chunk).disassemble(name);
    eprintln!("==========");
}

pub struct Disassembler<'a> {
    heap: &'a Heap,
    chunk: &'a Chunk,
    last_line: i64,
    inline_constants: usize,
}

impl<'a> Disassembler<'a> {
    pub fn new(heap: &'a Heap, chunk: &'a Chunk) -> Disassembler<'a> {
        Disassembler { heap, chunk, last_line: -1, inline_constants: 0 }
    }

    pub fn disassemble(&mut self, name: &str) {
        eprintln!("== {} ==", name);
        let mut offset = 0;
        while offset < self.chunk.code.len() {
            offset = self.instruction(offset);
        }
    }

    /// Prints one instruction and returns the offset of the next.
    pub fn instruction(&mut self, offset: usize) -> usize {
        let line = self.chunk.get_line(offset) as i64;
        if line == self.last_line {
            eprint!("{:04}    | ", offset);
        } else {
            eprint!("{:04} {:4} ", offset, line);
        }
        self.last_line = line;

        let op = match OpCode::try_from(self.chunk.code[offset]) {
            Ok(op) => op,
            Err(_) => {
                eprintln!(
                    "Unknown Opcode (index={}, value={})",
                    offset, self.chunk.code[offset]
                );
                return offset + 1;
            }
        };

        match op {
            OpCode::GetConstant
            | OpCode::Class
            | OpCode::Method
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper => self.constant_instruction(op, offset),
            OpCode::PopMany
            | OpCode::Call
            | OpCode::GetLength
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue => self.byte_instruction(op, offset),
            OpCode::Jump | OpCode::JumpIfFalse => self.jump_instruction(op, 1, offset),
            OpCode::Loop => self.jump_instruction(op, -1, offset),
            OpCode::Invoke | OpCode::SuperInvoke => self.invoke_instruction(op, offset),
            OpCode::Closure => self.closure_instruction(offset),
            OpCode::LoadInlineConstant => self.inline_constant_instruction(offset),
            _ => {
                eprintln!("{:?}", op);
                offset + 1
            }
        }
    }

    fn constant_instruction(&self, op: OpCode, offset: usize) -> usize {
        let index = self.chunk.code[offset + 1] as usize;
        if index < self.chunk.constants_len() {
            let value = self.heap.format_value(self.chunk.constant(index));
            eprintln!("{:<16} {:4} '{}'", format!("{:?}", op), index, value);
        } else if index < self.chunk.constants_len() + self.inline_constants {
            eprintln!("{:<16} {:4} Inline", format!("{:?}", op), index);
        } else {
            eprintln!("{:<16} {:4} Out of range", format!("{:?}", op), index);
        }
        offset + 2
    }

    fn byte_instruction(&self, op: OpCode, offset: usize) -> usize {
        eprintln!("{:<16} {:4}", format!("{:?}", op), self.chunk.code[offset + 1]);
        offset + 2
    }

    fn jump_instruction(&self, op: OpCode, sign: i64, offset: usize) -> usize {
        let distance = self.chunk.read_u16(offset + 1) as i64;
        let target = offset as i64 + 3 + sign * distance;
        eprintln!("{:<16} {:4} -> {}", format!("{:?}", op), offset, target);
        offset + 3
    }

    fn invoke_instruction(&self, op: OpCode, offset: usize) -> usize {
        let index = self.chunk.code[offset + 1] as usize;
        let args = self.chunk.code[offset + 2];
        let name = if index < self.chunk.constants_len() {
            self.heap.format_value(self.chunk.constant(index))
        } else {
            "Out of range".to_string()
        };
        eprintln!("{:<16} ({} args) {:4} '{}'", format!("{:?}", op), args, index, name);
        offset + 3
    }

    fn closure_instruction(&self, offset: usize) -> usize {
        let mut offset = offset + 1;
        let index = self.chunk.code[offset] as usize;
        offset += 1;
        let value = self.chunk.constant(index);
        eprintln!("{:<16} {:4} {}", "Closure", index, self.heap.format_value(value));

        let upvalue_count = match value.as_obj() {
            Some(function) => self.heap.arena.function(function).upvalue_count,
            None => 0,
        };
        for _ in 0..upvalue_count {
            let is_local = self.chunk.code[offset];
            let capture_index = self.chunk.code[offset + 1];
            eprintln!(
                "{:04}      |                     {} {}",
                offset,
                if is_local != 0 { "local" } else { "upvalue" },
                capture_index
            );
            offset += 2;
        }
        offset
    }

    fn inline_constant_instruction(&mut self, offset: usize) -> usize {
        let mut offset = offset + 1;
        let tag = self.chunk.code[offset];
        offset += 1;
        eprint!("{:<16} {:4} ", "LoadInlineConstant", self.inline_constants);
        self.inline_constants += 1;

        match tag {
            INLINE_NUMBER => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.chunk.code[offset..offset + 8]);
                eprintln!("num {}", f64::from_le_bytes(bytes));
                offset + 8
            }
            INLINE_STRING => {
                let mut len_bytes = [0u8; 4];
                len_bytes.copy_from_slice(&self.chunk.code[offset..offset + 4]);
                let length = u32::from_le_bytes(len_bytes) as usize;
                offset += 4;
                let text = String::from_utf8_lossy(&self.chunk.code[offset..offset + length]);
                eprintln!("str '{}'", text);
                offset + length
            }
            INLINE_FUNCTION => {
                let arity = self.chunk.code[offset];
                offset += 1;
                let mut len_bytes = [0u8; 4];
                len_bytes.copy_from_slice(&self.chunk.code[offset..offset + 4]);
                let length = u32::from_le_bytes(len_bytes) as usize;
                eprintln!("fn (arity {}, {} code bytes)", arity, length);
                offset + 4 + length
            }
            _ => {
                eprintln!("Invalid Value Type {}", tag);
                offset
            }
        }
    }
}
