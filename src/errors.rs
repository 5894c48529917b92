// File: src/errors.rs
//
// Error handling and reporting for the Lox interpreter.
// Compile errors are printed eagerly (the compiler latches and keeps
// going); runtime errors are printed with a stack trace by the VM.
// Both go to standard error in the formats the test suite and tooling
// expect: "[line L] Error at 'TOK': MSG" and "[line L] in NAME".

use colored::Colorize;
use std::fmt;

/// Where a compile error was detected relative to the token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAt<'src> {
    Token(&'src str),
    Eof,
    /// Lexical errors already carry their position in the message.
    Lexical,
}

pub struct CompileError<'src> {
    pub line: u32,
    pub at: ErrorAt<'src>,
    pub message: String,
}

impl fmt::Display for CompileError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, "Error".red().bold())?;
        match self.at {
            ErrorAt::Token(text) => write!(f, " at '{}'", text)?,
            ErrorAt::Eof => write!(f, " at end")?,
            ErrorAt::Lexical => {}
        }
        write!(f, ": {}", self.message)
    }
}

pub fn report_compile_error(line: u32, at: ErrorAt, message: &str) {
    eprintln!("{}", CompileError { line, at, message: message.to_string() });
}

pub fn report_runtime_error(message: &str) {
    eprintln!("{}", message.red());
}

/// One frame of a runtime stack trace, printed top-most first.
pub fn report_trace_line(line: u32, name: &str) {
    eprintln!("[line {}] in {}", line, name);
}

/// Internal consistency errors: these indicate a compiler/VM bug, not a
/// user mistake. Execution may continue but its behavior is undefined.
pub fn report_ice(message: &str) {
    eprintln!("{} {}", "ICE:".red().bold(), message);
}

/// Process exit codes, following the sysexits convention the original
/// toolchain used.
pub const EXIT_COMPILE_ERROR: i32 = 65;
pub const EXIT_RUNTIME_ERROR: i32 = 70;
pub const EXIT_IO_ERROR: i32 = 74;
