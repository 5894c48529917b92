// File: src/main.rs
//
// Main entry point for the Lox interpreter.
// `lox` with no arguments opens a REPL; `lox FILE` runs a script;
// `lox -s FILE` runs it silently (suppresses debug traces). Exit code is
// the script's top-level return value, or 65/70/74 for compile, runtime,
// and file errors.

mod builtins;
mod bytecode;
mod compiler;
mod debug;
mod errors;
mod heap;
mod lexer;
mod object;
mod repl;
mod table;
mod value;
mod vm;

use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;

use crate::vm::{InterpretResult, Vm};

#[derive(ClapParser)]
#[command(
    name = "lox",
    about = "Lox: a bytecode-compiled scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Script to run; omit it for an interactive session
    file: Option<PathBuf>,

    /// Suppress debug traces even when they are enabled
    #[arg(short, long)]
    silent: bool,
}

fn main() {
    let cli = Cli::parse();
    debug::set_silent(cli.silent);

    match cli.file {
        Some(file) => {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(_) => {
                    eprintln!("Could not open file \"{}\".", file.display());
                    std::process::exit(errors::EXIT_IO_ERROR);
                }
            };

            let mut vm = Vm::new();
            let code = match vm.interpret(&source) {
                InterpretResult::Ok => vm.exit_code,
                InterpretResult::Exit => 0,
                InterpretResult::CompileError => errors::EXIT_COMPILE_ERROR,
                InterpretResult::RuntimeError => errors::EXIT_RUNTIME_ERROR,
            };
            std::process::exit(code);
        }
        None => match repl::Repl::new() {
            Ok(mut repl) => {
                if repl.run().is_err() {
                    std::process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("Could not start the REPL: {}", err);
                std::process::exit(1);
            }
        },
    }
}
