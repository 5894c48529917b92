// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for the Lox language.
// Each complete input compiles and runs as a whole program against a
// persistent VM, so interned strings and natives carry across lines.
// Features:
// - Multi-line input: unclosed braces/parens keep the buffer open
// - Command history with line editing (rustyline)
// - `exit;` ends the session; `debugger;` dumps VM state and continues

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::{InterpretResult, Vm};

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Repl, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        println!(
            "Lox {} — type a statement, or {} to leave.",
            env!("CARGO_PKG_VERSION"),
            "exit;".bright_yellow()
        );

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() { "> " } else { "  ... " };

            match self.editor.readline(prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    buffer.push_str(&line);
                    buffer.push('\n');

                    if !input_complete(&buffer) {
                        continue;
                    }

                    let result = self.vm.interpret(&buffer);
                    buffer.clear();
                    if result == InterpretResult::Exit {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (input cleared)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }
}

// A line with unclosed delimiters keeps the buffer open so functions and
// classes can span lines. String contents don't count.
fn input_complete(source: &str) -> bool {
    let mut depth: i64 = 0;
    let mut in_string = false;
    for c in source.chars() {
        match c {
            '"' => in_string = !in_string,
            '{' | '(' | '[' if !in_string => depth += 1,
            '}' | ')' | ']' if !in_string => depth -= 1,
            _ => {}
        }
    }
    !in_string && depth <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_input_is_complete() {
        assert!(input_complete("print 1;\n"));
        assert!(input_complete("fun f() { return 1; }\n"));
    }

    #[test]
    fn open_braces_keep_reading() {
        assert!(!input_complete("fun f() {\n"));
        assert!(!input_complete("while (true) { print (\n"));
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        assert!(input_complete("print \"{\";\n"));
        assert!(!input_complete("print \"unterminated\n"));
    }
}
