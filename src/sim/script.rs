//! Workload scripts for the simulated runtime
//!
//! One statement per line, `#` starts a comment:
//!
//! ```text
//! open /lib/foo.so r        # r = read-only, w = write
//! dlopen /lib/foo.so global # or local
//! call /lib/foo.so bar 1 2
//! read /lib/foo.so count
//! import numpy
//! install snowballstemmer
//! print done
//! fail boom
//! ```

use crate::error::{GuestError, GuestResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Open { path: String, write: bool },
    Dlopen { path: String, global: bool },
    Call { library: String, symbol: String, args: Vec<i64> },
    Read { library: String, symbol: String },
    Import(String),
    Install(String),
    Print(String),
    Fail(String),
}

fn syntax_error(line: usize, msg: impl std::fmt::Display) -> GuestError {
    GuestError::Guest(format!("SyntaxError: line {}: {}", line, msg))
}

/// Parse a whole script; nothing runs if any line is invalid
pub fn parse(source: &str) -> GuestResult<Vec<Statement>> {
    let mut statements = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let words: Vec<&str> = rest.split_whitespace().collect();

        let statement = match (keyword, words.as_slice()) {
            ("open", [path, mode]) => Statement::Open {
                path: path.to_string(),
                write: match *mode {
                    "r" => false,
                    "w" => true,
                    other => return Err(syntax_error(lineno, format!("unknown open mode '{}'", other))),
                },
            },
            ("dlopen", [path, visibility]) => Statement::Dlopen {
                path: path.to_string(),
                global: match *visibility {
                    "global" => true,
                    "local" => false,
                    other => {
                        return Err(syntax_error(lineno, format!("unknown visibility '{}'", other)))
                    }
                },
            },
            ("call", [library, symbol, args @ ..]) => Statement::Call {
                library: library.to_string(),
                symbol: symbol.to_string(),
                args: args
                    .iter()
                    .map(|arg| {
                        arg.parse::<i64>()
                            .map_err(|_| syntax_error(lineno, format!("invalid integer '{}'", arg)))
                    })
                    .collect::<GuestResult<_>>()?,
            },
            ("read", [library, symbol]) => Statement::Read {
                library: library.to_string(),
                symbol: symbol.to_string(),
            },
            ("import", [module]) => Statement::Import(module.to_string()),
            ("install", [package]) => Statement::Install(package.to_string()),
            ("print", _) => Statement::Print(rest.to_string()),
            ("fail", _) => Statement::Fail(rest.to_string()),
            (keyword, _) => {
                return Err(syntax_error(lineno, format!("cannot parse '{}' statement: {}", keyword, line)))
            }
        };
        statements.push(statement);
    }
    Ok(statements)
}
