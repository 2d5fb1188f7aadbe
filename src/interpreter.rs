//! Translation of source fragments into debugger command blocks.
//!
//! Each inserted statement is classified into a [`Statement`] and lowered to
//! [`DebuggerCommand`]s attached to one or more breakpoints. The emitted blocks
//! reproduce the control-flow effect of the edit: the program stops at the
//! fragment's breakpoint, the debugger performs the inserted side effects, and
//! execution resumes at the continuation, skipping removed lines.
use crate::patch::reader::{condition_end, starts_with_keyword};
use crate::patch::{BreakPoint, Fragment};
use regex::Regex;
use std::fmt;
use std::path::PathBuf;

/// Convenience variable gating `for` initializers to a single execution.
pub const INIT_FLAG: &str = "$valkyrie_init";

const COMPOUND_OPERATORS: [&str; 12] = [
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "<<=", ">>=", "++", "--",
];
const TYPE_KEYWORDS: [&str; 12] = [
    "const", "unsigned", "signed", "register", "static", "short", "long", "int", "char",
    "size_t", "float", "double",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Return(String),
    /// Header text starting at the `if` keyword.
    If(String),
    While {
        condition: String,
    },
    For {
        init: String,
        condition: String,
        increment: String,
    },
    Assignment {
        text: String,
        compound: bool,
    },
    Call(String),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggerCommand {
    SetVar { lhs: String, rhs: String },
    /// `set var <expr>` for a pre-formed assignment expression.
    SetExpr(String),
    Call(String),
    Jump(BreakPoint),
    If(String),
    Else,
    End,
    Continue,
    GenerateCore(PathBuf),
    Quit,
    Raw(String),
}

impl fmt::Display for DebuggerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetVar { lhs, rhs } => write!(f, "set var {lhs}={rhs}"),
            Self::SetExpr(expr) => write!(f, "set var {expr}"),
            Self::Call(expr) => write!(f, "call {expr}"),
            Self::Jump(bp) => write!(f, "jump {bp}"),
            Self::If(cond) => write!(f, "if {cond}"),
            Self::Else => f.write_str("else"),
            Self::End => f.write_str("end"),
            Self::Continue => f.write_str("continue"),
            Self::GenerateCore(path) => write!(f, "generate-core-file {}", path.display()),
            Self::Quit => f.write_str("quit"),
            Self::Raw(text) => f.write_str(text),
        }
    }
}

/// Commands run when the debugger stops at `location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointBlock {
    pub location: BreakPoint,
    pub temporary: bool,
    pub commands: Vec<DebuggerCommand>,
}

impl BreakpointBlock {
    pub fn new(location: BreakPoint) -> Self {
        Self {
            location,
            temporary: false,
            commands: Vec::new(),
        }
    }

    pub fn temporary(location: BreakPoint) -> Self {
        Self {
            temporary: true,
            ..Self::new(location)
        }
    }

    pub fn render(&self, out: &mut String) {
        let kind = if self.temporary { "tbreak" } else { "break" };
        out.push_str(&format!("{kind} {}\ncommands\nsilent\n", self.location));
        for command in &self.commands {
            out.push_str(&command.to_string());
            out.push('\n');
        }
        out.push_str("end\n");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFragment {
    pub breakpoint: BreakPoint,
    /// First block is always at `breakpoint`; loops add a back-edge block.
    pub blocks: Vec<BreakpointBlock>,
    pub jump_target: BreakPoint,
    pub is_loop: bool,
}

/// Normalize and classify one inserted source line.
///
/// Returns `None` for lines that produce no commands (blank, `//prophet`).
pub fn parse_statement(raw: &str) -> Option<Statement> {
    if raw.contains("//prophet") {
        return None;
    }
    let comment = Regex::new(r"/\*(?s:.*?)\*/").expect("regex for block comments");
    let cleaned = comment.replace_all(&raw.replace('\t', ""), "").trim().to_string();
    let body = cleaned.trim_start_matches(['{', '}', ' ']);
    if body.trim_matches([';', '{', '}', ' ']).is_empty() {
        return None;
    }

    if body == "return" || body.starts_with("return;") || starts_with_keyword(body, "return") {
        return Some(Statement::Return(strip_terminators(body)));
    }
    if starts_with_keyword(body, "if") {
        return Some(Statement::If(body.to_string()));
    }
    if starts_with_keyword(body, "while") {
        let header = body.trim_start_matches("while").replace('{', "");
        let header = header.trim();
        let condition = header
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .unwrap_or(header);
        return Some(Statement::While {
            condition: condition.trim().to_string(),
        });
    }
    if starts_with_keyword(body, "for") {
        return Some(parse_for_header(body));
    }
    let without_comparisons = body
        .replace("==", "")
        .replace("!=", "")
        .replace(">=", "")
        .replace("<=", "");
    let compound = COMPOUND_OPERATORS.iter().any(|op| body.contains(op));
    if compound || without_comparisons.contains('=') {
        return Some(Statement::Assignment {
            text: strip_terminators(body),
            compound,
        });
    }
    if has_function_call(body) {
        return Some(Statement::Call(strip_terminators(body)));
    }
    Some(Statement::Other(body.to_string()))
}

fn parse_for_header(body: &str) -> Statement {
    let header = body.trim_start_matches("for").replace('{', "");
    let header = header.trim();
    let inner = header.strip_prefix('(').unwrap_or(header);
    let inner = match inner.rfind(')') {
        Some(close) => &inner[..close],
        None => inner,
    };
    let mut parts = inner.splitn(3, ';');
    let init = parts.next().unwrap_or_default().trim().to_string();
    let condition = parts.next().unwrap_or_default().trim().to_string();
    let increment = parts.next().unwrap_or_default().trim().to_string();
    Statement::For {
        init,
        condition,
        increment,
    }
}

/// True for a statement whose leading expression is a function call.
pub fn has_function_call(statement: &str) -> bool {
    let control = [
        "return ", "while ", "if ", "for ", "while(", "if(", "for(", "switch(",
    ];
    if control.iter().any(|keyword| statement.contains(keyword)) {
        return false;
    }
    let call = Regex::new(r"^[A-Za-z0-9_ ]*\(").expect("regex for call statements");
    call.is_match(statement.trim_start())
}

fn strip_terminators(text: &str) -> String {
    text.replace(';', "").trim().to_string()
}

fn strip_declaration_type(expr: &str) -> String {
    let mut tokens: Vec<&str> = expr.split_whitespace().collect();
    while tokens.len() > 1 && TYPE_KEYWORDS.contains(&tokens[0]) {
        tokens.remove(0);
    }
    tokens.join(" ")
}

/// Compile one fragment at `breakpoint` into debugger blocks.
pub fn compile_fragment(breakpoint: &BreakPoint, fragment: &Fragment) -> CompiledFragment {
    let target = fragment.continuation(breakpoint);
    let step = breakpoint.offset(1);
    let mut primary = BreakpointBlock::new(breakpoint.clone());
    let mut extra_blocks = Vec::new();
    let mut transferred = false;
    let mut is_loop = false;

    for raw in &fragment.inserted {
        let Some(statement) = parse_statement(raw) else {
            continue;
        };
        let commands = &mut primary.commands;
        match statement {
            Statement::Return(text) => {
                commands.push(DebuggerCommand::Raw(text));
                commands.push(DebuggerCommand::Continue);
                transferred = true;
            }
            Statement::If(header) => {
                commands.extend(lower_if(&header, &step, &target));
                transferred = true;
            }
            Statement::While { condition } => {
                commands.extend(branch(&condition, &step, &target));
                if let Some(block) = back_edge(breakpoint, &target, None, &condition, &step) {
                    extra_blocks.push(block);
                }
                is_loop = true;
            }
            Statement::For {
                init,
                condition,
                increment,
            } => {
                let condition = if condition.is_empty() {
                    "1".to_string()
                } else {
                    condition
                };
                let guarded = format!("({condition})");
                commands.push(DebuggerCommand::If(INIT_FLAG.to_string()));
                for initializer in init.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    commands.push(DebuggerCommand::SetExpr(strip_declaration_type(initializer)));
                }
                commands.push(DebuggerCommand::Raw(format!("set {INIT_FLAG} = 0")));
                commands.push(DebuggerCommand::End);
                commands.extend(branch(&guarded, &step, &target));
                let increment = (!increment.is_empty()).then_some(increment);
                if let Some(block) =
                    back_edge(breakpoint, &target, increment.as_deref(), &guarded, &step)
                {
                    extra_blocks.push(block);
                }
                is_loop = true;
            }
            Statement::Assignment { text, compound } => {
                commands.push(lower_assignment(&text, compound));
            }
            Statement::Call(expr) => {
                commands.push(DebuggerCommand::Call(format!("(void){expr}")));
            }
            Statement::Other(text) => {
                let text = text.replace(['{', '}', ';'], "").trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if has_function_call(&text) {
                    commands.push(DebuggerCommand::Call(text));
                } else {
                    commands.push(DebuggerCommand::Raw(text));
                }
            }
        }
    }

    if !transferred && !is_loop {
        primary.commands.push(DebuggerCommand::Jump(target.clone()));
    }
    let mut blocks = vec![primary];
    blocks.extend(extra_blocks);
    CompiledFragment {
        breakpoint: breakpoint.clone(),
        blocks,
        jump_target: target,
        is_loop,
    }
}

fn branch(condition: &str, step: &BreakPoint, target: &BreakPoint) -> Vec<DebuggerCommand> {
    vec![
        DebuggerCommand::If(condition.to_string()),
        DebuggerCommand::Jump(step.clone()),
        DebuggerCommand::Else,
        DebuggerCommand::Jump(target.clone()),
        DebuggerCommand::End,
    ]
}

fn lower_if(header: &str, step: &BreakPoint, target: &BreakPoint) -> Vec<DebuggerCommand> {
    if step != target {
        let condition = header
            .strip_prefix("if")
            .unwrap_or(header)
            .replace('{', "")
            .trim()
            .to_string();
        return branch(&condition, step, target);
    }
    let Some(open) = header.find('(') else {
        return branch(header.trim_start_matches("if").trim(), step, target);
    };
    let close = condition_end(header, open);
    let condition = &header[open..close];
    let rest = strip_terminators(&header[close..].replace(['{', '}'], ""));

    let mut commands = vec![DebuggerCommand::If(condition.to_string())];
    if !rest.is_empty() {
        if has_function_call(&rest) {
            commands.push(DebuggerCommand::Call(format!("(void){rest}")));
        } else {
            commands.push(DebuggerCommand::Call(rest));
        }
    }
    commands.extend([
        DebuggerCommand::Jump(step.clone()),
        DebuggerCommand::Else,
        DebuggerCommand::Jump(target.clone()),
        DebuggerCommand::End,
    ]);
    commands
}

fn lower_assignment(text: &str, compound: bool) -> DebuggerCommand {
    if compound {
        return DebuggerCommand::Call(text.to_string());
    }
    let Some((lhs, rhs)) = text.split_once('=') else {
        return DebuggerCommand::Raw(text.to_string());
    };
    let lhs = lhs.split_whitespace().last().unwrap_or(lhs).to_string();
    DebuggerCommand::SetVar {
        lhs,
        rhs: rhs.trim().to_string(),
    }
}

/// Block at the loop's last body line that re-evaluates the loop condition.
fn back_edge(
    breakpoint: &BreakPoint,
    target: &BreakPoint,
    increment: Option<&str>,
    condition: &str,
    step: &BreakPoint,
) -> Option<BreakpointBlock> {
    let end_line = target.line.checked_sub(1)?;
    if end_line <= breakpoint.line {
        tracing::debug!(%breakpoint, %target, "loop without body lines, no back edge");
        return None;
    }
    let mut block = BreakpointBlock::new(target.with_line(end_line));
    if let Some(increment) = increment {
        block.commands.push(DebuggerCommand::SetExpr(increment.to_string()));
    }
    block.commands.extend(branch(condition, step, target));
    Some(block)
}

#[cfg(test)]
#[path = "interpreter_tests.rs"]
mod tests;
