//! Function prototypes executed by the reference loop.

use crate::opcode::OpCode;
use cup_core::string::StringId;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StringId),
}

/// How a closure obtains one upvalue when it is created.
#[derive(Clone, Debug)]
pub struct UpvalDesc {
    pub name: String,
    /// Captures a register of the enclosing frame when true, otherwise an
    /// upvalue of the enclosing closure.
    pub in_stack: bool,
    pub index: u8,
}

/// Debug record of a local variable's live range.
#[derive(Clone, Debug)]
pub struct LocalVar {
    pub name: String,
    pub start_pc: usize,
    pub end_pc: usize,
}

#[derive(Clone, Debug)]
pub struct Proto {
    pub code: Vec<OpCode>,
    /// Source line per instruction.
    pub line_info: Vec<u32>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalDesc>,
    pub local_vars: Vec<LocalVar>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub source: String,
    pub line_defined: u32,
}

impl Proto {
    pub fn new(source: impl Into<String>) -> Self {
        Proto {
            code: Vec::new(),
            line_info: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            local_vars: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2,
            source: source.into(),
            line_defined: 0,
        }
    }

    pub fn emit(&mut self, op: OpCode, line: u32) -> usize {
        self.code.push(op);
        self.line_info.push(line);
        self.code.len() - 1
    }

    pub fn add_constant(&mut self, k: Constant) -> u32 {
        if let Some(i) = self.constants.iter().position(|c| *c == k) {
            return i as u32;
        }
        self.constants.push(k);
        (self.constants.len() - 1) as u32
    }

    pub fn add_proto(&mut self, p: Proto) -> u32 {
        self.protos.push(Rc::new(p));
        (self.protos.len() - 1) as u32
    }

    pub fn add_upvalue(&mut self, name: &str, in_stack: bool, index: u8) -> u8 {
        self.upvalues.push(UpvalDesc {
            name: name.to_string(),
            in_stack,
            index,
        });
        (self.upvalues.len() - 1) as u8
    }

    pub fn add_local(&mut self, name: &str, start_pc: usize, end_pc: usize) {
        self.local_vars.push(LocalVar {
            name: name.to_string(),
            start_pc,
            end_pc,
        });
    }

    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_info.get(pc).copied()
    }

    /// Name of the `local_number`-th (1-based) local active at `pc`.
    pub fn local_name(&self, local_number: usize, pc: usize) -> Option<&str> {
        self.local_vars
            .iter()
            .filter(|v| v.start_pc <= pc && pc < v.end_pc)
            .nth(local_number.checked_sub(1)?)
            .map(|v| v.name.as_str())
    }

    /// Chunk name as shown in messages: `=name` and `@file` drop their prefix.
    pub fn short_source(&self) -> String {
        match self.source.chars().next() {
            Some('=') | Some('@') => self.source[1..].to_string(),
            _ => {
                let first = self.source.lines().next().unwrap_or("");
                format!("[string \"{first}\"]")
            }
        }
    }
}
