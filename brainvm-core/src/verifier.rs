use crate::types::{FuncId, Instr, Program, BYTECODE_VERSION};
use anyhow::{anyhow, Result};
use std::fmt;

/// One static validation failure.
#[derive(Debug, Clone)]
pub struct VerifyError {
    pub message: String,
    pub func: Option<FuncId>,
    pub pc: Option<usize>,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.func, self.pc) {
            (Some(func), Some(pc)) => write!(f, "[fn {} @ {}] {}", func, pc, self.message),
            (Some(func), None) => write!(f, "[fn {}] {}", func, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// Validate a program before first execution.
///
/// Returns every violation found; an empty list means the program is safe
/// to run. Programs are never partially accepted — a VM refuses
/// construction on any diagnostic.
pub fn verify(program: &Program) -> Vec<VerifyError> {
    let mut errors = Vec::new();

    if program.version != BYTECODE_VERSION {
        errors.push(VerifyError {
            message: format!(
                "bytecode version {} does not match engine version {}",
                program.version, BYTECODE_VERSION
            ),
            func: None,
            pc: None,
        });
    }

    if program.functions.get(program.entry_point as usize).is_none() {
        errors.push(VerifyError {
            message: format!("entry point {} is not a function", program.entry_point),
            func: None,
            pc: None,
        });
    }

    for (fid, function) in program.functions.iter().enumerate() {
        let fid = fid as FuncId;
        let len = function.code.len() as i64;

        if function.code.is_empty() {
            errors.push(VerifyError {
                message: "function has no instructions".to_string(),
                func: Some(fid),
                pc: None,
            });
        }

        for (pc, instr) in function.code.iter().enumerate() {
            let mut fail = |message: String| {
                errors.push(VerifyError {
                    message,
                    func: Some(fid),
                    pc: Some(pc),
                });
            };

            match instr {
                Instr::PushConst { idx } => {
                    if program.constants.get(*idx as usize).is_none() {
                        fail(format!("PUSH_CONST: constant {idx} out of range"));
                    }
                }
                Instr::StructNew { type_const, .. } => {
                    if let Some(idx) = type_const {
                        if program.constants.get(*idx as usize).is_none() {
                            fail(format!("STRUCT_NEW: constant {idx} out of range"));
                        }
                    }
                }
                Instr::LoadVar { name } | Instr::StoreVar { name } => {
                    if program.variable_names.get(*name as usize).is_none() {
                        fail(format!("variable index {name} out of range"));
                    }
                }
                Instr::Jmp { off }
                | Instr::JmpIfFalse { off }
                | Instr::JmpIfTrue { off }
                | Instr::WhenEnd { off }
                | Instr::Try { off } => {
                    // Offsets are two's-complement relative to this pc.
                    let target = pc as i64 + *off as i64;
                    if target < 0 || target >= len {
                        fail(format!("jump target {target} outside code bounds"));
                    }
                }
                Instr::Call { func, argc } => match program.functions.get(*func as usize) {
                    None => fail(format!("CALL: function {func} does not exist")),
                    Some(callee) => {
                        if callee.num_params != *argc {
                            fail(format!(
                                "CALL: function {} takes {} parameters, instruction passes {}",
                                func, callee.num_params, argc
                            ));
                        }
                    }
                },
                _ => {}
            }
        }
    }

    errors
}

/// Verify and return a single error listing every diagnostic.
pub fn verify_or_err(program: &Program) -> Result<()> {
    let errors = verify(program);
    if errors.is_empty() {
        Ok(())
    } else {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Err(anyhow!("program verification failed:\n{}", msgs.join("\n")))
    }
}
