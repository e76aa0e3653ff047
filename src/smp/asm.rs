use ahash::AHashMap;

use crate::smp::memory::Address;

/// Number of general-purpose registers.
pub const NUM_REGS: usize = 8;

/// Register `JNZ` tests when the shorthand form `JNZ LABEL` is used.
const JNZ_DEFAULT_REG: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Load,
    Store,
    Fmul,
    Fadd,
    Inc,
    Dec,
    Jnz,
    Nop,
    Halt,
}

/// Address operand of `LOAD`/`STORE`: either an immediate byte address or a
/// register holding one (`[Rn]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrOperand {
    Imm(Address),
    Reg(usize),
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub op: OpCode,
    pub rd: usize,
    pub ra: usize,
    pub rb: usize,
    pub addr: AddrOperand,
    pub label: String,
}

impl Default for Instr {
    fn default() -> Self {
        Self {
            op: OpCode::Nop,
            rd: 0,
            ra: 0,
            rb: 0,
            addr: AddrOperand::Imm(0),
            label: String::new(),
        }
    }
}

/// Assembled program: instruction list plus label positions.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub instrs: Vec<Instr>,
    pub labels: AHashMap<String, usize>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }
}

/// Assemble UTF-8 source text. Line comments start with `//` or `#`, labels
/// end in `:`, tokens are separated by whitespace or commas. Malformed
/// instructions degrade to `NOP` with a diagnostic, never an error.
pub fn parse_asm(text: &str) -> Program {
    let mut labels = AHashMap::new();
    let mut cleaned = Vec::new();

    // First pass: strip comments, collect label positions.
    for line in text.lines() {
        let mut line = line;
        if let Some(pos) = line.find("//") {
            line = &line[..pos];
        }
        if let Some(pos) = line.find('#') {
            line = &line[..pos];
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(label) = line.strip_suffix(':') {
            labels.insert(label.trim().to_string(), cleaned.len());
            continue;
        }
        cleaned.push(line.to_string());
    }

    // Second pass: emit instructions.
    let instrs = cleaned.iter().map(|line| instr_from_line(line)).collect();
    let program = Program { instrs, labels };

    for instr in &program.instrs {
        if instr.op == OpCode::Jnz && !program.labels.contains_key(&instr.label) {
            tracing::warn!(label = %instr.label, "JNZ target label not defined, jump will not be taken");
        }
    }
    program
}

fn tokenize(line: &str) -> Vec<&str> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .collect()
}

/// `R0`..`R7`, case-insensitive.
fn register_token(tok: &str) -> Option<usize> {
    let rest = tok.strip_prefix(['R', 'r'])?;
    let r: usize = rest.parse().ok()?;
    (r < NUM_REGS).then_some(r)
}

fn number_token(tok: &str) -> Option<Address> {
    tok.parse().ok()
}

/// `[Rn]` register-indirect or immediate byte address.
fn addr_operand(tok: &str) -> Option<AddrOperand> {
    if let Some(inner) = tok.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        return register_token(inner).map(AddrOperand::Reg);
    }
    number_token(tok).map(AddrOperand::Imm)
}

fn instr_from_line(line: &str) -> Instr {
    let toks = tokenize(line);
    let mut instr = Instr::default();
    let Some(op) = toks.first() else {
        return instr;
    };

    match op.to_ascii_uppercase().as_str() {
        "LOAD" | "STORE" => {
            instr.op = if op.eq_ignore_ascii_case("LOAD") {
                OpCode::Load
            } else {
                OpCode::Store
            };
            let (Some(rd), Some(addr)) = (
                toks.get(1).copied().and_then(register_token),
                toks.get(2).copied().and_then(addr_operand),
            ) else {
                tracing::warn!(line, "malformed memory instruction, degraded to NOP");
                return Instr::default();
            };
            instr.rd = rd;
            instr.addr = addr;
        }
        "FMUL" | "FADD" => {
            instr.op = if op.eq_ignore_ascii_case("FMUL") {
                OpCode::Fmul
            } else {
                OpCode::Fadd
            };
            let regs: Vec<_> = toks
                .iter()
                .skip(1)
                .take(3)
                .filter_map(|t| register_token(t))
                .collect();
            let [rd, ra, rb] = regs.as_slice() else {
                tracing::warn!(line, "malformed arithmetic instruction, degraded to NOP");
                return Instr::default();
            };
            instr.rd = *rd;
            instr.ra = *ra;
            instr.rb = *rb;
        }
        "INC" | "DEC" => {
            instr.op = if op.eq_ignore_ascii_case("INC") {
                OpCode::Inc
            } else {
                OpCode::Dec
            };
            let Some(rd) = toks.get(1).copied().and_then(register_token) else {
                tracing::warn!(line, "malformed register instruction, degraded to NOP");
                return Instr::default();
            };
            instr.rd = rd;
        }
        "JNZ" => {
            instr.op = OpCode::Jnz;
            // Two forms: "JNZ R3, LOOP" and "JNZ LOOP" with an implicit
            // counter register.
            match toks.get(1).copied().and_then(register_token) {
                Some(rd) => {
                    instr.rd = rd;
                    instr.label = toks.get(2).copied().unwrap_or_default().to_string();
                }
                None => {
                    instr.rd = JNZ_DEFAULT_REG;
                    instr.label = toks.get(1).copied().unwrap_or_default().to_string();
                }
            }
            if instr.label.is_empty() {
                tracing::warn!(line, "JNZ without a target label, degraded to NOP");
                return Instr::default();
            }
        }
        "HALT" => instr.op = OpCode::Halt,
        "NOP" => instr.op = OpCode::Nop,
        unknown => {
            tracing::warn!(line, mnemonic = unknown, "unknown mnemonic, degraded to NOP");
        }
    }
    instr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_and_comments() {
        let prog = parse_asm(
            "// header comment\n\
             START:\n\
             NOP # trailing comment\n\
             LOOP:\n\
             DEC R3\n\
             JNZ R3, LOOP\n\
             HALT\n",
        );
        assert_eq!(prog.len(), 4);
        assert_eq!(prog.labels["START"], 0);
        assert_eq!(prog.labels["LOOP"], 1);
        assert_eq!(prog.instrs[3].op, OpCode::Halt);
    }

    #[test]
    fn load_immediate_and_indirect() {
        let prog = parse_asm("LOAD R5, 64\nSTORE R4, [R2]\n");
        assert_eq!(prog.instrs[0].op, OpCode::Load);
        assert_eq!(prog.instrs[0].rd, 5);
        assert_eq!(prog.instrs[0].addr, AddrOperand::Imm(64));
        assert_eq!(prog.instrs[1].op, OpCode::Store);
        assert_eq!(prog.instrs[1].addr, AddrOperand::Reg(2));
    }

    #[test]
    fn arithmetic_three_registers() {
        let prog = parse_asm("FMUL R7, R5, R6\nFADD R4, R4, R7\n");
        let i = &prog.instrs[0];
        assert_eq!((i.op, i.rd, i.ra, i.rb), (OpCode::Fmul, 7, 5, 6));
        let i = &prog.instrs[1];
        assert_eq!((i.op, i.rd, i.ra, i.rb), (OpCode::Fadd, 4, 4, 7));
    }

    #[test]
    fn unknown_mnemonic_degrades_to_nop() {
        let prog = parse_asm("FROB R1, R2\nHALT\n");
        assert_eq!(prog.instrs[0].op, OpCode::Nop);
        assert_eq!(prog.instrs[1].op, OpCode::Halt);
    }

    #[test]
    fn jnz_shorthand_uses_default_register() {
        let prog = parse_asm("LOOP:\nJNZ LOOP\n");
        assert_eq!(prog.instrs[0].op, OpCode::Jnz);
        assert_eq!(prog.instrs[0].rd, 3);
        assert_eq!(prog.instrs[0].label, "LOOP");
    }

    #[test]
    fn bad_register_degrades_to_nop() {
        let prog = parse_asm("LOAD R9, 0\nINC\n");
        assert_eq!(prog.instrs[0].op, OpCode::Nop);
        assert_eq!(prog.instrs[1].op, OpCode::Nop);
    }

    #[test]
    fn case_insensitive_mnemonics_and_registers() {
        let prog = parse_asm("load r1, 8\nhalt\n");
        assert_eq!(prog.instrs[0].op, OpCode::Load);
        assert_eq!(prog.instrs[0].rd, 1);
        assert_eq!(prog.instrs[1].op, OpCode::Halt);
    }
}
