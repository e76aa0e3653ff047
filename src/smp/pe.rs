use std::fmt::Write as _;
use std::sync::Arc;

use crate::smp::asm::{AddrOperand, Instr, OpCode, Program, NUM_REGS};
use crate::smp::cache::DataPort;
use crate::smp::memory::{Address, WORD_BYTES};

#[derive(Debug, Default, Clone, Copy)]
pub struct PeStats {
    pub loads: u64,
    pub stores: u64,
}

/// Processing element: a small register machine driving its private data
/// port. Registers hold raw doubles and are reinterpreted as integers for
/// addresses and counters.
pub struct ProcessingElement {
    id: usize,
    port: Arc<dyn DataPort>,
    pc: usize,
    halted: bool,
    regs: [f64; NUM_REGS],
    program: Program,
    pub stats: PeStats,
}

impl ProcessingElement {
    pub fn new(id: usize, port: Arc<dyn DataPort>) -> Self {
        Self {
            id,
            port,
            pc: 0,
            halted: false,
            regs: [0.0; NUM_REGS],
            program: Program::default(),
            stats: PeStats::default(),
        }
    }

    pub fn pe_id(&self) -> usize {
        self.id
    }

    pub fn load_program(&mut self, program: Program) {
        self.program = program;
        self.pc = 0;
        self.halted = false;
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
        self.halted = false;
    }

    pub fn is_halted(&self) -> bool {
        self.halted || self.pc >= self.program.len()
    }

    pub fn reg_f64(&self, r: usize) -> f64 {
        self.regs[r]
    }

    pub fn set_reg_f64(&mut self, r: usize, v: f64) {
        self.regs[r] = v;
    }

    pub fn reg_i64(&self, r: usize) -> i64 {
        self.regs[r] as i64
    }

    pub fn set_reg_i64(&mut self, r: usize, v: i64) {
        self.regs[r] = v as f64;
    }

    /// Fetch, dispatch and advance the program counter. Jumps overwrite the
    /// computed successor so execution continues at the target.
    pub fn step(&mut self) {
        if self.is_halted() {
            self.halted = true;
            return;
        }
        let instr = self.program.instrs[self.pc].clone();
        let mut next_pc = self.pc + 1;
        match instr.op {
            OpCode::Load => self.exec_load(&instr),
            OpCode::Store => self.exec_store(&instr),
            OpCode::Fmul => {
                self.regs[instr.rd] = self.regs[instr.ra] * self.regs[instr.rb];
            }
            OpCode::Fadd => {
                self.regs[instr.rd] = self.regs[instr.ra] + self.regs[instr.rb];
            }
            OpCode::Inc => {
                // Pointers step over doubles.
                self.set_reg_i64(instr.rd, self.reg_i64(instr.rd) + WORD_BYTES as i64);
            }
            OpCode::Dec => {
                self.set_reg_i64(instr.rd, self.reg_i64(instr.rd) - 1);
            }
            OpCode::Jnz => {
                if self.reg_i64(instr.rd) != 0 {
                    if let Some(&target) = self.program.labels.get(&instr.label) {
                        next_pc = target;
                    } else {
                        tracing::warn!(pe = self.id, label = %instr.label, "unknown JNZ label, not taken");
                    }
                }
            }
            OpCode::Nop => {}
            OpCode::Halt => self.halted = true,
        }
        self.pc = next_pc;
    }

    /// Execute until `HALT` or the end of the program.
    pub fn run(&mut self) {
        tracing::info!(pe = self.id, "run start");
        let mut steps: u64 = 0;
        while !self.is_halted() {
            self.step();
            steps += 1;
            if steps % 100_000 == 0 {
                tracing::info!(pe = self.id, pc = self.pc, steps, "still running");
            }
        }
        tracing::info!(pe = self.id, pc = self.pc, steps, "run end");
    }

    fn operand_addr(&self, instr: &Instr) -> Address {
        match instr.addr {
            AddrOperand::Imm(addr) => addr,
            AddrOperand::Reg(r) => self.reg_i64(r) as Address,
        }
    }

    fn exec_load(&mut self, instr: &Instr) {
        let addr = self.operand_addr(instr);
        self.warn_if_unaligned(addr, instr);
        match self.port.load_double(addr) {
            Ok(v) => {
                self.regs[instr.rd] = v;
                self.stats.loads += 1;
            }
            Err(e) => {
                tracing::error!(pe = self.id, pc = self.pc, addr, error = %e, "load failed, halting");
                self.halted = true;
            }
        }
    }

    fn exec_store(&mut self, instr: &Instr) {
        let addr = self.operand_addr(instr);
        self.warn_if_unaligned(addr, instr);
        match self.port.store_double(addr, self.regs[instr.rd]) {
            Ok(()) => self.stats.stores += 1,
            Err(e) => {
                tracing::error!(pe = self.id, pc = self.pc, addr, error = %e, "store failed, halting");
                self.halted = true;
            }
        }
    }

    fn warn_if_unaligned(&self, addr: Address, instr: &Instr) {
        if addr % WORD_BYTES as u64 != 0 {
            tracing::warn!(
                pe = self.id,
                pc = self.pc,
                addr,
                rd = instr.rd,
                "access not 8B-aligned"
            );
        }
    }

    pub fn dump_regs(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "[PE{}] PC={} HALT={}",
            self.id,
            self.pc,
            self.is_halted()
        );
        for (i, v) in self.regs.iter().enumerate() {
            let _ = writeln!(out, "  R{i} = {v}");
        }
        out
    }
}
