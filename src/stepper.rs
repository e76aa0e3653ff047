use std::io::{self, BufRead, Write};

use ahash::AHashSet;

use crate::smp::system::System;

/// Safety bound on `cont` so a runaway loop cannot wedge the REPL.
const MAX_CONT_STEPS: u64 = 10_000;

const HELP: &str = "\
Commands:
  help                       - this help
  step [N]                   - advance N global round-robin steps (default 1)
  stepi <pe> [N]             - advance N steps on one PE (default 1)
  cont                       - run until all halt or a breakpoint, then flush and show results
  run                        - run concurrently, one thread per PE, then flush and show results
  regs [pe]                  - dump registers (all PEs if omitted)
  pc [pe]                    - dump program counters
  mem <addr> [count]         - print count doubles starting at byte addr (hex or dec, default 8)
  cache <pe>                 - dump one cache's lines
  stats                      - per-cache and memory counters
  break <pe> <pc>            - set a breakpoint
  clear <pe> <pc>            - remove a breakpoint
  breaks                     - list breakpoints
  status                     - PC, halt flag and registers of every PE
  quit                       - flush and exit";

/// Interactive single-step driver over a [`System`]: breakpoints,
/// inspection, cooperative round-robin stepping and threaded runs.
pub struct Stepper {
    system: System,
    breakpoints: AHashSet<(usize, usize)>,
}

impl Stepper {
    pub fn new(system: System) -> Self {
        Self {
            system,
            breakpoints: AHashSet::new(),
        }
    }

    pub fn repl(&mut self) -> io::Result<()> {
        println!("Stepper ready. PEs={}", self.system.config.num_pes);
        println!("{HELP}");
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("stepper> ");
            io::stdout().flush()?;
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            if !self.dispatch(line.trim()) {
                break;
            }
        }
        if let Err(e) = self.system.flush_caches() {
            println!("flush failed: {e}");
        }
        println!("leaving stepper");
        Ok(())
    }

    /// Returns `false` when the REPL should exit.
    fn dispatch(&mut self, line: &str) -> bool {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(cmd) = tokens.first() else {
            return true;
        };
        match cmd.to_ascii_lowercase().as_str() {
            "help" | "h" | "?" => println!("{HELP}"),
            "quit" | "q" | "exit" => return false,
            "step" | "s" => {
                let n = tokens.get(1).and_then(|t| parse_u64(t)).unwrap_or(1);
                self.step_round_robin(n);
            }
            "stepi" => match self.parse_pe(tokens.get(1)) {
                Some(pe) => {
                    let n = tokens.get(2).and_then(|t| parse_u64(t)).unwrap_or(1);
                    self.step_single(pe, n);
                }
                None => println!("usage: stepi <pe> [N]"),
            },
            "cont" | "c" | "continue" => self.cont(),
            "run" | "r" => self.run_threads(),
            "regs" => match tokens.get(1) {
                Some(tok) => match self.parse_pe(Some(tok)) {
                    Some(pe) => print!("{}", self.system.pes[pe].lock().unwrap().dump_regs()),
                    None => println!("invalid pe"),
                },
                None => {
                    for pe in &self.system.pes {
                        print!("{}", pe.lock().unwrap().dump_regs());
                    }
                }
            },
            "pc" => match tokens.get(1) {
                Some(tok) => match self.parse_pe(Some(tok)) {
                    Some(pe) => self.print_pc(pe),
                    None => println!("invalid pe"),
                },
                None => {
                    for pe in 0..self.system.pes.len() {
                        self.print_pc(pe);
                    }
                }
            },
            "mem" => {
                let Some(addr) = tokens.get(1).and_then(|t| parse_u64(t)) else {
                    println!("usage: mem <addr> [count]");
                    return true;
                };
                let count = tokens.get(2).and_then(|t| parse_u64(t)).unwrap_or(8);
                self.print_mem(addr, count);
            }
            "cache" => match self.parse_pe(tokens.get(1)) {
                Some(pe) => print!("{}", self.system.caches[pe].dump()),
                None => println!("usage: cache <pe>"),
            },
            "stats" => {
                for cache in &self.system.caches {
                    println!("PE{}: {}", cache.pe_id(), cache.stats());
                }
                println!("memory: {}", self.system.mem.stats());
            }
            "break" | "b" => match (self.parse_pe(tokens.get(1)), tokens.get(2).and_then(|t| parse_u64(t))) {
                (Some(pe), Some(pc)) => {
                    self.breakpoints.insert((pe, pc as usize));
                    println!("breakpoint added at PE{pe} PC={pc}");
                }
                _ => println!("usage: break <pe> <pc>"),
            },
            "clear" => match (self.parse_pe(tokens.get(1)), tokens.get(2).and_then(|t| parse_u64(t))) {
                (Some(pe), Some(pc)) => {
                    self.breakpoints.remove(&(pe, pc as usize));
                    println!("breakpoint removed");
                }
                _ => println!("usage: clear <pe> <pc>"),
            },
            "breaks" => {
                if self.breakpoints.is_empty() {
                    println!("no active breakpoints");
                } else {
                    for (pe, pc) in &self.breakpoints {
                        println!("  PE{pe} PC={pc}");
                    }
                }
            }
            "status" | "st" => {
                for pe in &self.system.pes {
                    print!("{}", pe.lock().unwrap().dump_regs());
                }
            }
            _ => println!("unknown command, try 'help'"),
        }
        true
    }

    fn parse_pe(&self, token: Option<&&str>) -> Option<usize> {
        let pe = token.and_then(|t| parse_u64(t))? as usize;
        (pe < self.system.pes.len()).then_some(pe)
    }

    fn hit_breakpoint(&self) -> bool {
        self.system.pes.iter().any(|pe| {
            let pe = pe.lock().unwrap();
            self.breakpoints.contains(&(pe.pe_id(), pe.pc()))
        })
    }

    /// One round advances every non-halted PE by one instruction.
    fn step_round_robin(&mut self, rounds: u64) {
        for _ in 0..rounds {
            let mut advanced = false;
            for pe in &self.system.pes {
                let mut pe = pe.lock().unwrap();
                if !pe.is_halted() {
                    pe.step();
                    advanced = true;
                    drop(pe);
                    if self.hit_breakpoint() {
                        println!("breakpoint hit");
                        return;
                    }
                }
            }
            if !advanced {
                println!("all PEs halted");
                return;
            }
        }
    }

    fn step_single(&mut self, pe_id: usize, steps: u64) {
        for _ in 0..steps {
            {
                let mut pe = self.system.pes[pe_id].lock().unwrap();
                if pe.is_halted() {
                    println!("PE{pe_id} halted");
                    return;
                }
                pe.step();
            }
            if self.hit_breakpoint() {
                println!("breakpoint hit");
                return;
            }
        }
    }

    /// Cooperative round-robin until everything halts, a breakpoint fires
    /// or the safety bound trips.
    fn cont(&mut self) {
        let mut steps: u64 = 0;
        'outer: while self.system.any_running() && steps < MAX_CONT_STEPS {
            let mut advanced = false;
            for pe in &self.system.pes {
                let mut pe = pe.lock().unwrap();
                if !pe.is_halted() {
                    pe.step();
                    steps += 1;
                    advanced = true;
                }
            }
            if !advanced || self.hit_breakpoint() {
                break 'outer;
            }
            if steps % 1000 == 0 {
                println!("continuing... steps: {steps}");
            }
        }
        if steps >= MAX_CONT_STEPS {
            println!("WARNING: safety bound of {MAX_CONT_STEPS} steps reached");
        }
        self.show_results();
    }

    /// One OS thread per PE, then flush and report.
    fn run_threads(&mut self) {
        println!("running with one thread per PE...");
        if let Err(e) = self.system.run() {
            println!("run failed: {e}");
            return;
        }
        self.show_results();
    }

    fn show_results(&mut self) {
        if let Err(e) = self.system.flush_caches() {
            println!("flush failed: {e}");
            return;
        }
        let (total, expected) = match (self.system.reduce(), self.system.expected()) {
            (Ok(t), Ok(e)) => (t, e),
            (Err(e), _) | (_, Err(e)) => {
                println!("result readback failed: {e}");
                return;
            }
        };
        println!("\n=== RESULTS ===");
        print!("partial sums: ");
        for pe in 0..self.system.layout.p {
            match self.system.mem.load_f64(self.system.layout.s_addr(pe)) {
                Ok(v) => print!("S[{pe}]={v} "),
                Err(e) => print!("S[{pe}]=<{e}> "),
            }
        }
        println!();
        println!("dot product computed: {total}");
        println!("dot product expected: {expected}");
        println!(
            "correct? {}",
            if (total - expected).abs() < 1e-10 {
                "YES"
            } else {
                "NO"
            }
        );
    }

    fn print_pc(&self, pe_id: usize) {
        let pe = self.system.pes[pe_id].lock().unwrap();
        println!("[PE{}] PC={} HALT={}", pe.pe_id(), pe.pc(), pe.is_halted());
    }

    fn print_mem(&self, addr: u64, count: u64) {
        for i in 0..count {
            let a = addr + i * 8;
            match self.system.mem.load_f64(a) {
                Ok(v) => println!("M[{}] @{a:#x} = {v}", a / 8),
                Err(e) => {
                    println!("mem read failed at {a:#x}: {e}");
                    break;
                }
            }
        }
    }
}

fn parse_u64(token: &str) -> Option<u64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}
