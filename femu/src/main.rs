//! Load a ForwardCom executable and execute it step by step.
//!
//! The program headers are mapped into a flat memory image with their access
//! rights; execution starts at the entry point and ends when the program
//! returns to it with an empty call stack, exits through a system call, or
//! traps.

#[macro_use]
extern crate clap;

use clap::Arg;
use fcpu::emulator::{
    Interrupt, Machine, Memory, StepResult, ACCESS_EXEC, ACCESS_READ, ACCESS_WRITE,
};
use fcpu::registers::{REG_DATAP, REG_INDEX, REG_THREADP};
use felf::elf::{SHF_EXEC, SHF_READ, SHF_WRITE};
use felf::Container;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;
use std::process::exit;

fn main() {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("EXEFILE")
                .help("Executable file to emulate")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Print a line per executed instruction"),
        )
        .arg(
            Arg::with_name("maxsteps")
                .long("maxsteps")
                .takes_value(true)
                .value_name("N")
                .help("Stop after N instructions"),
        )
        .get_matches();

    let input = matches.value_of("EXEFILE").unwrap();
    let verbose = matches.is_present("verbose");
    let max_steps: u64 = matches
        .value_of("maxsteps")
        .and_then(|n| n.parse().ok())
        .unwrap_or(1_000_000);

    let mut bytes = Vec::new();
    let read = File::open(Path::new(input))
        .and_then(|f| BufReader::new(f).read_to_end(&mut bytes).map(|_| ()));
    if let Err(err) = read {
        eprintln!("{}: {}", input, err);
        exit(1);
    }

    let exe = match Container::read(&bytes) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", input, e);
            exit(1);
        }
    };

    let mut machine = load_machine(&exe, &bytes);
    let status = run(&mut machine, max_steps, verbose);
    exit(status);
}

/// Map the program headers into emulator memory.
fn load_machine(exe: &Container, bytes: &[u8]) -> Machine {
    let mut top: u64 = 0x1_0000;
    for ph in &exe.program_headers {
        top = top.max(ph.p_vaddr + ph.p_memsz);
    }
    // leave room for a call and data stack above the image
    let mut memory = Memory::new(top + 0x1_0000);
    memory.map_range(top, top + 0x1_0000, ACCESS_READ | ACCESS_WRITE);
    for ph in &exe.program_headers {
        let mut access = 0;
        if ph.p_flags & SHF_READ as u32 != 0 {
            access |= ACCESS_READ;
        }
        if ph.p_flags & SHF_WRITE as u32 != 0 {
            access |= ACCESS_WRITE;
        }
        if ph.p_flags & SHF_EXEC as u32 != 0 {
            access |= ACCESS_EXEC;
        }
        memory.map_range(ph.p_vaddr, ph.p_vaddr + ph.p_memsz, access);
        if ph.p_filesz > 0 {
            let start = ph.p_offset as usize;
            memory.load(ph.p_vaddr, &bytes[start..start + ph.p_filesz as usize]);
        }
    }
    let mut machine = Machine::new(memory);
    machine.ip = exe.file_header.e_entry;
    machine.entry_point = exe.file_header.e_entry;
    machine.registers[(REG_DATAP & REG_INDEX) as usize] = exe.file_header.e_datap_base;
    machine.registers[(REG_THREADP & REG_INDEX) as usize] = exe.file_header.e_threadp_base;
    machine.registers[31] = top + 0x1_0000; // stack pointer at the top
    machine
}

fn run(machine: &mut Machine, max_steps: u64, verbose: bool) -> i32 {
    for step in 0..max_steps {
        let ip_before = machine.ip;
        match machine.step() {
            Ok(StepResult::Running) => {
                if verbose {
                    println!(
                        "{:6} {:08X}: op {:2} {}",
                        step,
                        ip_before,
                        machine.op,
                        if machine.return_type & 0x2000 != 0 {
                            "taken"
                        } else {
                            ""
                        }
                    );
                }
            }
            Ok(StepResult::Finished) => {
                println!("program finished, r0 = {}", machine.registers[0]);
                return 0;
            }
            Ok(StepResult::Exit(status)) => {
                println!("program exited with status {}", status);
                return status as i32;
            }
            Err(Interrupt::Trap(code)) => {
                eprintln!("trap {:#X} at {:#X}", code, ip_before);
                return 2;
            }
            Err(interrupt) => {
                eprintln!("{} at {:#X}", interrupt, ip_before);
                return 2;
            }
        }
    }
    eprintln!("step limit reached");
    1
}
