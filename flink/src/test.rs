use crate::{Input, Linker, Options};
use fcpu::emulator::{Machine, Memory, StepResult, ACCESS_EXEC, ACCESS_READ, ACCESS_WRITE};
use felf::elf::*;
use felf::Container;

fn object(name: &str, source: &str) -> Input {
    let mut c = fasm::assemble(source).expect("assembly failed");
    Input {
        name: name.to_string(),
        bytes: c.join(ET_REL),
    }
}

fn link_ok(inputs: Vec<Input>) -> (Vec<u8>, Linker) {
    let mut linker = Linker::new(&Options::default());
    let bytes = linker.link(inputs);
    assert!(
        bytes.is_some(),
        "{:?}",
        linker.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>()
    );
    (bytes.unwrap(), linker)
}

/// Map an executable into emulator memory by its program headers.
fn load_machine(bytes: &[u8]) -> Machine {
    let exe = Container::read(bytes).expect("bad executable");
    let header = exe.file_header;
    let mut top: u64 = 0x1_0000;
    for ph in &exe.program_headers {
        top = top.max(ph.p_vaddr + ph.p_memsz);
    }
    let mut memory = Memory::new(top + 0x1000);
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
    machine.ip = header.e_entry;
    machine.entry_point = header.e_entry;
    machine.registers[29] = header.e_datap_base;
    machine.registers[28] = header.e_threadp_base;
    machine
}

const MAIN_SOURCE: &str = "\
extern helper: function
code section execute ip
entry:
 int64 r1 = move(11)
 call helper
 return
code end
public entry: function
public __entry_point: constant
__entry_point = 0
";

const HELPER_SOURCE: &str = "\
code section execute ip
helper:
 int64 r1 = add(r1, 31)
 return
code end
public helper: function
";

// a main module whose entry point is found by name instead of the
// __entry_point constant
const SIMPLE_MAIN: &str = "\
code section execute ip
entry:
 int64 r1 = move(11)
 return
code end
public entry: function
";

#[test]
fn two_modules_link_and_run() {
    let (bytes, linker) = link_ok(vec![
        object("main.ob", SIMPLE_MAIN),
        object("helper.ob", HELPER_SOURCE),
    ]);
    assert!(!linker.has_errors());
    let exe = Container::read(&bytes).unwrap();
    assert_eq!(exe.file_header.e_type, ET_EXEC);
    // the executable has program headers covering code
    assert!(!exe.program_headers.is_empty());

    let mut machine = load_machine(&bytes);
    machine.ip = linker
        .exports
        .iter()
        .find(|e| e.name == "entry")
        .map(|e| {
            let m = &linker.modules[e.module as usize];
            let sym = m.symbols[e.symindex as usize];
            m.section_headers[sym.st_section as usize].sh_addr + sym.st_value
        })
        .unwrap();
    machine.entry_point = machine.ip;
    let r = machine.run(100).unwrap();
    assert_eq!(r, StepResult::Finished);
    assert_eq!(machine.registers[1], 11);
}

#[test]
fn cross_module_call_is_patched() {
    let (bytes, _linker) = link_ok(vec![
        object("main.ob", MAIN_SOURCE),
        object("helper.ob", HELPER_SOURCE),
    ]);
    let mut machine = load_machine(&bytes);
    // __entry_point was defined as constant 0: the entry is the first code
    // address, which is the start of the main module
    let exe = Container::read(&bytes).unwrap();
    let code_addr = exe
        .section_headers
        .iter()
        .find(|s| s.sh_flags & SHF_EXEC != 0)
        .map(|s| s.sh_addr)
        .unwrap();
    machine.ip = code_addr;
    machine.entry_point = code_addr;
    let r = machine.run(100).unwrap();
    assert_eq!(r, StepResult::Finished);
    // the call reached the helper in the other module
    assert_eq!(machine.registers[1], 42);
    assert_eq!(machine.call_depth_max, 1);
}

#[test]
fn base_pointer_boundaries() {
    let source = "\
const section read ip
table: int32 1, 2, 3, 4
const end
code section execute ip
entry:
 return
code end
data section read write datap
var: int64 7
data end
bss section read write uninitialized datap
scratch: int64 0
bss end
public entry: function
";
    let (bytes, linker) = link_ok(vec![object("m.ob", source)]);
    let exe = Container::read(&bytes).unwrap();
    // every ip const section lies below the ip base, every executable
    // section at or above it
    for sh in exe.section_headers.iter().skip(1) {
        if sh.sh_flags & SHF_IP != 0 && sh.sh_flags & SHF_ALLOC != 0 {
            if sh.sh_flags & SHF_EXEC != 0 {
                assert!(sh.sh_addr >= exe.file_header.e_ip_base);
            } else {
                assert!(sh.sh_addr < exe.file_header.e_ip_base);
            }
        }
        if sh.sh_flags & SHF_DATAP != 0 {
            if sh.sh_type == SHT_NOBITS {
                assert!(sh.sh_addr >= exe.file_header.e_datap_base);
            } else {
                assert!(sh.sh_addr < exe.file_header.e_datap_base);
            }
        }
    }
    assert!(!linker.has_errors());
}

#[test]
fn library_search_pulls_needed_members() {
    let helper = object("helper.ob", HELPER_SOURCE);
    let unused = object(
        "unused.ob",
        "code section execute ip\nother:\n return\ncode end\npublic other: function\n",
    );
    let lib_bytes =
        crate::build_library_from_objects(vec![helper, unused]).expect("library build");
    let (bytes, linker) = link_ok(vec![
        object("main.ob", MAIN_SOURCE),
        Input {
            name: "support.li".to_string(),
            bytes: lib_bytes,
        },
    ]);
    // only the needed member was pulled in
    assert!(linker.modules.iter().any(|m| m.module_name == "helper.ob"));
    assert!(!linker.modules.iter().any(|m| m.module_name == "unused.ob"));
    let exe = Container::read(&bytes).unwrap();
    assert_eq!(exe.file_header.e_type, ET_EXEC);
}

#[test]
fn unresolved_strong_import_is_an_error() {
    let mut linker = Linker::new(&Options::default());
    let result = linker.link(vec![object("main.ob", MAIN_SOURCE)]);
    assert!(result.is_none());
    assert!(linker
        .errors
        .iter()
        .any(|e| matches!(e, crate::LinkError::Unresolved { symbol, .. } if symbol == "helper")));
}

#[test]
fn unresolved_weak_import_gets_a_dummy() {
    let source = "\
extern maybe: weak, function
code section execute ip
entry:
 call maybe
 return
code end
public entry: function
";
    let (bytes, linker) = link_ok(vec![object("m.ob", source)]);
    assert!(!linker.has_errors());
    let exe = Container::read(&bytes).unwrap();
    // the dummy function section exists and is executable
    let dummy = exe
        .section_headers
        .iter()
        .find(|s| exe.sh_strings.get(s.sh_name) == "zdummyfunc")
        .expect("dummy function section");
    assert_ne!(dummy.sh_flags & SHF_EXEC, 0);
    assert_ne!(dummy.sh_flags & SHF_AUTOGEN, 0);

    // calling through the dummy returns without clobbering anything else
    let entry = exe
        .section_headers
        .iter()
        .find(|s| s.sh_flags & SHF_EXEC != 0)
        .map(|s| s.sh_addr)
        .unwrap();
    let mut machine = load_machine(&bytes);
    machine.ip = entry;
    machine.entry_point = entry;
    let r = machine.run(100).unwrap();
    assert_eq!(r, StepResult::Finished);
}

#[test]
fn communal_sections_keep_the_largest() {
    let a = "\
hot section read ip communal
hot_data: int32 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16
hot end
code section execute ip
entry:
 return
code end
public entry: function
public hot_data
";
    let b = "\
hot section read ip communal
hot_data2: int32 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24
hot end
code section execute ip
entry2:
 int64 r1 = move([hot_data2])
 return
code end
public entry2: function
public hot_data2
";
    let main = "\
extern entry: function
extern entry2: function
code section execute ip
start:
 call entry
 call entry2
 return
code end
public start: function
";
    let (bytes, linker) = link_ok(vec![
        object("main.ob", main),
        object("a.ob", a),
        object("b.ob", b),
    ]);
    // size mismatch is reported as a warning, not an error
    assert!(linker
        .errors
        .iter()
        .any(|e| matches!(e, crate::LinkError::Communal { section, .. } if section == "hot")));
    assert!(!linker.has_errors());
    // exactly one hot section in the output, the larger one
    let exe = Container::read(&bytes).unwrap();
    let hots: Vec<_> = exe
        .section_headers
        .iter()
        .filter(|s| exe.sh_strings.get(s.sh_name) == "hot")
        .collect();
    assert_eq!(hots.len(), 1);
    assert_eq!(hots[0].sh_size, 96);
}

#[test]
fn duplicate_strong_symbols_are_rejected() {
    let a = "code section execute ip\nsame:\n return\ncode end\npublic same: function\n";
    let mut linker = Linker::new(&Options::default());
    let result = linker.link(vec![object("a.ob", a), object("b.ob", a)]);
    assert!(result.is_none());
    assert!(linker
        .errors
        .iter()
        .any(|e| matches!(e, crate::LinkError::DuplicateSymbol { symbol, .. } if symbol == "same")));
}

#[test]
fn weak_symbol_loses_to_strong() {
    let strong = "\
code section execute ip
value_of:
 int64 r1 = move(1)
 return
code end
public value_of: function
";
    let weak = "\
code section execute ip
value_of:
 int64 r1 = move(2)
 return
code end
public value_of: weak, function
";
    let user = "\
extern value_of: function
code section execute ip
start:
 call value_of
 return
code end
public start: function
";
    let (bytes, linker) = link_ok(vec![
        object("user.ob", user),
        object("weak.ob", weak),
        object("strong.ob", strong),
    ]);
    assert!(!linker.has_errors());
    let exe = Container::read(&bytes).unwrap();
    let entry = exe
        .section_headers
        .iter()
        .find(|s| s.sh_flags & SHF_EXEC != 0)
        .map(|s| s.sh_addr)
        .unwrap();
    let mut machine = load_machine(&bytes);
    machine.ip = entry;
    machine.entry_point = entry;
    machine.run(100).unwrap();
    assert_eq!(machine.registers[1], 1); // the strong definition won
}

#[test]
fn datap_reference_through_base_pointer() {
    let source = "\
data section read write datap
counter: int64 5
data end
code section execute ip
entry:
 int64 r1 = move([counter])
 int64 r1 = add(r1, 1)
 int64 [counter] = r1
 int64 r2 = move([counter])
 return
code end
public entry: function
";
    let (bytes, linker) = link_ok(vec![object("m.ob", source)]);
    assert!(!linker.has_errors());
    let exe = Container::read(&bytes).unwrap();
    let entry = exe
        .section_headers
        .iter()
        .find(|s| s.sh_flags & SHF_EXEC != 0)
        .map(|s| s.sh_addr)
        .unwrap();
    let mut machine = load_machine(&bytes);
    machine.ip = entry;
    machine.entry_point = entry;
    let r = machine.run(100).unwrap();
    assert_eq!(r, StepResult::Finished);
    assert_eq!(machine.registers[1], 6);
    assert_eq!(machine.registers[2], 6);
}
