#[macro_use]
extern crate clap;

use clap::Arg;
use fasm::assembler::Options;
use felf::elf::ET_REL;
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::exit;

#[derive(Debug)]
enum Error {
    Io(std::io::Error, PathBuf),
    Assemble(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err, path) => writeln!(f, "{}: {}", path.display(), err),
            Error::Assemble(text) => write!(f, "{}", text),
        }
    }
}

fn main() {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("INPUT")
                .help("Input file: assembly source, or object file with -d")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .takes_value(true)
                .value_name("OUTPUT")
                .help("Output file"),
        )
        .arg(
            Arg::with_name("disassemble")
                .short("d")
                .long("disassemble")
                .help("Disassemble an object or executable file"),
        )
        .arg(
            Arg::with_name("optimize")
                .short("O")
                .long("optimize")
                .takes_value(true)
                .value_name("N")
                .help("Optimization level (0 or 1)"),
        )
        .arg(
            Arg::with_name("debug")
                .long("debug")
                .takes_value(true)
                .value_name("N")
                .help("0 = strip local symbols, 1 = keep, 2 = keep everything"),
        )
        .get_matches();

    let input = matches.value_of("INPUT").unwrap();
    let output = matches.value_of("output");
    let mut options = Options::default();
    if let Some(o) = matches.value_of("optimize") {
        options.optimize = o.parse().unwrap_or(1);
    }
    if let Some(d) = matches.value_of("debug") {
        options.debug = d.parse().unwrap_or(0);
    }

    let result = if matches.is_present("disassemble") {
        disassemble_file(input, output)
    } else {
        assemble_file(input, output, &options)
    };
    if let Err(err) = result {
        eprintln!("{}", err);
        exit(1);
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path).map_err(|e| Error::Io(e, path.to_owned()))?)
        .read_to_end(&mut bytes)
        .map_err(|e| Error::Io(e, path.to_owned()))?;
    Ok(bytes)
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    BufWriter::new(File::create(path).map_err(|e| Error::Io(e, path.to_owned()))?)
        .write_all(bytes)
        .map_err(|e| Error::Io(e, path.to_owned()))
}

fn assemble_file(input: &str, output: Option<&str>, options: &Options) -> Result<(), Error> {
    let input_path = Path::new(input);
    let bytes = read_input(input_path)?;
    let source = String::from_utf8_lossy(&bytes);

    let (mut container, errors) =
        fasm::assemble_with(&source, options).map_err(Error::Assemble)?;
    for d in &errors.diagnostics {
        eprintln!("{}:{}: {}", input, d.line, d.code.text());
    }
    if errors.has_errors() {
        return Err(Error::Assemble(format!(
            "{} errors, no output written",
            errors.error_count()
        )));
    }

    let output_path: PathBuf = output
        .map(PathBuf::from)
        .unwrap_or_else(|| input_path.with_extension("ob"));
    write_output(&output_path, &container.join(ET_REL))
}

fn disassemble_file(input: &str, output: Option<&str>) -> Result<(), Error> {
    let input_path = Path::new(input);
    let bytes = read_input(input_path)?;
    let listing = fasm::disassemble(&bytes).map_err(Error::Assemble)?;
    match output {
        Some(path) => write_output(Path::new(path), listing.as_bytes()),
        None => {
            print!("{}", listing);
            Ok(())
        }
    }
}
