#[macro_use]
extern crate clap;

use clap::Arg;
use flink::{build_library_from_objects, Input, Linker, Options};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::process::exit;

fn main() {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("INPUTS")
                .help("Object files and libraries to link")
                .required(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .takes_value(true)
                .value_name("OUTPUT")
                .required(true)
                .help("Output executable or library"),
        )
        .arg(
            Arg::with_name("relink")
                .short("r")
                .long("relink")
                .help("Mark the output as relinkable"),
        )
        .arg(
            Arg::with_name("incomplete")
                .long("incomplete")
                .help("Allow unresolved symbols"),
        )
        .arg(
            Arg::with_name("lib")
                .long("lib")
                .help("Build a library archive instead of linking"),
        )
        .arg(
            Arg::with_name("debug")
                .long("debug")
                .takes_value(true)
                .value_name("N")
                .help("0 = strip local symbols, 1 = keep, 2 = keep everything"),
        )
        .arg(
            Arg::with_name("hex")
                .long("hex")
                .takes_value(true)
                .value_name("HEXFILE")
                .help("Also write the code as hexadecimal loader ROM lines"),
        )
        .arg(
            Arg::with_name("maxlines")
                .long("maxlines")
                .takes_value(true)
                .value_name("N")
                .help("Words per line in the hex file"),
        )
        .get_matches();

    let mut inputs = Vec::new();
    for name in matches.values_of("INPUTS").unwrap() {
        let path = Path::new(name);
        let mut bytes = Vec::new();
        let read = File::open(path)
            .and_then(|f| BufReader::new(f).read_to_end(&mut bytes).map(|_| ()));
        if let Err(err) = read {
            eprintln!("{}: {}", name, err);
            exit(1);
        }
        inputs.push(Input {
            name: name.to_string(),
            bytes,
        });
    }
    let output = matches.value_of("output").unwrap();

    let bytes = if matches.is_present("lib") {
        match build_library_from_objects(inputs) {
            Ok(bytes) => bytes,
            Err(err) => {
                eprintln!("{}", err);
                exit(1);
            }
        }
    } else {
        let options = Options {
            relinkable: matches.is_present("relink"),
            incomplete_allowed: matches.is_present("incomplete"),
            debug: matches
                .value_of("debug")
                .and_then(|d| d.parse().ok())
                .unwrap_or(0),
        };
        let mut linker = Linker::new(&options);
        let result = linker.link(inputs);
        for e in &linker.errors {
            eprintln!("{}", e);
        }
        let bytes = match result {
            Some(bytes) => bytes,
            None => exit(1),
        };
        if let Some(hex_path) = matches.value_of("hex") {
            let words = matches
                .value_of("maxlines")
                .and_then(|n| n.parse().ok())
                .unwrap_or(4);
            let hex = linker.out.make_hex_buffer(words);
            if let Err(err) = File::create(hex_path)
                .and_then(|f| BufWriter::new(f).write_all(hex.as_bytes()))
            {
                eprintln!("{}: {}", hex_path, err);
                exit(1);
            }
        }
        bytes
    };

    let path = Path::new(output);
    let written = File::create(path)
        .and_then(|f| {
            let mut w = BufWriter::new(f);
            w.write_all(&bytes)
        });
    if let Err(err) = written {
        eprintln!("{}: {}", output, err);
        exit(1);
    }
}
