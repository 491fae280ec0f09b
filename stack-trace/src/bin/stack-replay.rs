use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};

use stack_trace::{DebugInfo, InstructionKind, StackTracer};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Replays a log of stack-relevant instructions and prints the reconstructed stacks.
///
/// Each input line is a JSON object such as
/// `{"pc": 3, "sp": 64395, "kind": "allocate", "writes": [[64395, 0], [64396, 7]]}`.
/// `writes` is optional and lists bytes stored by the instruction, used to render slot values.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Debug info produced by the assembler, as JSON.
    #[arg(short, long)]
    debug_info: Option<String>,

    /// Input file or '-' to use stdin.
    #[arg(short, long, default_value_t = String::from("-"))]
    input: String,

    /// Output file or '-' to use stdout.
    #[arg(short, long, default_value_t = String::from("-"))]
    output: String,

    /// Print the stacks after every instruction instead of only at the end.
    #[arg(short, long)]
    each: bool,

    /// Verbosity level for logging.
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Deserialize)]
struct Step {
    pc: u16,
    sp: u32,
    kind: InstructionKind,
    #[serde(default)]
    writes: Vec<(u32, u8)>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .with_env_var("TA_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut tracer = match &args.debug_info {
        Some(path) => {
            let file = fs::File::open(path).with_context(|| format!("opening {path}"))?;
            let info = DebugInfo::from_reader(BufReader::new(file))
                .with_context(|| format!("loading debug info from {path}"))?;
            StackTracer::with_debug_info(info)
        }
        None => StackTracer::new(),
    };

    let input = BufReader::new(open_input(args.input.as_str())?);
    let mut output = open_output(args.output.as_str())?;

    let mut memory: HashMap<u32, u8> = HashMap::new();
    let mut unclean: u32 = 0;
    for (number, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let step: Step = serde_json::from_str(&line)
            .with_context(|| format!("line {}: malformed instruction", number + 1))?;
        memory.extend(step.writes.iter().copied());

        let outcome = tracer.notify_instruction(step.pc, step.sp, step.kind);
        for diagnostic in &outcome.diagnostics {
            writeln!(output, "{:04x}: {diagnostic}", step.pc)?;
        }
        if !outcome.is_clean() {
            unclean += 1;
        }
        if args.each {
            writeln!(output, "{:04x} {:?} sp={:04x}", step.pc, step.kind, step.sp)?;
            print_stacks(&mut output, &tracer, &memory)?;
        }
    }

    if !args.each {
        print_stacks(&mut output, &tracer, &memory)?;
    }
    if unclean > 0 {
        eprintln!("{unclean} instructions disagreed with the model");
    }

    Ok(())
}

fn print_stacks(
    output: &mut dyn Write,
    tracer: &StackTracer,
    memory: &HashMap<u32, u8>,
) -> io::Result<()> {
    let read = |address: u32| memory.get(&address).copied().unwrap_or(0);
    for (index, stack) in tracer.stacks().iter().enumerate() {
        let marker = if tracer.active() == Some(index) { '*' } else { ' ' };
        writeln!(
            output,
            "{marker}stack {index} base={:04x} sp={:04x}",
            stack.base_address(),
            stack.sp()
        )?;
        for line in stack.render_lines(2, &read) {
            writeln!(output, "{line}")?;
        }
    }
    Ok(())
}

fn open_input(input: &str) -> io::Result<Box<dyn Read>> {
    if input == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    Ok(Box::new(fs::File::open(input)?))
}

fn open_output(output: &str) -> io::Result<Box<dyn Write>> {
    if output == "-" {
        return Ok(Box::new(io::stdout().lock()));
    }
    Ok(Box::new(fs::File::create(output)?))
}
