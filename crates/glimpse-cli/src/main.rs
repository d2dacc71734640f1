use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};

use glimpse::host::RunCoordinator;
use glimpse::protocol::{Decoration, RunPhase};
use glimpse::render::{build_decorations, stack_by_line};
use glimpse::runtime::{ConsoleLevel, ConsoleSink, spawn_sandbox};
use glimpse::transport::probe_channel;

#[derive(ClapParser)]
#[command(name = "glimpse")]
#[command(about = "Glimpse playground CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a file and print its source with inline value annotations
    Run {
        /// Path to the script file
        file: PathBuf,
        /// Enable the element-literal markup extension
        #[arg(long)]
        markup: bool,
        /// Give up on a runaway script after this long
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Check that a file compiles; print parse reports otherwise
    Check {
        /// Path to the script file
        file: PathBuf,
        /// Enable the element-literal markup extension
        #[arg(long)]
        markup: bool,
    },
}

/// Forwards sandboxed console output straight to the terminal.
struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn write(&self, level: ConsoleLevel, text: &str) {
        println!("[console.{}] {}", level.as_str(), text);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            markup,
            timeout_ms,
        } => run_file(&file, markup, timeout_ms).await,
        Commands::Check { file, markup } => check_file(&file, markup),
    }
}

fn check_file(file: &PathBuf, markup: bool) -> Result<()> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let name = file.display().to_string();
    match glimpse::compile(&source, &name, markup) {
        Ok(output) => {
            println!("OK: {} capture sites", output.table.len() - 1);
            Ok(())
        }
        Err(error) => {
            eprintln!("{}", error.report(&source));
            std::process::exit(1);
        }
    }
}

async fn run_file(file: &PathBuf, markup: bool, timeout_ms: u64) -> Result<()> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let name = file.display().to_string();

    let output = match glimpse::compile(&source, &name, markup) {
        Ok(output) => output,
        Err(error) => {
            // Malformed code still gets an inline annotation at the
            // offending line instead of silence.
            eprintln!("{}", error.report(&source));
            let (payload, table) = error.to_payload(glimpse::protocol::Epoch(0));
            let decorations = build_decorations(&[payload], &table, &[]);
            print_annotated(&source, &stack_by_line(decorations));
            std::process::exit(1);
        }
    };

    let (sender, mut receiver) = probe_channel();
    let mut coordinator = RunCoordinator::new();
    let transformed = output.transformed.clone();
    let epoch = coordinator.begin_run(output, &mut receiver);

    let sandbox = spawn_sandbox(sender, || Rc::new(StdoutConsole));
    sandbox.execute(epoch, transformed, String::new());

    let mut completed = false;
    let deadline = now_ms() + timeout_ms;
    while now_ms() < deadline {
        let drained = receiver.pump(now_ms());
        if let Some(batch) = drained.batch {
            coordinator.apply_batch(batch);
        }
        if drained
            .statuses
            .iter()
            .any(|phase| *phase == RunPhase::ScriptComplete)
        {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if !completed {
        sandbox.cancel();
        eprintln!("timed out after {timeout_ms}ms; showing what arrived");
    }
    // Flush whatever the coalescer still holds.
    if let Some(batch) = receiver.pump(u64::MAX).batch {
        coordinator.apply_batch(batch);
    }

    let decorations = stack_by_line(coordinator.decorations().to_vec());
    print_annotated(&source, &decorations);

    sandbox.shutdown();
    Ok(())
}

fn print_annotated(source: &str, decorations: &[Decoration]) {
    let lines: Vec<&str> = source.lines().collect();
    let width = lines
        .iter()
        .map(|line| line.chars().count())
        .max()
        .unwrap_or(0)
        .min(60);
    for (index, line) in lines.iter().enumerate() {
        let number = index as u32 + 1;
        match decorations.iter().find(|decoration| decoration.line == number) {
            Some(decoration) => {
                println!("{line:width$}  //=> {}", decoration.text, width = width);
            }
            None => println!("{line}"),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
