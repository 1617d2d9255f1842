//=====================================================
// File: main.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: StreamVM CLI entry point
// Objective: Inspect the stream topology a configuration produces and run a
//            small allocation/fill/copy pipeline across every bound stream
//=====================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::json;
use streamvm::vm::builtin;
use streamvm::{
    logging, Device, InstructionHandle, InstructionMsg, LogicalObjectId, StreamRole, VirtualMachine, VmConfig,
};

#[derive(Parser, Debug)]
#[command(name = "streamvm", about = "StreamVM instruction-stream virtual machine")]
pub struct Args {
    /// Log StreamVM internals at debug level unless RUST_LOG says otherwise.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print stream descriptions and bound streams as JSON.
    Topology(CommonArgs),
    /// Run a malloc/fill/copy/free pipeline on every stream and print stats.
    Demo(DemoArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CommonArgs {
    /// TOML configuration file; defaults to a single host-only machine.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DemoArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Bytes allocated per object.
    #[arg(long = "size", default_value_t = 4096)]
    pub size: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.verbose {
        logging::init_with_default("streamvm", "info,streamvm=debug");
    } else {
        logging::init("streamvm");
    }

    match args.command {
        Command::Topology(cmd) => print_topology(&cmd),
        Command::Demo(cmd) => run_demo(&cmd),
    }
}

fn load_config(args: &CommonArgs) -> Result<VmConfig> {
    match &args.config {
        Some(path) => VmConfig::load_from_file(path),
        None => Ok(VmConfig::default()),
    }
}

fn print_topology(args: &CommonArgs) -> Result<()> {
    let vm = VirtualMachine::new(load_config(args)?).context("building virtual machine")?;
    let mut streams = Vec::with_capacity(vm.streams().len());
    for stream in vm.streams() {
        streams.push(json!({
            "id": stream.id(),
            "role": stream.role()?,
            "device": stream.device()?.to_string(),
            "stream_type": stream.stream_type().name(),
            "thread_ctx": stream.thread_ctx_id()?,
        }));
    }
    let report = json!({
        "stream_descs": vm.stream_descs(),
        "streams": streams,
        "thread_ctxs": vm.thread_ctxs().len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_demo(args: &DemoArgs) -> Result<()> {
    let vm = VirtualMachine::new(load_config(&args.common)?).context("building virtual machine")?;
    let mut lanes: HashMap<(StreamRole, Device), usize> = HashMap::new();
    let mut handles: Vec<InstructionHandle> = Vec::new();

    for stream in vm.streams() {
        let role = stream.role()?;
        let device = stream.device()?;
        let lane = lanes.entry((role, device)).or_default();
        let source = LogicalObjectId::local(stream.id() as u64 * 2);
        let target = LogicalObjectId::local(stream.id() as u64 * 2 + 1);
        let pipeline = vec![
            InstructionMsg::new(builtin::MALLOC)
                .write(source)
                .attrs(json!({ "size": args.size })),
            InstructionMsg::new(builtin::FILL)
                .write(source)
                .attrs(json!({ "value": stream.id() % 256 })),
            InstructionMsg::new(builtin::COPY).read(source).write(target),
            InstructionMsg::new(builtin::FREE).write(source),
            InstructionMsg::new(builtin::FREE).write(target),
        ];
        let batch = pipeline
            .into_iter()
            .map(|msg| msg.on_stream(role, device).lane(*lane))
            .collect();
        handles.extend(vm.submit_batch(batch)?);
        *lane += 1;
    }

    vm.wait_all();
    let failed: Vec<_> = handles
        .iter()
        .filter_map(|handle| handle.outcome().filter(|outcome| !outcome.is_completed()).map(|outcome| (handle.id(), outcome)))
        .collect();
    for (id, outcome) in &failed {
        tracing::warn!(instruction = %id, ?outcome, "demo instruction did not complete");
    }
    println!("{}", serde_json::to_string_pretty(&vm.stats())?);
    anyhow::ensure!(failed.is_empty(), "{} demo instructions did not complete", failed.len());
    Ok(())
}

//=====================================================
// End of file
//=====================================================
