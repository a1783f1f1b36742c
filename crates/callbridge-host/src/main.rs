//! Callbridge Host - a standalone service process and command-line client.
//!
//! `serve` registers an endpoint and answers `pass_and_get_string` with a
//! built-in transform until interrupted. `call` connects to an endpoint, makes
//! one call, and prints the reply.

mod transform;

use anyhow::{Context, Result};
use callbridge_core::config::EndpointConfig;
use callbridge_core::{connect, gateway, EndpointDescriptor, ServiceHost, TransportRuntime};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use transform::Transform;

#[derive(Parser, Debug)]
#[command(name = "callbridge-host")]
#[command(about = "Host or call a callbridge service")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct Binding {
    /// Protocol sequence (ncalrpc or inproc)
    #[arg(long, default_value = EndpointConfig::PROTOCOL_SEQUENCE)]
    protseq: String,

    /// Endpoint name
    #[arg(short, long, default_value = EndpointConfig::ENDPOINT)]
    endpoint: String,

    /// Directory holding local sockets (defaults to CALLBRIDGE_SOCKET_DIR or the runtime dir)
    #[arg(long)]
    socket_dir: Option<PathBuf>,
}

impl Binding {
    fn descriptor(&self) -> Result<EndpointDescriptor> {
        EndpointDescriptor::new(&self.protseq, &self.endpoint)
            .with_context(|| format!("invalid binding {}:[{}]", self.protseq, self.endpoint))
    }

    fn runtime(&self) -> TransportRuntime {
        let runtime = TransportRuntime::new();
        match &self.socket_dir {
            Some(dir) => runtime.with_socket_dir(dir),
            None => runtime,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve pass_and_get_string until interrupted
    Serve {
        #[command(flatten)]
        binding: Binding,

        /// Transform applied to each request
        #[arg(short, long, value_enum, default_value = "echo")]
        transform: Transform,
    },
    /// Call pass_and_get_string once and print the reply
    Call {
        #[command(flatten)]
        binding: Binding,

        /// Request string
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the READY line and replies.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve { binding, transform } => serve(binding, transform).await,
        Command::Call { binding, input } => call(binding, &input).await,
    }
}

async fn serve(binding: Binding, transform: Transform) -> Result<()> {
    let descriptor = binding.descriptor()?;
    let runtime = Arc::new(binding.runtime());
    let host = ServiceHost::new(runtime, descriptor.clone());

    info!("Starting callbridge host on {}", descriptor);
    host.initialize(transform.callbacks())
        .await
        .with_context(|| format!("failed to serve {}", descriptor))?;

    // Readiness line for the parent process (intentional stdout)
    println!("READY {}", descriptor);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    host.terminate().await?;
    Ok(())
}

async fn call(binding: Binding, input: &str) -> Result<()> {
    let descriptor = binding.descriptor()?;
    let runtime = binding.runtime();

    let session = connect(&runtime, &descriptor)?;
    let output = gateway::pass_and_get_string(&session, input)
        .await
        .with_context(|| format!("call to {} failed", descriptor))?;

    println!("{}", output);
    Ok(())
}
