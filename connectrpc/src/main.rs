//! # Connectrpc CLI Entry Point
//!
//! The main executable of the `connectrpc` tool. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`] and installs logging.
//! 2. **Descriptors**: Loads the file descriptor set describing the target methods.
//! 3. **Execution**: Connects to the server and delegates the call to [`call::call`].
//! 4. **Presentation**: Prints every response message, then the error that ended the call, if any.

mod call;
mod cli;
mod formatter;

use anyhow::Context;
use call::{DynamicRequest, DynamicResponse};
use clap::Parser;
use cli::{Cli, Commands, Protocol};
use connectrpc_core::{
    GetConfiguration, GzipCompressionPool, ProtocolClient, ProtocolClientConfig,
    prost_reflect::DescriptorPool,
};
use formatter::{FormattedString, ServiceList};
use std::{path::Path, process, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let result = match args.command {
        Commands::Call {
            endpoint,
            body,
            headers,
            file_descriptor_set,
            protocol,
            encoding,
            gzip,
            get,
            timeout_ms,
        } => {
            let (service, method) = endpoint;
            let options = CallFlags {
                protocol,
                gzip,
                get,
            };
            run_call(
                &args.url,
                &file_descriptor_set,
                options,
                DynamicRequest {
                    service,
                    method,
                    body,
                    headers,
                    format: encoding.into(),
                    timeout: timeout_ms,
                },
            )
            .await
        }
        Commands::List {
            file_descriptor_set,
        } => list_services(&file_descriptor_set),
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(err) => {
            eprintln!("{}", FormattedString::from(err));
            process::exit(1);
        }
    }
}

/// Logs go to stderr so that stdout only carries responses.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct CallFlags {
    protocol: Protocol,
    gzip: bool,
    get: bool,
}

fn read_descriptors(path: &Path) -> anyhow::Result<DescriptorPool> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read file '{}'", path.display()))?;
    Ok(call::load_descriptors(&bytes)?)
}

fn list_services(file_descriptor_set: &Path) -> anyhow::Result<bool> {
    let pool = read_descriptors(file_descriptor_set)?;
    println!("{}", FormattedString::from(ServiceList(pool)));
    Ok(true)
}

/// Returns whether the call succeeded.
async fn run_call(
    url: &str,
    file_descriptor_set: &Path,
    flags: CallFlags,
    request: DynamicRequest,
) -> anyhow::Result<bool> {
    let pool = read_descriptors(file_descriptor_set)?;

    let mut builder = ProtocolClientConfig::builder(url).protocol(flags.protocol.into());
    if flags.gzip {
        builder = builder.request_compression(0, Arc::new(GzipCompressionPool));
    }
    if flags.get {
        builder = builder.get_configuration(GetConfiguration::Enabled);
    }
    let config = builder.build().context("Invalid client configuration")?;
    let client = ProtocolClient::connect(config)
        .await
        .context("Connection Error")?;

    let DynamicResponse { messages, error } = call::call(&client, &pool, request).await?;
    for message in messages {
        println!("{}", FormattedString::from(message));
    }
    match error {
        Some(error) => {
            println!("{}", FormattedString::from(&error));
            Ok(false)
        }
        None => Ok(true),
    }
}
