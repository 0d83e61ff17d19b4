//! # CLI
//!
//! This module defines the command-line interface of `connectrpc` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring headers are `key:value`);
use clap::{Parser, Subcommand, ValueEnum};
use connectrpc_core::{NetworkProtocol, WireFormat};
use std::{path::PathBuf, time::Duration};

#[derive(Parser)]
#[command(name = "connectrpc", version, about = "Dynamic Connect, gRPC and gRPC-Web CLI")]
pub struct Cli {
    /// The server URL to connect to (e.g. http://localhost:8080)
    pub url: String,

    /// Log protocol details to stderr. `RUST_LOG` takes precedence.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Call a method described by a file descriptor set
    ///
    /// The JSON body is an object for unary and server streaming methods, and an
    /// array of objects for client and bidirectional streaming methods.
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// connectrpc http://localhost:8080 call connectrpc.eliza.v1.ElizaService/Say \
    ///     --file-descriptor-set eliza.bin --body '{"sentence": "hello"}'
    /// ```
    Call {
        /// Endpoint (package.Service/Method)
        #[arg(value_parser = parse_endpoint)]
        endpoint: (String, String),

        /// JSON body (Object for Unary and Server streaming, Array for Client and Bidi streaming)
        #[arg(long, value_parser = parse_body)]
        body: serde_json::Value,

        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Path to the descriptor set (.bin)
        #[arg(long)]
        file_descriptor_set: PathBuf,

        #[arg(long, value_enum, default_value_t = Protocol::Connect)]
        protocol: Protocol,

        /// Message encoding on the wire
        #[arg(long, value_enum, default_value_t = Encoding::Proto)]
        encoding: Encoding,

        /// Compress request messages with gzip
        #[arg(long)]
        gzip: bool,

        /// Use HTTP GET for side-effect free unary methods (Connect only)
        #[arg(long)]
        get: bool,

        /// Deadline of the call, in milliseconds
        #[arg(long, value_parser = parse_timeout)]
        timeout_ms: Option<Duration>,
    },

    /// List the services and methods of a file descriptor set
    List {
        /// Path to the descriptor set (.bin)
        #[arg(long)]
        file_descriptor_set: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Connect,
    Grpc,
    GrpcWeb,
}

impl From<Protocol> for NetworkProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Connect => NetworkProtocol::Connect,
            Protocol::Grpc => NetworkProtocol::Grpc,
            Protocol::GrpcWeb => NetworkProtocol::GrpcWeb,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Encoding {
    Proto,
    Json,
}

impl From<Encoding> for WireFormat {
    fn from(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Proto => WireFormat::Proto,
            Encoding::Json => WireFormat::Json,
        }
    }
}

fn parse_endpoint(value: &str) -> Result<(String, String), String> {
    let (service, method) = value.split_once('/').ok_or_else(|| {
        format!("Invalid endpoint format: '{value}'. Expected 'package.Service/Method'",)
    })?;

    if service.trim().is_empty() || method.trim().is_empty() {
        return Err("Service and Method names cannot be empty".to_string());
    }

    Ok((service.to_string(), method.to_string()))
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| "Format must be 'key:value'".to_string())
}

fn parse_body(value: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(value).map_err(|e| format!("Invalid JSON: {e}"))
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    match value.parse::<u64>() {
        Ok(0) => Err("Timeout must be greater than zero".to_string()),
        Ok(millis) => Ok(Duration::from_millis(millis)),
        Err(e) => Err(format!("Invalid timeout: {e}")),
    }
}
