use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use batchport_backend_ort::{OrtOptions, Provider};
use batchport_runtime::BatchPolicy;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "batchportd", version, about = "Batching inference daemon for ONNX models")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP and gRPC servers
    Serve(ServeArgs),
    /// Load the model, print what it declares and exit
    Inspect(ModelArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Path to ONNX model file
    #[arg(long, env = "MODEL_PATH", default_value = "model.onnx")]
    pub model_path: PathBuf,

    /// Execution providers to try before CPU, in order (coreml, cuda, cuda:N)
    #[arg(long, env = "PROVIDERS", value_delimiter = ',', default_value = "coreml,cuda")]
    pub providers: Vec<Provider>,

    /// Log level (RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log: String,
}

impl ModelArgs {
    pub fn ort_options(&self, sessions: usize) -> OrtOptions {
        OrtOptions {
            preferred: self.providers.clone(),
            sessions,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Bind address for both listeners
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// HTTP listen port
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// gRPC listen port
    #[arg(long, env = "GRPC_PORT", default_value_t = 50070)]
    pub grpc_port: u16,

    /// Rows that trigger an immediate dispatch on the queued path
    #[arg(long, env = "BATCH_SIZE", default_value_t = 16,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub batch_size: u64,

    /// Longest a partial batch waits before it is dispatched, in milliseconds
    #[arg(long, env = "FLUSH_MS", default_value_t = 5,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub flush_ms: u64,

    /// gRPC worker threads and ONNX sessions (defaults to available cores)
    #[arg(long, env = "WORKERS", value_parser = clap::value_parser!(u64).range(1..))]
    pub workers: Option<u64>,

    /// Seconds between stats reports; 0 disables them
    #[arg(long, env = "STATS_INTERVAL_SECS", default_value_t = 60)]
    pub stats_interval_secs: u64,
}

impl ServeArgs {
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn grpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.grpc_port)
    }

    pub fn workers(&self) -> usize {
        match self.workers {
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
            None => std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            max_rows: usize::try_from(self.batch_size).unwrap_or(usize::MAX),
            flush_interval: Duration::from_millis(self.flush_ms),
        }
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}
