use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use geard::broker::server::GearServer;
use geard::cli;
use geard::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "geard")]
#[command(about = "A Gearman-compatible job queue broker")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the job server
    Server {
        /// Listening address for the binary protocol and admin verbs
        #[arg(short = 'a', long, default_value = "0.0.0.0:4730")]
        addr: String,

        /// Directory where durable jobs are stored
        #[arg(short = 's', long = "storage-dir")]
        storage_dir: Option<PathBuf>,

        /// HTTP metrics and JSON API address
        #[arg(short = 'w', long = "web-addr", default_value = "0.0.0.0:3000")]
        web_addr: String,

        /// Enable verbose logging
        #[arg(short = 'v', long)]
        verbose: bool,
    },

    /// Submit stdin records as jobs to a function
    Client {
        /// Function name to submit to
        function: String,

        /// Job server address
        #[arg(long, default_value = "127.0.0.1:4730")]
        server: String,

        /// Input record delimiter
        #[arg(long, default_value = "\n")]
        delimiter: String,

        /// Per-job timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// Job priority (low, normal, high)
        #[arg(long, default_value = "normal")]
        priority: String,
    },

    /// Run a worker that pipes job payloads through a shell command
    Worker {
        /// Function name to register
        name: String,

        /// Shell command executed for jobs
        command: String,

        /// Job server address
        #[arg(long, default_value = "127.0.0.1:4730")]
        server: String,

        /// Fresh subprocess per job, payload terminated by EOF
        #[arg(long)]
        eof: bool,
    },
}

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server {
            addr,
            storage_dir,
            web_addr,
            verbose,
        } => {
            init_logging(if verbose { "debug" } else { "info" });

            let storage_dir =
                storage_dir.unwrap_or_else(|| std::env::temp_dir().join("geard"));
            let config = ServerConfig::new(addr, storage_dir)
                .with_web_addr(Some(web_addr));

            tracing::info!(
                addr = %config.listen_addr,
                storage_dir = %config.storage_dir.display(),
                web_addr = ?config.web_addr,
                "Starting geard"
            );

            let server = GearServer::bind(config).await?;
            let shutdown = server.broker().shutdown_token();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm =
                    signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                let mut sigint =
                    signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
                }
                shutdown.cancel();
            });

            server.run().await?;
        }
        Commands::Client {
            function,
            server,
            delimiter,
            timeout,
            priority,
        } => {
            init_logging("warn");
            cli::run_client(
                &function,
                &server,
                &delimiter,
                Duration::from_secs(timeout),
                cli::parse_priority(&priority),
            )
            .await?;
        }
        Commands::Worker {
            name,
            command,
            server,
            eof,
        } => {
            init_logging("info");
            cli::run_worker(&name, &command, &server, eof).await?;
        }
    }
    Ok(())
}
