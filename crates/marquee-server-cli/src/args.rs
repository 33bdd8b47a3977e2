use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;

/// Marquee Server CLI - run a Marquee lobby server or put load on one
#[derive(Debug, Parser)]
#[command(name = "marquee-server")]
#[command(author, version, about)]
pub struct ServerArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the lobby server
    Serve(ServeArgs),
    /// Open many clients against a running server and report throughput
    Bench(BenchArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path to a TOML config file (environment variables are expanded)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Logging level, overriding the config file (e.g. 'info', 'debug')
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log directory, overriding the config file
    #[arg(long)]
    pub log_dir: Option<String>,

    /// Log to stdout
    #[arg(long)]
    pub log_stdout: bool,
}

#[derive(Debug, Args)]
pub struct BenchArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9100")]
    pub addr: SocketAddr,

    /// Number of concurrent clients
    #[arg(short, long, default_value_t = 10)]
    pub clients: usize,

    /// Echo round trips per client
    #[arg(short, long, default_value_t = 1000)]
    pub messages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_and_bench() {
        let args = ServerArgs::parse_from([
            "marquee-server",
            "serve",
            "--config",
            "$HOME/marquee.toml",
            "--listen",
            "0.0.0.0:9100",
        ]);
        match args.command {
            Command::Serve(serve) => {
                assert_eq!(serve.config.as_deref(), Some("$HOME/marquee.toml"));
                assert_eq!(serve.listen.as_deref(), Some("0.0.0.0:9100"));
                assert!(!serve.log_stdout);
            }
            other => panic!("expected serve, got {:?}", other),
        }

        let args = ServerArgs::parse_from(["marquee-server", "bench", "-c", "4", "-m", "50"]);
        match args.command {
            Command::Bench(bench) => {
                assert_eq!(bench.clients, 4);
                assert_eq!(bench.messages, 50);
                assert_eq!(bench.addr, "127.0.0.1:9100".parse().unwrap());
            }
            other => panic!("expected bench, got {:?}", other),
        }
    }
}
