use clap::Parser;
use redirproxy_bin::{BoxError, RunOptions, run};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "/etc/redirproxy/config.yaml")]
    config: PathBuf,

    /// Use the socket's local address as the original destination (TPROXY)
    #[arg(long)]
    transparent: bool,

    /// Relay every connection opaquely without protocol sniffing
    #[arg(long)]
    no_sniffing: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    run(RunOptions {
        config_path: args.config,
        transparent: args.transparent,
        no_sniffing: args.no_sniffing,
    })
    .await
}
