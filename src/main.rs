use std::fs::File;
use std::sync::Mutex;

use clap::Parser;
use trimotor_link::config::{Args, log_filter};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("Failed to set up logging: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = trimotor_link::runtime::run(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

// Setup logging (set RUST_LOG=debug for more detail)
fn init_logging(args: &Args) -> std::io::Result<()> {
    let filter = log_filter(&std::env::var("RUST_LOG").unwrap_or_default());

    match &args.log_file {
        // The console owns stdout while running, so a file keeps logs off the status line
        Some(path) => {
            let file = File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
