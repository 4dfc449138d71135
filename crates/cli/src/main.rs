//! The main entrypoint for imager, which is just a wrapper around the
//! library's command line.

use anyhow::Result;

async fn run() -> Result<()> {
    imager_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    imager_lib::cli::run_from_iter(std::env::args_os()).await
}

#[tokio::main]
async fn main() {
    // Failures were already reported as status updates; only the exit code
    // is left to set.
    if let Err(e) = run().await {
        tracing::debug!("{e:#}");
        std::process::exit(1);
    }
}
