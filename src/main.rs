use std::process::ExitCode;

use tokio::runtime::Builder;
use tokio::task::LocalSet;

use redlite::server::{Server, StartupConfig};

/// Entry point: parse the command line, build the single-threaded
/// runtime, and run the server until a fatal error.
///
/// Every startup failure exits non-zero with a one-line message; once
/// the accept loop is running, errors are scoped to single connections
/// and the process stays up.
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match StartupConfig::from_args(std::env::args()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("redlite: {}", error);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("redlite: failed to start runtime: {}", error);
            return ExitCode::FAILURE;
        }
    };

    let local = LocalSet::new();

    local.block_on(&runtime, async {
        let server = match Server::bind(config).await {
            Ok(server) => server,
            Err(error) => {
                eprintln!("redlite: {}", error);
                return ExitCode::FAILURE;
            }
        };

        if let Err(error) = server.run().await {
            eprintln!("redlite: {}", error);
            return ExitCode::FAILURE;
        }

        ExitCode::SUCCESS
    })
}
