use std::env;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use points_ledger::csv::{read_commands, write_accounts};
use points_ledger::{Engine, MemoryStore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let path = env::args()
        .nth(1)
        .expect("usage: points-ledger <commands.csv>");

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let commands = match read_commands(path.clone()) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let engine = Engine::new(Arc::new(MemoryStore::new()));
    let (command_sender, command_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if command_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    engine.run(ReceiverStream::new(command_receiver)).await;

    let accounts = match engine.accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            error!("failed to read balances: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = write_accounts(io::stdout().lock(), &accounts) {
        error!("failed to write balances: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
