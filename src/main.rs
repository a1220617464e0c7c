use std::process::ExitCode;

use shelflife::config::Config;
use shelflife::core::models::{IntentId, MutationIntent};
use shelflife::core::outbox::Outbox;
use shelflife::core::store::StoreHandle;

const USAGE: &str = "usage: shelflife <status | retry <intent-id> | dismiss <intent-id>>";

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::resolve();
    log::debug!("Using data dir {}", config.data_dir.display());

    let result = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["status"] | [] => status(&config).await,
        ["retry", id] => with_intent(&config, id, Action::Retry).await,
        ["dismiss", id] => with_intent(&config, id, Action::Dismiss).await,
        _ => Err(USAGE.to_string()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn open(config: &Config) -> Result<(StoreHandle, Outbox), String> {
    let store = StoreHandle::open_at(&config.data_dir)?;
    let outbox = Outbox::restore(store.clone()).await?;
    Ok((store, outbox))
}

fn describe(intent: &MutationIntent) -> String {
    let mut line = format!(
        "  {} #{} {} {} [{}]",
        intent.id,
        intent.seq,
        intent.op.kind(),
        intent.op.target(),
        intent.state.label()
    );
    if intent.attempts > 0 {
        line.push_str(&format!(" attempts={}", intent.attempts));
    }
    if let Some(err) = &intent.last_error {
        line.push_str(&format!(" error={err}"));
    }
    line
}

async fn status(config: &Config) -> Result<(), String> {
    let (store, outbox) = open(config).await?;

    let owners = outbox.owners();
    if owners.is_empty() {
        println!("Outbox empty");
    }
    for owner in owners {
        let pending = outbox.list_pending(&owner);
        let failed = outbox.list_failed(&owner);
        println!("{owner}: {} pending, {} failed", pending.len(), failed.len());
        for intent in pending.iter().chain(failed.iter()) {
            println!("{}", describe(intent));
        }
    }

    let partitions = store.load_partitions().await?;
    if !partitions.is_empty() {
        println!("Cached partitions:");
    }
    for (owner, scope, items) in partitions {
        println!("  {owner}/{scope}: {} items", items.len());
    }
    Ok(())
}

enum Action {
    Retry,
    Dismiss,
}

async fn with_intent(config: &Config, raw: &str, action: Action) -> Result<(), String> {
    let id: IntentId = raw
        .parse()
        .map_err(|e| format!("invalid intent id {raw:?}: {e}"))?;
    let (_store, outbox) = open(config).await?;

    let done = match action {
        Action::Retry => outbox.retry_failed(id).await?,
        Action::Dismiss => outbox.dismiss(id).await?,
    };
    if !done {
        return Err(format!("no failed intent {id}"));
    }
    log::info!("Intent {} updated", id);
    println!("ok");
    Ok(())
}
