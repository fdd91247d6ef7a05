mod accounts;
mod core;
mod export;
mod history;
mod marketdata;
mod portfolio;
mod settings;
mod store;
mod sync;
mod upstream;

use anyhow::Result;
use clap::{arg, Command};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::settings::Settings;

static CLIENT_NAME: &str = "bursar";

async fn run() -> Result<()> {
    let app = Command::new(CLIENT_NAME)
        .about("The bursar utility pulls bank accounts and transactions from \
         the Teller API into a local store and generates reports from them.")
        .version("0.1.0")
        .subcommand_required(true)
        .allow_external_subcommands(false)
        .arg(arg!(CONFIG: -c --config [FILE] "Sets a custom config file"))
        .arg(arg!(verbose: -v --verbose "Sets the level of verbosity"))
        .subcommand(Command::new("sync")
            .about("Pulls accounts and transactions from the upstream API. Incremental by default once a recent run exists.")
            .arg(arg!(full: -f --full "Refetch everything instead of resuming from the last run.")))
        .subcommand(Command::new("accounts")
            .about("Prints tracked accounts and their latest balances."))
        .subcommand(Command::new("runs")
            .about("Prints the sync audit log.")
            .arg(arg!(limit: -n --limit [COUNT] "How many runs to show, most recent first. Defaults to 10.")))
        .subcommand(Command::new("export")
            .about("Exports every table plus derived reports as CSV into a timestamped folder.")
            .arg(arg!(out: -o --out [DIR] "Directory to write the export folder under.")))
        .subcommand(Command::new("history")
            .about("Reconstructs daily end-of-day balances per account from current balances and posted transactions.")
            .arg(arg!(out: -o --out [DIR] "Directory to write the CSV under.")))
        .subcommand(Command::new("portfolio")
            .about("Combines the balance history with a buy-and-hold index simulation of brokerage transfers.")
            .arg(arg!(symbol: -s --symbol [SYMBOL] "Index symbol to simulate. Defaults to SPY."))
            .arg(arg!(pattern: -p --pattern [TEXT] "Description substring marking transfers out. Defaults to robinhood."))
            .arg(arg!(out: -o --out [DIR] "Directory to write the CSV under.")));

    let matches = app.get_matches();

    let default_level = if matches.is_present("verbose") {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::new(matches.value_of("CONFIG"))?;

    match matches.subcommand() {
        Some(("sync", sub)) => sync::run(sub, settings).await?,
        Some(("accounts", sub)) => accounts::run(sub, settings).await?,
        Some(("runs", sub)) => sync::runs(sub, settings).await?,
        Some(("export", sub)) => export::run(sub, settings).await?,
        Some(("history", sub)) => history::run(sub, settings).await?,
        Some(("portfolio", sub)) => portfolio::run(sub, settings).await?,
        None => unreachable!("subcommand is required"),
        _ => unreachable!(),
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        println!("{}", err);
        std::process::exit(1);
    }
}
