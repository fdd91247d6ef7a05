use std::io::Write;

use anyhow::Result;
use clap::ArgMatches;
use tabwriter::TabWriter;

use crate::settings::Settings;
use crate::store::SqliteStore;

pub(crate) async fn run(_matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()?).await?;
    let accounts = store.accounts().open_with_balance().await?;

    let mut tw = TabWriter::new(vec![]);
    writeln!(tw, "Institution\tAccount\tAccount ID\tType\tBalance")?;
    for account in accounts {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            account.institution, account.name, account.id, account.ty, account.balance,
        )?;
    }
    tw.flush()?;

    println!("{}", String::from_utf8(tw.into_inner()?)?);

    Ok(())
}
