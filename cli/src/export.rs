//! `kernel export` — dump the ledger as NDJSON for offline verification.

use {
    crate::prelude::*,
    kernel_sdk::audit::fetch_all_ordered,
    sqlx::postgres::PgPoolOptions,
    std::io::Write as _,
};

#[derive(Args, Clone, Debug)]
pub(crate) struct ExportArgs {
    /// Postgres database holding the ledger.
    #[arg(long, value_name = "URL")]
    pub database_url: String,

    /// Write to this file instead of stdout.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

pub(crate) async fn export_chain(args: ExportArgs) -> AnyResult<(), KernelCliError> {
    command_title!("Exporting the Kernel audit chain");

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&args.database_url)
        .await?;
    let events = fetch_all_ordered(&pool)
        .await
        .map_err(|e| KernelCliError::Any(anyhow!(e)))?;

    let mut out: Box<dyn std::io::Write> = match &args.output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };
    for event in &events {
        let line = serde_json::to_string(event).map_err(|e| KernelCliError::Any(anyhow!(e)))?;
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    if let Some(path) = &args.output {
        println!(
            "{ok} wrote {count} event(s) to {path}",
            ok = "✔".green().bold(),
            count = events.len(),
            path = path.display()
        );
    }
    Ok(())
}
