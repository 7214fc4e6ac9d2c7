//! `kernel verify` — offline end-to-end audit chain verification.
//!
//! Streams the ledger in `ts` order from Postgres or from an NDJSON export
//! and re-verifies the hash chain and every signature against the signer
//! registry. Exits non-zero at the first broken invariant.

use {
    crate::prelude::*,
    kernel_sdk::{
        audit::{fetch_all_ordered, AuditEvent},
        registry::SignerRegistry,
        verifier::ChainVerifier,
    },
    sqlx::postgres::PgPoolOptions,
    std::io::BufRead as _,
};

#[derive(Args, Clone, Debug)]
pub(crate) struct VerifyArgs {
    /// Signer registry file (signerId -> public key).
    #[arg(long, value_name = "PATH")]
    pub registry: PathBuf,

    /// Read the ledger from this Postgres database.
    #[arg(long, value_name = "URL", conflicts_with = "file")]
    pub database_url: Option<String>,

    /// Read the ledger from an NDJSON export (one event per line).
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Secret for verifying dev HMAC signatures (non-production ledgers).
    #[arg(long, value_name = "SECRET")]
    pub dev_secret: Option<String>,
}

pub(crate) async fn verify_chain(args: VerifyArgs) -> AnyResult<(), KernelCliError> {
    command_title!("Verifying the Kernel audit chain");

    let registry = SignerRegistry::from_path(&args.registry)?;
    println!(
        "Loaded {count} signer(s) from {path}",
        count = registry.len(),
        path = args.registry.display()
    );

    let events = load_events(&args).await?;
    println!("Replaying {count} event(s)\n", count = events.len());

    let mut verifier = ChainVerifier::new(registry, args.dev_secret.clone());
    for event in &events {
        verifier.verify_event(event)?;
    }
    let summary = verifier.finish();

    println!(
        "{ok} chain intact: {count} event(s), head hash {head}",
        ok = "✔".green().bold(),
        count = summary.count,
        head = if summary.head_hash.is_empty() {
            "<empty ledger>".to_string()
        } else {
            summary.head_hash
        }
    );
    Ok(())
}

async fn load_events(args: &VerifyArgs) -> AnyResult<Vec<AuditEvent>, KernelCliError> {
    if let Some(path) = &args.file {
        return read_ndjson(path);
    }

    let Some(url) = &args.database_url else {
        return Err(KernelCliError::Any(anyhow!(
            "either --database-url or --file must be provided"
        )));
    };

    let pool = PgPoolOptions::new().max_connections(2).connect(url).await?;
    let events = fetch_all_ordered(&pool)
        .await
        .map_err(|e| KernelCliError::Any(anyhow!(e)))?;
    Ok(events)
}

fn read_ndjson(path: &PathBuf) -> AnyResult<Vec<AuditEvent>, KernelCliError> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);

    let mut events = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent = serde_json::from_str(&line).map_err(|e| {
            KernelCliError::Any(anyhow!("{}:{}: invalid event: {e}", path.display(), lineno + 1))
        })?;
        events.push(event);
    }

    // Verification is defined over ts-ascending order; concatenated exports
    // may not be sorted.
    events.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(seq: u32, ts: &str) -> String {
        format!(
            r#"{{"id":"00000000-0000-4000-8000-00000000000{seq}","eventType":"test.event","payload":{{"seq":{seq}}},"ts":"{ts}","prevHash":"","hash":"{h}","signature":"c2ln","signerId":"local-ed25519:aabbccdd","streamStatus":"pending","streamAttempts":0}}"#,
            h = "ab".repeat(32),
        )
    }

    #[test]
    fn ndjson_parses_skips_blanks_and_sorts_by_ts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.ndjson");
        let contents = format!(
            "{}\n\n{}\n",
            line(2, "2026-08-01T12:00:01Z"),
            line(1, "2026-08-01T12:00:00Z"),
        );
        std::fs::write(&path, contents).unwrap();

        let events = read_ndjson(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].ts < events[1].ts);
        assert_eq!(events[0].payload["seq"], 1);
    }

    #[test]
    fn ndjson_reports_the_offending_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ndjson");
        std::fs::write(&path, "{\"not\": \"an event\"}\n").unwrap();

        let err = read_ndjson(&path).unwrap_err();
        assert!(err.to_string().contains("broken.ndjson:1"));
    }
}
