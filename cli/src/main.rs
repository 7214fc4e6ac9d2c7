//! Kernel operator CLI.

mod display;
mod error;
mod export;
mod keygen;
mod prelude;
mod verify;

use {
    crate::{
        export::{export_chain, ExportArgs},
        keygen::{keygen, KeygenArgs},
        prelude::*,
        verify::{verify_chain, VerifyArgs},
    },
    clap::CommandFactory as _,
};

#[derive(Parser)]
#[command(
    name = "kernel",
    about = "Kernel audit tooling: verify the ledger, export it, manage signer keys.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Replay the audit chain and re-verify hashes and signatures.")]
    Verify(VerifyArgs),

    #[command(about = "Export the audit chain as NDJSON.")]
    Export(ExportArgs),

    #[command(about = "Generate Ed25519 signer key material.")]
    Keygen(KeygenArgs),

    #[command(about = "Generate shell completions.")]
    Completion {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}", KernelCliError::Syntax(e));
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Command::Verify(args) => verify_chain(args).await,
        Command::Export(args) => export_chain(args).await,
        Command::Keygen(args) => keygen(args),
        Command::Completion { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "kernel",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
