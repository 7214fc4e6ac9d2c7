//! `kernel keygen` — generate Ed25519 signer material.
//!
//! Prints the seed for `KERNEL_SIGNER_KEY_B64` and a ready-to-paste signer
//! registry entry for the derived public key.

use {crate::prelude::*, kernel_sdk::signer::LocalEd25519Signer, serde_json::json};

#[derive(Args, Clone, Debug)]
pub(crate) struct KeygenArgs {
    /// Only print the registry entry, not the private seed.
    #[arg(long)]
    pub public_only: bool,
}

pub(crate) fn keygen(args: KeygenArgs) -> AnyResult<(), KernelCliError> {
    command_title!("Generating an Ed25519 signer key");

    let signer = LocalEd25519Signer::generate();

    if !args.public_only {
        println!("{}", "KERNEL_SIGNER_KEY_B64 (keep secret):".bold());
        println!("  {}\n", signer.seed_b64());
    }

    println!("{}", "Signer id:".bold());
    println!("  {}\n", signer.signer_id());

    let entry = json!({
        signer.signer_id(): {
            "publicKey": signer.public_key_b64(),
            "algorithm": "Ed25519",
        }
    });
    println!("{}", "Registry entry:".bold());
    println!(
        "{}",
        serde_json::to_string_pretty(&entry).map_err(|e| KernelCliError::Any(anyhow!(e)))?
    );
    Ok(())
}
