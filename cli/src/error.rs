use {
    crate::{display::*, prelude::*},
    kernel_sdk::{registry::RegistryError, verifier::VerifyError},
    thiserror::Error,
};

/// Custom error definitions for the Kernel CLI. Takes care of displaying
/// a pretty summary in the console.
#[derive(Debug, Error)]
pub(crate) enum KernelCliError {
    #[error("{error}{rule}\n{0}", error = "Syntax Error".red().bold(), rule = rule())]
    Syntax(clap::error::Error),
    #[error("{error}{rule}\n{0}", error = "IO Error".red().bold(), rule = rule())]
    Io(#[from] std::io::Error),
    #[error("{error}{rule}\n{0}", error = "Error".red().bold(), rule = rule())]
    Any(#[from] anyhow::Error),
    #[error("{error}{rule}\n{0}", error = "Database Error".red().bold(), rule = rule())]
    Db(#[from] sqlx::Error),
    #[error("{error}{rule}\n{0}", error = "Registry Error".red().bold(), rule = rule())]
    Registry(#[from] RegistryError),
    #[error("{error}{rule}\n{0}", error = "Integrity Violation".red().bold(), rule = rule())]
    Integrity(#[from] VerifyError),
}
