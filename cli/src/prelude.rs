pub(crate) use {
    crate::{command_title, error::KernelCliError},
    anyhow::{anyhow, Result as AnyResult},
    clap::{Args, Parser, Subcommand},
    colored::Colorize,
    std::path::PathBuf,
};
