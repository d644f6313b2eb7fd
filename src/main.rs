//! Kolosal NAS - Main Entry Point

use clap::Parser;
use kolosal_nas::cli::{
    cmd_darts, cmd_evaluate_zc, cmd_info, cmd_init_config, cmd_rank, cmd_search, Cli, Commands,
};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolosal_nas=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Search { config, epochs, policy, output } => {
            cmd_search(config.as_deref(), epochs, policy.as_deref(), output.as_deref())?;
        }
        Commands::Darts { config, epochs, output } => {
            cmd_darts(config.as_deref(), epochs, output.as_deref())?;
        }
        Commands::Rank { benchmark, config, proxy, metric, epochs } => {
            cmd_rank(&benchmark, config.as_deref(), &proxy, &metric, epochs)?;
        }
        Commands::EvaluateZc { benchmark, method, test_size, test_data, save, seed } => {
            cmd_evaluate_zc(&benchmark, &method, test_size, test_data.as_deref(), &save, seed)?;
        }
        Commands::Info { config } => {
            cmd_info(config.as_deref())?;
        }
        Commands::InitConfig { output } => {
            cmd_init_config(&output)?;
        }
    }

    Ok(())
}
