use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the workspace tests
    Test,
    /// Run a simulated update of a firmware file through the CLI
    Simulate {
        /// Firmware image to send
        file: String,
        /// Use the fast engine
        #[arg(long)]
        fast: bool,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Simulate { file, fast } => {
            println!("Running simulated update...");
            let engine = if *fast { "fast" } else { "standard" };
            cargo(
                &[
                    "run", "-p", "grdfu-cli", "--", "update", file, "--simulate", "--engine",
                    engine,
                ],
                "Simulated update",
            )?;
        }
    }

    Ok(())
}
