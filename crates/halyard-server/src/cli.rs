use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "halyard", about = "Real-time presence/event gateway")]
pub struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "halyard.toml")]
    pub config: String,

    /// Override the bind address from the config file.
    #[arg(long)]
    pub bind: Option<String>,

    /// Seed the in-memory data layer with a demo guild and accounts.
    #[arg(long)]
    pub seed_demo: bool,
}
