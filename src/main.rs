use clap::Parser;
use color_eyre::eyre::Result;

use strata::defs::Map;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file (default: first of <binary>.toml, config.toml,
    /// strata.toml)
    #[clap(short, long)]
    config: Option<String>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate a configuration file and exit
    Validate {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the server (default)
    Serve {
        #[clap(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let (command, config) = match args.command {
        Some(Commands::Validate { config }) => ("validate", Some(config)),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    if command == "validate" {
        return validate(config.as_deref().unwrap_or("config.toml"));
    }

    // logging first, off the discovered config when there is one
    let loaded: Map = config
        .as_deref()
        .map(strata::config::load)
        .transpose()?
        .unwrap_or_default();
    strata::tracing_setup::init(&loaded);

    strata::run(config.as_deref()).await
}

fn validate(path: &str) -> Result<()> {
    match strata::config::load(path) {
        Ok(config) => {
            println!("configuration ok: {path}");
            for key in ["name", "http", "site", "cache", "session", "mutex", "token"] {
                if config.contains_key(key) {
                    println!("  section present: {key}");
                }
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("configuration invalid: {err:?}");
            std::process::exit(1);
        }
    }
}
