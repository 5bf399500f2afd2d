use clap::{Parser, Subcommand};

mod chat;
mod templates;

#[derive(Parser)]
#[command(name = "cabline")]
#[command(about = "Cabline CLI - driver-to-dispatch messaging", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: CABLINE_CONFIG_PATH or ~/.cabline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Open the dispatch conversation (interactive).
    Chat {
        /// Config file path (default: CABLINE_CONFIG_PATH or ~/.cabline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Host user id override. Builds a synthetic launch context; without it
        /// the context is read from CABLINE_LAUNCH_CONTEXT.
        #[arg(long, value_name = "ID")]
        user_id: Option<i64>,

        /// Username to go with --user-id.
        #[arg(long, value_name = "NAME")]
        username: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("cabline {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            user_id,
            username,
        }) => {
            if let Err(e) = chat::run_chat(config, user_id, username).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}
