use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod cli;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse_args();
    init_tracing();

    match cli.command {
        cli::Commands::Init { path } => {
            println!("Generating configuration file at: {}", path.display());
            gkfs::config::Settings::write_default_config(&path)?;
            println!("Configuration file created successfully!");
            println!("Edit the file and run: gkfs daemon -c {}", path.display());
        }
        cli::Commands::Daemon {
            config,
            listen,
            rootdir,
            hosts_file,
        } => {
            let overrides = cli::daemon::DaemonOverrides {
                listen,
                rootdir,
                hosts_file,
            };
            cli::daemon::run_daemon(config, overrides).await?;
        }
        cli::Commands::Write {
            config,
            path,
            input,
            offset,
            append,
        } => {
            cli::ops::write_file(&config, &path, input.as_deref(), offset, append).await?;
        }
        cli::Commands::Read {
            config,
            path,
            output,
            offset,
            length,
        } => {
            cli::ops::read_file(&config, &path, output.as_deref(), offset, length).await?;
        }
        cli::Commands::Stat { config, path } => {
            cli::ops::stat(&config, &path).await?;
        }
        cli::Commands::Ls { config, path, long } => {
            cli::ops::list(&config, &path, long).await?;
        }
        cli::Commands::Mkdir { config, path } => {
            cli::ops::mkdir(&config, &path).await?;
        }
        cli::Commands::Rm { config, path } => {
            cli::ops::remove(&config, &path).await?;
        }
        cli::Commands::Truncate { config, path, size } => {
            cli::ops::truncate(&config, &path, size).await?;
        }
        cli::Commands::Df { config } => {
            cli::ops::df(&config).await?;
        }
        cli::Commands::Stats { config, host } => {
            cli::ops::stats(&config, host).await?;
        }
    }

    Ok(())
}
