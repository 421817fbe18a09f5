use clap::{Args, Subcommand, ValueEnum};

use crate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        let default_path = Config::default_config_path();
                        if default_path.exists() {
                            println!("Config file: {}", default_path.display());
                        } else {
                            println!("Config file: {} (not found)", default_path.display());
                        }
                        println!();

                        println!("database_path: {}", config.database_path.display());
                        println!("device_id: {}", config.device_id);
                        println!();

                        println!("sampler:");
                        println!("  accuracy_threshold_m: {}", config.sampler.accuracy_threshold_m);
                        println!("  dense_interval_secs: {}", config.sampler.dense_interval_secs);
                        println!("  sparse_interval_secs: {}", config.sampler.sparse_interval_secs);
                        println!("  speed_threshold_mps: {}", config.sampler.speed_threshold_mps);
                        println!();

                        println!("queue:");
                        println!("  capacity: {}", config.queue.capacity);
                        println!();

                        println!("sync:");
                        match &config.sync.server_url {
                            Some(url) => println!("  server_url: {}", url),
                            None => println!("  server_url: (not set)"),
                        }
                        match &config.sync.api_key {
                            Some(key) => {
                                println!("  api_key: {}...", &key[..key.len().min(8)])
                            }
                            None => println!("  api_key: (not set)"),
                        }
                        println!("  batch_size: {}", config.sync.batch_size);
                        println!("  max_attempts: {}", config.sync.max_attempts);
                    }
                }
                Ok(())
            }
        }
    }
}
