//! CLI subcommand handlers.

use crate::experiments::{
    ConceptImportance, EnforceInvariance, ExampleImportance, Experiment, FeatureImportance, Sensitivity,
    run_experiment,
};
use crate::{Commands, ConfigAction};
use anyhow::Context;
use equivex_ml::{ConfigOverrides, EquivexConfig, load_config};
use std::path::Path;

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, workspace: &Path, overrides: &ConfigOverrides) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, overrides),
        Commands::FeatureImportance => run(&FeatureImportance, workspace, overrides),
        Commands::ExampleImportance => run(&ExampleImportance, workspace, overrides),
        Commands::ConceptImportance => run(&ConceptImportance, workspace, overrides),
        Commands::EnforceInvariance => run(&EnforceInvariance, workspace, overrides),
        Commands::Sensitivity => run(&Sensitivity, workspace, overrides),
    }
}

fn run<E: Experiment>(experiment: &E, workspace: &Path, overrides: &ConfigOverrides) -> anyhow::Result<()> {
    let config = load(workspace, overrides)?;
    run_experiment(experiment, &config, workspace)?;
    Ok(())
}

fn load(workspace: &Path, overrides: &ConfigOverrides) -> anyhow::Result<EquivexConfig> {
    load_config(Some(workspace), overrides).context("Failed to load config")
}

fn handle_config(action: ConfigAction, workspace: &Path, overrides: &ConfigOverrides) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".equivex");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!("Configuration file already exists at: {}", config_path.display());
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&EquivexConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!("Created default configuration at: {}", config_path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, overrides)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use equivex_ml::config::GroupKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, dir.path(), &ConfigOverrides::new()).unwrap();

        let config_path = dir.path().join(".equivex").join("config.toml");
        assert!(config_path.exists());

        let content = std::fs::read_to_string(&config_path).unwrap();
        let parsed: EquivexConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed, EquivexConfig::default());
        assert_eq!(parsed.symmetry.group, GroupKind::Translation1d);
    }

    #[test]
    fn test_config_init_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".equivex")).unwrap();
        let config_path = dir.path().join(".equivex").join("config.toml");
        std::fs::write(&config_path, "[data]\nbatch_size = 3\n").unwrap();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, dir.path(), &ConfigOverrides::new()).unwrap();
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "[data]\nbatch_size = 3\n");
    }

    #[test]
    fn test_config_show_rejects_invalid_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = ConfigOverrides::new().set("data.batch_size", 0u64);
        let command = Commands::Config {
            action: ConfigAction::Show,
        };
        assert!(handle_command(command, dir.path(), &overrides).is_err());
    }
}
