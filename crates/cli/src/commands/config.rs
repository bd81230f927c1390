//! Config commands: show, init, path

use anyhow::{Context, Result, bail};
use batchflow_core::Config;
use std::path::Path;

/// Show the effective configuration and where it came from
pub fn cmd_config_show(config: &Config, explicit: Option<&Path>) -> Result<()> {
  let cwd = std::env::current_dir()?;
  let project_config = Config::project_config_path(&cwd);
  let user_config = Config::user_config_path();

  if let Some(path) = explicit {
    println!("Using config: {:?}", path);
  } else if project_config.exists() {
    println!("Using project config: {:?}", project_config);
  } else if let Some(user_path) = user_config.as_ref().filter(|p| p.exists()) {
    println!("Using user config: {:?}", user_path);
  } else {
    println!("Using default configuration (no config file found)");
  }
  println!();

  let toml_str = toml::to_string_pretty(config).context("Failed to render config")?;
  println!("{}", toml_str);

  Ok(())
}

/// Write a commented default config to `.batchflow/config.toml`
pub fn cmd_config_init(force: bool) -> Result<()> {
  let cwd = std::env::current_dir()?;
  let config_path = Config::project_config_path(&cwd);

  if config_path.exists() && !force {
    bail!("Config file already exists: {:?} (use --force to overwrite)", config_path);
  }

  if let Some(parent) = config_path.parent() {
    std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
  }
  std::fs::write(&config_path, Config::generate_template())
    .with_context(|| format!("Failed to write {:?}", config_path))?;

  println!("Created project config: {:?}", config_path);
  println!("Edit the file to customize settings.");
  Ok(())
}

/// Print the config locations in priority order
pub fn cmd_config_path() -> Result<()> {
  let cwd = std::env::current_dir()?;
  let project_config = Config::project_config_path(&cwd);

  println!("Project: {:?}{}", project_config, exists_marker(&project_config));
  match Config::user_config_path() {
    Some(path) => println!("User:    {:?}{}", path, exists_marker(&path)),
    None => println!("User:    (no config directory on this platform)"),
  }
  println!("Logs:    {:?}", Config::data_dir());
  Ok(())
}

fn exists_marker(path: &Path) -> &'static str {
  if path.exists() { " (found)" } else { "" }
}
