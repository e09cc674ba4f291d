use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use fancy_regex::Regex;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::extfs::kernel::Errno;

/// Machine file, e.g.
///
/// ```yaml
/// carnet_suffix: "53"
/// allow_commands_without_session: false
/// registry: disks.yaml
/// log_level: info
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
  /// Two digits every mount id starts with.
  pub carnet_suffix: String,
  pub allow_commands_without_session: bool,
  /// Where created disks are remembered. Relative to the machine file.
  pub registry: Option<PathBuf>,
  pub log_level: String,
}

impl Default for MachineConfig {
  fn default() -> Self {
    Self {
      carnet_suffix: String::from("53"),
      allow_commands_without_session: false,
      registry: None,
      log_level: String::from("info"),
    }
  }
}

impl MachineConfig {
  /// Read a machine file. A missing file gives the defaults.
  pub fn load(path: &Path) -> Result<Self, Errno> {
    if !path.exists() {
      debug!("machine: {} not found, using defaults", path.display());
      return Ok(Self::default());
    }
    let content = std::fs::read_to_string(path).map_err(|error| Errno::from(error).context(&path.display().to_string()))?;
    let mut config = if content.trim().is_empty() {
      Self::default()
    } else {
      serde_yaml::from_str::<Self>(&content)
        .map_err(|error| Errno::EINVAL(format!("machine: {}: {error}", path.display())))?
    };

    if let (Some(registry), Some(parent)) = (&config.registry, path.parent()) {
      if registry.is_relative() {
        config.registry = Some(parent.join(registry));
      }
    }
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), Errno> {
    let two_digits = Regex::new("^[0-9]{2}$")
      .and_then(|regex| regex.is_match(&self.carnet_suffix))
      .map_err(|error| Errno::EINVAL(format!("machine: {error}")))?;
    if !two_digits {
      return Err(Errno::EINVAL(format!(
        "machine: carnet_suffix must be two digits, got '{}'",
        self.carnet_suffix
      )));
    }
    Ok(())
  }
}

/// Disks created through `mkdisk`, optionally persisted as YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRegistry {
  disks: BTreeSet<PathBuf>,
  #[serde(skip)]
  file: Option<PathBuf>,
}

impl DiskRegistry {
  pub fn load(file: Option<&Path>) -> Result<Self, Errno> {
    let file = match file {
      Some(file) => file,
      None => return Ok(Self::default()),
    };
    let mut registry = match std::fs::read_to_string(file) {
      Ok(content) if !content.trim().is_empty() => serde_yaml::from_str::<Self>(&content)
        .map_err(|error| Errno::EINVAL(format!("registry: {}: {error}", file.display())))?,
      Ok(_) => Self::default(),
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => Self::default(),
      Err(error) => return Err(Errno::from(error).context(&file.display().to_string())),
    };
    registry.file = Some(file.to_owned());
    Ok(registry)
  }

  fn save(&self) -> Result<(), Errno> {
    let file = match &self.file {
      Some(file) => file,
      None => return Ok(()),
    };
    let yaml = serde_yaml::to_string(self).map_err(|error| Errno::EIO(format!("registry: {error}")))?;
    if let Some(parent) = file.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(file, yaml)?;
    Ok(())
  }

  pub fn add(&mut self, path: &Path) -> Result<(), Errno> {
    if self.disks.insert(path.to_owned()) {
      self.save()?;
    }
    Ok(())
  }

  pub fn remove(&mut self, path: &Path) -> Result<(), Errno> {
    if self.disks.remove(path) {
      self.save()?;
    }
    Ok(())
  }

  /// Registered disks that still exist on the host.
  pub fn disks(&self) -> Vec<PathBuf> {
    self.disks.iter().filter(|path| path.is_file()).cloned().collect()
  }
}


// vim:ts=2 sw=2
