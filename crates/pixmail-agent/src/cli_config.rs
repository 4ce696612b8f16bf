use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use log::debug;
use serde::{Deserialize, Serialize};

use super::cli::Cli;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct Credentials {
    #[serde(rename = "leap_provider_hostname")]
    pub(crate) provider: String,
    pub(crate) user: String,
    pub(crate) password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum CredentialSource {
    DispatcherStdin,
    DispatcherFile,
    ConfigFile,
    Interactive,
}

/// stdin wins over a dispatcher file, which wins over `--config`.
pub(crate) fn credential_source(cli: &Cli) -> CredentialSource {
    if cli.dispatcher_stdin {
        CredentialSource::DispatcherStdin
    } else if cli.dispatcher.is_some() {
        CredentialSource::DispatcherFile
    } else if cli.config.is_some() {
        CredentialSource::ConfigFile
    } else {
        CredentialSource::Interactive
    }
}

pub(crate) fn load_credentials<R: Read>(cli: &Cli, stdin: R) -> Result<Option<Credentials>> {
    let credentials = match credential_source(cli) {
        CredentialSource::DispatcherStdin => {
            read_dispatcher_credentials(stdin).context("reading credentials from stdin")?
        }
        CredentialSource::DispatcherFile => {
            let path = cli
                .dispatcher
                .as_deref()
                .ok_or_else(|| anyhow!("dispatcher file not given"))?;
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening dispatcher file {}", path.display()))?;
            read_dispatcher_credentials(file)
                .with_context(|| format!("reading dispatcher file {}", path.display()))?
        }
        CredentialSource::ConfigFile => {
            let path = cli
                .config
                .as_deref()
                .ok_or_else(|| anyhow!("config file not given"))?;
            load_config_credentials(path)?
        }
        CredentialSource::Interactive => return Ok(None),
    };
    debug!(
        "loaded credentials for {}@{}",
        credentials.user, credentials.provider
    );
    Ok(Some(credentials))
}

/// Dispatcher payload: one JSON object with `leap_provider_hostname`,
/// `user` and `password`.
pub(crate) fn read_dispatcher_credentials<R: Read>(mut reader: R) -> Result<Credentials> {
    let mut content = String::new();
    reader.read_to_string(&mut content)?;
    let credentials = serde_json::from_str(content.trim())?;
    Ok(credentials)
}

pub(crate) fn load_config_credentials(path: &Path) -> Result<Credentials> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    parse_config_credentials(&content)
        .with_context(|| format!("invalid config file {}", path.display()))
}

fn parse_config_credentials(content: &str) -> Result<Credentials> {
    let value: toml::Value = toml::from_str(content)?;
    let section = value
        .get("pixelated")
        .ok_or_else(|| anyhow!("missing [pixelated] section"))?;
    Ok(Credentials {
        provider: required_str(section, "leap_server_name")?,
        user: required_str(section, "user")?,
        password: required_str(section, "password")?,
    })
}

fn required_str(section: &toml::Value, key: &str) -> Result<String> {
    section
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing {} in [pixelated]", key))
}
