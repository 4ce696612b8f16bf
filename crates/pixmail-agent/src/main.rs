use std::io;

use anyhow::Result;
use log::{info, warn};
use serde_json::{Value as JsonValue, json};

mod cli;
mod cli_config;

use crate::cli::Cli;
use crate::cli_config::{CredentialSource, Credentials, credential_source, load_credentials};

const LAUNCH_SCHEMA_VERSION: &str = "pixmail.launch.v1";

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.debug);

    let source = credential_source(&cli);
    if cli.dispatcher_stdin && cli.dispatcher.is_some() {
        warn!("--dispatcher-stdin given, ignoring --dispatcher file");
    }
    let credentials = load_credentials(&cli, io::stdin().lock())?;
    info!(
        "user agent on {}:{} (ssl {})",
        cli.host, cli.port, cli.ssl_port
    );

    println!(
        "{}",
        serde_json::to_string(&launch_summary(&cli, source, credentials.as_ref()))?
    );
    Ok(())
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

/// Resolved launch settings, as handed to the serving layer. The password
/// never appears here.
fn launch_summary(
    cli: &Cli,
    source: CredentialSource,
    credentials: Option<&Credentials>,
) -> JsonValue {
    let registration = cli.registration().map(|reg| {
        json!({
            "provider": reg.provider,
            "username": reg.username,
        })
    });
    let tls = match (&cli.sslkey, &cli.sslcert) {
        (Some(key), Some(cert)) => json!({
            "key": key.display().to_string(),
            "cert": cert.display().to_string(),
        }),
        _ => JsonValue::Null,
    };
    json!({
        "schema": LAUNCH_SCHEMA_VERSION,
        "debug": cli.debug,
        "host": cli.host,
        "port": cli.port,
        "ssl_port": cli.ssl_port,
        "tls": tls,
        "credentials": {
            "source": source,
            "provider": credentials.map(|c| c.provider.as_str()),
            "user": credentials.map(|c| c.user.as_str()),
        },
        "register": registration,
    })
}
