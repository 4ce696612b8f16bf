use std::path::PathBuf;

use clap::Parser;

/// Two-letter short flags kept for compatibility; clap only knows
/// single-character shorts, so these are rewritten before parsing.
const LEGACY_SHORT_FLAGS: [(&str, &str); 2] = [("-sk", "--sslkey"), ("-sc", "--sslcert")];

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "pixmail", version, about = "Pixelated user agent.")]
pub(crate) struct Cli {
    #[arg(long, help = "DEBUG mode.")]
    pub(crate) debug: bool,
    #[arg(
        long,
        value_name = "file",
        help = "run in organization mode, the credentials will be read from specified file"
    )]
    pub(crate) dispatcher: Option<PathBuf>,
    #[arg(
        long = "dispatcher-stdin",
        help = "run in organization mode, the credentials will be read from stdin"
    )]
    pub(crate) dispatcher_stdin: bool,
    #[arg(
        long,
        default_value = "127.0.0.1",
        help = "the host to run the user agent on"
    )]
    pub(crate) host: String,
    #[arg(long, default_value_t = 3333, help = "the port to run the user agent on")]
    pub(crate) port: u16,
    #[arg(
        long = "ssl-port",
        default_value_t = 3433,
        help = "the port to run the user agent with SSL support"
    )]
    pub(crate) ssl_port: u16,
    #[arg(
        short = 'c',
        long,
        value_name = "configfile",
        help = "use specified file for credentials (for test purposes only)"
    )]
    pub(crate) config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "server.key",
        help = "use specified file for SSL key (short: -sk)"
    )]
    pub(crate) sslkey: Option<PathBuf>,
    #[arg(
        long,
        value_name = "server.pem",
        help = "use specified file for SSL certificate (short: -sc)"
    )]
    pub(crate) sslcert: Option<PathBuf>,
    #[arg(
        long,
        num_args = 2,
        value_names = ["provider", "username"],
        help = "register a new username on the desired provider"
    )]
    pub(crate) register: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Registration {
    pub(crate) provider: String,
    pub(crate) username: String,
}

impl Cli {
    pub(crate) fn parse_args() -> Self {
        Cli::parse_from(expand_short_flags(std::env::args()))
    }

    pub(crate) fn registration(&self) -> Option<Registration> {
        match self.register.as_deref() {
            Some([provider, username]) => Some(Registration {
                provider: provider.clone(),
                username: username.clone(),
            }),
            _ => None,
        }
    }
}

pub(crate) fn expand_short_flags<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for arg in args {
        let arg = arg.into();
        if passthrough {
            out.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }
        out.push(rewrite_short_flag(arg));
    }
    out
}

fn rewrite_short_flag(arg: String) -> String {
    for (short, long) in LEGACY_SHORT_FLAGS {
        if arg == short {
            return long.to_string();
        }
        if let Some(value) = arg.strip_prefix(short).and_then(|rest| rest.strip_prefix('=')) {
            return format!("{}={}", long, value);
        }
    }
    arg
}
