use std::net::SocketAddr;

use crate::error::ServerError;

pub const DEFAULT_DB_PATH: &str = "cinder-keyserver.db";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8088";
pub const DEFAULT_BUNDLE_PREKEYS: usize = 10;
pub const MAX_UPLOAD_BATCH: usize = 100;

/// Knobs the service itself cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyServerConfig {
    /// How many unconsumed one-time prekeys a bundle fetch returns.
    pub bundle_prekey_limit: usize,
    /// Largest accepted prekey upload, per request.
    pub max_upload_batch: usize,
}

impl Default for KeyServerConfig {
    fn default() -> Self {
        Self {
            bundle_prekey_limit: DEFAULT_BUNDLE_PREKEYS,
            max_upload_batch: MAX_UPLOAD_BATCH,
        }
    }
}

/// Where the binary keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite(String),
    Memory,
}

/// Command-line arguments for the key server daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub storage: StorageBackend,
    pub listen: SocketAddr,
    pub server: KeyServerConfig,
}

/// Parse `--db`, `--listen`, `--bundle-prekeys` and `--memory`.
///
/// Flags win over the `CINDER_*` variables read through `env`, which win over
/// the defaults. Unknown flags are ignored.
pub fn parse_args<I, E>(args: I, env: E) -> Result<Args, ServerError>
where
    I: IntoIterator<Item = String>,
    E: Fn(&str) -> Option<String>,
{
    let mut args = args.into_iter();
    let mut db_path = String::new();
    let mut listen = String::new();
    let mut bundle_prekeys = String::new();
    let mut memory = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => db_path = args.next().unwrap_or_default(),
            "--listen" => listen = args.next().unwrap_or_default(),
            "--bundle-prekeys" => bundle_prekeys = args.next().unwrap_or_default(),
            "--memory" => memory = true,
            _ => {}
        }
    }

    if db_path.is_empty() {
        db_path = env("CINDER_DB").unwrap_or_else(|| DEFAULT_DB_PATH.to_owned());
    }
    if listen.is_empty() {
        listen = env("CINDER_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_owned());
    }
    if bundle_prekeys.is_empty() {
        bundle_prekeys = env("CINDER_BUNDLE_PREKEYS").unwrap_or_default();
    }

    let listen = listen
        .parse()
        .map_err(|e| ServerError::Config(format!("invalid listen address {listen:?}: {e}")))?;

    let bundle_prekey_limit = if bundle_prekeys.is_empty() {
        DEFAULT_BUNDLE_PREKEYS
    } else {
        bundle_prekeys.parse().map_err(|e| {
            ServerError::Config(format!("invalid bundle prekey count {bundle_prekeys:?}: {e}"))
        })?
    };

    let storage = if memory {
        StorageBackend::Memory
    } else {
        StorageBackend::Sqlite(db_path)
    };

    Ok(Args {
        storage,
        listen,
        server: KeyServerConfig {
            bundle_prekey_limit,
            ..KeyServerConfig::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_owned).collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults() {
        let args = parse_args(Vec::new(), no_env).unwrap();
        assert_eq!(args.storage, StorageBackend::Sqlite(DEFAULT_DB_PATH.into()));
        assert_eq!(args.listen, DEFAULT_LISTEN.parse::<SocketAddr>().unwrap());
        assert_eq!(args.server, KeyServerConfig::default());
    }

    #[test]
    fn flags_override_env() {
        let env: HashMap<&str, &str> = [
            ("CINDER_DB", "/env/keys.db"),
            ("CINDER_LISTEN", "0.0.0.0:9000"),
            ("CINDER_BUNDLE_PREKEYS", "3"),
        ]
        .into_iter()
        .collect();
        let lookup = |k: &str| env.get(k).map(|v| (*v).to_owned());

        let args = parse_args(argv("--db /flag/keys.db"), lookup).unwrap();
        assert_eq!(args.storage, StorageBackend::Sqlite("/flag/keys.db".into()));
        assert_eq!(args.listen, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(args.server.bundle_prekey_limit, 3);

        let args = parse_args(argv("--bundle-prekeys 7 --memory"), lookup).unwrap();
        assert_eq!(args.storage, StorageBackend::Memory);
        assert_eq!(args.server.bundle_prekey_limit, 7);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_args(argv("--listen nowhere"), no_env),
            Err(ServerError::Config(_))
        ));
        assert!(matches!(
            parse_args(argv("--bundle-prekeys lots"), no_env),
            Err(ServerError::Config(_))
        ));
    }
}
