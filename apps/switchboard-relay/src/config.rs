use std::env;
use std::net::SocketAddr;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
}

impl Config {
    /// Reads `SWITCHBOARD_RELAY_BIND`, falling back to [`DEFAULT_BIND`] when unset or unparsable.
    pub fn from_env() -> Self {
        let bind = env::var("SWITCHBOARD_RELAY_BIND")
            .ok()
            .and_then(|value| match value.trim().parse() {
                Ok(addr) => Some(addr),
                Err(err) => {
                    tracing::warn!(
                        target: "switchboard::relay",
                        value = %value,
                        error = %err,
                        "ignoring invalid SWITCHBOARD_RELAY_BIND"
                    );
                    None
                }
            })
            .unwrap_or_else(default_bind);
        Self { bind }
    }

    pub fn with_bind(mut self, bind: Option<SocketAddr>) -> Self {
        if let Some(bind) = bind {
            self.bind = bind;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
