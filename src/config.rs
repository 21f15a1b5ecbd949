use std::env;

/// Runtime knobs, read once at startup. Everything else is compile-time.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,
    /// Path of the SQLite database file.
    pub db_path: String,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            bind_addr: env::var("PONGSRV_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            db_path: env::var("PONGSRV_DB").unwrap_or_else(|_| "pongsrv.db".to_string()),
        }
    }
}
