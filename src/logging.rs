//! Logging setup for the gateway.
//!
//! Lines carry the source location so output can be traced back quickly:
//!
//! ```text
//! INFO  [src/network.rs:118] 192.168.1.77
//! ```
//!
//! The filter comes from the config file unless `RUST_LOG` is set.

use std::io::Write;

use anyhow::Result;
use env_logger::{Builder, Env};

pub fn init(default_filter: &str) -> Result<()> {
    builder(default_filter).try_init()?;
    Ok(())
}

fn builder(default_filter: &str) -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or(default_filter));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{:<5} [{}:{}] {}",
            record.level(),
            record.file().unwrap_or(record.target()),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // Another test may have installed the logger first, so only the
        // second call is guaranteed to fail
        let _ = init("debug");
        assert!(init("debug").is_err());
    }
}
