// Common test utilities for sgcopy integration tests

#[cfg(test)]
pub mod test_utils {
    #![allow(dead_code)]

    use std::fs;
    use std::path::PathBuf;

    use env_logger::{Builder, Env};

    static INIT: std::sync::Once = std::sync::Once::new();

    pub fn init_logging() {
        INIT.call_once(|| {
            // Set RUST_LOG to whatever you want
            let env = Env::default().default_filter_or("error");
            Builder::from_env(env)
                .format_target(false)
                .format_timestamp(None)
                .init();
        });
    }

    /// Unique scratch path per test and process so parallel runs don't
    /// collide.
    pub fn tmp_path(tag: &str) -> PathBuf {
        PathBuf::from(format!(
            "/tmp/sgcopy_test_{}_{}",
            tag,
            std::process::id()
        ))
    }

    /// Write `blocks` blocks of `bs` bytes where byte i of the file is
    /// a deterministic function of i; handy for byte-exact copy checks.
    pub fn write_patterned_file(path: &std::path::Path, bs: usize, blocks: usize) -> Vec<u8> {
        let mut data = vec![0u8; bs * blocks];
        for (i, b) in data.iter_mut().enumerate() {
            *b = ((i * 7 + i / 256) & 0xff) as u8;
        }
        fs::write(path, &data).expect("failed to write test input file");
        data
    }

    /// Build a config from dd-style operands the way the binary would.
    pub fn config_from(ops: &[&str]) -> sgcopy::CopyConfig {
        let ops: Vec<String> = ops.iter().map(|s| s.to_string()).collect();
        let mut cfg = sgcopy::operands::parse_operands(&ops).expect("operand parse failed");
        sgcopy::operands::validate(&mut cfg).expect("operand validation failed");
        cfg
    }

    pub fn cleanup(paths: &[&std::path::Path]) {
        for p in paths {
            let _ = fs::remove_file(p);
        }
    }
}
