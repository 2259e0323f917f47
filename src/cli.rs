use std::path::PathBuf;

use clap::Parser;

use crate::config::{KernelConfig, ReviewPolicy};

#[derive(Parser, Debug)]
#[command(name = "genesis-kernel")]
#[command(version = "4.0.0")]
#[command(about = "Autonomous change loop: propose, check, verify, review and integrate")]
pub struct Args {
    /// TOML configuration file (defaults are used when omitted)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Address for the HTTP interface, overrides server.addr
    #[arg(long)]
    pub addr: Option<String>,

    /// Review policy for verified proposals, overrides pipeline.review
    #[arg(long, value_enum)]
    pub review: Option<ReviewPolicy>,

    /// Run a single request through the pipeline, print the task and exit
    #[arg(long, value_name = "DESCRIPTION")]
    pub implement: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// SQLite database path, overrides storage.db_path
    #[arg(long)]
    pub db: Option<PathBuf>,
}

impl Args {
    /// Fold command-line overrides into a loaded config.
    pub fn apply(&self, cfg: &mut KernelConfig) {
        if let Some(addr) = &self.addr {
            cfg.server.addr = addr.clone();
        }
        if let Some(review) = self.review {
            cfg.pipeline.review = review;
        }
        if let Some(db) = &self.db {
            cfg.storage.db_path = db.clone();
        }
    }

    /// Config from `--config`, or defaults.
    pub fn load_config(&self) -> crate::error::Result<KernelConfig> {
        let mut cfg = match &self.config {
            Some(path) => KernelConfig::load(path)?,
            None => KernelConfig::default(),
        };
        self.apply(&mut cfg);
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["gk"]);
        assert!(args.config.is_none());
        assert!(args.addr.is_none());
        assert!(args.review.is_none());
        assert!(args.implement.is_none());
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "gk",
            "--config",
            "kernel.toml",
            "--addr",
            "0.0.0.0:9000",
            "--review",
            "auto-merge",
            "--implement",
            "faster recall",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("kernel.toml")));
        assert_eq!(args.addr.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(args.review, Some(ReviewPolicy::AutoMerge));
        assert_eq!(args.implement.as_deref(), Some("faster recall"));
        assert_eq!(args.log_level, "debug");
    }

    #[test]
    fn test_args_parse_review_required() {
        let args = Args::parse_from(["gk", "--review", "required"]);
        assert_eq!(args.review, Some(ReviewPolicy::Required));
    }

    #[test]
    fn test_args_reject_unknown_review() {
        assert!(Args::try_parse_from(["gk", "--review", "sometimes"]).is_err());
    }

    #[test]
    fn test_overrides_apply_to_defaults() {
        let args = Args::parse_from(["gk", "--addr", "127.0.0.1:1", "--review", "auto-merge", "--db", "x.db"]);
        let cfg = args.load_config().unwrap();
        assert_eq!(cfg.server.addr, "127.0.0.1:1");
        assert_eq!(cfg.pipeline.review, ReviewPolicy::AutoMerge);
        assert_eq!(cfg.storage.db_path, PathBuf::from("x.db"));
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[server]\naddr = \"127.0.0.1:7000\"\n[pipeline]\nreview = \"auto_merge\"").unwrap();
        let path = f.path().to_str().unwrap().to_string();
        let args = Args::parse_from(["gk", "--config", &path, "--review", "required"]);
        let cfg = args.load_config().unwrap();
        assert_eq!(cfg.server.addr, "127.0.0.1:7000");
        assert_eq!(cfg.pipeline.review, ReviewPolicy::Required);
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let args = Args::parse_from(["gk", "--config", "/nonexistent/kernel.toml"]);
        assert!(args.load_config().is_err());
    }
}
