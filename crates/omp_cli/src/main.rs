//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `omp_core` linkage.
//! - Print the CLI version.
//! - `omp_cli migrate` opens (and migrates) the store named by `OMP_DB_PATH`.

use omp_core::db::migrations::latest_version;
use omp_core::db::open_db_from_config;
use omp_core::OmpConfig;
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("omp_cli version={}", env!("CARGO_PKG_VERSION"));

    if std::env::args().nth(1).as_deref() != Some("migrate") {
        return ExitCode::SUCCESS;
    }

    let config = OmpConfig::from_env();
    match open_db_from_config(&config) {
        Ok(_) => {
            println!(
                "omp_core db={} schema_version={}",
                config.db_path.display(),
                latest_version()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("omp_core db={} error={err}", config.db_path.display());
            ExitCode::FAILURE
        }
    }
}
