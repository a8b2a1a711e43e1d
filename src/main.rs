use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use pagesift::image::{self, PageGeometry};
use pagesift::pipeline::{self, RunOptions};
use pagesift::{cli, config, logging, scanner};

fn main() -> ExitCode {
    let cli_opts = cli::parse();
    logging::init_logging(cli_opts.quiet);

    match run(&cli_opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli_opts: &cli::CliOptions) -> Result<()> {
    let loaded = config::load_config(cli_opts.config_path.as_deref())?;
    let mut cfg = loaded.config;
    cli_opts.apply_to(&mut cfg)?;
    cfg.validate()?;

    info!(
        "starting run_id={} input={} output={} threads={} page_size={} margin={}",
        cfg.run_id,
        cli_opts.input.display(),
        cli_opts.output.display(),
        cfg.worker_count(),
        cfg.page_size,
        cfg.margin
    );

    let geometry = PageGeometry::new(cfg.page_size, cfg.margin)?;
    let image: Arc<dyn image::ImageSource> = Arc::from(
        image::open_image(&cli_opts.input, geometry)
            .with_context(|| format!("failed to open {}", cli_opts.input.display()))?,
    );

    let commands = cli_opts.scanner_commands();
    let opts = RunOptions {
        cfg: &cfg,
        config_hash: &loaded.config_hash,
        outdir: &cli_opts.output,
        scanner_commands: &commands,
        command_line: std::env::args().collect(),
    };
    let stats = pipeline::run_scan(&opts, image, scanner::builtin_scanners())?;

    if let Some(digest) = &stats.digest {
        info!("{} {}", stats.hash_alg, digest);
    }
    info!(
        "pagesift run finished: {} pages, {} bytes in {:.2}s",
        stats.pages_scheduled, stats.bytes_scheduled, stats.elapsed_secs
    );
    Ok(())
}
