use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use routeros_synth::config::Config;
use routeros_synth::{synthesize, Catalog, CatalogHandle, RenderedConfiguration, SiteParameters, ValidationReport};

const USAGE: &str = "usage: routeros-synth <template-id> <params.json> [fragment ...]";

/// One synthesis request from the command line
#[derive(Debug, Clone)]
struct Request {
    template_id: String,
    params_path: PathBuf,
    fragments: Vec<String>,
}

impl Request {
    fn from_args(mut args: impl Iterator<Item = String>) -> Option<Self> {
        let template_id = args.next()?;
        let params_path = PathBuf::from(args.next()?);
        Some(Self {
            template_id,
            params_path,
            fragments: args.collect(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "routeros_synth=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(request) = Request::from_args(std::env::args().skip(1)) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    // Load configuration
    let cfg = Config::load();
    tracing::info!("Starting routeros-synth");
    tracing::info!("Catalog: {}", cfg.catalog_dir.display());
    tracing::info!("Output: {}", cfg.output_dir.display());

    let params = load_params(&request.params_path).await?;
    let handle = Arc::new(
        CatalogHandle::open(&cfg.catalog_dir)
            .with_context(|| format!("failed to load catalog from {}", cfg.catalog_dir.display()))?,
    );

    let accepted = run_once(&handle.snapshot(), &request, &params, &cfg.output_dir).await?;

    if !cfg.catalog_watch {
        if !accepted {
            std::process::exit(1);
        }
        return Ok(());
    }

    watch_catalog(handle, &request, &params, &cfg).await
}

async fn load_params(path: &Path) -> Result<SiteParameters> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    SiteParameters::from_json(&json).with_context(|| format!("invalid site parameters in {}", path.display()))
}

/// Synthesize and write outputs; returns whether the configuration was accepted
async fn run_once(catalog: &Catalog, request: &Request, params: &SiteParameters, output_dir: &Path) -> Result<bool> {
    let (config, report) = synthesize(catalog, &request.template_id, &request.fragments, params)
        .with_context(|| format!("failed to synthesize {} from {}", params.device_name, request.template_id))?;

    write_outputs(&config, &report, &params.device_name, output_dir).await?;
    Ok(report.accepted())
}

async fn write_outputs(
    config: &RenderedConfiguration,
    report: &ValidationReport,
    device_name: &str,
    output_dir: &Path,
) -> Result<()> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let script_path = output_dir.join(format!("{}.rsc", device_name));
    tokio::fs::write(&script_path, config.to_script())
        .await
        .with_context(|| format!("failed to write {}", script_path.display()))?;

    let summary = serde_json::json!({
        "synthesis_id": config.id(),
        "generated_at": config.generated_at(),
        "template_id": config.template_id(),
        "template_version": config.template_version(),
        "family": config.family(),
        "catalog_generation": config.catalog_generation(),
        "applied_fragments": config.applied_fragments(),
        "accepted": report.accepted(),
        "items": report,
    });
    let report_path = output_dir.join(format!("{}.report.json", device_name));
    tokio::fs::write(&report_path, serde_json::to_string_pretty(&summary)?)
        .await
        .with_context(|| format!("failed to write {}", report_path.display()))?;

    tracing::info!(
        "Wrote {} and {} ({})",
        script_path.display(),
        report_path.display(),
        if report.accepted() { "accepted" } else { "rejected" }
    );
    Ok(())
}

/// Reload reads and parses files, so it runs on the blocking pool
async fn reload_catalog(handle: &Arc<CatalogHandle>) -> Result<Arc<Catalog>> {
    let handle = Arc::clone(handle);
    let catalog = tokio::task::spawn_blocking(move || handle.reload())
        .await
        .context("catalog reload task failed")??;
    Ok(catalog)
}

/// Re-synthesize whenever the catalog directory changes, until shutdown
async fn watch_catalog(handle: Arc<CatalogHandle>, request: &Request, params: &SiteParameters, cfg: &Config) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() => {
            let _ = tx.send(());
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Catalog watch error: {}", e),
    })
    .context("failed to create catalog watcher")?;
    watcher
        .watch(handle.root(), RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", handle.root().display()))?;
    tracing::info!("Watching {} for catalog changes", handle.root().display());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(()) = rx.recv() => {
                // Editors write in bursts; settle before reloading
                tokio::time::sleep(cfg.watch_debounce).await;
                while rx.try_recv().is_ok() {}

                let catalog = match reload_catalog(&handle).await {
                    Ok(catalog) => catalog,
                    Err(e) => {
                        tracing::warn!("Keeping previous catalog: {:#}", e);
                        continue;
                    }
                };
                if let Err(e) = run_once(&catalog, request, params, &cfg.output_dir).await {
                    tracing::error!("{:#}", e);
                }
            }
        }
    }

    drop(watcher);
    tracing::info!("routeros-synth shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => { sig.recv().await; }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOWER: &str = "@version 1\n@family tower\n[identity]\n/system identity set name={{device_name}}\n";

    #[tokio::test]
    async fn test_reload_runs_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        std::fs::write(dir.path().join("templates/tower.tmpl"), TOWER).unwrap();
        let handle = Arc::new(CatalogHandle::open(dir.path()).unwrap());

        std::fs::write(dir.path().join("templates/tower.tmpl"), TOWER.replace("@version 1", "@version 2")).unwrap();
        let catalog = reload_catalog(&handle).await.unwrap();
        assert_eq!(catalog.generation(), 2);
        assert_eq!(catalog.resolve("tower").unwrap().version, 2);

        std::fs::write(dir.path().join("templates/broken.tmpl"), "@family nowhere\n").unwrap();
        assert!(reload_catalog(&handle).await.is_err());
        assert_eq!(handle.snapshot().generation(), 2);
    }
}
