use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;

use skyimager::config::validator::{parse_gateway_ip, parse_visor_count};
use skyimager::config::{ImagerSettings, SettingsManager};
use skyimager::log_collector::get_global_logs_path;
use skyimager::orchestrator::BuildManifest;
use skyimager::release::{release_strings, ReleaseCatalog};
use skyimager::{bootparams, builder, fetch, net};
use skyimager::{BuildConfig, BuildOrchestrator, LogCollector, LogObserver, RunStatus};

#[derive(Parser)]
#[command(name = "skyimager", version, about = "Build ready-to-flash Skybian images")]
struct Cli {
    /// Also print debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for session log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List base image releases, newest first
    Releases,

    /// Print the boot parameters a build would use
    Params(ImageArgs),

    /// Fetch the base image and build one image per device
    Build {
        #[command(flatten)]
        image: ImageArgs,

        /// Base image: `latest`, a release tag, a URL or a local file
        #[arg(short, long, default_value = "latest")]
        base: String,

        /// Clear a non-empty work directory without asking
        #[arg(short, long)]
        yes: bool,

        /// Keep the existing work directory content (reuses a downloaded base image)
        #[arg(long, conflicts_with = "yes")]
        reuse: bool,
    },

    /// Remove a work directory
    Clear {
        #[arg(short, long)]
        work_dir: Option<PathBuf>,

        #[arg(short, long)]
        yes: bool,
    },

    /// Show the boot parameters of a built image, or the manifest of a work directory
    Inspect { path: PathBuf },
}

#[derive(Args)]
struct ImageArgs {
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Gateway IP shared by every image
    #[arg(short, long)]
    gateway: Option<String>,

    #[arg(short, long, default_value = "")]
    passcode: String,

    /// Number of visor images
    #[arg(long, allow_hyphen_values = true)]
    visors: Option<String>,

    /// Do not build a hypervisor image
    #[arg(long)]
    no_hypervisor: bool,

    /// Hex seed fixing the generated keys
    #[arg(long)]
    seed: Option<String>,
}

impl ImageArgs {
    fn to_config(&self, settings: &ImagerSettings, base: &str) -> skyimager::Result<BuildConfig> {
        let mut config = settings.default_build_config(base).with_passcode(self.passcode.clone());
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        if let Some(gw) = &self.gateway {
            config = config.with_gateway(Some(parse_gateway_ip(gw)?));
        }
        if let Some(visors) = &self.visors {
            config = config.with_visors(parse_visor_count(visors)?);
        }
        if self.no_hypervisor {
            config = config.with_hypervisor(false);
        }
        if let Some(seed) = &self.seed {
            config = config.with_key_seed(seed.clone());
        }
        Ok(config)
    }
}

fn confirm(question: &str) -> bool {
    eprint!("{} [y/N] ", question);
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Two-step flow: report what is there, then clear only once confirmed.
fn prepare_work_dir(dir: &Path, assume_yes: bool) -> skyimager::Result<bool> {
    let state = fetch::inspect_work_dir(dir)?;
    if !state.is_occupied() {
        return Ok(true);
    }
    let question = format!(
        "{} already holds {} entr{}. Clear it?",
        dir.display(),
        state.entries,
        if state.entries == 1 { "y" } else { "ies" }
    );
    if assume_yes || confirm(&question) {
        fetch::clear(dir)?;
        return Ok(true);
    }
    Ok(false)
}

async fn list_releases(settings: &ImagerSettings) -> skyimager::Result<()> {
    let catalog = ReleaseCatalog::from_settings(settings, net::http_client()?)?;
    let (releases, latest) = catalog
        .list_releases(&net::never_cancel(), settings.network_timeout())
        .await?;
    for (line, release) in release_strings(&releases).iter().zip(&releases) {
        let marker = if release.tag == latest.tag { "  (latest)" } else { "" };
        println!("{}{}", line, marker);
    }
    Ok(())
}

async fn run_build(
    settings: ImagerSettings,
    config: BuildConfig,
    assume_yes: bool,
    reuse: bool,
) -> skyimager::Result<RunStatus> {
    if !reuse && !prepare_work_dir(&config.work_dir, assume_yes)? {
        eprintln!("Aborted: work directory left untouched.");
        return Ok(RunStatus::Failed);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("[Main] Interrupt received, cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let orchestrator = BuildOrchestrator::from_settings(settings, Arc::new(LogObserver), cancel_rx)?;
    let report = orchestrator.run(&config).await?;

    for artifact in &report.artifacts {
        match &artifact.error {
            None => println!("ok      {}", artifact.path.display()),
            Some(e) => println!("FAILED  {}: {}", artifact.path.display(), e),
        }
    }
    println!("{}", report.summary);
    Ok(report.status)
}

fn inspect(path: &Path) -> skyimager::Result<()> {
    if path.is_dir() {
        let state = fetch::inspect_work_dir(path)?;
        println!("{}: {} entries", state.path.display(), state.entries);
        let images = path.join("images");
        let manifest_dir = if images.is_dir() { images } else { path.to_path_buf() };
        match BuildManifest::load(&manifest_dir) {
            Ok(manifest) => println!("{}", serde_json::to_string_pretty(&manifest)?),
            Err(e) => eprintln!("No manifest: {}", e),
        }
        return Ok(());
    }
    let params = builder::read_boot_params(path)?;
    println!("{}", bootparams::render(std::slice::from_ref(&params))?);
    Ok(())
}

#[tokio::main]
async fn main() -> skyimager::Result<()> {
    let cli = Cli::parse();

    let log_dir = match cli.log_dir.clone() {
        Some(dir) => dir,
        None => get_global_logs_path()?,
    };
    let mirror = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let collector = LogCollector::new(log_dir, log::LevelFilter::Debug, mirror)?;
    if let Err(e) = collector.install() {
        eprintln!("[Main] WARNING: {}", e);
    }
    log::debug!("[Main] Logging to {}", collector.log_path().display());

    let settings = SettingsManager::load()?;

    let result = match cli.command {
        Command::Releases => list_releases(&settings).await,
        Command::Params(args) => args
            .to_config(&settings, "latest")
            .and_then(|config| Ok(bootparams::generate(&config)?))
            .and_then(|params| Ok(bootparams::render(&params)?))
            .map(|json| println!("{}", json)),
        Command::Build {
            image,
            base,
            yes,
            reuse,
        } => match image.to_config(&settings, &base) {
            Ok(config) => match run_build(settings, config, yes, reuse).await {
                Ok(RunStatus::Completed) => Ok(()),
                Ok(RunStatus::Failed) => Err("build failed".into()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
        Command::Clear { work_dir, yes } => {
            let dir = work_dir.unwrap_or_else(|| settings.default_work_dir.clone());
            prepare_work_dir(&dir, yes).map(|cleared| {
                if !cleared {
                    eprintln!("Nothing removed.");
                }
            })
        }
        Command::Inspect { path } => inspect(&path),
    };

    if let Err(e) = &result {
        match e.downcast_ref::<skyimager::ImagerError>() {
            Some(err) => log::error!("[Main] {}", err.user_message()),
            None => log::error!("[Main] {}", e),
        }
    }
    let _ = collector.wait_for_empty().await;
    result
}
