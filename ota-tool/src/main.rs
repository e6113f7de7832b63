use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use mqtt_house::config::ConfigModel;
use mqtt_house::logging;
use mqtt_house::network::{OtaClient, OtaSettings, Progress, Step, UpdateReport};
use mqtt_house::ota::{Bundle, DirResources};

#[derive(Parser)]
#[command(name = "ota-tool")]
#[command(about = "mqtt_house OTA update tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Args)]
struct Target {
    /// Device configuration (YAML)
    config: PathBuf,

    /// Talk to this host instead of the one derived from the config
    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Push the runtime and configuration to one or more devices
    Deploy {
        /// Device configurations (YAML)
        #[arg(required = true)]
        configs: Vec<PathBuf>,

        /// Talk to this host instead of the one derived from the config
        #[arg(long)]
        host: Option<String>,

        /// Directory containing the mqtt_house package sources
        #[arg(short, long, default_value = ".")]
        resources: PathBuf,
    },
    /// Show the firmware version a device reports
    Version(Target),
    /// Reset a device and wait for it to come back
    Reset(Target),
    /// Discard anything staged on a device
    Rollback(Target),
    /// Write the files a deploy would send into a directory
    Bundle {
        /// Device configuration (YAML)
        config: PathBuf,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Directory containing the mqtt_house package sources
        #[arg(short, long, default_value = ".")]
        resources: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(logging::level_from_verbosity(cli.verbose));

    if let Err(err) = run(cli.command) {
        println!("{} {:#}", "❌".red(), err);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Deploy {
            configs,
            host,
            resources,
        } => deploy(&configs, host.as_deref(), &resources),
        Commands::Version(target) => {
            let client = connect(&target)?;
            let version = client.device_version()?;
            println!("{} {} runs {}", "✔".green(), client.base_url(), version.to_string().bold());
            Ok(())
        }
        Commands::Reset(target) => {
            let client = connect(&target)?;
            let progress = BarProgress::new(MultiProgress::new(), client.base_url());
            let polls = client.reset_and_wait(&progress)?;
            println!("{} {} is back after {} checks", "✔".green(), client.base_url(), polls);
            Ok(())
        }
        Commands::Rollback(target) => {
            let client = connect(&target)?;
            client.rollback()?;
            println!("{} Staging on {} cleared", "✔".green(), client.base_url());
            Ok(())
        }
        Commands::Bundle {
            config,
            out,
            resources,
        } => {
            let model = load(&config)?;
            let bundle = Bundle::build(&model, &DirResources::new(resources))?;
            bundle.write_to(&out)?;
            println!(
                "{} {} files ({} bytes) written to {}",
                "✔".green(),
                bundle.files.len(),
                bundle.total_bytes(),
                out.display()
            );
            Ok(())
        }
    }
}

fn load(path: &Path) -> Result<ConfigModel> {
    ConfigModel::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn connect(target: &Target) -> Result<OtaClient> {
    let model = load(&target.config)?;
    Ok(OtaClient::for_config(
        &model,
        target.host.as_deref(),
        OtaSettings::default(),
    )?)
}

/// Devices are updated one after another; a failure does not stop the rest.
fn deploy(configs: &[PathBuf], host: Option<&str>, resources: &Path) -> Result<()> {
    if host.is_some() && configs.len() > 1 {
        bail!("--host can only be used with a single configuration");
    }

    let resources = DirResources::new(resources);
    let multi = MultiProgress::new();
    let update = |path: &PathBuf| -> Result<UpdateReport> {
        let model = load(path)?;
        let client = OtaClient::for_config(&model, host, OtaSettings::default())?;
        let progress = BarProgress::new(multi.clone(), &model.device.name);
        let report = client.update(&model, &resources, &progress)?;
        let _ = multi.println(format!(
            "{} {} updated from {}: {} files, {} bytes",
            "✔".green(),
            model.device.name.bold(),
            report.previous_version,
            report.files,
            report.bytes
        ));
        Ok(report)
    };

    let total = configs.len();
    let mut failed = 0;
    for path in configs {
        if let Err(err) = update(path) {
            failed += 1;
            println!("{} {}: {:#}", "❌".red(), path.display(), err);
        }
    }

    if total > 1 {
        println!("\n{} {}/{} successful", "Update complete:".green(), total - failed, total);
    }
    if failed > 0 {
        bail!("{} of {} updates failed", failed, total);
    }
    Ok(())
}

/// One progress bar per step, stacked under a shared `MultiProgress`.
struct BarProgress {
    multi: MultiProgress,
    label: String,
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    fn new(multi: MultiProgress, label: &str) -> Self {
        Self {
            multi,
            label: label.to_string(),
            bar: Mutex::new(None),
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
                self.multi.remove(&bar);
            }
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:.bold} {spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }
}

impl Progress for BarProgress {
    fn start(&self, step: Step, total: u64) {
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(Self::style());
        bar.set_prefix(self.label.clone());
        bar.set_message(step.description());
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(bar);
        }
    }

    fn advance(&self, _step: Step, delta: u64) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.inc(delta);
            }
        }
    }

    fn finish(&self, step: Step) {
        self.clear();
        let _ = self
            .multi
            .println(format!("{} {}: {}", "✔".green(), self.label, step.description()));
    }

    // The caller prints the error
    fn fail(&self, _step: Step) {
        self.clear();
    }
}
