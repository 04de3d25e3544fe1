use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vmsentry_core::instance_config::{InstanceConfig, InterfaceConfig, StatusCheckPolicy};
use vmsentry_core::lifecycle::{CommandOutcome, LifecycleCommand};
use vmsentry_core::scenario::{Scenario, ScenarioReport};
use vmsentry_core::HarnessConfig;
use vmsentry_vm::node::{LocalNode, Node, SshNode};
use vmsentry_vm::{packages, BackendRegistry};

#[derive(Parser)]
#[command(name = "vmsentry")]
#[command(about = "VM service lifecycle adaptor and scenario runner", long_about = None)]
struct Cli {
    /// Harness configuration file (TOML); VMSENTRY_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run node commands on this host over ssh instead of locally
    #[arg(long, global = true)]
    host: Option<String>,

    /// Remote user for --host
    #[arg(long, global = true, default_value = "root")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a lifecycle command against one VM service
    ///
    /// Everything after the lifecycle command belongs to it, so --backend
    /// goes before the service name.
    Service {
        /// Backend to drive; must precede NAME
        #[arg(long, default_value = "virsh")]
        backend: String,

        /// VM service name
        name: String,

        /// start | status | stop | stop-undefine [--stop-timeout N] | force-stop-undefine
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Scenario files
    Scenario {
        #[command(subcommand)]
        command: ScenarioCommands,
    },
    /// Instance config.json handling
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Prerequisites on the node
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },
    /// List available backends
    Backends,
}

#[derive(Subcommand)]
enum ScenarioCommands {
    /// Run one or more scenarios; several files run concurrently
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, default_value = "simulated")]
        backend: String,

        /// Image present in the simulated pool (repeatable)
        #[arg(long = "pool-image", default_values_t = vec!["rhel.img".to_string()])]
        pool_images: Vec<String>,

        /// Print the reports as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print a config.json, optionally staging it into an instance directory
    Render {
        #[arg(long)]
        image: String,

        #[arg(long, default_value = "2")]
        cpu: String,

        #[arg(long, default_value = "256M")]
        ram: String,

        /// NAME:BRIDGE[:IP], e.g. eth0:br0:10.46.80.14 (repeatable)
        #[arg(long = "interface")]
        interfaces: Vec<String>,

        /// Turn the internal status check on against this address
        #[arg(long)]
        status_check: Option<String>,

        #[arg(long)]
        start_timeout: Option<u64>,

        #[arg(long)]
        status_timeout: Option<u64>,

        #[arg(long)]
        status_retry: Option<u32>,

        /// Also write it as config.json of this VM service
        #[arg(long)]
        stage: Option<String>,
    },
    /// Print the effective harness configuration
    Show,
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Install a package with yum unless rpm already knows it
    EnsurePackage { package: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("vmsentry=info".parse().context("Invalid log directive")?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let node = select_node(cli.host.as_deref(), &cli.user);

    match cli.command {
        Commands::Service {
            name,
            args,
            backend,
        } => {
            let code = run_service(&config, node, &backend, &name, &args).await?;
            std::process::exit(os_exit_code(code));
        }
        Commands::Scenario {
            command:
                ScenarioCommands::Run {
                    files,
                    backend,
                    pool_images,
                    json,
                },
        } => {
            let reports = run_scenarios(config, node, &backend, pool_images, &files).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    print_report(report);
                }
            }
            if !reports.iter().all(ScenarioReport::passed) {
                std::process::exit(1);
            }
        }
        Commands::Config {
            command:
                ConfigCommands::Render {
                    image,
                    cpu,
                    ram,
                    interfaces,
                    status_check,
                    start_timeout,
                    status_timeout,
                    status_retry,
                    stage,
                },
        } => {
            let mut instance = InstanceConfig::new(image);
            instance.vm_data.cpu = cpu;
            instance.vm_data.ram = ram;
            for spec in &interfaces {
                let (name, interface) = parse_interface(spec)?;
                instance = instance.with_interface(name, interface);
            }
            if let Some(ip) = status_check {
                instance = instance.with_status_check(StatusCheckPolicy::on(ip));
            }
            let data = &mut instance.adaptor_data;
            data.start_timeout = start_timeout.unwrap_or(data.start_timeout);
            data.status_timeout = status_timeout.unwrap_or(data.status_timeout);
            data.status_retry = status_retry.unwrap_or(data.status_retry);
            instance.validate()?;

            print!("{}", instance.render()?);
            if let Some(name) = stage {
                let (adaptor, _) = BackendRegistry::standard(node, Vec::new())
                    .create_backend("virsh", &config)?
                    .into_adaptor(config);
                adaptor
                    .stage_config(&name, &instance)
                    .await
                    .with_context(|| format!("Failed to stage config.json for {}", name))?;
                tracing::info!(instance = %name, "Staged config.json");
            }
        }
        Commands::Config {
            command: ConfigCommands::Show,
        } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Node {
            command: NodeCommands::EnsurePackage { package },
        } => {
            let installed = packages::ensure_installed(node.as_ref(), &package).await?;
            if installed {
                println!("Installed {} on {}", package, node.name());
            } else {
                println!("{} is already installed on {}", package, node.name());
            }
        }
        Commands::Backends => {
            let registry = BackendRegistry::standard(node, Vec::new());
            for backend in registry.list_available_backends() {
                println!("{}", backend);
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HarnessConfig> {
    let config = match path {
        Some(path) => HarnessConfig::from_file(path)?.with_env_overrides()?,
        None => HarnessConfig::from_env()?,
    };
    Ok(config)
}

fn select_node(host: Option<&str>, user: &str) -> Arc<dyn Node> {
    match host {
        Some(host) => Arc::new(SshNode::new(host).with_user(user)),
        None => Arc::new(LocalNode::new()),
    }
}

async fn run_service(
    config: &HarnessConfig,
    node: Arc<dyn Node>,
    backend: &str,
    name: &str,
    args: &[String],
) -> anyhow::Result<i32> {
    let command = LifecycleCommand::parse_args(args)?;
    let (adaptor, _) = BackendRegistry::standard(node, Vec::new())
        .create_backend(backend, config)?
        .into_adaptor(config.clone());

    let outcome = adaptor
        .run(name, &command)
        .await
        .with_context(|| format!("{} {} failed", name, command))?;
    for line in &outcome.log {
        println!("{}", line);
    }
    if let Err(e) = append_adaptor_log(&config.adaptor_log, name, &outcome) {
        tracing::warn!(path = %config.adaptor_log.display(), error = %e, "Could not write adaptor log");
    }
    Ok(outcome.exit_code())
}

async fn run_scenarios(
    config: HarnessConfig,
    node: Arc<dyn Node>,
    backend: &str,
    pool_images: Vec<String>,
    files: &[PathBuf],
) -> anyhow::Result<Vec<ScenarioReport>> {
    let scenarios = files
        .iter()
        .map(|f| Scenario::from_file(f).with_context(|| format!("Failed to load scenario {}", f.display())))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if scenarios.is_empty() {
        bail!("no scenarios given");
    }

    let runner = BackendRegistry::standard(node, pool_images)
        .create_backend(backend, &config)?
        .into_runner(config);
    Ok(runner.run_all(&scenarios).await)
}

fn print_report(report: &ScenarioReport) {
    println!(
        "{} {} ({})",
        if report.passed() { "PASS" } else { "FAIL" },
        report.scenario,
        report.run_id
    );
    for step in &report.steps {
        let exit = step
            .exit_code
            .map(|c| format!(" [exit {}]", c))
            .unwrap_or_default();
        println!(
            "  {:>3} {} {}{}",
            step.index,
            if step.passed { "ok  " } else { "FAIL" },
            step.description,
            exit
        );
        if let Some(message) = step.message.as_ref().filter(|_| !step.passed) {
            println!("      {}", message);
        }
    }
}

/// `eth0:br0` or `eth0:br0:10.46.80.14`
fn parse_interface(spec: &str) -> anyhow::Result<(String, InterfaceConfig)> {
    let mut parts = spec.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(bridge), ip, None) if !name.is_empty() && !bridge.is_empty() => Ok((
            name.to_string(),
            InterfaceConfig {
                host_device: bridge.to_string(),
                ipaddress: ip.filter(|ip| !ip.is_empty()).map(str::to_string),
                mac_address: None,
            },
        )),
        _ => bail!("invalid --interface '{}', expected NAME:BRIDGE[:IP]", spec),
    }
}

fn append_adaptor_log(path: &Path, name: &str, outcome: &CommandOutcome) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let stamp = chrono::Local::now().format("%b %e %H:%M:%S");
    for line in &outcome.log {
        writeln!(file, "{} vmsentry[{}]: {}", stamp, name, line)?;
    }
    Ok(())
}

/// Exit statuses are a byte; -1 becomes 255
fn os_exit_code(code: i32) -> i32 {
    code.rem_euclid(256)
}
