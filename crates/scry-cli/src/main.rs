use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scry_config::{ClassConfig, ScryConfig};
use scry_engine::{
    BoxError, ChannelObserver, ClassRegistry, LaunchedTarget, Session, SessionEvent,
    SessionHandle, SourceClass, SourceLocation, SuspendReason, TerminationReason,
};
use scry_jdwp::{JdwpClient, JdwpClientConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

mod commands;

use commands::Command;

/// How long a launched target gets to exit on its own once the session ends.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(3);

/// Scry: watch a JVM program stop at breakpoints and inspect its locals.
///
/// Controller commands are read from stdin while the session runs; type
/// `help` for the list.
#[derive(Debug, Parser)]
#[command(name = "scry", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `SCRY_CONFIG` is used as a fallback. When neither are
    /// provided the built-in defaults apply.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Launch a JVM suspended under the debugger.
    Run(RunArgs),
    /// Attach to a JVM started with `-agentlib:jdwp=transport=dt_socket,server=y`.
    Attach(AttachArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Main class of the target; overrides `launch.main_class`.
    #[arg(long = "main", value_name = "CLASS")]
    main_class: Option<String>,

    /// Classpath entries, appended to `launch.classpath`.
    #[arg(long, alias = "cp", value_name = "PATH")]
    classpath: Vec<PathBuf>,

    /// The `java` executable; overrides `launch.java`.
    #[arg(long)]
    java: Option<PathBuf>,

    #[command(flatten)]
    session: SessionArgs,

    /// Arguments passed to the target's `main`.
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Debug, Args)]
struct AttachArgs {
    /// Address the target's JDWP agent listens on.
    address: SocketAddr,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Breakpoint to install once the class loads. Watches the class.
    #[arg(long = "break", value_name = "CLASS:LINE", value_parser = parse_break)]
    breakpoints: Vec<(String, u32)>,

    /// Watch a class without any initial breakpoint.
    #[arg(long = "watch", value_name = "CLASS")]
    watch: Vec<String>,

    /// Directories searched for `<package path>/<Class>.java`.
    #[arg(long = "source-root", value_name = "DIR")]
    source_roots: Vec<PathBuf>,

    /// Resume automatically after printing every suspension.
    #[arg(long)]
    auto_continue: bool,

    /// Print session events as JSON lines.
    #[arg(long)]
    json: bool,
}

fn parse_break(text: &str) -> Result<(String, u32), String> {
    commands::parse_location(text).map_err(|err| err.to_string())
}

enum Target {
    Launch,
    Attach(SocketAddr),
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config);

    let (target, args) = match cli.mode {
        Mode::Run(run) => {
            if let Some(main_class) = run.main_class {
                config.launch.main_class = Some(main_class);
            }
            if let Some(java) = run.java {
                config.launch.java = java;
            }
            config.launch.classpath.extend(run.classpath);
            if !run.args.is_empty() {
                config.launch.args = run.args;
            }
            (Target::Launch, run.session)
        }
        Mode::Attach(attach) => (Target::Attach(attach.address), attach.session),
    };
    apply_session_args(&mut config, &args);
    config.validate().context("invalid configuration")?;
    scry_config::init_tracing(&config.logging);

    let roots = if args.source_roots.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        args.source_roots.clone()
    };
    let (classes, sources) = register_classes(&config, &roots);
    if classes.watched_classes().is_empty() {
        tracing::warn!(
            target: "scry.cli",
            "no classes watched; the target will run without stopping"
        );
    }

    let (observer, events) = ChannelObserver::new();
    let reason = match target {
        Target::Launch => {
            let LaunchedTarget {
                client,
                mut child,
                output,
                port,
            } = scry_engine::launch(&config.launch, &config.jdwp).await?;
            tracing::info!(target: "scry.cli", port, "attached to launched target");

            let session = Session::new(Arc::new(client), classes, config.session.clone(), observer)
                .with_output(output);
            let reason = drive(session, events, &sources, &args).await?;

            match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::info!(target: "scry.cli", %status, "target exited"),
                Ok(Err(err)) => {
                    tracing::warn!(
                        target: "scry.cli",
                        error = %err,
                        "failed to wait for target"
                    );
                }
                Err(_elapsed) => {
                    tracing::warn!(target: "scry.cli", "target still running; killing it");
                    if let Err(err) = child.kill().await {
                        tracing::warn!(target: "scry.cli", error = %err, "failed to kill target");
                    }
                }
            }
            reason
        }
        Target::Attach(address) => {
            let client_config = JdwpClientConfig {
                handshake_timeout: config.jdwp.handshake_timeout(),
                reply_timeout: config.jdwp.reply_timeout(),
            };
            let client = JdwpClient::connect_with_config(address, client_config)
                .await
                .with_context(|| format!("failed to attach to {address}"))?;
            tracing::info!(target: "scry.cli", %address, "attached");
            let session = Session::new(Arc::new(client), classes, config.session.clone(), observer);
            drive(session, events, &sources, &args).await?
        }
    };

    tracing::info!(target: "scry.cli", ?reason, "session finished");
    Ok(())
}

fn load_config(cli_path: Option<PathBuf>) -> ScryConfig {
    let path = cli_path.or_else(|| std::env::var_os("SCRY_CONFIG").map(PathBuf::from));
    let Some(path) = path else {
        return ScryConfig::default();
    };

    match ScryConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "scry: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            ScryConfig::default()
        }
    }
}

fn apply_session_args(config: &mut ScryConfig, args: &SessionArgs) {
    for (class, line) in &args.breakpoints {
        let entry = class_entry(config, class);
        if !entry.breakpoints.contains(line) {
            entry.breakpoints.push(*line);
        }
    }
    for class in &args.watch {
        class_entry(config, class);
    }
}

fn class_entry<'c>(config: &'c mut ScryConfig, name: &str) -> &'c mut ClassConfig {
    let index = match config.classes.iter().position(|class| class.name == name) {
        Some(index) => index,
        None => {
            config.classes.push(ClassConfig {
                name: name.to_string(),
                breakpoints: Vec::new(),
                cached: true,
            });
            config.classes.len() - 1
        }
    };
    &mut config.classes[index]
}

/// `demo.Outer$Inner` lives in `demo/Outer.java`.
fn source_path(roots: &[PathBuf], class: &str) -> Option<PathBuf> {
    let outer = class.split('$').next().unwrap_or(class);
    let relative = PathBuf::from(format!("{}.java", outer.replace('.', "/")));
    roots
        .iter()
        .map(|root| root.join(&relative))
        .find(|path| path.is_file())
}

fn register_classes(
    config: &ScryConfig,
    roots: &[PathBuf],
) -> (ClassRegistry, HashMap<String, Arc<SourceClass>>) {
    let classes = ClassRegistry::new();
    let mut sources = HashMap::new();
    for class in &config.classes {
        let roots = roots.to_vec();
        let name = class.name.clone();
        let provider = move || -> Result<String, BoxError> {
            let path = source_path(&roots, &name)
                .ok_or_else(|| format!("no source file for {name}"))?;
            Ok(std::fs::read_to_string(path)?)
        };
        let source = classes.register(SourceClass::from_config(class, provider));
        sources.insert(class.name.clone(), source);
    }
    (classes, sources)
}

async fn drive(
    session: Session<JdwpClient>,
    mut events: UnboundedReceiver<SessionEvent>,
    sources: &HashMap<String, Arc<SourceClass>>,
    args: &SessionArgs,
) -> Result<TerminationReason> {
    let handle = session.handle();
    let task = session.spawn();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, sources, args.json)?;
                match event {
                    SessionEvent::Suspended { .. } if args.auto_continue => handle.resume(),
                    SessionEvent::Terminated { .. } => break,
                    _ => {}
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match commands::parse(&line) {
                    Ok(Some(command)) => execute(&handle, command).await,
                    Ok(None) => {}
                    Err(err) => eprintln!("{err}"),
                },
                Ok(None) => {
                    stdin_open = false;
                    tracing::debug!(target: "scry.cli", "stdin closed");
                    if !args.auto_continue {
                        handle.shutdown();
                    }
                }
                Err(err) => {
                    stdin_open = false;
                    tracing::warn!(target: "scry.cli", error = %err, "failed to read stdin");
                }
            },
        }
    }

    task.await.context("session task failed")
}

async fn execute(handle: &SessionHandle<JdwpClient>, command: Command) {
    let needs_suspension = matches!(
        command,
        Command::Continue | Command::StepOver | Command::StepInto | Command::StepOut
    );
    if needs_suspension && handle.suspended_thread().is_none() {
        eprintln!("the target is running");
        return;
    }

    match command {
        Command::Continue => handle.resume(),
        Command::StepOver => handle.step_over(),
        Command::StepInto => handle.step_into(),
        Command::StepOut => handle.step_out(),
        Command::Toggle { class, line } => match handle.toggle_breakpoint(&class, line).await {
            Ok(bp) => println!(
                "breakpoint {}:{} {}",
                bp.class,
                bp.line,
                if bp.enabled { "enabled" } else { "disabled" }
            ),
            Err(err) => eprintln!("{err}"),
        },
        Command::List => {
            let breakpoints = handle.breakpoints().await;
            if breakpoints.is_empty() {
                println!("no breakpoints");
            }
            for bp in breakpoints {
                let state = match (bp.enabled, bp.installed) {
                    (false, _) => "disabled",
                    (true, true) => "installed",
                    (true, false) => "pending",
                };
                println!("  {}:{} {state}", bp.class, bp.line);
            }
        }
        Command::Help => println!("{}", commands::HELP),
        Command::Quit => handle.shutdown(),
    }
}

fn print_event(
    event: &SessionEvent,
    sources: &HashMap<String, Arc<SourceClass>>,
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        SessionEvent::Suspended {
            suspension,
            snapshot,
        } => {
            let reason = match suspension.reason {
                SuspendReason::Breakpoint => "breakpoint",
                SuspendReason::Step => "step",
            };
            println!("suspended at {} ({reason})", suspension.location);
            if let Some(text) = source_line(sources, &suspension.location) {
                println!("{:>6} | {text}", suspension.location.line);
            }
            for (name, value) in snapshot {
                println!("    {name} = {value}");
            }
        }
        SessionEvent::ResumeCompleted => {}
        SessionEvent::Exception(report) => {
            let at = report
                .location
                .as_ref()
                .map(|location| format!(" at {location}"))
                .unwrap_or_default();
            let kind = if report.caught { "caught" } else { "uncaught" };
            println!("{kind} exception{at}: {}", report.value);
        }
        SessionEvent::Terminated { stdout, stderr } => {
            print!("{stdout}");
            eprint!("{stderr}");
            println!("session terminated");
        }
    }
    Ok(())
}

fn source_line(
    sources: &HashMap<String, Arc<SourceClass>>,
    location: &SourceLocation,
) -> Option<String> {
    let source = sources.get(&location.class)?;
    let text = match source.contents() {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!(target: "scry.cli", error = %err, "source unavailable");
            return None;
        }
    };
    let index = usize::try_from(location.line).ok()?.checked_sub(1)?;
    text.lines().nth(index).map(|line| line.trim_end().to_string())
}
