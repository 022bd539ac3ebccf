mod cli;

use anyhow::{Context, Result};
use audioworker_lib::audio::open_device;
use audioworker_lib::config::AppConfig;
use audioworker_lib::controller::{self, Controller, ControllerEnv, StateChange, Subscription};
use audioworker_lib::function::{Ack, AckListener, SharedListener, WorkerFunction};
use audioworker_lib::paths::AppPaths;
use audioworker_lib::transport::{TcpTransport, WorkerNode};
use clap::Parser;
use cli::{Cli, Command};
use std::sync::Arc;
use std::time::Duration;

/// Prints every Ack and event as one JSON line
struct PrintListener;

impl AckListener for PrintListener {
    fn on_ack(&self, ack: Ack) {
        println!("{}", ack.to_wire());
    }

    fn on_event(&self, event: WorkerFunction) {
        println!("{}", event.to_wire());
    }
}

fn parse_function(text: &str, env: &ControllerEnv) -> Result<WorkerFunction> {
    let mut function = WorkerFunction::from_wire(text).context("Invalid function JSON")?;
    if function.command_id().is_none() {
        function.set_command_id(Some(env.ids.next_id()));
    }
    Ok(function)
}

fn start_tree(config: &AppConfig, paths: &AppPaths) -> Result<(ControllerEnv, Arc<dyn Controller>)> {
    let device = open_device(&config.audio)?;
    let env = ControllerEnv::new(device, config.engine.clone(), paths.data.clone());

    log::info!("Starting controllers...");
    let root: Arc<dyn Controller> = controller::build_tree(&env)?;
    root.activate()?;
    log::info!("✓ Controllers started");
    Ok((env, root))
}

fn stop_tree(root: &Arc<dyn Controller>) {
    log::info!("Stopping controllers...");
    root.destroy();
    log::info!("✓ Controllers stopped");
}

/// Log running-task changes of every leaf
fn watch_state(root: &Arc<dyn Controller>) -> Vec<Subscription> {
    controller::LEAVES
        .iter()
        .filter_map(|name| root.find(name))
        .map(|leaf| {
            leaf.subscribe(Arc::new(|change: &StateChange| {
                log::info!("{} running: {:?}", change.controller, change.running);
            }))
        })
        .collect()
}

async fn serve(config: &AppConfig, paths: &AppPaths, port: Option<u16>) -> Result<()> {
    let (env, root) = start_tree(config, paths)?;
    let _subscriptions = watch_state(&root);

    let node = WorkerNode::new(root.clone(), env.ids.clone());
    let transport = TcpTransport::new(&config.peer_name(), node.clone());
    node.attach(transport.clone());

    let port = port.unwrap_or(config.transport.listen_port);
    transport.listen(&format!("0.0.0.0:{}", port)).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    log::info!("Shutdown requested");

    stop_tree(&root);
    node.detach();
    Ok(())
}

async fn exec(config: &AppConfig, paths: &AppPaths, text: &str, wait: Duration) -> Result<()> {
    let (env, root) = start_tree(config, paths)?;
    let function = parse_function(text, &env)?;
    log::debug!("Executing {}", function);

    root.execute(function, Arc::new(PrintListener));
    tokio::time::sleep(wait).await;

    stop_tree(&root);
    Ok(())
}

async fn send(config: &AppConfig, paths: &AppPaths, addr: &str, text: &str, wait: Duration) -> Result<()> {
    let (env, root) = start_tree(config, paths)?;
    let function = parse_function(text, &env)?;

    let node = WorkerNode::new(root.clone(), env.ids.clone());
    let transport = TcpTransport::new(&config.peer_name(), node.clone());
    node.attach(transport.clone());

    let peer = transport.connect(addr).await?;
    let listener: SharedListener = Arc::new(PrintListener);
    let id = node.submit(&peer, function, listener)?;
    tokio::time::sleep(wait).await;

    match node.forget(&id) {
        Some(open) => log::info!("{} still open on {} after {} ack(s)", id, peer, open.acks().len()),
        None => log::info!("{} answered by {}", id, peer),
    }

    stop_tree(&root);
    node.detach();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    log::info!("AudioWorker starting...");

    let paths = match &cli.home {
        Some(root) => AppPaths::under(root),
        None => AppPaths::new()?,
    };
    paths.ensure_directories(&controller::LEAVES)?;
    let config = AppConfig::load_or_create(&paths.config_file())?;
    log::info!("Configuration loaded");

    match cli.command {
        Command::Serve { port } => serve(&config, &paths, port).await,
        Command::Exec { function, wait_ms } => {
            exec(&config, &paths, &function, Duration::from_millis(wait_ms)).await
        }
        Command::Send {
            addr,
            function,
            wait_ms,
        } => send(&config, &paths, &addr, &function, Duration::from_millis(wait_ms)).await,
    }
}
