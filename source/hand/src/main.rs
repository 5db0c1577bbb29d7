use std::{fs::OpenOptions, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use embassy_sync::channel::Channel;
use han_comms::{controller::BusSettings, Controller};
use han_daemon::{
    config::{Config, DEFAULT_CONFIG_PATH},
    helper::Helper,
    listen::Listeners,
    pidfile::PidFile,
    serial::TtyBus,
    server::{BusMutex, Control, ControlChannel, Exit, Server},
};
use tokio::signal::unix::{signal, SignalKind};

/// Everything the bus has taught us, kept across reloads
static CONTROLLER: Controller<BusMutex> = Controller::new(BusSettings::DEFAULT);

static CONTROL: ControlChannel = Channel::new();

/// HAN bus daemon
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config_file: PathBuf,

    /// Debug level, 0 to 3
    #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    debug: u8,

    /// Log file, overriding the configured one
    #[arg(short, long)]
    log_file: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(short = 'n', long)]
    no_background: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = Config::load(&args.config_file)?;
    init_logging(&args, &cfg)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start the runtime")?;
    rt.block_on(run(&args, cfg))
}

fn init_logging(args: &Args, cfg: &Config) -> anyhow::Result<()> {
    let level = match args.debug {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();

    let log_path = args.log_file.as_ref().or(cfg.log_path.as_ref());
    if let (false, Some(path)) = (args.no_background, log_path) {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

async fn run(args: &Args, mut cfg: Config) -> anyhow::Result<()> {
    tokio::spawn(watch_signals()?);

    let mut first = true;
    loop {
        CONTROLLER.configure(cfg.bus_settings()).await;
        let mut bus = TtyBus::open(&cfg.tty, cfg.baud)?;
        if first {
            if let Err(e) = CONTROLLER.enumerate(&mut bus).await {
                log::warn!("Enumeration broadcast failed: {:?}", e);
            }
            first = false;
        }

        let listeners = Listeners::bind(&cfg).await?;
        let pid = match &cfg.pid_file {
            Some(path) => Some(PidFile::create(path)?),
            None => None,
        };
        if let Some(pid) = &pid {
            log::debug!("Wrote pid file {}", pid.path().display());
        }
        let helper = Helper {
            path: cfg.ppower_path.clone(),
            timeout: cfg.helper_timeout(),
        };

        let Listeners { conns, socket_file } = listeners;
        let mut server = Server::new(&CONTROLLER, bus, conns, CONTROL.receiver(), helper);
        log::info!("hand {} running", env!("CARGO_PKG_VERSION"));
        let exit = server.run().await;

        // Everything from this round goes before the next one is built
        drop(server);
        drop(socket_file);
        drop(pid);

        match exit {
            Exit::Shutdown => {
                log::info!("Shutting down");
                return Ok(());
            }
            Exit::Reload => {
                log::info!("Reloading {}", args.config_file.display());
                cfg = Config::load(&args.config_file)?;
            }
        }
    }
}

/// Turn signals into [Control] requests
fn watch_signals() -> anyhow::Result<impl std::future::Future<Output = ()>> {
    let sig = |kind| signal(kind).context("cannot install a signal handler");
    let mut hup = sig(SignalKind::hangup())?;
    let mut term = sig(SignalKind::terminate())?;
    let mut int = sig(SignalKind::interrupt())?;
    let mut quit = sig(SignalKind::quit())?;

    Ok(async move {
        loop {
            let ctl = tokio::select! {
                _ = hup.recv() => Control::Reload,
                _ = term.recv() => Control::Shutdown,
                _ = int.recv() => Control::Shutdown,
                _ = quit.recv() => Control::Shutdown,
            };
            CONTROL.send(ctl).await;
        }
    })
}
