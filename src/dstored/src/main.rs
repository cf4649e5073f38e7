use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use structopt::StructOpt;

use dstore_dpu::agent::Agent;
use dstore_dpu::cache::{default_hashers, CacheTable};
use dstore_dpu::config::{Config, NotifyMode};
use dstore_dpu::engine::EngineOptions;
use dstore_dpu::memfs::MemoryFileService;
use dstore_rdma::cm::ConnectionManager;

static FORCE_QUIT: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "dstored", about = "DPU storage engine daemon")]
struct Opts {
    /// Config path
    #[structopt(short, long, default_value = "dstored.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let opts = Opts::from_args();
    let config = Config::from_path(&opts.config)
        .with_context(|| format!("failed to load {}", opts.config.display()))?;

    // log filter comes from DSTORE_LOG, with the config as the default
    init_env_log(&config.default_log_level);

    install_signal_handlers()?;

    let cache = Arc::new(CacheTable::new(
        config.cache.bucket_count_power,
        default_hashers(),
    ));
    if let Some(path) = &config.cache.preload {
        let loaded = cache
            .preload(path)
            .with_context(|| format!("failed to preload {}", path.display()))?;
        info!("preloaded {} cache items", loaded);
    }

    let fs = Arc::new(MemoryFileService::start(config.fs_capacity, cache));

    let listen: SocketAddr = format!("{}:{}", config.listen_ip, config.listen_port)
        .parse()
        .context("invalid listen address")?;
    if let Some(device) = &config.device {
        info!("serving over {} at {}", device, listen);
    }
    let mut cm = ConnectionManager::listen(listen, config.max_clients, config.max_buffs)?;

    let engine_opts = EngineOptions {
        batching: config.batching,
        notify_imm: config.notify == NotifyMode::Interrupt,
    };
    let force_quit = Arc::new(AtomicBool::new(false));
    let mut agent = Agent::new(
        config.max_clients,
        config.max_buffs,
        engine_opts,
        fs,
        force_quit.clone(),
    );
    if let Some(weight) = config.data_plane_weight {
        agent.set_data_plane_weight(weight);
    }

    if let Some(core) = config.agent_core {
        pin_to_core(core)?;
        info!("agent pinned to core {}", core);
    }

    while !FORCE_QUIT.load(Ordering::Relaxed) && !force_quit.load(Ordering::Relaxed) {
        agent.tick(&mut cm)?;
    }
    info!("shutting down");
    Ok(())
}

fn init_env_log(default_level: &str) {
    use std::io::Write;

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::new().filter_or("DSTORE_LOG", default_level),
    );
    builder.format(|out, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ");
        let style = out.default_level_style(record.level());
        writeln!(
            out,
            "{} {:>5} {}:{} {}",
            ts,
            style.value(record.level()),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    builder.init();
}

extern "C" fn handle_signal(_signum: i32) {
    FORCE_QUIT.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(handle_signal))?;
        signal(Signal::SIGTERM, SigHandler::Handler(handle_signal))?;
    }
    Ok(())
}

fn pin_to_core(core: usize) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(core).context("core id out of range")?;
    sched_setaffinity(Pid::from_raw(0), &set).context("sched_setaffinity failed")?;
    Ok(())
}
