//! ICP driver: owns the display device and serves bridge commands over the
//! local pipe until a client sends `close`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use icp_bridge::config::PIPE_NAME_ENV;
use icp_bridge::{
    exit_codes, CommandDispatcher, DriverServer, IcpConfig, ListenError, PipeAddress,
    PipeListener, VirtualDevice,
};

#[derive(Parser, Debug)]
#[command(name = "icp-driver")]
#[command(about = "Drives the ICP display on behalf of the cockpit panel host")]
struct Args {
    /// Do not mirror frames to the terminal
    #[arg(long)]
    headless: bool,

    /// Log at debug level
    #[arg(long)]
    verbose: bool,

    /// Pipe name, or a socket path on Unix
    #[arg(long, env = PIPE_NAME_ENV)]
    pipe: Option<String>,

    /// Configuration file (defaults to the per-user icp.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args).await {
        Ok(()) => {
            log::info!("ICP driver exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e:#}");
            let code = match e.downcast_ref::<ListenError>() {
                Some(ListenError::AddressInUse(_)) => exit_codes::ADDRESS_IN_USE,
                _ => exit_codes::TRANSPORT_FAILURE,
            };
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => IcpConfig::load_from(path),
        None => IcpConfig::load(),
    };
    let pipe = args.pipe.unwrap_or(config.bridge.pipe_name);
    let listener = PipeListener::bind(&PipeAddress::from_name(&pipe))?;
    log::info!(
        "ICP driver (pid {}) serving {}{}",
        std::process::id(),
        listener.address(),
        if args.headless { " headless" } else { "" }
    );

    let device = Arc::new(VirtualDevice::new());
    let dispatcher = CommandDispatcher::new(device.clone(), &config.driver);
    if !args.headless {
        let device = Arc::clone(&device);
        dispatcher.frame_subscribers().subscribe(move |_| {
            println!("{}", device.snapshot().to_panel());
        });
    }

    let server = DriverServer::new(listener, dispatcher);
    let stop = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupted, shutting down");
            stop.cancel();
        }
    });

    server.run().await;
    Ok(())
}
