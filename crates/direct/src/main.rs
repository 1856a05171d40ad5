mod cli;
mod config;
mod peer;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use cli::{Args, Parsed, Target};
use direct_session::{
    Callee, Caller, EndpointOptions, LoggingEngine, NegotiationEngine, ThreadRuntime,
};
use peer::{PeerConfig, WebRtcEngine};
use tracing::{debug, error, info};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Process default for any rustls config built without an explicit provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let args = match cli::parse_args() {
        Ok(Parsed::Run(args)) => args,
        Ok(Parsed::Help) => {
            cli::print_usage();
            return ExitCode::SUCCESS;
        }
        Ok(Parsed::Version) => {
            println!("direct {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("{e:#}");
            cli::print_usage();
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(()) => {
            info!("Shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    info!("Starting direct: {}", args.summary());

    let mut config = config::load_config(&args.config_path)?;
    if args.self_test {
        config.session.counting_exchange = true;
    }
    if !config::report_issues(&config) {
        anyhow::bail!("Invalid configuration in {}", args.config_path.display());
    }

    let runtime = ThreadRuntime::new().context("Failed to create thread runtime")?;
    runtime
        .initialize()
        .context("Failed to initialize thread runtime")?;

    let engine: Arc<dyn NegotiationEngine> = if config.session.counting_exchange {
        info!("Counting exchange enabled, media negotiation is logged only");
        LoggingEngine::new()
    } else {
        WebRtcEngine::start(
            runtime.signaling(),
            PeerConfig {
                stun_urls: config.ice.stun_urls.clone(),
                encryption: args.encryption,
            },
        )
        .context("Failed to start negotiation engine")?
    };
    let options = EndpointOptions::from(&config);

    match args.target {
        Target::Listen(port) => {
            let callee = Callee::new(Arc::clone(&runtime), engine, options);
            let local = callee
                .start_listening(port)
                .with_context(|| format!("Failed to start listening on port {port}"))?;
            info!(%local, "Waiting for a caller");

            let quit = Arc::clone(&runtime);
            on_interrupt(&runtime, move || {
                quit.quit();
            });
            runtime.run()?;
        }
        Target::Dial(target) => {
            let caller = Arc::new(Caller::new(Arc::clone(&runtime), engine, options));
            caller
                .connect(target.clone())
                .with_context(|| format!("Failed to connect to {target}"))?;

            let hang = Arc::clone(&caller);
            on_interrupt(&runtime, move || {
                // Without a live transport nobody will answer OK
                if hang.hang_up().is_err() {
                    hang.runtime().quit();
                }
            });
            runtime.run()?;
        }
    }
    Ok(())
}

/// Run `action` once on the first Ctrl-C.
fn on_interrupt(runtime: &ThreadRuntime, action: impl FnOnce() + Send + 'static) {
    let spawned = runtime.network().spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, shutting down");
                action();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
        }
    });
    if !spawned {
        error!("Network thread not running, Ctrl-C will not hang up");
    }
}
