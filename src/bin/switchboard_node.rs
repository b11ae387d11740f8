//! switchboard-node: cluster host.
//!
//! Started without `SWITCHBOARD_CORE_TAG` this process is the master and
//! re-executes itself once per core. Each worker attaches its own core:
//!
//! - `math` serves `/math/square` and runs a thread serving `/math/cube`
//! - `caller` runs a thread that periodically asks `math` for results
//!
//! The default in-memory bus only connects units inside one process; set
//! `messaging.type` to `redis` or `nats` for cores to reach each other.
//!
//! Configuration is read from `config.yaml`, `--config <path>` or
//! `SWITCHBOARD_CONFIG`, with `SWITCHBOARD__*` environment overrides.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use switchboard::config::Config;
use switchboard::supervisor::{
    Cluster, CoreDefinition, Role, SupervisorError, SupervisorHooks, ThreadContext,
    ThreadDefinition, UnitExit,
};
use switchboard::utils::bootstrap::{init_context, init_tracing, parse_config_path};
use switchboard::{Done, Envelope, Route};
use tracing::{error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Logs every supervision event.
struct LoggingHooks;

impl SupervisorHooks for LoggingHooks {
    fn on_ready(&self, tag: &str) {
        info!(tag = %tag, "Unit ready");
    }

    fn on_close(&self, tag: &str, exit: &UnitExit) {
        if exit.success() {
            info!(tag = %tag, exit = ?exit, "Unit closed");
        } else {
            warn!(tag = %tag, exit = ?exit, "Unit closed abnormally");
        }
    }

    fn on_error(&self, tag: &str, error: &SupervisorError) {
        error!(tag = %tag, error = %error, "Unit failed");
    }
}

#[derive(Deserialize)]
struct NumberRequest {
    n: i64,
}

fn power_route(path: &str, exponent: u32) -> Result<Route, switchboard::RegistrationError> {
    Route::from_fn(path, move |envelope: Envelope, done: Option<Done>| async move {
        let Some(done) = done else {
            return;
        };
        let reply = match envelope.payload_as::<NumberRequest>() {
            Ok(req) => match req.n.checked_pow(exponent) {
                Some(result) => json!({ "result": result }),
                None => json!({ "error": "overflow" }),
            },
            Err(e) => json!({ "error": e.to_string() }),
        };
        if let Err(e) = done.send(&reply).await {
            warn!(error = %e, "Failed to reply");
        }
    })
}

async fn caller_main(mut ctx: ThreadContext) {
    let service = ctx.service().clone();
    let mut n: i64 = 1;

    loop {
        let payload = json!({ "n": n });
        for path in ["/math/square", "/math/cube"] {
            let envelope = match Envelope::from_payload(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(error = %e, "Failed to build request");
                    return;
                }
            };
            match service.request(path, envelope, Some(REQUEST_TIMEOUT)).await {
                Ok(params) => info!(path = %path, n = n, reply = ?params, "Reply received"),
                Err(e) => warn!(path = %path, n = n, error = %e, "Request failed"),
            }
        }
        n += 1;

        tokio::select! {
            _ = ctx.stopped() => return,
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }
    }
}

fn build_cluster(
    config: &Config,
    context: switchboard::supervisor::SupervisorContext,
) -> Result<Cluster, switchboard::RegistrationError> {
    let hooks: Arc<dyn SupervisorHooks> = Arc::new(LoggingHooks);

    let math = CoreDefinition::new("math")
        .route(power_route("/math/square", 2)?)
        .value("started_by", json!("switchboard-node"))
        .thread(ThreadDefinition::new("math-cube").route(power_route("/math/cube", 3)?))
        .hooks(hooks.clone());

    let caller = CoreDefinition::new("caller")
        .thread(ThreadDefinition::new("caller-loop").main(caller_main))
        .hooks(hooks.clone());

    Ok(Cluster::builder(context)
        .tag_name("switchboard-node")
        .core(math)
        .core(caller)
        .hooks(hooks)
        .supervisor_config(config.supervisor.clone())
        .build())
}

async fn wait_for_termination() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let role = Role::detect();
    info!(role = ?role, "Starting switchboard-node");

    let context = init_context(&config).await?;
    let cluster = build_cluster(&config, context)?;
    cluster.start(role).await?;

    info!("Press Ctrl+C to exit");
    wait_for_termination().await?;

    info!("Shutting down...");
    cluster.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
