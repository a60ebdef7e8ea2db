#![deny(warnings, rust_2018_idioms)]

use netra_app::{App, Config};
use netra_proxy_transport::GetOrigDstAddr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EX_USAGE: i32 = 64;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let service_name = match parse_service_name() {
        Some(name) => name,
        None => {
            eprintln!("usage: netra-proxy --service-name=<name>");
            std::process::exit(EX_USAGE);
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "Invalid configuration");
            std::process::exit(EX_USAGE);
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(error) => {
            error!(%error, "Failed to build runtime");
            std::process::exit(1);
        }
    };

    rt.block_on(async move {
        // The exporter library consumes JAEGER_* from the environment on
        // its own; we only name the service.
        let provider = netra_trace::init(&service_name);
        info!(%service_name, "Starting");

        let app = match App::bind(config, &provider, GetOrigDstAddr::default()).await {
            Ok(app) => app,
            Err(error) => {
                error!(%error, "Failed to start");
                std::process::exit(1);
            }
        };
        if let Err(error) = app.run().await {
            error!(%error, "Proxy terminated");
            std::process::exit(1);
        }
    });
}

/// The one required flag: `--service-name=<name>` or `--service-name <name>`.
fn parse_service_name() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--service-name=") {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        } else if arg == "--service-name" {
            return args.next().filter(|v| !v.is_empty());
        }
    }
    None
}
