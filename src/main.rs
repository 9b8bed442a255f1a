use std::path::PathBuf;
use std::process::ExitCode;
use synapse_node::config::Config;
use synapse_node::constants;
use synapse_node::crypto::NodeIdentity;
use synapse_node::{api, Node};

struct Args {
    cmd: String,
    target: Option<PathBuf>,
    config: PathBuf,
}

fn parse_args() -> Result<Args, String> {
    let mut cmd = None;
    let mut target = None;
    let mut config = Config::default_path();

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = it.next().map(PathBuf::from).ok_or("--config needs a path")?;
            }
            _ if cmd.is_none() => cmd = Some(arg),
            _ if target.is_none() => target = Some(PathBuf::from(arg)),
            other => return Err(format!("unexpected argument: {}", other)),
        }
    }

    Ok(Args {
        cmd: cmd.unwrap_or_else(|| "run".to_string()),
        target,
        config,
    })
}

fn print_help() {
    println!("Synapse Node — commands:");
    println!("  run                 start the node (default)");
    println!("  keygen <path>       write a new PKCS#8 identity key");
    println!("  init-config <path>  write the default config");
    println!("  version             print version info");
    println!();
    println!("  --config <path>     config file (default ~/.synapse/config.json)");
}

fn init_logging(level: &str) {
    // RUST_LOG wins over the config level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

async fn run(config_path: PathBuf) -> Result<(), String> {
    let mut config = Config::load(&config_path).map_err(|e| e.to_string())?;
    config.apply_env_overrides().map_err(|e| e.to_string())?;
    init_logging(&config.logging.level);
    constants::print_banner();

    log::info!("📄 Config: {}", config_path.display());
    let api_port = config.api.port;
    let api_host = config.api.host.clone();

    let node = Node::new(config).map_err(|e| e.to_string())?;
    node.start().await.map_err(|e| e.to_string())?;

    if let Some(port) = api_port {
        let net = node.network().clone();
        let addr = format!("{}:{}", api_host, port);
        tokio::spawn(async move {
            if let Err(e) = api::serve(net, &addr).await {
                log::error!("❌ Status API on {} failed: {}", addr, e);
            }
        });
    }

    println!("{}", node.network_status());

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                log::error!("❌ Signal handler failed: {}", e);
            }
            log::info!("🛑 Ctrl-C received, shutting down");
        }
        _ = node.wait() => {}
    }

    node.stop().await.map_err(|e| e.to_string())?;
    println!("{}", node.network_status());
    Ok(())
}

fn keygen(path: PathBuf) -> Result<(), String> {
    if path.exists() {
        return Err(format!("{} already exists", path.display()));
    }
    let identity = NodeIdentity::load_or_generate(&path).map_err(|e| e.to_string())?;
    println!("🔑 Wrote {} ({} bits)", path.display(), identity.key_bits());
    println!("   fingerprint {}", identity.fingerprint());
    Ok(())
}

fn init_config(path: PathBuf) -> Result<(), String> {
    if path.exists() {
        return Err(format!("{} already exists", path.display()));
    }
    Config::default().save(&path).map_err(|e| e.to_string())?;
    println!("📄 Wrote default config to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            print_help();
            return ExitCode::FAILURE;
        }
    };

    let result = match (args.cmd.as_str(), args.target) {
        ("run", _) => run(args.config).await,
        ("keygen", Some(path)) => keygen(path),
        ("init-config", Some(path)) => init_config(path),
        ("version", _) => {
            println!(
                "{} v{} (protocol {})",
                constants::NETWORK_NAME,
                constants::VERSION,
                constants::PROTOCOL_VERSION
            );
            Ok(())
        }
        _ => {
            print_help();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}
