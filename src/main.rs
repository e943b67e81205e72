use postgresql_ssh_mcp::config::Config;
use postgresql_ssh_mcp::obfuscate::obfuscate;
use postgresql_ssh_mcp::transport;

#[tokio::main]
async fn main() {
    // All diagnostics go to stderr; stdout is reserved for the protocol.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let transport_name = std::env::args().nth(1).unwrap_or_else(|| "stdio".to_string());
    let result = match transport_name.as_str() {
        "http" => transport::http::run(config).await,
        "stdio" => transport::stdio::run(config).await,
        other => {
            log::error!("unknown transport '{other}'; expected 'stdio' or 'http'");
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        log::error!("fatal: {}", obfuscate(&format!("{e:#}")));
        std::process::exit(1);
    }
}
