use std::io::Write;
use std::process::ExitCode;

use proxy_client::{FileConfig, ProxyClient, SendAction};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(path) = std::env::args().nth(1) else {
        error!("usage: proxy-send <config.json>");
        return ExitCode::from(2);
    };

    let config = match FileConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "could not load configuration");
            return ExitCode::from(2);
        }
    };

    let client = match ProxyClient::new(config.client) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "invalid proxy configuration");
            return ExitCode::from(2);
        }
    };
    client.dump_config();

    let mut action: SendAction<()> = SendAction::from_config(&client, config.request);
    action
        .on_success(|| info!("request delivered"))
        .on_error(|message| error!(%message, "request not delivered"));

    let outcome = action.execute(()).await;
    client.log_stats();

    match outcome {
        Ok(response) => {
            info!(status = response.status(), "{}", response.status_line());
            let mut stdout = std::io::stdout().lock();
            if stdout.write_all(response.body()).and_then(|_| stdout.flush()).is_err() {
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
