use mio::Poll;
use server_proxy::config::{AppConfig, FromYaml, display_config};
use server_proxy::error::Result;
use server_proxy::server::Server;

fn main() -> Result<()> {
    let content = std::fs::read_to_string("config.yaml")?;
    let config = AppConfig::from_str(&content)?;

    display_config(&config.servers);

    let poll = Poll::new()?;
    let server = Server::new(config, &poll)?;
    server.run(poll)
}
